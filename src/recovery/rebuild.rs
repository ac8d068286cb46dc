#![forbid(unsafe_code)]

//! Full reconstruction of reference counts from the block map, used when
//! journal replay is impossible (read-only latch or forced rebuild).
//!
//! The depot must already be loaded with `LoadType::LoadForRebuild`,
//! which zeroed every slab journal and reset every counter. Traversal is
//! best-effort: corrupt or out-of-range entries are unmapped and skipped
//! rather than failing the rebuild.

use tracing::{info, warn};

use crate::admin::DrainType;
use crate::blockmap::{BlockMap, BlockMapEntry, ENTRIES_PER_PAGE};
use crate::depot::SlabDepot;
use crate::types::{BlockCount, BlockOperation, Pbn, Result};

/// What the rebuild reconstructed.
#[derive(Clone, Copy, Debug, Default)]
pub struct RebuildOutcome {
    /// Logical blocks found mapped.
    pub logical_blocks_used: BlockCount,
    /// Leaf pages found linked from the roots.
    pub block_map_data_blocks: BlockCount,
    /// Entries dropped as corrupt or out of range.
    pub unmapped_entries: u64,
}

/// Walks the block map tree, re-incrementing reference counts for every
/// interior-referenced leaf page and every valid leaf mapping.
pub fn rebuild(depot: &mut SlabDepot, block_map: &mut BlockMap) -> Result<RebuildOutcome> {
    let mut outcome = RebuildOutcome::default();
    let leaves = block_map.mapped_leaves()?;

    for (root_index, root_slot, leaf_pbn) in leaves {
        let root_pbn = Pbn(block_map.root_origin().0 + root_index);

        // A linked leaf that was never written (or is unreadable as a
        // page) gets unlinked rather than trusted.
        if depot.slab_for_pbn(leaf_pbn).is_err() || !block_map.has_page(leaf_pbn)? {
            warn!(%leaf_pbn, "unlinking unusable block map leaf");
            block_map.set_entry_at(root_pbn, root_slot, BlockMapEntry::UNMAPPED, root_index)?;
            outcome.unmapped_entries += 1;
            continue;
        }

        // The leaf page itself holds a reference.
        depot.apply_rebuild_change(leaf_pbn, BlockOperation::BlockMapIncrement)?;
        outcome.block_map_data_blocks += 1;

        for slot in 0..ENTRIES_PER_PAGE {
            let entry = block_map.entry_at(leaf_pbn, slot)?;
            if !entry.is_mapped() {
                continue;
            }
            if entry.pbn.is_zero() {
                // Mapped to the zero block: logical space, no reference.
                outcome.logical_blocks_used += 1;
                continue;
            }
            let usable = depot
                .slab_for_pbn(entry.pbn)
                .and_then(|n| depot.slabs[n].sbn_for(entry.pbn))
                .is_ok();
            if !usable {
                block_map.set_entry_at(leaf_pbn, slot, BlockMapEntry::UNMAPPED, 0)?;
                outcome.unmapped_entries += 1;
                continue;
            }
            match depot.apply_rebuild_change(entry.pbn, BlockOperation::DataIncrement) {
                Ok(()) => outcome.logical_blocks_used += 1,
                Err(error) => {
                    // Best effort: a counter that cannot take another
                    // reference means the mapping is not trustworthy.
                    warn!(pbn = %entry.pbn, %error, "dropping unusable mapping");
                    block_map.set_entry_at(leaf_pbn, slot, BlockMapEntry::UNMAPPED, 0)?;
                    outcome.unmapped_entries += 1;
                }
            }
        }
    }

    block_map.flush()?;
    depot.drain(DrainType::Rebuilding)?;
    info!(
        logical = outcome.logical_blocks_used,
        leaves = outcome.block_map_data_blocks,
        dropped = outcome.unmapped_entries,
        "rebuilt reference counts from block map"
    );
    Ok(outcome)
}
