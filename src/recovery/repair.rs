#![forbid(unsafe_code)]

//! Crash recovery by journal replay.
//!
//! The driver reads the whole recovery journal region, establishes the
//! live range of blocks, replays every applied entry into the owning
//! slab's journal, synthesizes the decrements a crash cut off, and
//! rebuilds the block map from the journaled mappings. Reference counts
//! themselves are restored afterwards by scrubbing.

use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::blockmap::BlockMap;
use crate::depot::SlabDepot;
use crate::primitives::io::FileIo;
use crate::slab::SlabStatus;
use crate::types::{
    BasaltError, BlockCount, BlockOperation, JournalPoint, Pbn, RecoveryPoint, Result,
    SequenceNumber, BLOCK_SIZE,
};

use super::journal::{
    decode_block, BlockMapSlot, DecodedRecoveryBlock, JournalFilter, RecoveryJournalEntry,
    ENTRIES_PER_SECTOR,
};

/// What recovery established and did.
#[derive(Clone, Debug, Default)]
pub struct RepairOutcome {
    /// Journal entries replayed into slab journals.
    pub entries_replayed: usize,
    /// Decrements synthesized for increments whose pair was lost.
    pub missing_decrefs: usize,
    /// Highest sequence number seen anywhere in the region.
    pub highest_tail: SequenceNumber,
    /// Last sequence actually applied.
    pub tail: SequenceNumber,
    /// Maximum block-map head across valid blocks.
    pub block_map_head: SequenceNumber,
    /// Maximum slab-journal head across valid blocks.
    pub slab_journal_head: SequenceNumber,
    /// Recomputed end-of-journal logical block usage.
    pub logical_blocks_used: BlockCount,
    /// Recomputed end-of-journal block map page count.
    pub block_map_data_blocks: BlockCount,
    /// The journaled mappings, ready for the block map rebuild that runs
    /// after the super block is saved.
    pub mappings: Vec<NumberedBlockMapping>,
}

#[derive(Clone, Copy, Debug)]
struct MissingDecref {
    slot: BlockMapSlot,
    /// The pre-crash mapping to decrement, once known.
    pbn: Option<Pbn>,
}

#[derive(Clone, Copy, Debug)]
enum SlotState {
    DecrementSeen,
    Missing(usize),
    Complete,
}

/// A journaled mapping tagged with its journal order, so the block map
/// rebuild can sort by position while preserving entry order per slot.
#[derive(Clone, Copy, Debug)]
pub struct NumberedBlockMapping {
    /// Where in the block map the mapping lives.
    pub slot: BlockMapSlot,
    /// The mapping itself.
    pub mapping: crate::blockmap::BlockMapEntry,
    /// Position in journal order, for tie-breaking.
    pub ordinal: usize,
}

/// Runs recovery. The depot must already be loaded with
/// `LoadType::LoadForRecovery`. On success the slab journals hold every
/// replayed entry (committed to disk), the block map reflects the
/// journaled mappings, and the outcome carries the recomputed usages.
pub fn repair(
    io: &dyn FileIo,
    depot: &mut SlabDepot,
    block_map: &mut BlockMap,
    journal_origin: Pbn,
    journal_size: BlockCount,
    filter: JournalFilter,
) -> Result<RepairOutcome> {
    let blocks = read_journal_region(io, journal_origin, journal_size, &filter)?;
    let mut outcome = RepairOutcome::default();

    for block in blocks.iter().flatten() {
        outcome.highest_tail = outcome.highest_tail.max(block.header.sequence);
        outcome.block_map_head = outcome.block_map_head.max(block.header.block_map_head);
        outcome.slab_journal_head = outcome
            .slab_journal_head
            .max(block.header.slab_journal_head);
    }

    let applied = find_applied_blocks(&blocks, journal_size, &mut outcome);
    let entries: Vec<(RecoveryPoint, RecoveryJournalEntry)> = applied
        .iter()
        .flat_map(|block| block.entries.iter().copied())
        .collect();
    info!("Replaying {} recovery entries", entries.len());

    if let Some(tail_block) = applied.last() {
        outcome.tail = tail_block.header.sequence;
        let (logical, block_map_blocks) = compute_usages(tail_block);
        outcome.logical_blocks_used = logical;
        outcome.block_map_data_blocks = block_map_blocks;
    }

    let tail_entry_count = applied.last().map(|b| b.entries.len()).unwrap_or(0);
    let mut missing = find_missing_decrefs(&entries);
    let incomplete_decref_count = missing.iter().filter(|d| d.pbn.is_none()).count();
    debug!(
        missing = missing.len(),
        incomplete = incomplete_decref_count,
        "scanned journal for missing decrements"
    );

    // Fetch the pre-recovery mapping for each incomplete decref from the
    // block map; an unmapped slot means nothing was ever referenced.
    for decref in &mut missing {
        if decref.pbn.is_none() {
            let entry = block_map.entry_at(decref.slot.pbn, decref.slot.slot as usize)?;
            decref.pbn = entry.is_mapped().then_some(entry.pbn);
        }
    }
    missing.retain(|d| d.pbn.is_some_and(|pbn| !pbn.is_zero()));
    outcome.missing_decrefs = missing.len();
    // Every synthesized decrement releases one logical reference the
    // journal never recorded.
    outcome.logical_blocks_used = outcome
        .logical_blocks_used
        .saturating_sub(missing.len() as u64);

    // Replay the journal into the slab journals, in order. Entries a slab
    // journal committed before the crash are skipped inside the slab.
    for (point, entry) in &entries {
        let target = entry.mapping.pbn;
        if target.is_zero() {
            continue;
        }
        if replay_into_slab(io, depot, target, entry.operation, journal_point_for(point))? {
            outcome.entries_replayed += 1;
        }
    }

    // Distribute the synthesized decrements to their zones, with journal
    // points from the fake band past the tail block's real entries.
    for (index, decref) in missing.iter().enumerate() {
        let point = JournalPoint {
            sequence: outcome.tail,
            entry_count: (tail_entry_count + index) as u16,
        };
        let target = decref.pbn.expect("unresolved decrefs were dropped");
        replay_into_slab(io, depot, target, BlockOperation::DataDecrement, point)?;
    }

    // Everything replayed needs scrubbing ahead of anything else.
    for slab in &mut depot.slabs {
        if slab.status == SlabStatus::Replaying {
            slab.status = SlabStatus::RequiresHighPriorityScrubbing;
        }
    }

    // Commit the slab journals and summary.
    depot.drain(crate::admin::DrainType::Recovering)?;

    outcome.mappings = entries
        .iter()
        .enumerate()
        .filter(|(_, (_, entry))| entry.operation.is_increment())
        .map(|(ordinal, (_, entry))| NumberedBlockMapping {
            slot: entry.slot,
            mapping: entry.mapping,
            ordinal,
        })
        .collect();
    Ok(outcome)
}

fn read_journal_region(
    io: &dyn FileIo,
    origin: Pbn,
    size: BlockCount,
    filter: &JournalFilter,
) -> Result<Vec<Option<DecodedRecoveryBlock>>> {
    let mut blocks = Vec::with_capacity(size as usize);
    let mut buf = vec![0u8; BLOCK_SIZE];
    for offset in 0..size {
        io.read_at((origin.0 + offset) * BLOCK_SIZE as u64, &mut buf)?;
        blocks.push(decode_block(&buf, filter)?);
    }
    Ok(blocks)
}

/// Walks forward from the minimum head, collecting the contiguous run of
/// exact blocks; the final block of the run may be partial (torn tail).
fn find_applied_blocks(
    blocks: &[Option<DecodedRecoveryBlock>],
    journal_size: BlockCount,
    outcome: &mut RepairOutcome,
) -> Vec<DecodedRecoveryBlock> {
    let mut applied = Vec::new();
    if outcome.highest_tail == 0 {
        return applied;
    }
    let head = outcome
        .block_map_head
        .min(outcome.slab_journal_head)
        .max(1);
    for sequence in head..=outcome.highest_tail {
        let offset = ((sequence - 1) % journal_size) as usize;
        let Some(block) = blocks[offset].as_ref() else {
            break;
        };
        if block.header.sequence != sequence {
            break;
        }
        let exact = block.is_exact;
        applied.push(block.clone());
        if !exact {
            // A torn tail ends the run at its last valid sector.
            break;
        }
    }
    applied
}

/// End-of-journal usages: the tail block header's snapshot plus the
/// deltas of the tail block's applied entries.
fn compute_usages(tail_block: &DecodedRecoveryBlock) -> (BlockCount, BlockCount) {
    let mut logical = tail_block.header.logical_blocks_used;
    let mut block_map_blocks = tail_block.header.block_map_data_blocks;
    for (_, entry) in &tail_block.entries {
        match entry.operation {
            BlockOperation::DataIncrement => logical += 1,
            BlockOperation::DataDecrement => logical = logical.saturating_sub(1),
            BlockOperation::BlockMapIncrement => block_map_blocks += 1,
        }
    }
    (logical, block_map_blocks)
}

/// Scans the applied entries newest-first. A decrement seen before its
/// paired increment marks the slot; an increment with no later decrement
/// is missing one. When two increments to the same slot both lack
/// decrements, the older one's mapping is the penultimate mapping, which
/// is exactly the decref's target; only the slots whose history never
/// shows the penultimate mapping need a block map fetch.
fn find_missing_decrefs(
    entries: &[(RecoveryPoint, RecoveryJournalEntry)],
) -> Vec<MissingDecref> {
    let mut states: FxHashMap<BlockMapSlot, SlotState> = FxHashMap::default();
    let mut missing: Vec<MissingDecref> = Vec::new();

    for (_, entry) in entries.iter().rev() {
        match entry.operation {
            BlockOperation::DataDecrement => {
                states
                    .entry(entry.slot)
                    .or_insert(SlotState::DecrementSeen);
            }
            BlockOperation::DataIncrement => match states.get(&entry.slot).copied() {
                Some(SlotState::DecrementSeen) => {
                    states.insert(entry.slot, SlotState::Complete);
                }
                Some(SlotState::Missing(index)) => {
                    missing[index].pbn = Some(entry.mapping.pbn);
                    states.insert(entry.slot, SlotState::Complete);
                }
                Some(SlotState::Complete) => {}
                None => {
                    missing.push(MissingDecref {
                        slot: entry.slot,
                        pbn: None,
                    });
                    states.insert(entry.slot, SlotState::Missing(missing.len() - 1));
                }
            },
            // Block map pages are never decremented.
            BlockOperation::BlockMapIncrement => {}
        }
    }
    missing
}

/// Converts a recovery point to the journal point carried by slab journal
/// entries: the entry's ordinal within its block.
pub fn journal_point_for(point: &RecoveryPoint) -> JournalPoint {
    JournalPoint {
        sequence: point.sequence,
        entry_count: (usize::from(point.sector - 1) * ENTRIES_PER_SECTOR
            + usize::from(point.entry)) as u16,
    }
}

fn replay_into_slab(
    io: &dyn FileIo,
    depot: &mut SlabDepot,
    target: Pbn,
    operation: BlockOperation,
    point: JournalPoint,
) -> Result<bool> {
    let slab_number = depot
        .slab_for_pbn(target)
        .map_err(|_| BasaltError::BadMapping("journal entry targets a block outside the depot"))?;
    let slab = &mut depot.slabs[slab_number];
    let sbn = slab
        .sbn_for(target)
        .map_err(|_| BasaltError::BadMapping("journal entry targets slab metadata"))?;
    slab.append_replay_entry(io, sbn, operation, point)
}

/// Applies the journaled mappings to the block map, sorted by block map
/// position with ties broken by journal order so the newest mapping wins.
pub fn rebuild_block_map(
    block_map: &mut BlockMap,
    mappings: &[NumberedBlockMapping],
) -> Result<()> {
    let mut mappings = mappings.to_vec();
    mappings.sort_by_key(|m| (m.slot.pbn, m.slot.slot, m.ordinal));

    let count = mappings.len();
    for mapping in mappings {
        block_map.set_entry_at(
            mapping.slot.pbn,
            mapping.slot.slot as usize,
            mapping.mapping,
            0,
        )?;
    }
    block_map.flush()?;
    debug!(mappings = count, "rebuilt block map from journal");
    Ok(())
}
