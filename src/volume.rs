#![forbid(unsafe_code)]

//! The volume: composition of geometry, super block, layout, block map,
//! recovery journal, and slab depot.
//!
//! Opening a volume inspects the persisted state and picks the load path:
//! a clean volume loads directly, a dirty one runs journal replay, and a
//! read-only or operator-marked one runs a full rebuild from the block
//! map.

use std::sync::Arc;

use rand::{rngs::OsRng, RngCore};
use tracing::{info, warn};

use crate::admin::{DrainType, LoadType, ReadOnlyNotifier};
use crate::blockmap::{root_count_for, BlockMap, BlockMapEntry};
use crate::config::{ThreadCountConfig, VolumeConfig};
use crate::depot::SlabDepot;
use crate::layout::{FixedLayout, PartitionId};
use crate::primitives::io::FileIo;
use crate::recovery::{
    self, journal_point_for, BlockMapSlot, JournalFilter, RecoveryJournal, RecoveryJournalEntry,
};
use crate::slab::summary::summary_partition_blocks;
use crate::slab::SlabConfig;
use crate::superblock::{
    BlockMapState, GeometryBlock, SlabDepotState, SuperBlock, VolumeComponent, VolumeState,
    VolumeStateCell, CURRENT_RELEASE_VERSION, GEOMETRY_BLOCK_OFFSET, SUPER_BLOCK_OFFSET,
};
use crate::types::{
    BasaltError, BlockCount, BlockOperation, Lbn, Pbn, Result, ZoneCount, BLOCK_SIZE,
};

/// Options controlling how a volume is opened.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenOptions {
    /// Caller-supplied geometry to verify against the on-disk state.
    pub expected_config: Option<VolumeConfig>,
    /// Require an exact physical-size match (kernel mode).
    pub strict_physical: bool,
}

/// A mounted volume.
pub struct Volume {
    io: Arc<dyn FileIo>,
    geometry: GeometryBlock,
    config: VolumeConfig,
    threads: ThreadCountConfig,
    layout: FixedLayout,
    /// The slab depot.
    pub depot: SlabDepot,
    /// The block map.
    pub block_map: BlockMap,
    /// The recovery journal runtime.
    pub journal: RecoveryJournal,
    state: Arc<VolumeStateCell>,
    read_only: Arc<ReadOnlyNotifier>,
    complete_recoveries: u64,
    read_only_recoveries: u64,
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("state", &self.state.load())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn build_layout(config: &VolumeConfig, zone_count: ZoneCount) -> Result<(FixedLayout, BlockCount)> {
    let first = Pbn(SUPER_BLOCK_OFFSET + 1);
    let mut layout = FixedLayout::new(first, Pbn(config.physical_blocks))?;
    layout.add_partition(PartitionId::BlockMap, root_count_for(config.logical_blocks))?;
    layout.add_partition(PartitionId::RecoveryJournal, config.recovery_journal_size)?;
    layout.add_partition(PartitionId::SlabSummary, summary_partition_blocks(zone_count))?;
    let remaining = layout.remaining_blocks();
    let depot_blocks = remaining - remaining % config.slab_size;
    if depot_blocks < config.slab_size {
        return Err(BasaltError::BadConfiguration(
            "volume too small for one slab".into(),
        ));
    }
    layout.add_partition(PartitionId::SlabDepot, depot_blocks)?;
    Ok((layout, depot_blocks))
}

impl Volume {
    /// Formats a new volume onto `io` and leaves it in the `New` state.
    pub fn format(
        io: Arc<dyn FileIo>,
        config: VolumeConfig,
        threads: ThreadCountConfig,
    ) -> Result<()> {
        config.validate()?;
        threads.validate()?;

        // Extending the file up front makes every unwritten metadata
        // region read back as zeros.
        io.truncate(config.physical_blocks * BLOCK_SIZE as u64)?;

        let mut rng = OsRng;
        let nonce = rng.next_u64();
        let geometry = GeometryBlock {
            release_version: CURRENT_RELEASE_VERSION,
            nonce,
        };
        io.write_at(GEOMETRY_BLOCK_OFFSET * BLOCK_SIZE as u64, &geometry.encode())?;

        let zone_count = threads.physical_zones;
        let (layout, _) = build_layout(&config, zone_count)?;
        let slab_config = SlabConfig::compute(config.slab_size, config.slab_journal_blocks)?;
        let depot_partition = *layout.partition(PartitionId::SlabDepot)?;
        let depot_state = SlabDepotState {
            slab_config,
            first_block: depot_partition.offset,
            last_block: Pbn(depot_partition.offset.0 + depot_partition.count),
            zone_count,
        };

        let block_map_partition = *layout.partition(PartitionId::BlockMap)?;
        let mut block_map = BlockMap::new(
            block_map_partition.offset,
            block_map_partition.count,
            config.logical_blocks,
            nonce,
            Arc::clone(&io),
        );
        block_map.format()?;

        let summary_origin = layout.partition(PartitionId::SlabSummary)?.offset;
        let mut depot = SlabDepot::new(
            &depot_state,
            summary_origin,
            nonce,
            Arc::clone(&io),
            Arc::new(ReadOnlyNotifier::new()),
            Arc::new(VolumeStateCell::new(VolumeState::New)),
        )?;
        depot.initialize_summary()?;

        let super_block = SuperBlock {
            release_version: CURRENT_RELEASE_VERSION,
            component: VolumeComponent {
                state: VolumeState::New,
                complete_recoveries: 0,
                read_only_recoveries: 0,
                config,
                nonce,
            },
            layout,
            journal_state: crate::superblock::RecoveryJournalState {
                journal_start: 1,
                logical_blocks_used: 0,
                block_map_data_blocks: 0,
            },
            depot_state,
            block_map_state: BlockMapState {
                root_origin: block_map_partition.offset,
                root_count: block_map_partition.count,
            },
        };
        io.write_at(SUPER_BLOCK_OFFSET * BLOCK_SIZE as u64, &super_block.encode()?)?;
        io.sync_all()?;
        info!(
            physical = config.physical_blocks,
            logical = config.logical_blocks,
            "formatted volume"
        );
        Ok(())
    }

    /// Opens a volume, running recovery or rebuild if the persisted state
    /// calls for it.
    pub fn open(io: Arc<dyn FileIo>, threads: ThreadCountConfig, options: OpenOptions) -> Result<Self> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        io.read_at(GEOMETRY_BLOCK_OFFSET * BLOCK_SIZE as u64, &mut buf)?;
        let geometry = GeometryBlock::decode(&buf)?;
        io.read_at(SUPER_BLOCK_OFFSET * BLOCK_SIZE as u64, &mut buf)?;
        let super_block = SuperBlock::decode(&buf, &geometry)?;

        if let Some(expected) = options.expected_config {
            expected.check_against(&super_block.component.config, options.strict_physical)?;
        }
        if threads.physical_zones != super_block.depot_state.zone_count {
            return Err(BasaltError::ParameterMismatch(format!(
                "{} physical zones configured but the depot has {}",
                threads.physical_zones, super_block.depot_state.zone_count
            )));
        }

        let config = super_block.component.config;
        let nonce = geometry.nonce;
        let on_disk_state = super_block.component.state;
        let state = Arc::new(VolumeStateCell::new(on_disk_state));
        let read_only = Arc::new(ReadOnlyNotifier::new());

        let block_map = BlockMap::new(
            super_block.block_map_state.root_origin,
            super_block.block_map_state.root_count,
            config.logical_blocks,
            nonce,
            Arc::clone(&io),
        );
        let summary_origin = super_block.layout.partition(PartitionId::SlabSummary)?.offset;
        let depot = SlabDepot::new(
            &super_block.depot_state,
            summary_origin,
            nonce,
            Arc::clone(&io),
            Arc::clone(&read_only),
            Arc::clone(&state),
        )?;
        let journal_partition = *super_block
            .layout
            .partition(PartitionId::RecoveryJournal)?;
        let journal = RecoveryJournal::new(
            journal_partition.offset,
            journal_partition.count,
            nonce,
            super_block.component.complete_recoveries as u8,
            super_block.journal_state.journal_start,
            super_block.journal_state.logical_blocks_used,
            super_block.journal_state.block_map_data_blocks,
        );

        let mut volume = Self {
            io,
            geometry,
            config,
            threads,
            layout: super_block.layout,
            depot,
            block_map,
            journal,
            state,
            read_only,
            complete_recoveries: super_block.component.complete_recoveries,
            read_only_recoveries: super_block.component.read_only_recoveries,
        };

        if on_disk_state.requires_rebuild() {
            volume.run_rebuild()?;
        } else if on_disk_state.requires_recovery() {
            if let Err(error) = volume.run_recovery() {
                warn!(%error, "recovery failed; latching read-only");
                volume.depot.enter_read_only_mode("recovery failed");
                volume.state.store(VolumeState::ReadOnly);
                let _ = volume.save_super_block();
                return Err(error);
            }
        } else {
            volume.depot.load(LoadType::Load)?;
            volume.depot.prepare_to_allocate()?;
            volume.state.store(VolumeState::Dirty);
            volume.save_super_block()?;
        }
        Ok(volume)
    }

    fn run_recovery(&mut self) -> Result<()> {
        self.state.store(VolumeState::Replaying);
        self.depot.load(LoadType::LoadForRecovery)?;

        let journal_partition = *self.layout.partition(PartitionId::RecoveryJournal)?;
        let filter = JournalFilter {
            nonce: self.geometry.nonce,
            recovery_count: self.complete_recoveries as u8,
        };
        let outcome = recovery::repair(
            &*self.io,
            &mut self.depot,
            &mut self.block_map,
            journal_partition.offset,
            journal_partition.count,
            filter,
        )?;

        // The journal continues past everything the crash left behind. An
        // empty journal leaves the super block's usage counters standing.
        let (logical, block_map_blocks) = if outcome.tail == 0 {
            (
                self.journal.logical_blocks_used(),
                self.journal.block_map_data_blocks(),
            )
        } else {
            (outcome.logical_blocks_used, outcome.block_map_data_blocks)
        };
        let journal_start = (outcome.highest_tail + 1).max(self.journal.tail());
        self.complete_recoveries += 1;
        self.journal = RecoveryJournal::new(
            journal_partition.offset,
            journal_partition.count,
            self.geometry.nonce,
            self.complete_recoveries as u8,
            journal_start,
            logical,
            block_map_blocks,
        );

        self.state.store(VolumeState::Recovering);
        self.save_super_block()?;

        recovery::rebuild_block_map(&mut self.block_map, &outcome.mappings)?;

        self.depot.prepare_to_allocate()?;
        self.depot.scrub_all_unrecovered()?;
        // Scrubbing the last zone flipped Recovering to Dirty.
        self.save_super_block()?;
        info!(
            replayed = outcome.entries_replayed,
            missing_decrefs = outcome.missing_decrefs,
            "recovery complete"
        );
        Ok(())
    }

    fn run_rebuild(&mut self) -> Result<()> {
        self.state.store(VolumeState::Rebuilding);
        self.depot.load(LoadType::LoadForRebuild)?;
        let outcome = recovery::rebuild(&mut self.depot, &mut self.block_map)?;

        self.read_only_recoveries += 1;
        let journal_partition = *self.layout.partition(PartitionId::RecoveryJournal)?;
        self.journal = RecoveryJournal::new(
            journal_partition.offset,
            journal_partition.count,
            self.geometry.nonce,
            self.complete_recoveries as u8,
            1,
            outcome.logical_blocks_used,
            outcome.block_map_data_blocks,
        );
        self.journal
            .reset(&*self.io, self.complete_recoveries as u8, 1)?;

        self.depot.prepare_to_allocate()?;
        self.state.store(VolumeState::Dirty);
        self.save_super_block()?;
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> VolumeState {
        self.state.load()
    }

    /// The validated geometry.
    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    /// Thread counts the volume was opened with.
    pub fn thread_config(&self) -> &ThreadCountConfig {
        &self.threads
    }

    /// Successful recoveries so far.
    pub fn complete_recoveries(&self) -> u64 {
        self.complete_recoveries
    }

    /// Forced rebuilds so far.
    pub fn read_only_recoveries(&self) -> u64 {
        self.read_only_recoveries
    }

    /// True once the read-only latch is set.
    pub fn is_read_only(&self) -> bool {
        self.read_only.is_read_only()
    }

    /// Writes the super block reflecting current component state.
    pub fn save_super_block(&mut self) -> Result<()> {
        let super_block = SuperBlock {
            release_version: self.geometry.release_version,
            component: VolumeComponent {
                state: self.state.load(),
                complete_recoveries: self.complete_recoveries,
                read_only_recoveries: self.read_only_recoveries,
                config: self.config,
                nonce: self.geometry.nonce,
            },
            layout: self.layout.clone(),
            journal_state: self.journal.record_state(),
            depot_state: self.depot.record_state(),
            block_map_state: BlockMapState {
                root_origin: self.block_map.root_origin(),
                root_count: self.block_map.root_count(),
            },
        };
        self.io.write_at(
            SUPER_BLOCK_OFFSET * BLOCK_SIZE as u64,
            &super_block.encode()?,
        )?;
        self.io.sync_all()
    }

    /// Cleanly shuts the volume down: drains everything, persists all
    /// metadata, and marks the super block clean.
    pub fn save(&mut self) -> Result<()> {
        self.read_only.check_writable()?;
        self.journal.commit_block(&*self.io)?;
        self.block_map.flush()?;
        self.depot.drain(DrainType::Saving)?;
        self.state.store(VolumeState::Clean);
        self.save_super_block()
    }

    /// Marks the volume for a full rebuild at next open.
    pub fn mark_for_rebuild(&mut self) -> Result<()> {
        self.state.store(VolumeState::ForceRebuild);
        self.save_super_block()
    }

    /// Commits the open recovery journal block. What is committed will
    /// survive a crash; everything else is recovered from here.
    pub fn commit_journal(&mut self) -> Result<()> {
        self.journal.commit_block(&*self.io)?;
        self.io.sync_all()
    }

    /// Reads the mapping for a logical block.
    pub fn read_mapping(&mut self, lbn: Lbn) -> Result<BlockMapEntry> {
        self.block_map.mapping(lbn)
    }

    /// Maps a logical block to a freshly allocated physical block,
    /// journaling the increment (and the decrement of any previous
    /// mapping) and applying both to the reference counters.
    pub fn map_block(&mut self, lbn: Lbn, zone: ZoneCount) -> Result<Pbn> {
        self.read_only.check_writable()?;
        let pbn = self.depot.allocate_block(zone)?;
        let (leaf_pbn, leaf_slot, leaf_index) = self.ensure_leaf(lbn)?;
        let old = self.block_map.entry_at(leaf_pbn, leaf_slot)?;

        let slot = BlockMapSlot {
            pbn: leaf_pbn,
            slot: leaf_slot as u16,
        };
        let increment = RecoveryJournalEntry {
            operation: BlockOperation::DataIncrement,
            slot,
            mapping: BlockMapEntry::mapped(pbn),
        };
        let point = self.journal.append(&*self.io, increment)?;
        self.depot
            .adjust_reference(pbn, BlockOperation::DataIncrement, journal_point_for(&point))?;

        if old.is_mapped() && !old.pbn.is_zero() {
            let decrement = RecoveryJournalEntry {
                operation: BlockOperation::DataDecrement,
                slot,
                mapping: old,
            };
            let point = self.journal.append(&*self.io, decrement)?;
            self.depot.adjust_reference(
                old.pbn,
                BlockOperation::DataDecrement,
                journal_point_for(&point),
            )?;
        }

        self.block_map
            .set_entry_at(leaf_pbn, leaf_slot, BlockMapEntry::mapped(pbn), leaf_index)?;
        Ok(pbn)
    }

    /// Finds or creates the leaf page covering `lbn`; creation journals a
    /// block-map increment against the root slot.
    fn ensure_leaf(&mut self, lbn: Lbn) -> Result<(Pbn, usize, u64)> {
        let leaf_index = lbn.0 / crate::blockmap::ENTRIES_PER_PAGE as u64;
        let leaf_slot = (lbn.0 % crate::blockmap::ENTRIES_PER_PAGE as u64) as usize;
        if let Some((leaf_pbn, _)) = self.block_map.leaf_for(lbn)? {
            return Ok((leaf_pbn, leaf_slot, leaf_index));
        }

        // Metadata pages are allocated from zone zero.
        let leaf_pbn = self.depot.allocate_block(0)?;
        let root_pbn = self.block_map.root_pbn_for_leaf(leaf_index)?;
        let root_slot = (leaf_index % crate::blockmap::ENTRIES_PER_PAGE as u64) as usize;

        let entry = RecoveryJournalEntry {
            operation: BlockOperation::BlockMapIncrement,
            slot: BlockMapSlot {
                pbn: root_pbn,
                slot: root_slot as u16,
            },
            mapping: BlockMapEntry::mapped(leaf_pbn),
        };
        let point = self.journal.append(&*self.io, entry)?;
        self.depot.adjust_reference(
            leaf_pbn,
            BlockOperation::BlockMapIncrement,
            journal_point_for(&point),
        )?;

        let root_index = leaf_index / crate::blockmap::ENTRIES_PER_PAGE as u64;
        self.block_map.set_entry_at(
            root_pbn,
            root_slot,
            BlockMapEntry::mapped(leaf_pbn),
            root_index,
        )?;
        Ok((leaf_pbn, leaf_slot, leaf_index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::MemFileIo;

    fn test_config() -> VolumeConfig {
        VolumeConfig {
            logical_blocks: 2048,
            physical_blocks: 2048,
            slab_size: 64,
            slab_journal_blocks: 2,
            recovery_journal_size: 16,
        }
    }

    fn mem_io() -> Arc<dyn FileIo> {
        Arc::new(MemFileIo::new())
    }

    #[test]
    fn format_then_open_clean() {
        let io = mem_io();
        Volume::format(Arc::clone(&io), test_config(), ThreadCountConfig::default()).unwrap();
        let volume = Volume::open(
            Arc::clone(&io),
            ThreadCountConfig::default(),
            OpenOptions::default(),
        )
        .unwrap();
        assert_eq!(volume.state(), VolumeState::Dirty);
        assert_eq!(volume.depot.allocated_block_count(), 0);
        assert_eq!(volume.journal.logical_blocks_used(), 0);
    }

    #[test]
    fn map_and_read_back() {
        let io = mem_io();
        Volume::format(Arc::clone(&io), test_config(), ThreadCountConfig::default()).unwrap();
        let mut volume = Volume::open(
            Arc::clone(&io),
            ThreadCountConfig::default(),
            OpenOptions::default(),
        )
        .unwrap();

        let pbn = volume.map_block(Lbn(7), 0).unwrap();
        assert_eq!(
            volume.read_mapping(Lbn(7)).unwrap(),
            BlockMapEntry::mapped(pbn)
        );
        // One data block plus one block map leaf.
        assert_eq!(volume.depot.allocated_block_count(), 2);
        assert_eq!(volume.journal.logical_blocks_used(), 1);
        assert_eq!(volume.journal.block_map_data_blocks(), 1);
    }

    #[test]
    fn clean_save_and_reopen() {
        let io = mem_io();
        Volume::format(Arc::clone(&io), test_config(), ThreadCountConfig::default()).unwrap();
        let pbn = {
            let mut volume = Volume::open(
                Arc::clone(&io),
                ThreadCountConfig::default(),
                OpenOptions::default(),
            )
            .unwrap();
            let pbn = volume.map_block(Lbn(3), 0).unwrap();
            volume.save().unwrap();
            assert_eq!(volume.state(), VolumeState::Clean);
            pbn
        };

        let mut reopened = Volume::open(
            Arc::clone(&io),
            ThreadCountConfig::default(),
            OpenOptions::default(),
        )
        .unwrap();
        assert_eq!(reopened.complete_recoveries(), 0);
        assert_eq!(
            reopened.read_mapping(Lbn(3)).unwrap(),
            BlockMapEntry::mapped(pbn)
        );
        assert_eq!(reopened.depot.allocated_block_count(), 2);
    }

    #[test]
    fn mismatched_caller_config_is_rejected() {
        let io = mem_io();
        Volume::format(Arc::clone(&io), test_config(), ThreadCountConfig::default()).unwrap();
        let mut expected = test_config();
        expected.logical_blocks += 1;
        let result = Volume::open(
            io,
            ThreadCountConfig::default(),
            OpenOptions {
                expected_config: Some(expected),
                strict_physical: true,
            },
        );
        assert!(matches!(result, Err(BasaltError::ParameterMismatch(_))));
    }
}
