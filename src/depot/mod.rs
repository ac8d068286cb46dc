#![forbid(unsafe_code)]

//! The slab depot: every slab, one block allocator per physical zone, the
//! slab summary, and the action manager that drives fleet-wide operations.

pub mod allocator;
pub mod bufpool;
pub mod scrubber;

pub use self::allocator::{BlockAllocator, CleanSlabWaiter, DrainStep};
pub use self::bufpool::{BufferPool, MetadataBuffer};
pub use self::scrubber::SlabScrubber;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::admin::{AdminState, DrainType, LoadType, ReadOnlyNotifier};
use crate::primitives::heap::Heap;
use crate::primitives::io::FileIo;
use crate::slab::summary::{compute_fullness_hint, SlabSummary};
use crate::slab::{Slab, SlabConfig, SlabStatus};
use crate::statistics::AllocatorStatisticsSnapshot;
use crate::superblock::{SlabDepotState, VolumeState, VolumeStateCell};
use crate::types::{
    BasaltError, BlockCount, BlockOperation, JournalPoint, Pbn, Result, SequenceNumber,
    SlabBlockNumber, ZoneCount,
};

/// Fleet-wide operations the action manager schedules. Each runs as a
/// preamble, a per-zone action, and a conclusion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DepotAction {
    /// Release slab-journal locks on recovery-journal blocks at or before
    /// the given sequence.
    ReleaseTailBlockLocks(SequenceNumber),
    /// Sort and queue every slab for allocation or scrubbing.
    PrepareToAllocate,
    /// Scrub every unrecovered slab.
    ScrubAllUnrecovered,
    /// Drain every zone.
    Drain(DrainType),
    /// Resume every zone.
    Resume,
}

/// Serializes depot-wide actions and gates the default lock-release action
/// on the release-request generation.
#[derive(Debug, Default)]
struct ActionManager {
    queue: VecDeque<DepotAction>,
    new_release_request: SequenceNumber,
    active_release_request: SequenceNumber,
}

impl ActionManager {
    fn schedule(&mut self, action: DepotAction) {
        self.queue.push_back(action);
    }

    /// The next action to run: an explicitly scheduled one, or the default
    /// lock release when the requested generation has moved.
    fn next_action(&mut self) -> Option<DepotAction> {
        if let Some(action) = self.queue.pop_front() {
            return Some(action);
        }
        if self.new_release_request != self.active_release_request {
            self.active_release_request = self.new_release_request;
            return Some(DepotAction::ReleaseTailBlockLocks(
                self.active_release_request,
            ));
        }
        None
    }
}

/// A slab's sort key for prepare-to-allocate ordering.
#[derive(Clone, Copy, Debug)]
struct SlabStatusRecord {
    slab_number: usize,
    is_clean: bool,
    emptiness: u8,
}

/// The depot.
pub struct SlabDepot {
    slab_config: SlabConfig,
    zone_count: ZoneCount,
    first_block: Pbn,
    last_block: Pbn,
    nonce: u64,
    /// Every slab, indexed by slab number.
    pub slabs: Vec<Slab>,
    allocators: Vec<BlockAllocator>,
    /// The slab summary, one zone table per allocator.
    pub summary: SlabSummary,
    io: Arc<dyn FileIo>,
    read_only: Arc<ReadOnlyNotifier>,
    volume_state: Arc<VolumeStateCell>,
    action_manager: ActionManager,
    zones_to_scrub: AtomicU32,
    /// Staged growth: slabs built but not yet committed.
    new_slabs: Vec<Slab>,
    pending_last_block: Option<Pbn>,
    load_type: Option<LoadType>,
    /// Depot lifecycle state.
    pub admin_state: AdminState,
}

impl std::fmt::Debug for SlabDepot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlabDepot")
            .field("zone_count", &self.zone_count)
            .field("slab_count", &self.slabs.len())
            .field("first_block", &self.first_block)
            .field("last_block", &self.last_block)
            .finish_non_exhaustive()
    }
}

impl SlabDepot {
    /// Builds a depot from its persistent state.
    pub fn new(
        state: &SlabDepotState,
        summary_origin: Pbn,
        nonce: u64,
        io: Arc<dyn FileIo>,
        read_only: Arc<ReadOnlyNotifier>,
        volume_state: Arc<VolumeStateCell>,
    ) -> Result<Self> {
        let depot_blocks = state.last_block.0 - state.first_block.0;
        let slab_count = (depot_blocks / state.slab_config.slab_blocks) as usize;
        if slab_count == 0 {
            return Err(BasaltError::BadConfiguration(
                "depot partition smaller than one slab".into(),
            ));
        }
        let zone_count = state.zone_count;
        let slabs: Vec<Slab> = (0..slab_count)
            .map(|n| Slab::new(&state.slab_config, n, zone_count, state.first_block, nonce))
            .collect();
        let allocators: Vec<BlockAllocator> = (0..zone_count)
            .map(|zone| {
                read_only.register_listener(format!("block-allocator-{zone}"));
                BlockAllocator::new(
                    zone,
                    zone_count,
                    state.slab_config.data_blocks,
                    state.slab_config.slab_size_shift(),
                )
            })
            .collect();
        Ok(Self {
            slab_config: state.slab_config,
            zone_count,
            first_block: state.first_block,
            last_block: state.last_block,
            nonce,
            slabs,
            allocators,
            summary: SlabSummary::new(summary_origin, zone_count),
            io,
            read_only,
            volume_state,
            action_manager: ActionManager::default(),
            zones_to_scrub: AtomicU32::new(0),
            new_slabs: Vec::new(),
            pending_last_block: None,
            load_type: None,
            admin_state: AdminState::default(),
        })
    }

    /// The persistent record for the super block.
    pub fn record_state(&self) -> SlabDepotState {
        SlabDepotState {
            slab_config: self.slab_config,
            first_block: self.first_block,
            last_block: self.last_block,
            zone_count: self.zone_count,
        }
    }

    /// Geometry shared by every slab.
    pub fn slab_config(&self) -> &SlabConfig {
        &self.slab_config
    }

    /// Number of slabs.
    pub fn slab_count(&self) -> usize {
        self.slabs.len()
    }

    /// Number of physical zones.
    pub fn zone_count(&self) -> ZoneCount {
        self.zone_count
    }

    /// One allocator.
    pub fn allocator(&self, zone: ZoneCount) -> &BlockAllocator {
        &self.allocators[zone as usize]
    }

    /// One allocator, mutably.
    pub fn allocator_mut(&mut self, zone: ZoneCount) -> &mut BlockAllocator {
        &mut self.allocators[zone as usize]
    }

    /// Finds the slab containing an absolute block address.
    pub fn slab_for_pbn(&self, pbn: Pbn) -> Result<usize> {
        if pbn < self.first_block {
            return Err(BasaltError::OutOfRange("address before slab depot"));
        }
        let index = ((pbn.0 - self.first_block.0) / self.slab_config.slab_blocks) as usize;
        if index >= self.slabs.len() {
            return Err(BasaltError::OutOfRange("address past slab depot"));
        }
        Ok(index)
    }

    /// Blocks with at least one (possibly provisional) reference, summed
    /// across all zones.
    pub fn allocated_block_count(&self) -> BlockCount {
        self.allocators
            .iter()
            .map(BlockAllocator::allocated_blocks)
            .sum()
    }

    /// Per-zone statistics snapshots.
    pub fn statistics(&self) -> Vec<AllocatorStatisticsSnapshot> {
        self.allocators.iter().map(|a| a.stats.snapshot()).collect()
    }

    /// Allocates one block from the given zone, with a provisional
    /// reference the caller must confirm or release.
    pub fn allocate_block(&mut self, zone: ZoneCount) -> Result<Pbn> {
        self.read_only.check_writable()?;
        let allocator = &mut self.allocators[zone as usize];
        allocator.allocate_block(&mut self.slabs)
    }

    /// Journals and applies a reference change for an absolute address.
    /// Returns false when the slab journal parked the entry.
    pub fn adjust_reference(
        &mut self,
        pbn: Pbn,
        operation: BlockOperation,
        recovery_point: JournalPoint,
    ) -> Result<bool> {
        self.read_only.check_writable()?;
        let slab_number = self.slab_for_pbn(pbn)?;
        let slab = &mut self.slabs[slab_number];
        let sbn: SlabBlockNumber = slab.sbn_for(pbn)?;
        let free_before = slab.free_block_count();
        let applied = slab.add_journal_entry(&*self.io, sbn, operation, recovery_point)?;
        let free_after = slab.free_block_count();

        if slab.journal.requires_flushing() {
            slab.commit_journal_tail(&*self.io)?;
        }

        let allocator = &mut self.allocators[slab.zone as usize];
        if free_after > free_before {
            allocator.note_reference_change(true);
            if free_before == 0 && allocator.open_slab() != Some(slab_number) {
                allocator.queue_slab(slab);
            }
        } else if free_after < free_before {
            allocator.note_reference_change(false);
        }
        Ok(applied)
    }

    /// Applies a reference change directly to the counters, without
    /// journaling. Only valid while rebuilding from the block map.
    pub fn apply_rebuild_change(&mut self, pbn: Pbn, operation: BlockOperation) -> Result<()> {
        let slab_number = self.slab_for_pbn(pbn)?;
        let slab = &mut self.slabs[slab_number];
        let sbn = slab.sbn_for(pbn)?;
        slab.ref_counts.rebuild_adjust(sbn, operation)
    }

    /// Loads the summary and every slab according to the load type.
    pub fn load(&mut self, load_type: LoadType) -> Result<()> {
        self.admin_state.start_loading(load_type)?;
        self.load_type = Some(load_type);
        self.summary.load(&*self.io)?;

        for slab in &mut self.slabs {
            match load_type {
                LoadType::Load | LoadType::LoadForRecovery => {
                    let entry = self.summary.zone(slab.zone).entry(slab.slab_number)?;
                    slab.journal.load_tail(&*self.io)?;
                    if entry.load_ref_counts {
                        slab.ref_counts.load(&*self.io)?;
                    }
                    slab.status = if entry.is_dirty || load_type == LoadType::LoadForRecovery {
                        SlabStatus::RequiresScrubbing
                    } else {
                        SlabStatus::Rebuilt
                    };
                }
                LoadType::LoadForRebuild => {
                    slab.journal.erase(&*self.io)?;
                    slab.ref_counts.reset_for_rebuild();
                    slab.status = SlabStatus::Rebuilt;
                }
            }
        }

        if load_type == LoadType::LoadForRecovery {
            self.zones_to_scrub
                .store(u32::from(self.zone_count), Ordering::Release);
        }
        for allocator in &mut self.allocators {
            allocator.admin_state.make_normal();
        }
        self.admin_state.finish_loading()?;
        info!(
            slabs = self.slabs.len(),
            zones = self.zone_count,
            ?load_type,
            "loaded slab depot"
        );
        Ok(())
    }

    /// Schedules a depot-wide action.
    pub fn schedule_action(&mut self, action: DepotAction) {
        self.action_manager.schedule(action);
    }

    /// Requests that slab journals release their locks on recovery-journal
    /// blocks at or before `sequence`. Picked up as the default action.
    pub fn set_release_request(&mut self, sequence: SequenceNumber) {
        self.action_manager.new_release_request = sequence;
    }

    /// Runs scheduled actions (and the default lock release) to completion.
    pub fn run_actions(&mut self) -> Result<()> {
        while let Some(action) = self.action_manager.next_action() {
            self.apply_action(action)?;
        }
        Ok(())
    }

    fn apply_action(&mut self, action: DepotAction) -> Result<()> {
        debug!(?action, "running depot action");
        match action {
            DepotAction::ReleaseTailBlockLocks(sequence) => {
                for slab in &mut self.slabs {
                    slab.release_recovery_journal_lock(&*self.io, sequence)?;
                }
                Ok(())
            }
            DepotAction::PrepareToAllocate => self.prepare_to_allocate(),
            DepotAction::ScrubAllUnrecovered => self.scrub_all_unrecovered(),
            DepotAction::Drain(drain_type) => self.drain(drain_type),
            DepotAction::Resume => self.resume(),
        }
    }

    /// Sorts each zone's slabs by (clean, emptiness) and queues clean ones
    /// for allocation, the rest for scrubbing.
    pub fn prepare_to_allocate(&mut self) -> Result<()> {
        for zone in 0..self.zone_count {
            let mut records: Vec<SlabStatusRecord> = self
                .slabs
                .iter()
                .filter(|slab| slab.zone == zone)
                .map(|slab| SlabStatusRecord {
                    slab_number: slab.slab_number,
                    // Only a rebuilt slab may ever serve allocations.
                    is_clean: slab.status == SlabStatus::Rebuilt,
                    emptiness: self
                        .summary
                        .zone(zone)
                        .entry(slab.slab_number)
                        .map(|e| e.fullness_hint)
                        .unwrap_or(0),
                })
                .collect();

            // Pop order is descending: cleanest, emptiest first.
            let mut heap = Heap::new(&mut records, |a, b| {
                a.is_clean
                    .cmp(&b.is_clean)
                    .then(a.emptiness.cmp(&b.emptiness))
            });
            let mut ordered = Vec::new();
            while let Some(&record) = heap.pop() {
                ordered.push(record);
            }

            let allocator = &mut self.allocators[zone as usize];
            for record in ordered {
                let slab = &mut self.slabs[record.slab_number];
                if record.is_clean {
                    allocator.register_slab(slab);
                } else {
                    let high_priority =
                        slab.status == SlabStatus::RequiresHighPriorityScrubbing;
                    allocator.register_slab_for_scrubbing(slab, high_priority);
                }
            }
        }
        Ok(())
    }

    /// Scrubs every queued slab, zone by zone. Each zone scrubs strictly
    /// sequentially; the last zone to finish flips the volume state from
    /// `Recovering` to `Dirty`.
    pub fn scrub_all_unrecovered(&mut self) -> Result<()> {
        for zone in 0..self.zone_count {
            let allocator = &mut self.allocators[zone as usize];
            allocator.scrubber.start()?;
            let summary_zone = self.summary.zone_mut(zone);
            // Every queued slab claims a buffer up front; slabs past the
            // pool size park and are rescheduled as finished scrubs hand
            // their buffers on.
            let staged = allocator.stage_scrubbing();
            for (slab_number, buffer) in staged {
                allocator.scrub_slab_chain(
                    &mut self.slabs,
                    summary_zone,
                    &*self.io,
                    &self.read_only,
                    slab_number,
                    buffer,
                )?;
            }
            if self.read_only.is_read_only() {
                return Err(BasaltError::ReadOnly);
            }
            self.finish_zone_scrubbing();
        }
        Ok(())
    }

    /// Marks one zone's scrubbing complete. When this was the last zone,
    /// recovery is over.
    fn finish_zone_scrubbing(&self) {
        if self.load_type != Some(LoadType::LoadForRecovery) {
            return;
        }
        let previous = self.zones_to_scrub.fetch_sub(1, Ordering::AcqRel);
        if previous == 1
            && self
                .volume_state
                .compare_exchange(VolumeState::Recovering, VolumeState::Dirty)
        {
            info!("all zones scrubbed; recovery complete");
        }
    }

    /// Drains every zone: scrubber, slabs, then summary.
    pub fn drain(&mut self, drain_type: DrainType) -> Result<()> {
        self.admin_state.start_draining(drain_type)?;
        for zone in 0..self.zone_count {
            let allocator = &mut self.allocators[zone as usize];
            allocator.admin_state.make_normal();
            allocator.drain(
                drain_type,
                &mut self.slabs,
                self.summary.zone_mut(zone),
                &*self.io,
            )?;
        }
        self.io.sync_all()?;
        self.admin_state.finish_draining()
    }

    /// Resumes every zone, reversing the drain.
    pub fn resume(&mut self) -> Result<()> {
        self.admin_state.start_resuming()?;
        for zone in 0..self.zone_count {
            let allocator = &mut self.allocators[zone as usize];
            allocator.resume(&mut self.slabs)?;
        }
        self.admin_state.finish_resuming()
    }

    /// Enters read-only mode and aborts every waiter in every zone.
    pub fn enter_read_only_mode(&mut self, reason: &str) {
        self.read_only.enter(reason);
        for allocator in &mut self.allocators {
            allocator.notify_read_only(&mut self.slabs);
        }
    }

    /// Stages growth of the depot to a new end block. Fails with
    /// `IncrementTooSmall` unless at least one whole slab is added.
    pub fn prepare_to_grow(&mut self, new_last_block: Pbn) -> Result<usize> {
        let new_blocks = new_last_block.0.saturating_sub(self.first_block.0);
        let new_count = (new_blocks / self.slab_config.slab_blocks) as usize;
        if new_count <= self.slabs.len() {
            return Err(BasaltError::IncrementTooSmall);
        }
        let nonce = self.nonce;
        self.new_slabs = (self.slabs.len()..new_count)
            .map(|n| Slab::new(&self.slab_config, n, self.zone_count, self.first_block, nonce))
            .collect();
        self.pending_last_block = Some(new_last_block);
        Ok(self.new_slabs.len())
    }

    /// Commits staged growth in one step: the new slabs become visible and
    /// are queued with their allocators.
    pub fn commit_growth(&mut self) -> Result<()> {
        if self.new_slabs.is_empty() {
            return Err(BasaltError::IncrementTooSmall);
        }
        self.last_block = self
            .pending_last_block
            .take()
            .expect("growth staged a new end block");
        let new_slabs = std::mem::take(&mut self.new_slabs);
        for slab in new_slabs {
            let allocator = &mut self.allocators[slab.zone as usize];
            allocator.register_slab(&slab);
            self.slabs.push(slab);
        }
        info!(slabs = self.slabs.len(), "committed slab depot growth");
        Ok(())
    }

    /// Discards staged growth.
    pub fn abandon_growth(&mut self) {
        self.new_slabs.clear();
        self.pending_last_block = None;
    }

    /// Parks a waiter for a clean slab in the given zone.
    pub fn enqueue_clean_slab_waiter(
        &mut self,
        zone: ZoneCount,
        waiter: CleanSlabWaiter,
    ) -> Result<()> {
        self.allocators[zone as usize].enqueue_clean_slab_waiter(waiter)
    }

    /// Writes a fresh, clean summary entry for every slab. Used at format.
    pub fn initialize_summary(&mut self) -> Result<()> {
        for slab in &self.slabs {
            let entry = crate::slab::summary::SlabSummaryEntry {
                tail_block_offset: 0,
                fullness_hint: compute_fullness_hint(
                    slab.data_block_count(),
                    self.slab_config.slab_size_shift(),
                ),
                load_ref_counts: false,
                is_dirty: false,
            };
            self.summary
                .zone_mut(slab.zone)
                .update_entry(slab.slab_number, entry, None)?;
        }
        self.summary.save(&*self.io)
    }
}
