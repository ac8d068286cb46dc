#![forbid(unsafe_code)]

//! The per-zone block allocator.
//!
//! Each physical zone owns the slabs whose number is congruent to the zone
//! number modulo the zone count. The allocator keeps at most one slab open
//! for allocation; the rest sit in a priority table ordered so that
//! previously written slabs are preferred over virgin ones, which keeps a
//! thinly provisioned backing store from ballooning.

use tracing::{debug, info, warn};

use crate::admin::{AdminState, DrainType, ReadOnlyNotifier};
use crate::primitives::priority::PriorityTable;
use crate::primitives::waitq::WaitQueue;
use crate::slab::summary::{compute_fullness_hint, SlabSummaryEntry, SlabSummaryZone};
use crate::slab::{Slab, SlabStatus};
use crate::statistics::AllocatorStatistics;
use crate::types::{BasaltError, BlockCount, Pbn, Result, ZoneCount};

use super::bufpool::{BufferPool, MetadataBuffer};
use super::scrubber::SlabScrubber;

/// Buffers each allocator preallocates for metadata I/O.
const POOL_SIZE: usize = 2;

/// Waiter fired when a clean slab becomes available after scrubbing.
pub type CleanSlabWaiter = Box<dyn FnOnce() + Send>;

/// The steps of an allocator drain, in order. Resume reverses them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainStep {
    /// Stop the scrubber.
    Scrubber,
    /// Flush every owned slab's journal tail and dirty counters.
    Slabs,
    /// Flush the zone's summary table.
    Summary,
    /// Nothing left to do.
    Finished,
}

/// One zone's allocator.
pub struct BlockAllocator {
    /// The zone this allocator serves.
    pub zone_number: ZoneCount,
    zone_count: ZoneCount,
    /// Highest slab number owned by this allocator, if any.
    pub last_slab: Option<usize>,
    open_slab: Option<usize>,
    prioritized_slabs: PriorityTable<usize>,
    unopened_slab_priority: u8,
    allocated_blocks: BlockCount,
    slab_size_shift: u32,
    /// Scrub scheduling for this zone.
    pub scrubber: SlabScrubber,
    /// Metadata buffer pool for this zone; scrub work parks here by slab
    /// number when every buffer is claimed.
    pub pool: BufferPool<usize>,
    /// Lifecycle state.
    pub admin_state: AdminState,
    /// Operation counters.
    pub stats: AllocatorStatistics,
    clean_waiters: WaitQueue<CleanSlabWaiter>,
}

impl std::fmt::Debug for BlockAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockAllocator")
            .field("zone_number", &self.zone_number)
            .field("open_slab", &self.open_slab)
            .field("allocated_blocks", &self.allocated_blocks)
            .finish_non_exhaustive()
    }
}

impl BlockAllocator {
    /// Creates the allocator for `zone_number` of `zone_count` zones, for
    /// slabs with `data_blocks` data blocks each.
    pub fn new(
        zone_number: ZoneCount,
        zone_count: ZoneCount,
        data_blocks: BlockCount,
        slab_size_shift: u32,
    ) -> Self {
        let max_data_priority = 1 + data_blocks.ilog2() as u8;
        let unopened_slab_priority = max_data_priority / 2 + 1;
        Self {
            zone_number,
            zone_count,
            last_slab: None,
            open_slab: None,
            prioritized_slabs: PriorityTable::new(max_data_priority + 1),
            unopened_slab_priority,
            allocated_blocks: 0,
            slab_size_shift,
            scrubber: SlabScrubber::new(),
            pool: BufferPool::new(POOL_SIZE),
            admin_state: AdminState::default(),
            stats: AllocatorStatistics::default(),
            clean_waiters: WaitQueue::new(),
        }
    }

    /// True when this allocator owns the slab.
    pub fn owns_slab(&self, slab_number: usize) -> bool {
        slab_number % self.zone_count as usize == self.zone_number as usize
    }

    /// Blocks allocated across this zone's registered slabs.
    pub fn allocated_blocks(&self) -> BlockCount {
        self.allocated_blocks
    }

    /// Priority reserved for slabs that have never been written.
    pub fn unopened_slab_priority(&self) -> u8 {
        self.unopened_slab_priority
    }

    /// The slab currently open for allocation.
    pub fn open_slab(&self) -> Option<usize> {
        self.open_slab
    }

    /// Computes the allocation priority of a slab.
    ///
    /// Empty slabs never allocate (priority zero). Never-written slabs get
    /// the reserved unopened slot; everything else ranks by the log of its
    /// free count, shifted past the unopened slot so that partially used
    /// slabs with plenty of room win over virgin ones.
    pub fn priority_for_slab(&self, slab: &Slab) -> u8 {
        let free_blocks = slab.free_block_count();
        if free_blocks == 0 {
            return 0;
        }
        if slab.journal.is_blank() {
            return self.unopened_slab_priority;
        }
        let priority = 1 + free_blocks.ilog2() as u8;
        if priority < self.unopened_slab_priority {
            priority
        } else {
            priority + 1
        }
    }

    /// Registers a slab with the allocator and queues it for allocation.
    /// Free-block accounting is skipped while the slab is resuming, since
    /// a resuming slab was never deregistered.
    pub fn register_slab(&mut self, slab: &Slab) {
        debug_assert!(self.owns_slab(slab.slab_number));
        if !slab.admin_state.is_resuming() {
            self.allocated_blocks += slab.data_block_count() - slab.free_block_count();
        }
        self.last_slab = Some(
            self.last_slab
                .map_or(slab.slab_number, |last| last.max(slab.slab_number)),
        );
        self.queue_slab(slab);
    }

    /// Puts a slab (back) into the priority table without accounting.
    pub fn queue_slab(&mut self, slab: &Slab) {
        let priority = self.priority_for_slab(slab);
        self.prioritized_slabs.remove(&slab.slab_number);
        self.prioritized_slabs.enqueue(priority, slab.slab_number);
    }

    /// Allocates one block with a provisional reference. The caller must
    /// either confirm it with a journaled increment or release it with a
    /// journaled decrement within one journal transaction.
    pub fn allocate_block(&mut self, slabs: &mut [Slab]) -> Result<Pbn> {
        loop {
            if let Some(open) = self.open_slab {
                match slabs[open].allocate() {
                    Ok(pbn) => {
                        self.allocated_blocks += 1;
                        return Ok(pbn);
                    }
                    Err(BasaltError::NoSpace) => {
                        // Exhausted; back to the table at priority zero.
                        let slab = &slabs[open];
                        self.queue_slab(slab);
                        self.open_slab = None;
                    }
                    Err(other) => return Err(other),
                }
            }
            let next = loop {
                match self.prioritized_slabs.dequeue() {
                    None => return Err(BasaltError::NoSpace),
                    Some(number) if slabs[number].free_block_count() == 0 => continue,
                    Some(number) => break number,
                }
            };
            self.open_slab_by_number(slabs, next);
        }
    }

    fn open_slab_by_number(&mut self, slabs: &mut [Slab], slab_number: usize) {
        let slab = &mut slabs[slab_number];
        if slab.journal.is_blank() {
            self.stats.slabs_opened.increment();
        } else {
            self.stats.slabs_reopened.increment();
        }
        slab.open();
        self.open_slab = Some(slab_number);
        debug!(
            zone = self.zone_number,
            slab = slab_number,
            free = slab.free_block_count(),
            "opened slab for allocation"
        );
    }

    /// Force-opens a specific slab, bypassing priority selection. Test-only
    /// hook for exercising a chosen slab.
    #[cfg(test)]
    pub fn open_slab_for_test(&mut self, slabs: &mut [Slab], slab_number: usize) {
        self.prioritized_slabs.remove(&slab_number);
        if let Some(open) = self.open_slab.take() {
            self.queue_slab(&slabs[open]);
        }
        self.open_slab_by_number(slabs, slab_number);
    }

    /// Records a confirmed reference change against the zone's accounting.
    pub fn note_reference_change(&mut self, freed: bool) {
        if freed {
            self.allocated_blocks -= 1;
        } else {
            self.allocated_blocks += 1;
        }
    }

    /// Moves a slab onto the scrub queues.
    pub fn register_slab_for_scrubbing(&mut self, slab: &mut Slab, high_priority: bool) {
        debug_assert!(self.owns_slab(slab.slab_number));
        slab.status = if high_priority {
            SlabStatus::RequiresHighPriorityScrubbing
        } else {
            SlabStatus::RequiresScrubbing
        };
        self.prioritized_slabs.remove(&slab.slab_number);
        self.scrubber.register_slab(slab.slab_number, high_priority);
    }

    /// Parks a waiter to be fired when scrubbing produces a clean slab.
    /// Fails with `NoSpace` when the scrubber is quiescent and has nothing
    /// queued, since no clean slab can ever appear.
    pub fn enqueue_clean_slab_waiter(&mut self, waiter: CleanSlabWaiter) -> Result<()> {
        if self.scrubber.is_quiescent() && !self.scrubber.has_slabs() {
            return Err(BasaltError::NoSpace);
        }
        self.clean_waiters.enqueue(waiter);
        Ok(())
    }

    /// Claims a pooled buffer for every queued slab, high priority first.
    /// Slabs beyond the pool size park on the pool and are rescheduled by
    /// [`scrub_slab_chain`](Self::scrub_slab_chain) handoffs. Returns the
    /// slabs that got a buffer immediately.
    pub fn stage_scrubbing(&mut self) -> Vec<(usize, MetadataBuffer)> {
        let mut staged = Vec::new();
        if !self.scrubber.is_active() {
            return staged;
        }
        while let Some(slab_number) = self.scrubber.next_slab() {
            if let Some(buffer) = self.pool.acquire_or_wait(slab_number) {
                staged.push((slab_number, buffer));
            }
        }
        staged
    }

    /// Scrubs a staged slab, then every parked slab its buffer release
    /// hands the buffer to, strictly one at a time. Returns how many
    /// slabs were scrubbed. An error latches read-only mode and aborts
    /// everything still parked.
    pub fn scrub_slab_chain(
        &mut self,
        slabs: &mut [Slab],
        summary_zone: &mut SlabSummaryZone,
        io: &dyn crate::primitives::io::FileIo,
        read_only: &ReadOnlyNotifier,
        slab_number: usize,
        buffer: MetadataBuffer,
    ) -> Result<usize> {
        let mut scrubbed = 0;
        let mut work = Some((slab_number, buffer));
        while let Some((number, mut buffer)) = work.take() {
            let result = self.scrub_slab(slabs, summary_zone, io, number, &mut buffer);
            work = self.pool.release(buffer);
            if let Err(error) = result {
                warn!(
                    zone = self.zone_number,
                    slab = number,
                    %error,
                    "scrubbing failed"
                );
                read_only.enter("slab scrubbing failed");
                self.pool.abort_waiters();
                if let Some((_, buffer)) = work.take() {
                    self.pool.release(buffer);
                }
                self.notify_read_only(slabs);
                return Err(error);
            }
            scrubbed += 1;
        }
        Ok(scrubbed)
    }

    /// Scrubs one slab using the claimed buffer as journal scratch.
    ///
    /// When the summary already records the slab as clean and no journal
    /// blocks are live, nothing is read; the slab goes straight back into
    /// service.
    fn scrub_slab(
        &mut self,
        slabs: &mut [Slab],
        summary_zone: &mut SlabSummaryZone,
        io: &dyn crate::primitives::io::FileIo,
        slab_number: usize,
        buffer: &mut MetadataBuffer,
    ) -> Result<()> {
        let slab = &mut slabs[slab_number];
        slab.status = SlabStatus::Rebuilding;

        let summary_entry = summary_zone.entry(slab_number)?;
        let needs_apply = summary_entry.is_dirty || slab.journal.blocks_in_use() > 0;
        if needs_apply {
            slab.commit_journal_tail(io)?;
            let blocks = slab.journal.read_live_blocks_into(io, buffer.data_mut())?;
            let mut applied = 0usize;
            for block in &blocks {
                for (index, entry) in block.entries.iter().enumerate() {
                    if slab.ref_counts.replay(
                        entry.sbn,
                        entry.operation,
                        crate::types::JournalPoint {
                            sequence: block.sequence,
                            entry_count: index as u16,
                        },
                    )? {
                        applied += 1;
                    }
                }
            }
            slab.save_dirty_ref_counts(io)?;
            slab.journal.reopen();
            debug!(
                zone = self.zone_number,
                slab = slab_number,
                applied,
                "applied slab journal during scrub"
            );
        }

        slab.status = SlabStatus::Rebuilt;
        let entry = SlabSummaryEntry {
            tail_block_offset: summary_entry.tail_block_offset,
            fullness_hint: compute_fullness_hint(slab.free_block_count(), self.slab_size_shift),
            load_ref_counts: true,
            is_dirty: false,
        };
        summary_zone.update_entry(slab_number, entry, None)?;
        summary_zone.flush(io)?;

        self.stats.slabs_scrubbed.increment();
        let slab = &slabs[slab_number];
        self.register_slab(slab);
        self.clean_waiters.notify_all(|waiter| waiter());
        Ok(())
    }

    /// Aborts every parked entry across the zone's slab journals and every
    /// clean-slab waiter. Called when the volume goes read-only.
    pub fn notify_read_only(&mut self, slabs: &mut [Slab]) {
        let mut aborted = 0;
        for slab in slabs.iter_mut() {
            if self.owns_slab(slab.slab_number) {
                aborted += slab.journal.abort_waiters();
            }
        }
        aborted += self.clean_waiters.notify_all(|_| {});
        if aborted > 0 {
            info!(
                zone = self.zone_number,
                aborted, "aborted waiters for read-only mode"
            );
        }
    }

    /// Runs one drain step. Steps are idempotent and sequential:
    /// scrubber, then slabs, then summary.
    pub fn drain_step(
        &mut self,
        step: DrainStep,
        drain_type: DrainType,
        slabs: &mut [Slab],
        summary_zone: &mut SlabSummaryZone,
        io: &dyn crate::primitives::io::FileIo,
    ) -> Result<DrainStep> {
        match step {
            DrainStep::Scrubber => {
                self.scrubber.stop()?;
                Ok(DrainStep::Slabs)
            }
            DrainStep::Slabs => {
                for slab in slabs.iter_mut() {
                    if !self.owns_slab(slab.slab_number) {
                        continue;
                    }
                    if let Some(commit) = slab.commit_journal_tail(io)? {
                        let existing = summary_zone.entry(slab.slab_number)?;
                        let entry = SlabSummaryEntry {
                            tail_block_offset: commit.offset as u8,
                            fullness_hint: compute_fullness_hint(
                                slab.free_block_count(),
                                self.slab_size_shift,
                            ),
                            load_ref_counts: existing.load_ref_counts,
                            is_dirty: true,
                        };
                        summary_zone.update_entry(slab.slab_number, entry, None)?;
                    }
                    if matches!(drain_type, DrainType::Saving | DrainType::Flush) {
                        slab.save_dirty_ref_counts(io)?;
                        let entry = SlabSummaryEntry {
                            tail_block_offset: summary_zone
                                .entry(slab.slab_number)?
                                .tail_block_offset,
                            fullness_hint: compute_fullness_hint(
                                slab.free_block_count(),
                                self.slab_size_shift,
                            ),
                            load_ref_counts: true,
                            is_dirty: false,
                        };
                        summary_zone.update_entry(slab.slab_number, entry, None)?;
                    }
                }
                Ok(DrainStep::Summary)
            }
            DrainStep::Summary => {
                summary_zone.flush(io)?;
                Ok(DrainStep::Finished)
            }
            DrainStep::Finished => Ok(DrainStep::Finished),
        }
    }

    /// Drains the zone completely.
    pub fn drain(
        &mut self,
        drain_type: DrainType,
        slabs: &mut [Slab],
        summary_zone: &mut SlabSummaryZone,
        io: &dyn crate::primitives::io::FileIo,
    ) -> Result<()> {
        self.admin_state.start_draining(drain_type)?;
        let mut step = DrainStep::Scrubber;
        while step != DrainStep::Finished {
            step = self.drain_step(step, drain_type, slabs, summary_zone, io)?;
        }
        self.admin_state.finish_draining()
    }

    /// Resumes the zone, reversing the drain steps.
    pub fn resume(&mut self, slabs: &mut [Slab]) -> Result<()> {
        self.admin_state.start_resuming()?;
        for slab in slabs.iter_mut() {
            if self.owns_slab(slab.slab_number) && slab.admin_state.is_quiescent() {
                slab.admin_state.start_resuming()?;
                slab.admin_state.finish_resuming()?;
            }
        }
        self.scrubber.start()?;
        self.admin_state.finish_resuming()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::MemFileIo;
    use crate::slab::SlabConfig;
    use crate::types::{BlockOperation, JournalPoint};

    fn config() -> SlabConfig {
        SlabConfig::new(64, 58, 4, 2).unwrap()
    }

    fn build_zone(slab_count: usize) -> (BlockAllocator, Vec<Slab>) {
        let config = config();
        let mut allocator =
            BlockAllocator::new(0, 1, config.data_blocks, config.slab_size_shift());
        let slabs: Vec<Slab> = (0..slab_count)
            .map(|n| Slab::new(&config, n, 1, Pbn(0), 7))
            .collect();
        allocator.admin_state.make_normal();
        for slab in &slabs {
            allocator.register_slab(slab);
        }
        (allocator, slabs)
    }

    #[test]
    fn allocates_through_one_slab_then_no_space() {
        let (mut allocator, mut slabs) = build_zone(1);
        for i in 0..58u64 {
            let pbn = allocator.allocate_block(&mut slabs).unwrap();
            assert_eq!(pbn, Pbn(i));
        }
        assert!(matches!(
            allocator.allocate_block(&mut slabs),
            Err(BasaltError::NoSpace)
        ));
        assert_eq!(allocator.allocated_blocks(), 58);
    }

    #[test]
    fn priority_function_matches_specified_ranking() {
        let (allocator, mut slabs) = build_zone(1);
        let io = MemFileIo::new();

        // Blank journal: reserved unopened priority.
        assert_eq!(
            allocator.priority_for_slab(&slabs[0]),
            allocator.unopened_slab_priority()
        );

        // Journaled slab with free blocks ranks by log2 of its free count.
        slabs[0].open();
        slabs[0]
            .add_journal_entry(
                &io,
                0,
                BlockOperation::DataIncrement,
                JournalPoint {
                    sequence: 1,
                    entry_count: 0,
                },
            )
            .unwrap();
        let free = slabs[0].free_block_count();
        let expected = 1 + free.ilog2() as u8;
        let expected = if expected < allocator.unopened_slab_priority() {
            expected
        } else {
            expected + 1
        };
        assert_eq!(allocator.priority_for_slab(&slabs[0]), expected);

        // A full slab never ranks above zero.
        while slabs[0].free_block_count() > 0 {
            slabs[0].allocate().unwrap();
        }
        assert_eq!(allocator.priority_for_slab(&slabs[0]), 0);
    }

    #[test]
    fn previously_written_slabs_preferred_over_virgin() {
        let io = MemFileIo::new();
        let (mut allocator, mut slabs) = build_zone(2);

        // Touch slab 1 so its journal is non-blank with plenty of room.
        slabs[1].open();
        slabs[1]
            .add_journal_entry(
                &io,
                0,
                BlockOperation::DataIncrement,
                JournalPoint {
                    sequence: 1,
                    entry_count: 0,
                },
            )
            .unwrap();
        allocator.queue_slab(&slabs[1]);

        let pbn = allocator.allocate_block(&mut slabs).unwrap();
        // Allocation came from slab 1 (its data region starts at pbn 64).
        assert!(pbn.0 >= 64, "expected written slab to win, got {pbn}");
    }

    #[test]
    fn test_hook_forces_specific_slab() {
        let (mut allocator, mut slabs) = build_zone(3);
        allocator.open_slab_for_test(&mut slabs, 2);
        let pbn = allocator.allocate_block(&mut slabs).unwrap();
        assert_eq!(pbn, Pbn(2 * 64));
    }

    #[test]
    fn clean_slab_waiter_fails_when_scrubber_idle() {
        let (mut allocator, _slabs) = build_zone(1);
        assert!(matches!(
            allocator.enqueue_clean_slab_waiter(Box::new(|| {})),
            Err(BasaltError::NoSpace)
        ));
    }

    #[test]
    fn drain_steps_run_in_order() {
        let io = MemFileIo::new();
        let (mut allocator, mut slabs) = build_zone(1);
        let mut summary = crate::slab::summary::SlabSummary::new(Pbn(1000), 1);

        let step = allocator
            .drain_step(
                DrainStep::Scrubber,
                DrainType::Saving,
                &mut slabs,
                summary.zone_mut(0),
                &io,
            )
            .unwrap();
        assert_eq!(step, DrainStep::Slabs);
        let step = allocator
            .drain_step(step, DrainType::Saving, &mut slabs, summary.zone_mut(0), &io)
            .unwrap();
        assert_eq!(step, DrainStep::Summary);
        let step = allocator
            .drain_step(step, DrainType::Saving, &mut slabs, summary.zone_mut(0), &io)
            .unwrap();
        assert_eq!(step, DrainStep::Finished);
    }
}
