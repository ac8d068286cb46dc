#![forbid(unsafe_code)]

//! Slabs: contiguous stripes of physical blocks, each with its own
//! reference counters and journal.

pub mod journal;
pub mod ref_counts;
pub mod summary;

use bytes::{Buf, BufMut};
use tracing::trace;

use crate::codec::ensure_remaining;
use crate::primitives::io::FileIo;
use crate::types::{
    BasaltError, BlockCount, BlockOperation, JournalPoint, Pbn, Result, SlabBlockNumber,
    ZoneCount,
};
use self::journal::{AddResult, SlabJournal, SlabJournalEntry, TailCommit};
use self::ref_counts::{RefCounts, COUNTS_PER_BLOCK};

/// Where a slab is in its lifecycle relative to recovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlabStatus {
    /// Counters are consistent; the slab may serve allocations.
    Rebuilt,
    /// The slab journal must be applied before the slab is usable.
    RequiresScrubbing,
    /// Same, but wanted ahead of everything else.
    RequiresHighPriorityScrubbing,
    /// Scrubbing is applying the journal right now.
    Rebuilding,
    /// Recovery is replaying entries into the slab journal.
    Replaying,
}

/// Geometry shared by every slab in a depot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlabConfig {
    /// Total blocks per slab; a power of two.
    pub slab_blocks: BlockCount,
    /// Leading blocks holding client data.
    pub data_blocks: BlockCount,
    /// Blocks holding the reference counters.
    pub reference_blocks: BlockCount,
    /// Trailing blocks holding the slab journal.
    pub journal_blocks: BlockCount,
    /// Unreleased journal blocks that trigger a tail flush.
    pub flushing_threshold: BlockCount,
    /// Unreleased journal blocks at which new entries are parked.
    pub blocking_threshold: BlockCount,
    /// Unreleased journal blocks at which scrubbing becomes urgent.
    pub scrubbing_threshold: BlockCount,
}

/// Encoded size of a [`SlabConfig`].
pub const SLAB_CONFIG_SIZE: usize = 56;

impl SlabConfig {
    /// Builds a config from explicit region sizes.
    pub fn new(
        slab_blocks: BlockCount,
        data_blocks: BlockCount,
        reference_blocks: BlockCount,
        journal_blocks: BlockCount,
    ) -> Result<Self> {
        let config = Self {
            slab_blocks,
            data_blocks,
            reference_blocks,
            journal_blocks,
            flushing_threshold: (journal_blocks * 3 / 4).max(1),
            blocking_threshold: journal_blocks
                .saturating_sub(1)
                .max(journal_blocks * 3 / 4)
                .max(1),
            scrubbing_threshold: journal_blocks,
        };
        config.validate()?;
        Ok(config)
    }

    /// Derives the data/reference split for a slab of `slab_blocks` with a
    /// `journal_blocks` journal: the largest data region whose counters
    /// still fit.
    pub fn compute(slab_blocks: BlockCount, journal_blocks: BlockCount) -> Result<Self> {
        if journal_blocks >= slab_blocks {
            return Err(BasaltError::BadConfiguration(
                "slab journal does not leave room for data".into(),
            ));
        }
        let mut data_blocks = slab_blocks - journal_blocks - 1;
        loop {
            let reference_blocks = data_blocks.div_ceil(COUNTS_PER_BLOCK as u64);
            if data_blocks + reference_blocks + journal_blocks <= slab_blocks {
                return Self::new(
                    slab_blocks,
                    data_blocks,
                    reference_blocks,
                    journal_blocks,
                );
            }
            data_blocks -= 1;
        }
    }

    fn validate(&self) -> Result<()> {
        if !self.slab_blocks.is_power_of_two() {
            return Err(BasaltError::BadConfiguration(format!(
                "slab size {} is not a power of two",
                self.slab_blocks
            )));
        }
        if self.data_blocks + self.reference_blocks + self.journal_blocks != self.slab_blocks {
            return Err(BasaltError::BadConfiguration(
                "slab regions do not cover the slab".into(),
            ));
        }
        if self.data_blocks == 0 || self.journal_blocks == 0 {
            return Err(BasaltError::BadConfiguration(
                "slab must have data and journal blocks".into(),
            ));
        }
        if self.flushing_threshold > self.blocking_threshold
            || self.blocking_threshold > self.scrubbing_threshold
            || self.scrubbing_threshold > self.journal_blocks
        {
            return Err(BasaltError::BadConfiguration(
                "slab journal thresholds out of order".into(),
            ));
        }
        Ok(())
    }

    /// log2 of the slab size.
    pub fn slab_size_shift(&self) -> u32 {
        self.slab_blocks.trailing_zeros()
    }

    /// Appends the packed form (seven little-endian words).
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u64_le(self.slab_blocks);
        buf.put_u64_le(self.data_blocks);
        buf.put_u64_le(self.reference_blocks);
        buf.put_u64_le(self.journal_blocks);
        buf.put_u64_le(self.flushing_threshold);
        buf.put_u64_le(self.blocking_threshold);
        buf.put_u64_le(self.scrubbing_threshold);
    }

    /// Reads the packed form and revalidates it.
    pub fn decode(buf: &mut &[u8]) -> Result<Self> {
        ensure_remaining(buf, SLAB_CONFIG_SIZE, "slab config truncated")?;
        let config = Self {
            slab_blocks: buf.get_u64_le(),
            data_blocks: buf.get_u64_le(),
            reference_blocks: buf.get_u64_le(),
            journal_blocks: buf.get_u64_le(),
            flushing_threshold: buf.get_u64_le(),
            blocking_threshold: buf.get_u64_le(),
            scrubbing_threshold: buf.get_u64_le(),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Outcome of [`Slab::append_replay_entry`] at the journal level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplayAppend {
    /// Entry packed at this point.
    Added(JournalPoint),
    /// The ring is completely full; the oldest block must be absorbed
    /// before anything more fits.
    RingFull,
}

/// One slab: data region, reference counters, and journal.
#[derive(Debug)]
pub struct Slab {
    /// Index of this slab within the depot.
    pub slab_number: usize,
    /// The physical zone that owns this slab.
    pub zone: ZoneCount,
    /// First block of the slab (start of the data region).
    pub start: Pbn,
    /// One past the last block of the slab.
    pub end: Pbn,
    /// Recovery status.
    pub status: SlabStatus,
    /// Admin lifecycle state.
    pub admin_state: crate::admin::AdminState,
    /// Reference counters for the data region.
    pub ref_counts: RefCounts,
    /// The slab journal.
    pub journal: SlabJournal,
    data_blocks: BlockCount,
}

impl Slab {
    /// Creates an in-memory slab at its computed position.
    pub fn new(
        config: &SlabConfig,
        slab_number: usize,
        zone_count: ZoneCount,
        depot_first_block: Pbn,
        nonce: u64,
    ) -> Self {
        let start = Pbn(depot_first_block.0 + slab_number as u64 * config.slab_blocks);
        let ref_counts_origin = Pbn(start.0 + config.data_blocks);
        let journal_origin = Pbn(ref_counts_origin.0 + config.reference_blocks);
        Self {
            slab_number,
            zone: (slab_number % zone_count as usize) as ZoneCount,
            start,
            end: Pbn(start.0 + config.slab_blocks),
            status: SlabStatus::Rebuilt,
            admin_state: crate::admin::AdminState::default(),
            ref_counts: RefCounts::new(
                slab_number,
                config.data_blocks as SlabBlockNumber,
                ref_counts_origin,
            ),
            journal: SlabJournal::new(
                slab_number,
                journal_origin,
                config.journal_blocks,
                config.flushing_threshold,
                config.blocking_threshold,
                nonce,
            ),
            data_blocks: config.data_blocks,
        }
    }

    /// Unreferenced data blocks in this slab.
    pub fn free_block_count(&self) -> BlockCount {
        self.ref_counts.free_block_count()
    }

    /// Data blocks in this slab.
    pub fn data_block_count(&self) -> BlockCount {
        self.data_blocks
    }

    /// Converts a slab-relative data block number to an absolute address.
    pub fn pbn_for(&self, sbn: SlabBlockNumber) -> Result<Pbn> {
        if BlockCount::from(sbn) >= self.data_blocks {
            return Err(BasaltError::OutOfRange("slab block past data region"));
        }
        Ok(Pbn(self.start.0 + u64::from(sbn)))
    }

    /// Converts an absolute address to a slab-relative data block number.
    pub fn sbn_for(&self, pbn: Pbn) -> Result<SlabBlockNumber> {
        if pbn < self.start || pbn.0 >= self.start.0 + self.data_blocks {
            return Err(BasaltError::OutOfRange("address outside slab data region"));
        }
        Ok((pbn.0 - self.start.0) as SlabBlockNumber)
    }

    /// Prepares the slab to serve allocations: resets the search cursor
    /// and, when the journal has never been written, dirties every
    /// reference block so the first save writes a complete set.
    pub fn open(&mut self) {
        self.ref_counts.reset_search_cursor();
        if self.journal.is_blank() {
            self.ref_counts.mark_all_dirty();
            self.journal.open();
        }
        trace!(slab = self.slab_number, "opened slab");
    }

    /// Allocates one data block, returning it with a provisional reference.
    pub fn allocate(&mut self) -> Result<Pbn> {
        let sbn = self.ref_counts.allocate_unreferenced_block()?;
        self.pbn_for(sbn)
    }

    /// Journals a reference change and applies it to the counters. Returns
    /// false when the journal parked the entry at its blocking threshold.
    pub fn add_journal_entry(
        &mut self,
        io: &dyn FileIo,
        sbn: SlabBlockNumber,
        operation: BlockOperation,
        recovery_point: JournalPoint,
    ) -> Result<bool> {
        let entry = SlabJournalEntry { sbn, operation };
        match self.journal.add_entry(io, entry, recovery_point)? {
            AddResult::Added(point) => {
                self.ref_counts.adjust(sbn, operation, point)?;
                Ok(true)
            }
            AddResult::Blocked => Ok(false),
        }
    }

    /// Appends a recovery-replay entry to the slab journal without touching
    /// the counters (scrubbing applies them later). Entries at or before
    /// the journal's recorded recovery point are already present from
    /// before the crash and are skipped; returns whether the entry was
    /// added. When the ring fills, the oldest committed block is absorbed
    /// directly into the counters to make room.
    pub fn append_replay_entry(
        &mut self,
        io: &dyn FileIo,
        sbn: SlabBlockNumber,
        operation: BlockOperation,
        recovery_point: JournalPoint,
    ) -> Result<bool> {
        self.status = SlabStatus::Replaying;
        if !self.journal.is_blank() && recovery_point <= self.journal.recovery_point() {
            return Ok(false);
        }
        let entry = SlabJournalEntry { sbn, operation };
        loop {
            match self.journal.append_replay(io, entry, recovery_point)? {
                ReplayAppend::Added(_) => return Ok(true),
                ReplayAppend::RingFull => self.absorb_oldest_journal_block(io)?,
            }
        }
    }

    fn absorb_oldest_journal_block(&mut self, io: &dyn FileIo) -> Result<()> {
        let head = self.journal.head();
        let block = self.journal.read_block(io, head)?;
        for (index, entry) in block.entries.iter().enumerate() {
            self.ref_counts.replay(
                entry.sbn,
                entry.operation,
                JournalPoint {
                    sequence: block.sequence,
                    entry_count: index as u16,
                },
            )?;
        }
        self.journal.advance_head();
        Ok(())
    }

    /// Applies every live journal block to the reference counters, in
    /// order. The heart of scrubbing.
    pub fn apply_journal_to_ref_counts(&mut self, io: &dyn FileIo) -> Result<usize> {
        let blocks = self.journal.read_live_blocks(io)?;
        let mut applied = 0;
        for block in &blocks {
            for (index, entry) in block.entries.iter().enumerate() {
                if BlockCount::from(entry.sbn) >= self.data_blocks {
                    return Err(BasaltError::CorruptJournal(
                        "slab journal entry offset out of bounds",
                    ));
                }
                if self.ref_counts.replay(
                    entry.sbn,
                    entry.operation,
                    JournalPoint {
                        sequence: block.sequence,
                        entry_count: index as u16,
                    },
                )? {
                    applied += 1;
                }
            }
        }
        Ok(applied)
    }

    /// Commits the journal tail, returning the commit record for the
    /// summary update.
    pub fn commit_journal_tail(&mut self, io: &dyn FileIo) -> Result<Option<TailCommit>> {
        self.journal.commit_tail(io)
    }

    /// Releases journal blocks locking recovery-journal sequence `sequence`
    /// or earlier, then applies any entries that had been parked at the
    /// blocking threshold. Returns how many parked entries went through.
    pub fn release_recovery_journal_lock(
        &mut self,
        io: &dyn FileIo,
        sequence: crate::types::SequenceNumber,
    ) -> Result<usize> {
        let added = self.journal.release_recovery_journal_lock(io, sequence)?;
        let count = added.len();
        for (entry, point) in added {
            self.ref_counts.adjust(entry.sbn, entry.operation, point)?;
        }
        Ok(count)
    }

    /// Writes dirty reference blocks.
    pub fn save_dirty_ref_counts(&mut self, io: &dyn FileIo) -> Result<usize> {
        self.ref_counts.save_dirty_blocks(io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::MemFileIo;

    fn config() -> SlabConfig {
        SlabConfig::new(64, 58, 4, 2).unwrap()
    }

    #[test]
    fn explicit_config_validates_shape() {
        let config = config();
        assert_eq!(config.slab_blocks, 64);
        assert!(config.flushing_threshold <= config.blocking_threshold);
        assert!(config.blocking_threshold <= config.scrubbing_threshold);
        assert!(config.scrubbing_threshold <= config.journal_blocks);

        assert!(SlabConfig::new(63, 57, 4, 2).is_err(), "not a power of two");
        assert!(SlabConfig::new(64, 60, 4, 2).is_err(), "regions overflow");
    }

    #[test]
    fn computed_config_maximizes_data() {
        let config = SlabConfig::compute(64, 2).unwrap();
        assert_eq!(config.slab_blocks, 64);
        assert_eq!(config.journal_blocks, 2);
        assert_eq!(config.reference_blocks, 1);
        assert_eq!(config.data_blocks, 61);

        let big = SlabConfig::compute(1 << 15, 8).unwrap();
        assert_eq!(
            big.data_blocks + big.reference_blocks + big.journal_blocks,
            big.slab_blocks
        );
        assert_eq!(
            big.reference_blocks,
            big.data_blocks.div_ceil(COUNTS_PER_BLOCK as u64)
        );
    }

    #[test]
    fn config_roundtrip() {
        let config = config();
        let mut buf = Vec::new();
        config.encode(&mut buf);
        assert_eq!(buf.len(), SLAB_CONFIG_SIZE);
        let mut cursor = buf.as_slice();
        assert_eq!(SlabConfig::decode(&mut cursor).unwrap(), config);
    }

    #[test]
    fn slab_geometry() {
        let slab = Slab::new(&config(), 2, 2, Pbn(100), 7);
        assert_eq!(slab.start, Pbn(100 + 2 * 64));
        assert_eq!(slab.end, Pbn(100 + 3 * 64));
        assert_eq!(slab.zone, 0);
        assert_eq!(slab.pbn_for(0).unwrap(), slab.start);
        assert_eq!(slab.sbn_for(Pbn(slab.start.0 + 57)).unwrap(), 57);
        assert!(slab.pbn_for(58).is_err());
        assert!(slab.sbn_for(Pbn(slab.start.0 + 58)).is_err());
    }

    #[test]
    fn allocate_is_sequential_from_start() {
        let mut slab = Slab::new(&config(), 0, 1, Pbn(0), 7);
        slab.open();
        for i in 0..58u64 {
            assert_eq!(slab.allocate().unwrap(), Pbn(slab.start.0 + i));
        }
        assert!(matches!(slab.allocate(), Err(BasaltError::NoSpace)));
    }

    #[test]
    fn journal_entry_applies_to_counters() {
        let io = MemFileIo::new();
        let mut slab = Slab::new(&config(), 0, 1, Pbn(0), 7);
        slab.open();

        let pbn = slab.allocate().unwrap();
        let sbn = slab.sbn_for(pbn).unwrap();
        assert!(slab
            .add_journal_entry(
                &io,
                sbn,
                BlockOperation::DataIncrement,
                JournalPoint {
                    sequence: 1,
                    entry_count: 0
                }
            )
            .unwrap());
        assert_eq!(slab.ref_counts.counter(sbn).unwrap(), 1);
        assert_eq!(slab.free_block_count(), 57);
    }

    #[test]
    fn replay_entries_fill_journal_without_touching_counters() {
        let io = MemFileIo::new();
        let mut slab = Slab::new(&config(), 0, 1, Pbn(0), 7);
        slab.open();

        slab.append_replay_entry(
            &io,
            3,
            BlockOperation::DataIncrement,
            JournalPoint {
                sequence: 8,
                entry_count: 0,
            },
        )
        .unwrap();
        assert_eq!(slab.status, SlabStatus::Replaying);
        assert_eq!(slab.ref_counts.counter(3).unwrap(), 0);

        slab.commit_journal_tail(&io).unwrap();
        let applied = slab.apply_journal_to_ref_counts(&io).unwrap();
        assert_eq!(applied, 1);
        assert_eq!(slab.ref_counts.counter(3).unwrap(), 1);
    }
}
