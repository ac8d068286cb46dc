#![forbid(unsafe_code)]

//! The slab summary: a small per-zone table with one two-byte entry per
//! slab, persisted to its own partition.
//!
//! The summary is what lets recovery avoid loading every slab: the entry
//! records where the slab journal's tail was, whether the reference counts
//! are worth loading as-is, whether the slab needs scrubbing, and a rough
//! free-block hint used to order scrubbing and allocation.

use tracing::debug;

use crate::config::MAX_SLABS;
use crate::primitives::io::FileIo;
use crate::primitives::waitq::WaitQueue;
use crate::types::{BasaltError, BlockCount, Pbn, Result, ZoneCount, BLOCK_SIZE};

/// Summary entries per summary block.
pub const ENTRIES_PER_BLOCK: usize = BLOCK_SIZE / 2;
/// Summary blocks each zone owns.
pub const BLOCKS_PER_ZONE: usize = MAX_SLABS.div_ceil(ENTRIES_PER_BLOCK);
/// Bits available for the fullness hint.
const FULLNESS_HINT_BITS: u32 = 6;
const MAX_FULLNESS_HINT: u8 = (1 << FULLNESS_HINT_BITS) - 1;

/// Total blocks of the summary partition for `zone_count` zones.
pub fn summary_partition_blocks(zone_count: ZoneCount) -> BlockCount {
    zone_count as BlockCount * BLOCKS_PER_ZONE as BlockCount
}

/// Compresses a free-block count into the six-bit hint.
pub fn compute_fullness_hint(free_blocks: BlockCount, slab_size_shift: u32) -> u8 {
    let shift = slab_size_shift.saturating_sub(FULLNESS_HINT_BITS);
    (free_blocks >> shift).min(u64::from(MAX_FULLNESS_HINT)) as u8
}

/// Expands a hint back into an approximate free-block count.
pub fn approximate_free_blocks(hint: u8, slab_size_shift: u32) -> BlockCount {
    let shift = slab_size_shift.saturating_sub(FULLNESS_HINT_BITS);
    BlockCount::from(hint) << shift
}

/// One slab's two-byte summary record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SlabSummaryEntry {
    /// Ring offset of the most recently committed slab journal block.
    pub tail_block_offset: u8,
    /// Six-bit approximation of the slab's free block count.
    pub fullness_hint: u8,
    /// Whether the on-disk reference counts are current and worth loading.
    pub load_ref_counts: bool,
    /// Whether the slab journal holds entries not yet in the counters.
    pub is_dirty: bool,
}

impl SlabSummaryEntry {
    fn pack(&self) -> [u8; 2] {
        [
            self.tail_block_offset,
            (self.fullness_hint & MAX_FULLNESS_HINT)
                | (u8::from(self.load_ref_counts) << 6)
                | (u8::from(self.is_dirty) << 7),
        ]
    }

    fn unpack(bytes: [u8; 2]) -> Self {
        Self {
            tail_block_offset: bytes[0],
            fullness_hint: bytes[1] & MAX_FULLNESS_HINT,
            load_ref_counts: bytes[1] & 0x40 != 0,
            is_dirty: bytes[1] & 0x80 != 0,
        }
    }
}

/// Waiter fired once a summary update is durable.
pub type SummaryWaiter = Box<dyn FnOnce() + Send>;

/// One zone's summary table.
pub struct SlabSummaryZone {
    zone: ZoneCount,
    origin: Pbn,
    entries: Vec<SlabSummaryEntry>,
    dirty_blocks: Vec<bool>,
    waiters: Vec<WaitQueue<SummaryWaiter>>,
}

impl std::fmt::Debug for SlabSummaryZone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlabSummaryZone")
            .field("zone", &self.zone)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

impl SlabSummaryZone {
    fn new(zone: ZoneCount, origin: Pbn) -> Self {
        Self {
            zone,
            origin,
            entries: vec![SlabSummaryEntry::default(); BLOCKS_PER_ZONE * ENTRIES_PER_BLOCK],
            dirty_blocks: vec![false; BLOCKS_PER_ZONE],
            waiters: (0..BLOCKS_PER_ZONE).map(|_| WaitQueue::new()).collect(),
        }
    }

    fn check_slab(&self, slab_number: usize) -> Result<()> {
        if slab_number >= self.entries.len() {
            return Err(BasaltError::OutOfRange("slab number past summary capacity"));
        }
        Ok(())
    }

    /// Current entry for a slab.
    pub fn entry(&self, slab_number: usize) -> Result<SlabSummaryEntry> {
        self.check_slab(slab_number)?;
        Ok(self.entries[slab_number])
    }

    /// Records a new entry for a slab and optionally parks a waiter to be
    /// fired when the containing summary block reaches disk.
    pub fn update_entry(
        &mut self,
        slab_number: usize,
        entry: SlabSummaryEntry,
        waiter: Option<SummaryWaiter>,
    ) -> Result<()> {
        self.check_slab(slab_number)?;
        self.entries[slab_number] = entry;
        let block = slab_number / ENTRIES_PER_BLOCK;
        self.dirty_blocks[block] = true;
        if let Some(waiter) = waiter {
            self.waiters[block].enqueue(waiter);
        }
        Ok(())
    }

    /// Writes dirty summary blocks and fires their waiters.
    pub fn flush(&mut self, io: &dyn FileIo) -> Result<()> {
        for block in 0..BLOCKS_PER_ZONE {
            if !self.dirty_blocks[block] {
                continue;
            }
            self.write_block(io, block)?;
            self.dirty_blocks[block] = false;
            self.waiters[block].notify_all(|waiter| waiter());
        }
        Ok(())
    }

    fn write_block(&self, io: &dyn FileIo, block: usize) -> Result<()> {
        let mut buf = Vec::with_capacity(BLOCK_SIZE);
        for entry in &self.entries[block * ENTRIES_PER_BLOCK..(block + 1) * ENTRIES_PER_BLOCK] {
            buf.extend_from_slice(&entry.pack());
        }
        io.write_at((self.origin.0 + block as u64) * BLOCK_SIZE as u64, &buf)
    }

    /// Writes every block regardless of dirtiness.
    pub fn save(&mut self, io: &dyn FileIo) -> Result<()> {
        for block in 0..BLOCKS_PER_ZONE {
            self.dirty_blocks[block] = true;
        }
        self.flush(io)
    }

    /// Reads the zone table back from disk.
    pub fn load(&mut self, io: &dyn FileIo) -> Result<()> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        for block in 0..BLOCKS_PER_ZONE {
            io.read_at((self.origin.0 + block as u64) * BLOCK_SIZE as u64, &mut buf)?;
            for slot in 0..ENTRIES_PER_BLOCK {
                self.entries[block * ENTRIES_PER_BLOCK + slot] =
                    SlabSummaryEntry::unpack([buf[slot * 2], buf[slot * 2 + 1]]);
            }
            self.dirty_blocks[block] = false;
        }
        debug!(zone = self.zone, "loaded slab summary zone");
        Ok(())
    }
}

/// The whole summary: one table per physical zone.
#[derive(Debug)]
pub struct SlabSummary {
    zones: Vec<SlabSummaryZone>,
}

impl SlabSummary {
    /// Creates an all-default summary for `zone_count` zones, persisted at
    /// `origin`.
    pub fn new(origin: Pbn, zone_count: ZoneCount) -> Self {
        Self {
            zones: (0..zone_count)
                .map(|zone| {
                    SlabSummaryZone::new(
                        zone,
                        Pbn(origin.0 + zone as u64 * BLOCKS_PER_ZONE as u64),
                    )
                })
                .collect(),
        }
    }

    /// Number of zones.
    pub fn zone_count(&self) -> ZoneCount {
        self.zones.len() as ZoneCount
    }

    /// One zone's table.
    pub fn zone(&self, zone: ZoneCount) -> &SlabSummaryZone {
        &self.zones[zone as usize]
    }

    /// One zone's table, mutably.
    pub fn zone_mut(&mut self, zone: ZoneCount) -> &mut SlabSummaryZone {
        &mut self.zones[zone as usize]
    }

    /// Loads every zone table.
    pub fn load(&mut self, io: &dyn FileIo) -> Result<()> {
        for zone in &mut self.zones {
            zone.load(io)?;
        }
        Ok(())
    }

    /// Saves every zone table.
    pub fn save(&mut self, io: &dyn FileIo) -> Result<()> {
        for zone in &mut self.zones {
            zone.save(io)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::MemFileIo;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn entry_pack_roundtrip() {
        let entry = SlabSummaryEntry {
            tail_block_offset: 17,
            fullness_hint: 63,
            load_ref_counts: true,
            is_dirty: true,
        };
        assert_eq!(SlabSummaryEntry::unpack(entry.pack()), entry);

        let clean = SlabSummaryEntry {
            tail_block_offset: 0,
            fullness_hint: 12,
            load_ref_counts: false,
            is_dirty: false,
        };
        assert_eq!(SlabSummaryEntry::unpack(clean.pack()), clean);
    }

    #[test]
    fn fullness_hint_is_monotone_and_bounded() {
        let shift = 10; // 1024-block slabs
        assert_eq!(compute_fullness_hint(0, shift), 0);
        let full = compute_fullness_hint(1024, shift);
        assert_eq!(full, 63);
        let half = compute_fullness_hint(512, shift);
        assert!(half < full);
        assert!(approximate_free_blocks(half, shift) <= 512);
        // Small slabs use the count directly.
        assert_eq!(compute_fullness_hint(58, 6), 58);
    }

    #[test]
    fn update_flush_load_roundtrip() {
        let io = MemFileIo::new();
        let mut summary = SlabSummary::new(Pbn(0), 2);

        let entry = SlabSummaryEntry {
            tail_block_offset: 3,
            fullness_hint: 7,
            load_ref_counts: true,
            is_dirty: true,
        };
        summary.zone_mut(1).update_entry(5, entry, None).unwrap();
        summary.save(&io).unwrap();

        let mut reloaded = SlabSummary::new(Pbn(0), 2);
        reloaded.load(&io).unwrap();
        assert_eq!(reloaded.zone(1).entry(5).unwrap(), entry);
        assert_eq!(
            reloaded.zone(0).entry(5).unwrap(),
            SlabSummaryEntry::default()
        );
    }

    #[test]
    fn waiter_fires_on_flush() {
        let io = MemFileIo::new();
        let mut summary = SlabSummary::new(Pbn(0), 1);
        let fired = Arc::new(AtomicBool::new(false));
        let observer = Arc::clone(&fired);

        summary
            .zone_mut(0)
            .update_entry(
                0,
                SlabSummaryEntry::default(),
                Some(Box::new(move || observer.store(true, Ordering::SeqCst))),
            )
            .unwrap();
        assert!(!fired.load(Ordering::SeqCst));
        summary.zone_mut(0).flush(&io).unwrap();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn out_of_range_slab_is_rejected() {
        let mut summary = SlabSummary::new(Pbn(0), 1);
        assert!(matches!(
            summary
                .zone_mut(0)
                .update_entry(MAX_SLABS * 2, SlabSummaryEntry::default(), None),
            Err(BasaltError::OutOfRange(_))
        ));
    }
}
