#![forbid(unsafe_code)]

//! Per-slab reference counting.
//!
//! Each data block in a slab has a one-byte counter. Counters are grouped
//! into reference blocks of [`COUNTS_PER_BLOCK`] counters, written to disk
//! one per block. Every on-disk sector of a reference block starts with the
//! journal point of the last slab-journal entry applied before the write,
//! which is what makes replay idempotent after a crash.

use std::collections::VecDeque;

use bytes::{Buf, BufMut};
use tracing::debug;

use crate::primitives::io::FileIo;
use crate::types::{
    BasaltError, BlockCount, BlockOperation, JournalPoint, Pbn, Result, SlabBlockNumber,
    BLOCK_SIZE, SECTORS_PER_BLOCK, SECTOR_SIZE,
};

/// Counter value for an unreferenced block.
pub const EMPTY_REFERENCE: u8 = 0;
/// Largest number of confirmed shared references a block may carry.
pub const MAX_SHARED_REFERENCES: u8 = 254;
/// Counter value marking an allocation in flight but not yet journaled.
pub const PROVISIONAL_REFERENCE: u8 = 0xFF;

/// Counters stored in each on-disk sector, after the packed journal point.
pub const COUNTS_PER_SECTOR: usize = SECTOR_SIZE - 8;
/// Counters stored in each on-disk reference block.
pub const COUNTS_PER_BLOCK: usize = COUNTS_PER_SECTOR * SECTORS_PER_BLOCK;

/// Interpretation of a raw counter value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReferenceStatus {
    /// Unreferenced and allocatable.
    Empty,
    /// Allocation in flight, not yet journaled.
    Provisional,
    /// Exactly one confirmed reference.
    Single,
    /// Two or more confirmed references.
    Shared,
}

/// Classifies a raw counter byte.
pub fn reference_status(counter: u8) -> ReferenceStatus {
    match counter {
        EMPTY_REFERENCE => ReferenceStatus::Empty,
        PROVISIONAL_REFERENCE => ReferenceStatus::Provisional,
        1 => ReferenceStatus::Single,
        _ => ReferenceStatus::Shared,
    }
}

#[derive(Clone, Debug)]
struct ReferenceBlock {
    allocated_count: u32,
    commit_points: [JournalPoint; SECTORS_PER_BLOCK],
    dirty: bool,
}

impl ReferenceBlock {
    fn new() -> Self {
        Self {
            allocated_count: 0,
            commit_points: [JournalPoint::default(); SECTORS_PER_BLOCK],
            dirty: false,
        }
    }
}

/// The counters for one slab.
#[derive(Debug)]
pub struct RefCounts {
    slab_number: usize,
    origin: Pbn,
    counters: Vec<u8>,
    blocks: Vec<ReferenceBlock>,
    free_blocks: BlockCount,
    search_cursor: usize,
    /// Point of the last slab-journal entry applied to these counters.
    slab_journal_point: JournalPoint,
    /// Dirty reference blocks, oldest first.
    dirty_queue: VecDeque<usize>,
}

impl RefCounts {
    /// Creates all-empty counters for a slab with `data_blocks` data blocks,
    /// persisted starting at `origin`.
    pub fn new(slab_number: usize, data_blocks: SlabBlockNumber, origin: Pbn) -> Self {
        let data_blocks = data_blocks as usize;
        let block_count = data_blocks.div_ceil(COUNTS_PER_BLOCK);
        Self {
            slab_number,
            origin,
            counters: vec![EMPTY_REFERENCE; data_blocks],
            blocks: vec![ReferenceBlock::new(); block_count],
            free_blocks: data_blocks as BlockCount,
            search_cursor: 0,
            slab_journal_point: JournalPoint::default(),
            dirty_queue: VecDeque::new(),
        }
    }

    /// Number of data blocks covered.
    pub fn data_blocks(&self) -> SlabBlockNumber {
        self.counters.len() as SlabBlockNumber
    }

    /// Number of on-disk reference blocks.
    pub fn reference_block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Currently unreferenced data blocks.
    pub fn free_block_count(&self) -> BlockCount {
        self.free_blocks
    }

    /// Data blocks with at least a provisional reference.
    pub fn allocated_block_count(&self) -> BlockCount {
        self.counters.len() as BlockCount - self.free_blocks
    }

    /// Point of the last entry applied to these counters.
    pub fn slab_journal_point(&self) -> JournalPoint {
        self.slab_journal_point
    }

    /// Raw counter value, for diagnostics and tests.
    pub fn counter(&self, sbn: SlabBlockNumber) -> Result<u8> {
        self.check_range(sbn)?;
        Ok(self.counters[sbn as usize])
    }

    /// Status of one counter.
    pub fn status(&self, sbn: SlabBlockNumber) -> Result<ReferenceStatus> {
        Ok(reference_status(self.counter(sbn)?))
    }

    fn check_range(&self, sbn: SlabBlockNumber) -> Result<()> {
        if (sbn as usize) >= self.counters.len() {
            return Err(BasaltError::OutOfRange(
                "slab block number past end of slab data",
            ));
        }
        Ok(())
    }

    fn block_index(sbn: SlabBlockNumber) -> usize {
        sbn as usize / COUNTS_PER_BLOCK
    }

    fn sector_index(sbn: SlabBlockNumber) -> usize {
        (sbn as usize % COUNTS_PER_BLOCK) / COUNTS_PER_SECTOR
    }

    fn mark_dirty(&mut self, block_index: usize) {
        if !self.blocks[block_index].dirty {
            self.blocks[block_index].dirty = true;
            self.dirty_queue.push_back(block_index);
        }
    }

    /// Marks every reference block dirty, forcing a full rewrite. Used when
    /// a slab is opened with a blank journal so the counters on disk are
    /// known to match memory.
    pub fn mark_all_dirty(&mut self) {
        for index in 0..self.blocks.len() {
            self.mark_dirty(index);
        }
    }

    /// Resets the rotating allocation cursor to the front of the slab.
    pub fn reset_search_cursor(&mut self) {
        self.search_cursor = 0;
    }

    /// Places a provisional reference on an empty counter. Fails if the
    /// block is already referenced in any way.
    pub fn provisionally_reference(&mut self, sbn: SlabBlockNumber) -> Result<()> {
        self.check_range(sbn)?;
        let index = sbn as usize;
        if self.counters[index] != EMPTY_REFERENCE {
            return Err(BasaltError::RefCountInvalid(format!(
                "provisional reference to non-empty counter {} in slab {}",
                sbn, self.slab_number
            )));
        }
        self.counters[index] = PROVISIONAL_REFERENCE;
        let block = Self::block_index(sbn);
        self.blocks[block].allocated_count += 1;
        self.free_blocks -= 1;
        self.mark_dirty(block);
        Ok(())
    }

    /// Applies an increment or decrement carrying a journal point, during
    /// normal operation.
    pub fn adjust(
        &mut self,
        sbn: SlabBlockNumber,
        operation: BlockOperation,
        point: JournalPoint,
    ) -> Result<()> {
        self.check_range(sbn)?;
        self.apply_change(sbn, operation, true)?;
        self.slab_journal_point = self.slab_journal_point.max(point);
        self.mark_dirty(Self::block_index(sbn));
        Ok(())
    }

    /// Replays a journal entry. The change is applied only when the entry's
    /// point is past the commit point stored for the counter's sector;
    /// otherwise the entry was already durable before the crash. Returns
    /// whether the counter changed.
    pub fn replay(
        &mut self,
        sbn: SlabBlockNumber,
        operation: BlockOperation,
        point: JournalPoint,
    ) -> Result<bool> {
        self.check_range(sbn)?;
        let block = Self::block_index(sbn);
        let sector = Self::sector_index(sbn);
        if point <= self.blocks[block].commit_points[sector] {
            return Ok(false);
        }
        self.apply_change(sbn, operation, false)?;
        self.slab_journal_point = self.slab_journal_point.max(point);
        self.mark_dirty(block);
        Ok(true)
    }

    fn apply_change(
        &mut self,
        sbn: SlabBlockNumber,
        operation: BlockOperation,
        normal_operation: bool,
    ) -> Result<()> {
        let index = sbn as usize;
        let block = Self::block_index(sbn);
        let counter = self.counters[index];
        match operation {
            BlockOperation::DataIncrement => match counter {
                EMPTY_REFERENCE => {
                    self.counters[index] = 1;
                    self.blocks[block].allocated_count += 1;
                    self.free_blocks -= 1;
                }
                PROVISIONAL_REFERENCE => {
                    // The provisional reference already counted as allocated.
                    self.counters[index] = 1;
                }
                MAX_SHARED_REFERENCES => {
                    return Err(BasaltError::RefCountInvalid(format!(
                        "increment of counter {} in slab {} past maximum",
                        sbn, self.slab_number
                    )));
                }
                value => self.counters[index] = value + 1,
            },
            BlockOperation::DataDecrement => match counter {
                EMPTY_REFERENCE => {
                    return Err(BasaltError::RefCountInvalid(format!(
                        "decrement of zero counter {} in slab {}",
                        sbn, self.slab_number
                    )));
                }
                PROVISIONAL_REFERENCE | 1 => {
                    self.counters[index] = EMPTY_REFERENCE;
                    self.blocks[block].allocated_count -= 1;
                    self.free_blocks += 1;
                }
                value => self.counters[index] = value - 1,
            },
            BlockOperation::BlockMapIncrement => match counter {
                EMPTY_REFERENCE if !normal_operation => {
                    self.counters[index] = MAX_SHARED_REFERENCES;
                    self.blocks[block].allocated_count += 1;
                    self.free_blocks -= 1;
                }
                PROVISIONAL_REFERENCE => {
                    // Idempotent w.r.t. allocated_count: the provisional
                    // reference was already counted.
                    self.counters[index] = MAX_SHARED_REFERENCES;
                }
                value if value >= 2 => self.counters[index] = MAX_SHARED_REFERENCES,
                _ => {
                    return Err(BasaltError::RefCountInvalid(format!(
                        "block map increment of counter {} ({}) in slab {}",
                        sbn, counter, self.slab_number
                    )));
                }
            },
        }
        Ok(())
    }

    /// Applies a change without a journal point. Only valid while
    /// rebuilding counters from the block map, where no journal exists.
    pub fn rebuild_adjust(&mut self, sbn: SlabBlockNumber, operation: BlockOperation) -> Result<()> {
        self.check_range(sbn)?;
        self.apply_change(sbn, operation, false)?;
        self.mark_dirty(Self::block_index(sbn));
        Ok(())
    }

    /// Finds and provisionally references the first empty counter at or
    /// after the rotating cursor, wrapping once.
    pub fn allocate_unreferenced_block(&mut self) -> Result<SlabBlockNumber> {
        if self.free_blocks == 0 {
            return Err(BasaltError::NoSpace);
        }
        let total = self.counters.len();
        for probe in 0..total {
            let index = (self.search_cursor + probe) % total;
            if self.counters[index] == EMPTY_REFERENCE {
                let sbn = index as SlabBlockNumber;
                self.provisionally_reference(sbn)?;
                self.search_cursor = (index + 1) % total;
                return Ok(sbn);
            }
        }
        Err(BasaltError::NoSpace)
    }

    fn pack_block(&self, block_index: usize) -> Vec<u8> {
        let mut buf = Vec::with_capacity(BLOCK_SIZE);
        let base = block_index * COUNTS_PER_BLOCK;
        for sector in 0..SECTORS_PER_BLOCK {
            buf.put_u64_le(self.slab_journal_point.encode_packed());
            let start = base + sector * COUNTS_PER_SECTOR;
            for offset in 0..COUNTS_PER_SECTOR {
                let index = start + offset;
                buf.put_u8(if index < self.counters.len() {
                    self.counters[index]
                } else {
                    EMPTY_REFERENCE
                });
            }
        }
        buf
    }

    /// Writes dirty reference blocks, oldest-dirtied first. Returns how
    /// many blocks were written.
    pub fn save_dirty_blocks(&mut self, io: &dyn FileIo) -> Result<usize> {
        let mut written = 0;
        while let Some(block_index) = self.dirty_queue.pop_front() {
            if !self.blocks[block_index].dirty {
                continue;
            }
            let buf = self.pack_block(block_index);
            let offset = (self.origin.0 + block_index as u64) * BLOCK_SIZE as u64;
            io.write_at(offset, &buf)?;
            self.blocks[block_index].dirty = false;
            self.blocks[block_index].commit_points = [self.slab_journal_point; SECTORS_PER_BLOCK];
            written += 1;
        }
        if written > 0 {
            debug!(
                slab = self.slab_number,
                blocks = written,
                "wrote dirty reference blocks"
            );
        }
        Ok(written)
    }

    /// Writes every reference block regardless of dirtiness.
    pub fn save_all(&mut self, io: &dyn FileIo) -> Result<()> {
        self.mark_all_dirty();
        self.save_dirty_blocks(io)?;
        Ok(())
    }

    /// Reads all reference blocks back from disk, replacing in-memory
    /// state. Provisional counters never survive a restart: any counter
    /// equal to [`PROVISIONAL_REFERENCE`] is converted to empty.
    pub fn load(&mut self, io: &dyn FileIo) -> Result<()> {
        let data_blocks = self.counters.len();
        let mut provisional_cleared = 0u64;
        let mut highest_point = JournalPoint::default();
        let mut buf = vec![0u8; BLOCK_SIZE];

        for block_index in 0..self.blocks.len() {
            let offset = (self.origin.0 + block_index as u64) * BLOCK_SIZE as u64;
            io.read_at(offset, &mut buf)?;
            let block = &mut self.blocks[block_index];
            block.allocated_count = 0;
            block.dirty = false;
            for sector in 0..SECTORS_PER_BLOCK {
                let sector_base = sector * SECTOR_SIZE;
                let mut cursor = &buf[sector_base..sector_base + 8];
                let point = JournalPoint::decode_packed(cursor.get_u64_le());
                block.commit_points[sector] = point;
                highest_point = highest_point.max(point);

                let counter_base = block_index * COUNTS_PER_BLOCK + sector * COUNTS_PER_SECTOR;
                for offset_in_sector in 0..COUNTS_PER_SECTOR {
                    let index = counter_base + offset_in_sector;
                    if index >= data_blocks {
                        break;
                    }
                    let mut value = buf[sector_base + 8 + offset_in_sector];
                    if value == PROVISIONAL_REFERENCE {
                        value = EMPTY_REFERENCE;
                        provisional_cleared += 1;
                    }
                    self.counters[index] = value;
                    if value != EMPTY_REFERENCE {
                        block.allocated_count += 1;
                    }
                }
            }
        }

        self.free_blocks = self.counters.len() as BlockCount
            - self
                .blocks
                .iter()
                .map(|b| u64::from(b.allocated_count))
                .sum::<u64>();
        self.dirty_queue.clear();
        self.slab_journal_point = highest_point;
        self.search_cursor = 0;
        if provisional_cleared > 0 {
            debug!(
                slab = self.slab_number,
                cleared = provisional_cleared,
                "cleared provisional references at load"
            );
        }
        Ok(())
    }

    /// Resets every counter to empty without touching disk. Used when
    /// loading for rebuild.
    pub fn reset_for_rebuild(&mut self) {
        self.counters.fill(EMPTY_REFERENCE);
        for block in &mut self.blocks {
            *block = ReferenceBlock::new();
        }
        self.free_blocks = self.counters.len() as BlockCount;
        self.dirty_queue.clear();
        self.slab_journal_point = JournalPoint::default();
        self.search_cursor = 0;
    }

    /// True when any reference block is waiting to be written.
    pub fn has_dirty_blocks(&self) -> bool {
        !self.dirty_queue.is_empty()
    }
}
