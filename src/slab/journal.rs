#![forbid(unsafe_code)]

//! The per-slab journal: a circular log of reference-count changes stored
//! in the last blocks of the slab.
//!
//! Each journal block packs a header and up to a type-dependent number of
//! three-byte entries. Blocks carrying block-map increments sacrifice some
//! entry capacity for a trailing flag-bit area ("data-only" vs "full"
//! form). The journal also records, per block, the oldest recovery-journal
//! sequence number it holds entries for; the depot uses these locks to
//! decide when recovery-journal blocks may be reused.

use std::collections::BTreeMap;

use bytes::Buf;
use tracing::{debug, trace};

use crate::primitives::io::FileIo;
use crate::primitives::waitq::WaitQueue;
use crate::types::{
    BasaltError, BlockCount, BlockOperation, JournalPoint, Pbn, Result, SequenceNumber,
    SlabBlockNumber, BLOCK_SIZE,
};

/// Metadata type byte identifying slab journal blocks.
pub const SLAB_JOURNAL_METADATA_TYPE: u8 = 2;

/// Packed header size of a slab journal block.
pub const SLAB_JOURNAL_HEADER_SIZE: usize = 40;
/// Bytes available for entries (and flag bits) after the header.
pub const SLAB_JOURNAL_PAYLOAD_SIZE: usize = BLOCK_SIZE - SLAB_JOURNAL_HEADER_SIZE;
/// Size of one packed entry.
pub const SLAB_JOURNAL_ENTRY_SIZE: usize = 3;

const fn max_entries_with_flags(payload: usize) -> usize {
    let mut entries = payload / SLAB_JOURNAL_ENTRY_SIZE;
    while SLAB_JOURNAL_ENTRY_SIZE * entries + (entries + 7) / 8 > payload {
        entries -= 1;
    }
    entries
}

/// Entries per block when no block-map increments are present ("full").
pub const FULL_ENTRIES_PER_BLOCK: usize = SLAB_JOURNAL_PAYLOAD_SIZE / SLAB_JOURNAL_ENTRY_SIZE;
/// Entries per block when the flag area is needed.
pub const ENTRIES_PER_BLOCK_WITH_FLAGS: usize = max_entries_with_flags(SLAB_JOURNAL_PAYLOAD_SIZE);
const FLAG_AREA_SIZE: usize = (ENTRIES_PER_BLOCK_WITH_FLAGS + 7) / 8;

// Header field offsets, little-endian.
const HEADER_HEAD: usize = 0;
const HEADER_SEQUENCE: usize = 8;
const HEADER_RECOVERY_SEQUENCE: usize = 16;
const HEADER_RECOVERY_ENTRY: usize = 24;
const HEADER_NONCE: usize = 26;
const HEADER_METADATA_TYPE: usize = 34;
const HEADER_HAS_BLOCK_MAP: usize = 35;
const HEADER_ENTRY_COUNT: usize = 36;

/// One reference-count change recorded in a slab journal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlabJournalEntry {
    /// Offset of the affected block within the slab's data region.
    pub sbn: SlabBlockNumber,
    /// What kind of change this is.
    pub operation: BlockOperation,
}

/// A decoded journal block.
#[derive(Clone, Debug)]
pub struct DecodedJournalBlock {
    /// Sequence number of this block.
    pub sequence: SequenceNumber,
    /// Head recorded when the block was written.
    pub head: SequenceNumber,
    /// Recovery-journal point of the last entry in the block.
    pub recovery_point: JournalPoint,
    /// The entries, in application order.
    pub entries: Vec<SlabJournalEntry>,
}

/// Result of committing the tail block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TailCommit {
    /// Sequence number of the block just written.
    pub sequence: SequenceNumber,
    /// Ring offset (in blocks) the block was written at.
    pub offset: BlockCount,
}

/// Outcome of attempting to add an entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddResult {
    /// The entry was packed; apply the reference change at this point.
    Added(JournalPoint),
    /// The journal is at its blocking threshold; the entry is parked.
    Blocked,
}

#[derive(Clone, Copy, Debug)]
struct PendingEntry {
    entry: SlabJournalEntry,
    recovery_point: JournalPoint,
}

/// The circular journal of one slab.
#[derive(Debug)]
pub struct SlabJournal {
    slab_number: usize,
    origin: Pbn,
    size: BlockCount,
    flushing_threshold: BlockCount,
    blocking_threshold: BlockCount,
    nonce: u64,
    head: SequenceNumber,
    tail: SequenceNumber,
    tail_entries: Vec<SlabJournalEntry>,
    tail_first_recovery: Option<JournalPoint>,
    /// Recovery-journal point of the most recently added entry.
    recovery_point: JournalPoint,
    /// Per committed block: the recovery-journal sequence it locks.
    locks: BTreeMap<SequenceNumber, SequenceNumber>,
    waiters: WaitQueue<PendingEntry>,
}

impl SlabJournal {
    /// Creates a blank journal of `size` blocks starting at `origin`.
    pub fn new(
        slab_number: usize,
        origin: Pbn,
        size: BlockCount,
        flushing_threshold: BlockCount,
        blocking_threshold: BlockCount,
        nonce: u64,
    ) -> Self {
        Self {
            slab_number,
            origin,
            size,
            flushing_threshold,
            blocking_threshold,
            nonce,
            head: 0,
            tail: 0,
            tail_entries: Vec::new(),
            tail_first_recovery: None,
            recovery_point: JournalPoint::default(),
            locks: BTreeMap::new(),
            waiters: WaitQueue::new(),
        }
    }

    /// A blank journal belongs to a slab that has never been written.
    pub fn is_blank(&self) -> bool {
        self.head == 0 && self.tail == 0
    }

    /// Sequence of the oldest block still holding live entries.
    pub fn head(&self) -> SequenceNumber {
        self.head
    }

    /// Sequence of the block currently being filled.
    pub fn tail(&self) -> SequenceNumber {
        self.tail
    }

    /// Recovery-journal point of the most recently added entry.
    pub fn recovery_point(&self) -> JournalPoint {
        self.recovery_point
    }

    /// Committed blocks not yet released.
    pub fn blocks_in_use(&self) -> BlockCount {
        if self.is_blank() {
            0
        } else {
            self.tail - self.head
        }
    }

    /// True once enough blocks are unreleased that a flush is wanted.
    pub fn requires_flushing(&self) -> bool {
        self.blocks_in_use() >= self.flushing_threshold
    }

    /// Number of entries parked at the blocking threshold.
    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    /// Starts a blank journal at sequence one.
    pub fn open(&mut self) {
        debug_assert!(self.is_blank());
        self.head = 1;
        self.tail = 1;
    }

    /// Clears in-memory tail state after scrubbing; the applied blocks are
    /// logically released but the sequence keeps advancing.
    pub fn reopen(&mut self) {
        self.tail_entries.clear();
        self.tail_first_recovery = None;
        self.locks.clear();
        if self.is_blank() {
            self.open();
        } else {
            self.head = self.tail;
        }
    }

    fn ring_offset(&self, sequence: SequenceNumber) -> BlockCount {
        (sequence - 1) % self.size
    }

    fn tail_capacity(&self, adding_block_map: bool) -> usize {
        let has_flags = adding_block_map
            || self
                .tail_entries
                .iter()
                .any(|e| e.operation == BlockOperation::BlockMapIncrement);
        if has_flags {
            ENTRIES_PER_BLOCK_WITH_FLAGS
        } else {
            FULL_ENTRIES_PER_BLOCK
        }
    }

    /// Adds an entry, committing the tail block first when it is full.
    /// Returns [`AddResult::Blocked`] and parks the entry once the blocking
    /// threshold is reached.
    pub fn add_entry(
        &mut self,
        io: &dyn FileIo,
        entry: SlabJournalEntry,
        recovery_point: JournalPoint,
    ) -> Result<AddResult> {
        if self.is_blank() {
            self.open();
        }
        if self.blocks_in_use() >= self.blocking_threshold {
            self.waiters.enqueue(PendingEntry {
                entry,
                recovery_point,
            });
            trace!(
                slab = self.slab_number,
                "slab journal at blocking threshold; entry parked"
            );
            return Ok(AddResult::Blocked);
        }
        let block_map = entry.operation == BlockOperation::BlockMapIncrement;
        if self.tail_entries.len() >= self.tail_capacity(block_map) {
            self.commit_tail(io)?;
            if self.blocks_in_use() >= self.blocking_threshold {
                self.waiters.enqueue(PendingEntry {
                    entry,
                    recovery_point,
                });
                return Ok(AddResult::Blocked);
            }
        }
        let point = JournalPoint {
            sequence: self.tail,
            entry_count: self.tail_entries.len() as u16,
        };
        self.tail_entries.push(entry);
        if self.tail_first_recovery.is_none() {
            self.tail_first_recovery = Some(recovery_point);
        }
        self.recovery_point = self.recovery_point.max(recovery_point);
        Ok(AddResult::Added(point))
    }

    /// Writes the tail block if it holds any entries.
    pub fn commit_tail(&mut self, io: &dyn FileIo) -> Result<Option<TailCommit>> {
        if self.tail_entries.is_empty() {
            return Ok(None);
        }
        let offset = self.ring_offset(self.tail);
        let buf = self.pack_tail();
        io.write_at((self.origin.0 + offset) * BLOCK_SIZE as u64, &buf)?;

        let locked = self
            .tail_first_recovery
            .map(|p| p.sequence)
            .unwrap_or(self.recovery_point.sequence);
        self.locks.insert(self.tail, locked);

        let commit = TailCommit {
            sequence: self.tail,
            offset,
        };
        debug!(
            slab = self.slab_number,
            sequence = commit.sequence,
            offset = commit.offset,
            entries = self.tail_entries.len(),
            "committed slab journal block"
        );
        self.tail += 1;
        self.tail_entries.clear();
        self.tail_first_recovery = None;
        Ok(Some(commit))
    }

    fn pack_tail(&self) -> Vec<u8> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        let has_block_map = self
            .tail_entries
            .iter()
            .any(|e| e.operation == BlockOperation::BlockMapIncrement);

        buf[HEADER_HEAD..HEADER_HEAD + 8].copy_from_slice(&self.head.to_le_bytes());
        buf[HEADER_SEQUENCE..HEADER_SEQUENCE + 8].copy_from_slice(&self.tail.to_le_bytes());
        buf[HEADER_RECOVERY_SEQUENCE..HEADER_RECOVERY_SEQUENCE + 8]
            .copy_from_slice(&self.recovery_point.sequence.to_le_bytes());
        buf[HEADER_RECOVERY_ENTRY..HEADER_RECOVERY_ENTRY + 2]
            .copy_from_slice(&self.recovery_point.entry_count.to_le_bytes());
        buf[HEADER_NONCE..HEADER_NONCE + 8].copy_from_slice(&self.nonce.to_le_bytes());
        buf[HEADER_METADATA_TYPE] = SLAB_JOURNAL_METADATA_TYPE;
        buf[HEADER_HAS_BLOCK_MAP] = u8::from(has_block_map);
        buf[HEADER_ENTRY_COUNT..HEADER_ENTRY_COUNT + 2]
            .copy_from_slice(&(self.tail_entries.len() as u16).to_le_bytes());

        for (index, entry) in self.tail_entries.iter().enumerate() {
            let base = SLAB_JOURNAL_HEADER_SIZE + index * SLAB_JOURNAL_ENTRY_SIZE;
            let increment = entry.operation.is_increment();
            buf[base] = (entry.sbn & 0xFF) as u8;
            buf[base + 1] = ((entry.sbn >> 8) & 0xFF) as u8;
            buf[base + 2] = (((entry.sbn >> 16) & 0x7F) as u8) | (u8::from(increment) << 7);
            if entry.operation == BlockOperation::BlockMapIncrement {
                let flag_base = BLOCK_SIZE - FLAG_AREA_SIZE;
                buf[flag_base + index / 8] |= 1 << (index % 8);
            }
        }
        buf
    }

    /// Decodes one journal block; `None` when the block does not belong to
    /// this journal (wrong nonce or type, or never written).
    pub fn decode_block(&self, buf: &[u8]) -> Result<Option<DecodedJournalBlock>> {
        if buf.len() < BLOCK_SIZE {
            return Err(BasaltError::CorruptJournal("slab journal block truncated"));
        }
        let mut nonce_bytes = &buf[HEADER_NONCE..HEADER_NONCE + 8];
        let nonce = nonce_bytes.get_u64_le();
        if buf[HEADER_METADATA_TYPE] != SLAB_JOURNAL_METADATA_TYPE || nonce != self.nonce {
            return Ok(None);
        }
        let mut cursor = &buf[HEADER_SEQUENCE..HEADER_SEQUENCE + 8];
        let sequence = cursor.get_u64_le();
        if sequence == 0 {
            return Ok(None);
        }
        let mut cursor = &buf[HEADER_HEAD..HEADER_HEAD + 8];
        let head = cursor.get_u64_le();
        let mut cursor = &buf[HEADER_RECOVERY_SEQUENCE..HEADER_RECOVERY_SEQUENCE + 8];
        let recovery_sequence = cursor.get_u64_le();
        let mut cursor = &buf[HEADER_RECOVERY_ENTRY..HEADER_RECOVERY_ENTRY + 2];
        let recovery_entry = cursor.get_u16_le();
        let mut cursor = &buf[HEADER_ENTRY_COUNT..HEADER_ENTRY_COUNT + 2];
        let entry_count = cursor.get_u16_le() as usize;
        let has_block_map = buf[HEADER_HAS_BLOCK_MAP] != 0;

        let capacity = if has_block_map {
            ENTRIES_PER_BLOCK_WITH_FLAGS
        } else {
            FULL_ENTRIES_PER_BLOCK
        };
        if entry_count > capacity {
            return Err(BasaltError::CorruptJournal(
                "slab journal entry count exceeds block capacity",
            ));
        }

        let mut entries = Vec::with_capacity(entry_count);
        for index in 0..entry_count {
            let base = SLAB_JOURNAL_HEADER_SIZE + index * SLAB_JOURNAL_ENTRY_SIZE;
            let sbn = u32::from(buf[base])
                | (u32::from(buf[base + 1]) << 8)
                | (u32::from(buf[base + 2] & 0x7F) << 16);
            let increment = buf[base + 2] & 0x80 != 0;
            let flagged = has_block_map && {
                let flag_base = BLOCK_SIZE - FLAG_AREA_SIZE;
                buf[flag_base + index / 8] & (1 << (index % 8)) != 0
            };
            let operation = match (increment, flagged) {
                (true, true) => BlockOperation::BlockMapIncrement,
                (true, false) => BlockOperation::DataIncrement,
                (false, false) => BlockOperation::DataDecrement,
                (false, true) => {
                    return Err(BasaltError::CorruptJournal(
                        "block map flag on a decrement entry",
                    ));
                }
            };
            entries.push(SlabJournalEntry { sbn, operation });
        }

        Ok(Some(DecodedJournalBlock {
            sequence,
            head,
            recovery_point: JournalPoint {
                sequence: recovery_sequence,
                entry_count: recovery_entry,
            },
            entries,
        }))
    }

    /// Scans the on-disk ring and restores head/tail from the highest valid
    /// block. Leaves the journal blank when nothing valid is found.
    pub fn load_tail(&mut self, io: &dyn FileIo) -> Result<()> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        let mut newest: Option<DecodedJournalBlock> = None;
        for offset in 0..self.size {
            io.read_at((self.origin.0 + offset) * BLOCK_SIZE as u64, &mut *buf)?;
            if let Some(block) = self.decode_block(&buf)? {
                if newest.as_ref().map_or(true, |b| b.sequence < block.sequence) {
                    newest = Some(block);
                }
            }
        }
        if let Some(block) = newest {
            self.head = block.head;
            self.tail = block.sequence + 1;
            self.recovery_point = block.recovery_point;
        }
        Ok(())
    }

    /// Reads the contiguous run of valid blocks from head to tail, in
    /// application order. Fails when a block in the run is missing or has
    /// the wrong sequence.
    pub fn read_live_blocks(&self, io: &dyn FileIo) -> Result<Vec<DecodedJournalBlock>> {
        let mut scratch = vec![0u8; BLOCK_SIZE];
        self.read_live_blocks_into(io, &mut scratch)
    }

    /// As [`read_live_blocks`](Self::read_live_blocks), reading through a
    /// caller-supplied scratch buffer (typically a pooled one).
    pub fn read_live_blocks_into(
        &self,
        io: &dyn FileIo,
        scratch: &mut [u8],
    ) -> Result<Vec<DecodedJournalBlock>> {
        let mut blocks = Vec::new();
        if self.is_blank() {
            return Ok(blocks);
        }
        let buf = scratch;
        for sequence in self.head..self.tail {
            let offset = self.ring_offset(sequence);
            io.read_at((self.origin.0 + offset) * BLOCK_SIZE as u64, &mut *buf)?;
            let block = self
                .decode_block(&buf)?
                .ok_or(BasaltError::CorruptJournal("expected slab journal block"))?;
            if block.sequence != sequence {
                return Err(BasaltError::CorruptJournal(
                    "slab journal sequence out of order",
                ));
            }
            blocks.push(block);
        }
        Ok(blocks)
    }

    /// Releases every block whose locked recovery-journal sequence is at or
    /// before `recovery_sequence`, advancing the head, then retries parked
    /// entries. Returns the entries that were added, with their points, so
    /// the caller can apply them to the reference counters.
    pub fn release_recovery_journal_lock(
        &mut self,
        io: &dyn FileIo,
        recovery_sequence: SequenceNumber,
    ) -> Result<Vec<(SlabJournalEntry, JournalPoint)>> {
        self.locks.retain(|_, locked| *locked > recovery_sequence);
        if !self.is_blank() {
            self.head = self.locks.keys().next().copied().unwrap_or(self.tail);
        }
        self.retry_waiters(io)
    }

    fn retry_waiters(&mut self, io: &dyn FileIo) -> Result<Vec<(SlabJournalEntry, JournalPoint)>> {
        let mut added = Vec::new();
        let mut pending = WaitQueue::new();
        self.waiters.transfer_to(&mut pending);
        let mut parked: Vec<PendingEntry> = Vec::new();
        pending.notify_all(|waiter| parked.push(waiter));
        for waiter in parked {
            match self.add_entry(io, waiter.entry, waiter.recovery_point)? {
                AddResult::Added(point) => added.push((waiter.entry, point)),
                AddResult::Blocked => {}
            }
        }
        Ok(added)
    }

    /// Drops all parked entries, failing each with read-only semantics.
    /// Returns how many were aborted.
    pub fn abort_waiters(&mut self) -> usize {
        self.waiters.notify_all(|_| {})
    }

    /// Appends an entry during recovery replay. Replay bypasses the
    /// blocking threshold (nothing will release locks until recovery
    /// finishes) but must never overwrite the ring; the caller absorbs the
    /// oldest block when `RingFull` is returned.
    pub fn append_replay(
        &mut self,
        io: &dyn FileIo,
        entry: SlabJournalEntry,
        recovery_point: JournalPoint,
    ) -> Result<super::ReplayAppend> {
        if self.is_blank() {
            self.open();
        }
        let block_map = entry.operation == BlockOperation::BlockMapIncrement;
        if self.tail_entries.len() >= self.tail_capacity(block_map) {
            if self.blocks_in_use() >= self.size {
                return Ok(super::ReplayAppend::RingFull);
            }
            self.commit_tail(io)?;
        }
        let point = JournalPoint {
            sequence: self.tail,
            entry_count: self.tail_entries.len() as u16,
        };
        self.tail_entries.push(entry);
        if self.tail_first_recovery.is_none() {
            self.tail_first_recovery = Some(recovery_point);
        }
        self.recovery_point = self.recovery_point.max(recovery_point);
        Ok(super::ReplayAppend::Added(point))
    }

    /// Reads and decodes the block with the given sequence number.
    pub fn read_block(&self, io: &dyn FileIo, sequence: SequenceNumber) -> Result<DecodedJournalBlock> {
        let offset = self.ring_offset(sequence);
        let mut buf = vec![0u8; BLOCK_SIZE];
        io.read_at((self.origin.0 + offset) * BLOCK_SIZE as u64, &mut buf)?;
        let block = self
            .decode_block(&buf)?
            .ok_or(BasaltError::CorruptJournal("expected slab journal block"))?;
        if block.sequence != sequence {
            return Err(BasaltError::CorruptJournal(
                "slab journal sequence out of order",
            ));
        }
        Ok(block)
    }

    /// Releases the head block unconditionally.
    pub fn advance_head(&mut self) {
        self.locks.remove(&self.head);
        self.head += 1;
    }

    /// Zeroes the on-disk ring and resets to blank. Used when loading for
    /// rebuild, where journal contents are discarded wholesale.
    pub fn erase(&mut self, io: &dyn FileIo) -> Result<()> {
        let zeroes = vec![0u8; BLOCK_SIZE];
        for offset in 0..self.size {
            io.write_at((self.origin.0 + offset) * BLOCK_SIZE as u64, &zeroes)?;
        }
        self.head = 0;
        self.tail = 0;
        self.tail_entries.clear();
        self.tail_first_recovery = None;
        self.recovery_point = JournalPoint::default();
        self.locks.clear();
        self.waiters = WaitQueue::new();
        Ok(())
    }
}
