#![forbid(unsafe_code)]

//! Recovery journal block format and the in-memory journal runtime.
//!
//! The journal is a circular region of 4 KiB blocks. Sector 0 of each
//! block holds the packed header; sectors 1 through 7 hold eleven-byte
//! entries behind a one-byte check byte and recovery count, which is what
//! lets recovery detect a torn write at sector granularity.

use crate::blockmap::BlockMapEntry;
use crate::primitives::io::FileIo;
use crate::types::{
    BasaltError, BlockCount, BlockOperation, Pbn, RecoveryPoint, Result, SequenceNumber,
    BLOCK_SIZE, SECTORS_PER_BLOCK, SECTOR_SIZE,
};

/// Metadata type byte identifying recovery journal blocks.
pub const RECOVERY_JOURNAL_METADATA_TYPE: u8 = 1;

/// Size of one packed entry.
pub const RECOVERY_JOURNAL_ENTRY_SIZE: usize = 11;
/// Bytes of per-sector framing before the entries.
const SECTOR_HEADER_SIZE: usize = 3;
/// Entries per 512-byte sector.
pub const ENTRIES_PER_SECTOR: usize = (SECTOR_SIZE - SECTOR_HEADER_SIZE) / RECOVERY_JOURNAL_ENTRY_SIZE;
/// Entries per journal block (sectors 1..8).
pub const ENTRIES_PER_BLOCK: usize = ENTRIES_PER_SECTOR * (SECTORS_PER_BLOCK - 1);

// Header offsets within sector 0, little-endian.
const HEADER_BLOCK_MAP_HEAD: usize = 0;
const HEADER_SLAB_JOURNAL_HEAD: usize = 8;
const HEADER_SEQUENCE: usize = 16;
const HEADER_NONCE: usize = 24;
const HEADER_LOGICAL_USED: usize = 32;
const HEADER_BLOCK_MAP_BLOCKS: usize = 40;
const HEADER_ENTRY_COUNT: usize = 48;
const HEADER_CHECK_BYTE: usize = 50;
const HEADER_RECOVERY_COUNT: usize = 51;
const HEADER_METADATA_TYPE: usize = 52;

/// The check byte derived from a block's sequence number; bit 7 is always
/// set so a zeroed sector never validates.
pub fn compute_check_byte(sequence: SequenceNumber) -> u8 {
    ((sequence & 0x7F) as u8) | 0x80
}

/// Position of a mapping within the block map: a page address and a slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BlockMapSlot {
    /// The block map page.
    pub pbn: Pbn,
    /// The entry slot within that page.
    pub slot: u16,
}

/// One recovery journal entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecoveryJournalEntry {
    /// The kind of reference change.
    pub operation: BlockOperation,
    /// The block map position this change is about.
    pub slot: BlockMapSlot,
    /// The mapping being installed (increments) or removed (decrements).
    pub mapping: BlockMapEntry,
}

impl RecoveryJournalEntry {
    /// Packs into eleven bytes.
    pub fn pack(&self) -> [u8; RECOVERY_JOURNAL_ENTRY_SIZE] {
        let mut bytes = [0u8; RECOVERY_JOURNAL_ENTRY_SIZE];
        let slot = self.slot.slot;
        bytes[0] = (self.operation as u8) | (((slot & 0x3F) as u8) << 2);
        let pbn_high = ((self.slot.pbn.0 >> 32) & 0x0F) as u8;
        bytes[1] = (((slot >> 6) & 0x0F) as u8) | (pbn_high << 4);
        bytes[2..6].copy_from_slice(&((self.slot.pbn.0 & 0xFFFF_FFFF) as u32).to_le_bytes());
        bytes[6..11].copy_from_slice(&self.mapping.pack());
        bytes
    }

    /// Unpacks from eleven bytes, validating the operation code.
    pub fn unpack(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < RECOVERY_JOURNAL_ENTRY_SIZE {
            return Err(BasaltError::CorruptJournal("journal entry truncated"));
        }
        let operation = BlockOperation::from_u8(bytes[0] & 0x03)?;
        let slot = u16::from(bytes[0] >> 2) | (u16::from(bytes[1] & 0x0F) << 6);
        let pbn_high = u64::from(bytes[1] >> 4);
        let pbn_low = u64::from(u32::from_le_bytes(
            bytes[2..6].try_into().expect("slice is 4 bytes"),
        ));
        let mapping = BlockMapEntry::unpack([bytes[6], bytes[7], bytes[8], bytes[9], bytes[10]]);
        Ok(Self {
            operation,
            slot: BlockMapSlot {
                pbn: Pbn((pbn_high << 32) | pbn_low),
                slot,
            },
            mapping,
        })
    }
}

/// A decoded recovery journal block header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecoveryBlockHeader {
    /// Oldest block still needed by the block map.
    pub block_map_head: SequenceNumber,
    /// Oldest block still needed by slab journals.
    pub slab_journal_head: SequenceNumber,
    /// This block's sequence number.
    pub sequence: SequenceNumber,
    /// Volume nonce.
    pub nonce: u64,
    /// Logical blocks in use as of the start of this block.
    pub logical_blocks_used: BlockCount,
    /// Block map pages allocated as of the start of this block.
    pub block_map_data_blocks: BlockCount,
    /// Total entries the block was committed with.
    pub entry_count: u16,
    /// Recovery generation the block was written in.
    pub recovery_count: u8,
}

impl RecoveryBlockHeader {
    /// Packs the header into the front of sector 0.
    pub fn pack(&self, buf: &mut [u8]) {
        buf[HEADER_BLOCK_MAP_HEAD..HEADER_BLOCK_MAP_HEAD + 8]
            .copy_from_slice(&self.block_map_head.to_le_bytes());
        buf[HEADER_SLAB_JOURNAL_HEAD..HEADER_SLAB_JOURNAL_HEAD + 8]
            .copy_from_slice(&self.slab_journal_head.to_le_bytes());
        buf[HEADER_SEQUENCE..HEADER_SEQUENCE + 8].copy_from_slice(&self.sequence.to_le_bytes());
        buf[HEADER_NONCE..HEADER_NONCE + 8].copy_from_slice(&self.nonce.to_le_bytes());
        buf[HEADER_LOGICAL_USED..HEADER_LOGICAL_USED + 8]
            .copy_from_slice(&self.logical_blocks_used.to_le_bytes());
        buf[HEADER_BLOCK_MAP_BLOCKS..HEADER_BLOCK_MAP_BLOCKS + 8]
            .copy_from_slice(&self.block_map_data_blocks.to_le_bytes());
        buf[HEADER_ENTRY_COUNT..HEADER_ENTRY_COUNT + 2]
            .copy_from_slice(&self.entry_count.to_le_bytes());
        buf[HEADER_CHECK_BYTE] = compute_check_byte(self.sequence);
        buf[HEADER_RECOVERY_COUNT] = self.recovery_count;
        buf[HEADER_METADATA_TYPE] = RECOVERY_JOURNAL_METADATA_TYPE;
    }

    /// Unpacks a header from sector 0.
    pub fn unpack(buf: &[u8]) -> Self {
        let read_u64 = |offset: usize| {
            u64::from_le_bytes(buf[offset..offset + 8].try_into().expect("slice is 8 bytes"))
        };
        Self {
            block_map_head: read_u64(HEADER_BLOCK_MAP_HEAD),
            slab_journal_head: read_u64(HEADER_SLAB_JOURNAL_HEAD),
            sequence: read_u64(HEADER_SEQUENCE),
            nonce: read_u64(HEADER_NONCE),
            logical_blocks_used: read_u64(HEADER_LOGICAL_USED),
            block_map_data_blocks: read_u64(HEADER_BLOCK_MAP_BLOCKS),
            entry_count: u16::from_le_bytes(
                buf[HEADER_ENTRY_COUNT..HEADER_ENTRY_COUNT + 2]
                    .try_into()
                    .expect("slice is 2 bytes"),
            ),
            recovery_count: buf[HEADER_RECOVERY_COUNT],
        }
    }
}

/// What recovery accepts as blocks of this journal.
#[derive(Clone, Copy, Debug)]
pub struct JournalFilter {
    /// Volume nonce.
    pub nonce: u64,
    /// Current recovery generation.
    pub recovery_count: u8,
}

/// A decoded journal block: its header, its valid entries (each with its
/// recovery point), and whether every committed entry was recovered.
#[derive(Clone, Debug)]
pub struct DecodedRecoveryBlock {
    /// The block header.
    pub header: RecoveryBlockHeader,
    /// Valid entries in journal order.
    pub entries: Vec<(RecoveryPoint, RecoveryJournalEntry)>,
    /// True when the valid sectors yielded every committed entry.
    pub is_exact: bool,
}

/// Decodes one journal block against the filter. Returns `None` when the
/// block does not belong to this journal generation. Sector validation
/// stops at the first torn sector; entries after it are discarded.
pub fn decode_block(buf: &[u8], filter: &JournalFilter) -> Result<Option<DecodedRecoveryBlock>> {
    if buf.len() < BLOCK_SIZE {
        return Err(BasaltError::CorruptJournal("recovery block truncated"));
    }
    if buf[HEADER_METADATA_TYPE] != RECOVERY_JOURNAL_METADATA_TYPE {
        return Ok(None);
    }
    let header = RecoveryBlockHeader::unpack(buf);
    if header.nonce != filter.nonce
        || header.recovery_count != filter.recovery_count
        || header.sequence == 0
    {
        return Ok(None);
    }
    if buf[HEADER_CHECK_BYTE] != compute_check_byte(header.sequence) {
        return Ok(None);
    }
    if header.entry_count as usize > ENTRIES_PER_BLOCK {
        return Err(BasaltError::CorruptJournal(
            "recovery block entry count exceeds capacity",
        ));
    }

    let check_byte = compute_check_byte(header.sequence);
    let mut entries = Vec::new();
    let mut remaining = header.entry_count as usize;
    for sector in 1..SECTORS_PER_BLOCK {
        if remaining == 0 {
            break;
        }
        let base = sector * SECTOR_SIZE;
        if buf[base] != check_byte || buf[base + 1] != header.recovery_count {
            // Torn write: this sector (and everything after) never made it.
            break;
        }
        let sector_entries = buf[base + 2] as usize;
        if sector_entries > ENTRIES_PER_SECTOR {
            return Err(BasaltError::CorruptJournal(
                "sector entry count exceeds capacity",
            ));
        }
        let take = sector_entries.min(remaining);
        for index in 0..take {
            let offset = base + SECTOR_HEADER_SIZE + index * RECOVERY_JOURNAL_ENTRY_SIZE;
            let entry = RecoveryJournalEntry::unpack(
                &buf[offset..offset + RECOVERY_JOURNAL_ENTRY_SIZE],
            )?;
            entries.push((
                RecoveryPoint {
                    sequence: header.sequence,
                    sector: sector as u8,
                    entry: index as u8,
                },
                entry,
            ));
        }
        remaining -= take;
    }

    Ok(Some(DecodedRecoveryBlock {
        is_exact: remaining == 0,
        header,
        entries,
    }))
}

/// The in-memory journal runtime: packs entries into the tail block and
/// tracks the usage counters persisted through block headers.
#[derive(Debug)]
pub struct RecoveryJournal {
    origin: Pbn,
    size: BlockCount,
    nonce: u64,
    recovery_count: u8,
    tail: SequenceNumber,
    block_map_head: SequenceNumber,
    slab_journal_head: SequenceNumber,
    logical_blocks_used: BlockCount,
    block_map_data_blocks: BlockCount,
    /// Usage counters as of the start of the open tail block.
    logical_at_block_start: BlockCount,
    block_map_at_block_start: BlockCount,
    tail_entries: Vec<RecoveryJournalEntry>,
}

impl RecoveryJournal {
    /// Creates a journal runtime over the given region.
    pub fn new(
        origin: Pbn,
        size: BlockCount,
        nonce: u64,
        recovery_count: u8,
        journal_start: SequenceNumber,
        logical_blocks_used: BlockCount,
        block_map_data_blocks: BlockCount,
    ) -> Self {
        Self {
            origin,
            size,
            nonce,
            recovery_count,
            tail: journal_start.max(1),
            block_map_head: journal_start.max(1),
            slab_journal_head: journal_start.max(1),
            logical_blocks_used,
            block_map_data_blocks,
            logical_at_block_start: logical_blocks_used,
            block_map_at_block_start: block_map_data_blocks,
            tail_entries: Vec::new(),
        }
    }

    /// First block of the journal region.
    pub fn origin(&self) -> Pbn {
        self.origin
    }

    /// Region size in blocks.
    pub fn size(&self) -> BlockCount {
        self.size
    }

    /// Sequence of the open tail block.
    pub fn tail(&self) -> SequenceNumber {
        self.tail
    }

    /// Logical blocks referenced by clients.
    pub fn logical_blocks_used(&self) -> BlockCount {
        self.logical_blocks_used
    }

    /// Blocks holding block map pages.
    pub fn block_map_data_blocks(&self) -> BlockCount {
        self.block_map_data_blocks
    }

    /// The filter matching this journal's blocks.
    pub fn filter(&self) -> JournalFilter {
        JournalFilter {
            nonce: self.nonce,
            recovery_count: self.recovery_count,
        }
    }

    /// The persistent record for the super block.
    pub fn record_state(&self) -> crate::superblock::RecoveryJournalState {
        crate::superblock::RecoveryJournalState {
            journal_start: self.tail,
            logical_blocks_used: self.logical_blocks_used,
            block_map_data_blocks: self.block_map_data_blocks,
        }
    }

    /// Appends an entry to the open tail block, committing the block first
    /// when it is full. Returns the entry's recovery point.
    pub fn append(
        &mut self,
        io: &dyn FileIo,
        entry: RecoveryJournalEntry,
    ) -> Result<RecoveryPoint> {
        if self.tail_entries.len() >= ENTRIES_PER_BLOCK {
            self.commit_block(io)?;
        }
        let index = self.tail_entries.len();
        let point = RecoveryPoint {
            sequence: self.tail,
            sector: (index / ENTRIES_PER_SECTOR + 1) as u8,
            entry: (index % ENTRIES_PER_SECTOR) as u8,
        };
        match entry.operation {
            BlockOperation::DataIncrement => self.logical_blocks_used += 1,
            BlockOperation::DataDecrement => self.logical_blocks_used -= 1,
            BlockOperation::BlockMapIncrement => self.block_map_data_blocks += 1,
        }
        self.tail_entries.push(entry);
        Ok(point)
    }

    /// Writes the open tail block, advancing the sequence.
    pub fn commit_block(&mut self, io: &dyn FileIo) -> Result<()> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        let header = RecoveryBlockHeader {
            block_map_head: self.block_map_head,
            slab_journal_head: self.slab_journal_head,
            sequence: self.tail,
            nonce: self.nonce,
            logical_blocks_used: self.logical_at_block_start,
            block_map_data_blocks: self.block_map_at_block_start,
            entry_count: self.tail_entries.len() as u16,
            recovery_count: self.recovery_count,
        };
        header.pack(&mut buf);

        let check_byte = compute_check_byte(self.tail);
        for (index, entry) in self.tail_entries.iter().enumerate() {
            let sector = index / ENTRIES_PER_SECTOR + 1;
            let within = index % ENTRIES_PER_SECTOR;
            let base = sector * SECTOR_SIZE;
            buf[base] = check_byte;
            buf[base + 1] = self.recovery_count;
            buf[base + 2] = buf[base + 2].max(within as u8 + 1);
            let offset = base + SECTOR_HEADER_SIZE + within * RECOVERY_JOURNAL_ENTRY_SIZE;
            buf[offset..offset + RECOVERY_JOURNAL_ENTRY_SIZE].copy_from_slice(&entry.pack());
        }

        let ring_offset = (self.tail - 1) % self.size;
        io.write_at((self.origin.0 + ring_offset) * BLOCK_SIZE as u64, &buf)?;

        self.tail += 1;
        self.tail_entries.clear();
        self.logical_at_block_start = self.logical_blocks_used;
        self.block_map_at_block_start = self.block_map_data_blocks;
        Ok(())
    }

    /// Zeroes the journal region and restarts from `journal_start`. Used
    /// after a rebuild.
    pub fn reset(
        &mut self,
        io: &dyn FileIo,
        recovery_count: u8,
        journal_start: SequenceNumber,
    ) -> Result<()> {
        let zeroes = vec![0u8; BLOCK_SIZE];
        for offset in 0..self.size {
            io.write_at((self.origin.0 + offset) * BLOCK_SIZE as u64, &zeroes)?;
        }
        self.recovery_count = recovery_count;
        self.tail = journal_start.max(1);
        self.block_map_head = self.tail;
        self.slab_journal_head = self.tail;
        self.tail_entries.clear();
        self.logical_at_block_start = self.logical_blocks_used;
        self.block_map_at_block_start = self.block_map_data_blocks;
        Ok(())
    }

    /// Overrides the usage counters (recovery recomputes them).
    pub fn set_usages(&mut self, logical: BlockCount, block_map: BlockCount) {
        self.logical_blocks_used = logical;
        self.block_map_data_blocks = block_map;
        self.logical_at_block_start = logical;
        self.block_map_at_block_start = block_map;
    }

    /// Moves the heads forward; the depot's lock-release request follows.
    pub fn set_heads(&mut self, block_map_head: SequenceNumber, slab_journal_head: SequenceNumber) {
        self.block_map_head = block_map_head;
        self.slab_journal_head = slab_journal_head;
    }
}
