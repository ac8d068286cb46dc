#![forbid(unsafe_code)]

//! Core identifier types, geometry constants, and the crate error type.

use std::fmt;
use std::io;

use thiserror::Error;

pub mod checksum;

pub use self::checksum::{block_crc32, salted_digest, Checksum, Crc32Fast};

/// Size in bytes of every metadata and data block.
pub const BLOCK_SIZE: usize = 4096;
/// Size in bytes of a disk sector, the torn-write atomicity unit.
pub const SECTOR_SIZE: usize = 512;
/// Number of sectors in a block.
pub const SECTORS_PER_BLOCK: usize = BLOCK_SIZE / SECTOR_SIZE;

/// A count of blocks.
pub type BlockCount = u64;
/// A monotonically increasing journal block sequence number.
pub type SequenceNumber = u64;
/// A block offset within a single slab's data region.
pub type SlabBlockNumber = u32;
/// A count of physical zones.
pub type ZoneCount = u8;

/// Physical block number: a 64-bit address into the backing store.
///
/// The value zero is reserved and means "unmapped" (the zero block).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pbn(pub u64);

impl Pbn {
    /// The reserved zero/unmapped block address.
    pub const ZERO: Pbn = Pbn(0);

    /// Returns true if this is the reserved zero block.
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Pbn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pbn {}", self.0)
    }
}

/// Logical block number presented to clients.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lbn(pub u64);

impl fmt::Display for Lbn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lbn {}", self.0)
    }
}

/// Position of a single entry application in a journal: `(sequence, entry)`.
///
/// Ordered lexicographically; field order matters for the derived `Ord`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JournalPoint {
    /// Sequence number of the journal block.
    pub sequence: SequenceNumber,
    /// Index of the entry within the block.
    pub entry_count: u16,
}

impl JournalPoint {
    /// Packs the point into a single little-endian word for on-disk storage.
    pub fn encode_packed(self) -> u64 {
        (self.sequence << 16) | u64::from(self.entry_count)
    }

    /// Unpacks a point previously encoded with [`encode_packed`](Self::encode_packed).
    pub fn decode_packed(word: u64) -> Self {
        Self {
            sequence: word >> 16,
            entry_count: (word & 0xFFFF) as u16,
        }
    }

    /// True when this point identifies an entry at all (sequence 0 is blank).
    pub fn is_valid(self) -> bool {
        self.sequence > 0
    }
}

impl fmt::Display for JournalPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.sequence, self.entry_count)
    }
}

/// Byte-granular position in the recovery journal: `(sequence, sector, entry)`.
///
/// Sector numbers run from 1 to `SECTORS_PER_BLOCK - 1`; sector 0 holds the
/// block header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecoveryPoint {
    /// Sequence number of the recovery journal block.
    pub sequence: SequenceNumber,
    /// Sector within the block (1-based; sector 0 is the header).
    pub sector: u8,
    /// Entry index within the sector.
    pub entry: u8,
}

impl fmt::Display for RecoveryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.sequence, self.sector, self.entry)
    }
}

/// The three kinds of reference-changing operations a journal records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockOperation {
    /// Release one reference to a data block.
    DataDecrement = 0,
    /// Take one reference to a data block.
    DataIncrement = 1,
    /// Reference a block holding block-map pages.
    BlockMapIncrement = 2,
}

impl BlockOperation {
    /// Decodes the on-disk operation code.
    pub fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Self::DataDecrement,
            1 => Self::DataIncrement,
            2 => Self::BlockMapIncrement,
            _ => return Err(BasaltError::CorruptJournal("unknown journal operation")),
        })
    }

    /// True for either kind of increment.
    pub fn is_increment(self) -> bool {
        !matches!(self, Self::DataDecrement)
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, BasaltError>;

/// All error kinds surfaced by the storage core.
#[derive(Debug, Error)]
pub enum BasaltError {
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// No free block is available at this time.
    #[error("no free blocks available")]
    NoSpace,
    /// A physical block number fell outside the configured data range.
    #[error("out of range: {0}")]
    OutOfRange(&'static str),
    /// An illegal reference count transition was requested.
    #[error("invalid reference count transition: {0}")]
    RefCountInvalid(String),
    /// Structural damage detected in a journal.
    #[error("corrupt journal: {0}")]
    CorruptJournal(&'static str),
    /// A block map page or entry is not usable.
    #[error("bad mapping: {0}")]
    BadMapping(&'static str),
    /// A stored checksum did not match the recomputed one.
    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(&'static str),
    /// A version number did not match what this build understands.
    #[error("unsupported version: {0}")]
    UnsupportedVersion(String),
    /// A component header carried the wrong identifier.
    #[error("incorrect component: {0}")]
    IncorrectComponent(&'static str),
    /// Caller-supplied geometry is internally inconsistent.
    #[error("bad configuration: {0}")]
    BadConfiguration(String),
    /// A growth request would not add at least one slab.
    #[error("requested growth too small to add a slab")]
    IncrementTooSmall,
    /// The volume is in read-only mode; mutation is prohibited.
    #[error("volume is read-only")]
    ReadOnly,
    /// Caller-supplied geometry disagrees with on-disk state.
    #[error("parameter mismatch: {0}")]
    ParameterMismatch(String),
    /// An operation was requested in an admin state that forbids it.
    #[error("invalid admin state: {0}")]
    InvalidAdminState(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn journal_point_order_is_lexicographic() {
        let a = JournalPoint {
            sequence: 11,
            entry_count: 42,
        };
        let b = JournalPoint {
            sequence: 11,
            entry_count: 43,
        };
        let c = JournalPoint {
            sequence: 12,
            entry_count: 0,
        };
        assert!(a < b);
        assert!(b < c);
        assert!(a < c);
    }

    #[test]
    fn journal_point_packed_roundtrip() {
        let point = JournalPoint {
            sequence: 0x1234_5678_9ABC,
            entry_count: 321,
        };
        assert_eq!(JournalPoint::decode_packed(point.encode_packed()), point);
    }

    #[test]
    fn recovery_point_order() {
        let a = RecoveryPoint {
            sequence: 5,
            sector: 7,
            entry: 45,
        };
        let b = RecoveryPoint {
            sequence: 6,
            sector: 1,
            entry: 0,
        };
        assert!(a < b);
        let c = RecoveryPoint {
            sequence: 5,
            sector: 7,
            entry: 44,
        };
        assert!(c < a);
    }

    #[test]
    fn zero_pbn_is_reserved() {
        assert!(Pbn::ZERO.is_zero());
        assert!(!Pbn(1).is_zero());
    }
}
