#![forbid(unsafe_code)]

//! Crash recovery: the journal format, the replay driver, and the full
//! rebuild fallback.

pub mod journal;
pub mod rebuild;
pub mod repair;

pub use self::journal::{
    decode_block, BlockMapSlot, DecodedRecoveryBlock, JournalFilter, RecoveryBlockHeader,
    RecoveryJournal, RecoveryJournalEntry,
};
pub use self::rebuild::{rebuild, RebuildOutcome};
pub use self::repair::{journal_point_for, rebuild_block_map, repair, NumberedBlockMapping, RepairOutcome};
