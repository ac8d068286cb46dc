#![forbid(unsafe_code)]

//! # Basalt - Deduplicating Block Storage Core
//!
//! Basalt is the core of a deduplicating, thin-provisioned block-storage
//! engine: a sharded slab allocator with per-slab reference counting, and
//! the crash-recovery pipeline that reconstructs the logical-to-physical
//! map and reference counts from a recovery journal.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use basalt::primitives::io::StdFileIo;
//! use basalt::config::{ThreadCountConfig, VolumeConfig};
//! use basalt::volume::{OpenOptions, Volume};
//! use basalt::types::Lbn;
//!
//! let io = Arc::new(StdFileIo::open("volume.img")?);
//! let config = VolumeConfig {
//!     logical_blocks: 1 << 20,
//!     physical_blocks: 1 << 18,
//!     slab_size: 1 << 15,
//!     slab_journal_blocks: 8,
//!     recovery_journal_size: 64,
//! };
//! Volume::format(io.clone(), config, ThreadCountConfig::default())?;
//!
//! // Opening inspects the persisted state: a dirty volume replays its
//! // journal, a read-only one rebuilds from the block map.
//! let mut volume = Volume::open(io, ThreadCountConfig::default(), OpenOptions::default())?;
//! let pbn = volume.map_block(Lbn(0), 0)?;
//! volume.save()?;
//! # Ok::<(), basalt::types::BasaltError>(())
//! ```
//!
//! ## Architecture
//!
//! - **Slabs**: contiguous stripes of physical blocks, each with one-byte
//!   reference counters and a small circular journal of its own.
//! - **Block allocators**: one per physical zone, each owning the slabs
//!   striped to its zone and ranking them in a priority table.
//! - **Slab depot**: composes the allocators and drives fleet-wide
//!   actions (load, drain, scrub, growth) through an action manager.
//! - **Recovery**: two-mode repair; journal replay with missing-decrement
//!   synthesis after a crash, or a full rebuild from the block map when
//!   replay is impossible.

pub mod admin;
pub mod blockmap;
pub mod codec;
pub mod config;
pub mod depot;
pub mod layout;
pub mod logging;
pub mod primitives;
pub mod recovery;
pub mod slab;
pub mod statistics;
pub mod superblock;
pub mod types;
pub mod volume;

// Re-export the main public API.
pub use crate::config::{ThreadCountConfig, VolumeConfig};
pub use crate::types::{BasaltError, BlockOperation, JournalPoint, Lbn, Pbn, RecoveryPoint, Result};
pub use crate::volume::{OpenOptions, Volume};
