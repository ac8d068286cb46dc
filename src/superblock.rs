#![forbid(unsafe_code)]

//! Super-block and geometry codecs.
//!
//! The super block is the versioned root of all persistent component
//! state. Its entire encoding (header, payload, checksum) must fit inside
//! one sector so a torn write can never leave a half-updated super block:
//! either the old sector or the new one is read back intact, and anything
//! else fails the checksum.

use bytes::{Buf, BufMut};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::codec::{ensure_remaining, ComponentHeader, ComponentId, VersionNumber};
use crate::config::VolumeConfig;
use crate::layout::FixedLayout;
use crate::types::{
    block_crc32, BasaltError, BlockCount, Pbn, Result, SequenceNumber, BLOCK_SIZE, SECTOR_SIZE,
};

/// Version of the super-block framing itself.
pub const SUPER_BLOCK_VERSION: VersionNumber = VersionNumber::new(12, 0);
/// Version of the whole volume format.
pub const VOLUME_VERSION: VersionNumber = VersionNumber::new(1, 0);
/// Version of the packed volume component.
pub const VOLUME_COMPONENT_VERSION: VersionNumber = VersionNumber::new(41, 0);
/// Version of the recovery journal state record.
pub const JOURNAL_STATE_VERSION: VersionNumber = VersionNumber::new(7, 0);
/// Version of the slab depot state record.
pub const DEPOT_STATE_VERSION: VersionNumber = VersionNumber::new(2, 0);
/// Version of the block map state record.
pub const BLOCK_MAP_STATE_VERSION: VersionNumber = VersionNumber::new(2, 0);

/// Release version stamped into the geometry and super block; both copies
/// must agree at load time.
pub const CURRENT_RELEASE_VERSION: u32 = 131_337;

/// Block offset of the geometry block.
pub const GEOMETRY_BLOCK_OFFSET: u64 = 0;
/// Block offset of the super block.
pub const SUPER_BLOCK_OFFSET: u64 = 1;

const GEOMETRY_MAGIC: &[u8; 8] = b"BSLTGEO\0";

/// Lifecycle state of the whole volume, persisted in the super block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum VolumeState {
    /// Freshly formatted, never mounted.
    New = 0,
    /// Cleanly shut down.
    Clean = 1,
    /// Mounted and in use (or crashed while in use).
    Dirty = 2,
    /// Crash recovery is in progress.
    Recovering = 3,
    /// Recovery is replaying the journal.
    Replaying = 4,
    /// The volume latched read-only after an error.
    ReadOnly = 5,
    /// An operator requested a full rebuild.
    ForceRebuild = 6,
    /// A rebuild is in progress.
    Rebuilding = 7,
}

impl VolumeState {
    /// Decodes the persisted state word.
    pub fn from_u32(value: u32) -> Result<Self> {
        Ok(match value {
            0 => Self::New,
            1 => Self::Clean,
            2 => Self::Dirty,
            3 => Self::Recovering,
            4 => Self::Replaying,
            5 => Self::ReadOnly,
            6 => Self::ForceRebuild,
            7 => Self::Rebuilding,
            _ => {
                return Err(BasaltError::IncorrectComponent("unknown volume state"));
            }
        })
    }

    /// True when the state calls for journal replay at load.
    pub fn requires_recovery(self) -> bool {
        matches!(self, Self::Dirty | Self::Recovering | Self::Replaying)
    }

    /// True when the state calls for a full rebuild at load.
    pub fn requires_rebuild(self) -> bool {
        matches!(self, Self::ForceRebuild | Self::Rebuilding | Self::ReadOnly)
    }
}

/// Shared atomic cell holding the current [`VolumeState`].
///
/// The only cross-zone compare-exchange in the engine lives here: the last
/// zone to finish scrubbing flips `Recovering` to `Dirty`.
#[derive(Debug)]
pub struct VolumeStateCell {
    state: AtomicU32,
}

impl VolumeStateCell {
    /// Creates a cell holding `state`.
    pub fn new(state: VolumeState) -> Self {
        Self {
            state: AtomicU32::new(state as u32),
        }
    }

    /// Current state.
    pub fn load(&self) -> VolumeState {
        VolumeState::from_u32(self.state.load(Ordering::Acquire)).expect("cell holds valid state")
    }

    /// Unconditionally sets the state.
    pub fn store(&self, state: VolumeState) {
        self.state.store(state as u32, Ordering::Release);
    }

    /// Atomically replaces `current` with `next`; returns whether the swap
    /// happened.
    pub fn compare_exchange(&self, current: VolumeState, next: VolumeState) -> bool {
        self.state
            .compare_exchange(
                current as u32,
                next as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// The geometry block at the very start of the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GeometryBlock {
    /// Release version; must match the super block's copy.
    pub release_version: u32,
    /// Volume nonce salted into every metadata checksum.
    pub nonce: u64,
}

impl GeometryBlock {
    /// Encodes into a full block.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(BLOCK_SIZE);
        buf.extend_from_slice(GEOMETRY_MAGIC);
        buf.put_u32_le(self.release_version);
        buf.put_u64_le(self.nonce);
        let crc = block_crc32(self.nonce, &buf);
        buf.put_u32_le(crc);
        buf.resize(BLOCK_SIZE, 0);
        buf
    }

    /// Decodes and validates a geometry block.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 24 {
            return Err(BasaltError::IncorrectComponent("geometry block truncated"));
        }
        if &buf[..8] != GEOMETRY_MAGIC {
            return Err(BasaltError::IncorrectComponent("geometry magic mismatch"));
        }
        let mut cursor = &buf[8..];
        let release_version = cursor.get_u32_le();
        let nonce = cursor.get_u64_le();
        let stored_crc = cursor.get_u32_le();
        if block_crc32(nonce, &buf[..20]) != stored_crc {
            return Err(BasaltError::ChecksumMismatch("geometry block"));
        }
        Ok(Self {
            release_version,
            nonce,
        })
    }
}

/// Persistent recovery-journal state (version 7.0).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryJournalState {
    /// Sequence number the journal will continue from.
    pub journal_start: SequenceNumber,
    /// Logical blocks referenced by clients.
    pub logical_blocks_used: BlockCount,
    /// Blocks holding block-map pages.
    pub block_map_data_blocks: BlockCount,
}

impl RecoveryJournalState {
    /// Appends the framed record.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        ComponentHeader {
            id: ComponentId::RecoveryJournal,
            version: JOURNAL_STATE_VERSION,
            size: 24,
        }
        .encode(buf);
        buf.put_u64_le(self.journal_start);
        buf.put_u64_le(self.logical_blocks_used);
        buf.put_u64_le(self.block_map_data_blocks);
    }

    /// Reads and validates the framed record.
    pub fn decode(buf: &mut &[u8]) -> Result<Self> {
        let header = ComponentHeader::decode(buf)?;
        header.validate(ComponentId::RecoveryJournal, JOURNAL_STATE_VERSION, 24)?;
        ensure_remaining(buf, 24, "recovery journal state truncated")?;
        Ok(Self {
            journal_start: buf.get_u64_le(),
            logical_blocks_used: buf.get_u64_le(),
            block_map_data_blocks: buf.get_u64_le(),
        })
    }
}

/// Persistent block-map state (version 2.0).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockMapState {
    /// First root page.
    pub root_origin: Pbn,
    /// Number of root pages.
    pub root_count: BlockCount,
}

impl BlockMapState {
    /// Appends the framed record.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        ComponentHeader {
            id: ComponentId::BlockMap,
            version: BLOCK_MAP_STATE_VERSION,
            size: 16,
        }
        .encode(buf);
        buf.put_u64_le(self.root_origin.0);
        buf.put_u64_le(self.root_count);
    }

    /// Reads and validates the framed record.
    pub fn decode(buf: &mut &[u8]) -> Result<Self> {
        let header = ComponentHeader::decode(buf)?;
        header.validate(ComponentId::BlockMap, BLOCK_MAP_STATE_VERSION, 16)?;
        ensure_remaining(buf, 16, "block map state truncated")?;
        Ok(Self {
            root_origin: Pbn(buf.get_u64_le()),
            root_count: buf.get_u64_le(),
        })
    }
}

/// The packed volume component: state word, recovery counters, config,
/// and nonce (version 41.0).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VolumeComponent {
    /// Volume lifecycle state.
    pub state: VolumeState,
    /// Successful crash recoveries so far.
    pub complete_recoveries: u64,
    /// Forced rebuilds after read-only transitions.
    pub read_only_recoveries: u64,
    /// The validated volume geometry.
    pub config: VolumeConfig,
    /// Volume nonce.
    pub nonce: u64,
}

impl VolumeComponent {
    const PAYLOAD_SIZE: u64 = 4 + 8 + 8 + crate::config::VOLUME_CONFIG_SIZE as u64 + 8;

    /// Appends the framed record.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        ComponentHeader {
            id: ComponentId::VolumeComponent,
            version: VOLUME_COMPONENT_VERSION,
            size: Self::PAYLOAD_SIZE,
        }
        .encode(buf);
        buf.put_u32_le(self.state as u32);
        buf.put_u64_le(self.complete_recoveries);
        buf.put_u64_le(self.read_only_recoveries);
        self.config.encode(buf);
        buf.put_u64_le(self.nonce);
    }

    /// Reads and validates the framed record.
    pub fn decode(buf: &mut &[u8]) -> Result<Self> {
        let header = ComponentHeader::decode(buf)?;
        header.validate(
            ComponentId::VolumeComponent,
            VOLUME_COMPONENT_VERSION,
            Self::PAYLOAD_SIZE,
        )?;
        ensure_remaining(buf, 4, "volume component truncated")?;
        let state = VolumeState::from_u32(buf.get_u32_le())?;
        ensure_remaining(buf, 16, "volume component truncated")?;
        let complete_recoveries = buf.get_u64_le();
        let read_only_recoveries = buf.get_u64_le();
        let config = VolumeConfig::decode(buf)?;
        ensure_remaining(buf, 8, "volume component truncated")?;
        let nonce = buf.get_u64_le();
        Ok(Self {
            state,
            complete_recoveries,
            read_only_recoveries,
            config,
            nonce,
        })
    }
}

/// Persistent slab-depot state (version 2.0); defined here as a plain
/// record so the codec layer has no dependency on the depot internals.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlabDepotState {
    /// Geometry of every slab.
    pub slab_config: crate::slab::SlabConfig,
    /// First block of the depot partition.
    pub first_block: Pbn,
    /// One past the last block of the depot partition.
    pub last_block: Pbn,
    /// Number of physical zones.
    pub zone_count: u8,
}

impl SlabDepotState {
    const PAYLOAD_SIZE: u64 = crate::slab::SLAB_CONFIG_SIZE as u64 + 8 + 8 + 1;

    /// Appends the framed record.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        ComponentHeader {
            id: ComponentId::SlabDepot,
            version: DEPOT_STATE_VERSION,
            size: Self::PAYLOAD_SIZE,
        }
        .encode(buf);
        self.slab_config.encode(buf);
        buf.put_u64_le(self.first_block.0);
        buf.put_u64_le(self.last_block.0);
        buf.put_u8(self.zone_count);
    }

    /// Reads and validates the framed record.
    pub fn decode(buf: &mut &[u8]) -> Result<Self> {
        let header = ComponentHeader::decode(buf)?;
        header.validate(ComponentId::SlabDepot, DEPOT_STATE_VERSION, Self::PAYLOAD_SIZE)?;
        let slab_config = crate::slab::SlabConfig::decode(buf)?;
        ensure_remaining(buf, 17, "slab depot state truncated")?;
        let first_block = Pbn(buf.get_u64_le());
        let last_block = Pbn(buf.get_u64_le());
        let zone_count = buf.get_u8();
        if zone_count == 0 {
            return Err(BasaltError::BadConfiguration(
                "depot state has zero zones".into(),
            ));
        }
        Ok(Self {
            slab_config,
            first_block,
            last_block,
            zone_count,
        })
    }
}

/// Everything the super block persists.
#[derive(Debug)]
pub struct SuperBlock {
    /// Release version; must match the geometry block.
    pub release_version: u32,
    /// The packed volume component.
    pub component: VolumeComponent,
    /// The partition table.
    pub layout: FixedLayout,
    /// Recovery journal state.
    pub journal_state: RecoveryJournalState,
    /// Slab depot state.
    pub depot_state: SlabDepotState,
    /// Block map state.
    pub block_map_state: BlockMapState,
}

impl SuperBlock {
    /// Encodes the super block into a full block buffer. The live content
    /// (header, payload, checksum) must fit in one sector.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut payload = Vec::with_capacity(SECTOR_SIZE);
        payload.put_u32_le(self.release_version);
        payload.put_u32_le(VOLUME_VERSION.major);
        payload.put_u32_le(VOLUME_VERSION.minor);
        self.component.encode(&mut payload);
        self.layout.encode(&mut payload);
        self.journal_state.encode(&mut payload);
        self.depot_state.encode(&mut payload);
        self.block_map_state.encode(&mut payload);

        let mut buf = Vec::with_capacity(BLOCK_SIZE);
        ComponentHeader {
            id: ComponentId::SuperBlock,
            version: SUPER_BLOCK_VERSION,
            size: payload.len() as u64,
        }
        .encode(&mut buf);
        buf.extend_from_slice(&payload);
        let crc = block_crc32(self.component.nonce, &payload);
        buf.put_u32_le(crc);

        if buf.len() > SECTOR_SIZE {
            return Err(BasaltError::BadConfiguration(format!(
                "super block encoding of {} bytes does not fit in one sector",
                buf.len()
            )));
        }
        buf.resize(BLOCK_SIZE, 0);
        Ok(buf)
    }

    /// Decodes a super block, validating framing, versions, checksum, and
    /// the release version against the geometry block.
    pub fn decode(buf: &[u8], geometry: &GeometryBlock) -> Result<Self> {
        let mut cursor = buf;
        let header = ComponentHeader::decode(&mut cursor)?;
        header.validate(ComponentId::SuperBlock, SUPER_BLOCK_VERSION, 12)?;
        let payload_size = header.size as usize;
        if cursor.len() < payload_size + 4 {
            return Err(BasaltError::IncorrectComponent("super block truncated"));
        }
        let payload = &cursor[..payload_size];
        let mut crc_cursor = &cursor[payload_size..payload_size + 4];
        let stored_crc = crc_cursor.get_u32_le();
        if block_crc32(geometry.nonce, payload) != stored_crc {
            return Err(BasaltError::ChecksumMismatch("super block"));
        }

        let mut cursor = payload;
        let release_version = cursor.get_u32_le();
        if release_version != geometry.release_version {
            return Err(BasaltError::UnsupportedVersion(format!(
                "super block release {} does not match geometry release {}",
                release_version, geometry.release_version
            )));
        }
        let volume_version = VersionNumber::new(cursor.get_u32_le(), cursor.get_u32_le());
        if volume_version != VOLUME_VERSION {
            return Err(BasaltError::UnsupportedVersion(format!(
                "volume version {volume_version} (expected {VOLUME_VERSION})"
            )));
        }
        let component = VolumeComponent::decode(&mut cursor)?;
        if component.nonce != geometry.nonce {
            return Err(BasaltError::ParameterMismatch(
                "super block nonce does not match geometry".into(),
            ));
        }
        let layout = FixedLayout::decode(&mut cursor)?;
        let journal_state = RecoveryJournalState::decode(&mut cursor)?;
        let depot_state = SlabDepotState::decode(&mut cursor)?;
        let block_map_state = BlockMapState::decode(&mut cursor)?;
        Ok(Self {
            release_version,
            component,
            layout,
            journal_state,
            depot_state,
            block_map_state,
        })
    }
}
