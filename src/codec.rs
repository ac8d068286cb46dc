#![forbid(unsafe_code)]

//! Little-endian component framing shared by every persistent structure:
//! version numbers, component headers, and bounds-checked cursor helpers.

use bytes::{Buf, BufMut};

use crate::types::{BasaltError, Result};

/// A two-part on-disk format version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VersionNumber {
    /// Incompatible format changes.
    pub major: u32,
    /// Compatible format changes.
    pub minor: u32,
}

impl VersionNumber {
    /// Shorthand constructor.
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl std::fmt::Display for VersionNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Identifiers for the framed components within the volume metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ComponentId {
    /// The super block itself.
    SuperBlock = 0,
    /// The partition table.
    FixedLayout = 1,
    /// Recovery journal persistent state.
    RecoveryJournal = 2,
    /// Slab depot persistent state.
    SlabDepot = 3,
    /// Block map persistent state.
    BlockMap = 4,
    /// The packed volume component (state, recoveries, config, nonce).
    VolumeComponent = 5,
    /// The geometry block at the start of the device.
    Geometry = 6,
}

impl ComponentId {
    fn from_u32(value: u32) -> Result<Self> {
        Ok(match value {
            0 => Self::SuperBlock,
            1 => Self::FixedLayout,
            2 => Self::RecoveryJournal,
            3 => Self::SlabDepot,
            4 => Self::BlockMap,
            5 => Self::VolumeComponent,
            6 => Self::Geometry,
            _ => return Err(BasaltError::IncorrectComponent("unknown component id")),
        })
    }
}

/// Fixed-size framing header preceding each encoded component:
/// `{id, version, payload_size}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ComponentHeader {
    /// Which component follows.
    pub id: ComponentId,
    /// Format version of the payload.
    pub version: VersionNumber,
    /// Exact payload size in bytes.
    pub size: u64,
}

/// Encoded size of a [`ComponentHeader`].
pub const COMPONENT_HEADER_SIZE: usize = 20;

impl ComponentHeader {
    /// Appends the header, little-endian.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u32_le(self.id as u32);
        buf.put_u32_le(self.version.major);
        buf.put_u32_le(self.version.minor);
        buf.put_u64_le(self.size);
    }

    /// Reads a header from the cursor.
    pub fn decode(buf: &mut &[u8]) -> Result<Self> {
        ensure_remaining(buf, COMPONENT_HEADER_SIZE, "component header truncated")?;
        let id = ComponentId::from_u32(buf.get_u32_le())?;
        let version = VersionNumber::new(buf.get_u32_le(), buf.get_u32_le());
        let size = buf.get_u64_le();
        Ok(Self { id, version, size })
    }

    /// Validates identity, exact version, and a minimum payload size.
    pub fn validate(
        &self,
        id: ComponentId,
        version: VersionNumber,
        minimum_size: u64,
    ) -> Result<()> {
        if self.id != id {
            return Err(BasaltError::IncorrectComponent(
                "component header id mismatch",
            ));
        }
        if self.version != version {
            return Err(BasaltError::UnsupportedVersion(format!(
                "component version {} (expected {})",
                self.version, version
            )));
        }
        if self.size < minimum_size {
            return Err(BasaltError::IncorrectComponent(
                "component payload shorter than expected",
            ));
        }
        Ok(())
    }
}

/// Fails with `IncorrectComponent` when fewer than `needed` bytes remain.
pub fn ensure_remaining(buf: &&[u8], needed: usize, message: &'static str) -> Result<()> {
    if buf.remaining() < needed {
        return Err(BasaltError::IncorrectComponent(message));
    }
    Ok(())
}
