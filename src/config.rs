#![forbid(unsafe_code)]

//! Volume configuration and validation.

use bytes::{Buf, BufMut};
use serde::Serialize;

use crate::codec::ensure_remaining;
use crate::types::{BasaltError, BlockCount, Result, ZoneCount};

/// Smallest accepted slab journal, in blocks.
pub const MINIMUM_SLAB_JOURNAL_BLOCKS: BlockCount = 2;
/// Largest accepted slab size, as a power of two.
pub const MAX_SLAB_BITS: u32 = 23;
/// Upper bound on the number of slabs a depot may hold.
pub const MAX_SLABS: usize = 4096;

/// Threads per role. The core itself is driven cooperatively, but the
/// counts are validated and persisted so a hosting layer can honor them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ThreadCountConfig {
    /// Logical zone threads.
    pub logical_zones: ZoneCount,
    /// Physical zone threads (one block allocator each).
    pub physical_zones: ZoneCount,
    /// Hash zone threads.
    pub hash_zones: ZoneCount,
    /// Bio submission threads.
    pub bio_threads: u8,
    /// Bio acknowledgement threads.
    pub bio_ack_threads: u8,
    /// CPU work threads.
    pub cpu_threads: u8,
}

impl Default for ThreadCountConfig {
    fn default() -> Self {
        Self {
            logical_zones: 1,
            physical_zones: 1,
            hash_zones: 1,
            bio_threads: 4,
            bio_ack_threads: 1,
            cpu_threads: 1,
        }
    }
}

impl ThreadCountConfig {
    /// Rejects zero-sized mandatory roles.
    pub fn validate(&self) -> Result<()> {
        if self.physical_zones == 0 {
            return Err(BasaltError::BadConfiguration(
                "at least one physical zone is required".into(),
            ));
        }
        if self.logical_zones == 0 || self.hash_zones == 0 {
            return Err(BasaltError::BadConfiguration(
                "logical and hash zone counts must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// The validated shape of a volume.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct VolumeConfig {
    /// Total logical blocks presented to clients.
    pub logical_blocks: BlockCount,
    /// Total physical blocks in the backing store.
    pub physical_blocks: BlockCount,
    /// Blocks per slab; must be a power of two.
    pub slab_size: BlockCount,
    /// Blocks reserved for each slab's journal.
    pub slab_journal_blocks: BlockCount,
    /// Blocks in the recovery journal; must be a power of two.
    pub recovery_journal_size: BlockCount,
}

/// Encoded size of a [`VolumeConfig`].
pub const VOLUME_CONFIG_SIZE: usize = 40;

impl VolumeConfig {
    /// Validates the internal consistency rules.
    pub fn validate(&self) -> Result<()> {
        if !self.slab_size.is_power_of_two() {
            return Err(BasaltError::BadConfiguration(format!(
                "slab size {} is not a power of two",
                self.slab_size
            )));
        }
        if self.slab_size > (1 << MAX_SLAB_BITS) {
            return Err(BasaltError::BadConfiguration(format!(
                "slab size {} exceeds 2^{}",
                self.slab_size, MAX_SLAB_BITS
            )));
        }
        if self.slab_journal_blocks < MINIMUM_SLAB_JOURNAL_BLOCKS {
            return Err(BasaltError::BadConfiguration(format!(
                "slab journal of {} blocks is below the minimum of {}",
                self.slab_journal_blocks, MINIMUM_SLAB_JOURNAL_BLOCKS
            )));
        }
        if self.slab_journal_blocks >= self.slab_size {
            return Err(BasaltError::BadConfiguration(format!(
                "slab journal of {} blocks does not fit in a {} block slab",
                self.slab_journal_blocks, self.slab_size
            )));
        }
        if !self.recovery_journal_size.is_power_of_two() {
            return Err(BasaltError::BadConfiguration(format!(
                "recovery journal size {} is not a power of two",
                self.recovery_journal_size
            )));
        }
        if self.physical_blocks == 0 {
            return Err(BasaltError::BadConfiguration(
                "physical size must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Checks caller-supplied geometry against on-disk state. `strict`
    /// requires the physical size to match exactly (kernel mode); otherwise
    /// the caller may present a larger device.
    pub fn check_against(&self, on_disk: &VolumeConfig, strict: bool) -> Result<()> {
        if strict && self.physical_blocks != on_disk.physical_blocks {
            return Err(BasaltError::ParameterMismatch(format!(
                "physical size {} does not match stored size {}",
                self.physical_blocks, on_disk.physical_blocks
            )));
        }
        if !strict && self.physical_blocks < on_disk.physical_blocks {
            return Err(BasaltError::ParameterMismatch(format!(
                "physical size {} is smaller than stored size {}",
                self.physical_blocks, on_disk.physical_blocks
            )));
        }
        if self.logical_blocks != 0 && self.logical_blocks != on_disk.logical_blocks {
            return Err(BasaltError::ParameterMismatch(format!(
                "logical size {} does not match stored size {}",
                self.logical_blocks, on_disk.logical_blocks
            )));
        }
        Ok(())
    }

    /// log2 of the slab size.
    pub fn slab_size_shift(&self) -> u32 {
        self.slab_size.trailing_zeros()
    }

    /// Number of whole slabs that fit in a depot partition of `depot_blocks`.
    pub fn slab_count(&self, depot_blocks: BlockCount) -> Result<usize> {
        let count = (depot_blocks / self.slab_size) as usize;
        if count == 0 {
            return Err(BasaltError::BadConfiguration(
                "depot partition smaller than one slab".into(),
            ));
        }
        if count > MAX_SLABS {
            return Err(BasaltError::BadConfiguration(format!(
                "{count} slabs exceed the maximum of {MAX_SLABS}"
            )));
        }
        Ok(count)
    }

    /// Appends the packed little-endian form.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u64_le(self.logical_blocks);
        buf.put_u64_le(self.physical_blocks);
        buf.put_u64_le(self.slab_size);
        buf.put_u64_le(self.slab_journal_blocks);
        buf.put_u64_le(self.recovery_journal_size);
    }

    /// Reads the packed form.
    pub fn decode(buf: &mut &[u8]) -> Result<Self> {
        ensure_remaining(buf, VOLUME_CONFIG_SIZE, "volume config truncated")?;
        Ok(Self {
            logical_blocks: buf.get_u64_le(),
            physical_blocks: buf.get_u64_le(),
            slab_size: buf.get_u64_le(),
            slab_journal_blocks: buf.get_u64_le(),
            recovery_journal_size: buf.get_u64_le(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> VolumeConfig {
        VolumeConfig {
            logical_blocks: 1024,
            physical_blocks: 4096,
            slab_size: 64,
            slab_journal_blocks: 2,
            recovery_journal_size: 32,
        }
    }

    #[test]
    fn accepts_valid_config() {
        valid().validate().unwrap();
    }

    #[test]
    fn rejects_non_power_of_two_slab() {
        let mut config = valid();
        config.slab_size = 48;
        assert!(matches!(
            config.validate(),
            Err(BasaltError::BadConfiguration(_))
        ));
    }

    #[test]
    fn rejects_journal_larger_than_slab() {
        let mut config = valid();
        config.slab_journal_blocks = 64;
        assert!(config.validate().is_err());
        config.slab_journal_blocks = 1;
        assert!(config.validate().is_err(), "below minimum");
    }

    #[test]
    fn physical_size_must_match_in_strict_mode() {
        let on_disk = valid();
        let mut caller = valid();
        caller.physical_blocks += 64;
        assert!(matches!(
            caller.check_against(&on_disk, true),
            Err(BasaltError::ParameterMismatch(_))
        ));
        // Userspace mode tolerates a larger device but not a smaller one.
        caller.check_against(&on_disk, false).unwrap();
        caller.physical_blocks = on_disk.physical_blocks - 64;
        assert!(caller.check_against(&on_disk, false).is_err());
    }

    #[test]
    fn logical_zero_skips_the_check() {
        let on_disk = valid();
        let mut caller = valid();
        caller.logical_blocks = 0;
        caller.check_against(&on_disk, true).unwrap();
        caller.logical_blocks = on_disk.logical_blocks + 1;
        assert!(caller.check_against(&on_disk, true).is_err());
    }

    #[test]
    fn config_roundtrip() {
        let config = valid();
        let mut buf = Vec::new();
        config.encode(&mut buf);
        assert_eq!(buf.len(), VOLUME_CONFIG_SIZE);
        let mut cursor = buf.as_slice();
        assert_eq!(VolumeConfig::decode(&mut cursor).unwrap(), config);
    }

    #[test]
    fn thread_counts_require_physical_zone() {
        let mut threads = ThreadCountConfig::default();
        threads.validate().unwrap();
        threads.physical_zones = 0;
        assert!(threads.validate().is_err());
    }
}
