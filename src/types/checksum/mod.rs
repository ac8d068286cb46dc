#![forbid(unsafe_code)]

//! CRC plumbing used by every persistent structure.
//!
//! All metadata digests go through the [`Checksum`] seam via
//! [`salted_digest`]; [`block_crc32`] is the CRC-32 instantiation the
//! on-disk formats use.

/// Incremental checksum over byte slices.
pub trait Checksum {
    /// Resets the checksum to its initial state.
    fn reset(&mut self);
    /// Feeds bytes into the checksum.
    fn update(&mut self, bytes: &[u8]);
    /// Produces the current digest without consuming the state.
    fn finalize(&self) -> u32;
}

/// CRC-32 implementation backed by `crc32fast`.
pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// Runs a checksum over a payload salted with the volume nonce, so blocks
/// from a different volume never validate.
pub fn salted_digest<C: Checksum>(digest: &mut C, nonce: u64, payload: &[u8]) -> u32 {
    digest.reset();
    digest.update(&nonce.to_le_bytes());
    digest.update(payload);
    digest.finalize()
}

/// The CRC-32 digest every on-disk metadata format carries.
pub fn block_crc32(nonce: u64, payload: &[u8]) -> u32 {
    salted_digest(&mut Crc32Fast::default(), nonce, payload)
}
