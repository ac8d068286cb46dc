#![forbid(unsafe_code)]

//! A two-level block map: root (interior) pages preallocated in their own
//! partition, leaf pages allocated from slab data space.
//!
//! Every page carries a versioned header with the page's own address and
//! the volume nonce, so a stale or misdirected read never parses as a
//! valid page. Entries are five bytes: a four-bit mapping state and a
//! 36-bit physical address.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::codec::VersionNumber;
use crate::primitives::io::FileIo;
use crate::types::{BasaltError, BlockCount, Lbn, Pbn, Result, BLOCK_SIZE};

/// Block map page format version.
pub const BLOCK_MAP_PAGE_VERSION: VersionNumber = VersionNumber::new(4, 1);

/// Packed page header size.
pub const PAGE_HEADER_SIZE: usize = 36;
/// Five-byte entries per page.
pub const ENTRIES_PER_PAGE: usize = (BLOCK_SIZE - PAGE_HEADER_SIZE) / 5;

/// Largest physical address representable in an entry (36 bits).
pub const MAX_MAPPABLE_PBN: u64 = (1 << 36) - 1;

/// Entry state: unmapped.
pub const MAPPING_STATE_UNMAPPED: u8 = 0;
/// Entry state: mapped, uncompressed.
pub const MAPPING_STATE_MAPPED: u8 = 1;
const MAX_MAPPING_STATE: u8 = 15;

// Header offsets.
const HEADER_VERSION_MAJOR: usize = 0;
const HEADER_VERSION_MINOR: usize = 4;
const HEADER_PBN: usize = 8;
const HEADER_NONCE: usize = 16;
const HEADER_POSITION: usize = 24;
const HEADER_INITIALIZED: usize = 32;

/// One five-byte mapping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockMapEntry {
    /// Four-bit mapping state.
    pub state: u8,
    /// The mapped physical address.
    pub pbn: Pbn,
}

impl BlockMapEntry {
    /// An unmapped entry.
    pub const UNMAPPED: BlockMapEntry = BlockMapEntry {
        state: MAPPING_STATE_UNMAPPED,
        pbn: Pbn::ZERO,
    };

    /// A plainly mapped entry.
    pub fn mapped(pbn: Pbn) -> Self {
        Self {
            state: MAPPING_STATE_MAPPED,
            pbn,
        }
    }

    /// True for any non-unmapped state.
    pub fn is_mapped(&self) -> bool {
        self.state != MAPPING_STATE_UNMAPPED
    }

    /// Packs into five little-endian bytes.
    pub fn pack(&self) -> [u8; 5] {
        let low = (self.pbn.0 & 0xFFFF_FFFF) as u32;
        let high = ((self.pbn.0 >> 32) & 0x0F) as u8;
        let mut bytes = [0u8; 5];
        bytes[0] = (self.state << 4) | high;
        bytes[1..5].copy_from_slice(&low.to_le_bytes());
        bytes
    }

    /// Unpacks from five bytes.
    pub fn unpack(bytes: [u8; 5]) -> Self {
        let state = bytes[0] >> 4;
        let high = u64::from(bytes[0] & 0x0F);
        let low = u64::from(u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]));
        Self {
            state,
            pbn: Pbn((high << 32) | low),
        }
    }

    /// Validates the packed form's constraints before packing.
    pub fn validate(&self) -> Result<()> {
        if self.state > MAX_MAPPING_STATE {
            return Err(BasaltError::BadMapping("mapping state out of range"));
        }
        if self.pbn.0 > MAX_MAPPABLE_PBN {
            return Err(BasaltError::BadMapping("address too large to pack"));
        }
        Ok(())
    }
}

/// One cached block map page.
#[derive(Clone, Debug)]
pub struct BlockMapPage {
    buf: Vec<u8>,
}

impl BlockMapPage {
    /// Creates an initialized, all-unmapped page at `pbn`.
    pub fn new(pbn: Pbn, nonce: u64, position: u64) -> Self {
        let mut buf = vec![0u8; BLOCK_SIZE];
        buf[HEADER_VERSION_MAJOR..HEADER_VERSION_MAJOR + 4]
            .copy_from_slice(&BLOCK_MAP_PAGE_VERSION.major.to_le_bytes());
        buf[HEADER_VERSION_MINOR..HEADER_VERSION_MINOR + 4]
            .copy_from_slice(&BLOCK_MAP_PAGE_VERSION.minor.to_le_bytes());
        buf[HEADER_PBN..HEADER_PBN + 8].copy_from_slice(&pbn.0.to_le_bytes());
        buf[HEADER_NONCE..HEADER_NONCE + 8].copy_from_slice(&nonce.to_le_bytes());
        buf[HEADER_POSITION..HEADER_POSITION + 8].copy_from_slice(&position.to_le_bytes());
        buf[HEADER_INITIALIZED] = 1;
        Self { buf }
    }

    /// Parses a raw block as a page. Returns `None` for a block that was
    /// never written as a page of this volume.
    pub fn decode(buf: &[u8], expected_pbn: Pbn, nonce: u64) -> Result<Option<Self>> {
        if buf.len() < BLOCK_SIZE {
            return Err(BasaltError::BadMapping("block map page truncated"));
        }
        if buf[HEADER_INITIALIZED] == 0 {
            return Ok(None);
        }
        let major = u32::from_le_bytes(buf[0..4].try_into().expect("slice is 4 bytes"));
        let minor = u32::from_le_bytes(buf[4..8].try_into().expect("slice is 4 bytes"));
        if VersionNumber::new(major, minor) != BLOCK_MAP_PAGE_VERSION {
            return Err(BasaltError::UnsupportedVersion(format!(
                "block map page version {major}.{minor}"
            )));
        }
        let stored_nonce = u64::from_le_bytes(
            buf[HEADER_NONCE..HEADER_NONCE + 8]
                .try_into()
                .expect("slice is 8 bytes"),
        );
        if stored_nonce != nonce {
            return Ok(None);
        }
        let stored_pbn = u64::from_le_bytes(
            buf[HEADER_PBN..HEADER_PBN + 8]
                .try_into()
                .expect("slice is 8 bytes"),
        );
        if stored_pbn != expected_pbn.0 {
            return Err(BasaltError::BadMapping("block map page address mismatch"));
        }
        Ok(Some(Self { buf: buf.to_vec() }))
    }

    /// This page's index within its level.
    pub fn position(&self) -> u64 {
        u64::from_le_bytes(
            self.buf[HEADER_POSITION..HEADER_POSITION + 8]
                .try_into()
                .expect("slice is 8 bytes"),
        )
    }

    /// Reads one entry.
    pub fn entry(&self, slot: usize) -> Result<BlockMapEntry> {
        if slot >= ENTRIES_PER_PAGE {
            return Err(BasaltError::BadMapping("entry slot out of range"));
        }
        let base = PAGE_HEADER_SIZE + slot * 5;
        Ok(BlockMapEntry::unpack([
            self.buf[base],
            self.buf[base + 1],
            self.buf[base + 2],
            self.buf[base + 3],
            self.buf[base + 4],
        ]))
    }

    /// Writes one entry.
    pub fn set_entry(&mut self, slot: usize, entry: BlockMapEntry) -> Result<()> {
        if slot >= ENTRIES_PER_PAGE {
            return Err(BasaltError::BadMapping("entry slot out of range"));
        }
        entry.validate()?;
        let base = PAGE_HEADER_SIZE + slot * 5;
        self.buf[base..base + 5].copy_from_slice(&entry.pack());
        Ok(())
    }

    fn bytes(&self) -> &[u8] {
        &self.buf
    }
}

struct CachedPage {
    page: BlockMapPage,
    dirty: bool,
}

/// The block map.
pub struct BlockMap {
    root_origin: Pbn,
    root_count: BlockCount,
    logical_blocks: BlockCount,
    nonce: u64,
    io: Arc<dyn FileIo>,
    cache: FxHashMap<u64, CachedPage>,
}

impl std::fmt::Debug for BlockMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockMap")
            .field("root_origin", &self.root_origin)
            .field("root_count", &self.root_count)
            .field("logical_blocks", &self.logical_blocks)
            .finish_non_exhaustive()
    }
}

/// Number of root pages needed to map `logical_blocks`.
pub fn root_count_for(logical_blocks: BlockCount) -> BlockCount {
    let leaves = logical_blocks.div_ceil(ENTRIES_PER_PAGE as u64);
    leaves.div_ceil(ENTRIES_PER_PAGE as u64).max(1)
}

impl BlockMap {
    /// Opens a block map over existing (or zeroed) storage.
    pub fn new(
        root_origin: Pbn,
        root_count: BlockCount,
        logical_blocks: BlockCount,
        nonce: u64,
        io: Arc<dyn FileIo>,
    ) -> Self {
        Self {
            root_origin,
            root_count,
            logical_blocks,
            nonce,
            io,
            cache: FxHashMap::default(),
        }
    }

    /// First root page.
    pub fn root_origin(&self) -> Pbn {
        self.root_origin
    }

    /// Number of root pages.
    pub fn root_count(&self) -> BlockCount {
        self.root_count
    }

    /// Writes initialized empty root pages. Used at format time.
    pub fn format(&mut self) -> Result<()> {
        for index in 0..self.root_count {
            let pbn = Pbn(self.root_origin.0 + index);
            let page = BlockMapPage::new(pbn, self.nonce, index);
            self.io
                .write_at(pbn.0 * BLOCK_SIZE as u64, page.bytes())?;
        }
        Ok(())
    }

    fn check_lbn(&self, lbn: Lbn) -> Result<()> {
        if lbn.0 >= self.logical_blocks {
            return Err(BasaltError::OutOfRange("logical address out of range"));
        }
        Ok(())
    }

    fn slot_for(lbn: Lbn) -> (u64, usize, u64, usize) {
        let leaf_index = lbn.0 / ENTRIES_PER_PAGE as u64;
        let leaf_slot = (lbn.0 % ENTRIES_PER_PAGE as u64) as usize;
        let root_index = leaf_index / ENTRIES_PER_PAGE as u64;
        let root_slot = (leaf_index % ENTRIES_PER_PAGE as u64) as usize;
        (root_index, root_slot, leaf_index, leaf_slot)
    }

    fn load_page(&mut self, pbn: Pbn) -> Result<Option<&mut CachedPage>> {
        if !self.cache.contains_key(&pbn.0) {
            let mut buf = vec![0u8; BLOCK_SIZE];
            self.io.read_at(pbn.0 * BLOCK_SIZE as u64, &mut buf)?;
            match BlockMapPage::decode(&buf, pbn, self.nonce)? {
                Some(page) => {
                    self.cache.insert(pbn.0, CachedPage { page, dirty: false });
                }
                None => return Ok(None),
            }
        }
        Ok(self.cache.get_mut(&pbn.0))
    }

    /// Fetches the page at `pbn`, initializing a fresh one if the block
    /// has never been written as a page.
    pub fn page_or_init(&mut self, pbn: Pbn, position: u64) -> Result<&mut BlockMapPage> {
        if self.load_page(pbn)?.is_none() {
            self.cache.insert(
                pbn.0,
                CachedPage {
                    page: BlockMapPage::new(pbn, self.nonce, position),
                    dirty: true,
                },
            );
        }
        let cached = self.cache.get_mut(&pbn.0).expect("page cached above");
        Ok(&mut cached.page)
    }

    /// Whether the block at `pbn` holds an initialized page of this map.
    pub fn has_page(&mut self, pbn: Pbn) -> Result<bool> {
        Ok(self.load_page(pbn)?.is_some())
    }

    /// Reads the entry at an explicit page address and slot. Used by
    /// recovery to resolve pre-crash mappings.
    pub fn entry_at(&mut self, page_pbn: Pbn, slot: usize) -> Result<BlockMapEntry> {
        match self.load_page(page_pbn)? {
            Some(cached) => cached.page.entry(slot),
            None => Ok(BlockMapEntry::UNMAPPED),
        }
    }

    /// Writes the entry at an explicit page address and slot, initializing
    /// the page if needed.
    pub fn set_entry_at(
        &mut self,
        page_pbn: Pbn,
        slot: usize,
        entry: BlockMapEntry,
        position: u64,
    ) -> Result<()> {
        let _ = self.page_or_init(page_pbn, position)?;
        let cached = self.cache.get_mut(&page_pbn.0).expect("page cached");
        cached.page.set_entry(slot, entry)?;
        cached.dirty = true;
        Ok(())
    }

    /// The root page address covering a leaf index.
    pub fn root_pbn_for_leaf(&self, leaf_index: u64) -> Result<Pbn> {
        let root_index = leaf_index / ENTRIES_PER_PAGE as u64;
        if root_index >= self.root_count {
            return Err(BasaltError::OutOfRange("leaf index past mapped space"));
        }
        Ok(Pbn(self.root_origin.0 + root_index))
    }

    /// Looks up the mapping for a logical block.
    pub fn mapping(&mut self, lbn: Lbn) -> Result<BlockMapEntry> {
        self.check_lbn(lbn)?;
        let (root_index, root_slot, _, leaf_slot) = Self::slot_for(lbn);
        let root_pbn = Pbn(self.root_origin.0 + root_index);
        let interior = self.entry_at(root_pbn, root_slot)?;
        if !interior.is_mapped() {
            return Ok(BlockMapEntry::UNMAPPED);
        }
        self.entry_at(interior.pbn, leaf_slot)
    }

    /// The leaf page address for a logical block, if one exists.
    pub fn leaf_for(&mut self, lbn: Lbn) -> Result<Option<(Pbn, usize)>> {
        self.check_lbn(lbn)?;
        let (root_index, root_slot, _, leaf_slot) = Self::slot_for(lbn);
        let root_pbn = Pbn(self.root_origin.0 + root_index);
        let interior = self.entry_at(root_pbn, root_slot)?;
        Ok(interior.is_mapped().then_some((interior.pbn, leaf_slot)))
    }

    /// Sets the mapping for a logical block. When the covering leaf page
    /// does not exist yet, `new_leaf` must supply a physical block for it;
    /// the new leaf is linked into the root page. Returns the leaf page
    /// allocated, if any.
    pub fn set_mapping<F>(
        &mut self,
        lbn: Lbn,
        entry: BlockMapEntry,
        new_leaf: F,
    ) -> Result<Option<Pbn>>
    where
        F: FnOnce() -> Result<Pbn>,
    {
        self.check_lbn(lbn)?;
        let (root_index, root_slot, leaf_index, leaf_slot) = Self::slot_for(lbn);
        let root_pbn = Pbn(self.root_origin.0 + root_index);
        let interior = self.entry_at(root_pbn, root_slot)?;

        let (leaf_pbn, allocated) = if interior.is_mapped() {
            (interior.pbn, None)
        } else {
            let pbn = new_leaf()?;
            self.set_entry_at(root_pbn, root_slot, BlockMapEntry::mapped(pbn), root_index)?;
            (pbn, Some(pbn))
        };
        self.set_entry_at(leaf_pbn, leaf_slot, entry, leaf_index)?;
        Ok(allocated)
    }

    /// Iterates the interior entries of every initialized root page,
    /// yielding `(root_index, root_slot, leaf_pbn)` for each mapped one.
    pub fn mapped_leaves(&mut self) -> Result<Vec<(u64, usize, Pbn)>> {
        let mut leaves = Vec::new();
        for root_index in 0..self.root_count {
            let root_pbn = Pbn(self.root_origin.0 + root_index);
            if self.load_page(root_pbn)?.is_none() {
                continue;
            }
            for slot in 0..ENTRIES_PER_PAGE {
                let entry = self.entry_at(root_pbn, slot)?;
                if entry.is_mapped() {
                    leaves.push((root_index, slot, entry.pbn));
                }
            }
        }
        Ok(leaves)
    }

    /// Writes every dirty cached page back.
    pub fn flush(&mut self) -> Result<()> {
        for (pbn, cached) in self.cache.iter_mut() {
            if cached.dirty {
                self.io
                    .write_at(pbn * BLOCK_SIZE as u64, cached.page.bytes())?;
                cached.dirty = false;
            }
        }
        Ok(())
    }

    /// Drops all cached pages; dirty pages are lost.
    pub fn invalidate_cache(&mut self) {
        self.cache.clear();
    }
}
