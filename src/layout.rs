#![forbid(unsafe_code)]

//! The fixed layout: a partition table dividing the volume into the block
//! map, recovery journal, slab summary, and slab depot regions.

use bytes::{Buf, BufMut};
use smallvec::SmallVec;

use crate::codec::{ensure_remaining, ComponentHeader, ComponentId, VersionNumber};
use crate::primitives::segtree::SegmentTree;
use crate::types::{BasaltError, BlockCount, Pbn, Result};

/// On-disk format version of the layout record.
pub const LAYOUT_VERSION: VersionNumber = VersionNumber::new(3, 0);

/// Identifies a region of the volume.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PartitionId {
    /// Block map root pages.
    BlockMap = 0,
    /// Slab depot: all slabs, back to back.
    SlabDepot = 1,
    /// The circular recovery journal.
    RecoveryJournal = 2,
    /// Per-zone slab summary tables.
    SlabSummary = 3,
}

impl PartitionId {
    fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Self::BlockMap,
            1 => Self::SlabDepot,
            2 => Self::RecoveryJournal,
            3 => Self::SlabSummary,
            _ => return Err(BasaltError::IncorrectComponent("unknown partition id")),
        })
    }
}

/// A contiguous block range within the volume.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Partition {
    /// Which region this is.
    pub id: PartitionId,
    /// First block of the region.
    pub offset: Pbn,
    /// Length of the region in blocks.
    pub count: BlockCount,
}

/// The partition table. Partitions are allocated front to back from
/// `first_block`; lookups go through a segment tree over the partition
/// lengths.
#[derive(Clone, Debug)]
pub struct FixedLayout {
    first_block: Pbn,
    last_block: Pbn,
    partitions: SmallVec<[Partition; 4]>,
    tree: SegmentTree<usize>,
}

impl FixedLayout {
    /// Creates an empty layout covering `[first_block, last_block)`.
    pub fn new(first_block: Pbn, last_block: Pbn) -> Result<Self> {
        if last_block.0 <= first_block.0 {
            return Err(BasaltError::BadConfiguration(
                "layout covers no blocks".into(),
            ));
        }
        Ok(Self {
            first_block,
            last_block,
            partitions: SmallVec::new(),
            tree: SegmentTree::build(Vec::new()),
        })
    }

    /// First block governed by the layout.
    pub fn first_block(&self) -> Pbn {
        self.first_block
    }

    /// One past the last block governed by the layout.
    pub fn last_block(&self) -> Pbn {
        self.last_block
    }

    /// Blocks not yet assigned to any partition.
    pub fn remaining_blocks(&self) -> BlockCount {
        let used: BlockCount = self.partitions.iter().map(|p| p.count).sum();
        (self.last_block.0 - self.first_block.0) - used
    }

    /// Appends a partition of `count` blocks after the existing ones.
    pub fn add_partition(&mut self, id: PartitionId, count: BlockCount) -> Result<()> {
        if count == 0 {
            return Err(BasaltError::BadConfiguration(
                "zero-length partition".into(),
            ));
        }
        if self.partition(id).is_ok() {
            return Err(BasaltError::BadConfiguration(
                "duplicate partition id".into(),
            ));
        }
        if count > self.remaining_blocks() {
            return Err(BasaltError::BadConfiguration(format!(
                "partition of {count} blocks does not fit in {} remaining",
                self.remaining_blocks()
            )));
        }
        let offset = Pbn(self.last_partition_end());
        self.partitions.push(Partition { id, offset, count });
        self.rebuild_tree();
        Ok(())
    }

    /// Resizes an existing partition in place. Only the last partition may
    /// change size, since the others would have to move.
    pub fn resize_last_partition(&mut self, id: PartitionId, count: BlockCount) -> Result<()> {
        let last = self
            .partitions
            .last_mut()
            .ok_or(BasaltError::IncorrectComponent("layout has no partitions"))?;
        if last.id != id {
            return Err(BasaltError::BadConfiguration(
                "only the last partition can be resized".into(),
            ));
        }
        let available = self.last_block.0 - last.offset.0;
        if count > available {
            return Err(BasaltError::BadConfiguration(format!(
                "partition of {count} blocks exceeds {available} available"
            )));
        }
        last.count = count;
        self.rebuild_tree();
        Ok(())
    }

    /// Looks up a partition by id.
    pub fn partition(&self, id: PartitionId) -> Result<&Partition> {
        self.partitions
            .iter()
            .find(|p| p.id == id)
            .ok_or(BasaltError::IncorrectComponent("partition not present"))
    }

    /// Resolves an absolute block number to its partition and the offset
    /// within it.
    pub fn resolve(&self, pbn: Pbn) -> Result<(PartitionId, BlockCount)> {
        if pbn < self.first_block {
            return Err(BasaltError::OutOfRange("block before first partition"));
        }
        let (index, within) = self.tree.search(pbn.0 - self.first_block.0)?;
        Ok((self.partitions[index].id, within))
    }

    fn last_partition_end(&self) -> u64 {
        self.partitions
            .last()
            .map(|p| p.offset.0 + p.count)
            .unwrap_or(self.first_block.0)
    }

    fn rebuild_tree(&mut self) {
        self.tree = SegmentTree::build(
            self.partitions
                .iter()
                .enumerate()
                .map(|(index, p)| (p.count, index))
                .collect(),
        );
    }

    /// Appends the encoded layout: header, bounds, then each partition.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let payload_size = 8 + 8 + 1 + self.partitions.len() * 17;
        ComponentHeader {
            id: ComponentId::FixedLayout,
            version: LAYOUT_VERSION,
            size: payload_size as u64,
        }
        .encode(buf);
        buf.put_u64_le(self.first_block.0);
        buf.put_u64_le(self.last_block.0);
        buf.put_u8(self.partitions.len() as u8);
        for partition in &self.partitions {
            buf.put_u8(partition.id as u8);
            buf.put_u64_le(partition.offset.0);
            buf.put_u64_le(partition.count);
        }
    }

    /// Decodes a layout, validating framing and partition geometry.
    pub fn decode(buf: &mut &[u8]) -> Result<Self> {
        let header = ComponentHeader::decode(buf)?;
        header.validate(ComponentId::FixedLayout, LAYOUT_VERSION, 17)?;
        ensure_remaining(buf, 17, "layout payload truncated")?;
        let first_block = Pbn(buf.get_u64_le());
        let last_block = Pbn(buf.get_u64_le());
        let count = buf.get_u8() as usize;

        let mut layout = Self::new(first_block, last_block)?;
        let mut expected_offset = first_block.0;
        for _ in 0..count {
            ensure_remaining(buf, 17, "layout partition truncated")?;
            let id = PartitionId::from_u8(buf.get_u8())?;
            let offset = buf.get_u64_le();
            let blocks = buf.get_u64_le();
            if offset != expected_offset {
                return Err(BasaltError::IncorrectComponent(
                    "layout partitions are not contiguous",
                ));
            }
            expected_offset += blocks;
            layout.add_partition(id, blocks)?;
        }
        Ok(layout)
    }
}
