#![allow(missing_docs)]

use std::sync::Arc;

use basalt::blockmap::BlockMapEntry;
use basalt::primitives::io::{FileIo, MemFileIo};
use basalt::slab::ref_counts::MAX_SHARED_REFERENCES;
use basalt::superblock::VolumeState;
use basalt::types::{Pbn, Result};
use basalt::volume::{OpenOptions, Volume};
use basalt::{Lbn, ThreadCountConfig, VolumeConfig};

fn test_config() -> VolumeConfig {
    VolumeConfig {
        logical_blocks: 2048,
        physical_blocks: 2048,
        slab_size: 64,
        slab_journal_blocks: 2,
        recovery_journal_size: 16,
    }
}

fn mem_io() -> Arc<dyn FileIo> {
    let io: Arc<dyn FileIo> = Arc::new(MemFileIo::new());
    io.truncate(64 * 1024 * 1024).unwrap();
    io
}

fn open(io: &Arc<dyn FileIo>) -> Result<Volume> {
    Volume::open(
        Arc::clone(io),
        ThreadCountConfig::default(),
        OpenOptions::default(),
    )
}

#[test]
fn forced_rebuild_reconstructs_counts_from_block_map() -> Result<()> {
    let io = mem_io();
    Volume::format(Arc::clone(&io), test_config(), ThreadCountConfig::default())?;

    let mapped = {
        let mut volume = open(&io)?;
        let mut mapped = Vec::new();
        for lbn in 0..12u64 {
            mapped.push((Lbn(lbn), volume.map_block(Lbn(lbn), 0)?));
        }
        volume.save()?;
        let mut volume = open(&io)?;
        volume.mark_for_rebuild()?;
        mapped
    };

    let mut rebuilt = open(&io)?;
    assert_eq!(rebuilt.read_only_recoveries(), 1);
    assert_eq!(rebuilt.state(), VolumeState::Dirty);

    for (lbn, pbn) in &mapped {
        assert_eq!(rebuilt.read_mapping(*lbn)?.pbn, *pbn);
    }
    // Twelve data blocks plus one block map leaf.
    assert_eq!(rebuilt.depot.allocated_block_count(), 13);
    assert_eq!(rebuilt.journal.logical_blocks_used(), 12);
    assert_eq!(rebuilt.journal.block_map_data_blocks(), 1);

    // Data blocks rebuild to a single reference each.
    let (_, data_pbn) = mapped[0];
    let slab_number = rebuilt.depot.slab_for_pbn(data_pbn)?;
    let sbn = rebuilt.depot.slabs[slab_number].sbn_for(data_pbn)?;
    assert_eq!(rebuilt.depot.slabs[slab_number].ref_counts.counter(sbn)?, 1);

    // The rebuilt volume keeps serving writes.
    let pbn = rebuilt.map_block(Lbn(500), 0)?;
    assert_eq!(rebuilt.read_mapping(Lbn(500))?.pbn, pbn);
    Ok(())
}

#[test]
fn shared_mappings_rebuild_to_shared_counters() -> Result<()> {
    let io = mem_io();
    Volume::format(Arc::clone(&io), test_config(), ThreadCountConfig::default())?;
    let shared_pbn = {
        let mut volume = open(&io)?;
        let pbn = volume.map_block(Lbn(0), 0)?;
        // Alias a second logical block to the same physical block, the way
        // deduplication would, directly in the durable block map.
        let (leaf_pbn, slot) = volume.block_map.leaf_for(Lbn(1))?.expect("leaf exists");
        volume
            .block_map
            .set_entry_at(leaf_pbn, slot, BlockMapEntry::mapped(pbn), 0)?;
        volume.save()?;
        let mut volume = open(&io)?;
        volume.mark_for_rebuild()?;
        pbn
    };

    let rebuilt = open(&io)?;
    let slab_number = rebuilt.depot.slab_for_pbn(shared_pbn)?;
    let sbn = rebuilt.depot.slabs[slab_number].sbn_for(shared_pbn)?;
    assert_eq!(
        rebuilt.depot.slabs[slab_number].ref_counts.counter(sbn)?,
        2,
        "two logical references rebuild to a shared counter"
    );
    assert_eq!(rebuilt.journal.logical_blocks_used(), 2);
    Ok(())
}

#[test]
fn out_of_range_mappings_are_unmapped_best_effort() -> Result<()> {
    let io = mem_io();
    Volume::format(Arc::clone(&io), test_config(), ThreadCountConfig::default())?;
    {
        let mut volume = open(&io)?;
        volume.map_block(Lbn(0), 0)?;
        // Corrupt a second mapping to point far outside the depot.
        let (leaf_pbn, slot) = volume.block_map.leaf_for(Lbn(1))?.expect("leaf exists");
        volume
            .block_map
            .set_entry_at(leaf_pbn, slot, BlockMapEntry::mapped(Pbn(1 << 30)), 0)?;
        volume.save()?;
        let mut volume = open(&io)?;
        volume.mark_for_rebuild()?;
    }

    let mut rebuilt = open(&io)?;
    assert!(rebuilt.read_mapping(Lbn(0))?.is_mapped());
    assert!(
        !rebuilt.read_mapping(Lbn(1))?.is_mapped(),
        "corrupt mapping dropped during rebuild"
    );
    assert_eq!(rebuilt.journal.logical_blocks_used(), 1);
    Ok(())
}

#[test]
fn rebuild_gives_block_map_pages_the_maximum_reference() -> Result<()> {
    let io = mem_io();
    Volume::format(Arc::clone(&io), test_config(), ThreadCountConfig::default())?;
    let leaf_pbn = {
        let mut volume = open(&io)?;
        volume.map_block(Lbn(0), 0)?;
        let (leaf_pbn, _) = volume.block_map.leaf_for(Lbn(0))?.expect("leaf exists");
        volume.save()?;
        let mut volume = open(&io)?;
        volume.mark_for_rebuild()?;
        leaf_pbn
    };

    let rebuilt = open(&io)?;
    let slab_number = rebuilt.depot.slab_for_pbn(leaf_pbn)?;
    let sbn = rebuilt.depot.slabs[slab_number].sbn_for(leaf_pbn)?;
    assert_eq!(
        rebuilt.depot.slabs[slab_number].ref_counts.counter(sbn)?,
        MAX_SHARED_REFERENCES
    );
    Ok(())
}
