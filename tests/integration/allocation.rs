#![allow(missing_docs)]

use std::sync::Arc;

use basalt::admin::ReadOnlyNotifier;
use basalt::depot::SlabDepot;
use basalt::primitives::io::{FileIo, MemFileIo, StdFileIo};
use basalt::slab::SlabConfig;
use basalt::superblock::{SlabDepotState, VolumeState, VolumeStateCell};
use basalt::types::{BasaltError, BlockCount, BlockOperation, JournalPoint, Pbn, Result};
use basalt::volume::{OpenOptions, Volume};
use basalt::{Lbn, ThreadCountConfig, VolumeConfig};
use tempfile::tempdir;

fn depot_with_slabs(slab_count: u64, zone_count: u8) -> Result<SlabDepot> {
    let io: Arc<dyn FileIo> = Arc::new(MemFileIo::new());
    io.truncate(128 * 1024 * 1024)?;
    let state = SlabDepotState {
        slab_config: SlabConfig::new(64, 58, 4, 2)?,
        first_block: Pbn(64),
        last_block: Pbn(64 + slab_count * 64),
        zone_count,
    };
    let mut depot = SlabDepot::new(
        &state,
        Pbn(4),
        0x5EED,
        io,
        Arc::new(ReadOnlyNotifier::new()),
        Arc::new(VolumeStateCell::new(VolumeState::Dirty)),
    )?;
    depot.admin_state.make_normal();
    depot.initialize_summary()?;
    depot.prepare_to_allocate()?;
    Ok(depot)
}

#[test]
fn one_slab_allocates_sequentially_until_no_space() -> Result<()> {
    // Slab config {slab_blocks: 64, data_blocks: 58, ref_blocks: 4,
    // journal_blocks: 2}, one slab, one zone.
    let mut depot = depot_with_slabs(1, 1)?;
    let start = depot.slabs[0].start;

    for i in 0..58u64 {
        let pbn = depot.allocate_block(0)?;
        assert_eq!(pbn, Pbn(start.0 + i), "allocation {i} is sequential");
    }
    assert!(matches!(
        depot.allocate_block(0),
        Err(BasaltError::NoSpace)
    ));
    Ok(())
}

#[test]
fn allocation_accounting_invariant_holds() -> Result<()> {
    let mut depot = depot_with_slabs(6, 2)?;
    for zone in [0u8, 1, 0, 0, 1] {
        for _ in 0..20 {
            depot.allocate_block(zone)?;
        }
    }

    let by_slabs: BlockCount = depot
        .slabs
        .iter()
        .map(|slab| slab.data_block_count() - slab.free_block_count())
        .sum();
    assert_eq!(depot.allocated_block_count(), by_slabs);
    assert_eq!(depot.allocated_block_count(), 100);
    Ok(())
}

#[test]
fn provisional_must_be_confirmed_or_released() -> Result<()> {
    let mut depot = depot_with_slabs(1, 1)?;
    let pbn = depot.allocate_block(0)?;

    // Confirm with a journaled increment, then release twice: the second
    // decrement of the now-free block is an invalid transition.
    depot.adjust_reference(
        pbn,
        BlockOperation::DataIncrement,
        JournalPoint {
            sequence: 1,
            entry_count: 0,
        },
    )?;
    depot.adjust_reference(
        pbn,
        BlockOperation::DataDecrement,
        JournalPoint {
            sequence: 1,
            entry_count: 1,
        },
    )?;
    assert!(matches!(
        depot.adjust_reference(
            pbn,
            BlockOperation::DataDecrement,
            JournalPoint {
                sequence: 1,
                entry_count: 2,
            },
        ),
        Err(BasaltError::RefCountInvalid(_))
    ));
    Ok(())
}

#[test]
fn released_blocks_are_reused_before_virgin_slabs() -> Result<()> {
    let mut depot = depot_with_slabs(2, 1)?;
    let first = depot.allocate_block(0)?;
    depot.adjust_reference(
        first,
        BlockOperation::DataIncrement,
        JournalPoint {
            sequence: 1,
            entry_count: 0,
        },
    )?;
    depot.adjust_reference(
        first,
        BlockOperation::DataDecrement,
        JournalPoint {
            sequence: 1,
            entry_count: 1,
        },
    )?;

    // Drain the rest of slab 0; the next allocation must come from the
    // recycled block in slab 0 rather than opening virgin slab 1.
    for _ in 0..57 {
        depot.allocate_block(0)?;
    }
    let reused = depot.allocate_block(0)?;
    assert_eq!(reused, first);
    Ok(())
}

#[test]
fn growth_smaller_than_a_slab_is_rejected() -> Result<()> {
    let mut depot = depot_with_slabs(2, 1)?;
    assert!(matches!(
        depot.prepare_to_grow(Pbn(64 + 2 * 64 + 32)),
        Err(BasaltError::IncrementTooSmall)
    ));

    let added = depot.prepare_to_grow(Pbn(64 + 5 * 64))?;
    assert_eq!(added, 3);
    depot.commit_growth()?;
    assert_eq!(depot.slab_count(), 5);

    // The new slabs serve allocations.
    for _ in 0..(5 * 58) {
        depot.allocate_block(0)?;
    }
    assert!(matches!(
        depot.allocate_block(0),
        Err(BasaltError::NoSpace)
    ));
    Ok(())
}

#[test]
fn volume_maps_blocks_end_to_end() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("alloc.img");
    let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(&path)?);
    let config = VolumeConfig {
        logical_blocks: 2048,
        physical_blocks: 2048,
        slab_size: 64,
        slab_journal_blocks: 2,
        recovery_journal_size: 16,
    };
    Volume::format(Arc::clone(&io), config, ThreadCountConfig::default())?;
    let mut volume = Volume::open(io, ThreadCountConfig::default(), OpenOptions::default())?;

    let mut mapped = Vec::new();
    for lbn in 0..32u64 {
        mapped.push(volume.map_block(Lbn(lbn), 0)?);
    }
    for (lbn, pbn) in mapped.iter().enumerate() {
        let entry = volume.read_mapping(Lbn(lbn as u64))?;
        assert_eq!(entry.pbn, *pbn);
    }
    // 32 data blocks plus the one block map leaf they share.
    assert_eq!(volume.depot.allocated_block_count(), 33);
    assert_eq!(volume.journal.logical_blocks_used(), 32);
    volume.save()?;
    Ok(())
}
