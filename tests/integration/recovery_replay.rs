#![allow(missing_docs)]

use std::sync::Arc;

use basalt::admin::{LoadType, ReadOnlyNotifier};
use basalt::blockmap::{BlockMap, BlockMapEntry};
use basalt::depot::SlabDepot;
use basalt::primitives::io::{FileIo, MemFileIo};
use basalt::recovery::{
    self, BlockMapSlot, JournalFilter, RecoveryJournal, RecoveryJournalEntry,
};
use basalt::slab::SlabConfig;
use basalt::superblock::{SlabDepotState, VolumeState, VolumeStateCell};
use basalt::types::{BlockOperation, Pbn, Result};
use basalt::volume::{OpenOptions, Volume};
use basalt::{Lbn, ThreadCountConfig, VolumeConfig};

const NONCE: u64 = 0xC0FFEE;

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

/// A depot over a hand-built region: journal at block 0, block map roots
/// at 16, summary at 32, slabs from 64.
fn scratch_depot(io: &Arc<dyn FileIo>, zone_count: u8) -> Result<SlabDepot> {
    let state = SlabDepotState {
        slab_config: SlabConfig::new(64, 58, 4, 2)?,
        first_block: Pbn(64),
        last_block: Pbn(64 + 8 * 64),
        zone_count,
    };
    let mut depot = SlabDepot::new(
        &state,
        Pbn(32),
        NONCE,
        Arc::clone(io),
        Arc::new(ReadOnlyNotifier::new()),
        Arc::new(VolumeStateCell::new(VolumeState::Recovering)),
    )?;
    depot.initialize_summary()?;
    depot.load(LoadType::LoadForRecovery)?;
    Ok(depot)
}

fn scratch_block_map(io: &Arc<dyn FileIo>) -> BlockMap {
    let mut map = BlockMap::new(Pbn(16), 2, 2048, NONCE, Arc::clone(io));
    map.format().unwrap();
    map
}

#[test]
fn empty_journal_recovers_to_nothing() -> Result<()> {
    // Scenario: the journal region holds no valid blocks at all.
    let io = mem_io();
    let mut depot = scratch_depot(&io, 1)?;
    let mut block_map = scratch_block_map(&io);

    let outcome = recovery::repair(
        &*io,
        &mut depot,
        &mut block_map,
        Pbn(0),
        16,
        JournalFilter {
            nonce: NONCE,
            recovery_count: 0,
        },
    )?;
    assert_eq!(outcome.block_map_head, 0);
    assert_eq!(outcome.slab_journal_head, 0);
    assert_eq!(outcome.entries_replayed, 0);
    assert_eq!(outcome.missing_decrefs, 0);
    assert_eq!(outcome.logical_blocks_used, 0);

    depot.prepare_to_allocate()?;
    depot.scrub_all_unrecovered()?;
    assert_eq!(depot.allocated_block_count(), 0);
    Ok(())
}

#[test]
fn replayed_entries_restore_reference_counts() -> Result<()> {
    let io = mem_io();
    let mut depot = scratch_depot(&io, 1)?;
    let mut block_map = scratch_block_map(&io);

    // Pre-crash: three data blocks incremented, one of them released.
    let mut journal = RecoveryJournal::new(Pbn(0), 16, NONCE, 0, 1, 0, 0);
    let leaf = Pbn(100);
    for (slot, pbn) in [(0u16, 64u64), (1, 65), (2, 66)] {
        journal.append(
            &*io,
            RecoveryJournalEntry {
                operation: BlockOperation::DataIncrement,
                slot: BlockMapSlot {
                    pbn: leaf,
                    slot,
                },
                mapping: BlockMapEntry::mapped(Pbn(pbn)),
            },
        )?;
    }
    journal.append(
        &*io,
        RecoveryJournalEntry {
            operation: BlockOperation::DataDecrement,
            slot: BlockMapSlot { pbn: leaf, slot: 1 },
            mapping: BlockMapEntry::mapped(Pbn(65)),
        },
    )?;
    journal.commit_block(&*io)?;

    let outcome = recovery::repair(
        &*io,
        &mut depot,
        &mut block_map,
        Pbn(0),
        16,
        journal.filter(),
    )?;
    assert_eq!(outcome.entries_replayed, 4);
    assert_eq!(outcome.tail, 1);
    assert_eq!(outcome.logical_blocks_used, 2);

    depot.prepare_to_allocate()?;
    depot.scrub_all_unrecovered()?;

    // Blocks 64 and 66 referenced once; 65 went up and back down.
    assert_eq!(depot.slabs[0].ref_counts.counter(0)?, 1);
    assert_eq!(depot.slabs[0].ref_counts.counter(1)?, 0);
    assert_eq!(depot.slabs[0].ref_counts.counter(2)?, 1);
    assert_eq!(depot.allocated_block_count(), 2);
    Ok(())
}

#[test]
fn missing_decref_resolved_from_journal_history() -> Result<()> {
    // inc(lbn -> P1) then inc(lbn -> P2) then crash: the second mapping
    // is live, and recovery must synthesize dec(P1).
    let io = mem_io();
    let mut depot = scratch_depot(&io, 2)?;
    let mut block_map = scratch_block_map(&io);

    let leaf = Pbn(100);
    let p1 = Pbn(64); // slab 0, zone 0
    let p2 = Pbn(64 + 64); // slab 1, zone 1
    let mut journal = RecoveryJournal::new(Pbn(0), 16, NONCE, 0, 1, 0, 0);
    for pbn in [p1, p2] {
        journal.append(
            &*io,
            RecoveryJournalEntry {
                operation: BlockOperation::DataIncrement,
                slot: BlockMapSlot { pbn: leaf, slot: 9 },
                mapping: BlockMapEntry::mapped(pbn),
            },
        )?;
    }
    journal.commit_block(&*io)?;

    let outcome = recovery::repair(
        &*io,
        &mut depot,
        &mut block_map,
        Pbn(0),
        16,
        journal.filter(),
    )?;
    assert_eq!(outcome.missing_decrefs, 1);
    // Both increments counted, one synthesized decrement released.
    assert_eq!(outcome.logical_blocks_used, 1);

    // The synthesized decrement went to P1's zone: slab 0's journal holds
    // one decrement for its block 0 alongside the replayed increment.
    let blocks = depot.slabs[0].journal.read_live_blocks(&*io)?;
    let entries: Vec<_> = blocks.iter().flat_map(|b| b.entries.iter()).collect();
    assert!(entries
        .iter()
        .any(|e| e.operation == BlockOperation::DataDecrement && e.sbn == 0));

    depot.prepare_to_allocate()?;
    depot.scrub_all_unrecovered()?;
    assert_eq!(depot.slabs[0].ref_counts.counter(0)?, 0, "P1 released");
    assert_eq!(depot.slabs[1].ref_counts.counter(0)?, 1, "P2 live");
    Ok(())
}

#[test]
fn missing_decref_fetches_penultimate_mapping_from_block_map() -> Result<()> {
    // Only the newest increment is in the journal; the pre-crash mapping
    // must come from the block map page itself.
    let io = mem_io();
    let mut depot = scratch_depot(&io, 1)?;
    let mut block_map = scratch_block_map(&io);

    let p1 = Pbn(64 + 3);
    let p2 = Pbn(64 + 7);
    // The durable block map still shows the old mapping at the slot.
    let leaf = Pbn(200);
    block_map.set_entry_at(leaf, 5, BlockMapEntry::mapped(p1), 0)?;
    block_map.flush()?;
    block_map.invalidate_cache();

    let mut journal = RecoveryJournal::new(Pbn(0), 16, NONCE, 0, 1, 1, 0);
    journal.append(
        &*io,
        RecoveryJournalEntry {
            operation: BlockOperation::DataIncrement,
            slot: BlockMapSlot { pbn: leaf, slot: 5 },
            mapping: BlockMapEntry::mapped(p2),
        },
    )?;
    journal.commit_block(&*io)?;

    let outcome = recovery::repair(
        &*io,
        &mut depot,
        &mut block_map,
        Pbn(0),
        16,
        journal.filter(),
    )?;
    assert_eq!(outcome.missing_decrefs, 1);
    // Baseline 1 (P1 mapped), +1 for P2, -1 synthesized: unchanged.
    assert_eq!(outcome.logical_blocks_used, 1);

    let blocks = depot.slabs[0].journal.read_live_blocks(&*io)?;
    let entries: Vec<_> = blocks.iter().flat_map(|b| b.entries.iter()).collect();
    assert!(entries
        .iter()
        .any(|e| e.operation == BlockOperation::DataDecrement && e.sbn == 3));
    Ok(())
}

#[test]
fn crashed_volume_recovers_mappings_and_counts() -> Result<()> {
    let io = mem_io();
    Volume::format(Arc::clone(&io), test_config(), ThreadCountConfig::default())?;

    let mapped = {
        let mut volume = Volume::open(
            Arc::clone(&io),
            ThreadCountConfig::default(),
            OpenOptions::default(),
        )?;
        let mut mapped = Vec::new();
        for lbn in 0..10u64 {
            mapped.push((Lbn(lbn), volume.map_block(Lbn(lbn), 0)?));
        }
        // The journal reaches disk; the block map and counters do not.
        volume.commit_journal()?;
        mapped
        // Dropped without save: a crash.
    };

    let mut recovered = Volume::open(
        Arc::clone(&io),
        ThreadCountConfig::default(),
        OpenOptions::default(),
    )?;
    assert_eq!(recovered.complete_recoveries(), 1);
    assert_eq!(recovered.state(), VolumeState::Dirty);
    assert_eq!(recovered.journal.logical_blocks_used(), 10);

    for (lbn, pbn) in &mapped {
        assert_eq!(recovered.read_mapping(*lbn)?.pbn, *pbn);
    }
    // Ten data blocks plus the block map leaf.
    assert_eq!(recovered.depot.allocated_block_count(), 11);

    // The recovered volume keeps working.
    let pbn = recovered.map_block(Lbn(100), 0)?;
    assert_eq!(recovered.read_mapping(Lbn(100))?.pbn, pbn);
    recovered.save()?;
    Ok(())
}

#[test]
fn rewrite_before_crash_releases_previous_mapping() -> Result<()> {
    let io = mem_io();
    Volume::format(Arc::clone(&io), test_config(), ThreadCountConfig::default())?;

    let (first_pbn, second_pbn) = {
        let mut volume = Volume::open(
            Arc::clone(&io),
            ThreadCountConfig::default(),
            OpenOptions::default(),
        )?;
        let first = volume.map_block(Lbn(5), 0)?;
        let second = volume.map_block(Lbn(5), 0)?;
        volume.commit_journal()?;
        (first, second)
    };
    assert_ne!(first_pbn, second_pbn);

    let mut recovered = Volume::open(
        Arc::clone(&io),
        ThreadCountConfig::default(),
        OpenOptions::default(),
    )?;
    assert_eq!(recovered.read_mapping(Lbn(5))?.pbn, second_pbn);
    // One logical block and one leaf page are live; the first physical
    // block was released by the journaled (not synthesized) decrement.
    assert_eq!(recovered.journal.logical_blocks_used(), 1);
    assert_eq!(recovered.depot.allocated_block_count(), 2);
    Ok(())
}

#[test]
fn recovery_is_repeatable_after_second_crash() -> Result<()> {
    let io = mem_io();
    Volume::format(Arc::clone(&io), test_config(), ThreadCountConfig::default())?;
    {
        let mut volume = Volume::open(
            Arc::clone(&io),
            ThreadCountConfig::default(),
            OpenOptions::default(),
        )?;
        volume.map_block(Lbn(1), 0)?;
        volume.commit_journal()?;
    }
    {
        // First recovery, then crash again without any new writes.
        let volume = Volume::open(
            Arc::clone(&io),
            ThreadCountConfig::default(),
            OpenOptions::default(),
        )?;
        assert_eq!(volume.complete_recoveries(), 1);
    }
    let recovered = Volume::open(
        Arc::clone(&io),
        ThreadCountConfig::default(),
        OpenOptions::default(),
    )?;
    assert_eq!(recovered.complete_recoveries(), 2);
    assert_eq!(recovered.journal.logical_blocks_used(), 1);
    Ok(())
}
