#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use basalt::admin::{LoadType, ReadOnlyNotifier};
use basalt::depot::SlabDepot;
use basalt::primitives::io::{FileIo, MemFileIo};
use basalt::slab::{SlabConfig, SlabStatus};
use basalt::superblock::{SlabDepotState, VolumeState, VolumeStateCell};
use basalt::types::{
    BasaltError, BlockOperation, JournalPoint, Pbn, Result, BLOCK_SIZE,
};

const NONCE: u64 = 0xD1A6;

fn scratch_depot(io: &Arc<dyn FileIo>, slab_count: u64) -> Result<SlabDepot> {
    let state = SlabDepotState {
        slab_config: SlabConfig::new(64, 58, 4, 2)?,
        first_block: Pbn(64),
        last_block: Pbn(64 + slab_count * 64),
        zone_count: 1,
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
    Ok(depot)
}

fn mem_io() -> Arc<dyn FileIo> {
    let io: Arc<dyn FileIo> = Arc::new(MemFileIo::new());
    io.truncate(64 * 1024 * 1024).unwrap();
    io
}

/// Writes journal entries into a slab's journal the way recovery replay
/// does, so scrubbing has something to apply.
fn seed_slab_journal(
    io: &Arc<dyn FileIo>,
    depot: &mut SlabDepot,
    slab_number: usize,
    entries: &[(u32, BlockOperation)],
) -> Result<()> {
    for (index, (sbn, operation)) in entries.iter().enumerate() {
        depot.slabs[slab_number].append_replay_entry(
            &**io,
            *sbn,
            *operation,
            JournalPoint {
                sequence: 1,
                entry_count: index as u16,
            },
        )?;
    }
    depot.slabs[slab_number].commit_journal_tail(&**io)?;
    Ok(())
}

#[test]
fn scrubbing_applies_journal_and_requeues_slab() -> Result<()> {
    let io = mem_io();
    let mut depot = scratch_depot(&io, 2)?;
    depot.load(LoadType::LoadForRecovery)?;

    seed_slab_journal(
        &io,
        &mut depot,
        0,
        &[
            (0, BlockOperation::DataIncrement),
            (1, BlockOperation::DataIncrement),
            (0, BlockOperation::DataIncrement),
            (1, BlockOperation::DataDecrement),
        ],
    )?;
    depot.slabs[0].status = SlabStatus::RequiresHighPriorityScrubbing;

    depot.prepare_to_allocate()?;
    depot.scrub_all_unrecovered()?;

    assert_eq!(depot.slabs[0].status, SlabStatus::Rebuilt);
    assert_eq!(depot.slabs[0].ref_counts.counter(0)?, 2);
    assert_eq!(depot.slabs[0].ref_counts.counter(1)?, 0);
    assert_eq!(depot.slabs[0].free_block_count(), 57);

    // The scrubbed slab is allocatable again.
    let pbn = depot.allocate_block(0)?;
    assert!(depot.slab_for_pbn(pbn).is_ok());
    Ok(())
}

#[test]
fn priority_after_scrub_follows_free_count() -> Result<()> {
    let io = mem_io();
    let mut depot = scratch_depot(&io, 1)?;
    depot.load(LoadType::LoadForRecovery)?;

    // Consume 8 blocks so free = 50 after scrubbing.
    let entries: Vec<(u32, BlockOperation)> = (0..8u32)
        .map(|sbn| (sbn, BlockOperation::DataIncrement))
        .collect();
    seed_slab_journal(&io, &mut depot, 0, &entries)?;

    depot.prepare_to_allocate()?;
    depot.scrub_all_unrecovered()?;

    let slab = &depot.slabs[0];
    let free = slab.free_block_count();
    assert_eq!(free, 50);
    let allocator = depot.allocator(0);
    let expected = 1 + free.ilog2() as u8;
    let expected = if expected < allocator.unopened_slab_priority() {
        expected
    } else {
        expected + 1
    };
    assert_eq!(allocator.priority_for_slab(slab), expected);

    // A virgin slab ranks at the reserved unopened priority instead.
    let stats = depot.statistics();
    assert_eq!(stats[0].slabs_scrubbed, 1);
    Ok(())
}

#[test]
fn scrub_parks_slabs_beyond_the_pool_size() -> Result<()> {
    // Six dirty slabs against a two-buffer pool: four park on the pool
    // and are rescheduled as finished scrubs hand their buffers on.
    let io = mem_io();
    let mut depot = scratch_depot(&io, 6)?;
    depot.load(LoadType::LoadForRecovery)?;
    for slab in 0..6usize {
        seed_slab_journal(
            &io,
            &mut depot,
            slab,
            &[(slab as u32, BlockOperation::DataIncrement)],
        )?;
    }

    depot.prepare_to_allocate()?;
    depot.scrub_all_unrecovered()?;

    let allocator = depot.allocator(0);
    assert_eq!(allocator.stats.snapshot().slabs_scrubbed, 6);
    // Every claimed buffer came back and nothing is left parked.
    assert_eq!(allocator.pool.available(), allocator.pool.size());
    assert_eq!(allocator.pool.waiting(), 0);
    for slab in &depot.slabs {
        assert_eq!(slab.status, SlabStatus::Rebuilt);
        assert_eq!(slab.free_block_count(), 57);
    }
    Ok(())
}

#[test]
fn clean_slab_per_summary_skips_journal_read() -> Result<()> {
    let io = mem_io();
    let mut depot = scratch_depot(&io, 1)?;
    depot.load(LoadType::LoadForRecovery)?;

    // Nothing in the journal, summary says clean: scrubbing must mark the
    // slab rebuilt without touching its counters.
    depot.prepare_to_allocate()?;
    depot.scrub_all_unrecovered()?;
    assert_eq!(depot.slabs[0].status, SlabStatus::Rebuilt);
    assert_eq!(depot.slabs[0].free_block_count(), 58);
    Ok(())
}

#[test]
fn corrupt_slab_journal_latches_read_only() -> Result<()> {
    let io = mem_io();
    let mut depot = scratch_depot(&io, 1)?;
    depot.load(LoadType::LoadForRecovery)?;

    seed_slab_journal(&io, &mut depot, 0, &[(0, BlockOperation::DataIncrement)])?;

    // Smash the committed journal block's sequence so the live-block scan
    // fails during scrubbing.
    let journal_block: u64 = 64 + 58 + 4; // first journal block of slab 0
    let mut buf = vec![0u8; BLOCK_SIZE];
    io.read_at(journal_block * BLOCK_SIZE as u64, &mut buf)?;
    buf[8..16].copy_from_slice(&999u64.to_le_bytes());
    io.write_at(journal_block * BLOCK_SIZE as u64, &buf)?;

    depot.prepare_to_allocate()?;
    let result = depot.scrub_all_unrecovered();
    assert!(result.is_err());
    assert!(matches!(
        depot.allocate_block(0),
        Err(BasaltError::ReadOnly)
    ));
    Ok(())
}

#[test]
fn clean_slab_waiters_fire_after_scrub() -> Result<()> {
    let io = mem_io();
    let mut depot = scratch_depot(&io, 1)?;
    depot.load(LoadType::LoadForRecovery)?;
    seed_slab_journal(&io, &mut depot, 0, &[(0, BlockOperation::DataIncrement)])?;
    depot.prepare_to_allocate()?;

    let fired = Arc::new(AtomicBool::new(false));
    let observer = Arc::clone(&fired);
    depot.enqueue_clean_slab_waiter(
        0,
        Box::new(move || {
            observer.store(true, Ordering::SeqCst);
        }),
    )?;

    depot.scrub_all_unrecovered()?;
    assert!(fired.load(Ordering::SeqCst));

    // With the scrubber quiescent and nothing queued, waiters are refused.
    depot.allocator_mut(0).scrubber.stop()?;
    assert!(matches!(
        depot.enqueue_clean_slab_waiter(0, Box::new(|| {})),
        Err(BasaltError::NoSpace)
    ));
    Ok(())
}

#[test]
fn recovery_completion_flips_state_once_per_depot() -> Result<()> {
    let io = mem_io();
    let state = Arc::new(VolumeStateCell::new(VolumeState::Recovering));
    let depot_state = SlabDepotState {
        slab_config: SlabConfig::new(64, 58, 4, 2)?,
        first_block: Pbn(64),
        last_block: Pbn(64 + 4 * 64),
        zone_count: 2,
    };
    let mut depot = SlabDepot::new(
        &depot_state,
        Pbn(32),
        NONCE,
        Arc::clone(&io),
        Arc::new(ReadOnlyNotifier::new()),
        Arc::clone(&state),
    )?;
    depot.initialize_summary()?;
    depot.load(LoadType::LoadForRecovery)?;
    depot.prepare_to_allocate()?;

    assert_eq!(state.load(), VolumeState::Recovering);
    depot.scrub_all_unrecovered()?;
    assert_eq!(state.load(), VolumeState::Dirty);
    Ok(())
}
