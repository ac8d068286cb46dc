#![allow(missing_docs)]

use std::sync::Arc;

use basalt::primitives::io::{FileIo, StdFileIo};
use basalt::superblock::{GeometryBlock, SuperBlock, SUPER_BLOCK_OFFSET};
use basalt::types::{BasaltError, Result, BLOCK_SIZE, SECTOR_SIZE};
use basalt::volume::{OpenOptions, Volume};
use basalt::{ThreadCountConfig, VolumeConfig};
use proptest::prelude::*;
use tempfile::tempdir;

fn test_config() -> VolumeConfig {
    VolumeConfig {
        logical_blocks: 2048,
        physical_blocks: 2048,
        slab_size: 64,
        slab_journal_blocks: 2,
        recovery_journal_size: 16,
    }
}

fn formatted_volume() -> Result<(tempfile::TempDir, Arc<dyn FileIo>)> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("volume.img");
    let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(&path)?);
    Volume::format(Arc::clone(&io), test_config(), ThreadCountConfig::default())?;
    Ok((dir, io))
}

fn read_block(io: &Arc<dyn FileIo>, block: u64) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; BLOCK_SIZE];
    io.read_at(block * BLOCK_SIZE as u64, &mut buf)?;
    Ok(buf)
}

#[test]
fn formatted_super_block_decodes() -> Result<()> {
    let (_dir, io) = formatted_volume()?;
    let geometry = GeometryBlock::decode(&read_block(&io, 0)?)?;
    let super_block = SuperBlock::decode(&read_block(&io, SUPER_BLOCK_OFFSET)?, &geometry)?;
    assert_eq!(super_block.component.config, test_config());
    assert_eq!(super_block.component.complete_recoveries, 0);
    Ok(())
}

#[test]
fn super_block_lives_entirely_in_one_sector() -> Result<()> {
    let (_dir, io) = formatted_volume()?;
    let buf = read_block(&io, SUPER_BLOCK_OFFSET)?;
    assert!(
        buf[SECTOR_SIZE..].iter().all(|&b| b == 0),
        "content past the first sector would not be torn-write safe"
    );
    Ok(())
}

#[test]
fn torn_super_block_fails_checksum() -> Result<()> {
    // Flip one byte inside the first sector; the decode must fail with a
    // checksum mismatch, never a partial parse.
    let (_dir, io) = formatted_volume()?;
    let geometry = GeometryBlock::decode(&read_block(&io, 0)?)?;
    let clean = read_block(&io, SUPER_BLOCK_OFFSET)?;

    for offset in [24usize, 100, 200] {
        let mut torn = clean.clone();
        torn[offset] ^= 0x01;
        assert!(
            matches!(
                SuperBlock::decode(&torn, &geometry),
                Err(BasaltError::ChecksumMismatch(_))
            ),
            "flip at offset {offset}"
        );
    }
    Ok(())
}

#[test]
fn torn_super_block_fails_volume_open() -> Result<()> {
    let (_dir, io) = formatted_volume()?;
    let mut torn = read_block(&io, SUPER_BLOCK_OFFSET)?;
    torn[60] ^= 0x80;
    io.write_at(SUPER_BLOCK_OFFSET * BLOCK_SIZE as u64, &torn)?;

    let result = Volume::open(io, ThreadCountConfig::default(), OpenOptions::default());
    assert!(matches!(result, Err(BasaltError::ChecksumMismatch(_))));
    Ok(())
}

#[test]
fn corrupt_geometry_fails_volume_open() -> Result<()> {
    let (_dir, io) = formatted_volume()?;
    let mut geometry = read_block(&io, 0)?;
    geometry[12] ^= 0xFF;
    io.write_at(0, &geometry)?;

    let result = Volume::open(io, ThreadCountConfig::default(), OpenOptions::default());
    assert!(result.is_err());
    Ok(())
}

#[test]
fn zone_count_mismatch_is_parameter_error() -> Result<()> {
    let (_dir, io) = formatted_volume()?;
    let threads = ThreadCountConfig {
        physical_zones: 3,
        ..ThreadCountConfig::default()
    };
    let result = Volume::open(io, threads, OpenOptions::default());
    assert!(matches!(result, Err(BasaltError::ParameterMismatch(_))));
    Ok(())
}

proptest! {
    #[test]
    fn volume_config_codec_roundtrip(
        logical in 1u64..1 << 40,
        physical_shift in 6u32..30,
        slab_shift in 3u32..23,
        journal_blocks in 2u64..8,
        recovery_shift in 3u32..16,
    ) {
        let config = VolumeConfig {
            logical_blocks: logical,
            physical_blocks: 1 << physical_shift,
            slab_size: 1 << slab_shift,
            slab_journal_blocks: journal_blocks,
            recovery_journal_size: 1 << recovery_shift,
        };
        let mut buf = Vec::new();
        config.encode(&mut buf);
        let mut cursor = buf.as_slice();
        let decoded = VolumeConfig::decode(&mut cursor).unwrap();
        prop_assert_eq!(decoded, config);
        prop_assert!(cursor.is_empty());
    }
}
