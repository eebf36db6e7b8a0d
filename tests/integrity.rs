//! On-disk corruption detection and cache behavior.

mod common;

use common::{build_image, read_file, XorShift64};
use vafs::{CreateConfig, FileSeek, OpenOptions, Permissions, Vafs, VafsError};

const BS: u32 = 8 * 1024;

fn three_block_image(tag: &str) -> (Vec<u8>, Vec<u8>) {
    let mut rng = XorShift64::new(0xB16_B10C);
    let payload = rng.bytes(BS as usize * 3);

    let bytes = {
        let payload = payload.clone();
        build_image(
            CreateConfig::new().block_size(BS),
            tag,
            move |image| {
                let root = image.open_directory("/")?;
                let mut file = root.create_file("big", Permissions::new(0o644))?;
                file.write(&payload)?;
                Ok(())
            },
        )
    };

    (bytes, payload)
}

#[test]
fn corruption_poisons_only_the_damaged_block() {
    // S4: flip a byte inside the second data block; the two clean blocks stay readable.
    let (mut bytes, payload) = three_block_image("poisoned-block");

    assert_eq!(common::data_block_count(&bytes), 3);

    let (offset, length) = common::data_block_range(&bytes, 1);
    bytes[offset + length / 2] ^= 0x40;

    let image = Vafs::open_memory(&bytes).unwrap();
    let mut handle = image.open_file("/big").unwrap();
    let mut block = vec![0u8; BS as usize];

    handle.seek(FileSeek::Start(0)).unwrap();
    handle.read(&mut block).unwrap();
    assert_eq!(block, payload[..BS as usize]);

    handle.seek(FileSeek::Start(u64::from(BS))).unwrap();
    assert_eq!(handle.read(&mut block).err(), Some(VafsError::IoIntegrity));

    handle.seek(FileSeek::Start(u64::from(BS) * 2)).unwrap();
    handle.read(&mut block).unwrap();
    assert_eq!(block, payload[BS as usize * 2..]);
}

#[test]
fn any_payload_bit_flip_is_caught() {
    // CRC property, sampled across every block.
    let (reference, _) = three_block_image("bit-flip");

    for block in 0..3 {
        let (offset, length) = common::data_block_range(&reference, block);

        let mut corrupted = reference.clone();
        corrupted[offset + (length - 1)] ^= 0x01;

        let image = Vafs::open_memory(&corrupted).unwrap();
        let mut handle = image.open_file("/big").unwrap();

        handle
            .seek(FileSeek::Start(u64::from(BS) * block as u64))
            .unwrap();
        assert_eq!(
            handle.read(&mut [0u8; 32]).err(),
            Some(VafsError::IoIntegrity),
            "block {block}"
        );
    }
}

#[test]
fn truncated_image_fails_to_open() {
    let (bytes, _) = three_block_image("truncated");

    // Cut the image short of the data stream's block table.
    let truncated = &bytes[..common::data_stream_offset(&bytes) + 4];
    assert_eq!(Vafs::open_memory(truncated).err(), Some(VafsError::IoIntegrity));
}

#[test]
fn bad_magic_and_version_are_rejected() {
    let (bytes, _) = three_block_image("bad-header");

    let mut bad_magic = bytes.clone();
    bad_magic[0] ^= 0xFF;
    assert_eq!(Vafs::open_memory(&bad_magic).err(), Some(VafsError::IoIntegrity));

    let mut bad_version = bytes.clone();
    bad_version[4..8].copy_from_slice(&0x0002_0000u32.to_le_bytes());
    assert_eq!(
        Vafs::open_memory(&bad_version).err(),
        Some(VafsError::IoIntegrity)
    );

    let empty: &[u8] = &[];
    assert!(Vafs::open_memory(empty).is_err());
}

#[test]
fn cache_capacity_never_changes_results() {
    // Cache transparency: identical read sequences, identical results, whatever the
    // capacity.
    let mut rng = XorShift64::new(0xCAC4E);
    let payload = rng.bytes(BS as usize * 6 + 777);

    let bytes = {
        let payload = payload.clone();
        build_image(
            CreateConfig::new().block_size(BS),
            "cache-transparency",
            move |image| {
                let root = image.open_directory("/")?;
                let mut file = root.create_file("spread", Permissions::new(0o644))?;
                file.write(&payload)?;
                Ok(())
            },
        )
    };

    // A fixed, revisiting access pattern so some blocks get hot.
    let mut offsets = Vec::new();
    let mut pattern_rng = XorShift64::new(42);
    for _ in 0..40 {
        offsets.push(pattern_rng.next_u64() % (payload.len() as u64 - 64));
    }

    let mut outcomes: Vec<Vec<Vec<u8>>> = Vec::new();

    for capacity in [0usize, 1, 4, 32] {
        let image = Vafs::open_memory_with(
            &bytes,
            OpenOptions::new().cache_capacity(capacity),
        )
        .unwrap();

        let mut handle = image.open_file("/spread").unwrap();
        let mut reads = Vec::new();

        for &offset in &offsets {
            let mut chunk = vec![0u8; 64];
            handle.seek(FileSeek::Start(offset)).unwrap();
            handle.read(&mut chunk).unwrap();

            assert_eq!(chunk, payload[offset as usize..offset as usize + 64]);
            reads.push(chunk);
        }

        outcomes.push(reads);
    }

    for outcome in &outcomes[1..] {
        assert_eq!(outcome, &outcomes[0]);
    }
}

#[test]
fn files_pack_into_shared_blocks() {
    // Two small files written back to back land in the same first block, and both read
    // back correctly from their interior offsets.
    let bytes = build_image(
        CreateConfig::new().block_size(BS),
        "packing",
        |image| {
            let root = image.open_directory("/")?;

            let mut a = root.create_file("a", Permissions::new(0o644))?;
            a.write(b"first content")?;
            drop(a);

            let mut b = root.create_file("b", Permissions::new(0o644))?;
            b.write(b"second content")?;
            Ok(())
        },
    );

    assert_eq!(common::data_block_count(&bytes), 1);

    let image = Vafs::open_memory(&bytes).unwrap();
    assert_eq!(read_file(&image, "/a").unwrap(), b"first content");
    assert_eq!(read_file(&image, "/b").unwrap(), b"second content");
}

#[test]
fn exact_block_fill_boundary() {
    for (len, expected_blocks) in [(BS as usize, 1usize), (BS as usize + 1, 2)] {
        let mut rng = XorShift64::new(len as u64);
        let payload = rng.bytes(len);

        let bytes = {
            let payload = payload.clone();
            build_image(
                CreateConfig::new().block_size(BS),
                "block-boundary",
                move |image| {
                    let root = image.open_directory("/")?;
                    let mut file = root.create_file("fill", Permissions::new(0o644))?;
                    file.write(&payload)?;
                    Ok(())
                },
            )
        };

        assert_eq!(common::data_block_count(&bytes), expected_blocks, "len {len}");

        let image = Vafs::open_memory(&bytes).unwrap();
        assert_eq!(read_file(&image, "/fill").unwrap(), payload, "len {len}");
    }
}
