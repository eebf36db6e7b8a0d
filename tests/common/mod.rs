//! Shared helpers for the integration suite.

// Each test binary compiles this module independently and uses a different subset.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use vafs::{CreateConfig, Filter, FilterOps, IOResult, Vafs};

static SCRATCH_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Returns a unique scratch path under the host temp directory.
pub fn scratch_path(tag: &str) -> PathBuf {
    let serial = SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut path = std::env::temp_dir();
    path.push(format!("vafs-test-{}-{serial}-{tag}.img", std::process::id()));
    path
}

/// Assembles an image through `fill` and returns the finished bytes.
pub fn build_image<F>(config: CreateConfig, tag: &str, fill: F) -> Vec<u8>
where
    F: FnOnce(&Vafs) -> IOResult<()>,
{
    let path = scratch_path(tag);

    let mut image = Vafs::create(&path, config).expect("image creation failed");
    fill(&image).expect("image fill failed");
    image.close().expect("image finalization failed");

    let bytes = std::fs::read(&path).expect("reading the finished image back failed");
    std::fs::remove_file(&path).ok();

    bytes
}

/// Deterministic xorshift64 byte generator for reproducible payloads.
pub struct XorShift64(u64);

impl XorShift64 {
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    pub fn bytes(&mut self, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);

        while out.len() < len {
            out.extend_from_slice(&self.next_u64().to_le_bytes());
        }

        out.truncate(len);
        out
    }
}

/// A codec XORing every byte with a constant; trivially self-inverse.
pub struct XorFilter(pub u8);

impl Filter for XorFilter {
    fn encode(&self, input: &[u8]) -> IOResult<Vec<u8>> {
        Ok(input.iter().map(|b| b ^ self.0).collect())
    }

    fn decode(&self, input: &[u8], output: &mut [u8]) -> IOResult<usize> {
        for (dst, src) in output.iter_mut().zip(input) {
            *dst = src ^ self.0;
        }

        Ok(input.len())
    }
}

pub fn xor_filter(key: u8) -> FilterOps {
    Arc::new(XorFilter(key))
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

/// Absolute offset of the data stream header inside a finished image.
pub fn data_stream_offset(bytes: &[u8]) -> usize {
    read_u32(bytes, 24) as usize
}

/// Number of blocks in the data stream of a finished image.
pub fn data_block_count(bytes: &[u8]) -> usize {
    let stream = data_stream_offset(bytes);
    read_u32(bytes, stream + 12) as usize
}

/// Byte range `(offset, length_on_disk)` of data block `index` in a finished image.
pub fn data_block_range(bytes: &[u8], index: usize) -> (usize, usize) {
    let stream = data_stream_offset(bytes);
    let table = read_u32(bytes, stream + 8) as usize;
    let entry = table + index * 16;

    let length = read_u32(bytes, entry) as usize;
    let offset = read_u32(bytes, entry + 4) as usize;

    (offset, length)
}

/// Reads the full content of the file at `path` through a fresh handle.
pub fn read_file(image: &Vafs, path: &str) -> IOResult<Vec<u8>> {
    let mut handle = image.open_file(path)?;
    let mut content = vec![0u8; handle.length() as usize];

    let mut filled = 0;
    while filled < content.len() {
        let read = handle.read(&mut content[filled..])?;
        assert!(read > 0, "unexpected end of file at {filled}");
        filled += read;
    }

    assert_eq!(handle.read(&mut [0u8; 8])?, 0, "file should be exhausted");
    Ok(content)
}
