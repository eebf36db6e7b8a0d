//! CRC-32 implementation used for per-block payload checksums.
//!
//! Checksums are always taken over the *decoded* block payload, so a corrupted block is
//! caught after the filter ran, whichever codec produced the on-disk bytes.

/// Reflected CRC-32 lookup table (polynomial `0xEDB88320`), expanded at compile time.
const CRC32_TABLE: [u32; 256] = build_table();

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;

    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;

        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB8_8320
            } else {
                crc >> 1
            };
            bit += 1;
        }

        table[i] = crc;
        i += 1;
    }

    table
}

/// Computes the CRC-32 of `buf` in a single pass.
pub fn crc32_calc(buf: &[u8]) -> u32 {
    crc32_finish(crc32_update(crc32_begin(), buf))
}

/// Returns the initial accumulator for an incremental CRC-32 computation.
pub(crate) fn crc32_begin() -> u32 {
    0xFFFF_FFFF
}

/// Folds `buf` into an in-progress CRC-32 accumulator.
pub(crate) fn crc32_update(mut crc: u32, buf: &[u8]) -> u32 {
    for &b in buf {
        crc = CRC32_TABLE[((crc ^ u32::from(b)) & 0xFF) as usize] ^ (crc >> 8);
    }

    crc
}

/// Finalizes an incremental CRC-32 accumulator.
pub(crate) fn crc32_finish(crc: u32) -> u32 {
    !crc
}
