//! Wire-integer and page-arithmetic primitives.
//!
//! The `.template` format stores unsigned little-endian integers in 4-,
//! 6- (the "U48"), and 8-byte widths. [`read_le`] accumulates any width
//! up to 8 bytes; [`read_u48`] reads the 6-byte form directly from a
//! stream. The page helpers support mapping a region that starts at an
//! arbitrary (page-unaligned) image offset: map from
//! `page_base(offset)` and index the mapping at `page_mod(offset)`.

use std::io::{self, Read};
use std::sync::OnceLock;

/// Byte length of the packed 48-bit integers used throughout the
/// template format.
pub const U48_LEN: usize = 6;

/// Accumulate an unsigned little-endian value from up to 8 bytes.
#[inline]
pub fn read_le(bytes: &[u8]) -> u64 {
    debug_assert!(bytes.len() <= 8);
    bytes
        .iter()
        .enumerate()
        .fold(0u64, |acc, (i, &b)| acc + ((b as u64) << (8 * i)))
}

/// Read one 6-byte little-endian integer, zero-extended to `u64`.
///
/// Image sizes are therefore capped at 2^48 − 1 bytes.
pub fn read_u48<R: Read>(r: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; U48_LEN];
    r.read_exact(&mut buf)?;
    Ok(read_le(&buf))
}

/// System page size in bytes, queried once.
pub fn page_size() -> u64 {
    static PAGE_SIZE: OnceLock<u64> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // sysconf cannot fail for _SC_PAGESIZE on any supported target.
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 }
    })
}

/// Offset of `offset` within its page.
#[inline]
pub fn page_mod(offset: u64) -> u64 {
    offset % page_size()
}

/// Page-aligned base address for `offset`.
#[inline]
pub fn page_base(offset: u64) -> u64 {
    offset - page_mod(offset)
}

/// Blocks the current thread for `millis` milliseconds.
pub fn sleep_millis(millis: u64) {
    std::thread::sleep(std::time::Duration::from_millis(millis));
}

// ── Tests ─────────────────────────────────────────────────────────────────────
