//! MD5 facility: digest newtype, one-shot and file hashing, and the
//! jigdo base64 digest notation.
//!
//! Every component file and the finished image are identified by MD5.
//! [`md5_file`] hashes a file of any size through a sequence of
//! read-only memory-map windows so multi-gigabyte images never occupy
//! more than one window of address space at a time.

use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;

use memmap2::MmapOptions;

use crate::util::page_size;

/// A 16-byte MD5 digest.
///
/// `Ord` is a plain byte-for-byte comparison, which is what the recipe
/// uses to keep its file list binary-searchable.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Md5Digest(pub [u8; 16]);

impl fmt::Display for Md5Digest {
    /// Lowercase 32-character hex form.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Md5Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Md5Digest({self})")
    }
}

/// One-shot digest of a byte slice.
pub fn md5_mem(bytes: &[u8]) -> Md5Digest {
    Md5Digest(md5::compute(bytes).0)
}

/// Digest of an open file, streamed through read-only map windows of
/// `page_size() * 1024` bytes.
pub fn md5_file(file: &File) -> io::Result<Md5Digest> {
    let len = file.metadata()?.len();
    let window = page_size() * 1024;
    let mut ctx = md5::Context::new();

    let mut pos = 0u64;
    while pos < len {
        let this = (len - pos).min(window) as usize;
        let map = unsafe { MmapOptions::new().offset(pos).len(this).map(file)? };
        ctx.consume(&map[..]);
        pos += this as u64;
    }

    Ok(Md5Digest(ctx.finalize().0))
}

/// Digest of the file at `path`.
pub fn md5_path(path: &Path) -> io::Result<Md5Digest> {
    md5_file(&File::open(path)?)
}

// ── jigdo base64 ──────────────────────────────────────────────────────────────

/// Value of one symbol in the jigdo base64 alphabet.
///
/// jigdo uses `-` and `_` where standard base64 uses `+` and `/`; the
/// two alphabets do not conflict, so both are accepted.
fn symbol_value(c: u8) -> Option<u32> {
    match c {
        b'A'..=b'Z' => Some((c - b'A') as u32),
        b'a'..=b'z' => Some((c - b'a') as u32 + 26),
        b'0'..=b'9' => Some((c - b'0') as u32 + 52),
        b'+' | b'-' => Some(62),
        b'/' | b'_' => Some(63),
        _ => None,
    }
}

/// Decode the 22-character unpadded base64 notation a `.jigdo` file
/// uses for MD5 sums.
///
/// 22 symbols encode 132 bits; the final 2-symbol group contributes a
/// single byte, so its 12 decoded bits are left-shifted into the top of
/// the 24-bit group before extraction. Trailing `=` padding, should a
/// generator emit real base64, is tolerated.
pub fn md5_from_base64(s: &str) -> Option<Md5Digest> {
    let b = s.as_bytes();
    if b.len() < 22 {
        return None;
    }

    let mut out = [0u8; 16];
    let mut byte = 0usize;
    let mut i = 0usize;
    while byte < 16 {
        let mut val = 0u32;
        let mut symbols = 0usize;
        for j in 0..4 {
            match b.get(i + j) {
                Some(&c) if c != b'=' => {
                    val = val * 64 + symbol_value(c)?;
                    symbols += 1;
                }
                _ => break,
            }
        }
        if symbols == 0 {
            return None;
        }
        if symbols < 4 {
            // Short final group: align the partial value to the top of
            // the 24-bit window.
            val <<= 12;
        }
        for j in 0..3 {
            if byte >= 16 {
                break;
            }
            out[byte] = (val >> (8 * (2 - j))) as u8;
            byte += 1;
        }
        i += 4;
    }

    Some(Md5Digest(out))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
