//! One-shot decompression for the template's glue chunks, plus the
//! gzip helper used when loading a compressed recipe file.
//!
//! Template chunks declare their exact uncompressed length up front, so
//! [`decompress_mem`] enforces an exact-fit contract: the stream must
//! produce precisely `out.len()` bytes. Producing fewer or more is a
//! [`JigdoError::Decompress`] failure.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};

use bzip2::read::BzDecoder;
use flate2::read::{GzDecoder, ZlibDecoder};

use crate::error::{JigdoError, Result};

/// Compression schemes a template data chunk may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressKind {
    /// `DATA` chunk: zlib stream.
    Zlib,
    /// `BZIP` chunk: bzip2 stream.
    Bzip2,
}

/// Drain `dec` into `out`, requiring the stream to fill it exactly.
fn read_to_exact_fit<R: Read>(mut dec: R, out: &mut [u8]) -> Result<usize> {
    let mut produced = 0usize;
    while produced < out.len() {
        match dec.read(&mut out[produced..]) {
            Ok(0) => break,
            Ok(n) => produced += n,
            Err(e) => return Err(JigdoError::Decompress(e.to_string())),
        }
    }
    if produced < out.len() {
        return Err(JigdoError::Decompress(format!(
            "stream ended after {produced} of {} bytes",
            out.len()
        )));
    }

    // The chunk header promised exactly out.len() bytes; anything more
    // means the template lied about the chunk framing.
    let mut probe = [0u8; 1];
    match dec.read(&mut probe) {
        Ok(0) => Ok(produced),
        Ok(_) => Err(JigdoError::Decompress(format!(
            "stream produced more than the declared {} bytes",
            out.len()
        ))),
        Err(e) => Err(JigdoError::Decompress(e.to_string())),
    }
}

/// Decompress `input` into `out`, producing exactly `out.len()` bytes.
///
/// Returns the number of bytes produced (always `out.len()` on
/// success).
pub fn decompress_mem(kind: CompressKind, input: &[u8], out: &mut [u8]) -> Result<usize> {
    match kind {
        CompressKind::Zlib => read_to_exact_fit(ZlibDecoder::new(input), out),
        CompressKind::Bzip2 => read_to_exact_fit(BzDecoder::new(input), out),
    }
}

/// If `file` is gzip-compressed, replace it with an auto-deleting
/// temporary file holding the decompressed content.
///
/// The handle is returned seeked to the start either way. Recipe files
/// are commonly distributed gzipped; templates never are.
pub fn gunzip_replace(mut file: File) -> Result<File> {
    let mut magic = [0u8; 2];
    file.seek(SeekFrom::Start(0))?;
    let got = read_up_to(&mut file, &mut magic)?;
    file.seek(SeekFrom::Start(0))?;

    if got < 2 || magic != [0x1f, 0x8b] {
        return Ok(file);
    }

    let mut out = tempfile::tempfile().map_err(JigdoError::from)?;
    let mut dec = GzDecoder::new(BufReader::new(file));
    io::copy(&mut dec, &mut out)
        .map_err(|e| JigdoError::Decompress(format!("gzip: {e}")))?;
    out.seek(SeekFrom::Start(0))?;
    Ok(out)
}

/// Read up to `buf.len()` bytes, tolerating a shorter file.
fn read_up_to(r: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        match r.read(&mut buf[n..])? {
            0 => break,
            k => n += k,
        }
    }
    Ok(n)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
