//! Glue-stream writer: inflates the template's compressed data chunks
//! and scatters each glue run to its image offset.
//!
//! Between the text header and the DESC index, a template holds a
//! concatenation of compressed chunks:
//!
//! ```text
//! magic[4] ("DATA" = zlib, "BZIP" = bzip2), total_len U48,
//! uncompressed_len U48, payload[total_len - 16]
//! ```
//!
//! A `DESC` magic in the stream position marks the end of the chunks
//! (the index starts there). The concatenated uncompressed chunks form
//! one contiguous glue stream whose length equals the sum of the
//! table's `Data` entry sizes; each `Data` entry then takes its slice
//! of that stream, in table order.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use memmap2::MmapOptions;

use crate::decompress::{decompress_mem, CompressKind};
use crate::error::{JigdoError, Result};
use crate::template::DescTable;
use crate::util::{page_base, page_mod, read_u48};

/// The only template major version understood by this tool.
const HEADER_V1: &[u8] = b"JigsawDownload template 1.";

/// Framing overhead of one chunk: magic + two U48 length fields.
const CHUNK_OVERHEAD: u64 = 4 + 6 + 6;

/// Advance past the next CRLF, tolerating bare `\n` bytes inside the
/// line. Returns an error at EOF.
fn skip_past_crlf<R: Read>(r: &mut R) -> Result<()> {
    let mut prev = 0u8;
    let mut byte = [0u8; 1];
    loop {
        if r.read(&mut byte)? == 0 {
            return Err(JigdoError::BadTemplate(
                "EOF while skipping the template header".into(),
            ));
        }
        if byte[0] == b'\n' && prev == b'\r' {
            return Ok(());
        }
        prev = byte[0];
    }
}

/// Check the template's text header and leave `r` positioned at the
/// first compressed chunk.
///
/// The header is the version line, a comment line, and a blank line,
/// each CRLF-terminated.
fn validate_header<R: Read + Seek>(r: &mut R) -> Result<()> {
    r.seek(SeekFrom::Start(0))?;
    let mut head = [0u8; HEADER_V1.len()];
    r.read_exact(&mut head)
        .map_err(|_| JigdoError::BadTemplate("file too short for a header".into()))?;
    if head != *HEADER_V1 {
        return Err(JigdoError::BadTemplate(
            "not a JigsawDownload 1.x template".into(),
        ));
    }
    for _ in 0..3 {
        skip_past_crlf(r)?;
    }
    Ok(())
}

/// Read and inflate one chunk into `out[cursor..]`.
///
/// Returns the number of bytes produced, or `None` when the `DESC`
/// sentinel was reached. Zero-length chunks are legal and produce
/// nothing.
fn inflate_chunk<R: Read>(r: &mut R, out: &mut [u8]) -> Result<Option<usize>> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)
        .map_err(|_| JigdoError::BadTemplate("truncated chunk stream".into()))?;

    let kind = match &magic {
        b"DATA" => CompressKind::Zlib,
        b"BZIP" => CompressKind::Bzip2,
        b"DESC" => return Ok(None),
        _ => {
            return Err(JigdoError::BadTemplate(format!(
                "unknown chunk magic {magic:02x?}"
            )))
        }
    };

    let truncated = |_| JigdoError::BadTemplate("truncated chunk header".into());
    let total_len = read_u48(r).map_err(truncated)?;
    let uncomp_len = read_u48(r).map_err(truncated)?;

    let payload_len = total_len.checked_sub(CHUNK_OVERHEAD).ok_or_else(|| {
        JigdoError::BadTemplate(format!("chunk length {total_len} below framing size"))
    })? as usize;
    let uncomp_len = uncomp_len as usize;
    if uncomp_len > out.len() {
        return Err(JigdoError::BadTemplate(
            "chunk overflows the glue stream".into(),
        ));
    }

    let mut payload = vec![0u8; payload_len];
    r.read_exact(&mut payload)
        .map_err(|_| JigdoError::BadTemplate("truncated chunk payload".into()))?;

    decompress_mem(kind, &payload, &mut out[..uncomp_len])?;
    Ok(Some(uncomp_len))
}

/// Inflate every glue chunk and write each `Data` run to its offset in
/// the output file.
///
/// `template` must be the same open template the DESC table came from;
/// `out` must already be allocated to the full image size.
pub fn write_glue<R: Read + Seek>(template: &mut R, out: &File, table: &DescTable) -> Result<()> {
    validate_header(template)?;

    let total: u64 = table.data_blocks.iter().map(|b| b.size).sum();
    if total > table.image_info.size {
        return Err(JigdoError::BadTemplate(
            "glue data exceeds the image size".into(),
        ));
    }

    // Inflate the whole stream into one buffer; the scatter pass below
    // slices it per table entry.
    let mut glue = vec![0u8; total as usize];
    let mut cursor = 0usize;
    while let Some(produced) = inflate_chunk(template, &mut glue[cursor..])? {
        cursor += produced;
    }
    if cursor != glue.len() {
        return Err(JigdoError::BadTemplate(format!(
            "glue stream holds {cursor} bytes but the table declares {}",
            glue.len()
        )));
    }

    let mut copied = 0usize;
    for block in &table.data_blocks {
        let size = block.size as usize;
        if size == 0 {
            continue;
        }
        // Guard against a corrupt table claiming more bytes than the
        // stream supplied.
        if copied + size > glue.len() {
            return Err(JigdoError::BadTemplate(
                "data entries exceed the glue stream".into(),
            ));
        }

        let skew = page_mod(block.offset) as usize;
        let mut map = unsafe {
            MmapOptions::new()
                .offset(page_base(block.offset))
                .len(size + skew)
                .map_mut(out)?
        };
        map[skew..skew + size].copy_from_slice(&glue[copied..copied + size]);
        map.flush_async()?;
        copied += size;
    }

    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
