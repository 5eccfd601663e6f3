//! `.template` DESC index parser.
//!
//! A template file ends with a `DESC` table framed by two identical
//! 6-byte length fields: the last six bytes of the file give the total
//! table length (header, entries, and trailer included), and the same
//! value appears again right after the 4-byte `DESC` magic at the
//! table's start. Entries between the frames carry one type byte, a
//! U48 size, and a type-specific payload.
//!
//! Entry offsets are not stored on disk; they are the running sum of
//! the sizes of all `Data`/`File` entries before them, so the entries
//! in declaration order tile the image exactly.

use std::io::{self, Read, Seek, SeekFrom};

use crate::error::{JigdoError, Result};
use crate::md5sum::Md5Digest;
use crate::util::{read_le, read_u48, U48_LEN};

/// DESC entry type codes as persisted in the binary format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DescEntryKind {
    /// Image summary without an rsync64 block length (format ≤ 1.0).
    ImageInfoObsolete = 1,
    /// Glue data not taken from any component file.
    Data = 2,
    /// Component file without an rsync64 initial sum (format ≤ 1.0).
    FileObsolete = 3,
    /// Image summary.
    ImageInfo = 5,
    /// Component file.
    File = 6,
}

impl DescEntryKind {
    /// Decode a wire type byte; unknown codes are a parse error.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(DescEntryKind::ImageInfoObsolete),
            2 => Some(DescEntryKind::Data),
            3 => Some(DescEntryKind::FileObsolete),
            5 => Some(DescEntryKind::ImageInfo),
            6 => Some(DescEntryKind::File),
            _ => None,
        }
    }
}

/// Parsed image summary, always the last entry of the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    /// Total image length in bytes.
    pub size: u64,
    /// MD5 of the finished image.
    pub md5: Md5Digest,
    /// rsync64 block length used at generation time; 0 for the
    /// obsolete entry variant. Parsed but unused during reassembly.
    pub rsync_block_len: u32,
}

/// One run of glue bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataBlock {
    /// Uncompressed length of the run.
    pub size: u64,
    /// Byte position within the image where the run starts.
    pub offset: u64,
}

/// One component-file region of the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilePart {
    /// Length of the component file.
    pub size: u64,
    /// Byte position within the image.
    pub offset: u64,
    /// MD5 of the component file.
    pub md5: Md5Digest,
    /// rsync64 sum of the file's initial block; 0 for the obsolete
    /// entry variant. Parsed but unused during reassembly.
    pub rsync_initial: u64,
}

/// The parsed DESC index.
#[derive(Debug, Clone)]
pub struct DescTable {
    pub image_info: ImageInfo,
    /// Glue runs in declaration order.
    pub data_blocks: Vec<DataBlock>,
    /// Component files in declaration order.
    pub files: Vec<FilePart>,
    /// Set by the orchestrator when the output file already existed at
    /// full size, enabling the partial-image verification pass.
    pub existing_file: bool,
}

/// DESC magic + leading length field.
const DESC_HEADER_LEN: u64 = 4 + U48_LEN as u64;

/// Read exactly `N` bytes, reporting a truncated table as `BadTemplate`.
fn read_array<const N: usize, R: Read>(r: &mut R) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            JigdoError::BadTemplate("truncated DESC table".into())
        } else {
            JigdoError::from(e)
        }
    })?;
    Ok(buf)
}

fn read_u48_entry<R: Read>(r: &mut R) -> Result<u64> {
    Ok(read_le(&read_array::<{ U48_LEN }, R>(r)?))
}

/// Parse the DESC index from the tail of an open `.template` file.
///
/// Only the table at the end of the file is touched; the compressed
/// data stream before it is consumed later by the glue writer.
pub fn read_desc_table<R: Read + Seek>(r: &mut R) -> Result<DescTable> {
    // The last six bytes name the total table length.
    r.seek(SeekFrom::End(-(U48_LEN as i64)))
        .map_err(|_| JigdoError::BadTemplate("file shorter than a DESC trailer".into()))?;
    let desc_len = read_u48(r)?;

    if desc_len < DESC_HEADER_LEN + U48_LEN as u64 {
        return Err(JigdoError::BadTemplate(format!(
            "DESC table length {desc_len} is too small"
        )));
    }

    // Seek to the table start and check both framing fields.
    r.seek(SeekFrom::End(-(desc_len as i64)))
        .map_err(|_| JigdoError::BadTemplate("DESC table length exceeds the file".into()))?;

    if &read_array::<4, R>(r)? != b"DESC" {
        return Err(JigdoError::BadTemplate("missing DESC magic".into()));
    }
    if read_u48_entry(r)? != desc_len {
        return Err(JigdoError::BadTemplate(
            "DESC length fields disagree".into(),
        ));
    }

    // Countdown over the entry region; the final six bytes are the
    // trailing length field already consumed from the tail.
    let mut remaining = desc_len - DESC_HEADER_LEN;
    let mut offset = 0u64;
    let mut data_blocks = Vec::new();
    let mut files = Vec::new();
    let mut image_info: Option<ImageInfo> = None;

    while remaining > U48_LEN as u64 {
        if image_info.is_some() {
            return Err(JigdoError::BadTemplate(
                "entry after the image-info entry".into(),
            ));
        }

        let type_code = read_array::<1, R>(r)?[0];
        let entry_size = read_u48_entry(r)?;
        remaining = remaining
            .checked_sub(1 + U48_LEN as u64)
            .ok_or_else(|| JigdoError::BadTemplate("entry overruns the table".into()))?;

        let kind = DescEntryKind::from_code(type_code).ok_or_else(|| {
            JigdoError::BadTemplate(format!("unknown entry type {type_code:#04x}"))
        })?;

        let consume = |n: u64, remaining: &mut u64| -> Result<()> {
            *remaining = remaining
                .checked_sub(n)
                .ok_or_else(|| JigdoError::BadTemplate("entry overruns the table".into()))?;
            Ok(())
        };

        match kind {
            DescEntryKind::ImageInfoObsolete | DescEntryKind::ImageInfo => {
                let md5 = Md5Digest(read_array::<16, R>(r)?);
                consume(16, &mut remaining)?;
                let rsync_block_len = if kind == DescEntryKind::ImageInfo {
                    let raw = read_array::<4, R>(r)?;
                    consume(4, &mut remaining)?;
                    read_le(&raw) as u32
                } else {
                    0
                };
                image_info = Some(ImageInfo {
                    size: entry_size,
                    md5,
                    rsync_block_len,
                });
            }
            DescEntryKind::Data => {
                data_blocks.push(DataBlock {
                    size: entry_size,
                    offset,
                });
                offset = offset
                    .checked_add(entry_size)
                    .ok_or_else(|| JigdoError::BadTemplate("offset overflow".into()))?;
            }
            DescEntryKind::FileObsolete | DescEntryKind::File => {
                let rsync_initial = if kind == DescEntryKind::File {
                    let raw = read_array::<8, R>(r)?;
                    consume(8, &mut remaining)?;
                    read_le(&raw)
                } else {
                    0
                };
                let md5 = Md5Digest(read_array::<16, R>(r)?);
                consume(16, &mut remaining)?;
                files.push(FilePart {
                    size: entry_size,
                    offset,
                    md5,
                    rsync_initial,
                });
                offset = offset
                    .checked_add(entry_size)
                    .ok_or_else(|| JigdoError::BadTemplate("offset overflow".into()))?;
            }
        }
    }

    if remaining != U48_LEN as u64 {
        return Err(JigdoError::BadTemplate(
            "entry sizes do not line up with the table length".into(),
        ));
    }

    let image_info = image_info.ok_or_else(|| {
        JigdoError::BadTemplate("table carries no image-info entry".into())
    })?;

    // The data and file entries must tile [0, image size) exactly.
    if offset != image_info.size {
        return Err(JigdoError::BadTemplate(format!(
            "entries cover {offset} bytes but the image is {} bytes",
            image_info.size
        )));
    }

    Ok(DescTable {
        image_info,
        data_blocks,
        files,
        existing_file: false,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn u48(v: u64) -> [u8; 6] {
        let le = v.to_le_bytes();
        [le[0], le[1], le[2], le[3], le[4], le[5]]
    }

    /// Wrap raw entry bytes in the DESC framing.
    fn desc_table(entries: &[u8]) -> Vec<u8> {
        let len = (4 + 6 + entries.len() + 6) as u64;
        let mut out = Vec::new();
        out.extend_from_slice(b"DESC");
        out.extend_from_slice(&u48(len));
        out.extend_from_slice(entries);
        out.extend_from_slice(&u48(len));
        out
    }

    fn data_entry(size: u64) -> Vec<u8> {
        let mut e = vec![2u8];
        e.extend_from_slice(&u48(size));
        e
    }

    fn file_entry(size: u64, md5: [u8; 16], rsync: u64) -> Vec<u8> {
        let mut e = vec![6u8];
        e.extend_from_slice(&u48(size));
        e.extend_from_slice(&rsync.to_le_bytes());
        e.extend_from_slice(&md5);
        e
    }

    fn file_entry_obsolete(size: u64, md5: [u8; 16]) -> Vec<u8> {
        let mut e = vec![3u8];
        e.extend_from_slice(&u48(size));
        e.extend_from_slice(&md5);
        e
    }

    fn image_info_entry(size: u64, md5: [u8; 16], block_len: u32) -> Vec<u8> {
        let mut e = vec![5u8];
        e.extend_from_slice(&u48(size));
        e.extend_from_slice(&md5);
        e.extend_from_slice(&block_len.to_le_bytes());
        e
    }

    fn image_info_entry_obsolete(size: u64, md5: [u8; 16]) -> Vec<u8> {
        let mut e = vec![1u8];
        e.extend_from_slice(&u48(size));
        e.extend_from_slice(&md5);
        e
    }

    #[test]
    fn parses_data_and_file_entries_with_running_offsets() {
        let mut entries = Vec::new();
        entries.extend(data_entry(5));
        entries.extend(file_entry(7, [0xaa; 16], 0x1122334455667788));
        entries.extend(data_entry(3));
        entries.extend(file_entry_obsolete(9, [0xbb; 16]));
        entries.extend(image_info_entry(24, [0xcc; 16], 1024));

        let table = read_desc_table(&mut Cursor::new(desc_table(&entries))).unwrap();
        assert_eq!(table.image_info.size, 24);
        assert_eq!(table.image_info.md5, Md5Digest([0xcc; 16]));
        assert_eq!(table.image_info.rsync_block_len, 1024);

        assert_eq!(table.data_blocks.len(), 2);
        assert_eq!((table.data_blocks[0].size, table.data_blocks[0].offset), (5, 0));
        assert_eq!((table.data_blocks[1].size, table.data_blocks[1].offset), (3, 12));

        assert_eq!(table.files.len(), 2);
        assert_eq!((table.files[0].size, table.files[0].offset), (7, 5));
        assert_eq!(table.files[0].rsync_initial, 0x1122334455667788);
        assert_eq!((table.files[1].size, table.files[1].offset), (9, 15));
        assert_eq!(table.files[1].rsync_initial, 0);
        assert!(!table.existing_file);
    }

    #[test]
    fn obsolete_image_info_has_zero_block_len() {
        let mut entries = Vec::new();
        entries.extend(data_entry(4));
        entries.extend(image_info_entry_obsolete(4, [0x11; 16]));
        let table = read_desc_table(&mut Cursor::new(desc_table(&entries))).unwrap();
        assert_eq!(table.image_info.rsync_block_len, 0);
    }

    #[test]
    fn huge_image_size_survives_the_u48_round_trip() {
        // A 2^40-byte image declared by a single data entry.
        let size = 1u64 << 40;
        let mut entries = Vec::new();
        entries.extend(data_entry(size));
        entries.extend(image_info_entry(size, [0; 16], 0));
        let table = read_desc_table(&mut Cursor::new(desc_table(&entries))).unwrap();
        assert_eq!(table.image_info.size, size);
        assert_eq!(table.data_blocks[0].size, size);
    }

    #[test]
    fn u48_boundary_values_parse_without_overflow() {
        for size in [0u64, 1, (1 << 48) - 1] {
            let mut entries = Vec::new();
            entries.extend(data_entry(size));
            entries.extend(image_info_entry(size, [0; 16], 0));
            let table = read_desc_table(&mut Cursor::new(desc_table(&entries))).unwrap();
            assert_eq!(table.image_info.size, size);
        }
    }

    #[test]
    fn mismatched_trailer_length_is_rejected() {
        let mut entries = Vec::new();
        entries.extend(data_entry(4));
        entries.extend(image_info_entry(4, [0; 16], 0));
        let mut bytes = desc_table(&entries);
        // Perturb the tail length field by one.
        let tail = bytes.len() - 6;
        bytes[tail] = bytes[tail].wrapping_add(1);
        let err = read_desc_table(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, JigdoError::BadTemplate(_)));
    }

    #[test]
    fn unknown_entry_type_is_rejected() {
        let mut entries = vec![0x42u8];
        entries.extend_from_slice(&u48(4));
        let err = read_desc_table(&mut Cursor::new(desc_table(&entries))).unwrap_err();
        assert!(matches!(err, JigdoError::BadTemplate(_)));
    }

    #[test]
    fn missing_image_info_is_rejected() {
        let entries = data_entry(4);
        let err = read_desc_table(&mut Cursor::new(desc_table(&entries))).unwrap_err();
        assert!(matches!(err, JigdoError::BadTemplate(_)));
    }

    #[test]
    fn entry_after_image_info_is_rejected() {
        let mut entries = Vec::new();
        entries.extend(image_info_entry(4, [0; 16], 0));
        entries.extend(data_entry(4));
        let err = read_desc_table(&mut Cursor::new(desc_table(&entries))).unwrap_err();
        assert!(matches!(err, JigdoError::BadTemplate(_)));
    }

    #[test]
    fn covering_mismatch_is_rejected() {
        let mut entries = Vec::new();
        entries.extend(data_entry(4));
        entries.extend(image_info_entry(5, [0; 16], 0));
        let err = read_desc_table(&mut Cursor::new(desc_table(&entries))).unwrap_err();
        assert!(matches!(err, JigdoError::BadTemplate(_)));
    }

    #[test]
    fn missing_desc_magic_is_rejected() {
        let mut entries = Vec::new();
        entries.extend(data_entry(4));
        entries.extend(image_info_entry(4, [0; 16], 0));
        let mut bytes = desc_table(&entries);
        bytes[0] = b'X';
        let err = read_desc_table(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, JigdoError::BadTemplate(_)));
    }

    #[test]
    fn truncated_entry_region_is_rejected() {
        // A file entry whose payload is cut off by the table frame.
        let mut entries = vec![6u8];
        entries.extend_from_slice(&u48(4));
        entries.extend_from_slice(&[0u8; 10]); // needs 24 payload bytes
        let err = read_desc_table(&mut Cursor::new(desc_table(&entries))).unwrap_err();
        assert!(matches!(err, JigdoError::BadTemplate(_)));
    }

    #[test]
    fn empty_file_is_rejected() {
        let err = read_desc_table(&mut Cursor::new(Vec::new())).unwrap_err();
        assert!(matches!(err, JigdoError::BadTemplate(_)));
    }
}
