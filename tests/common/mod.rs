//! Shared fixture builders: synthetic `.template` files, recipe text,
//! and the jigdo base64 notation.

// Each test binary uses its own subset of these helpers.
#![allow(dead_code)]

use std::fs;
use std::io::Write;
use std::path::Path;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use pigdo::md5sum::{md5_mem, Md5Digest};

/// One region of the image under construction.
pub enum Segment {
    /// Glue bytes delivered through the template's data stream.
    Glue(Vec<u8>),
    /// A component file fetched from a mirror, stored at `path`
    /// relative to the server root.
    Part { data: Vec<u8>, path: &'static str },
}

pub fn u48(v: u64) -> [u8; 6] {
    let le = v.to_le_bytes();
    [le[0], le[1], le[2], le[3], le[4], le[5]]
}

/// Standard-alphabet, 22-character base64 of a digest (what a `.jigdo`
/// file carries for each part).
pub fn b64(d: Md5Digest) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let bytes = d.0;
    let mut out = String::new();
    let mut i = 0;
    while i < 16 {
        let b0 = bytes[i] as u32;
        let b1 = *bytes.get(i + 1).unwrap_or(&0) as u32;
        let b2 = *bytes.get(i + 2).unwrap_or(&0) as u32;
        let val = (b0 << 16) | (b1 << 8) | b2;
        let symbols = if i + 1 >= 16 { 2 } else { 4 };
        for s in 0..symbols {
            out.push(ALPHABET[((val >> (18 - 6 * s)) & 63) as usize] as char);
        }
        i += 3;
    }
    out
}

fn zlib_chunk(data: &[u8]) -> Vec<u8> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).unwrap();
    let payload = enc.finish().unwrap();
    let mut chunk = Vec::new();
    chunk.extend_from_slice(b"DATA");
    chunk.extend_from_slice(&u48(payload.len() as u64 + 16));
    chunk.extend_from_slice(&u48(data.len() as u64));
    chunk.extend_from_slice(&payload);
    chunk
}

/// Write a complete `.template` for `segments` and return the full
/// image it describes.
pub fn write_template(path: &Path, segments: &[Segment]) -> Vec<u8> {
    let mut image = Vec::new();
    let mut glue = Vec::new();
    let mut entries = Vec::new();

    for seg in segments {
        match seg {
            Segment::Glue(data) => {
                image.extend_from_slice(data);
                glue.extend_from_slice(data);
                entries.push(2u8);
                entries.extend_from_slice(&u48(data.len() as u64));
            }
            Segment::Part { data, .. } => {
                image.extend_from_slice(data);
                entries.push(6u8);
                entries.extend_from_slice(&u48(data.len() as u64));
                entries.extend_from_slice(&0u64.to_le_bytes());
                entries.extend_from_slice(&md5_mem(data).0);
            }
        }
    }

    // Image-info entry closes the table.
    entries.push(5u8);
    entries.extend_from_slice(&u48(image.len() as u64));
    entries.extend_from_slice(&md5_mem(&image).0);
    entries.extend_from_slice(&0u32.to_le_bytes());

    let mut template = Vec::new();
    template.extend_from_slice(
        b"JigsawDownload template 1.1 pigdo-fixture\r\n\
          See the jigdo documentation for the format.\r\n\r\n",
    );
    if !glue.is_empty() {
        template.extend_from_slice(&zlib_chunk(&glue));
    }
    let desc_len = (4 + 6 + entries.len() + 6) as u64;
    template.extend_from_slice(b"DESC");
    template.extend_from_slice(&u48(desc_len));
    template.extend_from_slice(&entries);
    template.extend_from_slice(&u48(desc_len));

    fs::write(path, &template).unwrap();
    image
}

/// Write the component files of `segments` under `root` (the mirror
/// directory layout a server would serve).
pub fn write_mirror_tree(root: &Path, segments: &[Segment]) {
    for seg in segments {
        if let Segment::Part { data, path } = seg {
            let dest = root.join(path);
            fs::create_dir_all(dest.parent().unwrap()).unwrap();
            fs::write(dest, data).unwrap();
        }
    }
}

/// Write a `.jigdo` recipe naming every part of `segments`, with the
/// given `[Servers]` lines (already in `Name=value` form).
pub fn write_recipe(
    path: &Path,
    image_name: &str,
    template_name: &str,
    segments: &[Segment],
    server_lines: &[String],
) {
    let mut text = String::new();
    text.push_str("[Jigdo]\nVersion=1.1\nGenerator=pigdo-fixture\n\n");
    text.push_str(&format!(
        "[Image]\nFilename={image_name}\nTemplate={template_name}\n\n[Parts]\n"
    ));
    for seg in segments {
        if let Segment::Part { data, path } = seg {
            text.push_str(&format!("{}=Distro:{}\n", b64(md5_mem(data)), path));
        }
    }
    text.push_str("\n[Servers]\n");
    for line in server_lines {
        text.push_str(line);
        text.push('\n');
    }
    fs::write(path, text).unwrap();
}
