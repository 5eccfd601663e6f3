//! `.jigdo` recipe parser and the file → server → mirror lookup the
//! fetch phase resolves URIs through.
//!
//! The recipe is an INI-style text file:
//!
//! ```text
//! [Jigdo]
//! Version=1.1
//! Generator=jigdo-file/1.3.1
//!
//! [Image]
//! Filename=distro.iso
//! Template=distro.template
//! Template-MD5Sum=kAFQmDzST7DWlj99KOF_cg
//!
//! [Parts]
//! <base64-md5>=Server:path/to/part
//!
//! [Servers]
//! Server=http://mirror.example/pool/
//! Server=/srv/local-pool
//! ```
//!
//! `[Parts]` and `[Servers]` may repeat. A server line whose value is a
//! remote URI joins the mirror list; a `file://` URI or plain path is
//! canonicalised into the local-directory list probed by local-copy
//! discovery. Files keep an index into the server vector rather than a
//! reference, so growing either vector never invalidates anything.

use std::io::BufRead;
use std::path::{Path, PathBuf};

use crate::error::{JigdoError, Result};
use crate::fetch::{uri_scheme, UriScheme};
use crate::md5sum::{md5_from_base64, md5_path, Md5Digest};

/// One `[Parts]` entry: a component file known by MD5.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub md5: Md5Digest,
    /// Path relative to the server root.
    pub path: String,
    /// Index into the recipe's server vector.
    pub server: usize,
}

/// One logical `[Servers]` name with its fetch sources.
#[derive(Debug, Clone, Default)]
pub struct Server {
    pub name: String,
    /// Remote URI prefixes, tried in deterministic rotation.
    pub mirrors: Vec<String>,
    /// Local directories that may already hold component files.
    pub local_dirs: Vec<PathBuf>,
}

/// Parsed `.jigdo` data.
#[derive(Debug, Clone)]
pub struct Recipe {
    pub version: String,
    pub generator: Option<String>,
    /// Name of the image file to reconstruct.
    pub image_name: String,
    /// Name (or URI) of the `.template` file.
    pub template_name: String,
    /// MD5 of the template, when the recipe declares one.
    pub template_md5: Option<Md5Digest>,
    /// Component files, sorted by MD5 for binary search.
    files: Vec<FileRecord>,
    servers: Vec<Server>,
}

#[derive(Clone, Copy, PartialEq)]
enum Section {
    None,
    Jigdo,
    Image,
    Parts,
    Servers,
    Other,
}

impl Recipe {
    /// Parse a recipe from a line-oriented reader.
    ///
    /// `#` comment lines and blank lines are skipped. Only format
    /// version 1.x is accepted; a major-version bump signals an
    /// incompatible format.
    pub fn parse<R: BufRead>(reader: R) -> Result<Recipe> {
        let mut version = None;
        let mut generator = None;
        let mut image_name = None;
        let mut template_name = None;
        let mut template_md5 = None;
        let mut files: Vec<FileRecord> = Vec::new();
        let mut servers: Vec<Server> = Vec::new();

        let mut section = Section::None;

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if line.starts_with('[') {
                section = match line {
                    "[Jigdo]" => Section::Jigdo,
                    "[Image]" => Section::Image,
                    "[Parts]" => Section::Parts,
                    "[Servers]" => Section::Servers,
                    _ => Section::Other,
                };
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            if value.is_empty() {
                continue;
            }

            match section {
                Section::Jigdo => match key {
                    "Version" => version = Some(value.to_owned()),
                    "Generator" => generator = Some(value.to_owned()),
                    _ => {}
                },
                Section::Image => match key {
                    "Filename" => image_name = Some(value.to_owned()),
                    "Template" => template_name = Some(value.to_owned()),
                    "Template-MD5Sum" => {
                        template_md5 = Some(md5_from_base64(value).ok_or_else(|| {
                            JigdoError::Config(format!("bad Template-MD5Sum '{value}'"))
                        })?);
                    }
                    _ => {}
                },
                Section::Parts => {
                    let md5 = md5_from_base64(key).ok_or_else(|| {
                        JigdoError::Config(format!("bad part checksum '{key}'"))
                    })?;
                    let (server_name, path) = value.split_once(':').ok_or_else(|| {
                        JigdoError::Config(format!("part location '{value}' lacks a server"))
                    })?;
                    let server = server_index(&mut servers, server_name.trim());
                    files.push(FileRecord {
                        md5,
                        path: path.trim().to_owned(),
                        server,
                    });
                }
                Section::Servers => {
                    // Trailing per-mirror options (e.g. --try-last) are
                    // not supported; keep the URI part only.
                    if let Some(value) = value.split_whitespace().next() {
                        add_mirror_to(&mut servers, key, value)?;
                    }
                }
                Section::None | Section::Other => {}
            }
        }

        let version = version
            .ok_or_else(|| JigdoError::Config("recipe lacks a [Jigdo] Version".into()))?;
        if !version.starts_with("1.") {
            return Err(JigdoError::Config(format!(
                "unsupported jigdo format version {version}"
            )));
        }

        // Sort by MD5 so template parts can be matched by binary search.
        files.sort_by(|a, b| a.md5.cmp(&b.md5));

        Ok(Recipe {
            version,
            generator,
            image_name: image_name
                .ok_or_else(|| JigdoError::Config("recipe lacks an image Filename".into()))?,
            template_name: template_name
                .ok_or_else(|| JigdoError::Config("recipe lacks a Template name".into()))?,
            template_md5,
            files,
            servers,
        })
    }

    /// First file record carrying `md5`, if any.
    ///
    /// The format allows several entries with the same checksum; they
    /// are interchangeable for reassembly, so the first one wins.
    pub fn lookup_file(&self, md5: Md5Digest) -> Option<&FileRecord> {
        let mut idx = self.files.binary_search_by(|f| f.md5.cmp(&md5)).ok()?;
        while idx > 0 && self.files[idx - 1].md5 == md5 {
            idx -= 1;
        }
        Some(&self.files[idx])
    }

    /// Remote mirror prefixes of a server.
    pub fn mirror_uris(&self, server: usize) -> &[String] {
        &self.servers[server].mirrors
    }

    /// Local mirror directories of a server.
    pub fn local_dirs(&self, server: usize) -> &[PathBuf] {
        &self.servers[server].local_dirs
    }

    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    /// Register one `name=uri-or-dir` mapping from the command line.
    pub fn add_mirror(&mut self, spec: &str) -> Result<()> {
        // Anything after whitespace is an option this tool does not
        // support (e.g. --try-last); cut it off.
        let spec = spec.split_whitespace().next().unwrap_or("");
        let (name, value) = spec
            .split_once('=')
            .ok_or_else(|| JigdoError::Config(format!("mirror spec '{spec}' is not name=uri")))?;
        let (name, value) = (name.trim(), value.trim());
        if name.is_empty() || value.is_empty() {
            return Err(JigdoError::Config(format!(
                "mirror spec '{spec}' is not name=uri"
            )));
        }
        add_mirror_to(&mut self.servers, name, value)
    }

    /// Resolve a fetch URI for `record`. Attempt numbers (1-based)
    /// rotate through the server's mirrors so that retries exhaust
    /// every mirror before the retry budget runs out.
    pub fn resolve_uri(&self, record: &FileRecord, attempt: u32) -> Option<String> {
        let mirrors = &self.servers[record.server].mirrors;
        if mirrors.is_empty() {
            return None;
        }
        let mirror = &mirrors[attempt.saturating_sub(1) as usize % mirrors.len()];
        Some(join_uri(mirror, &record.path))
    }

    /// Search the record's local mirror directories for a file whose
    /// checksum matches. Unreadable candidates are treated as absent.
    pub fn find_local_copy(&self, record: &FileRecord) -> Option<PathBuf> {
        for dir in &self.servers[record.server].local_dirs {
            let candidate = dir.join(&record.path);
            if md5_path(&candidate).ok() == Some(record.md5) {
                return Some(candidate);
            }
        }
        None
    }
}

/// Index of the server named `name`, creating it if unknown.
fn server_index(servers: &mut Vec<Server>, name: &str) -> usize {
    if let Some(i) = servers.iter().position(|s| s.name == name) {
        return i;
    }
    servers.push(Server {
        name: name.to_owned(),
        ..Server::default()
    });
    servers.len() - 1
}

/// Route a server value to the mirror or local-directory list.
fn add_mirror_to(servers: &mut Vec<Server>, name: &str, value: &str) -> Result<()> {
    let idx = server_index(servers, name);
    match uri_scheme(value) {
        Some(UriScheme::File) => {
            let path = value.trim_start_matches("file://");
            servers[idx].local_dirs.push(canonical_dir(path)?);
        }
        Some(_) => servers[idx].mirrors.push(value.to_owned()),
        None => servers[idx].local_dirs.push(canonical_dir(value)?),
    }
    Ok(())
}

fn canonical_dir(path: &str) -> Result<PathBuf> {
    Path::new(path)
        .canonicalize()
        .map_err(|e| JigdoError::Config(format!("local mirror '{path}': {e}")))
}

/// Join a mirror prefix and a relative path with exactly one slash.
fn join_uri(mirror: &str, path: &str) -> String {
    if mirror.ends_with('/') {
        format!("{mirror}{path}")
    } else {
        format!("{mirror}/{path}")
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
