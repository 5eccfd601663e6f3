//! Fetch transport: resolves URIs into bytes, capped to the caller's
//! buffer, with a live progress counter for the status dump.
//!
//! The worker pool fetches through the [`Transport`] trait so tests can
//! substitute a scripted implementation. [`Fetcher`] is the production
//! transport: `file://` URIs read straight from the filesystem, and
//! `http://`/`https://` go through one shared blocking client that
//! follows redirects and enforces the throughput floor. There is no
//! global init/cleanup pair; the client lives and dies with the
//! `Fetcher`.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::error::{JigdoError, Result};

/// Transfers slower than this, sustained over [`LOW_SPEED_TIME`], are
/// aborted.
pub const LOW_SPEED_LIMIT: u64 = 1024;

/// Window over which the throughput floor is evaluated.
pub const LOW_SPEED_TIME: Duration = Duration::from_secs(60);

/// URI schemes the engine distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UriScheme {
    File,
    Http,
    Https,
    Ftp,
    Other,
}

/// Classify `s` as a URI, or `None` for a plain filesystem path.
pub fn uri_scheme(s: &str) -> Option<UriScheme> {
    let (scheme, rest) = s.split_once("://")?;
    if scheme.is_empty()
        || rest.is_empty()
        || !scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
    {
        return None;
    }
    Some(match scheme.to_ascii_lowercase().as_str() {
        "file" => UriScheme::File,
        "http" => UriScheme::Http,
        "https" => UriScheme::Https,
        "ftp" => UriScheme::Ftp,
        _ => UriScheme::Other,
    })
}

/// Byte source the fetch phase pulls component files through.
pub trait Transport: Send + Sync {
    /// Write the resource at `uri` into `out`.
    ///
    /// Must never write past `out.len()`; a longer resource is an
    /// error, a shorter one returns the short count and the caller
    /// decides. `fetched` is kept up to date as bytes arrive so the
    /// status dump can read it concurrently.
    fn fetch(&self, uri: &str, out: &mut [u8], fetched: &AtomicU64) -> Result<usize>;
}

/// Production transport over the filesystem and HTTP(S).
pub struct Fetcher {
    client: reqwest::blocking::Client,
}

impl Fetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .connect_timeout(Duration::from_secs(30))
            .timeout(None)
            .build()
            .map_err(|e| JigdoError::FetchFailed(e.to_string()))?;
        Ok(Fetcher { client })
    }

    /// Open `path_or_uri` for reading.
    ///
    /// Local paths and `file://` URIs open directly; remote URIs are
    /// downloaded into an auto-deleting temporary file. Used for the
    /// recipe and template files themselves.
    pub fn open(&self, path_or_uri: &str) -> Result<File> {
        match uri_scheme(path_or_uri) {
            None => Ok(File::open(path_or_uri)
                .map_err(|e| JigdoError::Io(format!("{path_or_uri}: {e}")))?),
            Some(UriScheme::File) => {
                let path = &path_or_uri["file://".len()..];
                Ok(File::open(path).map_err(|e| JigdoError::Io(format!("{path}: {e}")))?)
            }
            Some(UriScheme::Http) | Some(UriScheme::Https) => {
                let mut resp = self
                    .client
                    .get(path_or_uri)
                    .send()
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| JigdoError::FetchFailed(e.to_string()))?;
                let mut tmp = tempfile::tempfile().map_err(JigdoError::from)?;
                io::copy(&mut resp, &mut tmp)
                    .map_err(|e| JigdoError::FetchFailed(e.to_string()))?;
                tmp.seek(SeekFrom::Start(0))?;
                Ok(tmp)
            }
            Some(UriScheme::Ftp) | Some(UriScheme::Other) => Err(JigdoError::FetchFailed(
                format!("unsupported URI scheme in '{path_or_uri}'"),
            )),
        }
    }
}

impl Transport for Fetcher {
    fn fetch(&self, uri: &str, out: &mut [u8], fetched: &AtomicU64) -> Result<usize> {
        match uri_scheme(uri) {
            Some(UriScheme::File) => {
                let path = &uri["file://".len()..];
                let src =
                    File::open(path).map_err(|e| JigdoError::FetchFailed(format!("{path}: {e}")))?;
                copy_capped(src, out, fetched)
            }
            Some(UriScheme::Http) | Some(UriScheme::Https) => {
                let resp = self
                    .client
                    .get(uri)
                    .send()
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| JigdoError::FetchFailed(e.to_string()))?;
                copy_capped(resp, out, fetched)
            }
            _ => Err(JigdoError::FetchFailed(format!(
                "unsupported URI scheme in '{uri}'"
            ))),
        }
    }
}

/// Drain `src` into `out`, refusing to exceed its capacity and
/// enforcing the throughput floor across read calls.
fn copy_capped<R: Read>(mut src: R, out: &mut [u8], fetched: &AtomicU64) -> Result<usize> {
    let mut written = 0usize;
    let mut window_start = Instant::now();
    let mut window_bytes = 0u64;

    loop {
        if written == out.len() {
            // Capacity reached: one more byte means the resource is
            // larger than the part it is supposed to fill.
            let mut probe = [0u8; 1];
            match src.read(&mut probe) {
                Ok(0) => break,
                Ok(_) => {
                    return Err(JigdoError::FetchFailed(
                        "resource exceeds the part size".into(),
                    ))
                }
                Err(e) => return Err(JigdoError::FetchFailed(e.to_string())),
            }
        }

        match src.read(&mut out[written..]) {
            Ok(0) => break,
            Ok(n) => {
                written += n;
                window_bytes += n as u64;
                fetched.store(written as u64, Ordering::Relaxed);
            }
            Err(e) => return Err(JigdoError::FetchFailed(e.to_string())),
        }

        if window_start.elapsed() >= LOW_SPEED_TIME {
            if window_bytes < LOW_SPEED_LIMIT * LOW_SPEED_TIME.as_secs() {
                return Err(JigdoError::FetchFailed(format!(
                    "transfer below {LOW_SPEED_LIMIT} B/s for {}s",
                    LOW_SPEED_TIME.as_secs()
                )));
            }
            window_start = Instant::now();
            window_bytes = 0;
        }
    }

    Ok(written)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn uri_scheme_classification() {
        assert_eq!(uri_scheme("http://host/p"), Some(UriScheme::Http));
        assert_eq!(uri_scheme("HTTPS://host/p"), Some(UriScheme::Https));
        assert_eq!(uri_scheme("file:///tmp/x"), Some(UriScheme::File));
        assert_eq!(uri_scheme("ftp://host/p"), Some(UriScheme::Ftp));
        assert_eq!(uri_scheme("rsync://host/p"), Some(UriScheme::Other));
        assert_eq!(uri_scheme("/plain/path"), None);
        assert_eq!(uri_scheme("relative/path"), None);
        assert_eq!(uri_scheme("weird scheme://x"), None);
    }

    #[test]
    fn file_uri_fetch_fills_the_buffer_and_the_counter() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("part.bin");
        std::fs::write(&path, b"WORLD").unwrap();

        let fetcher = Fetcher::new().unwrap();
        let mut out = [0u8; 5];
        let fetched = AtomicU64::new(0);
        let uri = format!("file://{}", path.display());
        let n = fetcher.fetch(&uri, &mut out, &fetched).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&out, b"WORLD");
        assert_eq!(fetched.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn oversized_resource_is_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.bin");
        std::fs::write(&path, b"too many bytes").unwrap();

        let fetcher = Fetcher::new().unwrap();
        let mut out = [0u8; 4];
        let fetched = AtomicU64::new(0);
        let uri = format!("file://{}", path.display());
        assert!(matches!(
            fetcher.fetch(&uri, &mut out, &fetched),
            Err(JigdoError::FetchFailed(_))
        ));
    }

    #[test]
    fn short_resource_returns_the_short_count() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.bin");
        std::fs::write(&path, b"ab").unwrap();

        let fetcher = Fetcher::new().unwrap();
        let mut out = [0u8; 10];
        let fetched = AtomicU64::new(0);
        let uri = format!("file://{}", path.display());
        assert_eq!(fetcher.fetch(&uri, &mut out, &fetched).unwrap(), 2);
    }

    #[test]
    fn missing_file_uri_is_a_fetch_failure() {
        let fetcher = Fetcher::new().unwrap();
        let mut out = [0u8; 4];
        let fetched = AtomicU64::new(0);
        assert!(matches!(
            fetcher.fetch("file:///nonexistent/__pigdo__", &mut out, &fetched),
            Err(JigdoError::FetchFailed(_))
        ));
    }

    #[test]
    fn ftp_is_reported_unsupported() {
        let fetcher = Fetcher::new().unwrap();
        let mut out = [0u8; 1];
        let fetched = AtomicU64::new(0);
        assert!(matches!(
            fetcher.fetch("ftp://host/file", &mut out, &fetched),
            Err(JigdoError::FetchFailed(_))
        ));
    }

    #[test]
    fn open_handles_paths_and_file_uris() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.bin");
        std::fs::write(&path, b"data").unwrap();

        let fetcher = Fetcher::new().unwrap();
        let mut via_path = String::new();
        fetcher
            .open(path.to_str().unwrap())
            .unwrap()
            .read_to_string(&mut via_path)
            .unwrap();
        assert_eq!(via_path, "data");

        let mut via_uri = String::new();
        fetcher
            .open(&format!("file://{}", path.display()))
            .unwrap()
            .read_to_string(&mut via_uri)
            .unwrap();
        assert_eq!(via_uri, "data");

        assert!(fetcher.open("/nonexistent/__pigdo_open__").is_err());
    }
}
