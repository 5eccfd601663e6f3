//! Error type shared across the reassembly engine.
//!
//! Each variant corresponds to one failure class the engine can surface.
//! Variants carry a human-readable detail string rather than a source
//! error so that a part's fatal cause can be stored in the shared part
//! table and handed back to the driver later (`JigdoError` is `Clone`).

use core::fmt;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, JigdoError>;

/// Failure classes surfaced by the reassembly engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JigdoError {
    /// Template header mismatch, unknown entry type, trailer length
    /// inconsistency, truncated stream, or a violated table invariant.
    BadTemplate(String),
    /// zlib/bzip2 failure, or a chunk that produced the wrong number of
    /// bytes.
    Decompress(String),
    /// Read, write, map, sync, allocate, open, or stat failure.
    Io(String),
    /// Transport refused the URI, the server answered with an error, or
    /// the throughput floor was not met.
    FetchFailed(String),
    /// A fetched part or the finished image did not match its MD5 sum.
    Checksum(String),
    /// A part's URI cannot be resolved: no such MD5 in the recipe, or
    /// its server has neither mirrors nor local directories.
    Config(String),
    /// Mutex or thread primitive failure; always terminal.
    Concurrency(String),
}

impl fmt::Display for JigdoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JigdoError::BadTemplate(s) => write!(f, "bad template: {s}"),
            JigdoError::Decompress(s) => write!(f, "decompression failed: {s}"),
            JigdoError::Io(s) => write!(f, "I/O error: {s}"),
            JigdoError::FetchFailed(s) => write!(f, "fetch failed: {s}"),
            JigdoError::Checksum(s) => write!(f, "checksum mismatch: {s}"),
            JigdoError::Config(s) => write!(f, "configuration error: {s}"),
            JigdoError::Concurrency(s) => write!(f, "concurrency failure: {s}"),
        }
    }
}

impl std::error::Error for JigdoError {}

impl From<std::io::Error> for JigdoError {
    fn from(e: std::io::Error) -> Self {
        JigdoError::Io(e.to_string())
    }
}
