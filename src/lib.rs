// pigdo — parallel jigsaw-download image reassembly

pub mod assemble;
pub mod decompress;
pub mod error;
pub mod fetch;
pub mod glue;
pub mod md5sum;
pub mod parts;
pub mod pool;
pub mod progress;
pub mod recipe;
pub mod template;
pub mod util;

// ─────────────────────────────────────────────────────────────────────────────
// Top-level convenience re-exports for the most common API entry points.
// ─────────────────────────────────────────────────────────────────────────────

/// Crate-wide error type, one variant per failure class.
pub use error::{JigdoError, Result};

/// A 16-byte MD5 digest with hex display and bytewise ordering.
pub use md5sum::Md5Digest;

/// Parsed `.jigdo` recipe: image/template names, parts, servers.
pub use recipe::Recipe;

/// Parse the DESC index from the tail of an open template.
pub use template::read_desc_table;

/// The parsed DESC index: image summary, glue runs, file parts.
pub use template::DescTable;

/// Reconstruct an image from a recipe, table, and template.
pub use assemble::assemble;

/// Tunables for a reassembly run (worker count, retry ceiling).
pub use assemble::AssembleOptions;

/// The byte-source seam workers fetch component files through.
pub use fetch::Transport;

/// Production transport: `file://` and HTTP(S) with redirect support
/// and the low-throughput abort.
pub use fetch::Fetcher;
