//! Verbosity control, the active-fetch progress board, and the
//! signal-triggered status dump.
//!
//! Workers publish their current URI and a live byte counter here; a
//! `SIGUSR1` merely sets a flag that the driver loop drains between
//! scheduling passes, so nothing but an atomic store happens in
//! signal context. The dump is best-effort: counters are read relaxed
//! and only a human looks at the output.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::error::{JigdoError, Result};

// ── Verbosity ─────────────────────────────────────────────────────────────────

/// How much the tool says. Each level includes everything below it, so
/// call sites compare with `>=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Verbosity {
    /// Nothing at all (test runs).
    Silent = 0,
    /// Failures only.
    Errors = 1,
    /// The usual progress lines.
    Progress = 2,
    /// Per-attempt fetch diagnostics.
    Detail = 3,
    /// Everything.
    Debug = 4,
}

impl Verbosity {
    /// Map the command line's `-q` / repeated `-v` onto a level.
    pub fn from_flags(quiet: bool, verbose: u8) -> Verbosity {
        if quiet {
            Verbosity::Errors
        } else {
            match verbose {
                0 => Verbosity::Progress,
                1 => Verbosity::Detail,
                _ => Verbosity::Debug,
            }
        }
    }

    fn from_raw(raw: u8) -> Verbosity {
        match raw {
            0 => Verbosity::Silent,
            1 => Verbosity::Errors,
            2 => Verbosity::Progress,
            3 => Verbosity::Detail,
            _ => Verbosity::Debug,
        }
    }
}

/// Process-wide level; workers and the driver read it concurrently.
static VERBOSITY: AtomicU8 = AtomicU8::new(Verbosity::Progress as u8);

/// Current verbosity.
pub fn verbosity() -> Verbosity {
    Verbosity::from_raw(VERBOSITY.load(Ordering::Relaxed))
}

pub fn set_verbosity(level: Verbosity) {
    VERBOSITY.store(level as u8, Ordering::Relaxed);
}

// ── Active-fetch board ────────────────────────────────────────────────────────

struct ActiveFetch {
    uri: String,
    size: u64,
    fetched: Arc<AtomicU64>,
}

/// Registry of fetches currently in flight, one entry per live worker
/// job.
#[derive(Default)]
pub struct ProgressBoard {
    slots: Mutex<Vec<Option<ActiveFetch>>>,
}

impl ProgressBoard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a fetch. The returned ticket carries the byte counter
    /// the transport updates and unregisters the fetch on drop.
    pub fn start(board: &Arc<ProgressBoard>, uri: String, size: u64) -> FetchTicket {
        let fetched = Arc::new(AtomicU64::new(0));
        let entry = ActiveFetch {
            uri,
            size,
            fetched: Arc::clone(&fetched),
        };
        let mut slots = board.slots.lock().unwrap();
        let slot = match slots.iter().position(Option::is_none) {
            Some(i) => {
                slots[i] = Some(entry);
                i
            }
            None => {
                slots.push(Some(entry));
                slots.len() - 1
            }
        };
        FetchTicket {
            board: Arc::clone(board),
            slot,
            fetched,
        }
    }

    /// Print one `uri: fetched/size bytes` line per active fetch.
    pub fn dump(&self) {
        let slots = self.slots.lock().unwrap();
        for entry in slots.iter().flatten() {
            println!(
                "{}: {}/{} bytes",
                entry.uri,
                entry.fetched.load(Ordering::Relaxed),
                entry.size
            );
        }
    }
}

/// Live handle on one registered fetch.
pub struct FetchTicket {
    board: Arc<ProgressBoard>,
    slot: usize,
    /// Counter the transport stores progress into.
    pub fetched: Arc<AtomicU64>,
}

impl Drop for FetchTicket {
    fn drop(&mut self) {
        self.board.slots.lock().unwrap()[self.slot] = None;
    }
}

// ── Status-dump signal ────────────────────────────────────────────────────────

static DUMP_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn request_dump(_signum: libc::c_int) {
    DUMP_REQUESTED.store(true, Ordering::Relaxed);
}

/// Route `SIGUSR1` to the dump-request flag.
pub fn install_dump_signal() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(request_dump),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGUSR1, &action) }
        .map_err(|e| JigdoError::Io(format!("sigaction: {e}")))?;
    Ok(())
}

/// Consume a pending dump request, if one arrived.
pub fn take_dump_request() -> bool {
    DUMP_REQUESTED.swap(false, Ordering::Relaxed)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
