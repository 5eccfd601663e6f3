//! Part selection and status accounting for the fetch phase.
//!
//! One [`PartTable`] is shared by the driver and every worker. A single
//! mutex guards all status reads and writes; selection is an atomic
//! find-and-mark under that mutex, so no two workers can ever observe
//! the same part as eligible. The lock is never held across I/O.

use std::sync::Mutex;

use crate::error::JigdoError;
use crate::template::FilePart;

/// Reassembly state of one component-file part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartStatus {
    /// Not yet handed to any worker.
    NotStarted,
    /// Picked by the driver; a worker will start on it shortly.
    Assigned,
    /// A worker is actively fetching it.
    InProgress,
    /// Fetched, verified, and synced to disk. Terminal.
    Complete,
    /// The last attempt failed; eligible for re-selection.
    Error,
    /// Failed permanently; aborts the run. Terminal.
    FatalError,
    /// A verified copy exists in a local mirror directory; the fetch
    /// will use a `file://` URI.
    LocalCopy,
}

/// Result of a [`PartTable::parts_remain`] scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartsRemain {
    /// Every part is complete.
    Done,
    /// At least one part still needs work.
    More,
    /// A part hit a fatal error; the run must abort.
    Fatal,
}

/// A part plus its mutable reassembly state.
#[derive(Debug, Clone)]
struct PartSlot {
    part: FilePart,
    status: PartStatus,
    /// Times this part has been handed to a worker. Drives the
    /// deterministic mirror rotation and the retry ceiling.
    attempts: u32,
    /// Resolved `file://` URI when a local copy was discovered.
    local_uri: Option<String>,
    /// Cause recorded when the part went fatal.
    fatal_cause: Option<JigdoError>,
}

/// An assignment handed to a worker by [`PartTable::select_next`].
#[derive(Debug, Clone)]
pub struct Assignment {
    /// Index of the slot, used for all later status updates.
    pub index: usize,
    /// Immutable part description (copied out so the worker never
    /// touches the table without the lock).
    pub part: FilePart,
    /// 1-based attempt number of this assignment.
    pub attempt: u32,
    /// Local-copy URI, if discovery found one.
    pub local_uri: Option<String>,
}

/// The shared part table.
pub struct PartTable {
    slots: Mutex<Vec<PartSlot>>,
}

impl PartTable {
    /// Build a table from the template's file parts, sorted largest
    /// first so the longest downloads start earliest.
    pub fn new(mut files: Vec<FilePart>) -> Self {
        files.sort_by(|a, b| b.size.cmp(&a.size));
        let slots = files
            .into_iter()
            .map(|part| PartSlot {
                part,
                status: PartStatus::NotStarted,
                attempts: 0,
                local_uri: None,
                fatal_cause: None,
            })
            .collect();
        PartTable {
            slots: Mutex::new(slots),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Atomically find the first eligible part and mark it `Assigned`.
    ///
    /// Eligible states are `NotStarted`, `Error`, and `LocalCopy`. The
    /// scan is a plain linear pass from index 0, so retries are picked
    /// up in table order. Returns `None` once nothing is eligible.
    pub fn select_next(&self) -> Option<Assignment> {
        let mut slots = self.slots.lock().unwrap();
        let idx = slots.iter().position(|s| {
            matches!(
                s.status,
                PartStatus::NotStarted | PartStatus::Error | PartStatus::LocalCopy
            )
        })?;
        let slot = &mut slots[idx];
        slot.status = PartStatus::Assigned;
        slot.attempts += 1;
        Some(Assignment {
            index: idx,
            part: slot.part,
            attempt: slot.attempts,
            local_uri: slot.local_uri.clone(),
        })
    }

    pub fn set_status(&self, index: usize, status: PartStatus) {
        self.slots.lock().unwrap()[index].status = status;
    }

    pub fn get_status(&self, index: usize) -> PartStatus {
        self.slots.lock().unwrap()[index].status
    }

    /// Record a local-copy discovery: the part is fetched through the
    /// given `file://` URI instead of a remote mirror.
    pub fn mark_local_copy(&self, index: usize, uri: String) {
        let mut slots = self.slots.lock().unwrap();
        let slot = &mut slots[index];
        slot.status = PartStatus::LocalCopy;
        slot.local_uri = Some(uri);
    }

    /// Record a failed attempt. The part returns to `Error` (eligible
    /// for retry) until it has been attempted `1 + max_retries` times,
    /// after which it goes `FatalError` with `cause` preserved.
    pub fn record_failure(&self, index: usize, max_retries: u32, cause: JigdoError) -> PartStatus {
        let mut slots = self.slots.lock().unwrap();
        let slot = &mut slots[index];
        if slot.attempts > max_retries {
            slot.status = PartStatus::FatalError;
            slot.fatal_cause = Some(cause);
        } else {
            slot.status = PartStatus::Error;
        }
        slot.status
    }

    /// Record an unrecoverable failure regardless of retry budget.
    pub fn record_fatal(&self, index: usize, cause: JigdoError) {
        let mut slots = self.slots.lock().unwrap();
        let slot = &mut slots[index];
        slot.status = PartStatus::FatalError;
        slot.fatal_cause = Some(cause);
    }

    /// Scan for outstanding work, starting past the contiguous prefix
    /// of complete parts tracked in `begin_complete` to bound the cost
    /// of repeated calls.
    pub fn parts_remain(&self, begin_complete: &mut usize) -> PartsRemain {
        let slots = self.slots.lock().unwrap();
        for i in *begin_complete..slots.len() {
            match slots[i].status {
                PartStatus::FatalError => return PartsRemain::Fatal,
                PartStatus::Complete => *begin_complete = i + 1,
                _ => return PartsRemain::More,
            }
        }
        PartsRemain::Done
    }

    /// Number of complete parts and the bytes they cover.
    pub fn count_completed(&self) -> (usize, u64) {
        let slots = self.slots.lock().unwrap();
        slots
            .iter()
            .filter(|s| s.status == PartStatus::Complete)
            .fold((0, 0), |(n, bytes), s| (n + 1, bytes + s.part.size))
    }

    /// Total part bytes and the subset not yet complete.
    pub fn size_totals(&self) -> (u64, u64) {
        let slots = self.slots.lock().unwrap();
        slots.iter().fold((0, 0), |(total, incomplete), s| {
            let inc = if s.status == PartStatus::Complete {
                0
            } else {
                s.part.size
            };
            (total + s.part.size, incomplete + inc)
        })
    }

    /// Snapshot of every part and its status, for the single-threaded
    /// discovery and verification passes that run before the pool.
    pub fn snapshot(&self) -> Vec<(usize, FilePart, PartStatus)> {
        let slots = self.slots.lock().unwrap();
        slots
            .iter()
            .enumerate()
            .map(|(i, s)| (i, s.part, s.status))
            .collect()
    }

    /// The recorded cause of the first fatal part, if any.
    pub fn take_fatal_cause(&self) -> Option<JigdoError> {
        let slots = self.slots.lock().unwrap();
        slots.iter().find_map(|s| s.fatal_cause.clone())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
