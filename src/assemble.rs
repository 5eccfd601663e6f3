//! Reassembly orchestrator: allocates the output image, writes the
//! glue stream, then drives the worker pool until every component file
//! is fetched, verified, and synced.
//!
//! One driver thread owns the scheduling loop; N pool workers each
//! handle one part at a time. The driver tops the pool up to N
//! in-flight fetches, prints the progress line when the completion
//! count changes, services status-dump requests, and paces itself with
//! short sleeps. All shared state goes through the part table's mutex;
//! image bytes are written through per-part map windows whose
//! `[offset, offset + size)` ranges never overlap by construction.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, Write};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use memmap2::MmapOptions;

use crate::error::{JigdoError, Result};
use crate::fetch::Transport;
use crate::glue::write_glue;
use crate::md5sum::{md5_file, md5_mem};
use crate::parts::{Assignment, PartStatus, PartTable, PartsRemain};
use crate::pool::WorkerPool;
use crate::progress::{take_dump_request, verbosity, ProgressBoard, Verbosity};
use crate::recipe::Recipe;
use crate::template::DescTable;
use crate::util::{page_base, page_mod, sleep_millis};

/// Default number of parallel fetch workers.
pub const DEFAULT_WORKERS: usize = 16;

/// Retries granted to a part after its first failed attempt; one more
/// failure marks it fatal.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Driver pacing between scheduling passes.
const DRIVER_PACE_MS: u64 = 12;

/// Tunables for a reassembly run.
#[derive(Debug, Clone)]
pub struct AssembleOptions {
    pub workers: usize,
    pub max_retries: u32,
}

impl Default for AssembleOptions {
    fn default() -> Self {
        AssembleOptions {
            workers: DEFAULT_WORKERS,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Reconstruct the image described by `table` at `image_path`.
///
/// `template` must be the open template the table was parsed from.
/// Existing output content is kept: parts that already verify are not
/// fetched again, which makes an interrupted run resumable.
pub fn assemble<R: Read + Seek>(
    recipe: Arc<Recipe>,
    mut table: DescTable,
    template: &mut R,
    image_path: &Path,
    transport: Arc<dyn Transport>,
    opts: &AssembleOptions,
) -> Result<()> {
    if opts.workers < 1 {
        return Err(JigdoError::Config("worker count must be at least 1".into()));
    }

    let out = open_output(image_path, &mut table)?;
    write_glue(template, &out, &table)?;
    fetch_parts(recipe, &table, out, transport, opts)
}

/// Open (or create) the output file and bring it to image size.
///
/// An output that is already at least image-sized is assumed to be a
/// previous partial run; `existing_file` arms the verification pass.
fn open_output(path: &Path, table: &mut DescTable) -> Result<File> {
    let out = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| JigdoError::Io(format!("{}: {e}", path.display())))?;

    let current = out.metadata()?.len();
    if current < table.image_info.size {
        allocate(&out, table.image_info.size)?;
    } else {
        table.existing_file = true;
    }
    Ok(out)
}

/// Reserve disk space for the whole image.
fn allocate(out: &File, size: u64) -> Result<()> {
    if size == 0 {
        return Ok(());
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    if nix::fcntl::posix_fallocate(out, 0, size as libc::off_t).is_ok() {
        return Ok(());
    }

    // Fallback allocation: writing the final byte forces the length.
    out.write_at(&[0u8], size - 1)
        .map_err(|e| JigdoError::Io(format!("allocating image: {e}")))?;
    Ok(())
}

/// Shared context captured by every fetch job.
#[derive(Clone)]
struct FetchContext {
    recipe: Arc<Recipe>,
    parts: Arc<PartTable>,
    out: Arc<File>,
    transport: Arc<dyn Transport>,
    board: Arc<ProgressBoard>,
    max_retries: u32,
}

/// Fetch phase: local discovery, partial verification, then the worker
/// pool until the table drains, and the final whole-image check.
fn fetch_parts(
    recipe: Arc<Recipe>,
    table: &DescTable,
    out: File,
    transport: Arc<dyn Transport>,
    opts: &AssembleOptions,
) -> Result<()> {
    let parts = Arc::new(PartTable::new(table.files.clone()));
    let out = Arc::new(out);
    let board = ProgressBoard::new();
    let num_parts = parts.len();

    let local = find_local_copies(&recipe, &parts);
    if local > 0 && verbosity() >= Verbosity::Progress {
        println!("{local} files were found locally and do not need to be fetched.");
    }

    let verified = verify_partial(table.existing_file, &out, &parts)?;

    let (total_bytes, incomplete_bytes) = parts.size_totals();
    if verbosity() >= Verbosity::Progress {
        println!(
            "\nNeed to fetch {} files ({} kBytes total).",
            num_parts - verified - local,
            incomplete_bytes / 1024
        );
    }

    let ctx = FetchContext {
        recipe,
        parts: Arc::clone(&parts),
        out: Arc::clone(&out),
        transport,
        board: Arc::clone(&board),
        max_retries: opts.max_retries,
    };

    let pool = WorkerPool::new(opts.workers)?;
    let mut begin_complete = 0usize;
    let mut shown_complete = parts.count_completed().0;

    loop {
        match parts.parts_remain(&mut begin_complete) {
            PartsRemain::Done => break,
            PartsRemain::Fatal => {
                pool.wait_idle();
                return Err(parts.take_fatal_cause().unwrap_or_else(|| {
                    JigdoError::Concurrency("a part failed without a recorded cause".into())
                }));
            }
            PartsRemain::More => {}
        }

        // Top the pool up to one job per worker.
        while pool.in_flight() < opts.workers {
            let Some(assignment) = parts.select_next() else {
                break;
            };
            let job_ctx = ctx.clone();
            pool.submit(move || fetch_one(&job_ctx, assignment));
        }

        let (done, done_bytes) = parts.count_completed();
        if done != shown_complete {
            shown_complete = done;
            if verbosity() >= Verbosity::Progress {
                print!(
                    "\r{done} of {num_parts} files ({}/{} kB) done",
                    done_bytes / 1024,
                    total_bytes / 1024
                );
                std::io::stdout().flush().ok();
            }
        }

        if take_dump_request() {
            board.dump();
        }

        sleep_millis(DRIVER_PACE_MS);
    }
    pool.wait_idle();

    if verbosity() >= Verbosity::Progress {
        print!("\rAll parts assembled. Performing final MD5 verification check...");
        std::io::stdout().flush().ok();
    }

    let actual = md5_file(&out)?;
    if actual == table.image_info.md5 {
        if verbosity() >= Verbosity::Progress {
            println!(" done!");
        }
        Ok(())
    } else {
        if verbosity() >= Verbosity::Progress {
            println!(
                " error!\nExpected: {}; got {}",
                table.image_info.md5,
                actual
            );
        }
        Err(JigdoError::Checksum(format!(
            "image MD5 is {actual}, template declares {}",
            table.image_info.md5
        )))
    }
}

/// Mark parts whose component file already exists, verified, in one of
/// the server's local mirror directories.
fn find_local_copies(recipe: &Recipe, parts: &PartTable) -> usize {
    let mut found = 0;
    for (idx, part, _status) in parts.snapshot() {
        let Some(record) = recipe.lookup_file(part.md5) else {
            // Not fatal here; the worker surfaces it as Config when the
            // part cannot be resolved to any URI.
            if verbosity() >= Verbosity::Errors {
                eprintln!("pigdo: no recipe entry for part {}", part.md5);
            }
            continue;
        };
        if let Some(path) = recipe.find_local_copy(record) {
            parts.mark_local_copy(idx, format!("file://{}", path.display()));
            found += 1;
        }
    }
    found
}

/// Re-verify the slots of a pre-existing output file so already-good
/// parts are not fetched again.
fn verify_partial(existing: bool, out: &File, parts: &PartTable) -> Result<usize> {
    if !existing {
        return Ok(0);
    }

    let num_parts = parts.len();
    if verbosity() >= Verbosity::Progress {
        println!("Verifying partially downloaded file:");
    }

    let mut complete = 0usize;
    for (idx, part, status) in parts.snapshot() {
        // Locally available parts are cheap to fetch; skip the scan.
        if status == PartStatus::LocalCopy {
            continue;
        }

        let matches = if part.size == 0 {
            part.md5 == md5_mem(&[])
        } else {
            let skew = page_mod(part.offset) as usize;
            let map = unsafe {
                MmapOptions::new()
                    .offset(page_base(part.offset))
                    .len(part.size as usize + skew)
                    .map(out)?
            };
            md5_mem(&map[skew..]) == part.md5
        };

        if matches {
            parts.set_status(idx, PartStatus::Complete);
            complete += 1;
        }

        if verbosity() >= Verbosity::Progress {
            print!("\r{complete} out of {num_parts} files OK");
            std::io::stdout().flush().ok();
        }
    }
    if verbosity() >= Verbosity::Progress {
        println!();
    }

    Ok(complete)
}

/// Worker body: resolve, map, fetch, verify, sync.
fn fetch_one(ctx: &FetchContext, assignment: Assignment) {
    let part = assignment.part;

    // Local copies fetch through their file:// URI; everything else
    // rotates through the server's mirrors by attempt number.
    let resolved = assignment.local_uri.clone().or_else(|| {
        ctx.recipe
            .lookup_file(part.md5)
            .and_then(|rec| ctx.recipe.resolve_uri(rec, assignment.attempt))
    });
    let Some(uri) = resolved else {
        let cause = JigdoError::Config(format!("no URI resolvable for part {}", part.md5));
        if verbosity() >= Verbosity::Errors {
            eprintln!("pigdo: {cause}");
        }
        ctx.parts.record_fatal(assignment.index, cause);
        return;
    };

    if part.size == 0 {
        ctx.parts.set_status(assignment.index, PartStatus::Complete);
        return;
    }

    let skew = page_mod(part.offset) as usize;
    let mut map = match unsafe {
        MmapOptions::new()
            .offset(page_base(part.offset))
            .len(part.size as usize + skew)
            .map_mut(&*ctx.out)
    } {
        Ok(map) => map,
        Err(e) => {
            let cause = JigdoError::Io(format!("mapping part at {}: {e}", part.offset));
            if verbosity() >= Verbosity::Errors {
                eprintln!("pigdo: {cause}");
            }
            ctx.parts.record_fatal(assignment.index, cause);
            return;
        }
    };

    ctx.parts.set_status(assignment.index, PartStatus::InProgress);
    let ticket = ProgressBoard::start(&ctx.board, uri.clone(), part.size);
    let fetch_result = {
        let window = &mut map[skew..skew + part.size as usize];
        ctx.transport.fetch(&uri, window, &ticket.fetched)
    };
    drop(ticket);

    let outcome = match fetch_result {
        Ok(n) if n as u64 == part.size => {
            if md5_mem(&map[skew..skew + part.size as usize]) == part.md5 {
                // Publish Complete only once the bytes are durable.
                map.flush().map_err(JigdoError::from)
            } else {
                Err(JigdoError::Checksum(format!(
                    "{uri} does not match the expected part checksum"
                )))
            }
        }
        Ok(n) => Err(JigdoError::FetchFailed(format!(
            "{uri}: got {n} of {} bytes",
            part.size
        ))),
        Err(e) => Err(e),
    };

    match outcome {
        Ok(()) => ctx.parts.set_status(assignment.index, PartStatus::Complete),
        Err(cause) => {
            if verbosity() >= Verbosity::Detail {
                eprintln!("pigdo: attempt {} for {uri}: {cause}", assignment.attempt);
            }
            let status = ctx
                .parts
                .record_failure(assignment.index, ctx.max_retries, cause);
            if status == PartStatus::FatalError && verbosity() >= Verbosity::Errors {
                eprintln!("pigdo: giving up on {uri}");
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
