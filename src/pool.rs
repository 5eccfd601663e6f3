//! Fetch worker crew: a fixed set of long-lived OS threads fed through
//! a job channel.
//!
//! The reassembly driver needs exactly three things here: hand a
//! part-fetch job to an idle worker, see how many jobs are still live
//! so it never commits more than one per worker, and drain everything
//! before the final image check. Workers are plain named threads that
//! consume boxed closures from a shared `crossbeam_channel`; a gauge
//! counts each job from submission until its closure returns and wakes
//! drain waiters when the count hits zero. Dropping the pool closes
//! the channel, which ends every worker loop, and joins the threads.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};

use crate::error::{JigdoError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Count of submitted-but-unfinished jobs, with a drain wakeup.
#[derive(Default)]
struct LiveGauge {
    count: Mutex<usize>,
    drained: Condvar,
}

impl LiveGauge {
    fn job_submitted(&self) {
        *self.count.lock().unwrap() += 1;
    }

    fn job_finished(&self) {
        let mut live = self.count.lock().unwrap();
        *live -= 1;
        if *live == 0 {
            self.drained.notify_all();
        }
    }

    fn live(&self) -> usize {
        *self.count.lock().unwrap()
    }

    fn wait_drained(&self) {
        let mut live = self.count.lock().unwrap();
        while *live > 0 {
            live = self.drained.wait(live).unwrap();
        }
    }
}

/// A fixed crew of fetch workers.
pub struct WorkerPool {
    /// `Option` so drop can hang up the channel before joining.
    job_tx: Option<Sender<Job>>,
    crew: Vec<JoinHandle<()>>,
    gauge: Arc<LiveGauge>,
}

impl WorkerPool {
    /// Spawn `nb_workers` worker threads (at least one).
    pub fn new(nb_workers: usize) -> Result<Self> {
        if nb_workers < 1 {
            return Err(JigdoError::Concurrency(
                "a worker pool needs at least one thread".into(),
            ));
        }

        let (job_tx, job_rx) = unbounded::<Job>();
        let gauge = Arc::new(LiveGauge::default());

        let mut crew = Vec::with_capacity(nb_workers);
        for n in 0..nb_workers {
            let jobs = job_rx.clone();
            let gauge = Arc::clone(&gauge);
            let handle = thread::Builder::new()
                .name(format!("fetch-{n}"))
                .spawn(move || {
                    // Runs until every sender is gone.
                    for job in jobs.iter() {
                        job();
                        gauge.job_finished();
                    }
                })
                .map_err(|e| JigdoError::Concurrency(format!("spawning worker: {e}")))?;
            crew.push(handle);
        }

        Ok(WorkerPool {
            job_tx: Some(job_tx),
            crew,
            gauge,
        })
    }

    /// Queue one job for the next idle worker.
    ///
    /// The driver caps itself at one live job per worker via
    /// [`WorkerPool::in_flight`], so the queue never grows past the
    /// crew size.
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // Count before sending so a job a worker picks up immediately
        // is never missed by `in_flight`.
        self.gauge.job_submitted();
        self.job_tx
            .as_ref()
            .expect("worker pool channel closed early")
            .send(Box::new(job))
            .expect("worker threads exited while the pool is alive");
    }

    /// Jobs submitted whose closures have not yet returned.
    pub fn in_flight(&self) -> usize {
        self.gauge.live()
    }

    /// Block until every submitted job has finished. The crew stays
    /// around for further work.
    pub fn wait_idle(&self) {
        self.gauge.wait_drained();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Hanging up the channel ends each worker's loop; jobs still
        // queued are delivered first, so the joins see them through.
        self.job_tx.take();
        for worker in self.crew.drain(..) {
            let _ = worker.join();
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
