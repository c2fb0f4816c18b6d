//! Detector worker pool.
//!
//! CPU-bound evaluation (the Isolation Forest refit in particular) runs on a
//! fixed set of named OS threads fed by a shared crossbeam channel. Async
//! callers get their result back through a tokio oneshot, so the runtime's
//! dispatch threads never run detector code.

use crate::error::{EngineError, Result};
use crossbeam_channel::{Receiver, Sender, bounded, select, unbounded};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Mutex, PoisonError};
use std::thread;
use tokio::sync::oneshot;
use tracing::{error, info};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    jobs: Sender<Job>,
    shutdown: Mutex<Option<Sender<()>>>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Result<Self> {
        if threads == 0 {
            return Err(EngineError::Configuration(
                "worker pool needs at least one thread".into(),
            ));
        }

        let (jobs_tx, jobs_rx) = unbounded::<Job>();
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);

        let mut handles = Vec::with_capacity(threads);
        for id in 0..threads {
            let jobs = jobs_rx.clone();
            let shutdown = shutdown_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("quorum-worker-{}", id))
                .spawn(move || {
                    run_worker(id, jobs, shutdown);
                    info!(worker = id, "Detector worker stopped.");
                })
                .map_err(|e| {
                    EngineError::Configuration(format!("cannot spawn worker {}: {}", id, e))
                })?;
            handles.push(handle);
        }
        info!(workers = threads, "Detector worker pool started.");

        Ok(Self {
            jobs: jobs_tx,
            shutdown: Mutex::new(Some(shutdown_tx)),
            handles: Mutex::new(handles),
            size: threads,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Runs `f` on a worker thread and awaits its result.
    pub async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let _ = tx.send(f());
        });
        self.jobs
            .send(job)
            .map_err(|_| EngineError::Unavailable("worker pool is shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Unavailable("worker dropped the job".into()))
    }

    /// Stops accepting work, finishes queued jobs and joins every worker.
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        let signal = self
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if signal.is_none() {
            return;
        }
        drop(signal);

        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let current = thread::current().id();
        for handle in handles {
            // A worker dropping the last pool reference cannot join itself
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("Detector worker panicked during shutdown.");
            }
        }
        info!("Detector worker pool stopped.");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(id: usize, jobs: Receiver<Job>, shutdown: Receiver<()>) {
    let execute = |job: Job| {
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!(worker = id, "Detector job panicked.");
        }
    };

    loop {
        select! {
            recv(jobs) -> job => match job {
                Ok(job) => execute(job),
                Err(_) => break,
            },
            recv(shutdown) -> _ => {
                for job in jobs.try_iter() {
                    execute(job);
                }
                break;
            }
        }
    }
}
