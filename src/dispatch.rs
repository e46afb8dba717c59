//! Write-transaction dispatch. Every environment owns one writer thread;
//! all operations of a write transaction run on it, so the engine sees a
//! single mutating thread for the environment's whole lifetime. The gate
//! serializes writers and is waited on from the caller's thread, never from
//! the worker, so a blocked writer can never wedge the queue.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Sender};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result, UsageError};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Mutual exclusion for the single write transaction of an environment.
pub(crate) struct WriterGate {
    locked: Mutex<bool>,
    cv: Condvar,
}

impl WriterGate {
    pub fn new() -> WriterGate {
        WriterGate { locked: Mutex::new(false), cv: Condvar::new() }
    }

    /// Block until the previous writer releases.
    pub fn acquire(&self) {
        let mut locked = self.locked.lock();
        while *locked {
            self.cv.wait(&mut locked);
        }
        *locked = true;
    }

    pub fn release(&self) {
        let mut locked = self.locked.lock();
        *locked = false;
        self.cv.notify_one();
    }
}

/// Handle to the environment's writer thread.
pub(crate) struct WriterContext {
    jobs: Option<Sender<Job>>,
    thread: Option<JoinHandle<()>>,
}

impl WriterContext {
    pub fn spawn(label: &str) -> WriterContext {
        let (tx, rx) = unbounded::<Job>();
        let name = format!("keybridge-writer-{label}");
        let builder = thread::Builder::new().name(name);
        let thread = builder.spawn(move || {
            for job in rx {
                job();
            }
        });
        match thread {
            Ok(handle) => {
                debug!("spawned writer thread for {label}");
                WriterContext { jobs: Some(tx), thread: Some(handle) }
            }
            Err(err) => {
                warn!("failed to spawn writer thread: {err}");
                WriterContext { jobs: None, thread: None }
            }
        }
    }

    /// Run a closure on the writer thread and wait for its result.
    pub fn run<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let jobs = match &self.jobs {
            Some(jobs) => jobs,
            None => return Err(Error::Usage(UsageError::StaleHandle)),
        };
        let (reply_tx, reply_rx) = bounded(1);
        let job: Job = Box::new(move || {
            // The caller may have given up; a dead reply channel is fine.
            let _ = reply_tx.send(f());
        });
        jobs.send(job).map_err(|_| Error::Usage(UsageError::StaleHandle))?;
        reply_rx.recv().map_err(|_| Error::Usage(UsageError::StaleHandle))
    }

    /// Drain the queue and stop the thread. Called once, at close.
    pub fn shutdown(&mut self) {
        self.jobs.take();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("writer thread panicked during shutdown");
            } else {
                debug!("writer thread stopped");
            }
        }
    }
}

impl Drop for WriterContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn jobs_run_on_one_thread_in_order() {
        let ctx = WriterContext::spawn("test");
        let first = ctx.run(|| thread::current().id()).unwrap();
        let second = ctx.run(|| thread::current().id()).unwrap();
        assert_eq!(first, second);
        assert_ne!(first, thread::current().id());
    }

    #[test]
    fn gate_serializes_two_writers() {
        let gate = Arc::new(WriterGate::new());
        let active = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let gate = gate.clone();
            let active = active.clone();
            handles.push(thread::spawn(move || {
                gate.acquire();
                assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                thread::sleep(std::time::Duration::from_millis(5));
                assert_eq!(active.fetch_sub(1, Ordering::SeqCst), 1);
                gate.release();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
