//! Shared queue of directory jobs, bounded by the worker ceiling W.
//!
//! A job holds one slot from the moment it is accepted until the worker that
//! picked it up calls [`JobQueue::complete`]. Queued plus in-flight jobs never
//! exceed the ceiling; [`JobQueue::try_push`] never waits for capacity.

use crate::entry::SourceEntry;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tracing::debug;

/// One unit of parallel work: a single source directory
#[derive(Debug, Clone)]
pub struct DirectoryJob {
    pub source_dir: PathBuf,
    pub target_dir: PathBuf,
    /// Snapshot of the directory itself, applied to `target_dir` when the job finishes
    pub entry: SourceEntry,
    pub depth: usize,
}

impl DirectoryJob {
    pub fn new(source_dir: PathBuf, target_dir: PathBuf, entry: SourceEntry, depth: usize) -> Self {
        Self {
            source_dir,
            target_dir,
            entry,
            depth,
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: VecDeque<DirectoryJob>,
    outstanding: usize,
    peak: usize,
    closed: bool,
}

#[derive(Debug)]
pub struct JobQueue {
    ceiling: usize,
    state: Mutex<QueueState>,
    notify: Notify,
    cancelled: AtomicBool,
}

impl JobQueue {
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling: ceiling.max(1),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Reserve a slot and queue `job`. Hands the job back when the ceiling is
    /// reached or the queue is closed.
    pub fn try_push(&self, job: DirectoryJob) -> Result<(), DirectoryJob> {
        {
            let mut state = self.state.lock();
            if state.closed || state.outstanding >= self.ceiling {
                return Err(job);
            }
            state.outstanding += 1;
            state.peak = state.peak.max(state.outstanding);
            state.jobs.push_back(job);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Wait for the next job. `None` once the queue is drained and no job is
    /// in flight, or after cancellation.
    pub async fn pop(&self) -> Option<DirectoryJob> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking state so a wakeup in between is not lost.
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(job) = state.jobs.pop_front() {
                    return Some(job);
                }
                if state.closed || state.outstanding == 0 {
                    state.closed = true;
                    drop(state);
                    self.notify.notify_waiters();
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Release the slot held by a finished job
    pub fn complete(&self) {
        let drained = {
            let mut state = self.state.lock();
            state.outstanding = state.outstanding.saturating_sub(1);
            if state.outstanding == 0 && state.jobs.is_empty() {
                state.closed = true;
                true
            } else {
                false
            }
        };
        if drained {
            debug!("Job queue drained");
            self.notify.notify_waiters();
        }
    }

    /// Close the queue and drop everything still waiting in it
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let dropped = {
            let mut state = self.state.lock();
            let dropped = state.jobs.len();
            state.jobs.clear();
            state.outstanding = state.outstanding.saturating_sub(dropped);
            state.closed = true;
            dropped
        };
        debug!("Job queue cancelled, dropped {} queued jobs", dropped);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Queued plus in-flight jobs
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }

    pub fn peak_outstanding(&self) -> usize {
        self.state.lock().peak
    }
}
