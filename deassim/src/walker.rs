//! Directory-job scheduler and worker pool.
//!
//! The walker seeds one job for the source root and runs W workers over the
//! shared [`JobQueue`]. Each job lists one source directory, creates the
//! target subdirectories and schedules their jobs, replicates the remaining
//! entries, and finally applies the directory's own metadata.
//!
//! A child job that does not fit under the ceiling is deferred onto the
//! worker's local stack. Once the current directory is done the worker hands
//! deferred jobs back to the queue while there is room, and processes the
//! rest itself under the slot it already holds. No worker ever waits for
//! capacity, and traversal never recurses.

use crate::config::ReplicationConfig;
use crate::entry::{EntryKind, SourceEntry};
use crate::error::{DeassimError, DeassimResult};
use crate::queue::{DirectoryJob, JobQueue};
use crate::registry::InodeRegistry;
use crate::replicator::EntryReplicator;
use crate::retry::RetryPolicy;
use crate::stats::RunStatistics;
use chrono::Utc;
use deassim_protocol::{DirectoryReport, RunSummary, StatusEvent};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Run-scoped state shared by every worker
pub struct RunContext {
    pub registry: Arc<InodeRegistry>,
    pub stats: Arc<RunStatistics>,
    pub replicator: EntryReplicator,
    pub queue: Arc<JobQueue>,
    pub retry: RetryPolicy,
}

/// Cancels a running replication from another task
#[derive(Debug, Clone)]
pub struct RunHandle {
    queue: Arc<JobQueue>,
}

impl RunHandle {
    /// Stop scheduling: queued jobs are dropped and workers stop after their current entry
    pub fn cancel(&self) {
        if !self.queue.is_cancelled() {
            warn!("Replication cancelled, finishing in-flight entries");
        }
        self.queue.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.queue.is_cancelled()
    }
}

pub struct TreeWalker {
    config: ReplicationConfig,
    queue: Arc<JobQueue>,
    events: Option<mpsc::Sender<StatusEvent>>,
}

impl TreeWalker {
    pub fn new(config: ReplicationConfig) -> Self {
        let queue = Arc::new(JobQueue::new(config.effective_workers()));
        Self {
            config,
            queue,
            events: None,
        }
    }

    /// Forward every scheduling decision to a status reporter
    pub fn with_status_events(mut self, events: mpsc::Sender<StatusEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn handle(&self) -> RunHandle {
        RunHandle {
            queue: Arc::clone(&self.queue),
        }
    }

    /// Replicate the whole source tree and return the run summary.
    ///
    /// Only an unusable root or invalid configuration fails the run; every
    /// other failure is logged, counted and isolated to its entry or branch.
    pub async fn run(self) -> DeassimResult<RunSummary> {
        self.config.validate()?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start_time = Instant::now();
        let workers = self.config.effective_workers();

        info!(
            "Starting run {}: {:?} -> {:?} with {} workers",
            run_id, self.config.source_root, self.config.target_root, workers
        );

        let retry = self.config.retry.policy();
        let root_job = start(&self.config.source_root, &self.config.target_root).await?;

        let registry = Arc::new(InodeRegistry::new());
        let stats = Arc::new(RunStatistics::new(self.events, self.config.statistics));
        let replicator = EntryReplicator::new(
            Arc::clone(&registry),
            Arc::clone(&stats),
            retry.clone(),
            self.config.block_size,
        );
        let ctx = Arc::new(RunContext {
            registry,
            stats: Arc::clone(&stats),
            replicator,
            queue: Arc::clone(&self.queue),
            retry,
        });

        if self.queue.try_push(root_job).is_ok() {
            stats.emit(StatusEvent::Enqueued).await;
        } else {
            debug!("Run {} cancelled before the root job was seeded", run_id);
        }

        let mut pool = JoinSet::new();
        for worker_id in 0..workers {
            pool.spawn(worker_loop(Arc::clone(&ctx), worker_id));
        }

        while let Some(result) = pool.join_next().await {
            if let Err(e) = result {
                // A lost worker still holds its slot; stop the others instead of hanging.
                error!("Worker task failed: {}", e);
                stats.record_error();
                self.queue.cancel();
            }
        }

        let interrupted = self.queue.is_cancelled();
        let directories = stats.take_directory_reports();
        let counters = stats.snapshot();
        drop(ctx);

        let summary = RunSummary {
            run_id,
            source_root: self.config.source_root.clone(),
            target_root: self.config.target_root.clone(),
            started_at,
            finished_at: Utc::now(),
            elapsed_secs: start_time.elapsed().as_secs_f64(),
            workers,
            peak_outstanding: self.queue.peak_outstanding(),
            interrupted,
            counters,
            directories,
        };

        info!(
            "Run {} finished in {:.2}s: {} directories, {} files ({} bytes), {} symlinks, {} hardlinks, {} skipped, {} errors",
            run_id,
            summary.elapsed_secs,
            counters.directories,
            counters.files_copied,
            counters.bytes_copied,
            counters.symlinks_created,
            counters.hardlinks_created,
            counters.skipped,
            counters.errors
        );

        Ok(summary)
    }
}

/// Validate both roots and build the root job
async fn start(source_root: &Path, target_root: &Path) -> DeassimResult<DirectoryJob> {
    let root_inaccessible = |path: &Path, source: io::Error| DeassimError::RootInaccessible {
        path: path.to_path_buf(),
        source,
    };

    // The root itself may be reached through a symlinked mount point.
    let metadata = tokio::fs::metadata(source_root)
        .await
        .map_err(|e| root_inaccessible(source_root, e))?;
    if !metadata.is_dir() {
        return Err(root_inaccessible(
            source_root,
            io::Error::new(io::ErrorKind::Other, "source root is not a directory"),
        ));
    }
    // Only the permission to list matters here; the handle is not used.
    drop(
        tokio::fs::read_dir(source_root)
            .await
            .map_err(|e| root_inaccessible(source_root, e))?,
    );

    tokio::fs::create_dir_all(target_root)
        .await
        .map_err(|e| root_inaccessible(target_root, e))?;
    let target_metadata = tokio::fs::metadata(target_root)
        .await
        .map_err(|e| root_inaccessible(target_root, e))?;
    if !target_metadata.is_dir() {
        return Err(root_inaccessible(
            target_root,
            io::Error::new(io::ErrorKind::Other, "target root is not a directory"),
        ));
    }

    let entry = SourceEntry::from_metadata(source_root.to_path_buf(), PathBuf::new(), &metadata, None);
    Ok(DirectoryJob::new(
        source_root.to_path_buf(),
        target_root.to_path_buf(),
        entry,
        0,
    ))
}

async fn worker_loop(ctx: Arc<RunContext>, worker_id: usize) {
    debug!("Worker {} started", worker_id);
    let mut deferred: Vec<DirectoryJob> = Vec::new();
    let mut processed = 0u64;

    while let Some(job) = ctx.queue.pop().await {
        let mut current = Some(job);

        while let Some(job) = current.take() {
            if let Err(e) = process(&ctx, &job, &mut deferred).await {
                error!("Abandoning branch {:?}: {}", job.source_dir, e);
                ctx.stats.record_error();
            }
            ctx.stats.emit(StatusEvent::Completed).await;
            processed += 1;

            if ctx.queue.is_cancelled() {
                if !deferred.is_empty() {
                    debug!("Worker {} dropping {} deferred jobs", worker_id, deferred.len());
                    deferred.clear();
                }
                break;
            }

            // Hand deferred work back while there is room; keep the rest for ourselves.
            while let Some(next) = deferred.pop() {
                match ctx.queue.try_push(next) {
                    Ok(()) => ctx.stats.emit(StatusEvent::Enqueued).await,
                    Err(next) => {
                        current = Some(next);
                        break;
                    }
                }
            }
        }

        ctx.queue.complete();
    }

    debug!("Worker {} finished after {} directories", worker_id, processed);
}

/// Process one directory job. An `Err` abandons this branch only.
pub async fn process(ctx: &RunContext, job: &DirectoryJob, deferred: &mut Vec<DirectoryJob>) -> DeassimResult<()> {
    debug!("Processing {:?} (depth {})", job.source_dir, job.depth);

    let names = ctx
        .retry
        .run("readdir", &job.source_dir, || list_directory(&job.source_dir))
        .await
        .map_err(DeassimError::into_directory_failure)?;

    let entries = snapshot_entries(ctx, job, names).await;

    // Subdirectories first so other workers can start on them early.
    let mut report = ctx
        .stats
        .collects_directory_reports()
        .then(|| DirectoryReport::new(job.source_dir.clone()));
    let mut others = Vec::new();

    for entry in entries {
        if entry.kind != EntryKind::Directory {
            if let Some(report) = report.as_mut() {
                report.record(&entry.name, entry.size);
            }
            others.push(entry);
            continue;
        }
        if ctx.queue.is_cancelled() {
            return Ok(());
        }

        let target_dir = job.target_dir.join(&entry.name);
        if let Err(e) = ctx.replicator.replicate(&entry, &target_dir).await {
            error!("Skipping subtree {:?}: {}", entry.source_path, e);
            ctx.stats.record_error();
            continue;
        }

        let child = DirectoryJob::new(entry.source_path.clone(), target_dir, entry, job.depth + 1);
        schedule(ctx, child, deferred).await;
    }

    for entry in &others {
        if ctx.queue.is_cancelled() {
            return Ok(());
        }
        let target = job.target_dir.join(&entry.name);
        if let Err(e) = ctx.replicator.replicate(entry, &target).await {
            error!("Failed to replicate {:?}: {}", entry.source_path, e);
            ctx.stats.record_error();
        }
    }

    if let Some(report) = report {
        ctx.stats.push_directory_report(report);
    }

    ctx.replicator.finish_directory(&job.entry, &job.target_dir).await;
    Ok(())
}

/// `lstat` every listed name. An entry that cannot be examined is counted and
/// left out; its siblings are still replicated.
async fn snapshot_entries(ctx: &RunContext, job: &DirectoryJob, names: Vec<OsString>) -> Vec<SourceEntry> {
    let mut entries = Vec::with_capacity(names.len());
    for name in names {
        let source_path = job.source_dir.join(&name);
        let relative_path = job.entry.relative_path.join(&name);
        match SourceEntry::snapshot(&source_path, &relative_path, &ctx.retry).await {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                error!("Cannot examine {:?}: {}", source_path, e);
                ctx.stats.record_error();
            }
        }
    }
    entries
}

async fn schedule(ctx: &RunContext, job: DirectoryJob, deferred: &mut Vec<DirectoryJob>) {
    match ctx.queue.try_push(job) {
        Ok(()) => ctx.stats.emit(StatusEvent::Enqueued).await,
        Err(job) => {
            ctx.stats.emit(StatusEvent::Saturated).await;
            deferred.push(job);
        }
    }
}

async fn list_directory(dir: &Path) -> io::Result<Vec<OsString>> {
    let mut reader = tokio::fs::read_dir(dir).await?;
    let mut names = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        names.push(entry.file_name());
    }
    Ok(names)
}
