use deassim_protocol::{DirectoryReport, RunCounters, StatusEvent};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Symbols per line on the live status stream
const STATUS_LINE_WIDTH: u64 = 80;

/// Counters shared by every worker of one run
#[derive(Debug, Default)]
pub struct RunStatistics {
    directories: AtomicU64,
    files_copied: AtomicU64,
    symlinks_created: AtomicU64,
    hardlinks_created: AtomicU64,
    bytes_copied: AtomicU64,
    skipped: AtomicU64,
    errors: AtomicU64,
    metadata_failures: AtomicU64,
    enqueued: AtomicU64,
    completed: AtomicU64,
    saturated: AtomicU64,
    events: Option<mpsc::Sender<StatusEvent>>,
    directory_reports: Option<Mutex<Vec<DirectoryReport>>>,
}

impl RunStatistics {
    pub fn new(events: Option<mpsc::Sender<StatusEvent>>, collect_directory_reports: bool) -> Self {
        Self {
            events,
            directory_reports: collect_directory_reports.then(|| Mutex::new(Vec::new())),
            ..Default::default()
        }
    }

    pub fn record_directory_created(&self) {
        self.directories.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_file_copied(&self, bytes: u64) {
        self.files_copied.fetch_add(1, Ordering::Relaxed);
        self.bytes_copied.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_symlink_created(&self) {
        self.symlinks_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hardlink_created(&self) {
        self.hardlinks_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_metadata_failure(&self) {
        self.metadata_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a scheduling decision and forward it to the status stream.
    ///
    /// Awaits channel capacity, so the stream never drops an event.
    pub async fn emit(&self, event: StatusEvent) {
        let counter = match event {
            StatusEvent::Enqueued => &self.enqueued,
            StatusEvent::Completed => &self.completed,
            StatusEvent::Saturated => &self.saturated,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if let Some(events) = &self.events {
            if events.send(event).await.is_err() {
                debug!("Status reporter gone, dropping {} event", event);
            }
        }
    }

    pub fn collects_directory_reports(&self) -> bool {
        self.directory_reports.is_some()
    }

    pub fn push_directory_report(&self, report: DirectoryReport) {
        if let Some(reports) = &self.directory_reports {
            reports.lock().push(report);
        }
    }

    pub fn take_directory_reports(&self) -> Vec<DirectoryReport> {
        match &self.directory_reports {
            Some(reports) => {
                let mut reports = std::mem::take(&mut *reports.lock());
                reports.sort_by(|a, b| a.directory.cmp(&b.directory));
                reports
            }
            None => Vec::new(),
        }
    }

    pub fn snapshot(&self) -> RunCounters {
        RunCounters {
            directories: self.directories.load(Ordering::Relaxed),
            files_copied: self.files_copied.load(Ordering::Relaxed),
            symlinks_created: self.symlinks_created.load(Ordering::Relaxed),
            hardlinks_created: self.hardlinks_created.load(Ordering::Relaxed),
            bytes_copied: self.bytes_copied.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            metadata_failures: self.metadata_failures.load(Ordering::Relaxed),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            saturated: self.saturated.load(Ordering::Relaxed),
        }
    }
}

/// Bounded channel feeding the single status reporter
pub fn status_channel(capacity: usize) -> (mpsc::Sender<StatusEvent>, mpsc::Receiver<StatusEvent>) {
    mpsc::channel(capacity.max(1))
}

/// Spawn the task that renders one symbol per event until every sender is gone.
///
/// Returns the writer so callers (and tests) can inspect what was written.
pub fn spawn_status_reporter<W>(mut events: mpsc::Receiver<StatusEvent>, mut writer: W) -> JoinHandle<std::io::Result<W>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut written = 0u64;
        while let Some(event) = events.recv().await {
            writer.write_all(&[u8::from(event)]).await?;
            written += 1;
            if written % STATUS_LINE_WIDTH == 0 {
                writer.write_all(b"\n").await?;
            }
            writer.flush().await?;
        }
        if written % STATUS_LINE_WIDTH != 0 {
            writer.write_all(b"\n").await?;
        }
        writer.flush().await?;
        Ok(writer)
    })
}
