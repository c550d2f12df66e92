use crate::entry::{EntryKind, SourceEntry};
use crate::error::{DeassimError, DeassimResult};
use crate::metadata;
use crate::registry::{Claim, InodeRegistry};
use crate::retry::RetryPolicy;
use crate::stats::RunStatistics;
use nix::fcntl::OFlag;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

/// What happened to one source entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    Copied { bytes: u64 },
    Hardlinked,
    Symlinked,
    DirectoryCreated,
    Skipped,
}

/// Per-entry-type replication onto the target volume
pub struct EntryReplicator {
    registry: Arc<InodeRegistry>,
    stats: Arc<RunStatistics>,
    retry: RetryPolicy,
    block_size: usize,
}

impl EntryReplicator {
    pub fn new(
        registry: Arc<InodeRegistry>,
        stats: Arc<RunStatistics>,
        retry: RetryPolicy,
        block_size: usize,
    ) -> Self {
        Self {
            registry,
            stats,
            retry,
            block_size: block_size.max(1),
        }
    }

    /// Replicate `entry` to `target`, updating the run counters.
    ///
    /// A directory entry only gets its target directory; the walker schedules its contents.
    ///
    /// Errors are returned to the caller, which logs and counts them.
    pub async fn replicate(&self, entry: &SourceEntry, target: &Path) -> DeassimResult<EntryOutcome> {
        if entry.kind == EntryKind::Regular && is_symlink(target).await {
            warn!("Target {:?} already exists as a symlink, skipping", target);
            self.stats.record_skipped();
            return Ok(EntryOutcome::Skipped);
        }

        match entry.kind {
            EntryKind::Regular if entry.is_hardlinked() => self.replicate_hardlinked(entry, target).await,
            EntryKind::Regular => {
                let bytes = self.copy_file(entry, target).await?;
                self.stats.record_file_copied(bytes);
                self.apply_metadata(entry, target).await;
                Ok(EntryOutcome::Copied { bytes })
            }
            EntryKind::Symlink => self.replicate_symlink(entry, target).await,
            EntryKind::Directory => {
                self.create_directory(target).await?;
                self.stats.record_directory_created();
                Ok(EntryOutcome::DirectoryCreated)
            }
            EntryKind::Other(_) => {
                let skipped = DeassimError::UnsupportedType {
                    path: entry.source_path.clone(),
                    kind: entry.kind.to_string(),
                };
                warn!("Skipping entry: {}", skipped);
                self.stats.record_skipped();
                Ok(EntryOutcome::Skipped)
            }
        }
    }

    /// Create the target directory. An existing directory is accepted.
    ///
    /// Returns `true` when the directory was newly created.
    pub async fn create_directory(&self, target: &Path) -> DeassimResult<bool> {
        match self.retry.run("mkdir", target, || tokio::fs::create_dir(target)).await {
            Ok(()) => {
                debug!("Created directory {:?}", target);
                Ok(true)
            }
            Err(e) if e.is_already_exists() => match tokio::fs::symlink_metadata(target).await {
                Ok(meta) if meta.is_dir() => Ok(false),
                Ok(_) => Err(DeassimError::FatalDirectory {
                    path: target.to_path_buf(),
                    source: io::Error::new(io::ErrorKind::AlreadyExists, "target exists and is not a directory"),
                }),
                Err(source) => Err(DeassimError::FatalDirectory {
                    path: target.to_path_buf(),
                    source,
                }),
            },
            Err(e) => Err(e.into_directory_failure()),
        }
    }

    /// Apply the directory's own metadata once all of its entries exist
    pub async fn finish_directory(&self, entry: &SourceEntry, target: &Path) {
        self.apply_metadata(entry, target).await;
    }

    async fn replicate_hardlinked(&self, entry: &SourceEntry, target: &Path) -> DeassimResult<EntryOutcome> {
        match self.registry.claim(entry.inode_key()).await {
            Claim::First(first) => {
                // On failure `first` is dropped unresolved and a waiter takes over.
                let bytes = self.copy_file(entry, target).await?;
                first.resolve(target);
                self.stats.record_file_copied(bytes);
                self.apply_metadata(entry, target).await;
                Ok(EntryOutcome::Copied { bytes })
            }
            Claim::Linked(existing) => {
                let result = self
                    .retry
                    .run("link", target, || tokio::fs::hard_link(&existing, target))
                    .await;
                match result {
                    Ok(()) => {
                        debug!("Linked {:?} -> {:?}", target, existing);
                        self.stats.record_hardlink_created();
                        Ok(EntryOutcome::Hardlinked)
                    }
                    Err(e) if e.is_already_exists() => {
                        warn!("Hardlink target {:?} already exists, skipping", target);
                        self.stats.record_skipped();
                        Ok(EntryOutcome::Skipped)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn replicate_symlink(&self, entry: &SourceEntry, target: &Path) -> DeassimResult<EntryOutcome> {
        let link_target = match &entry.symlink_target {
            Some(link_target) => link_target,
            None => {
                return Err(DeassimError::Filesystem {
                    path: entry.source_path.clone(),
                    source: io::Error::new(io::ErrorKind::InvalidData, "symlink snapshot without target"),
                })
            }
        };

        let result = self
            .retry
            .run("symlink", target, || tokio::fs::symlink(link_target, target))
            .await;
        match result {
            Ok(()) => {
                debug!("Symlink {:?} -> {:?}", target, link_target);
                self.stats.record_symlink_created();
                self.apply_metadata(entry, target).await;
                Ok(EntryOutcome::Symlinked)
            }
            Err(e) if e.is_already_exists() => {
                warn!("Symlink target {:?} already exists, skipping", target);
                self.stats.record_skipped();
                Ok(EntryOutcome::Skipped)
            }
            Err(e) => Err(e),
        }
    }

    /// Copy the bytes of a regular file. A failed or short copy leaves no target behind.
    async fn copy_file(&self, entry: &SourceEntry, target: &Path) -> DeassimResult<u64> {
        let result = self
            .retry
            .run("copy", &entry.source_path, || self.read_write_copy(&entry.source_path, target))
            .await;

        match result {
            Ok(bytes) if bytes == entry.size => Ok(bytes),
            Ok(bytes) => {
                remove_partial(target).await;
                Err(DeassimError::SizeMismatch {
                    path: entry.source_path.clone(),
                    expected: entry.size,
                    actual: bytes,
                })
            }
            Err(e) => {
                remove_partial(target).await;
                Err(e)
            }
        }
    }

    async fn read_write_copy(&self, source: &Path, target: &Path) -> io::Result<u64> {
        let mut source_file = tokio::fs::File::open(source).await?;
        // Never write through a symlink that already sits at the target path.
        let mut target_file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .custom_flags(OFlag::O_NOFOLLOW.bits())
            .open(target)
            .await?;

        let mut buffer = vec![0u8; self.block_size];
        let mut total_bytes = 0u64;
        let start_time = Instant::now();

        loop {
            let bytes_read = source_file.read(&mut buffer).await?;
            if bytes_read == 0 {
                break;
            }
            target_file.write_all(&buffer[..bytes_read]).await?;
            total_bytes += bytes_read as u64;
        }

        target_file.flush().await?;

        let elapsed = start_time.elapsed();
        debug!(
            "Copied {} bytes {:?} -> {:?} in {:.3}s",
            total_bytes,
            source,
            target,
            elapsed.as_secs_f64()
        );
        Ok(total_bytes)
    }

    async fn apply_metadata(&self, entry: &SourceEntry, target: &Path) {
        for _ in metadata::apply(target, entry, &self.retry).await {
            self.stats.record_metadata_failure();
        }
    }
}

async fn is_symlink(path: &Path) -> bool {
    matches!(tokio::fs::symlink_metadata(path).await, Ok(meta) if meta.file_type().is_symlink())
}

async fn remove_partial(target: &Path) {
    match tokio::fs::remove_file(target).await {
        Ok(()) => debug!("Removed partial target {:?}", target),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove partial target {:?}: {}", target, e),
    }
}
