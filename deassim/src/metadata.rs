use crate::entry::{EntryKind, SourceEntry};
use crate::error::DeassimError;
use crate::retry::RetryPolicy;
use nix::sys::stat::{utimensat, UtimensatFlags};
use nix::sys::time::TimeSpec;
use nix::unistd::{self, Gid, Uid};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::{debug, warn};

/// Replicate mode, ownership and atime/mtime of `entry` onto `target`.
///
/// Symlinks only get their ownership (without following the link). Every
/// refused call is logged and returned; none of them fails the entry.
pub async fn apply(target: &Path, entry: &SourceEntry, retry: &RetryPolicy) -> Vec<DeassimError> {
    let mut failures = Vec::new();

    if entry.kind == EntryKind::Symlink {
        if let Err(e) = set_symlink_owner(target, entry, retry).await {
            failures.push(e);
        }
    } else {
        // Ownership before mode: chown clears setuid/setgid bits.
        if let Err(e) = set_owner(target, entry, retry).await {
            failures.push(e);
        }
        if let Err(e) = set_mode(target, entry, retry).await {
            failures.push(e);
        }
        if let Err(e) = set_times(target, entry, retry).await {
            failures.push(e);
        }
    }

    for failure in &failures {
        warn!("Could not replicate metadata of {:?}: {}", target, failure);
    }
    failures
}

async fn set_mode(target: &Path, entry: &SourceEntry, retry: &RetryPolicy) -> Result<(), DeassimError> {
    let mode = entry.permissions();
    retry
        .run("chmod", target, || {
            tokio::fs::set_permissions(target, std::fs::Permissions::from_mode(mode))
        })
        .await?;
    debug!("chmod {:o} {:?}", mode, target);
    Ok(())
}

async fn set_owner(target: &Path, entry: &SourceEntry, retry: &RetryPolicy) -> Result<(), DeassimError> {
    let (uid, gid) = (entry.uid, entry.gid);
    retry
        .run("chown", target, || async move {
            unistd::chown(target, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid))).map_err(io::Error::from)
        })
        .await
}

async fn set_symlink_owner(target: &Path, entry: &SourceEntry, retry: &RetryPolicy) -> Result<(), DeassimError> {
    let (uid, gid) = (entry.uid, entry.gid);
    retry
        .run("lchown", target, || async move { std::os::unix::fs::lchown(target, Some(uid), Some(gid)) })
        .await
}

async fn set_times(target: &Path, entry: &SourceEntry, retry: &RetryPolicy) -> Result<(), DeassimError> {
    let atime = TimeSpec::new(entry.atime as _, entry.atime_nsec as _);
    let mtime = TimeSpec::new(entry.mtime as _, entry.mtime_nsec as _);
    retry
        .run("utimensat", target, || async move {
            utimensat(None, target, &atime, &mtime, UtimensatFlags::FollowSymlink).map_err(io::Error::from)
        })
        .await
}
