use anyhow::Result;
use deassim::protocol::{MismatchKind, StatusEvent};
use deassim::{spawn_status_reporter, status_channel, ReplicationConfig, TreeWalker, VerificationComparator};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::fs;

struct Scratch {
    _dir: TempDir,
    source: PathBuf,
    target: PathBuf,
}

fn scratch() -> Result<Scratch> {
    let dir = TempDir::new()?;
    let source = dir.path().join("share");
    let target = dir.path().join("vol");
    std::fs::create_dir(&source)?;
    Ok(Scratch {
        _dir: dir,
        source,
        target,
    })
}

fn config(scratch: &Scratch, workers: usize) -> ReplicationConfig {
    ReplicationConfig::new(&scratch.source, &scratch.target).with_workers(workers)
}

#[tokio::test]
async fn test_hardlink_and_symlink_directory_single_worker() -> Result<()> {
    let s = scratch()?;
    let d = s.source.join("D");
    fs::create_dir(&d).await?;
    fs::write(d.join("A"), b"payload bytes").await?;
    fs::hard_link(d.join("A"), d.join("B")).await?;
    fs::symlink("A", d.join("C")).await?;

    let summary = TreeWalker::new(config(&s, 1)).run().await?;

    assert_eq!(summary.counters.directories, 1);
    assert_eq!(summary.counters.files_copied, 1);
    assert_eq!(summary.counters.hardlinks_created, 1);
    assert_eq!(summary.counters.symlinks_created, 1);
    assert_eq!(summary.counters.errors, 0);
    assert_eq!(summary.counters.bytes_copied, 13);
    assert!(summary.is_clean());

    let target_d = s.target.join("D");
    let a = fs::metadata(target_d.join("A")).await?;
    let b = fs::metadata(target_d.join("B")).await?;
    assert_eq!(a.ino(), b.ino());
    assert_eq!(a.nlink(), 2);
    assert_eq!(fs::read_link(target_d.join("C")).await?, Path::new("A"));
    assert_eq!(fs::read(target_d.join("B")).await?, b"payload bytes");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_thousand_empty_directories() -> Result<()> {
    let s = scratch()?;
    for i in 0..1000 {
        std::fs::create_dir(s.source.join(format!("dir{:04}", i)))?;
    }

    let summary = TreeWalker::new(config(&s, 4)).run().await?;

    assert_eq!(summary.counters.directories, 1000);
    assert_eq!(summary.counters.files_copied, 0);
    assert_eq!(summary.counters.errors, 0);
    assert_eq!(summary.counters.completed, 1001);
    assert!(summary.peak_outstanding <= 4);
    assert_eq!(std::fs::read_dir(&s.target)?.count(), 1000);
    Ok(())
}

#[tokio::test]
async fn test_fifo_is_skipped() -> Result<()> {
    let s = scratch()?;
    nix::unistd::mkfifo(&s.source.join("pipe"), nix::sys::stat::Mode::S_IRWXU)?;
    fs::write(s.source.join("regular"), b"x").await?;

    let summary = TreeWalker::new(config(&s, 2)).run().await?;

    assert_eq!(summary.counters.skipped, 1);
    assert_eq!(summary.counters.errors, 0);
    assert_eq!(summary.counters.files_copied, 1);
    assert!(fs::symlink_metadata(s.target.join("pipe")).await.is_err());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hardlinks_across_directories_share_one_inode() -> Result<()> {
    let s = scratch()?;
    let original = s.source.join("original.bin");
    fs::write(&original, vec![7u8; 64 * 1024]).await?;
    for i in 0..12 {
        let dir = s.source.join(format!("branch{}", i));
        fs::create_dir(&dir).await?;
        fs::hard_link(&original, dir.join("linked.bin")).await?;
    }

    let summary = TreeWalker::new(config(&s, 8)).run().await?;

    assert_eq!(summary.counters.files_copied, 1);
    assert_eq!(summary.counters.hardlinks_created, 12);
    assert_eq!(summary.counters.bytes_copied, 64 * 1024);
    assert_eq!(summary.counters.errors, 0);

    let ino = fs::metadata(s.target.join("original.bin")).await?.ino();
    for i in 0..12 {
        let linked = fs::metadata(s.target.join(format!("branch{}/linked.bin", i))).await?;
        assert_eq!(linked.ino(), ino);
    }
    Ok(())
}

#[tokio::test]
async fn test_content_metadata_and_dangling_symlink() -> Result<()> {
    let s = scratch()?;
    let nested = s.source.join("a/b");
    fs::create_dir_all(&nested).await?;
    fs::write(nested.join("data.csv"), b"id,value\n1,2\n").await?;
    std::fs::set_permissions(nested.join("data.csv"), std::fs::Permissions::from_mode(0o600))?;
    fs::symlink("../../missing/target", nested.join("dangling")).await?;

    let source_meta = fs::metadata(nested.join("data.csv")).await?;
    let summary = TreeWalker::new(config(&s, 3)).run().await?;
    assert_eq!(summary.counters.errors, 0);
    assert_eq!(summary.counters.directories, 2);

    let copied = s.target.join("a/b/data.csv");
    assert_eq!(fs::read(&copied).await?, b"id,value\n1,2\n");
    let copied_meta = fs::metadata(&copied).await?;
    assert_eq!(copied_meta.mode() & 0o7777, 0o600);
    assert_eq!(copied_meta.mtime(), source_meta.mtime());
    assert_eq!(copied_meta.mtime_nsec(), source_meta.mtime_nsec());
    assert_eq!(
        fs::read_link(s.target.join("a/b/dangling")).await?,
        Path::new("../../missing/target")
    );

    // Directory timestamps are applied after the directory's entries exist.
    let source_dir = fs::metadata(s.source.join("a/b")).await?;
    let target_dir = fs::metadata(s.target.join("a/b")).await?;
    assert_eq!(source_dir.mtime(), target_dir.mtime());
    Ok(())
}

#[tokio::test]
async fn test_unreadable_directory_aborts_only_its_branch() -> Result<()> {
    if nix::unistd::geteuid().is_root() {
        // Permission bits do not stop root from listing the directory.
        return Ok(());
    }

    let s = scratch()?;
    let locked = s.source.join("locked");
    fs::create_dir(&locked).await?;
    fs::write(locked.join("hidden"), b"x").await?;
    fs::create_dir(s.source.join("open")).await?;
    fs::write(s.source.join("open/visible"), b"y").await?;
    std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000))?;

    let summary = TreeWalker::new(config(&s, 2)).run().await;
    std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755))?;
    let summary = summary?;

    assert_eq!(summary.counters.errors, 1);
    assert_eq!(summary.counters.files_copied, 1);
    assert!(s.target.join("open/visible").exists());
    assert!(!s.target.join("locked/hidden").exists());
    Ok(())
}

#[tokio::test]
async fn test_uncreatable_directory_aborts_only_its_branch() -> Result<()> {
    let s = scratch()?;
    fs::create_dir(s.source.join("locked")).await?;
    fs::write(s.source.join("locked/hidden"), b"x").await?;
    fs::create_dir(s.source.join("open")).await?;
    fs::write(s.source.join("open/visible"), b"y").await?;

    // A regular file where the directory should go.
    fs::create_dir(&s.target).await?;
    fs::write(s.target.join("locked"), b"in the way").await?;

    let summary = TreeWalker::new(config(&s, 2)).run().await?;

    assert_eq!(summary.counters.errors, 1);
    assert_eq!(summary.counters.directories, 1);
    assert_eq!(summary.counters.files_copied, 1);
    assert_eq!(fs::read(s.target.join("open/visible")).await?, b"y");
    assert!(fs::metadata(s.target.join("locked")).await?.is_file());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_churning_siblings_do_not_cost_stable_entries() -> Result<()> {
    let s = scratch()?;
    let d = s.source.join("d");
    fs::create_dir_all(d.join("sub")).await?;
    fs::write(d.join("keep"), b"stable").await?;
    fs::write(d.join("sub/inner"), b"nested").await?;

    let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let churn = {
        let stop = std::sync::Arc::clone(&stop);
        let d = d.clone();
        std::thread::spawn(move || {
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                for i in 0..200 {
                    let _ = std::fs::write(d.join(format!("tmp{}", i)), b"t");
                }
                for i in 0..200 {
                    let _ = std::fs::remove_file(d.join(format!("tmp{}", i)));
                }
            }
        })
    };

    let mut outcome = Ok(());
    for _ in 0..20 {
        if fs::metadata(&s.target).await.is_ok() {
            fs::remove_dir_all(&s.target).await?;
        }
        match TreeWalker::new(config(&s, 1)).run().await {
            Ok(_) => {
                if !s.target.join("d/keep").exists() || !s.target.join("d/sub/inner").exists() {
                    outcome = Err(anyhow::anyhow!("stable entries missing from the target"));
                    break;
                }
            }
            Err(e) => {
                outcome = Err(e.into());
                break;
            }
        }
    }

    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    let _ = churn.join();
    outcome
}

#[tokio::test]
async fn test_hardlink_copy_taken_over_after_first_claimant_fails() -> Result<()> {
    let s = scratch()?;
    fs::write(s.source.join("a.bin"), b"linked payload").await?;
    fs::create_dir(s.source.join("sub")).await?;
    fs::hard_link(s.source.join("a.bin"), s.source.join("sub/b.bin")).await?;

    // The root job claims the inode for `a.bin` before `sub` is processed.
    fs::create_dir_all(s.target.join("a.bin")).await?;

    let summary = TreeWalker::new(config(&s, 1)).run().await?;

    assert_eq!(summary.counters.errors, 1);
    assert_eq!(summary.counters.files_copied, 1);
    assert_eq!(summary.counters.hardlinks_created, 0);
    assert_eq!(fs::read(s.target.join("sub/b.bin")).await?, b"linked payload");
    assert!(fs::metadata(s.target.join("a.bin")).await?.is_dir());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_status_stream_accounts_for_every_job() -> Result<()> {
    let s = scratch()?;
    for i in 0..20 {
        for j in 0..5 {
            fs::create_dir_all(s.source.join(format!("p{}/c{}", i, j))).await?;
        }
    }

    let (tx, rx) = status_channel(4);
    let reporter = spawn_status_reporter(rx, Vec::new());
    let summary = TreeWalker::new(config(&s, 3)).with_status_events(tx).run().await?;
    let written = reporter.await??;

    let events = StatusEvent::decode_stream(&written);
    let count = |wanted: StatusEvent| events.iter().filter(|e| **e == wanted).count() as u64;

    // Root plus 20 parents plus 100 children.
    assert_eq!(count(StatusEvent::Completed), 121);
    assert_eq!(count(StatusEvent::Enqueued), summary.counters.enqueued);
    assert_eq!(count(StatusEvent::Saturated), summary.counters.saturated);
    assert_eq!(summary.counters.completed, 121);
    assert!(summary.counters.enqueued + summary.counters.saturated >= 121);
    assert!(summary.peak_outstanding <= 3);
    Ok(())
}

#[tokio::test]
async fn test_single_worker_defers_every_child() -> Result<()> {
    let s = scratch()?;
    for name in ["x", "y", "z"] {
        fs::create_dir(s.source.join(name)).await?;
    }

    let config = config(&s, 16).with_single_worker(true);
    let summary = TreeWalker::new(config).run().await?;

    assert_eq!(summary.workers, 1);
    assert_eq!(summary.peak_outstanding, 1);
    assert_eq!(summary.counters.enqueued, 1);
    assert_eq!(summary.counters.saturated, 3);
    assert_eq!(summary.counters.completed, 4);
    Ok(())
}

#[tokio::test]
async fn test_verification_after_replication() -> Result<()> {
    let s = scratch()?;
    fs::create_dir(s.source.join("docs")).await?;
    fs::write(s.source.join("docs/a.txt"), b"alpha").await?;
    fs::write(s.source.join("docs/b.txt"), b"beta").await?;

    TreeWalker::new(config(&s, 2)).run().await?;
    let report = VerificationComparator::compare(&s.source, &s.target).await?;
    assert!(report.is_match());
    assert_eq!(report.checked, 3);

    fs::write(s.target.join("docs/a.txt"), b"alpha, truncated later").await?;
    fs::remove_file(s.target.join("docs/b.txt")).await?;
    let report = VerificationComparator::compare(&s.source, &s.target).await?;
    assert_eq!(report.mismatches.len(), 2);
    assert!(report
        .mismatches
        .iter()
        .any(|m| m.kind == MismatchKind::SizeMismatch { source: 5, target: 22 }));
    assert!(report
        .mismatches
        .iter()
        .any(|m| m.kind == MismatchKind::MissingInTarget && m.path == Path::new("docs/b.txt")));
    Ok(())
}

#[tokio::test]
async fn test_statistics_collect_directory_reports() -> Result<()> {
    let s = scratch()?;
    fs::create_dir(s.source.join("photos")).await?;
    fs::write(s.source.join("photos/one.JPG"), vec![0u8; 100]).await?;
    fs::write(s.source.join("photos/two.jpg"), vec![0u8; 50]).await?;
    fs::write(s.source.join("photos/README"), b"r").await?;

    let summary = TreeWalker::new(config(&s, 2).with_statistics(true)).run().await?;

    let photos = summary
        .directories
        .iter()
        .find(|r| r.directory.ends_with("photos"))
        .expect("report for photos");
    assert_eq!(photos.total_files, 3);
    assert_eq!(photos.total_size_bytes, 151);
    assert_eq!(photos.extension_counts.get("jpg"), Some(&2));
    assert_eq!(photos.extension_counts.get(""), Some(&1));
    Ok(())
}

#[tokio::test]
async fn test_rerun_over_existing_target() -> Result<()> {
    let s = scratch()?;
    fs::create_dir(s.source.join("d")).await?;
    fs::write(s.source.join("d/file"), b"v1").await?;
    fs::symlink("file", s.source.join("d/link")).await?;

    TreeWalker::new(config(&s, 2)).run().await?;
    fs::write(s.source.join("d/file"), b"version two").await?;
    let summary = TreeWalker::new(config(&s, 2)).run().await?;

    // Regular files are overwritten, existing links are left alone.
    assert_eq!(fs::read(s.target.join("d/file")).await?, b"version two");
    assert_eq!(summary.counters.skipped, 1);
    assert_eq!(summary.counters.errors, 0);
    Ok(())
}
