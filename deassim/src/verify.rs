use crate::entry::EntryKind;
use crate::error::{DeassimError, DeassimResult};
use deassim_protocol::{Mismatch, MismatchKind, VerificationReport};
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Read-only, size-only comparison of a finished replication.
///
/// Neither tree is modified. Symlinks are compared as links and never followed.
pub struct VerificationComparator;

impl VerificationComparator {
    pub async fn compare(source_root: &Path, target_root: &Path) -> DeassimResult<VerificationReport> {
        let source_root = source_root.to_path_buf();
        let target_root = target_root.to_path_buf();

        tokio::task::spawn_blocking(move || Self::compare_blocking(&source_root, &target_root))
            .await
            .map_err(|e| DeassimError::Io(io::Error::new(io::ErrorKind::Other, e)))?
    }

    fn compare_blocking(source_root: &Path, target_root: &Path) -> DeassimResult<VerificationReport> {
        info!("Verifying {:?} against {:?}", target_root, source_root);
        for root in [source_root, target_root] {
            std::fs::metadata(root).map_err(|source| DeassimError::RootInaccessible {
                path: root.to_path_buf(),
                source,
            })?;
        }

        let mut report = VerificationReport::default();

        let mut walker = WalkDir::new(source_root)
            .follow_links(false)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter();
        while let Some(next) = walker.next() {
            let entry = match next {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Verification cannot read source entry: {}", e);
                    continue;
                }
            };
            let relative = relative_to(entry.path(), source_root);
            report.checked += 1;

            let source_meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(e) => {
                    warn!("Verification cannot stat {:?}: {}", entry.path(), e);
                    continue;
                }
            };

            let target_meta = match std::fs::symlink_metadata(target_root.join(&relative)) {
                Ok(meta) => meta,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    push(&mut report, relative, MismatchKind::MissingInTarget);
                    if source_meta.is_dir() {
                        walker.skip_current_dir();
                    }
                    continue;
                }
                Err(e) => return Err(DeassimError::from_io(target_root.join(&relative), e)),
            };

            if let Some(kind) = compare_entries(&source_meta, &target_meta) {
                let skip = kind == MismatchKind::TypeMismatch && source_meta.is_dir();
                push(&mut report, relative, kind);
                if skip {
                    walker.skip_current_dir();
                }
            }
        }

        let mut walker = WalkDir::new(target_root)
            .follow_links(false)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter();
        while let Some(next) = walker.next() {
            let entry = match next {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Verification cannot read target entry: {}", e);
                    continue;
                }
            };
            let relative = relative_to(entry.path(), target_root);
            match std::fs::symlink_metadata(source_root.join(&relative)) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    push(&mut report, relative, MismatchKind::MissingInSource);
                    if entry.file_type().is_dir() {
                        walker.skip_current_dir();
                    }
                }
                Err(e) => return Err(DeassimError::from_io(source_root.join(&relative), e)),
            }
        }

        if report.is_match() {
            info!("Verification passed: {} entries checked", report.checked);
        } else {
            warn!(
                "Verification found {} mismatches in {} entries",
                report.mismatches.len(),
                report.checked
            );
        }
        Ok(report)
    }
}

fn compare_entries(source: &Metadata, target: &Metadata) -> Option<MismatchKind> {
    let source_kind = EntryKind::from_file_type(source.file_type());
    if source_kind != EntryKind::from_file_type(target.file_type()) {
        return Some(MismatchKind::TypeMismatch);
    }
    if source_kind == EntryKind::Regular && source.len() != target.len() {
        return Some(MismatchKind::SizeMismatch {
            source: source.len(),
            target: target.len(),
        });
    }
    None
}

fn relative_to(path: &Path, root: &Path) -> PathBuf {
    path.strip_prefix(root).unwrap_or(path).to_path_buf()
}

fn push(report: &mut VerificationReport, path: PathBuf, kind: MismatchKind) {
    debug!("Mismatch at {:?}: {}", path, kind);
    report.mismatches.push(Mismatch { path, kind });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_identical_trees_match() {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        for root in [source.path(), target.path()] {
            std::fs::create_dir(root.join("d")).unwrap();
            std::fs::write(root.join("d/file"), b"1234").unwrap();
            std::os::unix::fs::symlink("file", root.join("d/link")).unwrap();
        }

        let report = VerificationComparator::compare(source.path(), target.path()).await.unwrap();
        assert!(report.is_match(), "{:?}", report.mismatches);
        assert_eq!(report.checked, 3);
    }

    #[tokio::test]
    async fn test_reports_each_mismatch_kind() {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        std::fs::write(source.path().join("short"), b"12345").unwrap();
        std::fs::write(target.path().join("short"), b"12").unwrap();
        std::fs::write(source.path().join("gone"), b"x").unwrap();
        std::fs::create_dir(source.path().join("kind")).unwrap();
        std::fs::write(source.path().join("kind/inner"), b"x").unwrap();
        std::fs::write(target.path().join("kind"), b"x").unwrap();
        std::fs::write(target.path().join("extra"), b"x").unwrap();

        let report = VerificationComparator::compare(source.path(), target.path()).await.unwrap();
        let find = |name: &str| {
            report
                .mismatches
                .iter()
                .find(|m| m.path == Path::new(name))
                .map(|m| m.kind)
        };

        assert_eq!(find("short"), Some(MismatchKind::SizeMismatch { source: 5, target: 2 }));
        assert_eq!(find("gone"), Some(MismatchKind::MissingInTarget));
        assert_eq!(find("kind"), Some(MismatchKind::TypeMismatch));
        assert_eq!(find("extra"), Some(MismatchKind::MissingInSource));
        // The mismatched directory is not descended into.
        assert_eq!(find("kind/inner"), None);
        assert_eq!(report.mismatches.len(), 4);
    }
}
