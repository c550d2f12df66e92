use crate::error::DeassimResult;
use crate::registry::InodeKey;
use crate::retry::RetryPolicy;
use std::ffi::OsString;
use std::fmt;
use std::fs::{FileType, Metadata};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
    Other(SpecialKind),
}

/// Entry types that are detected but never replicated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialKind {
    Fifo,
    Socket,
    BlockDevice,
    CharDevice,
    Unknown,
}

impl EntryKind {
    pub fn from_file_type(ft: FileType) -> Self {
        if ft.is_symlink() {
            EntryKind::Symlink
        } else if ft.is_dir() {
            EntryKind::Directory
        } else if ft.is_file() {
            EntryKind::Regular
        } else if ft.is_fifo() {
            EntryKind::Other(SpecialKind::Fifo)
        } else if ft.is_socket() {
            EntryKind::Other(SpecialKind::Socket)
        } else if ft.is_block_device() {
            EntryKind::Other(SpecialKind::BlockDevice)
        } else if ft.is_char_device() {
            EntryKind::Other(SpecialKind::CharDevice)
        } else {
            EntryKind::Other(SpecialKind::Unknown)
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EntryKind::Regular => write!(f, "regular"),
            EntryKind::Directory => write!(f, "directory"),
            EntryKind::Symlink => write!(f, "symlink"),
            EntryKind::Other(SpecialKind::Fifo) => write!(f, "fifo"),
            EntryKind::Other(SpecialKind::Socket) => write!(f, "socket"),
            EntryKind::Other(SpecialKind::BlockDevice) => write!(f, "block device"),
            EntryKind::Other(SpecialKind::CharDevice) => write!(f, "char device"),
            EntryKind::Other(SpecialKind::Unknown) => write!(f, "unknown"),
        }
    }
}

/// Read-only `lstat` snapshot of one source entry, taken at discovery time
#[derive(Debug, Clone)]
pub struct SourceEntry {
    pub source_path: PathBuf,
    /// Path relative to the source root
    pub relative_path: PathBuf,
    pub name: OsString,
    pub kind: EntryKind,
    pub dev: u64,
    pub ino: u64,
    pub nlink: u64,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: i64,
    pub atime_nsec: i64,
    pub mtime: i64,
    pub mtime_nsec: i64,
    pub symlink_target: Option<PathBuf>,
}

impl SourceEntry {
    pub fn from_metadata(
        source_path: PathBuf,
        relative_path: PathBuf,
        metadata: &Metadata,
        symlink_target: Option<PathBuf>,
    ) -> Self {
        let name = source_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();

        Self {
            source_path,
            relative_path,
            name,
            kind: EntryKind::from_file_type(metadata.file_type()),
            dev: metadata.dev(),
            ino: metadata.ino(),
            nlink: metadata.nlink(),
            size: metadata.len(),
            mode: metadata.mode(),
            uid: metadata.uid(),
            gid: metadata.gid(),
            atime: metadata.atime(),
            atime_nsec: metadata.atime_nsec(),
            mtime: metadata.mtime(),
            mtime_nsec: metadata.mtime_nsec(),
            symlink_target,
        }
    }

    /// `lstat` the entry (never following symlinks) and read the link target if it is one.
    pub async fn snapshot(
        source_path: &Path,
        relative_path: &Path,
        retry: &RetryPolicy,
    ) -> DeassimResult<Self> {
        let metadata = retry
            .run("lstat", source_path, || tokio::fs::symlink_metadata(source_path))
            .await?;

        let symlink_target = if metadata.file_type().is_symlink() {
            Some(
                retry
                    .run("readlink", source_path, || tokio::fs::read_link(source_path))
                    .await?,
            )
        } else {
            None
        };

        Ok(Self::from_metadata(
            source_path.to_path_buf(),
            relative_path.to_path_buf(),
            &metadata,
            symlink_target,
        ))
    }

    pub fn inode_key(&self) -> InodeKey {
        InodeKey::new(self.dev, self.ino)
    }

    /// Permission bits only (including setuid/setgid/sticky)
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }

    /// Regular file with more than one name in the source tree
    pub fn is_hardlinked(&self) -> bool {
        self.kind == EntryKind::Regular && self.nlink > 1
    }
}
