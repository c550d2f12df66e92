use nix::errno::Errno;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error types for a replication run
#[derive(Error, Debug)]
pub enum DeassimError {
    // Entry-level errors
    #[error("Transient I/O failure on {path}: {source}")]
    TransientIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Permission denied on {path}: {source}")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Unsupported entry type '{kind}': {path}")]
    UnsupportedType { path: PathBuf, kind: String },

    #[error("Size mismatch after copy of {path}: expected {expected} bytes, wrote {actual}")]
    SizeMismatch { path: PathBuf, expected: u64, actual: u64 },

    #[error("Filesystem error on path {path:?}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    // Branch-level errors
    #[error("Cannot process directory {path}: {source}")]
    FatalDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    // Run-level errors
    #[error("Root path is not usable: {path}: {source}")]
    RootInaccessible {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfiguration { field: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// How a failed filesystem call should be treated by the retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Backend hiccup worth retrying (EIO, ESTALE, timeouts, ...)
    Transient,
    Permission,
    NotFound,
    AlreadyExists,
    Unsupported,
    Other,
}

impl FailureKind {
    pub fn classify(err: &io::Error) -> Self {
        if let Some(code) = err.raw_os_error() {
            match Errno::from_i32(code) {
                Errno::EINTR
                | Errno::EAGAIN
                | Errno::EIO
                | Errno::ESTALE
                | Errno::ETIMEDOUT
                | Errno::EBUSY
                | Errno::ENETDOWN
                | Errno::ENETUNREACH
                | Errno::ENETRESET
                | Errno::ECONNRESET
                | Errno::ECONNABORTED
                | Errno::EHOSTUNREACH
                | Errno::ENOLCK => return FailureKind::Transient,
                Errno::EACCES | Errno::EPERM | Errno::EROFS => return FailureKind::Permission,
                Errno::ENOENT => return FailureKind::NotFound,
                Errno::EEXIST => return FailureKind::AlreadyExists,
                Errno::EOPNOTSUPP | Errno::ENOSYS | Errno::EXDEV => return FailureKind::Unsupported,
                _ => {}
            }
        }

        match err.kind() {
            io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                FailureKind::Transient
            }
            io::ErrorKind::PermissionDenied => FailureKind::Permission,
            io::ErrorKind::NotFound => FailureKind::NotFound,
            io::ErrorKind::AlreadyExists => FailureKind::AlreadyExists,
            io::ErrorKind::Unsupported => FailureKind::Unsupported,
            _ => FailureKind::Other,
        }
    }
}

impl DeassimError {
    /// Wrap an `io::Error` raised on `path` into the matching entry-level variant
    pub fn from_io(path: impl AsRef<Path>, source: io::Error) -> Self {
        let path = path.as_ref().to_path_buf();
        match FailureKind::classify(&source) {
            FailureKind::Transient => DeassimError::TransientIo { path, source },
            FailureKind::Permission => DeassimError::PermissionDenied { path, source },
            _ => DeassimError::Filesystem { path, source },
        }
    }

    /// Re-tag an I/O failure on a directory as fatal for its branch
    pub fn into_directory_failure(self) -> Self {
        match self {
            DeassimError::TransientIo { path, source }
            | DeassimError::PermissionDenied { path, source }
            | DeassimError::Filesystem { path, source } => DeassimError::FatalDirectory { path, source },
            other => other,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeassimError::TransientIo { .. })
    }

    /// True when the error is an `EEXIST` on the target side
    pub fn is_already_exists(&self) -> bool {
        match self {
            DeassimError::Filesystem { source, .. } | DeassimError::Io(source) => {
                source.kind() == io::ErrorKind::AlreadyExists
            }
            _ => false,
        }
    }

    /// Get the error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            DeassimError::RootInaccessible { .. } => ErrorSeverity::Critical,
            DeassimError::FatalDirectory { .. }
            | DeassimError::SizeMismatch { .. }
            | DeassimError::InvalidConfiguration { .. }
            | DeassimError::Config(_) => ErrorSeverity::High,
            DeassimError::PermissionDenied { .. }
            | DeassimError::Filesystem { .. }
            | DeassimError::Io(_) => ErrorSeverity::Medium,
            DeassimError::TransientIo { .. }
            | DeassimError::UnsupportedType { .. } => ErrorSeverity::Low,
        }
    }

    /// Get suggested operator action
    pub fn suggested_action(&self) -> &'static str {
        match self {
            DeassimError::RootInaccessible { .. } => {
                "Check that both the share and the volume are mounted and readable"
            }
            DeassimError::PermissionDenied { .. } => {
                "Run as root so ownership and modes can be replicated"
            }
            DeassimError::TransientIo { .. } => "Check the NFS backends and rerun the replication",
            DeassimError::InvalidConfiguration { .. } | DeassimError::Config(_) => {
                "Fix the configuration file or command line flags"
            }
            DeassimError::UnsupportedType { .. } => "Recreate device, FIFO and socket entries manually",
            _ => "Check the error details in the log",
        }
    }

    /// Convert to exit code for CLI applications
    pub fn exit_code(&self) -> i32 {
        match self.severity() {
            ErrorSeverity::Critical => 2,
            ErrorSeverity::High => 1,
            ErrorSeverity::Medium => 1,
            ErrorSeverity::Low => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Critical,
    High,
    Medium,
    Low,
}

/// Result type alias for replication operations
pub type DeassimResult<T> = Result<T, DeassimError>;

/// Error context builder for operator-facing reports
pub struct ErrorContext {
    operation: String,
    path: Option<PathBuf>,
    run_id: Option<String>,
    additional_info: Vec<(String, String)>,
}

impl ErrorContext {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            path: None,
            run_id: None,
            additional_info: Vec::new(),
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_info(mut self, key: &str, value: &str) -> Self {
        self.additional_info.push((key.to_string(), value.to_string()));
        self
    }

    pub fn build(self, error: DeassimError) -> anyhow::Error {
        let mut context = anyhow::Error::new(error);

        context = context.context(format!("Operation: {}", self.operation));

        if let Some(path) = self.path {
            context = context.context(format!("Path: {}", path.display()));
        }

        if let Some(run_id) = self.run_id {
            context = context.context(format!("Run ID: {}", run_id));
        }

        for (key, value) in self.additional_info {
            context = context.context(format!("{}: {}", key, value));
        }

        context
    }
}

/// Macro for creating error contexts
#[macro_export]
macro_rules! error_context {
    ($op:expr) => {
        $crate::error::ErrorContext::new($op)
    };
    ($op:expr, path = $path:expr) => {
        $crate::error::ErrorContext::new($op).with_path($path)
    };
    ($op:expr, run_id = $run_id:expr) => {
        $crate::error::ErrorContext::new($op).with_run_id($run_id)
    };
    ($op:expr, path = $path:expr, run_id = $run_id:expr) => {
        $crate::error::ErrorContext::new($op).with_path($path).with_run_id($run_id)
    };
}
