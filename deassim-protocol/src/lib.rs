use anyhow::Result;
use chrono::{DateTime, Utc};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// One scheduling decision of the worker pool.
///
/// The discriminant is the byte written to the live status stream, so a
/// recorded stream can be decoded back into events with `TryFrom<u8>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum StatusEvent {
    /// A directory job was accepted by the shared queue
    Enqueued = b'+',
    /// A directory job finished
    Completed = b'.',
    /// No capacity this cycle; the job was deferred to the spawning worker
    Saturated = b'-',
}

impl StatusEvent {
    pub fn symbol(self) -> char {
        u8::from(self) as char
    }

    /// Decode a recorded status stream. Unknown bytes (newlines, padding) are ignored.
    pub fn decode_stream(stream: &[u8]) -> Vec<StatusEvent> {
        stream
            .iter()
            .filter_map(|b| StatusEvent::try_from(*b).ok())
            .collect()
    }
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Output format for the end-of-run summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(anyhow::anyhow!("Invalid output format: {}", s)),
        }
    }
}

/// Point-in-time copy of the run counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    /// Target subdirectories created (the target root is not counted)
    pub directories: u64,
    pub files_copied: u64,
    pub symlinks_created: u64,
    pub hardlinks_created: u64,
    pub bytes_copied: u64,
    pub skipped: u64,
    pub errors: u64,
    /// Ownership, mode or timestamp application that was refused
    pub metadata_failures: u64,
    pub enqueued: u64,
    pub completed: u64,
    pub saturated: u64,
}

/// Per-directory statistics, collected when the statistics flag is set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryReport {
    pub directory: PathBuf,
    /// Non-directory entries seen in this directory
    pub total_files: u64,
    pub total_size_bytes: u64,
    /// Lower-cased extension (without the dot) to count; "" for no extension
    pub extension_counts: BTreeMap<String, u64>,
}

impl DirectoryReport {
    pub fn new(directory: PathBuf) -> Self {
        Self {
            directory,
            ..Default::default()
        }
    }

    pub fn record(&mut self, file_name: &std::ffi::OsStr, size: u64) {
        let ext = std::path::Path::new(file_name)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        *self.extension_counts.entry(ext).or_insert(0) += 1;
        self.total_files += 1;
        self.total_size_bytes += size;
    }
}

/// End-of-run summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub source_root: PathBuf,
    pub target_root: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub workers: usize,
    pub peak_outstanding: usize,
    pub interrupted: bool,
    pub counters: RunCounters,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub directories: Vec<DirectoryReport>,
}

impl RunSummary {
    /// True when every entry was replicated without error
    pub fn is_clean(&self) -> bool {
        !self.interrupted && self.counters.errors == 0
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchKind {
    MissingInTarget,
    MissingInSource,
    TypeMismatch,
    SizeMismatch { source: u64, target: u64 },
}

impl fmt::Display for MismatchKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MismatchKind::MissingInTarget => write!(f, "missing in target"),
            MismatchKind::MissingInSource => write!(f, "only in target"),
            MismatchKind::TypeMismatch => write!(f, "entry type differs"),
            MismatchKind::SizeMismatch { source, target } => {
                write!(f, "size differs: source {} bytes, target {} bytes", source, target)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mismatch {
    /// Path relative to both roots
    pub path: PathBuf,
    pub kind: MismatchKind,
}

/// Result of the size-only comparison pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub checked: u64,
    pub mismatches: Vec<Mismatch>,
}

impl VerificationReport {
    pub fn is_match(&self) -> bool {
        self.mismatches.is_empty()
    }
}
