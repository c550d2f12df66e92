pub mod config;
pub mod entry;
pub mod error;
pub mod metadata;
pub mod queue;
pub mod registry;
pub mod replicator;
pub mod retry;
pub mod stats;
pub mod utils;
pub mod verify;
pub mod walker;

// Re-export commonly used types
pub use config::{ReplicationConfig, RetryConfig};
pub use entry::{EntryKind, SourceEntry, SpecialKind};
pub use error::{DeassimError, DeassimResult, ErrorContext, ErrorSeverity, FailureKind};
pub use queue::{DirectoryJob, JobQueue};
pub use registry::{Claim, FirstClaim, InodeKey, InodeRegistry};
pub use replicator::{EntryOutcome, EntryReplicator};
pub use retry::RetryPolicy;
pub use stats::{spawn_status_reporter, status_channel, RunStatistics};
pub use verify::VerificationComparator;
pub use walker::{RunContext, RunHandle, TreeWalker};

// Expose the protocol crate directly for convenience (e.g., deassim::protocol::RunSummary)
pub use deassim_protocol as protocol;
