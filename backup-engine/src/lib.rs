//! Backup engine library
//!
//! Full, differential and incremental backups of a directory tree into
//! size-bounded `tar.zst` chunks, tracked in the backup ledger, and
//! restores from them.

pub mod archive;
pub mod config;
pub mod executor;
pub mod fs;
pub mod lock;
pub mod offload;
pub mod restore;
pub mod rotation;
pub mod utils;

// Re-export commonly used types
pub use backup_ledger::{BackupKind, JobStatus, Ledger};
pub use config::{EngineSettings, GlobalConfig, JobConfig, PartialJobConfig};
pub use executor::{Engine, RunOutcome, RunResult, SkipReason};
pub use restore::RestoreReport;
pub use utils::errors::{EngineError, Result};
