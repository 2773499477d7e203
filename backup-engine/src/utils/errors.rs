//! Error types for the backup engine.

use backup_ledger::LedgerError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Job '{job}' is already running (pid {pid} on {host})")]
    AlreadyLocked { job: String, pid: i32, host: String },

    #[error("Source directory unreadable: {0}")]
    SourceUnreadable(String),

    #[error("Invalid exclusion pattern '{pattern}': {reason}")]
    Pattern { pattern: String, reason: String },

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Remote sync error: {0}")]
    RemoteSync(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
