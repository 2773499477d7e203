//! SQLite ledger of backup sets, the jobs that wrote into them and the
//! files each job archived.

pub mod db;
pub mod error;
pub mod ledger;
pub mod models;

pub use error::{LedgerError, Result};
pub use ledger::Ledger;
pub use models::backup_file::{BackupFile, FileHit, NewFile};
pub use models::backup_job::{BackupJob, BackupKind, Finalization, JobStatus, NewJob};
pub use models::backup_set::{BackupSet, CreateSetData};
pub use models::summary::{JobSummary, SetDetail, SetSummary};
