pub mod backup_file;
pub mod backup_job;
pub mod backup_set;
pub mod summary;

use chrono::{SecondsFormat, Utc};

/// Timestamps are stored as RFC3339 text with microseconds so that
/// lexical and chronological order agree.
pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}
