//! Choosing what a run will do before any file is touched.

use super::baseline::Baseline;
use crate::utils::Result;
use backup_ledger::{BackupKind, BackupSet, Ledger};

/// Outcome of planning a run.
#[derive(Debug)]
pub enum Plan {
    /// Run `kind` against `baseline`. `set` is the existing set the run
    /// appends to; `None` means a new set is created.
    Proceed {
        kind: BackupKind,
        set: Option<BackupSet>,
        baseline: Baseline,
    },
    /// The requested kind has nothing to compare against; run this instead.
    Fallback(BackupKind),
}

/// Build the plan for `kind` from the ledger alone.
///
/// Differential compares against the files of the last completed full job.
/// Incremental compares against every completed job in the newest set that
/// holds a completed full, so each incremental sees its predecessors.
pub fn plan(ledger: &Ledger, job_name: &str, kind: BackupKind) -> Result<Plan> {
    match kind {
        BackupKind::Full | BackupKind::DryRun => Ok(Plan::Proceed {
            kind,
            set: None,
            baseline: Baseline::default(),
        }),
        BackupKind::Differential => {
            let Some(full) = ledger.last_completed_full(job_name)? else {
                return Ok(Plan::Fallback(BackupKind::Full));
            };
            let set = match full.backup_set_id {
                Some(set_id) => ledger.find_set(set_id)?,
                None => None,
            };
            let Some(set) = set else {
                return Ok(Plan::Fallback(BackupKind::Full));
            };
            let files = ledger.files_for_job(full.id)?;
            Ok(Plan::Proceed {
                kind,
                set: Some(set),
                baseline: Baseline::from_files(&files),
            })
        }
        BackupKind::Incremental => {
            let Some(set) = ledger.latest_set_with_completed_full(job_name)? else {
                return Ok(Plan::Fallback(BackupKind::Full));
            };
            let files = ledger.completed_files_in_set(set.id)?;
            Ok(Plan::Proceed {
                kind,
                set: Some(set),
                baseline: Baseline::from_files(&files),
            })
        }
    }
}
