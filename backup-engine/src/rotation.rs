//! Retention of backup sets.
//!
//! Rotation keeps the `keep` newest sets of a job and removes the rest from
//! three places: the job's destination directory, the ledger, and the
//! remote store when one is configured. Sets are ranked once over the union
//! of both local views, so a set that exists only in the ledger (a dry run)
//! or only on disk counts the same in each. A failure in one place does not
//! stop the others.

use crate::offload::remote::{RemoteTarget, SET_PREFIX};
use backup_ledger::Ledger;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RotationReport {
    /// Set names whose directories were removed
    pub removed_dirs: Vec<String>,
    /// Set names removed from the ledger
    pub removed_sets: Vec<String>,
    /// Remote prefixes removed
    pub removed_remote: Vec<String>,
    pub failures: usize,
}

impl RotationReport {
    pub fn is_clean(&self) -> bool {
        self.failures == 0
    }
}

pub fn rotate(
    ledger: &Ledger,
    job_dst: &Path,
    job_name: &str,
    keep: usize,
    remote: Option<&RemoteTarget<'_>>,
) -> RotationReport {
    let mut report = RotationReport::default();

    let on_disk = set_directories(job_dst, &mut report);
    let in_ledger: BTreeMap<String, i64> = match ledger.sets_for_job(job_name) {
        Ok(sets) => sets.into_iter().map(|s| (s.set_name, s.id)).collect(),
        Err(e) => {
            tracing::warn!(job = %job_name, error = %e, "cannot list ledger sets");
            report.failures += 1;
            BTreeMap::new()
        }
    };

    // set names are timestamps, so name order is age order
    let all: BTreeSet<&String> = on_disk.iter().chain(in_ledger.keys()).collect();
    let doomed: Vec<String> = all.into_iter().rev().skip(keep).cloned().collect();

    for set_name in &doomed {
        if on_disk.contains(set_name) {
            let dir = job_dst.join(format!("{}{}", SET_PREFIX, set_name));
            match fs::remove_dir_all(&dir) {
                Ok(()) => {
                    tracing::info!(path = %dir.display(), "removed old backup set directory");
                    report.removed_dirs.push(set_name.clone());
                }
                Err(e) => {
                    tracing::warn!(path = %dir.display(), error = %e, "failed to remove backup set directory");
                    report.failures += 1;
                }
            }
        }

        if let Some(&id) = in_ledger.get(set_name) {
            match ledger.delete_set(id) {
                Ok(true) => {
                    tracing::info!(job = %job_name, set = %set_name, "deleted backup set from ledger");
                    report.removed_sets.push(set_name.clone());
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(job = %job_name, set = %set_name, error = %e, "failed to delete backup set from ledger");
                    report.failures += 1;
                }
            }
        }

        if let Some(target) = remote {
            let prefix = target.set_prefix(set_name);
            match target.store.remove_prefix(&prefix) {
                Ok(()) => report.removed_remote.push(prefix),
                Err(e) => {
                    tracing::warn!(job = %job_name, prefix = %prefix, error = %e, "remote rotation failed");
                    report.failures += 1;
                }
            }
        }
    }

    if !doomed.is_empty() {
        tracing::info!(
            job = %job_name,
            keep,
            dirs = report.removed_dirs.len(),
            sets = report.removed_sets.len(),
            remote = report.removed_remote.len(),
            "rotated old backup sets"
        );
    }
    report
}

/// Names of the `backup_set_*` directories under `job_dst`. A missing
/// destination has none.
fn set_directories(job_dst: &Path, report: &mut RotationReport) -> BTreeSet<String> {
    let entries = match fs::read_dir(job_dst) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeSet::new(),
        Err(e) => {
            tracing::warn!(path = %job_dst.display(), error = %e, "cannot list backup sets");
            report.failures += 1;
            return BTreeSet::new();
        }
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|entry| {
            entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix(SET_PREFIX))
                .map(str::to_string)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offload::remote::tests::FakeStore;
    use backup_ledger::CreateSetData;
    use tempfile::TempDir;

    const NAMES: [&str; 4] = ["20240101_000000", "20240102_000000", "20240103_000000", "20240104_000000"];

    fn setup() -> (TempDir, Ledger) {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::open(&dir.path().join("ledger.db")).unwrap();
        for name in NAMES {
            fs::create_dir_all(dir.path().join("dst").join(format!("backup_set_{}", name))).unwrap();
            ledger
                .create_set(&CreateSetData {
                    job_name: "docs".to_string(),
                    set_name: name.to_string(),
                    ..Default::default()
                })
                .unwrap();
        }
        (dir, ledger)
    }

    #[test]
    fn test_rotation_keeps_newest_everywhere() {
        let (dir, ledger) = setup();
        let job_dst = dir.path().join("dst");
        fs::write(job_dst.join("last_full.txt"), "20240104_000000").unwrap();

        let store = FakeStore::default();
        let target = RemoteTarget::new(&store, "host", "docs");
        for name in NAMES {
            store.prefixes.borrow_mut().insert(target.set_prefix(name));
        }

        let report = rotate(&ledger, &job_dst, "docs", 2, Some(&target));
        assert!(report.is_clean());

        let mut dirs: Vec<_> = fs::read_dir(&job_dst)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        dirs.sort();
        assert_eq!(
            dirs,
            vec!["backup_set_20240103_000000", "backup_set_20240104_000000", "last_full.txt"]
        );

        let sets: Vec<_> = ledger.sets_for_job("docs").unwrap().into_iter().map(|s| s.set_name).collect();
        assert_eq!(sets, vec!["20240104_000000", "20240103_000000"]);

        let remote: Vec<_> = store.prefixes.borrow().iter().cloned().collect();
        assert_eq!(
            remote,
            vec![target.set_prefix("20240103_000000"), target.set_prefix("20240104_000000")]
        );
        assert_eq!(report.removed_remote.len(), 2);
    }

    #[test]
    fn test_rotation_under_limit_is_noop() {
        let (dir, ledger) = setup();
        let report = rotate(&ledger, &dir.path().join("dst"), "docs", 10, None);
        assert!(report.removed_dirs.is_empty());
        assert!(report.removed_sets.is_empty());
        assert_eq!(ledger.sets_for_job("docs").unwrap().len(), 4);
    }

    #[test]
    fn test_ledger_only_sets_share_one_ranking() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::open(&dir.path().join("ledger.db")).unwrap();
        let job_dst = dir.path().join("dst");
        // the middle set is a dry run and has no directory
        for (name, on_disk) in [("20240101_000000", true), ("20240102_000000", false), ("20240103_000000", true)] {
            if on_disk {
                fs::create_dir_all(job_dst.join(format!("backup_set_{}", name))).unwrap();
            }
            ledger
                .create_set(&CreateSetData {
                    job_name: "docs".to_string(),
                    set_name: name.to_string(),
                    ..Default::default()
                })
                .unwrap();
        }

        let report = rotate(&ledger, &job_dst, "docs", 2, None);
        assert!(report.is_clean());
        assert_eq!(report.removed_dirs, vec!["20240101_000000"]);
        assert_eq!(report.removed_sets, vec!["20240101_000000"]);

        let sets: Vec<_> = ledger.sets_for_job("docs").unwrap().into_iter().map(|s| s.set_name).collect();
        assert_eq!(sets, vec!["20240103_000000", "20240102_000000"]);
        assert!(!job_dst.join("backup_set_20240101_000000").exists());
        assert!(job_dst.join("backup_set_20240103_000000").exists());
    }

    #[test]
    fn test_disk_only_sets_are_ranked_too() {
        let (dir, ledger) = setup();
        let job_dst = dir.path().join("dst");
        fs::create_dir_all(job_dst.join("backup_set_20240105_000000")).unwrap();

        let report = rotate(&ledger, &job_dst, "docs", 2, None);
        assert_eq!(report.removed_dirs.len(), 3);
        let sets: Vec<_> = ledger.sets_for_job("docs").unwrap().into_iter().map(|s| s.set_name).collect();
        assert_eq!(sets, vec!["20240104_000000"]);
    }

    #[test]
    fn test_missing_destination_still_rotates_ledger() {
        let (dir, ledger) = setup();
        let report = rotate(&ledger, &dir.path().join("nowhere"), "docs", 1, None);
        assert!(report.is_clean());
        assert_eq!(report.removed_sets.len(), 3);
        assert_eq!(ledger.sets_for_job("docs").unwrap().len(), 1);
    }
}
