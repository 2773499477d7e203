//! Baseline file lists for differential and incremental backups.
//!
//! A baseline records, for every path a previous job archived, the size and
//! mtime it had at that time, so a new scan can be diffed against it.

use backup_ledger::BackupFile;
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct Baseline {
    pub files: HashMap<String, BaselineEntry>,
}

/// Metadata for a single file in the baseline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BaselineEntry {
    pub size: u64,
    pub mtime: f64,
}

impl Baseline {
    /// Build from ledger rows; when a path occurs more than once the last
    /// row wins, so callers pass rows oldest first.
    pub fn from_files<'a>(rows: impl IntoIterator<Item = &'a BackupFile>) -> Self {
        let mut files = HashMap::new();
        for row in rows {
            files.insert(
                row.path.clone(),
                BaselineEntry {
                    size: u64::try_from(row.size_bytes).unwrap_or(0),
                    mtime: row.mtime,
                },
            );
        }
        Self { files }
    }

    pub fn get(&self, rel_path: &str) -> Option<&BaselineEntry> {
        self.files.get(rel_path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
