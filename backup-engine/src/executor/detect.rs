//! Change detection against a baseline.

use super::baseline::Baseline;
use crate::fs::{relative_slash_path, FileStat};
use std::path::{Path, PathBuf};

/// Filesystems that truncate timestamps differ by up to this much.
pub const MTIME_TOLERANCE_SECS: f64 = 1.0;

/// A file that has to go into the next archive.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangedFile {
    pub path: PathBuf,
    pub relative_path: String,
    pub size: u64,
    pub mtime: f64,
    pub is_new: bool,
    pub is_modified: bool,
}

/// Files among `files` that are absent from `baseline` or whose size or
/// mtime moved. With an empty baseline every file is new. Input order is
/// preserved.
pub fn detect<I>(files: I, root: &Path, baseline: &Baseline) -> Vec<ChangedFile>
where
    I: IntoIterator<Item = PathBuf>,
{
    let mut changed = Vec::new();
    let mut unchanged = 0usize;

    for path in files {
        let stat = match FileStat::from_path(&path) {
            Ok(stat) => stat,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "file vanished before it could be examined");
                continue;
            }
        };
        let Some(relative_path) = relative_slash_path(&path, root) else {
            tracing::warn!(path = %path.display(), "skipping file with a non-UTF-8 name");
            continue;
        };

        let (is_new, is_modified) = match baseline.get(&relative_path) {
            None => (true, false),
            Some(entry) => {
                let moved = (stat.mtime - entry.mtime).abs() > MTIME_TOLERANCE_SECS || stat.size != entry.size;
                (false, moved)
            }
        };

        if !is_new && !is_modified {
            unchanged += 1;
            continue;
        }

        changed.push(ChangedFile {
            path,
            relative_path,
            size: stat.size,
            mtime: stat.mtime,
            is_new,
            is_modified,
        });
    }

    tracing::debug!(
        changed = changed.len(),
        unchanged,
        baseline = baseline.len(),
        "change detection finished"
    );
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::baseline::BaselineEntry;
    use std::fs;
    use tempfile::TempDir;

    fn baseline_of(entries: &[(&str, u64, f64)]) -> Baseline {
        Baseline {
            files: entries
                .iter()
                .map(|(p, size, mtime)| (p.to_string(), BaselineEntry { size: *size, mtime: *mtime }))
                .collect(),
        }
    }

    #[test]
    fn test_empty_baseline_marks_everything_new() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        fs::write(root.join("a.txt"), b"aaa")?;

        let changed = detect(vec![root.join("a.txt")], root, &Baseline::default());
        assert_eq!(changed.len(), 1);
        assert!(changed[0].is_new);
        assert!(!changed[0].is_modified);
        assert_eq!(changed[0].relative_path, "a.txt");
        assert_eq!(changed[0].size, 3);
        Ok(())
    }

    #[test]
    fn test_unchanged_round_trip() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        fs::create_dir(root.join("d"))?;
        fs::write(root.join("a.txt"), b"aaa")?;
        fs::write(root.join("d/b.txt"), b"bb")?;
        let files = vec![root.join("a.txt"), root.join("d/b.txt")];

        // feed the detector's own output back as the baseline
        let first = detect(files.clone(), root, &Baseline::default());
        let baseline = baseline_of(
            &first
                .iter()
                .map(|c| (c.relative_path.as_str(), c.size, c.mtime))
                .collect::<Vec<_>>(),
        );
        assert!(detect(files, root, &baseline).is_empty());
        Ok(())
    }

    #[test]
    fn test_size_and_mtime_changes() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        fs::write(root.join("size.txt"), b"12345")?;
        fs::write(root.join("time.txt"), b"1")?;
        fs::write(root.join("jitter.txt"), b"1")?;

        let time_mtime = FileStat::from_path(&root.join("time.txt"))?.mtime;
        let jitter_mtime = FileStat::from_path(&root.join("jitter.txt"))?.mtime;
        let size_mtime = FileStat::from_path(&root.join("size.txt"))?.mtime;

        let baseline = baseline_of(&[
            ("size.txt", 4, size_mtime),
            ("time.txt", 1, time_mtime - 5.0),
            ("jitter.txt", 1, jitter_mtime - 0.5),
        ]);
        let changed = detect(
            vec![root.join("jitter.txt"), root.join("size.txt"), root.join("time.txt")],
            root,
            &baseline,
        );
        let names: Vec<_> = changed.iter().map(|c| c.relative_path.as_str()).collect();
        assert_eq!(names, vec!["size.txt", "time.txt"]);
        assert!(changed.iter().all(|c| c.is_modified && !c.is_new));
        Ok(())
    }

    #[test]
    fn test_vanished_file_is_skipped() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        fs::write(root.join("here.txt"), b"h")?;

        let changed = detect(vec![root.join("gone.txt"), root.join("here.txt")], root, &Baseline::default());
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].relative_path, "here.txt");
        Ok(())
    }
}
