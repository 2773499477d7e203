//! Source tree traversal with exclusion pruning.

use crate::fs::exclude::ExclusionMatcher;
use crate::utils::{EngineError, Result};
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Walks a source root, yielding the absolute paths of files to consider.
///
/// Excluded directories are pruned before they are read. Order is
/// depth-first and lexical by file name within a directory, so two scans
/// of an unchanged tree yield the same sequence.
pub struct FileScanner<'a> {
    root: PathBuf,
    matcher: &'a ExclusionMatcher,
}

impl<'a> FileScanner<'a> {
    pub fn new(root: &Path, matcher: &'a ExclusionMatcher) -> Self {
        Self {
            root: root.to_path_buf(),
            matcher,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start a fresh traversal. Fails only when the root itself cannot be
    /// listed; problems below the root are logged and skipped.
    pub fn scan(&self) -> Result<impl Iterator<Item = PathBuf> + 'a> {
        std::fs::read_dir(&self.root).map_err(|e| {
            EngineError::SourceUnreadable(format!("{}: {}", self.root.display(), e))
        })?;

        let matcher = self.matcher;
        let root = self.root.clone();
        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |e| e.depth() == 0 || !matcher.is_excluded(e.path(), e.file_type().is_dir()));

        Ok(walker.filter_map(move |entry| match entry {
            Ok(entry) => file_path(&entry).filter(|path| {
                let named = relative_slash_path(path, &root).is_some();
                if !named {
                    tracing::warn!(path = %path.display(), "skipping file with a non-UTF-8 name");
                }
                named
            }),
            Err(e) => {
                let path = e.path().map(|p| p.display().to_string()).unwrap_or_default();
                tracing::warn!(path = %path, error = %e, "skipping unreadable entry");
                None
            }
        }))
    }
}

/// The path to yield for an entry, or `None` for directories, special
/// files, broken symlinks and symlinks to directories.
fn file_path(entry: &DirEntry) -> Option<PathBuf> {
    let file_type = entry.file_type();
    if file_type.is_file() {
        return Some(entry.path().to_path_buf());
    }
    if !file_type.is_symlink() {
        return None;
    }

    match std::fs::metadata(entry.path()) {
        Ok(target) if target.is_file() => Some(entry.path().to_path_buf()),
        Ok(_) => {
            tracing::debug!(path = %entry.path().display(), "skipping symlink to directory");
            None
        }
        Err(_) => {
            tracing::warn!(path = %entry.path().display(), "skipping broken symlink");
            None
        }
    }
}

/// Path of `path` relative to `root`, with forward slashes. `None` when a
/// component is not valid UTF-8, since the ledger and tar names are text.
pub fn relative_slash_path(path: &Path, root: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let parts = rel
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join("/"))
}
