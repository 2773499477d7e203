//! Exclusion patterns for backup scans.
//!
//! A pattern excludes a path (taken relative to the source root, with
//! forward slashes) when any of these hold:
//! - the pattern, minus a trailing `/`, equals the relative path;
//! - the pattern ends in `/` and the path lies under that directory;
//! - the pattern globs the basename;
//! - the pattern globs the whole relative path (`*` crosses `/`, so `**`
//!   matches at any depth);
//! - the pattern ends in `/`, has no inner `/`, and globs any directory
//!   segment of the path.
//!
//! Patterns ending in `/` only apply to directories and their contents.

use crate::utils::{EngineError, Result};
use globset::{GlobBuilder, GlobMatcher};
use std::path::{Component, Path, PathBuf};

/// Directory names that are never backed up, whatever the job says.
pub const BUILTIN_EXCLUDED_DIRS: &[&str] = &["node_modules", "__pycache__"];

#[derive(Debug, Clone)]
struct Rule {
    literal: String,
    glob: GlobMatcher,
    dir_only: bool,
    any_segment: bool,
}

impl Rule {
    fn new(pattern: &str) -> Result<Self> {
        let normalized = pattern.replace('\\', "/");
        let dir_only = normalized.ends_with('/');
        let literal = normalized
            .trim_end_matches('/')
            .trim_start_matches("./")
            .to_string();
        if literal.is_empty() {
            return Err(EngineError::Pattern {
                pattern: pattern.to_string(),
                reason: "empty pattern".to_string(),
            });
        }

        let glob = compile(&literal).or_else(|first| {
            if literal.contains("**") {
                compile(&literal.replace("**", "*"))
            } else {
                Err(first)
            }
        });
        let glob = glob.map_err(|e| EngineError::Pattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            any_segment: dir_only && !literal.contains('/'),
            literal,
            glob,
            dir_only,
        })
    }

    fn matches(&self, rel: &str, segments: &[&str], is_dir: bool) -> bool {
        let basename = segments.last().copied().unwrap_or(rel);

        if self.dir_only {
            // the directory itself
            if is_dir && (rel == self.literal || self.glob.is_match(rel) || self.glob.is_match(basename)) {
                return true;
            }
            // anything beneath it
            if rel.starts_with(&self.literal) && rel[self.literal.len()..].starts_with('/') {
                return true;
            }
            if self.any_segment {
                let dirs = if is_dir { segments } else { &segments[..segments.len().saturating_sub(1)] };
                return dirs.iter().any(|seg| self.glob.is_match(seg));
            }
            return false;
        }

        rel == self.literal || self.glob.is_match(basename) || self.glob.is_match(rel)
    }
}

fn compile(pattern: &str) -> std::result::Result<GlobMatcher, globset::Error> {
    Ok(GlobBuilder::new(pattern)
        .literal_separator(false)
        .build()?
        .compile_matcher())
}

/// Compiled pattern set for one source root.
#[derive(Debug, Clone)]
pub struct ExclusionMatcher {
    root: PathBuf,
    rules: Vec<Rule>,
    builtin_dirs: Vec<String>,
}

impl ExclusionMatcher {
    pub fn new<S: AsRef<str>>(root: &Path, patterns: &[S], builtin_dirs: &[S]) -> Result<Self> {
        let rules = patterns
            .iter()
            .map(|p| Rule::new(p.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            root: root.to_path_buf(),
            rules,
            builtin_dirs: builtin_dirs.iter().map(|d| d.as_ref().to_string()).collect(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether `path` (absolute, or relative to the root) is excluded.
    /// The root itself never is.
    pub fn is_excluded(&self, path: &Path, is_dir: bool) -> bool {
        let rel_path = path.strip_prefix(&self.root).unwrap_or(path);
        let segments: Vec<String> = rel_path
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        if segments.is_empty() {
            return false;
        }
        let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
        let rel = segments.join("/");

        let dirs = if is_dir { &segments[..] } else { &segments[..segments.len() - 1] };
        if dirs.iter().any(|seg| self.builtin_dirs.iter().any(|b| b == seg)) {
            return true;
        }

        self.rules.iter().any(|rule| rule.matches(&rel, &segments, is_dir))
    }
}

/// One-shot form of [`ExclusionMatcher::is_excluded`] with the built-in
/// directory policy. Whether `path` is a directory is read from disk.
pub fn is_excluded<S: AsRef<str>>(path: &Path, patterns: &[S], root: &Path) -> Result<bool> {
    let builtin: Vec<&str> = BUILTIN_EXCLUDED_DIRS.to_vec();
    let patterns: Vec<&str> = patterns.iter().map(|p| p.as_ref()).collect();
    let matcher = ExclusionMatcher::new(root, &patterns, &builtin)?;
    let is_dir = std::fs::symlink_metadata(path)
        .map(|m| m.is_dir())
        .unwrap_or(false);
    Ok(matcher.is_excluded(path, is_dir))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(patterns: &[&str]) -> ExclusionMatcher {
        ExclusionMatcher::new(Path::new("/src"), patterns, BUILTIN_EXCLUDED_DIRS).unwrap()
    }

    #[test]
    fn test_exact_and_basename_glob() {
        let m = matcher(&["secret.txt", "*.log"]);
        assert!(m.is_excluded(Path::new("/src/secret.txt"), false));
        assert!(m.is_excluded(Path::new("/src/a/b/debug.log"), false));
        assert!(!m.is_excluded(Path::new("/src/a/notes.txt"), false));
    }

    #[test]
    fn test_full_path_glob_and_double_star() {
        let m = matcher(&["build/*.o", "**/cache/**", "logs/**/old"]);
        assert!(m.is_excluded(Path::new("/src/build/main.o"), false));
        assert!(m.is_excluded(Path::new("/src/x/y/cache/blob"), false));
        assert!(m.is_excluded(Path::new("/src/logs/2024/jan/old"), true));
        assert!(!m.is_excluded(Path::new("/src/src/main.rs"), false));
    }

    #[test]
    fn test_invalid_double_star_falls_back_to_star() {
        let m = matcher(&["tmp**"]);
        assert!(m.is_excluded(Path::new("/src/tmpfile"), false));
        assert!(m.is_excluded(Path::new("/src/tmp/a/b"), false));
    }

    #[test]
    fn test_directory_pattern_only_matches_directories() {
        let m = matcher(&["target/"]);
        assert!(m.is_excluded(Path::new("/src/target"), true));
        assert!(!m.is_excluded(Path::new("/src/target"), false));
        assert!(m.is_excluded(Path::new("/src/target/debug/app"), false));
        // any depth
        assert!(m.is_excluded(Path::new("/src/crates/core/target"), true));
        assert!(m.is_excluded(Path::new("/src/crates/core/target/x.rlib"), false));
    }

    #[test]
    fn test_nested_directory_pattern_is_anchored() {
        let m = matcher(&["data/raw/"]);
        assert!(m.is_excluded(Path::new("/src/data/raw"), true));
        assert!(m.is_excluded(Path::new("/src/data/raw/file.bin"), false));
        assert!(!m.is_excluded(Path::new("/src/other/data/raw/file.bin"), false));
    }

    #[test]
    fn test_builtin_dirs_always_excluded() {
        let m = matcher(&[]);
        assert!(m.is_excluded(Path::new("/src/web/node_modules"), true));
        assert!(m.is_excluded(Path::new("/src/web/node_modules/left-pad/index.js"), false));
        assert!(m.is_excluded(Path::new("/src/pkg/__pycache__"), true));
        // a file merely named like one is kept
        assert!(!m.is_excluded(Path::new("/src/node_modules"), false));
    }

    #[test]
    fn test_root_never_excluded() {
        let m = matcher(&["*", "src/"]);
        assert!(!m.is_excluded(Path::new("/src"), true));
    }

    #[test]
    fn test_matching_is_order_independent_and_stable() {
        let paths = [
            ("/src/a/b.log", false),
            ("/src/target", true),
            ("/src/keep/me.txt", false),
            ("/src/x/cache/y", false),
        ];
        let forward = matcher(&["*.log", "target/", "**/cache/**"]);
        let reverse = matcher(&["**/cache/**", "target/", "*.log"]);
        for (p, is_dir) in paths {
            let first = forward.is_excluded(Path::new(p), is_dir);
            assert_eq!(first, forward.is_excluded(Path::new(p), is_dir));
            assert_eq!(first, reverse.is_excluded(Path::new(p), is_dir));
        }
    }

    #[test]
    fn test_empty_pattern_rejected() {
        let err = ExclusionMatcher::new(Path::new("/src"), &["/"], &[]);
        assert!(matches!(err, Err(EngineError::Pattern { .. })));
    }

    #[test]
    fn test_free_function_reads_directory_flag() -> std::io::Result<()> {
        let dir = tempfile::TempDir::new()?;
        std::fs::create_dir(dir.path().join("out"))?;
        std::fs::write(dir.path().join("out.txt"), b"x")?;

        assert!(is_excluded(&dir.path().join("out"), &["out/"], dir.path()).unwrap());
        assert!(!is_excluded(&dir.path().join("out.txt"), &["out/"], dir.path()).unwrap());
        Ok(())
    }
}
