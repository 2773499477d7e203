//! Source tree access: exclusion rules, traversal, file stats.

pub mod exclude;
pub mod metadata;
pub mod walker;

pub use exclude::{ExclusionMatcher, BUILTIN_EXCLUDED_DIRS};
pub use metadata::FileStat;
pub use walker::{relative_slash_path, FileScanner};
