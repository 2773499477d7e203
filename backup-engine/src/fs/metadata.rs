//! Size and modification time of files being backed up.

use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// What change detection compares: content size and fractional mtime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FileStat {
    /// File size in bytes
    pub size: u64,

    /// Last modified time (seconds since Unix epoch, sub-second precision)
    pub mtime: f64,
}

impl FileStat {
    /// Stat a file, following symlinks.
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = fs::metadata(path)?;
        Ok(Self {
            size: metadata.len(),
            mtime: epoch_seconds(metadata.modified()?),
        })
    }
}

/// Seconds since the epoch as `f64`; negative before 1970.
pub fn epoch_seconds(time: SystemTime) -> f64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    #[test]
    fn test_extract_stat() -> std::io::Result<()> {
        let mut temp_file = NamedTempFile::new()?;
        temp_file.write_all(b"test content")?;
        temp_file.flush()?;

        let stat = FileStat::from_path(temp_file.path())?;

        assert_eq!(stat.size, 12);
        assert!(stat.mtime > 0.0);

        Ok(())
    }

    #[test]
    fn test_epoch_seconds_keeps_fraction() {
        let t = UNIX_EPOCH + Duration::from_millis(1_500);
        assert!((epoch_seconds(t) - 1.5).abs() < 1e-9);
        let before = UNIX_EPOCH - Duration::from_secs(2);
        assert!((epoch_seconds(before) + 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(FileStat::from_path(Path::new("/definitely/not/here")).is_err());
    }
}
