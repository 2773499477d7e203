//! Per-job advisory locks.
//!
//! A job's lock is the marker file `<lock_dir>/<job>.lock`, created
//! exclusively and held under a non-blocking `flock` for the life of the
//! run. The marker carries [`LockInfo`] so that a marker left behind by a
//! crashed run can be recognised and reclaimed.

pub mod process;

pub use process::is_process_alive;

use crate::utils::{host_name, sanitize_name, EngineError, Result};
use chrono::{DateTime, Duration, Utc};
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// Markers older than this are reclaimed even if their holder looks alive.
pub const DEFAULT_STALE_AFTER_HOURS: i64 = 2;

const LOCK_EXTENSION: &str = "lock";
const GUARD_EXTENSION: &str = "guard";

/// Who holds a lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: i32,
    pub host: String,
    pub created_at: DateTime<Utc>,
    pub command: String,
}

impl LockInfo {
    fn current() -> Self {
        Self {
            pid: std::process::id() as i32,
            host: host_name(),
            created_at: Utc::now(),
            command: std::env::args().collect::<Vec<_>>().join(" "),
        }
    }
}

/// State of one marker found in the lock directory.
#[derive(Debug, Clone, Serialize)]
pub struct LockStatus {
    pub job: String,
    pub path: PathBuf,
    pub info: Option<LockInfo>,
    /// Why the marker would be reclaimed, if it would.
    pub stale_reason: Option<String>,
}

pub struct LockManager {
    lock_dir: PathBuf,
    stale_after: Duration,
    host: String,
}

impl LockManager {
    pub fn new(lock_dir: &Path, stale_after: Duration) -> Self {
        Self {
            lock_dir: lock_dir.to_path_buf(),
            stale_after,
            host: host_name(),
        }
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    pub fn lock_path(&self, job_name: &str) -> PathBuf {
        self.lock_dir
            .join(format!("{}.{}", sanitize_name(job_name), LOCK_EXTENSION))
    }

    /// Guard file serialising acquisition and release for one job. It is
    /// never removed, so every process locks the same inode.
    fn guard_path(&self, job_name: &str) -> PathBuf {
        self.lock_dir
            .join(format!(".{}.{}", sanitize_name(job_name), GUARD_EXTENSION))
    }

    /// Take the lock for `job_name` without waiting on its holder.
    ///
    /// An existing marker is inspected once: if it is stale it is removed and
    /// acquisition retried, otherwise this fails with `AlreadyLocked`. The
    /// inspect, remove and create steps run under the job's guard file so two
    /// acquirers never reclaim the same marker.
    pub fn acquire(&self, job_name: &str) -> Result<LockHandle> {
        fs::create_dir_all(&self.lock_dir)?;
        let path = self.lock_path(job_name);
        let guard_path = self.guard_path(job_name);
        let _guard = lock_guard(&guard_path)?;

        for attempt in 0..2 {
            if let Some(lock) = self.try_create(&path, job_name)? {
                return Ok(LockHandle {
                    job: job_name.to_string(),
                    path,
                    guard_path,
                    lock: Some(lock),
                });
            }
            if attempt > 0 {
                break;
            }

            let status = self.inspect(&path, job_name)?;
            match status.stale_reason {
                Some(reason) => {
                    tracing::warn!(job = %job_name, path = %path.display(), reason = %reason, "removing stale lock");
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                None => return Err(already_locked(job_name, status.info)),
            }
        }

        let info = read_info(&path).ok();
        Err(already_locked(job_name, info))
    }

    /// Create the marker exclusively, flock it and write the holder.
    /// `None` when a marker already exists.
    fn try_create(&self, path: &Path, job_name: &str) -> Result<Option<Flock<File>>> {
        let file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        // only a `list` inspection can hold a marker this young, and only briefly
        let mut lock = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| std::io::Error::from(errno))?;

        let info = LockInfo::current();
        let written = serde_json::to_vec_pretty(&info)
            .map_err(EngineError::from)
            .and_then(|json| {
                lock.write_all(&json)?;
                lock.sync_all()?;
                Ok(())
            });
        if let Err(e) = written {
            let _ = fs::remove_file(path);
            drop(lock);
            return Err(e);
        }

        tracing::debug!(job = %job_name, path = %path.display(), pid = info.pid, "lock acquired");
        Ok(Some(lock))
    }

    /// Read a marker and decide whether it is stale.
    fn inspect(&self, path: &Path, job_name: &str) -> Result<LockStatus> {
        let info = match read_info(path) {
            Ok(info) => Some(info),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(LockStatus {
                    job: job_name.to_string(),
                    path: path.to_path_buf(),
                    info: None,
                    stale_reason: Some("marker vanished".to_string()),
                });
            }
            Err(_) => None,
        };

        let stale_reason = match &info {
            None => {
                if is_flock_held(path)? {
                    None
                } else {
                    Some("unreadable lock metadata and no holder".to_string())
                }
            }
            Some(info) => self.stale_reason(info, is_flock_held(path)?),
        };

        Ok(LockStatus {
            job: job_name.to_string(),
            path: path.to_path_buf(),
            info,
            stale_reason,
        })
    }

    /// A flock holder is alive by definition, so only the age ceiling can
    /// reclaim a held marker.
    fn stale_reason(&self, info: &LockInfo, held: bool) -> Option<String> {
        let age = Utc::now() - info.created_at;
        if age > self.stale_after {
            return Some(format!("lock is {} minutes old", age.num_minutes()));
        }
        if !held && info.host == self.host && !is_process_alive(info.pid) {
            return Some(format!("holder pid {} is gone", info.pid));
        }
        None
    }

    /// Every marker in the lock directory with its staleness verdict.
    pub fn list(&self) -> Result<Vec<LockStatus>> {
        let entries = match fs::read_dir(&self.lock_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut locks = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOCK_EXTENSION) {
                continue;
            }
            let job = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            locks.push(self.inspect(&path, &job)?);
        }
        locks.sort_by(|a, b| a.job.cmp(&b.job));
        Ok(locks)
    }
}

fn read_info(path: &Path) -> std::io::Result<LockInfo> {
    let text = fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))
}

/// Whether some process holds the marker's flock.
fn is_flock_held(path: &Path) -> Result<bool> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(_free) => Ok(false),
        Err(_) => Ok(true),
    }
}

fn lock_guard(path: &Path) -> Result<Flock<File>> {
    let file = OpenOptions::new().write(true).create(true).truncate(false).open(path)?;
    Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| std::io::Error::from(errno).into())
}

fn same_file(a: &fs::Metadata, b: &fs::Metadata) -> bool {
    a.dev() == b.dev() && a.ino() == b.ino()
}

fn already_locked(job_name: &str, info: Option<LockInfo>) -> EngineError {
    let (pid, host) = info
        .map(|i| (i.pid, i.host))
        .unwrap_or((0, "unknown".to_string()));
    EngineError::AlreadyLocked {
        job: job_name.to_string(),
        pid,
        host,
    }
}

/// A held job lock. Released explicitly or on drop.
pub struct LockHandle {
    job: String,
    path: PathBuf,
    guard_path: PathBuf,
    lock: Option<Flock<File>>,
}

impl LockHandle {
    pub fn job(&self) -> &str {
        &self.job
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        let Some(lock) = self.lock.take() else {
            return;
        };

        let _guard = match lock_guard(&self.guard_path) {
            Ok(guard) => Some(guard),
            Err(e) => {
                tracing::warn!(job = %self.job, error = %e, "failed to take lock guard on release");
                None
            }
        };

        // a marker reclaimed by another run belongs to that run now
        let ours = match (fs::metadata(&self.path), lock.metadata()) {
            (Ok(on_disk), Ok(held)) => same_file(&on_disk, &held),
            (Err(e), _) if e.kind() == ErrorKind::NotFound => false,
            _ => true,
        };
        if ours {
            match fs::remove_file(&self.path) {
                Ok(()) => tracing::debug!(job = %self.job, "lock released"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(job = %self.job, path = %self.path.display(), error = %e, "failed to remove lock marker"),
            }
        } else {
            tracing::warn!(job = %self.job, "lock marker was reclaimed by another run");
        }

        // the marker is gone even if unlocking fails
        if let Err((_, errno)) = lock.unlock() {
            tracing::warn!(job = %self.job, error = %errno, "failed to unlock job lock");
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> LockManager {
        LockManager::new(dir.path(), Duration::hours(DEFAULT_STALE_AFTER_HOURS))
    }

    fn plant(manager: &LockManager, job: &str, info: &LockInfo) {
        fs::create_dir_all(manager.lock_dir()).unwrap();
        fs::write(manager.lock_path(job), serde_json::to_vec(info).unwrap()).unwrap();
    }

    #[test]
    fn test_acquire_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);

        let handle = locks.acquire("docs").unwrap();
        let info = read_info(handle.path()).unwrap();
        assert_eq!(info.pid, std::process::id() as i32);

        match locks.acquire("docs") {
            Err(EngineError::AlreadyLocked { job, pid, .. }) => {
                assert_eq!(job, "docs");
                assert_eq!(pid, std::process::id() as i32);
            }
            other => panic!("expected AlreadyLocked, got {:?}", other.map(|h| h.path().to_path_buf())),
        }

        // other jobs are independent
        let other = locks.acquire("photos").unwrap();
        other.release();

        let path = handle.path().to_path_buf();
        handle.release();
        assert!(!path.exists());
        locks.acquire("docs").unwrap().release();
    }

    #[test]
    fn test_drop_releases() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        {
            let _handle = locks.acquire("docs").unwrap();
            assert!(locks.lock_path("docs").exists());
        }
        assert!(!locks.lock_path("docs").exists());
    }

    #[test]
    fn test_dead_pid_lock_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        plant(
            &locks,
            "docs",
            &LockInfo {
                pid: i32::MAX,
                host: host_name(),
                created_at: Utc::now(),
                command: "backup-engine run".to_string(),
            },
        );

        let handle = locks.acquire("docs").unwrap();
        assert_eq!(read_info(handle.path()).unwrap().pid, std::process::id() as i32);
    }

    #[test]
    fn test_old_lock_is_reclaimed_even_from_other_host() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        plant(
            &locks,
            "docs",
            &LockInfo {
                pid: 1,
                host: "elsewhere".to_string(),
                created_at: Utc::now() - Duration::hours(3),
                command: "backup-engine run".to_string(),
            },
        );
        assert!(locks.acquire("docs").is_ok());
    }

    #[test]
    fn test_fresh_lock_from_other_host_is_respected() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        plant(
            &locks,
            "docs",
            &LockInfo {
                pid: i32::MAX,
                host: "elsewhere".to_string(),
                created_at: Utc::now(),
                command: "backup-engine run".to_string(),
            },
        );
        assert!(matches!(
            locks.acquire("docs"),
            Err(EngineError::AlreadyLocked { pid: i32::MAX, .. })
        ));
    }

    #[test]
    fn test_corrupt_unheld_marker_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        fs::write(locks.lock_path("docs"), b"{ not json").unwrap();
        assert!(locks.acquire("docs").is_ok());
    }

    #[test]
    fn test_corrupt_marker_under_flock_is_respected() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        let path = locks.lock_path("docs");
        fs::write(&path, b"").unwrap();
        let _holder = Flock::lock(File::open(&path).unwrap(), FlockArg::LockExclusiveNonblock).unwrap();

        assert!(matches!(locks.acquire("docs"), Err(EngineError::AlreadyLocked { .. })));
    }

    #[test]
    fn test_list_reports_staleness() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        let _live = locks.acquire("alive").unwrap();
        plant(
            &locks,
            "dead",
            &LockInfo {
                pid: i32::MAX,
                host: host_name(),
                created_at: Utc::now(),
                command: String::new(),
            },
        );

        let listed = locks.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].job, "alive");
        assert!(listed[0].stale_reason.is_none());
        assert_eq!(listed[1].job, "dead");
        assert!(listed[1].stale_reason.is_some());
    }

    #[test]
    fn test_concurrent_reclaim_has_one_winner() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Barrier;

        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        let dead = LockInfo {
            pid: i32::MAX,
            host: host_name(),
            created_at: Utc::now(),
            command: "backup-engine run".to_string(),
        };

        for _ in 0..300 {
            plant(&locks, "docs", &dead);
            let barrier = Barrier::new(6);
            let holders = AtomicUsize::new(0);
            let most = AtomicUsize::new(0);
            let wins = AtomicUsize::new(0);

            std::thread::scope(|scope| {
                for _ in 0..6 {
                    scope.spawn(|| {
                        barrier.wait();
                        if let Ok(handle) = locks.acquire("docs") {
                            let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                            most.fetch_max(now, Ordering::SeqCst);
                            wins.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(5));
                            holders.fetch_sub(1, Ordering::SeqCst);
                            handle.release();
                        }
                    });
                }
            });

            assert_eq!(most.load(Ordering::SeqCst), 1);
            assert!(wins.load(Ordering::SeqCst) >= 1);
            assert!(!locks.lock_path("docs").exists());
        }
    }

    #[test]
    fn test_old_marker_under_flock_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        let path = locks.lock_path("docs");
        plant(
            &locks,
            "docs",
            &LockInfo {
                pid: std::process::id() as i32,
                host: host_name(),
                created_at: Utc::now() - Duration::hours(3),
                command: "backup-engine run".to_string(),
            },
        );
        let old_holder = LockHandle {
            job: "docs".to_string(),
            path: path.clone(),
            guard_path: locks.guard_path("docs"),
            lock: Some(Flock::lock(File::open(&path).unwrap(), FlockArg::LockExclusiveNonblock).unwrap()),
        };

        let handle = locks.acquire("docs").unwrap();
        // the old holder finishing must not remove the new marker
        old_holder.release();
        assert!(path.exists());
        assert!(matches!(locks.acquire("docs"), Err(EngineError::AlreadyLocked { .. })));

        handle.release();
        assert!(!path.exists());
    }

    #[test]
    fn test_dead_pid_under_flock_is_respected() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        let path = locks.lock_path("docs");
        plant(
            &locks,
            "docs",
            &LockInfo {
                pid: i32::MAX,
                host: host_name(),
                created_at: Utc::now(),
                command: "backup-engine run".to_string(),
            },
        );
        let _holder = Flock::lock(File::open(&path).unwrap(), FlockArg::LockExclusiveNonblock).unwrap();
        assert!(matches!(locks.acquire("docs"), Err(EngineError::AlreadyLocked { .. })));
    }

    #[test]
    fn test_job_names_are_sanitized() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        assert_eq!(locks.lock_path("../etc/passwd"), dir.path().join("___etc_passwd.lock"));
    }
}
