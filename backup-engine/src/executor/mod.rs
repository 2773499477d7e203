//! Backup orchestration.
//!
//! [`Engine::run_backup`] drives one run of a job: it validates what can be
//! validated without side effects, takes the job lock, plans the backup
//! kind from the ledger, scans and archives changed files, records them,
//! then encrypts, syncs and rotates as configured. Only this module moves a
//! job record to a terminal status.

pub mod baseline;
pub mod detect;
pub mod plan;

pub use baseline::{Baseline, BaselineEntry};
pub use detect::{detect, ChangedFile};
pub use plan::{plan, Plan};

use crate::archive::{list_chunk, ChunkWriter};
use crate::config::{EngineSettings, JobConfig};
use crate::fs::{ExclusionMatcher, FileScanner};
use crate::lock::LockManager;
use crate::offload::encrypt::{encrypt_chunks, Cipher, GpgCipher, Passphrase, ENCRYPTED_EXTENSION};
use crate::offload::remote::{AwsCliStore, RemoteStore, RemoteTarget, SET_PREFIX};
use crate::restore::{restore, RestoreReport, RestoreRequest};
use crate::rotation::rotate;
use crate::utils::{host_name, sanitize_name, EngineError, Result};
use backup_ledger::{BackupKind, BackupSet, CreateSetData, Finalization, JobStatus, Ledger, NewFile, NewJob};
use chrono::Local;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Marker naming the set of the last full backup, next to the sets.
pub const LAST_FULL_MARKER: &str = "last_full.txt";

const WRITE_TEST_FILE: &str = ".backup-engine-write-test";

/// Why a run ended without archiving anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another process holds the job lock
    Locked,
    /// Nothing changed relative to the baseline
    NoChanges,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunResult {
    /// Directory of the set the run wrote into
    SetPath(PathBuf),
    Skipped(SkipReason),
    /// Completed without producing a set directory (dry runs)
    Nothing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub result: RunResult,
    pub job_id: Option<i64>,
    pub set_name: Option<String>,
}

/// Everything a single run needs, resolved before the lock is taken.
struct Run<'a> {
    job: &'a JobConfig,
    job_id: i64,
    /// The engine created `job_id` and may drop it if the run never
    /// reaches a set.
    owns_record: bool,
    job_dst: PathBuf,
    passphrase: Option<&'a Passphrase>,
    remote: Option<RemoteTarget<'a>>,
}

pub struct Engine {
    settings: EngineSettings,
    ledger: Ledger,
    locks: LockManager,
    host: String,
    cipher: Box<dyn Cipher>,
    remote: Option<Box<dyn RemoteStore>>,
}

impl Engine {
    /// Open the ledger named in `settings` and build an engine around it.
    pub fn new(settings: EngineSettings) -> Result<Self> {
        if let Some(parent) = settings.database.parent() {
            fs::create_dir_all(parent)?;
        }
        let ledger = Ledger::open(&settings.database)?;
        Ok(Self::with_ledger(settings, ledger))
    }

    pub fn with_ledger(settings: EngineSettings, ledger: Ledger) -> Self {
        let locks = LockManager::new(
            &settings.lock_dir,
            chrono::Duration::hours(settings.stale_lock_hours),
        );
        Self {
            settings,
            ledger,
            locks,
            host: host_name(),
            cipher: Box::new(GpgCipher::default()),
            remote: None,
        }
    }

    pub fn with_cipher(mut self, cipher: Box<dyn Cipher>) -> Self {
        self.cipher = cipher;
        self
    }

    /// Use `store` for every sync instead of the `aws` CLI.
    pub fn with_remote_store(mut self, store: Box<dyn RemoteStore>) -> Self {
        self.remote = Some(store);
        self
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// `<destination>/<host>/<job>`
    pub fn job_destination(&self, job: &JobConfig) -> PathBuf {
        job.destination
            .join(sanitize_name(&self.host))
            .join(sanitize_name(&job.job_name))
    }

    /// Restore `paths` (the whole set when empty) from set `set_name` of
    /// `job` into `target`, or into the job's source when no target is
    /// given. The job lock is held throughout.
    pub fn restore(
        &self,
        job: &JobConfig,
        set_name: &str,
        paths: &[String],
        target: Option<&Path>,
    ) -> Result<RestoreReport> {
        let span = tracing::info_span!("restore", job = %job.job_name, set = %set_name);
        let _enter = span.enter();

        let _lock = self.locks.acquire(&job.job_name)?;
        let set_dir = self
            .job_destination(job)
            .join(format!("{}{}", SET_PREFIX, set_name));
        let passphrase = Passphrase::from_env(&job.encryption.passphrase_env).ok();

        restore(
            &self.ledger,
            self.cipher.as_ref(),
            &RestoreRequest {
                job_name: &job.job_name,
                set_name,
                set_dir: &set_dir,
                target: target.unwrap_or(job.source.as_path()),
                paths,
                passphrase: passphrase.as_ref(),
            },
        )
    }

    /// Run one backup of `job`.
    ///
    /// `encrypt` and `sync` add to what the job configuration enables.
    /// `job_id` names a pending job record created by the caller; without
    /// it a record is created once the lock is held. A held lock is not an
    /// error: the run reports [`SkipReason::Locked`].
    pub fn run_backup(
        &self,
        job: &JobConfig,
        kind: BackupKind,
        encrypt: bool,
        sync: bool,
        job_id: Option<i64>,
    ) -> Result<RunOutcome> {
        let span = tracing::info_span!("backup", job = %job.job_name, kind = %kind);
        let _enter = span.enter();

        let encrypt = encrypt || job.encryption.enabled;
        let sync = sync || job.aws.enabled;
        tracing::info!(encrypt, sync, source = %job.source.display(), "starting backup");

        if let Some(id) = job_id {
            if self.ledger.find_job(id)?.is_none() {
                return Err(EngineError::NotFound(format!("backup job record {}", id)));
            }
        }

        let (passphrase, aws_store) = match self.preflight(job, encrypt, sync) {
            Ok(checked) => checked,
            Err(e) => {
                tracing::error!(error = %e, "backup rejected before start");
                self.finish(job_id, JobStatus::Failed, None, Some(e.to_string()));
                return Err(e);
            }
        };
        let store: Option<&dyn RemoteStore> = match (&self.remote, &aws_store) {
            _ if !sync => None,
            (Some(store), _) => Some(&**store),
            (None, Some(store)) => Some(store as &dyn RemoteStore),
            (None, None) => None,
        };

        let lock = match self.locks.acquire(&job.job_name) {
            Ok(lock) => lock,
            Err(EngineError::AlreadyLocked { pid, host, .. }) => {
                tracing::warn!(pid, host = %host, "backup already running, skipping");
                self.finish(
                    job_id,
                    JobStatus::Skipped,
                    Some(format!("Backup already running for job '{}'", job.job_name)),
                    None,
                );
                return Ok(RunOutcome {
                    result: RunResult::Skipped(SkipReason::Locked),
                    job_id,
                    set_name: None,
                });
            }
            Err(e) => {
                self.finish(job_id, JobStatus::Failed, None, Some(e.to_string()));
                return Err(e);
            }
        };

        let owns_record = job_id.is_none();
        let job_id = match job_id {
            Some(id) => id,
            None => {
                self.ledger
                    .create_job(&NewJob {
                        backup_set_id: None,
                        kind,
                        encrypted: encrypt,
                        event_message: Some(format!("Starting {} backup", kind)),
                    })?
                    .id
            }
        };

        let run = Run {
            job,
            job_id,
            owns_record,
            job_dst: self.job_destination(job),
            passphrase: passphrase.as_ref(),
            remote: store.map(|s| RemoteTarget::new(s, &self.host, &job.job_name)),
        };

        let outcome = self.execute(&run, kind);
        if let Err(e) = &outcome {
            tracing::error!(job_id, error = %e, "backup failed");
            if owns_record && self.is_unowned(job_id) {
                self.discard(job_id);
            } else {
                self.finish(
                    Some(job_id),
                    JobStatus::Failed,
                    Some(format!("Backup failed: {}", e)),
                    Some(e.to_string()),
                );
            }
        }
        lock.release();
        outcome
    }

    /// Checks that need no lock: source readable, passphrase present,
    /// remote configured.
    fn preflight(&self, job: &JobConfig, encrypt: bool, sync: bool) -> Result<(Option<Passphrase>, Option<AwsCliStore>)> {
        fs::read_dir(&job.source)
            .map_err(|e| EngineError::SourceUnreadable(format!("{}: {}", job.source.display(), e)))?;

        let passphrase = if encrypt {
            Some(Passphrase::from_env(&job.encryption.passphrase_env)?)
        } else {
            None
        };

        let aws_store = if sync && self.remote.is_none() {
            Some(AwsCliStore::from_config(&job.aws)?)
        } else {
            None
        };
        Ok((passphrase, aws_store))
    }

    fn execute(&self, run: &Run<'_>, requested: BackupKind) -> Result<RunOutcome> {
        let (kind, set, baseline) = match plan(&self.ledger, &run.job.job_name, requested)? {
            Plan::Proceed { kind, set, baseline } => {
                if let Some(set) = &set {
                    self.ledger.attach_job(run.job_id, set.id)?;
                }
                (kind, set, baseline)
            }
            Plan::Fallback(kind) => {
                tracing::info!(requested = %requested, running = %kind, "no completed full backup, running full instead");
                self.ledger.update_job_kind(run.job_id, kind)?;
                self.event(
                    run.job_id,
                    &format!("No completed full backup found; performing {} instead of {}", kind, requested),
                );
                (kind, None, Baseline::default())
            }
        };

        if kind == BackupKind::DryRun {
            return self.dry_run(run);
        }

        self.event(run.job_id, "Scanning source");
        let matcher = ExclusionMatcher::new(&run.job.source, &run.job.exclude, &self.settings.builtin_excludes)?;
        let scanner = FileScanner::new(&run.job.source, &matcher);
        let changed = detect(scanner.scan()?, &run.job.source, &baseline);

        if changed.is_empty() {
            return self.skip_unchanged(run, kind, set.as_ref());
        }
        tracing::info!(files = changed.len(), baseline = baseline.len(), "changes detected");

        fs::create_dir_all(&run.job_dst)?;
        let set_name = match &set {
            Some(set) => set.set_name.clone(),
            None => self.unique_set_name(&run.job.job_name, &run.job_dst)?,
        };
        let set_dir = run.job_dst.join(format!("{}{}", SET_PREFIX, set_name));
        fs::create_dir_all(&set_dir)?;

        self.event(run.job_id, &format!("Archiving {} files", changed.len()));
        let paths: Vec<PathBuf> = changed.iter().map(|c| c.path.clone()).collect();
        let chunks = ChunkWriter::new().pack(
            &paths,
            &run.job.source,
            &set_dir,
            run.job.max_chunk_bytes(),
            kind.as_str(),
        )?;

        if chunks.is_empty() {
            // every changed file vanished between scan and pack
            if set.is_none() {
                fs::remove_dir_all(&set_dir)?;
            }
            return self.skip_unchanged(run, kind, set.as_ref());
        }

        let set = match set {
            Some(set) => set,
            None => {
                let set = self.ledger.create_set(&CreateSetData {
                    job_name: run.job.job_name.clone(),
                    set_name: set_name.clone(),
                    config_snapshot: Some(serde_json::to_string(run.job)?),
                    hostname: Some(self.host.clone()),
                    source_path: Some(run.job.source.display().to_string()),
                })?;
                self.ledger.attach_job(run.job_id, set.id)?;
                set
            }
        };

        let records = chunk_records(&chunks, &changed, run.passphrase.is_some())?;
        let total_files = records.len();
        let total_bytes: u64 = records.iter().map(|r| r.size_bytes).sum();
        self.ledger.record_files(run.job_id, &records)?;
        self.ledger.touch_set(set.id)?;
        tracing::info!(chunks = chunks.len(), files = total_files, bytes = total_bytes, set = %set_name, "chunks recorded");

        if kind == BackupKind::Full {
            fs::write(run.job_dst.join(LAST_FULL_MARKER), &set_name)?;
        }

        if let Some(passphrase) = run.passphrase {
            self.event(run.job_id, &format!("Encrypting {} chunks", chunks.len()));
            encrypt_chunks(&chunks, passphrase, self.cipher.as_ref())?;
            self.ledger.set_job_encrypted(run.job_id, true)?;
        }

        if let Some(target) = &run.remote {
            self.event(run.job_id, "Syncing to remote storage");
            target.sync_set(&set_dir, &set_name)?;
            self.ledger.mark_job_synced(run.job_id)?;
        }

        let report = rotate(
            &self.ledger,
            &run.job_dst,
            &run.job.job_name,
            run.job.keep_sets,
            run.remote.as_ref(),
        );
        if !report.is_clean() {
            tracing::warn!(failures = report.failures, "rotation finished with errors");
        }

        self.ledger.finalize_job(
            run.job_id,
            &Finalization {
                status: JobStatus::Completed,
                total_files: total_files as i64,
                total_size_bytes: total_bytes as i64,
                event_message: Some(format!(
                    "{} backup completed: {} files in {} chunks",
                    kind,
                    total_files,
                    chunks.len()
                )),
                error_message: None,
            },
        )?;
        tracing::info!(set = %set_name, path = %set_dir.display(), "backup completed");

        Ok(RunOutcome {
            result: RunResult::SetPath(set_dir),
            job_id: Some(run.job_id),
            set_name: Some(set_name),
        })
    }

    /// Record what a full backup would archive without writing any archive.
    fn dry_run(&self, run: &Run<'_>) -> Result<RunOutcome> {
        check_destination_writable(&run.job.destination)?;
        if let Some(target) = &run.remote {
            self.event(run.job_id, "Checking remote bucket");
            target.check_accessible()?;
        }

        self.event(run.job_id, "Scanning source");
        let matcher = ExclusionMatcher::new(&run.job.source, &run.job.exclude, &self.settings.builtin_excludes)?;
        let scanner = FileScanner::new(&run.job.source, &matcher);
        let files = detect(scanner.scan()?, &run.job.source, &Baseline::default());

        if files.is_empty() {
            return self.skip_unchanged(run, BackupKind::DryRun, None);
        }

        let set_name = self.unique_set_name(&run.job.job_name, &run.job_dst)?;
        let set = self.ledger.create_set(&CreateSetData {
            job_name: run.job.job_name.clone(),
            set_name: set_name.clone(),
            config_snapshot: Some(serde_json::to_string(run.job)?),
            hostname: Some(self.host.clone()),
            source_path: Some(run.job.source.display().to_string()),
        })?;
        self.ledger.attach_job(run.job_id, set.id)?;

        let chunk_name = format!("dryrun_{}.tar.zst", set_name);
        let records: Vec<NewFile> = files
            .iter()
            .map(|f| NewFile {
                chunk_name: chunk_name.clone(),
                path: f.relative_path.clone(),
                mtime: f.mtime,
                size_bytes: f.size,
                is_new: true,
                is_modified: false,
            })
            .collect();
        let total_bytes: u64 = records.iter().map(|r| r.size_bytes).sum();
        self.ledger.record_files(run.job_id, &records)?;
        self.ledger.touch_set(set.id)?;

        tracing::info!(
            files = records.len(),
            bytes = total_bytes,
            would_create = %run.job_dst.join(format!("{}{}", SET_PREFIX, set_name)).display(),
            "dry run recorded"
        );
        self.ledger.finalize_job(
            run.job_id,
            &Finalization {
                status: JobStatus::Completed,
                total_files: records.len() as i64,
                total_size_bytes: total_bytes as i64,
                event_message: Some(format!("Dry run completed: {} files", records.len())),
                error_message: None,
            },
        )?;

        Ok(RunOutcome {
            result: RunResult::Nothing,
            job_id: Some(run.job_id),
            set_name: Some(set_name),
        })
    }

    /// Finish a run that found nothing to archive. The set, if any, keeps
    /// its `updated_at`; without one an engine-created record is dropped
    /// rather than left without an owner.
    fn skip_unchanged(&self, run: &Run<'_>, kind: BackupKind, set: Option<&BackupSet>) -> Result<RunOutcome> {
        let message = match kind {
            BackupKind::Differential => "No files changed since the last full backup",
            BackupKind::Incremental => "No files changed since the last backup",
            _ => "No files found to back up",
        };
        tracing::info!("{}", message);
        if set.is_none() && run.owns_record {
            self.ledger.delete_job(run.job_id)?;
            return Ok(RunOutcome {
                result: RunResult::Skipped(SkipReason::NoChanges),
                job_id: None,
                set_name: None,
            });
        }
        self.ledger.finalize_job(
            run.job_id,
            &Finalization {
                status: JobStatus::Skipped,
                total_files: 0,
                total_size_bytes: 0,
                event_message: Some(message.to_string()),
                error_message: None,
            },
        )?;
        Ok(RunOutcome {
            result: RunResult::Skipped(SkipReason::NoChanges),
            job_id: Some(run.job_id),
            set_name: set.map(|s| s.set_name.clone()),
        })
    }

    /// `YYYYMMDD_HHMMSS`, with `_<n>` appended while the name is taken in
    /// the ledger or on disk.
    fn unique_set_name(&self, job_name: &str, job_dst: &Path) -> Result<String> {
        let base = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let mut candidate = base.clone();
        let mut n = 1;
        while self.ledger.set_name_exists(job_name, &candidate)?
            || job_dst.join(format!("{}{}", SET_PREFIX, candidate)).exists()
        {
            candidate = format!("{}_{}", base, n);
            n += 1;
        }
        Ok(candidate)
    }

    fn is_unowned(&self, job_id: i64) -> bool {
        matches!(self.ledger.find_job(job_id), Ok(Some(job)) if job.backup_set_id.is_none())
    }

    /// Drop an engine-created record that never got a set.
    fn discard(&self, job_id: i64) {
        match self.ledger.delete_job(job_id) {
            Ok(_) => tracing::debug!(job_id, "dropped job record without a set"),
            Err(e) => tracing::warn!(job_id, error = %e, "failed to drop job record"),
        }
    }

    fn event(&self, job_id: i64, message: &str) {
        tracing::debug!(job_id, "{}", message);
        if let Err(e) = self.ledger.update_job_event(job_id, message) {
            tracing::warn!(job_id, error = %e, "failed to record job progress");
        }
    }

    /// Best-effort finalization of an optional job record.
    fn finish(&self, job_id: Option<i64>, status: JobStatus, event: Option<String>, error: Option<String>) {
        let Some(job_id) = job_id else {
            return;
        };
        let fin = Finalization {
            status,
            total_files: 0,
            total_size_bytes: 0,
            event_message: event.or_else(|| error.clone()),
            error_message: error,
        };
        match self.ledger.finalize_job(job_id, &fin) {
            Ok(true) => {}
            Ok(false) => tracing::debug!(job_id, "job record already finalized"),
            Err(e) => tracing::warn!(job_id, error = %e, "failed to finalize job record"),
        }
    }
}

/// Ledger rows for the members of `chunks`. Scan-time metadata wins over
/// the tar header, whose mtime has whole-second resolution.
fn chunk_records(chunks: &[PathBuf], changed: &[ChangedFile], encrypted: bool) -> Result<Vec<NewFile>> {
    let by_path: HashMap<&str, &ChangedFile> = changed.iter().map(|c| (c.relative_path.as_str(), c)).collect();

    let mut records = Vec::new();
    for chunk in chunks {
        let mut chunk_name = chunk
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| EngineError::Archive(format!("chunk without a file name: {}", chunk.display())))?;
        if encrypted {
            chunk_name = format!("{}.{}", chunk_name, ENCRYPTED_EXTENSION);
        }

        for entry in list_chunk(chunk)? {
            let scanned = by_path.get(entry.path.as_str());
            records.push(NewFile {
                chunk_name: chunk_name.clone(),
                mtime: scanned.map(|c| c.mtime).unwrap_or(entry.mtime),
                is_new: scanned.map(|c| c.is_new).unwrap_or(true),
                is_modified: scanned.map(|c| c.is_modified).unwrap_or(false),
                size_bytes: entry.size,
                path: entry.path,
            });
        }
    }
    Ok(records)
}

fn check_destination_writable(destination: &Path) -> Result<()> {
    if !destination.is_dir() {
        return Err(EngineError::Config(format!(
            "destination does not exist: {}",
            destination.display()
        )));
    }
    let test_file = destination.join(WRITE_TEST_FILE);
    fs::write(&test_file, b"")
        .map_err(|e| EngineError::Config(format!("destination is not writable: {}: {}", destination.display(), e)))?;
    fs::remove_file(&test_file)?;
    Ok(())
}
