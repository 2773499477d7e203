use crate::db::connection::{create_pool, DbPool};
use crate::db::migrate::migrate;
use crate::error::Result;
use crate::models::backup_file::{self, BackupFile, FileHit, NewFile};
use crate::models::backup_job::{self, BackupJob, BackupKind, Finalization, NewJob};
use crate::models::backup_set::{self, BackupSet, CreateSetData};
use crate::models::summary::{self, JobSummary, SetDetail, SetSummary};
use std::path::Path;

/// Handle on the ledger database. Cheap to clone.
#[derive(Clone)]
pub struct Ledger {
    pool: DbPool,
}

impl Ledger {
    /// Open (creating if needed) and migrate the ledger at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self> {
        let pool = create_pool(db_path)?;
        migrate(&pool)?;
        tracing::debug!(path = %db_path.display(), "ledger opened");
        Ok(Self { pool })
    }

    // ── sets ──

    pub fn create_set(&self, data: &CreateSetData) -> Result<BackupSet> {
        let conn = self.pool.get()?;
        backup_set::create(&conn, data)
    }

    pub fn find_set(&self, id: i64) -> Result<Option<BackupSet>> {
        let conn = self.pool.get()?;
        backup_set::find_by_id(&conn, id)
    }

    pub fn find_set_by_name(&self, job_name: &str, set_name: &str) -> Result<Option<BackupSet>> {
        let conn = self.pool.get()?;
        backup_set::find_by_name(&conn, job_name, set_name)
    }

    pub fn set_name_exists(&self, job_name: &str, set_name: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        backup_set::name_exists(&conn, job_name, set_name)
    }

    /// Sets of a job, newest first.
    pub fn sets_for_job(&self, job_name: &str) -> Result<Vec<BackupSet>> {
        let conn = self.pool.get()?;
        backup_set::find_by_job(&conn, job_name)
    }

    pub fn touch_set(&self, id: i64) -> Result<()> {
        let conn = self.pool.get()?;
        backup_set::touch(&conn, id)
    }

    pub fn delete_set(&self, id: i64) -> Result<bool> {
        let conn = self.pool.get()?;
        backup_set::delete(&conn, id)
    }

    pub fn latest_set_with_completed_full(&self, job_name: &str) -> Result<Option<BackupSet>> {
        let conn = self.pool.get()?;
        backup_set::latest_with_completed_full(&conn, job_name)
    }

    // ── jobs ──

    pub fn create_job(&self, data: &NewJob) -> Result<BackupJob> {
        let conn = self.pool.get()?;
        backup_job::create(&conn, data)
    }

    pub fn find_job(&self, id: i64) -> Result<Option<BackupJob>> {
        let conn = self.pool.get()?;
        backup_job::find_by_id(&conn, id)
    }

    pub fn jobs_for_set(&self, set_id: i64) -> Result<Vec<BackupJob>> {
        let conn = self.pool.get()?;
        backup_job::find_by_set(&conn, set_id)
    }

    pub fn attach_job(&self, job_id: i64, set_id: i64) -> Result<()> {
        let conn = self.pool.get()?;
        backup_job::attach_to_set(&conn, job_id, set_id)
    }

    /// Drop a job that never produced anything worth keeping.
    pub fn delete_job(&self, job_id: i64) -> Result<bool> {
        let conn = self.pool.get()?;
        backup_job::delete(&conn, job_id)
    }

    pub fn update_job_kind(&self, job_id: i64, kind: BackupKind) -> Result<()> {
        let conn = self.pool.get()?;
        backup_job::update_kind(&conn, job_id, kind)
    }

    pub fn update_job_event(&self, job_id: i64, message: &str) -> Result<()> {
        let conn = self.pool.get()?;
        backup_job::update_event(&conn, job_id, message)
    }

    pub fn set_job_encrypted(&self, job_id: i64, encrypted: bool) -> Result<()> {
        let conn = self.pool.get()?;
        backup_job::set_encrypted(&conn, job_id, encrypted)
    }

    pub fn mark_job_synced(&self, job_id: i64) -> Result<()> {
        let conn = self.pool.get()?;
        backup_job::mark_synced(&conn, job_id)
    }

    /// See [`backup_job::finalize`]: `false` means the job was not running.
    pub fn finalize_job(&self, job_id: i64, fin: &Finalization) -> Result<bool> {
        let conn = self.pool.get()?;
        backup_job::finalize(&conn, job_id, fin)
    }

    pub fn last_completed_full(&self, job_name: &str) -> Result<Option<BackupJob>> {
        let conn = self.pool.get()?;
        backup_job::last_completed_full(&conn, job_name)
    }

    // ── files ──

    pub fn record_files(&self, job_id: i64, files: &[NewFile]) -> Result<usize> {
        let mut conn = self.pool.get()?;
        backup_file::insert_many(&mut conn, job_id, files)
    }

    pub fn files_for_job(&self, job_id: i64) -> Result<Vec<BackupFile>> {
        let conn = self.pool.get()?;
        backup_file::find_by_job(&conn, job_id)
    }

    pub fn completed_files_in_set(&self, set_id: i64) -> Result<Vec<BackupFile>> {
        let conn = self.pool.get()?;
        backup_file::find_completed_in_set(&conn, set_id)
    }

    pub fn search_files(&self, query: &str, job_name: Option<&str>, limit: i64) -> Result<Vec<FileHit>> {
        let conn = self.pool.get()?;
        backup_file::search(&conn, query, job_name, limit)
    }

    // ── summaries ──

    pub fn list_sets(&self, job_name: &str) -> Result<Vec<SetSummary>> {
        let conn = self.pool.get()?;
        summary::list_sets(&conn, job_name)
    }

    pub fn set_with_jobs(&self, job_name: &str, set_name: &str) -> Result<Option<SetDetail>> {
        let conn = self.pool.get()?;
        summary::set_with_jobs(&conn, job_name, set_name)
    }

    pub fn job_summaries(&self) -> Result<Vec<JobSummary>> {
        let conn = self.pool.get()?;
        summary::job_summaries(&conn)
    }
}
