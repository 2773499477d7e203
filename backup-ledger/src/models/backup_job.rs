use super::now_rfc3339;
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

// ── BackupKind ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Full,
    Differential,
    Incremental,
    DryRun,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Differential => "differential",
            BackupKind::Incremental => "incremental",
            BackupKind::DryRun => "dryrun",
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(BackupKind::Full),
            "differential" | "diff" => Ok(BackupKind::Differential),
            "incremental" | "inc" => Ok(BackupKind::Incremental),
            "dryrun" | "dry-run" | "dry_run" => Ok(BackupKind::DryRun),
            other => Err(LedgerError::InvalidValue(format!("unknown backup type '{}'", other))),
        }
    }
}

impl ToSql for BackupKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for BackupKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

// ── JobStatus ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    Skipped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "skipped" => Ok(JobStatus::Skipped),
            other => Err(LedgerError::InvalidValue(format!("unknown job status '{}'", other))),
        }
    }
}

impl ToSql for JobStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for JobStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

// ── BackupJob ──

#[derive(Debug, Clone, Serialize)]
pub struct BackupJob {
    pub id: i64,
    pub backup_set_id: Option<i64>,
    pub backup_type: BackupKind,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub status: JobStatus,
    pub encrypted: bool,
    pub synced: bool,
    pub runtime_seconds: Option<i64>,
    pub total_files: i64,
    pub total_size_bytes: i64,
    pub event_message: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub backup_set_id: Option<i64>,
    pub kind: BackupKind,
    pub encrypted: bool,
    pub event_message: Option<String>,
}

/// Terminal state written by [`finalize`].
#[derive(Debug, Clone)]
pub struct Finalization {
    pub status: JobStatus,
    pub total_files: i64,
    pub total_size_bytes: i64,
    pub event_message: Option<String>,
    pub error_message: Option<String>,
}

pub(crate) fn row_to_job(row: &Row) -> rusqlite::Result<BackupJob> {
    Ok(BackupJob {
        id: row.get("id")?,
        backup_set_id: row.get("backup_set_id")?,
        backup_type: row.get("backup_type")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        status: row.get("status")?,
        encrypted: row.get("encrypted")?,
        synced: row.get("synced")?,
        runtime_seconds: row.get("runtime_seconds")?,
        total_files: row.get("total_files")?,
        total_size_bytes: row.get("total_size_bytes")?,
        event_message: row.get("event_message")?,
        error_message: row.get("error_message")?,
    })
}

pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<BackupJob>> {
    let job = conn
        .query_row(
            "SELECT * FROM backup_jobs WHERE id = ?",
            params![id],
            row_to_job,
        )
        .optional()?;
    Ok(job)
}

/// Jobs of a set in the order they ran.
pub fn find_by_set(conn: &Connection, set_id: i64) -> Result<Vec<BackupJob>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM backup_jobs WHERE backup_set_id = ? ORDER BY started_at ASC, id ASC",
    )?;
    let rows = stmt.query_map(params![set_id], row_to_job)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn create(conn: &Connection, data: &NewJob) -> Result<BackupJob> {
    conn.execute(
        "INSERT INTO backup_jobs (backup_set_id, backup_type, started_at, status, encrypted, event_message)
         VALUES (?1, ?2, ?3, 'running', ?4, ?5)",
        params![
            data.backup_set_id,
            data.kind,
            now_rfc3339(),
            data.encrypted,
            data.event_message,
        ],
    )?;
    let id = conn.last_insert_rowid();
    find_by_id(conn, id)?
        .ok_or_else(|| LedgerError::NotFound(format!("backup job {} vanished after insert", id)))
}

pub fn attach_to_set(conn: &Connection, id: i64, set_id: i64) -> Result<()> {
    let changes = conn.execute(
        "UPDATE backup_jobs SET backup_set_id = ? WHERE id = ?",
        params![set_id, id],
    )?;
    if changes == 0 {
        return Err(LedgerError::NotFound(format!("backup job {} not found", id)));
    }
    Ok(())
}

/// Delete a job and its files.
pub fn delete(conn: &Connection, id: i64) -> Result<bool> {
    let changes = conn.execute("DELETE FROM backup_jobs WHERE id = ?", params![id])?;
    Ok(changes > 0)
}

pub fn update_kind(conn: &Connection, id: i64, kind: BackupKind) -> Result<()> {
    conn.execute(
        "UPDATE backup_jobs SET backup_type = ? WHERE id = ?",
        params![kind, id],
    )?;
    Ok(())
}

pub fn update_event(conn: &Connection, id: i64, message: &str) -> Result<()> {
    conn.execute(
        "UPDATE backup_jobs SET event_message = ? WHERE id = ?",
        params![message, id],
    )?;
    Ok(())
}

pub fn set_encrypted(conn: &Connection, id: i64, encrypted: bool) -> Result<()> {
    conn.execute(
        "UPDATE backup_jobs SET encrypted = ? WHERE id = ?",
        params![encrypted, id],
    )?;
    Ok(())
}

pub fn mark_synced(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("UPDATE backup_jobs SET synced = 1 WHERE id = ?", params![id])?;
    Ok(())
}

/// Move a running job to its terminal state.
///
/// `completed_at` and `runtime_seconds` are written by the same statement,
/// and only while the job is still `running`. Returns `false` when the job
/// had already been finalized (or does not exist).
pub fn finalize(conn: &Connection, id: i64, fin: &Finalization) -> Result<bool> {
    let started_at: Option<String> = conn
        .query_row(
            "SELECT started_at FROM backup_jobs WHERE id = ? AND status = 'running'",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(started_at) = started_at else {
        return Ok(false);
    };

    let now = Utc::now();
    let runtime = DateTime::parse_from_rfc3339(&started_at)
        .map(|started| (now - started.with_timezone(&Utc)).num_seconds().max(0))
        .unwrap_or(0);

    let changes = conn.execute(
        "UPDATE backup_jobs
         SET status = ?1, completed_at = ?2, runtime_seconds = ?3,
             total_files = ?4, total_size_bytes = ?5,
             event_message = COALESCE(?6, event_message), error_message = ?7
         WHERE id = ?8 AND status = 'running'",
        params![
            fin.status,
            now.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            runtime,
            fin.total_files,
            fin.total_size_bytes,
            fin.event_message,
            fin.error_message,
            id,
        ],
    )?;
    Ok(changes > 0)
}

/// Most recent completed full job of a job name.
pub fn last_completed_full(conn: &Connection, job_name: &str) -> Result<Option<BackupJob>> {
    let job = conn
        .query_row(
            "SELECT j.* FROM backup_jobs j
             JOIN backup_sets s ON s.id = j.backup_set_id
             WHERE s.job_name = ? AND j.backup_type = 'full' AND j.status = 'completed'
             ORDER BY j.started_at DESC, j.id DESC
             LIMIT 1",
            params![job_name],
            row_to_job,
        )
        .optional()?;
    Ok(job)
}
