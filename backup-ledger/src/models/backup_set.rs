use super::now_rfc3339;
use crate::error::{LedgerError, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct BackupSet {
    pub id: i64,
    pub job_name: String,
    pub set_name: String,
    pub created_at: String,
    pub updated_at: String,
    pub config_snapshot: Option<String>, // resolved job config as JSON
    pub is_active: bool,
    pub hostname: Option<String>,
    pub source_path: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateSetData {
    pub job_name: String,
    pub set_name: String,
    pub config_snapshot: Option<String>,
    pub hostname: Option<String>,
    pub source_path: Option<String>,
}

pub(crate) fn row_to_set(row: &Row) -> rusqlite::Result<BackupSet> {
    Ok(BackupSet {
        id: row.get("id")?,
        job_name: row.get("job_name")?,
        set_name: row.get("set_name")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        config_snapshot: row.get("config_snapshot")?,
        is_active: row.get("is_active")?,
        hostname: row.get("hostname")?,
        source_path: row.get("source_path")?,
    })
}

pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<BackupSet>> {
    let set = conn
        .query_row(
            "SELECT * FROM backup_sets WHERE id = ?",
            params![id],
            row_to_set,
        )
        .optional()?;
    Ok(set)
}

pub fn find_by_name(conn: &Connection, job_name: &str, set_name: &str) -> Result<Option<BackupSet>> {
    let set = conn
        .query_row(
            "SELECT * FROM backup_sets WHERE job_name = ? AND set_name = ?",
            params![job_name, set_name],
            row_to_set,
        )
        .optional()?;
    Ok(set)
}

/// All sets of a job, newest first.
pub fn find_by_job(conn: &Connection, job_name: &str) -> Result<Vec<BackupSet>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM backup_sets WHERE job_name = ? ORDER BY created_at DESC, id DESC",
    )?;
    let rows = stmt.query_map(params![job_name], row_to_set)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn name_exists(conn: &Connection, job_name: &str, set_name: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM backup_sets WHERE job_name = ? AND set_name = ?",
        params![job_name, set_name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn create(conn: &Connection, data: &CreateSetData) -> Result<BackupSet> {
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO backup_sets (job_name, set_name, created_at, updated_at, config_snapshot, hostname, source_path)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            data.job_name,
            data.set_name,
            now,
            now,
            data.config_snapshot,
            data.hostname,
            data.source_path,
        ],
    )?;
    let id = conn.last_insert_rowid();
    find_by_id(conn, id)?
        .ok_or_else(|| LedgerError::NotFound(format!("backup set {} vanished after insert", id)))
}

/// Record activity on a set (a job appended files to it).
pub fn touch(conn: &Connection, id: i64) -> Result<()> {
    conn.execute(
        "UPDATE backup_sets SET updated_at = ? WHERE id = ?",
        params![now_rfc3339(), id],
    )?;
    Ok(())
}

/// Delete a set; jobs and files go with it through the cascade.
pub fn delete(conn: &Connection, id: i64) -> Result<bool> {
    let changes = conn.execute("DELETE FROM backup_sets WHERE id = ?", params![id])?;
    Ok(changes > 0)
}

/// Newest set of a job that holds at least one completed full job.
pub fn latest_with_completed_full(conn: &Connection, job_name: &str) -> Result<Option<BackupSet>> {
    let set = conn
        .query_row(
            "SELECT s.* FROM backup_sets s
             WHERE s.job_name = ?
               AND EXISTS (
                 SELECT 1 FROM backup_jobs j
                 WHERE j.backup_set_id = s.id
                   AND j.backup_type = 'full'
                   AND j.status = 'completed'
               )
             ORDER BY s.created_at DESC, s.id DESC
             LIMIT 1",
            params![job_name],
            row_to_set,
        )
        .optional()?;
    Ok(set)
}
