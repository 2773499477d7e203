use super::backup_job::{self, row_to_job, BackupJob};
use super::backup_set::{self, row_to_set, BackupSet};
use crate::error::Result;
use rusqlite::{params, Connection};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct SetSummary {
    #[serde(flatten)]
    pub set: BackupSet,
    pub job_count: i64,
    pub total_files: i64,
    pub total_size_bytes: i64,
    pub last_job_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SetDetail {
    #[serde(flatten)]
    pub set: BackupSet,
    pub jobs: Vec<BackupJob>,
}

/// Latest job of one job name.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job_name: String,
    pub set_name: String,
    pub set_count: i64,
    pub last_job: BackupJob,
}

/// Sets of a job, newest first, with aggregates over their jobs.
pub fn list_sets(conn: &Connection, job_name: &str) -> Result<Vec<SetSummary>> {
    let mut stmt = conn.prepare(
        "SELECT s.*,
                COUNT(j.id) AS job_count,
                COALESCE(SUM(j.total_files), 0) AS agg_files,
                COALESCE(SUM(j.total_size_bytes), 0) AS agg_bytes,
                MAX(j.started_at) AS last_job_at
         FROM backup_sets s
         LEFT JOIN backup_jobs j ON j.backup_set_id = s.id
         WHERE s.job_name = ?
         GROUP BY s.id
         ORDER BY s.created_at DESC, s.id DESC",
    )?;
    let rows = stmt.query_map(params![job_name], |row| {
        Ok(SetSummary {
            set: row_to_set(row)?,
            job_count: row.get("job_count")?,
            total_files: row.get("agg_files")?,
            total_size_bytes: row.get("agg_bytes")?,
            last_job_at: row.get("last_job_at")?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn set_with_jobs(conn: &Connection, job_name: &str, set_name: &str) -> Result<Option<SetDetail>> {
    let Some(set) = backup_set::find_by_name(conn, job_name, set_name)? else {
        return Ok(None);
    };
    let jobs = backup_job::find_by_set(conn, set.id)?;
    Ok(Some(SetDetail { set, jobs }))
}

/// One row per job name: its most recent job and how many sets it keeps.
pub fn job_summaries(conn: &Connection) -> Result<Vec<JobSummary>> {
    let mut stmt = conn.prepare(
        "SELECT s.job_name AS summary_job_name,
                s.set_name AS summary_set_name,
                (SELECT COUNT(*) FROM backup_sets c WHERE c.job_name = s.job_name) AS set_count,
                j.*
         FROM backup_jobs j
         JOIN backup_sets s ON s.id = j.backup_set_id
         WHERE j.id = (
           SELECT j2.id FROM backup_jobs j2
           JOIN backup_sets s2 ON s2.id = j2.backup_set_id
           WHERE s2.job_name = s.job_name
           ORDER BY j2.started_at DESC, j2.id DESC
           LIMIT 1
         )
         ORDER BY s.job_name ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(JobSummary {
            job_name: row.get("summary_job_name")?,
            set_name: row.get("summary_set_name")?,
            set_count: row.get("set_count")?,
            last_job: row_to_job(row)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}
