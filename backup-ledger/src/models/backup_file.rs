use crate::error::Result;
use rusqlite::{params, Connection, Row};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct BackupFile {
    pub id: i64,
    pub backup_job_id: i64,
    pub chunk_name: String,
    pub path: String,
    pub mtime: f64,
    pub size_bytes: i64,
    pub is_new: bool,
    pub is_modified: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewFile {
    pub chunk_name: String,
    pub path: String, // relative, forward slashes
    pub mtime: f64,
    pub size_bytes: u64,
    pub is_new: bool,
    pub is_modified: bool,
}

/// A search result, with enough context to locate the archive holding it.
#[derive(Debug, Clone, Serialize)]
pub struct FileHit {
    pub job_name: String,
    pub set_name: String,
    pub backup_type: String,
    pub started_at: String,
    pub chunk_name: String,
    pub path: String,
    pub size_bytes: i64,
    pub mtime: f64,
}

fn row_to_file(row: &Row) -> rusqlite::Result<BackupFile> {
    Ok(BackupFile {
        id: row.get("id")?,
        backup_job_id: row.get("backup_job_id")?,
        chunk_name: row.get("chunk_name")?,
        path: row.get("path")?,
        mtime: row.get("mtime")?,
        size_bytes: row.get("size_bytes")?,
        is_new: row.get("is_new")?,
        is_modified: row.get("is_modified")?,
    })
}

/// Append files to a job inside a single transaction.
pub fn insert_many(conn: &mut Connection, job_id: i64, files: &[NewFile]) -> Result<usize> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO backup_files (backup_job_id, chunk_name, path, mtime, size_bytes, is_new, is_modified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        for file in files {
            stmt.execute(params![
                job_id,
                file.chunk_name,
                file.path,
                file.mtime,
                i64::try_from(file.size_bytes).unwrap_or(i64::MAX),
                file.is_new,
                file.is_modified,
            ])?;
        }
    }
    tx.commit()?;
    Ok(files.len())
}

pub fn find_by_job(conn: &Connection, job_id: i64) -> Result<Vec<BackupFile>> {
    let mut stmt = conn.prepare("SELECT * FROM backup_files WHERE backup_job_id = ? ORDER BY id ASC")?;
    let rows = stmt.query_map(params![job_id], row_to_file)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Files of every completed job in a set, oldest job first, so that folding
/// them into a map leaves the latest occurrence of each path.
pub fn find_completed_in_set(conn: &Connection, set_id: i64) -> Result<Vec<BackupFile>> {
    let mut stmt = conn.prepare(
        "SELECT f.* FROM backup_files f
         JOIN backup_jobs j ON j.id = f.backup_job_id
         WHERE j.backup_set_id = ? AND j.status = 'completed'
         ORDER BY j.started_at ASC, j.id ASC, f.id ASC",
    )?;
    let rows = stmt.query_map(params![set_id], row_to_file)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Substring search over recorded paths, newest jobs first.
pub fn search(conn: &Connection, query: &str, job_name: Option<&str>, limit: i64) -> Result<Vec<FileHit>> {
    let pattern = format!("%{}%", escape_like(query));
    let mut stmt = conn.prepare(
        "SELECT s.job_name, s.set_name, j.backup_type, j.started_at,
                f.chunk_name, f.path, f.size_bytes, f.mtime
         FROM backup_files f
         JOIN backup_jobs j ON j.id = f.backup_job_id
         JOIN backup_sets s ON s.id = j.backup_set_id
         WHERE f.path LIKE ?1 ESCAPE '\\' AND (?2 IS NULL OR s.job_name = ?2)
         ORDER BY j.started_at DESC, f.path ASC
         LIMIT ?3",
    )?;
    let rows = stmt.query_map(params![pattern, job_name, limit], |row| {
        Ok(FileHit {
            job_name: row.get(0)?,
            set_name: row.get(1)?,
            backup_type: row.get(2)?,
            started_at: row.get(3)?,
            chunk_name: row.get(4)?,
            path: row.get(5)?,
            size_bytes: row.get(6)?,
            mtime: row.get(7)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Make `query` match literally inside a `LIKE ... ESCAPE '\'` pattern.
fn escape_like(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len());
    for c in query.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
