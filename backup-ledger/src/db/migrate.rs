use crate::db::connection::DbPool;
use crate::error::Result;
use rusqlite::Connection;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS backup_sets (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  job_name TEXT NOT NULL,
  set_name TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  config_snapshot TEXT,
  is_active INTEGER NOT NULL DEFAULT 1,
  UNIQUE(job_name, set_name)
);

CREATE TABLE IF NOT EXISTS backup_jobs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  backup_set_id INTEGER REFERENCES backup_sets(id) ON DELETE CASCADE,
  backup_type TEXT NOT NULL CHECK(backup_type IN ('full','differential','incremental','dryrun')),
  started_at TEXT NOT NULL,
  completed_at TEXT,
  status TEXT NOT NULL DEFAULT 'running' CHECK(status IN ('running','completed','failed','skipped')),
  encrypted INTEGER NOT NULL DEFAULT 0,
  synced INTEGER NOT NULL DEFAULT 0,
  runtime_seconds INTEGER,
  total_files INTEGER NOT NULL DEFAULT 0,
  total_size_bytes INTEGER NOT NULL DEFAULT 0,
  event_message TEXT,
  error_message TEXT
);

CREATE TABLE IF NOT EXISTS backup_files (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  backup_job_id INTEGER NOT NULL REFERENCES backup_jobs(id) ON DELETE CASCADE,
  chunk_name TEXT NOT NULL,
  path TEXT NOT NULL,
  mtime REAL NOT NULL,
  size_bytes INTEGER NOT NULL,
  is_new INTEGER NOT NULL DEFAULT 0,
  is_modified INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_backup_sets_job_name ON backup_sets(job_name);
CREATE INDEX IF NOT EXISTS idx_backup_jobs_set_id ON backup_jobs(backup_set_id);
CREATE INDEX IF NOT EXISTS idx_backup_jobs_type ON backup_jobs(backup_type);
CREATE INDEX IF NOT EXISTS idx_backup_jobs_started_at ON backup_jobs(started_at);
CREATE INDEX IF NOT EXISTS idx_backup_files_job_id ON backup_files(backup_job_id);
CREATE INDEX IF NOT EXISTS idx_backup_files_path ON backup_files(path);
"#;

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns.iter().any(|c| c == column))
}

pub fn migrate(pool: &DbPool) -> Result<()> {
    tracing::debug!("[DB] Starting ledger migration...");

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    // Columns added after the first schema revision
    if !has_column(&conn, "backup_sets", "hostname")? {
        conn.execute_batch("ALTER TABLE backup_sets ADD COLUMN hostname TEXT")?;
    }
    if !has_column(&conn, "backup_sets", "source_path")? {
        conn.execute_batch("ALTER TABLE backup_sets ADD COLUMN source_path TEXT")?;
    }

    tracing::debug!("[DB] Ledger migration completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::create_pool;
    use tempfile::TempDir;

    #[test]
    fn test_migrate_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let pool = create_pool(&dir.path().join("ledger.db")).unwrap();

        migrate(&pool).unwrap();
        migrate(&pool).unwrap();

        let conn = pool.get().unwrap();
        assert!(has_column(&conn, "backup_sets", "hostname").unwrap());
        assert!(has_column(&conn, "backup_sets", "source_path").unwrap());
        assert!(!has_column(&conn, "backup_sets", "nope").unwrap());
    }

    #[test]
    fn test_foreign_keys_enabled_on_every_connection() {
        let dir = TempDir::new().unwrap();
        let pool = create_pool(&dir.path().join("ledger.db")).unwrap();
        migrate(&pool).unwrap();

        let conns: Vec<_> = (0..3).map(|_| pool.get().unwrap()).collect();
        for conn in &conns {
            let fk: i64 = conn
                .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
                .unwrap();
            assert_eq!(fk, 1);
        }
    }
}
