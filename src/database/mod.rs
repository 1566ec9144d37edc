pub mod schema;

use crate::error::AppError;
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

/// Opens the database file, creating its directory and schema when needed
pub fn open_database(db_path: &Path) -> Result<Connection, AppError> {
    // Make sure the directory exists
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(db_path)?;
    configure(&conn)?;

    let outcome = schema::init_schema(&conn)?;
    log::info!("Opened local store at {} ({:?})", db_path.display(), outcome);

    Ok(conn)
}

/// In-memory database with the full schema, used when no file should be touched
pub fn open_in_memory() -> Result<Connection, AppError> {
    let conn = Connection::open_in_memory()?;
    configure(&conn)?;
    schema::init_schema(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> Result<(), AppError> {
    conn.busy_timeout(Duration::from_secs(2))?;
    // WAL keeps readers working while a drain cycle writes; in-memory databases answer "memory"
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.execute_batch("PRAGMA foreign_keys = ON")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_database_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("missions.db");

        let conn = open_database(&path).unwrap();
        assert!(path.exists());

        let count: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('reports', 'photos', 'sync_queue')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missions.db");

        {
            let conn = open_database(&path).unwrap();
            conn.execute(
                "INSERT INTO reports (id, client_name, created_at, updated_at) VALUES ('r1', 'x', 'a', 'a')",
                [],
            )
            .unwrap();
        }

        let conn = open_database(&path).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM reports", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
