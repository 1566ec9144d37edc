use rusqlite::{Connection, Result};

/// Version of the local schema. Any other stored version is dropped and recreated.
pub const SCHEMA_VERSION: i32 = 1;

/// Outcome of schema initialization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaInit {
    /// Empty database, schema created
    Created,
    /// Stored schema matched
    Current,
    /// Stored schema had another version and was discarded
    Recreated { from_version: i32 },
}

/// Initialize the local schema, performing the destructive migration on mismatch
pub fn init_schema(conn: &Connection) -> Result<SchemaInit> {
    // Enable foreign keys
    conn.execute_batch("PRAGMA foreign_keys = ON")?;

    let has_version_table = table_exists(conn, "schema_version")?;
    let current_version: i32 = if has_version_table {
        conn.query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0)
    } else {
        0
    };

    let has_data_tables = table_exists(conn, "reports")?
        || table_exists(conn, "photos")?
        || table_exists(conn, "sync_queue")?;

    let outcome = if current_version == SCHEMA_VERSION {
        SchemaInit::Current
    } else if current_version == 0 && !has_data_tables {
        SchemaInit::Created
    } else {
        log::warn!(
            "Local schema version {} does not match {}, discarding local data",
            current_version,
            SCHEMA_VERSION
        );
        drop_all_tables(conn)?;
        SchemaInit::Recreated {
            from_version: current_version,
        }
    };

    // Idempotent, also repairs a partially created schema
    create_schema(conn)?;

    if outcome != SchemaInit::Current {
        conn.execute("DELETE FROM schema_version", [])?;
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [SCHEMA_VERSION],
        )?;
    }

    // Entries dispatched by a process that died mid-drain go back to the queue
    let reset = conn.execute(
        "UPDATE sync_queue SET state = 'pending' WHERE state = 'in_flight'",
        [],
    )?;
    if reset > 0 {
        log::info!("Reset {} interrupted queue entries to pending", reset);
    }

    Ok(outcome)
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
        |row| row.get(0),
    )
}

fn drop_all_tables(conn: &Connection) -> Result<()> {
    let tables: Vec<String> = conn
        .prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'")?
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<_>>>()?;

    conn.execute_batch("PRAGMA foreign_keys = OFF")?;
    for table in &tables {
        conn.execute_batch(&format!("DROP TABLE IF EXISTS \"{}\"", table.replace('"', "\"\"")))?;
    }
    conn.execute_batch("PRAGMA foreign_keys = ON")?;

    log::info!("Dropped {} local tables", tables.len());
    Ok(())
}

/// Create the complete schema (version 1)
fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS reports (
            id TEXT PRIMARY KEY,
            status TEXT CHECK(status IN ('draft', 'pending_signature', 'completed')) NOT NULL DEFAULT 'draft',
            sync_status TEXT CHECK(sync_status IN ('synced', 'pending', 'error')) NOT NULL DEFAULT 'pending',
            client_name TEXT NOT NULL,
            client_address TEXT NOT NULL DEFAULT '',
            client_phone TEXT,
            client_email TEXT,
            roof_type TEXT,
            surface_m2 REAL,
            roof_condition TEXT,
            moss_level INTEGER CHECK(moss_level IS NULL OR moss_level BETWEEN 0 AND 5),
            notes TEXT,
            worker_signature BLOB,
            worker_signed_at TEXT,
            client_signature BLOB,
            client_signed_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            completed_at TEXT,
            remote_updated_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_reports_updated ON reports(updated_at DESC);
        CREATE INDEX IF NOT EXISTS idx_reports_sync_status ON reports(sync_status);

        CREATE TABLE IF NOT EXISTS photos (
            id TEXT PRIMARY KEY,
            report_id TEXT NOT NULL,
            kind TEXT CHECK(kind IN ('before', 'after')) NOT NULL,
            display_order INTEGER NOT NULL CHECK(display_order >= 0),
            checksum TEXT NOT NULL,
            content_type TEXT NOT NULL DEFAULT 'image/jpeg',
            blob BLOB,
            remote_url TEXT,
            created_at TEXT NOT NULL,
            UNIQUE(report_id, kind, display_order),
            FOREIGN KEY (report_id) REFERENCES reports(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_photos_report ON photos(report_id);

        CREATE TABLE IF NOT EXISTS sync_queue (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            report_id TEXT NOT NULL,
            operation TEXT CHECK(operation IN ('create', 'update', 'delete', 'upload_photo')) NOT NULL,
            payload TEXT NOT NULL,
            state TEXT CHECK(state IN ('pending', 'in_flight', 'terminal')) NOT NULL DEFAULT 'pending',
            attempt_count INTEGER NOT NULL DEFAULT 0,
            last_attempt_at TEXT,
            next_attempt_at TEXT,
            last_error TEXT,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sync_queue_report ON sync_queue(report_id, seq);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_state ON sync_queue(state);",
    )
}
