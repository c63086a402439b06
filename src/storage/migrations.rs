//! Database migrations for the local store

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 3;

/// Run all migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    if current_version < 2 {
        migrate_v2(conn)?;
    }

    if current_version < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Records, settings and per-entity sync state (v1)
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            local_id TEXT PRIMARY KEY,
            entity_type TEXT NOT NULL,
            remote_id TEXT,
            owner_id TEXT,
            timestamp TEXT NOT NULL,
            payload TEXT NOT NULL DEFAULT '{}',
            sync_status TEXT NOT NULL DEFAULT 'pending',
            last_synced_at TEXT,
            sync_error TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_records_entity_status
            ON records(entity_type, sync_status);
        CREATE INDEX IF NOT EXISTS idx_records_owner ON records(owner_id);

        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sync_state (
            entity_type TEXT PRIMARY KEY,
            last_sync TEXT,
            last_error TEXT,
            updated_at TEXT NOT NULL
        );

        INSERT INTO schema_version (version) VALUES (1);
        "#,
    )?;
    Ok(())
}

/// Durable offline operation queue and dead letters (v2)
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS offline_operations (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            operation_type TEXT NOT NULL,
            payload BLOB NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            retry_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            last_attempt_at TEXT,
            next_attempt_at TEXT,
            last_error TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_offline_operations_order
            ON offline_operations(priority, seq);

        CREATE TABLE IF NOT EXISTS dead_letter_operations (
            id TEXT PRIMARY KEY,
            operation_type TEXT NOT NULL,
            payload BLOB NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            retry_count INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            last_attempt_at TEXT,
            error TEXT NOT NULL,
            dead_lettered_at TEXT NOT NULL
        );

        INSERT INTO schema_version (version) VALUES (2);
        "#,
    )?;
    Ok(())
}

/// Cloud delivery state, kept apart from the backend's (v3)
fn migrate_v3(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        ALTER TABLE records ADD COLUMN cloud_status TEXT NOT NULL DEFAULT 'pending';
        ALTER TABLE records ADD COLUMN cloud_record_name TEXT;
        ALTER TABLE records ADD COLUMN cloud_synced_at TEXT;
        ALTER TABLE records ADD COLUMN cloud_error TEXT;

        CREATE INDEX IF NOT EXISTS idx_records_entity_cloud_status
            ON records(entity_type, cloud_status);

        INSERT INTO schema_version (version) VALUES (3);
        "#,
    )?;
    Ok(())
}
