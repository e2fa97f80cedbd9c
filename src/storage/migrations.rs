//! Database migrations for the SQLite resource store

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Run all pending migrations
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

    if current_version < SCHEMA_VERSION {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Initial schema (v1)
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- One row per identity; deleted = 1 marks a tombstone
        CREATE TABLE IF NOT EXISTS resources (
            cluster TEXT NOT NULL,
            grp TEXT NOT NULL,
            version TEXT NOT NULL,
            kind TEXT NOT NULL,
            namespace TEXT NOT NULL DEFAULT '',
            name TEXT NOT NULL,
            resource TEXT,
            uid TEXT,
            resource_version TEXT NOT NULL,
            labels TEXT NOT NULL DEFAULT '{}',
            annotations TEXT NOT NULL DEFAULT '{}',
            created_at TEXT,
            last_seen TEXT NOT NULL,
            payload TEXT NOT NULL DEFAULT 'null',
            deleted INTEGER NOT NULL DEFAULT 0,
            deleted_at TEXT,
            PRIMARY KEY (cluster, grp, version, kind, namespace, name)
        );

        -- Bounded change feed; revision is the storage revision
        CREATE TABLE IF NOT EXISTS resource_changes (
            revision INTEGER PRIMARY KEY AUTOINCREMENT,
            cluster TEXT NOT NULL,
            grp TEXT NOT NULL,
            version TEXT NOT NULL,
            resource TEXT NOT NULL,
            event_type TEXT NOT NULL,
            record TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        INSERT INTO schema_version (version) VALUES (1);
        "#,
    )?;

    Ok(())
}

/// Scope indexes for list, purge and compaction (v2)
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE INDEX IF NOT EXISTS idx_resources_scope
            ON resources(cluster, grp, version, resource, deleted);
        CREATE INDEX IF NOT EXISTS idx_resources_tombstones
            ON resources(deleted, deleted_at);
        CREATE INDEX IF NOT EXISTS idx_changes_scope
            ON resource_changes(cluster, grp, version, resource, revision);

        INSERT INTO schema_version (version) VALUES (2);
        "#,
    )?;

    Ok(())
}
