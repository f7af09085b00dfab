//! Linear schema migrations tracked via a `schema_version` row in
//! `backup_settings`, applied inside one transaction. Grounded on the
//! meta-table-driven versioning idiom used by the corpus's own rusqlite
//! schema-migration modules.

use rusqlite::{params, Connection};

use crate::error::{KeeplyError, Result};

const SCHEMA_VERSION_KEY: &str = "schema_version";

/// One migration step: bumps the tracked version to `version` after
/// executing `sql`.
struct Migration {
    version: i64,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: r#"
        CREATE TABLE IF NOT EXISTS backup_settings (
            key        TEXT PRIMARY KEY,
            value      TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS scans (
            scan_id     INTEGER PRIMARY KEY AUTOINCREMENT,
            root_path   TEXT NOT NULL,
            started_at  TEXT NOT NULL,
            finished_at TEXT,
            total_usage INTEGER,
            status      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_scans_root_scan
            ON scans(root_path, scan_id);

        CREATE TABLE IF NOT EXISTS file_inventory (
            root_path       TEXT NOT NULL,
            path_rel        TEXT NOT NULL,
            name            TEXT NOT NULL,
            size_bytes      INTEGER NOT NULL,
            modified_millis INTEGER NOT NULL,
            created_millis  INTEGER NOT NULL,
            last_scan_id    INTEGER NOT NULL,
            status          TEXT NOT NULL,
            PRIMARY KEY (root_path, path_rel)
        );
        CREATE INDEX IF NOT EXISTS idx_inventory_root_last_scan
            ON file_inventory(root_path, last_scan_id);

        CREATE TABLE IF NOT EXISTS file_history (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            scan_id         INTEGER NOT NULL,
            root_path       TEXT NOT NULL,
            path_rel        TEXT NOT NULL,
            size_bytes      INTEGER NOT NULL,
            status_event    TEXT NOT NULL,
            created_at      TEXT NOT NULL,
            created_millis  INTEGER NOT NULL,
            modified_millis INTEGER NOT NULL,
            content_hash    TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_history_root_path_scan
            ON file_history(root_path, path_rel, scan_id);

        CREATE TABLE IF NOT EXISTS scan_issues (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            scan_id    INTEGER NOT NULL,
            path       TEXT NOT NULL,
            message    TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS backup_history (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            started_at      TEXT NOT NULL,
            finished_at     TEXT,
            status          TEXT NOT NULL,
            backup_type     TEXT,
            root_path       TEXT NOT NULL,
            dest_path       TEXT NOT NULL,
            files_processed INTEGER NOT NULL DEFAULT 0,
            errors          INTEGER NOT NULL DEFAULT 0,
            scan_id         INTEGER,
            message         TEXT
        );
    "#,
}];

fn current_version(conn: &Connection) -> Result<i64> {
    let exists: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='backup_settings'",
            [],
            |_| Ok(true),
        )
        .unwrap_or(false);
    if !exists {
        return Ok(0);
    }
    conn.query_row(
        "SELECT value FROM backup_settings WHERE key = ?1",
        params![SCHEMA_VERSION_KEY],
        |row| row.get::<_, String>(0),
    )
    .optional_or_zero()
}

trait OptionalOrZero {
    fn optional_or_zero(self) -> Result<i64>;
}

impl OptionalOrZero for rusqlite::Result<String> {
    fn optional_or_zero(self) -> Result<i64> {
        match self {
            Ok(s) => s
                .parse::<i64>()
                .map_err(|e| KeeplyError::DbMigration(format!("bad schema_version value: {e}"))),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
            Err(e) => Err(KeeplyError::Db(e)),
        }
    }
}

/// Applies every migration whose version is greater than the store's
/// current tracked version, each inside its own transaction.
pub fn apply(conn: &mut Connection) -> Result<()> {
    let mut version = current_version(conn)?;
    for migration in MIGRATIONS {
        if migration.version <= version {
            continue;
        }
        let tx = conn
            .transaction()
            .map_err(|e| KeeplyError::DbMigration(e.to_string()))?;
        tx.execute_batch(migration.sql)
            .map_err(|e| KeeplyError::DbMigration(format!("migration {}: {e}", migration.version)))?;
        tx.execute(
            "INSERT INTO backup_settings(key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![
                SCHEMA_VERSION_KEY,
                migration.version.to_string(),
                crate::ids::now_wall_clock(),
            ],
        )
        .map_err(|e| KeeplyError::DbMigration(e.to_string()))?;
        tx.commit()
            .map_err(|e| KeeplyError::DbMigration(e.to_string()))?;
        version = migration.version;
    }
    Ok(())
}
