//! Metadata store (C3): an embedded relational store (rusqlite/SQLite, WAL
//! journalling) wrapped in the crypto envelope (C2) at rest. Exactly one
//! connection performs writes per scan; additional read-only connections can
//! be opened against the same runtime file via [`MetadataStore::open_reader`].

mod migrations;

use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OpenFlags};

use crate::config::EngineConfig;
use crate::crypto;
use crate::error::{KeeplyError, Result};
use crate::fsutil;
use crate::ids;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    Running,
    Done,
    Canceled,
}

impl ScanStatus {
    fn as_str(self) -> &'static str {
        match self {
            ScanStatus::Running => "RUNNING",
            ScanStatus::Done => "DONE",
            ScanStatus::Canceled => "CANCELED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InventoryStatus {
    New,
    Modified,
    Stable,
}

impl InventoryStatus {
    fn as_str(self) -> &'static str {
        match self {
            InventoryStatus::New => "NEW",
            InventoryStatus::Modified => "MODIFIED",
            InventoryStatus::Stable => "STABLE",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "NEW" => InventoryStatus::New,
            "MODIFIED" => InventoryStatus::Modified,
            _ => InventoryStatus::Stable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryEvent {
    New,
    Modified,
    Deleted,
}

impl HistoryEvent {
    fn as_str(self) -> &'static str {
        match self {
            HistoryEvent::New => "NEW",
            HistoryEvent::Modified => "MODIFIED",
            HistoryEvent::Deleted => "DELETED",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "NEW" => HistoryEvent::New,
            "MODIFIED" => HistoryEvent::Modified,
            _ => HistoryEvent::Deleted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStatus {
    Running,
    Success,
    Error,
    Canceled,
}

impl BackupStatus {
    fn as_str(self) -> &'static str {
        match self {
            BackupStatus::Running => "RUNNING",
            BackupStatus::Success => "SUCCESS",
            BackupStatus::Error => "ERROR",
            BackupStatus::Canceled => "CANCELED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupType {
    Full,
    Incremental,
}

impl BackupType {
    fn as_str(self) -> &'static str {
        match self {
            BackupType::Full => "FULL",
            BackupType::Incremental => "INCREMENTAL",
        }
    }
}

/// One observed-file record as produced by the walker and consumed by the
/// scan writer's batch upsert.
#[derive(Debug, Clone)]
pub struct InventoryObservation {
    pub root_path: String,
    pub path_rel: String,
    pub name: String,
    pub size_bytes: i64,
    pub modified_millis: i64,
    pub created_millis: i64,
    pub last_scan_id: i64,
}

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub id: i64,
    pub scan_id: i64,
    pub root_path: String,
    pub path_rel: String,
    pub size_bytes: i64,
    pub status_event: HistoryEvent,
    pub created_millis: i64,
    pub modified_millis: i64,
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BackupRunLog {
    pub id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: String,
    pub backup_type: Option<String>,
    pub root_path: String,
    pub dest_path: String,
    pub files_processed: i64,
    pub errors: i64,
    pub scan_id: Option<i64>,
    pub message: Option<String>,
}

pub struct MetadataStore {
    conn: Connection,
    runtime_path: PathBuf,
    cipher_path: PathBuf,
    encryption_enabled: bool,
}

impl MetadataStore {
    /// Opens the store for `cfg`, decrypting the persisted file into a
    /// runtime plaintext path first when encryption is enabled. Refuses to
    /// open (`PlainStorePresent`) if the persisted file exists and looks
    /// like unencrypted SQLite bytes.
    pub fn open(cfg: &EngineConfig, passphrase: &str) -> Result<Self> {
        let cipher_path = cfg.db_path();
        let runtime_path = cfg.control_dir().join("db.runtime.sqlite3");
        fs::create_dir_all(cfg.control_dir()).map_err(|e| KeeplyError::io(cfg.control_dir(), e))?;

        if cfg.encryption_enabled && cipher_path.exists() {
            if crypto::looks_plain_sqlite(&cipher_path)? {
                return Err(KeeplyError::PlainStorePresent(cipher_path));
            }
            crypto::decrypt(&cipher_path, &runtime_path, passphrase)?;
        }

        let mut conn = Connection::open(&runtime_path).map_err(KeeplyError::Db)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(KeeplyError::Db)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(KeeplyError::Db)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(KeeplyError::Db)?;

        migrations::apply(&mut conn)?;

        Ok(MetadataStore {
            conn,
            runtime_path,
            cipher_path,
            encryption_enabled: cfg.encryption_enabled,
        })
    }

    /// Opens an additional read-only connection against the same runtime
    /// file, matching the single-writer/multi-reader discipline.
    pub fn open_reader(&self) -> Result<Connection> {
        Connection::open_with_flags(&self.runtime_path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(KeeplyError::Db)
    }

    /// Checkpoints the WAL and encrypts the runtime file over the persisted
    /// path, without deleting the runtime file. Safe to call mid-run.
    pub fn persist_encrypted_snapshot(&self, passphrase: &str) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
            .map_err(KeeplyError::Db)?;
        if self.encryption_enabled {
            // A prior snapshot attempt canceled between its tmp write and
            // the rename leaves a stray sibling; clear it before retrying.
            fsutil::remove_tmp_best_effort(&self.cipher_path);
            crypto::encrypt(&self.runtime_path, &self.cipher_path, passphrase)?;
        }
        Ok(())
    }

    /// Final checkpoint + encrypt, then deletes the runtime file and its
    /// auxiliary journal files, so the decrypted copy never outlives the
    /// run. Never deletes the runtime file if the encrypt step fails, so a
    /// failed shutdown never silently loses data. When encryption is
    /// disabled the runtime file *is* the persisted store, not a scratch
    /// decrypt target, so it is left in place.
    pub fn close_and_encrypt(self, passphrase: &str) -> Result<()> {
        self.persist_encrypted_snapshot(passphrase)?;
        if !self.encryption_enabled {
            return Ok(());
        }
        let runtime_path = self.runtime_path.clone();
        drop(self.conn);
        let _ = fs::remove_file(&runtime_path);
        let _ = fs::remove_file(with_suffix(&runtime_path, "-wal"));
        let _ = fs::remove_file(with_suffix(&runtime_path, "-shm"));
        Ok(())
    }

    // ---- scans ----------------------------------------------------------

    pub fn start_scan(&self, root_path: &str) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO scans(root_path, started_at, status) VALUES (?1, ?2, ?3)",
            params![root_path, ids::now_wall_clock(), ScanStatus::Running.as_str()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// True if no scan for `root_path` other than `scan_id` has ever
    /// completed successfully; used by the driver to classify FULL vs
    /// INCREMENTAL.
    pub fn is_first_scan(&self, root_path: &str, scan_id: i64) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM scans WHERE root_path = ?1 AND scan_id != ?2 AND status = 'DONE'",
            params![root_path, scan_id],
            |row| row.get(0),
        )?;
        Ok(count == 0)
    }

    pub fn mark_scan_canceled(&self, scan_id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE scans SET status = ?1, finished_at = ?2 WHERE scan_id = ?3",
            params![ScanStatus::Canceled.as_str(), ids::now_wall_clock(), scan_id],
        )?;
        Ok(())
    }

    pub fn record_scan_issue(&self, scan_id: i64, path: &str, message: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO scan_issues(scan_id, path, message, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![scan_id, path, message, ids::now_wall_clock()],
        )?;
        Ok(())
    }

    // ---- inventory (C4 scan writer) -------------------------------------

    /// Applies one batch of observations inside a single transaction,
    /// implementing the upsert semantics of §4.4 exactly: `status` flips to
    /// `MODIFIED` only when size or mtime actually changed, otherwise the
    /// prior status is preserved (a STABLE row reobserved unchanged stays
    /// STABLE until diff marks it again).
    pub fn apply_inventory_batch(&mut self, batch: &[InventoryObservation]) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO file_inventory
                     (root_path, path_rel, name, size_bytes, modified_millis,
                      created_millis, last_scan_id, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'NEW')
                 ON CONFLICT(root_path, path_rel) DO UPDATE SET
                     last_scan_id    = excluded.last_scan_id,
                     name            = excluded.name,
                     status          = CASE
                                           WHEN file_inventory.size_bytes != excluded.size_bytes
                                             OR file_inventory.modified_millis != excluded.modified_millis
                                           THEN 'MODIFIED'
                                           ELSE file_inventory.status
                                       END,
                     size_bytes      = excluded.size_bytes,
                     modified_millis = excluded.modified_millis,
                     created_millis  = CASE
                                           WHEN excluded.created_millis > 0
                                           THEN excluded.created_millis
                                           ELSE file_inventory.created_millis
                                       END",
            )?;
            for obs in batch {
                stmt.execute(params![
                    obs.root_path,
                    obs.path_rel,
                    obs.name,
                    obs.size_bytes,
                    obs.modified_millis,
                    obs.created_millis,
                    obs.last_scan_id,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // ---- diff / history engine (C6) -------------------------------------

    /// Runs the four-step diff/history algorithm for scan `scan_id` against
    /// root `root_path`, all inside one transaction so readers only ever
    /// observe the pre- or post-state of the whole scan.
    pub fn run_diff_and_finalize(&mut self, scan_id: i64, root_path: &str) -> Result<()> {
        let tx = self.conn.transaction()?;
        let now = ids::now_wall_clock();

        // Step 1: delete detection.
        {
            let mut select_gone = tx.prepare(
                "SELECT path_rel, size_bytes, created_millis, modified_millis
                 FROM file_inventory
                 WHERE root_path = ?1 AND last_scan_id < ?2",
            )?;
            let gone = select_gone
                .query_map(params![root_path, scan_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            for (path_rel, size_bytes, created_millis, modified_millis) in &gone {
                tx.execute(
                    "INSERT INTO file_history
                         (scan_id, root_path, path_rel, size_bytes, status_event,
                          created_at, created_millis, modified_millis, content_hash)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL)",
                    params![
                        scan_id,
                        root_path,
                        path_rel,
                        size_bytes,
                        HistoryEvent::Deleted.as_str(),
                        now,
                        created_millis,
                        modified_millis,
                    ],
                )?;
            }
            tx.execute(
                "DELETE FROM file_inventory WHERE root_path = ?1 AND last_scan_id < ?2",
                params![root_path, scan_id],
            )?;
        }

        // Step 2: promote NEW/MODIFIED inventory rows into history.
        {
            let mut select_changed = tx.prepare(
                "SELECT path_rel, size_bytes, status, created_millis, modified_millis
                 FROM file_inventory
                 WHERE root_path = ?1 AND last_scan_id = ?2 AND status IN ('NEW', 'MODIFIED')",
            )?;
            let changed = select_changed
                .query_map(params![root_path, scan_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            for (path_rel, size_bytes, status, created_millis, modified_millis) in &changed {
                tx.execute(
                    "INSERT INTO file_history
                         (scan_id, root_path, path_rel, size_bytes, status_event,
                          created_at, created_millis, modified_millis, content_hash)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL)",
                    params![
                        scan_id,
                        root_path,
                        path_rel,
                        size_bytes,
                        InventoryStatus::parse(status).as_str(),
                        now,
                        created_millis,
                        modified_millis,
                    ],
                )?;
            }
        }

        // Step 3: mark stable.
        tx.execute(
            "UPDATE file_inventory SET status = 'STABLE'
             WHERE root_path = ?1 AND last_scan_id = ?2",
            params![root_path, scan_id],
        )?;

        // Step 4: finalize scan.
        let total_usage: i64 = tx.query_row(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM file_inventory WHERE root_path = ?1",
            params![root_path],
            |row| row.get(0),
        )?;
        tx.execute(
            "UPDATE scans SET finished_at = ?1, total_usage = ?2, status = ?3 WHERE scan_id = ?4",
            params![now, total_usage, ScanStatus::Done.as_str(), scan_id],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// The NEW/MODIFIED set of a scan, ordered by `path_rel`, as consumed by
    /// the backup driver.
    pub fn changed_set(&self, scan_id: i64) -> Result<Vec<HistoryEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, scan_id, root_path, path_rel, size_bytes, status_event,
                    created_millis, modified_millis, content_hash
             FROM file_history
             WHERE scan_id = ?1 AND status_event IN ('NEW', 'MODIFIED')
             ORDER BY path_rel",
        )?;
        let rows = stmt
            .query_map(params![scan_id], row_to_history_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn set_content_hash(&self, scan_id: i64, path_rel: &str, hash: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE file_history SET content_hash = ?1
             WHERE scan_id = ?2 AND path_rel = ?3 AND content_hash IS NULL",
            params![hash, scan_id, path_rel],
        )?;
        Ok(())
    }

    /// Snapshot-at-scan-S: for each `(root, path)`, the row with the
    /// greatest `scan_id <= s`, excluding any whose latest status_event is
    /// `DELETED`.
    pub fn snapshot_at(&self, root_path: &str, s: i64) -> Result<Vec<HistoryEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT h.id, h.scan_id, h.root_path, h.path_rel, h.size_bytes, h.status_event,
                    h.created_millis, h.modified_millis, h.content_hash
             FROM file_history h
             INNER JOIN (
                 SELECT path_rel, MAX(scan_id) AS max_scan
                 FROM file_history
                 WHERE root_path = ?1 AND scan_id <= ?2
                 GROUP BY path_rel
             ) latest
             ON h.path_rel = latest.path_rel AND h.scan_id = latest.max_scan
             WHERE h.root_path = ?1 AND h.status_event != 'DELETED'
             ORDER BY h.path_rel",
        )?;
        let rows = stmt
            .query_map(params![root_path, s], row_to_history_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ---- backup_history (C8) --------------------------------------------

    pub fn start_backup_run(&self, root_path: &str, dest_path: &str, scan_id: i64) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO backup_history
                 (started_at, status, root_path, dest_path, files_processed, errors, scan_id)
             VALUES (?1, ?2, ?3, ?4, 0, 0, ?5)",
            params![ids::now_wall_clock(), BackupStatus::Running.as_str(), root_path, dest_path, scan_id],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn finalize_backup_run(
        &self,
        id: i64,
        status: BackupStatus,
        backup_type: Option<BackupType>,
        files_processed: i64,
        errors: i64,
        message: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE backup_history SET
                 finished_at = ?1, status = ?2, backup_type = ?3,
                 files_processed = ?4, errors = ?5, message = ?6
             WHERE id = ?7",
            params![
                ids::now_wall_clock(),
                status.as_str(),
                backup_type.map(BackupType::as_str),
                files_processed,
                errors,
                message,
                id,
            ],
        )?;
        Ok(())
    }

    pub fn list_backup_history(&self, limit: i64) -> Result<Vec<BackupRunLog>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, started_at, finished_at, status, backup_type, root_path, dest_path,
                    files_processed, errors, scan_id, message
             FROM backup_history
             ORDER BY id DESC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(BackupRunLog {
                    id: row.get(0)?,
                    started_at: row.get(1)?,
                    finished_at: row.get(2)?,
                    status: row.get(3)?,
                    backup_type: row.get(4)?,
                    root_path: row.get(5)?,
                    dest_path: row.get(6)?,
                    files_processed: row.get(7)?,
                    errors: row.get(8)?,
                    scan_id: row.get(9)?,
                    message: row.get(10)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ---- settings ---------------------------------------------------------

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM backup_settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(KeeplyError::Db(other)),
            })
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO backup_settings(key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, ids::now_wall_clock()],
        )?;
        Ok(())
    }
}

fn row_to_history_entry(row: &rusqlite::Row) -> rusqlite::Result<HistoryEntry> {
    Ok(HistoryEntry {
        id: row.get(0)?,
        scan_id: row.get(1)?,
        root_path: row.get(2)?,
        path_rel: row.get(3)?,
        size_bytes: row.get(4)?,
        status_event: HistoryEvent::parse(&row.get::<_, String>(5)?),
        created_millis: row.get(6)?,
        modified_millis: row.get(7)?,
        content_hash: row.get(8)?,
    })
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cfg(dir: &std::path::Path) -> EngineConfig {
        let root = dir.join("src");
        let dest = dir.join("dst");
        fs::create_dir_all(&root).unwrap();
        fs::create_dir_all(&dest).unwrap();
        let mut cfg = EngineConfig::new(root, dest);
        cfg.encryption_enabled = false;
        cfg
    }

    #[test]
    fn fresh_store_runs_migrations() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_cfg(dir.path());
        let store = MetadataStore::open(&cfg, "pw").unwrap();
        assert_eq!(store.get_setting("schema_version").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn upsert_then_diff_marks_new_then_stable() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_cfg(dir.path());
        let mut store = MetadataStore::open(&cfg, "pw").unwrap();

        let scan_id = store.start_scan("/src").unwrap();
        store
            .apply_inventory_batch(&[InventoryObservation {
                root_path: "/src".into(),
                path_rel: "a.txt".into(),
                name: "a.txt".into(),
                size_bytes: 3,
                modified_millis: 1000,
                created_millis: 1000,
                last_scan_id: scan_id,
            }])
            .unwrap();
        store.run_diff_and_finalize(scan_id, "/src").unwrap();

        let changed = store.changed_set(scan_id).unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].status_event, HistoryEvent::New);
    }

    #[test]
    fn reencoding_same_file_is_no_op_incremental() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_cfg(dir.path());
        let mut store = MetadataStore::open(&cfg, "pw").unwrap();

        let scan1 = store.start_scan("/src").unwrap();
        let obs = InventoryObservation {
            root_path: "/src".into(),
            path_rel: "a.txt".into(),
            name: "a.txt".into(),
            size_bytes: 3,
            modified_millis: 1000,
            created_millis: 1000,
            last_scan_id: scan1,
        };
        store.apply_inventory_batch(&[obs.clone()]).unwrap();
        store.run_diff_and_finalize(scan1, "/src").unwrap();

        let scan2 = store.start_scan("/src").unwrap();
        let obs2 = InventoryObservation { last_scan_id: scan2, ..obs };
        store.apply_inventory_batch(&[obs2]).unwrap();
        store.run_diff_and_finalize(scan2, "/src").unwrap();

        assert_eq!(store.changed_set(scan2).unwrap().len(), 0);
        assert!(!store.is_first_scan("/src", scan2).unwrap());
    }
}
