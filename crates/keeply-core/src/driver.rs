//! Backup driver (C8): orchestrates walker -> scan writer -> diff engine ->
//! blob vault, and records exactly one `backup_history` row per run.

use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::diff;
use crate::error::{KeeplyError, Result};
use crate::matcher::Matcher;
use crate::scan_writer::ScanWriterHandle;
use crate::store::{BackupStatus, BackupType, InventoryObservation, MetadataStore};
use crate::vault::BlobVault;
use crate::walker::Walker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Error,
    Canceled,
}

#[derive(Debug, Clone)]
pub struct BackupOutcome {
    pub scan_id: i64,
    pub backup_type: Option<BackupType>,
    pub files_processed: u64,
    pub errors: u64,
    pub status: RunStatus,
}

/// Exclusive advisory lock on the destination, enforcing the "no hot
/// concurrent scans on the same destination" rule. Released on drop.
struct DestinationLock {
    path: PathBuf,
}

impl DestinationLock {
    fn acquire(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| KeeplyError::io(parent, e))?;
        }
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|_| {
                KeeplyError::Config(format!(
                    "another scan appears to be in progress at {}",
                    path.display()
                ))
            })?;
        Ok(DestinationLock { path })
    }
}

impl Drop for DestinationLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Runs one full backup: scan, diff, and blob-writing, all gated by a
/// single shared cancellation flag. Progress is reported as
/// `(files_done, files_total)` over the changed set only (the scan/walk
/// phase has no known total ahead of time).
pub fn run_backup(
    cfg: &EngineConfig,
    passphrase: &str,
    cancel: Arc<AtomicBool>,
    mut progress: impl FnMut(u64, u64),
) -> Result<BackupOutcome> {
    cfg.validate()?;
    let _lock = DestinationLock::acquire(cfg.lock_path())?;

    let root_path = cfg.root.to_string_lossy().into_owned();
    let mut store = MetadataStore::open(cfg, passphrase)?;
    let scan_id = store.start_scan(&root_path)?;
    let run_id = store.start_backup_run(&root_path, &cfg.dest.to_string_lossy(), scan_id)?;

    let matcher = Matcher::compile(&cfg.exclude_patterns)?;
    let walker = Walker::new(cfg.root.clone(), cfg.dest.clone(), matcher, cancel.clone());
    let handle = ScanWriterHandle::spawn(store, cfg.batch.clone(), cancel.clone());

    let mut issues = Vec::new();
    walker.walk(
        |obs| {
            handle.send(InventoryObservation {
                root_path: root_path.clone(),
                path_rel: obs.path_rel,
                name: obs.name,
                size_bytes: obs.size,
                modified_millis: obs.modified_millis,
                created_millis: obs.created_millis,
                last_scan_id: scan_id,
            });
        },
        |path, message| issues.push((path.to_string(), message.to_string())),
    );

    let outcome = handle.finish()?;
    let mut store = outcome.store;
    for (path, message) in &issues {
        store.record_scan_issue(scan_id, path, message)?;
    }

    let vault = BlobVault::new(cfg.storage_dir());

    if cancel.load(Ordering::SeqCst) {
        store.mark_scan_canceled(scan_id)?;
        store.finalize_backup_run(
            run_id,
            BackupStatus::Canceled,
            None,
            0,
            issues.len() as i64,
            Some("canceled during scan"),
        )?;
        vault.cleanup_incomplete();
        store.close_and_encrypt(passphrase)?;
        return Ok(BackupOutcome {
            scan_id,
            backup_type: None,
            files_processed: 0,
            errors: issues.len() as u64,
            status: RunStatus::Canceled,
        });
    }

    diff::compute_and_finalize(&mut store, scan_id, &root_path)?;
    let backup_type = if store.is_first_scan(&root_path, scan_id)? {
        BackupType::Full
    } else {
        BackupType::Incremental
    };

    let changed = store.changed_set(scan_id)?;
    let total = changed.len() as u64;
    let mut files_processed: u64 = 0;
    let mut errors: u64 = issues.len() as u64;
    let mut canceled_mid_run = false;

    for entry in &changed {
        if cancel.load(Ordering::SeqCst) {
            canceled_mid_run = true;
            break;
        }
        let source = cfg.root.join(&entry.path_rel);
        match vault.put_file(&source, passphrase) {
            Ok(hash) => {
                store.set_content_hash(scan_id, &entry.path_rel, &hash)?;
                files_processed += 1;
                progress(files_processed, total);
            }
            Err(e) => {
                errors += 1;
                store.record_scan_issue(scan_id, &entry.path_rel, &e.to_string())?;
            }
        }
    }

    let status = if canceled_mid_run { RunStatus::Canceled } else { RunStatus::Success };
    let history_status = match status {
        RunStatus::Canceled => BackupStatus::Canceled,
        RunStatus::Success => BackupStatus::Success,
        RunStatus::Error => BackupStatus::Error,
    };

    store.finalize_backup_run(
        run_id,
        history_status,
        Some(backup_type),
        files_processed as i64,
        errors as i64,
        None,
    )?;
    vault.cleanup_incomplete();
    store.close_and_encrypt(passphrase)?;

    Ok(BackupOutcome { scan_id, backup_type: Some(backup_type), files_processed, errors, status })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn cfg(dir: &std::path::Path) -> EngineConfig {
        let root = dir.join("src");
        let dest = dir.join("dst");
        fs::create_dir_all(&root).unwrap();
        fs::create_dir_all(&dest).unwrap();
        let mut cfg = EngineConfig::new(root, dest);
        cfg.encryption_enabled = false;
        cfg
    }

    #[test]
    fn first_backup_is_full_and_writes_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = cfg(dir.path());
        fs::write(cfg.root.join("a.txt"), b"foo").unwrap();
        fs::create_dir_all(cfg.root.join("sub")).unwrap();
        fs::write(cfg.root.join("sub/b.bin"), b"hello").unwrap();

        let cancel = Arc::new(AtomicBool::new(false));
        let outcome = run_backup(&cfg, "p", cancel, |_, _| {}).unwrap();

        assert_eq!(outcome.backup_type, Some(BackupType::Full));
        assert_eq!(outcome.files_processed, 2);
        assert_eq!(outcome.errors, 0);
        assert!(matches!(outcome.status, RunStatus::Success));
    }

    #[test]
    fn no_op_rescan_is_incremental_with_zero_files() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = cfg(dir.path());
        fs::write(cfg.root.join("a.txt"), b"foo").unwrap();

        let cancel = Arc::new(AtomicBool::new(false));
        run_backup(&cfg, "p", cancel.clone(), |_, _| {}).unwrap();
        let second = run_backup(&cfg, "p", cancel, |_, _| {}).unwrap();

        assert_eq!(second.backup_type, Some(BackupType::Incremental));
        assert_eq!(second.files_processed, 0);
    }
}
