//! Diff / history engine (C6). The four-step algorithm and the
//! snapshot-at-S query live on [`crate::store::MetadataStore`] directly,
//! since each step is a statement in the same transaction; this module is
//! the public, component-shaped entry point called by the backup driver.

use crate::error::Result;
use crate::store::{HistoryEntry, MetadataStore};

/// Runs delete-detection, change-promotion, mark-stable and scan
/// finalization for `scan_id` against `root_path`, atomically.
pub fn compute_and_finalize(store: &mut MetadataStore, scan_id: i64, root_path: &str) -> Result<()> {
    store.run_diff_and_finalize(scan_id, root_path)
}

/// The set of (path, latest-history-row) pairs with `scan_id <= s` whose
/// latest `status_event != DELETED`.
pub fn snapshot_at(store: &MetadataStore, root_path: &str, s: i64) -> Result<Vec<HistoryEntry>> {
    store.snapshot_at(root_path, s)
}
