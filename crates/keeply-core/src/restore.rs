//! Restore engine (C9): materializes files from a scan id via blob lookups,
//! under one of three placement modes.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::Result;
use crate::store::{HistoryEntry, MetadataStore};
use crate::vault::BlobVault;

#[derive(Debug, Clone)]
pub enum Placement {
    /// `<original_root>/<path_rel>`.
    OriginalPath,
    /// `<chosen_dir>/<path_rel>`.
    DestWithStructure(PathBuf),
    /// `<chosen_dir>/<basename(path_rel)>`, with ` (N)` collision suffixing.
    DestFlat(PathBuf),
}

#[derive(Debug, Clone, Default)]
pub struct RestoreOutcome {
    pub files_restored: u64,
    pub errors: u64,
}

/// Restores the NEW/MODIFIED set of scan `scan_id`.
pub fn restore_changed_from_scan(
    store: &MetadataStore,
    vault: &BlobVault,
    scan_id: i64,
    placement: &Placement,
    original_root: &Path,
    passphrase: &str,
    cancel: &AtomicBool,
) -> Result<RestoreOutcome> {
    let entries = store.changed_set(scan_id)?;
    restore_entries(&entries, vault, placement, original_root, passphrase, cancel)
}

/// Restores an explicit selection: `file_paths` union every path under any
/// `dir_prefixes` entry, as of the snapshot at `scan_id`, deduplicated and
/// capped at `max_items`.
#[allow(clippy::too_many_arguments)]
pub fn restore_selection_from_snapshot(
    store: &MetadataStore,
    vault: &BlobVault,
    root_path: &str,
    scan_id: i64,
    file_paths: &[String],
    dir_prefixes: &[String],
    placement: &Placement,
    original_root: &Path,
    passphrase: &str,
    cancel: &AtomicBool,
    max_items: usize,
) -> Result<RestoreOutcome> {
    let snapshot = store.snapshot_at(root_path, scan_id)?;
    let mut seen = HashSet::new();
    let mut selected = Vec::new();

    for entry in snapshot {
        if selected.len() >= max_items {
            break;
        }
        let wanted = file_paths.iter().any(|p| p == &entry.path_rel)
            || dir_prefixes.iter().any(|prefix| entry.path_rel.starts_with(prefix.as_str()));
        if wanted && seen.insert(entry.path_rel.clone()) {
            selected.push(entry);
        }
    }

    restore_entries(&selected, vault, placement, original_root, passphrase, cancel)
}

fn restore_entries(
    entries: &[HistoryEntry],
    vault: &BlobVault,
    placement: &Placement,
    original_root: &Path,
    passphrase: &str,
    cancel: &AtomicBool,
) -> Result<RestoreOutcome> {
    let mut outcome = RestoreOutcome::default();
    let mut flat_suffixes: HashMap<String, u32> = HashMap::new();

    for entry in entries {
        if cancel.load(Ordering::SeqCst) {
            break;
        }
        let Some(hash) = entry.content_hash.as_deref() else {
            outcome.errors += 1;
            continue;
        };

        let target = resolve_target(placement, &entry.path_rel, original_root, &mut flat_suffixes);

        if let Ok(meta) = std::fs::metadata(&target) {
            if meta.len() as i64 == entry.size_bytes {
                outcome.files_restored += 1;
                continue;
            }
        }

        match vault.get_to_file(hash, &target, passphrase) {
            Ok(()) => outcome.files_restored += 1,
            Err(_) => outcome.errors += 1,
        }
    }

    Ok(outcome)
}

fn resolve_target(
    placement: &Placement,
    path_rel: &str,
    original_root: &Path,
    flat_suffixes: &mut HashMap<String, u32>,
) -> PathBuf {
    match placement {
        Placement::OriginalPath => original_root.join(path_rel),
        Placement::DestWithStructure(dir) => dir.join(path_rel),
        Placement::DestFlat(dir) => {
            let basename = Path::new(path_rel)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path_rel.to_string());

            let plain = dir.join(&basename);
            if !plain.exists() && !flat_suffixes.contains_key(&basename) {
                flat_suffixes.insert(basename, 0);
                return plain;
            }

            let counter = flat_suffixes.entry(basename.clone()).or_insert(0);
            loop {
                *counter += 1;
                let candidate = dir.join(suffixed_name(&basename, *counter));
                if !candidate.exists() {
                    return candidate;
                }
            }
        }
    }
}

fn suffixed_name(basename: &str, n: u32) -> String {
    let path = Path::new(basename);
    match path.extension() {
        Some(ext) => {
            let stem = path.file_stem().unwrap_or_default().to_string_lossy();
            format!("{stem} ({n}).{}", ext.to_string_lossy())
        }
        None => format!("{basename} ({n})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dest_flat_suffixes_collisions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"existing").unwrap();
        let mut suffixes = HashMap::new();

        let t1 = resolve_target(
            &Placement::DestFlat(dir.path().to_path_buf()),
            "sub/a.txt",
            Path::new("/src"),
            &mut suffixes,
        );
        assert_eq!(t1, dir.path().join("a (1).txt"));

        std::fs::write(&t1, b"one").unwrap();
        let t2 = resolve_target(
            &Placement::DestFlat(dir.path().to_path_buf()),
            "other/a.txt",
            Path::new("/src"),
            &mut suffixes,
        );
        assert_eq!(t2, dir.path().join("a (2).txt"));
    }

    #[test]
    fn original_path_joins_root_and_rel() {
        let mut suffixes = HashMap::new();
        let t = resolve_target(&Placement::OriginalPath, "sub/a.txt", Path::new("/src"), &mut suffixes);
        assert_eq!(t, PathBuf::from("/src/sub/a.txt"));
    }
}
