//! Walker (C5): recursive directory traversal with cancellation,
//! destination-subtree exclusion, and the two-stage fast/glob exclusion
//! chain described in §4.5.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use walkdir::WalkDir;

use crate::config::is_prefix_of;
use crate::matcher::{fast_exclude, normalize_rel_path, Matcher};

/// One observed regular file, ready to be enqueued to the scan writer.
#[derive(Debug, Clone)]
pub struct WalkObservation {
    pub path_rel: String,
    pub name: String,
    pub size: i64,
    pub modified_millis: i64,
    pub created_millis: i64,
}

#[derive(Debug, Clone, Default)]
pub struct WalkStats {
    pub files_observed: u64,
    pub errors: u64,
    pub canceled: bool,
}

pub struct Walker {
    root: PathBuf,
    dest: PathBuf,
    matcher: Matcher,
    cancel: Arc<AtomicBool>,
}

impl Walker {
    pub fn new(root: impl Into<PathBuf>, dest: impl Into<PathBuf>, matcher: Matcher, cancel: Arc<AtomicBool>) -> Self {
        Walker { root: root.into(), dest: dest.into(), matcher, cancel }
    }

    /// Walks the tree rooted at `root`. Calls `on_file` for every accepted
    /// regular file and `on_issue` for per-path errors; per-path errors are
    /// local-recoverable and never abort the walk.
    pub fn walk(
        &self,
        mut on_file: impl FnMut(WalkObservation),
        mut on_issue: impl FnMut(&str, &str),
    ) -> WalkStats {
        let mut stats = WalkStats::default();
        let entries = WalkDir::new(&self.root).follow_links(false).into_iter();

        for entry in entries.filter_entry(|e| self.should_descend(e)) {
            if self.cancel.load(Ordering::SeqCst) {
                stats.canceled = true;
                break;
            }
            let entry = match entry {
                Ok(e) => e,
                Err(err) => {
                    stats.errors += 1;
                    let path = err.path().map(|p| p.display().to_string()).unwrap_or_default();
                    on_issue(&path, &err.to_string());
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = match entry.path().strip_prefix(&self.root) {
                Ok(r) => normalize_rel_path(r),
                Err(_) => continue,
            };
            if fast_exclude(&rel) || self.matcher.matches(&rel) {
                continue;
            }
            match entry.metadata() {
                Ok(meta) => {
                    on_file(WalkObservation {
                        name: entry.file_name().to_string_lossy().to_string(),
                        path_rel: rel,
                        size: meta.len() as i64,
                        modified_millis: to_millis(meta.modified().ok()),
                        created_millis: to_millis(meta.created().ok()),
                    });
                    stats.files_observed += 1;
                }
                Err(err) => {
                    stats.errors += 1;
                    on_issue(&rel, &err.to_string());
                }
            }
        }
        stats
    }

    /// Cancellation, destination-subtree exclusion, then the fast/glob
    /// exclusion chain, applied before descending into a directory.
    fn should_descend(&self, entry: &walkdir::DirEntry) -> bool {
        if self.cancel.load(Ordering::SeqCst) {
            return false;
        }
        if is_prefix_of(&self.dest, entry.path()) {
            return false;
        }
        if entry.path() == self.root {
            return true;
        }
        let rel = match entry.path().strip_prefix(&self.root) {
            Ok(r) => normalize_rel_path(r),
            Err(_) => return true,
        };
        if fast_exclude(&rel) {
            return false;
        }
        if entry.file_type().is_dir() && self.matcher.matches(&rel) {
            return false;
        }
        true
    }
}

fn to_millis(time: Option<SystemTime>) -> i64 {
    time.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn walks_files_and_skips_destination_subtree() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("src");
        let dest = root.join("dst");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::create_dir_all(&dest).unwrap();
        fs::write(root.join("a.txt"), b"foo").unwrap();
        fs::write(root.join("sub/b.bin"), b"hello").unwrap();
        fs::write(dest.join("leaked.txt"), b"should not be seen").unwrap();

        let matcher = Matcher::compile(&[]).unwrap();
        let cancel = Arc::new(AtomicBool::new(false));
        let walker = Walker::new(&root, &dest, matcher, cancel);

        let mut seen = Vec::new();
        let stats = walker.walk(|obs| seen.push(obs.path_rel), |_, _| {});

        seen.sort();
        assert_eq!(seen, vec!["a.txt".to_string(), "sub/b.bin".to_string()]);
        assert_eq!(stats.files_observed, 2);
        assert_eq!(stats.errors, 0);
    }

    #[test]
    fn glob_exclusion_skips_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("src");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("keep.txt"), b"x").unwrap();
        fs::write(root.join("skip.log"), b"x").unwrap();

        let matcher = Matcher::compile(&["*.log".to_string()]).unwrap();
        let cancel = Arc::new(AtomicBool::new(false));
        let walker = Walker::new(&root, dir.path().join("dst"), matcher, cancel);

        let mut seen = Vec::new();
        walker.walk(|obs| seen.push(obs.path_rel), |_, _| {});
        assert_eq!(seen, vec!["keep.txt".to_string()]);
    }

    #[test]
    fn cancel_flag_stops_walk() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("src");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("a.txt"), b"x").unwrap();

        let matcher = Matcher::compile(&[]).unwrap();
        let cancel = Arc::new(AtomicBool::new(true));
        let walker = Walker::new(&root, dir.path().join("dst"), matcher, cancel);

        let mut seen = Vec::new();
        let stats = walker.walk(|obs| seen.push(obs.path_rel), |_, _| {});
        assert!(stats.canceled);
        assert!(seen.is_empty());
    }
}
