//! Engine configuration: paths, batch-sizing knobs, and the `DB_URL`
//! environment resolution. The batch window and commit latency are exposed
//! as configuration rather than baked in as constants, per the design
//! notes on batch sizing.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{KeeplyError, Result};

pub const MIN_BATCH_SIZE: usize = 2_000;
pub const MAX_BATCH_SIZE: usize = 10_000;
pub const DEFAULT_BATCH_SIZE: usize = 4_000;
pub const DEFAULT_COMMIT_LATENCY: Duration = Duration::from_millis(400);
pub const DEFAULT_QUEUE_CAPACITY: usize = 50_000;
pub const DEFAULT_ENQUEUE_TIMEOUT: Duration = Duration::from_millis(200);

/// Knobs governing the scan writer's batching policy (C4).
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub commit_latency: Duration,
    pub queue_capacity: usize,
    pub enqueue_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            batch_size: DEFAULT_BATCH_SIZE,
            commit_latency: DEFAULT_COMMIT_LATENCY,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            enqueue_timeout: DEFAULT_ENQUEUE_TIMEOUT,
        }
    }
}

impl BatchConfig {
    pub fn validated(self) -> Result<Self> {
        if !(MIN_BATCH_SIZE..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return Err(KeeplyError::Config(format!(
                "batch_size {} outside allowed range [{MIN_BATCH_SIZE}, {MAX_BATCH_SIZE}]",
                self.batch_size
            )));
        }
        Ok(self)
    }
}

/// Top-level configuration for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub root: PathBuf,
    pub dest: PathBuf,
    pub exclude_patterns: Vec<String>,
    pub encryption_enabled: bool,
    pub batch: BatchConfig,
}

impl EngineConfig {
    pub fn new(root: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Self {
        EngineConfig {
            root: root.into(),
            dest: dest.into(),
            exclude_patterns: Vec::new(),
            encryption_enabled: true,
            batch: BatchConfig::default(),
        }
    }

    pub fn with_excludes(mut self, patterns: Vec<String>) -> Self {
        self.exclude_patterns = patterns;
        self
    }

    /// Validates the root/dest relationship required by the concurrency
    /// model: the destination must not be a prefix of the source root.
    pub fn validate(&self) -> Result<()> {
        if self.root.as_os_str().is_empty() {
            return Err(KeeplyError::Config("root must not be empty".into()));
        }
        if self.dest.as_os_str().is_empty() {
            return Err(KeeplyError::Config("dest must not be empty".into()));
        }
        if is_prefix_of(&self.root, &self.dest) {
            return Err(KeeplyError::Config(
                "destination directory must not be nested inside the source root".into(),
            ));
        }
        self.batch.clone().validated()?;
        Ok(())
    }

    /// Absolute path to this engine's `.keeply` control directory.
    pub fn control_dir(&self) -> PathBuf {
        self.dest.join(".keeply")
    }

    pub fn storage_dir(&self) -> PathBuf {
        self.control_dir().join("storage")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.control_dir().join("LOCK")
    }

    /// Resolves the metadata file location from `DB_URL`, falling back to
    /// `<dest>/.keeply/db.enc`.
    pub fn db_path(&self) -> PathBuf {
        match env::var("DB_URL") {
            Ok(v) if !v.is_empty() => PathBuf::from(v),
            _ => self.control_dir().join("db.enc"),
        }
    }
}

/// True if `maybe_prefix` is an absolute-path prefix of `path`, after
/// normalization. Used both for config validation and by the walker's
/// destination-exclusion check (spec §4.5 step 2).
pub fn is_prefix_of(maybe_prefix: &Path, path: &Path) -> bool {
    let (Ok(prefix), Ok(target)) = (maybe_prefix.canonicalize(), path.canonicalize()) else {
        return lexical_prefix(maybe_prefix, path);
    };
    lexical_prefix(&prefix, &target)
}

fn lexical_prefix(prefix: &Path, path: &Path) -> bool {
    path.starts_with(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_size_out_of_range_is_rejected() {
        let cfg = BatchConfig { batch_size: 1, ..BatchConfig::default() };
        assert!(cfg.validated().is_err());
    }

    #[test]
    fn dest_inside_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let dest = root.join("backups");
        std::fs::create_dir_all(&dest).unwrap();
        let cfg = EngineConfig::new(&root, &dest);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn out_of_range_batch_size_is_rejected_by_validate() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("src");
        let dest = dir.path().join("dst");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&dest).unwrap();
        let mut cfg = EngineConfig::new(&root, &dest);
        cfg.batch.batch_size = 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn sibling_dest_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("src");
        let dest = dir.path().join("dst");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&dest).unwrap();
        let cfg = EngineConfig::new(&root, &dest);
        assert!(cfg.validate().is_ok());
    }
}
