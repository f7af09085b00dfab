//! A local, incremental, content-addressed file backup engine with an
//! AES-GCM-encrypted embedded metadata store.
//!
//! The engine is the composition of nine components: a path matcher, the
//! file-envelope crypto, the metadata store, the scan writer, the
//! filesystem walker, the diff/history engine, the content-addressed blob
//! vault, the backup driver, and the restore engine. [`driver::run_backup`]
//! and the [`restore`] operations are the two entry points most callers
//! need; the rest is exposed for callers (CLI, UI, schedulers) that need
//! finer-grained control.

pub mod config;
pub mod crypto;
pub mod diff;
pub mod driver;
pub mod error;
mod fsutil;
pub mod ids;
pub mod matcher;
pub mod restore;
pub mod scan_writer;
pub mod store;
pub mod telemetry;
pub mod vault;
pub mod walker;

pub use config::EngineConfig;
pub use driver::{run_backup, BackupOutcome, RunStatus};
pub use error::{KeeplyError, Result};
pub use store::{BackupRunLog, BackupType, MetadataStore};
pub use vault::BlobVault;
