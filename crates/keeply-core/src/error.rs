//! The error taxonomy shared across every component.

use std::path::PathBuf;

use thiserror::Error;

/// The seven error kinds named by the engine's failure model.
///
/// `Canceled` is not really an error: callers that reach it should treat the
/// operation as having completed with a `CANCELED` status, not as a fault.
#[derive(Debug, Error)]
pub enum KeeplyError {
    #[error("config error: {0}")]
    Config(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("bad format: {0}")]
    BadFormat(String),

    #[error("bad passphrase")]
    BadPassphrase,

    #[error("plaintext store present at {0}; automatic migration is not supported")]
    PlainStorePresent(PathBuf),

    #[error("migration failed: {0}")]
    DbMigration(String),

    #[error("operation canceled")]
    Canceled,

    #[error("sqlite error: {0}")]
    Db(#[from] rusqlite::Error),
}

impl KeeplyError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        KeeplyError::Io { path: path.into(), source }
    }

    /// Exit code a CLI front-end should use for this error, per the
    /// documented `scan` exit-code contract (0 success, 1 runtime error,
    /// 2 usage error).
    pub fn exit_code(&self) -> i32 {
        match self {
            KeeplyError::Config(_) => 2,
            KeeplyError::Canceled => 0,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, KeeplyError>;
