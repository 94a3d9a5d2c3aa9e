//! 同步模块：从源端到目标端的单向目录树同步

pub mod compare;
pub mod copy;
pub mod report;
mod sync;

pub use compare::CompareStrategy;
pub use copy::copy_file;
pub use report::{LogReporter, Reporter};
pub use sync::Syncer;

use std::path::PathBuf;
use std::time::Duration;
use storage::{ConnectOptions, StorageError};

/// Everything a run needs, as resolved by the command line and configuration.
#[derive(Debug, Clone)]
pub struct SyncParams {
    /// Source endpoint, local path or `[user@]host:path`
    pub source: String,
    /// Target endpoint, local path or `[user@]host:path`
    pub target: String,
    /// Remove target files that no longer exist in the source
    pub delete_missing: bool,
    /// Compare by SHA-256 instead of size and mtime
    pub checksum: bool,
    pub identity_file: Option<String>,
    pub port: u16,
    pub password: Option<String>,
    /// SSH connect timeout in seconds
    pub connect_timeout: u64,
}

impl Default for SyncParams {
    fn default() -> Self {
        Self {
            source: String::from("."),
            target: String::from("."),
            delete_missing: false,
            checksum: false,
            identity_file: None,
            port: 22,
            password: None,
            connect_timeout: 10,
        }
    }
}

impl SyncParams {
    pub fn strategy(&self) -> CompareStrategy {
        if self.checksum {
            CompareStrategy::Checksum
        } else {
            CompareStrategy::Metadata
        }
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            port: self.port,
            identity_file: self.identity_file.as_ref().map(PathBuf::from),
            password: self.password.clone(),
            timeout: Duration::from_secs(self.connect_timeout),
        }
    }
}

/// Counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub copied: u64,
    pub updated: u64,
    pub deleted: u64,
    pub unchanged: u64,
    pub errors: u64,
    pub bytes: u64,
}

/// Terminal errors of a run. Per-entry problems never show up here; they are
/// reported and counted in [`SyncStats::errors`].
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("source: {0}")]
    Source(#[source] StorageError),

    #[error("target: {0}")]
    Target(#[source] StorageError),

    #[error("source {0} is not a directory")]
    SourceNotDirectory(String),

    #[error("cannot prepare target directory: {0}")]
    PrepareTarget(#[source] StorageError),

    #[error("walk aborted: {0}")]
    Walk(#[source] StorageError),

    #[error("{path}: content copied but metadata not applied: {source}")]
    PartialCopy {
        path: String,
        #[source]
        source: StorageError,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("closing {backend} storage: {source}")]
    Release {
        backend: &'static str,
        #[source]
        source: StorageError,
    },
}
