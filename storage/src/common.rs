use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("{path}: no such file or directory")]
    NotFound { path: String },

    #[error("{path}: permission denied")]
    PermissionDenied { path: String },

    #[error("{path}: not a directory")]
    NotADirectory { path: String },

    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("sftp {path}: {message}")]
    Sftp { path: String, message: String },

    #[error("cannot make {target} relative to {base}")]
    RelativePath { base: String, target: String },

    #[error("no SSH authentication method available")]
    NoAuthMethods,

    #[error("SSH authentication failed for {user}@{host}")]
    AuthFailed { user: String, host: String },

    #[error("SSH connection failed: {0}")]
    Transport(String),

    #[error("SFTP session failed: {0}")]
    Session(String),
}

impl StorageError {
    /// Classify an io error raised while operating on `path`.
    pub fn from_io(path: impl AsRef<Path>, err: io::Error) -> Self {
        let path = path.as_ref().display().to_string();
        match err.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound { path },
            io::ErrorKind::PermissionDenied => StorageError::PermissionDenied { path },
            _ => StorageError::Io { path, source: err },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, StorageError::PermissionDenied { .. })
    }
}

/// Snapshot of one entry's metadata, as returned by `stat` or a walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Base name of the entry
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Permission bits only (`0o7777` mask)
    pub mode: u32,
    /// Last modification time
    pub modified: SystemTime,
    pub is_dir: bool,
}

/// Seconds since the epoch, floored, so that sub-second precision never
/// distinguishes two timestamps.
pub fn unix_seconds(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => {
            let d = e.duration();
            let whole = d.as_secs() as i64;
            if d.subsec_nanos() > 0 {
                -whole - 1
            } else {
                -whole
            }
        }
    }
}

pub fn seconds_to_systemtime(seconds: u32) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(seconds.into())
}

/// How paths are spelled on one filesystem.
///
/// Every storage handle reports its convention; the engine joins and
/// relativizes through it instead of asking which backend it talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathConvention {
    /// The host platform's rules (`\` on Windows, `/` elsewhere).
    Native,
    /// Forward slashes regardless of host, as spoken by SFTP servers.
    Posix,
}

impl PathConvention {
    pub fn separator(self) -> char {
        match self {
            PathConvention::Native => std::path::MAIN_SEPARATOR,
            PathConvention::Posix => '/',
        }
    }

    pub fn join(self, base: &str, rel: &str) -> String {
        match self {
            PathConvention::Native => Path::new(base).join(rel).to_string_lossy().into_owned(),
            PathConvention::Posix => {
                let rel = rel.trim_start_matches('/');
                if rel.is_empty() {
                    base.to_string()
                } else if base.is_empty() {
                    rel.to_string()
                } else if base.ends_with('/') {
                    format!("{}{}", base, rel)
                } else {
                    format!("{}/{}", base, rel)
                }
            }
        }
    }

    pub fn parent(self, path: &str) -> String {
        match self {
            PathConvention::Native => Path::new(path)
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|| ".".to_string()),
            PathConvention::Posix => {
                let trimmed = path.trim_end_matches('/');
                match trimmed.rfind('/') {
                    Some(0) => "/".to_string(),
                    Some(idx) => trimmed[..idx].to_string(),
                    None if path.starts_with('/') => "/".to_string(),
                    None => ".".to_string(),
                }
            }
        }
    }

    /// Path of `target` relative to `base`, in this convention.
    pub fn relative(self, base: &str, target: &str) -> StorageResult<String> {
        let err = || StorageError::RelativePath {
            base: base.to_string(),
            target: target.to_string(),
        };

        match self {
            PathConvention::Native => Path::new(target)
                .strip_prefix(base)
                .map(|p| p.to_string_lossy().into_owned())
                .map_err(|_| err()),
            PathConvention::Posix => {
                // 空根目录即登录目录，子路径本身就是相对路径
                if base.is_empty() {
                    return Ok(target.to_string());
                }
                let prefix = if base.ends_with('/') {
                    base.to_string()
                } else {
                    format!("{}/", base)
                };
                target
                    .strip_prefix(prefix.as_str())
                    .map(str::to_string)
                    .ok_or_else(err)
            }
        }
    }

    /// Re-spell a relative path produced under `self` for use under `to`.
    pub fn translate(self, rel: &str, to: PathConvention) -> String {
        let from_sep = self.separator();
        let to_sep = to.separator();
        if from_sep == to_sep {
            return rel.to_string();
        }
        rel.split(from_sep)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(&to_sep.to_string())
    }
}

/// What the walker should do after a visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkControl {
    Continue,
    /// Do not descend into the directory just visited.
    SkipDir,
    /// End the walk successfully.
    Stop,
}

/// How a walk treats entries it cannot read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WalkPolicy {
    /// Report the error to the visitor and keep going.
    #[default]
    Tolerant,
    /// Report the error to the visitor, then end the walk with that error.
    FailFast,
}

/// Callback driven by [`crate::Storage::walk`].
///
/// `info` is absent when the entry could not be read; `err` then carries the
/// reason.
#[async_trait::async_trait]
pub trait Visitor: Send {
    async fn visit(
        &mut self, path: &str, info: Option<&FileInfo>, err: Option<&StorageError>,
    ) -> WalkControl;
}

pub(crate) fn file_name_of(path: &str) -> String {
    PathBuf::from(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}
