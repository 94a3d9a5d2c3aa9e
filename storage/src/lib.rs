pub mod common;
pub mod file;
pub mod path;
pub mod sftp;

pub use common::*;
pub use file::*;
pub use path::*;
pub use sftp::{AuthMethod, AuthSources, SftpConfig, SftpStorage};

use std::path::PathBuf;
use std::pin::Pin;
use std::time::{Duration, SystemTime};

use tokio::io::{AsyncRead, AsyncWrite};

pub type ReadStream = Pin<Box<dyn AsyncRead + Send>>;
pub type WriteStream = Pin<Box<dyn AsyncWrite + Send>>;

/// Operations the sync engine needs from a filesystem.
///
/// Paths are plain strings spelled in the storage's own [`PathConvention`].
#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    /// Short backend label used in log lines
    fn name(&self) -> &'static str;

    fn convention(&self) -> PathConvention;

    async fn stat(&self, path: &str) -> StorageResult<FileInfo>;

    /// Depth-first traversal of `root`, entries of a directory in name order.
    ///
    /// Every entry reaches the visitor, unreadable ones included; whether the
    /// walk goes on after an error is decided by `policy` and the visitor.
    async fn walk(
        &self, root: &str, policy: WalkPolicy, visitor: &mut dyn Visitor,
    ) -> StorageResult<()>;

    async fn open(&self, path: &str) -> StorageResult<ReadStream>;

    /// Create or truncate `path`. The parent directory must exist.
    async fn create(&self, path: &str) -> StorageResult<WriteStream>;

    /// Remove one file. Directories are refused.
    async fn remove(&self, path: &str) -> StorageResult<()>;

    async fn create_dir_all(&self, path: &str) -> StorageResult<()>;

    async fn set_permissions(&self, path: &str, mode: u32) -> StorageResult<()>;

    async fn set_times(
        &self, path: &str, accessed: SystemTime, modified: SystemTime,
    ) -> StorageResult<()>;

    /// Release the underlying connection. Call exactly once.
    async fn close(&self) -> StorageResult<()>;
}

/// Connection settings shared by every remote endpoint of a run.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub port: u16,
    pub identity_file: Option<PathBuf>,
    pub password: Option<String>,
    pub timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            port: sftp::DEFAULT_PORT,
            identity_file: None,
            password: None,
            timeout: sftp::DEFAULT_TIMEOUT,
        }
    }
}

/// 根据端点类型创建对应的存储实例
pub async fn create_storage(
    endpoint: &Endpoint, options: &ConnectOptions,
) -> StorageResult<Box<dyn Storage>> {
    if !endpoint.is_remote {
        return Ok(Box::new(LocalStorage::new()));
    }

    let user = match &endpoint.user {
        Some(user) => user.clone(),
        None => current_user()?,
    };
    let host = endpoint.host.clone().unwrap_or_default();

    let config = SftpConfig {
        user,
        host,
        port: options.port,
        identity_file: options.identity_file.clone(),
        password: options.password.clone(),
        timeout: options.timeout,
    };

    Ok(Box::new(SftpStorage::connect(config).await?))
}

/// Name of the invoking user, used when an endpoint has no `user@` part.
fn current_user() -> StorageResult<String> {
    ["USER", "USERNAME", "LOGNAME"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
        .ok_or_else(|| StorageError::Transport("cannot determine current user".to_string()))
}
