//! Remote storage over SFTP-over-SSH.
//!
//! Authentication candidates are gathered up front (password, agent, one key
//! file) and tried in that order. Host keys are checked against
//! `~/.ssh/known_hosts` when that file can be read; when it cannot, any host
//! key is accepted and a warning is logged.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use russh::client::{self, Handle};
use russh::Disconnect;
use russh_keys::key::{KeyPair, PublicKey};
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, StatusCode};

use crate::common::{
    file_name_of, seconds_to_systemtime, unix_seconds, FileInfo, PathConvention, StorageError,
    StorageResult, Visitor, WalkControl, WalkPolicy,
};
use crate::{ReadStream, Storage, WriteStream};

pub const DEFAULT_PORT: u16 = 22;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Key files tried, in order, when no identity file is configured.
const DEFAULT_KEY_FILES: [&str; 2] = ["id_ed25519", "id_rsa"];

#[derive(Debug, Clone)]
pub struct SftpConfig {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub identity_file: Option<PathBuf>,
    pub password: Option<String>,
    pub timeout: Duration,
}

impl SftpConfig {
    pub fn new(user: &str, host: &str) -> Self {
        Self {
            user: user.to_string(),
            host: host.to_string(),
            port: DEFAULT_PORT,
            identity_file: None,
            password: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[cfg(unix)]
type AgentClient = russh_keys::agent::client::AgentClient<tokio::net::UnixStream>;

/// One way of proving who we are to the server.
pub enum AuthMethod {
    Password(String),
    #[cfg(unix)]
    Agent(AgentClient),
    PublicKey { path: PathBuf, key: Arc<KeyPair> },
}

impl AuthMethod {
    pub fn kind(&self) -> &'static str {
        match self {
            AuthMethod::Password(_) => "password",
            #[cfg(unix)]
            AuthMethod::Agent(_) => "agent",
            AuthMethod::PublicKey { .. } => "publickey",
        }
    }
}

impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::PublicKey { path, .. } => write!(f, "PublicKey({})", path.display()),
            other => write!(f, "{}", other.kind()),
        }
    }
}

/// Where to look for credentials besides the explicit configuration.
#[derive(Debug, Clone, Default)]
pub struct AuthSources {
    /// Path of the agent socket, normally `$SSH_AUTH_SOCK`.
    pub agent_socket: Option<String>,
    /// Candidate key files used when no identity file is configured.
    pub default_keys: Vec<PathBuf>,
}

impl AuthSources {
    pub fn from_env() -> Self {
        let agent_socket = std::env::var("SSH_AUTH_SOCK")
            .ok()
            .filter(|s| !s.is_empty());
        let default_keys = ssh_dir()
            .map(|dir| DEFAULT_KEY_FILES.iter().map(|f| dir.join(f)).collect())
            .unwrap_or_default();

        Self {
            agent_socket,
            default_keys,
        }
    }
}

fn ssh_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".ssh"))
}

fn load_key(path: &Path) -> Option<KeyPair> {
    match russh_keys::load_secret_key(path, None) {
        Ok(key) => Some(key),
        Err(e) => {
            log::debug!("skipping key {}: {}", path.display(), e);
            None
        }
    }
}

#[cfg(unix)]
async fn connect_agent(socket: &str) -> Option<AgentClient> {
    match russh_keys::agent::client::AgentClient::connect_uds(socket).await {
        Ok(agent) => Some(agent),
        Err(e) => {
            log::debug!("ssh agent at {} unavailable: {}", socket, e);
            None
        }
    }
}

/// Collect every usable credential, in priority order.
///
/// Nothing is short-circuited: all sources are consulted before connecting.
/// The explicit identity file replaces the default key files; of the default
/// key files only the first loadable one is used.
pub async fn gather_auth_methods(config: &SftpConfig, sources: &AuthSources) -> Vec<AuthMethod> {
    let mut methods = Vec::new();

    if let Some(password) = config.password.as_ref().filter(|p| !p.is_empty()) {
        methods.push(AuthMethod::Password(password.clone()));
    }

    #[cfg(unix)]
    if let Some(socket) = &sources.agent_socket {
        if let Some(agent) = connect_agent(socket).await {
            methods.push(AuthMethod::Agent(agent));
        }
    }

    match &config.identity_file {
        Some(path) => {
            if let Some(key) = load_key(path) {
                methods.push(AuthMethod::PublicKey {
                    path: path.clone(),
                    key: Arc::new(key),
                });
            }
        }
        None => {
            let found = sources
                .default_keys
                .iter()
                .find_map(|path| load_key(path).map(|key| (path.clone(), key)));
            if let Some((path, key)) = found {
                methods.push(AuthMethod::PublicKey {
                    path,
                    key: Arc::new(key),
                });
            }
        }
    }

    methods
}

/// Host key check performed during the SSH handshake.
pub struct HostKeyVerifier {
    host: String,
    port: u16,
    known_hosts: Option<PathBuf>,
}

impl HostKeyVerifier {
    pub fn new(host: &str, port: u16) -> Self {
        let known_hosts = ssh_dir()
            .map(|dir| dir.join("known_hosts"))
            .filter(|path| std::fs::File::open(path).is_ok());

        if known_hosts.is_none() {
            log::warn!(
                "no readable known_hosts file, accepting the host key of {} without verification",
                host
            );
        }

        Self {
            host: host.to_string(),
            port,
            known_hosts,
        }
    }
}

#[async_trait::async_trait]
impl client::Handler for HostKeyVerifier {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self, server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let Some(known_hosts) = &self.known_hosts else {
            return Ok(true);
        };

        match russh_keys::check_known_hosts_path(
            &self.host,
            self.port,
            server_public_key,
            known_hosts,
        ) {
            Ok(true) => Ok(true),
            Ok(false) => {
                log::error!("host key of {} is not in {}", self.host, known_hosts.display());
                Ok(false)
            }
            Err(e) => {
                log::error!("host key verification for {} failed: {}", self.host, e);
                Ok(false)
            }
        }
    }
}

pub struct SftpStorage {
    sftp: SftpSession,
    session: Handle<HostKeyVerifier>,
    target: String,
}

impl SftpStorage {
    /// Connect, authenticate and open the `sftp` subsystem.
    pub async fn connect(config: SftpConfig) -> StorageResult<Self> {
        let methods = gather_auth_methods(&config, &AuthSources::from_env()).await;
        Self::connect_with(config, methods).await
    }

    pub async fn connect_with(config: SftpConfig, methods: Vec<AuthMethod>) -> StorageResult<Self> {
        // 没有任何凭据时不发起网络连接
        if methods.is_empty() {
            return Err(StorageError::NoAuthMethods);
        }

        let target = format!("{}@{}:{}", config.user, config.host, config.port);
        log::debug!(
            "connecting to {} with {:?}",
            target,
            methods.iter().map(AuthMethod::kind).collect::<Vec<_>>()
        );

        let ssh_config = Arc::new(client::Config::default());
        let verifier = HostKeyVerifier::new(&config.host, config.port);
        let addr = (config.host.clone(), config.port);

        // 传输层错误与会话层错误分开报告
        let mut session = tokio::time::timeout(config.timeout, client::connect(ssh_config, addr, verifier))
            .await
            .map_err(|_| StorageError::Transport(format!("connection to {} timed out", target)))?
            .map_err(|e| StorageError::Transport(format!("{}: {}", target, e)))?;

        if !authenticate(&mut session, &config.user, methods).await? {
            let _ = session
                .disconnect(Disconnect::ByApplication, "", "English")
                .await;
            return Err(StorageError::AuthFailed {
                user: config.user.clone(),
                host: config.host.clone(),
            });
        }

        let sftp = match tokio::time::timeout(config.timeout, open_sftp(&session)).await {
            Ok(Ok(sftp)) => sftp,
            Ok(Err(e)) => {
                let _ = session
                    .disconnect(Disconnect::ByApplication, "", "English")
                    .await;
                return Err(e);
            }
            Err(_) => {
                let _ = session
                    .disconnect(Disconnect::ByApplication, "", "English")
                    .await;
                return Err(StorageError::Session(format!("{}: timed out", target)));
            }
        };

        log::debug!("sftp session to {} established", target);

        Ok(Self {
            sftp,
            session,
            target,
        })
    }

    /// 将 SFTP 状态码映射为存储错误
    fn sftp_error(&self, path: &str, err: SftpError) -> StorageError {
        match &err {
            SftpError::Status(status) => match status.status_code {
                StatusCode::NoSuchFile => StorageError::NotFound {
                    path: path.to_string(),
                },
                StatusCode::PermissionDenied => StorageError::PermissionDenied {
                    path: path.to_string(),
                },
                _ => StorageError::Sftp {
                    path: path.to_string(),
                    message: err.to_string(),
                },
            },
            _ => StorageError::Sftp {
                path: path.to_string(),
                message: format!("{} ({})", err, self.target),
            },
        }
    }

    async fn read_dir(&self, dir: &str) -> StorageResult<Vec<(String, FileInfo)>> {
        let entries = self
            .sftp
            .read_dir(wire_path(dir))
            .await
            .map_err(|e| self.sftp_error(dir, e))?;

        // 过滤 . 和 ..，按名称排序以保证遍历顺序
        let mut children: Vec<(String, FileInfo)> = entries
            .filter(|e| e.file_name() != "." && e.file_name() != "..")
            .map(|e| {
                let name = e.file_name();
                let path = child_path(dir, &name);
                let info = attrs_to_info(name, &e.metadata());
                (path, info)
            })
            .collect();
        children.sort_by(|a, b| a.1.name.cmp(&b.1.name));

        Ok(children)
    }
}

async fn authenticate(
    session: &mut Handle<HostKeyVerifier>, user: &str, methods: Vec<AuthMethod>,
) -> StorageResult<bool> {
    let transport = |e: russh::Error| StorageError::Transport(e.to_string());

    // 依次尝试，第一个被接受的方法即认证成功
    for method in methods {
        let kind = method.kind();
        let accepted = match method {
            AuthMethod::Password(password) => session
                .authenticate_password(user, password)
                .await
                .map_err(transport)?,
            #[cfg(unix)]
            AuthMethod::Agent(mut agent) => {
                let identities = match agent.request_identities().await {
                    Ok(keys) => keys,
                    Err(e) => {
                        log::debug!("ssh agent refused to list identities: {}", e);
                        Vec::new()
                    }
                };
                let mut accepted = false;
                for key in identities {
                    let (returned, result) = session.authenticate_future(user, key, agent).await;
                    agent = returned;
                    match result {
                        Ok(true) => {
                            accepted = true;
                            break;
                        }
                        Ok(false) => {}
                        Err(e) => log::debug!("agent signing failed: {}", e),
                    }
                }
                accepted
            }
            AuthMethod::PublicKey { path, key } => {
                log::debug!("trying key {}", path.display());
                session
                    .authenticate_publickey(user, key)
                    .await
                    .map_err(transport)?
            }
        };

        if accepted {
            log::debug!("authenticated as {} using {}", user, kind);
            return Ok(true);
        }
    }

    Ok(false)
}

async fn open_sftp(session: &Handle<HostKeyVerifier>) -> StorageResult<SftpSession> {
    let channel = session
        .channel_open_session()
        .await
        .map_err(|e| StorageError::Session(e.to_string()))?;
    channel
        .request_subsystem(true, "sftp")
        .await
        .map_err(|e| StorageError::Session(e.to_string()))?;
    SftpSession::new(channel.into_stream())
        .await
        .map_err(|e| StorageError::Session(e.to_string()))
}

/// Forward-slash child path, kept verbatim so that relativizing against the
/// walk root never depends on normalization. An empty `dir` is the login
/// directory.
fn child_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// The login directory is spelled `.` on the wire.
fn wire_path(path: &str) -> &str {
    if path.is_empty() {
        "."
    } else {
        path
    }
}

/// Every directory from the top of `path` down to `path` itself, e.g.
/// `/a/b` gives `["/a", "/a/b"]` and `a/./b` gives `["a", "a/b"]`.
fn dir_chain(path: &str) -> Vec<String> {
    let mut current = if path.starts_with('/') {
        "/".to_string()
    } else {
        String::new()
    };

    path.split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .map(|part| {
            current = PathConvention::Posix.join(&current, part);
            current.clone()
        })
        .collect()
}

fn attrs_to_info(name: String, attrs: &FileAttributes) -> FileInfo {
    FileInfo {
        name,
        size: attrs.size.unwrap_or(0),
        mode: attrs.permissions.unwrap_or(0) & 0o7777,
        modified: attrs
            .mtime
            .map(seconds_to_systemtime)
            .unwrap_or(SystemTime::UNIX_EPOCH),
        is_dir: attrs.is_dir(),
    }
}

fn to_wire_seconds(time: SystemTime) -> u32 {
    unix_seconds(time).clamp(0, u32::MAX as i64) as u32
}

#[async_trait::async_trait]
impl Storage for SftpStorage {
    fn name(&self) -> &'static str {
        "sftp"
    }

    fn convention(&self) -> PathConvention {
        PathConvention::Posix
    }

    async fn stat(&self, path: &str) -> StorageResult<FileInfo> {
        let attrs = self
            .sftp
            .metadata(wire_path(path))
            .await
            .map_err(|e| self.sftp_error(path, e))?;
        Ok(attrs_to_info(file_name_of(path), &attrs))
    }

    async fn walk(
        &self, root: &str, policy: WalkPolicy, visitor: &mut dyn Visitor,
    ) -> StorageResult<()> {
        // 显式栈实现深度优先遍历，栈顶为下一个要访问的条目
        let mut pending: Vec<(String, StorageResult<FileInfo>)> =
            vec![(root.to_string(), self.stat(root).await)];

        while let Some((path, info)) = pending.pop() {
            let info = match info {
                Ok(info) => info,
                Err(err) => {
                    let control = visitor.visit(&path, None, Some(&err)).await;
                    if policy == WalkPolicy::FailFast {
                        return Err(err);
                    }
                    if control == WalkControl::Stop {
                        return Ok(());
                    }
                    continue;
                }
            };

            match visitor.visit(&path, Some(&info), None).await {
                WalkControl::Stop => return Ok(()),
                WalkControl::SkipDir => continue,
                WalkControl::Continue => {}
            }

            if !info.is_dir {
                continue;
            }

            match self.read_dir(&path).await {
                Ok(children) => {
                    // 逆序入栈，出栈即为名称顺序
                    pending.extend(children.into_iter().rev().map(|(p, i)| (p, Ok(i))));
                }
                Err(err) => {
                    let control = visitor.visit(&path, None, Some(&err)).await;
                    if policy == WalkPolicy::FailFast {
                        return Err(err);
                    }
                    if control == WalkControl::Stop {
                        return Ok(());
                    }
                }
            }
        }

        Ok(())
    }

    async fn open(&self, path: &str) -> StorageResult<ReadStream> {
        let file = self
            .sftp
            .open(path)
            .await
            .map_err(|e| self.sftp_error(path, e))?;
        Ok(Box::pin(file))
    }

    async fn create(&self, path: &str) -> StorageResult<WriteStream> {
        let file = self
            .sftp
            .create(path)
            .await
            .map_err(|e| self.sftp_error(path, e))?;
        Ok(Box::pin(file))
    }

    async fn remove(&self, path: &str) -> StorageResult<()> {
        self.sftp
            .remove_file(path)
            .await
            .map_err(|e| self.sftp_error(path, e))
    }

    async fn create_dir_all(&self, path: &str) -> StorageResult<()> {
        match self.stat(path).await {
            Ok(info) if info.is_dir => return Ok(()),
            Ok(_) => {
                return Err(StorageError::NotADirectory {
                    path: path.to_string(),
                })
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        // 自顶向下逐级检查，缺失的层级依次创建
        for current in dir_chain(path) {
            match self.stat(&current).await {
                Ok(info) if info.is_dir => continue,
                Ok(_) => return Err(StorageError::NotADirectory { path: current }),
                Err(e) if e.is_not_found() => {
                    self.sftp
                        .create_dir(current.as_str())
                        .await
                        .map_err(|e| self.sftp_error(&current, e))?;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    async fn set_permissions(&self, path: &str, mode: u32) -> StorageResult<()> {
        let mut attrs = FileAttributes::empty();
        attrs.permissions = Some(mode & 0o7777);
        self.sftp
            .set_metadata(path, attrs)
            .await
            .map_err(|e| self.sftp_error(path, e))
    }

    async fn set_times(
        &self, path: &str, accessed: SystemTime, modified: SystemTime,
    ) -> StorageResult<()> {
        let mut attrs = FileAttributes::empty();
        attrs.atime = Some(to_wire_seconds(accessed));
        attrs.mtime = Some(to_wire_seconds(modified));
        self.sftp
            .set_metadata(path, attrs)
            .await
            .map_err(|e| self.sftp_error(path, e))
    }

    async fn close(&self) -> StorageResult<()> {
        // 两步都执行，返回第一个错误
        let closed = self
            .sftp
            .close()
            .await
            .map_err(|e| StorageError::Session(e.to_string()));
        let disconnected = self
            .session
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
            .map_err(|e| StorageError::Transport(e.to_string()));
        closed.and(disconnected)
    }
}
