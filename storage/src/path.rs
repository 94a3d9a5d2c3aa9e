//! Endpoint address parsing.
//!
//! An endpoint is either a local path or `[user@]host:path`. The split is a
//! pure string transform: nothing is looked up on disk or on the network.

/// One side of a sync run, as written by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub is_remote: bool,
    pub user: Option<String>,
    pub host: Option<String>,
    /// Local path, or the path on the remote host (may be relative or empty).
    pub path: String,
}

impl Endpoint {
    /// Classify `raw` as local or remote.
    ///
    /// The first colon separates host from path, except when at most one
    /// character precedes it: `C:\data` is a drive letter, so a one-character
    /// host name can never be addressed remotely.
    pub fn parse(raw: &str) -> Self {
        let Some(colon) = raw.find(':') else {
            return Self::local(raw);
        };

        // 冒号前只有一个字符时视为盘符
        let host_part = &raw[..colon];
        if host_part.len() <= 1 {
            return Self::local(raw);
        }

        let path = raw[colon + 1..].to_string();

        let (user, host) = match host_part.split_once('@') {
            Some((user, host)) => {
                let user = (!user.is_empty()).then(|| user.to_string());
                (user, host.to_string())
            }
            None => (None, host_part.to_string()),
        };

        Self {
            is_remote: true,
            user,
            host: Some(host),
            path,
        }
    }

    pub fn local(path: &str) -> Self {
        Self {
            is_remote: false,
            user: None,
            host: None,
            path: path.to_string(),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.user, &self.host) {
            (Some(user), Some(host)) => write!(f, "{}@{}:{}", user, host, self.path),
            (None, Some(host)) => write!(f, "{}:{}", host, self.path),
            _ => write!(f, "{}", self.path),
        }
    }
}
