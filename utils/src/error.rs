use std::sync::PoisonError;

/// Result alias used at the binary boundary.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error. Library crates keep their own error enums and are wrapped
/// here through [`Error::with_source`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Message(String),

    #[error("{msg}: {source}")]
    WithSource {
        msg: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    SetLogger(#[from] log::SetLoggerError),
}

impl Error {
    pub fn new(msg: &str) -> Self {
        Error::Message(msg.to_string())
    }

    pub fn with_source(msg: &str, source: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Error::WithSource {
            msg: msg.to_string(),
            source,
        }
    }
}

// 配置锁被毒化时只保留描述信息
impl<T> From<PoisonError<T>> for Error {
    fn from(err: PoisonError<T>) -> Self {
        Error::Message(format!("configuration lock poisoned: {}", err))
    }
}
