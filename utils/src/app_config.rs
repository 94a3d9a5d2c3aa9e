use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::RwLock;

use super::error::Result;

/// Prefix of environment overrides, e.g. `TREESYNC__SYNC__PORT=2222`.
const ENV_PREFIX: &str = "TREESYNC";

lazy_static! {
    static ref BUILDER: RwLock<ConfigBuilder<DefaultState>> = RwLock::new(Config::builder());
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// debug, info, warn or error
    pub level: String,
    /// Optional log file; terminal only when absent
    pub file: Option<String>,
}

/// Defaults for the sync command. Command-line flags take precedence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub port: u16,
    pub delete_missing: bool,
    pub checksum: bool,
    /// SSH connect timeout in seconds
    pub connect_timeout: u64,
    pub identity_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub log: LogConfig,
    pub sync: SyncConfig,
}

impl AppConfig {
    /// Reset the configuration to the embedded defaults plus environment overrides.
    pub fn init(default_config: Option<&str>) -> Result<()> {
        let mut builder = Config::builder();

        if let Some(contents) = default_config {
            builder = builder.add_source(File::from_str(contents, FileFormat::Toml));
        }

        builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

        let mut w = BUILDER.write()?;
        *w = builder;

        Ok(())
    }

    /// Layer a user supplied TOML file over the defaults. Environment
    /// variables still win over the file.
    pub fn merge_config(config_file: Option<&Path>) -> Result<()> {
        if let Some(path) = config_file {
            let mut w = BUILDER.write()?;
            // 后加入的源优先级更高：文件之后重新挂上环境变量
            *w = w
                .clone()
                .add_source(File::from(path).format(FileFormat::Toml))
                .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));
        }
        Ok(())
    }

    /// Override a single key, e.g. `AppConfig::set("log.level", "debug")`.
    pub fn set(key: &str, value: &str) -> Result<()> {
        let mut w = BUILDER.write()?;
        *w = w.clone().set_override(key, value)?;
        Ok(())
    }

    pub fn get<'de, T>(key: &'de str) -> Result<T>
    where
        T: serde::Deserialize<'de>,
    {
        let r = BUILDER.read()?;
        Ok(r.clone().build()?.get::<T>(key)?)
    }

    pub fn fetch() -> Result<AppConfig> {
        let r = BUILDER.read()?;
        let config = r.clone().build()?;
        Ok(config.try_deserialize()?)
    }
}
