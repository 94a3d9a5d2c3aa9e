use std::path::PathBuf;

use clap::{Parser, Subcommand};
use utils::app_config::AppConfig;

mod commands;

#[derive(Parser)]
#[command(name = "rust-treesync", version)]
#[command(about = "One-way directory sync between local paths and SFTP endpoints", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Set the logging level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Make TARGET mirror SOURCE. Either side may be `[user@]host:path`.
    Sync {
        /// Source directory
        source: String,

        /// Target directory, created when missing
        target: String,

        /// Delete target files that are not in the source
        #[arg(short, long)]
        delete_missing: bool,

        /// Compare files by SHA-256 instead of size and mtime
        #[arg(short, long)]
        checksum: bool,

        /// Private key used for SSH authentication
        #[arg(short, long, value_name = "FILE")]
        identity: Option<PathBuf>,

        /// SSH port
        #[arg(short, long)]
        port: Option<u16>,

        /// SSH password, tried before the agent and key files
        #[arg(long)]
        password: Option<String>,

        /// Configuration file path
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// SSH connect timeout in seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },
}

/// Layer the command line on top of the loaded configuration.
fn apply_overrides(cli: &Cli) -> utils::error::Result<()> {
    let Commands::Sync {
        delete_missing,
        checksum,
        identity,
        port,
        config,
        timeout,
        ..
    } = &cli.command;

    AppConfig::merge_config(config.as_deref())?;

    if let Some(level) = &cli.log_level {
        AppConfig::set("log.level", level)?;
    }
    if *delete_missing {
        AppConfig::set("sync.delete_missing", "true")?;
    }
    if *checksum {
        AppConfig::set("sync.checksum", "true")?;
    }
    if let Some(identity) = identity {
        AppConfig::set("sync.identity_file", &identity.to_string_lossy())?;
    }
    if let Some(port) = port {
        AppConfig::set("sync.port", &port.to_string())?;
    }
    if let Some(timeout) = timeout {
        AppConfig::set("sync.connect_timeout", &timeout.to_string())?;
    }

    Ok(())
}

pub async fn cli_match() -> utils::error::Result<()> {
    let cli = Cli::parse();

    apply_overrides(&cli)?;

    // 覆盖项生效后再初始化日志，保证日志级别正确
    let _guard = utils::logger::setup_logging()?;

    match cli.command {
        Commands::Sync {
            source,
            target,
            password,
            ..
        } => commands::sync_cmd(source, target, password).await?,
    }

    Ok(())
}
