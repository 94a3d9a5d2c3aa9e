use slog::o;
use slog::Drain;
use slog::Level;
use slog::LevelFilter;

use std::fs::OpenOptions;
use std::path::Path;

use super::error::Result;
use crate::app_config::{AppConfig, LogConfig};

/// Install the global slog logger and route the `log` facade into it.
///
/// The returned guard must stay alive for the whole run; dropping it flushes
/// the async drains.
pub fn setup_logging() -> Result<slog_scope::GlobalLoggerGuard> {
    let guard = slog_scope::set_global_logger(default_root_logger()?);
    slog_stdlog::init_with_level(log_level_filter())?;

    Ok(guard)
}

pub fn default_root_logger() -> Result<slog::Logger> {
    let config = log_config();
    let level = parse_level(&config.level);

    let term_drain = default_term_drain()?;

    // 仅在配置了日志文件时才写文件
    let drain = match config.file.as_deref().filter(|f| !f.is_empty()) {
        Some(file) => {
            let file_drain = default_file_drain(Path::new(file)).unwrap_or(default_discard()?);
            slog::Duplicate(term_drain, file_drain).fuse()
        }
        None => slog::Duplicate(term_drain, default_discard()?).fuse(),
    };

    let drain = LevelFilter::new(drain, level).fuse();

    Ok(slog::Logger::root(drain, o!()))
}

fn log_config() -> LogConfig {
    AppConfig::get::<LogConfig>("log").unwrap_or(LogConfig {
        level: "info".to_string(),
        file: None,
    })
}

/// Map the configured level name onto a slog level. Unknown names fall back to info.
pub fn parse_level(level: &str) -> Level {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Level::Trace,
        "debug" => Level::Debug,
        "info" => Level::Info,
        "warn" | "warning" => Level::Warning,
        "error" => Level::Error,
        _ => Level::Info,
    }
}

fn log_level_filter() -> log::Level {
    match parse_level(&log_config().level) {
        Level::Critical | Level::Error => log::Level::Error,
        Level::Warning => log::Level::Warn,
        Level::Info => log::Level::Info,
        Level::Debug => log::Level::Debug,
        Level::Trace => log::Level::Trace,
    }
}

fn default_discard() -> Result<slog_async::Async> {
    let drain = slog_async::Async::new(slog::Discard).chan_size(1024).build();

    Ok(drain)
}

// term drain: plain text to stdout
#[cfg(not(feature = "termlog"))]
fn default_term_drain() -> Result<slog_async::Async> {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let term = slog_term::FullFormat::new(plain).use_custom_timestamp(slog_term::timestamp_local);

    let drain = slog_async::Async::new(term.build().fuse())
        .chan_size(1024)
        .build();

    Ok(drain)
}

// term drain: colored output when stdout is a terminal
#[cfg(feature = "termlog")]
fn default_term_drain() -> Result<slog_async::Async> {
    let decorator = slog_term::TermDecorator::new().stdout().build();
    let term = slog_term::CompactFormat::new(decorator)
        .use_custom_timestamp(slog_term::timestamp_local);

    let drain = slog_async::Async::new(term.build().fuse())
        .chan_size(1024)
        .build();

    Ok(drain)
}

// file drain: append to the configured log file
fn default_file_drain(log_file: &Path) -> Result<slog_async::Async> {
    if let Some(dir) = log_file.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }

    let file = OpenOptions::new().create(true).append(true).open(log_file)?;

    let decorator = slog_term::PlainSyncDecorator::new(file);
    let formatter = slog_term::FullFormat::new(decorator)
        .use_file_location()
        .use_custom_timestamp(slog_term::timestamp_local)
        .build()
        .fuse();

    let drain = slog_async::Async::new(formatter).chan_size(1024).build();

    Ok(drain)
}
