/// Sink for the engine's user-facing messages.
///
/// One info line per copy, update or delete; one error line per entry that
/// could not be handled. Messages arrive fully formatted.
pub trait Reporter: Send + Sync {
    fn info(&self, message: &str);
    fn error(&self, message: &str);
}

/// Forwards to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn info(&self, message: &str) {
        log::info!("{}", message);
    }

    fn error(&self, message: &str) {
        log::error!("{}", message);
    }
}
