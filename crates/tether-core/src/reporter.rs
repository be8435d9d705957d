use tether_api::MigrationProgress;

/// Observer for migration runs.
///
/// `on_progress` fires once per processed batch. Exactly one of
/// `on_complete`, `on_error` and `on_cancelled` fires per run.
pub trait ProgressReporter: Send + Sync {
    fn on_progress(&self, _progress: &MigrationProgress) {}

    fn on_error(&self, _error: &(dyn std::error::Error + Send + Sync + 'static)) {}

    fn on_complete(&self) {}

    fn on_cancelled(&self) {}
}

/// Reporter that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {}
