use std::fmt;
use tokio::sync::mpsc;

use tether_api::MigrationProgress;
use tether_core::ProgressReporter;

type ProgressFn = Box<dyn Fn(&MigrationProgress) + Send + Sync>;
type ErrorFn = Box<dyn Fn(&(dyn std::error::Error + Send + Sync + 'static)) + Send + Sync>;
type SignalFn = Box<dyn Fn() + Send + Sync>;

/// Reporter built from closures. Unset callbacks do nothing.
///
/// ```ignore
/// let reporter = CallbackReporter::new()
///     .on_progress(|p| println!("{:.0}%", p.percent_complete()))
///     .on_complete(|| println!("done"));
/// ```
#[derive(Default)]
pub struct CallbackReporter {
    progress: Option<ProgressFn>,
    error: Option<ErrorFn>,
    complete: Option<SignalFn>,
    cancelled: Option<SignalFn>,
}

impl CallbackReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_progress(mut self, f: impl Fn(&MigrationProgress) + Send + Sync + 'static) -> Self {
        self.progress = Some(Box::new(f));
        self
    }

    pub fn on_error(
        mut self,
        f: impl Fn(&(dyn std::error::Error + Send + Sync + 'static)) + Send + Sync + 'static,
    ) -> Self {
        self.error = Some(Box::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.complete = Some(Box::new(f));
        self
    }

    pub fn on_cancelled(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.cancelled = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for CallbackReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackReporter")
            .field("progress", &self.progress.is_some())
            .field("error", &self.error.is_some())
            .field("complete", &self.complete.is_some())
            .field("cancelled", &self.cancelled.is_some())
            .finish()
    }
}

impl ProgressReporter for CallbackReporter {
    fn on_progress(&self, progress: &MigrationProgress) {
        if let Some(f) = &self.progress {
            f(progress);
        }
    }

    fn on_error(&self, error: &(dyn std::error::Error + Send + Sync + 'static)) {
        if let Some(f) = &self.error {
            f(error);
        }
    }

    fn on_complete(&self) {
        if let Some(f) = &self.complete {
            f();
        }
    }

    fn on_cancelled(&self) {
        if let Some(f) = &self.cancelled {
            f();
        }
    }
}

/// Reporter notifications as values.
#[derive(Debug, Clone, PartialEq)]
pub enum MigrationEvent {
    Progress(MigrationProgress),
    Error(String),
    Completed,
    Cancelled,
}

impl MigrationEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, MigrationEvent::Progress(_))
    }
}

/// Forwards every notification into an unbounded channel, for UIs that
/// consume progress on another task.
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: mpsc::UnboundedSender<MigrationEvent>,
}

impl ChannelReporter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MigrationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: MigrationEvent) {
        // A dropped receiver just means nobody is listening any more
        let _ = self.tx.send(event);
    }
}

impl ProgressReporter for ChannelReporter {
    fn on_progress(&self, progress: &MigrationProgress) {
        self.send(MigrationEvent::Progress(progress.clone()));
    }

    fn on_error(&self, error: &(dyn std::error::Error + Send + Sync + 'static)) {
        self.send(MigrationEvent::Error(error.to_string()));
    }

    fn on_complete(&self) {
        self.send(MigrationEvent::Completed);
    }

    fn on_cancelled(&self) {
        self.send(MigrationEvent::Cancelled);
    }
}
