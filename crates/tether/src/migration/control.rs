use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::debug;

use tether_api::MigrationState;

#[derive(Debug)]
struct ControlInner {
    state: MigrationState,
    cancel_requested: bool,
}

/// State shared between a manager and its handles.
#[derive(Debug)]
pub(crate) struct MigrationControl {
    inner: Mutex<ControlInner>,
    wake: Notify,
}

/// What the run loop should do at a batch boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Checkpoint {
    Continue,
    Cancel,
}

impl MigrationControl {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(ControlInner {
                state: MigrationState::Idle,
                cancel_requested: false,
            }),
            wake: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControlInner> {
        // The guarded data is two plain fields; a poisoned lock is still usable
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn state(&self) -> MigrationState {
        self.lock().state
    }

    /// Move `Idle` to `Running`. Returns the current state if the run was
    /// already started.
    pub(crate) fn start(&self) -> Result<(), MigrationState> {
        let mut inner = self.lock();
        if inner.state != MigrationState::Idle {
            return Err(inner.state);
        }
        inner.state = MigrationState::Running;
        Ok(())
    }

    pub(crate) fn finish(&self, state: MigrationState) {
        self.lock().state = state;
        self.wake.notify_one();
    }

    /// Block while paused. Returns `Cancel` once a cancel request is seen.
    pub(crate) async fn checkpoint(&self) -> Checkpoint {
        loop {
            {
                let inner = self.lock();
                if inner.cancel_requested {
                    return Checkpoint::Cancel;
                }
                if inner.state != MigrationState::Paused {
                    return Checkpoint::Continue;
                }
            }
            // notify_one stores a permit, so a resume between the check and
            // this await is not lost
            self.wake.notified().await;
        }
    }

    fn pause(&self) {
        let mut inner = self.lock();
        if inner.state == MigrationState::Running && !inner.cancel_requested {
            inner.state = MigrationState::Paused;
        } else {
            debug!("Ignoring pause while {}", inner.state);
        }
    }

    fn resume(&self) {
        let mut inner = self.lock();
        if inner.state == MigrationState::Paused {
            inner.state = MigrationState::Running;
            drop(inner);
            self.wake.notify_one();
        } else {
            debug!("Ignoring resume while {}", inner.state);
        }
    }

    fn cancel(&self) {
        let mut inner = self.lock();
        match inner.state {
            MigrationState::Running | MigrationState::Paused => {
                inner.cancel_requested = true;
                drop(inner);
                self.wake.notify_one();
            }
            state => debug!("Ignoring cancel while {}", state),
        }
    }
}

/// Cloneable control surface for a running migration.
///
/// Signals are fire-and-forget. A signal that is not valid for the current
/// state (pausing a paused run, resuming a running one, anything after a
/// terminal state) is ignored.
#[derive(Debug, Clone)]
pub struct MigrationHandle {
    control: Arc<MigrationControl>,
}

impl MigrationHandle {
    pub(crate) fn new(control: Arc<MigrationControl>) -> Self {
        Self { control }
    }

    /// Pause after the batch in flight.
    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    /// Stop after the batch in flight. Records already written stay.
    pub fn cancel(&self) {
        self.control.cancel();
    }

    pub fn state(&self) -> MigrationState {
        self.control.state()
    }
}
