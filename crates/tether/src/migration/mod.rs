//! One-time migration of legacy records into the local store
//!
//! - `manager`: batch loop and state machine
//! - `control`: pause/resume/cancel handle shared with the run loop
//! - `reporter`: ready-made progress reporters

mod control;
mod manager;
mod reporter;

pub use control::MigrationHandle;
pub use manager::{MigrationConfig, MigrationManager, MigrationManagerBuilder, MigrationOutcome};
pub use reporter::{CallbackReporter, ChannelReporter, MigrationEvent};
