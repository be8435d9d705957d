//! Migration progress snapshots and legacy source pages.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a migration run.
///
/// `Idle` is initial; `Completed`, `Cancelled` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    Idle,
    Running,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl MigrationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MigrationState::Completed | MigrationState::Cancelled | MigrationState::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationState::Idle => "idle",
            MigrationState::Running => "running",
            MigrationState::Paused => "paused",
            MigrationState::Completed => "completed",
            MigrationState::Cancelled => "cancelled",
            MigrationState::Failed => "failed",
        }
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Snapshot of a running migration, handed to `on_progress` once per batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationProgress {
    pub current_step: String,
    /// Unknown until the legacy source reports it
    pub total_records: Option<usize>,
    pub processed_records: usize,
    /// Per-record failures, in the order they happened
    pub errors: Vec<String>,
}

impl MigrationProgress {
    pub fn new(current_step: impl Into<String>) -> Self {
        Self {
            current_step: current_step.into(),
            ..Default::default()
        }
    }

    /// `processed / total * 100`, clamped to `[0, 100]`; zero while the total
    /// is unknown.
    pub fn percent_complete(&self) -> f64 {
        match self.total_records {
            Some(0) => 100.0,
            Some(total) => {
                let pct = self.processed_records as f64 / total as f64 * 100.0;
                pct.clamp(0.0, 100.0)
            }
            None => 0.0,
        }
    }

    /// Record a newly discovered total, never letting it drop below the
    /// number of records already processed.
    pub fn update_total(&mut self, total: usize) {
        self.total_records = Some(total.max(self.processed_records));
    }

    /// Count records as processed, raising a known total if the source
    /// under-reported it.
    pub fn advance(&mut self, count: usize) {
        self.processed_records += count;
        if let Some(total) = self.total_records {
            if total < self.processed_records {
                self.total_records = Some(self.processed_records);
            }
        }
    }
}

/// One record read from the legacy source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyRecord {
    pub table_name: String,
    pub record_id: String,
    pub data: serde_json::Value,
}

impl LegacyRecord {
    pub fn new(
        table_name: impl Into<String>,
        record_id: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            record_id: record_id.into(),
            data,
        }
    }
}

/// A page read from the legacy source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LegacyBatch {
    pub records: Vec<LegacyRecord>,
    /// Total record count, if the source knows it by now
    pub total_hint: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_terminal_states() {
        assert!(!MigrationState::Idle.is_terminal());
        assert!(!MigrationState::Running.is_terminal());
        assert!(!MigrationState::Paused.is_terminal());
        assert!(MigrationState::Completed.is_terminal());
        assert!(MigrationState::Cancelled.is_terminal());
        assert!(MigrationState::Failed.is_terminal());
    }

    #[test]
    fn test_percent_unknown_total() {
        let mut progress = MigrationProgress::new("copying");
        progress.advance(40);
        assert_eq!(progress.percent_complete(), 0.0);

        progress.update_total(80);
        assert_eq!(progress.percent_complete(), 50.0);
    }

    #[test]
    fn test_total_never_below_processed() {
        let mut progress = MigrationProgress::new("copying");
        progress.update_total(10);
        progress.advance(15);
        assert_eq!(progress.total_records, Some(15));

        progress.update_total(3);
        assert_eq!(progress.total_records, Some(15));
    }

    proptest! {
        #[test]
        fn prop_percent_is_clamped(processed in 0usize..10_000, total in 0usize..10_000) {
            let mut progress = MigrationProgress::new("copying");
            progress.update_total(total);
            progress.advance(processed);
            let pct = progress.percent_complete();
            prop_assert!((0.0..=100.0).contains(&pct));
            prop_assert!(progress.processed_records <= progress.total_records.unwrap());
        }
    }
}
