//! Sync queue entries, conflict records and remote push outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{now_millis, RecordKey};

/// Kind of local mutation carried by a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

impl SyncOperation {
    /// Convert operation to string for database storage
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOperation::Create => "CREATE",
            SyncOperation::Update => "UPDATE",
            SyncOperation::Delete => "DELETE",
        }
    }

    /// Parse operation from database string
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "CREATE" => Some(SyncOperation::Create),
            "UPDATE" => Some(SyncOperation::Update),
            "DELETE" => Some(SyncOperation::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a queue entry.
///
/// `Failed` is the terminal classification for entries that ran out of
/// retries; they stay in the queue until requeued by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Synced,
    Failed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Synced => "synced",
            EntryStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EntryStatus::Pending),
            "synced" => Some(EntryStatus::Synced),
            "failed" => Some(EntryStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One queued local mutation awaiting remote application.
///
/// Table name: `sync_queue`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueEntry {
    pub id: String,
    pub table_name: String,
    pub record_id: String,
    pub operation: SyncOperation,
    /// Full record for CREATE/UPDATE, key object for DELETE
    pub data: serde_json::Value,
    pub device_id: String,
    pub created_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub retries: u32,
    pub status: EntryStatus,
}

impl SyncQueueEntry {
    /// Create a fresh pending entry with a generated id
    pub fn new(
        table_name: impl Into<String>,
        record_id: impl Into<String>,
        operation: SyncOperation,
        data: serde_json::Value,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            table_name: table_name.into(),
            record_id: record_id.into(),
            operation,
            data,
            device_id: device_id.into(),
            created_at: now_millis(),
            synced_at: None,
            error: None,
            retries: 0,
            status: EntryStatus::Pending,
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.table_name.clone(), self.record_id.clone())
    }

    pub fn is_synced(&self) -> bool {
        self.synced_at.is_some()
    }
}

/// Classification of a divergence between local and remote state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Both sides modified the record since the last common synced version
    ConcurrentUpdate,
    /// The local side updated a record the remote side deleted
    UpdateAfterDelete,
    /// The local side deleted a record the remote side updated
    DeleteAfterUpdate,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::ConcurrentUpdate => "concurrent_update",
            ConflictType::UpdateAfterDelete => "update_after_delete",
            ConflictType::DeleteAfterUpdate => "delete_after_update",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "concurrent_update" => Some(ConflictType::ConcurrentUpdate),
            "update_after_delete" => Some(ConflictType::UpdateAfterDelete),
            "delete_after_update" => Some(ConflictType::DeleteAfterUpdate),
            _ => None,
        }
    }

    /// Classify a version conflict reported for a local mutation.
    ///
    /// Returns `None` when both sides agree the record is gone; the caller
    /// treats that as an accepted push and must not invoke the resolver.
    pub fn classify(local: SyncOperation, remote: &RemoteRecord) -> Option<Self> {
        match (local, remote.is_tombstone()) {
            (SyncOperation::Create | SyncOperation::Update, false) => {
                Some(ConflictType::ConcurrentUpdate)
            }
            (SyncOperation::Create | SyncOperation::Update, true) => {
                Some(ConflictType::UpdateAfterDelete)
            }
            (SyncOperation::Delete, false) => Some(ConflictType::DeleteAfterUpdate),
            (SyncOperation::Delete, true) => None,
        }
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a conflict was (or is to be) settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Resolution {
    LocalWins,
    RemoteWins,
    Merged,
    UserDecision,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::LocalWins => "LOCAL_WINS",
            Resolution::RemoteWins => "REMOTE_WINS",
            Resolution::Merged => "MERGED",
            Resolution::UserDecision => "USER_DECISION",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "LOCAL_WINS" => Some(Resolution::LocalWins),
            "REMOTE_WINS" => Some(Resolution::RemoteWins),
            "MERGED" => Some(Resolution::Merged),
            "USER_DECISION" => Some(Resolution::UserDecision),
            _ => None,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A detected divergence for one record key.
///
/// `resolution` and `resolved_at` are set together or not at all. While a
/// conflict is unresolved, no queue entry for the same key is drained.
///
/// Table name: `sync_conflicts`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: String,
    /// Queue entry whose push surfaced the conflict
    pub entry_id: String,
    pub table_name: String,
    pub record_id: String,
    pub local_data: serde_json::Value,
    /// `None` when the remote record was deleted
    pub remote_data: Option<serde_json::Value>,
    pub conflict_type: ConflictType,
    pub resolution: Option<Resolution>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl SyncConflict {
    pub fn new(
        entry: &SyncQueueEntry,
        remote_data: Option<serde_json::Value>,
        conflict_type: ConflictType,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entry_id: entry.id.clone(),
            table_name: entry.table_name.clone(),
            record_id: entry.record_id.clone(),
            local_data: entry.data.clone(),
            remote_data,
            conflict_type,
            resolution: None,
            resolved_at: None,
            created_at: now_millis(),
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.table_name.clone(), self.record_id.clone())
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    /// Mark resolved, keeping `resolution` and `resolved_at` in step
    pub fn mark_resolved(&mut self, resolution: Resolution) {
        self.resolution = Some(resolution);
        self.resolved_at = Some(now_millis());
    }
}

/// Remote side of a version conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Current remote payload, `None` for a tombstone
    pub data: Option<serde_json::Value>,
    /// Last modification (or deletion) time on the remote store
    pub modified_at: DateTime<Utc>,
}

impl RemoteRecord {
    pub fn live(data: serde_json::Value, modified_at: DateTime<Utc>) -> Self {
        Self {
            data: Some(data),
            modified_at,
        }
    }

    pub fn tombstone(deleted_at: DateTime<Utc>) -> Self {
        Self {
            data: None,
            modified_at: deleted_at,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.data.is_none()
    }
}

/// Result of sending one queue entry to the remote store.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    Accepted,
    VersionConflict(RemoteRecord),
    TransientError(String),
}
