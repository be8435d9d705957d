use thiserror::Error;

/// Errors raised by the local store, the queue store and the conflict log.
///
/// `Unavailable` is the only variant that means the store as a whole cannot
/// be used; callers treat it as a batch/run level failure. Every other
/// variant is scoped to the record or row being touched.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StorageError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl StorageError {
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        StorageError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
