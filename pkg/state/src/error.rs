use thiserror::Error;

/// Failures of typed registry operations.
///
/// Only `Backend` is transient; conflicts are resolved by re-reading, and the
/// rest point at data or caller bugs that retrying will not fix.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conflict writing {key}: expected resource version {expected}, found {found}")]
    Conflict {
        key: String,
        expected: u64,
        found: u64,
    },
    #[error("{key} not found")]
    NotFound { key: String },
    #[error("{key} already exists")]
    AlreadyExists { key: String },
    #[error("failed to encode or decode {key}: {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("state store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Backend(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}
