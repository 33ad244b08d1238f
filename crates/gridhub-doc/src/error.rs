//! Errors raised by document backends.

/// Failures of the storage substrate.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("line {0}: I/O error: {1}")]
    Io(usize, String),

    #[error("line {0}: parse error: {1}")]
    Parse(usize, String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("corrupted substrate: {0}")]
    Corrupt(String),

    #[error("duplicate key in {collection}: {key}")]
    DuplicateKey { collection: String, key: String },

    #[error("collection lock busy: {lock_path}")]
    Busy { lock_path: String },

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("invalid collection name: {0}")]
    InvalidName(String),

    #[error("collection already exists: {0}")]
    CollectionExists(String),
}

impl BackendError {
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, BackendError::DuplicateKey { .. })
    }
}
