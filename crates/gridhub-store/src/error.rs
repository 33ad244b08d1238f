//! Store errors and their caller-facing classification.

use crate::config::ConfigError;
use gridhub_doc::BackendError;
use gridhub_table::CodecError;
use std::fmt::{Display, Formatter};

/// Caller-facing error classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Denied,
    InvalidRequest,
    Backend,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Denied => "denied",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Backend => "backend",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("denied: {0}")]
    Denied(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A network store failed after some kinds were already written.
    #[error("network {net_id}: kind `{failed}` failed after writing {written:?}: {source}")]
    PartialNetworkWrite {
        net_id: i64,
        written: Vec<String>,
        failed: String,
        source: Box<StoreError>,
    },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl StoreError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn denied(message: impl Into<String>) -> Self {
        Self::Denied(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::Conflict(_) | StoreError::PartialNetworkWrite { .. } => ErrorKind::Conflict,
            StoreError::Denied(_) => ErrorKind::Denied,
            StoreError::InvalidRequest(_) | StoreError::Codec(_) | StoreError::Config(_) => {
                ErrorKind::InvalidRequest
            }
            StoreError::Backend(err) if err.is_duplicate_key() => ErrorKind::Conflict,
            StoreError::Backend(BackendError::InvalidName(_)) => ErrorKind::InvalidRequest,
            StoreError::Backend(_) => ErrorKind::Backend,
        }
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_network_writes_classify_as_conflict() {
        let err = StoreError::PartialNetworkWrite {
            net_id: 3,
            written: vec!["bus".to_string()],
            failed: "line".to_string(),
            source: Box::new(StoreError::invalid("bad row")),
        };
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.to_string().contains("kind `line` failed"));
    }

    #[test]
    fn duplicate_keys_classify_as_conflict() {
        let err = StoreError::from(BackendError::DuplicateKey {
            collection: "p/net_bus".to_string(),
            key: "addition:1:5".to_string(),
        });
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }
}
