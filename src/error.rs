//! Error types for the ingestion engine

use std::time::Duration;
use thiserror::Error;

/// Main error type for engine operations
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Maximum retry attempts reached: {0}")]
    MaxRetriesExceeded(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Classified failure of a call against the input stream
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamClientError {
    #[error("Iterator expired")]
    ExpiredIterator,

    #[error("Throughput exceeded")]
    Throttled,

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("{0}")]
    Other(String),
}

impl StreamClientError {
    /// Permission and configuration failures are not transient; retrying
    /// them only repeats the same answer.
    pub fn is_permission_or_config(&self) -> bool {
        matches!(
            self,
            StreamClientError::AccessDenied(_)
                | StreamClientError::ResourceNotFound(_)
                | StreamClientError::InvalidArgument(_)
        )
    }

    /// Operator-facing hint for permission and configuration failures
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            StreamClientError::AccessDenied(_) => {
                Some("Permission denied accessing the stream. Check IAM roles.")
            }
            StreamClientError::ResourceNotFound(_) => Some("Stream not found. Check stream name and region."),
            StreamClientError::InvalidArgument(_) => Some("Stream request rejected. Check iterator configuration."),
            _ => None,
        }
    }

    /// Failure text for telemetry; permission and configuration failures carry the hint
    pub fn detail(&self) -> String {
        match self.hint() {
            Some(hint) if self.is_permission_or_config() => format!("{self}. {hint}"),
            _ => self.to_string(),
        }
    }
}

/// Failure of a single physical store operation
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0} items were left unprocessed")]
    Unprocessed(usize),

    #[error("Invalid item: {0}")]
    InvalidItem(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Failure to turn one raw stream record into a [`crate::model::LocationRecord`]
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("Payload is not a valid location document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },
}

impl DecodeError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        DecodeError::Validation {
            field,
            reason: reason.into(),
        }
    }
}

impl From<config::ConfigError> for IngestError {
    fn from(err: config::ConfigError) -> Self {
        IngestError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversions() {
        let store_err = StoreError::Unprocessed(3);
        let err: IngestError = store_err.into();
        assert!(matches!(err, IngestError::Store(StoreError::Unprocessed(3))));

        let config_err = config::ConfigError::Message("bad".to_string());
        let err: IngestError = config_err.into();
        assert!(matches!(err, IngestError::Config(_)));
    }

    #[test]
    fn test_error_messages() {
        let err = IngestError::Config("batch_size must be between 1 and 10000".into());
        assert_eq!(
            err.to_string(),
            "Configuration error: batch_size must be between 1 and 10000"
        );

        let err = StoreError::Timeout(Duration::from_secs(5));
        assert!(err.to_string().contains("5s"));

        let err = DecodeError::invalid("lat", "out of range");
        assert_eq!(err.to_string(), "Invalid lat: out of range");
    }

    #[test]
    fn test_permission_classification() {
        assert!(StreamClientError::AccessDenied("x".into()).is_permission_or_config());
        assert!(StreamClientError::ResourceNotFound("x".into()).is_permission_or_config());
        assert!(!StreamClientError::Throttled.is_permission_or_config());
        assert!(!StreamClientError::ExpiredIterator.is_permission_or_config());
        assert!(StreamClientError::Throttled.hint().is_none());
        assert!(StreamClientError::AccessDenied("x".into())
            .hint()
            .is_some_and(|h| h.contains("IAM")));
    }

    #[test]
    fn test_detail_carries_hint_only_for_permission_or_config() {
        let detail = StreamClientError::ResourceNotFound("vehicle-locations".into()).detail();
        assert_eq!(
            detail,
            "Resource not found: vehicle-locations. Stream not found. Check stream name and region."
        );
        assert_eq!(StreamClientError::Throttled.detail(), "Throughput exceeded");
        assert_eq!(
            StreamClientError::Connection("reset".into()).detail(),
            "Connection error: reset"
        );
    }
}
