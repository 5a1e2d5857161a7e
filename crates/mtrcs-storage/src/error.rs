use mtrcs_common::types::{MetricKind, RecordError};

/// Errors that can occur within the storage layer.
///
/// [`StorageError::NoSuchMetric`] is the lookup-miss sentinel; callers match on
/// it to tell "absent" apart from a backend failure.
///
/// # Examples
///
/// ```rust
/// use mtrcs_common::types::MetricKind;
/// use mtrcs_storage::error::StorageError;
///
/// let err = StorageError::NoSuchMetric {
///     kind: MetricKind::Gauge,
///     name: "temp".to_string(),
/// };
/// assert!(err.is_not_found());
/// assert_eq!(err.to_string(), "Storage: no such gauge metric: temp");
/// ```
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Lookup of a metric that was never written.
    #[error("Storage: no such {kind} metric: {name}")]
    NoSuchMetric { kind: MetricKind, name: String },

    /// A record in an update was malformed.
    #[error("Storage: invalid record: {0}")]
    InvalidRecord(#[from] RecordError),

    /// Adding the delta would overflow the 64-bit counter.
    #[error("Storage: counter {name} would overflow")]
    CounterOverflow { name: String },

    /// Snapshot file could not be read or written.
    #[error("Storage: I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot file is not valid JSON.
    #[error("Storage: JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error reported by the SQL backend.
    #[error("Storage: database error: {0}")]
    Database(#[from] sea_orm::DbErr),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NoSuchMetric { .. })
    }

    /// True for failures a caller can fix by changing the request.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            StorageError::InvalidRecord(_) | StorageError::CounterOverflow { .. }
        )
    }

    /// Connection-level database failures, the only ones worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Database(err) => crate::retry::is_connection_error(err),
            _ => false,
        }
    }
}

/// Convenience `Result` alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
