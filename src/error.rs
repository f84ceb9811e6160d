// ⚠️ Error taxonomy for reconciliation passes
//
// Per-record outcomes (NotFound, AmbiguousMatch, SchemaCoercion) are skip-and-log
// conditions for the caller. Store failures abort the pass.

use thiserror::Error;

/// Result type used across the library
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// A load or lookup found nothing under the given key
    #[error("No record `{key}` in {store}")]
    NotFound { store: String, key: String },

    /// A secondary-index lookup returned more than one record
    #[error("{count} records in {index} share the value `{value}`")]
    AmbiguousMatch {
        index: String,
        value: String,
        count: usize,
    },

    /// A raw value could not be coerced to the declared field type
    #[error("Cannot coerce {shape}.{field}: {message}")]
    SchemaCoercion {
        shape: String,
        field: String,
        message: String,
    },

    /// Network, throttling or lock failure in a backing store
    #[error("Store {store} unavailable: {message}")]
    TransientStore { store: String, message: String },

    /// Conditional write rejected because the stored version moved on
    #[error("Version conflict on {store}/{key}: expected {expected:?}, found {found:?}")]
    VersionConflict {
        store: String,
        key: String,
        expected: Option<i64>,
        found: Option<i64>,
    },

    /// First store patched, second store failed
    #[error("Partial write: {completed} was patched but {failed} was not ({source})")]
    PartialMultiStoreWrite {
        completed: String,
        failed: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Unknown index `{index}` on {store}")]
    UnknownIndex { store: String, index: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl Error {
    pub fn not_found(store: impl Into<String>, key: impl Into<String>) -> Self {
        Error::NotFound {
            store: store.into(),
            key: key.into(),
        }
    }

    pub fn coercion(
        shape: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::SchemaCoercion {
            shape: shape.into(),
            field: field.into(),
            message: message.into(),
        }
    }

    /// Only transport-level failures are worth retrying; no retry loop exists yet.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransientStore { .. })
    }

    /// Conditions a batch pass logs and skips instead of aborting on
    pub fn is_record_level(&self) -> bool {
        matches!(
            self,
            Error::NotFound { .. } | Error::AmbiguousMatch { .. } | Error::SchemaCoercion { .. }
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(ref failure, _)
                if failure.code == rusqlite::ErrorCode::DatabaseBusy
                    || failure.code == rusqlite::ErrorCode::DatabaseLocked =>
            {
                Error::TransientStore {
                    store: "sqlite".to_string(),
                    message: err.to_string(),
                }
            }
            other => Error::Database(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_errors_are_retryable() {
        let transient = Error::TransientStore {
            store: "Assets".to_string(),
            message: "throttled".to_string(),
        };
        assert!(transient.is_retryable());
        assert!(!transient.is_record_level());

        let missing = Error::not_found("Assets", "abc");
        assert!(!missing.is_retryable());
        assert!(missing.is_record_level());
    }

    #[test]
    fn test_busy_sqlite_maps_to_transient() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(Error::from(busy).is_retryable());

        let other = rusqlite::Error::QueryReturnedNoRows;
        assert!(matches!(Error::from(other), Error::Database(_)));
    }

    #[test]
    fn test_partial_write_message_names_both_stores() {
        let err = Error::PartialMultiStoreWrite {
            completed: "Assets".to_string(),
            failed: "assets".to_string(),
            source: Box::new(Error::not_found("assets", "p1")),
        };
        let message = err.to_string();
        assert!(message.contains("Assets was patched"));
        assert!(message.contains("assets was not"));
    }
}
