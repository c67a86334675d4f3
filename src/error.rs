//! Error taxonomy for the reconciliation engine.
//!
//! `StoreError` is what the backing store reports for a single request.
//! `WriteError` is what callers of the write coordinator see once retries,
//! conflict re-reads and insert fallbacks have run their course.
//! `StorageError` never leaves the durable handoff cache.

use thiserror::Error;

/// Failure reported by the backing store for one request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection lost: {0}")]
    Connection(String),

    /// Server-side trouble that is expected to clear (HTTP 5xx, 429).
    #[error("backing store unavailable: {0}")]
    Unavailable(String),

    #[error("version conflict on {table}/{id} (server version {current_version:?})")]
    Conflict {
        table: String,
        id: String,
        current_version: Option<i64>,
    },

    #[error("record {table}/{id} not found")]
    NotFound { table: String, id: String },

    /// Validation error or permanent refusal. Never retried.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl StoreError {
    /// Timeouts, dropped connections and server unavailability are retried
    /// with backoff; everything else is surfaced or handled by a dedicated path.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Timeout(_) | StoreError::Connection(_) | StoreError::Unavailable(_)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Failure of a logical write as seen by the caller.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WriteError {
    #[error("write to {table}/{id} failed after {attempts} attempt(s): {source}")]
    WriteFailed {
        table: String,
        id: String,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("malformed payload for {table}: {reason}")]
    MalformedPayload { table: String, reason: String },

    #[error("{table}/{id} is not present in the current snapshot")]
    UnknownRecord { table: String, id: String },

    #[error("cannot move {entity} {id} from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },
}

/// Durable cache persistence failure. Logged and absorbed by the cache.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("durable storage unavailable: {0}")]
    Unavailable(String),

    #[error("durable storage payload is corrupt: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Corrupt(err.to_string())
    }
}

pub type WriteResult<T> = std::result::Result<T, WriteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Timeout("t".into()).is_transient());
        assert!(StoreError::Connection("c".into()).is_transient());
        assert!(StoreError::Unavailable("HTTP 503".into()).is_transient());
        assert!(!StoreError::Rejected("bad".into()).is_transient());
        assert!(!StoreError::Conflict {
            table: "batches".into(),
            id: "b1".into(),
            current_version: Some(2),
        }
        .is_transient());
        assert!(!StoreError::NotFound {
            table: "batches".into(),
            id: "b1".into(),
        }
        .is_transient());
    }

    #[test]
    fn test_write_failed_message_names_target() {
        let err = WriteError::WriteFailed {
            table: "batches".into(),
            id: "b-7".into(),
            attempts: 4,
            source: StoreError::Timeout("30s".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("batches/b-7"));
        assert!(msg.contains("4 attempt(s)"));
    }
}
