// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for docdb-core.
//!
//! Feed-level rejections are not errors; they are reported through
//! [`FeedResult`](crate::feed::FeedResult). The variants here cover
//! storage failures and lifecycle violations.

use docdb_tlog::{SerialNum, TlogError};
use thiserror::Error;

/// Result type using [`DocDbError`].
pub type Result<T> = std::result::Result<T, DocDbError>;

/// Errors raised by the document database.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DocDbError {
    /// Appending to or reading the transaction log failed.
    #[error("transaction log error: {0}")]
    TransactionLog(#[from] TlogError),

    /// Config store operation failed.
    #[error("config store {operation} failed: {details}")]
    ConfigStore { operation: String, details: String },

    /// SQL error from the config store pool.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Memory or disk usage is above the configured limits.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A config snapshot referenced by the transaction log is missing.
    #[error("no config snapshot stored for serial {0}")]
    MissingConfig(SerialNum),

    /// Reading or writing a sub-database snapshot failed.
    #[error("snapshot {path}: {details}")]
    Snapshot { path: String, details: String },

    /// A logged operation could not be decoded.
    #[error("failed to decode operation at serial {serial}: {details}")]
    Decode { serial: SerialNum, details: String },

    /// The operation is not valid in the current lifecycle state.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// The document database is closed or closing.
    #[error("document database is closed")]
    Closed,

    /// A document id could not be parsed.
    #[error("invalid document id '{id}': {reason}")]
    InvalidDocumentId { id: String, reason: String },

    /// Raw IO failure outside the transaction log.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DocDbError {
    /// Machine-readable code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::TransactionLog(_) => "TRANSACTION_LOG_ERROR",
            Self::ConfigStore { .. } => "CONFIG_STORE_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::ResourceExhausted(_) => "RESOURCE_EXHAUSTED",
            Self::MissingConfig(_) => "MISSING_CONFIG",
            Self::Snapshot { .. } => "SNAPSHOT_ERROR",
            Self::Decode { .. } => "DECODE_ERROR",
            Self::IllegalState(_) => "ILLEGAL_STATE",
            Self::Closed => "CLOSED",
            Self::InvalidDocumentId { .. } => "INVALID_DOCUMENT_ID",
            Self::Io(_) => "IO_ERROR",
        }
    }

    pub(crate) fn config_store(operation: &str, err: impl std::fmt::Display) -> Self {
        Self::ConfigStore {
            operation: operation.to_string(),
            details: err.to_string(),
        }
    }

    pub(crate) fn snapshot(path: &std::path::Path, err: impl std::fmt::Display) -> Self {
        Self::Snapshot {
            path: path.display().to_string(),
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(DocDbError::Closed.error_code(), "CLOSED");
        assert_eq!(
            DocDbError::IllegalState("x".into()).error_code(),
            "ILLEGAL_STATE"
        );
        assert_eq!(DocDbError::MissingConfig(3).error_code(), "MISSING_CONFIG");
        let tlog = DocDbError::from(TlogError::SerialOrder { last: 2, got: 1 });
        assert_eq!(tlog.error_code(), "TRANSACTION_LOG_ERROR");
    }

    #[test]
    fn test_error_display() {
        let err = DocDbError::config_store("save", "disk full");
        assert_eq!(err.to_string(), "config store save failed: disk full");

        let err = DocDbError::InvalidDocumentId {
            id: "foo".into(),
            reason: "missing scheme".into(),
        };
        assert_eq!(err.to_string(), "invalid document id 'foo': missing scheme");
    }
}
