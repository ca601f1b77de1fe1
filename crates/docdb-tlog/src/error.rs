// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the transaction log.

use std::path::PathBuf;

use thiserror::Error;

use crate::SerialNum;
use crate::frame::MAX_ENTRY_SIZE;

/// Result type using [`TlogError`].
pub type Result<T> = std::result::Result<T, TlogError>;

/// Transaction log errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TlogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("entry too large: {0} bytes (max: {MAX_ENTRY_SIZE})")]
    EntryTooLarge(usize),

    #[error("invalid entry type: {0}")]
    InvalidEntryType(u8),

    #[error("corrupted segment {path:?} at offset {offset}: {reason}")]
    Corrupted {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    #[error("serial number {got} is not greater than last logged serial {last}")]
    SerialOrder { last: SerialNum, got: SerialNum },

    #[error("invalid segment file name: {0}")]
    InvalidSegmentName(String),
}

impl TlogError {
    /// Machine-readable code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Io(_) => "TLOG_IO",
            Self::EntryTooLarge(_) => "TLOG_ENTRY_TOO_LARGE",
            Self::InvalidEntryType(_) => "TLOG_INVALID_ENTRY_TYPE",
            Self::Corrupted { .. } => "TLOG_CORRUPTED",
            Self::SerialOrder { .. } => "TLOG_SERIAL_ORDER",
            Self::InvalidSegmentName(_) => "TLOG_INVALID_SEGMENT_NAME",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_order_display() {
        let err = TlogError::SerialOrder { last: 10, got: 7 };
        assert_eq!(
            err.to_string(),
            "serial number 7 is not greater than last logged serial 10"
        );
        assert_eq!(err.error_code(), "TLOG_SERIAL_ORDER");
    }

    #[test]
    fn test_entry_too_large_mentions_limit() {
        let msg = TlogError::EntryTooLarge(100_000_000).to_string();
        assert!(msg.contains("100000000"));
        assert!(msg.contains(&MAX_ENTRY_SIZE.to_string()));
    }
}
