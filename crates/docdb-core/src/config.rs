// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Process-level configuration of a docdb node.
///
/// Engine tuning (schema, visibility delay, maintenance intervals) comes from
/// config snapshots, not from here.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory; each document type gets `<data_dir>/<doc_type>`
    pub data_dir: PathBuf,
    /// Document type served by this process
    pub document_type: String,
    /// Distribution key of this node
    pub distribution_key: u32,
    /// Optional JSON file with the document database config
    pub config_file: Option<PathBuf>,
    /// Interval between heartbeats when no config file overrides it
    pub heartbeat_interval: Duration,
    /// Transaction log segment size limit in bytes
    pub tlog_segment_size: u64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `DOCDB_DATA_DIR`: base data directory
    /// - `DOCDB_DOCUMENT_TYPE`: document type name
    ///
    /// Optional (with defaults):
    /// - `DOCDB_DISTRIBUTION_KEY`: node distribution key (default: 0)
    /// - `DOCDB_CONFIG_FILE`: JSON document database config (default: none)
    /// - `DOCDB_HEARTBEAT_INTERVAL_SECS`: heartbeat interval (default: 60)
    /// - `DOCDB_TLOG_SEGMENT_SIZE`: tlog segment size in bytes (default: 64 MiB)
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = std::env::var("DOCDB_DATA_DIR")
            .map(PathBuf::from)
            .map_err(|_| ConfigError::Missing("DOCDB_DATA_DIR"))?;

        let document_type = std::env::var("DOCDB_DOCUMENT_TYPE")
            .map_err(|_| ConfigError::Missing("DOCDB_DOCUMENT_TYPE"))?;
        if document_type.is_empty()
            || !document_type
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(ConfigError::Invalid(
                "DOCDB_DOCUMENT_TYPE",
                "must be a non-empty name of [A-Za-z0-9_-]",
            ));
        }

        let distribution_key: u32 = std::env::var("DOCDB_DISTRIBUTION_KEY")
            .unwrap_or_else(|_| "0".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("DOCDB_DISTRIBUTION_KEY", "must be a non-negative integer")
            })?;

        let config_file = std::env::var("DOCDB_CONFIG_FILE").ok().map(PathBuf::from);

        let heartbeat_secs: u64 = std::env::var("DOCDB_HEARTBEAT_INTERVAL_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("DOCDB_HEARTBEAT_INTERVAL_SECS", "must be a positive integer")
            })?;
        if heartbeat_secs == 0 {
            return Err(ConfigError::Invalid(
                "DOCDB_HEARTBEAT_INTERVAL_SECS",
                "must be a positive integer",
            ));
        }

        let tlog_segment_size: u64 = std::env::var("DOCDB_TLOG_SEGMENT_SIZE")
            .unwrap_or_else(|_| (64 * 1024 * 1024).to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("DOCDB_TLOG_SEGMENT_SIZE", "must be a size in bytes")
            })?;

        Ok(Self {
            data_dir,
            document_type,
            distribution_key,
            config_file,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            tlog_segment_size,
        })
    }

    /// Directory of the configured document type.
    pub fn document_db_dir(&self) -> PathBuf {
        self.data_dir.join(&self.document_type)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
