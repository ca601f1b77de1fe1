// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! docdb Core - Per-Document-Type Storage and Search Engine
//!
//! This crate owns the documents of one document type on one node. It keeps
//! them durable through a write-ahead transaction log, searchable through an
//! in-memory index, and lets the host reconfigure or reprocess them without
//! taking them offline.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               Host                                       │
//! │         (config distribution, cluster state, resource usage)             │
//! └─────────────────────────────────────────────────────────────────────────┘
//!            │ feed / reconfigure / flush              ▲ status
//!            ▼                                         │
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        DocumentDb (master task)                          │
//! │   FeedHandler ──► TransactionLog        ConfigStore (SQLite)             │
//! │        │                                MaintenanceController            │
//! │        ▼                                                                 │
//! │   FeedView ──► writer executors (summary, attribute, index)              │
//! └─────────────────────────────────────────────────────────────────────────┘
//!            │
//!            ▼
//! ┌───────────────────┐ ┌───────────────────┐ ┌───────────────────┐
//! │   0.ready         │ │   1.removed       │ │   2.notready      │
//! │ meta, summary,    │ │ meta (tombstones) │ │ meta, summary,    │
//! │ attributes, index │ │                   │ │ attributes        │
//! └───────────────────┘ └───────────────────┘ └───────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! ```text
//! Construct → Load → ReplayTransactionLog ─┬─────────────────┐
//!                                          ▼                 ▼
//!                                    RedoReprocess → ApplyLiveConfig
//!                                                      │        │
//!                                                      ▼        ▼
//!                                                 Reprocess ⇄ Online
//!
//! any state → Shutdown → Dead        any failure → Dead
//! ```
//!
//! | State | What happens |
//! |-------|--------------|
//! | `Load` | Open log and config store, load sub-database snapshots |
//! | `ReplayTransactionLog` | Re-apply logged operations newer than the snapshots |
//! | `RedoReprocess` | Run reprocessing deferred by configs met during replay |
//! | `ApplyLiveConfig` | Apply the config handed in by the host, if newer |
//! | `Reprocess` | Rebuild attributes or index after a schema change |
//! | `Online` | Serve feed, maintenance and reconfiguration |
//!
//! The transaction log is only pruned from `ApplyLiveConfig` on.
//!
//! # Configuration
//!
//! The `docdb` binary reads environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `DOCDB_DATA_DIR` | Yes | - | Base data directory |
//! | `DOCDB_DOCUMENT_TYPE` | Yes | - | Document type served |
//! | `DOCDB_DISTRIBUTION_KEY` | No | `0` | Node distribution key |
//! | `DOCDB_CONFIG_FILE` | No | - | JSON document database config |
//! | `DOCDB_HEARTBEAT_INTERVAL_SECS` | No | `60` | Heartbeat interval |
//! | `DOCDB_TLOG_SEGMENT_SIZE` | No | 64 MiB | Transaction log segment size |

/// Bucket readiness input from the cluster controller.
pub mod cluster_state;

/// Process configuration loaded from environment variables.
pub mod config;

/// Config snapshots, diffs and the config file format.
pub mod config_snapshot;

/// Durable storage of config snapshots by serial number.
pub mod config_store;

/// Document ids, global ids, buckets and documents.
pub mod document;

/// The document database handle and its master task.
pub mod documentdb;

/// Error types with error code mapping.
pub mod error;

/// Sequenced writer executors.
pub mod executor;

/// Feed handler, feed view, visibility and the resource write filter.
pub mod feed;

/// Background maintenance jobs and their controller.
pub mod maintenance;

/// Logged operations.
pub mod operation;

/// Capabilities provided by the host.
pub mod owner;

/// Reprocessing after schema changes.
pub mod reprocessing;

/// Embeddable runtime with builder.
pub mod runtime;

/// Lifecycle states and status reporting.
pub mod state;

/// Ready, removed and not-ready sub-databases.
pub mod subdb;

pub use documentdb::{DocumentDb, DocumentDbOptions, DocumentDbStats, FlushTarget};
pub use error::{DocDbError, Result};
pub use feed::{FeedRequest, FeedResult};
pub use state::{ConfigState, DdbState, StatusReport};
