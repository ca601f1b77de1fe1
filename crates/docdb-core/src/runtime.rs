// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for docdb-core.
//!
//! This module provides [`DocumentDbRuntime`] which runs one document
//! database inside an existing tokio application, optionally with a
//! periodic flush loop.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use docdb_core::config_snapshot::{ConfigSnapshot, DocumentDbConfig};
//! use docdb_core::runtime::DocumentDbRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = DocumentDbRuntime::builder()
//!         .data_dir("/var/lib/docdb")
//!         .config(ConfigSnapshot::new("music", 1, DocumentDbConfig::default()))
//!         .flush_interval(Duration::from_secs(300))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... feed and search through runtime.db() ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config_snapshot::ConfigSnapshot;
use crate::documentdb::{DEFAULT_TLOG_SEGMENT_SIZE, DocumentDb, DocumentDbOptions};
use crate::owner::DocumentDbOwner;

/// Builder for creating a [`DocumentDbRuntime`].
pub struct DocumentDbRuntimeBuilder {
    data_dir: Option<PathBuf>,
    config: Option<ConfigSnapshot>,
    owner: Option<Arc<dyn DocumentDbOwner>>,
    tlog_segment_size: u64,
    flush_interval: Option<Duration>,
}

impl std::fmt::Debug for DocumentDbRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentDbRuntimeBuilder")
            .field("data_dir", &self.data_dir)
            .field("config", &self.config.as_ref().map(|c| c.generation))
            .field("owner", &self.owner.as_ref().map(|_| "..."))
            .field("tlog_segment_size", &self.tlog_segment_size)
            .field("flush_interval", &self.flush_interval)
            .finish()
    }
}

impl Default for DocumentDbRuntimeBuilder {
    fn default() -> Self {
        Self {
            data_dir: None,
            config: None,
            owner: None,
            tlog_segment_size: DEFAULT_TLOG_SEGMENT_SIZE,
            flush_interval: None,
        }
    }
}

impl DocumentDbRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Base data directory (required). The database lives in
    /// `<data_dir>/<doc_type>`.
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Live config of the document type (required).
    pub fn config(mut self, config: ConfigSnapshot) -> Self {
        self.config = Some(config);
        self
    }

    pub fn owner(mut self, owner: Arc<dyn DocumentDbOwner>) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Default: 64 MiB
    pub fn tlog_segment_size(mut self, size: u64) -> Self {
        self.tlog_segment_size = size;
        self
    }

    /// Flush all sub-databases on this interval. Default: never.
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = Some(interval);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<DocumentDbRuntimeConfig> {
        let data_dir = self
            .data_dir
            .ok_or_else(|| anyhow::anyhow!("data_dir is required"))?;
        let config = self
            .config
            .ok_or_else(|| anyhow::anyhow!("config is required"))?;
        if config.doc_type.is_empty() {
            anyhow::bail!("config must name a document type");
        }
        if self.flush_interval.is_some_and(|i| i.is_zero()) {
            anyhow::bail!("flush_interval must be positive");
        }

        Ok(DocumentDbRuntimeConfig {
            dir: data_dir.join(&config.doc_type),
            config,
            owner: self.owner,
            options: DocumentDbOptions {
                tlog_segment_size: self.tlog_segment_size,
            },
            flush_interval: self.flush_interval,
        })
    }
}

/// Configuration for a [`DocumentDbRuntime`].
pub struct DocumentDbRuntimeConfig {
    dir: PathBuf,
    config: ConfigSnapshot,
    owner: Option<Arc<dyn DocumentDbOwner>>,
    options: DocumentDbOptions,
    flush_interval: Option<Duration>,
}

impl std::fmt::Debug for DocumentDbRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentDbRuntimeConfig")
            .field("dir", &self.dir)
            .field("doc_type", &self.config.doc_type)
            .field("owner", &"...")
            .field("options", &self.options)
            .field("flush_interval", &self.flush_interval)
            .finish()
    }
}

impl DocumentDbRuntimeConfig {
    /// Start the document database and wait until it is online.
    pub async fn start(self) -> Result<DocumentDbRuntime> {
        let db = Arc::new(DocumentDb::new(
            &self.dir,
            self.config,
            self.owner,
            self.options,
        ));
        db.start()?;
        if let Err(e) = db.wait_for_online().await {
            error!(doc_type = %db.doc_type(), error = %e, "Document database failed to come online");
            let _ = db.close().await;
            return Err(e.into());
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let flush_handle = self
            .flush_interval
            .map(|interval| tokio::spawn(run_flush_loop(db.clone(), interval, shutdown_rx)));

        info!(
            doc_type = %db.doc_type(),
            dir = %self.dir.display(),
            "DocumentDbRuntime started"
        );

        Ok(DocumentDbRuntime {
            db,
            flush_handle,
            shutdown_tx,
        })
    }
}

/// A running document database embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct DocumentDbRuntime {
    db: Arc<DocumentDb>,
    flush_handle: Option<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for DocumentDbRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentDbRuntime")
            .field("db", &self.db)
            .field("flush_loop", &self.flush_handle.is_some())
            .finish()
    }
}

impl DocumentDbRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> DocumentDbRuntimeBuilder {
        DocumentDbRuntimeBuilder::new()
    }

    pub fn db(&self) -> &Arc<DocumentDb> {
        &self.db
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops the flush loop, then closes the document database.
    pub async fn shutdown(self) -> Result<()> {
        info!(doc_type = %self.db.doc_type(), "DocumentDbRuntime shutting down...");

        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.flush_handle
            && let Err(e) = handle.await
        {
            error!("Flush loop panicked: {}", e);
        }

        match self.db.close().await {
            Ok(()) => {
                info!("DocumentDbRuntime shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("DocumentDbRuntime close failed: {}", e);
                Err(e.into())
            }
        }
    }

    /// Check if the document database is still serving.
    pub fn is_running(&self) -> bool {
        !self.db.state().is_closed()
    }
}

async fn run_flush_loop(
    db: Arc<DocumentDb>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!(doc_type = %db.doc_type(), interval_secs = interval.as_secs(), "Flush loop started");
    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }

            _ = tokio::time::sleep(interval) => {
                match db.flush_all().await {
                    Ok(serial) => debug!(doc_type = %db.doc_type(), serial, "Periodic flush done"),
                    Err(e) if db.state().is_closed() => {
                        debug!(doc_type = %db.doc_type(), error = %e, "Flush loop stopping");
                        break;
                    }
                    Err(e) => warn!(doc_type = %db.doc_type(), error = %e, "Periodic flush failed"),
                }
            }
        }
    }
    debug!(doc_type = %db.doc_type(), "Flush loop stopped");
}
