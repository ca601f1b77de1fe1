// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! docdb - standalone node serving one document type
//!
//! The node opens the document database under `DOCDB_DATA_DIR`, replays its
//! transaction log and keeps it online until interrupted. Feeding and
//! searching happen through an embedding application; this binary only
//! keeps the database maintained and flushed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info};

use docdb_core::config::Config;
use docdb_core::config_snapshot::{ConfigFile, ConfigSnapshot, DocumentDbConfig};
use docdb_core::owner::StaticOwner;
use docdb_core::runtime::DocumentDbRuntime;

/// Flush interval of the standalone node.
const FLUSH_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("docdb_core=info".parse()?),
        )
        .init();

    info!("Starting docdb");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    let mut snapshot = match &config.config_file {
        Some(path) => ConfigFile::load(path)
            .map_err(|e| {
                error!(path = %path.display(), "Failed to read config file: {}", e);
                e
            })?
            .snapshot_for(&config.document_type),
        None => ConfigSnapshot::new(&config.document_type, 1, DocumentDbConfig::default()),
    };
    if config.config_file.is_none() {
        snapshot.config.maintenance.heartbeat_interval_ms =
            config.heartbeat_interval.as_millis() as u64;
    }

    info!(
        data_dir = %config.data_dir.display(),
        doc_type = %config.document_type,
        distribution_key = config.distribution_key,
        generation = snapshot.generation,
        "Configuration loaded"
    );

    let runtime = DocumentDbRuntime::builder()
        .data_dir(&config.data_dir)
        .config(snapshot)
        .owner(Arc::new(StaticOwner::new(config.distribution_key)))
        .tlog_segment_size(config.tlog_segment_size)
        .flush_interval(FLUSH_INTERVAL)
        .build()?
        .start()
        .await?;

    let status = runtime.db().status();
    info!(state = %status.state, generation = ?status.active_generation, "docdb online");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}
