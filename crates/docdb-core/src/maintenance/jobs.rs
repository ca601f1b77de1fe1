// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The maintenance jobs of a document database.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::config_snapshot::{BucketMoveConfig, LidSpaceCompactionConfig, PruneRemovedConfig};
use crate::document::Timestamp;
use crate::error::Result;
use crate::maintenance::{JobGate, MaintenanceJob, MaintenanceTarget};
use crate::subdb::{LidUsageStats, SubDbCollection, SubDbType};

/// Periodic heartbeat: forces a visibility commit and syncs the log.
pub struct HeartBeatJob {
    target: Arc<dyn MaintenanceTarget>,
    interval: Duration,
}

impl HeartBeatJob {
    pub fn new(target: Arc<dyn MaintenanceTarget>, interval: Duration) -> Self {
        Self { target, interval }
    }
}

#[async_trait]
impl MaintenanceJob for HeartBeatJob {
    fn name(&self) -> String {
        "heart_beat".into()
    }

    fn delay(&self) -> Duration {
        self.interval
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self, _gate: &JobGate) -> Result<bool> {
        self.target.heart_beat().await?;
        Ok(true)
    }
}

/// Moves documents from the top of a sub-database's lid space into holes
/// left by removed documents, so the lid space can shrink.
pub struct LidSpaceCompactionJob {
    sub_db: SubDbType,
    config: LidSpaceCompactionConfig,
    sub_dbs: Arc<SubDbCollection>,
    target: Arc<dyn MaintenanceTarget>,
}

impl LidSpaceCompactionJob {
    pub fn new(
        sub_db: SubDbType,
        config: LidSpaceCompactionConfig,
        sub_dbs: Arc<SubDbCollection>,
        target: Arc<dyn MaintenanceTarget>,
    ) -> Self {
        Self {
            sub_db,
            config,
            sub_dbs,
            target,
        }
    }

    fn should_compact(&self, stats: &LidUsageStats) -> bool {
        stats.lid_bloat() >= self.config.allowed_lid_bloat
            && stats.lid_bloat_factor() >= self.config.allowed_lid_bloat_factor
    }
}

#[async_trait]
impl MaintenanceJob for LidSpaceCompactionJob {
    fn name(&self) -> String {
        format!("lid_space_compaction.{}", self.sub_db.name())
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.config.interval_ms)
    }

    async fn run(&self, gate: &JobGate) -> Result<bool> {
        if gate.stopping() {
            return Ok(true);
        }
        let stats = self.sub_dbs.get(self.sub_db).lid_usage().await;
        if !self.should_compact(&stats) {
            return Ok(true);
        }
        debug!(
            sub_db = %self.sub_db,
            lid_bloat = stats.lid_bloat(),
            lid_bloat_factor = stats.lid_bloat_factor(),
            "Lid space needs compaction"
        );
        let max_moves = self.config.max_docs_to_move as usize;
        let moved = self.target.compact_lid_space(self.sub_db, max_moves).await?;
        Ok(moved < max_moves)
    }
}

/// Drops tombstones older than the configured age, through logged
/// `PruneRemoved` operations.
pub struct PruneRemovedDocumentsJob {
    config: PruneRemovedConfig,
    target: Arc<dyn MaintenanceTarget>,
}

impl PruneRemovedDocumentsJob {
    pub fn new(config: PruneRemovedConfig, target: Arc<dyn MaintenanceTarget>) -> Self {
        Self { config, target }
    }

    fn cutoff(&self) -> Timestamp {
        let now = Utc::now().timestamp_micros().max(0) as Timestamp;
        now.saturating_sub(self.config.age_ms.saturating_mul(1000))
    }
}

#[async_trait]
impl MaintenanceJob for PruneRemovedDocumentsJob {
    fn name(&self) -> String {
        "prune_removed_documents".into()
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.config.interval_ms)
    }

    async fn run(&self, gate: &JobGate) -> Result<bool> {
        if gate.stopping() || !gate.allow_prune() {
            return Ok(true);
        }
        let limit = self.config.batch_size as usize;
        let pruned = self.target.prune_removed(self.cutoff(), limit).await?;
        Ok(pruned < limit)
    }
}

/// Moves documents between the ready and not-ready sub-databases when the
/// cluster state or ready mode changes.
pub struct BucketMoveJob {
    config: BucketMoveConfig,
    target: Arc<dyn MaintenanceTarget>,
}

impl BucketMoveJob {
    pub fn new(config: BucketMoveConfig, target: Arc<dyn MaintenanceTarget>) -> Self {
        Self { config, target }
    }
}

#[async_trait]
impl MaintenanceJob for BucketMoveJob {
    fn name(&self) -> String {
        "bucket_move".into()
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.config.interval_ms)
    }

    async fn run(&self, gate: &JobGate) -> Result<bool> {
        if gate.stopping() {
            return Ok(true);
        }
        let limit = self.config.max_docs_per_run.max(1) as usize;
        let moved = self.target.move_buckets(limit).await?;
        Ok(moved < limit)
    }
}
