// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The master task of a document database.
//!
//! One tokio task per document database owns the feed handler, the feed
//! view, the config store and the maintenance controller. It walks the
//! startup states, then serves [`MasterRequest`]s one at a time until
//! shutdown. Everything that changes documents or config goes through here.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use docdb_tlog::{SerialNum, TransactionLog, TransactionLogConfig};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::cluster_state::ClusterState;
use crate::config_snapshot::{ConfigSnapshot, ReconfigParams, delay_attribute_aspects};
use crate::config_store::{ConfigStore, SqliteConfigStore};
use crate::document::Timestamp;
use crate::documentdb::Shared;
use crate::error::{DocDbError, Result};
use crate::feed::{FeedHandler, FeedHandlerOwner, FeedRequest, FeedResult, FeedView, ReplayConfig};
use crate::maintenance::{
    BucketMoveJob, HeartBeatJob, LidSpaceCompactionJob, MaintenanceController, MaintenanceTarget,
    PruneRemovedDocumentsJob,
};
use crate::reprocessing::ReprocessingRunner;
use crate::state::{ConfigState, DdbState};
use crate::subdb::SubDbType;

/// Requests served by the master task.
pub(crate) enum MasterRequest {
    Feed {
        request: FeedRequest,
        reply: oneshot::Sender<FeedResult>,
    },
    /// A new live config is waiting in the shared pending slot.
    Reconfigure,
    /// A delayed visibility commit is due.
    Commit,
    HeartBeat {
        reply: oneshot::Sender<Result<()>>,
    },
    /// Flush one sub-database, or all of them.
    Flush {
        sub_db: Option<SubDbType>,
        reply: oneshot::Sender<Result<SerialNum>>,
    },
    CompactLidSpace {
        sub_db: SubDbType,
        max_moves: usize,
        reply: oneshot::Sender<Result<usize>>,
    },
    PruneRemoved {
        cutoff: Timestamp,
        limit: usize,
        reply: oneshot::Sender<Result<usize>>,
    },
    MoveBuckets {
        limit: usize,
        reply: oneshot::Sender<Result<usize>>,
    },
    SetClusterState {
        state: ClusterState,
        reply: oneshot::Sender<()>,
    },
    /// Wait until every applied operation is visible and the log is synced.
    Sync {
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

impl MasterRequest {
    fn name(&self) -> &'static str {
        match self {
            Self::Feed { .. } => "feed",
            Self::Reconfigure => "reconfigure",
            Self::Commit => "commit",
            Self::HeartBeat { .. } => "heart_beat",
            Self::Flush { .. } => "flush",
            Self::CompactLidSpace { .. } => "compact_lid_space",
            Self::PruneRemoved { .. } => "prune_removed",
            Self::MoveBuckets { .. } => "move_buckets",
            Self::SetClusterState { .. } => "set_cluster_state",
            Self::Sync { .. } => "sync",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Sending side of the master's request queue.
#[derive(Debug, Clone)]
pub(crate) struct MasterHandle {
    sender: mpsc::Sender<MasterRequest>,
}

impl MasterHandle {
    pub(crate) fn new(sender: mpsc::Sender<MasterRequest>) -> Self {
        Self { sender }
    }

    /// Queue a request that has no reply.
    pub(crate) async fn send(&self, request: MasterRequest) -> Result<()> {
        self.sender
            .send(request)
            .await
            .map_err(|_| DocDbError::Closed)
    }

    /// Queue a request and wait for its reply.
    pub(crate) async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> MasterRequest,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| DocDbError::Closed)
    }
}

#[async_trait]
impl MaintenanceTarget for MasterHandle {
    async fn heart_beat(&self) -> Result<()> {
        self.request(|reply| MasterRequest::HeartBeat { reply })
            .await?
    }

    async fn compact_lid_space(&self, sub_db: SubDbType, max_moves: usize) -> Result<usize> {
        self.request(|reply| MasterRequest::CompactLidSpace {
            sub_db,
            max_moves,
            reply,
        })
        .await?
    }

    async fn prune_removed(&self, cutoff: Timestamp, limit: usize) -> Result<usize> {
        self.request(|reply| MasterRequest::PruneRemoved {
            cutoff,
            limit,
            reply,
        })
        .await?
    }

    async fn move_buckets(&self, limit: usize) -> Result<usize> {
        self.request(|reply| MasterRequest::MoveBuckets { limit, reply })
            .await?
    }
}

/// Master-side state that the feed handler calls back into.
struct MasterContext {
    shared: Arc<Shared>,
    config_store: Arc<dyn ConfigStore>,
    runner: ReprocessingRunner,
    maintenance: MaintenanceController,
    handle: MasterHandle,
}

impl FeedHandlerOwner for MasterContext {
    fn allow_prune(&self) -> bool {
        self.shared.state.allow_prune()
    }

    fn is_closing(&self) -> bool {
        self.shared.closing.load(Ordering::Acquire)
    }

    fn on_transaction_log_replay_done(&self) {
        info!(doc_type = %self.shared.doc_type, "Transaction log replay done");
    }
}

#[async_trait]
impl ReplayConfig for MasterContext {
    async fn replay_config(&mut self, serial: SerialNum) -> Result<Option<Arc<ConfigSnapshot>>> {
        let active = self.shared.state.active_config();
        if active.as_ref().is_some_and(|a| serial <= a.serial) {
            return Ok(None);
        }
        let snapshot = self
            .config_store
            .load_config(serial)
            .await?
            .ok_or(DocDbError::MissingConfig(serial))?;
        if let Some(active) = &active
            && snapshot.generation < active.generation
        {
            warn!(
                doc_type = %self.shared.doc_type,
                serial,
                generation = snapshot.generation,
                active_generation = active.generation,
                "Replayed config is older than the active one"
            );
            return Ok(None);
        }

        let snapshot = Arc::new(snapshot.with_serial(serial));
        let tasks = self.shared.sub_dbs.apply_config(&snapshot.config).await;
        self.runner.schedule(&snapshot.config, tasks);
        self.shared
            .write_filter
            .set_limits(snapshot.config.resource_limits.clone());
        self.shared.state.set_active_config(snapshot.clone())?;
        info!(
            doc_type = %self.shared.doc_type,
            serial,
            generation = snapshot.generation,
            "Replayed config"
        );
        Ok(Some(snapshot))
    }

    fn replay_progress(&mut self, progress: f32) {
        self.shared
            .state
            .set_progress(progress, "replaying transaction log");
    }
}

pub(crate) struct Master {
    feed_handler: FeedHandler,
    feed_view: FeedView,
    ctx: MasterContext,
    replay_start: SerialNum,
}

/// Body of the master task.
pub(crate) async fn run(
    shared: Arc<Shared>,
    mut receiver: mpsc::Receiver<MasterRequest>,
    handle: MasterHandle,
) {
    let mut master = match Master::load(shared.clone(), handle).await {
        Ok(master) => master,
        Err(e) => {
            fail(&shared, "load", &e);
            shared.writers.shutdown().await;
            return;
        }
    };

    match master.startup().await {
        Ok(()) if !master.ctx.is_closing() => master.serve(&mut receiver).await,
        Ok(()) => {}
        Err(e) => fail(&shared, "startup", &e),
    }
    master.shutdown().await;
}

/// Answer `reply`, handing a failure back to the caller as well.
fn reply_or_fail<T>(reply: oneshot::Sender<Result<T>>, result: Result<T>) -> Result<()> {
    match result {
        Ok(value) => {
            let _ = reply.send(Ok(value));
            Ok(())
        }
        Err(e) => {
            let _ = reply.send(Err(DocDbError::IllegalState(e.to_string())));
            Err(e)
        }
    }
}

fn fail(shared: &Shared, stage: &str, error: &DocDbError) {
    if shared.closing.load(Ordering::Acquire) {
        debug!(doc_type = %shared.doc_type, stage, error = %error, "Stopped by close");
        return;
    }
    error!(
        doc_type = %shared.doc_type,
        stage,
        error = %error,
        error_code = error.error_code(),
        "Document database failed"
    );
    shared.state.enter_dead(&error.to_string());
}

impl Master {
    /// `Load`: open the stores and bring the sub-databases up to their
    /// snapshots.
    async fn load(shared: Arc<Shared>, handle: MasterHandle) -> Result<Self> {
        shared.state.enter(DdbState::Load)?;

        let tlog = Arc::new(
            TransactionLog::open(
                TransactionLogConfig::new(shared.dir.join("tlog"))
                    .segment_size_limit(shared.options.tlog_segment_size),
            )
            .await?,
        );
        let _ = shared.tlog.set(tlog.clone());
        let config_store: Arc<dyn ConfigStore> =
            Arc::new(SqliteConfigStore::from_path(shared.dir.join("config.db")).await?);

        shared.sub_dbs.load().await?;

        let newest_flushed = shared
            .sub_dbs
            .iter()
            .map(|s| s.flushed_serial())
            .max()
            .unwrap_or(0);
        let known = tlog.last_serial().await.max(newest_flushed);
        let orphaned = config_store.remove_after(known).await?;
        if orphaned > 0 {
            info!(doc_type = %shared.doc_type, orphaned, "Removed configs never logged");
        }

        let mut feed_handler =
            FeedHandler::new(&shared.doc_type, tlog.clone(), shared.write_filter.clone());
        feed_handler.init(known).await;

        let live = shared.peek_pending_config();
        let initial_config = live.as_ref().map(|s| s.config.clone()).unwrap_or_default();
        let mut feed_view = FeedView::new(
            shared.sub_dbs.clone(),
            shared.writers.clone(),
            &initial_config,
        );
        {
            let handle = handle.clone();
            feed_view.set_commit_scheduler(Arc::new(move |delay| {
                let handle = handle.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = handle.send(MasterRequest::Commit).await;
                });
            }));
        }

        let replay_start = (shared.sub_dbs.oldest_flushed_serial() + 1).max(tlog.range().await.first);
        let maintenance = MaintenanceController::new(&shared.doc_type, shared.state.clone());
        let runner = ReprocessingRunner::with_counter(shared.reprocessing_runs.clone());

        let mut master = Self {
            feed_handler,
            feed_view,
            ctx: MasterContext {
                shared,
                config_store,
                runner,
                maintenance,
                handle,
            },
            replay_start,
        };
        master.load_initial_config().await?;
        Ok(master)
    }

    /// Activate the config that was in effect at the replay start.
    async fn load_initial_config(&mut self) -> Result<()> {
        let store = self.ctx.config_store.clone();
        let shared = self.ctx.shared.clone();

        if store.best_serial().await? == 0 {
            let live = shared.take_pending_config().ok_or_else(|| {
                DocDbError::IllegalState("no config stored and none given".to_string())
            })?;
            info!(doc_type = %shared.doc_type, generation = live.generation, "Recording first config");
            let snapshot = self.record_config(&live).await?;
            self.activate_initial(snapshot).await?;
            return Ok(());
        }

        let mut serial = store.prev_valid_serial(self.replay_start).await?;
        if serial == 0 {
            serial = store.oldest_serial().await?;
        }
        let snapshot = store
            .load_config(serial)
            .await?
            .ok_or(DocDbError::MissingConfig(serial))?;
        self.activate_initial(Arc::new(snapshot.with_serial(serial)))
            .await
    }

    async fn activate_initial(&mut self, snapshot: Arc<ConfigSnapshot>) -> Result<()> {
        let shared = &self.ctx.shared;
        let tasks = shared.sub_dbs.apply_config(&snapshot.config).await;
        self.ctx.runner.schedule(&snapshot.config, tasks);
        self.feed_view.reconfigure(&snapshot.config);
        shared
            .write_filter
            .set_limits(snapshot.config.resource_limits.clone());
        info!(
            doc_type = %shared.doc_type,
            serial = snapshot.serial,
            generation = snapshot.generation,
            "Initial config loaded"
        );
        shared.state.set_active_config(snapshot)
    }

    /// Save `snapshot` at the next serial and log its activation.
    async fn record_config(&mut self, snapshot: &ConfigSnapshot) -> Result<Arc<ConfigSnapshot>> {
        let serial = self.feed_handler.next_serial();
        let saved = snapshot.clone().with_serial(serial);
        self.ctx.config_store.save_config(&saved).await?;
        if let Err(e) = self.feed_handler.append_new_config(saved.generation).await {
            if let Err(remove) = self.ctx.config_store.remove_after(serial - 1).await {
                warn!(serial, error = %remove, "Failed to remove unlogged config");
            }
            return Err(e);
        }
        Ok(Arc::new(saved))
    }

    /// Replay through `Online`.
    async fn startup(&mut self) -> Result<()> {
        let state = self.ctx.shared.state.clone();

        state.enter(DdbState::ReplayTransactionLog)?;
        let last = self.feed_handler.tlog().last_serial().await;
        let stats = self
            .feed_handler
            .replay(self.replay_start, last, &mut self.feed_view, &mut self.ctx)
            .await?;
        if stats.aborted {
            return Ok(());
        }

        if !self.ctx.runner.is_empty() {
            state.enter(DdbState::RedoReprocess)?;
            self.run_reprocessing().await;
        }

        state.enter(DdbState::ApplyLiveConfig)?;
        if let Some(live) = self.ctx.shared.take_pending_config() {
            self.apply_live_config(live).await?;
        }
        self.apply_pending_prune().await?;

        if !self.ctx.runner.is_empty() {
            state.enter(DdbState::Reprocess)?;
            self.run_reprocessing().await;
        }

        state.enter(DdbState::Online)?;
        self.inject_maintenance_jobs();
        self.ctx.maintenance.start();
        Ok(())
    }

    async fn run_reprocessing(&mut self) {
        self.feed_view.force_commit_and_sync().await;
        let state = self.ctx.shared.state.clone();
        self.ctx
            .runner
            .run(&self.ctx.shared.sub_dbs, |progress, task| {
                state.set_progress(progress, format!("reprocessing: {}", task))
            })
            .await;
    }

    fn inject_maintenance_jobs(&mut self) {
        let Some(config) = self.ctx.shared.state.active_config() else {
            return;
        };
        let maintenance = &config.config.maintenance;
        let target: Arc<dyn MaintenanceTarget> = Arc::new(self.ctx.handle.clone());
        let controller = &mut self.ctx.maintenance;

        controller.register_job(Arc::new(HeartBeatJob::new(
            target.clone(),
            maintenance.heartbeat_interval(),
        )));
        for sub_db in [SubDbType::Ready, SubDbType::NotReady] {
            controller.register_job(Arc::new(LidSpaceCompactionJob::new(
                sub_db,
                maintenance.lid_space_compaction.clone(),
                self.ctx.shared.sub_dbs.clone(),
                target.clone(),
            )));
        }
        controller.register_job(Arc::new(PruneRemovedDocumentsJob::new(
            maintenance.prune_removed.clone(),
            target.clone(),
        )));
        controller.register_job(Arc::new(BucketMoveJob::new(
            maintenance.bucket_move.clone(),
            target,
        )));
    }

    /// Apply a config handed in by the host.
    ///
    /// The full config is recorded; attribute aspect flips on existing
    /// fields are held back until restart.
    async fn apply_live_config(&mut self, live: Arc<ConfigSnapshot>) -> Result<()> {
        let shared = self.ctx.shared.clone();
        let active = shared.state.active_config();
        if let Some(active) = &active
            && live.generation <= active.generation
        {
            debug!(
                doc_type = %shared.doc_type,
                generation = live.generation,
                active_generation = active.generation,
                "Live config is not newer, ignoring"
            );
            return Ok(());
        }

        let (effective, params, delayed) = match &active {
            Some(active) => {
                let delayed = delay_attribute_aspects(&active.config, &live.config);
                let params = ReconfigParams::compute(&active.config, &delayed.effective);
                (delayed.effective.clone(), params, delayed.delayed_fields)
            }
            None => (live.config.clone(), ReconfigParams::default(), Vec::new()),
        };

        let recorded = self.record_config(&live).await?;
        let snapshot = Arc::new(recorded.with_config(effective));

        if params.should_schema_change() || active.is_none() {
            self.feed_view.force_commit_and_sync().await;
            let tasks = shared.sub_dbs.apply_config(&snapshot.config).await;
            self.ctx.runner.schedule(&snapshot.config, tasks);
        }
        self.feed_view.reconfigure(&snapshot.config);
        if params.resource_limits_changed || active.is_none() {
            shared
                .write_filter
                .set_limits(snapshot.config.resource_limits.clone());
        }
        shared.state.set_active_config(snapshot.clone())?;

        if delayed.is_empty() {
            shared.state.set_config_state(ConfigState::Ok);
        } else {
            warn!(
                doc_type = %shared.doc_type,
                fields = ?delayed,
                "Attribute aspect changes need a restart"
            );
            shared.state.set_config_state(ConfigState::NeedRestart);
        }

        if params.should_maintenance_controller_change() && self.ctx.maintenance.is_started() {
            self.ctx.maintenance.kill_jobs().await;
            self.inject_maintenance_jobs();
        }

        info!(
            doc_type = %shared.doc_type,
            serial = snapshot.serial,
            generation = snapshot.generation,
            schema_changed = params.should_schema_change(),
            ready_mode_changed = params.ready_mode_changed,
            visibility_delay_changed = params.visibility_delay_changed,
            maintenance_changed = params.maintenance_changed,
            "Applied live config"
        );

        if !self.ctx.runner.is_empty() && shared.state.state() == DdbState::Online {
            shared.state.enter(DdbState::Reprocess)?;
            self.run_reprocessing().await;
            shared.state.enter(DdbState::Online)?;
        }
        Ok(())
    }

    async fn serve(&mut self, receiver: &mut mpsc::Receiver<MasterRequest>) {
        info!(doc_type = %self.ctx.shared.doc_type, "Master serving requests");
        while let Some(request) = receiver.recv().await {
            if let MasterRequest::Shutdown = request {
                break;
            }
            let name = request.name();
            if let Err(e) = self.handle(request).await {
                fail(&self.ctx.shared, name, &e);
                break;
            }
        }
    }

    /// Serve one request. An error is fatal for the document database.
    async fn handle(&mut self, request: MasterRequest) -> Result<()> {
        match request {
            MasterRequest::Feed { request, reply } => {
                self.feed_handler
                    .handle_request(request, &mut self.feed_view, Some(reply))
                    .await?;
            }
            MasterRequest::Reconfigure => {
                if let Some(live) = self.ctx.shared.take_pending_config() {
                    self.apply_live_config(live).await?;
                }
            }
            MasterRequest::Commit => self.feed_view.on_commit_timer(),
            MasterRequest::HeartBeat { reply } => {
                let result = self.heart_beat().await;
                let _ = reply.send(result);
            }
            MasterRequest::Flush { sub_db, reply } => {
                let result = self.flush(sub_db).await;
                let _ = reply.send(result);
            }
            MasterRequest::CompactLidSpace {
                sub_db,
                max_moves,
                reply,
            } => {
                let moved = self.feed_view.compact_lid_space(sub_db, max_moves).await;
                let _ = reply.send(Ok(moved));
            }
            MasterRequest::PruneRemoved {
                cutoff,
                limit,
                reply,
            } => {
                let documents = self
                    .ctx
                    .shared
                    .sub_dbs
                    .removed_before(cutoff, limit)
                    .await;
                let result = self
                    .feed_handler
                    .handle_prune(documents, &mut self.feed_view)
                    .await;
                reply_or_fail(reply, result)?;
            }
            MasterRequest::MoveBuckets { limit, reply } => {
                let result = self.move_buckets(limit).await;
                reply_or_fail(reply, result)?;
            }
            MasterRequest::SetClusterState { state, reply } => {
                debug!(doc_type = %self.ctx.shared.doc_type, ?state, "Cluster state changed");
                self.feed_view.set_cluster_state(state);
                let _ = reply.send(());
            }
            MasterRequest::Sync { reply } => {
                self.feed_view.force_commit_and_sync().await;
                let result = self
                    .feed_handler
                    .tlog()
                    .sync()
                    .await
                    .map_err(DocDbError::from);
                let _ = reply.send(result);
            }
            MasterRequest::Shutdown => {}
        }
        Ok(())
    }

    async fn heart_beat(&mut self) -> Result<()> {
        self.feed_view.commit();
        self.feed_handler.tlog().sync().await?;
        self.apply_pending_prune().await
    }

    async fn move_buckets(&mut self, limit: usize) -> Result<usize> {
        let candidates = self
            .ctx
            .shared
            .sub_dbs
            .documents_to_move(
                self.feed_view.ready_mode(),
                self.feed_view.cluster_state(),
                limit,
            )
            .await;
        let mut moved = 0;
        for candidate in candidates {
            if self
                .feed_handler
                .handle_move(candidate, &mut self.feed_view)
                .await?
            {
                moved += 1;
            }
        }
        if moved > 0 {
            debug!(doc_type = %self.ctx.shared.doc_type, moved, "Moved documents between sub-databases");
        }
        Ok(moved)
    }

    /// Flush `sub_db`, or every sub-database, at the current serial.
    async fn flush(&mut self, sub_db: Option<SubDbType>) -> Result<SerialNum> {
        self.feed_view.force_commit_and_sync().await;
        let serial = self.feed_handler.serial_num();
        let sub_dbs = self.ctx.shared.sub_dbs.clone();
        for target in sub_dbs.iter() {
            if sub_db.is_none_or(|t| t == target.sub_db_type()) {
                target.flush(serial).await?;
            }
        }
        let oldest = sub_dbs.oldest_flushed_serial();
        if let Some(pruned) = self.feed_handler.flush_done(oldest, &self.ctx).await? {
            self.prune_config_store(pruned).await?;
        }
        Ok(serial)
    }

    async fn apply_pending_prune(&mut self) -> Result<()> {
        if let Some(pruned) = self.feed_handler.apply_pending_prune(&self.ctx).await? {
            self.prune_config_store(pruned).await?;
        }
        Ok(())
    }

    /// Drop configs no replay from after `pruned` can need: everything older
    /// than the newest config at or below `pruned`.
    async fn prune_config_store(&self, pruned: SerialNum) -> Result<()> {
        let keep = self.ctx.config_store.prev_valid_serial(pruned + 1).await?;
        if keep > 0 {
            let removed = self.ctx.config_store.prune(keep).await?;
            if removed > 0 {
                debug!(doc_type = %self.ctx.shared.doc_type, keep, removed, "Pruned config store");
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        let doc_type = self.ctx.shared.doc_type.clone();
        self.ctx.maintenance.stop().await;
        self.feed_view.force_commit_and_sync().await;
        if let Err(e) = self.feed_handler.tlog().sync().await {
            warn!(doc_type = %doc_type, error = %e, "Failed to sync transaction log on shutdown");
        }
        self.ctx.shared.writers.shutdown().await;
        info!(doc_type = %doc_type, serial = self.feed_handler.serial_num(), "Master stopped");
    }
}
