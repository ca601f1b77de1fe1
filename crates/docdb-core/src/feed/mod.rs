// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Feed handling: the single-writer funnel of a document database.
//!
//! Every mutating request passes through [`FeedHandler`] on the master task:
//!
//! 1. The resource write filter may reject puts and updates.
//! 2. Operations older than the stored version are dropped as outdated.
//! 3. A serial number is assigned and the operation is appended to the
//!    transaction log.
//! 4. The [`FeedView`] applies it to the sub-databases; the caller's reply
//!    fires when every writer job of the operation has finished.
//!
//! After a restart the same handler replays the log through the view. Replay
//! is idempotent: sub-databases skip serials already covered by their
//! snapshot, and operations older than the persisted version are skipped.

pub mod view;
pub mod visibility;
pub mod write_filter;

use std::sync::Arc;

use async_trait::async_trait;
use docdb_tlog::{SerialNum, TransactionLog};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::config_snapshot::ConfigSnapshot;
use crate::document::{BucketId, Document, DocumentId, FieldUpdate, GlobalId, Timestamp};
use crate::error::{DocDbError, Result};
use crate::executor::OperationDone;
use crate::operation::{DbDocumentId, FeedOperation, OperationMeta, PrunedDocument};
use crate::subdb::{DocumentLocation, MoveCandidate, SubDbType};

pub use view::{CommitScheduler, FeedView};
pub use visibility::{CommitAction, VisibilityHandler};
pub use write_filter::{ResourceUsage, ResourceUsageFilter};

/// Bits of the global id used to derive a document's bucket.
pub const BUCKET_BITS: u8 = 16;

/// Outcome of a feed request, delivered to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedResult {
    Ok,
    /// Older than the stored version; dropped without logging.
    Ignored,
    ResourceExhausted(String),
    Update { found: bool, created: bool },
    Remove { found: bool },
    Rejected { code: String, message: String },
}

impl FeedResult {
    pub fn rejected(error: &DocDbError) -> Self {
        Self::Rejected {
            code: error.error_code().to_string(),
            message: error.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, Self::ResourceExhausted(_) | Self::Rejected { .. })
    }
}

/// A client write.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedRequest {
    Put {
        document: Document,
        timestamp: Timestamp,
    },
    Update {
        id: DocumentId,
        updates: Vec<FieldUpdate>,
        timestamp: Timestamp,
        create_if_non_existent: bool,
    },
    Remove {
        id: DocumentId,
        timestamp: Timestamp,
    },
}

impl FeedRequest {
    pub fn id(&self) -> &DocumentId {
        match self {
            Self::Put { document, .. } => &document.id,
            Self::Update { id, .. } | Self::Remove { id, .. } => id,
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        match self {
            Self::Put { timestamp, .. }
            | Self::Update { timestamp, .. }
            | Self::Remove { timestamp, .. } => *timestamp,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Put { .. } => "put",
            Self::Update { .. } => "update",
            Self::Remove { .. } => "remove",
        }
    }
}

/// What the feed handler needs to know about its document database.
pub trait FeedHandlerOwner: Send + Sync {
    /// Whether the transaction log may be pruned in the current state.
    fn allow_prune(&self) -> bool;

    /// Close was requested; long-running work should stop.
    fn is_closing(&self) -> bool;

    fn on_transaction_log_replay_done(&self);
}

/// Applies config changes found while replaying the transaction log.
#[async_trait]
pub trait ReplayConfig: Send {
    /// A `NewConfig` entry at `serial` was replayed. Returns the snapshot
    /// that became active, or `None` if it is not newer than the current one.
    async fn replay_config(&mut self, serial: SerialNum) -> Result<Option<Arc<ConfigSnapshot>>>;

    fn replay_progress(&mut self, progress: f32);
}

/// Counters from one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub replayed: usize,
    pub skipped: usize,
    pub configs: usize,
    pub last_serial: SerialNum,
    pub aborted: bool,
}

const PROGRESS_EVERY: usize = 1000;

pub struct FeedHandler {
    doc_type: String,
    tlog: Arc<TransactionLog>,
    write_filter: Arc<ResourceUsageFilter>,
    serial_num: SerialNum,
    pruned_serial: SerialNum,
    pending_prune: Option<SerialNum>,
}

impl std::fmt::Debug for FeedHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedHandler")
            .field("doc_type", &self.doc_type)
            .field("serial_num", &self.serial_num)
            .field("pruned_serial", &self.pruned_serial)
            .field("pending_prune", &self.pending_prune)
            .finish_non_exhaustive()
    }
}

impl FeedHandler {
    pub fn new(
        doc_type: impl Into<String>,
        tlog: Arc<TransactionLog>,
        write_filter: Arc<ResourceUsageFilter>,
    ) -> Self {
        Self {
            doc_type: doc_type.into(),
            tlog,
            write_filter,
            serial_num: 0,
            pruned_serial: 0,
            pending_prune: None,
        }
    }

    /// Continue numbering after `serial`, the highest serial known to be used
    /// by the log, the config store or any snapshot.
    pub async fn init(&mut self, serial: SerialNum) {
        self.serial_num = serial.max(self.tlog.last_serial().await);
        self.pruned_serial = self.tlog.pruned_serial().await;
        debug!(doc_type = %self.doc_type, serial = self.serial_num, "Feed handler initialized");
    }

    pub fn tlog(&self) -> &Arc<TransactionLog> {
        &self.tlog
    }

    pub fn write_filter(&self) -> &Arc<ResourceUsageFilter> {
        &self.write_filter
    }

    /// Last assigned serial number.
    pub fn serial_num(&self) -> SerialNum {
        self.serial_num
    }

    /// Serial the next appended operation gets.
    pub fn next_serial(&self) -> SerialNum {
        self.serial_num + 1
    }

    pub fn pruned_serial(&self) -> SerialNum {
        self.pruned_serial
    }

    pub fn pending_prune(&self) -> Option<SerialNum> {
        self.pending_prune
    }

    /// Assign the next serial to `op` and append it to the log.
    pub async fn append(&mut self, op: &mut FeedOperation) -> Result<SerialNum> {
        let serial = self.next_serial();
        op.meta_mut().serial = serial;
        let entry = op.to_entry()?;
        if let Err(e) = self.tlog.append(&entry).await {
            error!(
                doc_type = %self.doc_type,
                serial,
                kind = op.kind(),
                error = %e,
                "Failed to append to transaction log"
            );
            return Err(e.into());
        }
        self.serial_num = serial;
        Ok(serial)
    }

    fn prepare_meta(gid: &GlobalId, timestamp: Timestamp) -> OperationMeta {
        OperationMeta::new(BucketId::for_gid(gid, BUCKET_BITS), timestamp)
    }

    /// Handle one client write. `reply` receives the [`FeedResult`] once the
    /// operation is visible in the stores.
    ///
    /// An error means the transaction log failed; the caller has already
    /// been answered with a rejection.
    pub async fn handle_request(
        &mut self,
        request: FeedRequest,
        view: &mut FeedView,
        reply: Option<oneshot::Sender<FeedResult>>,
    ) -> Result<()> {
        let respond = |reply: Option<oneshot::Sender<FeedResult>>, result: FeedResult| {
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        };

        if request.id().doc_type() != self.doc_type {
            let error = DocDbError::InvalidDocumentId {
                id: request.id().to_string(),
                reason: format!("document type is not '{}'", self.doc_type),
            };
            respond(reply, FeedResult::rejected(&error));
            return Ok(());
        }

        if !matches!(request, FeedRequest::Remove { .. })
            && !self.write_filter.accept_write_operation()
        {
            let message = self.write_filter.message();
            debug!(doc_type = %self.doc_type, kind = request.kind(), %message, "Write rejected");
            respond(reply, FeedResult::ResourceExhausted(message));
            return Ok(());
        }

        let gid = request.id().global_id();
        let newest = view.newest(&gid).await;
        if let Some(prev) = &newest
            && prev.meta.timestamp >= request.timestamp()
        {
            debug!(
                doc_type = %self.doc_type,
                kind = request.kind(),
                gid = %gid,
                timestamp = request.timestamp(),
                prev_timestamp = prev.meta.timestamp,
                "Ignoring outdated operation"
            );
            respond(reply, FeedResult::Ignored);
            return Ok(());
        }

        let result = match request {
            FeedRequest::Put {
                document,
                timestamp,
            } => {
                let target = view.target_sub_db(&gid);
                self.put(view, target, document, timestamp, reply, FeedResult::Ok)
                    .await
            }
            FeedRequest::Update {
                id,
                updates,
                timestamp,
                create_if_non_existent,
            } => {
                self.update(
                    view,
                    id,
                    updates,
                    timestamp,
                    create_if_non_existent,
                    newest,
                    reply,
                )
                .await
            }
            FeedRequest::Remove { id, timestamp } => {
                self.remove(view, id, timestamp, newest, reply).await
            }
        };
        if result.is_ok() {
            view.after_operation();
        }
        result
    }

    async fn put(
        &mut self,
        view: &mut FeedView,
        target: SubDbType,
        document: Document,
        timestamp: Timestamp,
        reply: Option<oneshot::Sender<FeedResult>>,
        result: FeedResult,
    ) -> Result<()> {
        let gid = document.id.global_id();
        let mut meta = Self::prepare_meta(&gid, timestamp);
        meta.db_document_id = Some(view.peek_location(target, &gid).await);
        let bucket = meta.bucket;

        let mut op = FeedOperation::Put {
            meta,
            document: document.clone(),
        };
        let serial = match self.append(&mut op).await {
            Ok(serial) => serial,
            Err(e) => {
                if let Some(reply) = reply {
                    let _ = reply.send(FeedResult::rejected(&e));
                }
                return Err(e);
            }
        };

        let done = OperationDone::new(reply, result);
        view.apply_put(serial, target, gid, bucket, timestamp, Some(document), &done)
            .await;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn update(
        &mut self,
        view: &mut FeedView,
        id: DocumentId,
        updates: Vec<FieldUpdate>,
        timestamp: Timestamp,
        create_if_non_existent: bool,
        newest: Option<DocumentLocation>,
        reply: Option<oneshot::Sender<FeedResult>>,
    ) -> Result<()> {
        let existing = match newest.as_ref().filter(|loc| loc.sub_db.stores_documents()) {
            Some(location) => view
                .read_document(location)
                .await
                .map(|document| (*location, document)),
            None => None,
        };

        let Some((location, mut document)) = existing else {
            if !create_if_non_existent {
                if let Some(reply) = reply {
                    let _ = reply.send(FeedResult::Update {
                        found: false,
                        created: false,
                    });
                }
                return Ok(());
            }
            let mut document = Document::new(id);
            for update in &updates {
                update.apply_to(&mut document);
            }
            let target = view.target_sub_db(&document.id.global_id());
            let result = FeedResult::Update {
                found: false,
                created: true,
            };
            return self
                .put(view, target, document, timestamp, reply, result)
                .await;
        };

        for update in &updates {
            update.apply_to(&mut document);
        }

        let gid = id.global_id();
        let mut meta = Self::prepare_meta(&gid, timestamp);
        meta.db_document_id = Some(DbDocumentId::new(location.sub_db, location.lid));
        let bucket = meta.bucket;
        let mut op = FeedOperation::Update {
            meta,
            id,
            updates,
            create_if_non_existent,
        };
        let serial = match self.append(&mut op).await {
            Ok(serial) => serial,
            Err(e) => {
                if let Some(reply) = reply {
                    let _ = reply.send(FeedResult::rejected(&e));
                }
                return Err(e);
            }
        };

        let done = OperationDone::new(
            reply,
            FeedResult::Update {
                found: true,
                created: false,
            },
        );
        view.apply_put(
            serial,
            location.sub_db,
            gid,
            bucket,
            timestamp,
            Some(document),
            &done,
        )
        .await;
        Ok(())
    }

    async fn remove(
        &mut self,
        view: &mut FeedView,
        id: DocumentId,
        timestamp: Timestamp,
        newest: Option<DocumentLocation>,
        reply: Option<oneshot::Sender<FeedResult>>,
    ) -> Result<()> {
        let gid = id.global_id();
        let found = newest
            .as_ref()
            .is_some_and(|loc| loc.sub_db != SubDbType::Removed);

        let mut meta = Self::prepare_meta(&gid, timestamp);
        meta.db_document_id = Some(view.peek_location(SubDbType::Removed, &gid).await);
        let bucket = meta.bucket;
        let mut op = FeedOperation::Remove { meta, id };
        let serial = match self.append(&mut op).await {
            Ok(serial) => serial,
            Err(e) => {
                if let Some(reply) = reply {
                    let _ = reply.send(FeedResult::rejected(&e));
                }
                return Err(e);
            }
        };

        let done = OperationDone::new(reply, FeedResult::Remove { found });
        view.apply_put(serial, SubDbType::Removed, gid, bucket, timestamp, None, &done)
            .await;
        Ok(())
    }

    /// Log and apply a sub-database move found by the bucket mover.
    ///
    /// Returns `false` if the document changed since it was selected.
    pub async fn handle_move(&mut self, candidate: MoveCandidate, view: &mut FeedView) -> Result<bool> {
        let gid = candidate.meta.gid;
        let current = view.newest(&gid).await;
        let unchanged = current.as_ref().is_some_and(|loc| {
            loc.sub_db == candidate.source && loc.meta.timestamp == candidate.meta.timestamp
        });
        if !unchanged {
            debug!(gid = %gid, "Skipping move of changed document");
            return Ok(false);
        }

        let timestamp = candidate.meta.timestamp;
        let mut meta = Self::prepare_meta(&gid, timestamp);
        meta.bucket = candidate.meta.bucket;
        meta.db_document_id = Some(view.peek_location(candidate.target, &gid).await);
        let mut op = FeedOperation::Move {
            meta,
            document: candidate.document.clone(),
            source: candidate.source,
            target: candidate.target,
        };
        let serial = self.append(&mut op).await?;

        let done = OperationDone::detached();
        view.apply_put(
            serial,
            candidate.target,
            gid,
            candidate.meta.bucket,
            timestamp,
            Some(candidate.document),
            &done,
        )
        .await;
        view.after_operation();
        Ok(true)
    }

    /// Log and apply removal of old tombstones. Returns how many were pruned.
    pub async fn handle_prune(
        &mut self,
        documents: Vec<PrunedDocument>,
        view: &mut FeedView,
    ) -> Result<usize> {
        if documents.is_empty() {
            return Ok(0);
        }
        let meta = OperationMeta::new(BucketId::default_bucket(), 0);
        let mut op = FeedOperation::PruneRemoved {
            meta,
            documents: documents.clone(),
        };
        let serial = self.append(&mut op).await?;
        let pruned = view.apply_prune(serial, &documents).await;
        debug!(doc_type = %self.doc_type, serial, pruned, "Pruned removed documents");
        Ok(pruned)
    }

    /// Log activation of the config saved at the next serial.
    pub async fn append_new_config(&mut self, generation: i64) -> Result<SerialNum> {
        let meta = OperationMeta::new(BucketId::default_bucket(), 0);
        let mut op = FeedOperation::NewConfig { meta, generation };
        self.append(&mut op).await
    }

    /// Log a no-op entry, used to mark the log position on heartbeats.
    pub async fn append_noop(&mut self) -> Result<SerialNum> {
        let meta = OperationMeta::new(BucketId::default_bucket(), 0);
        let mut op = FeedOperation::NoOp { meta };
        self.append(&mut op).await
    }

    /// Replay logged operations `from..=to` through `view`.
    pub async fn replay<O>(
        &mut self,
        from: SerialNum,
        to: SerialNum,
        view: &mut FeedView,
        owner: &mut O,
    ) -> Result<ReplayStats>
    where
        O: FeedHandlerOwner + ReplayConfig,
    {
        let mut stats = ReplayStats::default();
        info!(doc_type = %self.doc_type, from, to, "Replaying transaction log");

        let entries = if from <= to {
            self.tlog.replay(from, to).await?
        } else {
            Vec::new()
        };
        let total = entries.len();

        for (idx, entry) in entries.iter().enumerate() {
            if owner.is_closing() {
                warn!(
                    doc_type = %self.doc_type,
                    serial = entry.serial,
                    "Replay aborted by close"
                );
                stats.aborted = true;
                break;
            }

            let op = FeedOperation::from_entry(entry)?;
            if matches!(op, FeedOperation::NewConfig { .. }) {
                // the schema diff must see every document replayed so far
                view.force_commit_and_sync().await;
                if let Some(snapshot) = owner.replay_config(op.serial()).await? {
                    view.reconfigure(&snapshot.config);
                    stats.configs += 1;
                }
            } else if self.replay_operation(op, view).await {
                stats.replayed += 1;
            } else {
                stats.skipped += 1;
            }
            stats.last_serial = entry.serial;

            if (idx + 1) % PROGRESS_EVERY == 0 {
                owner.replay_progress((idx + 1) as f32 / total as f32);
            }
        }

        view.force_commit_and_sync().await;
        if !stats.aborted {
            owner.replay_progress(1.0);
            owner.on_transaction_log_replay_done();
        }
        info!(
            doc_type = %self.doc_type,
            replayed = stats.replayed,
            skipped = stats.skipped,
            configs = stats.configs,
            last_serial = stats.last_serial,
            aborted = stats.aborted,
            "Transaction log replay finished"
        );
        Ok(stats)
    }

    /// Apply one logged operation. Returns `false` if it was outdated.
    async fn replay_operation(&mut self, op: FeedOperation, view: &mut FeedView) -> bool {
        let serial = op.serial();
        let timestamp = op.timestamp();
        let done = OperationDone::detached();

        let newest = match op.gid() {
            Some(gid) => view.newest(&gid).await,
            None => None,
        };
        let outdated = match (&op, &newest) {
            (FeedOperation::Move { .. }, Some(loc)) => loc.meta.timestamp > timestamp,
            (_, Some(loc)) => loc.meta.timestamp >= timestamp,
            _ => false,
        };
        if outdated {
            if let (Some(gid), Some(loc)) = (op.gid(), &newest) {
                view.remove_superseded(serial, &gid, loc.meta.timestamp, &done)
                    .await;
            }
            return false;
        }

        match op {
            FeedOperation::Put { meta, document } => {
                let gid = document.id.global_id();
                let target = meta
                    .db_document_id
                    .map(|d| d.sub_db)
                    .unwrap_or_else(|| view.target_sub_db(&gid));
                view.apply_put(serial, target, gid, meta.bucket, timestamp, Some(document), &done)
                    .await;
            }
            FeedOperation::Update {
                meta, id, updates, ..
            } => {
                let gid = id.global_id();
                let Some(location) = newest.filter(|loc| loc.sub_db.stores_documents()) else {
                    warn!(serial, gid = %gid, "Replayed update has no document to update");
                    return false;
                };
                let Some(mut document) = view.read_document(&location).await else {
                    warn!(serial, gid = %gid, "Replayed update has no stored document");
                    return false;
                };
                for update in &updates {
                    update.apply_to(&mut document);
                }
                view.apply_put(
                    serial,
                    location.sub_db,
                    gid,
                    meta.bucket,
                    timestamp,
                    Some(document),
                    &done,
                )
                .await;
            }
            FeedOperation::Remove { meta, id } => {
                view.apply_put(
                    serial,
                    SubDbType::Removed,
                    id.global_id(),
                    meta.bucket,
                    timestamp,
                    None,
                    &done,
                )
                .await;
            }
            FeedOperation::Move {
                meta,
                document,
                target,
                ..
            } => {
                let gid = document.id.global_id();
                view.apply_put(serial, target, gid, meta.bucket, timestamp, Some(document), &done)
                    .await;
            }
            FeedOperation::PruneRemoved { documents, .. } => {
                view.apply_prune(serial, &documents).await;
            }
            FeedOperation::NoOp { .. } | FeedOperation::NewConfig { .. } => {}
        }
        true
    }

    /// Sub-databases have flushed everything up to `serial`.
    ///
    /// Prunes the log if the owner allows it, otherwise remembers the
    /// request. Returns the new prune watermark if the log was pruned.
    pub async fn flush_done(
        &mut self,
        serial: SerialNum,
        owner: &dyn FeedHandlerOwner,
    ) -> Result<Option<SerialNum>> {
        let target = serial.min(self.serial_num);
        if target <= self.pruned_serial {
            return Ok(None);
        }
        if !owner.allow_prune() {
            let pending = self.pending_prune.map_or(target, |p| p.max(target));
            debug!(doc_type = %self.doc_type, serial = pending, "Deferring transaction log prune");
            self.pending_prune = Some(pending);
            return Ok(None);
        }
        self.prune(target).await.map(Some)
    }

    /// Apply a deferred prune once the owner allows it.
    pub async fn apply_pending_prune(
        &mut self,
        owner: &dyn FeedHandlerOwner,
    ) -> Result<Option<SerialNum>> {
        match self.pending_prune {
            Some(serial) if owner.allow_prune() => {
                if serial <= self.pruned_serial {
                    self.pending_prune = None;
                    return Ok(None);
                }
                self.prune(serial).await.map(Some)
            }
            _ => Ok(None),
        }
    }

    async fn prune(&mut self, serial: SerialNum) -> Result<SerialNum> {
        if let Err(e) = self.tlog.prune(serial).await {
            error!(doc_type = %self.doc_type, serial, error = %e, "Failed to prune transaction log");
            return Err(e.into());
        }
        self.pruned_serial = serial;
        if self.pending_prune.is_some_and(|p| p <= serial) {
            self.pending_prune = None;
        }
        Ok(serial)
    }
}
