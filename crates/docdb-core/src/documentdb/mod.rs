// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The document database of one document type.
//!
//! [`DocumentDb`] is the handle the host holds. Writes, config changes,
//! flushes and maintenance all go through the master task (see `master`),
//! which serializes them in arrival order. Reads go straight to the
//! sub-database stores and never wait for the master.

mod master;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use docdb_tlog::{SerialNum, TransactionLog};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cluster_state::ClusterState;
use crate::config_snapshot::ConfigSnapshot;
use crate::document::{Document, DocumentId, FieldUpdate, Timestamp};
use crate::error::{DocDbError, Result};
use crate::executor::WriteExecutors;
use crate::feed::{FeedRequest, FeedResult, ResourceUsage, ResourceUsageFilter};
use crate::owner::DocumentDbOwner;
use crate::state::{DdbState, DdbStateHandle, StatusReport};
use crate::subdb::{DocumentSubDb, SubDbCollection, SubDbStats, SubDbType};

use master::{MasterHandle, MasterRequest};

/// Capacity of the master request queue. Feeders wait when it is full.
const MASTER_QUEUE_SIZE: usize = 1024;

/// Default transaction log segment size: 64 MiB.
pub const DEFAULT_TLOG_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// Process-level options of a document database.
#[derive(Debug, Clone)]
pub struct DocumentDbOptions {
    pub tlog_segment_size: u64,
}

impl Default for DocumentDbOptions {
    fn default() -> Self {
        Self {
            tlog_segment_size: DEFAULT_TLOG_SEGMENT_SIZE,
        }
    }
}

/// State shared between the handle and the master task.
pub(crate) struct Shared {
    pub(crate) doc_type: String,
    pub(crate) dir: PathBuf,
    pub(crate) options: DocumentDbOptions,
    pub(crate) state: Arc<DdbStateHandle>,
    pub(crate) closing: AtomicBool,
    /// Newest config handed in by the host and not yet applied.
    pending_config: Mutex<Option<Arc<ConfigSnapshot>>>,
    pub(crate) sub_dbs: Arc<SubDbCollection>,
    pub(crate) writers: Arc<WriteExecutors>,
    pub(crate) write_filter: Arc<ResourceUsageFilter>,
    pub(crate) reprocessing_runs: Arc<AtomicU64>,
    /// Set once the master has opened the log.
    pub(crate) tlog: OnceLock<Arc<TransactionLog>>,
}

impl Shared {
    pub(crate) fn peek_pending_config(&self) -> Option<Arc<ConfigSnapshot>> {
        self.pending_config
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn take_pending_config(&self) -> Option<Arc<ConfigSnapshot>> {
        self.pending_config
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Store `snapshot` unless a newer one is already waiting.
    fn offer_pending_config(&self, snapshot: Arc<ConfigSnapshot>) {
        let mut pending = self.pending_config.lock().unwrap_or_else(|e| e.into_inner());
        if pending
            .as_ref()
            .is_none_or(|p| p.generation < snapshot.generation)
        {
            *pending = Some(snapshot);
        }
    }
}

/// Something that can persist in-memory state so the transaction log can be
/// pruned up to its flushed serial.
#[async_trait]
pub trait FlushTarget: Send + Sync {
    fn name(&self) -> String;

    /// Serial covered by the last flush.
    fn flushed_serial(&self) -> SerialNum;

    fn last_flush_time(&self) -> Option<DateTime<Utc>>;

    /// Flush at the current serial. Returns the new flushed serial.
    async fn flush(&self) -> Result<SerialNum>;
}

/// One sub-database as a [`FlushTarget`]. Flushes run on the master task so
/// they see a consistent serial.
struct SubDbFlushTarget {
    doc_type: String,
    sub_db: Arc<DocumentSubDb>,
    master: MasterHandle,
}

#[async_trait]
impl FlushTarget for SubDbFlushTarget {
    fn name(&self) -> String {
        format!("{}.{}", self.doc_type, self.sub_db.sub_db_type())
    }

    fn flushed_serial(&self) -> SerialNum {
        self.sub_db.flushed_serial()
    }

    fn last_flush_time(&self) -> Option<DateTime<Utc>> {
        self.sub_db.last_flush_time()
    }

    async fn flush(&self) -> Result<SerialNum> {
        let sub_db = Some(self.sub_db.sub_db_type());
        self.master
            .request(|reply| MasterRequest::Flush { sub_db, reply })
            .await?
    }
}

/// Transaction log figures in [`DocumentDbStats`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransactionLogStats {
    pub first_serial: SerialNum,
    pub last_serial: SerialNum,
    pub pruned_serial: SerialNum,
    pub disk_usage: u64,
    pub segments: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentDbStats {
    pub doc_type: String,
    pub state: DdbState,
    pub transaction_log: TransactionLogStats,
    pub sub_dbs: Vec<SubDbStats>,
    pub reprocessing_runs: u64,
    pub memory_usage: usize,
    pub resource_usage: ResourceUsage,
}

/// Handle to the document database of one document type.
pub struct DocumentDb {
    shared: Arc<Shared>,
    master: MasterHandle,
    receiver: Mutex<Option<mpsc::Receiver<MasterRequest>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    owner: Option<Arc<dyn DocumentDbOwner>>,
}

impl std::fmt::Debug for DocumentDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentDb")
            .field("doc_type", &self.shared.doc_type)
            .field("dir", &self.shared.dir)
            .field("state", &self.shared.state.state())
            .field("master", &"...")
            .finish()
    }
}

impl DocumentDb {
    /// Create the database in `dir` for `config.doc_type`. Nothing is read
    /// from disk until [`start`](Self::start).
    ///
    /// `config` is the live config: it is recorded on first start and
    /// applied after replay on later starts. Must be called within a tokio
    /// runtime.
    pub fn new(
        dir: impl Into<PathBuf>,
        config: ConfigSnapshot,
        owner: Option<Arc<dyn DocumentDbOwner>>,
        options: DocumentDbOptions,
    ) -> Self {
        let dir = dir.into();
        let doc_type = config.doc_type.clone();
        let sub_dbs = Arc::new(SubDbCollection::new(&dir, &config.config));
        let write_filter = Arc::new(ResourceUsageFilter::new(
            config.config.resource_limits.clone(),
        ));
        let (sender, receiver) = mpsc::channel(MASTER_QUEUE_SIZE);

        let shared = Arc::new(Shared {
            doc_type: doc_type.clone(),
            dir,
            options,
            state: Arc::new(DdbStateHandle::new(&doc_type, owner.clone())),
            closing: AtomicBool::new(false),
            pending_config: Mutex::new(Some(Arc::new(config))),
            sub_dbs,
            writers: Arc::new(WriteExecutors::new()),
            write_filter,
            reprocessing_runs: Arc::new(AtomicU64::new(0)),
            tlog: OnceLock::new(),
        });

        Self {
            shared,
            master: MasterHandle::new(sender),
            receiver: Mutex::new(Some(receiver)),
            task: Mutex::new(None),
            owner,
        }
    }

    pub fn doc_type(&self) -> &str {
        &self.shared.doc_type
    }

    pub fn dir(&self) -> &Path {
        &self.shared.dir
    }

    /// Distribution key of the hosting node, `0` without an owner.
    pub fn distribution_key(&self) -> u32 {
        self.owner.as_ref().map_or(0, |o| o.distribution_key())
    }

    /// Spawn the master task. Startup continues in the background; use
    /// [`wait_for_online`](Self::wait_for_online) to wait for it.
    pub fn start(&self) -> Result<()> {
        if self.shared.closing.load(Ordering::Acquire) {
            return Err(DocDbError::Closed);
        }
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| DocDbError::IllegalState("already started".to_string()))?;

        info!(
            doc_type = %self.shared.doc_type,
            dir = %self.shared.dir.display(),
            "Starting document database"
        );
        let handle = tokio::spawn(master::run(
            self.shared.clone(),
            receiver,
            self.master.clone(),
        ));
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    pub async fn wait_for_online(&self) -> Result<()> {
        self.shared.state.wait_for_online().await
    }

    pub fn state(&self) -> DdbState {
        self.shared.state.state()
    }

    pub fn status(&self) -> StatusReport {
        self.shared.state.status()
    }

    pub fn active_config(&self) -> Option<Arc<ConfigSnapshot>> {
        self.shared.state.active_config()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.closing.load(Ordering::Acquire) || self.state().is_closed() {
            return Err(DocDbError::Closed);
        }
        Ok(())
    }

    /// Apply `snapshot` and wait until it is active.
    ///
    /// Returns right away if the active generation is already at least as
    /// new. Fails with `IllegalState` if the database is or becomes closed.
    pub async fn reconfigure(&self, snapshot: ConfigSnapshot) -> Result<()> {
        if self.shared.closing.load(Ordering::Acquire) || self.state().is_closed() {
            return Err(DocDbError::IllegalState(
                "document database is closed".to_string(),
            ));
        }
        if snapshot.doc_type != self.shared.doc_type {
            return Err(DocDbError::IllegalState(format!(
                "config for '{}' given to document database '{}'",
                snapshot.doc_type, self.shared.doc_type
            )));
        }
        let generation = snapshot.generation;
        if self
            .active_config()
            .is_some_and(|active| active.generation >= generation)
        {
            return Ok(());
        }

        debug!(doc_type = %self.shared.doc_type, generation, "Reconfigure requested");
        self.shared.offer_pending_config(Arc::new(snapshot));
        if self.master.send(MasterRequest::Reconfigure).await.is_err() {
            return Err(DocDbError::IllegalState(
                "document database is closed".to_string(),
            ));
        }
        self.shared.state.wait_for_generation(generation).await
    }

    /// Submit one write and wait for its result.
    pub async fn feed(&self, request: FeedRequest) -> Result<FeedResult> {
        self.ensure_open()?;
        self.master
            .request(|reply| MasterRequest::Feed { request, reply })
            .await
    }

    pub async fn put(&self, document: Document, timestamp: Timestamp) -> Result<FeedResult> {
        self.feed(FeedRequest::Put {
            document,
            timestamp,
        })
        .await
    }

    pub async fn update(
        &self,
        id: DocumentId,
        updates: Vec<FieldUpdate>,
        timestamp: Timestamp,
        create_if_non_existent: bool,
    ) -> Result<FeedResult> {
        self.feed(FeedRequest::Update {
            id,
            updates,
            timestamp,
            create_if_non_existent,
        })
        .await
    }

    pub async fn remove(&self, id: DocumentId, timestamp: Timestamp) -> Result<FeedResult> {
        self.feed(FeedRequest::Remove { id, timestamp }).await
    }

    /// Stored version of `id`, from the ready or not-ready sub-database.
    pub async fn get(&self, id: &DocumentId) -> Result<Option<Document>> {
        self.ensure_open()?;
        let Some(location) = self.shared.sub_dbs.newest(&id.global_id()).await else {
            return Ok(None);
        };
        if !location.sub_db.stores_documents() {
            return Ok(None);
        }
        Ok(self.shared.sub_dbs.get(location.sub_db).document(location.lid).await)
    }

    /// Attribute value of `field` for `id`.
    pub async fn attribute(&self, id: &DocumentId, field: &str) -> Result<Option<Value>> {
        self.ensure_open()?;
        let Some(location) = self.shared.sub_dbs.newest(&id.global_id()).await else {
            return Ok(None);
        };
        if !location.sub_db.stores_documents() {
            return Ok(None);
        }
        let sub_db = self.shared.sub_dbs.get(location.sub_db);
        let attributes = sub_db.attributes.read().await;
        Ok(attributes.get(field, location.lid).cloned())
    }

    /// Ready documents whose `field` contains `term`. Only committed index
    /// changes are visible.
    pub async fn search(&self, field: &str, term: &str) -> Result<Vec<Document>> {
        self.ensure_open()?;
        let ready = self.shared.sub_dbs.get(SubDbType::Ready);
        let lids = match &ready.index {
            Some(index) => index.read().await.search(field, term),
            None => Vec::new(),
        };
        if lids.is_empty() {
            return Ok(Vec::new());
        }

        // lids removed since the last commit are still in the index
        let live: Vec<_> = {
            let meta = ready.meta_store.read().await;
            lids.into_iter().filter(|lid| meta.get(*lid).is_some()).collect()
        };
        let summary = ready.summary.read().await;
        Ok(live
            .into_iter()
            .filter_map(|lid| summary.get(lid).cloned())
            .collect())
    }

    /// One flush target per sub-database.
    pub fn flush_targets(&self) -> Vec<Arc<dyn FlushTarget>> {
        self.shared
            .sub_dbs
            .iter()
            .map(|sub_db| {
                Arc::new(SubDbFlushTarget {
                    doc_type: self.shared.doc_type.clone(),
                    sub_db: sub_db.clone(),
                    master: self.master.clone(),
                }) as Arc<dyn FlushTarget>
            })
            .collect()
    }

    /// Flush every sub-database and prune what the flush made redundant.
    /// Returns the flushed serial.
    pub async fn flush_all(&self) -> Result<SerialNum> {
        self.ensure_open()?;
        self.master
            .request(|reply| MasterRequest::Flush {
                sub_db: None,
                reply,
            })
            .await?
    }

    /// Wait until every applied write is searchable and the log is synced.
    pub async fn sync(&self) -> Result<()> {
        self.ensure_open()?;
        self.master
            .request(|reply| MasterRequest::Sync { reply })
            .await?
    }

    pub fn notify_resource_usage(&self, usage: ResourceUsage) {
        self.shared.write_filter.notify_resource_usage(usage);
    }

    pub async fn set_cluster_state(&self, state: ClusterState) -> Result<()> {
        self.ensure_open()?;
        self.master
            .request(|reply| MasterRequest::SetClusterState { state, reply })
            .await
    }

    pub async fn stats(&self) -> DocumentDbStats {
        let transaction_log = match self.shared.tlog.get() {
            Some(tlog) => {
                let range = tlog.range().await;
                TransactionLogStats {
                    first_serial: range.first,
                    last_serial: range.last,
                    pruned_serial: tlog.pruned_serial().await,
                    disk_usage: tlog.disk_usage().await,
                    segments: tlog.segment_count().await,
                }
            }
            None => TransactionLogStats::default(),
        };
        let sub_dbs = self.shared.sub_dbs.stats().await;
        let memory_usage = sub_dbs.iter().map(|s| s.memory_usage).sum();

        DocumentDbStats {
            doc_type: self.shared.doc_type.clone(),
            state: self.state(),
            transaction_log,
            sub_dbs,
            reprocessing_runs: self.shared.reprocessing_runs.load(Ordering::Relaxed),
            memory_usage,
            resource_usage: self.shared.write_filter.usage(),
        }
    }

    /// Stop the database. Idempotent.
    ///
    /// Pending writes are drained and the log is synced. Nothing is flushed;
    /// the next start replays from the last flush.
    pub async fn close(&self) -> Result<()> {
        if self.shared.closing.swap(true, Ordering::AcqRel) {
            self.join_master().await;
            return Ok(());
        }
        info!(doc_type = %self.shared.doc_type, "Closing document database");

        if let Err(e) = self.shared.state.enter(DdbState::Shutdown) {
            debug!(doc_type = %self.shared.doc_type, error = %e, "Closing from a final state");
        }
        let started = self
            .receiver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_none();
        if started {
            // the master may already be gone
            let _ = self.master.send(MasterRequest::Shutdown).await;
            self.join_master().await;
        } else {
            self.shared.writers.shutdown().await;
        }

        self.shared.state.enter(DdbState::Dead)?;
        info!(doc_type = %self.shared.doc_type, "Document database closed");
        Ok(())
    }

    async fn join_master(&self) {
        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(handle) = handle else {
            return;
        };
        match handle.await {
            Ok(()) => debug!(doc_type = %self.shared.doc_type, "Master task finished"),
            Err(e) if e.is_panic() => {
                error!(doc_type = %self.shared.doc_type, error = %e, "Master task panicked")
            }
            Err(e) => warn!(doc_type = %self.shared.doc_type, error = %e, "Master task cancelled"),
        }
    }
}

impl Drop for DocumentDb {
    fn drop(&mut self) {
        // without close this is a crash: nothing is synced or flushed
        if let Some(handle) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}
