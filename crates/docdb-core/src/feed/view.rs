// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Combining feed view: routes operations to the right sub-database.
//!
//! A document is written to exactly one sub-database; writing it anywhere
//! removes it from the others. Meta store changes happen inline on the
//! master task, store writes are fanned out to the writer executors.
//!
//! Every write is gated on the sub-database's flushed serial: an operation
//! whose serial is already covered by a sub-database's snapshot leaves that
//! sub-database alone. This makes replay after a partial flush idempotent.

use std::sync::Arc;
use std::time::Duration;

use docdb_tlog::SerialNum;
use tracing::{debug, trace};

use crate::cluster_state::ClusterState;
use crate::config_snapshot::{DocumentDbConfig, ReadyMode};
use crate::document::{BucketId, Document, GlobalId, Timestamp};
use crate::executor::{DoneToken, WriteExecutors};
use crate::feed::visibility::{CommitAction, VisibilityHandler};
use crate::operation::{DbDocumentId, PrunedDocument};
use crate::subdb::{DocumentLocation, DocumentSubDb, SubDbCollection, SubDbType};

/// Schedules a delayed visibility commit.
pub type CommitScheduler = Arc<dyn Fn(Duration) + Send + Sync>;

pub struct FeedView {
    sub_dbs: Arc<SubDbCollection>,
    writers: Arc<WriteExecutors>,
    ready_mode: ReadyMode,
    cluster_state: ClusterState,
    visibility: VisibilityHandler,
    commit_scheduler: Option<CommitScheduler>,
    /// Callers waiting for the next commit to make their write visible.
    awaiting_commit: Vec<DoneToken>,
}

impl std::fmt::Debug for FeedView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedView")
            .field("ready_mode", &self.ready_mode)
            .field("cluster_state", &self.cluster_state)
            .field("visibility", &self.visibility)
            .finish_non_exhaustive()
    }
}

impl FeedView {
    pub fn new(
        sub_dbs: Arc<SubDbCollection>,
        writers: Arc<WriteExecutors>,
        config: &DocumentDbConfig,
    ) -> Self {
        Self {
            sub_dbs,
            writers,
            ready_mode: config.ready_mode,
            cluster_state: ClusterState::default(),
            visibility: VisibilityHandler::new(config.visibility_delay()),
            commit_scheduler: None,
            awaiting_commit: Vec::new(),
        }
    }

    pub fn set_commit_scheduler(&mut self, scheduler: CommitScheduler) {
        self.commit_scheduler = Some(scheduler);
    }

    pub fn sub_dbs(&self) -> &Arc<SubDbCollection> {
        &self.sub_dbs
    }

    pub fn writers(&self) -> &Arc<WriteExecutors> {
        &self.writers
    }

    pub fn ready_mode(&self) -> ReadyMode {
        self.ready_mode
    }

    pub fn cluster_state(&self) -> &ClusterState {
        &self.cluster_state
    }

    pub fn visibility_delay(&self) -> Duration {
        self.visibility.delay()
    }

    /// Follow a new config: routing mode and visibility delay.
    pub fn reconfigure(&mut self, config: &DocumentDbConfig) {
        self.ready_mode = config.ready_mode;
        self.visibility.set_delay(config.visibility_delay());
    }

    pub fn set_cluster_state(&mut self, state: ClusterState) {
        self.cluster_state = state;
    }

    /// Sub-database a new write of `gid` goes to.
    pub fn target_sub_db(&self, gid: &GlobalId) -> SubDbType {
        self.cluster_state.target_sub_db(self.ready_mode, gid)
    }

    pub async fn newest(&self, gid: &GlobalId) -> Option<DocumentLocation> {
        self.sub_dbs.newest(gid).await
    }

    /// Location a write of `gid` to `target` will get.
    pub async fn peek_location(&self, target: SubDbType, gid: &GlobalId) -> DbDocumentId {
        let lid = self
            .sub_dbs
            .get(target)
            .meta_store
            .read()
            .await
            .peek_lid(gid);
        DbDocumentId::new(target, lid)
    }

    /// Current stored document, after pending summary writes landed.
    pub async fn read_document(&self, location: &DocumentLocation) -> Option<Document> {
        self.writers.summary.sync().await;
        self.sub_dbs.get(location.sub_db).document(location.lid).await
    }

    fn is_gated(sub_db: &DocumentSubDb, serial: SerialNum) -> bool {
        serial <= sub_db.flushed_serial()
    }

    /// Write `gid` to `target` and remove it from every other sub-database.
    ///
    /// `document` is `None` for tombstones. Returns where the document was
    /// placed, or `None` if `target` already covers `serial`.
    #[allow(clippy::too_many_arguments)]
    pub async fn apply_put(
        &mut self,
        serial: SerialNum,
        target: SubDbType,
        gid: GlobalId,
        bucket: BucketId,
        timestamp: Timestamp,
        document: Option<Document>,
        done: &DoneToken,
    ) -> Option<DbDocumentId> {
        for other in SubDbType::ALL {
            if other != target {
                self.remove_from(serial, other, &gid, done).await;
            }
        }

        let sub_db = self.sub_dbs.get(target).clone();
        if Self::is_gated(&sub_db, serial) {
            trace!(serial, sub_db = %target, "Skipping write covered by snapshot");
            return None;
        }

        // without a visibility delay the reply waits for the commit
        if self.visibility.delay().is_zero() {
            self.awaiting_commit.push(done.clone());
        }

        let size = document.as_ref().map(Document::approximate_size).unwrap_or(0);
        let lid = sub_db
            .meta_store
            .write()
            .await
            .put(gid, bucket, timestamp, size);

        if let Some(document) = document.filter(|_| target.stores_documents()) {
            let document = Arc::new(document);
            {
                let (sub_db, document, done) = (sub_db.clone(), document.clone(), done.clone());
                self.writers.attribute.execute(async move {
                    sub_db.attributes.write().await.put(lid, &document);
                    drop(done);
                });
            }
            if sub_db.index.is_some() {
                let (sub_db, document, done) = (sub_db.clone(), document.clone(), done.clone());
                self.writers.index.execute(async move {
                    if let Some(index) = &sub_db.index {
                        index.write().await.put(lid, &document);
                    }
                    drop(done);
                });
            }
            let done = done.clone();
            self.writers.summary.execute(async move {
                let document = Arc::unwrap_or_clone(document);
                sub_db.summary.write().await.put(lid, document);
                drop(done);
            });
        }

        Some(DbDocumentId::new(target, lid))
    }

    async fn remove_from(
        &mut self,
        serial: SerialNum,
        sub_db_type: SubDbType,
        gid: &GlobalId,
        done: &DoneToken,
    ) {
        let sub_db = self.sub_dbs.get(sub_db_type).clone();
        if Self::is_gated(&sub_db, serial) {
            return;
        }
        let Some((lid, _)) = sub_db.meta_store.write().await.remove(gid) else {
            return;
        };
        if !sub_db_type.stores_documents() {
            return;
        }

        {
            let (sub_db, done) = (sub_db.clone(), done.clone());
            self.writers.attribute.execute(async move {
                sub_db.attributes.write().await.remove(lid);
                drop(done);
            });
        }
        if sub_db.index.is_some() {
            let (sub_db, done) = (sub_db.clone(), done.clone());
            self.writers.index.execute(async move {
                if let Some(index) = &sub_db.index {
                    index.write().await.remove(lid);
                }
                drop(done);
            });
        }
        let done = done.clone();
        self.writers.summary.execute(async move {
            sub_db.summary.write().await.remove(lid);
            drop(done);
        });
    }

    /// Remove `gid` from sub-databases holding a version older than
    /// `newest`. Replay uses this when an operation is skipped because a
    /// newer version is already persisted elsewhere.
    pub async fn remove_superseded(
        &mut self,
        serial: SerialNum,
        gid: &GlobalId,
        newest: Timestamp,
        done: &DoneToken,
    ) {
        for location in self.sub_dbs.locate(gid).await {
            if location.meta.timestamp < newest {
                self.remove_from(serial, location.sub_db, gid, done).await;
            }
        }
    }

    /// Drop tombstones that still carry the listed timestamps.
    pub async fn apply_prune(&mut self, serial: SerialNum, documents: &[PrunedDocument]) -> usize {
        let removed = self.sub_dbs.get(SubDbType::Removed).clone();
        if Self::is_gated(&removed, serial) {
            return 0;
        }
        let mut meta = removed.meta_store.write().await;
        let mut pruned = 0;
        for doc in documents {
            if meta
                .lookup(&doc.gid)
                .is_some_and(|(_, entry)| entry.timestamp == doc.timestamp)
            {
                meta.remove(&doc.gid);
                pruned += 1;
            }
        }
        pruned
    }

    /// Feed the visibility handler after an applied operation.
    pub fn after_operation(&mut self) {
        match self.visibility.on_operation() {
            CommitAction::CommitNow => self.commit(),
            CommitAction::ScheduleCommit(delay) => {
                if let Some(scheduler) = &self.commit_scheduler {
                    scheduler(delay);
                } else {
                    self.commit();
                }
            }
            CommitAction::None => {}
        }
    }

    /// A scheduled commit fired.
    pub fn on_commit_timer(&mut self) {
        if self.visibility.on_timer() {
            self.commit();
        }
    }

    /// Make pending index changes visible.
    ///
    /// The commit job is queued behind every index write issued so far, so
    /// lids freed before this call can be reused by later writes.
    pub fn commit(&mut self) {
        let ready = self.sub_dbs.get(SubDbType::Ready).clone();
        self.visibility.on_commit();
        self.writers.index.execute(async move {
            if let Some(index) = &ready.index {
                index.write().await.commit();
            }
        });
        let ready = self.sub_dbs.get(SubDbType::Ready).clone();
        let awaiting = std::mem::take(&mut self.awaiting_commit);
        self.writers.index.execute(async move {
            ready.meta_store.write().await.release_held_lids();
            drop(awaiting);
        });
    }

    /// Commit and wait for every writer to drain.
    pub async fn force_commit_and_sync(&mut self) {
        self.commit();
        self.writers.sync_all().await;
    }

    /// Move up to `max_moves` documents from the top of the lid space into
    /// free lids at the bottom, then shrink it. Returns the number moved.
    pub async fn compact_lid_space(&mut self, sub_db_type: SubDbType, max_moves: usize) -> usize {
        self.force_commit_and_sync().await;
        let sub_db = self.sub_dbs.get(sub_db_type).clone();

        let mut moved = 0;
        {
            let mut meta = sub_db.meta_store.write().await;
            let mut summary = sub_db.summary.write().await;
            let mut attributes = sub_db.attributes.write().await;
            let mut index = match &sub_db.index {
                Some(index) => Some(index.write().await),
                None => None,
            };

            while moved < max_moves {
                let stats = meta.usage_stats();
                let (Some(free), Some(used)) = (stats.lowest_free_lid, stats.highest_used_lid)
                else {
                    break;
                };
                if free >= used || !meta.move_lid(used, free) {
                    break;
                }
                summary.move_lid(used, free);
                attributes.move_lid(used, free);
                if let Some(index) = index.as_mut() {
                    index.move_lid(used, free);
                }
                moved += 1;
            }
        }

        // held lids of the moved documents become free on commit
        self.force_commit_and_sync().await;
        let lid_limit = sub_db.meta_store.write().await.shrink_lid_space();
        sub_db.attributes.write().await.shrink_lid_space(lid_limit);

        if moved > 0 {
            debug!(sub_db = %sub_db_type, moved, lid_limit, "Compacted lid space");
        }
        moved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_snapshot::{FieldConfig, Schema};
    use crate::document::DocumentId;
    use crate::executor::OperationDone;

    fn config() -> DocumentDbConfig {
        DocumentDbConfig {
            schema: Schema::new(vec![
                FieldConfig::new("title").indexed(),
                FieldConfig::new("year").attribute(),
            ]),
            ..Default::default()
        }
    }

    fn view(dir: &std::path::Path) -> FeedView {
        let config = config();
        FeedView::new(
            Arc::new(SubDbCollection::new(dir, &config)),
            Arc::new(WriteExecutors::new()),
            &config,
        )
    }

    fn doc(n: u32) -> Document {
        Document::new(DocumentId::parse(&format!("id:ns:music::{}", n)).unwrap())
            .with_field("title", format!("song {}", n))
            .with_field("year", 1990 + n)
    }

    async fn put(view: &mut FeedView, serial: SerialNum, target: SubDbType, doc: Document) {
        let gid = doc.id.global_id();
        let done = OperationDone::detached();
        view.apply_put(serial, target, gid, BucketId::new(8, 0), serial * 10, Some(doc), &done)
            .await;
        view.after_operation();
    }

    #[tokio::test]
    async fn test_put_is_searchable_after_commit() {
        let dir = tempfile::tempdir().unwrap();
        let mut view = view(dir.path());
        put(&mut view, 1, SubDbType::Ready, doc(1)).await;
        view.writers().sync_all().await;

        let ready = view.sub_dbs().get(SubDbType::Ready).clone();
        let hits = ready.index.as_ref().unwrap().read().await.search("title", "song");
        assert_eq!(hits, vec![1]);
        assert_eq!(
            ready.attributes.read().await.get("year", 1),
            Some(&serde_json::json!(1991))
        );
        assert!(ready.document(1).await.is_some());
    }

    #[tokio::test]
    async fn test_write_elsewhere_removes_from_previous_sub_db() {
        let dir = tempfile::tempdir().unwrap();
        let mut view = view(dir.path());
        put(&mut view, 1, SubDbType::Ready, doc(1)).await;
        put(&mut view, 2, SubDbType::NotReady, doc(1)).await;
        view.writers().sync_all().await;

        let gid = doc(1).id.global_id();
        let locations = view.sub_dbs().locate(&gid).await;
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].sub_db, SubDbType::NotReady);
        let ready = view.sub_dbs().get(SubDbType::Ready).clone();
        assert!(ready.document(1).await.is_none());
        assert!(ready.index.as_ref().unwrap().read().await.search("title", "song").is_empty());
    }

    #[tokio::test]
    async fn test_flushed_sub_db_is_not_touched() {
        let dir = tempfile::tempdir().unwrap();
        let mut view = view(dir.path());
        put(&mut view, 1, SubDbType::Ready, doc(1)).await;
        view.force_commit_and_sync().await;
        view.sub_dbs().get(SubDbType::Ready).flush(5).await.unwrap();

        // serial 3 is covered by the ready snapshot: not removed there
        put(&mut view, 3, SubDbType::NotReady, doc(1)).await;
        view.writers().sync_all().await;
        let locations = view.sub_dbs().locate(&doc(1).id.global_id()).await;
        assert_eq!(locations.len(), 2);

        // serial 6 is not
        put(&mut view, 6, SubDbType::NotReady, doc(1)).await;
        let locations = view.sub_dbs().locate(&doc(1).id.global_id()).await;
        assert_eq!(locations.len(), 1);
    }

    #[tokio::test]
    async fn test_delayed_visibility_uses_scheduler() {
        let dir = tempfile::tempdir().unwrap();
        let mut view = view(dir.path());
        view.reconfigure(&DocumentDbConfig {
            visibility_delay_ms: 1000,
            ..config()
        });
        let scheduled = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        {
            let scheduled = scheduled.clone();
            view.set_commit_scheduler(Arc::new(move |_| {
                scheduled.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }));
        }

        put(&mut view, 1, SubDbType::Ready, doc(1)).await;
        put(&mut view, 2, SubDbType::Ready, doc(2)).await;
        view.writers().sync_all().await;
        assert_eq!(scheduled.load(std::sync::atomic::Ordering::SeqCst), 1);

        let ready = view.sub_dbs().get(SubDbType::Ready).clone();
        assert!(ready.index.as_ref().unwrap().read().await.search("title", "song").is_empty());

        view.on_commit_timer();
        view.writers().sync_all().await;
        assert_eq!(
            ready.index.as_ref().unwrap().read().await.search("title", "song").len(),
            2
        );
    }

    #[tokio::test]
    async fn test_compaction_fills_holes() {
        let dir = tempfile::tempdir().unwrap();
        let mut view = view(dir.path());
        for n in 1..=4 {
            put(&mut view, n as u64, SubDbType::Ready, doc(n)).await;
        }
        // drop lids 1 and 2 from ready
        put(&mut view, 5, SubDbType::NotReady, doc(1)).await;
        put(&mut view, 6, SubDbType::NotReady, doc(2)).await;
        view.force_commit_and_sync().await;

        let moved = view.compact_lid_space(SubDbType::Ready, 10).await;
        assert_eq!(moved, 2);

        let ready = view.sub_dbs().get(SubDbType::Ready).clone();
        assert_eq!(ready.lid_usage().await.lid_limit, 3);
        let (lid, _) = ready.lookup(&doc(4).id.global_id()).await.unwrap();
        assert!(lid < 3);
        assert_eq!(ready.document(lid).await.unwrap().id, doc(4).id);
        let hits = ready.index.as_ref().unwrap().read().await.search("title", "4");
        assert_eq!(hits, vec![lid]);
    }

    #[tokio::test]
    async fn test_prune_requires_matching_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let mut view = view(dir.path());
        let gid = doc(1).id.global_id();
        let done = OperationDone::detached();
        view.apply_put(1, SubDbType::Removed, gid, BucketId::new(8, 0), 10, None, &done)
            .await;

        let stale = [PrunedDocument { gid, timestamp: 9 }];
        assert_eq!(view.apply_prune(2, &stale).await, 0);
        let current = [PrunedDocument { gid, timestamp: 10 }];
        assert_eq!(view.apply_prune(3, &current).await, 1);
        assert!(view.sub_dbs().locate(&gid).await.is_empty());
    }
}
