// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The three sub-databases of a document database.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use docdb_tlog::SerialNum;
use tracing::{debug, info};

use crate::cluster_state::ClusterState;
use crate::config_snapshot::{DocumentDbConfig, ReadyMode};
use crate::document::{Document, GlobalId, Lid, Timestamp};
use crate::error::Result;
use crate::operation::PrunedDocument;
use crate::reprocessing::ReprocessTask;
use crate::subdb::{AllocStrategy, DocumentSubDb, IndexManager, MetaEntry, SubDbStats, SubDbType};

/// Where a document currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentLocation {
    pub sub_db: SubDbType,
    pub lid: Lid,
    pub meta: MetaEntry,
}

/// A document that should change sub-database.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveCandidate {
    pub document: Document,
    pub meta: MetaEntry,
    pub source: SubDbType,
    pub target: SubDbType,
}

/// Ready, removed and not-ready sub-databases of one document type.
#[derive(Debug)]
pub struct SubDbCollection {
    base_dir: PathBuf,
    ready: Arc<DocumentSubDb>,
    removed: Arc<DocumentSubDb>,
    not_ready: Arc<DocumentSubDb>,
}

impl SubDbCollection {
    /// Create empty sub-databases under `base_dir`, sized from `config`.
    pub fn new(base_dir: impl Into<PathBuf>, config: &DocumentDbConfig) -> Self {
        let base_dir = base_dir.into();
        let attributes = config.schema.attribute_fields();
        let indexed = config.schema.indexed_fields();
        let make = |sub_db: SubDbType| {
            Arc::new(DocumentSubDb::new(
                sub_db,
                base_dir.join(sub_db.dir_name()),
                AllocStrategy::for_sub_db(&config.tuning, sub_db),
                &attributes,
                &indexed,
            ))
        };

        Self {
            ready: make(SubDbType::Ready),
            removed: make(SubDbType::Removed),
            not_ready: make(SubDbType::NotReady),
            base_dir,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn get(&self, sub_db: SubDbType) -> &Arc<DocumentSubDb> {
        match sub_db {
            SubDbType::Ready => &self.ready,
            SubDbType::Removed => &self.removed,
            SubDbType::NotReady => &self.not_ready,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<DocumentSubDb>> {
        [&self.ready, &self.removed, &self.not_ready].into_iter()
    }

    pub async fn load(&self) -> Result<()> {
        for sub_db in self.iter() {
            sub_db.load().await?;
        }
        Ok(())
    }

    /// Every sub-database holding `gid`. More than one entry only occurs
    /// transiently during replay.
    pub async fn locate(&self, gid: &GlobalId) -> Vec<DocumentLocation> {
        let mut found = Vec::new();
        for sub_db in self.iter() {
            if let Some((lid, meta)) = sub_db.lookup(gid).await {
                found.push(DocumentLocation {
                    sub_db: sub_db.sub_db_type(),
                    lid,
                    meta,
                });
            }
        }
        found
    }

    /// The location with the newest timestamp.
    pub async fn newest(&self, gid: &GlobalId) -> Option<DocumentLocation> {
        self.locate(gid)
            .await
            .into_iter()
            .max_by_key(|loc| loc.meta.timestamp)
    }

    /// Lowest flushed serial: replay has to start after it.
    pub fn oldest_flushed_serial(&self) -> SerialNum {
        self.iter().map(|s| s.flushed_serial()).min().unwrap_or(0)
    }

    /// Bring attribute columns and index fields in line with `config`.
    ///
    /// Dropped columns go away immediately. Columns added to a non-empty
    /// sub-database and index field changes come back as reprocessing tasks.
    pub async fn apply_config(&self, config: &DocumentDbConfig) -> Vec<ReprocessTask> {
        let mut tasks = Vec::new();
        let wanted_attributes = config.schema.attribute_fields();

        for sub_db in [&self.ready, &self.not_ready] {
            let has_docs = !sub_db.summary.read().await.is_empty();
            let mut attributes = sub_db.attributes.write().await;
            let current = attributes.column_names();

            for dropped in current.difference(&wanted_attributes) {
                attributes.drop_column(dropped);
                debug!(sub_db = %sub_db.sub_db_type(), field = %dropped, "Dropped attribute");
            }

            let added: Vec<String> = wanted_attributes.difference(&current).cloned().collect();
            for field in &added {
                attributes.add_column(field);
            }
            if !added.is_empty() && has_docs {
                tasks.push(ReprocessTask::PopulateAttributes {
                    sub_db: sub_db.sub_db_type(),
                    fields: added,
                });
            }
        }

        if let Some(index) = &self.ready.index {
            let wanted: BTreeSet<String> = config.schema.indexed_fields();
            let current = index.read().await.fields().clone();
            if current != wanted {
                if self.ready.summary.read().await.is_empty() {
                    index.write().await.replace_with(IndexManager::new(wanted));
                } else {
                    tasks.push(ReprocessTask::RebuildIndex {
                        fields: wanted.into_iter().collect(),
                    });
                }
            }
        }

        if !tasks.is_empty() {
            info!(tasks = tasks.len(), "Schema change needs reprocessing");
        }
        tasks
    }

    /// Documents whose sub-database disagrees with `mode` and `cluster`.
    pub async fn documents_to_move(
        &self,
        mode: ReadyMode,
        cluster: &ClusterState,
        limit: usize,
    ) -> Vec<MoveCandidate> {
        let mut moves = Vec::new();

        for source in [&self.ready, &self.not_ready] {
            let meta = source.meta_store.read().await;
            let summary = source.summary.read().await;
            for (lid, entry) in meta.iter() {
                if moves.len() >= limit {
                    return moves;
                }
                let target = cluster.target_sub_db(mode, &entry.gid);
                if target == source.sub_db_type() {
                    continue;
                }
                if let Some(document) = summary.get(lid) {
                    moves.push(MoveCandidate {
                        document: document.clone(),
                        meta: *entry,
                        source: source.sub_db_type(),
                        target,
                    });
                }
            }
        }
        moves
    }

    /// Tombstones older than `cutoff`, oldest lid first.
    pub async fn removed_before(&self, cutoff: Timestamp, limit: usize) -> Vec<PrunedDocument> {
        self.removed
            .meta_store
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.timestamp < cutoff)
            .take(limit)
            .map(|(_, entry)| PrunedDocument {
                gid: entry.gid,
                timestamp: entry.timestamp,
            })
            .collect()
    }

    pub async fn stats(&self) -> Vec<SubDbStats> {
        let mut stats = Vec::with_capacity(3);
        for sub_db in self.iter() {
            stats.push(sub_db.stats().await);
        }
        stats
    }

    /// Approximate memory used by all sub-databases.
    pub async fn memory_usage(&self) -> usize {
        let mut total = 0;
        for sub_db in self.iter() {
            total += sub_db.stats().await.memory_usage;
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_snapshot::{FieldConfig, Schema};
    use crate::document::{BucketId, DocumentId};

    fn config(fields: Vec<FieldConfig>) -> DocumentDbConfig {
        DocumentDbConfig {
            schema: Schema::new(fields),
            ..Default::default()
        }
    }

    async fn insert(sub_dbs: &SubDbCollection, sub_db: SubDbType, n: u64, ts: Timestamp) {
        let id = DocumentId::parse(&format!("id:ns:music:n={}:doc", n)).unwrap();
        let doc = Document::new(id.clone()).with_field("title", "x").with_field("year", 2000);
        let target = sub_dbs.get(sub_db);
        let lid = target
            .meta_store
            .write()
            .await
            .put(id.global_id(), BucketId::new(8, n), ts, 1);
        if sub_db.stores_documents() {
            target.summary.write().await.put(lid, doc);
        }
    }

    fn gid(n: u64) -> GlobalId {
        DocumentId::parse(&format!("id:ns:music:n={}:doc", n))
            .unwrap()
            .global_id()
    }

    #[tokio::test]
    async fn test_locate_and_newest() {
        let dir = tempfile::tempdir().unwrap();
        let sub_dbs = SubDbCollection::new(dir.path(), &DocumentDbConfig::default());
        insert(&sub_dbs, SubDbType::Ready, 1, 10).await;
        insert(&sub_dbs, SubDbType::Removed, 1, 20).await;

        assert_eq!(sub_dbs.locate(&gid(1)).await.len(), 2);
        let newest = sub_dbs.newest(&gid(1)).await.unwrap();
        assert_eq!(newest.sub_db, SubDbType::Removed);
        assert!(sub_dbs.newest(&gid(2)).await.is_none());
    }

    #[tokio::test]
    async fn test_apply_config_on_empty_collection_needs_no_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let sub_dbs = SubDbCollection::new(dir.path(), &DocumentDbConfig::default());
        let tasks = sub_dbs
            .apply_config(&config(vec![
                FieldConfig::new("title").indexed(),
                FieldConfig::new("year").attribute(),
            ]))
            .await;
        assert!(tasks.is_empty());
        assert!(sub_dbs.get(SubDbType::Ready).attributes.read().await.has_column("year"));
        assert_eq!(
            sub_dbs.get(SubDbType::Ready).index.as_ref().unwrap().read().await.fields().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_apply_config_with_documents_creates_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let sub_dbs = SubDbCollection::new(dir.path(), &DocumentDbConfig::default());
        insert(&sub_dbs, SubDbType::Ready, 1, 10).await;

        let tasks = sub_dbs
            .apply_config(&config(vec![
                FieldConfig::new("title").indexed(),
                FieldConfig::new("year").attribute(),
            ]))
            .await;
        assert_eq!(
            tasks,
            vec![
                ReprocessTask::PopulateAttributes {
                    sub_db: SubDbType::Ready,
                    fields: vec!["year".into()],
                },
                ReprocessTask::RebuildIndex {
                    fields: vec!["title".into()],
                },
            ]
        );

        // dropping the attribute is immediate
        let tasks = sub_dbs
            .apply_config(&config(vec![FieldConfig::new("title").indexed()]))
            .await;
        assert!(!sub_dbs.get(SubDbType::Ready).attributes.read().await.has_column("year"));
        assert_eq!(tasks.len(), 1);
    }

    #[tokio::test]
    async fn test_documents_to_move() {
        let dir = tempfile::tempdir().unwrap();
        let sub_dbs = SubDbCollection::new(dir.path(), &DocumentDbConfig::default());
        insert(&sub_dbs, SubDbType::Ready, 1, 10).await;
        insert(&sub_dbs, SubDbType::NotReady, 2, 10).await;

        let all_ready = ClusterState::all_ready();
        let moves = sub_dbs.documents_to_move(ReadyMode::Index, &all_ready, 10).await;
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].source, SubDbType::NotReady);
        assert_eq!(moves[0].target, SubDbType::Ready);

        let moves = sub_dbs
            .documents_to_move(ReadyMode::StoreOnly, &all_ready, 10)
            .await;
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].source, SubDbType::Ready);

        let limited = sub_dbs.documents_to_move(ReadyMode::StoreOnly, &all_ready, 0).await;
        assert!(limited.is_empty());
    }

    #[tokio::test]
    async fn test_removed_before() {
        let dir = tempfile::tempdir().unwrap();
        let sub_dbs = SubDbCollection::new(dir.path(), &DocumentDbConfig::default());
        insert(&sub_dbs, SubDbType::Removed, 1, 10).await;
        insert(&sub_dbs, SubDbType::Removed, 2, 50).await;
        insert(&sub_dbs, SubDbType::Removed, 3, 20).await;

        let pruned = sub_dbs.removed_before(30, 10).await;
        assert_eq!(pruned.len(), 2);
        assert_eq!(sub_dbs.removed_before(30, 1).await.len(), 1);
        assert_eq!(sub_dbs.oldest_flushed_serial(), 0);
    }
}
