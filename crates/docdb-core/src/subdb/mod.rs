// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sub-databases.
//!
//! Every document of a document database lives in exactly one of three
//! sub-databases:
//!
//! | id | type | contents |
//! |----|------|----------|
//! | 0 | ready | searchable documents: meta store, summary, attributes, index |
//! | 1 | removed | tombstones: meta store only |
//! | 2 | not-ready | stored but not searchable: meta store, summary, attributes |
//!
//! Each sub-database persists itself as one JSON snapshot and remembers the
//! serial number it was flushed at. Replay skips operations already covered
//! by a sub-database's snapshot.

pub mod attribute;
pub mod collection;
pub mod index;
pub mod meta_store;
pub mod summary;

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use docdb_tlog::SerialNum;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::document::{Document, GlobalId, Lid};
use crate::error::{DocDbError, Result};

pub use attribute::AttributeManager;
pub use collection::{DocumentLocation, MoveCandidate, SubDbCollection};
pub use index::IndexManager;
pub use meta_store::{AllocStrategy, DocumentMetaStore, LidUsageStats, MetaEntry};
pub use summary::SummaryStore;

/// Which of the three sub-databases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubDbType {
    Ready,
    Removed,
    NotReady,
}

impl SubDbType {
    pub const ALL: [SubDbType; 3] = [SubDbType::Ready, SubDbType::Removed, SubDbType::NotReady];

    pub fn id(&self) -> u32 {
        match self {
            Self::Ready => 0,
            Self::Removed => 1,
            Self::NotReady => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Removed => "removed",
            Self::NotReady => "notready",
        }
    }

    /// Directory name under the document database directory.
    pub fn dir_name(&self) -> String {
        format!("{}.{}", self.id(), self.name())
    }

    /// Whether the sub-database stores full documents.
    pub fn stores_documents(&self) -> bool {
        !matches!(self, Self::Removed)
    }
}

impl fmt::Display for SubDbType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

const SNAPSHOT_FILE: &str = "snapshot.json";

#[derive(Debug, Serialize, Deserialize)]
struct StoredDocument {
    lid: Lid,
    meta: MetaEntry,
    #[serde(default)]
    document: Option<Document>,
}

/// Persisted form of one sub-database.
#[derive(Debug, Serialize, Deserialize)]
struct SubDbSnapshot {
    sub_db: SubDbType,
    flushed_serial: SerialNum,
    flushed_at: DateTime<Utc>,
    lid_limit: Lid,
    #[serde(default)]
    attribute_columns: BTreeSet<String>,
    #[serde(default)]
    index_fields: BTreeSet<String>,
    documents: Vec<StoredDocument>,
}

/// Document counts and memory of one sub-database.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubDbStats {
    pub sub_db: SubDbType,
    pub documents: u32,
    pub lid_usage: LidUsageStats,
    pub flushed_serial: SerialNum,
    pub last_flush: Option<DateTime<Utc>>,
    pub memory_usage: usize,
}

/// One sub-database and its stores.
///
/// The meta store is only written from the master task. Summary, attribute
/// and index stores are written from their writer executors and read
/// concurrently by queries.
pub struct DocumentSubDb {
    sub_db_type: SubDbType,
    dir: PathBuf,
    pub(crate) meta_store: RwLock<DocumentMetaStore>,
    pub(crate) summary: RwLock<SummaryStore>,
    pub(crate) attributes: RwLock<AttributeManager>,
    pub(crate) index: Option<RwLock<IndexManager>>,
    flushed_serial: AtomicU64,
    last_flush: std::sync::Mutex<Option<DateTime<Utc>>>,
}

impl fmt::Debug for DocumentSubDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentSubDb")
            .field("sub_db_type", &self.sub_db_type)
            .field("dir", &self.dir)
            .field("flushed_serial", &self.flushed_serial())
            .finish_non_exhaustive()
    }
}

impl DocumentSubDb {
    pub fn new(
        sub_db_type: SubDbType,
        dir: PathBuf,
        alloc: AllocStrategy,
        attribute_fields: &BTreeSet<String>,
        index_fields: &BTreeSet<String>,
    ) -> Self {
        let attributes = if sub_db_type.stores_documents() {
            AttributeManager::new(attribute_fields)
        } else {
            AttributeManager::default()
        };
        let index = (sub_db_type == SubDbType::Ready)
            .then(|| RwLock::new(IndexManager::new(index_fields.clone())));

        Self {
            sub_db_type,
            dir,
            meta_store: RwLock::new(DocumentMetaStore::new(
                alloc,
                sub_db_type == SubDbType::Ready,
            )),
            summary: RwLock::new(SummaryStore::new()),
            attributes: RwLock::new(attributes),
            index,
            flushed_serial: AtomicU64::new(0),
            last_flush: std::sync::Mutex::new(None),
        }
    }

    pub fn sub_db_type(&self) -> SubDbType {
        self.sub_db_type
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    /// Serial number covered by the last flush, `0` if never flushed.
    pub fn flushed_serial(&self) -> SerialNum {
        self.flushed_serial.load(Ordering::Acquire)
    }

    pub fn last_flush_time(&self) -> Option<DateTime<Utc>> {
        self.last_flush.lock().ok().and_then(|guard| *guard)
    }

    /// Replace in-memory state with the persisted snapshot, if any.
    pub async fn load(&self) -> Result<()> {
        let path = self.snapshot_path();
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(sub_db = %self.sub_db_type, "No snapshot, starting empty");
                return Ok(());
            }
            Err(e) => return Err(DocDbError::snapshot(&path, e)),
        };
        let snapshot: SubDbSnapshot =
            serde_json::from_slice(&raw).map_err(|e| DocDbError::snapshot(&path, e))?;
        if snapshot.sub_db != self.sub_db_type {
            return Err(DocDbError::snapshot(
                &path,
                format!(
                    "snapshot belongs to sub-database '{}', expected '{}'",
                    snapshot.sub_db, self.sub_db_type
                ),
            ));
        }

        let mut meta = self.meta_store.write().await;
        let mut summary = self.summary.write().await;
        let mut attributes = self.attributes.write().await;

        let alloc = meta.alloc_strategy().clone();
        *meta = DocumentMetaStore::from_entries(
            alloc,
            self.sub_db_type == SubDbType::Ready,
            snapshot.lid_limit,
            snapshot.documents.iter().map(|d| (d.lid, d.meta)),
        );

        *summary = SummaryStore::new();
        *attributes = if self.sub_db_type.stores_documents() {
            AttributeManager::new(&snapshot.attribute_columns)
        } else {
            AttributeManager::default()
        };
        for stored in &snapshot.documents {
            if let Some(doc) = &stored.document {
                attributes.put(stored.lid, doc);
                summary.put(stored.lid, doc.clone());
            }
        }

        if let Some(index) = &self.index {
            let rebuilt = IndexManager::rebuilt(
                snapshot.index_fields.clone(),
                snapshot
                    .documents
                    .iter()
                    .filter_map(|d| d.document.as_ref().map(|doc| (d.lid, doc))),
            );
            *index.write().await = rebuilt;
        }

        self.flushed_serial
            .store(snapshot.flushed_serial, Ordering::Release);
        if let Ok(mut last) = self.last_flush.lock() {
            *last = Some(snapshot.flushed_at);
        }

        info!(
            sub_db = %self.sub_db_type,
            documents = snapshot.documents.len(),
            flushed_serial = snapshot.flushed_serial,
            "Loaded sub-database snapshot"
        );
        Ok(())
    }

    /// Persist the current state as covering everything up to `serial`.
    ///
    /// The caller must have drained the writer executors so the stores
    /// reflect every operation up to `serial`.
    pub async fn flush(&self, serial: SerialNum) -> Result<SerialNum> {
        if serial < self.flushed_serial() {
            return Ok(self.flushed_serial());
        }

        let snapshot = {
            let meta = self.meta_store.read().await;
            let summary = self.summary.read().await;
            let attributes = self.attributes.read().await;
            let index_fields = match &self.index {
                Some(index) => index.read().await.fields().clone(),
                None => BTreeSet::new(),
            };

            SubDbSnapshot {
                sub_db: self.sub_db_type,
                flushed_serial: serial,
                flushed_at: Utc::now(),
                lid_limit: meta.lid_limit(),
                attribute_columns: attributes.column_names(),
                index_fields,
                documents: meta
                    .iter()
                    .map(|(lid, entry)| StoredDocument {
                        lid,
                        meta: *entry,
                        document: summary.get(lid).cloned(),
                    })
                    .collect(),
            }
        };

        let path = self.snapshot_path();
        let bytes = serde_json::to_vec(&snapshot).map_err(|e| DocDbError::snapshot(&path, e))?;
        write_atomically(&path, &bytes)
            .await
            .map_err(|e| DocDbError::snapshot(&path, e))?;

        self.flushed_serial.store(serial, Ordering::Release);
        if let Ok(mut last) = self.last_flush.lock() {
            *last = Some(snapshot.flushed_at);
        }

        debug!(
            sub_db = %self.sub_db_type,
            serial,
            documents = snapshot.documents.len(),
            "Flushed sub-database"
        );
        Ok(serial)
    }

    pub async fn lookup(&self, gid: &GlobalId) -> Option<(Lid, MetaEntry)> {
        self.meta_store.read().await.lookup(gid)
    }

    pub async fn document(&self, lid: Lid) -> Option<Document> {
        self.summary.read().await.get(lid).cloned()
    }

    pub async fn document_count(&self) -> u32 {
        self.meta_store.read().await.used_lids()
    }

    pub async fn lid_usage(&self) -> LidUsageStats {
        self.meta_store.read().await.usage_stats()
    }

    pub async fn stats(&self) -> SubDbStats {
        let meta = self.meta_store.read().await;
        let mut memory = meta.memory_usage()
            + self.summary.read().await.memory_usage()
            + self.attributes.read().await.memory_usage();
        if let Some(index) = &self.index {
            memory += index.read().await.memory_usage();
        }
        SubDbStats {
            sub_db: self.sub_db_type,
            documents: meta.used_lids(),
            lid_usage: meta.usage_stats(),
            flushed_serial: self.flushed_serial(),
            last_flush: self.last_flush_time(),
            memory_usage: memory,
        }
    }
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    tokio::io::AsyncWriteExt::write_all(&mut file, bytes).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await
}
