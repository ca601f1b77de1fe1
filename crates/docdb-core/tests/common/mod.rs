// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for docdb-core integration tests.
//!
//! Provides TestContext for opening, crashing and reopening a document
//! database in a temporary directory.

#![allow(dead_code)]

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use docdb_core::config_snapshot::{ConfigSnapshot, DocumentDbConfig, FieldConfig, Schema};
use docdb_core::document::{Document, DocumentId};
use docdb_core::owner::StaticOwner;
use docdb_core::subdb::SubDbType;
use docdb_core::{DocumentDb, DocumentDbOptions, DocumentDbStats};

pub const DOC_TYPE: &str = "music";

/// Test context owning the data directory of one document database.
pub struct TestContext {
    pub dir: TempDir,
    pub owner: Arc<StaticOwner>,
}

impl TestContext {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("create temp dir"),
            owner: Arc::new(StaticOwner::new(1)),
        }
    }

    pub fn db_dir(&self) -> PathBuf {
        self.dir.path().join(DOC_TYPE)
    }

    /// Start the database with `snapshot` and wait until it is online.
    pub async fn open(&self, snapshot: ConfigSnapshot) -> DocumentDb {
        let db = DocumentDb::new(
            self.db_dir(),
            snapshot,
            Some(self.owner.clone()),
            DocumentDbOptions::default(),
        );
        db.start().expect("start");
        tokio::time::timeout(Duration::from_secs(10), db.wait_for_online())
            .await
            .expect("online in time")
            .expect("online");
        db
    }

    pub async fn open_default(&self) -> DocumentDb {
        self.open(snapshot(1, music_config())).await
    }
}

/// Drop the database without closing it: nothing is synced or flushed.
pub async fn crash(db: DocumentDb) {
    drop(db);
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// `title` indexed, `year` attribute, `artist` stored only.
pub fn music_config() -> DocumentDbConfig {
    DocumentDbConfig {
        schema: Schema::new(vec![
            FieldConfig::new("title").indexed(),
            FieldConfig::new("year").attribute(),
            FieldConfig::new("artist"),
        ]),
        ..Default::default()
    }
}

pub fn snapshot(generation: i64, config: DocumentDbConfig) -> ConfigSnapshot {
    ConfigSnapshot::new(DOC_TYPE, generation, config)
}

pub fn doc_id(n: u32) -> DocumentId {
    DocumentId::parse(&format!("id:ns:{}::{}", DOC_TYPE, n)).expect("valid id")
}

pub fn doc(n: u32) -> Document {
    Document::new(doc_id(n))
        .with_field("title", format!("song {}", n))
        .with_field("year", 2000 + n)
        .with_field("artist", format!("artist {}", n))
}

pub fn sub_db_stats(stats: &DocumentDbStats, sub_db: SubDbType) -> &docdb_core::subdb::SubDbStats {
    stats
        .sub_dbs
        .iter()
        .find(|s| s.sub_db == sub_db)
        .expect("sub-database stats")
}

pub fn documents_in(stats: &DocumentDbStats, sub_db: SubDbType) -> u32 {
    sub_db_stats(stats, sub_db).documents
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
