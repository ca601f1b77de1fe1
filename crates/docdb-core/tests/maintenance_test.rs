// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flushing, pruning and the background maintenance jobs.

mod common;

use common::*;
use docdb_core::cluster_state::ClusterState;
use docdb_core::config_snapshot::ReadyMode;
use docdb_core::document::BucketId;
use docdb_core::subdb::SubDbType;
use serde_json::Value;

#[tokio::test]
async fn test_log_is_not_pruned_before_every_sub_db_flushed() {
    let ctx = TestContext::new();
    let db = ctx.open_default().await;
    db.put(doc(1), 10).await.unwrap();
    db.put(doc(2), 10).await.unwrap();

    let ready = db
        .flush_targets()
        .into_iter()
        .find(|t| t.name() == "music.ready")
        .unwrap();
    ready.flush().await.unwrap();
    assert!(ready.last_flush_time().is_some());
    assert_eq!(db.stats().await.transaction_log.pruned_serial, 0);

    let flushed = db.flush_all().await.unwrap();
    let stats = db.stats().await;
    assert_eq!(stats.transaction_log.pruned_serial, flushed);
    for target in db.flush_targets() {
        assert_eq!(target.flushed_serial(), flushed);
    }
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_heartbeat_commits_delayed_writes() {
    let ctx = TestContext::new();
    let mut config = music_config();
    config.visibility_delay_ms = 60 * 60 * 1000;
    config.maintenance.heartbeat_interval_ms = 50;
    let db = ctx.open(snapshot(1, config)).await;

    db.put(doc(1), 10).await.unwrap();
    assert!(
        eventually(|| async { db.search("title", "song").await.unwrap().len() == 1 }).await
    );
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_old_tombstones_are_pruned() {
    let ctx = TestContext::new();
    let mut config = music_config();
    config.maintenance.prune_removed.interval_ms = 50;
    config.maintenance.prune_removed.age_ms = 0;
    let db = ctx.open(snapshot(1, config)).await;

    db.put(doc(1), 10).await.unwrap();
    db.remove(doc_id(1), 20).await.unwrap();
    db.remove(doc_id(2), 20).await.unwrap();

    assert!(
        eventually(|| async {
            documents_in(&db.stats().await, SubDbType::Removed) == 0
        })
        .await
    );
    assert_eq!(db.get(&doc_id(1)).await.unwrap(), None);
    // pruned tombstones no longer shadow older writes
    db.put(doc(1), 15).await.unwrap();
    assert_eq!(db.get(&doc_id(1)).await.unwrap(), Some(doc(1)));
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_lid_space_compaction_shrinks_ready() {
    let ctx = TestContext::new();
    let mut config = music_config();
    let compaction = &mut config.maintenance.lid_space_compaction;
    compaction.interval_ms = 50;
    compaction.allowed_lid_bloat = 1;
    compaction.allowed_lid_bloat_factor = 0.1;
    let db = ctx.open(snapshot(1, config)).await;

    for n in 1..=4 {
        db.put(doc(n), 10).await.unwrap();
    }
    for n in 1..=3 {
        db.remove(doc_id(n), 20).await.unwrap();
    }

    assert!(
        eventually(|| async {
            sub_db_stats(&db.stats().await, SubDbType::Ready)
                .lid_usage
                .lid_limit
                == 2
        })
        .await
    );
    assert_eq!(db.get(&doc_id(4)).await.unwrap(), Some(doc(4)));
    assert_eq!(db.search("title", "4").await.unwrap(), vec![doc(4)]);
    assert_eq!(db.attribute(&doc_id(4), "year").await.unwrap(), Some(Value::from(2004)));
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_bucket_move_follows_cluster_state() {
    let ctx = TestContext::new();
    let mut config = music_config();
    config.maintenance.bucket_move.interval_ms = 50;
    config.maintenance.bucket_move.max_docs_per_run = 10;
    let db = ctx.open(snapshot(1, config)).await;
    for n in 1..=3 {
        db.put(doc(n), 10).await.unwrap();
    }

    db.set_cluster_state(ClusterState::with_ready_buckets(Vec::<BucketId>::new()))
        .await
        .unwrap();
    assert!(
        eventually(|| async {
            documents_in(&db.stats().await, SubDbType::NotReady) == 3
        })
        .await
    );
    db.sync().await.unwrap();
    assert!(db.search("title", "song").await.unwrap().is_empty());
    assert_eq!(db.get(&doc_id(2)).await.unwrap(), Some(doc(2)));

    // new documents go straight to not-ready
    db.put(doc(4), 10).await.unwrap();
    assert_eq!(documents_in(&db.stats().await, SubDbType::NotReady), 4);

    db.set_cluster_state(ClusterState::all_ready()).await.unwrap();
    assert!(
        eventually(|| async { documents_in(&db.stats().await, SubDbType::Ready) == 4 }).await
    );
    db.sync().await.unwrap();
    assert_eq!(db.search("title", "song").await.unwrap().len(), 4);
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_moved_documents_survive_crash() {
    let ctx = TestContext::new();
    let mut config = music_config();
    config.maintenance.bucket_move.interval_ms = 50;
    config.maintenance.bucket_move.max_docs_per_run = 10;
    let db = ctx.open(snapshot(1, config.clone())).await;
    db.put(doc(1), 10).await.unwrap();
    db.set_cluster_state(ClusterState::with_ready_buckets(Vec::<BucketId>::new()))
        .await
        .unwrap();
    assert!(
        eventually(|| async {
            documents_in(&db.stats().await, SubDbType::NotReady) == 1
        })
        .await
    );
    crash(db).await;

    // the bucket mover may already be moving it back
    let db = ctx.open(snapshot(1, config)).await;
    let stats = db.stats().await;
    let total = documents_in(&stats, SubDbType::NotReady) + documents_in(&stats, SubDbType::Ready);
    assert_eq!(total, 1);
    assert_eq!(db.get(&doc_id(1)).await.unwrap(), Some(doc(1)));
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_ready_mode_change_moves_every_document_once() {
    let ctx = TestContext::new();
    let mut config = music_config();
    config.maintenance.bucket_move.interval_ms = 50;
    config.maintenance.bucket_move.max_docs_per_run = 5;
    let db = ctx.open(snapshot(1, config.clone())).await;
    for n in 1..=12 {
        db.put(doc(n), 10).await.unwrap();
    }

    config.ready_mode = ReadyMode::StoreOnly;
    db.reconfigure(snapshot(2, config.clone())).await.unwrap();
    assert!(
        eventually(|| async {
            documents_in(&db.stats().await, SubDbType::NotReady) == 12
        })
        .await
    );
    db.sync().await.unwrap();
    let stats = db.stats().await;
    assert_eq!(documents_in(&stats, SubDbType::Ready), 0);
    assert_eq!(documents_in(&stats, SubDbType::Removed), 0);
    assert!(db.search("title", "song").await.unwrap().is_empty());
    for n in 1..=12 {
        assert_eq!(db.get(&doc_id(n)).await.unwrap(), Some(doc(n)));
    }

    config.ready_mode = ReadyMode::Index;
    db.reconfigure(snapshot(3, config)).await.unwrap();
    assert!(
        eventually(|| async { documents_in(&db.stats().await, SubDbType::Ready) == 12 }).await
    );
    db.sync().await.unwrap();
    assert_eq!(documents_in(&db.stats().await, SubDbType::NotReady), 0);
    assert_eq!(db.search("title", "song").await.unwrap().len(), 12);
    db.close().await.unwrap();
}
