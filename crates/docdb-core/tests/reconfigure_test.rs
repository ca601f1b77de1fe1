// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Live reconfiguration and reprocessing.

mod common;

use common::*;
use docdb_core::config_snapshot::{ConfigSnapshot, FieldConfig};
use docdb_core::{ConfigState, DdbState, DocDbError};
use serde_json::Value;

#[tokio::test]
async fn test_visibility_change_needs_no_reprocessing() {
    let ctx = TestContext::new();
    let db = ctx.open_default().await;
    db.put(doc(1), 10).await.unwrap();

    let mut config = music_config();
    config.visibility_delay_ms = 500;
    db.reconfigure(snapshot(2, config)).await.unwrap();
    db.sync().await.unwrap();

    let status = db.status();
    assert_eq!(status.active_generation, Some(2));
    assert_eq!(status.config_state, ConfigState::Ok);
    assert_eq!(status.state, DdbState::Online);
    assert_eq!(db.stats().await.reprocessing_runs, 0);
    assert_eq!(db.active_config().unwrap().config.visibility_delay_ms, 500);
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_new_attribute_field_is_populated() {
    let ctx = TestContext::new();
    let db = ctx.open_default().await;
    for n in 1..=3 {
        db.put(doc(n).with_field("label", format!("label {}", n)), 10)
            .await
            .unwrap();
    }
    assert_eq!(db.attribute(&doc_id(2), "label").await.unwrap(), None);

    let mut config = music_config();
    config.schema.fields.push(FieldConfig::new("label").attribute());
    db.reconfigure(snapshot(2, config)).await.unwrap();
    db.sync().await.unwrap();

    assert_eq!(db.stats().await.reprocessing_runs, 1);
    assert_eq!(db.status().config_state, ConfigState::Ok);
    assert_eq!(
        db.attribute(&doc_id(2), "label").await.unwrap(),
        Some(Value::from("label 2"))
    );

    // later writes fill the new column directly
    db.put(doc(4).with_field("label", "label 4"), 10).await.unwrap();
    assert_eq!(
        db.attribute(&doc_id(4), "label").await.unwrap(),
        Some(Value::from("label 4"))
    );
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_attribute_aspect_change_waits_for_restart() {
    let ctx = TestContext::new();
    let db = ctx.open_default().await;
    db.put(doc(1), 10).await.unwrap();

    let mut config = music_config();
    config.schema.fields[2] = FieldConfig::new("artist").attribute();
    db.reconfigure(snapshot(2, config.clone())).await.unwrap();
    db.sync().await.unwrap();

    let status = db.status();
    assert_eq!(status.active_generation, Some(2));
    assert_eq!(status.config_state, ConfigState::NeedRestart);
    assert_eq!(db.attribute(&doc_id(1), "artist").await.unwrap(), None);
    db.close().await.unwrap();
    drop(db);

    let db = ctx.open(snapshot(2, config)).await;
    let status = db.status();
    assert_eq!(status.active_generation, Some(2));
    assert_eq!(status.config_state, ConfigState::Ok);
    assert_eq!(
        db.attribute(&doc_id(1), "artist").await.unwrap(),
        Some(Value::from("artist 1"))
    );
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_index_change_rebuilds_index() {
    let ctx = TestContext::new();
    let db = ctx.open_default().await;
    db.put(doc(1), 10).await.unwrap();
    db.put(doc(2), 10).await.unwrap();
    assert!(db.search("artist", "artist").await.unwrap().is_empty());

    let mut config = music_config();
    config.schema.fields[2] = FieldConfig::new("artist").indexed();
    db.reconfigure(snapshot(2, config)).await.unwrap();
    db.sync().await.unwrap();

    assert_eq!(db.stats().await.reprocessing_runs, 1);
    assert_eq!(db.search("artist", "artist").await.unwrap().len(), 2);
    assert_eq!(db.search("artist", "2").await.unwrap(), vec![doc(2)]);
    assert_eq!(db.search("title", "song").await.unwrap().len(), 2);
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_live_config_survives_restart() {
    let ctx = TestContext::new();
    let db = ctx.open_default().await;
    db.put(doc(1), 10).await.unwrap();

    let mut config = music_config();
    config.visibility_delay_ms = 250;
    db.reconfigure(snapshot(2, config)).await.unwrap();
    crash(db).await;

    // the host still hands out the old generation; the logged one wins
    let db = ctx.open_default().await;
    let active = db.active_config().unwrap();
    assert_eq!(active.generation, 2);
    assert_eq!(active.config.visibility_delay_ms, 250);
    assert_eq!(db.get(&doc_id(1)).await.unwrap(), Some(doc(1)));
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_older_generation_is_a_no_op() {
    let ctx = TestContext::new();
    let db = ctx.open(snapshot(3, music_config())).await;

    let mut config = music_config();
    config.visibility_delay_ms = 1000;
    db.reconfigure(snapshot(2, config.clone())).await.unwrap();
    db.reconfigure(snapshot(3, config)).await.unwrap();

    let active = db.active_config().unwrap();
    assert_eq!(active.generation, 3);
    assert_eq!(active.config.visibility_delay_ms, 0);
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_reconfigure_rejections() {
    let ctx = TestContext::new();
    let db = ctx.open_default().await;

    let other = ConfigSnapshot::new("video", 2, music_config());
    assert!(matches!(
        db.reconfigure(other).await,
        Err(DocDbError::IllegalState(_))
    ));

    db.close().await.unwrap();
    assert!(matches!(
        db.reconfigure(snapshot(2, music_config())).await,
        Err(DocDbError::IllegalState(_))
    ));
}
