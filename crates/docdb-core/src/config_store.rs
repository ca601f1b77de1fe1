// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable store of config snapshots keyed by serial number.
//!
//! Every config that becomes active is saved here under the serial number of
//! its `NewConfig` log entry. Replay looks configs up by serial; pruning
//! follows the transaction log but always keeps the newest config at or below
//! the prune point so replay can start from it.

use std::path::Path;

use async_trait::async_trait;
use docdb_tlog::SerialNum;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::debug;

use crate::config_snapshot::ConfigSnapshot;
use crate::error::{DocDbError, Result};

pub(crate) static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Storage for config snapshots.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Save `snapshot` under `snapshot.serial`, replacing any entry there.
    async fn save_config(&self, snapshot: &ConfigSnapshot) -> Result<()>;

    /// Load the snapshot saved at exactly `serial`.
    async fn load_config(&self, serial: SerialNum) -> Result<Option<ConfigSnapshot>>;

    /// Highest valid serial, `0` if the store is empty.
    async fn best_serial(&self) -> Result<SerialNum>;

    /// Lowest valid serial, `0` if the store is empty.
    async fn oldest_serial(&self) -> Result<SerialNum>;

    /// Highest valid serial strictly below `serial`, `0` if none.
    async fn prev_valid_serial(&self, serial: SerialNum) -> Result<SerialNum>;

    async fn has_valid_serial(&self, serial: SerialNum) -> Result<bool>;

    /// Remove every config with a serial below `serial`. Returns the count.
    async fn prune(&self, serial: SerialNum) -> Result<u64>;

    /// Remove every config with a serial above `serial`. Returns the count.
    async fn remove_after(&self, serial: SerialNum) -> Result<u64>;
}

/// SQLite-backed [`ConfigStore`].
#[derive(Clone)]
pub struct SqliteConfigStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConfigStore").finish_non_exhaustive()
    }
}

impl SqliteConfigStore {
    /// Wrap an existing pool. Migrations must already have run.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the store at `path` and run migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DocDbError::config_store("create_dir", e))?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .map_err(|e| DocDbError::config_store("connect", e))?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| DocDbError::config_store("migrate", e))?;

        Ok(Self::new(pool))
    }

    async fn scalar_serial(&self, sql: &str, bind: Option<SerialNum>) -> Result<SerialNum> {
        let mut query = sqlx::query_as::<_, (Option<i64>,)>(sql);
        if let Some(serial) = bind {
            query = query.bind(serial as i64);
        }
        let (serial,) = query.fetch_one(&self.pool).await?;
        Ok(serial.unwrap_or(0) as SerialNum)
    }
}

#[async_trait]
impl ConfigStore for SqliteConfigStore {
    async fn save_config(&self, snapshot: &ConfigSnapshot) -> Result<()> {
        if snapshot.serial == 0 {
            return Err(DocDbError::IllegalState(
                "config snapshot saved without a serial number".to_string(),
            ));
        }
        let serial = snapshot.serial as i64;
        let json = serde_json::to_string(snapshot)?;

        // a config saved but never logged is removed by `remove_after` on load
        sqlx::query(
            r#"
            INSERT INTO config_snapshots (serial, generation, doc_type, snapshot, valid)
            VALUES (?1, ?2, ?3, ?4, 1)
            ON CONFLICT (serial) DO UPDATE SET
                generation = excluded.generation,
                doc_type = excluded.doc_type,
                snapshot = excluded.snapshot,
                valid = 1
            "#,
        )
        .bind(serial)
        .bind(snapshot.generation)
        .bind(&snapshot.doc_type)
        .bind(&json)
        .execute(&self.pool)
        .await?;

        debug!(
            doc_type = %snapshot.doc_type,
            serial = snapshot.serial,
            generation = snapshot.generation,
            "Saved config snapshot"
        );
        Ok(())
    }

    async fn load_config(&self, serial: SerialNum) -> Result<Option<ConfigSnapshot>> {
        let row = sqlx::query_as::<_, (String,)>(
            "SELECT snapshot FROM config_snapshots WHERE serial = ?1 AND valid = 1",
        )
        .bind(serial as i64)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((json,)) => {
                let mut snapshot: ConfigSnapshot = serde_json::from_str(&json)?;
                snapshot.serial = serial;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    async fn best_serial(&self) -> Result<SerialNum> {
        self.scalar_serial(
            "SELECT MAX(serial) FROM config_snapshots WHERE valid = 1",
            None,
        )
        .await
    }

    async fn oldest_serial(&self) -> Result<SerialNum> {
        self.scalar_serial(
            "SELECT MIN(serial) FROM config_snapshots WHERE valid = 1",
            None,
        )
        .await
    }

    async fn prev_valid_serial(&self, serial: SerialNum) -> Result<SerialNum> {
        self.scalar_serial(
            "SELECT MAX(serial) FROM config_snapshots WHERE valid = 1 AND serial < ?1",
            Some(serial),
        )
        .await
    }

    async fn has_valid_serial(&self, serial: SerialNum) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM config_snapshots WHERE valid = 1 AND serial = ?1",
        )
        .bind(serial as i64)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    async fn prune(&self, serial: SerialNum) -> Result<u64> {
        let result = sqlx::query("DELETE FROM config_snapshots WHERE serial < ?1")
            .bind(serial as i64)
            .execute(&self.pool)
            .await?;
        let removed = result.rows_affected();
        if removed > 0 {
            debug!(serial, removed, "Pruned config snapshots");
        }
        Ok(removed)
    }

    async fn remove_after(&self, serial: SerialNum) -> Result<u64> {
        let result = sqlx::query("DELETE FROM config_snapshots WHERE serial > ?1")
            .bind(serial as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
