// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reprocessing of stored documents after a schema change.
//!
//! Tasks read every document of a sub-database from its summary store and
//! rewrite derived structures. Attribute columns are filled in batches so
//! readers are never locked out for a whole pass; a rebuilt index is built
//! aside and swapped in.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info};

use crate::config_snapshot::DocumentDbConfig;
use crate::document::{Document, Lid};
use crate::subdb::{IndexManager, SubDbCollection, SubDbType};

const POPULATE_BATCH: usize = 512;

/// One unit of reprocessing work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReprocessTask {
    /// Fill newly added attribute columns from stored documents.
    PopulateAttributes {
        sub_db: SubDbType,
        fields: Vec<String>,
    },
    /// Re-index every ready document with the current index fields.
    RebuildIndex { fields: Vec<String> },
}

impl ReprocessTask {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PopulateAttributes { .. } => "populate_attributes",
            Self::RebuildIndex { .. } => "rebuild_index",
        }
    }
}

/// Queue of pending reprocessing tasks.
#[derive(Debug, Default)]
pub struct ReprocessingRunner {
    tasks: Vec<ReprocessTask>,
    runs: Arc<AtomicU64>,
}

impl ReprocessingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runner that counts completed tasks into `runs`.
    pub fn with_counter(runs: Arc<AtomicU64>) -> Self {
        Self {
            tasks: Vec::new(),
            runs,
        }
    }

    /// Queue tasks. A rebuild replaces an earlier queued rebuild.
    pub fn add_tasks(&mut self, tasks: impl IntoIterator<Item = ReprocessTask>) {
        for task in tasks {
            if matches!(task, ReprocessTask::RebuildIndex { .. }) {
                self.tasks
                    .retain(|t| !matches!(t, ReprocessTask::RebuildIndex { .. }));
            }
            if !self.tasks.contains(&task) {
                self.tasks.push(task);
            }
        }
    }

    /// Queue the tasks produced by activating `config`.
    ///
    /// Queued work left over from an earlier config is trimmed first: a
    /// rebuild for other index fields is dropped and attribute fills keep
    /// only fields that are still attributes.
    pub fn schedule(
        &mut self,
        config: &DocumentDbConfig,
        tasks: impl IntoIterator<Item = ReprocessTask>,
    ) {
        let indexed: Vec<String> = config.schema.indexed_fields().into_iter().collect();
        let attributes = config.schema.attribute_fields();

        let before = self.tasks.len();
        self.tasks.retain_mut(|task| match task {
            ReprocessTask::RebuildIndex { fields } => *fields == indexed,
            ReprocessTask::PopulateAttributes { fields, .. } => {
                fields.retain(|f| attributes.contains(f));
                !fields.is_empty()
            }
        });
        if self.tasks.len() < before {
            debug!(dropped = before - self.tasks.len(), "Dropped stale reprocessing tasks");
        }
        self.add_tasks(tasks);
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn pending(&self) -> &[ReprocessTask] {
        &self.tasks
    }

    /// Shared counter of completed tasks.
    pub fn run_counter(&self) -> Arc<AtomicU64> {
        self.runs.clone()
    }

    /// Run every queued task in order.
    ///
    /// `on_progress` receives a fraction in `0.0..=1.0`. The writer
    /// executors must be drained before calling this.
    pub async fn run(
        &mut self,
        sub_dbs: &SubDbCollection,
        mut on_progress: impl FnMut(f32, &str),
    ) -> usize {
        let tasks = std::mem::take(&mut self.tasks);
        let total = tasks.len();

        for (idx, task) in tasks.into_iter().enumerate() {
            let base = idx as f32 / total as f32;
            let share = 1.0 / total as f32;
            on_progress(base, task.name());

            match &task {
                ReprocessTask::PopulateAttributes { sub_db, fields } => {
                    populate_attributes(sub_dbs, *sub_db, fields, |done| {
                        on_progress(base + share * done, task.name())
                    })
                    .await;
                }
                ReprocessTask::RebuildIndex { fields } => {
                    rebuild_index(sub_dbs, fields).await;
                }
            }

            self.runs.fetch_add(1, Ordering::Relaxed);
            info!(task = task.name(), "Reprocessing task done");
        }

        if total > 0 {
            on_progress(1.0, "done");
        }
        total
    }
}

async fn populate_attributes(
    sub_dbs: &SubDbCollection,
    sub_db: SubDbType,
    fields: &[String],
    mut on_progress: impl FnMut(f32),
) {
    let sub_db = sub_dbs.get(sub_db);
    let lids: Vec<Lid> = sub_db.summary.read().await.iter().map(|(lid, _)| lid).collect();
    let total = lids.len().max(1);

    for (batch_no, batch) in lids.chunks(POPULATE_BATCH).enumerate() {
        let docs: Vec<(Lid, Document)> = {
            let summary = sub_db.summary.read().await;
            batch
                .iter()
                .filter_map(|lid| summary.get(*lid).map(|d| (*lid, d.clone())))
                .collect()
        };
        {
            let mut attributes = sub_db.attributes.write().await;
            for (lid, doc) in &docs {
                attributes.populate(*lid, doc, fields);
            }
        }
        let done = ((batch_no + 1) * POPULATE_BATCH).min(lids.len());
        on_progress(done as f32 / total as f32);
        tokio::task::yield_now().await;
    }

    debug!(
        sub_db = %sub_db.sub_db_type(),
        documents = lids.len(),
        fields = ?fields,
        "Populated attributes"
    );
}

async fn rebuild_index(sub_dbs: &SubDbCollection, fields: &[String]) {
    let ready = sub_dbs.get(SubDbType::Ready);
    let Some(index) = &ready.index else {
        return;
    };

    let rebuilt = {
        let summary = ready.summary.read().await;
        IndexManager::rebuilt(fields.iter().cloned().collect(), summary.iter())
    };
    let indexed = rebuilt.indexed_lids();
    index.write().await.replace_with(rebuilt);

    debug!(documents = indexed, fields = ?fields, "Rebuilt index");
}
