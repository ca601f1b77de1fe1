// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sequenced writer executors.
//!
//! Each executor is one tokio task draining a channel of boxed futures, so
//! jobs submitted to the same executor run strictly in submission order.
//! The feed view fans one operation out to the summary, attribute and index
//! executors; the operation is done when every job holding its
//! [`OperationDone`] guard has finished.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::feed::FeedResult;

/// A unit of work for an executor.
pub type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

enum ExecutorMessage {
    Run(Job),
    Sync(oneshot::Sender<()>),
}

/// Single-task executor running jobs in order.
pub struct SequencedExecutor {
    name: &'static str,
    sender: mpsc::UnboundedSender<ExecutorMessage>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SequencedExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequencedExecutor")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl SequencedExecutor {
    pub fn new(name: &'static str) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<ExecutorMessage>();
        let handle = tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                match message {
                    ExecutorMessage::Run(job) => job.await,
                    ExecutorMessage::Sync(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!(executor = name, "Executor stopped");
        });

        Self {
            name,
            sender,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Queue `job`. Returns `false` if the executor has shut down.
    pub fn execute<F>(&self, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.sender
            .send(ExecutorMessage::Run(Box::pin(job)))
            .is_ok()
    }

    /// Wait until every job queued before this call has finished.
    pub async fn sync(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(ExecutorMessage::Sync(tx)).is_err() {
            return;
        }
        let _ = rx.await;
    }

    /// Finish queued jobs and stop the task.
    pub async fn shutdown(&self) {
        self.sync().await;
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

/// The writer executors shared by all sub-databases.
#[derive(Debug)]
pub struct WriteExecutors {
    pub summary: SequencedExecutor,
    pub attribute: SequencedExecutor,
    pub index: SequencedExecutor,
}

impl WriteExecutors {
    pub fn new() -> Self {
        Self {
            summary: SequencedExecutor::new("summary"),
            attribute: SequencedExecutor::new("attribute"),
            index: SequencedExecutor::new("index"),
        }
    }

    /// Barrier over all three executors.
    pub async fn sync_all(&self) {
        self.summary.sync().await;
        self.attribute.sync().await;
        self.index.sync().await;
    }

    pub async fn shutdown(&self) {
        self.summary.shutdown().await;
        self.attribute.shutdown().await;
        self.index.shutdown().await;
    }
}

impl Default for WriteExecutors {
    fn default() -> Self {
        Self::new()
    }
}

/// Completion guard of one feed operation.
///
/// Clones are handed to every writer job of the operation; the result is
/// delivered when the last clone is dropped.
pub struct OperationDone {
    reply: Option<oneshot::Sender<FeedResult>>,
    result: FeedResult,
}

/// Shared handle to an [`OperationDone`].
pub type DoneToken = Arc<OperationDone>;

impl OperationDone {
    pub fn new(reply: Option<oneshot::Sender<FeedResult>>, result: FeedResult) -> DoneToken {
        Arc::new(Self { reply, result })
    }

    /// Token without a waiting caller, used during replay.
    pub fn detached() -> DoneToken {
        Self::new(None, FeedResult::Ok)
    }
}

impl Drop for OperationDone {
    fn drop(&mut self) {
        if let Some(reply) = self.reply.take()
            && reply.send(self.result.clone()).is_err()
        {
            warn!("Feed caller went away before operation completed");
        }
    }
}
