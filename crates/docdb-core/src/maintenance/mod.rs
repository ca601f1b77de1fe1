// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background maintenance of a document database.
//!
//! Each [`MaintenanceJob`] runs in its own tokio task. The controller owns a
//! watch channel of [`JobControl`]; flipping it to `Stop` makes every job
//! abandon its current unit of work and exit. Jobs never touch the stores
//! directly: they ask the master task through a [`MaintenanceTarget`].

pub mod jobs;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::document::Timestamp;
use crate::error::Result;
use crate::state::DdbStateHandle;
use crate::subdb::SubDbType;

pub use jobs::{BucketMoveJob, HeartBeatJob, LidSpaceCompactionJob, PruneRemovedDocumentsJob};

/// Run/stop switch shared by all jobs of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobControl {
    Run,
    Stop,
}

/// Work the master task performs on behalf of maintenance jobs.
#[async_trait]
pub trait MaintenanceTarget: Send + Sync {
    async fn heart_beat(&self) -> Result<()>;

    /// Compact the lid space of `sub_db`. Returns documents moved.
    async fn compact_lid_space(&self, sub_db: SubDbType, max_moves: usize) -> Result<usize>;

    /// Prune tombstones older than `cutoff`. Returns tombstones pruned.
    async fn prune_removed(&self, cutoff: Timestamp, limit: usize) -> Result<usize>;

    /// Move documents to the sub-database the cluster state wants them in.
    /// Returns documents moved.
    async fn move_buckets(&self, limit: usize) -> Result<usize>;
}

/// Checked by jobs before each unit of work.
#[derive(Debug, Clone)]
pub struct JobGate {
    state: Arc<DdbStateHandle>,
    control: watch::Receiver<JobControl>,
}

impl JobGate {
    pub fn new(state: Arc<DdbStateHandle>, control: watch::Receiver<JobControl>) -> Self {
        Self { state, control }
    }

    /// Whether work that drops data may run in the current state.
    pub fn allow_prune(&self) -> bool {
        self.state.allow_prune()
    }

    pub fn stopping(&self) -> bool {
        *self.control.borrow() == JobControl::Stop || self.state.state().is_closed()
    }
}

#[async_trait]
pub trait MaintenanceJob: Send + Sync {
    fn name(&self) -> String;

    /// Delay before the first run.
    fn delay(&self) -> Duration {
        Duration::ZERO
    }

    /// Pause between runs once a run reports it is finished.
    fn interval(&self) -> Duration;

    /// One unit of work. Returns `true` when there is nothing more to do
    /// until the next interval, `false` to be run again right away.
    async fn run(&self, gate: &JobGate) -> Result<bool>;
}

struct RunningJob {
    name: String,
    handle: JoinHandle<()>,
}

/// Starts, stops and replaces the maintenance jobs of one document database.
pub struct MaintenanceController {
    doc_type: String,
    state: Arc<DdbStateHandle>,
    control: watch::Sender<JobControl>,
    pending: Vec<Arc<dyn MaintenanceJob>>,
    running: Vec<RunningJob>,
    started: bool,
}

impl std::fmt::Debug for MaintenanceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceController")
            .field("doc_type", &self.doc_type)
            .field("jobs", &self.job_names())
            .field("started", &self.started)
            .finish()
    }
}

impl MaintenanceController {
    pub fn new(doc_type: impl Into<String>, state: Arc<DdbStateHandle>) -> Self {
        let (control, _) = watch::channel(JobControl::Stop);
        Self {
            doc_type: doc_type.into(),
            state,
            control,
            pending: Vec::new(),
            running: Vec::new(),
            started: false,
        }
    }

    /// Add a job. It starts right away if the controller is running.
    pub fn register_job(&mut self, job: Arc<dyn MaintenanceJob>) {
        if self.started {
            self.spawn(job);
        } else {
            self.pending.push(job);
        }
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn job_names(&self) -> Vec<String> {
        self.running
            .iter()
            .map(|j| j.name.clone())
            .chain(self.pending.iter().map(|j| j.name()))
            .collect()
    }

    /// Start every registered job.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        self.control.send_replace(JobControl::Run);
        for job in std::mem::take(&mut self.pending) {
            self.spawn(job);
        }
        info!(doc_type = %self.doc_type, jobs = self.running.len(), "Maintenance started");
    }

    fn spawn(&mut self, job: Arc<dyn MaintenanceJob>) {
        let name = job.name();
        let gate = JobGate::new(self.state.clone(), self.control.subscribe());
        let doc_type = self.doc_type.clone();
        let handle = tokio::spawn(run_job(doc_type, job, gate));
        self.running.push(RunningJob { name, handle });
    }

    /// Stop and forget every job. Registered jobs can be added again after.
    pub async fn kill_jobs(&mut self) {
        self.control.send_replace(JobControl::Stop);
        let running = std::mem::take(&mut self.running);
        let count = running.len();
        for job in running {
            if let Err(e) = job.handle.await
                && !e.is_cancelled()
            {
                warn!(doc_type = %self.doc_type, job = %job.name, error = %e, "Maintenance job panicked");
            }
        }
        self.pending.clear();
        if self.started {
            self.control.send_replace(JobControl::Run);
        }
        debug!(doc_type = %self.doc_type, jobs = count, "Killed maintenance jobs");
    }

    /// Stop every job for good.
    pub async fn stop(&mut self) {
        self.started = false;
        self.kill_jobs().await;
        info!(doc_type = %self.doc_type, "Maintenance stopped");
    }
}

async fn wait_for_stop(control: &mut watch::Receiver<JobControl>) {
    // a dropped controller counts as stop
    let _ = control.wait_for(|c| *c == JobControl::Stop).await;
}

/// Sleep for `duration`; returns `false` if stopped first.
async fn pause(control: &mut watch::Receiver<JobControl>, duration: Duration) -> bool {
    tokio::select! {
        biased;
        _ = wait_for_stop(control) => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

async fn run_job(doc_type: String, job: Arc<dyn MaintenanceJob>, gate: JobGate) {
    let name = job.name();
    let mut control = gate.control.clone();
    debug!(doc_type = %doc_type, job = %name, "Maintenance job started");

    if pause(&mut control, job.delay()).await {
        loop {
            if gate.stopping() {
                break;
            }
            let outcome = tokio::select! {
                biased;
                _ = wait_for_stop(&mut control) => break,
                outcome = job.run(&gate) => outcome,
            };
            let wait = match outcome {
                Ok(true) => job.interval(),
                Ok(false) => Duration::ZERO,
                Err(e) => {
                    warn!(doc_type = %doc_type, job = %name, error = %e, "Maintenance job failed");
                    job.interval()
                }
            };
            if wait.is_zero() {
                tokio::task::yield_now().await;
            } else if !pause(&mut control, wait).await {
                break;
            }
        }
    }

    debug!(doc_type = %doc_type, job = %name, "Maintenance job stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::DdbState;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingJob {
        runs: Arc<AtomicUsize>,
        interval: Duration,
    }

    #[async_trait]
    impl MaintenanceJob for CountingJob {
        fn name(&self) -> String {
            "counting".into()
        }

        fn interval(&self) -> Duration {
            self.interval
        }

        async fn run(&self, _gate: &JobGate) -> Result<bool> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    /// Never finishes a unit of work on its own.
    struct StuckJob;

    #[async_trait]
    impl MaintenanceJob for StuckJob {
        fn name(&self) -> String {
            "stuck".into()
        }

        fn interval(&self) -> Duration {
            Duration::from_secs(1)
        }

        async fn run(&self, _gate: &JobGate) -> Result<bool> {
            std::future::pending::<()>().await;
            Ok(true)
        }
    }

    fn state() -> Arc<DdbStateHandle> {
        Arc::new(DdbStateHandle::new("music", None))
    }

    #[tokio::test(start_paused = true)]
    async fn test_jobs_run_on_interval_after_start() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut controller = MaintenanceController::new("music", state());
        controller.register_job(Arc::new(CountingJob {
            runs: runs.clone(),
            interval: Duration::from_secs(10),
        }));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        controller.start();
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        controller.stop().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_kill_interrupts_running_work() {
        let mut controller = MaintenanceController::new("music", state());
        controller.register_job(Arc::new(StuckJob));
        controller.start();
        tokio::task::yield_now().await;
        assert_eq!(controller.job_names(), vec!["stuck".to_string()]);

        tokio::time::timeout(Duration::from_secs(5), controller.kill_jobs())
            .await
            .unwrap();
        assert!(controller.job_names().is_empty());
        assert!(controller.is_started());
    }

    #[tokio::test]
    async fn test_gate_reports_stopping_on_shutdown() {
        let state = state();
        let (tx, rx) = watch::channel(JobControl::Run);
        let gate = JobGate::new(state.clone(), rx);
        assert!(!gate.stopping());
        assert!(!gate.allow_prune());

        state.enter(DdbState::Shutdown).unwrap();
        assert!(gate.stopping());
        drop(tx);
    }
}
