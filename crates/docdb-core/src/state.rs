// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle state of a document database.
//!
//! State, config state, progress and the active config live under one
//! mutex. Waiters observe changes through a watch channel so they never
//! need the master task.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config_snapshot::ConfigSnapshot;
use crate::error::{DocDbError, Result};
use crate::owner::DocumentDbOwner;

/// Lifecycle states, in startup order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DdbState {
    Construct,
    Load,
    ReplayTransactionLog,
    RedoReprocess,
    ApplyLiveConfig,
    Reprocess,
    Online,
    Shutdown,
    Dead,
}

impl DdbState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Construct => "construct",
            Self::Load => "load",
            Self::ReplayTransactionLog => "replay_transaction_log",
            Self::RedoReprocess => "redo_reprocess",
            Self::ApplyLiveConfig => "apply_live_config",
            Self::Reprocess => "reprocess",
            Self::Online => "online",
            Self::Shutdown => "shutdown",
            Self::Dead => "dead",
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Shutdown | Self::Dead)
    }

    /// Whether a flush may prune the transaction log. Before replay has
    /// finished and live config is applied, pruning could drop entries that
    /// are still needed.
    pub fn allow_prune(&self) -> bool {
        matches!(self, Self::ApplyLiveConfig | Self::Reprocess | Self::Online)
    }

    /// Live configs are applied directly from these states.
    pub fn allow_live_config(&self) -> bool {
        matches!(self, Self::ApplyLiveConfig | Self::Reprocess | Self::Online)
    }

    pub fn can_transition_to(&self, next: DdbState) -> bool {
        use DdbState::*;
        match (self, next) {
            (Dead, _) => false,
            (_, Dead) => true,
            (Shutdown, _) => false,
            (_, Shutdown) => true,
            (Construct, Load)
            | (Load, ReplayTransactionLog)
            | (ReplayTransactionLog, RedoReprocess | ApplyLiveConfig)
            | (RedoReprocess, ApplyLiveConfig)
            | (ApplyLiveConfig, Reprocess | Online)
            | (Reprocess, Online)
            | (Online, Reprocess) => true,
            _ => false,
        }
    }
}

impl fmt::Display for DdbState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether the active config is everything that was asked for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigState {
    #[default]
    Ok,
    /// Part of the requested config only takes effect after a restart.
    NeedRestart,
}

/// Health and progress of one document database.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub doc_type: String,
    pub state: DdbState,
    pub config_state: ConfigState,
    /// Progress of the current state's work, `0.0..=1.0`.
    pub progress: f32,
    pub message: String,
    pub active_generation: Option<i64>,
}

/// What waiters see through the watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateWatch {
    pub state: DdbState,
    pub generation: Option<i64>,
}

#[derive(Debug)]
struct Inner {
    state: DdbState,
    config_state: ConfigState,
    progress: f32,
    message: String,
    active_config: Option<Arc<ConfigSnapshot>>,
}

/// Shared handle to the lifecycle state.
pub struct DdbStateHandle {
    doc_type: String,
    inner: Mutex<Inner>,
    watch: watch::Sender<StateWatch>,
    owner: Option<Arc<dyn DocumentDbOwner>>,
}

impl fmt::Debug for DdbStateHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DdbStateHandle")
            .field("doc_type", &self.doc_type)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl DdbStateHandle {
    pub fn new(doc_type: impl Into<String>, owner: Option<Arc<dyn DocumentDbOwner>>) -> Self {
        let (watch, _) = watch::channel(StateWatch {
            state: DdbState::Construct,
            generation: None,
        });
        Self {
            doc_type: doc_type.into(),
            inner: Mutex::new(Inner {
                state: DdbState::Construct,
                config_state: ConfigState::Ok,
                progress: 0.0,
                message: String::new(),
                active_config: None,
            }),
            watch,
            owner,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, inner: &Inner) {
        self.watch.send_replace(StateWatch {
            state: inner.state,
            generation: inner.active_config.as_ref().map(|c| c.generation),
        });
    }

    fn notify_owner(&self) {
        if let Some(owner) = &self.owner {
            owner.on_status_changed(&self.status());
        }
    }

    pub fn state(&self) -> DdbState {
        self.lock().state
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn enter(&self, next: DdbState) -> Result<()> {
        {
            let mut inner = self.lock();
            let current = inner.state;
            if current == next {
                return Ok(());
            }
            if !current.can_transition_to(next) {
                return Err(DocDbError::IllegalState(format!(
                    "cannot go from {} to {}",
                    current, next
                )));
            }
            inner.state = next;
            inner.progress = 0.0;
            inner.message.clear();
            self.publish(&inner);
            info!(doc_type = %self.doc_type, from = %current, to = %next, "State transition");
        }
        self.notify_owner();
        Ok(())
    }

    /// Enter `Dead` after an unrecoverable failure.
    pub fn enter_dead(&self, reason: &str) {
        {
            let mut inner = self.lock();
            if inner.state == DdbState::Dead {
                return;
            }
            warn!(doc_type = %self.doc_type, from = %inner.state, %reason, "Document database is dead");
            inner.state = DdbState::Dead;
            inner.message = reason.to_string();
            self.publish(&inner);
        }
        self.notify_owner();
    }

    pub fn set_progress(&self, progress: f32, message: impl Into<String>) {
        let mut inner = self.lock();
        inner.progress = progress.clamp(0.0, 1.0);
        inner.message = message.into();
    }

    pub fn config_state(&self) -> ConfigState {
        self.lock().config_state
    }

    pub fn set_config_state(&self, config_state: ConfigState) {
        let changed = {
            let mut inner = self.lock();
            let changed = inner.config_state != config_state;
            inner.config_state = config_state;
            changed
        };
        if changed {
            info!(doc_type = %self.doc_type, config_state = ?config_state, "Config state changed");
            self.notify_owner();
        }
    }

    pub fn active_config(&self) -> Option<Arc<ConfigSnapshot>> {
        self.lock().active_config.clone()
    }

    /// Make `snapshot` the active config. Generations never go backwards.
    pub fn set_active_config(&self, snapshot: Arc<ConfigSnapshot>) -> Result<()> {
        let mut inner = self.lock();
        if let Some(current) = &inner.active_config
            && snapshot.generation < current.generation
        {
            return Err(DocDbError::IllegalState(format!(
                "config generation {} is older than active generation {}",
                snapshot.generation, current.generation
            )));
        }
        inner.active_config = Some(snapshot);
        self.publish(&inner);
        Ok(())
    }

    pub fn allow_prune(&self) -> bool {
        self.state().allow_prune()
    }

    pub fn status(&self) -> StatusReport {
        let inner = self.lock();
        StatusReport {
            doc_type: self.doc_type.clone(),
            state: inner.state,
            config_state: inner.config_state,
            progress: inner.progress,
            message: inner.message.clone(),
            active_generation: inner.active_config.as_ref().map(|c| c.generation),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<StateWatch> {
        self.watch.subscribe()
    }

    /// Wait until the active generation reaches `generation`.
    ///
    /// Fails with `IllegalState` once the database is shutting down.
    pub async fn wait_for_generation(&self, generation: i64) -> Result<()> {
        let mut rx = self.subscribe();
        let result = rx
            .wait_for(|w| w.state.is_closed() || w.generation.is_some_and(|g| g >= generation))
            .await
            .map(|w| *w);
        match result {
            Ok(w) if w.state.is_closed() => Err(DocDbError::IllegalState(format!(
                "document database closed while waiting for config generation {}",
                generation
            ))),
            Ok(_) => Ok(()),
            Err(_) => Err(DocDbError::Closed),
        }
    }

    /// Wait until the database is online.
    pub async fn wait_for_online(&self) -> Result<()> {
        let mut rx = self.subscribe();
        let result = rx
            .wait_for(|w| w.state == DdbState::Online || w.state.is_closed())
            .await
            .map(|w| w.state);
        match result {
            Ok(DdbState::Online) => Ok(()),
            Ok(state) => Err(DocDbError::IllegalState(format!(
                "document database is {}",
                state
            ))),
            Err(_) => Err(DocDbError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_snapshot::DocumentDbConfig;
    use std::time::Duration;

    fn snapshot(generation: i64) -> Arc<ConfigSnapshot> {
        Arc::new(ConfigSnapshot::new(
            "music",
            generation,
            DocumentDbConfig::default(),
        ))
    }

    #[test]
    fn test_startup_path_is_allowed() {
        let handle = DdbStateHandle::new("music", None);
        for state in [
            DdbState::Load,
            DdbState::ReplayTransactionLog,
            DdbState::RedoReprocess,
            DdbState::ApplyLiveConfig,
            DdbState::Reprocess,
            DdbState::Online,
            DdbState::Shutdown,
            DdbState::Dead,
        ] {
            handle.enter(state).unwrap();
        }
        assert_eq!(handle.state(), DdbState::Dead);
    }

    #[test]
    fn test_invalid_transitions_are_rejected() {
        let handle = DdbStateHandle::new("music", None);
        let err = handle.enter(DdbState::Online).unwrap_err();
        assert_eq!(err.error_code(), "ILLEGAL_STATE");

        handle.enter(DdbState::Shutdown).unwrap();
        assert!(handle.enter(DdbState::Load).is_err());
        assert!(handle.enter(DdbState::Dead).is_ok());
        assert!(handle.enter(DdbState::Shutdown).is_err());
    }

    #[test]
    fn test_allow_prune_states() {
        assert!(!DdbState::Load.allow_prune());
        assert!(!DdbState::ReplayTransactionLog.allow_prune());
        assert!(!DdbState::RedoReprocess.allow_prune());
        assert!(DdbState::ApplyLiveConfig.allow_prune());
        assert!(DdbState::Online.allow_prune());
        assert!(!DdbState::Shutdown.allow_prune());
    }

    #[test]
    fn test_generation_never_goes_backwards() {
        let handle = DdbStateHandle::new("music", None);
        handle.set_active_config(snapshot(3)).unwrap();
        assert!(handle.set_active_config(snapshot(2)).is_err());
        handle.set_active_config(snapshot(3)).unwrap();
        assert_eq!(handle.status().active_generation, Some(3));
    }

    #[tokio::test]
    async fn test_wait_for_generation() {
        let handle = Arc::new(DdbStateHandle::new("music", None));
        handle.set_active_config(snapshot(1)).unwrap();
        handle.wait_for_generation(1).await.unwrap();

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_for_generation(2).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        handle.set_active_config(snapshot(2)).unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_generation_fails_on_close() {
        let handle = Arc::new(DdbStateHandle::new("music", None));
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_for_generation(5).await })
        };
        handle.enter(DdbState::Shutdown).unwrap();
        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.error_code(), "ILLEGAL_STATE");
    }
}
