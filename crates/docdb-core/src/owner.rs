// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Capabilities a document database needs from the process hosting it.

use std::sync::Mutex;

use crate::state::StatusReport;

/// Host of one or more document databases.
pub trait DocumentDbOwner: Send + Sync {
    /// Identity of this node in the content cluster.
    fn distribution_key(&self) -> u32;

    /// Called after every state or config state change.
    fn on_status_changed(&self, _report: &StatusReport) {}
}

/// Owner that only knows its distribution key and remembers the latest
/// status report.
#[derive(Debug, Default)]
pub struct StaticOwner {
    distribution_key: u32,
    last_status: Mutex<Option<StatusReport>>,
}

impl StaticOwner {
    pub fn new(distribution_key: u32) -> Self {
        Self {
            distribution_key,
            last_status: Mutex::new(None),
        }
    }

    pub fn last_status(&self) -> Option<StatusReport> {
        self.last_status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl DocumentDbOwner for StaticOwner {
    fn distribution_key(&self) -> u32 {
        self.distribution_key
    }

    fn on_status_changed(&self, report: &StatusReport) {
        *self.last_status.lock().unwrap_or_else(|e| e.into_inner()) = Some(report.clone());
    }
}
