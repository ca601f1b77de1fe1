// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! When index changes become visible to searches.

use std::time::Duration;

/// What the feed view should do after applying an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitAction {
    CommitNow,
    ScheduleCommit(Duration),
    None,
}

/// Commits immediately with a zero delay; otherwise batches changes into
/// one commit per delay period.
#[derive(Debug, Default)]
pub struct VisibilityHandler {
    delay: Duration,
    dirty: bool,
    scheduled: bool,
}

impl VisibilityHandler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            dirty: false,
            scheduled: false,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn set_delay(&mut self, delay: Duration) {
        self.delay = delay;
    }

    pub fn on_operation(&mut self) -> CommitAction {
        if self.delay.is_zero() {
            return CommitAction::CommitNow;
        }
        self.dirty = true;
        if self.scheduled {
            return CommitAction::None;
        }
        self.scheduled = true;
        CommitAction::ScheduleCommit(self.delay)
    }

    /// A scheduled commit fired. Returns whether there is anything to commit.
    pub fn on_timer(&mut self) -> bool {
        self.scheduled = false;
        self.dirty
    }

    pub fn on_commit(&mut self) {
        self.dirty = false;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}
