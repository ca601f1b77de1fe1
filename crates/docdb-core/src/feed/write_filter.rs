// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource usage write filter.
//!
//! Puts and updates are rejected while memory or disk usage is above the
//! configured limits. Removes always pass since they free resources.

use std::sync::Mutex;

use serde::Serialize;
use tracing::{info, warn};

use crate::config_snapshot::ResourceLimits;

/// Resource usage reported by the host, as fractions of capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceUsage {
    pub memory: f64,
    pub disk: f64,
}

#[derive(Debug)]
struct FilterState {
    limits: ResourceLimits,
    usage: ResourceUsage,
    accept: bool,
    message: String,
}

impl FilterState {
    fn recalculate(&mut self) {
        let mut reasons = Vec::new();
        if self.usage.memory > self.limits.memory_limit {
            reasons.push(format!(
                "memory usage {:.3} above limit {:.3}",
                self.usage.memory, self.limits.memory_limit
            ));
        }
        if self.usage.disk > self.limits.disk_limit {
            reasons.push(format!(
                "disk usage {:.3} above limit {:.3}",
                self.usage.disk, self.limits.disk_limit
            ));
        }

        let accept = reasons.is_empty();
        if accept != self.accept {
            if accept {
                info!("Resource usage back below limits, accepting writes");
            } else {
                warn!(reason = %reasons.join("; "), "Rejecting writes");
            }
        }
        self.accept = accept;
        self.message = reasons.join("; ");
    }
}

#[derive(Debug)]
pub struct ResourceUsageFilter {
    state: Mutex<FilterState>,
}

impl ResourceUsageFilter {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            state: Mutex::new(FilterState {
                limits,
                usage: ResourceUsage::default(),
                accept: true,
                message: String::new(),
            }),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut FilterState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn set_limits(&self, limits: ResourceLimits) {
        self.with_state(|s| {
            s.limits = limits;
            s.recalculate();
        });
    }

    pub fn notify_resource_usage(&self, usage: ResourceUsage) {
        self.with_state(|s| {
            s.usage = usage;
            s.recalculate();
        });
    }

    pub fn accept_write_operation(&self) -> bool {
        self.with_state(|s| s.accept)
    }

    /// Why writes are rejected, empty when they are accepted.
    pub fn message(&self) -> String {
        self.with_state(|s| s.message.clone())
    }

    pub fn usage(&self) -> ResourceUsage {
        self.with_state(|s| s.usage)
    }
}

impl Default for ResourceUsageFilter {
    fn default() -> Self {
        Self::new(ResourceLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_below_limits() {
        let filter = ResourceUsageFilter::default();
        filter.notify_resource_usage(ResourceUsage {
            memory: 0.5,
            disk: 0.5,
        });
        assert!(filter.accept_write_operation());
        assert!(filter.message().is_empty());
    }

    #[test]
    fn test_rejects_above_limits_and_recovers() {
        let filter = ResourceUsageFilter::default();
        filter.notify_resource_usage(ResourceUsage {
            memory: 0.9,
            disk: 0.8,
        });
        assert!(!filter.accept_write_operation());
        let message = filter.message();
        assert!(message.contains("memory usage 0.900 above limit 0.800"));
        assert!(message.contains("disk usage"));

        filter.set_limits(ResourceLimits {
            memory_limit: 0.95,
            disk_limit: 0.95,
        });
        assert!(filter.accept_write_operation());
    }
}
