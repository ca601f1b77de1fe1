// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bucket readiness as decided by the cluster controller.

use std::collections::BTreeSet;

use crate::config_snapshot::ReadyMode;
use crate::document::{BucketId, GlobalId};
use crate::subdb::SubDbType;

/// Which buckets this node should serve searches for.
///
/// The default treats every bucket as ready.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterState {
    ready_buckets: Option<BTreeSet<BucketId>>,
}

impl ClusterState {
    pub fn all_ready() -> Self {
        Self::default()
    }

    pub fn with_ready_buckets(buckets: impl IntoIterator<Item = BucketId>) -> Self {
        Self {
            ready_buckets: Some(buckets.into_iter().collect()),
        }
    }

    pub fn is_ready(&self, gid: &GlobalId) -> bool {
        match &self.ready_buckets {
            None => true,
            Some(buckets) => buckets.iter().any(|b| b.contains(gid)),
        }
    }

    /// Sub-database a document with `gid` belongs in.
    pub fn target_sub_db(&self, mode: ReadyMode, gid: &GlobalId) -> SubDbType {
        match mode {
            ReadyMode::StoreOnly => SubDbType::NotReady,
            ReadyMode::Index if self.is_ready(gid) => SubDbType::Ready,
            ReadyMode::Index => SubDbType::NotReady,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentId;

    fn gid(location: u64) -> GlobalId {
        DocumentId::parse(&format!("id:ns:music:n={}:x", location))
            .unwrap()
            .global_id()
    }

    #[test]
    fn test_all_ready_by_default() {
        let state = ClusterState::default();
        assert!(state.is_ready(&gid(1)));
        assert_eq!(state.target_sub_db(ReadyMode::Index, &gid(1)), SubDbType::Ready);
        assert_eq!(
            state.target_sub_db(ReadyMode::StoreOnly, &gid(1)),
            SubDbType::NotReady
        );
    }

    #[test]
    fn test_ready_bucket_subset() {
        let state = ClusterState::with_ready_buckets([BucketId::new(8, 1)]);
        assert!(state.is_ready(&gid(1)));
        assert!(state.is_ready(&gid(257)));
        assert!(!state.is_ready(&gid(2)));
        assert_eq!(state.target_sub_db(ReadyMode::Index, &gid(2)), SubDbType::NotReady);
    }
}
