// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Document meta store: the lid ↔ gid mapping of one sub-database.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::config_snapshot::TuningConfig;
use crate::document::{BucketId, GlobalId, Lid, Timestamp};
use crate::subdb::SubDbType;

/// Per-document metadata stored at a lid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaEntry {
    pub gid: GlobalId,
    pub bucket: BucketId,
    pub timestamp: Timestamp,
    pub doc_size: u32,
}

/// Growth strategy for lid-indexed vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocStrategy {
    pub initial_capacity: usize,
    pub grow_factor: f64,
    pub grow_delta: usize,
}

impl AllocStrategy {
    /// Removed sub-databases only hold tombstones and start small.
    pub const REMOVED_INITIAL_CAPACITY: usize = 1024;

    /// Size each sub-database for its expected share of documents.
    ///
    /// The ready sub-database holds the searchable copies, the not-ready one
    /// the rest of the replicas.
    pub fn for_sub_db(tuning: &TuningConfig, sub_db: SubDbType) -> Self {
        let redundancy = tuning.redundancy.max(1) as u64;
        let searchable = (tuning.searchable_copies as u64).min(redundancy);
        let docs = tuning.initial_num_docs as u64;

        let initial_capacity = match sub_db {
            SubDbType::Ready => docs * searchable / redundancy,
            SubDbType::NotReady => docs * (redundancy - searchable) / redundancy,
            SubDbType::Removed => Self::REMOVED_INITIAL_CAPACITY as u64,
        };

        Self {
            initial_capacity: initial_capacity as usize,
            grow_factor: tuning.grow_factor.max(0.0),
            grow_delta: tuning.grow_delta as usize,
        }
    }

    /// Capacity to grow to once `current` is exhausted.
    pub fn next_capacity(&self, current: usize) -> usize {
        let by_factor = (current as f64 * self.grow_factor) as usize;
        current + by_factor.max(self.grow_delta).max(1)
    }
}

impl Default for AllocStrategy {
    fn default() -> Self {
        Self {
            initial_capacity: 1024,
            grow_factor: 0.2,
            grow_delta: 0,
        }
    }
}

/// Lid-space usage, input to lid-space compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LidUsageStats {
    pub lid_limit: Lid,
    pub used_lids: u32,
    pub lowest_free_lid: Option<Lid>,
    pub highest_used_lid: Option<Lid>,
    pub held_lids: u32,
}

impl LidUsageStats {
    /// Allocated lids not holding a document.
    pub fn lid_bloat(&self) -> u32 {
        self.lid_limit.saturating_sub(1).saturating_sub(self.used_lids)
    }

    pub fn lid_bloat_factor(&self) -> f64 {
        if self.lid_limit <= 1 {
            return 0.0;
        }
        self.lid_bloat() as f64 / (self.lid_limit - 1) as f64
    }
}

/// Maps global ids to dense local ids.
///
/// Lid `0` is reserved. Freed lids are reused lowest-first. With
/// `hold_removed_lids`, a freed lid is parked until
/// [`release_held_lids`](Self::release_held_lids) so index postings of the
/// old document are gone before the lid is handed out again.
#[derive(Debug)]
pub struct DocumentMetaStore {
    entries: Vec<Option<MetaEntry>>,
    gid_to_lid: HashMap<GlobalId, Lid>,
    free_lids: BTreeSet<Lid>,
    held_lids: Vec<Lid>,
    hold_removed_lids: bool,
    alloc: AllocStrategy,
}

impl DocumentMetaStore {
    pub fn new(alloc: AllocStrategy, hold_removed_lids: bool) -> Self {
        let mut entries = Vec::with_capacity(alloc.initial_capacity.max(1));
        entries.push(None);
        Self {
            entries,
            gid_to_lid: HashMap::new(),
            free_lids: BTreeSet::new(),
            held_lids: Vec::new(),
            hold_removed_lids,
            alloc,
        }
    }

    /// Rebuild a store from persisted entries.
    pub fn from_entries(
        alloc: AllocStrategy,
        hold_removed_lids: bool,
        lid_limit: Lid,
        stored: impl IntoIterator<Item = (Lid, MetaEntry)>,
    ) -> Self {
        let mut store = Self::new(alloc, hold_removed_lids);
        let limit = lid_limit.max(1) as usize;
        if store.entries.capacity() < limit {
            store.entries.reserve(limit - store.entries.len());
        }
        store.entries.resize(limit, None);

        for (lid, entry) in stored {
            let idx = lid as usize;
            if lid == 0 {
                continue;
            }
            if idx >= store.entries.len() {
                store.entries.resize(idx + 1, None);
            }
            store.entries[idx] = Some(entry);
            store.gid_to_lid.insert(entry.gid, lid);
        }
        store.free_lids = (1..store.entries.len() as Lid)
            .filter(|lid| store.entries[*lid as usize].is_none())
            .collect();
        store
    }

    pub fn alloc_strategy(&self) -> &AllocStrategy {
        &self.alloc
    }

    pub fn get(&self, lid: Lid) -> Option<&MetaEntry> {
        self.entries.get(lid as usize).and_then(Option::as_ref)
    }

    pub fn lookup(&self, gid: &GlobalId) -> Option<(Lid, MetaEntry)> {
        let lid = *self.gid_to_lid.get(gid)?;
        self.get(lid).map(|entry| (lid, *entry))
    }

    pub fn contains(&self, gid: &GlobalId) -> bool {
        self.gid_to_lid.contains_key(gid)
    }

    /// Insert or update `gid`. Returns its lid.
    pub fn put(
        &mut self,
        gid: GlobalId,
        bucket: BucketId,
        timestamp: Timestamp,
        doc_size: u32,
    ) -> Lid {
        let entry = MetaEntry {
            gid,
            bucket,
            timestamp,
            doc_size,
        };
        if let Some(&lid) = self.gid_to_lid.get(&gid) {
            self.entries[lid as usize] = Some(entry);
            return lid;
        }

        let lid = self.allocate_lid();
        self.entries[lid as usize] = Some(entry);
        self.gid_to_lid.insert(gid, lid);
        lid
    }

    /// Lid `gid` has, or the one the next [`put`](Self::put) would give it.
    pub fn peek_lid(&self, gid: &GlobalId) -> Lid {
        if let Some(&lid) = self.gid_to_lid.get(gid) {
            return lid;
        }
        self.free_lids
            .first()
            .copied()
            .unwrap_or(self.entries.len() as Lid)
    }

    fn allocate_lid(&mut self) -> Lid {
        if let Some(lid) = self.free_lids.pop_first() {
            return lid;
        }
        if self.entries.len() == self.entries.capacity() {
            let target = self.alloc.next_capacity(self.entries.capacity());
            self.entries.reserve_exact(target - self.entries.len());
        }
        self.entries.push(None);
        (self.entries.len() - 1) as Lid
    }

    /// Remove `gid`, returning the lid and entry it had.
    pub fn remove(&mut self, gid: &GlobalId) -> Option<(Lid, MetaEntry)> {
        let lid = self.gid_to_lid.remove(gid)?;
        let entry = self.entries[lid as usize].take()?;
        if self.hold_removed_lids {
            self.held_lids.push(lid);
        } else {
            self.free_lids.insert(lid);
        }
        Some((lid, entry))
    }

    /// Make held lids available for reuse. Returns how many were released.
    pub fn release_held_lids(&mut self) -> usize {
        let released = self.held_lids.len();
        self.free_lids.extend(self.held_lids.drain(..));
        released
    }

    /// Move the document at `from` to the free lid `to`.
    ///
    /// Returns `false` without changes if `from` is empty or `to` is not free.
    pub fn move_lid(&mut self, from: Lid, to: Lid) -> bool {
        if !self.free_lids.contains(&to) {
            return false;
        }
        let Some(entry) = self
            .entries
            .get_mut(from as usize)
            .and_then(Option::take)
        else {
            return false;
        };
        self.free_lids.remove(&to);
        self.entries[to as usize] = Some(entry);
        self.gid_to_lid.insert(entry.gid, to);
        if self.hold_removed_lids {
            self.held_lids.push(from);
        } else {
            self.free_lids.insert(from);
        }
        true
    }

    /// Drop free lids at the end of the lid space. Returns the new lid limit.
    pub fn shrink_lid_space(&mut self) -> Lid {
        while self.entries.len() > 1 {
            let last = (self.entries.len() - 1) as Lid;
            if self.entries[last as usize].is_some() || !self.free_lids.contains(&last) {
                break;
            }
            self.free_lids.remove(&last);
            self.entries.pop();
        }
        let target = self.entries.len().max(self.alloc.initial_capacity);
        self.entries.shrink_to(target);
        self.lid_limit()
    }

    pub fn lid_limit(&self) -> Lid {
        self.entries.len() as Lid
    }

    pub fn used_lids(&self) -> u32 {
        self.gid_to_lid.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.gid_to_lid.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    pub fn usage_stats(&self) -> LidUsageStats {
        LidUsageStats {
            lid_limit: self.lid_limit(),
            used_lids: self.used_lids(),
            lowest_free_lid: self.free_lids.first().copied(),
            highest_used_lid: self.highest_used_lid(),
            held_lids: self.held_lids.len() as u32,
        }
    }

    pub fn highest_used_lid(&self) -> Option<Lid> {
        self.entries
            .iter()
            .rposition(Option::is_some)
            .map(|idx| idx as Lid)
    }

    /// Used lids with their entries, lowest lid first.
    pub fn iter(&self) -> impl Iterator<Item = (Lid, &MetaEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(lid, entry)| entry.as_ref().map(|e| (lid as Lid, e)))
    }

    /// Approximate bytes held by this store.
    pub fn memory_usage(&self) -> usize {
        self.entries.capacity() * std::mem::size_of::<Option<MetaEntry>>()
            + self.gid_to_lid.len() * (GlobalId::LENGTH + std::mem::size_of::<Lid>()) * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentId;

    fn gid(n: u32) -> GlobalId {
        DocumentId::parse(&format!("id:ns:music::doc-{}", n))
            .unwrap()
            .global_id()
    }

    fn store(hold: bool) -> DocumentMetaStore {
        DocumentMetaStore::new(AllocStrategy::default(), hold)
    }

    fn put(store: &mut DocumentMetaStore, n: u32, ts: Timestamp) -> Lid {
        store.put(gid(n), BucketId::new(8, n as u64), ts, 10)
    }

    #[test]
    fn test_lid_zero_is_reserved() {
        let mut store = store(false);
        assert_eq!(store.lid_limit(), 1);
        assert_eq!(put(&mut store, 1, 10), 1);
        assert_eq!(put(&mut store, 2, 10), 2);
        assert!(store.get(0).is_none());
        assert_eq!(store.lid_limit(), 3);
    }

    #[test]
    fn test_put_existing_gid_keeps_lid() {
        let mut store = store(false);
        let lid = put(&mut store, 1, 10);
        assert_eq!(put(&mut store, 1, 20), lid);
        assert_eq!(store.lookup(&gid(1)).unwrap().1.timestamp, 20);
        assert_eq!(store.used_lids(), 1);
    }

    #[test]
    fn test_removed_lids_are_reused_lowest_first() {
        let mut store = store(false);
        for n in 1..=4 {
            put(&mut store, n, 10);
        }
        store.remove(&gid(3)).unwrap();
        store.remove(&gid(2)).unwrap();
        assert_eq!(store.peek_lid(&gid(5)), 2);
        assert_eq!(store.peek_lid(&gid(4)), 4);
        assert_eq!(put(&mut store, 5, 10), 2);
        assert_eq!(put(&mut store, 6, 10), 3);
        assert_eq!(put(&mut store, 7, 10), 5);
    }

    #[test]
    fn test_held_lids_are_not_reused_until_released() {
        let mut store = store(true);
        put(&mut store, 1, 10);
        put(&mut store, 2, 10);
        store.remove(&gid(1)).unwrap();
        assert_eq!(store.usage_stats().held_lids, 1);
        assert_eq!(put(&mut store, 3, 10), 3);

        assert_eq!(store.release_held_lids(), 1);
        assert_eq!(put(&mut store, 4, 10), 1);
    }

    #[test]
    fn test_move_lid_and_shrink() {
        let mut store = store(false);
        for n in 1..=5 {
            put(&mut store, n, 10);
        }
        store.remove(&gid(1)).unwrap();
        store.remove(&gid(2)).unwrap();

        let stats = store.usage_stats();
        assert_eq!(stats.lid_bloat(), 2);
        assert_eq!(stats.lowest_free_lid, Some(1));
        assert_eq!(stats.highest_used_lid, Some(5));

        assert!(store.move_lid(5, 1));
        assert!(store.move_lid(4, 2));
        assert!(!store.move_lid(4, 2));
        assert_eq!(store.lookup(&gid(5)).unwrap().0, 1);
        assert_eq!(store.shrink_lid_space(), 4);
        assert_eq!(store.usage_stats().lid_bloat(), 0);
    }

    #[test]
    fn test_from_entries_rebuilds_free_list() {
        let mut original = store(false);
        for n in 1..=4 {
            put(&mut original, n, n as u64);
        }
        original.remove(&gid(2)).unwrap();
        let saved: Vec<_> = original.iter().map(|(lid, e)| (lid, *e)).collect();

        let mut restored =
            DocumentMetaStore::from_entries(AllocStrategy::default(), false, 5, saved);
        assert_eq!(restored.lid_limit(), 5);
        assert_eq!(restored.used_lids(), 3);
        assert_eq!(restored.lookup(&gid(4)).unwrap(), original.lookup(&gid(4)).unwrap());
        assert_eq!(put(&mut restored, 9, 1), 2);
    }

    #[test]
    fn test_alloc_strategy_splits_by_searchable_copies() {
        let tuning = TuningConfig {
            initial_num_docs: 3000,
            redundancy: 3,
            searchable_copies: 1,
            grow_factor: 0.5,
            grow_delta: 16,
        };
        let ready = AllocStrategy::for_sub_db(&tuning, SubDbType::Ready);
        let not_ready = AllocStrategy::for_sub_db(&tuning, SubDbType::NotReady);
        let removed = AllocStrategy::for_sub_db(&tuning, SubDbType::Removed);

        assert_eq!(ready.initial_capacity, 1000);
        assert_eq!(not_ready.initial_capacity, 2000);
        assert_eq!(removed.initial_capacity, AllocStrategy::REMOVED_INITIAL_CAPACITY);
        assert_eq!(ready.next_capacity(100), 150);
        assert_eq!(ready.next_capacity(10), 26);
    }

    #[test]
    fn test_alloc_strategy_grows_store() {
        let alloc = AllocStrategy {
            initial_capacity: 2,
            grow_factor: 1.0,
            grow_delta: 0,
        };
        let mut store = DocumentMetaStore::new(alloc, false);
        for n in 1..=5 {
            put(&mut store, n, 1);
        }
        assert!(store.capacity() >= 6);
        assert_eq!(store.used_lids(), 5);
    }
}
