// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Document store returning full documents by lid.

use std::collections::BTreeMap;

use crate::document::{Document, Lid};

#[derive(Debug, Default)]
pub struct SummaryStore {
    documents: BTreeMap<Lid, Document>,
    bytes: usize,
}

impl SummaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, lid: Lid, document: Document) {
        let size = document.approximate_size() as usize;
        if let Some(old) = self.documents.insert(lid, document) {
            self.bytes -= old.approximate_size() as usize;
        }
        self.bytes += size;
    }

    pub fn remove(&mut self, lid: Lid) -> Option<Document> {
        let removed = self.documents.remove(&lid)?;
        self.bytes -= removed.approximate_size() as usize;
        Some(removed)
    }

    pub fn get(&self, lid: Lid) -> Option<&Document> {
        self.documents.get(&lid)
    }

    pub fn move_lid(&mut self, from: Lid, to: Lid) {
        if let Some(doc) = self.documents.remove(&from) {
            self.documents.insert(to, doc);
        }
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Lid, &Document)> {
        self.documents.iter().map(|(lid, doc)| (*lid, doc))
    }

    pub fn memory_usage(&self) -> usize {
        self.bytes
    }
}
