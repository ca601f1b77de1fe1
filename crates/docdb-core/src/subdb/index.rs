// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Inverted term index of the ready sub-database.
//!
//! Writes are queued as pending changes and only become visible to
//! [`search`](IndexManager::search) on [`commit`](IndexManager::commit).
//! The visibility handler decides when commits happen.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::document::{Document, Lid};

#[derive(Debug, Clone)]
enum IndexChange {
    Put { lid: Lid, terms: Vec<(String, String)> },
    Remove { lid: Lid },
}

#[derive(Debug, Default)]
pub struct IndexManager {
    fields: BTreeSet<String>,
    /// field -> term -> lids
    postings: BTreeMap<String, BTreeMap<String, BTreeSet<Lid>>>,
    lid_terms: BTreeMap<Lid, Vec<(String, String)>>,
    pending: Vec<IndexChange>,
    commits: u64,
}

/// Split a field value into lowercase terms.
pub fn tokenize(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => s
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
            .collect(),
        Value::Array(items) => items.iter().flat_map(tokenize).collect(),
        Value::Null | Value::Object(_) => Vec::new(),
        other => vec![other.to_string()],
    }
}

impl IndexManager {
    pub fn new(fields: BTreeSet<String>) -> Self {
        Self {
            fields,
            ..Default::default()
        }
    }

    pub fn fields(&self) -> &BTreeSet<String> {
        &self.fields
    }

    fn terms_for(&self, document: &Document) -> Vec<(String, String)> {
        let mut terms = Vec::new();
        for field in &self.fields {
            if let Some(value) = document.field(field) {
                for term in tokenize(value) {
                    terms.push((field.clone(), term));
                }
            }
        }
        terms.sort();
        terms.dedup();
        terms
    }

    pub fn put(&mut self, lid: Lid, document: &Document) {
        let terms = self.terms_for(document);
        self.pending.push(IndexChange::Put { lid, terms });
    }

    pub fn remove(&mut self, lid: Lid) {
        self.pending.push(IndexChange::Remove { lid });
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Apply pending changes. Returns the number applied.
    pub fn commit(&mut self) -> usize {
        let changes = std::mem::take(&mut self.pending);
        let count = changes.len();
        for change in changes {
            match change {
                IndexChange::Put { lid, terms } => {
                    self.unindex(lid);
                    self.index(lid, terms);
                }
                IndexChange::Remove { lid } => self.unindex(lid),
            }
        }
        if count > 0 {
            self.commits += 1;
        }
        count
    }

    /// Number of commits that applied at least one change.
    pub fn commit_count(&self) -> u64 {
        self.commits
    }

    fn index(&mut self, lid: Lid, terms: Vec<(String, String)>) {
        for (field, term) in &terms {
            self.postings
                .entry(field.clone())
                .or_default()
                .entry(term.clone())
                .or_default()
                .insert(lid);
        }
        if !terms.is_empty() {
            self.lid_terms.insert(lid, terms);
        }
    }

    fn unindex(&mut self, lid: Lid) {
        let Some(terms) = self.lid_terms.remove(&lid) else {
            return;
        };
        for (field, term) in terms {
            if let Some(by_term) = self.postings.get_mut(&field) {
                if let Some(lids) = by_term.get_mut(&term) {
                    lids.remove(&lid);
                    if lids.is_empty() {
                        by_term.remove(&term);
                    }
                }
                if by_term.is_empty() {
                    self.postings.remove(&field);
                }
            }
        }
    }

    /// Committed lids matching `term` in `field`.
    pub fn search(&self, field: &str, term: &str) -> Vec<Lid> {
        let term = term.to_lowercase();
        self.postings
            .get(field)
            .and_then(|by_term| by_term.get(&term))
            .map(|lids| lids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Move committed postings from `from` to `to`. Pending changes must
    /// have been committed first.
    pub fn move_lid(&mut self, from: Lid, to: Lid) {
        if let Some(terms) = self.lid_terms.get(&from).cloned() {
            self.unindex(from);
            self.index(to, terms);
        }
    }

    /// Replace the indexed field set and rebuild from `documents`.
    ///
    /// The new postings are built aside and swapped in, so a caller holding
    /// the write lock only for the swap keeps searches running.
    pub fn rebuilt<'a>(
        fields: BTreeSet<String>,
        documents: impl IntoIterator<Item = (Lid, &'a Document)>,
    ) -> Self {
        let mut index = Self::new(fields);
        for (lid, document) in documents {
            let terms = index.terms_for(document);
            index.index(lid, terms);
        }
        index
    }

    pub fn replace_with(&mut self, other: IndexManager) {
        let commits = self.commits + 1;
        *self = other;
        self.commits = commits;
    }

    pub fn indexed_lids(&self) -> usize {
        self.lid_terms.len()
    }

    pub fn memory_usage(&self) -> usize {
        self.lid_terms
            .values()
            .flat_map(|terms| terms.iter())
            .map(|(f, t)| (f.len() + t.len()) * 2 + std::mem::size_of::<Lid>())
            .sum()
    }
}
