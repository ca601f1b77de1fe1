// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory attribute columns: one lid-indexed value vector per field.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::document::{Document, Lid};

#[derive(Debug, Default)]
struct AttributeVector {
    values: Vec<Option<Value>>,
}

impl AttributeVector {
    fn set(&mut self, lid: Lid, value: Option<Value>) {
        let idx = lid as usize;
        if idx >= self.values.len() {
            if value.is_none() {
                return;
            }
            self.values.resize(idx + 1, None);
        }
        self.values[idx] = value;
    }

    fn get(&self, lid: Lid) -> Option<&Value> {
        self.values.get(lid as usize).and_then(Option::as_ref)
    }

    fn take(&mut self, lid: Lid) -> Option<Value> {
        self.values.get_mut(lid as usize).and_then(Option::take)
    }

    fn shrink(&mut self, lid_limit: Lid) {
        self.values.truncate(lid_limit as usize);
        self.values.shrink_to_fit();
    }
}

/// Attribute columns of one sub-database.
#[derive(Debug, Default)]
pub struct AttributeManager {
    columns: BTreeMap<String, AttributeVector>,
}

impl AttributeManager {
    pub fn new(fields: &BTreeSet<String>) -> Self {
        Self {
            columns: fields
                .iter()
                .map(|name| (name.clone(), AttributeVector::default()))
                .collect(),
        }
    }

    pub fn column_names(&self) -> BTreeSet<String> {
        self.columns.keys().cloned().collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Add an empty column. Returns `false` if it already exists.
    pub fn add_column(&mut self, name: &str) -> bool {
        if self.columns.contains_key(name) {
            return false;
        }
        self.columns
            .insert(name.to_string(), AttributeVector::default());
        true
    }

    pub fn drop_column(&mut self, name: &str) -> bool {
        self.columns.remove(name).is_some()
    }

    /// Write every column from `document`.
    pub fn put(&mut self, lid: Lid, document: &Document) {
        for (name, column) in &mut self.columns {
            column.set(lid, document.field(name).cloned());
        }
    }

    /// Write only `fields` from `document`.
    pub fn populate(&mut self, lid: Lid, document: &Document, fields: &[String]) {
        for name in fields {
            if let Some(column) = self.columns.get_mut(name) {
                column.set(lid, document.field(name).cloned());
            }
        }
    }

    pub fn remove(&mut self, lid: Lid) {
        for column in self.columns.values_mut() {
            column.set(lid, None);
        }
    }

    pub fn get(&self, field: &str, lid: Lid) -> Option<&Value> {
        self.columns.get(field).and_then(|c| c.get(lid))
    }

    pub fn move_lid(&mut self, from: Lid, to: Lid) {
        for column in self.columns.values_mut() {
            let value = column.take(from);
            column.set(to, value);
        }
    }

    pub fn shrink_lid_space(&mut self, lid_limit: Lid) {
        for column in self.columns.values_mut() {
            column.shrink(lid_limit);
        }
    }

    pub fn memory_usage(&self) -> usize {
        self.columns
            .values()
            .map(|c| c.values.capacity() * std::mem::size_of::<Option<Value>>())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentId;
    use serde_json::json;

    fn doc(year: i64) -> Document {
        Document::new(DocumentId::parse("id:ns:music::a").unwrap())
            .with_field("year", year)
            .with_field("title", "t")
    }

    fn fields(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_put_only_fills_configured_columns() {
        let mut attrs = AttributeManager::new(&fields(&["year"]));
        attrs.put(3, &doc(1975));
        assert_eq!(attrs.get("year", 3), Some(&json!(1975)));
        assert!(attrs.get("title", 3).is_none());
        assert!(attrs.get("year", 2).is_none());

        attrs.remove(3);
        assert!(attrs.get("year", 3).is_none());
    }

    #[test]
    fn test_add_column_then_populate() {
        let mut attrs = AttributeManager::new(&fields(&["year"]));
        attrs.put(1, &doc(1975));
        assert!(attrs.add_column("title"));
        assert!(!attrs.add_column("title"));
        assert!(attrs.get("title", 1).is_none());

        attrs.populate(1, &doc(1975), &["title".to_string()]);
        assert_eq!(attrs.get("title", 1), Some(&json!("t")));
        assert!(attrs.drop_column("title"));
        assert_eq!(attrs.column_names(), fields(&["year"]));
    }

    #[test]
    fn test_move_lid() {
        let mut attrs = AttributeManager::new(&fields(&["year"]));
        attrs.put(9, &doc(2001));
        attrs.move_lid(9, 1);
        attrs.shrink_lid_space(2);
        assert_eq!(attrs.get("year", 1), Some(&json!(2001)));
        assert!(attrs.get("year", 9).is_none());
    }
}
