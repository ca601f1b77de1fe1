// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Document database configuration snapshots.
//!
//! A [`ConfigSnapshot`] is an immutable, generation-stamped view of the
//! [`DocumentDbConfig`] for one document type. Snapshots are shared as
//! `Arc<ConfigSnapshot>`; a reconfiguration replaces the active pointer, it
//! never mutates a snapshot in place.
//!
//! [`ReconfigParams`] describes which aspects differ between two snapshots so
//! the document database only touches the subsystems a change implies.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::time::Duration;

use docdb_tlog::SerialNum;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One schema field and its aspects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldConfig {
    pub name: String,
    /// Searchable through the ready sub-database index.
    #[serde(default)]
    pub indexed: bool,
    /// Kept in an in-memory attribute column.
    #[serde(default)]
    pub attribute: bool,
}

impl FieldConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            indexed: false,
            attribute: false,
        }
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn attribute(mut self) -> Self {
        self.attribute = true;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default)]
    pub fields: Vec<FieldConfig>,
}

impl Schema {
    pub fn new(fields: Vec<FieldConfig>) -> Self {
        Self { fields }
    }

    pub fn field(&self, name: &str) -> Option<&FieldConfig> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn indexed_fields(&self) -> BTreeSet<String> {
        self.fields
            .iter()
            .filter(|f| f.indexed)
            .map(|f| f.name.clone())
            .collect()
    }

    pub fn attribute_fields(&self) -> BTreeSet<String> {
        self.fields
            .iter()
            .filter(|f| f.attribute)
            .map(|f| f.name.clone())
            .collect()
    }
}

/// Which documents belong in the ready (searchable) sub-database.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyMode {
    /// Documents in ready buckets are indexed and searchable.
    #[default]
    Index,
    /// Nothing is indexed; every document lives in the not-ready sub-database.
    StoreOnly,
}

/// Thresholds for the resource write filter, as fractions of capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub memory_limit: f64,
    pub disk_limit: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_limit: 0.8,
            disk_limit: 0.75,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LidSpaceCompactionConfig {
    pub interval_ms: u64,
    /// Compaction starts once this many lids are unused.
    pub allowed_lid_bloat: u32,
    /// ... and the unused share of the lid space exceeds this factor.
    pub allowed_lid_bloat_factor: f64,
    /// Documents moved per job run.
    pub max_docs_to_move: u32,
}

impl Default for LidSpaceCompactionConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10 * 60 * 1000,
            allowed_lid_bloat: 1000,
            allowed_lid_bloat_factor: 0.01,
            max_docs_to_move: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PruneRemovedConfig {
    pub interval_ms: u64,
    /// Tombstones older than this are pruned.
    pub age_ms: u64,
    pub batch_size: u32,
}

impl Default for PruneRemovedConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60 * 60 * 1000,
            age_ms: 14 * 24 * 60 * 60 * 1000,
            batch_size: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketMoveConfig {
    pub interval_ms: u64,
    pub max_docs_per_run: u32,
}

impl Default for BucketMoveConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            max_docs_per_run: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub heartbeat_interval_ms: u64,
    pub lid_space_compaction: LidSpaceCompactionConfig,
    pub prune_removed: PruneRemovedConfig,
    pub bucket_move: BucketMoveConfig,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 60 * 1000,
            lid_space_compaction: LidSpaceCompactionConfig::default(),
            prune_removed: PruneRemovedConfig::default(),
            bucket_move: BucketMoveConfig::default(),
        }
    }
}

impl MaintenanceConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Sizing hints for the sub-database stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    pub initial_num_docs: u32,
    pub redundancy: u32,
    pub searchable_copies: u32,
    pub grow_factor: f64,
    pub grow_delta: u32,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            initial_num_docs: 1024,
            redundancy: 1,
            searchable_copies: 1,
            grow_factor: 0.2,
            grow_delta: 0,
        }
    }
}

/// Configuration of one document database.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentDbConfig {
    pub schema: Schema,
    pub ready_mode: ReadyMode,
    /// How long index changes may stay invisible to searches.
    pub visibility_delay_ms: u64,
    pub resource_limits: ResourceLimits,
    pub maintenance: MaintenanceConfig,
    pub tuning: TuningConfig,
}

impl DocumentDbConfig {
    pub fn visibility_delay(&self) -> Duration {
        Duration::from_millis(self.visibility_delay_ms)
    }
}

/// Immutable configuration of a document database at one generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub generation: i64,
    pub doc_type: String,
    /// Serial number at which this snapshot was durably recorded; `0` if it
    /// has not been recorded yet.
    #[serde(default)]
    pub serial: SerialNum,
    pub config: DocumentDbConfig,
}

impl ConfigSnapshot {
    pub fn new(doc_type: impl Into<String>, generation: i64, config: DocumentDbConfig) -> Self {
        Self {
            generation,
            doc_type: doc_type.into(),
            serial: 0,
            config,
        }
    }

    pub fn with_serial(mut self, serial: SerialNum) -> Self {
        self.serial = serial;
        self
    }

    pub fn with_config(&self, config: DocumentDbConfig) -> Self {
        Self {
            generation: self.generation,
            doc_type: self.doc_type.clone(),
            serial: self.serial,
            config,
        }
    }
}

/// Pick the config for `doc_type`, falling back to `default` when the type
/// has no entry of its own.
pub fn resolve_document_db_config(
    per_type: &HashMap<String, DocumentDbConfig>,
    doc_type: &str,
    default: &DocumentDbConfig,
) -> DocumentDbConfig {
    per_type
        .get(doc_type)
        .cloned()
        .unwrap_or_else(|| default.clone())
}

/// On-disk config file consumed by the `docdb` binary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub generation: i64,
    pub default: DocumentDbConfig,
    pub document_types: HashMap<String, DocumentDbConfig>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn snapshot_for(&self, doc_type: &str) -> ConfigSnapshot {
        ConfigSnapshot::new(
            doc_type,
            self.generation,
            resolve_document_db_config(&self.document_types, doc_type, &self.default),
        )
    }
}

/// Aspects that differ between two config snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconfigParams {
    pub ready_mode_changed: bool,
    pub index_changed: bool,
    pub attributes_changed: bool,
    pub visibility_delay_changed: bool,
    pub resource_limits_changed: bool,
    pub maintenance_changed: bool,
    pub tuning_changed: bool,
}

impl ReconfigParams {
    pub fn compute(old: &DocumentDbConfig, new: &DocumentDbConfig) -> Self {
        Self {
            ready_mode_changed: old.ready_mode != new.ready_mode,
            index_changed: old.schema.indexed_fields() != new.schema.indexed_fields(),
            attributes_changed: old.schema.attribute_fields() != new.schema.attribute_fields(),
            visibility_delay_changed: old.visibility_delay_ms != new.visibility_delay_ms,
            resource_limits_changed: old.resource_limits != new.resource_limits,
            maintenance_changed: old.maintenance != new.maintenance,
            tuning_changed: old.tuning != new.tuning,
        }
    }

    pub fn config_has_changed(&self) -> bool {
        *self != Self::default()
    }

    /// Documents may have to change sub-database.
    pub fn should_subdbs_change(&self) -> bool {
        self.ready_mode_changed
    }

    pub fn should_schema_change(&self) -> bool {
        self.index_changed || self.attributes_changed
    }

    pub fn should_maintenance_controller_change(&self) -> bool {
        self.maintenance_changed || self.ready_mode_changed
    }
}

/// Result of holding back attribute aspect changes on existing fields.
#[derive(Debug, Clone, PartialEq)]
pub struct DelayedAttributeAspects {
    /// Config that can be applied live.
    pub effective: DocumentDbConfig,
    /// Fields whose attribute aspect change waits for a restart.
    pub delayed_fields: Vec<String>,
}

impl DelayedAttributeAspects {
    pub fn needs_restart(&self) -> bool {
        !self.delayed_fields.is_empty()
    }
}

/// Keep the old attribute aspect of every field present in both configs.
///
/// Adding or dropping the attribute aspect of an existing field requires
/// rewriting the attribute from stored documents, which only happens at
/// startup. New fields are not delayed.
pub fn delay_attribute_aspects(
    old: &DocumentDbConfig,
    new: &DocumentDbConfig,
) -> DelayedAttributeAspects {
    let mut effective = new.clone();
    let mut delayed_fields = Vec::new();

    for field in &mut effective.schema.fields {
        if let Some(previous) = old.schema.field(&field.name)
            && previous.attribute != field.attribute
        {
            field.attribute = previous.attribute;
            delayed_fields.push(field.name.clone());
        }
    }

    DelayedAttributeAspects {
        effective,
        delayed_fields,
    }
}
