// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Documents and their identifiers.
//!
//! A [`DocumentId`] has the form `id:<namespace>:<doctype>:<options>:<user>`
//! where `<options>` is empty, `n=<number>` or `g=<group>`. The options pick
//! the location bits that decide which bucket the document lives in.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{DocDbError, Result};

/// Local document id inside one sub-database. `0` is never allocated.
pub type Lid = u32;

/// Document timestamp in microseconds. `0` means "no timestamp".
pub type Timestamp = u64;

/// Parsed, validated document id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentId {
    raw: String,
    doc_type_range: (usize, usize),
    location: u64,
}

impl DocumentId {
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |reason: &str| DocDbError::InvalidDocumentId {
            id: raw.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = raw.splitn(5, ':');
        if parts.next() != Some("id") {
            return Err(invalid("must start with 'id:'"));
        }
        let namespace = parts.next().ok_or_else(|| invalid("missing namespace"))?;
        let doc_type = parts.next().ok_or_else(|| invalid("missing document type"))?;
        let options = parts.next().ok_or_else(|| invalid("missing option field"))?;
        let user = parts.next().ok_or_else(|| invalid("missing user specific part"))?;

        if namespace.is_empty() {
            return Err(invalid("empty namespace"));
        }
        if doc_type.is_empty() {
            return Err(invalid("empty document type"));
        }
        if user.is_empty() {
            return Err(invalid("empty user specific part"));
        }

        let location = if options.is_empty() {
            hash_location(raw)
        } else if let Some(n) = options.strip_prefix("n=") {
            n.parse::<u64>()
                .map_err(|_| invalid("n= option must be a number"))?
        } else if let Some(group) = options.strip_prefix("g=") {
            if group.is_empty() {
                return Err(invalid("empty g= option"));
            }
            hash_location(group)
        } else {
            return Err(invalid("unknown option"));
        };

        let type_start = 3 + namespace.len() + 1;
        Ok(Self {
            raw: raw.to_string(),
            doc_type_range: (type_start, type_start + doc_type.len()),
            location,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn doc_type(&self) -> &str {
        &self.raw[self.doc_type_range.0..self.doc_type_range.1]
    }

    /// Location bits used for bucket placement.
    pub fn location(&self) -> u64 {
        self.location
    }

    pub fn global_id(&self) -> GlobalId {
        GlobalId::from_document_id(self)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for DocumentId {
    type Error = DocDbError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<DocumentId> for String {
    fn from(id: DocumentId) -> Self {
        id.raw
    }
}

fn hash_location(input: &str) -> u64 {
    let digest = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// Fixed-size global document id, identical on every node.
///
/// The first four bytes carry the low location bits so the bucket can be
/// derived from the gid alone; the remaining eight come from a SHA-256 of
/// the full id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GlobalId([u8; 12]);

impl GlobalId {
    pub const LENGTH: usize = 12;

    pub fn from_document_id(id: &DocumentId) -> Self {
        let digest = Sha256::digest(id.as_str().as_bytes());
        let mut bytes = [0u8; Self::LENGTH];
        bytes[..4].copy_from_slice(&(id.location() as u32).to_le_bytes());
        bytes[4..].copy_from_slice(&digest[..8]);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }

    /// Location bits stored in the gid.
    pub fn location(&self) -> u32 {
        let mut loc = [0u8; 4];
        loc.copy_from_slice(&self.0[..4]);
        u32::from_le_bytes(loc)
    }
}

impl fmt::Debug for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobalId({})", self)
    }
}

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Bucket identifier: used-bit count in the top 6 bits, location bits below.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BucketId(u64);

impl BucketId {
    pub const MAX_USED_BITS: u8 = 58;
    const COUNT_SHIFT: u32 = 58;

    pub fn new(used_bits: u8, location: u64) -> Self {
        let bits = used_bits.min(Self::MAX_USED_BITS);
        let mask = if bits == 0 { 0 } else { u64::MAX >> (64 - bits as u32) };
        Self(((bits as u64) << Self::COUNT_SHIFT) | (location & mask))
    }

    /// Bucket with no used bits; covers every document.
    pub fn default_bucket() -> Self {
        Self::new(0, 0)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Bucket holding `gid` at the given split level.
    pub fn for_gid(gid: &GlobalId, used_bits: u8) -> Self {
        Self::new(used_bits.min(32), gid.location() as u64)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn used_bits(&self) -> u8 {
        (self.0 >> Self::COUNT_SHIFT) as u8
    }

    pub fn location_bits(&self) -> u64 {
        self.0 & ((1u64 << Self::COUNT_SHIFT) - 1)
    }

    /// True if `gid` falls inside this bucket.
    pub fn contains(&self, gid: &GlobalId) -> bool {
        Self::for_gid(gid, self.used_bits()) == *self
    }
}

impl fmt::Debug for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BucketId(0x{:016x})", self.0)
    }
}

/// A document: id plus named JSON field values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
}

impl Document {
    pub fn new(id: DocumentId) -> Self {
        Self {
            id,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Rough in-memory footprint, used for the meta store and resource stats.
    pub fn approximate_size(&self) -> u32 {
        let fields: usize = self
            .fields
            .iter()
            .map(|(k, v)| k.len() + v.to_string().len())
            .sum();
        (self.id.as_str().len() + fields).min(u32::MAX as usize) as u32
    }
}

/// One field-level change carried by an update operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FieldUpdate {
    Assign { field: String, value: Value },
    Clear { field: String },
    Increment { field: String, by: f64 },
}

impl FieldUpdate {
    pub fn field(&self) -> &str {
        match self {
            Self::Assign { field, .. } | Self::Clear { field } | Self::Increment { field, .. } => {
                field
            }
        }
    }

    pub fn apply_to(&self, doc: &mut Document) {
        match self {
            Self::Assign { field, value } => {
                doc.fields.insert(field.clone(), value.clone());
            }
            Self::Clear { field } => {
                doc.fields.remove(field);
            }
            Self::Increment { field, by } => {
                let next = increment(doc.fields.get(field), *by);
                doc.fields.insert(field.clone(), next);
            }
        }
    }
}

fn increment(current: Option<&Value>, by: f64) -> Value {
    if let Some(i) = current.and_then(Value::as_i64)
        && by.fract() == 0.0
    {
        return Value::from(i.saturating_add(by as i64));
    }
    let base = current.and_then(Value::as_f64).unwrap_or(0.0);
    let sum = base + by;
    if current.is_none() && by.fract() == 0.0 {
        return Value::from(sum as i64);
    }
    serde_json::Number::from_f64(sum)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(raw: &str) -> DocumentId {
        DocumentId::parse(raw).unwrap()
    }

    #[test]
    fn test_parse_document_id() {
        let doc_id = id("id:ns:music::song-1");
        assert_eq!(doc_id.doc_type(), "music");
        assert_eq!(doc_id.as_str(), "id:ns:music::song-1");
        assert_eq!(doc_id.to_string(), "id:ns:music::song-1");
    }

    #[test]
    fn test_parse_document_id_with_number_option() {
        let doc_id = id("id:ns:music:n=1234:song-1");
        assert_eq!(doc_id.location(), 1234);
        assert_eq!(doc_id.global_id().location(), 1234);
    }

    #[test]
    fn test_group_option_shares_location() {
        let a = id("id:ns:music:g=queen:a");
        let b = id("id:ns:music:g=queen:b");
        assert_eq!(a.location(), b.location());
        assert_ne!(a.global_id(), b.global_id());
    }

    #[test]
    fn test_parse_rejects_malformed_ids() {
        for raw in [
            "doc:ns:music::x",
            "id:ns:music",
            "id::music::x",
            "id:ns:::x",
            "id:ns:music::",
            "id:ns:music:n=abc:x",
            "id:ns:music:x=1:y",
        ] {
            let err = DocumentId::parse(raw).unwrap_err();
            assert_eq!(err.error_code(), "INVALID_DOCUMENT_ID", "{}", raw);
        }
    }

    #[test]
    fn test_document_id_serde_is_plain_string() {
        let doc_id = id("id:ns:music::song-1");
        let json = serde_json::to_string(&doc_id).unwrap();
        assert_eq!(json, "\"id:ns:music::song-1\"");
        let back: DocumentId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, doc_id);
        assert!(serde_json::from_str::<DocumentId>("\"bogus\"").is_err());
    }

    #[test]
    fn test_global_id_is_stable() {
        let a = id("id:ns:music::song-1").global_id();
        let b = id("id:ns:music::song-1").global_id();
        let c = id("id:ns:music::song-2").global_id();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string().len(), 24);
    }

    #[test]
    fn test_bucket_id_bits() {
        let bucket = BucketId::new(16, 0xabcd_1234);
        assert_eq!(bucket.used_bits(), 16);
        assert_eq!(bucket.location_bits(), 0x1234);

        let gid = id("id:ns:music:n=4660:x").global_id();
        let for_gid = BucketId::for_gid(&gid, 16);
        assert_eq!(for_gid, BucketId::new(16, 4660));
        assert!(for_gid.contains(&gid));
        assert!(!BucketId::new(16, 4661).contains(&gid));
    }

    #[test]
    fn test_field_updates() {
        let mut doc = Document::new(id("id:ns:music::song-1"))
            .with_field("title", "Bohemian")
            .with_field("plays", 10);

        FieldUpdate::Assign {
            field: "title".into(),
            value: json!("Bohemian Rhapsody"),
        }
        .apply_to(&mut doc);
        FieldUpdate::Increment {
            field: "plays".into(),
            by: 5.0,
        }
        .apply_to(&mut doc);
        FieldUpdate::Increment {
            field: "rating".into(),
            by: 1.5,
        }
        .apply_to(&mut doc);
        FieldUpdate::Increment {
            field: "likes".into(),
            by: 2.0,
        }
        .apply_to(&mut doc);

        assert_eq!(doc.field("title"), Some(&json!("Bohemian Rhapsody")));
        assert_eq!(doc.field("plays"), Some(&json!(15)));
        assert_eq!(doc.field("rating"), Some(&json!(1.5)));
        assert_eq!(doc.field("likes"), Some(&json!(2)));

        FieldUpdate::Clear {
            field: "title".into(),
        }
        .apply_to(&mut doc);
        assert!(doc.field("title").is_none());
    }

    #[test]
    fn test_field_update_serde_shape() {
        let update = FieldUpdate::Increment {
            field: "plays".into(),
            by: 1.0,
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json, json!({"op": "increment", "field": "plays", "by": 1.0}));
    }
}
