// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Feed operations as they are logged and replayed.

use docdb_tlog::{Entry, EntryType, SerialNum};
use serde::{Deserialize, Serialize};

use crate::document::{BucketId, Document, DocumentId, FieldUpdate, GlobalId, Lid, Timestamp};
use crate::error::{DocDbError, Result};
use crate::subdb::SubDbType;

/// Location of a document: sub-database plus local id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DbDocumentId {
    pub sub_db: SubDbType,
    pub lid: Lid,
}

impl DbDocumentId {
    pub fn new(sub_db: SubDbType, lid: Lid) -> Self {
        Self { sub_db, lid }
    }
}

/// Fields shared by every operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationMeta {
    pub bucket: BucketId,
    pub timestamp: Timestamp,
    /// Assigned when the operation is appended to the log.
    #[serde(skip)]
    pub serial: SerialNum,
    /// Where the operation placed the document.
    #[serde(default)]
    pub db_document_id: Option<DbDocumentId>,
}

impl OperationMeta {
    pub fn new(bucket: BucketId, timestamp: Timestamp) -> Self {
        Self {
            bucket,
            timestamp,
            serial: 0,
            db_document_id: None,
        }
    }
}

/// A tombstone scheduled for removal by a prune operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrunedDocument {
    pub gid: GlobalId,
    pub timestamp: Timestamp,
}

/// A mutating operation on a document database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedOperation {
    Put {
        meta: OperationMeta,
        document: Document,
    },
    Update {
        meta: OperationMeta,
        id: DocumentId,
        updates: Vec<FieldUpdate>,
        #[serde(default)]
        create_if_non_existent: bool,
    },
    Remove {
        meta: OperationMeta,
        id: DocumentId,
    },
    /// Internal: the document changes sub-database, timestamp unchanged.
    Move {
        meta: OperationMeta,
        document: Document,
        source: SubDbType,
        target: SubDbType,
    },
    /// Internal: drop old tombstones from the removed sub-database.
    PruneRemoved {
        meta: OperationMeta,
        documents: Vec<PrunedDocument>,
    },
    NoOp {
        meta: OperationMeta,
    },
    /// A config snapshot became active. The snapshot itself lives in the
    /// config store under the same serial number.
    NewConfig {
        meta: OperationMeta,
        generation: i64,
    },
}

impl FeedOperation {
    pub fn meta(&self) -> &OperationMeta {
        match self {
            Self::Put { meta, .. }
            | Self::Update { meta, .. }
            | Self::Remove { meta, .. }
            | Self::Move { meta, .. }
            | Self::PruneRemoved { meta, .. }
            | Self::NoOp { meta }
            | Self::NewConfig { meta, .. } => meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut OperationMeta {
        match self {
            Self::Put { meta, .. }
            | Self::Update { meta, .. }
            | Self::Remove { meta, .. }
            | Self::Move { meta, .. }
            | Self::PruneRemoved { meta, .. }
            | Self::NoOp { meta }
            | Self::NewConfig { meta, .. } => meta,
        }
    }

    pub fn serial(&self) -> SerialNum {
        self.meta().serial
    }

    pub fn timestamp(&self) -> Timestamp {
        self.meta().timestamp
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Put { .. } => "put",
            Self::Update { .. } => "update",
            Self::Remove { .. } => "remove",
            Self::Move { .. } => "move",
            Self::PruneRemoved { .. } => "prune_removed",
            Self::NoOp { .. } => "noop",
            Self::NewConfig { .. } => "new_config",
        }
    }

    /// Global id of the single document this operation touches.
    pub fn gid(&self) -> Option<GlobalId> {
        match self {
            Self::Put { document, .. } | Self::Move { document, .. } => {
                Some(document.id.global_id())
            }
            Self::Update { id, .. } | Self::Remove { id, .. } => Some(id.global_id()),
            Self::PruneRemoved { .. } | Self::NoOp { .. } | Self::NewConfig { .. } => None,
        }
    }

    pub fn entry_type(&self) -> EntryType {
        match self {
            Self::NewConfig { .. } => EntryType::NewConfig,
            Self::NoOp { .. } => EntryType::NoOp,
            _ => EntryType::FeedOperation,
        }
    }

    /// Encode for the transaction log. The serial must already be assigned.
    pub fn to_entry(&self) -> Result<Entry> {
        let payload = serde_json::to_vec(self)?;
        Ok(Entry::new(self.serial(), self.entry_type(), payload))
    }

    pub fn from_entry(entry: &Entry) -> Result<Self> {
        let mut op: FeedOperation =
            serde_json::from_slice(&entry.payload).map_err(|e| DocDbError::Decode {
                serial: entry.serial,
                details: e.to_string(),
            })?;
        if op.entry_type() != entry.entry_type {
            return Err(DocDbError::Decode {
                serial: entry.serial,
                details: format!(
                    "{} operation logged with entry type {:?}",
                    op.kind(),
                    entry.entry_type
                ),
            });
        }
        op.meta_mut().serial = entry.serial;
        Ok(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(raw: &str) -> Document {
        Document::new(DocumentId::parse(raw).unwrap()).with_field("title", "x")
    }

    #[test]
    fn test_entry_carries_serial_and_type() {
        let mut op = FeedOperation::Put {
            meta: OperationMeta::new(BucketId::new(16, 1), 100),
            document: doc("id:ns:music::a"),
        };
        op.meta_mut().serial = 9;
        op.meta_mut().db_document_id = Some(DbDocumentId::new(SubDbType::Ready, 3));

        let entry = op.to_entry().unwrap();
        assert_eq!(entry.serial, 9);
        assert_eq!(entry.entry_type, EntryType::FeedOperation);

        let decoded = FeedOperation::from_entry(&entry).unwrap();
        assert_eq!(decoded, op);
        assert_eq!(decoded.kind(), "put");
    }

    #[test]
    fn test_new_config_uses_its_own_entry_type() {
        let mut op = FeedOperation::NewConfig {
            meta: OperationMeta::new(BucketId::default_bucket(), 0),
            generation: 4,
        };
        op.meta_mut().serial = 2;
        let entry = op.to_entry().unwrap();
        assert_eq!(entry.entry_type, EntryType::NewConfig);
        assert!(op.gid().is_none());
    }

    #[test]
    fn test_from_entry_rejects_mismatched_type() {
        let mut op = FeedOperation::NoOp {
            meta: OperationMeta::new(BucketId::default_bucket(), 0),
        };
        op.meta_mut().serial = 1;
        let mut entry = op.to_entry().unwrap();
        entry.entry_type = EntryType::FeedOperation;

        let err = FeedOperation::from_entry(&entry).unwrap_err();
        assert_eq!(err.error_code(), "DECODE_ERROR");
    }

    #[test]
    fn test_from_entry_rejects_garbage() {
        let entry = Entry::new(5, EntryType::FeedOperation, &b"not json"[..]);
        assert!(matches!(
            FeedOperation::from_entry(&entry),
            Err(DocDbError::Decode { serial: 5, .. })
        ));
    }

    #[test]
    fn test_update_payload_shape() {
        let op = FeedOperation::Update {
            meta: OperationMeta::new(BucketId::new(8, 0), 7),
            id: DocumentId::parse("id:ns:music::a").unwrap(),
            updates: vec![FieldUpdate::Assign {
                field: "title".into(),
                value: json!("y"),
            }],
            create_if_non_existent: true,
        };
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["kind"], "update");
        assert_eq!(value["id"], "id:ns:music::a");
        assert_eq!(value["create_if_non_existent"], true);
        assert_eq!(
            op.gid(),
            Some(DocumentId::parse("id:ns:music::a").unwrap().global_id())
        );
    }

    #[test]
    fn test_meta_logs_only_the_new_placement() {
        let mut meta = OperationMeta::new(BucketId::new(8, 0), 7);
        meta.db_document_id = Some(DbDocumentId::new(SubDbType::NotReady, 2));
        let op = FeedOperation::Remove {
            meta,
            id: DocumentId::parse("id:ns:music::a").unwrap(),
        };
        let value = serde_json::to_value(&op).unwrap();
        let mut keys: Vec<_> = value["meta"].as_object().unwrap().keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["bucket", "db_document_id", "timestamp"]);
    }
}
