//! Transaction-log records and their client-facing projection.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::{DatabaseId, SeqNo, SyncError};

/// The operation a transaction applies to its database.
///
/// Records are polymorphic over the capability set {key, record,
/// operations}: each variant carries exactly the fields its command uses,
/// and the wire projection leaves the rest absent.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Insert a new item under `key`.
    Insert {
        /// Encrypted item key.
        key: String,
        /// Encrypted item payload (opaque to the server).
        record: Value,
    },
    /// Replace the item under `key`.
    Update {
        /// Encrypted item key.
        key: String,
        /// Encrypted item payload (opaque to the server).
        record: Value,
    },
    /// Remove the item under `key`.
    Delete {
        /// Encrypted item key.
        key: String,
    },
    /// Apply several operations atomically.
    BatchTransaction {
        /// The steps, applied in order.
        operations: Vec<Operation>,
    },
    /// Marker written by a client after compacting the log prefix into a
    /// bundle.
    Bundle,
    /// Sentinel filling a sequence number whose commit never landed.
    Rollback,
}

impl Command {
    /// The command discriminator as stored and sent on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Insert { .. } => "Insert",
            Command::Update { .. } => "Update",
            Command::Delete { .. } => "Delete",
            Command::BatchTransaction { .. } => "BatchTransaction",
            Command::Bundle => "Bundle",
            Command::Rollback => "Rollback",
        }
    }

    /// The item key, for commands that carry one.
    pub fn key(&self) -> Option<&str> {
        match self {
            Command::Insert { key, .. } | Command::Update { key, .. } | Command::Delete { key } => {
                Some(key)
            }
            _ => None,
        }
    }

    /// The item payload, for commands that carry one.
    pub fn record(&self) -> Option<&Value> {
        match self {
            Command::Insert { record, .. } | Command::Update { record, .. } => Some(record),
            _ => None,
        }
    }

    /// The batched steps, for `BatchTransaction`.
    pub fn operations(&self) -> Option<&[Operation]> {
        match self {
            Command::BatchTransaction { operations } => Some(operations),
            _ => None,
        }
    }

    /// Reassemble a Command from its stored columns.
    pub fn from_parts(
        name: &str,
        key: Option<String>,
        record: Option<Value>,
        operations: Option<Vec<Operation>>,
    ) -> Result<Self, SyncError> {
        let missing = |field: &str| {
            SyncError::InvalidData(format!("{name} command is missing its {field} field"))
        };
        match name {
            "Insert" => Ok(Command::Insert {
                key: key.ok_or_else(|| missing("key"))?,
                record: record.ok_or_else(|| missing("record"))?,
            }),
            "Update" => Ok(Command::Update {
                key: key.ok_or_else(|| missing("key"))?,
                record: record.ok_or_else(|| missing("record"))?,
            }),
            "Delete" => Ok(Command::Delete {
                key: key.ok_or_else(|| missing("key"))?,
            }),
            "BatchTransaction" => Ok(Command::BatchTransaction {
                operations: operations.ok_or_else(|| missing("operations"))?,
            }),
            "Bundle" => Ok(Command::Bundle),
            "Rollback" => Ok(Command::Rollback),
            other => Err(SyncError::InvalidData(format!("unknown command: {other}"))),
        }
    }
}

/// One step of a batched transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// The step kind.
    pub command: OperationKind,
    /// Encrypted item key.
    pub key: String,
    /// Encrypted item payload; absent for deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<Value>,
}

/// The kinds of step a batched transaction may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    /// Insert a new item.
    Insert,
    /// Replace an existing item.
    Update,
    /// Remove an item.
    Delete,
}

/// A stored transaction-log record, primary-keyed by `(database_id, seq_no)`.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    /// The database this record belongs to.
    pub database_id: DatabaseId,
    /// Position in the per-database log.
    pub seq_no: SeqNo,
    /// What the record does.
    pub command: Command,
    /// Unix milliseconds at which the writer created the record.
    pub creation_date: i64,
}

impl TransactionRecord {
    /// Project this record to its client-facing wire shape.
    pub fn to_wire(&self) -> WireTransaction {
        WireTransaction {
            seq_no: self.seq_no.value(),
            command: self.command.name().to_string(),
            key: self.command.key().map(str::to_string),
            record: self.command.record().cloned(),
            operations: self.command.operations().map(<[Operation]>::to_vec),
            db_id: self.database_id,
        }
    }
}

/// The client-facing projection of a stored record.
///
/// Optional fields are absent from the JSON when the command does not
/// carry them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTransaction {
    /// Position in the per-database log.
    pub seq_no: i64,
    /// Command discriminator.
    pub command: String,
    /// Encrypted item key, when the command carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Encrypted item payload, when the command carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<Value>,
    /// Batched steps, for `BatchTransaction`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operations: Option<Vec<Operation>>,
    /// The database this record belongs to.
    pub db_id: DatabaseId,
}

/// An opaque compacted-snapshot blob.
///
/// Produced and consumed by clients; the server stores and forwards it.
/// Travels on the wire as URL-safe base64.
#[derive(Clone, PartialEq, Eq)]
pub struct BundleBlob(Vec<u8>);

impl BundleBlob {
    /// Create a BundleBlob from raw ciphertext bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Get the raw ciphertext bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Blob length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the blob is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for BundleBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BundleBlob").field("len", &self.0.len()).finish()
    }
}

impl Serialize for BundleBlob {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&URL_SAFE_NO_PAD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for BundleBlob {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        URL_SAFE_NO_PAD
            .decode(encoded.as_bytes())
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}

/// Approximate the stored byte cost of a record.
///
/// Close enough to the storage driver's accounting for the bundling
/// heuristic; exactness is not required.
pub fn estimated_size(record: &TransactionRecord) -> u64 {
    // Fixed per-item overhead: primary key, command discriminator,
    // creation date, attribute names.
    const ITEM_OVERHEAD: u64 = 100;

    let mut size = ITEM_OVERHEAD + record.command.name().len() as u64;
    if let Some(key) = record.command.key() {
        size += key.len() as u64;
    }
    if let Some(value) = record.command.record() {
        size += json_size(value);
    }
    if let Some(operations) = record.command.operations() {
        for op in operations {
            size += 24 + op.key.len() as u64;
            if let Some(value) = &op.record {
                size += json_size(value);
            }
        }
    }
    size
}

fn json_size(value: &Value) -> u64 {
    serde_json::to_string(value).map(|s| s.len() as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn insert_record(seq_no: i64) -> TransactionRecord {
        TransactionRecord {
            database_id: DatabaseId::new(),
            seq_no: SeqNo::new(seq_no),
            command: Command::Insert {
                key: "k1".into(),
                record: json!({"ciphertext": "abc"}),
            },
            creation_date: 1_705_000_000_000,
        }
    }

    #[test]
    fn wire_projection_keeps_only_present_fields() {
        let tx = insert_record(3);
        let wire = tx.to_wire();
        let json = serde_json::to_value(&wire).unwrap();

        assert_eq!(json["seqNo"], 3);
        assert_eq!(json["command"], "Insert");
        assert_eq!(json["key"], "k1");
        assert!(json.get("operations").is_none());
    }

    #[test]
    fn rollback_projection_is_bare() {
        let tx = TransactionRecord {
            database_id: DatabaseId::new(),
            seq_no: SeqNo::new(6),
            command: Command::Rollback,
            creation_date: 0,
        };
        let json = serde_json::to_value(tx.to_wire()).unwrap();

        assert_eq!(json["command"], "Rollback");
        assert!(json.get("key").is_none());
        assert!(json.get("record").is_none());
        assert!(json.get("operations").is_none());
    }

    #[test]
    fn command_from_parts_rebuilds_batch() {
        let operations = vec![
            Operation {
                command: OperationKind::Insert,
                key: "a".into(),
                record: Some(json!("x")),
            },
            Operation {
                command: OperationKind::Delete,
                key: "b".into(),
                record: None,
            },
        ];
        let command =
            Command::from_parts("BatchTransaction", None, None, Some(operations.clone())).unwrap();
        assert_eq!(command.operations(), Some(operations.as_slice()));
    }

    #[test]
    fn command_from_parts_rejects_missing_fields() {
        assert!(Command::from_parts("Insert", Some("k".into()), None, None).is_err());
        assert!(Command::from_parts("Delete", None, None, None).is_err());
        assert!(Command::from_parts("Nonsense", None, None, None).is_err());
    }

    #[test]
    fn estimated_size_grows_with_payload() {
        let small = insert_record(1);
        let large = TransactionRecord {
            command: Command::Insert {
                key: "k1".into(),
                record: json!({"ciphertext": "x".repeat(4096)}),
            },
            ..small.clone()
        };
        assert!(estimated_size(&large) > estimated_size(&small) + 4000);
    }

    #[test]
    fn bundle_blob_json_is_base64() {
        let blob = BundleBlob::from_bytes(vec![9, 8, 7]);
        let json = serde_json::to_string(&blob).unwrap();
        let restored: BundleBlob = serde_json::from_str(&json).unwrap();
        assert_eq!(blob, restored);
    }
}
