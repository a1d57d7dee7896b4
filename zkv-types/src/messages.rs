//! Protocol messages exchanged over a connection.
//!
//! The wire format is JSON, tagged by `route`. Optional fields are absent
//! when not present.

use serde::{Deserialize, Serialize};

use crate::{BundleBlob, DatabaseId, EncryptedSeed, PublicKey, SyncError, WireTransaction};

/// All messages the server sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "route")]
pub enum ServerMessage {
    /// An ordered batch of transactions (and, on open, the database header
    /// and optionally a bundle preface).
    ApplyTransactions(ApplyTransactions),
    /// A new device is asking this device to share the seed.
    ReceiveRequestForSeed(ReceiveRequestForSeed),
    /// An authorized device has shared the seed with this device.
    ReceiveSeed(ReceiveSeed),
}

impl ServerMessage {
    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        serde_json::to_vec(self).map_err(SyncError::Serialization)
    }

    /// Deserialize from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        serde_json::from_slice(bytes).map_err(SyncError::Deserialization)
    }
}

/// An ordered batch of transactions for one database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyTransactions {
    /// The database this batch belongs to.
    pub db_id: DatabaseId,
    /// Database name hash; present only on the first batch of a first-time
    /// open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_name_hash: Option<String>,
    /// Encrypted database key; present only alongside `db_name_hash`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_key: Option<String>,
    /// Position of the attached bundle, when one is attached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_seq_no: Option<i64>,
    /// Compacted snapshot covering the log up to `bundle_seq_no`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle: Option<BundleBlob>,
    /// The transactions, in strictly increasing `seqNo` order.
    pub transaction_log: Vec<WireTransaction>,
    /// Advisory hint that the client should compact the log.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_bundle: Option<bool>,
}

impl ApplyTransactions {
    /// A bare batch carrying neither header nor bundle.
    pub fn bare(db_id: DatabaseId) -> Self {
        Self {
            db_id,
            db_name_hash: None,
            db_key: None,
            bundle_seq_no: None,
            bundle: None,
            transaction_log: Vec::new(),
            build_bundle: None,
        }
    }
}

/// Ask a validated device to share the seed with a requester.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiveRequestForSeed {
    /// The requesting device's ephemeral public key.
    pub requester_public_key: PublicKey,
}

/// Deliver the encrypted seed to the requesting device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiveSeed {
    /// The sharing device's public key, for the ECDH derivation.
    pub sender_public_key: PublicKey,
    /// The seed, encrypted to the requester's public key.
    pub encrypted_seed: EncryptedSeed,
}

/// All messages a client sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "route")]
pub enum ClientMessage {
    /// Open (or reopen) a database on this connection and request a push.
    OpenDatabase(OpenDatabase),
    /// Start a seed exchange: remember this socket as the requester and
    /// broadcast the request to the user's validated devices.
    RequestSeed(RequestSeed),
    /// Share the encrypted seed with a pending requester.
    SendSeed(SendSeed),
    /// The requester confirms receipt; the pending exchange is discarded.
    CloseSeedRequest(CloseSeedRequest),
}

impl ClientMessage {
    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        serde_json::to_vec(self).map_err(SyncError::Serialization)
    }

    /// Deserialize from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        serde_json::from_slice(bytes).map_err(SyncError::Deserialization)
    }
}

/// Open a database on this connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenDatabase {
    /// The database to open.
    pub database_id: DatabaseId,
    /// The client's bundle position; non-positive means none.
    #[serde(default)]
    pub bundle_seq_no: i64,
    /// Present when the client already holds the header and is resuming at
    /// this position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reopen_at_seq_no: Option<i64>,
    /// Database name hash, echoed back in the opening batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_name_hash: Option<String>,
    /// Encrypted database key, echoed back in the opening batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_key: Option<String>,
}

/// Start a seed exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSeed {
    /// This device's ephemeral public key.
    pub requester_public_key: PublicKey,
}

/// Share the encrypted seed with a pending requester.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendSeed {
    /// The sharing device's public key.
    pub sender_public_key: PublicKey,
    /// The requester this seed is encrypted to.
    pub requester_public_key: PublicKey,
    /// The seed ciphertext.
    pub encrypted_seed: EncryptedSeed,
}

/// Confirm receipt of the seed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CloseSeedRequest {}
