//! Storage contracts for zkv-server.
//!
//! Three narrow interfaces over a key-ordered store with conditional
//! writes: the per-database transaction log, the compacted-bundle blobs,
//! and the pending seed exchanges. [`SqliteStore`] implements all three;
//! [`MemoryStore`] backs tests and embedding.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::StoreError;
use async_trait::async_trait;
use zkv_types::{DatabaseId, EncryptedSeed, PublicKey, SeqNo, TransactionRecord, UserId};

/// A pending or completed seed exchange, keyed by
/// `(user_id, requester_public_key)`.
#[derive(Debug, Clone)]
pub struct SeedRequestRow {
    /// The account the exchange belongs to.
    pub user_id: UserId,
    /// The requesting device's ephemeral public key.
    pub requester_public_key: PublicKey,
    /// The seed ciphertext, once an authorized device has responded.
    pub encrypted_seed: Option<EncryptedSeed>,
    /// Unix timestamp (seconds) after which the row may be evicted.
    pub expires_at: i64,
}

/// The append-only per-database transaction log.
#[async_trait]
pub trait TransactionLogStore: Send + Sync {
    /// Get up to `limit` records with `seq_no > after`, in ascending
    /// `seq_no` order. Callers paginate by advancing `after`.
    async fn transactions_after(
        &self,
        database_id: &DatabaseId,
        after: SeqNo,
        limit: u32,
    ) -> Result<Vec<TransactionRecord>, StoreError>;

    /// Insert a record only if nothing occupies `(database_id, seq_no)`.
    ///
    /// Fails with [`StoreError::ConditionFailed`] when the slot is taken.
    async fn put_if_absent(&self, record: &TransactionRecord) -> Result<(), StoreError>;
}

/// Compacted snapshot blobs.
#[async_trait]
pub trait BundleStore: Send + Sync {
    /// Fetch the bundle covering the log of `database_id` through
    /// `bundle_seq_no`, if one exists.
    async fn bundle(
        &self,
        database_id: &DatabaseId,
        bundle_seq_no: SeqNo,
    ) -> Result<Option<Vec<u8>>, StoreError>;
}

/// Pending seed exchanges, evicted by TTL.
#[async_trait]
pub trait SeedExchangeStore: Send + Sync {
    /// Create a pending exchange row only if none exists for this key.
    ///
    /// Fails with [`StoreError::ConditionFailed`] when one already does.
    async fn create_request(
        &self,
        user_id: &UserId,
        requester_public_key: &PublicKey,
        ttl_secs: u64,
    ) -> Result<(), StoreError>;

    /// Look up a pending exchange.
    async fn get_request(
        &self,
        user_id: &UserId,
        requester_public_key: &PublicKey,
    ) -> Result<Option<SeedRequestRow>, StoreError>;

    /// Attach the seed ciphertext to a pending exchange.
    ///
    /// Fails with [`StoreError::NotFound`] when the row is gone (evicted or
    /// already closed).
    async fn set_encrypted_seed(
        &self,
        user_id: &UserId,
        requester_public_key: &PublicKey,
        encrypted_seed: &EncryptedSeed,
    ) -> Result<(), StoreError>;

    /// Remove an exchange row. Idempotent.
    async fn delete_request(
        &self,
        user_id: &UserId,
        requester_public_key: &PublicKey,
    ) -> Result<(), StoreError>;

    /// Remove expired exchange rows.
    ///
    /// Returns the number of rows deleted.
    async fn purge_expired(&self) -> Result<u64, StoreError>;
}

/// Unix milliseconds now.
pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
