//! In-memory storage backend.
//!
//! Backs unit tests and embedded use; behaviorally equivalent to the
//! SQLite driver for the three store contracts.

use super::{now_millis, BundleStore, SeedExchangeStore, SeedRequestRow, TransactionLogStore};
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use zkv_types::{DatabaseId, EncryptedSeed, PublicKey, SeqNo, TransactionRecord, UserId};

/// In-memory implementation of all three store contracts.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    /// Per-database log, ordered by sequence number.
    transactions: HashMap<DatabaseId, BTreeMap<i64, TransactionRecord>>,
    bundles: HashMap<(DatabaseId, i64), Vec<u8>>,
    seed_requests: HashMap<(UserId, Vec<u8>), SeedRequestRow>,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a bundle blob.
    pub fn put_bundle(&self, database_id: &DatabaseId, bundle_seq_no: SeqNo, data: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        inner.bundles.insert((*database_id, bundle_seq_no.value()), data);
    }

    /// Number of records in a database's log.
    pub fn log_len(&self, database_id: &DatabaseId) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.transactions.get(database_id).map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl TransactionLogStore for MemoryStore {
    async fn transactions_after(
        &self,
        database_id: &DatabaseId,
        after: SeqNo,
        limit: u32,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let Some(log) = inner.transactions.get(database_id) else {
            return Ok(Vec::new());
        };

        Ok(log
            .range(after.next().value()..)
            .take(limit as usize)
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn put_if_absent(&self, record: &TransactionRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let log = inner.transactions.entry(record.database_id).or_default();

        if log.contains_key(&record.seq_no.value()) {
            return Err(StoreError::ConditionFailed {
                context: format!(
                    "transaction {} seq {}",
                    record.database_id, record.seq_no
                ),
            });
        }

        log.insert(record.seq_no.value(), record.clone());
        Ok(())
    }
}

#[async_trait]
impl BundleStore for MemoryStore {
    async fn bundle(
        &self,
        database_id: &DatabaseId,
        bundle_seq_no: SeqNo,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.bundles.get(&(*database_id, bundle_seq_no.value())).cloned())
    }
}

#[async_trait]
impl SeedExchangeStore for MemoryStore {
    async fn create_request(
        &self,
        user_id: &UserId,
        requester_public_key: &PublicKey,
        ttl_secs: u64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let key = (*user_id, requester_public_key.as_bytes().to_vec());

        if inner.seed_requests.contains_key(&key) {
            return Err(StoreError::ConditionFailed {
                context: format!("seed request for user {user_id}"),
            });
        }

        inner.seed_requests.insert(
            key,
            SeedRequestRow {
                user_id: *user_id,
                requester_public_key: requester_public_key.clone(),
                encrypted_seed: None,
                expires_at: now_millis() / 1000 + ttl_secs as i64,
            },
        );
        Ok(())
    }

    async fn get_request(
        &self,
        user_id: &UserId,
        requester_public_key: &PublicKey,
    ) -> Result<Option<SeedRequestRow>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let key = (*user_id, requester_public_key.as_bytes().to_vec());
        Ok(inner.seed_requests.get(&key).cloned())
    }

    async fn set_encrypted_seed(
        &self,
        user_id: &UserId,
        requester_public_key: &PublicKey,
        encrypted_seed: &EncryptedSeed,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let key = (*user_id, requester_public_key.as_bytes().to_vec());

        match inner.seed_requests.get_mut(&key) {
            Some(row) => {
                row.encrypted_seed = Some(encrypted_seed.clone());
                Ok(())
            }
            None => Err(StoreError::NotFound {
                context: format!("seed request for user {user_id}"),
            }),
        }
    }

    async fn delete_request(
        &self,
        user_id: &UserId,
        requester_public_key: &PublicKey,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let key = (*user_id, requester_public_key.as_bytes().to_vec());
        inner.seed_requests.remove(&key);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let now_secs = now_millis() / 1000;
        let mut inner = self.inner.lock().unwrap();
        let before = inner.seed_requests.len();
        inner.seed_requests.retain(|_, row| row.expires_at > now_secs);
        Ok((before - inner.seed_requests.len()) as u64)
    }
}
