//! SQLite storage backend for zkv-server.

use super::{
    now_millis, BundleStore, SeedExchangeStore, SeedRequestRow, TransactionLogStore,
};
use crate::error::StoreError;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use zkv_types::{
    Command, DatabaseId, EncryptedSeed, Operation, PublicKey, SeqNo, TransactionRecord, UserId,
};

/// SQLite-backed implementation of all three store contracts.
///
/// Uses WAL mode for concurrent reads/writes. Conditional puts map to
/// `INSERT ... ON CONFLICT DO NOTHING` with the zero-rows case surfaced as
/// [`StoreError::ConditionFailed`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new SQLite store from a database path.
    ///
    /// Creates the database file if it doesn't exist.
    pub async fn new(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(path.to_str().unwrap_or("zkv.db"))
            .map_err(StoreError::Database)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .map_err(StoreError::Database)?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory SQLite store (for testing).
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(":memory:")
            .map_err(StoreError::Database)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(StoreError::Database)?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transactions (
                database_id BLOB NOT NULL,
                seq_no INTEGER NOT NULL,
                command TEXT NOT NULL,
                item_key TEXT,
                record TEXT,
                operations TEXT,
                creation_date INTEGER NOT NULL,
                PRIMARY KEY (database_id, seq_no)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bundles (
                database_id BLOB NOT NULL,
                bundle_seq_no INTEGER NOT NULL,
                data BLOB NOT NULL,
                PRIMARY KEY (database_id, bundle_seq_no)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS seed_requests (
                user_id BLOB NOT NULL,
                requester_public_key BLOB NOT NULL,
                encrypted_seed BLOB,
                expires_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, requester_public_key)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_seed_requests_expires ON seed_requests(expires_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        Ok(())
    }

    /// Store a bundle blob (written by clients through the upload path).
    pub async fn put_bundle(
        &self,
        database_id: &DatabaseId,
        bundle_seq_no: SeqNo,
        data: &[u8],
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO bundles (database_id, bundle_seq_no, data)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(database_id, bundle_seq_no) DO UPDATE SET data = ?3
            "#,
        )
        .bind(database_id.as_bytes())
        .bind(bundle_seq_no.value())
        .bind(data)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        Ok(())
    }
}

#[async_trait]
impl TransactionLogStore for SqliteStore {
    async fn transactions_after(
        &self,
        database_id: &DatabaseId,
        after: SeqNo,
        limit: u32,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        let rows = sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT database_id, seq_no, command, item_key, record, operations, creation_date
            FROM transactions
            WHERE database_id = ?1 AND seq_no > ?2
            ORDER BY seq_no ASC
            LIMIT ?3
            "#,
        )
        .bind(database_id.as_bytes())
        .bind(after.value())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        rows.into_iter().map(|row| row.try_into()).collect()
    }

    async fn put_if_absent(&self, record: &TransactionRecord) -> Result<(), StoreError> {
        let operations = record
            .command
            .operations()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::InvalidRow {
                reason: format!("operations encode: {e}"),
            })?;
        let value = record
            .command
            .record()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::InvalidRow {
                reason: format!("record encode: {e}"),
            })?;

        let result = sqlx::query(
            r#"
            INSERT INTO transactions
                (database_id, seq_no, command, item_key, record, operations, creation_date)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(database_id, seq_no) DO NOTHING
            "#,
        )
        .bind(record.database_id.as_bytes())
        .bind(record.seq_no.value())
        .bind(record.command.name())
        .bind(record.command.key())
        .bind(value)
        .bind(operations)
        .bind(record.creation_date)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ConditionFailed {
                context: format!(
                    "transaction {} seq {}",
                    record.database_id, record.seq_no
                ),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl BundleStore for SqliteStore {
    async fn bundle(
        &self,
        database_id: &DatabaseId,
        bundle_seq_no: SeqNo,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let data: Option<Vec<u8>> = sqlx::query_scalar(
            r#"
            SELECT data FROM bundles WHERE database_id = ?1 AND bundle_seq_no = ?2
            "#,
        )
        .bind(database_id.as_bytes())
        .bind(bundle_seq_no.value())
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        Ok(data)
    }
}

#[async_trait]
impl SeedExchangeStore for SqliteStore {
    async fn create_request(
        &self,
        user_id: &UserId,
        requester_public_key: &PublicKey,
        ttl_secs: u64,
    ) -> Result<(), StoreError> {
        let expires_at = now_millis() / 1000 + ttl_secs as i64;

        let result = sqlx::query(
            r#"
            INSERT INTO seed_requests (user_id, requester_public_key, expires_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(user_id, requester_public_key) DO NOTHING
            "#,
        )
        .bind(user_id.as_bytes())
        .bind(requester_public_key.as_bytes())
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ConditionFailed {
                context: format!("seed request for user {user_id}"),
            });
        }

        Ok(())
    }

    async fn get_request(
        &self,
        user_id: &UserId,
        requester_public_key: &PublicKey,
    ) -> Result<Option<SeedRequestRow>, StoreError> {
        let row = sqlx::query_as::<_, SeedRequestDbRow>(
            r#"
            SELECT user_id, requester_public_key, encrypted_seed, expires_at
            FROM seed_requests
            WHERE user_id = ?1 AND requester_public_key = ?2
            "#,
        )
        .bind(user_id.as_bytes())
        .bind(requester_public_key.as_bytes())
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        match row {
            Some(r) => Ok(Some(r.try_into()?)),
            None => Ok(None),
        }
    }

    async fn set_encrypted_seed(
        &self,
        user_id: &UserId,
        requester_public_key: &PublicKey,
        encrypted_seed: &EncryptedSeed,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE seed_requests SET encrypted_seed = ?3
            WHERE user_id = ?1 AND requester_public_key = ?2
            "#,
        )
        .bind(user_id.as_bytes())
        .bind(requester_public_key.as_bytes())
        .bind(encrypted_seed.as_bytes())
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                context: format!("seed request for user {user_id}"),
            });
        }

        Ok(())
    }

    async fn delete_request(
        &self,
        user_id: &UserId,
        requester_public_key: &PublicKey,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            DELETE FROM seed_requests WHERE user_id = ?1 AND requester_public_key = ?2
            "#,
        )
        .bind(user_id.as_bytes())
        .bind(requester_public_key.as_bytes())
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let now_secs = now_millis() / 1000;

        let result = sqlx::query(
            r#"
            DELETE FROM seed_requests WHERE expires_at <= ?1
            "#,
        )
        .bind(now_secs)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        Ok(result.rows_affected())
    }
}

/// Internal row type for transaction queries.
#[derive(sqlx::FromRow)]
struct TransactionRow {
    database_id: Vec<u8>,
    seq_no: i64,
    command: String,
    item_key: Option<String>,
    record: Option<String>,
    operations: Option<String>,
    creation_date: i64,
}

impl TryFrom<TransactionRow> for TransactionRecord {
    type Error = StoreError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        let database_id =
            DatabaseId::from_bytes(&row.database_id).ok_or_else(|| StoreError::InvalidRow {
                reason: format!("bad database id: {}", hex::encode(&row.database_id)),
            })?;

        let record = row
            .record
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| StoreError::InvalidRow {
                reason: format!("record decode: {e}"),
            })?;
        let operations: Option<Vec<Operation>> = row
            .operations
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| StoreError::InvalidRow {
                reason: format!("operations decode: {e}"),
            })?;

        let command = Command::from_parts(&row.command, row.item_key, record, operations)
            .map_err(|e| StoreError::InvalidRow {
                reason: e.to_string(),
            })?;

        Ok(TransactionRecord {
            database_id,
            seq_no: SeqNo::new(row.seq_no),
            command,
            creation_date: row.creation_date,
        })
    }
}

/// Internal row type for seed-request queries.
#[derive(sqlx::FromRow)]
struct SeedRequestDbRow {
    user_id: Vec<u8>,
    requester_public_key: Vec<u8>,
    encrypted_seed: Option<Vec<u8>>,
    expires_at: i64,
}

impl TryFrom<SeedRequestDbRow> for SeedRequestRow {
    type Error = StoreError;

    fn try_from(row: SeedRequestDbRow) -> Result<Self, Self::Error> {
        let user_id = UserId::from_bytes(&row.user_id).ok_or_else(|| StoreError::InvalidRow {
            reason: format!("bad user id: {}", hex::encode(&row.user_id)),
        })?;

        Ok(SeedRequestRow {
            user_id,
            requester_public_key: PublicKey::from_bytes(row.requester_public_key),
            encrypted_seed: row.encrypted_seed.map(EncryptedSeed::from_bytes),
            expires_at: row.expires_at,
        })
    }
}
