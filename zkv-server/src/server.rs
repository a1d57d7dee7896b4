//! Main server coordination.
//!
//! [`SyncServer`] owns the registry, the stores, and the fan-out entry
//! points invoked when a transaction commits or seed traffic arrives.

use crate::config::Config;
use crate::connection::Connection;
use crate::error::{ProtocolError, ServerError};
use crate::limits::RateLimits;
use crate::push::{push, send_payload, PushArgs};
use crate::registry::Registry;
use crate::seed::SeedMediator;
use crate::socket::{ClientSocket, CloseCode};
use crate::store::{BundleStore, SeedExchangeStore, TransactionLogStore};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use zkv_types::{
    ApplyTransactions, ClientId, ConnectionId, DatabaseId, EncryptedSeed, PublicKey,
    TransactionRecord, UserId,
};

/// Operational metrics for monitoring server activity.
///
/// All counters are monotonically increasing (reset only on restart).
/// Thread-safe via `AtomicU64` — no locks needed for incrementing.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    /// Total connections accepted.
    pub connections_total: AtomicU64,
    /// Total push pipeline runs (opens, reopens, and slow-path fan-outs).
    pub pushes_total: AtomicU64,
    /// Total fast-path sends (fan-out with no store read).
    pub fast_path_sends: AtomicU64,
    /// Total transactions delivered across all sockets.
    pub transactions_delivered: AtomicU64,
    /// Total rollback sentinels written.
    pub rollbacks_written: AtomicU64,
    /// Total batches stamped with the compaction hint.
    pub bundle_hints: AtomicU64,
    /// Total seed requests routed.
    pub seed_requests_routed: AtomicU64,
    /// Total seeds delivered to requesters.
    pub seeds_delivered: AtomicU64,
    /// Total rate limit rejections.
    pub rate_limit_hits: AtomicU64,
    /// Total errors absorbed at the push/fan-out boundary.
    pub errors_total: AtomicU64,
}

/// The realtime fan-out server.
pub struct SyncServer {
    config: Config,
    log: Arc<dyn TransactionLogStore>,
    bundles: Arc<dyn BundleStore>,
    registry: Arc<Registry>,
    seeds: SeedMediator,
    rate_limits: RateLimits,
    metrics: ServerMetrics,
}

impl SyncServer {
    /// Create a server over the given stores.
    pub fn new(
        config: Config,
        log: Arc<dyn TransactionLogStore>,
        bundles: Arc<dyn BundleStore>,
        seed_store: Arc<dyn SeedExchangeStore>,
    ) -> Arc<Self> {
        let registry = Arc::new(Registry::new());
        let rate_limits = RateLimits::new(&config.limits);
        let seeds = SeedMediator::new(
            registry.clone(),
            seed_store,
            config.storage.seed_request_ttl_secs,
        );
        Arc::new(Self {
            config,
            log,
            bundles,
            registry,
            seeds,
            rate_limits,
            metrics: ServerMetrics::default(),
        })
    }

    /// Get the server configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the connection registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Get access to the rate limiters.
    pub fn rate_limits(&self) -> &RateLimits {
        &self.rate_limits
    }

    /// Get access to the operational metrics.
    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    /// Accept a completed websocket handshake.
    ///
    /// Rejects when the clientId is rate limited (socket closed with
    /// `Rate Limited`) or already connected (socket closed with
    /// `Client Already Connected`).
    pub async fn register(
        &self,
        user_id: UserId,
        client_id: ClientId,
        socket: Arc<dyn ClientSocket>,
    ) -> Result<Arc<Connection>, ServerError> {
        if let Err(e) = self.rate_limits.check_connection(&client_id) {
            self.metrics.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
            if let Err(close_err) = socket.close(CloseCode::RateLimited).await {
                tracing::debug!("close of rate-limited socket failed: {close_err}");
            }
            return Err(ProtocolError::RateLimited {
                reason: e.to_string(),
            }
            .into());
        }

        let conn = self.registry.register(user_id, client_id, socket).await?;
        self.metrics.connections_total.fetch_add(1, Ordering::Relaxed);
        Ok(conn)
    }

    /// Tear down a connection after its socket closed.
    pub fn disconnect(&self, conn: &Connection) {
        self.registry.close(conn);
    }

    /// Run the push pipeline for one database on one connection.
    pub async fn push(
        &self,
        conn: &Connection,
        database_id: DatabaseId,
        args: PushArgs,
    ) -> Result<(), ServerError> {
        push(
            self.log.as_ref(),
            self.bundles.as_ref(),
            &self.metrics,
            conn,
            database_id,
            args,
        )
        .await
    }

    /// Entry point for the write path: a transaction has committed.
    ///
    /// Every connection of the user gets the record: in the steady state
    /// the commit lands exactly one past the delivery position and goes
    /// out directly with no store read; any skew falls back to the full
    /// scan-and-repair push. Errors never reach the committing writer.
    pub async fn on_transaction_committed(&self, user_id: &UserId, transaction: &TransactionRecord) {
        for conn in self.registry.connections_for(user_id) {
            self.deliver_commit(&conn, transaction).await;
        }
    }

    async fn deliver_commit(&self, conn: &Connection, transaction: &TransactionRecord) {
        // A connection that never opened this database is skipped.
        let Some(state) = conn.database(&transaction.database_id) else {
            return;
        };

        let mut guard = state.lock().await;
        if guard.init && transaction.seq_no == guard.last_seq_no.next() {
            self.metrics.fast_path_sends.fetch_add(1, Ordering::Relaxed);
            send_payload(
                conn.socket(),
                &self.metrics,
                ApplyTransactions::bare(transaction.database_id),
                vec![transaction.clone()],
                &mut guard,
            )
            .await;
            return;
        }
        drop(guard);

        if let Err(e) = self
            .push(conn, transaction.database_id, PushArgs::default())
            .await
        {
            self.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "push for database {} on {:?} failed: {e}",
                transaction.database_id,
                conn.id()
            );
        }
    }

    /// Broadcast a seed request to the user's validated devices.
    pub async fn send_seed_request(
        &self,
        user_id: &UserId,
        origin_connection_id: ConnectionId,
        requester_public_key: PublicKey,
    ) -> Result<(), ServerError> {
        self.metrics.seed_requests_routed.fetch_add(1, Ordering::Relaxed);
        self.seeds
            .send_seed_request(user_id, origin_connection_id, requester_public_key)
            .await
    }

    /// Route an encrypted seed to its requester.
    pub async fn send_seed(
        &self,
        user_id: &UserId,
        sender_public_key: PublicKey,
        requester_public_key: PublicKey,
        encrypted_seed: EncryptedSeed,
    ) -> Result<(), ServerError> {
        self.seeds
            .send_seed(user_id, sender_public_key, requester_public_key, encrypted_seed)
            .await?;
        self.metrics.seeds_delivered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// The requester confirmed receipt of the seed.
    pub async fn close_seed_request(&self, conn: &Connection) -> Result<(), ServerError> {
        self.seeds.close_seed_request(conn).await
    }
}

impl std::fmt::Debug for SyncServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncServer")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::MockSocket;
    use crate::store::MemoryStore;
    use serde_json::json;
    use crate::store::now_millis;
    use zkv_types::{Command, SeqNo, ServerMessage};

    struct Rig {
        server: Arc<SyncServer>,
        store: Arc<MemoryStore>,
    }

    fn rig() -> Rig {
        let store = Arc::new(MemoryStore::new());
        let server = SyncServer::new(
            Config::default(),
            store.clone(),
            store.clone(),
            store.clone(),
        );
        Rig { server, store }
    }

    fn record(database_id: DatabaseId, seq_no: i64) -> TransactionRecord {
        TransactionRecord {
            database_id,
            seq_no: SeqNo::new(seq_no),
            command: Command::Insert {
                key: format!("key-{seq_no}"),
                record: json!("payload"),
            },
            creation_date: now_millis(),
        }
    }

    impl Rig {
        async fn device(&self, user_id: UserId) -> (Arc<Connection>, MockSocket) {
            let socket = MockSocket::new();
            let conn = self
                .server
                .register(user_id, ClientId::new(), Arc::new(socket.clone()))
                .await
                .unwrap();
            (conn, socket)
        }

        async fn commit(&self, user_id: &UserId, tx: &TransactionRecord) {
            self.store.put_if_absent(tx).await.unwrap();
            self.server.on_transaction_committed(user_id, tx).await;
        }
    }

    fn seqs(message: &ServerMessage) -> Vec<i64> {
        match message {
            ServerMessage::ApplyTransactions(batch) => {
                batch.transaction_log.iter().map(|t| t.seq_no).collect()
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn fast_path_delivers_without_store_read() {
        let r = rig();
        let user_id = UserId::new();
        let (conn, socket) = r.device(user_id).await;

        let db = DatabaseId::new();
        conn.open_database(db, 0, Some(SeqNo::new(7)));

        // The record is NOT in the store: only the fast path can deliver it.
        let tx = record(db, 8);
        r.server.on_transaction_committed(&user_id, &tx).await;

        assert_eq!(seqs(&socket.last_sent().unwrap()), vec![8]);
        assert_eq!(
            conn.database(&db).unwrap().lock().await.last_seq_no,
            SeqNo::new(8)
        );
        assert_eq!(
            r.server.metrics().fast_path_sends.load(Ordering::Relaxed),
            1
        );
        assert_eq!(r.server.metrics().pushes_total.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn skewed_commit_falls_back_to_full_push() {
        let r = rig();
        let user_id = UserId::new();
        let (conn, socket) = r.device(user_id).await;

        let db = DatabaseId::new();
        conn.open_database(db, 0, Some(SeqNo::new(0)));

        // Commits 1 and 2 land in the store, but fan-out only fires for 2:
        // the dispatcher must fall back to the scan to catch up.
        r.store.put_if_absent(&record(db, 1)).await.unwrap();
        let tx = record(db, 2);
        r.commit(&user_id, &tx).await;

        assert_eq!(seqs(&socket.last_sent().unwrap()), vec![1, 2]);
        assert_eq!(r.server.metrics().pushes_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn fanout_covers_every_connection_of_the_user() {
        let r = rig();
        let user_id = UserId::new();
        let (conn_a, socket_a) = r.device(user_id).await;
        let (conn_b, socket_b) = r.device(user_id).await;
        let (_conn_c, socket_c) = r.device(UserId::new()).await;

        let db = DatabaseId::new();
        conn_a.open_database(db, 0, Some(SeqNo::new(0)));
        conn_b.open_database(db, 0, Some(SeqNo::new(0)));

        let tx = record(db, 1);
        r.commit(&user_id, &tx).await;

        assert_eq!(socket_a.sent_messages().len(), 1);
        assert_eq!(socket_b.sent_messages().len(), 1);
        assert!(socket_c.sent_messages().is_empty());
    }

    #[tokio::test]
    async fn connection_without_the_database_is_skipped() {
        let r = rig();
        let user_id = UserId::new();
        let (_conn, socket) = r.device(user_id).await;

        let tx = record(DatabaseId::new(), 1);
        r.commit(&user_id, &tx).await;

        assert!(socket.sent_messages().is_empty());
    }

    #[tokio::test]
    async fn fast_path_requires_an_initialized_database() {
        let r = rig();
        let user_id = UserId::new();
        let (conn, socket) = r.device(user_id).await;

        let db = DatabaseId::new();
        // First-time open whose opening batch has not gone out yet.
        conn.open_database(db, 0, None);

        let tx = record(db, 1);
        r.commit(&user_id, &tx).await;

        // No bare batch may precede the opening header.
        assert!(socket.sent_messages().is_empty());
    }

    #[tokio::test]
    async fn commit_for_user_without_sockets_is_a_noop() {
        let r = rig();
        let tx = record(DatabaseId::new(), 1);
        r.server
            .on_transaction_committed(&UserId::new(), &tx)
            .await;
    }

    #[tokio::test]
    async fn register_rejects_duplicate_client_id() {
        let r = rig();
        let user_id = UserId::new();
        let client_id = ClientId::new();

        r.server
            .register(user_id, client_id, Arc::new(MockSocket::new()))
            .await
            .unwrap();

        let second = MockSocket::new();
        let err = r
            .server
            .register(user_id, client_id, Arc::new(second.clone()))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ServerError::Protocol(ProtocolError::ClientAlreadyConnected { .. })
        ));
        assert_eq!(second.closed_with(), Some(CloseCode::ClientAlreadyConnected));
        assert_eq!(r.server.registry().total_connections(), 1);
    }

    #[tokio::test]
    async fn register_rate_limit_closes_socket() {
        let store = Arc::new(MemoryStore::new());
        let mut config = Config::default();
        config.limits.connections_per_client = 2;
        let server = SyncServer::new(config, store.clone(), store.clone(), store);

        let user_id = UserId::new();
        let client_id = ClientId::new();

        // Connect-disconnect twice within the quota.
        for _ in 0..2 {
            let conn = server
                .register(user_id, client_id, Arc::new(MockSocket::new()))
                .await
                .unwrap();
            server.disconnect(&conn);
        }

        let third = MockSocket::new();
        let err = server
            .register(user_id, client_id, Arc::new(third.clone()))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ServerError::Protocol(ProtocolError::RateLimited { .. })
        ));
        assert_eq!(third.closed_with(), Some(CloseCode::RateLimited));
        assert_eq!(server.metrics().rate_limit_hits.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn interleaved_fast_and_slow_paths_stay_contiguous() {
        let r = rig();
        let user_id = UserId::new();
        let (conn, socket) = r.device(user_id).await;

        let db = DatabaseId::new();
        conn.open_database(db, 0, Some(SeqNo::new(0)));

        for seq in 1..=5 {
            let tx = record(db, seq);
            r.commit(&user_id, &tx).await;
        }

        let all: Vec<i64> = socket.sent_messages().iter().flat_map(|m| seqs(m)).collect();
        assert_eq!(all, vec![1, 2, 3, 4, 5]);
    }
}
