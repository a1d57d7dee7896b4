//! Per-connection state.
//!
//! A [`Connection`] is one live socket of one device. It owns the
//! per-database delivery state and the per-socket half of the seed
//! exchange.

use crate::socket::ClientSocket;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use zkv_types::{
    ClientId, ConnectionId, DatabaseId, EncryptedSeed, PublicKey, ReceiveRequestForSeed,
    ReceiveSeed, SeqNo, ServerMessage, UserId,
};

/// Delivery state for one database on one socket.
///
/// `last_seq_no` is monotonically non-decreasing and equals the highest
/// sequence number already delivered to this client on this socket. All
/// mutations and the optimistic re-checks run under the owning mutex.
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseState {
    /// Position of the client's bundle; [`SeqNo::NONE`] if it has none.
    pub bundle_seq_no: SeqNo,
    /// Highest sequence number delivered on this socket.
    pub last_seq_no: SeqNo,
    /// Unbundled bytes streamed since the last compaction hint.
    pub transaction_log_size: u64,
    /// Whether the opening (or reopening) batch has been sent.
    pub init: bool,
}

/// A live session: one socket of one device of one user.
///
/// Created when the websocket handshake completes; destroyed when the
/// socket closes.
pub struct Connection {
    id: ConnectionId,
    user_id: UserId,
    client_id: ClientId,
    socket: Arc<dyn ClientSocket>,
    key_validated: AtomicBool,
    /// The pending seed request this socket issued, if any.
    requester_public_key: StdMutex<Option<PublicKey>>,
    databases: DashMap<DatabaseId, Arc<Mutex<DatabaseState>>>,
}

impl Connection {
    /// Create a connection for a completed handshake.
    pub fn new(user_id: UserId, client_id: ClientId, socket: Arc<dyn ClientSocket>) -> Self {
        Self {
            id: ConnectionId::new(),
            user_id,
            client_id,
            socket,
            key_validated: AtomicBool::new(false),
            requester_public_key: StdMutex::new(None),
            databases: DashMap::new(),
        }
    }

    /// This connection's identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The user this connection belongs to.
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// The device installation behind this connection.
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// The outbound socket.
    pub fn socket(&self) -> &dyn ClientSocket {
        self.socket.as_ref()
    }

    /// Whether this device has proved possession of the user's key.
    pub fn key_validated(&self) -> bool {
        self.key_validated.load(Ordering::Acquire)
    }

    /// Mark the device as having proved possession of the user's key.
    ///
    /// Invoked by the external auth path after it verifies the
    /// Diffie-Hellman-encrypted validation message. Until then the
    /// connection can receive transactions but cannot be a seed-request
    /// target.
    pub fn validate_key(&self) {
        self.key_validated.store(true, Ordering::Release);
    }

    /// Remember the pending seed request this socket issued.
    pub fn set_requester_public_key(&self, key: PublicKey) {
        *self.requester_public_key.lock().unwrap() = Some(key);
    }

    /// The pending seed request this socket issued, if any.
    pub fn requester_public_key(&self) -> Option<PublicKey> {
        self.requester_public_key.lock().unwrap().clone()
    }

    /// Take and clear the pending seed request.
    pub fn take_requester_public_key(&self) -> Option<PublicKey> {
        self.requester_public_key.lock().unwrap().take()
    }

    /// Create the delivery state for a database on this socket.
    ///
    /// `bundle_seq_no` is normalized: non-positive means no bundle. For a
    /// reopen the client already holds the header, so `init` starts true
    /// and delivery resumes after `reopen_at_seq_no`; for a first-time
    /// open, `init` stays false until the opening batch is sent.
    pub fn open_database(
        &self,
        database_id: DatabaseId,
        bundle_seq_no: i64,
        reopen_at_seq_no: Option<SeqNo>,
    ) -> Arc<Mutex<DatabaseState>> {
        let state = Arc::new(Mutex::new(DatabaseState {
            bundle_seq_no: SeqNo::bundle_from(bundle_seq_no),
            last_seq_no: reopen_at_seq_no.unwrap_or_else(SeqNo::zero),
            transaction_log_size: 0,
            init: reopen_at_seq_no.is_some(),
        }));
        self.databases.insert(database_id, state.clone());
        state
    }

    /// The delivery state for a database, if this socket opened it.
    pub fn database(&self, database_id: &DatabaseId) -> Option<Arc<Mutex<DatabaseState>>> {
        self.databases.get(database_id).map(|entry| entry.value().clone())
    }

    /// Forward a seed request to this device.
    ///
    /// Only key-validated devices ever receive seed requests, so an
    /// unauthorized device cannot phish secrets. Send failures are
    /// swallowed; the socket is dying anyway.
    pub async fn forward_seed_request(&self, requester_public_key: &PublicKey) {
        if !self.key_validated() {
            return;
        }

        let message = ServerMessage::ReceiveRequestForSeed(ReceiveRequestForSeed {
            requester_public_key: requester_public_key.clone(),
        });
        if let Err(e) = self.socket.send(&message).await {
            tracing::debug!("seed request not delivered to {:?}: {}", self.id, e);
        }
    }

    /// Forward a seed delivery to this device.
    ///
    /// Delivered only when this socket is the requester; every other
    /// socket silently drops the message.
    pub async fn forward_seed(
        &self,
        sender_public_key: &PublicKey,
        requester_public_key: &PublicKey,
        encrypted_seed: &EncryptedSeed,
    ) {
        if self.requester_public_key().as_ref() != Some(requester_public_key) {
            return;
        }

        let message = ServerMessage::ReceiveSeed(ReceiveSeed {
            sender_public_key: sender_public_key.clone(),
            encrypted_seed: encrypted_seed.clone(),
        });
        if let Err(e) = self.socket.send(&message).await {
            tracing::debug!("seed not delivered to {:?}: {}", self.id, e);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("client_id", &self.client_id)
            .field("key_validated", &self.key_validated())
            .field("databases", &self.databases.len())
            .finish_non_exhaustive()
    }
}
