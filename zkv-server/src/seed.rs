//! The seed-exchange mediator.
//!
//! Routes seed requests and seed deliveries among a user's active
//! sockets, and keeps the pending-exchange row in the store alive for
//! requesters that reconnect. The server never sees the seed in
//! cleartext: it forwards ciphertext between devices that run the ECDH
//! exchange end to end.

use crate::connection::Connection;
use crate::error::{ServerError, StoreError};
use crate::registry::Registry;
use crate::store::SeedExchangeStore;
use std::sync::Arc;
use zkv_types::{ConnectionId, EncryptedSeed, PublicKey, UserId};

/// Routes seed-exchange traffic across a user's connections.
pub struct SeedMediator {
    registry: Arc<Registry>,
    store: Arc<dyn SeedExchangeStore>,
    /// TTL for pending exchange rows.
    request_ttl_secs: u64,
}

impl SeedMediator {
    /// Create a mediator over the given registry and store.
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<dyn SeedExchangeStore>,
        request_ttl_secs: u64,
    ) -> Self {
        Self {
            registry,
            store,
            request_ttl_secs,
        }
    }

    /// Record a pending seed request issued by `conn`.
    ///
    /// The store row makes the request outlive this socket; a row that
    /// already exists means the same device is retrying an in-flight
    /// exchange, which is fine.
    pub async fn open_seed_request(
        &self,
        conn: &Connection,
        requester_public_key: PublicKey,
    ) -> Result<(), ServerError> {
        conn.set_requester_public_key(requester_public_key.clone());

        match self
            .store
            .create_request(&conn.user_id(), &requester_public_key, self.request_ttl_secs)
            .await
        {
            Ok(()) => Ok(()),
            Err(StoreError::ConditionFailed { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Broadcast a seed request to every connection of `user_id`.
    ///
    /// The origin connection records the requester key first; its own
    /// broadcaster is a no-op while it is unvalidated, so only sibling
    /// validated devices actually receive the request.
    pub async fn send_seed_request(
        &self,
        user_id: &UserId,
        origin_connection_id: ConnectionId,
        requester_public_key: PublicKey,
    ) -> Result<(), ServerError> {
        if let Some(origin) = self.registry.connection(user_id, &origin_connection_id) {
            self.open_seed_request(&origin, requester_public_key.clone())
                .await?;
        }

        for conn in self.registry.connections_for(user_id) {
            conn.forward_seed_request(&requester_public_key).await;
        }
        Ok(())
    }

    /// Deliver an encrypted seed to the requester among `user_id`'s
    /// connections.
    ///
    /// The ciphertext lands in the store first so a requester that lost
    /// its socket can still collect it on reconnect.
    pub async fn send_seed(
        &self,
        user_id: &UserId,
        sender_public_key: PublicKey,
        requester_public_key: PublicKey,
        encrypted_seed: EncryptedSeed,
    ) -> Result<(), ServerError> {
        self.store
            .set_encrypted_seed(user_id, &requester_public_key, &encrypted_seed)
            .await?;

        for conn in self.registry.connections_for(user_id) {
            conn.forward_seed(&sender_public_key, &requester_public_key, &encrypted_seed)
                .await;
        }
        Ok(())
    }

    /// The requester confirmed receipt: drop the exchange row and the
    /// pending key on its connection.
    pub async fn close_seed_request(&self, conn: &Connection) -> Result<(), ServerError> {
        if let Some(requester_public_key) = conn.take_requester_public_key() {
            self.store
                .delete_request(&conn.user_id(), &requester_public_key)
                .await?;
        }
        Ok(())
    }
}
