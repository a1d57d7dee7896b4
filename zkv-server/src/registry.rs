//! The connection registry.
//!
//! Indexes live sockets by `(user, connection)` and enforces at-most-one
//! socket per clientId. An explicitly constructed value owned by the
//! server entry point; the fan-out side treats "no such socket" as a
//! no-op.

use crate::connection::Connection;
use crate::error::ProtocolError;
use crate::socket::{ClientSocket, CloseCode};
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use zkv_types::{ClientId, ConnectionId, UserId};

/// Process-wide index of live connections.
#[derive(Default)]
pub struct Registry {
    sockets: DashMap<UserId, DashMap<ConnectionId, Arc<Connection>>>,
    unique_clients: DashSet<ClientId>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted socket.
    ///
    /// A clientId may back at most one live socket: a duplicate closes the
    /// new socket with [`CloseCode::ClientAlreadyConnected`] so the client
    /// can tell "you have another tab" apart from a network error.
    pub async fn register(
        &self,
        user_id: UserId,
        client_id: ClientId,
        socket: Arc<dyn ClientSocket>,
    ) -> Result<Arc<Connection>, ProtocolError> {
        // DashSet::insert is the atomic claim; false means someone holds it.
        if !self.unique_clients.insert(client_id) {
            if let Err(e) = socket.close(CloseCode::ClientAlreadyConnected).await {
                tracing::debug!("close of duplicate client socket failed: {e}");
            }
            return Err(ProtocolError::ClientAlreadyConnected { client_id });
        }

        let conn = Arc::new(Connection::new(user_id, client_id, socket));
        self.sockets
            .entry(user_id)
            .or_default()
            .insert(conn.id(), conn.clone());

        tracing::debug!(
            "registered connection {:?} for user {:?} (client {:?})",
            conn.id(),
            user_id,
            client_id
        );
        Ok(conn)
    }

    /// Remove a connection. Idempotent on already-closed connections.
    pub fn close(&self, conn: &Connection) {
        let removed = {
            match self.sockets.get(&conn.user_id()) {
                Some(user_conns) => user_conns.remove(&conn.id()).is_some(),
                None => false,
            }
        };

        // Release the clientId only if this call actually removed the
        // connection; a second close must not evict a successor that
        // re-claimed the same clientId.
        if removed {
            self.unique_clients.remove(&conn.client_id());
            tracing::debug!("closed connection {:?}", conn.id());
        }

        self.sockets
            .remove_if(&conn.user_id(), |_, user_conns| user_conns.is_empty());
    }

    /// One connection of a user, if it is still live.
    pub fn connection(
        &self,
        user_id: &UserId,
        connection_id: &ConnectionId,
    ) -> Option<Arc<Connection>> {
        self.sockets
            .get(user_id)?
            .get(connection_id)
            .map(|entry| entry.value().clone())
    }

    /// All live connections of a user.
    pub fn connections_for(&self, user_id: &UserId) -> Vec<Arc<Connection>> {
        match self.sockets.get(user_id) {
            Some(user_conns) => user_conns.iter().map(|entry| entry.value().clone()).collect(),
            None => Vec::new(),
        }
    }

    /// Whether a clientId currently backs a live socket.
    pub fn client_connected(&self, client_id: &ClientId) -> bool {
        self.unique_clients.contains(client_id)
    }

    /// Total live connections across all users.
    pub fn total_connections(&self) -> usize {
        self.sockets.iter().map(|entry| entry.value().len()).sum()
    }

    /// Users with at least one live connection.
    pub fn total_users(&self) -> usize {
        self.sockets.len()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("users", &self.sockets.len())
            .field("unique_clients", &self.unique_clients.len())
            .finish()
    }
}
