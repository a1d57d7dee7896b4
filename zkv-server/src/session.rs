//! Per-connection message dispatch.
//!
//! The framing layer hands each parsed [`ClientMessage`] to a [`Session`],
//! which drives the core operations for its connection.

use crate::connection::Connection;
use crate::error::{ProtocolError, ServerError};
use crate::push::PushArgs;
use crate::server::SyncServer;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use zkv_types::{ClientMessage, SeqNo};

/// Dispatches one connection's inbound messages to the core.
pub struct Session {
    server: Arc<SyncServer>,
    conn: Arc<Connection>,
}

impl Session {
    /// Create a session for a registered connection.
    pub fn new(server: Arc<SyncServer>, conn: Arc<Connection>) -> Self {
        Self { server, conn }
    }

    /// The connection this session drives.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Handle one inbound message.
    pub async fn handle(&self, message: ClientMessage) -> Result<(), ServerError> {
        if let Err(e) = self.server.rate_limits().check_message(&self.conn.user_id()) {
            self.server
                .metrics()
                .rate_limit_hits
                .fetch_add(1, Ordering::Relaxed);
            return Err(ProtocolError::RateLimited {
                reason: e.to_string(),
            }
            .into());
        }

        match message {
            ClientMessage::OpenDatabase(open) => {
                self.conn.open_database(
                    open.database_id,
                    open.bundle_seq_no,
                    open.reopen_at_seq_no.map(SeqNo::new),
                );
                self.server
                    .push(
                        &self.conn,
                        open.database_id,
                        PushArgs {
                            db_name_hash: open.db_name_hash,
                            db_key: open.db_key,
                            reopen_at_seq_no: open.reopen_at_seq_no.map(SeqNo::new),
                        },
                    )
                    .await
            }
            ClientMessage::RequestSeed(request) => {
                self.server
                    .send_seed_request(
                        &self.conn.user_id(),
                        self.conn.id(),
                        request.requester_public_key,
                    )
                    .await
            }
            ClientMessage::SendSeed(send) => {
                self.server
                    .send_seed(
                        &self.conn.user_id(),
                        send.sender_public_key,
                        send.requester_public_key,
                        send.encrypted_seed,
                    )
                    .await
            }
            ClientMessage::CloseSeedRequest(_) => {
                self.server.close_seed_request(&self.conn).await
            }
        }
    }
}
