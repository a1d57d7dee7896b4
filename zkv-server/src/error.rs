//! Error types for zkv-server.

use zkv_types::{ClientId, DatabaseId};

/// Main error type for server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Socket error.
    #[error("socket error: {0}")]
    Socket(#[from] crate::socket::SocketError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Store layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A conditional write lost: something already occupies the key.
    #[error("conditional write failed: {context}")]
    ConditionFailed {
        /// What the write was attempting.
        context: String,
    },

    /// Row not found.
    #[error("row not found: {context}")]
    NotFound {
        /// What was looked up.
        context: String,
    },

    /// A stored row could not be decoded.
    #[error("corrupt row: {reason}")]
    InvalidRow {
        /// Why decoding failed.
        reason: String,
    },
}

impl StoreError {
    /// Whether this is the distinguishable conditional-write failure.
    pub fn is_condition_failed(&self) -> bool {
        matches!(self, StoreError::ConditionFailed { .. })
    }
}

/// Protocol layer errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Another live socket already carries this clientId.
    #[error("client already connected: {client_id}")]
    ClientAlreadyConnected {
        /// The contested clientId.
        client_id: ClientId,
    },

    /// Rate limit exceeded.
    #[error("rate limit exceeded: {reason}")]
    RateLimited {
        /// Which limiter rejected the operation.
        reason: String,
    },

    /// Invalid message format.
    #[error("invalid message: {reason}")]
    InvalidMessage {
        /// Reason the message is invalid.
        reason: String,
    },

    /// The connection never opened this database.
    #[error("database not open on this connection: {database_id}")]
    DatabaseNotOpen {
        /// The database that was addressed.
        database_id: DatabaseId,
    },
}

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
