//! Rate limiting for zkv-server.
//!
//! Provides protection against connection flooding and message spam.
//!
//! ## Design Notes
//!
//! Authentication happens before the socket reaches the core, so limits
//! key on protocol identities rather than IP addresses:
//! - **ClientId** for connection attempts (one quota per device install)
//! - **UserId** for message operations (shared across a user's devices)
//!
//! Both use the governor crate's keyed rate limiters.

use crate::config::LimitsConfig;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use zkv_types::{ClientId, UserId};

/// Rate limiters for the sync server.
#[derive(Clone)]
pub struct RateLimits {
    /// Limits connection attempts per ClientId.
    ///
    /// Configured via `limits.connections_per_client`.
    connection_limiter: Arc<DefaultKeyedRateLimiter<Vec<u8>>>,

    /// Limits message operations per UserId.
    ///
    /// Configured via `limits.messages_per_minute`.
    message_limiter: Arc<DefaultKeyedRateLimiter<Vec<u8>>>,
}

impl std::fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimits")
            .field("connection_limiter", &"KeyedLimiter<ClientId>")
            .field("message_limiter", &"KeyedLimiter<UserId>")
            .finish()
    }
}

impl RateLimits {
    /// Create rate limiters from configuration.
    ///
    /// # Panics
    ///
    /// Panics if the configured values are zero.
    pub fn new(config: &LimitsConfig) -> Self {
        let connections_per_minute = NonZeroU32::new(config.connections_per_client)
            .expect("connections_per_client must be > 0");
        let connection_quota = Quota::per_minute(connections_per_minute);

        let messages_per_minute =
            NonZeroU32::new(config.messages_per_minute).expect("messages_per_minute must be > 0");
        let message_quota = Quota::per_minute(messages_per_minute);

        Self {
            connection_limiter: Arc::new(RateLimiter::keyed(connection_quota)),
            message_limiter: Arc::new(RateLimiter::keyed(message_quota)),
        }
    }

    /// Check if a connection attempt is allowed.
    ///
    /// Returns `Ok(())` if allowed, `Err` with reason if rate limited.
    pub fn check_connection(&self, client_id: &ClientId) -> Result<(), RateLimitError> {
        self.connection_limiter
            .check_key(&client_id.as_bytes().to_vec())
            .map_err(|_| RateLimitError::ConnectionLimitExceeded)
    }

    /// Check if a message operation is allowed.
    ///
    /// Returns `Ok(())` if allowed, `Err` with reason if rate limited.
    pub fn check_message(&self, user_id: &UserId) -> Result<(), RateLimitError> {
        self.message_limiter
            .check_key(&user_id.as_bytes().to_vec())
            .map_err(|_| RateLimitError::MessageLimitExceeded)
    }

    /// Get the number of tracked connection keys (for metrics).
    pub fn connection_keys_count(&self) -> usize {
        self.connection_limiter.len()
    }

    /// Get the number of tracked message keys (for metrics).
    pub fn message_keys_count(&self) -> usize {
        self.message_limiter.len()
    }
}

/// Rate limit error types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    /// Too many connection attempts from this device.
    ConnectionLimitExceeded,
    /// Too many messages from this user.
    MessageLimitExceeded,
}

impl std::fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionLimitExceeded => {
                write!(f, "connection rate limit exceeded")
            }
            Self::MessageLimitExceeded => {
                write!(f, "message rate limit exceeded")
            }
        }
    }
}

impl std::error::Error for RateLimitError {}
