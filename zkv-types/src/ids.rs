//! Identity and ordering types for zkv.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A unique identifier for a user account.
///
/// Assigned by the account service at sign-up; opaque to the sync core.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(uuid::Uuid);

impl UserId {
    /// Create a new random UserId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Create a UserId from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        uuid::Uuid::from_slice(bytes).ok().map(Self)
    }

    /// Get the raw bytes of this UserId.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", self.0)
    }
}

/// A unique identifier for a device installation.
///
/// Chosen by the client once per install and presented at every connect.
/// At most one live socket may carry a given ClientId.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(uuid::Uuid);

impl ClientId {
    /// Create a new random ClientId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Create a ClientId from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        uuid::Uuid::from_slice(bytes).ok().map(Self)
    }

    /// Get the raw bytes of this ClientId.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self.0)
    }
}

/// A unique identifier for one live socket, minted by the registry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    /// Mint a fresh ConnectionId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self.0)
    }
}

/// A unique identifier for a client-chosen logical database.
///
/// The human-readable name never reaches the server; clients identify a
/// database to the user by `dbNameHash`, which the server treats as opaque.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatabaseId(uuid::Uuid);

impl DatabaseId {
    /// Create a new random DatabaseId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Create a DatabaseId from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        uuid::Uuid::from_slice(bytes).ok().map(Self)
    }

    /// Get the raw bytes of this DatabaseId.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl Default for DatabaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DatabaseId({})", self.0)
    }
}

/// A per-database transaction sequence number.
///
/// Assigned densely by the write path starting at 1. Gaps represent
/// in-flight or aborted commits. [`SeqNo::NONE`] marks the absence of a
/// bundle.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct SeqNo(i64);

impl SeqNo {
    /// The "no bundle" sentinel.
    pub const NONE: SeqNo = SeqNo(-1);

    /// Create a SeqNo with the given value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Get the numeric value.
    pub fn value(self) -> i64 {
        self.0
    }

    /// The position before the first transaction.
    pub fn zero() -> Self {
        Self(0)
    }

    /// The next sequence number.
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Normalize a client-supplied bundle position: non-positive means no
    /// bundle exists.
    pub fn bundle_from(value: i64) -> Self {
        if value <= 0 {
            Self::NONE
        } else {
            Self(value)
        }
    }
}

impl fmt::Display for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SeqNo({})", self.0)
    }
}

/// An ECDH public key identifying one side of a seed exchange.
///
/// Opaque bytes to the server; travels on the wire as URL-safe base64.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PublicKey(Vec<u8>);

impl PublicKey {
    /// Create a PublicKey from raw bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Create a random 32-byte PublicKey (for testing).
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        Self(bytes.to_vec())
    }

    /// Get the raw bytes of this PublicKey.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", URL_SAFE_NO_PAD.encode(&self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = self.to_string();
        write!(f, "PublicKey({})", &encoded[..encoded.len().min(8)])
    }
}

impl Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&URL_SAFE_NO_PAD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        URL_SAFE_NO_PAD
            .decode(encoded.as_bytes())
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}

/// The user's root secret, encrypted to a requester's public key.
///
/// The server stores and forwards it; it can never decrypt it.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedSeed(Vec<u8>);

impl EncryptedSeed {
    /// Create an EncryptedSeed from raw ciphertext bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Get the raw ciphertext bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for EncryptedSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedSeed")
            .field("ciphertext", &"[REDACTED]")
            .field("len", &self.0.len())
            .finish()
    }
}

impl Serialize for EncryptedSeed {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&URL_SAFE_NO_PAD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for EncryptedSeed {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        URL_SAFE_NO_PAD
            .decode(encoded.as_bytes())
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_roundtrip() {
        let original = UserId::new();
        let restored = UserId::from_bytes(original.as_bytes()).unwrap();
        assert_eq!(original, restored);
    }

    #[test]
    fn client_id_from_invalid_length_fails() {
        assert!(ClientId::from_bytes(&[0u8; 8]).is_none());
        assert!(ClientId::from_bytes(&[0u8; 32]).is_none());
    }

    #[test]
    fn connection_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn seq_no_ordering() {
        assert!(SeqNo::new(100) < SeqNo::new(200));
        assert!(SeqNo::NONE < SeqNo::zero());
    }

    #[test]
    fn seq_no_next_saturates() {
        assert_eq!(SeqNo::new(7).next().value(), 8);
        assert_eq!(SeqNo::new(i64::MAX).next().value(), i64::MAX);
    }

    #[test]
    fn bundle_normalization() {
        assert_eq!(SeqNo::bundle_from(0), SeqNo::NONE);
        assert_eq!(SeqNo::bundle_from(-5), SeqNo::NONE);
        assert_eq!(SeqNo::bundle_from(100).value(), 100);
    }

    #[test]
    fn public_key_json_is_base64() {
        let key = PublicKey::from_bytes(vec![1, 2, 3, 4]);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", key));

        let restored: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(key, restored);
    }

    #[test]
    fn encrypted_seed_debug_redacts_ciphertext() {
        let seed = EncryptedSeed::from_bytes(vec![0xAB; 48]);
        let debug = format!("{:?}", seed);
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("171")); // 0xAB = 171
        assert!(debug.contains("48"));
    }

    #[test]
    fn public_key_debug_is_truncated() {
        let key = PublicKey::random();
        let debug = format!("{:?}", key);
        assert!(debug.len() < 25);
    }
}
