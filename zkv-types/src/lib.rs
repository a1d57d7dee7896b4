//! # zkv-types
//!
//! Wire format and identity types for the zkv end-to-end-encrypted
//! key-value sync protocol.
//!
//! This crate provides the foundational types used across all zkv crates:
//! - [`UserId`], [`ClientId`], [`ConnectionId`], [`DatabaseId`], [`SeqNo`],
//!   [`PublicKey`], [`EncryptedSeed`] - Identity and ordering types
//! - [`TransactionRecord`], [`Command`] - The per-database transaction log
//! - [`ServerMessage`], [`ClientMessage`] - Protocol messages
//! - [`SyncError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod ids;
mod messages;
mod transaction;

pub use error::SyncError;
pub use ids::{ClientId, ConnectionId, DatabaseId, EncryptedSeed, PublicKey, SeqNo, UserId};
pub use messages::{
    ApplyTransactions, ClientMessage, CloseSeedRequest, OpenDatabase, ReceiveRequestForSeed,
    ReceiveSeed, RequestSeed, SendSeed, ServerMessage,
};
pub use transaction::{
    estimated_size, BundleBlob, Command, Operation, OperationKind, TransactionRecord,
    WireTransaction,
};
