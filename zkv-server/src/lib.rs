//! # zkv-server
//!
//! Server core for zkv, an end-to-end-encrypted per-user key-value sync
//! service.
//!
//! The server:
//! - Streams ordered per-database transaction logs to every connected
//!   device of a user, with gap detection and rollback repair
//! - Issues compaction hints when the unbundled log grows past a threshold
//! - Mediates the device-to-device seed exchange without ever holding the
//!   user's secret
//! - Enforces at-most-one socket per device install
//!
//! ## Architecture
//!
//! ```text
//! Device A ──┐                      ┌── Device B
//!            │  websocket (JSON)    │
//!            ├─────────────────────►│
//!            │                      │
//!        ┌───┴──────────────────────┴───┐
//!        │          zkv-server          │
//!        │  registry ── push pipeline   │
//!        │      │            │          │
//!        │  ┌───┴────────────┴──────┐   │
//!        │  │ SQLite (log, bundles, │   │
//!        │  │    seed requests)     │   │
//!        │  └───────────────────────┘   │
//!        └──────────────────────────────┘
//! ```
//!
//! The server never decrypts database contents: transactions, bundles, and
//! seeds are ciphertext end to end. Sign-up, session validation, and the
//! websocket framing itself are external collaborators; sockets enter the
//! core through [`server::SyncServer::register`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cleanup;
pub mod config;
pub mod connection;
pub mod error;
pub mod http;
pub mod limits;
pub mod push;
pub mod registry;
pub mod seed;
pub mod server;
pub mod session;
pub mod socket;
pub mod store;
