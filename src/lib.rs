//! # satellite-replication
//!
//! The Satellite-facing replication protocol engine of a bidirectional
//! PostgreSQL replication broker. It speaks a framed binary protocol to a
//! fleet of embedded clients: row operations and schema migrations flow out
//! in WAL commit order, client-originated transactions flow back in, and a
//! bidirectional RPC layer multiplexed over the same channel drives
//! authentication, replication start/stop and shape subscriptions.
//!
//! ## Features
//!
//! - **Async/await** - one Tokio task per connection, generic over any
//!   `AsyncRead + AsyncWrite` transport
//! - **Bidirectional RPC** - either peer may initiate a call; correlation by
//!   `(method, request_id)` with one-shot completions
//! - **Schema-versioned rows** - NULL-bitmap framed row images resolved
//!   against per-connection relation advertisements
//! - **Resumable cursors** - clients reconnect with their last acknowledged
//!   position and the subscriptions they still want
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use satellite_replication::{ConnectionConfig, server::Connection};
//! # use satellite_replication::server::ServerDeps;
//!
//! # async fn example(deps: ServerDeps, stream: tokio::net::TcpStream, subproto: String) -> anyhow::Result<()> {
//! let (conn, mut events) = Connection::new(ConnectionConfig::default(), deps);
//! tokio::spawn(async move {
//!     if let Err(e) = conn.run_on_stream(stream, &subproto).await {
//!         tracing::error!("connection terminated: {e}");
//!     }
//! });
//!
//! // Client-originated transactions surface here, assembled and decoded.
//! while let Some(txn) = events.recv().await {
//!     println!("client txn {} at {}", txn.trans_id, txn.lsn);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The PostgreSQL-facing side is out of scope; the engine consumes it
//! through the [`source`] traits (WAL source, schema cache, migration
//! translator, snapshot data source) and [`auth::AuthVerifier`].

#![warn(
    clippy::all,
    clippy::cargo,
    clippy::perf,
    clippy::style,
    clippy::correctness,
    clippy::suspicious
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::multiple_crate_versions
)]

pub mod auth;
pub mod config;
pub mod cursor;
pub mod error;
pub mod lsn;
pub mod protocol;
pub mod relation;
pub mod rpc;
pub mod server;
pub mod source;
pub mod subscription;
pub mod txn;

pub use config::{ConnectionConfig, ProtocolVersion};
pub use error::{ErrorCode, Result, SatError};
pub use lsn::Lsn;
pub use relation::{Column, Relation, RelationIdentity, RelationRegistry};
pub use txn::{Change, RowMap, Transaction};
