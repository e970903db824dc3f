//! Per-connection server side of the protocol.
//!
//! One [`Connection`] per peer. The connection runs as a single task over a
//! split transport: a spawned reader pushes decoded frames into a channel,
//! and the main loop multiplexes them with WAL transactions and snapshot
//! items, so all per-connection state stays single-writer.

mod connection;

pub use connection::{Connection, ServerDeps};
