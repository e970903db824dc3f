//! External collaborators the protocol engine consumes.
//!
//! The PostgreSQL-facing half of the broker is out of scope here; the
//! engine sees it through four seams: a WAL source producing transactions
//! in commit order, a schema cache resolving relations at a given schema
//! version, a migration translator turning captured DDL into client-facing
//! statements, and a snapshot data source streaming a subscription's
//! initial rows.
//!
//! Streams are modeled as bounded `mpsc` receivers: the producer owns the
//! pace, and a disconnected consumer cancels by drop.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::lsn::Lsn;
use crate::protocol::messages::{SatShapeReq, SatShapeReqError};
use crate::relation::{Relation, RelationIdentity};
use crate::txn::{Migration, RowMap, Transaction};

/// Why a WAL subscription could not be established at a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalError {
    /// The position is older than the retention window.
    BehindWindow,
    /// The position is ahead of anything this source has produced.
    InvalidPosition,
}

/// The write-ahead-log source: opaque ordered positions plus a transaction
/// stream.
///
/// Positions are totally ordered only by [`WalSource::compare`]; the
/// engine never inspects their bytes.
#[async_trait]
pub trait WalSource: Send + Sync {
    /// Parses a client-supplied raw position. Failure means the client sent
    /// garbage, surfaced as `MALFORMED_LSN`.
    fn parse_position(&self, raw: &[u8]) -> Result<Lsn>;

    /// Renders a position into the raw form clients echo back.
    fn serialize_position(&self, lsn: &Lsn) -> Bytes;

    fn compare(&self, a: &Lsn, b: &Lsn) -> Ordering;

    /// The newest position this source has produced.
    fn head(&self) -> Lsn;

    /// Opens a transaction stream. `None` starts at the current head.
    /// Transactions arrive in strict commit order.
    async fn subscribe(
        &self,
        from: Option<Lsn>,
    ) -> std::result::Result<mpsc::Receiver<Transaction>, WalError>;
}

/// A schema snapshot at one migration version.
#[derive(Debug, Clone)]
pub struct SchemaVersion {
    pub version: String,
    pub relations: Vec<Arc<Relation>>,
}

/// Read-mostly shared schema knowledge, keyed by identity and version.
#[async_trait]
pub trait SchemaCache: Send + Sync {
    /// Whether schema state for `origin` has been loaded at all.
    fn ready(&self, origin: &str) -> bool;

    fn relation(&self, identity: &RelationIdentity) -> Option<Arc<Relation>>;

    /// The canonical id (PostgreSQL OID) used to seed connection-local
    /// relation ids.
    fn relation_oid(&self, identity: &RelationIdentity) -> Option<u32>;

    /// Tables currently exposed to clients.
    fn electrified_tables(&self) -> Vec<RelationIdentity>;

    /// Foreign-key parents of `identity`; a shape including a child table
    /// must also include these.
    fn referenced_tables(&self, identity: &RelationIdentity) -> Vec<RelationIdentity>;

    /// Reconstructs column layouts at `version`. `None` when the version is
    /// unknown, surfaced as `UNKNOWN_SCHEMA_VSN`.
    async fn load(&self, origin: &str, version: &str) -> Option<SchemaVersion>;
}

/// Output of translating one captured DDL row.
#[derive(Debug, Clone, Default)]
pub struct TranslatedDdl {
    /// At most one client-facing migration op per DDL row.
    pub op: Option<Migration>,
    /// Relations created or reshaped by this DDL.
    pub new_relations: Vec<Arc<Relation>>,
}

/// Translates captured DDL into target-dialect statements. Stable and
/// deterministic: the same input always yields the same output.
pub trait MigrationTranslator: Send + Sync {
    fn translate(&self, version: &str, ddl_sql: &str) -> Result<TranslatedDdl>;
}

/// One item of a subscription's initial snapshot stream.
#[derive(Debug, Clone)]
pub enum SnapshotItem {
    /// Opens one shape's data, in request order.
    ShapeBegin { request_id: String, uuid: String },
    /// A chunk of initial rows for the open shape.
    Rows {
        relation: RelationIdentity,
        rows: Vec<RowMap>,
    },
    /// Closes the open shape.
    ShapeEnd,
    /// Delivery failed; sent instead of remaining items.
    Failed { errors: Vec<SatShapeReqError> },
}

/// Streams the initial rows of a subscription's shapes with an attached
/// consistent position.
#[async_trait]
pub trait SubscriptionDataSource: Send + Sync {
    /// Starts a snapshot. The returned position is the point at which the
    /// snapshot is consistent; it may equal the position of the transaction
    /// emitted immediately before it.
    async fn snapshot(
        &self,
        subscription_id: &str,
        shapes: &[SatShapeReq],
    ) -> Result<(Lsn, mpsc::Receiver<SnapshotItem>)>;
}
