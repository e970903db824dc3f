//! Internal transaction and change model.
//!
//! A [`Transaction`] is an ordered sequence of [`Change`]s plus commit
//! metadata. Transactions arrive from the WAL source in strict commit order
//! and leave the connection as a single op-log frame; inbound op-log frames
//! are reassembled into this same shape.
//!
//! A transaction is either entirely a migration or entirely DML; the two
//! never mix on the wire.

use std::collections::HashMap;

use crate::lsn::Lsn;
use crate::relation::RelationIdentity;

/// Decoded row image: column name to value, `None` for SQL NULL.
///
/// `Some(String::new())` is the literal empty string, which is distinct
/// from NULL; the wire encoding keeps them apart via the NULL bitmask.
pub type RowMap = HashMap<String, Option<String>>;

/// Dependency tag attached to row images: `<origin>@<commit_ts_micros>`.
///
/// Clients use these for conflict-resolution decisions; the server only
/// mints and forwards them.
pub fn origin_tag(origin: &str, commit_timestamp: u64) -> String {
    format!("{origin}@{commit_timestamp}")
}

/// One translated DDL statement within a migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStmt {
    pub kind: MigrationStmtKind,
    pub sql: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStmtKind {
    CreateTable,
    CreateIndex,
    AlterAddColumn,
}

impl MigrationStmtKind {
    pub fn to_wire(self) -> u64 {
        match self {
            MigrationStmtKind::CreateTable => 0,
            MigrationStmtKind::CreateIndex => 1,
            MigrationStmtKind::AlterAddColumn => 2,
        }
    }

    pub fn from_wire(v: u64) -> Option<Self> {
        match v {
            0 => Some(MigrationStmtKind::CreateTable),
            1 => Some(MigrationStmtKind::CreateIndex),
            2 => Some(MigrationStmtKind::AlterAddColumn),
            _ => None,
        }
    }
}

/// Target-dialect table descriptor carried alongside a migration so the
/// client can build its local schema without parsing SQL.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<TableColumnDef>,
    pub fks: Vec<ForeignKeyDef>,
    pub pks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableColumnDef {
    pub name: String,
    pub pg_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyDef {
    pub fk_cols: Vec<String>,
    pub pk_table: String,
    pub pk_cols: Vec<String>,
}

/// A translated schema migration, client-facing form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: String,
    pub stmts: Vec<MigrationStmt>,
    pub table: Option<TableDef>,
}

/// A single row operation or schema change within a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Insert {
        relation: RelationIdentity,
        new: RowMap,
        tags: Vec<String>,
    },
    Update {
        relation: RelationIdentity,
        /// `None` means "no previous image" (replica identity did not cover it).
        old: Option<RowMap>,
        new: RowMap,
        tags: Vec<String>,
    },
    Delete {
        relation: RelationIdentity,
        old: Option<RowMap>,
        tags: Vec<String>,
    },
    /// A DDL row captured by the source's event triggers, not yet
    /// translated. Server-side only; never appears on the wire.
    Ddl { version: String, sql: String },
    /// A translated migration as shipped to clients.
    Migrate(Migration),
}

impl Change {
    /// The relation a data change targets; `None` for schema changes.
    pub fn relation(&self) -> Option<&RelationIdentity> {
        match self {
            Change::Insert { relation, .. }
            | Change::Update { relation, .. }
            | Change::Delete { relation, .. } => Some(relation),
            Change::Ddl { .. } | Change::Migrate(_) => None,
        }
    }

    pub fn is_ddl(&self) -> bool {
        matches!(self, Change::Ddl { .. } | Change::Migrate(_))
    }
}

/// An ordered sequence of changes with commit metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    /// Microseconds since the Unix epoch.
    pub commit_timestamp: u64,
    pub trans_id: String,
    pub lsn: Lsn,
    /// Identifier of the database instance that produced this transaction.
    /// Always populated on outbound transactions; inbound values are
    /// preserved as received, empty included.
    pub origin: Option<String>,
    pub is_migration: bool,
    pub changes: Vec<Change>,
}

impl Transaction {
    pub fn new(commit_timestamp: u64, trans_id: impl Into<String>, lsn: Lsn) -> Self {
        Transaction {
            commit_timestamp,
            trans_id: trans_id.into(),
            lsn,
            origin: None,
            is_migration: false,
            changes: Vec::new(),
        }
    }

    /// True when any change is a schema change. Such a transaction must not
    /// carry DML.
    pub fn has_ddl(&self) -> bool {
        self.changes.iter().any(Change::is_ddl)
    }
}
