//! Transaction serialization and reassembly over op-log frames.
//!
//! Outbound: [`serialize_transaction`] turns one internal transaction into
//! an ordered list of frames - `Relation` advertisements for
//! first-use relations, then exactly one `OpLog` frame bracketed by
//! Begin/Commit. Changes against the internal extension schema are
//! infrastructure and dropped; captured DDL is translated into migration
//! ops. A transaction with nothing left after filtering emits no frames.
//!
//! Inbound: [`TransactionAssembler`] consumes the peer's `Relation` and
//! `OpLog` frames and yields whole transactions, enforcing Begin/Commit
//! framing. Framing violations are fatal for the connection.

use std::sync::Arc;

use crate::error::{Result, SatError};
use crate::lsn::Lsn;
use crate::protocol::framing::Frame;
use crate::protocol::messages::{
    SatOpBegin, SatOpCommit, SatOpDelete, SatOpInsert, SatOpLog, SatOpMigrate, SatOpRow,
    SatOpUpdate, SatRelation, SatTransOp,
};
use crate::protocol::row::{decode_row, encode_row};
use crate::relation::{Relation, RelationIdentity, RelationRegistry};
use crate::source::{MigrationTranslator, SchemaCache};
use crate::txn::{Change, Transaction};

/// Schema owned by the broker itself; rows under it are never replicated.
pub const INTERNAL_SCHEMA: &str = "electric";

/// Resolves `identity` against the registry, appending a `Relation` frame
/// on first use so the advertisement precedes any op referencing the id.
pub(crate) fn resolve_relation(
    identity: &RelationIdentity,
    registry: &mut RelationRegistry,
    schema: &dyn SchemaCache,
    frames: &mut Vec<Frame>,
) -> Result<(u32, Arc<Relation>)> {
    let relation = schema.relation(identity).ok_or_else(|| {
        SatError::Internal(format!("relation {identity} missing from schema cache"))
    })?;
    let oid = schema.relation_oid(identity).ok_or_else(|| {
        SatError::Internal(format!("relation {identity} has no canonical id"))
    })?;
    let (relation_id, is_new) = registry.resolve(&relation, oid);
    if is_new {
        frames.push(Frame::Relation(SatRelation::from_relation(
            relation_id,
            &relation,
        )));
    }
    Ok((relation_id, relation))
}

/// Serializes one transaction into frames, in emission order.
///
/// `server_origin` is stamped on `Begin.origin` when the transaction does
/// not carry its own origin.
pub fn serialize_transaction(
    txn: &Transaction,
    server_origin: &str,
    registry: &mut RelationRegistry,
    schema: &dyn SchemaCache,
    translator: &dyn MigrationTranslator,
) -> Result<Vec<Frame>> {
    let mut frames = Vec::new();
    let mut ops: Vec<SatTransOp> = Vec::new();
    let mut migration_version: Option<String> = None;
    let mut has_dml = false;

    let check_version = |version: &str, seen: &mut Option<String>| -> Result<()> {
        match seen {
            Some(v) if v != version => Err(SatError::InvalidMigration(format!(
                "transaction mixes migration versions {v} and {version}"
            ))),
            Some(_) => Ok(()),
            None => {
                *seen = Some(version.to_string());
                Ok(())
            }
        }
    };

    for change in &txn.changes {
        if let Some(identity) = change.relation() {
            if identity.schema == INTERNAL_SCHEMA {
                continue;
            }
        }

        match change {
            Change::Ddl { version, sql } => {
                check_version(version, &mut migration_version)?;
                let translated = translator.translate(version, sql)?;
                if let Some(migration) = translated.op {
                    ops.push(SatTransOp::Migrate(SatOpMigrate::from_migration(&migration)));
                }
            }
            Change::Migrate(migration) => {
                check_version(&migration.version, &mut migration_version)?;
                ops.push(SatTransOp::Migrate(SatOpMigrate::from_migration(migration)));
            }
            Change::Insert {
                relation,
                new,
                tags,
            } => {
                has_dml = true;
                let (relation_id, rel) =
                    resolve_relation(relation, registry, schema, &mut frames)?;
                ops.push(SatTransOp::Insert(SatOpInsert {
                    relation_id,
                    row_data: Some(encode_row(new, &rel.columns)),
                    tags: tags.clone(),
                }));
            }
            Change::Update {
                relation,
                old,
                new,
                tags,
            } => {
                has_dml = true;
                let (relation_id, rel) =
                    resolve_relation(relation, registry, schema, &mut frames)?;
                ops.push(SatTransOp::Update(SatOpUpdate {
                    relation_id,
                    row_data: Some(encode_row(new, &rel.columns)),
                    old_row_data: old.as_ref().map(|o| encode_row(o, &rel.columns)),
                    tags: tags.clone(),
                }));
            }
            Change::Delete {
                relation,
                old,
                tags,
            } => {
                has_dml = true;
                let (relation_id, rel) =
                    resolve_relation(relation, registry, schema, &mut frames)?;
                ops.push(SatTransOp::Delete(SatOpDelete {
                    relation_id,
                    old_row_data: old.as_ref().map(|o| encode_row(o, &rel.columns)),
                    tags: tags.clone(),
                }));
            }
        }
    }

    if ops.is_empty() {
        return Ok(Vec::new());
    }

    let is_migration = migration_version.is_some();
    if is_migration && has_dml {
        return Err(SatError::InvalidMigration(
            "transaction mixes DDL and DML".into(),
        ));
    }

    let begin = SatOpBegin {
        commit_timestamp: txn.commit_timestamp,
        trans_id: txn.trans_id.clone(),
        lsn: txn.lsn.to_bytes(),
        origin: Some(
            txn.origin
                .clone()
                .unwrap_or_else(|| server_origin.to_string()),
        ),
        is_migration,
    };
    let commit = SatOpCommit {
        commit_timestamp: txn.commit_timestamp,
        trans_id: txn.trans_id.clone(),
        lsn: txn.lsn.to_bytes(),
    };

    let mut all_ops = Vec::with_capacity(ops.len() + 2);
    all_ops.push(SatTransOp::Begin(begin));
    all_ops.extend(ops);
    all_ops.push(SatTransOp::Commit(commit));
    frames.push(Frame::OpLog(SatOpLog { ops: all_ops }));

    Ok(frames)
}

#[derive(Debug)]
struct PartialTransaction {
    begin: SatOpBegin,
    changes: Vec<Change>,
}

/// Reassembles inbound op-log frames into whole transactions.
///
/// Holds the peer-advertised relation registry and the current partial
/// transaction slot. One assembler per connection direction.
#[derive(Debug, Default)]
pub struct TransactionAssembler {
    relations: RelationRegistry,
    partial: Option<PartialTransaction>,
}

impl TransactionAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a relation advertised by the peer.
    pub fn handle_relation(&mut self, msg: &SatRelation) -> Result<()> {
        self.relations.register(msg.relation_id, msg.to_relation())
    }

    /// Feeds one op-log frame; returns every transaction completed by it.
    pub fn handle_oplog(&mut self, msg: SatOpLog) -> Result<Vec<Transaction>> {
        let mut complete = Vec::new();

        for op in msg.ops {
            match op {
                SatTransOp::Begin(begin) => {
                    if self.partial.is_some() {
                        return Err(SatError::Protocol(
                            "begin inside an open transaction".into(),
                        ));
                    }
                    if begin.lsn.is_empty() {
                        return Err(SatError::Protocol("begin with empty lsn".into()));
                    }
                    self.partial = Some(PartialTransaction {
                        begin,
                        changes: Vec::new(),
                    });
                }
                SatTransOp::Commit(commit) => {
                    let partial = self.partial.take().ok_or_else(|| {
                        SatError::Protocol("commit without an open transaction".into())
                    })?;
                    complete.push(Transaction {
                        commit_timestamp: commit.commit_timestamp,
                        trans_id: commit.trans_id,
                        lsn: Lsn::new(partial.begin.lsn),
                        origin: partial.begin.origin,
                        is_migration: partial.begin.is_migration,
                        changes: partial.changes,
                    });
                }
                SatTransOp::Insert(op) => {
                    let change = self.decode_insert(op)?;
                    self.append(change)?;
                }
                SatTransOp::Update(op) => {
                    let change = self.decode_update(op)?;
                    self.append(change)?;
                }
                SatTransOp::Delete(op) => {
                    let change = self.decode_delete(op)?;
                    self.append(change)?;
                }
                SatTransOp::Migrate(op) => {
                    let migration = op
                        .to_migration()
                        .map_err(|e| SatError::Protocol(e.to_string()))?;
                    self.append(Change::Migrate(migration))?;
                }
            }
        }

        Ok(complete)
    }

    fn append(&mut self, change: Change) -> Result<()> {
        match &mut self.partial {
            Some(partial) => {
                partial.changes.push(change);
                Ok(())
            }
            None => Err(SatError::Protocol(
                "row operation outside a transaction".into(),
            )),
        }
    }

    fn relation_for(&self, relation_id: u32) -> Result<&Arc<Relation>> {
        self.relations.get(relation_id).ok_or_else(|| {
            SatError::Protocol(format!("unknown relation id: {relation_id}"))
        })
    }

    fn decode_insert(&self, op: SatOpInsert) -> Result<Change> {
        let relation = self.relation_for(op.relation_id)?;
        let row = op
            .row_data
            .ok_or_else(|| SatError::Protocol("insert without row data".into()))?;
        let new = decode_row(&row, &relation.columns)?;
        Ok(Change::Insert {
            relation: relation.identity(),
            new,
            tags: op.tags,
        })
    }

    fn decode_update(&self, op: SatOpUpdate) -> Result<Change> {
        let relation = self.relation_for(op.relation_id)?;
        let row = op
            .row_data
            .ok_or_else(|| SatError::Protocol("update without new row data".into()))?;
        let new = decode_row(&row, &relation.columns)?;
        let old = decode_optional_row(op.old_row_data, relation)?;
        Ok(Change::Update {
            relation: relation.identity(),
            old,
            new,
            tags: op.tags,
        })
    }

    fn decode_delete(&self, op: SatOpDelete) -> Result<Change> {
        let relation = self.relation_for(op.relation_id)?;
        let old = decode_optional_row(op.old_row_data, relation)?;
        Ok(Change::Delete {
            relation: relation.identity(),
            old,
            tags: op.tags,
        })
    }
}

/// An absent or empty previous image decodes to the "no previous image"
/// sentinel.
fn decode_optional_row(
    row: Option<SatOpRow>,
    relation: &Arc<Relation>,
) -> Result<Option<crate::txn::RowMap>> {
    match row {
        None => Ok(None),
        Some(r) if r.values.is_empty() => Ok(None),
        Some(r) => Ok(Some(decode_row(&r, &relation.columns)?)),
    }
}
