//! Relation descriptors and the per-connection relation registry.
//!
//! A `relation_id` is a connection-local contract, not a database identity,
//! even when seeded from a PostgreSQL OID. Each connection keeps one
//! registry per direction: entries are added lazily on first use and are
//! never mutated afterwards, so a `relation_id` observed by the peer always
//! resolves to the exact column ordering advertised when it was introduced.
//! Schema changes allocate a new id via a new migration.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, SatError};

/// Stable identity of a table-like schema object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelationIdentity {
    pub schema: String,
    pub table: String,
}

impl RelationIdentity {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        RelationIdentity {
            schema: schema.into(),
            table: table.into(),
        }
    }
}

impl std::fmt::Display for RelationIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    /// PostgreSQL type name, e.g. `int4`, `text`, `timestamptz`.
    pub pg_type: String,
    pub nullable: bool,
    pub part_of_identity: bool,
}

/// A table descriptor: ordered columns plus primary key names.
///
/// Column ordering is stable within one advertised `relation_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub schema: String,
    pub table: String,
    pub columns: Vec<Column>,
    pub primary_keys: Vec<String>,
}

impl Relation {
    pub fn identity(&self) -> RelationIdentity {
        RelationIdentity::new(self.schema.clone(), self.table.clone())
    }
}

/// Connection-local mapping between stable relation identities and the
/// volatile `relation_id` integers advertised to the peer.
///
/// Used in both directions: [`RelationRegistry::resolve`] allocates ids for
/// relations we advertise, [`RelationRegistry::register`] records relations
/// the peer advertised to us.
#[derive(Debug, Default)]
pub struct RelationRegistry {
    by_identity: HashMap<RelationIdentity, u32>,
    by_id: HashMap<u32, Arc<Relation>>,
}

impl RelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up or inserts the outbound entry for `relation`, seeded with
    /// the schema cache's canonical id. Returns `(relation_id, is_new)`;
    /// `is_new` obliges the caller to emit a `Relation` frame before any op
    /// referencing the id.
    pub fn resolve(&mut self, relation: &Arc<Relation>, canonical_id: u32) -> (u32, bool) {
        let identity = relation.identity();
        if let Some(&id) = self.by_identity.get(&identity) {
            return (id, false);
        }
        self.by_identity.insert(identity, canonical_id);
        self.by_id.insert(canonical_id, Arc::clone(relation));
        (canonical_id, true)
    }

    /// Records a relation advertised by the peer. Re-advertising an id with
    /// different columns is a protocol violation; a byte-identical repeat is
    /// tolerated.
    pub fn register(&mut self, relation_id: u32, relation: Relation) -> Result<()> {
        if let Some(existing) = self.by_id.get(&relation_id) {
            if **existing != relation {
                return Err(SatError::Protocol(format!(
                    "relation id {relation_id} re-advertised with a different definition"
                )));
            }
            return Ok(());
        }
        let relation = Arc::new(relation);
        self.by_identity
            .insert(relation.identity(), relation_id);
        self.by_id.insert(relation_id, relation);
        Ok(())
    }

    /// The relation previously introduced under `relation_id`, if any.
    pub fn get(&self, relation_id: u32) -> Option<&Arc<Relation>> {
        self.by_id.get(&relation_id)
    }

    /// The id previously assigned to `identity`, if any.
    pub fn id_of(&self, identity: &RelationIdentity) -> Option<u32> {
        self.by_identity.get(identity).copied()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
