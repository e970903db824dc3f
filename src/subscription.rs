//! Subscription lifecycle and initial snapshot delivery.
//!
//! A subscription is a client-named selection of shapes. `subscribe`
//! validates the shapes and acks immediately; the initial snapshot is then
//! delivered asynchronously on the frame stream, bracketed by
//! `SubsDataBegin`/`SubsDataEnd` with one `ShapeDataBegin`/`ShapeDataEnd`
//! pair per shape in request order. Live op-log frames may interleave
//! inside the bracket; clients distinguish snapshot rows by tracking it.
//!
//! Delivery is sequential per connection: one open bracket at a time,
//! FIFO across subscriptions. `unsubscribe` removes a still-queued
//! delivery but never truncates an open bracket.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{Result, ShapeRequestErrorCode, SubsDataErrorCode, SubsErrorCode};
use crate::lsn::Lsn;
use crate::protocol::framing::Frame;
use crate::protocol::messages::{
    SatOpInsert, SatOpLog, SatShapeDataBegin, SatShapeDataEnd, SatShapeReq, SatShapeReqError,
    SatSubsDataBegin, SatSubsDataEnd, SatSubsDataError, SatSubsError, SatTransOp,
};
use crate::protocol::oplog::resolve_relation;
use crate::protocol::row::encode_row;
use crate::relation::RelationRegistry;
use crate::source::{SchemaCache, SnapshotItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Acked, snapshot not yet started.
    Requested,
    /// Snapshot bracket in progress; the subscription's tables already
    /// count toward the live-replication filter.
    Delivering,
    /// Snapshot fully delivered.
    Active,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: String,
    pub shapes: Vec<SatShapeReq>,
    pub status: SubscriptionStatus,
    /// The position its snapshot was consistent at, once known.
    pub established_at_lsn: Option<Lsn>,
}

/// Per-client store of known subscriptions.
///
/// Single-writer: only the owning connection task touches it.
#[derive(Debug, Default)]
pub struct SubscriptionStore {
    subs: HashMap<String, Subscription>,
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and inserts a new subscription. Duplicate ids and invalid
    /// shapes are reported as the typed subscribe error.
    pub fn insert(
        &mut self,
        subscription_id: &str,
        shapes: Vec<SatShapeReq>,
        schema: &dyn SchemaCache,
    ) -> std::result::Result<(), SatSubsError> {
        if self.subs.contains_key(subscription_id) {
            return Err(SatSubsError {
                code: SubsErrorCode::SubscriptionIdAlreadyExists,
                message: format!("subscription {subscription_id} already exists"),
                shape_request_error: Vec::new(),
            });
        }
        let shape_errors = validate_shapes(&shapes, schema);
        if !shape_errors.is_empty() {
            return Err(SatSubsError {
                code: SubsErrorCode::ShapeRequestError,
                message: "invalid shape request".into(),
                shape_request_error: shape_errors,
            });
        }
        self.subs.insert(
            subscription_id.to_string(),
            Subscription {
                id: subscription_id.to_string(),
                shapes,
                status: SubscriptionStatus::Requested,
                established_at_lsn: None,
            },
        );
        Ok(())
    }

    /// Removes subscriptions; unknown ids are silently tolerated, so the
    /// operation is idempotent.
    pub fn remove(&mut self, subscription_ids: &[String]) {
        for id in subscription_ids {
            self.subs.remove(id);
        }
    }

    pub fn contains(&self, subscription_id: &str) -> bool {
        self.subs.contains_key(subscription_id)
    }

    pub fn get(&self, subscription_id: &str) -> Option<&Subscription> {
        self.subs.get(subscription_id)
    }

    pub fn mark_delivering(&mut self, subscription_id: &str, lsn: Lsn) {
        if let Some(sub) = self.subs.get_mut(subscription_id) {
            sub.status = SubscriptionStatus::Delivering;
            sub.established_at_lsn = Some(lsn);
        }
    }

    pub fn mark_active(&mut self, subscription_id: &str) {
        if let Some(sub) = self.subs.get_mut(subscription_id) {
            sub.status = SubscriptionStatus::Active;
        }
    }

    pub fn mark_cancelled(&mut self, subscription_id: &str) {
        if let Some(sub) = self.subs.get_mut(subscription_id) {
            sub.status = SubscriptionStatus::Cancelled;
        }
    }

    /// Table names whose live changes flow to a client that resumed with
    /// `resumed` (plus anything activated since). Tables of dropped
    /// subscriptions never leak into a resumed stream.
    pub fn live_tables(&self, resumed: &HashSet<String>) -> HashSet<String> {
        let mut tables = HashSet::new();
        for sub in self.subs.values() {
            let counted = match sub.status {
                SubscriptionStatus::Delivering | SubscriptionStatus::Active => {
                    resumed.contains(&sub.id)
                }
                SubscriptionStatus::Requested | SubscriptionStatus::Cancelled => false,
            };
            if counted {
                for shape in &sub.shapes {
                    for select in &shape.shape_definition.selects {
                        tables.insert(select.tablename.clone());
                    }
                }
            }
        }
        tables
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }
}

/// Static shape validation against the current schema.
fn validate_shapes(shapes: &[SatShapeReq], schema: &dyn SchemaCache) -> Vec<SatShapeReqError> {
    let mut errors = Vec::new();
    let known: HashSet<String> = schema
        .electrified_tables()
        .into_iter()
        .map(|i| i.table)
        .collect();
    let by_table: HashMap<String, crate::relation::RelationIdentity> = schema
        .electrified_tables()
        .into_iter()
        .map(|i| (i.table.clone(), i))
        .collect();

    let mut seen_tables: HashSet<&str> = HashSet::new();
    let mut requested: HashSet<&str> = HashSet::new();
    for shape in shapes {
        for select in &shape.shape_definition.selects {
            requested.insert(select.tablename.as_str());
        }
    }

    for shape in shapes {
        if shape.shape_definition.selects.is_empty() {
            errors.push(SatShapeReqError {
                code: ShapeRequestErrorCode::EmptyShapeDefinition,
                message: "shape selects no tables".into(),
                request_id: shape.request_id.clone(),
            });
            continue;
        }
        for select in &shape.shape_definition.selects {
            let table = select.tablename.as_str();
            if !seen_tables.insert(table) {
                errors.push(SatShapeReqError {
                    code: ShapeRequestErrorCode::DuplicateTableInShapeDefinition,
                    message: format!("table {table} requested more than once"),
                    request_id: shape.request_id.clone(),
                });
                continue;
            }
            if !known.contains(table) {
                errors.push(SatShapeReqError {
                    code: ShapeRequestErrorCode::TableNotFound,
                    message: format!("unknown table: {table}"),
                    request_id: shape.request_id.clone(),
                });
                continue;
            }
            if let Some(identity) = by_table.get(table) {
                for parent in schema.referenced_tables(identity) {
                    if !requested.contains(parent.table.as_str()) {
                        errors.push(SatShapeReqError {
                            code: ShapeRequestErrorCode::ReferentialIntegrityViolation,
                            message: format!(
                                "table {table} references {} which is not in the subscription",
                                parent.table
                            ),
                            request_id: shape.request_id.clone(),
                        });
                    }
                }
            }
        }
    }
    errors
}

/// How an open snapshot delivery ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Completed,
    Failed,
}

/// Frames produced by feeding one snapshot item to the delivery.
#[derive(Debug)]
pub struct DeliveryStep {
    pub frames: Vec<Frame>,
    pub outcome: Option<DeliveryOutcome>,
}

/// Drives one subscription's snapshot bracket over the frame stream.
///
/// The item stream comes from the subscription data source; dropping the
/// delivery aborts it without touching the store.
#[derive(Debug)]
pub struct SnapshotDelivery {
    pub subscription_id: String,
    pub lsn: Lsn,
    shape_open: bool,
}

impl SnapshotDelivery {
    pub fn new(subscription_id: impl Into<String>, lsn: Lsn) -> Self {
        SnapshotDelivery {
            subscription_id: subscription_id.into(),
            lsn,
            shape_open: false,
        }
    }

    /// The bracket-opening frame; emitted once before any item.
    pub fn begin_frame(&self) -> Frame {
        Frame::SubsDataBegin(SatSubsDataBegin {
            subscription_id: self.subscription_id.clone(),
            lsn: self.lsn.to_bytes(),
        })
    }

    /// Converts the next item from the data source into frames. `None`
    /// (stream end) closes the bracket.
    pub fn handle_item(
        &mut self,
        item: Option<SnapshotItem>,
        registry: &mut RelationRegistry,
        schema: &dyn SchemaCache,
    ) -> Result<DeliveryStep> {
        match item {
            Some(SnapshotItem::ShapeBegin { request_id, uuid }) => {
                self.shape_open = true;
                Ok(DeliveryStep {
                    frames: vec![Frame::ShapeDataBegin(SatShapeDataBegin { request_id, uuid })],
                    outcome: None,
                })
            }
            Some(SnapshotItem::Rows { relation, rows }) => {
                let mut frames = Vec::new();
                let (relation_id, rel) =
                    resolve_relation(&relation, registry, schema, &mut frames)?;
                // Snapshot rows are bare inserts: no Begin/Commit framing.
                let ops = rows
                    .iter()
                    .map(|row| {
                        SatTransOp::Insert(SatOpInsert {
                            relation_id,
                            row_data: Some(encode_row(row, &rel.columns)),
                            tags: Vec::new(),
                        })
                    })
                    .collect();
                frames.push(Frame::OpLog(SatOpLog { ops }));
                Ok(DeliveryStep {
                    frames,
                    outcome: None,
                })
            }
            Some(SnapshotItem::ShapeEnd) => {
                self.shape_open = false;
                Ok(DeliveryStep {
                    frames: vec![Frame::ShapeDataEnd(SatShapeDataEnd)],
                    outcome: None,
                })
            }
            Some(SnapshotItem::Failed { errors }) => Ok(DeliveryStep {
                frames: vec![Frame::SubsDataError(SatSubsDataError {
                    code: SubsDataErrorCode::ShapeDeliveryError,
                    message: "snapshot delivery failed".into(),
                    subscription_id: self.subscription_id.clone(),
                    shape_request_error: errors,
                })],
                outcome: Some(DeliveryOutcome::Failed),
            }),
            None => {
                let mut frames = Vec::new();
                if self.shape_open {
                    // Source went away mid-shape; the bracket still closes.
                    frames.push(Frame::ShapeDataEnd(SatShapeDataEnd));
                }
                frames.push(Frame::SubsDataEnd(SatSubsDataEnd));
                Ok(DeliveryStep {
                    frames,
                    outcome: Some(DeliveryOutcome::Completed),
                })
            }
        }
    }
}

/// FIFO queue of snapshots awaiting delivery on one connection.
#[derive(Debug, Default)]
pub struct DeliveryQueue {
    pending: VecDeque<String>,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, subscription_id: String) {
        self.pending.push_back(subscription_id);
    }

    pub fn pop(&mut self) -> Option<String> {
        self.pending.pop_front()
    }

    /// Drops queued deliveries for unsubscribed ids.
    pub fn discard(&mut self, subscription_ids: &[String]) {
        self.pending.retain(|id| !subscription_ids.contains(id));
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
