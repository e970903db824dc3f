//! Per-connection replication cursor and `startReplication` validation.
//!
//! The cursor tracks the newest position emitted to the peer and the
//! schema version its row encodings are pinned to. It advances
//! monotonically under the WAL source's comparator and is only overwritten
//! by a client-requested resume.

use std::collections::HashSet;

use crate::error::{Result, SatError, StartReplicationErrorCode};
use crate::lsn::Lsn;
use crate::protocol::messages::{SatInStartReplicationReq, SatReplicationError};
use crate::source::{SchemaCache, WalSource};
use crate::subscription::SubscriptionStore;

#[derive(Debug, Default)]
pub struct ReplicationCursor {
    position: Option<Lsn>,
    schema_version: Option<String>,
}

impl ReplicationCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self) -> Option<&Lsn> {
        self.position.as_ref()
    }

    pub fn schema_version(&self) -> Option<&str> {
        self.schema_version.as_deref()
    }

    /// Overwrites the cursor for a client-requested resume.
    pub fn resume(&mut self, position: Option<Lsn>, schema_version: Option<String>) {
        self.position = position;
        self.schema_version = schema_version;
    }

    /// Advances to `lsn`. Positions must be strictly increasing; the WAL
    /// source delivers transactions in commit order and the serializer
    /// must not reorder them, so a regression here is a bug upstream.
    pub fn advance(&mut self, wal: &dyn WalSource, lsn: Lsn) -> Result<()> {
        if let Some(current) = &self.position {
            if wal.compare(&lsn, current) != std::cmp::Ordering::Greater {
                return Err(SatError::Internal(format!(
                    "transaction position {lsn} does not advance past {current}"
                )));
            }
        }
        self.position = Some(lsn);
        Ok(())
    }
}

/// A validated `startReplication` request, ready to open the WAL stream.
#[derive(Debug)]
pub struct StartPlan {
    /// `None` means start at the server's current position.
    pub resume_from: Option<Lsn>,
    pub schema_version: Option<String>,
    /// Subscriptions the client chose to keep; only their tables flow.
    pub resumed_subscriptions: HashSet<String>,
}

/// Validates a `startReplication` request against the WAL source, schema
/// cache and the client's known subscriptions.
///
/// Window and position errors (`BEHIND_WINDOW`, `INVALID_POSITION`)
/// surface later, when the WAL subscription is actually opened.
pub async fn validate_start(
    req: &SatInStartReplicationReq,
    wal: &dyn WalSource,
    schema: &dyn SchemaCache,
    origin: &str,
    subscriptions: &SubscriptionStore,
) -> std::result::Result<StartPlan, SatReplicationError> {
    let resume_from = if req.lsn.is_empty() {
        None
    } else {
        match wal.parse_position(&req.lsn) {
            Ok(lsn) => Some(lsn),
            Err(_) => {
                return Err(SatReplicationError::new(
                    StartReplicationErrorCode::MalformedLsn,
                    "could not parse resume position",
                ));
            }
        }
    };

    if let Some(version) = &req.schema_version {
        if schema.load(origin, version).await.is_none() {
            return Err(SatReplicationError::new(
                StartReplicationErrorCode::UnknownSchemaVsn,
                format!("cannot reconstruct schema at version {version}"),
            ));
        }
    }

    for id in &req.subscription_ids {
        if !subscriptions.contains(id) {
            return Err(SatReplicationError::new(
                StartReplicationErrorCode::SubscriptionNotFound,
                format!("unknown subscription: {id}"),
            ));
        }
    }

    Ok(StartPlan {
        resume_from,
        schema_version: req.schema_version.clone(),
        resumed_subscriptions: req.subscription_ids.iter().cloned().collect(),
    })
}
