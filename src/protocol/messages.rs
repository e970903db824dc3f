//! The closed catalog of protocol messages.
//!
//! Every message encodes to a field-tagged payload via
//! [`wire`](crate::protocol::wire) and is carried inside a frame tagged by
//! [`FrameType`](crate::protocol::framing::FrameType). Decoders tolerate
//! unknown field numbers (skipped) but reject wire-type and range errors.
//!
//! Conventions: absence of an optional nested message means "not present"
//! (e.g. no previous row image); scalar fields decode to their default when
//! omitted.

use bytes::{Bytes, BytesMut};

use crate::error::{
    ErrorCode, Result, SatError, ShapeRequestErrorCode, StartReplicationErrorCode,
    SubsDataErrorCode, SubsErrorCode,
};
use crate::protocol::wire::{put_bool, put_bytes, put_str, put_uint, FieldReader};
use crate::relation::{Column, Relation};
use crate::txn::{
    ForeignKeyDef, Migration, MigrationStmt, MigrationStmtKind, TableColumnDef, TableDef,
};

fn put_nested(buf: &mut BytesMut, field: u32, encode: impl FnOnce(&mut BytesMut)) {
    let mut body = BytesMut::new();
    encode(&mut body);
    put_bytes(buf, field, &body);
}

fn to_bytes(encode: impl FnOnce(&mut BytesMut)) -> Bytes {
    let mut buf = BytesMut::new();
    encode(&mut buf);
    buf.freeze()
}

// ---------------------------------------------------------------------------
// RPC envelope
// ---------------------------------------------------------------------------

/// An RPC call envelope. Either peer may send one.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SatRpcRequest {
    pub method: String,
    /// Sender-chosen id, unique among the sender's outstanding requests.
    pub request_id: u32,
    /// Method-specific payload, itself an encoded message.
    pub message: Bytes,
}

impl SatRpcRequest {
    pub fn encode(&self, buf: &mut BytesMut) {
        put_str(buf, 1, &self.method);
        put_uint(buf, 2, u64::from(self.request_id));
        put_bytes(buf, 3, &self.message);
    }

    pub fn encode_to_bytes(&self) -> Bytes {
        to_bytes(|b| self.encode(b))
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        let mut msg = SatRpcRequest::default();
        let mut rd = FieldReader::new(payload);
        while let Some((field, value)) = rd.next()? {
            match field {
                1 => msg.method = value.string()?,
                2 => msg.request_id = value.u32()?,
                3 => msg.message = value.bytes()?,
                _ => {}
            }
        }
        if msg.method.is_empty() {
            return Err(SatError::Frame("rpc request without method".into()));
        }
        Ok(msg)
    }
}

/// The outcome carried by an RPC response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcResult {
    Ok(Bytes),
    Err(SatErrorResp),
}

/// An RPC response envelope; echoes the request's method and id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatRpcResponse {
    pub method: String,
    pub request_id: u32,
    pub result: RpcResult,
}

impl SatRpcResponse {
    pub fn ok(method: impl Into<String>, request_id: u32, message: Bytes) -> Self {
        SatRpcResponse {
            method: method.into(),
            request_id,
            result: RpcResult::Ok(message),
        }
    }

    pub fn error(method: impl Into<String>, request_id: u32, err: SatErrorResp) -> Self {
        SatRpcResponse {
            method: method.into(),
            request_id,
            result: RpcResult::Err(err),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        put_str(buf, 1, &self.method);
        put_uint(buf, 2, u64::from(self.request_id));
        match &self.result {
            RpcResult::Ok(message) => put_bytes(buf, 3, message),
            RpcResult::Err(err) => put_nested(buf, 4, |b| err.encode(b)),
        }
    }

    pub fn encode_to_bytes(&self) -> Bytes {
        to_bytes(|b| self.encode(b))
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        let mut method = String::new();
        let mut request_id = 0u32;
        let mut result = None;
        let mut rd = FieldReader::new(payload);
        while let Some((field, value)) = rd.next()? {
            match field {
                1 => method = value.string()?,
                2 => request_id = value.u32()?,
                3 => result = Some(RpcResult::Ok(value.bytes()?)),
                4 => result = Some(RpcResult::Err(SatErrorResp::decode(value.bytes()?)?)),
                _ => {}
            }
        }
        let result =
            result.ok_or_else(|| SatError::Frame("rpc response carries no result".into()))?;
        Ok(SatRpcResponse {
            method,
            request_id,
            result,
        })
    }
}

/// A typed protocol error, used both as RPC error payload and as the
/// best-effort message sent before closing on a fatal violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatErrorResp {
    pub code: ErrorCode,
    pub message: String,
}

impl SatErrorResp {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        SatErrorResp {
            code,
            message: message.into(),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        put_uint(buf, 1, self.code.to_wire());
        put_str(buf, 2, &self.message);
    }

    pub fn encode_to_bytes(&self) -> Bytes {
        to_bytes(|b| self.encode(b))
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        let mut code = ErrorCode::Internal;
        let mut message = String::new();
        let mut rd = FieldReader::new(payload);
        while let Some((field, value)) = rd.next()? {
            match field {
                1 => code = ErrorCode::from_wire(value.uint()?)?,
                2 => message = value.string()?,
                _ => {}
            }
        }
        Ok(SatErrorResp { code, message })
    }
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SatAuthHeaderPair {
    pub key: String,
    pub value: String,
}

impl SatAuthHeaderPair {
    pub fn encode(&self, buf: &mut BytesMut) {
        put_str(buf, 1, &self.key);
        put_str(buf, 2, &self.value);
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        let mut msg = SatAuthHeaderPair::default();
        let mut rd = FieldReader::new(payload);
        while let Some((field, value)) = rd.next()? {
            match field {
                1 => msg.key = value.string()?,
                2 => msg.value = value.string()?,
                _ => {}
            }
        }
        Ok(msg)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SatAuthReq {
    pub id: String,
    pub token: String,
    pub headers: Vec<SatAuthHeaderPair>,
}

impl SatAuthReq {
    pub fn encode(&self, buf: &mut BytesMut) {
        put_str(buf, 1, &self.id);
        put_str(buf, 2, &self.token);
        for h in &self.headers {
            put_nested(buf, 3, |b| h.encode(b));
        }
    }

    pub fn encode_to_bytes(&self) -> Bytes {
        to_bytes(|b| self.encode(b))
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        let mut msg = SatAuthReq::default();
        let mut rd = FieldReader::new(payload);
        while let Some((field, value)) = rd.next()? {
            match field {
                1 => msg.id = value.string()?,
                2 => msg.token = value.string()?,
                3 => msg.headers.push(SatAuthHeaderPair::decode(value.bytes()?)?),
                _ => {}
            }
        }
        Ok(msg)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SatAuthResp {
    /// The server's identity, echoed to the client.
    pub id: String,
}

impl SatAuthResp {
    pub fn encode(&self, buf: &mut BytesMut) {
        put_str(buf, 1, &self.id);
    }

    pub fn encode_to_bytes(&self) -> Bytes {
        to_bytes(|b| self.encode(b))
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        let mut msg = SatAuthResp::default();
        let mut rd = FieldReader::new(payload);
        while let Some((field, value)) = rd.next()? {
            if field == 1 {
                msg.id = value.string()?;
            }
        }
        Ok(msg)
    }
}

// ---------------------------------------------------------------------------
// Replication start/stop
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SatInStartReplicationReq {
    /// Raw resume position; empty means "start from the server's current
    /// position".
    pub lsn: Bytes,
    pub subscription_ids: Vec<String>,
    pub schema_version: Option<String>,
}

impl SatInStartReplicationReq {
    pub fn encode(&self, buf: &mut BytesMut) {
        put_bytes(buf, 1, &self.lsn);
        for id in &self.subscription_ids {
            put_str(buf, 2, id);
        }
        if let Some(v) = &self.schema_version {
            put_str(buf, 3, v);
        }
    }

    pub fn encode_to_bytes(&self) -> Bytes {
        to_bytes(|b| self.encode(b))
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        let mut msg = SatInStartReplicationReq::default();
        let mut rd = FieldReader::new(payload);
        while let Some((field, value)) = rd.next()? {
            match field {
                1 => msg.lsn = value.bytes()?,
                2 => msg.subscription_ids.push(value.string()?),
                3 => msg.schema_version = Some(value.string()?),
                _ => {}
            }
        }
        Ok(msg)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatReplicationError {
    pub code: StartReplicationErrorCode,
    pub message: String,
}

impl SatReplicationError {
    pub fn new(code: StartReplicationErrorCode, message: impl Into<String>) -> Self {
        SatReplicationError {
            code,
            message: message.into(),
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        put_uint(buf, 1, self.code.to_wire());
        put_str(buf, 2, &self.message);
    }

    fn decode(payload: Bytes) -> Result<Self> {
        let mut code = None;
        let mut message = String::new();
        let mut rd = FieldReader::new(payload);
        while let Some((field, value)) = rd.next()? {
            match field {
                1 => code = Some(StartReplicationErrorCode::from_wire(value.uint()?)?),
                2 => message = value.string()?,
                _ => {}
            }
        }
        let code = code
            .ok_or_else(|| SatError::Frame("replication error without a code".into()))?;
        Ok(SatReplicationError { code, message })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SatInStartReplicationResp {
    pub err: Option<SatReplicationError>,
}

impl SatInStartReplicationResp {
    pub fn encode(&self, buf: &mut BytesMut) {
        if let Some(err) = &self.err {
            put_nested(buf, 1, |b| err.encode(b));
        }
    }

    pub fn encode_to_bytes(&self) -> Bytes {
        to_bytes(|b| self.encode(b))
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        let mut msg = SatInStartReplicationResp::default();
        let mut rd = FieldReader::new(payload);
        while let Some((field, value)) = rd.next()? {
            if field == 1 {
                msg.err = Some(SatReplicationError::decode(value.bytes()?)?);
            }
        }
        Ok(msg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SatInStopReplicationReq;

impl SatInStopReplicationReq {
    pub fn encode_to_bytes(&self) -> Bytes {
        Bytes::new()
    }

    pub fn decode(_payload: Bytes) -> Result<Self> {
        Ok(SatInStopReplicationReq)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SatInStopReplicationResp;

impl SatInStopReplicationResp {
    pub fn encode_to_bytes(&self) -> Bytes {
        Bytes::new()
    }

    pub fn decode(_payload: Bytes) -> Result<Self> {
        Ok(SatInStopReplicationResp)
    }
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SatShapeSelect {
    pub tablename: String,
}

impl SatShapeSelect {
    fn encode(&self, buf: &mut BytesMut) {
        put_str(buf, 1, &self.tablename);
    }

    fn decode(payload: Bytes) -> Result<Self> {
        let mut msg = SatShapeSelect::default();
        let mut rd = FieldReader::new(payload);
        while let Some((field, value)) = rd.next()? {
            if field == 1 {
                msg.tablename = value.string()?;
            }
        }
        Ok(msg)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SatShapeDef {
    pub selects: Vec<SatShapeSelect>,
}

impl SatShapeDef {
    fn encode(&self, buf: &mut BytesMut) {
        for s in &self.selects {
            put_nested(buf, 1, |b| s.encode(b));
        }
    }

    fn decode(payload: Bytes) -> Result<Self> {
        let mut msg = SatShapeDef::default();
        let mut rd = FieldReader::new(payload);
        while let Some((field, value)) = rd.next()? {
            if field == 1 {
                msg.selects.push(SatShapeSelect::decode(value.bytes()?)?);
            }
        }
        Ok(msg)
    }
}

/// One requested shape within a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SatShapeReq {
    pub request_id: String,
    pub shape_definition: SatShapeDef,
}

impl SatShapeReq {
    /// Convenience for whole-table shapes.
    pub fn whole_table(request_id: impl Into<String>, tablename: impl Into<String>) -> Self {
        SatShapeReq {
            request_id: request_id.into(),
            shape_definition: SatShapeDef {
                selects: vec![SatShapeSelect {
                    tablename: tablename.into(),
                }],
            },
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        put_str(buf, 1, &self.request_id);
        put_nested(buf, 2, |b| self.shape_definition.encode(b));
    }

    fn decode(payload: Bytes) -> Result<Self> {
        let mut msg = SatShapeReq::default();
        let mut rd = FieldReader::new(payload);
        while let Some((field, value)) = rd.next()? {
            match field {
                1 => msg.request_id = value.string()?,
                2 => msg.shape_definition = SatShapeDef::decode(value.bytes()?)?,
                _ => {}
            }
        }
        Ok(msg)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SatSubsReq {
    pub subscription_id: String,
    pub shape_requests: Vec<SatShapeReq>,
}

impl SatSubsReq {
    pub fn encode(&self, buf: &mut BytesMut) {
        put_str(buf, 1, &self.subscription_id);
        for s in &self.shape_requests {
            put_nested(buf, 2, |b| s.encode(b));
        }
    }

    pub fn encode_to_bytes(&self) -> Bytes {
        to_bytes(|b| self.encode(b))
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        let mut msg = SatSubsReq::default();
        let mut rd = FieldReader::new(payload);
        while let Some((field, value)) = rd.next()? {
            match field {
                1 => msg.subscription_id = value.string()?,
                2 => msg.shape_requests.push(SatShapeReq::decode(value.bytes()?)?),
                _ => {}
            }
        }
        Ok(msg)
    }
}

/// A per-shape failure, nested in subscribe errors and snapshot delivery
/// failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatShapeReqError {
    pub code: ShapeRequestErrorCode,
    pub message: String,
    pub request_id: String,
}

impl SatShapeReqError {
    pub fn encode(&self, buf: &mut BytesMut) {
        put_uint(buf, 1, self.code.to_wire());
        put_str(buf, 2, &self.message);
        put_str(buf, 3, &self.request_id);
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        let mut code = None;
        let mut message = String::new();
        let mut request_id = String::new();
        let mut rd = FieldReader::new(payload);
        while let Some((field, value)) = rd.next()? {
            match field {
                1 => code = Some(ShapeRequestErrorCode::from_wire(value.uint()?)?),
                2 => message = value.string()?,
                3 => request_id = value.string()?,
                _ => {}
            }
        }
        let code = code.ok_or_else(|| SatError::Frame("shape error without a code".into()))?;
        Ok(SatShapeReqError {
            code,
            message,
            request_id,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatSubsError {
    pub code: SubsErrorCode,
    pub message: String,
    pub shape_request_error: Vec<SatShapeReqError>,
}

impl SatSubsError {
    fn encode(&self, buf: &mut BytesMut) {
        put_uint(buf, 1, self.code.to_wire());
        put_str(buf, 2, &self.message);
        for e in &self.shape_request_error {
            put_nested(buf, 3, |b| e.encode(b));
        }
    }

    fn decode(payload: Bytes) -> Result<Self> {
        let mut code = None;
        let mut message = String::new();
        let mut shape_request_error = Vec::new();
        let mut rd = FieldReader::new(payload);
        while let Some((field, value)) = rd.next()? {
            match field {
                1 => code = Some(SubsErrorCode::from_wire(value.uint()?)?),
                2 => message = value.string()?,
                3 => shape_request_error.push(SatShapeReqError::decode(value.bytes()?)?),
                _ => {}
            }
        }
        let code =
            code.ok_or_else(|| SatError::Frame("subscribe error without a code".into()))?;
        Ok(SatSubsError {
            code,
            message,
            shape_request_error,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SatSubsResp {
    pub subscription_id: String,
    pub err: Option<SatSubsError>,
}

impl SatSubsResp {
    pub fn encode(&self, buf: &mut BytesMut) {
        put_str(buf, 1, &self.subscription_id);
        if let Some(err) = &self.err {
            put_nested(buf, 2, |b| err.encode(b));
        }
    }

    pub fn encode_to_bytes(&self) -> Bytes {
        to_bytes(|b| self.encode(b))
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        let mut msg = SatSubsResp::default();
        let mut rd = FieldReader::new(payload);
        while let Some((field, value)) = rd.next()? {
            match field {
                1 => msg.subscription_id = value.string()?,
                2 => msg.err = Some(SatSubsError::decode(value.bytes()?)?),
                _ => {}
            }
        }
        Ok(msg)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SatUnsubsReq {
    pub subscription_ids: Vec<String>,
}

impl SatUnsubsReq {
    pub fn encode(&self, buf: &mut BytesMut) {
        for id in &self.subscription_ids {
            put_str(buf, 1, id);
        }
    }

    pub fn encode_to_bytes(&self) -> Bytes {
        to_bytes(|b| self.encode(b))
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        let mut msg = SatUnsubsReq::default();
        let mut rd = FieldReader::new(payload);
        while let Some((field, value)) = rd.next()? {
            if field == 1 {
                msg.subscription_ids.push(value.string()?);
            }
        }
        Ok(msg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SatUnsubsResp;

impl SatUnsubsResp {
    pub fn encode_to_bytes(&self) -> Bytes {
        Bytes::new()
    }

    pub fn decode(_payload: Bytes) -> Result<Self> {
        Ok(SatUnsubsResp)
    }
}

// ---------------------------------------------------------------------------
// Relations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SatRelationColumn {
    pub name: String,
    pub pg_type: String,
    pub nullable: bool,
    pub part_of_identity: bool,
    pub primary_key: bool,
}

impl SatRelationColumn {
    fn encode(&self, buf: &mut BytesMut) {
        put_str(buf, 1, &self.name);
        put_str(buf, 2, &self.pg_type);
        put_bool(buf, 3, self.nullable);
        put_bool(buf, 4, self.part_of_identity);
        put_bool(buf, 5, self.primary_key);
    }

    fn decode(payload: Bytes) -> Result<Self> {
        let mut msg = SatRelationColumn::default();
        let mut rd = FieldReader::new(payload);
        while let Some((field, value)) = rd.next()? {
            match field {
                1 => msg.name = value.string()?,
                2 => msg.pg_type = value.string()?,
                3 => msg.nullable = value.bool()?,
                4 => msg.part_of_identity = value.bool()?,
                5 => msg.primary_key = value.bool()?,
                _ => {}
            }
        }
        Ok(msg)
    }
}

/// Advertises a `relation_id` and its column layout. Must precede the first
/// op-log frame referencing the id, in transport order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SatRelation {
    pub schema_name: String,
    pub table_name: String,
    pub relation_id: u32,
    pub columns: Vec<SatRelationColumn>,
}

impl SatRelation {
    pub fn from_relation(relation_id: u32, relation: &Relation) -> Self {
        SatRelation {
            schema_name: relation.schema.clone(),
            table_name: relation.table.clone(),
            relation_id,
            columns: relation
                .columns
                .iter()
                .map(|c| SatRelationColumn {
                    name: c.name.clone(),
                    pg_type: c.pg_type.clone(),
                    nullable: c.nullable,
                    part_of_identity: c.part_of_identity,
                    primary_key: relation.primary_keys.contains(&c.name),
                })
                .collect(),
        }
    }

    pub fn to_relation(&self) -> Relation {
        Relation {
            schema: self.schema_name.clone(),
            table: self.table_name.clone(),
            columns: self
                .columns
                .iter()
                .map(|c| Column {
                    name: c.name.clone(),
                    pg_type: c.pg_type.clone(),
                    nullable: c.nullable,
                    part_of_identity: c.part_of_identity,
                })
                .collect(),
            primary_keys: self
                .columns
                .iter()
                .filter(|c| c.primary_key)
                .map(|c| c.name.clone())
                .collect(),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        put_str(buf, 1, &self.schema_name);
        put_str(buf, 2, &self.table_name);
        put_uint(buf, 3, u64::from(self.relation_id));
        for c in &self.columns {
            put_nested(buf, 4, |b| c.encode(b));
        }
    }

    pub fn encode_to_bytes(&self) -> Bytes {
        to_bytes(|b| self.encode(b))
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        let mut msg = SatRelation::default();
        let mut rd = FieldReader::new(payload);
        while let Some((field, value)) = rd.next()? {
            match field {
                1 => msg.schema_name = value.string()?,
                2 => msg.table_name = value.string()?,
                3 => msg.relation_id = value.u32()?,
                4 => msg.columns.push(SatRelationColumn::decode(value.bytes()?)?),
                _ => {}
            }
        }
        Ok(msg)
    }
}

// ---------------------------------------------------------------------------
// Op-log
// ---------------------------------------------------------------------------

/// A row as framed on the wire: NULL bitmask plus one byte-string per
/// column, in relation column order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SatOpRow {
    /// MSB-first within each byte; bit `i` set iff column `i` is NULL.
    pub nulls_bitmask: Bytes,
    pub values: Vec<Bytes>,
}

impl SatOpRow {
    pub fn encode(&self, buf: &mut BytesMut) {
        put_bytes(buf, 1, &self.nulls_bitmask);
        for v in &self.values {
            put_bytes(buf, 2, v);
        }
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        let mut msg = SatOpRow::default();
        let mut rd = FieldReader::new(payload);
        while let Some((field, value)) = rd.next()? {
            match field {
                1 => msg.nulls_bitmask = value.bytes()?,
                2 => msg.values.push(value.bytes()?),
                _ => {}
            }
        }
        Ok(msg)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SatOpBegin {
    /// Microseconds since the Unix epoch.
    pub commit_timestamp: u64,
    pub trans_id: String,
    pub lsn: Bytes,
    /// Always populated by servers; receivers tolerate any value, empty
    /// included.
    pub origin: Option<String>,
    pub is_migration: bool,
}

impl SatOpBegin {
    fn encode(&self, buf: &mut BytesMut) {
        put_uint(buf, 1, self.commit_timestamp);
        put_str(buf, 2, &self.trans_id);
        put_bytes(buf, 3, &self.lsn);
        if let Some(origin) = &self.origin {
            put_str(buf, 4, origin);
        }
        put_bool(buf, 5, self.is_migration);
    }

    fn decode(payload: Bytes) -> Result<Self> {
        let mut msg = SatOpBegin::default();
        let mut rd = FieldReader::new(payload);
        while let Some((field, value)) = rd.next()? {
            match field {
                1 => msg.commit_timestamp = value.uint()?,
                2 => msg.trans_id = value.string()?,
                3 => msg.lsn = value.bytes()?,
                4 => msg.origin = Some(value.string()?),
                5 => msg.is_migration = value.bool()?,
                _ => {}
            }
        }
        Ok(msg)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SatOpCommit {
    pub commit_timestamp: u64,
    pub trans_id: String,
    pub lsn: Bytes,
}

impl SatOpCommit {
    fn encode(&self, buf: &mut BytesMut) {
        put_uint(buf, 1, self.commit_timestamp);
        put_str(buf, 2, &self.trans_id);
        put_bytes(buf, 3, &self.lsn);
    }

    fn decode(payload: Bytes) -> Result<Self> {
        let mut msg = SatOpCommit::default();
        let mut rd = FieldReader::new(payload);
        while let Some((field, value)) = rd.next()? {
            match field {
                1 => msg.commit_timestamp = value.uint()?,
                2 => msg.trans_id = value.string()?,
                3 => msg.lsn = value.bytes()?,
                _ => {}
            }
        }
        Ok(msg)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SatOpInsert {
    pub relation_id: u32,
    pub row_data: Option<SatOpRow>,
    pub tags: Vec<String>,
}

impl SatOpInsert {
    fn encode(&self, buf: &mut BytesMut) {
        put_uint(buf, 1, u64::from(self.relation_id));
        if let Some(row) = &self.row_data {
            put_nested(buf, 2, |b| row.encode(b));
        }
        for t in &self.tags {
            put_str(buf, 3, t);
        }
    }

    fn decode(payload: Bytes) -> Result<Self> {
        let mut msg = SatOpInsert::default();
        let mut rd = FieldReader::new(payload);
        while let Some((field, value)) = rd.next()? {
            match field {
                1 => msg.relation_id = value.u32()?,
                2 => msg.row_data = Some(SatOpRow::decode(value.bytes()?)?),
                3 => msg.tags.push(value.string()?),
                _ => {}
            }
        }
        Ok(msg)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SatOpUpdate {
    pub relation_id: u32,
    pub row_data: Option<SatOpRow>,
    /// Absent means "no previous image".
    pub old_row_data: Option<SatOpRow>,
    pub tags: Vec<String>,
}

impl SatOpUpdate {
    fn encode(&self, buf: &mut BytesMut) {
        put_uint(buf, 1, u64::from(self.relation_id));
        if let Some(row) = &self.row_data {
            put_nested(buf, 2, |b| row.encode(b));
        }
        if let Some(row) = &self.old_row_data {
            put_nested(buf, 3, |b| row.encode(b));
        }
        for t in &self.tags {
            put_str(buf, 4, t);
        }
    }

    fn decode(payload: Bytes) -> Result<Self> {
        let mut msg = SatOpUpdate::default();
        let mut rd = FieldReader::new(payload);
        while let Some((field, value)) = rd.next()? {
            match field {
                1 => msg.relation_id = value.u32()?,
                2 => msg.row_data = Some(SatOpRow::decode(value.bytes()?)?),
                3 => msg.old_row_data = Some(SatOpRow::decode(value.bytes()?)?),
                4 => msg.tags.push(value.string()?),
                _ => {}
            }
        }
        Ok(msg)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SatOpDelete {
    pub relation_id: u32,
    /// Absent means "no previous image".
    pub old_row_data: Option<SatOpRow>,
    pub tags: Vec<String>,
}

impl SatOpDelete {
    fn encode(&self, buf: &mut BytesMut) {
        put_uint(buf, 1, u64::from(self.relation_id));
        if let Some(row) = &self.old_row_data {
            put_nested(buf, 2, |b| row.encode(b));
        }
        for t in &self.tags {
            put_str(buf, 3, t);
        }
    }

    fn decode(payload: Bytes) -> Result<Self> {
        let mut msg = SatOpDelete::default();
        let mut rd = FieldReader::new(payload);
        while let Some((field, value)) = rd.next()? {
            match field {
                1 => msg.relation_id = value.u32()?,
                2 => msg.old_row_data = Some(SatOpRow::decode(value.bytes()?)?),
                3 => msg.tags.push(value.string()?),
                _ => {}
            }
        }
        Ok(msg)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SatOpMigrateStmt {
    pub kind: u64,
    pub sql: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SatOpMigrate {
    pub version: String,
    pub stmts: Vec<SatOpMigrateStmt>,
    pub table: Option<SatOpMigrateTable>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SatOpMigrateTable {
    pub name: String,
    pub columns: Vec<SatOpMigrateTableCol>,
    pub fks: Vec<SatOpMigrateTableFk>,
    pub pks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SatOpMigrateTableCol {
    pub name: String,
    pub pg_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SatOpMigrateTableFk {
    pub fk_cols: Vec<String>,
    pub pk_table: String,
    pub pk_cols: Vec<String>,
}

impl SatOpMigrateTableCol {
    fn encode(&self, buf: &mut BytesMut) {
        put_str(buf, 1, &self.name);
        put_str(buf, 2, &self.pg_type);
    }

    fn decode(payload: Bytes) -> Result<Self> {
        let mut msg = SatOpMigrateTableCol::default();
        let mut rd = FieldReader::new(payload);
        while let Some((field, value)) = rd.next()? {
            match field {
                1 => msg.name = value.string()?,
                2 => msg.pg_type = value.string()?,
                _ => {}
            }
        }
        Ok(msg)
    }
}

impl SatOpMigrateTableFk {
    fn encode(&self, buf: &mut BytesMut) {
        for c in &self.fk_cols {
            put_str(buf, 1, c);
        }
        put_str(buf, 2, &self.pk_table);
        for c in &self.pk_cols {
            put_str(buf, 3, c);
        }
    }

    fn decode(payload: Bytes) -> Result<Self> {
        let mut msg = SatOpMigrateTableFk::default();
        let mut rd = FieldReader::new(payload);
        while let Some((field, value)) = rd.next()? {
            match field {
                1 => msg.fk_cols.push(value.string()?),
                2 => msg.pk_table = value.string()?,
                3 => msg.pk_cols.push(value.string()?),
                _ => {}
            }
        }
        Ok(msg)
    }
}

impl SatOpMigrateTable {
    fn encode(&self, buf: &mut BytesMut) {
        put_str(buf, 1, &self.name);
        for c in &self.columns {
            put_nested(buf, 2, |b| c.encode(b));
        }
        for fk in &self.fks {
            put_nested(buf, 3, |b| fk.encode(b));
        }
        for pk in &self.pks {
            put_str(buf, 4, pk);
        }
    }

    fn decode(payload: Bytes) -> Result<Self> {
        let mut msg = SatOpMigrateTable::default();
        let mut rd = FieldReader::new(payload);
        while let Some((field, value)) = rd.next()? {
            match field {
                1 => msg.name = value.string()?,
                2 => msg
                    .columns
                    .push(SatOpMigrateTableCol::decode(value.bytes()?)?),
                3 => msg.fks.push(SatOpMigrateTableFk::decode(value.bytes()?)?),
                4 => msg.pks.push(value.string()?),
                _ => {}
            }
        }
        Ok(msg)
    }
}

impl SatOpMigrate {
    pub fn from_migration(m: &Migration) -> Self {
        SatOpMigrate {
            version: m.version.clone(),
            stmts: m
                .stmts
                .iter()
                .map(|s| SatOpMigrateStmt {
                    kind: s.kind.to_wire(),
                    sql: s.sql.clone(),
                })
                .collect(),
            table: m.table.as_ref().map(|t| SatOpMigrateTable {
                name: t.name.clone(),
                columns: t
                    .columns
                    .iter()
                    .map(|c| SatOpMigrateTableCol {
                        name: c.name.clone(),
                        pg_type: c.pg_type.clone(),
                    })
                    .collect(),
                fks: t
                    .fks
                    .iter()
                    .map(|fk| SatOpMigrateTableFk {
                        fk_cols: fk.fk_cols.clone(),
                        pk_table: fk.pk_table.clone(),
                        pk_cols: fk.pk_cols.clone(),
                    })
                    .collect(),
                pks: t.pks.clone(),
            }),
        }
    }

    pub fn to_migration(&self) -> Result<Migration> {
        let stmts = self
            .stmts
            .iter()
            .map(|s| {
                let kind = MigrationStmtKind::from_wire(s.kind).ok_or_else(|| {
                    SatError::Frame(format!("unknown migration statement kind: {}", s.kind))
                })?;
                Ok(MigrationStmt {
                    kind,
                    sql: s.sql.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Migration {
            version: self.version.clone(),
            stmts,
            table: self.table.as_ref().map(|t| TableDef {
                name: t.name.clone(),
                columns: t
                    .columns
                    .iter()
                    .map(|c| TableColumnDef {
                        name: c.name.clone(),
                        pg_type: c.pg_type.clone(),
                    })
                    .collect(),
                fks: t
                    .fks
                    .iter()
                    .map(|fk| ForeignKeyDef {
                        fk_cols: fk.fk_cols.clone(),
                        pk_table: fk.pk_table.clone(),
                        pk_cols: fk.pk_cols.clone(),
                    })
                    .collect(),
                pks: t.pks.clone(),
            }),
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        put_str(buf, 1, &self.version);
        for s in &self.stmts {
            put_nested(buf, 2, |b| {
                put_uint(b, 1, s.kind);
                put_str(b, 2, &s.sql);
            });
        }
        if let Some(t) = &self.table {
            put_nested(buf, 3, |b| t.encode(b));
        }
    }

    fn decode(payload: Bytes) -> Result<Self> {
        let mut msg = SatOpMigrate::default();
        let mut rd = FieldReader::new(payload);
        while let Some((field, value)) = rd.next()? {
            match field {
                1 => msg.version = value.string()?,
                2 => {
                    let mut stmt = SatOpMigrateStmt::default();
                    let mut srd = FieldReader::new(value.bytes()?);
                    while let Some((sf, sv)) = srd.next()? {
                        match sf {
                            1 => stmt.kind = sv.uint()?,
                            2 => stmt.sql = sv.string()?,
                            _ => {}
                        }
                    }
                    msg.stmts.push(stmt);
                }
                3 => msg.table = Some(SatOpMigrateTable::decode(value.bytes()?)?),
                _ => {}
            }
        }
        Ok(msg)
    }
}

/// One op within an op-log frame. Exactly one variant per entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SatTransOp {
    Begin(SatOpBegin),
    Commit(SatOpCommit),
    Insert(SatOpInsert),
    Update(SatOpUpdate),
    Delete(SatOpDelete),
    Migrate(SatOpMigrate),
}

impl SatTransOp {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            SatTransOp::Begin(op) => put_nested(buf, 1, |b| op.encode(b)),
            SatTransOp::Commit(op) => put_nested(buf, 2, |b| op.encode(b)),
            SatTransOp::Insert(op) => put_nested(buf, 3, |b| op.encode(b)),
            SatTransOp::Update(op) => put_nested(buf, 4, |b| op.encode(b)),
            SatTransOp::Delete(op) => put_nested(buf, 5, |b| op.encode(b)),
            SatTransOp::Migrate(op) => put_nested(buf, 6, |b| op.encode(b)),
        }
    }

    fn decode(payload: Bytes) -> Result<Self> {
        let mut op = None;
        let mut rd = FieldReader::new(payload);
        while let Some((field, value)) = rd.next()? {
            let decoded = match field {
                1 => SatTransOp::Begin(SatOpBegin::decode(value.bytes()?)?),
                2 => SatTransOp::Commit(SatOpCommit::decode(value.bytes()?)?),
                3 => SatTransOp::Insert(SatOpInsert::decode(value.bytes()?)?),
                4 => SatTransOp::Update(SatOpUpdate::decode(value.bytes()?)?),
                5 => SatTransOp::Delete(SatOpDelete::decode(value.bytes()?)?),
                6 => SatTransOp::Migrate(SatOpMigrate::decode(value.bytes()?)?),
                _ => continue,
            };
            if op.is_some() {
                return Err(SatError::Frame("op-log entry with multiple ops".into()));
            }
            op = Some(decoded);
        }
        op.ok_or_else(|| SatError::Frame("empty op-log entry".into()))
    }
}

/// A single transport message carrying an ordered run of ops.
///
/// Live replication frames are Begin/Commit bracketed; snapshot frames
/// carry bare Inserts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SatOpLog {
    pub ops: Vec<SatTransOp>,
}

impl SatOpLog {
    pub fn encode(&self, buf: &mut BytesMut) {
        for op in &self.ops {
            put_nested(buf, 1, |b| op.encode(b));
        }
    }

    pub fn encode_to_bytes(&self) -> Bytes {
        to_bytes(|b| self.encode(b))
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        let mut msg = SatOpLog::default();
        let mut rd = FieldReader::new(payload);
        while let Some((field, value)) = rd.next()? {
            if field == 1 {
                msg.ops.push(SatTransOp::decode(value.bytes()?)?);
            }
        }
        Ok(msg)
    }
}

// ---------------------------------------------------------------------------
// Subscription data stream
// ---------------------------------------------------------------------------

/// Opens a snapshot bracket for one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SatSubsDataBegin {
    pub subscription_id: String,
    /// Position at which the snapshot is consistent. May duplicate the LSN
    /// of an immediately preceding transaction.
    pub lsn: Bytes,
}

impl SatSubsDataBegin {
    pub fn encode(&self, buf: &mut BytesMut) {
        put_str(buf, 1, &self.subscription_id);
        put_bytes(buf, 2, &self.lsn);
    }

    pub fn encode_to_bytes(&self) -> Bytes {
        to_bytes(|b| self.encode(b))
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        let mut msg = SatSubsDataBegin::default();
        let mut rd = FieldReader::new(payload);
        while let Some((field, value)) = rd.next()? {
            match field {
                1 => msg.subscription_id = value.string()?,
                2 => msg.lsn = value.bytes()?,
                _ => {}
            }
        }
        Ok(msg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SatSubsDataEnd;

impl SatSubsDataEnd {
    pub fn encode_to_bytes(&self) -> Bytes {
        Bytes::new()
    }

    pub fn decode(_payload: Bytes) -> Result<Self> {
        Ok(SatSubsDataEnd)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SatShapeDataBegin {
    pub request_id: String,
    pub uuid: String,
}

impl SatShapeDataBegin {
    pub fn encode(&self, buf: &mut BytesMut) {
        put_str(buf, 1, &self.request_id);
        put_str(buf, 2, &self.uuid);
    }

    pub fn encode_to_bytes(&self) -> Bytes {
        to_bytes(|b| self.encode(b))
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        let mut msg = SatShapeDataBegin::default();
        let mut rd = FieldReader::new(payload);
        while let Some((field, value)) = rd.next()? {
            match field {
                1 => msg.request_id = value.string()?,
                2 => msg.uuid = value.string()?,
                _ => {}
            }
        }
        Ok(msg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SatShapeDataEnd;

impl SatShapeDataEnd {
    pub fn encode_to_bytes(&self) -> Bytes {
        Bytes::new()
    }

    pub fn decode(_payload: Bytes) -> Result<Self> {
        Ok(SatShapeDataEnd)
    }
}

/// Reports snapshot delivery failure in lieu of `SatSubsDataEnd`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatSubsDataError {
    pub code: SubsDataErrorCode,
    pub message: String,
    pub subscription_id: String,
    pub shape_request_error: Vec<SatShapeReqError>,
}

impl SatSubsDataError {
    pub fn encode(&self, buf: &mut BytesMut) {
        put_uint(buf, 1, self.code.to_wire());
        put_str(buf, 2, &self.message);
        put_str(buf, 3, &self.subscription_id);
        for e in &self.shape_request_error {
            put_nested(buf, 4, |b| e.encode(b));
        }
    }

    pub fn encode_to_bytes(&self) -> Bytes {
        to_bytes(|b| self.encode(b))
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        let mut code = None;
        let mut message = String::new();
        let mut subscription_id = String::new();
        let mut shape_request_error = Vec::new();
        let mut rd = FieldReader::new(payload);
        while let Some((field, value)) = rd.next()? {
            match field {
                1 => code = Some(SubsDataErrorCode::from_wire(value.uint()?)?),
                2 => message = value.string()?,
                3 => subscription_id = value.string()?,
                4 => shape_request_error.push(SatShapeReqError::decode(value.bytes()?)?),
                _ => {}
            }
        }
        let code = code
            .ok_or_else(|| SatError::Frame("subscription data error without a code".into()))?;
        Ok(SatSubsDataError {
            code,
            message,
            subscription_id,
            shape_request_error,
        })
    }
}
