//! Error types for satellite-replication.
//!
//! All fallible operations in this crate return [`SatError`], which covers:
//! - I/O errors (transport reads and writes)
//! - Frame errors (unknown message tag, truncated payload)
//! - Protocol violations (broken Begin/Commit framing, unknown relation ids)
//! - Row codec failures (range checks, malformed uuids)
//! - Authentication and RPC failures
//!
//! Wire-facing error codes are separate enums with stable numeric
//! discriminants; [`SatError`] is the crate-internal surface.

use thiserror::Error;

/// Error type for all satellite-replication operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SatError {
    /// I/O error on the transport.
    ///
    /// Note: `std::io::Error` is not `Clone`, so we store the message.
    #[error("io error: {0}")]
    Io(String),

    /// Malformed frame - unknown type tag or truncated payload.
    #[error("malformed frame: {0}")]
    Frame(String),

    /// Protocol violation - fatal for the connection.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Row failed decode validation (integer range, float parse, uuid form).
    #[error("invalid row: {0}")]
    InvalidRow(String),

    /// DDL rows within one transaction reported inconsistent versions.
    #[error("invalid migration: {0}")]
    InvalidMigration(String),

    /// RPC layer error - duplicate outstanding request, malformed envelope.
    #[error("rpc error: {0}")]
    Rpc(String),

    /// Authentication failed or required.
    #[error("authentication error: {0}")]
    Auth(String),

    /// Transport subprotocol string did not match.
    #[error("subprotocol mismatch: {0}")]
    SubprotocolMismatch(String),

    /// The peer closed the connection; pending calls are failed with this.
    #[error("connection closed")]
    Closed,

    /// An RPC caller-side timeout.
    #[error("request timed out")]
    Timeout,

    /// Internal error - bug in the library or a collaborator.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SatError {
    /// Returns `true` if this error must tear down the connection.
    ///
    /// Request-scoped errors answer the originating RPC and leave the
    /// connection open; everything else closes it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SatError::Io(_)
                | SatError::Frame(_)
                | SatError::Protocol(_)
                | SatError::SubprotocolMismatch(_)
                | SatError::Closed
        )
    }

    /// Returns `true` if this is a transport-level I/O error.
    #[inline]
    pub fn is_io(&self) -> bool {
        matches!(self, SatError::Io(_))
    }

    /// Returns `true` if this is a protocol violation.
    #[inline]
    pub fn is_protocol(&self) -> bool {
        matches!(self, SatError::Protocol(_))
    }
}

// Manual From impl since io::Error isn't Clone
impl From<std::io::Error> for SatError {
    fn from(err: std::io::Error) -> Self {
        SatError::Io(err.to_string())
    }
}

/// Result type alias for satellite-replication operations.
pub type Result<T> = std::result::Result<T, SatError>;

/// General error codes carried by `SatErrorResp` and RPC error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Internal,
    AuthRequired,
    AuthFailed,
    ReplicationFailed,
    InvalidRequest,
    ProtoVsnMismatch,
    SchemaVsnMismatch,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Internal => "INTERNAL",
            ErrorCode::AuthRequired => "AUTH_REQUIRED",
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::ReplicationFailed => "REPLICATION_FAILED",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::ProtoVsnMismatch => "PROTO_VSN_MISMATCH",
            ErrorCode::SchemaVsnMismatch => "SCHEMA_VSN_MISMATCH",
        }
    }

    pub fn to_wire(self) -> u64 {
        match self {
            ErrorCode::Internal => 0,
            ErrorCode::AuthRequired => 1,
            ErrorCode::AuthFailed => 2,
            ErrorCode::ReplicationFailed => 3,
            ErrorCode::InvalidRequest => 4,
            ErrorCode::ProtoVsnMismatch => 5,
            ErrorCode::SchemaVsnMismatch => 6,
        }
    }

    pub fn from_wire(v: u64) -> Result<Self> {
        Ok(match v {
            0 => ErrorCode::Internal,
            1 => ErrorCode::AuthRequired,
            2 => ErrorCode::AuthFailed,
            3 => ErrorCode::ReplicationFailed,
            4 => ErrorCode::InvalidRequest,
            5 => ErrorCode::ProtoVsnMismatch,
            6 => ErrorCode::SchemaVsnMismatch,
            _ => return Err(SatError::Frame(format!("unknown error code: {v}"))),
        })
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error codes for `startReplication` responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartReplicationErrorCode {
    BehindWindow,
    InvalidPosition,
    SubscriptionNotFound,
    MalformedLsn,
    UnknownSchemaVsn,
}

impl StartReplicationErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            StartReplicationErrorCode::BehindWindow => "BEHIND_WINDOW",
            StartReplicationErrorCode::InvalidPosition => "INVALID_POSITION",
            StartReplicationErrorCode::SubscriptionNotFound => "SUBSCRIPTION_NOT_FOUND",
            StartReplicationErrorCode::MalformedLsn => "MALFORMED_LSN",
            StartReplicationErrorCode::UnknownSchemaVsn => "UNKNOWN_SCHEMA_VSN",
        }
    }

    pub fn to_wire(self) -> u64 {
        match self {
            StartReplicationErrorCode::BehindWindow => 1,
            StartReplicationErrorCode::InvalidPosition => 2,
            StartReplicationErrorCode::SubscriptionNotFound => 3,
            StartReplicationErrorCode::MalformedLsn => 4,
            StartReplicationErrorCode::UnknownSchemaVsn => 5,
        }
    }

    pub fn from_wire(v: u64) -> Result<Self> {
        Ok(match v {
            1 => StartReplicationErrorCode::BehindWindow,
            2 => StartReplicationErrorCode::InvalidPosition,
            3 => StartReplicationErrorCode::SubscriptionNotFound,
            4 => StartReplicationErrorCode::MalformedLsn,
            5 => StartReplicationErrorCode::UnknownSchemaVsn,
            _ => {
                return Err(SatError::Frame(format!(
                    "unknown startReplication error code: {v}"
                )))
            }
        })
    }
}

/// Error codes for `subscribe` responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubsErrorCode {
    SubscriptionIdAlreadyExists,
    ShapeRequestError,
}

impl SubsErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            SubsErrorCode::SubscriptionIdAlreadyExists => "SUBSCRIPTION_ID_ALREADY_EXISTS",
            SubsErrorCode::ShapeRequestError => "SHAPE_REQUEST_ERROR",
        }
    }

    pub fn to_wire(self) -> u64 {
        match self {
            SubsErrorCode::SubscriptionIdAlreadyExists => 1,
            SubsErrorCode::ShapeRequestError => 2,
        }
    }

    pub fn from_wire(v: u64) -> Result<Self> {
        Ok(match v {
            1 => SubsErrorCode::SubscriptionIdAlreadyExists,
            2 => SubsErrorCode::ShapeRequestError,
            _ => return Err(SatError::Frame(format!("unknown subscribe error code: {v}"))),
        })
    }
}

/// Per-shape error codes nested inside subscribe errors and snapshot
/// delivery failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeRequestErrorCode {
    TableNotFound,
    ReferentialIntegrityViolation,
    EmptyShapeDefinition,
    DuplicateTableInShapeDefinition,
    ShapeSizeLimitExceeded,
}

impl ShapeRequestErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ShapeRequestErrorCode::TableNotFound => "TABLE_NOT_FOUND",
            ShapeRequestErrorCode::ReferentialIntegrityViolation => {
                "REFERENTIAL_INTEGRITY_VIOLATION"
            }
            ShapeRequestErrorCode::EmptyShapeDefinition => "EMPTY_SHAPE_DEFINITION",
            ShapeRequestErrorCode::DuplicateTableInShapeDefinition => {
                "DUPLICATE_TABLE_IN_SHAPE_DEFINITION"
            }
            ShapeRequestErrorCode::ShapeSizeLimitExceeded => "SHAPE_SIZE_LIMIT_EXCEEDED",
        }
    }

    pub fn to_wire(self) -> u64 {
        match self {
            ShapeRequestErrorCode::TableNotFound => 1,
            ShapeRequestErrorCode::ReferentialIntegrityViolation => 2,
            ShapeRequestErrorCode::EmptyShapeDefinition => 3,
            ShapeRequestErrorCode::DuplicateTableInShapeDefinition => 4,
            ShapeRequestErrorCode::ShapeSizeLimitExceeded => 5,
        }
    }

    pub fn from_wire(v: u64) -> Result<Self> {
        Ok(match v {
            1 => ShapeRequestErrorCode::TableNotFound,
            2 => ShapeRequestErrorCode::ReferentialIntegrityViolation,
            3 => ShapeRequestErrorCode::EmptyShapeDefinition,
            4 => ShapeRequestErrorCode::DuplicateTableInShapeDefinition,
            5 => ShapeRequestErrorCode::ShapeSizeLimitExceeded,
            _ => return Err(SatError::Frame(format!("unknown shape error code: {v}"))),
        })
    }
}

/// Error codes for `SubsDataError` stream messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubsDataErrorCode {
    ShapeDeliveryError,
}

impl SubsDataErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            SubsDataErrorCode::ShapeDeliveryError => "SHAPE_DELIVERY_ERROR",
        }
    }

    pub fn to_wire(self) -> u64 {
        1
    }

    pub fn from_wire(v: u64) -> Result<Self> {
        match v {
            1 => Ok(SubsDataErrorCode::ShapeDeliveryError),
            _ => Err(SatError::Frame(format!(
                "unknown subscription data error code: {v}"
            ))),
        }
    }
}
