//! Satellite wire protocol implementation.
//!
//! This module provides the protocol layers in order of assembly:
//! - Field-tagged encoding primitives ([`wire`])
//! - The closed message catalog ([`messages`])
//! - Transport framing, `<type:u8><len:u32><payload>` ([`framing`])
//! - Row images with NULL-bitmask framing ([`row`])
//! - Transaction serialization and reassembly over op-log frames ([`oplog`])
//!
//! # Wire Protocol Overview
//!
//! Each transport frame carries exactly one top-level message. RPC
//! envelopes multiplex calls in both directions; everything else is
//! fire-and-forget stream traffic: relation advertisements, op-log frames
//! and the subscription snapshot bracket.

pub mod framing;
pub mod messages;
pub mod oplog;
pub mod row;
pub mod wire;

pub use framing::{read_frame, write_frame, Frame, FrameType, MAX_FRAME_SIZE};
pub use oplog::{serialize_transaction, TransactionAssembler};
pub use row::{decode_row, encode_row, PgColumnType};
