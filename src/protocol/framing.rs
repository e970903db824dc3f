//! Transport frame codec.
//!
//! Every message on the wire is `<type:u8><len:u32 BE><payload>` where
//! `type` indexes the closed set of top-level message kinds and `payload`
//! is the message encoded per [`messages`](crate::protocol::messages). The
//! length covers the payload only.
//!
//! Unknown type bytes and truncated payloads fail with a frame error,
//! which is fatal for the connection.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, SatError};
use crate::protocol::messages::{
    SatErrorResp, SatOpLog, SatRelation, SatRpcRequest, SatRpcResponse, SatShapeDataBegin,
    SatShapeDataEnd, SatSubsDataBegin, SatSubsDataEnd, SatSubsDataError,
};

/// Maximum frame payload size (64MB) - prevents memory exhaustion from
/// malformed length fields.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Stable numeric tags of the closed message catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    ErrorResp = 0,
    RpcRequest = 1,
    RpcResponse = 2,
    OpLog = 3,
    Relation = 4,
    SubsDataBegin = 5,
    SubsDataEnd = 6,
    ShapeDataBegin = 7,
    ShapeDataEnd = 8,
    SubsDataError = 9,
}

impl FrameType {
    pub fn from_u8(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => FrameType::ErrorResp,
            1 => FrameType::RpcRequest,
            2 => FrameType::RpcResponse,
            3 => FrameType::OpLog,
            4 => FrameType::Relation,
            5 => FrameType::SubsDataBegin,
            6 => FrameType::SubsDataEnd,
            7 => FrameType::ShapeDataBegin,
            8 => FrameType::ShapeDataEnd,
            9 => FrameType::SubsDataError,
            other => return Err(SatError::Frame(format!("unknown frame type: {other}"))),
        })
    }
}

/// A decoded top-level protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Unsolicited typed error, sent best-effort before closing on a fatal
    /// violation.
    ErrorResp(SatErrorResp),
    RpcRequest(SatRpcRequest),
    RpcResponse(SatRpcResponse),
    OpLog(SatOpLog),
    Relation(SatRelation),
    SubsDataBegin(SatSubsDataBegin),
    SubsDataEnd(SatSubsDataEnd),
    ShapeDataBegin(SatShapeDataBegin),
    ShapeDataEnd(SatShapeDataEnd),
    SubsDataError(SatSubsDataError),
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::ErrorResp(_) => FrameType::ErrorResp,
            Frame::RpcRequest(_) => FrameType::RpcRequest,
            Frame::RpcResponse(_) => FrameType::RpcResponse,
            Frame::OpLog(_) => FrameType::OpLog,
            Frame::Relation(_) => FrameType::Relation,
            Frame::SubsDataBegin(_) => FrameType::SubsDataBegin,
            Frame::SubsDataEnd(_) => FrameType::SubsDataEnd,
            Frame::ShapeDataBegin(_) => FrameType::ShapeDataBegin,
            Frame::ShapeDataEnd(_) => FrameType::ShapeDataEnd,
            Frame::SubsDataError(_) => FrameType::SubsDataError,
        }
    }

    pub fn encode_payload(&self) -> Bytes {
        match self {
            Frame::ErrorResp(m) => m.encode_to_bytes(),
            Frame::RpcRequest(m) => m.encode_to_bytes(),
            Frame::RpcResponse(m) => m.encode_to_bytes(),
            Frame::OpLog(m) => m.encode_to_bytes(),
            Frame::Relation(m) => m.encode_to_bytes(),
            Frame::SubsDataBegin(m) => m.encode_to_bytes(),
            Frame::SubsDataEnd(m) => m.encode_to_bytes(),
            Frame::ShapeDataBegin(m) => m.encode_to_bytes(),
            Frame::ShapeDataEnd(m) => m.encode_to_bytes(),
            Frame::SubsDataError(m) => m.encode_to_bytes(),
        }
    }

    pub fn decode(frame_type: FrameType, payload: Bytes) -> Result<Self> {
        Ok(match frame_type {
            FrameType::ErrorResp => Frame::ErrorResp(SatErrorResp::decode(payload)?),
            FrameType::RpcRequest => Frame::RpcRequest(SatRpcRequest::decode(payload)?),
            FrameType::RpcResponse => Frame::RpcResponse(SatRpcResponse::decode(payload)?),
            FrameType::OpLog => Frame::OpLog(SatOpLog::decode(payload)?),
            FrameType::Relation => Frame::Relation(SatRelation::decode(payload)?),
            FrameType::SubsDataBegin => Frame::SubsDataBegin(SatSubsDataBegin::decode(payload)?),
            FrameType::SubsDataEnd => Frame::SubsDataEnd(SatSubsDataEnd::decode(payload)?),
            FrameType::ShapeDataBegin => {
                Frame::ShapeDataBegin(SatShapeDataBegin::decode(payload)?)
            }
            FrameType::ShapeDataEnd => Frame::ShapeDataEnd(SatShapeDataEnd::decode(payload)?),
            FrameType::SubsDataError => Frame::SubsDataError(SatSubsDataError::decode(payload)?),
        })
    }
}

/// Reads one frame from the transport.
pub async fn read_frame<R: AsyncRead + Unpin>(rd: &mut R) -> Result<Frame> {
    let mut hdr = [0u8; 5];
    rd.read_exact(&mut hdr).await?;
    let frame_type = FrameType::from_u8(hdr[0])?;
    let len = u32::from_be_bytes([hdr[1], hdr[2], hdr[3], hdr[4]]) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(SatError::Frame(format!(
            "frame too large: {len} bytes (max {MAX_FRAME_SIZE})"
        )));
    }

    let mut buf = vec![0u8; len];
    rd.read_exact(&mut buf).await?;
    Frame::decode(frame_type, Bytes::from(buf))
}

/// Writes one frame and flushes.
pub async fn write_frame<W: AsyncWrite + Unpin>(wr: &mut W, frame: &Frame) -> Result<()> {
    let payload = frame.encode_payload();
    let mut hdr = [0u8; 5];
    hdr[0] = frame.frame_type() as u8;
    hdr[1..5].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    wr.write_all(&hdr).await?;
    wr.write_all(&payload).await?;
    wr.flush().await?;
    Ok(())
}
