//! Length-delimited field-tagged encoding primitives.
//!
//! Every protocol message payload is a sequence of `(key, value)` fields,
//! where `key = field_number << 3 | wire_type`. Two wire types are used:
//! `0` (varint) and `2` (length-delimited). The layout is compatible with
//! the standard field-tagged format, so a schema compiler can produce
//! interoperable peers; this module is the hand-rolled equivalent for the
//! closed catalog in [`messages`](crate::protocol::messages).
//!
//! Unknown fields are skipped on decode (forward compatibility within one
//! wire type); unknown wire types are rejected.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, SatError};

const WIRE_VARINT: u8 = 0;
const WIRE_LEN: u8 = 2;

/// Appends `v` as a base-128 varint, low groups first.
pub fn put_uvarint(buf: &mut BytesMut, mut v: u64) {
    while v >= 0x80 {
        buf.put_u8((v as u8 & 0x7F) | 0x80);
        v >>= 7;
    }
    buf.put_u8(v as u8);
}

/// Reads one base-128 varint. At most ten bytes; truncation or overlong
/// encodings fail with a frame error.
pub fn get_uvarint(buf: &mut Bytes) -> Result<u64> {
    let mut v: u64 = 0;
    for shift in (0..64).step_by(7) {
        if !buf.has_remaining() {
            return Err(SatError::Frame("truncated varint".into()));
        }
        let byte = buf.get_u8();
        let bits = u64::from(byte & 0x7F);
        // the tenth byte may only contribute the final bit
        if shift == 63 && bits > 1 {
            return Err(SatError::Frame("varint exceeds 64 bits".into()));
        }
        v |= bits << shift;
        if byte & 0x80 == 0 {
            return Ok(v);
        }
    }
    Err(SatError::Frame("varint exceeds 64 bits".into()))
}

fn put_key(buf: &mut BytesMut, field: u32, wire_type: u8) {
    put_uvarint(buf, (u64::from(field) << 3) | u64::from(wire_type));
}

/// Writes a varint-typed field.
pub fn put_uint(buf: &mut BytesMut, field: u32, v: u64) {
    put_key(buf, field, WIRE_VARINT);
    put_uvarint(buf, v);
}

pub fn put_bool(buf: &mut BytesMut, field: u32, v: bool) {
    put_uint(buf, field, u64::from(v));
}

/// Writes a length-delimited field. Empty payloads are written explicitly;
/// absence is expressed by not calling this at all.
pub fn put_bytes(buf: &mut BytesMut, field: u32, v: &[u8]) {
    put_key(buf, field, WIRE_LEN);
    put_uvarint(buf, v.len() as u64);
    buf.put_slice(v);
}

pub fn put_str(buf: &mut BytesMut, field: u32, v: &str) {
    put_bytes(buf, field, v.as_bytes());
}

/// Writes a nested message field from its already-encoded body.
pub fn put_msg(buf: &mut BytesMut, field: u32, body: &BytesMut) {
    put_bytes(buf, field, body);
}

/// One decoded field value.
#[derive(Debug, Clone)]
pub enum FieldValue {
    Uint(u64),
    Bytes(Bytes),
}

impl FieldValue {
    pub fn uint(&self) -> Result<u64> {
        match self {
            FieldValue::Uint(v) => Ok(*v),
            FieldValue::Bytes(_) => Err(SatError::Frame("expected varint field".into())),
        }
    }

    pub fn bool(&self) -> Result<bool> {
        Ok(self.uint()? != 0)
    }

    pub fn u32(&self) -> Result<u32> {
        u32::try_from(self.uint()?)
            .map_err(|_| SatError::Frame("varint field out of u32 range".into()))
    }

    pub fn bytes(&self) -> Result<Bytes> {
        match self {
            FieldValue::Bytes(b) => Ok(b.clone()),
            FieldValue::Uint(_) => Err(SatError::Frame("expected length-delimited field".into())),
        }
    }

    pub fn string(&self) -> Result<String> {
        let b = self.bytes()?;
        String::from_utf8(b.to_vec())
            .map_err(|_| SatError::Frame("string field is not valid utf-8".into()))
    }
}

/// Walks the fields of one message payload in order.
#[derive(Debug)]
pub struct FieldReader {
    buf: Bytes,
}

impl FieldReader {
    pub fn new(payload: Bytes) -> Self {
        FieldReader { buf: payload }
    }

    /// The next `(field_number, value)` pair, or `None` at end of payload.
    pub fn next(&mut self) -> Result<Option<(u32, FieldValue)>> {
        if !self.buf.has_remaining() {
            return Ok(None);
        }
        let key = get_uvarint(&mut self.buf)?;
        let field = u32::try_from(key >> 3)
            .map_err(|_| SatError::Frame("field number out of range".into()))?;
        match (key & 0x07) as u8 {
            WIRE_VARINT => {
                let v = get_uvarint(&mut self.buf)?;
                Ok(Some((field, FieldValue::Uint(v))))
            }
            WIRE_LEN => {
                let len = get_uvarint(&mut self.buf)? as usize;
                if self.buf.remaining() < len {
                    return Err(SatError::Frame(format!(
                        "length-delimited field truncated: want {len}, have {}",
                        self.buf.remaining()
                    )));
                }
                let body = self.buf.split_to(len);
                Ok(Some((field, FieldValue::Bytes(body))))
            }
            other => Err(SatError::Frame(format!("unsupported wire type: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uvarint_round_trips() {
        for v in [0u64, 1, 127, 128, 300, 16383, 16384, u64::from(u32::MAX), u64::MAX] {
            let mut buf = BytesMut::new();
            put_uvarint(&mut buf, v);
            let mut bytes = buf.freeze();
            assert_eq!(get_uvarint(&mut bytes).unwrap(), v);
            assert!(bytes.is_empty());
        }
    }

    #[test]
    fn uvarint_rejects_truncation() {
        let mut bytes = Bytes::from_static(&[0x80, 0x80]);
        assert!(get_uvarint(&mut bytes).is_err());
    }

    #[test]
    fn uvarint_rejects_overlong_encodings() {
        let mut bytes = Bytes::from_static(&[
            0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F,
        ]);
        assert!(get_uvarint(&mut bytes).is_err());
    }

    #[test]
    fn field_walk_in_order() {
        let mut buf = BytesMut::new();
        put_uint(&mut buf, 1, 42);
        put_str(&mut buf, 2, "hello");
        put_bytes(&mut buf, 3, b"");

        let mut rd = FieldReader::new(buf.freeze());
        let (f, v) = rd.next().unwrap().unwrap();
        assert_eq!((f, v.uint().unwrap()), (1, 42));
        let (f, v) = rd.next().unwrap().unwrap();
        assert_eq!(f, 2);
        assert_eq!(v.string().unwrap(), "hello");
        let (f, v) = rd.next().unwrap().unwrap();
        assert_eq!(f, 3);
        assert!(v.bytes().unwrap().is_empty());
        assert!(rd.next().unwrap().is_none());
    }

    #[test]
    fn truncated_length_delimited_field_fails() {
        let mut buf = BytesMut::new();
        put_key(&mut buf, 1, WIRE_LEN);
        put_uvarint(&mut buf, 10);
        buf.put_slice(b"abc");
        let mut rd = FieldReader::new(buf.freeze());
        assert!(rd.next().is_err());
    }

    #[test]
    fn unknown_wire_type_fails() {
        let mut buf = BytesMut::new();
        put_uvarint(&mut buf, (1 << 3) | 5); // 32-bit wire type, unused here
        let mut rd = FieldReader::new(buf.freeze());
        assert!(rd.next().is_err());
    }

    #[test]
    fn wire_type_mismatch_is_an_error() {
        let mut buf = BytesMut::new();
        put_uint(&mut buf, 1, 7);
        let mut rd = FieldReader::new(buf.freeze());
        let (_, v) = rd.next().unwrap().unwrap();
        assert!(v.bytes().is_err());
        assert!(v.uint().is_ok());
    }
}
