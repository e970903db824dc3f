//! Opaque WAL position (LSN) type.
//!
//! The replication core never interprets positions; it only carries them
//! between the WAL source and the peer. Total ordering is provided by
//! [`WalSource::compare`](crate::source::WalSource::compare), which is why
//! this type deliberately implements neither `Ord` nor `PartialOrd`.
//!
//! An empty LSN is a sentinel: on `startReplication` it means "start from
//! the server's current position"; on `Begin` it is a protocol violation.

use std::fmt;

use bytes::Bytes;

/// Opaque Log Sequence Number.
///
/// A byte string totally ordered by the WAL source. The core treats it as
/// an opaque token: stored, echoed, compared only through the source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Lsn(Bytes);

impl Lsn {
    /// The empty LSN sentinel ("no position").
    pub const EMPTY: Lsn = Lsn(Bytes::new());

    /// Wrap raw position bytes.
    pub fn new(raw: Bytes) -> Self {
        Lsn(raw)
    }

    /// Copy a byte slice into an LSN.
    pub fn from_slice(raw: &[u8]) -> Self {
        Lsn(Bytes::copy_from_slice(raw))
    }

    /// Raw position bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The underlying buffer, cheaply cloned.
    #[inline]
    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }

    /// Returns `true` for the "no position" sentinel.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Lsn {
    /// Uppercase hex rendering. Diagnostic only - the bytes are opaque.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("(empty)");
        }
        for b in self.0.iter() {
            write!(f, "{b:02X}")?;
        }
        Ok(())
    }
}

impl From<Vec<u8>> for Lsn {
    fn from(raw: Vec<u8>) -> Self {
        Lsn(Bytes::from(raw))
    }
}

impl From<Bytes> for Lsn {
    fn from(raw: Bytes) -> Self {
        Lsn(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sentinel() {
        assert!(Lsn::EMPTY.is_empty());
        assert!(!Lsn::from_slice(&[0]).is_empty());
        assert_eq!(Lsn::default(), Lsn::EMPTY);
    }

    #[test]
    fn display_renders_hex() {
        assert_eq!(Lsn::from_slice(&[0x0A]).to_string(), "0A");
        assert_eq!(Lsn::from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]).to_string(), "DEADBEEF");
        assert_eq!(Lsn::EMPTY.to_string(), "(empty)");
    }

    #[test]
    fn equality_is_byte_equality() {
        assert_eq!(Lsn::from_slice(b"abc"), Lsn::from(b"abc".to_vec()));
        assert_ne!(Lsn::from_slice(b"abc"), Lsn::from_slice(b"abd"));
    }
}
