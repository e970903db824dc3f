use std::fmt;

/// Protocol version negotiated at transport handshake.
///
/// The transport subprotocol string has the form `electric.<major>.<minor>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        ProtocolVersion { major, minor }
    }

    /// The subprotocol string advertised on the transport.
    pub fn subprotocol(&self) -> String {
        format!("electric.{}.{}", self.major, self.minor)
    }

    /// Checks a peer-offered subprotocol string against this version.
    /// Major and minor must both match.
    pub fn matches(&self, offered: &str) -> bool {
        offered == self.subprotocol()
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        ProtocolVersion::new(0, 8)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "electric.{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Protocol version this server speaks; mismatching peers are rejected
    /// at handshake.
    pub version: ProtocolVersion,

    /// Identity echoed to clients in the authentication response.
    pub server_id: String,

    /// Origin identifier stamped on every outbound transaction Begin.
    pub origin: String,

    /// Bounded buffer size (#events) between the connection worker and the
    /// consumer of client-originated transactions.
    pub buffer_events: usize,

    /// Bounded buffer size (#frames) for the outbound write queue.
    pub buffer_frames: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            version: ProtocolVersion::default(),
            server_id: "electric-server".into(),
            origin: "postgres_1".into(),
            buffer_events: 1024,
            buffer_frames: 4096,
        }
    }
}
