//! VL1 verbs and protocol error codes.

use core::fmt;

/// The verb byte of a VL1 packet (low five bits; high bits are flags
/// reserved for future compression signalling).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Verb {
    Nop = 0x00,
    Hello = 0x01,
    Error = 0x02,
    Ok = 0x03,
    Whois = 0x04,
    Rendezvous = 0x05,
    Frame = 0x06,
    ExtFrame = 0x07,
    Echo = 0x08,
    MulticastLike = 0x09,
    NetworkConfigRequest = 0x0b,
    NetworkConfigRefresh = 0x0c,
    MulticastGather = 0x0d,
    MulticastFrame = 0x0e,
    PushDirectPaths = 0x10,
    CircuitTest = 0x11,
    CircuitTestReport = 0x12,
}

impl Verb {
    pub const MASK: u8 = 0x1f;

    /// Decode a verb byte. Unknown verbs yield `None`; the caller drops the
    /// packet silently per protocol.
    #[must_use]
    pub fn from_u8(v: u8) -> Option<Self> {
        match v & Self::MASK {
            0x00 => Some(Verb::Nop),
            0x01 => Some(Verb::Hello),
            0x02 => Some(Verb::Error),
            0x03 => Some(Verb::Ok),
            0x04 => Some(Verb::Whois),
            0x05 => Some(Verb::Rendezvous),
            0x06 => Some(Verb::Frame),
            0x07 => Some(Verb::ExtFrame),
            0x08 => Some(Verb::Echo),
            0x09 => Some(Verb::MulticastLike),
            0x0b => Some(Verb::NetworkConfigRequest),
            0x0c => Some(Verb::NetworkConfigRefresh),
            0x0d => Some(Verb::MulticastGather),
            0x0e => Some(Verb::MulticastFrame),
            0x10 => Some(Verb::PushDirectPaths),
            0x11 => Some(Verb::CircuitTest),
            0x12 => Some(Verb::CircuitTestReport),
            _ => None,
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Verb::Nop => "NOP",
            Verb::Hello => "HELLO",
            Verb::Error => "ERROR",
            Verb::Ok => "OK",
            Verb::Whois => "WHOIS",
            Verb::Rendezvous => "RENDEZVOUS",
            Verb::Frame => "FRAME",
            Verb::ExtFrame => "EXT_FRAME",
            Verb::Echo => "ECHO",
            Verb::MulticastLike => "MULTICAST_LIKE",
            Verb::NetworkConfigRequest => "NETWORK_CONFIG_REQUEST",
            Verb::NetworkConfigRefresh => "NETWORK_CONFIG_REFRESH",
            Verb::MulticastGather => "MULTICAST_GATHER",
            Verb::MulticastFrame => "MULTICAST_FRAME",
            Verb::PushDirectPaths => "PUSH_DIRECT_PATHS",
            Verb::CircuitTest => "CIRCUIT_TEST",
            Verb::CircuitTestReport => "CIRCUIT_TEST_REPORT",
        };
        f.write_str(name)
    }
}

/// Error codes carried in ERROR verb replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolError {
    /// Non-specific failure.
    Generic = 0x01,
    /// Verb or operation not supported by the remote version.
    BadProtocolVersion = 0x02,
    /// The referenced object (identity, network, queue entry) was not found.
    ObjNotFound = 0x03,
    /// Our identity's address collides with another key's address.
    IdentityCollision = 0x05,
    /// Operation understood but not supported.
    UnsupportedOperation = 0x06,
    /// A membership certificate is required for this network.
    NeedMembershipCertificate = 0x07,
    /// The controller refused access to the network.
    NetworkAccessDenied = 0x08,
}

impl ProtocolError {
    #[must_use]
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(ProtocolError::Generic),
            0x02 => Some(ProtocolError::BadProtocolVersion),
            0x03 => Some(ProtocolError::ObjNotFound),
            0x05 => Some(ProtocolError::IdentityCollision),
            0x06 => Some(ProtocolError::UnsupportedOperation),
            0x07 => Some(ProtocolError::NeedMembershipCertificate),
            0x08 => Some(ProtocolError::NetworkAccessDenied),
            _ => None,
        }
    }
}
