//! Events delivered asynchronously to the host.

use core::fmt;

/// Things that happen outside the request/response flow of an entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// First event, emitted once construction succeeds.
    Up,
    /// No root is reachable.
    Offline,
    /// At least one root answered recently.
    Online,
    /// Emitted from shutdown.
    Down,
    /// Another node's identity hashes to our address. The engine keeps
    /// answering entry points but is unusable by contract; the host must
    /// delete `identity.secret` and restart.
    FatalIdentityCollision,
    /// Diagnostic message.
    Trace(String),
}

impl Event {
    /// Numeric code matching the external surface.
    #[must_use]
    pub fn code(&self) -> u32 {
        match self {
            Event::Up => 0,
            Event::Offline => 1,
            Event::Online => 2,
            Event::Down => 3,
            Event::FatalIdentityCollision => 4,
            Event::Trace(_) => 5,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Up => f.write_str("UP"),
            Event::Offline => f.write_str("OFFLINE"),
            Event::Online => f.write_str("ONLINE"),
            Event::Down => f.write_str("DOWN"),
            Event::FatalIdentityCollision => f.write_str("FATAL_IDENTITY_COLLISION"),
            Event::Trace(msg) => write!(f, "TRACE: {msg}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_contract() {
        assert_eq!(Event::Up.code(), 0);
        assert_eq!(Event::Offline.code(), 1);
        assert_eq!(Event::Online.code(), 2);
        assert_eq!(Event::Down.code(), 3);
        assert_eq!(Event::FatalIdentityCollision.code(), 4);
        assert_eq!(Event::Trace(String::new()).code(), 5);
    }
}
