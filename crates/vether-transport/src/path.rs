//! A candidate underlay path to a peer.
//!
//! Paths are learned from inbound authenticated packets and from
//! PUSH_DIRECT_PATHS hints; they age out when unused. Liveness is purely a
//! function of when the path last yielded an authenticated packet.

use std::net::SocketAddr;

use crate::constants::{PATH_ALIVE_TIMEOUT, PATH_EXPIRATION, PING_INTERVAL};

/// One (local, remote) underlay address pair for reaching a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    /// The local socket the path uses, when the host reports one.
    pub local: Option<SocketAddr>,
    pub remote: SocketAddr,
    pub last_send: u64,
    pub last_receive: u64,
    pub last_ping: u64,
    /// Measured round-trip time on this path, once a HELLO has completed.
    pub latency: Option<u32>,
    /// Host-assigned trust level; higher wins ties.
    pub trust: u8,
    pub preferred: bool,
}

impl Path {
    pub fn new(local: Option<SocketAddr>, remote: SocketAddr, now: u64) -> Self {
        Self {
            local,
            remote,
            last_send: 0,
            last_receive: now,
            last_ping: 0,
            latency: None,
            trust: 0,
            preferred: false,
        }
    }

    /// A path that has not been heard from yet (e.g. a pushed hint).
    pub fn new_unconfirmed(local: Option<SocketAddr>, remote: SocketAddr) -> Self {
        Self {
            local,
            remote,
            last_send: 0,
            last_receive: 0,
            last_ping: 0,
            latency: None,
            trust: 0,
            preferred: false,
        }
    }

    /// Alive: received an authenticated packet within the liveness window.
    #[must_use]
    pub fn alive(&self, now: u64) -> bool {
        now.saturating_sub(self.last_receive) < PATH_ALIVE_TIMEOUT
    }

    /// Whether this path is due for a keepalive probe.
    #[must_use]
    pub fn needs_ping(&self, now: u64) -> bool {
        let last_activity = self.last_receive.max(self.last_ping);
        now.saturating_sub(last_activity) >= PING_INTERVAL
    }

    /// Whether the path is stale enough to forget entirely.
    #[must_use]
    pub fn expired(&self, now: u64) -> bool {
        let last_activity = self
            .last_receive
            .max(self.last_send)
            .max(self.last_ping);
        now.saturating_sub(last_activity) >= PATH_EXPIRATION
    }

    /// IPv6 paths are preferred over IPv4 at equal latency.
    #[must_use]
    pub fn is_ipv6(&self) -> bool {
        self.remote.is_ipv6()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> SocketAddr {
        "198.51.100.1:9993".parse().unwrap()
    }

    #[test]
    fn fresh_path_is_alive() {
        let path = Path::new(None, remote(), 1_000);
        assert!(path.alive(1_000));
        assert!(path.alive(1_000 + PATH_ALIVE_TIMEOUT - 1));
        assert!(!path.alive(1_000 + PATH_ALIVE_TIMEOUT));
    }

    #[test]
    fn unconfirmed_path_is_dead() {
        let path = Path::new_unconfirmed(None, remote());
        assert!(!path.alive(PATH_ALIVE_TIMEOUT + 1));
    }

    #[test]
    fn ping_due_after_interval() {
        let mut path = Path::new(None, remote(), 0);
        assert!(!path.needs_ping(PING_INTERVAL - 1));
        assert!(path.needs_ping(PING_INTERVAL));

        // A recorded ping suppresses further probes for another interval.
        path.last_ping = PING_INTERVAL;
        assert!(!path.needs_ping(PING_INTERVAL + 1));
        assert!(path.needs_ping(2 * PING_INTERVAL));
    }

    #[test]
    fn expiry_tracks_all_activity() {
        let mut path = Path::new(None, remote(), 0);
        assert!(path.expired(PATH_EXPIRATION));

        path.last_send = PATH_EXPIRATION;
        assert!(!path.expired(PATH_EXPIRATION + 1));
        assert!(path.expired(2 * PATH_EXPIRATION));
    }

    #[test]
    fn address_family() {
        let v4 = Path::new(None, remote(), 0);
        assert!(!v4.is_ipv6());
        let v6 = Path::new(None, "[2001:db8::1]:9993".parse().unwrap(), 0);
        assert!(v6.is_ipv6());
    }
}
