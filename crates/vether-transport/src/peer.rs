//! Per-remote-node state.
//!
//! A peer is created on first authenticated sighting of an identity and
//! carries up to [`MAX_PEER_NETWORK_PATHS`] candidate paths, a latency EWMA,
//! and a role. The pairwise session key is agreed once at creation.

use std::net::SocketAddr;

use tracing::trace;
use vether_core::identity::Identity;
use vether_core::Address;

use crate::constants::{LATENCY_EWMA_OLD_WEIGHT, LATENCY_SAMPLE_MAX, MAX_PEER_NETWORK_PATHS};
use crate::error::TransportError;
use crate::path::Path;

/// Routing role of a peer. Roles differ by policy, not by shape: roots are
/// used as relays of last resort and count toward online status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Leaf,
    Relay,
    Root,
}

/// Remote protocol version as reported in HELLO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteVersion {
    pub major: u8,
    pub minor: u8,
    pub revision: u16,
}

pub struct Peer {
    identity: Identity,
    key: [u8; 32],
    pub role: PeerRole,
    paths: Vec<Path>,
    pub last_receive: u64,
    pub last_send: u64,
    pub last_hello_sent: u64,
    pub last_direct_path_push: u64,
    /// Last time we introduced this peer to another via RENDEZVOUS.
    pub last_introduction: u64,
    /// Smoothed round-trip latency in milliseconds.
    pub latency: Option<u32>,
    pub remote_version: Option<RemoteVersion>,
    /// Set when a cluster sibling has claimed this peer.
    pub cluster_redirect: Option<SocketAddr>,
}

impl Peer {
    /// Create a peer, deriving the pairwise session key.
    ///
    /// `ours` must carry its secret half. The remote identity is assumed to
    /// have been locally validated by the caller.
    pub fn new(ours: &Identity, theirs: Identity, role: PeerRole) -> Result<Self, TransportError> {
        let key = ours.agree(&theirs).map_err(|_| TransportError::NoAgreement)?;
        Ok(Self {
            identity: theirs,
            key,
            role,
            paths: Vec::new(),
            last_receive: 0,
            last_send: 0,
            last_hello_sent: 0,
            last_direct_path_push: 0,
            last_introduction: 0,
            latency: None,
            remote_version: None,
            cluster_redirect: None,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn address(&self) -> Address {
        self.identity.address()
    }

    /// The pairwise symmetric key for packet armor.
    #[must_use]
    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    pub fn paths(&self) -> &[Path] {
        &self.paths
    }

    /// Record an authenticated packet received over `(local, remote)`.
    ///
    /// Learns the path if it is new, evicting the least-recently-received
    /// path once the cap is reached.
    pub fn received(&mut self, now: u64, local: Option<SocketAddr>, remote: SocketAddr) {
        self.last_receive = now;
        if let Some(path) = self
            .paths
            .iter_mut()
            .find(|p| p.remote == remote && p.local == local)
        {
            path.last_receive = now;
            return;
        }
        self.learn_path(now, local, remote, true);
    }

    /// Learn a candidate path without marking it alive (a pushed hint).
    pub fn hint_path(&mut self, local: Option<SocketAddr>, remote: SocketAddr) {
        if self
            .paths
            .iter()
            .any(|p| p.remote == remote && p.local == local)
        {
            return;
        }
        self.learn_path(0, local, remote, false);
    }

    fn learn_path(&mut self, now: u64, local: Option<SocketAddr>, remote: SocketAddr, confirmed: bool) {
        if self.paths.len() >= MAX_PEER_NETWORK_PATHS {
            // Evict the least-recently-received, sparing the preferred path.
            if let Some(victim) = self
                .paths
                .iter()
                .enumerate()
                .filter(|(_, p)| !p.preferred)
                .min_by_key(|(_, p)| p.last_receive)
                .map(|(i, _)| i)
            {
                trace!(peer = %self.address(), evicted = %self.paths[victim].remote, "path table full");
                self.paths.swap_remove(victim);
            } else {
                return;
            }
        }
        let path = if confirmed {
            Path::new(local, remote, now)
        } else {
            Path::new_unconfirmed(local, remote)
        };
        self.paths.push(path);
    }

    /// Record bytes sent toward this peer (direct or relayed).
    pub fn sent(&mut self, now: u64) {
        self.last_send = now;
    }

    /// Record a send over a specific direct path.
    pub fn sent_via(&mut self, now: u64, remote: SocketAddr) {
        self.last_send = now;
        if let Some(path) = self.paths.iter_mut().find(|p| p.remote == remote) {
            path.last_send = now;
        }
    }

    /// Record a HELLO probe sent over a path.
    pub fn pinged(&mut self, now: u64, remote: SocketAddr) {
        self.last_hello_sent = now;
        if let Some(path) = self.paths.iter_mut().find(|p| p.remote == remote) {
            path.last_ping = now;
        }
    }

    /// Fold a round-trip sample into the peer EWMA and the path it was
    /// measured on, then re-elect the preferred path.
    ///
    /// The echoed timestamp in OK(HELLO) is peer-controlled, so the sample
    /// is clamped and the fold saturates; one hostile reply must not be
    /// able to overflow or permanently poison the average.
    pub fn record_latency(&mut self, now: u64, remote: SocketAddr, sample_ms: u32) {
        let sample_ms = sample_ms.min(LATENCY_SAMPLE_MAX);
        self.latency = Some(fold_latency(self.latency, sample_ms));
        if let Some(path) = self.paths.iter_mut().find(|p| p.remote == remote) {
            path.latency = Some(fold_latency(path.latency, sample_ms));
        }
        self.elect_preferred(now);
    }

    /// The current best path: alive first, then lowest latency, then IPv6
    /// over IPv4, then trust. Returns `None` when no path is alive.
    #[must_use]
    pub fn best_path(&self, now: u64) -> Option<&Path> {
        self.paths
            .iter()
            .filter(|p| p.alive(now))
            .min_by_key(|p| Self::preference_key(p))
    }

    fn preference_key(p: &Path) -> (u32, u8, u8, u8) {
        (
            p.latency.unwrap_or(u32::MAX),
            u8::from(!p.is_ipv6()),
            u8::MAX - p.trust,
            u8::from(!p.preferred),
        )
    }

    /// Re-mark the preferred flag on the current best path.
    pub fn elect_preferred(&mut self, now: u64) {
        let best = self
            .best_path(now)
            .map(|p| (p.local, p.remote));
        for path in &mut self.paths {
            path.preferred = best == Some((path.local, path.remote));
        }
    }

    #[must_use]
    pub fn has_alive_path(&self, now: u64) -> bool {
        self.paths.iter().any(|p| p.alive(now))
    }

    /// Remote endpoints that are due for a HELLO probe: every known path
    /// whose activity is stale.
    #[must_use]
    pub fn paths_needing_ping(&self, now: u64) -> Vec<SocketAddr> {
        self.paths
            .iter()
            .filter(|p| p.needs_ping(now))
            .map(|p| p.remote)
            .collect()
    }

    /// Drop paths that have seen no traffic at all for the expiry window.
    pub fn prune_expired_paths(&mut self, now: u64) {
        self.paths.retain(|p| !p.expired(now));
    }

    /// Direct-send candidate: the best alive path's remote endpoint.
    #[must_use]
    pub fn direct_send_endpoint(&self, now: u64) -> Option<(Option<SocketAddr>, SocketAddr)> {
        self.best_path(now).map(|p| (p.local, p.remote))
    }
}

fn fold_latency(old: Option<u32>, sample_ms: u32) -> u32 {
    match old {
        Some(old) => old
            .saturating_mul(LATENCY_EWMA_OLD_WEIGHT)
            .saturating_add(sample_ms)
            / (LATENCY_EWMA_OLD_WEIGHT + 1),
        None => sample_ms,
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("address", &self.address())
            .field("role", &self.role)
            .field("paths", &self.paths.len())
            .field("latency", &self.latency)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::constants::PATH_ALIVE_TIMEOUT;
    use std::sync::OnceLock;

    pub(crate) fn our_identity() -> &'static Identity {
        static ID: OnceLock<Identity> = OnceLock::new();
        ID.get_or_init(Identity::generate)
    }

    pub(crate) fn their_identity() -> &'static Identity {
        static ID: OnceLock<Identity> = OnceLock::new();
        ID.get_or_init(Identity::generate)
    }

    fn make_peer() -> Peer {
        Peer::new(
            our_identity(),
            their_identity().public_only(),
            PeerRole::Leaf,
        )
        .unwrap()
    }

    fn sa(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn session_key_matches_both_directions() {
        let peer = make_peer();
        let expected = their_identity().agree(our_identity()).unwrap();
        assert_eq!(peer.key(), &expected);
    }

    #[test]
    fn public_only_ours_cannot_build_peers() {
        let ours = our_identity().public_only();
        let result = Peer::new(&ours, their_identity().public_only(), PeerRole::Leaf);
        assert!(matches!(result, Err(TransportError::NoAgreement)));
    }

    #[test]
    fn received_learns_paths() {
        let mut peer = make_peer();
        peer.received(100, None, sa("198.51.100.1:9993"));
        peer.received(200, None, sa("198.51.100.1:9993"));
        assert_eq!(peer.paths().len(), 1);
        assert_eq!(peer.paths()[0].last_receive, 200);
        assert_eq!(peer.last_receive, 200);
    }

    #[test]
    fn path_cap_evicts_least_recently_received() {
        let mut peer = make_peer();
        for i in 0..MAX_PEER_NETWORK_PATHS {
            peer.received(100 + i as u64, None, sa(&format!("198.51.100.{}:9993", i + 1)));
        }
        assert_eq!(peer.paths().len(), MAX_PEER_NETWORK_PATHS);

        // The oldest (198.51.100.1) goes.
        peer.received(1_000, None, sa("203.0.113.99:9993"));
        assert_eq!(peer.paths().len(), MAX_PEER_NETWORK_PATHS);
        assert!(!peer.paths().iter().any(|p| p.remote == sa("198.51.100.1:9993")));
        assert!(peer.paths().iter().any(|p| p.remote == sa("203.0.113.99:9993")));
    }

    #[test]
    fn hint_path_is_unconfirmed_and_deduplicated() {
        let mut peer = make_peer();
        peer.hint_path(None, sa("198.51.100.9:9993"));
        peer.hint_path(None, sa("198.51.100.9:9993"));
        assert_eq!(peer.paths().len(), 1);
        assert!(!peer.has_alive_path(PATH_ALIVE_TIMEOUT));
    }

    #[test]
    fn best_path_prefers_low_latency() {
        let mut peer = make_peer();
        peer.received(1_000, None, sa("198.51.100.1:9993"));
        peer.received(1_000, None, sa("198.51.100.2:9993"));
        peer.record_latency(1_001, sa("198.51.100.1:9993"), 80);
        peer.record_latency(1_001, sa("198.51.100.2:9993"), 20);

        let best = peer.best_path(1_002).unwrap();
        assert_eq!(best.remote, sa("198.51.100.2:9993"));
        assert!(best.preferred);
    }

    #[test]
    fn best_path_prefers_ipv6_at_equal_latency() {
        let mut peer = make_peer();
        peer.received(1_000, None, sa("198.51.100.1:9993"));
        peer.received(1_000, None, sa("[2001:db8::1]:9993"));
        peer.record_latency(1_001, sa("198.51.100.1:9993"), 30);
        peer.record_latency(1_001, sa("[2001:db8::1]:9993"), 30);

        assert!(peer.best_path(1_002).unwrap().is_ipv6());
    }

    #[test]
    fn dead_paths_are_not_best() {
        let mut peer = make_peer();
        peer.received(0, None, sa("198.51.100.1:9993"));
        assert!(peer.best_path(PATH_ALIVE_TIMEOUT + 1).is_none());
        assert!(peer.direct_send_endpoint(PATH_ALIVE_TIMEOUT + 1).is_none());
    }

    #[test]
    fn latency_ewma_converges() {
        let mut peer = make_peer();
        peer.received(0, None, sa("198.51.100.1:9993"));
        peer.record_latency(1, sa("198.51.100.1:9993"), 100);
        assert_eq!(peer.latency, Some(100));
        peer.record_latency(2, sa("198.51.100.1:9993"), 20);
        // (100*3 + 20) / 4 = 80
        assert_eq!(peer.latency, Some(80));
        peer.record_latency(3, sa("198.51.100.1:9993"), 20);
        assert_eq!(peer.latency, Some(65));
    }

    #[test]
    fn hostile_latency_samples_are_clamped_not_overflowed() {
        let mut peer = make_peer();
        peer.received(0, None, sa("198.51.100.1:9993"));

        // A peer echoing an ancient timestamp yields an absurd sample; it
        // must clamp, and the next fold must not overflow the multiply.
        peer.record_latency(1, sa("198.51.100.1:9993"), u32::MAX);
        assert_eq!(peer.latency, Some(LATENCY_SAMPLE_MAX));
        let path_latency = peer.paths()[0].latency;
        assert_eq!(path_latency, Some(LATENCY_SAMPLE_MAX));

        peer.record_latency(2, sa("198.51.100.1:9993"), u32::MAX);
        assert_eq!(peer.latency, Some(LATENCY_SAMPLE_MAX));
        assert_eq!(peer.paths()[0].latency, Some(LATENCY_SAMPLE_MAX));

        // An honest sample afterwards pulls the average back down.
        peer.record_latency(3, sa("198.51.100.1:9993"), 20);
        assert!(peer.latency.unwrap() < LATENCY_SAMPLE_MAX);
    }

    #[test]
    fn latency_fold_saturates_at_the_top() {
        // Even with a poisoned prior state the fold stays defined.
        assert_eq!(
            super::fold_latency(Some(u32::MAX), u32::MAX),
            u32::MAX / (LATENCY_EWMA_OLD_WEIGHT + 1)
        );
        assert_eq!(super::fold_latency(None, 7), 7);
    }

    #[test]
    fn pings_target_stale_paths() {
        let mut peer = make_peer();
        peer.received(0, None, sa("198.51.100.1:9993"));
        peer.received(50_000, None, sa("198.51.100.2:9993"));

        let due = peer.paths_needing_ping(60_000);
        assert_eq!(due, vec![sa("198.51.100.1:9993")]);

        peer.pinged(60_000, sa("198.51.100.1:9993"));
        assert!(peer.paths_needing_ping(60_001).is_empty());
    }

    #[test]
    fn prune_drops_long_idle_paths() {
        let mut peer = make_peer();
        peer.received(0, None, sa("198.51.100.1:9993"));
        peer.received(500_000, None, sa("198.51.100.2:9993"));
        peer.prune_expired_paths(700_000);
        assert_eq!(peer.paths().len(), 1);
        assert_eq!(peer.paths()[0].remote, sa("198.51.100.2:9993"));
    }
}
