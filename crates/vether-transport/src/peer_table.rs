//! Address-keyed peer table.
//!
//! Peers are uniquely indexed by 40-bit address. Two different identities
//! deriving the same address is a fatal identity collision, surfaced as an
//! error so the engine can raise the corresponding event.

use std::collections::HashMap;

use vether_core::identity::Identity;
use vether_core::Address;

use crate::error::TransportError;
use crate::peer::{Peer, PeerRole};

#[derive(Default)]
pub struct PeerTable {
    peers: HashMap<Address, Peer>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
        }
    }

    #[must_use]
    pub fn get(&self, address: Address) -> Option<&Peer> {
        self.peers.get(&address)
    }

    pub fn get_mut(&mut self, address: Address) -> Option<&mut Peer> {
        self.peers.get_mut(&address)
    }

    #[must_use]
    pub fn contains(&self, address: Address) -> bool {
        self.peers.contains_key(&address)
    }

    /// Fetch the peer for an identity, creating it on first sighting.
    ///
    /// Fails with [`TransportError::AddressCollision`] if a *different*
    /// identity already owns the address.
    pub fn get_or_create(
        &mut self,
        ours: &Identity,
        theirs: &Identity,
        role: PeerRole,
    ) -> Result<&mut Peer, TransportError> {
        let address = theirs.address();
        if let Some(existing) = self.peers.get(&address) {
            if existing.identity().public_key_bytes() != theirs.public_key_bytes() {
                return Err(TransportError::AddressCollision(address));
            }
        } else {
            let peer = Peer::new(ours, theirs.public_only(), role)?;
            self.peers.insert(address, peer);
        }
        Ok(self.peers.get_mut(&address).expect("just ensured"))
    }

    pub fn remove(&mut self, address: Address) -> Option<Peer> {
        self.peers.remove(&address)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Address, &Peer)> {
        self.peers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&Address, &mut Peer)> {
        self.peers.iter_mut()
    }

    /// The lowest-latency peer among `candidates` with an alive path.
    #[must_use]
    pub fn best_alive_of(&self, candidates: &[Address], now: u64) -> Option<Address> {
        candidates
            .iter()
            .filter_map(|a| self.peers.get(a).map(|p| (a, p)))
            .filter(|(_, p)| p.has_alive_path(now))
            .min_by_key(|(_, p)| p.latency.unwrap_or(u32::MAX))
            .map(|(a, _)| *a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::tests::{our_identity, their_identity};

    #[test]
    fn create_then_get() {
        let mut table = PeerTable::new();
        assert!(table.is_empty());

        let addr = their_identity().address();
        table
            .get_or_create(our_identity(), their_identity(), PeerRole::Leaf)
            .unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.contains(addr));
        assert_eq!(table.get(addr).unwrap().address(), addr);
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let mut table = PeerTable::new();
        table
            .get_or_create(our_identity(), their_identity(), PeerRole::Leaf)
            .unwrap();
        table
            .get_or_create(our_identity(), their_identity(), PeerRole::Root)
            .unwrap();
        assert_eq!(table.len(), 1);
        // Role is set at creation and not silently rewritten.
        assert_eq!(
            table.get(their_identity().address()).unwrap().role,
            crate::peer::PeerRole::Leaf
        );
    }

    #[test]
    fn collision_detected() {
        let mut table = PeerTable::new();
        table
            .get_or_create(our_identity(), their_identity(), PeerRole::Leaf)
            .unwrap();

        // Same address, different key material: forge the wire form.
        let mut wire = our_identity().to_wire();
        wire[..5].copy_from_slice(&their_identity().address().to_bytes());
        let (forged, _) = Identity::from_wire(&wire).unwrap();

        let result = table.get_or_create(our_identity(), &forged, PeerRole::Leaf);
        assert!(matches!(result, Err(TransportError::AddressCollision(a))
            if a == their_identity().address()));
    }

    #[test]
    fn remove_forgets() {
        let mut table = PeerTable::new();
        let addr = their_identity().address();
        table
            .get_or_create(our_identity(), their_identity(), PeerRole::Leaf)
            .unwrap();
        assert!(table.remove(addr).is_some());
        assert!(!table.contains(addr));
        assert!(table.remove(addr).is_none());
    }

    #[test]
    fn best_alive_of_picks_lowest_latency() {
        let mut table = PeerTable::new();
        let addr = their_identity().address();
        {
            let peer = table
                .get_or_create(our_identity(), their_identity(), PeerRole::Root)
                .unwrap();
            peer.received(1_000, None, "198.51.100.1:9993".parse().unwrap());
            peer.record_latency(1_000, "198.51.100.1:9993".parse().unwrap(), 40);
        }

        assert_eq!(table.best_alive_of(&[addr], 1_001), Some(addr));
        // A candidate with no peer entry or no alive path is skipped.
        assert_eq!(
            table.best_alive_of(&[vether_core::Address::from_u64(0x42)], 1_001),
            None
        );
    }
}
