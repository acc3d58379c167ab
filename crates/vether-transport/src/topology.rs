//! Root topology: the adopted world and root bookkeeping.
//!
//! The topology owns the currently adopted [`World`] and answers questions
//! about roots (is this address a root, what endpoints does it advertise).
//! World upgrades follow the strict rule: matching id, strictly newer
//! timestamp, valid planet signature, and every root identity passing local
//! validation.

use std::net::SocketAddr;

use tracing::{debug, warn};
use vether_core::identity::Identity;
use vether_core::world::World;
use vether_core::Address;
use vether_crypto::ed25519::Ed25519Public;

pub struct Topology {
    world: World,
    planet_key: Ed25519Public,
}

impl Topology {
    /// Adopt an initial world. The caller is responsible for having
    /// verified it (a compiled-in default, or a cached record that was
    /// verified when first adopted).
    pub fn new(world: World, planet_key: Ed25519Public) -> Self {
        Self { world, planet_key }
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    #[must_use]
    pub fn world_id(&self) -> u64 {
        self.world.id
    }

    #[must_use]
    pub fn world_timestamp(&self) -> u64 {
        self.world.timestamp
    }

    #[must_use]
    pub fn is_root(&self, address: Address) -> bool {
        self.world
            .roots
            .iter()
            .any(|r| r.identity.address() == address)
    }

    pub fn root_identity(&self, address: Address) -> Option<&Identity> {
        self.world
            .roots
            .iter()
            .map(|r| &r.identity)
            .find(|i| i.address() == address)
    }

    /// All root addresses in roster order.
    #[must_use]
    pub fn root_addresses(&self) -> Vec<Address> {
        self.world
            .roots
            .iter()
            .map(|r| r.identity.address())
            .collect()
    }

    pub fn root_endpoints(&self, address: Address) -> &[SocketAddr] {
        self.world
            .roots
            .iter()
            .find(|r| r.identity.address() == address)
            .map(|r| r.endpoints.as_slice())
            .unwrap_or(&[])
    }

    pub fn roots(&self) -> impl Iterator<Item = (Address, &[SocketAddr])> {
        self.world
            .roots
            .iter()
            .map(|r| (r.identity.address(), r.endpoints.as_slice()))
    }

    /// Consider adopting a candidate world received in-band.
    ///
    /// Returns true when the candidate replaced the current world; the
    /// caller should then persist the new serialized world.
    pub fn consider_upgrade(&mut self, candidate: World) -> bool {
        if !candidate.should_supersede(&self.world) {
            return false;
        }
        if !candidate.verify(&self.planet_key) {
            warn!(id = candidate.id, ts = candidate.timestamp, "world with bad signature ignored");
            return false;
        }
        if !candidate.roots.iter().all(|r| r.identity.locally_validate()) {
            warn!(id = candidate.id, "world carries an invalid root identity");
            return false;
        }
        debug!(
            id = candidate.id,
            from = self.world.timestamp,
            to = candidate.timestamp,
            roots = candidate.roots.len(),
            "world upgraded"
        );
        self.world = candidate;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::tests::{our_identity, their_identity};
    use vether_core::world::Root;
    use vether_crypto::ed25519::Ed25519Secret;

    fn planet() -> Ed25519Secret {
        Ed25519Secret::from_bytes([0x0Du8; 32])
    }

    fn world_at(timestamp: u64) -> World {
        let roots = vec![Root {
            identity: their_identity().public_only(),
            endpoints: vec!["198.51.100.1:9993".parse().unwrap()],
        }];
        World::sign(7, timestamp, roots, &planet()).unwrap()
    }

    #[test]
    fn root_lookup() {
        let topo = Topology::new(world_at(100), planet().public_key());
        let root_addr = their_identity().address();

        assert!(topo.is_root(root_addr));
        assert!(!topo.is_root(our_identity().address()));
        assert_eq!(topo.root_addresses(), vec![root_addr]);
        assert_eq!(topo.root_endpoints(root_addr).len(), 1);
        assert!(topo.root_endpoints(our_identity().address()).is_empty());
        assert_eq!(
            topo.root_identity(root_addr).unwrap().address(),
            root_addr
        );
    }

    #[test]
    fn upgrade_accepts_strictly_newer() {
        let mut topo = Topology::new(world_at(100), planet().public_key());
        assert!(topo.consider_upgrade(world_at(200)));
        assert_eq!(topo.world_timestamp(), 200);
    }

    #[test]
    fn upgrade_rejects_equal_or_older() {
        let mut topo = Topology::new(world_at(100), planet().public_key());
        assert!(!topo.consider_upgrade(world_at(100)));
        assert!(!topo.consider_upgrade(world_at(50)));
        assert_eq!(topo.world_timestamp(), 100);
    }

    #[test]
    fn upgrade_rejects_different_id() {
        let mut topo = Topology::new(world_at(100), planet().public_key());
        let other = World::sign(8, 500, vec![], &planet()).unwrap();
        assert!(!topo.consider_upgrade(other));
        assert_eq!(topo.world_id(), 7);
    }

    #[test]
    fn upgrade_rejects_wrong_signer() {
        let mut topo = Topology::new(world_at(100), planet().public_key());
        let rogue = Ed25519Secret::from_bytes([0x66; 32]);
        let candidate = World::sign(
            7,
            500,
            vec![Root {
                identity: our_identity().public_only(),
                endpoints: vec![],
            }],
            &rogue,
        )
        .unwrap();
        assert!(!topo.consider_upgrade(candidate));
        assert_eq!(topo.world_timestamp(), 100);
    }

    #[test]
    fn upgrade_rejects_spoofed_root_identity() {
        let mut topo = Topology::new(world_at(100), planet().public_key());

        // A root whose claimed address does not match its key material.
        let mut wire = our_identity().to_wire();
        wire[4] ^= 0x01;
        let (spoofed, _) = Identity::from_wire(&wire).unwrap();
        let candidate = World::sign(
            7,
            500,
            vec![Root {
                identity: spoofed,
                endpoints: vec![],
            }],
            &planet(),
        )
        .unwrap();
        assert!(!topo.consider_upgrade(candidate));
    }
}
