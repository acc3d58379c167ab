//! The world: a signed roster of planetary root servers.
//!
//! A world is issued and signed by a well-known planet key. Nodes ship with
//! a default world and accept an update only when the id matches, the
//! timestamp strictly increases, and the signature verifies. This makes the
//! root roster upgradeable in-band without letting anyone who is not the
//! planet operator move nodes onto rogue roots.

use std::net::SocketAddr;

use vether_crypto::ed25519::{Ed25519Public, Ed25519Secret, Ed25519Signature};

use crate::constants::{WORLD_MAX_ROOTS, WORLD_MAX_ROOT_ENDPOINTS};
use crate::endpoint::{read_endpoint, write_endpoint};
use crate::error::WorldError;
use crate::identity::Identity;

/// A root server entry: identity plus stable physical endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Root {
    pub identity: Identity,
    pub endpoints: Vec<SocketAddr>,
}

/// A signed root roster.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct World {
    pub id: u64,
    pub timestamp: u64,
    pub roots: Vec<Root>,
    signature: Ed25519Signature,
}

impl World {
    /// Build and sign a world with the planet secret key.
    pub fn sign(
        id: u64,
        timestamp: u64,
        roots: Vec<Root>,
        planet_secret: &Ed25519Secret,
    ) -> Result<Self, WorldError> {
        if roots.len() > WORLD_MAX_ROOTS {
            return Err(WorldError::TooManyRoots(roots.len()));
        }
        for root in &roots {
            if root.endpoints.len() > WORLD_MAX_ROOT_ENDPOINTS {
                return Err(WorldError::Malformed("too many root endpoints"));
            }
        }
        let body = signing_body(id, timestamp, &roots);
        let signature = planet_secret.sign(&body);
        Ok(Self {
            id,
            timestamp,
            roots,
            signature,
        })
    }

    /// Verify the roster signature against the planet public key.
    #[must_use]
    pub fn verify(&self, planet_key: &Ed25519Public) -> bool {
        let body = signing_body(self.id, self.timestamp, &self.roots);
        planet_key.verify(&body, &self.signature).is_ok()
    }

    /// Whether this world should replace `current`: same id, strictly newer.
    #[must_use]
    pub fn should_supersede(&self, current: &World) -> bool {
        self.id == current.id && self.timestamp > current.timestamp
    }

    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = signing_body(self.id, self.timestamp, &self.roots);
        out.extend_from_slice(&self.signature.to_bytes());
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, WorldError> {
        if bytes.len() < 17 {
            return Err(WorldError::Malformed("truncated world"));
        }
        let id = u64::from_be_bytes(bytes[0..8].try_into().expect("8 bytes"));
        let timestamp = u64::from_be_bytes(bytes[8..16].try_into().expect("8 bytes"));
        let root_count = bytes[16] as usize;
        if root_count > WORLD_MAX_ROOTS {
            return Err(WorldError::TooManyRoots(root_count));
        }

        let mut offset = 17;
        let mut roots = Vec::with_capacity(root_count);
        for _ in 0..root_count {
            let (identity, consumed) = Identity::from_wire(&bytes[offset..])?;
            offset += consumed;

            let ep_count = *bytes
                .get(offset)
                .ok_or(WorldError::Malformed("missing endpoint count"))?
                as usize;
            offset += 1;
            if ep_count > WORLD_MAX_ROOT_ENDPOINTS {
                return Err(WorldError::Malformed("too many root endpoints"));
            }

            let mut endpoints = Vec::with_capacity(ep_count);
            for _ in 0..ep_count {
                let (ep, consumed) = read_endpoint(&bytes[offset..])?;
                offset += consumed;
                endpoints.push(ep.ok_or(WorldError::Malformed("nil root endpoint"))?);
            }
            roots.push(Root {
                identity,
                endpoints,
            });
        }

        let sig_bytes: [u8; 64] = bytes
            .get(offset..offset + 64)
            .ok_or(WorldError::Malformed("missing signature"))?
            .try_into()
            .expect("64 bytes");
        offset += 64;
        if offset != bytes.len() {
            return Err(WorldError::Malformed("trailing bytes"));
        }

        Ok(Self {
            id,
            timestamp,
            roots,
            signature: Ed25519Signature::from_bytes(sig_bytes),
        })
    }
}

fn signing_body(id: u64, timestamp: u64, roots: &[Root]) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&timestamp.to_be_bytes());
    out.push(roots.len() as u8);
    for root in roots {
        out.extend_from_slice(&root.identity.to_wire());
        out.push(root.endpoints.len() as u8);
        for ep in &root.endpoints {
            write_endpoint(&mut out, Some(*ep));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::tests::{test_identity_a, test_identity_b};

    fn planet() -> Ed25519Secret {
        Ed25519Secret::from_bytes([0x0Du8; 32])
    }

    fn make_world(timestamp: u64) -> World {
        let roots = vec![
            Root {
                identity: test_identity_a().public_only(),
                endpoints: vec![
                    "198.51.100.1:9993".parse().unwrap(),
                    "[2001:db8::1]:9993".parse().unwrap(),
                ],
            },
            Root {
                identity: test_identity_b().public_only(),
                endpoints: vec!["203.0.113.7:9993".parse().unwrap()],
            },
        ];
        World::sign(0x6172, timestamp, roots, &planet()).unwrap()
    }

    #[test]
    fn serialize_parse_roundtrip() {
        let world = make_world(1000);
        let raw = world.serialize();
        let parsed = World::parse(&raw).unwrap();
        assert_eq!(parsed, world);
        assert_eq!(parsed.serialize(), raw);
    }

    #[test]
    fn signature_verifies_with_planet_key() {
        let world = make_world(1000);
        assert!(world.verify(&planet().public_key()));
        assert!(!world.verify(&Ed25519Secret::from_bytes([0x0E; 32]).public_key()));
    }

    #[test]
    fn tampered_roster_fails_verification() {
        let world = make_world(1000);
        let mut raw = world.serialize();
        raw[9] ^= 0x01; // timestamp byte
        let tampered = World::parse(&raw).unwrap();
        assert!(!tampered.verify(&planet().public_key()));
    }

    #[test]
    fn supersede_rules() {
        let current = make_world(1000);
        let newer = make_world(2000);
        let same = make_world(1000);

        assert!(newer.should_supersede(&current));
        assert!(!same.should_supersede(&current));
        assert!(!current.should_supersede(&newer));

        // Different world id never supersedes, regardless of timestamp.
        let other = World::sign(0x9999, 5000, vec![], &planet()).unwrap();
        assert!(!other.should_supersede(&current));
    }

    #[test]
    fn empty_roster_roundtrip() {
        let world = World::sign(1, 1, vec![], &planet()).unwrap();
        let parsed = World::parse(&world.serialize()).unwrap();
        assert!(parsed.roots.is_empty());
        assert!(parsed.verify(&planet().public_key()));
    }

    #[test]
    fn truncated_rejected() {
        let raw = make_world(1000).serialize();
        for len in [0, 5, 16, 17, raw.len() - 64, raw.len() - 1] {
            assert!(World::parse(&raw[..len]).is_err(), "len {len} should fail");
        }
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut raw = make_world(1000).serialize();
        raw.push(0);
        assert!(World::parse(&raw).is_err());
    }

    #[test]
    fn too_many_roots_rejected() {
        let root = Root {
            identity: test_identity_a().public_only(),
            endpoints: vec![],
        };
        let roots = vec![root; WORLD_MAX_ROOTS + 1];
        assert!(matches!(
            World::sign(1, 1, roots, &planet()),
            Err(WorldError::TooManyRoots(_))
        ));
    }
}
