//! Cluster facility: several engine instances acting as one root.
//!
//! Siblings exchange authenticated messages over a host-provided transport:
//! heartbeats carrying geographic coordinates and advertised endpoints, and
//! peer-sighting claims. When a peer contacts us and a live sibling is
//! geographically closer to the peer's endpoint, the caller redirects the
//! peer to that sibling's endpoints.
//!
//! Messages are armored like packets: `iv(8) | mac(8) | ciphertext`, with
//! Salsa20/12 keyed by the shared cluster key, the Poly1305 key drawn from
//! the first 32 keystream bytes, and the body encrypted from byte 32.

use std::collections::HashMap;
use std::net::SocketAddr;

use tracing::{debug, trace};
use vether_core::constants::CLUSTER_MAX_MESSAGE_LENGTH;
use vether_core::endpoint::{read_endpoint, write_endpoint};
use vether_core::{Address, PacketId};
use vether_crypto::poly::packet_mac;
use vether_crypto::salsa::Salsa12Stream;

use crate::constants::{CLUSTER_HEARTBEAT_INTERVAL, CLUSTER_MAX_MEMBERS, CLUSTER_MEMBER_ALIVE_TIMEOUT};
use crate::error::TransportError;

const MSG_HEARTBEAT: u8 = 1;
const MSG_PEER_SIGHTING: u8 = 2;

const ENVELOPE_OVERHEAD: usize = 16;

/// Integer geographic coordinates, as produced by the host's geo function.
pub type GeoCoords = (i32, i32, i32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterMessage {
    /// Periodic liveness beacon with location and reachable endpoints.
    Heartbeat {
        member: u16,
        coords: GeoCoords,
        endpoints: Vec<SocketAddr>,
    },
    /// A sibling announces it is currently serving a peer.
    PeerSighting { member: u16, peer: Address },
}

impl ClusterMessage {
    fn encode_body(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        match self {
            ClusterMessage::Heartbeat {
                member,
                coords,
                endpoints,
            } => {
                out.push(MSG_HEARTBEAT);
                out.extend_from_slice(&member.to_be_bytes());
                out.extend_from_slice(&coords.0.to_be_bytes());
                out.extend_from_slice(&coords.1.to_be_bytes());
                out.extend_from_slice(&coords.2.to_be_bytes());
                out.push(endpoints.len() as u8);
                for ep in endpoints {
                    write_endpoint(&mut out, Some(*ep));
                }
            }
            ClusterMessage::PeerSighting { member, peer } => {
                out.push(MSG_PEER_SIGHTING);
                out.extend_from_slice(&member.to_be_bytes());
                out.extend_from_slice(&peer.to_bytes());
            }
        }
        out
    }

    fn decode_body(body: &[u8]) -> Result<Self, TransportError> {
        match body.first() {
            Some(&MSG_HEARTBEAT) => {
                if body.len() < 16 {
                    return Err(TransportError::ClusterMessageInvalid);
                }
                let member = u16::from_be_bytes(body[1..3].try_into().expect("2 bytes"));
                let x = i32::from_be_bytes(body[3..7].try_into().expect("4 bytes"));
                let y = i32::from_be_bytes(body[7..11].try_into().expect("4 bytes"));
                let z = i32::from_be_bytes(body[11..15].try_into().expect("4 bytes"));
                let count = body[15] as usize;
                let mut offset = 16;
                let mut endpoints = Vec::with_capacity(count);
                for _ in 0..count {
                    let (ep, consumed) = read_endpoint(&body[offset..])
                        .map_err(|_| TransportError::ClusterMessageInvalid)?;
                    offset += consumed;
                    endpoints.push(ep.ok_or(TransportError::ClusterMessageInvalid)?);
                }
                Ok(ClusterMessage::Heartbeat {
                    member,
                    coords: (x, y, z),
                    endpoints,
                })
            }
            Some(&MSG_PEER_SIGHTING) => {
                if body.len() < 8 {
                    return Err(TransportError::ClusterMessageInvalid);
                }
                let member = u16::from_be_bytes(body[1..3].try_into().expect("2 bytes"));
                let peer = Address::from_bytes(body[3..8].try_into().expect("5 bytes"));
                Ok(ClusterMessage::PeerSighting { member, peer })
            }
            _ => Err(TransportError::ClusterMessageInvalid),
        }
    }
}

/// A sibling engine instance.
#[derive(Debug, Clone)]
pub struct ClusterMember {
    pub coords: GeoCoords,
    pub endpoints: Vec<SocketAddr>,
    pub last_heartbeat: u64,
}

impl ClusterMember {
    #[must_use]
    pub fn alive(&self, now: u64) -> bool {
        now.saturating_sub(self.last_heartbeat) < CLUSTER_MEMBER_ALIVE_TIMEOUT
    }
}

/// Cluster state for one engine instance.
pub struct Cluster {
    self_id: u16,
    key: [u8; 32],
    coords: GeoCoords,
    members: HashMap<u16, ClusterMember>,
    /// Which sibling most recently claimed each peer.
    peer_affinity: HashMap<Address, u16>,
    pub last_heartbeat_sent: u64,
}

impl Cluster {
    pub fn new(self_id: u16, key: [u8; 32], coords: GeoCoords) -> Self {
        Self {
            self_id,
            key,
            coords,
            members: HashMap::new(),
            peer_affinity: HashMap::new(),
            last_heartbeat_sent: 0,
        }
    }

    #[must_use]
    pub fn self_id(&self) -> u16 {
        self.self_id
    }

    /// Armor a message for the sibling transport.
    pub fn encode_message(&self, message: &ClusterMessage) -> Result<Vec<u8>, TransportError> {
        let mut body = message.encode_body();
        if body.len() + ENVELOPE_OVERHEAD > CLUSTER_MAX_MESSAGE_LENGTH {
            return Err(TransportError::ClusterMessageTooLong(
                body.len() + ENVELOPE_OVERHEAD,
            ));
        }

        let iv = PacketId::random().to_bytes();
        let mut stream = Salsa12Stream::new(&self.key, &iv);
        let mut poly_key = [0u8; 32];
        stream.keystream(&mut poly_key);
        stream.apply(&mut body);

        let mac = packet_mac(&poly_key, &body);
        let mut out = Vec::with_capacity(ENVELOPE_OVERHEAD + body.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&mac);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Authenticate and decode a sibling message.
    pub fn decode_message(&self, raw: &[u8]) -> Result<ClusterMessage, TransportError> {
        if raw.len() < ENVELOPE_OVERHEAD || raw.len() > CLUSTER_MAX_MESSAGE_LENGTH {
            return Err(TransportError::ClusterMessageInvalid);
        }
        let iv: [u8; 8] = raw[0..8].try_into().expect("8 bytes");
        let mac: [u8; 8] = raw[8..16].try_into().expect("8 bytes");
        let mut body = raw[16..].to_vec();

        let mut stream = Salsa12Stream::new(&self.key, &iv);
        let mut poly_key = [0u8; 32];
        stream.keystream(&mut poly_key);
        if packet_mac(&poly_key, &body) != mac {
            return Err(TransportError::ClusterMessageInvalid);
        }
        stream.apply(&mut body);
        ClusterMessage::decode_body(&body)
    }

    /// Apply a decoded sibling message to cluster state.
    pub fn handle_message(
        &mut self,
        message: ClusterMessage,
        now: u64,
    ) -> Result<(), TransportError> {
        match message {
            ClusterMessage::Heartbeat {
                member,
                coords,
                endpoints,
            } => {
                if member == self.self_id {
                    return Ok(());
                }
                if !self.members.contains_key(&member) && self.members.len() >= CLUSTER_MAX_MEMBERS
                {
                    return Err(TransportError::ClusterFull);
                }
                trace!(member, "cluster heartbeat");
                self.members.insert(
                    member,
                    ClusterMember {
                        coords,
                        endpoints,
                        last_heartbeat: now,
                    },
                );
                Ok(())
            }
            ClusterMessage::PeerSighting { member, peer } => {
                if member != self.self_id {
                    self.peer_affinity.insert(peer, member);
                }
                Ok(())
            }
        }
    }

    /// Seed a member from out-of-band provisioning. Heartbeats will keep
    /// it alive (or let it die) from here on.
    pub fn add_member(
        &mut self,
        member: u16,
        coords: GeoCoords,
        endpoints: Vec<SocketAddr>,
        now: u64,
    ) -> Result<(), TransportError> {
        if member == self.self_id {
            return Ok(());
        }
        if !self.members.contains_key(&member) && self.members.len() >= CLUSTER_MAX_MEMBERS {
            return Err(TransportError::ClusterFull);
        }
        self.members.insert(
            member,
            ClusterMember {
                coords,
                endpoints,
                last_heartbeat: now,
            },
        );
        Ok(())
    }

    /// Remove a member and orphan any peers attributed to it.
    pub fn remove_member(&mut self, member: u16) {
        self.members.remove(&member);
        self.peer_affinity.retain(|_, m| *m != member);
    }

    /// Whether it is time to emit our own heartbeat.
    #[must_use]
    pub fn heartbeat_due(&self, now: u64) -> bool {
        self.last_heartbeat_sent == 0
            || now.saturating_sub(self.last_heartbeat_sent) >= CLUSTER_HEARTBEAT_INTERVAL
    }

    /// Build our heartbeat message.
    pub fn make_heartbeat(&self, endpoints: Vec<SocketAddr>) -> ClusterMessage {
        ClusterMessage::Heartbeat {
            member: self.self_id,
            coords: self.coords,
            endpoints,
        }
    }

    /// Build a sighting claim for a peer we are serving.
    pub fn make_peer_sighting(&self, peer: Address) -> ClusterMessage {
        ClusterMessage::PeerSighting {
            member: self.self_id,
            peer,
        }
    }

    /// If a live sibling is strictly closer to `peer_coords` than we are,
    /// return it for redirection.
    #[must_use]
    pub fn closer_member(&self, peer_coords: GeoCoords, now: u64) -> Option<(u16, &ClusterMember)> {
        let our_distance = distance_sq(self.coords, peer_coords);
        self.members
            .iter()
            .filter(|(_, m)| m.alive(now) && !m.endpoints.is_empty())
            .map(|(id, m)| (*id, m, distance_sq(m.coords, peer_coords)))
            .filter(|(_, _, d)| *d < our_distance)
            .min_by_key(|(_, _, d)| *d)
            .map(|(id, m, _)| (id, m))
    }

    /// Drop dead members and return the peers whose affinity pointed at
    /// them; those peers are reclaimable by anyone.
    pub fn reap_dead(&mut self, now: u64) -> Vec<Address> {
        let dead: Vec<u16> = self
            .members
            .iter()
            .filter(|(_, m)| !m.alive(now))
            .map(|(id, _)| *id)
            .collect();
        for id in &dead {
            debug!(member = id, "cluster member dead");
            self.members.remove(id);
        }
        let reclaimed: Vec<Address> = self
            .peer_affinity
            .iter()
            .filter(|(_, m)| dead.contains(m))
            .map(|(a, _)| *a)
            .collect();
        for addr in &reclaimed {
            self.peer_affinity.remove(addr);
        }
        reclaimed
    }

    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Ids of all currently known members (alive or not).
    #[must_use]
    pub fn member_ids(&self) -> Vec<u16> {
        self.members.keys().copied().collect()
    }
}

fn distance_sq(a: GeoCoords, b: GeoCoords) -> i64 {
    let dx = i64::from(a.0) - i64::from(b.0);
    let dy = i64::from(a.1) - i64::from(b.1);
    let dz = i64::from(a.2) - i64::from(b.2);
    dx * dx + dy * dy + dz * dz
}
