//! Verb body codecs.
//!
//! Each VL1 verb has a small binary body following the verb byte. All
//! integers are big-endian. Certificates of membership, when carried, are
//! self-delimiting and prefixed by a flags bit in the owning verb.

use std::collections::VecDeque;
use std::net::SocketAddr;

use vether_core::constants::{CIRCUIT_TEST_MAX_HOPS, CIRCUIT_TEST_MAX_HOP_BREADTH};
use vether_core::endpoint::{read_endpoint, write_endpoint};
use vether_core::identity::Identity;
use vether_core::verb::Verb;
use vether_core::{Address, Mac, NetworkId, PacketId, WireError};
use vether_network::{CertificateOfMembership, MulticastGroup};

const FLAG_COM_ATTACHED: u8 = 0x01;

fn need(bytes: &[u8], min: usize) -> Result<(), WireError> {
    if bytes.len() < min {
        return Err(WireError::TooShort {
            min,
            actual: bytes.len(),
        });
    }
    Ok(())
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    u64::from_be_bytes(bytes[offset..offset + 8].try_into().expect("8 bytes"))
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes(bytes[offset..offset + 2].try_into().expect("2 bytes"))
}

fn read_address(bytes: &[u8], offset: usize) -> Address {
    Address::from_bytes(bytes[offset..offset + 5].try_into().expect("5 bytes"))
}

fn read_mac(bytes: &[u8], offset: usize) -> Mac {
    Mac::from_bytes(bytes[offset..offset + 6].try_into().expect("6 bytes"))
}

fn write_optional_com(out: &mut Vec<u8>, com: Option<&CertificateOfMembership>) {
    match com {
        Some(com) => {
            out.push(FLAG_COM_ATTACHED);
            out.extend_from_slice(&com.serialize());
        }
        None => out.push(0),
    }
}

fn read_optional_com(
    bytes: &[u8],
) -> Result<(Option<CertificateOfMembership>, usize), WireError> {
    need(bytes, 1)?;
    if bytes[0] & FLAG_COM_ATTACHED == 0 {
        return Ok((None, 1));
    }
    let (com, consumed) = CertificateOfMembership::parse(&bytes[1..])
        .map_err(|_| WireError::Malformed("bad membership certificate"))?;
    Ok((Some(com), 1 + consumed))
}

// ---------------------------------------------------------------- HELLO --

/// HELLO: always sent unencrypted, since the receiver may not yet know the
/// sender's key. Carries the full identity and the sender's world revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub protocol_version: u8,
    pub major: u8,
    pub minor: u8,
    pub revision: u16,
    /// Sender clock at transmission; echoed back for RTT measurement.
    pub timestamp: u64,
    pub identity: Identity,
    pub world_id: u64,
    pub world_timestamp: u64,
}

impl Hello {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + 71);
        out.push(self.protocol_version);
        out.push(self.major);
        out.push(self.minor);
        out.extend_from_slice(&self.revision.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.identity.to_wire());
        out.extend_from_slice(&self.world_id.to_be_bytes());
        out.extend_from_slice(&self.world_timestamp.to_be_bytes());
        out
    }

    pub fn parse(body: &[u8]) -> Result<Self, WireError> {
        need(body, 13)?;
        let protocol_version = body[0];
        let major = body[1];
        let minor = body[2];
        let revision = read_u16(body, 3);
        let timestamp = read_u64(body, 5);
        let (identity, consumed) = Identity::from_wire(&body[13..])
            .map_err(|_| WireError::Malformed("bad identity in HELLO"))?;
        let offset = 13 + consumed;
        need(body, offset + 16)?;
        Ok(Self {
            protocol_version,
            major,
            minor,
            revision,
            timestamp,
            identity,
            world_id: read_u64(body, offset),
            world_timestamp: read_u64(body, offset + 8),
        })
    }
}

// ------------------------------------------------------------- OK/ERROR --

/// The envelope shared by every OK reply: what it answers, then a
/// verb-specific payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OkEnvelope {
    pub in_re: Verb,
    pub in_re_packet_id: PacketId,
    pub payload: Vec<u8>,
}

impl OkEnvelope {
    #[must_use]
    pub fn encode(in_re: Verb, in_re_packet_id: PacketId, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(9 + payload.len());
        out.push(in_re as u8);
        out.extend_from_slice(&in_re_packet_id.to_bytes());
        out.extend_from_slice(payload);
        out
    }

    pub fn parse(body: &[u8]) -> Result<Self, WireError> {
        need(body, 9)?;
        let in_re = Verb::from_u8(body[0]).ok_or(WireError::Malformed("unknown in-re verb"))?;
        Ok(Self {
            in_re,
            in_re_packet_id: PacketId::from_u64(read_u64(body, 1)),
            payload: body[9..].to_vec(),
        })
    }
}

/// ERROR body: what failed, the code, and code-specific data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub in_re: u8,
    pub in_re_packet_id: PacketId,
    pub code: u8,
    pub data: Vec<u8>,
}

impl ErrorBody {
    #[must_use]
    pub fn encode(in_re: Verb, in_re_packet_id: PacketId, code: u8, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(10 + data.len());
        out.push(in_re as u8);
        out.extend_from_slice(&in_re_packet_id.to_bytes());
        out.push(code);
        out.extend_from_slice(data);
        out
    }

    pub fn parse(body: &[u8]) -> Result<Self, WireError> {
        need(body, 10)?;
        Ok(Self {
            in_re: body[0],
            in_re_packet_id: PacketId::from_u64(read_u64(body, 1)),
            code: body[9],
            data: body[10..].to_vec(),
        })
    }
}

/// OK(HELLO) payload: echoed timestamp, responder version, optionally a
/// newer world.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OkHello {
    pub timestamp_echo: u64,
    pub protocol_version: u8,
    pub major: u8,
    pub minor: u8,
    pub revision: u16,
    /// Serialized world, present when the responder's is newer.
    pub world: Option<Vec<u8>>,
}

impl OkHello {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(15 + self.world.as_ref().map_or(0, Vec::len));
        out.extend_from_slice(&self.timestamp_echo.to_be_bytes());
        out.push(self.protocol_version);
        out.push(self.major);
        out.push(self.minor);
        out.extend_from_slice(&self.revision.to_be_bytes());
        match &self.world {
            Some(world) => {
                out.extend_from_slice(&(world.len() as u16).to_be_bytes());
                out.extend_from_slice(world);
            }
            None => out.extend_from_slice(&0u16.to_be_bytes()),
        }
        out
    }

    pub fn parse(payload: &[u8]) -> Result<Self, WireError> {
        need(payload, 15)?;
        let world_len = read_u16(payload, 13) as usize;
        need(payload, 15 + world_len)?;
        Ok(Self {
            timestamp_echo: read_u64(payload, 0),
            protocol_version: payload[8],
            major: payload[9],
            minor: payload[10],
            revision: read_u16(payload, 11),
            world: (world_len > 0).then(|| payload[15..15 + world_len].to_vec()),
        })
    }
}

// ---------------------------------------------------------------- WHOIS --

pub fn encode_whois(address: Address) -> Vec<u8> {
    address.to_bytes().to_vec()
}

pub fn parse_whois(body: &[u8]) -> Result<Address, WireError> {
    need(body, 5)?;
    Ok(read_address(body, 0))
}

// ----------------------------------------------------------- RENDEZVOUS --

/// A root's hole-punch hint: the other peer and its inferred endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendezvous {
    pub peer: Address,
    pub endpoint: SocketAddr,
}

impl Rendezvous {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + 19);
        out.extend_from_slice(&self.peer.to_bytes());
        write_endpoint(&mut out, Some(self.endpoint));
        out
    }

    pub fn parse(body: &[u8]) -> Result<Self, WireError> {
        need(body, 6)?;
        let peer = read_address(body, 0);
        let (endpoint, _) = read_endpoint(&body[5..])?;
        Ok(Self {
            peer,
            endpoint: endpoint.ok_or(WireError::Malformed("nil rendezvous endpoint"))?,
        })
    }
}

// ------------------------------------------------------------ VL2 verbs --

/// FRAME: a unicast Ethernet frame between the derived MACs of sender and
/// receiver on a network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBody {
    pub nwid: NetworkId,
    pub com: Option<CertificateOfMembership>,
    pub ethertype: u16,
    pub payload: Vec<u8>,
}

impl FrameBody {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(11 + self.payload.len());
        out.extend_from_slice(&self.nwid.as_u64().to_be_bytes());
        write_optional_com(&mut out, self.com.as_ref());
        out.extend_from_slice(&self.ethertype.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn parse(body: &[u8]) -> Result<Self, WireError> {
        need(body, 9)?;
        let nwid = NetworkId::from_u64(read_u64(body, 0));
        let (com, consumed) = read_optional_com(&body[8..])?;
        let offset = 8 + consumed;
        need(body, offset + 2)?;
        Ok(Self {
            nwid,
            com,
            ethertype: read_u16(body, offset),
            payload: body[offset + 2..].to_vec(),
        })
    }
}

/// EXT_FRAME: a frame with explicit MACs, used when bridging foreign MACs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtFrameBody {
    pub nwid: NetworkId,
    pub com: Option<CertificateOfMembership>,
    pub to_mac: Mac,
    pub from_mac: Mac,
    pub ethertype: u16,
    pub payload: Vec<u8>,
}

impl ExtFrameBody {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(23 + self.payload.len());
        out.extend_from_slice(&self.nwid.as_u64().to_be_bytes());
        write_optional_com(&mut out, self.com.as_ref());
        out.extend_from_slice(&self.to_mac.to_bytes());
        out.extend_from_slice(&self.from_mac.to_bytes());
        out.extend_from_slice(&self.ethertype.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn parse(body: &[u8]) -> Result<Self, WireError> {
        need(body, 9)?;
        let nwid = NetworkId::from_u64(read_u64(body, 0));
        let (com, consumed) = read_optional_com(&body[8..])?;
        let offset = 8 + consumed;
        need(body, offset + 14)?;
        Ok(Self {
            nwid,
            com,
            to_mac: read_mac(body, offset),
            from_mac: read_mac(body, offset + 6),
            ethertype: read_u16(body, offset + 12),
            payload: body[offset + 14..].to_vec(),
        })
    }
}

/// MULTICAST_LIKE: subscription announcements, optionally with the
/// sender's membership certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastLike {
    pub com: Option<CertificateOfMembership>,
    pub entries: Vec<(NetworkId, MulticastGroup)>,
}

impl MulticastLike {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.entries.len() * 18);
        write_optional_com(&mut out, self.com.as_ref());
        for (nwid, group) in &self.entries {
            out.extend_from_slice(&nwid.as_u64().to_be_bytes());
            out.extend_from_slice(&group.to_wire());
        }
        out
    }

    pub fn parse(body: &[u8]) -> Result<Self, WireError> {
        let (com, mut offset) = read_optional_com(body)?;
        let mut entries = Vec::new();
        while offset < body.len() {
            need(body, offset + 18)?;
            let nwid = NetworkId::from_u64(read_u64(body, offset));
            let group = MulticastGroup::from_wire(&body[offset + 8..offset + 18])
                .map_err(|_| WireError::Malformed("bad multicast group"))?;
            entries.push((nwid, group));
            offset += 18;
        }
        Ok(Self { com, entries })
    }
}

/// MULTICAST_GATHER: ask for known likers of a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastGather {
    pub nwid: NetworkId,
    pub group: MulticastGroup,
    pub limit: u32,
}

impl MulticastGather {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(22);
        out.extend_from_slice(&self.nwid.as_u64().to_be_bytes());
        out.extend_from_slice(&self.group.to_wire());
        out.extend_from_slice(&self.limit.to_be_bytes());
        out
    }

    pub fn parse(body: &[u8]) -> Result<Self, WireError> {
        need(body, 22)?;
        Ok(Self {
            nwid: NetworkId::from_u64(read_u64(body, 0)),
            group: MulticastGroup::from_wire(&body[8..18])
                .map_err(|_| WireError::Malformed("bad multicast group"))?,
            limit: u32::from_be_bytes(body[18..22].try_into().expect("4 bytes")),
        })
    }
}

/// OK(MULTICAST_GATHER) payload: the gathered member addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OkMulticastGather {
    pub nwid: NetworkId,
    pub group: MulticastGroup,
    /// Total likers known to the responder (may exceed what fits here).
    pub total: u32,
    pub members: Vec<Address>,
}

impl OkMulticastGather {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24 + self.members.len() * 5);
        out.extend_from_slice(&self.nwid.as_u64().to_be_bytes());
        out.extend_from_slice(&self.group.to_wire());
        out.extend_from_slice(&self.total.to_be_bytes());
        out.extend_from_slice(&(self.members.len() as u16).to_be_bytes());
        for member in &self.members {
            out.extend_from_slice(&member.to_bytes());
        }
        out
    }

    pub fn parse(payload: &[u8]) -> Result<Self, WireError> {
        need(payload, 24)?;
        let count = read_u16(payload, 22) as usize;
        need(payload, 24 + count * 5)?;
        let members = (0..count)
            .map(|i| read_address(payload, 24 + i * 5))
            .collect();
        Ok(Self {
            nwid: NetworkId::from_u64(read_u64(payload, 0)),
            group: MulticastGroup::from_wire(&payload[8..18])
                .map_err(|_| WireError::Malformed("bad multicast group"))?,
            total: u32::from_be_bytes(payload[18..22].try_into().expect("4 bytes")),
            members,
        })
    }
}

/// MULTICAST_FRAME: a frame propagated to a group's likers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastFrameBody {
    pub nwid: NetworkId,
    pub com: Option<CertificateOfMembership>,
    pub group: MulticastGroup,
    pub from_mac: Mac,
    pub ethertype: u16,
    pub payload: Vec<u8>,
}

impl MulticastFrameBody {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(27 + self.payload.len());
        out.extend_from_slice(&self.nwid.as_u64().to_be_bytes());
        write_optional_com(&mut out, self.com.as_ref());
        out.extend_from_slice(&self.group.to_wire());
        out.extend_from_slice(&self.from_mac.to_bytes());
        out.extend_from_slice(&self.ethertype.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn parse(body: &[u8]) -> Result<Self, WireError> {
        need(body, 9)?;
        let nwid = NetworkId::from_u64(read_u64(body, 0));
        let (com, consumed) = read_optional_com(&body[8..])?;
        let offset = 8 + consumed;
        need(body, offset + 18)?;
        Ok(Self {
            nwid,
            com,
            group: MulticastGroup::from_wire(&body[offset..offset + 10])
                .map_err(|_| WireError::Malformed("bad multicast group"))?,
            from_mac: read_mac(body, offset + 10),
            ethertype: read_u16(body, offset + 16),
            payload: body[offset + 18..].to_vec(),
        })
    }
}

// --------------------------------------------------------------- config --

/// NETWORK_CONFIG_REQUEST: ask the controller for a config newer than what
/// we hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkConfigRequest {
    pub nwid: NetworkId,
    pub have_revision: u64,
}

impl NetworkConfigRequest {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        out.extend_from_slice(&self.nwid.as_u64().to_be_bytes());
        out.extend_from_slice(&self.have_revision.to_be_bytes());
        out
    }

    pub fn parse(body: &[u8]) -> Result<Self, WireError> {
        need(body, 16)?;
        Ok(Self {
            nwid: NetworkId::from_u64(read_u64(body, 0)),
            have_revision: read_u64(body, 8),
        })
    }
}

/// OK(NETWORK_CONFIG_REQUEST) payload: the signed config blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OkNetworkConfig {
    pub nwid: NetworkId,
    pub blob: Vec<u8>,
}

impl OkNetworkConfig {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(10 + self.blob.len());
        out.extend_from_slice(&self.nwid.as_u64().to_be_bytes());
        out.extend_from_slice(&(self.blob.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.blob);
        out
    }

    pub fn parse(payload: &[u8]) -> Result<Self, WireError> {
        need(payload, 10)?;
        let len = read_u16(payload, 8) as usize;
        need(payload, 10 + len)?;
        Ok(Self {
            nwid: NetworkId::from_u64(read_u64(payload, 0)),
            blob: payload[10..10 + len].to_vec(),
        })
    }
}

pub fn encode_network_config_refresh(nwid: NetworkId) -> Vec<u8> {
    nwid.as_u64().to_be_bytes().to_vec()
}

pub fn parse_network_config_refresh(body: &[u8]) -> Result<NetworkId, WireError> {
    need(body, 8)?;
    Ok(NetworkId::from_u64(read_u64(body, 0)))
}

// ---------------------------------------------------- PUSH_DIRECT_PATHS --

pub fn encode_push_direct_paths(endpoints: &[SocketAddr]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + endpoints.len() * 19);
    out.push(endpoints.len() as u8);
    for ep in endpoints {
        write_endpoint(&mut out, Some(*ep));
    }
    out
}

pub fn parse_push_direct_paths(body: &[u8]) -> Result<Vec<SocketAddr>, WireError> {
    need(body, 1)?;
    let count = body[0] as usize;
    let mut offset = 1;
    let mut endpoints = Vec::with_capacity(count.min(16));
    for _ in 0..count {
        let (ep, consumed) = read_endpoint(&body[offset..])?;
        offset += consumed;
        if let Some(ep) = ep {
            endpoints.push(ep);
        }
        if endpoints.len() >= 16 {
            break;
        }
    }
    Ok(endpoints)
}

// ----------------------------------------------------------- CIRCUIT_TEST --

/// A graph-traversal trace: each hop is a breadth-list of addresses to
/// forward to next, consumed FIFO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitTest {
    pub originator: Address,
    pub test_id: u64,
    pub timestamp: u64,
    pub hops: VecDeque<Vec<Address>>,
}

impl CircuitTest {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24 + self.hops.len() * 8);
        out.extend_from_slice(&self.originator.to_bytes());
        out.extend_from_slice(&self.test_id.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&(self.hops.len() as u16).to_be_bytes());
        for hop in &self.hops {
            out.push(hop.len() as u8);
            for addr in hop {
                out.extend_from_slice(&addr.to_bytes());
            }
        }
        out
    }

    pub fn parse(body: &[u8]) -> Result<Self, WireError> {
        need(body, 23)?;
        let originator = read_address(body, 0);
        let test_id = read_u64(body, 5);
        let timestamp = read_u64(body, 13);
        let hop_count = read_u16(body, 21) as usize;
        if hop_count > CIRCUIT_TEST_MAX_HOPS {
            return Err(WireError::Malformed("circuit test too deep"));
        }
        let mut offset = 23;
        let mut hops = VecDeque::with_capacity(hop_count);
        for _ in 0..hop_count {
            need(body, offset + 1)?;
            let breadth = body[offset] as usize;
            if breadth > CIRCUIT_TEST_MAX_HOP_BREADTH {
                return Err(WireError::Malformed("circuit test too wide"));
            }
            offset += 1;
            need(body, offset + breadth * 5)?;
            let hop = (0..breadth)
                .map(|i| read_address(body, offset + i * 5))
                .collect();
            offset += breadth * 5;
            hops.push_back(hop);
        }
        Ok(Self {
            originator,
            test_id,
            timestamp,
            hops,
        })
    }
}

/// CIRCUIT_TEST_REPORT: one hop reporting back to the originator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitTestReport {
    pub test_id: u64,
    pub timestamp: u64,
    /// Hops remaining in the FIFO when the reporter saw the test.
    pub remaining_hops: u16,
}

impl CircuitTestReport {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(18);
        out.extend_from_slice(&self.test_id.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.remaining_hops.to_be_bytes());
        out
    }

    pub fn parse(body: &[u8]) -> Result<Self, WireError> {
        need(body, 18)?;
        Ok(Self {
            test_id: read_u64(body, 0),
            timestamp: read_u64(body, 8),
            remaining_hops: read_u16(body, 16),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    fn identity() -> &'static Identity {
        static ID: OnceLock<Identity> = OnceLock::new();
        ID.get_or_init(Identity::generate)
    }

    fn controller() -> &'static Identity {
        static ID: OnceLock<Identity> = OnceLock::new();
        ID.get_or_init(Identity::generate)
    }

    fn com() -> CertificateOfMembership {
        CertificateOfMembership::issue(
            controller(),
            NetworkId::from_u64(0x8056c2e21c000001),
            identity().address(),
            1_000,
            60_000,
        )
        .unwrap()
    }

    const NWID: NetworkId = NetworkId::from_u64(0x8056c2e21c000001);

    #[test]
    fn hello_roundtrip() {
        let hello = Hello {
            protocol_version: 1,
            major: 0,
            minor: 3,
            revision: 7,
            timestamp: 123_456,
            identity: identity().public_only(),
            world_id: 0x6172,
            world_timestamp: 99,
        };
        let parsed = Hello::parse(&hello.encode()).unwrap();
        assert_eq!(parsed, hello);
    }

    #[test]
    fn hello_truncated_rejected() {
        let hello = Hello {
            protocol_version: 1,
            major: 0,
            minor: 3,
            revision: 7,
            timestamp: 1,
            identity: identity().public_only(),
            world_id: 1,
            world_timestamp: 1,
        };
        let raw = hello.encode();
        for len in [0, 5, 12, 20, raw.len() - 1] {
            assert!(Hello::parse(&raw[..len]).is_err(), "len {len}");
        }
    }

    #[test]
    fn ok_envelope_roundtrip() {
        let raw = OkEnvelope::encode(Verb::Whois, PacketId::from_u64(42), b"payload");
        let parsed = OkEnvelope::parse(&raw).unwrap();
        assert_eq!(parsed.in_re, Verb::Whois);
        assert_eq!(parsed.in_re_packet_id, PacketId::from_u64(42));
        assert_eq!(parsed.payload, b"payload");
    }

    #[test]
    fn ok_hello_roundtrip_with_world() {
        let with_world = OkHello {
            timestamp_echo: 555,
            protocol_version: 1,
            major: 0,
            minor: 3,
            revision: 1,
            world: Some(vec![1, 2, 3, 4]),
        };
        assert_eq!(OkHello::parse(&with_world.encode()).unwrap(), with_world);

        let without = OkHello {
            world: None,
            ..with_world
        };
        assert_eq!(OkHello::parse(&without.encode()).unwrap(), without);
    }

    #[test]
    fn error_body_roundtrip() {
        let raw = ErrorBody::encode(
            Verb::NetworkConfigRequest,
            PacketId::from_u64(7),
            0x07,
            &NWID.as_u64().to_be_bytes(),
        );
        let parsed = ErrorBody::parse(&raw).unwrap();
        assert_eq!(parsed.in_re, Verb::NetworkConfigRequest as u8);
        assert_eq!(parsed.code, 0x07);
        assert_eq!(parsed.data, NWID.as_u64().to_be_bytes());
    }

    #[test]
    fn whois_roundtrip() {
        let addr = Address::from_u64(0x0102030405);
        assert_eq!(parse_whois(&encode_whois(addr)).unwrap(), addr);
        assert!(parse_whois(&[1, 2]).is_err());
    }

    #[test]
    fn rendezvous_roundtrip() {
        let rz = Rendezvous {
            peer: Address::from_u64(0x0a0b0c0d0e),
            endpoint: "203.0.113.4:41234".parse().unwrap(),
        };
        assert_eq!(Rendezvous::parse(&rz.encode()).unwrap(), rz);
    }

    #[test]
    fn frame_roundtrip_with_and_without_com() {
        let with = FrameBody {
            nwid: NWID,
            com: Some(com()),
            ethertype: 0x0800,
            payload: vec![0xAA; 64],
        };
        assert_eq!(FrameBody::parse(&with.encode()).unwrap(), with);

        let without = FrameBody {
            com: None,
            ..with.clone()
        };
        assert_eq!(FrameBody::parse(&without.encode()).unwrap(), without);
    }

    #[test]
    fn ext_frame_roundtrip() {
        let frame = ExtFrameBody {
            nwid: NWID,
            com: Some(com()),
            to_mac: Mac::from_u64(0x001122334455),
            from_mac: Mac::from_u64(0x00aabbccddee),
            ethertype: 0x86dd,
            payload: vec![0x11; 48],
        };
        assert_eq!(ExtFrameBody::parse(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn multicast_like_roundtrip() {
        let like = MulticastLike {
            com: Some(com()),
            entries: vec![
                (NWID, MulticastGroup::broadcast()),
                (
                    NWID,
                    MulticastGroup::new(Mac::from_u64(0x01005e0000fb), 0x0a000001),
                ),
            ],
        };
        assert_eq!(MulticastLike::parse(&like.encode()).unwrap(), like);

        let empty = MulticastLike {
            com: None,
            entries: vec![],
        };
        assert_eq!(MulticastLike::parse(&empty.encode()).unwrap(), empty);
    }

    #[test]
    fn multicast_gather_roundtrip() {
        let gather = MulticastGather {
            nwid: NWID,
            group: MulticastGroup::broadcast(),
            limit: 32,
        };
        assert_eq!(MulticastGather::parse(&gather.encode()).unwrap(), gather);
    }

    #[test]
    fn ok_multicast_gather_roundtrip() {
        let ok = OkMulticastGather {
            nwid: NWID,
            group: MulticastGroup::broadcast(),
            total: 100,
            members: vec![Address::from_u64(1), Address::from_u64(2)],
        };
        assert_eq!(OkMulticastGather::parse(&ok.encode()).unwrap(), ok);
    }

    #[test]
    fn multicast_frame_roundtrip() {
        let frame = MulticastFrameBody {
            nwid: NWID,
            com: None,
            group: MulticastGroup::broadcast(),
            from_mac: Mac::from_u64(0x00aabbccddee),
            ethertype: 0x0806,
            payload: vec![0x42; 28],
        };
        assert_eq!(MulticastFrameBody::parse(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn network_config_request_roundtrip() {
        let req = NetworkConfigRequest {
            nwid: NWID,
            have_revision: 9,
        };
        assert_eq!(NetworkConfigRequest::parse(&req.encode()).unwrap(), req);
    }

    #[test]
    fn ok_network_config_roundtrip() {
        let ok = OkNetworkConfig {
            nwid: NWID,
            blob: b"signed dictionary bytes".to_vec(),
        };
        assert_eq!(OkNetworkConfig::parse(&ok.encode()).unwrap(), ok);
    }

    #[test]
    fn refresh_roundtrip() {
        let raw = encode_network_config_refresh(NWID);
        assert_eq!(parse_network_config_refresh(&raw).unwrap(), NWID);
    }

    #[test]
    fn push_direct_paths_roundtrip() {
        let endpoints: Vec<SocketAddr> = vec![
            "198.51.100.1:9993".parse().unwrap(),
            "[2001:db8::9]:9993".parse().unwrap(),
        ];
        let parsed = parse_push_direct_paths(&encode_push_direct_paths(&endpoints)).unwrap();
        assert_eq!(parsed, endpoints);
    }

    #[test]
    fn push_direct_paths_caps_at_sixteen() {
        let endpoints: Vec<SocketAddr> = (0..40)
            .map(|i| format!("198.51.100.{}:9993", i + 1).parse().unwrap())
            .collect();
        let parsed = parse_push_direct_paths(&encode_push_direct_paths(&endpoints)).unwrap();
        assert_eq!(parsed.len(), 16);
    }

    #[test]
    fn circuit_test_roundtrip() {
        let test = CircuitTest {
            originator: Address::from_u64(0x0102030405),
            test_id: 0xfeed,
            timestamp: 777,
            hops: VecDeque::from(vec![
                vec![Address::from_u64(1), Address::from_u64(2)],
                vec![Address::from_u64(3)],
                vec![],
            ]),
        };
        assert_eq!(CircuitTest::parse(&test.encode()).unwrap(), test);
    }

    #[test]
    fn circuit_test_bounds_enforced() {
        // Depth bound.
        let mut deep = CircuitTest {
            originator: Address::from_u64(1),
            test_id: 1,
            timestamp: 1,
            hops: VecDeque::new(),
        };
        for _ in 0..CIRCUIT_TEST_MAX_HOPS {
            deep.hops.push_back(vec![]);
        }
        assert!(CircuitTest::parse(&deep.encode()).is_ok());
        deep.hops.push_back(vec![]);
        assert!(CircuitTest::parse(&deep.encode()).is_err());
    }

    #[test]
    fn circuit_test_report_roundtrip() {
        let report = CircuitTestReport {
            test_id: 9,
            timestamp: 10,
            remaining_hops: 3,
        };
        assert_eq!(CircuitTestReport::parse(&report.encode()).unwrap(), report);
    }

    #[test]
    fn parsers_survive_garbage() {
        let garbage = vec![0xFFu8; 64];
        let _ = Hello::parse(&garbage);
        let _ = OkEnvelope::parse(&garbage);
        let _ = ErrorBody::parse(&garbage);
        let _ = FrameBody::parse(&garbage);
        let _ = ExtFrameBody::parse(&garbage);
        let _ = MulticastLike::parse(&garbage);
        let _ = MulticastGather::parse(&garbage);
        let _ = MulticastFrameBody::parse(&garbage);
        let _ = CircuitTest::parse(&garbage);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn frame_roundtrip(
            nwid in any::<u64>(),
            ethertype in any::<u16>(),
            payload in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let frame = FrameBody {
                nwid: NetworkId::from_u64(nwid),
                com: None,
                ethertype,
                payload,
            };
            prop_assert_eq!(FrameBody::parse(&frame.encode()).unwrap(), frame);
        }

        #[test]
        fn ok_envelope_roundtrip_any(
            id in any::<u64>(),
            payload in proptest::collection::vec(any::<u8>(), 0..256),
        ) {
            let raw = OkEnvelope::encode(Verb::Echo, PacketId::from_u64(id), &payload);
            let parsed = OkEnvelope::parse(&raw).unwrap();
            prop_assert_eq!(parsed.in_re_packet_id, PacketId::from_u64(id));
            prop_assert_eq!(parsed.payload, payload);
        }

        #[test]
        fn body_parsers_never_panic(raw in proptest::collection::vec(any::<u8>(), 0..300)) {
            let _ = Hello::parse(&raw);
            let _ = OkEnvelope::parse(&raw);
            let _ = ErrorBody::parse(&raw);
            let _ = Rendezvous::parse(&raw);
            let _ = FrameBody::parse(&raw);
            let _ = ExtFrameBody::parse(&raw);
            let _ = MulticastLike::parse(&raw);
            let _ = MulticastFrameBody::parse(&raw);
            let _ = CircuitTest::parse(&raw);
            let _ = parse_push_direct_paths(&raw);
        }
    }
}
