//! VL1 packet wire format: parse, serialize, armor, dearmor.
//!
//! A packet starts with an unencrypted 27-byte header:
//!
//! ```text
//! id(8) | dest(5) | source(5) | flags/cipher/hops(1) | mac(8)
//! ```
//!
//! followed by the payload, whose first byte is the verb. The Poly1305 key
//! is the first 32 bytes of a Salsa20/12 keystream keyed by the pairwise
//! session key with the packet id as IV; payload encryption, when enabled,
//! consumes the same stream from byte 32. The MAC covers the entire packet
//! with the MAC field, hops bits, and fragmented flag zeroed (those mutate
//! in transit).

use vether_crypto::poly::packet_mac;
use vether_crypto::salsa::Salsa12Stream;

use crate::constants::{
    FLAG_FRAGMENTED, MAX_HOPS, PACKET_HEADER_SIZE, PACKET_IDX_FLAGS, PACKET_IDX_MAC,
    PACKET_MIN_SIZE,
};
use crate::error::WireError;
use crate::types::{Address, PacketId};
use crate::verb::Verb;

/// Cipher suite selector carried in the flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CipherSuite {
    /// Authenticated but not encrypted (HELLO must be sent this way, since
    /// the receiver may not know the sender's key yet).
    Poly1305None = 0,
    /// Authenticated and Salsa20/12-encrypted.
    Poly1305Salsa2012 = 1,
}

impl CipherSuite {
    pub fn from_u8(v: u8) -> Result<Self, WireError> {
        match v {
            0 => Ok(CipherSuite::Poly1305None),
            1 => Ok(CipherSuite::Poly1305Salsa2012),
            other => Err(WireError::InvalidCipher(other)),
        }
    }
}

/// A VL1 packet.
///
/// `payload` holds ciphertext between [`Packet::parse`] and
/// [`Packet::dearmor`], and between [`Packet::armor`] and the wire;
/// everywhere else it is plaintext beginning with the verb byte.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct Packet {
    pub id: PacketId,
    pub dest: Address,
    pub source: Address,
    pub fragmented: bool,
    pub cipher: CipherSuite,
    pub hops: u8,
    pub mac: [u8; 8],
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a plaintext outbound packet with a fresh random id.
    pub fn new_outbound(dest: Address, source: Address, verb: Verb, body: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(1 + body.len());
        payload.push(verb as u8);
        payload.extend_from_slice(body);
        Self {
            id: PacketId::random(),
            dest,
            source,
            fragmented: false,
            cipher: CipherSuite::Poly1305None,
            hops: 0,
            mac: [0u8; 8],
            payload,
        }
    }

    /// Parse a packet from wire bytes. Authentication is separate; call
    /// [`Packet::dearmor`] before trusting the payload.
    pub fn parse(raw: &[u8]) -> Result<Self, WireError> {
        if raw.len() < PACKET_MIN_SIZE {
            return Err(WireError::TooShort {
                min: PACKET_MIN_SIZE,
                actual: raw.len(),
            });
        }

        let id = PacketId::from_u64(u64::from_be_bytes(raw[0..8].try_into().expect("8 bytes")));
        let dest = Address::from_bytes(raw[8..13].try_into().expect("5 bytes"));
        let source = Address::from_bytes(raw[13..18].try_into().expect("5 bytes"));

        let flags = raw[PACKET_IDX_FLAGS];
        let hops = flags & 0x07;
        let cipher = CipherSuite::from_u8((flags >> 3) & 0x07)?;
        let fragmented = flags & FLAG_FRAGMENTED != 0;

        let mut mac = [0u8; 8];
        mac.copy_from_slice(&raw[PACKET_IDX_MAC..PACKET_IDX_MAC + 8]);

        Ok(Self {
            id,
            dest,
            source,
            fragmented,
            cipher,
            hops,
            mac,
            payload: raw[PACKET_HEADER_SIZE..].to_vec(),
        })
    }

    /// Serialize to wire bytes.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PACKET_HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&self.id.to_bytes());
        out.extend_from_slice(&self.dest.to_bytes());
        out.extend_from_slice(&self.source.to_bytes());
        out.push(self.flags_byte());
        out.extend_from_slice(&self.mac);
        out.extend_from_slice(&self.payload);
        out
    }

    fn flags_byte(&self) -> u8 {
        let mut b = (self.hops & 0x07) | ((self.cipher as u8) << 3);
        if self.fragmented {
            b |= FLAG_FRAGMENTED;
        }
        b
    }

    /// The bytes the MAC is computed over: the serialized packet with the
    /// MAC field zeroed and the mutable bits (hops, fragmented flag)
    /// stripped from the flags byte.
    fn mac_input(&self) -> Vec<u8> {
        let mut bytes = self.serialize();
        bytes[PACKET_IDX_FLAGS] &= 0x38;
        for b in &mut bytes[PACKET_IDX_MAC..PACKET_IDX_MAC + 8] {
            *b = 0;
        }
        bytes
    }

    /// Encrypt (if requested) and authenticate under the pairwise session key.
    pub fn armor(&mut self, key: &[u8; 32], cipher: CipherSuite) {
        self.cipher = cipher;

        let mut stream = Salsa12Stream::new(key, &self.id.to_bytes());
        let mut poly_key = [0u8; 32];
        stream.keystream(&mut poly_key);

        if cipher == CipherSuite::Poly1305Salsa2012 {
            stream.apply(&mut self.payload);
        }

        self.mac = packet_mac(&poly_key, &self.mac_input());
    }

    /// Authenticate and decrypt. On MAC mismatch the payload is untouched
    /// and the caller must drop the packet.
    pub fn dearmor(&mut self, key: &[u8; 32]) -> Result<(), WireError> {
        let mut stream = Salsa12Stream::new(key, &self.id.to_bytes());
        let mut poly_key = [0u8; 32];
        stream.keystream(&mut poly_key);

        let expected = packet_mac(&poly_key, &self.mac_input());
        if expected != self.mac {
            return Err(WireError::Unauthenticated);
        }

        if self.cipher == CipherSuite::Poly1305Salsa2012 {
            stream.apply(&mut self.payload);
        }
        Ok(())
    }

    /// The verb byte, once the payload is plaintext.
    #[must_use]
    pub fn verb(&self) -> Option<Verb> {
        self.payload.first().and_then(|b| Verb::from_u8(*b))
    }

    /// The verb body (payload after the verb byte).
    #[must_use]
    pub fn body(&self) -> &[u8] {
        if self.payload.is_empty() {
            &[]
        } else {
            &self.payload[1..]
        }
    }

    /// Increment hops for relaying. Returns false once the hop limit is
    /// reached, in which case the packet must not be forwarded.
    pub fn increment_hops(&mut self) -> bool {
        if self.hops >= MAX_HOPS {
            return false;
        }
        self.hops += 1;
        true
    }
}
