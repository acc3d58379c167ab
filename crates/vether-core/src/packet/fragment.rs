//! Fragmentation framing for packets exceeding the path MTU budget.
//!
//! A fragmented packet goes out as a head datagram (the first MTU bytes of
//! the serialized packet, with the fragmented flag set) plus trailing
//! fragments with their own framing:
//!
//! ```text
//! id(8) | dest(5) | 0xff(1) | total<<4|no(1) | hops(1) | payload
//! ```
//!
//! Byte 13 of a real packet is the first source address byte, and source
//! addresses starting `0xff` are reserved, so the `0xff` indicator cannot
//! collide with packet framing. Fragment numbering starts at 1; the head
//! counts as fragment 0.

use crate::constants::{
    FLAG_FRAGMENTED, FRAGMENT_INDICATOR, FRAGMENT_INDICATOR_IDX, FRAGMENT_IDX_PAYLOAD,
    FRAGMENT_MIN_SIZE, MAX_FRAGMENTS, PACKET_IDX_FLAGS, PACKET_MIN_SIZE,
};
use crate::error::WireError;
use crate::types::{Address, PacketId};

/// A trailing fragment of a fragmented packet.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct Fragment {
    pub id: PacketId,
    pub dest: Address,
    /// Total fragment count for the packet, head included.
    pub total: u8,
    /// This fragment's index; 1-based (0 is the head packet).
    pub no: u8,
    pub hops: u8,
    pub payload: Vec<u8>,
}

impl Fragment {
    pub fn parse(raw: &[u8]) -> Result<Self, WireError> {
        if raw.len() < FRAGMENT_MIN_SIZE {
            return Err(WireError::TooShort {
                min: FRAGMENT_MIN_SIZE,
                actual: raw.len(),
            });
        }
        if raw[FRAGMENT_INDICATOR_IDX] != FRAGMENT_INDICATOR {
            return Err(WireError::NotAFragment);
        }

        let id = PacketId::from_u64(u64::from_be_bytes(raw[0..8].try_into().expect("8 bytes")));
        let dest = Address::from_bytes(raw[8..13].try_into().expect("5 bytes"));
        let total = raw[14] >> 4;
        let no = raw[14] & 0x0f;
        if no == 0 || no >= total {
            return Err(WireError::InvalidFragmentNumbering { no, total });
        }

        Ok(Self {
            id,
            dest,
            total,
            no,
            hops: raw[15],
            payload: raw[FRAGMENT_IDX_PAYLOAD..].to_vec(),
        })
    }

    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAGMENT_IDX_PAYLOAD + self.payload.len());
        out.extend_from_slice(&self.id.to_bytes());
        out.extend_from_slice(&self.dest.to_bytes());
        out.push(FRAGMENT_INDICATOR);
        out.push((self.total << 4) | (self.no & 0x0f));
        out.push(self.hops);
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Whether a received datagram is a trailing fragment rather than a packet.
#[must_use]
pub fn is_fragment(raw: &[u8]) -> bool {
    raw.len() > FRAGMENT_INDICATOR_IDX && raw[FRAGMENT_INDICATOR_IDX] == FRAGMENT_INDICATOR
}

/// Split a serialized packet into wire datagrams if it exceeds `mtu`.
///
/// Returns `None` when the packet fits in a single datagram. Otherwise the
/// first element is the head (with the fragmented flag set) and the rest are
/// trailing fragments. The packet must already be armored: fragmentation
/// changes only bits excluded from the MAC.
pub fn fragment_packet(serialized: &[u8], mtu: usize) -> Result<Option<Vec<Vec<u8>>>, WireError> {
    if serialized.len() < PACKET_MIN_SIZE {
        return Err(WireError::TooShort {
            min: PACKET_MIN_SIZE,
            actual: serialized.len(),
        });
    }
    if serialized.len() <= mtu {
        return Ok(None);
    }

    let per_fragment = mtu - FRAGMENT_IDX_PAYLOAD;
    let remainder = serialized.len() - mtu;
    let trailing = remainder.div_ceil(per_fragment);
    let total = trailing + 1;
    if total > MAX_FRAGMENTS {
        return Err(WireError::TooLarge(serialized.len()));
    }

    let id = PacketId::from_u64(u64::from_be_bytes(
        serialized[0..8].try_into().expect("8 bytes"),
    ));
    let dest = Address::from_bytes(serialized[8..13].try_into().expect("5 bytes"));
    let hops = serialized[PACKET_IDX_FLAGS] & 0x07;

    let mut out = Vec::with_capacity(total);
    let mut head = serialized[..mtu].to_vec();
    head[PACKET_IDX_FLAGS] |= FLAG_FRAGMENTED;
    out.push(head);

    for (i, chunk) in serialized[mtu..].chunks(per_fragment).enumerate() {
        let frag = Fragment {
            id,
            dest,
            total: total as u8,
            no: (i + 1) as u8,
            hops,
            payload: chunk.to_vec(),
        };
        out.push(frag.serialize());
    }

    Ok(Some(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::wire::{CipherSuite, Packet};
    use crate::verb::Verb;

    fn addr(v: u64) -> Address {
        Address::from_u64(v)
    }

    fn big_packet(len: usize) -> Vec<u8> {
        let body: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let mut packet =
            Packet::new_outbound(addr(0x0a0a0a0a0a), addr(0x0b0b0b0b0b), Verb::Frame, &body);
        packet.armor(&[0x77u8; 32], CipherSuite::Poly1305Salsa2012);
        packet.serialize()
    }

    #[test]
    fn fragment_roundtrip() {
        let frag = Fragment {
            id: PacketId::from_u64(0x0102030405060708),
            dest: addr(0x1122334455),
            total: 3,
            no: 2,
            hops: 1,
            payload: vec![0xAB; 100],
        };
        let raw = frag.serialize();
        assert!(is_fragment(&raw));
        assert_eq!(Fragment::parse(&raw).unwrap(), frag);
    }

    #[test]
    fn small_packet_not_fragmented() {
        let raw = big_packet(64);
        assert!(fragment_packet(&raw, 1444).unwrap().is_none());
        assert!(!is_fragment(&raw));
    }

    #[test]
    fn exact_mtu_not_fragmented() {
        let raw = big_packet(500);
        let mtu = raw.len();
        assert!(fragment_packet(&raw, mtu).unwrap().is_none());
    }

    #[test]
    fn reassembly_is_byte_exact() {
        let raw = big_packet(4000);
        let mtu = 1444;
        let datagrams = fragment_packet(&raw, mtu).unwrap().expect("must fragment");
        assert!(datagrams.len() >= 3);

        // Every datagram respects the MTU.
        for d in &datagrams {
            assert!(d.len() <= mtu);
        }

        // Head carries the fragmented flag; the original did not.
        assert_eq!(datagrams[0][PACKET_IDX_FLAGS] & FLAG_FRAGMENTED, FLAG_FRAGMENTED);

        // Reassemble: head bytes followed by fragment payloads in order.
        let mut reassembled = datagrams[0].clone();
        for raw_frag in &datagrams[1..] {
            let frag = Fragment::parse(raw_frag).unwrap();
            assert_eq!(frag.total as usize, datagrams.len());
            reassembled.extend_from_slice(&frag.payload);
        }

        // Identical to the original except for the fragmented flag.
        let mut expected = raw.clone();
        expected[PACKET_IDX_FLAGS] |= FLAG_FRAGMENTED;
        assert_eq!(reassembled, expected);

        // And it still authenticates: the flag is excluded from the MAC.
        let mut packet = Packet::parse(&reassembled).unwrap();
        packet.dearmor(&[0x77u8; 32]).unwrap();
        assert_eq!(packet.verb(), Some(Verb::Frame));
    }

    #[test]
    fn fragment_numbering_is_sequential() {
        let raw = big_packet(5000);
        let datagrams = fragment_packet(&raw, 1444).unwrap().unwrap();
        for (i, raw_frag) in datagrams[1..].iter().enumerate() {
            let frag = Fragment::parse(raw_frag).unwrap();
            assert_eq!(frag.no as usize, i + 1);
            assert_eq!(frag.total as usize, datagrams.len());
        }
    }

    #[test]
    fn oversized_packet_rejected() {
        let raw = big_packet(20_000);
        assert!(matches!(
            fragment_packet(&raw, 1444),
            Err(WireError::TooLarge(_))
        ));
    }

    #[test]
    fn runt_input_rejected() {
        assert!(fragment_packet(&[0u8; 10], 1444).is_err());
    }

    #[test]
    fn invalid_numbering_rejected() {
        let mut raw = Fragment {
            id: PacketId::from_u64(1),
            dest: addr(2),
            total: 3,
            no: 1,
            hops: 0,
            payload: vec![0; 10],
        }
        .serialize();

        // no == 0 (head slot) is invalid in a trailing fragment.
        raw[14] = 3 << 4;
        assert!(matches!(
            Fragment::parse(&raw),
            Err(WireError::InvalidFragmentNumbering { no: 0, total: 3 })
        ));

        // no >= total is invalid.
        raw[14] = (3 << 4) | 3;
        assert!(Fragment::parse(&raw).is_err());
    }

    #[test]
    fn packet_bytes_are_not_a_fragment() {
        // Byte 13 is the first source byte; sources may not start 0xff, so
        // a well-formed packet can never be mistaken for a fragment.
        let raw = big_packet(100);
        assert_ne!(raw[FRAGMENT_INDICATOR_IDX], FRAGMENT_INDICATOR);
    }
}
