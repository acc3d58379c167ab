//! Poly1305 one-time authentication.
//!
//! Packet MACs are the first 8 bytes of a Poly1305 tag computed under a
//! single-use key drawn from the packet's Salsa20/12 keystream.

use poly1305::universal_hash::KeyInit;
use poly1305::{Key, Poly1305};

/// Length of the truncated MAC carried in the packet header.
pub const PACKET_MAC_LENGTH: usize = 8;

/// Compute the full 16-byte Poly1305 tag over `data`.
///
/// The key must never be reused across messages; callers derive it from the
/// per-packet keystream.
#[must_use]
pub fn poly1305_tag(key: &[u8; 32], data: &[u8]) -> [u8; 16] {
    let mac = Poly1305::new(Key::from_slice(key));
    mac.compute_unpadded(data).into()
}

/// Compute the truncated 64-bit packet MAC over `data`.
#[must_use]
pub fn packet_mac(key: &[u8; 32], data: &[u8]) -> [u8; PACKET_MAC_LENGTH] {
    let tag = poly1305_tag(key, data);
    let mut out = [0u8; PACKET_MAC_LENGTH];
    out.copy_from_slice(&tag[..PACKET_MAC_LENGTH]);
    out
}
