//! Newtype wrappers for protocol scalar fields.
//!
//! These prevent accidental mixing of the engine's many 64-bit-ish values:
//! 40-bit node addresses, 48-bit Ethernet MACs, 64-bit network ids and
//! packet ids all ride in `u64` underneath.

use core::fmt;

use crate::constants::MAX_VIRTUAL_MTU;

/// A 40-bit node address derived from an identity's public key.
///
/// Addresses `0x0000000000` and anything whose first byte is `0xff` are
/// reserved and never assigned.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[must_use]
pub struct Address(u64);

impl Address {
    pub const LENGTH: usize = 5;

    /// Construct from a `u64`, keeping the low 40 bits.
    pub const fn from_u64(value: u64) -> Self {
        Self(value & 0xff_ffff_ffff)
    }

    /// Construct from 5 big-endian bytes.
    pub fn from_bytes(bytes: &[u8; 5]) -> Self {
        let mut v = 0u64;
        for b in bytes {
            v = (v << 8) | u64::from(*b);
        }
        Self(v)
    }

    /// The 5 big-endian bytes of the address.
    #[must_use]
    pub fn to_bytes(self) -> [u8; 5] {
        let v = self.0;
        [
            (v >> 32) as u8,
            (v >> 24) as u8,
            (v >> 16) as u8,
            (v >> 8) as u8,
            v as u8,
        ]
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Reserved addresses may never appear as a source or destination.
    #[must_use]
    pub const fn is_reserved(self) -> bool {
        self.0 == 0 || (self.0 >> 32) == 0xff
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:010x}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:010x})", self.0)
    }
}

/// A 48-bit Ethernet MAC address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[must_use]
pub struct Mac(u64);

impl Mac {
    pub const LENGTH: usize = 6;

    pub const fn from_u64(value: u64) -> Self {
        Self(value & 0xffff_ffff_ffff)
    }

    pub fn from_bytes(bytes: &[u8; 6]) -> Self {
        let mut v = 0u64;
        for b in bytes {
            v = (v << 8) | u64::from(*b);
        }
        Self(v)
    }

    #[must_use]
    pub fn to_bytes(self) -> [u8; 6] {
        let v = self.0;
        [
            (v >> 40) as u8,
            (v >> 32) as u8,
            (v >> 24) as u8,
            (v >> 16) as u8,
            (v >> 8) as u8,
            v as u8,
        ]
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The MAC a node derives for itself on a given network.
    ///
    /// The first octet is built from the low network id byte with the
    /// locally-administered bit set and the group bit clear; the remaining
    /// five octets are the node address XORed with network id bytes so that
    /// distinct networks yield distinct MACs for the same node.
    pub fn for_node(nwid: NetworkId, address: Address) -> Self {
        let n = nwid.as_u64();
        let mut first = ((n & 0xfe) | 0x02) as u8;
        if first == 0x52 {
            // Avoid colliding with a common virtualization OUI prefix.
            first = 0x32;
        }
        let addr = address.as_u64()
            ^ (((n >> 8) & 0xff) << 32)
            ^ (((n >> 16) & 0xff) << 24)
            ^ (((n >> 24) & 0xff) << 16)
            ^ (((n >> 32) & 0xff) << 8)
            ^ ((n >> 40) & 0xff);
        Self((u64::from(first) << 40) | (addr & 0xff_ffff_ffff))
    }

    /// Recover the node address from a MAC derived by [`Mac::for_node`].
    pub fn to_node_address(self, nwid: NetworkId) -> Address {
        let n = nwid.as_u64();
        let addr = self.0
            ^ (((n >> 8) & 0xff) << 32)
            ^ (((n >> 16) & 0xff) << 24)
            ^ (((n >> 24) & 0xff) << 16)
            ^ (((n >> 32) & 0xff) << 8)
            ^ ((n >> 40) & 0xff);
        Address::from_u64(addr)
    }

    /// Whether this MAC is the one a node would derive on this network.
    #[must_use]
    pub fn is_derived_for(self, nwid: NetworkId, address: Address) -> bool {
        Self::for_node(nwid, address) == self
    }

    /// Multicast bit (includes broadcast).
    #[must_use]
    pub const fn is_multicast(self) -> bool {
        (self.0 >> 40) & 0x01 != 0
    }

    /// The all-ones broadcast MAC.
    #[must_use]
    pub const fn broadcast() -> Self {
        Self(0xffff_ffff_ffff)
    }

    #[must_use]
    pub const fn is_broadcast(self) -> bool {
        self.0 == 0xffff_ffff_ffff
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.to_bytes();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mac({self})")
    }
}

/// A 64-bit virtual network id.
///
/// The upper 40 bits are the address of the controller node authoritative
/// for the network's configuration.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[must_use]
pub struct NetworkId(u64);

impl NetworkId {
    pub const fn from_u64(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The controller node's address (upper 40 bits).
    pub const fn controller(self) -> Address {
        Address::from_u64(self.0 >> 24)
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NetworkId({:016x})", self.0)
    }
}

/// A 64-bit packet id; also the cipher IV, so it must be unique per packet.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[must_use]
pub struct PacketId(u64);

impl PacketId {
    pub const fn from_u64(value: u64) -> Self {
        Self(value)
    }

    /// Generate a random packet id from the OS CSPRNG.
    pub fn random() -> Self {
        Self(rand::random::<u64>())
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PacketId({:016x})", self.0)
    }
}

/// Clamp a configured MTU to the virtual maximum.
#[must_use]
pub fn clamp_mtu(mtu: usize) -> usize {
    mtu.min(MAX_VIRTUAL_MTU)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_byte_roundtrip() {
        let addr = Address::from_u64(0x8056c2e21c);
        assert_eq!(addr.to_bytes(), [0x80, 0x56, 0xc2, 0xe2, 0x1c]);
        assert_eq!(Address::from_bytes(&addr.to_bytes()), addr);
    }

    #[test]
    fn address_masks_high_bits() {
        let addr = Address::from_u64(0xdead_8056_c2e2_1c00);
        assert!(addr.as_u64() <= 0xff_ffff_ffff);
    }

    #[test]
    fn reserved_addresses() {
        assert!(Address::from_u64(0).is_reserved());
        assert!(Address::from_u64(0xff00000001).is_reserved());
        assert!(!Address::from_u64(0x8056c2e21c).is_reserved());
    }

    #[test]
    fn address_display() {
        assert_eq!(Address::from_u64(0x1c).to_string(), "000000001c");
    }

    #[test]
    fn mac_byte_roundtrip() {
        let mac = Mac::from_u64(0x32_1122334455);
        assert_eq!(Mac::from_bytes(&mac.to_bytes()), mac);
        assert_eq!(mac.to_string(), "32:11:22:33:44:55");
    }

    #[test]
    fn derived_mac_roundtrips_to_address() {
        let nwid = NetworkId::from_u64(0x8056c2e21c000001);
        let addr = Address::from_u64(0x1234567890);
        let mac = Mac::for_node(nwid, addr);
        assert_eq!(mac.to_node_address(nwid), addr);
        assert!(mac.is_derived_for(nwid, addr));
    }

    #[test]
    fn derived_mac_is_locally_administered_unicast() {
        let nwid = NetworkId::from_u64(0xa09acf0233000abc);
        let mac = Mac::for_node(nwid, Address::from_u64(0x0000000001));
        let first = mac.to_bytes()[0];
        assert_eq!(first & 0x02, 0x02);
        assert_eq!(first & 0x01, 0x00);
        assert!(!mac.is_multicast());
    }

    #[test]
    fn derived_mac_differs_across_networks() {
        let addr = Address::from_u64(0x1234567890);
        let a = Mac::for_node(NetworkId::from_u64(0x8056c2e21c000001), addr);
        let b = Mac::for_node(NetworkId::from_u64(0x8056c2e21c000002), addr);
        assert_ne!(a, b);
    }

    #[test]
    fn broadcast_mac() {
        assert!(Mac::broadcast().is_broadcast());
        assert!(Mac::broadcast().is_multicast());
        assert!(!Mac::from_u64(0x321122334455).is_broadcast());
    }

    #[test]
    fn multicast_bit() {
        assert!(Mac::from_bytes(&[0x01, 0, 0x5e, 0, 0, 0xfb]).is_multicast());
        assert!(!Mac::from_bytes(&[0x32, 0, 0, 0, 0, 0x01]).is_multicast());
    }

    #[test]
    fn network_controller_address() {
        let nwid = NetworkId::from_u64(0x8056c2e21c000001);
        assert_eq!(nwid.controller(), Address::from_u64(0x8056c2e21c));
    }

    #[test]
    fn packet_id_bytes_are_big_endian() {
        let id = PacketId::from_u64(0x0102030405060708);
        assert_eq!(id.to_bytes(), [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn clamp_mtu_limits() {
        assert_eq!(clamp_mtu(1500), 1500);
        assert_eq!(clamp_mtu(9000), MAX_VIRTUAL_MTU);
    }
}
