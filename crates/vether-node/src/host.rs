//! The host callback surface.
//!
//! The engine performs no I/O of its own: sockets, tap devices, storage,
//! geolocation, and the cluster backplane all belong to the host. Callbacks
//! must not block; the host may buffer. The engine guarantees that no
//! internal lock is held while a callback runs, so a callback may re-enter
//! any entry point.

use std::net::SocketAddr;

use vether_core::{Mac, NetworkId};
use vether_network::network::NetworkStatus;
use vether_network::NetworkConfig;
use vether_transport::cluster::GeoCoords;

use crate::events::Event;

/// Port configuration operations delivered to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PortOp {
    /// Network is coming up (first join or restart).
    Up = 1,
    /// Configuration or status changed.
    ConfigUpdate = 2,
    /// Network is going down, but not permanently.
    Down = 3,
    /// Network is being deleted.
    Destroy = 4,
}

/// Services the host provides to the engine.
///
/// Data-store names are slash-separated and never contain `..` or
/// backslashes. Known names: `identity.public`, `identity.secret`, `world`,
/// `networks.d/<16-hex nwid>.conf`, `networks.d/<16-hex nwid>.subs`.
pub trait Host: Send + Sync {
    /// Read a named object in full. `None` when it does not exist.
    fn data_store_get(&self, name: &str) -> Option<Vec<u8>>;

    /// Write (or overwrite) a named object. `secure` requires owner-only
    /// permissions (secret key material). Nonzero return is an error.
    fn data_store_put(&self, name: &str, data: &[u8], secure: bool) -> i32;

    /// Delete a named object. Deleting a missing object is not an error.
    fn data_store_delete(&self, name: &str);

    /// Transmit a UDP datagram. `local` is a bind hint; `None` lets the
    /// host choose. Returns false if the packet was definitely not sent.
    fn wire_send(&self, local: Option<SocketAddr>, remote: SocketAddr, data: &[u8]) -> bool;

    /// Deliver an Ethernet frame to the virtual network's tap.
    fn virtual_frame(
        &self,
        nwid: NetworkId,
        src_mac: Mac,
        dst_mac: Mac,
        ethertype: u16,
        vlan_id: u16,
        data: &[u8],
    );

    /// A network's port state changed. A nonzero return puts the network
    /// into `PortError` with that code.
    fn port_config(
        &self,
        nwid: NetworkId,
        op: PortOp,
        status: NetworkStatus,
        config: Option<&NetworkConfig>,
    ) -> i32;

    /// Asynchronous engine events.
    fn event(&self, event: Event);

    /// Map a physical endpoint to coarse geographic coordinates for
    /// cluster handoff. `None` disables geo-handoff for that endpoint.
    fn geolocate(&self, _endpoint: SocketAddr) -> Option<GeoCoords> {
        None
    }

    /// Send a message to a cluster sibling over the host backplane.
    fn cluster_send(&self, _member: u16, _data: &[u8]) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_op_codes() {
        assert_eq!(PortOp::Up as u32, 1);
        assert_eq!(PortOp::ConfigUpdate as u32, 2);
        assert_eq!(PortOp::Down as u32, 3);
        assert_eq!(PortOp::Destroy as u32, 4);
    }
}
