//! Per-network state machine.
//!
//! A network entry exists from join to leave. It tracks configuration
//! status, schedules config requests with exponential backoff, enforces the
//! membership model on ingress, and resolves destination MACs on egress.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;
use vether_core::{Address, Mac, NetworkId};

use crate::bridge::BridgeTable;
use crate::com::CertificateOfMembership;
use crate::config::NetworkConfig;
use crate::constants::{CONFIG_REQUEST_BASE_INTERVAL, CONFIG_REQUEST_MAX_INTERVAL};
use crate::error::NetworkError;
use crate::multicast::MulticastGroup;

/// Externally visible network state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    /// Waiting for a configuration from the controller.
    Requesting,
    /// Configured and authorized.
    Ok,
    /// The controller refused us.
    AccessDenied,
    /// The controller does not know this network.
    NotFound,
    /// The host's port setup callback failed.
    PortError,
    /// The controller says our protocol version is too old.
    ClientTooOld,
}

pub struct Network {
    nwid: NetworkId,
    /// Our derived MAC on this network.
    mac: Mac,
    us: Address,
    status: NetworkStatus,
    config: Option<NetworkConfig>,
    subscriptions: BTreeSet<MulticastGroup>,
    bridge: BridgeTable,
    /// Verified membership certificates presented by peers.
    peer_coms: HashMap<Address, CertificateOfMembership>,
    pub last_config_request: u64,
    config_request_interval: u64,
    config_requests_sent: u32,
    pub port_error: i32,
}

impl Network {
    pub fn new(nwid: NetworkId, us: Address) -> Self {
        Self {
            nwid,
            mac: Mac::for_node(nwid, us),
            us,
            status: NetworkStatus::Requesting,
            config: None,
            subscriptions: BTreeSet::new(),
            bridge: BridgeTable::new(),
            peer_coms: HashMap::new(),
            last_config_request: 0,
            config_request_interval: CONFIG_REQUEST_BASE_INTERVAL,
            config_requests_sent: 0,
            port_error: 0,
        }
    }

    pub fn nwid(&self) -> NetworkId {
        self.nwid
    }

    pub fn mac(&self) -> Mac {
        self.mac
    }

    #[must_use]
    pub fn status(&self) -> NetworkStatus {
        self.status
    }

    pub fn config(&self) -> Option<&NetworkConfig> {
        self.config.as_ref()
    }

    /// Our own membership certificate, if the controller issued one.
    pub fn our_com(&self) -> Option<&CertificateOfMembership> {
        self.config.as_ref().and_then(|c| c.com.as_ref())
    }

    // -- Config lifecycle --

    /// Whether a config (re)request is due.
    #[must_use]
    pub fn config_request_due(&self, now: u64) -> bool {
        if self.status != NetworkStatus::Requesting {
            return false;
        }
        self.last_config_request == 0
            || now.saturating_sub(self.last_config_request) >= self.config_request_interval
    }

    /// Record that a request went out. The first retry waits the base
    /// interval; each further one doubles up to the cap.
    pub fn note_config_requested(&mut self, now: u64) {
        self.last_config_request = now;
        if self.config_requests_sent > 0 {
            self.config_request_interval =
                (self.config_request_interval * 2).min(CONFIG_REQUEST_MAX_INTERVAL);
        }
        self.config_requests_sent += 1;
    }

    /// The deadline for the next config request, while one is pending.
    #[must_use]
    pub fn next_config_request_deadline(&self) -> Option<u64> {
        (self.status == NetworkStatus::Requesting)
            .then(|| self.last_config_request + self.config_request_interval)
    }

    /// The controller (or a REFRESH verb) invalidated our config.
    pub fn mark_config_dirty(&mut self) {
        self.status = NetworkStatus::Requesting;
        self.config_request_interval = CONFIG_REQUEST_BASE_INTERVAL;
        self.config_requests_sent = 0;
        self.last_config_request = 0;
    }

    /// Adopt a validated config. Revisions never go backwards.
    pub fn apply_config(&mut self, config: NetworkConfig) -> Result<(), NetworkError> {
        if let Some(current) = &self.config {
            if config.revision < current.revision {
                return Err(NetworkError::RevisionRollback {
                    current: current.revision,
                    candidate: config.revision,
                });
            }
        }
        debug!(nwid = %self.nwid, revision = config.revision, "network config applied");
        self.config = Some(config);
        self.status = NetworkStatus::Ok;
        self.config_request_interval = CONFIG_REQUEST_BASE_INTERVAL;
        self.config_requests_sent = 0;
        self.port_error = 0;
        Ok(())
    }

    /// The controller answered with a terminal error.
    pub fn set_error_status(&mut self, status: NetworkStatus) {
        debug_assert!(matches!(
            status,
            NetworkStatus::AccessDenied | NetworkStatus::NotFound | NetworkStatus::ClientTooOld
        ));
        self.status = status;
    }

    /// The host's port callback failed with `code`.
    pub fn set_port_error(&mut self, code: i32) {
        self.status = NetworkStatus::PortError;
        self.port_error = code;
    }

    // -- Membership --

    /// Cache a peer's certificate. The caller has already verified the
    /// controller signature.
    pub fn cache_peer_com(&mut self, peer: Address, com: CertificateOfMembership) {
        self.peer_coms.insert(peer, com);
    }

    pub fn peer_com(&self, peer: Address) -> Option<&CertificateOfMembership> {
        self.peer_coms.get(&peer)
    }

    /// Whether `peer` may exchange frames with us under the current config.
    #[must_use]
    pub fn member_authorized(&self, peer: Address) -> bool {
        let Some(config) = &self.config else {
            return false;
        };
        if !config.is_private() {
            return true;
        }
        match (self.our_com(), self.peer_coms.get(&peer)) {
            (Some(ours), Some(theirs)) => ours.agrees_with(theirs),
            _ => false,
        }
    }

    // -- Frame gates --

    /// Ingress admission for a unicast/multicast frame from `source`.
    ///
    /// Admits iff the network is OK, the member is authorized, and any
    /// foreign source MAC comes from an authorized bridge (whose route we
    /// then learn). Failures are silent drops by contract.
    pub fn gate_incoming_frame(&mut self, source: Address, src_mac: Mac, now: u64) -> bool {
        if self.status != NetworkStatus::Ok {
            return false;
        }
        if !self.member_authorized(source) {
            return false;
        }
        if !src_mac.is_derived_for(self.nwid, source) {
            let Some(config) = &self.config else {
                return false;
            };
            if !config.is_active_bridge(source) {
                return false;
            }
            self.bridge.learn(src_mac, source, now);
        }
        true
    }

    /// Egress admission for a frame from the host tap.
    #[must_use]
    pub fn gate_outgoing_frame(&self, dst_mac: Mac, len: usize) -> bool {
        let Some(config) = &self.config else {
            return false;
        };
        if self.status != NetworkStatus::Ok {
            return false;
        }
        if len > config.mtu {
            return false;
        }
        if dst_mac.is_broadcast() && !config.broadcast_enabled {
            return false;
        }
        true
    }

    /// Resolve a unicast destination MAC to a member address: derived MACs
    /// map algebraically, anything else consults the learned bridge table.
    #[must_use]
    pub fn egress_target(&self, dst_mac: Mac, now: u64) -> Option<Address> {
        let derived = dst_mac.to_node_address(self.nwid);
        if Mac::for_node(self.nwid, derived) == dst_mac && derived != self.us {
            return Some(derived);
        }
        self.bridge.lookup(dst_mac, now)
    }

    pub fn bridge_mut(&mut self) -> &mut BridgeTable {
        &mut self.bridge
    }

    // -- Multicast subscriptions --

    /// Subscribe; returns true if the subscription is new.
    pub fn subscribe(&mut self, group: MulticastGroup) -> bool {
        self.subscriptions.insert(group)
    }

    /// Unsubscribe; returns true if the subscription existed.
    pub fn unsubscribe(&mut self, group: MulticastGroup) -> bool {
        self.subscriptions.remove(&group)
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &MulticastGroup> {
        self.subscriptions.iter()
    }

    #[must_use]
    pub fn is_subscribed(&self, group: MulticastGroup) -> bool {
        self.subscriptions.contains(&group)
    }

    /// Periodic cleanup of learned state.
    pub fn clean(&mut self, now: u64) {
        self.bridge.prune(now);
    }
}
