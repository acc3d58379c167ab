//! The engine facade.
//!
//! A [`Node`] owns all protocol state behind coarse locks and is safe to
//! drive from multiple threads at once. Lock acquisition follows a fixed
//! order (topology, peers, networks, multicaster, then the utility
//! mutexes), and no host callback ever runs with a lock held: every code
//! path accumulates its side effects in an [`Outputs`] batch and flushes it
//! after the last guard drops, so callbacks may freely re-enter any entry
//! point.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use tracing::{debug, info, trace, warn};

use vether_core::constants::UDP_PAYLOAD_MTU;
use vether_core::identity::Identity;
use vether_core::packet::{fragment_packet, CipherSuite, Packet};
use vether_core::verb::Verb;
use vether_core::world::World;
use vether_core::{Address, Mac, NetworkId};
use vether_crypto::ed25519::Ed25519Public;
use vether_network::multicast::MulticastGroup;
use vether_network::network::{Network, NetworkStatus};
use vether_network::Multicaster;
use vether_network::NetworkConfig;
use vether_transport::assembler::FragmentAssembler;
use vether_transport::cluster::{Cluster, GeoCoords};
use vether_transport::constants::ROOT_OFFLINE_TIMEOUT;
use vether_transport::peer::PeerRole;
use vether_transport::topology::Topology;
use vether_transport::whois::WhoisQueue;
use vether_transport::PeerTable;

use crate::events::Event;
use crate::host::{Host, PortOp};
use crate::proto;
use crate::result::ResultCode;
use crate::scheduler::Deadline;
use crate::storage;
use crate::{PROTOCOL_VERSION, VERSION_MAJOR, VERSION_MINOR, VERSION_REVISION};

/// Peers with traffic this recent are kept pinged.
const PEER_ACTIVITY_TIMEOUT: u64 = 300_000;

/// Minimum interval between connection-probe HELLO bursts to one peer.
const HELLO_PROBE_INTERVAL: u64 = 2_000;

/// Minimum interval between RENDEZVOUS introductions for one peer.
const INTRODUCTION_INTERVAL: u64 = 30_000;

/// Interval between PUSH_DIRECT_PATHS advertisements per peer.
const DIRECT_PATH_PUSH_INTERVAL: u64 = 120_000;

/// How long a multicast frame waits for gather results before giving up.
const PENDING_MULTICAST_TTL: u64 = 5_000;

/// How many likers we ask for in one MULTICAST_GATHER.
const GATHER_REQUEST_LIMIT: u32 = 64;

/// Most members we will return to one MULTICAST_GATHER.
const GATHER_REPLY_LIMIT: usize = 200;

/// Construction-time options: the planet key that signs worlds and the
/// roster to fall back on when the data store has none cached.
pub struct NodeOptions {
    pub planet_key: Ed25519Public,
    pub default_world: World,
    /// Physical endpoints the host knows it is reachable at; advertised to
    /// peers via PUSH_DIRECT_PATHS.
    pub advertised_endpoints: Vec<SocketAddr>,
}

/// Snapshot returned by [`Node::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub address: Address,
    pub world_id: u64,
    pub world_timestamp: u64,
    pub public_identity: String,
    pub secret_identity: String,
    pub online: bool,
}

/// Silent-drop accounting, readable by the host for diagnostics.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub auth_failures: AtomicU64,
    pub parse_failures: AtomicU64,
    pub unknown_verbs: AtomicU64,
    pub dropped_frames: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    pub auth_failures: u64,
    pub parse_failures: u64,
    pub unknown_verbs: u64,
    pub dropped_frames: u64,
}

/// A multicast frame waiting on gather results.
pub(crate) struct PendingMulticast {
    pub nwid: NetworkId,
    pub group: MulticastGroup,
    pub from_mac: Mac,
    pub ethertype: u16,
    pub payload: Vec<u8>,
    pub limit: usize,
    pub sent_to: HashSet<Address>,
    pub deadline: u64,
}

/// Side effects accumulated under locks, executed after they drop.
#[derive(Default)]
pub(crate) struct Outputs {
    pub wire: Vec<(Option<SocketAddr>, SocketAddr, Vec<u8>)>,
    pub frames: Vec<(NetworkId, Mac, Mac, u16, u16, Vec<u8>)>,
    pub port_ops: Vec<(NetworkId, PortOp, NetworkStatus, Option<NetworkConfig>)>,
    pub events: Vec<Event>,
    pub store_puts: Vec<(String, Vec<u8>, bool)>,
    pub store_deletes: Vec<String>,
    pub cluster_sends: Vec<(u16, Vec<u8>)>,
}

pub struct Node<H: Host> {
    host: H,
    identity: Identity,
    topology: RwLock<Topology>,
    peers: RwLock<PeerTable>,
    networks: RwLock<HashMap<NetworkId, Network>>,
    multicaster: RwLock<Multicaster>,
    assembler: Mutex<FragmentAssembler>,
    whois: Mutex<WhoisQueue>,
    pending_multicast: Mutex<Vec<PendingMulticast>>,
    cluster: Mutex<Option<Cluster>>,
    advertised: RwLock<Vec<SocketAddr>>,
    online: AtomicBool,
    collision: AtomicBool,
    last_multicast_announce: AtomicU64,
    pub(crate) counters: Counters,
}

impl<H: Host> Node<H> {
    /// Construct the engine: load or generate the identity, load the
    /// cached world, emit [`Event::Up`].
    pub fn new(now: u64, host: H, options: NodeOptions) -> Result<Self, ResultCode> {
        let identity = match storage::load_identity(&host) {
            Ok(Some(identity)) => {
                debug!(address = %identity.address(), "identity loaded");
                identity
            }
            Ok(None) => {
                let identity = Identity::generate();
                info!(address = %identity.address(), "identity generated");
                if !storage::save_identity(&host, &identity) {
                    return Err(ResultCode::FatalDataStoreFailed);
                }
                identity
            }
            Err(err) => {
                warn!(%err, "identity record unusable");
                return Err(ResultCode::FatalDataStoreFailed);
            }
        };

        let world = match host.data_store_get(storage::WORLD) {
            Some(bytes) => match World::parse(&bytes) {
                Ok(cached)
                    if cached.verify(&options.planet_key)
                        && cached.id == options.default_world.id
                        && cached.timestamp >= options.default_world.timestamp =>
                {
                    debug!(ts = cached.timestamp, "cached world adopted");
                    cached
                }
                _ => options.default_world,
            },
            None => options.default_world,
        };

        let node = Self {
            host,
            identity,
            topology: RwLock::new(Topology::new(world, options.planet_key)),
            peers: RwLock::new(PeerTable::new()),
            networks: RwLock::new(HashMap::new()),
            multicaster: RwLock::new(Multicaster::new()),
            assembler: Mutex::new(FragmentAssembler::new()),
            whois: Mutex::new(WhoisQueue::new()),
            pending_multicast: Mutex::new(Vec::new()),
            cluster: Mutex::new(None),
            advertised: RwLock::new(options.advertised_endpoints),
            online: AtomicBool::new(false),
            collision: AtomicBool::new(false),
            last_multicast_announce: AtomicU64::new(now),
            counters: Counters::default(),
        };
        node.host.event(Event::Up);
        Ok(node)
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn address(&self) -> Address {
        self.identity.address()
    }

    /// Current engine status.
    pub fn status(&self) -> NodeStatus {
        let topo = self.topology.read().expect("lock");
        NodeStatus {
            address: self.identity.address(),
            world_id: topo.world_id(),
            world_timestamp: topo.world_timestamp(),
            public_identity: self.identity.to_string_with_secret(false),
            secret_identity: self.identity.to_string_with_secret(true),
            online: self.online.load(Ordering::Relaxed),
        }
    }

    /// Whether an authoritative upstream reported our address as taken.
    /// The engine keeps answering entry points, but the host must generate
    /// a fresh identity and restart to communicate again.
    #[must_use]
    pub fn has_fatal_collision(&self) -> bool {
        self.collision.load(Ordering::Relaxed)
    }

    /// Smoothed round-trip latency to a peer, when measured.
    #[must_use]
    pub fn peer_latency(&self, address: Address) -> Option<u32> {
        self.peers
            .read()
            .expect("lock")
            .get(address)
            .and_then(|p| p.latency)
    }

    /// Drop counters for diagnostics.
    pub fn counters(&self) -> CounterSnapshot {
        CounterSnapshot {
            auth_failures: self.counters.auth_failures.load(Ordering::Relaxed),
            parse_failures: self.counters.parse_failures.load(Ordering::Relaxed),
            unknown_verbs: self.counters.unknown_verbs.load(Ordering::Relaxed),
            dropped_frames: self.counters.dropped_frames.load(Ordering::Relaxed),
        }
    }

    /// Replace the advertised physical endpoints.
    pub fn set_advertised_endpoints(&self, endpoints: Vec<SocketAddr>) {
        *self.advertised.write().expect("lock") = endpoints;
    }

    // ------------------------------------------------------ entry points --

    /// Feed one received UDP datagram into the engine.
    pub fn process_wire_packet(
        &self,
        now: u64,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        data: &[u8],
    ) -> (ResultCode, u64) {
        let mut out = Outputs::default();
        self.handle_wire_packet(now, local, remote, data, &mut out);
        self.flush(out);
        (ResultCode::Ok, self.next_deadline(now))
    }

    /// Feed one outbound Ethernet frame from a virtual network tap.
    pub fn process_virtual_network_frame(
        &self,
        now: u64,
        nwid: NetworkId,
        src_mac: Mac,
        dst_mac: Mac,
        ethertype: u16,
        vlan_id: u16,
        data: &[u8],
    ) -> (ResultCode, u64) {
        let mut out = Outputs::default();
        let code = self.handle_virtual_frame(now, nwid, src_mac, dst_mac, ethertype, vlan_id, data, &mut out);
        self.flush(out);
        (code, self.next_deadline(now))
    }

    /// Run all due time-driven work. Safe to call earlier than the hinted
    /// deadline; everything in here is idempotent under frequent calls.
    pub fn process_background_tasks(&self, now: u64) -> (ResultCode, u64) {
        let mut out = Outputs::default();

        self.ping_roots(now, &mut out);
        self.ping_active_peers(now, &mut out);
        self.request_due_configs(now, &mut out);
        self.announce_multicast_subscriptions(now, &mut out);
        self.push_direct_paths(now, &mut out);
        self.run_cluster_tasks(now, &mut out);

        {
            let mut assembler = self.assembler.lock().expect("lock");
            assembler.expire(now);
        }
        {
            let mut whois = self.whois.lock().expect("lock");
            whois.expire(now);
            let retries = whois.due_for_retry(now);
            drop(whois);
            for address in retries {
                // request() re-checks the per-target rate limit and stamps
                // the retry, so over-frequent background calls stay quiet.
                let should_ask = self.whois.lock().expect("lock").request(address, now);
                if should_ask {
                    self.send_whois(now, address, &mut out);
                }
            }
        }
        {
            let mut multicaster = self.multicaster.write().expect("lock");
            multicaster.prune(now);
        }
        {
            let mut pending = self.pending_multicast.lock().expect("lock");
            pending.retain(|p| p.deadline > now);
        }
        {
            let mut networks = self.networks.write().expect("lock");
            for network in networks.values_mut() {
                network.clean(now);
            }
        }
        {
            let mut peers = self.peers.write().expect("lock");
            for (_, peer) in peers.iter_mut() {
                peer.prune_expired_paths(now);
                peer.elect_preferred(now);
            }
        }

        self.update_online_state(now, &mut out);
        self.flush(out);
        (ResultCode::Ok, self.next_deadline(now))
    }

    /// Join a virtual network. Idempotent.
    pub fn join(&self, now: u64, nwid: NetworkId) -> (ResultCode, u64) {
        let mut out = Outputs::default();
        // Restore persisted subscriptions before taking any lock; the data
        // store is a host callback.
        let persisted_subs = storage::load_subscriptions(&self.host, nwid);
        let joined = {
            let mut networks = self.networks.write().expect("lock");
            if networks.contains_key(&nwid) {
                false
            } else {
                let mut network = Network::new(nwid, self.identity.address());
                // Every member implicitly subscribes to the broadcast group.
                network.subscribe(MulticastGroup::broadcast());
                for group in persisted_subs {
                    network.subscribe(group);
                }
                info!(%nwid, "network joined");
                out.port_ops
                    .push((nwid, PortOp::Up, network.status(), None));
                networks.insert(nwid, network);
                true
            }
        };
        if joined {
            self.send_config_request(now, nwid, &mut out);
        }
        self.flush(out);
        (ResultCode::Ok, self.next_deadline(now))
    }

    /// Leave a network: DOWN then DESTROY, then forget everything local.
    pub fn leave(&self, now: u64, nwid: NetworkId) -> (ResultCode, u64) {
        let mut out = Outputs::default();
        let removed = {
            let mut networks = self.networks.write().expect("lock");
            networks.remove(&nwid)
        };
        let code = match removed {
            Some(network) => {
                info!(%nwid, "network left");
                let status = network.status();
                let config = network.config().cloned();
                out.port_ops
                    .push((nwid, PortOp::Down, status, config.clone()));
                out.port_ops.push((nwid, PortOp::Destroy, status, config));
                out.store_deletes.push(storage::network_config_name(nwid));
                out.store_deletes.push(storage::network_subs_name(nwid));
                self.multicaster
                    .write()
                    .expect("lock")
                    .forget_network(nwid);
                ResultCode::Ok
            }
            None => ResultCode::NetworkNotFound,
        };
        self.flush(out);
        (code, self.next_deadline(now))
    }

    /// Subscribe to a multicast group on a joined network. Idempotent.
    pub fn multicast_subscribe(
        &self,
        now: u64,
        nwid: NetworkId,
        group: MulticastGroup,
    ) -> (ResultCode, u64) {
        let mut out = Outputs::default();
        let (code, snapshot) = {
            let mut networks = self.networks.write().expect("lock");
            match networks.get_mut(&nwid) {
                Some(network) => {
                    let changed = network.subscribe(group);
                    let snapshot =
                        changed.then(|| network.subscriptions().copied().collect::<Vec<_>>());
                    (ResultCode::Ok, snapshot)
                }
                None => (ResultCode::NetworkNotFound, None),
            }
        };
        if let Some(groups) = snapshot {
            storage::save_subscriptions(&self.host, nwid, groups);
            self.send_like(now, nwid, vec![group], &mut out);
        }
        self.flush(out);
        (code, self.next_deadline(now))
    }

    /// Drop a multicast subscription. Idempotent.
    pub fn multicast_unsubscribe(&self, nwid: NetworkId, group: MulticastGroup) -> ResultCode {
        let (code, snapshot) = {
            let mut networks = self.networks.write().expect("lock");
            match networks.get_mut(&nwid) {
                Some(network) => {
                    let changed = network.unsubscribe(group);
                    let snapshot =
                        changed.then(|| network.subscriptions().copied().collect::<Vec<_>>());
                    (ResultCode::Ok, snapshot)
                }
                None => (ResultCode::NetworkNotFound, None),
            }
        };
        if let Some(groups) = snapshot {
            storage::save_subscriptions(&self.host, nwid, groups);
        }
        code
    }

    // ----------------------------------------------------------- cluster --

    /// Enable the cluster facility on this instance.
    pub fn cluster_init(&self, self_id: u16, key: [u8; 32], coords: GeoCoords) -> ResultCode {
        *self.cluster.lock().expect("lock") = Some(Cluster::new(self_id, key, coords));
        ResultCode::Ok
    }

    /// Provision a sibling out of band.
    pub fn cluster_add_member(
        &self,
        now: u64,
        member: u16,
        coords: GeoCoords,
        endpoints: Vec<SocketAddr>,
    ) -> ResultCode {
        let mut guard = self.cluster.lock().expect("lock");
        let Some(cluster) = guard.as_mut() else {
            return ResultCode::UnsupportedOperation;
        };
        match cluster.add_member(member, coords, endpoints, now) {
            Ok(()) => ResultCode::Ok,
            Err(_) => ResultCode::BadParameter,
        }
    }

    /// Drop a sibling; its attributed peers become reclaimable.
    pub fn cluster_remove_member(&self, member: u16) -> ResultCode {
        let mut guard = self.cluster.lock().expect("lock");
        let Some(cluster) = guard.as_mut() else {
            return ResultCode::UnsupportedOperation;
        };
        cluster.remove_member(member);
        ResultCode::Ok
    }

    /// Feed a message received from the host's cluster backplane.
    pub fn cluster_handle_message(&self, now: u64, data: &[u8]) -> ResultCode {
        let mut guard = self.cluster.lock().expect("lock");
        let Some(cluster) = guard.as_mut() else {
            return ResultCode::UnsupportedOperation;
        };
        match cluster.decode_message(data) {
            Ok(message) => {
                let _ = cluster.handle_message(message, now);
                ResultCode::Ok
            }
            Err(_) => {
                self.counters.parse_failures.fetch_add(1, Ordering::Relaxed);
                ResultCode::BadParameter
            }
        }
    }

    // --------------------------------------------------------- internals --

    /// Execute accumulated side effects with no locks held.
    pub(crate) fn flush(&self, out: Outputs) {
        for (local, remote, data) in out.wire {
            trace!(?remote, len = data.len(), "wire send");
            self.host.wire_send(local, remote, &data);
        }
        for (nwid, src, dst, ethertype, vlan, data) in out.frames {
            self.host.virtual_frame(nwid, src, dst, ethertype, vlan, &data);
        }
        for (nwid, op, status, config) in out.port_ops {
            let code = self.host.port_config(nwid, op, status, config.as_ref());
            if code != 0 && op != PortOp::Destroy {
                warn!(%nwid, code, "port config callback failed");
                let mut networks = self.networks.write().expect("lock");
                if let Some(network) = networks.get_mut(&nwid) {
                    network.set_port_error(code);
                }
            }
        }
        for (name, data, secure) in out.store_puts {
            self.host.data_store_put(&name, &data, secure);
        }
        for name in out.store_deletes {
            self.host.data_store_delete(&name);
        }
        for (member, data) in out.cluster_sends {
            self.host.cluster_send(member, &data);
        }
        for event in out.events {
            self.host.event(event);
        }
    }

    /// Build our HELLO body for `now`.
    pub(crate) fn build_hello(&self, now: u64) -> proto::Hello {
        let (world_id, world_timestamp) = {
            let topo = self.topology.read().expect("lock");
            (topo.world_id(), topo.world_timestamp())
        };
        proto::Hello {
            protocol_version: PROTOCOL_VERSION,
            major: VERSION_MAJOR,
            minor: VERSION_MINOR,
            revision: VERSION_REVISION,
            timestamp: now,
            identity: self.identity.public_only(),
            world_id,
            world_timestamp,
        }
    }

    /// Armor, fragment, and queue a packet toward a specific endpoint.
    pub(crate) fn transmit(
        &self,
        mut packet: Packet,
        key: &[u8; 32],
        local: Option<SocketAddr>,
        remote: SocketAddr,
        out: &mut Outputs,
    ) {
        let cipher = if packet.verb() == Some(Verb::Hello) {
            CipherSuite::Poly1305None
        } else {
            CipherSuite::Poly1305Salsa2012
        };
        packet.armor(key, cipher);
        let raw = packet.serialize();
        match fragment_packet(&raw, UDP_PAYLOAD_MTU) {
            Ok(None) => out.wire.push((local, remote, raw)),
            Ok(Some(datagrams)) => {
                for datagram in datagrams {
                    out.wire.push((local, remote, datagram));
                }
            }
            Err(_) => {
                self.counters.dropped_frames.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Send a HELLO probe to one endpoint of a known peer.
    pub(crate) fn send_hello_to(
        &self,
        now: u64,
        dest: Address,
        remote: SocketAddr,
        out: &mut Outputs,
    ) {
        let key = {
            let mut peers = self.peers.write().expect("lock");
            let Some(peer) = peers.get_mut(dest) else {
                return;
            };
            peer.pinged(now, remote);
            *peer.key()
        };
        let hello = self.build_hello(now);
        let packet =
            Packet::new_outbound(dest, self.identity.address(), Verb::Hello, &hello.encode());
        self.transmit(packet, &key, None, remote, out);
    }

    /// The central outbound path: direct if a live path exists, else via
    /// the best root as relay, else blind to a known candidate endpoint,
    /// else park behind WHOIS.
    pub(crate) fn send_packet(&self, now: u64, packet: Packet, out: &mut Outputs) {
        enum Plan {
            Send {
                key: [u8; 32],
                local: Option<SocketAddr>,
                remote: SocketAddr,
            },
            Whois,
            Drop,
        }

        let dest = packet.dest;
        let (roots, dest_root_identity, dest_root_endpoints) = {
            let topo = self.topology.read().expect("lock");
            (
                topo.root_addresses(),
                topo.root_identity(dest).cloned(),
                topo.root_endpoints(dest).to_vec(),
            )
        };

        let mut probes: Vec<SocketAddr> = Vec::new();
        let plan = {
            let mut peers = self.peers.write().expect("lock");

            if !peers.contains(dest) {
                if let Some(identity) = &dest_root_identity {
                    match peers.get_or_create(&self.identity, identity, PeerRole::Root) {
                        Ok(peer) => {
                            for ep in &dest_root_endpoints {
                                peer.hint_path(None, *ep);
                            }
                        }
                        Err(_) => {
                            out.events.push(Event::FatalIdentityCollision);
                            self.collision.store(true, Ordering::Relaxed);
                            return;
                        }
                    }
                }
            }

            let relay = peers
                .best_alive_of(&roots, now)
                .filter(|a| *a != dest)
                .and_then(|a| peers.get(a).and_then(|p| p.direct_send_endpoint(now)));

            match peers.get_mut(dest) {
                Some(peer) => {
                    let key = *peer.key();
                    // Stale-path probing: no live path means we HELLO every
                    // candidate while the payload takes the relay.
                    if !peer.has_alive_path(now)
                        && now.saturating_sub(peer.last_hello_sent) >= HELLO_PROBE_INTERVAL
                    {
                        probes = peer.paths().iter().map(|p| p.remote).collect();
                        for remote in &probes {
                            peer.pinged(now, *remote);
                        }
                    }
                    if let Some((local, remote)) = peer.direct_send_endpoint(now) {
                        peer.sent_via(now, remote);
                        Plan::Send {
                            key,
                            local,
                            remote,
                        }
                    } else if let Some((local, remote)) = relay {
                        peer.sent(now);
                        Plan::Send {
                            key,
                            local,
                            remote,
                        }
                    } else if let Some(remote) = peer.paths().first().map(|p| p.remote) {
                        peer.sent(now);
                        Plan::Send {
                            key,
                            local: None,
                            remote,
                        }
                    } else {
                        Plan::Drop
                    }
                }
                None => Plan::Whois,
            }
        };

        match plan {
            Plan::Send { key, local, remote } => {
                self.transmit(packet, &key, local, remote, out);
                for probe in probes {
                    self.send_hello_to(now, dest, probe, out);
                }
            }
            Plan::Whois => {
                let should_ask = {
                    let mut whois = self.whois.lock().expect("lock");
                    whois.park(dest, packet, now);
                    whois.request(dest, now)
                };
                if should_ask {
                    self.send_whois(now, dest, out);
                }
            }
            Plan::Drop => {
                trace!(%dest, "no path and no relay, dropping");
                self.counters.dropped_frames.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Emit a WHOIS for `address` toward the best root.
    pub(crate) fn send_whois(&self, now: u64, address: Address, out: &mut Outputs) {
        let target = {
            let topo = self.topology.read().expect("lock");
            let roots = topo.root_addresses();
            drop(topo);
            let peers = self.peers.read().expect("lock");
            peers
                .best_alive_of(&roots, now)
                .or_else(|| roots.first().copied())
        };
        let Some(root) = target else {
            return;
        };
        if root == address {
            return;
        }
        let packet = Packet::new_outbound(
            root,
            self.identity.address(),
            Verb::Whois,
            &proto::encode_whois(address),
        );
        self.send_packet(now, packet, out);
    }

    /// Send a NETWORK_CONFIG_REQUEST for a joined network to its controller.
    pub(crate) fn send_config_request(&self, now: u64, nwid: NetworkId, out: &mut Outputs) {
        let have_revision = {
            let mut networks = self.networks.write().expect("lock");
            let Some(network) = networks.get_mut(&nwid) else {
                return;
            };
            network.note_config_requested(now);
            network.config().map_or(0, |c| c.revision)
        };
        let request = proto::NetworkConfigRequest {
            nwid,
            have_revision,
        };
        let packet = Packet::new_outbound(
            nwid.controller(),
            self.identity.address(),
            Verb::NetworkConfigRequest,
            &request.encode(),
        );
        debug!(%nwid, have_revision, "requesting network config");
        self.send_packet(now, packet, out);
    }

    /// Announce multicast subscriptions for one network, with our COM on
    /// private networks, to the controller and the best root.
    pub(crate) fn send_like(
        &self,
        now: u64,
        nwid: NetworkId,
        groups: Vec<MulticastGroup>,
        out: &mut Outputs,
    ) {
        if groups.is_empty() {
            return;
        }
        let com = {
            let networks = self.networks.read().expect("lock");
            networks
                .get(&nwid)
                .and_then(|n| n.our_com().cloned())
        };
        let like = proto::MulticastLike {
            com,
            entries: groups.into_iter().map(|g| (nwid, g)).collect(),
        };
        let body = like.encode();

        let mut targets = vec![nwid.controller()];
        {
            let topo = self.topology.read().expect("lock");
            let roots = topo.root_addresses();
            drop(topo);
            let peers = self.peers.read().expect("lock");
            if let Some(root) = peers.best_alive_of(&roots, now) {
                if !targets.contains(&root) {
                    targets.push(root);
                }
            }
        }
        for target in targets {
            if target == self.identity.address() {
                continue;
            }
            let packet =
                Packet::new_outbound(target, self.identity.address(), Verb::MulticastLike, &body);
            self.send_packet(now, packet, out);
        }
    }

    // -------------------------------------------------- background parts --

    fn ping_roots(&self, now: u64, out: &mut Outputs) {
        let roster: Vec<(Identity, Vec<SocketAddr>)> = {
            let topo = self.topology.read().expect("lock");
            topo.roots()
                .filter_map(|(a, eps)| {
                    topo.root_identity(a).map(|i| (i.clone(), eps.to_vec()))
                })
                .collect()
        };

        let mut to_ping: Vec<(Address, Vec<SocketAddr>)> = Vec::new();
        {
            let mut peers = self.peers.write().expect("lock");
            for (identity, stable) in &roster {
                let address = identity.address();
                if address == self.identity.address() {
                    continue;
                }
                let Ok(peer) = peers.get_or_create(&self.identity, identity, PeerRole::Root) else {
                    continue;
                };
                peer.role = PeerRole::Root;
                for ep in stable {
                    peer.hint_path(None, *ep);
                }

                let due = if peer.last_hello_sent == 0 {
                    // First contact: probe every stable endpoint right away.
                    stable.clone()
                } else {
                    peer.paths_needing_ping(now)
                };
                if !due.is_empty() {
                    to_ping.push((address, due));
                }
            }
        }
        for (address, endpoints) in to_ping {
            for remote in endpoints {
                self.send_hello_to(now, address, remote, out);
            }
        }
    }

    fn ping_active_peers(&self, now: u64, out: &mut Outputs) {
        let mut to_ping: Vec<(Address, Vec<SocketAddr>)> = Vec::new();
        {
            let peers = self.peers.read().expect("lock");
            for (address, peer) in peers.iter() {
                if peer.role == PeerRole::Root {
                    continue;
                }
                let active = now.saturating_sub(peer.last_receive) < PEER_ACTIVITY_TIMEOUT
                    || now.saturating_sub(peer.last_send) < PEER_ACTIVITY_TIMEOUT;
                if !active {
                    continue;
                }
                let due = peer.paths_needing_ping(now);
                if !due.is_empty() {
                    to_ping.push((*address, due));
                }
            }
        }
        for (address, endpoints) in to_ping {
            for remote in endpoints {
                self.send_hello_to(now, address, remote, out);
            }
        }
    }

    fn request_due_configs(&self, now: u64, out: &mut Outputs) {
        let due: Vec<NetworkId> = {
            let networks = self.networks.read().expect("lock");
            networks
                .values()
                .filter(|n| n.config_request_due(now))
                .map(Network::nwid)
                .collect()
        };
        for nwid in due {
            self.send_config_request(now, nwid, out);
        }
    }

    fn announce_multicast_subscriptions(&self, now: u64, out: &mut Outputs) {
        let last = self.last_multicast_announce.load(Ordering::Relaxed);
        if now.saturating_sub(last) < vether_network::constants::MULTICAST_ANNOUNCE_INTERVAL {
            return;
        }
        self.last_multicast_announce.store(now, Ordering::Relaxed);

        let subs: Vec<(NetworkId, Vec<MulticastGroup>)> = {
            let networks = self.networks.read().expect("lock");
            networks
                .values()
                .map(|n| (n.nwid(), n.subscriptions().copied().collect()))
                .filter(|(_, groups): &(_, Vec<MulticastGroup>)| !groups.is_empty())
                .collect()
        };
        for (nwid, groups) in subs {
            self.send_like(now, nwid, groups, out);
        }
    }

    fn push_direct_paths(&self, now: u64, out: &mut Outputs) {
        let advertised = self.advertised.read().expect("lock").clone();
        if advertised.is_empty() {
            return;
        }
        let body = proto::encode_push_direct_paths(&advertised);

        let mut targets = Vec::new();
        {
            let mut peers = self.peers.write().expect("lock");
            for (address, peer) in peers.iter_mut() {
                if peer.has_alive_path(now)
                    && now.saturating_sub(peer.last_direct_path_push) >= DIRECT_PATH_PUSH_INTERVAL
                {
                    peer.last_direct_path_push = now;
                    targets.push(*address);
                }
            }
        }
        for address in targets {
            let packet = Packet::new_outbound(
                address,
                self.identity.address(),
                Verb::PushDirectPaths,
                &body,
            );
            self.send_packet(now, packet, out);
        }
    }

    fn run_cluster_tasks(&self, now: u64, out: &mut Outputs) {
        let advertised = self.advertised.read().expect("lock").clone();
        let mut guard = self.cluster.lock().expect("lock");
        let Some(cluster) = guard.as_mut() else {
            return;
        };
        cluster.reap_dead(now);
        if cluster.heartbeat_due(now) {
            cluster.last_heartbeat_sent = now;
            let heartbeat = cluster.make_heartbeat(advertised);
            if let Ok(encoded) = cluster.encode_message(&heartbeat) {
                for member in cluster.member_ids() {
                    out.cluster_sends.push((member, encoded.clone()));
                }
            }
        }
    }

    pub(crate) fn update_online_state(&self, now: u64, out: &mut Outputs) {
        let any_root_alive = {
            let topo = self.topology.read().expect("lock");
            let roots = topo.root_addresses();
            drop(topo);
            let peers = self.peers.read().expect("lock");
            roots.iter().any(|a| {
                peers
                    .get(*a)
                    .is_some_and(|p| now.saturating_sub(p.last_receive) < ROOT_OFFLINE_TIMEOUT)
            })
        };
        let was_online = self.online.swap(any_root_alive, Ordering::Relaxed);
        if any_root_alive != was_online {
            info!(online = any_root_alive, "connectivity changed");
            out.events.push(if any_root_alive {
                Event::Online
            } else {
                Event::Offline
            });
        }
    }

    /// The earliest future deadline across all scheduled work.
    pub(crate) fn next_deadline(&self, now: u64) -> u64 {
        let mut deadline = Deadline::new(now);

        {
            let networks = self.networks.read().expect("lock");
            for network in networks.values() {
                if let Some(at) = network.next_config_request_deadline() {
                    deadline.offer(at);
                }
            }
        }
        {
            let peers = self.peers.read().expect("lock");
            for (_, peer) in peers.iter() {
                // Only peers the background task actually pings contribute
                // a ping deadline; anything else would pin the hint to
                // "immediately" and spin the host.
                let pinged = peer.role == PeerRole::Root
                    || now.saturating_sub(peer.last_receive) < PEER_ACTIVITY_TIMEOUT
                    || now.saturating_sub(peer.last_send) < PEER_ACTIVITY_TIMEOUT;
                if !pinged {
                    continue;
                }
                for path in peer.paths() {
                    let anchor = path.last_receive.max(path.last_ping);
                    deadline.offer_interval(anchor, vether_transport::constants::PING_INTERVAL);
                }
            }
        }
        {
            let mut assembler = self.assembler.lock().expect("lock");
            if let Some(at) = assembler.expire(now) {
                deadline.offer(at);
            }
        }
        {
            let mut whois = self.whois.lock().expect("lock");
            if let Some(at) = whois.expire(now) {
                deadline.offer(at);
            }
        }
        {
            let pending = self.pending_multicast.lock().expect("lock");
            for p in pending.iter() {
                deadline.offer(p.deadline);
            }
        }
        {
            let guard = self.cluster.lock().expect("lock");
            if let Some(cluster) = guard.as_ref() {
                deadline.offer_interval(
                    cluster.last_heartbeat_sent,
                    vether_transport::constants::CLUSTER_HEARTBEAT_INTERVAL,
                );
            }
        }

        deadline.resolve()
    }

    // Accessors used by the inbound handlers.

    pub(crate) fn host(&self) -> &H {
        &self.host
    }

    pub(crate) fn topology(&self) -> &RwLock<Topology> {
        &self.topology
    }

    pub(crate) fn peers(&self) -> &RwLock<PeerTable> {
        &self.peers
    }

    pub(crate) fn networks(&self) -> &RwLock<HashMap<NetworkId, Network>> {
        &self.networks
    }

    pub(crate) fn multicaster(&self) -> &RwLock<Multicaster> {
        &self.multicaster
    }

    pub(crate) fn assembler(&self) -> &Mutex<FragmentAssembler> {
        &self.assembler
    }

    pub(crate) fn whois_queue(&self) -> &Mutex<WhoisQueue> {
        &self.whois
    }

    pub(crate) fn pending_multicast(&self) -> &Mutex<Vec<PendingMulticast>> {
        &self.pending_multicast
    }

    pub(crate) fn cluster_state(&self) -> &Mutex<Option<Cluster>> {
        &self.cluster
    }

    pub(crate) fn mark_collision(&self) {
        self.collision.store(true, Ordering::Relaxed);
    }

    pub(crate) fn gather_limits(&self) -> (u32, usize) {
        (GATHER_REQUEST_LIMIT, GATHER_REPLY_LIMIT)
    }

    pub(crate) fn pending_multicast_ttl(&self) -> u64 {
        PENDING_MULTICAST_TTL
    }

    pub(crate) fn introduction_interval(&self) -> u64 {
        INTRODUCTION_INTERVAL
    }
}

impl<H: Host> Drop for Node<H> {
    fn drop(&mut self) {
        self.host.event(Event::Down);
    }
}
