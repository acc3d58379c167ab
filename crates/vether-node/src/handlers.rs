//! Inbound packet handling: triage, authentication, and verb dispatch.
//!
//! Policy per the protocol contract: anything that fails parsing or
//! authentication is dropped silently and counted. Handlers accumulate
//! side effects into [`Outputs`]; nothing here invokes a host callback
//! directly except `geolocate`, which is read before any lock is taken.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;

use tracing::{debug, trace, warn};

use vether_core::packet::{is_fragment, CipherSuite, Fragment, Packet};
use vether_core::verb::{ProtocolError, Verb};
use vether_core::world::World;
use vether_core::{Address, Mac, NetworkId};
use vether_network::network::NetworkStatus;
use vether_network::{CertificateOfMembership, NetworkConfig};
use vether_transport::peer::{PeerRole, RemoteVersion};

use crate::events::Event;
use crate::host::{Host, PortOp};
use crate::node::{Node, Outputs, PendingMulticast};
use crate::proto;
use crate::storage;

impl<H: Host> Node<H> {
    pub(crate) fn handle_wire_packet(
        &self,
        now: u64,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        data: &[u8],
        out: &mut Outputs,
    ) {
        if is_fragment(data) {
            self.handle_fragment(now, local, remote, data, out);
        } else {
            self.handle_packet_data(now, local, remote, data, out);
        }
    }

    fn handle_fragment(
        &self,
        now: u64,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        data: &[u8],
        out: &mut Outputs,
    ) {
        let frag = match Fragment::parse(data) {
            Ok(frag) => frag,
            Err(_) => {
                self.counters.parse_failures.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        if frag.dest != self.address() {
            self.relay_fragment(now, frag, out);
            return;
        }

        let assembled = {
            let mut assembler = self.assembler().lock().expect("lock");
            assembler.offer_fragment(frag, now)
        };
        if let Some(bytes) = assembled {
            // The head still carries the fragmented flag; dispatch the whole
            // packet directly instead of re-triaging it.
            if let Ok(whole) = Packet::parse(&bytes) {
                self.handle_complete(now, local, remote, whole, out);
            }
        }
    }

    fn relay_fragment(&self, now: u64, mut frag: Fragment, out: &mut Outputs) {
        if frag.hops >= vether_core::constants::MAX_HOPS {
            return;
        }
        frag.hops += 1;
        let target = {
            let peers = self.peers().read().expect("lock");
            peers
                .get(frag.dest)
                .and_then(|p| p.direct_send_endpoint(now))
        };
        if let Some((local, remote)) = target {
            out.wire.push((local, remote, frag.serialize()));
        }
    }

    fn handle_packet_data(
        &self,
        now: u64,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        data: &[u8],
        out: &mut Outputs,
    ) {
        let packet = match Packet::parse(data) {
            Ok(packet) => packet,
            Err(_) => {
                self.counters.parse_failures.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        if packet.source == self.address() || packet.source.is_reserved() {
            return;
        }

        if packet.dest != self.address() {
            self.relay_packet(now, remote, packet, out);
            return;
        }

        if packet.fragmented {
            let assembled = {
                let mut assembler = self.assembler().lock().expect("lock");
                assembler.offer_head(packet.id, data.to_vec(), now)
            };
            if let Some(bytes) = assembled {
                if let Ok(whole) = Packet::parse(&bytes) {
                    self.handle_complete(now, local, remote, whole, out);
                }
            }
            return;
        }

        self.handle_complete(now, local, remote, packet, out);
    }

    /// Authenticate a fully reassembled packet and dispatch its verb.
    fn handle_complete(
        &self,
        now: u64,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        mut packet: Packet,
        out: &mut Outputs,
    ) {
        // HELLO travels unencrypted: the identity needed to authenticate it
        // is inside the payload itself.
        if packet.cipher == CipherSuite::Poly1305None && packet.verb() == Some(Verb::Hello) {
            self.handle_hello(now, local, remote, packet, out);
            return;
        }

        let source = packet.source;
        let key = {
            let peers = self.peers().read().expect("lock");
            peers.get(source).map(|p| *p.key())
        };
        let Some(key) = key else {
            // Can't authenticate a stranger; find out who they are and let
            // them retransmit.
            let should_ask = self.whois_queue().lock().expect("lock").request(source, now);
            if should_ask {
                self.send_whois(now, source, out);
            }
            self.counters.auth_failures.fetch_add(1, Ordering::Relaxed);
            return;
        };

        if packet.dearmor(&key).is_err() {
            self.counters.auth_failures.fetch_add(1, Ordering::Relaxed);
            return;
        }

        {
            let mut peers = self.peers().write().expect("lock");
            if let Some(peer) = peers.get_mut(source) {
                peer.received(now, local, remote);
                peer.elect_preferred(now);
            }
        }
        self.update_online_state(now, out);

        let Some(verb) = packet.verb() else {
            self.counters.unknown_verbs.fetch_add(1, Ordering::Relaxed);
            return;
        };
        trace!(%source, %verb, "packet");

        match verb {
            Verb::Nop | Verb::Hello => {}
            Verb::Ok => self.handle_ok(now, remote, source, &packet, out),
            Verb::Error => self.handle_error(now, source, &packet, out),
            Verb::Whois => self.handle_whois_request(now, local, remote, source, &packet, &key, out),
            Verb::Rendezvous => self.handle_rendezvous(now, source, &packet, out),
            Verb::Echo => self.handle_echo(local, remote, source, &packet, &key, out),
            Verb::PushDirectPaths => self.handle_push_direct_paths(now, source, &packet, out),
            Verb::Frame => self.handle_frame(now, source, &packet, out),
            Verb::ExtFrame => self.handle_ext_frame(now, source, &packet, out),
            Verb::MulticastLike => self.handle_multicast_like(now, source, &packet, out),
            Verb::MulticastGather => {
                self.handle_multicast_gather(now, local, remote, source, &packet, &key, out);
            }
            Verb::MulticastFrame => self.handle_multicast_frame(now, source, &packet, out),
            Verb::NetworkConfigRequest => {
                // We are not a config master; say so rather than time out.
                let body = proto::ErrorBody::encode(
                    Verb::NetworkConfigRequest,
                    packet.id,
                    ProtocolError::UnsupportedOperation as u8,
                    &[],
                );
                let reply =
                    Packet::new_outbound(source, self.address(), Verb::Error, &body);
                self.transmit(reply, &key, local, remote, out);
            }
            Verb::NetworkConfigRefresh => self.handle_config_refresh(now, source, &packet, out),
            Verb::CircuitTest => self.handle_circuit_test(now, source, &packet, out),
            Verb::CircuitTestReport => {
                if let Ok(report) = proto::CircuitTestReport::parse(packet.body()) {
                    out.events.push(Event::Trace(format!(
                        "circuit test {:016x} hop report from {source}: {} hops remaining",
                        report.test_id, report.remaining_hops
                    )));
                }
            }
        }
    }

    // ------------------------------------------------------------- HELLO --

    fn handle_hello(
        &self,
        now: u64,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        packet: Packet,
        out: &mut Outputs,
    ) {
        // Host geolocation is read up front so no callback runs under a lock.
        let cluster_enabled = self.cluster_state().lock().expect("lock").is_some();
        let peer_coords = if cluster_enabled {
            self.host().geolocate(remote)
        } else {
            None
        };

        let hello = match proto::Hello::parse(packet.body()) {
            Ok(hello) => hello,
            Err(_) => {
                self.counters.parse_failures.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if hello.identity.address() != packet.source {
            self.counters.parse_failures.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if hello.identity.address() == self.address() {
            if hello.identity.public_key_bytes() != self.identity().public_key_bytes() {
                warn!("another identity claims our address");
                self.mark_collision();
                out.events.push(Event::FatalIdentityCollision);
            }
            return;
        }
        // The proof of work binds the address to the key material; without
        // this check anyone could claim any address.
        if !hello.identity.locally_validate() {
            self.counters.auth_failures.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let source = packet.source;
        let role = {
            let topo = self.topology().read().expect("lock");
            if topo.is_root(source) {
                PeerRole::Root
            } else {
                PeerRole::Leaf
            }
        };

        let key = {
            let mut peers = self.peers().write().expect("lock");
            match peers.get_or_create(self.identity(), &hello.identity, role) {
                Ok(peer) => *peer.key(),
                Err(_) => {
                    // Two remote identities deriving one address.
                    debug!(%source, "remote address collision, dropping");
                    self.counters.auth_failures.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
        };

        {
            let mut check = packet.clone();
            if check.dearmor(&key).is_err() {
                self.counters.auth_failures.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        {
            let mut peers = self.peers().write().expect("lock");
            if let Some(peer) = peers.get_mut(source) {
                peer.received(now, local, remote);
                peer.remote_version = Some(RemoteVersion {
                    major: hello.major,
                    minor: hello.minor,
                    revision: hello.revision,
                });
                peer.elect_preferred(now);
            }
        }
        self.update_online_state(now, out);

        // Answer with their echoed timestamp, and our world if newer.
        let world = {
            let topo = self.topology().read().expect("lock");
            (topo.world_id() == hello.world_id && topo.world_timestamp() > hello.world_timestamp)
                .then(|| topo.world().serialize())
        };
        let ok_hello = proto::OkHello {
            timestamp_echo: hello.timestamp,
            protocol_version: crate::PROTOCOL_VERSION,
            major: crate::VERSION_MAJOR,
            minor: crate::VERSION_MINOR,
            revision: crate::VERSION_REVISION,
            world,
        };
        let body = proto::OkEnvelope::encode(Verb::Hello, packet.id, &ok_hello.encode());
        let reply = Packet::new_outbound(source, self.address(), Verb::Ok, &body);
        self.transmit(reply, &key, local, remote, out);

        // An authenticated HELLO also answers any WHOIS we had in flight.
        let parked = self.whois_queue().lock().expect("lock").resolved(source);
        for waiting in parked {
            self.send_packet(now, waiting, out);
        }

        if cluster_enabled {
            self.cluster_peer_seen(now, source, peer_coords, &key, local, remote, out);
        }
    }

    /// Cluster bookkeeping for an inbound peer: claim it to siblings, and
    /// redirect it when a sibling is geographically closer.
    fn cluster_peer_seen(
        &self,
        now: u64,
        source: Address,
        peer_coords: Option<vether_transport::cluster::GeoCoords>,
        key: &[u8; 32],
        local: Option<SocketAddr>,
        remote: SocketAddr,
        out: &mut Outputs,
    ) {
        let mut redirect: Option<Vec<SocketAddr>> = None;
        {
            let mut guard = self.cluster_state().lock().expect("lock");
            let Some(cluster) = guard.as_mut() else {
                return;
            };
            let sighting = cluster.make_peer_sighting(source);
            if let Ok(encoded) = cluster.encode_message(&sighting) {
                for member in cluster.member_ids() {
                    out.cluster_sends.push((member, encoded.clone()));
                }
            }
            if let Some(coords) = peer_coords {
                if let Some((member, info)) = cluster.closer_member(coords, now) {
                    debug!(%source, member, "redirecting peer to closer sibling");
                    redirect = Some(info.endpoints.clone());
                }
            }
        }

        if let Some(endpoints) = redirect {
            {
                let mut peers = self.peers().write().expect("lock");
                if let Some(peer) = peers.get_mut(source) {
                    peer.cluster_redirect = endpoints.first().copied();
                    // Demote ourselves: the sibling should win the next
                    // path election on the peer's side.
                    peer.elect_preferred(now);
                }
            }
            let body = proto::encode_push_direct_paths(&endpoints);
            let push =
                Packet::new_outbound(source, self.address(), Verb::PushDirectPaths, &body);
            self.transmit(push, key, local, remote, out);
        }
    }

    // ---------------------------------------------------------- OK/ERROR --

    fn handle_ok(
        &self,
        now: u64,
        remote: SocketAddr,
        source: Address,
        packet: &Packet,
        out: &mut Outputs,
    ) {
        let env = match proto::OkEnvelope::parse(packet.body()) {
            Ok(env) => env,
            Err(_) => {
                self.counters.parse_failures.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        match env.in_re {
            Verb::Hello => {
                let Ok(ok_hello) = proto::OkHello::parse(&env.payload) else {
                    self.counters.parse_failures.fetch_add(1, Ordering::Relaxed);
                    return;
                };
                let rtt = now.saturating_sub(ok_hello.timestamp_echo).min(u64::from(u32::MAX));
                {
                    let mut peers = self.peers().write().expect("lock");
                    if let Some(peer) = peers.get_mut(source) {
                        peer.record_latency(now, remote, rtt as u32);
                        peer.remote_version = Some(RemoteVersion {
                            major: ok_hello.major,
                            minor: ok_hello.minor,
                            revision: ok_hello.revision,
                        });
                    }
                }
                if let Some(world_bytes) = ok_hello.world {
                    if let Ok(world) = World::parse(&world_bytes) {
                        let upgraded = {
                            let mut topo = self.topology().write().expect("lock");
                            topo.consider_upgrade(world)
                        };
                        if upgraded {
                            out.store_puts
                                .push((storage::WORLD.to_string(), world_bytes, false));
                        }
                    }
                }
                self.update_online_state(now, out);
            }
            Verb::Whois => self.handle_ok_whois(now, &env.payload, out),
            Verb::NetworkConfigRequest => {
                let Ok(ok_config) = proto::OkNetworkConfig::parse(&env.payload) else {
                    self.counters.parse_failures.fetch_add(1, Ordering::Relaxed);
                    return;
                };
                self.apply_network_config(source, &ok_config, out);
            }
            Verb::MulticastGather => {
                let Ok(gathered) = proto::OkMulticastGather::parse(&env.payload) else {
                    self.counters.parse_failures.fetch_add(1, Ordering::Relaxed);
                    return;
                };
                self.absorb_gather_results(now, &gathered, out);
            }
            Verb::Echo => {}
            _ => {}
        }
    }

    fn handle_ok_whois(&self, now: u64, payload: &[u8], out: &mut Outputs) {
        let Ok((identity, _)) = vether_core::identity::Identity::from_wire(payload) else {
            self.counters.parse_failures.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if !identity.locally_validate() {
            self.counters.auth_failures.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let address = identity.address();
        let role = {
            let topo = self.topology().read().expect("lock");
            if topo.is_root(address) {
                PeerRole::Root
            } else {
                PeerRole::Leaf
            }
        };
        {
            let mut peers = self.peers().write().expect("lock");
            if peers
                .get_or_create(self.identity(), &identity, role)
                .is_err()
            {
                return;
            }
        }
        let parked = self.whois_queue().lock().expect("lock").resolved(address);
        debug!(%address, parked = parked.len(), "identity resolved");
        for waiting in parked {
            self.send_packet(now, waiting, out);
        }
    }

    fn apply_network_config(
        &self,
        source: Address,
        ok_config: &proto::OkNetworkConfig,
        out: &mut Outputs,
    ) {
        let nwid = ok_config.nwid;
        if source != nwid.controller() {
            return;
        }
        let Some(controller) = ({
            let peers = self.peers().read().expect("lock");
            peers.get(source).map(|p| p.identity().clone())
        }) else {
            return;
        };

        let mut networks = self.networks().write().expect("lock");
        let Some(network) = networks.get_mut(&nwid) else {
            return;
        };
        match NetworkConfig::from_signed_blob(&ok_config.blob, &controller, nwid, self.address()) {
            Ok(config) => match network.apply_config(config.clone()) {
                Ok(()) => {
                    out.store_puts.push((
                        storage::network_config_name(nwid),
                        ok_config.blob.clone(),
                        false,
                    ));
                    out.port_ops.push((
                        nwid,
                        PortOp::ConfigUpdate,
                        network.status(),
                        Some(config),
                    ));
                }
                Err(err) => warn!(%nwid, %err, "config rejected"),
            },
            Err(err) => {
                warn!(%nwid, %err, "config failed validation");
                self.counters.parse_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn handle_error(&self, now: u64, source: Address, packet: &Packet, out: &mut Outputs) {
        let Ok(body) = proto::ErrorBody::parse(packet.body()) else {
            self.counters.parse_failures.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let Some(code) = ProtocolError::from_u8(body.code) else {
            return;
        };

        let network_in_re = body.in_re == Verb::NetworkConfigRequest as u8;
        let nwid_in_data = (body.data.len() >= 8)
            .then(|| NetworkId::from_u64(u64::from_be_bytes(body.data[..8].try_into().expect("8"))));

        match code {
            ProtocolError::IdentityCollision => {
                // Only an upstream we trust may declare our identity dead.
                let from_root = self.topology().read().expect("lock").is_root(source);
                if from_root {
                    warn!("upstream reports identity collision");
                    self.mark_collision();
                    out.events.push(Event::FatalIdentityCollision);
                }
            }
            ProtocolError::ObjNotFound if network_in_re => {
                self.set_network_error_status(source, nwid_in_data, NetworkStatus::NotFound, out);
            }
            ProtocolError::NetworkAccessDenied if network_in_re => {
                self.set_network_error_status(
                    source,
                    nwid_in_data,
                    NetworkStatus::AccessDenied,
                    out,
                );
            }
            ProtocolError::BadProtocolVersion if network_in_re => {
                self.set_network_error_status(
                    source,
                    nwid_in_data,
                    NetworkStatus::ClientTooOld,
                    out,
                );
            }
            ProtocolError::NeedMembershipCertificate => {
                if let Some(nwid) = nwid_in_data {
                    self.push_membership_certificate(now, source, nwid, out);
                }
            }
            _ => {}
        }
    }

    fn set_network_error_status(
        &self,
        source: Address,
        nwid: Option<NetworkId>,
        status: NetworkStatus,
        out: &mut Outputs,
    ) {
        let Some(nwid) = nwid else {
            return;
        };
        if source != nwid.controller() {
            return;
        }
        let mut networks = self.networks().write().expect("lock");
        if let Some(network) = networks.get_mut(&nwid) {
            debug!(%nwid, ?status, "controller refused configuration");
            network.set_error_status(status);
            out.port_ops.push((
                nwid,
                PortOp::ConfigUpdate,
                network.status(),
                network.config().cloned(),
            ));
        }
    }

    /// Send our membership certificate to a peer that demanded it.
    fn push_membership_certificate(
        &self,
        now: u64,
        dest: Address,
        nwid: NetworkId,
        out: &mut Outputs,
    ) {
        let com = {
            let networks = self.networks().read().expect("lock");
            networks.get(&nwid).and_then(|n| n.our_com().cloned())
        };
        if com.is_none() {
            return;
        }
        let like = proto::MulticastLike {
            com,
            entries: Vec::new(),
        };
        let packet =
            Packet::new_outbound(dest, self.address(), Verb::MulticastLike, &like.encode());
        self.send_packet(now, packet, out);
    }

    // ------------------------------------------------------- VL1 control --

    fn handle_whois_request(
        &self,
        _now: u64,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        source: Address,
        packet: &Packet,
        key: &[u8; 32],
        out: &mut Outputs,
    ) {
        let Ok(wanted) = proto::parse_whois(packet.body()) else {
            self.counters.parse_failures.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let identity = {
            let peers = self.peers().read().expect("lock");
            peers.get(wanted).map(|p| p.identity().clone())
        }
        .or_else(|| {
            let topo = self.topology().read().expect("lock");
            topo.root_identity(wanted).cloned()
        })
        .or_else(|| (wanted == self.address()).then(|| self.identity().public_only()));

        let reply = match identity {
            Some(identity) => {
                let body = proto::OkEnvelope::encode(Verb::Whois, packet.id, &identity.to_wire());
                Packet::new_outbound(source, self.address(), Verb::Ok, &body)
            }
            None => {
                let body = proto::ErrorBody::encode(
                    Verb::Whois,
                    packet.id,
                    ProtocolError::ObjNotFound as u8,
                    &wanted.to_bytes(),
                );
                Packet::new_outbound(source, self.address(), Verb::Error, &body)
            }
        };
        self.transmit(reply, key, local, remote, out);
    }

    fn handle_rendezvous(&self, now: u64, source: Address, packet: &Packet, out: &mut Outputs) {
        // Only a root may steer us at an endpoint; anyone else could use
        // this as a traffic amplifier.
        let from_root = self.topology().read().expect("lock").is_root(source);
        if !from_root {
            return;
        }
        let Ok(rendezvous) = proto::Rendezvous::parse(packet.body()) else {
            self.counters.parse_failures.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let known = {
            let mut peers = self.peers().write().expect("lock");
            match peers.get_mut(rendezvous.peer) {
                Some(peer) => {
                    peer.hint_path(None, rendezvous.endpoint);
                    true
                }
                None => false,
            }
        };
        if known {
            debug!(peer = %rendezvous.peer, endpoint = %rendezvous.endpoint, "rendezvous punch");
            // The punch: fire HELLOs at the hinted endpoint right away.
            self.send_hello_to(now, rendezvous.peer, rendezvous.endpoint, out);
        }
    }

    fn handle_echo(
        &self,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        source: Address,
        packet: &Packet,
        key: &[u8; 32],
        out: &mut Outputs,
    ) {
        let body = proto::OkEnvelope::encode(Verb::Echo, packet.id, packet.body());
        let reply = Packet::new_outbound(source, self.address(), Verb::Ok, &body);
        self.transmit(reply, key, local, remote, out);
    }

    fn handle_push_direct_paths(
        &self,
        now: u64,
        source: Address,
        packet: &Packet,
        out: &mut Outputs,
    ) {
        let Ok(endpoints) = proto::parse_push_direct_paths(packet.body()) else {
            self.counters.parse_failures.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let probes = {
            let mut peers = self.peers().write().expect("lock");
            let Some(peer) = peers.get_mut(source) else {
                return;
            };
            for endpoint in &endpoints {
                peer.hint_path(None, *endpoint);
            }
            if peer.has_alive_path(now) {
                Vec::new()
            } else {
                endpoints
                    .into_iter()
                    .take(vether_transport::constants::MAX_PEER_NETWORK_PATHS)
                    .collect::<Vec<_>>()
            }
        };
        for endpoint in probes {
            self.send_hello_to(now, source, endpoint, out);
        }
    }

    // --------------------------------------------------------- VL2 verbs --

    /// Verify an inline membership certificate and cache it on the network.
    fn absorb_com(
        &self,
        now: u64,
        source: Address,
        nwid: NetworkId,
        com: Option<CertificateOfMembership>,
        out: &mut Outputs,
    ) {
        let Some(com) = com else {
            return;
        };
        if com.network_id() != Some(nwid) || com.issued_to() != Some(source) {
            return;
        }
        let controller_address = nwid.controller();
        let controller = {
            let peers = self.peers().read().expect("lock");
            peers
                .get(controller_address)
                .map(|p| p.identity().clone())
        }
        .or_else(|| {
            let topo = self.topology().read().expect("lock");
            topo.root_identity(controller_address).cloned()
        });

        let Some(controller) = controller else {
            // Can't check the signature without the controller's key.
            let should_ask = self
                .whois_queue()
                .lock()
                .expect("lock")
                .request(controller_address, now);
            if should_ask {
                self.send_whois(now, controller_address, out);
            }
            return;
        };

        if com.verify(&controller).is_ok() {
            let mut networks = self.networks().write().expect("lock");
            if let Some(network) = networks.get_mut(&nwid) {
                network.cache_peer_com(source, com);
            }
        }
    }

    fn handle_frame(&self, now: u64, source: Address, packet: &Packet, out: &mut Outputs) {
        let Ok(frame) = proto::FrameBody::parse(packet.body()) else {
            self.counters.parse_failures.fetch_add(1, Ordering::Relaxed);
            return;
        };
        self.absorb_com(now, source, frame.nwid, frame.com.clone(), out);

        let src_mac = Mac::for_node(frame.nwid, source);
        let mut networks = self.networks().write().expect("lock");
        let Some(network) = networks.get_mut(&frame.nwid) else {
            return;
        };
        if !network.gate_incoming_frame(source, src_mac, now) {
            self.counters.dropped_frames.fetch_add(1, Ordering::Relaxed);
            return;
        }
        out.frames.push((
            frame.nwid,
            src_mac,
            network.mac(),
            frame.ethertype,
            0,
            frame.payload,
        ));
    }

    fn handle_ext_frame(&self, now: u64, source: Address, packet: &Packet, out: &mut Outputs) {
        let Ok(frame) = proto::ExtFrameBody::parse(packet.body()) else {
            self.counters.parse_failures.fetch_add(1, Ordering::Relaxed);
            return;
        };
        self.absorb_com(now, source, frame.nwid, frame.com.clone(), out);

        let mut networks = self.networks().write().expect("lock");
        let Some(network) = networks.get_mut(&frame.nwid) else {
            return;
        };
        if !network.gate_incoming_frame(source, frame.from_mac, now) {
            self.counters.dropped_frames.fetch_add(1, Ordering::Relaxed);
            return;
        }
        // Accept frames addressed to us, to a group, or bridged through us
        // when the controller made us a bridge.
        let for_us = frame.to_mac == network.mac()
            || frame.to_mac.is_multicast()
            || network
                .config()
                .is_some_and(|c| c.is_active_bridge(self.address()));
        if !for_us {
            self.counters.dropped_frames.fetch_add(1, Ordering::Relaxed);
            return;
        }
        out.frames.push((
            frame.nwid,
            frame.from_mac,
            frame.to_mac,
            frame.ethertype,
            0,
            frame.payload,
        ));
    }

    fn handle_multicast_like(&self, now: u64, source: Address, packet: &Packet, out: &mut Outputs) {
        let Ok(like) = proto::MulticastLike::parse(packet.body()) else {
            self.counters.parse_failures.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if let Some(com) = &like.com {
            if let Some(nwid) = com.network_id() {
                self.absorb_com(now, source, nwid, Some(com.clone()), out);
            }
        }
        let mut multicaster = self.multicaster().write().expect("lock");
        for (nwid, group) in like.entries {
            multicaster.add_like(nwid, group, source, now);
        }
    }

    fn handle_multicast_gather(
        &self,
        now: u64,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        source: Address,
        packet: &Packet,
        key: &[u8; 32],
        out: &mut Outputs,
    ) {
        let Ok(gather) = proto::MulticastGather::parse(packet.body()) else {
            self.counters.parse_failures.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let (_, reply_cap) = self.gather_limits();
        let limit = (gather.limit as usize).min(reply_cap);

        let (members, total) = {
            let multicaster = self.multicaster().read().expect("lock");
            (
                multicaster.likers(gather.nwid, gather.group, limit, source, now),
                multicaster.known_count(gather.nwid, gather.group, source, now) as u32,
            )
        };

        let ok = proto::OkMulticastGather {
            nwid: gather.nwid,
            group: gather.group,
            total,
            members,
        };
        let body = proto::OkEnvelope::encode(Verb::MulticastGather, packet.id, &ok.encode());
        let reply = Packet::new_outbound(source, self.address(), Verb::Ok, &body);
        self.transmit(reply, key, local, remote, out);
    }

    /// Gather results arrived: remember the likers and release any frames
    /// that were waiting on them.
    fn absorb_gather_results(
        &self,
        now: u64,
        gathered: &proto::OkMulticastGather,
        out: &mut Outputs,
    ) {
        {
            let mut multicaster = self.multicaster().write().expect("lock");
            for member in &gathered.members {
                if *member != self.address() {
                    multicaster.add_like(gathered.nwid, gathered.group, *member, now);
                }
            }
        }

        let com = {
            let networks = self.networks().read().expect("lock");
            networks
                .get(&gathered.nwid)
                .and_then(|n| n.our_com().cloned())
        };

        let mut sends: Vec<(Address, proto::MulticastFrameBody)> = Vec::new();
        {
            let mut pending = self.pending_multicast().lock().expect("lock");
            for entry in pending.iter_mut() {
                if entry.nwid != gathered.nwid || entry.group != gathered.group {
                    continue;
                }
                for member in &gathered.members {
                    if entry.sent_to.len() >= entry.limit {
                        break;
                    }
                    if *member == self.address() || !entry.sent_to.insert(*member) {
                        continue;
                    }
                    sends.push((
                        *member,
                        proto::MulticastFrameBody {
                            nwid: entry.nwid,
                            com: com.clone(),
                            group: entry.group,
                            from_mac: entry.from_mac,
                            ethertype: entry.ethertype,
                            payload: entry.payload.clone(),
                        },
                    ));
                }
            }
            pending.retain(|e| e.sent_to.len() < e.limit && e.deadline > now);
        }

        for (dest, body) in sends {
            let packet =
                Packet::new_outbound(dest, self.address(), Verb::MulticastFrame, &body.encode());
            self.send_packet(now, packet, out);
        }
    }

    fn handle_multicast_frame(
        &self,
        now: u64,
        source: Address,
        packet: &Packet,
        out: &mut Outputs,
    ) {
        let Ok(frame) = proto::MulticastFrameBody::parse(packet.body()) else {
            self.counters.parse_failures.fetch_add(1, Ordering::Relaxed);
            return;
        };
        self.absorb_com(now, source, frame.nwid, frame.com.clone(), out);

        let mut networks = self.networks().write().expect("lock");
        let Some(network) = networks.get_mut(&frame.nwid) else {
            return;
        };
        if !network.gate_incoming_frame(source, frame.from_mac, now) {
            self.counters.dropped_frames.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let wanted = if frame.group.mac.is_broadcast() {
            network.config().is_some_and(|c| c.broadcast_enabled)
        } else {
            network.is_subscribed(frame.group)
        };
        if !wanted {
            self.counters.dropped_frames.fetch_add(1, Ordering::Relaxed);
            return;
        }
        out.frames.push((
            frame.nwid,
            frame.from_mac,
            frame.group.mac,
            frame.ethertype,
            0,
            frame.payload,
        ));
    }

    fn handle_config_refresh(&self, now: u64, source: Address, packet: &Packet, out: &mut Outputs) {
        let Ok(nwid) = proto::parse_network_config_refresh(packet.body()) else {
            self.counters.parse_failures.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if source != nwid.controller() {
            return;
        }
        {
            let mut networks = self.networks().write().expect("lock");
            let Some(network) = networks.get_mut(&nwid) else {
                return;
            };
            network.mark_config_dirty();
        }
        self.send_config_request(now, nwid, out);
    }

    // ------------------------------------------------------ circuit test --

    fn handle_circuit_test(&self, now: u64, _source: Address, packet: &Packet, out: &mut Outputs) {
        let Ok(mut test) = proto::CircuitTest::parse(packet.body()) else {
            self.counters.parse_failures.fetch_add(1, Ordering::Relaxed);
            return;
        };

        // Report to the originator first.
        let report = proto::CircuitTestReport {
            test_id: test.test_id,
            timestamp: test.timestamp,
            remaining_hops: test.hops.len() as u16,
        };
        if test.originator != self.address() {
            let reply = Packet::new_outbound(
                test.originator,
                self.address(),
                Verb::CircuitTestReport,
                &report.encode(),
            );
            self.send_packet(now, reply, out);
        }

        // Then forward down the FIFO.
        let Some(next_hop) = test.hops.pop_front() else {
            return;
        };
        let body = test.encode();
        for next in next_hop {
            if next == self.address() || next == test.originator {
                continue;
            }
            let forward =
                Packet::new_outbound(next, self.address(), Verb::CircuitTest, &body);
            self.send_packet(now, forward, out);
        }
    }

    // ------------------------------------------------------------- relay --

    /// Forward a packet not addressed to us: bump hops, never re-encrypt,
    /// and introduce the two sides when both are directly connected.
    fn relay_packet(&self, now: u64, remote: SocketAddr, mut packet: Packet, out: &mut Outputs) {
        if !packet.increment_hops() {
            return;
        }
        let source = packet.source;
        let dest = packet.dest;

        let target = {
            let peers = self.peers().read().expect("lock");
            peers.get(dest).and_then(|p| p.direct_send_endpoint(now))
        };
        let Some((tlocal, tremote)) = target else {
            self.counters.dropped_frames.fetch_add(1, Ordering::Relaxed);
            return;
        };
        out.wire.push((tlocal, tremote, packet.serialize()));
        trace!(%source, %dest, "relayed");

        // NAT traversal: both ends talk to us directly, so hand each the
        // other's observed endpoint.
        let introduction = {
            let mut peers = self.peers().write().expect("lock");
            let src_alive = peers.get(source).is_some_and(|p| p.has_alive_path(now));
            let src_due = peers.get(source).is_some_and(|p| {
                p.last_introduction == 0
                    || now.saturating_sub(p.last_introduction) >= self.introduction_interval()
            });
            if src_alive && src_due {
                let src_key = peers.get(source).map(|p| *p.key());
                let dst_key = peers.get(dest).map(|p| *p.key());
                if let (Some(src_key), Some(dst_key)) = (src_key, dst_key) {
                    if let Some(peer) = peers.get_mut(source) {
                        peer.last_introduction = now;
                    }
                    if let Some(peer) = peers.get_mut(dest) {
                        peer.last_introduction = now;
                    }
                    Some((src_key, dst_key))
                } else {
                    None
                }
            } else {
                None
            }
        };

        if let Some((src_key, dst_key)) = introduction {
            debug!(%source, %dest, "introducing for rendezvous");
            let to_source = proto::Rendezvous {
                peer: dest,
                endpoint: tremote,
            };
            let reply = Packet::new_outbound(
                source,
                self.address(),
                Verb::Rendezvous,
                &to_source.encode(),
            );
            self.transmit(reply, &src_key, None, remote, out);

            let to_dest = proto::Rendezvous {
                peer: source,
                endpoint: remote,
            };
            let forward = Packet::new_outbound(
                dest,
                self.address(),
                Verb::Rendezvous,
                &to_dest.encode(),
            );
            self.transmit(forward, &dst_key, tlocal, tremote, out);
        }
    }

    // ---------------------------------------------------------- VL2 send --

    /// Egress entry: route one Ethernet frame from the host tap.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn handle_virtual_frame(
        &self,
        now: u64,
        nwid: NetworkId,
        src_mac: Mac,
        dst_mac: Mac,
        ethertype: u16,
        vlan_id: u16,
        data: &[u8],
        out: &mut Outputs,
    ) -> crate::result::ResultCode {
        use crate::result::ResultCode;

        if vlan_id != 0 {
            // VLAN tagging is not part of the current wire contract.
            return ResultCode::UnsupportedOperation;
        }

        enum Route {
            Unicast {
                dest: Address,
                com: Option<CertificateOfMembership>,
                bridged: bool,
                our_mac: Mac,
            },
            Multicast {
                com: Option<CertificateOfMembership>,
                limit: usize,
            },
            Drop,
            NoSuchNetwork,
        }

        let route = {
            let networks = self.networks().read().expect("lock");
            match networks.get(&nwid) {
                None => Route::NoSuchNetwork,
                Some(network) => {
                    if !network.gate_outgoing_frame(dst_mac, data.len()) {
                        Route::Drop
                    } else if src_mac != network.mac()
                        && !network
                            .config()
                            .is_some_and(|c| c.is_active_bridge(self.address()))
                    {
                        // We may only source foreign MACs if the controller
                        // made us a bridge.
                        Route::Drop
                    } else if dst_mac.is_multicast() {
                        Route::Multicast {
                            com: network.our_com().cloned(),
                            limit: network.config().map_or(32, |c| c.multicast_limit),
                        }
                    } else {
                        match network.egress_target(dst_mac, now) {
                            Some(dest) => Route::Unicast {
                                dest,
                                com: network.our_com().cloned(),
                                bridged: src_mac != network.mac()
                                    || !dst_mac.is_derived_for(nwid, dest),
                                our_mac: network.mac(),
                            },
                            None => Route::Drop,
                        }
                    }
                }
            }
        };

        match route {
            Route::NoSuchNetwork => ResultCode::NetworkNotFound,
            Route::Drop => {
                self.counters.dropped_frames.fetch_add(1, Ordering::Relaxed);
                ResultCode::Ok
            }
            Route::Unicast {
                dest,
                com,
                bridged,
                our_mac,
            } => {
                let body = if bridged {
                    proto::ExtFrameBody {
                        nwid,
                        com,
                        to_mac: dst_mac,
                        from_mac: src_mac,
                        ethertype,
                        payload: data.to_vec(),
                    }
                    .encode()
                } else {
                    debug_assert_eq!(src_mac, our_mac);
                    proto::FrameBody {
                        nwid,
                        com,
                        ethertype,
                        payload: data.to_vec(),
                    }
                    .encode()
                };
                let verb = if bridged { Verb::ExtFrame } else { Verb::Frame };
                let packet = Packet::new_outbound(dest, self.address(), verb, &body);
                self.send_packet(now, packet, out);
                ResultCode::Ok
            }
            Route::Multicast { com, limit } => {
                self.send_multicast_frame(
                    now, nwid, src_mac, dst_mac, ethertype, data, com, limit, out,
                );
                ResultCode::Ok
            }
        }
    }

    /// Send a multicast frame to known likers; gather more when short.
    #[allow(clippy::too_many_arguments)]
    fn send_multicast_frame(
        &self,
        now: u64,
        nwid: NetworkId,
        src_mac: Mac,
        dst_mac: Mac,
        ethertype: u16,
        data: &[u8],
        com: Option<CertificateOfMembership>,
        limit: usize,
        out: &mut Outputs,
    ) {
        // ARP-style sharding is the sender's concern at a higher layer;
        // at this level the group is simply (dst MAC, 0).
        let group = vether_network::MulticastGroup::new(dst_mac, 0);

        let (recipients, known, gather_due) = {
            let mut multicaster = self.multicaster().write().expect("lock");
            let recipients = multicaster.likers(nwid, group, limit, self.address(), now);
            let known = recipients.len();
            let gather_due = known < limit && multicaster.should_gather(nwid, group, now);
            (recipients, known, gather_due)
        };

        let mut sent_to = std::collections::HashSet::new();
        for dest in &recipients {
            sent_to.insert(*dest);
            let body = proto::MulticastFrameBody {
                nwid,
                com: com.clone(),
                group,
                from_mac: src_mac,
                ethertype,
                payload: data.to_vec(),
            };
            let packet =
                Packet::new_outbound(*dest, self.address(), Verb::MulticastFrame, &body.encode());
            self.send_packet(now, packet, out);
        }

        if known < limit {
            // Park the frame so late gather results can still deliver it.
            {
                let mut pending = self.pending_multicast().lock().expect("lock");
                pending.push(PendingMulticast {
                    nwid,
                    group,
                    from_mac: src_mac,
                    ethertype,
                    payload: data.to_vec(),
                    limit,
                    sent_to,
                    deadline: now + self.pending_multicast_ttl(),
                });
            }
            if gather_due {
                let (request_limit, _) = self.gather_limits();
                let gather = proto::MulticastGather {
                    nwid,
                    group,
                    limit: request_limit,
                };
                // The controller is the authority on membership; fall back
                // to the best root when it is unreachable.
                let target = nwid.controller();
                let packet = Packet::new_outbound(
                    target,
                    self.address(),
                    Verb::MulticastGather,
                    &gather.encode(),
                );
                self.send_packet(now, packet, out);
            }
        }
    }
}
