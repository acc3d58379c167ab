//! Multicast group membership and propagation planning.
//!
//! For every `(network, group)` we keep a recency-ordered set of members
//! that announced interest (MULTICAST_LIKE). Sending a multicast frame
//! unicasts a MULTICAST_FRAME to up to `multicast_limit` of the most
//! recently seen likers; when we know fewer than the limit we also probe
//! with MULTICAST_GATHER. ARP stays scalable because the group for an ARP
//! query carries the target IPv4 as ADI, turning broadcast into a narrow
//! subscription.

use std::collections::HashMap;

use tracing::trace;
use vether_core::{Address, Mac, NetworkId};

use crate::constants::{
    MULTICAST_GATHER_INTERVAL, MULTICAST_GROUPS_MAX, MULTICAST_LIKE_TTL, MULTICAST_LIKERS_MAX,
};
use crate::error::NetworkError;

/// A multicast group: a MAC plus additional distinguishing information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MulticastGroup {
    pub mac: Mac,
    pub adi: u32,
}

impl MulticastGroup {
    pub const WIRE_LENGTH: usize = 10;

    pub const fn new(mac: Mac, adi: u32) -> Self {
        Self { mac, adi }
    }

    /// The broadcast group on a network.
    pub const fn broadcast() -> Self {
        Self {
            mac: Mac::broadcast(),
            adi: 0,
        }
    }

    #[must_use]
    pub fn to_wire(self) -> [u8; Self::WIRE_LENGTH] {
        let mut out = [0u8; Self::WIRE_LENGTH];
        out[..6].copy_from_slice(&self.mac.to_bytes());
        out[6..].copy_from_slice(&self.adi.to_be_bytes());
        out
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Self, NetworkError> {
        if bytes.len() < Self::WIRE_LENGTH {
            return Err(NetworkError::Wire(vether_core::WireError::TooShort {
                min: Self::WIRE_LENGTH,
                actual: bytes.len(),
            }));
        }
        Ok(Self {
            mac: Mac::from_bytes(bytes[..6].try_into().expect("6 bytes")),
            adi: u32::from_be_bytes(bytes[6..10].try_into().expect("4 bytes")),
        })
    }
}

impl std::fmt::Display for MulticastGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{:08x}", self.mac, self.adi)
    }
}

struct GroupState {
    /// Likers ordered oldest-first; refreshed entries move to the back.
    likers: Vec<(Address, u64)>,
    last_gather: u64,
}

impl GroupState {
    fn new() -> Self {
        Self {
            likers: Vec::new(),
            last_gather: 0,
        }
    }
}

/// Liker tracking across all joined networks.
#[derive(Default)]
pub struct Multicaster {
    groups: HashMap<(NetworkId, MulticastGroup), GroupState>,
}

impl Multicaster {
    pub fn new() -> Self {
        Self {
            groups: HashMap::new(),
        }
    }

    /// Record that `member` likes `group` on `nwid`.
    pub fn add_like(&mut self, nwid: NetworkId, group: MulticastGroup, member: Address, now: u64) {
        if !self.groups.contains_key(&(nwid, group)) && self.groups.len() >= MULTICAST_GROUPS_MAX {
            // Evict the group whose freshest like is the stalest.
            if let Some(victim) = self
                .groups
                .iter()
                .min_by_key(|(_, s)| {
                    s.likers
                        .last()
                        .map(|(_, ts)| *ts)
                        .unwrap_or(s.last_gather)
                })
                .map(|(k, _)| *k)
            {
                self.groups.remove(&victim);
            }
        }
        let state = self
            .groups
            .entry((nwid, group))
            .or_insert_with(GroupState::new);
        state.likers.retain(|(a, _)| *a != member);
        if state.likers.len() >= MULTICAST_LIKERS_MAX {
            state.likers.remove(0);
        }
        state.likers.push((member, now));
        trace!(%nwid, %group, member = %member, "multicast like");
    }

    /// Up to `limit` fresh likers, most recently seen first, excluding
    /// `exclude` (the sender itself).
    #[must_use]
    pub fn likers(
        &self,
        nwid: NetworkId,
        group: MulticastGroup,
        limit: usize,
        exclude: Address,
        now: u64,
    ) -> Vec<Address> {
        let Some(state) = self.groups.get(&(nwid, group)) else {
            return Vec::new();
        };
        state
            .likers
            .iter()
            .rev()
            .filter(|(a, ts)| *a != exclude && now.saturating_sub(*ts) < MULTICAST_LIKE_TTL)
            .map(|(a, _)| *a)
            .take(limit)
            .collect()
    }

    /// Number of fresh likers known for a group.
    #[must_use]
    pub fn known_count(
        &self,
        nwid: NetworkId,
        group: MulticastGroup,
        exclude: Address,
        now: u64,
    ) -> usize {
        self.groups
            .get(&(nwid, group))
            .map(|s| {
                s.likers
                    .iter()
                    .filter(|(a, ts)| *a != exclude && now.saturating_sub(*ts) < MULTICAST_LIKE_TTL)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Whether a MULTICAST_GATHER should be sent for this group now.
    /// Recording the decision rate-limits subsequent probes.
    pub fn should_gather(&mut self, nwid: NetworkId, group: MulticastGroup, now: u64) -> bool {
        let state = self
            .groups
            .entry((nwid, group))
            .or_insert_with(GroupState::new);
        if state.last_gather != 0 && now.saturating_sub(state.last_gather) < MULTICAST_GATHER_INTERVAL
        {
            return false;
        }
        state.last_gather = now;
        true
    }

    /// Age out stale likers and empty groups. Returns the earliest next
    /// expiry deadline while any liker remains.
    pub fn prune(&mut self, now: u64) -> Option<u64> {
        for state in self.groups.values_mut() {
            state
                .likers
                .retain(|(_, ts)| now.saturating_sub(*ts) < MULTICAST_LIKE_TTL);
        }
        self.groups
            .retain(|_, s| !s.likers.is_empty() || s.last_gather != 0);
        self.groups
            .values()
            .flat_map(|s| s.likers.iter().map(|(_, ts)| ts + MULTICAST_LIKE_TTL))
            .min()
    }

    /// Forget everything known about a network (on leave).
    pub fn forget_network(&mut self, nwid: NetworkId) {
        self.groups.retain(|(n, _), _| *n != nwid);
    }

    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}
