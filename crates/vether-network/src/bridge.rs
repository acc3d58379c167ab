//! Learned bridge routes: foreign MAC → node address.
//!
//! When a bridging member relays traffic for MACs that are not derived node
//! MACs, we learn which member speaks for each foreign MAC from observed
//! traffic. Entries expire by TTL and the table is capped; the oldest entry
//! is evicted on overflow.

use std::collections::HashMap;

use vether_core::{Address, Mac};

use crate::constants::{BRIDGE_MAX_ENTRIES, BRIDGE_TTL};

struct Route {
    via: Address,
    last_seen: u64,
}

/// Per-network bridge learning table.
#[derive(Default)]
pub struct BridgeTable {
    routes: HashMap<Mac, Route>,
}

impl BridgeTable {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    /// Learn (or refresh) that `mac` is reachable via `via`.
    pub fn learn(&mut self, mac: Mac, via: Address, now: u64) {
        if !self.routes.contains_key(&mac) && self.routes.len() >= BRIDGE_MAX_ENTRIES {
            if let Some(oldest) = self
                .routes
                .iter()
                .min_by_key(|(_, r)| r.last_seen)
                .map(|(m, _)| *m)
            {
                self.routes.remove(&oldest);
            }
        }
        self.routes.insert(mac, Route { via, last_seen: now });
    }

    /// The member currently known to speak for `mac`, if fresh.
    #[must_use]
    pub fn lookup(&self, mac: Mac, now: u64) -> Option<Address> {
        self.routes
            .get(&mac)
            .filter(|r| now.saturating_sub(r.last_seen) < BRIDGE_TTL)
            .map(|r| r.via)
    }

    /// Drop expired routes.
    pub fn prune(&mut self, now: u64) {
        self.routes
            .retain(|_, r| now.saturating_sub(r.last_seen) < BRIDGE_TTL);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
