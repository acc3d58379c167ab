//! WHOIS scheduling.
//!
//! When the engine needs an identity it does not have (a packet to send, a
//! relayed frame to authenticate), the address goes into this queue. The
//! queue rate-limits requests per target, parks outbound packets until the
//! identity arrives, and abandons targets that never resolve.

use std::collections::HashMap;

use vether_core::packet::Packet;
use vether_core::Address;

use crate::constants::{WHOIS_MAX_WAITING_PACKETS, WHOIS_RETRY_INTERVAL, WHOIS_TIMEOUT};

struct Outstanding {
    first_requested: u64,
    last_requested: u64,
    retries: u32,
    waiting: Vec<Packet>,
}

/// Tracks addresses whose identities are being looked up.
#[derive(Default)]
pub struct WhoisQueue {
    outstanding: HashMap<Address, Outstanding>,
}

impl WhoisQueue {
    pub fn new() -> Self {
        Self {
            outstanding: HashMap::new(),
        }
    }

    /// Note that `address` needs resolution. Returns true when a WHOIS
    /// request should actually be transmitted now (per-target rate limit).
    pub fn request(&mut self, address: Address, now: u64) -> bool {
        match self.outstanding.get_mut(&address) {
            Some(entry) => {
                if now.saturating_sub(entry.last_requested) >= WHOIS_RETRY_INTERVAL {
                    entry.last_requested = now;
                    entry.retries += 1;
                    true
                } else {
                    false
                }
            }
            None => {
                self.outstanding.insert(
                    address,
                    Outstanding {
                        first_requested: now,
                        last_requested: now,
                        retries: 0,
                        waiting: Vec::new(),
                    },
                );
                true
            }
        }
    }

    /// Park a plaintext outbound packet until the identity arrives.
    ///
    /// The queue is bounded per target; once full the oldest parked packet
    /// is dropped (the VL1 contract is unreliable delivery anyway).
    pub fn park(&mut self, address: Address, packet: Packet, now: u64) {
        let entry = self
            .outstanding
            .entry(address)
            .or_insert_with(|| Outstanding {
                first_requested: now,
                last_requested: 0,
                retries: 0,
                waiting: Vec::new(),
            });
        if entry.waiting.len() >= WHOIS_MAX_WAITING_PACKETS {
            entry.waiting.remove(0);
        }
        entry.waiting.push(packet);
    }

    /// The identity arrived: stop tracking and hand back parked packets.
    pub fn resolved(&mut self, address: Address) -> Vec<Packet> {
        self.outstanding
            .remove(&address)
            .map(|o| o.waiting)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_outstanding(&self, address: Address) -> bool {
        self.outstanding.contains_key(&address)
    }

    /// Addresses due for a retry at `now`.
    #[must_use]
    pub fn due_for_retry(&self, now: u64) -> Vec<Address> {
        self.outstanding
            .iter()
            .filter(|(_, o)| now.saturating_sub(o.last_requested) >= WHOIS_RETRY_INTERVAL)
            .map(|(a, _)| *a)
            .collect()
    }

    /// Abandon targets that never resolved; their parked packets are lost.
    /// Returns the next retry-or-expiry deadline while anything is pending.
    pub fn expire(&mut self, now: u64) -> Option<u64> {
        self.outstanding
            .retain(|_, o| now.saturating_sub(o.first_requested) < WHOIS_TIMEOUT);
        self.outstanding
            .values()
            .map(|o| (o.last_requested + WHOIS_RETRY_INTERVAL).min(o.first_requested + WHOIS_TIMEOUT))
            .min()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.outstanding.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vether_core::verb::Verb;

    fn addr(v: u64) -> Address {
        Address::from_u64(v)
    }

    fn packet() -> Packet {
        Packet::new_outbound(addr(0x0102030405), addr(0x0a0b0c0d0e), Verb::Echo, b"")
    }

    #[test]
    fn first_request_sends() {
        let mut queue = WhoisQueue::new();
        assert!(queue.request(addr(1), 0));
        assert!(queue.is_outstanding(addr(1)));
    }

    #[test]
    fn rate_limit_is_one_per_interval() {
        let mut queue = WhoisQueue::new();
        assert!(queue.request(addr(1), 0));
        assert!(!queue.request(addr(1), WHOIS_RETRY_INTERVAL - 1));
        assert!(queue.request(addr(1), WHOIS_RETRY_INTERVAL));
        assert!(!queue.request(addr(1), WHOIS_RETRY_INTERVAL + 1));
    }

    #[test]
    fn rate_limit_is_per_target() {
        let mut queue = WhoisQueue::new();
        assert!(queue.request(addr(1), 0));
        assert!(queue.request(addr(2), 0));
    }

    #[test]
    fn resolved_returns_parked_packets() {
        let mut queue = WhoisQueue::new();
        queue.request(addr(1), 0);
        queue.park(addr(1), packet(), 0);
        queue.park(addr(1), packet(), 1);

        let parked = queue.resolved(addr(1));
        assert_eq!(parked.len(), 2);
        assert!(!queue.is_outstanding(addr(1)));
        assert!(queue.resolved(addr(1)).is_empty());
    }

    #[test]
    fn parked_queue_is_bounded() {
        let mut queue = WhoisQueue::new();
        for i in 0..WHOIS_MAX_WAITING_PACKETS + 5 {
            queue.park(addr(1), packet(), i as u64);
        }
        assert_eq!(queue.resolved(addr(1)).len(), WHOIS_MAX_WAITING_PACKETS);
    }

    #[test]
    fn expiry_abandons_stale_targets() {
        let mut queue = WhoisQueue::new();
        queue.request(addr(1), 0);
        queue.park(addr(1), packet(), 0);

        assert!(queue.expire(WHOIS_TIMEOUT - 1).is_some());
        assert_eq!(queue.len(), 1);

        assert!(queue.expire(WHOIS_TIMEOUT).is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn retry_schedule() {
        let mut queue = WhoisQueue::new();
        queue.request(addr(1), 0);
        assert!(queue.due_for_retry(WHOIS_RETRY_INTERVAL - 1).is_empty());
        assert_eq!(queue.due_for_retry(WHOIS_RETRY_INTERVAL), vec![addr(1)]);
    }
}
