//! Fragment reassembly.
//!
//! In-flight reassemblies are keyed by packet id (trailing fragments do not
//! carry a source address; the head binds the source and the packet MAC
//! authenticates the pair). The table is a bounded LRU: when full, the
//! oldest in-flight entry is evicted, and entries time out after
//! [`REASSEMBLY_TIMEOUT`] milliseconds.

use std::collections::HashMap;

use tracing::trace;
use vether_core::packet::Fragment;
use vether_core::PacketId;

use crate::constants::{MAX_PENDING_REASSEMBLIES, REASSEMBLY_TIMEOUT};

struct Pending {
    head: Option<Vec<u8>>,
    /// Trailing fragment payloads, slot `no - 1`.
    fragments: Vec<Option<Vec<u8>>>,
    total: Option<u8>,
    started: u64,
}

impl Pending {
    fn new(now: u64) -> Self {
        Self {
            head: None,
            fragments: Vec::new(),
            total: None,
            started: now,
        }
    }

    fn set_total(&mut self, total: u8) {
        if self.total.is_none() {
            self.total = Some(total);
            self.fragments.resize(total as usize - 1, None);
        }
    }

    fn complete(&self) -> bool {
        self.head.is_some()
            && self.total.is_some()
            && self.fragments.iter().all(Option::is_some)
    }

    fn assemble(mut self) -> Vec<u8> {
        let mut out = self.head.take().expect("checked complete");
        for frag in self.fragments.into_iter().flatten() {
            out.extend_from_slice(&frag);
        }
        out
    }
}

/// Bounded table of in-flight fragment reassemblies.
#[derive(Default)]
pub struct FragmentAssembler {
    pending: HashMap<u64, Pending>,
}

impl FragmentAssembler {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    /// Offer the head datagram of a fragmented packet. Returns the whole
    /// serialized packet once all pieces are present.
    pub fn offer_head(&mut self, id: PacketId, raw: Vec<u8>, now: u64) -> Option<Vec<u8>> {
        self.make_room(id, now);
        let entry = self
            .pending
            .entry(id.as_u64())
            .or_insert_with(|| Pending::new(now));
        entry.head = Some(raw);
        self.try_complete(id)
    }

    /// Offer a trailing fragment. Returns the whole serialized packet once
    /// all pieces are present.
    pub fn offer_fragment(&mut self, frag: Fragment, now: u64) -> Option<Vec<u8>> {
        if frag.total as usize > vether_core::constants::MAX_FRAGMENTS {
            return None;
        }
        let id = frag.id;
        self.make_room(id, now);
        let entry = self
            .pending
            .entry(id.as_u64())
            .or_insert_with(|| Pending::new(now));
        entry.set_total(frag.total);
        // A fragment disagreeing with the established total is noise.
        if entry.total != Some(frag.total) {
            return None;
        }
        let slot = frag.no as usize - 1;
        if slot >= entry.fragments.len() {
            return None;
        }
        entry.fragments[slot] = Some(frag.payload);
        self.try_complete(id)
    }

    fn try_complete(&mut self, id: PacketId) -> Option<Vec<u8>> {
        if self.pending.get(&id.as_u64())?.complete() {
            let entry = self.pending.remove(&id.as_u64()).expect("present");
            return Some(entry.assemble());
        }
        None
    }

    fn make_room(&mut self, incoming: PacketId, now: u64) {
        if self.pending.contains_key(&incoming.as_u64())
            || self.pending.len() < MAX_PENDING_REASSEMBLIES
        {
            return;
        }
        if let Some(oldest) = self
            .pending
            .iter()
            .min_by_key(|(_, p)| p.started)
            .map(|(k, _)| *k)
        {
            trace!(packet = oldest, now, "reassembly table full, evicting oldest");
            self.pending.remove(&oldest);
        }
    }

    /// Drop timed-out entries; returns the deadline of the next expiry, if
    /// any entries remain in flight.
    pub fn expire(&mut self, now: u64) -> Option<u64> {
        self.pending
            .retain(|_, p| now.saturating_sub(p.started) < REASSEMBLY_TIMEOUT);
        self.pending
            .values()
            .map(|p| p.started + REASSEMBLY_TIMEOUT)
            .min()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
