//! VL2 timing and capacity constants (milliseconds of host monotonic time).

/// Base interval for re-requesting a missing network config.
pub const CONFIG_REQUEST_BASE_INTERVAL: u64 = 10_000;

/// Exponential backoff cap for config requests.
pub const CONFIG_REQUEST_MAX_INTERVAL: u64 = 300_000;

/// Multicast group memberships (LIKEs) expire after this long.
pub const MULTICAST_LIKE_TTL: u64 = 300_000;

/// How often we re-announce our own subscriptions.
pub const MULTICAST_ANNOUNCE_INTERVAL: u64 = 120_000;

/// Minimum interval between MULTICAST_GATHER probes for one group.
pub const MULTICAST_GATHER_INTERVAL: u64 = 5_000;

/// Maximum remembered likers per group (the send plan uses the config's
/// `multicast_limit`, which is normally much smaller).
pub const MULTICAST_LIKERS_MAX: usize = 128;

/// Maximum tracked groups across all networks; the least recently liked
/// group is evicted on overflow.
pub const MULTICAST_GROUPS_MAX: usize = 4_096;

/// Learned bridge routes expire after this long without traffic.
pub const BRIDGE_TTL: u64 = 120_000;

/// Maximum learned bridge routes per network.
pub const BRIDGE_MAX_ENTRIES: usize = 1_024;

/// Maximum controller-assigned addresses per network.
pub const MAX_ASSIGNED_ADDRESSES: usize = 16;

/// Default agreement window for membership certificate timestamps.
pub const COM_DEFAULT_TIMESTAMP_WINDOW: u64 = 7_200_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_bounds_ordered() {
        assert!(CONFIG_REQUEST_BASE_INTERVAL < CONFIG_REQUEST_MAX_INTERVAL);
    }

    #[test]
    fn gather_faster_than_like_ttl() {
        assert!(MULTICAST_GATHER_INTERVAL < MULTICAST_LIKE_TTL);
    }
}
