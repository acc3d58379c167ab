//! Persistence through the host data store.
//!
//! The engine persists four kinds of records: the identity pair, the
//! adopted world, each network's signed config blob exactly as received,
//! and a small snapshot of each network's multicast subscriptions so they
//! survive a restart. Names are slash-separated and contain no `..`.

use serde::{Deserialize, Serialize};
use vether_core::identity::Identity;
use vether_core::{Mac, NetworkId};
use vether_network::MulticastGroup;

use crate::host::Host;

pub const IDENTITY_PUBLIC: &str = "identity.public";
pub const IDENTITY_SECRET: &str = "identity.secret";
pub const WORLD: &str = "world";

#[must_use]
pub fn network_config_name(nwid: NetworkId) -> String {
    format!("networks.d/{nwid}.conf")
}

#[must_use]
pub fn network_subs_name(nwid: NetworkId) -> String {
    format!("networks.d/{nwid}.subs")
}

/// Errors from the persistence layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("stored record is corrupt: {0}")]
    Corrupt(&'static str),
}

/// Load the identity, preferring the secret record.
///
/// Returns `Ok(None)` on a cold store, an error when a record exists but
/// cannot be parsed (the host's store is handing back garbage).
pub fn load_identity<H: Host>(host: &H) -> Result<Option<Identity>, StorageError> {
    let Some(bytes) = host.data_store_get(IDENTITY_SECRET) else {
        return Ok(None);
    };
    let s = String::from_utf8(bytes).map_err(|_| StorageError::Corrupt("not utf-8"))?;
    let identity: Identity = s
        .trim()
        .parse()
        .map_err(|_| StorageError::Corrupt("unparseable identity"))?;
    if !identity.has_secret() {
        return Err(StorageError::Corrupt("secret record without secret"));
    }
    if !identity.locally_validate() {
        return Err(StorageError::Corrupt("identity fails validation"));
    }
    Ok(Some(identity))
}

/// Persist both identity records. Returns false on a store failure.
pub fn save_identity<H: Host>(host: &H, identity: &Identity) -> bool {
    let secret = identity.to_string_with_secret(true);
    if host.data_store_put(IDENTITY_SECRET, secret.as_bytes(), true) != 0 {
        return false;
    }
    let public = identity.to_string_with_secret(false);
    host.data_store_put(IDENTITY_PUBLIC, public.as_bytes(), false) == 0
}

/// Serialized multicast subscriptions for one network.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SubscriptionSnapshot {
    groups: Vec<(u64, u32)>,
}

pub fn save_subscriptions<H, I>(host: &H, nwid: NetworkId, groups: I)
where
    H: Host,
    I: IntoIterator<Item = MulticastGroup>,
{
    let snapshot = SubscriptionSnapshot {
        groups: groups
            .into_iter()
            .map(|g| (g.mac.as_u64(), g.adi))
            .collect(),
    };
    if let Ok(bytes) = postcard::to_allocvec(&snapshot) {
        host.data_store_put(&network_subs_name(nwid), &bytes, false);
    }
}

#[must_use]
pub fn load_subscriptions<H: Host>(host: &H, nwid: NetworkId) -> Vec<MulticastGroup> {
    let Some(bytes) = host.data_store_get(&network_subs_name(nwid)) else {
        return Vec::new();
    };
    let Ok(snapshot) = postcard::from_bytes::<SubscriptionSnapshot>(&bytes) else {
        return Vec::new();
    };
    snapshot
        .groups
        .into_iter()
        .map(|(mac, adi)| MulticastGroup::new(Mac::from_u64(mac), adi))
        .collect()
}
