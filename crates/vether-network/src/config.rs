//! Signed network configuration.
//!
//! The controller answers NETWORK_CONFIG_REQUEST with a signed dictionary.
//! The signature covers the serialized dictionary minus the signature entry
//! itself; the original blob is kept alongside the parsed fields so the
//! host can persist exactly what was received.

use std::net::IpAddr;

use vether_core::identity::Identity;
use vether_core::types::clamp_mtu;
use vether_core::{Address, NetworkId};
use vether_crypto::ed25519::Ed25519Signature;

use crate::com::CertificateOfMembership;
use crate::constants::MAX_ASSIGNED_ADDRESSES;
use crate::dictionary::Dictionary;
use crate::error::NetworkError;

mod key {
    pub const NETWORK_ID: &str = "nwid";
    pub const TIMESTAMP: &str = "ts";
    pub const REVISION: &str = "r";
    pub const ISSUED_TO: &str = "io";
    pub const NAME: &str = "n";
    pub const TYPE: &str = "t";
    pub const MTU: &str = "mtu";
    pub const MULTICAST_LIMIT: &str = "ml";
    pub const BROADCAST: &str = "b";
    pub const DHCP: &str = "dhcp";
    pub const ACTIVE_BRIDGES: &str = "ab";
    pub const ASSIGNED_ADDRESSES: &str = "aa";
    pub const COM: &str = "com";
    pub const SIGNATURE: &str = "sig";
}

/// Private networks gate members on certificates; public ones admit anyone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkType {
    Private,
    Public,
}

/// A validated network configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct NetworkConfig {
    pub nwid: NetworkId,
    pub timestamp: u64,
    pub revision: u64,
    pub issued_to: Address,
    pub name: String,
    pub kind: NetworkType,
    pub mtu: usize,
    pub multicast_limit: usize,
    pub broadcast_enabled: bool,
    pub dhcp: bool,
    /// Nodes authorized to bridge foreign MACs onto this network.
    pub active_bridges: Vec<Address>,
    /// Controller-assigned addresses with prefix lengths.
    pub assigned_addresses: Vec<(IpAddr, u8)>,
    pub com: Option<CertificateOfMembership>,
    /// The signed blob exactly as received; what the host persists.
    pub raw: Vec<u8>,
}

impl NetworkConfig {
    #[must_use]
    pub fn is_private(&self) -> bool {
        self.kind == NetworkType::Private
    }

    /// Whether `address` may bridge foreign source MACs onto the network.
    #[must_use]
    pub fn is_active_bridge(&self, address: Address) -> bool {
        self.active_bridges.contains(&address)
    }

    /// Serialize and sign a config as the controller would.
    pub fn build_signed(params: ConfigParams<'_>) -> Result<Vec<u8>, NetworkError> {
        if params.assigned_addresses.len() > MAX_ASSIGNED_ADDRESSES {
            return Err(NetworkError::MalformedConfig("too many assigned addresses"));
        }
        let mut dict = Dictionary::new();
        dict.set_u64(key::NETWORK_ID, params.nwid.as_u64());
        dict.set_u64(key::TIMESTAMP, params.timestamp);
        dict.set_u64(key::REVISION, params.revision);
        dict.set_str(key::ISSUED_TO, &params.issued_to.to_string());
        dict.set_str(key::NAME, params.name);
        dict.set_u64(
            key::TYPE,
            match params.kind {
                NetworkType::Private => 0,
                NetworkType::Public => 1,
            },
        );
        dict.set_u64(key::MTU, clamp_mtu(params.mtu) as u64);
        dict.set_u64(key::MULTICAST_LIMIT, params.multicast_limit as u64);
        dict.set_bool(key::BROADCAST, params.broadcast_enabled);
        dict.set_bool(key::DHCP, params.dhcp);
        if !params.active_bridges.is_empty() {
            let joined = params
                .active_bridges
                .iter()
                .map(Address::to_string)
                .collect::<Vec<_>>()
                .join(",");
            dict.set_str(key::ACTIVE_BRIDGES, &joined);
        }
        if !params.assigned_addresses.is_empty() {
            let joined = params
                .assigned_addresses
                .iter()
                .map(|(ip, bits)| format!("{ip}/{bits}"))
                .collect::<Vec<_>>()
                .join(",");
            dict.set_str(key::ASSIGNED_ADDRESSES, &joined);
        }
        if let Some(com) = params.com {
            dict.set_bytes(key::COM, com.serialize());
        }

        let body = dict.serialize();
        let signature = params
            .controller
            .sign(&body)
            .map_err(|_| NetworkError::MalformedConfig("controller has no secret"))?;
        dict.set_bytes(key::SIGNATURE, signature.to_bytes().to_vec());
        Ok(dict.serialize())
    }

    /// Parse and validate a signed config blob.
    ///
    /// Checks the controller signature, the network id, and that the config
    /// was issued to `us`. Revision monotonicity is the caller's check
    /// (it needs the previously cached config).
    pub fn from_signed_blob(
        blob: &[u8],
        controller: &Identity,
        expected_nwid: NetworkId,
        us: Address,
    ) -> Result<Self, NetworkError> {
        let mut dict = Dictionary::parse(blob);

        let sig_bytes: [u8; 64] = dict
            .remove(key::SIGNATURE)
            .ok_or(NetworkError::MalformedConfig("missing signature"))?
            .try_into()
            .map_err(|_| NetworkError::MalformedConfig("bad signature length"))?;
        let signature = Ed25519Signature::from_bytes(sig_bytes);
        if !controller.verify(&dict.serialize(), &signature) {
            return Err(NetworkError::BadSignature);
        }

        let nwid = NetworkId::from_u64(
            dict.get_u64(key::NETWORK_ID)
                .ok_or(NetworkError::MalformedConfig("missing network id"))?,
        );
        if nwid != expected_nwid {
            return Err(NetworkError::WrongNetwork {
                expected: expected_nwid,
                actual: nwid,
            });
        }

        let issued_to = parse_address(
            dict.get_str(key::ISSUED_TO)
                .ok_or(NetworkError::MalformedConfig("missing issued-to"))?,
        )?;
        if issued_to != us {
            return Err(NetworkError::NotIssuedToUs);
        }

        let kind = match dict.get_u64(key::TYPE) {
            Some(0) => NetworkType::Private,
            Some(1) => NetworkType::Public,
            _ => return Err(NetworkError::MalformedConfig("bad network type")),
        };

        let com = match dict.get_bytes(key::COM) {
            Some(bytes) => {
                let (com, _) = CertificateOfMembership::parse(bytes)?;
                com.verify(controller)?;
                Some(com)
            }
            None => None,
        };

        let active_bridges = match dict.get_str(key::ACTIVE_BRIDGES) {
            Some(s) if !s.is_empty() => s
                .split(',')
                .map(parse_address)
                .collect::<Result<Vec<_>, _>>()?,
            _ => Vec::new(),
        };

        let assigned_addresses = match dict.get_str(key::ASSIGNED_ADDRESSES) {
            Some(s) if !s.is_empty() => {
                let parsed = s
                    .split(',')
                    .map(parse_assigned)
                    .collect::<Result<Vec<_>, _>>()?;
                if parsed.len() > MAX_ASSIGNED_ADDRESSES {
                    return Err(NetworkError::MalformedConfig("too many assigned addresses"));
                }
                parsed
            }
            _ => Vec::new(),
        };

        Ok(Self {
            nwid,
            timestamp: dict.get_u64(key::TIMESTAMP).unwrap_or(0),
            revision: dict
                .get_u64(key::REVISION)
                .ok_or(NetworkError::MalformedConfig("missing revision"))?,
            issued_to,
            name: dict.get_str(key::NAME).unwrap_or("").to_string(),
            kind,
            mtu: clamp_mtu(dict.get_u64(key::MTU).unwrap_or(2800) as usize),
            multicast_limit: dict.get_u64(key::MULTICAST_LIMIT).unwrap_or(32) as usize,
            broadcast_enabled: dict.get_bool(key::BROADCAST).unwrap_or(true),
            dhcp: dict.get_bool(key::DHCP).unwrap_or(false),
            active_bridges,
            assigned_addresses,
            com,
            raw: blob.to_vec(),
        })
    }
}

/// Inputs for [`NetworkConfig::build_signed`]; what a controller knows when
/// answering a config request.
pub struct ConfigParams<'a> {
    pub controller: &'a Identity,
    pub nwid: NetworkId,
    pub issued_to: Address,
    pub timestamp: u64,
    pub revision: u64,
    pub name: &'a str,
    pub kind: NetworkType,
    pub mtu: usize,
    pub multicast_limit: usize,
    pub broadcast_enabled: bool,
    pub dhcp: bool,
    pub active_bridges: &'a [Address],
    pub assigned_addresses: &'a [(IpAddr, u8)],
    pub com: Option<&'a CertificateOfMembership>,
}

impl<'a> ConfigParams<'a> {
    /// Sensible defaults for a small private network.
    pub fn new(
        controller: &'a Identity,
        nwid: NetworkId,
        issued_to: Address,
        timestamp: u64,
        revision: u64,
    ) -> Self {
        Self {
            controller,
            nwid,
            issued_to,
            timestamp,
            revision,
            name: "",
            kind: NetworkType::Private,
            mtu: 2800,
            multicast_limit: 32,
            broadcast_enabled: true,
            dhcp: false,
            active_bridges: &[],
            assigned_addresses: &[],
            com: None,
        }
    }
}

fn parse_address(s: &str) -> Result<Address, NetworkError> {
    let bytes: [u8; 5] = hex::decode(s)
        .map_err(|_| NetworkError::MalformedConfig("bad address hex"))?
        .try_into()
        .map_err(|_| NetworkError::MalformedConfig("address must be 5 bytes"))?;
    Ok(Address::from_bytes(&bytes))
}

fn parse_assigned(s: &str) -> Result<(IpAddr, u8), NetworkError> {
    let (ip, bits) = s
        .split_once('/')
        .ok_or(NetworkError::MalformedConfig("assigned address missing prefix"))?;
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| NetworkError::MalformedConfig("bad assigned address"))?;
    let bits: u8 = bits
        .parse()
        .map_err(|_| NetworkError::MalformedConfig("bad prefix length"))?;
    let max = if ip.is_ipv4() { 32 } else { 128 };
    if bits > max {
        return Err(NetworkError::MalformedConfig("prefix length out of range"));
    }
    Ok((ip, bits))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::com::tests::{controller, other_controller};

    const NWID: NetworkId = NetworkId::from_u64(0x8056c2e21c000001);
    const MEMBER: Address = Address::from_u64(0x1234567890);

    fn signed_blob(revision: u64) -> Vec<u8> {
        let com = CertificateOfMembership::issue(controller(), NWID, MEMBER, 1_000, 60_000).unwrap();
        let params = ConfigParams {
            name: "engineering",
            assigned_addresses: &[("10.147.17.5".parse().unwrap(), 24)],
            active_bridges: &[Address::from_u64(0x0bad1dea00)],
            com: Some(&com),
            ..ConfigParams::new(controller(), NWID, MEMBER, 1_000, revision)
        };
        NetworkConfig::build_signed(params).unwrap()
    }

    #[test]
    fn roundtrip_valid_config() {
        let blob = signed_blob(7);
        let config = NetworkConfig::from_signed_blob(&blob, controller(), NWID, MEMBER).unwrap();

        assert_eq!(config.nwid, NWID);
        assert_eq!(config.revision, 7);
        assert_eq!(config.issued_to, MEMBER);
        assert_eq!(config.name, "engineering");
        assert_eq!(config.kind, NetworkType::Private);
        assert!(config.is_private());
        assert_eq!(config.mtu, 2800);
        assert_eq!(config.multicast_limit, 32);
        assert!(config.broadcast_enabled);
        assert_eq!(config.assigned_addresses.len(), 1);
        assert!(config.is_active_bridge(Address::from_u64(0x0bad1dea00)));
        assert!(!config.is_active_bridge(MEMBER));
        assert!(config.com.is_some());
        assert_eq!(config.raw, blob);
    }

    #[test]
    fn tampered_blob_rejected() {
        let blob = signed_blob(7);
        // Flip a byte inside the name value.
        let pos = blob
            .windows(11)
            .position(|w| w == b"engineering")
            .expect("name present in blob");
        let mut tampered = blob.clone();
        tampered[pos] = b'E';
        assert!(matches!(
            NetworkConfig::from_signed_blob(&tampered, controller(), NWID, MEMBER),
            Err(NetworkError::BadSignature) | Err(NetworkError::MalformedConfig(_))
        ));
    }

    #[test]
    fn wrong_controller_rejected() {
        let blob = signed_blob(7);
        assert_eq!(
            NetworkConfig::from_signed_blob(&blob, other_controller(), NWID, MEMBER),
            Err(NetworkError::BadSignature)
        );
    }

    #[test]
    fn wrong_network_rejected() {
        let blob = signed_blob(7);
        let other = NetworkId::from_u64(0x8056c2e21c000002);
        assert!(matches!(
            NetworkConfig::from_signed_blob(&blob, controller(), other, MEMBER),
            Err(NetworkError::WrongNetwork { .. })
        ));
    }

    #[test]
    fn issued_to_someone_else_rejected() {
        let blob = signed_blob(7);
        assert_eq!(
            NetworkConfig::from_signed_blob(&blob, controller(), NWID, Address::from_u64(0x42)),
            Err(NetworkError::NotIssuedToUs)
        );
    }

    #[test]
    fn missing_signature_rejected() {
        let params = ConfigParams::new(controller(), NWID, MEMBER, 0, 1);
        let blob = NetworkConfig::build_signed(params).unwrap();
        let dict = Dictionary::parse(&blob);
        let mut unsigned = dict.clone();
        unsigned.remove(key::SIGNATURE);
        assert!(matches!(
            NetworkConfig::from_signed_blob(&unsigned.serialize(), controller(), NWID, MEMBER),
            Err(NetworkError::MalformedConfig(_))
        ));
    }

    #[test]
    fn oversized_mtu_is_clamped() {
        let params = ConfigParams {
            mtu: 9_000,
            ..ConfigParams::new(controller(), NWID, MEMBER, 0, 1)
        };
        let blob = NetworkConfig::build_signed(params).unwrap();
        let config = NetworkConfig::from_signed_blob(&blob, controller(), NWID, MEMBER).unwrap();
        assert_eq!(config.mtu, vether_core::constants::MAX_VIRTUAL_MTU);
    }

    #[test]
    fn public_network_parses() {
        let params = ConfigParams {
            kind: NetworkType::Public,
            ..ConfigParams::new(controller(), NWID, MEMBER, 0, 1)
        };
        let blob = NetworkConfig::build_signed(params).unwrap();
        let config = NetworkConfig::from_signed_blob(&blob, controller(), NWID, MEMBER).unwrap();
        assert!(!config.is_private());
        assert!(config.com.is_none());
    }

    #[test]
    fn too_many_assigned_addresses_rejected() {
        let addrs: Vec<(IpAddr, u8)> = (0..MAX_ASSIGNED_ADDRESSES + 1)
            .map(|i| (format!("10.0.0.{}", i + 1).parse().unwrap(), 24u8))
            .collect();
        let params = ConfigParams {
            assigned_addresses: &addrs,
            ..ConfigParams::new(controller(), NWID, MEMBER, 0, 1)
        };
        assert!(NetworkConfig::build_signed(params).is_err());
    }

    #[test]
    fn bad_assigned_address_rejected() {
        assert!(parse_assigned("10.0.0.1").is_err());
        assert!(parse_assigned("not-an-ip/24").is_err());
        assert!(parse_assigned("10.0.0.1/33").is_err());
        assert!(parse_assigned("2001:db8::1/129").is_err());
        assert!(parse_assigned("10.0.0.1/24").is_ok());
        assert!(parse_assigned("2001:db8::1/64").is_ok());
    }

    #[test]
    fn garbage_blob_rejected() {
        assert!(NetworkConfig::from_signed_blob(b"", controller(), NWID, MEMBER).is_err());
        assert!(
            NetworkConfig::from_signed_blob(b"total garbage", controller(), NWID, MEMBER).is_err()
        );
    }
}
