//! Certificates of membership.
//!
//! On a private network, the controller hands each member a signed
//! certificate whose qualifier tuples pin down when and for which network
//! it was issued. Two members may talk iff their certificates agree: for
//! every qualifier id present in both, the values differ by no more than
//! the smaller of the two max-deltas. Timestamps therefore act as a sliding
//! validity window, and the network id (delta 0) must match exactly.

use vether_core::identity::Identity;
use vether_core::{Address, NetworkId};
use vether_crypto::ed25519::Ed25519Signature;

use crate::error::CredentialError;

/// Well-known qualifier ids.
pub mod qualifier {
    /// Issuance timestamp; `max_delta` is the agreement window.
    pub const TIMESTAMP: u64 = 0;
    /// Network id; exact match required.
    pub const NETWORK_ID: u64 = 1;
    /// Issued-to node address; informational, never compared.
    pub const ISSUED_TO: u64 = 2;
}

const MAX_QUALIFIERS: usize = 32;
const QUALIFIER_WIRE_LENGTH: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Qualifier {
    pub id: u64,
    pub value: u64,
    pub max_delta: u64,
}

/// A signed membership certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct CertificateOfMembership {
    qualifiers: Vec<Qualifier>,
    signed_by: Address,
    signature: Ed25519Signature,
}

impl CertificateOfMembership {
    /// Issue a certificate. `controller` must hold its secret key.
    pub fn issue(
        controller: &Identity,
        nwid: NetworkId,
        issued_to: Address,
        timestamp: u64,
        timestamp_window: u64,
    ) -> Result<Self, CredentialError> {
        let qualifiers = vec![
            Qualifier {
                id: qualifier::TIMESTAMP,
                value: timestamp,
                max_delta: timestamp_window,
            },
            Qualifier {
                id: qualifier::NETWORK_ID,
                value: nwid.as_u64(),
                max_delta: 0,
            },
            Qualifier {
                id: qualifier::ISSUED_TO,
                value: issued_to.as_u64(),
                max_delta: u64::MAX,
            },
        ];
        let body = qualifier_body(&qualifiers);
        let signature = controller
            .sign(&body)
            .map_err(|_| CredentialError::Malformed("controller has no secret"))?;
        Ok(Self {
            qualifiers,
            signed_by: controller.address(),
            signature,
        })
    }

    #[must_use]
    pub fn signed_by(&self) -> Address {
        self.signed_by
    }

    #[must_use]
    pub fn qualifier(&self, id: u64) -> Option<&Qualifier> {
        self.qualifiers.iter().find(|q| q.id == id)
    }

    #[must_use]
    pub fn timestamp(&self) -> Option<u64> {
        self.qualifier(qualifier::TIMESTAMP).map(|q| q.value)
    }

    #[must_use]
    pub fn network_id(&self) -> Option<NetworkId> {
        self.qualifier(qualifier::NETWORK_ID)
            .map(|q| NetworkId::from_u64(q.value))
    }

    #[must_use]
    pub fn issued_to(&self) -> Option<Address> {
        self.qualifier(qualifier::ISSUED_TO)
            .map(|q| Address::from_u64(q.value))
    }

    /// Verify the controller signature.
    pub fn verify(&self, controller: &Identity) -> Result<(), CredentialError> {
        if controller.address() != self.signed_by {
            return Err(CredentialError::WrongSigner);
        }
        let body = qualifier_body(&self.qualifiers);
        if controller.verify(&body, &self.signature) {
            Ok(())
        } else {
            Err(CredentialError::BadSignature)
        }
    }

    /// Agreement test between two certificates.
    ///
    /// The issued-to qualifier is identity, not policy, and is skipped.
    /// Both certificates must come from the same signer.
    #[must_use]
    pub fn agrees_with(&self, other: &Self) -> bool {
        if self.signed_by != other.signed_by {
            return false;
        }
        for mine in &self.qualifiers {
            if mine.id == qualifier::ISSUED_TO {
                continue;
            }
            let Some(theirs) = other.qualifier(mine.id) else {
                continue;
            };
            let delta = mine.value.abs_diff(theirs.value);
            if delta > mine.max_delta.min(theirs.max_delta) {
                return false;
            }
        }
        true
    }

    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            1 + self.qualifiers.len() * QUALIFIER_WIRE_LENGTH + Address::LENGTH + 64,
        );
        out.push(self.qualifiers.len() as u8);
        for q in &self.qualifiers {
            out.extend_from_slice(&q.id.to_be_bytes());
            out.extend_from_slice(&q.value.to_be_bytes());
            out.extend_from_slice(&q.max_delta.to_be_bytes());
        }
        out.extend_from_slice(&self.signed_by.to_bytes());
        out.extend_from_slice(&self.signature.to_bytes());
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<(Self, usize), CredentialError> {
        let count = *bytes
            .first()
            .ok_or(CredentialError::Malformed("empty certificate"))? as usize;
        if count > MAX_QUALIFIERS {
            return Err(CredentialError::Malformed("too many qualifiers"));
        }
        let needed = 1 + count * QUALIFIER_WIRE_LENGTH + Address::LENGTH + 64;
        if bytes.len() < needed {
            return Err(CredentialError::Malformed("truncated certificate"));
        }

        let mut qualifiers = Vec::with_capacity(count);
        let mut offset = 1;
        for _ in 0..count {
            let id = u64::from_be_bytes(bytes[offset..offset + 8].try_into().expect("8 bytes"));
            let value =
                u64::from_be_bytes(bytes[offset + 8..offset + 16].try_into().expect("8 bytes"));
            let max_delta =
                u64::from_be_bytes(bytes[offset + 16..offset + 24].try_into().expect("8 bytes"));
            qualifiers.push(Qualifier {
                id,
                value,
                max_delta,
            });
            offset += QUALIFIER_WIRE_LENGTH;
        }

        let signed_by = Address::from_bytes(
            bytes[offset..offset + Address::LENGTH]
                .try_into()
                .expect("5 bytes"),
        );
        offset += Address::LENGTH;
        let signature = Ed25519Signature::from_bytes(
            bytes[offset..offset + 64].try_into().expect("64 bytes"),
        );
        offset += 64;

        Ok((
            Self {
                qualifiers,
                signed_by,
                signature,
            },
            offset,
        ))
    }
}

fn qualifier_body(qualifiers: &[Qualifier]) -> Vec<u8> {
    let mut out = Vec::with_capacity(qualifiers.len() * QUALIFIER_WIRE_LENGTH);
    for q in qualifiers {
        out.extend_from_slice(&q.id.to_be_bytes());
        out.extend_from_slice(&q.value.to_be_bytes());
        out.extend_from_slice(&q.max_delta.to_be_bytes());
    }
    out
}
