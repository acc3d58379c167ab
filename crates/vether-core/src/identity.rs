//! Node identities: a Curve25519+Ed25519 key pair bound to a 40-bit address.
//!
//! The address is not chosen; it is derived by running the 64-byte combined
//! public key through the memory-hard digest and taking the last five digest
//! bytes. A candidate key pair is only accepted when both leading digest
//! bytes are below the proof-of-work threshold and the derived address is
//! not reserved, which makes grinding a specific address impractical.

use core::fmt;
use std::str::FromStr;

use vether_crypto::c25519::{C25519Public, C25519Secret};
use vether_crypto::ed25519::{Ed25519Public, Ed25519Secret, Ed25519Signature};
use vether_crypto::memhard::memory_hard_digest;

use crate::constants::IDENTITY_POW_THRESHOLD;
use crate::error::IdentityError;
use crate::types::Address;

/// Combined public key length: C25519 followed by Ed25519.
pub const PUBLIC_KEY_LENGTH: usize = 64;

/// Combined secret key length: C25519 followed by Ed25519 seed.
pub const SECRET_KEY_LENGTH: usize = 64;

/// Wire length of a public identity: address(5) + type(1) + key(64) + seclen(1).
pub const IDENTITY_WIRE_LENGTH: usize = 5 + 1 + PUBLIC_KEY_LENGTH + 1;

const IDENTITY_TYPE_C25519: u8 = 0;

/// A node identity, with or without its secret half.
pub struct Identity {
    address: Address,
    c25519_public: C25519Public,
    ed25519_public: Ed25519Public,
    c25519_secret: Option<C25519Secret>,
    ed25519_secret: Option<Ed25519Secret>,
}

impl Identity {
    /// Generate a fresh identity, looping key pairs until the derived
    /// address satisfies the proof of work.
    pub fn generate() -> Self {
        loop {
            let c25519_secret = C25519Secret::generate();
            let ed25519_secret = Ed25519Secret::generate();
            let c25519_public = c25519_secret.public_key();
            let ed25519_public = ed25519_secret.public_key();

            let public = combine_public(&c25519_public, &ed25519_public);
            if let Ok(address) = derive_address(&public) {
                return Self {
                    address,
                    c25519_public,
                    ed25519_public,
                    c25519_secret: Some(c25519_secret),
                    ed25519_secret: Some(ed25519_secret),
                };
            }
        }
    }

    /// Reassemble a full identity from its combined secret and public keys.
    ///
    /// The address is re-derived and checked, so a corrupted or forged key
    /// pair is rejected.
    pub fn from_key_bytes(
        public: &[u8; PUBLIC_KEY_LENGTH],
        secret: Option<&[u8; SECRET_KEY_LENGTH]>,
    ) -> Result<Self, IdentityError> {
        let address = derive_address(public)?;
        Self::from_parts(address, public, secret)
    }

    fn from_parts(
        address: Address,
        public: &[u8; PUBLIC_KEY_LENGTH],
        secret: Option<&[u8; SECRET_KEY_LENGTH]>,
    ) -> Result<Self, IdentityError> {
        let c25519_public = C25519Public::from_bytes(public[..32].try_into().expect("32 bytes"));
        let ed25519_public =
            Ed25519Public::from_bytes(public[32..].try_into().expect("32 bytes"))?;

        let (c25519_secret, ed25519_secret) = match secret {
            Some(sec) => {
                let c = C25519Secret::from_bytes(sec[..32].try_into().expect("32 bytes"));
                let e = Ed25519Secret::from_bytes(sec[32..].try_into().expect("32 bytes"));
                if c.public_key() != c25519_public || e.public_key() != ed25519_public {
                    return Err(IdentityError::Malformed("secret does not match public"));
                }
                (Some(c), Some(e))
            }
            None => (None, None),
        };

        Ok(Self {
            address,
            c25519_public,
            ed25519_public,
            c25519_secret,
            ed25519_secret,
        })
    }

    /// The node's 40-bit address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// The 64-byte combined public key: C25519 then Ed25519.
    #[must_use]
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        combine_public(&self.c25519_public, &self.ed25519_public)
    }

    /// The 64-byte combined secret key, if present.
    #[must_use]
    pub fn secret_key_bytes(&self) -> Option<[u8; SECRET_KEY_LENGTH]> {
        let c = self.c25519_secret.as_ref()?;
        let e = self.ed25519_secret.as_ref()?;
        let mut out = [0u8; SECRET_KEY_LENGTH];
        out[..32].copy_from_slice(&c.to_bytes());
        out[32..].copy_from_slice(&e.to_bytes());
        Some(out)
    }

    /// Whether the secret half is present.
    #[must_use]
    pub fn has_secret(&self) -> bool {
        self.c25519_secret.is_some() && self.ed25519_secret.is_some()
    }

    /// A copy of this identity with the secret half stripped.
    pub fn public_only(&self) -> Self {
        Self {
            address: self.address,
            c25519_public: self.c25519_public.clone(),
            ed25519_public: self.ed25519_public.clone(),
            c25519_secret: None,
            ed25519_secret: None,
        }
    }

    /// Re-run address derivation and confirm the bound address.
    ///
    /// Used when an identity arrives over the wire: the proof of work and
    /// the 40-bit binding are what make address spoofing expensive.
    #[must_use]
    pub fn locally_validate(&self) -> bool {
        matches!(derive_address(&self.public_key_bytes()), Ok(addr) if addr == self.address)
    }

    /// Derive the 32-byte symmetric key shared with another identity.
    pub fn agree(&self, other: &Identity) -> Result<[u8; 32], IdentityError> {
        let secret = self.c25519_secret.as_ref().ok_or(IdentityError::NoSecret)?;
        Ok(secret.shared_key(&other.c25519_public))
    }

    /// Sign a message with the Ed25519 secret.
    pub fn sign(&self, message: &[u8]) -> Result<Ed25519Signature, IdentityError> {
        let secret = self.ed25519_secret.as_ref().ok_or(IdentityError::NoSecret)?;
        Ok(secret.sign(message))
    }

    /// Verify a signature made by this identity.
    pub fn verify(&self, message: &[u8], signature: &Ed25519Signature) -> bool {
        self.ed25519_public.verify(message, signature).is_ok()
    }

    /// Serialize to wire form: address(5) + type(1) + public(64) + seclen(1).
    ///
    /// The secret is never written to the wire form.
    #[must_use]
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(IDENTITY_WIRE_LENGTH);
        out.extend_from_slice(&self.address.to_bytes());
        out.push(IDENTITY_TYPE_C25519);
        out.extend_from_slice(&self.public_key_bytes());
        out.push(0);
        out
    }

    /// Parse a wire-form identity, returning the identity and bytes consumed.
    ///
    /// The claimed address is accepted as-is here; callers that trust the
    /// identity for anything must run [`Identity::locally_validate`] first.
    pub fn from_wire(bytes: &[u8]) -> Result<(Self, usize), IdentityError> {
        if bytes.len() < IDENTITY_WIRE_LENGTH {
            return Err(IdentityError::Malformed("truncated identity"));
        }
        let address = Address::from_bytes(bytes[..5].try_into().expect("5 bytes"));
        if address.is_reserved() {
            return Err(IdentityError::ReservedAddress);
        }
        if bytes[5] != IDENTITY_TYPE_C25519 {
            return Err(IdentityError::UnknownType(bytes[5]));
        }
        let public: [u8; PUBLIC_KEY_LENGTH] =
            bytes[6..6 + PUBLIC_KEY_LENGTH].try_into().expect("64 bytes");
        let seclen = bytes[6 + PUBLIC_KEY_LENGTH] as usize;
        if seclen != 0 {
            return Err(IdentityError::Malformed("wire identity carries a secret"));
        }
        let identity = Self::from_parts(address, &public, None)?;
        Ok((identity, IDENTITY_WIRE_LENGTH))
    }

    /// Canonical string form: `<address>:0:<public hex>[:<secret hex>]`.
    #[must_use]
    pub fn to_string_with_secret(&self, include_secret: bool) -> String {
        let mut s = format!("{}:0:{}", self.address, hex::encode(self.public_key_bytes()));
        if include_secret {
            if let Some(secret) = self.secret_key_bytes() {
                s.push(':');
                s.push_str(&hex::encode(secret));
            }
        }
        s
    }
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        let secret = self.secret_key_bytes();
        Self::from_parts(self.address, &self.public_key_bytes(), secret.as_ref())
            .expect("cloning a valid identity cannot fail")
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.public_key_bytes() == other.public_key_bytes()
    }
}

impl Eq for Identity {}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_with_secret(false))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({}, secret={})", self.address, self.has_secret())
    }
}

impl FromStr for Identity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.split(':');
        let addr_hex = fields.next().ok_or(IdentityError::Malformed("empty"))?;
        let type_field = fields
            .next()
            .ok_or(IdentityError::Malformed("missing type field"))?;
        let public_hex = fields
            .next()
            .ok_or(IdentityError::Malformed("missing public key field"))?;
        let secret_hex = fields.next();
        if fields.next().is_some() {
            return Err(IdentityError::Malformed("trailing fields"));
        }

        if type_field != "0" {
            return Err(IdentityError::UnknownType(
                type_field.parse::<u8>().unwrap_or(u8::MAX),
            ));
        }

        let addr_bytes: [u8; 5] = hex::decode(addr_hex)
            .map_err(|_| IdentityError::Malformed("bad address hex"))?
            .try_into()
            .map_err(|_| IdentityError::Malformed("address must be 5 bytes"))?;
        let address = Address::from_bytes(&addr_bytes);
        if address.is_reserved() {
            return Err(IdentityError::ReservedAddress);
        }

        let public: [u8; PUBLIC_KEY_LENGTH] = hex::decode(public_hex)
            .map_err(|_| IdentityError::Malformed("bad public key hex"))?
            .try_into()
            .map_err(|_| IdentityError::Malformed("public key must be 64 bytes"))?;

        let secret: Option<[u8; SECRET_KEY_LENGTH]> = match secret_hex {
            Some(h) => Some(
                hex::decode(h)
                    .map_err(|_| IdentityError::Malformed("bad secret key hex"))?
                    .try_into()
                    .map_err(|_| IdentityError::Malformed("secret key must be 64 bytes"))?,
            ),
            None => None,
        };

        Self::from_parts(address, &public, secret.as_ref())
    }
}

fn combine_public(c: &C25519Public, e: &Ed25519Public) -> [u8; PUBLIC_KEY_LENGTH] {
    let mut out = [0u8; PUBLIC_KEY_LENGTH];
    out[..32].copy_from_slice(&c.to_bytes());
    out[32..].copy_from_slice(&e.to_bytes());
    out
}

/// Derive the address bound to a combined public key.
///
/// Fails unless both leading digest bytes are below the proof-of-work
/// threshold and the resulting address is assignable.
pub fn derive_address(public: &[u8; PUBLIC_KEY_LENGTH]) -> Result<Address, IdentityError> {
    let digest = memory_hard_digest(public);
    if digest[0] >= IDENTITY_POW_THRESHOLD || digest[1] >= IDENTITY_POW_THRESHOLD {
        return Err(IdentityError::BadProofOfWork);
    }
    let address = Address::from_bytes(digest[59..64].try_into().expect("5 bytes"));
    if address.is_reserved() {
        return Err(IdentityError::ReservedAddress);
    }
    Ok(address)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::OnceLock;

    // Identity generation grinds the proof of work, so tests share a pair.
    pub(crate) fn test_identity_a() -> &'static Identity {
        static ID: OnceLock<Identity> = OnceLock::new();
        ID.get_or_init(Identity::generate)
    }

    pub(crate) fn test_identity_b() -> &'static Identity {
        static ID: OnceLock<Identity> = OnceLock::new();
        ID.get_or_init(Identity::generate)
    }

    #[test]
    fn generated_identity_satisfies_pow() {
        let id = test_identity_a();
        let digest = memory_hard_digest(&id.public_key_bytes());
        assert!(digest[0] < IDENTITY_POW_THRESHOLD);
        assert!(digest[1] < IDENTITY_POW_THRESHOLD);
        assert_eq!(
            id.address(),
            Address::from_bytes(digest[59..64].try_into().unwrap())
        );
        assert!(id.locally_validate());
    }

    #[test]
    fn key_bytes_roundtrip() {
        let id = test_identity_a();
        let public = id.public_key_bytes();
        let secret = id.secret_key_bytes().unwrap();

        let restored = Identity::from_key_bytes(&public, Some(&secret)).unwrap();
        assert_eq!(&restored, id);
        assert!(restored.has_secret());
    }

    #[test]
    fn public_only_cannot_sign_or_agree() {
        let id = test_identity_a();
        let public = id.public_only();
        assert!(!public.has_secret());
        assert_eq!(public.sign(b"x"), Err(IdentityError::NoSecret));
        assert!(matches!(
            public.agree(test_identity_b()),
            Err(IdentityError::NoSecret)
        ));
    }

    #[test]
    fn agreement_is_symmetric() {
        let a = test_identity_a();
        let b = test_identity_b();
        assert_eq!(a.agree(b).unwrap(), b.agree(a).unwrap());
    }

    #[test]
    fn sign_and_verify() {
        let id = test_identity_a();
        let sig = id.sign(b"hello world").unwrap();
        assert!(id.verify(b"hello world", &sig));
        assert!(!id.verify(b"hello wirld", &sig));
        assert!(!test_identity_b().verify(b"hello world", &sig));
    }

    #[test]
    fn string_roundtrip_public() {
        let id = test_identity_a();
        let s = id.to_string_with_secret(false);
        let parsed: Identity = s.parse().unwrap();
        assert_eq!(&parsed, id);
        assert!(!parsed.has_secret());
    }

    #[test]
    fn string_roundtrip_secret() {
        let id = test_identity_a();
        let s = id.to_string_with_secret(true);
        let parsed: Identity = s.parse().unwrap();
        assert_eq!(&parsed, id);
        assert!(parsed.has_secret());
        assert_eq!(parsed.secret_key_bytes(), id.secret_key_bytes());
    }

    #[test]
    fn string_with_mismatched_secret_rejected() {
        let a = test_identity_a();
        let b = test_identity_b();
        let forged = format!(
            "{}:0:{}:{}",
            a.address(),
            hex::encode(a.public_key_bytes()),
            hex::encode(b.secret_key_bytes().unwrap())
        );
        assert!(forged.parse::<Identity>().is_err());
    }

    #[test]
    fn malformed_strings_rejected() {
        for s in [
            "",
            "deadbeef",
            "00112233:0:aabb",
            "0011223344:7:00",
            "0000000000:0:00",
        ] {
            assert!(s.parse::<Identity>().is_err(), "should reject {s:?}");
        }
    }

    #[test]
    fn wire_roundtrip() {
        let id = test_identity_a();
        let wire = id.to_wire();
        assert_eq!(wire.len(), IDENTITY_WIRE_LENGTH);

        let (parsed, consumed) = Identity::from_wire(&wire).unwrap();
        assert_eq!(consumed, IDENTITY_WIRE_LENGTH);
        assert_eq!(&parsed, id);
        assert!(parsed.locally_validate());
    }

    #[test]
    fn wire_with_trailing_data() {
        let id = test_identity_a();
        let mut wire = id.to_wire();
        wire.extend_from_slice(b"more payload follows");
        let (parsed, consumed) = Identity::from_wire(&wire).unwrap();
        assert_eq!(consumed, IDENTITY_WIRE_LENGTH);
        assert_eq!(parsed.address(), id.address());
    }

    #[test]
    fn wire_truncated_rejected() {
        let id = test_identity_a();
        let wire = id.to_wire();
        assert!(Identity::from_wire(&wire[..wire.len() - 1]).is_err());
    }

    #[test]
    fn spoofed_wire_address_fails_validation() {
        let id = test_identity_a();
        let mut wire = id.to_wire();
        // Claim a different (non-reserved) address for a real public key.
        wire[4] ^= 0x01;
        let (spoofed, _) = Identity::from_wire(&wire).unwrap();
        assert!(!spoofed.locally_validate());
    }

    #[test]
    fn derive_address_rejects_ordinary_keys() {
        // A fixed arbitrary key is overwhelmingly unlikely to satisfy the
        // proof of work.
        let public = [0x5Au8; PUBLIC_KEY_LENGTH];
        assert!(matches!(
            derive_address(&public),
            Err(IdentityError::BadProofOfWork) | Err(IdentityError::ReservedAddress)
        ));
    }
}
