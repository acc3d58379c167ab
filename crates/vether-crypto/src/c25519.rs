//! Curve25519 Diffie-Hellman key agreement.
//!
//! Wraps the `x25519-dalek` primitives in [`C25519Secret`] and
//! [`C25519Public`] newtypes. Every pair of node identities shares a
//! long-lived symmetric key derived here; that key seeds the per-packet
//! Salsa20/12 keystream and Poly1305 authenticator.

use sha2::{Digest, Sha512};
use x25519_dalek::{PublicKey, StaticSecret};

/// A Curve25519 secret scalar.
///
/// The underlying library applies clamping when the scalar is used, so raw
/// bytes are stored as-is.
pub struct C25519Secret(StaticSecret);

impl C25519Secret {
    /// Generate a random secret using the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(rand::rngs::OsRng))
    }

    /// Create a secret from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    /// Derive the corresponding public key.
    #[must_use]
    pub fn public_key(&self) -> C25519Public {
        C25519Public(PublicKey::from(&self.0))
    }

    /// Raw X25519 scalar multiplication with the peer's public key.
    ///
    /// Both directions agree: `a.raw_agree(&B) == b.raw_agree(&A)`.
    #[must_use]
    pub fn raw_agree(&self, their_public: &C25519Public) -> [u8; 32] {
        *self.0.diffie_hellman(&their_public.0).as_bytes()
    }

    /// Derive the 32-byte symmetric session key shared with a peer.
    ///
    /// The raw agreement output is not uniformly distributed, so it is run
    /// through SHA-512 and the first 32 bytes taken as the key.
    #[must_use]
    pub fn shared_key(&self, their_public: &C25519Public) -> [u8; 32] {
        let raw = self.raw_agree(their_public);
        let digest = Sha512::digest(raw);
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest[..32]);
        key
    }

    /// Extract the raw 32-byte secret material.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }
}

/// A Curve25519 public key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct C25519Public(PublicKey);

impl C25519Public {
    /// Create a public key from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(PublicKey::from(bytes))
    }

    /// Extract the raw 32-byte public key.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        *self.0.as_bytes()
    }
}

impl From<[u8; 32]> for C25519Public {
    fn from(bytes: [u8; 32]) -> Self {
        Self::from_bytes(bytes)
    }
}

impl AsRef<[u8]> for C25519Public {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_key_symmetry() {
        let a = C25519Secret::generate();
        let b = C25519Secret::generate();
        let key_ab = a.shared_key(&b.public_key());
        let key_ba = b.shared_key(&a.public_key());
        assert_eq!(key_ab, key_ba);
    }

    #[test]
    fn shared_key_is_kdf_of_raw() {
        let a = C25519Secret::from_bytes([0x11; 32]);
        let b = C25519Secret::from_bytes([0x22; 32]);
        let raw = a.raw_agree(&b.public_key());
        let digest = Sha512::digest(raw);
        assert_eq!(a.shared_key(&b.public_key()), digest[..32]);
    }

    #[test]
    fn distinct_peers_yield_distinct_keys() {
        let a = C25519Secret::from_bytes([0x01; 32]);
        let b = C25519Secret::from_bytes([0x02; 32]);
        let c = C25519Secret::from_bytes([0x03; 32]);
        let pub_c = c.public_key();
        assert_ne!(a.shared_key(&pub_c), b.shared_key(&pub_c));
    }

    #[test]
    fn secret_roundtrip_preserves_public() {
        let secret = C25519Secret::generate();
        let restored = C25519Secret::from_bytes(secret.to_bytes());
        assert_eq!(secret.public_key(), restored.public_key());
    }

    #[test]
    fn public_roundtrip() {
        let public = C25519Secret::generate().public_key();
        let restored = C25519Public::from_bytes(public.to_bytes());
        assert_eq!(public, restored);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn agreement_symmetry(seed_a in any::<[u8; 32]>(), seed_b in any::<[u8; 32]>()) {
            let a = C25519Secret::from_bytes(seed_a);
            let b = C25519Secret::from_bytes(seed_b);
            prop_assert_eq!(a.shared_key(&b.public_key()), b.shared_key(&a.public_key()));
        }
    }
}
