//! SHA-512 hashing.

use sha2::{Digest, Sha512};

/// Compute the SHA-512 digest of the given data.
#[must_use]
pub fn sha512(data: &[u8]) -> [u8; 64] {
    let mut hasher = Sha512::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// A streaming SHA-512 hasher for incremental input.
pub struct Sha512Hasher {
    inner: Sha512,
}

impl Sha512Hasher {
    pub fn new() -> Self {
        Self {
            inner: Sha512::new(),
        }
    }

    /// Feed more data into the hasher.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Consume the hasher and return the final digest.
    #[must_use]
    pub fn finalize(self) -> [u8; 64] {
        self.inner.finalize().into()
    }
}

impl Default for Sha512Hasher {
    fn default() -> Self {
        Self::new()
    }
}
