//! Salsa20/12 stream cipher.
//!
//! The VL1 packet cipher. A [`Salsa12Stream`] is keyed per packet from the
//! peer session key and the packet id; the first 32 bytes of keystream become
//! the Poly1305 key and payload encryption consumes the stream from there.

use salsa20::cipher::{KeyIvInit, StreamCipher};
use salsa20::Salsa12;

/// A Salsa20/12 keystream positioned at counter zero.
pub struct Salsa12Stream {
    inner: Salsa12,
}

impl Salsa12Stream {
    /// Create a stream from a 32-byte key and a 64-bit IV.
    #[must_use]
    pub fn new(key: &[u8; 32], iv: &[u8; 8]) -> Self {
        Self {
            inner: Salsa12::new(key.into(), iv.into()),
        }
    }

    /// XOR the next keystream bytes into `data` in place.
    ///
    /// Sequential calls continue the stream; encrypt and decrypt are the
    /// same operation.
    pub fn apply(&mut self, data: &mut [u8]) {
        self.inner.apply_keystream(data);
    }

    /// Produce the next `out.len()` raw keystream bytes.
    pub fn keystream(&mut self, out: &mut [u8]) {
        out.fill(0);
        self.inner.apply_keystream(out);
    }
}
