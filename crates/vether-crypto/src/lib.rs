//! Cryptographic primitives for the vether virtual network engine.
//!
//! Everything the wire protocol needs is assembled from five primitives:
//! Curve25519 key agreement, Ed25519 signatures, the Salsa20/12 stream
//! cipher, Poly1305 one-time authentication, and SHA-512. All functions are
//! pure; no primitive touches a clock, a socket, or global state.

pub mod c25519;
pub mod ed25519;
pub mod error;
pub mod memhard;
pub mod poly;
pub mod salsa;
pub mod sha512;

pub use error::CryptoError;
