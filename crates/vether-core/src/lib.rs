//! Identity, wire types, and the VL1 packet codec.
//!
//! This crate is the bit-exact layer of the engine: 40-bit node addresses
//! bound to key pairs by proof of work, the authenticated (and optionally
//! encrypted) VL1 packet format with its fragmentation framing, the endpoint
//! wire codec, and the signed world (root roster) format. Nothing here keeps
//! state or performs I/O.

pub mod constants;
pub mod endpoint;
pub mod error;
pub mod identity;
pub mod packet;
pub mod types;
pub mod verb;
pub mod world;

pub use error::{IdentityError, WireError, WorldError};
pub use types::{Address, Mac, NetworkId, PacketId};
