//! Peer/path state and VL1 routing support for the vether engine.
//!
//! Everything in this crate is a synchronous state machine: peers and their
//! candidate underlay paths, the fragment reassembly table, the root
//! topology, the WHOIS scheduler, and the optional cluster facility. Time is
//! a `u64` millisecond value supplied by the caller; no code here reads a
//! clock or touches a socket.

pub mod assembler;
pub mod cluster;
pub mod constants;
pub mod error;
pub mod path;
pub mod peer;
pub mod peer_table;
pub mod topology;
pub mod whois;

pub use error::TransportError;
pub use peer::{Peer, PeerRole};
pub use peer_table::PeerTable;
