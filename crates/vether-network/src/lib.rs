//! Virtual Layer-2 networks over VL1.
//!
//! A node joins 64-bit network ids; the controller named by the id's upper
//! 40 bits issues signed configs and membership certificates. This crate
//! holds the per-network state machine (config adoption, frame admission),
//! the bridge learning table, and the multicast propagation state. Like the
//! rest of the engine it is synchronous and I/O-free.

pub mod bridge;
pub mod com;
pub mod config;
pub mod constants;
pub mod dictionary;
pub mod error;
pub mod multicast;
pub mod network;

pub use com::CertificateOfMembership;
pub use config::{NetworkConfig, NetworkType};
pub use error::{CredentialError, NetworkError};
pub use multicast::{MulticastGroup, Multicaster};
pub use network::{Network, NetworkStatus};
