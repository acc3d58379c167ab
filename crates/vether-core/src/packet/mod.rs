//! VL1 packet serialization, authentication, encryption, and fragmentation.

pub mod fragment;
pub mod wire;

pub use fragment::{fragment_packet, is_fragment, Fragment};
pub use wire::{CipherSuite, Packet};
