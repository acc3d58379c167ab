//! Transport layer error types.

use vether_core::{IdentityError, WireError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("peer identity has no agreement key")]
    NoAgreement,

    #[error("address collision: two identities derive {0}")]
    AddressCollision(vether_core::Address),

    #[error("cluster message too long: {0} bytes")]
    ClusterMessageTooLong(usize),

    #[error("cluster message unauthentic or malformed")]
    ClusterMessageInvalid,

    #[error("cluster is full")]
    ClusterFull,
}
