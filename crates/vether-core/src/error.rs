//! Error types for the wire layer.

use vether_crypto::CryptoError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("buffer too short: need {min} bytes, got {actual}")]
    TooShort { min: usize, actual: usize },

    #[error("unknown cipher suite: {0}")]
    InvalidCipher(u8),

    #[error("packet authentication failed")]
    Unauthenticated,

    #[error("not a fragment")]
    NotAFragment,

    #[error("invalid fragment numbering: {no} of {total}")]
    InvalidFragmentNumbering { no: u8, total: u8 },

    #[error("payload exceeds the fragmentable maximum: {0} bytes")]
    TooLarge(usize),

    #[error("invalid endpoint type: {0}")]
    InvalidEndpointType(u8),

    #[error("malformed message: {0}")]
    Malformed(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("address derivation proof of work not satisfied")]
    BadProofOfWork,

    #[error("derived address is reserved")]
    ReservedAddress,

    #[error("identity has no secret key")]
    NoSecret,

    #[error("unknown identity type: {0}")]
    UnknownType(u8),

    #[error("malformed identity: {0}")]
    Malformed(&'static str),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorldError {
    #[error("malformed world: {0}")]
    Malformed(&'static str),

    #[error("too many roots: {0}")]
    TooManyRoots(usize),

    #[error("world signature invalid")]
    BadSignature,

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),
}
