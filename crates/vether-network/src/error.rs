//! VL2 error types.

use vether_core::{NetworkId, WireError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    #[error("malformed network config: {0}")]
    MalformedConfig(&'static str),

    #[error("config signature invalid")]
    BadSignature,

    #[error("config is for network {actual}, expected {expected}")]
    WrongNetwork {
        expected: NetworkId,
        actual: NetworkId,
    },

    #[error("config revision {candidate} is older than {current}")]
    RevisionRollback { current: u64, candidate: u64 },

    #[error("config issued to a different node")]
    NotIssuedToUs,

    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    #[error("malformed certificate: {0}")]
    Malformed(&'static str),

    #[error("certificate signature invalid")]
    BadSignature,

    #[error("certificate not signed by the network controller")]
    WrongSigner,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        let err = NetworkError::RevisionRollback {
            current: 9,
            candidate: 3,
        };
        assert_eq!(err.to_string(), "config revision 3 is older than 9");

        let err = NetworkError::WrongNetwork {
            expected: NetworkId::from_u64(1),
            actual: NetworkId::from_u64(2),
        };
        assert!(err.to_string().contains("0000000000000002"));
    }

    #[test]
    fn credential_into_network_error() {
        let err: NetworkError = CredentialError::BadSignature.into();
        assert!(matches!(err, NetworkError::Credential(_)));
    }
}
