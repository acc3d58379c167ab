//! Crypto error types.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key encoding")]
    InvalidPublicKey,

    #[error("message authentication failed")]
    MacMismatch,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_all_variants() {
        let variants = vec![
            CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 31,
            },
            CryptoError::InvalidSignature,
            CryptoError::InvalidPublicKey,
            CryptoError::MacMismatch,
        ];
        for v in &variants {
            assert!(!v.to_string().is_empty(), "{v:?} should have a message");
        }
    }
}
