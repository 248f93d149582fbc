use core::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    InvalidKeyLength { expected: usize, actual: usize },
    InvalidIvLength { actual: usize },
    InvalidHmac,
    DecryptionFailed,
    UnwrapFailed,
    InvalidLength { reason: &'static str },
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::InvalidKeyLength { expected, actual } => {
                write!(f, "invalid key length: expected {expected}, got {actual}")
            }
            CryptoError::InvalidIvLength { actual } => {
                write!(f, "invalid IV length: {actual}")
            }
            CryptoError::InvalidHmac => write!(f, "HMAC verification failed"),
            CryptoError::DecryptionFailed => write!(f, "decryption failed"),
            CryptoError::UnwrapFailed => write!(f, "key unwrap failed"),
            CryptoError::InvalidLength { reason } => write!(f, "invalid length: {reason}"),
        }
    }
}

impl std::error::Error for CryptoError {}
