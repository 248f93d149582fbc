//! BPSec error types: fatal configuration errors, internal processing
//! errors, and per-target security-operation errors.

use bpn_core::{BundleError, EidError};
use bpn_crypto::CryptoError;

/// Fatal policy-configuration errors, reported at load time.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("invalid EID syntax: {0}")]
    InvalidEidSyntax(#[from] EidError),

    #[error("invalid security role: {0}")]
    InvalidRole(String),

    #[error("invalid security service: {0}")]
    InvalidService(String),

    #[error("duplicate {service} policy for one (source, destination, role) rule")]
    DuplicatePolicy { service: &'static str },

    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("invalid parameter combination: {0}")]
    InvalidParameterCombination(&'static str),

    #[error("policy must be fixed to encrypt the BIB: the BIB shares targets with the BCB")]
    BibMustBeEncrypted,

    #[error("unknown failure event set: {0}")]
    UnknownFailureEventSet(String),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("i/o error reading config: {0}")]
    Io(#[from] std::io::Error),
}

/// Internal processing failures (crypto library, malformed blocks) that
/// abort a pipeline rather than mapping to a failure event.
#[derive(Debug, thiserror::Error)]
pub enum BpSecError {
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("bundle error: {0}")]
    Bundle(#[from] BundleError),

    #[error("security target block {0} not found in bundle")]
    TargetBlockNotFound(u64),

    #[error("no key material available for {0}")]
    MissingKey(&'static str),
}

/// Classification of one failed security operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SopErrorCode {
    /// Signature/tag did not verify: the operation or its target is corrupt.
    Corrupted,
    /// The block's parameters disagree with local policy.
    Misconfigured,
    /// No acceptor policy exists at the final destination.
    Missing,
}

/// One per-target error from the cryptographic bundle processor.
///
/// `target_index` is the index into the ASB's security-target array, or
/// `None` when the error applies to every operation of the block. Error
/// lists are ordered greatest-to-least by target index so in-place removal
/// of failed operations does not shift the remaining indices.
#[derive(Debug, Clone)]
pub struct SopError {
    pub code: SopErrorCode,
    pub target_index: Option<usize>,
    pub reason: String,
}

impl SopError {
    pub fn new(code: SopErrorCode, target_index: Option<usize>, reason: impl Into<String>) -> Self {
        SopError {
            code,
            target_index,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_error_display() {
        let variants: Vec<PolicyError> = vec![
            PolicyError::InvalidRole("observer".into()),
            PolicyError::InvalidService("privacy".into()),
            PolicyError::DuplicatePolicy {
                service: "integrity",
            },
            PolicyError::InvalidKeyMaterial("empty key file".into()),
            PolicyError::InvalidParameterCombination("aesVariant on an integrity rule"),
            PolicyError::BibMustBeEncrypted,
            PolicyError::UnknownFailureEventSet("missing".into()),
        ];
        for v in &variants {
            assert!(!v.to_string().is_empty(), "{v:?} should have non-empty Display");
        }
    }

    #[test]
    fn test_bpsec_error_from_crypto() {
        let e: BpSecError = CryptoError::InvalidHmac.into();
        assert!(matches!(e, BpSecError::Crypto(_)));
    }
}
