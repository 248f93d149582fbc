//! Cryptographic primitives for Bundle Protocol security.
//!
//! This crate provides the operations BPSec (RFC 9172 / RFC 9173) needs:
//! HMAC-SHA2 integrity, AES-GCM confidentiality with associated data, and
//! AES Key Wrap for wrapped-key parameters.

pub mod aead;
pub mod error;
pub mod hmac;
pub mod keywrap;

pub use error::CryptoError;
