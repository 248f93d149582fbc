//! HMAC-SHA2 message authentication for BIB-HMAC-SHA2 (RFC 9173 §3).
//!
//! Provides compute and constant-time verify for the three COSE HMAC
//! variants using the `hmac` crate with `sha2` digests.

use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha384, Sha512};

use crate::CryptoError;

type HmacSha256 = Hmac<Sha256>;
type HmacSha384 = Hmac<Sha384>;
type HmacSha512 = Hmac<Sha512>;

/// Compute the HMAC-SHA-256 of `data` using the given `key`.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Compute the HMAC-SHA-384 of `data` using the given `key`.
pub fn hmac_sha384(key: &[u8], data: &[u8]) -> [u8; 48] {
    let mut mac = HmacSha384::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Compute the HMAC-SHA-512 of `data` using the given `key`.
pub fn hmac_sha512(key: &[u8], data: &[u8]) -> [u8; 64] {
    let mut mac = HmacSha512::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Verify an HMAC-SHA-256 in constant time.
pub fn hmac_sha256_verify(key: &[u8], data: &[u8], expected: &[u8]) -> Result<(), CryptoError> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.verify_slice(expected).map_err(|_| CryptoError::InvalidHmac)
}

/// Verify an HMAC-SHA-384 in constant time.
pub fn hmac_sha384_verify(key: &[u8], data: &[u8], expected: &[u8]) -> Result<(), CryptoError> {
    let mut mac = HmacSha384::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.verify_slice(expected).map_err(|_| CryptoError::InvalidHmac)
}

/// Verify an HMAC-SHA-512 in constant time.
pub fn hmac_sha512_verify(key: &[u8], data: &[u8], expected: &[u8]) -> Result<(), CryptoError> {
    let mut mac = HmacSha512::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.verify_slice(expected).map_err(|_| CryptoError::InvalidHmac)
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 4231 test case 2 ("what do ya want for nothing?", key "Jefe")
    const RFC4231_KEY: &[u8] = b"Jefe";
    const RFC4231_DATA: &[u8] = b"what do ya want for nothing?";

    #[test]
    fn test_hmac_sha256_rfc4231_vector() {
        let expected =
            hex::decode("5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843")
                .unwrap();
        assert_eq!(hmac_sha256(RFC4231_KEY, RFC4231_DATA).as_slice(), expected);
    }

    #[test]
    fn test_hmac_sha384_rfc4231_vector() {
        let expected = hex::decode(
            "af45d2e376484031617f78d2b58a6b1b9c7ef464f5a01b47e42ec3736322445e8e2240ca5e69e2c78b3239ecfab21649",
        )
        .unwrap();
        assert_eq!(hmac_sha384(RFC4231_KEY, RFC4231_DATA).as_slice(), expected);
    }

    #[test]
    fn test_hmac_sha512_rfc4231_vector() {
        let expected = hex::decode(
            "164b7a7bfcf819e2e395fbe73b56e0a387bd64222e831fd610270cd7ea2505549758bf75c05a994a6d034f65f8f0e6fdcaeab1a34d4a6b4b636e070a38bce737",
        )
        .unwrap();
        assert_eq!(hmac_sha512(RFC4231_KEY, RFC4231_DATA).as_slice(), expected);
    }

    #[test]
    fn test_verify_accepts_valid_and_rejects_tampered() {
        let key = [0x0b; 20];
        let data = b"Hi There";

        let mac = hmac_sha384(&key, data);
        assert!(hmac_sha384_verify(&key, data, &mac).is_ok());

        let mut bad = mac;
        bad[0] ^= 0xff;
        assert_eq!(
            hmac_sha384_verify(&key, data, &bad),
            Err(CryptoError::InvalidHmac)
        );
    }

    #[test]
    fn test_verify_wrong_key() {
        let mac = hmac_sha512(&[0xaa; 32], b"data");
        assert_eq!(
            hmac_sha512_verify(&[0xbb; 32], b"data", &mac),
            Err(CryptoError::InvalidHmac)
        );
    }

    #[test]
    fn test_verify_truncated_digest_rejected() {
        let key = [0xcc; 32];
        let mac = hmac_sha256(&key, b"data");
        assert_eq!(
            hmac_sha256_verify(&key, b"data", &mac[..16]),
            Err(CryptoError::InvalidHmac)
        );
    }
}
