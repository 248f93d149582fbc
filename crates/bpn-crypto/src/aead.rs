//! AES-GCM authenticated encryption for BCB-AES-GCM (RFC 9173 §4).
//!
//! Ciphertext replaces plaintext in place (same length) and the 16-byte
//! authentication tag is detached, matching the BCB wire layout where the
//! tag travels as a security result. Both RFC 9173 IV lengths (12 and 16
//! bytes) and key lengths (128 and 256 bit) are supported.

use aes::{Aes128, Aes256};
use aes_gcm::aead::generic_array::typenum::{U12, U16};
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::AeadInPlace;
use aes_gcm::{AesGcm, KeyInit};

use crate::CryptoError;

/// Detached AES-GCM authentication tag length.
pub const TAG_LEN: usize = 16;

fn encrypt_with<C>(
    key: &[u8],
    iv: &[u8],
    aad: &[u8],
    buffer: &mut [u8],
) -> Result<[u8; TAG_LEN], CryptoError>
where
    C: KeyInit + AeadInPlace,
{
    let cipher = C::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength {
        expected: 32,
        actual: key.len(),
    })?;
    let nonce = GenericArray::from_slice(iv);
    let tag = cipher
        .encrypt_in_place_detached(nonce, aad, buffer)
        .map_err(|_| CryptoError::DecryptionFailed)?;
    let mut out = [0u8; TAG_LEN];
    out.copy_from_slice(&tag);
    Ok(out)
}

fn decrypt_with<C>(
    key: &[u8],
    iv: &[u8],
    aad: &[u8],
    buffer: &mut [u8],
    tag: &[u8],
) -> Result<(), CryptoError>
where
    C: KeyInit + AeadInPlace,
{
    if tag.len() != TAG_LEN {
        return Err(CryptoError::InvalidLength {
            reason: "AES-GCM tag must be 16 bytes",
        });
    }
    let cipher = C::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength {
        expected: 32,
        actual: key.len(),
    })?;
    let nonce = GenericArray::from_slice(iv);
    cipher
        .decrypt_in_place_detached(nonce, aad, buffer, GenericArray::from_slice(tag))
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Encrypt `buffer` in place, returning the detached tag.
///
/// The key selects the AES variant (16 bytes ⇒ AES-128, 32 ⇒ AES-256) and
/// the IV must be 12 or 16 bytes.
pub fn aes_gcm_encrypt(
    key: &[u8],
    iv: &[u8],
    aad: &[u8],
    buffer: &mut [u8],
) -> Result<[u8; TAG_LEN], CryptoError> {
    match (key.len(), iv.len()) {
        (16, 12) => encrypt_with::<AesGcm<Aes128, U12>>(key, iv, aad, buffer),
        (32, 12) => encrypt_with::<AesGcm<Aes256, U12>>(key, iv, aad, buffer),
        (16, 16) => encrypt_with::<AesGcm<Aes128, U16>>(key, iv, aad, buffer),
        (32, 16) => encrypt_with::<AesGcm<Aes256, U16>>(key, iv, aad, buffer),
        (16 | 32, n) => Err(CryptoError::InvalidIvLength { actual: n }),
        (n, _) => Err(CryptoError::InvalidKeyLength {
            expected: 32,
            actual: n,
        }),
    }
}

/// Decrypt `buffer` in place, authenticating against the detached `tag`.
pub fn aes_gcm_decrypt(
    key: &[u8],
    iv: &[u8],
    aad: &[u8],
    buffer: &mut [u8],
    tag: &[u8],
) -> Result<(), CryptoError> {
    match (key.len(), iv.len()) {
        (16, 12) => decrypt_with::<AesGcm<Aes128, U12>>(key, iv, aad, buffer, tag),
        (32, 12) => decrypt_with::<AesGcm<Aes256, U12>>(key, iv, aad, buffer, tag),
        (16, 16) => decrypt_with::<AesGcm<Aes128, U16>>(key, iv, aad, buffer, tag),
        (32, 16) => decrypt_with::<AesGcm<Aes256, U16>>(key, iv, aad, buffer, tag),
        (16 | 32, n) => Err(CryptoError::InvalidIvLength { actual: n }),
        (n, _) => Err(CryptoError::InvalidKeyLength {
            expected: 32,
            actual: n,
        }),
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn gcm_roundtrip(
            key in any::<[u8; 32]>(),
            iv in any::<[u8; 12]>(),
            aad in proptest::collection::vec(any::<u8>(), 0..64),
            plaintext in proptest::collection::vec(any::<u8>(), 0..256),
        ) {
            let mut buf = plaintext.clone();
            let tag = aes_gcm_encrypt(&key, &iv, &aad, &mut buf).unwrap();
            aes_gcm_decrypt(&key, &iv, &aad, &mut buf, &tag).unwrap();
            prop_assert_eq!(buf, plaintext);
        }
    }
}
