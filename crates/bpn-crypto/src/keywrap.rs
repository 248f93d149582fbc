//! AES Key Wrap (RFC 3394) for BPSec wrapped-key parameters.
//!
//! Built directly on the `aes` block cipher. The wrapped output is 8 bytes
//! longer than the input key; unwrap verifies the integrity check value and
//! fails on any tampering or KEK mismatch.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256};

use crate::CryptoError;

/// RFC 3394 §2.2.3 initial value.
const IV: u64 = 0xa6a6_a6a6_a6a6_a6a6;

fn wrap_with<C: BlockEncrypt + KeyInit>(kek: &[u8], key_data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if key_data.len() < 16 || key_data.len() % 8 != 0 {
        return Err(CryptoError::InvalidLength {
            reason: "key data must be a multiple of 8 bytes, at least 16",
        });
    }
    let cipher = C::new_from_slice(kek).map_err(|_| CryptoError::InvalidKeyLength {
        expected: 32,
        actual: kek.len(),
    })?;
    let n = key_data.len() / 8;
    let mut a = IV;
    let mut r: Vec<[u8; 8]> = key_data
        .chunks_exact(8)
        .map(|c| c.try_into().expect("chunks_exact yields 8-byte chunks"))
        .collect();

    let mut block = [0u8; 16];
    for j in 0..6u64 {
        for (i, ri) in r.iter_mut().enumerate() {
            block[..8].copy_from_slice(&a.to_be_bytes());
            block[8..].copy_from_slice(ri);
            cipher.encrypt_block(GenericArray::from_mut_slice(&mut block));
            let t = (n as u64) * j + (i as u64) + 1;
            a = u64::from_be_bytes(block[..8].try_into().unwrap()) ^ t;
            ri.copy_from_slice(&block[8..]);
        }
    }

    let mut out = Vec::with_capacity(8 + key_data.len());
    out.extend_from_slice(&a.to_be_bytes());
    for ri in &r {
        out.extend_from_slice(ri);
    }
    Ok(out)
}

fn unwrap_with<C: BlockDecrypt + KeyInit>(kek: &[u8], wrapped: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if wrapped.len() < 24 || wrapped.len() % 8 != 0 {
        return Err(CryptoError::InvalidLength {
            reason: "wrapped key must be a multiple of 8 bytes, at least 24",
        });
    }
    let cipher = C::new_from_slice(kek).map_err(|_| CryptoError::InvalidKeyLength {
        expected: 32,
        actual: kek.len(),
    })?;
    let n = wrapped.len() / 8 - 1;
    let mut a = u64::from_be_bytes(wrapped[..8].try_into().unwrap());
    let mut r: Vec<[u8; 8]> = wrapped[8..]
        .chunks_exact(8)
        .map(|c| c.try_into().expect("chunks_exact yields 8-byte chunks"))
        .collect();

    let mut block = [0u8; 16];
    for j in (0..6u64).rev() {
        for i in (0..n).rev() {
            let t = (n as u64) * j + (i as u64) + 1;
            block[..8].copy_from_slice(&(a ^ t).to_be_bytes());
            block[8..].copy_from_slice(&r[i]);
            cipher.decrypt_block(GenericArray::from_mut_slice(&mut block));
            a = u64::from_be_bytes(block[..8].try_into().unwrap());
            r[i].copy_from_slice(&block[8..]);
        }
    }

    if a != IV {
        return Err(CryptoError::UnwrapFailed);
    }
    let mut out = Vec::with_capacity(n * 8);
    for ri in &r {
        out.extend_from_slice(ri);
    }
    Ok(out)
}

/// Wrap `key_data` under the key-encryption key `kek` (16/24/32 bytes).
pub fn aes_key_wrap(kek: &[u8], key_data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    match kek.len() {
        16 => wrap_with::<Aes128>(kek, key_data),
        24 => wrap_with::<Aes192>(kek, key_data),
        32 => wrap_with::<Aes256>(kek, key_data),
        n => Err(CryptoError::InvalidKeyLength {
            expected: 32,
            actual: n,
        }),
    }
}

/// Unwrap a wrapped key under `kek`, verifying the integrity check value.
pub fn aes_key_unwrap(kek: &[u8], wrapped: &[u8]) -> Result<Vec<u8>, CryptoError> {
    match kek.len() {
        16 => unwrap_with::<Aes128>(kek, wrapped),
        24 => unwrap_with::<Aes192>(kek, wrapped),
        32 => unwrap_with::<Aes256>(kek, wrapped),
        n => Err(CryptoError::InvalidKeyLength {
            expected: 32,
            actual: n,
        }),
    }
}
