//! The cryptographic bundle processor: adds, verifies, and consumes
//! BIB-HMAC-SHA2 and BCB-AES-GCM blocks on a bundle view (RFC 9173).
//!
//! Receive-side entry points return per-target [`SopError`] lists ordered
//! greatest-to-least by target index; this ordering is a contract with the
//! failure-action dispatcher, which removes failed operations in place
//! without shifting the indices of operations still to be processed.

use std::collections::BTreeSet;

use rand::rngs::OsRng;
use rand::RngCore;

use bpn_core::block::{BlockFlags, BlockType, CanonicalBlock};
use bpn_core::security::{
    self, AbstractSecurityBlock, ParamValue, CONTEXT_BCB_AES_GCM, CONTEXT_BIB_HMAC_SHA2,
    RESULT_ID_PRIMARY,
};
use bpn_core::{cbor, AesVariant, BundleView, CrcType, Eid, ShaVariant};
use bpn_crypto::{aead, hmac, keywrap};

use crate::error::{BpSecError, SopError, SopErrorCode};

/// Scope flag: include the primary block in the IPPT / AAD.
pub const SCOPE_INCLUDE_PRIMARY_BLOCK: u64 = 0x01;
/// Scope flag: include the target block header.
pub const SCOPE_INCLUDE_TARGET_HEADER: u64 = 0x02;
/// Scope flag: include the security block header.
pub const SCOPE_INCLUDE_SECURITY_HEADER: u64 = 0x04;

/// Expectations checked against a received BIB.
#[derive(Debug)]
pub struct IntegrityReceivedParams<'a> {
    pub key_encryption_key: Option<&'a [u8]>,
    pub hmac_key: Option<&'a [u8]>,
    pub expected_variant: ShaVariant,
    pub expected_scope_mask: u64,
    /// Bit `b` set ⇔ block type `b` is an allowed target.
    pub expected_target_block_types_mask: u64,
}

/// Expectations checked against a received BCB.
#[derive(Debug)]
pub struct ConfidentialityReceivedParams<'a> {
    pub key_encryption_key: Option<&'a [u8]>,
    pub data_encryption_key: Option<&'a [u8]>,
    pub expected_iv_length: usize,
    pub expected_variant: AesVariant,
    pub expected_aad_scope_mask: u64,
    pub expected_target_block_types_mask: u64,
}

/// Build the allowed-target-types bitmask from a policy's block-type set.
#[must_use]
pub fn block_type_mask(targets: &BTreeSet<u64>) -> u64 {
    let mut mask = 0u64;
    for &t in targets {
        if t < 64 {
            mask |= 1u64 << t;
        }
    }
    mask
}

/// Append the scope-flag-dependent prefix shared by IPPT and AAD.
fn append_scope_data(
    out: &mut Vec<u8>,
    scope_flags: u64,
    bv: &BundleView,
    target: Option<&CanonicalBlock>,
    security_header: Option<(u64, u64, u64)>,
) {
    cbor::encode_uint(out, scope_flags);
    if scope_flags & SCOPE_INCLUDE_PRIMARY_BLOCK != 0 {
        bv.primary.encode(out);
    }
    if scope_flags & SCOPE_INCLUDE_TARGET_HEADER != 0 {
        if let Some(t) = target {
            cbor::encode_uint(out, t.block_type.code());
            cbor::encode_uint(out, t.block_number);
            cbor::encode_uint(out, t.flags.0);
        }
    }
    if scope_flags & SCOPE_INCLUDE_SECURITY_HEADER != 0 {
        if let Some((block_type, block_number, flags)) = security_header {
            cbor::encode_uint(out, block_type);
            cbor::encode_uint(out, block_number);
            cbor::encode_uint(out, flags);
        }
    }
}

/// The integrity-protected plaintext for one BIB target.
fn build_ippt(
    scope_flags: u64,
    bv: &BundleView,
    target: &CanonicalBlock,
    security_header: (u64, u64, u64),
) -> Vec<u8> {
    let mut ippt = Vec::with_capacity(64 + target.data.len());
    append_scope_data(&mut ippt, scope_flags, bv, Some(target), Some(security_header));
    cbor::encode_bytes(&mut ippt, &target.data);
    ippt
}

/// The additional authenticated data for one BCB target.
fn build_aad(
    scope_flags: u64,
    bv: &BundleView,
    target: &CanonicalBlock,
    security_header: (u64, u64, u64),
) -> Vec<u8> {
    let mut aad = Vec::with_capacity(64);
    append_scope_data(&mut aad, scope_flags, bv, Some(target), Some(security_header));
    aad
}

fn compute_hmac(variant: ShaVariant, key: &[u8], data: &[u8]) -> Vec<u8> {
    match variant {
        ShaVariant::HmacSha256 => hmac::hmac_sha256(key, data).to_vec(),
        ShaVariant::HmacSha384 => hmac::hmac_sha384(key, data).to_vec(),
        ShaVariant::HmacSha512 => hmac::hmac_sha512(key, data).to_vec(),
    }
}

fn verify_hmac(variant: ShaVariant, key: &[u8], data: &[u8], expected: &[u8]) -> bool {
    match variant {
        ShaVariant::HmacSha256 => hmac::hmac_sha256_verify(key, data, expected).is_ok(),
        ShaVariant::HmacSha384 => hmac::hmac_sha384_verify(key, data, expected).is_ok(),
        ShaVariant::HmacSha512 => hmac::hmac_sha512_verify(key, data, expected).is_ok(),
    }
}

/// Resolve the operative key on the receive side.
///
/// A wrapped-key parameter requires a configured KEK; without a wrapped key
/// the direct key must be configured.
fn resolve_received_key(
    wrapped: Option<&[u8]>,
    key_encryption_key: Option<&[u8]>,
    direct_key: Option<&[u8]>,
) -> Result<Vec<u8>, SopError> {
    match wrapped {
        Some(wrapped) => match key_encryption_key {
            Some(kek) => keywrap::aes_key_unwrap(kek, wrapped).map_err(|e| {
                SopError::new(
                    SopErrorCode::Corrupted,
                    None,
                    format!("wrapped key unwrap failed: {e}"),
                )
            }),
            None => Err(SopError::new(
                SopErrorCode::Misconfigured,
                None,
                "block carries a wrapped key but no key-encryption key is configured",
            )),
        },
        None => direct_key.map(<[u8]>::to_vec).ok_or_else(|| {
            SopError::new(
                SopErrorCode::Misconfigured,
                None,
                "no wrapped key in block and no direct key configured",
            )
        }),
    }
}

fn target_allowed(mask: u64, block_type: u64) -> bool {
    block_type < 64 && mask & (1u64 << block_type) != 0
}

/// Verify (and as acceptor, consume) one received BIB.
///
/// With `mark_bib_for_deletion` the BIB view is marked for deletion when
/// every operation verifies (the acceptor removes the block); verifiers
/// leave the BIB in place. Errors never mutate the bundle.
pub fn verify_bib(
    bv: &mut BundleView,
    bib_index: usize,
    asb: &AbstractSecurityBlock,
    params: &IntegrityReceivedParams<'_>,
    mark_bib_for_deletion: bool,
) -> Vec<SopError> {
    let key = match resolve_received_key(
        asb.wrapped_key(),
        params.key_encryption_key,
        params.hmac_key,
    ) {
        Ok(key) => key,
        Err(e) => return vec![e],
    };
    match asb.sha_variant() {
        Some(variant) if variant == params.expected_variant => {}
        other => {
            return vec![SopError::new(
                SopErrorCode::Misconfigured,
                None,
                format!(
                    "BIB SHA variant {other:?} does not match expected {:?}",
                    params.expected_variant
                ),
            )]
        }
    }
    if asb.scope_flags() != params.expected_scope_mask {
        return vec![SopError::new(
            SopErrorCode::Misconfigured,
            None,
            format!(
                "BIB scope flags {:#x} do not match expected {:#x}",
                asb.scope_flags(),
                params.expected_scope_mask
            ),
        )];
    }

    let security_header = {
        let view = &bv.blocks[bib_index].block;
        (view.block_type.code(), view.block_number, view.flags.0)
    };

    let mut errors = Vec::new();
    for i in (0..asb.security_targets.len()).rev() {
        let target_number = asb.security_targets[i];
        let Some(target_view) = bv.block_by_number(target_number) else {
            errors.push(SopError::new(
                SopErrorCode::Misconfigured,
                Some(i),
                format!("integrity target block {target_number} not found"),
            ));
            continue;
        };
        let target = &target_view.block;
        if !target_allowed(params.expected_target_block_types_mask, target.block_type.code()) {
            errors.push(SopError::new(
                SopErrorCode::Misconfigured,
                Some(i),
                format!(
                    "block type {} is not an allowed integrity target",
                    target.block_type.code()
                ),
            ));
            continue;
        }
        let Some(expected_mac) = asb.primary_result(i) else {
            errors.push(SopError::new(
                SopErrorCode::Misconfigured,
                Some(i),
                "BIB carries no HMAC result for this target",
            ));
            continue;
        };
        let ippt = build_ippt(asb.scope_flags(), bv, target, security_header);
        if !verify_hmac(params.expected_variant, &key, &ippt, expected_mac) {
            errors.push(SopError::new(
                SopErrorCode::Corrupted,
                Some(i),
                format!("HMAC mismatch on target block {target_number}"),
            ));
        }
    }

    if errors.is_empty() && mark_bib_for_deletion {
        bv.blocks[bib_index].marked_for_deletion = true;
    }
    errors
}

/// Decrypt (or as verifier, check decryptability of) one received BCB.
///
/// As acceptor (`verify_only == false`) each target's ciphertext is replaced
/// by its plaintext and, when every operation succeeds, the BCB view is
/// marked for deletion. As verifier the bundle is left exactly as received.
pub fn decrypt_bcb(
    bv: &mut BundleView,
    bcb_index: usize,
    asb: &AbstractSecurityBlock,
    params: &ConfidentialityReceivedParams<'_>,
    verify_only: bool,
) -> Vec<SopError> {
    let key = match resolve_received_key(
        asb.wrapped_key(),
        params.key_encryption_key,
        params.data_encryption_key,
    ) {
        Ok(key) => key,
        Err(e) => return vec![e],
    };
    match asb.aes_variant() {
        Some(variant) if variant == params.expected_variant => {}
        other => {
            return vec![SopError::new(
                SopErrorCode::Misconfigured,
                None,
                format!(
                    "BCB AES variant {other:?} does not match expected {:?}",
                    params.expected_variant
                ),
            )]
        }
    }
    if key.len() != params.expected_variant.key_len() {
        return vec![SopError::new(
            SopErrorCode::Misconfigured,
            None,
            format!(
                "data encryption key is {} bytes but variant needs {}",
                key.len(),
                params.expected_variant.key_len()
            ),
        )];
    }
    let Some(iv) = asb.iv() else {
        return vec![SopError::new(
            SopErrorCode::Misconfigured,
            None,
            "BCB carries no initialization vector",
        )];
    };
    if iv.len() != params.expected_iv_length {
        return vec![SopError::new(
            SopErrorCode::Misconfigured,
            None,
            format!(
                "IV is {} bytes but policy expects {}",
                iv.len(),
                params.expected_iv_length
            ),
        )];
    }
    if asb.scope_flags() != params.expected_aad_scope_mask {
        return vec![SopError::new(
            SopErrorCode::Misconfigured,
            None,
            format!(
                "BCB AAD scope flags {:#x} do not match expected {:#x}",
                asb.scope_flags(),
                params.expected_aad_scope_mask
            ),
        )];
    }
    let iv = iv.to_vec();

    let security_header = {
        let view = &bv.blocks[bcb_index].block;
        (view.block_type.code(), view.block_number, view.flags.0)
    };

    let mut errors = Vec::new();
    for i in (0..asb.security_targets.len()).rev() {
        let target_number = asb.security_targets[i];
        let Some(target_view) = bv.block_by_number(target_number) else {
            errors.push(SopError::new(
                SopErrorCode::Misconfigured,
                Some(i),
                format!("confidentiality target block {target_number} not found"),
            ));
            continue;
        };
        let target = &target_view.block;
        if !target_allowed(params.expected_target_block_types_mask, target.block_type.code()) {
            errors.push(SopError::new(
                SopErrorCode::Misconfigured,
                Some(i),
                format!(
                    "block type {} is not an allowed confidentiality target",
                    target.block_type.code()
                ),
            ));
            continue;
        }
        let Some(tag) = asb.primary_result(i) else {
            errors.push(SopError::new(
                SopErrorCode::Misconfigured,
                Some(i),
                "BCB carries no authentication tag for this target",
            ));
            continue;
        };
        let aad = build_aad(asb.scope_flags(), bv, target, security_header);
        let mut buffer = target.data.clone();
        let tag = tag.to_vec();
        match aead::aes_gcm_decrypt(&key, &iv, &aad, &mut buffer, &tag) {
            Ok(()) => {
                if !verify_only {
                    let view = bv
                        .block_by_number_mut(target_number)
                        .expect("target looked up above");
                    view.block.data = buffer;
                    view.set_manually_modified();
                }
            }
            Err(e) => {
                errors.push(SopError::new(
                    SopErrorCode::Corrupted,
                    Some(i),
                    format!("decryption of target block {target_number} failed: {e}"),
                ));
            }
        }
    }

    if errors.is_empty() && !verify_only {
        bv.blocks[bcb_index].marked_for_deletion = true;
    }
    errors
}

/// Key material a security source signs or encrypts with: either a direct
/// key, or a KEK under which a fresh session key is wrapped per bundle.
fn resolve_source_key(
    direct_key: Option<&[u8]>,
    key_encryption_key: Option<&[u8]>,
    session_key_len: usize,
    service: &'static str,
) -> Result<(Vec<u8>, Option<Vec<u8>>), BpSecError> {
    if let Some(kek) = key_encryption_key {
        let mut session_key = vec![0u8; session_key_len];
        OsRng.fill_bytes(&mut session_key);
        let wrapped = keywrap::aes_key_wrap(kek, &session_key)?;
        Ok((session_key, Some(wrapped)))
    } else if let Some(key) = direct_key {
        Ok((key.to_vec(), None))
    } else {
        Err(BpSecError::MissingKey(service))
    }
}

/// Add a BIB over `target_block_numbers`, placed immediately after the
/// primary block. Returns the new block's number.
#[allow(clippy::too_many_arguments)]
pub fn add_bib(
    bv: &mut BundleView,
    target_block_numbers: &[u64],
    security_source: Eid,
    variant: ShaVariant,
    scope_mask: u64,
    crc_type: CrcType,
    hmac_key: Option<&[u8]>,
    key_encryption_key: Option<&[u8]>,
) -> Result<u64, BpSecError> {
    let (key, wrapped) =
        resolve_source_key(hmac_key, key_encryption_key, variant.digest_len(), "integrity")?;
    let block_number = bv.next_free_block_number();
    let security_header = (BlockType::INTEGRITY_CODE, block_number, 0u64);

    let mut results = Vec::with_capacity(target_block_numbers.len());
    for &target_number in target_block_numbers {
        let target = &bv
            .block_by_number(target_number)
            .ok_or(BpSecError::TargetBlockNotFound(target_number))?
            .block;
        let ippt = build_ippt(scope_mask, bv, target, security_header);
        let mac = compute_hmac(variant, &key, &ippt);
        results.push(vec![(RESULT_ID_PRIMARY, ParamValue::Bytes(mac))]);
    }

    let mut asb = AbstractSecurityBlock {
        security_targets: target_block_numbers.to_vec(),
        context_id: CONTEXT_BIB_HMAC_SHA2,
        flags: 0,
        security_source,
        parameters: Vec::new(),
        results,
    };
    asb.set_param(
        security::PARAM_BIB_SHA_VARIANT,
        ParamValue::Uint(variant.code()),
    );
    if let Some(wrapped) = wrapped {
        asb.set_param(security::PARAM_BIB_WRAPPED_KEY, ParamValue::Bytes(wrapped));
    }
    asb.set_param(security::PARAM_BIB_SCOPE_FLAGS, ParamValue::Uint(scope_mask));

    let mut data = Vec::new();
    asb.encode(&mut data);
    bv.insert_block_after_primary(CanonicalBlock {
        block_type: BlockType::Integrity,
        block_number,
        flags: BlockFlags::default(),
        crc_type,
        data,
    })?;
    Ok(block_number)
}

/// Add a BCB encrypting `target_block_numbers` in place. Returns the new
/// block's number.
#[allow(clippy::too_many_arguments)]
pub fn add_bcb(
    bv: &mut BundleView,
    target_block_numbers: &[u64],
    security_source: Eid,
    iv: &[u8],
    variant: AesVariant,
    aad_scope_mask: u64,
    crc_type: CrcType,
    data_encryption_key: Option<&[u8]>,
    key_encryption_key: Option<&[u8]>,
) -> Result<u64, BpSecError> {
    let (key, wrapped) = resolve_source_key(
        data_encryption_key,
        key_encryption_key,
        variant.key_len(),
        "confidentiality",
    )?;
    // validate every target before encrypting anything: a partially
    // processed bundle must not be emitted
    for &target_number in target_block_numbers {
        if bv.block_by_number(target_number).is_none() {
            return Err(BpSecError::TargetBlockNotFound(target_number));
        }
    }

    let block_number = bv.next_free_block_number();
    let security_header = (BlockType::CONFIDENTIALITY_CODE, block_number, 0u64);

    let mut results = Vec::with_capacity(target_block_numbers.len());
    for &target_number in target_block_numbers {
        let target = &bv
            .block_by_number(target_number)
            .expect("targets validated above")
            .block;
        let aad = build_aad(aad_scope_mask, bv, target, security_header);
        let mut buffer = target.data.clone();
        let tag = aead::aes_gcm_encrypt(&key, iv, &aad, &mut buffer)?;
        results.push(vec![(RESULT_ID_PRIMARY, ParamValue::Bytes(tag.to_vec()))]);
        let view = bv
            .block_by_number_mut(target_number)
            .expect("targets validated above");
        view.block.data = buffer;
        view.set_manually_modified();
    }

    let mut asb = AbstractSecurityBlock {
        security_targets: target_block_numbers.to_vec(),
        context_id: CONTEXT_BCB_AES_GCM,
        flags: 0,
        security_source,
        parameters: Vec::new(),
        results,
    };
    asb.set_param(security::PARAM_BCB_IV, ParamValue::Bytes(iv.to_vec()));
    asb.set_param(
        security::PARAM_BCB_AES_VARIANT,
        ParamValue::Uint(variant.code()),
    );
    if let Some(wrapped) = wrapped {
        asb.set_param(security::PARAM_BCB_WRAPPED_KEY, ParamValue::Bytes(wrapped));
    }
    asb.set_param(
        security::PARAM_BCB_SCOPE_FLAGS,
        ParamValue::Uint(aad_scope_mask),
    );

    let mut data = Vec::new();
    asb.encode(&mut data);
    // a BCB must be replicated into every fragment (RFC 9172 §3.10)
    bv.insert_block_after_primary(CanonicalBlock {
        block_type: BlockType::Confidentiality,
        block_number,
        flags: BlockFlags(BlockFlags::MUST_BE_REPLICATED),
        crc_type,
        data,
    })?;
    Ok(block_number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpn_core::primary::{BundleFlags, CreationTimestamp};
    use bpn_core::PrimaryBlock;

    fn sample_bundle() -> BundleView {
        let primary = PrimaryBlock {
            flags: BundleFlags::default(),
            crc_type: CrcType::Crc32c,
            destination: Eid::new(2, 1),
            source: Eid::new(1, 1),
            report_to: Eid::NULL,
            creation: CreationTimestamp {
                time_ms: 1_000,
                sequence: 9,
            },
            lifetime_ms: 60_000,
            fragment_offset: None,
            total_adu_length: None,
        };
        BundleView::new(primary, b"secret payload".to_vec(), CrcType::Crc32c)
    }

    fn decode_asb(bv: &BundleView, index: usize) -> AbstractSecurityBlock {
        AbstractSecurityBlock::decode(&bv.blocks[index].block.data).unwrap()
    }

    const HMAC_KEY: [u8; 32] = [0x1b; 32];
    const DEK: [u8; 32] = [0x2c; 32];
    const KEK: [u8; 16] = [0x3d; 16];

    fn integrity_params(key: &[u8]) -> IntegrityReceivedParams<'_> {
        IntegrityReceivedParams {
            key_encryption_key: None,
            hmac_key: Some(key),
            expected_variant: ShaVariant::HmacSha384,
            expected_scope_mask: 0x07,
            expected_target_block_types_mask: 1 << 1,
        }
    }

    #[test]
    fn test_bib_roundtrip_and_acceptor_removal() {
        let mut bv = sample_bundle();
        let bib_number = add_bib(
            &mut bv,
            &[1],
            Eid::new(1, 1),
            ShaVariant::HmacSha384,
            0x07,
            CrcType::None,
            Some(&HMAC_KEY),
            None,
        )
        .unwrap();
        bv.render_in_place();

        let mut received = BundleView::parse(bv.rendered()).unwrap();
        let bib_index = received.block_index_by_number(bib_number).unwrap();
        let asb = decode_asb(&received, bib_index);
        assert_eq!(asb.context_id, CONTEXT_BIB_HMAC_SHA2);

        let errors = verify_bib(&mut received, bib_index, &asb, &integrity_params(&HMAC_KEY), true);
        assert!(errors.is_empty(), "{errors:?}");
        assert!(received.blocks[bib_index].marked_for_deletion);

        received.render_in_place();
        let final_view = BundleView::parse(received.rendered()).unwrap();
        assert!(final_view
            .block_indices_of_type(BlockType::Integrity)
            .is_empty());
        assert_eq!(final_view.payload().unwrap(), b"secret payload");
    }

    #[test]
    fn test_bib_verifier_leaves_block() {
        let mut bv = sample_bundle();
        let bib_number = add_bib(
            &mut bv,
            &[1],
            Eid::new(1, 1),
            ShaVariant::HmacSha512,
            0x07,
            CrcType::None,
            Some(&HMAC_KEY),
            None,
        )
        .unwrap();
        bv.render_in_place();

        let bib_index = bv.block_index_by_number(bib_number).unwrap();
        let asb = decode_asb(&bv, bib_index);
        let params = IntegrityReceivedParams {
            expected_variant: ShaVariant::HmacSha512,
            ..integrity_params(&HMAC_KEY)
        };
        let errors = verify_bib(&mut bv, bib_index, &asb, &params, false);
        assert!(errors.is_empty());
        assert!(!bv.blocks[bib_index].marked_for_deletion);
    }

    #[test]
    fn test_bib_detects_tampered_payload() {
        let mut bv = sample_bundle();
        let bib_number = add_bib(
            &mut bv,
            &[1],
            Eid::new(1, 1),
            ShaVariant::HmacSha384,
            0x07,
            CrcType::None,
            Some(&HMAC_KEY),
            None,
        )
        .unwrap();
        // tamper one payload byte
        bv.block_by_number_mut(1).unwrap().block.data[0] ^= 0x01;

        let bib_index = bv.block_index_by_number(bib_number).unwrap();
        let asb = decode_asb(&bv, bib_index);
        let errors = verify_bib(&mut bv, bib_index, &asb, &integrity_params(&HMAC_KEY), true);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, SopErrorCode::Corrupted);
        assert_eq!(errors[0].target_index, Some(0));
        assert!(!bv.blocks[bib_index].marked_for_deletion);
    }

    #[test]
    fn test_bib_wrong_key_is_corrupted() {
        let mut bv = sample_bundle();
        let bib_number = add_bib(
            &mut bv,
            &[1],
            Eid::new(1, 1),
            ShaVariant::HmacSha384,
            0x07,
            CrcType::None,
            Some(&HMAC_KEY),
            None,
        )
        .unwrap();
        let bib_index = bv.block_index_by_number(bib_number).unwrap();
        let asb = decode_asb(&bv, bib_index);
        let wrong_key = [0xffu8; 32];
        let errors = verify_bib(&mut bv, bib_index, &asb, &integrity_params(&wrong_key), true);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, SopErrorCode::Corrupted);
    }

    #[test]
    fn test_bib_variant_mismatch_is_misconfigured() {
        let mut bv = sample_bundle();
        let bib_number = add_bib(
            &mut bv,
            &[1],
            Eid::new(1, 1),
            ShaVariant::HmacSha256,
            0x07,
            CrcType::None,
            Some(&HMAC_KEY),
            None,
        )
        .unwrap();
        let bib_index = bv.block_index_by_number(bib_number).unwrap();
        let asb = decode_asb(&bv, bib_index);
        let errors = verify_bib(&mut bv, bib_index, &asb, &integrity_params(&HMAC_KEY), true);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, SopErrorCode::Misconfigured);
        assert_eq!(errors[0].target_index, None);
    }

    fn confidentiality_params(dek: &[u8]) -> ConfidentialityReceivedParams<'_> {
        ConfidentialityReceivedParams {
            key_encryption_key: None,
            data_encryption_key: Some(dek),
            expected_iv_length: 12,
            expected_variant: AesVariant::A256Gcm,
            expected_aad_scope_mask: 0x07,
            expected_target_block_types_mask: 1 << 1,
        }
    }

    #[test]
    fn test_bcb_roundtrip_acceptor() {
        let mut bv = sample_bundle();
        let iv = [0x42u8; 12];
        let bcb_number = add_bcb(
            &mut bv,
            &[1],
            Eid::new(1, 1),
            &iv,
            AesVariant::A256Gcm,
            0x07,
            CrcType::None,
            Some(&DEK),
            None,
        )
        .unwrap();
        assert_ne!(bv.payload().unwrap(), b"secret payload");
        bv.render_in_place();

        let mut received = BundleView::parse(bv.rendered()).unwrap();
        let bcb_index = received.block_index_by_number(bcb_number).unwrap();
        let asb = decode_asb(&received, bcb_index);
        let errors = decrypt_bcb(&mut received, bcb_index, &asb, &confidentiality_params(&DEK), false);
        assert!(errors.is_empty(), "{errors:?}");
        assert!(received.blocks[bcb_index].marked_for_deletion);

        received.render_in_place();
        assert_eq!(received.payload().unwrap(), b"secret payload");
        assert!(received
            .block_indices_of_type(BlockType::Confidentiality)
            .is_empty());
    }

    #[test]
    fn test_bcb_verify_only_preserves_ciphertext() {
        let mut bv = sample_bundle();
        let iv = [0x42u8; 12];
        let bcb_number = add_bcb(
            &mut bv,
            &[1],
            Eid::new(1, 1),
            &iv,
            AesVariant::A256Gcm,
            0x07,
            CrcType::None,
            Some(&DEK),
            None,
        )
        .unwrap();
        let ciphertext = bv.payload().unwrap().to_vec();

        let bcb_index = bv.block_index_by_number(bcb_number).unwrap();
        let asb = decode_asb(&bv, bcb_index);
        let errors = decrypt_bcb(&mut bv, bcb_index, &asb, &confidentiality_params(&DEK), true);
        assert!(errors.is_empty());
        assert!(!bv.blocks[bcb_index].marked_for_deletion);
        assert_eq!(bv.payload().unwrap(), ciphertext.as_slice());
    }

    #[test]
    fn test_bcb_wrong_dek_is_corrupted() {
        let mut bv = sample_bundle();
        let iv = [0x42u8; 12];
        let bcb_number = add_bcb(
            &mut bv,
            &[1],
            Eid::new(1, 1),
            &iv,
            AesVariant::A256Gcm,
            0x07,
            CrcType::None,
            Some(&DEK),
            None,
        )
        .unwrap();
        let bcb_index = bv.block_index_by_number(bcb_number).unwrap();
        let asb = decode_asb(&bv, bcb_index);
        let wrong = [0x00u8; 32];
        let errors = decrypt_bcb(&mut bv, bcb_index, &asb, &confidentiality_params(&wrong), false);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, SopErrorCode::Corrupted);
        assert_eq!(errors[0].target_index, Some(0));
    }

    #[test]
    fn test_wrapped_key_roundtrip() {
        let mut bv = sample_bundle();
        let iv = [0x77u8; 16];
        let bcb_number = add_bcb(
            &mut bv,
            &[1],
            Eid::new(1, 1),
            &iv,
            AesVariant::A128Gcm,
            0x05,
            CrcType::None,
            None,
            Some(&KEK),
        )
        .unwrap();
        let bcb_index = bv.block_index_by_number(bcb_number).unwrap();
        let asb = decode_asb(&bv, bcb_index);
        assert!(asb.wrapped_key().is_some());

        let params = ConfidentialityReceivedParams {
            key_encryption_key: Some(&KEK),
            data_encryption_key: None,
            expected_iv_length: 16,
            expected_variant: AesVariant::A128Gcm,
            expected_aad_scope_mask: 0x05,
            expected_target_block_types_mask: 1 << 1,
        };
        let errors = decrypt_bcb(&mut bv, bcb_index, &asb, &params, false);
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(bv.payload().unwrap(), b"secret payload");
    }

    #[test]
    fn test_wrapped_key_without_kek_is_misconfigured() {
        let mut bv = sample_bundle();
        let iv = [0x77u8; 12];
        let bcb_number = add_bcb(
            &mut bv,
            &[1],
            Eid::new(1, 1),
            &iv,
            AesVariant::A256Gcm,
            0x07,
            CrcType::None,
            None,
            Some(&KEK),
        )
        .unwrap();
        let bcb_index = bv.block_index_by_number(bcb_number).unwrap();
        let asb = decode_asb(&bv, bcb_index);
        let errors = decrypt_bcb(&mut bv, bcb_index, &asb, &confidentiality_params(&DEK), false);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, SopErrorCode::Misconfigured);
    }

    #[test]
    fn test_multi_target_errors_are_greatest_to_least() {
        let mut bv = sample_bundle();
        // add a bundle-age block as a second target
        let number = bv.next_free_block_number();
        let mut age = CanonicalBlock {
            block_type: BlockType::BundleAge,
            block_number: number,
            flags: BlockFlags::default(),
            crc_type: CrcType::None,
            data: Vec::new(),
        };
        age.set_data(&bpn_core::BlockData::BundleAge(5));
        bv.push_block(age).unwrap();

        let bib_number = add_bib(
            &mut bv,
            &[1, number],
            Eid::new(1, 1),
            ShaVariant::HmacSha384,
            0x07,
            CrcType::None,
            Some(&HMAC_KEY),
            None,
        )
        .unwrap();
        // tamper both targets
        bv.block_by_number_mut(1).unwrap().block.data[0] ^= 1;
        bv.block_by_number_mut(number).unwrap().block.data[0] ^= 1;

        let bib_index = bv.block_index_by_number(bib_number).unwrap();
        let asb = decode_asb(&bv, bib_index);
        let params = IntegrityReceivedParams {
            expected_target_block_types_mask: (1 << 1) | (1 << 7),
            ..integrity_params(&HMAC_KEY)
        };
        let errors = verify_bib(&mut bv, bib_index, &asb, &params, true);
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].target_index, Some(1));
        assert_eq!(errors[1].target_index, Some(0));
    }

    #[test]
    fn test_missing_target_block_for_add_fails() {
        let mut bv = sample_bundle();
        let err = add_bib(
            &mut bv,
            &[5],
            Eid::new(1, 1),
            ShaVariant::HmacSha384,
            0x07,
            CrcType::None,
            Some(&HMAC_KEY),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, BpSecError::TargetBlockNotFound(5)));
    }
}
