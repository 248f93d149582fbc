//! Abstract security block codec (RFC 9172) and security context codes.

use crate::cbor;
use crate::eid::Eid;
use crate::error::BundleError;

/// Security context id for BIB-HMAC-SHA2 (RFC 9173 §3).
pub const CONTEXT_BIB_HMAC_SHA2: u64 = 1;
/// Security context id for BCB-AES-GCM (RFC 9173 §4).
pub const CONTEXT_BCB_AES_GCM: u64 = 2;

/// ASB flag bit: security context parameters are present.
pub const FLAG_PARAMETERS_PRESENT: u64 = 0x01;

// BIB-HMAC-SHA2 parameter ids
pub const PARAM_BIB_SHA_VARIANT: u64 = 1;
pub const PARAM_BIB_WRAPPED_KEY: u64 = 2;
pub const PARAM_BIB_SCOPE_FLAGS: u64 = 3;

// BCB-AES-GCM parameter ids
pub const PARAM_BCB_IV: u64 = 1;
pub const PARAM_BCB_AES_VARIANT: u64 = 2;
pub const PARAM_BCB_WRAPPED_KEY: u64 = 3;
pub const PARAM_BCB_SCOPE_FLAGS: u64 = 4;

/// Result id carrying the HMAC (BIB) or authentication tag (BCB).
pub const RESULT_ID_PRIMARY: u64 = 1;

/// COSE HMAC-SHA2 algorithm codes (RFC 9173 §3.3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum ShaVariant {
    HmacSha256,
    HmacSha384,
    HmacSha512,
}

impl ShaVariant {
    #[must_use]
    pub fn code(&self) -> u64 {
        match self {
            ShaVariant::HmacSha256 => 5,
            ShaVariant::HmacSha384 => 6,
            ShaVariant::HmacSha512 => 7,
        }
    }

    #[must_use]
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            5 => Some(ShaVariant::HmacSha256),
            6 => Some(ShaVariant::HmacSha384),
            7 => Some(ShaVariant::HmacSha512),
            _ => None,
        }
    }

    /// Digest length in bytes.
    #[must_use]
    pub fn digest_len(&self) -> usize {
        match self {
            ShaVariant::HmacSha256 => 32,
            ShaVariant::HmacSha384 => 48,
            ShaVariant::HmacSha512 => 64,
        }
    }
}

/// COSE AES-GCM algorithm codes (RFC 9173 §4.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum AesVariant {
    A128Gcm,
    A256Gcm,
}

impl AesVariant {
    #[must_use]
    pub fn code(&self) -> u64 {
        match self {
            AesVariant::A128Gcm => 1,
            AesVariant::A256Gcm => 3,
        }
    }

    #[must_use]
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(AesVariant::A128Gcm),
            3 => Some(AesVariant::A256Gcm),
            _ => None,
        }
    }

    /// Key length in bytes.
    #[must_use]
    pub fn key_len(&self) -> usize {
        match self {
            AesVariant::A128Gcm => 16,
            AesVariant::A256Gcm => 32,
        }
    }
}

/// A security context parameter or result value.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum ParamValue {
    Uint(u64),
    Bytes(Vec<u8>),
}

impl ParamValue {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            ParamValue::Uint(v) => cbor::encode_uint(out, *v),
            ParamValue::Bytes(b) => cbor::encode_bytes(out, b),
        }
    }

    fn decode(rd: &mut cbor::Reader<'_>) -> Result<Self, BundleError> {
        let major = rd.peek()? >> 5;
        if major == cbor::MAJOR_BYTES {
            Ok(ParamValue::Bytes(rd.read_bytes()?.to_vec()))
        } else {
            Ok(ParamValue::Uint(rd.read_uint()?))
        }
    }
}

/// Shared body of a BIB or BCB: targets, context, source, parameters, and
/// per-target results. One target/result pair is one security operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[must_use]
pub struct AbstractSecurityBlock {
    pub security_targets: Vec<u64>,
    pub context_id: u64,
    pub flags: u64,
    pub security_source: Eid,
    pub parameters: Vec<(u64, ParamValue)>,
    /// One entry per security target, in target order.
    pub results: Vec<Vec<(u64, ParamValue)>>,
}

impl AbstractSecurityBlock {
    /// Append the RFC 9172 encoding (content of the block data byte string).
    pub fn encode(&self, out: &mut Vec<u8>) {
        cbor::encode_array_head(out, self.security_targets.len() as u64);
        for target in &self.security_targets {
            cbor::encode_uint(out, *target);
        }
        cbor::encode_uint(out, self.context_id);
        cbor::encode_uint(out, self.flags);
        self.security_source.encode(out);
        if self.flags & FLAG_PARAMETERS_PRESENT != 0 {
            cbor::encode_array_head(out, self.parameters.len() as u64);
            for (id, value) in &self.parameters {
                cbor::encode_array_head(out, 2);
                cbor::encode_uint(out, *id);
                value.encode(out);
            }
        }
        cbor::encode_array_head(out, self.results.len() as u64);
        for target_results in &self.results {
            cbor::encode_array_head(out, target_results.len() as u64);
            for (id, value) in target_results {
                cbor::encode_array_head(out, 2);
                cbor::encode_uint(out, *id);
                value.encode(out);
            }
        }
    }

    /// Decode from the content of a BIB/BCB data byte string.
    pub fn decode(data: &[u8]) -> Result<Self, BundleError> {
        let mut rd = cbor::Reader::new(data);
        let target_count = rd.read_array_head()?;
        let mut security_targets = Vec::with_capacity(target_count as usize);
        for _ in 0..target_count {
            security_targets.push(rd.read_uint()?);
        }
        let context_id = rd.read_uint()?;
        let flags = rd.read_uint()?;
        let security_source = Eid::decode(&mut rd)?;
        let mut parameters = Vec::new();
        if flags & FLAG_PARAMETERS_PRESENT != 0 {
            let param_count = rd.read_array_head()?;
            for _ in 0..param_count {
                if rd.read_array_head()? != 2 {
                    return Err(BundleError::MalformedSecurityBlock("parameter pair arity"));
                }
                let id = rd.read_uint()?;
                parameters.push((id, ParamValue::decode(&mut rd)?));
            }
        }
        let result_count = rd.read_array_head()?;
        if result_count != target_count {
            return Err(BundleError::MalformedSecurityBlock(
                "result set count does not match target count",
            ));
        }
        let mut results = Vec::with_capacity(result_count as usize);
        for _ in 0..result_count {
            let pair_count = rd.read_array_head()?;
            let mut target_results = Vec::with_capacity(pair_count as usize);
            for _ in 0..pair_count {
                if rd.read_array_head()? != 2 {
                    return Err(BundleError::MalformedSecurityBlock("result pair arity"));
                }
                let id = rd.read_uint()?;
                target_results.push((id, ParamValue::decode(&mut rd)?));
            }
            results.push(target_results);
        }
        Ok(AbstractSecurityBlock {
            security_targets,
            context_id,
            flags,
            security_source,
            parameters,
            results,
        })
    }

    /// Look up a parameter by id.
    #[must_use]
    pub fn find_param(&self, id: u64) -> Option<&ParamValue> {
        self.parameters
            .iter()
            .find(|(pid, _)| *pid == id)
            .map(|(_, v)| v)
    }

    /// Set or replace a parameter, keeping the parameters-present flag in sync.
    pub fn set_param(&mut self, id: u64, value: ParamValue) {
        if let Some(slot) = self.parameters.iter_mut().find(|(pid, _)| *pid == id) {
            slot.1 = value;
        } else {
            self.parameters.push((id, value));
        }
        self.flags |= FLAG_PARAMETERS_PRESENT;
    }

    fn param_uint(&self, id: u64) -> Option<u64> {
        match self.find_param(id) {
            Some(ParamValue::Uint(v)) => Some(*v),
            _ => None,
        }
    }

    fn param_bytes(&self, id: u64) -> Option<&[u8]> {
        match self.find_param(id) {
            Some(ParamValue::Bytes(b)) => Some(b.as_slice()),
            _ => None,
        }
    }

    /// Initialization vector (BCB only).
    #[must_use]
    pub fn iv(&self) -> Option<&[u8]> {
        self.param_bytes(PARAM_BCB_IV)
    }

    /// Wrapped key parameter for this block's context.
    #[must_use]
    pub fn wrapped_key(&self) -> Option<&[u8]> {
        match self.context_id {
            CONTEXT_BIB_HMAC_SHA2 => self.param_bytes(PARAM_BIB_WRAPPED_KEY),
            CONTEXT_BCB_AES_GCM => self.param_bytes(PARAM_BCB_WRAPPED_KEY),
            _ => None,
        }
    }

    /// SHA variant parameter (BIB), defaulting to HMAC-SHA-384 per RFC 9173.
    #[must_use]
    pub fn sha_variant(&self) -> Option<ShaVariant> {
        match self.param_uint(PARAM_BIB_SHA_VARIANT) {
            Some(code) => ShaVariant::from_code(code),
            None => Some(ShaVariant::HmacSha384),
        }
    }

    /// AES variant parameter (BCB), defaulting to A256GCM per RFC 9173.
    #[must_use]
    pub fn aes_variant(&self) -> Option<AesVariant> {
        match self.param_uint(PARAM_BCB_AES_VARIANT) {
            Some(code) => AesVariant::from_code(code),
            None => Some(AesVariant::A256Gcm),
        }
    }

    /// Scope flags for this block's context (default all-bits-set per RFC 9173).
    #[must_use]
    pub fn scope_flags(&self) -> u64 {
        let id = match self.context_id {
            CONTEXT_BIB_HMAC_SHA2 => PARAM_BIB_SCOPE_FLAGS,
            _ => PARAM_BCB_SCOPE_FLAGS,
        };
        self.param_uint(id).unwrap_or(0x07)
    }

    /// The primary result bytes (HMAC or tag) for the target at `index`.
    #[must_use]
    pub fn primary_result(&self, index: usize) -> Option<&[u8]> {
        self.results.get(index).and_then(|pairs| {
            pairs.iter().find_map(|(id, v)| match (id, v) {
                (&RESULT_ID_PRIMARY, ParamValue::Bytes(b)) => Some(b.as_slice()),
                _ => None,
            })
        })
    }

    /// Remove the security operation at target `index` (target + result pair).
    pub fn remove_operation(&mut self, index: usize) -> bool {
        if index >= self.security_targets.len() || self.security_targets.len() != self.results.len()
        {
            return false;
        }
        self.security_targets.remove(index);
        self.results.remove(index);
        true
    }

    /// Whether any security operation targets the given block number.
    #[must_use]
    pub fn targets_block_number(&self, block_number: u64) -> bool {
        self.security_targets.contains(&block_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bcb() -> AbstractSecurityBlock {
        let mut asb = AbstractSecurityBlock {
            security_targets: vec![1, 2],
            context_id: CONTEXT_BCB_AES_GCM,
            flags: 0,
            security_source: Eid::new(2, 1),
            parameters: Vec::new(),
            results: vec![
                vec![(RESULT_ID_PRIMARY, ParamValue::Bytes(vec![0xaa; 16]))],
                vec![(RESULT_ID_PRIMARY, ParamValue::Bytes(vec![0xbb; 16]))],
            ],
        };
        asb.set_param(PARAM_BCB_IV, ParamValue::Bytes(vec![0x11; 12]));
        asb.set_param(PARAM_BCB_AES_VARIANT, ParamValue::Uint(3));
        asb.set_param(PARAM_BCB_SCOPE_FLAGS, ParamValue::Uint(0x07));
        asb
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let asb = sample_bcb();
        let mut out = Vec::new();
        asb.encode(&mut out);
        let decoded = AbstractSecurityBlock::decode(&out).unwrap();
        assert_eq!(decoded, asb);
    }

    #[test]
    fn test_param_accessors() {
        let asb = sample_bcb();
        assert_eq!(asb.iv().unwrap(), &[0x11; 12]);
        assert_eq!(asb.aes_variant(), Some(AesVariant::A256Gcm));
        assert_eq!(asb.scope_flags(), 0x07);
        assert!(asb.wrapped_key().is_none());
    }

    #[test]
    fn test_defaults_when_params_absent() {
        let bib = AbstractSecurityBlock {
            context_id: CONTEXT_BIB_HMAC_SHA2,
            ..Default::default()
        };
        assert_eq!(bib.sha_variant(), Some(ShaVariant::HmacSha384));
        assert_eq!(bib.scope_flags(), 0x07);
    }

    #[test]
    fn test_result_count_mismatch_rejected() {
        let mut asb = sample_bcb();
        asb.results.pop();
        let mut out = Vec::new();
        asb.encode(&mut out);
        assert!(matches!(
            AbstractSecurityBlock::decode(&out),
            Err(BundleError::MalformedSecurityBlock(_))
        ));
    }

    #[test]
    fn test_remove_operation() {
        let mut asb = sample_bcb();
        assert!(asb.remove_operation(1));
        assert_eq!(asb.security_targets, vec![1]);
        assert_eq!(asb.results.len(), 1);
        assert!(!asb.remove_operation(5));
        assert!(asb.remove_operation(0));
        assert!(asb.security_targets.is_empty());
    }

    #[test]
    fn test_primary_result() {
        let asb = sample_bcb();
        assert_eq!(asb.primary_result(0).unwrap(), &[0xaa; 16]);
        assert_eq!(asb.primary_result(1).unwrap(), &[0xbb; 16]);
        assert!(asb.primary_result(2).is_none());
    }

    #[test]
    fn test_variant_codes() {
        assert_eq!(ShaVariant::from_code(5), Some(ShaVariant::HmacSha256));
        assert_eq!(ShaVariant::HmacSha512.digest_len(), 64);
        assert_eq!(AesVariant::from_code(3), Some(AesVariant::A256Gcm));
        assert_eq!(AesVariant::A128Gcm.key_len(), 16);
        assert_eq!(ShaVariant::from_code(4), None);
        assert_eq!(AesVariant::from_code(2), None);
    }
}
