//! Policy records, roles, failure events, and action masks.

use std::collections::BTreeSet;
use std::sync::Arc;

use bpn_core::block::BlockType;
use bpn_core::{AesVariant, CrcType, ShaVariant};

use crate::error::PolicyError;

/// BPSec role of one policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Source = 0,
    Verifier = 1,
    Acceptor = 2,
}

/// Number of roles; terminal trie nodes hold one policy slot per role.
pub const NUM_ROLES: usize = 3;

/// All-bits-set integrity scope mask (primary, target header, security header).
pub const INTEGRITY_SCOPE_ALL: u64 = 0x07;
/// All-bits-set AAD scope mask.
pub const AAD_SCOPE_ALL: u64 = 0x07;

/// A failure event observed while enforcing a security operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityFailureEvent {
    SopMissingAtAcceptor,
    SopCorruptedAtAcceptor,
    SopMisconfiguredAtAcceptor,
    SopCorruptedAtVerifier,
    SopMisconfiguredAtVerifier,
}

/// Bitmask of actions to take on a failure event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[must_use]
pub struct ActionMask(pub u8);

impl ActionMask {
    pub const REMOVE_SECURITY_OPERATION: u8 = 0x01;
    pub const REMOVE_SECURITY_OPERATION_TARGET_BLOCK: u8 = 0x02;
    pub const FAIL_BUNDLE_FORWARDING: u8 = 0x04;

    #[must_use]
    pub fn contains(&self, action: u8) -> bool {
        self.0 & action != 0
    }

    pub fn insert(&mut self, action: u8) {
        self.0 |= action;
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// A named lookup table from failure event to action mask.
#[derive(Debug, Clone, Default)]
#[must_use]
pub struct FailureEventSet {
    pub name: String,
    masks: [Option<ActionMask>; 5],
}

impl FailureEventSet {
    pub fn new(name: impl Into<String>) -> Self {
        FailureEventSet {
            name: name.into(),
            masks: [None; 5],
        }
    }

    fn index(event: SecurityFailureEvent) -> usize {
        match event {
            SecurityFailureEvent::SopMissingAtAcceptor => 0,
            SecurityFailureEvent::SopCorruptedAtAcceptor => 1,
            SecurityFailureEvent::SopMisconfiguredAtAcceptor => 2,
            SecurityFailureEvent::SopCorruptedAtVerifier => 3,
            SecurityFailureEvent::SopMisconfiguredAtVerifier => 4,
        }
    }

    pub fn set(&mut self, event: SecurityFailureEvent, mask: ActionMask) {
        self.masks[Self::index(event)] = Some(mask);
    }

    /// The action mask for an event, or `None` if the set does not cover it.
    #[must_use]
    pub fn get(&self, event: SecurityFailureEvent) -> Option<ActionMask> {
        self.masks[Self::index(event)]
    }
}

/// One merged security policy at a trie terminal: the integrity half, the
/// confidentiality half, or both.
#[derive(Debug, Clone)]
#[must_use]
pub struct BpSecPolicy {
    pub do_integrity: bool,
    pub do_confidentiality: bool,

    // derived by validate_and_finalize()
    pub bcb_targets_payload_block: bool,
    pub bib_must_be_encrypted: bool,

    // integrity half
    pub integrity_variant: ShaVariant,
    pub integrity_scope_mask: u64,
    pub bib_crc_type: CrcType,
    pub bib_block_type_targets: BTreeSet<u64>,
    pub hmac_key_encryption_key: Option<Vec<u8>>,
    pub hmac_key: Option<Vec<u8>>,
    pub integrity_failure_event_set: Option<Arc<FailureEventSet>>,

    // confidentiality half
    pub confidentiality_variant: AesVariant,
    pub use_12_byte_iv: bool,
    pub aad_scope_mask: u64,
    pub bcb_crc_type: CrcType,
    pub bcb_block_type_targets: BTreeSet<u64>,
    pub confidentiality_key_encryption_key: Option<Vec<u8>>,
    pub data_encryption_key: Option<Vec<u8>>,
    pub confidentiality_failure_event_set: Option<Arc<FailureEventSet>>,
}

impl Default for BpSecPolicy {
    fn default() -> Self {
        BpSecPolicy {
            do_integrity: false,
            do_confidentiality: false,
            bcb_targets_payload_block: false,
            bib_must_be_encrypted: false,
            integrity_variant: ShaVariant::HmacSha384,
            integrity_scope_mask: INTEGRITY_SCOPE_ALL,
            bib_crc_type: CrcType::None,
            bib_block_type_targets: BTreeSet::new(),
            hmac_key_encryption_key: None,
            hmac_key: None,
            integrity_failure_event_set: None,
            confidentiality_variant: AesVariant::A256Gcm,
            use_12_byte_iv: true,
            aad_scope_mask: AAD_SCOPE_ALL,
            bcb_crc_type: CrcType::None,
            bcb_block_type_targets: BTreeSet::new(),
            confidentiality_key_encryption_key: None,
            data_encryption_key: None,
            confidentiality_failure_event_set: None,
        }
    }
}

impl BpSecPolicy {
    /// Recompute derived flags and check cross-service consistency.
    ///
    /// When the BCB targets overlap the BIB targets, RFC 9172 requires the
    /// BIB itself to be encrypted; a rule that overlaps without also
    /// targeting block type 11 is rejected so the operator fixes the policy
    /// rather than the engine silently widening it.
    pub fn validate_and_finalize(&mut self) -> Result<(), PolicyError> {
        self.bcb_targets_payload_block = false;
        self.bib_must_be_encrypted = false;

        if self.do_confidentiality {
            self.bcb_targets_payload_block = self
                .bcb_block_type_targets
                .contains(&BlockType::PAYLOAD_CODE);
        }

        if self.do_integrity && self.do_confidentiality {
            self.bib_must_be_encrypted = self
                .bcb_block_type_targets
                .intersection(&self.bib_block_type_targets)
                .next()
                .is_some();
            if self.bib_must_be_encrypted {
                let bcb_already_targets_bib = self
                    .bcb_block_type_targets
                    .contains(&BlockType::INTEGRITY_CODE);
                if !bcb_already_targets_bib {
                    return Err(PolicyError::BibMustBeEncrypted);
                }
                tracing::debug!("BCB shall encrypt the BIB: targets overlap");
            }
        }
        Ok(())
    }
}
