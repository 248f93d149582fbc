//! Policy document loading.
//!
//! The security configuration is a TOML document of named failure event
//! sets and policy rules. Key material may be given inline as hex or as a
//! path to a file holding a hex-encoded byte string. All validation errors
//! here are fatal at load time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use bpn_core::{AesVariant, CrcType, ShaVariant};

use crate::error::PolicyError;
use crate::manager::BpSecPolicyManager;
use crate::policy::{
    ActionMask, BpSecPolicy, FailureEventSet, Role, SecurityFailureEvent, AAD_SCOPE_ALL,
    INTEGRITY_SCOPE_ALL,
};

/// Top-level security configuration document.
#[derive(Debug, Default, Deserialize)]
pub struct BpSecConfig {
    /// Actions applied when a final-destination acceptor finds a security
    /// block no policy matches.
    #[serde(default)]
    pub sop_missing_at_acceptor_actions: Vec<ActionName>,
    #[serde(default)]
    pub failure_event_sets: Vec<FailureEventSetEntry>,
    #[serde(default)]
    pub rules: Vec<PolicyRuleEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FailureEventSetEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub events: Vec<EventEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventEntry {
    pub event: EventName,
    pub actions: Vec<ActionName>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventName {
    SopMissingAtAcceptor,
    SopCorruptedAtAcceptor,
    SopMisconfiguredAtAcceptor,
    SopCorruptedAtVerifier,
    SopMisconfiguredAtVerifier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionName {
    RemoveSecurityOperation,
    RemoveSecurityOperationTargetBlock,
    FailBundleForwarding,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyRuleEntry {
    pub security_role: String,
    pub security_service: String,
    pub security_source: String,
    pub bundle_source: Vec<String>,
    pub bundle_final_destination: Vec<String>,
    pub security_target_block_types: Vec<u64>,
    pub failure_event_set: String,
    #[serde(default)]
    pub params: RuleParams,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleParams {
    pub aes_variant: Option<u64>,
    pub sha_variant: Option<u64>,
    pub iv_size_bytes: Option<u64>,
    pub scope_flags: Option<u64>,
    pub security_block_crc: Option<u64>,
    pub key: Option<String>,
    pub key_file: Option<PathBuf>,
    pub key_encryption_key: Option<String>,
    pub key_encryption_key_file: Option<PathBuf>,
}

impl BpSecConfig {
    /// Parse a TOML document.
    pub fn parse(text: &str) -> Result<Self, PolicyError> {
        Ok(toml::from_str(text)?)
    }

    /// Load and parse a TOML file.
    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        Self::parse(&std::fs::read_to_string(path)?)
    }
}

impl From<EventName> for SecurityFailureEvent {
    fn from(name: EventName) -> Self {
        match name {
            EventName::SopMissingAtAcceptor => SecurityFailureEvent::SopMissingAtAcceptor,
            EventName::SopCorruptedAtAcceptor => SecurityFailureEvent::SopCorruptedAtAcceptor,
            EventName::SopMisconfiguredAtAcceptor => {
                SecurityFailureEvent::SopMisconfiguredAtAcceptor
            }
            EventName::SopCorruptedAtVerifier => SecurityFailureEvent::SopCorruptedAtVerifier,
            EventName::SopMisconfiguredAtVerifier => {
                SecurityFailureEvent::SopMisconfiguredAtVerifier
            }
        }
    }
}

fn action_mask(actions: &[ActionName]) -> ActionMask {
    let mut mask = ActionMask::default();
    for action in actions {
        mask.insert(match action {
            ActionName::RemoveSecurityOperation => ActionMask::REMOVE_SECURITY_OPERATION,
            ActionName::RemoveSecurityOperationTargetBlock => {
                ActionMask::REMOVE_SECURITY_OPERATION_TARGET_BLOCK
            }
            ActionName::FailBundleForwarding => ActionMask::FAIL_BUNDLE_FORWARDING,
        });
    }
    mask
}

/// Read key material: inline hex, or a file whose contents are hex.
fn load_key_material(
    inline: &Option<String>,
    file: &Option<PathBuf>,
    what: &str,
) -> Result<Option<Vec<u8>>, PolicyError> {
    let hex_text = match (inline, file) {
        (Some(_), Some(_)) => {
            return Err(PolicyError::InvalidKeyMaterial(format!(
                "{what}: specify inline hex or a key file, not both"
            )))
        }
        (Some(text), None) => text.trim().to_string(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .map_err(|e| {
                PolicyError::InvalidKeyMaterial(format!("{what}: cannot read {}: {e}", path.display()))
            })?
            .trim()
            .to_string(),
        (None, None) => return Ok(None),
    };
    let bytes = hex::decode(&hex_text)
        .map_err(|e| PolicyError::InvalidKeyMaterial(format!("{what}: invalid hex: {e}")))?;
    if bytes.is_empty() {
        return Err(PolicyError::InvalidKeyMaterial(format!("{what}: empty key")));
    }
    Ok(Some(bytes))
}

impl BpSecPolicyManager {
    /// Build the policy trie from a parsed configuration document.
    ///
    /// Ports every load-time check: role and service names, parameter
    /// applicability per service, exactly one of key/KEK, scope and CRC
    /// ranges, EID syntax, and duplicate-service detection. SOURCE rules
    /// additionally run [`BpSecPolicy::validate_and_finalize`].
    pub fn load_from_config(&mut self, config: &BpSecConfig) -> Result<(), PolicyError> {
        self.action_mask_sop_missing_at_acceptor =
            action_mask(&config.sop_missing_at_acceptor_actions);

        let mut event_sets: HashMap<&str, Arc<FailureEventSet>> = HashMap::new();
        for entry in &config.failure_event_sets {
            let mut set = FailureEventSet::new(entry.name.clone());
            for event in &entry.events {
                set.set(event.event.into(), action_mask(&event.actions));
            }
            event_sets.insert(entry.name.as_str(), Arc::new(set));
        }

        for rule in &config.rules {
            let role = match rule.security_role.as_str() {
                "source" => Role::Source,
                "verifier" => Role::Verifier,
                "acceptor" => Role::Acceptor,
                other => return Err(PolicyError::InvalidRole(other.to_string())),
            };
            let is_confidentiality = match rule.security_service.as_str() {
                "confidentiality" => true,
                "integrity" => false,
                other => return Err(PolicyError::InvalidService(other.to_string())),
            };
            let is_integrity = !is_confidentiality;

            let event_set = event_sets
                .get(rule.failure_event_set.as_str())
                .cloned()
                .ok_or_else(|| {
                    PolicyError::UnknownFailureEventSet(rule.failure_event_set.clone())
                })?;

            let mut template = BpSecPolicy::default();
            {
                let targets = if is_confidentiality {
                    &mut template.bcb_block_type_targets
                } else {
                    &mut template.bib_block_type_targets
                };
                targets.extend(rule.security_target_block_types.iter().copied());
            }

            let params = &rule.params;
            if let Some(aes) = params.aes_variant {
                if is_integrity {
                    return Err(PolicyError::InvalidParameterCombination(
                        "aesVariant cannot be applied to an integrity rule",
                    ));
                }
                template.confidentiality_variant = match aes {
                    128 => AesVariant::A128Gcm,
                    256 => AesVariant::A256Gcm,
                    _ => {
                        return Err(PolicyError::InvalidParameterCombination(
                            "aesVariant must be 128 or 256",
                        ))
                    }
                };
            }
            if let Some(sha) = params.sha_variant {
                if is_confidentiality {
                    return Err(PolicyError::InvalidParameterCombination(
                        "shaVariant cannot be applied to a confidentiality rule",
                    ));
                }
                template.integrity_variant = match sha {
                    256 => ShaVariant::HmacSha256,
                    384 => ShaVariant::HmacSha384,
                    512 => ShaVariant::HmacSha512,
                    _ => {
                        return Err(PolicyError::InvalidParameterCombination(
                            "shaVariant must be 256, 384 or 512",
                        ))
                    }
                };
            }
            if let Some(iv_size) = params.iv_size_bytes {
                if is_integrity {
                    return Err(PolicyError::InvalidParameterCombination(
                        "ivSizeBytes cannot be applied to an integrity rule",
                    ));
                }
                template.use_12_byte_iv = match iv_size {
                    12 => true,
                    16 => false,
                    _ => {
                        return Err(PolicyError::InvalidParameterCombination(
                            "ivSizeBytes must be 12 or 16",
                        ))
                    }
                };
            }
            if let Some(scope) = params.scope_flags {
                if is_integrity {
                    if scope > INTEGRITY_SCOPE_ALL {
                        return Err(PolicyError::InvalidParameterCombination(
                            "integrity scope flags out of range",
                        ));
                    }
                    template.integrity_scope_mask = scope;
                } else {
                    if scope > AAD_SCOPE_ALL {
                        return Err(PolicyError::InvalidParameterCombination(
                            "AAD scope flags out of range",
                        ));
                    }
                    template.aad_scope_mask = scope;
                }
            }
            if let Some(crc) = params.security_block_crc {
                let crc_type = CrcType::from_code(crc).map_err(|_| {
                    PolicyError::InvalidParameterCombination("securityBlockCrc must be 0, 1 or 2")
                })?;
                if is_integrity {
                    template.bib_crc_type = crc_type;
                } else {
                    template.bcb_crc_type = crc_type;
                }
            }

            let key = load_key_material(&params.key, &params.key_file, "key")?;
            let kek = load_key_material(
                &params.key_encryption_key,
                &params.key_encryption_key_file,
                "keyEncryptionKey",
            )?;
            match (&key, &kek) {
                (None, None) => {
                    return Err(PolicyError::InvalidKeyMaterial(format!(
                        "no key specified for {}",
                        rule.security_service
                    )))
                }
                (Some(_), Some(_)) => {
                    return Err(PolicyError::InvalidKeyMaterial(format!(
                        "both key and keyEncryptionKey specified for {}; only specify one",
                        rule.security_service
                    )))
                }
                _ => {}
            }
            if is_integrity {
                template.hmac_key = key;
                template.hmac_key_encryption_key = kek;
                template.integrity_failure_event_set = Some(event_set);
            } else {
                template.data_encryption_key = key;
                template.confidentiality_key_encryption_key = kek;
                template.confidentiality_failure_event_set = Some(event_set);
            }

            if role == Role::Source {
                let mut probe = template.clone();
                if is_integrity {
                    probe.do_integrity = true;
                } else {
                    probe.do_confidentiality = true;
                }
                // cross-service consistency is checked against the merged
                // policy below; this catches single-rule violations early
                probe.validate_and_finalize()?;
            }

            for bundle_source in &rule.bundle_source {
                for bundle_final_dest in &rule.bundle_final_destination {
                    let (slot, is_new) = self.create_or_get_policy(
                        &rule.security_source,
                        bundle_source,
                        bundle_final_dest,
                        role,
                    )?;
                    if !is_new {
                        let existing = slot.as_ref();
                        if is_confidentiality && existing.do_confidentiality {
                            return Err(PolicyError::DuplicatePolicy {
                                service: "confidentiality",
                            });
                        }
                        if is_integrity && existing.do_integrity {
                            return Err(PolicyError::DuplicatePolicy {
                                service: "integrity",
                            });
                        }
                    }
                    let policy = Arc::make_mut(slot);
                    if is_confidentiality {
                        policy.do_confidentiality = true;
                        policy.confidentiality_variant = template.confidentiality_variant;
                        policy.use_12_byte_iv = template.use_12_byte_iv;
                        policy.aad_scope_mask = template.aad_scope_mask;
                        policy.bcb_crc_type = template.bcb_crc_type;
                        policy.bcb_block_type_targets = template.bcb_block_type_targets.clone();
                        policy.confidentiality_key_encryption_key =
                            template.confidentiality_key_encryption_key.clone();
                        policy.data_encryption_key = template.data_encryption_key.clone();
                        policy.confidentiality_failure_event_set =
                            template.confidentiality_failure_event_set.clone();
                    } else {
                        policy.do_integrity = true;
                        policy.integrity_variant = template.integrity_variant;
                        policy.integrity_scope_mask = template.integrity_scope_mask;
                        policy.bib_crc_type = template.bib_crc_type;
                        policy.bib_block_type_targets = template.bib_block_type_targets.clone();
                        policy.hmac_key_encryption_key =
                            template.hmac_key_encryption_key.clone();
                        policy.hmac_key = template.hmac_key.clone();
                        policy.integrity_failure_event_set =
                            template.integrity_failure_event_set.clone();
                    }
                    if role == Role::Source {
                        policy.validate_and_finalize()?;
                    }
                }
            }
        }
        Ok(())
    }
}
