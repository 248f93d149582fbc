//! Policy lookup and enforcement over received and outgoing bundles.
//!
//! Received bundles are processed BCB-first then BIB (a BCB may encrypt the
//! BIB when their targets overlap); outgoing bundles get the BIB before the
//! BCB so the BCB can cover it. Per-target processor errors are mapped to
//! failure events and their configured action masks.

use std::sync::Arc;

use tracing::{debug, info, warn};

use bpn_core::block::BlockType;
use bpn_core::security::{AbstractSecurityBlock, CONTEXT_BCB_AES_GCM, CONTEXT_BIB_HMAC_SHA2};
use bpn_core::{BundleView, Eid, EidPattern};

use crate::error::{BpSecError, PolicyError, SopError, SopErrorCode};
use crate::filter::{PolicyFilter, PolicySearchCache};
use crate::iv::IvGenerator;
use crate::policy::{ActionMask, BpSecPolicy, FailureEventSet, Role, SecurityFailureEvent};
use crate::processor::{
    self, block_type_mask, ConfidentialityReceivedParams, IntegrityReceivedParams,
};

/// What to do with a received bundle after security processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Disposition {
    Forward,
    Drop,
}

/// Per-thread processing state: IV generator, scratch target arrays, and
/// one search cache per lookup site. Not shared across threads.
#[derive(Debug, Default)]
#[must_use]
pub struct ProcessingContext {
    pub iv_generator: IvGenerator,
    /// Security-operation errors observed by the last
    /// [`BpSecPolicyManager::process_received_bundle`] call.
    pub last_sop_errors: Vec<SopError>,
    bib_target_block_numbers: Vec<u64>,
    bcb_target_block_numbers: Vec<u64>,
    bcb_target_bib_placeholder_index: Option<usize>,
    pub search_cache_bcb_acceptor: PolicySearchCache,
    pub search_cache_bcb_verifier: PolicySearchCache,
    pub search_cache_bib_acceptor: PolicySearchCache,
    pub search_cache_bib_verifier: PolicySearchCache,
    pub search_cache_source: PolicySearchCache,
}

impl ProcessingContext {
    pub fn new() -> Self {
        Self::default()
    }
}

/// The policy index and enforcement entry points.
#[derive(Debug, Default)]
#[must_use]
pub struct BpSecPolicyManager {
    filter_security_source: PolicyFilter,
    /// Action mask applied when a bundle at its final destination carries a
    /// security block no acceptor policy matches (no per-rule event set can
    /// apply, since no rule matched).
    pub action_mask_sop_missing_at_acceptor: ActionMask,
}

impl BpSecPolicyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up or create the policy at
    /// `trie[security_source][bundle_source][bundle_final_dest].policies[role]`.
    ///
    /// Returns the policy slot and whether it was newly created.
    pub fn create_or_get_policy(
        &mut self,
        security_source_uri: &str,
        bundle_source_uri: &str,
        bundle_final_dest_uri: &str,
        role: Role,
    ) -> Result<(&mut Arc<BpSecPolicy>, bool), PolicyError> {
        let security_source = EidPattern::parse(security_source_uri)?;
        let bundle_source = EidPattern::parse(bundle_source_uri)?;
        let bundle_final_dest = EidPattern::parse(bundle_final_dest_uri)?;
        let terminal = self
            .filter_security_source
            .child_for_pattern_mut(&security_source)
            .child_for_pattern_mut(&bundle_source)
            .child_for_pattern_mut(&bundle_final_dest);
        let slot = terminal.policy_slot_mut(role);
        let is_new = slot.is_none();
        let policy = slot.get_or_insert_with(|| Arc::new(BpSecPolicy::default()));
        Ok((policy, is_new))
    }

    /// Cascading lookup: at each trie level the exact EID is tried first,
    /// then the node-only wildcard, then the any-EID child.
    #[must_use]
    pub fn find_policy(
        &self,
        security_source: &Eid,
        bundle_source: &Eid,
        bundle_final_dest: &Eid,
        role: Role,
    ) -> Option<&Arc<BpSecPolicy>> {
        self.filter_security_source
            .child_for_eid(security_source)?
            .child_for_eid(bundle_source)?
            .child_for_eid(bundle_final_dest)?
            .policy(role)
    }

    /// [`Self::find_policy`] short-circuited by the caller's search cache.
    /// Negative results are cached too.
    pub fn find_policy_with_cache(
        &self,
        security_source: &Eid,
        bundle_source: &Eid,
        bundle_final_dest: &Eid,
        role: Role,
        cache: &mut PolicySearchCache,
    ) -> Option<Arc<BpSecPolicy>> {
        if let Some(cached) = cache.lookup(security_source, bundle_source, bundle_final_dest, role)
        {
            return cached;
        }
        let found = self
            .find_policy(security_source, bundle_source, bundle_final_dest, role)
            .cloned();
        cache.store(
            security_source,
            bundle_source,
            bundle_final_dest,
            role,
            found.clone(),
        );
        found
    }

    /// Apply security policy to a received bundle.
    ///
    /// All BCBs are handled before all BIBs. On [`Disposition::Forward`] the
    /// view has been re-rendered in place; on [`Disposition::Drop`] the
    /// bundle must be discarded and processed no further.
    pub fn process_received_bundle(
        &self,
        bv: &mut BundleView,
        ctx: &mut ProcessingContext,
        my_node_id: u64,
    ) -> Disposition {
        let bundle_source = bv.primary.source;
        let bundle_final_dest = bv.primary.destination;
        let bundle_is_at_final_dest = bundle_final_dest.node == my_node_id;
        ctx.last_sop_errors.clear();

        for idx in bv.block_indices_of_type(BlockType::Confidentiality) {
            let mut asb = match AbstractSecurityBlock::decode(&bv.blocks[idx].block.data) {
                Ok(asb) if asb.context_id == CONTEXT_BCB_AES_GCM => asb,
                _ => {
                    warn!("received bundle carries a malformed BCB; dropping");
                    return Disposition::Drop;
                }
            };
            let acceptor = self.find_policy_with_cache(
                &asb.security_source,
                &bundle_source,
                &bundle_final_dest,
                Role::Acceptor,
                &mut ctx.search_cache_bcb_acceptor,
            );
            let (policy, verify_only) = match acceptor {
                Some(policy) => (policy, false),
                None if bundle_is_at_final_dest => {
                    warn!(
                        security_source = %asb.security_source,
                        bundle_source = %bundle_source,
                        bundle_final_dest = %bundle_final_dest,
                        "bundle at final destination but no acceptor policy matches its BCB"
                    );
                    ctx.last_sop_errors.push(SopError::new(
                        SopErrorCode::Missing,
                        None,
                        format!(
                            "no acceptor policy for BCB with security source {}",
                            asb.security_source
                        ),
                    ));
                    if !self.dispatch_missing_at_acceptor(bv, &asb, false) {
                        return Disposition::Drop;
                    }
                    continue;
                }
                None => {
                    match self.find_policy_with_cache(
                        &asb.security_source,
                        &bundle_source,
                        &bundle_final_dest,
                        Role::Verifier,
                        &mut ctx.search_cache_bcb_verifier,
                    ) {
                        Some(policy) => (policy, true),
                        None => continue,
                    }
                }
            };
            if !policy.do_confidentiality {
                continue;
            }
            let params = ConfidentialityReceivedParams {
                key_encryption_key: policy.confidentiality_key_encryption_key.as_deref(),
                data_encryption_key: policy.data_encryption_key.as_deref(),
                expected_iv_length: if policy.use_12_byte_iv { 12 } else { 16 },
                expected_variant: policy.confidentiality_variant,
                expected_aad_scope_mask: policy.aad_scope_mask,
                expected_target_block_types_mask: block_type_mask(&policy.bcb_block_type_targets),
            };
            let errors = processor::decrypt_bcb(bv, idx, &asb, &params, verify_only);
            if errors.is_empty() {
                debug!(verify_only, "BCB processed successfully");
                continue;
            }
            ctx.last_sop_errors.extend(errors.iter().cloned());
            let keep = self.dispatch_failure_events(
                bv,
                idx,
                &mut asb,
                policy.confidentiality_failure_event_set.as_deref(),
                &errors,
                !verify_only,
                false,
            );
            reencode_asb(bv, idx, &asb);
            if !keep {
                return Disposition::Drop;
            }
        }

        for idx in bv.block_indices_of_type(BlockType::Integrity) {
            let mut asb = match AbstractSecurityBlock::decode(&bv.blocks[idx].block.data) {
                Ok(asb) if asb.context_id == CONTEXT_BIB_HMAC_SHA2 => asb,
                _ => {
                    warn!("received bundle carries a malformed BIB; dropping");
                    return Disposition::Drop;
                }
            };
            let acceptor = self.find_policy_with_cache(
                &asb.security_source,
                &bundle_source,
                &bundle_final_dest,
                Role::Acceptor,
                &mut ctx.search_cache_bib_acceptor,
            );
            let (policy, mark_bib_for_deletion) = match acceptor {
                Some(policy) => (policy, true),
                None if bundle_is_at_final_dest => {
                    warn!(
                        security_source = %asb.security_source,
                        bundle_source = %bundle_source,
                        bundle_final_dest = %bundle_final_dest,
                        "bundle at final destination but no acceptor policy matches its BIB"
                    );
                    ctx.last_sop_errors.push(SopError::new(
                        SopErrorCode::Missing,
                        None,
                        format!(
                            "no acceptor policy for BIB with security source {}",
                            asb.security_source
                        ),
                    ));
                    if !self.dispatch_missing_at_acceptor(bv, &asb, true) {
                        return Disposition::Drop;
                    }
                    continue;
                }
                None => {
                    match self.find_policy_with_cache(
                        &asb.security_source,
                        &bundle_source,
                        &bundle_final_dest,
                        Role::Verifier,
                        &mut ctx.search_cache_bib_verifier,
                    ) {
                        Some(policy) => (policy, false),
                        None => continue,
                    }
                }
            };
            if !policy.do_integrity {
                continue;
            }
            let params = IntegrityReceivedParams {
                key_encryption_key: policy.hmac_key_encryption_key.as_deref(),
                hmac_key: policy.hmac_key.as_deref(),
                expected_variant: policy.integrity_variant,
                expected_scope_mask: policy.integrity_scope_mask,
                expected_target_block_types_mask: block_type_mask(&policy.bib_block_type_targets),
            };
            let errors = processor::verify_bib(bv, idx, &asb, &params, mark_bib_for_deletion);
            if errors.is_empty() {
                debug!(acceptor = mark_bib_for_deletion, "BIB verified successfully");
                continue;
            }
            ctx.last_sop_errors.extend(errors.iter().cloned());
            let keep = self.dispatch_failure_events(
                bv,
                idx,
                &mut asb,
                policy.integrity_failure_event_set.as_deref(),
                &errors,
                mark_bib_for_deletion,
                true,
            );
            reencode_asb(bv, idx, &asb);
            if !keep {
                return Disposition::Drop;
            }
        }

        bv.render_in_place();
        Disposition::Forward
    }

    /// Collect target block numbers for the security source role.
    ///
    /// An integrity block type among the confidentiality targets becomes a
    /// placeholder that is backfilled with the BIB's assigned number after
    /// the BIB is added.
    pub fn populate_source_targets(
        bv: &BundleView,
        ctx: &mut ProcessingContext,
        policy: &BpSecPolicy,
    ) {
        ctx.bib_target_block_numbers.clear();
        ctx.bcb_target_block_numbers.clear();
        ctx.bcb_target_bib_placeholder_index = None;
        if policy.do_integrity {
            for &block_type in &policy.bib_block_type_targets {
                for idx in bv.block_indices_of_type(BlockType::from(block_type)) {
                    ctx.bib_target_block_numbers
                        .push(bv.blocks[idx].block.block_number);
                }
            }
        }
        if policy.do_confidentiality {
            for &block_type in &policy.bcb_block_type_targets {
                if block_type == BlockType::INTEGRITY_CODE {
                    ctx.bcb_target_bib_placeholder_index =
                        Some(ctx.bcb_target_block_numbers.len());
                    ctx.bcb_target_block_numbers.push(0);
                } else {
                    for idx in bv.block_indices_of_type(BlockType::from(block_type)) {
                        ctx.bcb_target_block_numbers
                            .push(bv.blocks[idx].block.block_number);
                    }
                }
            }
        }
    }

    /// Apply one SOURCE policy to an outgoing bundle: BIB first (placed
    /// immediately after the primary block), then BCB with a fresh IV.
    ///
    /// Any processor failure aborts the pipeline; a partially processed
    /// bundle must not be emitted.
    pub fn process_outgoing_bundle(
        bv: &mut BundleView,
        ctx: &mut ProcessingContext,
        policy: &BpSecPolicy,
        security_source: Eid,
    ) -> Result<(), BpSecError> {
        if policy.do_integrity {
            let bib_number = processor::add_bib(
                bv,
                &ctx.bib_target_block_numbers,
                security_source,
                policy.integrity_variant,
                policy.integrity_scope_mask,
                policy.bib_crc_type,
                policy.hmac_key.as_deref(),
                policy.hmac_key_encryption_key.as_deref(),
            )?;
            if let Some(placeholder) = ctx.bcb_target_bib_placeholder_index {
                ctx.bcb_target_block_numbers[placeholder] = bib_number;
            }
        }
        if policy.do_confidentiality {
            let iv = ctx.iv_generator.serialize_and_increment(policy.use_12_byte_iv);
            processor::add_bcb(
                bv,
                &ctx.bcb_target_block_numbers,
                security_source,
                &iv,
                policy.confidentiality_variant,
                policy.aad_scope_mask,
                policy.bcb_crc_type,
                policy.data_encryption_key.as_deref(),
                policy.confidentiality_key_encryption_key.as_deref(),
            )?;
        }
        bv.render_in_place();
        Ok(())
    }

    /// Look up the SOURCE policy for this node and apply it to an outgoing
    /// bundle. Returns whether a policy was applied.
    pub fn find_policy_and_process_outgoing_bundle(
        &self,
        bv: &mut BundleView,
        ctx: &mut ProcessingContext,
        security_source: Eid,
    ) -> Result<bool, BpSecError> {
        let bundle_source = bv.primary.source;
        let bundle_final_dest = bv.primary.destination;
        let Some(policy) = self.find_policy_with_cache(
            &security_source,
            &bundle_source,
            &bundle_final_dest,
            Role::Source,
            &mut ctx.search_cache_source,
        ) else {
            return Ok(false);
        };
        Self::populate_source_targets(bv, ctx, &policy);
        Self::process_outgoing_bundle(bv, ctx, &policy, security_source)?;
        Ok(true)
    }

    /// Handle a security block with no acceptor policy at the bundle's
    /// final destination. Returns whether to keep the bundle.
    fn dispatch_missing_at_acceptor(
        &self,
        bv: &mut BundleView,
        asb: &AbstractSecurityBlock,
        is_integrity: bool,
    ) -> bool {
        let targets_payload = asb.targets_block_number(1);
        // an encrypted payload that cannot be decrypted means the bundle is
        // undeliverable regardless of configured actions
        if !is_integrity && targets_payload {
            warn!("encrypted payload block cannot be decrypted; dropping bundle");
            return false;
        }
        let mask = self.action_mask_sop_missing_at_acceptor;
        if mask.contains(ActionMask::FAIL_BUNDLE_FORWARDING) {
            warn!("sopMissingAtAcceptor: failing bundle forwarding");
            return false;
        }
        if mask.contains(ActionMask::REMOVE_SECURITY_OPERATION_TARGET_BLOCK) {
            if targets_payload {
                warn!("sopMissingAtAcceptor: target includes payload; dropping bundle");
                return false;
            }
            warn!("sopMissingAtAcceptor: removing security operation target blocks");
            remove_sop_target_blocks(bv, asb, None);
        } else {
            warn!("cannot accept security operation (no failure actions taken)");
        }
        true
    }

    /// Apply configured failure actions for each per-target error.
    /// Returns whether to keep the bundle.
    #[allow(clippy::too_many_arguments)]
    fn dispatch_failure_events(
        &self,
        bv: &mut BundleView,
        asb_index: usize,
        asb: &mut AbstractSecurityBlock,
        event_set: Option<&FailureEventSet>,
        errors: &[SopError],
        is_acceptor: bool,
        is_integrity: bool,
    ) -> bool {
        for error in errors {
            let canonical_target = error
                .target_index
                .and_then(|i| asb.security_targets.get(i).copied());
            let error_targets_payload =
                canonical_target == Some(1) || error.target_index.is_none();
            let mut removed_sop = false;
            let mut removed_sop_target = false;

            if is_acceptor && !is_integrity {
                // 5.1.1: an encrypted payload that cannot be decrypted means
                // the bundle is discarded unconditionally
                if error_targets_payload {
                    warn!("encrypted payload block cannot be decrypted by acceptor; dropping");
                    return false;
                }
                // a non-payload target that cannot be decrypted is discarded
                // along with its security operation
                if !remove_sop(bv, asb_index, asb, error.target_index) {
                    warn!("could not remove failed security operation; dropping");
                    return false;
                }
                remove_sop_target_blocks(bv, asb, canonical_target);
                removed_sop = true;
                removed_sop_target = true;
                // fall through: FAIL_BUNDLE_FORWARDING may still apply
            }

            let Some(event) = failure_event_for(error.code, is_acceptor) else {
                continue;
            };
            let Some(mask) = event_set.and_then(|set| set.get(event)) else {
                if is_acceptor {
                    warn!(?event, "no failure event mapping at acceptor; continuing");
                    continue;
                }
                warn!(?event, "no failure event mapping at verifier; dropping bundle");
                return false;
            };

            if is_acceptor {
                if !removed_sop && !remove_sop(bv, asb_index, asb, error.target_index) {
                    warn!("could not remove failed security operation; dropping");
                    return false;
                }
                if mask.contains(ActionMask::FAIL_BUNDLE_FORWARDING) {
                    warn!(?event, "FAIL_BUNDLE_FORWARDING specified; dropping bundle");
                    return false;
                }
                if mask.contains(ActionMask::REMOVE_SECURITY_OPERATION_TARGET_BLOCK) {
                    if error_targets_payload {
                        warn!(?event, "target includes payload block; dropping bundle");
                        return false;
                    }
                    if !removed_sop_target {
                        remove_sop_target_blocks(bv, asb, canonical_target);
                    }
                } else if mask.is_empty() {
                    warn!(?event, "no failure actions taken");
                }
            } else {
                let mut took_action = false;
                if mask.contains(ActionMask::REMOVE_SECURITY_OPERATION) {
                    info!(?event, "REMOVE_SECURITY_OPERATION specified");
                    if !remove_sop(bv, asb_index, asb, error.target_index) {
                        warn!("could not remove failed security operation; dropping");
                        return false;
                    }
                    took_action = true;
                }
                if mask.contains(ActionMask::FAIL_BUNDLE_FORWARDING) {
                    warn!(?event, "FAIL_BUNDLE_FORWARDING specified; dropping bundle");
                    return false;
                }
                if mask.contains(ActionMask::REMOVE_SECURITY_OPERATION_TARGET_BLOCK) {
                    took_action = true;
                    if error_targets_payload {
                        warn!(?event, "target includes payload block; dropping bundle");
                        return false;
                    }
                    remove_sop_target_blocks(bv, asb, canonical_target);
                }
                if !took_action {
                    warn!(?event, "no failure actions taken");
                }
            }
        }
        true
    }
}

fn failure_event_for(code: SopErrorCode, is_acceptor: bool) -> Option<SecurityFailureEvent> {
    match (code, is_acceptor) {
        (SopErrorCode::Corrupted, true) => Some(SecurityFailureEvent::SopCorruptedAtAcceptor),
        (SopErrorCode::Misconfigured, true) => {
            Some(SecurityFailureEvent::SopMisconfiguredAtAcceptor)
        }
        (SopErrorCode::Corrupted, false) => Some(SecurityFailureEvent::SopCorruptedAtVerifier),
        (SopErrorCode::Misconfigured, false) => {
            Some(SecurityFailureEvent::SopMisconfiguredAtVerifier)
        }
        (SopErrorCode::Missing, _) => None,
    }
}

/// Remove one security operation (target + result pair) from the ASB.
///
/// `None` means every operation: the whole block is marked for deletion.
/// When removal empties the ASB, the block is marked for deletion per
/// RFC 9172 §5.1.1/§5.1.2.
fn remove_sop(
    bv: &mut BundleView,
    asb_index: usize,
    asb: &mut AbstractSecurityBlock,
    target_index: Option<usize>,
) -> bool {
    let view = &mut bv.blocks[asb_index];
    match target_index {
        None => {
            view.marked_for_deletion = true;
            true
        }
        Some(i) => {
            if !asb.remove_operation(i) {
                return false;
            }
            if asb.security_targets.is_empty() {
                view.marked_for_deletion = true;
            }
            view.set_manually_modified();
            true
        }
    }
}

/// Mark the target block(s) of a security operation for deletion.
/// `None` means every block the ASB targets.
fn remove_sop_target_blocks(
    bv: &mut BundleView,
    asb: &AbstractSecurityBlock,
    canonical_target: Option<u64>,
) {
    match canonical_target {
        None => {
            for &target in &asb.security_targets {
                if let Some(view) = bv.block_by_number_mut(target) {
                    view.marked_for_deletion = true;
                }
            }
        }
        Some(target) => {
            if let Some(view) = bv.block_by_number_mut(target) {
                view.marked_for_deletion = true;
            }
        }
    }
}

/// Write a mutated ASB back into its block's data byte string.
fn reencode_asb(bv: &mut BundleView, asb_index: usize, asb: &AbstractSecurityBlock) {
    let view = &mut bv.blocks[asb_index];
    let mut data = Vec::new();
    asb.encode(&mut data);
    if view.block.data != data {
        view.block.data = data;
        view.set_manually_modified();
    }
}
