//! The cascading EID-wildcard policy trie and its per-caller search cache.
//!
//! Three levels keyed successively by security source, bundle source, and
//! bundle final destination. Each level holds an exact-EID map, a node-only
//! map (service wildcard), and one "any EID" child. Lookup cascades: exact
//! first, then node-only, then any.

use std::collections::HashMap;
use std::sync::Arc;

use bpn_core::{Eid, EidPattern};

use crate::policy::{BpSecPolicy, Role, NUM_ROLES};

/// One node of the policy filter trie.
#[derive(Debug, Default)]
#[must_use]
pub struct PolicyFilter {
    eid_map: HashMap<Eid, PolicyFilter>,
    node_map: HashMap<u64, PolicyFilter>,
    any: Option<Box<PolicyFilter>>,
    /// Policies by role; used only at terminal nodes.
    policies: [Option<Arc<BpSecPolicy>>; NUM_ROLES],
}

impl PolicyFilter {
    /// Child node for a configured pattern, creating it if absent.
    pub fn child_for_pattern_mut(&mut self, pattern: &EidPattern) -> &mut PolicyFilter {
        match pattern {
            EidPattern::Exact(eid) => self.eid_map.entry(*eid).or_default(),
            EidPattern::AnyServiceOfNode(node) => self.node_map.entry(*node).or_default(),
            EidPattern::Any => self.any.get_or_insert_with(Default::default),
        }
    }

    /// Cascading lookup: exact EID, then node wildcard, then any.
    #[must_use]
    pub fn child_for_eid(&self, eid: &Eid) -> Option<&PolicyFilter> {
        if let Some(child) = self.eid_map.get(eid) {
            return Some(child);
        }
        if let Some(child) = self.node_map.get(&eid.node) {
            return Some(child);
        }
        self.any.as_deref()
    }

    #[must_use]
    pub fn policy(&self, role: Role) -> Option<&Arc<BpSecPolicy>> {
        self.policies[role as usize].as_ref()
    }

    /// The policy slot for one role at this (terminal) node.
    pub fn policy_slot_mut(&mut self, role: Role) -> &mut Option<Arc<BpSecPolicy>> {
        &mut self.policies[role as usize]
    }
}

/// Remembers the last lookup key and result for one caller.
///
/// Negative results are cached too; the hit/lookup counters make the
/// short-circuit observable in tests.
#[derive(Debug, Default)]
#[must_use]
pub struct PolicySearchCache {
    key: Option<(Eid, Eid, Eid, Role)>,
    found: Option<Arc<BpSecPolicy>>,
    was_cache_hit: bool,
    pub num_lookups: u64,
    pub num_cache_hits: u64,
}

impl PolicySearchCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the previous lookup was served from the cache.
    #[must_use]
    pub fn was_cache_hit(&self) -> bool {
        self.was_cache_hit
    }

    /// Consult the cache; `Some(result)` short-circuits the trie walk.
    pub(crate) fn lookup(
        &mut self,
        security_source: &Eid,
        bundle_source: &Eid,
        bundle_final_dest: &Eid,
        role: Role,
    ) -> Option<Option<Arc<BpSecPolicy>>> {
        self.num_lookups += 1;
        self.was_cache_hit = false;
        if self.key == Some((*security_source, *bundle_source, *bundle_final_dest, role)) {
            self.was_cache_hit = true;
            self.num_cache_hits += 1;
            return Some(self.found.clone());
        }
        None
    }

    pub(crate) fn store(
        &mut self,
        security_source: &Eid,
        bundle_source: &Eid,
        bundle_final_dest: &Eid,
        role: Role,
        found: Option<Arc<BpSecPolicy>>,
    ) {
        self.key = Some((*security_source, *bundle_source, *bundle_final_dest, role));
        self.found = found;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terminal_with_policy(role: Role) -> PolicyFilter {
        let mut node = PolicyFilter::default();
        *node.policy_slot_mut(role) = Some(Arc::new(BpSecPolicy::default()));
        node
    }

    #[test]
    fn test_cascade_exact_beats_node_beats_any() {
        let mut root = PolicyFilter::default();
        root.child_for_pattern_mut(&EidPattern::parse("ipn:1.1").unwrap());
        root.child_for_pattern_mut(&EidPattern::parse("ipn:1.*").unwrap());
        root.child_for_pattern_mut(&EidPattern::parse("ipn:*.*").unwrap());

        // exact match wins for 1.1
        let exact = root.child_for_eid(&Eid::new(1, 1)).unwrap();
        assert!(std::ptr::eq(exact, root.eid_map.get(&Eid::new(1, 1)).unwrap()));

        // node wildcard for 1.2
        let node = root.child_for_eid(&Eid::new(1, 2)).unwrap();
        assert!(std::ptr::eq(node, root.node_map.get(&1).unwrap()));

        // any for 9.9
        let any = root.child_for_eid(&Eid::new(9, 9)).unwrap();
        assert!(std::ptr::eq(any, root.any.as_deref().unwrap()));
    }

    #[test]
    fn test_no_match_without_any_child() {
        let mut root = PolicyFilter::default();
        root.child_for_pattern_mut(&EidPattern::parse("ipn:1.1").unwrap());
        assert!(root.child_for_eid(&Eid::new(2, 2)).is_none());
    }

    #[test]
    fn test_policy_slots_per_role() {
        let node = terminal_with_policy(Role::Acceptor);
        assert!(node.policy(Role::Acceptor).is_some());
        assert!(node.policy(Role::Verifier).is_none());
        assert!(node.policy(Role::Source).is_none());
    }

    #[test]
    fn test_cache_hit_and_miss() {
        let mut cache = PolicySearchCache::new();
        let (a, b, c) = (Eid::new(1, 1), Eid::new(2, 1), Eid::new(3, 1));

        assert!(cache.lookup(&a, &b, &c, Role::Acceptor).is_none());
        cache.store(&a, &b, &c, Role::Acceptor, None);

        // same key: negative result served from cache
        let hit = cache.lookup(&a, &b, &c, Role::Acceptor);
        assert!(matches!(hit, Some(None)));
        assert!(cache.was_cache_hit());
        assert_eq!(cache.num_lookups, 2);
        assert_eq!(cache.num_cache_hits, 1);

        // different role: miss
        assert!(cache.lookup(&a, &b, &c, Role::Verifier).is_none());
        assert!(!cache.was_cache_hit());
    }
}
