//! Operational counters exposed read-only to telemetry.

use std::sync::atomic::{AtomicU64, Ordering};

use bpn_storage::StoreCounters;

/// Node-level counters; storage counters are merged in at snapshot time.
#[derive(Debug, Default)]
pub struct NodeCounters {
    bundles_received_from_ingress: AtomicU64,
    bundles_dropped_by_security: AtomicU64,
}

/// A point-in-time view of every counter named by the telemetry contract.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[must_use]
pub struct NodeCountersSnapshot {
    pub num_bundles_received_from_ingress: u64,
    pub num_bundles_dropped_by_security: u64,
    pub num_bundles_stored: u64,
    pub num_bundles_sent_to_egress: u64,
    pub num_bundles_deleted_from_storage: u64,
    pub num_bundles_restored: u64,
    pub num_bytes_restored: u64,
    pub num_segments_restored: u64,
}

impl NodeCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_received(&self) {
        self.bundles_received_from_ingress
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_dropped_by_security(&self) {
        self.bundles_dropped_by_security
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Merge node counters with a storage snapshot.
    #[must_use]
    pub fn snapshot(&self, store: StoreCounters) -> NodeCountersSnapshot {
        NodeCountersSnapshot {
            num_bundles_received_from_ingress: self
                .bundles_received_from_ingress
                .load(Ordering::Relaxed),
            num_bundles_dropped_by_security: self
                .bundles_dropped_by_security
                .load(Ordering::Relaxed),
            num_bundles_stored: store.num_bundles_stored,
            num_bundles_sent_to_egress: store.num_bundles_sent_to_egress,
            num_bundles_deleted_from_storage: store.num_bundles_deleted_from_storage,
            num_bundles_restored: store.num_bundles_restored,
            num_bytes_restored: store.num_bytes_restored,
            num_segments_restored: store.num_segments_restored,
        }
    }
}
