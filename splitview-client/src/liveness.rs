//! Target heartbeats and the Source-side freshness check.

use std::time::Duration;

use serde_json::json;
use splitview_core::{InstanceId, PairId, keys};
use tracing::{debug, info};

use crate::store::SharedStore;

/// Heartbeat written by a Target. Released on role exit or shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
struct HeartbeatLease {
    key: String,
}

#[derive(Debug, Default)]
pub struct LivenessMonitor {
    lease: Option<HeartbeatLease>,
}

impl LivenessMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_beating(&self) -> bool {
        self.lease.is_some()
    }

    /// Takes the lease and writes the first heartbeat right away, so a Source
    /// sees the Target as live before the first interval tick.
    pub fn start(
        &mut self,
        store: &dyn SharedStore,
        pair_id: &PairId,
        instance_id: &InstanceId,
        now_ms: u64,
    ) {
        self.stop(store);
        let key = keys::heartbeat(pair_id, instance_id);
        store.set(&key, json!(now_ms));
        info!(pair_id = %pair_id, "heartbeat started");
        self.lease = Some(HeartbeatLease { key });
    }

    pub fn beat(&self, store: &dyn SharedStore, now_ms: u64) {
        if let Some(lease) = &self.lease {
            store.set(&lease.key, json!(now_ms));
        }
    }

    /// Best-effort delete of our heartbeat key.
    pub fn stop(&mut self, store: &dyn SharedStore) {
        if let Some(lease) = self.lease.take() {
            store.delete(&lease.key);
            debug!(key = %lease.key, "heartbeat stopped");
        }
    }
}

/// True when some Target of `pair_id` has beaten within `freshness`.
pub fn has_live_target(
    store: &dyn SharedStore,
    pair_id: &PairId,
    now_ms: u64,
    freshness: Duration,
) -> bool {
    let freshness_ms = freshness.as_millis() as u64;
    store
        .keys_with_prefix(&keys::heartbeat_prefix(pair_id))
        .iter()
        .filter_map(|key| store.get_u64(key))
        .any(|beat| now_ms.saturating_sub(beat) < freshness_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const FRESHNESS: Duration = Duration::from_secs(5);

    #[test]
    fn start_writes_immediately_and_stop_deletes() {
        let store = MemoryStore::new();
        let handle = store.handle();
        let pair = "p1".to_owned();
        let mut monitor = LivenessMonitor::new();

        monitor.start(&*handle, &pair, &"t1".to_owned(), 1_000);
        assert!(monitor.is_beating());
        assert!(has_live_target(&*handle, &pair, 1_000, FRESHNESS));

        monitor.stop(&*handle);
        assert!(!monitor.is_beating());
        assert!(store.keys().is_empty());
        assert!(!has_live_target(&*handle, &pair, 1_000, FRESHNESS));
    }

    #[test]
    fn stale_heartbeat_is_not_live() {
        let store = MemoryStore::new();
        let handle = store.handle();
        let pair = "p1".to_owned();
        let mut monitor = LivenessMonitor::new();
        monitor.start(&*handle, &pair, &"t1".to_owned(), 10_000);

        assert!(has_live_target(&*handle, &pair, 14_999, FRESHNESS));
        assert!(!has_live_target(&*handle, &pair, 16_000, FRESHNESS));

        monitor.beat(&*handle, 15_000);
        assert!(has_live_target(&*handle, &pair, 16_000, FRESHNESS));
    }

    #[test]
    fn any_fresh_target_of_the_pair_counts() {
        let store = MemoryStore::new();
        let handle = store.handle();
        let pair = "p1".to_owned();
        handle.set(&keys::heartbeat(&pair, &"old".to_owned()), json!(1_000));
        handle.set(&keys::heartbeat(&pair, &"new".to_owned()), json!(9_000));
        handle.set(&keys::heartbeat(&"p2".to_owned(), &"x".to_owned()), json!(9_000));

        assert!(has_live_target(&*handle, &pair, 10_000, FRESHNESS));
        assert!(!has_live_target(&*handle, &"p3".to_owned(), 10_000, FRESHNESS));
    }

    #[test]
    fn beat_without_lease_writes_nothing() {
        let store = MemoryStore::new();
        LivenessMonitor::new().beat(&*store.handle(), 5);
        assert!(store.keys().is_empty());
    }
}
