//! Pair-scoped disconnects and the profile-wide reset.

use serde_json::json;
use splitview_core::{PairId, keys};
use tracing::info;

use crate::store::{SharedStore, ValueChange};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownScope {
    Pair,
    Global,
}

pub fn signal_pair_disconnect(store: &dyn SharedStore, pair_id: &PairId, now_ms: u64) {
    store.set(&keys::disconnect(pair_id), json!(now_ms));
    info!(pair_id = %pair_id, "disconnect signalled");
}

/// Deletes every key of the profile except the shortcut config, then bumps
/// the reset counter. Returns how many keys were swept.
pub fn signal_global_reset(store: &dyn SharedStore, now_ms: u64) -> usize {
    let swept: Vec<String> = store
        .keys_with_prefix(keys::PREFIX)
        .into_iter()
        .filter(|key| key != keys::CONFIG)
        .collect();
    for key in &swept {
        store.delete(key);
    }
    store.set(keys::GLOBAL_RESET, json!(now_ms));
    info!(swept = swept.len(), "global reset signalled");
    swept.len()
}

/// Whether `change` tears down a tab paired under `pair_id`. Only changes
/// made by other tabs count; our own writes are already acted upon.
pub fn teardown_scope(change: &ValueChange, pair_id: Option<&PairId>) -> Option<TeardownScope> {
    if !change.remote {
        return None;
    }
    let pair_id = pair_id?;
    if change.key == keys::GLOBAL_RESET {
        Some(TeardownScope::Global)
    } else if change.key == keys::disconnect(pair_id) {
        Some(TeardownScope::Pair)
    } else {
        None
    }
}
