//! Handshakes that turn an Idle tab into a Source or Target of a group.
//!
//! Two paths exist. The direct one carries a [`DragPayload`] in the drop
//! data of a drag gesture started on a paired tab. The broadcast one writes a
//! [`PairRequest`] to the SharedStore for any Idle, visible tab to pick up.
//! A [`PairRequest`] can also be handed straight to a single runtime when
//! the gesture ends inside the same page, which skips the store entirely.

use std::time::Duration;

use serde_json::Value;
use splitview_core::{
    DragPayload, InstanceId, LatestSourceRecord, PairId, PairRequest, Role, TabState, keys,
};
use tracing::debug;

use crate::store::SharedStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropDecision {
    /// A Source's payload landed here: follow it.
    BecomeTarget(PairId),
    /// A Target's payload landed here: lead it alongside the existing Source.
    JoinAsSource(PairId),
}

/// What to do with a role request dropped on a tab whose instance is
/// `own_instance`. Drops of a tab's own payload are ignored.
pub fn decide_drop(payload: &DragPayload, own_instance: &InstanceId) -> Option<DropDecision> {
    if &payload.instance_id == own_instance {
        debug!("ignoring drop of our own role payload");
        return None;
    }
    match payload.role {
        Role::Source => Some(DropDecision::BecomeTarget(payload.source_id.clone())),
        Role::Target => Some(DropDecision::JoinAsSource(payload.source_id.clone())),
        Role::Idle => None,
    }
}

/// The payload a paired tab offers when a drag starts on its status dot.
pub fn drag_payload(state: &TabState, now_ms: u64) -> Option<DragPayload> {
    let pair_id = state.pair_id.as_ref()?;
    if state.role.is_idle() {
        return None;
    }
    Some(DragPayload {
        source_id: pair_id.clone(),
        role: state.role,
        instance_id: state.instance_id.clone(),
        timestamp: now_ms,
    })
}

/// Facts about the receiving tab that decide whether it answers a broadcast.
#[derive(Debug, Clone, Copy)]
pub struct PairRequestGuard<'a> {
    pub role: Role,
    pub visible: bool,
    pub instance_id: &'a InstanceId,
    pub now_ms: u64,
    pub window: Duration,
}

pub fn parse_pair_request(value: Option<&Value>) -> Option<PairRequest> {
    let value = value?;
    match serde_json::from_value::<PairRequest>(value.clone()) {
        Ok(request) if !request.source_id.trim().is_empty() => Some(request),
        Ok(_) => None,
        Err(err) => {
            debug!("ignoring malformed pair request: {}", err);
            None
        }
    }
}

/// The pair to join, if this tab should answer `request`. Only Idle and
/// visible tabs answer, never the tab that asked, and only within `window`.
pub fn accept_pair_request(request: &PairRequest, guard: &PairRequestGuard<'_>) -> Option<PairId> {
    if !guard.role.is_idle() || !guard.visible {
        return None;
    }
    if request.instance_id.as_ref() == Some(guard.instance_id) {
        return None;
    }
    let age_ms = guard.now_ms.saturating_sub(request.timestamp);
    if age_ms > guard.window.as_millis() as u64 {
        debug!(age_ms, "pair request expired");
        return None;
    }
    Some(request.source_id.clone())
}

pub fn broadcast_pair_request(
    store: &dyn SharedStore,
    pair_id: &PairId,
    instance_id: &InstanceId,
    now_ms: u64,
) {
    store.set_json(
        keys::PAIR_REQUEST,
        &PairRequest {
            source_id: pair_id.clone(),
            instance_id: Some(instance_id.clone()),
            timestamp: now_ms,
        },
    );
}

pub fn latest_source(store: &dyn SharedStore) -> Option<LatestSourceRecord> {
    store.get_json::<LatestSourceRecord>(keys::LATEST_SOURCE)
}

pub fn record_latest_source(store: &dyn SharedStore, pair_id: &PairId, now_ms: u64) {
    store.set_json(
        keys::LATEST_SOURCE,
        &LatestSourceRecord {
            source_id: pair_id.clone(),
            timestamp: now_ms,
        },
    );
}

pub fn is_recent(record: &LatestSourceRecord, now_ms: u64, window: Duration) -> bool {
    now_ms.saturating_sub(record.timestamp) < window.as_millis() as u64
}

/// A request for a Source's group addressed to this tab only. There is no
/// race to guard against, so only the Idle and self checks apply.
pub fn accept_direct_request(
    request: &PairRequest,
    role: Role,
    own_instance: &InstanceId,
) -> Option<PairId> {
    if !role.is_idle() || request.instance_id.as_ref() == Some(own_instance) {
        return None;
    }
    Some(request.source_id.clone())
}

/// Adds `source_tab_id` to the group's source list.
pub fn register_source(store: &dyn SharedStore, pair_id: &PairId, source_tab_id: &str) {
    let key = keys::sources(pair_id);
    let mut sources = store.get_json::<Vec<String>>(&key).unwrap_or_default();
    if sources.iter().any(|existing| existing == source_tab_id) {
        return;
    }
    sources.push(source_tab_id.to_owned());
    store.set_json(&key, &sources);
}
