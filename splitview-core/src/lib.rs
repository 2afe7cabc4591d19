use std::collections::BTreeMap;

use bytes::{Buf, BufMut, BytesMut};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const MAX_RELAY_MESSAGE_BYTES: usize = 256 * 1024;
pub const MAX_VALUE_BYTES: usize = 64 * 1024;
pub const MAX_TABS_PER_PROFILE: usize = 64;
/// Per-connection mutation budget on the relay: burst size and refill rate.
pub const MUTATION_BURST: u32 = 64;
pub const MUTATIONS_PER_SECOND: u32 = 32;
pub const ID_LEN: usize = 9;
pub const MIME_ROLE_REQUEST: &str = "application/stm-role-request";
pub const MIME_TEXT_PLAIN: &str = "text/plain";
pub const MIME_URI_LIST: &str = "text/uri-list";
pub const TEXT_ROLE_PREFIX: &str = "STM_ROLE:";
const FAST_CACHE_MARKER: &str = "{\"stmRole\"";
const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

pub type PairId = String;
pub type InstanceId = String;
pub type TabId = String;
pub type ProfileId = String;
pub type Seq = u64;

/// Drag data as the platform hands it over: MIME type to string payload.
pub type DragData = BTreeMap<String, String>;

/// SharedStore key schema. Every key shares [`keys::PREFIX`] so a reset can
/// sweep them without touching unrelated values.
pub mod keys {
    use super::{InstanceId, PairId, TabId};

    pub const PREFIX: &str = "stm_v18_";
    pub const LATEST_SOURCE: &str = "stm_v18_latest_source";
    pub const CONFIG: &str = "stm_v18_config";
    pub const GLOBAL_RESET: &str = "stm_v18_global_reset";
    pub const PAIR_REQUEST: &str = "stm_v18_drag_pair_request";

    pub fn url(pair_id: &PairId) -> String {
        format!("{PREFIX}url_{pair_id}")
    }

    pub fn seq(pair_id: &PairId) -> String {
        format!("{PREFIX}ts_{pair_id}")
    }

    pub fn disconnect(pair_id: &PairId) -> String {
        format!("{PREFIX}disconnect_{pair_id}")
    }

    pub fn sources(pair_id: &PairId) -> String {
        format!("{PREFIX}sources_{pair_id}")
    }

    pub fn tab_state(tab_id: &TabId) -> String {
        format!("{PREFIX}tab_state_{tab_id}")
    }

    pub fn heartbeat_prefix(pair_id: &PairId) -> String {
        format!("{PREFIX}hb_{pair_id}_")
    }

    pub fn heartbeat(pair_id: &PairId, instance_id: &InstanceId) -> String {
        format!("{}{instance_id}", heartbeat_prefix(pair_id))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Idle,
    Source,
    Target,
}

impl Role {
    pub fn is_idle(self) -> bool {
        self == Role::Idle
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Idle => "idle",
            Role::Source => "source",
            Role::Target => "target",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live state of one tab. Only the role state machine mutates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabState {
    pub role: Role,
    pub pair_id: Option<PairId>,
    pub instance_id: InstanceId,
    pub last_applied_seq: Seq,
    pub source_tab_id: Option<String>,
    pub muted: bool,
}

impl TabState {
    pub fn idle(instance_id: InstanceId) -> Self {
        Self {
            role: Role::Idle,
            pair_id: None,
            instance_id,
            last_applied_seq: 0,
            source_tab_id: None,
            muted: false,
        }
    }

    /// Rebuild a tab from persisted data. A non-idle record without a pair id
    /// is treated as idle.
    pub fn restore(instance_id: InstanceId, persisted: &PersistedTabState) -> Self {
        match (&persisted.role, &persisted.id) {
            (Role::Idle, _) | (_, None) => Self::idle(instance_id),
            (role, Some(id)) => Self {
                role: *role,
                pair_id: Some(id.clone()),
                instance_id,
                last_applied_seq: persisted.last_ts,
                source_tab_id: persisted.source_tab_id.clone(),
                muted: persisted.is_muted,
            },
        }
    }

    pub fn to_persisted(&self) -> PersistedTabState {
        PersistedTabState {
            role: self.role,
            id: self.pair_id.clone(),
            last_ts: self.last_applied_seq,
            source_tab_id: self.source_tab_id.clone(),
            is_muted: self.muted,
        }
    }
}

/// Tab-scoped record written to the session and durable tiers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PersistedTabState {
    pub role: Role,
    #[serde(default)]
    pub id: Option<PairId>,
    #[serde(default)]
    pub last_ts: Seq,
    #[serde(default)]
    pub source_tab_id: Option<String>,
    #[serde(default)]
    pub is_muted: bool,
}

impl PersistedTabState {
    pub fn is_active(&self) -> bool {
        !self.role.is_idle() && self.id.is_some()
    }
}

/// Encoding used by the in-page fast cache (the window-name channel).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct FastCachePayload {
    #[serde(rename = "stmRole")]
    role: Role,
    #[serde(rename = "stmId")]
    id: Option<PairId>,
    #[serde(rename = "stmLastTs", default)]
    last_ts: Seq,
    #[serde(rename = "stmSourceTabId", default)]
    source_tab_id: Option<String>,
    #[serde(rename = "stmIsMuted", default)]
    is_muted: bool,
}

pub fn encode_fast_cache(state: &PersistedTabState) -> Result<String, CoreError> {
    let payload = FastCachePayload {
        role: state.role,
        id: state.id.clone(),
        last_ts: state.last_ts,
        source_tab_id: state.source_tab_id.clone(),
        is_muted: state.is_muted,
    };
    serde_json::to_string(&payload).map_err(|err| CoreError::Serialization(err.to_string()))
}

/// `Ok(None)` when the channel holds something that is not ours.
pub fn decode_fast_cache(raw: &str) -> Result<Option<PersistedTabState>, CoreError> {
    if !is_fast_cache_payload(raw) {
        return Ok(None);
    }
    let payload: FastCachePayload =
        serde_json::from_str(raw).map_err(|err| CoreError::MalformedState(err.to_string()))?;
    Ok(Some(PersistedTabState {
        role: payload.role,
        id: payload.id,
        last_ts: payload.last_ts,
        source_tab_id: payload.source_tab_id,
        is_muted: payload.is_muted,
    }))
}

pub fn is_fast_cache_payload(raw: &str) -> bool {
    raw.starts_with(FAST_CACHE_MARKER)
}

pub fn decode_persisted(raw: &str) -> Result<PersistedTabState, CoreError> {
    serde_json::from_str(raw).map_err(|err| CoreError::MalformedState(err.to_string()))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LatestSourceRecord {
    pub source_id: PairId,
    pub timestamp: u64,
}

/// Broadcast pairing request written by a Source after a drag gesture.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PairRequest {
    pub source_id: PairId,
    #[serde(default)]
    pub instance_id: Option<InstanceId>,
    pub timestamp: u64,
}

/// Typed payload attached to a drag gesture started on a paired tab.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DragPayload {
    pub source_id: PairId,
    pub role: Role,
    pub instance_id: InstanceId,
    pub timestamp: u64,
}

impl DragPayload {
    pub fn to_drag_data(&self) -> Result<DragData, CoreError> {
        if self.role.is_idle() {
            return Err(CoreError::IdleDragPayload);
        }
        let json =
            serde_json::to_string(self).map_err(|err| CoreError::Serialization(err.to_string()))?;
        let mut data = DragData::new();
        data.insert(MIME_TEXT_PLAIN.to_owned(), format!("{TEXT_ROLE_PREFIX}{json}"));
        data.insert(MIME_ROLE_REQUEST.to_owned(), json);
        Ok(data)
    }

    /// Reads a role request out of dropped data, preferring the typed MIME
    /// entry over the `text/plain` fallback. `Ok(None)` means the drop was not
    /// a role request at all.
    pub fn from_drag_data(data: &DragData) -> Result<Option<Self>, CoreError> {
        let raw = match data.get(MIME_ROLE_REQUEST).filter(|s| !s.is_empty()) {
            Some(json) => json.as_str(),
            None => match data
                .get(MIME_TEXT_PLAIN)
                .and_then(|plain| plain.strip_prefix(TEXT_ROLE_PREFIX))
            {
                Some(json) => json,
                None => return Ok(None),
            },
        };

        let payload: DragPayload = serde_json::from_str(raw)
            .map_err(|err| CoreError::MalformedDragPayload(err.to_string()))?;
        if payload.role.is_idle() {
            return Err(CoreError::IdleDragPayload);
        }
        if payload.source_id.trim().is_empty() || payload.instance_id.trim().is_empty() {
            return Err(CoreError::MalformedDragPayload(
                "empty sourceId or instanceId".to_owned(),
            ));
        }
        Ok(Some(payload))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data")]
pub enum ControlMessage {
    Hello {
        profile_id: ProfileId,
        client_id: String,
    },
    Snapshot {
        profile_id: ProfileId,
        entries: BTreeMap<String, Value>,
    },
    Error {
        message: String,
    },
    /// Sent to the writer only when a mutation is dropped. `value` is what
    /// the relay holds for `key` at that point.
    Rejected {
        key: String,
        value: Option<Value>,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data")]
pub enum StoreMutation {
    Set {
        key: String,
        value: Value,
    },
    Delete {
        key: String,
    },
    Changed {
        key: String,
        old: Option<Value>,
        new: Option<Value>,
        writer_id: String,
    },
}

impl StoreMutation {
    pub fn key(&self) -> &str {
        match self {
            StoreMutation::Set { key, .. }
            | StoreMutation::Delete { key }
            | StoreMutation::Changed { key, .. } => key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Control(ControlMessage),
    Mutation(StoreMutation),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Control = 0,
    Mutation = 1,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid frame length")]
    InvalidFrameLength,
    #[error("unsupported message type {0}")]
    UnsupportedMessageType(u8),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("store key must not be empty")]
    EmptyKey,
    #[error("value for {key} exceeds {max} bytes")]
    ValueTooLarge { key: String, max: usize },
    #[error("malformed drag payload: {0}")]
    MalformedDragPayload(String),
    #[error("drag payload must carry a source or target role")]
    IdleDragPayload,
    #[error("malformed persisted state: {0}")]
    MalformedState(String),
    #[error("stale or duplicate sequence: got {incoming}, last applied {last_applied}")]
    StaleSequence { incoming: Seq, last_applied: Seq },
}

/// Next navigation sequence number. Stays strictly above `previous` even when
/// the wall clock stalls or runs backwards.
pub fn next_sequence(now_ms: u64, previous: Seq) -> Seq {
    now_ms.max(previous.saturating_add(1))
}

pub fn validate_sequence(last_applied: Seq, incoming: Seq) -> Result<(), CoreError> {
    if incoming <= last_applied {
        return Err(CoreError::StaleSequence {
            incoming,
            last_applied,
        });
    }
    Ok(())
}

pub fn validate_mutation(mutation: &StoreMutation) -> Result<(), CoreError> {
    let key = mutation.key();
    if key.trim().is_empty() {
        return Err(CoreError::EmptyKey);
    }
    if let StoreMutation::Set { value, .. } = mutation {
        let size = serde_json::to_vec(value)
            .map_err(|err| CoreError::Serialization(err.to_string()))?
            .len();
        if size > MAX_VALUE_BYTES {
            return Err(CoreError::ValueTooLarge {
                key: key.to_owned(),
                max: MAX_VALUE_BYTES,
            });
        }
    }
    Ok(())
}

pub fn encode_frame(message: &WireMessage) -> Result<Vec<u8>, CoreError> {
    let (message_type, payload) = match message {
        WireMessage::Control(control) => (
            MessageType::Control as u8,
            serde_json::to_vec(control).map_err(|err| CoreError::Serialization(err.to_string()))?,
        ),
        WireMessage::Mutation(mutation) => (
            MessageType::Mutation as u8,
            serde_json::to_vec(mutation)
                .map_err(|err| CoreError::Serialization(err.to_string()))?,
        ),
    };

    let frame_len = 1usize
        .checked_add(payload.len())
        .ok_or(CoreError::InvalidFrameLength)?;
    let frame_len_u32 = u32::try_from(frame_len).map_err(|_| CoreError::InvalidFrameLength)?;

    let mut out = BytesMut::with_capacity(4 + frame_len);
    out.put_u32_le(frame_len_u32);
    out.put_u8(message_type);
    out.extend_from_slice(&payload);
    Ok(out.to_vec())
}

pub fn decode_frame(frame: &[u8]) -> Result<WireMessage, CoreError> {
    if frame.len() < 5 {
        return Err(CoreError::InvalidFrameLength);
    }

    let mut cursor = frame;
    let expected_len = cursor.get_u32_le() as usize;
    if expected_len + 4 != frame.len() {
        return Err(CoreError::InvalidFrameLength);
    }

    let message_type = cursor.get_u8();
    let payload = cursor;

    match message_type {
        x if x == MessageType::Control as u8 => {
            let control: ControlMessage = serde_json::from_slice(payload)
                .map_err(|err| CoreError::Serialization(err.to_string()))?;
            Ok(WireMessage::Control(control))
        }
        x if x == MessageType::Mutation as u8 => {
            let mutation: StoreMutation = serde_json::from_slice(payload)
                .map_err(|err| CoreError::Serialization(err.to_string()))?;
            Ok(WireMessage::Mutation(mutation))
        }
        other => Err(CoreError::UnsupportedMessageType(other)),
    }
}

/// Random base36 identifier used for pair ids, instance ids and tab ids.
pub fn generate_id() -> String {
    let mut rng = rand::rng();
    (0..ID_LEN)
        .map(|_| ID_ALPHABET[rng.random_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

pub fn profile_id_from_name(profile_name: &str) -> ProfileId {
    let digest = Sha256::digest(profile_name.as_bytes());
    hex::encode(digest)
}
