use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use splitview_core::{
    ControlMessage, MUTATION_BURST, MUTATIONS_PER_SECOND, ProfileId, StoreMutation, WireMessage,
    decode_frame, encode_frame,
};
use thiserror::Error;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, timeout},
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::{ChangeSink, ListenerId, ListenerRegistry, SharedStore};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const MAX_CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(12);
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(5);
const BACKOFF_BASE_MS: u64 = 200;

/// Listener owner for writes made by this process.
const LOCAL_OWNER: u64 = 0;

/// Share of the relay's mutation budget this client allows itself, leaving
/// headroom for frames that arrive bunched up.
const SEND_BUDGET_SHARE: f64 = 0.75;

#[derive(Debug, Error)]
pub enum RelayStoreError {
    #[error("invalid relay url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("relay rejected the session: {0}")]
    Rejected(String),
}

#[derive(Debug, Default)]
struct Replica {
    entries: BTreeMap<String, Value>,
    listeners: ListenerRegistry,
    /// Own writes per key that the relay has not answered yet.
    pending: HashMap<String, usize>,
}

impl Replica {
    fn replace(&mut self, key: &str, new: &Option<Value>) -> Option<Value> {
        match new {
            Some(value) => self.entries.insert(key.to_owned(), value.clone()),
            None => self.entries.remove(key),
        }
    }

    fn begin_write(&mut self, key: &str) {
        *self.pending.entry(key.to_owned()).or_default() += 1;
    }

    /// Settles one own write of `key` and returns how many are still open.
    fn finish_write(&mut self, key: &str) -> usize {
        let Some(open) = self.pending.get_mut(key) else {
            return 0;
        };
        *open = open.saturating_sub(1);
        let left = *open;
        if left == 0 {
            self.pending.remove(key);
        }
        left
    }

    fn has_pending(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }

    /// Moves `key` to the relay's value, notifying listeners only if the
    /// replica showed something else.
    fn converge(&mut self, key: &str, new: Option<Value>) {
        if self.entries.get(key) == new.as_ref() {
            return;
        }
        let old = self.replace(key, &new);
        self.listeners.notify(key, &old, &new, None);
    }
}

/// Client-side pacing so mutations stay inside the relay's budget instead
/// of being dropped there. Tokens may go negative; the debt is the wait.
#[derive(Debug)]
struct SendBudget {
    capacity: f64,
    refill_per_second: f64,
    tokens: f64,
    last_refill: Instant,
}

impl SendBudget {
    fn for_relay() -> Self {
        let capacity = f64::from(MUTATION_BURST) * SEND_BUDGET_SHARE;
        Self {
            capacity,
            refill_per_second: f64::from(MUTATIONS_PER_SECOND) * SEND_BUDGET_SHARE,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    /// Takes one token and returns how long to wait before sending.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * self.refill_per_second).min(self.capacity);
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.refill_per_second)
        }
    }
}

/// SharedStore backed by a relay profile. Reads are served from a local
/// replica seeded by the relay snapshot; writes apply locally first and are
/// then forwarded. The relay echoes every write back, which converges the
/// replica to the relay's order without notifying local listeners twice.
#[derive(Debug)]
pub struct RelayStore {
    client_id: String,
    replica: Mutex<Replica>,
    outgoing: mpsc::UnboundedSender<WireMessage>,
}

/// Background network tasks of a connected [`RelayStore`].
#[derive(Debug)]
pub struct RelayTasks {
    send_task: JoinHandle<()>,
    receive_task: JoinHandle<()>,
}

impl RelayTasks {
    /// Resolves when either side of the connection ends.
    pub async fn closed(self) {
        let RelayTasks {
            send_task,
            receive_task,
        } = self;
        tokio::select! {
            _ = send_task => {}
            _ = receive_task => {}
        }
    }

    pub fn abort(&self) {
        self.send_task.abort();
        self.receive_task.abort();
    }
}

impl RelayStore {
    pub async fn connect(
        relay_url: &str,
        profile_id: &ProfileId,
        client_id: &str,
    ) -> Result<(Arc<Self>, RelayTasks), RelayStoreError> {
        url::Url::parse(relay_url).map_err(|err| RelayStoreError::InvalidUrl {
            url: relay_url.to_owned(),
            reason: err.to_string(),
        })?;

        let ws_stream = connect_with_retry(relay_url).await?;
        let (mut write_half, mut read_half) = ws_stream.split();

        let hello = WireMessage::Control(ControlMessage::Hello {
            profile_id: profile_id.clone(),
            client_id: client_id.to_owned(),
        });
        let frame = encode_frame(&hello).map_err(|err| RelayStoreError::Handshake(err.to_string()))?;
        write_half
            .send(Message::Binary(frame.into()))
            .await
            .map_err(|err| RelayStoreError::Handshake(err.to_string()))?;

        let entries = timeout(SNAPSHOT_TIMEOUT, wait_for_snapshot(&mut read_half))
            .await
            .map_err(|_| RelayStoreError::Timeout(SNAPSHOT_TIMEOUT))??;

        info!(
            profile_id = %profile_id,
            client_id,
            entries = entries.len(),
            "relay snapshot received"
        );

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel::<WireMessage>();
        let store = Arc::new(Self::with_snapshot(client_id, entries, outgoing));

        let send_task = tokio::spawn(network_send_task(write_half, outgoing_rx));
        let receive_task = tokio::spawn(network_receive_task(read_half, Arc::clone(&store)));

        Ok((
            store,
            RelayTasks {
                send_task,
                receive_task,
            },
        ))
    }

    fn with_snapshot(
        client_id: &str,
        entries: BTreeMap<String, Value>,
        outgoing: mpsc::UnboundedSender<WireMessage>,
    ) -> Self {
        Self {
            client_id: client_id.to_owned(),
            replica: Mutex::new(Replica {
                entries,
                ..Replica::default()
            }),
            outgoing,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Applies a `Changed` notification from the relay. While one of our
    /// own writes to the key is still in flight, the relay will order it
    /// after this change, so the replica keeps showing our value.
    fn apply_changed(&self, key: &str, new: Option<Value>, writer_id: &str) {
        let mut replica = self.replica();

        if writer_id == self.client_id {
            if replica.finish_write(key) > 0 {
                return;
            }
            // Usually a no-op: listeners already saw the optimistic write.
            replica.converge(key, new);
            return;
        }

        if replica.has_pending(key) {
            debug!(key, "remote change superseded by a pending local write");
            return;
        }
        let old = replica.replace(key, &new);
        replica.listeners.notify(key, &old, &new, None);
    }

    /// Rolls a dropped write back to what the relay holds.
    fn apply_rejected(&self, key: &str, value: Option<Value>, reason: &str) {
        warn!(key, reason, "relay rejected a write");
        let mut replica = self.replica();
        if replica.finish_write(key) > 0 {
            return;
        }
        replica.converge(key, value);
    }

    fn write(&self, key: &str, new: Option<Value>) {
        {
            let mut replica = self.replica();
            let old = replica.replace(key, &new);
            replica.begin_write(key);
            replica
                .listeners
                .notify(key, &old, &new, Some(LOCAL_OWNER));
        }

        let mutation = match new {
            Some(value) => StoreMutation::Set {
                key: key.to_owned(),
                value,
            },
            None => StoreMutation::Delete {
                key: key.to_owned(),
            },
        };
        if self.outgoing.send(WireMessage::Mutation(mutation)).is_err() {
            warn!(key, "relay connection closed; write kept locally only");
            self.replica().finish_write(key);
        }
    }

    fn replica(&self) -> MutexGuard<'_, Replica> {
        self.replica
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SharedStore for RelayStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.replica().entries.get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        self.write(key, Some(value));
    }

    fn delete(&self, key: &str) {
        self.write(key, None);
    }

    fn list_keys(&self) -> Vec<String> {
        self.replica().entries.keys().cloned().collect()
    }

    fn add_listener(&self, key: &str, sink: ChangeSink) -> ListenerId {
        self.replica().listeners.add(LOCAL_OWNER, key, sink)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.replica().listeners.remove(id);
    }
}

async fn connect_with_retry(relay_url: &str) -> Result<WsStream, RelayStoreError> {
    let mut attempt: u32 = 1;
    loop {
        info!(
            attempt,
            max_attempts = MAX_CONNECT_ATTEMPTS,
            relay_url,
            "connecting"
        );

        let failure = match timeout(CONNECT_TIMEOUT, connect_async(relay_url)).await {
            Ok(Ok((ws_stream, _))) => return Ok(ws_stream),
            Ok(Err(err)) => RelayStoreError::Connect(err.to_string()),
            Err(_) => RelayStoreError::Timeout(CONNECT_TIMEOUT),
        };
        error!(attempt, relay_url, "{failure}");
        if attempt >= MAX_CONNECT_ATTEMPTS {
            return Err(failure);
        }

        let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        attempt += 1;
    }
}

async fn wait_for_snapshot(
    read_half: &mut futures::stream::SplitStream<WsStream>,
) -> Result<BTreeMap<String, Value>, RelayStoreError> {
    while let Some(next) = read_half.next().await {
        let message = next.map_err(|err| RelayStoreError::Handshake(err.to_string()))?;
        let data = match message {
            Message::Binary(data) => data,
            Message::Close(_) => break,
            _ => continue,
        };
        match decode_frame(&data) {
            Ok(WireMessage::Control(ControlMessage::Snapshot { entries, .. })) => {
                return Ok(entries);
            }
            Ok(WireMessage::Control(ControlMessage::Error { message })) => {
                return Err(RelayStoreError::Rejected(message));
            }
            Ok(other) => debug!("ignoring frame before snapshot: {:?}", other),
            Err(err) => warn!("decode frame failed: {}", err),
        }
    }
    Err(RelayStoreError::Handshake(
        "connection closed before snapshot".to_owned(),
    ))
}

async fn network_send_task(
    mut ws_write: futures::stream::SplitSink<WsStream, Message>,
    mut outgoing_rx: mpsc::UnboundedReceiver<WireMessage>,
) {
    let mut budget = SendBudget::for_relay();
    while let Some(message) = outgoing_rx.recv().await {
        if matches!(message, WireMessage::Mutation(_)) {
            let wait = budget.reserve();
            if !wait.is_zero() {
                debug!(wait_ms = wait.as_millis() as u64, "pacing writes to the relay");
                tokio::time::sleep(wait).await;
            }
        }
        match encode_frame(&message) {
            Ok(frame) => {
                if ws_write.send(Message::Binary(frame.into())).await.is_err() {
                    break;
                }
            }
            Err(err) => warn!("failed to encode outgoing frame: {}", err),
        }
    }
}

async fn network_receive_task(
    mut ws_read: futures::stream::SplitStream<WsStream>,
    store: Arc<RelayStore>,
) {
    while let Some(next) = ws_read.next().await {
        let message = match next {
            Ok(message) => message,
            Err(err) => {
                warn!("relay read failed: {}", err);
                break;
            }
        };

        let data = match message {
            Message::Binary(data) => data,
            Message::Close(_) => break,
            _ => continue,
        };

        match decode_frame(&data) {
            Ok(WireMessage::Mutation(StoreMutation::Changed {
                key,
                new,
                writer_id,
                ..
            })) => store.apply_changed(&key, new, &writer_id),
            Ok(WireMessage::Control(ControlMessage::Rejected { key, value, reason })) => {
                store.apply_rejected(&key, value, &reason);
            }
            Ok(WireMessage::Control(ControlMessage::Error { message })) => {
                warn!("relay error: {}", message);
            }
            Ok(other) => debug!("ignoring unexpected frame: {:?}", other),
            Err(err) => warn!("decode frame failed: {}", err),
        }
    }
    info!(client_id = %store.client_id, "relay connection closed");
}
