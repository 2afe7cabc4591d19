use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
    time::Instant,
};

use axum::{
    Json, Router,
    extract::{Path, State, WebSocketUpgrade, ws::Message},
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use splitview_core::{
    ControlMessage, MAX_RELAY_MESSAGE_BYTES, MAX_TABS_PER_PROFILE, MUTATION_BURST,
    MUTATIONS_PER_SECOND, ProfileId, StoreMutation, WireMessage, decode_frame, encode_frame,
    validate_mutation,
};
use tokio::{
    net::TcpListener,
    sync::{RwLock, mpsc},
};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
struct Connection {
    client_id: String,
    tx: mpsc::UnboundedSender<Message>,
}

/// One SharedStore namespace. Entries outlive the tabs that wrote them.
#[derive(Debug, Default)]
struct Profile {
    clients: HashMap<String, Connection>,
    entries: BTreeMap<String, Value>,
}

#[derive(Debug, Default)]
struct RelayState {
    profiles: HashMap<ProfileId, Profile>,
}

#[derive(Debug, Clone)]
pub struct AppState {
    inner: Arc<RwLock<RelayState>>,
}

impl AppState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(RelayState::default())),
        }
    }

    /// Current value of `key` in `profile_id`, if any.
    pub async fn value(&self, profile_id: &str, key: &str) -> Option<Value> {
        let relay = self.inner.read().await;
        relay
            .profiles
            .get(profile_id)
            .and_then(|profile| profile.entries.get(key).cloned())
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    refill_per_second: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_per_second: f64) -> Self {
        Self {
            capacity,
            refill_per_second,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn consume(&mut self, amount: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * self.refill_per_second).min(self.capacity);
        if self.tokens >= amount {
            self.tokens -= amount;
            true
        } else {
            false
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz_handler))
        .route("/profiles/{profile_id}", get(profile_handler))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> Result<(), String> {
    info!(
        "relay listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned())
    );
    axum::serve(listener, build_router(state))
        .await
        .map_err(|err| err.to_string())
}

async fn healthz_handler() -> impl IntoResponse {
    Json(serde_json::json!({"ok": true}))
}

/// Read-only view of a profile, the relay-side counterpart of the debug
/// dashboard: connected tabs plus every stored key.
async fn profile_handler(
    Path(profile_id): Path<ProfileId>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let relay = state.inner.read().await;
    let body = match relay.profiles.get(&profile_id) {
        Some(profile) => {
            let mut clients: Vec<&str> =
                profile.clients.keys().map(String::as_str).collect();
            clients.sort_unstable();
            serde_json::json!({
                "profile_id": profile_id,
                "clients": clients,
                "entries": profile.entries,
            })
        }
        None => serde_json::json!({
            "profile_id": profile_id,
            "clients": [],
            "entries": {},
        }),
    };
    Json(body)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_frame_size(MAX_RELAY_MESSAGE_BYTES)
        .on_upgrade(move |socket| async move {
            if let Err(err) = handle_socket(state, socket).await {
                warn!("socket session ended with error: {}", err);
            }
        })
}

async fn handle_socket(
    state: AppState,
    socket: axum::extract::ws::WebSocket,
) -> Result<(), String> {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    // Split sockets only flush queued Pongs when the write half sends, so the
    // write half pings on its own to keep proxies from reaping idle tabs.
    const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(KEEPALIVE_INTERVAL);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = outbound_rx.recv() => {
                    match msg {
                        Some(message) => {
                            if ws_sender.send(message).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let first_message = ws_receiver
        .next()
        .await
        .ok_or_else(|| "client disconnected before hello".to_owned())
        .and_then(|result| result.map_err(|err| err.to_string()))?;

    let (profile_id, client_id) = match parse_hello_message(&first_message) {
        Ok(hello) => hello,
        Err(err) => {
            send_control(&outbound_tx, ControlMessage::Error { message: err.clone() });
            drop(outbound_tx);
            let _ = send_task.await;
            return Err(err);
        }
    };

    if let Err(err) = register_client(
        &state,
        &profile_id,
        Connection {
            client_id: client_id.clone(),
            tx: outbound_tx.clone(),
        },
    )
    .await
    {
        send_control(&outbound_tx, ControlMessage::Error { message: err.clone() });
        drop(outbound_tx);
        let _ = send_task.await;
        return Err(err);
    }

    info!("tab {} joined profile {}", client_id, profile_id);

    let mut rate_limiter =
        TokenBucket::new(f64::from(MUTATION_BURST), f64::from(MUTATIONS_PER_SECOND));

    while let Some(next_message) = ws_receiver.next().await {
        let message = match next_message {
            Ok(message) => message,
            Err(err) => {
                warn!("websocket receive error: {}", err);
                break;
            }
        };

        match message {
            Message::Binary(data) => {
                if data.len() > MAX_RELAY_MESSAGE_BYTES {
                    warn!("dropping oversized message from {}", client_id);
                    continue;
                }

                let wire = match decode_frame(&data) {
                    Ok(wire) => wire,
                    Err(err) => {
                        warn!("failed to decode frame from {}: {}", client_id, err);
                        continue;
                    }
                };

                match wire {
                    WireMessage::Mutation(StoreMutation::Changed { .. }) => {
                        warn!("client {} sent a Changed notification; ignoring", client_id);
                    }
                    WireMessage::Mutation(mutation) => {
                        if let Err(err) = validate_mutation(&mutation) {
                            warn!("rejected mutation from {}: {}", client_id, err);
                            reject_mutation(
                                &state,
                                &profile_id,
                                &outbound_tx,
                                mutation.key(),
                                err.to_string(),
                            )
                            .await;
                            continue;
                        }

                        if !rate_limiter.consume(1.0) {
                            warn!("rate limit exceeded for {}", client_id);
                            reject_mutation(
                                &state,
                                &profile_id,
                                &outbound_tx,
                                mutation.key(),
                                "rate limit exceeded".to_owned(),
                            )
                            .await;
                            continue;
                        }

                        apply_mutation(&state, &profile_id, &client_id, mutation).await;
                    }
                    WireMessage::Control(_) => {
                        warn!("unexpected control message after hello from {}", client_id);
                    }
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Text(_) => {}
        }
    }

    unregister_client(&state, &profile_id, &client_id, &outbound_tx).await;
    send_task.abort();
    info!("tab {} left profile {}", client_id, profile_id);
    Ok(())
}

fn parse_hello_message(message: &Message) -> Result<(ProfileId, String), String> {
    let data = match message {
        Message::Binary(data) => data,
        _ => return Err("first message must be binary hello frame".to_owned()),
    };

    let frame = decode_frame(data).map_err(|err| format!("invalid hello frame: {}", err))?;
    match frame {
        WireMessage::Control(ControlMessage::Hello {
            profile_id,
            client_id,
        }) => {
            if profile_id.trim().is_empty() {
                return Err("profile_id cannot be empty".to_owned());
            }
            if client_id.trim().is_empty() {
                return Err("client_id cannot be empty".to_owned());
            }
            Ok((profile_id, client_id))
        }
        _ => Err("first control message must be Hello".to_owned()),
    }
}

async fn register_client(
    state: &AppState,
    profile_id: &ProfileId,
    connection: Connection,
) -> Result<(), String> {
    let mut relay = state.inner.write().await;
    let profile = relay.profiles.entry(profile_id.clone()).or_default();
    if !profile.clients.contains_key(&connection.client_id)
        && profile.clients.len() >= MAX_TABS_PER_PROFILE
    {
        return Err(format!(
            "profile {} is full (max {})",
            profile_id, MAX_TABS_PER_PROFILE
        ));
    }

    // The snapshot is queued while the write lock is held so no Changed
    // notification can overtake it.
    send_control(
        &connection.tx,
        ControlMessage::Snapshot {
            profile_id: profile_id.clone(),
            entries: profile.entries.clone(),
        },
    );
    profile
        .clients
        .insert(connection.client_id.clone(), connection);
    Ok(())
}

async fn unregister_client(
    state: &AppState,
    profile_id: &ProfileId,
    client_id: &str,
    tx: &mpsc::UnboundedSender<Message>,
) {
    let mut relay = state.inner.write().await;
    if let Some(profile) = relay.profiles.get_mut(profile_id) {
        // A reconnect under the same id may already have replaced us.
        if profile
            .clients
            .get(client_id)
            .is_some_and(|conn| conn.tx.same_channel(tx))
        {
            profile.clients.remove(client_id);
        }
        if profile.clients.is_empty() && profile.entries.is_empty() {
            relay.profiles.remove(profile_id);
        }
    }
}

/// Applies one mutation and fans the resulting `Changed` out to every tab of
/// the profile, the writer included. Ordering per key is the order in which
/// mutations take the write lock.
async fn apply_mutation(
    state: &AppState,
    profile_id: &ProfileId,
    writer_id: &str,
    mutation: StoreMutation,
) {
    let mut relay = state.inner.write().await;
    let Some(profile) = relay.profiles.get_mut(profile_id) else {
        return;
    };

    let changed = match mutation {
        StoreMutation::Set { key, value } => {
            let old = profile.entries.insert(key.clone(), value.clone());
            StoreMutation::Changed {
                key,
                old,
                new: Some(value),
                writer_id: writer_id.to_owned(),
            }
        }
        StoreMutation::Delete { key } => {
            let old = profile.entries.remove(&key);
            if old.is_none() {
                debug!(key = %key, "delete of absent key");
            }
            StoreMutation::Changed {
                key,
                old,
                new: None,
                writer_id: writer_id.to_owned(),
            }
        }
        StoreMutation::Changed { .. } => return,
    };

    let frame = match encode_frame(&WireMessage::Mutation(changed)) {
        Ok(frame) => frame,
        Err(err) => {
            error!("failed to serialize change notification: {}", err);
            return;
        }
    };

    for conn in profile.clients.values() {
        let _ = conn.tx.send(Message::Binary(frame.clone().into()));
    }
}

/// Tells the writer its mutation was dropped, with the value it should roll
/// back to. The read lock is held while queueing so the answer cannot be
/// overtaken by a later `Changed` for the same key.
async fn reject_mutation(
    state: &AppState,
    profile_id: &ProfileId,
    tx: &mpsc::UnboundedSender<Message>,
    key: &str,
    reason: String,
) {
    let relay = state.inner.read().await;
    let value = relay
        .profiles
        .get(profile_id)
        .and_then(|profile| profile.entries.get(key).cloned());
    send_control(
        tx,
        ControlMessage::Rejected {
            key: key.to_owned(),
            value,
            reason,
        },
    );
}

fn send_control(tx: &mpsc::UnboundedSender<Message>, control: ControlMessage) {
    match encode_frame(&WireMessage::Control(control)) {
        Ok(frame) => {
            let _ = tx.send(Message::Binary(frame.into()));
        }
        Err(err) => error!("failed to serialize control message: {}", err),
    }
}
