//! The tab controller: owns the role state machine and drives the pairing,
//! liveness, replication and disconnect logic from store changes, timers
//! and host commands.

use std::sync::Arc;

use splitview_core::{
    DragData, DragPayload, PairId, PairRequest, Role, Seq, TabState, generate_id, keys,
    validate_sequence,
};
use tokio::{
    sync::{mpsc, oneshot},
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use crate::{
    clock::Clock,
    config::{MouseCombo, RuntimeConfig, ShortcutAction, ShortcutConfig, load_shortcuts, save_shortcuts},
    disconnect::{TeardownScope, signal_global_reset, signal_pair_disconnect, teardown_scope},
    events::{PairingError, TabEvent},
    identity::{StateOrigin, TabIdentityStore},
    liveness::{LivenessMonitor, has_live_target},
    navigation::{
        NavigationReplicator, PageLocation, is_in_page_link, is_syncable_url, link_from_drop,
        publish, read_latest,
    },
    pairing::{
        DropDecision, PairRequestGuard, accept_direct_request, accept_pair_request,
        broadcast_pair_request, decide_drop, drag_payload, is_recent, latest_source,
        parse_pair_request, record_latest_source, register_source,
    },
    role::{Effect, RoleCommand, RoleStateMachine, Transition},
    store::{ListenerId, SharedStore, ValueChange},
};

pub const NOTICE_PAIRED: &str = "Tabs Paired Successfully!";
pub const NOTICE_DISCONNECTED: &str = "Disconnected Group";
pub const NOTICE_REVOKED: &str = "Role Revoked";
pub const NOTICE_RESET: &str = "System Reset";
pub const NOTICE_SETTINGS_SAVED: &str = "Settings Saved!";
pub const NOTICE_LOCAL_LINK: &str = "Opening Link (Local Only)...";
pub const NOTICE_SYNCING: &str = "Syncing to Target...";

/// Host-facing commands accepted by [`TabRuntime::run`].
#[derive(Debug)]
pub enum TabCommand {
    CreateSource,
    JoinAsSource,
    CreateTarget,
    Disconnect,
    Revoke,
    ResetAll,
    ToggleMute,
    Navigated(String),
    FollowLink(String),
    DropLink(DragData),
    Drop(DragData),
    StartDrag(oneshot::Sender<Option<DragData>>),
    RequestPairing,
    SetVisible(bool),
    ConfigureShortcuts(ShortcutConfig),
    MouseDown(MouseCombo),
    Status(oneshot::Sender<TabState>),
    Shutdown,
}

pub struct TabRuntime {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    identity: TabIdentityStore,
    config: RuntimeConfig,
    machine: RoleStateMachine,
    liveness: LivenessMonitor,
    navigation: NavigationReplicator,
    location: PageLocation,
    listeners: Vec<ListenerId>,
    changes_tx: mpsc::UnboundedSender<ValueChange>,
    changes_rx: mpsc::UnboundedReceiver<ValueChange>,
    events: mpsc::UnboundedSender<TabEvent>,
    visible: bool,
}

impl TabRuntime {
    /// Restores the tab's role from its identity tiers and rebinds whatever
    /// that role listens to. A restored Target catches up immediately.
    pub fn boot(
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        identity: TabIdentityStore,
        location: PageLocation,
        config: RuntimeConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TabEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();

        let (persisted, origin) = identity.load();
        let state = TabState::restore(generate_id(), &persisted);
        if origin != StateOrigin::Fresh {
            info!(
                tab_id = %identity.tab_id(),
                role = %state.role,
                ?origin,
                "restored tab state"
            );
        }

        let navigation = NavigationReplicator::new(Some(location.get()));
        let mut runtime = Self {
            store,
            clock,
            identity,
            config,
            machine: RoleStateMachine::new(state),
            liveness: LivenessMonitor::new(),
            navigation,
            location,
            listeners: Vec::new(),
            changes_tx,
            changes_rx,
            events,
            visible: true,
        };

        let effects = runtime.machine.resume();
        runtime.run_effects(effects);
        runtime.auto_bind();
        (runtime, events_rx)
    }

    pub fn state(&self) -> &TabState {
        self.machine.state()
    }

    pub fn tab_id(&self) -> &str {
        self.identity.tab_id()
    }

    pub fn location(&self) -> &PageLocation {
        &self.location
    }

    pub fn create_source(&mut self) -> Result<PairId, PairingError> {
        let pair_id = generate_id();
        self.become_source(pair_id)
    }

    /// Joins the most recently created group as an additional Source.
    pub fn join_as_source(&mut self) -> Result<PairId, PairingError> {
        let record = latest_source(self.store.as_ref()).ok_or(PairingError::NoSource);
        let record = self.report(record)?;
        self.become_source(record.source_id)
    }

    pub fn create_target_from_latest_source(&mut self) -> Result<PairId, PairingError> {
        let record = latest_source(self.store.as_ref()).ok_or(PairingError::NoSource);
        let record = self.report(record)?;
        self.become_target(record.source_id)
    }

    /// Ends this tab's group for every member. A no-op on an Idle tab.
    pub fn disconnect(&mut self) {
        let Some(pair_id) = self.paired_id() else {
            debug!("disconnect on idle tab");
            return;
        };
        signal_pair_disconnect(self.store.as_ref(), &pair_id, self.clock.now_ms());
        self.go_idle();
        self.notice(NOTICE_DISCONNECTED);
    }

    /// Leaves the group without telling the other members.
    pub fn revoke(&mut self) {
        if self.go_idle() {
            self.notice(NOTICE_REVOKED);
        }
    }

    pub fn reset_all(&mut self) {
        signal_global_reset(self.store.as_ref(), self.clock.now_ms());
        self.go_idle();
        self.notice(NOTICE_RESET);
    }

    pub fn toggle_mute(&mut self) -> Result<bool, PairingError> {
        let muted = !self.state().muted;
        self.apply(RoleCommand::SetMuted(muted))?;
        Ok(muted)
    }

    pub fn configure_shortcuts(&mut self, shortcuts: ShortcutConfig) {
        save_shortcuts(self.store.as_ref(), &shortcuts);
        self.notice(NOTICE_SETTINGS_SAVED);
    }

    /// Runs the action bound to `combo`, if any. Bindings are read from the
    /// store each time so edits made in other tabs apply at once.
    pub fn handle_mouse_down(&mut self, combo: MouseCombo) -> Option<ShortcutAction> {
        let action = load_shortcuts(self.store.as_ref()).action_for(&combo)?;
        let outcome = match action {
            ShortcutAction::CreateSource => self.create_source().map(drop),
            ShortcutAction::CreateTarget => self.create_target_from_latest_source().map(drop),
        };
        if let Err(err) = outcome {
            debug!(%combo, "shortcut did not apply: {}", err);
        }
        Some(action)
    }

    /// Drag data for a gesture started on this tab's status indicator.
    pub fn drag_payload(&self) -> Option<DragData> {
        let payload = drag_payload(self.state(), self.clock.now_ms())?;
        match payload.to_drag_data() {
            Ok(data) => Some(data),
            Err(err) => {
                warn!("failed to encode drag payload: {}", err);
                None
            }
        }
    }

    /// Handles data dropped on the page. Returns whether this tab paired.
    pub fn handle_drop(&mut self, data: &DragData) -> Result<bool, PairingError> {
        let payload = DragPayload::from_drag_data(data)
            .map_err(|err| PairingError::InvalidPayload(err.to_string()));
        let Some(payload) = self.report(payload)? else {
            return Ok(false);
        };
        let Some(decision) = decide_drop(&payload, &self.state().instance_id) else {
            return Ok(false);
        };
        if !self.state().role.is_idle() {
            debug!(role = %self.state().role, "ignoring role request on paired tab");
            return Ok(false);
        }

        match decision {
            DropDecision::BecomeTarget(pair_id) => self.become_target(pair_id)?,
            DropDecision::JoinAsSource(pair_id) => self.become_source(pair_id)?,
        };
        self.notice(NOTICE_PAIRED);
        Ok(true)
    }

    /// Opens a link dropped on the status indicator in this tab only.
    pub fn handle_link_drop(&mut self, data: &DragData) -> bool {
        if self.state().role.is_idle() {
            return false;
        }
        let Some(url) = link_from_drop(data) else {
            return false;
        };
        // Targets never publish, so there is nothing for them to skip.
        if self.state().role == Role::Source {
            self.identity.set_ignore_sync();
        }
        self.notice(NOTICE_LOCAL_LINK);
        self.location.set(url.clone());
        self.location_changed(&url);
        true
    }

    /// Announces this Source's group to every Idle, visible tab.
    pub fn request_pairing_broadcast(&mut self) -> Result<(), PairingError> {
        let pair_id = match (self.state().role, self.paired_id()) {
            (Role::Source, Some(pair_id)) => pair_id,
            _ => return Err(PairingError::NotPaired),
        };
        broadcast_pair_request(
            self.store.as_ref(),
            &pair_id,
            &self.state().instance_id,
            self.clock.now_ms(),
        );
        Ok(())
    }

    /// The request a Source hands to another runtime of the same page.
    pub fn direct_pair_request(&self) -> Option<PairRequest> {
        let pair_id = match (self.state().role, self.paired_id()) {
            (Role::Source, Some(pair_id)) => pair_id,
            _ => return None,
        };
        Some(PairRequest {
            source_id: pair_id,
            instance_id: Some(self.state().instance_id.clone()),
            timestamp: self.clock.now_ms(),
        })
    }

    /// Answers a request delivered to this tab alone. Returns whether it paired.
    pub fn handle_direct_pair_request(
        &mut self,
        request: &PairRequest,
    ) -> Result<bool, PairingError> {
        let Some(pair_id) =
            accept_direct_request(request, self.state().role, &self.state().instance_id)
        else {
            return Ok(false);
        };
        self.become_target(pair_id)?;
        self.notice(NOTICE_PAIRED);
        Ok(true)
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    /// Reacts to the page's address changing under it.
    pub fn location_changed(&mut self, url: &str) {
        if !self.navigation.observe(url) || self.state().role != Role::Source {
            return;
        }
        if let Err(err) = self.push_navigation(url) {
            debug!("navigation not pushed: {}", err);
        }
    }

    /// A link activated in a Source opens in its Targets instead.
    /// `Ok(None)` means the link is left to the page.
    pub fn follow_link(&mut self, url: &str) -> Result<Option<Seq>, PairingError> {
        if self.state().role != Role::Source {
            return Err(PairingError::NotPaired);
        }
        if is_in_page_link(&self.location.get(), url) || !is_syncable_url(url) {
            return Ok(None);
        }
        let seq = self.push_navigation(url)?;
        if seq.is_some() {
            self.notice(NOTICE_SYNCING);
        }
        Ok(seq)
    }

    pub fn poll_location(&mut self) {
        let current = self.location.get();
        self.location_changed(&current);
    }

    pub fn heartbeat_tick(&mut self) {
        self.liveness.beat(self.store.as_ref(), self.clock.now_ms());
    }

    /// Processes every store notification queued so far.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(change) = self.changes_rx.try_recv() {
            self.handle_change(change);
            handled += 1;
        }
        handled
    }

    pub fn handle_change(&mut self, change: ValueChange) {
        if !self.listeners.contains(&change.listener) {
            debug!(key = %change.key, "dropping change for a released listener");
            return;
        }

        let pair_id = self.paired_id();
        if let Some(scope) = teardown_scope(&change, pair_id.as_ref()) {
            info!(?scope, key = %change.key, "group torn down by another tab");
            if self.go_idle() && scope == TeardownScope::Global {
                self.notice(NOTICE_RESET);
            }
            return;
        }

        if change.key == keys::PAIR_REQUEST {
            self.on_pair_request(&change);
        } else if let (Role::Target, Some(pair_id)) = (self.state().role, pair_id) {
            if change.key == keys::seq(&pair_id) {
                self.catch_up(&pair_id);
            }
        }
    }

    /// Releases the heartbeat. Called when the tab goes away.
    pub fn shutdown(&mut self) {
        self.liveness.stop(self.store.as_ref());
        self.unbind_listeners();
        info!(tab_id = %self.identity.tab_id(), "tab shut down");
    }

    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<TabCommand>) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                Some(change) = self.changes_rx.recv() => self.handle_change(change),
                _ = heartbeat.tick() => self.heartbeat_tick(),
                _ = poll.tick() => self.poll_location(),
                command = commands.recv() => match command {
                    Some(TabCommand::Shutdown) | None => break,
                    Some(command) => self.execute(command),
                },
            }
        }

        self.shutdown();
    }

    pub fn execute(&mut self, command: TabCommand) {
        let result = match command {
            TabCommand::CreateSource => self.create_source().map(drop),
            TabCommand::JoinAsSource => self.join_as_source().map(drop),
            TabCommand::CreateTarget => self.create_target_from_latest_source().map(drop),
            TabCommand::Disconnect => {
                self.disconnect();
                Ok(())
            }
            TabCommand::Revoke => {
                self.revoke();
                Ok(())
            }
            TabCommand::ResetAll => {
                self.reset_all();
                Ok(())
            }
            TabCommand::ToggleMute => self.toggle_mute().map(drop),
            TabCommand::Navigated(url) => {
                self.location.set(url.clone());
                self.location_changed(&url);
                Ok(())
            }
            TabCommand::FollowLink(url) => self.follow_link(&url).map(drop),
            TabCommand::DropLink(data) => {
                self.handle_link_drop(&data);
                Ok(())
            }
            TabCommand::Drop(data) => self.handle_drop(&data).map(drop),
            TabCommand::StartDrag(reply) => {
                let _ = reply.send(self.drag_payload());
                Ok(())
            }
            TabCommand::RequestPairing => self.request_pairing_broadcast(),
            TabCommand::SetVisible(visible) => {
                self.set_visible(visible);
                Ok(())
            }
            TabCommand::ConfigureShortcuts(shortcuts) => {
                self.configure_shortcuts(shortcuts);
                Ok(())
            }
            TabCommand::MouseDown(combo) => {
                self.handle_mouse_down(combo);
                Ok(())
            }
            TabCommand::Status(reply) => {
                let _ = reply.send(self.state().clone());
                Ok(())
            }
            TabCommand::Shutdown => Ok(()),
        };
        if let Err(err) = result {
            debug!("command failed: {}", err);
        }
    }

    fn become_source(&mut self, pair_id: PairId) -> Result<PairId, PairingError> {
        self.apply(RoleCommand::BecomeSource {
            pair_id: pair_id.clone(),
            source_tab_id: generate_id(),
        })?;
        Ok(pair_id)
    }

    fn become_target(&mut self, pair_id: PairId) -> Result<PairId, PairingError> {
        self.apply(RoleCommand::BecomeTarget {
            pair_id: pair_id.clone(),
        })?;
        Ok(pair_id)
    }

    /// True when the tab actually left a role.
    fn go_idle(&mut self) -> bool {
        self.apply(RoleCommand::BecomeIdle)
            .map(|transition| !transition.is_noop())
            .unwrap_or(false)
    }

    fn apply(&mut self, command: RoleCommand) -> Result<Transition, PairingError> {
        let transition = self.machine.apply(command);
        let transition = self.report(transition)?;
        if transition.from != transition.to {
            self.identity.take_ignore_sync();
            info!(
                from = %transition.from,
                to = %transition.to,
                pair_id = ?transition.pair_id,
                "role changed"
            );
        }
        self.run_effects(transition.effects.clone());
        Ok(transition)
    }

    fn run_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::StopHeartbeat => self.liveness.stop(self.store.as_ref()),
                Effect::UnbindListeners => self.unbind_listeners(),
                Effect::Persist => self.identity.save(&self.machine.state().to_persisted()),
                Effect::BindListeners(plan) => {
                    for key in plan {
                        let id = self
                            .store
                            .add_listener(&key.store_key(), self.changes_tx.clone());
                        self.listeners.push(id);
                    }
                }
                Effect::RegisterSource {
                    pair_id,
                    source_tab_id,
                } => register_source(self.store.as_ref(), &pair_id, &source_tab_id),
                Effect::RecordLatestSource { pair_id } => {
                    record_latest_source(self.store.as_ref(), &pair_id, self.clock.now_ms());
                }
                Effect::StartHeartbeat { pair_id } => {
                    let instance_id = self.machine.state().instance_id.clone();
                    self.liveness.start(
                        self.store.as_ref(),
                        &pair_id,
                        &instance_id,
                        self.clock.now_ms(),
                    );
                }
                Effect::CatchUp { pair_id } => self.catch_up(&pair_id),
                Effect::Emit(event) => self.emit(event),
            }
        }
    }

    fn unbind_listeners(&mut self) {
        for id in self.listeners.drain(..) {
            self.store.remove_listener(id);
        }
    }

    /// Applies the latest navigation of `pair_id` if it is newer than what
    /// this Target has seen. The sequence is persisted before the page moves.
    fn catch_up(&mut self, pair_id: &PairId) {
        let Some((seq, url)) = read_latest(self.store.as_ref(), pair_id) else {
            return;
        };
        if let Err(err) = validate_sequence(self.state().last_applied_seq, seq) {
            debug!(pair_id = %pair_id, "skipping navigation: {}", err);
            return;
        }
        if self.apply(RoleCommand::RecordApplied(seq)).is_err() {
            return;
        }

        info!(pair_id = %pair_id, seq, "following source navigation");
        self.navigation.observe(&url);
        self.location.set(url.clone());
        self.emit(TabEvent::NavigationApplied { url });
    }

    fn push_navigation(&mut self, url: &str) -> Result<Option<Seq>, PairingError> {
        let pair_id = match (self.state().role, self.paired_id()) {
            (Role::Source, Some(pair_id)) => pair_id,
            _ => return Err(PairingError::NotPaired),
        };
        if self.identity.take_ignore_sync() {
            debug!(pair_id = %pair_id, "navigation kept local");
            return Ok(None);
        }

        let now_ms = self.clock.now_ms();
        if !has_live_target(
            self.store.as_ref(),
            &pair_id,
            now_ms,
            self.config.freshness_window,
        ) {
            return self.report(Err(PairingError::NoTarget));
        }
        Ok(Some(publish(self.store.as_ref(), &pair_id, url, now_ms)))
    }

    fn on_pair_request(&mut self, change: &ValueChange) {
        if !change.remote {
            return;
        }
        let Some(request) = parse_pair_request(change.new.as_ref()) else {
            return;
        };
        let instance_id = self.state().instance_id.clone();
        let guard = PairRequestGuard {
            role: self.state().role,
            visible: self.visible,
            instance_id: &instance_id,
            now_ms: self.clock.now_ms(),
            window: self.config.pair_request_window,
        };
        let Some(pair_id) = accept_pair_request(&request, &guard) else {
            return;
        };
        if self.become_target(pair_id).is_ok() {
            self.notice(NOTICE_PAIRED);
        }
    }

    fn auto_bind(&mut self) {
        if !self.config.auto_bind_new_tabs || !self.state().role.is_idle() {
            return;
        }
        let Some(record) = latest_source(self.store.as_ref()) else {
            return;
        };
        if is_recent(&record, self.clock.now_ms(), self.config.auto_bind_window) {
            info!(pair_id = %record.source_id, "auto-binding new tab as target");
            if self.become_target(record.source_id).is_ok() {
                self.notice(NOTICE_PAIRED);
            }
        }
    }

    fn paired_id(&self) -> Option<PairId> {
        let state = self.state();
        if state.role.is_idle() {
            None
        } else {
            state.pair_id.clone()
        }
    }

    /// Emits the user-visible reason of a failure and passes the result on.
    fn report<T>(&self, result: Result<T, PairingError>) -> Result<T, PairingError> {
        if let Err(err) = &result {
            if let Some(reason) = err.reason() {
                self.emit(TabEvent::PairingFailed { reason });
            }
        }
        result
    }

    fn notice(&self, message: &str) {
        self.emit(TabEvent::Notice {
            message: message.to_owned(),
        });
    }

    fn emit(&self, event: TabEvent) {
        let _ = self.events.send(event);
    }
}
