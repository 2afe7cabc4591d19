//! Per-tab persistence of the role record across reloads.
//!
//! Three tiers, read in priority order:
//! 1. the in-page fast cache (window-name slot), synchronous and available
//!    before anything else has loaded;
//! 2. the tab-scoped session record;
//! 3. a durable backup in the SharedStore keyed by the tab's own id.
//!
//! Every save writes all three, so an idle record is persisted as faithfully
//! as an active one and a stale role cannot come back from a lower tier.

use std::sync::Arc;

use splitview_core::{
    PersistedTabState, TabId, decode_fast_cache, decode_persisted, encode_fast_cache,
    generate_id, is_fast_cache_payload, keys,
};
use tracing::{debug, warn};

use crate::{store::SharedStore, tab_storage::TabScopedStorage};

pub const WINDOW_NAME_SLOT: &str = "window.name";
pub const SESSION_STATE_KEY: &str = "stm_state";
pub const SESSION_TAB_ID_KEY: &str = "stm_tab_id";
pub const SESSION_IGNORE_SYNC_KEY: &str = "stm_ignore_sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateOrigin {
    FastCache,
    Session,
    Durable,
    Fresh,
}

pub struct TabIdentityStore {
    window_name: Box<dyn TabScopedStorage>,
    session: Box<dyn TabScopedStorage>,
    shared: Arc<dyn SharedStore>,
    tab_id: TabId,
}

impl TabIdentityStore {
    /// Opens the tab's storage, minting a tab id on first use.
    pub fn open(
        window_name: Box<dyn TabScopedStorage>,
        session: Box<dyn TabScopedStorage>,
        shared: Arc<dyn SharedStore>,
    ) -> Self {
        let tab_id = match session
            .get(SESSION_TAB_ID_KEY)
            .filter(|id| !id.trim().is_empty())
        {
            Some(id) => id,
            None => {
                let id = generate_id();
                if let Err(err) = session.set(SESSION_TAB_ID_KEY, &id) {
                    warn!(tab_id = %id, "failed to persist tab id: {}", err);
                }
                id
            }
        };

        Self {
            window_name,
            session,
            shared,
            tab_id,
        }
    }

    pub fn tab_id(&self) -> &TabId {
        &self.tab_id
    }

    /// The most specific record available. A tier that holds something
    /// unreadable is skipped.
    pub fn load(&self) -> (PersistedTabState, StateOrigin) {
        if let Some(raw) = self.window_name.get(WINDOW_NAME_SLOT) {
            match decode_fast_cache(&raw) {
                Ok(Some(state)) => return (state, StateOrigin::FastCache),
                Ok(None) => debug!("window name holds foreign data"),
                Err(err) => warn!("ignoring fast cache: {}", err),
            }
        }

        if let Some(raw) = self.session.get(SESSION_STATE_KEY) {
            match decode_persisted(&raw) {
                Ok(state) => return (state, StateOrigin::Session),
                Err(err) => warn!("ignoring session record: {}", err),
            }
        }

        let durable_key = keys::tab_state(&self.tab_id);
        if let Some(state) = self.shared.get_json::<PersistedTabState>(&durable_key) {
            return (state, StateOrigin::Durable);
        }

        (PersistedTabState::default(), StateOrigin::Fresh)
    }

    pub fn save(&self, state: &PersistedTabState) {
        let foreign = self
            .window_name
            .get(WINDOW_NAME_SLOT)
            .is_some_and(|raw| !raw.is_empty() && !is_fast_cache_payload(&raw));
        if foreign {
            debug!("leaving foreign window name untouched");
        } else {
            match encode_fast_cache(state) {
                Ok(encoded) => {
                    if let Err(err) = self.window_name.set(WINDOW_NAME_SLOT, &encoded) {
                        warn!("fast cache write failed: {}", err);
                    }
                }
                Err(err) => warn!("fast cache encode failed: {}", err),
            }
        }

        match serde_json::to_string(state) {
            Ok(encoded) => {
                if let Err(err) = self.session.set(SESSION_STATE_KEY, &encoded) {
                    warn!("session record write failed: {}", err);
                }
            }
            Err(err) => warn!("session record encode failed: {}", err),
        }

        self.shared.set_json(&keys::tab_state(&self.tab_id), state);
    }

    /// Marks the next outgoing navigation publish as local-only.
    pub fn set_ignore_sync(&self) {
        if let Err(err) = self.session.set(SESSION_IGNORE_SYNC_KEY, "true") {
            warn!("failed to set ignore-sync flag: {}", err);
        }
    }

    /// Reads and clears the ignore-sync flag.
    pub fn take_ignore_sync(&self) -> bool {
        if self.session.get(SESSION_IGNORE_SYNC_KEY).is_none() {
            return false;
        }
        if let Err(err) = self.session.remove(SESSION_IGNORE_SYNC_KEY) {
            warn!("failed to clear ignore-sync flag: {}", err);
        }
        true
    }
}
