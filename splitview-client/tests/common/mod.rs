#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use splitview_client::{
    ManualClock, MemoryStore, MemoryTabStorage, PageLocation, RuntimeConfig, TabEvent,
    TabIdentityStore, TabRuntime,
};
use splitview_core::{DragData, PairId, Role};
use tokio::sync::mpsc;

pub const START_MS: u64 = 1_700_000_000_000;

/// Tabs of one profile sharing an in-memory store and a hand-driven clock.
pub struct Profile {
    pub store: MemoryStore,
    pub clock: ManualClock,
    pub config: RuntimeConfig,
}

pub struct Tab {
    pub runtime: TabRuntime,
    pub events: mpsc::UnboundedReceiver<TabEvent>,
    window_name: MemoryTabStorage,
    session: MemoryTabStorage,
    location: PageLocation,
}

impl Profile {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self {
            store: MemoryStore::new(),
            clock: ManualClock::new(START_MS),
            config,
        }
    }

    pub fn open_tab(&self, url: &str) -> Tab {
        self.boot(
            MemoryTabStorage::new(),
            MemoryTabStorage::new(),
            PageLocation::new(url),
        )
    }

    /// Simulates a page reload: the runtime goes away without cleanup and a
    /// new one boots from the same tab-scoped storage.
    pub fn reload(&self, tab: Tab) -> Tab {
        let Tab {
            runtime,
            window_name,
            session,
            location,
            ..
        } = tab;
        drop(runtime);
        self.boot(window_name, session, location)
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    fn boot(
        &self,
        window_name: MemoryTabStorage,
        session: MemoryTabStorage,
        location: PageLocation,
    ) -> Tab {
        let handle = self.store.handle();
        let identity = TabIdentityStore::open(
            Box::new(window_name.clone()),
            Box::new(session.clone()),
            handle.clone(),
        );
        let (runtime, events) = TabRuntime::boot(
            handle,
            Arc::new(self.clock.clone()),
            identity,
            location.clone(),
            self.config.clone(),
        );
        Tab {
            runtime,
            events,
            window_name,
            session,
            location,
        }
    }
}

impl Tab {
    pub fn role(&self) -> Role {
        self.runtime.state().role
    }

    pub fn pair(&self) -> Option<PairId> {
        self.runtime.state().pair_id.clone()
    }

    pub fn url(&self) -> String {
        self.location.get()
    }

    pub fn drag(&self) -> DragData {
        self.runtime.drag_payload().expect("paired tab offers a payload")
    }

    pub fn drain_events(&mut self) -> Vec<TabEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Delivers queued store notifications until every tab is quiet.
pub fn settle(tabs: &mut [&mut Tab]) {
    loop {
        let handled: usize = tabs.iter_mut().map(|tab| tab.runtime.pump()).sum();
        if handled == 0 {
            break;
        }
    }
}

/// Source in `a`, Target in `b`, paired through a drag of `a`'s indicator.
pub fn pair_by_drag(a: &mut Tab, b: &mut Tab) -> PairId {
    let pair_id = a.runtime.create_source().expect("idle tab becomes source");
    let paired = b.runtime.handle_drop(&a.drag()).expect("drop is valid");
    assert!(paired);
    settle(&mut [&mut *a, &mut *b]);
    a.drain_events();
    b.drain_events();
    pair_id
}
