use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};

use serde_json::Value;

use super::{ChangeSink, ListenerId, ListenerRegistry, SharedStore};

#[derive(Debug, Default)]
struct Shared {
    entries: BTreeMap<String, Value>,
    listeners: ListenerRegistry,
    next_handle: u64,
}

/// In-process SharedStore. Every tab gets its own [`MemoryStoreHandle`]; a
/// write made through one handle is `remote` for listeners of every other.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> Arc<MemoryStoreHandle> {
        let mut shared = lock(&self.shared);
        shared.next_handle += 1;
        Arc::new(MemoryStoreHandle {
            shared: Arc::clone(&self.shared),
            handle_id: shared.next_handle,
        })
    }

    pub fn value(&self, key: &str) -> Option<Value> {
        lock(&self.shared).entries.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        lock(&self.shared).entries.keys().cloned().collect()
    }
}

#[derive(Debug)]
pub struct MemoryStoreHandle {
    shared: Arc<Mutex<Shared>>,
    handle_id: u64,
}

impl MemoryStoreHandle {
    fn write(&self, key: &str, new: Option<Value>) {
        let mut shared = lock(&self.shared);
        let old = match &new {
            Some(value) => shared.entries.insert(key.to_owned(), value.clone()),
            None => shared.entries.remove(key),
        };
        shared
            .listeners
            .notify(key, &old, &new, Some(self.handle_id));
    }
}

impl SharedStore for MemoryStoreHandle {
    fn get(&self, key: &str) -> Option<Value> {
        lock(&self.shared).entries.get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        self.write(key, Some(value));
    }

    fn delete(&self, key: &str) {
        self.write(key, None);
    }

    fn list_keys(&self) -> Vec<String> {
        lock(&self.shared).entries.keys().cloned().collect()
    }

    fn add_listener(&self, key: &str, sink: ChangeSink) -> ListenerId {
        lock(&self.shared)
            .listeners
            .add(self.handle_id, key, sink)
    }

    fn remove_listener(&self, id: ListenerId) {
        lock(&self.shared).listeners.remove(id);
    }
}

impl Drop for MemoryStoreHandle {
    fn drop(&mut self) {
        lock(&self.shared).listeners.remove_owner(self.handle_id);
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
