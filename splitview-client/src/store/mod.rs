//! SharedStore: the eventually-consistent key-value substrate every tab of a
//! profile can read, write and watch.

mod memory;
mod relay;

use std::collections::BTreeMap;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

pub use memory::{MemoryStore, MemoryStoreHandle};
pub use relay::{RelayStore, RelayStoreError, RelayTasks};

pub type ListenerId = u64;

/// One change notification, addressed to the listener that asked for it.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueChange {
    pub listener: ListenerId,
    pub key: String,
    pub old: Option<Value>,
    pub new: Option<Value>,
    /// `false` when the write came from the same store handle.
    pub remote: bool,
}

pub type ChangeSink = mpsc::UnboundedSender<ValueChange>;

pub trait SharedStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value);
    fn delete(&self, key: &str);
    fn list_keys(&self) -> Vec<String>;
    fn add_listener(&self, key: &str, sink: ChangeSink) -> ListenerId;
    fn remove_listener(&self, id: ListenerId);
}

impl<'a> dyn SharedStore + 'a {
    pub fn get_or(&self, key: &str, default: Value) -> Value {
        self.get(key).unwrap_or(default)
    }

    /// Typed read. A value that does not decode is logged and reported as absent.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key)?;
        match serde_json::from_value(value) {
            Ok(decoded) => Some(decoded),
            Err(err) => {
                warn!(key, "ignoring undecodable store value: {}", err);
                None
            }
        }
    }

    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) {
        match serde_json::to_value(value) {
            Ok(value) => self.set(key, value),
            Err(err) => warn!(key, "failed to encode store value: {}", err),
        }
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|value| value.as_u64())
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.list_keys()
            .into_iter()
            .filter(|key| key.starts_with(prefix))
            .collect()
    }
}

#[derive(Debug)]
struct Listener {
    owner: u64,
    key: String,
    sink: ChangeSink,
}

/// Listener bookkeeping shared by the store implementations. Owners identify
/// the store handle a listener was registered through, which is what decides
/// the `remote` flag of a notification.
#[derive(Debug, Default)]
pub(crate) struct ListenerRegistry {
    next_id: ListenerId,
    listeners: BTreeMap<ListenerId, Listener>,
}

impl ListenerRegistry {
    pub(crate) fn add(&mut self, owner: u64, key: &str, sink: ChangeSink) -> ListenerId {
        self.next_id += 1;
        let id = self.next_id;
        self.listeners.insert(
            id,
            Listener {
                owner,
                key: key.to_owned(),
                sink,
            },
        );
        id
    }

    pub(crate) fn remove(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    pub(crate) fn remove_owner(&mut self, owner: u64) {
        self.listeners.retain(|_, listener| listener.owner != owner);
    }

    /// `writer` is the owner that performed the write, `None` for writes that
    /// arrived from another process.
    pub(crate) fn notify(
        &mut self,
        key: &str,
        old: &Option<Value>,
        new: &Option<Value>,
        writer: Option<u64>,
    ) {
        let mut closed = Vec::new();
        for (id, listener) in &self.listeners {
            if listener.key != key {
                continue;
            }
            let change = ValueChange {
                listener: *id,
                key: key.to_owned(),
                old: old.clone(),
                new: new.clone(),
                remote: writer != Some(listener.owner),
            };
            if listener.sink.send(change).is_err() {
                closed.push(*id);
            }
        }
        for id in closed {
            self.listeners.remove(&id);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.listeners.len()
    }
}
