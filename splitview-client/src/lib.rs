pub mod clock;
pub mod config;
pub mod disconnect;
pub mod events;
pub mod identity;
pub mod liveness;
pub mod navigation;
pub mod pairing;
pub mod role;
pub mod runtime;
pub mod shell;
pub mod store;
pub mod tab_storage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{MouseCombo, RuntimeConfig, ShortcutAction, ShortcutConfig};
pub use events::{FailureReason, PairingError, TabEvent};
pub use identity::TabIdentityStore;
pub use navigation::PageLocation;
pub use runtime::{TabCommand, TabRuntime};
pub use store::{MemoryStore, RelayStore, SharedStore, ValueChange};
pub use tab_storage::{FileTabStorage, MemoryTabStorage, TabScopedStorage};
