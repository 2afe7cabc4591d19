use std::{str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use splitview_core::keys;
use tracing::warn;
use url::Url;

use crate::store::SharedStore;

pub const BUTTON_LEFT: u8 = 0;
pub const BUTTON_MIDDLE: u8 = 1;
pub const BUTTON_RIGHT: u8 = 2;

/// A mouse button plus modifier state, as seen on a mouse-down event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MouseCombo {
    pub button: u8,
    #[serde(default)]
    pub ctrl: bool,
    #[serde(default)]
    pub alt: bool,
    #[serde(default)]
    pub shift: bool,
}

impl MouseCombo {
    pub const fn new(button: u8) -> Self {
        Self {
            button,
            ctrl: false,
            alt: false,
            shift: false,
        }
    }

    pub const fn with_ctrl(mut self) -> Self {
        self.ctrl = true;
        self
    }

    pub const fn with_alt(mut self) -> Self {
        self.alt = true;
        self
    }

    pub const fn with_shift(mut self) -> Self {
        self.shift = true;
        self
    }
}

impl std::fmt::Display for MouseCombo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.ctrl {
            f.write_str("ctrl+")?;
        }
        if self.alt {
            f.write_str("alt+")?;
        }
        if self.shift {
            f.write_str("shift+")?;
        }
        match self.button {
            BUTTON_LEFT => f.write_str("left"),
            BUTTON_MIDDLE => f.write_str("middle"),
            BUTTON_RIGHT => f.write_str("right"),
            other => write!(f, "button{other}"),
        }
    }
}

/// Parses labels like `ctrl+middle` or `alt+shift+left`.
impl FromStr for MouseCombo {
    type Err = String;

    fn from_str(label: &str) -> Result<Self, Self::Err> {
        let mut combo: Option<MouseCombo> = None;
        let mut ctrl = false;
        let mut alt = false;
        let mut shift = false;

        for part in label.split('+').map(str::trim) {
            match part.to_ascii_lowercase().as_str() {
                "ctrl" | "control" => ctrl = true,
                "alt" => alt = true,
                "shift" => shift = true,
                "left" => combo = Some(MouseCombo::new(BUTTON_LEFT)),
                "middle" => combo = Some(MouseCombo::new(BUTTON_MIDDLE)),
                "right" => combo = Some(MouseCombo::new(BUTTON_RIGHT)),
                other => return Err(format!("unknown mouse combo part '{other}'")),
            }
        }

        let mut combo = combo.ok_or_else(|| format!("no mouse button in '{label}'"))?;
        combo.ctrl = ctrl;
        combo.alt = alt;
        combo.shift = shift;
        Ok(combo)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortcutAction {
    CreateSource,
    CreateTarget,
}

/// Profile-wide shortcut bindings, stored under the `config` key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShortcutConfig {
    pub source: MouseCombo,
    pub target: MouseCombo,
}

impl Default for ShortcutConfig {
    fn default() -> Self {
        Self {
            source: MouseCombo::new(BUTTON_MIDDLE).with_ctrl(),
            target: MouseCombo::new(BUTTON_MIDDLE).with_alt(),
        }
    }
}

impl ShortcutConfig {
    /// Source wins when both bindings are configured to the same combo.
    pub fn action_for(&self, combo: &MouseCombo) -> Option<ShortcutAction> {
        if *combo == self.source {
            Some(ShortcutAction::CreateSource)
        } else if *combo == self.target {
            Some(ShortcutAction::CreateTarget)
        } else {
            None
        }
    }
}

pub fn load_shortcuts(store: &dyn SharedStore) -> ShortcutConfig {
    store
        .get_json::<ShortcutConfig>(keys::CONFIG)
        .unwrap_or_default()
}

pub fn save_shortcuts(store: &dyn SharedStore, shortcuts: &ShortcutConfig) {
    store.set_json(keys::CONFIG, shortcuts);
}

/// Tunables of one tab runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub heartbeat_interval: Duration,
    /// A heartbeat older than this no longer counts as a live Target.
    pub freshness_window: Duration,
    pub poll_interval: Duration,
    pub pair_request_window: Duration,
    /// Bind a freshly opened Idle tab as Target of a Source created within
    /// `auto_bind_window`.
    pub auto_bind_new_tabs: bool,
    pub auto_bind_window: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(2),
            freshness_window: Duration::from_secs(5),
            poll_interval: Duration::from_millis(500),
            pair_request_window: Duration::from_secs(3),
            auto_bind_new_tabs: false,
            auto_bind_window: Duration::from_secs(3),
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval.is_zero() || self.poll_interval.is_zero() {
            return Err("intervals must be greater than zero".to_owned());
        }
        if self.freshness_window <= self.heartbeat_interval {
            return Err(format!(
                "freshness window {:?} must exceed heartbeat interval {:?}",
                self.freshness_window, self.heartbeat_interval
            ));
        }
        Ok(())
    }
}

pub fn validate_relay_url(relay_url: &str) -> Result<Url, String> {
    let url = Url::parse(relay_url.trim()).map_err(|err| format!("invalid relay URL: {err}"))?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => {
            warn!(relay_url, "rejecting relay url scheme {}", other);
            return Err(format!("relay URL must use ws:// or wss://, got {other}://"));
        }
    }
    if url.host_str().is_none() {
        return Err("relay URL has no host".to_owned());
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn default_bindings_use_middle_button() {
        let shortcuts = ShortcutConfig::default();
        assert_eq!(
            shortcuts.action_for(&MouseCombo::new(BUTTON_MIDDLE).with_ctrl()),
            Some(ShortcutAction::CreateSource)
        );
        assert_eq!(
            shortcuts.action_for(&MouseCombo::new(BUTTON_MIDDLE).with_alt()),
            Some(ShortcutAction::CreateTarget)
        );
        assert_eq!(shortcuts.action_for(&MouseCombo::new(BUTTON_MIDDLE)), None);
        assert_eq!(
            shortcuts.action_for(&MouseCombo::new(BUTTON_MIDDLE).with_ctrl().with_shift()),
            None
        );
    }

    #[test]
    fn combo_labels_parse_and_print() {
        let combo: MouseCombo = "Alt+Shift+left".parse().unwrap();
        assert_eq!(combo, MouseCombo::new(BUTTON_LEFT).with_alt().with_shift());
        assert_eq!(combo.to_string(), "alt+shift+left");
        assert!("ctrl".parse::<MouseCombo>().is_err());
        assert!("ctrl+wheel".parse::<MouseCombo>().is_err());
    }

    #[test]
    fn malformed_stored_config_falls_back_to_defaults() {
        let store = MemoryStore::new();
        let handle = store.handle();
        handle.set(keys::CONFIG, json!({"source": "nope"}));
        assert_eq!(load_shortcuts(&*handle), ShortcutConfig::default());
    }

    #[test]
    fn saved_shortcuts_are_shared_by_the_profile() {
        let store = MemoryStore::new();
        let custom = ShortcutConfig {
            source: MouseCombo::new(BUTTON_LEFT).with_shift(),
            target: MouseCombo::new(BUTTON_RIGHT).with_shift(),
        };
        save_shortcuts(&*store.handle(), &custom);
        assert_eq!(load_shortcuts(&*store.handle()), custom);
    }

    #[test]
    fn relay_url_requires_websocket_scheme() {
        assert!(validate_relay_url("ws://127.0.0.1:8787/ws").is_ok());
        assert!(validate_relay_url("wss://relay.example.com/ws").is_ok());
        assert!(validate_relay_url("https://relay.example.com").is_err());
        assert!(validate_relay_url("not a url").is_err());
    }

    #[test]
    fn freshness_must_exceed_heartbeat() {
        assert!(RuntimeConfig::default().validate().is_ok());
        let config = RuntimeConfig {
            freshness_window: Duration::from_secs(1),
            ..RuntimeConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
