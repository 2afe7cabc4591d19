use std::sync::{Arc, Mutex};

use serde_json::json;
use splitview_core::{DragData, MIME_TEXT_PLAIN, MIME_URI_LIST, PairId, Seq, keys, next_sequence};
use tracing::debug;
use url::Url;

use crate::store::SharedStore;

/// The tab's current address. Hosts update it as the page navigates; the
/// runtime polls it and sets it when a Target follows its Source.
#[derive(Debug, Clone, Default)]
pub struct PageLocation {
    href: Arc<Mutex<String>>,
}

impl PageLocation {
    pub fn new(href: impl Into<String>) -> Self {
        Self {
            href: Arc::new(Mutex::new(href.into())),
        }
    }

    pub fn get(&self) -> String {
        self.href
            .lock()
            .map(|href| href.clone())
            .unwrap_or_default()
    }

    pub fn set(&self, href: impl Into<String>) {
        if let Ok(mut current) = self.href.lock() {
            *current = href.into();
        }
    }
}

/// Remembers the last address this tab observed so that only real changes
/// are published.
#[derive(Debug, Default)]
pub struct NavigationReplicator {
    last_url: Option<String>,
}

impl NavigationReplicator {
    pub fn new(initial_url: Option<String>) -> Self {
        Self {
            last_url: initial_url,
        }
    }

    /// Records `url`; true when it differs from the previous observation.
    pub fn observe(&mut self, url: &str) -> bool {
        if self.last_url.as_deref() == Some(url) {
            return false;
        }
        self.last_url = Some(url.to_owned());
        true
    }
}

/// Writes `url` and then a sequence number strictly above the current one.
/// Readers only act on the sequence key, so the url is always in place first.
pub fn publish(store: &dyn SharedStore, pair_id: &PairId, url: &str, now_ms: u64) -> Seq {
    let seq_key = keys::seq(pair_id);
    let current = store.get_u64(&seq_key).unwrap_or(0);
    let seq = next_sequence(now_ms, current);

    store.set(&keys::url(pair_id), json!(url));
    store.set(&seq_key, json!(seq));
    debug!(pair_id = %pair_id, seq, "navigation published");
    seq
}

/// Latest published navigation, or `None` when nothing complete is there.
pub fn read_latest(store: &dyn SharedStore, pair_id: &PairId) -> Option<(Seq, String)> {
    let seq = store.get_u64(&keys::seq(pair_id))?;
    let url = store
        .get(&keys::url(pair_id))
        .and_then(|value| value.as_str().map(str::to_owned))?;
    Some((seq, url))
}

/// Only http(s) addresses are replicated or opened from drops.
pub fn is_syncable_url(candidate: &str) -> bool {
    Url::parse(candidate)
        .map(|url| matches!(url.scheme(), "http" | "https"))
        .unwrap_or(false)
}

/// True for links that only move within the current document.
pub fn is_in_page_link(current: &str, link: &str) -> bool {
    if link.starts_with('#') {
        return true;
    }
    let (Ok(mut current), Ok(mut link)) = (Url::parse(current), Url::parse(link)) else {
        return false;
    };
    if link.fragment().is_none() {
        return false;
    }
    current.set_fragment(None);
    link.set_fragment(None);
    current == link
}

/// The address carried by a dropped link, preferring `text/uri-list`.
pub fn link_from_drop(data: &DragData) -> Option<String> {
    let from_uri_list = data.get(MIME_URI_LIST).and_then(|list| {
        list.lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_owned)
    });
    from_uri_list
        .or_else(|| data.get(MIME_TEXT_PLAIN).map(|text| text.trim().to_owned()))
        .filter(|candidate| is_syncable_url(candidate))
}
