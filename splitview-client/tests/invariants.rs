mod common;

use std::{collections::HashMap, time::Duration};

use common::{Profile, Tab, settle};
use proptest::prelude::*;
use serde_json::json;
use splitview_client::SharedStore;
use splitview_core::{PairId, Role, Seq, keys};

const TABS: usize = 3;
const PAGES: [&str; 4] = [
    "https://example.com/one",
    "https://example.com/two",
    "https://example.org/three",
    "https://example.net/four",
];
const STALE_URL: &str = "https://stale.example/replayed";

#[derive(Debug, Clone)]
enum Step {
    CreateSource(usize),
    Drag { from: usize, to: usize },
    Navigate { tab: usize, page: usize },
    ReplayStale(usize),
    Reload(usize),
    Disconnect(usize),
    Revoke(usize),
    Tick(u64),
}

fn arb_step() -> impl Strategy<Value = Step> {
    let tab = 0..TABS;
    prop_oneof![
        1 => tab.clone().prop_map(Step::CreateSource),
        3 => (tab.clone(), tab.clone()).prop_map(|(from, to)| Step::Drag { from, to }),
        4 => (tab.clone(), 0..PAGES.len()).prop_map(|(tab, page)| Step::Navigate { tab, page }),
        2 => tab.clone().prop_map(Step::ReplayStale),
        1 => tab.clone().prop_map(Step::Reload),
        1 => tab.clone().prop_map(Step::Disconnect),
        1 => tab.prop_map(Step::Revoke),
        2 => (0u64..4_000).prop_map(Step::Tick),
    ]
}

/// What a tab looked like after the previous step.
#[derive(Debug, Clone, PartialEq)]
struct Seen {
    role: Role,
    pair_id: Option<PairId>,
    last_applied_seq: Seq,
}

impl Seen {
    fn of(tab: &Tab) -> Self {
        let state = tab.runtime.state();
        Self {
            role: state.role,
            pair_id: state.pair_id.clone(),
            last_applied_seq: state.last_applied_seq,
        }
    }
}

fn stored_seq(profile: &Profile, pair_id: &PairId) -> Option<Seq> {
    profile
        .store
        .value(&keys::seq(pair_id))
        .and_then(|value| value.as_u64())
}

fn settle_all(tabs: &mut [Tab]) {
    let mut refs: Vec<&mut Tab> = tabs.iter_mut().collect();
    settle(&mut refs);
}

/// Rewrites the pair's navigation with an older sequence and a page no
/// Target may open, then puts the real one back.
fn replay_stale(profile: &Profile, tabs: &mut [Tab], pair_id: &PairId) {
    let Some(seq) = stored_seq(profile, pair_id) else {
        return;
    };
    let Some(url) = profile.store.value(&keys::url(pair_id)) else {
        return;
    };
    let writer = profile.store.handle();
    writer.set(&keys::url(pair_id), json!(STALE_URL));
    writer.set(&keys::seq(pair_id), json!(seq.saturating_sub(1)));
    settle_all(tabs);
    writer.set(&keys::seq(pair_id), json!(seq));
    settle_all(tabs);
    writer.set(&keys::url(pair_id), url);
    settle_all(tabs);
}

fn run(steps: Vec<Step>) -> Result<(), TestCaseError> {
    let profile = Profile::new();
    let mut tabs: Vec<Tab> = (0..TABS)
        .map(|n| profile.open_tab(&format!("https://example.com/tab{n}")))
        .collect();
    let mut seen: Vec<Seen> = tabs.iter().map(Seen::of).collect();
    let mut published: HashMap<PairId, Seq> = HashMap::new();

    for step in steps {
        match step {
            Step::CreateSource(tab) => {
                let _ = tabs[tab].runtime.create_source();
            }
            Step::Drag { from, to } => {
                if from != to {
                    if let Some(payload) = tabs[from].runtime.drag_payload() {
                        let _ = tabs[to].runtime.handle_drop(&payload);
                    }
                }
            }
            Step::Navigate { tab, page } => {
                let pair_id = tabs[tab].pair();
                let before = pair_id.as_ref().and_then(|id| stored_seq(&profile, id));
                if let Ok(Some(seq)) = tabs[tab].runtime.follow_link(PAGES[page]) {
                    prop_assert!(before.is_none_or(|before| seq > before));
                    let pair_id = pair_id.expect("only a paired Source publishes");
                    prop_assert_eq!(stored_seq(&profile, &pair_id), Some(seq));
                }
            }
            Step::ReplayStale(tab) => {
                if let Some(pair_id) = tabs[tab].pair() {
                    replay_stale(&profile, &mut tabs, &pair_id);
                }
            }
            Step::Reload(tab) => {
                let reloaded = profile.reload(tabs.remove(tab));
                tabs.insert(tab, reloaded);
            }
            Step::Disconnect(tab) => tabs[tab].runtime.disconnect(),
            Step::Revoke(tab) => tabs[tab].runtime.revoke(),
            Step::Tick(ms) => {
                profile.advance(Duration::from_millis(ms));
                for tab in tabs.iter_mut() {
                    tab.runtime.heartbeat_tick();
                }
            }
        }
        settle_all(&mut tabs);

        for (tab, previous) in tabs.iter().zip(seen.iter_mut()) {
            let now = Seen::of(tab);
            prop_assert_eq!(now.role == Role::Idle, now.pair_id.is_none());
            prop_assert_ne!(tab.url(), STALE_URL);

            if let (Role::Target, Some(pair_id)) = (now.role, &now.pair_id) {
                prop_assert_eq!(
                    now.last_applied_seq,
                    stored_seq(&profile, pair_id).unwrap_or(0)
                );
            }
            if (now.role, &now.pair_id) == (previous.role, &previous.pair_id) {
                prop_assert!(now.last_applied_seq >= previous.last_applied_seq);
            }
            *previous = now;
        }

        for pair_id in tabs.iter().filter_map(Tab::pair) {
            if let Some(seq) = stored_seq(&profile, &pair_id) {
                let high = published.entry(pair_id).or_insert(seq);
                prop_assert!(seq >= *high);
                *high = seq;
            }
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn tabs_keep_their_pairing_invariants(
        steps in proptest::collection::vec(arb_step(), 1..40)
    ) {
        run(steps)?;
    }
}
