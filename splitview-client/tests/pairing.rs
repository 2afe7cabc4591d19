mod common;

use std::time::Duration;

use common::{Profile, pair_by_drag, settle};
use serde_json::json;
use splitview_client::{
    FailureReason, MouseCombo, PairingError, RuntimeConfig, ShortcutAction, ShortcutConfig,
    TabEvent,
    config::{BUTTON_LEFT, BUTTON_MIDDLE},
    runtime::NOTICE_PAIRED,
};
use splitview_core::{DragData, MIME_TEXT_PLAIN, Role, keys};

#[test]
fn dragging_a_source_onto_an_idle_tab_pairs_it() {
    let profile = Profile::new();
    let mut a = profile.open_tab("https://example.com/a");
    let mut b = profile.open_tab("https://example.com/b");

    let pair_id = a.runtime.create_source().unwrap();
    assert_eq!(
        a.drain_events(),
        vec![TabEvent::RoleChanged {
            role: Role::Source,
            pair_id: Some(pair_id.clone()),
        }]
    );

    assert!(b.runtime.handle_drop(&a.drag()).unwrap());
    assert_eq!(b.role(), Role::Target);
    assert_eq!(b.pair(), Some(pair_id.clone()));
    assert_eq!(
        b.drain_events(),
        vec![
            TabEvent::RoleChanged {
                role: Role::Target,
                pair_id: Some(pair_id.clone()),
            },
            TabEvent::Notice {
                message: NOTICE_PAIRED.to_owned(),
            },
        ]
    );

    let heartbeats = profile
        .store
        .keys()
        .into_iter()
        .filter(|key| key.starts_with(&keys::heartbeat_prefix(&pair_id)))
        .count();
    assert_eq!(heartbeats, 1);
    assert_eq!(
        profile.store.value(keys::LATEST_SOURCE).unwrap()["sourceId"],
        json!(pair_id)
    );
}

#[test]
fn dropping_a_tab_on_itself_is_ignored() {
    let profile = Profile::new();
    let mut a = profile.open_tab("https://example.com/a");
    a.runtime.create_source().unwrap();
    let state_before = a.runtime.state().clone();
    a.drain_events();

    assert!(!a.runtime.handle_drop(&a.drag()).unwrap());
    assert_eq!(a.runtime.state(), &state_before);
    assert!(a.drain_events().is_empty());
}

#[test]
fn dropping_a_target_joins_its_group_as_source() {
    let profile = Profile::new();
    let mut a = profile.open_tab("https://example.com/a");
    let mut b = profile.open_tab("https://example.com/b");
    let mut c = profile.open_tab("https://example.com/c");
    let pair_id = pair_by_drag(&mut a, &mut b);

    assert!(c.runtime.handle_drop(&b.drag()).unwrap());
    assert_eq!(c.role(), Role::Source);
    assert_eq!(c.pair(), Some(pair_id.clone()));

    let sources = profile.store.value(&keys::sources(&pair_id)).unwrap();
    assert_eq!(sources.as_array().map(Vec::len), Some(2));
    assert_ne!(
        a.runtime.state().source_tab_id,
        c.runtime.state().source_tab_id
    );
}

#[test]
fn paired_tabs_ignore_role_requests() {
    let profile = Profile::new();
    let mut a = profile.open_tab("https://example.com/a");
    let mut b = profile.open_tab("https://example.com/b");
    let mut d = profile.open_tab("https://example.com/d");
    let pair_id = pair_by_drag(&mut a, &mut b);
    d.runtime.create_source().unwrap();

    assert!(!b.runtime.handle_drop(&d.drag()).unwrap());
    assert_eq!(b.pair(), Some(pair_id));
    assert!(b.drain_events().is_empty());
}

#[test]
fn malformed_and_foreign_drops() {
    let profile = Profile::new();
    let mut b = profile.open_tab("https://example.com/b");

    let mut broken = DragData::new();
    broken.insert(MIME_TEXT_PLAIN.to_owned(), "STM_ROLE:{not json".to_owned());
    let err = b.runtime.handle_drop(&broken).unwrap_err();
    assert!(matches!(err, PairingError::InvalidPayload(_)));
    assert_eq!(
        b.drain_events(),
        vec![TabEvent::PairingFailed {
            reason: FailureReason::InvalidPayload,
        }]
    );

    let mut text = DragData::new();
    text.insert(MIME_TEXT_PLAIN.to_owned(), "just some words".to_owned());
    assert!(!b.runtime.handle_drop(&text).unwrap());
    assert!(b.drain_events().is_empty());
    assert_eq!(b.role(), Role::Idle);
}

#[test]
fn broadcast_pairs_only_visible_idle_tabs() {
    let profile = Profile::new();
    let mut a = profile.open_tab("https://example.com/a");
    let mut b = profile.open_tab("https://example.com/b");
    let mut hidden = profile.open_tab("https://example.com/h");
    hidden.runtime.set_visible(false);

    let pair_id = a.runtime.create_source().unwrap();
    a.runtime.request_pairing_broadcast().unwrap();
    settle(&mut [&mut a, &mut b, &mut hidden]);

    assert_eq!(b.role(), Role::Target);
    assert_eq!(b.pair(), Some(pair_id));
    assert_eq!(hidden.role(), Role::Idle);
    assert_eq!(a.role(), Role::Source);
}

#[test]
fn same_page_request_reaches_only_its_addressee() {
    let profile = Profile::new();
    let mut a = profile.open_tab("https://example.com/a");
    let mut b = profile.open_tab("https://example.com/b");
    let mut c = profile.open_tab("https://example.com/c");
    b.runtime.set_visible(false);

    assert_eq!(a.runtime.direct_pair_request(), None);
    let pair_id = a.runtime.create_source().unwrap();
    let request = a.runtime.direct_pair_request().unwrap();

    assert!(!a.runtime.handle_direct_pair_request(&request).unwrap());
    assert!(b.runtime.handle_direct_pair_request(&request).unwrap());
    settle(&mut [&mut a, &mut b, &mut c]);

    assert_eq!(b.role(), Role::Target);
    assert_eq!(b.pair(), Some(pair_id));
    assert_eq!(c.role(), Role::Idle);
    assert_eq!(profile.store.value(keys::PAIR_REQUEST), None);
}

#[test]
fn expired_broadcast_is_ignored() {
    let profile = Profile::new();
    let mut a = profile.open_tab("https://example.com/a");
    let mut b = profile.open_tab("https://example.com/b");

    a.runtime.create_source().unwrap();
    a.runtime.request_pairing_broadcast().unwrap();
    profile.advance(Duration::from_millis(3_500));
    settle(&mut [&mut a, &mut b]);

    assert_eq!(b.role(), Role::Idle);
}

#[test]
fn only_sources_broadcast() {
    let profile = Profile::new();
    let mut b = profile.open_tab("https://example.com/b");
    assert_eq!(
        b.runtime.request_pairing_broadcast(),
        Err(PairingError::NotPaired)
    );
    assert_eq!(profile.store.value(keys::PAIR_REQUEST), None);
}

#[test]
fn target_without_any_source_fails_with_no_source() {
    let profile = Profile::new();
    let mut b = profile.open_tab("https://example.com/b");

    assert_eq!(
        b.runtime.create_target_from_latest_source(),
        Err(PairingError::NoSource)
    );
    assert_eq!(
        b.drain_events(),
        vec![TabEvent::PairingFailed {
            reason: FailureReason::NoSource,
        }]
    );
    assert_eq!(b.role(), Role::Idle);
}

#[test]
fn second_role_on_a_paired_tab_fails_with_not_idle() {
    let profile = Profile::new();
    let mut a = profile.open_tab("https://example.com/a");
    let mut b = profile.open_tab("https://example.com/b");
    pair_by_drag(&mut a, &mut b);

    assert_eq!(
        b.runtime.create_source(),
        Err(PairingError::NotIdle(Role::Target))
    );
    assert_eq!(
        b.drain_events(),
        vec![TabEvent::PairingFailed {
            reason: FailureReason::NotIdle,
        }]
    );
}

#[test]
fn target_follows_latest_source() {
    let profile = Profile::new();
    let mut a = profile.open_tab("https://example.com/a");
    let mut b = profile.open_tab("https://example.com/b");
    let first = a.runtime.create_source().unwrap();

    let mut c = profile.open_tab("https://example.com/c");
    let second = c.runtime.create_source().unwrap();
    assert_ne!(first, second);

    assert_eq!(b.runtime.create_target_from_latest_source(), Ok(second));
}

#[test]
fn default_shortcuts_create_source_then_target() {
    let profile = Profile::new();
    let mut a = profile.open_tab("https://example.com/a");
    let mut b = profile.open_tab("https://example.com/b");

    assert_eq!(
        a.runtime
            .handle_mouse_down(MouseCombo::new(BUTTON_MIDDLE).with_ctrl()),
        Some(ShortcutAction::CreateSource)
    );
    assert_eq!(
        b.runtime
            .handle_mouse_down(MouseCombo::new(BUTTON_MIDDLE).with_alt()),
        Some(ShortcutAction::CreateTarget)
    );
    assert_eq!(a.role(), Role::Source);
    assert_eq!(b.role(), Role::Target);
    assert_eq!(a.pair(), b.pair());

    assert_eq!(a.runtime.handle_mouse_down(MouseCombo::new(BUTTON_LEFT)), None);
}

#[test]
fn shortcut_changes_apply_to_every_tab() {
    let profile = Profile::new();
    let mut a = profile.open_tab("https://example.com/a");
    let mut b = profile.open_tab("https://example.com/b");

    let custom = ShortcutConfig {
        source: MouseCombo::new(BUTTON_LEFT).with_shift(),
        target: MouseCombo::new(BUTTON_LEFT).with_alt(),
    };
    a.runtime.configure_shortcuts(custom);

    assert_eq!(
        b.runtime
            .handle_mouse_down(MouseCombo::new(BUTTON_MIDDLE).with_ctrl()),
        None
    );
    assert_eq!(
        b.runtime
            .handle_mouse_down(MouseCombo::new(BUTTON_LEFT).with_shift()),
        Some(ShortcutAction::CreateSource)
    );
    assert_eq!(b.role(), Role::Source);
}

#[test]
fn new_tabs_auto_bind_to_a_fresh_source() {
    let profile = Profile::with_config(RuntimeConfig {
        auto_bind_new_tabs: true,
        ..RuntimeConfig::default()
    });
    let mut a = profile.open_tab("https://example.com/a");
    let pair_id = a.runtime.create_source().unwrap();

    profile.advance(Duration::from_secs(1));
    let b = profile.open_tab("https://example.com/b");
    assert_eq!(b.role(), Role::Target);
    assert_eq!(b.pair(), Some(pair_id));

    profile.advance(Duration::from_secs(5));
    let late = profile.open_tab("https://example.com/late");
    assert_eq!(late.role(), Role::Idle);
}
