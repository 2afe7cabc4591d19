//! The per-tab role state machine.
//!
//! `Idle -> Source | Target`, `Source | Target -> Idle`. Nothing else. Every
//! transition returns the side effects the runtime must perform, in order.

use splitview_core::{PairId, Role, Seq, TabState, keys};

use crate::events::{PairingError, TabEvent};

/// A key a tab listens to while in some role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerKey {
    PairRequest,
    GlobalReset,
    Disconnect(PairId),
    Sequence(PairId),
}

impl ListenerKey {
    pub fn store_key(&self) -> String {
        match self {
            ListenerKey::PairRequest => keys::PAIR_REQUEST.to_owned(),
            ListenerKey::GlobalReset => keys::GLOBAL_RESET.to_owned(),
            ListenerKey::Disconnect(pair_id) => keys::disconnect(pair_id),
            ListenerKey::Sequence(pair_id) => keys::seq(pair_id),
        }
    }
}

/// Listeners for a role. Idle tabs only hear the pairing broadcast.
pub fn listener_plan(role: Role, pair_id: Option<&PairId>) -> Vec<ListenerKey> {
    match (role, pair_id) {
        (Role::Source, Some(pair_id)) => vec![
            ListenerKey::Disconnect(pair_id.clone()),
            ListenerKey::GlobalReset,
        ],
        (Role::Target, Some(pair_id)) => vec![
            ListenerKey::Disconnect(pair_id.clone()),
            ListenerKey::GlobalReset,
            ListenerKey::Sequence(pair_id.clone()),
        ],
        _ => vec![ListenerKey::PairRequest],
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleCommand {
    /// New group or join an existing one; `source_tab_id` names this source
    /// within the group.
    BecomeSource {
        pair_id: PairId,
        source_tab_id: String,
    },
    BecomeTarget {
        pair_id: PairId,
    },
    BecomeIdle,
    RecordApplied(Seq),
    SetMuted(bool),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    StopHeartbeat,
    UnbindListeners,
    Persist,
    BindListeners(Vec<ListenerKey>),
    RegisterSource {
        pair_id: PairId,
        source_tab_id: String,
    },
    RecordLatestSource {
        pair_id: PairId,
    },
    StartHeartbeat {
        pair_id: PairId,
    },
    CatchUp {
        pair_id: PairId,
    },
    Emit(TabEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: Role,
    pub to: Role,
    pub pair_id: Option<PairId>,
    pub effects: Vec<Effect>,
}

impl Transition {
    pub fn is_noop(&self) -> bool {
        self.effects.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct RoleStateMachine {
    state: TabState,
}

impl RoleStateMachine {
    pub fn new(state: TabState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &TabState {
        &self.state
    }

    /// Effects that bring a freshly booted tab in line with its restored
    /// state. No events: the restored role is not a change.
    pub fn resume(&self) -> Vec<Effect> {
        let mut effects = vec![
            Effect::Persist,
            Effect::BindListeners(listener_plan(self.state.role, self.state.pair_id.as_ref())),
        ];
        if let (Role::Target, Some(pair_id)) = (self.state.role, &self.state.pair_id) {
            effects.push(Effect::StartHeartbeat {
                pair_id: pair_id.clone(),
            });
            effects.push(Effect::CatchUp {
                pair_id: pair_id.clone(),
            });
        }
        effects
    }

    pub fn apply(&mut self, command: RoleCommand) -> Result<Transition, PairingError> {
        let from = self.state.role;
        let effects = match command {
            RoleCommand::BecomeSource {
                pair_id,
                source_tab_id,
            } => {
                self.require_idle()?;
                let mut effects = self.change_role(Role::Source, Some(pair_id.clone()));
                self.state.source_tab_id = Some(source_tab_id.clone());
                effects.push(Effect::RegisterSource {
                    pair_id: pair_id.clone(),
                    source_tab_id,
                });
                effects.push(Effect::RecordLatestSource {
                    pair_id: pair_id.clone(),
                });
                effects.push(role_changed(Role::Source, Some(pair_id)));
                effects
            }
            RoleCommand::BecomeTarget { pair_id } => {
                self.require_idle()?;
                let mut effects = self.change_role(Role::Target, Some(pair_id.clone()));
                effects.push(Effect::StartHeartbeat {
                    pair_id: pair_id.clone(),
                });
                effects.push(role_changed(Role::Target, Some(pair_id.clone())));
                effects.push(Effect::CatchUp { pair_id });
                effects
            }
            RoleCommand::BecomeIdle => {
                if from.is_idle() {
                    Vec::new()
                } else {
                    let was_muted = self.state.muted;
                    let mut effects = self.change_role(Role::Idle, None);
                    effects.push(role_changed(Role::Idle, None));
                    if was_muted {
                        effects.push(Effect::Emit(TabEvent::MuteChanged { muted: false }));
                    }
                    effects
                }
            }
            RoleCommand::RecordApplied(seq) => {
                if self.state.role != Role::Target {
                    return Err(PairingError::NotPaired);
                }
                if seq <= self.state.last_applied_seq {
                    Vec::new()
                } else {
                    self.state.last_applied_seq = seq;
                    vec![Effect::Persist]
                }
            }
            RoleCommand::SetMuted(muted) => {
                if from.is_idle() {
                    return Err(PairingError::NotPaired);
                }
                if self.state.muted == muted {
                    Vec::new()
                } else {
                    self.state.muted = muted;
                    vec![
                        Effect::Persist,
                        Effect::Emit(TabEvent::MuteChanged { muted }),
                    ]
                }
            }
        };

        Ok(Transition {
            from,
            to: self.state.role,
            pair_id: self.state.pair_id.clone(),
            effects,
        })
    }

    fn require_idle(&self) -> Result<(), PairingError> {
        if self.state.role.is_idle() {
            Ok(())
        } else {
            Err(PairingError::NotIdle(self.state.role))
        }
    }

    /// Swaps role and pair, resetting per-pair fields, and returns the
    /// teardown and rebinding effects shared by every role change.
    fn change_role(&mut self, role: Role, pair_id: Option<PairId>) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.state.role == Role::Target {
            effects.push(Effect::StopHeartbeat);
        }
        effects.push(Effect::UnbindListeners);

        self.state.role = role;
        self.state.pair_id = pair_id;
        self.state.last_applied_seq = 0;
        self.state.source_tab_id = None;
        self.state.muted = false;

        effects.push(Effect::Persist);
        effects.push(Effect::BindListeners(listener_plan(
            role,
            self.state.pair_id.as_ref(),
        )));
        effects
    }
}

fn role_changed(role: Role, pair_id: Option<PairId>) -> Effect {
    Effect::Emit(TabEvent::RoleChanged { role, pair_id })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle_machine() -> RoleStateMachine {
        RoleStateMachine::new(TabState::idle("inst-a".to_owned()))
    }

    fn become_target(machine: &mut RoleStateMachine, pair: &str) -> Transition {
        machine
            .apply(RoleCommand::BecomeTarget {
                pair_id: pair.to_owned(),
            })
            .unwrap()
    }

    #[test]
    fn idle_to_target_binds_heartbeats_and_catches_up() {
        let mut machine = idle_machine();
        let transition = become_target(&mut machine, "p1");
        let pair = "p1".to_owned();

        assert_eq!(transition.from, Role::Idle);
        assert_eq!(transition.to, Role::Target);
        assert_eq!(
            transition.effects,
            vec![
                Effect::UnbindListeners,
                Effect::Persist,
                Effect::BindListeners(vec![
                    ListenerKey::Disconnect(pair.clone()),
                    ListenerKey::GlobalReset,
                    ListenerKey::Sequence(pair.clone()),
                ]),
                Effect::StartHeartbeat {
                    pair_id: pair.clone()
                },
                Effect::Emit(TabEvent::RoleChanged {
                    role: Role::Target,
                    pair_id: Some(pair.clone()),
                }),
                Effect::CatchUp { pair_id: pair },
            ]
        );
    }

    #[test]
    fn source_registers_itself_and_records_latest() {
        let mut machine = idle_machine();
        let transition = machine
            .apply(RoleCommand::BecomeSource {
                pair_id: "p1".to_owned(),
                source_tab_id: "s1".to_owned(),
            })
            .unwrap();

        assert_eq!(machine.state().source_tab_id.as_deref(), Some("s1"));
        assert!(transition.effects.contains(&Effect::RegisterSource {
            pair_id: "p1".to_owned(),
            source_tab_id: "s1".to_owned(),
        }));
        assert!(transition.effects.contains(&Effect::RecordLatestSource {
            pair_id: "p1".to_owned(),
        }));
        assert!(!transition
            .effects
            .iter()
            .any(|effect| matches!(effect, Effect::StartHeartbeat { .. })));
    }

    #[test]
    fn paired_tab_rejects_second_pairing() {
        let mut machine = idle_machine();
        become_target(&mut machine, "p1");

        let err = machine
            .apply(RoleCommand::BecomeSource {
                pair_id: "p2".to_owned(),
                source_tab_id: "s".to_owned(),
            })
            .unwrap_err();
        assert_eq!(err, PairingError::NotIdle(Role::Target));
        assert_eq!(machine.state().pair_id.as_deref(), Some("p1"));
    }

    #[test]
    fn going_idle_twice_is_a_noop_the_second_time() {
        let mut machine = idle_machine();
        become_target(&mut machine, "p1");

        let first = machine.apply(RoleCommand::BecomeIdle).unwrap();
        assert_eq!(first.effects[0], Effect::StopHeartbeat);
        assert!(first.effects.contains(&Effect::BindListeners(vec![
            ListenerKey::PairRequest
        ])));

        let second = machine.apply(RoleCommand::BecomeIdle).unwrap();
        assert!(second.is_noop());
        assert_eq!(machine.state(), &TabState::idle("inst-a".to_owned()));
    }

    #[test]
    fn muting_needs_a_role_and_clears_on_idle() {
        let mut machine = idle_machine();
        assert_eq!(
            machine.apply(RoleCommand::SetMuted(true)).unwrap_err(),
            PairingError::NotPaired
        );

        become_target(&mut machine, "p1");
        let muted = machine.apply(RoleCommand::SetMuted(true)).unwrap();
        assert!(muted
            .effects
            .contains(&Effect::Emit(TabEvent::MuteChanged { muted: true })));
        assert!(machine.apply(RoleCommand::SetMuted(true)).unwrap().is_noop());

        let idle = machine.apply(RoleCommand::BecomeIdle).unwrap();
        assert_eq!(
            idle.effects.last(),
            Some(&Effect::Emit(TabEvent::MuteChanged { muted: false }))
        );
        assert!(!machine.state().muted);
    }

    #[test]
    fn applied_sequence_only_moves_forward() {
        let mut machine = idle_machine();
        become_target(&mut machine, "p1");

        assert_eq!(
            machine.apply(RoleCommand::RecordApplied(6)).unwrap().effects,
            vec![Effect::Persist]
        );
        assert!(machine.apply(RoleCommand::RecordApplied(5)).unwrap().is_noop());
        assert_eq!(machine.state().last_applied_seq, 6);
    }

    #[test]
    fn resume_rebinds_a_restored_target() {
        let mut state = TabState::idle("inst-b".to_owned());
        state.role = Role::Target;
        state.pair_id = Some("p1".to_owned());
        state.last_applied_seq = 3;
        let machine = RoleStateMachine::new(state);

        let effects = machine.resume();
        assert!(effects.contains(&Effect::StartHeartbeat {
            pair_id: "p1".to_owned()
        }));
        assert!(!effects
            .iter()
            .any(|effect| matches!(effect, Effect::Emit(_))));
        assert_eq!(machine.state().last_applied_seq, 3);
    }

    #[test]
    fn listener_plan_never_leaves_idle_tabs_on_pair_keys() {
        assert_eq!(listener_plan(Role::Idle, None), vec![ListenerKey::PairRequest]);
        assert_eq!(
            listener_plan(Role::Source, Some(&"p".to_owned())),
            vec![
                ListenerKey::Disconnect("p".to_owned()),
                ListenerKey::GlobalReset
            ]
        );
        assert_eq!(
            ListenerKey::Sequence("p".to_owned()).store_key(),
            keys::seq(&"p".to_owned())
        );
    }

    mod invariants {
        use proptest::prelude::*;

        use super::*;

        fn arb_command() -> impl Strategy<Value = RoleCommand> {
            let pair = prop_oneof![Just("p1".to_owned()), Just("p2".to_owned())];
            prop_oneof![
                (pair.clone(), "[a-z]{3}").prop_map(|(pair_id, source_tab_id)| {
                    RoleCommand::BecomeSource {
                        pair_id,
                        source_tab_id,
                    }
                }),
                pair.prop_map(|pair_id| RoleCommand::BecomeTarget { pair_id }),
                Just(RoleCommand::BecomeIdle),
                (0u64..50).prop_map(RoleCommand::RecordApplied),
                any::<bool>().prop_map(RoleCommand::SetMuted),
            ]
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(128))]

            #[test]
            fn role_state_stays_consistent(
                commands in proptest::collection::vec(arb_command(), 1..60)
            ) {
                let mut machine = idle_machine();
                for command in commands {
                    let before = machine.state().clone();
                    let result = machine.apply(command.clone());
                    let after = machine.state().clone();

                    prop_assert_eq!(after.role.is_idle(), after.pair_id.is_none());
                    prop_assert!(!after.muted || !after.role.is_idle());
                    prop_assert!(after.source_tab_id.is_none() || after.role == Role::Source);

                    let transition = match result {
                        Ok(transition) => transition,
                        Err(_) => {
                            prop_assert_eq!(&after, &before);
                            continue;
                        }
                    };
                    prop_assert_eq!(transition.from, before.role);
                    prop_assert_eq!(transition.to, after.role);

                    let changed = (before.role, &before.pair_id) != (after.role, &after.pair_id);
                    let announced = transition.effects.iter().any(|effect| {
                        matches!(effect, Effect::Emit(TabEvent::RoleChanged { .. }))
                    });
                    prop_assert_eq!(changed, announced);
                    if changed {
                        prop_assert_eq!(after.last_applied_seq, 0);
                        prop_assert!(!after.muted);
                    } else {
                        prop_assert!(after.last_applied_seq >= before.last_applied_seq);
                    }

                    if let RoleCommand::RecordApplied(seq) = command {
                        prop_assert_eq!(
                            after.last_applied_seq,
                            before.last_applied_seq.max(seq)
                        );
                    }
                }
            }
        }
    }
}
