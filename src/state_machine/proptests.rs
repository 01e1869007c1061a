//! Property-based tests for the session reducer
//!
//! Random input scripts are driven through [`reduce`] the way the actor
//! would drive them (epoch and ordinal bookkeeping included), then the log
//! and the derived turn list are checked for structural invariants.

use super::state::*;
use super::transition::*;
use crate::error::DecodeError;
use crate::protocol::Event;
use crate::turns::group_turns;
use proptest::prelude::*;
use std::collections::HashSet;

// ============================================================================
// Generators
// ============================================================================

fn arb_server_event() -> impl Strategy<Value = Event> {
    prop_oneof![
        ("[a-z_]{1,12}", proptest::option::of(1u64..20)).prop_map(|(name, step)| {
            Event::NodeEntered { name, step }
        }),
        "[a-zA-Z ?]{1,30}".prop_map(|question| Event::ClarificationRequested { question }),
        "[a-zA-Z0-9 \n]{0,40}".prop_map(|text| Event::StdoutChunk { text }),
        ("[a-z0-9 =]{1,30}", proptest::option::of("[a-z]{1,8}\\.py".prop_map(String::from)))
            .prop_map(|(text, filename)| Event::CodeProduced { text, filename }),
        "[a-zA-Z .]{1,40}".prop_map(|text| Event::FinalAnswer { text }),
        "[a-zA-Z ]{1,30}".prop_map(|detail| Event::BackendError { detail }),
    ]
}

#[derive(Debug, Clone)]
enum Action {
    Open,
    CloseUnclean,
    CloseClean,
    Reconnecting(u32),
    Submit(String),
    Clarify(String),
    Server(Event),
    BadFrame,
    Disconnect,
}

fn arb_action() -> impl Strategy<Value = Action> {
    prop_oneof![
        2 => Just(Action::Open),
        1 => Just(Action::CloseUnclean),
        1 => Just(Action::CloseClean),
        1 => (1u32..4).prop_map(Action::Reconnecting),
        3 => "[a-zA-Z ]{1,20}".prop_map(Action::Submit),
        2 => "[a-zA-Z ]{1,20}".prop_map(Action::Clarify),
        6 => arb_server_event().prop_map(Action::Server),
        1 => Just(Action::BadFrame),
        1 => Just(Action::Disconnect),
    ]
}

/// Apply a script the way the actor would: epoch bumps on every open,
/// per-connection ordinals restart at zero. Rejected inputs are fine.
fn drive(state: &mut SessionState, script: Vec<Action>) {
    let mut epoch: u64 = 0;
    let mut ordinal: u64 = 0;
    let _ = reduce(state, SessionInput::ConnectRequested);

    for action in script {
        let input = match action {
            Action::Open => {
                epoch += 1;
                ordinal = 0;
                SessionInput::TransportOpened { epoch }
            }
            Action::CloseUnclean => SessionInput::TransportClosed { clean: false },
            Action::CloseClean => SessionInput::TransportClosed { clean: true },
            Action::Reconnecting(attempt) => SessionInput::TransportReconnecting { attempt },
            Action::Submit(text) => SessionInput::UserSubmit { text, files: vec![] },
            Action::Clarify(text) => SessionInput::UserClarification { text },
            Action::Server(event) => {
                let input = SessionInput::FrameDecoded {
                    epoch,
                    conn_ordinal: ordinal,
                    event,
                };
                ordinal += 1;
                input
            }
            Action::BadFrame => SessionInput::FrameRejected {
                error: DecodeError::UnknownEvent { tag: "bogus".into() },
            },
            Action::Disconnect => SessionInput::DisconnectRequested,
        };
        let _ = reduce(state, input);
    }
}

fn test_state() -> SessionState {
    SessionState::new(SessionId::new("prop-session"))
}

// ============================================================================
// Structural invariants over arbitrary scripts
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Global ordinals are assigned densely in append order
    #[test]
    fn prop_log_ordinals_gapless(script in proptest::collection::vec(arb_action(), 0..40)) {
        let mut state = test_state();
        drive(&mut state, script);
        for (i, entry) in state.log.iter().enumerate() {
            prop_assert_eq!(entry.ordinal, u64::try_from(i).unwrap());
        }
    }

    /// However the session is driven, at most one turn is open
    #[test]
    fn prop_at_most_one_open_turn(script in proptest::collection::vec(arb_action(), 0..40)) {
        let mut state = test_state();
        drive(&mut state, script);
        let turns = group_turns(&state.log);
        let open = turns.iter().filter(|t| t.is_open).count();
        prop_assert!(open <= 1, "found {} open turns", open);
    }

    /// The grouper is a pure projection: re-running it changes nothing
    #[test]
    fn prop_grouper_idempotent(script in proptest::collection::vec(arb_action(), 0..40)) {
        let mut state = test_state();
        drive(&mut state, script);
        let first = group_turns(&state.log);
        let second = group_turns(&state.log);
        prop_assert_eq!(first, second);
    }

    /// Step ordinals within each turn count up from one with no gaps
    #[test]
    fn prop_step_ordinals_dense(script in proptest::collection::vec(arb_action(), 0..40)) {
        let mut state = test_state();
        drive(&mut state, script);
        for turn in group_turns(&state.log) {
            for (i, step) in turn.steps.iter().enumerate() {
                prop_assert_eq!(step.ordinal, u32::try_from(i).unwrap() + 1);
            }
        }
    }

    /// Every artifact points at a turn that exists in the derived list
    #[test]
    fn prop_artifacts_reference_real_turns(
        script in proptest::collection::vec(arb_action(), 0..40)
    ) {
        let mut state = test_state();
        drive(&mut state, script);
        let turns = group_turns(&state.log);
        let ids: HashSet<_> = turns.iter().map(|t| t.id).collect();
        for turn in &turns {
            for artifact in &turn.artifacts {
                prop_assert!(ids.contains(&artifact.producing_turn));
            }
        }
    }

    /// A closed turn never reopens, whatever arrives afterwards
    #[test]
    fn prop_closed_turns_stay_closed(
        prefix in proptest::collection::vec(arb_action(), 0..15),
        suffix in proptest::collection::vec(arb_action(), 0..15),
    ) {
        let mut state = test_state();
        drive(&mut state, prefix);
        let closed_before: HashSet<_> = group_turns(&state.log)
            .iter()
            .filter(|t| !t.is_open && !t.suspended)
            .map(|t| t.id)
            .collect();

        drive(&mut state, suffix);
        for turn in group_turns(&state.log) {
            if closed_before.contains(&turn.id) {
                prop_assert!(!turn.is_open, "turn {:?} reopened", turn.id);
            }
        }
    }
}

// ============================================================================
// Targeted properties
// ============================================================================

proptest! {
    /// A turn in flight rejects the next submission without touching state
    #[test]
    fn prop_in_flight_turn_rejects_submit(first in "[a-z ]{1,20}", second in "[a-z ]{1,20}") {
        let mut state = test_state();
        drive(&mut state, vec![Action::Open, Action::Submit(first)]);
        let log_len = state.log.len();

        let result = reduce(
            &mut state,
            SessionInput::UserSubmit { text: second, files: vec![] },
        );
        prop_assert!(matches!(result, Err(TransitionError::Busy)));
        prop_assert_eq!(state.log.len(), log_len);
    }

    /// Undecodable frames bump the counter and leave the phase alone
    #[test]
    fn prop_decode_errors_never_change_phase(tags in proptest::collection::vec("[a-z._]{1,15}", 1..10)) {
        let mut state = test_state();
        drive(&mut state, vec![Action::Open]);
        let phase_before = state.phase.clone();

        for tag in &tags {
            let result = reduce(
                &mut state,
                SessionInput::FrameRejected {
                    error: DecodeError::UnknownEvent { tag: tag.clone() },
                },
            );
            prop_assert!(result.is_ok());
        }
        prop_assert_eq!(state.decode_errors, u64::try_from(tags.len()).unwrap());
        prop_assert_eq!(&state.phase, &phase_before);
    }

    /// A clarification reply always yields a child linked to the suspended parent
    #[test]
    fn prop_clarification_child_links_parent(
        question in "[a-z ?]{1,20}",
        reply in "[a-z ]{1,20}",
    ) {
        let mut state = test_state();
        drive(&mut state, vec![
            Action::Open,
            Action::Submit("start".into()),
            Action::Server(Event::ClarificationRequested { question }),
            Action::Clarify(reply),
        ]);

        let turns = group_turns(&state.log);
        prop_assert_eq!(turns.len(), 2);
        prop_assert!(turns[0].suspended);
        prop_assert!(!turns[0].is_open);
        prop_assert_eq!(turns[1].parent, Some(turns[0].id));
        prop_assert!(turns[1].is_open);
    }
}
