//! Property-based tests for the cycle state machine

use super::*;
use crate::analytics::EventKind;
use crate::db::{Provenance, Role, Turn};
use crate::runtime::ContextTurn;
use chrono::Utc;
use proptest::prelude::*;

// ============================================================================
// Arbitrary Generators
// ============================================================================

fn make_turn(sequence: i64, role: Role, content: String) -> Turn {
    Turn {
        conversation_id: "conv".to_string(),
        sequence,
        role,
        content,
        provenance: None,
        created_at: Utc::now(),
    }
}

fn arb_role() -> impl Strategy<Value = Role> {
    prop_oneof![Just(Role::User), Just(Role::Assistant)]
}

fn arb_turn() -> impl Strategy<Value = Turn> {
    (1i64..50, arb_role(), "[a-z ]{0,20}").prop_map(|(seq, role, content)| make_turn(seq, role, content))
}

fn arb_failure() -> impl Strategy<Value = ProviderFailure> {
    ("[a-z ]{1,20}", any::<bool>()).prop_map(|(msg, retryable)| ProviderFailure::new(msg, retryable))
}

fn arb_outcome() -> impl Strategy<Value = CycleOutcome> {
    prop_oneof![
        (arb_turn(), arb_turn()).prop_map(|(user_turn, assistant_turn)| CycleOutcome::Replied {
            user_turn,
            assistant_turn
        }),
        (arb_turn(), arb_failure())
            .prop_map(|(user_turn, failure)| CycleOutcome::Failed { user_turn, failure }),
    ]
}

fn arb_state() -> impl Strategy<Value = CycleState> {
    prop_oneof![
        Just(CycleState::Created),
        arb_turn().prop_map(|user_turn| CycleState::UserTurnAppended { user_turn }),
        arb_turn().prop_map(|user_turn| CycleState::AwaitingProvider { user_turn }),
        (arb_turn(), arb_turn()).prop_map(|(user_turn, assistant_turn)| {
            CycleState::AssistantTurnAppended {
                user_turn,
                assistant_turn,
            }
        }),
        (arb_turn(), arb_failure())
            .prop_map(|(user_turn, failure)| CycleState::ProviderFailed { user_turn, failure }),
        arb_outcome().prop_map(|outcome| CycleState::Reported { outcome }),
        arb_outcome().prop_map(|outcome| CycleState::Done { outcome }),
    ]
}

fn arb_event() -> impl Strategy<Value = CycleEvent> {
    prop_oneof![
        "[a-z ]{0,20}".prop_map(|content| CycleEvent::Submitted { content }),
        arb_turn().prop_map(|turn| CycleEvent::UserTurnPersisted { turn }),
        arb_turn().prop_map(|turn| CycleEvent::AssistantTurnPersisted { turn }),
        Just(CycleEvent::ContextBuilt {
            context: vec![ContextTurn::new(Role::User, "hello")]
        }),
        "[a-z ]{0,20}".prop_map(|content| CycleEvent::ProviderReplied { content }),
        arb_failure().prop_map(|failure| CycleEvent::ProviderFailed { failure }),
        Just(CycleEvent::Reported),
        Just(CycleEvent::Responded),
    ]
}

fn arb_context() -> impl Strategy<Value = CycleContext> {
    (
        prop_oneof![Just(Provenance::Text), Just(Provenance::Voice)],
        any::<bool>(),
        0i64..40,
        any::<bool>(),
    )
        .prop_map(|(provenance, want_audio, last, voice)| {
            CycleContext::new("conv", "user", provenance, want_audio, last)
                .with_voice_available(voice)
        })
}

/// Provider behavior for a simulated cycle
#[derive(Debug, Clone)]
enum ProviderScript {
    Reply(String),
    Fail(ProviderFailure),
}

fn arb_script() -> impl Strategy<Value = ProviderScript> {
    prop_oneof![
        "[a-z ]{0,20}".prop_map(ProviderScript::Reply),
        arb_failure().prop_map(ProviderScript::Fail),
    ]
}

/// Drive a full cycle the way the orchestrator does, with a perfect store.
/// Returns the final state and every effect produced.
fn run_cycle(
    context: &CycleContext,
    content: String,
    script: ProviderScript,
) -> Result<(CycleState, Vec<Effect>), TransitionError> {
    let mut state = CycleState::Created;
    let mut all_effects = Vec::new();
    let mut pending = vec![CycleEvent::Submitted { content }];

    while let Some(event) = pending.pop() {
        let result = transition(&state, context, event)?;
        state = result.new_state;
        for effect in result.effects {
            let next = match &effect {
                Effect::AppendTurn(new_turn) => {
                    let turn = make_turn(new_turn.sequence, new_turn.role, new_turn.content.clone());
                    match new_turn.role {
                        Role::User => CycleEvent::UserTurnPersisted { turn },
                        Role::Assistant => CycleEvent::AssistantTurnPersisted { turn },
                    }
                }
                Effect::BuildContext => CycleEvent::ContextBuilt { context: vec![] },
                Effect::RequestReply { .. } => match &script {
                    ProviderScript::Reply(text) => CycleEvent::ProviderReplied {
                        content: text.clone(),
                    },
                    ProviderScript::Fail(failure) => CycleEvent::ProviderFailed {
                        failure: failure.clone(),
                    },
                },
                Effect::Report { .. } => CycleEvent::Reported,
                Effect::Respond => CycleEvent::Responded,
            };
            all_effects.push(effect);
            pending.push(next);
        }
    }

    Ok((state, all_effects))
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Arbitrary (state, event) pairs either transition or return an error
    #[test]
    fn prop_transition_never_panics(
        state in arb_state(),
        context in arb_context(),
        event in arb_event()
    ) {
        let _ = transition(&state, &context, event);
    }

    /// Done accepts nothing
    #[test]
    fn prop_done_is_terminal(
        outcome in arb_outcome(),
        context in arb_context(),
        event in arb_event()
    ) {
        let state = CycleState::Done { outcome };
        prop_assert!(transition(&state, &context, event).is_err());
    }

    /// Every appended turn continues the sequence with no gaps
    #[test]
    fn prop_sequences_are_consecutive(
        context in arb_context(),
        content in "[a-z]{1,10}",
        script in arb_script()
    ) {
        let (_, effects) = run_cycle(&context, content, script).unwrap();
        let sequences: Vec<i64> = effects
            .iter()
            .filter_map(|e| match e {
                Effect::AppendTurn(t) => Some(t.sequence),
                _ => None,
            })
            .collect();

        prop_assert!(!sequences.is_empty());
        for (i, seq) in sequences.iter().enumerate() {
            prop_assert_eq!(*seq, context.last_sequence + 1 + i as i64);
        }
    }

    /// A cycle ends in exactly one outcome, with one report, and an
    /// assistant turn only when the provider produced usable text
    #[test]
    fn prop_outcomes_are_exclusive(
        context in arb_context(),
        content in "[a-z]{1,10}",
        script in arb_script()
    ) {
        let (state, effects) = run_cycle(&context, content, script.clone()).unwrap();

        let reports: Vec<&Effect> = effects
            .iter()
            .filter(|e| matches!(e, Effect::Report { .. }))
            .collect();
        prop_assert_eq!(reports.len(), 1);

        let appends = effects
            .iter()
            .filter(|e| matches!(e, Effect::AppendTurn(_)))
            .count();

        let usable_reply = matches!(&script, ProviderScript::Reply(text) if !text.trim().is_empty());

        match state {
            CycleState::Done { outcome: CycleOutcome::Replied { user_turn, assistant_turn } } => {
                prop_assert!(usable_reply);
                prop_assert_eq!(appends, 2);
                prop_assert_eq!(assistant_turn.sequence, user_turn.sequence + 1);
                let is_sent_or_voice = matches!(
                    reports[0],
                    Effect::Report { kind: EventKind::MessageSent | EventKind::VoiceUsed, retryable: None, .. }
                );
                prop_assert!(is_sent_or_voice);
            }
            CycleState::Done { outcome: CycleOutcome::Failed { user_turn, failure } } => {
                prop_assert!(!usable_reply);
                prop_assert_eq!(appends, 1);
                let is_failed_with_flag = matches!(
                    reports[0],
                    Effect::Report { kind: EventKind::MessageFailed, sequence, retryable: Some(r), synthesize: None }
                        if *sequence == user_turn.sequence && *r == failure.retryable
                );
                prop_assert!(is_failed_with_flag);
            }
            other => prop_assert!(false, "cycle did not finish: {:?}", other),
        }
    }

    /// Synthesis is requested exactly when the reply succeeded and the
    /// caller wanted audio or spoke the input
    #[test]
    fn prop_synthesis_only_when_wanted(
        context in arb_context(),
        content in "[a-z]{1,10}",
        script in arb_script()
    ) {
        let (state, effects) = run_cycle(&context, content, script).unwrap();
        let synthesized = effects
            .iter()
            .any(|e| matches!(e, Effect::Report { synthesize: Some(_), .. }));
        let replied = matches!(state, CycleState::Done { outcome: CycleOutcome::Replied { .. } });
        prop_assert_eq!(synthesized, replied && context.wants_synthesis());

        // Voice use is only reported when audio is actually produced
        let voice_reported = effects
            .iter()
            .any(|e| matches!(e, Effect::Report { kind: EventKind::VoiceUsed, .. }));
        prop_assert_eq!(voice_reported, synthesized);
    }

    /// Blank input never produces an effect
    #[test]
    fn prop_blank_input_rejected(
        context in arb_context(),
        blank in "[ \t\n]{0,5}"
    ) {
        let result = transition(&CycleState::Created, &context, CycleEvent::Submitted { content: blank });
        prop_assert_eq!(result.unwrap_err(), TransitionError::EmptyContent);
    }
}
