//! Pure state transition function

use super::{CycleContext, CycleOutcome, CycleState, CycleEvent, Effect, ProviderFailure, Synthesis};
use crate::analytics::EventKind;
use crate::db::{NewTurn, Role, Turn};
use thiserror::Error;

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: CycleState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: CycleState) -> Self {
        Self {
            new_state: state,
            effects: vec![],
        }
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }
}

/// Errors that can occur during transition
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Message content is empty")]
    EmptyContent,
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
}

/// Trim submitted content, rejecting anything that is blank
pub fn validate_content(content: &str) -> Result<String, TransitionError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        Err(TransitionError::EmptyContent)
    } else {
        Ok(trimmed.to_string())
    }
}

/// Pure transition function
///
/// Given the same inputs it always produces the same outputs and performs
/// no I/O. Sequence numbers are assigned here and nowhere else.
pub fn transition(
    state: &CycleState,
    context: &CycleContext,
    event: CycleEvent,
) -> Result<TransitionResult, TransitionError> {
    match (state, event) {
        // Created + Submitted -> append user turn at last + 1
        (CycleState::Created, CycleEvent::Submitted { content }) => {
            let content = validate_content(&content)?;
            let turn = NewTurn::user(context.last_sequence + 1, content, context.provenance);
            Ok(TransitionResult::new(CycleState::Created).with_effect(Effect::AppendTurn(turn)))
        }

        (CycleState::Created, CycleEvent::UserTurnPersisted { turn }) => {
            expect_turn(&turn, Role::User, context.last_sequence + 1)?;
            Ok(
                TransitionResult::new(CycleState::UserTurnAppended { user_turn: turn })
                    .with_effect(Effect::BuildContext),
            )
        }

        (CycleState::UserTurnAppended { user_turn }, CycleEvent::ContextBuilt { context }) => Ok(
            TransitionResult::new(CycleState::AwaitingProvider {
                user_turn: user_turn.clone(),
            })
            .with_effect(Effect::RequestReply { context }),
        ),

        // A blank reply is as useless as no reply, and retrying will not help
        (CycleState::AwaitingProvider { user_turn }, CycleEvent::ProviderReplied { content })
            if content.trim().is_empty() =>
        {
            let failure = ProviderFailure::new("Provider returned an empty reply", false);
            Ok(provider_failed(user_turn, failure))
        }

        (CycleState::AwaitingProvider { user_turn }, CycleEvent::ProviderReplied { content }) => {
            let turn = NewTurn::assistant(user_turn.sequence + 1, content);
            Ok(TransitionResult::new(CycleState::AwaitingProvider {
                user_turn: user_turn.clone(),
            })
            .with_effect(Effect::AppendTurn(turn)))
        }

        (CycleState::AwaitingProvider { user_turn }, CycleEvent::ProviderFailed { failure }) => {
            Ok(provider_failed(user_turn, failure))
        }

        (CycleState::AwaitingProvider { user_turn }, CycleEvent::AssistantTurnPersisted { turn }) => {
            expect_turn(&turn, Role::Assistant, user_turn.sequence + 1)?;

            let kind = if context.wants_synthesis() {
                EventKind::VoiceUsed
            } else {
                EventKind::MessageSent
            };
            let synthesize = context.wants_synthesis().then(|| Synthesis {
                sequence: turn.sequence,
                text: turn.content.clone(),
            });

            Ok(TransitionResult::new(CycleState::AssistantTurnAppended {
                user_turn: user_turn.clone(),
                assistant_turn: turn.clone(),
            })
            .with_effect(Effect::Report {
                kind,
                sequence: turn.sequence,
                retryable: None,
                synthesize,
            }))
        }

        (
            CycleState::AssistantTurnAppended {
                user_turn,
                assistant_turn,
            },
            CycleEvent::Reported,
        ) => Ok(reported(CycleOutcome::Replied {
            user_turn: user_turn.clone(),
            assistant_turn: assistant_turn.clone(),
        })),

        (CycleState::ProviderFailed { user_turn, failure }, CycleEvent::Reported) => {
            Ok(reported(CycleOutcome::Failed {
                user_turn: user_turn.clone(),
                failure: failure.clone(),
            }))
        }

        (CycleState::Reported { outcome }, CycleEvent::Responded) => {
            Ok(TransitionResult::new(CycleState::Done {
                outcome: outcome.clone(),
            }))
        }

        (state, event) => Err(TransitionError::InvalidTransition(format!(
            "No transition from {} on {}",
            state.name(),
            event.name()
        ))),
    }
}

fn provider_failed(user_turn: &Turn, failure: ProviderFailure) -> TransitionResult {
    let report = Effect::Report {
        kind: EventKind::MessageFailed,
        sequence: user_turn.sequence,
        retryable: Some(failure.retryable),
        synthesize: None,
    };
    TransitionResult::new(CycleState::ProviderFailed {
        user_turn: user_turn.clone(),
        failure,
    })
    .with_effect(report)
}

fn reported(outcome: CycleOutcome) -> TransitionResult {
    TransitionResult::new(CycleState::Reported { outcome }).with_effect(Effect::Respond)
}

fn expect_turn(turn: &Turn, role: Role, sequence: i64) -> Result<(), TransitionError> {
    if turn.role == role && turn.sequence == sequence {
        Ok(())
    } else {
        Err(TransitionError::InvalidTransition(format!(
            "Expected {role} turn {sequence}, store returned {} turn {}",
            turn.role, turn.sequence
        )))
    }
}
