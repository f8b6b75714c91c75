//! Per-submission cycle state machine
//!
//! Implements the Elm Architecture pattern with pure state transitions.
//! The orchestrator feeds events in and executes the returned effects.

mod effect;
pub mod event;
pub mod state;
pub(crate) mod transition;

#[cfg(test)]
mod proptests;

pub use effect::{Effect, Synthesis};
pub use event::CycleEvent;
pub use state::{CycleContext, CycleOutcome, CycleState, ProviderFailure};
pub use transition::{transition, validate_content, TransitionError, TransitionResult};
