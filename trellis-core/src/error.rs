//! Error Types
//!
//! Every failure the engine can report is a [`ReactiveError`]. Errors are
//! values: writes return them, computed reads return them, and reaction
//! failures are routed to handlers instead of unwinding through the flush
//! loop.
//!
//! `ReactiveError` is `Clone` because a computed value caches a failed
//! evaluation and hands the same error to every reader until one of its
//! dependencies changes.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// Convenience alias used throughout the crate.
pub type Result<T, E = ReactiveError> = std::result::Result<T, E>;

/// Why a write was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationViolation {
    /// The write happened while a computed value was evaluating.
    InsideComputed,

    /// The observable has observers and was written outside an action.
    ObservedOutsideAction,

    /// Every write outside an action is rejected (`enforce_actions = always`).
    OutsideAction,
}

impl fmt::Display for MutationViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsideComputed => {
                f.write_str("side effects are not allowed while a computed value is evaluating")
            }
            Self::ObservedOutsideAction => {
                f.write_str("observed observables may only be changed inside an action")
            }
            Self::OutsideAction => f.write_str("observables may only be changed inside an action"),
        }
    }
}

/// Errors produced by the reactive runtime.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReactiveError {
    /// An observable was written where state changes are not allowed.
    #[error("cannot modify '{name}': {reason}")]
    IllegalMutation {
        name: String,
        reason: MutationViolation,
    },

    /// A computed value tried to read itself while evaluating.
    #[error("cycle detected in computation '{name}'")]
    CyclicComputed { name: String },

    /// The reaction flush loop hit its iteration ceiling.
    #[error(
        "reactions did not converge to a stable state after {iterations} iterations; \
         probably a cycle in reaction '{reaction}'"
    )]
    NonConvergentCycle { iterations: usize, reaction: String },

    /// `set` was called on a computed value without a setter.
    #[error("computed '{name}' has no setter")]
    MissingSetter { name: String },

    /// The setter of a computed value re-entered itself.
    #[error("setter of computed '{name}' is already running")]
    SetterCycle { name: String },

    /// A free-form failure raised by user code.
    #[error("{0}")]
    Message(String),

    /// Any other error raised by user code.
    #[error("{0}")]
    Other(Arc<dyn StdError + Send + Sync + 'static>),
}

impl ReactiveError {
    /// Build an error from a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    /// Wrap an arbitrary error raised inside a derivation.
    pub fn other<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Other(Arc::new(error))
    }

    /// Returns true for errors the engine itself raised to protect its
    /// invariants (as opposed to failures coming from user code).
    pub fn is_engine_error(&self) -> bool {
        !matches!(self, Self::Message(_) | Self::Other(_))
    }
}
