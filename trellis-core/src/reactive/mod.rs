//! Reactive Primitives
//!
//! This module implements the public side of the engine: observables,
//! computed values, reactions and actions, all created from a [`Runtime`].
//!
//! # Concepts
//!
//! ## Observables
//!
//! An [`ObservableValue`] is a container for mutable state. When it is read
//! inside a tracked run (a computed getter or a reaction), the running
//! derivation starts depending on it. When it changes, every dependent is
//! marked stale. An [`Atom`] is the same thing without a value, for state
//! that lives elsewhere.
//!
//! ## Computed values
//!
//! A [`ComputedValue`] is a derived value that caches its result. While
//! observed it only re-evaluates when one of its dependencies actually
//! changed; when nobody observes it, it suspends and drops its cache.
//!
//! ## Reactions
//!
//! A [`Reaction`] is the side-effect endpoint. It is scheduled rather than
//! run inline when it goes stale, and the scheduled reactions run when the
//! outermost batch ends, after every change of the batch has propagated.
//!
//! ## Actions
//!
//! [`Runtime::run_in_action`] runs code that changes state: its writes are
//! batched together and its reads are not tracked.
//!
//! # Implementation Notes
//!
//! The ambient state ("which derivation is reading", "how deep is the
//! batch") lives in the runtime and is only changed through RAII guards,
//! so that a panic in user code leaves the runtime usable.

mod action;
mod atom;
mod comparer;
mod computed;
mod context;
mod disposer;
mod enhancer;
mod introspect;
mod observable;
mod reaction;
mod runtime;

pub use atom::Atom;
pub use comparer::Comparer;
pub use computed::{ComputedOptions, ComputedValue, Setter};
pub use context::BatchGuard;
pub use disposer::Disposer;
pub use enhancer::Enhancer;
pub use introspect::{DependencyTree, Derivation, Observable, ObserverTree, ReactiveNode};
pub use observable::{ObservableOptions, ObservableValue, ValueChange};
pub use reaction::{Reaction, ReactionErrorFn, ReactionOptions};
pub use runtime::{ReactionErrorHandler, ReactionScheduler, Runtime};
