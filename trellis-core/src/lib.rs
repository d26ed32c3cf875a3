//! Trellis Core
//!
//! This crate provides the runtime of the Trellis fine-grained reactive
//! engine. It implements:
//!
//! - Observable state (atoms and observable values)
//! - Lazily evaluated, cached computed values
//! - Reactions that re-run when what they read changes
//! - Batches and actions that group writes into one transaction
//!
//! Every derivation discovers its dependencies by running: whatever it reads
//! becomes a dependency, whatever it stops reading is dropped. Changes
//! propagate in two phases (stale, then possibly stale), so a derivation is
//! only re-run when one of its inputs produced a different value, and never
//! observes a value computed from a stale input.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: The public primitives and the [`Runtime`] that owns them
//! - `graph`: Node arena, staleness propagation and the dependency binder
//! - `config`: Runtime-wide policies ([`RuntimeConfig`])
//! - `error`: The [`ReactiveError`] type
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use parking_lot::Mutex;
//! use trellis_core::{ComputedValue, ObservableValue, Runtime};
//!
//! let rt = Runtime::new();
//! let price = ObservableValue::new(&rt, 10);
//! let amount = ObservableValue::new(&rt, 1);
//! let total = ComputedValue::new(&rt, {
//!     let (price, amount) = (price.clone(), amount.clone());
//!     move || Ok(price.get() * amount.get())
//! });
//!
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let reaction = rt.autorun(
//!     {
//!         let (total, seen) = (total.clone(), seen.clone());
//!         move |_| {
//!             seen.lock().push(total.get()?);
//!             Ok(())
//!         }
//!     },
//!     Default::default(),
//! );
//!
//! rt.run_in_action("restock", || -> trellis_core::Result<()> {
//!     amount.set(3)?;
//!     price.set(20)
//! })
//! .unwrap();
//!
//! // Both writes land in one transaction: the reaction ran once for them.
//! assert_eq!(*seen.lock(), vec![10, 60]);
//! reaction.dispose();
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod reactive;

pub use config::{EnforceActions, RuntimeConfig};
pub use error::{MutationViolation, ReactiveError, Result};
pub use graph::{DerivationState, NodeId, NodeKind};
pub use reactive::{
    Atom, BatchGuard, Comparer, ComputedOptions, ComputedValue, DependencyTree, Derivation, Disposer, Enhancer,
    Observable, ObservableOptions, ObservableValue, ObserverTree, Reaction, ReactionErrorFn, ReactionErrorHandler,
    ReactionOptions, ReactionScheduler, ReactiveNode, Runtime, Setter, ValueChange,
};
