//! Computed Value Implementation
//!
//! A computed value is a cached derivation that is itself observable. It
//! re-evaluates only when one of its dependencies changed *and* someone
//! reads it.
//!
//! # How Computed Values Work
//!
//! 1. Nothing runs on creation. The getter runs on first access.
//!
//! 2. While observed (or kept alive), the result is cached and the
//!    computed depends on whatever the getter read.
//!
//! 3. When a dependency changes, the computed does not recompute. It tells
//!    its own observers they are *possibly* stale.
//!
//! 4. When read again, it recomputes. Only if the new result differs under
//!    its comparer are its observers confirmed stale; otherwise they go back
//!    to up to date without running.
//!
//! 5. Read outside any reactive context with nobody observing it, the
//!    computed just evaluates the getter and caches nothing useful: there
//!    is nobody to tell it when the cache goes stale.
//!
//! # Errors
//!
//! A getter that fails caches the failure. Every read returns the same
//! error until a dependency changes. A failure always counts as a change.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::warn;

use super::comparer::Comparer;
use super::context::{BatchGuard, ComputationScope};
use super::introspect::{Derivation, Observable, ReactiveNode};
use super::observable::ValueChange;
use super::reaction::{Reaction, ReactionOptions};
use super::runtime::Runtime;
use crate::error::{ReactiveError, Result};
use crate::graph::{ComputedCell, DerivationState, NodeId};

/// Setter of a writable computed value.
pub type Setter<T> = Arc<dyn Fn(T) -> Result<()> + Send + Sync>;

/// Options for [`ComputedValue::with_options`].
pub struct ComputedOptions<T> {
    /// Debug name. Defaults to `ComputedValue@<id>`.
    pub name: Option<String>,

    /// Decides whether a recomputed result is a change.
    pub equals: Comparer<T>,

    /// Keep the cached value and dependencies while nobody observes.
    pub keep_alive: bool,

    /// Warn when read outside a reactive context.
    pub requires_reaction: bool,

    /// Makes the computed writable. Runs as an action.
    pub setter: Option<Setter<T>>,
}

impl<T> ComputedOptions<T> {
    /// Options with an explicit comparer, for types without `PartialEq`.
    pub fn with_comparer(equals: Comparer<T>) -> Self {
        Self {
            name: None,
            equals,
            keep_alive: false,
            requires_reaction: false,
            setter: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn equals(mut self, equals: Comparer<T>) -> Self {
        self.equals = equals;
        self
    }

    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn requires_reaction(mut self, requires_reaction: bool) -> Self {
        self.requires_reaction = requires_reaction;
        self
    }

    pub fn setter<F>(mut self, setter: F) -> Self
    where
        F: Fn(T) -> Result<()> + Send + Sync + 'static,
    {
        self.setter = Some(Arc::new(setter));
        self
    }
}

impl<T: PartialEq> ComputedOptions<T> {
    pub fn named(name: impl Into<String>) -> Self {
        Self::default().name(name)
    }
}

impl<T: PartialEq> Default for ComputedOptions<T> {
    fn default() -> Self {
        Self::with_comparer(Comparer::default())
    }
}

struct ComputedInner<T> {
    id: NodeId,
    runtime: Runtime,
    getter: Box<dyn Fn() -> Result<T> + Send + Sync>,

    /// The cached result (None if never computed or suspended).
    value: Mutex<Option<Result<T>>>,

    equals: Comparer<T>,
    keep_alive: bool,
    requires_reaction: bool,
    setter: Option<Setter<T>>,
    is_computing: AtomicBool,
    is_running_setter: AtomicBool,
}

/// Clears a flag when dropped.
struct ResetFlag<'a>(&'a AtomicBool);

impl Drop for ResetFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<T> ComputedInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn name(&self) -> String {
        self.runtime.node_name(self.id)
    }

    fn get(&self) -> Result<T> {
        if self.is_computing.load(Ordering::SeqCst) {
            return Err(ReactiveError::CyclicComputed { name: self.name() });
        }
        let rt = &self.runtime;
        let (in_batch, observed) = {
            let state = rt.lock();
            (state.in_batch > 0, state.graph.observer_count(self.id) > 0)
        };

        if !in_batch && !observed && !self.keep_alive {
            if rt.should_compute(self.id) {
                self.warn_about_untracked_read();
                let _batch = BatchGuard::new(rt);
                let value = self.compute_value(false);
                *self.value.lock() = Some(value);
            }
        } else {
            rt.report_observed(self.id);
            if rt.should_compute(self.id) {
                // Closes after the new value is stored, so hooks of
                // dependencies dropped by the rebind see a settled value.
                let _batch = BatchGuard::new(rt);
                let context = {
                    let state = rt.lock();
                    match state.tracking_context {
                        None if self.keep_alive => Some(self.id),
                        other => other,
                    }
                };
                if rt.with_tracking_context(context, || self.track_and_compute()) {
                    rt.lock().graph.propagate_change_confirmed(self.id);
                }
            }
        }
        self.cached()
    }

    fn cached(&self) -> Result<T> {
        let cached = self.value.lock().clone();
        match cached {
            Some(result) => result,
            None => {
                let value = self.compute_value(false);
                *self.value.lock() = Some(value.clone());
                value
            }
        }
    }

    /// Recompute with tracking. Returns whether the result changed.
    fn track_and_compute(&self) -> bool {
        let was_suspended =
            self.runtime.lock().graph.state_of(self.id) == Some(DerivationState::NotTracking);
        let new_value = self.compute_value(true);

        let old_value = self.value.lock().take();
        let changed = was_suspended
            || match (&old_value, &new_value) {
                (Some(Ok(old)), Ok(new)) => !self.equals.equals(old, new),
                _ => true,
            };
        *self.value.lock() = if changed { Some(new_value) } else { old_value };
        changed
    }

    fn compute_value(&self, track: bool) -> Result<T> {
        self.is_computing.store(true, Ordering::SeqCst);
        let _computing = ResetFlag(&self.is_computing);
        let _scope = ComputationScope::enter(&self.runtime);
        if track {
            self.runtime.track(self.id, || (self.getter)())
        } else {
            (self.getter)()
        }
    }

    fn warn_about_untracked_read(&self) {
        if self.requires_reaction {
            warn!(computed = %self.name(), "computed value is read outside a reactive context");
        } else if self.runtime.lock().config.computed_requires_reaction {
            warn!(
                computed = %self.name(),
                "computed value is being read outside a reactive context; doing a full recompute"
            );
        }
    }
}

impl<T> ComputedCell for ComputedInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn refresh(&self) -> Result<()> {
        self.get().map(drop)
    }

    fn clear_cache(&self) {
        if !self.keep_alive {
            let dropped = self.value.lock().take();
            drop(dropped);
        }
    }
}

impl<T> Drop for ComputedInner<T> {
    fn drop(&mut self) {
        self.runtime.remove_node(self.id);
    }
}

/// A cached derived value that is itself observable.
///
/// # Type Parameters
///
/// - `T`: The type of the computed value. Must be Clone + Send + Sync.
///
/// # Example
///
/// ```rust,ignore
/// let rt = Runtime::new();
/// let amount = ObservableValue::new(&rt, 10);
/// let total = ComputedValue::new(&rt, {
///     let amount = amount.clone();
///     move || Ok(amount.get() * 2)
/// });
///
/// assert_eq!(total.get()?, 20);
/// ```
pub struct ComputedValue<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<ComputedInner<T>>,
}

impl<T> ComputedValue<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a computed value. The getter runs on first access.
    pub fn new<F>(runtime: &Runtime, getter: F) -> Self
    where
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        Self::with_options(runtime, getter, ComputedOptions::default())
    }
}

impl<T> ComputedValue<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn with_options<F>(runtime: &Runtime, getter: F, options: ComputedOptions<T>) -> Self
    where
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        let ComputedOptions {
            name,
            equals,
            keep_alive,
            requires_reaction,
            setter,
        } = options;

        let inner = Arc::new_cyclic(|weak: &Weak<ComputedInner<T>>| {
            let cell: Weak<dyn ComputedCell> = weak.clone();
            let id = runtime.create_computed(name, keep_alive, cell);
            ComputedInner {
                id,
                runtime: runtime.clone(),
                getter: Box::new(getter),
                value: Mutex::new(None),
                equals,
                keep_alive,
                requires_reaction,
                setter,
                is_computing: AtomicBool::new(false),
                is_running_setter: AtomicBool::new(false),
            }
        });
        Self { inner }
    }

    /// Get the current value, recomputing if necessary.
    pub fn get(&self) -> Result<T> {
        self.inner.get()
    }

    /// Write through the setter, inside an action.
    pub fn set(&self, value: T) -> Result<()> {
        let Some(setter) = &self.inner.setter else {
            return Err(ReactiveError::MissingSetter {
                name: self.inner.name(),
            });
        };
        if self.inner.is_running_setter.swap(true, Ordering::SeqCst) {
            return Err(ReactiveError::SetterCycle {
                name: self.inner.name(),
            });
        }
        let _running = ResetFlag(&self.inner.is_running_setter);
        let action = format!("{}-setter", self.inner.name());
        self.inner.runtime.run_in_action(&action, || setter(value))
    }

    /// Call `listener` with every new value, from a dedicated reaction.
    ///
    /// The listener runs untracked. Dispose the returned reaction to stop.
    pub fn observe<F>(&self, listener: F, fire_immediately: bool) -> Reaction
    where
        F: Fn(&ValueChange<T>) + Send + Sync + 'static,
    {
        let computed = self.clone();
        let previous: Mutex<Option<T>> = Mutex::new(None);
        let first_time = AtomicBool::new(true);
        let name = format!("{}-observer", self.inner.name());

        self.inner.runtime.autorun(
            move |_| {
                let new_value = computed.get()?;
                let first = first_time.swap(false, Ordering::SeqCst);
                if !first || fire_immediately {
                    let change = ValueChange {
                        old_value: previous.lock().clone(),
                        new_value: new_value.clone(),
                    };
                    computed.runtime().untracked(|| listener(&change));
                }
                *previous.lock() = Some(new_value);
                Ok(())
            },
            ReactionOptions::named(name),
        )
    }

    /// Check if the computed holds a cached result.
    pub fn has_value(&self) -> bool {
        self.inner.value.lock().is_some()
    }

    pub fn is_keep_alive(&self) -> bool {
        self.inner.keep_alive
    }
}

impl<T> ReactiveNode for ComputedValue<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn node_id(&self) -> NodeId {
        self.inner.id
    }

    fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }
}

impl<T> Observable for ComputedValue<T> where T: Clone + Send + Sync + 'static {}

impl<T> Derivation for ComputedValue<T> where T: Clone + Send + Sync + 'static {}

impl<T> Clone for ComputedValue<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for ComputedValue<T>
where
    T: Clone + Send + Sync + fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputedValue")
            .field("id", &self.inner.id)
            .field("name", &self.debug_name())
            .field("state", &self.dependencies_state())
            .field("value", &*self.inner.value.lock())
            .finish()
    }
}
