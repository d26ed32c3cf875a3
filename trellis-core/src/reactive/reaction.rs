//! Reaction Implementation
//!
//! A reaction is a side-effecting derivation. It is never observed itself;
//! it re-runs whenever something it read has changed.
//!
//! # How Reactions Work
//!
//! 1. After creation the reaction does nothing until it is scheduled.
//!
//! 2. When it runs, its invalidation handler is called. The handler should
//!    call [`Reaction::track`]; everything read inside `track` becomes a
//!    dependency.
//!
//! 3. When a dependency changes, the reaction is queued. Queued reactions
//!    run when the outermost batch ends, in the order they were queued.
//!
//! 4. Before running, a reaction that was only *possibly* stale checks its
//!    computed dependencies. If none of them actually changed, it skips
//!    the run.
//!
//! # Differences from Computed Values
//!
//! - Computed values return a value; reactions do not.
//! - Computed values are lazy (compute on access); reactions are eager
//!   (run when dependencies change).
//! - Reactions may change state, which can queue them again. The flush
//!   loop bounds how often that can happen.
//!
//! # Errors
//!
//! A failing run never aborts the flush. The error goes to the reaction's
//! own handler when it has one, else it is logged and passed to every
//! handler registered with [`Runtime::on_reaction_error`].
//!
//! # Lifetime
//!
//! The runtime keeps a reaction alive until [`Reaction::dispose`] is called.
//! Dropping the handle does not stop it.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use tracing::debug;

use super::context::BatchGuard;
use super::introspect::{Derivation, ReactiveNode};
use super::runtime::Runtime;
use crate::error::{ReactiveError, Result};
use crate::graph::{NodeId, ReactionCell};

type InvalidateFn = Box<dyn Fn(&Reaction) -> Result<()> + Send + Sync>;

/// Error handler of a single reaction.
pub type ReactionErrorFn = Arc<dyn Fn(&ReactiveError, &Reaction) + Send + Sync>;

/// Options for [`Reaction::new`] and [`Runtime::autorun`].
#[derive(Clone, Default)]
pub struct ReactionOptions {
    /// Debug name. Defaults to `Reaction@<id>` / `Autorun@<id>`.
    pub name: Option<String>,

    /// Receives errors of this reaction instead of the global handlers.
    pub error_handler: Option<ReactionErrorFn>,

    /// Warn when a run reads no observable.
    pub requires_observable: bool,
}

impl ReactionOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ReactiveError, &Reaction) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    pub fn requires_observable(mut self, requires_observable: bool) -> Self {
        self.requires_observable = requires_observable;
        self
    }
}

impl fmt::Debug for ReactionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactionOptions")
            .field("name", &self.name)
            .field("error_handler", &self.error_handler.is_some())
            .field("requires_observable", &self.requires_observable)
            .finish()
    }
}

struct ReactionInner {
    id: NodeId,
    name: String,
    runtime: Runtime,
    on_invalidate: InvalidateFn,
    error_handler: Option<ReactionErrorFn>,
    is_disposed: AtomicBool,

    /// Number of completed tracked runs.
    run_count: AtomicUsize,

    this: Weak<ReactionInner>,
}

impl ReactionCell for ReactionInner {
    fn run_reaction(&self) {
        if self.is_disposed.load(Ordering::SeqCst) {
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let reaction = Reaction { inner: this };
        let rt = &self.runtime;

        let _batch = BatchGuard::new(rt);
        if let Some((is_scheduled, _)) = rt.lock().graph.reaction_flags_mut(self.id) {
            *is_scheduled = false;
        }
        if rt.should_compute(self.id) {
            debug!(reaction = %self.name, "running reaction");
            if let Err(err) = (self.on_invalidate)(&reaction) {
                reaction.report_error(err);
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Marks a reaction as running for the duration of a tracked run.
struct Running<'a> {
    runtime: &'a Runtime,
    id: NodeId,
}

impl<'a> Running<'a> {
    fn start(runtime: &'a Runtime, id: NodeId) -> Self {
        Self::set(runtime, id, true);
        Self { runtime, id }
    }

    fn set(runtime: &Runtime, id: NodeId, running: bool) {
        if let Some((_, is_running)) = runtime.lock().graph.reaction_flags_mut(id) {
            *is_running = running;
        }
    }
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        Self::set(self.runtime, self.id, false);
    }
}

/// A side-effecting derivation.
///
/// # Example
///
/// ```rust,ignore
/// let rt = Runtime::new();
/// let count = ObservableValue::new(&rt, 0);
///
/// let reaction = rt.autorun({
///     let count = count.clone();
///     move |_| {
///         println!("Count is: {}", count.get());
///         Ok(())
///     }
/// }, Default::default());
///
/// rt.run_in_action("set", || count.set(5))?; // Prints: "Count is: 5"
/// reaction.dispose();
/// ```
#[derive(Clone)]
pub struct Reaction {
    inner: Arc<ReactionInner>,
}

impl Reaction {
    /// Create a reaction with an invalidation handler.
    ///
    /// The handler runs each time the reaction is due and should call
    /// [`Reaction::track`]. Nothing runs until [`Reaction::schedule`].
    pub fn new<F>(runtime: &Runtime, on_invalidate: F, options: ReactionOptions) -> Self
    where
        F: Fn(&Reaction) -> Result<()> + Send + Sync + 'static,
    {
        Self::create(runtime, Box::new(on_invalidate), options, "Reaction")
    }

    fn create(runtime: &Runtime, on_invalidate: InvalidateFn, options: ReactionOptions, prefix: &str) -> Self {
        let id = runtime.allocate_id();
        let name = options
            .name
            .unwrap_or_else(|| format!("{prefix}@{}", id.raw()));
        let inner = Arc::new_cyclic(|this| ReactionInner {
            id,
            name: name.clone(),
            runtime: runtime.clone(),
            on_invalidate,
            error_handler: options.error_handler,
            is_disposed: AtomicBool::new(false),
            run_count: AtomicUsize::new(0),
            this: this.clone(),
        });
        let cell: Arc<dyn ReactionCell> = inner.clone();
        runtime.create_reaction(id, name, cell, options.requires_observable);
        Self { inner }
    }

    /// Run `f` and make whatever it reads the reaction's dependencies.
    ///
    /// Errors returned by `f` are routed to the reaction's error handler.
    pub fn track(&self, f: impl FnOnce() -> Result<()>) {
        if self.is_disposed() {
            return;
        }
        let rt = &self.inner.runtime;
        let id = self.inner.id;
        let _batch = BatchGuard::new(rt);

        let result = {
            let _running = Running::start(rt, id);
            rt.with_tracking_context(Some(id), || rt.track(id, f))
        };
        self.inner.run_count.fetch_add(1, Ordering::SeqCst);

        if self.is_disposed() {
            rt.remove_node(id);
        }
        if let Err(err) = result {
            self.report_error(err);
        }
    }

    /// Queue the reaction and flush, unless a batch is open.
    pub fn schedule(&self) {
        if self.is_disposed() {
            return;
        }
        let queued = self.inner.runtime.lock().graph.schedule(self.inner.id);
        if queued {
            self.inner.runtime.run_reactions();
        }
    }

    /// Stop the reaction and release its dependencies.
    ///
    /// Idempotent. Called from within the reaction's own run, the cleanup
    /// happens when the run ends.
    pub fn dispose(&self) {
        if self.inner.is_disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let rt = &self.inner.runtime;
        let running = rt
            .lock()
            .graph
            .reaction_flags_mut(self.inner.id)
            .is_some_and(|(_, is_running)| *is_running);
        if !running {
            let _batch = BatchGuard::new(rt);
            rt.remove_node(self.inner.id);
        }
        debug!(reaction = %self.inner.name, deferred = running, "reaction disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed.load(Ordering::SeqCst)
    }

    pub fn is_scheduled(&self) -> bool {
        self.inner
            .runtime
            .lock()
            .graph
            .reaction_flags_mut(self.inner.id)
            .is_some_and(|(is_scheduled, _)| *is_scheduled)
    }

    /// Number of tracked runs so far.
    pub fn run_count(&self) -> usize {
        self.inner.run_count.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn report_error(&self, err: ReactiveError) {
        match &self.inner.error_handler {
            Some(handler) => handler(&err, self),
            None => self.inner.runtime.report_unhandled(&err, &self.inner.name),
        }
    }
}

impl ReactiveNode for Reaction {
    fn node_id(&self) -> NodeId {
        self.inner.id
    }

    fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }
}

impl Derivation for Reaction {}

impl fmt::Debug for Reaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reaction")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("disposed", &self.is_disposed())
            .field("run_count", &self.run_count())
            .finish()
    }
}

impl Runtime {
    /// Create a reaction that tracks `view` and run it right away.
    ///
    /// `view` re-runs whenever something it read changes.
    pub fn autorun<F>(&self, view: F, options: ReactionOptions) -> Reaction
    where
        F: Fn(&Reaction) -> Result<()> + Send + Sync + 'static,
    {
        let reaction = Reaction::create(
            self,
            Box::new(move |reaction: &Reaction| {
                reaction.track(|| view(reaction));
                Ok(())
            }),
            options,
            "Autorun",
        );
        reaction.schedule();
        reaction
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{Atom, ObservableValue};
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn autorun_runs_immediately_and_on_change() {
        let rt = Runtime::new();
        let value = ObservableValue::new(&rt, 0);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let reaction = rt.autorun(
            {
                let value = value.clone();
                let seen = seen.clone();
                move |_| {
                    seen.lock().push(value.get());
                    Ok(())
                }
            },
            Default::default(),
        );
        rt.run_in_action("set", || value.set(5)).unwrap();

        assert_eq!(*seen.lock(), vec![0, 5]);
        assert_eq!(reaction.run_count(), 2);
        assert!(reaction.name().starts_with("Autorun@"));
    }

    #[test]
    fn reaction_does_not_run_until_scheduled() {
        let rt = Runtime::new();
        let calls = Arc::new(AtomicI32::new(0));
        let reaction = Reaction::new(
            &rt,
            {
                let calls = calls.clone();
                move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            ReactionOptions::named("manual"),
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        reaction.schedule();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!reaction.is_scheduled());
        // The handler never tracked anything.
        assert_eq!(reaction.run_count(), 0);
    }

    #[test]
    fn dispose_stops_the_reaction() {
        let rt = Runtime::new();
        let atom = Atom::new(&rt, "a");
        let runs = Arc::new(AtomicI32::new(0));
        let reaction = rt.autorun(
            {
                let atom = atom.clone();
                let runs = runs.clone();
                move |_| {
                    atom.report_observed();
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            Default::default(),
        );

        reaction.dispose();
        reaction.dispose();
        assert!(reaction.is_disposed());

        atom.report_changed();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        reaction.schedule();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dispose_from_inside_the_run_is_deferred() {
        let rt = Runtime::new();
        let value = ObservableValue::new(&rt, 0);
        let reaction = rt.autorun(
            {
                let value = value.clone();
                move |me| {
                    if value.get() > 0 {
                        me.dispose();
                        // Still running: edges stay until the run ends.
                        assert!(value.runtime().lock().graph.contains(me.node_id()));
                    }
                    Ok(())
                }
            },
            Default::default(),
        );

        rt.run_in_action("set", || value.set(1)).unwrap();
        assert!(reaction.is_disposed());
        assert!(!rt.has_observers(value.node_id()));
        assert_eq!(rt.node_kind(reaction.node_id()), None);
    }

    #[test]
    fn errors_go_to_the_reaction_handler() {
        let rt = Runtime::new();
        let value = ObservableValue::new(&rt, 0);
        let errors = Arc::new(Mutex::new(Vec::new()));
        let global = Arc::new(AtomicI32::new(0));
        let _global = rt.on_reaction_error({
            let global = global.clone();
            move |_, _| {
                global.fetch_add(1, Ordering::SeqCst);
            }
        });

        let _failing = rt.autorun(
            {
                let value = value.clone();
                move |_| match value.get() {
                    0 => Ok(()),
                    n => Err(ReactiveError::msg(format!("bad value {n}"))),
                }
            },
            ReactionOptions::named("failing").on_error({
                let errors = errors.clone();
                move |err, reaction| errors.lock().push(format!("{}: {err}", reaction.name()))
            }),
        );
        rt.run_in_action("set", || value.set(3)).unwrap();

        assert_eq!(*errors.lock(), vec!["failing: bad value 3".to_owned()]);
        assert_eq!(global.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn a_failing_reaction_does_not_stop_the_flush() {
        let rt = Runtime::new();
        let atom = Atom::new(&rt, "trigger");
        let failures = Arc::new(Mutex::new(Vec::new()));
        let _handler = rt.on_reaction_error({
            let failures = failures.clone();
            move |err, reaction| failures.lock().push((reaction.to_owned(), err.to_string()))
        });
        let healthy_runs = Arc::new(AtomicI32::new(0));

        let _broken = rt.autorun(
            {
                let atom = atom.clone();
                move |_| {
                    atom.report_observed();
                    Err(ReactiveError::msg("broken"))
                }
            },
            ReactionOptions::named("broken"),
        );
        let _healthy = rt.autorun(
            {
                let atom = atom.clone();
                let runs = healthy_runs.clone();
                move |_| {
                    atom.report_observed();
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            Default::default(),
        );

        atom.report_changed();
        assert_eq!(healthy_runs.load(Ordering::SeqCst), 2);
        assert_eq!(failures.lock().len(), 2);
        assert_eq!(failures.lock()[0], ("broken".to_owned(), "broken".to_owned()));
    }

    #[test]
    fn reactions_run_in_fifo_order() {
        let rt = Runtime::new();
        let atom = Atom::new(&rt, "tick");
        let order = Arc::new(Mutex::new(Vec::new()));
        let reactions: Vec<Reaction> = (0..3)
            .map(|i| {
                let atom = atom.clone();
                let order = order.clone();
                rt.autorun(
                    move |_| {
                        atom.report_observed();
                        order.lock().push(i);
                        Ok(())
                    },
                    Default::default(),
                )
            })
            .collect();

        order.lock().clear();
        atom.report_changed();
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        reactions.iter().for_each(Reaction::dispose);
    }

    #[test]
    fn self_retriggering_reaction_hits_the_ceiling() {
        let rt = Runtime::new();
        let value = ObservableValue::new(&rt, 0);
        let cycles = Arc::new(Mutex::new(Vec::new()));
        let _handler = rt.on_reaction_error({
            let cycles = cycles.clone();
            move |err, _| cycles.lock().push(err.clone())
        });

        let reaction = rt.autorun(
            {
                let value = value.clone();
                move |me| {
                    let current = value.get();
                    if current > 0 {
                        me.runtime().run_in_action("increment", || value.set(current + 1))?;
                    }
                    Ok(())
                }
            },
            ReactionOptions::named("looping"),
        );
        rt.run_in_action("kick", || value.set(1)).unwrap();

        let cycles = cycles.lock();
        assert_eq!(cycles.len(), 1);
        assert!(matches!(
            &cycles[0],
            ReactiveError::NonConvergentCycle { iterations: 100, reaction } if reaction == "looping"
        ));
        assert!(!reaction.is_scheduled());
        assert_eq!(value.get(), 100);
        drop(cycles);

        // The queue is clean: an unrelated flush does not pick it up again.
        let runs = reaction.run_count();
        rt.batch(|| {});
        assert_eq!(reaction.run_count(), runs);
        reaction.dispose();
    }
}
