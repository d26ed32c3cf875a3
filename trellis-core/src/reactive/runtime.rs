//! Reactive Runtime
//!
//! The runtime is the central coordinator that connects observables,
//! computed values and reactions. It owns the dependency graph, the batch
//! depth, and the ambient "who is reading" state, and it drains the queue
//! of stale reactions when the outermost batch ends.
//!
//! # How It Works
//!
//! 1. When an observable is read inside a tracked run, the runtime records
//!    the read against the running derivation.
//!
//! 2. When the run finishes, the binder reconciles those reads with the
//!    derivation's previous dependencies.
//!
//! 3. When an observable changes, the runtime:
//!    a. Marks its observers stale
//!    b. Marks the observers of stale computeds possibly stale
//!    c. Queues the affected reactions
//!    d. Runs them once the outermost batch ends
//!
//! # Thread Safety
//!
//! A [`Runtime`] is a cheap handle to shared state behind a single
//! `parking_lot::Mutex`. The lock is only held for bookkeeping: user code
//! (getters, effects, hooks, comparers, listeners) always runs with the lock
//! released, so that code can freely read and write other observables of the
//! same runtime. The engine assumes one logical thread of control per
//! runtime; separate runtimes are fully independent.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, warn};

use super::context::{AllowStateReads, BatchGuard, Untracked};
use super::disposer::Disposer;
use crate::config::{EnforceActions, RuntimeConfig};
use crate::error::{MutationViolation, ReactiveError, Result};
use crate::graph::{ComputedCell, DerivationState, Graph, Hook, Node, NodeId, NodeKind, ReactionCell};

/// Handler for reaction errors nobody else handled.
///
/// Receives the error and the name of the failing reaction.
pub type ReactionErrorHandler = Arc<dyn Fn(&ReactiveError, &str) + Send + Sync>;

/// Wraps the reaction flush loop.
///
/// The scheduler receives the flush loop and decides when (and whether) to
/// call it. Reactions it does not flush stay queued until the next
/// outermost batch end.
pub type ReactionScheduler = Arc<dyn Fn(&dyn Fn()) + Send + Sync>;

/// Mutable state of a runtime. Only touched with the lock held.
pub(crate) struct State {
    pub graph: Graph,
    pub config: RuntimeConfig,

    /// Depth of nested batches.
    pub in_batch: u32,

    /// Derivation whose reads are currently being recorded.
    pub tracking: Option<NodeId>,

    /// Reaction or keep-alive computed on whose behalf the current code
    /// runs. Reads only count as "being observed" inside such a context.
    pub tracking_context: Option<NodeId>,

    pub run_id: u64,
    pub is_running_reactions: bool,
    pub allow_state_changes: bool,
    pub allow_state_reads: bool,

    /// Number of computed evaluations on the stack.
    pub computation_depth: u32,

    /// Set while a failed action closes its batch.
    pub suppress_reaction_errors: bool,

    pub error_handlers: Vec<(u64, ReactionErrorHandler)>,
    pub next_listener_id: u64,

    pub reaction_scheduler: Option<ReactionScheduler>,
}

impl State {
    fn new(config: RuntimeConfig) -> Self {
        Self {
            graph: Graph::new(),
            allow_state_reads: !config.observable_requires_reaction,
            config,
            in_batch: 0,
            tracking: None,
            tracking_context: None,
            run_id: 0,
            is_running_reactions: false,
            allow_state_changes: false,
            computation_depth: 0,
            suppress_reaction_errors: false,
            error_handlers: Vec::new(),
            next_listener_id: 0,
            reaction_scheduler: None,
        }
    }

    pub fn next_listener_id(&mut self) -> u64 {
        self.next_listener_id += 1;
        self.next_listener_id
    }
}

struct RuntimeInner {
    state: Mutex<State>,
}

/// Handle to an isolated reactive world.
///
/// Cloning is cheap; all clones share the same graph.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Runtime")
            .field("nodes", &state.graph.len())
            .field("in_batch", &state.in_batch)
            .field("pending_reactions", &state.graph.pending_reactions.len())
            .finish()
    }
}

impl Runtime {
    /// Create a runtime with the default configuration.
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                state: Mutex::new(State::new(config)),
            }),
        }
    }

    /// Replace the configuration.
    pub fn configure(&self, config: RuntimeConfig) {
        let mut state = self.lock();
        state.allow_state_reads = !config.observable_requires_reaction;
        state.config = config;
    }

    /// Current configuration.
    pub fn config(&self) -> RuntimeConfig {
        self.lock().config.clone()
    }

    /// Whether two handles refer to the same runtime.
    pub fn ptr_eq(&self, other: &Runtime) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock()
    }

    // ------------------------------------------------------------------
    // Node lifecycle
    // ------------------------------------------------------------------

    pub(crate) fn create_atom(&self, name: Option<String>, prefix: &str) -> NodeId {
        let mut state = self.lock();
        let id = state.graph.allocate_id();
        let name = name.unwrap_or_else(|| format!("{prefix}@{}", id.raw()));
        state.graph.insert(Node::atom(id, name))
    }

    pub(crate) fn create_computed(
        &self,
        name: Option<String>,
        keep_alive: bool,
        cell: std::sync::Weak<dyn ComputedCell>,
    ) -> NodeId {
        let mut state = self.lock();
        let id = state.graph.allocate_id();
        let name = name.unwrap_or_else(|| format!("ComputedValue@{}", id.raw()));
        state.graph.insert(Node::computed(id, name, cell, keep_alive))
    }

    pub(crate) fn create_reaction(
        &self,
        id: NodeId,
        name: String,
        cell: Arc<dyn ReactionCell>,
        requires_observable: bool,
    ) -> NodeId {
        self.lock()
            .graph
            .insert(Node::reaction(id, name, cell, requires_observable))
    }

    pub(crate) fn allocate_id(&self) -> NodeId {
        self.lock().graph.allocate_id()
    }

    /// Remove a node. The node (and whatever user closures it owns) is
    /// dropped after the lock is released.
    pub(crate) fn remove_node(&self, id: NodeId) {
        let removed = self.lock().graph.remove(id);
        drop(removed);
    }

    pub(crate) fn node_name(&self, id: NodeId) -> String {
        self.lock().graph.name(id)
    }

    // ------------------------------------------------------------------
    // Batches
    // ------------------------------------------------------------------

    /// Open a batch. Reactions only run once every open batch is closed.
    pub fn start_batch(&self) {
        self.lock().in_batch += 1;
    }

    /// Close a batch. Closing the outermost batch runs the pending
    /// reactions and then the pending unobservations.
    pub fn end_batch(&self) {
        let outermost = {
            let mut state = self.lock();
            debug_assert!(state.in_batch > 0, "end_batch without start_batch");
            state.in_batch = state.in_batch.saturating_sub(1);
            state.in_batch == 0
        };
        if !outermost || std::thread::panicking() {
            return;
        }
        self.run_reactions();
        self.process_pending_unobservations();
    }

    /// Run `f` inside a batch: every change it makes is propagated, but
    /// reactions only run after it returns.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        let _batch = BatchGuard::new(self);
        f()
    }

    /// Whether a batch is open.
    pub fn in_batch(&self) -> bool {
        self.lock().in_batch > 0
    }

    /// Whether a derivation is currently recording reads.
    pub fn is_tracking(&self) -> bool {
        self.lock().tracking.is_some()
    }

    /// Run `f` without recording any reads.
    pub fn untracked<R>(&self, f: impl FnOnce() -> R) -> R {
        let _untracked = Untracked::new(self);
        f()
    }

    fn process_pending_unobservations(&self) {
        loop {
            let work = {
                let mut state = self.lock();
                if state.in_batch > 0 || state.graph.pending_unobservations.is_empty() {
                    return;
                }
                state.graph.process_unobservations()
            };
            for hook in &work.hooks {
                hook();
            }
            for computed in &work.suspended {
                computed.clear_cache();
            }
            if !work.suspended.is_empty() {
                debug!(count = work.suspended.len(), "suspended computed values");
            }
        }
    }

    // ------------------------------------------------------------------
    // Reaction flush loop
    // ------------------------------------------------------------------

    /// Drain the pending reactions to a fixed point, through the reaction
    /// scheduler when one is installed.
    pub(crate) fn run_reactions(&self) {
        let scheduler = {
            let state = self.lock();
            if state.in_batch > 0
                || state.computation_depth > 0
                || state.is_running_reactions
                || state.graph.pending_reactions.is_empty()
            {
                return;
            }
            state.reaction_scheduler.clone()
        };
        match scheduler {
            Some(scheduler) => scheduler(&|| self.flush_reactions()),
            None => self.flush_reactions(),
        }
    }

    fn flush_reactions(&self) {
        {
            let mut state = self.lock();
            if state.is_running_reactions || state.graph.pending_reactions.is_empty() {
                return;
            }
            state.is_running_reactions = true;
        }
        let _running = RunningReactions(self);

        let mut iterations = 0;
        loop {
            let round = {
                let mut state = self.lock();
                if state.graph.pending_reactions.is_empty() {
                    break;
                }
                iterations += 1;
                if iterations >= state.config.max_reaction_iterations {
                    let (culprit, cycle) = Self::abort_cycle(&mut state, iterations);
                    drop(state);
                    self.report_unhandled(&cycle, &culprit);
                    break;
                }
                state.graph.pending_reactions.len()
            };
            debug!(iteration = iterations, reactions = round, "running reactions");
            // Reactions leave the queue one at a time: if one panics, the
            // rest stay queued for the next outermost batch end.
            for _ in 0..round {
                let reaction = {
                    let mut state = self.lock();
                    let Some(id) = state.graph.pending_reactions.pop_front() else {
                        break;
                    };
                    state.graph.reaction_cell(id)
                };
                if let Some(reaction) = reaction {
                    reaction.run_reaction();
                }
            }
        }
    }

    /// Install a reaction scheduler.
    ///
    /// Schedulers compose: the new one receives a flush loop that already
    /// goes through the previously installed scheduler.
    pub fn set_reaction_scheduler<F>(&self, scheduler: F)
    where
        F: Fn(&dyn Fn()) + Send + Sync + 'static,
    {
        let mut state = self.lock();
        let composed: ReactionScheduler = match state.reaction_scheduler.take() {
            Some(base) => Arc::new(move |flush: &dyn Fn()| scheduler(&|| base(flush))),
            None => Arc::new(scheduler),
        };
        state.reaction_scheduler = Some(composed);
    }

    /// Clear the queue after too many flush rounds. Returns the name of
    /// the first reaction still pending and the error to report.
    fn abort_cycle(state: &mut State, iterations: usize) -> (String, ReactiveError) {
        let culprit = state
            .graph
            .pending_reactions
            .front()
            .map(|id| state.graph.name(*id))
            .unwrap_or_default();
        let pending: Vec<NodeId> = state.graph.pending_reactions.drain(..).collect();
        for id in pending {
            if let Some((is_scheduled, _)) = state.graph.reaction_flags_mut(id) {
                *is_scheduled = false;
            }
        }
        let cycle = ReactiveError::NonConvergentCycle {
            iterations,
            reaction: culprit.clone(),
        };
        (culprit, cycle)
    }

    // ------------------------------------------------------------------
    // Reads, writes and tracking
    // ------------------------------------------------------------------

    /// Report a read of `id`. Returns whether a dependency will be bound.
    pub(crate) fn report_observed(&self, id: NodeId) -> bool {
        let observed = {
            let mut state = self.lock();
            if !state.allow_state_reads && state.tracking.is_none() {
                warn!(
                    observable = %state.graph.name(id),
                    "observable is being read outside a reactive context"
                );
            }
            let tracking = state.tracking;
            let in_batch = state.in_batch > 0;
            let has_context = state.tracking_context.is_some();
            state.graph.report_observed(id, tracking, in_batch, has_context)
        };
        for hook in &observed.hooks {
            hook();
        }
        observed.tracked
    }

    /// Report a change of `id` and propagate it to the observers.
    pub(crate) fn report_changed(&self, id: NodeId) {
        let _batch = BatchGuard::new(self);
        self.lock().graph.propagate_changed(id);
    }

    /// Check that `id` may be written right now.
    pub(crate) fn check_state_modification(&self, id: NodeId) -> Result<()> {
        let state = self.lock();
        // Actions started from a getter do not lift this.
        if state.computation_depth > 0 {
            return Err(ReactiveError::IllegalMutation {
                name: state.graph.name(id),
                reason: MutationViolation::InsideComputed,
            });
        }
        if state.allow_state_changes {
            return Ok(());
        }
        let reason = match state.config.enforce_actions {
            EnforceActions::Never => return Ok(()),
            EnforceActions::Observed if state.graph.observer_count(id) > 0 => {
                MutationViolation::ObservedOutsideAction
            }
            EnforceActions::Observed => return Ok(()),
            EnforceActions::Always => MutationViolation::OutsideAction,
        };
        let name = state.graph.name(id);
        if state.config.strict {
            return Err(ReactiveError::IllegalMutation { name, reason });
        }
        warn!(observable = %name, "{reason}");
        Ok(())
    }

    /// Whether a derivation has to run again.
    ///
    /// A possibly stale derivation refreshes its computed dependencies one
    /// by one, in the order they were first read. The first one whose value
    /// really changed confirms the staleness; if none did, the derivation
    /// is up to date again without running.
    pub(crate) fn should_compute(&self, id: NodeId) -> bool {
        let observing = {
            let state = self.lock();
            match state.graph.state_of(id) {
                Some(DerivationState::UpToDate) => return false,
                Some(DerivationState::PossiblyStale) => state.graph.observing_of(id),
                _ => return true,
            }
        };

        let _reads = AllowStateReads::new(self, true);
        let _untracked = Untracked::new(self);
        for dep in observing {
            let cell = {
                let state = self.lock();
                match state.graph.get(dep).map(Node::kind) {
                    Some(NodeKind::Computed) => state.graph.computed_cell(dep),
                    _ => continue,
                }
            };
            let Some(cell) = cell else {
                return true;
            };
            if cell.refresh().is_err() {
                // A failure is always a change.
                return true;
            }
            drop(cell);
            if self.lock().graph.state_of(id) == Some(DerivationState::Stale) {
                return true;
            }
        }

        self.lock().graph.change_dependencies_state_to_0(id);
        false
    }

    /// Run `f` as a tracked run of `derivation` and bind what it reads.
    pub(crate) fn track<R>(&self, derivation: NodeId, f: impl FnOnce() -> R) -> R {
        let _scope = super::context::TrackingScope::enter(self, derivation);
        f()
    }

    /// Run `f` with `context` as the tracking context.
    pub(crate) fn with_tracking_context<R>(&self, context: Option<NodeId>, f: impl FnOnce() -> R) -> R {
        let prev = std::mem::replace(&mut self.lock().tracking_context, context);
        let _restore = RestoreContext { runtime: self, prev };
        f()
    }

    /// Run `f` with state changes allowed (or forbidden).
    pub fn allow_state_changes<R>(&self, allow: bool, f: impl FnOnce() -> R) -> R {
        let _allow = super::context::AllowStateChanges::new(self, allow);
        f()
    }

    // ------------------------------------------------------------------
    // Errors
    // ------------------------------------------------------------------

    /// Register a handler for reaction errors that no reaction-level
    /// handler took care of.
    pub fn on_reaction_error<F>(&self, handler: F) -> Disposer
    where
        F: Fn(&ReactiveError, &str) + Send + Sync + 'static,
    {
        let id = {
            let mut state = self.lock();
            let id = state.next_listener_id();
            state.error_handlers.push((id, Arc::new(handler)));
            id
        };
        let runtime = self.clone();
        Disposer::new(move || {
            let removed = {
                let mut state = runtime.lock();
                let index = state.error_handlers.iter().position(|(key, _)| *key == id);
                index.map(|index| state.error_handlers.remove(index))
            };
            drop(removed);
        })
    }

    /// Log an unhandled reaction error and hand it to the global handlers.
    pub(crate) fn report_unhandled(&self, err: &ReactiveError, reaction: &str) {
        let (handlers, suppressed) = {
            let state = self.lock();
            let handlers: Vec<ReactionErrorHandler> =
                state.error_handlers.iter().map(|(_, h)| Arc::clone(h)).collect();
            (handlers, state.suppress_reaction_errors)
        };
        if suppressed {
            warn!(reaction, error = %err, "reaction failed after its action failed");
        } else {
            error!(reaction, error = %err, "uncaught error in reaction");
        }
        for handler in handlers {
            handler(err, reaction);
        }
    }

    // ------------------------------------------------------------------
    // Hooks
    // ------------------------------------------------------------------

    pub(crate) fn add_hook(&self, id: NodeId, hook: Hook, observed: bool) -> Disposer {
        let key = {
            let mut state = self.lock();
            let key = state.next_listener_id();
            if let Some(side) = state.graph.observable_mut(id) {
                if observed {
                    side.on_become_observed.push((key, hook));
                } else {
                    side.on_become_unobserved.push((key, hook));
                }
            }
            key
        };
        let runtime = self.clone();
        Disposer::new(move || {
            let removed = {
                let mut state = runtime.lock();
                state.graph.observable_mut(id).and_then(|side| {
                    let hooks = if observed {
                        &mut side.on_become_observed
                    } else {
                        &mut side.on_become_unobserved
                    };
                    let index = hooks.iter().position(|(k, _)| *k == key)?;
                    Some(hooks.remove(index))
                })
            };
            drop(removed);
        })
    }
}

/// Resets the running-reactions flag, also when a reaction panics.
struct RunningReactions<'a>(&'a Runtime);

impl Drop for RunningReactions<'_> {
    fn drop(&mut self) {
        self.0.lock().is_running_reactions = false;
    }
}

struct RestoreContext<'a> {
    runtime: &'a Runtime,
    prev: Option<NodeId>,
}

impl Drop for RestoreContext<'_> {
    fn drop(&mut self) {
        self.runtime.lock().tracking_context = self.prev;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{Atom, ObservableValue};
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn runtimes_are_isolated() {
        let a = Runtime::new();
        let b = Runtime::new();
        let _x = ObservableValue::new(&a, 1);
        assert_eq!(a.lock().graph.len(), 1);
        assert_eq!(b.lock().graph.len(), 0);
        assert!(a.ptr_eq(&a.clone()));
        assert!(!a.ptr_eq(&b));
    }

    #[test]
    fn strict_mode_rejects_observed_writes_outside_actions() {
        let rt = Runtime::with_config(RuntimeConfig {
            strict: true,
            ..Default::default()
        });
        let value = ObservableValue::new(&rt, 1);

        // Unobserved: allowed.
        assert!(value.set(2).is_ok());

        let _observer = rt.autorun(
            {
                let value = value.clone();
                move |_| {
                    value.get();
                    Ok(())
                }
            },
            Default::default(),
        );
        let err = value.set(3).unwrap_err();
        assert!(matches!(
            err,
            ReactiveError::IllegalMutation {
                reason: MutationViolation::ObservedOutsideAction,
                ..
            }
        ));

        assert!(rt.run_in_action("write", || value.set(3)).is_ok());
        assert_eq!(value.get(), 3);
    }

    #[test]
    fn strict_always_rejects_every_write_outside_actions() {
        let rt = Runtime::with_config(RuntimeConfig::strict());
        let value = ObservableValue::new(&rt, 1);
        assert!(matches!(
            value.set(2),
            Err(ReactiveError::IllegalMutation {
                reason: MutationViolation::OutsideAction,
                ..
            })
        ));
        assert!(rt.run_in_action("write", || value.set(2)).is_ok());
        assert_eq!(value.get(), 2);
    }

    #[test]
    fn enforce_always_warns_without_strict() {
        let rt = Runtime::with_config(RuntimeConfig {
            enforce_actions: EnforceActions::Always,
            ..Default::default()
        });
        let value = ObservableValue::new(&rt, 1);
        assert!(value.set(2).is_ok());
        assert_eq!(value.get(), 2);
    }

    #[test]
    fn global_error_handlers_can_be_disposed() {
        let rt = Runtime::new();
        let calls = Arc::new(AtomicI32::new(0));
        let disposer = rt.on_reaction_error({
            let calls = calls.clone();
            move |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        });

        rt.report_unhandled(&ReactiveError::msg("first"), "r");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        disposer.dispose();
        rt.report_unhandled(&ReactiveError::msg("second"), "r");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn batch_defers_reactions() {
        let rt = Runtime::new();
        let atom = Atom::new(&rt, "tick");
        let runs = Arc::new(AtomicI32::new(0));
        let _reaction = rt.autorun(
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
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        rt.batch(|| {
            atom.report_changed();
            atom.report_changed();
            assert_eq!(runs.load(Ordering::SeqCst), 1);
        });
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    fn ticking(rt: &Runtime) -> (Atom, Arc<AtomicI32>, crate::reactive::Reaction) {
        let atom = Atom::new(rt, "tick");
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
        (atom, runs, reaction)
    }

    #[test]
    fn scheduler_wraps_the_flush() {
        let rt = Runtime::new();
        let (atom, runs, _reaction) = ticking(&rt);
        let flushes = Arc::new(AtomicI32::new(0));
        rt.set_reaction_scheduler({
            let flushes = flushes.clone();
            move |flush| {
                flushes.fetch_add(1, Ordering::SeqCst);
                flush();
            }
        });

        atom.report_changed();
        assert_eq!(flushes.load(Ordering::SeqCst), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        // Nothing pending, nothing scheduled.
        rt.batch(|| {});
        assert_eq!(flushes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn scheduler_can_hold_reactions_back() {
        let rt = Runtime::new();
        let (atom, runs, reaction) = ticking(&rt);
        let paused = Arc::new(std::sync::atomic::AtomicBool::new(true));
        rt.set_reaction_scheduler({
            let paused = paused.clone();
            move |flush| {
                if !paused.load(Ordering::SeqCst) {
                    flush();
                }
            }
        });

        atom.report_changed();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(reaction.is_scheduled());

        paused.store(false, Ordering::SeqCst);
        rt.batch(|| {});
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(!reaction.is_scheduled());
    }

    #[test]
    fn schedulers_compose() {
        let rt = Runtime::new();
        let (atom, runs, _reaction) = ticking(&rt);
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for label in ["first", "second"] {
            let order = order.clone();
            rt.set_reaction_scheduler(move |flush| {
                order.lock().push(label);
                flush();
            });
        }

        atom.report_changed();
        assert_eq!(*order.lock(), vec!["second", "first"]);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
