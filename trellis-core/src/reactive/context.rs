//! Reactive Context
//!
//! Scoped changes to the ambient state of a [`Runtime`]: which derivation
//! is tracking reads, whether state may change or be read, and how deep the
//! current batch is.
//!
//! # Implementation
//!
//! Every change is made by a guard that restores the previous value when
//! dropped. The engine's bookkeeping therefore stays consistent even when
//! user code panics halfway through a derivation or an action: the stack
//! unwinds through the guards in reverse order, exactly as a normal return
//! would.

use tracing::trace;

use super::runtime::Runtime;
use crate::graph::NodeId;

/// Guard that keeps a batch open until dropped.
pub struct BatchGuard<'a> {
    runtime: &'a Runtime,
}

impl<'a> BatchGuard<'a> {
    /// Open a (possibly nested) batch.
    pub fn new(runtime: &'a Runtime) -> Self {
        runtime.start_batch();
        Self { runtime }
    }
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        self.runtime.end_batch();
    }
}

/// Guard for a tracked run of a derivation.
///
/// While active, reads are reported to `derivation` and a batch is open,
/// so nothing flushes in the middle of a run. Dropping the guard restores
/// the previous tracking derivation, binds the reads collected during the
/// run and then closes the batch, so dependencies dropped by the rebind
/// become unobserved right away when the run was outermost.
pub(crate) struct TrackingScope<'a> {
    runtime: &'a Runtime,
    derivation: NodeId,
    prev_tracking: Option<NodeId>,
    prev_allow_state_reads: bool,
}

impl<'a> TrackingScope<'a> {
    pub fn enter(runtime: &'a Runtime, derivation: NodeId) -> Self {
        let mut state = runtime.lock();
        let prev_allow_state_reads = std::mem::replace(&mut state.allow_state_reads, true);
        state.run_id += 1;
        let run_id = state.run_id;
        state.graph.begin_tracking(derivation, run_id);
        let prev_tracking = state.tracking.replace(derivation);
        state.in_batch += 1;
        trace!(derivation = %derivation, run_id, "tracking started");

        Self {
            runtime,
            derivation,
            prev_tracking,
            prev_allow_state_reads,
        }
    }
}

impl Drop for TrackingScope<'_> {
    fn drop(&mut self) {
        let mut state = self.runtime.lock();
        debug_assert_eq!(
            state.tracking,
            Some(self.derivation),
            "TrackingScope mismatch: expected {:?}, got {:?}",
            self.derivation,
            state.tracking
        );
        state.tracking = self.prev_tracking;
        let bound = state.graph.bind_dependencies(self.derivation);
        state.allow_state_reads = self.prev_allow_state_reads;

        if bound == 0 {
            let required = state.config.reaction_requires_observable
                || state
                    .graph
                    .get(self.derivation)
                    .and_then(|node| node.derivation.as_ref())
                    .is_some_and(|d| d.requires_observable);
            if required {
                tracing::warn!(
                    derivation = %state.graph.name(self.derivation),
                    "derivation is created/updated without reading any observable value"
                );
            }
        }
        drop(state);
        self.runtime.end_batch();
    }
}

/// Guard that suspends dependency tracking.
pub(crate) struct Untracked<'a> {
    runtime: &'a Runtime,
    prev: Option<NodeId>,
}

impl<'a> Untracked<'a> {
    pub fn new(runtime: &'a Runtime) -> Self {
        let prev = runtime.lock().tracking.take();
        Self { runtime, prev }
    }
}

impl Drop for Untracked<'_> {
    fn drop(&mut self) {
        self.runtime.lock().tracking = self.prev;
    }
}

/// Guard that overrides the "state changes allowed" flag.
pub(crate) struct AllowStateChanges<'a> {
    runtime: &'a Runtime,
    prev: bool,
}

impl<'a> AllowStateChanges<'a> {
    pub fn new(runtime: &'a Runtime, allow: bool) -> Self {
        let prev = std::mem::replace(&mut runtime.lock().allow_state_changes, allow);
        Self { runtime, prev }
    }
}

impl Drop for AllowStateChanges<'_> {
    fn drop(&mut self) {
        self.runtime.lock().allow_state_changes = self.prev;
    }
}

/// Guard that overrides the "state reads allowed" flag.
pub(crate) struct AllowStateReads<'a> {
    runtime: &'a Runtime,
    prev: bool,
}

impl<'a> AllowStateReads<'a> {
    pub fn new(runtime: &'a Runtime, allow: bool) -> Self {
        let prev = std::mem::replace(&mut runtime.lock().allow_state_reads, allow);
        Self { runtime, prev }
    }
}

impl Drop for AllowStateReads<'_> {
    fn drop(&mut self) {
        self.runtime.lock().allow_state_reads = self.prev;
    }
}

/// Guard for the evaluation of a computed value: forbids state changes
/// and counts the nesting depth of computations.
pub(crate) struct ComputationScope<'a> {
    runtime: &'a Runtime,
    prev_allow_state_changes: bool,
}

impl<'a> ComputationScope<'a> {
    pub fn enter(runtime: &'a Runtime) -> Self {
        let mut state = runtime.lock();
        state.computation_depth += 1;
        let prev_allow_state_changes = std::mem::replace(&mut state.allow_state_changes, false);
        Self {
            runtime,
            prev_allow_state_changes,
        }
    }
}

impl Drop for ComputationScope<'_> {
    fn drop(&mut self) {
        let mut state = self.runtime.lock();
        state.allow_state_changes = self.prev_allow_state_changes;
        state.computation_depth -= 1;
    }
}

/// Guard for the execution of an action.
///
/// On entry: opens a batch, and unless the action may run as part of the
/// current derivation, suspends tracking and allows state changes. On exit
/// the flags are restored, the batch is closed (which flushes reactions at
/// the outermost level) and only then is tracking restored.
pub(crate) struct ActionScope<'a> {
    runtime: &'a Runtime,
    name: &'a str,
    run_as_action: bool,
    prev_derivation: Option<NodeId>,
    prev_allow_state_changes: bool,
    prev_allow_state_reads: bool,
    failed: bool,
}

impl<'a> ActionScope<'a> {
    pub fn start(runtime: &'a Runtime, name: &'a str, can_run_as_derivation: bool) -> Self {
        let mut state = runtime.lock();
        let prev_derivation = state.tracking;
        let run_as_action = !can_run_as_derivation || prev_derivation.is_none();
        state.in_batch += 1;

        let mut prev_allow_state_changes = state.allow_state_changes;
        if run_as_action {
            state.tracking = None;
            prev_allow_state_changes = std::mem::replace(&mut state.allow_state_changes, true);
        }
        let prev_allow_state_reads = std::mem::replace(&mut state.allow_state_reads, true);
        trace!(action = name, depth = state.in_batch, "action started");

        Self {
            runtime,
            name,
            run_as_action,
            prev_derivation,
            prev_allow_state_changes,
            prev_allow_state_reads,
            failed: false,
        }
    }

    /// Mark the action as failed: errors of reactions it triggers are
    /// reported as warnings, since the action is the root cause.
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }
}

impl Drop for ActionScope<'_> {
    fn drop(&mut self) {
        let failed = self.failed || std::thread::panicking();
        {
            let mut state = self.runtime.lock();
            if failed {
                state.suppress_reaction_errors = true;
            }
            state.allow_state_changes = self.prev_allow_state_changes;
            state.allow_state_reads = self.prev_allow_state_reads;
        }

        self.runtime.end_batch();

        let mut state = self.runtime.lock();
        if self.run_as_action {
            state.tracking = self.prev_derivation;
        }
        state.suppress_reaction_errors = false;
        trace!(action = self.name, failed, "action ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_guard_nests() {
        let rt = Runtime::new();
        assert!(!rt.in_batch());
        {
            let _outer = BatchGuard::new(&rt);
            {
                let _inner = BatchGuard::new(&rt);
                assert_eq!(rt.lock().in_batch, 2);
            }
            assert_eq!(rt.lock().in_batch, 1);
        }
        assert!(!rt.in_batch());
    }

    #[test]
    fn action_scope_restores_flags() {
        let rt = Runtime::new();
        let before = rt.lock().allow_state_changes;
        {
            let _action = ActionScope::start(&rt, "test", false);
            assert!(rt.lock().allow_state_changes);
            assert!(rt.in_batch());
        }
        assert_eq!(rt.lock().allow_state_changes, before);
        assert!(!rt.in_batch());
    }

    #[test]
    fn computation_scope_forbids_changes() {
        let rt = Runtime::new();
        {
            let _action = ActionScope::start(&rt, "outer", false);
            {
                let _computation = ComputationScope::enter(&rt);
                assert!(!rt.lock().allow_state_changes);
                assert_eq!(rt.lock().computation_depth, 1);
            }
            assert!(rt.lock().allow_state_changes);
        }
        assert_eq!(rt.lock().computation_depth, 0);
    }

    #[test]
    fn guards_unwind_on_panic() {
        let rt = Runtime::new();
        let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _action = ActionScope::start(&rt, "boom", false);
            let _computation = ComputationScope::enter(&rt);
            panic!("boom");
        }));
        assert!(caught.is_err());

        let state = rt.lock();
        assert_eq!(state.in_batch, 0);
        assert_eq!(state.computation_depth, 0);
        assert!(!state.suppress_reaction_errors);
        assert!(state.tracking.is_none());
    }
}
