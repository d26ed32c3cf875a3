//! Staleness Propagation
//!
//! Writes push staleness down the graph; reads report edges up to the
//! derivation that is currently running.
//!
//! # States
//!
//! ```text
//! NOT_TRACKING -> UP_TO_DATE -> POSSIBLY_STALE -> STALE -> UP_TO_DATE ...
//! ```
//!
//! A changed source marks its observers `Stale`. A computed that becomes
//! stale does not recompute; it marks its own observers `PossiblyStale`.
//! Only when the computed is read again, and its value turns out to be
//! different, are those observers upgraded to `Stale`
//! ([`Graph::propagate_change_confirmed`]). If the value is equal they go
//! back to `UpToDate` without running.
//!
//! Every function first checks the observable's `lowest_observer_state`:
//! if all observers are already at least as stale as the target state,
//! there is nothing to do.

use tracing::trace;

use super::{DerivationState, Graph, NodeId, Observed};

impl Graph {
    /// Record that `id` was read.
    ///
    /// Inside a tracked run the read is appended to the running derivation's
    /// `new_observing` list, at most once per run. Outside any derivation,
    /// an unobserved node read during a batch is queued for unobservation so
    /// a computed evaluated only for this batch gets suspended at its end.
    pub(crate) fn report_observed(
        &mut self,
        id: NodeId,
        tracking: Option<NodeId>,
        in_batch: bool,
        has_tracking_context: bool,
    ) -> Observed {
        let Some(derivation) = tracking else {
            if in_batch && self.observer_count(id) == 0 {
                self.queue_for_unobservation(id);
            }
            return Observed::default();
        };

        let Some(run_id) = self.derivation_mut(derivation).map(|d| d.run_id) else {
            return Observed::default();
        };
        let Some(side) = self.observable_mut(id) else {
            return Observed::default();
        };

        let mut observed = Observed {
            tracked: true,
            hooks: Vec::new(),
        };
        if side.last_accessed_by == run_id {
            return observed;
        }
        side.last_accessed_by = run_id;
        if !side.is_being_observed && has_tracking_context {
            side.is_being_observed = true;
            observed.hooks = side
                .on_become_observed
                .iter()
                .map(|(_, hook)| hook.clone())
                .collect();
        }
        if let Some(running) = self.derivation_mut(derivation) {
            running.new_observing.push(id);
        }
        observed
    }

    /// A source changed: every observer is now stale.
    pub(crate) fn propagate_changed(&mut self, id: NodeId) {
        let Some(side) = self.observable_mut(id) else {
            return;
        };
        if side.lowest_observer_state == DerivationState::Stale {
            return;
        }
        side.lowest_observer_state = DerivationState::Stale;

        trace!(node = %id, "propagating change");
        for observer in self.observers_of(id) {
            if self.state_of(observer) == Some(DerivationState::UpToDate) {
                self.on_become_stale(observer);
            }
            self.set_state(observer, DerivationState::Stale);
        }
    }

    /// A computed recomputed and its value really changed: observers that
    /// were only possibly stale are now stale.
    pub(crate) fn propagate_change_confirmed(&mut self, id: NodeId) {
        let Some(side) = self.observable_mut(id) else {
            return;
        };
        if side.lowest_observer_state == DerivationState::Stale {
            return;
        }
        side.lowest_observer_state = DerivationState::Stale;

        trace!(node = %id, "confirming change");
        let mut lowest = DerivationState::Stale;
        for observer in self.observers_of(id) {
            match self.state_of(observer) {
                Some(DerivationState::PossiblyStale) => {
                    self.set_state(observer, DerivationState::Stale);
                }
                // An observer that attached during this very run.
                Some(DerivationState::UpToDate) => lowest = DerivationState::UpToDate,
                _ => {}
            }
        }
        if let Some(side) = self.observable_mut(id) {
            side.lowest_observer_state = lowest;
        }
    }

    /// A dependency of a computed changed: the computed's observers might
    /// need to run, pending its re-evaluation.
    pub(crate) fn propagate_maybe_changed(&mut self, id: NodeId) {
        let Some(side) = self.observable_mut(id) else {
            return;
        };
        if side.lowest_observer_state != DerivationState::UpToDate {
            return;
        }
        side.lowest_observer_state = DerivationState::PossiblyStale;

        trace!(node = %id, "propagating possible change");
        for observer in self.observers_of(id) {
            if self.state_of(observer) == Some(DerivationState::UpToDate) {
                self.set_state(observer, DerivationState::PossiblyStale);
                self.on_become_stale(observer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::tests::{atom, reaction};
    use super::super::{ComputedCell, Node};
    use super::*;
    use crate::error::Result;

    struct NoopComputed;

    impl ComputedCell for NoopComputed {
        fn refresh(&self) -> Result<()> {
            Ok(())
        }

        fn clear_cache(&self) {}
    }

    fn computed(graph: &mut Graph, name: &str, cell: &Arc<NoopComputed>) -> NodeId {
        let id = graph.allocate_id();
        let weak: std::sync::Weak<dyn ComputedCell> = Arc::downgrade(cell) as _;
        graph.insert(Node::computed(id, name.into(), weak, false))
    }

    fn bind(graph: &mut Graph, dep: NodeId, derivation: NodeId) {
        graph.derivation_mut(derivation).unwrap().observing.push(dep);
        graph.add_observer(dep, derivation);
    }

    #[test]
    fn change_schedules_up_to_date_reactions_once() {
        let mut graph = Graph::new();
        let a = atom(&mut graph, "a");
        let r = reaction(&mut graph, "r");
        graph.set_state(r, DerivationState::UpToDate);
        bind(&mut graph, a, r);

        graph.propagate_changed(a);
        assert_eq!(graph.state_of(r), Some(DerivationState::Stale));
        assert_eq!(graph.pending_reactions.len(), 1);

        // Already stale: short-circuits.
        graph.propagate_changed(a);
        assert_eq!(graph.pending_reactions.len(), 1);
    }

    #[test]
    fn computed_passes_possibly_stale_downstream() {
        let cell = Arc::new(NoopComputed);
        let mut graph = Graph::new();
        let a = atom(&mut graph, "a");
        let c = computed(&mut graph, "c", &cell);
        let r = reaction(&mut graph, "r");
        graph.set_state(c, DerivationState::UpToDate);
        graph.set_state(r, DerivationState::UpToDate);
        bind(&mut graph, a, c);
        bind(&mut graph, c, r);

        graph.propagate_changed(a);
        assert_eq!(graph.state_of(c), Some(DerivationState::Stale));
        assert_eq!(graph.state_of(r), Some(DerivationState::PossiblyStale));
        assert_eq!(graph.pending_reactions.len(), 1);

        graph.propagate_change_confirmed(c);
        assert_eq!(graph.state_of(r), Some(DerivationState::Stale));
    }

    #[test]
    fn report_observed_dedups_within_a_run() {
        let mut graph = Graph::new();
        let a = atom(&mut graph, "a");
        let r = reaction(&mut graph, "r");
        graph.derivation_mut(r).unwrap().run_id = 7;

        assert!(graph.report_observed(a, Some(r), false, true).tracked);
        assert!(graph.report_observed(a, Some(r), false, true).tracked);
        assert_eq!(graph.derivation_mut(r).unwrap().new_observing, vec![a]);
    }

    #[test]
    fn untracked_read_in_batch_queues_unobservation() {
        let mut graph = Graph::new();
        let a = atom(&mut graph, "a");

        assert!(!graph.report_observed(a, None, false, false).tracked);
        assert!(graph.pending_unobservations.is_empty());

        assert!(!graph.report_observed(a, None, true, false).tracked);
        assert_eq!(graph.pending_unobservations, vec![a]);
    }

    #[test]
    fn become_observed_hooks_need_a_tracking_context() {
        let mut graph = Graph::new();
        let a = atom(&mut graph, "a");
        let r = reaction(&mut graph, "r");
        graph
            .observable_mut(a)
            .unwrap()
            .on_become_observed
            .push((1, Arc::new(|| {})));

        graph.derivation_mut(r).unwrap().run_id = 1;
        assert!(graph.report_observed(a, Some(r), false, false).hooks.is_empty());

        graph.derivation_mut(r).unwrap().run_id = 2;
        assert_eq!(graph.report_observed(a, Some(r), false, true).hooks.len(), 1);

        // Fires once until the node becomes unobserved again.
        graph.derivation_mut(r).unwrap().run_id = 3;
        assert!(graph.report_observed(a, Some(r), false, true).hooks.is_empty());
    }
}
