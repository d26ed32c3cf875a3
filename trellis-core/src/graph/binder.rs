//! Dependency Binder
//!
//! After a tracked run, the reads collected in `new_observing` become the
//! derivation's new dependency set. The binder diffs that list against the
//! previous `observing` list and touches only the edges that changed:
//!
//! 1. Deduplicate the new reads, keeping first-read order, and find the
//!    stalest state among the new dependencies.
//! 2. Detach from every old dependency that was not read this time.
//! 3. Attach to every new dependency that was not bound before.
//!
//! Both sets are built on the stack for the duration of one pass, so no
//! per-node scratch state is shared between passes. The cost is linear in
//! the size of the old and new lists.

use indexmap::IndexSet;
use smallvec::SmallVec;
use tracing::trace;

use super::{DerivationState, Graph, NodeId};

impl Graph {
    /// Prepare a derivation for a tracked run with the given run id.
    pub(crate) fn begin_tracking(&mut self, id: NodeId, run_id: u64) {
        self.change_dependencies_state_to_0(id);
        if let Some(derivation) = self.derivation_mut(id) {
            derivation.new_observing = Vec::with_capacity(derivation.observing.len() + 4);
            derivation.run_id = run_id;
        }
    }

    /// Reconcile the reads of the finished run with the bound dependencies.
    ///
    /// Returns the number of dependencies bound after the pass.
    pub(crate) fn bind_dependencies(&mut self, id: NodeId) -> usize {
        let Some(derivation) = self.derivation_mut(id) else {
            return 0;
        };
        let previous = std::mem::take(&mut derivation.observing);
        let reads = std::mem::take(&mut derivation.new_observing);

        // Pass 1: dedup, and note the stalest newly read dependency. Nodes
        // dropped during the run are skipped.
        let mut current: IndexSet<NodeId> = IndexSet::with_capacity(reads.len());
        let mut lowest_new_state = DerivationState::UpToDate;
        for dep in reads {
            if !self.contains(dep) || !current.insert(dep) {
                continue;
            }
            if let Some(state) = self.state_of(dep) {
                lowest_new_state = lowest_new_state.max(state);
            }
        }

        // Pass 2: detach from dependencies that were not read this time.
        let previous_set: IndexSet<NodeId> = previous.iter().copied().collect();
        for dep in previous.iter().rev() {
            if !current.contains(dep) {
                self.remove_observer(*dep, id);
            }
        }

        // Pass 3: attach to dependencies read for the first time.
        for dep in current.iter().rev() {
            if !previous_set.contains(dep) {
                self.add_observer(*dep, id);
            }
        }

        let bound = current.len();
        trace!(
            derivation = %id,
            bound,
            added = current.iter().filter(|dep| !previous_set.contains(*dep)).count(),
            removed = previous.iter().filter(|dep| !current.contains(*dep)).count(),
            "dependencies bound"
        );
        if let Some(derivation) = self.derivation_mut(id) {
            derivation.observing = current.into_iter().collect::<SmallVec<_>>();
        }

        // A dependency went stale while this run was still reading it.
        if lowest_new_state != DerivationState::UpToDate {
            self.set_state(id, lowest_new_state);
            self.on_become_stale(id);
        }

        bound
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{atom, reaction};
    use super::*;

    fn run(graph: &mut Graph, derivation: NodeId, run_id: u64, reads: &[NodeId]) -> usize {
        graph.begin_tracking(derivation, run_id);
        for read in reads {
            graph.report_observed(*read, Some(derivation), false, true);
        }
        graph.bind_dependencies(derivation)
    }

    #[test]
    fn duplicates_are_bound_once_in_read_order() {
        let mut graph = Graph::new();
        let a = atom(&mut graph, "a");
        let b = atom(&mut graph, "b");
        let r = reaction(&mut graph, "r");

        graph.begin_tracking(r, 1);
        graph.derivation_mut(r).unwrap().new_observing = vec![b, a, b, a];
        assert_eq!(graph.bind_dependencies(r), 2);

        assert_eq!(graph.observing_of(r).as_slice(), &[b, a]);
        assert_eq!(graph.observer_count(a), 1);
        assert_eq!(graph.observer_count(b), 1);
    }

    #[test]
    fn switching_branches_moves_edges() {
        let mut graph = Graph::new();
        let flag = atom(&mut graph, "flag");
        let x = atom(&mut graph, "x");
        let y = atom(&mut graph, "y");
        let r = reaction(&mut graph, "r");

        run(&mut graph, r, 1, &[flag, x]);
        assert_eq!(graph.observer_count(x), 1);
        assert_eq!(graph.observer_count(y), 0);

        run(&mut graph, r, 2, &[flag, y]);
        assert_eq!(graph.observer_count(x), 0);
        assert_eq!(graph.observer_count(y), 1);
        assert_eq!(graph.observer_count(flag), 1);
        assert_eq!(graph.pending_unobservations, vec![x]);
    }

    #[test]
    fn unchanged_dependencies_are_left_alone() {
        let mut graph = Graph::new();
        let a = atom(&mut graph, "a");
        let r = reaction(&mut graph, "r");

        run(&mut graph, r, 1, &[a]);
        run(&mut graph, r, 2, &[a]);
        assert_eq!(graph.observer_count(a), 1);
        assert!(graph.pending_unobservations.is_empty());
        assert_eq!(graph.state_of(r), Some(DerivationState::UpToDate));
    }

    #[test]
    fn stale_dependency_read_during_run_reschedules() {
        let mut graph = Graph::new();
        let a = atom(&mut graph, "a");
        let inner = reaction(&mut graph, "inner");
        let outer = reaction(&mut graph, "outer");

        // `inner` plays the role of a dependency that carries derivation
        // state and is already stale when `outer` finishes.
        graph.set_state(inner, DerivationState::Stale);
        graph.begin_tracking(outer, 5);
        graph.derivation_mut(outer).unwrap().new_observing = vec![a, inner];
        graph.bind_dependencies(outer);

        assert_eq!(graph.state_of(outer), Some(DerivationState::Stale));
        assert_eq!(graph.pending_reactions.back(), Some(&outer));
    }
}
