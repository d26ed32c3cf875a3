//! Dependency Graph
//!
//! This module implements the bookkeeping half of the engine: which nodes
//! exist, who observes whom, how stale every derivation is, and which
//! reactions and unobservations are waiting for the end of the batch.
//!
//! # Overview
//!
//! Nodes live in a single arena indexed by [`NodeId`]. Every edge is stored
//! twice: the derivation lists what it is `observing`, the observable lists
//! its `observers`. The two sides are only ever changed together, by
//! [`Graph::add_observer`] and [`Graph::remove_observer`].
//!
//! Nothing in this module runs user code. Propagation only flips states and
//! queues reactions; the runtime drains the queues after releasing its lock.

mod binder;
mod node;
mod propagate;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::trace;

pub use node::{DerivationState, NodeId, NodeKind};
pub(crate) use node::{ComputedCell, Hook, Node, NodeCell, ReactionCell};

/// Outcome of reporting a read to the graph.
#[derive(Default)]
pub(crate) struct Observed {
    /// A dependency edge will be established when the running derivation binds.
    pub tracked: bool,

    /// Become-observed hooks to fire once the runtime lock is released.
    pub hooks: Vec<Hook>,
}

/// Work produced by one round of the unobservation pass.
#[derive(Default)]
pub(crate) struct Unobserved {
    /// Become-unobserved hooks to fire.
    pub hooks: Vec<Hook>,

    /// Computeds that were suspended and must drop their cached value.
    pub suspended: Vec<Arc<dyn ComputedCell>>,
}

/// The node arena plus the queues that hang off it.
#[derive(Default)]
pub(crate) struct Graph {
    /// All nodes in the graph, indexed by ID.
    nodes: HashMap<NodeId, Node>,

    next_id: u64,

    /// Reactions waiting for the flush loop, in enqueue order.
    pub pending_reactions: VecDeque<NodeId>,

    /// Observables that lost their last observer during the current batch.
    pub pending_unobservations: Vec<NodeId>,
}

impl Graph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve an id for a node that is about to be inserted.
    pub fn allocate_id(&mut self) -> NodeId {
        self.next_id += 1;
        NodeId::from(self.next_id)
    }

    /// Add a node to the graph.
    pub fn insert(&mut self, node: Node) -> NodeId {
        let id = node.id();
        trace!(node = %id, name = node.name(), kind = ?node.kind(), "node added");
        self.nodes.insert(id, node);
        id
    }

    /// Remove a node from the graph.
    ///
    /// Also removes all edges involving this node. The node is handed back
    /// so the caller can drop it (and any user closures it owns) after the
    /// runtime lock is released.
    pub fn remove(&mut self, id: NodeId) -> Option<Node> {
        self.clear_observing(id);
        let node = self.nodes.remove(&id)?;

        if let Some(observable) = &node.observable {
            for observer in &observable.observers {
                if let Some(derivation) = self.derivation_mut(*observer) {
                    derivation.observing.retain(|dep| *dep != id);
                }
            }
        }
        self.pending_reactions.retain(|pending| *pending != id);
        self.pending_unobservations.retain(|pending| *pending != id);

        trace!(node = %id, "node removed");
        Some(node)
    }

    /// Get a reference to a node.
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Get the total number of nodes in the graph.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn name(&self, id: NodeId) -> String {
        self.get(id)
            .map(|node| node.name().to_owned())
            .unwrap_or_else(|| format!("<dropped {id}>"))
    }

    pub fn observable_mut(&mut self, id: NodeId) -> Option<&mut node::ObservableSide> {
        self.nodes.get_mut(&id)?.observable.as_mut()
    }

    pub fn derivation_mut(&mut self, id: NodeId) -> Option<&mut node::DerivationSide> {
        self.nodes.get_mut(&id)?.derivation.as_mut()
    }

    /// Staleness of a derivation; `None` for atoms and unknown ids.
    pub fn state_of(&self, id: NodeId) -> Option<DerivationState> {
        self.get(id)?.derivation_state()
    }

    pub fn set_state(&mut self, id: NodeId, state: DerivationState) {
        if let Some(derivation) = self.derivation_mut(id) {
            derivation.state = state;
        }
    }

    pub fn observer_count(&self, id: NodeId) -> usize {
        self.get(id).map_or(0, Node::observer_count)
    }

    /// Snapshot of the observers of a node, for iteration while mutating.
    pub fn observers_of(&self, id: NodeId) -> SmallVec<[NodeId; 8]> {
        self.get(id)
            .and_then(|node| node.observable.as_ref())
            .map(|o| o.observers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Snapshot of the bound dependencies of a derivation.
    pub fn observing_of(&self, id: NodeId) -> SmallVec<[NodeId; 4]> {
        self.get(id)
            .map(|node| node.observing().iter().copied().collect())
            .unwrap_or_default()
    }

    /// Live computed cell behind a node, if it is a computed that still exists.
    pub fn computed_cell(&self, id: NodeId) -> Option<Arc<dyn ComputedCell>> {
        match &self.get(id)?.cell {
            NodeCell::Computed { cell, .. } => cell.upgrade(),
            _ => None,
        }
    }

    /// Add an edge: `derivation` now observes `observable`.
    pub fn add_observer(&mut self, observable: NodeId, derivation: NodeId) {
        let state = self.state_of(derivation).unwrap_or(DerivationState::UpToDate);
        if let Some(side) = self.observable_mut(observable) {
            side.observers.insert(derivation);
            if side.lowest_observer_state > state {
                side.lowest_observer_state = state;
            }
        }
    }

    /// Remove an edge, queueing the observable for unobservation when it
    /// loses its last observer.
    pub fn remove_observer(&mut self, observable: NodeId, derivation: NodeId) {
        let now_unobserved = match self.observable_mut(observable) {
            Some(side) => {
                side.observers.shift_remove(&derivation);
                side.observers.is_empty()
            }
            None => false,
        };
        if now_unobserved {
            self.queue_for_unobservation(observable);
        }
    }

    pub fn queue_for_unobservation(&mut self, id: NodeId) {
        let newly_queued = match self.observable_mut(id) {
            Some(side) if !side.is_pending_unobservation => {
                side.is_pending_unobservation = true;
                true
            }
            _ => false,
        };
        if newly_queued {
            self.pending_unobservations.push(id);
        }
    }

    /// Detach a derivation from all of its dependencies.
    pub fn clear_observing(&mut self, id: NodeId) {
        let Some(derivation) = self.derivation_mut(id) else {
            return;
        };
        let observing = std::mem::take(&mut derivation.observing);
        derivation.state = DerivationState::NotTracking;
        for dep in observing.iter().rev() {
            self.remove_observer(*dep, id);
        }
    }

    /// Mark a derivation and all of its dependencies up to date.
    pub fn change_dependencies_state_to_0(&mut self, id: NodeId) {
        let Some(derivation) = self.derivation_mut(id) else {
            return;
        };
        if derivation.state == DerivationState::UpToDate {
            return;
        }
        derivation.state = DerivationState::UpToDate;
        for dep in self.observing_of(id) {
            if let Some(side) = self.observable_mut(dep) {
                side.lowest_observer_state = DerivationState::UpToDate;
            }
        }
    }

    /// A direct dependency of `id` may have changed.
    ///
    /// Computeds pass a "possibly stale" signal on to their own observers;
    /// reactions get queued for the flush loop.
    pub fn on_become_stale(&mut self, id: NodeId) {
        match self.get(id).map(Node::kind) {
            Some(NodeKind::Computed) => self.propagate_maybe_changed(id),
            Some(NodeKind::Reaction) => {
                self.schedule(id);
            }
            _ => {}
        }
    }

    /// Queue a reaction unless it is already queued. Returns whether it was queued now.
    pub fn schedule(&mut self, id: NodeId) -> bool {
        let Some((is_scheduled, _)) = self.reaction_flags_mut(id) else {
            return false;
        };
        if *is_scheduled {
            return false;
        }
        *is_scheduled = true;
        self.pending_reactions.push_back(id);
        trace!(reaction = %id, "reaction scheduled");
        true
    }

    /// Run one round of the unobservation pass.
    ///
    /// Observables still without observers lose their "being observed"
    /// status; non keep-alive computeds are suspended, which may in turn
    /// queue their own dependencies for the next round.
    pub fn process_unobservations(&mut self) -> Unobserved {
        let mut work = Unobserved::default();
        let pending = std::mem::take(&mut self.pending_unobservations);

        for id in pending {
            let Some(node) = self.nodes.get_mut(&id) else {
                continue;
            };
            let Some(side) = node.observable.as_mut() else {
                continue;
            };
            side.is_pending_unobservation = false;
            if !side.observers.is_empty() {
                continue;
            }
            if side.is_being_observed {
                side.is_being_observed = false;
                work.hooks
                    .extend(side.on_become_unobserved.iter().map(|(_, hook)| Arc::clone(hook)));
            }
            let suspend = match &node.cell {
                NodeCell::Computed {
                    cell,
                    keep_alive: false,
                } => Some(cell.upgrade()),
                _ => None,
            };
            if let Some(cell) = suspend {
                trace!(computed = %id, "suspending computed");
                self.clear_observing(id);
                work.suspended.extend(cell);
            }
        }

        work
    }

    /// Set the scheduled / running flags of a reaction node.
    pub fn reaction_flags_mut(&mut self, id: NodeId) -> Option<(&mut bool, &mut bool)> {
        match &mut self.nodes.get_mut(&id)?.cell {
            NodeCell::Reaction {
                is_scheduled,
                is_running,
                ..
            } => Some((is_scheduled, is_running)),
            _ => None,
        }
    }

    pub fn reaction_cell(&self, id: NodeId) -> Option<Arc<dyn ReactionCell>> {
        match &self.get(id)?.cell {
            NodeCell::Reaction { cell, .. } => Some(Arc::clone(cell)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(super) struct NoopReaction;

    impl ReactionCell for NoopReaction {
        fn run_reaction(&self) {}

        fn name(&self) -> &str {
            "noop"
        }
    }

    pub(super) fn atom(graph: &mut Graph, name: &str) -> NodeId {
        let id = graph.allocate_id();
        graph.insert(Node::atom(id, name.into()))
    }

    pub(super) fn reaction(graph: &mut Graph, name: &str) -> NodeId {
        let id = graph.allocate_id();
        graph.insert(Node::reaction(id, name.into(), Arc::new(NoopReaction), false))
    }

    #[test]
    fn add_and_remove_nodes() {
        let mut graph = Graph::new();
        let a = atom(&mut graph, "a");
        let r = reaction(&mut graph, "r");

        assert_eq!(graph.len(), 2);
        assert_ne!(a, r);

        graph.remove(a);
        assert_eq!(graph.len(), 1);
        assert!(graph.get(a).is_none());
        assert!(graph.get(r).is_some());
    }

    #[test]
    fn add_and_remove_edges() {
        let mut graph = Graph::new();
        let a = atom(&mut graph, "a");
        let r = reaction(&mut graph, "r");

        graph.add_observer(a, r);
        graph.derivation_mut(r).unwrap().observing.push(a);
        assert_eq!(graph.observer_count(a), 1);

        graph.remove_observer(a, r);
        assert_eq!(graph.observer_count(a), 0);
        assert_eq!(graph.pending_unobservations, vec![a]);

        // Queued only once.
        graph.queue_for_unobservation(a);
        assert_eq!(graph.pending_unobservations.len(), 1);
    }

    #[test]
    fn removing_an_observable_scrubs_dependents() {
        let mut graph = Graph::new();
        let a = atom(&mut graph, "a");
        let r = reaction(&mut graph, "r");
        graph.add_observer(a, r);
        graph.derivation_mut(r).unwrap().observing.push(a);

        graph.remove(a);
        assert!(graph.observing_of(r).is_empty());
    }

    #[test]
    fn clear_observing_resets_state() {
        let mut graph = Graph::new();
        let a = atom(&mut graph, "a");
        let b = atom(&mut graph, "b");
        let r = reaction(&mut graph, "r");
        for dep in [a, b] {
            graph.add_observer(dep, r);
            graph.derivation_mut(r).unwrap().observing.push(dep);
        }
        graph.set_state(r, DerivationState::UpToDate);

        graph.clear_observing(r);
        assert_eq!(graph.state_of(r), Some(DerivationState::NotTracking));
        assert_eq!(graph.observer_count(a), 0);
        assert_eq!(graph.observer_count(b), 0);
        assert!(graph.observing_of(r).is_empty());
    }

    #[test]
    fn schedule_is_idempotent() {
        let mut graph = Graph::new();
        let r = reaction(&mut graph, "r");

        assert!(graph.schedule(r));
        assert!(!graph.schedule(r));
        assert_eq!(graph.pending_reactions.len(), 1);

        let a = atom(&mut graph, "a");
        assert!(!graph.schedule(a));
    }

    #[test]
    fn unobservation_fires_hooks_once() {
        let mut graph = Graph::new();
        let a = atom(&mut graph, "a");
        {
            let side = graph.observable_mut(a).unwrap();
            side.is_being_observed = true;
            side.on_become_unobserved.push((1, Arc::new(|| {})));
        }
        graph.queue_for_unobservation(a);

        let work = graph.process_unobservations();
        assert_eq!(work.hooks.len(), 1);
        assert!(graph.pending_unobservations.is_empty());

        graph.queue_for_unobservation(a);
        assert!(graph.process_unobservations().hooks.is_empty());
    }
}
