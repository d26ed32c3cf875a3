//! Introspection
//!
//! Capability traits shared by the reactive primitives, plus read-only
//! queries over the dependency graph. Nothing here changes the graph or
//! records a read.

use serde::Serialize;

use super::runtime::Runtime;
use crate::graph::{DerivationState, NodeId, NodeKind};

/// Anything that lives in a runtime's dependency graph.
pub trait ReactiveNode {
    /// Id of the node in the graph.
    fn node_id(&self) -> NodeId;

    /// The runtime the node belongs to.
    fn runtime(&self) -> &Runtime;

    /// Debug name.
    fn debug_name(&self) -> String {
        self.runtime().node_name(self.node_id())
    }
}

/// Something derivations can depend on: atoms, observable values and
/// computed values.
pub trait Observable: ReactiveNode {
    /// Number of derivations currently depending on this node.
    fn observer_count(&self) -> usize {
        self.runtime().lock().graph.observer_count(self.node_id())
    }

    /// Whether a reaction (directly or through computeds) observes this node.
    fn is_being_observed(&self) -> bool {
        let mut state = self.runtime().lock();
        state
            .graph
            .observable_mut(self.node_id())
            .is_some_and(|side| side.is_being_observed)
    }
}

/// Something that depends on observables: computed values and reactions.
pub trait Derivation: ReactiveNode {
    /// Staleness of the derivation.
    fn dependencies_state(&self) -> DerivationState {
        self.runtime()
            .lock()
            .graph
            .state_of(self.node_id())
            .unwrap_or(DerivationState::NotTracking)
    }

    /// Number of observables bound by the last run.
    fn dependency_count(&self) -> usize {
        self.runtime().lock().graph.observing_of(self.node_id()).len()
    }
}

/// Snapshot of what a derivation depends on, recursively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyTree {
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<DependencyTree>,
}

/// Snapshot of what depends on an observable, recursively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObserverTree {
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub observers: Vec<ObserverTree>,
}

impl Runtime {
    /// Whether `id` names a live node that can be observed.
    pub fn is_observable(&self, id: NodeId) -> bool {
        self.lock()
            .graph
            .get(id)
            .is_some_and(|node| node.observable.is_some())
    }

    /// Whether any derivation depends on `id`.
    pub fn has_observers(&self, id: NodeId) -> bool {
        self.lock().graph.observer_count(id) > 0
    }

    pub fn node_kind(&self, id: NodeId) -> Option<NodeKind> {
        self.lock().graph.get(id).map(|node| node.kind())
    }

    /// Number of live nodes.
    pub fn node_count(&self) -> usize {
        self.lock().graph.len()
    }

    pub fn dependency_tree(&self, id: NodeId) -> Option<DependencyTree> {
        let state = self.lock();
        let graph = &state.graph;
        graph.get(id)?;

        fn build(graph: &crate::graph::Graph, id: NodeId) -> DependencyTree {
            DependencyTree {
                name: graph.name(id),
                dependencies: graph
                    .observing_of(id)
                    .into_iter()
                    .map(|dep| build(graph, dep))
                    .collect(),
            }
        }
        Some(build(graph, id))
    }

    pub fn observer_tree(&self, id: NodeId) -> Option<ObserverTree> {
        let state = self.lock();
        let graph = &state.graph;
        graph.get(id)?;

        fn build(graph: &crate::graph::Graph, id: NodeId) -> ObserverTree {
            ObserverTree {
                name: graph.name(id),
                observers: graph
                    .observers_of(id)
                    .into_iter()
                    .map(|observer| build(graph, observer))
                    .collect(),
            }
        }
        Some(build(graph, id))
    }
}
