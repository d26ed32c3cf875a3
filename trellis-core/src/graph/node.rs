//! Graph Nodes
//!
//! This module defines the node types that live in the dependency graph.
//!
//! A node carries up to two roles. The *observable* side knows who is
//! reading it; the *derivation* side knows what it reads. Atoms and
//! observable values only have the first, reactions only the second, and
//! computed values have both.

use std::fmt;
use std::sync::{Arc, Weak};

use indexmap::IndexSet;
use serde::Serialize;
use smallvec::SmallVec;

use crate::error::Result;

/// Unique identifier for a node in the dependency graph.
///
/// Ids are allocated per runtime and never reused within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(u64);

impl NodeId {
    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The kind of node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// A source node (atom or observable value). Only ever observed.
    Atom,

    /// A computed value. Observes other nodes and is observed itself.
    Computed,

    /// A reaction. Observes other nodes, never observed.
    Reaction,
}

/// Staleness of a derivation.
///
/// The variants are ordered from "knows nothing" to "definitely stale", and
/// the propagation code relies on that ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivationState {
    /// Not run yet, or suspended. Holds no information about dependencies.
    NotTracking,

    /// No direct dependency changed since the last run.
    UpToDate,

    /// A dependency of a computed dependency changed. Whether a direct
    /// dependency changed is only known after re-evaluating the computeds.
    PossiblyStale,

    /// A direct dependency changed; the derivation must run again.
    Stale,
}

/// A callback registered on a node (become-observed / become-unobserved).
pub(crate) type Hook = Arc<dyn Fn() + Send + Sync>;

/// Type-erased access to a computed value, used by the runtime when it
/// needs to refresh or suspend a computed it only knows by id.
pub(crate) trait ComputedCell: Send + Sync {
    /// Bring the cached value up to date, as a read would.
    fn refresh(&self) -> Result<()>;

    /// Drop the cached value after the computed was suspended.
    fn clear_cache(&self);
}

/// Type-erased access to a reaction, used by the flush loop.
pub(crate) trait ReactionCell: Send + Sync {
    /// Run the reaction if its dependencies warrant it.
    fn run_reaction(&self);

    /// Name used in diagnostics.
    fn name(&self) -> &str;
}

/// The observable half of a node.
pub(crate) struct ObservableSide {
    /// Derivations that currently depend on this node, in attach order.
    pub observers: IndexSet<NodeId>,

    /// Lower bound of the staleness of all observers. Lets propagation stop
    /// early when every observer is already at least as stale as the target.
    pub lowest_observer_state: DerivationState,

    pub is_being_observed: bool,

    /// Queued for the end-of-batch unobservation pass.
    pub is_pending_unobservation: bool,

    /// Run id of the last derivation run that reported reading this node.
    pub last_accessed_by: u64,

    pub on_become_observed: Vec<(u64, Hook)>,
    pub on_become_unobserved: Vec<(u64, Hook)>,
}

impl ObservableSide {
    fn new(lowest_observer_state: DerivationState) -> Self {
        Self {
            observers: IndexSet::new(),
            lowest_observer_state,
            is_being_observed: false,
            is_pending_unobservation: false,
            last_accessed_by: 0,
            on_become_observed: Vec::new(),
            on_become_unobserved: Vec::new(),
        }
    }
}

/// The derivation half of a node.
pub(crate) struct DerivationSide {
    /// Dependencies bound by the last completed run, duplicate free.
    pub observing: SmallVec<[NodeId; 4]>,

    /// Reads collected by the run in progress. May contain duplicates when
    /// a node is read again after a nested run reused its marker.
    pub new_observing: Vec<NodeId>,

    pub state: DerivationState,

    /// Id of the current (or last) tracked run.
    pub run_id: u64,

    /// Warn when a run binds no dependencies.
    pub requires_observable: bool,
}

impl DerivationSide {
    fn new() -> Self {
        Self {
            observing: SmallVec::new(),
            new_observing: Vec::new(),
            state: DerivationState::NotTracking,
            run_id: 0,
            requires_observable: false,
        }
    }
}

/// Kind-specific payload of a node.
pub(crate) enum NodeCell {
    Atom,

    Computed {
        cell: Weak<dyn ComputedCell>,
        keep_alive: bool,
    },

    Reaction {
        /// Strong on purpose: a reaction lives until it is disposed.
        cell: Arc<dyn ReactionCell>,
        is_scheduled: bool,
        is_running: bool,
    },
}

/// A node in the dependency graph.
pub(crate) struct Node {
    /// Unique identifier for this node.
    id: NodeId,

    /// Debug name.
    name: String,

    pub observable: Option<ObservableSide>,
    pub derivation: Option<DerivationSide>,
    pub cell: NodeCell,
}

impl Node {
    /// Create a source node.
    pub fn atom(id: NodeId, name: String) -> Self {
        Self {
            id,
            name,
            observable: Some(ObservableSide::new(DerivationState::NotTracking)),
            derivation: None,
            cell: NodeCell::Atom,
        }
    }

    /// Create a computed node. The cell is attached once the owning value exists.
    pub fn computed(id: NodeId, name: String, cell: Weak<dyn ComputedCell>, keep_alive: bool) -> Self {
        Self {
            id,
            name,
            observable: Some(ObservableSide::new(DerivationState::UpToDate)),
            derivation: Some(DerivationSide::new()),
            cell: NodeCell::Computed { cell, keep_alive },
        }
    }

    /// Create a reaction node.
    pub fn reaction(id: NodeId, name: String, cell: Arc<dyn ReactionCell>, requires_observable: bool) -> Self {
        let mut derivation = DerivationSide::new();
        derivation.requires_observable = requires_observable;
        Self {
            id,
            name,
            observable: None,
            derivation: Some(derivation),
            cell: NodeCell::Reaction {
                cell,
                is_scheduled: false,
                is_running: false,
            },
        }
    }

    /// Get the node's ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Get the node's debug name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the node's kind.
    pub fn kind(&self) -> NodeKind {
        match self.cell {
            NodeCell::Atom => NodeKind::Atom,
            NodeCell::Computed { .. } => NodeKind::Computed,
            NodeCell::Reaction { .. } => NodeKind::Reaction,
        }
    }

    /// Staleness of the derivation side, if there is one.
    pub fn derivation_state(&self) -> Option<DerivationState> {
        self.derivation.as_ref().map(|d| d.state)
    }

    /// Number of observers (zero for reactions).
    pub fn observer_count(&self) -> usize {
        self.observable.as_ref().map_or(0, |o| o.observers.len())
    }

    /// Bound dependencies (empty for atoms).
    pub fn observing(&self) -> &[NodeId] {
        self.derivation.as_ref().map_or(&[], |d| d.observing.as_slice())
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("state", &self.derivation_state())
            .field("observers", &self.observer_count())
            .field("observing", &self.observing())
            .finish()
    }
}
