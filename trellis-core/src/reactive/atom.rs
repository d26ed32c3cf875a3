//! Atom Implementation
//!
//! An atom is the smallest observable: it carries no value, only the
//! ability to say "I was read" and "I changed". Observable values and
//! external data sources are built on top of it.

use std::fmt;
use std::sync::Arc;

use super::disposer::Disposer;
use super::introspect::{Observable, ReactiveNode};
use super::runtime::Runtime;
use crate::graph::NodeId;

pub(crate) struct AtomInner {
    pub id: NodeId,
    pub runtime: Runtime,
}

impl Drop for AtomInner {
    fn drop(&mut self) {
        self.runtime.remove_node(self.id);
    }
}

/// A value-less observable.
///
/// # Example
///
/// ```rust,ignore
/// let rt = Runtime::new();
/// let clock = Atom::new(&rt, "clock");
///
/// rt.autorun(move |_| {
///     clock.report_observed();
///     println!("tick");
///     Ok(())
/// }, Default::default());
///
/// clock.report_changed(); // prints "tick"
/// ```
#[derive(Clone)]
pub struct Atom {
    inner: Arc<AtomInner>,
}

impl Atom {
    /// Create an atom.
    pub fn new(runtime: &Runtime, name: impl Into<String>) -> Self {
        let id = runtime.create_atom(Some(name.into()), "Atom");
        Self {
            inner: Arc::new(AtomInner {
                id,
                runtime: runtime.clone(),
            }),
        }
    }

    /// Create an atom with become-observed / become-unobserved hooks.
    ///
    /// The hooks stay registered for the lifetime of the atom.
    pub fn with_hooks<O, U>(runtime: &Runtime, name: impl Into<String>, on_observed: O, on_unobserved: U) -> Self
    where
        O: Fn() + Send + Sync + 'static,
        U: Fn() + Send + Sync + 'static,
    {
        let atom = Self::new(runtime, name);
        runtime.on_become_observed(&atom, on_observed).forget();
        runtime.on_become_unobserved(&atom, on_unobserved).forget();
        atom
    }

    /// Record a read. Returns whether a derivation will depend on the atom.
    pub fn report_observed(&self) -> bool {
        self.inner.runtime.report_observed(self.inner.id)
    }

    /// Record a change and propagate it, inside its own batch.
    pub fn report_changed(&self) {
        self.inner.runtime.report_changed(self.inner.id);
    }
}

impl ReactiveNode for Atom {
    fn node_id(&self) -> NodeId {
        self.inner.id
    }

    fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }
}

impl Observable for Atom {}

impl fmt::Debug for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Atom")
            .field("id", &self.inner.id)
            .field("name", &self.debug_name())
            .field("observers", &self.observer_count())
            .finish()
    }
}

impl Runtime {
    /// Call `f` whenever `observable` goes from unobserved to observed.
    pub fn on_become_observed<O, F>(&self, observable: &O, f: F) -> Disposer
    where
        O: Observable + ?Sized,
        F: Fn() + Send + Sync + 'static,
    {
        self.add_hook(observable.node_id(), Arc::new(f), true)
    }

    /// Call `f` whenever `observable` loses its last observer. Runs at the
    /// end of the batch, and only if no observer came back in between.
    pub fn on_become_unobserved<O, F>(&self, observable: &O, f: F) -> Disposer
    where
        O: Observable + ?Sized,
        F: Fn() + Send + Sync + 'static,
    {
        self.add_hook(observable.node_id(), Arc::new(f), false)
    }
}
