//! Observable Value Implementation
//!
//! An observable value is the fundamental stateful primitive. It holds a
//! value and tells the runtime whenever the value is read or replaced.
//!
//! # How Observable Values Work
//!
//! 1. When the value is read inside a tracked derivation, the read is
//!    recorded and the derivation ends up depending on the value.
//!
//! 2. When a new value is written, it goes through the write pipeline:
//!    policy check, interceptors, enhancer, comparer.
//!
//! 3. If the value really changed, observers are marked stale, reactions
//!    run at the end of the batch, and change listeners are notified.
//!
//! # Thread Safety
//!
//! The value lives behind a `parking_lot::RwLock` that is never held while
//! user callbacks run, except for the closure passed to
//! [`ObservableValue::with`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use super::atom::AtomInner;
use super::comparer::Comparer;
use super::disposer::Disposer;
use super::enhancer::Enhancer;
use super::introspect::{Observable, ReactiveNode};
use super::runtime::Runtime;
use crate::error::Result;
use crate::graph::NodeId;

/// A change delivered to listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueChange<T> {
    /// `None` when the listener fires immediately on registration.
    pub old_value: Option<T>,
    pub new_value: T,
}

type Interceptor<T> = Arc<dyn Fn(T) -> Option<T> + Send + Sync>;
type Listener<T> = Arc<dyn Fn(&ValueChange<T>) + Send + Sync>;

/// Options for [`ObservableValue::with_options`].
pub struct ObservableOptions<T> {
    /// Debug name. Defaults to `ObservableValue@<id>`.
    pub name: Option<String>,

    /// Decides whether a write is a change.
    pub equals: Comparer<T>,

    /// Applied to every value before it is compared and stored.
    pub enhancer: Enhancer<T>,
}

impl<T> ObservableOptions<T> {
    /// Options with an explicit comparer, for types without `PartialEq`.
    pub fn with_comparer(equals: Comparer<T>) -> Self {
        Self {
            name: None,
            equals,
            enhancer: Enhancer::reference(),
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

    pub fn enhancer(mut self, enhancer: Enhancer<T>) -> Self {
        self.enhancer = enhancer;
        self
    }
}

impl<T: PartialEq> ObservableOptions<T> {
    /// Default options with a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self::default().name(name)
    }
}

impl<T: PartialEq> Default for ObservableOptions<T> {
    fn default() -> Self {
        Self::with_comparer(Comparer::default())
    }
}

struct ObservableInner<T> {
    atom: AtomInner,

    /// The current value.
    value: RwLock<T>,

    equals: Comparer<T>,
    enhancer: Enhancer<T>,
    interceptors: Mutex<Vec<(u64, Interceptor<T>)>>,
    listeners: Mutex<Vec<(u64, Listener<T>)>>,
    next_key: AtomicU64,
}

impl<T> ObservableInner<T> {
    fn next_key(&self) -> u64 {
        self.next_key.fetch_add(1, Ordering::Relaxed)
    }
}

/// A reactive cell holding a value of type `T`.
///
/// # Type Parameters
///
/// - `T`: The type of value stored. Must be Clone + Send + Sync.
///
/// # Example
///
/// ```rust,ignore
/// let rt = Runtime::new();
/// let count = ObservableValue::new(&rt, 0);
///
/// // Read the value
/// let value = count.get();
///
/// // Update the value (notifies observers)
/// rt.run_in_action("increment", || count.set(value + 1))?;
/// ```
pub struct ObservableValue<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<ObservableInner<T>>,
}

impl<T> ObservableValue<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create an observable value with default options.
    pub fn new(runtime: &Runtime, value: T) -> Self {
        Self::with_options(runtime, value, ObservableOptions::default())
    }
}

impl<T> ObservableValue<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn with_options(runtime: &Runtime, value: T, options: ObservableOptions<T>) -> Self {
        let id = runtime.create_atom(options.name, "ObservableValue");
        let name = runtime.node_name(id);
        let value = options.enhancer.enhance(value, None, &name);
        Self {
            inner: Arc::new(ObservableInner {
                atom: AtomInner {
                    id,
                    runtime: runtime.clone(),
                },
                value: RwLock::new(value),
                equals: options.equals,
                enhancer: options.enhancer,
                interceptors: Mutex::new(Vec::new()),
                listeners: Mutex::new(Vec::new()),
                next_key: AtomicU64::new(0),
            }),
        }
    }

    /// Get the current value.
    ///
    /// Inside a tracked derivation this also records the read.
    pub fn get(&self) -> T {
        self.report_observed();
        self.get_untracked()
    }

    /// Get the current value without recording a read.
    pub fn get_untracked(&self) -> T {
        self.inner.value.read().clone()
    }

    /// Read the value by reference.
    ///
    /// `f` runs with the value locked for reading; it must not write to
    /// this observable.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.report_observed();
        f(&self.inner.value.read())
    }

    /// Write a new value.
    ///
    /// Fails when the write breaks the runtime's mutation policy. A write
    /// that an interceptor cancels, or that the comparer deems equal to the
    /// current value, succeeds without notifying anyone.
    pub fn set(&self, value: T) -> Result<()> {
        let runtime = &self.inner.atom.runtime;
        let id = self.inner.atom.id;
        runtime.check_state_modification(id)?;

        let interceptors: Vec<Interceptor<T>> = self
            .inner
            .interceptors
            .lock()
            .iter()
            .map(|(_, interceptor)| Arc::clone(interceptor))
            .collect();
        let mut value = value;
        for interceptor in interceptors {
            match interceptor(value) {
                Some(next) => value = next,
                None => return Ok(()),
            }
        }

        let current = self.get_untracked();
        let value = self
            .inner
            .enhancer
            .enhance(value, Some(&current), &runtime.node_name(id));
        if self.inner.equals.equals(&current, &value) {
            return Ok(());
        }

        let old_value = std::mem::replace(&mut *self.inner.value.write(), value.clone());
        runtime.report_changed(id);

        let listeners: Vec<Listener<T>> = self
            .inner
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        if !listeners.is_empty() {
            let change = ValueChange {
                old_value: Some(old_value),
                new_value: value,
            };
            for listener in listeners {
                listener(&change);
            }
        }
        Ok(())
    }

    /// Write a value computed from the current one.
    pub fn update(&self, f: impl FnOnce(&T) -> T) -> Result<()> {
        let next = f(&self.get_untracked());
        self.set(next)
    }

    /// Register an interceptor.
    ///
    /// Interceptors run in registration order before the enhancer. Each
    /// receives the proposed value and returns it (possibly rewritten), or
    /// `None` to cancel the write.
    pub fn intercept<F>(&self, handler: F) -> Disposer
    where
        F: Fn(T) -> Option<T> + Send + Sync + 'static,
    {
        let key = self.inner.next_key();
        self.inner.interceptors.lock().push((key, Arc::new(handler)));
        let weak = Arc::downgrade(&self.inner);
        Disposer::new(move || remove_keyed(&weak, key, |inner| &inner.interceptors))
    }

    /// Register a change listener, optionally calling it right away with
    /// the current value.
    pub fn observe<F>(&self, listener: F, fire_immediately: bool) -> Disposer
    where
        F: Fn(&ValueChange<T>) + Send + Sync + 'static,
    {
        if fire_immediately {
            listener(&ValueChange {
                old_value: None,
                new_value: self.get_untracked(),
            });
        }
        let key = self.inner.next_key();
        self.inner.listeners.lock().push((key, Arc::new(listener)));
        let weak = Arc::downgrade(&self.inner);
        Disposer::new(move || remove_keyed(&weak, key, |inner| &inner.listeners))
    }

    fn report_observed(&self) -> bool {
        self.inner.atom.runtime.report_observed(self.inner.atom.id)
    }
}

/// Remove the entry registered under `key`, dropping it after the list
/// lock is released.
fn remove_keyed<T, E>(
    weak: &Weak<ObservableInner<T>>,
    key: u64,
    list: impl Fn(&ObservableInner<T>) -> &Mutex<Vec<(u64, E)>>,
) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let removed = {
        let mut entries = list(&inner).lock();
        let index = entries.iter().position(|(k, _)| *k == key);
        index.map(|index| entries.remove(index))
    };
    drop(removed);
}

impl<T> ReactiveNode for ObservableValue<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn node_id(&self) -> NodeId {
        self.inner.atom.id
    }

    fn runtime(&self) -> &Runtime {
        &self.inner.atom.runtime
    }
}

impl<T> Observable for ObservableValue<T> where T: Clone + Send + Sync + 'static {}

impl<T> Clone for ObservableValue<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for ObservableValue<T>
where
    T: Clone + Send + Sync + fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservableValue")
            .field("id", &self.inner.atom.id)
            .field("name", &self.debug_name())
            .field("value", &self.get_untracked())
            .field("observers", &self.observer_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn observable_get_and_set() {
        let rt = Runtime::new();
        let value = ObservableValue::new(&rt, 0);
        assert_eq!(value.get(), 0);

        value.set(42).unwrap();
        assert_eq!(value.get(), 42);
    }

    #[test]
    fn observable_update() {
        let rt = Runtime::new();
        let value = ObservableValue::new(&rt, 10);
        value.update(|v| v + 5).unwrap();
        assert_eq!(value.get(), 15);
        assert_eq!(value.with(|v| v * 2), 30);
    }

    #[test]
    fn observable_clone_shares_state() {
        let rt = Runtime::new();
        let a = ObservableValue::new(&rt, 0);
        let b = a.clone();

        a.set(42).unwrap();
        assert_eq!(b.get(), 42);
        assert_eq!(a.node_id(), b.node_id());
    }

    #[test]
    fn listeners_see_old_and_new_values() {
        let rt = Runtime::new();
        let value = ObservableValue::new(&rt, 1);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let listener = value.observe(
            {
                let seen = seen.clone();
                move |change: &ValueChange<i32>| seen.lock().push((change.old_value, change.new_value))
            },
            true,
        );
        value.set(2).unwrap();
        value.set(2).unwrap();
        listener.dispose();
        value.set(3).unwrap();

        assert_eq!(*seen.lock(), vec![(None, 1), (Some(1), 2)]);
    }

    #[test]
    fn interceptors_rewrite_or_cancel() {
        let rt = Runtime::new();
        let value = ObservableValue::new(&rt, 0);
        let _clamp = value.intercept(|v: i32| Some(v.min(100)));
        let _veto = value.intercept(|v: i32| if v < 0 { None } else { Some(v) });

        value.set(500).unwrap();
        assert_eq!(value.get(), 100);

        value.set(-1).unwrap();
        assert_eq!(value.get(), 100);
    }

    #[test]
    fn equal_writes_do_not_notify() {
        let rt = Runtime::new();
        let value = ObservableValue::new(&rt, 7);
        let calls = Arc::new(AtomicI32::new(0));
        let _listener = value.observe(
            {
                let calls = calls.clone();
                move |_: &ValueChange<i32>| {
                    calls.fetch_add(1, Ordering::SeqCst);
                }
            },
            false,
        );

        value.set(7).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let never = ObservableValue::with_options(
            &rt,
            7,
            ObservableOptions::default().equals(Comparer::never()),
        );
        let _never_listener = never.observe(
            {
                let calls = calls.clone();
                move |_: &ValueChange<i32>| {
                    calls.fetch_add(1, Ordering::SeqCst);
                }
            },
            false,
        );
        never.set(7).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn enhancer_runs_on_initial_and_later_values() {
        let rt = Runtime::new();
        let value = ObservableValue::with_options(
            &rt,
            String::from("  padded "),
            ObservableOptions::named("trimmed")
                .enhancer(Enhancer::new(|v: String, _: Option<&String>, _: &str| v.trim().to_owned())),
        );
        assert_eq!(value.get(), "padded");

        value.set(String::from(" next")).unwrap();
        assert_eq!(value.get(), "next");
        assert_eq!(value.debug_name(), "trimmed");
    }

    #[test]
    fn default_names_use_the_node_id() {
        let rt = Runtime::new();
        let value = ObservableValue::new(&rt, ());
        assert_eq!(
            value.debug_name(),
            format!("ObservableValue@{}", value.node_id().raw())
        );
    }
}
