//! Equality policies.
//!
//! A comparer decides whether a new value counts as a change. Observable
//! values use it to drop no-op writes; computed values use it to decide
//! whether a recomputation has to be propagated to their observers.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

/// Pluggable equality check.
pub struct Comparer<T> {
    equals: Arc<dyn Fn(&T, &T) -> bool + Send + Sync>,
    kind: &'static str,
}

impl<T> Comparer<T> {
    /// Use a custom equality function.
    pub fn new<F>(equals: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        Self {
            equals: Arc::new(equals),
            kind: "custom",
        }
    }

    /// Treat every write as a change.
    pub fn never() -> Self {
        Self {
            equals: Arc::new(|_, _| false),
            kind: "never",
        }
    }

    /// Whether `a` and `b` are considered equal.
    pub fn equals(&self, a: &T, b: &T) -> bool {
        (self.equals)(a, b)
    }
}

impl<T: PartialEq> Comparer<T> {
    /// `PartialEq` equality.
    pub fn default_eq() -> Self {
        Self {
            equals: Arc::new(|a: &T, b: &T| a == b),
            kind: "default",
        }
    }
}

impl<T: PartialEq> Default for Comparer<T> {
    fn default() -> Self {
        Self::default_eq()
    }
}

impl<U: ?Sized> Comparer<Arc<U>> {
    /// Reference identity: equal only when both point to the same allocation.
    pub fn identity() -> Self {
        Self {
            equals: Arc::new(|a: &Arc<U>, b: &Arc<U>| Arc::ptr_eq(a, b)),
            kind: "identity",
        }
    }
}

impl<T: Serialize> Comparer<T> {
    /// Structural equality through the serialized form. Values that fail to
    /// serialize are never equal.
    pub fn structural() -> Self {
        Self {
            equals: Arc::new(|a: &T, b: &T| {
                match (serde_json::to_value(a), serde_json::to_value(b)) {
                    (Ok(a), Ok(b)) => a == b,
                    _ => false,
                }
            }),
            kind: "structural",
        }
    }
}

impl<T> Clone for Comparer<T> {
    fn clone(&self) -> Self {
        Self {
            equals: Arc::clone(&self.equals),
            kind: self.kind,
        }
    }
}

impl<T> fmt::Debug for Comparer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Comparer").field(&self.kind).finish()
    }
}
