//! Value transforms applied on every write to an observable value.

use std::fmt;
use std::sync::Arc;

type EnhanceFn<T> = dyn Fn(T, Option<&T>, &str) -> T + Send + Sync;

/// Transform applied to each new value before it is compared and stored.
///
/// Receives the new value, the current value (`None` for the initial
/// value) and the observable's name.
pub struct Enhancer<T> {
    enhance: Option<Arc<EnhanceFn<T>>>,
}

impl<T> Enhancer<T> {
    /// Store values as given.
    pub fn reference() -> Self {
        Self { enhance: None }
    }

    pub fn new<F>(enhance: F) -> Self
    where
        F: Fn(T, Option<&T>, &str) -> T + Send + Sync + 'static,
    {
        Self {
            enhance: Some(Arc::new(enhance)),
        }
    }

    pub(crate) fn enhance(&self, value: T, current: Option<&T>, name: &str) -> T {
        match &self.enhance {
            Some(enhance) => enhance(value, current, name),
            None => value,
        }
    }
}

impl<T> Default for Enhancer<T> {
    fn default() -> Self {
        Self::reference()
    }
}

impl<T> Clone for Enhancer<T> {
    fn clone(&self) -> Self {
        Self {
            enhance: self.enhance.clone(),
        }
    }
}

impl<T> fmt::Debug for Enhancer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.enhance.is_some() { "custom" } else { "reference" };
        f.debug_tuple("Enhancer").field(&kind).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_is_identity() {
        assert_eq!(Enhancer::reference().enhance(5, None, "x"), 5);
    }

    #[test]
    fn custom_sees_the_current_value() {
        let clamp = Enhancer::new(|value: i32, current: Option<&i32>, _name: &str| {
            value.min(current.copied().unwrap_or(i32::MAX) + 10)
        });
        assert_eq!(clamp.enhance(100, None, "x"), 100);
        assert_eq!(clamp.enhance(100, Some(&1), "x"), 11);
    }
}
