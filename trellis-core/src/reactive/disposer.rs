//! Registration handles.

use std::fmt;

/// Handle to a registered callback (hook, listener, interceptor, error
/// handler).
///
/// Dropping the handle unregisters the callback. Call [`Disposer::forget`]
/// to keep it registered for the lifetime of the thing it is attached to.
#[must_use = "dropping a Disposer immediately unregisters its callback"]
pub struct Disposer {
    dispose: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Disposer {
    pub(crate) fn new(dispose: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            dispose: Some(Box::new(dispose)),
        }
    }

    /// Unregister now.
    pub fn dispose(mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }

    /// Keep the callback registered and give up the handle.
    pub fn forget(mut self) {
        self.dispose = None;
    }
}

impl Drop for Disposer {
    fn drop(&mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }
}

impl fmt::Debug for Disposer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposer")
            .field("active", &self.dispose.is_some())
            .finish()
    }
}
