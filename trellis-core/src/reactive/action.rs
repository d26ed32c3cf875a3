//! Actions
//!
//! An action is a piece of code that changes state. Running code as an
//! action batches all of its writes, allows state changes under the
//! `observed` / `always` policies, and keeps its reads from being tracked by
//! whatever derivation happens to call it.

use super::context::ActionScope;
use super::runtime::Runtime;

impl Runtime {
    /// Run `f` as an action named `name`.
    pub fn run_in_action<R>(&self, name: &str, f: impl FnOnce() -> R) -> R {
        self.execute_action(name, false, f)
    }

    /// Run a fallible `f` as an action.
    ///
    /// When `f` fails, reactions triggered by the writes it made before
    /// failing still run, but their errors are logged as warnings.
    pub fn try_run_in_action<R, E>(&self, name: &str, f: impl FnOnce() -> Result<R, E>) -> Result<R, E> {
        let mut scope = ActionScope::start(self, name, false);
        let result = f();
        if result.is_err() {
            scope.mark_failed();
        }
        result
    }

    /// Wrap `f` so that every call runs as an action.
    pub fn action<A, R, F>(&self, name: impl Into<String>, f: F) -> impl Fn(A) -> R + Send + Sync
    where
        F: Fn(A) -> R + Send + Sync,
    {
        let runtime = self.clone();
        let name = name.into();
        move |args| runtime.execute_action(&name, false, || f(args))
    }

    /// Like [`Runtime::action`], but when called from inside a derivation
    /// the body runs as part of that derivation: its reads are tracked and
    /// state changes stay forbidden.
    pub fn auto_action<A, R, F>(&self, name: impl Into<String>, f: F) -> impl Fn(A) -> R + Send + Sync
    where
        F: Fn(A) -> R + Send + Sync,
    {
        let runtime = self.clone();
        let name = name.into();
        move |args| runtime.execute_action(&name, true, || f(args))
    }

    pub(crate) fn execute_action<R>(&self, name: &str, can_run_as_derivation: bool, f: impl FnOnce() -> R) -> R {
        let _scope = ActionScope::start(self, name, can_run_as_derivation);
        f()
    }
}
