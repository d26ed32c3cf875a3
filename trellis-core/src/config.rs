//! Runtime Configuration
//!
//! Global policies of a [`Runtime`](crate::reactive::Runtime). The
//! configuration is plain data and can be deserialized, so applications
//! can keep it next to the rest of their settings:
//!
//! ```rust,ignore
//! let config: RuntimeConfig = serde_json::from_str(r#"{ "enforce_actions": "always", "strict": true }"#)?;
//! let rt = Runtime::with_config(config);
//! ```

use serde::{Deserialize, Serialize};

/// Default ceiling of the reaction flush loop.
pub const DEFAULT_MAX_REACTION_ITERATIONS: usize = 100;

/// Which writes must happen inside an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforceActions {
    /// Writes are allowed anywhere (except inside computed evaluation).
    Never,

    /// Writes to observables that currently have observers need an action.
    #[default]
    Observed,

    /// Every write needs an action.
    Always,
}

/// Runtime-wide policies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Which writes count as policy violations when made outside an action.
    pub enforce_actions: EnforceActions,

    /// Reject policy violations with an error instead of logging a warning.
    pub strict: bool,

    /// Warn when a computed value is read outside a reactive context.
    pub computed_requires_reaction: bool,

    /// Warn when an observable is read outside a reactive context.
    pub observable_requires_reaction: bool,

    /// Warn when a reaction runs without reading any observable.
    pub reaction_requires_observable: bool,

    /// How many flush rounds may run before reactions are considered cyclic.
    pub max_reaction_iterations: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            enforce_actions: EnforceActions::default(),
            strict: false,
            computed_requires_reaction: false,
            observable_requires_reaction: false,
            reaction_requires_observable: false,
            max_reaction_iterations: DEFAULT_MAX_REACTION_ITERATIONS,
        }
    }
}

impl RuntimeConfig {
    /// Strict mode: every write outside an action is an error.
    pub fn strict() -> Self {
        Self {
            enforce_actions: EnforceActions::Always,
            strict: true,
            ..Self::default()
        }
    }
}
