use thiserror::Error;

use crate::template::StateKey;

/// Errors raised while building a machine template.
///
/// Construction is the only place the graph is validated; once a template
/// builds successfully, every edge in it names an existing state and the
/// planner and step engine can navigate it without further checks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("state '{state}' references unknown state '{refers_to}'")]
    UnknownStateRef { state: StateKey, refers_to: StateKey },

    #[error("initial state '{state}' is not declared in the template")]
    UnknownInitialState { state: StateKey },

    #[error("initial desired state '{state}' is not declared in the template")]
    UnknownInitialDesired { state: StateKey },

    #[error("state '{state}' is declared more than once")]
    DuplicateState { state: StateKey },

    #[error("template '{name}' declares no states")]
    Empty { name: String },
}

/// Errors raised by the keyed instance store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("no machine instance tracked under key '{key}'")]
    UnknownKey { key: String },
}

/// Errors surfaced to a caller awaiting arrival at a set of states.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WaitError {
    /// The waiter was cleared (or its machine removed) before the machine
    /// reached an acceptable state.
    #[error("waiter was cleared before the machine arrived")]
    Cleared,
}
