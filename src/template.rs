//! Machine templates: the immutable, declarative description of one machine
//! family.
//!
//! A template is pure data plus the closures that give its nodes behavior: a
//! set of named states, each tagged with a node type, an initial state, an
//! initial desired-state list, and the seed values for both halves of the
//! instance payload. Templates are built once at startup, validated at build
//! time, and shared (behind an `Arc`) by every instance of the family.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::TemplateError;
use crate::instance::DataPatch;

/// Name of one state in a machine graph.
///
/// State vocabularies are fixed at template construction, so keys are plain
/// static strings: cheap to copy, compare, hash, log, and serialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct StateKey(pub &'static str);

impl StateKey {
    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl From<&'static str> for StateKey {
    fn from(s: &'static str) -> Self {
        StateKey(s)
    }
}

/// The asynchronous side effect attached to an attempt state.
///
/// The action receives clones of both data halves and returns a partial
/// update; it may reject with an arbitrary error value, which the engine
/// records on the internal half and routes to the node's reject state.
/// Blanket-implemented for async closures so templates can be written
/// inline.
#[async_trait]
pub trait AttemptAction<I, P>: Send + Sync {
    async fn run(&self, internal: I, public: P) -> anyhow::Result<DataPatch<I, P>>;
}

#[async_trait]
impl<I, P, F, Fut> AttemptAction<I, P> for F
where
    I: Send + 'static,
    P: Send + 'static,
    F: Fn(I, P) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<DataPatch<I, P>>> + Send + 'static,
{
    async fn run(&self, internal: I, public: P) -> anyhow::Result<DataPatch<I, P>> {
        (self)(internal, public).await
    }
}

/// Synchronous gate predicate attached to a hold state. `C` is the host
/// context (connection registries, clocks, feature flags) shared by every
/// instance of the family.
pub type HoldCondition<I, P, C> = Arc<dyn Fn(&I, &P, &C) -> bool + Send + Sync>;

/// One state in a machine graph, tagged by node type.
///
/// The engine matches exhaustively on this enum, so adding a node type is a
/// compile-time-checked change everywhere it is handled.
pub enum Node<I, P, C> {
    /// A gate: the machine stays here until `condition` is true, then
    /// deterministically advances to `next`.
    Hold {
        condition: HoldCondition<I, P, C>,
        next: StateKey,
    },
    /// A branch point with no side effect; the planner picks whichever of
    /// `choices` lies closest to the desired state.
    Choice { choices: Vec<StateKey> },
    /// The only node type with a side effect. `action` runs asynchronously;
    /// fulfillment routes to `resolve`, rejection to `reject`.
    Attempt {
        action: Arc<dyn AttemptAction<I, P>>,
        resolve: StateKey,
        reject: StateKey,
    },
    /// On entry (even when the machine is already converged) the desired
    /// states are unconditionally replaced with `new_intent`, then the node
    /// behaves like a choice over `choices` toward that new intent.
    Redirect {
        new_intent: Vec<StateKey>,
        choices: Vec<StateKey>,
    },
}

impl<I, P, C> fmt::Debug for Node<I, P, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Hold { next, .. } => f.debug_struct("Hold").field("next", next).finish(),
            Node::Choice { choices } => {
                f.debug_struct("Choice").field("choices", choices).finish()
            }
            Node::Attempt {
                resolve, reject, ..
            } => f
                .debug_struct("Attempt")
                .field("resolve", resolve)
                .field("reject", reject)
                .finish(),
            Node::Redirect { new_intent, choices } => f
                .debug_struct("Redirect")
                .field("new_intent", new_intent)
                .field("choices", choices)
                .finish(),
        }
    }
}

impl<I, P, C> Node<I, P, C> {
    /// Outgoing edges as the planner sees them.
    ///
    /// Choice and redirect contribute one edge per listed choice, hold
    /// contributes its `next`, and attempt contributes `resolve` only:
    /// reject is an exceptional escape, never a planned route. A redirect's
    /// `new_intent` is an intent swap, not an edge.
    pub fn successors(&self) -> Vec<StateKey> {
        match self {
            Node::Hold { next, .. } => vec![*next],
            Node::Choice { choices } => choices.clone(),
            Node::Attempt { resolve, .. } => vec![*resolve],
            Node::Redirect { choices, .. } => choices.clone(),
        }
    }

    /// Every state this node references, for build-time validation.
    fn referenced_states(&self) -> Vec<StateKey> {
        match self {
            Node::Hold { next, .. } => vec![*next],
            Node::Choice { choices } => choices.clone(),
            Node::Attempt {
                resolve, reject, ..
            } => vec![*resolve, *reject],
            Node::Redirect { new_intent, choices } => {
                let mut refs = new_intent.clone();
                refs.extend_from_slice(choices);
                refs
            }
        }
    }
}

/// The immutable graph description shared by all instances of one machine
/// family.
pub struct Template<I, P, C> {
    name: String,
    initial_state: StateKey,
    initial_desired: Vec<StateKey>,
    initial_internal: I,
    initial_public: P,
    states: HashMap<StateKey, Node<I, P, C>>,
}

impl<I, P, C> fmt::Debug for Template<I, P, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Template")
            .field("name", &self.name)
            .field("initial_state", &self.initial_state)
            .field("initial_desired", &self.initial_desired)
            .field("states", &self.states.len())
            .finish()
    }
}

impl<I, P, C> Template<I, P, C>
where
    I: Clone,
    P: Clone,
{
    pub fn builder(
        name: impl Into<String>,
        initial_state: StateKey,
        initial_internal: I,
        initial_public: P,
    ) -> TemplateBuilder<I, P, C> {
        TemplateBuilder {
            name: name.into(),
            initial_state,
            initial_desired: vec![initial_state],
            initial_internal,
            initial_public,
            states: Vec::new(),
        }
    }

    /// Family label used in logs and reports.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn initial_state(&self) -> StateKey {
        self.initial_state
    }

    pub fn initial_desired(&self) -> &[StateKey] {
        &self.initial_desired
    }

    pub fn initial_internal(&self) -> I {
        self.initial_internal.clone()
    }

    pub fn initial_public(&self) -> P {
        self.initial_public.clone()
    }

    pub fn node(&self, key: StateKey) -> Option<&Node<I, P, C>> {
        self.states.get(&key)
    }

    pub fn contains(&self, key: StateKey) -> bool {
        self.states.contains_key(&key)
    }

    /// Outgoing planner edges of `key`, empty for unknown keys.
    pub fn successors(&self, key: StateKey) -> Vec<StateKey> {
        self.states
            .get(&key)
            .map(Node::successors)
            .unwrap_or_default()
    }
}

/// Builder for [`Template`]; one method per node type, validation in
/// [`TemplateBuilder::build`].
pub struct TemplateBuilder<I, P, C> {
    name: String,
    initial_state: StateKey,
    initial_desired: Vec<StateKey>,
    initial_internal: I,
    initial_public: P,
    states: Vec<(StateKey, Node<I, P, C>)>,
}

impl<I, P, C> TemplateBuilder<I, P, C> {
    /// Replace the desired-state list new instances start with. Order is
    /// significant: it is the planner's tie-break order.
    pub fn initial_desired(mut self, desired: impl IntoIterator<Item = StateKey>) -> Self {
        self.initial_desired = desired.into_iter().collect();
        self
    }

    pub fn hold(
        mut self,
        key: StateKey,
        condition: impl Fn(&I, &P, &C) -> bool + Send + Sync + 'static,
        next: StateKey,
    ) -> Self {
        self.states.push((
            key,
            Node::Hold {
                condition: Arc::new(condition),
                next,
            },
        ));
        self
    }

    pub fn choice(mut self, key: StateKey, choices: impl IntoIterator<Item = StateKey>) -> Self {
        self.states.push((
            key,
            Node::Choice {
                choices: choices.into_iter().collect(),
            },
        ));
        self
    }

    pub fn attempt(
        mut self,
        key: StateKey,
        action: impl AttemptAction<I, P> + 'static,
        resolve: StateKey,
        reject: StateKey,
    ) -> Self {
        self.states.push((
            key,
            Node::Attempt {
                action: Arc::new(action),
                resolve,
                reject,
            },
        ));
        self
    }

    pub fn redirect(
        mut self,
        key: StateKey,
        new_intent: impl IntoIterator<Item = StateKey>,
        choices: impl IntoIterator<Item = StateKey>,
    ) -> Self {
        self.states.push((
            key,
            Node::Redirect {
                new_intent: new_intent.into_iter().collect(),
                choices: choices.into_iter().collect(),
            },
        ));
        self
    }

    /// Validate the graph and freeze it.
    ///
    /// Every edge referenced by any node must name a declared state, the
    /// initial state and every initial desired state must exist, and keys
    /// may not be declared twice.
    pub fn build(self) -> Result<Template<I, P, C>, TemplateError> {
        if self.states.is_empty() {
            return Err(TemplateError::Empty { name: self.name });
        }

        let mut states = HashMap::with_capacity(self.states.len());
        for (key, node) in self.states {
            if states.insert(key, node).is_some() {
                return Err(TemplateError::DuplicateState { state: key });
            }
        }

        if !states.contains_key(&self.initial_state) {
            return Err(TemplateError::UnknownInitialState {
                state: self.initial_state,
            });
        }
        for desired in &self.initial_desired {
            if !states.contains_key(desired) {
                return Err(TemplateError::UnknownInitialDesired { state: *desired });
            }
        }
        for (key, node) in &states {
            for referenced in node.referenced_states() {
                if !states.contains_key(&referenced) {
                    return Err(TemplateError::UnknownStateRef {
                        state: *key,
                        refers_to: referenced,
                    });
                }
            }
        }

        Ok(Template {
            name: self.name,
            initial_state: self.initial_state,
            initial_desired: self.initial_desired,
            initial_internal: self.initial_internal,
            initial_public: self.initial_public,
            states,
        })
    }
}
