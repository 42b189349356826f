//! Per-instance machine records and the typed views used to read and mutate
//! them.
//!
//! A [`MachineInstance`] is the only shared mutable resource in the engine.
//! It is owned by its instance-store adapter and mutated exclusively through
//! the adapter's mutation entry points; everything else sees it as a cloned
//! [`Snapshot`]. The record is serializable end to end: waiters are stored
//! as opaque tokens, never live promises.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::template::{StateKey, Template};
use crate::waiters::WaiterToken;

/// The private working half of an instance's payload (subscriptions, backoff
/// counters, retry tokens). The engine records attempt rejections here via
/// [`InternalData::set_error`].
pub trait InternalData: Clone + Debug + Send + Sync + Serialize + 'static {
    fn set_error(&mut self, error: String);
}

/// The externally readable half of an instance's payload; the only part
/// exposed to read-only projections outside the machine.
pub trait PublicData: Clone + Debug + Send + Sync + Serialize + 'static {}

impl<T> PublicData for T where T: Clone + Debug + Send + Sync + Serialize + 'static {}

/// A partial update to an instance's payload, as returned by attempt
/// actions. `None` leaves that half untouched.
#[derive(Debug, Clone, Default)]
pub struct DataPatch<I, P> {
    pub internal: Option<I>,
    pub public: Option<P>,
}

impl<I, P> DataPatch<I, P> {
    /// A patch that changes nothing.
    pub fn none() -> Self {
        Self {
            internal: None,
            public: None,
        }
    }

    pub fn internal(internal: I) -> Self {
        Self {
            internal: Some(internal),
            public: None,
        }
    }

    pub fn public(public: P) -> Self {
        Self {
            internal: None,
            public: Some(public),
        }
    }

    pub fn both(internal: I, public: P) -> Self {
        Self {
            internal: Some(internal),
            public: Some(public),
        }
    }
}

/// One recorded state transition, kept in the instance's bounded history.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionRecord {
    pub from: StateKey,
    pub to: StateKey,
    pub at: DateTime<Utc>,
}

/// The live record of one machine instance.
///
/// `desired_states` is a set of acceptable terminations, not a single
/// target; its order is the planner's tie-break order. `in_progress` names
/// the attempt state whose action is currently in flight, or `None`; it
/// exists purely to prevent a second concurrent launch of the same action.
#[derive(Debug, Clone, Serialize)]
pub struct MachineInstance<I, P> {
    pub current_state: StateKey,
    pub desired_states: Vec<StateKey>,
    pub in_progress: Option<StateKey>,
    pub internal: I,
    pub public: P,
    /// Tokens of callers waiting for arrival at a state, keyed by that
    /// state. Tokens only: the live waiters sit in a side table.
    pub on_enter_waiters: HashMap<StateKey, Vec<WaiterToken>>,
    pub last_transition_at: DateTime<Utc>,
    pub history: VecDeque<TransitionRecord>,
}

impl<I, P> MachineInstance<I, P>
where
    I: InternalData,
    P: PublicData,
{
    /// Create an instance at a template's initial state, optionally
    /// overriding the seed values.
    pub fn from_template<C>(
        template: &Template<I, P, C>,
        desired: Option<Vec<StateKey>>,
        internal: Option<I>,
        public: Option<P>,
    ) -> Self {
        Self {
            current_state: template.initial_state(),
            desired_states: desired.unwrap_or_else(|| template.initial_desired().to_vec()),
            in_progress: None,
            internal: internal.unwrap_or_else(|| template.initial_internal()),
            public: public.unwrap_or_else(|| template.initial_public()),
            on_enter_waiters: HashMap::new(),
            last_transition_at: Utc::now(),
            history: VecDeque::new(),
        }
    }

    /// Whether the machine has reached one of its desired states.
    pub fn converged(&self) -> bool {
        self.desired_states.contains(&self.current_state)
    }

    /// Whether the next heartbeat should tick this instance.
    ///
    /// Converged instances are skipped unless they sit on a redirect node:
    /// redirect fires unconditionally, even when already converged.
    pub fn needs_attention<C>(&self, template: &Template<I, P, C>) -> bool {
        if !self.converged() {
            return true;
        }
        matches!(
            template.node(self.current_state),
            Some(crate::template::Node::Redirect { .. })
        )
    }

    /// A cloned read view of the record.
    pub fn snapshot(&self) -> Snapshot<I, P> {
        Snapshot {
            current_state: self.current_state,
            desired_states: self.desired_states.clone(),
            in_progress: self.in_progress,
            internal: self.internal.clone(),
            public: self.public.clone(),
        }
    }

    /// Record a transition in the bounded history. A `history_limit` of 0
    /// disables recording; same-state changes (attempt launch marks) are
    /// not recorded.
    pub fn record_transition(&mut self, from: StateKey, history_limit: usize) {
        self.last_transition_at = Utc::now();
        if history_limit == 0 || from == self.current_state {
            return;
        }
        self.history.push_back(TransitionRecord {
            from,
            to: self.current_state,
            at: self.last_transition_at,
        });
        while self.history.len() > history_limit {
            self.history.pop_front();
        }
    }

    /// Remove and return the tokens parked under `state`, clearing each of
    /// them from every other state's list as well.
    pub fn take_waiters_for(&mut self, state: StateKey) -> Vec<WaiterToken> {
        let Some(tokens) = self.on_enter_waiters.remove(&state) else {
            return Vec::new();
        };
        for parked in self.on_enter_waiters.values_mut() {
            parked.retain(|token| !tokens.contains(token));
        }
        self.on_enter_waiters.retain(|_, parked| !parked.is_empty());
        tokens
    }

    /// Remove one token from every state's list.
    pub fn remove_waiter(&mut self, token: WaiterToken) {
        for parked in self.on_enter_waiters.values_mut() {
            parked.retain(|candidate| *candidate != token);
        }
        self.on_enter_waiters.retain(|_, parked| !parked.is_empty());
    }
}

/// A cloned, read-only view of one instance, consumed by the step engine
/// and exposed by the instance-store adapters.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot<I, P> {
    pub current_state: StateKey,
    pub desired_states: Vec<StateKey>,
    pub in_progress: Option<StateKey>,
    pub internal: I,
    pub public: P,
}

impl<I, P> Snapshot<I, P> {
    pub fn converged(&self) -> bool {
        self.desired_states.contains(&self.current_state)
    }
}
