//! The singleton instance-store adapter: one template, one machine, alive
//! for the process lifetime.
//!
//! This is the variant used by lifecycles that exist exactly once per
//! process (a connection, a session). Beyond the common surface it exposes
//! `on_enter`: await "this machine has reached one of these states" without
//! putting a live promise into the serializable record.

use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use tracing::{debug, info};

use crate::engine::{tick, InProgressMark, StateChange, StepEffects, TickOutcome};
use crate::error::WaitError;
use crate::heartbeat::Heartbeat;
use crate::instance::{InternalData, MachineInstance, PublicData, Snapshot};
use crate::store::{mutex_lock, read_lock, write_lock, FamilyReport, IterationSummary, MachineFamily, StoreOptions};
use crate::template::{StateKey, Template};
use crate::waiters::{Arrival, WaiterCache, WaiterToken};

/// The shared mutation sink: everything the engine (and the adapter's own
/// entry points) dispatch lands here. Settle tasks hold a clone, so this
/// outlives any one tick.
struct SingleEffects<I, P> {
    family: String,
    record: Arc<RwLock<MachineInstance<I, P>>>,
    waiters: Arc<Mutex<WaiterCache<I, P>>>,
    heartbeat: Heartbeat,
    history_limit: usize,
}

impl<I, P> StepEffects<I, P> for SingleEffects<I, P>
where
    I: InternalData,
    P: PublicData,
{
    fn change_state(&self, change: StateChange<I, P>) {
        let mut record = write_lock(&self.record);
        let from = record.current_state;
        record.current_state = change.to;
        match change.in_progress {
            InProgressMark::Keep => {}
            InProgressMark::Set(state) => record.in_progress = Some(state),
            InProgressMark::Clear => record.in_progress = None,
        }
        if let Some(patch) = change.patch {
            if let Some(internal) = patch.internal {
                record.internal = internal;
            }
            if let Some(public) = patch.public {
                record.public = public;
            }
        }
        record.record_transition(from, self.history_limit);

        if from != record.current_state {
            info!(
                machine = %self.family,
                from = %from,
                to = %record.current_state,
                "state transition"
            );
        }

        // Resolve any waiters parked under the state we just landed on.
        // Lock order: record, then waiter cache.
        let landed = record.current_state;
        let tokens = record.take_waiters_for(landed);
        if !tokens.is_empty() {
            let arrival = Arrival {
                state: landed,
                internal: record.internal.clone(),
                public: record.public.clone(),
            };
            let mut waiters = mutex_lock(&self.waiters);
            for token in tokens {
                debug!(machine = %self.family, state = %landed, token = %token, "waiter resolved");
                waiters.resolve(token, arrival.clone());
            }
        }
    }

    fn change_intent(&self, new_intent: Vec<StateKey>) {
        let mut record = write_lock(&self.record);
        info!(
            machine = %self.family,
            desired = ?new_intent,
            "intent changed"
        );
        record.desired_states = new_intent;
    }

    fn pulse(&self) {
        self.heartbeat.pulse();
    }
}

/// The singleton state-seeking machine adapter.
pub struct SingleMachine<I, P, C> {
    template: Arc<Template<I, P, C>>,
    context: C,
    effects: Arc<SingleEffects<I, P>>,
    heartbeat: Heartbeat,
}

impl<I, P, C> SingleMachine<I, P, C>
where
    I: InternalData,
    P: PublicData,
    C: Send + Sync + 'static,
{
    /// Create the machine at the template's initial state and desired list.
    pub fn new(
        template: Template<I, P, C>,
        context: C,
        heartbeat: Heartbeat,
        options: StoreOptions,
    ) -> Self {
        let record = MachineInstance::from_template(&template, None, None, None);
        let effects = Arc::new(SingleEffects {
            family: template.name().to_string(),
            record: Arc::new(RwLock::new(record)),
            waiters: Arc::new(Mutex::new(WaiterCache::new())),
            heartbeat: heartbeat.clone(),
            history_limit: options.history_limit,
        });
        Self {
            template: Arc::new(template),
            context,
            effects,
            heartbeat,
        }
    }

    /// Replace the desired-state list and request a reschedule.
    pub fn set_intent(&self, desired: Vec<StateKey>) {
        self.effects.change_intent(desired);
        self.heartbeat.pulse();
    }

    /// The sole mutation point the step engine dispatches through. Exposed
    /// so domain drivers wired around the adapter can apply a described
    /// change themselves; all the invariants (transition logging, waiter
    /// resolution, history) live behind it.
    pub fn internal_state_change(&self, change: StateChange<I, P>) {
        self.effects.change_state(change);
    }

    /// Run a caller-supplied reducer over the public half of the payload.
    /// The closure never sees the internal half; that is the API boundary,
    /// not a convention.
    pub fn update_public<R>(&self, reducer: impl FnOnce(&mut P) -> R) -> R {
        let result = {
            let mut record = write_lock(&self.effects.record);
            reducer(&mut record.public)
        };
        self.heartbeat.pulse();
        result
    }

    /// Run a caller-supplied selector over the public half of the payload.
    pub fn read_public<R>(&self, selector: impl FnOnce(&P) -> R) -> R {
        let record = read_lock(&self.effects.record);
        selector(&record.public)
    }

    pub fn snapshot(&self) -> Snapshot<I, P> {
        read_lock(&self.effects.record).snapshot()
    }

    /// Await arrival at one of `acceptable`. Resolves immediately if the
    /// machine is already there; otherwise parks a waiter token under each
    /// acceptable state and waits for `internal_state_change` to land on
    /// one of them.
    pub async fn on_enter(&self, acceptable: &[StateKey]) -> Result<Arrival<I, P>, WaitError> {
        let (token, receiver) = {
            let mut record = write_lock(&self.effects.record);
            if acceptable.contains(&record.current_state) {
                return Ok(Arrival {
                    state: record.current_state,
                    internal: record.internal.clone(),
                    public: record.public.clone(),
                });
            }
            let mut waiters = mutex_lock(&self.effects.waiters);
            let (token, receiver) = waiters.park();
            for state in acceptable {
                record
                    .on_enter_waiters
                    .entry(*state)
                    .or_default()
                    .push(token);
            }
            debug!(
                machine = %self.template.name(),
                states = ?acceptable,
                token = %token,
                "waiter parked"
            );
            (token, receiver)
        };
        // If the caller abandons the wait (timeout, aborted task) the guard
        // clears the parked token; after a normal resolution the clear
        // finds nothing to remove.
        let _guard = WaiterGuard {
            machine: self,
            token,
        };
        receiver.await.map_err(|_| WaitError::Cleared)
    }

    /// Drop a parked waiter; its future resolves to [`WaitError::Cleared`].
    pub fn clear_on_enter(&self, token: WaiterToken) {
        let mut record = write_lock(&self.effects.record);
        record.remove_waiter(token);
        let mut waiters = mutex_lock(&self.effects.waiters);
        if waiters.clear(token) {
            debug!(machine = %self.template.name(), token = %token, "waiter cleared");
        }
    }

    /// Tokens currently parked under `state`.
    pub fn parked_waiters(&self, state: StateKey) -> Vec<WaiterToken> {
        read_lock(&self.effects.record)
            .on_enter_waiters
            .get(&state)
            .cloned()
            .unwrap_or_default()
    }

    /// Run one engine tick if the machine needs attention. Called by the
    /// iteration driver on every heartbeat.
    pub fn iterate(&self) -> IterationSummary {
        let mut summary = IterationSummary::default();
        let snapshot = {
            let record = read_lock(&self.effects.record);
            if !record.needs_attention(&self.template) {
                return summary;
            }
            record.snapshot()
        };
        let effects = Arc::clone(&self.effects) as Arc<dyn StepEffects<I, P>>;
        let outcome = tick(&self.template, &snapshot, &effects, &self.context);
        summary.absorb(&outcome);
        summary
    }

    /// Tick once and hand back the outcome, for callers that drive the
    /// machine directly (tests, diagnostics).
    pub fn tick_once(&self) -> TickOutcome {
        let snapshot = self.snapshot();
        let effects = Arc::clone(&self.effects) as Arc<dyn StepEffects<I, P>>;
        tick(&self.template, &snapshot, &effects, &self.context)
    }

    pub fn status_report(&self) -> FamilyReport {
        let record = read_lock(&self.effects.record);
        FamilyReport {
            family: self.template.name().to_string(),
            generated_at: Utc::now(),
            instances: 1,
            converged: usize::from(record.converged()),
            in_flight: usize::from(record.in_progress.is_some()),
        }
    }
}

/// Unparks an `on_enter` token when its awaiting caller goes away before
/// arrival, so abandoned waits never accumulate tokens under states the
/// machine may not enter.
struct WaiterGuard<'a, I, P, C>
where
    I: InternalData,
    P: PublicData,
    C: Send + Sync + 'static,
{
    machine: &'a SingleMachine<I, P, C>,
    token: WaiterToken,
}

impl<I, P, C> Drop for WaiterGuard<'_, I, P, C>
where
    I: InternalData,
    P: PublicData,
    C: Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.machine.clear_on_enter(self.token);
    }
}

impl<I, P, C> MachineFamily for SingleMachine<I, P, C>
where
    I: InternalData,
    P: PublicData,
    C: Send + Sync + 'static,
{
    fn family_name(&self) -> &str {
        self.template.name()
    }

    fn iterate(&self) -> IterationSummary {
        SingleMachine::iterate(self)
    }
}
