//! The keyed-collection instance-store adapter: one template, many machines
//! addressed by an arbitrary key.
//!
//! Instances are created explicitly with `add_item` and never implicitly by
//! iteration. Each instance converges independently; there is no
//! cross-instance ordering or locking, so a slow attempt on one key never
//! stalls another.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::engine::{tick, InProgressMark, StateChange, StepEffects, TickOutcome};
use crate::error::StoreError;
use crate::heartbeat::Heartbeat;
use crate::instance::{InternalData, MachineInstance, PublicData, Snapshot};
use crate::store::{read_lock, write_lock, AddItemOptions, FamilyReport, IterationSummary, MachineFamily, StoreOptions};
use crate::template::{StateKey, Template};

/// Mutation sink for one key. Built per tick and cloned into settle tasks;
/// a settle that arrives after its key was removed is discarded.
struct KeyedEffects<K, I, P> {
    family: String,
    key: K,
    instances: Arc<RwLock<HashMap<K, MachineInstance<I, P>>>>,
    heartbeat: Heartbeat,
    history_limit: usize,
}

impl<K, I, P> StepEffects<I, P> for KeyedEffects<K, I, P>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    I: InternalData,
    P: PublicData,
{
    fn change_state(&self, change: StateChange<I, P>) {
        let mut instances = write_lock(&self.instances);
        let Some(record) = instances.get_mut(&self.key) else {
            warn!(
                machine = %self.family,
                key = ?self.key,
                to = %change.to,
                "state change for removed instance discarded"
            );
            return;
        };
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
                key = ?self.key,
                from = %from,
                to = %record.current_state,
                "state transition"
            );
        }
    }

    fn change_intent(&self, new_intent: Vec<StateKey>) {
        let mut instances = write_lock(&self.instances);
        let Some(record) = instances.get_mut(&self.key) else {
            warn!(
                machine = %self.family,
                key = ?self.key,
                "intent change for removed instance discarded"
            );
            return;
        };
        info!(
            machine = %self.family,
            key = ?self.key,
            desired = ?new_intent,
            "intent changed"
        );
        record.desired_states = new_intent;
    }

    fn pulse(&self) {
        self.heartbeat.pulse();
    }
}

/// The keyed-collection state-seeking machine adapter.
pub struct MachineSet<K, I, P, C> {
    template: Arc<Template<I, P, C>>,
    context: C,
    instances: Arc<RwLock<HashMap<K, MachineInstance<I, P>>>>,
    heartbeat: Heartbeat,
    options: StoreOptions,
}

impl<K, I, P, C> MachineSet<K, I, P, C>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    I: InternalData,
    P: PublicData,
    C: Send + Sync + 'static,
{
    pub fn new(
        template: Template<I, P, C>,
        context: C,
        heartbeat: Heartbeat,
        options: StoreOptions,
    ) -> Self {
        Self {
            template: Arc::new(template),
            context,
            instances: Arc::new(RwLock::new(HashMap::new())),
            heartbeat,
            options,
        }
    }

    /// Start tracking a new key at the template's initial state. A no-op if
    /// the key is already tracked. Returns whether an instance was created.
    pub fn add_item(&self, key: K, options: AddItemOptions<I, P>) -> bool {
        let created = {
            let mut instances = write_lock(&self.instances);
            if instances.contains_key(&key) {
                debug!(
                    machine = %self.template.name(),
                    key = ?key,
                    "add_item for already-tracked key ignored"
                );
                false
            } else {
                let record = MachineInstance::from_template(
                    &self.template,
                    options.desired,
                    options.internal,
                    options.public,
                );
                info!(
                    machine = %self.template.name(),
                    key = ?key,
                    state = %record.current_state,
                    desired = ?record.desired_states,
                    "instance added"
                );
                instances.insert(key, record);
                true
            }
        };
        if created {
            self.heartbeat.pulse();
        }
        created
    }

    /// Stop tracking a key. Any in-flight attempt for it runs to completion
    /// and its settle is discarded. Returns whether an instance existed.
    pub fn remove_item(&self, key: &K) -> bool {
        let removed = write_lock(&self.instances).remove(key).is_some();
        if removed {
            info!(machine = %self.template.name(), key = ?key, "instance removed");
        }
        removed
    }

    /// Replace one instance's desired-state list and request a reschedule.
    pub fn set_intent(&self, key: &K, desired: Vec<StateKey>) -> Result<(), StoreError> {
        {
            let mut instances = write_lock(&self.instances);
            let record = instances.get_mut(key).ok_or_else(|| StoreError::UnknownKey {
                key: format!("{key:?}"),
            })?;
            info!(
                machine = %self.template.name(),
                key = ?key,
                desired = ?desired,
                "intent changed"
            );
            record.desired_states = desired;
        }
        self.heartbeat.pulse();
        Ok(())
    }

    /// The keyed variant of the sole mutation point the engine uses.
    pub fn internal_state_change(&self, key: &K, change: StateChange<I, P>) {
        self.effects_for(key.clone()).change_state(change);
    }

    /// Run a caller-supplied reducer over one instance's public half.
    pub fn update_public<R>(
        &self,
        key: &K,
        reducer: impl FnOnce(&mut P) -> R,
    ) -> Result<R, StoreError> {
        let result = {
            let mut instances = write_lock(&self.instances);
            let record = instances.get_mut(key).ok_or_else(|| StoreError::UnknownKey {
                key: format!("{key:?}"),
            })?;
            reducer(&mut record.public)
        };
        self.heartbeat.pulse();
        Ok(result)
    }

    /// Run a caller-supplied selector over one instance's public half.
    pub fn read_public<R>(&self, key: &K, selector: impl FnOnce(&P) -> R) -> Result<R, StoreError> {
        let instances = read_lock(&self.instances);
        let record = instances.get(key).ok_or_else(|| StoreError::UnknownKey {
            key: format!("{key:?}"),
        })?;
        Ok(selector(&record.public))
    }

    pub fn snapshot(&self, key: &K) -> Result<Snapshot<I, P>, StoreError> {
        let instances = read_lock(&self.instances);
        instances
            .get(key)
            .map(MachineInstance::snapshot)
            .ok_or_else(|| StoreError::UnknownKey {
                key: format!("{key:?}"),
            })
    }

    pub fn contains(&self, key: &K) -> bool {
        read_lock(&self.instances).contains_key(key)
    }

    pub fn keys(&self) -> Vec<K> {
        read_lock(&self.instances).keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        read_lock(&self.instances).len()
    }

    pub fn is_empty(&self) -> bool {
        read_lock(&self.instances).is_empty()
    }

    /// Run one independent engine tick per instance needing attention.
    pub fn iterate(&self) -> IterationSummary {
        let mut summary = IterationSummary::default();
        let pending: Vec<(K, Snapshot<I, P>)> = {
            let instances = read_lock(&self.instances);
            instances
                .iter()
                .filter(|(_, record)| record.needs_attention(&self.template))
                .map(|(key, record)| (key.clone(), record.snapshot()))
                .collect()
        };
        for (key, snapshot) in pending {
            let effects = Arc::new(self.effects_for(key)) as Arc<dyn StepEffects<I, P>>;
            let outcome = tick(&self.template, &snapshot, &effects, &self.context);
            summary.absorb(&outcome);
        }
        summary
    }

    /// Tick one instance and hand back the outcome, for callers that drive
    /// a machine directly.
    pub fn tick_once(&self, key: &K) -> Result<TickOutcome, StoreError> {
        let snapshot = self.snapshot(key)?;
        let effects = Arc::new(self.effects_for(key.clone())) as Arc<dyn StepEffects<I, P>>;
        Ok(tick(&self.template, &snapshot, &effects, &self.context))
    }

    pub fn status_report(&self) -> FamilyReport {
        let instances = read_lock(&self.instances);
        FamilyReport {
            family: self.template.name().to_string(),
            generated_at: Utc::now(),
            instances: instances.len(),
            converged: instances.values().filter(|r| r.converged()).count(),
            in_flight: instances
                .values()
                .filter(|r| r.in_progress.is_some())
                .count(),
        }
    }

    fn effects_for(&self, key: K) -> KeyedEffects<K, I, P> {
        KeyedEffects {
            family: self.template.name().to_string(),
            key,
            instances: Arc::clone(&self.instances),
            heartbeat: self.heartbeat.clone(),
            history_limit: self.options.history_limit,
        }
    }
}

impl<K, I, P, C> MachineFamily for MachineSet<K, I, P, C>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    I: InternalData,
    P: PublicData,
    C: Send + Sync + 'static,
{
    fn family_name(&self) -> &str {
        self.template.name()
    }

    fn iterate(&self) -> IterationSummary {
        MachineSet::iterate(self)
    }
}
