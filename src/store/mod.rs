//! Instance-store adapters: the components that own machine records and
//! bind a template to them.
//!
//! Two variants share the same mutation discipline. [`SingleMachine`] owns
//! exactly one instance for the process lifetime; [`MachineSet`] owns a
//! keyed collection whose entries are created explicitly and never by
//! iteration. In both, every mutation flows through the adapter's
//! designated entry points, which is what gives the engine its single-writer
//! guarantee per tick even though readers run concurrently.
//!
//! Records live behind `std::sync::RwLock` with short, never-awaiting
//! critical sections, so the mutation entry points are callable from both
//! sync callers and spawned settle tasks. Lock order where both are taken:
//! record before waiter cache.

mod keyed;
mod single;

pub use keyed::MachineSet;
pub use single::SingleMachine;

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::TickOutcome;
use crate::template::StateKey;

/// Tuning knobs shared by both adapter variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreOptions {
    /// Retained transition records per instance; 0 disables history.
    pub history_limit: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self { history_limit: 32 }
    }
}

/// Per-instance overrides of a template's initial values, used when adding
/// an item to a [`MachineSet`].
#[derive(Debug, Clone, Default)]
pub struct AddItemOptions<I, P> {
    pub desired: Option<Vec<StateKey>>,
    pub internal: Option<I>,
    pub public: Option<P>,
}

impl<I, P> AddItemOptions<I, P> {
    pub fn new() -> Self {
        Self {
            desired: None,
            internal: None,
            public: None,
        }
    }

    pub fn with_desired(mut self, desired: impl IntoIterator<Item = StateKey>) -> Self {
        self.desired = Some(desired.into_iter().collect());
        self
    }

    pub fn with_internal(mut self, internal: I) -> Self {
        self.internal = Some(internal);
        self
    }

    pub fn with_public(mut self, public: P) -> Self {
        self.public = Some(public);
        self
    }
}

/// What one iteration pass over a family did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IterationSummary {
    /// Instances handed to the step engine.
    pub ticked: usize,
    /// Ticks that moved an instance one edge.
    pub moved: usize,
    /// Ticks that launched an attempt action.
    pub launched: usize,
}

impl IterationSummary {
    pub(crate) fn absorb(&mut self, outcome: &TickOutcome) {
        self.ticked += 1;
        match outcome {
            TickOutcome::Moved(_) => self.moved += 1,
            TickOutcome::Redirected { moved: Some(_) } => self.moved += 1,
            TickOutcome::Launched(_) => self.launched += 1,
            TickOutcome::Converged
            | TickOutcome::Stuck
            | TickOutcome::Holding
            | TickOutcome::InFlight
            | TickOutcome::Redirected { moved: None } => {}
        }
    }
}

/// Point-in-time status of one machine family, for logs and diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct FamilyReport {
    pub family: String,
    pub generated_at: DateTime<Utc>,
    pub instances: usize,
    pub converged: usize,
    pub in_flight: usize,
}

/// One registered machine family, as the iteration driver sees it: a name
/// and an entry point that runs one engine tick per instance needing
/// attention.
pub trait MachineFamily: Send + Sync {
    fn family_name(&self) -> &str;
    fn iterate(&self) -> IterationSummary;
}

// Poisoning means a panicked writer, which the engine's no-panic policy
// already excludes; recover the guard rather than propagate the panic.
pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn mutex_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}
