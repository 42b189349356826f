//! stateseek: a generic, declarative state-seeking machine engine.
//!
//! A template describes a machine family as a graph of named states; each
//! instance is driven toward a caller-specified set of desired states one
//! small step at a time, with a shortest-path planner deciding which edge
//! to take next. Scheduling is edge-triggered: every mutation that might
//! unblock progress dispatches a heartbeat pulse, and an iteration driver
//! ticks every registered family once per pulse. Convergence happens as a
//! chain of micro-steps, not a single recursive call.

pub mod driver;
pub mod engine;
pub mod error;
pub mod heartbeat;
pub mod instance;
pub mod planner;
pub mod store;
pub mod template;
pub mod waiters;

// Re-export key types for easy access
pub use driver::ConvergenceDriver;
pub use engine::{tick, InProgressMark, StateChange, StepEffects, TickOutcome};
pub use error::{StoreError, TemplateError, WaitError};
pub use heartbeat::Heartbeat;
pub use instance::{
    DataPatch, InternalData, MachineInstance, PublicData, Snapshot, TransitionRecord,
};
pub use planner::plan;
pub use store::{
    AddItemOptions, FamilyReport, IterationSummary, MachineFamily, MachineSet, SingleMachine,
    StoreOptions,
};
pub use template::{AttemptAction, HoldCondition, Node, StateKey, Template, TemplateBuilder};
pub use waiters::{Arrival, WaiterCache, WaiterToken};
