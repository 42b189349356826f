//! The reference iteration driver.
//!
//! The core exposes only "request a reschedule" (a heartbeat pulse); this
//! driver is the loop that subscribes to those pulses and runs one iteration
//! pass over every registered machine family per wake. Hosts with their own
//! scheduling (a reactive store subscription, a periodic effect) can ignore
//! it and call the families' `iterate` entry points themselves.

use std::sync::Arc;

use tracing::{debug, info};

use crate::heartbeat::Heartbeat;
use crate::store::{IterationSummary, MachineFamily};

/// Drives every registered family once per heartbeat pulse.
pub struct ConvergenceDriver {
    heartbeat: Heartbeat,
    families: Vec<Arc<dyn MachineFamily>>,
}

impl ConvergenceDriver {
    pub fn new(heartbeat: Heartbeat) -> Self {
        Self {
            heartbeat,
            families: Vec::new(),
        }
    }

    pub fn register(&mut self, family: Arc<dyn MachineFamily>) {
        info!(family = %family.family_name(), "machine family registered");
        self.families.push(family);
    }

    /// One iteration pass: tick every family once.
    pub fn run_once(&self) -> IterationSummary {
        let mut total = IterationSummary::default();
        for family in &self.families {
            let summary = family.iterate();
            if summary.ticked > 0 {
                debug!(
                    family = %family.family_name(),
                    ticked = summary.ticked,
                    moved = summary.moved,
                    launched = summary.launched,
                    "iteration pass"
                );
            }
            total.ticked += summary.ticked;
            total.moved += summary.moved;
            total.launched += summary.launched;
        }
        total
    }

    /// Loop forever: wait for a pulse, run one pass. Callers spawn this and
    /// abort the task to stop driving.
    pub async fn run(self) {
        info!(families = self.families.len(), "convergence driver running");
        loop {
            self.heartbeat.ticked().await;
            self.run_once();
        }
    }
}
