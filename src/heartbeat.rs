//! The edge-triggered reschedule signal.
//!
//! Every mutation that might unblock further progress dispatches one pulse;
//! the iteration driver awaits pulses and re-runs every registered machine
//! family once per wake. There is no polling loop and no timer: if nothing
//! pulses, nothing runs.

use std::sync::Arc;

use tokio::sync::Notify;
use tracing::trace;

/// A cheap-to-clone handle on the reschedule channel.
///
/// Pulses coalesce: any number of `pulse()` calls between two wakes result
/// in exactly one wake, which is all an edge-triggered scheduler needs.
#[derive(Debug, Clone, Default)]
pub struct Heartbeat {
    notify: Arc<Notify>,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request one reschedule pass.
    pub fn pulse(&self) {
        trace!("heartbeat pulse");
        self.notify.notify_one();
    }

    /// Wait until at least one pulse has been dispatched since the last
    /// wake (or since this call, if none is pending).
    pub async fn ticked(&self) {
        self.notify.notified().await;
    }
}
