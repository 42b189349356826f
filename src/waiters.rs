//! The side table that lets callers await "this machine has reached one of
//! these states".
//!
//! Live waiters must never sit inside the serializable instance record, so
//! the record stores only opaque [`WaiterToken`]s and this cache maps each
//! token to the sender that completes the caller's future. Resolving or
//! clearing a token consumes its entry.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::template::StateKey;

/// Opaque handle on one parked waiter; the only waiter-related value stored
/// in shared state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct WaiterToken(Uuid);

impl WaiterToken {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for WaiterToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What a resolved waiter receives: the state the machine landed on plus
/// both halves of its payload at arrival time.
#[derive(Debug, Clone)]
pub struct Arrival<I, P> {
    pub state: StateKey,
    pub internal: I,
    pub public: P,
}

/// Token-to-sender side table, fully outside the instance record.
pub struct WaiterCache<I, P> {
    entries: HashMap<WaiterToken, oneshot::Sender<Arrival<I, P>>>,
}

impl<I, P> fmt::Debug for WaiterCache<I, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaiterCache")
            .field("parked", &self.entries.len())
            .finish()
    }
}

impl<I, P> Default for WaiterCache<I, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I, P> WaiterCache<I, P> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Park a new waiter, returning its token and the receiving end of its
    /// future.
    pub fn park(&mut self) -> (WaiterToken, oneshot::Receiver<Arrival<I, P>>) {
        let token = WaiterToken::new();
        let (tx, rx) = oneshot::channel();
        self.entries.insert(token, tx);
        (token, rx)
    }

    /// Complete a parked waiter. Returns false if the token was unknown or
    /// its receiver already dropped.
    pub fn resolve(&mut self, token: WaiterToken, arrival: Arrival<I, P>) -> bool {
        match self.entries.remove(&token) {
            Some(sender) => sender.send(arrival).is_ok(),
            None => false,
        }
    }

    /// Drop a parked waiter without completing it; its future resolves to
    /// an error. Returns whether the token was known.
    pub fn clear(&mut self, token: WaiterToken) -> bool {
        self.entries.remove(&token).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
