//! Online connection limit.
//!
//! [`ConnectionLimiter`] counts connections with an atomic counter. A slot is
//! reserved before the upgrade request is parsed and held, as a
//! [`ConnectionGuard`], until the agent is done with the connection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared connection counter with an upper bound. A bound of `0` disables
/// the limit.
#[derive(Debug, Clone)]
pub struct ConnectionLimiter {
    max: usize,
    active: Arc<AtomicUsize>,
}

impl ConnectionLimiter {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Reserve a slot, or `None` when the limit is reached. The check and the
    /// increment are one atomic step, so concurrent handshakes cannot
    /// overshoot the bound.
    pub fn try_acquire(&self) -> Option<ConnectionGuard> {
        let max = self.max;
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (max == 0 || n < max).then_some(n + 1)
            })
            .ok()?;
        Some(ConnectionGuard {
            counter: self.active.clone(),
        })
    }

    /// Current number of counted connections.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// RAII guard that releases its slot on drop. `Send`, so it can move into
/// the connection's task.
pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
