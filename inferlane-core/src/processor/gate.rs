//! Adjustable concurrency limit for executions.
//!
//! Unlike a fixed semaphore the limit can move while permits are out:
//! shrinking never revokes a running slot, it only holds back new ones until
//! enough in-flight work has finished.
//!
//! A permit counts towards `active` from the moment it is taken, but only
//! towards `running` once [`SlotPermit::mark_running`] is called. The
//! dispatcher holds one unmarked permit while it waits for the queue.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

#[derive(Debug)]
struct GateState {
    limit: usize,
    ceiling: usize,
    active: usize,
    running: usize,
}

pub struct ConcurrencyGate {
    state: Mutex<GateState>,
    changed: Notify,
}

impl fmt::Debug for ConcurrencyGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("ConcurrencyGate");
        match self.state.try_lock() {
            Ok(state) => {
                debug
                    .field("limit", &state.limit)
                    .field("ceiling", &state.ceiling)
                    .field("active", &state.active)
                    .field("running", &state.running);
            }
            Err(_) => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

/// Snapshot of the gate's counters.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GateSnapshot {
    pub limit: usize,
    pub ceiling: usize,
    /// Slots taken, including one the dispatcher may be holding in reserve.
    pub active: usize,
    /// Slots whose execution has started.
    pub running: usize,
}

impl ConcurrencyGate {
    pub fn new(initial: usize, ceiling: usize) -> Self {
        let ceiling = ceiling.max(1);
        Self {
            state: Mutex::new(GateState {
                limit: initial.clamp(1, ceiling),
                ceiling,
                active: 0,
                running: 0,
            }),
            changed: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> GateSnapshot {
        let state = self.state();
        GateSnapshot {
            limit: state.limit,
            ceiling: state.ceiling,
            active: state.active,
            running: state.running,
        }
    }

    pub fn limit(&self) -> usize {
        self.state().limit
    }

    pub fn active(&self) -> usize {
        self.state().active
    }

    pub fn running(&self) -> usize {
        self.state().running
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<SlotPermit> {
        let mut state = self.state();
        if state.active < state.limit {
            state.active += 1;
            Some(SlotPermit {
                gate: Arc::clone(self),
                running: false,
            })
        } else {
            None
        }
    }

    /// Waits until a slot is free under the current limit.
    pub async fn acquire(self: &Arc<Self>) -> SlotPermit {
        loop {
            let notified = self.changed.notified();
            if let Some(permit) = self.try_acquire() {
                return permit;
            }
            notified.await;
        }
    }

    /// Sets the limit, clamped to `1..=ceiling`. Returns `(old, new)`.
    pub fn set_limit(&self, limit: usize) -> (usize, usize) {
        let (old, new) = {
            let mut state = self.state();
            let old = state.limit;
            state.limit = limit.clamp(1, state.ceiling);
            (old, state.limit)
        };
        if new > old {
            self.changed.notify_one();
        }
        (old, new)
    }

    /// Moves the limit by whatever `step(limit, ceiling)` returns, reading and
    /// writing under one lock so concurrent callers compose. Returns
    /// `(old, new)` when `step` asked for a change.
    pub fn adjust<F>(&self, step: F) -> Option<(usize, usize)>
    where
        F: FnOnce(usize, usize) -> Option<usize>,
    {
        let (old, new) = {
            let mut state = self.state();
            let target = step(state.limit, state.ceiling)?;
            let old = state.limit;
            state.limit = target.clamp(1, state.ceiling);
            (old, state.limit)
        };
        if new > old {
            self.changed.notify_one();
        }
        Some((old, new))
    }

    /// Manual override: sets the limit and lifts the ceiling if needed.
    pub fn force_limit(&self, limit: usize) -> (usize, usize) {
        let limit = limit.max(1);
        {
            let mut state = self.state();
            if limit > state.ceiling {
                state.ceiling = limit;
            }
        }
        self.set_limit(limit)
    }

    fn release(&self, running: bool) {
        {
            let mut state = self.state();
            state.active = state.active.saturating_sub(1);
            if running {
                state.running = state.running.saturating_sub(1);
            }
        }
        self.changed.notify_one();
    }
}

/// One execution slot. Dropping it frees the slot.
pub struct SlotPermit {
    gate: Arc<ConcurrencyGate>,
    running: bool,
}

impl SlotPermit {
    /// Counts this slot as running an execution until it is dropped.
    pub fn mark_running(&mut self) {
        if !self.running {
            self.running = true;
            self.gate.state().running += 1;
        }
    }
}

impl fmt::Debug for SlotPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotPermit")
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.gate.release(self.running);
    }
}
