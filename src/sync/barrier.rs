//! Reusable rendezvous for a fixed number of participants.

use super::spinlock::SpinCell;
use crate::event::{Event, EventBackend};
use core::time::Duration;
use std::sync::Arc;

struct Generation {
    arrived: usize,
    number: u64,
    gate: Arc<Event>,
}

pub struct Barrier {
    count: usize,
    backend: EventBackend,
    state: SpinCell<Generation>,
}

/// Returned to every participant of a released generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BarrierWaitResult {
    is_leader: bool,
}

impl BarrierWaitResult {
    /// `true` for exactly one participant per generation: the last to arrive.
    pub fn is_leader(&self) -> bool {
        self.is_leader
    }
}

impl Barrier {
    /// A barrier for `count` participants. A count of zero behaves like one.
    pub fn new(count: usize) -> Self {
        Self::with_backend(count, EventBackend::detect())
    }

    pub fn with_backend(count: usize, backend: EventBackend) -> Self {
        Self {
            count: count.max(1),
            backend,
            state: SpinCell::new(Generation {
                arrived: 0,
                number: 0,
                gate: Arc::new(Event::with_backend(backend, true)),
            }),
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Participants waiting in the current generation.
    pub fn arrived(&self) -> usize {
        self.state.with(|g| g.arrived)
    }

    /// Block until `count` participants have arrived.
    pub fn wait(&self) -> BarrierWaitResult {
        match self.arrive() {
            Ok(result) => result,
            Err((_, gate)) => {
                gate.wait();
                BarrierWaitResult { is_leader: false }
            }
        }
    }

    /// Like [`wait`](Self::wait), but give up after `timeout`. A participant
    /// that gives up no longer counts towards the current generation.
    pub fn wait_timed(&self, timeout: Duration) -> Option<BarrierWaitResult> {
        let (number, gate) = match self.arrive() {
            Ok(result) => return Some(result),
            Err(pending) => pending,
        };
        if gate.wait_timed(timeout) {
            return Some(BarrierWaitResult { is_leader: false });
        }
        self.state.with(|g| {
            if g.number == number {
                g.arrived -= 1;
                None
            } else {
                Some(BarrierWaitResult { is_leader: false })
            }
        })
    }

    /// Count the caller in. The last arrival opens the gate and starts the
    /// next generation; everyone else gets the gate to wait on.
    fn arrive(&self) -> Result<BarrierWaitResult, (u64, Arc<Event>)> {
        let released = self.state.with(|g| {
            g.arrived += 1;
            if g.arrived < self.count {
                return Err((g.number, g.gate.clone()));
            }
            g.arrived = 0;
            g.number = g.number.wrapping_add(1);
            let fresh = Arc::new(Event::with_backend(self.backend, true));
            Ok(core::mem::replace(&mut g.gate, fresh))
        })?;
        released.set(false);
        Ok(BarrierWaitResult { is_leader: true })
    }
}

impl core::fmt::Debug for Barrier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Barrier")
            .field("count", &self.count)
            .field("arrived", &self.arrived())
            .finish()
    }
}
