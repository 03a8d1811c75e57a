//! Executive groups: time-budgeted scheduling domains for fibers.
//!
//! A group gives its fibers a per-pulse execution budget. A fiber that calls
//! [`Fiber::yield_proc`](crate::Fiber::yield_proc) yields back to its resumer
//! once the wall time since it was last resumed, scaled by the group's
//! performance multiplier, reaches the budget. Nothing forces a fiber that
//! never checks.

use core::fmt;
use core::time::Duration;
use portable_atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(u64);

impl GroupId {
    pub fn get(self) -> u64 {
        self.0
    }
}

static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(1);

fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

pub(crate) struct GroupInner {
    id: GroupId,
    max_execution_nanos: AtomicU64,
    perf_multiplier_bits: AtomicU32,
    consumed_nanos: AtomicU64,
    members: AtomicUsize,
    pulses: AtomicU64,
}

/// Shared handle to an executive group.
#[derive(Clone)]
pub struct ExecutiveGroup {
    pub(crate) inner: Arc<GroupInner>,
}

impl ExecutiveGroup {
    pub(crate) fn new(budget: Duration) -> Self {
        Self {
            inner: Arc::new(GroupInner {
                id: GroupId(NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed)),
                max_execution_nanos: AtomicU64::new(nanos(budget)),
                perf_multiplier_bits: AtomicU32::new(1.0f32.to_bits()),
                consumed_nanos: AtomicU64::new(0),
                members: AtomicUsize::new(0),
                pulses: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> GroupId {
        self.inner.id
    }

    pub fn set_maximum_execution_time(&self, budget: Duration) {
        self.inner
            .max_execution_nanos
            .store(nanos(budget), Ordering::Relaxed);
    }

    pub fn maximum_execution_time(&self) -> Duration {
        Duration::from_nanos(self.inner.max_execution_nanos.load(Ordering::Relaxed))
    }

    /// Scale applied to measured time. Values above 1 make fibers yield
    /// sooner; non-finite or negative values are stored as 0.
    pub fn set_perf_multiplier(&self, multiplier: f32) {
        let multiplier = if multiplier.is_finite() && multiplier > 0.0 {
            multiplier
        } else {
            0.0
        };
        self.inner
            .perf_multiplier_bits
            .store(multiplier.to_bits(), Ordering::Relaxed);
    }

    pub fn perf_multiplier(&self) -> f32 {
        f32::from_bits(self.inner.perf_multiplier_bits.load(Ordering::Relaxed))
    }

    /// Move `fiber` into this group.
    pub fn add_fiber(&self, fiber: &crate::Fiber) {
        fiber.set_group(self.clone());
    }

    /// Fibers currently in the group.
    pub fn fiber_count(&self) -> usize {
        self.inner.members.load(Ordering::Relaxed)
    }

    /// Time member fibers have run since the last pulse.
    pub fn consumed_time(&self) -> Duration {
        Duration::from_nanos(self.inner.consumed_nanos.load(Ordering::Relaxed))
    }

    /// Start a new scheduling tick: reset the consumed time.
    pub fn do_pulse(&self) {
        self.inner.consumed_nanos.store(0, Ordering::Relaxed);
        self.inner.pulses.fetch_add(1, Ordering::Relaxed);
    }

    /// Pulses seen so far.
    pub fn pulse_count(&self) -> u64 {
        self.inner.pulses.load(Ordering::Relaxed)
    }

    /// Release this handle.
    ///
    /// Closing does not touch membership: fibers still in the group keep it
    /// alive with its budget and multiplier until they move to another group
    /// or are dropped.
    pub fn close(self) {}

    pub(crate) fn account(&self, elapsed: Duration) {
        let _ = self.inner.consumed_nanos.fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |consumed| Some(consumed.saturating_add(nanos(elapsed))),
        );
    }

    /// Whether a fiber that has run for `elapsed` is over budget.
    pub(crate) fn over_budget(&self, elapsed: Duration) -> bool {
        let scaled = elapsed.as_secs_f64() * f64::from(self.perf_multiplier());
        scaled >= self.maximum_execution_time().as_secs_f64()
    }

    pub(crate) fn enter(&self) {
        self.inner.members.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn leave(&self) {
        self.inner.members.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn same_as(&self, other: &ExecutiveGroup) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ExecutiveGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutiveGroup")
            .field("id", &self.id())
            .field("max_execution_time", &self.maximum_execution_time())
            .field("perf_multiplier", &self.perf_multiplier())
            .field("fibers", &self.fiber_count())
            .finish()
    }
}
