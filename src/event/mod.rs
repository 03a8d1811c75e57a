//! The waitable event every other primitive is built on.
//!
//! An [`Event`] is a boolean "should wait" flag. While it is set, [`Event::wait`]
//! blocks; clearing it releases every waiter. The backend is picked once per
//! process from what the platform offers and then handed to each manager, so
//! porting the runtime to a new OS means implementing this module only.

#[cfg(target_os = "linux")]
mod futex;
mod parker;

use core::time::Duration;

#[cfg(target_os = "linux")]
use futex::FutexEvent;
use parker::ParkerEvent;

/// Platform mechanism behind an [`Event`], ranked best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventBackend {
    /// Linux `futex(2)` on a 32-bit word.
    Futex,
    /// OS mutex plus condition variable.
    Parker,
}

static DETECTED: spin::Once<EventBackend> = spin::Once::new();

impl EventBackend {
    /// Every backend, best first.
    pub const RANKED: [EventBackend; 2] = [EventBackend::Futex, EventBackend::Parker];

    /// The best available backend. The probe runs once per process.
    pub fn detect() -> EventBackend {
        *DETECTED.call_once(|| {
            let chosen = Self::RANKED
                .iter()
                .copied()
                .find(|backend| backend.is_available())
                .unwrap_or(EventBackend::Parker);
            log::trace!("event backend selected: {:?}", chosen);
            chosen
        })
    }

    /// Whether this backend works on the running system.
    pub fn is_available(self) -> bool {
        match self {
            #[cfg(target_os = "linux")]
            EventBackend::Futex => futex::probe(),
            #[cfg(not(target_os = "linux"))]
            EventBackend::Futex => false,
            EventBackend::Parker => true,
        }
    }
}

enum EventImpl {
    #[cfg(target_os = "linux")]
    Futex(FutexEvent),
    Parker(ParkerEvent),
}

/// A boolean wait flag.
///
/// `set(true)` makes subsequent waits block, `set(false)` lets every current
/// and future waiter through.
pub struct Event {
    imp: EventImpl,
}

impl Event {
    /// Create a cleared event on the detected backend.
    pub fn new() -> Self {
        Self::with_backend(EventBackend::detect(), false)
    }

    /// Create an event on `backend` with the given initial flag.
    ///
    /// An unavailable backend falls back to [`EventBackend::Parker`].
    pub fn with_backend(backend: EventBackend, should_wait: bool) -> Self {
        let imp = match backend {
            #[cfg(target_os = "linux")]
            EventBackend::Futex => EventImpl::Futex(FutexEvent::new(should_wait)),
            _ => EventImpl::Parker(ParkerEvent::new(should_wait)),
        };
        Self { imp }
    }

    /// Backend this event runs on.
    pub fn backend(&self) -> EventBackend {
        match self.imp {
            #[cfg(target_os = "linux")]
            EventImpl::Futex(_) => EventBackend::Futex,
            EventImpl::Parker(_) => EventBackend::Parker,
        }
    }

    /// Set or clear the wait flag. Clearing wakes all waiters.
    pub fn set(&self, should_wait: bool) {
        match &self.imp {
            #[cfg(target_os = "linux")]
            EventImpl::Futex(e) => e.set(should_wait),
            EventImpl::Parker(e) => e.set(should_wait),
        }
    }

    /// Current value of the wait flag.
    pub fn is_set(&self) -> bool {
        match &self.imp {
            #[cfg(target_os = "linux")]
            EventImpl::Futex(e) => e.is_set(),
            EventImpl::Parker(e) => e.is_set(),
        }
    }

    /// Block while the flag is set.
    pub fn wait(&self) {
        match &self.imp {
            #[cfg(target_os = "linux")]
            EventImpl::Futex(e) => e.wait(),
            EventImpl::Parker(e) => e.wait(),
        }
    }

    /// Block while the flag is set, at most `timeout`.
    ///
    /// Returns `true` if the flag was cleared, `false` on timeout.
    pub fn wait_timed(&self, timeout: Duration) -> bool {
        match &self.imp {
            #[cfg(target_os = "linux")]
            EventImpl::Futex(e) => e.wait_timed(timeout),
            EventImpl::Parker(e) => e.wait_timed(timeout),
        }
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Event {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Event")
            .field("backend", &self.backend())
            .field("set", &self.is_set())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    fn backends() -> Vec<EventBackend> {
        EventBackend::RANKED
            .iter()
            .copied()
            .filter(|b| b.is_available())
            .collect()
    }

    #[test]
    fn test_detect_is_stable() {
        assert_eq!(EventBackend::detect(), EventBackend::detect());
        assert!(EventBackend::detect().is_available());
    }

    #[test]
    fn test_cleared_event_does_not_block() {
        for backend in backends() {
            let event = Event::with_backend(backend, false);
            event.wait();
            assert!(event.wait_timed(Duration::from_millis(1)));
        }
    }

    #[test]
    fn test_set_event_times_out() {
        for backend in backends() {
            let event = Event::with_backend(backend, true);
            let start = Instant::now();
            assert!(!event.wait_timed(Duration::from_millis(20)));
            assert!(start.elapsed() >= Duration::from_millis(15));
        }
    }

    #[test]
    fn test_clear_wakes_waiter() {
        for backend in backends() {
            let event = Arc::new(Event::with_backend(backend, true));
            let waiter = {
                let event = event.clone();
                std::thread::spawn(move || event.wait_timed(Duration::from_secs(10)))
            };
            std::thread::sleep(Duration::from_millis(20));
            event.set(false);
            assert!(waiter.join().unwrap());
            assert!(!event.is_set());
        }
    }

    #[test]
    fn test_unbounded_timeout_waits_for_clear() {
        for backend in backends() {
            let open = Event::with_backend(backend, false);
            assert!(open.wait_timed(Duration::MAX));

            let event = Arc::new(Event::with_backend(backend, true));
            let waiter = {
                let event = event.clone();
                std::thread::spawn(move || event.wait_timed(Duration::MAX))
            };
            std::thread::sleep(Duration::from_millis(20));
            event.set(false);
            assert!(waiter.join().unwrap());
        }
    }
}
