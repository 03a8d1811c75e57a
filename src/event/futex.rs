use core::sync::atomic::{AtomicU32, Ordering};
use core::time::Duration;
use std::time::Instant;

const OPEN: u32 = 0;
const CLOSED: u32 = 1;

/// Event on a single futex word.
pub(super) struct FutexEvent {
    state: AtomicU32,
}

impl FutexEvent {
    pub(super) fn new(should_wait: bool) -> Self {
        Self {
            state: AtomicU32::new(if should_wait { CLOSED } else { OPEN }),
        }
    }

    pub(super) fn set(&self, should_wait: bool) {
        if should_wait {
            self.state.store(CLOSED, Ordering::Release);
        } else if self.state.swap(OPEN, Ordering::Release) == CLOSED {
            futex_wake_all(&self.state);
        }
    }

    pub(super) fn is_set(&self) -> bool {
        self.state.load(Ordering::Acquire) == CLOSED
    }

    pub(super) fn wait(&self) {
        while self.state.load(Ordering::Acquire) == CLOSED {
            futex_wait(&self.state, CLOSED, None);
        }
    }

    pub(super) fn wait_timed(&self, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait();
            return true;
        };
        loop {
            if self.state.load(Ordering::Acquire) == OPEN {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            futex_wait(&self.state, CLOSED, Some(remaining));
        }
    }
}

/// Sleep while `word` holds `expected`. Spurious returns are fine, callers loop.
fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
    let ts = timeout.map(|t| libc::timespec {
        tv_sec: t.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: t.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(core::ptr::null(), |t| t as *const libc::timespec);
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32,
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            ts_ptr,
        );
    }
}

fn futex_wake_all(word: &AtomicU32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32,
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            i32::MAX,
        );
    }
}

/// Whether the kernel answers futex calls at all.
pub(super) fn probe() -> bool {
    let word = AtomicU32::new(OPEN);
    let ret = unsafe {
        libc::syscall(
            libc::SYS_futex,
            &word as *const AtomicU32,
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            0,
        )
    };
    ret >= 0 || std::io::Error::last_os_error().raw_os_error() != Some(libc::ENOSYS)
}
