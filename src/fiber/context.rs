//! Saved registers of a fiber and the trampoline its stack starts in.

use super::{Fiber, FiberInner};
use crate::arch::{Arch, DefaultArch};
use std::sync::Arc;

/// Stack pointers of the two sides of a fiber switch.
#[derive(Debug, Default)]
pub(crate) struct Registers {
    /// Where the fiber continues when resumed.
    pub(crate) sp: usize,
    /// Where the resumer continues when the fiber yields or ends.
    pub(crate) caller_sp: usize,
}

/// First frame on every fiber stack.
///
/// `arg` carries one strong reference to the fiber, leaked by the first
/// `resume`. The body never unwinds out of here: everything is caught in
/// [`Fiber::run_to_end`]. After the last switch the stack is abandoned and
/// freed by whoever drops the final handle.
pub(crate) unsafe extern "C" fn fiber_trampoline(_from: *mut usize, _to: usize, arg: usize) -> ! {
    let fiber = Fiber {
        inner: unsafe { Arc::from_raw(arg as *const FiberInner) },
    };
    fiber.run_to_end();

    let regs = fiber.inner.regs.get();
    // The resumer still holds a handle, so `regs` outlives this reference.
    drop(fiber);
    unsafe {
        let caller = (*regs).caller_sp;
        DefaultArch::swap(&mut (*regs).sp, caller, 0);
    }
    // A terminated fiber is never switched to again.
    std::process::abort()
}
