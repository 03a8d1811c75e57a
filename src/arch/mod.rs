//! Architecture abstraction layer for fiber context switching.
//!
//! Everything above this module is architecture-agnostic. A port to a new CPU
//! only has to describe how a fresh stack is laid out and how the callee-saved
//! register set is swapped between two stacks.

/// Entry point a fresh fiber stack starts executing.
///
/// The first argument is the slot the switching side saved its stack pointer
/// into, the second the stack pointer that was switched to, the third the
/// opaque argument passed to [`Arch::swap`]. The function must never return.
pub type Trampoline = unsafe extern "C" fn(*mut usize, usize, usize) -> !;

/// Architecture abstraction trait.
///
/// A register snapshot is represented by a single stack pointer: `swap`
/// pushes the callee-saved registers and a resume address onto the current
/// stack, stores the resulting stack pointer and pops the same frame off the
/// target stack.
///
/// # Safety
///
/// Implementations involve inline assembly. All methods are unsafe and have
/// the preconditions listed on each of them.
pub trait Arch {
    /// Whether this implementation can actually switch contexts.
    const SUPPORTED: bool;

    /// Write the initial frame for `entry` below `stack_top` and return the
    /// stack pointer to hand to the first [`Arch::swap`].
    ///
    /// # Safety
    ///
    /// - `stack_top` must be 16-byte aligned and point one past the end of a
    ///   writable region of at least 64 bytes.
    unsafe fn init_stack(stack_top: *mut u8, entry: Trampoline) -> usize;

    /// Save the current context into `*from_sp` and continue on `to_sp`.
    ///
    /// `arg` is delivered as the third argument of the [`Trampoline`] when
    /// `to_sp` is a fresh stack and ignored otherwise.
    ///
    /// # Safety
    ///
    /// - `from_sp` must be valid for writes until the context is switched back to
    /// - `to_sp` must come from [`Arch::init_stack`] or a previous `swap`, and
    ///   the stack it points into must still be mapped
    unsafe fn swap(from_sp: *mut usize, to_sp: usize, arg: usize);
}

/// Fallback for targets without a context switch implementation.
///
/// Fiber creation is refused on these targets, so neither method is reached.
pub struct NoOpArch;

impl Arch for NoOpArch {
    const SUPPORTED: bool = false;

    unsafe fn init_stack(_stack_top: *mut u8, _entry: Trampoline) -> usize {
        0
    }

    unsafe fn swap(_from_sp: *mut usize, _to_sp: usize, _arg: usize) {}
}

#[cfg(all(unix, target_arch = "x86_64"))]
pub mod x86_64;

#[cfg(all(unix, target_arch = "aarch64"))]
pub mod aarch64;

#[cfg(all(unix, target_arch = "x86_64"))]
pub use x86_64::X86_64Arch as DefaultArch;

#[cfg(all(unix, target_arch = "aarch64"))]
pub use aarch64::Aarch64Arch as DefaultArch;

#[cfg(not(all(unix, any(target_arch = "x86_64", target_arch = "aarch64"))))]
pub use NoOpArch as DefaultArch;

/// Whether fibers can run on the current target.
pub const fn fibers_supported() -> bool {
    <DefaultArch as Arch>::SUPPORTED
}
