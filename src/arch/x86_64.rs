//! x86_64 (System V) context switching.

use super::{Arch, Trampoline};
use core::arch::asm;

/// x86_64 architecture implementation.
pub struct X86_64Arch;

/// Words in the frame `swap` leaves on a suspended stack: the floating point
/// control word, rbx, rbp and the resume address.
const SAVED_WORDS: usize = 4;

/// MXCSR in the low half, x87 control word above it: the power-on defaults
/// (all exceptions masked, round to nearest, extended precision).
const DEFAULT_FP_CONTROL: usize = (0x037F << 32) | 0x1F80;

impl Arch for X86_64Arch {
    const SUPPORTED: bool = true;

    unsafe fn init_stack(stack_top: *mut u8, entry: Trampoline) -> usize {
        debug_assert_eq!(stack_top as usize % 16, 0);
        unsafe {
            let top = stack_top as *mut usize;
            // Fake return address for the trampoline so unwinders stop there.
            top.sub(1).write(0);
            top.sub(2).write(entry as usize);
            // rbp
            top.sub(3).write(0);
            // rbx
            top.sub(4).write(0);
            top.sub(5).write(DEFAULT_FP_CONTROL);
        }
        stack_top as usize - (SAVED_WORDS + 1) * core::mem::size_of::<usize>()
    }

    /// r12-r15 are handed to the compiler as clobbers; rbx and rbp cannot be
    /// asm operands, so they travel on the stack together with the resume
    /// address. MXCSR and the x87 control word are callee-saved as well and
    /// share one slot below them. The trampoline is entered through the same
    /// `ret` with rdi, rsi and rdx still holding the three arguments.
    #[inline(never)]
    unsafe fn swap(from_sp: *mut usize, to_sp: usize, arg: usize) {
        unsafe {
            asm!(
                "lea rax, [rip + 2f]",
                "push rax",
                "push rbp",
                "push rbx",
                "sub rsp, 8",
                "stmxcsr dword ptr [rsp]",
                "fnstcw word ptr [rsp + 4]",
                "mov [rdi], rsp",
                "mov rsp, rsi",
                "ldmxcsr dword ptr [rsp]",
                "fldcw word ptr [rsp + 4]",
                "add rsp, 8",
                "pop rbx",
                "pop rbp",
                "ret",
                "2:",
                in("rdi") from_sp,
                in("rsi") to_sp,
                in("rdx") arg,
                lateout("r12") _,
                lateout("r13") _,
                lateout("r14") _,
                lateout("r15") _,
                clobber_abi("C"),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Manager;
    use core::arch::asm;

    const ROUNDING_MASK: u32 = 0x6000;
    const ROUND_TOWARD_ZERO: u32 = 0x6000;

    fn read_mxcsr() -> u32 {
        let mut value: u32 = 0;
        unsafe { asm!("stmxcsr dword ptr [{}]", in(reg) &mut value, options(nostack)) };
        value
    }

    fn write_mxcsr(value: u32) {
        unsafe { asm!("ldmxcsr dword ptr [{}]", in(reg) &value, options(nostack)) };
    }

    #[test]
    fn test_rounding_mode_stays_with_its_context() {
        let manager = Manager::create().unwrap();
        let outer = read_mxcsr();
        let fiber = manager
            .create_fiber(0, move |fiber| {
                assert_eq!(read_mxcsr() & ROUNDING_MASK, 0);
                write_mxcsr((read_mxcsr() & !ROUNDING_MASK) | ROUND_TOWARD_ZERO);
                fiber.yield_now().unwrap();
                assert_eq!(read_mxcsr() & ROUNDING_MASK, ROUND_TOWARD_ZERO);
            })
            .unwrap();

        fiber.resume().unwrap();
        assert_eq!(read_mxcsr(), outer);
        fiber.resume().unwrap();
        assert!(fiber.is_terminated());
        assert_eq!(read_mxcsr(), outer);
        manager.delete();
    }
}
