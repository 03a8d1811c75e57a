//! AArch64 (AAPCS64) context switching.

use super::{Arch, Trampoline};
use core::arch::asm;

/// AArch64 architecture implementation.
pub struct Aarch64Arch;

/// Bytes of the frame `swap` leaves on a suspended stack: x19, x29, the
/// resume address and one word of padding to keep sp 16-byte aligned.
const FRAME_BYTES: usize = 32;

impl Arch for Aarch64Arch {
    const SUPPORTED: bool = true;

    unsafe fn init_stack(stack_top: *mut u8, entry: Trampoline) -> usize {
        debug_assert_eq!(stack_top as usize % 16, 0);
        let sp = stack_top as usize - FRAME_BYTES;
        unsafe {
            let frame = sp as *mut usize;
            // x19
            frame.write(0);
            // x29, a null frame pointer ends frame-pointer walks
            frame.add(1).write(0);
            frame.add(2).write(entry as usize);
            frame.add(3).write(0);
        }
        sp
    }

    /// x20-x28 and v8-v15 are handed to the compiler as clobbers; x19 and
    /// x29 cannot be asm operands and travel on the stack with the resume
    /// address. lr is zeroed before the branch so a fresh trampoline has no
    /// caller.
    #[inline(never)]
    unsafe fn swap(from_sp: *mut usize, to_sp: usize, arg: usize) {
        unsafe {
            asm!(
                "adr x9, 2f",
                "sub sp, sp, #32",
                "stp x19, x29, [sp]",
                "str x9, [sp, #16]",
                "mov x9, sp",
                "str x9, [x0]",
                "mov sp, x1",
                "ldp x19, x29, [sp]",
                "ldr x9, [sp, #16]",
                "add sp, sp, #32",
                "mov x30, xzr",
                "br x9",
                "2:",
                in("x0") from_sp,
                in("x1") to_sp,
                in("x2") arg,
                lateout("x20") _,
                lateout("x21") _,
                lateout("x22") _,
                lateout("x23") _,
                lateout("x24") _,
                lateout("x25") _,
                lateout("x26") _,
                lateout("x27") _,
                lateout("x28") _,
                lateout("v8") _,
                lateout("v9") _,
                lateout("v10") _,
                lateout("v11") _,
                lateout("v12") _,
                lateout("v13") _,
                lateout("v14") _,
                lateout("v15") _,
                clobber_abi("C"),
            );
        }
    }
}
