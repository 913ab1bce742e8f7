//! The instruction sequences the veneer is built from.
//!
//! There are three: a plain `syscall` that always loads all six argument
//! registers, the `clone` trampoline that moves the child onto its new
//! stack, and the tail that unmaps the calling thread's own stack and exits
//! without touching memory in between.
//!
//! x86_64 register assignment: number and return in `rax`, arguments in
//! `rdi rsi rdx r10 r8 r9`; the instruction clobbers `rcx` and `r11`.

use core::arch::asm;

/// Argument registers, in order. Slots a call does not define are ignored
/// by the kernel.
pub type Args = [usize; 6];

/// Issue syscall `nr` and return the raw `rax`.
///
/// # Safety
///
/// `args` must satisfy whatever the kernel expects of syscall `nr`,
/// including the validity of every pointer it passes.
#[inline]
pub unsafe fn syscall(nr: usize, args: Args) -> usize {
    let [a0, a1, a2, a3, a4, a5] = args;
    let ret: usize;
    // SAFETY: only the registers named here change; `nostack` holds because
    // the instruction never touches the user stack.
    unsafe {
        asm!(
            "syscall",
            inlateout("rax") nr => ret,
            in("rdi") a0,
            in("rsi") a1,
            in("rdx") a2,
            in("r10") a3,
            in("r8") a4,
            in("r9") a5,
            lateout("rcx") _,
            lateout("r11") _,
            options(nostack, preserves_flags),
        );
    }
    ret
}

/// `clone` whose child pops `[entry, arg]` off `child_sp` and calls
/// `entry(arg)`. Returns the raw `rax` in the parent.
///
/// # Safety
///
/// `child_sp` must hold an `extern "C" fn(usize) -> !` followed by its
/// argument, on a stack the child may own. The tid pointers and `tls` must
/// be valid for the flags passed.
#[inline]
pub unsafe fn clone(
    flags: usize,
    child_sp: usize,
    parent_tid: usize,
    child_tid: usize,
    tls: usize,
) -> usize {
    let ret: usize;
    // SAFETY: the child branch never falls back into compiled code: it
    // calls a diverging entry and traps if that returns. The parent branch
    // only sees rax, rcx and r11 change.
    unsafe {
        asm!(
            "syscall",
            "test rax, rax",
            "jnz 2f",
            "xor ebp, ebp",
            "pop rax",
            "pop rdi",
            "and rsp, -16",
            "call rax",
            "ud2",
            "2:",
            inlateout("rax") super::nr::CLONE => ret,
            in("rdi") flags,
            in("rsi") child_sp,
            in("rdx") parent_tid,
            in("r10") child_tid,
            in("r8") tls,
            lateout("rcx") _,
            lateout("r11") _,
            options(nostack),
        );
    }
    ret
}

/// `munmap(addr, len)` then `exit(0)`, entirely in registers.
///
/// # Safety
///
/// The range must belong to the calling thread alone and must not contain
/// its clear-tid word. Signals must be blocked: a handler would run on the
/// stack being unmapped.
#[inline]
pub unsafe fn munmap_and_exit(addr: usize, len: usize) -> ! {
    // SAFETY: the stack is neither read nor written after the first
    // `syscall`; the second one does not return.
    unsafe {
        asm!(
            "syscall",
            "xor edi, edi",
            "mov eax, {exit}",
            "syscall",
            "ud2",
            exit = const super::nr::EXIT,
            in("rax") super::nr::MUNMAP,
            in("rdi") addr,
            in("rsi") len,
            options(noreturn, nostack),
        );
    }
}
