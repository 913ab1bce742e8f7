//! Per-architecture thread state installed by the child itself.
//!
//! Everything here runs on the new thread after it passes its startup
//! gate, or on its exit path. Failures are never reported: a thread without
//! an alternate signal stack or a shadow call stack still runs.

use core::ptr::null_mut;
use core::sync::atomic::Ordering;

use crate::os::{Os, Protection};
use crate::pthread::internal::ThreadBookkeeping;
use crate::pthread::tcb::TcbLayout;

// ---------------------------------------------------------------------------
// Alternate signal stack
// ---------------------------------------------------------------------------

/// Usable size of a thread's alternate signal stack.
pub const SIGNAL_STACK_SIZE_WITHOUT_GUARD: usize = 16 * 1024;

fn signal_stack_mapping_len(os: &dyn Os) -> Option<usize> {
    SIGNAL_STACK_SIZE_WITHOUT_GUARD.checked_add(os.page_size())
}

/// Map an alternate signal stack with a guard page at its low end and
/// register it for the calling thread.
pub fn init_alternate_signal_stack(os: &dyn Os, thread: &ThreadBookkeeping) {
    let Some(len) = signal_stack_mapping_len(os) else {
        return;
    };
    let Ok(base) = os.map_read_write(len) else {
        return;
    };
    let page = os.page_size();
    let stack = base + page;
    if os.protect(base, page, Protection::NONE).is_err()
        || os
            .set_alternate_signal_stack(Some((stack, SIGNAL_STACK_SIZE_WITHOUT_GUARD)))
            .is_err()
    {
        let _ = os.release(base, len);
        return;
    }
    thread.alternate_stack.store(base as *mut u8, Ordering::Release);

    let _ = os.name_region(base, page, c"thread signal stack guard");
    let _ = os.name_region(stack, SIGNAL_STACK_SIZE_WITHOUT_GUARD, c"thread signal stack");
}

/// Disable and release the calling thread's alternate signal stack, if any.
pub fn free_alternate_signal_stack(os: &dyn Os, thread: &ThreadBookkeeping) {
    let base = thread.alternate_stack.swap(null_mut(), Ordering::AcqRel);
    if base.is_null() {
        return;
    }
    let _ = os.set_alternate_signal_stack(None);
    if let Some(len) = signal_stack_mapping_len(os) {
        let _ = os.release(base as usize, len);
    }
}

// ---------------------------------------------------------------------------
// Shadow call stack
// ---------------------------------------------------------------------------

/// Size of one shadow call stack.
pub const SCS_SIZE: usize = 8 * 1024;

/// Size of the inaccessible region the shadow call stack hides in.
pub const SCS_GUARD_REGION_SIZE: usize = 16 * 1024 * 1024;

/// A reserved shadow call stack, not yet installed.
///
/// The only way to consume one is [`ShadowCallStack::pin`], which writes
/// the register, so each thread has exactly one write site.
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub struct ShadowCallStack {
    guard_region: usize,
    stack: usize,
}

impl ShadowCallStack {
    /// Reserve the guard region and make one randomly placed slot inside
    /// it read-write. Pid 1 always uses the first slot.
    pub fn reserve(os: &dyn Os) -> Result<Self, i32> {
        let guard_region = os.reserve(SCS_GUARD_REGION_SIZE)?;
        // The reservation is page aligned; the slots are SCS_SIZE aligned.
        let aligned = (guard_region + SCS_SIZE - 1) & !(SCS_SIZE - 1);
        let slot = if os.getpid() == 1 {
            0
        } else {
            os.uniform(SCS_GUARD_REGION_SIZE / SCS_SIZE - 1)
        };
        let stack = aligned + slot * SCS_SIZE;
        if let Err(errno) = os.protect(stack, SCS_SIZE, Protection::READ_WRITE) {
            let _ = os.release(guard_region, SCS_GUARD_REGION_SIZE);
            return Err(errno);
        }
        Ok(Self {
            guard_region,
            stack,
        })
    }

    #[must_use]
    pub fn guard_region(&self) -> usize {
        self.guard_region
    }

    /// Lowest address of the usable slot.
    #[must_use]
    pub fn stack(&self) -> usize {
        self.stack
    }

    /// Record the region in `thread` and point `x18` at the stack.
    ///
    /// # Safety
    ///
    /// Must run on the thread that owns `thread`, before any code that uses
    /// the shadow call stack.
    #[cfg(all(target_arch = "aarch64", any(target_os = "android", target_os = "fuchsia")))]
    #[allow(unsafe_code)]
    pub unsafe fn pin(self, thread: &ThreadBookkeeping) {
        thread
            .shadow_call_stack_guard
            .store(self.guard_region as *mut u8, Ordering::Release);
        // SAFETY: the platform ABI reserves x18, so the compiler never
        // allocates it and rustc refuses it as an operand. No value of
        // ours lives in it.
        unsafe { core::arch::asm!("mov x18, {0}", in(reg) self.stack, options(nostack)) };
    }
}

/// Release the calling thread's shadow call stack region, if any.
pub fn free_shadow_call_stack(os: &dyn Os, thread: &ThreadBookkeeping) {
    let region = thread
        .shadow_call_stack_guard
        .swap(null_mut(), Ordering::AcqRel);
    if !region.is_null() {
        let _ = os.release(region as usize, SCS_GUARD_REGION_SIZE);
    }
}

// ---------------------------------------------------------------------------
// Platform selection
// ---------------------------------------------------------------------------

/// Architecture hooks used by thread creation and the child's start and
/// exit paths.
pub trait Platform {
    const TCB_LAYOUT: TcbLayout;

    /// Runs on the child after its startup gate opens.
    fn install_thread_state(os: &dyn Os, thread: &ThreadBookkeeping);

    /// Runs on the child's exit path.
    fn release_thread_state(os: &dyn Os, thread: &ThreadBookkeeping);
}

#[derive(Debug, Clone, Copy)]
pub struct X86_64Platform;

impl Platform for X86_64Platform {
    const TCB_LAYOUT: TcbLayout = TcbLayout::X86_64;

    fn install_thread_state(_os: &dyn Os, _thread: &ThreadBookkeeping) {}

    fn release_thread_state(_os: &dyn Os, _thread: &ThreadBookkeeping) {}
}

/// Whether the target ABI keeps the compiler off `x18`, so it can carry the
/// shadow call stack pointer. Elsewhere `x18` is an ordinary register (a
/// build needs `-C target-feature=+reserve-x18` for every crate to change
/// that) and no shadow call stack is installed.
#[cfg(target_arch = "aarch64")]
pub const X18_RESERVED: bool = cfg!(any(target_os = "android", target_os = "fuchsia"));

#[cfg(target_arch = "aarch64")]
#[derive(Debug, Clone, Copy)]
pub struct Aarch64Platform;

#[cfg(target_arch = "aarch64")]
impl Platform for Aarch64Platform {
    const TCB_LAYOUT: TcbLayout = TcbLayout::AARCH64;

    #[cfg(any(target_os = "android", target_os = "fuchsia"))]
    #[allow(unsafe_code)]
    fn install_thread_state(os: &dyn Os, thread: &ThreadBookkeeping) {
        if let Ok(scs) = ShadowCallStack::reserve(os) {
            // SAFETY: called once, on the new thread, before user code.
            unsafe { scs.pin(thread) };
        }
    }

    #[cfg(not(any(target_os = "android", target_os = "fuchsia")))]
    fn install_thread_state(_os: &dyn Os, _thread: &ThreadBookkeeping) {}

    fn release_thread_state(os: &dyn Os, thread: &ThreadBookkeeping) {
        free_shadow_call_stack(os, thread);
    }
}

#[cfg(not(target_arch = "aarch64"))]
pub type NativePlatform = X86_64Platform;
#[cfg(target_arch = "aarch64")]
pub type NativePlatform = Aarch64Platform;
