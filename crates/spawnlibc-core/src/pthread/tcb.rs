//! Thread control block.
//!
//! A fixed array of pointer-sized slots at the start of static TLS. The
//! thread pointer register points at one of the slots, so fast paths
//! (stack protector, errno, the thread's own bookkeeping) are a single
//! load away. Slot roles differ per architecture; [`TcbLayout`] names them.

use core::sync::atomic::AtomicUsize;

use static_assertions::{assert_eq_size, const_assert, const_assert_eq};

use crate::pthread::internal::{ThreadBookkeeping, ThreadLocals};

pub const TCB_SLOTS: usize = 10;

/// Slot indices for one architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcbLayout {
    /// Slot holding its own address (x86 reads `%fs:0` to find the TCB).
    pub self_slot: Option<usize>,
    /// Slot holding the owning [`ThreadBookkeeping`].
    pub thread_id: usize,
    pub stack_guard: usize,
    pub dtv: usize,
    pub thread_locals: usize,
    /// Slot the thread pointer register points at.
    pub thread_pointer: usize,
}

impl TcbLayout {
    pub const X86_64: Self = Self {
        self_slot: Some(0),
        thread_id: 1,
        stack_guard: 5,
        dtv: 8,
        thread_locals: 9,
        thread_pointer: 0,
    };

    pub const AARCH64: Self = Self {
        self_slot: None,
        thread_locals: 0,
        dtv: 1,
        thread_id: 2,
        stack_guard: 6,
        thread_pointer: 1,
    };

    #[cfg(not(target_arch = "aarch64"))]
    pub const NATIVE: Self = Self::X86_64;
    #[cfg(target_arch = "aarch64")]
    pub const NATIVE: Self = Self::AARCH64;
}

// The stack protector reads the canary at %fs:0x28.
const_assert_eq!(TcbLayout::X86_64.stack_guard * 8, 0x28);
const_assert!(TcbLayout::X86_64.thread_locals < TCB_SLOTS);
const_assert!(TcbLayout::AARCH64.stack_guard < TCB_SLOTS);

/// Dynamic thread vector header. Real per-module vectors are allocated
/// lazily; until then every thread shares this empty one.
#[repr(C)]
#[derive(Debug)]
pub struct TlsDtv {
    pub count: usize,
    pub next: usize,
    pub generation: AtomicUsize,
}

pub static EMPTY_DTV: TlsDtv = TlsDtv {
    count: 0,
    next: 0,
    generation: AtomicUsize::new(0),
};

/// Address installed in the DTV slot of every new thread.
#[must_use]
pub fn empty_dtv_address() -> usize {
    core::ptr::addr_of!(EMPTY_DTV.generation) as usize
}

#[repr(C)]
#[derive(Debug)]
pub struct Tcb {
    slots: [usize; TCB_SLOTS],
}

assert_eq_size!(Tcb, [usize; TCB_SLOTS]);

impl Tcb {
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            slots: [0; TCB_SLOTS],
        }
    }

    #[must_use]
    pub fn slot(&self, index: usize) -> usize {
        self.slots[index]
    }

    /// Value to load into the thread pointer register.
    #[must_use]
    pub fn thread_pointer(&self, layout: &TcbLayout) -> usize {
        core::ptr::addr_of!(self.slots[layout.thread_pointer]) as usize
    }

    pub fn init(&mut self, layout: &TcbLayout, thread: *mut ThreadBookkeeping) {
        if let Some(self_slot) = layout.self_slot {
            self.slots[self_slot] = core::ptr::addr_of!(self.slots[self_slot]) as usize;
        }
        self.slots[layout.thread_id] = thread as usize;
    }

    pub fn init_dtv(&mut self, layout: &TcbLayout) {
        self.slots[layout.dtv] = empty_dtv_address();
    }

    pub fn init_stack_guard(&mut self, layout: &TcbLayout, guard: usize) {
        self.slots[layout.stack_guard] = guard;
    }

    pub fn init_thread_locals(&mut self, layout: &TcbLayout, locals: *mut ThreadLocals) {
        self.slots[layout.thread_locals] = locals as usize;
    }
}

impl Default for Tcb {
    fn default() -> Self {
        Self::zeroed()
    }
}
