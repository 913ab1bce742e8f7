//! One-shot startup gate between a creating thread and its child.
//!
//! Created locked, opened exactly once by the creator, waited on by the
//! child before it runs any user code. `open` is a release store and
//! `wait` an acquire load, so every write the creator made before opening
//! is visible to the child after waiting.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::os::Os;

const LOCKED: u32 = 0;
const OPEN: u32 = 1;

#[derive(Debug)]
pub struct StartupGate {
    state: AtomicU32,
}

impl StartupGate {
    #[must_use]
    pub const fn locked() -> Self {
        Self {
            state: AtomicU32::new(LOCKED),
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) == OPEN
    }

    /// Block until the gate is opened.
    pub fn wait(&self, os: &dyn Os) {
        while self.state.load(Ordering::Acquire) == LOCKED {
            os.futex_wait(&self.state, LOCKED);
        }
    }

    /// Open the gate and wake the waiter.
    ///
    /// The gate may live in memory the woken child frees as soon as it
    /// runs, so this takes a raw pointer and only uses the address after
    /// the store.
    ///
    /// # Safety
    ///
    /// `gate` must point to a live gate when called.
    #[allow(unsafe_code)]
    pub unsafe fn open(gate: *const Self, os: &dyn Os) {
        // SAFETY: live on entry per the caller; not dereferenced after the store.
        let word = unsafe { core::ptr::addr_of!((*gate).state) };
        // SAFETY: still live; this store is the last access.
        unsafe { (*word).store(OPEN, Ordering::Release) };
        os.futex_wake(word);
    }
}

impl Default for StartupGate {
    fn default() -> Self {
        Self::locked()
    }
}
