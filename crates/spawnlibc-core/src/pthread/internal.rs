//! Per-thread bookkeeping and libc-private thread-locals.

use core::ffi::c_void;
use core::mem::size_of;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicI32, AtomicPtr, AtomicU8, AtomicU32, AtomicUsize, Ordering};

use static_assertions::const_assert;

use crate::os::Os;
use crate::pthread::gate::StartupGate;
use crate::pthread::layout::round_up;
use crate::runtime::Runtime;

/// User thread entry point.
pub type ThreadEntry = extern "C" fn(*mut c_void) -> *mut c_void;

/// Join state of a thread.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    NotJoined = 0,
    ExitedNotJoined = 1,
    Joined = 2,
    Detached = 3,
}

impl JoinState {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::NotJoined,
            1 => Self::ExitedNotJoined,
            2 => Self::Joined,
            _ => Self::Detached,
        }
    }
}

/// Creation attributes after defaults and rounding have been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedAttributes {
    /// Lowest address of the stack: the mapping base for allocated stacks,
    /// the caller's buffer otherwise.
    pub stack_base: usize,
    /// Bytes from `stack_base` up to the initial stack pointer.
    pub stack_size: usize,
    pub guard_size: usize,
    pub caller_stack: bool,
    pub detached: bool,
    pub policy: i32,
    pub priority: i32,
}

/// Number of key slots in [`ThreadLocals`].
pub const THREAD_LOCAL_KEYS: usize = 16;

/// Libc-private thread-locals, kept in static TLS and zeroed on creation.
#[repr(C)]
#[derive(Debug)]
pub struct ThreadLocals {
    pub errno: i32,
    pub keys: [usize; THREAD_LOCAL_KEYS],
}

const_assert!(size_of::<ThreadLocals>() <= 4096);

/// Map a standalone, zeroed [`ThreadLocals`] block for code that runs
/// before the calling thread has static TLS of its own.
pub fn allocate_temp_thread_locals(os: &dyn Os) -> Result<NonNull<ThreadLocals>, i32> {
    let len = temp_thread_locals_len(os)?;
    let addr = os.map_read_write(len)?;
    NonNull::new(addr as *mut ThreadLocals).ok_or(crate::errno::ENOMEM)
}

/// Release a block from [`allocate_temp_thread_locals`].
///
/// # Safety
///
/// `locals` must come from [`allocate_temp_thread_locals`] on the same `os`
/// and must not be used afterwards.
#[allow(unsafe_code)]
pub unsafe fn free_temp_thread_locals(os: &dyn Os, locals: NonNull<ThreadLocals>) -> Result<(), i32> {
    os.release(locals.as_ptr() as usize, temp_thread_locals_len(os)?)
}

fn temp_thread_locals_len(os: &dyn Os) -> Result<usize, i32> {
    round_up(size_of::<ThreadLocals>(), os.page_size()).ok_or(crate::errno::ENOMEM)
}

/// Per-thread control structure, written in place at the base of the
/// thread block.
///
/// Everything except the tid word, the join state and the resource
/// pointers is written once by the creator before the startup gate opens
/// and is read-only afterwards.
#[repr(C)]
pub struct ThreadBookkeeping {
    /// Kernel thread id. Set by the kernel on spawn, cleared on exit; it is
    /// also the futex word joiners sleep on.
    pub tid: AtomicI32,
    join_state: AtomicU8,
    pub attr: ResolvedAttributes,
    pub mmap_base: usize,
    pub mmap_size: usize,
    /// Base of this thread's alternate signal stack mapping (guard included).
    pub alternate_stack: AtomicPtr<u8>,
    /// Base of the shadow call stack guard region.
    pub shadow_call_stack_guard: AtomicPtr<u8>,
    entry: AtomicUsize,
    arg: AtomicUsize,
    return_value: AtomicPtr<c_void>,
    pub startup_gate: StartupGate,
    pub cached_pid: AtomicI32,
    pub thread_locals: *mut ThreadLocals,
    pub runtime: *const Runtime,
}

// SAFETY: raw pointers are either immutable after publication or only
// dereferenced by the owning thread; shared mutation goes through atomics.
#[allow(unsafe_code)]
unsafe impl Send for ThreadBookkeeping {}
#[allow(unsafe_code)]
unsafe impl Sync for ThreadBookkeeping {}

impl ThreadBookkeeping {
    #[must_use]
    pub fn new(
        attr: ResolvedAttributes,
        mmap_base: usize,
        mmap_size: usize,
        thread_locals: *mut ThreadLocals,
        runtime: *const Runtime,
    ) -> Self {
        let join_state = if attr.detached {
            JoinState::Detached
        } else {
            JoinState::NotJoined
        };
        Self {
            tid: AtomicI32::new(0),
            join_state: AtomicU8::new(join_state as u8),
            attr,
            mmap_base,
            mmap_size,
            alternate_stack: AtomicPtr::new(core::ptr::null_mut()),
            shadow_call_stack_guard: AtomicPtr::new(core::ptr::null_mut()),
            entry: AtomicUsize::new(0),
            arg: AtomicUsize::new(0),
            return_value: AtomicPtr::new(core::ptr::null_mut()),
            startup_gate: StartupGate::locked(),
            cached_pid: AtomicI32::new(0),
            thread_locals,
            runtime,
        }
    }

    #[must_use]
    pub fn join_state(&self) -> JoinState {
        JoinState::from_u8(self.join_state.load(Ordering::Acquire))
    }

    /// Unconditionally set the join state. Only valid while no other
    /// party can observe the thread.
    pub fn force_join_state(&self, state: JoinState) {
        self.join_state.store(state as u8, Ordering::Release);
    }

    /// Atomically move from `current` to `new`; on failure returns the
    /// state actually found.
    pub fn transition_join_state(&self, current: JoinState, new: JoinState) -> Result<(), JoinState> {
        self.join_state
            .compare_exchange(current as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(JoinState::from_u8)
    }

    pub fn set_entry(&self, entry: ThreadEntry, arg: *mut c_void) {
        self.entry.store(entry as usize, Ordering::Relaxed);
        self.arg.store(arg as usize, Ordering::Relaxed);
    }

    /// Replace the entry point, keeping the argument.
    pub fn replace_entry(&self, entry: ThreadEntry) {
        self.entry.store(entry as usize, Ordering::Relaxed);
    }

    #[must_use]
    pub fn entry_address(&self) -> usize {
        self.entry.load(Ordering::Relaxed)
    }

    /// The entry point and its argument.
    #[must_use]
    #[allow(unsafe_code)]
    pub fn entry(&self) -> Option<(ThreadEntry, *mut c_void)> {
        let addr = self.entry.load(Ordering::Relaxed);
        if addr == 0 {
            return None;
        }
        // SAFETY: only `set_entry`/`replace_entry` store non-zero values,
        // and both store a `ThreadEntry`.
        let entry: ThreadEntry = unsafe { core::mem::transmute::<usize, ThreadEntry>(addr) };
        Some((entry, self.arg.load(Ordering::Relaxed) as *mut c_void))
    }

    pub fn set_return_value(&self, value: *mut c_void) {
        self.return_value.store(value, Ordering::Release);
    }

    #[must_use]
    pub fn return_value(&self) -> *mut c_void {
        self.return_value.load(Ordering::Acquire)
    }

    /// Address handed to the kernel for the set-tid and clear-tid flags.
    #[must_use]
    pub fn tid_slot(&self) -> *mut i32 {
        self.tid.as_ptr()
    }

    /// The tid word viewed as a futex word.
    #[must_use]
    #[allow(unsafe_code)]
    pub fn tid_futex(&self) -> &AtomicU32 {
        // SAFETY: AtomicI32 and AtomicU32 have identical size and alignment.
        unsafe { &*(self.tid.as_ptr() as *const AtomicU32) }
    }
}

impl core::fmt::Debug for ThreadBookkeeping {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ThreadBookkeeping")
            .field("tid", &self.tid.load(Ordering::Relaxed))
            .field("join_state", &self.join_state())
            .field("attr", &self.attr)
            .field("mmap_base", &format_args!("{:#x}", self.mmap_base))
            .field("mmap_size", &self.mmap_size)
            .finish_non_exhaustive()
    }
}
