//! OS capability layer.
//!
//! Thread creation talks to the kernel only through [`Os`]. The Linux
//! backend issues raw syscalls; the simulation backend runs spawned threads
//! on `std` threads over heap memory and records every call, so creation
//! paths (including their failure unwinds) can be checked for leaks.
//!
//! Errors are raw errno values, as returned by the syscall veneer.

use core::ffi::CStr;
use core::sync::atomic::AtomicU32;

use bitflags::bitflags;

use crate::random::RandomSource;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod linux;
pub mod sim;

bitflags! {
    /// Access rights for a memory region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: i32 {
        const READ = libc::PROT_READ;
        const WRITE = libc::PROT_WRITE;
    }
}

impl Protection {
    pub const NONE: Self = Self::empty();
    pub const READ_WRITE: Self = Self::READ.union(Self::WRITE);
}

bitflags! {
    /// `clone(2)` flags used for thread creation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CloneFlags: u64 {
        const VM = libc::CLONE_VM as u64;
        const FS = libc::CLONE_FS as u64;
        const FILES = libc::CLONE_FILES as u64;
        const SIGHAND = libc::CLONE_SIGHAND as u64;
        const THREAD = libc::CLONE_THREAD as u64;
        const SYSVSEM = libc::CLONE_SYSVSEM as u64;
        const SETTLS = libc::CLONE_SETTLS as u64;
        const PARENT_SETTID = libc::CLONE_PARENT_SETTID as u64;
        const CHILD_CLEARTID = libc::CLONE_CHILD_CLEARTID as u64;
        const CHILD_SETTID = libc::CLONE_CHILD_SETTID as u64;
    }
}

impl CloneFlags {
    /// Share everything a thread shares with its creator, and have the
    /// kernel maintain the tid word on both ends of the thread's life.
    pub const THREAD_DEFAULT: Self = Self::VM
        .union(Self::FS)
        .union(Self::FILES)
        .union(Self::SIGHAND)
        .union(Self::THREAD)
        .union(Self::SYSVSEM)
        .union(Self::PARENT_SETTID)
        .union(Self::CHILD_SETTID)
        .union(Self::CHILD_CLEARTID);
}

/// What a spawned thread asks its backend to do once its entry returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadExit {
    /// Terminate; the kernel clears the tid word and wakes joiners.
    Exit,
    /// Release the thread's own mapping, then terminate without touching
    /// the tid word (it lives inside the released range).
    ExitAndUnmap { base: usize, len: usize },
}

/// Entry point run on the new thread, plus its argument.
#[derive(Debug, Clone, Copy)]
pub struct ChildStart {
    pub main: fn(usize) -> ThreadExit,
    pub arg: usize,
}

/// One thread-spawn request.
#[derive(Debug, Clone, Copy)]
pub struct SpawnRequest {
    pub flags: CloneFlags,
    /// Initial stack pointer (16-byte aligned, grows down).
    pub stack_top: usize,
    /// New thread pointer, honored only with [`CloneFlags::SETTLS`].
    pub thread_pointer: Option<usize>,
    /// Target of the set-tid and clear-tid flags.
    pub tid_slot: *mut i32,
    pub start: ChildStart,
}

/// Kernel services used to create, run and tear down threads.
pub trait Os: RandomSource {
    fn page_size(&self) -> usize;

    /// Reserve `len` bytes of anonymous private memory with no access.
    /// The returned address is page aligned.
    fn reserve(&self, len: usize) -> Result<usize, i32>;

    /// Map `len` fresh read-write bytes, backed on first touch.
    fn map_read_write(&self, len: usize) -> Result<usize, i32>;

    fn protect(&self, addr: usize, len: usize, prot: Protection) -> Result<(), i32>;

    /// Release a range obtained from [`Os::reserve`] or [`Os::map_read_write`].
    fn release(&self, addr: usize, len: usize) -> Result<(), i32>;

    /// Label an anonymous range for `/proc/self/maps`.
    fn name_region(&self, addr: usize, len: usize, name: &'static CStr) -> Result<(), i32>;

    /// Install the calling thread's alternate signal stack. `None` disables it.
    fn set_alternate_signal_stack(&self, stack: Option<(usize, usize)>) -> Result<(), i32>;

    fn getpid(&self) -> i32;

    /// Scheduling policy of the calling thread.
    fn sched_getscheduler(&self) -> Result<i32, i32>;

    /// Scheduling priority of the calling thread.
    fn sched_getparam(&self) -> Result<i32, i32>;

    fn sched_setscheduler(&self, tid: i32, policy: i32, priority: i32) -> Result<(), i32>;

    /// Block while `*word == expected`. Spurious wakeups are allowed.
    fn futex_wait(&self, word: &AtomicU32, expected: u32);

    /// Wake all waiters on `word`. The address need not be dereferenceable.
    fn futex_wake(&self, word: *const AtomicU32);

    /// Start a new thread.
    ///
    /// # Safety
    ///
    /// `stack_top` must lie inside writable memory with room below it for
    /// the thread's frames; `tid_slot` and the thread pointer must stay
    /// valid for the thread's lifetime.
    unsafe fn spawn(&self, request: SpawnRequest) -> Result<i32, i32>;
}
