//! Raw-syscall backend for x86_64 Linux.

use core::ffi::CStr;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use super::{ChildStart, CloneFlags, Os, Protection, SpawnRequest, ThreadExit};
use crate::random::{KernelRandom, RandomSource};
use crate::syscall;

// Shared (non-private) ops: the kernel's clear-tid wake is a shared wake,
// and a private waiter hashes to a different key.
const FUTEX_WAIT: i32 = 0;
const FUTEX_WAKE: i32 = 1;
const SS_DISABLE: i32 = 2;
const FALLBACK_PAGE_SIZE: usize = 4096;

/// The process's kernel, reached through the raw syscall veneer.
#[derive(Debug)]
pub struct LinuxOs {
    random: KernelRandom,
    page_size: AtomicUsize,
}

impl LinuxOs {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            random: KernelRandom::new(),
            page_size: AtomicUsize::new(0),
        }
    }
}

impl Default for LinuxOs {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomSource for LinuxOs {
    fn next_u64(&self) -> u64 {
        self.random.next_u64()
    }
}

impl Os for LinuxOs {
    fn page_size(&self) -> usize {
        let cached = self.page_size.load(Ordering::Relaxed);
        if cached != 0 {
            return cached;
        }
        // SAFETY: getauxval only reads the auxiliary vector.
        let from_aux = unsafe { libc::getauxval(libc::AT_PAGESZ) } as usize;
        let page = if from_aux.is_power_of_two() {
            from_aux
        } else {
            FALLBACK_PAGE_SIZE
        };
        self.page_size.store(page, Ordering::Relaxed);
        page
    }

    fn reserve(&self, len: usize) -> Result<usize, i32> {
        // SAFETY: a fresh anonymous mapping aliases nothing.
        let addr = unsafe {
            syscall::sys_mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )?
        };
        Ok(addr as usize)
    }

    fn map_read_write(&self, len: usize) -> Result<usize, i32> {
        // SAFETY: a fresh anonymous mapping aliases nothing.
        let addr = unsafe {
            syscall::sys_mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )?
        };
        Ok(addr as usize)
    }

    fn protect(&self, addr: usize, len: usize, prot: Protection) -> Result<(), i32> {
        // SAFETY: callers only change protection inside mappings they own.
        unsafe { syscall::sys_mprotect(addr as *mut u8, len, prot.bits()) }
    }

    fn release(&self, addr: usize, len: usize) -> Result<(), i32> {
        // SAFETY: callers only release mappings they own.
        unsafe { syscall::sys_munmap(addr as *mut u8, len) }
    }

    fn name_region(&self, addr: usize, len: usize, name: &'static CStr) -> Result<(), i32> {
        syscall::sys_prctl_set_vma_anon_name(addr, len, name)
    }

    fn set_alternate_signal_stack(&self, stack: Option<(usize, usize)>) -> Result<(), i32> {
        let ss = match stack {
            Some((base, size)) => syscall::KernelSigaltstack {
                ss_sp: base as *mut u8,
                ss_flags: 0,
                ss_size: size,
            },
            None => syscall::KernelSigaltstack {
                ss_sp: core::ptr::null_mut(),
                ss_flags: SS_DISABLE,
                ss_size: 0,
            },
        };
        // SAFETY: the caller keeps an enabled stack mapped until it disables it.
        unsafe { syscall::sys_sigaltstack(&ss) }
    }

    fn getpid(&self) -> i32 {
        syscall::sys_getpid()
    }

    fn sched_getscheduler(&self) -> Result<i32, i32> {
        syscall::sys_sched_getscheduler(0)
    }

    fn sched_getparam(&self) -> Result<i32, i32> {
        syscall::sys_sched_getparam(0)
    }

    fn sched_setscheduler(&self, tid: i32, policy: i32, priority: i32) -> Result<(), i32> {
        syscall::sys_sched_setscheduler(tid, policy, priority)
    }

    fn futex_wait(&self, word: &AtomicU32, expected: u32) {
        // SAFETY: `word` is a live, aligned u32. EAGAIN and EINTR both mean
        // "re-check the word", which every caller does.
        let _ = unsafe {
            syscall::sys_futex(word.as_ptr(), FUTEX_WAIT, expected, 0, 0, 0)
        };
    }

    fn futex_wake(&self, word: *const AtomicU32) {
        // SAFETY: FUTEX_WAKE only hashes the address; it never dereferences it.
        let _ = unsafe {
            syscall::sys_futex(word.cast(), FUTEX_WAKE, i32::MAX as u32, 0, 0, 0)
        };
    }

    unsafe fn spawn(&self, request: SpawnRequest) -> Result<i32, i32> {
        let top = request.stack_top & !15;
        let start_at = top
            .checked_sub(core::mem::size_of::<ChildStart>())
            .ok_or(crate::errno::EINVAL)?
            & !15;
        let frame = start_at.checked_sub(16).ok_or(crate::errno::EINVAL)?;

        // SAFETY: the caller guarantees writable stack below `stack_top`.
        // `frame` is what the clone trampoline pops: entry, then its argument.
        unsafe {
            core::ptr::write(start_at as *mut ChildStart, request.start);
            let slots = frame as *mut usize;
            slots.write(linux_child_entry as usize);
            slots.add(1).write(start_at);
        }

        let tls = match request.thread_pointer {
            Some(tp) if request.flags.contains(CloneFlags::SETTLS) => tp,
            _ => 0,
        };
        log::trace!(
            "clone(flags={:#x}, sp={frame:#x}, tls={tls:#x})",
            request.flags.bits()
        );
        // SAFETY: the frame was just laid out for the trampoline and the
        // tid slot validity is the caller's contract.
        unsafe {
            syscall::sys_clone_thread(
                request.flags.bits() as usize,
                frame,
                request.tid_slot,
                request.tid_slot,
                tls,
            )
        }
    }
}

/// First Rust frame of a cloned thread. Never returns.
extern "C" fn linux_child_entry(start_at: usize) -> ! {
    // SAFETY: the parent wrote a ChildStart at this address before clone.
    let start = unsafe { core::ptr::read(start_at as *const ChildStart) };
    match (start.main)(start.arg) {
        ThreadExit::Exit => syscall::sys_exit_thread(0),
        // SAFETY: a detached thread's mapping is referenced by nothing but
        // this thread, which is running its last instructions.
        ThreadExit::ExitAndUnmap { base, len } => unsafe { syscall::sys_exit_and_unmap(base, len) },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicI32;

    static OS: LinuxOs = LinuxOs::new();

    #[test]
    fn page_size_is_cached_power_of_two() {
        let page = OS.page_size();
        assert!(page.is_power_of_two());
        assert_eq!(OS.page_size(), page);
    }

    #[test]
    fn reserve_protect_release_round_trip() {
        let page = OS.page_size();
        let base = OS.reserve(page * 4).expect("reserve");
        assert_eq!(base % page, 0);
        OS.protect(base + page, page * 2, Protection::READ_WRITE)
            .expect("mprotect");
        // SAFETY: the page was just made writable.
        unsafe { core::ptr::write_volatile((base + page) as *mut u64, 7) };
        OS.release(base, page * 4).expect("munmap");
    }

    #[test]
    fn name_region_failure_is_reported_not_fatal() {
        let page = OS.page_size();
        let base = OS.reserve(page).expect("reserve");
        // Older kernels answer EINVAL; either way the mapping is untouched.
        let _ = OS.name_region(base, page, c"spawnlibc test");
        OS.release(base, page).expect("munmap");
    }

    #[test]
    fn futex_wait_returns_when_value_differs() {
        let word = AtomicU32::new(1);
        OS.futex_wait(&word, 0);
        OS.futex_wake(&word);
    }

    static CHILD_ARG: AtomicUsize = AtomicUsize::new(0);

    fn record_arg(arg: usize) -> ThreadExit {
        CHILD_ARG.store(arg, Ordering::Release);
        ThreadExit::Exit
    }

    #[test]
    fn spawn_runs_child_and_clears_tid() {
        let page = OS.page_size();
        let len = page * 16;
        let stack = OS.map_read_write(len).expect("stack");
        let tid = Box::new(AtomicI32::new(0));
        let request = SpawnRequest {
            flags: CloneFlags::THREAD_DEFAULT,
            stack_top: stack + len,
            thread_pointer: None,
            tid_slot: tid.as_ptr(),
            start: ChildStart {
                main: record_arg,
                arg: 0xfeed,
            },
        };
        // SAFETY: the stack and tid word outlive the child (we wait below).
        let spawned = unsafe { OS.spawn(request) }.expect("clone");
        assert!(spawned > 0);
        loop {
            let current = tid.load(Ordering::Acquire);
            if current == 0 {
                break;
            }
            // SAFETY: AtomicI32 and AtomicU32 share layout.
            let word = unsafe { &*(tid.as_ptr() as *const AtomicU32) };
            OS.futex_wait(word, current as u32);
        }
        assert_eq!(CHILD_ARG.load(Ordering::Acquire), 0xfeed);
        OS.release(stack, len).expect("munmap");
    }

    static SELF_UNMAP_LEN: AtomicUsize = AtomicUsize::new(0);

    fn unmap_own_stack(base: usize) -> ThreadExit {
        ThreadExit::ExitAndUnmap {
            base,
            len: SELF_UNMAP_LEN.load(Ordering::Acquire),
        }
    }

    #[test]
    fn exit_and_unmap_releases_the_running_stack() {
        let page = OS.page_size();
        let len = page * 16;
        SELF_UNMAP_LEN.store(len, Ordering::Release);
        let stack = OS.map_read_write(len).expect("stack");
        let tid = Box::new(AtomicI32::new(0));
        let request = SpawnRequest {
            flags: CloneFlags::THREAD_DEFAULT,
            stack_top: stack + len,
            thread_pointer: None,
            tid_slot: tid.as_ptr(),
            start: ChildStart {
                main: unmap_own_stack,
                arg: stack,
            },
        };
        // SAFETY: the child owns the stack from here and unmaps it itself.
        let child = unsafe { OS.spawn(request) }.expect("clone");

        let task = format!("/proc/self/task/{child}");
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while std::path::Path::new(&task).exists() {
            assert!(std::time::Instant::now() < deadline, "thread did not exit");
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        let maps = std::fs::read_to_string("/proc/self/maps").expect("maps");
        let range = format!("{stack:x}-{:x} ", stack + len);
        assert!(!maps.lines().any(|line| line.starts_with(&range)));
        // The clear-tid address was reset before the unmap.
        assert_eq!(tid.load(Ordering::Acquire), child);
    }
}
