//! Raw Linux x86_64 syscalls for thread creation.
//!
//! A spawned thread may start with a thread pointer the host libc knows
//! nothing about, so everything reachable from its start and exit paths
//! goes straight to the kernel through here instead of through libc.
//!
//! Wrappers return `Result<_, i32>` carrying the raw errno. Pointer
//! validity stays the caller's contract on the `unsafe` ones.

#[allow(unsafe_code)]
mod raw;

/// Syscall numbers used by this crate.
pub mod nr {
    pub const WRITE: usize = 1;
    pub const MMAP: usize = 9;
    pub const MPROTECT: usize = 10;
    pub const MUNMAP: usize = 11;
    pub const RT_SIGPROCMASK: usize = 14;
    pub const GETPID: usize = 39;
    pub const CLONE: usize = 56;
    pub const EXIT: usize = 60;
    pub const SIGALTSTACK: usize = 131;
    pub const SCHED_GETPARAM: usize = 143;
    pub const SCHED_SETSCHEDULER: usize = 144;
    pub const SCHED_GETSCHEDULER: usize = 145;
    pub const PRCTL: usize = 157;
    pub const FUTEX: usize = 202;
    pub const SET_TID_ADDRESS: usize = 218;
    pub const GETRANDOM: usize = 318;
}

/// `how` for [`sys_rt_sigprocmask`].
pub const SIG_SETMASK: i32 = 2;

/// Every signal the kernel lets a thread block.
pub const ALL_SIGNALS: u64 = !0;

/// The kernel's `sigset_t` is 64 bits on x86_64.
const KERNEL_SIGSET_SIZE: usize = 8;

/// Split a raw return: `-4095..=-1` is `-errno`, anything else a value.
#[inline]
pub fn check(ret: usize) -> Result<usize, i32> {
    let signed = ret as isize;
    if (-4095..0).contains(&signed) {
        Err(-signed as i32)
    } else {
        Ok(ret)
    }
}

#[allow(unsafe_code)]
fn call(nr: usize, args: raw::Args) -> Result<usize, i32> {
    // SAFETY: only reachable from wrappers that build `args` from
    // references or plain integers.
    check(unsafe { raw::syscall(nr, args) })
}

/// `write(fd, buf, len)` on a byte slice.
pub fn sys_write(fd: i32, buf: &[u8]) -> Result<usize, i32> {
    call(nr::WRITE, [fd as usize, buf.as_ptr() as usize, buf.len(), 0, 0, 0])
}

/// Anonymous or file `mmap`; returns the mapping address.
///
/// # Safety
///
/// A non-null `addr` with `MAP_FIXED` replaces whatever was mapped there.
#[inline]
#[allow(unsafe_code)]
pub unsafe fn sys_mmap(
    addr: *mut u8,
    len: usize,
    prot: i32,
    flags: i32,
    fd: i32,
    offset: i64,
) -> Result<*mut u8, i32> {
    let args = [
        addr as usize,
        len,
        prot as usize,
        flags as usize,
        fd as usize,
        offset as usize,
    ];
    // SAFETY: forwarded caller contract.
    check(unsafe { raw::syscall(nr::MMAP, args) }).map(|base| base as *mut u8)
}

/// # Safety
///
/// Nothing may still use `[addr, addr + len)`.
#[inline]
#[allow(unsafe_code)]
pub unsafe fn sys_munmap(addr: *mut u8, len: usize) -> Result<(), i32> {
    // SAFETY: forwarded caller contract.
    check(unsafe { raw::syscall(nr::MUNMAP, [addr as usize, len, 0, 0, 0, 0]) }).map(drop)
}

/// # Safety
///
/// Revoking access must not break a live user of the range.
#[inline]
#[allow(unsafe_code)]
pub unsafe fn sys_mprotect(addr: *mut u8, len: usize, prot: i32) -> Result<(), i32> {
    let args = [addr as usize, len, prot as usize, 0, 0, 0];
    // SAFETY: forwarded caller contract.
    check(unsafe { raw::syscall(nr::MPROTECT, args) }).map(drop)
}

/// `futex(uaddr, op, val, timeout, uaddr2, val3)`.
///
/// # Safety
///
/// `uaddr` must be an aligned `u32` for waiting ops; other pointers as the
/// op requires.
#[inline]
#[allow(unsafe_code)]
pub unsafe fn sys_futex(
    uaddr: *const u32,
    op: i32,
    val: u32,
    timeout: usize,
    uaddr2: usize,
    val3: u32,
) -> Result<usize, i32> {
    let args = [
        uaddr as usize,
        op as usize,
        val as usize,
        timeout,
        uaddr2,
        val3 as usize,
    ];
    // SAFETY: forwarded caller contract.
    check(unsafe { raw::syscall(nr::FUTEX, args) })
}

pub fn sys_getpid() -> i32 {
    // getpid cannot fail.
    call(nr::GETPID, [0; 6]).map_or(0, |pid| pid as i32)
}

/// Terminate the calling thread only.
pub fn sys_exit_thread(status: i32) -> ! {
    let _ = call(nr::EXIT, [status as usize, 0, 0, 0, 0, 0]);
    loop {
        core::hint::spin_loop();
    }
}

/// Replace the calling thread's signal mask, optionally returning the old one.
pub fn sys_rt_sigprocmask(how: i32, set: Option<&u64>, old: Option<&mut u64>) -> Result<(), i32> {
    let set = set.map_or(0, |s| s as *const u64 as usize);
    let old = old.map_or(0, |o| o as *mut u64 as usize);
    call(
        nr::RT_SIGPROCMASK,
        [how as usize, set, old, KERNEL_SIGSET_SIZE, 0, 0],
    )
    .map(drop)
}

/// Exit path of a thread that owns its own mapping: block every signal,
/// stop the kernel from clearing a tid word inside the mapping, then unmap
/// it and exit without touching the stack.
///
/// # Safety
///
/// `[base, base + len)` must be the calling thread's own mapping and
/// nothing else may reference it.
#[allow(unsafe_code)]
pub unsafe fn sys_exit_and_unmap(base: usize, len: usize) -> ! {
    // No handler may run once the stack is gone. Failure leaves signals
    // deliverable, which is no worse than not trying.
    let _ = sys_rt_sigprocmask(SIG_SETMASK, Some(&ALL_SIGNALS), None);
    // SAFETY: null disables the clear-tid write; the mapping contract is
    // forwarded.
    unsafe {
        raw::syscall(nr::SET_TID_ADDRESS, [0; 6]);
        raw::munmap_and_exit(base, len)
    }
}

pub fn sys_sched_getscheduler(pid: i32) -> Result<i32, i32> {
    call(nr::SCHED_GETSCHEDULER, [pid as usize, 0, 0, 0, 0, 0]).map(|policy| policy as i32)
}

/// Priority of `pid` (`struct sched_param` is a single int).
pub fn sys_sched_getparam(pid: i32) -> Result<i32, i32> {
    let mut priority: i32 = 0;
    let param = &mut priority as *mut i32 as usize;
    call(nr::SCHED_GETPARAM, [pid as usize, param, 0, 0, 0, 0])?;
    Ok(priority)
}

pub fn sys_sched_setscheduler(pid: i32, policy: i32, priority: i32) -> Result<(), i32> {
    let param = &priority as *const i32 as usize;
    call(
        nr::SCHED_SETSCHEDULER,
        [pid as usize, policy as usize, param, 0, 0, 0],
    )
    .map(drop)
}

/// Kernel `stack_t`.
#[repr(C)]
#[derive(Debug)]
pub struct KernelSigaltstack {
    pub ss_sp: *mut u8,
    pub ss_flags: i32,
    pub ss_size: usize,
}

/// # Safety
///
/// An enabled stack must stay mapped read-write until it is disabled.
#[inline]
#[allow(unsafe_code)]
pub unsafe fn sys_sigaltstack(ss: &KernelSigaltstack) -> Result<(), i32> {
    let args = [ss as *const KernelSigaltstack as usize, 0, 0, 0, 0, 0];
    // SAFETY: forwarded caller contract.
    check(unsafe { raw::syscall(nr::SIGALTSTACK, args) }).map(drop)
}

/// Tag an anonymous range in `/proc/self/maps`. Kernels without
/// `CONFIG_ANON_VMA_NAME` answer `EINVAL`.
pub fn sys_prctl_set_vma_anon_name(addr: usize, len: usize, name: &'static core::ffi::CStr) -> Result<(), i32> {
    const PR_SET_VMA: usize = 0x5356_4d41;
    const PR_SET_VMA_ANON_NAME: usize = 0;
    let args = [
        PR_SET_VMA,
        PR_SET_VMA_ANON_NAME,
        addr,
        len,
        name.as_ptr() as usize,
        0,
    ];
    call(nr::PRCTL, args).map(drop)
}

pub fn sys_getrandom(buf: &mut [u8], flags: u32) -> Result<usize, i32> {
    call(
        nr::GETRANDOM,
        [buf.as_mut_ptr() as usize, buf.len(), flags as usize, 0, 0, 0],
    )
}

/// Spawn a thread through the `clone` trampoline; returns the child tid.
///
/// # Safety
///
/// See [`raw::clone`]: `child_sp` holds `[entry, arg]`, and the tid
/// pointers and `tls` match the flags.
#[inline]
#[allow(unsafe_code)]
pub unsafe fn sys_clone_thread(
    flags: usize,
    child_sp: usize,
    parent_tid: *mut i32,
    child_tid: *mut i32,
    tls: usize,
) -> Result<i32, i32> {
    // SAFETY: forwarded caller contract.
    let ret = unsafe { raw::clone(flags, child_sp, parent_tid as usize, child_tid as usize, tls) };
    check(ret).map(|tid| tid as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_splits_errno_range() {
        assert_eq!(check(0), Ok(0));
        assert_eq!(check(4096), Ok(4096));
        assert_eq!(check((-22isize) as usize), Err(22));
        assert_eq!(check((-4095isize) as usize), Err(4095));
        assert_eq!(check((-4096isize) as usize), Ok((-4096isize) as usize));
    }

    #[test]
    fn write_to_stderr_reports_length() {
        assert_eq!(sys_write(2, b""), Ok(0));
        assert_eq!(sys_write(-1, b"x"), Err(libc::EBADF));
    }

    #[test]
    fn scheduler_queries_succeed_for_calling_thread() {
        assert!(sys_getpid() > 0);
        assert!(sys_sched_getscheduler(0).expect("sched_getscheduler") >= 0);
        assert!(sys_sched_getparam(0).is_ok());
    }

    #[test]
    fn getrandom_fills_buffer() {
        let mut buf = [0u8; 16];
        assert_eq!(sys_getrandom(&mut buf, 0), Ok(16));
    }

    #[test]
    fn blocking_all_signals_then_restoring() {
        // Own thread: the mask is per thread and the harness shares its workers.
        std::thread::spawn(|| {
            let mut old = 0u64;
            sys_rt_sigprocmask(SIG_SETMASK, Some(&ALL_SIGNALS), Some(&mut old)).unwrap();
            let mut blocked = 0u64;
            sys_rt_sigprocmask(SIG_SETMASK, Some(&old), Some(&mut blocked)).unwrap();
            let usr1 = 1u64 << (libc::SIGUSR1 - 1);
            let kill = 1u64 << (libc::SIGKILL - 1);
            assert_ne!(blocked & usr1, 0);
            // The kernel silently refuses to block SIGKILL.
            assert_eq!(blocked & kill, 0);

            let mut restored = 0u64;
            sys_rt_sigprocmask(SIG_SETMASK, None, Some(&mut restored)).unwrap();
            assert_eq!(restored, old);
        })
        .join()
        .unwrap();
    }
}
