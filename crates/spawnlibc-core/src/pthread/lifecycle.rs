//! Child start and exit paths, join and detach.
//!
//! Join state protocol:
//!
//! | from            | to              | by                                 |
//! |-----------------|-----------------|------------------------------------|
//! | NotJoined       | ExitedNotJoined | exiting thread                     |
//! | NotJoined       | Joined          | joiner (waits for the tid to clear)|
//! | ExitedNotJoined | Joined          | joiner (tid clears shortly)        |
//! | NotJoined       | Detached        | `detach`                           |
//!
//! A thread that exits while Detached unmaps itself. Every other mapping is
//! released by its joiner.

use core::ffi::c_void;
use core::ptr::{NonNull, null_mut};
use core::sync::atomic::Ordering;

use crate::errno::{EINVAL, ESRCH};
use crate::os::ThreadExit;
use crate::pthread::internal::{JoinState, ThreadBookkeeping};
use crate::pthread::platform::{
    NativePlatform, Platform, free_alternate_signal_stack, init_alternate_signal_stack,
};
use crate::pthread::registry::ThreadHandle;
use crate::runtime::Runtime;

/// Entry swapped in for threads whose creation failed after spawn.
pub(crate) extern "C" fn do_nothing(_arg: *mut c_void) -> *mut c_void {
    null_mut()
}

/// First code a spawned thread runs. `arg` is its bookkeeping address.
#[allow(unsafe_code)]
pub(crate) fn thread_start(arg: usize) -> ThreadExit {
    // SAFETY: the creator passes the bookkeeping of this thread, which
    // stays mapped until this thread exits or is joined.
    let thread = unsafe { &*(arg as *const ThreadBookkeeping) };
    // SAFETY: runtimes are `'static`.
    let runtime = unsafe { &*thread.runtime };
    let os = runtime.os;

    thread.startup_gate.wait(os);

    NativePlatform::install_thread_state(os, thread);
    if runtime.config.alternate_signal_stack {
        init_alternate_signal_stack(os, thread);
    }

    let value = match thread.entry() {
        Some((entry, arg)) => entry(arg),
        None => null_mut(),
    };
    exit(runtime, thread, value)
}

/// Exit path of a spawned thread: store `value` for a joiner, release the
/// per-thread extras, and decide who frees the mapping.
pub(crate) fn exit(runtime: &Runtime, thread: &ThreadBookkeeping, value: *mut c_void) -> ThreadExit {
    let os = runtime.os;
    thread.set_return_value(value);
    free_alternate_signal_stack(os, thread);
    NativePlatform::release_thread_state(os, thread);

    match thread.transition_join_state(JoinState::NotJoined, JoinState::ExitedNotJoined) {
        Ok(()) => ThreadExit::Exit,
        Err(JoinState::Detached) => {
            let (base, len) = (thread.mmap_base, thread.mmap_size);
            runtime
                .registry
                .remove(ThreadHandle::from_bookkeeping(NonNull::from(thread)));
            ThreadExit::ExitAndUnmap { base, len }
        }
        // Already joined: the joiner frees the mapping once the tid clears.
        Err(_) => ThreadExit::Exit,
    }
}

/// Wait for `handle` to exit, release its mapping and return its value.
#[allow(unsafe_code)]
pub fn join(runtime: &Runtime, handle: ThreadHandle) -> Result<*mut c_void, i32> {
    if !runtime.registry.contains(handle) {
        return Err(ESRCH);
    }
    // SAFETY: registered joinable threads stay mapped until joined.
    let thread = unsafe { &*handle.as_ptr() };

    loop {
        let current = thread.join_state();
        if matches!(current, JoinState::Detached | JoinState::Joined) {
            return Err(EINVAL);
        }
        if thread.transition_join_state(current, JoinState::Joined).is_ok() {
            break;
        }
    }

    let os = runtime.os;
    let tid = thread.tid_futex();
    loop {
        let value = tid.load(Ordering::Acquire);
        if value == 0 {
            break;
        }
        os.futex_wait(tid, value);
    }

    let value = thread.return_value();
    let (base, len) = (thread.mmap_base, thread.mmap_size);
    runtime.registry.remove(handle);
    if let Err(errno) = os.release(base, len) {
        log::warn!("releasing joined thread mapping {base:#x}+{len} failed: errno {errno}");
    }
    log::trace!("joined thread {:#x}", handle.as_raw());
    Ok(value)
}

/// Make `handle` release its own resources on exit. A thread that already
/// exited is joined instead.
#[allow(unsafe_code)]
pub fn detach(runtime: &Runtime, handle: ThreadHandle) -> Result<(), i32> {
    if !runtime.registry.contains(handle) {
        return Err(ESRCH);
    }
    // SAFETY: as in `join`; only detached threads unmap themselves.
    let thread = unsafe { &*handle.as_ptr() };

    loop {
        match thread.join_state() {
            JoinState::Detached | JoinState::Joined => return Err(EINVAL),
            JoinState::ExitedNotJoined => return join(runtime, handle).map(|_| ()),
            JoinState::NotJoined => {
                if thread
                    .transition_join_state(JoinState::NotJoined, JoinState::Detached)
                    .is_ok()
                {
                    return Ok(());
                }
            }
        }
    }
}
