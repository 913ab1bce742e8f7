//! Thread creation.
//!
//! 1. Plan scheduling (may fail before anything is allocated).
//! 2. Allocate and initialize the mapping ([`Progress::MappingReserved`]).
//! 3. Spawn the kernel thread parked on its startup gate
//!    ([`Progress::KernelThreadSpawned`]).
//! 4. Apply scheduling and register ([`Progress::PostInitComplete`]).
//! 5. Open the gate and hand out the handle ([`Progress::Published`]).

use core::ffi::c_void;
use core::ptr::NonNull;
use core::sync::atomic::Ordering;

use thiserror::Error;

use crate::config::ThreadPointerMode;
use crate::diag_warn;
use crate::errno::errno_name;
use crate::os::{ChildStart, CloneFlags, SpawnRequest};
use crate::pthread::attr::ThreadAttributes;
use crate::pthread::gate::StartupGate;
use crate::pthread::internal::{JoinState, ThreadBookkeeping, ThreadEntry};
use crate::pthread::lifecycle::{do_nothing, thread_start};
use crate::pthread::mapping::{AllocError, MappingReservation, allocate_thread};
use crate::pthread::registry::ThreadHandle;
use crate::pthread::sched::{apply_scheduling, plan_scheduling};
use crate::pthread::unwind::{Progress, UnwindAction};
use crate::runtime::Runtime;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CreateError {
    #[error("pthread_create failed: {0}")]
    Allocation(#[from] AllocError),
    #[error("pthread_create {call} failed: {}", errno_name(*.errno))]
    SchedQuery { call: &'static str, errno: i32 },
    #[error("pthread_create sched_setscheduler({policy}, {{{priority}}}) call failed: {}", errno_name(*.errno))]
    SchedApply { policy: i32, priority: i32, errno: i32 },
    #[error("pthread_create failed: clone failed: {}", errno_name(*.0))]
    Spawn(i32),
}

impl CreateError {
    /// The value `pthread_create` returns for this failure.
    #[must_use]
    pub const fn errno(&self) -> i32 {
        match self {
            Self::Allocation(err) => err.errno(),
            Self::SchedQuery { errno, .. } | Self::SchedApply { errno, .. } | Self::Spawn(errno) => *errno,
        }
    }
}

/// Create a thread running `entry(arg)`.
#[allow(unsafe_code)]
pub fn create(
    runtime: &'static Runtime,
    attr: &ThreadAttributes,
    entry: ThreadEntry,
    arg: *mut c_void,
) -> Result<ThreadHandle, CreateError> {
    let os = runtime.os;
    let diag = runtime.diag;

    let plan = plan_scheduling(os, diag, attr)?;
    let prepared = allocate_thread(runtime, attr)?;
    let thread_ptr = prepared.thread;
    // SAFETY: freshly initialized and not yet visible to any other thread.
    let thread = unsafe { thread_ptr.as_ref() };
    thread.set_entry(entry, arg);
    thread.cached_pid.store(os.getpid(), Ordering::Relaxed);

    let mut flags = CloneFlags::THREAD_DEFAULT;
    let thread_pointer = match runtime.config.thread_pointer {
        ThreadPointerMode::Install => {
            flags |= CloneFlags::SETTLS;
            // SAFETY: initialized by `allocate_thread`.
            Some(unsafe { prepared.tcb.as_ref() }.thread_pointer(&runtime.tcb_layout()))
        }
        ThreadPointerMode::Inherit => None,
    };
    let request = SpawnRequest {
        flags,
        stack_top: prepared.stack_top,
        thread_pointer,
        tid_slot: thread.tid_slot(),
        start: ChildStart {
            main: thread_start,
            arg: thread_ptr.as_ptr() as usize,
        },
    };
    log::trace!(
        "spawning thread {:#x}: mapping {:#x}+{}, stack top {:#x}",
        thread_ptr.as_ptr() as usize,
        prepared.reservation.base(),
        prepared.reservation.len(),
        prepared.stack_top
    );

    // SAFETY: the stack, tid slot and bookkeeping live in the reservation,
    // which stays mapped until the thread exits or is joined.
    let tid = match unsafe { os.spawn(request) } {
        Ok(tid) => tid,
        Err(errno) => {
            let err = CreateError::Spawn(errno);
            unwind(runtime, Progress::MappingReserved, thread_ptr, Some(prepared.reservation));
            diag_warn!(diag, "{err}");
            return Err(err);
        }
    };
    prepared.reservation.hand_over_to_thread();

    if let Err(err) = apply_scheduling(os, diag, tid, plan, runtime.config.sched_failure) {
        unwind(runtime, Progress::KernelThreadSpawned, thread_ptr, None);
        return Err(err);
    }

    let handle = runtime.registry.register(thread_ptr);
    // SAFETY: the thread is parked on the gate, so its bookkeeping is live.
    unsafe { StartupGate::open(&thread.startup_gate, os) };
    log::trace!("published thread {:#x} (tid {tid})", handle.as_raw());
    Ok(handle)
}

/// Undo a creation that failed after reaching `progress`.
#[allow(unsafe_code)]
fn unwind(
    runtime: &Runtime,
    progress: Progress,
    thread: NonNull<ThreadBookkeeping>,
    reservation: Option<MappingReservation<'_>>,
) {
    log::debug!("unwinding thread creation at {progress:?}");
    let os = runtime.os;
    match progress.unwind_action() {
        UnwindAction::ReleaseMapping => {
            // SAFETY: the mapping is still ours and nothing waits on the gate.
            unsafe { StartupGate::open(core::ptr::addr_of!((*thread.as_ptr()).startup_gate), os) };
            drop(reservation);
        }
        UnwindAction::RetireSpawnedThread => {
            // SAFETY: the child is parked on the gate; only we touch it.
            let bookkeeping = unsafe { thread.as_ref() };
            bookkeeping.force_join_state(JoinState::Detached);
            bookkeeping.replace_entry(do_nothing);
            runtime.registry.register(thread);
            // SAFETY: live until the child passes the gate and exits.
            unsafe { StartupGate::open(&bookkeeping.startup_gate, os) };
        }
        UnwindAction::None => {}
    }
}
