#![allow(unsafe_code)]

use core::ffi::c_void;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use spawnlibc_core::config::{RuntimeConfig, SchedFailurePolicy};
use spawnlibc_core::diag::RecordingSink;
use spawnlibc_core::errno::{EAGAIN, EPERM};
use spawnlibc_core::os::Protection;
use spawnlibc_core::os::sim::{FaultPlan, SIM_PAGE_SIZE, SimOs};
use spawnlibc_core::pthread::globals::ProcessGlobals;
use spawnlibc_core::pthread::internal::ThreadBookkeeping;
use spawnlibc_core::pthread::{
    AllocError, CreateError, ListRegistry, SchedInheritance, ThreadAttributes, ThreadHandle,
    ThreadRegistry, create, join,
};
use spawnlibc_core::runtime::Runtime;

const STACK: usize = 32 * SIM_PAGE_SIZE;

struct Harness {
    os: &'static SimOs,
    diag: &'static RecordingSink,
    runtime: &'static Runtime,
}

fn harness_with(config: RuntimeConfig, registry: &'static dyn ThreadRegistry) -> Harness {
    let os = SimOs::new(0xC0FFEE).leak();
    let diag: &'static RecordingSink = Box::leak(Box::new(RecordingSink::new()));
    let globals = ProcessGlobals::minimal(os).unwrap().leak();
    let runtime = Runtime::new(os, registry, diag, globals, config).leak();
    Harness { os, diag, runtime }
}

fn harness(config: RuntimeConfig) -> Harness {
    harness_with(config, ListRegistry::new().leak())
}

extern "C" fn add_one(arg: *mut c_void) -> *mut c_void {
    (arg as usize + 1) as *mut c_void
}

// ---------------------------------------------------------------------------
// Scenario A: default attributes
// ---------------------------------------------------------------------------

#[test]
fn default_attributes_run_entry_and_join_returns_value() {
    let h = harness(RuntimeConfig::default());
    let handle = create(h.runtime, &ThreadAttributes::default(), add_one, 41 as *mut c_void).unwrap();
    assert_eq!(join(h.runtime, handle), Ok(42 as *mut c_void));
    h.os.wait_for_threads();

    assert_eq!(h.os.reservation_count(), 1);
    assert_eq!(h.os.live_regions(), 0);
    assert!(h.runtime.registry.is_empty());
    assert!(h.diag.lines().is_empty());
}

// ---------------------------------------------------------------------------
// Scenario B: caller-provided stack
// ---------------------------------------------------------------------------

#[test]
fn caller_stack_maps_only_thread_block_and_starts_at_buffer_top() {
    let h = harness(RuntimeConfig::default());
    let buffer = vec![0u8; 16 * SIM_PAGE_SIZE];
    let base = buffer.as_ptr() as usize;
    let attr = ThreadAttributes::default()
        .with_caller_stack(base, buffer.len())
        .with_guard_size(SIM_PAGE_SIZE);

    let handle = create(h.runtime, &attr, add_one, core::ptr::null_mut()).unwrap();
    let spawns = h.os.spawns();
    assert_eq!(spawns[0].stack_top, base + buffer.len());

    let protects = h.os.protect_calls();
    let thread_block_grants: Vec<_> = protects
        .iter()
        .filter(|p| p.prot == Protection::READ_WRITE)
        .collect();
    assert_eq!(thread_block_grants.len(), 1, "only the thread block is made accessible");
    assert!(thread_block_grants[0].len < buffer.len());

    assert_eq!(join(h.runtime, handle), Ok(1 as *mut c_void));
    h.os.wait_for_threads();
    assert_eq!(h.os.live_regions(), 0);
}

// ---------------------------------------------------------------------------
// Scenario C: inherited scheduling without reset-on-fork
// ---------------------------------------------------------------------------

#[test]
fn inherited_scheduling_skips_param_query_and_apply() {
    let h = harness(RuntimeConfig::default());
    h.os.set_current_scheduling(libc::SCHED_OTHER, 0);
    let attr = ThreadAttributes::default()
        .with_stack_size(STACK)
        .with_scheduling(SchedInheritance::Inherit, libc::SCHED_FIFO, 99);

    let handle = create(h.runtime, &attr, add_one, core::ptr::null_mut()).unwrap();
    join(h.runtime, handle).unwrap();
    h.os.wait_for_threads();

    assert_eq!(h.os.getscheduler_calls(), 1);
    assert_eq!(h.os.getparam_calls(), 0);
    assert!(h.os.sched_set_calls().is_empty());
}

#[test]
fn inherited_reset_on_fork_scheduling_is_reapplied_to_child() {
    let h = harness(RuntimeConfig::default());
    let policy = libc::SCHED_RR | libc::SCHED_RESET_ON_FORK;
    h.os.set_current_scheduling(policy, 5);
    let attr = ThreadAttributes::default()
        .with_stack_size(STACK)
        .with_scheduling(SchedInheritance::Inherit, 0, 0);

    let handle = create(h.runtime, &attr, add_one, core::ptr::null_mut()).unwrap();
    join(h.runtime, handle).unwrap();
    h.os.wait_for_threads();

    let sets = h.os.sched_set_calls();
    assert_eq!(sets.len(), 1);
    assert_eq!((sets[0].policy, sets[0].priority), (policy, 5));
    assert_eq!(sets[0].tid, h.os.spawns()[0].tid);
}

// ---------------------------------------------------------------------------
// Scenario D: explicit realtime scheduling refused
// ---------------------------------------------------------------------------

static ENTRIES_RUN: AtomicUsize = AtomicUsize::new(0);

extern "C" fn must_not_run(_arg: *mut c_void) -> *mut c_void {
    ENTRIES_RUN.fetch_add(1, Ordering::SeqCst);
    core::ptr::null_mut()
}

#[test]
fn refused_realtime_policy_surfaces_eperm_without_leaks() {
    let config = RuntimeConfig {
        sched_failure: SchedFailurePolicy::Surface,
        ..RuntimeConfig::default()
    };
    let h = harness(config);
    h.os.set_faults(FaultPlan {
        sched_setscheduler: Some(EPERM),
        ..FaultPlan::default()
    });
    let attr = ThreadAttributes::default()
        .with_stack_size(STACK)
        .with_scheduling(SchedInheritance::Explicit, libc::SCHED_FIFO, 50);

    let err = create(h.runtime, &attr, must_not_run, core::ptr::null_mut()).unwrap_err();
    assert_eq!(err.errno(), EPERM);
    assert!(matches!(err, CreateError::SchedApply { .. }));

    // The spawned thread retires itself through its ordinary exit path.
    h.os.wait_for_threads();
    assert_eq!(ENTRIES_RUN.load(Ordering::SeqCst), 0);
    assert_eq!(h.os.spawns().len(), 1);
    assert_eq!(h.os.live_regions(), 0);
    assert_eq!(h.os.live_bytes(), 0);
    assert!(h.runtime.registry.is_empty());
    assert!(h.diag.contains("sched_setscheduler"));
}

// ---------------------------------------------------------------------------
// Handshake visibility
// ---------------------------------------------------------------------------

/// Registry that remembers the most recent registration, the last write
/// the creator makes before opening the gate.
struct LastRegistered {
    inner: ListRegistry,
    last: AtomicUsize,
}

impl ThreadRegistry for LastRegistered {
    fn register(&self, thread: NonNull<ThreadBookkeeping>) -> ThreadHandle {
        let handle = self.inner.register(thread);
        self.last.store(handle.as_raw(), Ordering::Relaxed);
        handle
    }

    fn contains(&self, handle: ThreadHandle) -> bool {
        self.inner.contains(handle)
    }

    fn remove(&self, handle: ThreadHandle) -> bool {
        self.inner.remove(handle)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

static LAST_REGISTERED: LastRegistered = LastRegistered {
    inner: ListRegistry::new(),
    last: AtomicUsize::new(0),
};

/// Returns 1 when every field the creator wrote is visible.
extern "C" fn observe_creator_writes(arg: *mut c_void) -> *mut c_void {
    let last = LAST_REGISTERED.last.load(Ordering::Relaxed);
    if last == 0 {
        return core::ptr::null_mut();
    }
    let thread = unsafe { &*(last as *const ThreadBookkeeping) };
    let ok = thread.cached_pid.load(Ordering::Relaxed) == 4242
        && thread.tid.load(Ordering::Relaxed) != 0
        && thread.entry().map(|(_, a)| a) == Some(arg)
        && LAST_REGISTERED.inner.len() == 1;
    (ok as usize) as *mut c_void
}

#[test]
fn child_observes_all_writes_made_before_gate_opens() {
    let h = harness_with(RuntimeConfig::default(), &LAST_REGISTERED);
    h.os.set_pid(4242);
    for round in 0..20usize {
        let arg = (0x1000 + round) as *mut c_void;
        let handle = create(
            h.runtime,
            &ThreadAttributes::default().with_stack_size(STACK),
            observe_creator_writes,
            arg,
        )
        .unwrap();
        assert_eq!(join(h.runtime, handle), Ok(1 as *mut c_void), "round {round}");
    }
    h.os.wait_for_threads();
    assert_eq!(h.os.live_regions(), 0);
}

// ---------------------------------------------------------------------------
// Failure accounting
// ---------------------------------------------------------------------------

#[test]
fn overflowing_request_reserves_nothing() {
    let h = harness(RuntimeConfig::default());
    for attr in [
        ThreadAttributes::default().with_stack_size(usize::MAX),
        ThreadAttributes::default().with_guard_size(usize::MAX - 1),
        ThreadAttributes::default()
            .with_stack_size(usize::MAX / 2)
            .with_guard_size(usize::MAX / 2),
    ] {
        let err = create(h.runtime, &attr, add_one, core::ptr::null_mut()).unwrap_err();
        assert_eq!(err, CreateError::Allocation(AllocError::Overflow));
        assert_eq!(err.errno(), EAGAIN);
    }
    assert_eq!(h.os.reservation_count(), 0);
    assert!(h.os.spawns().is_empty());
}

#[test]
fn each_allocation_step_failure_leaves_zero_mappings() {
    let faults = [
        FaultPlan {
            reserve: Some(libc::ENOMEM),
            ..FaultPlan::default()
        },
        FaultPlan {
            protect: Some((0, libc::ENOMEM)),
            ..FaultPlan::default()
        },
        FaultPlan {
            protect: Some((1, libc::ENOMEM)),
            ..FaultPlan::default()
        },
    ];
    for plan in faults {
        let h = harness(RuntimeConfig::default());
        h.os.set_faults(plan);
        let attr = ThreadAttributes::default().with_stack_size(STACK);
        let err = create(h.runtime, &attr, add_one, core::ptr::null_mut()).unwrap_err();
        assert_eq!(err.errno(), EAGAIN, "{plan:?}");
        assert_eq!(h.os.live_regions(), 0, "{plan:?}");
        assert!(h.os.spawns().is_empty());
        assert_eq!(h.diag.lines().len(), 1);
    }
}

#[test]
fn spawn_failure_returns_os_error_and_releases_mapping() {
    let h = harness(RuntimeConfig::default());
    h.os.set_faults(FaultPlan {
        spawn: Some(EAGAIN),
        ..FaultPlan::default()
    });
    let err = create(
        h.runtime,
        &ThreadAttributes::default().with_stack_size(STACK),
        add_one,
        core::ptr::null_mut(),
    )
    .unwrap_err();
    assert_eq!(err, CreateError::Spawn(EAGAIN));
    assert_eq!(h.os.live_regions(), 0);
    assert!(h.runtime.registry.is_empty());

    h.os.clear_faults();
    let handle = create(
        h.runtime,
        &ThreadAttributes::default().with_stack_size(STACK),
        add_one,
        core::ptr::null_mut(),
    )
    .unwrap();
    join(h.runtime, handle).unwrap();
    h.os.wait_for_threads();
    assert_eq!(h.os.live_regions(), 0);
}

#[test]
fn many_detached_threads_free_themselves() {
    let h = harness(RuntimeConfig::default());
    let attr = ThreadAttributes::detached().with_stack_size(STACK);
    for i in 0..32usize {
        create(h.runtime, &attr, add_one, i as *mut c_void).unwrap();
    }
    h.os.wait_for_threads();
    assert_eq!(h.os.reservation_count(), 32);
    assert_eq!(h.os.live_regions(), 0);
    assert!(h.runtime.registry.is_empty());
    let (installs, removals) = h.os.alternate_stack_calls();
    assert_eq!(installs, removals);
}
