//! In-process simulation of the OS capability layer.
//!
//! `SimOs` hands out zeroed, page-aligned heap blocks instead of mappings and
//! runs every spawned thread's entry on a `std` thread. It keeps an exact
//! ledger of live regions and of every scheduling and spawn call, and it can
//! be told to fail specific calls. Protection changes are recorded but not
//! enforced.

use core::ffi::CStr;
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::alloc::{self, Layout};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use super::{ChildStart, CloneFlags, Os, Protection, SpawnRequest, ThreadExit};
use crate::errno::{EINVAL, ENOMEM};
use crate::random::{RandomSource, SplitMix64};

/// Default simulated page size.
pub const SIM_PAGE_SIZE: usize = 4096;

/// Calls that can be made to fail, each with the errno to report.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FaultPlan {
    pub reserve: Option<i32>,
    /// `(successes_before_failure, errno)` for `protect`.
    pub protect: Option<(usize, i32)>,
    pub spawn: Option<i32>,
    pub sched_getscheduler: Option<i32>,
    pub sched_getparam: Option<i32>,
    pub sched_setscheduler: Option<i32>,
}

/// One recorded `spawn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnRecord {
    pub tid: i32,
    pub flags: CloneFlags,
    pub stack_top: usize,
    pub thread_pointer: Option<usize>,
}

/// One recorded `protect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectRecord {
    pub addr: usize,
    pub len: usize,
    pub prot: Protection,
}

/// One recorded `sched_setscheduler`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedSetRecord {
    pub tid: i32,
    pub policy: i32,
    pub priority: i32,
}

#[derive(Debug, Clone, Copy)]
struct Region {
    len: usize,
    align: usize,
}

#[derive(Debug, Default)]
struct Ledger {
    live: BTreeMap<usize, Region>,
    reservations: usize,
    read_write_maps: usize,
    protects: Vec<ProtectRecord>,
    names: Vec<(usize, usize, &'static CStr)>,
    spawns: Vec<SpawnRecord>,
    sched_sets: Vec<SchedSetRecord>,
    getscheduler_calls: usize,
    getparam_calls: usize,
    alt_stack_installs: usize,
    alt_stack_removals: usize,
    faults: FaultPlan,
}

#[derive(Debug)]
struct Inner {
    page_size: usize,
    rng: SplitMix64,
    pid: AtomicI32,
    next_tid: AtomicI32,
    sched: Mutex<(i32, i32)>,
    ledger: Mutex<Ledger>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn allocate(&self, len: usize) -> Result<usize, i32> {
        if len == 0 {
            return Err(EINVAL);
        }
        let layout = Layout::from_size_align(len, self.page_size).map_err(|_| ENOMEM)?;
        // SAFETY: `layout` has non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(ENOMEM);
        }
        let addr = ptr as usize;
        self.ledger.lock().live.insert(
            addr,
            Region {
                len,
                align: self.page_size,
            },
        );
        Ok(addr)
    }

    fn release(&self, addr: usize, len: usize) -> Result<(), i32> {
        let region = {
            let mut ledger = self.ledger.lock();
            match ledger.live.get(&addr) {
                Some(region) if region.len == len => {}
                _ => return Err(EINVAL),
            }
            ledger.live.remove(&addr).ok_or(EINVAL)?
        };
        let layout = Layout::from_size_align(region.len, region.align).map_err(|_| EINVAL)?;
        // SAFETY: `addr` came from `alloc_zeroed` with this exact layout and
        // was removed from the ledger, so it is freed once.
        unsafe { alloc::dealloc(addr as *mut u8, layout) };
        Ok(())
    }

    fn contains(&self, addr: usize, len: usize) -> bool {
        let ledger = self.ledger.lock();
        ledger
            .live
            .range(..=addr)
            .next_back()
            .is_some_and(|(&base, region)| {
                addr.checked_add(len)
                    .is_some_and(|end| end <= base + region.len)
            })
    }
}

/// Simulated kernel. Cheap to clone; clones share one ledger.
#[derive(Debug, Clone)]
pub struct SimOs {
    inner: Arc<Inner>,
}

impl SimOs {
    /// A simulation with 4 KiB pages, pid 1000 and `SCHED_OTHER` priority 0.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self::with_page_size(seed, SIM_PAGE_SIZE)
    }

    #[must_use]
    pub fn with_page_size(seed: u64, page_size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                page_size,
                rng: SplitMix64::new(seed),
                pid: AtomicI32::new(1000),
                next_tid: AtomicI32::new(1001),
                sched: Mutex::new((libc::SCHED_OTHER, 0)),
                ledger: Mutex::new(Ledger::default()),
                threads: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Leak a simulation to get the `'static` borrow a runtime needs.
    #[must_use]
    pub fn leak(self) -> &'static Self {
        Box::leak(Box::new(self))
    }

    pub fn set_pid(&self, pid: i32) {
        self.inner.pid.store(pid, Ordering::Relaxed);
    }

    /// Scheduling the calling thread reports through the query calls.
    pub fn set_current_scheduling(&self, policy: i32, priority: i32) {
        *self.inner.sched.lock() = (policy, priority);
    }

    pub fn set_faults(&self, faults: FaultPlan) {
        self.inner.ledger.lock().faults = faults;
    }

    pub fn clear_faults(&self) {
        self.set_faults(FaultPlan::default());
    }

    /// Number of regions currently reserved or mapped.
    #[must_use]
    pub fn live_regions(&self) -> usize {
        self.inner.ledger.lock().live.len()
    }

    /// Total bytes currently reserved or mapped.
    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.inner.ledger.lock().live.values().map(|r| r.len).sum()
    }

    /// Successful `reserve` calls so far.
    #[must_use]
    pub fn reservation_count(&self) -> usize {
        self.inner.ledger.lock().reservations
    }

    /// Successful `map_read_write` calls so far.
    #[must_use]
    pub fn read_write_map_count(&self) -> usize {
        self.inner.ledger.lock().read_write_maps
    }

    #[must_use]
    pub fn protect_calls(&self) -> Vec<ProtectRecord> {
        self.inner.ledger.lock().protects.clone()
    }

    #[must_use]
    pub fn region_names(&self) -> Vec<(usize, usize, &'static CStr)> {
        self.inner.ledger.lock().names.clone()
    }

    #[must_use]
    pub fn spawns(&self) -> Vec<SpawnRecord> {
        self.inner.ledger.lock().spawns.clone()
    }

    #[must_use]
    pub fn sched_set_calls(&self) -> Vec<SchedSetRecord> {
        self.inner.ledger.lock().sched_sets.clone()
    }

    #[must_use]
    pub fn getscheduler_calls(&self) -> usize {
        self.inner.ledger.lock().getscheduler_calls
    }

    #[must_use]
    pub fn getparam_calls(&self) -> usize {
        self.inner.ledger.lock().getparam_calls
    }

    /// `(installs, removals)` of alternate signal stacks.
    #[must_use]
    pub fn alternate_stack_calls(&self) -> (usize, usize) {
        let ledger = self.inner.ledger.lock();
        (ledger.alt_stack_installs, ledger.alt_stack_removals)
    }

    /// Wait until every simulated thread spawned so far has finished.
    pub fn wait_for_threads(&self) {
        loop {
            let batch: Vec<_> = self.inner.threads.lock().drain(..).collect();
            if batch.is_empty() {
                return;
            }
            for handle in batch {
                // A panicking simulated thread already failed its test.
                let _ = handle.join();
            }
        }
    }
}

impl RandomSource for SimOs {
    fn next_u64(&self) -> u64 {
        self.inner.rng.next_u64()
    }
}

/// Raw addresses moved into the simulated thread.
struct ChildContext {
    inner: Arc<Inner>,
    tid_slot: usize,
    tid: i32,
    flags: CloneFlags,
    start: ChildStart,
}

impl ChildContext {
    fn tid_word(&self) -> &AtomicI32 {
        // SAFETY: the spawn caller keeps the tid slot alive and aligned for
        // the thread's lifetime.
        unsafe { AtomicI32::from_ptr(self.tid_slot as *mut i32) }
    }

    fn run(self) {
        if self.flags.contains(CloneFlags::CHILD_SETTID) {
            self.tid_word().store(self.tid, Ordering::Release);
        }
        match (self.start.main)(self.start.arg) {
            ThreadExit::Exit => {
                if self.flags.contains(CloneFlags::CHILD_CLEARTID) {
                    self.tid_word().store(0, Ordering::Release);
                }
            }
            ThreadExit::ExitAndUnmap { base, len } => {
                let _ = self.inner.release(base, len);
            }
        }
    }
}

impl Os for SimOs {
    fn page_size(&self) -> usize {
        self.inner.page_size
    }

    fn reserve(&self, len: usize) -> Result<usize, i32> {
        if let Some(errno) = self.inner.ledger.lock().faults.reserve {
            return Err(errno);
        }
        let addr = self.inner.allocate(len)?;
        self.inner.ledger.lock().reservations += 1;
        Ok(addr)
    }

    fn map_read_write(&self, len: usize) -> Result<usize, i32> {
        let addr = self.inner.allocate(len)?;
        self.inner.ledger.lock().read_write_maps += 1;
        Ok(addr)
    }

    fn protect(&self, addr: usize, len: usize, prot: Protection) -> Result<(), i32> {
        if !self.inner.contains(addr, len) {
            return Err(EINVAL);
        }
        let mut ledger = self.inner.ledger.lock();
        if let Some((remaining, errno)) = ledger.faults.protect {
            if remaining == 0 {
                ledger.faults.protect = None;
                return Err(errno);
            }
            ledger.faults.protect = Some((remaining - 1, errno));
        }
        ledger.protects.push(ProtectRecord { addr, len, prot });
        Ok(())
    }

    fn release(&self, addr: usize, len: usize) -> Result<(), i32> {
        self.inner.release(addr, len)
    }

    fn name_region(&self, addr: usize, len: usize, name: &'static CStr) -> Result<(), i32> {
        if !self.inner.contains(addr, len) {
            return Err(EINVAL);
        }
        self.inner.ledger.lock().names.push((addr, len, name));
        Ok(())
    }

    fn set_alternate_signal_stack(&self, stack: Option<(usize, usize)>) -> Result<(), i32> {
        let mut ledger = self.inner.ledger.lock();
        match stack {
            Some(_) => ledger.alt_stack_installs += 1,
            None => ledger.alt_stack_removals += 1,
        }
        Ok(())
    }

    fn getpid(&self) -> i32 {
        self.inner.pid.load(Ordering::Relaxed)
    }

    fn sched_getscheduler(&self) -> Result<i32, i32> {
        let mut ledger = self.inner.ledger.lock();
        ledger.getscheduler_calls += 1;
        if let Some(errno) = ledger.faults.sched_getscheduler {
            return Err(errno);
        }
        Ok(self.inner.sched.lock().0)
    }

    fn sched_getparam(&self) -> Result<i32, i32> {
        let mut ledger = self.inner.ledger.lock();
        ledger.getparam_calls += 1;
        if let Some(errno) = ledger.faults.sched_getparam {
            return Err(errno);
        }
        Ok(self.inner.sched.lock().1)
    }

    fn sched_setscheduler(&self, tid: i32, policy: i32, priority: i32) -> Result<(), i32> {
        let mut ledger = self.inner.ledger.lock();
        ledger.sched_sets.push(SchedSetRecord {
            tid,
            policy,
            priority,
        });
        match ledger.faults.sched_setscheduler {
            Some(errno) => Err(errno),
            None => Ok(()),
        }
    }

    fn futex_wait(&self, word: &AtomicU32, expected: u32) {
        if word.load(Ordering::Acquire) == expected {
            std::thread::sleep(Duration::from_micros(50));
        }
    }

    fn futex_wake(&self, _word: *const AtomicU32) {}

    unsafe fn spawn(&self, request: SpawnRequest) -> Result<i32, i32> {
        {
            let ledger = self.inner.ledger.lock();
            if let Some(errno) = ledger.faults.spawn {
                return Err(errno);
            }
        }
        let tid = self.inner.next_tid.fetch_add(1, Ordering::Relaxed);
        let context = ChildContext {
            inner: Arc::clone(&self.inner),
            tid_slot: request.tid_slot as usize,
            tid,
            flags: request.flags,
            start: request.start,
        };
        if request.flags.contains(CloneFlags::PARENT_SETTID) {
            context.tid_word().store(tid, Ordering::Release);
        }
        self.inner.ledger.lock().spawns.push(SpawnRecord {
            tid,
            flags: request.flags,
            stack_top: request.stack_top,
            thread_pointer: request.thread_pointer,
        });

        let handle = std::thread::Builder::new()
            .name(format!("sim-{tid}"))
            .spawn(move || context.run())
            .map_err(|_| crate::errno::EAGAIN)?;
        self.inner.threads.lock().push(handle);
        Ok(tid)
    }
}
