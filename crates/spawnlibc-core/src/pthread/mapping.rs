//! Region allocator: one mapping per thread, carved into protected parts.
//!
//! The whole mapping is reserved inaccessible, then the usable stack and
//! the thread block plus static TLS are made read-write. A failure at any
//! step releases the reservation before returning, so callers never see a
//! partial mapping.

use core::mem::size_of;
use core::ptr::NonNull;

use thiserror::Error;

use crate::diag::DiagnosticSink;
use crate::diag_warn;
use crate::errno::{EAGAIN, errno_name};
use crate::os::{Os, Protection};
use crate::pthread::attr::ThreadAttributes;
use crate::pthread::internal::{ResolvedAttributes, ThreadBookkeeping, ThreadLocals};
use crate::pthread::layout::{LayoutRequest, MappingLayout, compute_layout, randomized_stack_top, round_up};
use crate::pthread::tcb::Tcb;
use crate::runtime::Runtime;

/// Why a thread mapping could not be produced. Every variant reports
/// `EAGAIN` to the caller.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    #[error("thread mapping size overflows the address space")]
    Overflow,
    #[error("couldn't allocate {size}-bytes mapped space: {}", errno_name(*.errno))]
    Reserve { size: usize, errno: i32 },
    #[error("couldn't mprotect R+W {size}-byte thread mapping region: {}", errno_name(*.errno))]
    Protect { size: usize, errno: i32 },
}

impl AllocError {
    #[must_use]
    pub const fn errno(&self) -> i32 {
        EAGAIN
    }
}

// ---------------------------------------------------------------------------
// Ownership
// ---------------------------------------------------------------------------

/// A reserved mapping that is released on drop unless handed off.
pub struct MappingReservation<'os> {
    os: &'os dyn Os,
    base: usize,
    len: usize,
}

impl<'os> MappingReservation<'os> {
    fn new(os: &'os dyn Os, base: usize, len: usize) -> Self {
        Self { os, base, len }
    }

    #[must_use]
    pub fn base(&self) -> usize {
        self.base
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Stop owning the mapping once a spawned thread exists to inherit it.
    /// The thread's bookkeeping (`mmap_base`, `mmap_size`) describes it from
    /// then on, and its joiner or its detached exit path releases it.
    pub fn hand_over_to_thread(self) {
        core::mem::forget(self);
    }

    /// Release now, reporting the OS result.
    pub fn release(self) -> Result<(), i32> {
        let (os, base, len) = (self.os, self.base, self.len);
        core::mem::forget(self);
        os.release(base, len)
    }
}

impl core::fmt::Debug for MappingReservation<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MappingReservation")
            .field("base", &format_args!("{:#x}", self.base))
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for MappingReservation<'_> {
    fn drop(&mut self) {
        let _ = self.os.release(self.base, self.len);
    }
}

// ---------------------------------------------------------------------------
// Thread mapping
// ---------------------------------------------------------------------------

/// Inputs for [`allocate_thread_mapping`].
#[derive(Debug, Clone, Copy)]
pub struct MappingRequest {
    pub stack_size: usize,
    pub guard_size: usize,
    pub static_tls_size: usize,
    pub address_space: crate::config::AddressSpace,
}

/// Addresses inside one reserved thread mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadMapping {
    pub mmap_base: usize,
    pub mmap_size: usize,
    /// Lowest address of the mapping (the stack guard sits here).
    pub stack_base: usize,
    /// Randomized, 16-byte aligned initial stack pointer.
    pub stack_top: usize,
    pub thread_block: usize,
    pub static_tls: usize,
    pub layout: MappingLayout,
}

/// Reserve and carve one thread mapping.
pub fn allocate_thread_mapping<'os>(
    os: &'os dyn Os,
    diag: &dyn DiagnosticSink,
    request: &MappingRequest,
) -> Result<(MappingReservation<'os>, ThreadMapping), AllocError> {
    let layout = compute_layout(
        &LayoutRequest {
            stack_size: request.stack_size,
            guard_size: request.guard_size,
            page_size: os.page_size(),
            static_tls_size: request.static_tls_size,
            bookkeeping_size: size_of::<ThreadBookkeeping>(),
            address_space: request.address_space,
        },
        os,
    )?;

    let base = os.reserve(layout.total).map_err(|errno| {
        let err = AllocError::Reserve {
            size: layout.total,
            errno,
        };
        diag_warn!(diag, "pthread_create failed: {err}");
        err
    })?;
    let reservation = MappingReservation::new(os, base, layout.total);

    let grant = |region: crate::pthread::layout::Region| -> Result<(), AllocError> {
        if region.len == 0 {
            return Ok(());
        }
        os.protect(base + region.offset, region.len, Protection::READ_WRITE)
            .map_err(|errno| {
                let err = AllocError::Protect {
                    size: region.len,
                    errno,
                };
                diag_warn!(diag, "pthread_create failed: {err}");
                err
            })
    };

    grant(layout.stack)?;
    if layout.guard.len != 0 {
        let _ = os.name_region(base, layout.guard.len, c"stack guard");
    }
    if layout.gap.len != 0 {
        let _ = os.name_region(base + layout.gap.offset, layout.gap.len, c"stack top guard");
    }
    grant(layout.thread_and_tls())?;

    let stack_top = randomized_stack_top(
        base + layout.stack.end(),
        size_of::<ThreadBookkeeping>(),
        os,
    );
    let mapping = ThreadMapping {
        mmap_base: base,
        mmap_size: layout.total,
        stack_base: base,
        stack_top,
        thread_block: base + layout.thread_block.offset,
        static_tls: base + layout.static_tls.offset,
        layout,
    };
    Ok((reservation, mapping))
}

// ---------------------------------------------------------------------------
// Thread allocation
// ---------------------------------------------------------------------------

/// A fully initialized thread that has not been spawned yet.
#[derive(Debug)]
pub struct PreparedThread {
    pub reservation: MappingReservation<'static>,
    pub thread: NonNull<ThreadBookkeeping>,
    pub tcb: NonNull<Tcb>,
    pub stack_top: usize,
}

/// Allocate a thread's mapping and initialize its static TLS, bookkeeping
/// and control block.
#[allow(unsafe_code)]
pub fn allocate_thread(
    runtime: &'static Runtime,
    attr: &ThreadAttributes,
) -> Result<PreparedThread, AllocError> {
    let os = runtime.os;
    let page = os.page_size();
    let static_tls = runtime.globals.static_tls();
    let guard_size = round_up(attr.guard_size.unwrap_or(page), page).ok_or(AllocError::Overflow)?;

    let (stack_size, guard_size) = match attr.stack {
        None => (attr.stack_size, guard_size),
        // Only the thread block and static TLS are needed.
        Some(_) => (0, page),
    };
    let (reservation, mapping) = allocate_thread_mapping(
        os,
        runtime.diag,
        &MappingRequest {
            stack_size,
            guard_size,
            static_tls_size: static_tls.size(),
            address_space: runtime.config.address_space,
        },
    )?;
    let (stack_base, stack_top) = match attr.stack {
        None => (mapping.stack_base, mapping.stack_top),
        Some(caller) => (caller.base, caller.top()),
    };

    let thread = mapping.thread_block as *mut ThreadBookkeeping;
    let tls_area = mapping.static_tls as *mut u8;
    let locals = mapping.static_tls.wrapping_add(static_tls.offset_thread_locals()) as *mut ThreadLocals;
    let tcb = mapping.static_tls.wrapping_add(static_tls.offset_tcb()) as *mut Tcb;
    let layout = runtime.tcb_layout();

    let resolved = ResolvedAttributes {
        stack_base,
        stack_size: stack_top - stack_base,
        guard_size,
        caller_stack: attr.stack.is_some(),
        detached: attr.detached,
        policy: attr.policy,
        priority: attr.priority,
    };

    // SAFETY: the thread block and static TLS were just made read-write
    // and nothing else references them. Offsets come from the static TLS
    // layout, whose alignment is at most a page.
    unsafe {
        static_tls.initialize(tls_area);
        core::ptr::write_bytes(locals, 0, 1);
        thread.write(ThreadBookkeeping::new(
            resolved,
            mapping.mmap_base,
            mapping.mmap_size,
            locals,
            runtime,
        ));
        tcb.write(Tcb::zeroed());
        let tcb_ref = &mut *tcb;
        tcb_ref.init(&layout, thread);
        tcb_ref.init_dtv(&layout);
        tcb_ref.init_stack_guard(&layout, runtime.globals.stack_guard());
        tcb_ref.init_thread_locals(&layout, locals);
    }

    Ok(PreparedThread {
        reservation,
        // The mapping base is never null, so neither are these.
        thread: NonNull::new(thread).ok_or(AllocError::Overflow)?,
        tcb: NonNull::new(tcb).ok_or(AllocError::Overflow)?,
        stack_top,
    })
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::config::{AddressSpace, RuntimeConfig};
    use crate::diag::RecordingSink;
    use crate::os::sim::{FaultPlan, SIM_PAGE_SIZE, SimOs};
    use crate::pthread::internal::JoinState;
    use crate::pthread::static_tls::StaticTlsLayoutBuilder;
    use crate::pthread::tcb::empty_dtv_address;
    use crate::runtime::testing::sim_runtime;

    const PAGE: usize = SIM_PAGE_SIZE;

    fn request(stack_size: usize) -> MappingRequest {
        MappingRequest {
            stack_size,
            guard_size: PAGE,
            static_tls_size: 512,
            address_space: AddressSpace::Abundant,
        }
    }

    #[test]
    fn mapping_grants_exactly_stack_and_thread_block() {
        let os = SimOs::new(7);
        let diag = RecordingSink::new();
        let (reservation, mapping) = allocate_thread_mapping(&os, &diag, &request(16 * PAGE)).unwrap();
        assert_eq!(os.reservation_count(), 1);
        assert_eq!(reservation.base(), mapping.mmap_base);
        assert_eq!(reservation.len(), mapping.mmap_size);

        let protects = os.protect_calls();
        assert_eq!(protects.len(), 2);
        assert_eq!(protects[0].addr, mapping.mmap_base + PAGE);
        assert_eq!(protects[0].len, 16 * PAGE);
        assert_eq!(protects[1].addr, mapping.thread_block);
        assert_eq!(protects[1].len, mapping.layout.thread_and_tls().len);
        assert!(protects.iter().all(|p| p.prot == Protection::READ_WRITE));

        assert_eq!(mapping.stack_top % 16, 0);
        let stack_end = mapping.mmap_base + PAGE + 16 * PAGE;
        assert!(mapping.stack_top <= stack_end);
        assert!(stack_end - mapping.stack_top < size_of::<ThreadBookkeeping>() + 16);
        assert_eq!(mapping.static_tls, mapping.thread_block + mapping.layout.thread_block.len);
        assert!(os.region_names().iter().any(|(_, _, name)| *name == c"stack guard"));

        reservation.release().unwrap();
        assert_eq!(os.live_regions(), 0);
    }

    #[test]
    fn handed_over_mapping_survives_until_the_thread_releases_it() {
        let (os, _diag, runtime) = sim_runtime(3, RuntimeConfig::default());
        let prepared = allocate_thread(runtime, &ThreadAttributes::default().with_stack_size(16 * PAGE)).unwrap();
        prepared.reservation.hand_over_to_thread();
        assert_eq!(os.live_regions(), 1);

        let thread = unsafe { prepared.thread.as_ref() };
        os.release(thread.mmap_base, thread.mmap_size).unwrap();
        assert_eq!(os.live_regions(), 0);
    }

    #[test]
    fn reserve_failure_leaves_nothing_behind() {
        let os = SimOs::new(7);
        let diag = RecordingSink::new();
        os.set_faults(FaultPlan {
            reserve: Some(libc::ENOMEM),
            ..FaultPlan::default()
        });
        let err = allocate_thread_mapping(&os, &diag, &request(PAGE)).unwrap_err();
        assert!(matches!(err, AllocError::Reserve { errno: libc::ENOMEM, .. }));
        assert_eq!(err.errno(), libc::EAGAIN);
        assert_eq!(os.live_regions(), 0);
        assert!(diag.contains("couldn't allocate"));
    }

    #[test]
    fn either_protect_failure_releases_the_reservation() {
        for successes in 0..2 {
            let os = SimOs::new(7);
            let diag = RecordingSink::new();
            os.set_faults(FaultPlan {
                protect: Some((successes, libc::ENOMEM)),
                ..FaultPlan::default()
            });
            let err = allocate_thread_mapping(&os, &diag, &request(4 * PAGE)).unwrap_err();
            assert!(matches!(err, AllocError::Protect { errno: libc::ENOMEM, .. }));
            assert_eq!(os.reservation_count(), 1);
            assert_eq!(os.live_regions(), 0, "protect #{successes} leaked");
            assert!(diag.contains("couldn't mprotect"));
        }
    }

    #[test]
    fn overflow_makes_no_reservation() {
        let os = SimOs::new(7);
        let diag = RecordingSink::new();
        let err = allocate_thread_mapping(&os, &diag, &request(usize::MAX - PAGE)).unwrap_err();
        assert_eq!(err, AllocError::Overflow);
        assert_eq!(os.reservation_count(), 0);
    }

    #[test]
    fn allocate_thread_initializes_bookkeeping_and_tcb() {
        let (os, _diag, runtime) = sim_runtime(3, RuntimeConfig::default());
        let attr = ThreadAttributes::default().with_stack_size(8 * PAGE);
        let prepared = allocate_thread(runtime, &attr).unwrap();

        let thread = unsafe { prepared.thread.as_ref() };
        assert_eq!(thread.join_state(), JoinState::NotJoined);
        assert_eq!(thread.mmap_base, prepared.reservation.base());
        assert_eq!(thread.attr.stack_base, thread.mmap_base);
        assert_eq!(thread.attr.stack_size, prepared.stack_top - thread.mmap_base);
        assert_eq!(thread.attr.guard_size, PAGE);
        assert!(!thread.attr.caller_stack);
        assert!(core::ptr::eq(thread.runtime, runtime));

        let layout = runtime.tcb_layout();
        let tcb = unsafe { prepared.tcb.as_ref() };
        assert_eq!(tcb.slot(layout.thread_id), prepared.thread.as_ptr() as usize);
        assert_eq!(tcb.slot(layout.dtv), empty_dtv_address());
        assert_eq!(tcb.slot(layout.stack_guard), runtime.globals.stack_guard());
        assert_eq!(tcb.slot(layout.thread_locals), thread.thread_locals as usize);
        let locals = unsafe { &*thread.thread_locals };
        assert_eq!(locals.errno, 0);

        drop(prepared.reservation);
        assert_eq!(os.live_regions(), 0);
    }

    #[test]
    fn caller_stack_maps_only_thread_block() {
        let (os, _diag, runtime) = sim_runtime(3, RuntimeConfig::default());
        let buffer = vec![0u8; 64 * 1024];
        // Deliberately misaligned: the top is recorded as given and only
        // the backend aligns the initial stack pointer.
        let base = buffer.as_ptr() as usize + 1;
        let size = buffer.len() - 8;
        let attr = ThreadAttributes::default()
            .with_caller_stack(base, size)
            .with_guard_size(16 * PAGE);
        let prepared = allocate_thread(runtime, &attr).unwrap();
        let thread = unsafe { prepared.thread.as_ref() };

        assert_eq!(prepared.stack_top, base + size);
        assert_eq!(thread.attr.stack_base, base);
        assert_eq!(thread.attr.stack_size, size);
        assert!(thread.attr.caller_stack);
        // Zero-sized stack, one-page guard: guard + thread block + TLS + tail.
        assert_eq!(prepared.reservation.len(), 4 * PAGE);
        assert_eq!(os.protect_calls().len(), 1);
        drop(prepared.reservation);
    }

    #[test]
    fn guard_rounding_overflow_is_eagain() {
        let (os, _diag, runtime) = sim_runtime(3, RuntimeConfig::default());
        let attr = ThreadAttributes::default().with_guard_size(usize::MAX);
        let err = allocate_thread(runtime, &attr).unwrap_err();
        assert_eq!(err, AllocError::Overflow);
        assert_eq!(err.errno(), libc::EAGAIN);
        assert_eq!(os.reservation_count(), 0);
    }

    #[test]
    fn static_tls_segments_are_copied_into_new_threads() {
        static IMAGE: [u8; 4] = *b"tls!";
        let mut builder = StaticTlsLayoutBuilder::new().unwrap();
        let offset = builder.add_segment(&IMAGE, 16, 8).unwrap();
        let layout = builder.finish().unwrap();
        let (_os, _diag, runtime) = crate::runtime::testing::sim_runtime_with_tls(4, layout);

        let prepared = allocate_thread(runtime, &ThreadAttributes::default().with_stack_size(PAGE)).unwrap();
        let thread = unsafe { prepared.thread.as_ref() };
        let static_tls = prepared.tcb.as_ptr() as usize - runtime.globals.static_tls().offset_tcb();
        assert!(static_tls > thread.mmap_base);
        let copied = unsafe { core::slice::from_raw_parts((static_tls + offset) as *const u8, 16) };
        assert_eq!(&copied[..4], b"tls!");
        assert!(copied[4..].iter().all(|&b| b == 0));
    }
}
