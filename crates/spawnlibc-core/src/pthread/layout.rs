//! Layout of a thread's single memory mapping.
//!
//! ```text
//! low                                                                  high
//! [stack guard][usable stack][random gap][thread block][static TLS][guard]
//!               ^ read-write               ^ read-write ..............^
//! ```
//!
//! Everything here is pure arithmetic: no memory is touched. Every sum and
//! every rounding step is checked, so an absurd request fails instead of
//! wrapping into a small mapping.

use crate::config::AddressSpace;
use crate::pthread::mapping::AllocError;
use crate::random::RandomSource;

/// Required alignment of the initial stack pointer.
pub const STACK_ALIGN: usize = 16;

/// Round `value` up to a multiple of `align` (a power of two).
#[inline]
#[must_use]
pub fn round_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}

/// Round `value` down to a multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn round_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// A sub-region of a mapping, as an offset from the mapping base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub offset: usize,
    pub len: usize,
}

impl Region {
    /// One past the last byte.
    #[must_use]
    pub const fn end(self) -> usize {
        self.offset + self.len
    }
}

/// Inputs to [`compute_layout`].
#[derive(Debug, Clone, Copy)]
pub struct LayoutRequest {
    /// Usable stack bytes; zero when the caller supplies its own stack.
    pub stack_size: usize,
    pub guard_size: usize,
    pub page_size: usize,
    pub static_tls_size: usize,
    /// Size of the per-thread bookkeeping structure.
    pub bookkeeping_size: usize,
    pub address_space: AddressSpace,
}

/// Computed placement of every sub-region. All lengths and offsets are
/// page multiples and the regions tile `[0, total)` in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingLayout {
    pub total: usize,
    pub guard: Region,
    pub stack: Region,
    pub gap: Region,
    pub thread_block: Region,
    pub static_tls: Region,
    pub tail_guard: Region,
}

impl MappingLayout {
    /// The single read-write range above the gap: thread block plus static TLS.
    #[must_use]
    pub const fn thread_and_tls(&self) -> Region {
        Region {
            offset: self.thread_block.offset,
            len: self.thread_block.len + self.static_tls.len,
        }
    }
}

fn page_round(value: usize, page: usize) -> Result<usize, AllocError> {
    round_up(value, page).ok_or(AllocError::Overflow)
}

fn add(a: usize, b: usize) -> Result<usize, AllocError> {
    a.checked_add(b).ok_or(AllocError::Overflow)
}

/// Compute the mapping layout for one thread.
///
/// The gap above the stack is `uniform(max_gap)` rounded up to a page,
/// where `max_gap` is a fraction of the stack size chosen by the address
/// space class.
pub fn compute_layout(
    request: &LayoutRequest,
    rng: &dyn RandomSource,
) -> Result<MappingLayout, AllocError> {
    let page = request.page_size;
    let guard = page_round(request.guard_size, page)?;
    let stack = page_round(request.stack_size, page)?;
    let gap_bytes = rng.uniform(request.address_space.max_gap(stack));
    let gap = page_round(gap_bytes, page)?;
    let thread_block = page_round(request.bookkeeping_size, page)?;
    let static_tls = page_round(request.static_tls_size, page)?;
    let tail_guard = page;

    let mut offset = 0;
    let mut place = |len: usize| -> Result<Region, AllocError> {
        let region = Region { offset, len };
        offset = add(offset, len)?;
        Ok(region)
    };
    let guard = place(guard)?;
    let stack = place(stack)?;
    let gap = place(gap)?;
    let thread_block = place(thread_block)?;
    let static_tls = place(static_tls)?;
    let tail_guard = place(tail_guard)?;

    Ok(MappingLayout {
        total: offset,
        guard,
        stack,
        gap,
        thread_block,
        static_tls,
        tail_guard,
    })
}

/// Randomize the initial stack pointer below `stack_end`.
///
/// The jitter is `uniform(jitter_bound)` bytes, then the result is aligned
/// down to [`STACK_ALIGN`]. Stays within the stack when `stack_len`
/// exceeds `jitter_bound`.
#[must_use]
pub fn randomized_stack_top(stack_end: usize, jitter_bound: usize, rng: &dyn RandomSource) -> usize {
    let jitter = rng.uniform(jitter_bound);
    round_down(stack_end.saturating_sub(jitter), STACK_ALIGN)
}
