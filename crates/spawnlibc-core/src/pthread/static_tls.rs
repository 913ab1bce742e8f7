//! Process-wide static TLS layout.
//!
//! Computed once, before the first thread is created, and read without
//! synchronization afterwards. Every thread's static TLS area is a copy of
//! this layout: the control block, the libc-private [`ThreadLocals`] block
//! and any TLS segment images registered at startup.

use core::mem::{align_of, size_of};

use thiserror::Error;

use crate::pthread::internal::ThreadLocals;
use crate::pthread::tcb::Tcb;

/// Largest alignment a static TLS member may ask for. The static TLS area
/// starts on a page boundary and pages are at least this large.
pub const MAX_STATIC_TLS_ALIGN: usize = 4096;

/// Errors while building a [`StaticTlsLayout`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TlsLayoutError {
    #[error("static TLS layout overflows the address space")]
    Overflow,
    #[error("TLS alignment {0} is not a power of two")]
    BadAlignment(usize),
    #[error("TLS alignment {align} exceeds the {limit}-byte limit")]
    AlignmentTooLarge { align: usize, limit: usize },
    #[error("TLS image of {image} bytes does not fit a {mem_size}-byte segment")]
    ImageTooLarge { image: usize, mem_size: usize },
}

/// One initialized TLS segment: `image` is copied to `offset`, and the
/// remaining `mem_size - image.len()` bytes are zeroed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsSegment {
    pub offset: usize,
    pub image: &'static [u8],
    pub mem_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticTlsLayout {
    size: usize,
    align: usize,
    offset_tcb: usize,
    offset_thread_locals: usize,
    segments: Vec<TlsSegment>,
}

impl StaticTlsLayout {
    /// Layout with only the control block and the libc-private block.
    pub fn minimal() -> Result<Self, TlsLayoutError> {
        StaticTlsLayoutBuilder::new()?.finish()
    }

    /// Total bytes, not yet page rounded.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn align(&self) -> usize {
        self.align
    }

    #[must_use]
    pub fn offset_tcb(&self) -> usize {
        self.offset_tcb
    }

    #[must_use]
    pub fn offset_thread_locals(&self) -> usize {
        self.offset_thread_locals
    }

    #[must_use]
    pub fn segments(&self) -> &[TlsSegment] {
        &self.segments
    }

    /// Copy every segment image into a fresh static TLS area and zero the
    /// rest of each segment.
    ///
    /// # Safety
    ///
    /// `area` must be writable for [`Self::size`] bytes and aligned to
    /// [`Self::align`].
    #[allow(unsafe_code)]
    pub unsafe fn initialize(&self, area: *mut u8) {
        for segment in &self.segments {
            // SAFETY: the builder keeps every segment inside `size`, and
            // `image.len() <= mem_size`.
            unsafe {
                let dst = area.add(segment.offset);
                core::ptr::copy_nonoverlapping(segment.image.as_ptr(), dst, segment.image.len());
                core::ptr::write_bytes(
                    dst.add(segment.image.len()),
                    0,
                    segment.mem_size - segment.image.len(),
                );
            }
        }
    }
}

/// Builds a [`StaticTlsLayout`]. The control block always comes first and
/// the libc-private block second; segments follow in registration order.
#[derive(Debug)]
pub struct StaticTlsLayoutBuilder {
    cursor: usize,
    align: usize,
    offset_tcb: usize,
    offset_thread_locals: usize,
    segments: Vec<TlsSegment>,
}

impl StaticTlsLayoutBuilder {
    pub fn new() -> Result<Self, TlsLayoutError> {
        let mut builder = Self {
            cursor: 0,
            align: 1,
            offset_tcb: 0,
            offset_thread_locals: 0,
            segments: Vec::new(),
        };
        builder.offset_tcb = builder.reserve(size_of::<Tcb>(), align_of::<Tcb>())?;
        builder.offset_thread_locals =
            builder.reserve(size_of::<ThreadLocals>(), align_of::<ThreadLocals>())?;
        Ok(builder)
    }

    /// Reserve `size` bytes aligned to `align`; returns their offset.
    pub fn reserve(&mut self, size: usize, align: usize) -> Result<usize, TlsLayoutError> {
        if !align.is_power_of_two() {
            return Err(TlsLayoutError::BadAlignment(align));
        }
        if align > MAX_STATIC_TLS_ALIGN {
            return Err(TlsLayoutError::AlignmentTooLarge {
                align,
                limit: MAX_STATIC_TLS_ALIGN,
            });
        }
        let offset = crate::pthread::layout::round_up(self.cursor, align)
            .ok_or(TlsLayoutError::Overflow)?;
        self.cursor = offset.checked_add(size).ok_or(TlsLayoutError::Overflow)?;
        self.align = self.align.max(align);
        Ok(offset)
    }

    /// Register an initialized segment; returns its offset.
    pub fn add_segment(
        &mut self,
        image: &'static [u8],
        mem_size: usize,
        align: usize,
    ) -> Result<usize, TlsLayoutError> {
        if image.len() > mem_size {
            return Err(TlsLayoutError::ImageTooLarge {
                image: image.len(),
                mem_size,
            });
        }
        let offset = self.reserve(mem_size, align)?;
        self.segments.push(TlsSegment {
            offset,
            image,
            mem_size,
        });
        Ok(offset)
    }

    pub fn finish(self) -> Result<StaticTlsLayout, TlsLayoutError> {
        let size = crate::pthread::layout::round_up(self.cursor, self.align)
            .ok_or(TlsLayoutError::Overflow)?;
        Ok(StaticTlsLayout {
            size,
            align: self.align,
            offset_tcb: self.offset_tcb,
            offset_thread_locals: self.offset_thread_locals,
            segments: self.segments,
        })
    }
}
