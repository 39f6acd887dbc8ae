//! Owned backing memory for the allocators

use core::ptr::NonNull;
use std::alloc::{self, Layout};

use crate::align::{align_up, is_valid_alignment, try_align_up};
use crate::error::{MemoryError, MemoryResult};

/// A contiguous byte range owned by exactly one allocator.
///
/// The system allocation is `alignment` bytes larger than the usable size so
/// that an aligned sub-range of the full usable size always exists, whatever
/// address the system hands back. All cursors built on top of it are byte
/// offsets from [`AlignedBuffer::as_ptr`].
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
    alignment: usize,
    base: usize,
    usable: usize,
}

// Safety: the buffer is uniquely owned heap memory, like a Box<[u8]>
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocate `size` usable bytes (rounded up to `alignment`), zero-filled.
    pub fn new(size: usize, alignment: usize) -> MemoryResult<Self> {
        if !is_valid_alignment(alignment) {
            return Err(MemoryError::InvalidAlignment(alignment));
        }
        if size == 0 {
            return Err(MemoryError::ZeroCapacity);
        }

        let usable = try_align_up(size, alignment).ok_or(MemoryError::CapacityOverflow)?;
        let total = usable
            .checked_add(alignment)
            .ok_or(MemoryError::CapacityOverflow)?;
        let layout = Layout::array::<u8>(total).map_err(|_| MemoryError::CapacityOverflow)?;

        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(MemoryError::OutOfMemory { size: total })?;

        let addr = ptr.as_ptr() as usize;
        let base = align_up(addr, alignment) - addr;

        Ok(Self {
            ptr,
            layout,
            alignment,
            base,
            usable,
        })
    }

    /// Start of the raw allocation (possibly unaligned)
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Offset of the first aligned byte
    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    /// One past the last usable byte, as an offset
    #[inline]
    pub fn end(&self) -> usize {
        self.base + self.usable
    }

    /// Usable bytes starting at [`base`](Self::base)
    #[inline]
    pub fn usable_len(&self) -> usize {
        self.usable
    }

    /// Size of the underlying system allocation, slack included
    #[inline]
    pub fn raw_len(&self) -> usize {
        self.layout.size()
    }

    #[inline]
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Pointer to the byte at `offset`. One-past-the-end is allowed.
    #[inline]
    pub fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        assert!(offset <= self.raw_len(), "offset {offset} outside buffer");
        unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) }
    }

    /// Offset of `ptr` from the start of the allocation, if it points into it
    #[inline]
    pub fn offset_of(&self, ptr: *const u8) -> Option<usize> {
        let start = self.ptr.as_ptr() as usize;
        let addr = ptr as usize;
        if addr >= start && addr < start + self.raw_len() {
            Some(addr - start)
        } else {
            None
        }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl core::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("ptr", &self.ptr)
            .field("alignment", &self.alignment)
            .field("base", &self.base)
            .field("usable", &self.usable)
            .finish()
    }
}
