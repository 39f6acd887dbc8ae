//! Stack allocator - LIFO allocation with marker rollback

use core::ptr::NonNull;
use parking_lot::Mutex;

use crate::align::try_align_up;
use crate::buffer::AlignedBuffer;
use crate::config::StackConfig;
use crate::error::{MemoryError, MemoryResult};
use crate::{next_generation, Allocator};

struct StackState {
    buffer: AlignedBuffer,
    alignment: usize,
    /// First usable offset
    base: usize,
    /// One past the last usable offset
    end: usize,
    /// Next free offset, `base <= top <= end`
    top: usize,
    generation: u64,
}

/// Stack allocator - LIFO allocation with markers
///
/// A single pre-allocated buffer with one bump cursor. Every allocation size
/// is rounded up to the allocator's alignment, so every returned pointer is
/// aligned. Memory comes back only in bulk: [`clear`](Self::clear) resets the
/// cursor, [`free_to_marker`](Self::free_to_marker) rolls it back to a
/// previously captured [`StackMarker`].
///
/// All operations lock the same mutex, so an instance may be shared between
/// threads. Rollback is still LIFO: freeing to an older marker silently
/// invalidates every newer one.
pub struct StackAllocator {
    state: Mutex<Option<StackState>>,
}

impl StackAllocator {
    /// Create an uninitialized stack allocator
    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
        }
    }

    /// Create a stack allocator that is ready to allocate
    pub fn from_config(config: StackConfig) -> MemoryResult<Self> {
        let stack = Self::new();
        stack.init_with(&config)?;
        Ok(stack)
    }

    /// (Re)initialize with `capacity` usable bytes aligned to `alignment`.
    ///
    /// Any previous buffer is dropped, invalidating all of its allocations and
    /// markers. On error the previous state is kept.
    pub fn init(&self, capacity: usize, alignment: usize) -> MemoryResult<()> {
        let mut guard = self.state.lock();

        let buffer = AlignedBuffer::new(capacity, alignment)?;
        let base = buffer.base();
        let end = buffer.end();

        log::debug!(
            "Stack allocator initialized: {} bytes, alignment {}",
            buffer.usable_len(),
            alignment
        );

        *guard = Some(StackState {
            buffer,
            alignment,
            base,
            end,
            top: base,
            generation: next_generation(),
        });
        Ok(())
    }

    pub fn init_with(&self, config: &StackConfig) -> MemoryResult<()> {
        config.validate()?;
        self.init(config.capacity, config.alignment)
    }

    /// Free the buffer and return to the uninitialized state
    pub fn release(&self) {
        if self.state.lock().take().is_some() {
            log::debug!("Stack allocator released");
        }
    }

    /// Roll the stack back to its base
    pub fn clear(&self) {
        if let Some(state) = self.state.lock().as_mut() {
            state.top = state.base;
        }
    }

    /// Allocate `size` bytes, rounded up to the allocator's alignment.
    ///
    /// Returns `None` when the remaining capacity is too small or the
    /// allocator is not initialized. A zero-sized request returns the current
    /// top without moving it.
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let mut guard = self.state.lock();
        let state = guard.as_mut()?;

        let size = try_align_up(size, state.alignment)?;
        match state.top.checked_add(size) {
            Some(new_top) if new_top <= state.end => {
                let ptr = state.buffer.ptr_at(state.top);
                state.top = new_top;
                Some(ptr)
            }
            _ => {
                log::trace!(
                    "Stack allocator exhausted: requested {} bytes, {} available",
                    size,
                    state.end - state.top
                );
                None
            }
        }
    }

    /// Get a marker for the current stack top
    pub fn marker(&self) -> MemoryResult<StackMarker> {
        let guard = self.state.lock();
        let state = guard.as_ref().ok_or(MemoryError::NotInitialized)?;
        Ok(StackMarker {
            position: state.top - state.base,
            generation: state.generation,
        })
    }

    /// Roll back to a previous marker, discarding every allocation made after it
    pub fn free_to_marker(&self, marker: StackMarker) -> MemoryResult<()> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or(MemoryError::NotInitialized)?;

        if marker.generation != state.generation {
            log::warn!("Rejected stack rollback to a stale marker");
            return Err(MemoryError::StaleMarker);
        }

        let used = state.top - state.base;
        if marker.position > used {
            log::warn!(
                "Rejected stack rollback to {} past the top at {}",
                marker.position,
                used
            );
            return Err(MemoryError::MarkerOutOfRange {
                marker: marker.position,
                low: 0,
                high: used,
            });
        }

        state.top = state.base + marker.position;
        Ok(())
    }

    /// Alignment applied to every allocation (0 when uninitialized)
    pub fn alignment(&self) -> usize {
        self.state.lock().as_ref().map_or(0, |s| s.alignment)
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Get the usable capacity in bytes
    pub fn capacity(&self) -> usize {
        self.state.lock().as_ref().map_or(0, |s| s.end - s.base)
    }

    /// Bytes between the base and the current top
    pub fn used(&self) -> usize {
        self.state.lock().as_ref().map_or(0, |s| s.top - s.base)
    }
}

impl Allocator for StackAllocator {
    fn is_initialized(&self) -> bool {
        StackAllocator::is_initialized(self)
    }

    fn capacity(&self) -> usize {
        StackAllocator::capacity(self)
    }

    fn used(&self) -> usize {
        StackAllocator::used(self)
    }

    fn clear(&self) {
        StackAllocator::clear(self)
    }

    fn release(&self) {
        StackAllocator::release(self)
    }
}

impl Default for StackAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Marker for stack position
///
/// Only valid on the allocator and `init` that produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackMarker {
    position: usize,
    generation: u64,
}

impl StackMarker {
    /// Bytes in use when the marker was taken
    pub fn position(&self) -> usize {
        self.position
    }
}

/// Scoped stack allocator guard
///
/// Rolls the stack back to where it was when the scope was created.
pub struct StackScope<'a> {
    stack: &'a StackAllocator,
    marker: Option<StackMarker>,
}

impl<'a> StackScope<'a> {
    /// Create a new scoped stack
    pub fn new(stack: &'a StackAllocator) -> Self {
        Self {
            marker: stack.marker().ok(),
            stack,
        }
    }

    /// Access the stack for allocations
    pub fn stack(&self) -> &StackAllocator {
        self.stack
    }
}

impl Drop for StackScope<'_> {
    fn drop(&mut self) {
        if let Some(marker) = self.marker {
            if let Err(e) = self.stack.free_to_marker(marker) {
                log::warn!("Stack scope rollback failed: {}", e);
            }
        }
    }
}
