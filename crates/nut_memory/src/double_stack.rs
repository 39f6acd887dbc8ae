//! Double-ended stack allocator - two LIFO stacks sharing one buffer

use core::ptr::NonNull;
use parking_lot::Mutex;

use crate::align::try_align_up;
use crate::buffer::AlignedBuffer;
use crate::config::StackConfig;
use crate::error::{MemoryError, MemoryResult};
use crate::{next_generation, Allocator};

/// Which end of a [`DoubleStackAllocator`] an operation targets
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StackSide {
    /// Grows upward from the base
    Lower,
    /// Grows downward from the end
    Upper,
}

struct DoubleStackState {
    buffer: AlignedBuffer,
    alignment: usize,
    base: usize,
    /// One past the last usable offset
    end: usize,
    /// `base <= lower <= upper <= end`
    lower: usize,
    upper: usize,
    generation: u64,
}

impl DoubleStackState {
    fn reset(&mut self, side: StackSide) {
        match side {
            StackSide::Lower => self.lower = self.base,
            StackSide::Upper => self.upper = self.end,
        }
    }
}

/// Double-ended stack allocator
///
/// The lower stack grows from the start of the buffer and the upper stack
/// from its end. Both draw on the same free gap between them, so either side
/// may use whatever the other leaves, and either may starve the other. Each
/// side has its own markers and can be cleared independently, which suits
/// data with two different lifetimes (e.g. per-level and per-frame).
pub struct DoubleStackAllocator {
    state: Mutex<Option<DoubleStackState>>,
}

impl DoubleStackAllocator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
        }
    }

    pub fn from_config(config: StackConfig) -> MemoryResult<Self> {
        let stack = Self::new();
        stack.init_with(&config)?;
        Ok(stack)
    }

    /// (Re)initialize with `capacity` usable bytes aligned to `alignment`.
    ///
    /// On error the previous state is kept.
    pub fn init(&self, capacity: usize, alignment: usize) -> MemoryResult<()> {
        let mut guard = self.state.lock();

        let buffer = AlignedBuffer::new(capacity, alignment)?;
        let base = buffer.base();
        let end = buffer.end();

        log::debug!(
            "Double stack allocator initialized: {} bytes, alignment {}",
            buffer.usable_len(),
            alignment
        );

        *guard = Some(DoubleStackState {
            buffer,
            alignment,
            base,
            end,
            lower: base,
            upper: end,
            generation: next_generation(),
        });
        Ok(())
    }

    pub fn init_with(&self, config: &StackConfig) -> MemoryResult<()> {
        config.validate()?;
        self.init(config.capacity, config.alignment)
    }

    pub fn release(&self) {
        if self.state.lock().take().is_some() {
            log::debug!("Double stack allocator released");
        }
    }

    /// Roll both stacks back to their extremes
    pub fn clear(&self) {
        if let Some(state) = self.state.lock().as_mut() {
            state.reset(StackSide::Lower);
            state.reset(StackSide::Upper);
        }
    }

    /// Roll one stack back to its extreme, leaving the other untouched
    pub fn clear_side(&self, side: StackSide) {
        if let Some(state) = self.state.lock().as_mut() {
            state.reset(side);
        }
    }

    /// Allocate `size` bytes (rounded up to the alignment) on `side`.
    ///
    /// Returns `None` if the two stacks would cross.
    pub fn alloc(&self, size: usize, side: StackSide) -> Option<NonNull<u8>> {
        let mut guard = self.state.lock();
        let state = guard.as_mut()?;

        let size = try_align_up(size, state.alignment)?;
        let fits = state
            .lower
            .checked_add(size)
            .is_some_and(|new_lower| new_lower <= state.upper);
        if !fits {
            log::trace!(
                "Double stack exhausted: requested {} bytes on {:?}, {} available",
                size,
                side,
                state.upper - state.lower
            );
            return None;
        }

        let offset = match side {
            StackSide::Lower => {
                let offset = state.lower;
                state.lower += size;
                offset
            }
            StackSide::Upper => {
                state.upper -= size;
                state.upper
            }
        };
        Some(state.buffer.ptr_at(offset))
    }

    /// Get a marker for the current top of `side`
    pub fn marker(&self, side: StackSide) -> MemoryResult<DoubleStackMarker> {
        let guard = self.state.lock();
        let state = guard.as_ref().ok_or(MemoryError::NotInitialized)?;
        let position = match side {
            StackSide::Lower => state.lower - state.base,
            StackSide::Upper => state.end - state.upper,
        };
        Ok(DoubleStackMarker {
            side,
            position,
            generation: state.generation,
        })
    }

    /// Roll the marker's side back to it
    pub fn free_to_marker(&self, marker: DoubleStackMarker) -> MemoryResult<()> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or(MemoryError::NotInitialized)?;

        if marker.generation != state.generation {
            log::warn!("Rejected {:?} stack rollback to a stale marker", marker.side);
            return Err(MemoryError::StaleMarker);
        }

        let used = match marker.side {
            StackSide::Lower => state.lower - state.base,
            StackSide::Upper => state.end - state.upper,
        };
        if marker.position > used {
            log::warn!(
                "Rejected {:?} stack rollback to {} past the top at {}",
                marker.side,
                marker.position,
                used
            );
            return Err(MemoryError::MarkerOutOfRange {
                marker: marker.position,
                low: 0,
                high: used,
            });
        }

        match marker.side {
            StackSide::Lower => state.lower = state.base + marker.position,
            StackSide::Upper => state.upper = state.end - marker.position,
        }
        Ok(())
    }

    pub fn alignment(&self) -> usize {
        self.state.lock().as_ref().map_or(0, |s| s.alignment)
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().is_some()
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().as_ref().map_or(0, |s| s.end - s.base)
    }

    /// Bytes used by both stacks together
    pub fn used(&self) -> usize {
        self.state
            .lock()
            .as_ref()
            .map_or(0, |s| (s.lower - s.base) + (s.end - s.upper))
    }

    /// Bytes used by one stack
    pub fn used_by(&self, side: StackSide) -> usize {
        self.state.lock().as_ref().map_or(0, |s| match side {
            StackSide::Lower => s.lower - s.base,
            StackSide::Upper => s.end - s.upper,
        })
    }
}

impl Allocator for DoubleStackAllocator {
    fn is_initialized(&self) -> bool {
        DoubleStackAllocator::is_initialized(self)
    }

    fn capacity(&self) -> usize {
        DoubleStackAllocator::capacity(self)
    }

    fn used(&self) -> usize {
        DoubleStackAllocator::used(self)
    }

    fn clear(&self) {
        DoubleStackAllocator::clear(self)
    }

    fn release(&self) {
        DoubleStackAllocator::release(self)
    }
}

impl Default for DoubleStackAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Marker for one side of a double stack
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DoubleStackMarker {
    side: StackSide,
    position: usize,
    generation: u64,
}

impl DoubleStackMarker {
    pub fn side(&self) -> StackSide {
        self.side
    }

    /// Bytes the marker's side had in use when it was taken
    pub fn position(&self) -> usize {
        self.position
    }
}

/// Scoped guard rolling one side of a double stack back on drop
pub struct DoubleStackScope<'a> {
    stack: &'a DoubleStackAllocator,
    marker: Option<DoubleStackMarker>,
}

impl<'a> DoubleStackScope<'a> {
    pub fn new(stack: &'a DoubleStackAllocator, side: StackSide) -> Self {
        Self {
            marker: stack.marker(side).ok(),
            stack,
        }
    }

    pub fn stack(&self) -> &DoubleStackAllocator {
        self.stack
    }
}

impl Drop for DoubleStackScope<'_> {
    fn drop(&mut self) {
        if let Some(marker) = self.marker {
            if let Err(e) = self.stack.free_to_marker(marker) {
                log::warn!("Double stack scope rollback failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::is_aligned;

    fn addr(ptr: NonNull<u8>) -> usize {
        ptr.as_ptr() as usize
    }

    #[test]
    fn test_double_stack_sides_grow_toward_each_other() {
        let stack = DoubleStackAllocator::new();
        stack.init(256, 16).unwrap();

        let low = stack.alloc(10, StackSide::Lower).unwrap();
        let high = stack.alloc(10, StackSide::Upper).unwrap();

        assert!(is_aligned(low.as_ptr(), 16));
        assert!(is_aligned(high.as_ptr(), 16));
        assert_eq!(addr(high) - addr(low), 256 - 16);
        assert_eq!(stack.used_by(StackSide::Lower), 16);
        assert_eq!(stack.used_by(StackSide::Upper), 16);
    }

    #[test]
    fn test_double_stack_shared_capacity() {
        let stack = DoubleStackAllocator::new();
        stack.init(128, 16).unwrap();

        assert!(stack.alloc(96, StackSide::Upper).is_some());
        assert!(stack.alloc(32, StackSide::Lower).is_some());
        assert_eq!(stack.available(), 0);

        // Exhausted request leaves both cursors untouched
        assert!(stack.alloc(1, StackSide::Lower).is_none());
        assert!(stack.alloc(1, StackSide::Upper).is_none());
        assert_eq!(stack.used_by(StackSide::Lower), 32);
        assert_eq!(stack.used_by(StackSide::Upper), 96);
    }

    #[test]
    fn test_double_stack_upper_can_take_everything() {
        let stack = DoubleStackAllocator::new();
        stack.init(64, 8).unwrap();

        let p = stack.alloc(64, StackSide::Upper).unwrap();
        let q = stack.alloc(0, StackSide::Lower).unwrap();
        assert_eq!(p, q);
        assert!(stack.alloc(8, StackSide::Lower).is_none());
    }

    #[test]
    fn test_double_stack_clear_side() {
        let stack = DoubleStackAllocator::new();
        stack.init(256, 16).unwrap();

        let low = stack.alloc(32, StackSide::Lower).unwrap();
        stack.alloc(32, StackSide::Upper).unwrap();

        stack.clear_side(StackSide::Upper);
        assert_eq!(stack.used_by(StackSide::Upper), 0);
        assert_eq!(stack.used_by(StackSide::Lower), 32);

        let next_low = stack.alloc(16, StackSide::Lower).unwrap();
        assert_eq!(addr(next_low), addr(low) + 32);

        stack.clear();
        assert_eq!(stack.used(), 0);
        assert_eq!(stack.alloc(16, StackSide::Lower), Some(low));
    }

    #[test]
    fn test_double_stack_markers_are_per_side() {
        let stack = DoubleStackAllocator::new();
        stack.init(512, 16).unwrap();

        stack.alloc(16, StackSide::Lower).unwrap();
        stack.alloc(16, StackSide::Upper).unwrap();
        let lower_mark = stack.marker(StackSide::Lower).unwrap();
        let upper_mark = stack.marker(StackSide::Upper).unwrap();
        assert_eq!(lower_mark.side(), StackSide::Lower);
        assert_eq!(upper_mark.position(), 16);

        let low = stack.alloc(48, StackSide::Lower).unwrap();
        let high = stack.alloc(48, StackSide::Upper).unwrap();

        stack.free_to_marker(upper_mark).unwrap();
        assert_eq!(stack.used_by(StackSide::Upper), 16);
        assert_eq!(stack.used_by(StackSide::Lower), 64);

        stack.free_to_marker(lower_mark).unwrap();
        assert_eq!(stack.used_by(StackSide::Lower), 16);

        assert_eq!(stack.alloc(48, StackSide::Lower), Some(low));
        assert_eq!(stack.alloc(48, StackSide::Upper), Some(high));
    }

    #[test]
    fn test_double_stack_marker_out_of_range() {
        let stack = DoubleStackAllocator::new();
        stack.init(256, 16).unwrap();

        stack.alloc(32, StackSide::Upper).unwrap();
        let marker = stack.marker(StackSide::Upper).unwrap();
        stack.clear_side(StackSide::Upper);

        assert_eq!(
            stack.free_to_marker(marker),
            Err(MemoryError::MarkerOutOfRange { marker: 32, low: 0, high: 0 })
        );
    }

    #[test]
    fn test_double_stack_stale_marker() {
        let stack = DoubleStackAllocator::new();
        stack.init(256, 16).unwrap();
        let marker = stack.marker(StackSide::Lower).unwrap();

        stack.release();
        assert_eq!(stack.free_to_marker(marker), Err(MemoryError::NotInitialized));

        stack.init(256, 16).unwrap();
        assert_eq!(stack.free_to_marker(marker), Err(MemoryError::StaleMarker));
    }

    #[test]
    fn test_double_stack_invalid_init() {
        let stack = DoubleStackAllocator::new();
        assert_eq!(stack.init(256, 6), Err(MemoryError::InvalidAlignment(6)));
        assert!(!stack.is_initialized());
        assert!(stack.alloc(8, StackSide::Lower).is_none());
        assert_eq!(stack.marker(StackSide::Upper).unwrap_err(), MemoryError::NotInitialized);
    }

    #[test]
    fn test_double_stack_scope() {
        let stack = DoubleStackAllocator::new();
        stack.init(256, 8).unwrap();
        stack.alloc(8, StackSide::Lower).unwrap();

        {
            let scope = DoubleStackScope::new(&stack, StackSide::Upper);
            scope.stack().alloc(64, StackSide::Upper).unwrap();
            scope.stack().alloc(8, StackSide::Lower).unwrap();
        }

        assert_eq!(stack.used_by(StackSide::Upper), 0);
        assert_eq!(stack.used_by(StackSide::Lower), 16);
    }
}
