//! # nut_memory - Engine Memory Allocators
//!
//! Pre-allocated allocators for engine scratch memory:
//! - Stack: LIFO bump allocation with marker rollback
//! - DoubleStack: two bump cursors growing toward each other over one buffer
//! - Pool: fixed-size blocks reclaimable in any order
//!
//! Every allocator owns exactly one buffer and guards all of its state with a
//! single mutex, so instances can be shared freely between threads. Instances
//! are created by the subsystem that needs them and handed out by reference.

pub mod align;
pub mod buffer;
pub mod config;
pub mod double_stack;
pub mod error;
pub mod pool;
pub mod stack;

use core::sync::atomic::{AtomicU64, Ordering};

pub use align::{align_down, align_up, is_aligned, is_valid_alignment, try_align_up};
pub use buffer::AlignedBuffer;
pub use config::{PoolConfig, StackConfig};
pub use double_stack::{DoubleStackAllocator, DoubleStackMarker, DoubleStackScope, StackSide};
pub use error::{MemoryError, MemoryResult};
pub use pool::{BlockState, PoolAllocator, PoolStats};
pub use stack::{StackAllocator, StackMarker, StackScope};

/// Common trait for all allocators
pub trait Allocator: Send + Sync {
    /// Whether a buffer is currently held
    fn is_initialized(&self) -> bool;

    /// Get the total usable capacity in bytes (0 when uninitialized)
    fn capacity(&self) -> usize;

    /// Get the currently used memory in bytes
    fn used(&self) -> usize;

    /// Get the available memory
    fn available(&self) -> usize {
        self.capacity().saturating_sub(self.used())
    }

    /// Reclaim every allocation, keeping the buffer
    fn clear(&self);

    /// Free the buffer and return to the uninitialized state
    fn release(&self);
}

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Unique tag for one successful `init`, stamped into markers.
pub(crate) fn next_generation() -> u64 {
    NEXT_GENERATION.fetch_add(1, Ordering::Relaxed)
}

pub mod prelude {
    pub use crate::{Allocator, DoubleStackAllocator, PoolAllocator, StackAllocator, StackSide};
    pub use crate::{MemoryError, MemoryResult, PoolConfig, StackConfig};
    pub use crate::{align_down, align_up, is_aligned};
}
