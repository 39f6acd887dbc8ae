//! Allocator configuration

use serde::{Deserialize, Serialize};

use crate::align::is_valid_alignment;
use crate::error::{MemoryError, MemoryResult};

/// Default alignment used by the configs (one cache line)
pub const DEFAULT_ALIGNMENT: usize = 64;

/// Configuration for [`StackAllocator`](crate::StackAllocator) and
/// [`DoubleStackAllocator`](crate::DoubleStackAllocator)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackConfig {
    /// Usable capacity in bytes (rounded up to `alignment`)
    pub capacity: usize,
    /// Alignment of every allocation; 0 disables alignment
    #[serde(default)]
    pub alignment: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            capacity: 1024 * 1024,
            alignment: DEFAULT_ALIGNMENT,
        }
    }
}

impl StackConfig {
    /// Create a new config with the given capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    /// Create with capacity in KB
    pub fn with_capacity_kb(kb: usize) -> Self {
        Self::new(kb * 1024)
    }

    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn validate(&self) -> MemoryResult<()> {
        if !is_valid_alignment(self.alignment) {
            return Err(MemoryError::InvalidAlignment(self.alignment));
        }
        if self.capacity == 0 {
            return Err(MemoryError::ZeroCapacity);
        }
        Ok(())
    }
}

/// Configuration for [`PoolAllocator`](crate::PoolAllocator)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Total capacity in bytes; the pool holds `capacity / full_block_size` blocks
    pub capacity: usize,
    /// Alignment of every block; 0 disables alignment
    #[serde(default)]
    pub alignment: usize,
    /// Requested data size of a single block
    pub block_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 64 * 1024,
            alignment: DEFAULT_ALIGNMENT,
            block_size: 64,
        }
    }
}

impl PoolConfig {
    /// Create a new config for `block_size`-byte blocks in `capacity` bytes
    pub fn new(capacity: usize, block_size: usize) -> Self {
        Self {
            capacity,
            block_size,
            ..Default::default()
        }
    }

    /// Size a pool to hold roughly `count` values of type `T`
    pub fn for_type<T>(count: usize) -> Self {
        let block_size = core::mem::size_of::<T>();
        let alignment = core::mem::align_of::<T>().max(core::mem::align_of::<usize>());
        let full = crate::align_up(block_size + crate::pool::LINK_SIZE, alignment);
        Self {
            capacity: full * count,
            alignment,
            block_size,
        }
    }

    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn validate(&self) -> MemoryResult<()> {
        if !is_valid_alignment(self.alignment) {
            return Err(MemoryError::InvalidAlignment(self.alignment));
        }
        if self.capacity == 0 {
            return Err(MemoryError::ZeroCapacity);
        }
        if self.block_size > self.capacity {
            return Err(MemoryError::BlockLargerThanCapacity {
                block_size: self.block_size,
                capacity: self.capacity,
            });
        }
        Ok(())
    }
}
