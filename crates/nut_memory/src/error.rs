//! Error types for the allocators

use thiserror::Error;

/// Errors reported by allocator configuration and contract checks.
///
/// Running out of capacity is not an error: `alloc` returns `None` for that.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("Alignment {0} is neither zero nor a power of two")]
    InvalidAlignment(usize),

    #[error("Allocator capacity must be greater than zero")]
    ZeroCapacity,

    #[error("Block size {block_size} exceeds pool capacity {capacity}")]
    BlockLargerThanCapacity { block_size: usize, capacity: usize },

    #[error("Pool capacity {capacity} cannot hold a single {full_block_size}-byte block")]
    PoolTooSmall { capacity: usize, full_block_size: usize },

    #[error("Requested size overflows the address space")]
    CapacityOverflow,

    #[error("Failed to allocate {size} bytes from the system")]
    OutOfMemory { size: usize },

    #[error("Allocator is not initialized")]
    NotInitialized,

    #[error("Marker at offset {marker} is outside the live range {low}..={high}")]
    MarkerOutOfRange { marker: usize, low: usize, high: usize },

    #[error("Marker belongs to a different allocator or a previous init")]
    StaleMarker,

    #[error("Pointer does not belong to this pool")]
    ForeignPointer,

    #[error("Pointer at offset {offset} is not the start of a pool block")]
    MisalignedBlock { offset: usize },

    #[error("Block {index} is already free")]
    DoubleFree { index: usize },

    #[error("Pool lists are inconsistent: {0}")]
    Corrupted(&'static str),
}

/// Result type alias
pub type MemoryResult<T> = Result<T, MemoryError>;
