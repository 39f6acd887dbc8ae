//! Pool allocator - fixed-size block allocation
//!
//! The buffer is sliced into blocks of `full_block_size` bytes:
//!
//! ```text
//! | data (block_size) | prev | next |
//! ```
//!
//! The trailing link pair threads the block through one of two doubly linked
//! lists. While a block is free the links belong to the free list, while it is
//! allocated they belong to the allocated list. Which list a block is on is
//! recorded by the allocator in a [`BlockState`] per block, never inferred
//! from the bytes the caller can write to.

use core::ptr::NonNull;
use parking_lot::Mutex;

use crate::align::{is_valid_alignment, try_align_up};
use crate::buffer::AlignedBuffer;
use crate::config::PoolConfig;
use crate::error::{MemoryError, MemoryResult};
use crate::Allocator;

/// Link slots stored at the end of every block
#[repr(C)]
#[derive(Clone, Copy)]
struct BlockLinks {
    prev: usize,
    next: usize,
}

/// Bytes reserved per block for the list links
pub(crate) const LINK_SIZE: usize = core::mem::size_of::<BlockLinks>();

const NIL: usize = usize::MAX;

#[inline]
fn encode(index: Option<usize>) -> usize {
    index.unwrap_or(NIL)
}

#[inline]
fn decode(raw: usize) -> Option<usize> {
    (raw != NIL).then_some(raw)
}

/// Which list a pool block currently belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockState {
    Free,
    Allocated,
}

struct PoolState {
    buffer: AlignedBuffer,
    alignment: usize,
    /// Offset of block 0
    first: usize,
    full_block_size: usize,
    /// Data bytes per block, link slots excluded
    block_size: usize,
    block_count: usize,
    free_head: Option<usize>,
    allocated_head: Option<usize>,
    allocated: usize,
    blocks: Vec<BlockState>,
}

impl PoolState {
    #[inline]
    fn block_offset(&self, index: usize) -> usize {
        self.first + index * self.full_block_size
    }

    #[inline]
    fn links_ptr(&self, index: usize) -> *mut BlockLinks {
        debug_assert!(index < self.block_count);
        self.buffer
            .ptr_at(self.block_offset(index) + self.block_size)
            .cast::<BlockLinks>()
            .as_ptr()
    }

    fn links(&self, index: usize) -> (Option<usize>, Option<usize>) {
        let links = unsafe { self.links_ptr(index).read_unaligned() };
        (decode(links.prev), decode(links.next))
    }

    fn set_links(&mut self, index: usize, prev: Option<usize>, next: Option<usize>) {
        let links = BlockLinks {
            prev: encode(prev),
            next: encode(next),
        };
        unsafe { self.links_ptr(index).write_unaligned(links) };
    }

    fn set_prev(&mut self, index: usize, prev: Option<usize>) {
        let (_, next) = self.links(index);
        self.set_links(index, prev, next);
    }

    fn set_next(&mut self, index: usize, next: Option<usize>) {
        let (prev, _) = self.links(index);
        self.set_links(index, prev, next);
    }

    /// Chain every block into the free list in address order
    fn link_all_free(&mut self) {
        for index in 0..self.block_count {
            let prev = index.checked_sub(1);
            let next = (index + 1 < self.block_count).then_some(index + 1);
            self.set_links(index, prev, next);
            self.blocks[index] = BlockState::Free;
        }
        self.free_head = (self.block_count > 0).then_some(0);
        self.allocated_head = None;
        self.allocated = 0;
    }

    fn index_of(&self, ptr: *const u8) -> MemoryResult<usize> {
        let offset = self.buffer.offset_of(ptr).ok_or(MemoryError::ForeignPointer)?;
        let end = self.first + self.block_count * self.full_block_size;
        if offset < self.first || offset >= end {
            return Err(MemoryError::ForeignPointer);
        }

        let relative = offset - self.first;
        if relative % self.full_block_size != 0 {
            return Err(MemoryError::MisalignedBlock { offset: relative });
        }
        Ok(relative / self.full_block_size)
    }

    /// Move the head of the free list to the head of the allocated list
    fn take_free(&mut self) -> Option<usize> {
        let index = self.free_head?;

        let (_, next_free) = self.links(index);
        self.free_head = next_free;
        if let Some(next) = next_free {
            self.set_prev(next, None);
        }

        let old_head = self.allocated_head;
        self.set_links(index, None, old_head);
        if let Some(head) = old_head {
            self.set_prev(head, Some(index));
        }
        self.allocated_head = Some(index);

        self.blocks[index] = BlockState::Allocated;
        self.allocated += 1;
        Some(index)
    }

    /// Unlink an allocated block and push it onto the free list
    fn give_back(&mut self, index: usize) -> MemoryResult<()> {
        if self.blocks[index] == BlockState::Free {
            return Err(MemoryError::DoubleFree { index });
        }

        let (prev, next) = self.links(index);
        match prev {
            Some(prev) => self.set_next(prev, next),
            None => self.allocated_head = next,
        }
        if let Some(next) = next {
            self.set_prev(next, prev);
        }

        let old_head = self.free_head;
        self.set_links(index, None, old_head);
        if let Some(head) = old_head {
            self.set_prev(head, Some(index));
        }
        self.free_head = Some(index);

        self.blocks[index] = BlockState::Free;
        self.allocated -= 1;
        Ok(())
    }

    /// Walk one list, checking back links and membership
    fn walk(&self, head: Option<usize>, expected: BlockState) -> MemoryResult<usize> {
        let mut len = 0;
        let mut prev = None;
        let mut cursor = head;

        while let Some(index) = cursor {
            if index >= self.block_count {
                return Err(MemoryError::Corrupted("link points past the last block"));
            }
            if self.blocks[index] != expected {
                return Err(MemoryError::Corrupted("block is on the wrong list"));
            }
            let (back, next) = self.links(index);
            if back != prev {
                return Err(MemoryError::Corrupted("back link does not match"));
            }

            len += 1;
            if len > self.block_count {
                return Err(MemoryError::Corrupted("list contains a cycle"));
            }
            prev = Some(index);
            cursor = next;
        }
        Ok(len)
    }
}

/// Pool allocator for fixed-size blocks
///
/// Blocks may be freed in any order. Allocation pops the most recently freed
/// block, so a freed block is the next one handed out.
pub struct PoolAllocator {
    state: Mutex<Option<PoolState>>,
}

impl PoolAllocator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
        }
    }

    pub fn from_config(config: PoolConfig) -> MemoryResult<Self> {
        let pool = Self::new();
        pool.init_with(&config)?;
        Ok(pool)
    }

    /// (Re)initialize with as many blocks as fit in `capacity` bytes.
    ///
    /// Each block holds `block_size` data bytes plus its link slots, rounded up
    /// to `alignment`. On error the previous state is kept.
    pub fn init(&self, capacity: usize, alignment: usize, block_size: usize) -> MemoryResult<()> {
        if !is_valid_alignment(alignment) {
            return Err(MemoryError::InvalidAlignment(alignment));
        }
        if capacity == 0 {
            return Err(MemoryError::ZeroCapacity);
        }
        if block_size > capacity {
            return Err(MemoryError::BlockLargerThanCapacity {
                block_size,
                capacity,
            });
        }

        let full_block_size = block_size
            .checked_add(LINK_SIZE)
            .and_then(|size| try_align_up(size, alignment))
            .ok_or(MemoryError::CapacityOverflow)?;
        let block_count = capacity / full_block_size;
        if block_count == 0 {
            return Err(MemoryError::PoolTooSmall {
                capacity,
                full_block_size,
            });
        }

        let mut guard = self.state.lock();

        let buffer = AlignedBuffer::new(block_count * full_block_size, alignment)?;
        let mut state = PoolState {
            first: buffer.base(),
            buffer,
            alignment,
            full_block_size,
            block_size: full_block_size - LINK_SIZE,
            block_count,
            free_head: None,
            allocated_head: None,
            allocated: 0,
            blocks: vec![BlockState::Free; block_count],
        };
        state.link_all_free();

        log::debug!(
            "Pool allocator initialized: {} blocks of {} bytes ({} with links), alignment {}",
            block_count,
            state.block_size,
            full_block_size,
            alignment
        );

        *guard = Some(state);
        Ok(())
    }

    pub fn init_with(&self, config: &PoolConfig) -> MemoryResult<()> {
        self.init(config.capacity, config.alignment, config.block_size)
    }

    pub fn release(&self) {
        if self.state.lock().take().is_some() {
            log::debug!("Pool allocator released");
        }
    }

    /// Free every allocated block, one at a time, newest first
    pub fn clear(&self) {
        let mut guard = self.state.lock();
        let Some(state) = guard.as_mut() else {
            return;
        };

        while let Some(index) = state.allocated_head {
            if let Err(e) = state.give_back(index) {
                log::error!("Pool clear stopped at block {}: {}", index, e);
                break;
            }
        }
    }

    /// Allocate one block, returning a pointer to its data portion
    pub fn alloc(&self) -> Option<NonNull<u8>> {
        let mut guard = self.state.lock();
        let state = guard.as_mut()?;

        match state.take_free() {
            Some(index) => Some(state.buffer.ptr_at(state.block_offset(index))),
            None => {
                log::trace!("Pool exhausted: all {} blocks allocated", state.block_count);
                None
            }
        }
    }

    /// Return a block to the pool.
    ///
    /// Pointers that are not the data start of a block of this pool, and
    /// blocks that are already free, are rejected without touching the lists.
    pub fn free(&self, ptr: NonNull<u8>) -> MemoryResult<()> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or(MemoryError::NotInitialized)?;

        let result = state
            .index_of(ptr.as_ptr())
            .and_then(|index| state.give_back(index));
        if let Err(e) = &result {
            log::warn!("Rejected pool free of {:p}: {}", ptr, e);
        }
        result
    }

    /// Whether `ptr` is the data start of one of this pool's blocks
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.state
            .lock()
            .as_ref()
            .is_some_and(|s| s.index_of(ptr).is_ok())
    }

    /// Check that every block is on exactly one list and all links agree
    pub fn validate(&self) -> MemoryResult<()> {
        let guard = self.state.lock();
        let state = guard.as_ref().ok_or(MemoryError::NotInitialized)?;

        let free = state.walk(state.free_head, BlockState::Free)?;
        let allocated = state.walk(state.allocated_head, BlockState::Allocated)?;

        if allocated != state.allocated {
            return Err(MemoryError::Corrupted("allocated count does not match list"));
        }
        if free + allocated != state.block_count {
            return Err(MemoryError::Corrupted("blocks missing from both lists"));
        }
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        self.state
            .lock()
            .as_ref()
            .map_or_else(PoolStats::default, |s| PoolStats {
                block_size: s.block_size,
                full_block_size: s.full_block_size,
                total_blocks: s.block_count,
                allocated_blocks: s.allocated,
                free_blocks: s.block_count - s.allocated,
            })
    }

    pub fn alignment(&self) -> usize {
        self.state.lock().as_ref().map_or(0, |s| s.alignment)
    }

    /// Data bytes available in each block
    pub fn block_size(&self) -> usize {
        self.stats().block_size
    }

    pub fn block_count(&self) -> usize {
        self.stats().total_blocks
    }

    pub fn allocated_count(&self) -> usize {
        self.stats().allocated_blocks
    }

    pub fn free_count(&self) -> usize {
        self.stats().free_blocks
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().is_some()
    }
}

impl Allocator for PoolAllocator {
    fn is_initialized(&self) -> bool {
        PoolAllocator::is_initialized(self)
    }

    fn capacity(&self) -> usize {
        let stats = self.stats();
        stats.total_blocks * stats.full_block_size
    }

    fn used(&self) -> usize {
        let stats = self.stats();
        stats.allocated_blocks * stats.full_block_size
    }

    fn clear(&self) {
        PoolAllocator::clear(self)
    }

    fn release(&self) {
        PoolAllocator::release(self)
    }
}

impl Default for PoolAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Pool statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub block_size: usize,
    pub full_block_size: usize,
    pub total_blocks: usize,
    pub allocated_blocks: usize,
    pub free_blocks: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::is_aligned;

    fn addr(ptr: NonNull<u8>) -> usize {
        ptr.as_ptr() as usize
    }

    #[test]
    fn test_pool_geometry() {
        let pool = PoolAllocator::new();
        pool.init(1000, 8, 40).unwrap();

        let stats = pool.stats();
        assert_eq!(stats.full_block_size, 40 + LINK_SIZE);
        assert_eq!(stats.block_size, 40);
        assert_eq!(stats.total_blocks, 1000 / (40 + LINK_SIZE));
        assert_eq!(stats.free_blocks, stats.total_blocks);
    }

    #[test]
    fn test_pool_block_size_absorbs_padding() {
        let pool = PoolAllocator::new();
        pool.init(4096, 64, 10).unwrap();

        assert_eq!(pool.stats().full_block_size, 64);
        assert_eq!(pool.block_size(), 64 - LINK_SIZE);
        assert_eq!(pool.block_count(), 64);
    }

    #[test]
    fn test_pool_exhaustion_and_reuse() {
        let pool = PoolAllocator::new();
        pool.init(1000, 8, 40).unwrap();
        let count = pool.block_count();

        let blocks: Vec<_> = (0..count).map(|_| pool.alloc().unwrap()).collect();
        assert!(pool.alloc().is_none());
        assert_eq!(pool.free_count(), 0);

        let ninth = blocks[8];
        pool.free(ninth).unwrap();
        assert_eq!(pool.alloc(), Some(ninth));
        assert!(pool.alloc().is_none());
        pool.validate().unwrap();
    }

    #[test]
    fn test_pool_blocks_are_aligned_and_distinct() {
        let pool = PoolAllocator::new();
        pool.init(4096, 32, 24).unwrap();
        let full = pool.stats().full_block_size;

        let mut addrs: Vec<_> = std::iter::from_fn(|| pool.alloc()).map(addr).collect();
        assert_eq!(addrs.len(), pool.block_count());
        for &a in &addrs {
            assert!(is_aligned(a as *const u8, 32));
        }

        addrs.sort_unstable();
        for pair in addrs.windows(2) {
            assert_eq!(pair[1] - pair[0], full);
        }
    }

    #[test]
    fn test_pool_free_from_middle_of_allocated_list() {
        let pool = PoolAllocator::new();
        pool.init(1024, 16, 16).unwrap();

        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        let c = pool.alloc().unwrap();

        pool.free(b).unwrap();
        pool.validate().unwrap();
        pool.free(a).unwrap();
        pool.validate().unwrap();
        pool.free(c).unwrap();
        pool.validate().unwrap();

        assert_eq!(pool.allocated_count(), 0);
    }

    #[test]
    fn test_pool_rejects_bad_pointers() {
        let pool = PoolAllocator::new();
        pool.init(1024, 16, 16).unwrap();
        let block = pool.alloc().unwrap();

        let mut outside = 0u64;
        let foreign = NonNull::from(&mut outside).cast::<u8>();
        assert_eq!(pool.free(foreign), Err(MemoryError::ForeignPointer));

        let interior = unsafe { NonNull::new_unchecked(block.as_ptr().add(4)) };
        assert_eq!(pool.free(interior), Err(MemoryError::MisalignedBlock { offset: 4 }));

        pool.free(block).unwrap();
        assert_eq!(pool.free(block), Err(MemoryError::DoubleFree { index: 0 }));

        pool.validate().unwrap();
        assert_eq!(pool.free_count(), pool.block_count());
    }

    #[test]
    fn test_pool_contains() {
        let pool = PoolAllocator::new();
        pool.init(256, 8, 16).unwrap();
        let block = pool.alloc().unwrap();

        assert!(pool.contains(block.as_ptr()));
        assert!(!pool.contains(unsafe { block.as_ptr().add(1) }));
        assert!(!pool.contains(core::ptr::null()));
    }

    #[test]
    fn test_pool_clear() {
        let pool = PoolAllocator::new();
        pool.init(1024, 8, 32).unwrap();

        for _ in 0..5 {
            pool.alloc().unwrap();
        }
        pool.clear();

        assert_eq!(pool.allocated_count(), 0);
        assert_eq!(pool.free_count(), pool.block_count());
        pool.validate().unwrap();
        assert_eq!(std::iter::from_fn(|| pool.alloc()).count(), pool.block_count());
    }

    #[test]
    fn test_pool_data_writes_keep_links_intact() {
        let pool = PoolAllocator::new();
        pool.init(1024, 8, 40).unwrap();
        let size = pool.block_size();

        let blocks: Vec<_> = (0..4).map(|_| pool.alloc().unwrap()).collect();
        for block in &blocks {
            unsafe { core::ptr::write_bytes(block.as_ptr(), 0xFF, size) };
        }
        pool.validate().unwrap();

        for block in blocks.into_iter().rev() {
            pool.free(block).unwrap();
        }
        pool.validate().unwrap();
    }

    #[test]
    fn test_pool_init_errors() {
        let pool = PoolAllocator::new();
        assert_eq!(
            pool.init(32, 8, 40),
            Err(MemoryError::BlockLargerThanCapacity { block_size: 40, capacity: 32 })
        );
        assert_eq!(pool.init(1024, 12, 40), Err(MemoryError::InvalidAlignment(12)));
        assert_eq!(
            pool.init(40, 8, 40),
            Err(MemoryError::PoolTooSmall { capacity: 40, full_block_size: 40 + LINK_SIZE })
        );
        assert!(!pool.is_initialized());
        assert_eq!(pool.free(NonNull::dangling()), Err(MemoryError::NotInitialized));
    }

    #[test]
    fn test_pool_release() {
        let pool = PoolAllocator::new();
        pool.init(512, 8, 8).unwrap();
        pool.alloc().unwrap();

        pool.release();
        assert!(!pool.is_initialized());
        assert_eq!(pool.stats(), PoolStats::default());
        assert!(pool.alloc().is_none());
    }

    #[test]
    fn test_pool_reinit_replaces_blocks() {
        let pool = PoolAllocator::from_config(PoolConfig::new(512, 8).with_alignment(8)).unwrap();
        pool.alloc().unwrap();
        assert_eq!(pool.allocated_count(), 1);

        pool.init(2048, 16, 32).unwrap();
        assert_eq!(pool.allocated_count(), 0);
        assert_eq!(pool.stats().full_block_size, 48);
        pool.validate().unwrap();
    }
}
