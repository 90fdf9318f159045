use alloc::{sync::Arc, vec::Vec};
use core::{fmt, ptr::NonNull};

use snafu::{OptionExt as _, ensure};
use spin::Mutex;

use crate::{
    HeapHook,
    error::{HeapError, InvalidBlockSizeSnafu, OutOfMemorySnafu, OversizedSnafu},
    uid_heap::BackingHeap,
};

/// Preferred size of the arenas requested from the hook.
const ARENA_SIZE: usize = 4096;

/// A free block. Stored at the beginning of the block it describes.
struct FreeBlock {
    next: Option<NonNull<FreeBlock>>,
}

struct Pool {
    free: Option<NonNull<FreeBlock>>,
    free_count: usize,
    arenas: Vec<NonNull<u8>>,
}

// All pointers in the pool refer to arenas owned by the pool.
unsafe impl Send for Pool {}

impl Pool {
    unsafe fn push(&mut self, block: NonNull<u8>) {
        let block = block.cast::<FreeBlock>();
        assert!(
            block.as_ptr().is_aligned(),
            "Block pointer must be properly aligned"
        );
        unsafe {
            block.write(FreeBlock { next: self.free });
        }
        self.free = Some(block);
        self.free_count += 1;
    }

    fn pop(&mut self) -> Option<NonNull<u8>> {
        let block = self.free?;
        self.free = unsafe { block.read().next };
        self.free_count -= 1;
        Some(block.cast())
    }
}

/// A pool of equally sized blocks carved from hook-provided arenas.
///
/// Arenas are requested from the hook on demand, up to an optional maximum,
/// and are returned to the hook when the pool is dropped. Freed blocks are
/// reused most-recently-freed first.
pub struct FixedBlockHeap {
    hook: Arc<dyn HeapHook>,
    block_size: usize,
    arena_size: usize,
    max_arenas: Option<usize>,
    pool: Mutex<Pool>,
}

impl fmt::Debug for FixedBlockHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedBlockHeap")
            .field("block_size", &self.block_size)
            .field("arena_size", &self.arena_size)
            .field("max_arenas", &self.max_arenas)
            .finish_non_exhaustive()
    }
}

impl FixedBlockHeap {
    /// Creates an empty pool serving objects of up to `block_size` bytes.
    ///
    /// The block size is rounded up so that every block can hold a free list
    /// link. Fails with [`HeapError::InvalidBlockSize`] if the rounded size
    /// does not fit in `usize`.
    pub fn new(hook: Arc<dyn HeapHook>, block_size: usize) -> Result<Self, HeapError> {
        let block_size = block_size
            .max(size_of::<FreeBlock>())
            .checked_next_multiple_of(align_of::<FreeBlock>())
            .context(InvalidBlockSizeSnafu { block_size })?;
        let arena_size = block_size * usize::max(1, ARENA_SIZE / block_size);
        Ok(Self {
            hook,
            block_size,
            arena_size,
            max_arenas: None,
            pool: Mutex::new(Pool {
                free: None,
                free_count: 0,
                arenas: Vec::new(),
            }),
        })
    }

    /// Limits the number of arenas the pool may request from the hook.
    #[must_use]
    pub fn with_max_arenas(mut self, max_arenas: usize) -> Self {
        self.max_arenas = Some(max_arenas);
        self
    }

    /// Returns the rounded block size.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Returns the number of blocks carved from one arena.
    #[must_use]
    pub fn blocks_per_arena(&self) -> usize {
        self.arena_size / self.block_size
    }

    /// Returns the number of arenas obtained from the hook so far.
    #[must_use]
    pub fn arena_count(&self) -> usize {
        self.pool.lock().arenas.len()
    }

    /// Returns the number of blocks ready to be handed out.
    #[must_use]
    pub fn free_blocks(&self) -> usize {
        self.pool.lock().free_count
    }

    fn refill(&self, pool: &mut Pool) -> Option<()> {
        if let Some(max) = self.max_arenas
            && pool.arenas.len() >= max
        {
            return None;
        }

        let arena = self.hook.allocate(self.arena_size)?;
        pool.arenas.push(arena);
        for index in (0..self.blocks_per_arena()).rev() {
            unsafe {
                pool.push(arena.add(index * self.block_size));
            }
        }
        log::trace!(
            "fixed block heap: new arena, block_size={:#x}, arenas={}",
            self.block_size,
            pool.arenas.len()
        );
        Some(())
    }
}

impl BackingHeap for FixedBlockHeap {
    fn allocate_with_size(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        ensure!(
            size <= self.block_size,
            OversizedSnafu {
                size,
                item_size: self.block_size,
            }
        );

        let mut pool = self.pool.lock();
        if pool.free.is_none() {
            self.refill(&mut pool).context(OutOfMemorySnafu {
                size: self.block_size,
            })?;
        }
        pool.pop().context(OutOfMemorySnafu {
            size: self.block_size,
        })
    }

    unsafe fn free(&self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        unsafe {
            self.pool.lock().push(ptr);
        }
        Ok(())
    }
}

impl Drop for FixedBlockHeap {
    fn drop(&mut self) {
        let pool = self.pool.get_mut();
        for arena in pool.arenas.drain(..) {
            if let Err(err) = unsafe { self.hook.free(self.arena_size, arena) } {
                log::warn!("fixed block heap: failed to release arena: {err}");
            }
        }
        pool.free = None;
        pool.free_count = 0;
    }
}
