use alloc::sync::Arc;
use core::ptr::NonNull;

use snafu::{OptionExt as _, ResultExt as _, ensure};

use crate::{
    HeapHook,
    error::{HeapError, HookSnafu, OutOfMemorySnafu, OversizedSnafu},
    uid_heap::BackingHeap,
};

/// A size class that obtains each object directly from a [`HeapHook`].
///
/// Every object occupies exactly `item_size` bytes of hook memory regardless
/// of the requested size.
pub struct HookHeap {
    hook: Arc<dyn HeapHook>,
    item_size: usize,
}

impl HookHeap {
    /// Creates a size class serving objects of up to `item_size` bytes.
    ///
    /// The item size is raised to at least pointer size so that freed objects
    /// can be cached by an object heap.
    #[must_use]
    pub fn new(hook: Arc<dyn HeapHook>, item_size: usize) -> Self {
        Self {
            hook,
            item_size: item_size.max(size_of::<usize>()),
        }
    }

    /// Returns the number of bytes requested from the hook per object.
    #[must_use]
    pub fn item_size(&self) -> usize {
        self.item_size
    }
}

impl BackingHeap for HookHeap {
    fn allocate_with_size(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        ensure!(
            size <= self.item_size,
            OversizedSnafu {
                size,
                item_size: self.item_size,
            }
        );
        self.hook
            .allocate(self.item_size)
            .context(OutOfMemorySnafu {
                size: self.item_size,
            })
    }

    unsafe fn free(&self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        unsafe { self.hook.free(self.item_size, ptr) }.context(HookSnafu)
    }
}
