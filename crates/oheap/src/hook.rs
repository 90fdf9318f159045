//! Raw memory acquisition hook.

use core::ptr::NonNull;

use crate::error::HookError;

/// Minimum alignment of every block returned by [`HeapHook::allocate`].
pub const HOOK_ALIGN: usize = 16;

/// Source of raw memory for the heaps built on top of an object heap.
///
/// The hook is supplied by whoever creates the object heap. Nothing in this
/// crate obtains memory except through a hook or a [`BackingHeap`].
///
/// [`BackingHeap`]: crate::BackingHeap
pub trait HeapHook: Send + Sync {
    /// Allocates `size` bytes aligned to at least [`HOOK_ALIGN`].
    ///
    /// Returns `None` if the memory cannot be provided.
    fn allocate(&self, size: usize) -> Option<NonNull<u8>>;

    /// Returns a block previously obtained from [`allocate`](Self::allocate).
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate(size)` on this hook, with
    /// the same `size`, and must not be used after this call.
    unsafe fn free(&self, size: usize, ptr: NonNull<u8>) -> Result<(), HookError>;
}
