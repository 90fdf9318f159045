//! Kernel object heap for the Onix operating system.
//!
//! An [`ObjectHeap`] routes allocation requests to a ladder of size-class
//! heaps and, for allocations tagged with a resource type, enforces a limit on
//! the number of live objects and keeps a small cache of freed objects for
//! reuse.
//!
//! # Layers
//!
//! ```text
//!  caller
//!    │ allocate_typed / free_typed
//!    ▼
//!  resource limiter ──(cache hit)──▶ cached object
//!    │ cache miss
//!    ▼
//!  size-class selector ─▶ UidHeap ─▶ BackingHeap ─▶ HeapHook
//! ```
//!
//! - [`HeapHook`] supplies raw memory. It is provided by the creator of the
//!   object heap.
//! - [`BackingHeap`] is one size class. [`backing`] contains two
//!   implementations built on a hook.
//! - [`UidHeap`] is the shared handle through which the object heap calls
//!   any backing heap.
//! - [`ObjectHeap`] owns the size-class table and the per-type state.
//!
//! # Usage Example
//!
//! ```rust
//! use std::{alloc::Layout, ptr::NonNull, sync::Arc};
//!
//! use oheap::{
//!     HOOK_ALIGN, HeapDescriptor, HeapHook, HeapId, HookError, ObjectHeap, PhyMemPart,
//!     ResourceLimit, UidHeap, backing::FixedBlockHeap,
//! };
//!
//! struct SystemHook;
//!
//! impl HeapHook for SystemHook {
//!     fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
//!         let layout = Layout::from_size_align(size, HOOK_ALIGN).ok()?;
//!         NonNull::new(unsafe { std::alloc::alloc(layout) })
//!     }
//!
//!     unsafe fn free(&self, size: usize, ptr: NonNull<u8>) -> Result<(), HookError> {
//!         let layout = Layout::from_size_align(size, HOOK_ALIGN).unwrap();
//!         unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
//!         Ok(())
//!     }
//! }
//!
//! let hook: Arc<dyn HeapHook> = Arc::new(SystemHook);
//! let descriptors = [32, 64, 128].map(|size| {
//!     let pool = FixedBlockHeap::new(Arc::clone(&hook), size).unwrap();
//!     HeapDescriptor::new(size, UidHeap::from_heap(pool), HeapId(0))
//! });
//! let heap = ObjectHeap::new(PhyMemPart::new(0), descriptors, hook).unwrap();
//!
//! // at most one live object of type 0, one cached after free
//! heap.configure_limit(0, ResourceLimit::new(1, 1)).unwrap();
//! let object = heap.allocate_typed(0, 48).unwrap();
//! assert!(heap.allocate_typed(0, 48).unwrap_err().is_resource_limit_exceeded());
//!
//! unsafe { heap.free_typed(0, object).unwrap() };
//! assert_eq!(heap.allocate_typed(0, 48).unwrap(), object);
//! # unsafe { heap.free_typed(0, object).unwrap() };
//! heap.delete().unwrap();
//! ```
//!
//! # Thread Safety
//!
//! [`ObjectHeap`] is `Send + Sync`. Its state is guarded by one spin lock
//! that is never held while a backing heap runs. Backing heaps are shared and
//! synchronize internally.
//!
//! # Caller Obligations
//!
//! Objects must be freed to the heap and resource type they came from, once.
//! These conditions are not checked.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

pub use self::{
    descriptor::{HeapDescriptor, HeapId, MAX_HEAP_DESCRIPTORS},
    error::{HeapError, HookError, InvalidArgumentKind, Location, OheapError},
    hook::{HOOK_ALIGN, HeapHook},
    limiter::{Release, Reservation, ResourceLimit, ResourceStats},
    object_heap::ObjectHeap,
    uid_heap::{BackingHeap, UidHeap},
};

pub mod backing;
mod descriptor;
pub mod error;
mod hook;
mod limiter;
mod object_heap;
#[cfg(test)]
mod test_util;
mod uid_heap;

/// Number of resource types tracked by every object heap.
pub const RESOURCE_TYPE_COUNT: usize = 6;

/// Opaque handle of the physical memory partition an object heap belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhyMemPart(usize);

impl PhyMemPart {
    /// Wraps a raw partition handle.
    #[must_use]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// Returns the raw partition handle.
    #[must_use]
    pub const fn raw(self) -> usize {
        self.0
    }
}
