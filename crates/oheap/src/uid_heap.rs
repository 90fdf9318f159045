//! Dispatch shim over heterogeneous backing heaps.
//!
//! An object heap refers to its size classes through [`UidHeap`] handles. A
//! handle only forwards calls to the [`BackingHeap`] it was built from; it
//! holds no state of its own and takes no lock.

use alloc::sync::Arc;
use core::{fmt, ptr::NonNull};

use crate::error::HeapError;

/// An allocator that can serve as one size class of an object heap.
///
/// Implementations are shared between object heaps and must therefore do
/// their own synchronization.
pub trait BackingHeap: Send + Sync {
    /// Allocates an object of at least `size` bytes.
    fn allocate_with_size(&self, size: usize) -> Result<NonNull<u8>, HeapError>;

    /// Frees an object returned by
    /// [`allocate_with_size`](Self::allocate_with_size).
    ///
    /// # Safety
    ///
    /// `ptr` must have been allocated by this heap and must not be used after
    /// this call.
    unsafe fn free(&self, ptr: NonNull<u8>) -> Result<(), HeapError>;
}

/// Shared handle binding a [`BackingHeap`] implementation.
#[derive(Clone)]
pub struct UidHeap {
    class: Arc<dyn BackingHeap>,
}

impl fmt::Debug for UidHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UidHeap")
            .field("class", &Arc::as_ptr(&self.class).cast::<()>())
            .finish()
    }
}

impl UidHeap {
    /// Creates a handle dispatching to `class`.
    #[must_use]
    pub fn new(class: Arc<dyn BackingHeap>) -> Self {
        Self { class }
    }

    /// Wraps a concrete backing heap in a new handle.
    #[must_use]
    pub fn from_heap<H>(heap: H) -> Self
    where
        H: BackingHeap + 'static,
    {
        Self::new(Arc::new(heap))
    }

    /// Allocates `size` bytes from the bound heap.
    pub fn call_alloc(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.class.allocate_with_size(size)
    }

    /// Frees `ptr` to the bound heap.
    ///
    /// # Safety
    ///
    /// Same contract as [`BackingHeap::free`].
    pub unsafe fn call_free(&self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        unsafe { self.class.free(ptr) }
    }

    /// Returns `true` if both handles dispatch to the same heap instance.
    #[must_use]
    pub fn same_heap(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.class, &other.class)
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Recorder {
        last_size: AtomicUsize,
        frees: AtomicUsize,
    }

    impl BackingHeap for Recorder {
        fn allocate_with_size(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
            self.last_size.store(size, Ordering::Relaxed);
            Ok(NonNull::dangling())
        }

        unsafe fn free(&self, _ptr: NonNull<u8>) -> Result<(), HeapError> {
            self.frees.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    #[test]
    fn test_forwards_to_bound_heap() {
        let recorder = Arc::new(Recorder {
            last_size: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
        });
        let heap = UidHeap::new(Arc::clone(&recorder) as Arc<dyn BackingHeap>);

        let ptr = heap.call_alloc(48).unwrap();
        assert_eq!(recorder.last_size.load(Ordering::Relaxed), 48);

        unsafe { heap.call_free(ptr).unwrap() };
        assert_eq!(recorder.frees.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_same_heap() {
        let a = UidHeap::from_heap(Recorder {
            last_size: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
        });
        let b = UidHeap::from_heap(Recorder {
            last_size: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
        });
        assert!(a.same_heap(&a.clone()));
        assert!(!a.same_heap(&b));
    }
}
