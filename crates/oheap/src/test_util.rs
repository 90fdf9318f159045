use core::{
    alloc::Layout,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    BackingHeap, HeapHook,
    error::{HeapError, HookError},
    hook::HOOK_ALIGN,
};

/// Hook over the system allocator that tracks outstanding bytes.
pub(crate) struct SystemHook {
    capacity: usize,
    live_bytes: AtomicUsize,
}

impl SystemHook {
    pub(crate) fn new() -> Self {
        Self::with_capacity(usize::MAX)
    }

    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            live_bytes: AtomicUsize::new(0),
        }
    }

    pub(crate) fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::SeqCst)
    }
}

impl HeapHook for SystemHook {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size, HOOK_ALIGN).ok()?;
        self.live_bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                live.checked_add(size).filter(|&total| total <= self.capacity)
            })
            .ok()?;
        let ptr = NonNull::new(unsafe { std::alloc::alloc(layout) });
        if ptr.is_none() {
            self.live_bytes.fetch_sub(size, Ordering::SeqCst);
        }
        ptr
    }

    unsafe fn free(&self, size: usize, ptr: NonNull<u8>) -> Result<(), HookError> {
        let layout = Layout::from_size_align(size, HOOK_ALIGN).map_err(|_e| HookError::new(-1))?;
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        self.live_bytes.fetch_sub(size, Ordering::SeqCst);
        Ok(())
    }
}

/// Backing heap wrapper counting the calls that reach it.
pub(crate) struct CountingHeap<H> {
    inner: H,
    allocs: AtomicUsize,
    frees: AtomicUsize,
}

impl<H> CountingHeap<H> {
    pub(crate) fn new(inner: H) -> Self {
        Self {
            inner,
            allocs: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
        }
    }

    pub(crate) fn allocs(&self) -> usize {
        self.allocs.load(Ordering::SeqCst)
    }

    pub(crate) fn frees(&self) -> usize {
        self.frees.load(Ordering::SeqCst)
    }
}

impl<H> BackingHeap for CountingHeap<H>
where
    H: BackingHeap,
{
    fn allocate_with_size(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.allocs.fetch_add(1, Ordering::SeqCst);
        self.inner.allocate_with_size(size)
    }

    unsafe fn free(&self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        self.frees.fetch_add(1, Ordering::SeqCst);
        unsafe { self.inner.free(ptr) }
    }
}
