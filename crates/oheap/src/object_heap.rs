//! The object heap facade.

use alloc::sync::Arc;
use core::{
    fmt,
    ptr::{self, NonNull},
};

use snafu::{OptionExt as _, ResultExt as _, ensure};
use spin::Mutex;

use crate::{
    HeapHook, PhyMemPart, RESOURCE_TYPE_COUNT,
    descriptor::{HeapDescriptor, HeapId, HeapTable},
    error::{
        BackingAllocSnafu, BackingFreeSnafu, InvalidArgumentKind, InvalidArgumentSnafu,
        NoSuitableHeapSnafu, OheapError,
    },
    limiter::{Release, Reservation, ResourceLimit, ResourceStats, ResourceTypeState},
    uid_heap::UidHeap,
};

struct Inner {
    heaps: HeapTable,
    types: [ResourceTypeState; RESOURCE_TYPE_COUNT],
    fixed_heap: Option<UidHeap>,
}

impl Inner {
    fn state_mut(&mut self, resource_type: usize) -> Result<&mut ResourceTypeState, OheapError> {
        self.types
            .get_mut(resource_type)
            .context(InvalidArgumentSnafu {
                kind: InvalidArgumentKind::ResourceTypeOutOfRange { resource_type },
            })
    }

    fn parts_mut(
        &mut self,
        resource_type: usize,
    ) -> Result<(&HeapTable, &mut ResourceTypeState), OheapError> {
        let Self { heaps, types, .. } = self;
        let state = types.get_mut(resource_type).context(InvalidArgumentSnafu {
            kind: InvalidArgumentKind::ResourceTypeOutOfRange { resource_type },
        })?;
        Ok((&*heaps, state))
    }
}

/// A multiplexing allocator over a ladder of size-class heaps with
/// per-resource-type limits and caches.
///
/// All descriptor and resource type state lives behind a single spin lock.
/// Each operation takes the lock once; calls into backing heaps are made
/// after the lock has been released.
pub struct ObjectHeap {
    partition: PhyMemPart,
    hook: Arc<dyn HeapHook>,
    inner: Mutex<Inner>,
}

impl fmt::Debug for ObjectHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectHeap")
            .field("partition", &self.partition)
            .finish_non_exhaustive()
    }
}

impl ObjectHeap {
    /// Creates an object heap over `descriptors`.
    ///
    /// Descriptors must be ordered by non-decreasing item size. Every resource
    /// type starts unlimited with caching disabled.
    pub fn new<I>(
        partition: PhyMemPart,
        descriptors: I,
        hook: Arc<dyn HeapHook>,
    ) -> Result<Self, OheapError>
    where
        I: IntoIterator<Item = HeapDescriptor>,
    {
        let heaps = HeapTable::new(descriptors)?;
        log::debug!(
            "object heap created: partition={partition:?}, size_classes={}",
            heaps.as_slice().len()
        );
        Ok(Self {
            partition,
            hook,
            inner: Mutex::new(Inner {
                heaps,
                types: [const { ResourceTypeState::new() }; RESOURCE_TYPE_COUNT],
                fixed_heap: None,
            }),
        })
    }

    /// Returns the physical memory partition this heap was created for.
    #[must_use]
    pub fn partition(&self) -> PhyMemPart {
        self.partition
    }

    /// Returns the hook supplied at creation.
    #[must_use]
    pub fn heap_hook(&self) -> &Arc<dyn HeapHook> {
        &self.hook
    }

    /// Returns the heap that serves allocations of `size` bytes.
    #[must_use]
    pub fn heap_for_size(&self, size: usize) -> Option<UidHeap> {
        self.inner.lock().heaps.select_heap(size)
    }

    /// Binds `heap` to the size class `item_size`, adding the class if it is
    /// not present yet. Passing `None` unbinds the class.
    pub fn set_heap_for_size(
        &self,
        item_size: usize,
        heap: Option<UidHeap>,
        heap_id: HeapId,
    ) -> Result<(), OheapError> {
        self.inner.lock().heaps.bind(item_size, heap, heap_id)?;
        log::debug!("object heap: bound size class {item_size:#x} to {heap_id:?}");
        Ok(())
    }

    /// Returns the heap registered for fixed-size kernel objects, if any.
    ///
    /// The object heap stores this slot for its owner and never allocates
    /// from it.
    #[must_use]
    pub fn fixed_heap(&self) -> Option<UidHeap> {
        self.inner.lock().fixed_heap.clone()
    }

    /// Replaces the fixed-size heap slot.
    pub fn set_fixed_heap(&self, heap: Option<UidHeap>) {
        self.inner.lock().fixed_heap = heap;
    }

    /// Replaces the limit of `resource_type`.
    ///
    /// Cached objects beyond a reduced freelist size are not evicted; they are
    /// consumed by later allocations while further frees bypass the cache.
    pub fn configure_limit(
        &self,
        resource_type: usize,
        limit: ResourceLimit,
    ) -> Result<(), OheapError> {
        self.inner.lock().state_mut(resource_type)?.set_limit(limit);
        log::debug!("object heap: resource_type={resource_type} limit={limit:?}");
        Ok(())
    }

    /// Applies `limits[i]` to resource type `i`.
    ///
    /// Nothing is applied if there are more entries than resource types.
    pub fn configure_limits_all(&self, limits: &[ResourceLimit]) -> Result<(), OheapError> {
        ensure!(
            limits.len() <= RESOURCE_TYPE_COUNT,
            InvalidArgumentSnafu {
                kind: InvalidArgumentKind::TooManyLimits {
                    count: limits.len(),
                },
            }
        );
        let mut inner = self.inner.lock();
        for (state, limit) in inner.types.iter_mut().zip(limits) {
            state.set_limit(*limit);
        }
        log::debug!("object heap: applied {} resource limits", limits.len());
        Ok(())
    }

    /// Sets the object size of `resource_type`, which selects the size class
    /// that uncached objects of that type are returned to.
    pub fn set_resource_size(&self, resource_type: usize, size: usize) -> Result<(), OheapError> {
        self.inner
            .lock()
            .state_mut(resource_type)?
            .set_resource_size(size);
        Ok(())
    }

    /// Returns a snapshot of the counters of `resource_type`.
    pub fn resource_stats(&self, resource_type: usize) -> Result<ResourceStats, OheapError> {
        Ok(self.inner.lock().state_mut(resource_type)?.stats())
    }

    /// Reserves a slot of `resource_type`, taking a cached object if one is
    /// available.
    ///
    /// After [`Reservation::Fresh`] the caller allocates the object itself and
    /// must call [`cancel_reservation`](Self::cancel_reservation) if that
    /// fails.
    pub fn try_reserve(&self, resource_type: usize) -> Result<Reservation, OheapError> {
        let mut inner = self.inner.lock();
        let state = inner.state_mut(resource_type)?;
        let reservation = state.reserve(resource_type);
        log::trace!(
            "reserve: resource_type={resource_type}, result={reservation:?}, live={}",
            state.stats().live
        );
        reservation
    }

    /// Rolls back a [`Reservation::Fresh`] whose allocation failed.
    pub fn cancel_reservation(&self, resource_type: usize) -> Result<(), OheapError> {
        self.inner.lock().state_mut(resource_type)?.cancel(resource_type);
        Ok(())
    }

    /// Releases a slot of `resource_type`, caching `object` if there is room.
    ///
    /// After [`Release::Rejected`] the caller still owns `object` and must
    /// free it to its heap.
    ///
    /// # Safety
    ///
    /// `object` must be a pointer-aligned object of at least pointer size that
    /// is no longer used by the caller. If the type has a resource size, the
    /// size check of [`free_typed`](Self::free_typed) applies as well.
    pub unsafe fn try_release(
        &self,
        resource_type: usize,
        object: NonNull<u8>,
    ) -> Result<Release, OheapError> {
        let mut inner = self.inner.lock();
        let state = inner.state_mut(resource_type)?;
        let release = unsafe { state.release(resource_type, object) };
        log::trace!(
            "release: resource_type={resource_type}, result={release:?}, live={}",
            state.stats().live
        );
        Ok(release)
    }

    /// Allocates `size` bytes from the smallest fitting size class.
    ///
    /// Resource limits are not consulted.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, OheapError> {
        let heap = self
            .inner
            .lock()
            .heaps
            .select_heap(size)
            .context(NoSuitableHeapSnafu { size })?;
        heap.call_alloc(size).context(BackingAllocSnafu { size })
    }

    /// Frees an object allocated by [`allocate`](Self::allocate).
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate(size)` on this object heap, with the same
    /// `size`, and must not be used afterwards.
    pub unsafe fn free(&self, size: usize, ptr: NonNull<u8>) -> Result<(), OheapError> {
        let heap = self
            .inner
            .lock()
            .heaps
            .select_heap(size)
            .context(NoSuitableHeapSnafu { size })?;
        unsafe { heap.call_free(ptr) }.context(BackingFreeSnafu)
    }

    /// Allocates an object of `resource_type`, subject to its limit.
    ///
    /// Cached objects are reused first. The first fresh allocation of a type
    /// without a configured resource size records `size` as that type's size.
    ///
    /// Once a resource size is known, `size` must select the same size class
    /// as the resource size, since that class is where the object is freed
    /// to. Otherwise the call fails with
    /// [`InvalidArgumentKind::ResourceSizeMismatch`], or with
    /// [`OheapError::NoSuitableHeap`] if no class fits `size`, before anything
    /// is reserved.
    pub fn allocate_typed(
        &self,
        resource_type: usize,
        size: usize,
    ) -> Result<NonNull<u8>, OheapError> {
        let reservation = {
            let mut inner = self.inner.lock();
            let (heaps, state) = inner.parts_mut(resource_type)?;
            if let Some(resource_size) = state.resource_size() {
                let class = heaps.select(size).context(NoSuitableHeapSnafu { size })?;
                ensure!(
                    heaps
                        .select(resource_size)
                        .is_some_and(|expected| ptr::eq(expected, class)),
                    InvalidArgumentSnafu {
                        kind: InvalidArgumentKind::ResourceSizeMismatch {
                            resource_type,
                            size,
                            resource_size,
                        },
                    }
                );
            }
            let reservation = state.reserve(resource_type);
            log::trace!(
                "reserve: resource_type={resource_type}, result={reservation:?}, live={}",
                state.stats().live
            );
            reservation?
        };

        match reservation {
            Reservation::Cached(object) => Ok(object),
            Reservation::Fresh => match self.allocate(size) {
                Ok(object) => {
                    let mut inner = self.inner.lock();
                    let state = inner.state_mut(resource_type)?;
                    if state.resource_size().is_none() {
                        state.set_resource_size(size);
                    }
                    Ok(object)
                }
                Err(err) => {
                    self.cancel_reservation(resource_type)?;
                    Err(err)
                }
            },
        }
    }

    /// Frees an object allocated by [`allocate_typed`](Self::allocate_typed).
    ///
    /// The object is cached if the type's freelist has room; otherwise it is
    /// returned to the size class matching the type's resource size. Objects
    /// of a type whose resource size is smaller than a pointer are never
    /// cached.
    ///
    /// # Safety
    ///
    /// `object` must come from `allocate_typed(resource_type, _)` on this
    /// object heap and must not be used afterwards. Its allocation size must
    /// select the same size class as the type's current resource size, which
    /// holds for every object `allocate_typed` handed out unless the resource
    /// size was changed with [`set_resource_size`](Self::set_resource_size)
    /// in between.
    pub unsafe fn free_typed(
        &self,
        resource_type: usize,
        object: NonNull<u8>,
    ) -> Result<(), OheapError> {
        let heap = {
            let mut inner = self.inner.lock();
            let (heaps, state) = inner.parts_mut(resource_type)?;

            let heap = if state.has_cache_room() {
                None
            } else {
                let size = state.resource_size().context(InvalidArgumentSnafu {
                    kind: InvalidArgumentKind::UnknownResourceSize { resource_type },
                })?;
                Some(
                    heaps
                        .select_heap(size)
                        .context(NoSuitableHeapSnafu { size })?,
                )
            };

            let release = unsafe { state.release(resource_type, object) };
            log::trace!(
                "release: resource_type={resource_type}, result={release:?}, live={}",
                state.stats().live
            );
            heap
        };

        match heap {
            Some(heap) => unsafe { heap.call_free(object) }.context(BackingFreeSnafu),
            None => Ok(()),
        }
    }

    /// Destroys the object heap, returning every cached object to its heap.
    ///
    /// All objects handed out by this heap must have been freed before.
    pub fn delete(mut self) -> Result<(), OheapError> {
        self.drain_freelists()
    }

    fn drain_freelists(&mut self) -> Result<(), OheapError> {
        let Inner { heaps, types, .. } = self.inner.get_mut();
        let mut result = Ok(());
        for (resource_type, state) in types.iter_mut().enumerate() {
            while let Some(object) = state.take_cached() {
                let freed = match state.resource_size() {
                    Some(size) => match heaps.select_heap(size) {
                        Some(heap) => unsafe { heap.call_free(object) }.context(BackingFreeSnafu),
                        None => NoSuitableHeapSnafu { size }.fail(),
                    },
                    None => InvalidArgumentSnafu {
                        kind: InvalidArgumentKind::UnknownResourceSize { resource_type },
                    }
                    .fail(),
                };
                if let Err(err) = freed {
                    log::warn!(
                        "object heap: cached object leaked: resource_type={resource_type}: {err}"
                    );
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
            }
        }
        result
    }
}

impl Drop for ObjectHeap {
    fn drop(&mut self) {
        // errors have already been logged per object
        let _ = self.drain_freelists();
    }
}
