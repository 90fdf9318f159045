//! Per-resource-type admission control and freelist cache.
//!
//! Every resource type tracks how many of its objects are live, bounded by an
//! optional maximum, and keeps a bounded FIFO of freed objects for reuse.
//!
//! # Freelist Layout
//!
//! The freelist is intrusive: the first word of every cached object is
//! overwritten with the link to the next cached object, so caching an object
//! needs no additional memory.
//!
//! ```text
//!  head                                  tail
//!   │                                     │
//!   ▼                                     ▼
//! ┌──────┬─────┐   ┌──────┬─────┐   ┌──────┬─────┐
//! │ next │ ... │──▶│ next │ ... │──▶│ None │ ... │
//! └──────┴─────┘   └──────┴─────┘   └──────┴─────┘
//! ```
//!
//! Objects are handed out from the head and freed objects are appended at the
//! tail, so the oldest cached object is reused first.
//!
//! Objects of a resource type whose resource size is smaller than a pointer
//! cannot hold the link and are never cached.

use core::ptr::NonNull;

use snafu::ensure;

use crate::error::{OheapError, ResourceLimitExceededSnafu};

/// Limits applied to one resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimit {
    /// Maximum number of live objects, or `None` for no limit.
    pub max_limit: Option<usize>,
    /// Maximum number of freed objects kept for reuse.
    pub max_freelist_size: usize,
}

impl Default for ResourceLimit {
    fn default() -> Self {
        Self::UNLIMITED
    }
}

impl ResourceLimit {
    /// No live-object limit and no caching.
    pub const UNLIMITED: Self = Self {
        max_limit: None,
        max_freelist_size: 0,
    };

    /// At most `max_limit` live objects and `max_freelist_size` cached ones.
    #[must_use]
    pub const fn new(max_limit: usize, max_freelist_size: usize) -> Self {
        Self {
            max_limit: Some(max_limit),
            max_freelist_size,
        }
    }

    /// No live-object limit, caching up to `max_freelist_size` objects.
    #[must_use]
    pub const fn unlimited(max_freelist_size: usize) -> Self {
        Self {
            max_limit: None,
            max_freelist_size,
        }
    }

    /// Converts a signed limit, where any negative value means unlimited.
    #[must_use]
    pub fn from_raw(max_limit: i32, max_freelist_size: usize) -> Self {
        Self {
            max_limit: usize::try_from(max_limit).ok(),
            max_freelist_size,
        }
    }
}

/// Outcome of a successful reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::IsVariant)]
#[must_use]
pub enum Reservation {
    /// A cached object was taken from the freelist.
    Cached(NonNull<u8>),
    /// No cached object was available; the caller must allocate one and
    /// cancel the reservation if that fails.
    Fresh,
}

/// Outcome of releasing an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::IsVariant)]
#[must_use]
pub enum Release {
    /// The object was cached and now belongs to the object heap.
    Retained,
    /// The cache is full; the caller must free the object to its heap.
    Rejected,
}

/// Snapshot of the counters of one resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceStats {
    /// Objects currently reserved and not yet released.
    pub live: usize,
    /// Largest value `live` has reached.
    pub high_water: usize,
    /// Objects held in the freelist.
    pub cached: usize,
    /// The limit in effect.
    pub limit: ResourceLimit,
    /// Object size used to pick the size class of uncached frees.
    pub resource_size: Option<usize>,
}

#[repr(C)]
struct FreeObject {
    next: Option<NonNull<FreeObject>>,
}

struct Freelist {
    head: Option<NonNull<FreeObject>>,
    tail: Option<NonNull<FreeObject>>,
    len: usize,
}

// The freelist exclusively owns the objects linked into it.
unsafe impl Send for Freelist {}

impl Freelist {
    const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// Appends `object` at the tail.
    ///
    /// # Safety
    ///
    /// `object` must be valid for writes of a pointer, pointer-aligned, and
    /// not used by anyone else until it is popped again.
    unsafe fn push_back(&mut self, object: NonNull<u8>) {
        let node = object.cast::<FreeObject>();
        assert!(
            node.as_ptr().is_aligned(),
            "Cached object must be pointer aligned"
        );

        unsafe {
            node.write(FreeObject { next: None });
        }
        match self.tail {
            Some(tail) => unsafe { (*tail.as_ptr()).next = Some(node) },
            None => self.head = Some(node),
        }
        self.tail = Some(node);
        self.len += 1;
    }

    fn pop_front(&mut self) -> Option<NonNull<u8>> {
        let node = self.head?;
        self.head = unsafe { node.read().next };
        if self.head.is_none() {
            self.tail = None;
        }
        self.len -= 1;
        Some(node.cast())
    }
}

/// Limiter and cache state of one resource type.
pub(crate) struct ResourceTypeState {
    limit: ResourceLimit,
    live_count: usize,
    high_water: usize,
    resource_size: Option<usize>,
    freelist: Freelist,
}

impl ResourceTypeState {
    pub(crate) const fn new() -> Self {
        Self {
            limit: ResourceLimit::UNLIMITED,
            live_count: 0,
            high_water: 0,
            resource_size: None,
            freelist: Freelist::new(),
        }
    }

    pub(crate) fn reserve(&mut self, resource_type: usize) -> Result<Reservation, OheapError> {
        if let Some(limit) = self.limit.max_limit {
            ensure!(
                self.live_count < limit,
                ResourceLimitExceededSnafu {
                    resource_type,
                    limit,
                }
            );
        }

        self.live_count += 1;
        self.high_water = usize::max(self.high_water, self.live_count);

        Ok(match self.freelist.pop_front() {
            Some(object) => Reservation::Cached(object),
            None => Reservation::Fresh,
        })
    }

    /// Undoes a [`Reservation::Fresh`] whose allocation failed.
    pub(crate) fn cancel(&mut self, resource_type: usize) {
        self.decrement_live(resource_type);
    }

    /// Returns `true` if a released object would be retained.
    pub(crate) fn has_cache_room(&self) -> bool {
        let fits_link = self
            .resource_size
            .is_none_or(|size| size >= size_of::<FreeObject>());
        fits_link && self.freelist.len < self.limit.max_freelist_size
    }

    /// # Safety
    ///
    /// Same contract as [`Freelist::push_back`].
    pub(crate) unsafe fn release(&mut self, resource_type: usize, object: NonNull<u8>) -> Release {
        self.decrement_live(resource_type);
        if !self.has_cache_room() {
            return Release::Rejected;
        }
        unsafe {
            self.freelist.push_back(object);
        }
        Release::Retained
    }

    fn decrement_live(&mut self, resource_type: usize) {
        if self.live_count == 0 {
            log::warn!("released more objects than reserved: resource_type={resource_type}");
            return;
        }
        self.live_count -= 1;
    }

    pub(crate) fn set_limit(&mut self, limit: ResourceLimit) {
        self.limit = limit;
    }

    pub(crate) fn resource_size(&self) -> Option<usize> {
        self.resource_size
    }

    pub(crate) fn set_resource_size(&mut self, size: usize) {
        self.resource_size = Some(size);
    }

    /// Removes one cached object without touching the live count.
    pub(crate) fn take_cached(&mut self) -> Option<NonNull<u8>> {
        self.freelist.pop_front()
    }

    pub(crate) fn stats(&self) -> ResourceStats {
        ResourceStats {
            live: self.live_count,
            high_water: self.high_water,
            cached: self.freelist.len,
            limit: self.limit,
            resource_size: self.resource_size,
        }
    }
}
