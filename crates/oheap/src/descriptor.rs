//! Size-class table and first-fit heap selection.

use arrayvec::ArrayVec;
use snafu::ensure;

use crate::{
    error::{InvalidArgumentKind, InvalidArgumentSnafu, OheapError},
    uid_heap::UidHeap,
};

/// Maximum number of size classes held by one object heap.
pub const MAX_HEAP_DESCRIPTORS: usize = 16;

/// Identifier of a backing heap, as registered by the heap's creator.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HeapId(pub i32);

/// One size class: the largest item it serves and the heap serving it.
///
/// A descriptor without a heap is a reserved slot that selection skips.
#[derive(Debug, Clone)]
pub struct HeapDescriptor {
    item_size: usize,
    heap: Option<UidHeap>,
    heap_id: HeapId,
}

impl HeapDescriptor {
    /// Creates a size class of `item_size` bytes served by `heap`.
    #[must_use]
    pub fn new(item_size: usize, heap: UidHeap, heap_id: HeapId) -> Self {
        Self {
            item_size,
            heap: Some(heap),
            heap_id,
        }
    }

    /// Creates a descriptor reserving `item_size` without binding a heap.
    #[must_use]
    pub fn reserved(item_size: usize) -> Self {
        Self {
            item_size,
            heap: None,
            heap_id: HeapId::default(),
        }
    }

    /// Returns the largest request this size class serves.
    #[must_use]
    pub fn item_size(&self) -> usize {
        self.item_size
    }

    /// Returns the bound heap, or `None` for a reserved slot.
    #[must_use]
    pub fn heap(&self) -> Option<&UidHeap> {
        self.heap.as_ref()
    }

    /// Returns the identifier registered with the heap.
    #[must_use]
    pub fn heap_id(&self) -> HeapId {
        self.heap_id
    }
}

/// Descriptors ordered by non-decreasing item size.
#[derive(Debug, Default)]
pub(crate) struct HeapTable {
    descriptors: ArrayVec<HeapDescriptor, MAX_HEAP_DESCRIPTORS>,
}

impl HeapTable {
    pub(crate) fn new<I>(descriptors: I) -> Result<Self, OheapError>
    where
        I: IntoIterator<Item = HeapDescriptor>,
    {
        let mut table = Self::default();
        let mut descriptors = descriptors.into_iter();
        while let Some(desc) = descriptors.next() {
            let index = table.descriptors.len();
            if let Some(last) = table.descriptors.last() {
                ensure!(
                    last.item_size <= desc.item_size,
                    InvalidArgumentSnafu {
                        kind: InvalidArgumentKind::UnsortedDescriptors {
                            index,
                            item_size: desc.item_size,
                            previous: last.item_size,
                        },
                    }
                );
            }
            if table.descriptors.try_push(desc).is_err() {
                return InvalidArgumentSnafu {
                    kind: InvalidArgumentKind::TooManyDescriptors {
                        count: index + 1 + descriptors.count(),
                        capacity: MAX_HEAP_DESCRIPTORS,
                    },
                }
                .fail();
            }
        }
        Ok(table)
    }

    /// Returns the first bound descriptor whose item size is at least `size`.
    pub(crate) fn select(&self, size: usize) -> Option<&HeapDescriptor> {
        self.descriptors
            .iter()
            .find(|desc| size <= desc.item_size && desc.heap.is_some())
    }

    pub(crate) fn select_heap(&self, size: usize) -> Option<UidHeap> {
        self.select(size).and_then(|desc| desc.heap.clone())
    }

    /// Binds `heap` to the size class `item_size`.
    ///
    /// The first descriptor with exactly that item size is rebound; otherwise
    /// a new descriptor is inserted at its sorted position.
    pub(crate) fn bind(
        &mut self,
        item_size: usize,
        heap: Option<UidHeap>,
        heap_id: HeapId,
    ) -> Result<(), OheapError> {
        let index = self
            .descriptors
            .iter()
            .position(|desc| item_size <= desc.item_size)
            .unwrap_or(self.descriptors.len());

        if let Some(desc) = self.descriptors.get_mut(index)
            && desc.item_size == item_size
        {
            desc.heap = heap;
            desc.heap_id = heap_id;
            return Ok(());
        }

        let desc = HeapDescriptor {
            item_size,
            heap,
            heap_id,
        };
        if self.descriptors.try_insert(index, desc).is_err() {
            return InvalidArgumentSnafu {
                kind: InvalidArgumentKind::TooManyDescriptors {
                    count: self.descriptors.len() + 1,
                    capacity: MAX_HEAP_DESCRIPTORS,
                },
            }
            .fail();
        }
        Ok(())
    }

    pub(crate) fn as_slice(&self) -> &[HeapDescriptor] {
        &self.descriptors
    }
}
