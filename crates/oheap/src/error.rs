//! Error types reported by the object heap and its backing heaps.

use core::{fmt, panic};

use snafu::{GenerateImplicitData, Snafu};

use crate::RESOURCE_TYPE_COUNT;

/// Source location at which an error value was constructed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location(&'static panic::Location<'static>);

impl Default for Location {
    #[track_caller]
    fn default() -> Self {
        Self(panic::Location::caller())
    }
}

impl GenerateImplicitData for Location {
    #[track_caller]
    fn generate() -> Self {
        Self::default()
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// The kinds of malformed arguments rejected by an [`ObjectHeap`].
///
/// [`ObjectHeap`]: crate::ObjectHeap
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
#[non_exhaustive]
pub enum InvalidArgumentKind {
    #[display(
        "resource type out of range: resource_type={resource_type}, count={}",
        RESOURCE_TYPE_COUNT
    )]
    ResourceTypeOutOfRange { resource_type: usize },
    #[display(
        "heap descriptors not in ascending order: index={index}, item_size={item_size:#x}, \
         previous_item_size={previous:#x}"
    )]
    UnsortedDescriptors {
        index: usize,
        item_size: usize,
        previous: usize,
    },
    #[display("too many heap descriptors: count={count}, capacity={capacity}")]
    TooManyDescriptors { count: usize, capacity: usize },
    #[display(
        "too many resource limit entries: count={count}, capacity={}",
        RESOURCE_TYPE_COUNT
    )]
    TooManyLimits { count: usize },
    #[display("no resource size known: resource_type={resource_type}")]
    UnknownResourceSize { resource_type: usize },
    #[display(
        "size selects a different size class than the resource size: \
         resource_type={resource_type}, size={size:#x}, resource_size={resource_size:#x}"
    )]
    ResourceSizeMismatch {
        resource_type: usize,
        size: usize,
        resource_size: usize,
    },
}

/// The error type returned by [`ObjectHeap`] operations.
///
/// Each category of failure is a distinct variant so that callers can tell an
/// admission rejection apart from an exhausted backing heap.
///
/// [`ObjectHeap`]: crate::ObjectHeap
#[derive(Debug, Snafu, derive_more::IsVariant)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum OheapError {
    #[snafu(display("invalid argument: {kind}"))]
    InvalidArgument {
        kind: InvalidArgumentKind,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "resource limit exceeded: resource_type={resource_type}, limit={limit}"
    ))]
    ResourceLimitExceeded {
        resource_type: usize,
        limit: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("no suitable heap found: size={size:#x}"))]
    NoSuitableHeap {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("backing heap allocation failed: size={size:#x}"))]
    BackingAlloc {
        size: usize,
        #[snafu(implicit)]
        location: Location,
        #[snafu(source)]
        source: HeapError,
    },
    #[snafu(display("backing heap free failed"))]
    BackingFree {
        #[snafu(implicit)]
        location: Location,
        #[snafu(source)]
        source: HeapError,
    },
}

impl OheapError {
    /// Returns `true` if no memory could be obtained for the request, either
    /// because no size class fits or because the selected heap failed.
    #[must_use]
    pub fn is_allocation_failure(&self) -> bool {
        self.is_no_suitable_heap() || self.is_backing_alloc()
    }

    /// Returns the kind of invalid argument, if this is an invalid argument
    /// error.
    #[must_use]
    pub fn invalid_argument_kind(&self) -> Option<InvalidArgumentKind> {
        match self {
            Self::InvalidArgument { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Returns the location where this error was created.
    #[must_use]
    pub fn location(&self) -> Location {
        match self {
            Self::InvalidArgument { location, .. }
            | Self::ResourceLimitExceeded { location, .. }
            | Self::NoSuitableHeap { location, .. }
            | Self::BackingAlloc { location, .. }
            | Self::BackingFree { location, .. } => *location,
        }
    }
}

/// The error type returned by [`BackingHeap`] implementations.
///
/// [`BackingHeap`]: crate::BackingHeap
#[derive(Debug, Snafu, derive_more::IsVariant)]
#[snafu(visibility(pub))]
#[non_exhaustive]
pub enum HeapError {
    #[snafu(display("backing heap out of memory: size={size:#x}"))]
    OutOfMemory {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("request exceeds item size: size={size:#x}, item_size={item_size:#x}"))]
    Oversized {
        size: usize,
        item_size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("block size cannot be represented: block_size={block_size:#x}"))]
    InvalidBlockSize {
        block_size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("heap hook failed"))]
    Hook {
        #[snafu(implicit)]
        location: Location,
        #[snafu(source)]
        source: HookError,
    },
}

/// Failure status returned by a [`HeapHook`] when releasing memory.
///
/// [`HeapHook`]: crate::HeapHook
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display, derive_more::Error)]
#[display("heap hook returned error status: code={code:#x}")]
pub struct HookError {
    code: i32,
}

impl HookError {
    /// Wraps the status code reported by the hook.
    #[must_use]
    pub const fn new(code: i32) -> Self {
        Self { code }
    }

    /// Returns the status code reported by the hook.
    #[must_use]
    pub const fn code(&self) -> i32 {
        self.code
    }
}
