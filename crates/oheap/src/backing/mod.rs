//! Backing heap implementations built on a [`HeapHook`].
//!
//! - [`HookHeap`] forwards every object to the hook, one hook call per object.
//! - [`FixedBlockHeap`] carves hook-provided arenas into blocks of one size and
//!   recycles them through an intrusive free list.
//!
//! [`HeapHook`]: crate::HeapHook

pub use self::{fixed_block::FixedBlockHeap, hook_heap::HookHeap};

mod fixed_block;
mod hook_heap;
