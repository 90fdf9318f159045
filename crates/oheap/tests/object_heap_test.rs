#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))]
#![cfg(test)]

use std::{
    alloc::Layout,
    collections::VecDeque,
    ptr::NonNull,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use oheap::{
    BackingHeap, HOOK_ALIGN, HeapDescriptor, HeapError, HeapHook, HeapId, HookError, ObjectHeap,
    PhyMemPart, RESOURCE_TYPE_COUNT, ResourceLimit, UidHeap,
    backing::{FixedBlockHeap, HookHeap},
};
use proptest::prelude::*;

#[derive(Default)]
struct SystemHook {
    live: AtomicUsize,
}

impl HeapHook for SystemHook {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size, HOOK_ALIGN).ok()?;
        let ptr = NonNull::new(unsafe { std::alloc::alloc(layout) })?;
        self.live.fetch_add(size, Ordering::SeqCst);
        Some(ptr)
    }

    unsafe fn free(&self, size: usize, ptr: NonNull<u8>) -> Result<(), HookError> {
        let layout = Layout::from_size_align(size, HOOK_ALIGN).map_err(|_e| HookError::new(-1))?;
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        self.live.fetch_sub(size, Ordering::SeqCst);
        Ok(())
    }
}

struct Counted {
    inner: HookHeap,
    allocs: AtomicUsize,
}

impl BackingHeap for Counted {
    fn allocate_with_size(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.allocs.fetch_add(1, Ordering::SeqCst);
        self.inner.allocate_with_size(size)
    }

    unsafe fn free(&self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        unsafe { self.inner.free(ptr) }
    }
}

#[test]
fn select_first_fit_over_ladder() {
    let hook: Arc<dyn HeapHook> = Arc::new(SystemHook::default());
    let heaps = [32, 64, 128].map(|size| UidHeap::from_heap(HookHeap::new(Arc::clone(&hook), size)));
    let heap = ObjectHeap::new(
        PhyMemPart::new(0),
        [32, 64, 128]
            .into_iter()
            .zip(heaps.clone())
            .map(|(size, h)| HeapDescriptor::new(size, h, HeapId(size as i32))),
        hook,
    )
    .unwrap();

    assert!(heap.heap_for_size(48).unwrap().same_heap(&heaps[1]));
    assert!(heap.heap_for_size(128).unwrap().same_heap(&heaps[2]));
    assert!(heap.heap_for_size(200).is_none());
    assert!(heap.allocate(200).unwrap_err().is_no_suitable_heap());
}

#[test]
fn end_to_end_cache_hit_skips_backing_heap() {
    let system = Arc::new(SystemHook::default());
    let hook = Arc::clone(&system) as Arc<dyn HeapHook>;
    let h1 = Arc::new(Counted {
        inner: HookHeap::new(Arc::clone(&hook), 64),
        allocs: AtomicUsize::new(0),
    });
    let heap = ObjectHeap::new(
        PhyMemPart::new(0x8000),
        [HeapDescriptor::new(
            64,
            UidHeap::new(Arc::clone(&h1) as Arc<dyn BackingHeap>),
            HeapId(1),
        )],
        hook,
    )
    .unwrap();
    heap.configure_limit(0, ResourceLimit::new(1, 1)).unwrap();

    let p = heap.allocate_typed(0, 64).unwrap();
    assert_eq!(h1.allocs.load(Ordering::SeqCst), 1);

    assert!(
        heap.allocate_typed(0, 64)
            .unwrap_err()
            .is_resource_limit_exceeded()
    );

    unsafe { heap.free_typed(0, p).unwrap() };
    assert_eq!(heap.allocate_typed(0, 64).unwrap(), p);
    assert_eq!(h1.allocs.load(Ordering::SeqCst), 1);

    unsafe { heap.free_typed(0, p).unwrap() };
    heap.delete().unwrap();
    assert_eq!(system.live.load(Ordering::SeqCst), 0);
}

#[test]
fn fixed_block_exhaustion_is_allocation_failure() {
    let hook: Arc<dyn HeapHook> = Arc::new(SystemHook::default());
    let pool = FixedBlockHeap::new(Arc::clone(&hook), 2048)
        .unwrap()
        .with_max_arenas(1);
    let heap = ObjectHeap::new(
        PhyMemPart::new(0),
        [HeapDescriptor::new(2048, UidHeap::from_heap(pool), HeapId(0))],
        hook,
    )
    .unwrap();

    let a = heap.allocate_typed(5, 2048).unwrap();
    let b = heap.allocate_typed(5, 2048).unwrap();
    let err = heap.allocate_typed(5, 2048).unwrap_err();
    assert!(err.is_backing_alloc());
    assert!(err.is_allocation_failure());
    assert_eq!(heap.resource_stats(5).unwrap().live, 2);

    unsafe {
        heap.free_typed(5, a).unwrap();
        heap.free_typed(5, b).unwrap();
    }
    heap.delete().unwrap();
}

#[derive(Debug, Clone)]
enum Op {
    Alloc(usize),
    Free(usize, usize),
    Configure(usize, Option<usize>, usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let ty = 0..RESOURCE_TYPE_COUNT;
    prop_oneof![
        4 => ty.clone().prop_map(Op::Alloc),
        4 => (ty.clone(), any::<usize>()).prop_map(|(ty, i)| Op::Free(ty, i)),
        1 => (ty, proptest::option::of(0_usize..6), 0_usize..4)
            .prop_map(|(ty, max, cache)| Op::Configure(ty, max, cache)),
    ]
}

#[derive(Default)]
struct Model {
    limit: ResourceLimit,
    live: Vec<NonNull<u8>>,
    cache: VecDeque<NonNull<u8>>,
    high_water: usize,
}

proptest! {
    #[test]
    fn limiter_matches_model(ops in proptest::collection::vec(op_strategy(), 1..200)) {
        let hook: Arc<dyn HeapHook> = Arc::new(SystemHook::default());
        let pool = FixedBlockHeap::new(Arc::clone(&hook), 32).unwrap();
        let heap = ObjectHeap::new(
            PhyMemPart::new(0),
            [HeapDescriptor::new(32, UidHeap::from_heap(pool), HeapId(0))],
            hook,
        )
        .unwrap();
        let mut models = (0..RESOURCE_TYPE_COUNT).map(|_| Model::default()).collect::<Vec<_>>();

        for op in ops {
            match op {
                Op::Alloc(ty) => {
                    let model = &mut models[ty];
                    let result = heap.allocate_typed(ty, 32);
                    if model.limit.max_limit.is_some_and(|max| model.live.len() >= max) {
                        prop_assert!(result.unwrap_err().is_resource_limit_exceeded());
                        continue;
                    }
                    let object = result.unwrap();
                    if let Some(cached) = model.cache.pop_front() {
                        prop_assert_eq!(object, cached);
                    }
                    model.live.push(object);
                    model.high_water = model.high_water.max(model.live.len());
                }
                Op::Free(ty, index) => {
                    let model = &mut models[ty];
                    if model.live.is_empty() {
                        continue;
                    }
                    let object = model.live.swap_remove(index % model.live.len());
                    unsafe { heap.free_typed(ty, object).unwrap() };
                    if model.cache.len() < model.limit.max_freelist_size {
                        model.cache.push_back(object);
                    }
                }
                Op::Configure(ty, max, cache) => {
                    let limit = ResourceLimit { max_limit: max, max_freelist_size: cache };
                    heap.configure_limit(ty, limit).unwrap();
                    models[ty].limit = limit;
                }
            }

            for (ty, model) in models.iter().enumerate() {
                let stats = heap.resource_stats(ty).unwrap();
                prop_assert_eq!(stats.live, model.live.len());
                prop_assert_eq!(stats.cached, model.cache.len());
                prop_assert_eq!(stats.high_water, model.high_water);
                prop_assert!(stats.high_water >= stats.live);
            }
        }

        for (ty, model) in models.iter_mut().enumerate() {
            for object in model.live.drain(..) {
                unsafe { heap.free_typed(ty, object).unwrap() };
            }
        }
        heap.delete().unwrap();
    }
}
