use std::{
    alloc::Layout,
    error::Error,
    process,
    ptr::NonNull,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use argh::FromArgs;
use oheap::{
    HOOK_ALIGN, HeapDescriptor, HeapHook, HeapId, HookError, ObjectHeap, PhyMemPart,
    RESOURCE_TYPE_COUNT, ResourceLimit, UidHeap, backing::FixedBlockHeap,
};
use snafu::{ResultExt as _, Whatever, ensure_whatever};

/// Replay an allocate/free churn workload against an object heap and print
/// per-resource-type statistics.
#[derive(Debug, FromArgs)]
struct Args {
    /// comma separated size classes in ascending order
    #[argh(option, default = "String::from(\"32,64,128,256\")")]
    sizes: String,
    /// maximum live objects per resource type, negative for unlimited
    #[argh(option, default = "-1")]
    limit: i32,
    /// number of freed objects cached per resource type
    #[argh(option, default = "8")]
    cache: usize,
    /// objects allocated per resource type in every round
    #[argh(option, default = "16")]
    objects: usize,
    /// number of rounds
    #[argh(option, default = "100")]
    rounds: usize,
    /// log every allocator decision
    #[argh(switch, short = 'v')]
    verbose: bool,
}

#[derive(Default)]
struct SystemHook {
    calls: AtomicUsize,
    live_bytes: AtomicUsize,
}

impl HeapHook for SystemHook {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size, HOOK_ALIGN).ok()?;
        let ptr = NonNull::new(unsafe { std::alloc::alloc(layout) })?;
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.live_bytes.fetch_add(size, Ordering::Relaxed);
        Some(ptr)
    }

    unsafe fn free(&self, size: usize, ptr: NonNull<u8>) -> Result<(), HookError> {
        let layout = Layout::from_size_align(size, HOOK_ALIGN).map_err(|_e| HookError::new(-1))?;
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        self.live_bytes.fetch_sub(size, Ordering::Relaxed);
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    granted: usize,
    rejected: usize,
    failed: usize,
}

fn main() {
    let args: Args = argh::from_env();

    let level = if args.verbose {
        log::LevelFilter::Trace
    } else {
        log::LevelFilter::Warn
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    if let Err(err) = run(&args) {
        eprintln!("{}", report(&err));
        process::exit(1);
    }
}

fn report(err: &dyn Error) -> String {
    let mut out = format!("Error: {err}\n");
    let mut source = err.source();
    if source.is_some() {
        out.push_str("\nCaused by:\n");
    }
    let mut index = 0;
    while let Some(s) = source {
        out.push_str(&format!("{index:4}: {s}\n"));
        source = s.source();
        index += 1;
    }
    out
}

fn parse_sizes(sizes: &str) -> Result<Vec<usize>, Whatever> {
    let sizes = sizes
        .split(',')
        .map(str::trim)
        .map(|s| {
            s.parse::<usize>()
                .with_whatever_context(|_| format!("invalid size class: {s:?}"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    ensure_whatever!(!sizes.is_empty(), "no size classes given");
    Ok(sizes)
}

fn run(args: &Args) -> Result<(), Whatever> {
    let sizes = parse_sizes(&args.sizes)?;

    let system = Arc::new(SystemHook::default());
    let hook = Arc::clone(&system) as Arc<dyn HeapHook>;
    let descriptors = sizes
        .iter()
        .enumerate()
        .map(|(index, &size)| {
            let pool = FixedBlockHeap::new(Arc::clone(&hook), size)
                .with_whatever_context(|_| format!("invalid size class: {size}"))?;
            let id = HeapId(i32::try_from(index).unwrap_or(i32::MAX));
            Ok(HeapDescriptor::new(size, UidHeap::from_heap(pool), id))
        })
        .collect::<Result<Vec<_>, Whatever>>()?;
    let heap = ObjectHeap::new(PhyMemPart::new(0), descriptors, Arc::clone(&hook))
        .whatever_context("failed to create object heap")?;

    let limit = ResourceLimit::from_raw(args.limit, args.cache);
    heap.configure_limits_all(&[limit; RESOURCE_TYPE_COUNT])
        .whatever_context("failed to configure resource limits")?;

    let object_size = |ty: usize| sizes[ty % sizes.len()];
    let mut tallies = [Tally::default(); RESOURCE_TYPE_COUNT];
    let mut objects = Vec::with_capacity(args.objects);

    for _ in 0..args.rounds {
        for (ty, tally) in tallies.iter_mut().enumerate() {
            for _ in 0..args.objects {
                match heap.allocate_typed(ty, object_size(ty)) {
                    Ok(object) => {
                        tally.granted += 1;
                        objects.push(object);
                    }
                    Err(err) if err.is_resource_limit_exceeded() => tally.rejected += 1,
                    Err(err) if err.is_allocation_failure() => tally.failed += 1,
                    Err(err) => return Err(err).whatever_context("allocation failed"),
                }
            }
            for object in objects.drain(..) {
                unsafe { heap.free_typed(ty, object) }
                    .whatever_context("failed to free object")?;
            }
        }
    }

    println!(
        "{:>4} {:>6} {:>9} {:>9} {:>7} {:>10} {:>7}",
        "type", "size", "granted", "rejected", "failed", "high_water", "cached"
    );
    for (ty, tally) in tallies.iter().enumerate() {
        let stats = heap
            .resource_stats(ty)
            .whatever_context("failed to read resource statistics")?;
        println!(
            "{ty:>4} {:>6} {:>9} {:>9} {:>7} {:>10} {:>7}",
            object_size(ty),
            tally.granted,
            tally.rejected,
            tally.failed,
            stats.high_water,
            stats.cached
        );
    }
    println!("hook allocations: {}", system.calls.load(Ordering::Relaxed));

    heap.delete()
        .whatever_context("failed to delete object heap")?;
    drop(hook);
    log::debug!(
        "outstanding hook bytes after delete: {}",
        system.live_bytes.load(Ordering::Relaxed)
    );
    Ok(())
}
