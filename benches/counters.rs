//! Counters registry benchmarks.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;

use tallyboard::clock::CachedClock;
use tallyboard::layout::{METADATA_LENGTH, VALUE_LENGTH};
use tallyboard::manager::CountersManager;
use tallyboard::reader::CountersReader;

/// 8-byte-aligned heap regions for `capacity` counters.
struct Regions {
    metadata: Vec<u64>,
    values: Vec<u64>,
}

impl Regions {
    fn new(capacity: usize) -> Self {
        Self {
            metadata: vec![0u64; capacity * METADATA_LENGTH / 8],
            values: vec![0u64; capacity * VALUE_LENGTH / 8],
        }
    }

    fn manager<'a>(&'a mut self, clock: &'a CachedClock) -> CountersManager<'a> {
        unsafe {
            CountersManager::from_raw_parts(
                self.metadata.as_mut_ptr().cast(),
                self.metadata.len() * 8,
                self.values.as_mut_ptr().cast(),
                self.values.len() * 8,
                clock,
                Duration::ZERO,
            )
        }
        .expect("valid bench regions")
    }
}

fn bench_allocate_free_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocate_free_cycle");
    group.throughput(Throughput::Elements(1));

    let mut regions = Regions::new(1024);
    let clock = CachedClock::new();
    let mut mgr = regions.manager(&clock);

    group.bench_function("reuse_lowest_id", |b| {
        b.iter(|| {
            let id = mgr.allocate(7, b"stream-0", "bench counter").unwrap();
            mgr.free(id).unwrap();
        });
    });

    group.finish();
}

fn bench_counter_updates(c: &mut Criterion) {
    let mut group = c.benchmark_group("counter_updates");
    group.throughput(Throughput::Elements(1));

    let mut regions = Regions::new(16);
    let clock = CachedClock::new();
    let mut mgr = regions.manager(&clock);
    let id = mgr.allocate(0, b"", "hot").unwrap();
    let counter = mgr.counter(id);

    group.bench_function("increment_plain", |b| {
        b.iter(|| counter.increment_plain());
    });
    group.bench_function("increment_release", |b| {
        b.iter(|| counter.increment_release());
    });
    group.bench_function("get_and_add_release", |b| {
        b.iter(|| counter.get_and_add_release(17));
    });
    group.bench_function("propose_max_release", |b| {
        let mut proposed = 0i64;
        b.iter(|| {
            proposed += 1;
            counter.propose_max_release(proposed)
        });
    });

    group.finish();
}

fn bench_reader_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("reader_scan");

    for capacity in [64usize, 512, 4096] {
        let mut regions = Regions::new(capacity);
        let clock = CachedClock::new();
        {
            let mut mgr = regions.manager(&clock);
            // Half-full registry with holes, the realistic steady state.
            for i in 0..capacity as i32 {
                mgr.allocate(i, b"stream", "scan target").unwrap();
            }
            for i in (0..capacity as i32).step_by(2) {
                mgr.free(i).unwrap();
            }
        }

        let metadata: &[u8] = unsafe {
            std::slice::from_raw_parts(regions.metadata.as_ptr().cast(), regions.metadata.len() * 8)
        };
        let reader = CountersReader::new(metadata).unwrap();

        group.throughput(Throughput::Elements(capacity as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(capacity),
            &reader,
            |b, reader| {
                b.iter(|| {
                    let mut visited = 0u32;
                    reader.for_each_metadata(|_| visited += 1);
                    visited
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_allocate_free_cycle,
    bench_counter_updates,
    bench_reader_scan
);
criterion_main!(benches);
