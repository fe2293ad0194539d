use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

use tagheap::LockedHeap;

const OPS: u64 = 100_000;

static HEAP: LockedHeap = LockedHeap::new();

/// tagheap alloc/free throughput.
fn tagheap_alloc_free(size: usize) {
  for _ in 0..OPS {
    let ptr = HEAP.with_lock(|h| h.alloc(size));
    black_box(&ptr);
    if let Some(p) = ptr {
      HEAP.with_lock(|h| unsafe { h.free(p.as_ptr()) });
    }
  }
}

/// libc alloc/free throughput.
fn libc_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = libc::malloc(size);
      black_box(ptr);
      libc::free(ptr);
    }
  }
}

fn benchmark_alloc_throughput(c: &mut Criterion) {
  let mut group = c.benchmark_group("alloc_throughput");

  for size in [16, 64, 256, 1024, 4096] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("tagheap", size), &size, |b, &size| {
      b.iter(|| tagheap_alloc_free(size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();
}

criterion_group!(benches, benchmark_alloc_throughput);
criterion_main!(benches);
