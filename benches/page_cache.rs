//! Page Cache Benchmarks
//!
//! Acquire/release churn against the simulated engine: cache hits on a
//! resident working set, and misses that force LRU eviction.
//!
//! Run with: `cargo bench --bench page_cache`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use std::time::Duration;

use pdfium_worker::cache::{CacheConfig, PageCache, ScopeExit};
use pdfium_worker::pdfium::{PdfiumModule, SimDocument, SimulatedPdfium};

fn open_cache(pages: usize, max_pages_per_document: usize) -> PageCache {
    let sim = Arc::new(SimulatedPdfium::new());
    let bytes = SimDocument::with_pages(pages).to_bytes();
    let file = sim.malloc(bytes.len());
    sim.heap_write(file, &bytes);
    let doc = sim.load_mem_document(file, bytes.len(), None);

    PageCache::new(
        sim,
        doc,
        CacheConfig {
            page_ttl_ms: 60_000,
            max_pages_per_document,
        },
    )
}

fn bench_resident_hits(c: &mut Criterion) {
    let mut group = c.benchmark_group("page_cache_hits");
    group.measurement_time(Duration::from_secs(5));

    let cache = open_cache(16, 32);
    group.bench_function("acquire_release", |b| {
        let mut index = 0;
        b.iter(|| {
            let page = cache.acquire(black_box(index % 16)).unwrap();
            page.release();
            index += 1;
        })
    });

    group.bench_function("with_page_text", |b| {
        b.iter(|| {
            cache
                .with_page(black_box(3), ScopeExit::Release, |page| page.text_page().is_ok())
                .unwrap()
        })
    });

    group.finish();
}

fn bench_eviction_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("page_cache_eviction");
    group.measurement_time(Duration::from_secs(5));

    for bound in [4usize, 16, 64] {
        let cache = open_cache(256, bound);
        group.bench_with_input(BenchmarkId::new("sequential_scan", bound), &bound, |b, _| {
            let mut index = 0;
            b.iter(|| {
                let page = cache.acquire(black_box(index % 256)).unwrap();
                page.release();
                index += 1;
            })
        });
    }

    let cache = open_cache(256, 16);
    group.bench_function("borrow_page_scan", |b| {
        let mut index = 0;
        b.iter(|| {
            cache
                .borrow_page(black_box(index % 256), |page| page.page_index())
                .unwrap();
            index += 1;
        })
    });

    group.finish();
}

criterion_group!(benches, bench_resident_hits, bench_eviction_churn);
criterion_main!(benches);
