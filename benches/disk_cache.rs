//! Disk cache and URL canonicalization benchmarks.
//!
//! Measures the hot paths of the request gateway:
//! - Cache writes and reads at different body sizes
//! - Cache key derivation and URL canonicalization
//!
//! Run with: cargo bench --bench disk_cache
//! Results saved to: target/criterion/

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use engine_webdriver::cache::{CacheConfig, CacheEntry, DiskCache, cache_key};
use engine_webdriver::readiness::canonicalize;

// ============================================================================
// Benchmark Parameters
// ============================================================================

const BODY_SIZES: &[usize] = &[1024, 64 * 1024, 512 * 1024];

const URLS: &[&str] = &[
    "https://example.com/",
    "HTTPS://Example.COM:443/a/b/../c?q=1#frag",
    "http://cdn.example.net/static/js/app.min.js?v=20240101&cache=false",
];

fn entry(key: &str, size: usize) -> CacheEntry {
    CacheEntry::new(
        key,
        200,
        vec![
            ("Content-Type".into(), "application/octet-stream".into()),
            ("Cache-Control".into(), "max-age=3600".into()),
        ],
        vec![0xAB; size],
    )
}

// ============================================================================
// Benchmark: Cache Put/Get
// ============================================================================

fn bench_cache_put(c: &mut Criterion) {
    let cache = DiskCache::temporary(CacheConfig::default()).expect("cache");

    let mut group = c.benchmark_group("cache_put");
    for &size in BODY_SIZES {
        let key = cache_key("GET", &format!("https://example.com/put/{size}"));
        let entry = entry(&key, size);

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &entry, |b, entry| {
            b.iter(|| cache.put(black_box(&key), black_box(entry)).expect("put"));
        });
    }
    group.finish();
}

fn bench_cache_get(c: &mut Criterion) {
    let cache = DiskCache::temporary(CacheConfig::default()).expect("cache");

    let mut group = c.benchmark_group("cache_get");
    for &size in BODY_SIZES {
        let key = cache_key("GET", &format!("https://example.com/get/{size}"));
        cache.put(&key, &entry(&key, size)).expect("seed");

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &key, |b, key| {
            b.iter(|| cache.get(black_box(key)).expect("get"));
        });
    }
    group.finish();
}

// ============================================================================
// Benchmark: Keys
// ============================================================================

fn bench_keys(c: &mut Criterion) {
    let mut group = c.benchmark_group("keys");
    for (i, url) in URLS.iter().enumerate() {
        group.bench_with_input(BenchmarkId::new("canonicalize", i), url, |b, url| {
            b.iter(|| canonicalize(black_box(url)));
        });
        group.bench_with_input(BenchmarkId::new("cache_key", i), url, |b, url| {
            b.iter(|| cache_key(black_box("GET"), black_box(url)));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_cache_put, bench_cache_get, bench_keys);
criterion_main!(benches);
