//! Benchmarks for call deduplication and ignore rule lookups
//!
//! This benchmark suite measures:
//! - Attaching to a cached result vs running a fresh producer
//! - Fan-in of many concurrent callers onto one in-flight call
//! - Ignored-update lookups against a populated store

use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use tokio::runtime::Runtime;
use unipack::recycler::{CallKey, TaskRecycler};
use unipack::{IgnoreRule, IgnoredUpdatesDatabase, MemoryStore};

fn listing(size: usize) -> Vec<String> {
    (0..size).map(|i| format!("package{i}")).collect()
}

/// Attaching to a result that is still within its cache time
fn bench_cached_attach(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let recycler = Arc::new(TaskRecycler::<Vec<String>>::default());
    rt.block_on(async {
        let _ = recycler
            .run_or_attach(CallKey::new("bench", "installed"), Duration::from_secs(3600), || async {
                Ok(listing(500))
            })
            .await;
    });

    c.bench_function("recycler_cached_attach", |b| {
        b.to_async(&rt).iter(|| {
            let recycler = Arc::clone(&recycler);
            async move {
                let result = recycler
                    .run_or_attach(
                        CallKey::new("bench", "installed"),
                        Duration::from_secs(3600),
                        || async { Ok(Vec::new()) },
                    )
                    .await;
                black_box(result)
            }
        })
    });
}

/// A fresh producer on every call
fn bench_uncached_run(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let recycler = Arc::new(TaskRecycler::<Vec<String>>::default());

    c.bench_function("recycler_uncached_run", |b| {
        b.to_async(&rt).iter(|| {
            let recycler = Arc::clone(&recycler);
            async move {
                let key = CallKey::new("bench", "search").arg("git");
                let result = recycler
                    .run_or_attach(key, Duration::ZERO, || async { Ok(listing(50)) })
                    .await;
                black_box(result)
            }
        })
    });
}

/// Many callers attaching to one in-flight producer
fn bench_concurrent_fan_in(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("recycler_fan_in");

    for callers in [2usize, 8, 32] {
        group.bench_with_input(BenchmarkId::from_parameter(callers), &callers, |b, &callers| {
            b.to_async(&rt).iter(|| async move {
                let recycler = Arc::new(TaskRecycler::<Vec<String>>::default());
                let calls = (0..callers).map(|_| {
                    let recycler = Arc::clone(&recycler);
                    async move {
                        let key = CallKey::new("bench", "upgradable");
                        recycler
                            .run_or_attach(key, Duration::ZERO, || async {
                                tokio::task::yield_now().await;
                                Ok(listing(100))
                            })
                            .await
                    }
                });
                black_box(futures::future::join_all(calls).await)
            })
        });
    }
    group.finish();
}

fn bench_ignore_lookup(c: &mut Criterion) {
    let db = IgnoredUpdatesDatabase::load(Arc::new(MemoryStore::new()));
    for i in 0..1000 {
        db.add("winget", &format!("Vendor.App{i}"), IgnoreRule::Version(format!("{i}.0")));
    }

    c.bench_function("ignored_updates_lookup", |b| {
        b.iter(|| black_box(db.is_ignored("WinGet", black_box("Vendor.App500"), "500.0")))
    });
}

criterion_group!(
    benches,
    bench_cached_attach,
    bench_uncached_run,
    bench_concurrent_fan_in,
    bench_ignore_lookup
);
criterion_main!(benches);
