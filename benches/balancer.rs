//! Load balancer benchmarks
//!
//! Selection cost for each policy, single-threaded and under contention.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use mesh_agent::{LoadBalancer, RoundRobin, WeightedRoundRobin};
use std::hint::black_box;
use std::sync::Arc;
use tokio::runtime::Runtime;

/// Benchmark a single selection
fn bench_next_index(c: &mut Criterion) {
    let mut group = c.benchmark_group("balancer_next_index");

    for size in [2, 8, 64] {
        let round_robin = RoundRobin::new(size).unwrap();
        group.bench_with_input(
            BenchmarkId::new("round_robin", size),
            &round_robin,
            |b, balancer| {
                b.iter(|| black_box(balancer.next_index()));
            },
        );

        let weights: Vec<u32> = (1..=size as u32).collect();
        let weighted = WeightedRoundRobin::new(&weights).unwrap();
        group.bench_with_input(
            BenchmarkId::new("weighted_round_robin", size),
            &weighted,
            |b, balancer| {
                b.iter(|| black_box(balancer.next_index()));
            },
        );
    }
    group.finish();
}

/// Benchmark many tasks sharing one counter
fn bench_concurrent_selection(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("balancer_concurrent");
    group.sample_size(50);

    for concurrency in [10, 50, 100] {
        let balancer: Arc<dyn LoadBalancer> = Arc::new(RoundRobin::new(8).unwrap());

        group.bench_with_input(
            BenchmarkId::new("tasks", concurrency),
            &(balancer, concurrency),
            |b, (balancer, concurrency)| {
                b.to_async(&rt).iter(|| async {
                    let handles: Vec<_> = (0..*concurrency)
                        .map(|_| {
                            let balancer = balancer.clone();
                            tokio::spawn(async move {
                                for _ in 0..100 {
                                    black_box(balancer.next_index());
                                }
                            })
                        })
                        .collect();
                    futures::future::join_all(handles).await
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_next_index, bench_concurrent_selection);
criterion_main!(benches);
