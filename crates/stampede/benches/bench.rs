use core::hint::black_box;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use stampede::{
    ApiExecutor, ApiResponse, BurstPool, CollaboratorError, Identifier, JavaLongHashMod,
    OperationKind, PlainModulo, PoolConfig, ShardRouter, ShardStrategy, TemplateHandle, WorkUnit,
    executor_fn, plan_units,
    testing::{FakePlatform, PlatformConfig},
};
use std::{sync::Arc, time::Instant};
use tokio::runtime::Builder;
use tokio_util::sync::CancellationToken;

const SHARD_COUNT: u32 = 32;
const ROUTED_IDS: usize = 1024;

/// Routing throughput: identifiers produced per iteration for one target.
fn bench_routing<S>(c: &mut Criterion, group_name: &str, strategy_factory: impl Fn() -> S)
where
    S: ShardStrategy,
{
    let mut group = c.benchmark_group(group_name);
    group.throughput(Throughput::Elements(ROUTED_IDS as u64));

    group.bench_function(format!("elems/{ROUTED_IDS}"), |b| {
        b.iter_custom(|iters| {
            let router = ShardRouter::with_strategy(strategy_factory()).with_seed(0);
            let start = Instant::now();
            for _ in 0..iters {
                for _ in 0..ROUTED_IDS {
                    black_box(router.route_to_shard(SHARD_COUNT, 0).unwrap());
                }
            }
            start.elapsed()
        });
    });

    group.finish();
}

/// Pool overhead with a no-op executor, across worker counts.
fn bench_pool_noop(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool/noop");
    group.sample_size(20);

    let units = 10_000;
    for concurrency in [1, 8, 64, 512] {
        group.throughput(Throughput::Elements(units as u64));
        group.bench_function(format!("units/{units}/workers/{concurrency}"), |b| {
            let rt = Builder::new_multi_thread().enable_all().build().unwrap();
            b.to_async(&rt).iter_custom(move |iters| async move {
                let executor = Arc::new(executor_fn(|_unit: WorkUnit| async {
                    Ok::<_, CollaboratorError>(ApiResponse::ok(None))
                }));
                let pool = BurstPool::new(PoolConfig::new(concurrency), CancellationToken::new());
                let template = TemplateHandle::new("bench");
                let start = Instant::now();
                for _ in 0..iters {
                    let plan = plan_units(
                        (0..units as u64).map(Identifier::from_u64),
                        &template,
                        OperationKind::RedeemAsync,
                    );
                    black_box(pool.run(plan, Arc::clone(&executor)).await.unwrap());
                }
                start.elapsed()
            });
        });
    }

    group.finish();
}

/// Full burst against the in-memory platform: stock 1000, 50000 users.
fn bench_pool_platform(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool/platform");
    group.sample_size(10);

    let users = 50_000;
    group.throughput(Throughput::Elements(users as u64));
    group.bench_function(format!("users/{users}/stock/1000"), |b| {
        let rt = Builder::new_multi_thread().enable_all().build().unwrap();
        b.to_async(&rt).iter_custom(move |iters| async move {
            let mut elapsed = core::time::Duration::ZERO;
            for _ in 0..iters {
                let platform = Arc::new(FakePlatform::new(PlatformConfig::default()));
                let template = platform.seed_template("bench", 1_000);
                let plan = plan_units(
                    Identifier::random_unique(users),
                    &template,
                    OperationKind::RedeemAsync,
                );
                let pool = BurstPool::new(PoolConfig::new(500), CancellationToken::new());
                let executor = Arc::new(ApiExecutor::new(platform, "bench"));
                let start = Instant::now();
                black_box(pool.run(plan, executor).await.unwrap());
                elapsed += start.elapsed();
            }
            elapsed
        });
    });

    group.finish();
}

fn benches_routing(c: &mut Criterion) {
    bench_routing(c, "route/java_long_hash", || JavaLongHashMod);
    bench_routing(c, "route/plain_modulo", || PlainModulo);
}

criterion_group!(
    benches,
    benches_routing,
    bench_pool_noop,
    bench_pool_platform
);
criterion_main!(benches);
