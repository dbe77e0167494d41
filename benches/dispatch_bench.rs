use criterion::{black_box, criterion_group, criterion_main, Criterion};
use hive_pool::drone::accumulator::summing;
use hive_pool::integral::{self, IntegralTask};
use hive_pool::CorePool;

fn task() -> IntegralTask {
    integral::plan(0.0, 100.0, 1e-8, 1)[0]
}

fn bench_single_core(c: &mut Criterion) {
    let pool = CorePool::new(1).unwrap();
    let task = task();
    c.bench_function("integral_single_core", |b| {
        b.iter(|| {
            let acc = summing(0.0);
            pool.distribute(black_box(&task), integral::midpoint_sin, &acc).unwrap();
            acc.into_inner()
        });
    });
}

fn bench_all_cores(c: &mut Criterion) {
    let pool = CorePool::new(num_cpus::get()).unwrap();
    let task = task();
    c.bench_function("integral_all_cores", |b| {
        b.iter(|| {
            let acc = summing(0.0);
            pool.distribute(black_box(&task), integral::midpoint_sin, &acc).unwrap();
            acc.into_inner()
        });
    });
}

criterion_group!(benches, bench_single_core, bench_all_cores);
criterion_main!(benches);
