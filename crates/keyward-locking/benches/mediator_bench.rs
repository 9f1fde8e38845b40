// Benchmarks for LocalLockMediator
// Measures uncontended lock/unlock, reentry and contended lock attempts

use std::hint::black_box;

use bytes::Bytes;
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use keyward_common::SystemClock;
use keyward_locking::{Claimant, KeyColumn, LocalLockMediator};

const FAR_FUTURE_MS: i64 = i64::MAX;

fn target(i: usize) -> KeyColumn {
    KeyColumn::new(Bytes::from(format!("key-{}", i)), Bytes::from_static(b"col"))
}

fn mediator() -> LocalLockMediator {
    LocalLockMediator::new("bench", SystemClock::shared())
}

fn bench_lock_unlock(c: &mut Criterion) {
    let mediator = mediator();
    let owner = Claimant::new(Bytes::from_static(b"host"), 1);
    let kc = target(0);

    c.bench_function("mediator_lock_unlock", |b| {
        b.iter(|| {
            black_box(mediator.lock(&kc, &owner, FAR_FUTURE_MS));
            black_box(mediator.unlock(&kc, &owner));
        })
    });
}

fn bench_reentry(c: &mut Criterion) {
    let mediator = mediator();
    let owner = Claimant::new(Bytes::from_static(b"host"), 1);
    let kc = target(0);
    mediator.lock(&kc, &owner, FAR_FUTURE_MS);

    c.bench_function("mediator_reentry", |b| {
        b.iter(|| black_box(mediator.lock(&kc, &owner, FAR_FUTURE_MS)))
    });
}

fn bench_contended(c: &mut Criterion) {
    let mediator = mediator();
    let owner = Claimant::new(Bytes::from_static(b"host"), 1);
    let rival = Claimant::new(Bytes::from_static(b"host"), 2);
    let kc = target(0);
    mediator.lock(&kc, &owner, FAR_FUTURE_MS);

    c.bench_function("mediator_contended", |b| {
        b.iter(|| black_box(mediator.lock(&kc, &rival, FAR_FUTURE_MS)))
    });
}

fn bench_many_targets(c: &mut Criterion) {
    let mut group = c.benchmark_group("mediator_many_targets");

    for held in [10usize, 1_000, 10_000] {
        let mediator = mediator();
        let owner = Claimant::new(Bytes::from_static(b"host"), 1);
        for i in 0..held {
            mediator.lock(&target(i), &owner, FAR_FUTURE_MS);
        }
        let probe = target(held);

        group.bench_with_input(BenchmarkId::from_parameter(held), &held, |b, _| {
            b.iter(|| {
                black_box(mediator.lock(&probe, &owner, FAR_FUTURE_MS));
                black_box(mediator.unlock(&probe, &owner));
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_lock_unlock,
    bench_reentry,
    bench_contended,
    bench_many_targets
);
criterion_main!(benches);
