// Task performance benchmarks for docsaga

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use docsaga::{Engine, ExecutionMode, Options};
use serde_json::json;
use std::hint::black_box;
use tempfile::TempDir;

fn benchmark_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit");

    for steps in [1, 10, 100].iter() {
        group.throughput(Throughput::Elements(*steps as u64));
        group.bench_with_input(BenchmarkId::from_parameter(steps), steps, |b, &steps| {
            let engine = Engine::in_memory(Options::default()).unwrap();
            b.iter(|| {
                let mut task = engine.task();
                for i in 0..steps {
                    task.save("items", json!({"i": i, "payload": "x".repeat(64)})).unwrap();
                }
                black_box(task.run(ExecutionMode::Direct).unwrap());
            });
        });
    }

    group.finish();
}

fn benchmark_rollback(c: &mut Criterion) {
    let mut group = c.benchmark_group("rollback");

    for steps in [1, 10, 100].iter() {
        group.throughput(Throughput::Elements(*steps as u64));
        group.bench_with_input(BenchmarkId::from_parameter(steps), steps, |b, &steps| {
            let engine = Engine::in_memory(Options::default()).unwrap();
            engine.store().insert_one("items", json!({"_id": "dup"}).as_object().cloned().unwrap()).unwrap();
            b.iter(|| {
                let mut task = engine.task();
                for i in 0..steps {
                    task.save("items", json!({"i": i})).unwrap();
                }
                task.save("items", json!({"_id": "dup"})).unwrap();
                black_box(task.run(ExecutionMode::Direct).unwrap_err());
            });
        });
    }

    group.finish();
}

fn benchmark_durable_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("durable_commit");
    group.sample_size(20);

    for sync in [false, true] {
        group.bench_with_input(BenchmarkId::new("sync", sync), &sync, |b, &sync| {
            let temp_dir = TempDir::new().unwrap();
            let engine = Engine::open(temp_dir.path(), Options::default().sync_journal(sync)).unwrap();
            b.iter(|| {
                let mut task = engine.task();
                task.save("accounts", json!({"balance": 10})).unwrap();
                task.update("counters", json!({"_id": "n"}), json!({"$inc": {"n": 1}})).unwrap();
                black_box(task.run(ExecutionMode::Direct).unwrap());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_commit, benchmark_rollback, benchmark_durable_commit);
criterion_main!(benches);
