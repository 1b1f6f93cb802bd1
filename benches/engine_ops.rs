use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde_json::json;
use std::fs;
use std::path::PathBuf;

use yardb::{Document, Engine};

const SEED: u64 = 42;

/// Database sizes to pre-populate before measuring
const DB_SIZES: &[usize] = &[100, 1_000, 10_000];

fn bench_data_dir() -> PathBuf {
    PathBuf::from("target/bench-data-engine")
}

fn cleanup() {
    let _ = fs::remove_dir_all(bench_data_dir());
}

fn fresh_engine(name: &str) -> Engine {
    let dir = bench_data_dir();
    let _ = fs::create_dir_all(&dir);
    let path = dir.join(name);
    let _ = fs::remove_file(&path);
    let mut lock = path.as_os_str().to_os_string();
    lock.push(".pid");
    let _ = fs::remove_file(PathBuf::from(lock));
    Engine::open(&path).expect("failed to open engine")
}

fn make_document(rng: &mut StdRng) -> Document {
    json!({
        "name": format!("user_{:08x}", rng.gen::<u32>()),
        "age": rng.gen_range(18..80),
        "active": rng.gen_bool(0.5),
    })
    .as_object()
    .unwrap()
    .clone()
}

fn pre_populate(engine: &mut Engine, count: usize, rng: &mut StdRng) {
    for _ in 0..count {
        let mut doc = make_document(rng);
        engine.create(&mut doc).expect("failed to create");
    }
}

fn create_throughput(c: &mut Criterion) {
    cleanup();
    let mut group = c.benchmark_group("create");

    for &size in DB_SIZES {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let mut rng = StdRng::seed_from_u64(SEED);
            let mut engine = fresh_engine(&format!("create-{size}.db"));
            engine.collection("bench");
            pre_populate(&mut engine, size, &mut rng);
            b.iter(|| {
                let mut doc = make_document(&mut rng);
                engine.create(black_box(&mut doc)).expect("failed to create");
            });
        });
    }

    group.finish();
    cleanup();
}

fn read_by_id(c: &mut Criterion) {
    cleanup();
    let mut group = c.benchmark_group("read_by_id");

    for &size in DB_SIZES {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let mut rng = StdRng::seed_from_u64(SEED);
            let mut engine = fresh_engine(&format!("read-{size}.db"));
            engine.collection("bench");
            pre_populate(&mut engine, size, &mut rng);
            b.iter(|| {
                let id = rng.gen_range(1..=size as i64);
                let mut selector = Document::new();
                selector.insert("_id".to_string(), serde_json::Value::from(id));
                let docs = engine.read(black_box(&selector)).expect("failed to read");
                black_box(docs);
            });
        });
    }

    group.finish();
    cleanup();
}

criterion_group!(benches, create_throughput, read_by_id);
criterion_main!(benches);
