use criterion::{criterion_group, criterion_main, Criterion};
use rand::Rng;

use spatial_tree::engine::bulk::BulkLoader;
use spatial_tree::morton::MortonKey;
use spatial_tree::types::{Domain, Point};
use spatial_tree::IndexEngine;

fn random_points(n: usize) -> Vec<Point> {
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|i| Point {
            coord: [rng.gen::<f64>(), rng.gen::<f64>(), rng.gen::<f64>()],
            global_idx: i,
        })
        .collect()
}

fn bulk_loader_benchmark(c: &mut Criterion) {
    let domain = Domain::unit();
    let points = random_points(20_000);

    c.bench_function("bulk_loader_keys_for_points_20k", |b| {
        let loader: BulkLoader<MortonKey> = BulkLoader::new(domain, 16);
        b.iter(|| loader.keys_for_points(&points))
    });

    c.bench_function("bulk_loader_build_20k", |b| {
        let loader: BulkLoader<MortonKey> = BulkLoader::new(domain, 16);
        b.iter(|| loader.build(&points))
    });

    c.bench_function("engine_bulk_load_20k", |b| {
        b.iter(|| {
            let engine: IndexEngine<MortonKey> = IndexEngine::new(domain);
            engine.bulk_load(&points);
        })
    });
}

criterion_group!(benches, bulk_loader_benchmark);
criterion_main!(benches);
