use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::Rng;

use spatial_tree::key::SpatialKey;
use spatial_tree::morton::MortonKey;
use spatial_tree::types::Domain;

fn encode_decode_benchmark(c: &mut Criterion) {
    let domain = Domain::unit();
    let mut rng = rand::thread_rng();
    let points: Vec<[f64; 3]> = (0..10_000)
        .map(|_| [rng.gen::<f64>(), rng.gen::<f64>(), rng.gen::<f64>()])
        .collect();

    c.bench_function("morton_from_point_deepest_level", |b| {
        b.iter(|| {
            for p in &points {
                black_box(MortonKey::from_point(p, 21, &domain).unwrap());
            }
        })
    });

    let keys: Vec<MortonKey> =
        points.iter().map(|p| MortonKey::from_point(p, 21, &domain).unwrap()).collect();

    c.bench_function("morton_to_coordinates", |b| {
        b.iter(|| {
            for k in &keys {
                black_box(k.to_coordinates(&domain));
            }
        })
    });

    c.bench_function("morton_ancestors", |b| {
        b.iter(|| {
            for k in &keys {
                black_box(k.ancestors());
            }
        })
    });
}

criterion_group!(benches, encode_decode_benchmark);
criterion_main!(benches);
