//! Benchmarks for band algebra and clipping

use bandstack_algorithms::algebra::{combine, evaluate_formula, normalized_difference, NumericPolicy};
use bandstack_algorithms::clip::clip;
use bandstack_core::{GeoTransform, LayerView, RasterGrid, RasterMetadata, RegionOfInterest};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::Array3;
use std::collections::BTreeMap;

fn create_scene(bands: usize, size: usize, base: f64) -> RasterGrid {
    let pixels = Array3::from_shape_fn((bands, size, size), |(b, row, col)| {
        base + ((b * 31 + row * 7 + col * 13) % 200) as f64
    });
    let meta = RasterMetadata::new(bands, size, size)
        .with_transform(GeoTransform::new(0.0, size as f64, 1.0, -1.0));
    RasterGrid::new(pixels, meta).unwrap()
}

fn bench_normalized_difference(c: &mut Criterion) {
    let mut group = c.benchmark_group("algebra/normalized_difference");
    for size in [256, 512, 1024, 2048] {
        let nir = create_scene(4, size, 300.0);
        let red = create_scene(4, size, 100.0);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                normalized_difference(black_box(&nir), black_box(&red), NumericPolicy::default())
                    .unwrap()
            })
        });
    }
    group.finish();
}

fn bench_combine_closure_vs_formula(c: &mut Criterion) {
    let mut group = c.benchmark_group("algebra/change");
    let size = 1024;
    let a = create_scene(1, size, 100.0);
    let b_scene = create_scene(1, size, 50.0);
    let constants = BTreeMap::new();

    group.bench_function("closure", |b| {
        b.iter(|| {
            combine(
                &[LayerView::from(&a), LayerView::from(&b_scene)],
                NumericPolicy::default(),
                |v, p| p.div(v[1] - v[0], v[0]) * 100.0,
            )
            .unwrap()
        })
    });
    group.bench_function("formula", |b| {
        b.iter(|| {
            evaluate_formula(
                "(b - a) / a * 100",
                &[("a", LayerView::from(&a)), ("b", LayerView::from(&b_scene))],
                &constants,
                NumericPolicy::default(),
            )
            .unwrap()
        })
    });
    group.finish();
}

fn bench_clip(c: &mut Criterion) {
    let mut group = c.benchmark_group("clip/triangle");
    for size in [256, 1024] {
        let scene = create_scene(4, size, 0.0);
        let s = size as f64;
        let region = RegionOfInterest::from_rings(vec![vec![vec![
            [0.1 * s, 0.1 * s],
            [0.9 * s, 0.2 * s],
            [0.5 * s, 0.9 * s],
            [0.1 * s, 0.1 * s],
        ]]])
        .unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| clip(black_box(&scene), black_box(&region)).unwrap())
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_normalized_difference,
    bench_combine_closure_vs_formula,
    bench_clip
);
criterion_main!(benches);
