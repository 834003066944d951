//! Clustering benchmark: k-rebalancing alone and a K-means fit.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use replay_testbed::clustering::rebalance::{balance, SupportCluster};
use replay_testbed::clustering::{ClusteringBackend, KMeansBackend};
use replay_testbed::features::FEATURE_COUNT;
use ndarray::Array2;

fn make_clusters(n: usize) -> Vec<SupportCluster> {
    (0..n)
        .map(|i| SupportCluster {
            label: i as i64,
            weight: ((i * 7919) % 1000 + 1) as u64,
        })
        .collect()
}

fn bench_balance(c: &mut Criterion) {
    let clusters = make_clusters(200);
    c.bench_function("balance_200_clusters_into_8", |b| {
        b.iter(|| black_box(balance(black_box(clusters.clone()), 8)))
    });
}

fn bench_kmeans(c: &mut Criterion) {
    // four loose blobs of 25 rows in the full feature width
    let data = Array2::from_shape_fn((100, FEATURE_COUNT), |(row, col)| {
        let blob = (row % 4) as f64 * 50.0;
        blob + ((row * 31 + col * 17) % 13) as f64 * 0.1
    });
    let backend = KMeansBackend::default();
    c.bench_function("kmeans_100_rows_k4", |b| {
        b.iter(|| black_box(backend.fit_predict(black_box(&data), 4).expect("kmeans")))
    });
}

criterion_group!(benches, bench_balance, bench_kmeans);
criterion_main!(benches);
