use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use gazer_vecstore::{FlatIndex, VecIndex};

fn pseudo_vec(dim: usize, seed: u64) -> Vec<f32> {
    let mut state = seed;
    (0..dim)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            ((state >> 33) as f32) / (u32::MAX as f32) - 0.5
        })
        .collect()
}

fn bench_search(c: &mut Criterion) {
    let dim = 512;
    let mut group = c.benchmark_group("flat_search");
    for n in [100usize, 1_000] {
        let idx = FlatIndex::with_dimension(dim);
        for i in 0..n {
            idx.insert(&format!("reid_{}", i + 1), &pseudo_vec(dim, i as u64 + 1))
                .unwrap();
        }
        let query = pseudo_vec(dim, 424242);
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| idx.search(black_box(&query), 1).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_search);
criterion_main!(benches);
