use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tsforge::encoding::{decode_column, DoubleDeltaEncoder};

fn regular_timestamps(n: usize) -> Vec<i64> {
    (0..n as i64).map(|i| 1_672_531_200_000 + i * 15_000).collect()
}

fn noisy_values(n: usize) -> Vec<f64> {
    (0..n).map(|i| (i as f64 * 0.7).sin() * 100.0).collect()
}

fn bench_encode(c: &mut Criterion) {
    let timestamps = regular_timestamps(100_000);
    let values = noisy_values(100_000);

    c.bench_function("encode_timestamps_100k", |b| {
        b.iter(|| {
            let mut enc = DoubleDeltaEncoder::<i64>::new();
            for t in &timestamps {
                enc.add(black_box(*t)).unwrap();
            }
            black_box(enc.finish())
        })
    });

    c.bench_function("encode_values_100k", |b| {
        b.iter(|| {
            let mut enc = DoubleDeltaEncoder::<f64>::new();
            for v in &values {
                enc.add(black_box(*v)).unwrap();
            }
            black_box(enc.finish())
        })
    });
}

fn bench_decode(c: &mut Criterion) {
    let timestamps = regular_timestamps(100_000);
    let mut enc = DoubleDeltaEncoder::<i64>::new();
    for t in &timestamps {
        enc.add(*t).unwrap();
    }
    let encoded = enc.finish();

    c.bench_function("decode_timestamps_100k", |b| {
        b.iter(|| black_box(decode_column(black_box(&encoded))))
    });
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
