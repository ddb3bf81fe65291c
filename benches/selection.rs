/// Benchmarks for applying index selections to source bytes.
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use data_portal::array::select_bytes;
use data_portal::models::Slice;

fn criterion_benchmark(c: &mut Criterion) {
    for size_k in [64, 256, 1024] {
        // A square float32 array of roughly size_k KiB.
        let side = ((size_k * 1024 / 4) as f64).sqrt() as usize;
        let shape = vec![side, side];
        let data: Vec<u8> = (0..side * side * 4).map(|i| (i % 256) as u8).collect();
        let selections = [
            ("all", None),
            (
                "stride2",
                Some(vec![Slice::new(0, side as isize, 2), Slice::new(0, side as isize, 2)]),
            ),
            (
                "reverse",
                Some(vec![Slice::new(-1, -(side as isize) - 1, -1), Slice::new(0, side as isize, 1)]),
            ),
        ];
        for (name, selection) in selections {
            let name = format!("select_bytes({}, {})", name, size_k);
            c.bench_function(&name, |b| {
                b.iter(|| select_bytes(black_box(&data), &shape, 4, &selection).unwrap())
            });
        }
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
