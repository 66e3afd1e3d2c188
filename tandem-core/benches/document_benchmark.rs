use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tandem_core::{ClientId, Document, StateVector};

fn seeded(len: usize) -> Document {
    let text: String = (0..len).map(|i| (b'a' + (i % 26) as u8) as char).collect();
    Document::from_text(ClientId(1), &text)
}

fn bench_local_typing(c: &mut Criterion) {
    c.bench_function("local_insert_10k_doc", |b| {
        b.iter_batched(
            || seeded(10_000),
            |mut doc| {
                for i in 0..100 {
                    black_box(doc.insert(5_000 + i, "x").unwrap());
                }
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

fn bench_local_delete(c: &mut Criterion) {
    c.bench_function("local_delete_10k_doc", |b| {
        b.iter_batched(
            || seeded(10_000),
            |mut doc| {
                for _ in 0..100 {
                    black_box(doc.delete(2_500, 3).unwrap());
                }
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

fn bench_remote_merge(c: &mut Criterion) {
    let mut author = seeded(1_000);
    let base = author.diff_since(&StateVector::new());
    let mut edits = Vec::new();
    for i in 0..1_000 {
        let pos = (i * 7) % author.len();
        edits.push(author.insert(pos, "y").unwrap());
    }

    c.bench_function("merge_1k_remote_ops", |b| {
        b.iter_batched(
            || {
                let mut doc = Document::new(ClientId(2));
                for op in base.clone() {
                    doc.apply_remote(op).unwrap();
                }
                doc
            },
            |mut doc| {
                for op in edits.clone() {
                    black_box(doc.apply_remote(op).unwrap());
                }
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

fn bench_diff_since_empty(c: &mut Criterion) {
    let mut doc = seeded(1_000);
    for i in 0..500 {
        doc.insert(i, "z").unwrap();
    }
    c.bench_function("diff_since_empty_vector", |b| {
        b.iter(|| black_box(doc.diff_since(black_box(&StateVector::new()))))
    });
}

fn bench_encode_state(c: &mut Criterion) {
    let mut doc = seeded(1_000);
    for i in 0..500 {
        doc.insert(i * 2, "z").unwrap();
    }
    let encoded = doc.encode_state().unwrap();

    c.bench_function("encode_state_1500_ops", |b| {
        b.iter(|| black_box(doc.encode_state().unwrap()))
    });
    c.bench_function("decode_state_1500_ops", |b| {
        b.iter(|| black_box(Document::decode_state(ClientId(9), black_box(&encoded)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_local_typing,
    bench_local_delete,
    bench_remote_merge,
    bench_diff_since_empty,
    bench_encode_state,
);
criterion_main!(benches);
