use criterion::{criterion_group, criterion_main, Criterion, black_box};
use bix_core::{Attribute, Batch, Index, IndexConfig, Predicate};

fn bench_query(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let idx = Index::open_with(dir.path(), IndexConfig { fsync: false, ..Default::default() }).unwrap();
    let mut batch = Batch::new();
    for m in 0..50_000u64 {
        batch.add(Attribute::author(), format!("user{}", m % 50), m);
        batch.add(Attribute::bout(), (m / 100) as i64, m);
    }
    idx.apply(&batch).unwrap();

    let and = Predicate::and([
        Predicate::eq(Attribute::author(), "user7"),
        Predicate::range(Attribute::bout(), Some(100i64.into()), Some(300i64.into())),
    ]);
    let or = Predicate::or((0..10).map(|i| Predicate::eq(Attribute::author(), format!("user{i}"))));
    let not = Predicate::not(Predicate::prefix(Attribute::author(), "user1"));

    for (name, pred) in [("and_range", and), ("or_10", or), ("not_prefix", not)] {
        c.bench_function(name, |bch| {
            bch.iter(|| {
                let q = idx.query(&pred).unwrap();
                black_box(q.filter_map(Result::ok).count())
            })
        });
    }
}

criterion_group!(benches, bench_query);
criterion_main!(benches);
