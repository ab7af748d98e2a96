use criterion::{criterion_group, criterion_main, Criterion};
use spill_engine::BlockBloomFilter;

fn filter_insert(c: &mut Criterion) {
    let mut filter = BlockBloomFilter::new(20);
    let mut hash = 0u32;

    c.bench_function("block bloom filter insert", |b| {
        b.iter(|| {
            hash = hash.wrapping_add(0x9e37_79b9);
            filter.insert(hash);
        });
    });
}

fn filter_find(c: &mut Criterion) {
    for log_space in [16, 20, 24] {
        let mut filter = BlockBloomFilter::new(log_space);

        let keys: Vec<u32> = (0..100_000u32).map(|x| x.wrapping_mul(0x9e37_79b9)).collect();
        for &key in &keys {
            filter.insert(key);
        }

        let mut rng = rand::rng();

        c.bench_function(
            &format!("block bloom filter find, true positive (2^{log_space}B)"),
            |b| {
                b.iter(|| {
                    use rand::seq::IndexedRandom;

                    let sample = keys.choose(&mut rng).unwrap();
                    assert!(filter.find(*sample));
                });
            },
        );
    }
}

criterion_group!(benches, filter_insert, filter_find);
criterion_main!(benches);
