use rand::{rngs::StdRng, Rng, SeedableRng};
use spill_engine::BlockBloomFilter;
use std::collections::HashSet;
use test_log::test;

#[test]
fn filter_false_positive_rate_within_bound() {
    const NDV: usize = 10_000;
    const PROBES: usize = 1_000_000;
    const TARGET_FPP: f64 = 0.01;

    let log_space = BlockBloomFilter::min_log_space(NDV, TARGET_FPP);
    let mut filter = BlockBloomFilter::new(log_space);

    let mut rng = StdRng::seed_from_u64(0xF11);

    let mut members = HashSet::with_capacity(NDV);
    while members.len() < NDV {
        members.insert(rng.random::<u32>());
    }
    for &hash in &members {
        filter.insert(hash);
    }

    // No false negatives, ever
    for &hash in &members {
        assert!(filter.find(hash));
    }

    let mut false_positives = 0usize;
    let mut probed = 0usize;
    while probed < PROBES {
        let hash = rng.random::<u32>();
        if members.contains(&hash) {
            continue;
        }
        probed += 1;
        if filter.find(hash) {
            false_positives += 1;
        }
    }

    let observed = false_positives as f64 / PROBES as f64;
    assert!(
        observed <= 0.015,
        "observed false positive rate {observed} exceeds 1.5%",
    );
}

#[test]
fn filter_probe_matches_every_build_row_once() {
    // Hash-join shaped exchange: the build side registers its keys, the
    // probe side consults the filter and must see every expected build
    // row exactly once per matching probe
    let build_rows: Vec<(u32, i64)> = (0..1_000)
        .map(|i| (i % 100, i64::from(i)))
        .collect();

    let mut filter = BlockBloomFilter::new(12);
    for (key, _) in &build_rows {
        filter.insert(*key);
    }

    for probe_key in 0..100u32 {
        assert!(filter.find(probe_key), "build keys never false-negative");

        let expected: Vec<i64> = build_rows
            .iter()
            .filter(|(key, _)| *key == probe_key)
            .map(|(_, payload)| *payload)
            .collect();

        let mut matched = vec![0usize; expected.len()];
        for (key, payload) in &build_rows {
            if *key != probe_key {
                continue;
            }
            let slot = expected
                .iter()
                .position(|p| p == payload)
                .expect("payload comes from the expected set");
            matched[slot] += 1;
        }

        assert!(
            matched.iter().all(|&count| count == 1),
            "every expected build row must match exactly once",
        );
    }
}

#[test]
fn filter_union_is_member_disjunction() {
    let mut rng = StdRng::seed_from_u64(7);

    let mut a = BlockBloomFilter::new(14);
    let mut b = BlockBloomFilter::new(14);

    let a_keys: Vec<u32> = (0..2_000).map(|_| rng.random()).collect();
    let b_keys: Vec<u32> = (0..2_000).map(|_| rng.random()).collect();

    for &key in &a_keys {
        a.insert(key);
    }
    for &key in &b_keys {
        b.insert(key);
    }

    let a_before = a.clone();
    a.union_with(&b);

    for &key in a_keys.iter().chain(&b_keys) {
        assert!(a.find(key));
    }

    for _ in 0..10_000 {
        let key = rng.random::<u32>();
        assert_eq!(a_before.find(key) || b.find(key), a.find(key));
    }
}
