use criterion::{black_box, criterion_group, criterion_main, Criterion};

use cx::{Cx, CxTimed};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use std::collections::BTreeSet;

const KEYS: u64 = 1_000;

fn populated() -> BTreeSet<u64> {
    (0..KEYS).collect()
}

fn read_hit(c: &mut Criterion) {
    let set = Cx::<BTreeSet<u64>, bool>::new(populated(), 2);
    let token = set.register().unwrap();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    c.bench_function("read_hit", |b| {
        b.iter(|| {
            let key = rng.gen_range(0..KEYS);
            black_box(set.apply_read(&token, move |s| s.contains(&key)))
        })
    });
}

fn update_mix(c: &mut Criterion) {
    let set = Cx::<BTreeSet<u64>, bool>::new(populated(), 2);
    let token = set.register().unwrap();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    c.bench_function("update_mix", |b| {
        b.iter(|| {
            let key = rng.gen_range(0..2 * KEYS);
            if rng.gen_bool(0.5) {
                black_box(set.apply_update(&token, move |s| s.insert(key)))
            } else {
                black_box(set.apply_update(&token, move |s| s.remove(&key)))
            }
        })
    });
}

fn timed_update_mix(c: &mut Criterion) {
    let set = CxTimed::<BTreeSet<u64>, bool>::new(populated(), 2);
    let token = set.register().unwrap();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    c.bench_function("timed_update_mix", |b| {
        b.iter(|| {
            let key = rng.gen_range(0..2 * KEYS);
            if rng.gen_bool(0.5) {
                black_box(set.apply_update(&token, move |s| s.insert(key)))
            } else {
                black_box(set.apply_update(&token, move |s| s.remove(&key)))
            }
        })
    });
}

criterion_group!(benches, read_hit, update_mix, timed_update_mix);
criterion_main!(benches);
