// Requires the `bench_internal` feature, which exposes the registry.
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use intrusive_ref::control_block::ControlBlockRegistry;
use intrusive_ref::RefCount;
use std::time::Duration;

fn lcg(mut s: u64) -> impl Iterator<Item = u64> {
    std::iter::from_fn(move || {
        s = s.wrapping_mul(6364136223846793005).wrapping_add(1);
        Some(s)
    })
}

// Aligned, nonzero fake object addresses. The registry never dereferences
// them.
fn addrs(seed: u64, n: usize) -> Vec<usize> {
    lcg(seed).take(n).map(|x| ((x as usize) | 1) << 4).collect()
}

fn bench_register_sever(c: &mut Criterion) {
    c.bench_function("registry_register_sever_1k", |b| {
        let reg = ControlBlockRegistry::global();
        let counter = RefCount::new();
        b.iter_batched(
            || addrs(1, 1_000),
            |keys| {
                for &a in &keys {
                    black_box(reg.get_control_block(a, &counter));
                }
                for &a in &keys {
                    reg.remove_control_block(a);
                }
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_lookup_hit(c: &mut Criterion) {
    c.bench_function("registry_lookup_hit", |b| {
        let reg = ControlBlockRegistry::global();
        let counter = RefCount::new();
        let keys = addrs(7, 10_000);
        for &a in &keys {
            reg.get_control_block(a, &counter);
        }
        let mut it = keys.iter().cycle();
        b.iter(|| {
            let a = *it.next().unwrap();
            black_box(reg.get_control_block(a, &counter));
        });
        for &a in &keys {
            reg.remove_control_block(a);
        }
    });
}

fn bench_sever_unobserved(c: &mut Criterion) {
    c.bench_function("registry_sever_miss", |b| {
        let reg = ControlBlockRegistry::global();
        let mut miss = lcg(0xdead_beef);
        b.iter(|| {
            let a = ((miss.next().unwrap() as usize) | 1) << 4;
            reg.remove_control_block(black_box(a));
        })
    });
}

fn bench_config() -> Criterion {
    Criterion::default()
        .sample_size(50)
        .measurement_time(Duration::from_secs(8))
        .warm_up_time(Duration::from_secs(2))
}

criterion_group! {
    name = benches;
    config = bench_config();
    targets = bench_register_sever, bench_lookup_hit, bench_sever_unobserved
}
criterion_main!(benches);
