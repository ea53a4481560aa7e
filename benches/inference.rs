//! Criterion benchmarks for causal matching pursuit inference.
//!
//! Run with:
//!   cargo bench
//!   cargo bench --features parallel,simd
//!
//! Results are saved to target/criterion/

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use causalmp::prelude::*;
use causalmp::prng::Prng;

fn make_engine(n_kernel: usize, kernel_size: usize, tier: ExecutionTier) -> CausalMp {
    let bank = KernelBank::random(n_kernel, kernel_size, 42).expect("valid geometry");
    let cfg = MpConfig::default()
        .with_gradient_flow(GradientFlow::Detached)
        .with_execution_tier(tier);
    CausalMp::new(bank, cfg).expect("valid config")
}

fn make_signal(batch_size: usize, l_signal: usize, seed: u64) -> SignalBatch {
    let mut rng = Prng::new(seed);
    let mut data = vec![0.0f32; batch_size * l_signal];
    rng.fill_normal(&mut data);
    SignalBatch::from_flat(data, batch_size).expect("non-empty signal")
}

/// Benchmark infer() with varying batch and signal sizes.
fn bench_infer_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("infer_size");
    let mp = make_engine(16, 32, ExecutionTier::Scalar);

    for &(batch, len) in [(1, 256), (8, 256), (8, 1024), (32, 1024)].iter() {
        let signal = make_signal(batch, len, 7);
        group.throughput(Throughput::Elements((batch * len) as u64));
        group.bench_with_input(
            BenchmarkId::new("scalar", format!("{batch}x{len}")),
            &signal,
            |b, signal| b.iter(|| black_box(mp.infer(signal).map(|(acts, _)| acts.nonzero_count()))),
        );
    }

    group.finish();
}

/// Benchmark infer() comparing execution tiers at a fixed size.
fn bench_infer_tiers(c: &mut Criterion) {
    let mut group = c.benchmark_group("infer_tier");
    let signal = make_signal(32, 512, 11);
    group.throughput(Throughput::Elements((32 * 512) as u64));

    // Simd and Parallel fall back to scalar when their feature is off.
    for (name, tier) in [
        ("scalar", ExecutionTier::Scalar),
        ("simd", ExecutionTier::Simd),
        ("parallel", ExecutionTier::Parallel),
    ] {
        let mp = make_engine(16, 32, tier);
        group.bench_function(name, |b| {
            b.iter(|| black_box(mp.infer(&signal).map(|(acts, _)| acts.nonzero_count())))
        });
    }

    group.finish();
}

/// Differentiable runs pay for the tape; compare both gradient-flow modes.
fn bench_gradient_flow(c: &mut Criterion) {
    let mut group = c.benchmark_group("gradient_flow");
    let signal = make_signal(8, 512, 3);
    let bank = KernelBank::random(16, 32, 42).expect("valid geometry");

    for (name, flow) in [
        ("detached", GradientFlow::Detached),
        ("differentiable", GradientFlow::Differentiable),
    ] {
        let mp = CausalMp::new(bank.clone(), MpConfig::default().with_gradient_flow(flow))
            .expect("valid config");
        group.bench_function(name, |b| {
            b.iter(|| black_box(mp.infer(&signal).map(|(_, meta)| meta.steps_completed)))
        });
    }

    let mp = CausalMp::new(bank, MpConfig::default()).expect("valid config");
    let (acts, meta) = mp.infer(&signal).expect("inference");
    group.bench_function("weight_gradient", |b| {
        b.iter(|| black_box(mp.weight_gradient(&signal, &acts, &meta)))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_infer_sizes,
    bench_infer_tiers,
    bench_gradient_flow
);
criterion_main!(benches);
