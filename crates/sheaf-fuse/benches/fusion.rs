use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sheaf_fuse::element::scan;
use sheaf_fuse::{CommFusion, FusionOptions, JustInTime};
use sheaf_graph::mock::backward_graph;
use sheaf_graph::{Graph, ReduceKind};

// ---------------------------------------------------------------------------
// Helpers: synthetic backward graphs of varying width
// ---------------------------------------------------------------------------

/// One collective per gradient, shapes cycling through a few sizes.
fn build_backward(gradients: usize) -> Graph {
    let shapes: Vec<Vec<usize>> = (0..gradients)
        .map(|i| vec![256 + (i % 7) * 64])
        .collect();
    let refs: Vec<&[usize]> = shapes.iter().map(Vec::as_slice).collect();
    backward_graph(&refs)
}

// ---------------------------------------------------------------------------
// 1. Scanner
// ---------------------------------------------------------------------------

fn bench_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("fusion/scan");

    for gradients in [16, 256] {
        let graph = build_backward(gradients);
        group.bench_function(format!("{gradients}_gradients"), |b| {
            b.iter(|| black_box(scan(&graph, ReduceKind::Sum).unwrap()))
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// 2. Full pass, per strategy
// ---------------------------------------------------------------------------

fn bench_strategies(c: &mut Criterion) {
    let mut group = c.benchmark_group("fusion/run_64_gradients");
    let graph = build_backward(64);
    let options = FusionOptions::default().with_fusion_length(8);

    let ring = CommFusion::ring(options.clone());
    group.bench_function("ring", |b| {
        b.iter_batched(
            || graph.clone(),
            |mut g| black_box(ring.run(&mut g).unwrap()),
            criterion::BatchSize::SmallInput,
        )
    });

    let concat = CommFusion::concat(options.clone());
    group.bench_function("concat", |b| {
        b.iter_batched(
            || graph.clone(),
            |mut g| black_box(concat.run(&mut g).unwrap()),
            criterion::BatchSize::SmallInput,
        )
    });

    // Budget tuned so the byte accumulator cuts every handful of gradients.
    let jit = CommFusion::new(
        options.clone(),
        Box::new(JustInTime::with_budget_bytes(options, 16 * 1024)),
    );
    group.bench_function("jit", |b| {
        b.iter_batched(
            || graph.clone(),
            |mut g| black_box(jit.run(&mut g).unwrap()),
            criterion::BatchSize::SmallInput,
        )
    });

    group.finish();
}

criterion_group!(benches, bench_scan, bench_strategies);
criterion_main!(benches);
