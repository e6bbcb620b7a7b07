/// Dispatch Overhead Benchmarks
///
/// Measures the per-event cost of the EventFilter entry points on the hot
/// paths: LINE events for inactive frames (a cache/set lookup), LINE events
/// for active frames (snapshot diffing), and full call/return pairs.
use calltrace::{EventFilter, FrameRecord, IndexBuilder, TraceConfig};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;

fn filter_with(config: TraceConfig) -> EventFilter {
    let filter = EventFilter::new(config);
    filter.start();
    filter
}

/// LINE on a frame that was never accepted
fn bench_inactive_line(c: &mut Criterion) {
    let mut group = c.benchmark_group("inactive_line");
    group.measurement_time(Duration::from_secs(5));

    let filter = filter_with(TraceConfig::default().with_include("*/app/*"));
    let frame = FrameRecord::new(1, "helper", "/lib/vendor.py", 1);
    filter.on_call(&frame);

    group.bench_function("on_line", |b| {
        b.iter(|| filter.on_line(black_box(&frame)));
    });
    group.finish();
}

/// LINE on an active frame, with and without variable tracing
fn bench_active_line(c: &mut Criterion) {
    let mut group = c.benchmark_group("active_line");
    group.measurement_time(Duration::from_secs(5));

    for var_trace in [false, true] {
        let filter = filter_with(TraceConfig::default().with_var_trace(var_trace));
        let frame = FrameRecord::new(1, "work", "/app/main.py", 1)
            .at_line(2)
            .with_locals(&[("i", "0"), ("total", "42"), ("name", "'calltrace'")]);
        filter.on_call(&frame);

        group.bench_with_input(
            BenchmarkId::new("on_line", if var_trace { "var_trace" } else { "plain" }),
            &frame,
            |b, frame| b.iter(|| filter.on_line(black_box(frame))),
        );
    }
    group.finish();
}

/// Call/return pairs for accepted and rejected files
fn bench_call_return(c: &mut Criterion) {
    let mut group = c.benchmark_group("call_return");
    group.measurement_time(Duration::from_secs(5));
    group.throughput(Throughput::Elements(2));

    for (label, file) in [("accepted", "/app/main.py"), ("rejected", "/lib/vendor.py")] {
        let filter = filter_with(TraceConfig::default().with_include("*/app/*"));
        let root = FrameRecord::new(0, "main", "/app/main.py", 1);
        filter.on_call(&root);
        let frame = FrameRecord::new(1, "step", file, 10).at_depth(1);

        group.bench_function(BenchmarkId::new("pair", label), |b| {
            b.iter(|| {
                filter.on_call(black_box(&frame));
                filter.on_return(black_box(&frame), Some("None".to_string()));
            });
        });
    }
    group.finish();
}

/// Subtree sizing and index construction over a wide document
fn bench_index_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("index_build");

    let filter = filter_with(TraceConfig::default());
    for i in 0..10_000u64 {
        let frame = FrameRecord::new(i, &format!("fn_{}", i % 100), "/app/main.py", 1);
        filter.on_call(&frame);
        filter.on_line(&frame.clone().at_line(2));
        filter.on_return(&frame, Some("None".to_string()));
    }
    let document = filter.stop().unwrap_or_default();

    group.bench_function("annotate", |b| {
        b.iter(|| {
            let mut doc = document.clone();
            IndexBuilder::annotate(&mut doc);
            black_box(doc);
        });
    });
    group.bench_function("build", |b| {
        b.iter(|| black_box(IndexBuilder::build(&document)));
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_inactive_line,
    bench_active_line,
    bench_call_return,
    bench_index_build
);
criterion_main!(benches);
