//! Benchmarks for filters and operator graphs.
//!
//! Run with: `cargo bench -p vfx-ops`

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use vfx_core::{Bbox, ChannelSet, Format};
use vfx_graph::{Context, Graph, ImagePlane, PixelOp, Planar, render_plane};
use vfx_ops::blur::blur;
use vfx_ops::resize::stretch_line;
use vfx_ops::{Blur, Constant, Filter, Multiply};

/// Direct and pyramid blur of a gradient plane.
fn bench_blur(c: &mut Criterion) {
    let mut group = c.benchmark_group("blur");
    let bbox = Bbox::new(0, 0, 256, 256);
    let mut src = ImagePlane::new(bbox, &ChannelSet::rgb(), false);
    for (x, y) in bbox.iter() {
        for ch in ChannelSet::rgb().explicit() {
            src.set(x, y, ch, (x ^ y) as f32 / 256.0);
        }
    }
    group.throughput(Throughput::Elements(bbox.area() as u64));

    for size in [4.0f32, 12.0, 48.0] {
        for filter in [Filter::Box, Filter::Gaussian] {
            let id = BenchmarkId::new(filter.to_string(), size);
            group.bench_with_input(id, &size, |b, &s| b.iter(|| blur(black_box(&src), s, s, filter, bbox)));
        }
    }
    group.finish();
}

/// Integer stretch of one scanline.
fn bench_stretch(c: &mut Criterion) {
    let mut group = c.benchmark_group("stretch");
    let src: Vec<f32> = (0..2048).map(|i| (i as f32 * 0.01).sin()).collect();
    for k in [2, 4, 8] {
        let mut out = vec![0.0; src.len() * k as usize];
        group.throughput(Throughput::Elements(out.len() as u64));
        group.bench_with_input(BenchmarkId::new("line", k), &k, |b, &k| {
            b.iter(|| stretch_line(black_box(&src), k, &mut out))
        });
    }
    group.finish();
}

/// Pulling a frame through Constant -> Multiply -> Blur.
fn bench_graph(c: &mut Criterion) {
    let mut group = c.benchmark_group("graph");
    let roi = Bbox::new(0, 0, 512, 256);
    group.throughput(Throughput::Elements(roi.area() as u64));
    group.bench_function("constant_multiply_blur", |b| {
        b.iter(|| {
            let mut constant = Constant::new(&[0.2, 0.4, 0.6, 1.0]);
            constant.set_format(Some(Format::new(512, 256, 1.0)));
            let mut graph = Graph::new();
            let src = graph.add_iop("Constant1", constant);
            let gain = graph.add_iop("Multiply1", PixelOp::new(Multiply::new(1.5)));
            let soft = graph.add_iop("Blur1", Planar::new(Blur::new(6.0)));
            graph.set_inputs(gain, &[src]).ok();
            graph.set_inputs(soft, &[gain]).ok();
            render_plane(&mut graph, soft, &Context::default(), roi, &ChannelSet::rgba(), false).ok()
        })
    });
    group.finish();
}

criterion_group!(benches, bench_blur, bench_stretch, bench_graph);
criterion_main!(benches);
