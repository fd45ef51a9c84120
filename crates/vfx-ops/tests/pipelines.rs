//! Operators wired into graphs: file round trips, the stretch and blur
//! identities, merge, deep conversion and YAML-built pipelines.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use approx::assert_relative_eq;
use vfx_core::{Bbox, Channel, ChannelSet, Format, World};
use vfx_graph::{Context, Graph, MultiTile, NoOp, Planar, PluginRegistry, Read, Reader, Row, Write, render_plane, render_rows};
use vfx_ops::builder::{BuildEnv, GraphDesc, OpRegistry};
use vfx_ops::pfm::{self, PfmReader};
use vfx_ops::{Blur, Constant, DeepFromImage, DeepToImage, Merge, MergeMode, Stretch, Transform};

fn plugins() -> Arc<PluginRegistry> {
    let plugins = PluginRegistry::new();
    pfm::register(&plugins);
    plugins
}

/// Writes a little-endian RGB PFM with `value(x, y, c)` per component.
fn write_pfm(path: &Path, w: i32, h: i32, value: impl Fn(i32, i32, usize) -> f32) {
    let mut bytes = format!("PF\n{w} {h}\n-1.0\n").into_bytes();
    for y in 0..h {
        for x in 0..w {
            for c in 0..3 {
                bytes.extend_from_slice(&value(x, y, c).to_le_bytes());
            }
        }
    }
    fs::write(path, bytes).unwrap();
}

fn read_node(graph: &mut Graph, path: &Path, plugins: &Arc<PluginRegistry>) -> vfx_graph::OpId {
    graph.add_iop("Read1", Read::with_registry(path.to_string_lossy(), plugins.clone()))
}

fn constant(color: &[f32], w: i32, h: i32) -> Constant {
    let mut c = Constant::new(color);
    c.set_format(Some(Format::new(w, h, 1.0)));
    c
}

#[test]
fn pfm_through_noop_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src.pfm");
    let out = dir.path().join("out.pfm");
    write_pfm(&src, 8, 4, |x, y, c| x as f32 + 10.0 * y as f32 + 0.1 * c as f32);
    let plugins = plugins();

    let mut graph = Graph::new();
    let read = read_node(&mut graph, &src, &plugins);
    let noop = graph.add_iop("NoOp1", NoOp::identity());
    let mut write = Write::with_registry(out.to_string_lossy(), plugins.clone());
    write.set_channels(ChannelSet::rgb());
    let write = graph.add_iop("Write1", write);
    graph.set_inputs(noop, &[read]).unwrap();
    graph.set_inputs(write, &[noop]).unwrap();

    let report = graph.execute(write, &Context::default(), 1..=1).unwrap();
    assert_eq!(report.files, vec![out.clone()]);
    assert_eq!(report.rows, 4);
    assert_eq!(fs::read(&src).unwrap(), fs::read(&out).unwrap());
}

#[test]
fn stretch_by_three_interpolates_and_extrapolates() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("line.pfm");
    let v = |i: i32| 0.01 * (i * i) as f32;
    write_pfm(&src, 100, 1, |x, _, _| v(x));
    let plugins = plugins();

    let mut graph = Graph::new();
    let read = read_node(&mut graph, &src, &plugins);
    let stretch = graph.add_iop("Stretch1", Stretch::new(3, 1));
    graph.set_inputs(stretch, &[read]).unwrap();
    let ctx = Context::default();
    assert_eq!(graph.validate(stretch, &ctx, true).unwrap().bbox, Bbox::new(0, 0, 300, 1));

    let mut out = Vec::new();
    render_rows(&mut graph, stretch, &ctx, Bbox::new(0, 0, 300, 1), &ChannelSet::rgb(), |_, row| {
        out.extend_from_slice(row.span(Channel::RED, 0, 300));
        Ok(())
    })
    .unwrap();
    assert_eq!(out.len(), 300);
    for i in 0..99 {
        let d = v(i + 1) - v(i);
        let k = 3 * i as usize;
        assert_relative_eq!(out[k], v(i), epsilon = 1e-4);
        assert_relative_eq!(out[k + 1], v(i) + d / 3.0, epsilon = 1e-4);
        assert_relative_eq!(out[k + 2], v(i) + 2.0 * d / 3.0, epsilon = 1e-4);
    }
    let d = v(99) - v(98);
    assert_relative_eq!(out[297], v(99), epsilon = 1e-4);
    assert_relative_eq!(out[299], v(99) + 2.0 * d / 3.0, epsilon = 1e-3);
}

#[test]
fn blur_keeps_constants_constant() {
    let color = [0.3, 0.6, 0.9, 1.0];
    for size in [3.0, 40.0] {
        let mut graph = Graph::new();
        let src = graph.add_iop("Constant1", constant(&color, 48, 48));
        let blur = graph.add_iop("Blur1", Planar::new(Blur::new(size)));
        graph.set_inputs(blur, &[src]).unwrap();

        let roi = Bbox::new(0, 0, 48, 48);
        let (plane, report) = render_plane(&mut graph, blur, &Context::default(), roi, &ChannelSet::rgba(), false).unwrap();
        assert!(!report.aborted);
        for (x, y) in roi.iter() {
            for (ch, want) in [Channel::RED, Channel::GREEN, Channel::BLUE, Channel::ALPHA].into_iter().zip(color) {
                assert_relative_eq!(plane.at(x, y, ch), want, epsilon = 1e-4);
            }
        }
    }
}

#[test]
fn merge_over_two_constants() {
    let mut graph = Graph::new();
    let b = graph.add_iop("B", constant(&[0.0, 0.0, 1.0, 1.0], 8, 8));
    let a = graph.add_iop("A", constant(&[0.5, 0.0, 0.0, 0.5], 8, 8));
    let merge = graph.add_iop("Merge1", Merge::new(MergeMode::Over));
    graph.set_inputs(merge, &[b, a]).unwrap();

    let ctx = Context::default();
    let mut row = Row::new(0, 8);
    render_rows(&mut graph, merge, &ctx, Bbox::new(0, 0, 8, 8), &ChannelSet::rgba(), |y, r| {
        if y == 3 {
            row.copy_from(r, &ChannelSet::rgba(), 0, 8, Channel::LAST);
        }
        Ok(())
    })
    .unwrap();
    assert_relative_eq!(row.at(Channel::RED, 2), 0.5);
    assert_relative_eq!(row.at(Channel::BLUE, 2), 0.5);
    assert_relative_eq!(row.at(Channel::ALPHA, 2), 1.0);
}

#[test]
fn flat_to_deep_and_back() {
    let mut graph = Graph::new();
    let src = graph.add_iop("Constant1", constant(&[0.2, 0.4, 0.6, 0.5], 8, 8));
    let mut to_deep = DeepFromImage::new();
    to_deep.set_use_z(false);
    to_deep.set_z(3.0);
    let deep = graph.add_deep("DeepFromImage1", to_deep);
    let flat = graph.add_iop("DeepToImage1", Planar::new(DeepToImage));
    graph.set_inputs(deep, &[src]).unwrap();
    graph.set_inputs(flat, &[deep]).unwrap();

    let channels = ChannelSet::from_slice(&[Channel::RED, Channel::GREEN, Channel::BLUE, Channel::ALPHA, Channel::Z]);
    let roi = Bbox::new(0, 0, 8, 8);
    let (plane, _) = render_plane(&mut graph, flat, &Context::default(), roi, &channels, false).unwrap();
    assert_relative_eq!(plane.at(4, 4, Channel::RED), 0.2, epsilon = 1e-6);
    assert_relative_eq!(plane.at(4, 4, Channel::BLUE), 0.6, epsilon = 1e-6);
    assert_relative_eq!(plane.at(4, 4, Channel::ALPHA), 0.5, epsilon = 1e-6);
    assert_relative_eq!(plane.at(4, 4, Channel::Z), 3.0, epsilon = 1e-6);
}

#[test]
fn integer_translate_shifts_pixels() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("ramp.pfm");
    write_pfm(&src, 16, 4, |x, y, c| (x * 7 % 5) as f32 + y as f32 + c as f32);
    let plugins = plugins();

    let mut graph = Graph::new();
    let read = read_node(&mut graph, &src, &plugins);
    let mut t = Transform::new();
    t.set_translate(3.0, 0.0);
    let xf = graph.add_iop("Transform1", MultiTile::new(t));
    graph.set_inputs(xf, &[read]).unwrap();

    let ctx = Context::default();
    assert_eq!(graph.validate(xf, &ctx, true).unwrap().bbox, Bbox::new(3, 0, 19, 4));
    let (plane, _) = render_plane(&mut graph, xf, &ctx, Bbox::new(3, 0, 19, 4), &ChannelSet::rgb(), false).unwrap();
    let reader = PfmReader::open(&src).unwrap();
    let mut row = Row::new(0, 16);
    reader.read_row(2, 0, 16, &ChannelSet::rgb(), &mut row).unwrap();
    for x in 0..16 {
        assert_relative_eq!(plane.at(x + 3, 2, Channel::GREEN), row.at(Channel::GREEN, x), epsilon = 1e-5);
    }
}

#[test]
fn yaml_pipeline_writes_file() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("gain.pfm");
    let yaml = format!(
        r#"
nodes:
  - name: src
    class: Constant
    params: {{ color: [0.5, 0.25, 0.125, 1.0], format: [4, 2] }}
  - name: gain
    class: Multiply
    params: {{ value: 2 }}
    inputs: [src]
  - name: out
    class: Write
    params: {{ file: "{}", channels: rgb }}
    inputs: [gain]
"#,
        out.display()
    );
    let env = BuildEnv {
        world: World::global(),
        plugins: plugins(),
    };
    let mut graph = GraphDesc::from_yaml_str(&yaml)
        .unwrap()
        .build(&OpRegistry::with_defaults(), &env)
        .unwrap();
    let sink = graph.find("out").unwrap();
    graph.execute(sink, &Context::default(), 1..=1).unwrap();

    let image = PfmReader::open(&out).unwrap();
    assert_eq!(image.info().bbox, Bbox::new(0, 0, 4, 2));
    let mut row = Row::new(0, 4);
    image.read_row(1, 0, 4, &ChannelSet::rgb(), &mut row).unwrap();
    assert_relative_eq!(row.at(Channel::RED, 2), 1.0);
    assert_relative_eq!(row.at(Channel::GREEN, 2), 0.5);
    assert_relative_eq!(row.at(Channel::BLUE, 2), 0.25);
}
