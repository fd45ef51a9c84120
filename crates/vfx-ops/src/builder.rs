//! Building graphs from YAML descriptions.
//!
//! # Overview
//!
//! An [`OpRegistry`] maps class names to constructors that turn a
//! [`Params`] bag into an [`OpKind`]. A [`GraphDesc`] lists nodes with
//! their class, parameters and inputs by name, and [`GraphDesc::build`]
//! turns it into a [`Graph`].
//!
//! ```yaml
//! nodes:
//!   - name: plate
//!     class: Read
//!     params: { file: "plate.####.pfm", missing: nearest }
//!   - name: soften
//!     class: Blur
//!     params: { size: 4, filter: gaussian }
//!     inputs: [plate]
//!   - name: out
//!     class: Write
//!     params: { file: "out.####.pfm" }
//!     inputs: [soften]
//! ```
//!
//! Input lists may hold `null` for an unconnected slot. Parameters a class
//! does not know are logged and ignored.
//!
//! # Example
//!
//! ```rust
//! use vfx_ops::builder::{BuildEnv, GraphDesc, OpRegistry};
//!
//! let desc = GraphDesc::from_yaml_str(
//!     "nodes:\n  - { name: c, class: Constant, params: { color: [0.5] } }\n",
//! ).unwrap();
//! let graph = desc.build(&OpRegistry::with_defaults(), &BuildEnv::default()).unwrap();
//! assert!(graph.find("c").is_some());
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use vfx_core::{ChannelSet, Format, World};
use vfx_graph::deep::CombineMode;
use vfx_graph::{
    Graph, MissingFrames, MultiTile, NoOp, OpKind, Params, PixelOp, Planar, PluginRegistry, Read, ReadMode, Write,
};

use crate::blur::Blur;
use crate::composite::{Merge, MergeMode};
use crate::constant::Constant;
use crate::deep::{DeepFromImage, DeepMerge, DeepToImage};
use crate::filter::Filter;
use crate::metadata::{FrameRange, SetFormat};
use crate::multiply::Multiply;
use crate::resize::Stretch;
use crate::transform::Transform;
use crate::{OpsError, OpsResult};

/// Registries operators are built against.
#[derive(Debug, Clone)]
pub struct BuildEnv {
    /// Channel and format names.
    pub world: Arc<World>,
    /// File-format plugins for Read and Write.
    pub plugins: Arc<PluginRegistry>,
}

impl Default for BuildEnv {
    fn default() -> Self {
        Self {
            world: World::global(),
            plugins: PluginRegistry::global(),
        }
    }
}

/// Builds one operator from its parameters.
pub type Constructor = fn(&Params, &BuildEnv) -> OpsResult<OpKind>;

#[derive(Clone, Copy)]
struct ClassEntry {
    build: Constructor,
    params: &'static [&'static str],
}

/// Class-name to constructor table.
#[derive(Clone, Default)]
pub struct OpRegistry {
    classes: HashMap<String, ClassEntry>,
}

impl std::fmt::Debug for OpRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpRegistry").field("classes", &self.classes()).finish()
    }
}

impl OpRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every operator of this crate plus Read, Write and
    /// NoOp.
    pub fn with_defaults() -> Self {
        let mut r = Self::new();
        r.register("Read", &["file", "plugin", "mode", "missing", "frames", "format"], build_read);
        r.register("Write", &["file", "plugin", "channels", "views", "readback"], build_write);
        r.register("NoOp", &[], |_, _| Ok(OpKind::flat(NoOp::identity())));
        r.register("Constant", &["color", "channels", "format", "frames"], build_constant);
        r.register("Multiply", &["value", "channels"], build_multiply);
        r.register("SetFormat", &["format", "crop"], build_set_format);
        r.register("FrameRange", &["first", "last"], build_frame_range);
        r.register("Stretch", &["kx", "ky"], build_stretch);
        r.register("Blur", &["size", "filter", "channels"], build_blur);
        r.register(
            "Transform",
            &["translate", "rotate", "scale", "center", "filter", "clamp"],
            build_transform,
        );
        r.register("Merge", &["operation", "mix", "channels"], build_merge);
        r.register("DeepFromImage", &["use_z", "z"], build_deep_from_image);
        r.register("DeepToImage", &[], |_, _| Ok(OpKind::flat(Planar::new(DeepToImage))));
        r.register("DeepMerge", &["tidy", "mode"], build_deep_merge);
        r
    }

    /// Adds or replaces a class.
    pub fn register(&mut self, class: &str, params: &'static [&'static str], build: Constructor) {
        self.classes.insert(class.to_string(), ClassEntry { build, params });
    }

    /// Registered class names, sorted.
    pub fn classes(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.classes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Builds an operator of `class`.
    pub fn create(&self, class: &str, params: &Params, env: &BuildEnv) -> OpsResult<OpKind> {
        let entry = self
            .classes
            .get(class)
            .ok_or_else(|| OpsError::Description(format!("unknown operator class '{class}'")))?;
        for name in params.unknown(entry.params) {
            warn!(class, param = name, "ignoring unknown parameter");
        }
        (entry.build)(params, env)
    }
}

/// One node of a [`GraphDesc`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDesc {
    /// Unique node name.
    pub name: String,
    /// Operator class.
    pub class: String,
    /// Operator parameters.
    #[serde(default)]
    pub params: Params,
    /// Upstream node per input slot.
    #[serde(default)]
    pub inputs: Vec<Option<String>>,
}

/// A graph as a list of named nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDesc {
    /// Nodes in any order.
    pub nodes: Vec<NodeDesc>,
}

impl GraphDesc {
    /// Loads a description from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> OpsResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    /// Parses a description from YAML.
    pub fn from_yaml_str(yaml: &str) -> OpsResult<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Serialises the description to YAML.
    pub fn to_yaml_string(&self) -> OpsResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Creates every node, then wires inputs by name.
    pub fn build(&self, registry: &OpRegistry, env: &BuildEnv) -> OpsResult<Graph> {
        let mut graph = Graph::new();
        let mut ids = BTreeMap::new();
        for node in &self.nodes {
            if ids.contains_key(node.name.as_str()) {
                return Err(OpsError::Description(format!("duplicate node name '{}'", node.name)));
            }
            let kind = registry
                .create(&node.class, &node.params, env)
                .map_err(|e| OpsError::Description(format!("{}: {e}", node.name)))?;
            ids.insert(node.name.as_str(), graph.add(node.name.clone(), kind));
        }
        for node in &self.nodes {
            let id = ids[node.name.as_str()];
            for (slot, input) in node.inputs.iter().enumerate() {
                let src = match input {
                    Some(name) => Some(*ids.get(name.as_str()).ok_or_else(|| {
                        OpsError::Description(format!("{}: unknown input '{name}'", node.name))
                    })?),
                    None => None,
                };
                graph.set_input(id, slot, src)?;
            }
        }
        debug!(nodes = graph.len(), "built graph");
        Ok(graph)
    }
}

fn float(params: &Params, name: &str, default: f32) -> OpsResult<f32> {
    Ok(params.double(name, default as f64)? as f32)
}

fn floats(params: &Params, name: &str) -> OpsResult<Option<Vec<f32>>> {
    Ok(params.doubles(name)?.map(|v| v.into_iter().map(|d| d as f32).collect()))
}

/// A pair from one or two numbers; one number fills both.
fn pair(params: &Params, name: &str, default: [f32; 2]) -> OpsResult<[f32; 2]> {
    match floats(params, name)?.as_deref() {
        None => Ok(default),
        Some([v]) => Ok([*v, *v]),
        Some([x, y]) => Ok([*x, *y]),
        Some(other) => Err(OpsError::InvalidParameter(format!(
            "'{name}' takes one or two numbers, got {}",
            other.len()
        ))),
    }
}

fn filter(params: &Params, default: Filter) -> OpsResult<Filter> {
    params.string("filter")?.map_or(Ok(default), str::parse)
}

/// A format by registered name, or as `[width, height]` or
/// `[width, height, aspect]`.
fn format(params: &Params, env: &BuildEnv) -> OpsResult<Option<Format>> {
    if let Some(name) = params.string("format")? {
        let format = env.world.formats.get(name).map_err(vfx_graph::GraphError::from)?;
        return Ok(Some((*format).clone()));
    }
    match params.doubles("format")?.as_deref() {
        None => Ok(None),
        Some([w, h]) => Ok(Some(Format::new(*w as i32, *h as i32, 1.0))),
        Some([w, h, aspect]) => Ok(Some(Format::new(*w as i32, *h as i32, *aspect))),
        Some(_) => Err(OpsError::InvalidParameter("'format' takes a name or 2-3 numbers".into())),
    }
}

fn frames(params: &Params) -> OpsResult<Option<(i32, i32)>> {
    match params.doubles("frames")?.as_deref() {
        None => Ok(None),
        Some([f]) => Ok(Some((*f as i32, *f as i32))),
        Some([first, last]) => Ok(Some((*first as i32, *last as i32))),
        Some(_) => Err(OpsError::InvalidParameter("'frames' takes [first, last]".into())),
    }
}

fn build_read(params: &Params, env: &BuildEnv) -> OpsResult<OpKind> {
    let file = params.string("file")?.unwrap_or_default();
    let mut read = Read::with_registry(file, env.plugins.clone());
    read.set_plugin(params.string("plugin")?.map(str::to_string));
    read.set_mode(match params.choice("mode", &["file", "black", "checkerboard"], 0)? {
        1 => ReadMode::Black,
        2 => ReadMode::Checkerboard,
        _ => ReadMode::File,
    });
    read.set_missing_frames(match params.choice("missing", &["error", "black", "checkerboard", "nearest"], 0)? {
        1 => MissingFrames::Black,
        2 => MissingFrames::Checkerboard,
        3 => MissingFrames::Nearest,
        _ => MissingFrames::Error,
    });
    if let Some((first, last)) = frames(params)? {
        read.set_frame_range(first, last);
    }
    if let Some(f) = format(params, env)? {
        read.set_format(f);
    }
    Ok(OpKind::flat(read))
}

fn build_write(params: &Params, env: &BuildEnv) -> OpsResult<OpKind> {
    let file = params
        .string("file")?
        .ok_or_else(|| OpsError::InvalidParameter("Write needs a 'file'".into()))?;
    let mut write = Write::with_registry(file, env.plugins.clone());
    write.set_plugin(params.string("plugin")?.map(str::to_string));
    write.set_channels(params.channels("channels", &env.world, ChannelSet::rgba())?);
    if let Some(views) = params.string("views")? {
        write.set_views(views.split([' ', ',']).filter(|v| !v.is_empty()).map(str::to_string).collect());
    }
    write.set_readback(params.bool("readback", false)?);
    Ok(OpKind::flat(write))
}

fn build_constant(params: &Params, env: &BuildEnv) -> OpsResult<OpKind> {
    let mut op = Constant::new(&floats(params, "color")?.unwrap_or_default());
    op.set_channels(params.channels("channels", &env.world, ChannelSet::rgba())?);
    op.set_format(format(params, env)?);
    op.set_frame_range(frames(params)?);
    Ok(OpKind::flat(op))
}

fn build_multiply(params: &Params, env: &BuildEnv) -> OpsResult<OpKind> {
    let mut op = Multiply::new(1.0);
    if let Some(value) = floats(params, "value")? {
        op.set_value(&value);
    }
    op.set_channels(params.channels("channels", &env.world, ChannelSet::rgb())?);
    Ok(OpKind::flat(PixelOp::new(op)))
}

fn build_set_format(params: &Params, env: &BuildEnv) -> OpsResult<OpKind> {
    let f = format(params, env)?.ok_or_else(|| OpsError::InvalidParameter("SetFormat needs a 'format'".into()))?;
    let mut op = SetFormat::new(f);
    op.set_crop(params.bool("crop", false)?);
    Ok(OpKind::flat(NoOp::new(op)))
}

fn build_frame_range(params: &Params, _env: &BuildEnv) -> OpsResult<OpKind> {
    let first = params.int32("first", 1)?;
    let last = params.int32("last", first)?;
    Ok(OpKind::flat(NoOp::new(FrameRange::new(first, last))))
}

fn build_stretch(params: &Params, _env: &BuildEnv) -> OpsResult<OpKind> {
    let kx = params.int32("kx", 1)?;
    let ky = params.int32("ky", 1)?;
    if kx < 1 || ky < 1 {
        return Err(OpsError::InvalidParameter(format!("stretch factors must be >= 1, got {kx}x{ky}")));
    }
    Ok(OpKind::flat(Stretch::new(kx, ky)))
}

fn build_blur(params: &Params, env: &BuildEnv) -> OpsResult<OpKind> {
    let [sx, sy] = pair(params, "size", [0.0, 0.0])?;
    if sx < 0.0 || sy < 0.0 {
        return Err(OpsError::InvalidParameter(format!("blur size must be >= 0, got {sx}x{sy}")));
    }
    let mut op = Blur::new(sx);
    op.set_size(sx, sy);
    op.set_filter(filter(params, Filter::Gaussian)?);
    op.set_channels(params.channels("channels", &env.world, ChannelSet::all())?);
    Ok(OpKind::flat(Planar::new(op)))
}

fn build_transform(params: &Params, _env: &BuildEnv) -> OpsResult<OpKind> {
    let mut op = Transform::new();
    let [tx, ty] = pair(params, "translate", [0.0, 0.0])?;
    op.set_translate(tx, ty);
    op.set_rotate(float(params, "rotate", 0.0)?);
    let [sx, sy] = pair(params, "scale", [1.0, 1.0])?;
    op.set_scale(sx, sy);
    let [cx, cy] = pair(params, "center", [0.0, 0.0])?;
    op.set_center(cx, cy);
    op.set_filter(filter(params, Filter::CATMULL_ROM)?);
    op.set_clamp(params.bool("clamp", false)?);
    Ok(OpKind::flat(MultiTile::new(op)))
}

fn build_merge(params: &Params, env: &BuildEnv) -> OpsResult<OpKind> {
    let mode = params.string("operation")?.map_or(Ok(MergeMode::Over), str::parse)?;
    let mut op = Merge::new(mode);
    op.set_mix(float(params, "mix", 1.0)?);
    op.set_channels(params.channels("channels", &env.world, ChannelSet::all())?);
    Ok(OpKind::flat(op))
}

fn build_deep_from_image(params: &Params, _env: &BuildEnv) -> OpsResult<OpKind> {
    let mut op = DeepFromImage::new();
    op.set_use_z(params.bool("use_z", true)?);
    op.set_z(float(params, "z", 1.0)?);
    Ok(OpKind::deep(op))
}

fn build_deep_merge(params: &Params, _env: &BuildEnv) -> OpsResult<OpKind> {
    let mut op = DeepMerge::new();
    op.set_tidy(params.bool("tidy", false)?);
    op.set_mode(match params.choice("mode", &["merge", "add"], 0)? {
        1 => CombineMode::Add,
        _ => CombineMode::Merge,
    });
    Ok(OpKind::deep(op))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAIN: &str = r#"
nodes:
  - name: bg
    class: Constant
    params: { color: [0.2, 0.4, 0.6, 1.0], format: [64, 32] }
  - name: fg
    class: Constant
    params: { color: [0.5], format: [64, 32], bogus: 3 }
  - name: comp
    class: Merge
    params: { operation: plus, mix: 0.5 }
    inputs: [bg, fg]
  - name: soft
    class: Blur
    params: { size: [2, 0] }
    inputs: [comp]
"#;

    #[test]
    fn test_builds_and_wires() {
        let desc = GraphDesc::from_yaml_str(CHAIN).unwrap();
        let graph = desc.build(&OpRegistry::with_defaults(), &BuildEnv::default()).unwrap();
        assert_eq!(graph.len(), 4);
        let comp = graph.find("comp").unwrap();
        let inputs = graph.node(comp).unwrap().inputs().to_vec();
        assert_eq!(inputs, vec![graph.find("bg"), graph.find("fg")]);
        assert_eq!(graph.node(graph.find("soft").unwrap()).unwrap().op().class(), "Blur");
    }

    #[test]
    fn test_null_input_leaves_slot_open() {
        let yaml = "nodes:\n  - { name: a, class: Constant }\n  - { name: m, class: Merge, inputs: [~, a] }\n";
        let graph = GraphDesc::from_yaml_str(yaml)
            .unwrap()
            .build(&OpRegistry::with_defaults(), &BuildEnv::default())
            .unwrap();
        let m = graph.find("m").unwrap();
        assert_eq!(graph.node(m).unwrap().inputs(), &[None, graph.find("a")]);
    }

    #[test]
    fn test_description_errors() {
        let registry = OpRegistry::with_defaults();
        let env = BuildEnv::default();
        let dup = "nodes:\n  - { name: a, class: NoOp }\n  - { name: a, class: NoOp }\n";
        let unknown_input = "nodes:\n  - { name: a, class: NoOp, inputs: [b] }\n";
        let unknown_class = "nodes:\n  - { name: a, class: Sharpen }\n";
        let bad_param = "nodes:\n  - { name: a, class: Blur, params: { filter: sinc } }\n";
        for yaml in [dup, unknown_input, unknown_class, bad_param] {
            let desc = GraphDesc::from_yaml_str(yaml).unwrap();
            assert!(desc.build(&registry, &env).is_err(), "{yaml}");
        }
    }

    #[test]
    fn test_pair_accepts_one_or_two() {
        let p = Params::new().with("size", 3.0).with("center", vec![1.0, 2.0]).with("bad", vec![1, 2, 3]);
        assert_eq!(pair(&p, "size", [0.0; 2]).unwrap(), [3.0, 3.0]);
        assert_eq!(pair(&p, "center", [0.0; 2]).unwrap(), [1.0, 2.0]);
        assert!(pair(&p, "bad", [0.0; 2]).is_err());
    }

    #[test]
    fn test_yaml_round_trip() {
        let desc = GraphDesc::from_yaml_str(CHAIN).unwrap();
        let again = GraphDesc::from_yaml_str(&desc.to_yaml_string().unwrap()).unwrap();
        assert_eq!(desc, again);
    }
}
