//! Operator traits and the contexts the graph hands to them.
//!
//! # Overview
//!
//! Every operator implements [`Op`] (class name, input arity, parameter
//! hash) plus one or both of:
//!
//! - [`Iop`] - flat images, computed one scanline at a time
//! - [`DeepOp`] - deep images, computed one box at a time
//!
//! An operator that is both is stored as [`OpKind::Both`]; the
//! [`DeepIop`] accessors give the graph either face without needing
//! trait-object upcasting.
//!
//! The three phases map to methods as follows:
//!
//! | phase    | flat                    | deep                  |
//! |----------|-------------------------|-----------------------|
//! | validate | [`Iop::validate`]       | [`DeepOp::deep_validate`] |
//! | request  | [`Iop::request`]        | [`DeepOp::get_deep_requests`] |
//! | engine   | [`Iop::engine`]         | [`DeepOp::do_deep_engine`] |
//!
//! Validate gets `&mut self`; engines get `&self` and may run on many
//! threads at once, so any state they use must be set up in validate.

use std::hash::Hasher;
use std::sync::Arc;

use vfx_core::{Bbox, Channel, ChannelSet, World};

use crate::cache::LineData;
use crate::context::{Context, OutputContext};
use crate::deep::DeepPlane;
use crate::graph::{Graph, Node, OpId};
use crate::info::{DeepInfo, Info};
use crate::plane::ImagePlane;
use crate::row::Row;
use crate::tile::{GeneralTile, Tile};
use crate::write::Executable;
use crate::{GraphError, Result};

/// Layout an operator would like its input planes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PackedPreference {
    /// Channels interleaved.
    Packed,
    /// One sub-plane per channel.
    Unpacked,
    /// Either.
    #[default]
    DontCare,
}

/// What an operator needs from one of its inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct InputRequest {
    /// Input slot.
    pub input: usize,
    /// Region needed.
    pub bbox: Bbox,
    /// Channels needed.
    pub channels: ChannelSet,
    /// Expected number of reads; 0 only widens the area.
    pub count: u32,
    /// Whether the deep face of the input is wanted.
    pub deep: bool,
}

impl InputRequest {
    /// Request for the flat face of an input.
    pub fn flat(input: usize, bbox: Bbox, channels: ChannelSet, count: u32) -> Self {
        Self {
            input,
            bbox,
            channels,
            count,
            deep: false,
        }
    }

    /// Request for the deep face of an input.
    pub fn deep(input: usize, bbox: Bbox, channels: ChannelSet, count: u32) -> Self {
        Self {
            input,
            bbox,
            channels,
            count,
            deep: true,
        }
    }
}

/// Identity shared by flat and deep operators.
pub trait Op: Send + Sync {
    /// Class name, e.g. `"Blur"`.
    fn class(&self) -> &'static str;

    /// Inputs the operator cannot work without.
    fn minimum_inputs(&self) -> usize {
        1
    }

    /// Largest number of input slots.
    fn maximum_inputs(&self) -> usize {
        self.minimum_inputs()
    }

    /// Feeds every parameter that affects output pixels into `hash`.
    fn append_hash(&self, _hash: &mut dyn Hasher) {}
}

/// A flat image operator.
pub trait Iop: Op {
    /// Computes output metadata from the inputs'.
    ///
    /// `for_real == false` allows cheap approximations such as not opening
    /// files.
    fn validate(&mut self, cx: &ValidateCx<'_>, for_real: bool) -> Result<Info>;

    /// Channels needed on `input` to produce `channels` on output.
    fn in_channels(&self, _input: usize, channels: &ChannelSet) -> ChannelSet {
        channels.clone()
    }

    /// Requests to issue upstream for an incoming request.
    ///
    /// The default asks every input for the same box and
    /// [`in_channels`](Self::in_channels).
    fn request(
        &self,
        _info: &Info,
        inputs: usize,
        bbox: &Bbox,
        channels: &ChannelSet,
        count: u32,
    ) -> Vec<InputRequest> {
        (0..inputs)
            .map(|i| InputRequest::flat(i, *bbox, self.in_channels(i, channels), count))
            .collect()
    }

    /// Channels this operator rewrites. The rest are copied from
    /// [`raw_channels_from`](Self::raw_channels_from) without calling
    /// [`engine`](Self::engine).
    fn out_channels(&self, info: &Info) -> ChannelSet {
        info.channels.clone()
    }

    /// Input that pass-through channels come from.
    fn raw_channels_from(&self) -> usize {
        0
    }

    /// Fills `row[channels][x..r)` for scanline `y`.
    ///
    /// `y`, `x` and `r` are already clamped to the requested part of the
    /// box and `channels` to [`out_channels`](Self::out_channels).
    fn engine(
        &self,
        cx: &EngineCx<'_>,
        y: i32,
        x: i32,
        r: i32,
        channels: &ChannelSet,
        row: &mut Row,
    ) -> Result<()>;

    /// True if [`fetch_plane`](Self::fetch_plane) is implemented.
    fn supports_planes(&self) -> bool {
        false
    }

    /// Fills a whole plane in one go.
    fn fetch_plane(&self, _cx: &EngineCx<'_>, _plane: &mut ImagePlane) -> Result<()> {
        Err(GraphError::engine(self.class(), "plane fetch not supported"))
    }

    /// A plane this operator keeps that already covers `bbox` x
    /// `channels`, shared without copying.
    fn shared_plane(&self, _cx: &EngineCx<'_>, _bbox: Bbox, _channels: &ChannelSet) -> Result<Option<Arc<ImagePlane>>> {
        Ok(None)
    }

    /// Layout preference for planes fetched from this operator.
    fn packed_preference(&self) -> PackedPreference {
        PackedPreference::DontCare
    }

    /// The effectful side of sink operators.
    fn as_executable(&self) -> Option<&dyn Executable> {
        None
    }
}

/// A deep image operator.
pub trait DeepOp: Op {
    /// Computes output deep metadata.
    fn deep_validate(&mut self, cx: &ValidateCx<'_>, for_real: bool) -> Result<DeepInfo>;

    /// What the operator needs from its inputs to produce `bbox` x
    /// `channels`. Pure: nothing is recorded on the operator.
    fn get_deep_requests(
        &self,
        _info: &DeepInfo,
        inputs: usize,
        bbox: &Bbox,
        channels: &ChannelSet,
        count: u32,
    ) -> Vec<InputRequest> {
        (0..inputs)
            .map(|i| InputRequest::deep(i, *bbox, channels.clone(), count))
            .collect()
    }

    /// Produces the samples of `bbox`.
    fn do_deep_engine(&self, cx: &EngineCx<'_>, bbox: Bbox, channels: &ChannelSet) -> Result<DeepPlane>;
}

/// An operator with both a flat and a deep face.
pub trait DeepIop: Iop + DeepOp {
    /// The flat face.
    fn as_iop(&self) -> &dyn Iop;
    /// The flat face, mutably.
    fn as_iop_mut(&mut self) -> &mut dyn Iop;
    /// The deep face.
    fn as_deep(&self) -> &dyn DeepOp;
    /// The deep face, mutably.
    fn as_deep_mut(&mut self) -> &mut dyn DeepOp;
}

impl<T: Iop + DeepOp + 'static> DeepIop for T {
    fn as_iop(&self) -> &dyn Iop {
        self
    }

    fn as_iop_mut(&mut self) -> &mut dyn Iop {
        self
    }

    fn as_deep(&self) -> &dyn DeepOp {
        self
    }

    fn as_deep_mut(&mut self) -> &mut dyn DeepOp {
        self
    }
}

/// An operator as stored in the graph.
pub enum OpKind {
    /// Flat only.
    Flat(Box<dyn Iop>),
    /// Deep only.
    Deep(Box<dyn DeepOp>),
    /// Both faces.
    Both(Box<dyn DeepIop>),
}

impl std::fmt::Debug for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            OpKind::Flat(_) => "Flat",
            OpKind::Deep(_) => "Deep",
            OpKind::Both(_) => "Both",
        };
        write!(f, "{}({})", tag, self.class())
    }
}

impl OpKind {
    /// Wraps a flat operator.
    pub fn flat(op: impl Iop + 'static) -> Self {
        OpKind::Flat(Box::new(op))
    }

    /// Wraps a deep operator.
    pub fn deep(op: impl DeepOp + 'static) -> Self {
        OpKind::Deep(Box::new(op))
    }

    /// Wraps an operator with both faces.
    pub fn both(op: impl Iop + DeepOp + 'static) -> Self {
        OpKind::Both(Box::new(op))
    }

    /// Class name.
    pub fn class(&self) -> &'static str {
        match self {
            OpKind::Flat(op) => op.class(),
            OpKind::Deep(op) => op.class(),
            OpKind::Both(op) => op.as_iop().class(),
        }
    }

    /// Required inputs.
    pub fn minimum_inputs(&self) -> usize {
        match self {
            OpKind::Flat(op) => op.minimum_inputs(),
            OpKind::Deep(op) => op.minimum_inputs(),
            OpKind::Both(op) => op.as_iop().minimum_inputs(),
        }
    }

    /// Input slots.
    pub fn maximum_inputs(&self) -> usize {
        match self {
            OpKind::Flat(op) => op.maximum_inputs(),
            OpKind::Deep(op) => op.maximum_inputs(),
            OpKind::Both(op) => op.as_iop().maximum_inputs(),
        }
    }

    /// Parameter hash.
    pub fn append_hash(&self, hash: &mut dyn Hasher) {
        match self {
            OpKind::Flat(op) => op.append_hash(hash),
            OpKind::Deep(op) => op.append_hash(hash),
            OpKind::Both(op) => op.as_iop().append_hash(hash),
        }
    }

    /// The flat face, if any.
    pub fn iop(&self) -> Option<&dyn Iop> {
        match self {
            OpKind::Flat(op) => Some(op.as_ref()),
            OpKind::Both(op) => Some(op.as_iop()),
            OpKind::Deep(_) => None,
        }
    }

    /// The deep face, if any.
    pub fn deep_op(&self) -> Option<&dyn DeepOp> {
        match self {
            OpKind::Deep(op) => Some(op.as_ref()),
            OpKind::Both(op) => Some(op.as_deep()),
            OpKind::Flat(_) => None,
        }
    }

    /// True if the operator has a flat face.
    pub fn is_flat(&self) -> bool {
        !matches!(self, OpKind::Deep(_))
    }

    /// True if the operator has a deep face.
    pub fn is_deep(&self) -> bool {
        !matches!(self, OpKind::Flat(_))
    }
}

/// Metadata of one input as seen during validate.
#[derive(Debug, Clone, Default)]
pub struct InputInfo {
    pub(crate) info: Option<Info>,
    pub(crate) deep: Option<DeepInfo>,
    pub(crate) preference: PackedPreference,
}

/// What an operator sees while validating.
pub struct ValidateCx<'a> {
    pub(crate) op_name: &'a str,
    pub(crate) inputs: &'a [InputInfo],
    pub(crate) ctx: &'a Context,
}

impl<'a> ValidateCx<'a> {
    /// Builds a context by hand, for driving an operator outside a graph.
    pub fn new(op_name: &'a str, inputs: &'a [InputInfo], ctx: &'a Context) -> Self {
        Self { op_name, inputs, ctx }
    }

    /// Number of input slots.
    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    /// Flat info of a connected input.
    pub fn input(&self, i: usize) -> Option<&Info> {
        self.inputs.get(i).and_then(|s| s.info.as_ref())
    }

    /// Flat info of an input that must be connected.
    pub fn require_input(&self, i: usize) -> Result<&Info> {
        self.input(i)
            .ok_or_else(|| self.error(format!("input {i} is not connected")))
    }

    /// Deep info of a connected deep input.
    pub fn deep_input(&self, i: usize) -> Option<&DeepInfo> {
        self.inputs.get(i).and_then(|s| s.deep.as_ref())
    }

    /// Deep info of an input that must be connected and deep.
    pub fn require_deep_input(&self, i: usize) -> Result<&DeepInfo> {
        self.deep_input(i)
            .ok_or_else(|| self.error(format!("input {i} is not a connected deep image")))
    }

    /// Plane layout preferred by an input.
    pub fn input_preference(&self, i: usize) -> PackedPreference {
        self.inputs.get(i).map(|s| s.preference).unwrap_or_default()
    }

    /// Shared registries.
    pub fn world(&self) -> &Arc<World> {
        self.ctx.world()
    }

    /// Frame, view and proxy scale being validated.
    pub fn output(&self) -> &OutputContext {
        self.ctx.output()
    }

    /// The evaluation context.
    pub fn context(&self) -> &Context {
        self.ctx
    }

    /// Name of the operator being validated.
    pub fn name(&self) -> &str {
        self.op_name
    }

    /// A validate error attributed to this operator.
    pub fn error(&self, message: impl Into<String>) -> GraphError {
        GraphError::validate(self.op_name, message)
    }
}

/// What an operator sees while computing pixels.
pub struct EngineCx<'a> {
    pub(crate) graph: &'a Graph,
    pub(crate) id: OpId,
    pub(crate) node: &'a Node,
    pub(crate) ctx: &'a Context,
}

impl<'a> EngineCx<'a> {
    /// The evaluation context.
    #[inline]
    pub fn context(&self) -> &'a Context {
        self.ctx
    }

    /// True once the pass was aborted.
    #[inline]
    pub fn aborted(&self) -> bool {
        self.ctx.aborted()
    }

    /// `Err(Aborted)` once the pass was aborted.
    #[inline]
    pub fn check_abort(&self) -> Result<()> {
        if self.ctx.aborted() {
            Err(GraphError::Aborted)
        } else {
            Ok(())
        }
    }

    /// Shared registries.
    pub fn world(&self) -> &'a Arc<World> {
        self.ctx.world()
    }

    /// Highest registered channel; bounds iteration of open channel sets.
    pub fn last_channel(&self) -> Channel {
        self.ctx.world().channels.last_channel()
    }

    /// Frame, view and proxy scale.
    pub fn output(&self) -> &'a OutputContext {
        self.ctx.output()
    }

    /// Handle of the operator being computed.
    pub fn id(&self) -> OpId {
        self.id
    }

    /// Name of the operator being computed.
    pub fn name(&self) -> &'a str {
        &self.node.name
    }

    /// Output info of this operator.
    pub fn info(&self) -> &'a Info {
        &self.node.info
    }

    /// Output deep info of this operator.
    pub fn deep_info(&self) -> Option<&'a DeepInfo> {
        self.node.deep_info.as_ref()
    }

    /// Hash of this operator in the current context.
    pub fn hash(&self) -> u64 {
        self.node.hash
    }

    /// Accumulated requested region, clipped to the box.
    pub fn request_area(&self) -> Bbox {
        self.node
            .request
            .bbox
            .map_or(self.node.info.bbox, |b| b.intersect(&self.node.info.bbox))
    }

    /// Accumulated requested channels.
    pub fn requested_channels(&self) -> &'a ChannelSet {
        &self.node.request.channels
    }

    /// Channels this operator rewrites.
    pub fn out_channels(&self) -> &'a ChannelSet {
        &self.node.out_channels
    }

    /// Number of input slots.
    pub fn input_count(&self) -> usize {
        self.node.inputs.len()
    }

    /// Handle of a connected input.
    pub fn input_id(&self, i: usize) -> Option<OpId> {
        self.node.inputs.get(i).copied().flatten()
    }

    /// Flat info of a connected input.
    pub fn input_info(&self, i: usize) -> Option<&'a Info> {
        let id = self.input_id(i)?;
        self.graph.node(id).ok().map(|n| &n.info)
    }

    /// Deep info of a connected input.
    pub fn input_deep_info(&self, i: usize) -> Option<&'a DeepInfo> {
        let id = self.input_id(i)?;
        self.graph.node(id).ok().and_then(|n| n.deep_info.as_ref())
    }

    /// Fills `row[channels][x..r)` at `y` from input `i`.
    ///
    /// A disconnected input reads as black.
    pub fn input_row(&self, i: usize, y: i32, x: i32, r: i32, channels: &ChannelSet, row: &mut Row) -> Result<()> {
        match self.input_id(i) {
            Some(id) => self.graph.engine_node(id, self.ctx, y, x, r, channels, row),
            None => {
                row.erase_set(channels, self.last_channel());
                Ok(())
            }
        }
    }

    /// One computed line of input `i`.
    pub fn input_line(&self, i: usize, y: i32, x: i32, r: i32, channels: &ChannelSet) -> Result<Arc<LineData>> {
        match self.input_id(i) {
            Some(id) => self.graph.fetch_line(id, self.ctx, y, x, r, channels),
            None => Ok(Arc::new(LineData::black(y, x, r, channels, self.last_channel()))),
        }
    }

    /// A row-cache tile over input `i`, filled before returning.
    pub fn input_tile(&self, i: usize, bbox: Bbox, channels: &ChannelSet, multithreaded: bool) -> Result<Tile> {
        match self.input_id(i) {
            Some(id) => Tile::new(self.graph, id, self.ctx, bbox, channels, multithreaded),
            None => Ok(Tile::black(bbox, channels, self.last_channel())),
        }
    }

    /// A plane-backed tile over input `i` in the given layout.
    pub fn input_general_tile(&self, i: usize, bbox: Bbox, channels: &ChannelSet, packed: bool) -> Result<GeneralTile> {
        let plane = self.input_plane(i, bbox, channels, packed)?;
        Ok(GeneralTile::from_plane(plane, !self.aborted()))
    }

    /// A plane of input `i`.
    pub fn input_plane(&self, i: usize, bbox: Bbox, channels: &ChannelSet, packed: bool) -> Result<ImagePlane> {
        match self.input_id(i) {
            Some(id) => self.graph.fetch_plane_node(id, self.ctx, bbox, channels, packed),
            None => Ok(ImagePlane::new(bbox, &bounded(channels, self.last_channel()), packed)),
        }
    }

    /// A plane of input `i` owned by the producer when it keeps one over
    /// `bbox`, otherwise a fresh unpacked copy.
    pub fn input_buffer(&self, i: usize, bbox: Bbox, channels: &ChannelSet) -> Result<Arc<ImagePlane>> {
        let channels = bounded(channels, self.last_channel());
        if let Some(id) = self.input_id(i) {
            if let Some(plane) = self.graph.shared_plane_node(id, self.ctx, bbox, &channels)? {
                return Ok(plane);
            }
        }
        self.input_plane(i, bbox, &channels, false).map(Arc::new)
    }

    /// Deep samples of input `i`.
    pub fn input_deep(&self, i: usize, bbox: Bbox, channels: &ChannelSet) -> Result<DeepPlane> {
        match self.input_id(i) {
            Some(id) => self.graph.deep_engine_node(id, self.ctx, bbox, channels),
            None => Ok(DeepPlane::empty(bbox, channels)),
        }
    }

    /// An engine error attributed to this operator.
    pub fn error(&self, message: impl Into<String>) -> GraphError {
        GraphError::engine(self.node.name.as_str(), message)
    }
}

/// The explicit channels of `set`, with an open tail cut at `last`.
pub(crate) fn bounded(set: &ChannelSet, last: Channel) -> ChannelSet {
    if set.has_all_above() {
        set.iter().take_while(|c| *c <= last).collect()
    } else {
        set.clone()
    }
}
