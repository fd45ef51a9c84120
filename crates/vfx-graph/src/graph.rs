//! The operator graph and its three evaluation phases.
//!
//! # Overview
//!
//! [`Graph`] owns every operator in an arena indexed by [`OpId`]. Handles
//! carry a generation so a handle to a removed operator is rejected
//! instead of silently reaching whatever reused the slot.
//!
//! Evaluation is lazy and happens in three phases:
//!
//! 1. **validate** - [`Graph::validate`] computes [`Info`] bottom-up,
//!    depth first. Results are memoised per context hash until an
//!    operator or its inputs change.
//! 2. **request** - [`Graph::request`] tells an operator which region and
//!    channels will be read and how often, and propagates upstream.
//!    Requests accumulate until [`Graph::forget_request`].
//! 3. **engine** - [`Graph::engine`] fills one scanline. It may be called
//!    from many threads at once on a shared `&Graph`.
//!
//! Outside the requested part of an operator's box the nearest edge pixel
//! is repeated. Channels an operator does not rewrite are copied from its
//! pass-through input without running its engine.
//!
//! # Usage
//!
//! ```rust
//! use vfx_core::{Bbox, Channel, ChannelSet};
//! use vfx_graph::{Context, Graph, Info, Iop, EngineCx, ValidateCx, Op, Row, Result};
//!
//! struct Flat(f32);
//!
//! impl Op for Flat {
//!     fn class(&self) -> &'static str { "Flat" }
//!     fn minimum_inputs(&self) -> usize { 0 }
//! }
//!
//! impl Iop for Flat {
//!     fn validate(&mut self, _cx: &ValidateCx<'_>, _real: bool) -> Result<Info> {
//!         Ok(Info::new(Bbox::new(0, 0, 4, 4), ChannelSet::rgb()))
//!     }
//!     fn engine(&self, _cx: &EngineCx<'_>, _y: i32, x: i32, r: i32,
//!               channels: &ChannelSet, row: &mut Row) -> Result<()> {
//!         for ch in channels.explicit() {
//!             row.fill(ch, x, r, self.0);
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let mut graph = Graph::new();
//! let id = graph.add_iop("Flat1", Flat(0.5));
//! let ctx = Context::default();
//! graph.validate(id, &ctx, true).unwrap();
//! graph.request(id, Bbox::new(0, 0, 4, 4), &ChannelSet::rgb(), 1, &ctx).unwrap();
//!
//! let mut row = Row::new(0, 4);
//! graph.engine(id, &ctx, 0, 0, 4, &ChannelSet::rgb(), &mut row).unwrap();
//! assert_eq!(row.at(Channel::GREEN, 2), 0.5);
//! ```

use std::collections::HashSet;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tracing::{debug, trace};
use vfx_core::{Bbox, ChannelSet};

use crate::cache::{CacheArena, CacheStats, LineData, RowCache};
use crate::context::{Context, Severity};
use crate::deep::DeepPlane;
use crate::info::{DeepInfo, Info};
use crate::op::{DeepOp, EngineCx, InputInfo, InputRequest, Iop, OpKind, ValidateCx, bounded};
use crate::plane::ImagePlane;
use crate::row::Row;
use crate::{GraphError, Result};

/// Handle to an operator in a [`Graph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId {
    index: u32,
    generation: u32,
}

impl OpId {
    /// Slot index.
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}v{}", self.index, self.generation)
    }
}

/// Where an operator is in the validate/request cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeState {
    /// Needs validating.
    Invalid,
    /// Being validated; seeing this again means a cycle.
    Validating,
    /// Metadata is current.
    Valid,
    /// Requested and ready for engine calls.
    Ready,
    /// Validate failed with this message.
    Error(String),
}

#[derive(Debug, Clone, Default)]
pub(crate) struct RequestState {
    pub(crate) bbox: Option<Bbox>,
    pub(crate) channels: ChannelSet,
    pub(crate) count: u32,
}

impl RequestState {
    /// Merges a request in and returns the previous count.
    fn accumulate(&mut self, bbox: Bbox, channels: &ChannelSet, count: u32) -> u32 {
        self.bbox = Some(self.bbox.map_or(bbox, |b| b.enclose(&bbox)));
        self.channels.insert_set(channels);
        let prev = self.count;
        self.count = self.count.saturating_add(count);
        prev
    }
}

/// One operator plus its evaluation state.
#[derive(Debug)]
pub struct Node {
    pub(crate) name: String,
    pub(crate) kind: OpKind,
    pub(crate) inputs: Vec<Option<OpId>>,
    pub(crate) state: NodeState,
    pub(crate) real: bool,
    pub(crate) info: Info,
    pub(crate) deep_info: Option<DeepInfo>,
    pub(crate) out_channels: ChannelSet,
    pub(crate) context_hash: Option<u64>,
    pub(crate) hash: u64,
    pub(crate) request: RequestState,
    pub(crate) deep_request: RequestState,
    pub(crate) cache: Option<Arc<RowCache>>,
    pub(crate) force_cache: Option<bool>,
}

impl Node {
    fn new(name: String, kind: OpKind) -> Self {
        let inputs = vec![None; kind.minimum_inputs()];
        Self {
            name,
            kind,
            inputs,
            state: NodeState::Invalid,
            real: false,
            info: Info::default(),
            deep_info: None,
            out_channels: ChannelSet::none(),
            context_hash: None,
            hash: 0,
            request: RequestState::default(),
            deep_request: RequestState::default(),
            cache: None,
            force_cache: None,
        }
    }

    /// Operator name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The operator.
    pub fn op(&self) -> &OpKind {
        &self.kind
    }

    /// Connected inputs by slot.
    pub fn inputs(&self) -> &[Option<OpId>] {
        &self.inputs
    }

    /// Validate state.
    pub fn state(&self) -> &NodeState {
        &self.state
    }

    /// Flat metadata from the last validate.
    pub fn info(&self) -> &Info {
        &self.info
    }

    /// Deep metadata from the last validate.
    pub fn deep_info(&self) -> Option<&DeepInfo> {
        self.deep_info.as_ref()
    }

    fn is_current(&self, ctx_hash: u64, for_real: bool) -> bool {
        matches!(self.state, NodeState::Valid | NodeState::Ready)
            && self.context_hash == Some(ctx_hash)
            && (self.real || !for_real)
    }
}

struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// Arena of operators wired into a directed acyclic graph.
pub struct Graph {
    slots: Vec<Slot>,
    free: Vec<u32>,
    arena: Arc<CacheArena>,
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph").field("ops", &self.len()).finish()
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    /// Empty graph using the process-wide cache arena.
    pub fn new() -> Self {
        Self::with_arena(CacheArena::global())
    }

    /// Empty graph with its own cache arena.
    pub fn with_arena(arena: Arc<CacheArena>) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            arena,
        }
    }

    /// The cache arena.
    pub fn arena(&self) -> &Arc<CacheArena> {
        &self.arena
    }

    /// Number of live operators.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.node.is_some()).count()
    }

    /// True if the graph holds no operator.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handles of all live operators in slot order.
    pub fn ids(&self) -> Vec<OpId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.node.is_some())
            .map(|(i, s)| OpId {
                index: i as u32,
                generation: s.generation,
            })
            .collect()
    }

    /// Adds an operator. An empty name is replaced by class plus index.
    pub fn add(&mut self, name: impl Into<String>, kind: OpKind) -> OpId {
        let mut name = name.into();
        let index = match self.free.pop() {
            Some(i) => i,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        if name.is_empty() {
            name = format!("{}{}", kind.class(), index + 1);
        }
        let slot = &mut self.slots[index as usize];
        slot.node = Some(Node::new(name, kind));
        OpId {
            index,
            generation: slot.generation,
        }
    }

    /// Adds a flat operator.
    pub fn add_iop(&mut self, name: impl Into<String>, op: impl Iop + 'static) -> OpId {
        self.add(name, OpKind::flat(op))
    }

    /// Adds a deep operator.
    pub fn add_deep(&mut self, name: impl Into<String>, op: impl DeepOp + 'static) -> OpId {
        self.add(name, OpKind::deep(op))
    }

    /// Adds an operator with both faces.
    pub fn add_both(&mut self, name: impl Into<String>, op: impl Iop + DeepOp + 'static) -> OpId {
        self.add(name, OpKind::both(op))
    }

    /// Removes an operator and disconnects everything reading from it.
    pub fn remove(&mut self, id: OpId) -> Result<()> {
        self.node(id)?;
        self.invalidate(id)?;
        for other in self.ids() {
            if let Some(node) = self.slot_node_mut(other) {
                for input in node.inputs.iter_mut() {
                    if *input == Some(id) {
                        *input = None;
                    }
                }
            }
        }
        let slot = &mut self.slots[id.index()];
        slot.node = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Ok(())
    }

    fn slot_node_mut(&mut self, id: OpId) -> Option<&mut Node> {
        self.slots
            .get_mut(id.index())
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.node.as_mut())
    }

    /// Node behind a handle.
    pub fn node(&self, id: OpId) -> Result<&Node> {
        self.slots
            .get(id.index())
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.node.as_ref())
            .ok_or_else(|| GraphError::UnknownOp(id.to_string()))
    }

    pub(crate) fn node_mut(&mut self, id: OpId) -> Result<&mut Node> {
        self.slot_node_mut(id)
            .ok_or_else(|| GraphError::UnknownOp(id.to_string()))
    }

    /// Looks an operator up by name.
    pub fn find(&self, name: &str) -> Option<OpId> {
        self.ids()
            .into_iter()
            .find(|id| self.node(*id).is_ok_and(|n| n.name == name))
    }

    /// Name of an operator.
    pub fn name(&self, id: OpId) -> Result<&str> {
        Ok(self.node(id)?.name.as_str())
    }

    /// Mutable access to an operator's parameters. Invalidates it and
    /// everything downstream.
    pub fn op_mut(&mut self, id: OpId) -> Result<&mut OpKind> {
        self.invalidate(id)?;
        Ok(&mut self.node_mut(id)?.kind)
    }

    /// Connects `input` (or nothing) to slot `slot` of `id`.
    pub fn set_input(&mut self, id: OpId, slot: usize, input: Option<OpId>) -> Result<()> {
        let max = self.node(id)?.kind.maximum_inputs();
        if slot >= max {
            return Err(GraphError::config(format!(
                "{} has {} input slots, cannot set slot {}",
                self.node(id)?.name,
                max,
                slot
            )));
        }
        if let Some(src) = input {
            self.node(src)?;
            if src == id || self.upstream(src).contains(&id) {
                return Err(GraphError::Cycle(self.node(id)?.name.clone()));
            }
        }
        let node = self.node_mut(id)?;
        if node.inputs.len() <= slot {
            node.inputs.resize(slot + 1, None);
        }
        node.inputs[slot] = input;
        self.invalidate(id)
    }

    /// Connects inputs to slots `0..inputs.len()`.
    pub fn set_inputs(&mut self, id: OpId, inputs: &[OpId]) -> Result<()> {
        for (slot, input) in inputs.iter().enumerate() {
            self.set_input(id, slot, Some(*input))?;
        }
        Ok(())
    }

    /// Every operator `id` reads from, directly or not.
    pub fn upstream(&self, id: OpId) -> HashSet<OpId> {
        let mut seen = HashSet::new();
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            if let Ok(node) = self.node(cur) {
                for input in node.inputs.iter().flatten() {
                    if seen.insert(*input) {
                        stack.push(*input);
                    }
                }
            }
        }
        seen
    }

    /// Operators directly reading from `id`.
    pub fn downstream(&self, id: OpId) -> Vec<OpId> {
        self.ids()
            .into_iter()
            .filter(|o| self.node(*o).is_ok_and(|n| n.inputs.contains(&Some(id))))
            .collect()
    }

    /// Marks `id` and everything downstream as needing validate.
    pub fn invalidate(&mut self, id: OpId) -> Result<()> {
        let mut stack = vec![id];
        let mut seen = HashSet::new();
        while let Some(cur) = stack.pop() {
            if !seen.insert(cur) {
                continue;
            }
            let node = self.node_mut(cur)?;
            node.state = NodeState::Invalid;
            node.context_hash = None;
            node.real = false;
            node.request = RequestState::default();
            node.deep_request = RequestState::default();
            stack.extend(self.downstream(cur));
        }
        Ok(())
    }

    /// Validate state of an operator.
    pub fn state(&self, id: OpId) -> Result<&NodeState> {
        Ok(&self.node(id)?.state)
    }

    /// Flat metadata from the last validate.
    pub fn info(&self, id: OpId) -> Result<&Info> {
        Ok(&self.node(id)?.info)
    }

    /// Hash from the last validate.
    pub fn hash(&self, id: OpId) -> Result<u64> {
        Ok(self.node(id)?.hash)
    }

    /// Computes metadata for `id` and everything it reads from.
    ///
    /// A failure leaves the operator in [`NodeState::Error`]; validating
    /// it again in the same context fails fast with the same message.
    pub fn validate(&mut self, id: OpId, ctx: &Context, for_real: bool) -> Result<Info> {
        self.validate_node(id, ctx, for_real)?;
        Ok(self.node(id)?.info.clone())
    }

    /// Computes deep metadata for `id`.
    pub fn deep_validate(&mut self, id: OpId, ctx: &Context, for_real: bool) -> Result<DeepInfo> {
        self.validate_node(id, ctx, for_real)?;
        let node = self.node(id)?;
        node.deep_info
            .clone()
            .ok_or_else(|| GraphError::validate(node.name.as_str(), "not a deep operator"))
    }

    fn validate_node(&mut self, id: OpId, ctx: &Context, for_real: bool) -> Result<()> {
        let ctx_hash = ctx.hash_value();
        let node = self.node(id)?;
        match &node.state {
            NodeState::Validating => return Err(GraphError::Cycle(node.name.clone())),
            NodeState::Error(msg) if node.context_hash == Some(ctx_hash) => {
                return Err(GraphError::validate(node.name.as_str(), msg.as_str()));
            }
            _ if node.is_current(ctx_hash, for_real) => return Ok(()),
            _ => {}
        }
        let inputs = node.inputs.clone();
        self.node_mut(id)?.state = NodeState::Validating;

        let mut infos = Vec::with_capacity(inputs.len());
        let mut hasher = DefaultHasher::new();
        for input in &inputs {
            match input {
                Some(src) => {
                    if let Err(e) = self.validate_node(*src, ctx, for_real) {
                        self.fail(id, ctx_hash, &e)?;
                        return Err(e);
                    }
                    let n = self.node(*src)?;
                    n.hash.hash(&mut hasher);
                    infos.push(InputInfo {
                        info: n.kind.is_flat().then(|| n.info.clone()),
                        deep: n.deep_info.clone(),
                        preference: n.kind.iop().map(|op| op.packed_preference()).unwrap_or_default(),
                    });
                }
                None => {
                    0u64.hash(&mut hasher);
                    infos.push(InputInfo::default());
                }
            }
        }

        let node = self.node_mut(id)?;
        node.kind.class().hash(&mut hasher);
        node.kind.append_hash(&mut hasher);
        ctx_hash.hash(&mut hasher);

        let cx = ValidateCx {
            op_name: &node.name,
            inputs: &infos,
            ctx,
        };
        let result: Result<(Info, Option<DeepInfo>)> = match &mut node.kind {
            OpKind::Flat(op) => op.validate(&cx, for_real).map(|info| (info, None)),
            OpKind::Deep(op) => op
                .deep_validate(&cx, for_real)
                .map(|deep| (deep.to_info(), Some(deep))),
            OpKind::Both(op) => op.as_deep_mut().deep_validate(&cx, for_real).and_then(|deep| {
                op.as_iop_mut()
                    .validate(&cx, for_real)
                    .map(|info| (info, Some(deep)))
            }),
        };

        match result {
            Ok((info, deep)) => {
                node.out_channels = match node.kind.iop() {
                    Some(op) => op.out_channels(&info).intersection(&info.channels),
                    None => info.channels.clone(),
                };
                node.info = info;
                node.deep_info = deep;
                let hash = hasher.finish();
                if hash != node.hash {
                    if let Some(cache) = &node.cache {
                        cache.clear();
                    }
                }
                node.hash = hash;
                node.state = NodeState::Valid;
                node.real = for_real;
                node.context_hash = Some(ctx_hash);
                node.request = RequestState::default();
                node.deep_request = RequestState::default();
                debug!(op = %node.name, bbox = %node.info.bbox, channels = ?node.info.channels, "validated");
                Ok(())
            }
            Err(e) => {
                self.fail(id, ctx_hash, &e)?;
                Err(match e {
                    GraphError::Validate { .. } | GraphError::Cycle(_) | GraphError::Aborted => e,
                    other => GraphError::validate(self.node(id)?.name.as_str(), other.to_string()),
                })
            }
        }
    }

    fn fail(&mut self, id: OpId, ctx_hash: u64, err: &GraphError) -> Result<()> {
        let node = self.node_mut(id)?;
        let message = match err {
            GraphError::Validate { message, .. } => message.clone(),
            other => other.to_string(),
        };
        debug!(op = %node.name, %message, "validate failed");
        node.state = NodeState::Error(message);
        node.context_hash = Some(ctx_hash);
        Ok(())
    }

    fn check_registered(&self, channels: &ChannelSet, ctx: &Context) -> Result<()> {
        let registry = &ctx.world().channels;
        match channels.explicit().find(|c| !registry.is_registered(*c)) {
            Some(c) => Err(GraphError::Request(format!("channel {} is not registered", c.index()))),
            None => Ok(()),
        }
    }

    /// Declares that `bbox` x `channels` of `id` will be read `count`
    /// times, and propagates the needs upstream.
    ///
    /// Requests accumulate: the stored region is the smallest box around
    /// all of them and the counts add up. A count above one turns on the
    /// operator's row cache.
    ///
    /// Explicit channels the operator does not declare read as zero; in
    /// strict mode asking for them is an error.
    pub fn request(&mut self, id: OpId, bbox: Bbox, channels: &ChannelSet, count: u32, ctx: &Context) -> Result<()> {
        self.check_declared(id, channels, ctx)?;
        self.request_node(id, bbox, channels, count, ctx)
    }

    fn check_declared(&self, id: OpId, channels: &ChannelSet, ctx: &Context) -> Result<()> {
        let node = self.node(id)?;
        if !matches!(node.state, NodeState::Valid | NodeState::Ready) {
            return Ok(());
        }
        let declared = match &node.deep_info {
            Some(deep) if !node.kind.is_flat() => &deep.channels,
            _ => &node.info.channels,
        };
        let undeclared: Vec<u32> = channels
            .explicit()
            .filter(|c| !declared.contains(*c))
            .map(|c| c.index())
            .collect();
        if undeclared.is_empty() {
            return Ok(());
        }
        debug!(op = %node.name, ?undeclared, "request for undeclared channels");
        if ctx.strict() {
            return Err(GraphError::Request(format!(
                "{} does not produce channels {undeclared:?}",
                node.name
            )));
        }
        Ok(())
    }

    fn request_node(&mut self, id: OpId, bbox: Bbox, channels: &ChannelSet, count: u32, ctx: &Context) -> Result<()> {
        self.check_registered(channels, ctx)?;
        let arena = Arc::clone(&self.arena);
        let node = self.node_mut(id)?;
        if !matches!(node.state, NodeState::Valid | NodeState::Ready) {
            return Err(GraphError::Request(format!("{} requested before validate", node.name)));
        }
        if !node.kind.is_flat() {
            return self.deep_request_node(id, bbox, channels, count, ctx);
        }
        let channels = channels.intersection(&node.info.channels);
        let prev = node.request.accumulate(bbox, &channels, count);
        node.state = NodeState::Ready;
        trace!(op = %node.name, %bbox, count, "request");

        let total = node.request.count;
        if node.cache.is_none() && node.force_cache.unwrap_or(total > 1) {
            node.cache = Some(RowCache::new(&arena, &node.name));
        }
        let cached = node.cache.is_some() && node.force_cache != Some(false);
        let upstream_count = match (cached, prev) {
            (true, 0) => count.min(1),
            (true, _) => 0,
            (false, _) => count,
        };

        let requests = match node.kind.iop() {
            Some(op) => op.request(&node.info, node.inputs.len(), &bbox, &channels, upstream_count),
            None => Vec::new(),
        };
        self.propagate(id, requests, ctx)
    }

    /// Deep counterpart of [`request`](Self::request).
    pub fn deep_request(&mut self, id: OpId, bbox: Bbox, channels: &ChannelSet, count: u32, ctx: &Context) -> Result<()> {
        self.check_declared(id, channels, ctx)?;
        self.deep_request_node(id, bbox, channels, count, ctx)
    }

    fn deep_request_node(&mut self, id: OpId, bbox: Bbox, channels: &ChannelSet, count: u32, ctx: &Context) -> Result<()> {
        self.check_registered(channels, ctx)?;
        let node = self.node_mut(id)?;
        if !matches!(node.state, NodeState::Valid | NodeState::Ready) {
            return Err(GraphError::Request(format!("{} requested before validate", node.name)));
        }
        if !node.kind.is_deep() {
            return self.request_node(id, bbox, channels, count, ctx);
        }
        let Some(deep_info) = node.deep_info.clone() else {
            return Err(GraphError::Request(format!("{} has no deep output", node.name)));
        };
        let channels = channels.intersection(&deep_info.channels);
        node.deep_request.accumulate(bbox, &channels, count);
        node.state = NodeState::Ready;
        trace!(op = %node.name, %bbox, count, "deep request");

        let requests = match node.kind.deep_op() {
            Some(op) => op.get_deep_requests(&deep_info, node.inputs.len(), &bbox, &channels, count),
            None => Vec::new(),
        };
        self.propagate(id, requests, ctx)
    }

    fn propagate(&mut self, id: OpId, requests: Vec<InputRequest>, ctx: &Context) -> Result<()> {
        for req in requests {
            let Some(src) = self.node(id)?.inputs.get(req.input).copied().flatten() else {
                continue;
            };
            if req.deep {
                self.deep_request_node(src, req.bbox, &req.channels, req.count, ctx)?;
            } else {
                self.request_node(src, req.bbox, &req.channels, req.count, ctx)?;
            }
        }
        Ok(())
    }

    /// Clears accumulated requests of `id` and everything upstream.
    ///
    /// Cached lines survive; they are keyed by hash.
    pub fn forget_request(&mut self, id: OpId) -> Result<()> {
        let mut all = self.upstream(id);
        all.insert(id);
        for cur in all {
            let node = self.node_mut(cur)?;
            node.request = RequestState::default();
            node.deep_request = RequestState::default();
            if node.state == NodeState::Ready {
                node.state = NodeState::Valid;
            }
        }
        Ok(())
    }

    /// Accumulated flat request of an operator: box, channels, count.
    pub fn requested(&self, id: OpId) -> Result<Option<(Bbox, ChannelSet, u32)>> {
        let req = &self.node(id)?.request;
        Ok(req.bbox.map(|b| (b, req.channels.clone(), req.count)))
    }

    /// Accumulated deep request of an operator.
    pub fn deep_requested(&self, id: OpId) -> Result<Option<(Bbox, ChannelSet, u32)>> {
        let req = &self.node(id)?.deep_request;
        Ok(req.bbox.map(|b| (b, req.channels.clone(), req.count)))
    }

    /// Forces the row cache on or off; `None` restores the automatic
    /// choice.
    pub fn set_cached(&mut self, id: OpId, cached: Option<bool>) -> Result<()> {
        let node = self.node_mut(id)?;
        node.force_cache = cached;
        if cached == Some(false) {
            node.cache = None;
        }
        Ok(())
    }

    /// Counters of an operator's row cache.
    pub fn cache_stats(&self, id: OpId) -> Result<Option<CacheStats>> {
        Ok(self.node(id)?.cache.as_ref().map(|c| c.stats()))
    }

    /// Fills `row[channels][x..r)` for scanline `y` of `id`.
    ///
    /// Engine failures other than an abort are also reported through the
    /// context.
    #[allow(clippy::too_many_arguments)]
    pub fn engine(&self, id: OpId, ctx: &Context, y: i32, x: i32, r: i32, channels: &ChannelSet, row: &mut Row) -> Result<()> {
        self.engine_node(id, ctx, y, x, r, channels, row)
            .inspect_err(|e| self.report(id, ctx, e))
    }

    fn report(&self, id: OpId, ctx: &Context, err: &GraphError) {
        if err.is_aborted() || matches!(err, GraphError::CachePoisoned) {
            return;
        }
        let name = self.node(id).map(|n| n.name.as_str()).unwrap_or("?");
        let severity = if err.is_soft() { Severity::Soft } else { Severity::Hard };
        ctx.report(severity, name, err.to_string());
    }

    fn flat_face<'g>(&'g self, id: OpId) -> Result<(&'g Node, &'g dyn Iop)> {
        let node = self.node(id)?;
        match node.kind.iop() {
            Some(op) => Ok((node, op)),
            None => Err(GraphError::Request(format!("{} has no flat output", node.name))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn engine_node(
        &self,
        id: OpId,
        ctx: &Context,
        y: i32,
        x: i32,
        r: i32,
        channels: &ChannelSet,
        row: &mut Row,
    ) -> Result<()> {
        if ctx.aborted() {
            return Err(GraphError::Aborted);
        }
        let (node, op) = self.flat_face(id)?;
        let Some(requested) = node.request.bbox else {
            return Err(GraphError::Request(format!("{} engine called before request", node.name)));
        };
        if x >= r {
            return Ok(());
        }
        if row.x() > x || row.r() < r {
            row.range(row.x().min(x), row.r().max(r));
        }
        let last = ctx.world().channels.last_channel();
        let chans = channels.intersection(&node.info.channels);
        let outside = channels.difference(&node.info.channels);
        row.erase_set(&outside, last);
        if chans.is_empty() {
            return Ok(());
        }

        let area = requested.intersect(&node.info.bbox);
        let cy = area.clamp_y(y);
        let lo = x.max(area.x());
        let hi = r.min(area.r());
        if lo >= hi {
            let col = if r <= area.x() { area.x() } else { area.r() - 1 };
            let mut one = Row::new(col, col + 1);
            self.engine_clamped(id, node, op, ctx, cy, col, col + 1, &chans, &mut one)?;
            for ch in chans.iter().take_while(|c| *c <= last) {
                let v = one.at(ch, col);
                if v == 0.0 && one.is_zero(ch) {
                    row.erase(ch);
                } else {
                    row.fill(ch, x, r, v);
                }
            }
            return Ok(());
        }

        self.engine_clamped(id, node, op, ctx, cy, lo, hi, &chans, row)?;
        if lo > x || hi < r {
            for ch in chans.iter().take_while(|c| *c <= last) {
                if !row.is_zero(ch) {
                    row.replicate_edges(ch, x, lo, hi, r);
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn engine_clamped(
        &self,
        id: OpId,
        node: &Node,
        op: &dyn Iop,
        ctx: &Context,
        y: i32,
        x: i32,
        r: i32,
        chans: &ChannelSet,
        row: &mut Row,
    ) -> Result<()> {
        let last = ctx.world().channels.last_channel();
        let out = chans.intersection(&node.out_channels);
        let pass = chans.difference(&out);
        if !pass.is_empty() {
            match node.inputs.get(op.raw_channels_from()).copied().flatten() {
                Some(src) => self.engine_node(src, ctx, y, x, r, &pass, row)?,
                None => row.erase_set(&pass, last),
            }
        }
        if out.is_empty() {
            return Ok(());
        }

        let cx = EngineCx {
            graph: self,
            id,
            node,
            ctx,
        };
        match &node.cache {
            Some(cache) if node.force_cache != Some(false) => {
                let area = cx.request_area();
                let full = node
                    .request
                    .channels
                    .intersection(&node.out_channels)
                    .union(&out);
                let line = cache.get_or_fill(
                    y,
                    node.hash,
                    |d| d.covers(x, r, &out),
                    || {
                        let (lx, lr) = (area.x().min(x), area.r().max(r));
                        let mut tmp = Row::new(lx, lr);
                        op.engine(&cx, y, lx, lr, &full, &mut tmp)?;
                        cx.check_abort()?;
                        Ok(LineData::from_row(&mut tmp, y, &full, last))
                    },
                )?;
                line.write_to(row, &out, last);
                Ok(())
            }
            _ => op.engine(&cx, y, x, r, &out, row),
        }
    }

    /// One scanline of `id` as shareable blocks.
    pub fn fetch_line(&self, id: OpId, ctx: &Context, y: i32, x: i32, r: i32, channels: &ChannelSet) -> Result<Arc<LineData>> {
        let last = ctx.world().channels.last_channel();
        let mut row = Row::new(x, r);
        self.engine_node(id, ctx, y, x, r, channels, &mut row)?;
        Ok(Arc::new(LineData::from_row(&mut row, y, channels, last)))
    }

    /// Fills a whole plane of `id`, reporting failures through the
    /// context.
    pub fn fetch_plane(&self, id: OpId, ctx: &Context, bbox: Bbox, channels: &ChannelSet, packed: bool) -> Result<ImagePlane> {
        self.fetch_plane_node(id, ctx, bbox, channels, packed)
            .inspect_err(|e| self.report(id, ctx, e))
    }

    pub(crate) fn fetch_plane_node(
        &self,
        id: OpId,
        ctx: &Context,
        bbox: Bbox,
        channels: &ChannelSet,
        packed: bool,
    ) -> Result<ImagePlane> {
        if ctx.aborted() {
            return Err(GraphError::Aborted);
        }
        let last = ctx.world().channels.last_channel();
        let channels = bounded(channels, last);
        let (node, op) = self.flat_face(id)?;
        let mut plane = ImagePlane::new(bbox, &channels, packed);

        let area = node
            .request
            .bbox
            .map(|b| b.intersect(&node.info.bbox));
        let direct = op.supports_planes()
            && node.out_channels.contains_set(&channels)
            && area.is_some_and(|a| a.contains_box(&bbox));
        if direct {
            let cx = EngineCx {
                graph: self,
                id,
                node,
                ctx,
            };
            op.fetch_plane(&cx, &mut plane)?;
            cx.check_abort()?;
            return Ok(plane);
        }

        let mut row = Row::new(bbox.x(), bbox.r());
        for y in bbox.rows() {
            self.engine_node(id, ctx, y, bbox.x(), bbox.r(), &channels, &mut row)?;
            for ch in channels.explicit() {
                if !row.is_zero(ch) {
                    plane.write_row(y, ch, bbox.x(), row.channel(ch));
                }
            }
        }
        Ok(plane)
    }

    /// The producer-owned plane of `id` covering `bbox` x `channels`, if
    /// the operator keeps one.
    pub fn shared_plane(&self, id: OpId, ctx: &Context, bbox: Bbox, channels: &ChannelSet) -> Result<Option<Arc<ImagePlane>>> {
        self.shared_plane_node(id, ctx, bbox, channels)
            .inspect_err(|e| self.report(id, ctx, e))
    }

    pub(crate) fn shared_plane_node(
        &self,
        id: OpId,
        ctx: &Context,
        bbox: Bbox,
        channels: &ChannelSet,
    ) -> Result<Option<Arc<ImagePlane>>> {
        if ctx.aborted() {
            return Err(GraphError::Aborted);
        }
        let (node, op) = self.flat_face(id)?;
        let covered = node
            .request
            .bbox
            .is_some_and(|b| b.intersect(&node.info.bbox).contains_box(&bbox));
        if !covered || !node.out_channels.contains_set(channels) {
            return Ok(None);
        }
        let cx = EngineCx {
            graph: self,
            id,
            node,
            ctx,
        };
        let plane = op.shared_plane(&cx, bbox, channels)?;
        Ok(plane.filter(|p| p.bbox().contains_box(&bbox) && p.channels().contains_set(channels)))
    }

    /// Deep samples of `bbox`, reporting failures through the context.
    pub fn deep_engine(&self, id: OpId, ctx: &Context, bbox: Bbox, channels: &ChannelSet) -> Result<DeepPlane> {
        self.deep_engine_node(id, ctx, bbox, channels)
            .inspect_err(|e| self.report(id, ctx, e))
    }

    pub(crate) fn deep_engine_node(&self, id: OpId, ctx: &Context, bbox: Bbox, channels: &ChannelSet) -> Result<DeepPlane> {
        if ctx.aborted() {
            return Err(GraphError::Aborted);
        }
        let node = self.node(id)?;
        let Some(op) = node.kind.deep_op() else {
            return Err(GraphError::Request(format!("{} has no deep output", node.name)));
        };
        if node.deep_request.bbox.is_none() {
            return Err(GraphError::Request(format!("{} deep engine called before request", node.name)));
        }
        let cx = EngineCx {
            graph: self,
            id,
            node,
            ctx,
        };
        let plane = op.do_deep_engine(&cx, bbox, channels)?;
        cx.check_abort()?;
        Ok(plane)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::Info;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vfx_core::{Channel, World};

    struct Ramp {
        bbox: Bbox,
        calls: Arc<AtomicUsize>,
    }

    impl crate::op::Op for Ramp {
        fn class(&self) -> &'static str {
            "Ramp"
        }
        fn minimum_inputs(&self) -> usize {
            0
        }
    }

    impl Iop for Ramp {
        fn validate(&mut self, _cx: &ValidateCx<'_>, _real: bool) -> Result<Info> {
            Ok(Info::new(self.bbox, ChannelSet::rgba()))
        }

        fn engine(&self, _cx: &EngineCx<'_>, y: i32, x: i32, r: i32, channels: &ChannelSet, row: &mut Row) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            for ch in channels.explicit() {
                for xx in x..r {
                    row.span_mut(ch, xx, xx + 1)[0] = (xx + 10 * y) as f32;
                }
            }
            Ok(())
        }
    }

    struct Gain(f32);

    impl crate::op::Op for Gain {
        fn class(&self) -> &'static str {
            "Gain"
        }
        fn append_hash(&self, hash: &mut dyn Hasher) {
            hash.write_u32(self.0.to_bits());
        }
    }

    impl Iop for Gain {
        fn validate(&mut self, cx: &ValidateCx<'_>, _real: bool) -> Result<Info> {
            Ok(cx.require_input(0)?.clone())
        }

        fn out_channels(&self, _info: &Info) -> ChannelSet {
            ChannelSet::red()
        }

        fn engine(&self, cx: &EngineCx<'_>, y: i32, x: i32, r: i32, channels: &ChannelSet, row: &mut Row) -> Result<()> {
            cx.input_row(0, y, x, r, channels, row)?;
            for ch in channels.explicit() {
                for v in row.span_mut(ch, x, r) {
                    *v *= self.0;
                }
            }
            Ok(())
        }
    }

    fn ramp(graph: &mut Graph, bbox: Bbox) -> (OpId, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let id = graph.add_iop(
            "Ramp1",
            Ramp {
                bbox,
                calls: calls.clone(),
            },
        );
        (id, calls)
    }

    fn ctx() -> Context {
        Context::new(World::new())
    }

    #[test]
    fn test_engine_before_request_fails() {
        let mut graph = Graph::with_arena(Arc::new(CacheArena::default()));
        let (id, _) = ramp(&mut graph, Bbox::new(0, 0, 4, 4));
        let ctx = ctx();
        graph.validate(id, &ctx, true).unwrap();
        let mut row = Row::new(0, 4);
        let err = graph.engine_node(id, &ctx, 0, 0, 4, &ChannelSet::rgb(), &mut row).unwrap_err();
        assert!(matches!(err, GraphError::Request(_)));
    }

    #[test]
    fn test_request_before_validate_fails() {
        let mut graph = Graph::with_arena(Arc::new(CacheArena::default()));
        let (id, _) = ramp(&mut graph, Bbox::new(0, 0, 4, 4));
        let err = graph
            .request(id, Bbox::new(0, 0, 4, 4), &ChannelSet::rgb(), 1, &ctx())
            .unwrap_err();
        assert!(matches!(err, GraphError::Request(_)));
    }

    #[test]
    fn test_unregistered_channel_rejected() {
        let mut graph = Graph::with_arena(Arc::new(CacheArena::default()));
        let (id, _) = ramp(&mut graph, Bbox::new(0, 0, 4, 4));
        let ctx = ctx();
        graph.validate(id, &ctx, true).unwrap();
        let bogus = ChannelSet::from_slice(&[Channel::new(900)]);
        assert!(graph.request(id, Bbox::new(0, 0, 4, 4), &bogus, 1, &ctx).is_err());
    }

    #[test]
    fn test_undeclared_channels_fail_in_strict_mode() {
        let mut graph = Graph::with_arena(Arc::new(CacheArena::default()));
        let (id, _) = ramp(&mut graph, Bbox::new(0, 0, 4, 4));
        let depth = ChannelSet::from_slice(&[Channel::RED, Channel::Z]);

        let lenient = ctx();
        graph.validate(id, &lenient, true).unwrap();
        graph.request(id, Bbox::new(0, 0, 4, 4), &depth, 1, &lenient).unwrap();

        let strict = ctx().with_strict(true);
        graph.validate(id, &strict, true).unwrap();
        let err = graph.request(id, Bbox::new(0, 0, 4, 4), &depth, 1, &strict).unwrap_err();
        assert!(matches!(err, GraphError::Request(_)));
        graph.request(id, Bbox::new(0, 0, 4, 4), &ChannelSet::rgba(), 1, &strict).unwrap();
    }

    #[test]
    fn test_edges_repeat_outside_box() {
        let mut graph = Graph::with_arena(Arc::new(CacheArena::default()));
        let (id, _) = ramp(&mut graph, Bbox::new(2, 2, 5, 5));
        let ctx = ctx();
        graph.validate(id, &ctx, true).unwrap();
        graph.request(id, Bbox::new(0, 0, 8, 8), &ChannelSet::red(), 1, &ctx).unwrap();
        let mut row = Row::new(0, 8);
        graph.engine(id, &ctx, 7, 0, 8, &ChannelSet::red(), &mut row).unwrap();
        // y clamps to 4, x to 2..5
        assert_eq!(row.channel(Channel::RED), &[42.0, 42.0, 42.0, 43.0, 44.0, 44.0, 44.0, 44.0]);
    }

    #[test]
    fn test_row_left_of_box_is_constant() {
        let mut graph = Graph::with_arena(Arc::new(CacheArena::default()));
        let (id, _) = ramp(&mut graph, Bbox::new(10, 0, 20, 1));
        let ctx = ctx();
        graph.validate(id, &ctx, true).unwrap();
        graph.request(id, Bbox::new(0, 0, 30, 1), &ChannelSet::red(), 1, &ctx).unwrap();
        let mut row = Row::new(0, 5);
        graph.engine(id, &ctx, 0, 0, 5, &ChannelSet::red(), &mut row).unwrap();
        assert!(row.channel(Channel::RED).iter().all(|v| *v == 10.0));
    }

    #[test]
    fn test_channels_outside_info_are_zero() {
        let mut graph = Graph::with_arena(Arc::new(CacheArena::default()));
        let (id, _) = ramp(&mut graph, Bbox::new(0, 0, 4, 4));
        let ctx = ctx();
        graph.validate(id, &ctx, true).unwrap();
        graph.request(id, Bbox::new(0, 0, 4, 4), &ChannelSet::all(), 1, &ctx).unwrap();
        let mut row = Row::new(0, 4);
        let set = ChannelSet::from_slice(&[Channel::RED, Channel::Z]);
        graph.engine(id, &ctx, 1, 0, 4, &set, &mut row).unwrap();
        assert!(row.is_zero(Channel::Z));
        assert_eq!(row.at(Channel::RED, 3), 13.0);
    }

    #[test]
    fn test_pass_through_skips_engine() {
        let mut graph = Graph::with_arena(Arc::new(CacheArena::default()));
        let (src, _) = ramp(&mut graph, Bbox::new(0, 0, 4, 4));
        let gain = graph.add_iop("Gain1", Gain(2.0));
        graph.set_input(gain, 0, Some(src)).unwrap();
        let ctx = ctx();
        graph.validate(gain, &ctx, true).unwrap();
        graph.request(gain, Bbox::new(0, 0, 4, 4), &ChannelSet::rgb(), 1, &ctx).unwrap();
        let mut row = Row::new(0, 4);
        graph.engine(gain, &ctx, 0, 0, 4, &ChannelSet::rgb(), &mut row).unwrap();
        assert_eq!(row.at(Channel::RED, 1), 2.0);
        assert_eq!(row.at(Channel::GREEN, 1), 1.0);
    }

    #[test]
    fn test_two_requests_enable_cache() {
        let mut graph = Graph::with_arena(Arc::new(CacheArena::default()));
        let (src, calls) = ramp(&mut graph, Bbox::new(0, 0, 8, 2));
        let ctx = ctx();
        graph.validate(src, &ctx, true).unwrap();
        graph.request(src, Bbox::new(0, 0, 4, 2), &ChannelSet::red(), 1, &ctx).unwrap();
        graph.request(src, Bbox::new(4, 0, 8, 2), &ChannelSet::red(), 1, &ctx).unwrap();
        let (bbox, _, count) = graph.requested(src).unwrap().unwrap();
        assert_eq!(bbox, Bbox::new(0, 0, 8, 2));
        assert_eq!(count, 2);
        let mut row = Row::new(0, 4);
        graph.engine(src, &ctx, 0, 0, 4, &ChannelSet::red(), &mut row).unwrap();
        let mut row = Row::new(4, 8);
        graph.engine(src, &ctx, 0, 4, 8, &ChannelSet::red(), &mut row).unwrap();
        assert_eq!(row.at(Channel::RED, 6), 6.0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = graph.cache_stats(src).unwrap().unwrap();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn test_cycle_rejected() {
        let mut graph = Graph::with_arena(Arc::new(CacheArena::default()));
        let a = graph.add_iop("A", Gain(1.0));
        let b = graph.add_iop("B", Gain(1.0));
        graph.set_input(b, 0, Some(a)).unwrap();
        assert!(matches!(graph.set_input(a, 0, Some(b)), Err(GraphError::Cycle(_))));
        assert!(matches!(graph.set_input(a, 0, Some(a)), Err(GraphError::Cycle(_))));
    }

    #[test]
    fn test_validate_error_is_sticky() {
        let mut graph = Graph::with_arena(Arc::new(CacheArena::default()));
        let gain = graph.add_iop("Gain1", Gain(1.0));
        let ctx = ctx();
        assert!(graph.validate(gain, &ctx, true).is_err());
        assert!(matches!(graph.state(gain).unwrap(), NodeState::Error(_)));
        let err = graph.validate(gain, &ctx, true).unwrap_err();
        assert!(err.to_string().contains("Gain1"));
        let (src, _) = ramp(&mut graph, Bbox::new(0, 0, 2, 2));
        graph.set_input(gain, 0, Some(src)).unwrap();
        assert!(graph.validate(gain, &ctx, true).is_ok());
    }

    #[test]
    fn test_hash_follows_parameters() {
        let mut graph = Graph::with_arena(Arc::new(CacheArena::default()));
        let (src, _) = ramp(&mut graph, Bbox::new(0, 0, 2, 2));
        let gain = graph.add_iop("Gain1", Gain(1.0));
        graph.set_input(gain, 0, Some(src)).unwrap();
        let ctx = ctx();
        graph.validate(gain, &ctx, true).unwrap();
        let h1 = graph.hash(gain).unwrap();
        if let OpKind::Flat(op) = graph.op_mut(gain).unwrap() {
            *op = Box::new(Gain(3.0));
        }
        assert_eq!(graph.state(gain).unwrap(), &NodeState::Invalid);
        graph.validate(gain, &ctx, true).unwrap();
        assert_ne!(h1, graph.hash(gain).unwrap());
    }

    #[test]
    fn test_stale_handle_rejected() {
        let mut graph = Graph::with_arena(Arc::new(CacheArena::default()));
        let (a, _) = ramp(&mut graph, Bbox::new(0, 0, 2, 2));
        graph.remove(a).unwrap();
        let (b, _) = ramp(&mut graph, Bbox::new(0, 0, 2, 2));
        assert_eq!(a.index(), b.index());
        assert!(matches!(graph.node(a), Err(GraphError::UnknownOp(_))));
        assert!(graph.node(b).is_ok());
    }

    #[test]
    fn test_forget_request_resets_upstream() {
        let mut graph = Graph::with_arena(Arc::new(CacheArena::default()));
        let (src, _) = ramp(&mut graph, Bbox::new(0, 0, 4, 4));
        let gain = graph.add_iop("Gain1", Gain(2.0));
        graph.set_input(gain, 0, Some(src)).unwrap();
        let ctx = ctx();
        graph.validate(gain, &ctx, true).unwrap();
        graph.request(gain, Bbox::new(0, 0, 4, 4), &ChannelSet::rgb(), 1, &ctx).unwrap();
        assert!(graph.requested(src).unwrap().is_some());
        graph.forget_request(gain).unwrap();
        assert!(graph.requested(src).unwrap().is_none());
        assert_eq!(graph.state(src).unwrap(), &NodeState::Valid);
    }
}
