//! Rectangular read access to an operator's output.
//!
//! # Overview
//!
//! - [`Interest`] pins whatever lines of a region are already resident in
//!   an operator's row cache. It never computes anything.
//! - [`Tile`] is an interest completed by computing the missing lines,
//!   optionally in parallel.
//! - [`GeneralTile`] wraps an [`ImagePlane`] fetched in a chosen layout.
//! - [`BufferTile`] shares a plane the producer keeps, such as a planar
//!   operator's stripe, and falls back to a private copy.
//!
//! All of them implement [`TileAccess`]; [`InputTile`] is the closed set
//! an operator picks from at validate time.
//!
//! An abort during construction does not fail: the tile comes back with
//! [`valid`](TileAccess::valid) false and black where lines are missing.
//!
//! # Usage
//!
//! ```rust,ignore
//! let tile = cx.input_tile(0, bbox.pad_uniform(2), &channels, true)?;
//! if !tile.valid() {
//!     return Err(GraphError::Aborted);
//! }
//! let v = tile.at(x - 1, y, Channel::RED);
//! ```

use std::sync::Arc;

#[cfg(feature = "parallel")]
use rayon::prelude::*;
use tracing::trace;
use vfx_core::{Bbox, Channel, ChannelSet};

use crate::cache::LineData;
use crate::context::Context;
use crate::graph::{Graph, OpId};
use crate::op::EngineCx;
use crate::plane::{ImagePlane, StridedRow};
use crate::{GraphError, Result};

/// Common read interface of every tile shape.
pub trait TileAccess {
    /// Covered region.
    fn bbox(&self) -> Bbox;

    /// Channels held.
    fn channels(&self) -> &ChannelSet;

    /// Value at `(x, y)`, replicating edges outside the region.
    fn at(&self, x: i32, y: i32, ch: Channel) -> f32;

    /// One channel of row `y`, clamped into the region.
    fn row(&self, y: i32, ch: Channel) -> StridedRow<'_>;

    /// False if construction was cut short by an abort.
    fn valid(&self) -> bool;
}

/// Lines of a region already resident in an operator's cache.
#[derive(Debug, Clone)]
pub struct Interest {
    bbox: Bbox,
    channels: ChannelSet,
    lines: Vec<Option<Arc<LineData>>>,
}

impl Interest {
    /// Pins resident lines of `bbox` x `channels` of `id`.
    pub fn new(graph: &Graph, id: OpId, bbox: Bbox, channels: &ChannelSet) -> Result<Self> {
        let node = graph.node(id)?;
        let lines = bbox
            .rows()
            .map(|y| {
                node.cache
                    .as_ref()
                    .and_then(|c| c.peek(y, node.hash))
                    .filter(|l| l.covers(bbox.x(), bbox.r(), channels))
            })
            .collect();
        Ok(Self {
            bbox,
            channels: channels.clone(),
            lines,
        })
    }

    /// Region of interest.
    pub fn bbox(&self) -> Bbox {
        self.bbox
    }

    /// Number of pinned lines.
    pub fn resident(&self) -> usize {
        self.lines.iter().filter(|l| l.is_some()).count()
    }

    /// True once every line is pinned.
    pub fn is_complete(&self) -> bool {
        self.lines.iter().all(Option::is_some)
    }

    /// A pinned line.
    pub fn line(&self, y: i32) -> Option<&LineData> {
        if y < self.bbox.y() || y >= self.bbox.t() {
            return None;
        }
        self.lines[(y - self.bbox.y()) as usize].as_deref()
    }

    /// Computes the missing lines and turns the interest into a tile.
    pub fn complete(self, graph: &Graph, id: OpId, ctx: &Context, multithreaded: bool) -> Result<Tile> {
        let Interest {
            bbox,
            channels,
            lines,
        } = self;
        let last = ctx.world().channels.last_channel();
        let missing: Vec<i32> = bbox
            .rows()
            .zip(lines.iter())
            .filter(|(_, l)| l.is_none())
            .map(|(y, _)| y)
            .collect();
        trace!(%bbox, missing = missing.len(), "tile fill");

        let fetch = |y: i32| graph.fetch_line(id, ctx, y, bbox.x(), bbox.r(), &channels);
        let fetched: Vec<(i32, Result<Arc<LineData>>)> = if multithreaded {
            fill_parallel(&missing, fetch)
        } else {
            let mut out = Vec::with_capacity(missing.len());
            for &y in &missing {
                let res = fetch(y);
                let stop = res.is_err();
                out.push((y, res));
                if stop {
                    break;
                }
            }
            out
        };

        let mut lines = lines;
        let mut valid = true;
        for (y, res) in fetched {
            match res {
                Ok(line) => lines[(y - bbox.y()) as usize] = Some(line),
                Err(GraphError::Aborted | GraphError::CachePoisoned) => valid = false,
                Err(e) => return Err(e),
            }
        }
        if ctx.aborted() {
            valid = false;
        }
        let lines = bbox
            .rows()
            .zip(lines)
            .map(|(y, l)| l.unwrap_or_else(|| Arc::new(LineData::black(y, bbox.x(), bbox.r(), &channels, last))))
            .collect();
        Ok(Tile {
            bbox,
            channels,
            lines,
            valid,
        })
    }
}

#[cfg(feature = "parallel")]
fn fill_parallel<F>(ys: &[i32], fetch: F) -> Vec<(i32, Result<Arc<LineData>>)>
where
    F: Fn(i32) -> Result<Arc<LineData>> + Sync,
{
    ys.par_iter().map(|&y| (y, fetch(y))).collect()
}

#[cfg(not(feature = "parallel"))]
fn fill_parallel<F>(ys: &[i32], fetch: F) -> Vec<(i32, Result<Arc<LineData>>)>
where
    F: Fn(i32) -> Result<Arc<LineData>>,
{
    ys.iter().map(|&y| (y, fetch(y))).collect()
}

/// A fully computed region backed by cache lines.
#[derive(Debug, Clone)]
pub struct Tile {
    bbox: Bbox,
    channels: ChannelSet,
    lines: Vec<Arc<LineData>>,
    valid: bool,
}

impl Tile {
    /// Computes `bbox` x `channels` of `id`, reusing resident lines.
    pub fn new(
        graph: &Graph,
        id: OpId,
        ctx: &Context,
        bbox: Bbox,
        channels: &ChannelSet,
        multithreaded: bool,
    ) -> Result<Self> {
        Interest::new(graph, id, bbox, channels)?.complete(graph, id, ctx, multithreaded)
    }

    /// An all-black tile.
    pub fn black(bbox: Bbox, channels: &ChannelSet, last: Channel) -> Self {
        let lines = bbox
            .rows()
            .map(|y| Arc::new(LineData::black(y, bbox.x(), bbox.r(), channels, last)))
            .collect();
        Self {
            bbox,
            channels: channels.clone(),
            lines,
            valid: true,
        }
    }

    /// The cache line holding row `y`, clamped into the region.
    pub fn line(&self, y: i32) -> &LineData {
        let y = self.bbox.clamp_y(y);
        &self.lines[(y - self.bbox.y()) as usize]
    }
}

impl TileAccess for Tile {
    fn bbox(&self) -> Bbox {
        self.bbox
    }

    fn channels(&self) -> &ChannelSet {
        &self.channels
    }

    fn at(&self, x: i32, y: i32, ch: Channel) -> f32 {
        self.line(y).at(ch, self.bbox.clamp_x(x))
    }

    fn row(&self, y: i32, ch: Channel) -> StridedRow<'_> {
        self.line(y).row(ch)
    }

    fn valid(&self) -> bool {
        self.valid
    }
}

/// A tile over a plane fetched in a chosen layout.
#[derive(Debug, Clone)]
pub struct GeneralTile {
    plane: ImagePlane,
    valid: bool,
}

impl GeneralTile {
    /// Wraps a plane.
    pub fn from_plane(plane: ImagePlane, valid: bool) -> Self {
        Self { plane, valid }
    }

    /// The underlying plane.
    pub fn plane(&self) -> &ImagePlane {
        &self.plane
    }

    /// True if channels are interleaved.
    pub fn packed(&self) -> bool {
        self.plane.packed()
    }
}

impl TileAccess for GeneralTile {
    fn bbox(&self) -> Bbox {
        self.plane.bbox()
    }

    fn channels(&self) -> &ChannelSet {
        self.plane.channels()
    }

    fn at(&self, x: i32, y: i32, ch: Channel) -> f32 {
        self.plane.at(x, y, ch)
    }

    fn row(&self, y: i32, ch: Channel) -> StridedRow<'_> {
        self.plane.row(y, ch)
    }

    fn valid(&self) -> bool {
        self.valid
    }
}

/// A tile reading directly from a producer-owned plane.
#[derive(Debug, Clone)]
pub struct BufferTile {
    plane: Arc<ImagePlane>,
    valid: bool,
}

impl BufferTile {
    /// Shares a producer's plane.
    pub fn new(plane: Arc<ImagePlane>, valid: bool) -> Self {
        Self { plane, valid }
    }

    /// The shared plane.
    pub fn plane(&self) -> &Arc<ImagePlane> {
        &self.plane
    }
}

impl TileAccess for BufferTile {
    fn bbox(&self) -> Bbox {
        self.plane.bbox()
    }

    fn channels(&self) -> &ChannelSet {
        self.plane.channels()
    }

    fn at(&self, x: i32, y: i32, ch: Channel) -> f32 {
        self.plane.at(x, y, ch)
    }

    fn row(&self, y: i32, ch: Channel) -> StridedRow<'_> {
        self.plane.row(y, ch)
    }

    fn valid(&self) -> bool {
        self.valid
    }
}

/// Which tile shape to read an input through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TileKind {
    /// Row cache lines.
    #[default]
    Rows,
    /// Interleaved plane.
    Packed,
    /// Channel-planar plane.
    Unpacked,
    /// Producer-owned plane.
    Buffer,
}

/// One of the tile shapes, behind a single dispatch.
#[derive(Debug, Clone)]
pub enum InputTile {
    /// Row cache.
    Rows(Tile),
    /// Plane in packed or unpacked layout.
    General(GeneralTile),
    /// Producer-owned plane.
    Buffer(BufferTile),
}

impl InputTile {
    /// Reads `bbox` x `channels` of input `i` through the given shape.
    pub fn fetch(
        cx: &EngineCx<'_>,
        i: usize,
        kind: TileKind,
        bbox: Bbox,
        channels: &ChannelSet,
        multithreaded: bool,
    ) -> Result<Self> {
        Ok(match kind {
            TileKind::Rows => InputTile::Rows(cx.input_tile(i, bbox, channels, multithreaded)?),
            TileKind::Packed => InputTile::General(cx.input_general_tile(i, bbox, channels, true)?),
            TileKind::Unpacked => InputTile::General(cx.input_general_tile(i, bbox, channels, false)?),
            TileKind::Buffer => InputTile::Buffer(BufferTile::new(cx.input_buffer(i, bbox, channels)?, !cx.aborted())),
        })
    }

    /// Which shape this is.
    pub fn kind(&self) -> TileKind {
        match self {
            InputTile::Rows(_) => TileKind::Rows,
            InputTile::General(t) if t.packed() => TileKind::Packed,
            InputTile::General(_) => TileKind::Unpacked,
            InputTile::Buffer(_) => TileKind::Buffer,
        }
    }

    fn inner(&self) -> &dyn TileAccess {
        match self {
            InputTile::Rows(t) => t,
            InputTile::General(t) => t,
            InputTile::Buffer(t) => t,
        }
    }
}

impl TileAccess for InputTile {
    fn bbox(&self) -> Bbox {
        self.inner().bbox()
    }

    fn channels(&self) -> &ChannelSet {
        self.inner().channels()
    }

    fn at(&self, x: i32, y: i32, ch: Channel) -> f32 {
        self.inner().at(x, y, ch)
    }

    fn row(&self, y: i32, ch: Channel) -> StridedRow<'_> {
        self.inner().row(y, ch)
    }

    fn valid(&self) -> bool {
        self.inner().valid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheArena, CacheConfig};
    use crate::testing::{ctx, ramp, ramp_value};
    use std::sync::atomic::Ordering;

    fn requested(bbox: Bbox, budget: usize) -> (Graph, OpId, Context, Arc<std::sync::atomic::AtomicUsize>) {
        let mut graph = Graph::with_arena(Arc::new(CacheArena::new(CacheConfig::with_budget(budget))));
        let (id, calls) = ramp(&mut graph, bbox);
        graph.set_cached(id, Some(true)).unwrap();
        let ctx = ctx();
        graph.validate(id, &ctx, true).unwrap();
        graph.request(id, bbox, &ChannelSet::rgb(), 1, &ctx).unwrap();
        (graph, id, ctx, calls)
    }

    #[test]
    fn test_interest_pins_lines_past_eviction() {
        // a one-byte budget keeps only the newest line resident
        let (graph, id, ctx, calls) = requested(Bbox::new(0, 0, 8, 8), 1);
        graph.fetch_line(id, &ctx, 2, 0, 8, &ChannelSet::rgb()).unwrap();
        let interest = Interest::new(&graph, id, Bbox::new(0, 2, 8, 3), &ChannelSet::rgb()).unwrap();
        assert_eq!(interest.resident(), 1);
        assert!(interest.is_complete());

        for y in 3..7 {
            graph.fetch_line(id, &ctx, y, 0, 8, &ChannelSet::rgb()).unwrap();
        }
        assert_eq!(graph.cache_stats(id).unwrap().unwrap().lines, 1);
        assert!(Interest::new(&graph, id, Bbox::new(0, 2, 8, 3), &ChannelSet::rgb()).unwrap().resident() == 0);
        assert_eq!(interest.line(2).unwrap().at(Channel::RED, 5), ramp_value(5, 2));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_interest_completes_missing_lines_only() {
        let bbox = Bbox::new(0, 0, 6, 4);
        let (graph, id, ctx, calls) = requested(bbox, 1 << 20);
        graph.fetch_line(id, &ctx, 1, 0, 6, &ChannelSet::rgb()).unwrap();
        let interest = Interest::new(&graph, id, bbox, &ChannelSet::rgb()).unwrap();
        assert_eq!(interest.resident(), 1);
        let tile = interest.complete(&graph, id, &ctx, false).unwrap();
        assert!(tile.valid());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(tile.at(3, 3, Channel::GREEN), ramp_value(3, 3));
    }

    #[test]
    fn test_tile_invalid_after_abort() {
        let bbox = Bbox::new(0, 0, 4, 4);
        let (graph, id, ctx, _) = requested(bbox, 1 << 20);
        ctx.abort();
        let tile = Tile::new(&graph, id, &ctx, bbox, &ChannelSet::rgb(), false).unwrap();
        assert!(!tile.valid());
        assert_eq!(tile.bbox(), bbox);
    }

    #[test]
    fn test_parallel_fill_matches_serial() {
        let bbox = Bbox::new(-3, 2, 29, 21);
        let (serial_graph, serial_id, serial_ctx, _) = requested(bbox, 1 << 20);
        let (graph, id, ctx, _) = requested(bbox, 1 << 20);
        let serial = Tile::new(&serial_graph, serial_id, &serial_ctx, bbox, &ChannelSet::rgb(), false).unwrap();
        let parallel = Tile::new(&graph, id, &ctx, bbox, &ChannelSet::rgb(), true).unwrap();
        assert!(serial.valid() && parallel.valid());
        for (x, y) in bbox.iter() {
            for ch in ChannelSet::rgb().explicit() {
                assert_eq!(serial.at(x, y, ch), parallel.at(x, y, ch));
            }
        }
        assert_eq!(parallel.at(0, 20, Channel::BLUE), ramp_value(0, 20));
    }

    #[test]
    fn test_black_tile() {
        let tile = Tile::black(Bbox::new(0, 0, 4, 3), &ChannelSet::rgb(), Channel::ALPHA);
        assert!(tile.valid());
        assert_eq!(tile.at(2, 1, Channel::RED), 0.0);
        assert_eq!(tile.row(-5, Channel::GREEN).get(100), 0.0);
    }

    #[test]
    fn test_general_tile_clamps() {
        let bbox = Bbox::new(0, 0, 2, 2);
        let mut plane = ImagePlane::new(bbox, &ChannelSet::red(), true);
        plane.set(1, 1, Channel::RED, 4.0);
        let tile = GeneralTile::from_plane(plane, true);
        assert_eq!(tile.at(5, 5, Channel::RED), 4.0);
        assert_eq!(tile.row(1, Channel::RED).get(1), 4.0);
        let wrapped = InputTile::General(tile);
        assert_eq!(wrapped.kind(), TileKind::Packed);
        assert_eq!(wrapped.at(1, 1, Channel::RED), 4.0);
    }
}
