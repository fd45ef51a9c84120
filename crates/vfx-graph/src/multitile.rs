//! Operators reading a neighbourhood of their input through a tile.
//!
//! A [`MultiTileIop`] writes one engine, [`MultiTileIop::tile_engine`],
//! against the [`TileAccess`] interface. [`MultiTile`] picks the tile
//! shape at validate time from the input's preferred layout so a planar
//! producer is not forced through row copies.

use std::hash::Hasher;

use vfx_core::{Bbox, ChannelSet};

use crate::info::Info;
use crate::op::{EngineCx, InputRequest, Iop, Op, PackedPreference, ValidateCx};
use crate::row::Row;
use crate::tile::{InputTile, TileAccess, TileKind};
use crate::{GraphError, Result};

/// An operator computing rows from a tile of input 0.
pub trait MultiTileIop: Send + Sync {
    /// Class name.
    fn class(&self) -> &'static str;

    /// Parameter hash.
    fn append_hash(&self, _hash: &mut dyn Hasher) {}

    /// Required inputs.
    fn minimum_inputs(&self) -> usize {
        1
    }

    /// Output info.
    fn validate(&mut self, cx: &ValidateCx<'_>, for_real: bool) -> Result<Info>;

    /// Input region read to produce `bbox`.
    fn input_box(&self, bbox: &Bbox) -> Bbox {
        *bbox
    }

    /// Input channels needed for `channels`.
    fn in_channels(&self, channels: &ChannelSet) -> ChannelSet {
        channels.clone()
    }

    /// Channels rewritten.
    fn out_channels(&self, info: &Info) -> ChannelSet {
        info.channels.clone()
    }

    /// Tile shapes the engine accepts.
    fn accepts(&self, _kind: TileKind) -> bool {
        true
    }

    /// Fills `row[channels][x..r)` at `y` reading `tile`.
    #[allow(clippy::too_many_arguments)]
    fn tile_engine(
        &self,
        cx: &EngineCx<'_>,
        tile: &InputTile,
        y: i32,
        x: i32,
        r: i32,
        channels: &ChannelSet,
        row: &mut Row,
    ) -> Result<()>;
}

/// Adapter running a [`MultiTileIop`] in the graph.
#[derive(Debug, Clone)]
pub struct MultiTile<M> {
    op: M,
    kind: TileKind,
}

impl<M: MultiTileIop> MultiTile<M> {
    /// Wraps a tile operator.
    pub fn new(op: M) -> Self {
        Self {
            op,
            kind: TileKind::Rows,
        }
    }

    /// The wrapped operator.
    pub fn inner(&self) -> &M {
        &self.op
    }

    /// The wrapped operator, mutably.
    pub fn inner_mut(&mut self) -> &mut M {
        &mut self.op
    }

    /// Tile shape chosen at the last validate.
    pub fn tile_kind(&self) -> TileKind {
        self.kind
    }

    fn choose(&self, preference: PackedPreference) -> TileKind {
        let wanted = match preference {
            PackedPreference::Packed => TileKind::Packed,
            PackedPreference::Unpacked if self.op.accepts(TileKind::Buffer) => TileKind::Buffer,
            PackedPreference::Unpacked => TileKind::Unpacked,
            PackedPreference::DontCare => TileKind::Rows,
        };
        if self.op.accepts(wanted) { wanted } else { TileKind::Rows }
    }
}

impl<M: MultiTileIop> Op for MultiTile<M> {
    fn class(&self) -> &'static str {
        self.op.class()
    }

    fn minimum_inputs(&self) -> usize {
        self.op.minimum_inputs()
    }

    fn append_hash(&self, hash: &mut dyn Hasher) {
        self.op.append_hash(hash);
    }
}

impl<M: MultiTileIop> Iop for MultiTile<M> {
    fn validate(&mut self, cx: &ValidateCx<'_>, for_real: bool) -> Result<Info> {
        self.kind = self.choose(cx.input_preference(0));
        self.op.validate(cx, for_real)
    }

    fn in_channels(&self, _input: usize, channels: &ChannelSet) -> ChannelSet {
        self.op.in_channels(channels)
    }

    fn request(&self, _info: &Info, inputs: usize, bbox: &Bbox, channels: &ChannelSet, count: u32) -> Vec<InputRequest> {
        if inputs == 0 {
            return Vec::new();
        }
        // each output row reads a footprint of several input rows
        let span = Bbox::new(bbox.x(), bbox.y(), bbox.r(), bbox.y() + 1);
        let rows = self.op.input_box(&span).h().max(1) as u32;
        let count = if rows > 1 { count.saturating_mul(rows) } else { count };
        vec![InputRequest::flat(0, self.op.input_box(bbox), self.op.in_channels(channels), count)]
    }

    fn out_channels(&self, info: &Info) -> ChannelSet {
        self.op.out_channels(info)
    }

    fn engine(&self, cx: &EngineCx<'_>, y: i32, x: i32, r: i32, channels: &ChannelSet, row: &mut Row) -> Result<()> {
        let span = Bbox::new(x, y, r, y + 1);
        let need = self.op.in_channels(channels);
        let tile = InputTile::fetch(cx, 0, self.kind, self.op.input_box(&span), &need, false)?;
        if !tile.valid() {
            return Err(GraphError::Aborted);
        }
        self.op.tile_engine(cx, &tile, y, x, r, channels, row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use crate::testing::{ctx, planar_ramp, ramp, ramp_value};
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Mutex};
    use vfx_core::Channel;

    /// Vertical three-tap average.
    struct Smear;

    impl MultiTileIop for Smear {
        fn class(&self) -> &'static str {
            "Smear"
        }

        fn validate(&mut self, cx: &ValidateCx<'_>, _for_real: bool) -> Result<Info> {
            Ok(cx.require_input(0)?.clone())
        }

        fn input_box(&self, bbox: &Bbox) -> Bbox {
            bbox.pad(0, 1, 0, 1)
        }

        fn tile_engine(
            &self,
            _cx: &EngineCx<'_>,
            tile: &InputTile,
            y: i32,
            x: i32,
            r: i32,
            channels: &ChannelSet,
            row: &mut Row,
        ) -> Result<()> {
            for ch in channels.explicit() {
                for (v, xx) in row.span_mut(ch, x, r).iter_mut().zip(x..r) {
                    *v = (tile.at(xx, y - 1, ch) + tile.at(xx, y, ch) + tile.at(xx, y + 1, ch)) / 3.0;
                }
            }
            Ok(())
        }
    }

    /// Copies its input and remembers which buffers it was handed.
    #[derive(Default)]
    struct Echo {
        seen: Arc<Mutex<Vec<usize>>>,
    }

    impl MultiTileIop for Echo {
        fn class(&self) -> &'static str {
            "Echo"
        }

        fn validate(&mut self, cx: &ValidateCx<'_>, _for_real: bool) -> Result<Info> {
            Ok(cx.require_input(0)?.clone())
        }

        fn tile_engine(
            &self,
            _cx: &EngineCx<'_>,
            tile: &InputTile,
            y: i32,
            x: i32,
            r: i32,
            channels: &ChannelSet,
            row: &mut Row,
        ) -> Result<()> {
            if let InputTile::Buffer(buffer) = tile {
                self.seen.lock().unwrap().push(Arc::as_ptr(buffer.plane()) as usize);
            }
            for ch in channels.explicit() {
                for (v, xx) in row.span_mut(ch, x, r).iter_mut().zip(x..r) {
                    *v = tile.at(xx, y, ch);
                }
            }
            Ok(())
        }
    }

    #[test]
    fn test_footprint_enables_input_cache() {
        let mut graph = Graph::new();
        let bbox = Bbox::new(0, 0, 8, 8);
        let (src, calls) = ramp(&mut graph, bbox);
        let smear = graph.add_iop("Smear1", MultiTile::new(Smear));
        graph.set_inputs(smear, &[src]).unwrap();
        let ctx = ctx();
        graph.validate(smear, &ctx, true).unwrap();
        graph.request(smear, bbox, &ChannelSet::rgb(), 1, &ctx).unwrap();
        assert_eq!(graph.requested(src).unwrap().map(|(_, _, n)| n), Some(3));

        let mut row = Row::new(0, 8);
        for y in bbox.rows() {
            graph.engine(smear, &ctx, y, 0, 8, &ChannelSet::rgb(), &mut row).unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 8);
        graph.engine(smear, &ctx, 3, 0, 8, &ChannelSet::rgb(), &mut row).unwrap();
        assert_eq!(row.at(Channel::RED, 5), ramp_value(5, 3));
    }

    #[test]
    fn test_planar_input_is_shared_not_copied() {
        let mut graph = Graph::new();
        let bbox = Bbox::new(0, 0, 8, 8);
        let (src, renders) = planar_ramp(&mut graph, bbox, 0, false);
        let copy = Echo::default();
        let seen = copy.seen.clone();
        let id = graph.add_iop("Echo1", MultiTile::new(copy));
        graph.set_inputs(id, &[src]).unwrap();
        let ctx = ctx();
        graph.validate(id, &ctx, true).unwrap();
        graph.request(id, bbox, &ChannelSet::rgb(), 1, &ctx).unwrap();

        let mut row = Row::new(0, 8);
        for y in bbox.rows() {
            graph.engine(id, &ctx, y, 0, 8, &ChannelSet::rgb(), &mut row).unwrap();
            assert_eq!(row.at(Channel::GREEN, 6), ramp_value(6, y));
        }
        assert_eq!(renders.load(Ordering::SeqCst), 1);

        let owned = graph.shared_plane(src, &ctx, bbox, &ChannelSet::rgb()).unwrap().unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 8);
        assert!(seen.iter().all(|p| *p == Arc::as_ptr(&owned) as usize));
    }

    #[test]
    fn test_buffer_across_stripes_is_copied() {
        let mut graph = Graph::new();
        let bbox = Bbox::new(0, 0, 8, 8);
        let (src, _) = planar_ramp(&mut graph, bbox, 1, false);
        let smear = graph.add_iop("Smear1", MultiTile::new(Smear));
        graph.set_inputs(smear, &[src]).unwrap();
        let ctx = ctx();
        graph.validate(smear, &ctx, true).unwrap();
        graph.request(smear, bbox, &ChannelSet::rgb(), 1, &ctx).unwrap();

        let footprint = Bbox::new(0, 2, 8, 5);
        assert!(graph.shared_plane(src, &ctx, footprint, &ChannelSet::rgb()).unwrap().is_none());
        let mut row = Row::new(0, 8);
        graph.engine(smear, &ctx, 3, 0, 8, &ChannelSet::rgb(), &mut row).unwrap();
        assert_eq!(row.at(Channel::BLUE, 2), ramp_value(2, 3));
    }
}
