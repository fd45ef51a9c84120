//! Per-pixel operators.
//!
//! A [`PixelIop`] computes each output pixel from the input pixel at the
//! same location. [`PixelOp`] turns one into an [`Iop`]: it fetches the
//! needed input channels for the span and hands both rows to
//! [`PixelIop::pixel_engine`].
//!
//! # Usage
//!
//! ```rust
//! use vfx_core::ChannelSet;
//! use vfx_graph::{PixelIop, PixelOp, Row, Result};
//!
//! struct Invert;
//!
//! impl PixelIop for Invert {
//!     fn class(&self) -> &'static str { "Invert" }
//!
//!     fn pixel_engine(&self, input: &Row, _y: i32, x: i32, r: i32,
//!                     channels: &ChannelSet, out: &mut Row) -> Result<()> {
//!         for ch in channels.explicit() {
//!             let src = input.span(ch, x, r).to_vec();
//!             for (o, i) in out.span_mut(ch, x, r).iter_mut().zip(src) {
//!                 *o = 1.0 - i;
//!             }
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let op = PixelOp::new(Invert);
//! ```

use std::hash::Hasher;

use vfx_core::ChannelSet;

use crate::Result;
use crate::info::Info;
use crate::op::{EngineCx, Iop, Op, ValidateCx};
use crate::row::Row;

/// An operator whose output pixel depends only on the same input pixel.
pub trait PixelIop: Send + Sync {
    /// Class name.
    fn class(&self) -> &'static str;

    /// Parameter hash.
    fn append_hash(&self, _hash: &mut dyn Hasher) {}

    /// Output info from the input's. Defaults to a copy.
    fn validate(&mut self, _cx: &ValidateCx<'_>, input: &Info) -> Result<Info> {
        Ok(input.clone())
    }

    /// Input channels needed for `channels`.
    fn in_channels(&self, channels: &ChannelSet) -> ChannelSet {
        channels.clone()
    }

    /// Channels rewritten.
    fn out_channels(&self, info: &Info) -> ChannelSet {
        info.channels.clone()
    }

    /// Fills `out[channels][x..r)` from `input[in_channels][x..r)`.
    fn pixel_engine(
        &self,
        input: &Row,
        y: i32,
        x: i32,
        r: i32,
        channels: &ChannelSet,
        out: &mut Row,
    ) -> Result<()>;
}

/// Adapter running a [`PixelIop`] in the graph.
#[derive(Debug, Clone)]
pub struct PixelOp<P> {
    op: P,
}

impl<P: PixelIop> PixelOp<P> {
    /// Wraps a pixel operator.
    pub fn new(op: P) -> Self {
        Self { op }
    }

    /// The wrapped operator.
    pub fn inner(&self) -> &P {
        &self.op
    }

    /// The wrapped operator, mutably.
    pub fn inner_mut(&mut self) -> &mut P {
        &mut self.op
    }
}

impl<P: PixelIop> Op for PixelOp<P> {
    fn class(&self) -> &'static str {
        self.op.class()
    }

    fn append_hash(&self, hash: &mut dyn Hasher) {
        self.op.append_hash(hash);
    }
}

impl<P: PixelIop> Iop for PixelOp<P> {
    fn validate(&mut self, cx: &ValidateCx<'_>, _for_real: bool) -> Result<Info> {
        let input = cx.require_input(0)?.clone();
        self.op.validate(cx, &input)
    }

    fn in_channels(&self, _input: usize, channels: &ChannelSet) -> ChannelSet {
        self.op.in_channels(channels)
    }

    fn out_channels(&self, info: &Info) -> ChannelSet {
        self.op.out_channels(info)
    }

    fn engine(&self, cx: &EngineCx<'_>, y: i32, x: i32, r: i32, channels: &ChannelSet, row: &mut Row) -> Result<()> {
        let need = self.op.in_channels(channels);
        let mut input = Row::new(x, r);
        cx.input_row(0, y, x, r, &need, &mut input)?;
        self.op.pixel_engine(&input, y, x, r, channels, row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use crate::testing::{ctx, ramp, ramp_value};
    use vfx_core::{Bbox, Channel};

    /// Doubles red, leaves everything else to the input.
    struct DoubleRed;

    impl PixelIop for DoubleRed {
        fn class(&self) -> &'static str {
            "DoubleRed"
        }

        fn out_channels(&self, _info: &Info) -> ChannelSet {
            ChannelSet::red()
        }

        fn pixel_engine(&self, input: &Row, _y: i32, x: i32, r: i32, channels: &ChannelSet, out: &mut Row) -> Result<()> {
            for ch in channels.explicit() {
                let src = input.span(ch, x, r).to_vec();
                for (o, i) in out.span_mut(ch, x, r).iter_mut().zip(src) {
                    *o = 2.0 * i;
                }
            }
            Ok(())
        }
    }

    #[test]
    fn test_rewrites_only_out_channels() {
        let mut graph = Graph::new();
        let bbox = Bbox::new(0, 0, 6, 3);
        let (src, _) = ramp(&mut graph, bbox);
        let id = graph.add_iop("DoubleRed1", PixelOp::new(DoubleRed));
        graph.set_inputs(id, &[src]).unwrap();
        let ctx = ctx();
        assert_eq!(graph.validate(id, &ctx, true).unwrap().bbox, bbox);
        graph.request(id, bbox, &ChannelSet::rgb(), 1, &ctx).unwrap();

        let mut row = Row::new(0, 6);
        graph.engine(id, &ctx, 2, 0, 6, &ChannelSet::rgb(), &mut row).unwrap();
        assert_eq!(row.at(Channel::RED, 4), 2.0 * ramp_value(4, 2));
        assert_eq!(row.at(Channel::GREEN, 4), ramp_value(4, 2));
    }

    #[test]
    fn test_missing_input_fails_validate() {
        let mut graph = Graph::new();
        let id = graph.add_iop("DoubleRed1", PixelOp::new(DoubleRed));
        assert!(graph.validate(id, &ctx(), true).is_err());
    }
}
