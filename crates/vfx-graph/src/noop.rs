//! Metadata-only operators.
//!
//! A [`NoIop`] changes [`Info`] (format, frame range, channel naming)
//! and leaves pixels alone. [`NoOp`] reports no rewritten channels, so
//! every row is forwarded from input 0 without an engine call.

use std::hash::Hasher;

use vfx_core::ChannelSet;

use crate::Result;
use crate::info::Info;
use crate::op::{EngineCx, Iop, Op, ValidateCx};
use crate::row::Row;

/// An operator that only rewrites metadata.
pub trait NoIop: Send + Sync {
    /// Class name.
    fn class(&self) -> &'static str;

    /// Parameter hash.
    fn append_hash(&self, _hash: &mut dyn Hasher) {}

    /// Output info from the input's.
    fn validate(&mut self, cx: &ValidateCx<'_>, input: &Info) -> Result<Info>;
}

/// The identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl NoIop for Passthrough {
    fn class(&self) -> &'static str {
        "NoOp"
    }

    fn validate(&mut self, _cx: &ValidateCx<'_>, input: &Info) -> Result<Info> {
        Ok(input.clone())
    }
}

/// Adapter running a [`NoIop`] in the graph.
#[derive(Debug, Clone)]
pub struct NoOp<N> {
    op: N,
}

impl NoOp<Passthrough> {
    /// The identity operator.
    pub fn identity() -> Self {
        Self::new(Passthrough)
    }
}

impl<N: NoIop> NoOp<N> {
    /// Wraps a metadata operator.
    pub fn new(op: N) -> Self {
        Self { op }
    }

    /// The wrapped operator.
    pub fn inner(&self) -> &N {
        &self.op
    }

    /// The wrapped operator, mutably.
    pub fn inner_mut(&mut self) -> &mut N {
        &mut self.op
    }
}

impl<N: NoIop> Op for NoOp<N> {
    fn class(&self) -> &'static str {
        self.op.class()
    }

    fn append_hash(&self, hash: &mut dyn Hasher) {
        self.op.append_hash(hash);
    }
}

impl<N: NoIop> Iop for NoOp<N> {
    fn validate(&mut self, cx: &ValidateCx<'_>, _for_real: bool) -> Result<Info> {
        let input = cx.require_input(0)?.clone();
        self.op.validate(cx, &input)
    }

    fn out_channels(&self, _info: &Info) -> ChannelSet {
        ChannelSet::none()
    }

    fn engine(&self, cx: &EngineCx<'_>, y: i32, x: i32, r: i32, channels: &ChannelSet, row: &mut Row) -> Result<()> {
        cx.input_row(0, y, x, r, channels, row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use crate::testing::{ctx, ramp, ramp_value};
    use std::sync::atomic::Ordering;
    use vfx_core::{Bbox, Channel};

    /// Narrows the declared channels to RGB.
    struct RgbOnly;

    impl NoIop for RgbOnly {
        fn class(&self) -> &'static str {
            "RgbOnly"
        }

        fn validate(&mut self, _cx: &ValidateCx<'_>, input: &Info) -> Result<Info> {
            let mut info = input.clone();
            info.channels = info.channels.intersection(&ChannelSet::rgb());
            Ok(info)
        }
    }

    #[test]
    fn test_identity_forwards_rows() {
        let mut graph = Graph::new();
        let bbox = Bbox::new(0, 0, 5, 5);
        let (src, calls) = ramp(&mut graph, bbox);
        let id = graph.add_iop("NoOp1", NoOp::identity());
        graph.set_inputs(id, &[src]).unwrap();
        let ctx = ctx();
        assert_eq!(graph.validate(id, &ctx, true).unwrap(), graph.validate(src, &ctx, true).unwrap());
        graph.request(id, bbox, &ChannelSet::rgba(), 1, &ctx).unwrap();

        let mut row = Row::new(0, 5);
        graph.engine(id, &ctx, 4, 0, 5, &ChannelSet::rgba(), &mut row).unwrap();
        assert_eq!(row.at(Channel::ALPHA, 1), ramp_value(1, 4));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_metadata_change_hides_channels() {
        let mut graph = Graph::new();
        let bbox = Bbox::new(0, 0, 5, 5);
        let (src, _) = ramp(&mut graph, bbox);
        let id = graph.add_iop("RgbOnly1", NoOp::new(RgbOnly));
        graph.set_inputs(id, &[src]).unwrap();
        let ctx = ctx();
        assert_eq!(graph.validate(id, &ctx, true).unwrap().channels, ChannelSet::rgb());
        graph.request(id, bbox, &ChannelSet::rgba(), 1, &ctx).unwrap();

        let mut row = Row::new(0, 5);
        graph.engine(id, &ctx, 1, 0, 5, &ChannelSet::rgba(), &mut row).unwrap();
        assert_eq!(row.at(Channel::RED, 2), ramp_value(2, 1));
        assert!(row.is_zero(Channel::ALPHA));
    }
}
