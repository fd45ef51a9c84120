//! Two-input compositing.
//!
//! Provides Porter-Duff operations and blend modes on premultiplied
//! channels, and the [`Merge`] operator that applies them to a pair of
//! images.
//!
//! # Porter-Duff Operations
//!
//! - [`MergeMode::Over`] - `A + B * (1 - a)`
//! - [`MergeMode::Under`] - `A * (1 - b) + B`
//! - [`MergeMode::Atop`] - `A * b + B * (1 - a)`
//! - [`MergeMode::In`] - `A * b`
//! - [`MergeMode::Out`] - `A * (1 - b)`
//!
//! # Blend Modes
//!
//! - [`MergeMode::Plus`], [`MergeMode::Minus`] - sum and `A - B`
//! - [`MergeMode::Multiply`], [`MergeMode::Screen`], [`MergeMode::Overlay`]
//! - [`MergeMode::Difference`], [`MergeMode::Max`], [`MergeMode::Min`]
//!
//! Every channel goes through the same formula, alpha included, with `a`
//! and `b` the alphas of A and B. Input 0 is B, input 1 is A.
//!
//! # Example
//!
//! ```rust
//! use vfx_ops::composite::MergeMode;
//!
//! // Half-transparent red over opaque blue, premultiplied.
//! let (a_alpha, b_alpha) = (0.5, 1.0);
//! let red = MergeMode::Over.apply(0.5, 0.0, a_alpha, b_alpha);
//! let blue = MergeMode::Over.apply(0.0, 1.0, a_alpha, b_alpha);
//! assert_eq!((red, blue), (0.5, 0.5));
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use tracing::debug;
use vfx_core::{Bbox, Channel, ChannelSet};
use vfx_graph::{EngineCx, Info, InputRequest, Iop, Op, Result, Row, ValidateCx};

use crate::{OpsError, OpsResult};

/// Merge operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MergeMode {
    /// A over B.
    #[default]
    Over,
    /// A under B.
    Under,
    /// A where B is, over B.
    Atop,
    /// A masked by B's alpha.
    In,
    /// A masked by B's inverted alpha.
    Out,
    /// Sum.
    Plus,
    /// A minus B.
    Minus,
    /// Product.
    Multiply,
    /// Inverted product of inverses.
    Screen,
    /// Multiply or screen depending on B.
    Overlay,
    /// Absolute difference.
    Difference,
    /// Larger of the two.
    Max,
    /// Smaller of the two.
    Min,
}

impl MergeMode {
    /// All modes, in declaration order.
    pub const ALL: [MergeMode; 13] = [
        MergeMode::Over,
        MergeMode::Under,
        MergeMode::Atop,
        MergeMode::In,
        MergeMode::Out,
        MergeMode::Plus,
        MergeMode::Minus,
        MergeMode::Multiply,
        MergeMode::Screen,
        MergeMode::Overlay,
        MergeMode::Difference,
        MergeMode::Max,
        MergeMode::Min,
    ];

    /// Lower-case name used in parameters.
    pub fn name(&self) -> &'static str {
        match self {
            MergeMode::Over => "over",
            MergeMode::Under => "under",
            MergeMode::Atop => "atop",
            MergeMode::In => "in",
            MergeMode::Out => "out",
            MergeMode::Plus => "plus",
            MergeMode::Minus => "minus",
            MergeMode::Multiply => "multiply",
            MergeMode::Screen => "screen",
            MergeMode::Overlay => "overlay",
            MergeMode::Difference => "difference",
            MergeMode::Max => "max",
            MergeMode::Min => "min",
        }
    }

    /// Combines one channel of A and B given both alphas.
    #[inline]
    pub fn apply(&self, a: f32, b: f32, a_alpha: f32, b_alpha: f32) -> f32 {
        match self {
            MergeMode::Over => a + b * (1.0 - a_alpha),
            MergeMode::Under => a * (1.0 - b_alpha) + b,
            MergeMode::Atop => a * b_alpha + b * (1.0 - a_alpha),
            MergeMode::In => a * b_alpha,
            MergeMode::Out => a * (1.0 - b_alpha),
            MergeMode::Plus => a + b,
            MergeMode::Minus => a - b,
            MergeMode::Multiply => a * b,
            MergeMode::Screen => a + b - a * b,
            MergeMode::Overlay => {
                if b < 0.5 {
                    2.0 * a * b
                } else {
                    1.0 - 2.0 * (1.0 - a) * (1.0 - b)
                }
            }
            MergeMode::Difference => (a - b).abs(),
            MergeMode::Max => a.max(b),
            MergeMode::Min => a.min(b),
        }
    }

    /// Output box for inputs covering `a` and `b`.
    pub fn bbox(&self, a: &Bbox, b: &Bbox) -> Bbox {
        match self {
            MergeMode::In | MergeMode::Multiply | MergeMode::Min => {
                if a.overlaps(b) {
                    a.intersect(b)
                } else {
                    *b
                }
            }
            MergeMode::Atop => *b,
            MergeMode::Out => *a,
            _ => a.union(b),
        }
    }
}

impl fmt::Display for MergeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MergeMode {
    type Err = OpsError;

    fn from_str(s: &str) -> OpsResult<Self> {
        let s = s.to_ascii_lowercase();
        MergeMode::ALL
            .into_iter()
            .find(|m| m.name() == s)
            .ok_or_else(|| OpsError::InvalidParameter(format!("unknown merge operation '{s}'")))
    }
}

/// Composites input 1 (A) onto input 0 (B).
#[derive(Debug, Clone)]
pub struct Merge {
    mode: MergeMode,
    mix: f32,
    channels: ChannelSet,
    boxes: [Option<Bbox>; 2],
}

impl Merge {
    /// Merge with `mode` on all channels.
    pub fn new(mode: MergeMode) -> Self {
        Self {
            mode,
            mix: 1.0,
            channels: ChannelSet::all(),
            boxes: [None, None],
        }
    }

    /// The operation.
    pub fn mode(&self) -> MergeMode {
        self.mode
    }

    /// Blend between B (0) and the merged result (1).
    pub fn set_mix(&mut self, mix: f32) {
        self.mix = mix.clamp(0.0, 1.0);
    }

    /// Channels merged; the rest pass through from B.
    pub fn set_channels(&mut self, channels: ChannelSet) {
        self.channels = channels;
    }

    /// Reads `channels` of input `i` on row `y`, black outside its box.
    #[allow(clippy::too_many_arguments)]
    fn fetch(&self, cx: &EngineCx<'_>, i: usize, y: i32, x: i32, r: i32, channels: &ChannelSet, row: &mut Row) -> Result<()> {
        let Some(b) = self.boxes[i] else {
            row.erase_set(channels, cx.last_channel());
            return Ok(());
        };
        if y < b.y() || y >= b.t() || r <= b.x() || x >= b.r() {
            row.erase_set(channels, cx.last_channel());
            return Ok(());
        }
        let (lo, hi) = (x.max(b.x()), r.min(b.r()));
        cx.input_row(i, y, lo, hi, channels, row)?;
        for ch in channels.iter().take_while(|c| *c <= cx.last_channel()) {
            if lo > x {
                row.fill(ch, x, lo, 0.0);
            }
            if hi < r {
                row.fill(ch, hi, r, 0.0);
            }
        }
        Ok(())
    }
}

impl Op for Merge {
    fn class(&self) -> &'static str {
        "Merge"
    }

    fn maximum_inputs(&self) -> usize {
        2
    }

    fn append_hash(&self, mut hash: &mut dyn Hasher) {
        self.mode.hash(&mut hash);
        hash.write_u32(self.mix.to_bits());
        self.channels.hash(&mut hash);
    }
}

impl Iop for Merge {
    fn validate(&mut self, cx: &ValidateCx<'_>, _for_real: bool) -> Result<Info> {
        let b = cx.require_input(0)?;
        let mut info = b.clone();
        self.boxes = [Some(b.bbox), cx.input(1).map(|a| a.bbox)];
        if let Some(a) = cx.input(1) {
            info.bbox = self.mode.bbox(&a.bbox, &b.bbox);
            info.channels = b.channels.union(&a.channels);
            info.first_frame = b.first_frame.min(a.first_frame);
            info.last_frame = b.last_frame.max(a.last_frame);
        }
        debug!(op = cx.name(), mode = %self.mode, bbox = %info.bbox, "merge");
        Ok(info)
    }

    fn in_channels(&self, _input: usize, channels: &ChannelSet) -> ChannelSet {
        channels.union(&ChannelSet::alpha())
    }

    fn request(&self, _info: &Info, inputs: usize, bbox: &Bbox, channels: &ChannelSet, count: u32) -> Vec<InputRequest> {
        (0..inputs.min(2))
            .filter_map(|i| {
                let own = self.boxes[i]?;
                own.overlaps(bbox)
                    .then(|| InputRequest::flat(i, bbox.intersect(&own), self.in_channels(i, channels), count))
            })
            .collect()
    }

    fn out_channels(&self, info: &Info) -> ChannelSet {
        if self.mix == 0.0 {
            return ChannelSet::none();
        }
        self.channels.intersection(&info.channels)
    }

    fn engine(&self, cx: &EngineCx<'_>, y: i32, x: i32, r: i32, channels: &ChannelSet, row: &mut Row) -> Result<()> {
        cx.check_abort()?;
        let need = self.in_channels(0, channels);
        let mut b = Row::new(x, r);
        self.fetch(cx, 0, y, x, r, &need, &mut b)?;
        let mut a = Row::new(x, r);
        self.fetch(cx, 1, y, x, r, &need, &mut a)?;

        let aa = a.span(Channel::ALPHA, x, r).to_vec();
        let ba = b.span(Channel::ALPHA, x, r).to_vec();
        for ch in channels.iter().take_while(|c| *c <= cx.last_channel()) {
            let (av, bv) = (a.span(ch, x, r), b.span(ch, x, r));
            let out = row.span_mut(ch, x, r);
            for i in 0..out.len() {
                let merged = self.mode.apply(av[i], bv[i], aa[i], ba[i]);
                out[i] = bv[i] + self.mix * (merged - bv[i]);
            }
        }
        Ok(())
    }
}
