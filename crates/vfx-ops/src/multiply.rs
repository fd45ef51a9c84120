//! Per-channel gain.

use std::hash::{Hash, Hasher};

use vfx_core::{Channel, ChannelSet};
use vfx_graph::{Info, PixelIop, Result, Row};

/// Multiplies the selected channels by a constant.
///
/// `value` holds one factor per selected channel in ascending order; a
/// single factor applies to all of them.
#[derive(Debug, Clone)]
pub struct Multiply {
    value: Vec<f32>,
    channels: ChannelSet,
}

impl Multiply {
    /// Uniform gain on RGB.
    pub fn new(value: f32) -> Self {
        Self {
            value: vec![value],
            channels: ChannelSet::rgb(),
        }
    }

    /// Per-channel factors.
    pub fn set_value(&mut self, value: &[f32]) {
        self.value = value.to_vec();
    }

    /// Channels affected.
    pub fn set_channels(&mut self, channels: ChannelSet) {
        self.channels = channels;
    }

    /// Factor applied to `ch`.
    pub fn factor(&self, ch: Channel) -> f32 {
        let k = self.channels.explicit().position(|c| c == ch).unwrap_or(0);
        self.value.get(k).or_else(|| self.value.last()).copied().unwrap_or(1.0)
    }

    /// True when every factor is one.
    pub fn is_identity(&self) -> bool {
        self.value.iter().all(|v| *v == 1.0)
    }
}

impl PixelIop for Multiply {
    fn class(&self) -> &'static str {
        "Multiply"
    }

    fn append_hash(&self, mut hash: &mut dyn Hasher) {
        for v in &self.value {
            hash.write_u32(v.to_bits());
        }
        self.channels.hash(&mut hash);
    }

    fn out_channels(&self, info: &Info) -> ChannelSet {
        if self.is_identity() {
            return ChannelSet::none();
        }
        self.channels.intersection(&info.channels)
    }

    fn pixel_engine(&self, input: &Row, _y: i32, x: i32, r: i32, channels: &ChannelSet, out: &mut Row) -> Result<()> {
        for ch in channels.explicit() {
            let k = self.factor(ch);
            let src = input.span(ch, x, r);
            for (o, i) in out.span_mut(ch, x, r).iter_mut().zip(src) {
                *o = i * k;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factor_per_channel() {
        let mut m = Multiply::new(2.0);
        m.set_value(&[1.0, 2.0, 3.0]);
        assert_eq!(m.factor(Channel::RED), 1.0);
        assert_eq!(m.factor(Channel::BLUE), 3.0);
    }

    #[test]
    fn test_identity_rewrites_nothing() {
        let m = Multiply::new(1.0);
        let info = Info::new(vfx_core::Bbox::new(0, 0, 4, 4), ChannelSet::rgba());
        assert!(m.out_channels(&info).is_empty());
    }

    #[test]
    fn test_pixel_engine_scales() {
        let m = Multiply::new(0.5);
        let mut input = Row::new(0, 3);
        input.fill(Channel::RED, 0, 3, 4.0);
        let mut out = Row::new(0, 3);
        m.pixel_engine(&input, 0, 0, 3, &ChannelSet::red(), &mut out).unwrap();
        assert_eq!(out.span(Channel::RED, 0, 3), &[2.0, 2.0, 2.0]);
    }
}
