//! Source of a solid color.

use std::hash::{Hash, Hasher};

use vfx_core::{Channel, ChannelSet, Format};
use vfx_graph::read::DEFAULT_FORMAT;
use vfx_graph::{EngineCx, ImagePlane, Info, Iop, Op, Result, Row, ValidateCx};

/// Fills its format with one value per channel.
///
/// Values are matched to the channels in ascending order; channels past
/// the end of the color repeat its last value.
#[derive(Debug, Clone)]
pub struct Constant {
    color: Vec<f32>,
    channels: ChannelSet,
    format: Option<Format>,
    frames: Option<(i32, i32)>,
}

impl Default for Constant {
    fn default() -> Self {
        Self::new(&[0.0])
    }
}

impl Constant {
    /// RGBA constant of the given color.
    pub fn new(color: &[f32]) -> Self {
        Self {
            color: color.to_vec(),
            channels: ChannelSet::rgba(),
            format: None,
            frames: None,
        }
    }

    /// Replaces the color.
    pub fn set_color(&mut self, color: &[f32]) {
        self.color = color.to_vec();
    }

    /// Replaces the channel set. Open sets keep only their explicit part.
    pub fn set_channels(&mut self, channels: ChannelSet) {
        self.channels = channels;
    }

    /// Output format; the world's default when unset.
    pub fn set_format(&mut self, format: Option<Format>) {
        self.format = format;
    }

    /// Advertised frame range; the current frame when unset.
    pub fn set_frame_range(&mut self, frames: Option<(i32, i32)>) {
        self.frames = frames;
    }

    /// Value written to `ch`.
    pub fn value(&self, ch: Channel) -> f32 {
        let Some(k) = self.channels.explicit().position(|c| c == ch) else {
            return 0.0;
        };
        self.color
            .get(k)
            .or_else(|| self.color.last())
            .copied()
            .unwrap_or(0.0)
    }
}

impl Op for Constant {
    fn class(&self) -> &'static str {
        "Constant"
    }

    fn minimum_inputs(&self) -> usize {
        0
    }

    fn maximum_inputs(&self) -> usize {
        0
    }

    fn append_hash(&self, mut hash: &mut dyn Hasher) {
        for v in &self.color {
            hash.write_u32(v.to_bits());
        }
        self.channels.hash(&mut hash);
        if let Some(f) = &self.format {
            hash.write(f.to_string().as_bytes());
        }
        self.frames.hash(&mut hash);
    }
}

impl Iop for Constant {
    fn validate(&mut self, cx: &ValidateCx<'_>, _for_real: bool) -> Result<Info> {
        let format = match &self.format {
            Some(f) => f.clone(),
            None => cx
                .world()
                .formats
                .find(DEFAULT_FORMAT)
                .map(|f| (*f).clone())
                .ok_or_else(|| cx.error(format!("unknown format {DEFAULT_FORMAT}")))?,
        };
        let channels: ChannelSet = ChannelSet::from_slice(&self.channels.explicit().collect::<Vec<_>>());
        let frame = cx.output().int_frame();
        let (first, last) = self.frames.unwrap_or((frame, frame));
        Ok(Info::from_format(format, channels).with_frames(first, last))
    }

    fn engine(&self, _cx: &EngineCx<'_>, _y: i32, x: i32, r: i32, channels: &ChannelSet, row: &mut Row) -> Result<()> {
        for ch in channels.explicit() {
            row.fill(ch, x, r, self.value(ch));
        }
        Ok(())
    }

    fn supports_planes(&self) -> bool {
        true
    }

    fn fetch_plane(&self, _cx: &EngineCx<'_>, plane: &mut ImagePlane) -> Result<()> {
        let bbox = plane.bbox();
        let channels: Vec<Channel> = plane.channels().explicit().collect();
        for ch in channels {
            let line = vec![self.value(ch); bbox.w().max(0) as usize];
            for y in bbox.rows() {
                plane.write_row(y, ch, bbox.x(), &line);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_follow_channel_order() {
        let c = Constant::new(&[0.1, 0.2, 0.3, 1.0]);
        assert_eq!(c.value(Channel::RED), 0.1);
        assert_eq!(c.value(Channel::BLUE), 0.3);
        assert_eq!(c.value(Channel::ALPHA), 1.0);
    }

    #[test]
    fn test_short_color_repeats_last() {
        let mut c = Constant::new(&[0.5]);
        c.set_channels(ChannelSet::rgb());
        assert_eq!(c.value(Channel::GREEN), 0.5);
        assert_eq!(c.value(Channel::ALPHA), 0.0);
    }
}
