//! Deep operators.
//!
//! # Overview
//!
//! - [`DeepFromImage`] turns a flat image into one point sample per
//!   covered pixel, at the depth of its Z channel or a fixed depth
//! - [`DeepToImage`] flattens deep samples with a front-to-back over and
//!   writes the depth of the first visible sample to Z
//! - [`DeepMerge`] concatenates the samples of several deep inputs,
//!   optionally tidying the result into sorted non-overlapping samples
//!
//! Flat inputs are read as planes and deep inputs as deep planes, so each
//! operator issues the matching request kind upstream.

use std::hash::Hasher;

use tracing::trace;
use vfx_core::{Bbox, Channel, ChannelSet};
use vfx_graph::deep::{CombineMode, composite, tidy};
use vfx_graph::{
    DeepInfo, DeepOp, DeepOrdering, DeepOutputPlane, DeepPlane, EngineCx, ImagePlane, Info, InputRequest, Op,
    PlanarIop, Result, ValidateCx,
};

/// Sample channels carrying colour, in ascending order.
fn color_channels(channels: &ChannelSet) -> Vec<Channel> {
    channels
        .explicit()
        .filter(|c| !matches!(*c, Channel::ALPHA | Channel::Z | Channel::DEEP_FRONT | Channel::DEEP_BACK))
        .collect()
}

/// Converts a flat image into deep samples.
#[derive(Debug, Clone)]
pub struct DeepFromImage {
    use_z: bool,
    z: f32,
}

impl Default for DeepFromImage {
    fn default() -> Self {
        Self::new()
    }
}

impl DeepFromImage {
    /// Samples at the input's Z channel when it has one, else depth 1.
    pub fn new() -> Self {
        Self { use_z: true, z: 1.0 }
    }

    /// Reads depth from the Z channel.
    pub fn set_use_z(&mut self, use_z: bool) {
        self.use_z = use_z;
    }

    /// Depth used when Z is not read.
    pub fn set_z(&mut self, z: f32) {
        self.z = z;
    }
}

impl Op for DeepFromImage {
    fn class(&self) -> &'static str {
        "DeepFromImage"
    }

    fn append_hash(&self, hash: &mut dyn Hasher) {
        hash.write_u8(self.use_z as u8);
        hash.write_u32(self.z.to_bits());
    }
}

impl DeepOp for DeepFromImage {
    fn deep_validate(&mut self, cx: &ValidateCx<'_>, _for_real: bool) -> Result<DeepInfo> {
        let input = cx.require_input(0)?;
        let mut info = DeepInfo::from(input);
        info.channels = info.channels.difference(&ChannelSet::deep_depths());
        if self.use_z {
            info.channels.erase(Channel::Z);
        }
        Ok(info)
    }

    fn get_deep_requests(
        &self,
        _info: &DeepInfo,
        inputs: usize,
        bbox: &Bbox,
        channels: &ChannelSet,
        count: u32,
    ) -> Vec<InputRequest> {
        let mut need = channels.union(&ChannelSet::alpha());
        if self.use_z {
            need.insert(Channel::Z);
        }
        (0..inputs.min(1)).map(|i| InputRequest::flat(i, *bbox, need.clone(), count)).collect()
    }

    fn do_deep_engine(&self, cx: &EngineCx<'_>, bbox: Bbox, channels: &ChannelSet) -> Result<DeepPlane> {
        let mut need = channels.union(&ChannelSet::alpha()).difference(&ChannelSet::deep_depths());
        if self.use_z {
            need.insert(Channel::Z);
        }
        let plane = cx.input_plane(0, bbox, &need, false)?;
        cx.check_abort()?;
        let z = self.use_z.then_some(Channel::Z);
        Ok(DeepPlane::from_image(&plane, z, self.z))
    }
}

/// Flattens a deep input.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeepToImage;

impl PlanarIop for DeepToImage {
    fn class(&self) -> &'static str {
        "DeepToImage"
    }

    fn validate(&mut self, cx: &ValidateCx<'_>, _for_real: bool) -> Result<Info> {
        let deep = cx.require_deep_input(0)?;
        let mut info = deep.to_info();
        info.channels.insert(Channel::ALPHA);
        info.channels.insert(Channel::Z);
        Ok(info)
    }

    fn request(&self, _info: &Info, inputs: usize, bbox: &Bbox, channels: &ChannelSet, count: u32) -> Vec<InputRequest> {
        let mut need = channels.union(&ChannelSet::alpha());
        need.erase(Channel::Z);
        (0..inputs.min(1)).map(|i| InputRequest::deep(i, *bbox, need.clone(), count)).collect()
    }

    fn render_stripe(&self, cx: &EngineCx<'_>, plane: &mut ImagePlane) -> Result<()> {
        let bbox = plane.bbox();
        let mut need = plane.channels().union(&ChannelSet::alpha());
        need.erase(Channel::Z);
        let deep = cx.input_deep(0, bbox, &need)?;
        cx.check_abort()?;
        let color = color_channels(plane.channels());
        trace!(op = cx.name(), %bbox, samples = deep.total_samples(), "flatten");
        for (x, y) in bbox.iter() {
            let flat = composite(&deep.pixel(x, y).samples(&color));
            for (k, ch) in color.iter().enumerate() {
                plane.set(x, y, *ch, flat.color.get(k).copied().unwrap_or(0.0));
            }
            plane.set(x, y, Channel::ALPHA, flat.alpha);
            plane.set(x, y, Channel::Z, flat.z.unwrap_or(0.0));
        }
        Ok(())
    }
}

/// Combines the samples of all its inputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeepMerge {
    tidy: bool,
    mode: CombineMode,
}

impl DeepMerge {
    /// Plain concatenation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tidies the merged samples.
    pub fn set_tidy(&mut self, tidy: bool) {
        self.tidy = tidy;
    }

    /// How coincident samples combine when tidying.
    pub fn set_mode(&mut self, mode: CombineMode) {
        self.mode = mode;
    }
}

impl Op for DeepMerge {
    fn class(&self) -> &'static str {
        "DeepMerge"
    }

    fn maximum_inputs(&self) -> usize {
        usize::MAX
    }

    fn append_hash(&self, hash: &mut dyn Hasher) {
        hash.write_u8(self.tidy as u8);
        hash.write_u8(self.mode as u8);
    }
}

impl DeepOp for DeepMerge {
    fn deep_validate(&mut self, cx: &ValidateCx<'_>, _for_real: bool) -> Result<DeepInfo> {
        let mut info = cx.require_deep_input(0)?.clone();
        for i in 1..cx.input_count() {
            if let Some(other) = cx.deep_input(i) {
                info.bbox = info.bbox.enclose(&other.bbox);
                info.channels = info.channels.union(&other.channels);
                info.first_frame = info.first_frame.min(other.first_frame);
                info.last_frame = info.last_frame.max(other.last_frame);
            }
        }
        Ok(info)
    }

    fn do_deep_engine(&self, cx: &EngineCx<'_>, bbox: Bbox, channels: &ChannelSet) -> Result<DeepPlane> {
        let mut planes = Vec::with_capacity(cx.input_count());
        for i in 0..cx.input_count() {
            if cx.input_deep_info(i).is_some() {
                planes.push(cx.input_deep(i, bbox, channels)?);
            }
        }
        cx.check_abort()?;
        let color = color_channels(channels);
        let mut out_channels = channels.clone();
        out_channels.insert(Channel::ALPHA);
        let ordering = if self.tidy {
            DeepOrdering::ZAscending
        } else {
            DeepOrdering::Unordered
        };
        let mut out = DeepOutputPlane::new(bbox, &out_channels, ordering);
        for (x, y) in bbox.iter() {
            let samples: Vec<_> = planes.iter().flat_map(|p| p.pixel(x, y).samples(&color)).collect();
            if self.tidy {
                out.add_samples(&tidy(&samples, self.mode), &color);
            } else {
                out.add_samples(&samples, &color);
            }
        }
        out.into_plane()
    }
}
