//! Filtered lookups into tiles.
//!
//! # Overview
//!
//! [`sample_rect`] averages an axis-aligned footprint; [`sample_parallelogram`]
//! averages a footprint spanned by two arbitrary axes, as produced by an
//! affine or warped mapping. Both accumulate `sum(w * v) / sum(w)` over the
//! pixels the filter covers and read through [`TileAccess::at`], so pixels
//! outside the tile repeat its edges.
//!
//! Filters that ring can be clamped to the range of the pixels they read.
//!
//! # Example
//!
//! ```rust
//! use glam::Vec2;
//! use vfx_core::{Bbox, Channel, ChannelSet};
//! use vfx_graph::{GeneralTile, ImagePlane};
//! use vfx_ops::filter::Filter;
//! use vfx_ops::sample::sample_rect;
//!
//! let mut plane = ImagePlane::new(Bbox::new(0, 0, 4, 1), &ChannelSet::red(), false);
//! for x in 0..4 {
//!     plane.set(x, 0, Channel::RED, x as f32);
//! }
//! let tile = GeneralTile::from_plane(plane, true);
//! let mut out = [0.0];
//! sample_rect(&tile, Vec2::new(2.0, 0.5), 1.0, 1.0, Filter::Triangle, false, &[Channel::RED], &mut out);
//! assert_eq!(out[0], 1.5);
//! ```

use glam::{Mat2, Vec2};
use vfx_core::Channel;
use vfx_graph::TileAccess;

use crate::filter::Filter;

/// Running min and max of the pixels read.
struct Range {
    lo: Vec<f32>,
    hi: Vec<f32>,
}

impl Range {
    fn new(n: usize) -> Self {
        Self {
            lo: vec![f32::INFINITY; n],
            hi: vec![f32::NEG_INFINITY; n],
        }
    }

    fn add(&mut self, k: usize, v: f32) {
        self.lo[k] = self.lo[k].min(v);
        self.hi[k] = self.hi[k].max(v);
    }

    fn clamp(&self, out: &mut [f32]) {
        for (k, v) in out.iter_mut().enumerate() {
            if self.lo[k] <= self.hi[k] {
                *v = v.clamp(self.lo[k], self.hi[k]);
            }
        }
    }
}

/// Filtered value of an axis-aligned footprint.
///
/// `center` is in pixel coordinates (pixel `(x, y)` spans `[x, x + 1)`);
/// `width` and `height` are the footprint size in pixels. One value per
/// entry of `channels` is written to `out`.
#[allow(clippy::too_many_arguments)]
pub fn sample_rect<T: TileAccess + ?Sized>(
    src: &T,
    center: Vec2,
    width: f32,
    height: f32,
    filter: Filter,
    clamp: bool,
    channels: &[Channel],
    out: &mut [f32],
) {
    let wx = filter.weights(center.x, width);
    let wy = filter.weights(center.y, height);
    let clamp = clamp && filter.rings();
    let mut range = Range::new(channels.len());

    out.iter_mut().for_each(|v| *v = 0.0);
    let mut total = 0.0f32;
    for (y, fy) in wy.iter() {
        for (x, fx) in wx.iter() {
            let w = fx * fy;
            total += w;
            for (k, ch) in channels.iter().enumerate() {
                let v = src.at(x, y, *ch);
                out[k] += w * v;
                if clamp && w != 0.0 {
                    range.add(k, v);
                }
            }
        }
    }
    if total.abs() > 1e-8 && (total - 1.0).abs() > 1e-6 {
        out.iter_mut().for_each(|v| *v /= total);
    }
    if clamp {
        range.clamp(out);
    }
}

/// Filtered value of a parallelogram footprint.
///
/// The footprint is centered on `center` and spanned by `du` and `dv`,
/// the source-space extent of one destination pixel along each
/// destination axis. Axes shorter than a pixel are stretched to one pixel
/// so magnification still interpolates.
#[allow(clippy::too_many_arguments)]
pub fn sample_parallelogram<T: TileAccess + ?Sized>(
    src: &T,
    center: Vec2,
    du: Vec2,
    dv: Vec2,
    filter: Filter,
    clamp: bool,
    channels: &[Channel],
    out: &mut [f32],
) {
    let du = at_least_one_pixel(du, Vec2::X);
    let dv = at_least_one_pixel(dv, Vec2::Y);
    let axes = Mat2::from_cols(du, dv);
    if filter == Filter::Impulse || axes.determinant().abs() < 1e-6 {
        let w = (du.x.abs() + dv.x.abs()).max(1.0);
        let h = (du.y.abs() + dv.y.abs()).max(1.0);
        sample_rect(src, center, w, h, filter, clamp, channels, out);
        return;
    }
    let to_footprint = axes.inverse();

    // Bounding box of the filter support around the center.
    let r = filter.support();
    let ext = (du.abs() + dv.abs()) * r;
    let x0 = (center.x - ext.x).floor() as i32;
    let x1 = (center.x + ext.x).ceil() as i32;
    let y0 = (center.y - ext.y).floor() as i32;
    let y1 = (center.y + ext.y).ceil() as i32;

    let clamp = clamp && filter.rings();
    let mut range = Range::new(channels.len());
    out.iter_mut().for_each(|v| *v = 0.0);
    let mut total = 0.0f32;
    for y in y0..y1 {
        for x in x0..x1 {
            let st = to_footprint * (Vec2::new(x as f32 + 0.5, y as f32 + 0.5) - center);
            let w = filter.weight(st.x) * filter.weight(st.y);
            if w == 0.0 {
                continue;
            }
            total += w;
            for (k, ch) in channels.iter().enumerate() {
                let v = src.at(x, y, *ch);
                out[k] += w * v;
                if clamp {
                    range.add(k, v);
                }
            }
        }
    }
    if total.abs() < 1e-8 {
        let (x, y) = (center.x.floor() as i32, center.y.floor() as i32);
        for (k, ch) in channels.iter().enumerate() {
            out[k] = src.at(x, y, *ch);
        }
        return;
    }
    out.iter_mut().for_each(|v| *v /= total);
    if clamp {
        range.clamp(out);
    }
}

fn at_least_one_pixel(axis: Vec2, fallback: Vec2) -> Vec2 {
    let len = axis.length();
    if len < 1e-6 {
        fallback
    } else if len < 1.0 {
        axis / len
    } else {
        axis
    }
}
