//! Separable blur and the Blur operator.
//!
//! # Overview
//!
//! A blur is a vertical convolution followed by a horizontal one with the
//! 1D kernel of the chosen [`Filter`]. Large sizes go through a pyramid:
//! the source is box-downsampled by an integer factor, blurred at the
//! reduced size and bilinearly upsampled back. Both resampling steps keep
//! constant images constant, so the whole chain is the identity on a
//! constant input.
//!
//! Planes are read with edge replication, like every other image in the
//! graph.
//!
//! # Example
//!
//! ```rust
//! use vfx_core::{Bbox, Channel, ChannelSet};
//! use vfx_graph::ImagePlane;
//! use vfx_ops::blur::blur;
//! use vfx_ops::filter::Filter;
//!
//! let mut src = ImagePlane::new(Bbox::new(0, 0, 64, 64), &ChannelSet::rgb(), false);
//! src.fill(0.25);
//! let out = blur(&src, 40.0, 40.0, Filter::Gaussian, Bbox::new(0, 0, 64, 64));
//! assert!((out.at(10, 10, Channel::GREEN) - 0.25).abs() < 1e-5);
//! ```

use std::hash::{Hash, Hasher};

#[cfg(feature = "parallel")]
use rayon::prelude::*;
use tracing::trace;
use vfx_core::{Bbox, Channel, ChannelSet};
use vfx_graph::{EngineCx, ImagePlane, Info, InputRequest, PlanarIop, Result, ValidateCx};

use crate::filter::{Filter, Weights};

/// Blur sizes above this many pixels use the downsampling pyramid.
pub const PYRAMID_THRESHOLD: f32 = 16.0;

/// Fills a new unpacked plane one (row, channel) at a time.
fn map_rows<F>(out: Bbox, channels: &ChannelSet, f: F) -> ImagePlane
where
    F: Fn(i32, Channel, &mut [f32]) + Sync,
{
    let chans: Vec<Channel> = channels.explicit().collect();
    let jobs: Vec<(i32, Channel)> = out.rows().flat_map(|y| chans.iter().map(move |c| (y, *c))).collect();
    let width = out.w().max(0) as usize;
    let compute = |&(y, ch): &(i32, Channel)| {
        let mut buf = vec![0.0f32; width];
        f(y, ch, &mut buf);
        (y, ch, buf)
    };
    #[cfg(feature = "parallel")]
    let rows: Vec<_> = jobs.par_iter().map(compute).collect();
    #[cfg(not(feature = "parallel"))]
    let rows: Vec<_> = jobs.iter().map(compute).collect();

    let mut plane = ImagePlane::new(out, channels, false);
    for (y, ch, buf) in rows {
        plane.write_row(y, ch, out.x(), &buf);
    }
    plane
}

/// Convolves rows of `src` with `kernel`, producing `out`.
pub fn convolve_horizontal(src: &ImagePlane, kernel: &Weights, out: Bbox) -> ImagePlane {
    let span = out.w().max(0) as usize + kernel.len().saturating_sub(1);
    map_rows(out, src.channels(), |y, ch, buf| {
        let mut line = vec![0.0f32; span];
        src.read_row(y, ch, out.x() + kernel.start, &mut line);
        for (i, v) in buf.iter_mut().enumerate() {
            *v = kernel.values.iter().zip(&line[i..]).map(|(k, s)| k * s).sum();
        }
    })
}

/// Convolves columns of `src` with `kernel`, producing `out`.
pub fn convolve_vertical(src: &ImagePlane, kernel: &Weights, out: Bbox) -> ImagePlane {
    map_rows(out, src.channels(), |y, ch, buf| {
        let mut line = vec![0.0f32; buf.len()];
        for (dy, k) in kernel.iter() {
            src.read_row(y + dy, ch, out.x(), &mut line);
            for (v, s) in buf.iter_mut().zip(&line) {
                *v += k * s;
            }
        }
    })
}

fn div_floor(a: i32, b: i32) -> i32 {
    a.div_euclid(b)
}

fn div_ceil(a: i32, b: i32) -> i32 {
    -(-a).div_euclid(b)
}

/// Box in `factor`-reduced coordinates covering `bbox`.
pub fn reduced_box(bbox: Bbox, factor: i32) -> Bbox {
    Bbox::new(
        div_floor(bbox.x(), factor),
        div_floor(bbox.y(), factor),
        div_ceil(bbox.r(), factor),
        div_ceil(bbox.t(), factor),
    )
}

/// Exact box downsample by an integer factor.
///
/// Reduced pixel `(X, Y)` is the mean of source pixels
/// `[X*f, X*f + f) x [Y*f, Y*f + f)`.
pub fn downsample(src: &ImagePlane, factor: i32) -> ImagePlane {
    let f = factor.max(1);
    let out = reduced_box(src.bbox(), f);
    let norm = 1.0 / (f * f) as f32;
    let span = (out.w() * f) as usize;
    map_rows(out, src.channels(), |y, ch, buf| {
        let mut line = vec![0.0f32; span];
        for j in 0..f {
            src.read_row(y * f + j, ch, out.x() * f, &mut line);
            for (i, v) in buf.iter_mut().enumerate() {
                *v += line[i * f as usize..(i + 1) * f as usize].iter().sum::<f32>();
            }
        }
        buf.iter_mut().for_each(|v| *v *= norm);
    })
}

/// Bilinear upsample of a reduced plane back to full-resolution `out`.
pub fn upsample(src: &ImagePlane, factor: i32, out: Bbox) -> ImagePlane {
    let f = factor.max(1) as f32;
    let coarse = |p: i32| {
        let u = (p as f32 + 0.5) / f - 0.5;
        let i = u.floor();
        (i as i32, u - i)
    };
    let cols: Vec<(i32, f32)> = out.columns().map(coarse).collect();
    map_rows(out, src.channels(), |y, ch, buf| {
        let (j, ty) = coarse(y);
        let row0 = src.row(j, ch);
        let row1 = src.row(j + 1, ch);
        for (v, &(i, tx)) in buf.iter_mut().zip(&cols) {
            let lo = row0.get(i) + tx * (row0.get(i + 1) - row0.get(i));
            let hi = row1.get(i) + tx * (row1.get(i + 1) - row1.get(i));
            *v = lo + ty * (hi - lo);
        }
    })
}

/// Integer pyramid factor for a blur of `size` pixels; 1 means none.
pub fn pyramid_factor(size: f32) -> i32 {
    if size > PYRAMID_THRESHOLD {
        (size / (PYRAMID_THRESHOLD / 2.0)).floor() as i32
    } else {
        1
    }
}

/// Extra input pixels a blur of this size reads beyond its output box.
pub fn blur_margin(size: f32, filter: Filter) -> i32 {
    if size <= 0.0 {
        return 0;
    }
    (filter.support() * size).ceil() as i32 + 2 * pyramid_factor(size)
}

fn blur_direct(src: &ImagePlane, size_x: f32, size_y: f32, filter: Filter, out: Bbox) -> ImagePlane {
    let kx = filter.kernel(size_x);
    let ky = filter.kernel(size_y);
    let columns = Bbox::new(out.x() + kx.start, out.y(), out.r() + kx.end() - 1, out.t());
    let vertical = convolve_vertical(src, &ky, columns);
    convolve_horizontal(&vertical, &kx, out)
}

/// Blurs `src` by `size_x` x `size_y` pixels into the box `out`.
pub fn blur(src: &ImagePlane, size_x: f32, size_y: f32, filter: Filter, out: Bbox) -> ImagePlane {
    if size_x <= 0.0 && size_y <= 0.0 {
        let mut plane = ImagePlane::new(out, src.channels(), false);
        for ch in src.channels().explicit() {
            let mut line = vec![0.0f32; out.w().max(0) as usize];
            for y in out.rows() {
                src.read_row(y, ch, out.x(), &mut line);
                plane.write_row(y, ch, out.x(), &line);
            }
        }
        return plane;
    }
    let factor = pyramid_factor(size_x.min(size_y));
    if factor > 1 {
        trace!(size_x, size_y, factor, "pyramid blur");
        let small = downsample(src, factor);
        let f = factor as f32;
        let reduced = reduced_box(out, factor);
        let target = Bbox::new(reduced.x() - 1, reduced.y() - 1, reduced.r() + 1, reduced.t() + 1);
        let blurred = blur_direct(&small, size_x / f, size_y / f, filter, target);
        return upsample(&blurred, factor, out);
    }
    blur_direct(src, size_x, size_y, filter, out)
}

/// Blurs the selected channels of its input.
#[derive(Debug, Clone)]
pub struct Blur {
    size: [f32; 2],
    filter: Filter,
    channels: ChannelSet,
}

impl Blur {
    /// Gaussian blur of `size` pixels on all channels.
    pub fn new(size: f32) -> Self {
        Self {
            size: [size, size],
            filter: Filter::Gaussian,
            channels: ChannelSet::all(),
        }
    }

    /// Sets different horizontal and vertical sizes.
    pub fn set_size(&mut self, x: f32, y: f32) {
        self.size = [x.max(0.0), y.max(0.0)];
    }

    /// Sets the kernel.
    pub fn set_filter(&mut self, filter: Filter) {
        self.filter = filter;
    }

    /// Restricts the channels blurred; the others pass through.
    pub fn set_channels(&mut self, channels: ChannelSet) {
        self.channels = channels;
    }

    fn margins(&self) -> (i32, i32) {
        (blur_margin(self.size[0], self.filter), blur_margin(self.size[1], self.filter))
    }

    fn padded(&self, bbox: &Bbox) -> Bbox {
        let (mx, my) = self.margins();
        Bbox::new(bbox.x() - mx, bbox.y() - my, bbox.r() + mx, bbox.t() + my)
    }
}

impl PlanarIop for Blur {
    fn class(&self) -> &'static str {
        "Blur"
    }

    fn append_hash(&self, mut hash: &mut dyn Hasher) {
        hash.write_u32(self.size[0].to_bits());
        hash.write_u32(self.size[1].to_bits());
        hash.write(self.filter.to_string().as_bytes());
        self.channels.hash(&mut hash);
    }

    fn validate(&mut self, cx: &ValidateCx<'_>, _for_real: bool) -> Result<Info> {
        let mut info = cx.require_input(0)?.clone();
        let (mx, my) = (
            (self.filter.support() * self.size[0]).ceil() as i32,
            (self.filter.support() * self.size[1]).ceil() as i32,
        );
        let b = info.bbox;
        info.bbox = Bbox::new(b.x() - mx, b.y() - my, b.r() + mx, b.t() + my);
        Ok(info)
    }

    fn request(&self, _info: &Info, inputs: usize, bbox: &Bbox, channels: &ChannelSet, count: u32) -> Vec<InputRequest> {
        (0..inputs.min(1))
            .map(|i| InputRequest::flat(i, self.padded(bbox), channels.clone(), count))
            .collect()
    }

    fn out_channels(&self, info: &Info) -> ChannelSet {
        self.channels.intersection(&info.channels)
    }

    fn render_stripe(&self, cx: &EngineCx<'_>, plane: &mut ImagePlane) -> Result<()> {
        let bbox = plane.bbox();
        let blurred = plane.channels().intersection(cx.out_channels());
        let through = plane.channels().difference(&blurred);
        if !through.is_empty() {
            plane.copy_from(&cx.input_plane(0, bbox, &through, false)?);
        }
        let src = cx.input_plane(0, self.padded(&bbox), &blurred, false)?;
        cx.check_abort()?;
        plane.copy_from(&blur(&src, self.size[0], self.size[1], self.filter, bbox));
        Ok(())
    }

    fn parallel_stripes(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn constant(bbox: Bbox, v: f32) -> ImagePlane {
        let mut p = ImagePlane::new(bbox, &ChannelSet::rgba(), false);
        p.fill(v);
        p
    }

    #[test]
    fn test_constant_is_preserved() {
        let bbox = Bbox::new(-5, 3, 60, 41);
        let src = constant(bbox, 0.7);
        for (size, filter) in [(3.0, Filter::Gaussian), (9.0, Filter::Box), (50.0, Filter::Triangle), (33.0, Filter::CUBIC)] {
            let out = blur(&src, size, size, filter, bbox);
            for (x, y) in [(-5, 3), (20, 20), (59, 40)] {
                assert_relative_eq!(out.at(x, y, Channel::ALPHA), 0.7, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_down_up_identity_on_constant() {
        let bbox = Bbox::new(-7, -3, 29, 18);
        let src = constant(bbox, 0.3);
        let small = downsample(&src, 4);
        assert_eq!(small.bbox(), Bbox::new(-2, -1, 8, 5));
        let back = upsample(&small, 4, bbox);
        for (x, y) in bbox.iter() {
            assert_relative_eq!(back.at(x, y, Channel::RED), 0.3, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_downsample_is_exact_box() {
        let bbox = Bbox::new(0, 0, 4, 2);
        let mut src = ImagePlane::new(bbox, &ChannelSet::red(), false);
        for (x, y) in bbox.iter() {
            src.set(x, y, Channel::RED, (x + 4 * y) as f32);
        }
        let small = downsample(&src, 2);
        assert_eq!(small.bbox(), Bbox::new(0, 0, 2, 1));
        assert_eq!(small.at(0, 0, Channel::RED), (0.0 + 1.0 + 4.0 + 5.0) / 4.0);
        assert_eq!(small.at(1, 0, Channel::RED), (2.0 + 3.0 + 6.0 + 7.0) / 4.0);
    }

    #[test]
    fn test_box_blur_of_impulse() {
        let bbox = Bbox::new(0, 0, 9, 1);
        let mut src = ImagePlane::new(bbox, &ChannelSet::red(), false);
        src.set(4, 0, Channel::RED, 3.0);
        let out = blur(&src, 3.0, 0.0, Filter::Box, bbox);
        assert_relative_eq!(out.at(3, 0, Channel::RED), 1.0, epsilon = 1e-6);
        assert_relative_eq!(out.at(4, 0, Channel::RED), 1.0, epsilon = 1e-6);
        assert_relative_eq!(out.at(5, 0, Channel::RED), 1.0, epsilon = 1e-6);
        assert_eq!(out.at(6, 0, Channel::RED), 0.0);
    }

    #[test]
    fn test_zero_size_copies() {
        let bbox = Bbox::new(0, 0, 4, 4);
        let mut src = constant(bbox, 0.0);
        src.set(1, 2, Channel::GREEN, 5.0);
        let out = blur(&src, 0.0, 0.0, Filter::Gaussian, Bbox::new(0, 0, 6, 4));
        assert_eq!(out.at(1, 2, Channel::GREEN), 5.0);
        assert_eq!(out.bbox(), Bbox::new(0, 0, 6, 4));
    }

    #[test]
    fn test_pyramid_factor() {
        assert_eq!(pyramid_factor(4.0), 1);
        assert_eq!(pyramid_factor(16.0), 1);
        assert_eq!(pyramid_factor(17.0), 2);
        assert_eq!(pyramid_factor(64.0), 8);
    }
}
