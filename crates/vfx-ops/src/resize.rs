//! Integer-factor stretch.
//!
//! # Overview
//!
//! [`Stretch`] enlarges an image by whole factors `kx`, `ky` with linear
//! interpolation. Output pixel `X` samples the source at `X / k`, so every
//! source pixel `i` lands exactly on output `k * i` and the `k - 1` pixels
//! after it step linearly towards pixel `i + 1`. The last source pixel has
//! no successor; its run extrapolates the final segment instead of
//! flattening.
//!
//! The two passes are separable: each output row blends at most two input
//! rows, and each output pixel blends two input pixels of those rows.
//!
//! # Example
//!
//! ```rust
//! use vfx_ops::resize::stretch_line;
//!
//! let mut out = vec![0.0; 6];
//! stretch_line(&[0.0, 3.0], 3, &mut out);
//! assert_eq!(out, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
//! ```

use std::hash::Hasher;

use tracing::debug;
use vfx_core::{Bbox, ChannelSet, Format};
use vfx_graph::{EngineCx, Info, InputRequest, Iop, Op, Result, Row, ValidateCx};

/// Source position of output `p` for factor `k` within `[lo, hi)`.
///
/// Returns the left sample index and the blend towards the next one; the
/// index never passes `hi - 2` so the last run extrapolates.
#[inline]
pub fn source_position(p: i32, k: i32, lo: i32, hi: i32) -> (i32, f32) {
    if hi - lo <= 1 {
        return (lo, 0.0);
    }
    let s = p as f64 / k as f64;
    let i = (s.floor() as i32).clamp(lo, hi - 2);
    (i, (s - i as f64) as f32)
}

/// Stretches one line by `k`; `out` should be `k` times as long as `src`.
pub fn stretch_line(src: &[f32], k: i32, out: &mut [f32]) {
    let n = src.len() as i32;
    if n == 0 {
        return;
    }
    for (p, v) in out.iter_mut().enumerate() {
        let (i, t) = source_position(p as i32, k.max(1), 0, n);
        let a = src[i as usize];
        let b = src.get(i as usize + 1).copied().unwrap_or(a);
        *v = a + t * (b - a);
    }
}

fn scale_box(b: Bbox, kx: i32, ky: i32) -> Bbox {
    Bbox::new(b.x() * kx, b.y() * ky, b.r() * kx, b.t() * ky)
}

fn stretch_format(f: &Format, kx: i32, ky: i32) -> Format {
    let aspect = f.pixel_aspect() * ky as f64 / kx as f64;
    Format::new(f.width() * kx, f.height() * ky, aspect).with_aperture(scale_box(f.aperture(), kx, ky))
}

/// Enlarges its input by integer factors.
#[derive(Debug, Clone)]
pub struct Stretch {
    kx: i32,
    ky: i32,
    source: Bbox,
}

impl Stretch {
    /// Stretch by `kx` horizontally and `ky` vertically; factors below one
    /// are raised to one.
    pub fn new(kx: i32, ky: i32) -> Self {
        Self {
            kx: kx.max(1),
            ky: ky.max(1),
            source: Bbox::default(),
        }
    }

    /// Horizontal and vertical factors.
    pub fn factors(&self) -> (i32, i32) {
        (self.kx, self.ky)
    }

    /// Input columns needed for output `x..r`.
    fn source_span(&self, x: i32, r: i32) -> (i32, i32) {
        let s = self.source;
        let (lo, _) = source_position(x, self.kx, s.x(), s.r());
        let (hi, _) = source_position(r - 1, self.kx, s.x(), s.r());
        (lo, (hi + 2).min(s.r()))
    }
}

impl Op for Stretch {
    fn class(&self) -> &'static str {
        "Stretch"
    }

    fn append_hash(&self, hash: &mut dyn Hasher) {
        hash.write_i32(self.kx);
        hash.write_i32(self.ky);
    }
}

impl Iop for Stretch {
    fn validate(&mut self, cx: &ValidateCx<'_>, _for_real: bool) -> Result<Info> {
        let input = cx.require_input(0)?;
        self.source = input.bbox;
        let mut info = input.clone();
        info.bbox = scale_box(input.bbox, self.kx, self.ky);
        info.format = stretch_format(&input.format, self.kx, self.ky);
        info.full_size_format = stretch_format(&input.full_size_format, self.kx, self.ky);
        debug!(kx = self.kx, ky = self.ky, bbox = %info.bbox, "stretch");
        Ok(info)
    }

    fn request(&self, _info: &Info, inputs: usize, bbox: &Bbox, channels: &ChannelSet, count: u32) -> Vec<InputRequest> {
        let s = self.source;
        let (x, r) = self.source_span(bbox.x(), bbox.r().max(bbox.x() + 1));
        let (y, _) = source_position(bbox.y(), self.ky, s.y(), s.t());
        let (t, _) = source_position(bbox.t().max(bbox.y() + 1) - 1, self.ky, s.y(), s.t());
        let area = Bbox::new(x, y, r, (t + 2).min(s.t()));
        // Every input row feeds up to ky + 1 output rows.
        let count = if self.ky > 1 { count.saturating_mul(self.ky as u32 + 1) } else { count };
        (0..inputs.min(1))
            .map(|i| InputRequest::flat(i, area, channels.clone(), count))
            .collect()
    }

    fn engine(&self, cx: &EngineCx<'_>, y: i32, x: i32, r: i32, channels: &ChannelSet, row: &mut Row) -> Result<()> {
        cx.check_abort()?;
        let s = self.source;
        if s.w() <= 0 || s.h() <= 0 {
            row.erase_set(channels, cx.last_channel());
            return Ok(());
        }
        let (lo, hi) = self.source_span(x, r);
        let (j, ty) = source_position(y, self.ky, s.y(), s.t());

        let mut row0 = Row::new(lo, hi);
        cx.input_row(0, j, lo, hi, channels, &mut row0)?;
        let mut row1 = Row::new(lo, hi);
        if ty != 0.0 {
            cx.input_row(0, j + 1, lo, hi, channels, &mut row1)?;
        }

        let columns: Vec<(i32, f32)> = (x..r).map(|p| source_position(p, self.kx, s.x(), s.r())).collect();
        for ch in channels.iter().take_while(|c| *c <= cx.last_channel()) {
            let a = row0.channel(ch);
            let b = if ty != 0.0 { row1.channel(ch) } else { a };
            let at = |line: &[f32], i: i32| line.get((i.clamp(lo, hi - 1) - lo) as usize).copied().unwrap_or(0.0);
            let out = row.span_mut(ch, x, r);
            for (o, &(i, tx)) in out.iter_mut().zip(&columns) {
                let top = at(a, i) + tx * (at(a, i + 1) - at(a, i));
                let bottom = at(b, i) + tx * (at(b, i + 1) - at(b, i));
                *o = top + ty * (bottom - top);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_source_position_extrapolates_last_run() {
        assert_eq!(source_position(0, 3, 0, 100), (0, 0.0));
        assert_eq!(source_position(4, 3, 0, 100).0, 1);
        let (i, t) = source_position(299, 3, 0, 100);
        assert_eq!(i, 98);
        assert_relative_eq!(t, 1.0 + 2.0 / 3.0, epsilon = 1e-6);
    }

    #[test]
    fn test_single_pixel_is_constant() {
        assert_eq!(source_position(7, 4, 5, 6), (5, 0.0));
        let mut out = vec![0.0; 4];
        stretch_line(&[2.5], 4, &mut out);
        assert_eq!(out, vec![2.5; 4]);
    }

    #[test]
    fn test_line_triples() {
        let src: Vec<f32> = (0..10).map(|i| (i * i) as f32).collect();
        let mut out = vec![0.0; 30];
        stretch_line(&src, 3, &mut out);
        for i in 0..9 {
            let d = src[i + 1] - src[i];
            assert_relative_eq!(out[3 * i], src[i]);
            assert_relative_eq!(out[3 * i + 1], src[i] + d / 3.0, epsilon = 1e-5);
            assert_relative_eq!(out[3 * i + 2], src[i] + 2.0 * d / 3.0, epsilon = 1e-5);
        }
        let d = src[9] - src[8];
        assert_relative_eq!(out[27], src[9], epsilon = 1e-5);
        assert_relative_eq!(out[29], src[8] + (5.0 / 3.0) * d, epsilon = 1e-4);
    }

    #[test]
    fn test_format_scales_with_aspect() {
        let f = stretch_format(&Format::new(100, 50, 1.0), 2, 1);
        assert_eq!((f.width(), f.height()), (200, 50));
        assert_relative_eq!(f.pixel_aspect(), 0.5);
    }
}
