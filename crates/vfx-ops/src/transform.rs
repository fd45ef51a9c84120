//! Affine resampling.
//!
//! # Overview
//!
//! [`Transform`] maps its input through a 2D affine matrix built from
//! translate, rotate, scale and a pivot. Each output pixel center is
//! mapped back into the source with the inverse matrix and filtered over
//! the footprint of one output pixel:
//!
//! - axis-aligned matrices use the separable [`sample_rect`]
//! - rotations and shears use [`sample_parallelogram`] with the inverse
//!   matrix columns as footprint axes
//!
//! Output pixels whose center falls outside the source box are black.
//!
//! # Example
//!
//! ```rust
//! use vfx_ops::transform::Transform;
//!
//! let mut t = Transform::new();
//! t.set_translate(10.0, 0.0);
//! t.set_rotate(90.0);
//! assert!(!t.is_identity());
//! ```

use std::hash::Hasher;

use glam::{Affine2, Vec2};
use tracing::debug;
use vfx_core::{Bbox, Channel, ChannelSet};
use vfx_graph::{EngineCx, Info, InputTile, MultiTileIop, Result, Row, TileAccess, ValidateCx};

use crate::filter::Filter;
use crate::sample::{sample_parallelogram, sample_rect};

/// Affine transform of the input image.
#[derive(Debug, Clone)]
pub struct Transform {
    translate: Vec2,
    rotate: f32,
    scale: Vec2,
    center: Vec2,
    filter: Filter,
    clamp: bool,
    inverse: Affine2,
    source: Bbox,
}

impl Default for Transform {
    fn default() -> Self {
        Self::new()
    }
}

impl Transform {
    /// The identity with a Catmull-Rom filter.
    pub fn new() -> Self {
        Self {
            translate: Vec2::ZERO,
            rotate: 0.0,
            scale: Vec2::ONE,
            center: Vec2::ZERO,
            filter: Filter::CATMULL_ROM,
            clamp: false,
            inverse: Affine2::IDENTITY,
            source: Bbox::default(),
        }
    }

    /// Offset in pixels.
    pub fn set_translate(&mut self, x: f32, y: f32) {
        self.translate = Vec2::new(x, y);
    }

    /// Counter-clockwise rotation in degrees around the center.
    pub fn set_rotate(&mut self, degrees: f32) {
        self.rotate = degrees;
    }

    /// Scale factors around the center.
    pub fn set_scale(&mut self, x: f32, y: f32) {
        self.scale = Vec2::new(x, y);
    }

    /// Pivot for rotate and scale.
    pub fn set_center(&mut self, x: f32, y: f32) {
        self.center = Vec2::new(x, y);
    }

    /// Reconstruction filter.
    pub fn set_filter(&mut self, filter: Filter) {
        self.filter = filter;
    }

    /// Clamps ringing filters to the range of the pixels they read.
    pub fn set_clamp(&mut self, clamp: bool) {
        self.clamp = clamp;
    }

    /// Source-to-output matrix.
    pub fn matrix(&self) -> Affine2 {
        Affine2::from_translation(self.center + self.translate)
            * Affine2::from_angle(self.rotate.to_radians())
            * Affine2::from_scale(self.scale)
            * Affine2::from_translation(-self.center)
    }

    /// True when output equals input.
    pub fn is_identity(&self) -> bool {
        self.matrix().abs_diff_eq(Affine2::IDENTITY, 1e-6)
    }

    fn axis_aligned(&self) -> bool {
        let m = self.inverse.matrix2;
        m.x_axis.y.abs() < 1e-6 && m.y_axis.x.abs() < 1e-6
    }

    /// Pixels read around a mapped center.
    fn margin(&self) -> i32 {
        let m = self.inverse.matrix2;
        let reach = (m.x_axis.abs() + m.y_axis.abs()).max_element().max(1.0);
        (self.filter.support() * reach).ceil() as i32 + 1
    }
}

/// Bounding box of `b` mapped through `m`.
fn map_box(m: &Affine2, b: Bbox) -> Bbox {
    let corners = [
        Vec2::new(b.x() as f32, b.y() as f32),
        Vec2::new(b.r() as f32, b.y() as f32),
        Vec2::new(b.x() as f32, b.t() as f32),
        Vec2::new(b.r() as f32, b.t() as f32),
    ]
    .map(|p| m.transform_point2(p));
    let lo = corners.iter().fold(Vec2::splat(f32::INFINITY), |a, p| a.min(*p));
    let hi = corners.iter().fold(Vec2::splat(f32::NEG_INFINITY), |a, p| a.max(*p));
    Bbox::new(lo.x.floor() as i32, lo.y.floor() as i32, hi.x.ceil() as i32, hi.y.ceil() as i32)
}

impl MultiTileIop for Transform {
    fn class(&self) -> &'static str {
        "Transform"
    }

    fn append_hash(&self, hash: &mut dyn Hasher) {
        for v in [
            self.translate.x,
            self.translate.y,
            self.rotate,
            self.scale.x,
            self.scale.y,
            self.center.x,
            self.center.y,
        ] {
            hash.write_u32(v.to_bits());
        }
        hash.write(self.filter.to_string().as_bytes());
        hash.write_u8(self.clamp as u8);
    }

    fn validate(&mut self, cx: &ValidateCx<'_>, _for_real: bool) -> Result<Info> {
        let input = cx.require_input(0)?;
        let m = self.matrix();
        if m.matrix2.determinant().abs() < 1e-9 {
            return Err(cx.error("transform matrix is singular"));
        }
        self.inverse = m.inverse();
        self.source = input.bbox;
        let mut info = input.clone();
        if !self.is_identity() {
            info.bbox = map_box(&m, input.bbox);
        }
        debug!(op = cx.name(), bbox = %info.bbox, "transform");
        Ok(info)
    }

    fn input_box(&self, bbox: &Bbox) -> Bbox {
        if self.is_identity() {
            return *bbox;
        }
        let mapped = map_box(&self.inverse, *bbox);
        let pad = self.margin();
        Bbox::new(mapped.x() - pad, mapped.y() - pad, mapped.r() + pad, mapped.t() + pad).intersect(&self.source)
    }

    fn tile_engine(
        &self,
        cx: &EngineCx<'_>,
        tile: &InputTile,
        y: i32,
        x: i32,
        r: i32,
        channels: &ChannelSet,
        row: &mut Row,
    ) -> Result<()> {
        let chans: Vec<Channel> = channels.iter().take_while(|c| *c <= cx.last_channel()).collect();
        let width = (r - x).max(0) as usize;
        if self.is_identity() {
            let mut line = vec![0.0f32; width];
            for ch in &chans {
                let src = tile.row(y, *ch);
                for (i, v) in line.iter_mut().enumerate() {
                    *v = src.get(x + i as i32);
                }
                row.span_mut(*ch, x, r).copy_from_slice(&line);
            }
            return Ok(());
        }

        let du = self.inverse.matrix2.x_axis;
        let dv = self.inverse.matrix2.y_axis;
        let aligned = self.axis_aligned();
        let s = self.source;
        let inside = |p: Vec2| p.x >= s.x() as f32 && p.x < s.r() as f32 && p.y >= s.y() as f32 && p.y < s.t() as f32;

        let mut planes = vec![vec![0.0f32; width]; chans.len()];
        let mut px = vec![0.0f32; chans.len()];
        for i in 0..width {
            let center = self.inverse.transform_point2(Vec2::new((x + i as i32) as f32 + 0.5, y as f32 + 0.5));
            if !inside(center) {
                continue;
            }
            if aligned {
                sample_rect(tile, center, du.x.abs(), dv.y.abs(), self.filter, self.clamp, &chans, &mut px);
            } else {
                sample_parallelogram(tile, center, du, dv, self.filter, self.clamp, &chans, &mut px);
            }
            for (k, v) in px.iter().enumerate() {
                planes[k][i] = *v;
            }
        }
        for (ch, line) in chans.iter().zip(&planes) {
            row.span_mut(*ch, x, r).copy_from_slice(line);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_matrix_pivots_around_center() {
        let mut t = Transform::new();
        t.set_center(10.0, 10.0);
        t.set_rotate(90.0);
        let p = t.matrix().transform_point2(Vec2::new(11.0, 10.0));
        assert_relative_eq!(p.x, 10.0, epsilon = 1e-5);
        assert_relative_eq!(p.y, 11.0, epsilon = 1e-5);
    }

    #[test]
    fn test_map_box_of_scale() {
        let m = Affine2::from_scale(Vec2::new(2.0, 0.5));
        assert_eq!(map_box(&m, Bbox::new(0, 0, 10, 10)), Bbox::new(0, 0, 20, 5));
    }

    #[test]
    fn test_identity_detection() {
        let mut t = Transform::new();
        assert!(t.is_identity());
        t.set_scale(1.0, 1.0);
        t.set_center(50.0, 20.0);
        assert!(t.is_identity());
        t.set_translate(0.5, 0.0);
        assert!(!t.is_identity());
    }
}
