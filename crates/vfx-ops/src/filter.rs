//! Reconstruction and resampling filters.
//!
//! Every filter is separable: a 2D lookup multiplies the 1D weights of
//! the x and y axes. Weights are computed for a footprint given as a
//! center position and a width in source pixels; widths below one pixel
//! are treated as one, so magnification interpolates and minification
//! averages.
//!
//! # Filters
//!
//! - [`Filter::Impulse`] - nearest pixel, no filtering
//! - [`Filter::Box`] - average over the footprint
//! - [`Filter::Triangle`] - linear interpolation
//! - [`Filter::Quadratic`] - smooth, slightly soft
//! - [`Filter::Cubic`] - Mitchell-Netravali family by `(b, c)`
//! - [`Filter::Gaussian`] - soft, no ringing
//! - [`Filter::Lanczos3`] - windowed sinc, sharpest
//!
//! # Example
//!
//! ```rust
//! use vfx_ops::filter::Filter;
//!
//! // Halfway between pixel 0 and pixel 1 centers.
//! let w = Filter::Triangle.weights(1.0, 1.0);
//! assert_eq!(w.start, 0);
//! assert_eq!(w.values, vec![0.5, 0.5]);
//! ```

use std::fmt;
use std::str::FromStr;

use crate::{OpsError, OpsResult};

/// Resampling filter kind.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Filter {
    /// Nearest pixel.
    Impulse,
    /// Box average.
    Box,
    /// Linear (tent).
    Triangle,
    /// Quadratic B-spline.
    Quadratic,
    /// Cubic with Mitchell-Netravali parameters.
    Cubic {
        /// Blur parameter.
        b: f32,
        /// Ringing parameter.
        c: f32,
    },
    /// Gaussian with a standard deviation of half a pixel.
    #[default]
    Gaussian,
    /// Lanczos with three lobes.
    Lanczos3,
}

impl Filter {
    /// Plain cubic B-spline (`b = 1, c = 0`).
    pub const CUBIC: Filter = Filter::Cubic { b: 1.0, c: 0.0 };
    /// Mitchell-Netravali (`b = c = 1/3`).
    pub const MITCHELL: Filter = Filter::Cubic {
        b: 1.0 / 3.0,
        c: 1.0 / 3.0,
    };
    /// Catmull-Rom spline (`b = 0, c = 1/2`).
    pub const CATMULL_ROM: Filter = Filter::Cubic { b: 0.0, c: 0.5 };
    /// Notch filter (`b = 3/2, c = -1/4`).
    pub const NOTCH: Filter = Filter::Cubic { b: 1.5, c: -0.25 };

    /// Support radius at unit scale.
    #[inline]
    pub fn support(&self) -> f32 {
        match self {
            Filter::Impulse | Filter::Box => 0.5,
            Filter::Triangle => 1.0,
            Filter::Quadratic => 1.5,
            Filter::Cubic { .. } | Filter::Gaussian => 2.0,
            Filter::Lanczos3 => 3.0,
        }
    }

    /// True if the filter has negative lobes and may overshoot.
    pub fn rings(&self) -> bool {
        match self {
            Filter::Cubic { c, .. } => *c > 0.0,
            Filter::Lanczos3 => true,
            _ => false,
        }
    }

    /// Evaluates the kernel at distance `x`, in unit-scale pixels.
    #[inline]
    pub fn weight(&self, x: f32) -> f32 {
        match self {
            Filter::Impulse | Filter::Box => box_weight(x),
            Filter::Triangle => triangle_weight(x),
            Filter::Quadratic => quadratic_weight(x),
            Filter::Cubic { b, c } => cubic_weight(x, *b, *c),
            Filter::Gaussian => gaussian_weight(x),
            Filter::Lanczos3 => lanczos_weight(x, 3.0),
        }
    }

    /// Normalised weights of the pixels under a footprint.
    ///
    /// Pixel `i` covers `[i, i + 1)`, so its center is `i + 0.5`. `width`
    /// is the footprint size in pixels.
    pub fn weights(&self, center: f32, width: f32) -> Weights {
        let nearest = Weights {
            start: center.floor() as i32,
            values: vec![1.0],
        };
        if *self == Filter::Impulse || !center.is_finite() {
            return nearest;
        }
        let scale = if width.is_finite() { width.abs().max(1.0) } else { 1.0 };
        let radius = self.support() * scale;
        let start = (center - radius).floor() as i32;
        let end = (center + radius).ceil() as i32;

        let mut values: Vec<f32> = (start..end)
            .map(|i| self.weight((i as f32 + 0.5 - center) / scale))
            .collect();
        let sum: f32 = values.iter().sum();
        if sum.abs() < 1e-8 {
            return nearest;
        }
        values.iter_mut().for_each(|w| *w /= sum);

        let lead = values.iter().take_while(|w| **w == 0.0).count();
        let trail = values.iter().rev().take_while(|w| **w == 0.0).count();
        values.truncate(values.len() - trail);
        values.drain(..lead);
        Weights {
            start: start + lead as i32,
            values,
        }
    }

    /// Symmetric discrete kernel for a blur of `size` pixels, centered on
    /// pixel 0.
    pub fn kernel(&self, size: f32) -> Weights {
        if size <= 0.0 {
            return Weights {
                start: 0,
                values: vec![1.0],
            };
        }
        self.weights(0.5, size)
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Filter::Impulse => f.write_str("impulse"),
            Filter::Box => f.write_str("box"),
            Filter::Triangle => f.write_str("triangle"),
            Filter::Quadratic => f.write_str("quadratic"),
            Filter::Gaussian => f.write_str("gaussian"),
            Filter::Lanczos3 => f.write_str("lanczos3"),
            c if c == Filter::CUBIC => f.write_str("cubic"),
            c if c == Filter::MITCHELL => f.write_str("mitchell"),
            c if c == Filter::CATMULL_ROM => f.write_str("catmullrom"),
            c if c == Filter::NOTCH => f.write_str("notch"),
            Filter::Cubic { b, c } => write!(f, "cubic({b}, {c})"),
        }
    }
}

impl FromStr for Filter {
    type Err = OpsError;

    fn from_str(s: &str) -> OpsResult<Self> {
        Ok(match s.to_ascii_lowercase().replace(['-', '_', ' '], "").as_str() {
            "impulse" | "nearest" => Filter::Impulse,
            "box" => Filter::Box,
            "triangle" | "linear" | "bilinear" => Filter::Triangle,
            "quadratic" => Filter::Quadratic,
            "cubic" => Filter::CUBIC,
            "mitchell" => Filter::MITCHELL,
            "catmullrom" => Filter::CATMULL_ROM,
            "notch" => Filter::NOTCH,
            "gaussian" => Filter::Gaussian,
            "lanczos3" | "lanczos" => Filter::Lanczos3,
            other => return Err(OpsError::InvalidParameter(format!("unknown filter '{other}'"))),
        })
    }
}

/// Weights of consecutive pixels starting at `start`.
#[derive(Debug, Clone, PartialEq)]
pub struct Weights {
    /// First pixel index.
    pub start: i32,
    /// One weight per pixel; they sum to one.
    pub values: Vec<f32>,
}

impl Weights {
    /// Pixel indices paired with their weights.
    pub fn iter(&self) -> impl Iterator<Item = (i32, f32)> + '_ {
        self.values.iter().enumerate().map(|(i, w)| (self.start + i as i32, *w))
    }

    /// Number of taps.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True for an empty set.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Last pixel index plus one.
    pub fn end(&self) -> i32 {
        self.start + self.values.len() as i32
    }
}

#[inline]
fn box_weight(x: f32) -> f32 {
    if (-0.5..0.5).contains(&x) { 1.0 } else { 0.0 }
}

#[inline]
fn triangle_weight(x: f32) -> f32 {
    let ax = x.abs();
    if ax < 1.0 { 1.0 - ax } else { 0.0 }
}

#[inline]
fn quadratic_weight(x: f32) -> f32 {
    let ax = x.abs();
    if ax < 0.5 {
        0.75 - ax * ax
    } else if ax < 1.5 {
        let t = ax - 1.5;
        0.5 * t * t
    } else {
        0.0
    }
}

/// Mitchell-Netravali cubic.
#[inline]
fn cubic_weight(x: f32, b: f32, c: f32) -> f32 {
    let ax = x.abs();
    if ax < 1.0 {
        ((12.0 - 9.0 * b - 6.0 * c) * ax * ax * ax + (-18.0 + 12.0 * b + 6.0 * c) * ax * ax + (6.0 - 2.0 * b)) / 6.0
    } else if ax < 2.0 {
        ((-b - 6.0 * c) * ax * ax * ax
            + (6.0 * b + 30.0 * c) * ax * ax
            + (-12.0 * b - 48.0 * c) * ax
            + (8.0 * b + 24.0 * c))
            / 6.0
    } else {
        0.0
    }
}

#[inline]
fn gaussian_weight(x: f32) -> f32 {
    if x.abs() >= 2.0 { 0.0 } else { (-2.0 * x * x).exp() }
}

#[inline]
fn lanczos_weight(x: f32, a: f32) -> f32 {
    let ax = x.abs();
    if ax < 1e-8 {
        1.0
    } else if ax < a {
        let pi_x = std::f32::consts::PI * ax;
        let pi_x_a = pi_x / a;
        (pi_x.sin() / pi_x) * (pi_x_a.sin() / pi_x_a)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const ALL: [Filter; 10] = [
        Filter::Impulse,
        Filter::Box,
        Filter::Triangle,
        Filter::Quadratic,
        Filter::CUBIC,
        Filter::MITCHELL,
        Filter::CATMULL_ROM,
        Filter::NOTCH,
        Filter::Gaussian,
        Filter::Lanczos3,
    ];

    #[test]
    fn test_weights_sum_to_one() {
        for f in ALL {
            for (center, width) in [(0.5, 1.0), (3.3, 1.0), (10.0, 2.0), (7.25, 5.5), (-4.1, 0.3)] {
                let w = f.weights(center, width);
                let sum: f32 = w.values.iter().sum();
                assert_relative_eq!(sum, 1.0, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_triangle_interpolates() {
        let w = Filter::Triangle.weights(1.3, 1.0);
        let pairs: Vec<_> = w.iter().collect();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0, 0);
        assert_relative_eq!(pairs[0].1, 0.2, epsilon = 1e-6);
        assert_relative_eq!(pairs[1].1, 0.8, epsilon = 1e-6);
    }

    #[test]
    fn test_box_minify_averages() {
        // Footprint of two pixels starting at pixel 4.
        let w = Filter::Box.weights(5.0, 2.0);
        assert_eq!(w.start, 4);
        assert_eq!(w.values, vec![0.5, 0.5]);
    }

    #[test]
    fn test_on_center_interpolators_are_exact() {
        for f in [Filter::Triangle, Filter::CATMULL_ROM, Filter::Lanczos3, Filter::Impulse, Filter::Box] {
            let w = f.weights(6.5, 1.0);
            let v: Vec<_> = w.iter().filter(|(_, w)| w.abs() > 1e-6).collect();
            assert_eq!(v.len(), 1, "{f}");
            assert_eq!(v[0].0, 6);
        }
    }

    #[test]
    fn test_ringing_flags() {
        assert!(Filter::CATMULL_ROM.rings());
        assert!(Filter::MITCHELL.rings());
        assert!(!Filter::CUBIC.rings());
        assert!(!Filter::Gaussian.rings());
        let w = Filter::CATMULL_ROM.weights(2.0, 1.0);
        assert!(w.values.iter().any(|v| *v < 0.0));
    }

    #[test]
    fn test_kernel_is_symmetric() {
        let k = Filter::Gaussian.kernel(6.0);
        assert_eq!(k.start, -k.end() + 1);
        for (a, b) in k.values.iter().zip(k.values.iter().rev()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-6);
        }
        assert_eq!(Filter::Box.kernel(0.0).values, vec![1.0]);
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("Catmull-Rom".parse::<Filter>().ok(), Some(Filter::CATMULL_ROM));
        assert_eq!("linear".parse::<Filter>().ok(), Some(Filter::Triangle));
        assert_eq!(Filter::MITCHELL.to_string(), "mitchell");
        assert!("sinc".parse::<Filter>().is_err());
    }
}
