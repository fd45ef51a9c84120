//! Half-open integer bounding boxes with edge-replicate semantics.
//!
//! A [`Bbox`] describes the region of definition of an image. Outside the
//! box the nearest edge pixel is replicated, so a box is never empty: the
//! smallest box is 1x1, and a box that is one pixel wide (or tall) stands
//! for a *constant* strip in that axis.
//!
//! # Coordinate System
//!
//! Compositing convention, y grows upwards:
//!
//! ```text
//!   Y
//!   ▲
//!   │      t ┌──────────┐
//!   │        │   bbox   │
//!   │      y └──────────┘
//!   │        x          r
//! (0,0) ─────────────────► X
//! ```
//!
//! A box contains the pixels with `x <= X < r` and `y <= Y < t`.
//!
//! # Usage
//!
//! ```rust
//! use vfx_core::Bbox;
//!
//! let frame = Bbox::new(0, 0, 100, 100);
//! let constant = Bbox::new(17, 42, 18, 43);
//!
//! // A constant box is neutral under union.
//! assert_eq!(frame.union(&constant), frame);
//!
//! // Reads outside the box replicate the edge.
//! assert_eq!(frame.clamp_x(-5), 0);
//! assert_eq!(frame.clamp_y(250), 99);
//! ```
//!
//! # Used By
//!
//! - [`crate::format::Format`] - aperture of a format
//! - `vfx-graph` - `Info`, requests, rows, planes and tiles

use std::fmt;

/// Half-open integer rectangle `[x, r) x [y, t)`.
///
/// # Invariants
///
/// `r > x` and `t > y` always hold; constructors clamp degenerate input to
/// a 1-pixel extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Bbox {
    x: i32,
    y: i32,
    r: i32,
    t: i32,
}

impl Default for Bbox {
    fn default() -> Self {
        Self::new(0, 0, 1, 1)
    }
}

impl Bbox {
    /// Creates a box from its left, bottom, right and top edges.
    ///
    /// If `r <= x` (or `t <= y`) the box collapses to a 1-pixel extent
    /// positioned at `x` (or `y`).
    #[inline]
    pub fn new(x: i32, y: i32, r: i32, t: i32) -> Self {
        Self {
            x,
            y,
            r: if r > x { r } else { x + 1 },
            t: if t > y { t } else { y + 1 },
        }
    }

    /// Strict constructor for boxes coming from user input.
    ///
    /// Unlike [`Bbox::new`], inverted or empty edges are an error.
    pub fn try_new(x: i32, y: i32, r: i32, t: i32) -> crate::Result<Self> {
        if r <= x {
            return Err(crate::Error::invalid_box(x, y, r, t, "r must be greater than x"));
        }
        if t <= y {
            return Err(crate::Error::invalid_box(x, y, r, t, "t must be greater than y"));
        }
        Ok(Self { x, y, r, t })
    }

    /// Creates a box from origin and size.
    #[inline]
    pub fn from_size(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self::new(x, y, x + width.max(1), y + height.max(1))
    }

    /// The 1x1 box at `(x, y)`, a constant region.
    #[inline]
    pub fn constant_at(x: i32, y: i32) -> Self {
        Self::new(x, y, x + 1, y + 1)
    }

    /// Left edge (inclusive).
    #[inline]
    pub const fn x(&self) -> i32 {
        self.x
    }

    /// Bottom edge (inclusive).
    #[inline]
    pub const fn y(&self) -> i32 {
        self.y
    }

    /// Right edge (exclusive).
    #[inline]
    pub const fn r(&self) -> i32 {
        self.r
    }

    /// Top edge (exclusive).
    #[inline]
    pub const fn t(&self) -> i32 {
        self.t
    }

    /// Width in pixels, always >= 1.
    #[inline]
    pub const fn w(&self) -> i32 {
        self.r - self.x
    }

    /// Height in pixels, always >= 1.
    #[inline]
    pub const fn h(&self) -> i32 {
        self.t - self.y
    }

    /// Number of pixels.
    #[inline]
    pub const fn area(&self) -> u64 {
        self.w() as u64 * self.h() as u64
    }

    /// True if the box is one pixel wide (constant in x).
    #[inline]
    pub const fn is_constant_x(&self) -> bool {
        self.w() == 1
    }

    /// True if the box is one pixel tall (constant in y).
    #[inline]
    pub const fn is_constant_y(&self) -> bool {
        self.h() == 1
    }

    /// True if the box is 1x1.
    #[inline]
    pub const fn is_constant(&self) -> bool {
        self.is_constant_x() && self.is_constant_y()
    }

    /// Sets all four edges, clamping to a minimum 1x1 extent.
    #[inline]
    pub fn set(&mut self, x: i32, y: i32, r: i32, t: i32) {
        *self = Self::new(x, y, r, t);
    }

    /// True if `(px, py)` is inside the box.
    #[inline]
    pub const fn contains(&self, px: i32, py: i32) -> bool {
        px >= self.x && px < self.r && py >= self.y && py < self.t
    }

    /// True if `other` lies entirely inside this box.
    #[inline]
    pub const fn contains_box(&self, other: &Bbox) -> bool {
        other.x >= self.x && other.r <= self.r && other.y >= self.y && other.t <= self.t
    }

    /// True if the two boxes share at least one pixel.
    #[inline]
    pub const fn overlaps(&self, other: &Bbox) -> bool {
        self.x < other.r && other.x < self.r && self.y < other.t && other.y < self.t
    }

    /// Clamps an x coordinate to the nearest column inside the box.
    #[inline]
    pub fn clamp_x(&self, x: i32) -> i32 {
        x.clamp(self.x, self.r - 1)
    }

    /// Clamps a y coordinate to the nearest row inside the box.
    #[inline]
    pub fn clamp_y(&self, y: i32) -> i32 {
        y.clamp(self.y, self.t - 1)
    }

    /// Clamps a point to the nearest pixel inside the box.
    #[inline]
    pub fn clamp(&self, x: i32, y: i32) -> (i32, i32) {
        (self.clamp_x(x), self.clamp_y(y))
    }

    /// Merges two boxes.
    ///
    /// Per axis: if either operand is constant (1 pixel) in that axis, the
    /// other operand's extent wins; when both are constant the second
    /// argument's position is kept. Otherwise the result spans both.
    pub fn union(&self, other: &Bbox) -> Bbox {
        let (x, r) = merge_axis(
            (self.x, self.r),
            (other.x, other.r),
            self.is_constant_x(),
            other.is_constant_x(),
        );
        let (y, t) = merge_axis(
            (self.y, self.t),
            (other.y, other.t),
            self.is_constant_y(),
            other.is_constant_y(),
        );
        Bbox::new(x, y, r, t)
    }

    /// Smallest box containing both, with no special case for constant
    /// axes. Used to accumulate requests, where a 1-pixel request is a real
    /// column rather than a constant.
    pub fn enclose(&self, other: &Bbox) -> Bbox {
        Bbox::new(
            self.x.min(other.x),
            self.y.min(other.y),
            self.r.max(other.r),
            self.t.max(other.t),
        )
    }

    /// In-place [`union`](Self::union).
    #[inline]
    pub fn merge(&mut self, other: &Bbox) {
        *self = self.union(other);
    }

    /// Largest box contained in both.
    ///
    /// If the boxes are disjoint in an axis the result in that axis is a
    /// single pixel positioned inside `other`, at the edge nearest to this
    /// box. The result is never empty and always lies inside `other`.
    pub fn intersect(&self, other: &Bbox) -> Bbox {
        let (x, r) = intersect_axis((self.x, self.r), (other.x, other.r));
        let (y, t) = intersect_axis((self.y, self.t), (other.y, other.t));
        Bbox::new(x, y, r, t)
    }

    /// Moves the four edges by the signed deltas.
    ///
    /// Axes that are constant (1 pixel) are left untouched; a shrink that
    /// would collapse an axis leaves it 1 pixel wide at the new left/bottom.
    pub fn pad(&self, dx: i32, dy: i32, dr: i32, dt: i32) -> Bbox {
        let (x, r) = if self.is_constant_x() {
            (self.x, self.r)
        } else {
            (self.x + dx, self.r + dr)
        };
        let (y, t) = if self.is_constant_y() {
            (self.y, self.t)
        } else {
            (self.y + dy, self.t + dt)
        };
        Bbox::new(x, y, r, t)
    }

    /// Grows the box by `n` pixels on every side (shrinks for negative `n`).
    #[inline]
    pub fn pad_uniform(&self, n: i32) -> Bbox {
        self.pad(-n, -n, n, n)
    }

    /// Translates the box.
    #[inline]
    pub fn shift(&self, dx: i32, dy: i32) -> Bbox {
        Bbox::new(self.x + dx, self.y + dy, self.r + dx, self.t + dy)
    }

    /// Scales the box about its centre, rounding outwards.
    pub fn scale(&self, sx: f64, sy: f64) -> Bbox {
        let cx = (self.x as f64 + self.r as f64) * 0.5;
        let cy = (self.y as f64 + self.t as f64) * 0.5;
        let hw = self.w() as f64 * 0.5 * sx.abs();
        let hh = self.h() as f64 * 0.5 * sy.abs();
        Bbox::new(
            (cx - hw).floor() as i32,
            (cy - hh).floor() as i32,
            (cx + hw).ceil() as i32,
            (cy + hh).ceil() as i32,
        )
    }

    /// Iterates pixels row-major: bottom to top, left to right.
    pub fn iter(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        (self.y..self.t).flat_map(move |y| (self.x..self.r).map(move |x| (x, y)))
    }

    /// Row range `y..t`.
    #[inline]
    pub fn rows(&self) -> std::ops::Range<i32> {
        self.y..self.t
    }

    /// Column range `x..r`.
    #[inline]
    pub fn columns(&self) -> std::ops::Range<i32> {
        self.x..self.r
    }
}

fn merge_axis(a: (i32, i32), b: (i32, i32), a_const: bool, b_const: bool) -> (i32, i32) {
    if a_const {
        b
    } else if b_const {
        a
    } else {
        (a.0.min(b.0), a.1.max(b.1))
    }
}

fn intersect_axis(a: (i32, i32), b: (i32, i32)) -> (i32, i32) {
    let lo = a.0.max(b.0);
    let hi = a.1.min(b.1);
    if hi > lo {
        (lo, hi)
    } else if a.1 <= b.0 {
        (b.0, b.0 + 1)
    } else {
        (b.1 - 1, b.1)
    }
}

impl fmt::Display for Bbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} {} {} {}]", self.x, self.y, self.r, self.t)
    }
}
