//! Rectangular pixel buffers.
//!
//! An [`ImagePlane`] stores `f32` pixels for a box and a channel set,
//! either *packed* (channels interleaved within a row) or *planar* (one
//! contiguous sub-plane per channel). Storage is allocated on first write
//! and reference counted: cloning a plane shares the buffer, and the first
//! write through a shared plane copies it.
//!
//! [`GenericImagePlane`] is what file readers hand back: integer or half
//! data plus the tags needed to turn it into linear floats.
//!
//! # Layout
//!
//! ```text
//! packed:   [r g b a][r g b a]...   row y.. then row y+1 ..
//! planar:   [r r r ...][g g g ...][b b b ...]
//! ```

use std::sync::Arc;

use half::f16;
use vfx_core::{Bbox, Channel, ChannelMap, ChannelSet};

/// Shape of an [`ImagePlane`].
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePlaneDescriptor {
    /// Covered pixels.
    pub bbox: Bbox,
    /// Channels interleaved within rows when true.
    pub packed: bool,
    /// Channels stored.
    pub channels: ChannelSet,
}

impl ImagePlaneDescriptor {
    /// Creates a descriptor.
    pub fn new(bbox: Bbox, packed: bool, channels: ChannelSet) -> Self {
        Self {
            bbox,
            packed,
            channels,
        }
    }
}

/// Float pixel buffer for a box and a channel set.
#[derive(Debug, Clone)]
pub struct ImagePlane {
    desc: ImagePlaneDescriptor,
    map: ChannelMap,
    data: Option<Arc<Vec<f32>>>,
}

impl ImagePlane {
    /// Creates an unallocated plane; it reads as zero until written.
    ///
    /// `channels` must be finite.
    pub fn new(bbox: Bbox, channels: &ChannelSet, packed: bool) -> Self {
        Self::from_descriptor(ImagePlaneDescriptor::new(bbox, packed, channels.clone()))
    }

    /// Creates a plane from a descriptor.
    pub fn from_descriptor(desc: ImagePlaneDescriptor) -> Self {
        let map = ChannelMap::new(&desc.channels);
        Self {
            desc,
            map,
            data: None,
        }
    }

    /// The descriptor.
    #[inline]
    pub fn descriptor(&self) -> &ImagePlaneDescriptor {
        &self.desc
    }

    /// Covered box.
    #[inline]
    pub fn bbox(&self) -> Bbox {
        self.desc.bbox
    }

    /// Stored channels.
    #[inline]
    pub fn channels(&self) -> &ChannelSet {
        &self.desc.channels
    }

    /// True if channels are interleaved.
    #[inline]
    pub fn packed(&self) -> bool {
        self.desc.packed
    }

    /// Number of stored channels.
    #[inline]
    pub fn nc(&self) -> usize {
        self.map.len()
    }

    /// Position of a channel in the plane.
    #[inline]
    pub fn chan_no(&self, ch: Channel) -> Option<usize> {
        self.map.index_of(ch)
    }

    /// Floats between horizontally adjacent pixels of one channel.
    #[inline]
    pub fn col_stride(&self) -> usize {
        if self.desc.packed { self.nc() } else { 1 }
    }

    /// Floats between vertically adjacent pixels of one channel.
    #[inline]
    pub fn row_stride(&self) -> usize {
        let w = self.desc.bbox.w() as usize;
        if self.desc.packed { w * self.nc() } else { w }
    }

    /// Floats between the same pixel of consecutive channels.
    #[inline]
    pub fn chan_stride(&self) -> usize {
        if self.desc.packed {
            1
        } else {
            self.desc.bbox.area() as usize
        }
    }

    /// Total float count.
    #[inline]
    pub fn len(&self) -> usize {
        self.desc.bbox.area() as usize * self.nc()
    }

    /// True if the plane stores nothing.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once storage exists.
    #[inline]
    pub fn is_allocated(&self) -> bool {
        self.data.is_some()
    }

    /// True if another plane shares this buffer.
    pub fn is_shared(&self) -> bool {
        self.data.as_ref().is_some_and(|d| Arc::strong_count(d) > 1)
    }

    /// Index of `(x, y)` in channel slot `z`. `(x, y)` must be inside.
    #[inline]
    pub fn index(&self, x: i32, y: i32, z: usize) -> usize {
        let b = self.desc.bbox;
        (y - b.y()) as usize * self.row_stride() + (x - b.x()) as usize * self.col_stride() + z * self.chan_stride()
    }

    /// Raw buffer; empty until allocated.
    pub fn data(&self) -> &[f32] {
        self.data.as_deref().map_or(&[][..], |v| v.as_slice())
    }

    /// Writable buffer, allocating or un-sharing as needed.
    pub fn writable(&mut self) -> &mut [f32] {
        let len = self.len();
        let data = self.data.get_or_insert_with(|| Arc::new(vec![0.0; len]));
        &mut Arc::make_mut(data)[..]
    }

    /// Value at `(x, y)` for a channel, edge-clamped to the box.
    ///
    /// Channels not stored read as zero.
    pub fn at(&self, x: i32, y: i32, ch: Channel) -> f32 {
        let Some(z) = self.chan_no(ch) else {
            return 0.0;
        };
        let (x, y) = self.desc.bbox.clamp(x, y);
        self.data().get(self.index(x, y, z)).copied().unwrap_or(0.0)
    }

    /// Writes one value. `(x, y)` must be inside and the channel stored.
    pub fn set(&mut self, x: i32, y: i32, ch: Channel, value: f32) {
        if let Some(z) = self.chan_no(ch) {
            if self.desc.bbox.contains(x, y) {
                let i = self.index(x, y, z);
                self.writable()[i] = value;
            }
        }
    }

    /// Fills every channel with one value.
    pub fn fill(&mut self, value: f32) {
        self.writable().fill(value);
    }

    /// Strided read access to one channel of row `y`.
    pub fn row(&self, y: i32, ch: Channel) -> StridedRow<'_> {
        let b = self.desc.bbox;
        let y = b.clamp_y(y);
        match self.chan_no(ch) {
            Some(z) if self.is_allocated() => StridedRow {
                data: self.data(),
                start: self.index(b.x(), y, z),
                stride: self.col_stride(),
                x: b.x(),
                r: b.r(),
            },
            _ => StridedRow::zero(b.x(), b.r()),
        }
    }

    /// Copies `x <= X < r` of one channel of row `y` into `out`.
    pub fn read_row(&self, y: i32, ch: Channel, x: i32, out: &mut [f32]) {
        let row = self.row(y, ch);
        for (i, v) in out.iter_mut().enumerate() {
            *v = row.get(x + i as i32);
        }
    }

    /// Writes `values` into one channel of row `y` starting at `x`.
    pub fn write_row(&mut self, y: i32, ch: Channel, x: i32, values: &[f32]) {
        let Some(z) = self.chan_no(ch) else {
            return;
        };
        let b = self.desc.bbox;
        if y < b.y() || y >= b.t() {
            return;
        }
        let stride = self.col_stride();
        let lo = x.max(b.x());
        let hi = (x + values.len() as i32).min(b.r());
        if lo >= hi {
            return;
        }
        let base = self.index(lo, y, z);
        let buf = self.writable();
        for (k, xx) in (lo..hi).enumerate() {
            buf[base + k * stride] = values[(xx - x) as usize];
        }
    }

    /// Copies the overlap of boxes and channels from `src`, whatever the
    /// layouts are.
    pub fn copy_from(&mut self, src: &ImagePlane) {
        let overlap = self.desc.bbox.intersect(&src.desc.bbox);
        if !self.desc.bbox.overlaps(&src.desc.bbox) {
            return;
        }
        let common = self.desc.channels.intersection(&src.desc.channels);
        let mut tmp = vec![0.0f32; overlap.w() as usize];
        for ch in common.explicit() {
            for y in overlap.rows() {
                src.read_row(y, ch, overlap.x(), &mut tmp);
                self.write_row(y, ch, overlap.x(), &tmp);
            }
        }
    }

    /// Same pixels in the other layout.
    pub fn to_layout(&self, packed: bool) -> ImagePlane {
        if packed == self.desc.packed {
            return self.clone();
        }
        let mut out = ImagePlane::new(self.desc.bbox, &self.desc.channels, packed);
        if self.is_allocated() {
            out.copy_from(self);
        }
        out
    }
}

/// One channel of one row inside a plane or tile.
#[derive(Debug, Clone, Copy)]
pub struct StridedRow<'a> {
    data: &'a [f32],
    start: usize,
    stride: usize,
    x: i32,
    r: i32,
}

impl<'a> StridedRow<'a> {
    /// Row over a contiguous slice whose element 0 is at `x`.
    pub fn contiguous(data: &'a [f32], x: i32) -> Self {
        Self {
            data,
            start: 0,
            stride: 1,
            x,
            r: x + data.len() as i32,
        }
    }

    /// Row that reads zero everywhere.
    pub fn zero(x: i32, r: i32) -> Self {
        Self {
            data: &[],
            start: 0,
            stride: 0,
            x,
            r,
        }
    }

    /// Left edge of stored data.
    #[inline]
    pub fn x(&self) -> i32 {
        self.x
    }

    /// Right edge of stored data.
    #[inline]
    pub fn r(&self) -> i32 {
        self.r
    }

    /// Value at `x`, replicating the edge pixels outside the row.
    #[inline]
    pub fn get(&self, x: i32) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        let x = x.clamp(self.x, self.r - 1);
        self.data[self.start + (x - self.x) as usize * self.stride]
    }
}

/// Storage type of a [`GenericImagePlane`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataType {
    /// 8-bit unsigned, normalised.
    U8,
    /// 16-bit unsigned, normalised.
    U16,
    /// 32-bit unsigned, normalised.
    U32,
    /// IEEE half.
    Half,
    /// IEEE single.
    #[default]
    Float,
    /// Three 10-bit components per 32-bit word, top bits first.
    Packed10,
}

impl DataType {
    /// Bytes per stored component (packed 10-bit counts one word per
    /// three components).
    pub fn bytes(&self) -> usize {
        match self {
            DataType::U8 => 1,
            DataType::U16 | DataType::Half => 2,
            DataType::U32 | DataType::Float | DataType::Packed10 => 4,
        }
    }

    /// True for float storage.
    pub fn is_float(&self) -> bool {
        matches!(self, DataType::Half | DataType::Float)
    }

    /// Largest code value of integer types.
    pub fn max_value(&self) -> f64 {
        match self {
            DataType::U8 => 255.0,
            DataType::U16 => 65535.0,
            DataType::U32 => u32::MAX as f64,
            DataType::Packed10 => 1023.0,
            DataType::Half | DataType::Float => 1.0,
        }
    }
}

/// Transfer curve applied to stored values.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ColorCurve {
    /// Already linear.
    #[default]
    Linear,
    /// sRGB piecewise curve.
    Srgb,
    /// Rec.709 OETF.
    Rec709,
    /// Pure power curve with the given gamma.
    Gamma(f32),
}

impl ColorCurve {
    /// Converts an encoded value to linear light.
    pub fn to_linear(&self, v: f32) -> f32 {
        match *self {
            ColorCurve::Linear => v,
            ColorCurve::Srgb => {
                if v <= 0.04045 {
                    v / 12.92
                } else {
                    ((v + 0.055) / 1.055).powf(2.4)
                }
            }
            ColorCurve::Rec709 => {
                if v < 0.081 {
                    v / 4.5
                } else {
                    ((v + 0.099) / 1.099).powf(1.0 / 0.45)
                }
            }
            ColorCurve::Gamma(g) => {
                if v <= 0.0 {
                    v
                } else {
                    v.powf(g)
                }
            }
        }
    }

    /// Converts a linear value to the encoded domain.
    pub fn from_linear(&self, v: f32) -> f32 {
        match *self {
            ColorCurve::Linear => v,
            ColorCurve::Srgb => {
                if v <= 0.0031308 {
                    v * 12.92
                } else {
                    1.055 * v.powf(1.0 / 2.4) - 0.055
                }
            }
            ColorCurve::Rec709 => {
                if v < 0.018 {
                    v * 4.5
                } else {
                    1.099 * v.powf(0.45) - 0.099
                }
            }
            ColorCurve::Gamma(g) => {
                if v <= 0.0 {
                    v
                } else {
                    v.powf(1.0 / g)
                }
            }
        }
    }
}

/// Typed sample storage of a [`GenericImagePlane`].
#[derive(Debug, Clone)]
pub enum GenericData {
    /// 8-bit samples.
    U8(Vec<u8>),
    /// 16-bit samples.
    U16(Vec<u16>),
    /// 32-bit samples.
    U32(Vec<u32>),
    /// Half samples.
    Half(Vec<f16>),
    /// Float samples.
    Float(Vec<f32>),
    /// Packed 10-bit words.
    Packed10(Vec<u32>),
}

impl GenericData {
    /// Data type tag.
    pub fn data_type(&self) -> DataType {
        match self {
            GenericData::U8(_) => DataType::U8,
            GenericData::U16(_) => DataType::U16,
            GenericData::U32(_) => DataType::U32,
            GenericData::Half(_) => DataType::Half,
            GenericData::Float(_) => DataType::Float,
            GenericData::Packed10(_) => DataType::Packed10,
        }
    }
}

/// Packed pixel data as decoded by a reader.
///
/// Components of a pixel are interleaved, rows are stored in
/// `ydirection` order (positive means bottom row first), and `swizzle[i]`
/// names the stored component that feeds the i-th channel of `channels`.
#[derive(Debug, Clone)]
pub struct GenericImagePlane {
    /// Covered pixels.
    pub bbox: Bbox,
    /// Channels produced, in ascending order.
    pub channels: ChannelSet,
    /// Stored components per pixel.
    pub components: usize,
    /// Samples.
    pub data: GenericData,
    /// Transfer curve of the samples.
    pub curve: ColorCurve,
    /// Row storage order: `>= 0` bottom-up, `< 0` top-down.
    pub ydirection: i32,
    /// Optional component permutation.
    pub swizzle: Option<Vec<usize>>,
}

impl GenericImagePlane {
    /// Float, linear, bottom-up plane with one component per channel.
    pub fn from_floats(bbox: Bbox, channels: ChannelSet, data: Vec<f32>) -> Self {
        let components = channels.len().unwrap_or(0);
        Self {
            bbox,
            channels,
            components,
            data: GenericData::Float(data),
            curve: ColorCurve::Linear,
            ydirection: 1,
            swizzle: None,
        }
    }

    /// Normalised value of stored component `c` of pixel index `p`.
    fn sample(&self, p: usize, c: usize) -> f32 {
        let i = p * self.components + c;
        let dt = self.data.data_type();
        match &self.data {
            GenericData::U8(v) => v.get(i).map_or(0.0, |&s| s as f32 / dt.max_value() as f32),
            GenericData::U16(v) => v.get(i).map_or(0.0, |&s| s as f32 / dt.max_value() as f32),
            GenericData::U32(v) => v.get(i).map_or(0.0, |&s| (s as f64 / dt.max_value()) as f32),
            GenericData::Half(v) => v.get(i).map_or(0.0, |s| s.to_f32()),
            GenericData::Float(v) => v.get(i).copied().unwrap_or(0.0),
            GenericData::Packed10(v) => {
                let words_per_pixel = self.components.div_ceil(3);
                let word = v.get(p * words_per_pixel + c / 3).copied().unwrap_or(0);
                let shift = 22 - 10 * (c % 3) as u32;
                ((word >> shift) & 0x3ff) as f32 / 1023.0
            }
        }
    }

    /// Decodes into a linear float plane.
    pub fn to_image_plane(&self, packed: bool) -> ImagePlane {
        let mut plane = ImagePlane::new(self.bbox, &self.channels, packed);
        let w = self.bbox.w() as usize;
        let h = self.bbox.h() as usize;
        let channels: Vec<Channel> = self.channels.explicit().collect();
        let mut tmp = vec![0.0f32; w];
        for row in 0..h {
            let stored_row = if self.ydirection >= 0 { row } else { h - 1 - row };
            let y = self.bbox.y() + row as i32;
            for (i, ch) in channels.iter().enumerate() {
                let c = self.swizzle.as_ref().and_then(|s| s.get(i).copied()).unwrap_or(i);
                if c >= self.components {
                    tmp.fill(0.0);
                } else {
                    for (x, v) in tmp.iter_mut().enumerate() {
                        let s = self.sample(stored_row * w + x, c);
                        // Alpha is never curve-encoded.
                        *v = if *ch == Channel::ALPHA { s } else { self.curve.to_linear(s) };
                    }
                }
                plane.write_row(y, *ch, self.bbox.x(), &tmp);
            }
        }
        plane
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ramp(packed: bool) -> ImagePlane {
        let mut p = ImagePlane::new(Bbox::new(0, 0, 4, 2), &ChannelSet::rgb(), packed);
        for y in 0..2 {
            for x in 0..4 {
                p.set(x, y, Channel::RED, x as f32);
                p.set(x, y, Channel::GREEN, y as f32);
                p.set(x, y, Channel::BLUE, (x + 10 * y) as f32);
            }
        }
        p
    }

    #[test]
    fn test_strides() {
        let p = ImagePlane::new(Bbox::new(0, 0, 4, 2), &ChannelSet::rgb(), true);
        assert_eq!((p.col_stride(), p.row_stride(), p.chan_stride()), (3, 12, 1));
        let p = ImagePlane::new(Bbox::new(0, 0, 4, 2), &ChannelSet::rgb(), false);
        assert_eq!((p.col_stride(), p.row_stride(), p.chan_stride()), (1, 4, 8));
    }

    #[test]
    fn test_lazy_allocation_reads_zero() {
        let p = ImagePlane::new(Bbox::new(0, 0, 4, 4), &ChannelSet::rgba(), true);
        assert!(!p.is_allocated());
        assert_eq!(p.at(2, 2, Channel::ALPHA), 0.0);
    }

    #[test]
    fn test_layouts_agree() {
        let a = ramp(true);
        let b = ramp(false);
        for y in 0..2 {
            for x in 0..4 {
                for ch in [Channel::RED, Channel::GREEN, Channel::BLUE] {
                    assert_eq!(a.at(x, y, ch), b.at(x, y, ch));
                }
            }
        }
        let c = a.to_layout(false);
        assert_eq!(c.data(), b.data());
    }

    #[test]
    fn test_edge_clamped_reads() {
        let p = ramp(true);
        assert_eq!(p.at(-3, 0, Channel::RED), 0.0);
        assert_eq!(p.at(10, 0, Channel::RED), 3.0);
        assert_eq!(p.at(3, 7, Channel::BLUE), 13.0);
        assert_eq!(p.row(1, Channel::BLUE).get(99), 13.0);
    }

    #[test]
    fn test_copy_on_write() {
        let a = ramp(true);
        let mut b = a.clone();
        assert!(a.is_shared());
        b.set(0, 0, Channel::RED, 42.0);
        assert_eq!(a.at(0, 0, Channel::RED), 0.0);
        assert_eq!(b.at(0, 0, Channel::RED), 42.0);
        assert!(!a.is_shared());
    }

    #[test]
    fn test_copy_from_overlap() {
        let src = ramp(false);
        let mut dst = ImagePlane::new(Bbox::new(2, 1, 6, 3), &ChannelSet::rgba(), true);
        dst.copy_from(&src);
        assert_eq!(dst.at(3, 1, Channel::BLUE), 13.0);
        assert_eq!(dst.at(5, 2, Channel::RED), 0.0);
        assert_eq!(dst.at(3, 1, Channel::ALPHA), 0.0);
    }

    #[test]
    fn test_generic_u8_srgb_top_down() {
        // Two rows stored top-down: the first stored row is y = 1.
        let g = GenericImagePlane {
            bbox: Bbox::new(0, 0, 1, 2),
            channels: ChannelSet::red(),
            components: 1,
            data: GenericData::U8(vec![255, 0]),
            curve: ColorCurve::Srgb,
            ydirection: -1,
            swizzle: None,
        };
        let p = g.to_image_plane(true);
        assert_relative_eq!(p.at(0, 1, Channel::RED), 1.0, epsilon = 1e-6);
        assert_eq!(p.at(0, 0, Channel::RED), 0.0);
    }

    #[test]
    fn test_generic_swizzle_and_half() {
        // Stored as BGR; swizzle maps channel i to component 2 - i.
        let data = [0.25f32, 0.5, 0.75].iter().map(|&v| f16::from_f32(v)).collect();
        let g = GenericImagePlane {
            bbox: Bbox::new(0, 0, 1, 1),
            channels: ChannelSet::rgb(),
            components: 3,
            data: GenericData::Half(data),
            curve: ColorCurve::Linear,
            ydirection: 1,
            swizzle: Some(vec![2, 1, 0]),
        };
        let p = g.to_image_plane(false);
        assert_eq!(p.at(0, 0, Channel::RED), 0.75);
        assert_eq!(p.at(0, 0, Channel::BLUE), 0.25);
    }

    #[test]
    fn test_generic_packed10() {
        let word = (1023u32 << 22) | (512 << 12);
        let g = GenericImagePlane {
            bbox: Bbox::new(0, 0, 1, 1),
            channels: ChannelSet::rgb(),
            components: 3,
            data: GenericData::Packed10(vec![word]),
            curve: ColorCurve::Linear,
            ydirection: 1,
            swizzle: None,
        };
        let p = g.to_image_plane(true);
        assert_eq!(p.at(0, 0, Channel::RED), 1.0);
        assert_relative_eq!(p.at(0, 0, Channel::GREEN), 512.0 / 1023.0);
        assert_eq!(p.at(0, 0, Channel::BLUE), 0.0);
    }

    #[test]
    fn test_curves_invert() {
        for curve in [ColorCurve::Srgb, ColorCurve::Rec709, ColorCurve::Gamma(2.2)] {
            for v in [0.0f32, 0.01, 0.18, 0.5, 1.0] {
                assert_relative_eq!(curve.to_linear(curve.from_linear(v)), v, epsilon = 1e-4);
            }
        }
    }
}
