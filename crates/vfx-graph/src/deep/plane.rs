//! Deep sample storage.

use std::sync::Arc;

use smallvec::SmallVec;
use vfx_core::{Bbox, Channel, ChannelMap, ChannelSet};

use crate::plane::ImagePlane;
use crate::{GraphError, Result};

/// How samples within each pixel are ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeepOrdering {
    /// No guarantee.
    #[default]
    Unordered,
    /// Front depth ascending.
    ZAscending,
    /// Front depth descending.
    ZDescending,
}

/// One sample detached from its plane.
///
/// `color` holds every non-depth, non-alpha channel in the order the
/// caller asked for, premultiplied by `alpha`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeepSample {
    /// Front depth.
    pub front: f32,
    /// Back depth; equal to `front` for a point sample.
    pub back: f32,
    /// Coverage.
    pub alpha: f32,
    /// Premultiplied colour channels.
    pub color: SmallVec<[f32; 4]>,
}

impl DeepSample {
    /// A sample with explicit depth range.
    pub fn new(front: f32, back: f32, alpha: f32, color: &[f32]) -> Self {
        Self {
            front: front.min(back),
            back: front.max(back),
            alpha,
            color: SmallVec::from_slice(color),
        }
    }

    /// A point sample at `z`.
    pub fn point(z: f32, alpha: f32, color: &[f32]) -> Self {
        Self::new(z, z, alpha, color)
    }

    /// Zero thickness.
    pub fn is_point(&self) -> bool {
        self.back <= self.front
    }
}

/// Per-pixel sample lists over a box.
///
/// Every sample stores one value per channel of the plane; the channel
/// set always contains the front and back depth.
#[derive(Debug, Clone)]
pub struct DeepPlane {
    bbox: Bbox,
    channels: ChannelSet,
    map: ChannelMap,
    /// `offsets[i]..offsets[i + 1]` are the samples of pixel `i`.
    offsets: Vec<usize>,
    data: Arc<Vec<f32>>,
    ordering: DeepOrdering,
}

impl DeepPlane {
    /// A plane with no samples anywhere.
    pub fn empty(bbox: Bbox, channels: &ChannelSet) -> Self {
        let channels = with_depths(channels);
        let map = ChannelMap::new(&channels);
        Self {
            bbox,
            channels,
            map,
            offsets: vec![0; bbox.area() as usize + 1],
            data: Arc::new(Vec::new()),
            ordering: DeepOrdering::ZAscending,
        }
    }

    /// Covered box.
    pub fn bbox(&self) -> Bbox {
        self.bbox
    }

    /// Channels stored per sample, depths included.
    pub fn channels(&self) -> &ChannelSet {
        &self.channels
    }

    /// Sample ordering guarantee.
    pub fn ordering(&self) -> DeepOrdering {
        self.ordering
    }

    /// Total number of samples.
    pub fn total_samples(&self) -> usize {
        self.offsets.last().copied().unwrap_or(0)
    }

    fn pixel_index(&self, x: i32, y: i32) -> Option<usize> {
        if !self.bbox.contains(x, y) {
            return None;
        }
        Some(((y - self.bbox.y()) * self.bbox.w() + (x - self.bbox.x())) as usize)
    }

    /// Samples of one pixel; empty outside the box.
    pub fn pixel(&self, x: i32, y: i32) -> DeepPixel<'_> {
        let (start, end) = match self.pixel_index(x, y) {
            Some(i) => (self.offsets[i], self.offsets[i + 1]),
            None => (0, 0),
        };
        DeepPixel {
            plane: self,
            start,
            count: end - start,
        }
    }

    /// Copy with every pixel sorted by front (then back) depth.
    pub fn sorted(&self) -> DeepPlane {
        if self.ordering == DeepOrdering::ZAscending {
            return self.clone();
        }
        let nc = self.map.len();
        let front = self.map.index_of(Channel::DEEP_FRONT).unwrap_or(0);
        let back = self.map.index_of(Channel::DEEP_BACK).unwrap_or(0);
        let mut data = Vec::with_capacity(self.data.len());
        for w in self.offsets.windows(2) {
            let mut order: Vec<usize> = (w[0]..w[1]).collect();
            order.sort_by(|a, b| {
                let ka = (self.data[a * nc + front], self.data[a * nc + back]);
                let kb = (self.data[b * nc + front], self.data[b * nc + back]);
                ka.partial_cmp(&kb).unwrap_or(std::cmp::Ordering::Equal)
            });
            for s in order {
                data.extend_from_slice(&self.data[s * nc..(s + 1) * nc]);
            }
        }
        DeepPlane {
            data: Arc::new(data),
            ordering: DeepOrdering::ZAscending,
            ..self.clone()
        }
    }

    /// One point sample per pixel of `plane` whose alpha (or, without
    /// alpha, any channel) is non-zero. Depth comes from `z` when the
    /// plane has it, else `default_z`.
    pub fn from_image(plane: &ImagePlane, z: Option<Channel>, default_z: f32) -> Self {
        let bbox = plane.bbox();
        let values: ChannelSet = plane
            .channels()
            .explicit()
            .filter(|c| Some(*c) != z && *c != Channel::DEEP_FRONT && *c != Channel::DEEP_BACK)
            .collect();
        let mut out = DeepOutputPlane::new(bbox, &values, DeepOrdering::ZAscending);
        let has_alpha = values.contains(Channel::ALPHA);
        let chans: Vec<Channel> = out.map.channels().to_vec();
        let mut sample = vec![0.0f32; chans.len()];
        for (x, y) in bbox.iter() {
            let covered = if has_alpha {
                plane.at(x, y, Channel::ALPHA) != 0.0
            } else {
                values.explicit().any(|c| plane.at(x, y, c) != 0.0)
            };
            if !covered {
                out.add_hole();
                continue;
            }
            let depth = match z {
                Some(zc) if plane.channels().contains(zc) => plane.at(x, y, zc),
                _ => default_z,
            };
            for (i, c) in chans.iter().enumerate() {
                sample[i] = match *c {
                    Channel::DEEP_FRONT | Channel::DEEP_BACK => depth,
                    c => plane.at(x, y, c),
                };
            }
            out.add_pixel(&sample);
        }
        out.finish()
    }
}

/// The samples of one pixel.
#[derive(Debug, Clone, Copy)]
pub struct DeepPixel<'a> {
    plane: &'a DeepPlane,
    start: usize,
    count: usize,
}

impl<'a> DeepPixel<'a> {
    /// Number of samples.
    pub fn sample_count(&self) -> usize {
        self.count
    }

    /// True for a pixel without samples.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Value of channel `ch` in sample `i`; zero for absent channels.
    pub fn get(&self, i: usize, ch: Channel) -> f32 {
        match self.plane.map.index_of(ch) {
            Some(z) if i < self.count => {
                let nc = self.plane.map.len();
                self.plane.data[(self.start + i) * nc + z]
            }
            _ => 0.0,
        }
    }

    /// Front depth of sample `i`.
    pub fn front(&self, i: usize) -> f32 {
        self.get(i, Channel::DEEP_FRONT)
    }

    /// Back depth of sample `i`.
    pub fn back(&self, i: usize) -> f32 {
        self.get(i, Channel::DEEP_BACK)
    }

    /// Alpha of sample `i`.
    pub fn alpha(&self, i: usize) -> f32 {
        self.get(i, Channel::ALPHA)
    }

    /// Detached samples carrying `color` channels in that order.
    pub fn samples(&self, color: &[Channel]) -> Vec<DeepSample> {
        (0..self.count)
            .map(|i| DeepSample {
                front: self.front(i),
                back: self.back(i),
                alpha: self.alpha(i),
                color: color.iter().map(|c| self.get(i, *c)).collect(),
            })
            .collect()
    }
}

/// Builds a [`DeepPlane`] pixel by pixel in scanline order.
#[derive(Debug)]
pub struct DeepOutputPlane {
    bbox: Bbox,
    channels: ChannelSet,
    map: ChannelMap,
    offsets: Vec<usize>,
    data: Vec<f32>,
    ordering: DeepOrdering,
}

impl DeepOutputPlane {
    /// Starts a plane; front and back depth are added to `channels`.
    pub fn new(bbox: Bbox, channels: &ChannelSet, ordering: DeepOrdering) -> Self {
        let channels = with_depths(channels);
        let map = ChannelMap::new(&channels);
        let mut offsets = Vec::with_capacity(bbox.area() as usize + 1);
        offsets.push(0);
        Self {
            bbox,
            channels,
            map,
            offsets,
            data: Vec::new(),
            ordering,
        }
    }

    /// Channel layout of a sample.
    pub fn channel_map(&self) -> &ChannelMap {
        &self.map
    }

    /// Pixels added so far.
    pub fn pixels_added(&self) -> usize {
        self.offsets.len() - 1
    }

    /// Adds the next pixel; `samples` holds whole samples in
    /// [`channel_map`](Self::channel_map) order.
    pub fn add_pixel(&mut self, samples: &[f32]) {
        let nc = self.map.len();
        let n = samples.len() / nc.max(1);
        self.data.extend_from_slice(&samples[..n * nc]);
        let last = self.offsets.last().copied().unwrap_or(0);
        self.offsets.push(last + n);
    }

    /// Adds the next pixel from detached samples whose colour is in
    /// `color` order.
    pub fn add_samples(&mut self, samples: &[DeepSample], color: &[Channel]) {
        let chans = self.map.channels().to_vec();
        let mut flat = Vec::with_capacity(samples.len() * chans.len());
        for s in samples {
            for c in &chans {
                flat.push(match *c {
                    Channel::DEEP_FRONT => s.front,
                    Channel::DEEP_BACK => s.back,
                    Channel::ALPHA => s.alpha,
                    c => color
                        .iter()
                        .position(|k| *k == c)
                        .and_then(|i| s.color.get(i).copied())
                        .unwrap_or(0.0),
                });
            }
        }
        self.add_pixel(&flat);
    }

    /// Adds a pixel without samples.
    pub fn add_hole(&mut self) {
        let last = self.offsets.last().copied().unwrap_or(0);
        self.offsets.push(last);
    }

    /// Pads missing pixels with holes and returns the plane.
    pub fn finish(mut self) -> DeepPlane {
        while self.pixels_added() < self.bbox.area() as usize {
            self.add_hole();
        }
        self.offsets.truncate(self.bbox.area() as usize + 1);
        DeepPlane {
            bbox: self.bbox,
            channels: self.channels,
            map: self.map,
            offsets: self.offsets,
            data: Arc::new(self.data),
            ordering: self.ordering,
        }
    }

    /// Returns the plane, failing unless every pixel was added.
    pub fn into_plane(self) -> Result<DeepPlane> {
        let want = self.bbox.area() as usize;
        if self.pixels_added() != want {
            return Err(GraphError::Engine {
                op: "DeepOutputPlane".into(),
                message: format!("{} of {} pixels filled", self.pixels_added(), want),
            });
        }
        Ok(self.finish())
    }
}

fn with_depths(channels: &ChannelSet) -> ChannelSet {
    let mut out: ChannelSet = channels.explicit().collect();
    out.insert_set(&ChannelSet::deep_depths());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_offsets() {
        let bbox = Bbox::new(0, 0, 2, 1);
        let mut out = DeepOutputPlane::new(bbox, &ChannelSet::rgba(), DeepOrdering::Unordered);
        let color = [Channel::RED];
        out.add_samples(
            &[DeepSample::point(2.0, 0.5, &[0.2]), DeepSample::point(1.0, 1.0, &[0.4])],
            &color,
        );
        out.add_hole();
        let plane = out.into_plane().unwrap();
        assert_eq!(plane.total_samples(), 2);
        assert_eq!(plane.pixel(0, 0).sample_count(), 2);
        assert!(plane.pixel(1, 0).is_empty());
        assert!(plane.pixel(5, 5).is_empty());

        let sorted = plane.sorted();
        let px = sorted.pixel(0, 0);
        assert_eq!(px.front(0), 1.0);
        assert_eq!(px.get(0, Channel::RED), 0.4);
        assert_eq!(sorted.ordering(), DeepOrdering::ZAscending);
    }

    #[test]
    fn test_into_plane_requires_all_pixels() {
        let out = DeepOutputPlane::new(Bbox::new(0, 0, 2, 2), &ChannelSet::alpha(), DeepOrdering::Unordered);
        assert!(out.into_plane().is_err());
    }

    #[test]
    fn test_from_image_skips_transparent() {
        let bbox = Bbox::new(0, 0, 2, 1);
        let mut img = ImagePlane::new(bbox, &ChannelSet::rgba(), false);
        img.set(1, 0, Channel::ALPHA, 0.5);
        img.set(1, 0, Channel::RED, 0.25);
        let deep = DeepPlane::from_image(&img, None, 3.0);
        assert!(deep.pixel(0, 0).is_empty());
        let px = deep.pixel(1, 0);
        assert_eq!(px.sample_count(), 1);
        assert_eq!(px.front(0), 3.0);
        assert_eq!(px.get(0, Channel::RED), 0.25);
    }
}
