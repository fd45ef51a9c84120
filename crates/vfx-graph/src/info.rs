//! Metadata produced by the validate phase.

use vfx_core::{Bbox, ChannelSet, Format};

/// Region, channels and format of an image: the 2D part of [`Info`].
#[derive(Debug, Clone, PartialEq)]
pub struct Info2D {
    /// Region of definition.
    pub bbox: Bbox,
    /// Channels the image provides.
    pub channels: ChannelSet,
    /// Working format.
    pub format: Format,
}

/// Everything downstream operators need to know about an image.
#[derive(Debug, Clone, PartialEq)]
pub struct Info {
    /// Region of definition. Outside it the edge pixels repeat.
    pub bbox: Bbox,
    /// Channels the image provides.
    pub channels: ChannelSet,
    /// Working (possibly proxy-scaled) format.
    pub format: Format,
    /// Format at full resolution.
    pub full_size_format: Format,
    /// Preferred traversal direction; the magnitude says how costly the
    /// opposite direction is. Positive means bottom-up.
    pub ydirection: i32,
    /// The outermost ring of `bbox` is zero in every channel.
    pub black_outside: bool,
    /// First frame with content.
    pub first_frame: i32,
    /// Last frame with content.
    pub last_frame: i32,
}

impl Default for Info {
    fn default() -> Self {
        Self::new(Bbox::default(), ChannelSet::none())
    }
}

impl Info {
    /// Info with the given box and channels and no format.
    pub fn new(bbox: Bbox, channels: ChannelSet) -> Self {
        Self {
            bbox,
            channels,
            format: Format::none(),
            full_size_format: Format::none(),
            ydirection: 0,
            black_outside: false,
            first_frame: 1,
            last_frame: 1,
        }
    }

    /// Info whose box is the whole format raster.
    pub fn from_format(format: Format, channels: ChannelSet) -> Self {
        let mut info = Self::new(format.bbox(), channels);
        info.full_size_format = format.clone();
        info.format = format;
        info
    }

    /// Sets the frame range.
    pub fn with_frames(mut self, first: i32, last: i32) -> Self {
        self.first_frame = first.min(last);
        self.last_frame = first.max(last);
        self
    }

    /// The 2D subset.
    pub fn info2d(&self) -> Info2D {
        Info2D {
            bbox: self.bbox,
            channels: self.channels.clone(),
            format: self.format.clone(),
        }
    }

    /// Inclusive frame range.
    pub fn frame_range(&self) -> std::ops::RangeInclusive<i32> {
        self.first_frame..=self.last_frame
    }

    /// Merges another input's info: union of boxes and channels, widest
    /// frame range. Format and flags of `self` win.
    pub fn merge(&mut self, other: &Info) {
        self.bbox.merge(&other.bbox);
        self.channels.insert_set(&other.channels);
        self.first_frame = self.first_frame.min(other.first_frame);
        self.last_frame = self.last_frame.max(other.last_frame);
        self.black_outside = self.black_outside && other.black_outside;
    }

    /// Pads the box by one pixel and marks the ring black, unless it
    /// already is.
    pub fn add_black_outside(&mut self) {
        if !self.black_outside {
            self.bbox = self.bbox.pad_uniform(1);
            self.black_outside = true;
        }
    }
}

/// Metadata of a deep image.
#[derive(Debug, Clone, PartialEq)]
pub struct DeepInfo {
    /// Region holding samples.
    pub bbox: Bbox,
    /// Channels carried per sample, excluding the depth pair.
    pub channels: ChannelSet,
    /// Working format.
    pub format: Format,
    /// First frame with content.
    pub first_frame: i32,
    /// Last frame with content.
    pub last_frame: i32,
}

impl DeepInfo {
    /// Deep info with the given box and channels.
    pub fn new(bbox: Bbox, channels: ChannelSet, format: Format) -> Self {
        Self {
            bbox,
            channels,
            format,
            first_frame: 1,
            last_frame: 1,
        }
    }

    /// The flat view of this metadata.
    pub fn to_info(&self) -> Info {
        let mut info = Info::new(self.bbox, self.channels.clone());
        info.format = self.format.clone();
        info.full_size_format = self.format.clone();
        info.first_frame = self.first_frame;
        info.last_frame = self.last_frame;
        info
    }
}

impl From<&Info> for DeepInfo {
    fn from(info: &Info) -> Self {
        Self {
            bbox: info.bbox,
            channels: info.channels.clone(),
            format: info.format.clone(),
            first_frame: info.first_frame,
            last_frame: info.last_frame,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_unions() {
        let mut a = Info::new(Bbox::new(0, 0, 10, 10), ChannelSet::rgb()).with_frames(1, 10);
        let b = Info::new(Bbox::new(5, 5, 20, 20), ChannelSet::alpha()).with_frames(5, 30);
        a.merge(&b);
        assert_eq!(a.bbox, Bbox::new(0, 0, 20, 20));
        assert_eq!(a.channels, ChannelSet::rgba());
        assert_eq!(a.frame_range(), 1..=30);
    }

    #[test]
    fn test_black_outside_pads_once() {
        let mut a = Info::new(Bbox::new(0, 0, 10, 10), ChannelSet::rgb());
        a.add_black_outside();
        a.add_black_outside();
        assert_eq!(a.bbox, Bbox::new(-1, -1, 11, 11));
    }

    #[test]
    fn test_deep_info_round_trip() {
        let f = Format::named("sq", 8, 8);
        let d = DeepInfo::new(Bbox::new(1, 1, 4, 4), ChannelSet::rgba(), f);
        assert_eq!(DeepInfo::from(&d.to_info()), d);
    }
}
