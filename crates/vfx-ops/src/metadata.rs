//! Operators that only rewrite image metadata.
//!
//! Both pass every pixel through untouched; downstream consumers see a
//! different [`Info`].

use std::hash::{Hash, Hasher};

use vfx_core::Format;
use vfx_graph::{Info, NoIop, Result, ValidateCx};

/// Replaces the format, optionally cropping the bounding box to it.
#[derive(Debug, Clone)]
pub struct SetFormat {
    format: Format,
    crop: bool,
}

impl SetFormat {
    /// Sets `format` without cropping.
    pub fn new(format: Format) -> Self {
        Self { format, crop: false }
    }

    /// Also intersects the box with the new format.
    pub fn set_crop(&mut self, crop: bool) {
        self.crop = crop;
    }
}

impl NoIop for SetFormat {
    fn class(&self) -> &'static str {
        "SetFormat"
    }

    fn append_hash(&self, hash: &mut dyn Hasher) {
        hash.write(self.format.to_string().as_bytes());
        hash.write_u8(self.crop as u8);
    }

    fn validate(&mut self, _cx: &ValidateCx<'_>, input: &Info) -> Result<Info> {
        let mut info = input.clone();
        info.format = self.format.clone();
        info.full_size_format = self.format.clone();
        if self.crop {
            info.bbox = info.bbox.intersect(&self.format.bbox());
        }
        Ok(info)
    }
}

/// Overrides the advertised frame range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameRange {
    first: i32,
    last: i32,
}

impl FrameRange {
    /// Range `first..=last`; reversed bounds are swapped.
    pub fn new(first: i32, last: i32) -> Self {
        Self {
            first: first.min(last),
            last: first.max(last),
        }
    }

    /// Inclusive bounds.
    pub fn range(&self) -> (i32, i32) {
        (self.first, self.last)
    }
}

impl NoIop for FrameRange {
    fn class(&self) -> &'static str {
        "FrameRange"
    }

    fn append_hash(&self, mut hash: &mut dyn Hasher) {
        self.hash(&mut hash);
    }

    fn validate(&mut self, _cx: &ValidateCx<'_>, input: &Info) -> Result<Info> {
        Ok(input.clone().with_frames(self.first, self.last))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reversed_range_is_swapped() {
        assert_eq!(FrameRange::new(20, 10).range(), (10, 20));
    }
}
