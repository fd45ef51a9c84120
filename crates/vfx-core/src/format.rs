//! Image formats: nominal raster size, aperture and pixel aspect.
//!
//! A [`Format`] is the "frame" an image is meant to be seen in. Its
//! aperture is the part of the raster holding the real picture; the rest
//! is padding (overscan, letterbox). Formats can be registered by name in a
//! [`FormatRegistry`], which is append-only.
//!
//! # Usage
//!
//! ```rust
//! use vfx_core::{Format, FormatRegistry};
//!
//! let registry = FormatRegistry::new();
//! let hd = registry.find("HD_1080").unwrap();
//! assert_eq!((hd.width(), hd.height()), (1920, 1080));
//!
//! let (u, v) = hd.to_uv(960.0, 540.0);
//! assert_eq!((u, v), (0.5, 0.5));
//! ```
//!
//! # Used By
//!
//! - `vfx-graph` - `Info` carries a format and a full-size format

use std::sync::{Arc, RwLock};

use crate::{Bbox, Error, Result};

/// Named image size plus aperture and pixel aspect ratio.
#[derive(Debug, Clone, PartialEq)]
pub struct Format {
    width: i32,
    height: i32,
    aperture: Bbox,
    pixel_aspect: f64,
    name: Option<String>,
}

impl Default for Format {
    fn default() -> Self {
        Self::none()
    }
}

impl Format {
    /// Unnamed format whose aperture is the whole raster.
    pub fn new(width: i32, height: i32, pixel_aspect: f64) -> Self {
        let width = width.max(1);
        let height = height.max(1);
        Self {
            width,
            height,
            aperture: Bbox::new(0, 0, width, height),
            pixel_aspect: if pixel_aspect > 0.0 { pixel_aspect } else { 1.0 },
            name: None,
        }
    }

    /// Named square-pixel format.
    pub fn named(name: &str, width: i32, height: i32) -> Self {
        Self::new(width, height, 1.0).with_name(name)
    }

    /// Sentinel used where no format is otherwise determined.
    pub fn none() -> Self {
        Self {
            width: 1,
            height: 1,
            aperture: Bbox::new(0, 0, 1, 1),
            pixel_aspect: 1.0,
            name: None,
        }
    }

    /// Sets the name.
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Sets the aperture, clipped to the raster.
    pub fn with_aperture(mut self, aperture: Bbox) -> Self {
        self.aperture = aperture.intersect(&self.bbox());
        self
    }

    /// True for the [`Format::none`] sentinel.
    pub fn is_none(&self) -> bool {
        self.name.is_none() && self.width == 1 && self.height == 1
    }

    /// Raster width.
    #[inline]
    pub fn width(&self) -> i32 {
        self.width
    }

    /// Raster height.
    #[inline]
    pub fn height(&self) -> i32 {
        self.height
    }

    /// Aperture inside the raster.
    #[inline]
    pub fn aperture(&self) -> Bbox {
        self.aperture
    }

    /// Pixel aspect ratio (width / height of one pixel).
    #[inline]
    pub fn pixel_aspect(&self) -> f64 {
        self.pixel_aspect
    }

    /// Registered name, if any.
    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The full raster as a box at the origin.
    #[inline]
    pub fn bbox(&self) -> Bbox {
        Bbox::new(0, 0, self.width, self.height)
    }

    /// Maps a pixel-space point to normalised `[0, 1]` coordinates.
    #[inline]
    pub fn to_uv(&self, x: f64, y: f64) -> (f64, f64) {
        (x / self.width as f64, y / self.height as f64)
    }

    /// Maps normalised coordinates back to pixel space.
    #[inline]
    pub fn from_uv(&self, u: f64, v: f64) -> (f64, f64) {
        (u * self.width as f64, v * self.height as f64)
    }

    /// Same format scaled by a proxy factor.
    pub fn scaled(&self, scale: f64) -> Format {
        let w = ((self.width as f64) * scale).round() as i32;
        let h = ((self.height as f64) * scale).round() as i32;
        let ap = self.aperture;
        let mut f = Format::new(w, h, self.pixel_aspect);
        f.aperture = Bbox::new(
            (ap.x() as f64 * scale).floor() as i32,
            (ap.y() as f64 * scale).floor() as i32,
            (ap.r() as f64 * scale).ceil() as i32,
            (ap.t() as f64 * scale).ceil() as i32,
        )
        .intersect(&f.bbox());
        f.name = self.name.clone();
        f
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(n) => write!(f, "{} {}x{} {}", n, self.width, self.height, self.pixel_aspect),
            None => write!(f, "{}x{} {}", self.width, self.height, self.pixel_aspect),
        }
    }
}

/// Append-only registry of named formats.
#[derive(Debug)]
pub struct FormatRegistry {
    formats: RwLock<Vec<Arc<Format>>>,
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatRegistry {
    /// Creates a registry with the common broadcast and film formats.
    pub fn new() -> Self {
        let builtin = [
            Format::named("PC_Video", 640, 480),
            Format::new(720, 576, 1.09).with_name("PAL"),
            Format::new(720, 486, 0.91).with_name("NTSC"),
            Format::named("HD_720", 1280, 720),
            Format::named("HD_1080", 1920, 1080),
            Format::named("UHD_4K", 3840, 2160),
            Format::named("2K_Super_35(full-ap)", 2048, 1556),
            Format::named("2K_DCP", 2048, 1080),
            Format::named("4K_DCP", 4096, 2160),
            Format::named("square_256", 256, 256),
            Format::named("square_512", 512, 512),
            Format::named("square_1K", 1024, 1024),
            Format::named("square_2K", 2048, 2048),
        ];
        Self {
            formats: RwLock::new(builtin.into_iter().map(Arc::new).collect()),
        }
    }

    /// Registers a named format. Fails if the name is already taken by a
    /// different format; re-adding an identical format returns the existing one.
    pub fn add(&self, format: Format) -> Result<Arc<Format>> {
        let Some(name) = format.name().map(str::to_string) else {
            return Err(Error::other("cannot register an unnamed format"));
        };
        let mut formats = self.formats.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = formats.iter().find(|f| f.name() == Some(name.as_str())) {
            if **existing == format {
                return Ok(existing.clone());
            }
            return Err(Error::other(format!("format '{name}' already registered")));
        }
        let format = Arc::new(format);
        formats.push(format.clone());
        Ok(format)
    }

    /// Looks up a format by name.
    pub fn find(&self, name: &str) -> Option<Arc<Format>> {
        self.read().iter().find(|f| f.name() == Some(name)).cloned()
    }

    /// Looks up a format by name, failing with [`Error::UnknownFormat`].
    pub fn get(&self, name: &str) -> Result<Arc<Format>> {
        self.find(name).ok_or_else(|| Error::UnknownFormat(name.to_string()))
    }

    /// Finds a registered format matching size and aspect.
    pub fn find_by_size(&self, width: i32, height: i32, pixel_aspect: f64) -> Option<Arc<Format>> {
        self.read()
            .iter()
            .find(|f| f.width == width && f.height == height && (f.pixel_aspect - pixel_aspect).abs() < 1e-6)
            .cloned()
    }

    /// Number of registered formats.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.read().iter().filter_map(|f| f.name().map(str::to_string)).collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<Format>>> {
        self.formats.read().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_uv_round_trip() {
        let f = Format::new(1920, 1080, 1.0);
        for (u, v) in [(0.0, 0.0), (1.0, 1.0), (0.25, 0.75), (0.333, 0.9)] {
            let (x, y) = f.from_uv(u, v);
            let (u2, v2) = f.to_uv(x, y);
            assert_relative_eq!(u2, u, epsilon = 1e-12);
            assert_relative_eq!(v2, v, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_none_sentinel() {
        assert!(Format::none().is_none());
        assert!(!Format::named("x", 1, 1).is_none());
    }

    #[test]
    fn test_aperture_clipped() {
        let f = Format::new(100, 50, 1.0).with_aperture(Bbox::new(10, 5, 200, 45));
        assert_eq!(f.aperture(), Bbox::new(10, 5, 100, 45));
    }

    #[test]
    fn test_registry_append_only() {
        let reg = FormatRegistry::new();
        let n = reg.len();
        let f = reg.add(Format::named("plate", 4448, 3096)).unwrap();
        assert_eq!(reg.len(), n + 1);
        assert_eq!(reg.find("plate").unwrap(), f);
        assert!(reg.add(Format::named("plate", 4448, 3096)).is_ok());
        assert!(reg.add(Format::named("plate", 10, 10)).is_err());
        assert!(reg.add(Format::new(10, 10, 1.0)).is_err());
        assert!(reg.get("missing").is_err());
        assert_eq!(reg.find_by_size(720, 576, 1.09).unwrap().name(), Some("PAL"));
    }

    #[test]
    fn test_scaled_proxy() {
        let f = Format::named("HD_1080", 1920, 1080).scaled(0.5);
        assert_eq!((f.width(), f.height()), (960, 540));
        assert_eq!(f.aperture(), Bbox::new(0, 0, 960, 540));
    }
}
