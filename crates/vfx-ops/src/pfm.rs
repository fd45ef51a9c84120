//! Portable Float Map reader and writer plugin.
//!
//! PFM is a three-line text header followed by raw 32-bit floats:
//!
//! ```text
//! PF            "PF" for RGB, "Pf" for greyscale
//! 640 480       width and height
//! -1.0          scale; negative means little-endian
//! ```
//!
//! Pixels are stored bottom row first, which is the graph's own row order,
//! so rows stream straight through. Greyscale files read as RGB with the
//! value in every channel. Files are always written as little-endian RGB.
//!
//! # Usage
//!
//! ```rust
//! use vfx_graph::PluginRegistry;
//!
//! let plugins = PluginRegistry::new();
//! vfx_ops::pfm::register(&plugins);
//! assert!(plugins.reader_for("plate.0001.pfm", None).is_ok());
//! ```

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use tracing::debug;
use vfx_core::{Bbox, Channel, ChannelSet, Format, World};
use vfx_graph::{
    GenericImagePlane, ImageSpec, Info, PluginRegistry, Reader, ReaderFormat, Row, Writer, WriterFormat,
};

use crate::{OpsError, OpsResult};

const RGB: [Channel; 3] = [Channel::RED, Channel::GREEN, Channel::BLUE];

/// Registers the PFM reader and writer.
pub fn register(registry: &PluginRegistry) {
    registry.register_reader(Arc::new(PfmFormat));
    registry.register_writer(Arc::new(PfmFormat));
}

/// The `.pfm` file format.
#[derive(Debug, Clone, Copy, Default)]
pub struct PfmFormat;

impl ReaderFormat for PfmFormat {
    fn name(&self) -> &'static str {
        "pfm"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["pfm"]
    }

    fn open(&self, path: &Path, _world: &World) -> vfx_graph::Result<Arc<dyn Reader>> {
        Ok(Arc::new(PfmReader::open(path)?))
    }
}

impl WriterFormat for PfmFormat {
    fn name(&self) -> &'static str {
        "pfm"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["pfm"]
    }

    fn create(&self, path: &Path) -> vfx_graph::Result<Box<dyn Writer>> {
        Ok(Box::new(PfmWriter::create(path)?))
    }
}

fn header_line<R: BufRead>(reader: &mut R, line: &mut String) -> OpsResult<()> {
    line.clear();
    if reader.read_line(line)? == 0 {
        return Err(OpsError::BadFile("PFM header is truncated".into()));
    }
    Ok(())
}

fn parse_size(line: &str) -> Option<(usize, usize)> {
    let mut parts = line.split_whitespace();
    let w = parts.next()?.parse().ok()?;
    let h = parts.next()?.parse().ok()?;
    (w > 0 && h > 0 && parts.next().is_none()).then_some((w, h))
}

/// A decoded PFM image held in memory.
#[derive(Debug)]
pub struct PfmReader {
    info: Info,
    width: usize,
    /// Interleaved RGB, bottom row first.
    data: Vec<f32>,
}

impl PfmReader {
    /// Reads and decodes the whole file.
    pub fn open(path: &Path) -> OpsResult<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        Self::decode(&mut reader)
    }

    /// Decodes from any buffered source.
    pub fn decode<R: BufRead>(reader: &mut R) -> OpsResult<Self> {
        let mut line = String::new();
        header_line(reader, &mut line)?;
        let components = match line.trim_end() {
            "PF" => 3,
            "Pf" => 1,
            other => return Err(OpsError::BadFile(format!("not a PFM file (magic '{other}')"))),
        };
        header_line(reader, &mut line)?;
        let (width, height) = parse_size(&line)
            .ok_or_else(|| OpsError::BadFile(format!("bad PFM size line '{}'", line.trim_end())))?;
        header_line(reader, &mut line)?;
        let scale: f32 = line
            .trim()
            .parse()
            .map_err(|_| OpsError::BadFile(format!("bad PFM scale '{}'", line.trim_end())))?;
        if scale == 0.0 {
            return Err(OpsError::BadFile("PFM scale is zero".into()));
        }
        let little_endian = scale < 0.0;

        let count = width * height * components;
        let mut bytes = vec![0u8; count * 4];
        reader.read_exact(&mut bytes)?;
        let mut data = Vec::with_capacity(width * height * 3);
        for chunk in bytes.chunks_exact(4) {
            let raw = [chunk[0], chunk[1], chunk[2], chunk[3]];
            let v = if little_endian {
                f32::from_le_bytes(raw)
            } else {
                f32::from_be_bytes(raw)
            };
            // Grey fills all three channels.
            let copies = if components == 1 { 3 } else { 1 };
            data.extend(std::iter::repeat_n(v, copies));
        }
        debug!(width, height, components, "decoded PFM");

        let format = Format::new(width as i32, height as i32, 1.0);
        Ok(Self {
            info: Info::from_format(format, ChannelSet::rgb()),
            width,
            data,
        })
    }

    fn value(&self, x: i32, y: i32, c: usize) -> f32 {
        let b = self.info.bbox;
        let (x, y) = b.clamp(x, y);
        let p = (y - b.y()) as usize * self.width + (x - b.x()) as usize;
        self.data.get(p * 3 + c).copied().unwrap_or(0.0)
    }
}

impl Reader for PfmReader {
    fn info(&self) -> &Info {
        &self.info
    }

    fn read_row(&self, y: i32, x: i32, r: i32, channels: &ChannelSet, row: &mut Row) -> vfx_graph::Result<()> {
        for ch in channels.explicit() {
            match RGB.iter().position(|c| *c == ch) {
                Some(c) => {
                    for (i, v) in row.span_mut(ch, x, r).iter_mut().enumerate() {
                        *v = self.value(x + i as i32, y, c);
                    }
                }
                None => row.erase(ch),
            }
        }
        Ok(())
    }

    fn supports_planes(&self) -> bool {
        true
    }

    fn read_plane(&self, bbox: Bbox, _channels: &ChannelSet) -> vfx_graph::Result<GenericImagePlane> {
        let area = bbox.intersect(&self.info.bbox);
        let mut data = Vec::with_capacity(area.area() as usize * 3);
        for (x, y) in area.iter() {
            data.extend((0..3).map(|c| self.value(x, y, c)));
        }
        Ok(GenericImagePlane::from_floats(area, ChannelSet::rgb(), data))
    }
}

/// Streams rows into a PFM file.
#[derive(Debug)]
pub struct PfmWriter {
    out: BufWriter<File>,
    spec: Option<ImageSpec>,
    rows: usize,
}

impl PfmWriter {
    /// Creates the file; the header is written by [`Writer::begin`].
    pub fn create(path: &Path) -> OpsResult<Self> {
        Ok(Self {
            out: BufWriter::new(File::create(path)?),
            spec: None,
            rows: 0,
        })
    }
}

impl Writer for PfmWriter {
    fn begin(&mut self, spec: &ImageSpec) -> vfx_graph::Result<()> {
        if self.spec.is_some() {
            return Err(OpsError::Unsupported("PFM holds a single image".into()).into());
        }
        write!(self.out, "PF\n{} {}\n-1.0\n", spec.bbox.w(), spec.bbox.h()).map_err(OpsError::from)?;
        self.spec = Some(spec.clone());
        Ok(())
    }

    fn write_row(&mut self, _y: i32, row: &Row) -> vfx_graph::Result<()> {
        let Some(spec) = &self.spec else {
            return Err(OpsError::Unsupported("row written before begin".into()).into());
        };
        let b = spec.bbox;
        let mut bytes = Vec::with_capacity(b.w() as usize * 12);
        for x in b.columns() {
            for ch in RGB {
                let v = if spec.channels.contains(ch) { row.at(ch, x) } else { 0.0 };
                bytes.extend_from_slice(&v.to_le_bytes());
            }
        }
        self.out.write_all(&bytes).map_err(OpsError::from)?;
        self.rows += 1;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> vfx_graph::Result<()> {
        let want = self.spec.as_ref().map_or(0, |s| s.bbox.h() as usize);
        if self.rows != want {
            return Err(OpsError::BadFile(format!("wrote {} of {} rows", self.rows, want)).into());
        }
        self.out.flush().map_err(OpsError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encode(magic: &str, w: usize, h: usize, scale: &str, values: &[f32], le: bool) -> Vec<u8> {
        let mut out = format!("{magic}\n{w} {h}\n{scale}\n").into_bytes();
        for v in values {
            out.extend_from_slice(&if le { v.to_le_bytes() } else { v.to_be_bytes() });
        }
        out
    }

    #[test]
    fn test_decode_big_endian_rgb() {
        let values: Vec<f32> = (0..12).map(|i| i as f32 * 0.5).collect();
        let bytes = encode("PF", 2, 2, "1.0", &values, false);
        let img = PfmReader::decode(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(img.info().bbox, Bbox::new(0, 0, 2, 2));
        assert_eq!(img.value(1, 0, 2), 2.5);
        assert_eq!(img.value(0, 1, 0), 3.0);
    }

    #[test]
    fn test_grey_expands_to_rgb() {
        let bytes = encode("Pf", 3, 1, "-1.0", &[0.1, 0.2, 0.3], true);
        let img = PfmReader::decode(&mut Cursor::new(bytes)).unwrap();
        for c in 0..3 {
            assert_eq!(img.value(1, 0, c), 0.2);
        }
    }

    #[test]
    fn test_rejects_bad_headers() {
        assert!(PfmReader::decode(&mut Cursor::new(b"P6\n1 1\n255\n".to_vec())).is_err());
        assert!(PfmReader::decode(&mut Cursor::new(b"PF\n0 4\n-1\n".to_vec())).is_err());
        let short = encode("PF", 2, 2, "-1.0", &[1.0; 5], true);
        assert!(PfmReader::decode(&mut Cursor::new(short)).is_err());
    }

    #[test]
    fn test_plane_matches_rows() {
        let values: Vec<f32> = (0..24).map(|i| i as f32).collect();
        let bytes = encode("PF", 4, 2, "-1.0", &values, true);
        let img = PfmReader::decode(&mut Cursor::new(bytes)).unwrap();
        let plane = img.read_plane(Bbox::new(1, 0, 3, 2), &ChannelSet::rgb()).unwrap().to_image_plane(false);
        let mut row = Row::new(1, 3);
        img.read_row(1, 1, 3, &ChannelSet::rgb(), &mut row).unwrap();
        assert_eq!(plane.at(2, 1, Channel::GREEN), row.at(Channel::GREEN, 2));
    }
}
