//! File-format plugins and frame-pattern file names.
//!
//! # Overview
//!
//! The graph does not know any file format. [`Read`](crate::Read) and
//! [`Write`](crate::Write) look up a [`ReaderFormat`] or [`WriterFormat`]
//! in a [`PluginRegistry`], by explicit name or by file extension, and
//! talk to the opened [`Reader`] / [`Writer`] through these traits.
//!
//! File names may carry frame and view patterns, expanded by
//! [`expand_path`]:
//!
//! | pattern | expands to                         |
//! |---------|------------------------------------|
//! | `####`  | frame, zero padded to the run length |
//! | `%04d`  | frame, printf style                |
//! | `%d`    | frame, unpadded                    |
//! | `%V`    | view name                          |
//! | `%v`    | first letter of the view name      |
//!
//! # Usage
//!
//! ```rust
//! use vfx_graph::plugin::expand_path;
//!
//! assert_eq!(expand_path("shot_%V.####.pfm", 12, "left"), "shot_left.0012.pfm");
//! assert_eq!(expand_path("shot.%03d.pfm", 7, "main"), "shot.007.pfm");
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, OnceLock, RwLock};

use tracing::debug;
use vfx_core::{Bbox, ChannelSet, Format, World};

use crate::info::Info;
use crate::plane::GenericImagePlane;
use crate::row::Row;
use crate::{GraphError, Result};

/// An opened image file.
pub trait Reader: Send + Sync {
    /// Box, channels and format of the file.
    fn info(&self) -> &Info;

    /// Decodes `row[channels][x..r)` of scanline `y`.
    ///
    /// `y` lies inside the box; `x..r` may extend past it and is filled
    /// with the edge values there.
    fn read_row(&self, y: i32, x: i32, r: i32, channels: &ChannelSet, row: &mut Row) -> Result<()>;

    /// True if [`read_plane`](Self::read_plane) is implemented.
    fn supports_planes(&self) -> bool {
        false
    }

    /// Decodes a rectangle in the file's own storage layout.
    fn read_plane(&self, _bbox: Bbox, _channels: &ChannelSet) -> Result<GenericImagePlane> {
        Err(GraphError::plugin("plane decode not supported"))
    }
}

impl fmt::Debug for dyn Reader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reader({})", self.info().bbox)
    }
}

/// A file format that can be read.
pub trait ReaderFormat: Send + Sync {
    /// Format name used for explicit selection, e.g. `"pfm"`.
    fn name(&self) -> &'static str;

    /// Lower-case extensions without the dot.
    fn extensions(&self) -> &'static [&'static str];

    /// Opens `path`, reading at least the header.
    fn open(&self, path: &Path, world: &World) -> Result<Arc<dyn Reader>>;
}

/// What a writer is told before each image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageSpec {
    /// Frame being written.
    pub frame: i32,
    /// View being written.
    pub view: String,
    /// Rows and columns written.
    pub bbox: Bbox,
    /// Channels written.
    pub channels: ChannelSet,
    /// Format of the image.
    pub format: Format,
}

/// An output file being written.
pub trait Writer: Send {
    /// Starts an image. Called once per file by single-image writers and
    /// once per frame/view by writers that merge them.
    fn begin(&mut self, spec: &ImageSpec) -> Result<()>;

    /// Writes scanline `y`; rows arrive bottom to top.
    fn write_row(&mut self, y: i32, row: &Row) -> Result<()>;

    /// Flushes and closes.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// A file format that can be written.
pub trait WriterFormat: Send + Sync {
    /// Format name.
    fn name(&self) -> &'static str;

    /// Lower-case extensions without the dot.
    fn extensions(&self) -> &'static [&'static str];

    /// True if one file can hold several views.
    fn multi_view(&self) -> bool {
        false
    }

    /// True if one file can hold several frames.
    fn multi_frame(&self) -> bool {
        false
    }

    /// Creates `path` for writing.
    fn create(&self, path: &Path) -> Result<Box<dyn Writer>>;
}

#[derive(Default)]
struct Tables {
    readers: HashMap<&'static str, Arc<dyn ReaderFormat>>,
    writers: HashMap<&'static str, Arc<dyn WriterFormat>>,
    read_ext: HashMap<&'static str, &'static str>,
    write_ext: HashMap<&'static str, &'static str>,
}

/// Reader and writer formats by name and extension.
#[derive(Default)]
pub struct PluginRegistry {
    tables: RwLock<Tables>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = self.read();
        let mut readers: Vec<_> = t.readers.keys().collect();
        let mut writers: Vec<_> = t.writers.keys().collect();
        readers.sort();
        writers.sort();
        f.debug_struct("PluginRegistry")
            .field("readers", &readers)
            .field("writers", &writers)
            .finish()
    }
}

impl PluginRegistry {
    /// Creates an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The process-wide registry used by operators built without one.
    pub fn global() -> Arc<Self> {
        static INSTANCE: OnceLock<Arc<PluginRegistry>> = OnceLock::new();
        INSTANCE.get_or_init(PluginRegistry::new).clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a reader; a later registration under the same name wins.
    pub fn register_reader(&self, format: Arc<dyn ReaderFormat>) {
        let name = format.name();
        let mut t = self.write();
        for ext in format.extensions() {
            t.read_ext.insert(ext, name);
        }
        t.readers.insert(name, format);
        debug!(format = name, "registered reader");
    }

    /// Registers a writer.
    pub fn register_writer(&self, format: Arc<dyn WriterFormat>) {
        let name = format.name();
        let mut t = self.write();
        for ext in format.extensions() {
            t.write_ext.insert(ext, name);
        }
        t.writers.insert(name, format);
        debug!(format = name, "registered writer");
    }

    /// Reader by format name.
    pub fn reader(&self, name: &str) -> Option<Arc<dyn ReaderFormat>> {
        self.read().readers.get(name).cloned()
    }

    /// Writer by format name.
    pub fn writer(&self, name: &str) -> Option<Arc<dyn WriterFormat>> {
        self.read().writers.get(name).cloned()
    }

    /// Reader for a file: the explicit `name` if given, else by extension.
    pub fn reader_for(&self, path: &str, name: Option<&str>) -> Result<Arc<dyn ReaderFormat>> {
        let t = self.read();
        let key = match name {
            Some(n) => n.to_string(),
            None => {
                let ext = extension(path)?;
                t.read_ext
                    .get(ext.as_str())
                    .map(|n| n.to_string())
                    .ok_or_else(|| GraphError::plugin(format!("no reader for .{ext} files")))?
            }
        };
        t.readers
            .get(key.as_str())
            .cloned()
            .ok_or_else(|| GraphError::plugin(format!("unknown reader format '{key}'")))
    }

    /// Writer for a file: the explicit `name` if given, else by extension.
    pub fn writer_for(&self, path: &str, name: Option<&str>) -> Result<Arc<dyn WriterFormat>> {
        let t = self.read();
        let key = match name {
            Some(n) => n.to_string(),
            None => {
                let ext = extension(path)?;
                t.write_ext
                    .get(ext.as_str())
                    .map(|n| n.to_string())
                    .ok_or_else(|| GraphError::plugin(format!("no writer for .{ext} files")))?
            }
        };
        t.writers
            .get(key.as_str())
            .cloned()
            .ok_or_else(|| GraphError::plugin(format!("unknown writer format '{key}'")))
    }
}

fn extension(path: &str) -> Result<String> {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .ok_or_else(|| GraphError::plugin(format!("cannot tell the format of '{path}'")))
}

/// Expands frame and view patterns in a file name.
pub fn expand_path(pattern: &str, frame: i32, view: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '#' => {
                let start = i;
                while i < chars.len() && chars[i] == '#' {
                    i += 1;
                }
                out.push_str(&pad_frame(frame, i - start));
                continue;
            }
            '%' => {
                let mut j = i + 1;
                while j < chars.len() && chars[j].is_ascii_digit() {
                    j += 1;
                }
                match chars.get(j) {
                    Some('d') => {
                        let width: String = chars[i + 1..j].iter().collect();
                        out.push_str(&pad_frame(frame, width.parse().unwrap_or(0)));
                        i = j + 1;
                        continue;
                    }
                    Some('V') if j == i + 1 => {
                        out.push_str(view);
                        i = j + 1;
                        continue;
                    }
                    Some('v') if j == i + 1 => {
                        out.extend(view.chars().next());
                        i = j + 1;
                        continue;
                    }
                    _ => out.push('%'),
                }
            }
            c => out.push(c),
        }
        i += 1;
    }
    out
}

fn pad_frame(frame: i32, width: usize) -> String {
    if frame < 0 {
        format!("-{:0width$}", -(frame as i64), width = width.saturating_sub(1))
    } else {
        format!("{frame:0width$}")
    }
}

/// True if the name contains a frame pattern.
pub fn has_frame_pattern(pattern: &str) -> bool {
    expand_path(pattern, 1, "") != expand_path(pattern, 2, "")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy;

    impl ReaderFormat for Dummy {
        fn name(&self) -> &'static str {
            "dummy"
        }

        fn extensions(&self) -> &'static [&'static str] {
            &["dmy", "dummy"]
        }

        fn open(&self, path: &Path, _world: &World) -> Result<Arc<dyn Reader>> {
            Err(GraphError::plugin(format!("cannot open {}", path.display())))
        }
    }

    #[test]
    fn test_expand_hashes() {
        assert_eq!(expand_path("a.####.pfm", 7, "main"), "a.0007.pfm");
        assert_eq!(expand_path("a.#.pfm", 123, "main"), "a.123.pfm");
        assert_eq!(expand_path("a.###.pfm", -4, "main"), "a.-04.pfm");
    }

    #[test]
    fn test_expand_printf_and_views() {
        assert_eq!(expand_path("a.%04d.pfm", 42, "main"), "a.0042.pfm");
        assert_eq!(expand_path("a.%d.pfm", 42, "main"), "a.42.pfm");
        assert_eq!(expand_path("%V/a_%v.pfm", 1, "right"), "right/a_r.pfm");
        assert_eq!(expand_path("100%.pfm", 1, "main"), "100%.pfm");
    }

    #[test]
    fn test_has_frame_pattern() {
        assert!(has_frame_pattern("a.####.pfm"));
        assert!(has_frame_pattern("a.%03d.pfm"));
        assert!(!has_frame_pattern("a_%V.pfm"));
    }

    #[test]
    fn test_lookup_by_extension_and_name() {
        let reg = PluginRegistry::new();
        reg.register_reader(Arc::new(Dummy));
        assert_eq!(reg.reader_for("x/y.DMY", None).map(|f| f.name()).ok(), Some("dummy"));
        assert_eq!(reg.reader_for("x/y.bin", Some("dummy")).map(|f| f.name()).ok(), Some("dummy"));
        assert!(reg.reader_for("x/y.png", None).is_err());
        assert!(reg.reader_for("noext", None).is_err());
        assert!(reg.writer_for("x/y.dmy", None).is_err());
    }
}
