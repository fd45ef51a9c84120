//! The file reading leaf operator.
//!
//! # Overview
//!
//! [`Read`] picks a [`ReaderFormat`] from its [`PluginRegistry`] at
//! validate time, by explicit format name or by extension, opens the file
//! named by the expanded frame pattern and exposes the reader's [`Info`].
//! Engine calls forward to the reader's row decode; plane fetches use the
//! reader's plane decode when it has one.
//!
//! Instead of decoding, [`ReadMode::Black`] and [`ReadMode::Checkerboard`]
//! synthesise an image of the configured format.
//!
//! A frame that fails to open is handled per [`MissingFrames`]. Anything
//! but [`MissingFrames::Error`] reports a soft error through the context
//! and substitutes; in strict mode the soft error becomes hard and
//! validate fails. Failures are tied to the frame: validating another
//! frame opens again.
//!
//! # Usage
//!
//! ```rust
//! use vfx_core::{Bbox, Channel, ChannelSet, Format};
//! use vfx_graph::{Context, Graph, Read, ReadMode, Row};
//!
//! let mut read = Read::new("unused.pfm");
//! read.set_mode(ReadMode::Checkerboard);
//! read.set_format(Format::named("tiny", 128, 128));
//!
//! let mut graph = Graph::new();
//! let id = graph.add_iop("Read1", read);
//! let ctx = Context::default();
//! graph.validate(id, &ctx, true).unwrap();
//! graph.request(id, Bbox::new(0, 0, 128, 1), &ChannelSet::rgba(), 1, &ctx).unwrap();
//!
//! let mut row = Row::new(0, 128);
//! graph.engine(id, &ctx, 0, 0, 128, &ChannelSet::rgba(), &mut row).unwrap();
//! assert_eq!(row.at(Channel::ALPHA, 3), 1.0);
//! ```

use std::hash::Hasher;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use vfx_core::{Channel, ChannelSet, Format};

use crate::context::Severity;
use crate::info::Info;
use crate::op::{EngineCx, Iop, Op, PackedPreference, ValidateCx};
use crate::plane::ImagePlane;
use crate::plugin::{PluginRegistry, Reader, expand_path};
use crate::row::Row;
use crate::{GraphError, Result};

/// Side of a checkerboard square in pixels.
pub const CHECKER_SIZE: i32 = 64;

/// Frames searched on either side by [`MissingFrames::Nearest`] when no
/// frame range is set.
pub const NEAREST_SEARCH_LIMIT: i32 = 100;

/// Format used by synthesised images when none is configured.
pub const DEFAULT_FORMAT: &str = "HD_1080";

const CHECKER_LIGHT: f32 = 0.5;
const CHECKER_DARK: f32 = 0.1;

/// What [`Read`] produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadMode {
    /// Decode the file.
    #[default]
    File,
    /// Black of the configured format.
    Black,
    /// A grey checkerboard of the configured format.
    Checkerboard,
}

/// What [`Read`] does when a frame cannot be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingFrames {
    /// Fail validate.
    #[default]
    Error,
    /// Substitute black.
    Black,
    /// Substitute a checkerboard.
    Checkerboard,
    /// Substitute the closest frame that opens.
    Nearest,
}

#[derive(Clone, Default)]
enum Source {
    File {
        path: String,
        reader: Arc<dyn Reader>,
    },
    #[default]
    Black,
    Checkerboard,
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::File { path, .. } => write!(f, "File({path})"),
            Source::Black => write!(f, "Black"),
            Source::Checkerboard => write!(f, "Checkerboard"),
        }
    }
}

/// Reads images through a file-format plugin.
#[derive(Debug)]
pub struct Read {
    file: String,
    plugin: Option<String>,
    mode: ReadMode,
    missing: MissingFrames,
    frames: Option<(i32, i32)>,
    format: Option<Format>,
    registry: Arc<PluginRegistry>,
    source: Source,
    last_info: Option<Info>,
}

impl Read {
    /// Reader of `file` using the global plugin registry.
    pub fn new(file: impl Into<String>) -> Self {
        Self::with_registry(file, PluginRegistry::global())
    }

    /// Reader of `file` using the given registry.
    pub fn with_registry(file: impl Into<String>, registry: Arc<PluginRegistry>) -> Self {
        Self {
            file: file.into(),
            plugin: None,
            mode: ReadMode::File,
            missing: MissingFrames::Error,
            frames: None,
            format: None,
            registry,
            source: Source::Black,
            last_info: None,
        }
    }

    /// File name pattern.
    pub fn file(&self) -> &str {
        &self.file
    }

    /// Changes the file name pattern.
    pub fn set_file(&mut self, file: impl Into<String>) {
        self.file = file.into();
    }

    /// Forces a format plugin instead of choosing by extension.
    pub fn set_plugin(&mut self, name: Option<String>) {
        self.plugin = name;
    }

    /// Decode or synthesise.
    pub fn set_mode(&mut self, mode: ReadMode) {
        self.mode = mode;
    }

    /// Missing-frame handling.
    pub fn set_missing_frames(&mut self, missing: MissingFrames) {
        self.missing = missing;
    }

    /// Frames the sequence has; outside them the end frames are held.
    pub fn set_frame_range(&mut self, first: i32, last: i32) {
        self.frames = Some((first.min(last), first.max(last)));
    }

    /// Format of synthesised images.
    pub fn set_format(&mut self, format: Format) {
        self.format = Some(format);
    }

    fn frame_for(&self, frame: i32) -> i32 {
        match self.frames {
            Some((first, last)) => frame.clamp(first, last),
            None => frame,
        }
    }

    fn open(&self, path: &str, cx: &ValidateCx<'_>) -> Result<Arc<dyn Reader>> {
        if let Source::File { path: open, reader } = &self.source {
            if open == path {
                return Ok(reader.clone());
            }
        }
        let format = self.registry.reader_for(path, self.plugin.as_deref())?;
        debug!(op = cx.name(), path, format = format.name(), "open");
        format.open(Path::new(path), cx.world())
    }

    fn file_info(&self, reader: &dyn Reader, frame: i32) -> Info {
        let mut info = reader.info().clone();
        let (first, last) = self.frames.unwrap_or((frame, frame));
        info.first_frame = first;
        info.last_frame = last;
        info
    }

    fn synthetic_info(&self, cx: &ValidateCx<'_>, frame: i32) -> Result<Info> {
        let format = match &self.format {
            Some(f) => f.clone(),
            None => cx
                .world()
                .formats
                .find(DEFAULT_FORMAT)
                .map(|f| (*f).clone())
                .ok_or_else(|| cx.error("no format to synthesise"))?,
        };
        let (first, last) = self.frames.unwrap_or((frame, frame));
        Ok(Info::from_format(format, ChannelSet::rgba()).with_frames(first, last))
    }

    fn nearest(&self, cx: &ValidateCx<'_>, frame: i32, view: &str) -> Option<(i32, String, Arc<dyn Reader>)> {
        let (lo, hi) = self
            .frames
            .unwrap_or((frame - NEAREST_SEARCH_LIMIT, frame + NEAREST_SEARCH_LIMIT));
        let reach = (frame - lo).max(hi - frame);
        for d in 1..=reach {
            for f in [frame - d, frame + d] {
                if f < lo || f > hi {
                    continue;
                }
                let path = expand_path(&self.file, f, view);
                if let Ok(reader) = self.open(&path, cx) {
                    return Some((f, path, reader));
                }
            }
        }
        None
    }

    fn substitute(&mut self, cx: &ValidateCx<'_>, frame: i32, view: &str, err: GraphError) -> Result<Info> {
        if self.missing == MissingFrames::Error {
            return Err(err);
        }
        cx.context().report(Severity::Soft, cx.name(), err.to_string());
        if cx.context().strict() {
            return Err(err);
        }
        match self.missing {
            MissingFrames::Nearest => {
                let Some((found, path, reader)) = self.nearest(cx, frame, view) else {
                    return Err(err);
                };
                warn!(op = cx.name(), frame, substitute = found, "using nearest frame");
                let info = self.file_info(reader.as_ref(), frame);
                self.source = Source::File { path, reader };
                self.last_info = Some(info.clone());
                Ok(info)
            }
            MissingFrames::Black | MissingFrames::Checkerboard => {
                warn!(op = cx.name(), frame, policy = ?self.missing, "substituting missing frame");
                let info = match (&self.last_info, &self.format) {
                    (Some(info), None) => info.clone(),
                    _ => self.synthetic_info(cx, frame)?,
                };
                self.source = if self.missing == MissingFrames::Black {
                    Source::Black
                } else {
                    Source::Checkerboard
                };
                Ok(info)
            }
            MissingFrames::Error => Err(err),
        }
    }
}

fn checker(x: i32, y: i32, ch: Channel) -> f32 {
    if ch == Channel::ALPHA {
        return 1.0;
    }
    if !matches!(ch, Channel::RED | Channel::GREEN | Channel::BLUE) {
        return 0.0;
    }
    if (x.div_euclid(CHECKER_SIZE) + y.div_euclid(CHECKER_SIZE)) % 2 == 0 {
        CHECKER_LIGHT
    } else {
        CHECKER_DARK
    }
}

impl Op for Read {
    fn class(&self) -> &'static str {
        "Read"
    }

    fn minimum_inputs(&self) -> usize {
        0
    }

    fn append_hash(&self, hash: &mut dyn Hasher) {
        let mut h = |bytes: &[u8]| hash.write(bytes);
        h(self.file.as_bytes());
        h(self.plugin.as_deref().unwrap_or("").as_bytes());
        h(&[self.mode as u8, self.missing as u8]);
        if let Some((a, b)) = self.frames {
            h(&a.to_le_bytes());
            h(&b.to_le_bytes());
        }
        if let Some(f) = &self.format {
            h(f.to_string().as_bytes());
        }
    }
}

impl Iop for Read {
    fn validate(&mut self, cx: &ValidateCx<'_>, _for_real: bool) -> Result<Info> {
        let frame = self.frame_for(cx.output().int_frame());
        let view = cx.output().view.clone();
        match self.mode {
            ReadMode::Black => {
                self.source = Source::Black;
                return self.synthetic_info(cx, frame);
            }
            ReadMode::Checkerboard => {
                self.source = Source::Checkerboard;
                return self.synthetic_info(cx, frame);
            }
            ReadMode::File => {}
        }

        let path = expand_path(&self.file, frame, &view);
        self.registry
            .reader_for(&path, self.plugin.as_deref())
            .map_err(|e| cx.error(e.to_string()))?;
        match self.open(&path, cx) {
            Ok(reader) => {
                let info = self.file_info(reader.as_ref(), frame);
                self.source = Source::File { path, reader };
                self.last_info = Some(info.clone());
                Ok(info)
            }
            Err(e) => {
                let err = GraphError::MissingFrame {
                    path,
                    frame,
                    message: e.to_string(),
                };
                self.substitute(cx, frame, &view, err)
            }
        }
    }

    fn engine(&self, cx: &EngineCx<'_>, y: i32, x: i32, r: i32, channels: &ChannelSet, row: &mut Row) -> Result<()> {
        cx.check_abort()?;
        match &self.source {
            Source::File { reader, .. } => reader
                .read_row(y, x, r, channels, row)
                .map_err(|e| cx.error(e.to_string())),
            Source::Black => {
                row.erase_set(channels, cx.last_channel());
                Ok(())
            }
            Source::Checkerboard => {
                for ch in channels.iter().take_while(|c| *c <= cx.last_channel()) {
                    for (i, v) in row.span_mut(ch, x, r).iter_mut().enumerate() {
                        *v = checker(x + i as i32, y, ch);
                    }
                }
                Ok(())
            }
        }
    }

    fn supports_planes(&self) -> bool {
        match &self.source {
            Source::File { reader, .. } => reader.supports_planes(),
            Source::Black | Source::Checkerboard => true,
        }
    }

    fn fetch_plane(&self, cx: &EngineCx<'_>, plane: &mut ImagePlane) -> Result<()> {
        cx.check_abort()?;
        let bbox = plane.bbox();
        match &self.source {
            Source::File { reader, .. } => {
                let decoded = reader
                    .read_plane(bbox, plane.channels())
                    .map_err(|e| cx.error(e.to_string()))?;
                plane.copy_from(&decoded.to_image_plane(plane.packed()));
            }
            Source::Black => plane.fill(0.0),
            Source::Checkerboard => {
                let channels: Vec<Channel> = plane.channels().explicit().collect();
                for (x, y) in bbox.iter() {
                    for ch in &channels {
                        plane.set(x, y, *ch, checker(x, y, *ch));
                    }
                }
            }
        }
        Ok(())
    }

    fn packed_preference(&self) -> PackedPreference {
        PackedPreference::Packed
    }
}
