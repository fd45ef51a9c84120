//! The file writing sink operator and its execution driver.
//!
//! # Overview
//!
//! [`Write`] passes its input through during ordinary engine calls. The
//! effectful part is [`Graph::execute`]: for every frame and view it
//! validates the sink in that context, renders its rows and hands them to
//! a [`Writer`](crate::plugin::Writer).
//!
//! An [`ExecutePlan`] groups images into files according to the writer's
//! [`multi_view`](WriterFormat::multi_view) and
//! [`multi_frame`](WriterFormat::multi_frame) capabilities. Each file is
//! written under a temporary name next to the target and renamed when
//! complete, so a failed or aborted pass never leaves a partial file
//! under the real name.
//!
//! With readback enabled, a written file is reopened and later engine
//! calls in the same frame and view serve its pixels instead of the
//! input's.

use std::collections::HashMap;
use std::fs;
use std::hash::Hasher;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};
use vfx_core::{ChannelSet, World};

use crate::context::{Context, OutputContext, ReportedError};
use crate::driver::render_rows;
use crate::graph::{Graph, OpId};
use crate::info::Info;
use crate::op::{EngineCx, Iop, Op, ValidateCx, bounded};
use crate::plugin::{ImageSpec, PluginRegistry, Reader, WriterFormat, expand_path};
use crate::row::Row;
use crate::{GraphError, Result};

/// The effectful side of a sink operator.
pub trait Executable: Send + Sync {
    /// Output file name pattern.
    fn filename(&self) -> &str;

    /// Writer plugin for the output.
    fn writer_format(&self) -> Result<Arc<dyn WriterFormat>>;

    /// Channels to write; intersected with the input's.
    fn write_channels(&self) -> &ChannelSet;

    /// Views to write.
    fn views(&self) -> Vec<String> {
        vec!["main".to_string()]
    }

    /// Called after `path` holding `frame`/`view` is complete.
    fn written(&self, _path: &Path, _frame: i32, _view: &str, _world: &World) -> Result<()> {
        Ok(())
    }
}

/// One output file and the images it receives.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteJob {
    /// Final file name.
    pub path: PathBuf,
    /// Frame and view of every image, in write order.
    pub images: Vec<(i32, String)>,
}

/// Files produced by one execute.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutePlan {
    jobs: Vec<WriteJob>,
}

impl ExecutePlan {
    /// Groups `frames` x `views` into files. A writer that cannot hold
    /// several frames (views) gets one file per frame (view); the file
    /// name is expanded with the first frame and view it holds.
    pub fn new(pattern: &str, frames: RangeInclusive<i32>, views: &[String], multi_frame: bool, multi_view: bool) -> Self {
        let frames: Vec<i32> = frames.collect();
        let frame_groups: Vec<Vec<i32>> = if multi_frame {
            vec![frames]
        } else {
            frames.into_iter().map(|f| vec![f]).collect()
        };
        let view_groups: Vec<Vec<String>> = if multi_view {
            vec![views.to_vec()]
        } else {
            views.iter().map(|v| vec![v.clone()]).collect()
        };

        let mut jobs = Vec::new();
        for fg in &frame_groups {
            for vg in &view_groups {
                let (Some(f0), Some(v0)) = (fg.first(), vg.first()) else {
                    continue;
                };
                let images = fg
                    .iter()
                    .flat_map(|f| vg.iter().map(move |v| (*f, v.clone())))
                    .collect();
                jobs.push(WriteJob {
                    path: PathBuf::from(expand_path(pattern, *f0, v0)),
                    images,
                });
            }
        }
        Self { jobs }
    }

    /// Files in write order.
    pub fn jobs(&self) -> &[WriteJob] {
        &self.jobs
    }

    /// Number of files.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// True if nothing would be written.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Outcome of [`Graph::execute`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecuteReport {
    /// Files written.
    pub files: Vec<PathBuf>,
    /// Scanlines written over all images.
    pub rows: usize,
    /// Soft errors reported while rendering.
    pub soft_errors: Vec<ReportedError>,
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp"))
}

impl Graph {
    /// Writes `frames` of the sink `id` to disk.
    ///
    /// Hard errors, soft errors in strict mode and aborts fail the file
    /// being written; files finished before that are kept.
    pub fn execute(&mut self, id: OpId, ctx: &Context, frames: RangeInclusive<i32>) -> Result<ExecuteReport> {
        let (pattern, format, channels, views) = {
            let node = self.node(id)?;
            let exe = node
                .op()
                .iop()
                .and_then(|op| op.as_executable())
                .ok_or_else(|| GraphError::Request(format!("{} is not executable", node.name())))?;
            (
                exe.filename().to_string(),
                exe.writer_format()?,
                exe.write_channels().clone(),
                exe.views(),
            )
        };
        let plan = ExecutePlan::new(&pattern, frames, &views, format.multi_frame(), format.multi_view());
        info!(op = self.name(id)?, files = plan.len(), format = format.name(), "execute");

        let mut report = ExecuteReport::default();
        for job in plan.jobs() {
            if let Some(dir) = job.path.parent().filter(|d| !d.as_os_str().is_empty()) {
                fs::create_dir_all(dir)?;
            }
            let tmp = temp_path(&job.path);
            let result = self.write_job(id, ctx, job, &tmp, format.as_ref(), &channels, &mut report);
            if let Err(e) = result {
                let _ = fs::remove_file(&tmp);
                return Err(e);
            }
            fs::rename(&tmp, &job.path)?;
            debug!(path = %job.path.display(), images = job.images.len(), "wrote");
            report.files.push(job.path.clone());

            if let Some(exe) = self.node(id)?.op().iop().and_then(|op| op.as_executable()) {
                for (frame, view) in &job.images {
                    exe.written(&job.path, *frame, view, ctx.world())?;
                }
            }
            self.invalidate(id)?;
        }
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn write_job(
        &mut self,
        id: OpId,
        ctx: &Context,
        job: &WriteJob,
        tmp: &Path,
        format: &dyn WriterFormat,
        channels: &ChannelSet,
        report: &mut ExecuteReport,
    ) -> Result<()> {
        let mut writer = format.create(tmp)?;
        for (frame, view) in &job.images {
            let output = OutputContext {
                frame: *frame as f64,
                view: view.clone(),
                proxy_scale: ctx.output().proxy_scale,
            };
            let fctx = ctx.derive(output);
            let info = self.validate(id, &fctx, true)?;
            let bbox = if info.format.is_none() {
                info.bbox
            } else {
                info.format.bbox()
            };
            let last = fctx.world().channels.last_channel();
            let chans = bounded(&channels.intersection(&info.channels), last);
            writer.begin(&ImageSpec {
                frame: *frame,
                view: view.clone(),
                bbox,
                channels: chans.clone(),
                format: info.format.clone(),
            })?;
            let rendered = render_rows(self, id, &fctx, bbox, &chans, |y, row| writer.write_row(y, row))?;
            if rendered.aborted {
                return Err(GraphError::Aborted);
            }
            report.rows += rendered.rows;
            report.soft_errors.extend(rendered.soft_errors);
        }
        writer.finish()
    }
}

/// Writes its input to files through a writer plugin.
#[derive(Debug)]
pub struct Write {
    file: String,
    plugin: Option<String>,
    channels: ChannelSet,
    views: Vec<String>,
    readback: bool,
    registry: Arc<PluginRegistry>,
    readers: Mutex<HashMap<(i32, String), Arc<dyn Reader>>>,
    active: Option<Arc<dyn Reader>>,
}

impl Write {
    /// Writer of `file` using the global plugin registry.
    pub fn new(file: impl Into<String>) -> Self {
        Self::with_registry(file, PluginRegistry::global())
    }

    /// Writer of `file` using the given registry.
    pub fn with_registry(file: impl Into<String>, registry: Arc<PluginRegistry>) -> Self {
        Self {
            file: file.into(),
            plugin: None,
            channels: ChannelSet::rgba(),
            views: vec!["main".to_string()],
            readback: false,
            registry,
            readers: Mutex::new(HashMap::new()),
            active: None,
        }
    }

    /// Forces a format plugin instead of choosing by extension.
    pub fn set_plugin(&mut self, name: Option<String>) {
        self.plugin = name;
    }

    /// Channels to write.
    pub fn set_channels(&mut self, channels: ChannelSet) {
        self.channels = channels;
    }

    /// Views to write.
    pub fn set_views(&mut self, views: Vec<String>) {
        self.views = views;
    }

    /// Serve written files on later engine calls.
    pub fn set_readback(&mut self, readback: bool) {
        self.readback = readback;
        if !readback {
            self.readers.lock().unwrap_or_else(|e| e.into_inner()).clear();
        }
    }

    /// True if a written file is being served in the last validated
    /// frame and view.
    pub fn is_reading_back(&self) -> bool {
        self.active.is_some()
    }
}

impl Op for Write {
    fn class(&self) -> &'static str {
        "Write"
    }

    fn append_hash(&self, hash: &mut dyn Hasher) {
        hash.write(self.file.as_bytes());
        hash.write_u8(self.readback as u8);
        if self.readback {
            let n = self.readers.lock().unwrap_or_else(|e| e.into_inner()).len();
            hash.write_usize(n);
        }
    }
}

impl Iop for Write {
    fn validate(&mut self, cx: &ValidateCx<'_>, _for_real: bool) -> Result<Info> {
        let input = cx.require_input(0)?.clone();
        self.active = None;
        if !self.readback {
            return Ok(input);
        }
        let key = (cx.output().int_frame(), cx.output().view.clone());
        let reader = self
            .readers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .cloned();
        match reader {
            Some(reader) => {
                let mut info = reader.info().clone();
                info.first_frame = input.first_frame;
                info.last_frame = input.last_frame;
                self.active = Some(reader);
                Ok(info)
            }
            None => Ok(input),
        }
    }

    fn out_channels(&self, info: &Info) -> ChannelSet {
        if self.active.is_some() {
            info.channels.clone()
        } else {
            ChannelSet::none()
        }
    }

    fn engine(&self, cx: &EngineCx<'_>, y: i32, x: i32, r: i32, channels: &ChannelSet, row: &mut Row) -> Result<()> {
        match &self.active {
            Some(reader) => reader
                .read_row(y, x, r, channels, row)
                .map_err(|e| cx.error(e.to_string())),
            None => cx.input_row(0, y, x, r, channels, row),
        }
    }

    fn as_executable(&self) -> Option<&dyn Executable> {
        Some(self)
    }
}

impl Executable for Write {
    fn filename(&self) -> &str {
        &self.file
    }

    fn writer_format(&self) -> Result<Arc<dyn WriterFormat>> {
        self.registry.writer_for(&self.file, self.plugin.as_deref())
    }

    fn write_channels(&self) -> &ChannelSet {
        &self.channels
    }

    fn views(&self) -> Vec<String> {
        self.views.clone()
    }

    fn written(&self, path: &Path, frame: i32, view: &str, world: &World) -> Result<()> {
        if !self.readback {
            return Ok(());
        }
        let name = path.to_string_lossy();
        let reader = self.registry.reader_for(&name, self.plugin.as_deref())?.open(path, world)?;
        self.readers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((frame, view.to_string()), reader);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn views(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_plan_one_file_per_image() {
        let plan = ExecutePlan::new("out_%V.####.pfm", 1..=2, &views(&["left", "right"]), false, false);
        let paths: Vec<_> = plan.jobs().iter().map(|j| j.path.to_string_lossy().into_owned()).collect();
        assert_eq!(
            paths,
            ["out_left.0001.pfm", "out_right.0001.pfm", "out_left.0002.pfm", "out_right.0002.pfm"]
        );
        assert!(plan.jobs().iter().all(|j| j.images.len() == 1));
    }

    #[test]
    fn test_plan_multi_view() {
        let plan = ExecutePlan::new("out.####.exr", 1..=3, &views(&["left", "right"]), false, true);
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.jobs()[1].images, vec![(2, "left".to_string()), (2, "right".to_string())]);
    }

    #[test]
    fn test_plan_multi_frame_and_view() {
        let plan = ExecutePlan::new("out.mov", 1..=10, &views(&["main"]), true, true);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.jobs()[0].images.len(), 10);
        assert_eq!(plan.jobs()[0].path, PathBuf::from("out.mov"));
    }

    #[test]
    fn test_plan_empty_range() {
        #[allow(clippy::reversed_empty_ranges)]
        let plan = ExecutePlan::new("out.####.pfm", 5..=1, &views(&["main"]), false, false);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_temp_path_is_hidden_sibling() {
        assert_eq!(temp_path(Path::new("a/b/c.pfm")), PathBuf::from("a/b/.c.pfm.tmp"));
    }
}
