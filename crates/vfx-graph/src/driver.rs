//! Terminal drivers: pull a region out of an operator.
//!
//! # Overview
//!
//! Every driver runs the same bracket on the sink:
//!
//! 1. validate for real
//! 2. forget earlier requests of the sink and everything upstream
//! 3. request the region once
//! 4. engine every scanline bottom to top
//!
//! The context abort flag is checked before each scanline. Errors that
//! engines reported through the context are gathered into a
//! [`RenderReport`]; any hard error (which includes soft errors in strict
//! mode) turns the result into `Err`. An abort alone is not an error: the
//! report says [`aborted`](RenderReport::aborted) and the output must not
//! be trusted.
//!
//! # Usage
//!
//! ```rust
//! use vfx_core::{Bbox, ChannelSet, Format};
//! use vfx_graph::{Context, Graph, Read, ReadMode, render_plane};
//!
//! let mut read = Read::new("unused.pfm");
//! read.set_mode(ReadMode::Black);
//! read.set_format(Format::named("tiny", 16, 16));
//!
//! let mut graph = Graph::new();
//! let id = graph.add_iop("Read1", read);
//! let ctx = Context::default();
//! let (plane, report) = render_plane(&mut graph, id, &ctx, Bbox::new(0, 0, 16, 16), &ChannelSet::rgba(), true).unwrap();
//! assert_eq!(report.rows, 16);
//! assert_eq!(plane.at(3, 3, vfx_core::Channel::RED), 0.0);
//! ```

#[cfg(feature = "parallel")]
use rayon::prelude::*;
use tracing::{debug, info};
use vfx_core::{Bbox, Channel, ChannelSet};

use crate::context::{Context, ReportedError, Severity};
use crate::graph::{Graph, OpId};
use crate::op::bounded;
use crate::plane::ImagePlane;
use crate::row::Row;
use crate::{GraphError, Result};

/// Default rows per parallel band.
pub const DEFAULT_BAND_HEIGHT: i32 = 16;

/// What happened during a render.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderReport {
    /// Scanlines completed and consumed.
    pub rows: usize,
    /// The pass stopped on the abort flag.
    pub aborted: bool,
    /// Recoverable errors, e.g. missing frames.
    pub soft_errors: Vec<ReportedError>,
    /// Errors that invalidate the output.
    pub hard_errors: Vec<ReportedError>,
}

impl RenderReport {
    /// True if every row was produced without any reported error.
    pub fn is_clean(&self) -> bool {
        !self.aborted && self.soft_errors.is_empty() && self.hard_errors.is_empty()
    }

    fn gather(mut self, ctx: &Context, failure: Option<GraphError>) -> Result<Self> {
        for e in ctx.errors() {
            match e.severity {
                Severity::Soft => self.soft_errors.push(e),
                Severity::Hard => self.hard_errors.push(e),
            }
        }
        if let Some(first) = self.hard_errors.first() {
            return Err(failure.unwrap_or_else(|| GraphError::engine(first.op.as_str(), first.message.as_str())));
        }
        if let Some(e) = failure {
            return Err(e);
        }
        Ok(self)
    }
}

fn prepare(graph: &mut Graph, id: OpId, ctx: &Context, roi: Bbox, channels: &ChannelSet) -> Result<()> {
    graph.validate(id, ctx, true)?;
    graph.forget_request(id)?;
    graph.request(id, roi, channels, 1, ctx)
}

fn stop_reason(e: GraphError) -> Option<GraphError> {
    if e.is_aborted() || matches!(e, GraphError::CachePoisoned) {
        None
    } else {
        Some(e)
    }
}

/// Renders `roi` of `id` one scanline at a time, handing each row to
/// `consume` in ascending `y`.
pub fn render_rows<F>(graph: &mut Graph, id: OpId, ctx: &Context, roi: Bbox, channels: &ChannelSet, mut consume: F) -> Result<RenderReport>
where
    F: FnMut(i32, &Row) -> Result<()>,
{
    prepare(graph, id, ctx, roi, channels)?;
    debug!(op = graph.name(id)?, %roi, "render rows");

    let mut report = RenderReport::default();
    let mut failure = None;
    for y in roi.rows() {
        if ctx.aborted() {
            report.aborted = true;
            break;
        }
        let mut row = Row::new(roi.x(), roi.r());
        match graph.engine(id, ctx, y, roi.x(), roi.r(), channels, &mut row) {
            Ok(()) => {
                consume(y, &row)?;
                report.rows += 1;
            }
            Err(e) => {
                report.aborted = true;
                failure = stop_reason(e);
                break;
            }
        }
    }
    if report.aborted {
        info!(op = graph.name(id)?, rows = report.rows, "render stopped");
    }
    report.gather(ctx, failure)
}

fn copy_row(plane: &mut ImagePlane, y: i32, row: &Row, channels: &[Channel]) {
    let bbox = plane.bbox();
    for ch in channels {
        plane.write_row(y, *ch, bbox.x(), row.span(*ch, bbox.x(), bbox.r()));
    }
}

/// Renders `roi` of `id` into a plane.
pub fn render_plane(
    graph: &mut Graph,
    id: OpId,
    ctx: &Context,
    roi: Bbox,
    channels: &ChannelSet,
    packed: bool,
) -> Result<(ImagePlane, RenderReport)> {
    let last = ctx.world().channels.last_channel();
    let channels = bounded(channels, last);
    let list: Vec<Channel> = channels.explicit().collect();
    let mut plane = ImagePlane::new(roi, &channels, packed);
    let report = render_rows(graph, id, ctx, roi, &channels, |y, row| {
        copy_row(&mut plane, y, row, &list);
        Ok(())
    })?;
    Ok((plane, report))
}

/// Renders `roi` of `id` into a plane, bands of `band_height` rows in
/// parallel.
///
/// Without the `parallel` feature the bands run one after the other.
pub fn render_plane_parallel(
    graph: &mut Graph,
    id: OpId,
    ctx: &Context,
    roi: Bbox,
    channels: &ChannelSet,
    packed: bool,
    band_height: i32,
) -> Result<(ImagePlane, RenderReport)> {
    let last = ctx.world().channels.last_channel();
    let channels = bounded(channels, last);
    let list: Vec<Channel> = channels.explicit().collect();
    prepare(graph, id, ctx, roi, &channels)?;

    let h = band_height.max(1);
    let bands: Vec<Bbox> = roi
        .rows()
        .step_by(h as usize)
        .map(|y| Bbox::new(roi.x(), y, roi.r(), (y + h).min(roi.t())))
        .collect();
    debug!(op = graph.name(id)?, %roi, bands = bands.len(), "render plane");

    let graph: &Graph = graph;
    let render = |band: Bbox| -> (ImagePlane, usize, Option<GraphError>, bool) {
        let mut part = ImagePlane::new(band, &channels, packed);
        let mut row = Row::new(roi.x(), roi.r());
        let mut rows = 0;
        for y in band.rows() {
            if ctx.aborted() {
                return (part, rows, None, true);
            }
            if let Err(e) = graph.engine(id, ctx, y, roi.x(), roi.r(), &channels, &mut row) {
                return (part, rows, stop_reason(e), true);
            }
            copy_row(&mut part, y, &row, &list);
            rows += 1;
        }
        (part, rows, None, false)
    };
    #[cfg(feature = "parallel")]
    let parts: Vec<_> = bands.into_par_iter().map(render).collect();
    #[cfg(not(feature = "parallel"))]
    let parts: Vec<_> = bands.into_iter().map(render).collect();

    let mut plane = ImagePlane::new(roi, &channels, packed);
    let mut report = RenderReport::default();
    let mut failure = None;
    for (part, rows, err, stopped) in parts {
        plane.copy_from(&part);
        report.rows += rows;
        report.aborted |= stopped;
        if failure.is_none() {
            failure = err;
        }
    }
    let report = report.gather(ctx, failure)?;
    Ok((plane, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::Info;
    use crate::op::{EngineCx, Iop, Op, ValidateCx};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicI32, Ordering};
    use vfx_core::World;

    /// Writes `y` into every pixel; aborts the context after row `stop_after`.
    struct Lines {
        stop_after: Option<i32>,
        highest: Arc<AtomicI32>,
        fail_at: Option<i32>,
    }

    impl Op for Lines {
        fn class(&self) -> &'static str {
            "Lines"
        }

        fn minimum_inputs(&self) -> usize {
            0
        }
    }

    impl Iop for Lines {
        fn validate(&mut self, _cx: &ValidateCx<'_>, _real: bool) -> Result<Info> {
            Ok(Info::new(Bbox::new(0, 0, 8, 32), ChannelSet::rgb()))
        }

        fn engine(&self, cx: &EngineCx<'_>, y: i32, x: i32, r: i32, channels: &ChannelSet, row: &mut Row) -> Result<()> {
            if self.fail_at == Some(y) {
                return Err(cx.error("bad scanline"));
            }
            self.highest.fetch_max(y, Ordering::SeqCst);
            for ch in channels.explicit() {
                row.fill(ch, x, r, y as f32);
            }
            if self.stop_after == Some(y) {
                cx.context().abort();
            }
            Ok(())
        }
    }

    fn lines(stop_after: Option<i32>, fail_at: Option<i32>) -> (Graph, OpId, Arc<AtomicI32>) {
        let highest = Arc::new(AtomicI32::new(-1));
        let mut graph = Graph::new();
        let id = graph.add_iop(
            "Lines1",
            Lines {
                stop_after,
                highest: highest.clone(),
                fail_at,
            },
        );
        (graph, id, highest)
    }

    #[test]
    fn test_render_rows_in_order() {
        let (mut graph, id, _) = lines(None, None);
        let ctx = Context::new(World::new());
        let mut seen = Vec::new();
        let report = render_rows(&mut graph, id, &ctx, Bbox::new(0, 0, 8, 4), &ChannelSet::rgb(), |y, row| {
            seen.push((y, row.at(Channel::RED, 3)));
            Ok(())
        })
        .unwrap();
        assert!(report.is_clean());
        assert_eq!(seen, vec![(0, 0.0), (1, 1.0), (2, 2.0), (3, 3.0)]);
    }

    #[test]
    fn test_abort_stops_after_row() {
        let (mut graph, id, highest) = lines(Some(10), None);
        let ctx = Context::new(World::new());
        let report = render_rows(&mut graph, id, &ctx, Bbox::new(0, 0, 8, 32), &ChannelSet::rgb(), |_, _| Ok(())).unwrap();
        assert!(report.aborted);
        assert_eq!(report.rows, 11);
        assert_eq!(highest.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_engine_error_is_hard() {
        let (mut graph, id, _) = lines(None, Some(2));
        let ctx = Context::new(World::new());
        let err = render_rows(&mut graph, id, &ctx, Bbox::new(0, 0, 8, 8), &ChannelSet::rgb(), |_, _| Ok(()));
        assert!(matches!(err, Err(GraphError::Engine { .. })));
        assert!(ctx.has_hard_error());
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let (mut graph, id, _) = lines(None, None);
        let ctx = Context::new(World::new());
        let roi = Bbox::new(0, 0, 8, 32);
        let (a, _) = render_plane(&mut graph, id, &ctx, roi, &ChannelSet::rgb(), true).unwrap();
        let (b, report) = render_plane_parallel(&mut graph, id, &ctx, roi, &ChannelSet::rgb(), false, 5).unwrap();
        assert_eq!(report.rows, 32);
        for (x, y) in roi.iter() {
            assert_eq!(a.at(x, y, Channel::GREEN), b.at(x, y, Channel::GREEN));
        }
        assert_eq!(b.at(7, 31, Channel::BLUE), 31.0);
    }
}
