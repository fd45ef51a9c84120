//! Source operators shared by the unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use vfx_core::{Bbox, ChannelSet, World};

use crate::Result;
use crate::context::Context;
use crate::graph::{Graph, OpId};
use crate::info::Info;
use crate::op::{EngineCx, Iop, Op, PackedPreference, ValidateCx};
use crate::plane::ImagePlane;
use crate::planar::{Planar, PlanarIop};
use crate::row::Row;

/// Pixel value of both ramps.
pub(crate) fn ramp_value(x: i32, y: i32) -> f32 {
    (x + 10 * y) as f32
}

pub(crate) fn ctx() -> Context {
    Context::new(World::new())
}

/// Row source counting its engine calls.
pub(crate) struct Ramp {
    pub bbox: Bbox,
    pub calls: Arc<AtomicUsize>,
}

impl Op for Ramp {
    fn class(&self) -> &'static str {
        "Ramp"
    }

    fn minimum_inputs(&self) -> usize {
        0
    }
}

impl Iop for Ramp {
    fn validate(&mut self, _cx: &ValidateCx<'_>, _real: bool) -> Result<Info> {
        Ok(Info::new(self.bbox, ChannelSet::rgba()))
    }

    fn engine(&self, _cx: &EngineCx<'_>, y: i32, x: i32, r: i32, channels: &ChannelSet, row: &mut Row) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        for ch in channels.explicit() {
            for (v, xx) in row.span_mut(ch, x, r).iter_mut().zip(x..r) {
                *v = ramp_value(xx, y);
            }
        }
        Ok(())
    }
}

pub(crate) fn ramp(graph: &mut Graph, bbox: Bbox) -> (OpId, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let id = graph.add_iop(
        "Ramp1",
        Ramp {
            bbox,
            calls: calls.clone(),
        },
    );
    (id, calls)
}

/// Rectangle source counting its stripe renders.
pub(crate) struct PlanarRamp {
    pub bbox: Bbox,
    pub stripe: i32,
    pub parallel: bool,
    pub renders: Arc<AtomicUsize>,
}

impl PlanarIop for PlanarRamp {
    fn class(&self) -> &'static str {
        "PlanarRamp"
    }

    fn minimum_inputs(&self) -> usize {
        0
    }

    fn validate(&mut self, _cx: &ValidateCx<'_>, _real: bool) -> Result<Info> {
        Ok(Info::new(self.bbox, ChannelSet::rgba()))
    }

    fn render_stripe(&self, _cx: &EngineCx<'_>, plane: &mut ImagePlane) -> Result<()> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        let channels: Vec<_> = plane.channels().explicit().collect();
        let bbox = plane.bbox();
        for (x, y) in bbox.iter() {
            for &ch in &channels {
                plane.set(x, y, ch, ramp_value(x, y));
            }
        }
        Ok(())
    }

    fn stripe_height(&self) -> i32 {
        self.stripe
    }

    fn parallel_stripes(&self) -> bool {
        self.parallel
    }

    fn packed_preference(&self) -> PackedPreference {
        PackedPreference::Unpacked
    }
}

pub(crate) fn planar_ramp(graph: &mut Graph, bbox: Bbox, stripe: i32, parallel: bool) -> (OpId, Arc<AtomicUsize>) {
    let renders = Arc::new(AtomicUsize::new(0));
    let id = graph.add_iop(
        "PlanarRamp1",
        Planar::new(PlanarRamp {
            bbox,
            stripe,
            parallel,
            renders: renders.clone(),
        }),
    );
    (id, renders)
}
