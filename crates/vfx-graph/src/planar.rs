//! Operators that compute whole rectangles at once.
//!
//! # Overview
//!
//! A [`PlanarIop`] fills an [`ImagePlane`] per call instead of one row.
//! [`Planar`] adapts it to the row protocol: the requested area is cut
//! into horizontal stripes of [`PlanarIop::stripe_height`] rows, each
//! stripe is rendered at most once per validate and kept, and row engine
//! calls copy out of the stripe. Concurrent rows of the same stripe wait
//! for the one render.
//!
//! Plane fetches covering the requested area bypass the stripe cache and
//! render directly into the caller's plane, optionally one rayon task per
//! stripe. A buffer tile lying inside one stripe shares the kept stripe.

use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::{Arc, Mutex};

#[cfg(feature = "parallel")]
use rayon::prelude::*;
use tracing::trace;
use vfx_core::{Bbox, ChannelSet};

use crate::info::Info;
use crate::op::{EngineCx, InputRequest, Iop, Op, PackedPreference, ValidateCx, bounded};
use crate::plane::ImagePlane;
use crate::row::Row;
use crate::{GraphError, Result};

/// Default stripe height in rows.
pub const DEFAULT_STRIPE_HEIGHT: i32 = 64;

/// An operator computing rectangles.
pub trait PlanarIop: Send + Sync {
    /// Class name.
    fn class(&self) -> &'static str;

    /// Parameter hash.
    fn append_hash(&self, _hash: &mut dyn Hasher) {}

    /// Required inputs.
    fn minimum_inputs(&self) -> usize {
        1
    }

    /// Input slots.
    fn maximum_inputs(&self) -> usize {
        self.minimum_inputs()
    }

    /// Output info.
    fn validate(&mut self, cx: &ValidateCx<'_>, for_real: bool) -> Result<Info>;

    /// Upstream requests; defaults to the same box on every input.
    fn request(&self, _info: &Info, inputs: usize, bbox: &Bbox, channels: &ChannelSet, count: u32) -> Vec<InputRequest> {
        (0..inputs)
            .map(|i| InputRequest::flat(i, *bbox, channels.clone(), count))
            .collect()
    }

    /// Channels rewritten.
    fn out_channels(&self, info: &Info) -> ChannelSet {
        info.channels.clone()
    }

    /// Fills every channel of `plane` over its box.
    fn render_stripe(&self, cx: &EngineCx<'_>, plane: &mut ImagePlane) -> Result<()>;

    /// Rows per stripe; 0 renders the whole area as one stripe.
    fn stripe_height(&self) -> i32 {
        DEFAULT_STRIPE_HEIGHT
    }

    /// True if stripes may render concurrently.
    fn parallel_stripes(&self) -> bool {
        false
    }

    /// Layout `render_stripe` works best with.
    fn packed_preference(&self) -> PackedPreference {
        PackedPreference::DontCare
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct StripeKey {
    index: i32,
    hash: u64,
}

type StripeSlot = Arc<Mutex<Option<Arc<ImagePlane>>>>;

/// Adapter running a [`PlanarIop`] in the graph.
pub struct Planar<P> {
    op: P,
    stripes: Mutex<HashMap<StripeKey, StripeSlot>>,
}

impl<P> std::fmt::Debug for Planar<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let n = self.stripes.lock().map(|s| s.len()).unwrap_or(0);
        f.debug_struct("Planar").field("stripes", &n).finish()
    }
}

impl<P: PlanarIop> Planar<P> {
    /// Wraps a planar operator.
    pub fn new(op: P) -> Self {
        Self {
            op,
            stripes: Mutex::new(HashMap::new()),
        }
    }

    /// The wrapped operator.
    pub fn inner(&self) -> &P {
        &self.op
    }

    /// The wrapped operator, mutably.
    pub fn inner_mut(&mut self) -> &mut P {
        &mut self.op
    }

    /// Number of stripes currently kept.
    pub fn stripe_count(&self) -> usize {
        self.stripes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn stripe_box(&self, area: Bbox, index: i32) -> Bbox {
        let h = self.op.stripe_height();
        if h <= 0 {
            return area;
        }
        let y = area.y() + index * h;
        Bbox::new(area.x(), y, area.r(), (y + h).min(area.t()))
    }

    fn stripe_index(&self, area: Bbox, y: i32) -> i32 {
        let h = self.op.stripe_height();
        if h <= 0 { 0 } else { (y - area.y()) / h }
    }

    fn stripe(&self, cx: &EngineCx<'_>, y: i32, channels: &ChannelSet) -> Result<Arc<ImagePlane>> {
        let area = cx.request_area();
        let index = self.stripe_index(area, y);
        let key = StripeKey {
            index,
            hash: cx.hash(),
        };
        let slot = self
            .stripes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key)
            .or_default()
            .clone();

        let mut guard = slot.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(plane) = guard.as_ref() {
            if plane.channels().contains_set(channels) && plane.bbox().contains_box(&self.stripe_box(area, index)) {
                return Ok(plane.clone());
            }
        }
        let group = bounded(
            &cx.requested_channels().intersection(cx.out_channels()).union(channels),
            cx.last_channel(),
        );
        let bbox = self.stripe_box(area, index);
        trace!(op = cx.name(), stripe = index, %bbox, "render stripe");
        let mut plane = ImagePlane::new(bbox, &group, self.packed());
        self.op.render_stripe(cx, &mut plane)?;
        cx.check_abort()?;
        let plane = Arc::new(plane);
        *guard = Some(plane.clone());
        Ok(plane)
    }

    fn packed(&self) -> bool {
        self.op.packed_preference() == PackedPreference::Packed
    }

    fn render_parallel(&self, cx: &EngineCx<'_>, plane: &mut ImagePlane) -> Result<()> {
        let bbox = plane.bbox();
        let h = self.op.stripe_height().max(1);
        let boxes: Vec<Bbox> = (bbox.y()..bbox.t())
            .step_by(h as usize)
            .map(|y| Bbox::new(bbox.x(), y, bbox.r(), (y + h).min(bbox.t())))
            .collect();
        let channels = plane.channels().clone();
        let packed = plane.packed();
        let render = |b: Bbox| -> Result<ImagePlane> {
            let mut part = ImagePlane::new(b, &channels, packed);
            self.op.render_stripe(cx, &mut part)?;
            Ok(part)
        };
        #[cfg(feature = "parallel")]
        let parts: Vec<Result<ImagePlane>> = boxes.into_par_iter().map(render).collect();
        #[cfg(not(feature = "parallel"))]
        let parts: Vec<Result<ImagePlane>> = boxes.into_iter().map(render).collect();
        for part in parts {
            plane.copy_from(&part?);
        }
        Ok(())
    }
}

impl<P: PlanarIop> Op for Planar<P> {
    fn class(&self) -> &'static str {
        self.op.class()
    }

    fn minimum_inputs(&self) -> usize {
        self.op.minimum_inputs()
    }

    fn maximum_inputs(&self) -> usize {
        self.op.maximum_inputs()
    }

    fn append_hash(&self, hash: &mut dyn Hasher) {
        self.op.append_hash(hash);
    }
}

impl<P: PlanarIop> Iop for Planar<P> {
    fn validate(&mut self, cx: &ValidateCx<'_>, for_real: bool) -> Result<Info> {
        self.stripes.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.op.validate(cx, for_real)
    }

    fn request(&self, info: &Info, inputs: usize, bbox: &Bbox, channels: &ChannelSet, count: u32) -> Vec<InputRequest> {
        self.op.request(info, inputs, bbox, channels, count)
    }

    fn out_channels(&self, info: &Info) -> ChannelSet {
        self.op.out_channels(info)
    }

    fn engine(&self, cx: &EngineCx<'_>, y: i32, x: i32, r: i32, channels: &ChannelSet, row: &mut Row) -> Result<()> {
        let stripe = self.stripe(cx, y, channels)?;
        for ch in channels.iter().take_while(|c| *c <= cx.last_channel()) {
            stripe.read_row(y, ch, x, row.span_mut(ch, x, r));
        }
        Ok(())
    }

    fn supports_planes(&self) -> bool {
        true
    }

    fn fetch_plane(&self, cx: &EngineCx<'_>, plane: &mut ImagePlane) -> Result<()> {
        if cx.aborted() {
            return Err(GraphError::Aborted);
        }
        if self.op.parallel_stripes() && self.op.stripe_height() > 0 {
            self.render_parallel(cx, plane)
        } else {
            self.op.render_stripe(cx, plane)
        }
    }

    fn shared_plane(&self, cx: &EngineCx<'_>, bbox: Bbox, channels: &ChannelSet) -> Result<Option<Arc<ImagePlane>>> {
        let area = cx.request_area();
        if !area.contains_box(&bbox) || self.stripe_index(area, bbox.y()) != self.stripe_index(area, bbox.t() - 1) {
            return Ok(None);
        }
        self.stripe(cx, bbox.y(), channels).map(Some)
    }

    fn packed_preference(&self) -> PackedPreference {
        self.op.packed_preference()
    }
}
