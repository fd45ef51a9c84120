//! Scanline buffers with per-channel ownership.
//!
//! A [`Row`] holds one float buffer per channel for the pixels
//! `x <= X < r` of a single scanline. Each channel is in one of these
//! states:
//!
//! - **unset** - never written, reads as zero
//! - **owned** - a heap block owned by the row, writable
//! - **shared** - a read-only block owned elsewhere (a cache line or
//!   another row), kept alive by reference counting
//! - **zero** - a view into the process-wide zero buffer
//!
//! Channel `0` (black) is special: reads return zeros and writes land in a
//! junk buffer that is never read back.
//!
//! # Usage
//!
//! ```rust
//! use vfx_core::Channel;
//! use vfx_graph::Row;
//!
//! let mut row = Row::new(10, 20);
//! row.writable(Channel::RED).fill(0.5);
//! assert_eq!(row.at(Channel::RED, 12), 0.5);
//!
//! row.erase(Channel::RED);
//! assert!(row.is_zero(Channel::RED));
//! ```

use std::sync::{Arc, Mutex, OnceLock};

use vfx_core::{Channel, ChannelSet};

/// Smallest zero block handed out.
const MIN_ZERO_BLOCK: usize = 4096;

fn zero_blocks() -> &'static Mutex<Vec<Arc<[f32]>>> {
    static BLOCKS: OnceLock<Mutex<Vec<Arc<[f32]>>>> = OnceLock::new();
    BLOCKS.get_or_init(|| Mutex::new(Vec::new()))
}

/// Returns a shared all-zero buffer of at least `n` floats.
///
/// Blocks are allocated on demand and never freed, so their addresses
/// stay valid for the life of the process.
pub fn zero_buffer(n: usize) -> Arc<[f32]> {
    let mut blocks = zero_blocks().lock().unwrap_or_else(|e| e.into_inner());
    if let Some(b) = blocks.last() {
        if b.len() >= n {
            return b.clone();
        }
    }
    let size = n
        .max(MIN_ZERO_BLOCK)
        .max(blocks.last().map_or(0, |b| b.len() * 2));
    let block: Arc<[f32]> = vec![0.0f32; size].into();
    blocks.push(block.clone());
    block
}

/// True if `data` points into a block returned by [`zero_buffer`].
pub fn is_zero_buffer(data: &[f32]) -> bool {
    let start = data.as_ptr() as usize;
    let end = start + std::mem::size_of_val(data);
    let blocks = zero_blocks().lock().unwrap_or_else(|e| e.into_inner());
    blocks.iter().any(|b| {
        let bs = b.as_ptr() as usize;
        let be = bs + std::mem::size_of_val(&b[..]);
        start >= bs && end <= be
    })
}

#[derive(Debug, Clone, Default)]
enum Slot {
    #[default]
    Unset,
    Owned(Vec<f32>),
    /// `data[start]` is the pixel at the row's current left edge.
    Shared {
        data: Arc<[f32]>,
        start: usize,
    },
    Zero(Arc<[f32]>),
}

/// One scanline of float data, indexed by channel then x.
#[derive(Debug, Clone)]
pub struct Row {
    x: i32,
    r: i32,
    slots: Vec<Slot>,
    junk: Vec<f32>,
    zero: Arc<[f32]>,
}

impl Row {
    /// Creates an empty row covering `x <= X < r`.
    pub fn new(x: i32, r: i32) -> Self {
        let r = r.max(x);
        Self {
            x,
            r,
            slots: Vec::new(),
            junk: Vec::new(),
            zero: zero_buffer((r - x) as usize),
        }
    }

    /// Left edge (inclusive).
    #[inline]
    pub fn x(&self) -> i32 {
        self.x
    }

    /// Right edge (exclusive).
    #[inline]
    pub fn r(&self) -> i32 {
        self.r
    }

    /// Number of pixels.
    #[inline]
    pub fn width(&self) -> usize {
        (self.r - self.x) as usize
    }

    fn slot(&self, ch: Channel) -> &Slot {
        static UNSET: Slot = Slot::Unset;
        self.slots.get(ch.index() as usize).unwrap_or(&UNSET)
    }

    fn slot_mut(&mut self, ch: Channel) -> &mut Slot {
        let i = ch.index() as usize;
        if self.slots.len() <= i {
            self.slots.resize(i + 1, Slot::Unset);
        }
        &mut self.slots[i]
    }

    /// Read access to a channel; element `i` is the pixel at `x() + i`.
    ///
    /// Unset channels and channel `0` read as zeros.
    pub fn channel(&self, ch: Channel) -> &[f32] {
        let w = self.width();
        if ch.is_black() {
            return &self.zero[..w];
        }
        match self.slot(ch) {
            Slot::Owned(v) => &v[..w],
            Slot::Shared { data, start } => &data[*start..*start + w],
            Slot::Zero(z) => &z[..w],
            Slot::Unset => &self.zero[..w],
        }
    }

    /// Value of channel `ch` at `x`, which must lie in the row's range.
    #[inline]
    pub fn at(&self, ch: Channel, x: i32) -> f32 {
        let s = self.channel(ch);
        s.get((x - self.x) as usize).copied().unwrap_or(0.0)
    }

    /// Slice of channel `ch` for `x <= X < r`, which must lie within the
    /// row's range.
    pub fn span(&self, ch: Channel, x: i32, r: i32) -> &[f32] {
        debug_assert!(self.x <= x && x <= r && r <= self.r, "span {x}..{r} outside row {}..{}", self.x, self.r);
        let s = self.channel(ch);
        &s[(x - self.x) as usize..(r - self.x) as usize]
    }

    /// Makes a channel writable and returns its whole buffer.
    ///
    /// Contents are unspecified after a transition from a non-owned
    /// state; once owned, the buffer stays put until [`range`](Self::range)
    /// grows the row. Channel `0` returns the junk buffer.
    pub fn writable(&mut self, ch: Channel) -> &mut [f32] {
        let w = self.width();
        if ch.is_black() {
            if self.junk.len() < w {
                self.junk.resize(w, 0.0);
            }
            return &mut self.junk[..w];
        }
        let slot = self.slot_mut(ch);
        if !matches!(slot, Slot::Owned(_)) {
            let mut v = vec![0.0f32; w];
            if let Slot::Shared { data, start } = slot {
                v.copy_from_slice(&data[*start..*start + w]);
            }
            *slot = Slot::Owned(v);
        }
        match slot {
            Slot::Owned(v) => &mut v[..w],
            _ => unreachable!("slot was made owned above"),
        }
    }

    /// Writable slice of channel `ch` for `x <= X < r`, within the row's
    /// range.
    pub fn span_mut(&mut self, ch: Channel, x: i32, r: i32) -> &mut [f32] {
        debug_assert!(self.x <= x && x <= r && r <= self.r, "span {x}..{r} outside row {}..{}", self.x, self.r);
        let off = self.x;
        let buf = self.writable(ch);
        &mut buf[(x - off) as usize..(r - off) as usize]
    }

    /// Points a channel at the shared zero buffer.
    pub fn erase(&mut self, ch: Channel) {
        if ch.is_black() {
            return;
        }
        let zero = self.zero.clone();
        *self.slot_mut(ch) = Slot::Zero(zero);
    }

    /// Erases every channel of `channels` up to `last`.
    pub fn erase_set(&mut self, channels: &ChannelSet, last: Channel) {
        for ch in channels.iter().take_while(|c| *c <= last) {
            self.erase(ch);
        }
    }

    /// True if the channel currently reads from the zero buffer.
    pub fn is_zero(&self, ch: Channel) -> bool {
        match self.slot(ch) {
            Slot::Zero(_) | Slot::Unset => true,
            _ => ch.is_black(),
        }
    }

    /// True if the channel owns a writable buffer.
    pub fn is_writable(&self, ch: Channel) -> bool {
        matches!(self.slot(ch), Slot::Owned(_))
    }

    /// True if the channel borrows a buffer owned elsewhere.
    pub fn is_shared(&self, ch: Channel) -> bool {
        matches!(self.slot(ch), Slot::Shared { .. })
    }

    /// Aliases a shared block whose element 0 is the pixel at `data_x`.
    ///
    /// Falls back to a copy when the block does not cover the row.
    pub fn share(&mut self, ch: Channel, data: Arc<[f32]>, data_x: i32) {
        if ch.is_black() {
            return;
        }
        let w = self.width();
        let covers = self.x >= data_x && (self.r - data_x) as usize <= data.len();
        if covers {
            let start = (self.x - data_x) as usize;
            *self.slot_mut(ch) = Slot::Shared { data, start };
        } else {
            let x = self.x;
            let buf = self.writable(ch);
            for (i, v) in buf.iter_mut().enumerate().take(w) {
                let sx = x + i as i32 - data_x;
                *v = if sx >= 0 && (sx as usize) < data.len() {
                    data[sx as usize]
                } else {
                    0.0
                };
            }
        }
    }

    /// Turns an owned channel into a shared one and returns the block
    /// together with the x of its element 0.
    ///
    /// Zero and unset channels return `None`.
    pub fn freeze(&mut self, ch: Channel) -> Option<(Arc<[f32]>, i32)> {
        if ch.is_black() {
            return None;
        }
        let x = self.x;
        let slot = self.slot_mut(ch);
        match std::mem::take(slot) {
            Slot::Owned(v) => {
                let data: Arc<[f32]> = v.into();
                *slot = Slot::Shared {
                    data: data.clone(),
                    start: 0,
                };
                Some((data, x))
            }
            Slot::Shared { data, start } => {
                *slot = Slot::Shared {
                    data: data.clone(),
                    start,
                };
                Some((data, x - start as i32))
            }
            other => {
                *slot = other;
                None
            }
        }
    }

    /// Logical copy of `channels` over `x <= X < r` from `src`.
    ///
    /// Shared and zero channels are aliased when the whole row is copied;
    /// everything else is copied by value.
    pub fn copy_from(&mut self, src: &Row, channels: &ChannelSet, x: i32, r: i32, last: Channel) {
        let whole = x <= self.x && r >= self.r && src.x <= self.x && src.r >= self.r;
        for ch in channels.iter().take_while(|c| *c <= last) {
            if ch.is_black() {
                continue;
            }
            match src.slot(ch) {
                Slot::Shared { data, start } if whole => {
                    let start = start + (self.x - src.x) as usize;
                    *self.slot_mut(ch) = Slot::Shared {
                        data: data.clone(),
                        start,
                    };
                }
                Slot::Zero(_) | Slot::Unset if whole => self.erase(ch),
                _ => {
                    let lo = x.max(src.x).max(self.x);
                    let hi = r.min(src.r).min(self.r);
                    if lo < hi {
                        let from = src.span(ch, lo, hi).to_vec();
                        self.span_mut(ch, lo, hi).copy_from_slice(&from);
                    }
                }
            }
        }
    }

    /// Changes the covered range. Buffers are reallocated, so previously
    /// returned slices are invalid; pixels in both ranges keep their values.
    pub fn range(&mut self, x: i32, r: i32) {
        let r = r.max(x);
        if x == self.x && r == self.r {
            return;
        }
        let (old_x, old_r) = (self.x, self.r);
        let new_w = (r - x) as usize;
        let lo = x.max(old_x);
        let hi = r.min(old_r);
        let zero = zero_buffer(new_w);
        for slot in &mut self.slots {
            let old: Option<&[f32]> = match slot {
                Slot::Owned(v) => Some(&v[..]),
                Slot::Shared { data, start } => Some(&data[*start..]),
                _ => None,
            };
            match old {
                Some(old) => {
                    let mut v = vec![0.0f32; new_w];
                    if lo < hi {
                        let src = &old[(lo - old_x) as usize..(hi - old_x) as usize];
                        v[(lo - x) as usize..(hi - x) as usize].copy_from_slice(src);
                    }
                    *slot = Slot::Owned(v);
                }
                None => {
                    if matches!(slot, Slot::Zero(_)) {
                        *slot = Slot::Zero(zero.clone());
                    }
                }
            }
        }
        self.zero = zero;
        self.x = x;
        self.r = r;
    }

    /// Shifts the row by `d` pixels without touching the data.
    ///
    /// The pixel that was at `X` is afterwards at `X + d`.
    #[inline]
    pub fn offset(&mut self, d: i32) {
        self.x += d;
        self.r += d;
    }

    /// Replicates the values at `cx` and `cr - 1` outwards to `x` and `r`.
    pub fn replicate_edges(&mut self, ch: Channel, x: i32, cx: i32, cr: i32, r: i32) {
        if cx <= x && cr >= r {
            return;
        }
        let off = self.x;
        let buf = self.writable(ch);
        let left = buf[(cx - off) as usize];
        let right = buf[(cr - 1 - off) as usize];
        for v in &mut buf[(x - off) as usize..(cx - off) as usize] {
            *v = left;
        }
        for v in &mut buf[(cr - off) as usize..(r - off) as usize] {
            *v = right;
        }
    }

    /// Fills `x <= X < r` of a channel with one value.
    pub fn fill(&mut self, ch: Channel, x: i32, r: i32, value: f32) {
        self.span_mut(ch, x, r).fill(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic]
    fn test_span_left_of_row_panics() {
        let row = Row::new(4, 8);
        let _ = row.span(Channel::RED, 2, 6);
    }

    #[test]
    #[should_panic]
    fn test_span_mut_past_right_edge_panics() {
        let mut row = Row::new(0, 4);
        let _ = row.span_mut(Channel::RED, 2, 6);
    }

    #[test]
    fn test_zero_buffer_identity() {
        let z = zero_buffer(100);
        assert!(is_zero_buffer(&z[..100]));
        assert!(is_zero_buffer(&z[10..20]));
        let big = zero_buffer(1 << 16);
        assert!(is_zero_buffer(&big[..]));
        let other = vec![0.0f32; 100];
        assert!(!is_zero_buffer(&other));
    }

    #[test]
    fn test_erase_reads_zero_buffer() {
        let mut row = Row::new(-5, 5);
        row.writable(Channel::GREEN).fill(3.0);
        row.erase(Channel::GREEN);
        assert!(row.is_zero(Channel::GREEN));
        assert!(is_zero_buffer(row.channel(Channel::GREEN)));
        assert_eq!(row.channel(Channel::GREEN).len(), 10);
    }

    #[test]
    fn test_black_channel_is_junk() {
        let mut row = Row::new(0, 4);
        row.writable(Channel::BLACK).fill(9.0);
        assert_eq!(row.channel(Channel::BLACK), &[0.0; 4]);
    }

    #[test]
    fn test_writable_is_stable() {
        let mut row = Row::new(0, 8);
        let p1 = row.writable(Channel::RED).as_ptr();
        row.writable(Channel::RED)[3] = 1.0;
        let p2 = row.writable(Channel::RED).as_ptr();
        assert_eq!(p1, p2);
        assert_eq!(row.at(Channel::RED, 3), 1.0);
    }

    #[test]
    fn test_share_aliases_and_copies() {
        let data: Arc<[f32]> = (0..20).map(|i| i as f32).collect::<Vec<_>>().into();
        let mut row = Row::new(5, 10);
        row.share(Channel::RED, data.clone(), 0);
        assert!(row.is_shared(Channel::RED));
        assert_eq!(row.channel(Channel::RED), &[5.0, 6.0, 7.0, 8.0, 9.0]);

        // Not covered: falls back to a copy, outside reads as zero.
        let mut row = Row::new(-2, 3);
        row.share(Channel::RED, data, 0);
        assert!(row.is_writable(Channel::RED));
        assert_eq!(row.channel(Channel::RED), &[0.0, 0.0, 0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_copy_from_aliases_whole_row() {
        let data: Arc<[f32]> = vec![1.0f32; 16].into();
        let mut src = Row::new(0, 16);
        src.share(Channel::RED, data, 0);
        src.writable(Channel::GREEN).fill(2.0);
        let mut dst = Row::new(4, 8);
        dst.copy_from(&src, &ChannelSet::rgb(), 4, 8, Channel::LAST);
        assert!(dst.is_shared(Channel::RED));
        assert!(dst.is_writable(Channel::GREEN));
        assert!(dst.is_zero(Channel::BLUE));
        assert_eq!(dst.channel(Channel::GREEN), &[2.0; 4]);
    }

    #[test]
    fn test_range_keeps_overlap() {
        let mut row = Row::new(0, 4);
        row.writable(Channel::RED).copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        row.range(-2, 6);
        assert_eq!(row.width(), 8);
        assert_eq!(row.channel(Channel::RED), &[0.0, 0.0, 1.0, 2.0, 3.0, 4.0, 0.0, 0.0]);
    }

    #[test]
    fn test_offset_is_reversible() {
        let mut row = Row::new(0, 3);
        row.writable(Channel::RED).copy_from_slice(&[1.0, 2.0, 3.0]);
        row.offset(10);
        assert_eq!((row.x(), row.r()), (10, 13));
        assert_eq!(row.at(Channel::RED, 11), 2.0);
        row.offset(-10);
        assert_eq!(row.at(Channel::RED, 1), 2.0);
    }

    #[test]
    fn test_replicate_edges() {
        let mut row = Row::new(0, 6);
        row.span_mut(Channel::RED, 2, 4).copy_from_slice(&[5.0, 7.0]);
        row.replicate_edges(Channel::RED, 0, 2, 4, 6);
        assert_eq!(row.channel(Channel::RED), &[5.0, 5.0, 5.0, 7.0, 7.0, 7.0]);
    }

    #[test]
    fn test_freeze_shares_owned_block() {
        let mut row = Row::new(4, 7);
        row.writable(Channel::GREEN).copy_from_slice(&[1.0, 2.0, 3.0]);
        let (data, data_x) = row.freeze(Channel::GREEN).unwrap();
        assert_eq!(data_x, 4);
        assert!(row.is_shared(Channel::GREEN));
        assert_eq!(&data[..], &[1.0, 2.0, 3.0]);
        assert!(row.freeze(Channel::BLUE).is_none());
    }
}
