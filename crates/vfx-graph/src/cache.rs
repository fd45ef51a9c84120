//! Per-operator scanline cache with a shared LRU memory budget.
//!
//! # Overview
//!
//! An operator whose output is read more than once gets a [`RowCache`]. A
//! cache line holds the requested channels of one scanline over the full
//! requested width, so any narrower read of the same line is a hit.
//!
//! Lines go through `Empty -> Filling -> Filled`. Exactly one thread fills
//! a line; the others block on a condition variable and then share the
//! same [`LineData`]. An abort during the fill leaves the line `Poisoned`:
//! the next reader gets [`GraphError::CachePoisoned`] and the one after
//! that recomputes.
//!
//! Every cache of a graph registers with a [`CacheArena`] that enforces a
//! global byte budget by evicting the least recently used line.
//!
//! Lock order is arena, then a cache's line map, then a single line. The
//! arena lock is never held while calling into a cache.
//!
//! # Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use vfx_core::{Channel, ChannelSet};
//! use vfx_graph::{CacheArena, CacheConfig, LineData, Row, RowCache};
//!
//! let arena = Arc::new(CacheArena::new(CacheConfig::default()));
//! let cache = RowCache::new(&arena, "Blur1");
//! let chans = ChannelSet::rgb();
//!
//! let line = cache.get_or_fill(0, 42, |_| true, || {
//!     let mut row = Row::new(0, 8);
//!     row.writable(Channel::RED).fill(1.0);
//!     Ok(LineData::from_row(&mut row, 0, &chans, Channel::BLUE))
//! }).unwrap();
//! assert_eq!(line.at(Channel::RED, 3), 1.0);
//! assert_eq!(cache.stats().misses, 1);
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};

use tracing::{debug, trace};
use vfx_core::{Channel, ChannelSet};

use crate::plane::StridedRow;
use crate::row::Row;
use crate::{GraphError, Result};

/// Default cache budget: 256 MiB.
pub const DEFAULT_BUDGET_BYTES: usize = 256 * 1024 * 1024;

/// Environment variable overriding the budget, in MiB.
pub const BUDGET_ENV: &str = "VFX_GRAPH_CACHE_MB";

/// Cache sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Resident bytes above which lines are evicted.
    pub budget_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            budget_bytes: DEFAULT_BUDGET_BYTES,
        }
    }
}

impl CacheConfig {
    /// Budget in bytes.
    pub fn with_budget(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    /// Default budget, overridden by `VFX_GRAPH_CACHE_MB` when it parses.
    pub fn from_env() -> Self {
        match std::env::var(BUDGET_ENV).ok().and_then(|v| v.trim().parse::<usize>().ok()) {
            Some(mb) => Self::with_budget(mb.saturating_mul(1024 * 1024)),
            None => Self::default(),
        }
    }
}

/// Counters of one cache, or of a whole arena.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads served from a filled line.
    pub hits: u64,
    /// Reads that had to compute the line.
    pub misses: u64,
    /// Lines dropped to stay within budget.
    pub evictions: u64,
    /// Bytes currently held.
    pub resident_bytes: usize,
    /// Lines currently held.
    pub lines: usize,
}

impl CacheStats {
    /// Fraction of reads that hit, 0 when nothing was read.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 { 0.0 } else { self.hits as f64 / total as f64 }
    }
}

/// One computed scanline: shared per-channel blocks over `x..r`.
#[derive(Debug, Clone)]
pub struct LineData {
    y: i32,
    x: i32,
    r: i32,
    channels: ChannelSet,
    /// `None` data means the channel is all zero.
    planes: Vec<(Channel, Option<(Arc<[f32]>, i32)>)>,
}

impl LineData {
    /// Freezes `channels` of a computed row into shareable blocks.
    pub fn from_row(row: &mut Row, y: i32, channels: &ChannelSet, last: Channel) -> Self {
        let planes = channels
            .iter()
            .take_while(|c| *c <= last)
            .filter(|c| !c.is_black())
            .map(|c| (c, row.freeze(c)))
            .collect();
        Self {
            y,
            x: row.x(),
            r: row.r(),
            channels: channels.clone(),
            planes,
        }
    }

    /// An all-zero line.
    pub fn black(y: i32, x: i32, r: i32, channels: &ChannelSet, last: Channel) -> Self {
        let planes = channels
            .iter()
            .take_while(|c| *c <= last)
            .filter(|c| !c.is_black())
            .map(|c| (c, None))
            .collect();
        Self {
            y,
            x,
            r: r.max(x),
            channels: channels.clone(),
            planes,
        }
    }

    /// Scanline.
    pub fn y(&self) -> i32 {
        self.y
    }

    /// Left edge.
    pub fn x(&self) -> i32 {
        self.x
    }

    /// Right edge (exclusive).
    pub fn r(&self) -> i32 {
        self.r
    }

    /// Channels held.
    pub fn channels(&self) -> &ChannelSet {
        &self.channels
    }

    /// True if the line holds `channels` over `x..r`.
    pub fn covers(&self, x: i32, r: i32, channels: &ChannelSet) -> bool {
        self.x <= x && self.r >= r && self.channels.contains_set(channels)
    }

    fn plane(&self, ch: Channel) -> Option<&(Arc<[f32]>, i32)> {
        self.planes
            .iter()
            .find(|(c, _)| *c == ch)
            .and_then(|(_, p)| p.as_ref())
    }

    /// Value at `x`, clamped to the line's range.
    pub fn at(&self, ch: Channel, x: i32) -> f32 {
        match self.plane(ch) {
            Some((data, data_x)) => {
                let x = x.clamp(self.x, self.r - 1);
                data[(x - data_x) as usize]
            }
            None => 0.0,
        }
    }

    /// Read view of one channel.
    pub fn row(&self, ch: Channel) -> StridedRow<'_> {
        match self.plane(ch) {
            Some((data, data_x)) => {
                let lo = (self.x - data_x) as usize;
                let hi = (self.r - data_x) as usize;
                StridedRow::contiguous(&data[lo..hi], self.x)
            }
            None => StridedRow::zero(self.x, self.r),
        }
    }

    /// Shares the line's `channels` into `row`; channels the line does not
    /// hold are erased.
    pub fn write_to(&self, row: &mut Row, channels: &ChannelSet, last: Channel) {
        for ch in channels.iter().take_while(|c| *c <= last) {
            match self.plane(ch) {
                Some((data, data_x)) => row.share(ch, data.clone(), *data_x),
                None => row.erase(ch),
            }
        }
    }

    /// Approximate heap footprint.
    pub fn bytes(&self) -> usize {
        let w = (self.r - self.x).max(0) as usize;
        let owned = self.planes.iter().filter(|(_, p)| p.is_some()).count();
        owned * w * std::mem::size_of::<f32>() + std::mem::size_of::<Self>()
    }
}

/// Identifies a line within one cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LineKey {
    /// Scanline.
    pub y: i32,
    /// Hash of the operator in the context the line was computed for.
    pub hash: u64,
}

enum LineState {
    Empty,
    Filling,
    Filled(Arc<LineData>),
    Poisoned,
}

struct Line {
    state: Mutex<LineState>,
    ready: Condvar,
}

impl Line {
    fn new() -> Self {
        Self {
            state: Mutex::new(LineState::Empty),
            ready: Condvar::new(),
        }
    }
}

struct Entry {
    stamp: u64,
    bytes: usize,
}

/// Lines are keyed by `(cache id, line key)`; `order` maps an access
/// stamp to its line, so the smallest stamp is the least recently used.
struct ArenaInner {
    entries: HashMap<(u64, LineKey), Entry>,
    order: BTreeMap<u64, (u64, LineKey)>,
    clock: u64,
    resident: usize,
    caches: HashMap<u64, Weak<RowCache>>,
    evictions: u64,
    next_id: u64,
}

impl ArenaInner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn remove(&mut self, cache: u64, key: LineKey) -> Option<Entry> {
        let old = self.entries.remove(&(cache, key))?;
        self.order.remove(&old.stamp);
        self.resident = self.resident.saturating_sub(old.bytes);
        Some(old)
    }
}

/// Shared memory budget for every [`RowCache`] registered with it.
pub struct CacheArena {
    config: CacheConfig,
    inner: Mutex<ArenaInner>,
}

impl std::fmt::Debug for CacheArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheArena")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for CacheArena {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl CacheArena {
    /// Creates an arena.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(ArenaInner {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                clock: 0,
                resident: 0,
                caches: HashMap::new(),
                evictions: 0,
                next_id: 1,
            }),
        }
    }

    /// The process-wide arena, sized from the environment.
    pub fn global() -> Arc<CacheArena> {
        static GLOBAL: OnceLock<Arc<CacheArena>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(CacheArena::new(CacheConfig::from_env())))
            .clone()
    }

    /// Sizing in effect.
    pub fn config(&self) -> CacheConfig {
        self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ArenaInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, cache: &Arc<RowCache>) {
        self.lock().caches.insert(cache.id, Arc::downgrade(cache));
    }

    fn next_id(&self) -> u64 {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        id
    }

    /// Accounts a newly filled line and evicts down to the budget.
    fn insert(&self, cache: u64, key: LineKey, bytes: usize) {
        let victims = {
            let mut inner = self.lock();
            inner.remove(cache, key);
            let stamp = inner.tick();
            inner.entries.insert((cache, key), Entry { stamp, bytes });
            inner.order.insert(stamp, (cache, key));
            inner.resident += bytes;

            let mut victims = Vec::new();
            while inner.resident > self.config.budget_bytes && inner.order.len() > 1 {
                let Some((_, (owner, old))) = inner.order.pop_first() else { break };
                if let Some(e) = inner.entries.remove(&(owner, old)) {
                    inner.resident = inner.resident.saturating_sub(e.bytes);
                }
                inner.evictions += 1;
                if let Some(weak) = inner.caches.get(&owner) {
                    victims.push((weak.clone(), old));
                }
            }
            victims
        };
        for (weak, key) in victims {
            if let Some(cache) = weak.upgrade() {
                cache.evict(key);
            }
        }
    }

    /// Marks a line as most recently used.
    fn touch(&self, cache: u64, key: LineKey) {
        let mut inner = self.lock();
        let stamp = inner.tick();
        let Some(entry) = inner.entries.get_mut(&(cache, key)) else {
            return;
        };
        let old = std::mem::replace(&mut entry.stamp, stamp);
        inner.order.remove(&old);
        inner.order.insert(stamp, (cache, key));
    }

    fn forget_lines(&self, cache: u64) {
        let mut inner = self.lock();
        let keys: Vec<LineKey> = inner
            .entries
            .keys()
            .filter(|(c, _)| *c == cache)
            .map(|(_, k)| *k)
            .collect();
        for key in keys {
            inner.remove(cache, key);
        }
    }

    fn forget(&self, cache: u64) {
        self.forget_lines(cache);
        self.lock().caches.remove(&cache);
    }

    fn usage(&self, cache: u64) -> (usize, usize) {
        let inner = self.lock();
        inner
            .entries
            .iter()
            .filter(|((c, _), _)| *c == cache)
            .fold((0, 0), |(n, b), (_, e)| (n + 1, b + e.bytes))
    }

    /// Totals over every registered cache.
    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            hits: 0,
            misses: 0,
            evictions: inner.evictions,
            resident_bytes: inner.resident,
            lines: inner.entries.len(),
        }
    }
}

/// Scanline cache of one operator.
pub struct RowCache {
    id: u64,
    owner: String,
    arena: Arc<CacheArena>,
    lines: Mutex<HashMap<LineKey, Arc<Line>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl std::fmt::Debug for RowCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowCache")
            .field("owner", &self.owner)
            .field("stats", &self.stats())
            .finish()
    }
}

impl RowCache {
    /// Creates a cache registered with `arena`.
    pub fn new(arena: &Arc<CacheArena>, owner: &str) -> Arc<Self> {
        let cache = Arc::new(Self {
            id: arena.next_id(),
            owner: owner.to_string(),
            arena: arena.clone(),
            lines: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        });
        arena.register(&cache);
        debug!(owner, id = cache.id, "row cache enabled");
        cache
    }

    fn line(&self, key: LineKey) -> Arc<Line> {
        self.lines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key)
            .or_insert_with(|| Arc::new(Line::new()))
            .clone()
    }

    /// Returns the line for `(y, hash)`, computing it with `fill` unless a
    /// filled line satisfying `usable` exists.
    ///
    /// Concurrent callers for the same line wait for the first one.
    pub fn get_or_fill<F>(
        &self,
        y: i32,
        hash: u64,
        usable: impl Fn(&LineData) -> bool,
        fill: F,
    ) -> Result<Arc<LineData>>
    where
        F: FnOnce() -> Result<LineData>,
    {
        let key = LineKey { y, hash };
        let line = self.line(key);
        {
            let mut state = line.state.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                match &*state {
                    LineState::Filled(data) if usable(data) => {
                        let data = data.clone();
                        drop(state);
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        self.arena.touch(self.id, key);
                        return Ok(data);
                    }
                    LineState::Filling => {
                        state = line.ready.wait(state).unwrap_or_else(|e| e.into_inner());
                    }
                    LineState::Poisoned => {
                        *state = LineState::Empty;
                        return Err(GraphError::CachePoisoned);
                    }
                    LineState::Empty | LineState::Filled(_) => {
                        *state = LineState::Filling;
                        break;
                    }
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        trace!(owner = %self.owner, y, "cache miss");
        let result = fill();

        let mut state = line.state.lock().unwrap_or_else(|e| e.into_inner());
        match result {
            Ok(data) => {
                let bytes = data.bytes();
                let data = Arc::new(data);
                *state = LineState::Filled(data.clone());
                line.ready.notify_all();
                drop(state);
                self.arena.insert(self.id, key, bytes);
                Ok(data)
            }
            Err(e) => {
                *state = if e.is_aborted() {
                    LineState::Poisoned
                } else {
                    LineState::Empty
                };
                line.ready.notify_all();
                Err(e)
            }
        }
    }

    /// A filled line, without computing or counting.
    pub fn peek(&self, y: i32, hash: u64) -> Option<Arc<LineData>> {
        let line = self
            .lines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&LineKey { y, hash })
            .cloned()?;
        let state = line.state.lock().unwrap_or_else(|e| e.into_inner());
        match &*state {
            LineState::Filled(data) => Some(data.clone()),
            _ => None,
        }
    }

    /// Stores a line computed elsewhere.
    pub fn store(&self, y: i32, hash: u64, data: LineData) -> Arc<LineData> {
        let key = LineKey { y, hash };
        let line = self.line(key);
        let bytes = data.bytes();
        let data = Arc::new(data);
        {
            let mut state = line.state.lock().unwrap_or_else(|e| e.into_inner());
            if matches!(*state, LineState::Filling) {
                return data;
            }
            *state = LineState::Filled(data.clone());
        }
        self.arena.insert(self.id, key, bytes);
        data
    }

    /// Drops a line the arena no longer accounts for.
    ///
    /// Blocks on the line's state: no path holds a line's state while
    /// waiting on the line map. A line being refilled stays, its filler
    /// accounts it again on completion.
    fn evict(&self, key: LineKey) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        let busy = lines.get(&key).is_some_and(|line| {
            let state = line.state.lock().unwrap_or_else(|e| e.into_inner());
            matches!(*state, LineState::Filling)
        });
        if !busy && lines.remove(&key).is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            trace!(owner = %self.owner, y = key.y, "line evicted");
        }
    }

    #[cfg(test)]
    fn held(&self) -> usize {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Drops every line.
    pub fn clear(&self) {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.arena.forget_lines(self.id);
    }

    /// Operator the cache belongs to.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Counters of this cache.
    pub fn stats(&self) -> CacheStats {
        let (lines, resident_bytes) = self.arena.usage(self.id);
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            resident_bytes,
            lines,
        }
    }
}

impl Drop for RowCache {
    fn drop(&mut self) {
        self.arena.forget(self.id);
    }
}
