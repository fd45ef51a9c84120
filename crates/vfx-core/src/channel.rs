//! Channel identifiers, channel sets and the channel registry.
//!
//! A [`Channel`] is a small integer naming one scalar per pixel. Channel
//! `0` is the distinguished *black* channel: it is never a member of a
//! [`ChannelSet`] and writes to it are discarded.
//!
//! # Overview
//!
//! - [`Channel`] - identifier in `[1, Channel::LAST]`
//! - [`ChannelSet`] - sparse set with an optional "every channel from here
//!   up" tail, used as a mask everywhere in the pipeline
//! - [`ChannelMap`] - immutable set plus channel -> position index
//! - [`ChannelRegistry`] - monotone, thread-safe name allocator
//!
//! # Usage
//!
//! ```rust
//! use vfx_core::{Channel, ChannelRegistry, ChannelSet};
//!
//! let registry = ChannelRegistry::new();
//! let spec = registry.channel_by_name("spec", "red").unwrap();
//! assert!(spec.index() > Channel::ALPHA.index());
//!
//! let mut set = ChannelSet::rgb();
//! set.insert(spec);
//! assert_eq!(set.len(), Some(4));
//! assert!(ChannelSet::all().contains(spec));
//! ```

use std::collections::HashMap;
use std::fmt;
use std::ops::{BitAnd, BitOr, Sub};
use std::sync::RwLock;

use smallvec::SmallVec;

use crate::{Error, Result};

/// Channels below this id live in the dense bitmask of a [`ChannelSet`].
const DENSE_LIMIT: u32 = 64;

/// A channel identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Channel(u32);

impl Channel {
    /// The black channel. Never stored in a set; reads as zero.
    pub const BLACK: Channel = Channel(0);
    /// `rgba.red`
    pub const RED: Channel = Channel(1);
    /// `rgba.green`
    pub const GREEN: Channel = Channel(2);
    /// `rgba.blue`
    pub const BLUE: Channel = Channel(3);
    /// `rgba.alpha`
    pub const ALPHA: Channel = Channel(4);
    /// `depth.Z`
    pub const Z: Channel = Channel(5);
    /// `deep.front`, front depth of a deep sample.
    pub const DEEP_FRONT: Channel = Channel(6);
    /// `deep.back`, back depth of a deep sample.
    pub const DEEP_BACK: Channel = Channel(7);
    /// `mask.a`
    pub const MASK: Channel = Channel(8);
    /// `forward.u`
    pub const FORWARD_U: Channel = Channel(9);
    /// `forward.v`
    pub const FORWARD_V: Channel = Channel(10);
    /// Highest identifier the registry will hand out.
    pub const LAST: Channel = Channel(1023);

    /// Wraps a raw id. Ids above [`Channel::LAST`] are clamped to it.
    #[inline]
    pub const fn new(id: u32) -> Self {
        if id > Self::LAST.0 {
            Self::LAST
        } else {
            Channel(id)
        }
    }

    /// Raw identifier.
    #[inline]
    pub const fn index(self) -> u32 {
        self.0
    }

    /// True for channel 0.
    #[inline]
    pub const fn is_black(self) -> bool {
        self.0 == 0
    }

    #[inline]
    fn next(self) -> Channel {
        Channel(self.0 + 1)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A set of channels.
///
/// Storage is a bitmask for ids below 64 plus a sorted overflow list for
/// larger ids. A set may additionally contain *every* channel from some id
/// upwards (see [`ChannelSet::all`]); such a set has no finite size.
///
/// The representation is canonical, so two sets compare equal exactly when
/// they contain the same channels, and the derived ordering is a usable
/// total order for map keys (bitmask first, then overflow, then tail).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ChannelSet {
    mask: u64,
    overflow: SmallVec<[Channel; 4]>,
    above: Option<Channel>,
}

impl ChannelSet {
    /// The empty set.
    #[inline]
    pub fn none() -> Self {
        Self::default()
    }

    /// Every channel except black.
    #[inline]
    pub fn all() -> Self {
        Self {
            mask: 0,
            overflow: SmallVec::new(),
            above: Some(Channel::RED),
        }
    }

    /// Explicit channels plus every channel above the highest of them.
    pub fn with_all_above(channels: impl IntoIterator<Item = Channel>) -> Self {
        let mut set: ChannelSet = channels.into_iter().collect();
        let from = set.last_explicit().map(|c| c.next()).unwrap_or(Channel::RED);
        set.above = Some(from);
        set.canonicalize();
        set
    }

    /// Red only.
    pub fn red() -> Self {
        Self::from_slice(&[Channel::RED])
    }

    /// Alpha only.
    pub fn alpha() -> Self {
        Self::from_slice(&[Channel::ALPHA])
    }

    /// Red, green, blue.
    pub fn rgb() -> Self {
        Self::from_slice(&[Channel::RED, Channel::GREEN, Channel::BLUE])
    }

    /// Red, green, blue, alpha.
    pub fn rgba() -> Self {
        Self::from_slice(&[Channel::RED, Channel::GREEN, Channel::BLUE, Channel::ALPHA])
    }

    /// Deep front and back depth.
    pub fn deep_depths() -> Self {
        Self::from_slice(&[Channel::DEEP_FRONT, Channel::DEEP_BACK])
    }

    /// Builds a set from a slice of channels.
    pub fn from_slice(channels: &[Channel]) -> Self {
        channels.iter().copied().collect()
    }

    /// True if the set holds no channel.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mask == 0 && self.overflow.is_empty() && self.above.is_none()
    }

    /// True if the set contains every channel from some id upwards.
    #[inline]
    pub fn has_all_above(&self) -> bool {
        self.above.is_some()
    }

    /// First id of the open-ended tail, if any.
    #[inline]
    pub fn all_above_from(&self) -> Option<Channel> {
        self.above
    }

    /// Number of channels, `None` for open-ended sets.
    pub fn len(&self) -> Option<usize> {
        if self.above.is_some() {
            None
        } else {
            Some(self.explicit_len())
        }
    }

    fn explicit_len(&self) -> usize {
        self.mask.count_ones() as usize + self.overflow.len()
    }

    /// Membership test. Channel 0 is never a member.
    pub fn contains(&self, ch: Channel) -> bool {
        if ch.is_black() {
            return false;
        }
        if let Some(a) = self.above {
            if ch >= a {
                return true;
            }
        }
        self.contains_explicit(ch)
    }

    fn contains_explicit(&self, ch: Channel) -> bool {
        if ch.0 < DENSE_LIMIT {
            self.mask & (1u64 << ch.0) != 0
        } else {
            self.overflow.binary_search(&ch).is_ok()
        }
    }

    /// True if every channel of `other` is in `self`.
    pub fn contains_set(&self, other: &ChannelSet) -> bool {
        match (self.above, other.above) {
            (None, Some(_)) => return false,
            (Some(a), Some(b)) if b < a => {
                if (b.0..a.0).any(|c| !self.contains(Channel(c))) {
                    return false;
                }
            }
            _ => {}
        }
        other.explicit().all(|c| self.contains(c))
    }

    /// True if the sets share a channel.
    pub fn intersects(&self, other: &ChannelSet) -> bool {
        !(self & other).is_empty()
    }

    /// Adds a channel. Adding channel 0 is a no-op.
    pub fn insert(&mut self, ch: Channel) {
        if ch.is_black() || self.contains(ch) {
            return;
        }
        self.insert_explicit(ch);
        self.canonicalize();
    }

    fn insert_explicit(&mut self, ch: Channel) {
        if ch.0 < DENSE_LIMIT {
            self.mask |= 1u64 << ch.0;
        } else if let Err(pos) = self.overflow.binary_search(&ch) {
            self.overflow.insert(pos, ch);
        }
    }

    fn remove_explicit(&mut self, ch: Channel) {
        if ch.0 < DENSE_LIMIT {
            self.mask &= !(1u64 << ch.0);
        } else if let Ok(pos) = self.overflow.binary_search(&ch) {
            self.overflow.remove(pos);
        }
    }

    /// Removes a channel.
    ///
    /// Removing a channel from the open-ended tail materialises the part of
    /// the tail below it as explicit channels.
    pub fn erase(&mut self, ch: Channel) {
        if !self.contains(ch) {
            return;
        }
        match self.above {
            Some(a) if ch >= a => {
                for c in a.0..ch.0 {
                    self.insert_explicit(Channel(c));
                }
                self.above = if ch >= Channel::LAST { None } else { Some(ch.next()) };
            }
            _ => self.remove_explicit(ch),
        }
        self.canonicalize();
    }

    /// Adds every channel of `other`.
    pub fn insert_set(&mut self, other: &ChannelSet) {
        *self = &*self | other;
    }

    /// Removes every channel of `other`.
    pub fn erase_set(&mut self, other: &ChannelSet) {
        *self = &*self - other;
    }

    /// Keeps only channels also in `other`.
    pub fn retain_set(&mut self, other: &ChannelSet) {
        *self = &*self & other;
    }

    /// Iterates the explicit (finite) part in ascending order.
    pub fn explicit(&self) -> impl Iterator<Item = Channel> + '_ {
        let mask = self.mask;
        (1..DENSE_LIMIT)
            .filter(move |c| mask & (1u64 << c) != 0)
            .map(Channel)
            .chain(self.overflow.iter().copied())
    }

    /// Iterates members in ascending order, skipping channel 0.
    ///
    /// An open-ended tail is iterated up to [`Channel::LAST`].
    pub fn iter(&self) -> impl Iterator<Item = Channel> + '_ {
        let tail = self
            .above
            .map(|a| a.0..=Channel::LAST.0)
            .into_iter()
            .flatten()
            .map(Channel);
        self.explicit().chain(tail)
    }

    /// Lowest member.
    pub fn first(&self) -> Option<Channel> {
        self.iter().next()
    }

    /// Highest explicit member.
    pub fn last_explicit(&self) -> Option<Channel> {
        if let Some(c) = self.overflow.last() {
            return Some(*c);
        }
        if self.mask == 0 {
            None
        } else {
            Some(Channel(63 - self.mask.leading_zeros()))
        }
    }

    /// Set difference.
    ///
    /// When both sets are open-ended the result is the symmetric difference
    /// of their explicit parts and carries no tail.
    pub fn difference(&self, other: &ChannelSet) -> ChannelSet {
        let mut out = ChannelSet::none();
        match (self.above, other.above) {
            (Some(_), Some(_)) => {
                for c in self.explicit() {
                    if !other.contains_explicit(c) {
                        out.insert_explicit(c);
                    }
                }
                for c in other.explicit() {
                    if !self.contains_explicit(c) {
                        out.insert_explicit(c);
                    }
                }
            }
            (Some(a), None) => {
                for c in self.explicit() {
                    if !other.contains(c) {
                        out.insert_explicit(c);
                    }
                }
                let holes: Vec<Channel> = other.explicit().filter(|c| *c >= a).collect();
                match holes.last() {
                    Some(top) => {
                        for c in a.0..top.0 {
                            if !other.contains(Channel(c)) {
                                out.insert_explicit(Channel(c));
                            }
                        }
                        if *top < Channel::LAST {
                            out.above = Some(top.next());
                        }
                    }
                    None => out.above = Some(a),
                }
            }
            (None, _) => {
                for c in self.explicit() {
                    if !other.contains(c) {
                        out.insert_explicit(c);
                    }
                }
            }
        }
        out.canonicalize();
        out
    }

    /// Set union.
    pub fn union(&self, other: &ChannelSet) -> ChannelSet {
        let mut out = ChannelSet {
            mask: self.mask | other.mask,
            overflow: self.overflow.clone(),
            above: match (self.above, other.above) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            },
        };
        for c in &other.overflow {
            out.insert_explicit(*c);
        }
        out.canonicalize();
        out
    }

    /// Set intersection.
    pub fn intersection(&self, other: &ChannelSet) -> ChannelSet {
        let mut out = ChannelSet::none();
        for c in self.explicit().chain(other.explicit()) {
            if self.contains(c) && other.contains(c) {
                out.insert_explicit(c);
            }
        }
        if let (Some(a), Some(b)) = (self.above, other.above) {
            out.above = Some(a.max(b));
        }
        out.canonicalize();
        out
    }

    /// Restores the canonical form: explicit channels lie strictly below the
    /// tail and the channel just below the tail is not explicit.
    fn canonicalize(&mut self) {
        let Some(mut a) = self.above else {
            return;
        };
        while a.0 > 1 && self.contains_explicit(Channel(a.0 - 1)) {
            self.remove_explicit(Channel(a.0 - 1));
            a = Channel(a.0 - 1);
        }
        if a.0 < DENSE_LIMIT {
            let keep = (1u64 << a.0) - 1;
            self.mask &= keep;
            self.overflow.clear();
        } else {
            self.overflow.retain(|c| *c < a);
        }
        self.mask &= !1;
        self.above = Some(a);
    }
}

impl FromIterator<Channel> for ChannelSet {
    fn from_iter<I: IntoIterator<Item = Channel>>(iter: I) -> Self {
        let mut set = ChannelSet::none();
        for c in iter {
            if !c.is_black() {
                set.insert_explicit(c);
            }
        }
        set
    }
}

impl From<Channel> for ChannelSet {
    fn from(ch: Channel) -> Self {
        ChannelSet::from_slice(&[ch])
    }
}

impl BitOr for &ChannelSet {
    type Output = ChannelSet;
    fn bitor(self, rhs: &ChannelSet) -> ChannelSet {
        self.union(rhs)
    }
}

impl BitAnd for &ChannelSet {
    type Output = ChannelSet;
    fn bitand(self, rhs: &ChannelSet) -> ChannelSet {
        self.intersection(rhs)
    }
}

impl Sub for &ChannelSet {
    type Output = ChannelSet;
    fn sub(self, rhs: &ChannelSet) -> ChannelSet {
        self.difference(rhs)
    }
}

impl fmt::Debug for ChannelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for ChannelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        let mut first = true;
        for c in self.explicit() {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{}", c.0)?;
            first = false;
        }
        if let Some(a) = self.above {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{}..", a.0)?;
        }
        write!(f, "}}")
    }
}

/// A fixed channel set with an inverse index.
///
/// Maps a channel to its position within the map, so per-channel data can
/// be stored densely (`data[map.index_of(ch)?]`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMap {
    set: ChannelSet,
    channels: Vec<Channel>,
    index: Vec<i32>,
}

impl ChannelMap {
    /// Builds the map. Open-ended sets are materialised up to [`Channel::LAST`].
    pub fn new(set: &ChannelSet) -> Self {
        let channels: Vec<Channel> = set.iter().collect();
        let len = channels.last().map(|c| c.0 as usize + 1).unwrap_or(0);
        let mut index = vec![-1i32; len];
        for (i, c) in channels.iter().enumerate() {
            index[c.0 as usize] = i as i32;
        }
        Self {
            set: set.clone(),
            channels,
            index,
        }
    }

    /// The underlying set.
    #[inline]
    pub fn set(&self) -> &ChannelSet {
        &self.set
    }

    /// Number of channels.
    #[inline]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// True if the map holds no channel.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Position of `ch` within the map.
    #[inline]
    pub fn index_of(&self, ch: Channel) -> Option<usize> {
        match self.index.get(ch.0 as usize) {
            Some(&i) if i >= 0 => Some(i as usize),
            _ => None,
        }
    }

    /// Channel at a position.
    #[inline]
    pub fn channel(&self, i: usize) -> Channel {
        self.channels[i]
    }

    /// Channels in ascending order.
    #[inline]
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }
}

impl From<&ChannelSet> for ChannelMap {
    fn from(set: &ChannelSet) -> Self {
        ChannelMap::new(set)
    }
}

#[derive(Debug, Clone)]
struct ChannelEntry {
    layer: String,
    name: String,
    index_in_layer: usize,
}

#[derive(Debug, Default)]
struct RegistryInner {
    entries: Vec<Option<ChannelEntry>>,
    by_name: HashMap<String, Channel>,
    layers: HashMap<String, Vec<Channel>>,
}

/// Thread-safe channel name allocator.
///
/// Identifiers are handed out monotonically and never reused. The built-in
/// channels (`rgba`, `depth`, `deep`, `mask`, `forward`) always hold the ids
/// of the [`Channel`] constants.
#[derive(Debug)]
pub struct ChannelRegistry {
    inner: RwLock<RegistryInner>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    /// Creates a registry holding only the built-in channels.
    pub fn new() -> Self {
        let mut inner = RegistryInner {
            entries: vec![None],
            ..Default::default()
        };
        let builtin = [
            ("rgba", "red"),
            ("rgba", "green"),
            ("rgba", "blue"),
            ("rgba", "alpha"),
            ("depth", "Z"),
            ("deep", "front"),
            ("deep", "back"),
            ("mask", "a"),
            ("forward", "u"),
            ("forward", "v"),
        ];
        for (layer, name) in builtin {
            Self::allocate(&mut inner, layer, name);
        }
        Self {
            inner: RwLock::new(inner),
        }
    }

    fn allocate(inner: &mut RegistryInner, layer: &str, name: &str) -> Channel {
        let ch = Channel(inner.entries.len() as u32);
        let members = inner.layers.entry(layer.to_string()).or_default();
        let index_in_layer = members.len();
        members.push(ch);
        inner.entries.push(Some(ChannelEntry {
            layer: layer.to_string(),
            name: name.to_string(),
            index_in_layer,
        }));
        inner.by_name.insert(format!("{layer}.{name}"), ch);
        ch
    }

    /// Returns the channel `layer.name`, allocating it on first use.
    pub fn channel_by_name(&self, layer: &str, name: &str) -> Result<Channel> {
        let full = format!("{layer}.{name}");
        if let Some(ch) = self.read().by_name.get(&full) {
            return Ok(*ch);
        }
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(ch) = inner.by_name.get(&full) {
            return Ok(*ch);
        }
        if inner.entries.len() as u32 > Channel::LAST.0 {
            return Err(Error::ChannelSpaceExhausted(full));
        }
        Ok(Self::allocate(&mut inner, layer, name))
    }

    /// Parses `layer.name`, or a short alias (`r g b a z`) of a built-in.
    pub fn parse(&self, full: &str) -> Result<Channel> {
        let alias = match full {
            "r" | "red" => Some(Channel::RED),
            "g" | "green" => Some(Channel::GREEN),
            "b" | "blue" => Some(Channel::BLUE),
            "a" | "alpha" => Some(Channel::ALPHA),
            "z" | "Z" => Some(Channel::Z),
            _ => None,
        };
        if let Some(ch) = alias {
            return Ok(ch);
        }
        match full.split_once('.') {
            Some((layer, name)) if !layer.is_empty() && !name.is_empty() => {
                self.channel_by_name(layer, name)
            }
            _ => Err(Error::UnknownChannel(full.to_string())),
        }
    }

    /// Looks up an existing channel without allocating.
    pub fn find(&self, full: &str) -> Option<Channel> {
        self.read().by_name.get(full).copied()
    }

    /// True if `ch` has been allocated.
    pub fn is_registered(&self, ch: Channel) -> bool {
        matches!(self.read().entries.get(ch.0 as usize), Some(Some(_)))
    }

    /// Full `layer.name` of a channel.
    pub fn full_name(&self, ch: Channel) -> Option<String> {
        self.entry(ch).map(|e| format!("{}.{}", e.layer, e.name))
    }

    /// Layer a channel belongs to.
    pub fn layer(&self, ch: Channel) -> Option<String> {
        self.entry(ch).map(|e| e.layer)
    }

    /// Position of a channel within its layer (0 is the red-equivalent).
    pub fn index_in_layer(&self, ch: Channel) -> Option<usize> {
        self.entry(ch).map(|e| e.index_in_layer)
    }

    /// Channels of a layer in allocation order.
    pub fn layer_channels(&self, layer: &str) -> Vec<Channel> {
        self.read().layers.get(layer).cloned().unwrap_or_default()
    }

    /// Highest allocated channel.
    pub fn last_channel(&self) -> Channel {
        Channel(self.read().entries.len() as u32 - 1)
    }

    fn entry(&self, ch: Channel) -> Option<ChannelEntry> {
        self.read().entries.get(ch.0 as usize).cloned().flatten()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[u32]) -> ChannelSet {
        ids.iter().map(|&i| Channel::new(i)).collect()
    }

    #[test]
    fn test_insert_erase_contains() {
        let mut s = ChannelSet::none();
        s.insert(Channel::RED);
        s.insert(Channel::new(200));
        s.insert(Channel::BLACK);
        assert!(s.contains(Channel::RED));
        assert!(s.contains(Channel::new(200)));
        assert!(!s.contains(Channel::BLACK));
        assert_eq!(s.len(), Some(2));
        s.erase(Channel::new(200));
        assert_eq!(s, ChannelSet::red());
    }

    #[test]
    fn test_self_identities() {
        for a in [set(&[1, 2, 70]), ChannelSet::all(), ChannelSet::with_all_above([Channel::new(3)])] {
            assert_eq!(&a & &a, a);
            assert_eq!(&a | &a, a);
            assert!((&a - &a).is_empty());
        }
    }

    #[test]
    fn test_all_above_absorbs_finite() {
        let all = ChannelSet::all();
        let b = set(&[1, 4, 99, 500]);
        assert_eq!(&all | &b, all);
        assert_eq!(&all & &b, b);
        assert!(all.contains_set(&b));
        assert!(!b.contains_set(&all));
        assert_eq!(all.len(), None);
    }

    #[test]
    fn test_canonical_equality() {
        let a = ChannelSet::with_all_above([Channel::RED, Channel::GREEN]);
        assert_eq!(a, ChannelSet::all());
        let mut b = ChannelSet::with_all_above([Channel::new(10)]);
        b.insert(Channel::new(9));
        assert_eq!(b, ChannelSet::with_all_above([Channel::new(9)]));
    }

    #[test]
    fn test_erase_from_tail() {
        let mut a = ChannelSet::all();
        a.erase(Channel::new(3));
        assert!(a.contains(Channel::new(2)));
        assert!(!a.contains(Channel::new(3)));
        assert!(a.contains(Channel::new(4)));
        assert!(a.contains(Channel::new(900)));
    }

    #[test]
    fn test_difference_open_minus_finite() {
        let d = &ChannelSet::all() - &set(&[2, 80]);
        assert!(d.contains(Channel::RED));
        assert!(!d.contains(Channel::GREEN));
        assert!(d.contains(Channel::new(79)));
        assert!(!d.contains(Channel::new(80)));
        assert!(d.contains(Channel::new(81)));
    }

    #[test]
    fn test_difference_both_open_is_symmetric_explicit() {
        // {1, 20..} and {2, 30..}: the tails absorb 20 and 30.
        let a = ChannelSet::with_all_above([Channel::RED, Channel::new(20)]);
        let b = ChannelSet::with_all_above([Channel::GREEN, Channel::new(30)]);
        let d = &a - &b;
        assert!(!d.has_all_above());
        assert_eq!(d, set(&[1, 2]));
    }

    #[test]
    fn test_iteration_ascending() {
        let s = set(&[300, 5, 64, 1, 63]);
        let ids: Vec<u32> = s.iter().map(|c| c.index()).collect();
        assert_eq!(ids, vec![1, 5, 63, 64, 300]);
        let tail: Vec<u32> = ChannelSet::with_all_above([Channel::new(1020)])
            .iter()
            .map(|c| c.index())
            .collect();
        assert_eq!(tail, vec![1020, 1021, 1022, 1023]);
    }

    #[test]
    fn test_total_order_usable_as_key() {
        let mut keys = std::collections::BTreeMap::new();
        keys.insert(set(&[1, 2]), "a");
        keys.insert(set(&[1, 2, 100]), "b");
        keys.insert(ChannelSet::all(), "c");
        keys.insert(set(&[2, 1]), "d");
        assert_eq!(keys.len(), 3);
        assert_eq!(keys[&set(&[1, 2])], "d");
    }

    #[test]
    fn test_channel_map_index() {
        let map = ChannelMap::new(&set(&[4, 1, 70]));
        assert_eq!(map.len(), 3);
        assert_eq!(map.index_of(Channel::RED), Some(0));
        assert_eq!(map.index_of(Channel::ALPHA), Some(1));
        assert_eq!(map.index_of(Channel::new(70)), Some(2));
        assert_eq!(map.index_of(Channel::GREEN), None);
        assert_eq!(map.index_of(Channel::new(900)), None);
    }

    #[test]
    fn test_registry_monotone() {
        let reg = ChannelRegistry::new();
        assert_eq!(reg.parse("rgba.alpha").unwrap(), Channel::ALPHA);
        assert_eq!(reg.parse("a").unwrap(), Channel::ALPHA);
        let u = reg.channel_by_name("motion", "u").unwrap();
        let v = reg.channel_by_name("motion", "v").unwrap();
        assert!(v > u && u > Channel::FORWARD_V);
        assert_eq!(reg.channel_by_name("motion", "u").unwrap(), u);
        assert_eq!(reg.index_in_layer(v), Some(1));
        assert_eq!(reg.layer_channels("motion"), vec![u, v]);
        assert_eq!(reg.full_name(u).as_deref(), Some("motion.u"));
        assert!(reg.parse("nolayer").is_err());
    }

    #[test]
    fn test_registry_concurrent_allocation() {
        let reg = std::sync::Arc::new(ChannelRegistry::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let reg = reg.clone();
                std::thread::spawn(move || {
                    (0..16)
                        .map(|i| reg.channel_by_name("aov", &format!("c{}", (i + t) % 16)).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(reg.layer_channels("aov").len(), 16);
    }
}
