//! Process-wide name tables shared by every graph.
//!
//! Channel and format registries are append-only and thread-safe. A
//! [`World`] bundles them so one handle can be passed to graphs, readers
//! and the operator library instead of relying on hidden globals.

use std::sync::{Arc, OnceLock};

use crate::{ChannelRegistry, FormatRegistry};

/// Shared channel and format registries.
#[derive(Debug, Default)]
pub struct World {
    /// Channel name allocator.
    pub channels: ChannelRegistry,
    /// Named formats.
    pub formats: FormatRegistry,
}

impl World {
    /// Fresh world holding only the built-in channels and formats.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The lazily created process-wide world.
    ///
    /// Graphs built without an explicit world use this one.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<World>> = OnceLock::new();
        GLOBAL.get_or_init(World::new).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Channel;

    #[test]
    fn test_global_is_shared() {
        let a = World::global();
        let b = World::global();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_worlds_are_independent() {
        let a = World::new();
        let b = World::new();
        let ch = a.channels.channel_by_name("only_in_a", "x").unwrap();
        assert!(a.channels.is_registered(ch));
        assert!(b.channels.find("only_in_a.x").is_none());
        assert!(b.channels.is_registered(Channel::ALPHA));
    }
}
