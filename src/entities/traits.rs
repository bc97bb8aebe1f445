//! Abstract traits for dependency inversion.
//!
//! The engine talks to its result cache and its output through these
//! interfaces. The default cache lives in `core/frame_cache.rs`; outputs
//! are supplied by the embedding application.

use std::sync::Arc;

use super::frame::{ChannelSet, Frame, Region};

/// View parameters that change what a viewer frame looks like.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewKey {
    /// Zoom factor bits (`f32::to_bits`), so the key stays `Eq + Hash`.
    pub zoom_bits: u32,
    pub region: Region,
    pub channels: ChannelSet,
}

/// Deterministic identity of a rendered frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameKey {
    /// Hash of the resolved DAG and its node parameters.
    pub tree_version: u64,
    pub frame: i32,
    pub view: ViewKey,
}

/// Result of [`ResultCache::claim`].
#[derive(Debug, Clone)]
pub enum Claim {
    /// Cached artifact.
    Hit(Arc<Frame>),
    /// Caller now owns the in-flight marker and must `insert` or `release`.
    Claimed,
    /// Another caller holds the in-flight marker.
    Busy,
}

/// Simple cache statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub memory: usize,
}

impl CacheStatsSnapshot {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 { 0.0 } else { self.hits as f64 / total as f64 }
    }
}

/// Memory-bounded key/value store of rendered frames.
pub trait ResultCache: Send + Sync {
    /// Cached frame, if any. Counts as a hit or miss.
    fn lookup(&self, key: &FrameKey) -> Option<Arc<Frame>>;

    /// Lookup that also takes the in-flight marker on a miss.
    fn claim(&self, key: &FrameKey) -> Claim;

    /// Block until the in-flight marker on `key` is gone. Returns false if
    /// `stop` turned true first.
    fn wait(&self, key: &FrameKey, stop: &dyn Fn() -> bool) -> bool;

    /// Store a frame and drop the in-flight marker.
    fn insert(&self, key: FrameKey, frame: Arc<Frame>);

    /// Drop the in-flight marker without storing anything.
    fn release(&self, key: &FrameKey);

    fn set_max_memory(&self, bytes: usize);

    fn clear(&self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn stats_snapshot(&self) -> CacheStatsSnapshot;
}

/// Blanket impl: Arc<T> implements the trait if T does
impl<T: ResultCache + ?Sized> ResultCache for Arc<T> {
    fn lookup(&self, key: &FrameKey) -> Option<Arc<Frame>> {
        (**self).lookup(key)
    }

    fn claim(&self, key: &FrameKey) -> Claim {
        (**self).claim(key)
    }

    fn wait(&self, key: &FrameKey, stop: &dyn Fn() -> bool) -> bool {
        (**self).wait(key, stop)
    }

    fn insert(&self, key: FrameKey, frame: Arc<Frame>) {
        (**self).insert(key, frame)
    }

    fn release(&self, key: &FrameKey) {
        (**self).release(key)
    }

    fn set_max_memory(&self, bytes: usize) {
        (**self).set_max_memory(bytes)
    }

    fn clear(&self) {
        (**self).clear()
    }

    fn len(&self) -> usize {
        (**self).len()
    }

    fn stats_snapshot(&self) -> CacheStatsSnapshot {
        (**self).stats_snapshot()
    }
}

/// Where finished frames go.
///
/// Called from the engine's control thread, exactly once per computed or
/// cached frame. Never called for aborted frames.
pub trait OutputSink: Send {
    /// Viewer output.
    fn present(&mut self, frame: Arc<Frame>);

    /// Writer output. Defaults to `present`.
    fn write_to_disk(&mut self, frame: Arc<Frame>, number: i32) -> anyhow::Result<()> {
        let _ = number;
        self.present(frame);
        Ok(())
    }

    /// A frame failed to compute.
    fn present_error(&mut self, number: i32, message: &str);
}
