//! Rendered-frame cache with LRU eviction and in-flight markers.
//!
//! Key: [`FrameKey`] (tree version, frame, view) -> `Arc<Frame>`.
//! Integrated with [`CacheManager`] for memory tracking: after every insert
//! the least recently used frames are dropped until usage is under budget.
//!
//! A miss through `claim` leaves an in-flight marker so two renderers never
//! compute the same key at once; the second one gets `Claim::Busy` and
//! waits for `insert`/`release`.

use log::{debug, trace};
use lru::LruCache;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use super::cache_man::CacheManager;
use crate::entities::frame::Frame;
use crate::entities::traits::{CacheStatsSnapshot, Claim, FrameKey, ResultCache};

/// Cache statistics (lock-free counters)
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

struct Inner {
    frames: LruCache<FrameKey, Arc<Frame>>,
    in_flight: HashSet<FrameKey>,
}

/// Default [`ResultCache`].
pub struct FrameCache {
    inner: Mutex<Inner>,
    released: Condvar,
    manager: Arc<CacheManager>,
    stats: CacheStats,
}

/// Upper bound on one `wait` slice.
const WAIT_SLICE: Duration = Duration::from_millis(50);

impl FrameCache {
    /// `capacity` caps the number of frames (0 = memory budget only).
    pub fn new(capacity: usize, manager: Arc<CacheManager>) -> Self {
        let frames = match NonZeroUsize::new(capacity) {
            Some(cap) => LruCache::new(cap),
            None => LruCache::unbounded(),
        };
        debug!("FrameCache created: capacity={}, limit={} MB", capacity, manager.mem().1 / 1024 / 1024);
        Self {
            inner: Mutex::new(Inner { frames, in_flight: HashSet::new() }),
            released: Condvar::new(),
            manager,
            stats: CacheStats::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Check without touching LRU order or statistics.
    pub fn contains(&self, key: &FrameKey) -> bool {
        self.lock().frames.peek(key).is_some()
    }

    pub fn is_in_flight(&self, key: &FrameKey) -> bool {
        self.lock().in_flight.contains(key)
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn manager(&self) -> &Arc<CacheManager> {
        &self.manager
    }

    /// Drop every frame rendered for `frame` regardless of version or view.
    pub fn clear_frame(&self, frame: i32) {
        let mut inner = self.lock();
        let keys = inner
            .frames
            .iter()
            .filter(|(k, _)| k.frame == frame)
            .map(|(k, _)| *k)
            .collect::<Vec<_>>();
        for key in keys {
            if let Some(evicted) = inner.frames.pop(&key) {
                self.manager.free_memory(evicted.mem());
            }
        }
    }

    fn evict_over_budget(&self, inner: &mut Inner) {
        while self.manager.check_memory_limit() && inner.frames.len() > 1 {
            let Some((key, evicted)) = inner.frames.pop_lru() else { break };
            self.manager.free_memory(evicted.mem());
            trace!(
                "LRU evicted frame {}: freed {} KB (usage: {} KB)",
                key.frame,
                evicted.mem() / 1024,
                self.manager.mem().0 / 1024
            );
        }
    }
}

impl ResultCache for FrameCache {
    fn lookup(&self, key: &FrameKey) -> Option<Arc<Frame>> {
        let found = self.lock().frames.get(key).cloned();
        match found {
            Some(_) => self.stats.record_hit(),
            None => self.stats.record_miss(),
        }
        found
    }

    fn claim(&self, key: &FrameKey) -> Claim {
        let mut inner = self.lock();
        if let Some(frame) = inner.frames.get(key).cloned() {
            self.stats.record_hit();
            return Claim::Hit(frame);
        }
        if inner.in_flight.contains(key) {
            return Claim::Busy;
        }
        self.stats.record_miss();
        inner.in_flight.insert(*key);
        Claim::Claimed
    }

    fn wait(&self, key: &FrameKey, stop: &dyn Fn() -> bool) -> bool {
        let mut inner = self.lock();
        while inner.in_flight.contains(key) {
            if stop() {
                return false;
            }
            inner = match self.released.wait_timeout(inner, WAIT_SLICE) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
        true
    }

    fn insert(&self, key: FrameKey, frame: Arc<Frame>) {
        let size = frame.mem();
        {
            let mut inner = self.lock();
            inner.in_flight.remove(&key);
            // Replaced value or capacity-evicted LRU entry
            if let Some((_, old)) = inner.frames.push(key, frame) {
                self.manager.free_memory(old.mem());
            }
            self.manager.add_memory(size);
            self.evict_over_budget(&mut inner);
        }
        self.released.notify_all();
        trace!("Cached frame {} ({} bytes)", key.frame, size);
    }

    fn release(&self, key: &FrameKey) {
        self.lock().in_flight.remove(key);
        self.released.notify_all();
    }

    fn set_max_memory(&self, bytes: usize) {
        self.manager.set_limit_bytes(bytes);
        let mut inner = self.lock();
        self.evict_over_budget(&mut inner);
    }

    fn clear(&self) {
        let mut inner = self.lock();
        inner.frames.clear();
        self.manager.reset_usage();
        debug!("Cleared entire frame cache");
    }

    fn len(&self) -> usize {
        self.lock().frames.len()
    }

    fn stats_snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits(),
            misses: self.stats.misses(),
            size: self.len(),
            memory: self.manager.mem().0,
        }
    }
}
