//! Decode deduplication buffer for source nodes.
//!
//! Workers rendering different rows of the same frame all end up asking the
//! reader for data. The buffer keeps one descriptor per source identity
//! (file name + frame) recording what is decoded and what some worker is
//! currently decoding, so each row (or each full image) is decoded once.
//!
//! Protocol:
//! 1. `request_decode` → decide who decodes what
//! 2. the worker told to decode does so, then `commit_*` (or `abandon`)
//! 3. workers told "in progress" block in `wait_for` and retry
//!
//! Capacity is bounded; eviction only removes descriptors with no pending
//! work. When every descriptor is busy the buffer grows past capacity.

use indexmap::IndexMap;
use log::{debug, trace, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Granularity a source can decode at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeKind {
    /// One opaque decode of the whole image.
    FullFrame,
    /// Individual scanlines.
    Scanline,
}

/// What the caller of [`DecodeBuffer::request_decode`] has to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeDecision {
    /// First request for a full-frame identity: decode everything.
    MustDecodeFull,
    /// First request for a scanline identity: decode these rows.
    MustDecode(BTreeSet<i32>),
    /// Known identity: decode only these rows, the rest is done or claimed.
    MustDecodePartial(BTreeSet<i32>),
    /// Everything requested is decoded.
    AlreadySatisfied,
    /// Everything missing is being decoded by someone else.
    InProgress,
}

enum Descriptor<T> {
    Full {
        complete: bool,
        in_flight: bool,
        rows: BTreeMap<i32, Arc<T>>,
    },
    Scanline {
        decoded: BTreeMap<i32, Arc<T>>,
        pending: BTreeSet<i32>,
    },
}

impl<T> Descriptor<T> {
    fn has_pending(&self) -> bool {
        match self {
            Descriptor::Full { in_flight, .. } => *in_flight,
            Descriptor::Scanline { pending, .. } => !pending.is_empty(),
        }
    }

    fn decoded(&self) -> &BTreeMap<i32, Arc<T>> {
        match self {
            Descriptor::Full { rows, .. } => rows,
            Descriptor::Scanline { decoded, .. } => decoded,
        }
    }
}

/// Cap on a single condvar wait so callers can re-check abort.
const WAIT_SLICE: Duration = Duration::from_millis(20);

/// Bounded per-source decode registry.
pub struct DecodeBuffer<T> {
    descriptors: Mutex<IndexMap<String, Descriptor<T>>>,
    changed: Condvar,
    capacity: usize,
}

impl<T> DecodeBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            descriptors: Mutex::new(IndexMap::new()),
            changed: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, IndexMap<String, Descriptor<T>>> {
        self.descriptors.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Decide whether the caller must decode `rows` of `identity`.
    ///
    /// `kind` only matters when the descriptor is created. Rows that are
    /// decoded or pending elsewhere are never handed out twice.
    pub fn request_decode(
        &self,
        identity: &str,
        kind: DecodeKind,
        rows: &BTreeSet<i32>,
    ) -> DecodeDecision {
        let mut map = self.lock();

        let Some(desc) = map.get_mut(identity) else {
            self.make_room(&mut map);
            let (desc, decision) = match kind {
                DecodeKind::FullFrame => (
                    Descriptor::Full { complete: false, in_flight: true, rows: BTreeMap::new() },
                    DecodeDecision::MustDecodeFull,
                ),
                DecodeKind::Scanline => (
                    Descriptor::Scanline { decoded: BTreeMap::new(), pending: rows.clone() },
                    DecodeDecision::MustDecode(rows.clone()),
                ),
            };
            trace!("DecodeBuffer: new descriptor {}", identity);
            map.insert(identity.to_string(), desc);
            return decision;
        };

        match desc {
            Descriptor::Full { complete: true, .. } => DecodeDecision::AlreadySatisfied,
            Descriptor::Full { in_flight: true, .. } => DecodeDecision::InProgress,
            Descriptor::Full { in_flight, .. } => {
                // Previous decoder gave up; take over
                *in_flight = true;
                DecodeDecision::MustDecodeFull
            }
            Descriptor::Scanline { decoded, pending } => {
                let missing = rows
                    .iter()
                    .filter(|y| !decoded.contains_key(y))
                    .copied()
                    .collect::<BTreeSet<_>>();
                if missing.is_empty() {
                    return DecodeDecision::AlreadySatisfied;
                }
                let claim = missing.difference(pending).copied().collect::<BTreeSet<_>>();
                if claim.is_empty() {
                    return DecodeDecision::InProgress;
                }
                pending.extend(claim.iter().copied());
                DecodeDecision::MustDecodePartial(claim)
            }
        }
    }

    /// Evict descriptors until there is space for one more.
    fn make_room(&self, map: &mut IndexMap<String, Descriptor<T>>) {
        while map.len() >= self.capacity {
            match map.values().position(|d| !d.has_pending()) {
                Some(idx) => {
                    if let Some((id, _)) = map.shift_remove_index(idx) {
                        trace!("DecodeBuffer: evicted {}", id);
                    }
                }
                None => {
                    warn!(
                        "DecodeBuffer: all {} descriptors busy, exceeding capacity {}",
                        map.len(),
                        self.capacity
                    );
                    break;
                }
            }
        }
    }

    /// Store decoded scanlines, moving them from pending to decoded.
    pub fn commit_rows(&self, identity: &str, rows: impl IntoIterator<Item = (i32, T)>) {
        let mut map = self.lock();
        match map.get_mut(identity) {
            Some(Descriptor::Scanline { decoded, pending }) => {
                for (y, row) in rows {
                    pending.remove(&y);
                    decoded.insert(y, Arc::new(row));
                }
            }
            Some(Descriptor::Full { .. }) => {
                warn!("DecodeBuffer: row commit on full-frame descriptor {}", identity);
            }
            None => debug!("DecodeBuffer: commit for unknown descriptor {}", identity),
        }
        self.changed.notify_all();
    }

    /// Store a complete full-frame decode.
    pub fn commit_full(&self, identity: &str, rows: impl IntoIterator<Item = (i32, T)>) {
        let mut map = self.lock();
        match map.get_mut(identity) {
            Some(Descriptor::Full { complete, in_flight, rows: stored }) => {
                stored.extend(rows.into_iter().map(|(y, row)| (y, Arc::new(row))));
                *complete = true;
                *in_flight = false;
            }
            Some(Descriptor::Scanline { .. }) => {
                warn!("DecodeBuffer: full commit on scanline descriptor {}", identity);
            }
            None => debug!("DecodeBuffer: commit for unknown descriptor {}", identity),
        }
        self.changed.notify_all();
    }

    /// Drop claims after a failed decode so someone else may retry.
    pub fn abandon(&self, identity: &str, rows: &BTreeSet<i32>) {
        let mut map = self.lock();
        match map.get_mut(identity) {
            Some(Descriptor::Scanline { pending, .. }) => {
                pending.retain(|y| !rows.contains(y));
            }
            Some(Descriptor::Full { in_flight, .. }) => *in_flight = false,
            None => {}
        }
        self.changed.notify_all();
    }

    /// Block until `rows` of `identity` are decoded.
    ///
    /// Returns `false` if some row is neither decoded nor claimed anymore
    /// (its decoder gave up), or `stop` returned true; the caller should
    /// request again.
    pub fn wait_for(&self, identity: &str, rows: &BTreeSet<i32>, stop: impl Fn() -> bool) -> bool {
        let mut map = self.lock();
        loop {
            match map.get(identity) {
                Some(Descriptor::Full { complete: true, .. }) => return true,
                Some(Descriptor::Full { in_flight: false, .. }) => return false,
                Some(Descriptor::Scanline { decoded, pending }) => {
                    let mut all = true;
                    for y in rows {
                        if decoded.contains_key(y) {
                            continue;
                        }
                        if !pending.contains(y) {
                            return false;
                        }
                        all = false;
                    }
                    if all {
                        return true;
                    }
                }
                Some(Descriptor::Full { .. }) => {}
                None => return false,
            }
            if stop() {
                return false;
            }
            map = match self.changed.wait_timeout(map, WAIT_SLICE) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
    }

    pub fn row(&self, identity: &str, y: i32) -> Option<Arc<T>> {
        self.lock().get(identity)?.decoded().get(&y).cloned()
    }

    pub fn decoded_rows(&self, identity: &str) -> BTreeSet<i32> {
        self.lock()
            .get(identity)
            .map(|d| d.decoded().keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn pending_rows(&self, identity: &str) -> BTreeSet<i32> {
        match self.lock().get(identity) {
            Some(Descriptor::Scanline { pending, .. }) => pending.clone(),
            _ => BTreeSet::new(),
        }
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.lock().contains_key(identity)
    }

    pub fn remove(&self, identity: &str) -> bool {
        let removed = self.lock().shift_remove(identity).is_some();
        self.changed.notify_all();
        removed
    }

    pub fn clear(&self) {
        let mut map = self.lock();
        debug!("DecodeBuffer: clear {} descriptors", map.len());
        map.clear();
        self.changed.notify_all();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
