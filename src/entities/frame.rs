//! Image data value types shared by nodes, the scheduler and caches.
//!
//! - [`Row`]: one horizontal strip of float samples, one plane per channel
//! - [`Frame`]: assembled rows of one rendered frame (the cached artifact)
//! - [`Region`], [`FrameRange`], [`ChannelSet`]: extents used by validation

use serde::{Deserialize, Serialize};

/// Image channel. Planes are stored in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Channel {
    Red,
    Green,
    Blue,
    Alpha,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Channel::Red, Channel::Green, Channel::Blue, Channel::Alpha];

    pub fn index(self) -> usize {
        self as usize
    }

    fn bit(self) -> u8 {
        1 << self.index()
    }
}

/// Bitmask of channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ChannelSet(u8);

impl ChannelSet {
    pub const NONE: ChannelSet = ChannelSet(0);
    pub const RGB: ChannelSet = ChannelSet(0b0111);
    pub const RGBA: ChannelSet = ChannelSet(0b1111);

    pub fn single(ch: Channel) -> Self {
        ChannelSet(ch.bit())
    }

    pub fn contains(self, ch: Channel) -> bool {
        self.0 & ch.bit() != 0
    }

    pub fn with(self, ch: Channel) -> Self {
        ChannelSet(self.0 | ch.bit())
    }

    pub fn union(self, other: ChannelSet) -> Self {
        ChannelSet(self.0 | other.0)
    }

    pub fn intersection(self, other: ChannelSet) -> Self {
        ChannelSet(self.0 & other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(self) -> impl Iterator<Item = Channel> {
        Channel::ALL.into_iter().filter(move |ch| self.contains(*ch))
    }
}

impl FromIterator<Channel> for ChannelSet {
    fn from_iter<I: IntoIterator<Item = Channel>>(iter: I) -> Self {
        iter.into_iter().fold(ChannelSet::NONE, ChannelSet::with)
    }
}

/// Half-open pixel rectangle `[x, r) x [y, t)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub r: i32,
    pub t: i32,
}

impl Region {
    pub fn new(x: i32, y: i32, r: i32, t: i32) -> Self {
        Self { x, y, r, t }
    }

    /// Region anchored at the origin.
    pub fn with_size(width: i32, height: i32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn width(&self) -> i32 {
        (self.r - self.x).max(0)
    }

    pub fn height(&self) -> i32 {
        (self.t - self.y).max(0)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    pub fn contains_row(&self, y: i32) -> bool {
        y >= self.y && y < self.t
    }

    /// Bounding box of both. An empty side is ignored.
    pub fn union(&self, other: &Region) -> Region {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Region::new(
            self.x.min(other.x),
            self.y.min(other.y),
            self.r.max(other.r),
            self.t.max(other.t),
        )
    }

    /// Overlap of both, empty (zero-sized) when disjoint.
    pub fn intersect(&self, other: &Region) -> Region {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let r = self.r.min(other.r).max(x);
        let t = self.t.min(other.t).max(y);
        Region::new(x, y, r, t)
    }
}

/// Inclusive frame range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameRange {
    pub first: i32,
    pub last: i32,
}

impl FrameRange {
    /// Build a range, swapping bounds given in reverse.
    pub fn new(first: i32, last: i32) -> Self {
        Self {
            first: first.min(last),
            last: first.max(last),
        }
    }

    pub fn single(frame: i32) -> Self {
        Self::new(frame, frame)
    }

    pub fn contains(&self, frame: i32) -> bool {
        frame >= self.first && frame <= self.last
    }

    pub fn len(&self) -> usize {
        (self.last - self.first) as usize + 1
    }

    pub fn clamp(&self, frame: i32) -> i32 {
        frame.clamp(self.first, self.last)
    }

    /// Smallest range covering both (min first, max last).
    pub fn union(&self, other: &FrameRange) -> FrameRange {
        FrameRange::new(self.first.min(other.first), self.last.max(other.last))
    }

    /// Overlap, or `None` when the ranges are disjoint.
    pub fn intersection(&self, other: &FrameRange) -> Option<FrameRange> {
        let first = self.first.max(other.first);
        let last = self.last.min(other.last);
        (first <= last).then_some(FrameRange { first, last })
    }
}

/// One horizontal strip of image data: samples `[x, r)` of scanline `y`.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    y: i32,
    x: i32,
    r: i32,
    channels: ChannelSet,
    planes: [Option<Vec<f32>>; 4],
}

impl Row {
    /// Zero-filled row with one plane per requested channel.
    pub fn new(y: i32, x: i32, r: i32, channels: ChannelSet) -> Self {
        let width = (r - x).max(0) as usize;
        let mut planes: [Option<Vec<f32>>; 4] = Default::default();
        for ch in channels.iter() {
            planes[ch.index()] = Some(vec![0.0; width]);
        }
        Self { y, x, r: x + width as i32, channels, planes }
    }

    pub fn y(&self) -> i32 {
        self.y
    }

    pub fn x(&self) -> i32 {
        self.x
    }

    pub fn r(&self) -> i32 {
        self.r
    }

    pub fn width(&self) -> usize {
        (self.r - self.x) as usize
    }

    pub fn channels(&self) -> ChannelSet {
        self.channels
    }

    pub fn channel(&self, ch: Channel) -> Option<&[f32]> {
        self.planes[ch.index()].as_deref()
    }

    pub fn channel_mut(&mut self, ch: Channel) -> Option<&mut [f32]> {
        self.planes[ch.index()].as_deref_mut()
    }

    /// Fill one plane with a constant. No-op if the channel is absent.
    pub fn fill(&mut self, ch: Channel, value: f32) {
        if let Some(plane) = self.channel_mut(ch) {
            plane.fill(value);
        }
    }

    pub fn erase(&mut self) {
        for plane in self.planes.iter_mut().flatten() {
            plane.fill(0.0);
        }
    }

    /// Copy the overlapping span of common channels from `src`.
    pub fn copy_from(&mut self, src: &Row) {
        let x = self.x.max(src.x);
        let r = self.r.min(src.r);
        if x >= r {
            return;
        }
        let dst_off = (x - self.x) as usize;
        let src_off = (x - src.x) as usize;
        let len = (r - x) as usize;
        for ch in self.channels.intersection(src.channels).iter() {
            if let (Some(dst), Some(s)) = (self.planes[ch.index()].as_mut(), src.channel(ch)) {
                dst[dst_off..dst_off + len].copy_from_slice(&s[src_off..src_off + len]);
            }
        }
    }

    /// Memory footprint of sample data in bytes.
    pub fn mem(&self) -> usize {
        self.channels.len() * self.width() * std::mem::size_of::<f32>()
    }
}

/// Assembled result of one frame evaluation.
///
/// Rows are kept in dispatch order (ascending `y`). A zoomed-out viewer
/// frame holds a subsampled row set, so `rows.len()` may be below
/// `region.height()`.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    number: i32,
    region: Region,
    channels: ChannelSet,
    rows: Vec<Row>,
}

impl Frame {
    pub fn new(number: i32, region: Region, channels: ChannelSet, rows: Vec<Row>) -> Self {
        Self { number, region, channels, rows }
    }

    pub fn number(&self) -> i32 {
        self.number
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn channels(&self) -> ChannelSet {
        self.channels
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn row(&self, y: i32) -> Option<&Row> {
        self.rows
            .binary_search_by_key(&y, |row| row.y())
            .ok()
            .map(|idx| &self.rows[idx])
    }

    pub fn mem(&self) -> usize {
        self.rows.iter().map(Row::mem).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_union_covers_both() {
        let merged = FrameRange::new(10, 50).union(&FrameRange::new(20, 40));
        assert_eq!(merged, FrameRange::new(10, 50));

        let merged = FrameRange::new(1, 3).union(&FrameRange::new(8, 12));
        assert_eq!(merged, FrameRange::new(1, 12));
    }

    #[test]
    fn test_range_intersection() {
        let a = FrameRange::new(1, 10);
        assert_eq!(a.intersection(&FrameRange::new(5, 20)), Some(FrameRange::new(5, 10)));
        assert_eq!(a.intersection(&FrameRange::new(11, 20)), None);
        assert_eq!(FrameRange::new(7, 3), FrameRange::new(3, 7));
        assert_eq!(FrameRange::new(3, 7).len(), 5);
    }

    #[test]
    fn test_region_ops() {
        let a = Region::new(0, 0, 10, 10);
        let b = Region::new(5, 5, 20, 8);
        assert_eq!(a.union(&b), Region::new(0, 0, 20, 10));
        assert_eq!(a.intersect(&b), Region::new(5, 5, 10, 8));
        assert!(a.intersect(&Region::new(20, 20, 30, 30)).is_empty());
        assert_eq!(Region::default().union(&b), b);
        assert!(b.contains_row(5));
        assert!(!b.contains_row(8));
    }

    #[test]
    fn test_channel_set() {
        let set: ChannelSet = [Channel::Red, Channel::Alpha].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert!(set.contains(Channel::Alpha));
        assert!(!set.contains(Channel::Green));
        assert_eq!(set.intersection(ChannelSet::RGB), ChannelSet::single(Channel::Red));
        assert_eq!(ChannelSet::RGB.union(set), ChannelSet::RGBA);
        assert_eq!(ChannelSet::RGB.iter().count(), 3);
    }

    #[test]
    fn test_row_copy_overlap() {
        let mut src = Row::new(3, 0, 8, ChannelSet::RGB);
        src.fill(Channel::Green, 0.5);
        let mut dst = Row::new(3, 4, 12, ChannelSet::RGBA);
        dst.copy_from(&src);

        let green = dst.channel(Channel::Green).unwrap();
        assert_eq!(&green[..4], &[0.5; 4]);
        assert_eq!(&green[4..], &[0.0; 4]);
        assert_eq!(dst.channel(Channel::Alpha).unwrap(), &[0.0; 8]);
        assert_eq!(dst.mem(), 4 * 8 * 4);
    }

    #[test]
    fn test_frame_row_lookup() {
        let rows = vec![
            Row::new(0, 0, 2, ChannelSet::RGB),
            Row::new(2, 0, 2, ChannelSet::RGB),
            Row::new(4, 0, 2, ChannelSet::RGB),
        ];
        let frame = Frame::new(1, Region::with_size(2, 5), ChannelSet::RGB, rows);
        assert!(frame.row(2).is_some());
        assert!(frame.row(3).is_none());
        assert_eq!(frame.mem(), 3 * 3 * 2 * 4);
    }
}
