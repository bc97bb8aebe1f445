//! Playhead: current frame, direction and loop mode, and the arithmetic
//! for moving through a frame range.
//!
//! # Boundaries
//!
//! Advancing past either end wraps to the other end in loop mode and
//! reports "stop" otherwise. Stepping by N wraps modulo the range length
//! in loop mode and clamps otherwise.

use log::trace;

use crate::entities::frame::FrameRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Playhead {
    frame: i32,
    forward: bool,
    loop_enabled: bool,
}

impl Default for Playhead {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Playhead {
    pub fn new(frame: i32) -> Self {
        Self { frame, forward: true, loop_enabled: true }
    }

    pub fn frame(&self) -> i32 {
        self.frame
    }

    pub fn forward(&self) -> bool {
        self.forward
    }

    pub fn set_forward(&mut self, forward: bool) {
        self.forward = forward;
    }

    pub fn loop_enabled(&self) -> bool {
        self.loop_enabled
    }

    pub fn set_loop(&mut self, enabled: bool) {
        self.loop_enabled = enabled;
    }

    /// Set current frame clamped into `range`.
    pub fn set_frame(&mut self, frame: i32, range: FrameRange) {
        self.frame = range.clamp(frame);
    }

    pub fn to_start(&mut self, range: FrameRange) {
        trace!("Rewinding to frame {}", range.first);
        self.frame = range.first;
    }

    pub fn to_end(&mut self, range: FrameRange) {
        trace!("Skipping to end: frame {}", range.last);
        self.frame = range.last;
    }

    /// Move one frame in the play direction.
    ///
    /// Returns the new frame, or `None` when the range end is reached with
    /// looping off (the playhead stays on the last valid frame).
    pub fn advance(&mut self, range: FrameRange) -> Option<i32> {
        let current = range.clamp(self.frame);
        let next = if self.forward {
            if current >= range.last {
                if !self.loop_enabled {
                    trace!("Reached play range end, stopping");
                    return None;
                }
                trace!("Frame loop: {} -> {}", current, range.first);
                range.first
            } else {
                current + 1
            }
        } else if current <= range.first {
            if !self.loop_enabled {
                trace!("Reached play range start, stopping");
                return None;
            }
            trace!("Frame loop: {} -> {}", current, range.last);
            range.last
        } else {
            current - 1
        };
        self.frame = next;
        Some(next)
    }

    /// Frame `count` away from the current one (negative = backward).
    /// Wraps in loop mode, clamps otherwise. Does not move the playhead.
    pub fn step_target(&self, count: i32, range: FrameRange) -> i32 {
        let target = self.frame.saturating_add(count);
        let range_size = range.last - range.first + 1;

        if target > range.last {
            if self.loop_enabled {
                let overflow = target - range.last;
                range.first + ((overflow - 1) % range_size)
            } else {
                range.last
            }
        } else if target < range.first {
            if self.loop_enabled {
                let underflow = range.first - target;
                range.last - ((underflow - 1) % range_size)
            } else {
                range.first
            }
        } else {
            target
        }
    }
}
