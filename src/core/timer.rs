//! Playback pacing and measured frame rate.

use log::trace;
use std::thread;
use std::time::{Duration, Instant};

const WAIT_SLICE: Duration = Duration::from_millis(5);

/// Paces frames to a desired rate and measures the achieved one.
#[derive(Debug)]
pub struct PlaybackTimer {
    desired_fps: f64,
    last_frame: Option<Instant>,
    window_start: Option<Instant>,
    window_frames: u32,
    actual_fps: f64,
}

impl PlaybackTimer {
    /// `fps <= 0` disables pacing.
    pub fn new(fps: f64) -> Self {
        Self {
            desired_fps: fps,
            last_frame: None,
            window_start: None,
            window_frames: 0,
            actual_fps: 0.0,
        }
    }

    pub fn desired_fps(&self) -> f64 {
        self.desired_fps
    }

    pub fn set_desired_fps(&mut self, fps: f64) {
        self.desired_fps = fps;
    }

    /// Last measured rate (0 until the first report).
    pub fn actual_fps(&self) -> f64 {
        self.actual_fps
    }

    /// Forget timing history, e.g. when a new run starts.
    pub fn reset(&mut self) {
        self.last_frame = None;
        self.window_start = None;
        self.window_frames = 0;
    }

    fn frame_duration(&self) -> Option<Duration> {
        (self.desired_fps > 0.0).then(|| Duration::from_secs_f64(1.0 / self.desired_fps))
    }

    /// Sleep until one frame period has passed since the previous call.
    ///
    /// Sleeps in short slices and gives up as soon as `stop` returns true;
    /// a stopped wait returns false and does not count as a frame.
    pub fn wait_until_next_frame_due(&mut self, stop: impl Fn() -> bool) -> bool {
        let due = match (self.frame_duration(), self.last_frame) {
            (Some(period), Some(last)) => Some(last + period),
            _ => None,
        };
        loop {
            if stop() {
                return false;
            }
            let now = Instant::now();
            match due {
                Some(due) if due > now => thread::sleep((due - now).min(WAIT_SLICE)),
                _ => break,
            }
        }
        self.last_frame = Some(Instant::now());
        true
    }

    /// Count one delivered frame. Every `interval` frames, returns the rate
    /// measured over that window.
    pub fn frame_done(&mut self, interval: u32) -> Option<f64> {
        let now = Instant::now();
        let start = *self.window_start.get_or_insert(now);
        self.window_frames += 1;
        if interval == 0 || self.window_frames < interval {
            return None;
        }

        let elapsed = now.duration_since(start).as_secs_f64();
        // Window spans frames-1 intervals
        let fps = if elapsed > 0.0 {
            (self.window_frames - 1).max(1) as f64 / elapsed
        } else {
            0.0
        };
        self.actual_fps = fps;
        self.window_start = Some(now);
        self.window_frames = 1;
        trace!("Measured {:.2} fps (desired {:.2})", fps, self.desired_fps);
        Some(fps)
    }
}
