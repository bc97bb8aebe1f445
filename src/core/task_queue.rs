//! Deferred playback requests accepted while a frame is in flight.
//!
//! Requests arriving while the engine renders are queued and drained one
//! per frame boundary. A newer start request supersedes any older pending
//! one: scrubbing from frame 5 to 9 renders 9 only.

use log::debug;
use std::collections::VecDeque;

/// How many frames a run should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCount {
    Finite(u32),
    /// Until paused, aborted or out of range with looping off.
    Indefinite,
}

impl FrameCount {
    /// Count after one more frame is done.
    pub fn decremented(self) -> FrameCount {
        match self {
            FrameCount::Finite(n) => FrameCount::Finite(n.saturating_sub(1)),
            FrameCount::Indefinite => FrameCount::Indefinite,
        }
    }

    pub fn is_exhausted(self) -> bool {
        self == FrameCount::Finite(0)
    }
}

/// Immutable record of one deferred request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Task {
    /// Target frame; `None` continues from the current frame.
    pub frame: Option<i32>,
    pub frame_count: FrameCount,
    /// Reset the view (zoom/region) before rendering.
    pub fit_to_view: bool,
    pub forward: bool,
    /// Re-render the current frame without advancing.
    pub same_frame: bool,
    pub kind: TaskKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Start (or restart) a run: play, seek, step, repeat.
    Start,
    /// Change the remaining frame count of the current run.
    ChangeFrameCount,
}

impl Task {
    pub fn play(frame_count: FrameCount, forward: bool) -> Self {
        Self {
            frame: None,
            frame_count,
            fit_to_view: false,
            forward,
            same_frame: false,
            kind: TaskKind::Start,
        }
    }

    /// Render exactly `frame` once.
    pub fn seek(frame: i32) -> Self {
        Self {
            frame: Some(frame),
            frame_count: FrameCount::Finite(1),
            fit_to_view: false,
            forward: true,
            same_frame: true,
            kind: TaskKind::Start,
        }
    }

    /// Re-render the current frame once.
    pub fn repeat() -> Self {
        Self { frame: None, ..Self::seek(0) }
    }

    pub fn change_frame_count(frame_count: FrameCount) -> Self {
        Self { kind: TaskKind::ChangeFrameCount, ..Self::play(frame_count, true) }
    }

    pub fn fit(mut self, fit_to_view: bool) -> Self {
        self.fit_to_view = fit_to_view;
        self
    }

    /// Would running `self` make `older` pointless?
    fn supersedes(&self, older: &Task) -> bool {
        match self.kind {
            TaskKind::Start => true,
            TaskKind::ChangeFrameCount => older.kind == TaskKind::ChangeFrameCount,
        }
    }
}

/// FIFO of pending tasks with the replace-pending rule.
#[derive(Debug, Default)]
pub struct TaskQueue {
    pending: VecDeque<Task>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue, dropping older tasks the new one supersedes.
    pub fn push(&mut self, task: Task) {
        let before = self.pending.len();
        self.pending.retain(|older| !task.supersedes(older));
        let dropped = before - self.pending.len();
        if dropped > 0 {
            debug!("TaskQueue: {:?} superseded {} pending task(s)", task.kind, dropped);
        }
        self.pending.push_back(task);
    }

    /// Next task to run; exactly one per frame boundary.
    pub fn take(&mut self) -> Option<Task> {
        self.pending.pop_front()
    }

    /// Discard everything (abort).
    pub fn clear(&mut self) {
        if !self.pending.is_empty() {
            debug!("TaskQueue: discarding {} task(s)", self.pending.len());
        }
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_later_seek_supersedes() {
        let mut queue = TaskQueue::new();
        queue.push(Task::seek(5));
        queue.push(Task::seek(9));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.take().and_then(|t| t.frame), Some(9));
        assert!(queue.take().is_none());
    }

    #[test]
    fn test_frame_count_change_keeps_start() {
        let mut queue = TaskQueue::new();
        queue.push(Task::seek(3));
        queue.push(Task::change_frame_count(FrameCount::Finite(4)));
        queue.push(Task::change_frame_count(FrameCount::Finite(2)));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.take().map(|t| t.kind), Some(TaskKind::Start));
        let change = queue.take().unwrap();
        assert_eq!(change.kind, TaskKind::ChangeFrameCount);
        assert_eq!(change.frame_count, FrameCount::Finite(2));
    }

    #[test]
    fn test_start_supersedes_everything() {
        let mut queue = TaskQueue::new();
        queue.push(Task::change_frame_count(FrameCount::Indefinite));
        queue.push(Task::play(FrameCount::Indefinite, false));
        assert_eq!(queue.len(), 1);
        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_frame_count() {
        assert_eq!(FrameCount::Finite(2).decremented(), FrameCount::Finite(1));
        assert!(FrameCount::Finite(1).decremented().is_exhausted());
        assert!(FrameCount::Finite(0).decremented().is_exhausted());
        assert!(!FrameCount::Indefinite.decremented().is_exhausted());
    }

    #[test]
    fn test_repeat_task() {
        let task = Task::repeat();
        assert_eq!(task.frame, None);
        assert!(task.same_frame);
        assert_eq!(task.frame_count, FrameCount::Finite(1));
    }
}
