//! Engine - render scheduler driving playback over a [`Dag`].
//!
//! One control thread owns the engine. Control requests arrive as
//! [`Command`]s on a single channel through an [`EngineHandle`]. While idle
//! or paused the thread blocks on that channel and executes requests
//! immediately; while running it renders frame after frame and only looks
//! at the channel between frames, turning playback requests into queued
//! [`Task`]s.
//!
//! # Per-frame protocol
//!
//! 1. Rebuild the DAG if the graph changed, prepare sources, full validation
//! 2. Key = (tree version, frame, view). Claim it in the result cache
//! 3. Hit: hand the cached frame to the output, skip computation
//! 4. Miss: evaluate all rows on the worker pool
//! 5. Insert into the cache and hand to the output (neither when aborted)
//! 6. Bookkeeping, then: abort > pause > one queued task > next frame
//!
//! # States
//!
//! ```text
//! Idle --play/seek/step--> Running --frames done--> Idle
//! Running --pause--> Paused --play--> Running
//! Running|Paused --abort--> Aborting --> Idle
//! ```

use crossbeam::sync::ShardedLock;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, trace, warn};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use thiserror::Error;

use super::dag::{Dag, DagError};
use super::player::Playhead;
use super::render::{FrameJob, FrameOutcome, RowDispatcher};
use super::task_queue::{FrameCount, Task, TaskKind, TaskQueue};
use super::timer::PlaybackTimer;
use crate::config::EngineConfig;
use crate::entities::error::{DecodeError, RowError, ValidationError};
use crate::entities::frame::{ChannelSet, Frame, FrameRange, Region};
use crate::entities::graph::NodeGraph;
use crate::entities::node::{NodeId, RequestHints};
use crate::entities::output::OutputKind;
use crate::entities::traits::{Claim, FrameKey, OutputSink, ResultCache, ViewKey};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("topology error: {0}")]
    Topology(#[from] DagError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("source error: {0}")]
    Decode(#[from] DecodeError),

    #[error("{0}")]
    Row(#[from] RowError),

    #[error("cannot start worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("engine is not running")]
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    Idle = 0,
    Running = 1,
    Paused = 2,
    Aborting = 3,
}

impl EngineState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => EngineState::Running,
            2 => EngineState::Paused,
            3 => EngineState::Aborting,
            _ => EngineState::Idle,
        }
    }
}

/// Viewer parameters that affect rendered pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewParams {
    /// Below 1.0 the viewer renders every `round(1/zoom)`-th row.
    pub zoom: f32,
    /// Visible part of the image; `None` shows the whole data window.
    pub region: Option<Region>,
    pub channels: ChannelSet,
}

impl Default for ViewParams {
    fn default() -> Self {
        Self { zoom: 1.0, region: None, channels: ChannelSet::RGBA }
    }
}

impl ViewParams {
    fn row_stride(&self) -> i32 {
        if self.zoom >= 1.0 || self.zoom <= 0.0 {
            1
        } else {
            ((1.0 / self.zoom).round() as i32).max(1)
        }
    }
}

/// Control requests.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Play { frame_count: FrameCount, forward: bool, fit_to_view: bool },
    Pause,
    Abort,
    Seek(i32),
    /// Step by N frames (negative = backward).
    Step(i32),
    FirstFrame,
    LastFrame,
    RepeatSameFrame,
    SetFrameCount(FrameCount),
    SetLoopMode(bool),
    SetFps(f64),
    SetView(ViewParams),
    SetOutput { sink: Option<NodeId>, kind: OutputKind },
    /// Topology or parameters changed; rebuild before the next frame.
    GraphChanged,
    Shutdown,
}

/// Notifications for the control surface.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    StateChanged(EngineState),
    FrameRendered { frame: i32, cached: bool },
    FrameFailed { frame: i32, message: String },
    FpsChanged(f64),
    /// Topology or validation problem; the engine stays idle.
    Error(String),
}

/// State readable without talking to the control thread.
#[derive(Debug)]
struct Shared {
    abort: AtomicBool,
    working: AtomicBool,
    state: AtomicU8,
    current_frame: AtomicI32,
    has_range: AtomicBool,
    first: AtomicI32,
    last: AtomicI32,
}

impl Shared {
    fn set_range(&self, range: Option<FrameRange>) {
        match range {
            Some(r) => {
                self.first.store(r.first, Ordering::Relaxed);
                self.last.store(r.last, Ordering::Relaxed);
                self.has_range.store(true, Ordering::Relaxed);
            }
            None => self.has_range.store(false, Ordering::Relaxed),
        }
    }
}

/// Cloneable remote control for an [`Engine`].
#[derive(Clone)]
pub struct EngineHandle {
    tx: Sender<Command>,
    shared: Arc<Shared>,
}

impl EngineHandle {
    pub fn send(&self, cmd: Command) -> Result<(), EngineError> {
        trace!("EngineHandle: {:?}", cmd);
        self.tx.send(cmd).map_err(|_| EngineError::Disconnected)
    }

    pub fn play(&self, frame_count: FrameCount, forward: bool) -> Result<(), EngineError> {
        self.send(Command::Play { frame_count, forward, fit_to_view: false })
    }

    pub fn pause(&self) -> Result<(), EngineError> {
        self.send(Command::Pause)
    }

    /// Stop as soon as possible. In-flight rows see the flag immediately.
    pub fn abort(&self) -> Result<(), EngineError> {
        self.shared.abort.store(true, Ordering::SeqCst);
        self.send(Command::Abort)
    }

    pub fn seek(&self, frame: i32) -> Result<(), EngineError> {
        self.send(Command::Seek(frame))
    }

    pub fn step(&self, count: i32) -> Result<(), EngineError> {
        self.send(Command::Step(count))
    }

    pub fn next_frame(&self) -> Result<(), EngineError> {
        self.step(1)
    }

    pub fn previous_frame(&self) -> Result<(), EngineError> {
        self.step(-1)
    }

    pub fn first_frame(&self) -> Result<(), EngineError> {
        self.send(Command::FirstFrame)
    }

    pub fn last_frame(&self) -> Result<(), EngineError> {
        self.send(Command::LastFrame)
    }

    pub fn repeat_same_frame(&self) -> Result<(), EngineError> {
        self.send(Command::RepeatSameFrame)
    }

    pub fn set_frame_count(&self, frame_count: FrameCount) -> Result<(), EngineError> {
        self.send(Command::SetFrameCount(frame_count))
    }

    pub fn set_loop_mode(&self, enabled: bool) -> Result<(), EngineError> {
        self.send(Command::SetLoopMode(enabled))
    }

    pub fn set_fps(&self, fps: f64) -> Result<(), EngineError> {
        self.send(Command::SetFps(fps))
    }

    pub fn set_view(&self, view: ViewParams) -> Result<(), EngineError> {
        self.send(Command::SetView(view))
    }

    pub fn set_output(&self, sink: Option<NodeId>, kind: OutputKind) -> Result<(), EngineError> {
        self.send(Command::SetOutput { sink, kind })
    }

    pub fn graph_changed(&self) -> Result<(), EngineError> {
        self.send(Command::GraphChanged)
    }

    pub fn shutdown(&self) -> Result<(), EngineError> {
        self.shared.abort.store(true, Ordering::SeqCst);
        self.send(Command::Shutdown)
    }

    /// A frame is being produced right now.
    pub fn is_working(&self) -> bool {
        self.shared.working.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.shared.state.load(Ordering::Relaxed))
    }

    pub fn current_frame(&self) -> i32 {
        self.shared.current_frame.load(Ordering::Relaxed)
    }

    /// Frames in the last validated range (0 if none).
    pub fn frame_count(&self) -> usize {
        if !self.shared.has_range.load(Ordering::Relaxed) {
            return 0;
        }
        let first = self.shared.first.load(Ordering::Relaxed);
        let last = self.shared.last.load(Ordering::Relaxed);
        FrameRange::new(first, last).len()
    }
}

/// Parameters of the current run.
#[derive(Debug, Clone, Copy)]
struct Run {
    remaining: FrameCount,
    same_frame: bool,
    frames_done: u64,
}

impl Default for Run {
    fn default() -> Self {
        Self { remaining: FrameCount::Finite(0), same_frame: false, frames_done: 0 }
    }
}

/// How a frame ended.
enum Delivery {
    Presented,
    Failed,
    Aborted,
}

/// The render scheduler.
pub struct Engine {
    config: EngineConfig,
    graph: Arc<RwLock<NodeGraph>>,
    dag: Arc<ShardedLock<Dag>>,
    output_node: Option<NodeId>,
    output_kind: OutputKind,
    dag_dirty: bool,
    seen_topology: u64,
    cache: Arc<dyn ResultCache>,
    sink: Box<dyn OutputSink>,
    dispatcher: RowDispatcher,
    timer: PlaybackTimer,
    tasks: TaskQueue,
    playhead: Playhead,
    run: Run,
    state: EngineState,
    view: ViewParams,
    pause_requested: bool,
    shutdown: bool,
    rx: Receiver<Command>,
    tx: Sender<Command>,
    shared: Arc<Shared>,
    events_tx: Sender<EngineEvent>,
    events_rx: Receiver<EngineEvent>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        graph: Arc<RwLock<NodeGraph>>,
        cache: Arc<dyn ResultCache>,
        sink: Box<dyn OutputSink>,
    ) -> Result<Self, EngineError> {
        let dispatcher = RowDispatcher::new(config.worker_threads, config.rows_per_group)?;
        let (tx, rx) = unbounded();
        let (events_tx, events_rx) = unbounded();
        let mut playhead = Playhead::new(config.start_frame);
        playhead.set_loop(config.loop_mode);

        info!(
            "Engine: {} workers, {} fps, loop {}",
            dispatcher.threads(),
            config.fps,
            config.loop_mode
        );

        Ok(Self {
            timer: PlaybackTimer::new(config.fps),
            config,
            graph,
            dag: Arc::new(ShardedLock::new(Dag::new())),
            output_node: None,
            output_kind: OutputKind::Viewer,
            dag_dirty: false,
            seen_topology: 0,
            cache,
            sink,
            dispatcher,
            tasks: TaskQueue::new(),
            playhead,
            run: Run::default(),
            state: EngineState::Idle,
            view: ViewParams::default(),
            pause_requested: false,
            shutdown: false,
            rx,
            tx,
            shared: Arc::new(Shared {
                abort: AtomicBool::new(false),
                working: AtomicBool::new(false),
                state: AtomicU8::new(EngineState::Idle as u8),
                current_frame: AtomicI32::new(playhead.frame()),
                has_range: AtomicBool::new(false),
                first: AtomicI32::new(0),
                last: AtomicI32::new(0),
            }),
            events_tx,
            events_rx,
        })
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle { tx: self.tx.clone(), shared: Arc::clone(&self.shared) }
    }

    /// Event stream. Every clone receives a share of the events, not a copy.
    pub fn events(&self) -> Receiver<EngineEvent> {
        self.events_rx.clone()
    }

    /// Shared read access to the current evaluation plan.
    pub fn dag(&self) -> Arc<ShardedLock<Dag>> {
        Arc::clone(&self.dag)
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Run the control loop on a dedicated thread until `Shutdown`.
    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("graphplay-engine".into())
            .spawn(move || self.run())
    }

    /// Control loop: block for a command, execute it, render while running.
    pub fn run(mut self) {
        info!("Engine control loop started");
        while !self.shutdown {
            let Ok(cmd) = self.rx.recv() else { break };
            self.handle_command(cmd);
            self.drive();
        }
        info!("Engine control loop stopped");
    }

    /// Process every queued command and render until nothing is left to do.
    ///
    /// Synchronous alternative to [`Engine::run`] for embedding and tests.
    pub fn run_until_idle(&mut self) {
        while !self.shutdown {
            let Ok(cmd) = self.rx.try_recv() else { break };
            self.handle_command(cmd);
            self.drive();
        }
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events_tx.send(event);
    }

    fn set_state(&mut self, state: EngineState) {
        if self.state == state {
            return;
        }
        debug!("Engine: {:?} -> {:?}", self.state, state);
        self.state = state;
        self.shared.state.store(state as u8, Ordering::Relaxed);
        self.shared.working.store(state == EngineState::Running, Ordering::Relaxed);
        self.emit(EngineEvent::StateChanged(state));
    }

    fn report(&self, err: &EngineError) {
        error!("Engine: {}", err);
        self.emit(EngineEvent::Error(err.to_string()));
    }

    /// Command received while idle or paused.
    fn handle_command(&mut self, cmd: Command) {
        trace!("Engine: command {:?} in {:?}", cmd, self.state);
        match cmd {
            Command::Play { frame_count, forward, fit_to_view } => {
                // Resuming leaves retained tasks queued for step 6
                let task = Task::play(frame_count, forward).fit(fit_to_view);
                self.begin(task);
            }
            Command::Pause => debug!("Engine: pause ignored while {:?}", self.state),
            Command::Abort => self.finish_abort(),
            Command::Seek(frame) => self.start_now(Task::seek(frame)),
            Command::Step(count) => {
                if let Some(task) = self.step_task(count) {
                    self.start_now(task);
                }
            }
            Command::FirstFrame => {
                if let Some(range) = self.known_range() {
                    self.start_now(Task::seek(range.first));
                }
            }
            Command::LastFrame => {
                if let Some(range) = self.known_range() {
                    self.start_now(Task::seek(range.last));
                }
            }
            Command::RepeatSameFrame => self.start_now(Task::repeat()),
            Command::SetFrameCount(count) => {
                debug!("Engine: frame count {:?} ignored while {:?}", count, self.state);
            }
            Command::SetLoopMode(enabled) => self.playhead.set_loop(enabled),
            Command::SetFps(fps) => self.timer.set_desired_fps(fps),
            Command::SetView(view) => self.view = view,
            Command::SetOutput { sink, kind } => {
                self.set_output(sink, kind);
                if let Err(e) = self.ensure_dag() {
                    self.report(&e);
                }
            }
            Command::GraphChanged => self.dag_dirty = true,
            Command::Shutdown => {
                self.shutdown = true;
                self.finish_abort();
            }
        }
    }

    fn set_output(&mut self, sink: Option<NodeId>, kind: OutputKind) {
        info!("Engine: output {:?} ({:?})", sink, kind);
        self.output_node = sink;
        self.output_kind = kind;
        self.dag_dirty = true;
    }

    /// Queue `task` (superseding retained ones) and run it right away.
    fn start_now(&mut self, task: Task) {
        self.tasks.push(task);
        if let Some(task) = self.tasks.take() {
            self.begin(task);
        }
    }

    /// Drain the control channel at a frame boundary.
    fn drain_commands(&mut self) {
        while let Ok(cmd) = self.rx.try_recv() {
            trace!("Engine: boundary command {:?}", cmd);
            match cmd {
                Command::Abort => {
                    self.shared.abort.store(true, Ordering::SeqCst);
                    // Later commands run once idle
                    break;
                }
                Command::Shutdown => {
                    self.shutdown = true;
                    self.shared.abort.store(true, Ordering::SeqCst);
                    break;
                }
                Command::Pause => self.pause_requested = true,
                Command::Play { frame_count, forward, fit_to_view } => {
                    self.tasks.push(Task::play(frame_count, forward).fit(fit_to_view));
                }
                Command::Seek(frame) => self.tasks.push(Task::seek(frame)),
                Command::Step(count) => {
                    if let Some(task) = self.step_task(count) {
                        self.tasks.push(task);
                    }
                }
                Command::FirstFrame => {
                    if let Some(range) = self.known_range() {
                        self.tasks.push(Task::seek(range.first));
                    }
                }
                Command::LastFrame => {
                    if let Some(range) = self.known_range() {
                        self.tasks.push(Task::seek(range.last));
                    }
                }
                Command::RepeatSameFrame => self.tasks.push(Task::repeat()),
                Command::SetFrameCount(count) => self.tasks.push(Task::change_frame_count(count)),
                Command::SetLoopMode(enabled) => self.playhead.set_loop(enabled),
                Command::SetFps(fps) => self.timer.set_desired_fps(fps),
                Command::SetView(view) => self.view = view,
                Command::SetOutput { sink, kind } => {
                    self.set_output(sink, kind);
                    self.tasks.push(Task::repeat());
                }
                Command::GraphChanged => self.dag_dirty = true,
            }
        }
    }

    fn step_task(&self, count: i32) -> Option<Task> {
        let range = self.known_range()?;
        Some(Task::seek(self.playhead.step_target(count, range)))
    }

    /// Range of the current plan as last validated.
    fn known_range(&self) -> Option<FrameRange> {
        let dag = self.dag.read().unwrap_or_else(|e| e.into_inner());
        self.play_range(&dag)
    }

    fn play_range(&self, dag: &Dag) -> Option<FrameRange> {
        match self.output_kind {
            OutputKind::Viewer => dag.frame_range(),
            OutputKind::Writer => dag.sink().and_then(|s| dag.node_range(s)),
        }
    }

    /// Rebuild the plan if the output or the graph changed.
    fn ensure_dag(&mut self) -> Result<(), EngineError> {
        let graph = Arc::clone(&self.graph);
        let graph = graph.read().unwrap_or_else(|e| e.into_inner());
        if graph.topology_version() != self.seen_topology {
            self.dag_dirty = true;
        }
        if !self.dag_dirty {
            return Ok(());
        }

        self.dag_dirty = false;
        self.seen_topology = graph.topology_version();
        let mut dag = self.dag.write().unwrap_or_else(|e| e.into_inner());
        let result = dag.reset_and_sort(&graph, self.output_node, self.output_kind);
        if result.is_err() {
            self.shared.set_range(None);
        }
        result.map_err(EngineError::from)
    }

    /// Light validation; returns the range playback runs over.
    fn validate_range(&mut self) -> Result<FrameRange, EngineError> {
        let mut dag = self.dag.write().unwrap_or_else(|e| e.into_inner());
        dag.validate(false)?;
        let range = self.play_range(&dag).ok_or_else(|| ValidationError::NoFrameRange {
            node: dag
                .sink()
                .and_then(|s| dag.node(s))
                .map(|n| n.name().to_string())
                .unwrap_or_default(),
        })?;
        self.shared.set_range(Some(range));
        Ok(range)
    }

    /// Start a run (Idle/Paused → Running) or apply a queued task (Running).
    fn begin(&mut self, task: Task) {
        if task.kind == TaskKind::ChangeFrameCount {
            self.run.remaining = task.frame_count;
            return;
        }

        let range = match self.ensure_dag().and_then(|_| self.validate_range()) {
            Ok(range) => range,
            Err(e) => {
                self.report(&e);
                self.tasks.clear();
                self.set_state(EngineState::Idle);
                return;
            }
        };

        if task.fit_to_view {
            self.view.zoom = 1.0;
            self.view.region = None;
        }

        match self.output_kind {
            OutputKind::Writer => {
                self.playhead.set_forward(true);
                self.playhead.to_start(range);
                self.run = Run {
                    remaining: FrameCount::Finite(range.len() as u32),
                    same_frame: false,
                    frames_done: 0,
                };
            }
            OutputKind::Viewer => {
                if !task.same_frame {
                    self.playhead.set_forward(task.forward);
                }
                let frame = task.frame.unwrap_or(self.playhead.frame());
                self.playhead.set_frame(frame, range);
                self.run = Run { remaining: task.frame_count, same_frame: task.same_frame, frames_done: 0 };
            }
        }

        debug!(
            "Engine: run from frame {} ({:?}, {})",
            self.playhead.frame(),
            self.run.remaining,
            if self.playhead.forward() { "forward" } else { "backward" }
        );
        self.timer.reset();
        self.pause_requested = false;
        self.shared.current_frame.store(self.playhead.frame(), Ordering::Relaxed);
        if self.run.remaining.is_exhausted() {
            self.set_state(EngineState::Idle);
        } else {
            self.set_state(EngineState::Running);
        }
    }

    /// Render while running.
    fn drive(&mut self) {
        while self.state == EngineState::Running {
            let delivery = self.render_frame();
            self.after_frame(delivery);
        }
    }

    /// Steps 1-5 for the playhead's frame.
    fn render_frame(&mut self) -> Delivery {
        let number = self.playhead.frame();
        if self.shared.abort.load(Ordering::SeqCst) {
            return Delivery::Aborted;
        }

        let prepared = self.ensure_dag().and_then(|_| self.prepare_and_validate(number));
        match prepared {
            Ok(()) => {}
            Err(EngineError::Decode(e)) => return self.fail_frame(number, e.to_string()),
            Err(e) => {
                // Refuse to start the frame; playback ends
                self.report(&e);
                self.tasks.clear();
                self.set_state(EngineState::Idle);
                return Delivery::Aborted;
            }
        }
        let Some(sink_node) = self.output_node else {
            self.set_state(EngineState::Idle);
            return Delivery::Aborted;
        };

        let dag_lock = Arc::clone(&self.dag);
        let dag = dag_lock.read().unwrap_or_else(|e| e.into_inner());
        let (job, view) = match self.frame_job(&dag, sink_node, number) {
            Ok(job) => job,
            Err(message) => return self.fail_frame(number, message),
        };
        let key = FrameKey { tree_version: dag.version(), frame: number, view };

        // Honour other renderers' in-flight markers
        let claim = loop {
            if self.shared.abort.load(Ordering::SeqCst) {
                return Delivery::Aborted;
            }
            match self.cache.claim(&key) {
                Claim::Busy => {
                    let abort = &self.shared.abort;
                    if !self.cache.wait(&key, &|| abort.load(Ordering::SeqCst)) {
                        debug!("Frame {}: abort while waiting for another render", number);
                    }
                }
                other => break other,
            }
        };

        let (frame, fresh) = match claim {
            Claim::Hit(frame) => {
                trace!("Frame {}: cache hit", number);
                (frame, None)
            }
            _ => match self.dispatcher.render(&dag, sink_node, &job, &self.shared.abort) {
                FrameOutcome::Complete(rows) => {
                    (Arc::new(Frame::new(number, view.region, job.channels, rows)), Some(key))
                }
                FrameOutcome::Failed(err) => {
                    self.cache.release(&key);
                    return self.fail_frame(number, err.to_string());
                }
                FrameOutcome::Aborted => {
                    self.cache.release(&key);
                    return Delivery::Aborted;
                }
            },
        };
        drop(dag);

        self.deliver(frame, fresh)
    }

    /// Failed frame: the output gets an error instead of an image.
    fn fail_frame(&mut self, number: i32, message: String) -> Delivery {
        warn!("Frame {}: {}", number, message);
        self.sink.present_error(number, &message);
        self.emit(EngineEvent::FrameFailed { frame: number, message });
        Delivery::Failed
    }

    fn prepare_and_validate(&mut self, number: i32) -> Result<(), EngineError> {
        let dag_lock = Arc::clone(&self.dag);
        {
            let dag = dag_lock.read().unwrap_or_else(|e| e.into_inner());
            self.dispatcher.prepare_sources(&dag, number)?;
        }
        let mut dag = dag_lock.write().unwrap_or_else(|e| e.into_inner());
        let request = match self.output_kind {
            OutputKind::Viewer => RequestHints {
                channels: self.view.channels,
                region: self.view.region.unwrap_or_default(),
            },
            OutputKind::Writer => RequestHints::default(),
        };
        dag.set_request(request);
        dag.validate(true)?;
        Ok(())
    }

    /// Rows and view key for `number` under the current output settings.
    fn frame_job(&self, dag: &Dag, sink: NodeId, number: i32) -> Result<(FrameJob, ViewKey), String> {
        let (Some(hints), Some(info)) = (dag.hints(sink), dag.info(sink)) else {
            return Err(format!("no resolved output info for {:?}", sink));
        };
        if !hints.channels.is_empty() && hints.channels.intersection(info.channels).is_empty() {
            return Err(format!(
                "requested channels {:?} not produced by the output ({:?})",
                hints.channels, info.channels
            ));
        }
        let (stride, zoom) = match self.output_kind {
            OutputKind::Viewer => (self.view.row_stride(), self.view.zoom),
            OutputKind::Writer => (1, 1.0),
        };
        let region = hints.region;
        let channels = if hints.channels.is_empty() { info.channels } else { hints.channels };
        let rows = (region.y..region.t).step_by(stride as usize).collect();

        let job = FrameJob { frame: number, rows, x: region.x, r: region.r, channels };
        let view = ViewKey { zoom_bits: zoom.to_bits(), region, channels };
        Ok((job, view))
    }

    /// Step 5. `fresh` carries the claimed key of a newly computed frame; it
    /// is inserted only once the frame is certain to reach the output.
    fn deliver(&mut self, frame: Arc<Frame>, fresh: Option<FrameKey>) -> Delivery {
        let number = frame.number();
        let cached = fresh.is_none();
        if let OutputKind::Viewer = self.output_kind {
            // No wait for the first frame after `timer.reset()`
            let shared = Arc::clone(&self.shared);
            self.timer.wait_until_next_frame_due(|| shared.abort.load(Ordering::SeqCst));
        }
        if self.shared.abort.load(Ordering::SeqCst) {
            if let Some(key) = fresh {
                self.cache.release(&key);
            }
            debug!("Frame {}: aborted before output", number);
            return Delivery::Aborted;
        }
        if let Some(key) = fresh {
            self.cache.insert(key, Arc::clone(&frame));
        }

        match self.output_kind {
            OutputKind::Viewer => self.sink.present(frame),
            OutputKind::Writer => {
                if let Err(e) = self.sink.write_to_disk(frame, number) {
                    let message = format!("{:#}", e);
                    warn!("Frame {}: write failed: {}", number, message);
                    self.emit(EngineEvent::FrameFailed { frame: number, message });
                    return Delivery::Failed;
                }
            }
        }
        self.emit(EngineEvent::FrameRendered { frame: number, cached });
        Delivery::Presented
    }

    /// Step 6: bookkeeping and what comes next.
    fn after_frame(&mut self, delivery: Delivery) {
        if self.state != EngineState::Running {
            return;
        }
        if matches!(delivery, Delivery::Presented | Delivery::Failed) {
            self.run.frames_done += 1;
            self.run.remaining = self.run.remaining.decremented();
            if let Some(fps) = self.timer.frame_done(self.config.fps_report_interval) {
                self.emit(EngineEvent::FpsChanged(fps));
            }
        }

        self.drain_commands();

        if self.shared.abort.load(Ordering::SeqCst) {
            self.finish_abort();
            return;
        }
        if self.pause_requested {
            self.pause_requested = false;
            info!("Engine: paused at frame {}", self.playhead.frame());
            self.set_state(EngineState::Paused);
            return;
        }
        if let Some(task) = self.tasks.take() {
            let restart = task.kind == TaskKind::Start;
            self.begin(task);
            if restart {
                return;
            }
        }
        if self.run.remaining.is_exhausted() {
            debug!("Engine: run done after {} frames", self.run.frames_done);
            self.set_state(EngineState::Idle);
            return;
        }

        let Some(range) = self.known_range() else {
            self.set_state(EngineState::Idle);
            return;
        };
        if range.len() == 1 && self.run.remaining == FrameCount::Indefinite {
            debug!("Engine: single-frame range, stopping");
            self.set_state(EngineState::Idle);
            return;
        }
        if self.run.same_frame {
            return;
        }
        match self.playhead.advance(range) {
            Some(frame) => self.shared.current_frame.store(frame, Ordering::Relaxed),
            None => self.set_state(EngineState::Idle),
        }
    }

    /// Running|Paused → Aborting → Idle. Drops queued tasks.
    fn finish_abort(&mut self) {
        if self.state != EngineState::Idle {
            info!("Engine: aborted at frame {}", self.playhead.frame());
            self.set_state(EngineState::Aborting);
        }
        self.tasks.clear();
        self.pause_requested = false;
        self.shared.abort.store(false, Ordering::SeqCst);
        self.set_state(EngineState::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache_man::CacheManager;
    use crate::core::frame_cache::FrameCache;
    use crate::entities::frame::Channel;
    use crate::entities::output::{ViewerNode, WriterNode};
    use crate::test_utils::{PassNode, RecordingSink, SinkLog};
    use crate::entities::traits::CacheStatsSnapshot;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Mutex, OnceLock};
    use std::time::Duration;

    struct Rig {
        engine: Engine,
        handle: EngineHandle,
        graph: Arc<RwLock<NodeGraph>>,
        cache: Arc<FrameCache>,
        log: Arc<Mutex<SinkLog>>,
        source: Arc<PassNode>,
        viewer: NodeId,
    }

    fn config() -> EngineConfig {
        EngineConfig { fps: 0.0, worker_threads: 2, rows_per_group: 2, ..EngineConfig::default() }
    }

    /// source -> gain(+0.5) -> viewer
    fn rig_with(source: PassNode, sink: RecordingSink, log: Arc<Mutex<SinkLog>>) -> Rig {
        let source = Arc::new(source);
        let mut graph = NodeGraph::new();
        let s = graph.add_shared(source.clone());
        let g = graph.add(PassNode::filter("gain", 1).with_value(0.5));
        let v = graph.add(ViewerNode::new("viewer"));
        graph.connect(s, g, 0).unwrap();
        graph.connect(g, v, 0).unwrap();

        let graph = Arc::new(RwLock::new(graph));
        let cache = Arc::new(FrameCache::new(0, Arc::new(CacheManager::with_limit(1 << 26))));
        let mut engine = Engine::new(config(), Arc::clone(&graph), cache.clone(), Box::new(sink)).unwrap();
        let handle = engine.handle();
        handle.set_output(Some(v), OutputKind::Viewer).unwrap();
        engine.run_until_idle();
        Rig { engine, handle, graph, cache, log, source, viewer: v }
    }

    fn rig(source: PassNode) -> Rig {
        let (sink, log) = RecordingSink::new();
        rig_with(source, sink, log)
    }

    fn presented(log: &Arc<Mutex<SinkLog>>) -> Vec<i32> {
        log.lock().unwrap().presented.clone()
    }

    fn drain(events: &Receiver<EngineEvent>) -> Vec<EngineEvent> {
        events.try_iter().collect()
    }

    #[test]
    fn test_play_five_frames() {
        let mut rig = rig(PassNode::source("src"));
        let events = rig.engine.events();
        rig.handle.seek(1).unwrap();
        rig.engine.run_until_idle();
        rig.log.lock().unwrap().presented.clear();
        rig.cache.clear();

        rig.handle.play(FrameCount::Finite(5), true).unwrap();
        rig.engine.run_until_idle();

        assert_eq!(presented(&rig.log), vec![1, 2, 3, 4, 5]);
        assert_eq!(rig.cache.len(), 5);
        assert_eq!(rig.engine.state(), EngineState::Idle);
        assert_eq!(rig.handle.state(), EngineState::Idle);
        assert!(!rig.handle.is_working());
        assert_eq!(rig.handle.current_frame(), 5);
        assert_eq!(rig.handle.frame_count(), 10);

        let log = rig.log.lock().unwrap();
        let frame = log.frames.last().unwrap();
        assert_eq!(frame.rows().len(), 4);
        assert_eq!(frame.rows()[0].channel(Channel::Red).unwrap(), &[1.5; 8]);

        let events = drain(&events);
        assert!(events.contains(&EngineEvent::StateChanged(EngineState::Running)));
        assert_eq!(events.last(), Some(&EngineEvent::StateChanged(EngineState::Idle)));
    }

    #[test]
    fn test_cache_hit_skips_compute() {
        let mut rig = rig(PassNode::source("src"));
        let events = rig.engine.events();
        rig.handle.seek(3).unwrap();
        rig.engine.run_until_idle();
        let renders = rig.source.renders();
        assert!(renders > 0);

        rig.handle.seek(3).unwrap();
        rig.engine.run_until_idle();
        assert_eq!(rig.source.renders(), renders);
        assert_eq!(presented(&rig.log), vec![3, 3]);

        let rendered = drain(&events)
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::FrameRendered { cached, .. } => Some(cached),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(rendered, vec![false, true]);
    }

    #[test]
    fn test_abort_mid_frame() {
        let slot: Arc<OnceLock<EngineHandle>> = Arc::new(OnceLock::new());
        let hook_slot = Arc::clone(&slot);
        let source = PassNode::source("src").with_format(8, 32).with_hook(move |req| {
            if req.frame == 2 && req.y == 2 {
                if let Some(handle) = hook_slot.get() {
                    handle.abort().unwrap();
                }
            }
        });
        let mut rig = rig(source);
        slot.set(rig.handle.clone()).ok();

        rig.handle.seek(1).unwrap();
        rig.engine.run_until_idle();
        rig.handle.play(FrameCount::Finite(5), true).unwrap();
        rig.engine.run_until_idle();

        // Frame 1 twice (seek, then first frame of play from cache), frame 2 never
        assert_eq!(presented(&rig.log), vec![1, 1]);
        assert_eq!(rig.cache.len(), 1);
        assert_eq!(rig.engine.state(), EngineState::Idle);

        // Engine usable again after abort
        rig.handle.seek(4).unwrap();
        rig.engine.run_until_idle();
        assert_eq!(presented(&rig.log), vec![1, 1, 4]);
    }

    #[test]
    fn test_later_seek_wins() {
        let slot: Arc<OnceLock<EngineHandle>> = Arc::new(OnceLock::new());
        let hook_slot = Arc::clone(&slot);
        let (sink, log) = RecordingSink::new();
        let sink = sink.with_hook(move |frame| {
            if frame == 1 {
                if let Some(handle) = hook_slot.get() {
                    handle.seek(5).unwrap();
                    handle.seek(9).unwrap();
                }
            }
        });
        let mut rig = rig_with(PassNode::source("src"), sink, log);
        slot.set(rig.handle.clone()).ok();

        rig.handle.play(FrameCount::Indefinite, true).unwrap();
        rig.engine.run_until_idle();

        // Playhead starts at 0, clamped to the first frame
        assert_eq!(presented(&rig.log), vec![1, 9]);
        assert_eq!(rig.engine.state(), EngineState::Idle);
    }

    #[test]
    fn test_loop_and_direction() {
        let mut rig = rig(PassNode::source("src"));
        rig.handle.seek(9).unwrap();
        rig.handle.play(FrameCount::Finite(4), true).unwrap();
        rig.engine.run_until_idle();
        assert_eq!(presented(&rig.log), vec![9, 9, 10, 1, 2]);

        rig.handle.set_loop_mode(false).unwrap();
        rig.handle.seek(8).unwrap();
        rig.handle.play(FrameCount::Indefinite, true).unwrap();
        rig.engine.run_until_idle();
        assert_eq!(&presented(&rig.log)[5..], &[8, 8, 9, 10]);

        rig.handle.seek(3).unwrap();
        rig.handle.play(FrameCount::Finite(3), false).unwrap();
        rig.engine.run_until_idle();
        assert_eq!(&presented(&rig.log)[9..], &[3, 3, 2, 1]);
    }

    #[test]
    fn test_pause_retains_queue() {
        let slot: Arc<OnceLock<EngineHandle>> = Arc::new(OnceLock::new());
        let hook_slot = Arc::clone(&slot);
        let (sink, log) = RecordingSink::new();
        let mut fired = false;
        let sink = sink.with_hook(move |frame| {
            if frame == 2 && !fired {
                fired = true;
                if let Some(handle) = hook_slot.get() {
                    handle.pause().unwrap();
                    handle.seek(7).unwrap();
                }
            }
        });
        let mut rig = rig_with(PassNode::source("src"), sink, log);
        slot.set(rig.handle.clone()).ok();

        rig.handle.play(FrameCount::Indefinite, true).unwrap();
        rig.engine.run_until_idle();
        assert_eq!(rig.engine.state(), EngineState::Paused);
        assert_eq!(presented(&rig.log), vec![1, 2]);

        // Resume renders the current frame, then the retained seek
        rig.handle.play(FrameCount::Indefinite, true).unwrap();
        rig.engine.run_until_idle();
        assert_eq!(presented(&rig.log), vec![1, 2, 2, 7]);
        assert_eq!(rig.engine.state(), EngineState::Idle);
    }

    #[test]
    fn test_abort_while_paused_drops_queue() {
        let slot: Arc<OnceLock<EngineHandle>> = Arc::new(OnceLock::new());
        let hook_slot = Arc::clone(&slot);
        let (sink, log) = RecordingSink::new();
        let mut fired = false;
        let sink = sink.with_hook(move |frame| {
            if frame == 1 && !fired {
                fired = true;
                if let Some(handle) = hook_slot.get() {
                    handle.pause().unwrap();
                    handle.seek(7).unwrap();
                }
            }
        });
        let mut rig = rig_with(PassNode::source("src"), sink, log);
        slot.set(rig.handle.clone()).ok();
        let events = rig.engine.events();

        rig.handle.play(FrameCount::Indefinite, true).unwrap();
        rig.engine.run_until_idle();
        assert_eq!(rig.engine.state(), EngineState::Paused);

        rig.handle.abort().unwrap();
        rig.engine.run_until_idle();
        assert_eq!(rig.engine.state(), EngineState::Idle);
        assert!(drain(&events).contains(&EngineEvent::StateChanged(EngineState::Aborting)));

        rig.handle.play(FrameCount::Finite(1), true).unwrap();
        rig.engine.run_until_idle();
        // Seek(7) was discarded
        assert_eq!(presented(&rig.log), vec![1, 1]);
    }

    #[test]
    fn test_failed_frame_keeps_playing() {
        let mut rig = rig(PassNode::source("src").failing_on_frame(2));
        let events = rig.engine.events();
        rig.handle.seek(1).unwrap();
        rig.engine.run_until_idle();
        rig.handle.play(FrameCount::Finite(4), true).unwrap();
        rig.engine.run_until_idle();

        let log = rig.log.lock().unwrap();
        assert_eq!(log.presented, vec![1, 1, 3, 4]);
        assert_eq!(log.errors, vec![2]);
        assert_eq!(rig.cache.len(), 3);
        assert!(drain(&events).iter().any(|e| matches!(e, EngineEvent::FrameFailed { frame: 2, .. })));
    }

    #[test]
    fn test_topology_error_keeps_idle() {
        let mut rig = rig(PassNode::source("src"));
        let events = rig.engine.events();
        {
            let mut graph = rig.graph.write().unwrap();
            let a = graph.add(PassNode::filter("a", 1));
            let b = graph.add(PassNode::filter("b", 1));
            graph.connect(a, b, 0).unwrap();
            graph.connect(b, a, 0).unwrap();
            graph.connect(b, rig.viewer, 0).unwrap();
        }
        rig.handle.graph_changed().unwrap();
        rig.handle.play(FrameCount::Finite(3), true).unwrap();
        rig.engine.run_until_idle();

        assert!(presented(&rig.log).is_empty());
        assert_eq!(rig.engine.state(), EngineState::Idle);
        let events = drain(&events);
        assert!(events.iter().any(|e| matches!(e, EngineEvent::Error(msg) if msg.contains("cycle"))));
        assert!(!events.contains(&EngineEvent::StateChanged(EngineState::Running)));
    }

    #[test]
    fn test_validation_error_refuses_start() {
        let mut rig = rig(PassNode::source("src"));
        rig.graph.write().unwrap().disconnect(rig.viewer, 0).unwrap();
        rig.handle.play(FrameCount::Finite(2), true).unwrap();
        rig.engine.run_until_idle();
        assert!(presented(&rig.log).is_empty());
        assert_eq!(rig.engine.state(), EngineState::Idle);
    }

    #[test]
    fn test_navigation_while_idle() {
        let mut rig = rig(PassNode::source("src"));
        let commands = [
            Command::Seek(5),
            Command::Step(1),
            Command::Step(-10),
            Command::LastFrame,
            Command::FirstFrame,
            Command::Seek(99),
        ];
        for cmd in commands {
            rig.handle.send(cmd).unwrap();
            rig.engine.run_until_idle();
        }
        assert_eq!(presented(&rig.log), vec![5, 6, 6, 10, 1, 10]);
    }

    #[test]
    fn test_writer_output() {
        let (sink, log) = RecordingSink::new();
        let mut rig = rig_with(PassNode::source("src"), sink, log);
        let w = {
            let mut graph = rig.graph.write().unwrap();
            let w = graph.add(WriterNode::new("out").with_range(3, 6));
            graph.connect(rig.viewer, w, 0).unwrap();
            w
        };
        rig.handle.set_output(Some(w), OutputKind::Writer).unwrap();
        rig.handle.play(FrameCount::Indefinite, false).unwrap();
        rig.engine.run_until_idle();

        let log = rig.log.lock().unwrap();
        assert_eq!(log.written, vec![3, 4, 5, 6]);
        assert!(log.presented.is_empty());
        assert_eq!(log.frames[0].rows().len(), 4);
    }

    #[test]
    fn test_zoomed_view_subsamples_rows() {
        let mut rig = rig(PassNode::source("src").with_format(8, 16));
        rig.handle
            .set_view(ViewParams { zoom: 0.25, region: None, channels: ChannelSet::RGB })
            .unwrap();
        rig.handle.seek(2).unwrap();
        rig.engine.run_until_idle();

        let log = rig.log.lock().unwrap();
        let frame = &log.frames[0];
        let ys = frame.rows().iter().map(|r| r.y()).collect::<Vec<_>>();
        assert_eq!(ys, vec![0, 4, 8, 12]);
        assert_eq!(frame.channels(), ChannelSet::RGB);
        assert!(frame.rows()[0].channel(Channel::Alpha).is_none());
    }

    #[test]
    fn test_parameter_change_misses_cache() {
        let mut rig = rig(PassNode::source("src"));
        rig.handle.seek(2).unwrap();
        rig.engine.run_until_idle();
        let renders = rig.source.renders();

        // Swap the gain for one with different parameters
        {
            let mut graph = rig.graph.write().unwrap();
            let source_id = graph.inputs(graph.inputs(rig.viewer)[0].unwrap())[0].unwrap();
            let g = graph.add(PassNode::filter("gain", 1).with_value(0.5).with_hash(9));
            graph.connect(source_id, g, 0).unwrap();
            graph.connect(g, rig.viewer, 0).unwrap();
        }
        rig.handle.repeat_same_frame().unwrap();
        rig.engine.run_until_idle();
        assert!(rig.source.renders() > renders);
        assert_eq!(rig.cache.len(), 2);
    }

    #[test]
    fn test_single_frame_range_stops() {
        let mut rig = rig(PassNode::source("src").with_range(4, 4));
        rig.handle.play(FrameCount::Indefinite, true).unwrap();
        rig.engine.run_until_idle();
        assert_eq!(presented(&rig.log), vec![4]);
    }

    #[test]
    fn test_fps_reports() {
        let mut rig = rig(PassNode::source("src"));
        rig.engine.config.fps_report_interval = 2;
        let events = rig.engine.events();
        rig.handle.play(FrameCount::Finite(5), true).unwrap();
        rig.engine.run_until_idle();
        let reports = drain(&events).iter().filter(|e| matches!(e, EngineEvent::FpsChanged(_))).count();
        // Windows restart on their closing frame: frames 2, 3, 4, 5 report
        assert_eq!(reports, 4);
    }

    #[test]
    fn test_frame_count_change_while_running() {
        let slot: Arc<OnceLock<EngineHandle>> = Arc::new(OnceLock::new());
        let hook_slot = Arc::clone(&slot);
        let (sink, log) = RecordingSink::new();
        let sink = sink.with_hook(move |frame| {
            if frame == 1 {
                if let Some(handle) = hook_slot.get() {
                    handle.set_frame_count(FrameCount::Finite(2)).unwrap();
                }
            }
        });
        let mut rig = rig_with(PassNode::source("src"), sink, log);
        slot.set(rig.handle.clone()).ok();

        rig.handle.play(FrameCount::Indefinite, true).unwrap();
        rig.engine.run_until_idle();
        assert_eq!(presented(&rig.log), vec![1, 2, 3]);
    }

    #[test]
    fn test_spawned_control_thread() {
        let rig = rig(PassNode::source("src"));
        let Rig { engine, handle, log, .. } = rig;
        let events = engine.events();
        let thread = engine.spawn().unwrap();

        handle.play(FrameCount::Finite(3), true).unwrap();
        let mut saw_running = false;
        loop {
            match events.recv_timeout(Duration::from_secs(5)).unwrap() {
                EngineEvent::StateChanged(EngineState::Running) => saw_running = true,
                EngineEvent::StateChanged(EngineState::Idle) if saw_running => break,
                _ => {}
            }
        }
        handle.shutdown().unwrap();
        thread.join().unwrap();
        assert_eq!(log.lock().unwrap().presented, vec![1, 2, 3]);
        assert!(handle.seek(1).is_err());
    }

    #[test]
    fn test_abort_during_pacing_drops_frame() {
        let rig = rig(PassNode::source("src"));
        let Rig { mut engine, handle, cache, log, .. } = rig;
        handle.set_fps(2.0).unwrap();
        engine.run_until_idle();
        let events = engine.events();
        let thread = engine.spawn().unwrap();

        handle.play(FrameCount::Finite(5), true).unwrap();
        loop {
            match events.recv_timeout(Duration::from_secs(5)).unwrap() {
                EngineEvent::FrameRendered { frame: 1, .. } => break,
                _ => {}
            }
        }
        // Frame 2 is computed and waiting for its 500ms slot
        thread::sleep(Duration::from_millis(150));
        handle.abort().unwrap();
        let mut rendered = Vec::new();
        loop {
            match events.recv_timeout(Duration::from_secs(5)).unwrap() {
                EngineEvent::FrameRendered { frame, .. } => rendered.push(frame),
                EngineEvent::StateChanged(EngineState::Idle) => break,
                _ => {}
            }
        }

        assert!(rendered.is_empty());
        assert_eq!(log.lock().unwrap().presented, vec![1]);
        assert_eq!(cache.len(), 1);
        handle.shutdown().unwrap();
        thread.join().unwrap();
    }

    /// Reports every key as being rendered elsewhere while `held` is set.
    struct HeldCache {
        inner: FrameCache,
        held: AtomicBool,
        waits: AtomicUsize,
    }

    impl ResultCache for HeldCache {
        fn lookup(&self, key: &FrameKey) -> Option<Arc<Frame>> {
            self.inner.lookup(key)
        }

        fn claim(&self, key: &FrameKey) -> Claim {
            if self.held.load(Ordering::SeqCst) {
                return Claim::Busy;
            }
            self.inner.claim(key)
        }

        fn wait(&self, _key: &FrameKey, stop: &dyn Fn() -> bool) -> bool {
            self.waits.fetch_add(1, Ordering::SeqCst);
            while self.held.load(Ordering::SeqCst) {
                if stop() {
                    return false;
                }
                thread::sleep(Duration::from_millis(5));
            }
            true
        }

        fn insert(&self, key: FrameKey, frame: Arc<Frame>) {
            self.inner.insert(key, frame)
        }

        fn release(&self, key: &FrameKey) {
            self.inner.release(key)
        }

        fn set_max_memory(&self, bytes: usize) {
            self.inner.set_max_memory(bytes)
        }

        fn clear(&self) {
            self.inner.clear()
        }

        fn len(&self) -> usize {
            self.inner.len()
        }

        fn stats_snapshot(&self) -> CacheStatsSnapshot {
            self.inner.stats_snapshot()
        }
    }

    /// source -> viewer over a cache whose keys start out held.
    fn held_engine() -> (JoinHandle<()>, EngineHandle, Receiver<EngineEvent>, Arc<HeldCache>, Arc<Mutex<SinkLog>>) {
        let mut graph = NodeGraph::new();
        let s = graph.add(PassNode::source("src"));
        let v = graph.add(ViewerNode::new("viewer"));
        graph.connect(s, v, 0).unwrap();

        let cache = Arc::new(HeldCache {
            inner: FrameCache::new(0, Arc::new(CacheManager::with_limit(1 << 26))),
            held: AtomicBool::new(true),
            waits: AtomicUsize::new(0),
        });
        let (sink, log) = RecordingSink::new();
        let engine =
            Engine::new(config(), Arc::new(RwLock::new(graph)), cache.clone(), Box::new(sink)).unwrap();
        let handle = engine.handle();
        let events = engine.events();
        handle.set_output(Some(v), OutputKind::Viewer).unwrap();
        let thread = engine.spawn().unwrap();
        (thread, handle, events, cache, log)
    }

    #[test]
    fn test_busy_key_waits_for_other_render() {
        let (thread, handle, events, cache, log) = held_engine();
        handle.seek(2).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(log.lock().unwrap().presented.is_empty());
        assert!(cache.waits.load(Ordering::SeqCst) >= 1);
        assert_eq!(handle.state(), EngineState::Running);

        cache.held.store(false, Ordering::SeqCst);
        loop {
            if let EngineEvent::FrameRendered { frame, .. } = events.recv_timeout(Duration::from_secs(5)).unwrap() {
                assert_eq!(frame, 2);
                break;
            }
        }
        assert_eq!(log.lock().unwrap().presented, vec![2]);
        handle.shutdown().unwrap();
        thread.join().unwrap();
    }

    #[test]
    fn test_abort_while_waiting_on_busy_key() {
        let (thread, handle, events, cache, log) = held_engine();
        handle.seek(2).unwrap();
        thread::sleep(Duration::from_millis(50));
        handle.abort().unwrap();

        let mut saw_running = false;
        loop {
            match events.recv_timeout(Duration::from_secs(5)).unwrap() {
                EngineEvent::StateChanged(EngineState::Running) => saw_running = true,
                EngineEvent::StateChanged(EngineState::Idle) if saw_running => break,
                _ => {}
            }
        }
        // Still held: the engine gave up instead of waiting it out
        assert!(cache.held.load(Ordering::SeqCst));
        assert!(log.lock().unwrap().presented.is_empty());
        assert!(log.lock().unwrap().errors.is_empty());
        assert!(cache.is_empty());
        handle.shutdown().unwrap();
        thread.join().unwrap();
    }

    #[test]
    fn test_missing_view_channels_fail_frame() {
        let mut rig = rig(PassNode::source("src").with_channels(ChannelSet::RGB));
        let events = rig.engine.events();
        rig.handle
            .set_view(ViewParams { channels: ChannelSet::single(Channel::Alpha), ..ViewParams::default() })
            .unwrap();
        rig.handle.seek(1).unwrap();
        rig.engine.run_until_idle();

        let log = rig.log.lock().unwrap();
        assert!(log.presented.is_empty());
        assert_eq!(log.errors, vec![1]);
        assert!(rig.cache.is_empty());
        assert!(drain(&events).iter().any(|e| matches!(e, EngineEvent::FrameFailed { frame: 1, .. })));
    }
}
