//! Shared mocks for unit tests.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::entities::error::{DecodeError, RowError, ValidationError};
use crate::entities::frame::{ChannelSet, Frame, FrameRange, Region, Row};
use crate::entities::node::{merge_infos, Node, NodeInfo, RowContext, RowRequest};
use crate::entities::reader::{Decoder, SourceHeader};
use crate::entities::traits::OutputSink;

type RenderHook = Box<dyn Fn(&RowRequest) + Send + Sync>;

/// Configurable node: sources fill a constant, filters sum their inputs
/// and add a constant.
pub struct PassNode {
    name: String,
    arity: usize,
    range: FrameRange,
    format: Region,
    channels: ChannelSet,
    value: f32,
    hash: u64,
    intersect: bool,
    fail_on: Option<i32>,
    fail_frame: Option<i32>,
    panic_on: Option<i32>,
    hook: Option<RenderHook>,
    renders: AtomicUsize,
}

impl PassNode {
    pub fn source(name: &str) -> Self {
        Self {
            name: name.to_string(),
            arity: 0,
            range: FrameRange::new(1, 10),
            format: Region::with_size(8, 4),
            channels: ChannelSet::RGBA,
            value: 1.0,
            hash: 0,
            intersect: false,
            fail_on: None,
            fail_frame: None,
            panic_on: None,
            hook: None,
            renders: AtomicUsize::new(0),
        }
    }

    pub fn filter(name: &str, arity: usize) -> Self {
        Self { arity, value: 0.0, ..Self::source(name) }
    }

    pub fn with_range(mut self, first: i32, last: i32) -> Self {
        self.range = FrameRange::new(first, last);
        self
    }

    pub fn with_format(mut self, width: i32, height: i32) -> Self {
        self.format = Region::with_size(width, height);
        self
    }

    pub fn with_channels(mut self, channels: ChannelSet) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_value(mut self, value: f32) -> Self {
        self.value = value;
        self
    }

    pub fn with_hash(mut self, hash: u64) -> Self {
        self.hash = hash;
        self
    }

    pub fn intersecting(mut self) -> Self {
        self.intersect = true;
        self
    }

    pub fn failing_on(mut self, y: i32) -> Self {
        self.fail_on = Some(y);
        self
    }

    /// Fail every row of `frame`.
    pub fn failing_on_frame(mut self, frame: i32) -> Self {
        self.fail_frame = Some(frame);
        self
    }

    pub fn panicking_on(mut self, y: i32) -> Self {
        self.panic_on = Some(y);
        self
    }

    pub fn with_hook(mut self, hook: impl Fn(&RowRequest) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn renders(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }
}

impl Node for PassNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn node_type(&self) -> &'static str {
        "Pass"
    }

    fn arity(&self) -> usize {
        self.arity
    }

    fn hash(&self) -> u64 {
        self.hash
    }

    fn frame_range(&self, inputs: &[FrameRange]) -> Result<FrameRange, ValidationError> {
        if self.arity == 0 {
            return Ok(self.range);
        }
        let mut iter = inputs.iter().copied();
        let first = iter
            .next()
            .ok_or_else(|| ValidationError::NoFrameRange { node: self.name.clone() })?;
        if self.intersect {
            iter.try_fold(first, |acc, r| acc.intersection(&r))
                .ok_or_else(|| ValidationError::DisjointRanges { node: self.name.clone() })
        } else {
            Ok(iter.fold(first, |acc, r| acc.union(&r)))
        }
    }

    fn info(&self, inputs: &[NodeInfo]) -> Result<NodeInfo, ValidationError> {
        if self.arity == 0 {
            return Ok(NodeInfo { range: self.range, format: self.format, channels: self.channels });
        }
        merge_infos(&self.name, inputs)
    }

    fn render(&self, ctx: &RowContext<'_>, out: &mut Row) -> Result<(), RowError> {
        if let Some(hook) = &self.hook {
            hook(ctx.request());
        }
        self.renders.fetch_add(1, Ordering::SeqCst);
        if self.panic_on == Some(ctx.y()) {
            panic!("injected panic on row {}", ctx.y());
        }
        if self.fail_on == Some(ctx.y()) || self.fail_frame == Some(ctx.frame()) {
            return Err(RowError::failed("injected failure"));
        }
        for idx in 0..self.arity {
            let input = ctx.input(idx)?;
            for ch in out.channels().iter() {
                if let (Some(dst), Some(src)) = (out.channel_mut(ch), input.channel(ch)) {
                    dst.iter_mut().zip(src).for_each(|(d, s)| *d += *s);
                }
            }
        }
        for ch in out.channels().iter() {
            if let Some(dst) = out.channel_mut(ch) {
                dst.iter_mut().for_each(|d| *d += self.value);
            }
        }
        Ok(())
    }
}

/// What a [`RecordingSink`] saw, in call order.
#[derive(Debug, Default, Clone)]
pub struct SinkLog {
    pub presented: Vec<i32>,
    pub written: Vec<i32>,
    pub errors: Vec<i32>,
    pub frames: Vec<Arc<Frame>>,
}

type PresentHook = Box<dyn FnMut(i32) + Send>;

/// Output sink recording every call.
pub struct RecordingSink {
    log: Arc<Mutex<SinkLog>>,
    on_present: Option<PresentHook>,
}

impl RecordingSink {
    pub fn new() -> (Self, Arc<Mutex<SinkLog>>) {
        let log = Arc::new(Mutex::new(SinkLog::default()));
        (Self { log: Arc::clone(&log), on_present: None }, log)
    }

    /// Run `hook` after every presented frame (from the control thread).
    pub fn with_hook(mut self, hook: impl FnMut(i32) + Send + 'static) -> Self {
        self.on_present = Some(Box::new(hook));
        self
    }
}

impl OutputSink for RecordingSink {
    fn present(&mut self, frame: Arc<Frame>) {
        let number = frame.number();
        {
            let mut log = self.log.lock().unwrap();
            log.presented.push(number);
            log.frames.push(frame);
        }
        if let Some(hook) = self.on_present.as_mut() {
            hook(number);
        }
    }

    fn write_to_disk(&mut self, frame: Arc<Frame>, number: i32) -> anyhow::Result<()> {
        let mut log = self.log.lock().unwrap();
        log.written.push(number);
        log.frames.push(frame);
        Ok(())
    }

    fn present_error(&mut self, number: i32, _message: &str) {
        self.log.lock().unwrap().errors.push(number);
    }
}

/// Decoder over frames 1..=5 counting every header read and row decode.
/// Samples hold `frame * 1000 + y`.
pub struct CountingDecoder {
    width: i32,
    height: i32,
    block: i32,
    scanlines: bool,
    fail: bool,
    headers: AtomicUsize,
    full: AtomicUsize,
    per_row: Mutex<HashMap<(i32, i32), usize>>,
}

impl CountingDecoder {
    pub fn new(width: i32, height: i32) -> Self {
        Self {
            width,
            height,
            block: 1,
            scanlines: true,
            fail: false,
            headers: AtomicUsize::new(0),
            full: AtomicUsize::new(0),
            per_row: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_block(mut self, rows: i32) -> Self {
        self.block = rows;
        self
    }

    pub fn full_frame_only(mut self) -> Self {
        self.scanlines = false;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn headers(&self) -> usize {
        self.headers.load(Ordering::SeqCst)
    }

    pub fn full_decodes(&self) -> usize {
        self.full.load(Ordering::SeqCst)
    }

    /// Total row decodes.
    pub fn decoded(&self) -> usize {
        self.per_row.lock().unwrap().values().sum()
    }

    pub fn max_decodes_per_row(&self) -> usize {
        self.per_row.lock().unwrap().values().copied().max().unwrap_or(0)
    }
}

impl Decoder for CountingDecoder {
    fn identity(&self, frame: i32) -> String {
        format!("counting.{:04}.raw", frame)
    }

    fn frame_range(&self) -> FrameRange {
        FrameRange::new(1, 5)
    }

    fn header(&self, _frame: i32) -> Result<SourceHeader, DecodeError> {
        self.headers.fetch_add(1, Ordering::SeqCst);
        Ok(SourceHeader { format: Region::with_size(self.width, self.height), channels: ChannelSet::RGBA })
    }

    fn supports_scanlines(&self) -> bool {
        self.scanlines
    }

    fn rows_per_block(&self) -> i32 {
        self.block
    }

    fn decode_rows(
        &self,
        frame: i32,
        header: &SourceHeader,
        rows: &BTreeSet<i32>,
    ) -> Result<Vec<Row>, DecodeError> {
        if self.fail {
            return Err(DecodeError::Data { identity: self.identity(frame), reason: "corrupt chunk".into() });
        }
        let mut counts = self.per_row.lock().unwrap();
        Ok(rows
            .iter()
            .map(|y| {
                *counts.entry((frame, *y)).or_insert(0) += 1;
                let mut row = Row::new(*y, header.format.x, header.format.r, header.channels);
                for ch in header.channels.iter() {
                    row.fill(ch, (frame * 1000 + y) as f32);
                }
                row
            })
            .collect())
    }

    fn decode_full(&self, frame: i32, header: &SourceHeader) -> Result<Vec<Row>, DecodeError> {
        self.full.fetch_add(1, Ordering::SeqCst);
        let all = (header.format.y..header.format.t).collect::<BTreeSet<_>>();
        self.decode_rows(frame, header, &all)
    }
}
