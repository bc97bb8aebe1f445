//! Output nodes terminating a DAG: the interactive viewer and the file writer.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use super::error::{RowError, ValidationError};
use super::frame::{ChannelSet, FrameRange, Row};
use super::node::{Node, NodeCaps, NodeInfo, RequestHints, RowContext};

/// How the engine drives an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OutputKind {
    /// Interactive: paced playback, looping, view-dependent rows.
    #[default]
    Viewer,
    /// Batch: first to last frame once, every row.
    Writer,
}

/// Interactive viewer: passes its input through.
pub struct ViewerNode {
    name: String,
}

impl ViewerNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Node for ViewerNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn node_type(&self) -> &'static str {
        "Viewer"
    }

    fn arity(&self) -> usize {
        1
    }

    fn caps(&self) -> NodeCaps {
        NodeCaps { source: false, sink: true, partial_region: true }
    }

    fn render(&self, ctx: &RowContext<'_>, out: &mut Row) -> Result<(), RowError> {
        let input = ctx.input(0)?;
        out.copy_from(&input);
        Ok(())
    }
}

/// File writer: optional frame range override and channel selection.
pub struct WriterNode {
    name: String,
    range: Option<FrameRange>,
    channels: ChannelSet,
}

impl WriterNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), range: None, channels: ChannelSet::RGBA }
    }

    /// Write only `first..=last`, clipped to what the inputs provide.
    pub fn with_range(mut self, first: i32, last: i32) -> Self {
        self.range = Some(FrameRange::new(first, last));
        self
    }

    pub fn with_channels(mut self, channels: ChannelSet) -> Self {
        self.channels = channels;
        self
    }

    pub fn channels(&self) -> ChannelSet {
        self.channels
    }
}

impl Node for WriterNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn node_type(&self) -> &'static str {
        "Writer"
    }

    fn arity(&self) -> usize {
        1
    }

    fn caps(&self) -> NodeCaps {
        NodeCaps { source: false, sink: true, partial_region: false }
    }

    fn hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.range.hash(&mut hasher);
        self.channels.hash(&mut hasher);
        hasher.finish()
    }

    fn frame_range(&self, inputs: &[FrameRange]) -> Result<FrameRange, ValidationError> {
        let input = inputs.first().ok_or_else(|| ValidationError::NoFrameRange {
            node: self.name.clone(),
        })?;
        match self.range {
            Some(own) => own
                .intersection(input)
                .ok_or_else(|| ValidationError::DisjointRanges { node: self.name.clone() }),
            None => Ok(*input),
        }
    }

    fn info(&self, inputs: &[NodeInfo]) -> Result<NodeInfo, ValidationError> {
        let input = inputs.first().ok_or_else(|| ValidationError::NoFrameRange {
            node: self.name.clone(),
        })?;
        Ok(NodeInfo { channels: input.channels.intersection(self.channels), ..*input })
    }

    fn request(&self, hints: &RequestHints, _input: usize) -> RequestHints {
        RequestHints { channels: hints.channels.intersection(self.channels), ..*hints }
    }

    fn render(&self, ctx: &RowContext<'_>, out: &mut Row) -> Result<(), RowError> {
        let input = ctx.input(0)?;
        out.copy_from(&input);
        Ok(())
    }
}
