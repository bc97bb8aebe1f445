//! Constant color generator.

use std::hash::{Hash, Hasher};

use crate::entities::error::{RowError, ValidationError};
use crate::entities::frame::{Channel, ChannelSet, FrameRange, Region, Row};
use crate::entities::node::{Node, NodeInfo, RowContext};

/// Source filling its format with one RGBA color for every frame of `range`.
pub struct ColorNode {
    name: String,
    color: [f32; 4],
    format: Region,
    range: FrameRange,
}

impl ColorNode {
    pub fn new(name: impl Into<String>, color: [f32; 4], width: i32, height: i32) -> Self {
        Self {
            name: name.into(),
            color,
            format: Region::with_size(width, height),
            range: FrameRange::new(1, 1),
        }
    }

    pub fn with_range(mut self, first: i32, last: i32) -> Self {
        self.range = FrameRange::new(first, last);
        self
    }

    pub fn color(&self) -> [f32; 4] {
        self.color
    }
}

impl Node for ColorNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn node_type(&self) -> &'static str {
        "Color"
    }

    fn arity(&self) -> usize {
        0
    }

    fn hash(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.color.map(f32::to_bits).hash(&mut hasher);
        self.format.hash(&mut hasher);
        self.range.hash(&mut hasher);
        hasher.finish()
    }

    fn frame_range(&self, _inputs: &[FrameRange]) -> Result<FrameRange, ValidationError> {
        Ok(self.range)
    }

    fn info(&self, _inputs: &[NodeInfo]) -> Result<NodeInfo, ValidationError> {
        Ok(NodeInfo { range: self.range, format: self.format, channels: ChannelSet::RGBA })
    }

    fn render(&self, ctx: &RowContext<'_>, out: &mut Row) -> Result<(), RowError> {
        if !self.format.contains_row(ctx.y()) {
            return Ok(());
        }
        for ch in Channel::ALL {
            out.fill(ch, self.color[ch.index()]);
        }
        Ok(())
    }
}
