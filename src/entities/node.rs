//! Node trait - base interface for all compute units in the graph.
//!
//! Nodes are the building blocks of the processing graph:
//! - sources (zero inputs): readers, generators
//! - filters: pull input rows and transform them
//! - sinks: viewer and writer outputs terminating a DAG
//!
//! Evaluation is pull-based and row-granular: the scheduler asks the sink
//! for one scanline, the sink asks its inputs through [`RowContext::input`],
//! and so on up to the sources. `render` is called concurrently for
//! different rows and must not keep per-row state in `&self`.

use serde::{Deserialize, Serialize};

use super::error::{DecodeError, RowError, ValidationError};
use super::frame::{ChannelSet, FrameRange, Region, Row};

/// Arena index of a node inside a [`NodeGraph`](super::graph::NodeGraph).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Capability flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeCaps {
    pub source: bool,
    pub sink: bool,
    /// Node can produce a sub-rectangle of its format on request.
    pub partial_region: bool,
}

/// Metadata resolved for a node by the full validation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    pub range: FrameRange,
    /// Data window.
    pub format: Region,
    pub channels: ChannelSet,
}

/// What downstream needs from a node: flows sink → sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestHints {
    pub channels: ChannelSet,
    pub region: Region,
}

impl RequestHints {
    pub fn merge(&self, other: &RequestHints) -> RequestHints {
        RequestHints {
            channels: self.channels.union(other.channels),
            region: self.region.union(&other.region),
        }
    }
}

/// Pulls rows from upstream nodes. Implemented by the DAG.
pub trait RowFetch: Sync {
    /// Evaluate input `input` of `node` for the row described by `req`.
    fn fetch(&self, node: NodeId, input: usize, req: &RowRequest) -> Result<Row, RowError>;

    fn is_aborted(&self) -> bool;
}

/// Row coordinates passed down the pull chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowRequest {
    pub frame: i32,
    pub y: i32,
    pub x: i32,
    pub r: i32,
    pub channels: ChannelSet,
}

/// Context for one `render` call.
pub struct RowContext<'a> {
    fetch: &'a dyn RowFetch,
    node: NodeId,
    req: RowRequest,
    info: Option<&'a NodeInfo>,
}

impl<'a> RowContext<'a> {
    pub fn new(
        fetch: &'a dyn RowFetch,
        node: NodeId,
        req: RowRequest,
        info: Option<&'a NodeInfo>,
    ) -> Self {
        Self { fetch, node, req, info }
    }

    pub fn frame(&self) -> i32 {
        self.req.frame
    }

    pub fn y(&self) -> i32 {
        self.req.y
    }

    pub fn request(&self) -> &RowRequest {
        &self.req
    }

    /// Resolved metadata of the node being rendered (full validation only).
    pub fn info(&self) -> Option<&NodeInfo> {
        self.info
    }

    /// Pull the same row from input `idx`.
    pub fn input(&self, idx: usize) -> Result<Row, RowError> {
        self.fetch.fetch(self.node, idx, &self.req)
    }

    /// Pull a different scanline (or channel set) from input `idx`.
    pub fn input_row(&self, idx: usize, y: i32, channels: ChannelSet) -> Result<Row, RowError> {
        let req = RowRequest { y, channels, ..self.req };
        self.fetch.fetch(self.node, idx, &req)
    }

    pub fn is_aborted(&self) -> bool {
        self.fetch.is_aborted()
    }
}

/// Base trait for all node types.
pub trait Node: Send + Sync {
    /// Display name of the node
    fn name(&self) -> &str;

    /// Type identifier string ("Reader", "Brightness", ...)
    fn node_type(&self) -> &'static str;

    /// Fixed number of ordered inputs.
    fn arity(&self) -> usize;

    fn caps(&self) -> NodeCaps {
        NodeCaps {
            source: self.arity() == 0,
            ..Default::default()
        }
    }

    /// Hash of the parameters affecting output. Part of the frame key.
    fn hash(&self) -> u64 {
        0
    }

    /// Per-frame preparation of source nodes (header read), run before
    /// full validation.
    fn prepare(&self, _frame: i32) -> Result<(), DecodeError> {
        Ok(())
    }

    /// Frame range given the input ranges. Default: union of inputs.
    fn frame_range(&self, inputs: &[FrameRange]) -> Result<FrameRange, ValidationError> {
        let mut iter = inputs.iter();
        let first = iter.next().ok_or_else(|| ValidationError::NoFrameRange {
            node: self.name().to_string(),
        })?;
        Ok(iter.fold(*first, |acc, r| acc.union(r)))
    }

    /// Full metadata given the input infos. Default: merge of inputs.
    fn info(&self, inputs: &[NodeInfo]) -> Result<NodeInfo, ValidationError> {
        merge_infos(self.name(), inputs)
    }

    /// Hints to send to input `input` given what downstream asked of this node.
    fn request(&self, hints: &RequestHints, _input: usize) -> RequestHints {
        *hints
    }

    /// Compute one row into `out`. `out` is pre-sized to the requested span
    /// and channels and zero-filled.
    fn render(&self, ctx: &RowContext<'_>, out: &mut Row) -> Result<(), RowError>;
}

/// Union of frame ranges, formats and channels of all inputs.
pub fn merge_infos(name: &str, inputs: &[NodeInfo]) -> Result<NodeInfo, ValidationError> {
    let mut iter = inputs.iter();
    let first = *iter.next().ok_or_else(|| ValidationError::NoFrameRange {
        node: name.to_string(),
    })?;
    Ok(iter.fold(first, |acc, info| NodeInfo {
        range: acc.range.union(&info.range),
        format: acc.format.union(&info.format),
        channels: acc.channels.union(info.channels),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_infos() {
        let a = NodeInfo {
            range: FrameRange::new(10, 50),
            format: Region::with_size(100, 50),
            channels: ChannelSet::RGB,
        };
        let b = NodeInfo {
            range: FrameRange::new(20, 40),
            format: Region::with_size(50, 80),
            channels: ChannelSet::RGBA,
        };
        let merged = merge_infos("merge", &[a, b]).unwrap();
        assert_eq!(merged.range, FrameRange::new(10, 50));
        assert_eq!(merged.format, Region::with_size(100, 80));
        assert_eq!(merged.channels, ChannelSet::RGBA);
        assert!(merge_infos("empty", &[]).is_err());
    }

    #[test]
    fn test_row_error_attribution() {
        let err = RowError::failed("bad pixel").attributed("blur", 7);
        assert_eq!(
            err,
            RowError::Failed { node: "blur".into(), y: 7, reason: "bad pixel".into() }
        );
        // Upstream attribution wins
        let err = err.attributed("viewer", 7);
        assert!(matches!(err, RowError::Failed { ref node, .. } if node == "blur"));
        assert_eq!(RowError::Aborted.attributed("x", 0), RowError::Aborted);
    }
}
