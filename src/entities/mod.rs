//! Entities module - graph, nodes and pixel data
//!
//! Everything a render walks over: the user's [`NodeGraph`], the [`Node`]
//! trait and built-in nodes, and the row/frame buffers passed between them.

pub mod effects;
pub mod error;
pub mod frame;
pub mod graph;
pub mod loader;
pub mod node;
pub mod output;
pub mod reader;
pub mod traits;

pub use error::{DecodeError, RowError, ValidationError};
pub use frame::{Channel, ChannelSet, Frame, FrameRange, Region, Row};
pub use graph::{GraphError, NodeGraph};
pub use loader::SequenceDecoder;
pub use node::{Node, NodeCaps, NodeId, NodeInfo, RequestHints, RowContext, RowRequest};
pub use output::{OutputKind, ViewerNode, WriterNode};
pub use reader::{Decoder, ReaderNode, SequenceMask, SourceHeader};
pub use traits::{Claim, FrameKey, OutputSink, ResultCache, ViewKey};
