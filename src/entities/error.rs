//! Error types raised by nodes during validation, preparation and row evaluation.

use thiserror::Error;

/// Metadata pass failure. Non-fatal: the engine refuses to start the frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("no output node is set")]
    NotBuilt,

    #[error("node `{node}`: input {input} is not connected")]
    MissingInput { node: String, input: usize },

    #[error("node `{node}` has no frame range")]
    NoFrameRange { node: String },

    #[error("node `{node}`: input frame ranges do not overlap")]
    DisjointRanges { node: String },

    #[error("node `{node}`: {reason}")]
    Invalid { node: String, reason: String },
}

/// Outcome of a failed row evaluation.
///
/// Nodes create failures with [`RowError::failed`]; the evaluator fills in
/// the node name and row on the way out.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowError {
    #[error("row evaluation aborted")]
    Aborted,

    #[error("node `{node}` failed on row {y}: {reason}")]
    Failed { node: String, y: i32, reason: String },
}

impl RowError {
    pub fn failed(reason: impl Into<String>) -> Self {
        RowError::Failed {
            node: String::new(),
            y: 0,
            reason: reason.into(),
        }
    }

    /// Attach node name and row if not already attributed upstream.
    pub(crate) fn attributed(self, name: &str, row: i32) -> Self {
        match self {
            RowError::Failed { node, reason, .. } if node.is_empty() => RowError::Failed {
                node: name.to_string(),
                y: row,
                reason,
            },
            other => other,
        }
    }
}

/// Source read failure (header or sample data).
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("cannot read header for {identity}: {reason}")]
    Header { identity: String, reason: String },

    #[error("decode of {identity} failed: {reason}")]
    Data { identity: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
