//! Dag - sorted evaluation plan for one output node.
//!
//! Built from a [`NodeGraph`] by walking inputs upstream from the sink.
//! Holds the distinct reachable nodes, their source→sink order, the set of
//! sources, and the results of the validation pass (frame ranges, node
//! infos, request hints). Nodes are shared `Arc`s; the graph owns them.
//!
//! Lifecycle: `reset_and_sort` on every topology change, `validate(false)`
//! when playback starts, `validate(true)` before each frame.

use log::{debug, trace, warn};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

use crate::entities::error::{RowError, ValidationError};
use crate::entities::frame::{FrameRange, Row};
use crate::entities::graph::NodeGraph;
use crate::entities::node::{Node, NodeId, NodeInfo, RequestHints, RowContext, RowFetch, RowRequest};
use crate::entities::output::OutputKind;

/// Topology error. Fatal to the rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DagError {
    #[error("no output node is set")]
    NoSink,

    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("cycle detected through node `{name}` ({node})")]
    Cycle { node: NodeId, name: String },
}

struct DagNode {
    node: Arc<dyn Node>,
    inputs: Vec<Option<NodeId>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    OnStack,
    Done,
}

/// Evaluation plan for one sink.
pub struct Dag {
    sink: Option<NodeId>,
    output: OutputKind,
    nodes: HashMap<NodeId, DagNode>,
    sorted: Vec<NodeId>,
    sources: Vec<NodeId>,
    ranges: HashMap<NodeId, FrameRange>,
    infos: HashMap<NodeId, NodeInfo>,
    hints: HashMap<NodeId, RequestHints>,
    /// Union of all source ranges.
    range: Option<FrameRange>,
    /// What the output wants from the sink. Empty fields mean "everything".
    request: RequestHints,
    version: u64,
}

impl Default for Dag {
    fn default() -> Self {
        Self::new()
    }
}

impl Dag {
    /// Not-built DAG: every accessor returns empty/zero.
    pub fn new() -> Self {
        Self {
            sink: None,
            output: OutputKind::Viewer,
            nodes: HashMap::new(),
            sorted: Vec::new(),
            sources: Vec::new(),
            ranges: HashMap::new(),
            infos: HashMap::new(),
            hints: HashMap::new(),
            range: None,
            request: RequestHints::default(),
            version: 0,
        }
    }

    /// Build and sort in one go.
    pub fn build(graph: &NodeGraph, sink: NodeId, output: OutputKind) -> Result<Self, DagError> {
        let mut dag = Self::new();
        dag.reset_and_sort(graph, Some(sink), output)?;
        Ok(dag)
    }

    /// Drop all state; the DAG becomes "not built".
    pub fn reset(&mut self) {
        let request = self.request;
        *self = Self::new();
        self.request = request;
    }

    /// Rediscover nodes from `sink` and sort them.
    ///
    /// On error the DAG is left reset, with no partial sorted state.
    pub fn reset_and_sort(
        &mut self,
        graph: &NodeGraph,
        sink: Option<NodeId>,
        output: OutputKind,
    ) -> Result<(), DagError> {
        self.reset();
        let sink = sink.ok_or(DagError::NoSink)?;

        let (nodes, discovery) = discover(graph, sink)?;
        let sorted = topological_sort(&nodes, &discovery)?;
        let sources = discovery
            .iter()
            .copied()
            .filter(|id| nodes.get(id).is_some_and(|n| n.node.arity() == 0))
            .collect::<Vec<_>>();

        self.sink = Some(sink);
        self.output = output;
        self.nodes = nodes;
        self.sorted = sorted;
        self.sources = sources;
        self.version = self.compute_version();

        debug!(
            "Dag: sink {} sorted {} nodes, {} sources, version {:016x}",
            sink,
            self.sorted.len(),
            self.sources.len(),
            self.version
        );
        Ok(())
    }

    /// Set what the output needs from the sink (channels, visible region).
    pub fn set_request(&mut self, request: RequestHints) {
        self.request = request;
    }

    /// Metadata pass over the sorted nodes.
    ///
    /// The light pass (`full == false`) resolves frame ranges only. The full
    /// pass also resolves node infos, propagates request hints sink→sources
    /// and refreshes the tree version. Previous results survive a failure.
    pub fn validate(&mut self, full: bool) -> Result<(), ValidationError> {
        if self.sink.is_none() {
            return Err(ValidationError::NotBuilt);
        }

        let mut ranges: HashMap<NodeId, FrameRange> = HashMap::with_capacity(self.sorted.len());
        let mut infos: HashMap<NodeId, NodeInfo> = HashMap::new();

        for id in &self.sorted {
            let Some(dn) = self.nodes.get(id) else { continue };
            let name = dn.node.name();

            let mut input_ids = Vec::with_capacity(dn.inputs.len());
            for (idx, input) in dn.inputs.iter().enumerate() {
                let src = input.ok_or_else(|| ValidationError::MissingInput {
                    node: name.to_string(),
                    input: idx,
                })?;
                input_ids.push(src);
            }

            let in_ranges = input_ids
                .iter()
                .filter_map(|src| ranges.get(src).copied())
                .collect::<Vec<_>>();
            let range = dn.node.frame_range(&in_ranges)?;
            trace!("Dag: `{}` range {}..={}", name, range.first, range.last);
            ranges.insert(*id, range);

            if full {
                let in_infos = input_ids
                    .iter()
                    .filter_map(|src| infos.get(src).copied())
                    .collect::<Vec<_>>();
                let mut info = dn.node.info(&in_infos)?;
                info.range = range;
                infos.insert(*id, info);
            }
        }

        self.range = self
            .sources
            .iter()
            .filter_map(|id| ranges.get(id).copied())
            .reduce(|acc, r| acc.union(&r));
        self.ranges = ranges;

        if full {
            self.infos = infos;
            self.propagate_hints();
            self.version = self.compute_version();
        }
        Ok(())
    }

    /// Reverse walk: each node's hints are the merge of what every consumer asked.
    fn propagate_hints(&mut self) {
        let mut hints: HashMap<NodeId, RequestHints> = HashMap::with_capacity(self.sorted.len());
        let Some(sink) = self.sink else { return };
        let Some(sink_info) = self.infos.get(&sink) else { return };

        let channels = if self.request.channels.is_empty() {
            sink_info.channels
        } else {
            self.request.channels
        };
        let region = if self.request.region.is_empty() {
            sink_info.format
        } else {
            self.request.region.intersect(&sink_info.format)
        };
        hints.insert(sink, RequestHints { channels, region });

        for id in self.sorted.iter().rev() {
            let (Some(dn), Some(own)) = (self.nodes.get(id), hints.get(id).copied()) else {
                continue;
            };
            for (idx, input) in dn.inputs.iter().enumerate() {
                let Some(src) = input else { continue };
                let wanted = dn.node.request(&own, idx);
                hints
                    .entry(*src)
                    .and_modify(|h| *h = h.merge(&wanted))
                    .or_insert(wanted);
            }
        }
        self.hints = hints;
    }

    fn compute_version(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.output.hash(&mut hasher);
        for id in &self.sorted {
            let Some(dn) = self.nodes.get(id) else { continue };
            id.hash(&mut hasher);
            dn.node.node_type().hash(&mut hasher);
            Node::hash(dn.node.as_ref()).hash(&mut hasher);
            dn.inputs.hash(&mut hasher);
        }
        hasher.finish()
    }

    pub fn is_built(&self) -> bool {
        self.sink.is_some()
    }

    pub fn sink(&self) -> Option<NodeId> {
        self.sink
    }

    pub fn output_kind(&self) -> OutputKind {
        self.output
    }

    /// Nodes in source→sink order.
    pub fn sorted(&self) -> &[NodeId] {
        &self.sorted
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = NodeId> + '_ {
        self.sorted.iter().copied()
    }

    /// Nodes in sink→source order.
    pub fn iter_rev(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.sorted.iter().rev().copied()
    }

    pub fn sources(&self) -> &[NodeId] {
        &self.sources
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Option<&Arc<dyn Node>> {
        self.nodes.get(&id).map(|dn| &dn.node)
    }

    pub fn inputs(&self, id: NodeId) -> &[Option<NodeId>] {
        self.nodes.get(&id).map(|dn| dn.inputs.as_slice()).unwrap_or(&[])
    }

    /// Merged range over all sources, after validation.
    pub fn frame_range(&self) -> Option<FrameRange> {
        self.range
    }

    pub fn first_frame(&self) -> i32 {
        self.range.map(|r| r.first).unwrap_or(0)
    }

    pub fn last_frame(&self) -> i32 {
        self.range.map(|r| r.last).unwrap_or(0)
    }

    /// Resolved range of a single node.
    pub fn node_range(&self, id: NodeId) -> Option<FrameRange> {
        self.ranges.get(&id).copied()
    }

    pub fn info(&self, id: NodeId) -> Option<&NodeInfo> {
        self.infos.get(&id)
    }

    pub fn hints(&self, id: NodeId) -> Option<&RequestHints> {
        self.hints.get(&id)
    }

    /// Hash of the resolved topology and node parameters.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Row evaluator bound to an abort flag.
    pub fn evaluator<'a>(&'a self, abort: &'a AtomicBool) -> DagEval<'a> {
        DagEval { dag: self, abort }
    }
}

/// Iterative DFS upstream from `sink`. Returns distinct nodes and discovery order.
fn discover(
    graph: &NodeGraph,
    sink: NodeId,
) -> Result<(HashMap<NodeId, DagNode>, Vec<NodeId>), DagError> {
    let mut nodes = HashMap::new();
    let mut discovery = Vec::new();
    let mut marks: HashMap<NodeId, Mark> = HashMap::new();

    let node = graph.node(sink).ok_or(DagError::UnknownNode(sink))?;
    nodes.insert(
        sink,
        DagNode { node: Arc::clone(node), inputs: graph.inputs(sink).to_vec() },
    );
    discovery.push(sink);
    marks.insert(sink, Mark::OnStack);

    // (node, next input to visit)
    let mut stack = vec![(sink, 0usize)];
    while let Some(top) = stack.last_mut() {
        let (id, idx) = *top;
        top.1 += 1;

        let inputs = graph.inputs(id);
        if idx >= inputs.len() {
            marks.insert(id, Mark::Done);
            stack.pop();
            continue;
        }
        let Some(child) = inputs[idx] else { continue };

        match marks.get(&child) {
            Some(Mark::OnStack) => {
                let name = graph.node(child).map(|n| n.name().to_string()).unwrap_or_default();
                warn!("Dag: cycle through `{}` ({})", name, child);
                return Err(DagError::Cycle { node: child, name });
            }
            Some(Mark::Done) => {}
            None => {
                let node = graph.node(child).ok_or(DagError::UnknownNode(child))?;
                nodes.insert(
                    child,
                    DagNode { node: Arc::clone(node), inputs: graph.inputs(child).to_vec() },
                );
                discovery.push(child);
                marks.insert(child, Mark::OnStack);
                stack.push((child, 0));
            }
        }
    }
    Ok((nodes, discovery))
}

/// Kahn's algorithm: a node is emitted only after all of its inputs.
///
/// Ready nodes are taken FIFO, seeded in discovery order, so ties follow
/// input-declaration order and the result is stable across rebuilds.
fn topological_sort(
    nodes: &HashMap<NodeId, DagNode>,
    discovery: &[NodeId],
) -> Result<Vec<NodeId>, DagError> {
    let mut pending: HashMap<NodeId, usize> = HashMap::with_capacity(nodes.len());
    let mut consumers: HashMap<NodeId, Vec<NodeId>> = HashMap::new();

    for id in discovery {
        let Some(dn) = nodes.get(id) else { continue };
        let mut count = 0;
        for src in dn.inputs.iter().flatten() {
            consumers.entry(*src).or_default().push(*id);
            count += 1;
        }
        pending.insert(*id, count);
    }

    let mut ready: VecDeque<NodeId> = discovery
        .iter()
        .copied()
        .filter(|id| pending.get(id) == Some(&0))
        .collect();
    let mut sorted = Vec::with_capacity(nodes.len());

    while let Some(id) = ready.pop_front() {
        sorted.push(id);
        for consumer in consumers.get(&id).map(Vec::as_slice).unwrap_or(&[]) {
            if let Some(count) = pending.get_mut(consumer) {
                *count -= 1;
                if *count == 0 {
                    ready.push_back(*consumer);
                }
            }
        }
    }

    if sorted.len() != nodes.len() {
        let stuck = discovery
            .iter()
            .copied()
            .find(|id| pending.get(id).is_some_and(|c| *c > 0))
            .ok_or(DagError::NoSink)?;
        let name = nodes.get(&stuck).map(|dn| dn.node.name().to_string()).unwrap_or_default();
        return Err(DagError::Cycle { node: stuck, name });
    }
    Ok(sorted)
}

/// Pull-based row evaluation over a validated [`Dag`].
///
/// Shared read-only by all workers of a frame. The abort flag is checked
/// before every node invocation.
pub struct DagEval<'a> {
    dag: &'a Dag,
    abort: &'a AtomicBool,
}

impl DagEval<'_> {
    /// Evaluate `node` for one row.
    ///
    /// Rows outside the node's propagated region come back zero-filled
    /// without calling the node.
    pub fn pull(&self, id: NodeId, req: &RowRequest) -> Result<Row, RowError> {
        if self.is_aborted() {
            return Err(RowError::Aborted);
        }
        let dn = self.dag.nodes.get(&id).ok_or_else(|| RowError::Failed {
            node: id.to_string(),
            y: req.y,
            reason: "node is not part of the evaluation plan".into(),
        })?;

        let mut req = *req;
        if let Some(hints) = self.dag.hints.get(&id) {
            if !hints.channels.is_empty() {
                req.channels = req.channels.intersection(hints.channels);
            }
            if !hints.region.is_empty() && !hints.region.contains_row(req.y) {
                return Ok(Row::new(req.y, req.x, req.r, req.channels));
            }
        }

        let mut row = Row::new(req.y, req.x, req.r, req.channels);
        let ctx = RowContext::new(self, id, req, self.dag.infos.get(&id));
        match dn.node.render(&ctx, &mut row) {
            Ok(()) => Ok(row),
            Err(_) if self.is_aborted() => Err(RowError::Aborted),
            Err(e) => Err(e.attributed(dn.node.name(), req.y)),
        }
    }
}

impl RowFetch for DagEval<'_> {
    fn fetch(&self, node: NodeId, input: usize, req: &RowRequest) -> Result<Row, RowError> {
        let src = self
            .dag
            .inputs(node)
            .get(input)
            .copied()
            .flatten()
            .ok_or_else(|| RowError::Failed {
                node: self.dag.node(node).map(|n| n.name().to_string()).unwrap_or_default(),
                y: req.y,
                reason: format!("input {} is not connected", input),
            })?;
        self.pull(src, req)
    }

    fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }
}
