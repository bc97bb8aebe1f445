//! NodeGraph - arena of nodes and their input edges.
//!
//! This is the graph-editing side: nodes are added and wired here, and the
//! engine snapshots the reachable part into a [`Dag`](crate::core::dag::Dag)
//! for one output. Edges are plain `NodeId` indices. `connect` lets the
//! graph temporarily contain cycles (DAG construction rejects them);
//! `try_connect` refuses them up front.

use log::{debug, trace};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

use super::node::{Node, NodeId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("node {node} has no input {input}")]
    NoSuchInput { node: NodeId, input: usize },

    #[error("connecting {src} to {dst} would create a cycle")]
    Cycle { src: NodeId, dst: NodeId },
}

struct Slot {
    node: Arc<dyn Node>,
    inputs: Vec<Option<NodeId>>,
}

/// Arena-allocated node graph.
#[derive(Default)]
pub struct NodeGraph {
    slots: Vec<Option<Slot>>,
    /// Bumped on every structural edit.
    topology_version: u64,
}

impl NodeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<N: Node + 'static>(&mut self, node: N) -> NodeId {
        self.add_shared(Arc::new(node))
    }

    /// Add a node the caller keeps a handle to.
    pub fn add_shared(&mut self, node: Arc<dyn Node>) -> NodeId {
        let id = NodeId(self.slots.len());
        debug!("Graph: add {} `{}` ({})", id, node.name(), node.node_type());
        let inputs = vec![None; node.arity()];
        self.slots.push(Some(Slot { node, inputs }));
        self.topology_version += 1;
        id
    }

    /// Remove a node and every edge pointing at it.
    pub fn remove(&mut self, id: NodeId) -> Option<Arc<dyn Node>> {
        let slot = self.slots.get_mut(id.0)?.take()?;
        for other in self.slots.iter_mut().flatten() {
            for input in other.inputs.iter_mut() {
                if *input == Some(id) {
                    *input = None;
                }
            }
        }
        self.topology_version += 1;
        debug!("Graph: removed {} `{}`", id, slot.node.name());
        Some(slot.node)
    }

    /// Wire output of `src` into input `input` of `dst`, replacing any edge there.
    pub fn connect(&mut self, src: NodeId, dst: NodeId, input: usize) -> Result<(), GraphError> {
        if self.node(src).is_none() {
            return Err(GraphError::UnknownNode(src));
        }
        let slot = self.slot_mut(dst)?;
        let edge = slot
            .inputs
            .get_mut(input)
            .ok_or(GraphError::NoSuchInput { node: dst, input })?;
        *edge = Some(src);
        self.topology_version += 1;
        trace!("Graph: {} -> {}[{}]", src, dst, input);
        Ok(())
    }

    /// [`connect`](Self::connect) that refuses edges closing a cycle.
    pub fn try_connect(&mut self, src: NodeId, dst: NodeId, input: usize) -> Result<(), GraphError> {
        if self.node(src).is_some() && self.node(dst).is_some() && self.creates_cycle(src, dst) {
            debug!("Graph: refused {} -> {}[{}], cycle", src, dst, input);
            return Err(GraphError::Cycle { src, dst });
        }
        self.connect(src, dst, input)
    }

    pub fn disconnect(&mut self, dst: NodeId, input: usize) -> Result<Option<NodeId>, GraphError> {
        let slot = self.slot_mut(dst)?;
        let edge = slot
            .inputs
            .get_mut(input)
            .ok_or(GraphError::NoSuchInput { node: dst, input })?;
        let old = edge.take();
        self.topology_version += 1;
        Ok(old)
    }

    pub fn node(&self, id: NodeId) -> Option<&Arc<dyn Node>> {
        self.slot(id).map(|s| &s.node)
    }

    /// Ordered inputs of `id`; empty for unknown nodes.
    pub fn inputs(&self, id: NodeId) -> &[Option<NodeId>] {
        self.slot(id).map(|s| s.inputs.as_slice()).unwrap_or(&[])
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| NodeId(i))
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn topology_version(&self) -> u64 {
        self.topology_version
    }

    /// Would wiring `src` into `dst` close a cycle?
    ///
    /// DFS upstream from `src`; a cycle exists if `dst` is reachable.
    pub fn creates_cycle(&self, src: NodeId, dst: NodeId) -> bool {
        if src == dst {
            return true;
        }
        let mut stack = vec![src];
        let mut visited = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == dst {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            stack.extend(self.inputs(current).iter().flatten().copied());
        }
        false
    }

    fn slot(&self, id: NodeId) -> Option<&Slot> {
        self.slots.get(id.0).and_then(|s| s.as_ref())
    }

    fn slot_mut(&mut self, id: NodeId) -> Result<&mut Slot, GraphError> {
        self.slots
            .get_mut(id.0)
            .and_then(|s| s.as_mut())
            .ok_or(GraphError::UnknownNode(id))
    }
}
