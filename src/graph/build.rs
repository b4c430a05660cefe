use crate::{
    config::ConfigError,
    graph::Node,
    task::SuspendableTask,
    types::{HashSet, IndexSet, NodeId},
};
use rustc_hash::FxBuildHasher;
use std::io;
use thiserror::Error;
use tracing::trace;

/// Largest number of nodes a single node set may hold.
///
/// Keeps every prerequisite count representable next to the completion
/// sentinel.
const MAX_NODES: usize = i32::MAX as usize;

/// Error kind for task graph construction and use.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GraphError {
    /// A constructor-time parameter is out of range.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The node id was not produced by this graph's current node set.
    #[error("node {0} does not belong to this graph")]
    UnknownNode(NodeId),
    /// The edge would make the dependency relation cyclic.
    #[error("dependency {upstream} -> {downstream} would close a cycle")]
    Cycle {
        /// Node that must finish first.
        upstream: NodeId,
        /// Node that waits for `upstream`.
        downstream: NodeId,
    },
    /// The current node set has already been executed; call `clear` first.
    #[error("node set has already been executed")]
    AlreadyExecuted,
    /// The node set cannot address more nodes.
    #[error("node set is full")]
    TooManyNodes,
    /// The process-wide scheduler was started twice.
    #[error("process-wide scheduler is already running")]
    AlreadyRunning,
    /// The process-wide scheduler has not been started.
    #[error("process-wide scheduler is not running")]
    NotRunning,
    /// The scheduler stopped accepting work.
    #[error("scheduler has shut down")]
    ShutDown,
    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread")]
    Spawn(#[source] io::Error),
    /// The DOT dump could not be written.
    #[error("failed to write graph dump")]
    Dump(#[from] io::Error),
}

/// A node that has not been handed to the workers yet.
pub(super) struct PendingNode {
    pub(super) label: String,
    pub(super) task: SuspendableTask,
    /// Number of incoming edges.
    pub(super) prereq: u32,
    /// Downstream nodes in insertion order.
    pub(super) dependents: IndexSet<NodeId>,
}

/// Mutable node set of a graph that has not been executed yet.
#[derive(Default)]
pub(super) struct NodeSetBuilder {
    nodes: Vec<PendingNode>,
}

impl NodeSetBuilder {
    pub(super) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(super) fn nodes(&self) -> &[PendingNode] {
        &self.nodes
    }

    pub(super) fn into_nodes(self) -> Vec<PendingNode> {
        self.nodes
    }

    pub(super) fn add(&mut self, node: Node) -> Result<NodeId, GraphError> {
        if self.nodes.len() >= MAX_NODES {
            return Err(GraphError::TooManyNodes);
        }
        let id = NodeId(self.nodes.len().try_into().expect("NodeSetBuilder::add"));
        let Node { label, task } = node;
        self.nodes.push(PendingNode {
            label,
            task,
            prereq: 0,
            dependents: IndexSet::with_hasher(FxBuildHasher),
        });
        Ok(id)
    }

    /// Registers `upstream -> downstream`.
    ///
    /// Duplicate edges are ignored. An edge that would let `downstream` reach
    /// `upstream` is rejected, so the node set stays acyclic.
    pub(super) fn connect(&mut self, upstream: NodeId, downstream: NodeId) -> Result<(), GraphError> {
        for id in [upstream, downstream] {
            if id.index() >= self.nodes.len() {
                return Err(GraphError::UnknownNode(id));
            }
        }
        if self.nodes[upstream.index()].dependents.contains(&downstream) {
            return Ok(());
        }
        if self.reaches(downstream, upstream) {
            return Err(GraphError::Cycle {
                upstream,
                downstream,
            });
        }
        let inserted = self.nodes[upstream.index()].dependents.insert(downstream);
        assert!(inserted, "NodeSetBuilder::connect: [1]");
        let prereq = &mut self.nodes[downstream.index()].prereq;
        *prereq = prereq.checked_add(1).expect("NodeSetBuilder::connect: [2]");
        trace!(%upstream, %downstream, "dependency added");
        Ok(())
    }

    /// Depth-first search along dependent edges.
    fn reaches(&self, from: NodeId, to: NodeId) -> bool {
        if from == to {
            return true;
        }
        let mut visited = HashSet::with_hasher(FxBuildHasher);
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            for &next in &self.nodes[id.index()].dependents {
                if next == to {
                    return true;
                }
                if visited.insert(next) {
                    stack.push(next);
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder_with(count: usize) -> (NodeSetBuilder, Vec<NodeId>) {
        let mut builder = NodeSetBuilder::default();
        let ids = (0..count)
            .map(|i| builder.add(Node::from_fn(format!("n{i}"), || {})).unwrap())
            .collect();
        (builder, ids)
    }

    #[test]
    fn counts_prerequisites_and_keeps_dependent_order() {
        let (mut builder, ids) = builder_with(4);
        builder.connect(ids[0], ids[3]).unwrap();
        builder.connect(ids[0], ids[1]).unwrap();
        builder.connect(ids[2], ids[1]).unwrap();
        // Duplicate edges are idempotent.
        builder.connect(ids[0], ids[1]).unwrap();

        let nodes = builder.nodes();
        assert_eq!(nodes[0].prereq, 0);
        assert_eq!(nodes[1].prereq, 2);
        assert_eq!(nodes[3].prereq, 1);
        let dependents: Vec<_> = nodes[0].dependents.iter().copied().collect();
        assert_eq!(dependents, vec![ids[3], ids[1]]);
    }

    #[test]
    fn rejects_cycles_and_self_edges() {
        let (mut builder, ids) = builder_with(3);
        builder.connect(ids[0], ids[1]).unwrap();
        builder.connect(ids[1], ids[2]).unwrap();

        assert!(matches!(
            builder.connect(ids[2], ids[0]),
            Err(GraphError::Cycle { upstream, downstream }) if upstream == ids[2] && downstream == ids[0]
        ));
        assert!(matches!(
            builder.connect(ids[1], ids[1]),
            Err(GraphError::Cycle { .. })
        ));
        // The rejected edges left no trace.
        assert_eq!(builder.nodes()[0].prereq, 0);
        assert!(builder.nodes()[2].dependents.is_empty());
    }

    #[test]
    fn rejects_unknown_nodes() {
        let (mut builder, ids) = builder_with(1);
        let stranger = NodeId(7);
        assert!(matches!(
            builder.connect(ids[0], stranger),
            Err(GraphError::UnknownNode(id)) if id == stranger
        ));
    }
}
