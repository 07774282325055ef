//! Graph node store and the sealed topology.
//!
//! Nodes live in an arena addressed by [`NodeId`] and store parent
//! identities only; the child index is computed when the graph is sealed.
//! A sealed [`Topology`] is immutable and can be handed to the external
//! runtime as a shared value.

use std::collections::VecDeque;
use std::fmt;

use fxhash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use super::error::TopologyError;
use super::node::{NodeKind, SinkTarget, TimestampPolicy, TopicSubscription};

/// Unique identifier for a node in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// A node in the processing graph.
///
/// Created by a DSL operator call; immutable once created; never deleted.
#[derive(Debug)]
pub struct Node {
    /// Unique node identifier.
    pub id: NodeId,
    /// Stable name, user-supplied or auto-generated, unique per assembly.
    pub name: String,
    /// Upstream parents in attachment order. `SmallVec` avoids heap alloc
    /// for the common one- and two-parent cases.
    pub parents: SmallVec<[NodeId; 2]>,
    /// Node payload.
    pub kind: NodeKind,
}

/// The mutable graph node store used during assembly.
///
/// Owned exclusively by the single assembling thread; sealed into an
/// immutable [`Topology`] once assembly finishes.
#[derive(Debug, Default)]
pub struct TopologyGraph {
    /// Arena of nodes; `NodeId` is the index.
    nodes: Vec<Node>,
    /// Name -> `NodeId` index for uniqueness and lookups.
    name_index: FxHashMap<String, NodeId>,
}

impl TopologyGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node with the given parents.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::DuplicateName`] if the name is taken,
    /// [`TopologyError::NodeNotFound`] if a parent does not exist, and
    /// [`TopologyError::InvalidArgument`] if a Source carries parents or a
    /// non-Source carries none.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        kind: NodeKind,
        parents: &[NodeId],
    ) -> Result<NodeId, TopologyError> {
        let name = name.into();
        if self.name_index.contains_key(&name) {
            return Err(TopologyError::DuplicateName(name));
        }
        for parent in parents {
            if parent.0 as usize >= self.nodes.len() {
                return Err(TopologyError::NodeNotFound(format!("{parent}")));
            }
        }
        if kind.is_source() && !parents.is_empty() {
            return Err(TopologyError::InvalidArgument(format!(
                "source node '{name}' cannot have parents"
            )));
        }
        if !kind.is_source() && parents.is_empty() {
            return Err(TopologyError::InvalidArgument(format!(
                "non-source node '{name}' requires at least one parent"
            )));
        }

        let id = NodeId(u32::try_from(self.nodes.len()).map_err(|_| {
            TopologyError::InvalidArgument("node arena exhausted".to_string())
        })?);
        self.nodes.push(Node {
            id,
            name: name.clone(),
            parents: SmallVec::from_slice(parents),
            kind,
        });
        self.name_index.insert(name, id);
        Ok(id)
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns a node by id.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0 as usize)
    }

    /// Returns the `NodeId` registered under a name.
    #[must_use]
    pub fn node_id_by_name(&self, name: &str) -> Option<NodeId> {
        self.name_index.get(name).copied()
    }

    /// Returns true if a node with this name exists.
    #[must_use]
    pub fn contains_name(&self, name: &str) -> bool {
        self.name_index.contains_key(name)
    }

    /// Seals the graph into an immutable [`Topology`].
    ///
    /// Verifies acyclicity via Kahn's algorithm, computes the topological
    /// execution order, and builds the derived child index.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::EmptyTopology`] if no nodes were added and
    /// [`TopologyError::CycleDetected`] if the graph contains a cycle.
    pub fn seal(self) -> Result<Topology, TopologyError> {
        if self.nodes.is_empty() {
            return Err(TopologyError::EmptyTopology);
        }

        let node_count = self.nodes.len();
        let mut children: Vec<Vec<NodeId>> = vec![Vec::new(); node_count];
        for node in &self.nodes {
            for parent in &node.parents {
                children[parent.0 as usize].push(node.id);
            }
        }

        let order = kahn_topo_sort(&self.nodes, &children);
        if order.len() < node_count {
            let ordered: FxHashSet<NodeId> = order.iter().copied().collect();
            let offending = self
                .nodes
                .iter()
                .find(|n| !ordered.contains(&n.id))
                .map_or_else(|| "unknown".to_string(), |n| n.name.clone());
            return Err(TopologyError::CycleDetected(offending));
        }

        let mut sources = Vec::new();
        let mut sinks = Vec::new();
        for node in &self.nodes {
            if node.kind.is_source() {
                sources.push(node.id);
            } else if node.kind.is_sink() {
                sinks.push(node.id);
            }
        }

        tracing::debug!(
            nodes = node_count,
            sources = sources.len(),
            sinks = sinks.len(),
            "sealed topology"
        );

        Ok(Topology {
            nodes: self.nodes,
            name_index: self.name_index,
            children,
            execution_order: order,
            sources,
            sinks,
        })
    }
}

/// Kahn's algorithm over the parent-only adjacency.
///
/// Initial zero-in-degree nodes and successors are visited in `NodeId`
/// order for deterministic results.
fn kahn_topo_sort(nodes: &[Node], children: &[Vec<NodeId>]) -> Vec<NodeId> {
    let mut in_degree: Vec<usize> = nodes.iter().map(|n| n.parents.len()).collect();

    let mut queue: VecDeque<NodeId> = nodes
        .iter()
        .filter(|n| n.parents.is_empty())
        .map(|n| n.id)
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(id) = queue.pop_front() {
        order.push(id);
        let mut ready: Vec<NodeId> = Vec::new();
        for &child in &children[id.0 as usize] {
            let deg = &mut in_degree[child.0 as usize];
            *deg = deg.saturating_sub(1);
            if *deg == 0 {
                ready.push(child);
            }
        }
        ready.sort_unstable();
        queue.extend(ready);
    }
    order
}

/// The sealed, immutable processing topology.
///
/// Exposes, for the consuming runtime: Source nodes with their
/// subscriptions and timestamp policies, Sink nodes with their static or
/// per-record destinations, and the processor graph with declared
/// state-store dependencies.
#[derive(Debug)]
pub struct Topology {
    nodes: Vec<Node>,
    name_index: FxHashMap<String, NodeId>,
    children: Vec<Vec<NodeId>>,
    execution_order: Vec<NodeId>,
    sources: Vec<NodeId>,
    sinks: Vec<NodeId>,
}

impl Topology {
    /// Returns the number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns a node by id.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0 as usize)
    }

    /// Returns a node by name.
    #[must_use]
    pub fn node_by_name(&self, name: &str) -> Option<&Node> {
        self.name_index.get(name).and_then(|id| self.node(*id))
    }

    /// Iterates over all nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// Returns all Source node ids.
    #[must_use]
    pub fn sources(&self) -> &[NodeId] {
        &self.sources
    }

    /// Returns all Sink node ids.
    #[must_use]
    pub fn sinks(&self) -> &[NodeId] {
        &self.sinks
    }

    /// Returns the derived children of a node.
    #[must_use]
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.children
            .get(id.0 as usize)
            .map_or(&[], Vec::as_slice)
    }

    /// Returns nodes in topological execution order (dependencies first).
    #[must_use]
    pub fn execution_order(&self) -> &[NodeId] {
        &self.execution_order
    }

    /// Source nodes subscribed to the given exact topic name.
    pub fn sources_for_topic<'a>(&'a self, topic: &'a str) -> impl Iterator<Item = &'a Node> {
        self.sources.iter().filter_map(move |id| {
            let node = self.node(*id)?;
            match &node.kind {
                NodeKind::Source { subscription, .. } if subscription.contains(topic) => Some(node),
                _ => None,
            }
        })
    }

    /// Names of hidden intermediate topics synthesized during assembly.
    #[must_use]
    pub fn internal_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .nodes
            .iter()
            .filter_map(|node| match &node.kind {
                NodeKind::Sink {
                    target: SinkTarget::Static(topic),
                    internal: true,
                    ..
                } => Some(topic.clone()),
                _ => None,
            })
            .collect();
        topics.sort();
        topics.dedup();
        topics
    }

    /// All state-store names declared by processor nodes.
    #[must_use]
    pub fn store_names(&self) -> Vec<String> {
        let mut stores: Vec<String> = self
            .nodes
            .iter()
            .filter_map(|node| match &node.kind {
                NodeKind::Processor { stores, .. } => Some(stores.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        stores.sort();
        stores.dedup();
        stores
    }

    /// The timestamp policy of a Source node, if `id` names one.
    #[must_use]
    pub fn timestamp_policy(&self, id: NodeId) -> Option<TimestampPolicy> {
        match &self.node(id)?.kind {
            NodeKind::Source {
                timestamp_policy, ..
            } => Some(*timestamp_policy),
            _ => None,
        }
    }

    /// The subscription of a Source node, if `id` names one.
    #[must_use]
    pub fn subscription(&self, id: NodeId) -> Option<&TopicSubscription> {
        match &self.node(id)?.kind {
            NodeKind::Source { subscription, .. } => Some(subscription),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecPair;

    fn source_kind(topic: &str) -> NodeKind {
        NodeKind::Source {
            subscription: TopicSubscription::Names(vec![topic.to_string()]),
            codec: CodecPair::unspecified(),
            timestamp_policy: TimestampPolicy::Default,
            internal: false,
        }
    }

    fn sink_kind(topic: &str) -> NodeKind {
        NodeKind::Sink {
            target: SinkTarget::Static(topic.to_string()),
            codec: CodecPair::unspecified(),
            internal: false,
        }
    }

    fn merge_kind() -> NodeKind {
        NodeKind::Processor {
            op: crate::topology::OperatorKind::Merge,
            stores: Vec::new(),
        }
    }

    #[test]
    fn test_empty_graph_seal_fails() {
        let graph = TopologyGraph::new();
        assert!(matches!(graph.seal(), Err(TopologyError::EmptyTopology)));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut graph = TopologyGraph::new();
        let id = graph.add_node("src", source_kind("a"), &[]).unwrap();
        let result = graph.add_node("src", source_kind("b"), &[]);
        assert!(matches!(result, Err(TopologyError::DuplicateName(_))));
        assert_eq!(graph.node_count(), 1);
        assert_eq!(graph.node_id_by_name("src"), Some(id));
        assert!(graph.contains_name("src"));
        assert!(!graph.contains_name("other"));
    }

    #[test]
    fn test_unknown_parent_rejected() {
        let mut graph = TopologyGraph::new();
        let result = graph.add_node("p", merge_kind(), &[NodeId(42)]);
        assert!(matches!(result, Err(TopologyError::NodeNotFound(_))));
    }

    #[test]
    fn test_non_source_requires_parent() {
        let mut graph = TopologyGraph::new();
        let result = graph.add_node("p", merge_kind(), &[]);
        assert!(matches!(result, Err(TopologyError::InvalidArgument(_))));
    }

    #[test]
    fn test_seal_builds_child_index_and_order() {
        let mut graph = TopologyGraph::new();
        let a = graph.add_node("a", source_kind("t1"), &[]).unwrap();
        let b = graph.add_node("b", source_kind("t2"), &[]).unwrap();
        let m = graph.add_node("m", merge_kind(), &[a, b]).unwrap();
        let s = graph.add_node("s", sink_kind("out"), &[m]).unwrap();

        let topology = graph.seal().unwrap();
        assert_eq!(topology.children(a), &[m]);
        assert_eq!(topology.children(b), &[m]);
        assert_eq!(topology.children(m), &[s]);
        assert_eq!(topology.sources(), &[a, b]);
        assert_eq!(topology.sinks(), &[s]);

        let order = topology.execution_order();
        let pos = |id: NodeId| order.iter().position(|n| *n == id).unwrap();
        assert!(pos(a) < pos(m));
        assert!(pos(b) < pos(m));
        assert!(pos(m) < pos(s));
    }

    #[test]
    fn test_sources_for_topic() {
        let mut graph = TopologyGraph::new();
        let a = graph.add_node("a", source_kind("orders"), &[]).unwrap();
        graph.add_node("b", source_kind("payments"), &[]).unwrap();
        graph.add_node("s", sink_kind("out"), &[a]).unwrap();

        let topology = graph.seal().unwrap();
        let matched: Vec<NodeId> = topology.sources_for_topic("orders").map(|n| n.id).collect();
        assert_eq!(matched, vec![a]);
        assert!(topology.sources_for_topic("missing").next().is_none());
    }
}
