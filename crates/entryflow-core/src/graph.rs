//! NodeGraph: an in-memory DAG view over persisted nodes and channels.
//!
//! The persisted records (nodes, outputs, channels) are the source of truth;
//! [`NodeGraph`] is rebuilt from them whenever a traversal is needed. Each
//! channel becomes one petgraph edge from the origin output's node to the
//! destination node, weighted by the output label.
//!
//! Traversals are breadth-first and visit each node at most once, so they are
//! O(V+E) and terminate even if a cycle slipped into the data.

use std::collections::HashMap;

use indexmap::{IndexMap, IndexSet};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, EdgeRef, Reversed};
use petgraph::Direction;

use crate::error::CoreError;
use crate::id::{NodeId, NodeOutputId};
use crate::node::{DataChannel, Node, NodeOutput};

/// How far a traversal follows channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Traversal {
    /// Direct neighbours only.
    OneHop,
    /// Everything reachable.
    Transitive,
}

/// DAG of nodes connected through output ports.
#[derive(Debug, Clone, Default)]
pub struct NodeGraph {
    graph: DiGraph<NodeId, String, u32>,
    indices: IndexMap<NodeId, NodeIndex<u32>>,
    nodes: IndexMap<NodeId, Node>,
}

impl NodeGraph {
    /// Builds the graph from persisted rows.
    ///
    /// Fails if a channel or output refers to a node that is not in `nodes`.
    pub fn from_parts(
        nodes: Vec<Node>,
        outputs: &[NodeOutput],
        channels: &[DataChannel],
    ) -> Result<Self, CoreError> {
        let mut graph = DiGraph::<NodeId, String, u32>::default();
        let mut indices = IndexMap::new();
        let mut by_id = IndexMap::new();

        for node in nodes {
            let idx = graph.add_node(node.id);
            indices.insert(node.id, idx);
            by_id.insert(node.id, node);
        }

        let output_owner: HashMap<NodeOutputId, &NodeOutput> =
            outputs.iter().map(|o| (o.id, o)).collect();

        for channel in channels {
            let origin = output_owner.get(&channel.origin_id).ok_or_else(|| {
                CoreError::InvalidConfig {
                    reason: format!(
                        "channel {} refers to unknown output {}",
                        channel.id, channel.origin_id
                    ),
                }
            })?;
            let from = *indices
                .get(&origin.node_id)
                .ok_or(CoreError::NodeNotFound { id: origin.node_id })?;
            let to = *indices
                .get(&channel.destination_id)
                .ok_or(CoreError::NodeNotFound {
                    id: channel.destination_id,
                })?;
            graph.add_edge(from, to, origin.label.clone());
        }

        Ok(NodeGraph {
            graph,
            indices,
            nodes: by_id,
        })
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn index_of(&self, id: NodeId) -> Result<NodeIndex<u32>, CoreError> {
        self.indices
            .get(&id)
            .copied()
            .ok_or(CoreError::NodeNotFound { id })
    }

    /// Nodes reachable from `id` by following channels downstream.
    ///
    /// The start node is never included. Order is breadth-first.
    pub fn descendants(&self, id: NodeId, traversal: Traversal) -> Result<Vec<NodeId>, CoreError> {
        let start = self.index_of(id)?;
        Ok(match traversal {
            Traversal::OneHop => self.one_hop(start, Direction::Outgoing),
            Traversal::Transitive => {
                let mut bfs = Bfs::new(&self.graph, start);
                let mut out = Vec::new();
                while let Some(idx) = bfs.next(&self.graph) {
                    if idx != start {
                        out.push(self.graph[idx]);
                    }
                }
                out
            }
        })
    }

    /// Nodes that reach `id` by following channels downstream.
    pub fn ancestors(&self, id: NodeId, traversal: Traversal) -> Result<Vec<NodeId>, CoreError> {
        let start = self.index_of(id)?;
        Ok(match traversal {
            Traversal::OneHop => self.one_hop(start, Direction::Incoming),
            Traversal::Transitive => {
                let reversed = Reversed(&self.graph);
                let mut bfs = Bfs::new(reversed, start);
                let mut out = Vec::new();
                while let Some(idx) = bfs.next(reversed) {
                    if idx != start {
                        out.push(self.graph[idx]);
                    }
                }
                out
            }
        })
    }

    fn one_hop(&self, start: NodeIndex<u32>, direction: Direction) -> Vec<NodeId> {
        // Parallel channels (two outputs into one node) show up twice.
        let seen: IndexSet<NodeId> = self
            .graph
            .neighbors_directed(start, direction)
            .map(|neighbour| self.graph[neighbour])
            .collect();
        // petgraph yields neighbours newest-edge first; present them in
        // channel creation order instead.
        seen.into_iter().rev().collect()
    }

    /// Destinations fed by the output `label` of node `id`.
    pub fn destinations(&self, id: NodeId, label: &str) -> Result<Vec<NodeId>, CoreError> {
        let start = self.index_of(id)?;
        let mut out: Vec<NodeId> = self
            .graph
            .edges_directed(start, Direction::Outgoing)
            .filter(|edge| edge.weight() == label)
            .map(|edge| self.graph[edge.target()])
            .collect();
        out.reverse();
        out.dedup();
        Ok(out)
    }

    /// Returns true if a channel `origin -> destination` would close a cycle.
    pub fn would_create_cycle(&self, origin: NodeId, destination: NodeId) -> Result<bool, CoreError> {
        if origin == destination {
            return Ok(true);
        }
        self.index_of(origin)?;
        Ok(self
            .descendants(destination, Traversal::Transitive)?
            .contains(&origin))
    }

    pub fn is_acyclic(&self) -> bool {
        !is_cyclic_directed(&self.graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{ContentHash, DataChannelId, ProjectId};
    use crate::node::{DatasetConfig, FilterConfig, NodeConfig};

    fn node(id: i64) -> Node {
        Node {
            id: NodeId(id),
            project_id: ProjectId(1),
            name: format!("n{id}"),
            hash: ContentHash("0".repeat(64)),
            config: if id == 1 {
                NodeConfig::Dataset(DatasetConfig { dataset_id: 1 })
            } else {
                NodeConfig::Filter(FilterConfig::default())
            },
        }
    }

    fn output(id: i64, node_id: i64, label: &str) -> NodeOutput {
        NodeOutput {
            id: NodeOutputId(id),
            node_id: NodeId(node_id),
            label: label.to_string(),
        }
    }

    fn channel(id: i64, origin: i64, destination: i64) -> DataChannel {
        DataChannel {
            id: DataChannelId(id),
            origin_id: NodeOutputId(origin),
            destination_id: NodeId(destination),
        }
    }

    /// 1 -Entries-> 2 -Passed-> 3 -Passed-> 4
    ///              2 -Failed-> 5
    /// 6 is an unrelated sibling root.
    fn diamond_free_graph() -> NodeGraph {
        let nodes = (1..=6).map(node).collect();
        let outputs = vec![
            output(10, 1, "Entries"),
            output(20, 2, "Passed"),
            output(21, 2, "Failed"),
            output(30, 3, "Passed"),
            output(31, 3, "Failed"),
            output(60, 6, "Entries"),
        ];
        let channels = vec![
            channel(1, 10, 2),
            channel(2, 20, 3),
            channel(3, 21, 5),
            channel(4, 30, 4),
        ];
        NodeGraph::from_parts(nodes, &outputs, &channels).unwrap()
    }

    #[test]
    fn one_hop_descendants() {
        let graph = diamond_free_graph();
        assert_eq!(
            graph.descendants(NodeId(2), Traversal::OneHop).unwrap(),
            vec![NodeId(3), NodeId(5)]
        );
    }

    #[test]
    fn transitive_descendants() {
        let graph = diamond_free_graph();
        let mut got = graph.descendants(NodeId(1), Traversal::Transitive).unwrap();
        got.sort();
        assert_eq!(got, vec![NodeId(2), NodeId(3), NodeId(4), NodeId(5)]);
        assert!(graph
            .descendants(NodeId(6), Traversal::Transitive)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn ancestors_walk_upstream() {
        let graph = diamond_free_graph();
        let mut got = graph.ancestors(NodeId(4), Traversal::Transitive).unwrap();
        got.sort();
        assert_eq!(got, vec![NodeId(1), NodeId(2), NodeId(3)]);
        assert_eq!(
            graph.ancestors(NodeId(5), Traversal::OneHop).unwrap(),
            vec![NodeId(2)]
        );
    }

    #[test]
    fn destinations_by_label() {
        let graph = diamond_free_graph();
        assert_eq!(graph.destinations(NodeId(2), "Passed").unwrap(), vec![NodeId(3)]);
        assert_eq!(graph.destinations(NodeId(2), "Failed").unwrap(), vec![NodeId(5)]);
        assert!(graph.destinations(NodeId(4), "Passed").unwrap().is_empty());
    }

    #[test]
    fn cycle_detection() {
        let graph = diamond_free_graph();
        assert!(graph.would_create_cycle(NodeId(4), NodeId(1)).unwrap());
        assert!(graph.would_create_cycle(NodeId(3), NodeId(3)).unwrap());
        assert!(!graph.would_create_cycle(NodeId(6), NodeId(2)).unwrap());
        assert!(graph.is_acyclic());
    }

    #[test]
    fn parallel_channels_are_reported_once() {
        let nodes = vec![node(1), node(2), node(3)];
        let outputs = vec![output(20, 2, "Passed"), output(21, 2, "Failed")];
        let channels = vec![channel(1, 20, 3), channel(2, 21, 3)];
        let graph = NodeGraph::from_parts(nodes, &outputs, &channels).unwrap();
        assert_eq!(
            graph.descendants(NodeId(2), Traversal::OneHop).unwrap(),
            vec![NodeId(3)]
        );
    }

    #[test]
    fn wide_fan_out_keeps_channel_order() {
        let mut nodes = vec![node(2)];
        nodes.extend((3..=60).map(node));
        let outputs = vec![output(20, 2, "Passed"), output(21, 2, "Failed")];
        let channels: Vec<_> = (3..=60)
            .flat_map(|dest| [channel(dest * 2, 20, dest), channel(dest * 2 + 1, 21, dest)])
            .collect();
        let graph = NodeGraph::from_parts(nodes, &outputs, &channels).unwrap();
        assert_eq!(
            graph.descendants(NodeId(2), Traversal::OneHop).unwrap(),
            (3..=60).map(NodeId).collect::<Vec<_>>()
        );
    }

    #[test]
    fn unknown_node_is_an_error() {
        let graph = diamond_free_graph();
        assert!(matches!(
            graph.descendants(NodeId(99), Traversal::OneHop),
            Err(CoreError::NodeNotFound { .. })
        ));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Adding only the channels `would_create_cycle` accepts keeps
            /// the graph acyclic, whatever order they are proposed in.
            #[test]
            fn accepted_channels_never_form_a_cycle(
                proposals in proptest::collection::vec((1i64..=8, 1i64..=8), 0..40)
            ) {
                let nodes: Vec<Node> = (1..=8).map(node).collect();
                let outputs: Vec<NodeOutput> =
                    (1..=8).map(|n| output(n * 10, n, "Entries")).collect();
                let mut channels = Vec::new();

                for (from, to) in proposals {
                    let graph =
                        NodeGraph::from_parts(nodes.clone(), &outputs, &channels).unwrap();
                    if !graph.would_create_cycle(NodeId(from), NodeId(to)).unwrap() {
                        channels.push(channel(channels.len() as i64 + 1, from * 10, to));
                    }
                }

                let graph = NodeGraph::from_parts(nodes, &outputs, &channels).unwrap();
                prop_assert!(graph.is_acyclic());
                for c in &channels {
                    let origin = NodeId(c.origin_id.0 / 10);
                    let below = graph.descendants(c.destination_id, Traversal::Transitive).unwrap();
                    prop_assert!(!below.contains(&origin));
                }
            }
        }
    }

    #[test]
    fn dangling_channel_is_rejected() {
        let nodes = vec![node(1)];
        let outputs = vec![output(10, 1, "Entries")];
        let channels = vec![channel(1, 10, 42)];
        assert!(NodeGraph::from_parts(nodes, &outputs, &channels).is_err());
    }
}
