//! Physical layouts of repeater networks.

use crate::NodeId;

/// Nodes and the undirected quantum channels between them.
///
/// Every pair of nodes can exchange classical messages, so only quantum channels are
/// listed.
#[derive(Clone, Debug)]
pub struct Topology {
    nodes: Vec<NodeId>,
    channels: Vec<(NodeId, NodeId)>,
}

impl Topology {
    pub fn new(
        nodes: impl IntoIterator<Item = NodeId>,
        channels: impl IntoIterator<Item = (NodeId, NodeId)>,
    ) -> Self {
        let mut nodes: Vec<_> = nodes.into_iter().collect();
        nodes.sort();
        nodes.dedup();
        Self {
            nodes,
            channels: channels.into_iter().collect(),
        }
    }

    /// A chain of `n` nodes, numbered from 1.
    pub fn line(n: u32) -> Self {
        Self::new(
            (1..=n).map(NodeId),
            (1..n).map(|i| (NodeId(i), NodeId(i + 1))),
        )
    }

    /// Two stars of five leaves whose hubs (2 and 9) are joined by a three-hop chain.
    pub fn double_star() -> Self {
        const CHANNELS: [(u32, u32); 11] = [
            (0, 2),
            (1, 2),
            (3, 2),
            (4, 2),
            (5, 2),
            (5, 6),
            (6, 9),
            (7, 9),
            (8, 9),
            (10, 9),
            (11, 9),
        ];
        Self::new(
            (0..12).map(NodeId),
            CHANNELS.iter().map(|&(a, b)| (NodeId(a), NodeId(b))),
        )
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn channels(&self) -> &[(NodeId, NodeId)] {
        &self.channels
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.binary_search(&node).is_ok()
    }
}
