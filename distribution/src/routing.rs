//! Shortest-hop routes over the physical graph and the overlay graph.
//!
//! The physical graph holds one edge per quantum channel. The overlay graph is the
//! physical graph plus one edge per virtual link. Routes are breadth-first shortest
//! paths, with ties between equal-length paths broken by visiting neighbors in ascending
//! [NodeId] order, so every node computes the same route for the same query.

use crate::{NodeId, Role};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// The answer to a route query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    /// Shortest path over physical channels, including both ends.
    pub physical: Vec<NodeId>,
    /// Shortest path over the overlay graph, including both ends.
    pub overlay: Vec<NodeId>,
    pub next_physical: NodeId,
    pub next_virtual: NodeId,
    /// Whether the overlay takes a virtual link on its first hop (and that hop differs
    /// from the physical one).
    pub uses_vlink: bool,
}

impl Route {
    /// The hop a distribution of `role` takes next.
    ///
    /// Virtual-link maintenance never travels over virtual links.
    pub fn next_hop(&self, role: Role) -> NodeId {
        match role {
            Role::Distro => self.next_virtual,
            Role::Maint => self.next_physical,
        }
    }
}

/// Predecessor tables for every source in one graph.
#[derive(Debug, Default)]
struct Paths {
    parents: BTreeMap<NodeId, BTreeMap<NodeId, NodeId>>,
}

impl Paths {
    fn compute(adjacency: &BTreeMap<NodeId, BTreeSet<NodeId>>) -> Self {
        let mut parents = BTreeMap::new();
        for &source in adjacency.keys() {
            let mut tree = BTreeMap::new();
            let mut queue = VecDeque::from([source]);
            tree.insert(source, source);
            while let Some(node) = queue.pop_front() {
                let Some(neighbors) = adjacency.get(&node) else {
                    continue;
                };
                for &neighbor in neighbors {
                    if tree.contains_key(&neighbor) {
                        continue;
                    }
                    tree.insert(neighbor, node);
                    queue.push_back(neighbor);
                }
            }
            parents.insert(source, tree);
        }
        Self { parents }
    }

    fn path(&self, src: NodeId, dst: NodeId) -> Option<Vec<NodeId>> {
        let tree = self.parents.get(&src)?;
        let mut path = vec![dst];
        let mut current = dst;
        while current != src {
            current = *tree.get(&current)?;
            path.push(current);
        }
        path.reverse();
        Some(path)
    }
}

/// Route oracle shared by every node.
#[derive(Debug)]
pub struct Router {
    channels: BTreeMap<NodeId, BTreeSet<NodeId>>,
    vlinks: BTreeSet<(NodeId, NodeId)>,
    physical: Paths,
    overlay: Paths,
}

fn connect(adjacency: &mut BTreeMap<NodeId, BTreeSet<NodeId>>, a: NodeId, b: NodeId) {
    adjacency.entry(a).or_default().insert(b);
    adjacency.entry(b).or_default().insert(a);
}

fn ordered(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl Router {
    /// Build routes for `nodes` connected by undirected `channels`.
    pub fn new(nodes: &[NodeId], channels: &[(NodeId, NodeId)]) -> Self {
        let mut adjacency: BTreeMap<NodeId, BTreeSet<NodeId>> =
            nodes.iter().map(|&node| (node, BTreeSet::new())).collect();
        for &(a, b) in channels {
            connect(&mut adjacency, a, b);
        }
        let physical = Paths::compute(&adjacency);
        let overlay = Paths::compute(&adjacency);
        Self {
            channels: adjacency,
            vlinks: BTreeSet::new(),
            physical,
            overlay,
        }
    }

    /// Recompute overlay routes for a new set of virtual links.
    pub fn rebuild(&mut self, vlinks: impl IntoIterator<Item = (NodeId, NodeId)>) {
        self.vlinks = vlinks
            .into_iter()
            .filter(|(a, b)| a != b)
            .map(|(a, b)| ordered(a, b))
            .collect();
        let mut adjacency = self.channels.clone();
        for &(a, b) in &self.vlinks {
            connect(&mut adjacency, a, b);
        }
        self.overlay = Paths::compute(&adjacency);
    }

    pub fn is_adjacent(&self, a: NodeId, b: NodeId) -> bool {
        self.channels.get(&a).is_some_and(|n| n.contains(&b))
    }

    pub fn is_vlink(&self, a: NodeId, b: NodeId) -> bool {
        self.vlinks.contains(&ordered(a, b))
    }

    /// Shortest physical path between two nodes, if one exists.
    pub fn physical(&self, src: NodeId, dst: NodeId) -> Option<Vec<NodeId>> {
        self.physical.path(src, dst)
    }

    /// Route from `src` toward `dst`.
    ///
    /// Returns `None` if `src == dst` or either graph cannot reach `dst`.
    pub fn query(&self, src: NodeId, dst: NodeId) -> Option<Route> {
        if src == dst {
            return None;
        }
        let physical = self.physical.path(src, dst)?;
        let overlay = self.overlay.path(src, dst)?;
        let next_physical = *physical.get(1)?;
        let next_virtual = *overlay.get(1)?;
        let uses_vlink = next_virtual != next_physical
            && self.is_vlink(src, next_virtual)
            && !self.is_adjacent(src, next_virtual);
        Some(Route {
            physical,
            overlay,
            next_physical,
            next_virtual,
            uses_vlink,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[u32]) -> Vec<NodeId> {
        raw.iter().copied().map(NodeId).collect()
    }

    fn line(n: u32) -> Router {
        let nodes = ids(&(1..=n).collect::<Vec<_>>());
        let channels: Vec<_> = (1..n).map(|i| (NodeId(i), NodeId(i + 1))).collect();
        Router::new(&nodes, &channels)
    }

    #[test]
    fn test_physical_line() {
        let router = line(5);
        let route = router.query(NodeId(1), NodeId(5)).unwrap();
        assert_eq!(route.physical, ids(&[1, 2, 3, 4, 5]));
        assert_eq!(route.overlay, route.physical);
        assert_eq!(route.next_physical, NodeId(2));
        assert!(!route.uses_vlink);

        // Reverse direction
        let route = router.query(NodeId(4), NodeId(2)).unwrap();
        assert_eq!(route.physical, ids(&[4, 3, 2]));
    }

    #[test]
    fn test_vlink_shortcut() {
        let mut router = line(5);
        router.rebuild([(NodeId(4), NodeId(2))]);
        assert!(router.is_vlink(NodeId(2), NodeId(4)));

        // Upstream of the link the first hop is still physical
        let route = router.query(NodeId(1), NodeId(5)).unwrap();
        assert_eq!(route.overlay, ids(&[1, 2, 4, 5]));
        assert_eq!(route.next_virtual, NodeId(2));
        assert!(!route.uses_vlink);

        // At the endpoint the overlay jumps over node 3
        let route = router.query(NodeId(2), NodeId(5)).unwrap();
        assert_eq!(route.next_physical, NodeId(3));
        assert_eq!(route.next_virtual, NodeId(4));
        assert!(route.uses_vlink);
        assert_eq!(route.next_hop(Role::Distro), NodeId(4));
        assert_eq!(route.next_hop(Role::Maint), NodeId(3));

        // Removing the link restores physical routing
        router.rebuild([]);
        assert!(!router.query(NodeId(2), NodeId(5)).unwrap().uses_vlink);
    }

    #[test]
    fn test_ties_break_by_lowest_id() {
        // Square: 1-2, 1-3, 2-4, 3-4
        let router = Router::new(
            &ids(&[1, 2, 3, 4]),
            &[
                (NodeId(1), NodeId(3)),
                (NodeId(3), NodeId(4)),
                (NodeId(1), NodeId(2)),
                (NodeId(2), NodeId(4)),
            ],
        );
        for _ in 0..3 {
            let route = router.query(NodeId(1), NodeId(4)).unwrap();
            assert_eq!(route.physical, ids(&[1, 2, 4]));
        }
        assert_eq!(
            router.query(NodeId(4), NodeId(1)).unwrap().physical,
            ids(&[4, 2, 1])
        );
    }

    #[test]
    fn test_unreachable() {
        let router = Router::new(&ids(&[1, 2, 3]), &[(NodeId(1), NodeId(2))]);
        assert!(router.query(NodeId(1), NodeId(3)).is_none());
        assert!(router.query(NodeId(1), NodeId(1)).is_none());
        assert!(router.query(NodeId(1), NodeId(9)).is_none());
        assert!(router.physical(NodeId(2), NodeId(1)).is_some());
    }

    #[test]
    fn test_parallel_vlink_prefers_channel() {
        let mut router = line(3);
        router.rebuild([(NodeId(1), NodeId(2)), (NodeId(3), NodeId(3))]);
        let route = router.query(NodeId(1), NodeId(3)).unwrap();
        assert!(!route.uses_vlink);
        assert!(!router.is_vlink(NodeId(3), NodeId(3)));
    }
}
