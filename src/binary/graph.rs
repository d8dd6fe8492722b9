//! Generic directed multigraph, grounded on
//! `original_source/include/common/graph.h`.
//!
//! Nodes and edges are values stored inside the graph and exposed by key —
//! no node-pointer hand-outs across components. `EdgeIndex` is itself the edge key, so distinct edges
//! between the same node pair (distinguished by whatever the caller folds
//! into `EdgeIndex`, e.g. an edge kind) coexist; equal edge keys collapse.

use std::collections::{BTreeMap, BTreeSet};

/// An edge key must expose its endpoints so the graph can maintain
/// adjacency sets without depending on the edge *value* type.
pub trait EdgeEndpoints<Index> {
    fn from_node(&self) -> Index;
    fn to_node(&self) -> Index;
}

impl<Index: Copy> EdgeEndpoints<Index> for (Index, Index) {
    fn from_node(&self) -> Index {
        self.0
    }
    fn to_node(&self) -> Index {
        self.1
    }
}

#[derive(Debug, Clone)]
pub struct Graph<Index, Node, EdgeIndex, Edge> {
    nodes: BTreeMap<Index, Node>,
    edges: BTreeMap<EdgeIndex, Edge>,
    outgoing: BTreeMap<Index, BTreeSet<EdgeIndex>>,
    incoming: BTreeMap<Index, BTreeSet<EdgeIndex>>,
}

impl<Index, Node, EdgeIndex, Edge> Default for Graph<Index, Node, EdgeIndex, Edge>
where
    Index: Ord + Copy,
    EdgeIndex: Ord + Copy + EdgeEndpoints<Index>,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<Index, Node, EdgeIndex, Edge> Graph<Index, Node, EdgeIndex, Edge>
where
    Index: Ord + Copy,
    EdgeIndex: Ord + Copy + EdgeEndpoints<Index>,
{
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
            edges: BTreeMap::new(),
            outgoing: BTreeMap::new(),
            incoming: BTreeMap::new(),
        }
    }

    pub fn has_node(&self, idx: Index) -> bool {
        self.nodes.contains_key(&idx)
    }

    pub fn node(&self, idx: Index) -> Option<&Node> {
        self.nodes.get(&idx)
    }

    pub fn node_mut(&mut self, idx: Index) -> Option<&mut Node> {
        self.nodes.get_mut(&idx)
    }

    pub fn add_node(&mut self, idx: Index, node: Node) {
        self.nodes.insert(idx, node);
        self.outgoing.entry(idx).or_default();
        self.incoming.entry(idx).or_default();
    }

    pub fn remove_node(&mut self, idx: Index) {
        if let Some(out) = self.outgoing.remove(&idx) {
            for e in out {
                self.edges.remove(&e);
            }
        }
        if let Some(inc) = self.incoming.remove(&idx) {
            for e in inc {
                self.edges.remove(&e);
            }
        }
        self.nodes.remove(&idx);
    }

    pub fn has_edge(&self, idx: EdgeIndex) -> bool {
        self.edges.contains_key(&idx)
    }

    pub fn edge(&self, idx: EdgeIndex) -> Option<&Edge> {
        self.edges.get(&idx)
    }

    pub fn edge_mut(&mut self, idx: EdgeIndex) -> Option<&mut Edge> {
        self.edges.get_mut(&idx)
    }

    pub fn add_edge(&mut self, idx: EdgeIndex, edge: Edge) {
        let (from, to) = (idx.from_node(), idx.to_node());
        self.outgoing.entry(from).or_default().insert(idx);
        self.incoming.entry(to).or_default().insert(idx);
        self.edges.insert(idx, edge);
    }

    pub fn remove_edge(&mut self, idx: EdgeIndex) {
        let (from, to) = (idx.from_node(), idx.to_node());
        if let Some(set) = self.outgoing.get_mut(&from) {
            set.remove(&idx);
        }
        if let Some(set) = self.incoming.get_mut(&to) {
            set.remove(&idx);
        }
        self.edges.remove(&idx);
    }

    pub fn outgoing_nodes(&self, idx: Index) -> impl Iterator<Item = &EdgeIndex> {
        self.outgoing.get(&idx).into_iter().flatten()
    }

    pub fn outgoing_nodes_size(&self, idx: Index) -> usize {
        self.outgoing.get(&idx).map_or(0, BTreeSet::len)
    }

    pub fn incoming_nodes(&self, idx: Index) -> impl Iterator<Item = &EdgeIndex> {
        self.incoming.get(&idx).into_iter().flatten()
    }

    pub fn incoming_nodes_size(&self, idx: Index) -> usize {
        self.incoming.get(&idx).map_or(0, BTreeSet::len)
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_size(&self) -> usize {
        self.edges.len()
    }

    pub fn node_indices(&self) -> impl Iterator<Item = Index> + '_ {
        self.nodes.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_node_and_edge_updates_adjacency() {
        let mut g: Graph<u64, &str, (u64, u64), u32> = Graph::new();
        g.add_node(1, "a");
        g.add_node(2, "b");
        g.add_edge((1, 2), 7);

        assert!(g.has_edge((1, 2)));
        assert_eq!(g.edge((1, 2)), Some(&7));
        assert_eq!(g.outgoing_nodes_size(1), 1);
        assert_eq!(g.incoming_nodes_size(2), 1);
        assert_eq!(g.outgoing_nodes_size(2), 0);
    }

    #[test]
    fn remove_node_drops_incident_edges() {
        let mut g: Graph<u64, (), (u64, u64), ()> = Graph::new();
        g.add_node(1, ());
        g.add_node(2, ());
        g.add_edge((1, 2), ());
        g.remove_node(1);
        assert!(!g.has_node(1));
        assert!(!g.has_edge((1, 2)));
        assert_eq!(g.incoming_nodes_size(2), 0);
    }

    #[test]
    fn equal_edge_keys_collapse() {
        let mut g: Graph<u64, (), (u64, u64), u32> = Graph::new();
        g.add_node(1, ());
        g.add_node(2, ());
        g.add_edge((1, 2), 1);
        g.add_edge((1, 2), 2);
        assert_eq!(g.edge_size(), 1);
        assert_eq!(g.edge((1, 2)), Some(&2));
    }

    #[test]
    fn size_and_edge_size_track_counts() {
        let mut g: Graph<u64, (), (u64, u64), ()> = Graph::new();
        g.add_node(1, ());
        g.add_node(2, ());
        g.add_node(3, ());
        g.add_edge((1, 2), ());
        g.add_edge((2, 3), ());
        assert_eq!(g.size(), 3);
        assert_eq!(g.edge_size(), 2);
    }
}
