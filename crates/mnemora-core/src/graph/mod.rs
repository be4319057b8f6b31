//! Association Graph: typed, weighted, symmetric links between memories,
//! with multi-hop traversal and depth-based attenuation.
//!
//! Mirrors the ANN Index's design: an in-memory structure rebuilt from
//! Storage at startup, keeping an opaque-string-id <-> internal-index
//! bijection so callers never see petgraph's `NodeIndex` space.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::graph::{NodeIndex, UnGraph};
use petgraph::visit::EdgeRef;

use crate::model::AssociationKind;

#[derive(Debug, Clone, Copy)]
struct Edge {
    kind: AssociationKind,
    strength: f32,
}

/// In-memory association graph. Since associations are stored symmetrically
/// in Storage, a single undirected edge per `(pair, kind)` here represents
/// both directions.
pub struct AssociationGraph {
    graph: UnGraph<String, Edge>,
    index_of: HashMap<String, NodeIndex>,
}

impl Default for AssociationGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl AssociationGraph {
    pub fn new() -> Self {
        Self { graph: UnGraph::new_undirected(), index_of: HashMap::new() }
    }

    fn node_for(&mut self, id: &str) -> NodeIndex {
        if let Some(&idx) = self.index_of.get(id) {
            return idx;
        }
        let idx = self.graph.add_node(id.to_string());
        self.index_of.insert(id.to_string(), idx);
        idx
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index_of.contains_key(id)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Create or strengthen a typed link between two memories. Idempotent:
    /// linking the same pair and kind again updates the edge's strength
    /// rather than adding a parallel edge.
    pub fn link(&mut self, a: &str, b: &str, kind: AssociationKind, strength: f32) {
        let na = self.node_for(a);
        let nb = self.node_for(b);

        if let Some(edge_idx) = self
            .graph
            .edges_connecting(na, nb)
            .find(|e| e.weight().kind == kind)
            .map(|e| e.id())
        {
            if let Some(w) = self.graph.edge_weight_mut(edge_idx) {
                w.strength = strength;
            }
            return;
        }

        self.graph.add_edge(na, nb, Edge { kind, strength });
    }

    /// Direct neighbors of `id` with strength at or above `min_strength`,
    /// most-relevant first.
    pub fn neighbors(&self, id: &str, min_strength: f32) -> Vec<(String, AssociationKind, f32)> {
        let Some(&node) = self.index_of.get(id) else {
            return vec![];
        };
        let mut out: Vec<(String, AssociationKind, f32)> = self
            .graph
            .edges(node)
            .filter(|e| e.weight().strength >= min_strength)
            .map(|e| {
                let other = if e.source() == node { e.target() } else { e.source() };
                (self.graph[other].clone(), e.weight().kind, e.weight().strength)
            })
            .collect();
        out.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
        out
    }

    /// Breadth-first expansion from `seeds`, one hop per entry in
    /// `hop_strengths`/`min_strengths`. A node first reached at hop `i` is
    /// scored `hop_strengths[i]`; traversal through a hop only follows edges
    /// whose strength is at least `min_strengths[i]`. Returns every reached
    /// memory id (excluding the seeds themselves) mapped to the strength of
    /// the shallowest hop at which it was found.
    pub fn expand(&self, seeds: &[String], hop_strengths: &[f32], min_strengths: &[f32]) -> HashMap<String, f32> {
        let depth = hop_strengths.len().min(min_strengths.len());
        let mut scores: HashMap<String, f32> = HashMap::new();
        let seed_set: HashSet<&str> = seeds.iter().map(String::as_str).collect();
        let mut frontier: VecDeque<(NodeIndex, usize)> = VecDeque::new();
        let mut visited: HashSet<NodeIndex> = HashSet::new();

        for seed in seeds {
            if let Some(&node) = self.index_of.get(seed) {
                frontier.push_back((node, 0));
                visited.insert(node);
            }
        }

        while let Some((node, hop)) = frontier.pop_front() {
            if hop >= depth {
                continue;
            }
            let min_strength = min_strengths[hop];
            for e in self.graph.edges(node) {
                if e.weight().strength < min_strength {
                    continue;
                }
                let other = if e.source() == node { e.target() } else { e.source() };
                let other_id = &self.graph[other];

                if !seed_set.contains(other_id.as_str()) {
                    scores.entry(other_id.clone()).or_insert(hop_strengths[hop]);
                }

                if visited.insert(other) {
                    frontier.push_back((other, hop + 1));
                }
            }
        }

        scores
    }

    /// Multiply every edge's strength by `factor`, dropping edges whose
    /// strength falls to (near) zero. Called periodically to let unused
    /// associations fade.
    pub fn decay(&mut self, factor: f32) {
        let mut to_remove = vec![];
        for edge_idx in self.graph.edge_indices() {
            if let Some(edge) = self.graph.edge_weight_mut(edge_idx) {
                edge.strength *= factor;
                if edge.strength < 1e-4 {
                    to_remove.push(edge_idx);
                }
            }
        }
        for edge_idx in to_remove {
            self.graph.remove_edge(edge_idx);
        }
    }

    /// Rebuild the graph from scratch using the given associations,
    /// discarding current state. Used at startup to reconcile with Storage.
    pub fn rebuild_from<I>(&mut self, associations: I)
    where
        I: IntoIterator<Item = (String, String, AssociationKind, f32)>,
    {
        *self = Self::new();
        for (a, b, kind, strength) in associations {
            self.link(&a, &b, kind, strength);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_then_neighbors_round_trips() {
        let mut g = AssociationGraph::new();
        g.link("a", "b", AssociationKind::SameTopic, 0.8);
        let neighbors = g.neighbors("a", 0.0);
        assert_eq!(neighbors, vec![("b".to_string(), AssociationKind::SameTopic, 0.8)]);
    }

    #[test]
    fn link_is_symmetric() {
        let mut g = AssociationGraph::new();
        g.link("a", "b", AssociationKind::CauseEffect, 0.5);
        assert_eq!(g.neighbors("b", 0.0).len(), 1);
    }

    #[test]
    fn relinking_same_pair_and_kind_updates_strength() {
        let mut g = AssociationGraph::new();
        g.link("a", "b", AssociationKind::SameTopic, 0.3);
        g.link("a", "b", AssociationKind::SameTopic, 0.9);
        assert_eq!(g.edge_count(), 1);
        assert_eq!(g.neighbors("a", 0.0)[0].2, 0.9);
    }

    #[test]
    fn expand_respects_depth_and_hop_strengths() {
        let mut g = AssociationGraph::new();
        g.link("a", "b", AssociationKind::SameTopic, 1.0);
        g.link("b", "c", AssociationKind::SameTopic, 1.0);
        g.link("c", "d", AssociationKind::SameTopic, 1.0);

        let two_hop = g.expand(&["a".to_string()], &[0.8, 0.5], &[0.0, 0.0]);
        assert!(two_hop.contains_key("b"));
        assert!(two_hop.contains_key("c"));
        assert!(!two_hop.contains_key("d"));
        assert_eq!(two_hop["b"], 0.8);
        assert_eq!(two_hop["c"], 0.5);
    }

    #[test]
    fn expand_filters_edges_below_hop_threshold() {
        let mut g = AssociationGraph::new();
        g.link("a", "b", AssociationKind::SameTopic, 0.2);
        g.link("a", "c", AssociationKind::SameTopic, 0.9);

        let expanded = g.expand(&["a".to_string()], &[0.8], &[0.5]);
        assert!(!expanded.contains_key("b"));
        assert!(expanded.contains_key("c"));
    }

    #[test]
    fn decay_removes_negligible_edges() {
        let mut g = AssociationGraph::new();
        g.link("a", "b", AssociationKind::SameTopic, 0.001);
        g.decay(0.01);
        assert_eq!(g.edge_count(), 0);
    }
}
