//! Typed directed relation graphs.
//!
//! A plan stores one `RelationSet` per relation kind; all sets of one kind
//! family share a vertex space (task handles or event handles). Edges carry
//! per-edge data and are enumerated in a deterministic order, stable by the
//! `(source, target)` pair.

#![deny(unused_must_use)]

#[macro_use]
extern crate bitflags;

#[macro_use]
extern crate failure;

use std::collections::{BTreeMap, BTreeSet};

bitflags! {
    /// Properties of a relation kind.
    pub struct RelationFlags: u32 {
        /// Structural relation. Vertex replacement does not transfer strong
        /// edges unless the caller asks for them explicitly.
        const STRONG = 0x1;
    }
}

/// Edge-level operation error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Fail)]
pub enum RelationError {
    /// The edge is already present in this relation.
    #[fail(display = "Edge already present")]
    DuplicateEdge,

    /// The edge is not present in this relation.
    #[fail(display = "Edge not present")]
    NoSuchEdge,
}

/// One directed graph with per-edge data.
///
/// The forward table drives ordered enumeration; the reverse table answers
/// `in_edges` without scanning.
#[derive(Clone, Debug)]
pub struct RelationSet<V, D> {
    flags: RelationFlags,
    forward: BTreeMap<V, BTreeMap<V, D>>,
    reverse: BTreeMap<V, BTreeSet<V>>,
}

impl<V, D> RelationSet<V, D>
where
    V: Copy + Ord,
{
    /// Create new empty relation with the given kind properties.
    pub fn new(flags: RelationFlags) -> Self {
        RelationSet {
            flags,
            forward: BTreeMap::new(),
            reverse: BTreeMap::new(),
        }
    }

    /// Get kind properties of this relation.
    pub fn flags(&self) -> RelationFlags {
        self.flags
    }

    /// Check if this relation is structural.
    pub fn is_strong(&self) -> bool {
        self.flags.contains(RelationFlags::STRONG)
    }

    /// Get the number of edges.
    pub fn len(&self) -> usize {
        self.forward.values().map(|targets| targets.len()).sum()
    }

    /// Check if the relation holds no edge.
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Add the edge `source -> target` carrying `data`.
    pub fn add(&mut self, source: V, target: V, data: D) -> Result<(), RelationError> {
        let targets = self.forward.entry(source).or_insert_with(BTreeMap::new);
        if targets.contains_key(&target) {
            return Err(RelationError::DuplicateEdge);
        }
        targets.insert(target, data);
        self.reverse
            .entry(target)
            .or_insert_with(BTreeSet::new)
            .insert(source);
        Ok(())
    }

    /// Remove the edge `source -> target`, returning its data.
    pub fn remove(&mut self, source: V, target: V) -> Result<D, RelationError> {
        let data = match self.forward.get_mut(&source) {
            Some(targets) => targets.remove(&target).ok_or(RelationError::NoSuchEdge)?,
            None => return Err(RelationError::NoSuchEdge),
        };
        if self.forward[&source].is_empty() {
            self.forward.remove(&source);
        }
        let sources = self
            .reverse
            .get_mut(&target)
            .expect("reverse table lost an edge known to the forward table");
        sources.remove(&source);
        if sources.is_empty() {
            self.reverse.remove(&target);
        }
        Ok(data)
    }

    /// Check if the edge `source -> target` is present.
    pub fn contains(&self, source: V, target: V) -> bool {
        self.forward
            .get(&source)
            .map_or(false, |targets| targets.contains_key(&target))
    }

    /// Get data carried by the edge `source -> target`.
    pub fn edge_data(&self, source: V, target: V) -> Option<&D> {
        self.forward.get(&source).and_then(|targets| targets.get(&target))
    }

    /// Get mutable data carried by the edge `source -> target`.
    pub fn edge_data_mut(&mut self, source: V, target: V) -> Option<&mut D> {
        self.forward
            .get_mut(&source)
            .and_then(|targets| targets.get_mut(&target))
    }

    /// Iterate over outgoing edges of `source` in target order.
    pub fn out_edges(&self, source: V) -> impl Iterator<Item = (V, &D)> {
        self.forward
            .get(&source)
            .into_iter()
            .flat_map(|targets| targets.iter().map(|(&target, data)| (target, data)))
    }

    /// Iterate over sources of incoming edges of `target` in source order.
    pub fn in_edges(&self, target: V) -> impl Iterator<Item = V> + '_ {
        self.reverse
            .get(&target)
            .into_iter()
            .flat_map(|sources| sources.iter().copied())
    }

    /// Iterate over all edges, stable by the `(source, target)` pair.
    pub fn edges(&self) -> impl Iterator<Item = (V, V, &D)> {
        self.forward.iter().flat_map(|(&source, targets)| {
            targets.iter().map(move |(&target, data)| (source, target, data))
        })
    }

    /// Sever every edge incident to `vertex` in this relation.
    ///
    /// Returns the severed edges, outgoing first, each side in the
    /// deterministic enumeration order.
    pub fn remove_vertex(&mut self, vertex: V) -> Vec<(V, V)> {
        let mut severed = Vec::new();
        let outgoing: Vec<V> = self.out_edges(vertex).map(|(target, _)| target).collect();
        for target in outgoing {
            let _ = self.remove(vertex, target);
            severed.push((vertex, target));
        }
        let incoming: Vec<V> = self.in_edges(vertex).collect();
        for source in incoming {
            let _ = self.remove(source, vertex);
            severed.push((source, vertex));
        }
        severed
    }

    /// Re-create the edges of `from` on `to` with the same data, then drop
    /// them from `from`.
    ///
    /// Edges between `from` and `to` themselves are severed, not turned
    /// into self-loops, and an edge `to` already has shadows the transfer.
    /// Returns `(severed, created)` edge pairs. Whether a strong relation
    /// takes part in a replacement is the caller's call; this method only
    /// does the mechanical transfer.
    pub fn replace_vertex(&mut self, from: V, to: V) -> (Vec<(V, V)>, Vec<(V, V)>)
    where
        D: Clone,
    {
        let outgoing: Vec<(V, D)> = self
            .out_edges(from)
            .map(|(target, data)| (target, data.clone()))
            .collect();
        let incoming: Vec<(V, D)> = self
            .in_edges(from)
            .collect::<Vec<V>>()
            .into_iter()
            .map(|source| {
                let data = self
                    .edge_data(source, from)
                    .expect("reverse table lost an edge known to the forward table")
                    .clone();
                (source, data)
            })
            .collect();

        let severed = self.remove_vertex(from);
        let mut created = Vec::new();
        for (target, data) in outgoing {
            if target == to || self.contains(to, target) {
                continue;
            }
            let _ = self.add(to, target, data);
            created.push((to, target));
        }
        for (source, data) in incoming {
            if source == to || self.contains(source, to) {
                continue;
            }
            let _ = self.add(source, to, data);
            created.push((source, to));
        }
        (severed, created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set() -> RelationSet<u32, &'static str> {
        RelationSet::new(RelationFlags::empty())
    }

    #[test]
    fn add_rejects_duplicates() {
        let mut relation = set();
        relation.add(1, 2, "a").unwrap();
        assert_eq!(relation.add(1, 2, "b"), Err(RelationError::DuplicateEdge));
        assert_eq!(relation.edge_data(1, 2), Some(&"a"));
    }

    #[test]
    fn remove_returns_data() {
        let mut relation = set();
        relation.add(1, 2, "a").unwrap();
        assert_eq!(relation.remove(1, 2), Ok("a"));
        assert_eq!(relation.remove(1, 2), Err(RelationError::NoSuchEdge));
        assert!(relation.is_empty());
    }

    #[test]
    fn enumeration_is_sorted_by_vertex_pair() {
        let mut relation = set();
        relation.add(2, 1, "c").unwrap();
        relation.add(1, 3, "b").unwrap();
        relation.add(1, 2, "a").unwrap();

        let edges: Vec<(u32, u32)> = relation.edges().map(|(u, v, _)| (u, v)).collect();
        assert_eq!(edges, vec![(1, 2), (1, 3), (2, 1)]);

        let out: Vec<u32> = relation.out_edges(1).map(|(v, _)| v).collect();
        assert_eq!(out, vec![2, 3]);

        let incoming: Vec<u32> = relation.in_edges(1).collect();
        assert_eq!(incoming, vec![2]);
    }

    #[test]
    fn remove_vertex_severs_both_directions() {
        let mut relation = set();
        relation.add(1, 2, "a").unwrap();
        relation.add(3, 2, "b").unwrap();
        relation.add(2, 4, "c").unwrap();

        let severed = relation.remove_vertex(2);
        assert_eq!(severed, vec![(2, 4), (1, 2), (3, 2)]);
        assert!(relation.is_empty());
    }

    #[test]
    fn replace_vertex_transfers_edges_and_data() {
        let mut relation = set();
        relation.add(1, 2, "a").unwrap();
        relation.add(3, 1, "b").unwrap();
        relation.add(1, 5, "c").unwrap();

        let (severed, created) = relation.replace_vertex(1, 4);
        assert_eq!(severed, vec![(1, 2), (1, 5), (3, 1)]);
        assert_eq!(created, vec![(4, 2), (4, 5), (3, 4)]);
        assert_eq!(relation.edge_data(4, 2), Some(&"a"));
        assert_eq!(relation.edge_data(3, 4), Some(&"b"));
        assert!(!relation.contains(1, 2));
    }

    #[test]
    fn replace_vertex_drops_edges_to_the_replacement() {
        let mut relation = set();
        relation.add(1, 4, "a").unwrap();
        relation.add(4, 2, "kept").unwrap();
        relation.add(1, 2, "shadowed").unwrap();

        let (_, created) = relation.replace_vertex(1, 4);
        assert_eq!(created, vec![]);
        assert_eq!(relation.edge_data(4, 2), Some(&"kept"));
        assert!(!relation.contains(4, 4));
    }

    #[test]
    fn strong_flag_is_exposed() {
        let relation: RelationSet<u32, ()> = RelationSet::new(RelationFlags::STRONG);
        assert!(relation.is_strong());
        assert!(!set().is_strong());
    }
}
