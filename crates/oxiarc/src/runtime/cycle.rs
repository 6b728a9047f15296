//! Offline strong-cycle detection.
//!
//! Reference counting cannot reclaim a group of objects that keep each other
//! alive. The detector finds them after the fact: given a [`HeapGraph`] (a
//! snapshot of live objects and the strong edges between them) and a set of
//! roots, every object with a positive strong count that no root reaches is
//! leaked. Leaked objects are then split into strongly connected components;
//! the non-trivial ones are the cycles to break with a weak or unowned
//! reference.
//!
//! Nothing here touches a live store. Graphs come from
//! [`Store::snapshot`](crate::Store::snapshot) or are built by hand.
//!
//! # Example
//!
//! ```rust
//! use oxiarc::{CycleDetector, HeapGraph, HeapNode, ObjectId};
//! use std::num::NonZeroU64;
//!
//! let id = |raw| ObjectId::from_raw(NonZeroU64::new(raw).unwrap());
//!
//! let mut graph = HeapGraph::new();
//! graph.add_node(HeapNode::new(id(1), 1).with_type_name("Person"));
//! graph.add_node(HeapNode::new(id(2), 1).with_type_name("Apartment"));
//! graph.add_edge(Some(id(1)), id(2));
//! graph.add_edge(Some(id(2)), id(1));
//!
//! let report = CycleDetector::with_external_roots(&graph).detect();
//! assert_eq!(report.leaked_ids(), vec![id(1), id(2)]);
//! assert_eq!(report.cycles(), &[vec![id(1), id(2)]]);
//! ```

use crate::runtime::object::ObjectId;
use fxhash::{FxHashMap, FxHashSet};
use std::fmt;

/// A live object in a heap snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapNode {
    /// Object identity.
    pub id: ObjectId,
    /// Payload type name.
    pub type_name: &'static str,
    /// Strong count at snapshot time.
    pub strong_count: u32,
    /// Number of weak observers at snapshot time.
    pub weak_count: usize,
    /// Allocation backtrace, when captured.
    pub allocation_site: Option<String>,
}

impl HeapNode {
    /// Creates a node with an unnamed type and no weak observers.
    #[must_use]
    pub fn new(id: ObjectId, strong_count: u32) -> Self {
        HeapNode {
            id,
            type_name: "?",
            strong_count,
            weak_count: 0,
            allocation_site: None,
        }
    }

    /// Sets the type name.
    #[must_use]
    pub fn with_type_name(mut self, type_name: &'static str) -> Self {
        self.type_name = type_name;
        self
    }

    /// Sets the weak observer count.
    #[must_use]
    pub fn with_weak_count(mut self, weak_count: usize) -> Self {
        self.weak_count = weak_count;
        self
    }
}

/// A strong reference held by `owner`, or by a root when `owner` is `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StrongEdge {
    /// Object whose payload holds the reference.
    pub owner: Option<ObjectId>,
    /// Referenced object.
    pub target: ObjectId,
}

/// Live objects and the strong references between them.
#[derive(Debug, Clone, Default)]
pub struct HeapGraph {
    nodes: FxHashMap<ObjectId, HeapNode>,
    edges: Vec<StrongEdge>,
    successors: FxHashMap<ObjectId, Vec<ObjectId>>,
}

impl HeapGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a node.
    pub fn add_node(&mut self, node: HeapNode) {
        self.nodes.insert(node.id, node);
    }

    /// Adds a strong edge. Parallel edges are kept: two handles in the same
    /// payload are two references.
    pub fn add_edge(&mut self, owner: Option<ObjectId>, target: ObjectId) {
        self.edges.push(StrongEdge { owner, target });
        if let Some(owner) = owner {
            self.successors.entry(owner).or_default().push(target);
        }
    }

    /// Looks up a node.
    #[must_use]
    pub fn node(&self, id: ObjectId) -> Option<&HeapNode> {
        self.nodes.get(&id)
    }

    /// Whether the graph has a node for `id`.
    #[must_use]
    pub fn contains(&self, id: ObjectId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes, in no particular order.
    pub fn nodes(&self) -> impl Iterator<Item = &HeapNode> {
        self.nodes.values()
    }

    /// Edges, in insertion order.
    #[must_use]
    pub fn edges(&self) -> &[StrongEdge] {
        &self.edges
    }

    /// Targets of owner-less edges, sorted.
    #[must_use]
    pub fn external_roots(&self) -> Vec<ObjectId> {
        let mut roots: Vec<_> = self
            .edges
            .iter()
            .filter(|edge| edge.owner.is_none())
            .map(|edge| edge.target)
            .collect();
        roots.sort_unstable();
        roots.dedup();
        roots
    }

    fn successors(&self, id: ObjectId) -> &[ObjectId] {
        self.successors.get(&id).map(Vec::as_slice).unwrap_or_default()
    }
}

/// Finds objects that are alive but unreachable from any root.
#[derive(Debug, Clone)]
pub struct CycleDetector<'g> {
    graph: &'g HeapGraph,
    roots: FxHashSet<ObjectId>,
}

impl<'g> CycleDetector<'g> {
    /// Creates a detector with no roots.
    #[must_use]
    pub fn new(graph: &'g HeapGraph) -> Self {
        CycleDetector {
            graph,
            roots: FxHashSet::default(),
        }
    }

    /// Creates a detector rooted at every object held by an owner-less
    /// strong handle.
    #[must_use]
    pub fn with_external_roots(graph: &'g HeapGraph) -> Self {
        graph
            .external_roots()
            .into_iter()
            .fold(Self::new(graph), CycleDetector::root)
    }

    /// Declares a root.
    #[must_use]
    pub fn root(mut self, id: ObjectId) -> Self {
        self.roots.insert(id);
        self
    }

    /// Declared roots, sorted.
    #[must_use]
    pub fn roots(&self) -> Vec<ObjectId> {
        let mut roots: Vec<_> = self.roots.iter().copied().collect();
        roots.sort_unstable();
        roots
    }

    /// Objects reachable from the roots along strong edges.
    #[must_use]
    pub fn reachable(&self) -> FxHashSet<ObjectId> {
        let mut seen = FxHashSet::default();
        let mut pending: Vec<ObjectId> = self
            .roots
            .iter()
            .copied()
            .filter(|id| self.graph.contains(*id))
            .collect();

        while let Some(id) = pending.pop() {
            if seen.insert(id) {
                pending.extend(
                    self.graph
                        .successors(id)
                        .iter()
                        .filter(|next| self.graph.contains(**next) && !seen.contains(*next)),
                );
            }
        }
        seen
    }

    /// Runs the detection.
    #[must_use]
    pub fn detect(&self) -> LeakReport {
        let reachable = self.reachable();
        let mut leaked: Vec<&HeapNode> = self
            .graph
            .nodes()
            .filter(|node| node.strong_count > 0 && !reachable.contains(&node.id))
            .collect();
        leaked.sort_unstable_by_key(|node| node.id);

        let index: FxHashMap<ObjectId, usize> =
            leaked.iter().enumerate().map(|(i, node)| (node.id, i)).collect();
        let adjacency: Vec<Vec<usize>> = leaked
            .iter()
            .map(|node| {
                self.graph
                    .successors(node.id)
                    .iter()
                    .filter_map(|next| index.get(next).copied())
                    .collect()
            })
            .collect();

        let mut cycles: Vec<Vec<ObjectId>> = strongly_connected(&adjacency)
            .into_iter()
            .filter(|component| match component.as_slice() {
                [single] => adjacency[*single].contains(single),
                _ => true,
            })
            .map(|component| {
                let mut ids: Vec<_> = component.into_iter().map(|i| leaked[i].id).collect();
                ids.sort_unstable();
                ids
            })
            .collect();
        cycles.sort_unstable();

        LeakReport {
            leaked: leaked.into_iter().cloned().collect(),
            cycles,
        }
    }
}

/// Tarjan's algorithm, iterative. Returns the components as index lists.
fn strongly_connected(adjacency: &[Vec<usize>]) -> Vec<Vec<usize>> {
    const UNVISITED: usize = usize::MAX;

    let count = adjacency.len();
    let mut index = vec![UNVISITED; count];
    let mut low = vec![0; count];
    let mut on_stack = vec![false; count];
    let mut stack = Vec::new();
    let mut components = Vec::new();
    let mut next = 0;

    for start in 0..count {
        if index[start] != UNVISITED {
            continue;
        }
        index[start] = next;
        low[start] = next;
        next += 1;
        stack.push(start);
        on_stack[start] = true;
        let mut work = vec![(start, 0usize)];

        while let Some(frame) = work.last_mut() {
            let node = frame.0;
            if let Some(&succ) = adjacency[node].get(frame.1) {
                frame.1 += 1;
                if index[succ] == UNVISITED {
                    index[succ] = next;
                    low[succ] = next;
                    next += 1;
                    stack.push(succ);
                    on_stack[succ] = true;
                    work.push((succ, 0));
                } else if on_stack[succ] {
                    low[node] = low[node].min(index[succ]);
                }
                continue;
            }

            work.pop();
            if let Some(&(parent, _)) = work.last() {
                low[parent] = low[parent].min(low[node]);
            }
            if low[node] == index[node] {
                let mut component = Vec::new();
                while let Some(member) = stack.pop() {
                    on_stack[member] = false;
                    component.push(member);
                    if member == node {
                        break;
                    }
                }
                components.push(component);
            }
        }
    }
    components
}

/// Result of a [`CycleDetector::detect`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeakReport {
    leaked: Vec<HeapNode>,
    cycles: Vec<Vec<ObjectId>>,
}

impl LeakReport {
    /// Whether nothing leaked.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.leaked.is_empty()
    }

    /// Leaked objects, sorted by id.
    #[must_use]
    pub fn leaked(&self) -> &[HeapNode] {
        &self.leaked
    }

    /// Ids of the leaked objects, sorted.
    #[must_use]
    pub fn leaked_ids(&self) -> Vec<ObjectId> {
        self.leaked.iter().map(|node| node.id).collect()
    }

    /// Strong cycles among the leaked objects. Each cycle is sorted, and so
    /// is the list. Leaked objects outside every cycle are kept alive by one.
    #[must_use]
    pub fn cycles(&self) -> &[Vec<ObjectId>] {
        &self.cycles
    }

    /// Whether `id` leaked.
    #[must_use]
    pub fn contains(&self, id: ObjectId) -> bool {
        self.leaked.binary_search_by_key(&id, |node| node.id).is_ok()
    }
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clean() {
            return write!(f, "no leaks");
        }
        writeln!(
            f,
            "{} leaked object(s) in {} cycle(s)",
            self.leaked.len(),
            self.cycles.len()
        )?;
        for node in &self.leaked {
            writeln!(
                f,
                "  {} {} (strong {}, weak {})",
                node.id, node.type_name, node.strong_count, node.weak_count
            )?;
            if let Some(site) = &node.allocation_site {
                writeln!(f, "    allocated at:\n{site}")?;
            }
        }
        for cycle in &self.cycles {
            let members: Vec<String> = cycle.iter().map(ToString::to_string).collect();
            writeln!(f, "  cycle: {}", members.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroU64;

    fn id(raw: u64) -> ObjectId {
        ObjectId::from_raw(NonZeroU64::new(raw).unwrap())
    }

    fn graph(nodes: &[(u64, u32)], edges: &[(Option<u64>, u64)]) -> HeapGraph {
        let mut graph = HeapGraph::new();
        for &(raw, strong) in nodes {
            graph.add_node(HeapNode::new(id(raw), strong));
        }
        for &(owner, target) in edges {
            graph.add_edge(owner.map(id), id(target));
        }
        graph
    }

    // ========================================================================
    // Reachability
    // ========================================================================

    #[test]
    fn test_empty_graph_is_clean() {
        let graph = HeapGraph::new();
        let report = CycleDetector::new(&graph).detect();
        assert!(report.is_clean());
        assert_eq!(report.to_string(), "no leaks");
    }

    #[test]
    fn test_reachable_from_declared_root() {
        let graph = graph(&[(1, 1), (2, 1), (3, 1)], &[(Some(1), 2), (Some(2), 3)]);
        let detector = CycleDetector::new(&graph).root(id(1));

        assert_eq!(detector.reachable().len(), 3);
        assert!(detector.detect().is_clean());
    }

    #[test]
    fn test_unknown_root_is_ignored() {
        let graph = graph(&[(1, 1)], &[]);
        let detector = CycleDetector::new(&graph).root(id(9));
        assert!(detector.reachable().is_empty());
        assert_eq!(detector.roots(), vec![id(9)]);
    }

    #[test]
    fn test_zero_count_objects_never_leak() {
        let graph = graph(&[(1, 0), (2, 0)], &[]);
        assert!(CycleDetector::new(&graph).detect().is_clean());
    }

    #[test]
    fn test_external_roots() {
        let graph = graph(
            &[(1, 1), (2, 1), (3, 2)],
            &[(None, 1), (None, 3), (None, 3), (Some(1), 2)],
        );
        assert_eq!(graph.external_roots(), vec![id(1), id(3)]);

        let detector = CycleDetector::with_external_roots(&graph);
        assert_eq!(detector.roots(), vec![id(1), id(3)]);
        assert!(detector.detect().is_clean());
    }

    // ========================================================================
    // Cycles
    // ========================================================================

    #[test]
    fn test_two_object_cycle() {
        // Person <-> Apartment after both roots are gone.
        let graph = graph(&[(1, 1), (2, 1)], &[(Some(1), 2), (Some(2), 1)]);
        let report = CycleDetector::with_external_roots(&graph).detect();

        assert_eq!(report.leaked_ids(), vec![id(1), id(2)]);
        assert_eq!(report.cycles(), &[vec![id(1), id(2)]]);
        assert!(report.contains(id(2)));
        assert!(!report.contains(id(3)));
    }

    #[test]
    fn test_rooted_cycle_is_not_leaked() {
        let graph = graph(
            &[(1, 2), (2, 1)],
            &[(None, 1), (Some(1), 2), (Some(2), 1)],
        );
        assert!(CycleDetector::with_external_roots(&graph).detect().is_clean());
    }

    #[test]
    fn test_self_cycle() {
        // A view controller whose closure captures itself strongly.
        let graph = graph(&[(1, 1), (2, 1)], &[(Some(1), 1), (Some(2), 1)]);
        let report = CycleDetector::new(&graph).detect();

        assert_eq!(report.cycles(), &[vec![id(1)]]);
        assert_eq!(report.leaked_ids(), vec![id(1), id(2)]);
    }

    #[test]
    fn test_object_kept_alive_by_cycle_is_not_part_of_it() {
        let graph = graph(
            &[(1, 1), (2, 1), (3, 1)],
            &[(Some(1), 2), (Some(2), 1), (Some(2), 3)],
        );
        let report = CycleDetector::new(&graph).detect();

        assert_eq!(report.leaked_ids(), vec![id(1), id(2), id(3)]);
        assert_eq!(report.cycles(), &[vec![id(1), id(2)]]);
    }

    #[test]
    fn test_separate_cycles_are_reported_separately() {
        let graph = graph(
            &[(1, 1), (2, 1), (3, 1), (4, 1), (5, 1)],
            &[
                (Some(1), 2),
                (Some(2), 3),
                (Some(3), 1),
                (Some(4), 5),
                (Some(5), 4),
            ],
        );
        let report = CycleDetector::new(&graph).detect();
        assert_eq!(report.cycles(), &[vec![id(1), id(2), id(3)], vec![id(4), id(5)]]);
    }

    #[test]
    fn test_long_chain_does_not_overflow_stack() {
        let count = 100_000u64;
        let nodes: Vec<_> = (1..=count).map(|raw| (raw, 1)).collect();
        let mut edges: Vec<_> = (1..count).map(|raw| (Some(raw), raw + 1)).collect();
        edges.push((Some(count), 1));
        let graph = graph(&nodes, &edges);

        let report = CycleDetector::new(&graph).detect();
        assert_eq!(report.cycles().len(), 1);
        assert_eq!(report.cycles()[0].len(), count as usize);
    }

    #[test]
    fn test_report_display() {
        let mut graph = HeapGraph::new();
        graph.add_node(HeapNode::new(id(1), 1).with_type_name("Account"));
        graph.add_node(HeapNode::new(id(2), 1).with_type_name("Plan").with_weak_count(1));
        graph.add_edge(Some(id(1)), id(2));
        graph.add_edge(Some(id(2)), id(1));

        let text = CycleDetector::new(&graph).detect().to_string();
        assert!(text.starts_with("2 leaked object(s) in 1 cycle(s)"));
        assert!(text.contains("object#2 Plan (strong 1, weak 1)"));
        assert!(text.contains("cycle: object#1, object#2"));
    }
}
