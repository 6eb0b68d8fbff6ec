//! Dependency graph construction and topological ordering.
//!
//! Nodes arrive in discovery order: layer, then priority, then insertion.
//! That order is only a tie-break. Declared dependencies come first; among
//! nodes with no path between them, the one discovered earlier runs first.
//!
//! Sorting is Kahn's algorithm with a min-heap keyed on discovery index as
//! the ready queue. Whatever cannot be emitted is part of, or downstream
//! of, a cycle.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use crate::error::Error;
use crate::handler::Handler;
use crate::layer::Layer;
use crate::registry::EntryStats;

/// One enabled middleware taking part in a compilation.
#[derive(Clone, Debug)]
pub(crate) struct Node {
    pub(crate) name: Arc<str>,
    pub(crate) layer: Layer,
    pub(crate) priority: i32,
    pub(crate) handler: Handler,
    pub(crate) dependencies: Vec<String>,
    pub(crate) stats: Arc<EntryStats>,
}

/// Ordering constraints among one compilation's nodes.
pub(crate) struct DependencyGraph {
    nodes: Vec<Node>,
    /// `dependents[b]` holds every `a` that depends on `b`.
    dependents: Vec<Vec<usize>>,
    /// `requires[a]` holds every `b` that `a` depends on.
    requires: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Resolves dependency names against `nodes`. Names with no matching
    /// node are dropped; a name shared by entries in several layers
    /// resolves to all of them except the dependent itself. A node naming
    /// itself is a cycle only when no other layer has that name.
    pub(crate) fn build(nodes: Vec<Node>) -> Self {
        let mut by_name: HashMap<&str, Vec<usize>> = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            by_name.entry(&*node.name).or_default().push(i);
        }

        let mut dependents = vec![Vec::new(); nodes.len()];
        let mut requires = vec![Vec::new(); nodes.len()];
        for (a, node) in nodes.iter().enumerate() {
            let mut targets = Vec::new();
            for dep in &node.dependencies {
                let Some(matches) = by_name.get(dep.as_str()) else {
                    continue;
                };
                // Names are unique per layer, so several matches span layers.
                if matches.len() > 1 {
                    targets.extend(matches.iter().copied().filter(|&b| b != a));
                } else {
                    targets.extend_from_slice(matches);
                }
            }
            targets.sort_unstable();
            targets.dedup();
            for b in targets {
                dependents[b].push(a);
                requires[a].push(b);
            }
        }

        Self { nodes, dependents, requires }
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn edge_count(&self) -> usize {
        self.requires.iter().map(Vec::len).sum()
    }

    /// Linearizes the graph, or reports the cycle that prevents it.
    pub(crate) fn sort(self) -> Result<Vec<Node>, Error> {
        let n = self.nodes.len();
        let mut in_degree: Vec<usize> = self.requires.iter().map(Vec::len).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(n);
        while let Some(Reverse(i)) = ready.pop() {
            order.push(i);
            for &dependent in &self.dependents[i] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }

        if order.len() < n {
            return Err(Error::DependencyCycle { members: self.cycle_members(&in_degree) });
        }

        let mut slots: Vec<Option<Node>> = self.nodes.into_iter().map(Some).collect();
        Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
    }

    /// Names of the leftover nodes once those that only hang off a cycle
    /// (nothing left over depends on them) are peeled away.
    fn cycle_members(&self, in_degree: &[usize]) -> Vec<String> {
        let mut left: Vec<bool> = in_degree.iter().map(|d| *d > 0).collect();
        let mut out_degree: Vec<usize> = (0..self.nodes.len())
            .map(|i| {
                if left[i] {
                    self.dependents[i].iter().filter(|&&d| left[d]).count()
                } else {
                    0
                }
            })
            .collect();

        let mut sinks: Vec<usize> = (0..self.nodes.len())
            .filter(|&i| left[i] && out_degree[i] == 0)
            .collect();
        while let Some(i) = sinks.pop() {
            left[i] = false;
            for &b in &self.requires[i] {
                if left[b] {
                    out_degree[b] -= 1;
                    if out_degree[b] == 0 {
                        sinks.push(b);
                    }
                }
            }
        }

        self.nodes
            .iter()
            .zip(left)
            .filter(|(_, l)| *l)
            .map(|(node, _)| node.name.to_string())
            .collect()
    }
}
