//! Generic directed graph with cycle detection and topological ordering.
//!
//! Nodes are keyed by string ID and carry an opaque payload. An edge
//! `from -> to` means *`from` must complete before `to`*.
//!
//! Rules enforced:
//! 1. Node IDs must be unique ([`DagError::DuplicateNode`]).
//! 2. Both endpoints of an edge must exist ([`DagError::UnknownNode`]).
//! 3. [`Dag::topological_sort`] refuses cyclic graphs
//!    ([`DagError::CyclicDependency`]).
//!
//! Ordering is deterministic: ties are broken by node insertion order.

use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::error::DagError;

#[derive(Debug, Clone)]
pub struct Dag<T> {
    ids: Vec<String>,
    data: Vec<T>,
    index: HashMap<String, usize>,
    successors: Vec<Vec<usize>>,
    predecessors: Vec<Vec<usize>>,
}

impl<T> Default for Dag<T> {
    fn default() -> Self {
        Self {
            ids: Vec::new(),
            data: Vec::new(),
            index: HashMap::new(),
            successors: Vec::new(),
            predecessors: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

impl<T> Dag<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Register a node.
    ///
    /// # Errors
    /// [`DagError::DuplicateNode`] if `id` is already present.
    pub fn add_node(&mut self, id: impl Into<String>, data: T) -> Result<(), DagError> {
        let id = id.into();
        if self.index.contains_key(&id) {
            return Err(DagError::DuplicateNode(id));
        }
        self.index.insert(id.clone(), self.ids.len());
        self.ids.push(id);
        self.data.push(data);
        self.successors.push(Vec::new());
        self.predecessors.push(Vec::new());
        Ok(())
    }

    /// Add the edge `from -> to`. Adding the same edge twice is a no-op.
    ///
    /// # Errors
    /// [`DagError::UnknownNode`] if either endpoint is absent.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<(), DagError> {
        let from_idx = self.position(from, "from")?;
        let to_idx = self.position(to, "to")?;
        if !self.successors[from_idx].contains(&to_idx) {
            self.successors[from_idx].push(to_idx);
            self.predecessors[to_idx].push(from_idx);
        }
        Ok(())
    }

    pub fn get_node(&self, id: &str) -> Option<&T> {
        self.index.get(id).map(|&i| &self.data[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Node IDs in insertion order.
    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }

    /// Direct predecessors of `id` (what it waits for).
    pub fn dependencies(&self, id: &str) -> Vec<&str> {
        self.neighbours(id, &self.predecessors)
    }

    /// Direct successors of `id` (what waits for it).
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.neighbours(id, &self.successors)
    }

    /// Every node reachable from `id`, in insertion order, excluding `id`.
    pub fn descendants(&self, id: &str) -> Vec<&str> {
        let Some(&start) = self.index.get(id) else {
            return Vec::new();
        };
        let mut seen = vec![false; self.len()];
        let mut queue: VecDeque<usize> = self.successors[start].iter().copied().collect();
        while let Some(n) = queue.pop_front() {
            if !seen[n] {
                seen[n] = true;
                queue.extend(self.successors[n].iter().copied());
            }
        }
        seen[start] = false;
        (0..self.len())
            .filter(|&i| seen[i])
            .map(|i| self.ids[i].as_str())
            .collect()
    }

    /// Three-color depth-first search, O(V + E).
    pub fn has_cycle(&self) -> bool {
        let mut color = vec![Color::White; self.len()];

        for root in 0..self.len() {
            if color[root] != Color::White {
                continue;
            }
            // (node, index of the next successor to visit)
            let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
            color[root] = Color::Gray;

            while let Some(top) = stack.last_mut() {
                let (node, next) = *top;
                if let Some(&child) = self.successors[node].get(next) {
                    top.1 += 1;
                    match color[child] {
                        Color::Gray => return true,
                        Color::White => {
                            color[child] = Color::Gray;
                            stack.push((child, 0));
                        }
                        Color::Black => {}
                    }
                } else {
                    color[node] = Color::Black;
                    stack.pop();
                }
            }
        }
        false
    }

    /// Order every node so that each edge points forward.
    ///
    /// Kahn's algorithm with an insertion-ordered ready set, so equal inputs
    /// always produce the same order.
    ///
    /// # Errors
    /// [`DagError::CyclicDependency`] listing the nodes that could not be
    /// ordered (cycle members and everything downstream of them).
    pub fn topological_sort(&self) -> Result<Vec<String>, DagError> {
        let mut in_degree: Vec<usize> = self.predecessors.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = (0..self.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut sorted = Vec::with_capacity(self.len());

        while let Some(node) = ready.pop_first() {
            sorted.push(node);
            for &next in &self.successors[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.insert(next);
                }
            }
        }

        if sorted.len() != self.len() {
            let stuck = (0..self.len())
                .filter(|&i| in_degree[i] > 0)
                .map(|i| self.ids[i].clone())
                .collect();
            return Err(DagError::CyclicDependency(stuck));
        }

        Ok(sorted.into_iter().map(|i| self.ids[i].clone()).collect())
    }

    fn position(&self, id: &str, side: &'static str) -> Result<usize, DagError> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| DagError::UnknownNode {
                node_id: id.to_owned(),
                side,
            })
    }

    fn neighbours<'a>(&'a self, id: &str, adjacency: &'a [Vec<usize>]) -> Vec<&'a str> {
        self.index
            .get(id)
            .map(|&i| adjacency[i].iter().map(|&n| self.ids[n].as_str()).collect())
            .unwrap_or_default()
    }
}
