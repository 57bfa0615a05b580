//! Resource graph: nodes, dependency edges and their topological order.

use std::collections::HashMap;

use crate::error::GraphError;
use crate::reconciler::Reconcile;

/// One manageable unit of cloud state.
#[derive(Debug)]
pub struct ResourceNode {
    id: String,
    depends_on: Vec<String>,
    reconcile: Box<dyn Reconcile>,
}

impl ResourceNode {
    pub fn new(id: impl Into<String>, reconcile: impl Reconcile + 'static) -> Self {
        Self {
            id: id.into(),
            depends_on: Vec::new(),
            reconcile: Box::new(reconcile),
        }
    }

    /// Add dependency edges to already declared (or later declared) nodes.
    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dependencies(&self) -> &[String] {
        &self.depends_on
    }

    pub fn reconciler(&self) -> &dyn Reconcile {
        self.reconcile.as_ref()
    }
}

/// Static declaration of resource nodes and their dependency edges.
///
/// Declaration order is kept: among nodes with no mutual dependency the
/// topological order is the order in which they were added.
#[derive(Debug, Default)]
pub struct ResourceGraph {
    nodes: Vec<ResourceNode>,
    index: HashMap<String, usize>,
}

impl ResourceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node. Node ids must be unique.
    pub fn add_node(&mut self, node: ResourceNode) -> Result<(), GraphError> {
        if self.index.contains_key(node.id()) {
            return Err(GraphError::DuplicateNode(node.id.clone()));
        }
        self.index.insert(node.id.clone(), self.nodes.len());
        self.nodes.push(node);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ResourceNode> {
        self.index.get(id).and_then(|&i| self.nodes.get(i))
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.iter()
    }

    /// Check that every edge resolves and the graph is acyclic.
    pub fn validate(&self) -> Result<(), GraphError> {
        self.topological_order().map(|_| ())
    }

    /// Dependencies first; ties broken by declaration order.
    ///
    /// Repeatedly emits the earliest-declared node whose dependencies have
    /// all been emitted, so a declaration that already respects the edges
    /// comes back unchanged.
    pub fn topological_order(&self) -> Result<Vec<&ResourceNode>, GraphError> {
        for node in &self.nodes {
            if let Some(missing) = node
                .depends_on
                .iter()
                .find(|dep| !self.index.contains_key(dep.as_str()))
            {
                return Err(GraphError::UnknownDependency {
                    node: node.id.clone(),
                    dependency: missing.clone(),
                });
            }
        }

        let mut emitted = vec![false; self.nodes.len()];
        let mut order = Vec::with_capacity(self.nodes.len());

        while order.len() < self.nodes.len() {
            let ready = self.nodes.iter().enumerate().find(|(i, node)| {
                !emitted[*i]
                    && node
                        .depends_on
                        .iter()
                        .all(|dep| self.index.get(dep).is_some_and(|&j| emitted[j]))
            });

            match ready {
                Some((i, node)) => {
                    emitted[i] = true;
                    order.push(node);
                }
                None => {
                    return Err(GraphError::Cycle {
                        path: self.find_cycle(&emitted),
                    });
                }
            }
        }

        Ok(order)
    }

    /// Walk unemitted dependencies until a node repeats.
    ///
    /// Every unemitted node has at least one unemitted dependency once
    /// ordering is stuck, so the walk always closes a cycle.
    fn find_cycle(&self, emitted: &[bool]) -> Vec<String> {
        let Some(mut current) = emitted.iter().position(|done| !done) else {
            return Vec::new();
        };
        let mut path: Vec<usize> = Vec::new();

        loop {
            if let Some(start) = path.iter().position(|&p| p == current) {
                let mut cycle: Vec<String> = path[start..]
                    .iter()
                    .map(|&i| self.nodes[i].id.clone())
                    .collect();
                cycle.push(self.nodes[current].id.clone());
                return cycle;
            }
            path.push(current);

            let next = self.nodes[current]
                .depends_on
                .iter()
                .filter_map(|dep| self.index.get(dep).copied())
                .find(|&j| !emitted[j]);
            match next {
                Some(j) => current = j,
                None => return path.iter().map(|&i| self.nodes[i].id.clone()).collect(),
            }
        }
    }
}
