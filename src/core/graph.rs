//! TL-003: Dependency graph construction and wave scheduling.
//!
//! Edges are never declared: they are derived from the resource ids that a
//! node's inputs read from. `topological_order` groups nodes into waves
//! using Kahn's algorithm level by level, with alphabetical ordering inside
//! a wave for determinism.

use super::cell::{Output, ValueCell};
use super::error::DeclarationError;
use super::types::ResourceSpec;
use indexmap::IndexMap;
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, LazyLock, Mutex};

static RESOURCE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9_.-]*$").expect("resource id pattern is valid")
});

/// Whether `id` is usable as a resource id (and as a state file name).
pub fn is_valid_resource_id(id: &str) -> bool {
    RESOURCE_ID.is_match(id)
}

/// Output cells of one resource, keyed by field name. Shared between the
/// graph, every handle, and every by-name reference to the resource.
#[derive(Debug, Clone, Default)]
pub struct OutputTable(Arc<Mutex<IndexMap<String, Arc<ValueCell<Value>>>>>);

impl OutputTable {
    fn cell(&self, field: &str) -> Arc<ValueCell<Value>> {
        let mut cells = self.0.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(
            cells
                .entry(field.to_string())
                .or_insert_with(|| Arc::new(ValueCell::pending())),
        )
    }

    /// Snapshot of every requested output cell.
    pub fn cells(&self) -> Vec<(String, Arc<ValueCell<Value>>)> {
        let cells = self.0.lock().unwrap_or_else(|p| p.into_inner());
        cells
            .iter()
            .map(|(field, cell)| (field.clone(), Arc::clone(cell)))
            .collect()
    }
}

/// Handle returned when a resource is added to the graph.
#[derive(Debug, Clone)]
pub struct ResourceHandle {
    id: String,
    kind: String,
    outputs: OutputTable,
}

impl ResourceHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Deferred output field of this resource.
    pub fn output(&self, field: &str) -> Output<Value> {
        Output::from_cell(
            self.outputs.cell(field),
            BTreeSet::from([self.id.clone()]),
        )
    }
}

/// A resource in the graph with its derived dependencies.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub spec: ResourceSpec,
    pub depends_on: BTreeSet<String>,
    pub outputs: OutputTable,
}

/// One execution wave: resource ids whose dependencies are all in earlier waves.
pub type Wave = Vec<String>;

/// The set of declared resources and the edges implied by their inputs.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: IndexMap<String, GraphNode>,
    tables: HashMap<String, OutputTable>,
    exports: IndexMap<String, Output<Value>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource and record edges to every resource its inputs read.
    pub fn add_node(&mut self, spec: ResourceSpec) -> Result<ResourceHandle, DeclarationError> {
        if !is_valid_resource_id(&spec.id) {
            return Err(DeclarationError::InvalidResourceId(spec.id));
        }
        if self.nodes.contains_key(&spec.id) {
            return Err(DeclarationError::DuplicateResource(spec.id));
        }

        let outputs = self.table(&spec.id);
        let handle = ResourceHandle {
            id: spec.id.clone(),
            kind: spec.kind.clone(),
            outputs: outputs.clone(),
        };
        let depends_on = spec.depends_on();
        self.nodes.insert(
            spec.id.clone(),
            GraphNode {
                spec,
                depends_on,
                outputs,
            },
        );
        Ok(handle)
    }

    /// By-name reference to an output of a resource that may be declared later.
    pub fn reference(&mut self, resource_id: &str, field: &str) -> Output<Value> {
        Output::from_cell(
            self.table(resource_id).cell(field),
            BTreeSet::from([resource_id.to_string()]),
        )
    }

    /// Expose an output as a named result of the run.
    pub fn export(&mut self, name: impl Into<String>, output: Output<Value>) {
        self.exports.insert(name.into(), output);
    }

    pub fn exports(&self) -> &IndexMap<String, Output<Value>> {
        &self.exports
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn table(&mut self, resource_id: &str) -> OutputTable {
        self.tables
            .entry(resource_id.to_string())
            .or_default()
            .clone()
    }

    /// Group nodes into execution waves.
    ///
    /// Fails with `UnknownReference` if an input reads an undeclared resource,
    /// and with `CyclicDependency` naming the nodes on a cycle.
    pub fn topological_order(&self) -> Result<Vec<Wave>, DeclarationError> {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for id in self.nodes.keys() {
            in_degree.insert(id.as_str(), 0);
            dependents.insert(id.as_str(), Vec::new());
        }

        for (id, node) in &self.nodes {
            for dep in &node.depends_on {
                let Some(list) = dependents.get_mut(dep.as_str()) else {
                    return Err(DeclarationError::UnknownReference {
                        from: id.clone(),
                        to: dep.clone(),
                    });
                };
                list.push(id.as_str());
                *in_degree.entry(id.as_str()).or_default() += 1;
            }
        }

        let mut current: Vec<&str> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(id, _)| *id)
            .collect();
        current.sort_unstable();

        let mut waves: Vec<Wave> = Vec::new();
        let mut ordered = 0usize;
        while !current.is_empty() {
            let mut next: Vec<&str> = Vec::new();
            for id in &current {
                for dependent in dependents.get(id).map(Vec::as_slice).unwrap_or_default() {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(*dependent);
                        }
                    }
                }
            }
            next.sort_unstable();
            ordered += current.len();
            waves.push(current.iter().map(|s| s.to_string()).collect());
            current = next;
        }

        if ordered != self.nodes.len() {
            let mut blocked: HashSet<&str> = in_degree
                .into_iter()
                .filter(|(_, d)| *d > 0)
                .map(|(id, _)| id)
                .collect();
            // Peel nodes that only sit downstream of a cycle.
            loop {
                let sinks: Vec<&str> = blocked
                    .iter()
                    .copied()
                    .filter(|id| {
                        dependents
                            .get(id)
                            .is_none_or(|list| !list.iter().any(|d| blocked.contains(d)))
                    })
                    .collect();
                if sinks.is_empty() {
                    break;
                }
                for id in sinks {
                    blocked.remove(id);
                }
            }
            let mut ids: Vec<String> = blocked.into_iter().map(str::to_string).collect();
            ids.sort();
            return Err(DeclarationError::CyclicDependency { ids });
        }

        Ok(waves)
    }

    /// Every resource that transitively depends on `id`.
    pub fn dependents_of(&self, id: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut queue = VecDeque::from([id.to_string()]);
        while let Some(current) = queue.pop_front() {
            for (other, node) in &self.nodes {
                if node.depends_on.contains(&current) && found.insert(other.clone()) {
                    queue.push_back(other.clone());
                }
            }
        }
        found
    }
}
