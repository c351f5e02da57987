//! Dependency graph discovery and ordering.
//!
//! BFS from a deploy's endpoints discovers every reachable resource;
//! a three-colour DFS produces a topological order with dependencies
//! first. Back-edges are recorded as circular-dependency warnings and
//! the sort continues with the partial order; validation later promotes
//! them to errors.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::warn;

use avaast_core::{DeployedEndpoint, Dependency, ResourceKind, ResourceRef};

/// One discovered resource node.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub resource: ResourceRef,
    pub kind: ResourceKind,
    pub dependencies: Vec<Dependency>,
}

/// The discovered graph plus its resolution order (dependencies first).
#[derive(Debug, Default)]
pub struct DependencyGraph {
    pub nodes: HashMap<String, GraphNode>,
    pub order: Vec<String>,
    /// Human-readable circular-dependency warnings found during the sort.
    pub cycles: Vec<String>,
}

/// Discover the graph reachable from `endpoints`. `resolve` maps a ref
/// (with the kind the referencing edge declares) to its node; unresolved
/// references are logged and skipped — they surface as validation errors.
pub fn build<F>(endpoints: &[DeployedEndpoint], resolve: F) -> DependencyGraph
where
    F: Fn(&ResourceRef, ResourceKind) -> Option<GraphNode>,
{
    let mut nodes: HashMap<String, GraphNode> = HashMap::new();
    let mut queue: VecDeque<(ResourceRef, ResourceKind)> = endpoints
        .iter()
        .map(|e| (e.resource.clone(), ResourceKind::from(e.kind)))
        .collect();

    while let Some((resource, kind)) = queue.pop_front() {
        let key = resource.key();
        if nodes.contains_key(&key) {
            continue;
        }
        let Some(node) = resolve(&resource, kind) else {
            warn!(resource = %resource, "unresolved reference, skipping");
            continue;
        };
        for dep in &node.dependencies {
            if dep.kind == ResourceKind::Collection {
                continue;
            }
            if let Some(dep_ref) = &dep.resource {
                queue.push_back((dep_ref.clone(), dep.kind));
            }
        }
        nodes.insert(key, node);
    }

    let (order, cycles) = topological_order(&nodes);
    DependencyGraph {
        nodes,
        order,
        cycles,
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Colour {
    White,
    Grey,
    Black,
}

/// DFS with three-colour marking. Emits dependencies before dependents;
/// back-edges are reported, not fatal.
fn topological_order(nodes: &HashMap<String, GraphNode>) -> (Vec<String>, Vec<String>) {
    let mut colours: HashMap<&str, Colour> =
        nodes.keys().map(|k| (k.as_str(), Colour::White)).collect();
    let mut order = Vec::with_capacity(nodes.len());
    let mut cycles = Vec::new();

    let mut keys: Vec<&String> = nodes.keys().collect();
    keys.sort();

    for key in keys {
        if colours[key.as_str()] == Colour::White {
            visit(key, nodes, &mut colours, &mut order, &mut cycles);
        }
    }
    (order, cycles)
}

fn visit<'a>(
    key: &'a str,
    nodes: &'a HashMap<String, GraphNode>,
    colours: &mut HashMap<&'a str, Colour>,
    order: &mut Vec<String>,
    cycles: &mut Vec<String>,
) {
    colours.insert(key, Colour::Grey);
    if let Some(node) = nodes.get(key) {
        for dep in &node.dependencies {
            let Some(dep_ref) = &dep.resource else {
                continue;
            };
            let dep_key = dep_ref.key();
            let Some((stored_key, _)) = nodes.get_key_value(&dep_key) else {
                continue;
            };
            match colours[stored_key.as_str()] {
                Colour::Grey => {
                    let msg = format!("circular dependency: {key} -> {dep_key}");
                    warn!("{msg}");
                    cycles.push(msg);
                }
                Colour::White => {
                    visit(stored_key, nodes, colours, order, cycles);
                }
                Colour::Black => {}
            }
        }
    }
    colours.insert(key, Colour::Black);
    order.push(key.to_string());
}

/// Check the graph against a deploy's endpoint list. Returns all
/// human-readable errors; an empty list means the graph is sound.
pub fn validate(graph: &DependencyGraph, endpoints: &[DeployedEndpoint]) -> Vec<String> {
    let mut errors = Vec::new();
    let known: HashSet<&String> = graph.nodes.keys().collect();

    for endpoint in endpoints {
        let key = endpoint.resource.key();
        if !known.contains(&key) {
            errors.push(format!(
                "endpoint {} references unknown resource {key}",
                endpoint.name
            ));
        }
    }

    for (key, node) in &graph.nodes {
        for dep in &node.dependencies {
            match dep.kind {
                ResourceKind::Collection => {
                    if dep.collection.as_deref().unwrap_or("").is_empty() {
                        errors.push(format!(
                            "resource {key} has a collection dependency without a collection NSID"
                        ));
                    }
                }
                _ => match &dep.resource {
                    None => {
                        errors.push(format!("resource {key} has a dependency without a ref"));
                    }
                    Some(dep_ref) => {
                        if !known.contains(&dep_ref.key()) {
                            errors.push(format!(
                                "resource {key} depends on unresolved {}",
                                dep_ref.key()
                            ));
                        }
                    }
                },
            }
        }
    }

    errors.extend(graph.cycles.iter().cloned());
    errors
}
