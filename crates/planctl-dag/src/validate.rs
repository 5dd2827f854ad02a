//! `validateDag`: topological validation with deterministic lexical tie-breaking.

use planctl_core::dag::PlanDag;
use std::collections::{BTreeSet, HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DagError {
    DuplicateId(String),
    MissingEdgeEndpoint { edge_from: String, edge_to: String, missing: String },
    Cycle(Vec<String>),
}

impl std::fmt::Display for DagError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateId(id) => write!(f, "duplicate node id: {}", id),
            Self::MissingEdgeEndpoint { edge_from, edge_to, missing } => {
                write!(f, "edge {} -> {} references missing node {}", edge_from, edge_to, missing)
            }
            Self::Cycle(remaining) => write!(f, "cycle detected among nodes: {}", remaining.join(", ")),
        }
    }
}

/// Kahn's algorithm with ties among ready nodes broken by lexical id, so the
/// resulting order is a deterministic function of the DAG's contents.
pub fn validate_dag(dag: &PlanDag) -> Result<Vec<String>, Vec<DagError>> {
    let mut errors = Vec::new();

    let mut seen = HashSet::new();
    for n in &dag.nodes {
        if !seen.insert(n.id.clone()) {
            errors.push(DagError::DuplicateId(n.id.clone()));
        }
    }

    let ids: HashSet<&str> = dag.nodes.iter().map(|n| n.id.as_str()).collect();
    for e in &dag.edges {
        if !ids.contains(e.from.as_str()) {
            errors.push(DagError::MissingEdgeEndpoint {
                edge_from: e.from.clone(),
                edge_to: e.to.clone(),
                missing: e.from.clone(),
            });
        }
        if !ids.contains(e.to.as_str()) {
            errors.push(DagError::MissingEdgeEndpoint {
                edge_from: e.from.clone(),
                edge_to: e.to.clone(),
                missing: e.to.clone(),
            });
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    let mut indegree: HashMap<&str, usize> = dag.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
    let mut adj: HashMap<&str, Vec<&str>> = dag.nodes.iter().map(|n| (n.id.as_str(), Vec::new())).collect();
    for e in &dag.edges {
        *indegree.get_mut(e.to.as_str()).unwrap() += 1;
        adj.get_mut(e.from.as_str()).unwrap().push(e.to.as_str());
    }

    let mut ready: BTreeSet<&str> = indegree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&id, _)| id)
        .collect();

    let mut order = Vec::with_capacity(dag.nodes.len());
    while let Some(&next) = ready.iter().next() {
        ready.remove(next);
        order.push(next.to_string());
        for &succ in adj.get(next).unwrap_or(&Vec::new()) {
            let d = indegree.get_mut(succ).unwrap();
            *d -= 1;
            if *d == 0 {
                ready.insert(succ);
            }
        }
    }

    if order.len() != dag.nodes.len() {
        let remaining: Vec<String> = indegree
            .iter()
            .filter(|(id, &d)| d > 0 || !order.contains(&id.to_string()))
            .map(|(&id, _)| id.to_string())
            .collect();
        let mut remaining = remaining;
        remaining.sort();
        return Err(vec![DagError::Cycle(remaining)]);
    }

    Ok(order)
}
