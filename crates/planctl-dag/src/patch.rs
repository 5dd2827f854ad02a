//! `applyPatch`: the narrow set of structural edits a repair or refine step
//! may make to a compiled DAG.

use planctl_core::dag::{Edge, Node, PlanDag};
use thiserror::Error;

/// Nodes the compiler always emits and that no patch may remove, since
/// downstream stages (acceptance, strict-resume conventions) assume they
/// exist.
const CORE_NODE_IDS: &[&str] = &[
    "setup.venv",
    "install.deps",
    "train.run",
    "eval.run",
    "report.write",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum PatchOp {
    AddNode { node: Node },
    RemoveNode { node_id: String },
    ReplaceNode { node_id: String, node: Node },
    AddEdge { edge: Edge },
    RemoveEdge { from: String, to: String },
}

use serde::{Deserialize, Serialize};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error("node {0} already exists")]
    DuplicateNode(String),
    #[error("node {0} does not exist")]
    UnknownNode(String),
    #[error("cannot remove core node {0}")]
    CoreNodeRemoval(String),
    #[error("edge {0} -> {1} does not exist")]
    UnknownEdge(String, String),
}

fn is_core_node(id: &str) -> bool {
    CORE_NODE_IDS.contains(&id)
}

/// Applies patch ops in order, failing (and leaving the DAG untouched) on
/// the first op that doesn't apply cleanly.
pub fn apply_patch(dag: &PlanDag, ops: &[PatchOp]) -> Result<PlanDag, PatchError> {
    let mut next = dag.clone();
    for op in ops {
        apply_one(&mut next, op)?;
    }
    Ok(next)
}

fn apply_one(dag: &mut PlanDag, op: &PatchOp) -> Result<(), PatchError> {
    match op {
        PatchOp::AddNode { node } => {
            if dag.node(&node.id).is_some() {
                return Err(PatchError::DuplicateNode(node.id.clone()));
            }
            dag.nodes.push(node.clone());
        }
        PatchOp::RemoveNode { node_id } => {
            if is_core_node(node_id) {
                return Err(PatchError::CoreNodeRemoval(node_id.clone()));
            }
            if dag.node(node_id).is_none() {
                return Err(PatchError::UnknownNode(node_id.clone()));
            }
            dag.nodes.retain(|n| &n.id != node_id);
            dag.edges.retain(|e| &e.from != node_id && &e.to != node_id);
        }
        PatchOp::ReplaceNode { node_id, node } => {
            let idx = dag
                .nodes
                .iter()
                .position(|n| &n.id == node_id)
                .ok_or_else(|| PatchError::UnknownNode(node_id.clone()))?;
            dag.nodes[idx] = node.clone();
        }
        PatchOp::AddEdge { edge } => {
            if dag.node(&edge.from).is_none() {
                return Err(PatchError::UnknownNode(edge.from.clone()));
            }
            if dag.node(&edge.to).is_none() {
                return Err(PatchError::UnknownNode(edge.to.clone()));
            }
            dag.edges.push(edge.clone());
        }
        PatchOp::RemoveEdge { from, to } => {
            let before = dag.edges.len();
            dag.edges.retain(|e| !(&e.from == from && &e.to == to));
            if dag.edges.len() == before {
                return Err(PatchError::UnknownEdge(from.clone(), to.clone()));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use planctl_core::dag::Tool;
    use std::collections::HashMap;

    fn node(id: &str) -> Node {
        Node {
            id: id.to_string(),
            node_type: "noop".into(),
            tool: Tool::Shell,
            inputs: vec![],
            outputs: vec![],
            commands: vec!["true".into()],
            env: HashMap::new(),
            resources: None,
            retry_policy_id: None,
        }
    }

    fn base_dag() -> PlanDag {
        PlanDag {
            nodes: vec![
                node("setup.venv"),
                node("install.deps"),
                node("train.run"),
                node("eval.run"),
                node("report.write"),
            ],
            edges: vec![
                Edge { from: "setup.venv".into(), to: "install.deps".into(), reason: None },
                Edge { from: "install.deps".into(), to: "train.run".into(), reason: None },
            ],
        }
    }

    #[test]
    fn add_node_appends_new_node() {
        let dag = base_dag();
        let patched = apply_patch(&dag, &[PatchOp::AddNode { node: node("extra.step") }]).unwrap();
        assert!(patched.node("extra.step").is_some());
    }

    #[test]
    fn add_node_duplicate_is_rejected() {
        let dag = base_dag();
        let err = apply_patch(&dag, &[PatchOp::AddNode { node: node("train.run") }]).unwrap_err();
        assert_eq!(err, PatchError::DuplicateNode("train.run".into()));
    }

    #[test]
    fn removing_core_node_is_rejected() {
        let dag = base_dag();
        let err = apply_patch(&dag, &[PatchOp::RemoveNode { node_id: "train.run".into() }]).unwrap_err();
        assert_eq!(err, PatchError::CoreNodeRemoval("train.run".into()));
    }

    #[test]
    fn removing_non_core_node_also_drops_its_edges() {
        let mut dag = base_dag();
        dag.nodes.push(node("extra.step"));
        dag.edges.push(Edge { from: "train.run".into(), to: "extra.step".into(), reason: None });

        let patched = apply_patch(&dag, &[PatchOp::RemoveNode { node_id: "extra.step".into() }]).unwrap();
        assert!(patched.node("extra.step").is_none());
        assert!(!patched.edges.iter().any(|e| e.to == "extra.step"));
    }

    #[test]
    fn replace_node_swaps_definition_in_place() {
        let dag = base_dag();
        let mut replacement = node("train.run");
        replacement.commands = vec!["python train.py --resume".into()];
        let patched = apply_patch(&dag, &[PatchOp::ReplaceNode {
            node_id: "train.run".into(),
            node: replacement,
        }]).unwrap();
        assert_eq!(patched.node("train.run").unwrap().commands, vec!["python train.py --resume"]);
    }

    #[test]
    fn add_edge_between_unknown_node_is_rejected() {
        let dag = base_dag();
        let err = apply_patch(&dag, &[PatchOp::AddEdge {
            edge: Edge { from: "setup.venv".into(), to: "ghost".into(), reason: None },
        }]).unwrap_err();
        assert_eq!(err, PatchError::UnknownNode("ghost".into()));
    }

    #[test]
    fn remove_edge_missing_is_rejected() {
        let dag = base_dag();
        let err = apply_patch(&dag, &[PatchOp::RemoveEdge {
            from: "train.run".into(),
            to: "eval.run".into(),
        }]).unwrap_err();
        assert_eq!(err, PatchError::UnknownEdge("train.run".into(), "eval.run".into()));
    }

    #[test]
    fn ops_apply_in_order_and_leave_source_dag_untouched() {
        let dag = base_dag();
        let patched = apply_patch(&dag, &[
            PatchOp::AddNode { node: node("extra.step") },
            PatchOp::AddEdge {
                edge: Edge { from: "train.run".into(), to: "extra.step".into(), reason: None },
            },
        ]).unwrap();
        assert_eq!(dag.nodes.len(), 5);
        assert_eq!(patched.nodes.len(), 6);
        assert!(patched.edges.iter().any(|e| e.from == "train.run" && e.to == "extra.step"));
    }
}
