//! `validateConventions`: the fixed output/env contract certain well-known
//! node ids must honour, with an additional strict-resume contract used
//! before `execute`.

use planctl_core::dag::PlanDag;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConventionViolation {
    MissingOutput { node_id: String, expected: String },
    MissingCommand { node_id: String, expected_substring: String },
    MissingEnv { node_id: String, key: String },
    MissingNode { node_id: String },
}

impl std::fmt::Display for ConventionViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingOutput { node_id, expected } => {
                write!(f, "node {} is missing expected output {}", node_id, expected)
            }
            Self::MissingCommand { node_id, expected_substring } => {
                write!(f, "node {} has no command invoking {}", node_id, expected_substring)
            }
            Self::MissingEnv { node_id, key } => {
                write!(f, "node {} is missing required env var {}", node_id, key)
            }
            Self::MissingNode { node_id } => write!(f, "required node {} is absent", node_id),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConventionOptions {
    pub strict_resume: bool,
}

fn outputs_contain(dag: &PlanDag, node_id: &str, expected: &str) -> bool {
    dag.node(node_id)
        .map(|n| n.outputs.iter().any(|o| o == expected))
        .unwrap_or(false)
}

/// Find a repo key embedded in an output path like `cache/git/<repoKey>`,
/// returning each distinct repoKey referenced by `setup.venv`/`train.run`-ish
/// nodes' own outputs. Used to check per-repo conventions generically.
fn repo_keys_from_outputs(dag: &PlanDag, prefix: &str) -> Vec<String> {
    let mut keys = Vec::new();
    for n in &dag.nodes {
        for o in &n.outputs {
            if let Some(rest) = o.strip_prefix(prefix) {
                if !rest.is_empty() && !keys.contains(&rest.to_string()) {
                    keys.push(rest.to_string());
                }
            }
        }
    }
    keys
}

pub fn validate_conventions(dag: &PlanDag, opts: ConventionOptions) -> Vec<ConventionViolation> {
    let mut violations = Vec::new();

    if let Some(setup) = dag.node("setup.venv") {
        for expected in ["cache/hf", "cache/pip"] {
            if !setup.outputs.iter().any(|o| o == expected) {
                violations.push(ConventionViolation::MissingOutput {
                    node_id: "setup.venv".into(),
                    expected: expected.into(),
                });
            }
        }
        let repo_keys = repo_keys_from_outputs(dag, "cache/venv/");
        if repo_keys.is_empty() && !setup.outputs.iter().any(|o| o.starts_with("cache/venv/")) {
            violations.push(ConventionViolation::MissingOutput {
                node_id: "setup.venv".into(),
                expected: "cache/venv/<repoKey>".into(),
            });
        }
    } else {
        violations.push(ConventionViolation::MissingNode {
            node_id: "setup.venv".into(),
        });
    }

    if let Some(train) = dag.node("train.run") {
        let has_model_output = train.outputs.iter().any(|o| o.starts_with("artifacts/model/"));
        if !has_model_output {
            violations.push(ConventionViolation::MissingOutput {
                node_id: "train.run".into(),
                expected: "artifacts/model/<repoKey>".into(),
            });
        }

        if opts.strict_resume {
            if !outputs_contain(dag, "train.run", "report/checkpoint_manifest.json") {
                violations.push(ConventionViolation::MissingOutput {
                    node_id: "train.run".into(),
                    expected: "report/checkpoint_manifest.json".into(),
                });
            }
            let invokes_script = train
                .commands
                .iter()
                .any(|c| c.contains("plan/scripts/train.run.sh"));
            if !invokes_script {
                violations.push(ConventionViolation::MissingCommand {
                    node_id: "train.run".into(),
                    expected_substring: "plan/scripts/train.run.sh".into(),
                });
            }
            for key in ["OPENCLAW_PLAN_DIR", "OPENCLAW_CHECKPOINT_DIR"] {
                if !train.env.contains_key(key) {
                    violations.push(ConventionViolation::MissingEnv {
                        node_id: "train.run".into(),
                        key: key.into(),
                    });
                }
            }
        }
    } else {
        violations.push(ConventionViolation::MissingNode {
            node_id: "train.run".into(),
        });
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use planctl_core::dag::{Node, Tool};
    use std::collections::HashMap;

    fn setup_node(outputs: &[&str]) -> Node {
        Node {
            id: "setup.venv".into(),
            node_type: "setup_venv".into(),
            tool: Tool::Shell,
            inputs: vec![],
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            commands: vec!["python -m venv .venv".into()],
            env: HashMap::new(),
            resources: None,
            retry_policy_id: None,
        }
    }

    fn train_node(outputs: &[&str], commands: &[&str], env: &[(&str, &str)]) -> Node {
        Node {
            id: "train.run".into(),
            node_type: "train".into(),
            tool: Tool::Shell,
            inputs: vec![],
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            commands: commands.iter().map(|s| s.to_string()).collect(),
            env: env.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            resources: None,
            retry_policy_id: None,
        }
    }

    // ==== non-strict conventions ====

    #[test]
    fn well_formed_dag_passes_non_strict_conventions() {
        let dag = PlanDag {
            nodes: vec![
                setup_node(&["cache/venv/foo-bar", "cache/hf", "cache/pip"]),
                train_node(&["artifacts/model/foo-bar"], &["python train.py"], &[]),
            ],
            edges: vec![],
        };
        let violations = validate_conventions(&dag, ConventionOptions::default());
        assert!(violations.is_empty(), "{:?}", violations);
    }

    #[test]
    fn missing_setup_venv_node_is_flagged() {
        let dag = PlanDag {
            nodes: vec![train_node(&["artifacts/model/foo"], &[], &[])],
            edges: vec![],
        };
        let violations = validate_conventions(&dag, ConventionOptions::default());
        assert!(violations
            .iter()
            .any(|v| matches!(v, ConventionViolation::MissingNode { node_id } if node_id == "setup.venv")));
    }

    #[test]
    fn train_missing_model_output_is_flagged() {
        let dag = PlanDag {
            nodes: vec![
                setup_node(&["cache/venv/foo", "cache/hf", "cache/pip"]),
                train_node(&[], &[], &[]),
            ],
            edges: vec![],
        };
        let violations = validate_conventions(&dag, ConventionOptions::default());
        assert!(violations.iter().any(|v| matches!(
            v,
            ConventionViolation::MissingOutput { node_id, expected }
            if node_id == "train.run" && expected.starts_with("artifacts/model")
        )));
    }

    // ==== strict resume ====

    #[test]
    fn strict_resume_requires_checkpoint_script_and_env() {
        let dag = PlanDag {
            nodes: vec![
                setup_node(&["cache/venv/foo", "cache/hf", "cache/pip"]),
                train_node(&["artifacts/model/foo"], &["python train.py"], &[]),
            ],
            edges: vec![],
        };
        let violations = validate_conventions(&dag, ConventionOptions { strict_resume: true });
        assert!(violations.iter().any(|v| matches!(
            v,
            ConventionViolation::MissingOutput { expected, .. } if expected == "report/checkpoint_manifest.json"
        )));
        assert!(violations.iter().any(|v| matches!(
            v,
            ConventionViolation::MissingCommand { expected_substring, .. } if expected_substring.contains("train.run.sh")
        )));
        assert!(violations.iter().any(|v| matches!(
            v,
            ConventionViolation::MissingEnv { key, .. } if key == "OPENCLAW_PLAN_DIR"
        )));
    }

    #[test]
    fn strict_resume_satisfied_dag_has_no_violations() {
        let dag = PlanDag {
            nodes: vec![
                setup_node(&["cache/venv/foo", "cache/hf", "cache/pip"]),
                train_node(
                    &["artifacts/model/foo", "report/checkpoint_manifest.json"],
                    &["bash plan/scripts/train.run.sh"],
                    &[("OPENCLAW_PLAN_DIR", "/plan"), ("OPENCLAW_CHECKPOINT_DIR", "/plan/ckpt")],
                ),
            ],
            edges: vec![],
        };
        let violations = validate_conventions(&dag, ConventionOptions { strict_resume: true });
        assert!(violations.is_empty(), "{:?}", violations);
    }
}
