//! Safe-subset run (spec §4.9 `plan` mode step 3): before a plan is ever
//! handed to the full execute engine, run only its low-risk nodes —
//! repo/dataset fetches and static checks — through the sandbox directly,
//! skipping nodes whose required credentials are absent instead of letting
//! them fail loudly. No retries, no GPU routing: this is a dry-run quality
//! gate, not the real execution substrate.

use planctl_core::credentials::ResolvedCredentials;
use planctl_core::dag::{Node, NodeStatus, PlanDag};
use planctl_core::layout::PlanLayout;
use planctl_dag::validate::validate_dag;
use planctl_sandbox::{ProcessExecutor, SandboxRunner};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Node types the safe-run stage is willing to execute. Everything else
/// (`setup_venv`, `install_deps`, `train`, `eval`, `manual_review`, ...) is
/// left untouched for the real execute engine.
const SAFE_NODE_TYPES: &[&str] = &["fetch_repo", "fetch_dataset_sample", "fetch_dataset_kaggle", "static_checks"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafeRunNodeResult {
    pub node_id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SafeRunReport {
    pub results: Vec<SafeRunNodeResult>,
}

impl SafeRunReport {
    pub fn ok(&self) -> bool {
        !self.results.iter().any(|r| r.status == NodeStatus::Failed)
    }
}

pub struct SafeRunOptions {
    pub plan_id: String,
    pub agent_id: String,
    pub env: HashMap<String, String>,
    pub command_timeout_ms: u64,
}

/// Same workdir convention the execute engine uses (spec §4.3 step 1):
/// first `cache/git/...` input if present, else the plan root.
fn node_workdir(layout: &PlanLayout, node: &Node) -> PathBuf {
    node.inputs
        .iter()
        .find(|i| i.starts_with("cache/git/"))
        .map(|rel| layout.root.join(rel))
        .unwrap_or_else(|| layout.root.clone())
}

fn container_workdir(layout: &PlanLayout, node: &Node) -> String {
    let host = node_workdir(layout, node);
    planctl_sandbox::container_workdir(&layout.root, &host)
}

pub async fn run_safe_subset<E: ProcessExecutor>(
    layout: &PlanLayout,
    dag: &PlanDag,
    sandbox: &SandboxRunner<E>,
    credentials: &ResolvedCredentials,
    opts: &SafeRunOptions,
) -> SafeRunReport {
    let order = match validate_dag(dag) {
        Ok(order) => order,
        Err(_) => return SafeRunReport::default(),
    };

    let mut report = SafeRunReport::default();
    for node_id in order {
        let Some(node) = dag.node(&node_id) else { continue };
        if !SAFE_NODE_TYPES.contains(&node.node_type.as_str()) {
            continue;
        }

        if node.node_type == "fetch_dataset_kaggle" && !credentials.has_kaggle() {
            report.results.push(SafeRunNodeResult {
                node_id: node.id.clone(),
                node_type: node.node_type.clone(),
                status: NodeStatus::Skipped,
                error: Some("skipped: missing Kaggle credentials (KAGGLE_USERNAME/KAGGLE_KEY)".to_string()),
            });
            continue;
        }

        if node.is_effectively_skipped() {
            report.results.push(SafeRunNodeResult {
                node_id: node.id.clone(),
                node_type: node.node_type.clone(),
                status: NodeStatus::Skipped,
                error: None,
            });
            continue;
        }

        let workdir = container_workdir(layout, node);
        let script = format!("set -e\n{}\n", node.commands.join("\n"));
        let outcome = sandbox
            .run_shell(&opts.plan_id, &opts.agent_id, &workdir, &opts.env, &script, Duration::from_millis(opts.command_timeout_ms))
            .await;

        let (status, error) = match outcome {
            Ok(result) if result.exit_code == Some(0) && !result.killed => (NodeStatus::Ok, None),
            Ok(result) => (NodeStatus::Failed, Some(result.stderr)),
            Err(e) => (NodeStatus::Failed, Some(e.to_string())),
        };
        report.results.push(SafeRunNodeResult { node_id: node.id.clone(), node_type: node.node_type.clone(), status, error });
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use planctl_core::dag::{Edge, Tool};
    use planctl_sandbox::RawOutput;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct StubExecutor {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ProcessExecutor for StubExecutor {
        async fn run(&self, _program: &str, args: &[String], _timeout: Duration) -> std::io::Result<RawOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if args.iter().any(|a| a.contains("fail")) {
                Ok(RawOutput { stdout: vec![], stderr: b"boom".to_vec(), exit_code: Some(1), timed_out: false })
            } else {
                Ok(RawOutput { stdout: b"ok".to_vec(), stderr: vec![], exit_code: Some(0), timed_out: false })
            }
        }
    }

    fn shell_node(id: &str, node_type: &str, commands: Vec<String>) -> Node {
        Node {
            id: id.to_string(),
            node_type: node_type.to_string(),
            tool: Tool::Shell,
            inputs: vec![],
            outputs: vec![],
            commands,
            env: HashMap::new(),
            resources: None,
            retry_policy_id: None,
        }
    }

    fn opts() -> SafeRunOptions {
        SafeRunOptions { plan_id: "p1".into(), agent_id: "agent-1".into(), env: HashMap::new(), command_timeout_ms: 5_000 }
    }

    #[tokio::test]
    async fn non_safe_node_types_are_skipped_over() {
        let dir = tempdir().unwrap();
        let layout = PlanLayout::new(dir.path());
        layout.create_skeleton().unwrap();
        let dag = PlanDag { nodes: vec![shell_node("train.run", "train", vec!["true".into()])], edges: vec![] };

        let sandbox = SandboxRunner::with_executor(StubExecutor { calls: AtomicUsize::new(0) }, "img:latest");
        let creds = ResolvedCredentials::default();
        let report = run_safe_subset(&layout, &dag, &sandbox, &creds, &opts()).await;
        assert!(report.results.is_empty());
    }

    #[tokio::test]
    async fn kaggle_node_without_credentials_is_skipped_with_message() {
        let dir = tempdir().unwrap();
        let layout = PlanLayout::new(dir.path());
        layout.create_skeleton().unwrap();
        let dag = PlanDag {
            nodes: vec![shell_node("data.fetch.owner-ds", "fetch_dataset_kaggle", vec!["kaggle datasets download owner/ds".into()])],
            edges: vec![],
        };

        let sandbox = SandboxRunner::with_executor(StubExecutor { calls: AtomicUsize::new(0) }, "img:latest");
        let creds = ResolvedCredentials::default();
        let report = run_safe_subset(&layout, &dag, &sandbox, &creds, &opts()).await;
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].status, NodeStatus::Skipped);
        assert!(report.results[0].error.as_ref().unwrap().contains("Kaggle credentials"));
    }

    #[tokio::test]
    async fn fetch_repo_node_runs_through_sandbox() {
        let dir = tempdir().unwrap();
        let layout = PlanLayout::new(dir.path());
        layout.create_skeleton().unwrap();
        let dag = PlanDag {
            nodes: vec![
                shell_node("repo.fetch.foo", "fetch_repo", vec!["git clone --depth 1 https://example.com/foo cache/git/foo".into()]),
                shell_node("repo.check.foo", "static_checks", vec!["cd cache/git/foo && ls".into()]),
            ],
            edges: vec![Edge { from: "repo.fetch.foo".into(), to: "repo.check.foo".into(), reason: None }],
        };

        let sandbox = SandboxRunner::with_executor(StubExecutor { calls: AtomicUsize::new(0) }, "img:latest");
        sandbox.ensure_container("p1", "agent-1", dir.path()).await.unwrap();
        let creds = ResolvedCredentials::default();
        let report = run_safe_subset(&layout, &dag, &sandbox, &creds, &opts()).await;
        assert_eq!(report.results.len(), 2);
        assert!(report.ok());
    }
}
