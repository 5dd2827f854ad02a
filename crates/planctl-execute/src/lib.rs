//! Execute Engine (C4, spec §4.3): walks a validated plan DAG in topological
//! order, running each node's commands either as a skipped manual gate, a
//! CPU shell step inside the plan's sandbox container, or a GPU step routed
//! either directly at a caller-chosen node or through the job scheduler.
//! Grounded on `agenticlaw-agent`'s tool-loop retry/backoff handling,
//! generalized from a single LLM tool call to a DAG node with its own retry
//! policy, and on `planctl-sandbox`/`planctl-registry`/`planctl-scheduler`
//! for the three execution substrates.

use planctl_core::dag::{Node, NodeStatus, PlanDag, Tool};
use planctl_core::gpu_job::{ApprovalDecision, ExecSpec, JobState};
use planctl_core::layout::{write_json_pretty, PlanLayout};
use planctl_core::retry::{RetryCategory, RetrySpec};
use planctl_dag::validate::{validate_dag, DagError};
use planctl_registry::NodeRegistry;
use planctl_sandbox::{container_workdir, ProcessExecutor, SandboxError, SandboxRunner, SystemExecutor};
use planctl_scheduler::{Scheduler, SubmitRequest};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const LOG_TAIL_CHARS: usize = 1200;
const GPU_POLL_INTERVAL_MS: u64 = 1000;
const GPU_WAIT_CHUNK_MS: u64 = 15_000;
const GATEWAY_DEADLINE_SLACK_MS: u64 = 60_000;

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("plan dag is invalid: {0:?}")]
    InvalidDag(Vec<DagError>),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which substrate actually ran a node, recorded in `execute_log.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Executor {
    Manual,
    Sandbox,
    GatewayDirect,
    Scheduler,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at_ms: i64,
    pub finished_at_ms: i64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<RetryCategory>,
    #[serde(default)]
    pub repaired: bool,
    pub stdout_tail: String,
    pub stderr_tail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResult {
    pub node_id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub tool: Tool,
    pub status: NodeStatus,
    pub executor: Executor,
    pub attempts: Vec<AttemptRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteLog {
    pub results: Vec<NodeResult>,
}

/// Context handed to a `RepairHook` when a node attempt fails and its
/// failure category is eligible for repair (spec §4.7: everything except
/// `network`/`rate_limit`).
pub struct RepairContext<'a> {
    pub node_id: &'a str,
    pub attempt: u32,
    pub category: RetryCategory,
    pub stdout: &'a str,
    pub stderr: &'a str,
}

/// Decouples the execute engine from `planctl-repair`'s LLM/patch
/// internals, the same seam `LlmClient`/`FrameworkAdapter` use elsewhere in
/// this workspace. `on_failure` returns a short patch summary if a patch was
/// produced and applied; `finalize` is called once the attempt that follows
/// a repair completes, so the repair crate can snapshot after-logs/metrics.
#[async_trait::async_trait]
pub trait RepairHook: Send {
    async fn on_failure(&mut self, ctx: RepairContext<'_>) -> Option<String>;
    async fn finalize(&mut self, node_id: &str, ok: bool, stdout: &str, stderr: &str);
}

/// Caller-supplied execution parameters (spec §4.3's per-node overrides and
/// the overall GPU routing choice).
pub struct ExecuteOptions {
    pub plan_id: String,
    pub agent_id: String,
    /// When set, every GPU node is routed gateway-direct at this node id
    /// instead of through the scheduler.
    pub gpu_node_id: Option<String>,
    pub default_command_timeout_ms: u64,
    pub default_invoke_timeout_ms: u64,
    pub gpu_wait_timeout_ms: u64,
    /// Ceiling applied on top of each node's classified retry policy's
    /// `max_attempts` (spec: `min(caller_maxAttempts, policy.maxAttempts)`).
    pub caller_max_attempts: u32,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            plan_id: "plan".to_string(),
            agent_id: "agent".to_string(),
            gpu_node_id: None,
            default_command_timeout_ms: 600_000,
            default_invoke_timeout_ms: 30_000,
            gpu_wait_timeout_ms: 300_000,
            caller_max_attempts: 5,
        }
    }
}

fn tail(s: &str, max_chars: usize) -> String {
    let count = s.chars().count();
    if count <= max_chars {
        s.to_string()
    } else {
        s.chars().skip(count - max_chars).collect()
    }
}

fn jitter_factor() -> f64 {
    rand::thread_rng().gen_range(0.75..=1.25)
}

/// The host-side directory a node's commands run from: the first
/// `cache/git/...` entry among its declared inputs if present, else the
/// plan root (spec §4.3 step 1).
fn node_workdir(layout: &PlanLayout, node: &Node) -> PathBuf {
    node.inputs
        .iter()
        .find(|i| i.starts_with("cache/git/"))
        .map(|rel| layout.root.join(rel))
        .unwrap_or_else(|| layout.root.clone())
}

fn shell_script(node: &Node) -> String {
    format!("set -e\n{}\n", node.commands.join("\n"))
}

pub struct ExecuteEngine<'a, E: ProcessExecutor = SystemExecutor> {
    layout: &'a PlanLayout,
    retry_spec: &'a RetrySpec,
    sandbox: &'a SandboxRunner<E>,
    registry: Arc<NodeRegistry>,
    scheduler: Option<&'a Scheduler>,
    repair: Option<&'a mut dyn RepairHook>,
    opts: ExecuteOptions,
}

impl<'a, E: ProcessExecutor> ExecuteEngine<'a, E> {
    pub fn new(
        layout: &'a PlanLayout,
        retry_spec: &'a RetrySpec,
        sandbox: &'a SandboxRunner<E>,
        registry: Arc<NodeRegistry>,
        scheduler: Option<&'a Scheduler>,
        repair: Option<&'a mut dyn RepairHook>,
        opts: ExecuteOptions,
    ) -> Self {
        Self { layout, retry_spec, sandbox, registry, scheduler, repair, opts }
    }

    pub async fn run(&mut self, dag: &PlanDag) -> Result<ExecuteLog, ExecuteError> {
        let order = validate_dag(dag).map_err(ExecuteError::InvalidDag)?;
        let mut log = ExecuteLog::default();
        let mut sandbox_ensured = false;

        for node_id in order {
            let node = dag.node(&node_id).expect("validate_dag only returns known ids");

            if matches!(node.tool, Tool::Manual) || node.commands.is_empty() {
                log.results.push(NodeResult {
                    node_id: node.id.clone(),
                    node_type: node.node_type.clone(),
                    tool: node.tool,
                    status: NodeStatus::Skipped,
                    executor: Executor::Manual,
                    attempts: vec![],
                });
                continue;
            }

            let result = if node.is_gpu_node() {
                self.run_gpu_node(node).await
            } else {
                if !sandbox_ensured {
                    self.sandbox
                        .ensure_container(&self.opts.plan_id, &self.opts.agent_id, &self.layout.root)
                        .await?;
                    sandbox_ensured = true;
                }
                self.run_cpu_node(node).await
            };
            match &result.status {
                NodeStatus::Ok | NodeStatus::Skipped => {
                    info!(node_id = %result.node_id, status = ?result.status, "node finished")
                }
                _ => warn!(node_id = %result.node_id, status = ?result.status, "node finished"),
            }
            log.results.push(result);
        }

        write_json_pretty(&self.layout.execute_log_json(), &log)?;
        std::fs::write(self.layout.execute_summary_md(), render_summary(&log))?;
        Ok(log)
    }

    async fn run_cpu_node(&mut self, node: &Node) -> NodeResult {
        let workdir_host = node_workdir(self.layout, node);
        let container_wd = container_workdir(&self.layout.root, &workdir_host);
        let script = shell_script(node);
        let command_timeout_ms = node
            .resources
            .as_ref()
            .and_then(|r| r.estimated_minutes)
            .map(|m| (m * 60_000.0) as u64)
            .unwrap_or(self.opts.default_command_timeout_ms);

        let mut attempts = Vec::new();
        let mut pending_repair = false;
        let mut attempt_n: u32 = 0;
        let final_status;

        loop {
            attempt_n += 1;
            let started_at_ms = now_ms();
            let run = self
                .sandbox
                .run_shell(
                    &self.opts.plan_id,
                    &self.opts.agent_id,
                    &container_wd,
                    &node.env,
                    &script,
                    Duration::from_millis(command_timeout_ms),
                )
                .await;

            let (ok, exit_code, timed_out, stdout, stderr, error) = match run {
                Ok(r) => (r.exit_code == Some(0) && !r.killed, r.exit_code, r.killed, r.stdout, r.stderr, None),
                Err(e) => (false, None, false, String::new(), String::new(), Some(e.to_string())),
            };
            let finished_at_ms = now_ms();

            let combined = format!("{}{}", stderr, stdout);
            let category = if ok { None } else { Some(self.retry_spec.classify(&combined, node.retry_policy_id.as_deref())) };

            if pending_repair {
                if let Some(hook) = self.repair.as_deref_mut() {
                    hook.finalize(&node.id, ok, &stdout, &stderr).await;
                }
                pending_repair = false;
            }

            let mut repaired = false;
            if !ok {
                if let Some(policy) = category {
                    if !matches!(policy.category, RetryCategory::Network | RetryCategory::RateLimit) {
                        if let Some(hook) = self.repair.as_deref_mut() {
                            let ctx = RepairContext {
                                node_id: &node.id,
                                attempt: attempt_n,
                                category: policy.category,
                                stdout: &stdout,
                                stderr: &stderr,
                            };
                            if hook.on_failure(ctx).await.is_some() {
                                repaired = true;
                                pending_repair = true;
                            }
                        }
                    }
                }
            }

            attempts.push(AttemptRecord {
                attempt: attempt_n,
                started_at_ms,
                finished_at_ms,
                ok,
                exit_code,
                timed_out,
                category: category.map(|p| p.category),
                repaired,
                stdout_tail: tail(&stdout, LOG_TAIL_CHARS),
                stderr_tail: tail(&stderr, LOG_TAIL_CHARS),
                error,
            });

            if ok {
                final_status = NodeStatus::Ok;
                break;
            }

            let cap = category.map(|p| p.max_attempts.min(self.opts.caller_max_attempts)).unwrap_or(1);
            if attempt_n >= cap {
                final_status = NodeStatus::Failed;
                break;
            }

            if let Some(policy) = category {
                let delay = policy.backoff.delay_ms(attempt_n, jitter_factor());
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
        }

        // If the retry budget was exhausted on the same attempt a repair was
        // applied for, there's no following attempt to report — the repair
        // crate's own evidence for that attempt stays `applied_only`.
        let _ = pending_repair;

        NodeResult {
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
            tool: node.tool,
            status: final_status,
            executor: Executor::Sandbox,
            attempts,
        }
    }

    async fn run_gpu_node(&mut self, node: &Node) -> NodeResult {
        if let Some(node_id) = self.opts.gpu_node_id.clone() {
            self.run_gpu_gateway_direct(node, &node_id).await
        } else {
            self.run_gpu_scheduled(node).await
        }
    }

    async fn run_gpu_gateway_direct(&mut self, node: &Node, node_id: &str) -> NodeResult {
        let req = node.resources.clone().unwrap_or_default();
        let deadline = Duration::from_millis(self.opts.gpu_wait_timeout_ms);
        let waited = tokio::time::Instant::now();

        let found = loop {
            if let Some(session) = self.registry.get(node_id) {
                if session.advertises("system.run") && session.resources.satisfies(&req) {
                    break true;
                }
            }
            if waited.elapsed() >= deadline {
                break false;
            }
            tokio::time::sleep(Duration::from_millis(GPU_POLL_INTERVAL_MS)).await;
        };

        if !found {
            return NodeResult {
                node_id: node.id.clone(),
                node_type: node.node_type.clone(),
                tool: node.tool,
                status: NodeStatus::Failed,
                executor: Executor::GatewayDirect,
                attempts: vec![AttemptRecord {
                    attempt: 1,
                    started_at_ms: now_ms(),
                    finished_at_ms: now_ms(),
                    ok: false,
                    exit_code: None,
                    timed_out: true,
                    category: None,
                    repaired: false,
                    stdout_tail: String::new(),
                    stderr_tail: String::new(),
                    error: Some(format!("no eligible node {} available within gpuWaitTimeoutMs", node_id)),
                }],
            };
        }

        let params = serde_json::json!({
            "argv": node.commands,
            "env": node.env,
        });
        let started_at_ms = now_ms();
        let outcome = self
            .registry
            .invoke(node_id, "system.run", params, Some(self.opts.default_invoke_timeout_ms), None)
            .await;
        let finished_at_ms = now_ms();

        let (ok, exit_code, stdout, stderr, error) = match outcome {
            Ok(o) => {
                let exit_code = o.payload.as_ref().and_then(|p| p.get("exitCode")).and_then(|v| v.as_i64()).map(|v| v as i32);
                let stdout = o.payload.as_ref().and_then(|p| p.get("stdoutTail")).and_then(|v| v.as_str()).unwrap_or_default().to_string();
                let stderr = o.payload.as_ref().and_then(|p| p.get("stderrTail")).and_then(|v| v.as_str()).unwrap_or_default().to_string();
                (o.ok && exit_code == Some(0), exit_code, stdout, stderr, o.error)
            }
            Err(e) => (false, None, String::new(), String::new(), Some(e.to_string())),
        };

        NodeResult {
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
            tool: node.tool,
            status: if ok { NodeStatus::Ok } else { NodeStatus::Failed },
            executor: Executor::GatewayDirect,
            attempts: vec![AttemptRecord {
                attempt: 1,
                started_at_ms,
                finished_at_ms,
                ok,
                exit_code,
                timed_out: false,
                category: None,
                repaired: false,
                stdout_tail: tail(&stdout, LOG_TAIL_CHARS),
                stderr_tail: tail(&stderr, LOG_TAIL_CHARS),
                error,
            }],
        }
    }

    async fn run_gpu_scheduled(&mut self, node: &Node) -> NodeResult {
        let Some(scheduler) = self.scheduler else {
            return NodeResult {
                node_id: node.id.clone(),
                node_type: node.node_type.clone(),
                tool: node.tool,
                status: NodeStatus::Failed,
                executor: Executor::Scheduler,
                attempts: vec![AttemptRecord {
                    attempt: 1,
                    started_at_ms: now_ms(),
                    finished_at_ms: now_ms(),
                    ok: false,
                    exit_code: None,
                    timed_out: false,
                    category: None,
                    repaired: false,
                    stdout_tail: String::new(),
                    stderr_tail: String::new(),
                    error: Some("gpu node requires a scheduler but none was configured".to_string()),
                }],
            };
        };

        let req = SubmitRequest {
            resources: node.resources.clone().unwrap_or_default(),
            exec: ExecSpec {
                argv: node.commands.clone(),
                cwd: None,
                env: node.env.clone(),
                command_timeout_ms: Some(self.opts.default_command_timeout_ms),
                invoke_timeout_ms: Some(self.opts.default_invoke_timeout_ms),
                approved: true,
                approval_decision: Some(ApprovalDecision::AllowOnce),
            },
            max_attempts: Some(1),
            policy: None,
        };

        let started_at_ms = now_ms();
        let job = match scheduler.submit(req).await {
            Ok(j) => j,
            Err(e) => {
                return NodeResult {
                    node_id: node.id.clone(),
                    node_type: node.node_type.clone(),
                    tool: node.tool,
                    status: NodeStatus::Failed,
                    executor: Executor::Scheduler,
                    attempts: vec![AttemptRecord {
                        attempt: 1,
                        started_at_ms,
                        finished_at_ms: now_ms(),
                        ok: false,
                        exit_code: None,
                        timed_out: false,
                        category: None,
                        repaired: false,
                        stdout_tail: String::new(),
                        stderr_tail: String::new(),
                        error: Some(e.to_string()),
                    }],
                };
            }
        };

        let overall_deadline_ms = self.opts.default_invoke_timeout_ms
            + self.opts.default_command_timeout_ms
            + GATEWAY_DEADLINE_SLACK_MS;
        let deadline = tokio::time::Instant::now() + Duration::from_millis(overall_deadline_ms);

        let final_job = loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                let _ = scheduler.cancel(&job.job_id).await;
                break scheduler.get(&job.job_id).await.unwrap_or(job.clone());
            }
            let chunk = remaining.as_millis().min(GPU_WAIT_CHUNK_MS as u128) as u64;
            match scheduler.wait(&job.job_id, chunk).await {
                Ok(outcome) if outcome.done => break outcome.job,
                Ok(_) => continue,
                Err(_) => break scheduler.get(&job.job_id).await.unwrap_or(job.clone()),
            }
        };

        let last = final_job.attempts.last();
        let ok = matches!(final_job.state, JobState::Succeeded);
        let (exit_code, stdout, stderr, timed_out, error) = match last {
            Some(a) => (
                a.exit_code,
                a.stdout_tail.clone().unwrap_or_default(),
                a.stderr_tail.clone().unwrap_or_default(),
                a.timed_out.unwrap_or(false),
                a.error.clone(),
            ),
            None => (None, String::new(), String::new(), false, None),
        };

        NodeResult {
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
            tool: node.tool,
            status: if ok { NodeStatus::Ok } else { NodeStatus::Failed },
            executor: Executor::Scheduler,
            attempts: vec![AttemptRecord {
                attempt: 1,
                started_at_ms,
                finished_at_ms: now_ms(),
                ok,
                exit_code,
                timed_out,
                category: None,
                repaired: false,
                stdout_tail: tail(&stdout, LOG_TAIL_CHARS),
                stderr_tail: tail(&stderr, LOG_TAIL_CHARS),
                error,
            }],
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn render_summary(log: &ExecuteLog) -> String {
    let mut out = String::from("# Execute Summary\n\n| node | status | executor | attempts |\n| --- | --- | --- | --- |\n");
    for r in &log.results {
        out.push_str(&format!(
            "| {} | {:?} | {:?} | {} |\n",
            r.node_id,
            r.status,
            r.executor,
            r.attempts.len()
        ));
    }
    out
}
