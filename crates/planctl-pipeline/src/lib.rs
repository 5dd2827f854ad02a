//! Pipeline Orchestrator (C10, spec §4.9): sequences the plan lifecycle —
//! compile → validate → safe-run → refine → execute → finalize → accept —
//! stopping at the first stage that doesn't come back ok and exposing every
//! stage's own payload so a caller (the CLI, the gateway) can report
//! exactly where things stopped.

pub mod finalize;
pub mod safe_run;

use chrono::{DateTime, Utc};
use finalize::finalize_plan;
use planctl_accept::{accept_proposal_results, AcceptOptions};
use planctl_compiler::discovery::DiscoveryMode;
use planctl_compiler::{compile_proposal, CompileInput};
use planctl_core::credentials::{resolve as resolve_credentials, SecretsFile};
use planctl_core::dag::PlanDag;
use planctl_core::layout::{read_json, PlanLayout};
use planctl_core::retry::RetrySpec;
use planctl_dag::conventions::{validate_conventions, ConventionOptions};
use planctl_dag::patch::{apply_patch, PatchOp};
use planctl_dag::validate::validate_dag;
use planctl_execute::{ExecuteEngine, ExecuteOptions, RepairHook};
use planctl_llm::LlmClient;
use planctl_registry::NodeRegistry;
use planctl_sandbox::{ProcessExecutor, SandboxRunner};
use planctl_scheduler::Scheduler;
use safe_run::{run_safe_subset, SafeRunOptions};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    /// compile → validate → safe-run → (refine) → re-validate.
    Plan,
    /// validate(strictResume) → (bootstrap) → execute → finalize → accept.
    Execute,
    /// `Plan` followed by `Execute` over the same plan directory.
    Full,
}

#[derive(Debug, Clone, Copy)]
pub struct StageFlags {
    pub compile: bool,
    pub validate: bool,
    pub safe_run: bool,
    pub refine: bool,
    pub bootstrap: bool,
    pub execute: bool,
    pub finalize: bool,
    pub accept: bool,
}

impl Default for StageFlags {
    fn default() -> Self {
        Self {
            compile: true,
            validate: true,
            safe_run: true,
            refine: true,
            bootstrap: false,
            execute: true,
            finalize: true,
            accept: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: String,
    pub ok: bool,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOutcome {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_dir: Option<String>,
    pub stages: Vec<StageResult>,
}

pub struct PipelineRequest<'a> {
    pub mode: PipelineMode,
    pub flags: StageFlags,

    /// Required when `compile` runs: the workspace new plans are created
    /// under, and the raw proposal text.
    pub workspace: &'a Path,
    pub proposal: Option<&'a str>,
    pub discovery_mode: DiscoveryMode,
    pub model_key: &'a str,
    pub agent_id: &'a str,
    pub llm: Option<&'a dyn LlmClient>,
    pub now: DateTime<Utc>,

    /// Required when `compile` is skipped: the plan directory to operate on.
    pub plan_dir: Option<PathBuf>,

    pub refine_patch: Vec<PatchOp>,

    pub env: HashMap<String, String>,
    pub secrets_file: Option<SecretsFile>,

    pub execute_opts: ExecuteOptions,
    pub baseline_path: Option<PathBuf>,
}

struct Run {
    stages: Vec<StageResult>,
}

impl Run {
    fn push(&mut self, stage: &str, ok: bool, payload: Value) -> bool {
        self.stages.push(StageResult { stage: stage.to_string(), ok, payload });
        ok
    }
}

fn load_dag(layout: &PlanLayout) -> std::io::Result<PlanDag> {
    read_json(&layout.plan_dag_json())
}

fn validate_stage(run: &mut Run, layout: &PlanLayout, strict_resume: bool) -> bool {
    let dag = match load_dag(layout) {
        Ok(dag) => dag,
        Err(e) => return run.push("validate", false, serde_json::json!({"error": format!("could not read plan.dag.json: {}", e)})),
    };
    let dag_errors = validate_dag(&dag).err().unwrap_or_default();
    if !dag_errors.is_empty() {
        let msgs: Vec<String> = dag_errors.iter().map(|e| e.to_string()).collect();
        return run.push("validate", false, serde_json::json!({"errors": msgs}));
    }
    let violations = validate_conventions(&dag, ConventionOptions { strict_resume });
    let msgs: Vec<String> = violations.iter().map(|v| v.to_string()).collect();
    let ok = msgs.is_empty();
    run.push("validate", ok, serde_json::json!({"strictResume": strict_resume, "violations": msgs}))
}

async fn safe_run_stage<E: ProcessExecutor>(
    run: &mut Run,
    layout: &PlanLayout,
    sandbox: &SandboxRunner<E>,
    req: &PipelineRequest<'_>,
) -> bool {
    let dag = match load_dag(layout) {
        Ok(dag) => dag,
        Err(e) => return run.push("safe_run", false, serde_json::json!({"error": e.to_string()})),
    };
    let credentials = resolve_credentials(&req.env, req.secrets_file.as_ref());
    let opts = SafeRunOptions {
        plan_id: req.execute_opts.plan_id.clone(),
        agent_id: req.agent_id.to_string(),
        env: req.env.clone(),
        command_timeout_ms: req.execute_opts.default_command_timeout_ms,
    };
    let report = run_safe_subset(layout, &dag, sandbox, &credentials, &opts).await;
    let ok = report.ok();
    run.push("safe_run", ok, serde_json::to_value(&report).unwrap_or(Value::Null))
}

fn refine_stage(run: &mut Run, layout: &PlanLayout, patch: &[PatchOp]) -> bool {
    if patch.is_empty() {
        return run.push("refine", true, serde_json::json!({"applied": 0}));
    }
    let dag = match load_dag(layout) {
        Ok(dag) => dag,
        Err(e) => return run.push("refine", false, serde_json::json!({"error": e.to_string()})),
    };
    match apply_patch(&dag, patch) {
        Ok(patched) => match planctl_core::layout::write_json_pretty(&layout.plan_dag_json(), &patched) {
            Ok(()) => run.push("refine", true, serde_json::json!({"applied": patch.len()})),
            Err(e) => run.push("refine", false, serde_json::json!({"error": e.to_string()})),
        },
        Err(e) => run.push("refine", false, serde_json::json!({"error": e.to_string()})),
    }
}

async fn bootstrap_stage<E: ProcessExecutor>(run: &mut Run, layout: &PlanLayout, sandbox: &SandboxRunner<E>, req: &PipelineRequest<'_>) -> bool {
    match sandbox.ensure_container(&req.execute_opts.plan_id, req.agent_id, &layout.root).await {
        Ok(container) => run.push("bootstrap", true, serde_json::json!({"container": container})),
        Err(e) => run.push("bootstrap", false, serde_json::json!({"error": e.to_string()})),
    }
}

async fn execute_stage<E: ProcessExecutor>(
    run: &mut Run,
    layout: &PlanLayout,
    sandbox: &SandboxRunner<E>,
    registry: Arc<NodeRegistry>,
    scheduler: Option<&Scheduler>,
    repair: Option<&mut dyn RepairHook>,
    req: &PipelineRequest<'_>,
) -> bool {
    let dag = match load_dag(layout) {
        Ok(dag) => dag,
        Err(e) => return run.push("execute", false, serde_json::json!({"error": e.to_string()})),
    };
    let retry_spec: RetrySpec = read_json(&layout.retry_json()).unwrap_or_else(|_| RetrySpec::built_in());

    let opts = ExecuteOptions {
        plan_id: req.execute_opts.plan_id.clone(),
        agent_id: req.execute_opts.agent_id.clone(),
        gpu_node_id: req.execute_opts.gpu_node_id.clone(),
        default_command_timeout_ms: req.execute_opts.default_command_timeout_ms,
        default_invoke_timeout_ms: req.execute_opts.default_invoke_timeout_ms,
        gpu_wait_timeout_ms: req.execute_opts.gpu_wait_timeout_ms,
        caller_max_attempts: req.execute_opts.caller_max_attempts,
    };
    let mut engine = ExecuteEngine::new(layout, &retry_spec, sandbox, registry, scheduler, repair, opts);
    match engine.run(&dag).await {
        Ok(log) => {
            let ok = !log.results.iter().any(|r| r.status == planctl_core::dag::NodeStatus::Failed);
            run.push("execute", ok, serde_json::to_value(&log).unwrap_or(Value::Null))
        }
        Err(e) => run.push("execute", false, serde_json::json!({"error": e.to_string()})),
    }
}

fn finalize_stage(run: &mut Run, layout: &PlanLayout) -> bool {
    match finalize_plan(layout) {
        Ok(result) => run.push("finalize", result.ok, serde_json::json!({"failedNodes": result.failed_nodes})),
        Err(e) => run.push("finalize", false, serde_json::json!({"error": e.to_string()})),
    }
}

async fn accept_stage(run: &mut Run, layout: &PlanLayout, baseline_path: Option<PathBuf>) -> bool {
    match accept_proposal_results(AcceptOptions { plan_dir: layout.root.clone(), baseline_path }).await {
        Ok(outcome) => {
            let ok = matches!(outcome.report.status, planctl_accept::AcceptStatus::Pass);
            run.push("accept", ok, serde_json::to_value(&outcome.report).unwrap_or(Value::Null))
        }
        Err(e) => run.push("accept", false, serde_json::json!({"error": e.to_string()})),
    }
}

/// Runs the requested stage sequence, stopping at the first stage that
/// reports `ok=false`. `registry`/`scheduler`/`repair` are only consulted
/// by the `execute` stage; pass `None` for `scheduler`/`repair` when the
/// plan has no GPU nodes or no repair loop configured.
pub async fn run_pipeline<E: ProcessExecutor>(
    mut req: PipelineRequest<'_>,
    sandbox: &SandboxRunner<E>,
    registry: Arc<NodeRegistry>,
    scheduler: Option<&Scheduler>,
    mut repair: Option<&mut dyn RepairHook>,
) -> PipelineOutcome {
    let mut run = Run { stages: vec![] };
    let mut plan_dir = req.plan_dir.clone();

    let do_plan = matches!(req.mode, PipelineMode::Plan | PipelineMode::Full);
    let do_execute = matches!(req.mode, PipelineMode::Execute | PipelineMode::Full);

    if do_plan && req.flags.compile {
        let Some(proposal) = req.proposal else {
            run.push("compile", false, serde_json::json!({"error": "compile stage requires a proposal"}));
            return PipelineOutcome { ok: false, plan_dir: plan_dir.map(|p| p.to_string_lossy().to_string()), stages: run.stages };
        };
        let result = compile_proposal(CompileInput {
            proposal,
            workspace: req.workspace,
            discovery_mode: req.discovery_mode,
            model_key: req.model_key,
            agent_id: req.agent_id,
            llm: req.llm,
            now: req.now,
        })
        .await;
        plan_dir = Some(PathBuf::from(&result.root_dir));
        let ok = run.push("compile", result.ok, serde_json::to_value(&result.report).unwrap_or(Value::Null));
        if !ok {
            return PipelineOutcome { ok: false, plan_dir: plan_dir.map(|p| p.to_string_lossy().to_string()), stages: run.stages };
        }
    }

    let Some(plan_dir) = plan_dir else {
        run.push("validate", false, serde_json::json!({"error": "no plan directory: compile was skipped and none was supplied"}));
        return PipelineOutcome { ok: false, plan_dir: None, stages: run.stages };
    };
    req.plan_dir = Some(plan_dir.clone());
    let layout = PlanLayout::new(&plan_dir);

    macro_rules! stop_unless {
        ($ok:expr) => {
            if !$ok {
                return PipelineOutcome { ok: false, plan_dir: Some(plan_dir.to_string_lossy().to_string()), stages: run.stages };
            }
        };
    }

    if do_plan {
        if req.flags.validate {
            stop_unless!(validate_stage(&mut run, &layout, false));
        }
        if req.flags.safe_run {
            stop_unless!(safe_run_stage(&mut run, &layout, sandbox, &req).await);
        }
        if req.flags.refine {
            stop_unless!(refine_stage(&mut run, &layout, &req.refine_patch));
            if !req.refine_patch.is_empty() {
                stop_unless!(validate_stage(&mut run, &layout, false));
            }
        }
    }

    if do_execute {
        if req.flags.validate {
            stop_unless!(validate_stage(&mut run, &layout, true));
        }
        if req.flags.bootstrap {
            stop_unless!(bootstrap_stage(&mut run, &layout, sandbox, &req).await);
        }
        if req.flags.execute {
            stop_unless!(execute_stage(&mut run, &layout, sandbox, registry, scheduler, repair.take(), &req).await);
        }
        if req.flags.finalize {
            stop_unless!(finalize_stage(&mut run, &layout));
        }
        if req.flags.accept {
            stop_unless!(accept_stage(&mut run, &layout, req.baseline_path.clone()).await);
        }
    }

    PipelineOutcome { ok: true, plan_dir: Some(plan_dir.to_string_lossy().to_string()), stages: run.stages }
}

#[cfg(test)]
mod tests {
    use super::*;
    use planctl_core::dag::{Node, ResourceRequest, Tool};
    use planctl_core::layout::write_json_pretty;
    use planctl_core::retry::RetrySpec;
    use planctl_sandbox::RawOutput;
    use std::time::Duration;
    use tempfile::tempdir;

    struct StubExecutor;

    #[async_trait::async_trait]
    impl ProcessExecutor for StubExecutor {
        async fn run(&self, _program: &str, _args: &[String], _timeout: Duration) -> std::io::Result<RawOutput> {
            Ok(RawOutput { stdout: b"ok".to_vec(), stderr: vec![], exit_code: Some(0), timed_out: false })
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
            resources: Some(ResourceRequest::default()),
            retry_policy_id: None,
        }
    }

    fn base_request<'a>(workspace: &'a Path) -> PipelineRequest<'a> {
        PipelineRequest {
            mode: PipelineMode::Execute,
            flags: StageFlags { compile: false, safe_run: false, refine: false, ..Default::default() },
            workspace,
            proposal: None,
            discovery_mode: DiscoveryMode::Off,
            model_key: "m",
            agent_id: "agent-1",
            llm: None,
            now: Utc::now(),
            plan_dir: None,
            refine_patch: vec![],
            env: HashMap::new(),
            secrets_file: None,
            execute_opts: ExecuteOptions { plan_id: "p1".into(), agent_id: "agent-1".into(), ..Default::default() },
            baseline_path: None,
        }
    }

    #[tokio::test]
    async fn execute_mode_runs_validate_execute_finalize_accept_in_order() {
        let dir = tempdir().unwrap();
        let layout = PlanLayout::new(dir.path());
        layout.create_skeleton().unwrap();
        let dag = PlanDag { nodes: vec![shell_node("noop.run", "noop", vec!["true".into()])], edges: vec![] };
        write_json_pretty(&layout.plan_dag_json(), &dag).unwrap();
        write_json_pretty(&layout.retry_json(), &RetrySpec::built_in()).unwrap();
        write_json_pretty(&layout.acceptance_json(), &planctl_core::acceptance::AcceptanceSpec::default()).unwrap();

        let sandbox = SandboxRunner::with_executor(StubExecutor, "img:latest");
        let registry = Arc::new(NodeRegistry::new());

        let mut req = base_request(dir.path());
        req.plan_dir = Some(dir.path().to_path_buf());

        let outcome = run_pipeline(req, &sandbox, registry, None, None).await;
        let names: Vec<&str> = outcome.stages.iter().map(|s| s.stage.as_str()).collect();
        assert_eq!(names, vec!["validate", "execute", "finalize", "accept"]);
        assert!(outcome.ok);
    }

    #[tokio::test]
    async fn missing_plan_dag_short_circuits_at_validate() {
        let dir = tempdir().unwrap();
        let layout = PlanLayout::new(dir.path());
        layout.create_skeleton().unwrap();

        let sandbox = SandboxRunner::with_executor(StubExecutor, "img:latest");
        let registry = Arc::new(NodeRegistry::new());

        let mut req = base_request(dir.path());
        req.plan_dir = Some(dir.path().to_path_buf());

        let outcome = run_pipeline(req, &sandbox, registry, None, None).await;
        assert!(!outcome.ok);
        assert_eq!(outcome.stages.len(), 1);
        assert_eq!(outcome.stages[0].stage, "validate");
    }

    #[tokio::test]
    async fn compile_disabled_without_plan_dir_fails_fast() {
        let dir = tempdir().unwrap();
        let sandbox = SandboxRunner::with_executor(StubExecutor, "img:latest");
        let registry = Arc::new(NodeRegistry::new());

        let mut req = base_request(dir.path());
        req.flags.compile = false;
        req.plan_dir = None;

        let outcome = run_pipeline(req, &sandbox, registry, None, None).await;
        assert!(!outcome.ok);
        assert_eq!(outcome.stages[0].stage, "validate");
    }
}
