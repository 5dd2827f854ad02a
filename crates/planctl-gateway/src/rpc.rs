//! RPC router (spec §6): dispatches the gateway's JSON method table to the
//! node registry, the GPU scheduler, and the pipeline orchestrator. Grounded
//! on `agenticlaw-gateway::rpc::route_rpc`'s one-function-per-method shape,
//! generalized from chat/session methods to node/job/proposal methods.

use crate::config::GatewayState;
use planctl_core::dag::ResourceRequest;
use planctl_core::gpu_job::{ExecSpec, GpuJob, JobPolicy, JobState};
use planctl_core::protocol::RpcError;
use planctl_pipeline::{run_pipeline, PipelineMode, PipelineRequest, StageFlags};
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;

pub type RpcResult = Result<Value, RpcError>;

pub async fn route_rpc(method: &str, params: Value, state: &GatewayState) -> RpcResult {
    match method {
        "node.list" => node_list(state),
        "node.invoke" => node_invoke(params, state).await,
        "gpu.job.submit" => gpu_job_submit(params, state).await,
        "gpu.job.get" => gpu_job_get(params, state).await,
        "gpu.job.list" => gpu_job_list(params, state).await,
        "gpu.job.cancel" => gpu_job_cancel(params, state).await,
        "gpu.job.pause" => gpu_job_pause(params, state).await,
        "gpu.job.resume" => gpu_job_resume(params, state).await,
        "gpu.job.wait" => gpu_job_wait(params, state).await,
        "proposal.compile" => proposal_compile(params, state).await,
        "proposal.validate" => proposal_stage(params, state, StageFlags { safe_run: false, refine: false, bootstrap: false, execute: false, finalize: false, accept: false, ..Default::default() }).await,
        "proposal.run" => proposal_stage(params, state, StageFlags { compile: false, bootstrap: false, execute: false, finalize: false, accept: false, ..Default::default() }).await,
        "proposal.refine" => proposal_stage(params, state, StageFlags { compile: false, validate: true, safe_run: false, bootstrap: false, execute: false, finalize: false, accept: false, ..Default::default() }).await,
        "proposal.execute" => proposal_execute(params, state).await,
        "proposal.finalize" => proposal_finalize_only(params, state).await,
        "proposal.accept" => proposal_accept_only(params, state).await,
        _ => Err(RpcError::invalid_request(format!("method not found: {}", method))),
    }
}

fn job_id_param(params: &Value) -> Result<String, RpcError> {
    params["jobId"]
        .as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| RpcError::invalid_request("missing required param: jobId"))
}

fn plan_dir_param(params: &Value) -> Result<PathBuf, RpcError> {
    params["planDir"]
        .as_str()
        .map(PathBuf::from)
        .ok_or_else(|| RpcError::invalid_request("missing required param: planDir"))
}

// ---------------------------------------------------------------------------
// node.list / node.invoke
// ---------------------------------------------------------------------------

fn node_list(state: &GatewayState) -> RpcResult {
    let nodes: Vec<Value> = state.registry.list().into_iter().map(|s| serde_json::to_value(&s).unwrap_or(Value::Null)).collect();
    Ok(serde_json::json!({"ts": chrono::Utc::now().timestamp_millis(), "nodes": nodes}))
}

async fn node_invoke(params: Value, state: &GatewayState) -> RpcResult {
    let node_id = params["nodeId"].as_str().ok_or_else(|| RpcError::invalid_request("missing required param: nodeId"))?;
    let command = params["command"].as_str().ok_or_else(|| RpcError::invalid_request("missing required param: command"))?;
    let invoke_params = params.get("params").cloned().unwrap_or(Value::Null);
    let timeout_ms = params["timeoutMs"].as_u64();
    let idempotency_key = params["idempotencyKey"].as_str().map(String::from);

    match state.registry.invoke(node_id, command, invoke_params, timeout_ms, idempotency_key).await {
        Ok(outcome) => Ok(serde_json::json!({"ok": outcome.ok, "payload": outcome.payload, "error": outcome.error})),
        Err(planctl_registry::RegistryError::NotConnected(id)) => Err(RpcError::not_connected(format!("node {} is not connected", id))),
        Err(planctl_registry::RegistryError::Timeout) => Err(RpcError::timeout("invoke timed out")),
        Err(e) => Err(RpcError::unavailable(e.to_string())),
    }
}

// ---------------------------------------------------------------------------
// gpu.job.*
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SubmitParams {
    resources: ResourceRequest,
    exec: ExecSpec,
    #[serde(default)]
    max_attempts: Option<u32>,
    #[serde(default)]
    policy: Option<JobPolicy>,
}

fn job_value(job: GpuJob) -> Value {
    serde_json::json!({"job": job})
}

async fn gpu_job_submit(params: Value, state: &GatewayState) -> RpcResult {
    let parsed: SubmitParams = serde_json::from_value(params).map_err(|e| RpcError::invalid_request(e.to_string()))?;
    let req = planctl_scheduler::SubmitRequest {
        resources: parsed.resources,
        exec: parsed.exec,
        max_attempts: parsed.max_attempts,
        policy: parsed.policy,
    };
    state.scheduler.submit(req).await.map(job_value).map_err(scheduler_error_to_rpc)
}

async fn gpu_job_get(params: Value, state: &GatewayState) -> RpcResult {
    let job_id = job_id_param(&params)?;
    state
        .scheduler
        .get(&job_id)
        .await
        .map(job_value)
        .ok_or_else(|| RpcError::invalid_request(format!("unknown job {}", job_id)))
}

async fn gpu_job_list(params: Value, state: &GatewayState) -> RpcResult {
    let requested_state = params["state"].as_str().and_then(parse_job_state);
    let jobs = state.scheduler.list(requested_state).await;
    Ok(serde_json::json!({"jobs": jobs}))
}

fn parse_job_state(s: &str) -> Option<JobState> {
    match s {
        "queued" => Some(JobState::Queued),
        "running" => Some(JobState::Running),
        "succeeded" => Some(JobState::Succeeded),
        "failed" => Some(JobState::Failed),
        "canceled" => Some(JobState::Canceled),
        _ => None,
    }
}

fn scheduler_error_to_rpc(e: planctl_scheduler::SchedulerError) -> RpcError {
    match e {
        planctl_scheduler::SchedulerError::InvalidRequest(msg) => RpcError::invalid_request(msg),
        planctl_scheduler::SchedulerError::UnknownJob(id) => RpcError::invalid_request(format!("unknown job {}", id)),
    }
}

async fn gpu_job_cancel(params: Value, state: &GatewayState) -> RpcResult {
    let job_id = job_id_param(&params)?;
    state.scheduler.cancel(&job_id).await.map(|()| serde_json::json!({"ok": true})).map_err(scheduler_error_to_rpc)
}

async fn gpu_job_pause(params: Value, state: &GatewayState) -> RpcResult {
    let job_id = job_id_param(&params)?;
    state.scheduler.pause(&job_id).await.map(|()| serde_json::json!({"ok": true})).map_err(scheduler_error_to_rpc)
}

async fn gpu_job_resume(params: Value, state: &GatewayState) -> RpcResult {
    let job_id = job_id_param(&params)?;
    state.scheduler.resume(&job_id).await.map(|()| serde_json::json!({"ok": true})).map_err(scheduler_error_to_rpc)
}

async fn gpu_job_wait(params: Value, state: &GatewayState) -> RpcResult {
    let job_id = job_id_param(&params)?;
    let timeout_ms = params["timeoutMs"].as_u64().unwrap_or(30_000);
    state
        .scheduler
        .wait(&job_id, timeout_ms)
        .await
        .map(|outcome| serde_json::json!({"done": outcome.done, "job": outcome.job}))
        .map_err(scheduler_error_to_rpc)
}

// ---------------------------------------------------------------------------
// proposal.* — thin wiring onto the pipeline orchestrator
// ---------------------------------------------------------------------------

fn outcome_to_value(outcome: planctl_pipeline::PipelineOutcome) -> Value {
    serde_json::to_value(&outcome).unwrap_or(Value::Null)
}

async fn proposal_compile(params: Value, state: &GatewayState) -> RpcResult {
    let proposal = params["proposal"].as_str().ok_or_else(|| RpcError::invalid_request("missing required param: proposal"))?.to_string();
    let discovery_mode = params["discovery"]
        .as_str()
        .and_then(planctl_compiler::discovery::DiscoveryMode::parse)
        .unwrap_or(planctl_compiler::discovery::DiscoveryMode::Off);
    let model_key = params["model"].as_str().unwrap_or("heuristic/none").to_string();
    let agent_id = params["agentId"].as_str().unwrap_or("gateway").to_string();

    let req = PipelineRequest {
        mode: PipelineMode::Plan,
        flags: StageFlags { validate: false, safe_run: false, refine: false, ..Default::default() },
        workspace: &state.workspace,
        proposal: Some(&proposal),
        discovery_mode,
        model_key: &model_key,
        agent_id: &agent_id,
        llm: None,
        now: chrono::Utc::now(),
        plan_dir: None,
        refine_patch: vec![],
        env: std::env::vars().collect(),
        secrets_file: None,
        execute_opts: planctl_execute::ExecuteOptions { plan_id: "gateway".into(), agent_id, ..Default::default() },
        baseline_path: None,
    };
    let outcome = run_pipeline(req, &state.sandbox, state.registry.clone(), Some(&state.scheduler), None).await;
    Ok(outcome_to_value(outcome))
}

async fn proposal_stage(params: Value, state: &GatewayState, flags: StageFlags) -> RpcResult {
    let plan_dir = plan_dir_param(&params)?;
    let agent_id = params["agentId"].as_str().unwrap_or("gateway").to_string();
    let req = PipelineRequest {
        mode: PipelineMode::Plan,
        flags,
        workspace: &state.workspace,
        proposal: None,
        discovery_mode: planctl_compiler::discovery::DiscoveryMode::Off,
        model_key: "heuristic/none",
        agent_id: &agent_id,
        llm: None,
        now: chrono::Utc::now(),
        plan_dir: Some(plan_dir),
        refine_patch: vec![],
        env: std::env::vars().collect(),
        secrets_file: None,
        execute_opts: planctl_execute::ExecuteOptions { plan_id: "gateway".into(), agent_id, ..Default::default() },
        baseline_path: None,
    };
    let outcome = run_pipeline(req, &state.sandbox, state.registry.clone(), Some(&state.scheduler), None).await;
    Ok(outcome_to_value(outcome))
}

async fn proposal_execute(params: Value, state: &GatewayState) -> RpcResult {
    let plan_dir = plan_dir_param(&params)?;
    let agent_id = params["agentId"].as_str().unwrap_or("gateway").to_string();
    let req = PipelineRequest {
        mode: PipelineMode::Execute,
        flags: StageFlags::default(),
        workspace: &state.workspace,
        proposal: None,
        discovery_mode: planctl_compiler::discovery::DiscoveryMode::Off,
        model_key: "heuristic/none",
        agent_id: &agent_id,
        llm: None,
        now: chrono::Utc::now(),
        plan_dir: Some(plan_dir),
        refine_patch: vec![],
        env: std::env::vars().collect(),
        secrets_file: None,
        execute_opts: planctl_execute::ExecuteOptions { plan_id: "gateway".into(), agent_id, ..Default::default() },
        baseline_path: params["baselinePath"].as_str().map(PathBuf::from),
    };
    let outcome = run_pipeline(req, &state.sandbox, state.registry.clone(), Some(&state.scheduler), None).await;
    Ok(outcome_to_value(outcome))
}

async fn proposal_finalize_only(params: Value, state: &GatewayState) -> RpcResult {
    let plan_dir = plan_dir_param(&params)?;
    let agent_id = params["agentId"].as_str().unwrap_or("gateway").to_string();
    let req = PipelineRequest {
        mode: PipelineMode::Execute,
        flags: StageFlags { validate: false, bootstrap: false, execute: false, accept: false, ..Default::default() },
        workspace: &state.workspace,
        proposal: None,
        discovery_mode: planctl_compiler::discovery::DiscoveryMode::Off,
        model_key: "heuristic/none",
        agent_id: &agent_id,
        llm: None,
        now: chrono::Utc::now(),
        plan_dir: Some(plan_dir),
        refine_patch: vec![],
        env: std::env::vars().collect(),
        secrets_file: None,
        execute_opts: planctl_execute::ExecuteOptions { plan_id: "gateway".into(), agent_id, ..Default::default() },
        baseline_path: None,
    };
    let outcome = run_pipeline(req, &state.sandbox, state.registry.clone(), Some(&state.scheduler), None).await;
    Ok(outcome_to_value(outcome))
}

async fn proposal_accept_only(params: Value, state: &GatewayState) -> RpcResult {
    let plan_dir = plan_dir_param(&params)?;
    let agent_id = params["agentId"].as_str().unwrap_or("gateway").to_string();
    let req = PipelineRequest {
        mode: PipelineMode::Execute,
        flags: StageFlags { validate: false, bootstrap: false, execute: false, finalize: false, ..Default::default() },
        workspace: &state.workspace,
        proposal: None,
        discovery_mode: planctl_compiler::discovery::DiscoveryMode::Off,
        model_key: "heuristic/none",
        agent_id: &agent_id,
        llm: None,
        now: chrono::Utc::now(),
        plan_dir: Some(plan_dir),
        refine_patch: vec![],
        env: std::env::vars().collect(),
        secrets_file: None,
        execute_opts: planctl_execute::ExecuteOptions { plan_id: "gateway".into(), agent_id, ..Default::default() },
        baseline_path: params["baselinePath"].as_str().map(PathBuf::from),
    };
    // accept's own three-way status (pass/fail/needs_confirm) is carried in
    // the stage payload; RPC ok/err only reflects whether the stage ran.
    let outcome = run_pipeline(req, &state.sandbox, state.registry.clone(), Some(&state.scheduler), None).await;
    Ok(outcome_to_value(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ResolvedAuth;
    use crate::config::GatewayConfig;

    fn state() -> std::sync::Arc<GatewayState> {
        GatewayState::new(&GatewayConfig { auth: ResolvedAuth::none(), ..Default::default() })
    }

    #[tokio::test]
    async fn unknown_method_is_invalid_request() {
        let state = state();
        let err = route_rpc("no.such.method", serde_json::json!({}), &state).await.unwrap_err();
        assert_eq!(err.code, "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn node_list_is_empty_with_no_connections() {
        let state = state();
        let result = route_rpc("node.list", serde_json::json!({}), &state).await.unwrap();
        assert_eq!(result["nodes"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn node_invoke_without_connection_is_not_connected() {
        let state = state();
        let params = serde_json::json!({"nodeId": "ghost", "command": "system.run"});
        let err = route_rpc("node.invoke", params, &state).await.unwrap_err();
        assert_eq!(err.code, "NOT_CONNECTED");
    }

    #[tokio::test]
    async fn gpu_job_submit_then_get_round_trips() {
        let state = state();
        let submit_params = serde_json::json!({
            "resources": {"gpu_count": 1},
            "exec": {"argv": ["echo", "hi"]},
        });
        let submitted = route_rpc("gpu.job.submit", submit_params, &state).await.unwrap();
        let job_id = submitted["job"]["job_id"].as_str().unwrap().to_string();

        let fetched = route_rpc("gpu.job.get", serde_json::json!({"jobId": job_id}), &state).await.unwrap();
        assert_eq!(fetched["job"]["job_id"].as_str().unwrap(), job_id);
    }

    #[tokio::test]
    async fn gpu_job_get_unknown_is_invalid_request() {
        let state = state();
        let err = route_rpc("gpu.job.get", serde_json::json!({"jobId": "nope"}), &state).await.unwrap_err();
        assert_eq!(err.code, "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn proposal_validate_without_plan_dir_is_invalid_request() {
        let state = state();
        let err = route_rpc("proposal.validate", serde_json::json!({}), &state).await.unwrap_err();
        assert_eq!(err.code, "INVALID_REQUEST");
    }
}
