//! `planctl` — the experiment control plane's CLI front-end (spec §6, "for
//! reference; not part of the core"). Proposal/compile-through-accept
//! subcommands run the pipeline orchestrator in-process against a
//! throwaway node registry/scheduler/sandbox; `gpu jobs` subcommands talk
//! to an already-running gateway over its websocket; `gateway` starts one.

mod gateway_client;

use clap::{Parser, Subcommand};
use planctl_compiler::discovery::DiscoveryMode;
use planctl_execute::ExecuteOptions;
use planctl_gateway::auth::ResolvedAuth;
use planctl_gateway::{BindMode, GatewayConfig, GatewayState};
use planctl_pipeline::{run_pipeline, PipelineMode, PipelineOutcome, PipelineRequest, StageFlags};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "planctl", about = "Experiment control plane")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Proposal lifecycle: compile a proposal into a plan, then drive it
    /// stage by stage.
    Proposal {
        #[command(subcommand)]
        action: ProposalAction,
    },
    /// GPU job scheduler queries against a running gateway.
    Gpu {
        #[command(subcommand)]
        action: GpuAction,
    },
    /// Start the gateway server.
    Gateway {
        #[arg(short, long, default_value_t = 8790)]
        port: u16,
        #[arg(short, long, default_value = "loopback")]
        bind: String,
        #[arg(short, long)]
        token: Option<String>,
        #[arg(long)]
        no_auth: bool,
        #[arg(short, long)]
        workspace: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ProposalAction {
    /// Compile a proposal markdown document into a plan package.
    Compile {
        proposal: PathBuf,
        #[arg(long)]
        workspace: Option<PathBuf>,
        #[arg(long, default_value = "off")]
        discovery: String,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        no_llm: bool,
        #[arg(long, default_value = "cli")]
        agent: String,
        #[arg(long)]
        json: bool,
    },
    Validate {
        plan_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Dry-run the plan's safe node subset.
    Review {
        plan_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Full orchestration: validate, review, refine, validate, execute,
    /// finalize, accept.
    Run {
        plan_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Refine {
        plan_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Execute {
        plan_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Finalize {
        plan_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Accept {
        plan_dir: PathBuf,
        #[arg(long)]
        baseline: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum GpuAction {
    Jobs {
        #[command(subcommand)]
        action: GpuJobsAction,
    },
}

#[derive(Subcommand)]
enum GpuJobsAction {
    List {
        #[arg(long)]
        state: Option<String>,
        #[arg(long, default_value = "ws://127.0.0.1:8790/ws")]
        url: String,
        #[arg(long)]
        token: Option<String>,
        #[arg(long)]
        json: bool,
    },
    Get {
        job_id: String,
        #[arg(long, default_value = "ws://127.0.0.1:8790/ws")]
        url: String,
        #[arg(long)]
        token: Option<String>,
        #[arg(long)]
        json: bool,
    },
    Pause {
        job_id: String,
        #[arg(long, default_value = "ws://127.0.0.1:8790/ws")]
        url: String,
        #[arg(long)]
        token: Option<String>,
        #[arg(long)]
        json: bool,
    },
    Resume {
        job_id: String,
        #[arg(long, default_value = "ws://127.0.0.1:8790/ws")]
        url: String,
        #[arg(long)]
        token: Option<String>,
        #[arg(long)]
        json: bool,
    },
    Cancel {
        job_id: String,
        #[arg(long, default_value = "ws://127.0.0.1:8790/ws")]
        url: String,
        #[arg(long)]
        token: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "planctl=info".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Proposal { action } => run_proposal(action).await,
        Commands::Gpu { action: GpuAction::Jobs { action } } => run_gpu_jobs(action).await,
        Commands::Gateway { port, bind, token, no_auth, workspace } => {
            let bind = match bind.as_str() {
                "lan" | "0.0.0.0" => BindMode::Lan,
                _ => BindMode::Loopback,
            };
            let auth = if no_auth {
                ResolvedAuth::none()
            } else {
                match token.or_else(|| std::env::var("PLANCTL_GATEWAY_TOKEN").ok()) {
                    Some(t) => ResolvedAuth::token(t),
                    None => ResolvedAuth::none(),
                }
            };
            let workspace = workspace.unwrap_or_else(|| std::env::current_dir().unwrap_or_default());
            let config = GatewayConfig { port, bind, auth, workspace, ..Default::default() };
            match planctl_gateway::start_gateway(config).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("gateway error: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
    }
}

fn base_request<'a>(
    workspace: &'a std::path::Path,
    agent_id: &'a str,
    plan_dir: Option<PathBuf>,
) -> PipelineRequest<'a> {
    PipelineRequest {
        mode: PipelineMode::Plan,
        flags: StageFlags::default(),
        workspace,
        proposal: None,
        discovery_mode: DiscoveryMode::Off,
        model_key: "heuristic/none",
        agent_id,
        llm: None,
        now: chrono::Utc::now(),
        plan_dir,
        refine_patch: vec![],
        env: std::env::vars().collect::<HashMap<_, _>>(),
        secrets_file: None,
        execute_opts: ExecuteOptions { plan_id: "cli".into(), agent_id: agent_id.to_string(), ..Default::default() },
        baseline_path: None,
    }
}

async fn run_proposal(action: ProposalAction) -> ExitCode {
    let state = GatewayState::new(&GatewayConfig::default());
    let cli_workspace = std::env::current_dir().unwrap_or_default();

    let (req, json) = match action {
        ProposalAction::Compile { proposal, workspace, discovery, model, no_llm, agent, json } => {
            let proposal_text = match std::fs::read_to_string(&proposal) {
                Ok(t) => t,
                Err(e) => {
                    eprintln!("could not read {}: {}", proposal.display(), e);
                    return ExitCode::FAILURE;
                }
            };
            let workspace = workspace.unwrap_or_else(|| std::env::current_dir().unwrap_or_default());
            let discovery_mode = DiscoveryMode::parse(&discovery).unwrap_or(DiscoveryMode::Off);
            let model_key = if no_llm { "heuristic/none".to_string() } else { model.unwrap_or_else(|| "heuristic/none".to_string()) };
            let mut req = base_request(&workspace, &agent, None);
            req.flags = StageFlags { validate: false, safe_run: false, refine: false, ..Default::default() };
            req.proposal = Some(&proposal_text);
            req.discovery_mode = discovery_mode;
            req.model_key = &model_key;
            return run_and_report(req, &state, json).await;
        }
        ProposalAction::Validate { plan_dir, json } => {
            let mut req = base_request(&cli_workspace, "cli", Some(plan_dir));
            req.flags = StageFlags { safe_run: false, refine: false, bootstrap: false, execute: false, finalize: false, accept: false, ..Default::default() };
            (req, json)
        }
        ProposalAction::Review { plan_dir, json } => {
            let mut req = base_request(&cli_workspace, "cli", Some(plan_dir));
            req.flags = StageFlags { validate: false, refine: false, bootstrap: false, execute: false, finalize: false, accept: false, ..Default::default() };
            (req, json)
        }
        ProposalAction::Run { plan_dir, json } => {
            let mut req = base_request(&cli_workspace, "cli", Some(plan_dir));
            req.mode = PipelineMode::Full;
            (req, json)
        }
        ProposalAction::Refine { plan_dir, json } => {
            let mut req = base_request(&cli_workspace, "cli", Some(plan_dir));
            req.flags = StageFlags { compile: false, validate: true, safe_run: false, bootstrap: false, execute: false, finalize: false, accept: false, ..Default::default() };
            (req, json)
        }
        ProposalAction::Execute { plan_dir, json } => {
            let mut req = base_request(&cli_workspace, "cli", Some(plan_dir));
            req.mode = PipelineMode::Execute;
            (req, json)
        }
        ProposalAction::Finalize { plan_dir, json } => {
            let mut req = base_request(&cli_workspace, "cli", Some(plan_dir));
            req.mode = PipelineMode::Execute;
            req.flags = StageFlags { validate: false, bootstrap: false, execute: false, accept: false, ..Default::default() };
            (req, json)
        }
        ProposalAction::Accept { plan_dir, baseline, json } => {
            let mut req = base_request(&cli_workspace, "cli", Some(plan_dir));
            req.mode = PipelineMode::Execute;
            req.flags = StageFlags { validate: false, bootstrap: false, execute: false, finalize: false, ..Default::default() };
            req.baseline_path = baseline;
            (req, json)
        }
    };

    run_and_report(req, &state, json).await
}

async fn run_and_report(req: PipelineRequest<'_>, state: &std::sync::Arc<GatewayState>, json: bool) -> ExitCode {
    let outcome = run_pipeline(req, &state.sandbox, state.registry.clone(), Some(&state.scheduler), None).await;
    print_outcome(&outcome, json);
    exit_code_for(&outcome)
}

fn print_outcome(outcome: &PipelineOutcome, json: bool) {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome).unwrap_or_default());
        return;
    }
    for stage in &outcome.stages {
        println!("[{}] {}", if stage.ok { "ok" } else { "FAIL" }, stage.stage);
    }
    if let Some(dir) = &outcome.plan_dir {
        println!("plan: {}", dir);
    }
}

fn exit_code_for(outcome: &PipelineOutcome) -> ExitCode {
    if outcome.ok {
        return ExitCode::SUCCESS;
    }
    if let Some(last) = outcome.stages.last() {
        if last.stage == "accept" && last.payload["status"].as_str() == Some("needs_confirm") {
            return ExitCode::from(2);
        }
    }
    ExitCode::FAILURE
}

async fn run_gpu_jobs(action: GpuJobsAction) -> ExitCode {
    let result = match action {
        GpuJobsAction::List { state, url, token, json } => {
            let params = serde_json::json!({"state": state});
            dispatch(&url, token.as_deref(), "gpu.job.list", params, json).await
        }
        GpuJobsAction::Get { job_id, url, token, json } => {
            dispatch(&url, token.as_deref(), "gpu.job.get", serde_json::json!({"jobId": job_id}), json).await
        }
        GpuJobsAction::Pause { job_id, url, token, json } => {
            dispatch(&url, token.as_deref(), "gpu.job.pause", serde_json::json!({"jobId": job_id}), json).await
        }
        GpuJobsAction::Resume { job_id, url, token, json } => {
            dispatch(&url, token.as_deref(), "gpu.job.resume", serde_json::json!({"jobId": job_id}), json).await
        }
        GpuJobsAction::Cancel { job_id, url, token, json } => {
            dispatch(&url, token.as_deref(), "gpu.job.cancel", serde_json::json!({"jobId": job_id}), json).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(url: &str, token: Option<&str>, method: &str, params: serde_json::Value, json: bool) -> anyhow::Result<()> {
    let result = gateway_client::call(url, token, method, params).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("{}", result);
    }
    Ok(())
}
