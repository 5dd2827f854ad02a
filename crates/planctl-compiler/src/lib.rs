//! Proposal Compiler (C2): turns a free-form markdown proposal into a fully
//! populated plan package.

pub mod accept_spec;
pub mod discovery;
pub mod entities;
pub mod report;
pub mod skeleton;

use chrono::{DateTime, Utc};
use discovery::{discover, DiscoveryMode, DiscoveryReport};
use entities::{extract_heuristic, llm_extraction_prompt, validate_llm_entities, ExtractedEntities};
use planctl_adapter::{FrameworkAdapter, GenericPipAdapter};
use planctl_core::digest::plan_id;
use planctl_core::layout::{write_json_pretty, PlanLayout};
use planctl_core::retry::RetrySpec;
use planctl_llm::LlmClient;
use report::{aggregate_needs_confirm, CompileProposalResult, CompileReport};
use skeleton::{build_skeleton_dag, SkeletonOptions};

pub struct CompileInput<'a> {
    pub proposal: &'a str,
    pub workspace: &'a std::path::Path,
    pub discovery_mode: DiscoveryMode,
    pub model_key: &'a str,
    pub agent_id: &'a str,
    pub llm: Option<&'a dyn LlmClient>,
    pub now: DateTime<Utc>,
}

/// Runs the full 8-step compile pipeline (spec §4.1) and writes the plan
/// package to `<workspace>/<planId>/`.
pub async fn compile_proposal(input: CompileInput<'_>) -> CompileProposalResult {
    let plan_id = plan_id(input.now, input.discovery_mode.as_str(), input.model_key, input.proposal);
    let root_dir = input.workspace.join(&plan_id);
    let layout = PlanLayout::new(&root_dir);

    let mut warnings = Vec::new();
    let mut errors = Vec::new();

    if let Err(e) = layout.create_skeleton() {
        errors.push(format!("failed to create plan skeleton: {}", e));
        return finish(plan_id.clone(), root_dir, input, warnings, errors, Vec::new());
    }

    if let Err(e) = std::fs::write(layout.proposal_md(), input.proposal) {
        errors.push(format!("failed to write proposal.md: {}", e));
    }

    let entities = extract_entities(input.proposal, input.llm, &mut warnings).await;
    if let Err(e) = write_json_pretty(&layout.extracted_entities_json(), &entities) {
        errors.push(format!("failed to write extracted.entities.json: {}", e));
    }

    let client = reqwest::Client::new();
    let discovery_report: DiscoveryReport = discover(&client, &entities, input.discovery_mode).await;
    if let Err(e) = write_json_pretty(&layout.discovery_json(), &discovery_report) {
        errors.push(format!("failed to write discovery.json: {}", e));
    }

    let adapter = GenericPipAdapter;
    let dag = build_skeleton_dag(&entities, &discovery_report, &SkeletonOptions { adapter: &adapter });
    if let Err(e) = write_json_pretty(&layout.plan_dag_json(), &dag) {
        errors.push(format!("failed to write plan.dag.json: {}", e));
    }

    let acceptance = accept_spec::build_acceptance_spec(&entities);
    if let Err(e) = write_json_pretty(&layout.acceptance_json(), &acceptance) {
        errors.push(format!("failed to write acceptance.json: {}", e));
    }

    let retry_spec = RetrySpec::built_in();
    if let Err(e) = write_json_pretty(&layout.retry_json(), &retry_spec) {
        errors.push(format!("failed to write retry.json: {}", e));
    }

    let needs_confirm = aggregate_needs_confirm(&entities, &discovery_report, &acceptance, &dag);

    finish(plan_id, root_dir, input, warnings, errors, needs_confirm)
}

async fn extract_entities(proposal: &str, llm: Option<&dyn LlmClient>, warnings: &mut Vec<String>) -> ExtractedEntities {
    if let Some(client) = llm {
        let prompt = llm_extraction_prompt(proposal);
        match client.complete(&prompt).await {
            Ok(text) => match serde_json::from_str::<serde_json::Value>(&text) {
                Ok(v) if validate_llm_entities(&v) => {
                    if let Ok(entities) = serde_json::from_value::<ExtractedEntities>(v) {
                        return entities;
                    }
                    warnings.push("LLM entity extraction failed schema validation; falling back to heuristics".into());
                }
                _ => warnings.push("LLM entity extraction returned invalid JSON; falling back to heuristics".into()),
            },
            Err(e) => warnings.push(format!("LLM entity extraction failed ({}); falling back to heuristics", e)),
        }
    }
    extract_heuristic(proposal)
}

fn finish(
    plan_id: String,
    root_dir: std::path::PathBuf,
    input: CompileInput<'_>,
    warnings: Vec<String>,
    errors: Vec<String>,
    needs_confirm: Vec<String>,
) -> CompileProposalResult {
    let report = CompileReport {
        plan_id: plan_id.clone(),
        created_at: input.now.to_rfc3339(),
        model: if input.model_key.is_empty() { None } else { Some(input.model_key.to_string()) },
        discovery: input.discovery_mode.as_str().to_string(),
        warnings,
        errors: errors.clone(),
        needs_confirm,
    };
    let layout = PlanLayout::new(&root_dir);
    let _ = write_json_pretty(&layout.compile_report_json(), &report);

    CompileProposalResult {
        ok: errors.is_empty(),
        plan_id,
        root_dir: root_dir.to_string_lossy().to_string(),
        report,
    }
}
