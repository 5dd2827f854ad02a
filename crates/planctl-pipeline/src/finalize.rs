//! Finalize stage (spec §4.9 `execute` mode, between execute and accept):
//! promotes the execute run's `eval_metrics.json` snapshot to
//! `final_metrics.json` and renders a human `final_report.md`, so accept
//! always has a stable, execute-run-agnostic artifact to evaluate against.

use planctl_core::dag::NodeStatus;
use planctl_core::layout::{read_json, write_json_pretty, PlanLayout};
use planctl_execute::ExecuteLog;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct FinalizeResult {
    pub ok: bool,
    pub failed_nodes: Vec<String>,
}

pub fn finalize_plan(layout: &PlanLayout) -> std::io::Result<FinalizeResult> {
    let metrics: Value = read_json(&layout.eval_metrics_json()).unwrap_or_else(|_| serde_json::json!({"metrics": {}}));
    write_json_pretty(&layout.final_metrics_json(), &metrics)?;

    let log: ExecuteLog = read_json(&layout.execute_log_json()).unwrap_or_default();
    let failed_nodes: Vec<String> = log
        .results
        .iter()
        .filter(|r| r.status == NodeStatus::Failed)
        .map(|r| r.node_id.clone())
        .collect();

    let mut md = String::from("# Final Report\n\n| node | status | executor | attempts |\n| --- | --- | --- | --- |\n");
    for r in &log.results {
        md.push_str(&format!("| {} | {:?} | {:?} | {} |\n", r.node_id, r.status, r.executor, r.attempts.len()));
    }
    if let Some(obj) = metrics.get("metrics").and_then(|m| m.as_object()) {
        if !obj.is_empty() {
            md.push_str("\n## Metrics\n\n| metric | value |\n| --- | --- |\n");
            for (k, v) in obj {
                md.push_str(&format!("| {} | {} |\n", k, v));
            }
        }
    }
    std::fs::write(layout.final_report_md(), md)?;

    Ok(FinalizeResult { ok: failed_nodes.is_empty(), failed_nodes })
}
