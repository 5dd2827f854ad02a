//! Results / Accept (C9, spec §4.8): validates a finished plan package,
//! archives its canonical artifacts under `report/runs/<runId>/` with a
//! SHA-256 manifest, evaluates the plan's acceptance checks against
//! metrics/execute logs/manual approvals, and writes
//! `report/acceptance_report.{json,md}`.

use chrono::Utc;
use planctl_core::acceptance::{AcceptanceCheck, AcceptanceSpec, CheckType, ComparisonOp};
use planctl_core::dag::PlanDag;
use planctl_core::digest::{run_id as compute_run_id, sha256_hex_file};
use planctl_core::layout::{read_json, write_json_pretty, PlanLayout};
use planctl_dag::validate::{validate_dag, DagError};
use planctl_execute::ExecuteLog;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptStatus {
    Pass,
    Fail,
    NeedsConfirm,
}

impl AcceptStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Pass => 0,
            Self::Fail => 1,
            Self::NeedsConfirm => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    NeedsConfirm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub check_type: CheckType,
    pub selector: String,
    pub verdict: Verdict,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricDelta {
    pub metric: String,
    pub baseline: f64,
    pub current: f64,
    pub delta: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptanceReport {
    pub run_id: Option<String>,
    pub status: AcceptStatus,
    pub checks: Vec<CheckResult>,
    #[serde(default)]
    pub metric_deltas: Vec<MetricDelta>,
    #[serde(default)]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub created_at: String,
    pub files: Vec<ManifestEntry>,
}

pub struct AcceptOptions {
    pub plan_dir: PathBuf,
    pub baseline_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct AcceptOutcome {
    pub report: AcceptanceReport,
    pub exit_code: i32,
}

/// Manual approvals can be authored in any of three shapes (spec §4.8 step
/// 4); normalise all of them to an approved-id/selector set.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ManualApprovalsFile {
    Object {
        approved: Vec<String>,
        #[serde(default)]
        #[allow(dead_code)]
        notes: Option<String>,
    },
    List(Vec<String>),
    Map(HashMap<String, bool>),
}

impl ManualApprovalsFile {
    fn approved_set(&self) -> HashSet<String> {
        match self {
            Self::Object { approved, .. } => approved.iter().cloned().collect(),
            Self::List(items) => items.iter().cloned().collect(),
            Self::Map(map) => map.iter().filter(|(_, v)| **v).map(|(k, _)| k.clone()).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct MetricsFile {
    #[serde(default)]
    metrics: HashMap<String, Value>,
}

fn load_scalar_metrics(path: &Path) -> HashMap<String, Value> {
    let Ok(file) = read_json::<MetricsFile>(path) else {
        return HashMap::new();
    };
    let mut out = HashMap::new();
    for (k, v) in file.metrics {
        if v.is_number() || v.is_string() {
            out.insert(k, v);
        } else {
            warn!(metric = %k, "ignoring non-scalar metric value");
        }
    }
    out
}

fn numeric(value: &Value) -> Option<f64> {
    value.as_f64()
}

/// Copies `src` (a file or directory) into `run_dir`, preserving its path
/// relative to the plan root, and appends one manifest entry per file.
fn archive_path(plan_root: &Path, src: &Path, run_dir: &Path, manifest: &mut Vec<ManifestEntry>) -> std::io::Result<()> {
    if !src.exists() {
        return Ok(());
    }
    if src.is_file() {
        archive_file(plan_root, src, run_dir, manifest)?;
        return Ok(());
    }
    for entry in WalkDir::new(src).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() {
            archive_file(plan_root, entry.path(), run_dir, manifest)?;
        }
    }
    Ok(())
}

fn archive_file(plan_root: &Path, src: &Path, run_dir: &Path, manifest: &mut Vec<ManifestEntry>) -> std::io::Result<()> {
    let rel = src.strip_prefix(plan_root).unwrap_or(src);
    let dest = run_dir.join(rel);
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(src, &dest)?;
    let sha256 = sha256_hex_file(src)?;
    manifest.push(ManifestEntry { path: rel.to_string_lossy().replace('\\', "/"), sha256 });
    Ok(())
}

/// The canonical archive set for a run (spec §4.8 step 2). `static_checks`
/// node output is not archived separately: its pass/fail lives in
/// `execute_log.json`, which is archived here already.
fn canonical_archive_paths(layout: &PlanLayout) -> Vec<PathBuf> {
    vec![
        layout.proposal_md(),
        layout.plan_dag_json(),
        layout.acceptance_json(),
        layout.retry_json(),
        layout.scripts_dir(),
        layout.compile_report_json(),
        layout.execute_log_json(),
        layout.execute_summary_md(),
        layout.eval_metrics_json(),
        layout.final_metrics_json(),
        layout.final_report_md(),
        layout.checkpoint_manifest_json(),
        layout.repairs_dir(),
    ]
}

/// Finds the most recent prior run's archived `final_metrics.json` to use
/// as an implicit baseline when the caller doesn't supply `--baseline`.
fn most_recent_baseline(layout: &PlanLayout, exclude_run_id: &str) -> Option<PathBuf> {
    let runs_dir = layout.runs_dir();
    let mut run_ids: Vec<String> = std::fs::read_dir(&runs_dir)
        .ok()?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|id| id != exclude_run_id)
        .collect();
    run_ids.sort();
    for id in run_ids.into_iter().rev() {
        let candidate = layout.run_dir(&id).join("report").join("final_metrics.json");
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

fn find_node_result<'a>(log: &'a ExecuteLog, selector: &str) -> Option<&'a planctl_execute::NodeResult> {
    log.results
        .iter()
        .find(|r| r.node_id == selector)
        .or_else(|| log.results.iter().find(|r| r.node_type == selector))
}

/// Applies the general needs_confirm invariant (spec §3 acceptance
/// invariant + §4.8 step 5 last bullet): a would-be pass on a check with
/// `needs_confirm=true` only stands if the check's id/selector is recorded
/// in `manual_approvals.json`; otherwise it is downgraded to needs_confirm.
fn apply_needs_confirm_gate(check: &AcceptanceCheck, verdict: Verdict, approved: &HashSet<String>) -> Verdict {
    if verdict != Verdict::Pass || !check.needs_confirm {
        return verdict;
    }
    let is_approved = check
        .id
        .as_ref()
        .map(|id| approved.contains(id))
        .unwrap_or(false)
        || approved.contains(&check.selector);
    if is_approved {
        Verdict::Pass
    } else {
        Verdict::NeedsConfirm
    }
}

fn evaluate_artifact_exists(check: &AcceptanceCheck, plan_root: &Path) -> (Verdict, String) {
    let path = plan_root.join(&check.selector);
    if path.exists() {
        (Verdict::Pass, format!("{} exists", check.selector))
    } else {
        (Verdict::Fail, format!("{} not found", check.selector))
    }
}

fn evaluate_metric_threshold(check: &AcceptanceCheck, metrics: &HashMap<String, Value>) -> (Verdict, String) {
    let Some(expected) = &check.value else {
        return (Verdict::NeedsConfirm, "check has no expected value".to_string());
    };
    let Some(actual) = metrics.get(&check.selector) else {
        return if check.needs_confirm {
            (Verdict::NeedsConfirm, format!("metric {} missing", check.selector))
        } else {
            (Verdict::Fail, format!("metric {} missing", check.selector))
        };
    };

    let op = check.op.unwrap_or(ComparisonOp::Ge);
    if let (Some(a), Some(e)) = (numeric(actual), numeric(expected)) {
        let ok = op.compare_numeric(a, e);
        (
            if ok { Verdict::Pass } else { Verdict::Fail },
            format!("{} {} {} = {}", a, op.as_symbol(), e, ok),
        )
    } else if let (Some(a), Some(e)) = (actual.as_str(), expected.as_str()) {
        let ok = match op {
            ComparisonOp::Eq => a == e,
            ComparisonOp::Ne => a != e,
            _ => false,
        };
        (if ok { Verdict::Pass } else { Verdict::Fail }, format!("\"{}\" {} \"{}\" = {}", a, op.as_symbol(), e, ok))
    } else {
        (Verdict::Fail, "metric/expected value type mismatch".to_string())
    }
}

fn evaluate_command_exit_code(check: &AcceptanceCheck, log: Option<&ExecuteLog>) -> (Verdict, String) {
    let Some(log) = log else {
        return (Verdict::Fail, "execute_log.json not available".to_string());
    };
    let Some(result) = find_node_result(log, &check.selector) else {
        return (Verdict::Fail, format!("no node matching {}", check.selector));
    };
    let Some(last) = result.attempts.last() else {
        return (Verdict::Fail, "node has no attempts".to_string());
    };
    let actual = match (last.ok, last.exit_code) {
        (true, None) => 0,
        (false, None) => 1,
        (_, Some(code)) => code,
    };
    let expected = check.value.as_ref().and_then(numeric).unwrap_or(0.0) as i32;
    let op = check.op.unwrap_or(ComparisonOp::Eq);
    let ok = op.compare_numeric(actual as f64, expected as f64);
    (
        if ok { Verdict::Pass } else { Verdict::Fail },
        format!("exit code {} {} {} = {}", actual, op.as_symbol(), expected, ok),
    )
}

fn evaluate_manual_approval(check: &AcceptanceCheck, approved: &HashSet<String>) -> (Verdict, String) {
    let matched = check.id.as_ref().map(|id| approved.contains(id)).unwrap_or(false) || approved.contains(&check.selector);
    if matched {
        (Verdict::Pass, "approval recorded".to_string())
    } else {
        (Verdict::NeedsConfirm, "no recorded approval".to_string())
    }
}

fn evaluate_check(
    check: &AcceptanceCheck,
    plan_root: &Path,
    metrics: &HashMap<String, Value>,
    execute_log: Option<&ExecuteLog>,
    approved: &HashSet<String>,
) -> CheckResult {
    let (mut verdict, detail) = match check.check_type {
        CheckType::ArtifactExists => evaluate_artifact_exists(check, plan_root),
        CheckType::MetricThreshold => evaluate_metric_threshold(check, metrics),
        CheckType::CommandExitCode => evaluate_command_exit_code(check, execute_log),
        CheckType::ManualApproval => evaluate_manual_approval(check, approved),
    };
    verdict = apply_needs_confirm_gate(check, verdict, approved);
    CheckResult { id: check.id.clone(), check_type: check.check_type, selector: check.selector.clone(), verdict, detail }
}

fn aggregate_status(checks: &[CheckResult]) -> AcceptStatus {
    if checks.iter().any(|c| c.verdict == Verdict::Fail) {
        AcceptStatus::Fail
    } else if checks.iter().any(|c| c.verdict == Verdict::NeedsConfirm) {
        AcceptStatus::NeedsConfirm
    } else {
        AcceptStatus::Pass
    }
}

fn render_report_md(report: &AcceptanceReport) -> String {
    let mut out = String::from("# Acceptance Report\n\n");
    out.push_str(&format!("Status: **{:?}**\n\n", report.status));
    out.push_str("| check | type | selector | verdict | detail |\n| --- | --- | --- | --- | --- |\n");
    for c in &report.checks {
        out.push_str(&format!(
            "| {} | {:?} | {} | {:?} | {} |\n",
            c.id.clone().unwrap_or_default(),
            c.check_type,
            c.selector,
            c.verdict,
            c.detail
        ));
    }
    if !report.metric_deltas.is_empty() {
        out.push_str("\n## Metric deltas vs baseline\n\n| metric | baseline | current | delta |\n| --- | --- | --- | --- |\n");
        for d in &report.metric_deltas {
            out.push_str(&format!("| {} | {} | {} | {:+} |\n", d.metric, d.baseline, d.current, d.delta));
        }
    }
    if !report.errors.is_empty() {
        out.push_str("\n## Errors\n\n");
        for e in &report.errors {
            out.push_str(&format!("- {}\n", e));
        }
    }
    out
}

pub async fn accept_proposal_results(opts: AcceptOptions) -> Result<AcceptOutcome, AcceptError> {
    let layout = PlanLayout::new(&opts.plan_dir);

    let dag_errors: Vec<String> = match read_json::<PlanDag>(&layout.plan_dag_json()) {
        Ok(dag) => validate_dag(&dag).err().unwrap_or_default().iter().map(|e: &DagError| e.to_string()).collect(),
        Err(e) => vec![format!("could not read plan.dag.json: {}", e)],
    };
    if !dag_errors.is_empty() {
        let report = AcceptanceReport {
            run_id: None,
            status: AcceptStatus::Fail,
            checks: vec![],
            metric_deltas: vec![],
            errors: dag_errors,
        };
        write_json_pretty(&layout.acceptance_report_json(), &report)?;
        std::fs::write(layout.acceptance_report_md(), render_report_md(&report))?;
        return Ok(AcceptOutcome { exit_code: report.status.exit_code(), report });
    }

    let entropy = uuid::Uuid::new_v4();
    let run_id = compute_run_id(Utc::now(), entropy.as_bytes());
    let run_dir = layout.run_dir(&run_id);
    std::fs::create_dir_all(&run_dir)?;

    let mut manifest = Vec::new();
    for path in canonical_archive_paths(&layout) {
        archive_path(&layout.root, &path, &run_dir, &mut manifest)?;
    }

    let final_metrics_path = if layout.final_metrics_json().is_file() {
        layout.final_metrics_json()
    } else {
        layout.eval_metrics_json()
    };
    let metrics = load_scalar_metrics(&final_metrics_path);

    let baseline_path = opts.baseline_path.clone().or_else(|| most_recent_baseline(&layout, &run_id));
    let baseline_metrics = baseline_path.as_deref().map(load_scalar_metrics).unwrap_or_default();
    let mut metric_deltas = Vec::new();
    for (k, current) in &metrics {
        if let (Some(c), Some(b)) = (numeric(current), baseline_metrics.get(k).and_then(numeric)) {
            metric_deltas.push(MetricDelta { metric: k.clone(), baseline: b, current: c, delta: c - b });
        }
    }

    let execute_log = read_json::<ExecuteLog>(&layout.execute_log_json()).ok();
    let approved = read_json::<ManualApprovalsFile>(&layout.manual_approvals_json())
        .map(|f| f.approved_set())
        .unwrap_or_default();

    let spec: AcceptanceSpec = read_json(&layout.acceptance_json()).unwrap_or_default();
    let checks: Vec<CheckResult> = spec
        .checks
        .iter()
        .map(|c| evaluate_check(c, &layout.root, &metrics, execute_log.as_ref(), &approved))
        .collect();

    let status = aggregate_status(&checks);
    let report = AcceptanceReport { run_id: Some(run_id.clone()), status, checks, metric_deltas, errors: vec![] };

    write_json_pretty(&layout.acceptance_report_json(), &report)?;
    std::fs::write(layout.acceptance_report_md(), render_report_md(&report))?;
    archive_path(&layout.root, &layout.acceptance_report_json(), &run_dir, &mut manifest)?;
    archive_path(&layout.root, &layout.acceptance_report_md(), &run_dir, &mut manifest)?;

    let run_manifest = RunManifest { run_id: run_id.clone(), created_at: Utc::now().to_rfc3339(), files: manifest };
    write_json_pretty(&layout.run_manifest_json(&run_id), &run_manifest)?;

    Ok(AcceptOutcome { exit_code: report.status.exit_code(), report })
}
