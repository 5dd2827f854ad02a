//! Repair & Evidence (C8, spec §4.7): the concrete `RepairHook` the execute
//! engine calls into on an eligible failure. Extracts a `file:line`
//! reference from the failing command's output, asks an LLM for a unified
//! patch, applies it with the patch confined to the plan's repo checkout,
//! and records before/after evidence plus metric deltas once the following
//! attempt completes. Grounded on `planctl-compiler::entities`'s
//! LLM-call-then-validate-then-fall-back shape (`extract_entities`):
//! prompt, parse, validate, degrade to "no patch" on any failure rather
//! than propagating an LLM error.

use planctl_core::layout::{read_json, write_json_pretty, PlanLayout};
use planctl_execute::{RepairContext, RepairHook};
use planctl_llm::LlmClient;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RepairError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStatus {
    AppliedOnly,
    RerunOk,
    RerunFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricDelta {
    pub metric: String,
    pub before: f64,
    pub after: f64,
    pub delta: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairEvidence {
    pub node_id: String,
    pub attempt: u32,
    pub status: RepairStatus,
    pub patch_summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_ref: Option<String>,
    pub files_touched: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_exit_ok: Option<bool>,
    #[serde(default)]
    pub metric_deltas: Vec<MetricDelta>,
}

fn file_ref_regex() -> Regex {
    Regex::new(r"(?m)([\w./\-]+\.(?:py|rs|js|ts|tsx|jsx|go|java|c|cc|cpp|h|hpp|rb|sh))[:,](\d+)(?:[:,](\d+))?").unwrap()
}

/// Confines `relative` inside `root`, rejecting any path that climbs out
/// via `..` or resolves to an absolute location outside the repo.
fn confine(root: &Path, relative: &str) -> Option<PathBuf> {
    let candidate = root.join(relative);
    let mut depth: i32 = 0;
    for component in Path::new(relative).components() {
        match component {
            std::path::Component::ParentDir => depth -= 1,
            std::path::Component::Normal(_) => depth += 1,
            std::path::Component::RootDir | std::path::Component::Prefix(_) => return None,
            std::path::Component::CurDir => {}
        }
        if depth < 0 {
            return None;
        }
    }
    Some(candidate)
}

fn snippet_around(path: &Path, line: usize, radius: usize) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return None;
    }
    let center = line.saturating_sub(1).min(lines.len() - 1);
    let start = center.saturating_sub(radius);
    let end = (center + radius + 1).min(lines.len());
    Some(
        lines[start..end]
            .iter()
            .enumerate()
            .map(|(i, l)| format!("{:>5} | {}", start + i + 1, l))
            .collect::<Vec<_>>()
            .join("\n"),
    )
}

fn build_prompt(ctx: &RepairContext<'_>, file_ref: Option<&str>, snippet: Option<&str>) -> String {
    let mut prompt = format!(
        "A command failed while running node `{}` (attempt {}), classified as `{:?}`.\n\n",
        ctx.node_id, ctx.attempt, ctx.category
    );
    prompt.push_str("STDOUT (tail):\n");
    prompt.push_str(ctx.stdout);
    prompt.push_str("\n\nSTDERR (tail):\n");
    prompt.push_str(ctx.stderr);
    if let (Some(f), Some(s)) = (file_ref, snippet) {
        prompt.push_str(&format!("\n\nRELEVANT FILE ({}):\n{}\n", f, s));
    }
    prompt.push_str(
        "\n\nPropose a minimal fix as a unified patch. Respond with ONLY the patch, \
         bracketed exactly as:\n*** Begin Patch\n--- a/relative/path\n+++ b/relative/path\n\
         @@\n-old line\n+new line\n*** End Patch\n\
         Use one file per patch. If you cannot determine a fix, respond with NO_PATCH.",
    );
    prompt
}

fn extract_patch(text: &str) -> Option<String> {
    let start = text.find("*** Begin Patch")?;
    let end = text.find("*** End Patch")?;
    if end <= start {
        return None;
    }
    let body = &text[start + "*** Begin Patch".len()..end];
    let trimmed = body.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Applies a minimal single-file unified diff: for each `--- a/<path>` /
/// `+++ b/<path>` pair, replaces the contiguous block of `-` lines in the
/// hunk with the block of `+` lines via a literal substring match against
/// the target file. Returns the relative paths touched.
fn apply_patch(patch: &str, repo_root: &Path) -> Result<Vec<String>, String> {
    let mut touched = Vec::new();
    let lines: Vec<&str> = patch.lines().collect();
    let mut i = 0;
    while i < lines.len() {
        if let Some(rest) = lines[i].strip_prefix("--- a/").or_else(|| lines[i].strip_prefix("--- ")) {
            let old_path = rest.trim();
            i += 1;
            let target_rel = if i < lines.len() {
                lines[i].strip_prefix("+++ b/").or_else(|| lines[i].strip_prefix("+++ ")).unwrap_or(old_path).trim()
            } else {
                old_path
            };
            i += 1;

            let mut old_block = Vec::new();
            let mut new_block = Vec::new();
            while i < lines.len() && !lines[i].starts_with("--- ") {
                let line = lines[i];
                if let Some(l) = line.strip_prefix('-') {
                    old_block.push(l.to_string());
                } else if let Some(l) = line.strip_prefix('+') {
                    new_block.push(l.to_string());
                }
                i += 1;
            }

            let target = confine(repo_root, target_rel).ok_or_else(|| format!("patch path {} escapes repo root", target_rel))?;
            let content = std::fs::read_to_string(&target).map_err(|e| e.to_string())?;
            let old_text = old_block.join("\n");
            let new_text = new_block.join("\n");
            if old_text.is_empty() || !content.contains(&old_text) {
                return Err(format!("could not locate patch context in {}", target_rel));
            }
            let updated = content.replacen(&old_text, &new_text, 1);
            std::fs::write(&target, updated).map_err(|e| e.to_string())?;
            touched.push(target_rel.to_string());
        } else {
            i += 1;
        }
    }
    if touched.is_empty() {
        Err("patch contained no recognizable file headers".to_string())
    } else {
        Ok(touched)
    }
}

fn load_metrics(layout: &PlanLayout) -> HashMap<String, f64> {
    let mut out = HashMap::new();
    for path in [layout.eval_metrics_json(), layout.final_metrics_json()] {
        if let Ok(value) = read_json::<serde_json::Value>(&path) {
            if let Some(obj) = value.as_object() {
                for (k, v) in obj {
                    if let Some(n) = v.as_f64() {
                        out.insert(k.clone(), n);
                    }
                }
            }
        }
    }
    out
}

struct PendingRepair {
    attempt: u32,
    file_ref: Option<String>,
    patch_summary: String,
    files_touched: Vec<String>,
    before_metrics: HashMap<String, f64>,
}

/// Stateful `RepairHook` implementation: one instance is shared across a
/// plan's whole execute run so it can enforce a per-node repair budget and
/// carry `on_failure`'s before-snapshot through to `finalize`.
pub struct RepairLoop<'a> {
    layout: &'a PlanLayout,
    llm: &'a dyn LlmClient,
    repo_root: PathBuf,
    max_repair_attempts: u32,
    used: HashMap<String, u32>,
    pending: HashMap<String, PendingRepair>,
}

impl<'a> RepairLoop<'a> {
    pub fn new(layout: &'a PlanLayout, llm: &'a dyn LlmClient, repo_root: PathBuf, max_repair_attempts: u32) -> Self {
        Self {
            layout,
            llm,
            repo_root,
            max_repair_attempts: max_repair_attempts.max(1),
            used: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    fn write_evidence(&self, node_id: &str, attempt: u32, evidence: &RepairEvidence) {
        let path = self.layout.repair_evidence_json(node_id, attempt);
        if let Err(e) = write_json_pretty(&path, evidence) {
            warn!(node_id, %e, "failed to write repair_evidence.json");
        }
    }
}

#[async_trait::async_trait]
impl<'a> RepairHook for RepairLoop<'a> {
    async fn on_failure(&mut self, ctx: RepairContext<'_>) -> Option<String> {
        let used = self.used.entry(ctx.node_id.to_string()).or_insert(0);
        if *used >= self.max_repair_attempts {
            info!(node_id = ctx.node_id, "repair budget exhausted; skipping");
            return None;
        }

        let combined = format!("{}\n{}", ctx.stderr, ctx.stdout);
        let file_ref = file_ref_regex().captures(&combined).map(|c| {
            let path = c.get(1).unwrap().as_str();
            let line = c.get(2).unwrap().as_str();
            format!("{}:{}", path, line)
        });
        let snippet = file_ref.as_ref().and_then(|r| {
            let (path, line) = r.split_once(':')?;
            let line: usize = line.parse().ok()?;
            let resolved = confine(&self.repo_root, path)?;
            snippet_around(&resolved, line, 20)
        });

        let prompt = build_prompt(&ctx, file_ref.as_deref(), snippet.as_deref());
        let response = match self.llm.complete(&prompt).await {
            Ok(text) => text,
            Err(e) => {
                warn!(node_id = ctx.node_id, %e, "repair LLM call failed");
                return None;
            }
        };

        if response.trim() == "NO_PATCH" {
            return None;
        }
        let patch = extract_patch(&response)?;
        let files_touched = match apply_patch(&patch, &self.repo_root) {
            Ok(f) => f,
            Err(e) => {
                warn!(node_id = ctx.node_id, %e, "failed to apply repair patch");
                return None;
            }
        };

        *used += 1;
        let attempt = ctx.attempt;
        let patch_summary = patch.lines().take(3).collect::<Vec<_>>().join(" / ");
        let before_metrics = load_metrics(self.layout);

        self.write_evidence(
            ctx.node_id,
            attempt,
            &RepairEvidence {
                node_id: ctx.node_id.to_string(),
                attempt,
                status: RepairStatus::AppliedOnly,
                patch_summary: patch_summary.clone(),
                file_ref: file_ref.clone(),
                files_touched: files_touched.clone(),
                after_exit_ok: None,
                metric_deltas: vec![],
            },
        );

        self.pending.insert(
            ctx.node_id.to_string(),
            PendingRepair { attempt, file_ref, patch_summary: patch_summary.clone(), files_touched, before_metrics },
        );

        Some(patch_summary)
    }

    async fn finalize(&mut self, node_id: &str, ok: bool, _stdout: &str, _stderr: &str) {
        let Some(pending) = self.pending.remove(node_id) else {
            return;
        };

        let after_metrics = load_metrics(self.layout);
        let mut deltas = Vec::new();
        for (k, before) in &pending.before_metrics {
            if let Some(after) = after_metrics.get(k) {
                deltas.push(MetricDelta { metric: k.clone(), before: *before, after: *after, delta: after - before });
            }
        }

        let evidence = RepairEvidence {
            node_id: node_id.to_string(),
            attempt: pending.attempt,
            status: if ok { RepairStatus::RerunOk } else { RepairStatus::RerunFailed },
            patch_summary: pending.patch_summary,
            file_ref: pending.file_ref,
            files_touched: pending.files_touched,
            after_exit_ok: Some(ok),
            metric_deltas: deltas,
        };
        self.write_evidence(node_id, pending.attempt, &evidence);
    }
}
