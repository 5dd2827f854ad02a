//! On-disk plan package layout (spec §3).

use std::path::{Path, PathBuf};

/// A self-contained plan package directory tree rooted at `root`.
#[derive(Debug, Clone)]
pub struct PlanLayout {
    pub root: PathBuf,
}

impl PlanLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn input_dir(&self) -> PathBuf {
        self.root.join("input")
    }
    pub fn proposal_md(&self) -> PathBuf {
        self.input_dir().join("proposal.md")
    }
    pub fn context_json(&self) -> PathBuf {
        self.input_dir().join("context.json")
    }

    pub fn ir_dir(&self) -> PathBuf {
        self.root.join("ir")
    }
    pub fn extracted_entities_json(&self) -> PathBuf {
        self.ir_dir().join("extracted.entities.json")
    }
    pub fn discovery_json(&self) -> PathBuf {
        self.ir_dir().join("discovery.json")
    }
    pub fn repo_profiles_dir(&self) -> PathBuf {
        self.ir_dir().join("repo_profiles")
    }

    pub fn plan_dir(&self) -> PathBuf {
        self.root.join("plan")
    }
    pub fn plan_dag_json(&self) -> PathBuf {
        self.plan_dir().join("plan.dag.json")
    }
    pub fn acceptance_json(&self) -> PathBuf {
        self.plan_dir().join("acceptance.json")
    }
    pub fn retry_json(&self) -> PathBuf {
        self.plan_dir().join("retry.json")
    }
    pub fn scripts_dir(&self) -> PathBuf {
        self.plan_dir().join("scripts")
    }
    pub fn script_for_node(&self, node_id: &str) -> PathBuf {
        self.scripts_dir().join(format!("{}.sh", node_id))
    }

    pub fn report_dir(&self) -> PathBuf {
        self.root.join("report")
    }
    pub fn compile_report_json(&self) -> PathBuf {
        self.report_dir().join("compile_report.json")
    }
    pub fn needs_confirm_md(&self) -> PathBuf {
        self.report_dir().join("needs_confirm.md")
    }
    pub fn runbook_md(&self) -> PathBuf {
        self.report_dir().join("runbook.md")
    }
    pub fn execute_log_json(&self) -> PathBuf {
        self.report_dir().join("execute_log.json")
    }
    pub fn execute_summary_md(&self) -> PathBuf {
        self.report_dir().join("execute_summary.md")
    }
    pub fn eval_metrics_json(&self) -> PathBuf {
        self.report_dir().join("eval_metrics.json")
    }
    pub fn final_metrics_json(&self) -> PathBuf {
        self.report_dir().join("final_metrics.json")
    }
    pub fn final_report_md(&self) -> PathBuf {
        self.report_dir().join("final_report.md")
    }
    pub fn manual_approvals_json(&self) -> PathBuf {
        self.report_dir().join("manual_approvals.json")
    }
    pub fn checkpoint_manifest_json(&self) -> PathBuf {
        self.report_dir().join("checkpoint_manifest.json")
    }
    pub fn acceptance_report_json(&self) -> PathBuf {
        self.report_dir().join("acceptance_report.json")
    }
    pub fn acceptance_report_md(&self) -> PathBuf {
        self.report_dir().join("acceptance_report.md")
    }

    pub fn repairs_dir(&self) -> PathBuf {
        self.report_dir().join("repairs")
    }
    pub fn repair_attempt_dir(&self, node_id: &str, attempt: u32) -> PathBuf {
        self.repairs_dir()
            .join(node_id)
            .join(format!("attempt-{}", attempt))
    }
    pub fn repair_evidence_json(&self, node_id: &str, attempt: u32) -> PathBuf {
        self.repair_attempt_dir(node_id, attempt)
            .join("repair_evidence.json")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.report_dir().join("runs")
    }
    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(run_id)
    }
    pub fn run_manifest_json(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("manifest.json")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }
    pub fn cache_git_repo(&self, repo_key: &str) -> PathBuf {
        self.cache_dir().join("git").join(repo_key)
    }
    pub fn cache_venv_repo(&self, repo_key: &str) -> PathBuf {
        self.cache_dir().join("venv").join(repo_key)
    }
    pub fn cache_pip(&self) -> PathBuf {
        self.cache_dir().join("pip")
    }
    pub fn cache_hf(&self) -> PathBuf {
        self.cache_dir().join("hf")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join("artifacts")
    }
    pub fn artifacts_model_repo(&self, repo_key: &str) -> PathBuf {
        self.artifacts_dir().join("model").join(repo_key)
    }

    /// Create the full directory skeleton (idempotent).
    pub fn create_skeleton(&self) -> std::io::Result<()> {
        for dir in [
            self.input_dir(),
            self.ir_dir(),
            self.repo_profiles_dir(),
            self.plan_dir(),
            self.scripts_dir(),
            self.report_dir(),
            self.repairs_dir(),
            self.runs_dir(),
            self.cache_dir(),
            self.cache_pip(),
            self.cache_hf(),
            self.artifacts_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Write a JSON document as UTF-8 with a trailing newline (spec §6 on-disk
/// format convention).
pub fn write_json_pretty<T: serde::Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut s = serde_json::to_string_pretty(value).map_err(std::io::Error::other)?;
    s.push('\n');
    std::fs::write(path, s)
}

pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> std::io::Result<T> {
    let s = std::fs::read_to_string(path)?;
    serde_json::from_str(&s).map_err(std::io::Error::other)
}
