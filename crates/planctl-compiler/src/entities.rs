//! Entity extraction (spec §4.1 step 2): LLM-first with a regex-heuristic
//! fallback for GitHub repos, Hugging Face datasets, and Kaggle datasets.

use planctl_core::ids::sanitize_id;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub repo: String,
}

impl RepoRef {
    pub fn repo_key(&self) -> String {
        sanitize_id(&format!("{}/{}", self.owner, self.repo))
    }

    pub fn clone_url(&self) -> String {
        format!("https://github.com/{}/{}.git", self.owner, self.repo)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    HuggingFace,
    Kaggle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetRef {
    pub kind: DatasetKind,
    pub namespace: String,
    pub name: String,
}

impl DatasetRef {
    pub fn label(&self) -> String {
        sanitize_id(&format!("{}/{}", self.namespace, self.name))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricTarget {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl MetricTarget {
    pub fn has_concrete_threshold(&self) -> bool {
        self.op.is_some() && self.value.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Constraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_mem_gb: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedEntities {
    #[serde(default)]
    pub repos: Vec<RepoRef>,
    #[serde(default)]
    pub datasets: Vec<DatasetRef>,
    #[serde(default)]
    pub metrics: Vec<MetricTarget>,
    #[serde(default)]
    pub constraints: Option<Constraints>,
    #[serde(default)]
    pub deliverables: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// The strict JSON schema the LLM is asked to return, validated the same
/// way as the heuristic path once parsed.
pub fn llm_extraction_prompt(proposal: &str) -> String {
    format!(
        "Extract structured entities from this experiment proposal. \
         Respond with ONLY JSON matching this schema: \
         {{\"repos\":[{{\"owner\":str,\"repo\":str}}],\"datasets\":[{{\"kind\":\"hugging_face\"|\"kaggle\",\"namespace\":str,\"name\":str}}],\
         \"metrics\":[{{\"name\":str,\"op\":str?,\"value\":number?,\"unit\":str?}}],\
         \"constraints\":{{\"gpu_count\":number?,\"gpu_type\":str?,\"gpu_mem_gb\":number?}}?,\
         \"deliverables\":[str],\"notes\":str?}}\n\nPROPOSAL:\n{proposal}"
    )
}

/// Validates a parsed LLM response has at least the shape we expect, since
/// a model can emit valid JSON that isn't this schema.
pub fn validate_llm_entities(value: &serde_json::Value) -> bool {
    value.is_object() && value.get("repos").map(|r| r.is_array()).unwrap_or(false)
}

fn github_repo_regex() -> Regex {
    Regex::new(r"(?i)github\.com/([A-Za-z0-9_.-]+)/([A-Za-z0-9_.-]+?)(?:\.git)?(?:[/\s)]|$)").unwrap()
}

fn repo_label_regex() -> Regex {
    Regex::new(r"(?mi)^\s*repo(?:sitory)?:\s*(?:https?://github\.com/)?([A-Za-z0-9_.-]+)/([A-Za-z0-9_.-]+?)\s*$").unwrap()
}

fn hf_dataset_regex() -> Regex {
    Regex::new(r"(?i)huggingface\.co/datasets/([A-Za-z0-9_.-]+)/([A-Za-z0-9_.-]+)").unwrap()
}

fn kaggle_dataset_regex() -> Regex {
    Regex::new(r"(?i)kaggle\.com/datasets/([A-Za-z0-9_.-]+)/([A-Za-z0-9_.-]+)").unwrap()
}

fn metric_line_regex() -> Regex {
    Regex::new(r"(?mi)^\s*metric:\s*([A-Za-z0-9_.\-]+)\s*(>=|<=|==|!=|>|<)?\s*([0-9]+(?:\.[0-9]+)?)?\s*(\S+)?\s*$").unwrap()
}

/// Regex fallback used when no LLM is present or the LLM's output fails
/// `validate_llm_entities`.
pub fn extract_heuristic(proposal: &str) -> ExtractedEntities {
    let mut repos = Vec::new();
    let mut push_repo = |owner: &str, repo: &str| {
        let owner = owner.to_string();
        let repo = repo.trim_end_matches('.').to_string();
        if !repos
            .iter()
            .any(|r: &RepoRef| r.owner.eq_ignore_ascii_case(&owner) && r.repo.eq_ignore_ascii_case(&repo))
        {
            repos.push(RepoRef { owner, repo });
        }
    };
    for cap in repo_label_regex().captures_iter(proposal) {
        push_repo(&cap[1], &cap[2]);
    }
    for cap in github_repo_regex().captures_iter(proposal) {
        push_repo(&cap[1], &cap[2]);
    }

    let mut datasets = Vec::new();
    for cap in hf_dataset_regex().captures_iter(proposal) {
        datasets.push(DatasetRef {
            kind: DatasetKind::HuggingFace,
            namespace: cap[1].to_string(),
            name: cap[2].to_string(),
        });
    }
    for cap in kaggle_dataset_regex().captures_iter(proposal) {
        datasets.push(DatasetRef {
            kind: DatasetKind::Kaggle,
            namespace: cap[1].to_string(),
            name: cap[2].to_string(),
        });
    }

    let mut metrics = Vec::new();
    for cap in metric_line_regex().captures_iter(proposal) {
        let name = cap[1].to_string();
        let op = cap.get(2).map(|m| m.as_str().to_string());
        let value = cap.get(3).and_then(|m| m.as_str().parse::<f64>().ok());
        let unit = cap.get(4).map(|m| m.as_str().to_string());
        metrics.push(MetricTarget { name, op, value, unit });
    }

    ExtractedEntities {
        repos,
        datasets,
        metrics,
        constraints: None,
        deliverables: Vec::new(),
        notes: None,
    }
}
