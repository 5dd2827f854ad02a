//! The framework-adapter contract (spec §1 out-of-scope collaborator):
//! given a repo profile, produce the shell command sequences for the
//! execution chain. Production would have one adapter per ML framework
//! (torch, jax, huggingface trainer, ...); this crate ships a single
//! generic pip-based fallback.

use serde::{Deserialize, Serialize};

/// What the compiler/discovery step learned about a fetched repo — framework
/// guess and entrypoint hints, not the full git metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoProfile {
    pub repo_key: String,
    #[serde(default)]
    pub framework: Option<String>,
    #[serde(default)]
    pub train_entrypoint: Option<String>,
    #[serde(default)]
    pub eval_entrypoint: Option<String>,
    #[serde(default)]
    pub requirements_file: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShellPlan {
    pub setup: Vec<String>,
    pub install: Vec<String>,
    pub train: Vec<String>,
    pub eval: Vec<String>,
}

pub trait FrameworkAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this adapter claims to know how to handle the given profile.
    /// The compiler tries adapters in order and falls back to the generic
    /// one if none claim it.
    fn supports(&self, profile: &RepoProfile) -> bool;

    fn build_shell_plan(&self, profile: &RepoProfile) -> ShellPlan;
}

/// Falls back to a plain `pip install -r requirements.txt` + a `python
/// <entrypoint>` invocation when nothing more specific recognises the repo.
pub struct GenericPipAdapter;

impl FrameworkAdapter for GenericPipAdapter {
    fn name(&self) -> &str {
        "generic-pip"
    }

    fn supports(&self, _profile: &RepoProfile) -> bool {
        true
    }

    fn build_shell_plan(&self, profile: &RepoProfile) -> ShellPlan {
        let requirements = profile
            .requirements_file
            .clone()
            .unwrap_or_else(|| "requirements.txt".to_string());
        let train_entry = profile
            .train_entrypoint
            .clone()
            .unwrap_or_else(|| "train.py".to_string());
        let eval_entry = profile
            .eval_entrypoint
            .clone()
            .unwrap_or_else(|| "eval.py".to_string());

        ShellPlan {
            setup: vec!["python -m venv .venv".into(), ". .venv/bin/activate".into()],
            install: vec![format!(". .venv/bin/activate && pip install -r {}", requirements)],
            train: vec![format!(". .venv/bin/activate && python {}", train_entry)],
            eval: vec![format!(". .venv/bin/activate && python {}", eval_entry)],
        }
    }
}
