//! Credentials resolver (spec §9 design note): funnels all global
//! environment-variable reads for external services through one place that
//! accepts an explicit environment snapshot plus an optional on-disk
//! secrets file, instead of scattering `std::env::var` calls through the
//! compiler/execute code.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretsFile {
    #[serde(default)]
    pub hf_token: Option<String>,
    #[serde(default)]
    pub kaggle_username: Option<String>,
    #[serde(default)]
    pub kaggle_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedCredentials {
    pub hf_token: Option<String>,
    pub kaggle_username: Option<String>,
    pub kaggle_key: Option<String>,
}

impl ResolvedCredentials {
    pub fn has_kaggle(&self) -> bool {
        self.kaggle_username.is_some() && self.kaggle_key.is_some()
    }
}

/// Resolve credentials from an explicit environment snapshot, falling back
/// to an on-disk secrets file when the env doesn't supply a value. The
/// environment always wins — this mirrors the common env-override-file
/// precedence used for the rest of the system's config.
pub fn resolve(env: &HashMap<String, String>, secrets_file: Option<&SecretsFile>) -> ResolvedCredentials {
    let hf_token = env
        .get("HF_TOKEN")
        .or_else(|| env.get("HUGGINGFACE_HUB_TOKEN"))
        .cloned()
        .or_else(|| secrets_file.and_then(|s| s.hf_token.clone()));

    let kaggle_username = env
        .get("KAGGLE_USERNAME")
        .cloned()
        .or_else(|| secrets_file.and_then(|s| s.kaggle_username.clone()));

    let kaggle_key = env
        .get("KAGGLE_KEY")
        .cloned()
        .or_else(|| secrets_file.and_then(|s| s.kaggle_key.clone()));

    ResolvedCredentials {
        hf_token,
        kaggle_username,
        kaggle_key,
    }
}

pub fn load_secrets_file(path: &Path) -> std::io::Result<Option<SecretsFile>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    let parsed: SecretsFile = serde_json::from_str(&raw).map_err(std::io::Error::other)?;
    Ok(Some(parsed))
}

/// Snapshot the process environment once, at startup — callers pass this
/// map down explicitly rather than reading `std::env::var` deep in compiler
/// or execute-engine code.
pub fn snapshot_env() -> HashMap<String, String> {
    std::env::vars().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    // ==== resolve ====

    #[test]
    fn env_hf_token_wins_over_secrets_file() {
        let e = env(&[("HF_TOKEN", "from-env")]);
        let file = SecretsFile {
            hf_token: Some("from-file".into()),
            ..Default::default()
        };
        let resolved = resolve(&e, Some(&file));
        assert_eq!(resolved.hf_token.as_deref(), Some("from-env"));
    }

    #[test]
    fn huggingface_hub_token_is_an_alias_for_hf_token() {
        let e = env(&[("HUGGINGFACE_HUB_TOKEN", "abc")]);
        let resolved = resolve(&e, None);
        assert_eq!(resolved.hf_token.as_deref(), Some("abc"));
    }

    #[test]
    fn falls_back_to_secrets_file_when_env_absent() {
        let e = HashMap::new();
        let file = SecretsFile {
            kaggle_username: Some("bob".into()),
            kaggle_key: Some("key123".into()),
            ..Default::default()
        };
        let resolved = resolve(&e, Some(&file));
        assert!(resolved.has_kaggle());
    }

    #[test]
    fn missing_kaggle_credentials_reports_false() {
        let resolved = resolve(&HashMap::new(), None);
        assert!(!resolved.has_kaggle());
    }

    #[test]
    fn partial_kaggle_credentials_do_not_count_as_present() {
        let e = env(&[("KAGGLE_USERNAME", "bob")]);
        let resolved = resolve(&e, None);
        assert!(!resolved.has_kaggle());
    }
}
