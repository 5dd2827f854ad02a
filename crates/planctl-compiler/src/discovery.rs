//! Discovery (spec §4.1 step 3): network probes gated by discovery mode.
//! `off` never touches the network; `plan` probes repo existence; `sample`
//! additionally fetches dataset info for Hugging Face datasets. Kaggle is
//! always deferred to a manual-confirm item since it needs credentials.

use crate::entities::{DatasetKind, ExtractedEntities};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMode {
    Off,
    Plan,
    Sample,
}

impl DiscoveryMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(Self::Off),
            "plan" => Some(Self::Plan),
            "sample" => Some(Self::Sample),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Plan => "plan",
            Self::Sample => "sample",
        }
    }

    fn probes_repos(&self) -> bool {
        !matches!(self, Self::Off)
    }

    fn samples_datasets(&self) -> bool {
        matches!(self, Self::Sample)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoDiscovery {
    pub repo_key: String,
    pub exists: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_branch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetDiscovery {
    pub label: String,
    pub sampled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub splits: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryReport {
    #[serde(default)]
    pub repos: Vec<RepoDiscovery>,
    #[serde(default)]
    pub datasets: Vec<DatasetDiscovery>,
    #[serde(default)]
    pub kaggle_deferred: Vec<String>,
}

impl DiscoveryReport {
    pub fn repo(&self, repo_key: &str) -> Option<&RepoDiscovery> {
        self.repos.iter().find(|r| r.repo_key == repo_key)
    }

    pub fn unverified_repo_keys(&self) -> Vec<String> {
        self.repos
            .iter()
            .filter(|r| !r.exists)
            .map(|r| r.repo_key.clone())
            .collect()
    }
}

/// Probe GitHub's API for each repo; record `exists`/`defaultBranch`. Errors
/// degrade to `exists=false` rather than aborting the whole compile.
pub async fn discover(
    client: &reqwest::Client,
    entities: &ExtractedEntities,
    mode: DiscoveryMode,
) -> DiscoveryReport {
    let mut report = DiscoveryReport::default();

    if mode.probes_repos() {
        for repo in &entities.repos {
            let repo_key = repo.repo_key();
            let url = format!("https://api.github.com/repos/{}/{}", repo.owner, repo.repo);
            let (exists, default_branch) = match client
                .get(&url)
                .header("User-Agent", "planctl")
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    let branch = resp
                        .json::<HashMap<String, serde_json::Value>>()
                        .await
                        .ok()
                        .and_then(|v| v.get("default_branch").and_then(|b| b.as_str()).map(|s| s.to_string()));
                    (true, branch)
                }
                _ => (false, None),
            };
            report.repos.push(RepoDiscovery { repo_key, exists, default_branch });
        }
    }

    for dataset in &entities.datasets {
        match dataset.kind {
            DatasetKind::Kaggle => report.kaggle_deferred.push(dataset.label()),
            DatasetKind::HuggingFace => {
                let sampled = mode.samples_datasets();
                let splits = if sampled {
                    probe_hf_dataset(client, &dataset.namespace, &dataset.name).await
                } else {
                    None
                };
                report.datasets.push(DatasetDiscovery {
                    label: dataset.label(),
                    sampled: sampled && splits.is_some(),
                    splits,
                });
            }
        }
    }

    report
}

async fn probe_hf_dataset(client: &reqwest::Client, namespace: &str, name: &str) -> Option<Vec<String>> {
    let url = format!("https://huggingface.co/api/datasets/{}/{}", namespace, name);
    let resp = client.get(&url).send().await.ok()?;
    if !resp.status().is_success() {
        return None;
    }
    let v: serde_json::Value = resp.json().await.ok()?;
    v.get("splits")
        .and_then(|s| s.as_array())
        .map(|arr| arr.iter().filter_map(|x| x.as_str().map(|s| s.to_string())).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_off_never_probes_repos() {
        assert!(!DiscoveryMode::Off.probes_repos());
        assert!(DiscoveryMode::Plan.probes_repos());
        assert!(DiscoveryMode::Sample.probes_repos());
    }

    #[test]
    fn only_sample_mode_samples_datasets() {
        assert!(!DiscoveryMode::Off.samples_datasets());
        assert!(!DiscoveryMode::Plan.samples_datasets());
        assert!(DiscoveryMode::Sample.samples_datasets());
    }

    #[test]
    fn parse_round_trips_known_modes() {
        for m in ["off", "plan", "sample"] {
            assert_eq!(DiscoveryMode::parse(m).unwrap().as_str(), m);
        }
        assert!(DiscoveryMode::parse("bogus").is_none());
    }

    #[test]
    fn unverified_repo_keys_lists_only_nonexistent() {
        let report = DiscoveryReport {
            repos: vec![
                RepoDiscovery { repo_key: "a".into(), exists: true, default_branch: None },
                RepoDiscovery { repo_key: "b".into(), exists: false, default_branch: None },
            ],
            datasets: vec![],
            kaggle_deferred: vec![],
        };
        assert_eq!(report.unverified_repo_keys(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn off_mode_produces_empty_repo_discovery() {
        let client = reqwest::Client::new();
        let entities = crate::entities::ExtractedEntities {
            repos: vec![crate::entities::RepoRef { owner: "foo".into(), repo: "bar".into() }],
            ..Default::default()
        };
        let report = discover(&client, &entities, DiscoveryMode::Off).await;
        assert!(report.repos.is_empty());
    }

    #[tokio::test]
    async fn kaggle_datasets_are_always_deferred() {
        let client = reqwest::Client::new();
        let entities = crate::entities::ExtractedEntities {
            datasets: vec![crate::entities::DatasetRef {
                kind: DatasetKind::Kaggle,
                namespace: "owner".into(),
                name: "ds".into(),
            }],
            ..Default::default()
        };
        let report = discover(&client, &entities, DiscoveryMode::Sample).await;
        assert_eq!(report.kaggle_deferred, vec!["owner-ds".to_string()]);
    }
}
