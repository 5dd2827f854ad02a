//! Compile report and needs-confirm aggregation (spec §4.1 steps 7-8).

use crate::discovery::DiscoveryReport;
use crate::entities::ExtractedEntities;
use planctl_core::acceptance::AcceptanceSpec;
use planctl_core::dag::PlanDag;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileReport {
    pub plan_id: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub discovery: String,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub needs_confirm: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileProposalResult {
    pub ok: bool,
    pub plan_id: String,
    pub root_dir: String,
    pub report: CompileReport,
}

/// Unverified repos, Kaggle datasets, metric checks with needs_confirm, and
/// missing GPU constraints when a `train` node exists.
pub fn aggregate_needs_confirm(entities: &ExtractedEntities, discovery: &DiscoveryReport, acceptance: &AcceptanceSpec, dag: &PlanDag) -> Vec<String> {
    let mut items = Vec::new();

    for repo_key in discovery.unverified_repo_keys() {
        items.push(format!("repo {} could not be verified to exist", repo_key));
    }
    for label in &discovery.kaggle_deferred {
        items.push(format!("dataset {} requires Kaggle credentials", label));
    }
    for check in &acceptance.checks {
        if check.needs_confirm {
            items.push(format!(
                "acceptance check {} needs confirmation",
                check.id.clone().unwrap_or_else(|| check.selector.clone())
            ));
        }
    }

    if let Some(train) = dag.node("train.run") {
        let has_gpu_constraint = train
            .resources
            .as_ref()
            .and_then(|r| r.gpu_count)
            .map(|c| c > 0)
            .unwrap_or(false);
        if !has_gpu_constraint {
            items.push("train.run has no explicit GPU resource constraint".to_string());
        }
    }

    let _ = entities;
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{DiscoveryReport, RepoDiscovery};
    use planctl_core::acceptance::{AcceptanceCheck, CheckType, SuggestedBy};

    #[test]
    fn aggregates_unverified_repos() {
        let discovery = DiscoveryReport {
            repos: vec![RepoDiscovery { repo_key: "foo-bar".into(), exists: false, default_branch: None }],
            datasets: vec![],
            kaggle_deferred: vec![],
        };
        let items = aggregate_needs_confirm(
            &ExtractedEntities::default(),
            &discovery,
            &AcceptanceSpec::default(),
            &PlanDag::default(),
        );
        assert!(items.iter().any(|s| s.contains("foo-bar")));
    }

    #[test]
    fn aggregates_needs_confirm_acceptance_checks() {
        let acceptance = AcceptanceSpec {
            checks: vec![AcceptanceCheck {
                id: Some("accept.metric.0.perplexity".into()),
                check_type: CheckType::MetricThreshold,
                selector: "perplexity".into(),
                op: None,
                value: None,
                unit: None,
                needs_confirm: true,
                suggested_by: SuggestedBy::Proposal,
                evidence: vec![],
                description: None,
            }],
        };
        let items = aggregate_needs_confirm(
            &ExtractedEntities::default(),
            &DiscoveryReport::default(),
            &acceptance,
            &PlanDag::default(),
        );
        assert!(items.iter().any(|s| s.contains("accept.metric.0.perplexity")));
    }

    #[test]
    fn missing_gpu_constraint_on_train_node_is_flagged() {
        use planctl_core::dag::{Node, Tool};
        use std::collections::HashMap;
        let dag = PlanDag {
            nodes: vec![Node {
                id: "train.run".into(),
                node_type: "train".into(),
                tool: Tool::Shell,
                inputs: vec![],
                outputs: vec![],
                commands: vec!["python train.py".into()],
                env: HashMap::new(),
                resources: None,
                retry_policy_id: None,
            }],
            edges: vec![],
        };
        let items = aggregate_needs_confirm(
            &ExtractedEntities::default(),
            &DiscoveryReport::default(),
            &AcceptanceSpec::default(),
            &dag,
        );
        assert!(items.iter().any(|s| s.contains("GPU resource constraint")));
    }
}
