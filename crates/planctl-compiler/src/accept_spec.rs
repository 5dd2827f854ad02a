//! Acceptance spec derivation (spec §4.1 step 5).

use crate::entities::ExtractedEntities;
use planctl_core::acceptance::{AcceptanceCheck, AcceptanceSpec, CheckType, ComparisonOp, SuggestedBy};

fn artifact_check(id: &str, selector: &str) -> AcceptanceCheck {
    AcceptanceCheck {
        id: Some(id.to_string()),
        check_type: CheckType::ArtifactExists,
        selector: selector.to_string(),
        op: None,
        value: None,
        unit: None,
        needs_confirm: false,
        suggested_by: SuggestedBy::Compiler,
        evidence: vec![],
        description: None,
    }
}

pub fn build_acceptance_spec(entities: &ExtractedEntities) -> AcceptanceSpec {
    let mut checks = vec![
        artifact_check("accept.final_metrics", "report/final_metrics.json"),
        artifact_check("accept.final_report", "report/final_report.md"),
    ];

    for (i, metric) in entities.metrics.iter().enumerate() {
        let has_threshold = metric.has_concrete_threshold();
        let op = metric
            .op
            .as_deref()
            .and_then(ComparisonOp::from_symbol)
            .unwrap_or(ComparisonOp::Ge);
        checks.push(AcceptanceCheck {
            id: Some(format!("accept.metric.{}.{}", i, metric.name)),
            check_type: CheckType::MetricThreshold,
            selector: metric.name.clone(),
            op: Some(op),
            value: metric.value.map(|v| serde_json::json!(v)),
            unit: metric.unit.clone(),
            needs_confirm: !has_threshold,
            suggested_by: SuggestedBy::Proposal,
            evidence: vec![],
            description: None,
        });
    }

    AcceptanceSpec { checks }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::MetricTarget;

    #[test]
    fn always_includes_heuristic_artifact_defaults() {
        let spec = build_acceptance_spec(&ExtractedEntities::default());
        assert_eq!(spec.checks.len(), 2);
        assert!(spec.checks.iter().all(|c| matches!(c.check_type, CheckType::ArtifactExists)));
    }

    #[test]
    fn metric_with_concrete_threshold_is_not_needs_confirm() {
        let entities = ExtractedEntities {
            metrics: vec![MetricTarget {
                name: "accuracy".into(),
                op: Some(">=".into()),
                value: Some(0.8),
                unit: None,
            }],
            ..Default::default()
        };
        let spec = build_acceptance_spec(&entities);
        let metric_check = spec.checks.iter().find(|c| c.selector == "accuracy").unwrap();
        assert!(!metric_check.needs_confirm);
        assert_eq!(metric_check.value, Some(serde_json::json!(0.8)));
    }

    #[test]
    fn metric_without_threshold_is_needs_confirm() {
        let entities = ExtractedEntities {
            metrics: vec![MetricTarget {
                name: "perplexity".into(),
                op: None,
                value: None,
                unit: None,
            }],
            ..Default::default()
        };
        let spec = build_acceptance_spec(&entities);
        let metric_check = spec.checks.iter().find(|c| c.selector == "perplexity").unwrap();
        assert!(metric_check.needs_confirm);
    }
}
