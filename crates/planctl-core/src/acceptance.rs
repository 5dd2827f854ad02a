//! Acceptance spec types (evaluated later by planctl-accept).

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckType {
    MetricThreshold,
    ArtifactExists,
    CommandExitCode,
    ManualApproval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOp {
    Ge,
    Le,
    Eq,
    Gt,
    Lt,
    Ne,
}

impl ComparisonOp {
    pub fn as_symbol(&self) -> &'static str {
        match self {
            Self::Ge => ">=",
            Self::Le => "<=",
            Self::Eq => "==",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Ne => "!=",
        }
    }

    pub fn from_symbol(s: &str) -> Option<Self> {
        Some(match s {
            ">=" => Self::Ge,
            "<=" => Self::Le,
            "==" => Self::Eq,
            ">" => Self::Gt,
            "<" => Self::Lt,
            "!=" => Self::Ne,
            _ => return None,
        })
    }

    pub fn compare_numeric(&self, actual: f64, expected: f64) -> bool {
        match self {
            Self::Ge => actual >= expected,
            Self::Le => actual <= expected,
            Self::Eq => (actual - expected).abs() < f64::EPSILON,
            Self::Gt => actual > expected,
            Self::Lt => actual < expected,
            Self::Ne => (actual - expected).abs() >= f64::EPSILON,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedBy {
    Proposal,
    Llm,
    NetworkEvidence,
    Compiler,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptanceCheck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub check_type: CheckType,
    pub selector: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<ComparisonOp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default)]
    pub needs_confirm: bool,
    pub suggested_by: SuggestedBy,
    #[serde(default)]
    pub evidence: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AcceptanceSpec {
    pub checks: Vec<AcceptanceCheck>,
}
