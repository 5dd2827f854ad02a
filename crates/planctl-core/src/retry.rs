//! Retry policy table shared by the execute engine and the compiler.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryCategory {
    Network,
    RateLimit,
    BuildFail,
    TestFail,
    Oom,
    Divergence,
    DataMissing,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backoff {
    pub kind: BackoffKind,
    pub base_ms: u64,
    pub max_ms: u64,
    #[serde(default)]
    pub jitter: bool,
}

impl Backoff {
    /// `jitter_factor` is a caller-supplied sample in `[0.75, 1.25]`; pass
    /// `1.0` to disable jitter deterministically in tests.
    pub fn delay_ms(&self, attempt: u32, jitter_factor: f64) -> u64 {
        let base = match self.kind {
            BackoffKind::Fixed => self.base_ms.min(self.max_ms),
            BackoffKind::Exponential => {
                let scaled = (self.base_ms as f64) * 2f64.powi(attempt.saturating_sub(1) as i32);
                (scaled as u64).min(self.max_ms)
            }
        };
        if self.jitter {
            ((base as f64) * jitter_factor).round() as u64
        } else {
            base
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub id: String,
    pub category: RetryCategory,
    pub max_attempts: u32,
    pub backoff: Backoff,
    #[serde(default)]
    pub retryable_patterns: Vec<String>,
    #[serde(default)]
    pub repair_actions: Vec<String>,
}

impl RetryPolicy {
    /// Case-insensitive substring search over stderr||stdout.
    pub fn matches_output(&self, combined_output: &str) -> bool {
        let lower = combined_output.to_lowercase();
        self.retryable_patterns
            .iter()
            .any(|p| lower.contains(&p.to_lowercase()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySpec {
    pub policies: Vec<RetryPolicy>,
    pub default_policy_id: String,
}

impl RetrySpec {
    pub fn policy(&self, id: &str) -> Option<&RetryPolicy> {
        self.policies.iter().find(|p| p.id == id)
    }

    pub fn default_policy(&self) -> Option<&RetryPolicy> {
        self.policy(&self.default_policy_id)
    }

    /// Classify a failure by scanning each policy's retryable patterns in
    /// order, falling back to the node's declared policy category, and
    /// finally to `unknown`.
    pub fn classify<'a>(
        &'a self,
        combined_output: &str,
        node_policy_id: Option<&str>,
    ) -> &'a RetryPolicy {
        for policy in &self.policies {
            if policy.matches_output(combined_output) {
                return policy;
            }
        }
        if let Some(id) = node_policy_id {
            if let Some(p) = self.policy(id) {
                return p;
            }
        }
        self.default_policy()
            .unwrap_or_else(|| self.policies.last().expect("non-empty policy table"))
    }

    /// The built-in 8-policy table the compiler always attaches.
    pub fn built_in() -> Self {
        let fixed = |base: u64, max: u64| Backoff {
            kind: BackoffKind::Fixed,
            base_ms: base,
            max_ms: max,
            jitter: false,
        };
        let exp = |base: u64, max: u64| Backoff {
            kind: BackoffKind::Exponential,
            base_ms: base,
            max_ms: max,
            jitter: true,
        };
        let policies = vec![
            RetryPolicy {
                id: "retry.network".into(),
                category: RetryCategory::Network,
                max_attempts: 5,
                backoff: exp(1000, 30_000),
                retryable_patterns: vec![
                    "connection reset".into(),
                    "timed out".into(),
                    "temporary failure in name resolution".into(),
                    "could not resolve host".into(),
                ],
                repair_actions: vec![],
            },
            RetryPolicy {
                id: "retry.rate_limit".into(),
                category: RetryCategory::RateLimit,
                max_attempts: 6,
                backoff: exp(2000, 60_000),
                retryable_patterns: vec!["rate limit".into(), "429".into(), "too many requests".into()],
                repair_actions: vec![],
            },
            RetryPolicy {
                id: "retry.build_fail".into(),
                category: RetryCategory::BuildFail,
                max_attempts: 2,
                backoff: fixed(2000, 2000),
                retryable_patterns: vec!["error: failed to compile".into(), "build failed".into()],
                repair_actions: vec!["inspect build log for the first error".into()],
            },
            RetryPolicy {
                id: "retry.test_fail".into(),
                category: RetryCategory::TestFail,
                max_attempts: 2,
                backoff: fixed(1000, 1000),
                retryable_patterns: vec!["assertionerror".into(), "test failed".into()],
                repair_actions: vec!["inspect failing assertion".into()],
            },
            RetryPolicy {
                id: "retry.oom".into(),
                category: RetryCategory::Oom,
                max_attempts: 1,
                backoff: fixed(0, 0),
                retryable_patterns: vec!["out of memory".into(), "cuda out of memory".into(), "oom killed".into()],
                repair_actions: vec!["reduce batch size".into()],
            },
            RetryPolicy {
                id: "retry.divergence".into(),
                category: RetryCategory::Divergence,
                max_attempts: 1,
                backoff: fixed(0, 0),
                retryable_patterns: vec!["nan".into(), "loss is inf".into(), "diverged".into()],
                repair_actions: vec!["lower learning rate".into()],
            },
            RetryPolicy {
                id: "retry.data_missing".into(),
                category: RetryCategory::DataMissing,
                max_attempts: 2,
                backoff: fixed(1000, 1000),
                retryable_patterns: vec!["no such file or directory".into(), "dataset not found".into()],
                repair_actions: vec![],
            },
            RetryPolicy {
                id: "retry.unknown".into(),
                category: RetryCategory::Unknown,
                max_attempts: 1,
                backoff: fixed(0, 0),
                retryable_patterns: vec![],
                repair_actions: vec![],
            },
        ];
        Self {
            policies,
            default_policy_id: "retry.unknown".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==== Backoff ====

    #[test]
    fn fixed_backoff_is_capped_at_max() {
        let b = Backoff {
            kind: BackoffKind::Fixed,
            base_ms: 5000,
            max_ms: 2000,
            jitter: false,
        };
        assert_eq!(b.delay_ms(1, 1.0), 2000);
    }

    #[test]
    fn exponential_backoff_doubles_per_attempt() {
        let b = Backoff {
            kind: BackoffKind::Exponential,
            base_ms: 100,
            max_ms: 100_000,
            jitter: false,
        };
        assert_eq!(b.delay_ms(1, 1.0), 100);
        assert_eq!(b.delay_ms(2, 1.0), 200);
        assert_eq!(b.delay_ms(3, 1.0), 400);
    }

    #[test]
    fn exponential_backoff_caps_at_max_ms() {
        let b = Backoff {
            kind: BackoffKind::Exponential,
            base_ms: 1000,
            max_ms: 1500,
            jitter: false,
        };
        assert_eq!(b.delay_ms(10, 1.0), 1500);
    }

    #[test]
    fn jitter_scales_delay() {
        let b = Backoff {
            kind: BackoffKind::Fixed,
            base_ms: 1000,
            max_ms: 1000,
            jitter: true,
        };
        assert_eq!(b.delay_ms(1, 0.75), 750);
        assert_eq!(b.delay_ms(1, 1.25), 1250);
    }

    // ==== RetrySpec::classify ====

    #[test]
    fn classify_matches_network_pattern() {
        let spec = RetrySpec::built_in();
        let p = spec.classify("Error: Connection reset by peer", None);
        assert_eq!(p.id, "retry.network");
    }

    #[test]
    fn classify_falls_back_to_node_policy_then_default() {
        let spec = RetrySpec::built_in();
        let p = spec.classify("some opaque failure", Some("retry.oom"));
        assert_eq!(p.id, "retry.oom");

        let p2 = spec.classify("some opaque failure", None);
        assert_eq!(p2.id, "retry.unknown");
    }

    #[test]
    fn classify_is_case_insensitive() {
        let spec = RetrySpec::built_in();
        let p = spec.classify("CUDA OUT OF MEMORY at step 12", None);
        assert_eq!(p.id, "retry.oom");
    }

    #[test]
    fn built_in_table_has_eight_policies_and_unknown_default() {
        let spec = RetrySpec::built_in();
        assert_eq!(spec.policies.len(), 8);
        assert_eq!(spec.default_policy_id, "retry.unknown");
        assert!(spec.default_policy().is_some());
    }
}
