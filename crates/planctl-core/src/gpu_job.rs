//! GpuJob: the scheduler-internal work unit (spec §3, §4.6).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    Manual,
    Policy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalDecision {
    AllowOnce,
    AllowAlways,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeWindow {
    /// mon/tue/wed/thu/fri/sat/sun; empty = any day.
    #[serde(default)]
    pub days: Vec<String>,
    /// "HH:MM" 24h.
    pub start: String,
    pub end: String,
    /// IANA timezone name.
    pub tz: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobPolicy {
    #[serde(default)]
    pub auto_pause: bool,
    #[serde(default)]
    pub auto_resume: bool,
    #[serde(default)]
    pub windows: Vec<TimeWindow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecSpec {
    pub argv: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub command_timeout_ms: Option<u64>,
    #[serde(default)]
    pub invoke_timeout_ms: Option<u64>,
    #[serde(default)]
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_decision: Option<ApprovalDecision>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub attempt: u32,
    pub node_id: String,
    pub started_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timed_out: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_tail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_tail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Attempt {
    pub fn is_in_flight(&self) -> bool {
        self.finished_at_ms.is_none()
    }
}

use crate::dag::ResourceRequest;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuJob {
    pub job_id: String,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub state: JobState,
    #[serde(default)]
    pub paused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_reason: Option<PauseReason>,
    #[serde(default)]
    pub pause_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before_ms: Option<i64>,
    #[serde(default)]
    pub policy: JobPolicy,
    pub resources: ResourceRequest,
    pub exec: ExecSpec,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_node_id: Option<String>,
    #[serde(default)]
    pub attempts: Vec<Attempt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub cancel_requested: bool,
}

impl GpuJob {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            JobState::Succeeded | JobState::Failed | JobState::Canceled
        )
    }

    /// Invariant: at most one in-flight attempt per job.
    pub fn in_flight_attempt_count(&self) -> usize {
        self.attempts.iter().filter(|a| a.is_in_flight()).count()
    }

    /// `state=running` ⇒ `assignedNodeId` set and last attempt has no `finishedAtMs`.
    pub fn running_invariant_holds(&self) -> bool {
        if self.state != JobState::Running {
            return true;
        }
        self.assigned_node_id.is_some()
            && self
                .attempts
                .last()
                .map(|a| a.finished_at_ms.is_none())
                .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_job() -> GpuJob {
        GpuJob {
            job_id: "job-1".into(),
            created_at_ms: 0,
            updated_at_ms: 0,
            state: JobState::Queued,
            paused: false,
            paused_reason: None,
            pause_requested: false,
            not_before_ms: None,
            policy: JobPolicy::default(),
            resources: ResourceRequest {
                gpu_count: Some(1),
                ..Default::default()
            },
            exec: ExecSpec {
                argv: vec!["true".into()],
                cwd: None,
                env: HashMap::new(),
                command_timeout_ms: None,
                invoke_timeout_ms: None,
                approved: true,
                approval_decision: None,
            },
            max_attempts: 3,
            assigned_node_id: None,
            attempts: vec![],
            result: None,
            cancel_requested: false,
        }
    }

    // ==== terminal / invariants ====

    #[test]
    fn queued_job_is_not_terminal() {
        assert!(!base_job().is_terminal());
    }

    #[test]
    fn succeeded_job_is_terminal() {
        let mut j = base_job();
        j.state = JobState::Succeeded;
        assert!(j.is_terminal());
    }

    #[test]
    fn at_most_one_in_flight_attempt() {
        let mut j = base_job();
        j.attempts.push(Attempt {
            attempt: 1,
            node_id: "n1".into(),
            started_at_ms: 0,
            finished_at_ms: None,
            ok: None,
            exit_code: None,
            timed_out: None,
            stdout_tail: None,
            stderr_tail: None,
            error: None,
        });
        assert_eq!(j.in_flight_attempt_count(), 1);
    }

    #[test]
    fn running_invariant_requires_assigned_node_and_open_attempt() {
        let mut j = base_job();
        j.state = JobState::Running;
        assert!(!j.running_invariant_holds(), "no assigned node, no attempt");

        j.assigned_node_id = Some("n1".into());
        j.attempts.push(Attempt {
            attempt: 1,
            node_id: "n1".into(),
            started_at_ms: 0,
            finished_at_ms: None,
            ok: None,
            exit_code: None,
            timed_out: None,
            stdout_tail: None,
            stderr_tail: None,
            error: None,
        });
        assert!(j.running_invariant_holds());
    }

    #[test]
    fn running_invariant_violated_if_last_attempt_finished() {
        let mut j = base_job();
        j.state = JobState::Running;
        j.assigned_node_id = Some("n1".into());
        j.attempts.push(Attempt {
            attempt: 1,
            node_id: "n1".into(),
            started_at_ms: 0,
            finished_at_ms: Some(10),
            ok: Some(true),
            exit_code: Some(0),
            timed_out: Some(false),
            stdout_tail: None,
            stderr_tail: None,
            error: None,
        });
        assert!(!j.running_invariant_holds());
    }
}
