//! GPU Job Scheduler (C7, spec §4.6 / §9): a single-threaded actor owning
//! all `GpuJob` state, driven by a command channel rather than a shared
//! lock — the design note calls this out explicitly to avoid lock-order
//! bugs between submit/pause/cancel/dispatch. Grounded on the shape of
//! `agenticlaw-gateway`'s `ws.rs` broadcast-fanout pattern for notifying
//! `wait` callers of terminal transitions, and on `NodeRegistry::invoke`
//! (planctl-registry) for the actual GPU work dispatch.

pub mod clock;

use clock::{Clock, SystemClock};
use planctl_core::dag::ResourceRequest;
use planctl_core::gpu_job::{Attempt, ExecSpec, GpuJob, JobPolicy, JobState, PauseReason};
use planctl_core::window::in_window;
use planctl_registry::{InvokeOutcome, NodeRegistry, RegistryError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum SchedulerError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unknown job {0}")]
    UnknownJob(String),
}

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub resources: ResourceRequest,
    pub exec: ExecSpec,
    pub max_attempts: Option<u32>,
    pub policy: Option<JobPolicy>,
}

#[derive(Debug, Clone)]
pub struct WaitOutcome {
    pub done: bool,
    pub job: GpuJob,
}

enum Command {
    Submit(SubmitRequest, oneshot::Sender<Result<GpuJob, SchedulerError>>),
    Get(String, oneshot::Sender<Option<GpuJob>>),
    List(Option<JobState>, oneshot::Sender<Vec<GpuJob>>),
    Cancel(String, oneshot::Sender<Result<(), SchedulerError>>),
    Pause(String, oneshot::Sender<Result<(), SchedulerError>>),
    Resume(String, oneshot::Sender<Result<(), SchedulerError>>),
    AttemptFinished {
        job_id: String,
        attempt: u32,
        outcome: Result<InvokeOutcome, RegistryError>,
    },
}

/// Handle to the scheduler's background actor. Cheap to clone — every
/// clone shares the same command channel and terminal-state broadcast.
#[derive(Clone)]
pub struct Scheduler {
    cmd_tx: mpsc::UnboundedSender<Command>,
    terminal_tx: broadcast::Sender<GpuJob>,
}

impl Scheduler {
    pub fn spawn(registry: Arc<NodeRegistry>) -> Self {
        Self::spawn_with_clock(registry, Arc::new(SystemClock))
    }

    pub fn spawn_with_clock(registry: Arc<NodeRegistry>, clock: Arc<dyn Clock>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (terminal_tx, _) = broadcast::channel(1024);
        let actor = SchedulerActor {
            jobs: HashMap::new(),
            order: Vec::new(),
            registry,
            clock,
            self_tx: cmd_tx.clone(),
            terminal_tx: terminal_tx.clone(),
        };
        tokio::spawn(actor.run(cmd_rx));
        Scheduler { cmd_tx, terminal_tx }
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> T {
        let (tx, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(build(tx));
        rx.await.expect("scheduler actor task is still running")
    }

    pub async fn submit(&self, req: SubmitRequest) -> Result<GpuJob, SchedulerError> {
        self.call(|tx| Command::Submit(req, tx)).await
    }

    pub async fn get(&self, job_id: &str) -> Option<GpuJob> {
        self.call(|tx| Command::Get(job_id.to_string(), tx)).await
    }

    pub async fn list(&self, state: Option<JobState>) -> Vec<GpuJob> {
        self.call(|tx| Command::List(state, tx)).await
    }

    pub async fn cancel(&self, job_id: &str) -> Result<(), SchedulerError> {
        self.call(|tx| Command::Cancel(job_id.to_string(), tx)).await
    }

    pub async fn pause(&self, job_id: &str) -> Result<(), SchedulerError> {
        self.call(|tx| Command::Pause(job_id.to_string(), tx)).await
    }

    pub async fn resume(&self, job_id: &str) -> Result<(), SchedulerError> {
        self.call(|tx| Command::Resume(job_id.to_string(), tx)).await
    }

    /// Blocks up to `timeout_ms` for `job_id` to reach a terminal state,
    /// then returns the current snapshot regardless of whether it got
    /// there. `timeout_ms == 0` is treated as an immediate, level-triggered
    /// poll (spec's wait semantics are level-triggered, not edge-triggered,
    /// so a job that was already terminal before this call still reports
    /// `done: true`).
    pub async fn wait(&self, job_id: &str, timeout_ms: u64) -> Result<WaitOutcome, SchedulerError> {
        let mut rx = self.terminal_tx.subscribe();
        let job = self
            .get(job_id)
            .await
            .ok_or_else(|| SchedulerError::UnknownJob(job_id.to_string()))?;
        if job.is_terminal() || timeout_ms == 0 {
            let done = job.is_terminal();
            return Ok(WaitOutcome { done, job });
        }

        let job_id_owned = job_id.to_string();
        let raced = tokio::time::timeout(Duration::from_millis(timeout_ms), async move {
            loop {
                match rx.recv().await {
                    Ok(j) if j.job_id == job_id_owned => return Some(j),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .await;

        match raced {
            Ok(Some(j)) => Ok(WaitOutcome { done: true, job: j }),
            Ok(None) | Err(_) => {
                let snapshot = self.get(job_id).await.unwrap_or(job);
                let done = snapshot.is_terminal();
                Ok(WaitOutcome { done, job: snapshot })
            }
        }
    }
}

struct SchedulerActor {
    jobs: HashMap<String, GpuJob>,
    /// Insertion / FIFO order. A manual pause-while-running preemption
    /// moves the job's id back to the front; everything else leaves this
    /// alone.
    order: Vec<String>,
    registry: Arc<NodeRegistry>,
    clock: Arc<dyn Clock>,
    self_tx: mpsc::UnboundedSender<Command>,
    terminal_tx: broadcast::Sender<GpuJob>,
}

impl SchedulerActor {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(250));
        loop {
            tokio::select! {
                maybe_cmd = cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(cmd) => self.handle(cmd),
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    self.apply_policies();
                    self.dispatch();
                }
            }
        }
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Submit(req, reply) => {
                let result = self.submit(req);
                let _ = reply.send(result);
                self.dispatch();
            }
            Command::Get(id, reply) => {
                let _ = reply.send(self.jobs.get(&id).cloned());
            }
            Command::List(filter, reply) => {
                let mut jobs: Vec<GpuJob> = self
                    .order
                    .iter()
                    .filter_map(|id| self.jobs.get(id))
                    .cloned()
                    .collect();
                if let Some(state) = filter {
                    jobs.retain(|j| j.state == state);
                }
                let _ = reply.send(jobs);
            }
            Command::Cancel(id, reply) => {
                let result = self.cancel(&id);
                let _ = reply.send(result);
                self.dispatch();
            }
            Command::Pause(id, reply) => {
                let result = self.pause(&id);
                let _ = reply.send(result);
                self.dispatch();
            }
            Command::Resume(id, reply) => {
                let result = self.resume(&id);
                let _ = reply.send(result);
                self.dispatch();
            }
            Command::AttemptFinished { job_id, attempt, outcome } => {
                self.attempt_finished(job_id, attempt, outcome);
                self.dispatch();
            }
        }
    }

    fn submit(&mut self, req: SubmitRequest) -> Result<GpuJob, SchedulerError> {
        if req.resources.gpu_count.unwrap_or(0) == 0 {
            return Err(SchedulerError::InvalidRequest(
                "resources.gpuCount must be >= 1".into(),
            ));
        }
        if req.exec.argv.is_empty() {
            return Err(SchedulerError::InvalidRequest(
                "exec.argv must not be empty".into(),
            ));
        }
        let now = self.clock.now_ms();
        let job = GpuJob {
            job_id: format!("gpu-{}", uuid::Uuid::new_v4().simple()),
            created_at_ms: now,
            updated_at_ms: now,
            state: JobState::Queued,
            paused: false,
            paused_reason: None,
            pause_requested: false,
            not_before_ms: None,
            policy: req.policy.unwrap_or_default(),
            resources: req.resources,
            exec: req.exec,
            max_attempts: req.max_attempts.unwrap_or(1).max(1),
            assigned_node_id: None,
            attempts: vec![],
            result: None,
            cancel_requested: false,
        };
        tracing::debug!(job_id = %job.job_id, "gpu job submitted");
        self.order.push(job.job_id.clone());
        self.jobs.insert(job.job_id.clone(), job.clone());
        Ok(job)
    }

    fn cancel(&mut self, id: &str) -> Result<(), SchedulerError> {
        let now = self.clock.now_ms();
        let job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| SchedulerError::UnknownJob(id.to_string()))?;
        match job.state {
            JobState::Queued => {
                job.state = JobState::Canceled;
                job.updated_at_ms = now;
                let snapshot = job.clone();
                self.notify_terminal(snapshot);
            }
            JobState::Running => {
                job.cancel_requested = true;
                job.updated_at_ms = now;
                if let Some(node_id) = job.assigned_node_id.clone() {
                    self.best_effort_cancel(&node_id, id);
                }
            }
            JobState::Succeeded | JobState::Failed | JobState::Canceled => {}
        }
        Ok(())
    }

    fn pause(&mut self, id: &str) -> Result<(), SchedulerError> {
        let now = self.clock.now_ms();
        let job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| SchedulerError::UnknownJob(id.to_string()))?;
        match job.state {
            JobState::Queued => {
                job.paused = true;
                job.paused_reason = Some(PauseReason::Manual);
                job.updated_at_ms = now;
            }
            JobState::Running => {
                // Preempt: finalize the in-flight attempt as a non-timeout
                // failure and return the job to the head of the queue,
                // paused. The real invoke may still be outstanding on the
                // node; its eventual completion is recognized as stale in
                // `attempt_finished` (the attempt already has a
                // `finished_at_ms`) and discarded.
                if let Some(attempt) = job.attempts.last_mut() {
                    if attempt.finished_at_ms.is_none() {
                        attempt.finished_at_ms = Some(now);
                        attempt.ok = Some(false);
                        attempt.timed_out = Some(false);
                        attempt.error = Some("preempted by pause".into());
                    }
                }
                let node_id = job.assigned_node_id.take();
                job.state = JobState::Queued;
                job.paused = true;
                job.paused_reason = Some(PauseReason::Manual);
                job.pause_requested = false;
                job.updated_at_ms = now;
                if let Some(node_id) = node_id {
                    self.best_effort_cancel(&node_id, id);
                }
                self.order.retain(|existing| existing != id);
                self.order.insert(0, id.to_string());
                tracing::info!(job_id = id, "preempted running gpu job on pause");
            }
            JobState::Succeeded | JobState::Failed | JobState::Canceled => {}
        }
        Ok(())
    }

    fn resume(&mut self, id: &str) -> Result<(), SchedulerError> {
        let now = self.clock.now_ms();
        let job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| SchedulerError::UnknownJob(id.to_string()))?;
        if job.paused {
            job.paused = false;
            job.paused_reason = None;
            job.updated_at_ms = now;
        }
        Ok(())
    }

    /// Fire-and-forget `system.cancel`, best effort — the preempting/
    /// cancelling caller doesn't wait on it, it just asks the node to stop
    /// work it no longer owns.
    fn best_effort_cancel(&self, node_id: &str, job_id: &str) {
        let registry = self.registry.clone();
        let node_id = node_id.to_string();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            let _ = registry
                .invoke(
                    &node_id,
                    "system.cancel",
                    serde_json::json!({ "jobId": job_id }),
                    Some(5_000),
                    None,
                )
                .await;
        });
    }

    /// Policy-window auto-pause/auto-resume, applied only to queued jobs
    /// that are not manually paused-and-never-policy-touched. An empty
    /// `windows` list with `autoPause` set is treated as "never outside a
    /// window" — fail safe toward progress rather than pausing forever.
    fn apply_policies(&mut self) {
        let now = self.clock.now_utc();
        let ids: Vec<String> = self.order.clone();
        for id in ids {
            let Some(job) = self.jobs.get_mut(&id) else { continue };
            if job.state != JobState::Queued {
                continue;
            }
            if !job.policy.auto_pause && !job.policy.auto_resume {
                continue;
            }
            if job.policy.windows.is_empty() {
                if job.paused && job.paused_reason == Some(PauseReason::Policy) {
                    job.paused = false;
                    job.paused_reason = None;
                    job.updated_at_ms = self.clock.now_ms();
                }
                continue;
            }
            let inside = job.policy.windows.iter().any(|w| in_window(now, w));
            if job.policy.auto_pause && !inside && !job.paused {
                job.paused = true;
                job.paused_reason = Some(PauseReason::Policy);
                job.updated_at_ms = self.clock.now_ms();
            } else if inside
                && job.policy.auto_resume
                && job.paused
                && job.paused_reason == Some(PauseReason::Policy)
            {
                job.paused = false;
                job.paused_reason = None;
                job.updated_at_ms = self.clock.now_ms();
            }
        }
    }

    /// FIFO scan of queued, unpaused jobs; assigns at most one node per
    /// job per pass and excludes nodes already backing a running job (and
    /// nodes just claimed earlier in this same pass).
    fn dispatch(&mut self) {
        let mut excluded: Vec<String> = self
            .jobs
            .values()
            .filter(|j| j.state == JobState::Running)
            .filter_map(|j| j.assigned_node_id.clone())
            .collect();

        for id in self.order.clone() {
            let Some(job) = self.jobs.get(&id) else { continue };
            if job.state != JobState::Queued || job.paused {
                continue;
            }
            if let Some(not_before) = job.not_before_ms {
                if self.clock.now_ms() < not_before {
                    continue;
                }
            }
            let mut candidates = self.registry.eligible(&job.resources, &excluded);
            candidates.sort_by(|a, b| a.node_id.cmp(&b.node_id));
            let Some(node) = candidates.into_iter().next() else { continue };
            self.start_attempt(&id, &node.node_id);
            excluded.push(node.node_id);
        }
    }

    fn start_attempt(&mut self, job_id: &str, node_id: &str) {
        let now = self.clock.now_ms();
        let Some(job) = self.jobs.get_mut(job_id) else { return };
        let attempt_number = job.attempts.len() as u32 + 1;
        job.state = JobState::Running;
        job.assigned_node_id = Some(node_id.to_string());
        job.updated_at_ms = now;
        job.attempts.push(Attempt {
            attempt: attempt_number,
            node_id: node_id.to_string(),
            started_at_ms: now,
            finished_at_ms: None,
            ok: None,
            exit_code: None,
            timed_out: None,
            stdout_tail: None,
            stderr_tail: None,
            error: None,
        });
        tracing::debug!(job_id, node_id, attempt = attempt_number, "dispatching gpu job");

        let params = serde_json::json!({
            "argv": job.exec.argv,
            "cwd": job.exec.cwd,
            "env": job.exec.env,
            "timeoutMs": job.exec.command_timeout_ms,
        });
        let timeout_ms = job.exec.invoke_timeout_ms.or(job.exec.command_timeout_ms);
        let idempotency_key = Some(format!("{}:{}", job_id, attempt_number));

        let registry = self.registry.clone();
        let self_tx = self.self_tx.clone();
        let node_id_owned = node_id.to_string();
        let job_id_owned = job_id.to_string();
        tokio::spawn(async move {
            let outcome = registry
                .invoke(&node_id_owned, "system.run", params, timeout_ms, idempotency_key)
                .await;
            let _ = self_tx.send(Command::AttemptFinished {
                job_id: job_id_owned,
                attempt: attempt_number,
                outcome,
            });
        });
    }

    fn attempt_finished(
        &mut self,
        job_id: String,
        attempt_number: u32,
        outcome: Result<InvokeOutcome, RegistryError>,
    ) {
        let now = self.clock.now_ms();
        let Some(job) = self.jobs.get_mut(&job_id) else { return };
        let Some(attempt) = job.attempts.iter_mut().find(|a| a.attempt == attempt_number) else {
            return;
        };
        if attempt.finished_at_ms.is_some() {
            // Already finalized by a preemptive pause; this is the real
            // invoke's late, now-irrelevant completion.
            return;
        }
        attempt.finished_at_ms = Some(now);
        match &outcome {
            Ok(o) => {
                attempt.ok = Some(o.ok);
                attempt.timed_out = Some(false);
                if let Some(payload) = &o.payload {
                    attempt.exit_code = payload
                        .get("exitCode")
                        .and_then(|v| v.as_i64())
                        .map(|v| v as i32);
                    attempt.stdout_tail = payload
                        .get("stdoutTail")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string());
                    attempt.stderr_tail = payload
                        .get("stderrTail")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string());
                }
                attempt.error = o.error.clone();
            }
            Err(RegistryError::Timeout) => {
                attempt.ok = Some(false);
                attempt.timed_out = Some(true);
                attempt.error = Some("invoke timed out".into());
            }
            Err(e) => {
                attempt.ok = Some(false);
                attempt.timed_out = Some(false);
                attempt.error = Some(e.to_string());
            }
        }

        let ok = attempt.ok.unwrap_or(false);
        job.assigned_node_id = None;
        job.updated_at_ms = now;

        if job.cancel_requested {
            job.state = JobState::Canceled;
            tracing::info!(job_id = %job.job_id, "gpu job canceled after in-flight attempt returned");
            self.notify_terminal(job.clone());
            return;
        }
        if ok {
            job.result = match &outcome {
                Ok(o) => o.payload.clone(),
                Err(_) => None,
            };
            job.state = JobState::Succeeded;
            self.notify_terminal(job.clone());
        } else if job.attempts.len() as u32 >= job.max_attempts {
            job.state = JobState::Failed;
            tracing::info!(job_id = %job.job_id, attempts = job.attempts.len(), "gpu job failed, attempts exhausted");
            self.notify_terminal(job.clone());
        } else {
            job.state = JobState::Queued;
        }
    }

    fn notify_terminal(&self, job: GpuJob) {
        let _ = self.terminal_tx.send(job);
    }
}
