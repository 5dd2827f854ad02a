//! Sandbox Runner (C5): ensures a long-lived container per plan and runs
//! CPU shell commands inside it via `docker exec`. Grounded on
//! `agenticlaw-tools::tools::bash::BashTool`'s timeout + `kill_on_drop`
//! process-execution pattern, generalized from a bare `bash -c` invocation
//! on the host to a `docker exec -w <dir> -e ... <container> sh -lc <cmds>`
//! invocation against a container the runner owns the lifecycle of.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Fixed root every plan's host workdir is mapped under inside the
/// container (spec §4.4: "paths outside the plan map to the container
/// root, never leak host absolute paths").
pub const CONTAINER_ROOT: &str = "/workspace";
const DEFAULT_FALLBACK_IMAGE: &str = "python:3.11-slim";

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to spawn {0}: {1}")]
    Spawn(String, std::io::Error),
    #[error("failed to inspect docker image {0}")]
    ImageInspectFailed(String),
    #[error("failed to build sandbox image from {0:?}")]
    BuildFailed(PathBuf),
    #[error("failed to start container {0}")]
    ContainerStartFailed(String),
}

/// Raw bytes + exit status from one subprocess invocation, before string
/// conversion/truncation. Mirrors `std::process::Output` but also carries
/// whether the process was killed on timeout.
#[derive(Debug, Clone)]
pub struct RawOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

/// The host-side process invocation abstraction. Production runs real
/// `docker` subprocesses; tests substitute a deterministic stub so the
/// container lifecycle logic can be exercised without a docker daemon.
#[async_trait]
pub trait ProcessExecutor: Send + Sync {
    async fn run(&self, program: &str, args: &[String], timeout: Duration) -> std::io::Result<RawOutput>;
}

/// Spawns a real subprocess with `kill_on_drop(true)`, racing the process
/// exit against a timeout exactly as `BashTool::execute_cancellable` does.
pub struct SystemExecutor;

#[async_trait]
impl ProcessExecutor for SystemExecutor {
    async fn run(&self, program: &str, args: &[String], timeout: Duration) -> std::io::Result<RawOutput> {
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()?;

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                let stdout = read_pipe(child.stdout.take()).await;
                let stderr = read_pipe(child.stderr.take()).await;
                Ok(RawOutput {
                    stdout,
                    stderr,
                    exit_code: status.code(),
                    timed_out: false,
                })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                let _ = child.kill().await;
                Ok(RawOutput {
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                    exit_code: None,
                    timed_out: true,
                })
            }
        }
    }
}

async fn read_pipe(pipe: Option<impl tokio::io::AsyncRead + Unpin>) -> Vec<u8> {
    use tokio::io::AsyncReadExt;
    match pipe {
        Some(mut p) => {
            let mut buf = Vec::new();
            let _ = p.read_to_end(&mut buf).await;
            buf
        }
        None => Vec::new(),
    }
}

/// Result of running a shell command inside the sandbox — tails are not
/// applied here (the execute engine owns log-length policy); this is the
/// full capture.
#[derive(Debug, Clone)]
pub struct SandboxResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub killed: bool,
}

/// Maps a host workdir (expected to live under `plan_root`) to its
/// container-side path under `CONTAINER_ROOT`. A host path outside the
/// plan root maps to the bare container root rather than leaking the host
/// absolute path.
pub fn container_workdir(plan_root: &Path, host_workdir: &Path) -> String {
    match host_workdir.strip_prefix(plan_root) {
        Ok(rel) if !rel.as_os_str().is_empty() => {
            let rel_str = rel.to_string_lossy().replace('\\', "/");
            format!("{}/{}", CONTAINER_ROOT, rel_str)
        }
        _ => CONTAINER_ROOT.to_string(),
    }
}

fn container_name_for(key: &str) -> String {
    let sanitized: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' { c } else { '-' })
        .collect();
    format!("planctl-{}", sanitized)
}

/// One long-lived container per (planId, agentId), ensured lazily and
/// reused for every CPU node in that plan's execution.
pub struct SandboxRunner<E: ProcessExecutor = SystemExecutor> {
    executor: E,
    /// ensured-container key -> container name
    containers: DashMap<String, String>,
    fallback_image: String,
}

impl SandboxRunner<SystemExecutor> {
    pub fn new(fallback_image: impl Into<String>) -> Self {
        Self::with_executor(SystemExecutor, fallback_image)
    }
}

impl<E: ProcessExecutor> SandboxRunner<E> {
    pub fn with_executor(executor: E, fallback_image: impl Into<String>) -> Self {
        Self {
            executor,
            containers: DashMap::new(),
            fallback_image: fallback_image.into(),
        }
    }

    fn key(plan_id: &str, agent_id: &str) -> String {
        format!("proposal:{}:{}", plan_id, agent_id)
    }

    /// Ensure exactly one running container exists for (planId, agentId),
    /// building a custom image from `Dockerfile.sandbox` in `caller_cwd` if
    /// present and the default image isn't already there, else falling
    /// back to `fallback_image`. Idempotent: a second call for the same
    /// key is a no-op.
    pub async fn ensure_container(
        &self,
        plan_id: &str,
        agent_id: &str,
        caller_cwd: &Path,
    ) -> Result<String, SandboxError> {
        let key = Self::key(plan_id, agent_id);
        if let Some(existing) = self.containers.get(&key) {
            return Ok(existing.clone());
        }

        let name = container_name_for(&key);
        let dockerfile = caller_cwd.join("Dockerfile.sandbox");
        let image = if dockerfile.is_file() {
            let tag = format!("planctl-sandbox-{}:latest", sanitize_tag(plan_id));
            self.build_image(&tag, &dockerfile, caller_cwd).await?;
            tag
        } else {
            self.ensure_fallback_image().await?;
            self.fallback_image.clone()
        };

        self.start_container(&name, &image).await?;
        self.containers.insert(key, name.clone());
        Ok(name)
    }

    async fn ensure_fallback_image(&self) -> Result<(), SandboxError> {
        let out = self
            .executor
            .run("docker", &["image".into(), "inspect".into(), self.fallback_image.clone()], Duration::from_secs(30))
            .await
            .map_err(|e| SandboxError::Spawn("docker image inspect".into(), e))?;
        if out.exit_code == Some(0) {
            return Ok(());
        }
        debug!(image = %self.fallback_image, "fallback sandbox image not present locally; assuming pull-on-run");
        Ok(())
    }

    async fn build_image(&self, tag: &str, dockerfile: &Path, context: &Path) -> Result<(), SandboxError> {
        let args = vec![
            "build".to_string(),
            "-t".to_string(),
            tag.to_string(),
            "-f".to_string(),
            dockerfile.to_string_lossy().to_string(),
            context.to_string_lossy().to_string(),
        ];
        let out = self
            .executor
            .run("docker", &args, Duration::from_secs(600))
            .await
            .map_err(|e| SandboxError::Spawn("docker build".into(), e))?;
        if out.exit_code != Some(0) {
            return Err(SandboxError::BuildFailed(dockerfile.to_path_buf()));
        }
        info!(tag, "built sandbox image from Dockerfile.sandbox");
        Ok(())
    }

    async fn start_container(&self, name: &str, image: &str) -> Result<(), SandboxError> {
        // Already running?
        let inspect = self
            .executor
            .run(
                "docker",
                &["inspect".into(), "-f".into(), "{{.State.Running}}".into(), name.into()],
                Duration::from_secs(15),
            )
            .await
            .map_err(|e| SandboxError::Spawn("docker inspect".into(), e))?;
        if inspect.exit_code == Some(0) && String::from_utf8_lossy(&inspect.stdout).trim() == "true" {
            return Ok(());
        }

        let run_args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            name.to_string(),
            image.to_string(),
            "sleep".to_string(),
            "infinity".to_string(),
        ];
        let out = self
            .executor
            .run("docker", &run_args, Duration::from_secs(60))
            .await
            .map_err(|e| SandboxError::Spawn("docker run".into(), e))?;
        if out.exit_code != Some(0) {
            return Err(SandboxError::ContainerStartFailed(name.to_string()));
        }
        Ok(())
    }

    /// Run commands (already wrapped by the caller with `set -e`) inside
    /// the plan's container via `docker exec -i -w <workdir> -e K=V ...`.
    pub async fn run_shell(
        &self,
        plan_id: &str,
        agent_id: &str,
        workdir: &str,
        env: &HashMap<String, String>,
        script: &str,
        timeout: Duration,
    ) -> Result<SandboxResult, SandboxError> {
        let key = Self::key(plan_id, agent_id);
        let container = self
            .containers
            .get(&key)
            .map(|e| e.clone())
            .ok_or_else(|| SandboxError::ContainerStartFailed(key.clone()))?;

        let mut args = vec!["exec".to_string(), "-i".to_string(), "-w".to_string(), workdir.to_string()];
        for (k, v) in env {
            args.push("-e".to_string());
            args.push(format!("{}={}", k, v));
        }
        args.push(container);
        args.push("sh".to_string());
        args.push("-lc".to_string());
        args.push(script.to_string());

        let out = self
            .executor
            .run("docker", &args, timeout)
            .await
            .map_err(|e| SandboxError::Spawn("docker exec".into(), e))?;

        if out.timed_out {
            warn!(plan_id, "sandbox command timed out and was killed");
        }

        Ok(SandboxResult {
            stdout: String::from_utf8_lossy(&out.stdout).to_string(),
            stderr: String::from_utf8_lossy(&out.stderr).to_string(),
            exit_code: out.exit_code,
            killed: out.timed_out,
        })
    }
}

fn sanitize_tag(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct StubExecutor {
        calls: Mutex<Vec<(String, Vec<String>)>>,
        build_count: AtomicUsize,
    }

    impl StubExecutor {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                build_count: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ProcessExecutor for StubExecutor {
        async fn run(&self, program: &str, args: &[String], _timeout: Duration) -> std::io::Result<RawOutput> {
            self.calls.lock().unwrap().push((program.to_string(), args.to_vec()));
            if args.first().map(String::as_str) == Some("build") {
                self.build_count.fetch_add(1, Ordering::SeqCst);
            }
            if args.first().map(String::as_str) == Some("inspect") && args.contains(&"{{.State.Running}}".to_string()) {
                // First inspect: not running. Simulate via a simple heuristic on call count.
                let calls = self.calls.lock().unwrap().len();
                let stdout = if calls > 2 { b"true".to_vec() } else { b"false".to_vec() };
                return Ok(RawOutput { stdout, stderr: vec![], exit_code: Some(0), timed_out: false });
            }
            Ok(RawOutput {
                stdout: b"ok".to_vec(),
                stderr: vec![],
                exit_code: Some(0),
                timed_out: false,
            })
        }
    }

    // ==== container_workdir ====

    #[test]
    fn maps_host_path_under_plan_root_to_container_root() {
        let plan_root = Path::new("/plans/p1");
        let host = Path::new("/plans/p1/cache/git/foo-bar");
        assert_eq!(container_workdir(plan_root, host), "/workspace/cache/git/foo-bar");
    }

    #[test]
    fn host_path_equal_to_plan_root_maps_to_bare_container_root() {
        let plan_root = Path::new("/plans/p1");
        assert_eq!(container_workdir(plan_root, plan_root), "/workspace");
    }

    #[test]
    fn host_path_outside_plan_root_never_leaks_host_path() {
        let plan_root = Path::new("/plans/p1");
        let host = Path::new("/etc/passwd");
        let mapped = container_workdir(plan_root, host);
        assert_eq!(mapped, "/workspace");
        assert!(!mapped.contains("/etc"));
    }

    // ==== ensure_container / run_shell ====

    #[tokio::test]
    async fn ensure_container_is_idempotent_for_same_key() {
        let runner = SandboxRunner::with_executor(StubExecutor::new(), DEFAULT_FALLBACK_IMAGE);
        let dir = tempfile::tempdir().unwrap();
        let n1 = runner.ensure_container("plan-1", "agent-1", dir.path()).await.unwrap();
        let n2 = runner.ensure_container("plan-1", "agent-1", dir.path()).await.unwrap();
        assert_eq!(n1, n2);
    }

    #[tokio::test]
    async fn ensure_container_builds_from_dockerfile_sandbox_when_present() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile.sandbox"), "FROM scratch\n").unwrap();
        let executor = StubExecutor::new();
        let runner = SandboxRunner::with_executor(executor, DEFAULT_FALLBACK_IMAGE);
        runner.ensure_container("plan-2", "agent-1", dir.path()).await.unwrap();
        assert_eq!(runner.executor.build_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_shell_fails_if_container_never_ensured() {
        let runner = SandboxRunner::with_executor(StubExecutor::new(), DEFAULT_FALLBACK_IMAGE);
        let result = runner
            .run_shell("plan-x", "agent-1", "/workspace", &HashMap::new(), "echo hi", Duration::from_secs(5))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn run_shell_builds_exec_args_with_workdir_and_env() {
        let runner = SandboxRunner::with_executor(StubExecutor::new(), DEFAULT_FALLBACK_IMAGE);
        let dir = tempfile::tempdir().unwrap();
        runner.ensure_container("plan-3", "agent-1", dir.path()).await.unwrap();

        let mut env = HashMap::new();
        env.insert("OPENCLAW_PLAN_DIR".to_string(), "/workspace".to_string());
        let result = runner
            .run_shell("plan-3", "agent-1", "/workspace/cache/git/foo", &env, "echo hi", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert!(!result.killed);

        let calls = runner.executor.calls.lock().unwrap();
        let exec_call = calls.iter().find(|(p, a)| p == "docker" && a.first().map(String::as_str) == Some("exec")).unwrap();
        assert!(exec_call.1.contains(&"-w".to_string()));
        assert!(exec_call.1.iter().any(|a| a == "OPENCLAW_PLAN_DIR=/workspace"));
    }
}
