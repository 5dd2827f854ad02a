use crate::auth::ResolvedAuth;
use planctl_registry::NodeRegistry;
use planctl_sandbox::{SandboxRunner, SystemExecutor};
use planctl_scheduler::Scheduler;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Bind address mode, mirrored from the teacher's `loopback`/`lan` choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMode {
    Loopback,
    Lan,
}

impl BindMode {
    pub fn to_addr(self) -> &'static str {
        match self {
            BindMode::Loopback => "127.0.0.1",
            BindMode::Lan => "0.0.0.0",
        }
    }
}

pub struct GatewayConfig {
    pub port: u16,
    pub bind: BindMode,
    pub auth: ResolvedAuth,
    pub workspace: PathBuf,
    pub sandbox_image: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 8790,
            bind: BindMode::Loopback,
            auth: ResolvedAuth::none(),
            workspace: std::env::current_dir().unwrap_or_default(),
            sandbox_image: "planctl-sandbox:latest".to_string(),
        }
    }
}

/// Shared state behind every `/ws` connection and every RPC call: the node
/// registry and GPU scheduler are the single authoritative instances spec
/// §4.5/§4.6 call for; the sandbox runner is shared so `proposal.execute`
/// calls routed through the gateway reuse the same per-plan containers the
/// dispatch loop's CPU nodes would.
pub struct GatewayState {
    pub registry: Arc<NodeRegistry>,
    pub scheduler: Scheduler,
    pub sandbox: SandboxRunner<SystemExecutor>,
    pub workspace: PathBuf,
    pub auth: ResolvedAuth,
    pub started_at: Instant,
}

impl GatewayState {
    pub fn new(config: &GatewayConfig) -> Arc<Self> {
        let registry = Arc::new(NodeRegistry::new());
        let scheduler = Scheduler::spawn(registry.clone());
        Arc::new(Self {
            registry,
            scheduler,
            sandbox: SandboxRunner::new(config.sandbox_image.clone()),
            workspace: config.workspace.clone(),
            auth: config.auth.clone(),
            started_at: Instant::now(),
        })
    }
}
