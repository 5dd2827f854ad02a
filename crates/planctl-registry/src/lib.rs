//! Node Registry (C6): tracks connected worker nodes, routes `invoke`
//! requests to a node's socket, and resolves responses by request-id with
//! timeouts. Grounded on `agenticlaw-agent::session::SessionRegistry`'s
//! `DashMap`-backed concurrent registry, generalized from chat sessions to
//! worker nodes and from in-process message history to a pending-invoke
//! table.

use dashmap::DashMap;
use planctl_core::node_session::NodeSession;
use planctl_core::protocol::{ConnectFrame, InvokeEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;

pub const DEFAULT_INVOKE_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq)]
pub struct InvokeOutcome {
    pub ok: bool,
    pub payload: Option<serde_json::Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum RegistryError {
    #[error("node {0} is not connected")]
    NotConnected(String),
    #[error("no eligible node available")]
    Unavailable,
    #[error("invoke timed out")]
    Timeout,
    #[error("node {0} disconnected before replying")]
    Disconnected(String),
}

/// How the registry pushes an `InvokeEvent` frame to a connected node. The
/// registry never owns the socket — it only borrows a sink into it (spec
/// §4.5's "scheduler borrows a session, never owns the connection").
pub trait NodeSink: Send + Sync {
    fn send(&self, event: InvokeEvent) -> Result<(), RegistryError>;
}

/// A sink backed by an unbounded channel — what the gateway's websocket
/// writer task drains from.
pub struct ChannelSink {
    pub tx: tokio::sync::mpsc::UnboundedSender<InvokeEvent>,
}

impl NodeSink for ChannelSink {
    fn send(&self, event: InvokeEvent) -> Result<(), RegistryError> {
        self.tx
            .send(event)
            .map_err(|_| RegistryError::Unavailable)
    }
}

struct Registered {
    session: NodeSession,
    sink: Arc<dyn NodeSink>,
}

struct PendingInvoke {
    node_id: String,
    tx: oneshot::Sender<InvokeOutcome>,
}

#[derive(Default)]
pub struct NodeRegistry {
    sessions: DashMap<String, Registered>,
    conn_to_node: DashMap<String, String>,
    pending: DashMap<String, PendingInvoke>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a `NodeSession` from the client's connect frame, normalising
    /// resources, and track it under `connId`.
    pub fn register(&self, conn_id: &str, frame: ConnectFrame, remote_ip: Option<String>, connected_at_ms: i64, sink: Arc<dyn NodeSink>) -> NodeSession {
        let node_id = frame.node_id.clone();
        let session = NodeSession {
            node_id: node_id.clone(),
            conn_id: conn_id.to_string(),
            display_name: frame.display_name,
            platform: frame.platform,
            version: frame.version,
            caps: frame.caps,
            commands: frame.commands,
            permissions: frame.permissions,
            path_env: frame.path_env,
            resources: frame.resources.normalized(),
            connected_at_ms,
            remote_ip,
        };
        self.conn_to_node.insert(conn_id.to_string(), node_id.clone());
        self.sessions.insert(node_id, Registered { session: session.clone(), sink });
        session
    }

    /// Removes both indices; fails every pending invoke bound to that node
    /// with a disconnect error.
    pub fn unregister(&self, conn_id: &str) {
        let Some((_, node_id)) = self.conn_to_node.remove(conn_id) else {
            return;
        };
        self.sessions.remove(&node_id);
        let stale: Vec<String> = self
            .pending
            .iter()
            .filter(|e| e.value().node_id == node_id)
            .map(|e| e.key().clone())
            .collect();
        for request_id in stale {
            if let Some((_, pending)) = self.pending.remove(&request_id) {
                let _ = pending.tx.send(InvokeOutcome {
                    ok: false,
                    payload: None,
                    error: Some(format!("node {} disconnected", node_id)),
                });
            }
        }
    }

    pub fn get(&self, node_id: &str) -> Option<NodeSession> {
        self.sessions.get(node_id).map(|e| e.session.clone())
    }

    pub fn list(&self) -> Vec<NodeSession> {
        self.sessions.iter().map(|e| e.session.clone()).collect()
    }

    /// Nodes advertising `system.run` that satisfy the given resource
    /// request and aren't passed in `excluding` (already running a job).
    pub fn eligible(&self, req: &planctl_core::dag::ResourceRequest, excluding: &[String]) -> Vec<NodeSession> {
        self.sessions
            .iter()
            .map(|e| e.session.clone())
            .filter(|s| s.advertises("system.run"))
            .filter(|s| s.resources.satisfies(req))
            .filter(|s| !excluding.contains(&s.node_id))
            .collect()
    }

    /// Emits an `InvokeEvent` to the node's socket and awaits either
    /// `handle_invoke_result` or a timeout.
    pub async fn invoke(
        &self,
        node_id: &str,
        command: &str,
        params: serde_json::Value,
        timeout_ms: Option<u64>,
        idempotency_key: Option<String>,
    ) -> Result<InvokeOutcome, RegistryError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let sink = {
            let Some(entry) = self.sessions.get(node_id) else {
                return Err(RegistryError::NotConnected(node_id.to_string()));
            };
            entry.sink.clone()
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            request_id.clone(),
            PendingInvoke { node_id: node_id.to_string(), tx },
        );

        let event = InvokeEvent {
            request_id: request_id.clone(),
            command: command.to_string(),
            params,
            idempotency_key,
        };
        if sink.send(event).is_err() {
            self.pending.remove(&request_id);
            return Err(RegistryError::Unavailable);
        }

        let wait_ms = timeout_ms.unwrap_or(DEFAULT_INVOKE_TIMEOUT_MS);
        match timeout(Duration::from_millis(wait_ms), rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(RegistryError::Disconnected(node_id.to_string())),
            Err(_) => {
                self.pending.remove(&request_id);
                Err(RegistryError::Timeout)
            }
        }
    }

    /// O(1) dispatch by request-id; ignores a result whose `nodeId` doesn't
    /// match the pending entry's. Returns `true` iff a pending entry was
    /// resolved.
    pub fn handle_invoke_result(&self, request_id: &str, node_id: &str, outcome: InvokeOutcome) -> bool {
        let Some((_, pending)) = self.pending.remove(request_id) else {
            return false;
        };
        if pending.node_id != node_id {
            self.pending.insert(request_id.to_string(), pending);
            return false;
        }
        pending.tx.send(outcome).is_ok()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use planctl_core::dag::ResourceRequest;
    use planctl_core::node_session::NodeResources;
    use tokio::sync::mpsc;

    fn connect_frame(node_id: &str) -> ConnectFrame {
        ConnectFrame {
            node_id: node_id.to_string(),
            display_name: None,
            platform: None,
            version: None,
            caps: vec![],
            commands: vec!["system.run".into()],
            permissions: vec![],
            path_env: None,
            resources: NodeResources {
                gpu_count: Some(1),
                gpu_type: Some("A100".into()),
                gpu_mem_gb: Some(40.0),
                cpu_cores: None,
                ram_gb: None,
            },
        }
    }

    fn sink() -> (Arc<ChannelSink>, mpsc::UnboundedReceiver<InvokeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ChannelSink { tx }), rx)
    }

    // ==== register/unregister ====

    #[test]
    fn register_normalizes_resources_and_is_retrievable() {
        let registry = NodeRegistry::new();
        let (s, _rx) = sink();
        registry.register("c1", connect_frame("n1"), Some("127.0.0.1".into()), 0, s);
        let session = registry.get("n1").unwrap();
        assert_eq!(session.conn_id, "c1");
        assert_eq!(session.resources.gpu_count, Some(1));
    }

    #[test]
    fn unregister_removes_both_indices() {
        let registry = NodeRegistry::new();
        let (s, _rx) = sink();
        registry.register("c1", connect_frame("n1"), None, 0, s);
        registry.unregister("c1");
        assert!(registry.get("n1").is_none());
    }

    #[tokio::test]
    async fn unregister_fails_pending_invokes() {
        let registry = Arc::new(NodeRegistry::new());
        let (s, _rx) = sink();
        registry.register("c1", connect_frame("n1"), None, 0, s);

        let registry2 = registry.clone();
        let invoke_task = tokio::spawn(async move {
            registry2
                .invoke("n1", "system.run", serde_json::json!({}), Some(5_000), None)
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        registry.unregister("c1");

        let result = invoke_task.await.unwrap();
        assert!(matches!(result, Err(RegistryError::Disconnected(_))));
    }

    // ==== eligible ====

    #[test]
    fn eligible_filters_by_resources_and_exclusion() {
        let registry = NodeRegistry::new();
        let (s1, _r1) = sink();
        let (s2, _r2) = sink();
        registry.register("c1", connect_frame("n1"), None, 0, s1);
        registry.register("c2", connect_frame("n2"), None, 0, s2);

        let req = ResourceRequest { gpu_count: Some(1), ..Default::default() };
        let eligible = registry.eligible(&req, &["n1".to_string()]);
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].node_id, "n2");
    }

    // ==== invoke / handle_invoke_result ====

    #[tokio::test]
    async fn invoke_resolves_on_matching_result() {
        let registry = Arc::new(NodeRegistry::new());
        let (s, mut rx) = sink();
        registry.register("c1", connect_frame("n1"), None, 0, s);

        let registry2 = registry.clone();
        let invoke_task = tokio::spawn(async move {
            registry2
                .invoke("n1", "system.run", serde_json::json!({"x": 1}), Some(5_000), None)
                .await
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.command, "system.run");
        let resolved = registry.handle_invoke_result(
            &event.request_id,
            "n1",
            InvokeOutcome { ok: true, payload: Some(serde_json::json!({"exitCode": 0})), error: None },
        );
        assert!(resolved);

        let outcome = invoke_task.await.unwrap().unwrap();
        assert!(outcome.ok);
    }

    #[tokio::test]
    async fn handle_invoke_result_with_mismatched_node_is_ignored() {
        let registry = Arc::new(NodeRegistry::new());
        let (s, mut rx) = sink();
        registry.register("c1", connect_frame("n1"), None, 0, s);

        let registry2 = registry.clone();
        tokio::spawn(async move {
            let _ = registry2
                .invoke("n1", "system.run", serde_json::json!({}), Some(200), None)
                .await;
        });
        let event = rx.recv().await.unwrap();

        let resolved = registry.handle_invoke_result(
            &event.request_id,
            "someone-else",
            InvokeOutcome { ok: true, payload: None, error: None },
        );
        assert!(!resolved);
    }

    #[tokio::test]
    async fn invoke_to_unknown_node_fails_immediately() {
        let registry = NodeRegistry::new();
        let err = registry
            .invoke("ghost", "system.run", serde_json::json!({}), None, None)
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::NotConnected("ghost".into()));
    }

    #[tokio::test]
    async fn invoke_times_out_when_no_result_arrives() {
        let registry = NodeRegistry::new();
        let (s, _rx) = sink();
        registry.register("c1", connect_frame("n1"), None, 0, s);
        let err = registry
            .invoke("n1", "system.run", serde_json::json!({}), Some(20), None)
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::Timeout);
        assert_eq!(registry.pending_count(), 0);
    }
}
