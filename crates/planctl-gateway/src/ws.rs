//! WebSocket connection handling (spec §6). A single `/ws` endpoint serves
//! both worker nodes, which open by sending a connect frame, and control
//! callers (CLI, pipeline orchestrator over the wire), which send RPC
//! requests directly — the two are told apart structurally by
//! `IncomingMessage`'s untagged dispatch, the same shape as
//! `agenticlaw-gateway::ws::handle_connection`'s `tokio::select!` loop,
//! generalized from chat-session frames to node/invoke frames.

use crate::auth::AuthMode;
use crate::config::GatewayState;
use crate::rpc;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use planctl_core::protocol::{IncomingMessage, InvokeEvent, RpcResponse};
use planctl_registry::{ChannelSink, InvokeOutcome, NodeSink};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub async fn handle_connection(socket: WebSocket, state: Arc<GatewayState>, remote_ip: Option<String>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let conn_id = uuid::Uuid::new_v4().to_string();
    let mut authenticated = state.auth.mode == AuthMode::None;
    let mut node_id: Option<String> = None;

    let (invoke_tx, mut invoke_rx) = mpsc::unbounded_channel::<InvokeEvent>();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Some(response) = handle_text_message(
                            &text,
                            &state,
                            &conn_id,
                            remote_ip.clone(),
                            &mut authenticated,
                            &mut node_id,
                            invoke_tx.clone(),
                        ).await {
                            if ws_tx.send(WsMessage::Text(response)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        info!("connection {} closed", conn_id);
                        break;
                    }
                    Some(Ok(_)) => {} // binary, ping, pong — ignore
                    Some(Err(e)) => {
                        warn!("websocket error on {}: {}", conn_id, e);
                        break;
                    }
                    None => break,
                }
            }
            event = invoke_rx.recv() => {
                match event {
                    Some(event) => {
                        if let Ok(json) = serde_json::to_string(&event) {
                            if ws_tx.send(WsMessage::Text(json)).await.is_err() {
                                break;
                            }
                        }
                    }
                    None => break,
                }
            }
        }
    }

    if node_id.is_some() {
        state.registry.unregister(&conn_id);
        info!("node {} disconnected", node_id.unwrap());
    }
}

/// Handle one text frame. Returns the JSON reply to send back, if any —
/// `InvokeResult` frames get no reply, `Connect` and `Rpc` frames do.
async fn handle_text_message(
    text: &str,
    state: &Arc<GatewayState>,
    conn_id: &str,
    remote_ip: Option<String>,
    authenticated: &mut bool,
    node_id: &mut Option<String>,
    invoke_tx: mpsc::UnboundedSender<InvokeEvent>,
) -> Option<String> {
    let parsed: IncomingMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("unparseable message on {}: {}", conn_id, e);
            return None;
        }
    };

    match parsed {
        IncomingMessage::Connect(frame) => {
            let sink: Arc<dyn NodeSink> = Arc::new(ChannelSink { tx: invoke_tx });
            let connected_at_ms = chrono::Utc::now().timestamp_millis();
            let session = state.registry.register(conn_id, frame, remote_ip, connected_at_ms, sink);
            *node_id = Some(session.node_id.clone());
            info!("node {} connected ({})", session.node_id, conn_id);
            serde_json::to_string(&serde_json::json!({"ok": true, "nodeId": session.node_id})).ok()
        }

        IncomingMessage::InvokeResult(result) => {
            let outcome = InvokeOutcome { ok: result.ok, payload: result.payload, error: result.error };
            state.registry.handle_invoke_result(&result.id, &result.node_id, outcome);
            None
        }

        IncomingMessage::Rpc(req) => {
            if req.method == "auth" {
                let provided = req.params["token"].as_str();
                return match state.auth.verify(provided) {
                    Ok(()) => {
                        *authenticated = true;
                        serde_json::to_string(&RpcResponse::ok(&req.id, serde_json::json!({"ok": true}))).ok()
                    }
                    Err(e) => serde_json::to_string(&RpcResponse::err(&req.id, planctl_core::protocol::RpcError::policy_denied(e))).ok(),
                };
            }

            if !*authenticated {
                let resp = RpcResponse::err(&req.id, planctl_core::protocol::RpcError::policy_denied("not authenticated"));
                return serde_json::to_string(&resp).ok();
            }

            let result = rpc::route_rpc(&req.method, req.params, state).await;
            let resp = match result {
                Ok(value) => RpcResponse::ok(&req.id, value),
                Err(error) => RpcResponse::err(&req.id, error),
            };
            serde_json::to_string(&resp).ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ResolvedAuth;
    use crate::config::{GatewayConfig, GatewayState};

    fn state() -> Arc<GatewayState> {
        GatewayState::new(&GatewayConfig { auth: ResolvedAuth::none(), ..Default::default() })
    }

    #[tokio::test]
    async fn connect_frame_registers_node() {
        let state = state();
        let mut authenticated = true;
        let mut node_id = None;
        let (tx, _rx) = mpsc::unbounded_channel();
        let text = serde_json::json!({"nodeId": "n1", "commands": ["system.run"], "resources": {}}).to_string();
        let reply = handle_text_message(&text, &state, "c1", None, &mut authenticated, &mut node_id, tx).await;
        assert!(reply.is_some());
        assert_eq!(node_id.as_deref(), Some("n1"));
        assert!(state.registry.get("n1").is_some());
    }

    #[tokio::test]
    async fn rpc_before_auth_is_rejected_when_token_required() {
        let state = GatewayState::new(&GatewayConfig { auth: ResolvedAuth::token("secret"), ..Default::default() });
        let mut authenticated = false;
        let mut node_id = None;
        let (tx, _rx) = mpsc::unbounded_channel();
        let text = serde_json::json!({"id": "r1", "method": "node.list", "params": {}}).to_string();
        let reply = handle_text_message(&text, &state, "c1", None, &mut authenticated, &mut node_id, tx).await.unwrap();
        assert!(reply.contains("POLICY_DENIED"));
    }

    #[tokio::test]
    async fn auth_with_correct_token_unlocks_rpc() {
        let state = GatewayState::new(&GatewayConfig { auth: ResolvedAuth::token("secret"), ..Default::default() });
        let mut authenticated = false;
        let mut node_id = None;
        let (tx, _rx) = mpsc::unbounded_channel();
        let auth_text = serde_json::json!({"id": "r0", "method": "auth", "params": {"token": "secret"}}).to_string();
        handle_text_message(&auth_text, &state, "c1", None, &mut authenticated, &mut node_id, tx.clone()).await;
        assert!(authenticated);

        let text = serde_json::json!({"id": "r1", "method": "node.list", "params": {}}).to_string();
        let reply = handle_text_message(&text, &state, "c1", None, &mut authenticated, &mut node_id, tx).await.unwrap();
        assert!(reply.contains("\"nodes\""));
    }

    #[tokio::test]
    async fn invoke_result_frame_resolves_pending_invoke() {
        let state = state();
        let mut authenticated = true;
        let mut node_id = None;
        let (connect_tx, mut invoke_rx) = mpsc::unbounded_channel();
        let connect_text = serde_json::json!({"nodeId": "n1", "commands": ["system.run"], "resources": {}}).to_string();
        handle_text_message(&connect_text, &state, "c1", None, &mut authenticated, &mut node_id, connect_tx).await;

        let registry = state.registry.clone();
        let invoke_task = tokio::spawn(async move { registry.invoke("n1", "system.run", serde_json::json!({}), Some(5_000), None).await });

        let event = invoke_rx.recv().await.expect("invoke event pushed to node sink");
        assert_eq!(event.command, "system.run");

        let result_text = serde_json::json!({
            "id": event.request_id,
            "nodeId": "n1",
            "ok": true,
            "payload": {"exitCode": 0},
        })
        .to_string();
        let mut dummy_authenticated = true;
        let mut dummy_node_id = None;
        let (dummy_tx, _dummy_rx) = mpsc::unbounded_channel();
        let reply = handle_text_message(&result_text, &state, "c1", None, &mut dummy_authenticated, &mut dummy_node_id, dummy_tx).await;
        assert!(reply.is_none());

        let outcome = invoke_task.await.unwrap().expect("invoke resolves");
        assert!(outcome.ok);
        assert_eq!(outcome.payload, Some(serde_json::json!({"exitCode": 0})));
    }
}
