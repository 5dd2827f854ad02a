//! Gateway RPC wire protocol (spec §6): JSON-RPC-ish request/response
//! frames plus the `connect` frame a worker node sends to register itself.
//! Params are kept as `serde_json::Value` ("RawJson carrier", per spec §9's
//! design note) and validated by each method handler at the boundary,
//! rather than modelled as one giant enum of every possible params shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A request sent by a control caller (pipeline, CLI, tests) over the
/// gateway's websocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: String,
    pub message: String,
}

impl RpcError {
    pub fn not_connected(msg: impl Into<String>) -> Self {
        Self {
            code: "NOT_CONNECTED".into(),
            message: msg.into(),
        }
    }
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self {
            code: "UNAVAILABLE".into(),
            message: msg.into(),
        }
    }
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self {
            code: "TIMEOUT".into(),
            message: msg.into(),
        }
    }
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self {
            code: "INVALID_REQUEST".into(),
            message: msg.into(),
        }
    }
    pub fn policy_denied(msg: impl Into<String>) -> Self {
        Self {
            code: "POLICY_DENIED".into(),
            message: msg.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: String,
    #[serde(flatten)]
    pub outcome: RpcOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcOutcome {
    Ok { ok: OkMarker, result: Value },
    Err { error: RpcError },
}

/// Always `true` — kept as a distinct type so `#[serde(untagged)]` can tell
/// the ok/err branches apart by the presence of this field in JSON.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OkMarker(pub bool);

impl RpcResponse {
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            outcome: RpcOutcome::Ok {
                ok: OkMarker(true),
                result,
            },
        }
    }
    pub fn err(id: impl Into<String>, error: RpcError) -> Self {
        Self {
            id: id.into(),
            outcome: RpcOutcome::Err { error },
        }
    }
}

/// The frame a worker node sends first on connect, identifying itself.
/// `deny_unknown_fields` keeps this from accidentally matching an RPC
/// request or invoke-result frame in `IncomingMessage`'s untagged dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConnectFrame {
    pub node_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub caps: Vec<String>,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub path_env: Option<String>,
    #[serde(default)]
    pub resources: crate::node_session::NodeResources,
}

/// An event frame pushed by the gateway to a worker node asking it to run
/// a command (`node.invoke`'s wire form).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeEvent {
    pub request_id: String,
    pub command: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// The worker's reply to an `InvokeEvent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeResult {
    pub id: String,
    pub node_id: String,
    pub ok: bool,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// A message arriving on the gateway's single `/ws` endpoint is either a
/// control-caller RPC request, a node's connect frame, or a node's invoke
/// result — distinguished structurally.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IncomingMessage {
    Connect(ConnectFrame),
    InvokeResult(InvokeResult),
    Rpc(RpcRequest),
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==== RpcResponse ====

    #[test]
    fn ok_response_serializes_with_ok_true() {
        let resp = RpcResponse::ok("req-1", serde_json::json!({"ts": 1}));
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["id"], "req-1");
        assert_eq!(v["ok"], true);
        assert_eq!(v["result"]["ts"], 1);
    }

    #[test]
    fn err_response_serializes_with_error_object() {
        let resp = RpcResponse::err("req-2", RpcError::not_connected("node gone"));
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["id"], "req-2");
        assert_eq!(v["error"]["code"], "NOT_CONNECTED");
    }

    #[test]
    fn error_constructors_set_expected_codes() {
        assert_eq!(RpcError::timeout("x").code, "TIMEOUT");
        assert_eq!(RpcError::unavailable("x").code, "UNAVAILABLE");
        assert_eq!(RpcError::invalid_request("x").code, "INVALID_REQUEST");
        assert_eq!(RpcError::policy_denied("x").code, "POLICY_DENIED");
    }

    // ==== IncomingMessage dispatch ====

    #[test]
    fn connect_frame_parses_as_connect_variant() {
        let raw = serde_json::json!({
            "nodeId": "n1",
            "commands": ["system.run"],
            "resources": {}
        });
        let msg: IncomingMessage = serde_json::from_value(raw).unwrap();
        assert!(matches!(msg, IncomingMessage::Connect(_)));
    }

    #[test]
    fn rpc_request_parses_as_rpc_variant() {
        let raw = serde_json::json!({
            "id": "req-1",
            "method": "node.list",
            "params": {}
        });
        let msg: IncomingMessage = serde_json::from_value(raw).unwrap();
        match msg {
            IncomingMessage::Rpc(r) => assert_eq!(r.method, "node.list"),
            other => panic!("expected Rpc, got {:?}", other),
        }
    }

    #[test]
    fn invoke_result_parses_as_invoke_result_variant() {
        let raw = serde_json::json!({
            "id": "req-9",
            "nodeId": "n1",
            "ok": true,
            "payload": {"exitCode": 0}
        });
        let msg: IncomingMessage = serde_json::from_value(raw).unwrap();
        match msg {
            IncomingMessage::InvokeResult(r) => {
                assert_eq!(r.node_id, "n1");
                assert!(r.ok);
            }
            other => panic!("expected InvokeResult, got {:?}", other),
        }
    }
}
