//! Minimal one-shot RPC client for the `gpu jobs` CLI commands: opens a
//! websocket to a running gateway, authenticates if a token is given, sends
//! one `RpcRequest`, and returns its result — no connection reuse, no
//! reconnect, the CLI process exits right after.

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;

pub async fn call(url: &str, token: Option<&str>, method: &str, params: Value) -> anyhow::Result<Value> {
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await?;

    if let Some(token) = token {
        let id = uuid::Uuid::new_v4().to_string();
        let req = serde_json::json!({"id": id, "method": "auth", "params": {"token": token}});
        ws.send(Message::Text(req.to_string())).await?;
        let resp = recv_matching(&mut ws, &id).await?;
        if let Some(error) = resp.get("error") {
            anyhow::bail!("auth rejected: {}", error["message"].as_str().unwrap_or("unknown"));
        }
    }

    let id = uuid::Uuid::new_v4().to_string();
    let req = serde_json::json!({"id": id, "method": method, "params": params});
    ws.send(Message::Text(req.to_string())).await?;
    let resp = recv_matching(&mut ws, &id).await?;

    if let Some(error) = resp.get("error") {
        anyhow::bail!(
            "{}: {}",
            error["code"].as_str().unwrap_or("ERROR"),
            error["message"].as_str().unwrap_or("")
        );
    }
    Ok(resp["result"].clone())
}

async fn recv_matching(
    ws: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    id: &str,
) -> anyhow::Result<Value> {
    loop {
        let msg = ws
            .next()
            .await
            .ok_or_else(|| anyhow::anyhow!("gateway connection closed before responding"))??;
        if let Message::Text(text) = msg {
            let v: Value = serde_json::from_str(&text)?;
            if v["id"].as_str() == Some(id) {
                return Ok(v);
            }
        }
    }
}
