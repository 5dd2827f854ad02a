//! Gateway HTTP/WS server: binds the node registry, GPU scheduler, and
//! pipeline orchestrator behind a `/ws` upgrade route and a `/health`
//! probe. Grounded on `agenticlaw-gateway::server::start_gateway`'s router
//! shape, trimmed to this domain's two routes — no chat console, no `.ctx`
//! serving, no swarm bee-protocol endpoints.

use crate::config::{GatewayConfig, GatewayState};
use crate::ws::handle_connection;
use axum::{
    extract::{ConnectInfo, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

pub async fn start_gateway(config: GatewayConfig) -> anyhow::Result<()> {
    let state = GatewayState::new(&config);

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
        .with_state(state.clone());

    let bind_addr: SocketAddr = format!("{}:{}", config.bind.to_addr(), config.port)
        .parse()
        .expect("invalid bind address");

    info!("planctl gateway v{} starting", env!("CARGO_PKG_VERSION"));
    info!("  listening on: {}", bind_addr);
    info!("  websocket:    ws://{}/ws", bind_addr);
    info!("  auth mode:    {:?}", state.auth.mode);
    info!("  workspace:    {:?}", config.workspace);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state, Some(addr.ip().to_string())))
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "nodes": state.registry.list().len(),
        "pendingInvokes": state.registry.pending_count(),
        "uptimeSecs": state.started_at.elapsed().as_secs(),
    }))
}
