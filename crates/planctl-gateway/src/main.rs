//! planctl-gateway — standalone gateway binary for a worker-node pool.

use clap::Parser;
use planctl_gateway::auth::ResolvedAuth;
use planctl_gateway::{start_gateway, BindMode, GatewayConfig};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "planctl-gateway", about = "GPU worker-node gateway")]
struct Cli {
    #[arg(short, long, default_value_t = 8790)]
    port: u16,
    #[arg(short, long, default_value = "loopback")]
    bind: String,
    #[arg(short, long)]
    token: Option<String>,
    #[arg(long)]
    no_auth: bool,
    #[arg(short, long)]
    workspace: Option<PathBuf>,
    #[arg(long)]
    sandbox_image: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "planctl=info,tower_http=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let bind = match cli.bind.as_str() {
        "lan" | "0.0.0.0" => BindMode::Lan,
        _ => BindMode::Loopback,
    };

    let token = cli.token.or_else(|| std::env::var("PLANCTL_GATEWAY_TOKEN").ok());
    let auth = if cli.no_auth {
        ResolvedAuth::none()
    } else {
        match token {
            Some(t) => ResolvedAuth::token(t),
            None => ResolvedAuth::none(),
        }
    };

    let workspace = cli
        .workspace
        .or_else(|| std::env::var("PLANCTL_WORKSPACE").ok().map(PathBuf::from))
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());

    let config = GatewayConfig {
        port: cli.port,
        bind,
        auth,
        workspace,
        sandbox_image: cli.sandbox_image.unwrap_or_else(|| "planctl-sandbox:latest".to_string()),
    };

    start_gateway(config).await
}
