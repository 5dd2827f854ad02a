//! Scenario-test harness for the experiment control plane — adapted from
//! the teacher's `operator` binary, generalized from container-image
//! build/push/policy-probe verbs to pipeline/scheduler scenario checks
//! since this domain has no agent container images to build.

mod scenarios;

use clap::{Parser, Subcommand};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "operator", about = "planctl scenario-test harness")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one named scenario, or every scenario if none is given.
    Scenario {
        name: Option<String>,
    },
    /// List available scenario names.
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "operator=info".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::List => {
            for name in scenarios::names() {
                println!("{}", name);
            }
        }
        Commands::Scenario { name: Some(name) } => {
            let Some(result) = scenarios::run_named(&name).await else {
                anyhow::bail!("no such scenario: {}", name);
            };
            if result.passed {
                info!("{}", result);
            } else {
                error!("{}", result);
            }
            if !result.passed {
                std::process::exit(1);
            }
        }
        Commands::Scenario { name: None } => {
            let results = scenarios::run_all().await;
            let passed = results.iter().filter(|r| r.passed).count();
            let failed = results.len() - passed;
            for r in &results {
                if r.passed {
                    info!("{}", r);
                } else {
                    error!("{}", r);
                }
            }
            info!("{}/{} scenarios passed", passed, results.len());
            if failed > 0 {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
