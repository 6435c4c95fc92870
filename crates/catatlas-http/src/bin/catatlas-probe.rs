use std::path::PathBuf;

use catatlas_http::{ApiClient, ClientConfig, HealthStatus, ReqwestTransport};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

/// Probe a CatAtlas backend through the resilient request pipeline
#[derive(Parser)]
#[command(name = "catatlas-probe")]
#[command(about = "Drive the CatAtlas request pipeline against a backend and report circuit health")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured base URL
    #[arg(short, long, global = true)]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Issue GET requests and print each outcome
    Get {
        /// Endpoint relative to the base URL
        #[arg(default_value = "/health")]
        endpoint: String,

        /// Number of sequential requests
        #[arg(short = 'n', long, default_value_t = 1)]
        repeat: u32,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = ClientConfig::load(cli.config.as_deref())?;
    if let Some(base_url) = cli.base_url {
        config = config.with_base_url(base_url);
        config.validate()?;
    }

    match cli.command {
        Commands::Get { endpoint, repeat } => run_probe(&config, &endpoint, repeat).await?,
        Commands::Config => print!("{}", config.to_toml()?),
    }

    Ok(())
}

async fn run_probe(config: &ClientConfig, endpoint: &str, repeat: u32) -> anyhow::Result<()> {
    let client = ApiClient::<ReqwestTransport>::from_config(config)?;
    tracing::info!(
        "Probing {} via {:?}",
        endpoint,
        client.base_url().map(|url| url.as_str())
    );

    for round in 1..=repeat.max(1) {
        match client.get::<Value>(endpoint).await {
            Ok(body) => println!("[{round}] OK {body}"),
            Err(err) => {
                let err = err.into_api_error(endpoint);
                println!(
                    "[{round}] {} {}: {}",
                    err.kind(),
                    err.message(),
                    err.user_message()
                );
                if let Some(seconds) = err.retry_after_seconds() {
                    println!("[{round}] retry after {seconds}s");
                }
            }
        }
    }

    let stats = client.circuit_stats();
    let health = match stats.health() {
        HealthStatus::Healthy => "healthy",
        HealthStatus::Degraded => "degraded",
    };
    println!(
        "circuit {}: {} ({}), failures={} successes={}",
        stats.name, stats.state, health, stats.failure_count, stats.success_count
    );
    if let Some(wait) = stats.next_attempt_in {
        println!("next probe allowed in {:.1}s", wait.as_secs_f64());
    }

    Ok(())
}
