//! Coach Broker - hub server and command-line clients

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coach_broker::client::{EchoResponder, UiClient, WorkerClient};
use coach_broker::Config;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "coach-broker")]
#[command(about = "Real-time hub between coaching UI clients and the reply worker")]
struct Cli {
    /// Path to the YAML config file (defaults to ./config.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "BROKER_LOG_JSON")]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the hub server
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Send one chat as a UI client and print the reply
    Chat {
        /// Agent the chat is addressed to
        #[arg(short, long)]
        agent: String,

        /// Message text
        message: String,

        /// Hub WebSocket URL (overrides config)
        #[arg(long)]
        url: Option<String>,
    },

    /// Run a worker that echoes every chat back in chunks
    Worker {
        /// Hub WebSocket URL (overrides config)
        #[arg(long)]
        url: Option<String>,

        /// Characters per response chunk
        #[arg(long, default_value = "16")]
        chunk_size: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let mut config = Config::from_yaml_and_env(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.server_port = port;
            }
            coach_broker::start_server(config).await
        }
        Commands::Chat {
            agent,
            message,
            url,
        } => run_chat(config, url, &agent, &message).await,
        Commands::Worker { url, chunk_size } => run_worker(config, url, chunk_size).await,
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,coach_broker=debug,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn run_chat(config: Config, url: Option<String>, agent: &str, message: &str) -> Result<()> {
    let url = url.unwrap_or(config.hub_url);
    let client = UiClient::connect(url.as_str(), config.backoff, config.request_timeout);
    client
        .wait_registered()
        .await
        .with_context(|| format!("could not register with hub at {url}"))?;

    match client.chat(agent, message).await {
        Ok(reply) => {
            println!("{reply}");
            Ok(())
        }
        Err(e) if e.is_no_response() => {
            tracing::warn!(error = %e, "No reply");
            println!("no response");
            Ok(())
        }
        Err(e) => Err(e).context("chat failed"),
    }
}

async fn run_worker(config: Config, url: Option<String>, chunk_size: usize) -> Result<()> {
    let url = url.unwrap_or(config.hub_url);
    tracing::info!(url = %url, chunk_size, "Starting echo worker");

    let worker = WorkerClient::connect(url, config.backoff);
    let handle = worker.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            handle.shutdown();
        }
    });

    worker
        .run(EchoResponder { chunk_size })
        .await
        .context("worker stopped")
}
