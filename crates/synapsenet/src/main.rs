use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use synapsenet::config::RepairConfig;
use synapsenet::llm::HttpLlmClient;
use synapsenet::orchestrator::Orchestrator;
use synapsenet::prompts;
use synapsenet::server;
use synapsenet::workspace::Workspace;

#[derive(Parser)]
#[command(name = "synapsenet")]
#[command(about = "Controlled Iterative Repair engine")]
struct Args {
    /// Address to bind the control plane to (overrides SYNAPSENET_BIND)
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on (overrides SYNAPSENET_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Workspace directory (overrides SYNAPSENET_WORKSPACE)
    #[arg(long)]
    workspace: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = RepairConfig::from_env();
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(workspace) = args.workspace {
        config.workspace = workspace;
    }

    info!(
        workspace = %config.workspace.display(),
        interpreter = %config.interpreter,
        llm_url = %config.llm.base_url,
        llm_model = %config.llm.model,
        prompt_version = prompts::PROMPT_VERSION,
        "SynapseNet starting"
    );

    let workspace =
        Arc::new(Workspace::new(&config.workspace).context("Failed to initialize workspace")?);
    let llm = Arc::new(HttpLlmClient::new(&config.llm).context("Failed to build LLM client")?);
    let orchestrator = Arc::new(Orchestrator::new(llm, workspace, &config));

    let app = server::router(orchestrator);
    let addr: SocketAddr = format!("{}:{}", config.bind, config.port)
        .parse()
        .context("Invalid bind address")?;

    info!(addr = %addr, "Control plane listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind control plane")?;
    axum::serve(listener, app).await.context("Server failed")?;
    Ok(())
}
