//! Provisioner API server - submit jobs, follow their output, cancel them.

mod error;
mod routes;
mod sse;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use provisioner::Orchestrator;
use provisioner::io::config::load_config;

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "provisioner-api")]
#[command(about = "HTTP API for running plan/apply/destroy jobs")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "3001")]
    port: u16,

    /// Orchestrator config file (TOML); defaults apply when missing
    #[arg(long, default_value = "provisioner.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    provisioner::logging::init("provisioner=info,provisioner_api=info");

    let args = Args::parse();

    let config = load_config(&args.config)?;
    info!(
        config = %args.config.display(),
        state_dir = %config.state_dir.display(),
        "starting provisioner-api"
    );
    let orchestrator = Orchestrator::new(config)?;

    let app = routes::app(AppState::new(orchestrator));

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
