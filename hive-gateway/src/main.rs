//! Hive gateway - HTTP tool interface and notification stream for a hive.

mod routes;
mod sse;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use axum::Router;
use axum::routing::get;
use clap::Parser;
use hive::io::config::load_config;
use hive::io::init::HivePaths;
use hive::orchestrator::{Orchestrator, Services};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "hive-gateway")]
#[command(about = "HTTP tool interface and event stream for a hive")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "3001")]
    port: u16,

    /// Project directory (contains .hive/)
    #[arg(long, default_value = ".")]
    project_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hive_gateway=info".parse()?)
                .add_directive("hive=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let project_dir = args.project_dir.canonicalize().unwrap_or(args.project_dir);
    info!(project_dir = %project_dir.display(), "starting hive-gateway");

    let paths = HivePaths::new(&project_dir);
    let config = load_config(&paths.config_path)
        .with_context(|| format!("load {}", paths.config_path.display()))?;
    let services = Services::from_config(&config, &paths);
    let orchestrator = Orchestrator::start(&config, project_dir.clone(), services)?;
    let state = AppState::new(orchestrator);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .nest("/api", routes::api_router())
        .route("/events", get(sse::events_handler))
        .layer(cors)
        .with_state(state.clone());

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    let reaped = state.orchestrator.shutdown();
    info!(reaped, "gateway stopped");
    Ok(())
}
