//! origin-rewrite-edge - serve the workers deployed on the local platform

use anyhow::Result;
use cf_origin_rewrite::{logging, EdgeHost, HostConfig, WorkerRegistry};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Serve deployed origin rewrite workers
#[derive(Parser, Debug)]
#[command(name = "origin-rewrite-edge")]
#[command(author = "cf-origin-rewrite Contributors")]
#[command(version)]
#[command(about = "Serve the origin rewrite workers deployed on the local platform")]
struct Args {
    /// HTTP port to listen on
    #[arg(long, env = "HTTP_PORT", default_value = "8787")]
    port: u16,

    /// Local worker platform database
    #[arg(long, env = "PLATFORM_DB_PATH", default_value = "./data/platform.db")]
    platform_path: PathBuf,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level, false);

    let registry = Arc::new(WorkerRegistry::open(&args.platform_path)?);
    let workers = registry.list()?;
    info!(
        "Platform at {} has {} worker(s)",
        args.platform_path.display(),
        workers.len()
    );
    for worker in &workers {
        info!(
            "  {} -> {}",
            worker.spec.from_route().unwrap_or("?"),
            worker.spec.to_route().unwrap_or("?")
        );
    }

    let host = Arc::new(EdgeHost::new(HostConfig { port: args.port }, registry));
    host.run_until(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}
