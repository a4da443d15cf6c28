use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use relaylb::wordcount::{rpc, WordCountService};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Word-count backend server
#[derive(Debug, Parser)]
#[command(name = "wordcount-server")]
struct Args {
    /// Port to listen on
    #[arg(long, env = "RPYC_PORT", default_value_t = 18861)]
    port: u16,

    /// Directory holding the documents
    #[arg(long, env = "DOCS_DIR", default_value = "/data")]
    docs_dir: String,

    /// Lifetime of cached counts, in seconds
    #[arg(long, env = "CACHE_TTL_SECONDS", default_value_t = 86_400)]
    cache_ttl_seconds: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = Args::parse();

    let service = Arc::new(WordCountService::new(
        &args.docs_dir,
        Duration::from_secs(args.cache_ttl_seconds),
    ));

    let listener = TcpListener::bind(("0.0.0.0", args.port))
        .await
        .with_context(|| format!("failed to bind port {}", args.port))?;

    tracing::info!(docs_dir = %args.docs_dir, ttl_secs = args.cache_ttl_seconds, "Starting");

    tokio::select! {
        res = rpc::serve(listener, service) => res?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutdown signal received"),
    }

    Ok(())
}
