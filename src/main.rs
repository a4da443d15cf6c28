use relaylb::config::Config;
use relaylb::proxy::{BackendRegistry, ProxyContext, SessionOptions};
use relaylb::server::Listener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };

    let registry = BackendRegistry::new(cfg.backends.clone())?;
    for (index, backend) in registry.iter().enumerate() {
        tracing::info!(index, backend = %backend, "Backend registered");
    }

    let options = SessionOptions {
        connect_timeout: cfg.connect_timeout,
        idle_timeout: cfg.idle_timeout,
    };

    let listener = Listener::bind(&cfg.listen_addr(), ProxyContext::new(registry, options)).await?;

    listener
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown signal received");
        })
        .await?;

    Ok(())
}
