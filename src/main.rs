use anyhow::Context;
use chat_relay::config::RelayConfig;
use chat_relay::transport::{router, AppState};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("chat_relay=info,tower_http=info")),
        )
        .init();

    let config = RelayConfig::from_env().context("loading relay configuration")?;
    let state = AppState::from_config(&config).context("building relay state")?;
    let registry = state.registry.clone();
    let app = router(state, &config.allowed_origins).context("building routes")?;

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;

    info!("Chat relay listening on ws://{}/chatHub", config.bind_addr);
    info!("Inference backend: {}", config.backend_url);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
            registry.close();
        })
        .await
        .context("serving relay")?;

    Ok(())
}
