use std::sync::Arc;

use anyhow::Context;
use personaroom::{
    ai::HttpGenerator,
    app,
    config::Config,
    db::{Gateway, MemoryGateway, SqliteGateway},
    AppState,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("personaroom=info,tower_http=info")),
        )
        .init();

    let config = Config::from_env()?;

    let gateway: Arc<dyn Gateway> = match &config.database_url {
        Some(url) => Arc::new(
            SqliteGateway::connect(url).await
                .with_context(|| format!("opening {url}"))?
        ),
        None => {
            tracing::warn!("DATABASE_URL not set, messages are kept in memory only");
            Arc::new(MemoryGateway::new())
        }
    };
    let generator = Arc::new(HttpGenerator::new(config.generation.clone())?);
    if config.generation.api_key.is_none() {
        tracing::warn!(url = %config.generation.url, "GENERATION_API_KEY not set");
    }

    let bind_addr = config.bind_addr.clone();
    let app_state = AppState::new(config, gateway, generator);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await
        .with_context(|| format!("binding {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, "listening");
    axum::serve(listener, app(app_state)).await?;
    Ok(())
}
