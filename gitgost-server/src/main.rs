use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn, Level};

use gitgost_server::config::{Config, LogFormat};
use gitgost_server::store::{Datastore, SupabaseStore};
use gitgost_server::{git, router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;

    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_max_level(Level::INFO)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_max_level(Level::INFO)
            .init(),
    }

    info!("starting gitGost anonymizing push proxy");

    let store: Option<Arc<dyn Datastore>> =
        match (config.supabase_url.clone(), config.supabase_key.clone()) {
            (Some(url), Some(key)) => {
                let store = SupabaseStore::new(url, key)
                    .context("failed to initialize datastore client")?;
                info!("datastore configured, stats and moderation are durable");
                Some(Arc::new(store))
            }
            _ => {
                warn!("datastore not configured, stats will not be persisted");
                None
            }
        };

    if config.github_token.is_none() {
        warn!("GITHUB_TOKEN not set; pushes will fail at the fork step");
    }

    let port = config.port;
    let state = Arc::new(AppState::new(config, store)?);

    // Periodically remove scratch directories orphaned by crashed pushes.
    tokio::spawn(async {
        let mut interval = tokio::time::interval(Duration::from_secs(60 * 60));
        loop {
            interval.tick().await;
            git::sweep_stale_scratch_dirs();
        }
    });

    let app = router::build_router(state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .with_context(|| format!("failed to bind port {}", port))?;
    info!("listening on port {}", port);

    axum::serve(listener, app).await?;

    Ok(())
}
