use anyhow::{Context, Result};
use clap::Parser;
use collab_hub::api::{self, AppState, Backends, SessionLimits};
use collab_hub::config::{Cli, Command, ServeConfig};
use collab_hub_core::auth::Hs256Verifier;
use collab_hub_core::model::User;
use collab_hub_core::storage::{CacheStore, FileContentStore, MemoryCache, RedisCache, SqliteStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(cfg) => serve(cfg).await,
        Command::Token {
            user_id,
            username,
            jwt_secret,
            ttl,
        } => {
            let verifier = Hs256Verifier::new(jwt_secret);
            let token = verifier
                .issue(&User { id: user_id, username }, ttl)
                .context("failed to sign token")?;
            println!("{token}");
            Ok(())
        }
    }
}

async fn serve(cfg: ServeConfig) -> Result<()> {
    let cache: Arc<dyn CacheStore> = match &cfg.redis_url {
        Some(url) => Arc::new(
            RedisCache::connect(url)
                .await
                .with_context(|| format!("failed to connect to redis at {url}"))?,
        ),
        None => {
            warn!("no redis url configured; presence and chat are kept in process memory");
            Arc::new(MemoryCache::new())
        }
    };
    let content = FileContentStore::new(cfg.data_dir.clone())
        .await
        .with_context(|| format!("failed to open data dir {}", cfg.data_dir.display()))?;

    let db_path = cfg.database_path();
    let store = Arc::new(
        SqliteStore::open(&db_path)
            .with_context(|| format!("failed to open database {}", db_path.display()))?,
    );
    info!("access data in {}", db_path.display());

    let backends = Backends {
        access: store.clone(),
        content: Arc::new(content),
        cache,
        users: store,
    };
    let verifier = Arc::new(Hs256Verifier::new(cfg.jwt_secret.clone()));
    let limits = SessionLimits {
        room_capacity: cfg.broadcast_capacity,
        cache_timeout: cfg.cache_timeout(),
    };
    let state = AppState::new(backends, verifier, limits);
    let app = api::router(state.clone());

    let listener = TcpListener::bind(cfg.addr).await?;
    info!("Listening on {}", listener.local_addr()?);
    let stop = state.stop.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            stop.cancel();
        })
        .await?;

    let grace = Duration::from_secs(cfg.shutdown_grace_secs);
    if !state.shutdown(grace).await {
        warn!("sockets still open after {grace:?}; exiting anyway");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
