use anyhow::Result;
use axum::Router;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{fs, io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
#[cfg(test)]
mod testutil;
#[cfg(test)]
mod tests;

use services::{
    crypto::LocalKeyring, engine::Engine, fs_drive::FsDrive, upload_store,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting media-backup with config: {:?}", cfg);

    // --- Ensure storage directories exist ---
    for dir in [&cfg.cache_dir, &cfg.permanent_dir, &cfg.remote_dir] {
        if !dir.exists() {
            fs::create_dir_all(dir)?;
            tracing::info!("Created directory at {}", dir.display());
        }
    }

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    if let Some(parent) = Path::new(db_path).parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        fs::create_dir_all(parent)?;
        tracing::info!("Created missing directory {:?}", parent);
    }

    let options = SqliteConnectOptions::from_str(db_url)?.create_if_missing(true);
    let db: Arc<sqlx::Pool<sqlx::Sqlite>> = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?,
    );

    // --- Handle migration mode ---
    let statements = upload_store::migrate(&db).await?;
    if migrate {
        tracing::info!("Database migration complete ({} statements).", statements);
        return Ok(()); // exit after migration
    }

    // --- Initialize the engine ---
    let keyring = Arc::new(LocalKeyring::load_or_create(&cfg.key_file).await?);
    let drive = Arc::new(FsDrive::new(
        db.clone(),
        cfg.remote_dir.clone(),
        cfg.max_block_size,
    ));
    let engine = Engine::new(
        db.clone(),
        drive,
        keyring,
        cfg.pipeline_settings(),
        cfg.queue_settings(),
        cfg.network,
    );
    let dispatcher = engine.start().await?;

    // --- Build router ---
    let state = handlers::AppState {
        engine: engine.clone(),
        db: db.clone(),
        cache_dir: cfg.cache_dir.clone(),
        permanent_dir: cfg.permanent_dir.clone(),
    };
    let app: Router = routes::routes::routes().with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for shutdown signal: {}", err);
            }
        })
        .await?;

    // --- Drain in-flight work ---
    tracing::info!("Shutting down, waiting for running uploads to stop");
    engine.shutdown();
    dispatcher.await?;

    Ok(())
}
