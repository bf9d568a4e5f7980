use anyhow::{Context, Result};
use axum::Router;
use media_upload::{
    config::{AppConfig, RunMode},
    db, providers, routes,
    services::UploadService,
};
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + run mode ---
    let (cfg, mode) = AppConfig::from_env_and_args()?;

    tracing::info!(
        variant = %cfg.variant,
        chunk_size = cfg.chunk_size,
        provider_url = %cfg.provider_url,
        database_url = %cfg.database_url,
        "Starting media-upload"
    );

    // --- Initialize SQLite connection ---
    tracing::debug!("Connecting using raw URL => {}", cfg.database_url);
    let db = Arc::new(db::connect(&cfg.database_url, 5).await?);

    // --- Schema (idempotent); --migrate stops here ---
    db::run_migrations(&db).await?;
    if mode == RunMode::Migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize core service ---
    let adapter = providers::build_adapter(cfg.variant, cfg.provider_settings())
        .context("building provider HTTP client")?;
    let service = UploadService::new(db.clone(), adapter, cfg.retry.clone());

    if let RunMode::Upload { path, metadata } = mode {
        return upload_once(&service, &path, metadata).await;
    }

    service.spawn_sweeper(cfg.sweep_interval);
    tracing::info!(
        interval_secs = cfg.sweep_interval.as_secs(),
        "Session expiry sweeper spawned"
    );

    // --- Build router ---
    let max_chunk_bytes = usize::try_from(cfg.chunk_size).unwrap_or(usize::MAX);
    let app: Router = routes::routes::routes(max_chunk_bytes).with_state(service);

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
    axum::serve(listener, app).await?;

    Ok(())
}

/// Drive one upload to completion; Ctrl-C cancels between chunks.
async fn upload_once(
    service: &UploadService,
    path: &std::path::Path,
    metadata: media_upload::models::ResourceMetadata,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted; cancelling after the current chunk");
            on_interrupt.cancel();
        }
    });

    let resource = service
        .upload_file(path, metadata, &cancel)
        .await
        .with_context(|| format!("uploading {}", path.display()))?;

    tracing::info!(resource_id = %resource.id, "Upload complete");
    println!("{}", resource.provider_object_ref.unwrap_or_default());
    Ok(())
}
