// Process wiring: build every collaborator from `DaemonConfig`, serve the HTTP
// surface, and tear down in order on shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::api::{self, auth::JwtAccessTokenService};
use crate::config::DaemonConfig;
use crate::engine::{EngineConfig, ReconciliationEngine};
use crate::events::EventBus;
use crate::gateway::{ConfiguredConnector, GatewayConfig, LocalConnector, WatcherGateway, WsConnector};
use crate::remote::{ConfiguredRemote, HttpRemoteStore, SqliteRemoteStore};
use crate::service::{DaemonBackend, SyncService};
use crate::store::{ConflictStore, FileRecordStore, MetaDb};
use crate::workspace::LocalWorkspace;

pub fn build_service(config: &DaemonConfig) -> Result<Arc<SyncService<DaemonBackend>>> {
    std::fs::create_dir_all(&config.projects_root).with_context(|| {
        format!("failed to create projects root `{}`", config.projects_root.display())
    })?;

    let db = Arc::new(MetaDb::open(config.meta_db_path())?);
    let remote = match &config.remote_url {
        Some(url) => ConfiguredRemote::Http(HttpRemoteStore::new(
            url,
            config.remote_token.clone(),
            config.transfer_timeout,
        )?),
        None => ConfiguredRemote::Sqlite(SqliteRemoteStore::open(config.remote_db_path())?),
    };
    let connector = match &config.watcher_url {
        Some(url) => ConfiguredConnector::Ws(WsConnector::new(url)?),
        None => ConfiguredConnector::Local(LocalConnector),
    };

    let bus = EventBus::new();
    let engine = Arc::new(ReconciliationEngine::new(
        Arc::new(LocalWorkspace::new(&config.projects_root)),
        Arc::new(remote),
        Arc::new(FileRecordStore::new(Arc::clone(&db))),
        Arc::new(ConflictStore::new(db)),
        bus.clone(),
        EngineConfig { transfer_timeout: config.transfer_timeout, ..EngineConfig::default() },
    ));
    let gateway = WatcherGateway::new(
        connector,
        GatewayConfig { handshake_timeout: config.handshake_timeout, ..GatewayConfig::default() },
        bus.clone(),
    );

    Ok(Arc::new(SyncService::new(engine, gateway, bus, config.default_interval)))
}

pub async fn run(config: DaemonConfig) -> Result<()> {
    if config.is_dev_jwt_secret() {
        warn!("using the development JWT secret; set TRISYNC_JWT_SECRET outside local development");
    }

    let jwt_service = Arc::new(JwtAccessTokenService::new(&config.jwt_secret)?);
    let service = build_service(&config)?;
    let app = api::build_router(Arc::clone(&service), jwt_service, config.cors_origins.as_deref());

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(
        listen_addr = %config.listen_addr,
        data_dir = %config.data_dir.display(),
        remote = if config.remote_url.is_some() { "http" } else { "sqlite" },
        watcher = if config.watcher_url.is_some() { "ws" } else { "local" },
        "trisync daemon listening"
    );

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("trisync daemon server failed");

    service.shutdown().await;
    info!("trisync daemon stopped");
    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(?error, "failed to install ctrl-c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => warn!(?error, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
