// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trybox - Disposable Demo Container Server
//!
//! An HTTP server responsible for:
//! - Admission control (terms, bans, capacity, per-address quotas)
//! - Instance provisioning against a local LXD daemon
//! - Session expiry and instance reclaim
//! - WebSocket console proxying

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};

use trybox::config::{ConfigHandle, spawn_watcher};
use trybox::db::SessionDb;
use trybox::expiry::ExpiryScheduler;
use trybox::provision::{INSTANCE_PREFIX, Provisioner};
use trybox::runtime::{ContainerRuntime, LxcRuntime};
use trybox::server::{AppState, router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trybox=info".into()),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("TRYBOX_CONFIG").ok())
        .unwrap_or_else(|| "trybox.yml".to_string());

    let config_handle = Arc::new(ConfigHandle::load(&config_path)?);

    // Keep the watcher alive for the whole server lifetime
    let _config_watcher = match spawn_watcher(config_handle.clone()) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!(error = %e, "Configuration watching disabled");
            None
        }
    };

    let config = config_handle.snapshot();
    info!(config = %config_path, addr = %config.bind_addr(), "Starting trybox");

    // Open the session store
    let db = SessionDb::connect(&config.db_path, config.db_retry_budget).await?;
    info!(path = %config.db_path, "Session store ready");

    // Container backend
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(LxcRuntime::new());
    info!(runtime_type = runtime.runtime_type(), "Runtime initialized");

    // Restore expiry timers and clean up anything a crash left behind
    let scheduler = ExpiryScheduler::new(db.clone(), runtime.clone());
    scheduler.replay().await?;
    if let Err(e) = scheduler.reconcile_orphans(INSTANCE_PREFIX).await {
        warn!(error = %e, "Orphan sweep failed");
    }

    let provisioner = Arc::new(Provisioner::new(
        db.clone(),
        runtime.clone(),
        scheduler.clone(),
    ));

    let state = AppState {
        db,
        runtime,
        config: config_handle,
        scheduler,
        provisioner,
    };

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    info!(addr = %config.bind_addr(), "Server ready");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutting down");
    })
    .await?;

    Ok(())
}
