//! Sync monitor entry point.
//!
//! Hydrates a set of members, keeps them in sync over the push channel and
//! logs every change until shut down.

use anyhow::{Context, Result};
use common::events::{BALANCE_CHANGED, STATUS_CHANGED};
use common::Member;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::env;
use std::sync::Arc;
use sync_client::{
    ConnectOutcome, MemoryTokenStore, RestClient, SessionNotice, SyncConfig, SyncEngine,
    TokenStore,
};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting sync monitor");

    // Read configuration from environment
    let config = SyncConfig::from_env()?;
    let metrics_port: u16 = env::var("METRICS_PORT")
        .unwrap_or_else(|_| "9094".to_string())
        .parse()
        .context("METRICS_PORT must be a number")?;
    let member_ids: Vec<String> = env::var("SYNC_MEMBER_IDS")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect();
    let token = env::var("SYNC_TOKEN").ok().filter(|t| !t.is_empty());

    info!("Configuration:");
    info!("  SYNC_WS_URL: {}", config.transport.url);
    info!("  SYNC_REST_URL: {}", config.rest.base_url);
    info!("  SYNC_GAP_THRESHOLD: {}", config.tracker.gap_threshold);
    info!("  SYNC_MAX_MISSED: {}", config.tracker.max_missed);
    info!("  SYNC_MEMBER_IDS: {:?}", member_ids);
    info!("  METRICS_PORT: {}", metrics_port);

    // Start Prometheus metrics server
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], metrics_port))
        .install()
        .context("Failed to start Prometheus exporter")?;
    info!("Prometheus metrics server started on port {}", metrics_port);

    let tokens: Arc<dyn TokenStore> = Arc::new(MemoryTokenStore::new(token));
    let rest = RestClient::new(&config.rest, tokens.clone())?;
    let engine = Arc::new(SyncEngine::start(config, tokens, Arc::new(rest))?);

    // Log session notices
    let mut notices = engine.notices();
    let notice_handle = tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(SessionNotice::SignOutRequired) => {
                    warn!("Credential expired, sign-in required");
                }
                Ok(SessionNotice::Closed) => {
                    info!("Channel closed");
                }
                Ok(notice) => info!("Session notice: {:?}", notice),
                Err(RecvError::Lagged(skipped)) => warn!("Missed {} session notices", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Log accepted changes for hydrated members
    for event_type in [BALANCE_CHANGED, STATUS_CHANGED] {
        let watched = engine.clone();
        engine.on(event_type, move |event| {
            let Some(member_id) = event.data.get("member_id").and_then(|v| v.as_str()) else {
                return;
            };
            match watched.member(member_id) {
                Ok(Some(Member {
                    username,
                    balance,
                    status,
                    ..
                })) => info!(
                    sequence = event.sequence,
                    "{} {}: balance={} status={:?}", event.event_type, username, balance, status
                ),
                Ok(None) => {}
                Err(e) => warn!("Failed to read member {}: {}", member_id, e),
            }
        });
    }

    // Hydrate baseline state
    for id in &member_ids {
        match engine.hydrate_member(id).await {
            Ok(member) => info!("Hydrated member {} ({})", member.id, member.username),
            Err(e) => warn!("Failed to hydrate member {}: {}", id, e),
        }
    }

    match engine.connect().await {
        Ok(ConnectOutcome::Connected(handle)) => {
            info!("Connected, session {}", handle.session);
        }
        Ok(ConnectOutcome::Skipped) => {
            warn!("SYNC_TOKEN not set, push channel disabled");
        }
        Err(e) => {
            error!("Connection failed: {}", e);
        }
    }

    shutdown_signal().await;

    info!("Shutting down...");
    engine.cleanup().await;
    notice_handle.abort();

    info!("Sync monitor stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
