//! ACM Detection Engine service entrypoint
//!
//! Boots the HTTP surface, the buffer flusher, the detection pipeline, and
//! the background sweepers (registry reaper, blacklist reloader and daily
//! expiry sweep, gateway reloader, escalation processor). Shutdown flushes
//! pending buffers and stops everything within the grace period.

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use acm_detection_engine::escalation::EscalationProcessor;
use acm_detection_engine::mnp::PrefixOnlyProvider;
use acm_detection_engine::pipeline::Pipeline;
use acm_detection_engine::store::{MemoryStore, PgStore};
use acm_detection_engine::{build_state, config::Config, routes, AppState, Backends};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    acm_core::telemetry::init_tracing("acm-detection-engine", &config.log_level, config.json_logs)
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    info!("Starting ACM detection engine");

    let backends = if config.database_url.is_empty() {
        warn!("DATABASE_URL not set; using the in-memory store");
        let store = Arc::new(MemoryStore::new());
        Backends {
            alert_store: store.clone(),
            blacklist_store: store.clone(),
            gateway_store: store,
            mnp_provider: Arc::new(PrefixOnlyProvider),
        }
    } else {
        let store = Arc::new(PgStore::connect(&config.database_url).await?);
        Backends {
            alert_store: store.clone(),
            blacklist_store: store.clone(),
            gateway_store: store,
            mnp_provider: Arc::new(PrefixOnlyProvider),
        }
    };

    let bind_addr = config.bind_address()?;
    let grace = Duration::from_secs(config.shutdown_grace_seconds);
    let (state, receivers) = build_state(config, backends);

    // Warm the read-mostly caches before traffic arrives
    if let Err(e) = state.blacklist.reload().await {
        warn!(error = %e, "Initial blacklist load failed; starting empty");
    }
    if let Err(e) = state.gateways.reload().await {
        warn!(error = %e, "Initial gateway load failed; starting empty");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = Vec::new();

    workers.push(tokio::spawn(
        state.buffer.clone().run_flusher(shutdown_rx.clone()),
    ));

    let pipeline = Pipeline {
        detector: state.detector.clone(),
        alerts: state.alerts.clone(),
        dispatcher: state.dispatcher.clone(),
        registry: state.registry.clone(),
        webhooks: state.webhooks.clone(),
    };
    workers.push(tokio::spawn(pipeline.run(receivers, shutdown_rx.clone())));

    workers.push(tokio::spawn(
        EscalationProcessor {
            alerts: state.alerts.clone(),
            dispatcher: state.dispatcher.clone(),
            detector: state.detector.clone(),
            interval: Duration::from_secs(state.config.escalation_interval_secs),
        }
        .run(shutdown_rx.clone()),
    ));

    workers.push(tokio::spawn(run_registry_reaper(
        state.clone(),
        shutdown_rx.clone(),
    )));
    workers.push(tokio::spawn(run_blacklist_reloader(
        state.clone(),
        shutdown_rx.clone(),
    )));
    workers.push(tokio::spawn(run_gateway_reloader(
        state.clone(),
        shutdown_rx.clone(),
    )));

    let app = routes::create_router(state);
    let listener = TcpListener::bind(&bind_addr).await?;
    info!("ACM detection engine listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown())
        .await?;

    info!("Shutdown signal received, stopping workers");
    let _ = shutdown_tx.send(true);
    let drain = async {
        for worker in workers {
            let _ = worker.await;
        }
    };
    if tokio::time::timeout(grace, drain).await.is_err() {
        warn!("Workers did not stop within the grace period");
    }
    info!("ACM detection engine stopped");

    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Sweep the active-call registry for entries past the hard TTL
async fn run_registry_reaper(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = ticker.tick() => { state.registry.reap(); }
            _ = shutdown.changed() => return,
        }
    }
}

/// Periodic blacklist refresh plus a daily sweep of expired rows
async fn run_blacklist_reloader(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let mut reload = tokio::time::interval(Duration::from_secs(
        state.config.blacklist_reload_seconds.max(1),
    ));
    let mut sweep = tokio::time::interval(Duration::from_secs(86_400));
    loop {
        tokio::select! {
            _ = reload.tick() => {
                if let Err(e) = state.blacklist.reload().await {
                    warn!(error = %e, "Blacklist reload failed");
                }
            }
            _ = sweep.tick() => {
                if let Err(e) = state.blacklist.sweep_expired().await {
                    warn!(error = %e, "Blacklist expiry sweep failed");
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

async fn run_gateway_reloader(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(
        state.config.gateway_reload_seconds.max(1),
    ));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = state.gateways.reload().await {
                    warn!(error = %e, "Gateway reload failed");
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}
