//! ACM Detection Engine
//!
//! Real-time anti-call-masking core: ingests SIP call-state events from the
//! SBC, aggregates them in per-fingerprint sliding windows, raises fraud
//! alerts through a workflow state machine, and dispatches dialog
//! terminations back to the switch.

pub mod alert;
pub mod blacklist;
pub mod buffer;
pub mod config;
pub mod detector;
pub mod dispatcher;
pub mod error;
pub mod escalation;
pub mod gateway;
pub mod handlers;
pub mod mnp;
pub mod models;
pub mod pipeline;
pub mod registry;
pub mod routes;
pub mod store;
pub mod webhook;
pub mod window;

use std::sync::Arc;
use std::time::Duration;

use crate::blacklist::BlacklistIndex;
use crate::buffer::{BufferConfig, BufferReceivers, EventBuffer};
use crate::config::Config;
use crate::detector::{DetectionSettings, Detector};
use crate::dispatcher::{DisconnectDispatcher, SbcClient};
use crate::gateway::GatewayRegistry;
use crate::mnp::{MnpProvider, MnpResolver};
use crate::registry::ActiveCallRegistry;
use crate::store::{AlertService, AlertStore, BlacklistStore, GatewayStore};
use crate::webhook::WebhookNotifier;
use crate::window::{WindowStore, WindowStoreConfig};

pub use error::{Error, Result};

/// Application state shared across handlers and background tasks
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub buffer: Arc<EventBuffer>,
    pub registry: Arc<ActiveCallRegistry>,
    pub detector: Arc<Detector>,
    pub alerts: Arc<AlertService>,
    pub blacklist: Arc<BlacklistIndex>,
    pub gateways: Arc<GatewayRegistry>,
    pub dispatcher: Arc<DisconnectDispatcher>,
    pub webhooks: Arc<WebhookNotifier>,
}

/// Storage backends the engine is built on
pub struct Backends {
    pub alert_store: Arc<dyn AlertStore>,
    pub blacklist_store: Arc<dyn BlacklistStore>,
    pub gateway_store: Arc<dyn GatewayStore>,
    pub mnp_provider: Arc<dyn MnpProvider>,
}

/// Wire every component together. The buffer receivers go to the caller so
/// it can start the pipeline worker.
pub fn build_state(config: Config, backends: Backends) -> (AppState, BufferReceivers) {
    let config = Arc::new(config);

    let (buffer, receivers) = EventBuffer::new(BufferConfig {
        capacity: config.buffer_capacity,
        high_watermark: config.flush_high_watermark,
        flush_interval: config.flush_interval(),
    });

    let registry = Arc::new(ActiveCallRegistry::new(Duration::from_secs(
        config.active_call_ttl_seconds,
    )));

    let ring_size = ((config.window_seconds * 1000).div_ceil(config.bucket_width_ms) as usize)
        .max(2)
        + 1;
    let windows = Arc::new(WindowStore::new(WindowStoreConfig {
        bucket_width_ms: config.bucket_width_ms,
        ring_size,
        distinct_cap: config.distinct_cap,
        max_fingerprints: config.max_fingerprints,
    }));

    let blacklist = Arc::new(BlacklistIndex::new(backends.blacklist_store));
    let gateways = Arc::new(GatewayRegistry::new(backends.gateway_store, &config));
    let mnp = Arc::new(MnpResolver::new(
        backends.mnp_provider,
        Duration::from_secs(config.mnp_cache_ttl_seconds),
    ));

    let detector = Arc::new(Detector::new(
        windows,
        blacklist.clone(),
        gateways.clone(),
        mnp,
        DetectionSettings::from_config(&config),
        config.dedup_capacity,
    ));

    let alerts = Arc::new(AlertService::new(backends.alert_store));
    let dispatcher = Arc::new(DisconnectDispatcher::new(
        registry.clone(),
        SbcClient::new(config.sbc_rpc_url.clone(), config.sbc_timeout()),
    ));
    let webhooks = Arc::new(WebhookNotifier::new(config.webhook_url.clone()));

    (
        AppState {
            config,
            buffer,
            registry,
            detector,
            alerts,
            blacklist,
            gateways,
            dispatcher,
            webhooks,
        },
        receivers,
    )
}
