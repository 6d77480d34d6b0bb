//! Router configuration for the detection engine API

use axum::{
    routing::{delete, get, post, put},
    Router,
};

use crate::handlers;
use crate::AppState;

/// Create the main router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & metrics
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .route("/fraud/stats", get(handlers::stats))
        // Event ingestion
        .route("/fraud/events", post(handlers::submit_event))
        .route("/fraud/events/batch", post(handlers::submit_event_batch))
        // Active calls
        .route("/fraud/calls/active", get(handlers::active_calls))
        .route("/fraud/calls/stats", get(handlers::call_stats))
        // Enforcement
        .route("/fraud/disconnect", post(handlers::disconnect))
        // Alert workflow
        .route("/fraud/alerts", get(handlers::list_alerts))
        .route("/fraud/alerts/export", get(handlers::export_alerts))
        .route("/fraud/alerts/stats", get(handlers::alert_stats))
        .route("/fraud/alerts/webhook", post(handlers::alert_webhook))
        .route("/fraud/alerts/:id", get(handlers::get_alert))
        .route("/fraud/alerts/:id/audit", get(handlers::get_alert_audit))
        .route("/fraud/alerts/:id/acknowledge", post(handlers::acknowledge_alert))
        .route("/fraud/alerts/:id/investigate", post(handlers::investigate_alert))
        .route("/fraud/alerts/:id/resolve", post(handlers::resolve_alert))
        .route("/fraud/alerts/:id/report_ncc", post(handlers::report_alert_ncc))
        // Blacklist
        .route("/fraud/blacklist", get(handlers::list_blacklist))
        .route("/fraud/blacklist", post(handlers::add_blacklist_entry))
        .route("/fraud/blacklist/:id", delete(handlers::remove_blacklist_entry))
        .route("/fraud/blacklist/check/:value", get(handlers::check_blacklist))
        // Gateways & runtime configuration
        .route("/fraud/gateways", get(handlers::list_gateways))
        .route("/fraud/config", get(handlers::get_detection_config))
        .route("/fraud/config", put(handlers::update_detection_config))
        .with_state(state)
}
