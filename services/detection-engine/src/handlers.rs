//! HTTP handlers for the detection engine API

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::alert::{
    AlertCommand, AlertEventType, AlertStatus, AuditEntry, FraudAlert, Resolution, Severity,
};
use crate::blacklist::{BlacklistEntry, BlacklistSource, EntryType};
use crate::detector::{DetectionSettings, DetectorStats};
use crate::error::{Error, Result};
use crate::models::{
    ActiveCall, CallEventRequest, CallStats, DisconnectRequest, DisconnectResponse,
    FraudAlertWebhook, WebhookEventType,
};
use crate::store::{AlertFilter, AlertSummary};
use crate::AppState;

// ============================================
// Health & stats
// ============================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub active_call_count: usize,
    pub blacklist_entries: usize,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "acm-detection-engine".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_call_count: state.registry.len(),
        blacklist_entries: state.blacklist.entry_count(),
    })
}

#[derive(Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub store: bool,
}

pub async fn ready(State(state): State<AppState>) -> Json<ReadyResponse> {
    let store_ok = state.alerts.list(&AlertFilter { limit: 1, ..Default::default() }).await.is_ok();
    Json(ReadyResponse {
        ready: store_ok,
        store: store_ok,
    })
}

#[derive(Serialize)]
pub struct WebhookStats {
    pub enabled: bool,
    pub delivered: u64,
    pub failed: u64,
}

#[derive(Serialize)]
pub struct StatsResponse {
    pub buffer: crate::buffer::BufferStats,
    pub detector: DetectorStats,
    pub dispatcher: crate::dispatcher::DispatcherStats,
    pub webhooks: WebhookStats,
    pub active_calls: usize,
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        buffer: state.buffer.stats(),
        detector: state.detector.stats(),
        dispatcher: state.dispatcher.stats(),
        webhooks: WebhookStats {
            enabled: state.webhooks.is_enabled(),
            delivered: state.webhooks.delivered(),
            failed: state.webhooks.failed(),
        },
        active_calls: state.registry.len(),
    })
}

// ============================================
// Event ingestion
// ============================================

pub async fn submit_event(
    State(state): State<AppState>,
    Json(request): Json<CallEventRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>)> {
    let event = request.validate()?;
    let call_id = event.call_id.clone();

    state.registry.apply(&event);
    state.buffer.submit(event);

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "accepted", "call_id": call_id })),
    ))
}

pub async fn submit_event_batch(
    State(state): State<AppState>,
    Json(requests): Json<Vec<CallEventRequest>>,
) -> Result<(StatusCode, Json<serde_json::Value>)> {
    let mut events = Vec::with_capacity(requests.len());
    for (index, request) in requests.into_iter().enumerate() {
        let event = request
            .validate()
            .map_err(|e| Error::InvalidRequest(format!("event[{index}]: {e}")))?;
        events.push(event);
    }

    for event in &events {
        state.registry.apply(event);
    }
    let processed = state.buffer.submit_batch(events);

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "accepted", "processed": processed })),
    ))
}

// ============================================
// Active calls
// ============================================

#[derive(Serialize)]
pub struct ActiveCallsResponse {
    pub active_calls: Vec<ActiveCall>,
    pub count: usize,
}

pub async fn active_calls(State(state): State<AppState>) -> Json<ActiveCallsResponse> {
    let calls = state.registry.snapshot();
    Json(ActiveCallsResponse {
        count: calls.len(),
        active_calls: calls,
    })
}

pub async fn call_stats(State(state): State<AppState>) -> Json<CallStats> {
    let threshold = state.detector.settings().threshold_multi_caller as usize;
    Json(state.registry.stats(threshold))
}

// ============================================
// Disconnect
// ============================================

pub async fn disconnect(
    State(state): State<AppState>,
    Json(request): Json<DisconnectRequest>,
) -> Result<Json<DisconnectResponse>> {
    if request.call_ids.is_empty() {
        return Err(Error::InvalidRequest("call_ids must not be empty".into()));
    }
    let response = state
        .dispatcher
        .disconnect(&request.call_ids, request.alert_id, request.reason.as_deref())
        .await;
    Ok(Json(response))
}

// ============================================
// Alerts
// ============================================

#[derive(Deserialize)]
pub struct AlertsQuery {
    pub event_type: Option<String>,
    pub severity: Option<String>,
    pub status: Option<String>,
    pub b_number: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Serialize)]
pub struct AlertListResponse {
    pub alerts: Vec<FraudAlert>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
    pub summary: AlertSummary,
}

fn parse_filter(query: AlertsQuery) -> Result<AlertFilter> {
    let event_type = query
        .event_type
        .as_deref()
        .map(str::parse::<AlertEventType>)
        .transpose()
        .map_err(Error::InvalidRequest)?;
    let severity = query
        .severity
        .as_deref()
        .map(str::parse::<Severity>)
        .transpose()
        .map_err(Error::InvalidRequest)?;
    let status = query
        .status
        .as_deref()
        .map(str::parse::<AlertStatus>)
        .transpose()
        .map_err(Error::InvalidRequest)?;

    Ok(AlertFilter {
        event_type,
        severity,
        status,
        b_number: query.b_number,
        from: query.from,
        to: query.to,
        limit: query.limit.unwrap_or(100).clamp(1, 1_000),
        offset: query.offset.unwrap_or(0).max(0),
    })
}

pub async fn list_alerts(
    State(state): State<AppState>,
    Query(query): Query<AlertsQuery>,
) -> Result<Json<AlertListResponse>> {
    let filter = parse_filter(query)?;
    let (alerts, total, summary) = state.alerts.list(&filter).await?;
    Ok(Json(AlertListResponse {
        alerts,
        total,
        limit: filter.limit,
        offset: filter.offset,
        summary,
    }))
}

pub async fn get_alert(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<FraudAlert>> {
    Ok(Json(state.alerts.get(id).await?))
}

pub async fn get_alert_audit(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<AuditEntry>>> {
    // 404 for unknown alerts rather than an empty trail
    state.alerts.get(id).await?;
    Ok(Json(state.alerts.audit_trail(id).await?))
}

#[derive(Deserialize)]
pub struct AcknowledgeRequest {
    pub user_id: String,
}

pub async fn acknowledge_alert(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<AcknowledgeRequest>,
) -> Result<Json<FraudAlert>> {
    if request.user_id.trim().is_empty() {
        return Err(Error::InvalidRequest("user_id must not be empty".into()));
    }
    let alert = state
        .alerts
        .apply(id, AlertCommand::Acknowledge { user_id: request.user_id })
        .await?;
    Ok(Json(alert))
}

pub async fn investigate_alert(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<FraudAlert>> {
    Ok(Json(state.alerts.apply(id, AlertCommand::StartInvestigation).await?))
}

#[derive(Deserialize)]
pub struct ResolveRequest {
    pub user_id: String,
    pub resolution: String,
    pub notes: Option<String>,
}

pub async fn resolve_alert(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<FraudAlert>> {
    if request.user_id.trim().is_empty() {
        return Err(Error::InvalidRequest("user_id must not be empty".into()));
    }
    let resolution: Resolution = request
        .resolution
        .parse()
        .map_err(Error::InvalidRequest)?;
    let alert = state
        .alerts
        .apply(
            id,
            AlertCommand::Resolve {
                user_id: request.user_id,
                resolution,
                notes: request.notes,
            },
        )
        .await?;
    if matches!(resolution, Resolution::FalsePositive | Resolution::Whitelisted) {
        state.webhooks.notify(WebhookEventType::FraudCleared, &alert);
    }
    Ok(Json(alert))
}

#[derive(Deserialize)]
pub struct ReportNccRequest {
    pub report_id: String,
}

pub async fn report_alert_ncc(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ReportNccRequest>,
) -> Result<Json<FraudAlert>> {
    if request.report_id.trim().is_empty() {
        return Err(Error::InvalidRequest("report_id must not be empty".into()));
    }
    let alert = state
        .alerts
        .apply(id, AlertCommand::ReportNcc { report_id: request.report_id })
        .await?;
    Ok(Json(alert))
}

#[derive(Deserialize)]
pub struct ExportQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub format: Option<String>,
}

/// Export alerts in the selected time range as CSV (default) or JSON
pub async fn export_alerts(
    State(state): State<AppState>,
    Query(query): Query<ExportQuery>,
) -> Result<axum::response::Response> {
    let format = query.format.as_deref().unwrap_or("csv");
    if !matches!(format, "csv" | "json") {
        return Err(Error::InvalidRequest(format!("unknown export format: {format}")));
    }

    let filter = AlertFilter {
        from: query.from,
        to: query.to,
        limit: 10_000,
        ..Default::default()
    };
    let (alerts, _, _) = state.alerts.list(&filter).await?;

    let response = if format == "json" {
        let body = serde_json::to_string_pretty(&alerts)
            .map_err(|e| Error::Internal(e.to_string()))?;
        axum::response::Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json")
            .header("Content-Disposition", "attachment; filename=fraud_alerts.json")
            .body(axum::body::Body::from(body))
    } else {
        let mut csv = String::from(
            "id,call_id,event_type,severity,b_number,source_ip,confidence,status,detected_at,ncc_reported\n",
        );
        for alert in alerts {
            csv.push_str(&format!(
                "{},{},{},{},{},{},{},{},{},{}\n",
                alert.id,
                alert.call_id,
                alert.event_type,
                alert.severity,
                alert.b_number.as_deref().unwrap_or(""),
                alert.source_ip.map(|ip| ip.to_string()).unwrap_or_default(),
                alert.confidence,
                alert.status,
                alert.detected_at.to_rfc3339(),
                alert.ncc_reported,
            ));
        }
        axum::response::Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/csv")
            .header("Content-Disposition", "attachment; filename=fraud_alerts.csv")
            .body(axum::body::Body::from(csv))
    };
    response.map_err(|e| Error::Internal(e.to_string()))
}

#[derive(Serialize)]
pub struct TypeCount {
    pub event_type: String,
    pub count: i64,
}

#[derive(Serialize)]
pub struct AlertStatsResponse {
    pub period: String,
    pub total: i64,
    pub summary: AlertSummary,
    pub by_type: Vec<TypeCount>,
}

#[derive(Deserialize)]
pub struct AlertStatsQuery {
    pub period: Option<String>,
}

/// Severity/status/type breakdown over a trailing period
pub async fn alert_stats(
    State(state): State<AppState>,
    Query(query): Query<AlertStatsQuery>,
) -> Result<Json<AlertStatsResponse>> {
    let period = query.period.as_deref().unwrap_or("24h");
    let duration = match period {
        "1h" => chrono::Duration::hours(1),
        "6h" => chrono::Duration::hours(6),
        "24h" => chrono::Duration::hours(24),
        "7d" => chrono::Duration::days(7),
        other => return Err(Error::InvalidRequest(format!("unknown period: {other}"))),
    };

    let filter = AlertFilter {
        from: Some(Utc::now() - duration),
        limit: 10_000,
        ..Default::default()
    };
    let (alerts, total, summary) = state.alerts.list(&filter).await?;

    let mut counts: std::collections::HashMap<String, i64> = std::collections::HashMap::new();
    for alert in &alerts {
        *counts.entry(alert.event_type.as_str().to_string()).or_default() += 1;
    }
    let mut by_type: Vec<TypeCount> = counts
        .into_iter()
        .map(|(event_type, count)| TypeCount { event_type, count })
        .collect();
    by_type.sort_by(|a, b| b.count.cmp(&a.count));

    Ok(Json(AlertStatsResponse {
        period: period.to_string(),
        total,
        summary,
        by_type,
    }))
}

pub async fn alert_webhook(
    State(_state): State<AppState>,
    Json(webhook): Json<FraudAlertWebhook>,
) -> Json<serde_json::Value> {
    match webhook.event_type {
        WebhookEventType::FraudDetected => {
            tracing::warn!(alert = %webhook.alert, "Fraud-detected webhook received");
        }
        WebhookEventType::FraudCleared => {
            tracing::info!(alert = %webhook.alert, "Fraud-cleared webhook received");
        }
    }
    Json(json!({ "status": "received" }))
}

// ============================================
// Blacklist
// ============================================

#[derive(Deserialize)]
pub struct BlacklistAddRequest {
    pub entry_type: EntryType,
    pub value: String,
    pub reason: Option<String>,
    #[serde(default)]
    pub source: Option<BlacklistSource>,
    pub added_by: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

pub async fn add_blacklist_entry(
    State(state): State<AppState>,
    Json(request): Json<BlacklistAddRequest>,
) -> Result<(StatusCode, Json<BlacklistEntry>)> {
    let entry = BlacklistEntry::new(
        request.entry_type,
        request.value,
        request.reason,
        request.source.unwrap_or(BlacklistSource::Manual),
        request.added_by.unwrap_or_else(|| "system".to_string()),
        request.expires_at,
    );
    let stored = state.blacklist.add(entry).await?;
    Ok((StatusCode::CREATED, Json(stored)))
}

pub async fn list_blacklist(State(state): State<AppState>) -> Result<Json<Vec<BlacklistEntry>>> {
    let mut entries = state.blacklist.list().await?;
    entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(Json(entries))
}

pub async fn remove_blacklist_entry(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    state.blacklist.remove(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
pub struct BlacklistCheckResponse {
    pub value: String,
    pub blacklisted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched: Option<crate::blacklist::BlacklistMatch>,
}

/// Check one value (MSISDN or IP) against the live snapshot
pub async fn check_blacklist(
    State(state): State<AppState>,
    Path(value): Path<String>,
) -> Result<Json<BlacklistCheckResponse>> {
    let matched = if let Ok(ip) = value.parse::<std::net::IpAddr>() {
        state.blacklist.check_ip(ip)
    } else {
        let msisdn = acm_core::Msisdn::parse(&value)?;
        state.blacklist.check_msisdn(&msisdn)
    };

    Ok(Json(BlacklistCheckResponse {
        value,
        blacklisted: matched.is_some(),
        matched,
    }))
}

// ============================================
// Gateways & configuration
// ============================================

pub async fn list_gateways(State(state): State<AppState>) -> Json<Vec<crate::gateway::Gateway>> {
    let gateways = state.gateways.list().iter().map(|g| (**g).clone()).collect();
    Json(gateways)
}

pub async fn get_detection_config(State(state): State<AppState>) -> Json<DetectionSettings> {
    Json((*state.detector.settings()).clone())
}

pub async fn update_detection_config(
    State(state): State<AppState>,
    Json(settings): Json<DetectionSettings>,
) -> Result<Json<DetectionSettings>> {
    if settings.window_seconds == 0 || settings.masking_window_seconds == 0 {
        return Err(Error::InvalidRequest("window lengths must be positive".into()));
    }
    if settings.acd_threshold_seconds < 1.0 {
        return Err(Error::InvalidRequest("acd_threshold_seconds must be >= 1".into()));
    }
    state.detector.swap_settings(settings);
    Ok(Json((*state.detector.settings()).clone()))
}
