//! Persistence ports and adapters
//!
//! Components talk to storage through the port traits so the engine runs
//! against Postgres in production and entirely in memory in tests and
//! standalone deployments. Transient failures are retried with bounded
//! exponential backoff; a write that fails after retries never commits
//! anything in memory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::alert::{AlertCommand, AlertEventType, AlertStatus, AuditEntry, FraudAlert, Severity};
use crate::blacklist::BlacklistEntry;
use crate::error::{Error, Result};
use crate::gateway::Gateway;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);
const STORE_DEADLINE: Duration = Duration::from_secs(5);

/// Bound a store operation by a deadline so a hung backend cannot wedge the
/// caller; timeouts surface as transient unavailability.
pub async fn with_deadline<T, Fut>(operation: Fut) -> Result<T>
where
    Fut: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(STORE_DEADLINE, operation).await {
        Ok(result) => result,
        Err(_) => Err(Error::StoreUnavailable("store deadline exceeded".into())),
    }
}

/// Retry a transient-failure-prone operation with bounded exponential
/// backoff and jitter (50 ms → 400 ms), each attempt under the store
/// deadline. Non-transient errors surface immediately.
pub async fn with_retry<T, F, Fut>(operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = RETRY_BASE_DELAY;
    let mut last_err = None;
    for attempt in 0..RETRY_ATTEMPTS {
        match with_deadline(operation()).await {
            Ok(value) => return Ok(value),
            Err(err @ Error::StoreUnavailable(_)) => {
                tracing::warn!(attempt, error = %err, "Transient store failure, retrying");
                last_err = Some(err);
                if attempt + 1 < RETRY_ATTEMPTS {
                    let jitter = rand::thread_rng().gen_range(0.75..1.25);
                    tokio::time::sleep(delay.mul_f64(jitter)).await;
                    delay = (delay * 2).min(Duration::from_millis(400));
                }
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err.unwrap_or_else(|| Error::StoreUnavailable("retries exhausted".into())))
}

/// Filter for alert listings
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub event_type: Option<AlertEventType>,
    pub severity: Option<Severity>,
    pub status: Option<AlertStatus>,
    pub b_number: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

impl AlertFilter {
    fn matches(&self, alert: &FraudAlert) -> bool {
        if matches!(self.event_type, Some(t) if t != alert.event_type) {
            return false;
        }
        if matches!(self.severity, Some(s) if s != alert.severity) {
            return false;
        }
        if matches!(self.status, Some(s) if s != alert.status) {
            return false;
        }
        if let Some(b) = &self.b_number {
            if alert.b_number.as_deref() != Some(b.as_str()) {
                return false;
            }
        }
        if matches!(self.from, Some(from) if alert.detected_at < from) {
            return false;
        }
        if matches!(self.to, Some(to) if alert.detected_at > to) {
            return false;
        }
        true
    }
}

/// Severity/status breakdown attached to alert listings
#[derive(Debug, Clone, Default, Serialize)]
pub struct AlertSummary {
    pub critical: i64,
    pub high: i64,
    pub medium: i64,
    pub low: i64,
    pub pending: i64,
    pub investigating: i64,
    pub resolved: i64,
}

impl AlertSummary {
    fn absorb(&mut self, alert: &FraudAlert) {
        match alert.severity {
            Severity::Critical => self.critical += 1,
            Severity::High => self.high += 1,
            Severity::Medium => self.medium += 1,
            Severity::Low => self.low += 1,
        }
        match alert.status {
            AlertStatus::Pending => self.pending += 1,
            AlertStatus::Investigating => self.investigating += 1,
            AlertStatus::Resolved => self.resolved += 1,
            _ => {}
        }
    }
}

// ============================================
// Ports
// ============================================

#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn insert_alert(&self, alert: &FraudAlert) -> Result<()>;
    /// Persist a transition and its audit row atomically.
    async fn update_alert(&self, alert: &FraudAlert, audit: &AuditEntry) -> Result<()>;
    async fn get_alert(&self, id: Uuid) -> Result<Option<FraudAlert>>;
    async fn list_alerts(&self, filter: &AlertFilter) -> Result<(Vec<FraudAlert>, i64, AlertSummary)>;
    /// Pending alerts flagged for auto-escalation
    async fn pending_escalations(&self, limit: i64) -> Result<Vec<FraudAlert>>;
    async fn audit_trail(&self, alert_id: Uuid) -> Result<Vec<AuditEntry>>;
}

#[async_trait]
pub trait BlacklistStore: Send + Sync {
    async fn list_active_blacklist(&self) -> Result<Vec<BlacklistEntry>>;
    /// Upsert keyed by (entry_type, value); an equal active entry is
    /// replaced, never duplicated.
    async fn upsert_blacklist(&self, entry: BlacklistEntry) -> Result<BlacklistEntry>;
    async fn delete_blacklist(&self, id: Uuid) -> Result<bool>;
    async fn purge_expired_blacklist(&self, now: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait GatewayStore: Send + Sync {
    async fn list_gateways(&self) -> Result<Vec<Gateway>>;
}

// ============================================
// In-memory adapter
// ============================================

/// In-memory store used by tests and standalone deployments
#[derive(Default)]
pub struct MemoryStore {
    alerts: RwLock<HashMap<Uuid, FraudAlert>>,
    audit: RwLock<Vec<AuditEntry>>,
    blacklist: RwLock<HashMap<Uuid, BlacklistEntry>>,
    gateways: RwLock<HashMap<Uuid, Gateway>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a gateway; the registry picks it up on its next reload.
    pub async fn put_gateway(&self, gateway: Gateway) {
        self.gateways.write().insert(gateway.id, gateway.normalized());
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn insert_alert(&self, alert: &FraudAlert) -> Result<()> {
        self.alerts.write().insert(alert.id, alert.clone());
        Ok(())
    }

    async fn update_alert(&self, alert: &FraudAlert, audit: &AuditEntry) -> Result<()> {
        let mut alerts = self.alerts.write();
        if !alerts.contains_key(&alert.id) {
            return Err(Error::NotFound("alert", alert.id.to_string()));
        }
        alerts.insert(alert.id, alert.clone());
        self.audit.write().push(audit.clone());
        Ok(())
    }

    async fn get_alert(&self, id: Uuid) -> Result<Option<FraudAlert>> {
        Ok(self.alerts.read().get(&id).cloned())
    }

    async fn list_alerts(&self, filter: &AlertFilter) -> Result<(Vec<FraudAlert>, i64, AlertSummary)> {
        let alerts = self.alerts.read();
        let mut matched: Vec<FraudAlert> =
            alerts.values().filter(|a| filter.matches(a)).cloned().collect();
        matched.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));

        let total = matched.len() as i64;
        let mut summary = AlertSummary::default();
        for alert in &matched {
            summary.absorb(alert);
        }

        let offset = filter.offset.max(0) as usize;
        let limit = if filter.limit <= 0 { 100 } else { filter.limit as usize };
        let page = matched.into_iter().skip(offset).take(limit).collect();
        Ok((page, total, summary))
    }

    async fn pending_escalations(&self, limit: i64) -> Result<Vec<FraudAlert>> {
        let alerts = self.alerts.read();
        let mut pending: Vec<FraudAlert> = alerts
            .values()
            .filter(|a| a.status == AlertStatus::Pending && a.should_auto_escalate)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.detected_at.cmp(&b.detected_at));
        pending.truncate(limit.max(0) as usize);
        Ok(pending)
    }

    async fn audit_trail(&self, alert_id: Uuid) -> Result<Vec<AuditEntry>> {
        Ok(self
            .audit
            .read()
            .iter()
            .filter(|e| e.alert_id == alert_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl BlacklistStore for MemoryStore {
    async fn list_active_blacklist(&self) -> Result<Vec<BlacklistEntry>> {
        Ok(self.blacklist.read().values().cloned().collect())
    }

    async fn upsert_blacklist(&self, entry: BlacklistEntry) -> Result<BlacklistEntry> {
        let mut blacklist = self.blacklist.write();
        let existing = blacklist
            .values()
            .find(|e| e.entry_type == entry.entry_type && e.value == entry.value)
            .map(|e| e.id);
        let stored = match existing {
            Some(id) => {
                let mut updated = entry;
                updated.id = id;
                blacklist.insert(id, updated.clone());
                updated
            }
            None => {
                blacklist.insert(entry.id, entry.clone());
                entry
            }
        };
        Ok(stored)
    }

    async fn delete_blacklist(&self, id: Uuid) -> Result<bool> {
        Ok(self.blacklist.write().remove(&id).is_some())
    }

    async fn purge_expired_blacklist(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut blacklist = self.blacklist.write();
        let before = blacklist.len();
        blacklist.retain(|_, e| !e.is_expired_at(now));
        Ok((before - blacklist.len()) as u64)
    }
}

#[async_trait]
impl GatewayStore for MemoryStore {
    async fn list_gateways(&self) -> Result<Vec<Gateway>> {
        Ok(self.gateways.read().values().cloned().collect())
    }
}

// ============================================
// Alert service
// ============================================

/// The single writer of alert state. Transitions are serialized per
/// alert-id and follow read → pure transition → persist; a persist failure
/// discards the in-memory copy, so the next attempt re-reads.
pub struct AlertService {
    store: Arc<dyn AlertStore>,
    locks: dashmap::DashMap<Uuid, Arc<Mutex<()>>>,
}

impl AlertService {
    pub fn new(store: Arc<dyn AlertStore>) -> Self {
        Self {
            store,
            locks: dashmap::DashMap::new(),
        }
    }

    fn lock_for(&self, id: Uuid) -> Arc<Mutex<()>> {
        self.locks.entry(id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    pub async fn create(&self, alert: FraudAlert) -> Result<FraudAlert> {
        with_retry(|| async { self.store.insert_alert(&alert).await }).await?;
        tracing::warn!(
            alert_id = %alert.id,
            event_type = %alert.event_type,
            severity = %alert.severity,
            confidence = alert.confidence,
            b_number = alert.b_number.as_deref().unwrap_or("-"),
            "Fraud alert raised"
        );
        Ok(alert)
    }

    pub async fn get(&self, id: Uuid) -> Result<FraudAlert> {
        with_deadline(self.store.get_alert(id))
            .await?
            .ok_or_else(|| Error::NotFound("alert", id.to_string()))
    }

    pub async fn list(&self, filter: &AlertFilter) -> Result<(Vec<FraudAlert>, i64, AlertSummary)> {
        with_deadline(self.store.list_alerts(filter)).await
    }

    pub async fn audit_trail(&self, id: Uuid) -> Result<Vec<AuditEntry>> {
        with_deadline(self.store.audit_trail(id)).await
    }

    pub async fn pending_escalations(&self, limit: i64) -> Result<Vec<FraudAlert>> {
        with_deadline(self.store.pending_escalations(limit)).await
    }

    /// Apply a workflow command under the per-alert lock.
    pub async fn apply(&self, id: Uuid, command: AlertCommand) -> Result<FraudAlert> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut alert = self.get(id).await?;
        let audit = alert.apply(&command)?;
        with_retry(|| async { self.store.update_alert(&alert, &audit).await }).await?;

        tracing::info!(
            alert_id = %id,
            command = command.name(),
            from = %audit.from_state,
            to = %audit.to_state,
            "Alert transition applied"
        );
        Ok(alert)
    }
}

// ============================================
// Postgres adapter
// ============================================

/// Postgres adapter over a single connection guarded by a mutex. Schema is
/// created on startup; transitions and their audit rows commit in one
/// transaction.
pub struct PgStore {
    client: Mutex<tokio_postgres::Client>,
}

fn pg_err(err: tokio_postgres::Error) -> Error {
    if err.is_closed() {
        Error::StoreUnavailable(err.to_string())
    } else {
        Error::Store(err.to_string())
    }
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(database_url, tokio_postgres::NoTls)
            .await
            .map_err(|e| Error::StoreUnavailable(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "Postgres connection terminated");
            }
        });

        let store = Self {
            client: Mutex::new(client),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        let client = self.client.lock().await;
        client
            .batch_execute(
                r#"
                CREATE TABLE IF NOT EXISTS fraud_alerts (
                    id UUID PRIMARY KEY,
                    call_id TEXT NOT NULL,
                    event_type TEXT NOT NULL,
                    severity TEXT NOT NULL,
                    a_numbers JSONB NOT NULL DEFAULT '[]',
                    b_number TEXT,
                    source_ip TEXT,
                    gateway_id UUID,
                    confidence DOUBLE PRECISION NOT NULL,
                    detection_method TEXT NOT NULL,
                    matched_patterns JSONB NOT NULL DEFAULT '[]',
                    contributing_call_ids JSONB NOT NULL DEFAULT '[]',
                    should_auto_escalate BOOLEAN NOT NULL DEFAULT FALSE,
                    status TEXT NOT NULL,
                    acknowledged_by TEXT,
                    acknowledged_at TIMESTAMPTZ,
                    resolved_by TEXT,
                    resolved_at TIMESTAMPTZ,
                    resolution TEXT,
                    resolution_notes TEXT,
                    ncc_reported BOOLEAN NOT NULL DEFAULT FALSE,
                    ncc_report_id TEXT,
                    ncc_reported_at TIMESTAMPTZ,
                    detected_at TIMESTAMPTZ NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_alerts_status ON fraud_alerts (status, detected_at DESC);
                CREATE INDEX IF NOT EXISTS idx_alerts_bnumber ON fraud_alerts (b_number);

                CREATE TABLE IF NOT EXISTS alert_audit (
                    id BIGSERIAL PRIMARY KEY,
                    alert_id UUID NOT NULL,
                    user_id TEXT,
                    from_state TEXT NOT NULL,
                    to_state TEXT NOT NULL,
                    at TIMESTAMPTZ NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_audit_alert ON alert_audit (alert_id, at);

                CREATE TABLE IF NOT EXISTS blacklist_entries (
                    id UUID PRIMARY KEY,
                    entry_type TEXT NOT NULL,
                    value TEXT NOT NULL,
                    reason TEXT,
                    source TEXT NOT NULL,
                    added_by TEXT NOT NULL,
                    expires_at TIMESTAMPTZ,
                    created_at TIMESTAMPTZ NOT NULL,
                    UNIQUE (entry_type, value)
                );

                CREATE TABLE IF NOT EXISTS gateways (
                    id UUID PRIMARY KEY,
                    name TEXT NOT NULL,
                    ip TEXT NOT NULL,
                    carrier TEXT,
                    gateway_type TEXT NOT NULL,
                    fraud_threshold DOUBLE PRECISION NOT NULL,
                    cpm_limit BIGINT NOT NULL,
                    acd_threshold_secs DOUBLE PRECISION NOT NULL,
                    is_active BOOLEAN NOT NULL,
                    is_blacklisted BOOLEAN NOT NULL,
                    blacklist_reason TEXT,
                    blacklist_expires_at TIMESTAMPTZ
                );
                "#,
            )
            .await
            .map_err(pg_err)
    }

    fn row_to_alert(row: &tokio_postgres::Row) -> Result<FraudAlert> {
        let parse = |field: &str, value: String| {
            Error::Store(format!("corrupt {field} in alert row: {value}"))
        };

        let event_type: String = row.get("event_type");
        let severity: String = row.get("severity");
        let status: String = row.get("status");
        let resolution: Option<String> = row.get("resolution");
        let source_ip: Option<String> = row.get("source_ip");
        let a_numbers: serde_json::Value = row.get("a_numbers");
        let matched_patterns: serde_json::Value = row.get("matched_patterns");
        let contributing: serde_json::Value = row.get("contributing_call_ids");

        let string_vec = |value: serde_json::Value| -> Vec<String> {
            serde_json::from_value(value).unwrap_or_default()
        };

        Ok(FraudAlert {
            id: row.get("id"),
            call_id: row.get("call_id"),
            event_type: serde_json::from_value(serde_json::Value::String(event_type.clone()))
                .map_err(|_| parse("event_type", event_type))?,
            severity: severity.parse().map_err(|_| parse("severity", severity.clone()))?,
            a_numbers: string_vec(a_numbers),
            b_number: row.get("b_number"),
            source_ip: source_ip.and_then(|s| s.parse().ok()),
            gateway_id: row.get("gateway_id"),
            confidence: row.get("confidence"),
            detection_method: row.get("detection_method"),
            matched_patterns: string_vec(matched_patterns),
            contributing_call_ids: string_vec(contributing),
            should_auto_escalate: row.get("should_auto_escalate"),
            status: status.parse().map_err(|_| parse("status", status.clone()))?,
            acknowledged_by: row.get("acknowledged_by"),
            acknowledged_at: row.get("acknowledged_at"),
            resolved_by: row.get("resolved_by"),
            resolved_at: row.get("resolved_at"),
            resolution: match resolution {
                Some(raw) => Some(raw.parse().map_err(|_| parse("resolution", raw.clone()))?),
                None => None,
            },
            resolution_notes: row.get("resolution_notes"),
            ncc_reported: row.get("ncc_reported"),
            ncc_report_id: row.get("ncc_report_id"),
            ncc_reported_at: row.get("ncc_reported_at"),
            detected_at: row.get("detected_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl AlertStore for PgStore {
    async fn insert_alert(&self, alert: &FraudAlert) -> Result<()> {
        let client = self.client.lock().await;
        client
            .execute(
                r#"INSERT INTO fraud_alerts (
                    id, call_id, event_type, severity, a_numbers, b_number, source_ip,
                    gateway_id, confidence, detection_method, matched_patterns,
                    contributing_call_ids, should_auto_escalate, status, ncc_reported,
                    detected_at, updated_at
                ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17)"#,
                &[
                    &alert.id,
                    &alert.call_id,
                    &alert.event_type.as_str(),
                    &alert.severity.as_str(),
                    &serde_json::to_value(&alert.a_numbers).unwrap_or_default(),
                    &alert.b_number,
                    &alert.source_ip.map(|ip| ip.to_string()),
                    &alert.gateway_id,
                    &alert.confidence,
                    &alert.detection_method,
                    &serde_json::to_value(&alert.matched_patterns).unwrap_or_default(),
                    &serde_json::to_value(&alert.contributing_call_ids).unwrap_or_default(),
                    &alert.should_auto_escalate,
                    &alert.status.as_str(),
                    &alert.ncc_reported,
                    &alert.detected_at,
                    &alert.updated_at,
                ],
            )
            .await
            .map_err(pg_err)?;
        Ok(())
    }

    async fn update_alert(&self, alert: &FraudAlert, audit: &AuditEntry) -> Result<()> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await.map_err(pg_err)?;

        let updated = tx
            .execute(
                r#"UPDATE fraud_alerts SET
                    status = $2, acknowledged_by = $3, acknowledged_at = $4,
                    resolved_by = $5, resolved_at = $6, resolution = $7,
                    resolution_notes = $8, ncc_reported = $9, ncc_report_id = $10,
                    ncc_reported_at = $11, updated_at = $12
                WHERE id = $1"#,
                &[
                    &alert.id,
                    &alert.status.as_str(),
                    &alert.acknowledged_by,
                    &alert.acknowledged_at,
                    &alert.resolved_by,
                    &alert.resolved_at,
                    &alert.resolution.map(|r| r.as_str()),
                    &alert.resolution_notes,
                    &alert.ncc_reported,
                    &alert.ncc_report_id,
                    &alert.ncc_reported_at,
                    &alert.updated_at,
                ],
            )
            .await
            .map_err(pg_err)?;
        if updated == 0 {
            return Err(Error::NotFound("alert", alert.id.to_string()));
        }

        tx.execute(
            "INSERT INTO alert_audit (alert_id, user_id, from_state, to_state, at) VALUES ($1,$2,$3,$4,$5)",
            &[
                &audit.alert_id,
                &audit.user,
                &audit.from_state.as_str(),
                &audit.to_state.as_str(),
                &audit.at,
            ],
        )
        .await
        .map_err(pg_err)?;

        tx.commit().await.map_err(pg_err)
    }

    async fn get_alert(&self, id: Uuid) -> Result<Option<FraudAlert>> {
        let client = self.client.lock().await;
        let row = client
            .query_opt("SELECT * FROM fraud_alerts WHERE id = $1", &[&id])
            .await
            .map_err(pg_err)?;
        row.as_ref().map(Self::row_to_alert).transpose()
    }

    async fn list_alerts(&self, filter: &AlertFilter) -> Result<(Vec<FraudAlert>, i64, AlertSummary)> {
        let client = self.client.lock().await;
        // Filters applied in SQL where cheap; pagination after the summary
        // pass so the summary reflects the whole filtered set.
        let rows = client
            .query(
                r#"SELECT * FROM fraud_alerts
                WHERE ($1::TEXT IS NULL OR event_type = $1)
                  AND ($2::TEXT IS NULL OR severity = $2)
                  AND ($3::TEXT IS NULL OR status = $3)
                  AND ($4::TEXT IS NULL OR b_number = $4)
                  AND ($5::TIMESTAMPTZ IS NULL OR detected_at >= $5)
                  AND ($6::TIMESTAMPTZ IS NULL OR detected_at <= $6)
                ORDER BY detected_at DESC"#,
                &[
                    &filter.event_type.map(|t| t.as_str()),
                    &filter.severity.map(|s| s.as_str()),
                    &filter.status.map(|s| s.as_str()),
                    &filter.b_number,
                    &filter.from,
                    &filter.to,
                ],
            )
            .await
            .map_err(pg_err)?;

        let mut alerts = Vec::with_capacity(rows.len());
        let mut summary = AlertSummary::default();
        for row in &rows {
            let alert = Self::row_to_alert(row)?;
            summary.absorb(&alert);
            alerts.push(alert);
        }
        let total = alerts.len() as i64;

        let offset = filter.offset.max(0) as usize;
        let limit = if filter.limit <= 0 { 100 } else { filter.limit as usize };
        let page = alerts.into_iter().skip(offset).take(limit).collect();
        Ok((page, total, summary))
    }

    async fn pending_escalations(&self, limit: i64) -> Result<Vec<FraudAlert>> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT * FROM fraud_alerts WHERE status = 'pending' AND should_auto_escalate ORDER BY detected_at LIMIT $1",
                &[&limit],
            )
            .await
            .map_err(pg_err)?;
        rows.iter().map(Self::row_to_alert).collect()
    }

    async fn audit_trail(&self, alert_id: Uuid) -> Result<Vec<AuditEntry>> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT alert_id, user_id, from_state, to_state, at FROM alert_audit WHERE alert_id = $1 ORDER BY at",
                &[&alert_id],
            )
            .await
            .map_err(pg_err)?;
        rows.iter()
            .map(|row| {
                let from_state: String = row.get("from_state");
                let to_state: String = row.get("to_state");
                Ok(AuditEntry {
                    alert_id: row.get("alert_id"),
                    user: row.get("user_id"),
                    from_state: from_state
                        .parse()
                        .map_err(|_| Error::Store(format!("corrupt from_state: {from_state}")))?,
                    to_state: to_state
                        .parse()
                        .map_err(|_| Error::Store(format!("corrupt to_state: {to_state}")))?,
                    at: row.get("at"),
                })
            })
            .collect()
    }
}

#[async_trait]
impl BlacklistStore for PgStore {
    async fn list_active_blacklist(&self) -> Result<Vec<BlacklistEntry>> {
        let client = self.client.lock().await;
        let rows = client
            .query("SELECT * FROM blacklist_entries", &[])
            .await
            .map_err(pg_err)?;
        rows.iter()
            .map(|row| {
                let entry_type: String = row.get("entry_type");
                let source: String = row.get("source");
                Ok(BlacklistEntry {
                    id: row.get("id"),
                    entry_type: entry_type
                        .parse()
                        .map_err(|_| Error::Store(format!("corrupt entry_type: {entry_type}")))?,
                    value: row.get("value"),
                    reason: row.get("reason"),
                    source: source
                        .parse()
                        .map_err(|_| Error::Store(format!("corrupt source: {source}")))?,
                    added_by: row.get("added_by"),
                    expires_at: row.get("expires_at"),
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }

    async fn upsert_blacklist(&self, entry: BlacklistEntry) -> Result<BlacklistEntry> {
        let client = self.client.lock().await;
        let row = client
            .query_one(
                r#"INSERT INTO blacklist_entries
                    (id, entry_type, value, reason, source, added_by, expires_at, created_at)
                VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
                ON CONFLICT (entry_type, value) DO UPDATE SET
                    reason = EXCLUDED.reason,
                    source = EXCLUDED.source,
                    added_by = EXCLUDED.added_by,
                    expires_at = EXCLUDED.expires_at
                RETURNING id"#,
                &[
                    &entry.id,
                    &entry.entry_type.as_str(),
                    &entry.value,
                    &entry.reason,
                    &entry.source.as_str(),
                    &entry.added_by,
                    &entry.expires_at,
                    &entry.created_at,
                ],
            )
            .await
            .map_err(pg_err)?;
        let mut stored = entry;
        stored.id = row.get("id");
        Ok(stored)
    }

    async fn delete_blacklist(&self, id: Uuid) -> Result<bool> {
        let client = self.client.lock().await;
        let deleted = client
            .execute("DELETE FROM blacklist_entries WHERE id = $1", &[&id])
            .await
            .map_err(pg_err)?;
        Ok(deleted > 0)
    }

    async fn purge_expired_blacklist(&self, now: DateTime<Utc>) -> Result<u64> {
        let client = self.client.lock().await;
        client
            .execute(
                "DELETE FROM blacklist_entries WHERE expires_at IS NOT NULL AND expires_at <= $1",
                &[&now],
            )
            .await
            .map_err(pg_err)
    }
}

#[async_trait]
impl GatewayStore for PgStore {
    async fn list_gateways(&self) -> Result<Vec<Gateway>> {
        let client = self.client.lock().await;
        let rows = client
            .query("SELECT * FROM gateways", &[])
            .await
            .map_err(pg_err)?;
        rows.iter()
            .map(|row| {
                let ip: String = row.get("ip");
                let gateway_type: String = row.get("gateway_type");
                let cpm_limit: i64 = row.get("cpm_limit");
                Ok(Gateway {
                    id: row.get("id"),
                    name: row.get("name"),
                    ip: ip
                        .parse()
                        .map_err(|_| Error::Store(format!("corrupt gateway ip: {ip}")))?,
                    carrier: row.get("carrier"),
                    gateway_type: serde_json::from_value(serde_json::Value::String(
                        gateway_type.clone(),
                    ))
                    .map_err(|_| Error::Store(format!("corrupt gateway_type: {gateway_type}")))?,
                    fraud_threshold: row.get("fraud_threshold"),
                    cpm_limit: cpm_limit.max(0) as u64,
                    acd_threshold_secs: row.get("acd_threshold_secs"),
                    is_active: row.get("is_active"),
                    is_blacklisted: row.get("is_blacklisted"),
                    blacklist_reason: row.get("blacklist_reason"),
                    blacklist_expires_at: row.get("blacklist_expires_at"),
                }
                .normalized())
            })
            .collect()
    }
}
