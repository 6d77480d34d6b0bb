//! Disconnect dispatch to the SBC
//!
//! Enforcement actions become JSON-RPC `dlg.end_dlg` calls against the
//! switch. The active-call registry is consulted first: calls it no longer
//! knows are reported back without touching the SBC at all, which also makes
//! repeat dispatches for ended calls safe. Transport failures are classified
//! and returned; the SBC may already have acted, so nothing is retried here.

use acm_core::Counter;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::models::{DisconnectResponse, DisconnectResult};
use crate::registry::ActiveCallRegistry;

/// Failure classes surfaced to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SbcError {
    Timeout,
    Transport(String),
    SwitchError(u16),
}

impl std::fmt::Display for SbcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Transport(detail) => write!(f, "transport error: {detail}"),
            Self::SwitchError(status) => write!(f, "switch returned status {status}"),
        }
    }
}

/// JSON-RPC 2.0 client for the SBC's management interface
pub struct SbcClient {
    http: reqwest::Client,
    rpc_url: String,
}

impl SbcClient {
    pub fn new(rpc_url: String, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client");
        Self { http, rpc_url }
    }

    /// Tear down one dialog. Any HTTP 2xx is success; the response body is
    /// not inspected.
    pub async fn end_dialog(&self, call_id: &str) -> Result<(), SbcError> {
        let request = json!({
            "jsonrpc": "2.0",
            "method": "dlg.end_dlg",
            "params": { "callid": call_id },
            "id": 1,
        });

        let response = self
            .http
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SbcError::Timeout
                } else {
                    SbcError::Transport(e.to_string())
                }
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(SbcError::SwitchError(response.status().as_u16()))
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatcherStats {
    pub requested: u64,
    pub disconnected: u64,
    pub not_found: u64,
    pub failed: u64,
}

/// Translates enforcement decisions into per-call SBC commands
pub struct DisconnectDispatcher {
    registry: Arc<ActiveCallRegistry>,
    sbc: SbcClient,
    requested: Counter,
    disconnected: Counter,
    not_found: Counter,
    failed: Counter,
}

impl DisconnectDispatcher {
    pub fn new(registry: Arc<ActiveCallRegistry>, sbc: SbcClient) -> Self {
        Self {
            registry,
            sbc,
            requested: Counter::new(),
            disconnected: Counter::new(),
            not_found: Counter::new(),
            failed: Counter::new(),
        }
    }

    /// Disconnect a set of calls. Idempotent: call-ids already gone from
    /// the registry come back as `not_found` failures without SBC traffic.
    pub async fn disconnect(
        &self,
        call_ids: &[String],
        alert_id: Option<Uuid>,
        reason: Option<&str>,
    ) -> DisconnectResponse {
        let mut response = DisconnectResponse {
            requested: call_ids.len(),
            ..Default::default()
        };
        self.requested.add(call_ids.len() as u64);

        for call_id in call_ids {
            let result = self.disconnect_one(call_id, reason).await;
            if result.success {
                response.disconnected += 1;
            } else {
                response.failed += 1;
            }
            response.results.push(result);
        }

        tracing::info!(
            requested = response.requested,
            disconnected = response.disconnected,
            failed = response.failed,
            alert_id = alert_id.map(|id| id.to_string()).as_deref().unwrap_or("-"),
            reason = reason.unwrap_or("-"),
            "Disconnect dispatch completed"
        );
        response
    }

    async fn disconnect_one(&self, call_id: &str, reason: Option<&str>) -> DisconnectResult {
        let Some(call) = self.registry.get(call_id) else {
            self.not_found.inc();
            return DisconnectResult {
                call_id: call_id.to_string(),
                success: false,
                error: Some("call not found or already ended".into()),
            };
        };

        match self.sbc.end_dialog(call_id).await {
            Ok(()) => {
                self.registry.remove(call_id);
                self.disconnected.inc();
                tracing::info!(
                    call_id,
                    a_number = %call.a_number,
                    b_number = %call.b_number,
                    reason = reason.unwrap_or("-"),
                    "Call disconnected"
                );
                DisconnectResult {
                    call_id: call_id.to_string(),
                    success: true,
                    error: None,
                }
            }
            Err(err) => {
                self.failed.inc();
                tracing::error!(call_id, error = %err, "Disconnect failed");
                DisconnectResult {
                    call_id: call_id.to_string(),
                    success: false,
                    error: Some(err.to_string()),
                }
            }
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            requested: self.requested.get(),
            disconnected: self.disconnected.get(),
            not_found: self.not_found.get(),
            failed: self.failed.get(),
        }
    }
}
