//! Event pipeline
//!
//! Consumes flushed batches and fast-path events from the buffer, runs them
//! through the detector, materializes alert candidates, and triggers
//! enforcement when auto-disconnect is enabled. Each delivery is processed
//! in its own task so a panic is contained at the task boundary instead of
//! killing the pipeline.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::alert::AlertEventType;
use crate::buffer::BufferReceivers;
use crate::detector::{AlertCandidate, Detector};
use crate::dispatcher::DisconnectDispatcher;
use crate::models::{CallEvent, WebhookEventType};
use crate::registry::ActiveCallRegistry;
use crate::store::AlertService;
use crate::webhook::WebhookNotifier;

use acm_core::Msisdn;

/// Rules whose alerts are enforced directly when auto-disconnect is on.
/// Auto-escalatable alerts are additionally picked up by the background
/// escalation processor.
fn enforceable(event_type: AlertEventType) -> bool {
    matches!(
        event_type,
        AlertEventType::CliMasking | AlertEventType::Simbox | AlertEventType::BlacklistHit
    )
}

#[derive(Clone)]
pub struct Pipeline {
    pub detector: Arc<Detector>,
    pub alerts: Arc<AlertService>,
    pub dispatcher: Arc<DisconnectDispatcher>,
    pub registry: Arc<ActiveCallRegistry>,
    pub webhooks: Arc<WebhookNotifier>,
}

impl Pipeline {
    /// Main worker loop. Exits when the buffer side closes or shutdown is
    /// signalled.
    pub async fn run(self, mut receivers: BufferReceivers, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                batch = receivers.batches.recv() => match batch {
                    Some(events) => self.handle_isolated(events).await,
                    None => break,
                },
                event = receivers.fast.recv() => match event {
                    Some(event) => self.handle_isolated(vec![event]).await,
                    None => break,
                },
                _ = shutdown.changed() => {
                    // The flusher is doing its final drain concurrently;
                    // keep receiving until it goes quiet.
                    while let Ok(Some(events)) =
                        tokio::time::timeout(Duration::from_millis(250), receivers.batches.recv()).await
                    {
                        self.handle_isolated(events).await;
                    }
                    break;
                }
            }
        }
        tracing::info!("Detection pipeline stopped");
    }

    /// Run one delivery in a child task; a panic there is logged with
    /// context and never crosses into the pipeline loop.
    async fn handle_isolated(&self, events: Vec<CallEvent>) {
        let worker = self.clone();
        let batch_size = events.len();
        let handle = tokio::spawn(async move { worker.process(events).await });
        if let Err(join_err) = handle.await {
            if join_err.is_panic() {
                tracing::error!(batch_size, "Detection worker panicked; batch abandoned");
            }
        }
    }

    async fn process(&self, events: Vec<CallEvent>) {
        let candidates = self.detector.process_batch(&events).await;
        for candidate in candidates {
            self.materialize(candidate).await;
        }
    }

    async fn materialize(&self, candidate: AlertCandidate) {
        let auto_disconnect = self.detector.settings().auto_disconnect;
        let enforce =
            auto_disconnect && (enforceable(candidate.event_type) || candidate.should_auto_escalate());
        let b_number = candidate.b_number.clone();

        let alert = match self.alerts.create(candidate.into_alert()).await {
            Ok(alert) => alert,
            Err(err) => {
                tracing::error!(error = %err, "Failed to persist alert candidate");
                return;
            }
        };
        self.webhooks.notify(WebhookEventType::FraudDetected, &alert);

        if !enforce {
            return;
        }

        let mut call_ids = alert.contributing_call_ids.clone();
        if let Some(b) = b_number.as_deref().and_then(|b| Msisdn::parse(b).ok()) {
            for call_id in self.registry.calls_toward(&b) {
                if !call_ids.contains(&call_id) {
                    call_ids.push(call_id);
                }
            }
        }
        if !call_ids.contains(&alert.call_id) {
            call_ids.push(alert.call_id.clone());
        }

        let reason = format!("{} auto-disconnect", alert.event_type);
        let outcome = self
            .dispatcher
            .disconnect(&call_ids, Some(alert.id), Some(&reason))
            .await;
        tracing::warn!(
            alert_id = %alert.id,
            event_type = %alert.event_type,
            requested = outcome.requested,
            disconnected = outcome.disconnected,
            "Enforcement dispatch finished"
        );
    }
}
