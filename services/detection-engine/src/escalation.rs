//! Auto-escalation processor
//!
//! Sweeps pending alerts flagged for auto-escalation and hands their calls
//! to the dispatcher. Dispatch never changes alert state; an in-memory set
//! of attempted alert ids keeps the sweep from re-dispatching every tick.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::detector::Detector;
use crate::dispatcher::DisconnectDispatcher;
use crate::store::AlertService;

const SWEEP_BATCH: i64 = 50;
const ATTEMPTED_CAP: usize = 10_000;

pub struct EscalationProcessor {
    pub alerts: Arc<AlertService>,
    pub dispatcher: Arc<DisconnectDispatcher>,
    pub detector: Arc<Detector>,
    pub interval: Duration,
}

impl EscalationProcessor {
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        let mut attempted: HashSet<uuid::Uuid> = HashSet::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if !self.detector.settings().auto_disconnect {
                continue;
            }

            let pending = match self.alerts.pending_escalations(SWEEP_BATCH).await {
                Ok(pending) => pending,
                Err(err) => {
                    tracing::warn!(error = %err, "Escalation sweep could not read pending alerts");
                    continue;
                }
            };

            for alert in pending {
                if attempted.contains(&alert.id) {
                    continue;
                }
                if attempted.len() >= ATTEMPTED_CAP {
                    attempted.clear();
                }
                attempted.insert(alert.id);

                let mut call_ids = alert.contributing_call_ids.clone();
                if !call_ids.contains(&alert.call_id) {
                    call_ids.push(alert.call_id.clone());
                }
                let outcome = self
                    .dispatcher
                    .disconnect(&call_ids, Some(alert.id), Some("auto-escalation"))
                    .await;
                tracing::warn!(
                    alert_id = %alert.id,
                    event_type = %alert.event_type,
                    disconnected = outcome.disconnected,
                    failed = outcome.failed,
                    "Auto-escalation dispatched"
                );
            }
        }
        tracing::info!("Escalation processor stopped");
    }
}
