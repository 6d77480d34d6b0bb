//! Outbound alert webhooks
//!
//! When a webhook URL is configured, every raised alert is pushed to it as
//! a `fraud_detected` notification (and resolutions as `fraud_cleared`).
//! Delivery is fire-and-forget with a bounded timeout: a slow or dead
//! subscriber never holds up the detection pipeline.

use acm_core::Counter;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::alert::FraudAlert;
use crate::models::WebhookEventType;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(3);

pub struct WebhookNotifier {
    http: reqwest::Client,
    url: Option<String>,
    delivered: Counter,
    failed: Counter,
}

impl WebhookNotifier {
    pub fn new(url: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            http,
            url,
            delivered: Counter::new(),
            failed: Counter::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.url.is_some()
    }

    /// Queue one notification; returns immediately.
    pub fn notify(self: &Arc<Self>, event_type: WebhookEventType, alert: &FraudAlert) {
        let Some(url) = self.url.clone() else { return };
        let payload = json!({
            "event_type": event_type,
            "alert": alert,
        });
        let notifier = self.clone();
        let alert_id = alert.id;

        tokio::spawn(async move {
            match notifier.http.post(&url).json(&payload).send().await {
                Ok(response) if response.status().is_success() => {
                    notifier.delivered.inc();
                }
                Ok(response) => {
                    notifier.failed.inc();
                    tracing::warn!(
                        alert_id = %alert_id,
                        status = response.status().as_u16(),
                        "Webhook subscriber rejected notification"
                    );
                }
                Err(err) => {
                    notifier.failed.inc();
                    tracing::warn!(alert_id = %alert_id, error = %err, "Webhook delivery failed");
                }
            }
        });
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.get()
    }

    pub fn failed(&self) -> u64 {
        self.failed.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertEventType;
    use axum::{routing::post, Router};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn alert() -> FraudAlert {
        FraudAlert::new(
            "call-1".into(),
            AlertEventType::CliMasking,
            vec!["+2348010000001".into()],
            Some("+2348099999999".into()),
            None,
            None,
            0.8,
            "sliding_window".into(),
            vec![],
            vec!["call-1".into()],
        )
    }

    #[tokio::test]
    async fn delivers_fraud_detected_payload() {
        let hits = Arc::new(AtomicU32::new(0));
        let hits_in = hits.clone();
        let app = Router::new().route(
            "/hook",
            post(move |body: String| {
                let hits = hits_in.clone();
                async move {
                    assert!(body.contains("\"event_type\":\"fraud_detected\""));
                    assert!(body.contains("CLI_MASKING"));
                    hits.fetch_add(1, Ordering::SeqCst);
                    axum::http::StatusCode::OK
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let notifier = Arc::new(WebhookNotifier::new(Some(format!("http://{addr}/hook"))));
        notifier.notify(WebhookEventType::FraudDetected, &alert());

        for _ in 0..100 {
            if notifier.delivered() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(notifier.delivered(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unconfigured_notifier_is_a_no_op() {
        let notifier = Arc::new(WebhookNotifier::new(None));
        assert!(!notifier.is_enabled());
        notifier.notify(WebhookEventType::FraudDetected, &alert());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(notifier.delivered(), 0);
        assert_eq!(notifier.failed(), 0);
    }

    #[tokio::test]
    async fn unreachable_subscriber_counts_as_failed() {
        let notifier = Arc::new(WebhookNotifier::new(Some("http://127.0.0.1:1/hook".into())));
        notifier.notify(WebhookEventType::FraudDetected, &alert());
        for _ in 0..100 {
            if notifier.failed() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(notifier.failed(), 1);
    }
}
