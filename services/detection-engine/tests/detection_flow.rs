//! End-to-end detection flows through the HTTP surface
//!
//! Runs the full engine (buffer, pipeline, detector, alert service,
//! dispatcher) against the in-memory store, with a local HTTP server
//! standing in for the SBC's JSON-RPC interface.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::post, Router};
use serde_json::{json, Value};
use tokio::sync::watch;

use acm_detection_engine::config::Config;
use acm_detection_engine::mnp::MemoryMnpProvider;
use acm_detection_engine::pipeline::Pipeline;
use acm_detection_engine::store::MemoryStore;
use acm_detection_engine::{build_state, Backends};

const TS: &str = "2025-06-01T12:00:01Z";

struct TestApp {
    base_url: String,
    http: reqwest::Client,
    sbc_hits: Arc<AtomicU32>,
    _shutdown: watch::Sender<bool>,
}

async fn spawn_sbc(hits: Arc<AtomicU32>) -> String {
    let app = Router::new().route(
        "/RPC",
        post(move |body: String| {
            let hits = hits.clone();
            async move {
                assert!(body.contains("\"method\":\"dlg.end_dlg\""));
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
    format!("http://{addr}/RPC")
}

async fn spawn_app(mutate: impl FnOnce(&mut Config)) -> TestApp {
    let sbc_hits = Arc::new(AtomicU32::new(0));
    let sbc_url = spawn_sbc(sbc_hits.clone()).await;

    let mut config = Config {
        sbc_rpc_url: sbc_url,
        flush_interval_ms: 20,
        ..Config::default()
    };
    mutate(&mut config);

    let store = Arc::new(MemoryStore::new());
    let (state, receivers) = build_state(
        config,
        Backends {
            alert_store: store.clone(),
            blacklist_store: store.clone(),
            gateway_store: store,
            mnp_provider: Arc::new(MemoryMnpProvider::new()),
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(state.buffer.clone().run_flusher(shutdown_rx.clone()));
    let pipeline = Pipeline {
        detector: state.detector.clone(),
        alerts: state.alerts.clone(),
        dispatcher: state.dispatcher.clone(),
        registry: state.registry.clone(),
        webhooks: state.webhooks.clone(),
    };
    tokio::spawn(pipeline.run(receivers, shutdown_rx));

    let app = acm_detection_engine::routes::create_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestApp {
        base_url: format!("http://{addr}"),
        http: reqwest::Client::new(),
        sbc_hits,
        _shutdown: shutdown_tx,
    }
}

fn event(call_id: &str, a: &str, b: &str, status: &str) -> Value {
    json!({
        "call_id": call_id,
        "a_number": a,
        "b_number": b,
        "timestamp": TS,
        "status": status,
        "source_ip": "10.1.2.3",
        "switch_id": "sbc-lagos-1",
        "direction": "inbound",
        "sip_method": "INVITE",
    })
}

async fn submit(app: &TestApp, body: Value) -> reqwest::Response {
    app.http
        .post(format!("{}/fraud/events", app.base_url))
        .json(&body)
        .send()
        .await
        .unwrap()
}

/// Poll the alerts listing until one of the wanted type shows up
async fn wait_for_alert(app: &TestApp, event_type: &str) -> Value {
    for _ in 0..100 {
        let body: Value = app
            .http
            .get(format!("{}/fraud/alerts?event_type={event_type}", app.base_url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if body["total"].as_i64().unwrap_or(0) > 0 {
            return body["alerts"][0].clone();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("no {event_type} alert within deadline");
}

#[tokio::test]
async fn cli_masking_raises_one_alert_and_disconnects_contributors() {
    let app = spawn_app(|config| {
        config.auto_disconnect = true;
    })
    .await;

    let b = "+2348099999999";
    for i in 1..=5 {
        let response = submit(
            &app,
            event(&format!("mask-{i}"), &format!("+234801000000{i}"), b, "ringing"),
        )
        .await;
        assert_eq!(response.status(), 202);
    }

    let alert = wait_for_alert(&app, "CLI_MASKING").await;
    assert_eq!(alert["event_type"], "CLI_MASKING");
    assert_eq!(alert["b_number"], b);
    let a_numbers = alert["a_numbers"].as_array().unwrap();
    assert_eq!(a_numbers.len(), 5);
    for i in 1..=5 {
        assert!(a_numbers.contains(&json!(format!("+234801000000{i}"))));
    }
    let severity = alert["severity"].as_str().unwrap();
    assert!(matches!(severity, "medium" | "high" | "critical"));

    // Enforcement tears down every contributing dialog
    for _ in 0..100 {
        if app.sbc_hits.load(Ordering::SeqCst) == 5 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(app.sbc_hits.load(Ordering::SeqCst), 5);

    // Exactly one masking alert despite five triggering deliveries
    let listing: Value = app
        .http
        .get(format!("{}/fraud/alerts?event_type=CLI_MASKING", app.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing["total"], 1);
}

#[tokio::test]
async fn simbox_signature_detected_over_http() {
    let app = spawn_app(|_| {}).await;

    for i in 0..40 {
        let mut body = event(
            &format!("sim-{i}"),
            &format!("+23480100001{:02}", i % 20),
            "+2348088888888",
            "completed",
        );
        body["duration_secs"] = json!(5.0);
        let response = submit(&app, body).await;
        assert_eq!(response.status(), 202);
    }

    let alert = wait_for_alert(&app, "SIMBOX").await;
    assert_eq!(alert["severity"], "high");
    let patterns: Vec<String> = alert["matched_patterns"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p.as_str().unwrap().to_string())
        .collect();
    assert!(patterns.iter().any(|p| p.starts_with("CPM_EXCEEDED")));
    assert!(patterns.iter().any(|p| p.starts_with("ACD_LOW")));
}

#[tokio::test]
async fn blacklisted_caller_alerts_within_one_flush() {
    let app = spawn_app(|_| {}).await;

    let created = app
        .http
        .post(format!("{}/fraud/blacklist", app.base_url))
        .json(&json!({
            "entry_type": "msisdn",
            "value": "+2348012345678",
            "reason": "known simbox operator",
            "source": "regulator",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), 201);

    submit(&app, event("bl-1", "+2348012345678", "+2348099999999", "ringing")).await;

    let alert = wait_for_alert(&app, "BLACKLIST_HIT").await;
    assert_eq!(alert["confidence"], 1.0);
    assert_eq!(alert["severity"], "critical");

    // The check endpoint agrees, in any accepted MSISDN form
    let check: Value = app
        .http
        .get(format!("{}/fraud/blacklist/check/08012345678", app.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(check["blacklisted"], true);
}

#[tokio::test]
async fn disconnect_of_ended_call_reports_not_found_without_sbc_traffic() {
    let app = spawn_app(|_| {}).await;

    submit(&app, event("gone-1", "+2348031234567", "+2348099999999", "completed")).await;

    let response: Value = app
        .http
        .post(format!("{}/fraud/disconnect", app.base_url))
        .json(&json!({ "call_ids": ["gone-1"] }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(response["requested"], 1);
    assert_eq!(response["disconnected"], 0);
    assert_eq!(response["failed"], 1);
    assert_eq!(response["results"][0]["call_id"], "gone-1");
    assert_eq!(response["results"][0]["success"], false);
    assert_eq!(
        response["results"][0]["error"],
        "call not found or already ended"
    );
    assert_eq!(app.sbc_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn alert_lifecycle_acknowledge_resolve_conflict() {
    let app = spawn_app(|_| {}).await;

    // Raise an alert through detection
    for i in 1..=5 {
        submit(
            &app,
            event(
                &format!("life-{i}"),
                &format!("+234801000000{i}"),
                "+2348097777777",
                "ringing",
            ),
        )
        .await;
    }
    let alert = wait_for_alert(&app, "CLI_MASKING").await;
    let id = alert["id"].as_str().unwrap();
    assert_eq!(alert["status"], "pending");

    let acked: Value = app
        .http
        .post(format!("{}/fraud/alerts/{id}/acknowledge", app.base_url))
        .json(&json!({ "user_id": "analyst-1" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(acked["status"], "acknowledged");
    assert_eq!(acked["acknowledged_by"], "analyst-1");
    assert!(acked["acknowledged_at"].is_string());

    let resolved: Value = app
        .http
        .post(format!("{}/fraud/alerts/{id}/resolve", app.base_url))
        .json(&json!({
            "user_id": "analyst-1",
            "resolution": "confirmed_fraud",
            "notes": "verified",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resolved["status"], "resolved");
    assert_eq!(resolved["resolution"], "confirmed_fraud");

    // Second resolve conflicts and changes nothing
    let second = app
        .http
        .post(format!("{}/fraud/alerts/{id}/resolve", app.base_url))
        .json(&json!({
            "user_id": "analyst-2",
            "resolution": "false_positive",
            "notes": null,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 409);
    let error: Value = second.json().await.unwrap();
    assert_eq!(error["error"], "already_in_state");

    let current: Value = app
        .http
        .get(format!("{}/fraud/alerts/{id}", app.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(current["resolved_by"], "analyst-1");
    assert_eq!(current["resolution"], "confirmed_fraud");

    // The audit trail shows both applied transitions
    let audit: Value = app
        .http
        .get(format!("{}/fraud/alerts/{id}/audit", app.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(audit.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn overflow_drops_oldest_without_blocking_callers() {
    let app = spawn_app(|config| {
        config.buffer_capacity = 50;
        config.flush_high_watermark = 10_000; // no watermark flush
        config.flush_interval_ms = 3_600_000; // flusher never ticks
    })
    .await;

    for i in 0..300 {
        let response = submit(
            &app,
            event(&format!("burst-{i}"), "+2348031234567", "+2348099999999", "ringing"),
        )
        .await;
        assert_eq!(response.status(), 202, "submission must never be refused");
    }

    let stats: Value = app
        .http
        .get(format!("{}/fraud/stats", app.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["buffer"]["dropped"], 250);
    assert_eq!(stats["buffer"]["queued"], 50);
    assert_eq!(stats["buffer"]["submitted"], 300);
}

#[tokio::test]
async fn invalid_input_rejected_at_the_boundary() {
    let app = spawn_app(|_| {}).await;

    // Malformed MSISDN
    let bad_number = submit(&app, event("x", "12345", "+2348099999999", "ringing")).await;
    assert_eq!(bad_number.status(), 400);

    // Unknown status literal
    let bad_status = submit(&app, event("x", "+2348031234567", "+2348099999999", "ended")).await;
    assert_eq!(bad_status.status(), 400);

    // Batch with one bad element is rejected whole
    let batch = app
        .http
        .post(format!("{}/fraud/events/batch", app.base_url))
        .json(&json!([
            event("ok", "+2348031234567", "+2348099999999", "ringing"),
            event("bad", "not-a-number", "+2348099999999", "ringing"),
        ]))
        .send()
        .await
        .unwrap();
    assert_eq!(batch.status(), 400);

    // Nothing reached the detector
    let stats: Value = app
        .http
        .get(format!("{}/fraud/stats", app.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["detector"]["events_processed"], 0);
}

#[tokio::test]
async fn call_stats_flag_callees_with_many_unique_callers() {
    let app = spawn_app(|config| {
        // Keep events buffered so the registry view is stable
        config.flush_interval_ms = 3_600_000;
        config.flush_high_watermark = 10_000;
    })
    .await;

    let b = "+2348095555555";
    for i in 1..=5 {
        submit(&app, event(&format!("st-{i}"), &format!("+234801000000{i}"), b, "ringing")).await;
    }
    submit(&app, event("st-other", "+2348031234567", "+2348094444444", "active")).await;

    let stats: Value = app
        .http
        .get(format!("{}/fraud/calls/stats", app.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(stats["active_calls"], 6);
    let top = stats["top_b_numbers"].as_array().unwrap();
    let flagged = top.iter().find(|row| row["b_number"] == b).unwrap();
    assert_eq!(flagged["unique_a_numbers"], 5);
    assert_eq!(flagged["is_flagged"], true);
    let other = top.iter().find(|row| row["b_number"] == "+2348094444444").unwrap();
    assert_eq!(other["is_flagged"], false);

    let active: Value = app
        .http
        .get(format!("{}/fraud/calls/active", app.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(active["count"], 6);
}

#[tokio::test]
async fn raised_alerts_are_pushed_to_the_webhook_subscriber_and_exportable() {
    // Webhook subscriber stand-in
    let webhook_hits = Arc::new(AtomicU32::new(0));
    let hits_in = webhook_hits.clone();
    let hook_app = Router::new().route(
        "/hook",
        post(move |body: String| {
            let hits = hits_in.clone();
            async move {
                assert!(body.contains("\"event_type\":\"fraud_detected\""));
                hits.fetch_add(1, Ordering::SeqCst);
                axum::http::StatusCode::OK
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let hook_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, hook_app).await.unwrap();
    });

    let app = spawn_app(|config| {
        config.webhook_url = Some(format!("http://{hook_addr}/hook"));
    })
    .await;

    let b = "+2348093333333";
    for i in 1..=5 {
        submit(&app, event(&format!("wh-{i}"), &format!("+234801000000{i}"), b, "ringing")).await;
    }
    wait_for_alert(&app, "CLI_MASKING").await;

    for _ in 0..100 {
        if webhook_hits.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(webhook_hits.load(Ordering::SeqCst) >= 1);

    // CSV export carries the alert
    let export = app
        .http
        .get(format!("{}/fraud/alerts/export?format=csv", app.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(export.status(), 200);
    let csv = export.text().await.unwrap();
    assert!(csv.starts_with("id,call_id,event_type"));
    assert!(csv.contains("CLI_MASKING"));
    assert!(csv.contains(b));

    // And the stats endpoint aggregates by type
    let stats: Value = app
        .http
        .get(format!("{}/fraud/alerts/stats?period=24h", app.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(stats["total"].as_i64().unwrap() >= 1);
    let by_type = stats["by_type"].as_array().unwrap();
    assert!(by_type.iter().any(|t| t["event_type"] == "CLI_MASKING"));
}

#[tokio::test]
async fn detection_config_roundtrip_applies_new_thresholds() {
    let app = spawn_app(|_| {}).await;

    let mut config: Value = app
        .http
        .get(format!("{}/fraud/config", app.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(config["threshold_multi_caller"], 5);

    config["threshold_multi_caller"] = json!(3);
    let updated: Value = app
        .http
        .put(format!("{}/fraud/config", app.base_url))
        .json(&config)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(updated["threshold_multi_caller"], 3);

    // Three unique callers now trip the masking rule
    let b = "+2348092222222";
    for i in 1..=3 {
        submit(&app, event(&format!("cfg-{i}"), &format!("+234801000000{i}"), b, "ringing")).await;
    }
    let alert = wait_for_alert(&app, "CLI_MASKING").await;
    assert_eq!(alert["b_number"], b);
}
