//! Fraud detection rules
//!
//! The detector owns no call state: events flow through it into the window
//! store, and rules are evaluated against the touched fingerprints using
//! per-gateway thresholds with global fallback. Emissions are deduplicated
//! per (fingerprint, rule, window slice), so the at-least-once delivery
//! upstream never produces duplicate alerts.

use acm_core::{Counter, Histogram};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::alert::{AlertEventType, FraudAlert, Severity};
use crate::blacklist::BlacklistIndex;
use crate::config::Config;
use crate::gateway::{GatewayPolicy, GatewayRegistry};
use crate::mnp::MnpResolver;
use crate::models::{CallEvent, CallStatus};
use crate::window::{EventFlags, Fingerprint, WindowAggregate, WindowStore};

/// Completed calls shorter than this feed the Wangiri rule
const WANGIRI_SHORT_CALL_SECS: f64 = 3.0;

/// Steepness of the confidence curve over threshold excess
const CONFIDENCE_SLOPE: f64 = 2.0;

/// Detection thresholds, swapped atomically as one snapshot. A rule
/// evaluation keeps the snapshot it started with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionSettings {
    pub window_seconds: u64,
    pub masking_window_seconds: u64,
    pub threshold_multi_caller: u64,
    pub threshold_cpm: u64,
    pub acd_threshold_seconds: f64,
    pub threshold_simbox_cpm: u64,
    pub threshold_simbox_distinct: u64,
    pub threshold_wangiri: u64,
    pub threshold_mnp_mismatch: u64,
    pub auto_disconnect: bool,
}

impl DetectionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            window_seconds: config.window_seconds,
            masking_window_seconds: 5,
            threshold_multi_caller: config.threshold_multi_caller,
            threshold_cpm: config.threshold_cpm,
            acd_threshold_seconds: config.acd_threshold_seconds,
            threshold_simbox_cpm: config.threshold_simbox_cpm,
            threshold_simbox_distinct: config.threshold_simbox_distinct,
            threshold_wangiri: config.threshold_wangiri,
            threshold_mnp_mismatch: config.threshold_mnp_mismatch,
            auto_disconnect: config.auto_disconnect,
        }
    }
}

/// An alert the detector wants raised
#[derive(Debug, Clone)]
pub struct AlertCandidate {
    pub event_type: AlertEventType,
    pub call_id: String,
    pub a_numbers: Vec<String>,
    pub b_number: Option<String>,
    pub source_ip: Option<IpAddr>,
    pub gateway_id: Option<Uuid>,
    pub confidence: f64,
    pub severity: Severity,
    pub detection_method: String,
    pub matched_patterns: Vec<String>,
    pub contributing_call_ids: Vec<String>,
    /// Exact-mode distinct counts carry false; sketch-derived carry true
    pub distinct_estimated: bool,
    /// Fingerprint the rule fired on, part of the dedup key
    pub(crate) fingerprint: Fingerprint,
    /// Rule window quantum the emission belongs to; a fingerprint may
    /// re-alert once its window closes
    pub(crate) dedup_slice: i64,
}

impl AlertCandidate {
    pub fn should_auto_escalate(&self) -> bool {
        self.severity == Severity::Critical && self.confidence >= 0.95
    }

    pub fn into_alert(self) -> FraudAlert {
        FraudAlert::new(
            self.call_id,
            self.event_type,
            self.a_numbers,
            self.b_number,
            self.source_ip,
            self.gateway_id,
            self.confidence,
            self.detection_method,
            self.matched_patterns,
            self.contributing_call_ids,
        )
    }
}

/// Logistic confidence over threshold excess, clamped to [0.5, 0.99].
/// `ratio` is observation / threshold, so 1.0 sits exactly on the trigger.
fn confidence_from_ratio(ratio: f64) -> f64 {
    let logistic = 1.0 / (1.0 + (-CONFIDENCE_SLOPE * (ratio - 1.0)).exp());
    logistic.clamp(0.5, 0.99)
}

type DedupKey = (Fingerprint, AlertEventType, i64);

/// Fixed-size LRU of recent emissions
struct EmissionLru {
    seen: HashSet<DedupKey>,
    order: VecDeque<DedupKey>,
    capacity: usize,
}

impl EmissionLru {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// True when the key was not seen before (and is now recorded)
    fn insert(&mut self, key: DedupKey) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

/// Per-rule counters for the stats endpoint
#[derive(Debug, Clone, Default, Serialize)]
pub struct DetectorStats {
    pub events_processed: u64,
    pub alerts_emitted: u64,
    pub duplicates_suppressed: u64,
    pub stale_events: u64,
    pub evicted_fingerprints: u64,
    pub tracked_fingerprints: usize,
    pub detection_latency_us_p95: f64,
    pub primary_by_type: std::collections::HashMap<String, u64>,
    /// Which distinct-cardinality mode produced the counters
    pub distinct_mode: &'static str,
}

pub struct Detector {
    windows: Arc<WindowStore>,
    blacklist: Arc<BlacklistIndex>,
    gateways: Arc<GatewayRegistry>,
    mnp: Arc<MnpResolver>,
    settings: RwLock<Arc<DetectionSettings>>,
    dedup: Mutex<EmissionLru>,
    events_processed: Counter,
    alerts_emitted: Counter,
    duplicates_suppressed: Counter,
    latency: Histogram,
    primary_by_type: dashmap::DashMap<AlertEventType, Counter>,
}

impl Detector {
    pub fn new(
        windows: Arc<WindowStore>,
        blacklist: Arc<BlacklistIndex>,
        gateways: Arc<GatewayRegistry>,
        mnp: Arc<MnpResolver>,
        settings: DetectionSettings,
        dedup_capacity: usize,
    ) -> Self {
        Self {
            windows,
            blacklist,
            gateways,
            mnp,
            settings: RwLock::new(Arc::new(settings)),
            dedup: Mutex::new(EmissionLru::new(dedup_capacity)),
            events_processed: Counter::new(),
            alerts_emitted: Counter::new(),
            duplicates_suppressed: Counter::new(),
            latency: Histogram::new(),
            primary_by_type: dashmap::DashMap::new(),
        }
    }

    pub fn settings(&self) -> Arc<DetectionSettings> {
        self.settings.read().clone()
    }

    /// Swap in a new threshold snapshot. In-flight evaluations keep the one
    /// they started with.
    pub fn swap_settings(&self, settings: DetectionSettings) {
        *self.settings.write() = Arc::new(settings);
        tracing::info!("Detection settings updated");
    }

    pub async fn process_batch(&self, events: &[CallEvent]) -> Vec<AlertCandidate> {
        let mut candidates = Vec::new();
        for event in events {
            candidates.extend(self.process_event(event).await);
        }
        candidates
    }

    /// Run one event through the window store and every applicable rule.
    pub async fn process_event(&self, event: &CallEvent) -> Vec<AlertCandidate> {
        let started = Instant::now();
        let settings = self.settings();
        self.events_processed.inc();

        let mut candidates = Vec::new();
        self.check_blacklist(event, &mut candidates);

        let policy = self.gateways.policy_for(event.source_ip);
        let flags = EventFlags {
            short_call: event.status == CallStatus::Completed
                && matches!(event.duration_secs, Some(d) if d < WANGIRI_SHORT_CALL_SECS),
            mnp_mismatch: self.mnp.claims_mismatch(&event.a_number).await,
        };

        let fingerprints = self.windows.record(event, policy.gateway_id, flags);
        for fingerprint in fingerprints {
            self.evaluate_fingerprint(event, &fingerprint, &policy, &settings, &mut candidates);
        }
        for candidate in &mut candidates {
            candidate.gateway_id = candidate.gateway_id.or(policy.gateway_id);
        }

        let deduped = self.dedup_and_label(candidates);
        self.latency.record(started.elapsed().as_micros() as f64);
        deduped
    }

    fn check_blacklist(&self, event: &CallEvent, out: &mut Vec<AlertCandidate>) {
        let hit = self
            .blacklist
            .check_msisdn(&event.a_number)
            .or_else(|| self.blacklist.check_msisdn(&event.b_number))
            .or_else(|| event.source_ip.and_then(|ip| self.blacklist.check_ip(ip)));
        let Some(hit) = hit else { return };

        out.push(AlertCandidate {
            event_type: AlertEventType::BlacklistHit,
            call_id: event.call_id.clone(),
            a_numbers: vec![event.a_number.as_str().to_string()],
            b_number: Some(event.b_number.as_str().to_string()),
            source_ip: event.source_ip,
            gateway_id: None,
            confidence: 1.0,
            severity: Severity::Critical,
            detection_method: "blacklist_index".into(),
            matched_patterns: vec![format!("blacklist:{}:{}", hit.entry_type, hit.value)],
            contributing_call_ids: vec![event.call_id.clone()],
            distinct_estimated: false,
            fingerprint: Fingerprint::BNumber(event.b_number.as_str().to_string()),
            dedup_slice: event.timestamp.timestamp().div_euclid(60),
        });
    }

    fn evaluate_fingerprint(
        &self,
        event: &CallEvent,
        fingerprint: &Fingerprint,
        policy: &GatewayPolicy,
        settings: &DetectionSettings,
        out: &mut Vec<AlertCandidate>,
    ) {
        match fingerprint {
            Fingerprint::BNumber(_) => {
                if let Some(agg) = self
                    .windows
                    .aggregate(fingerprint, settings.masking_window_seconds)
                {
                    self.rule_multi_caller(event, &agg, settings, out);
                }
                if let Some(agg) = self.windows.aggregate(fingerprint, settings.window_seconds) {
                    self.rule_cpm(event, &agg, settings.threshold_cpm, out);
                }
            }
            Fingerprint::SourceIp(_) => {
                let Some(agg) = self.windows.aggregate(fingerprint, settings.window_seconds)
                else {
                    return;
                };
                self.rule_simbox(event, &agg, policy, settings, out);
                self.rule_wangiri(event, &agg, settings, out);
                self.rule_acd_low(event, &agg, policy, out);
                self.rule_cpm(event, &agg, policy.cpm_limit, out);
            }
            Fingerprint::Gateway(_) => {
                let Some(agg) = self.windows.aggregate(fingerprint, settings.window_seconds)
                else {
                    return;
                };
                self.rule_cpm(event, &agg, policy.cpm_limit, out);
                self.rule_acd_low(event, &agg, policy, out);
            }
            Fingerprint::IpPrefix(_, _) => {
                let Some(agg) = self.windows.aggregate(fingerprint, settings.window_seconds)
                else {
                    return;
                };
                self.rule_refiling(event, &agg, settings, out);
            }
        }
    }

    fn candidate_from(
        event: &CallEvent,
        agg: &WindowAggregate,
        event_type: AlertEventType,
        confidence: f64,
        method: &str,
        rule_window_secs: u64,
        matched_patterns: Vec<String>,
    ) -> AlertCandidate {
        AlertCandidate {
            event_type,
            call_id: event.call_id.clone(),
            a_numbers: agg.a_numbers.clone(),
            b_number: Some(event.b_number.as_str().to_string()),
            source_ip: event.source_ip,
            gateway_id: match agg.fingerprint {
                Fingerprint::Gateway(id) => Some(id),
                _ => None,
            },
            confidence,
            severity: Severity::from_confidence(confidence),
            detection_method: method.into(),
            matched_patterns,
            contributing_call_ids: agg.call_ids.clone(),
            distinct_estimated: agg.distinct_estimated,
            fingerprint: agg.fingerprint.clone(),
            dedup_slice: event
                .timestamp
                .timestamp()
                .div_euclid(rule_window_secs.max(1) as i64),
        }
    }

    /// Many distinct callers funneled to one callee in a short window
    fn rule_multi_caller(
        &self,
        event: &CallEvent,
        agg: &WindowAggregate,
        settings: &DetectionSettings,
        out: &mut Vec<AlertCandidate>,
    ) {
        let threshold = settings.threshold_multi_caller;
        if threshold == 0 || agg.distinct_a < threshold || agg.count < threshold {
            return;
        }
        let ratio = (agg.distinct_a as f64 / threshold as f64
            + agg.count as f64 / threshold as f64)
            / 2.0;
        out.push(Self::candidate_from(
            event,
            agg,
            AlertEventType::CliMasking,
            confidence_from_ratio(ratio),
            "sliding_window",
            settings.masking_window_seconds,
            vec![format!(
                "MULTI_CALLER_MASKING:{}_unique_a_in_{}s",
                agg.distinct_a, settings.masking_window_seconds
            )],
        ));
    }

    /// Raw call rate through a fingerprint
    fn rule_cpm(
        &self,
        event: &CallEvent,
        agg: &WindowAggregate,
        limit: u64,
        out: &mut Vec<AlertCandidate>,
    ) {
        if limit == 0 {
            return;
        }
        let per_minute = agg.per_minute(agg.count);
        if per_minute <= limit as f64 {
            return;
        }
        out.push(Self::candidate_from(
            event,
            agg,
            AlertEventType::CpmExceeded,
            confidence_from_ratio(per_minute / limit as f64),
            "sliding_window",
            agg.window_secs as u64,
            vec![format!("CPM_EXCEEDED:{per_minute:.0}_of_{limit}")],
        ));
    }

    /// High rate + low ACD + many rotating callers behind one source
    fn rule_simbox(
        &self,
        event: &CallEvent,
        agg: &WindowAggregate,
        policy: &GatewayPolicy,
        settings: &DetectionSettings,
        out: &mut Vec<AlertCandidate>,
    ) {
        let Some(acd) = agg.acd() else { return };
        let per_minute = agg.per_minute(agg.count);
        let acd_threshold = policy.acd_threshold_secs.min(settings.acd_threshold_seconds);

        if per_minute < settings.threshold_simbox_cpm as f64
            || acd >= acd_threshold
            || agg.distinct_a < settings.threshold_simbox_distinct
        {
            return;
        }

        let cpm_ratio = per_minute / settings.threshold_simbox_cpm as f64;
        let acd_ratio = acd_threshold / acd.max(0.1);
        let distinct_ratio = agg.distinct_a as f64 / settings.threshold_simbox_distinct as f64;
        let ratio = (cpm_ratio + acd_ratio + distinct_ratio) / 3.0;

        out.push(Self::candidate_from(
            event,
            agg,
            AlertEventType::Simbox,
            confidence_from_ratio(ratio),
            "sliding_window",
            agg.window_secs as u64,
            vec![
                format!("CPM_EXCEEDED:{per_minute:.0}_of_{}", settings.threshold_simbox_cpm),
                format!("ACD_LOW:{acd:.1}s_under_{acd_threshold:.1}s"),
                format!("HIGH_UNIQUE_A:{}", agg.distinct_a),
            ],
        ));
    }

    /// Sub-3-second completions across rotating caller identities
    fn rule_wangiri(
        &self,
        event: &CallEvent,
        agg: &WindowAggregate,
        settings: &DetectionSettings,
        out: &mut Vec<AlertCandidate>,
    ) {
        let short_per_minute = agg.per_minute(agg.short_calls);
        if short_per_minute < settings.threshold_wangiri as f64 || agg.distinct_a < 2 {
            return;
        }
        out.push(Self::candidate_from(
            event,
            agg,
            AlertEventType::Wangiri,
            confidence_from_ratio(short_per_minute / settings.threshold_wangiri as f64),
            "sliding_window",
            agg.window_secs as u64,
            vec![format!(
                "WANGIRI:{}_short_calls_{}_unique_a",
                agg.short_calls, agg.distinct_a
            )],
        ));
    }

    /// Sustained low average duration
    fn rule_acd_low(
        &self,
        event: &CallEvent,
        agg: &WindowAggregate,
        policy: &GatewayPolicy,
        out: &mut Vec<AlertCandidate>,
    ) {
        let Some(acd) = agg.acd() else { return };
        if agg.count < 10 || acd >= policy.acd_threshold_secs {
            return;
        }
        out.push(Self::candidate_from(
            event,
            agg,
            AlertEventType::AcdLow,
            confidence_from_ratio(policy.acd_threshold_secs / acd.max(0.1)),
            "sliding_window",
            agg.window_secs as u64,
            vec![format!("ACD_LOW:{acd:.1}s_under_{:.1}s", policy.acd_threshold_secs)],
        ));
    }

    /// Claimed network repeatedly disagreeing with MNP inside the window
    fn rule_refiling(
        &self,
        event: &CallEvent,
        agg: &WindowAggregate,
        settings: &DetectionSettings,
        out: &mut Vec<AlertCandidate>,
    ) {
        let mismatches_per_minute = agg.per_minute(agg.mnp_mismatches);
        if mismatches_per_minute < settings.threshold_mnp_mismatch as f64 {
            return;
        }
        out.push(Self::candidate_from(
            event,
            agg,
            AlertEventType::Refiling,
            confidence_from_ratio(
                mismatches_per_minute / settings.threshold_mnp_mismatch as f64,
            ),
            "mnp_lookup",
            agg.window_secs as u64,
            vec![format!("MNP_MISMATCH:{}_in_window", agg.mnp_mismatches)],
        ));
    }

    /// Suppress repeats per (fingerprint, rule, window slice) and count the
    /// primary label of whatever survives.
    fn dedup_and_label(&self, candidates: Vec<AlertCandidate>) -> Vec<AlertCandidate> {
        if candidates.is_empty() {
            return candidates;
        }

        let mut emitted = Vec::new();
        {
            let mut dedup = self.dedup.lock();
            for candidate in candidates {
                let key = (
                    candidate.fingerprint.clone(),
                    candidate.event_type,
                    candidate.dedup_slice,
                );
                if dedup.insert(key) {
                    emitted.push(candidate);
                } else {
                    self.duplicates_suppressed.inc();
                }
            }
        }

        if let Some(primary) = emitted.iter().min_by_key(|c| c.event_type.precedence()) {
            self.primary_by_type
                .entry(primary.event_type)
                .or_default()
                .inc();
        }
        self.alerts_emitted.add(emitted.len() as u64);
        emitted
    }

    pub fn stats(&self) -> DetectorStats {
        DetectorStats {
            events_processed: self.events_processed.get(),
            alerts_emitted: self.alerts_emitted.get(),
            duplicates_suppressed: self.duplicates_suppressed.get(),
            stale_events: self.windows.stale_events.get(),
            evicted_fingerprints: self.windows.evicted_fingerprints.get(),
            tracked_fingerprints: self.windows.fingerprint_count(),
            detection_latency_us_p95: self.latency.percentile(95.0),
            primary_by_type: self
                .primary_by_type
                .iter()
                .map(|e| (e.key().as_str().to_string(), e.value().get()))
                .collect(),
            distinct_mode: "exact_capped_with_hll_overflow",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blacklist::{BlacklistEntry, BlacklistSource, EntryType};
    use crate::mnp::{MemoryMnpProvider, MnpRecord, MnpResolver};
    use crate::store::MemoryStore;
    use crate::window::WindowStoreConfig;
    use acm_core::Msisdn;
    use chrono::{DateTime, TimeZone, Utc};
    use std::time::Duration;

    struct Fixture {
        detector: Detector,
        mnp: Arc<MemoryMnpProvider>,
    }

    fn fixture() -> Fixture {
        let config = Config::default();
        let store = Arc::new(MemoryStore::new());
        let windows = Arc::new(WindowStore::new(WindowStoreConfig {
            bucket_width_ms: config.bucket_width_ms,
            ring_size: 16,
            distinct_cap: config.distinct_cap,
            max_fingerprints: config.max_fingerprints,
        }));
        let blacklist = Arc::new(BlacklistIndex::new(store.clone()));
        let gateways = Arc::new(GatewayRegistry::new(store.clone(), &config));
        let mnp_provider = Arc::new(MemoryMnpProvider::new());
        let mnp = Arc::new(MnpResolver::new(mnp_provider.clone(), Duration::from_secs(3600)));
        let detector = Detector::new(
            windows,
            blacklist,
            gateways,
            mnp,
            DetectionSettings::from_config(&config),
            config.dedup_capacity,
        );
        Fixture {
            detector,
            mnp: mnp_provider,
        }
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn event(call_id: &str, a: &str, b: &str, at: DateTime<Utc>) -> CallEvent {
        CallEvent {
            call_id: call_id.into(),
            a_number: Msisdn::parse(a).unwrap(),
            b_number: Msisdn::parse(b).unwrap(),
            timestamp: at,
            status: CallStatus::Ringing,
            source_ip: Some("10.1.2.3".parse().unwrap()),
            switch_id: None,
            direction: None,
            sip_method: None,
            user_agent: None,
            duration_secs: None,
        }
    }

    #[tokio::test]
    async fn five_unique_callers_trigger_cli_masking_four_do_not() {
        let fx = fixture();
        let base = ts();
        let b = "+2348099999999";

        let mut all = Vec::new();
        for i in 0..4 {
            let a = format!("+234801000000{}", i + 1);
            all.extend(
                fx.detector
                    .process_event(&event(&format!("c{i}"), &a, b, base))
                    .await,
            );
        }
        assert!(
            !all.iter().any(|c| c.event_type == AlertEventType::CliMasking),
            "four unique callers must not trigger masking"
        );

        let fifth = fx
            .detector
            .process_event(&event("c4", "+2348010000005", b, base))
            .await;
        let masking = fifth
            .iter()
            .find(|c| c.event_type == AlertEventType::CliMasking)
            .expect("fifth unique caller triggers masking");
        assert!(masking.severity >= Severity::Medium);
        assert_eq!(masking.a_numbers.len(), 5);
        assert_eq!(masking.b_number.as_deref(), Some(b));
        assert_eq!(masking.contributing_call_ids.len(), 5);
        assert!(!masking.distinct_estimated);
    }

    #[tokio::test]
    async fn masking_is_deduplicated_within_window_slice() {
        let fx = fixture();
        let base = ts();
        let b = "+2348099999999";
        for i in 0..5 {
            let a = format!("+234801000000{}", i + 1);
            fx.detector
                .process_event(&event(&format!("c{i}"), &a, b, base))
                .await;
        }
        // A sixth caller in the same slice re-trips the rule but the
        // emission is suppressed.
        let sixth = fx
            .detector
            .process_event(&event("c6", "+2348010000006", b, base + chrono::Duration::seconds(1)))
            .await;
        assert!(!sixth.iter().any(|c| c.event_type == AlertEventType::CliMasking));
        assert!(fx.detector.stats().duplicates_suppressed > 0);
    }

    #[tokio::test]
    async fn simbox_signature_from_one_source() {
        let fx = fixture();
        let base = ts();
        let mut simbox = None;
        for i in 0..40 {
            let a = format!("+23480100000{:02}", i % 20);
            let mut e = event(&format!("s{i}"), &a, "+2348088888888", base + chrono::Duration::seconds(i));
            e.status = CallStatus::Completed;
            e.duration_secs = Some(5.0);
            let out = fx.detector.process_event(&e).await;
            if let Some(c) = out.into_iter().find(|c| c.event_type == AlertEventType::Simbox) {
                simbox = Some(c);
            }
        }
        let simbox = simbox.expect("simbox signature detected");
        assert_eq!(simbox.severity, Severity::High);
        assert!(simbox.matched_patterns.iter().any(|p| p.starts_with("CPM_EXCEEDED")));
        assert!(simbox.matched_patterns.iter().any(|p| p.starts_with("ACD_LOW")));
    }

    #[tokio::test]
    async fn blacklisted_caller_is_critical_with_full_confidence() {
        let fx = fixture();
        fx.detector
            .blacklist
            .add(BlacklistEntry::new(
                EntryType::Msisdn,
                "+2348012345678".into(),
                Some("known simbox".into()),
                BlacklistSource::Regulator,
                "ncc-sync".into(),
                None,
            ))
            .await
            .unwrap();

        let out = fx
            .detector
            .process_event(&event("c1", "+2348012345678", "+2348099999999", ts()))
            .await;
        let hit = out
            .iter()
            .find(|c| c.event_type == AlertEventType::BlacklistHit)
            .expect("blacklist hit");
        assert!((hit.confidence - 1.0).abs() < f64::EPSILON);
        assert_eq!(hit.severity, Severity::Critical);
        assert!(hit.should_auto_escalate());
    }

    #[tokio::test]
    async fn wangiri_needs_short_completions_and_rotation() {
        let fx = fixture();
        let base = ts();
        let mut wangiri = None;
        for i in 0..12 {
            let a = format!("+23480100001{:02}", i);
            let mut e = event(&format!("w{i}"), &a, &format!("+23480999990{:02}", i), base + chrono::Duration::seconds(i));
            e.status = CallStatus::Completed;
            e.duration_secs = Some(1.5);
            let out = fx.detector.process_event(&e).await;
            if let Some(c) = out.into_iter().find(|c| c.event_type == AlertEventType::Wangiri) {
                wangiri = Some(c);
            }
        }
        assert!(wangiri.is_some(), "rotating short completions trigger wangiri");

        // Long calls never do
        let fx2 = fixture();
        let mut any = Vec::new();
        for i in 0..12 {
            let a = format!("+23480100001{:02}", i);
            let mut e = event(&format!("l{i}"), &a, "+2348099999999", base + chrono::Duration::seconds(i));
            e.status = CallStatus::Completed;
            e.duration_secs = Some(60.0);
            any.extend(fx2.detector.process_event(&e).await);
        }
        assert!(!any.iter().any(|c| c.event_type == AlertEventType::Wangiri));
    }

    #[tokio::test]
    async fn refiling_counts_mnp_mismatches_in_window() {
        let fx = fixture();
        // Numbers allocated to MTN but currently hosted by Airtel
        for i in 0..4 {
            fx.mnp.insert(MnpRecord {
                msisdn: format!("+234803123456{i}"),
                original_network: "MTN".into(),
                current_network: "Airtel".into(),
                ported_at: Some(ts()),
                clearinghouse_code: Some("D018".into()),
            });
        }

        let base = ts();
        let mut refiling = None;
        for i in 0..4 {
            let a = format!("+234803123456{i}");
            let out = fx
                .detector
                .process_event(&event(&format!("r{i}"), &a, "+2348099999999", base + chrono::Duration::seconds(i)))
                .await;
            if let Some(c) = out.into_iter().find(|c| c.event_type == AlertEventType::Refiling) {
                refiling = Some(c);
            }
        }
        let refiling = refiling.expect("refiling detected");
        assert!(refiling.matched_patterns[0].starts_with("MNP_MISMATCH"));
    }

    #[tokio::test]
    async fn cpm_boundary_at_limit_no_alert_above_alert() {
        let mut config = Config::default();
        config.threshold_cpm = 10;
        config.threshold_multi_caller = 1_000; // keep masking quiet
        config.threshold_simbox_cpm = 1_000;
        config.threshold_wangiri = 1_000;

        let store = Arc::new(MemoryStore::new());
        let windows = Arc::new(WindowStore::new(WindowStoreConfig {
            bucket_width_ms: config.bucket_width_ms,
            ring_size: 16,
            distinct_cap: config.distinct_cap,
            max_fingerprints: config.max_fingerprints,
        }));
        let detector = Detector::new(
            windows,
            Arc::new(BlacklistIndex::new(store.clone())),
            Arc::new(GatewayRegistry::new(store.clone(), &config)),
            Arc::new(MnpResolver::new(Arc::new(MemoryMnpProvider::new()), Duration::from_secs(60))),
            DetectionSettings::from_config(&config),
            config.dedup_capacity,
        );

        // 10 calls in 60 s = exactly the limit: no alert
        let base = ts();
        let mut all = Vec::new();
        for i in 0..10 {
            all.extend(
                detector
                    .process_event(&event(
                        &format!("c{i}"),
                        "+2348010000001",
                        "+2348099999999",
                        base + chrono::Duration::seconds(i * 5),
                    ))
                    .await,
            );
        }
        assert!(!all.iter().any(|c| c.event_type == AlertEventType::CpmExceeded));

        // The eleventh call pushes the rate past the limit
        let out = detector
            .process_event(&event("c11", "+2348010000001", "+2348099999999", base + chrono::Duration::seconds(55)))
            .await;
        assert!(out.iter().any(|c| c.event_type == AlertEventType::CpmExceeded));
    }

    #[test]
    fn confidence_curve_shape() {
        assert!((confidence_from_ratio(1.0) - 0.5).abs() < 1e-9);
        assert!(confidence_from_ratio(1.5) > 0.7);
        assert!(confidence_from_ratio(3.0) <= 0.99);
        assert!(confidence_from_ratio(0.5) >= 0.5);
    }

    #[test]
    fn emission_lru_evicts_oldest() {
        let mut lru = EmissionLru::new(2);
        let key = |i: i64| {
            (
                Fingerprint::BNumber(format!("+234809999999{i}")),
                AlertEventType::CliMasking,
                i,
            )
        };
        assert!(lru.insert(key(1)));
        assert!(!lru.insert(key(1)));
        assert!(lru.insert(key(2)));
        assert!(lru.insert(key(3))); // evicts key(1)
        assert!(lru.insert(key(1)));
    }
}
