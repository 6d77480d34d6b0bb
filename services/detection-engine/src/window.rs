//! Sliding-window aggregation store
//!
//! Every event contributes to one ring of fixed-width buckets per
//! fingerprint. Rings are locked individually; structure-wide eviction runs
//! under its own lock. Distinct caller sets are exact up to a hard cap and
//! spill into a HyperLogLog sketch beyond it, so reads must honor the
//! `estimated` flag on cardinalities.

use acm_core::Counter;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use uuid::Uuid;

use crate::models::CallEvent;

/// Aggregation key for the window store
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Fingerprint {
    BNumber(String),
    SourceIp(IpAddr),
    Gateway(Uuid),
    /// Source IP combined with the caller's number-range prefix
    IpPrefix(IpAddr, String),
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BNumber(b) => write!(f, "b:{b}"),
            Self::SourceIp(ip) => write!(f, "ip:{ip}"),
            Self::Gateway(id) => write!(f, "gw:{id}"),
            Self::IpPrefix(ip, prefix) => write!(f, "ipp:{ip}:{prefix}"),
        }
    }
}

/// Flags computed once per event before it is recorded
#[derive(Debug, Clone, Copy, Default)]
pub struct EventFlags {
    /// Completed with duration under the Wangiri cutoff
    pub short_call: bool,
    /// Claimed network disagreed with the MNP record
    pub mnp_mismatch: bool,
}

// ============================================
// HyperLogLog sketch
// ============================================

const HLL_PRECISION: u32 = 10;
const HLL_REGISTERS: usize = 1 << HLL_PRECISION;

/// Fixed-size cardinality sketch absorbing distinct values past the exact
/// cap. Standard bias-corrected estimate, ~3% relative error at p=10.
#[derive(Clone)]
struct HllSketch {
    registers: Box<[u8; HLL_REGISTERS]>,
    nonzero: u32,
}

impl HllSketch {
    fn new() -> Self {
        Self {
            registers: Box::new([0u8; HLL_REGISTERS]),
            nonzero: 0,
        }
    }

    fn insert(&mut self, value: &str) {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        let hash = hasher.finish();

        let idx = (hash >> (64 - HLL_PRECISION)) as usize;
        let rest = hash << HLL_PRECISION;
        let rank = if rest == 0 {
            (64 - HLL_PRECISION + 1) as u8
        } else {
            rest.leading_zeros() as u8 + 1
        };
        if rank > self.registers[idx] {
            if self.registers[idx] == 0 {
                self.nonzero += 1;
            }
            self.registers[idx] = rank;
        }
    }

    fn merge(&mut self, other: &HllSketch) {
        for (slot, &rank) in self.registers.iter_mut().zip(other.registers.iter()) {
            if rank > *slot {
                if *slot == 0 {
                    self.nonzero += 1;
                }
                *slot = rank;
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.nonzero == 0
    }

    fn estimate(&self) -> u64 {
        if self.is_empty() {
            return 0;
        }
        let m = HLL_REGISTERS as f64;
        let alpha = 0.7213 / (1.0 + 1.079 / m);
        let sum: f64 = self
            .registers
            .iter()
            .map(|&r| 2f64.powi(-(r as i32)))
            .sum();
        let raw = alpha * m * m / sum;

        let zeros = HLL_REGISTERS as u32 - self.nonzero;
        if raw <= 2.5 * m && zeros > 0 {
            // Linear counting in the small range
            (m * (m / zeros as f64).ln()).round() as u64
        } else {
            raw.round() as u64
        }
    }
}

// ============================================
// Bounded distinct set
// ============================================

/// Exact set up to `cap`, sketch-counted beyond it
#[derive(Clone)]
pub struct DistinctSet {
    exact: HashSet<String>,
    sketch: Option<HllSketch>,
    cap: usize,
}

impl DistinctSet {
    pub fn new(cap: usize) -> Self {
        Self {
            exact: HashSet::new(),
            sketch: None,
            cap,
        }
    }

    pub fn insert(&mut self, value: &str) {
        if self.exact.contains(value) {
            return;
        }
        if self.exact.len() < self.cap {
            self.exact.insert(value.to_string());
        } else {
            self.sketch
                .get_or_insert_with(HllSketch::new)
                .insert(value);
        }
    }

    pub fn merge(&mut self, other: &DistinctSet) {
        for value in &other.exact {
            self.insert(value);
        }
        if let Some(other_sketch) = &other.sketch {
            match &mut self.sketch {
                Some(sketch) => sketch.merge(other_sketch),
                None => self.sketch = Some(other_sketch.clone()),
            }
        }
    }

    /// Cardinality plus whether the sketch contributed to it
    pub fn count(&self) -> (u64, bool) {
        match &self.sketch {
            Some(sketch) if !sketch.is_empty() => {
                (self.exact.len() as u64 + sketch.estimate(), true)
            }
            _ => (self.exact.len() as u64, false),
        }
    }

    /// The exactly-tracked members (the sketch cannot enumerate)
    pub fn members(&self) -> impl Iterator<Item = &str> {
        self.exact.iter().map(String::as_str)
    }

    fn clear(&mut self) {
        self.exact.clear();
        self.sketch = None;
    }
}

// ============================================
// Buckets and rings
// ============================================

const UNUSED: i64 = i64::MIN;

struct Bucket {
    /// Absolute bucket index this slot currently represents
    index: i64,
    count: u64,
    duration_sum: f64,
    duration_samples: u64,
    short_calls: u64,
    mnp_mismatches: u64,
    distinct_a: DistinctSet,
    /// Dedup of (call-id, status) deliveries inside this slice
    seen: HashSet<(String, u8)>,
    call_ids: HashSet<String>,
}

impl Bucket {
    fn new(cap: usize) -> Self {
        Self {
            index: UNUSED,
            count: 0,
            duration_sum: 0.0,
            duration_samples: 0,
            short_calls: 0,
            mnp_mismatches: 0,
            distinct_a: DistinctSet::new(cap),
            seen: HashSet::new(),
            call_ids: HashSet::new(),
        }
    }

    /// Zero a slot before it is reused for a new time range
    fn reset(&mut self, index: i64) {
        self.index = index;
        self.count = 0;
        self.duration_sum = 0.0;
        self.duration_samples = 0;
        self.short_calls = 0;
        self.mnp_mismatches = 0;
        self.distinct_a.clear();
        self.seen.clear();
        self.call_ids.clear();
    }
}

struct Ring {
    buckets: Vec<Bucket>,
    newest: i64,
}

impl Ring {
    fn new(size: usize, cap: usize) -> Self {
        Self {
            buckets: (0..size).map(|_| Bucket::new(cap)).collect(),
            newest: UNUSED,
        }
    }

    fn size(&self) -> i64 {
        self.buckets.len() as i64
    }

    /// Slot for an absolute index, resetting it if the slot held an older
    /// time range.
    fn bucket_mut(&mut self, index: i64) -> &mut Bucket {
        let size = self.size();
        let slot = (index.rem_euclid(size)) as usize;
        if self.buckets[slot].index != index {
            self.buckets[slot].reset(index);
        }
        &mut self.buckets[slot]
    }
}

struct FingerprintSlot {
    ring: Mutex<Ring>,
    /// Milliseconds since store creation, for LRU eviction
    touched: AtomicU64,
}

// ============================================
// Window store
// ============================================

#[derive(Debug, Clone)]
pub struct WindowStoreConfig {
    pub bucket_width_ms: u64,
    pub ring_size: usize,
    pub distinct_cap: usize,
    pub max_fingerprints: usize,
}

/// Aggregate over the most recent buckets of one fingerprint
#[derive(Debug, Clone)]
pub struct WindowAggregate {
    pub fingerprint: Fingerprint,
    pub count: u64,
    pub duration_sum: f64,
    pub duration_samples: u64,
    pub short_calls: u64,
    pub mnp_mismatches: u64,
    pub distinct_a: u64,
    pub distinct_estimated: bool,
    pub a_numbers: Vec<String>,
    pub call_ids: Vec<String>,
    /// Absolute index of the newest bucket; the dedup key for emissions
    pub newest_bucket: i64,
    pub window_secs: f64,
}

impl WindowAggregate {
    /// Average call duration over calls whose duration is known
    pub fn acd(&self) -> Option<f64> {
        if self.duration_samples == 0 {
            None
        } else {
            Some(self.duration_sum / self.duration_samples as f64)
        }
    }

    /// Count scaled to a per-minute rate
    pub fn per_minute(&self, count: u64) -> f64 {
        if self.window_secs <= 0.0 {
            return 0.0;
        }
        count as f64 * 60.0 / self.window_secs
    }
}

/// Per-fingerprint sliding windows with bounded memory
pub struct WindowStore {
    slots: DashMap<Fingerprint, FingerprintSlot>,
    config: WindowStoreConfig,
    epoch: Instant,
    /// Taken only when the fingerprint cap forces an eviction pass
    eviction: Mutex<()>,
    pub evicted_fingerprints: Counter,
    pub stale_events: Counter,
}

impl WindowStore {
    pub fn new(config: WindowStoreConfig) -> Self {
        Self {
            slots: DashMap::new(),
            config,
            epoch: Instant::now(),
            eviction: Mutex::new(()),
            evicted_fingerprints: Counter::new(),
            stale_events: Counter::new(),
        }
    }

    pub fn fingerprint_count(&self) -> usize {
        self.slots.len()
    }

    fn bucket_index(&self, event: &CallEvent) -> i64 {
        event.timestamp.timestamp_millis().div_euclid(self.config.bucket_width_ms as i64)
    }

    /// Fingerprints one event contributes to
    pub fn fingerprints_for(event: &CallEvent, gateway_id: Option<Uuid>) -> Vec<Fingerprint> {
        let mut fps = vec![Fingerprint::BNumber(event.b_number.as_str().to_string())];
        if let Some(ip) = event.source_ip {
            fps.push(Fingerprint::SourceIp(ip));
            fps.push(Fingerprint::IpPrefix(ip, event.a_number.prefix(4).to_string()));
        }
        if let Some(id) = gateway_id {
            fps.push(Fingerprint::Gateway(id));
        }
        fps
    }

    /// Record one event into every fingerprint it belongs to. Returns the
    /// touched fingerprints so the detector can evaluate exactly those.
    pub fn record(
        &self,
        event: &CallEvent,
        gateway_id: Option<Uuid>,
        flags: EventFlags,
    ) -> Vec<Fingerprint> {
        let index = self.bucket_index(event);
        let fingerprints = Self::fingerprints_for(event, gateway_id);
        for fp in &fingerprints {
            self.record_into(fp, index, event, flags);
        }
        self.maybe_evict();
        fingerprints
    }

    fn record_into(&self, fp: &Fingerprint, index: i64, event: &CallEvent, flags: EventFlags) {
        let slot = self
            .slots
            .entry(fp.clone())
            .or_insert_with(|| FingerprintSlot {
                ring: Mutex::new(Ring::new(self.config.ring_size, self.config.distinct_cap)),
                touched: AtomicU64::new(0),
            });
        slot.touched
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);

        let mut ring = slot.ring.lock();
        let mut index = index;
        if ring.newest == UNUSED || index > ring.newest {
            ring.newest = index;
        } else if index <= ring.newest - ring.size() {
            // Older than the live horizon: counted into the oldest live
            // bucket and flagged.
            index = ring.newest - ring.size() + 1;
            self.stale_events.inc();
        }

        let distinct_cap = self.config.distinct_cap;
        let bucket = ring.bucket_mut(index);
        let key = (event.call_id.clone(), event.status.ordinal());
        if bucket.seen.contains(&key) {
            return; // duplicate delivery (fast path + batch)
        }
        if bucket.seen.len() < distinct_cap * 4 {
            bucket.seen.insert(key);
        }

        bucket.count += 1;
        bucket.distinct_a.insert(event.a_number.as_str());
        if bucket.call_ids.len() < distinct_cap {
            bucket.call_ids.insert(event.call_id.clone());
        }
        if let Some(duration) = event.duration_secs {
            bucket.duration_sum += duration;
            bucket.duration_samples += 1;
        }
        if flags.short_call {
            bucket.short_calls += 1;
        }
        if flags.mnp_mismatch {
            bucket.mnp_mismatches += 1;
        }
    }

    /// Aggregate the last `window_secs` worth of buckets for a fingerprint.
    pub fn aggregate(&self, fp: &Fingerprint, window_secs: u64) -> Option<WindowAggregate> {
        let slot = self.slots.get(fp)?;
        let ring = slot.ring.lock();
        if ring.newest == UNUSED {
            return None;
        }

        let buckets_back =
            ((window_secs * 1000).div_ceil(self.config.bucket_width_ms) as i64).max(1);
        let span = buckets_back.min(ring.size());
        let oldest = ring.newest - span + 1;

        let mut agg = WindowAggregate {
            fingerprint: fp.clone(),
            count: 0,
            duration_sum: 0.0,
            duration_samples: 0,
            short_calls: 0,
            mnp_mismatches: 0,
            distinct_a: 0,
            distinct_estimated: false,
            a_numbers: Vec::new(),
            call_ids: Vec::new(),
            newest_bucket: ring.newest,
            window_secs: (span as u64 * self.config.bucket_width_ms) as f64 / 1000.0,
        };

        let mut distinct = DistinctSet::new(self.config.distinct_cap);
        let mut call_ids: HashSet<String> = HashSet::new();
        for bucket in &ring.buckets {
            if bucket.index == UNUSED || bucket.index < oldest || bucket.index > ring.newest {
                continue;
            }
            agg.count += bucket.count;
            agg.duration_sum += bucket.duration_sum;
            agg.duration_samples += bucket.duration_samples;
            agg.short_calls += bucket.short_calls;
            agg.mnp_mismatches += bucket.mnp_mismatches;
            distinct.merge(&bucket.distinct_a);
            for id in &bucket.call_ids {
                if call_ids.len() >= self.config.distinct_cap {
                    break;
                }
                call_ids.insert(id.clone());
            }
        }

        let (count, estimated) = distinct.count();
        agg.distinct_a = count;
        agg.distinct_estimated = estimated;
        agg.a_numbers = distinct.members().map(str::to_string).collect();
        agg.a_numbers.sort();
        agg.call_ids = call_ids.into_iter().collect();
        agg.call_ids.sort();
        Some(agg)
    }

    /// Evict the least-recently-updated fingerprints once the cap is hit.
    fn maybe_evict(&self) {
        if self.slots.len() <= self.config.max_fingerprints {
            return;
        }
        let Some(_guard) = self.eviction.try_lock() else {
            return; // another task is already evicting
        };
        let excess = self.slots.len().saturating_sub(self.config.max_fingerprints);
        if excess == 0 {
            return;
        }

        let mut by_age: Vec<(Fingerprint, u64)> = self
            .slots
            .iter()
            .map(|entry| (entry.key().clone(), entry.touched.load(Ordering::Relaxed)))
            .collect();
        by_age.sort_by_key(|(_, touched)| *touched);
        for (fp, _) in by_age.into_iter().take(excess) {
            self.slots.remove(&fp);
            self.evicted_fingerprints.inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CallStatus;
    use acm_core::Msisdn;
    use chrono::{DateTime, TimeZone, Utc};

    fn config() -> WindowStoreConfig {
        WindowStoreConfig {
            bucket_width_ms: 5_000,
            ring_size: 12,
            distinct_cap: 256,
            max_fingerprints: 1_000,
        }
    }

    fn event_at(call_id: &str, a: &str, b: &str, ts: DateTime<Utc>) -> CallEvent {
        CallEvent {
            call_id: call_id.into(),
            a_number: Msisdn::parse(a).unwrap(),
            b_number: Msisdn::parse(b).unwrap(),
            timestamp: ts,
            status: CallStatus::Ringing,
            source_ip: Some("10.1.2.3".parse().unwrap()),
            switch_id: None,
            direction: None,
            sip_method: None,
            user_agent: None,
            duration_secs: None,
        }
    }

    fn base_ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn counts_distinct_callers_per_callee() {
        let store = WindowStore::new(config());
        let ts = base_ts();
        for i in 0..5 {
            let a = format!("+234801000000{i}");
            store.record(
                &event_at(&format!("c{i}"), &a, "+2348099999999", ts),
                None,
                EventFlags::default(),
            );
        }

        let fp = Fingerprint::BNumber("+2348099999999".into());
        let agg = store.aggregate(&fp, 5).unwrap();
        assert_eq!(agg.count, 5);
        assert_eq!(agg.distinct_a, 5);
        assert!(!agg.distinct_estimated);
        assert_eq!(agg.a_numbers.len(), 5);
        assert_eq!(agg.call_ids.len(), 5);
    }

    #[test]
    fn duplicate_deliveries_count_once() {
        let store = WindowStore::new(config());
        let event = event_at("c1", "+2348010000001", "+2348099999999", base_ts());
        store.record(&event, None, EventFlags::default());
        store.record(&event, None, EventFlags::default());

        let fp = Fingerprint::BNumber("+2348099999999".into());
        let agg = store.aggregate(&fp, 5).unwrap();
        assert_eq!(agg.count, 1);
    }

    #[test]
    fn bucket_boundary_goes_to_newer_bucket() {
        let store = WindowStore::new(config());
        // Exactly on a 5 s boundary
        let ts = base_ts() + chrono::Duration::milliseconds(5_000);
        let event = event_at("c1", "+2348010000001", "+2348099999999", ts);
        let index = store.bucket_index(&event);
        assert_eq!(index, ts.timestamp_millis() / 5_000);
        // One millisecond earlier lands in the previous bucket
        let earlier = event_at("c2", "+2348010000001", "+2348099999999", ts - chrono::Duration::milliseconds(1));
        assert_eq!(store.bucket_index(&earlier), index - 1);
    }

    #[test]
    fn stale_slot_is_zeroed_on_reuse() {
        let store = WindowStore::new(config());
        let ts = base_ts();
        store.record(
            &event_at("c1", "+2348010000001", "+2348099999999", ts),
            None,
            EventFlags::default(),
        );
        // Advance a full ring so the slot is reused for a new range
        let much_later = ts + chrono::Duration::seconds(5 * 12);
        store.record(
            &event_at("c2", "+2348010000002", "+2348099999999", much_later),
            None,
            EventFlags::default(),
        );

        let fp = Fingerprint::BNumber("+2348099999999".into());
        let agg = store.aggregate(&fp, 5).unwrap();
        assert_eq!(agg.count, 1);
        assert_eq!(agg.a_numbers, vec!["+2348010000002".to_string()]);
    }

    #[test]
    fn events_older_than_horizon_flag_and_land_in_oldest_bucket() {
        let store = WindowStore::new(config());
        let ts = base_ts();
        store.record(
            &event_at("c1", "+2348010000001", "+2348099999999", ts),
            None,
            EventFlags::default(),
        );
        let ancient = ts - chrono::Duration::seconds(600);
        store.record(
            &event_at("c2", "+2348010000002", "+2348099999999", ancient),
            None,
            EventFlags::default(),
        );

        assert_eq!(store.stale_events.get(), 1);
        let fp = Fingerprint::BNumber("+2348099999999".into());
        let agg = store.aggregate(&fp, 60).unwrap();
        assert_eq!(agg.count, 2);
    }

    #[test]
    fn distinct_set_spills_into_sketch_past_cap() {
        let mut set = DistinctSet::new(64);
        for i in 0..1_000 {
            set.insert(&format!("+23480310{i:05}"));
        }
        let (count, estimated) = set.count();
        assert!(estimated);
        // 64 exact + ~936 sketched, within sketch error
        let error = (count as f64 - 1_000.0).abs() / 1_000.0;
        assert!(error < 0.15, "estimate {count} off by {error}");
    }

    #[test]
    fn distinct_set_exact_below_cap() {
        let mut set = DistinctSet::new(64);
        for i in 0..50 {
            set.insert(&format!("+23480310000{i:02}"));
        }
        // Repeats do not inflate the count
        set.insert("+2348031000001");
        assert_eq!(set.count(), (50, false));
    }

    #[test]
    fn fingerprint_eviction_respects_cap() {
        let mut cfg = config();
        cfg.max_fingerprints = 8;
        let store = WindowStore::new(cfg);
        let ts = base_ts();
        for i in 0..20 {
            let b = format!("+23480999990{i:02}");
            store.record(
                &event_at(&format!("c{i}"), "+2348010000001", &b, ts),
                None,
                EventFlags::default(),
            );
        }
        assert!(store.fingerprint_count() <= 8 + 3);
        assert!(store.evicted_fingerprints.get() > 0);
    }

    #[test]
    fn duration_and_short_call_accumulation() {
        let store = WindowStore::new(config());
        let ts = base_ts();
        let mut event = event_at("c1", "+2348010000001", "+2348099999999", ts);
        event.status = CallStatus::Completed;
        event.duration_secs = Some(2.0);
        store.record(&event, None, EventFlags { short_call: true, mnp_mismatch: false });

        let mut event2 = event_at("c2", "+2348010000002", "+2348099999999", ts);
        event2.status = CallStatus::Completed;
        event2.duration_secs = Some(8.0);
        store.record(&event2, None, EventFlags::default());

        let fp = Fingerprint::SourceIp("10.1.2.3".parse().unwrap());
        let agg = store.aggregate(&fp, 60).unwrap();
        assert_eq!(agg.short_calls, 1);
        assert_eq!(agg.duration_samples, 2);
        assert!((agg.acd().unwrap() - 5.0).abs() < f64::EPSILON);
    }
}
