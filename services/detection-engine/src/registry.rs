//! Active-call registry
//!
//! Concurrent index of currently ringing/answered dialogs keyed by call-id.
//! The disconnect dispatcher consults it before contacting the SBC, and the
//! reaper protects against lost terminal events.

use acm_core::{Gauge, Msisdn};
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::models::{ActiveCall, BNumberStats, CallEvent, CallStats};

struct Entry {
    call: ActiveCall,
    tracked_at: Instant,
}

/// Concurrent map of in-flight calls with hard-TTL reaping
pub struct ActiveCallRegistry {
    calls: DashMap<String, Entry>,
    ttl: Duration,
    active_gauge: Gauge,
}

impl ActiveCallRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            calls: DashMap::new(),
            ttl,
            active_gauge: Gauge::new(),
        }
    }

    /// Apply a call-state transition. Ringing/active upserts, terminal
    /// states remove. `started_at` is sticky on the first observation.
    pub fn apply(&self, event: &CallEvent) {
        if event.status.is_terminal() {
            self.calls.remove(&event.call_id);
        } else {
            match self.calls.entry(event.call_id.clone()) {
                dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                    let entry = occupied.get_mut();
                    entry.call.a_number = event.a_number.clone();
                    entry.call.b_number = event.b_number.clone();
                    entry.call.switch_id = event.switch_id.clone();
                    entry.call.status = event.status;
                }
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    vacant.insert(Entry {
                        call: ActiveCall {
                            call_id: event.call_id.clone(),
                            a_number: event.a_number.clone(),
                            b_number: event.b_number.clone(),
                            started_at: event.timestamp,
                            switch_id: event.switch_id.clone(),
                            status: event.status,
                        },
                        tracked_at: Instant::now(),
                    });
                }
            }
        }
        self.active_gauge.set(self.calls.len() as u64);
    }

    pub fn get(&self, call_id: &str) -> Option<ActiveCall> {
        self.calls.get(call_id).map(|e| e.call.clone())
    }

    pub fn remove(&self, call_id: &str) -> Option<ActiveCall> {
        let removed = self.calls.remove(call_id).map(|(_, e)| e.call);
        self.active_gauge.set(self.calls.len() as u64);
        removed
    }

    pub fn contains(&self, call_id: &str) -> bool {
        self.calls.contains_key(call_id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn snapshot(&self) -> Vec<ActiveCall> {
        self.calls.iter().map(|e| e.call.clone()).collect()
    }

    /// Number of in-flight calls toward one callee
    pub fn count_by_b(&self, b_number: &Msisdn) -> usize {
        self.calls
            .iter()
            .filter(|e| &e.call.b_number == b_number)
            .count()
    }

    /// Call-ids of in-flight calls toward one callee, for enforcement
    pub fn calls_toward(&self, b_number: &Msisdn) -> Vec<String> {
        self.calls
            .iter()
            .filter(|e| &e.call.b_number == b_number)
            .map(|e| e.call.call_id.clone())
            .collect()
    }

    /// Per-callee multiplicity snapshot; b-numbers with `flag_threshold`
    /// unique callers are flagged.
    pub fn stats(&self, flag_threshold: usize) -> CallStats {
        let mut by_b: HashMap<String, (usize, std::collections::HashSet<String>)> = HashMap::new();
        for entry in self.calls.iter() {
            let slot = by_b
                .entry(entry.call.b_number.as_str().to_string())
                .or_default();
            slot.0 += 1;
            slot.1.insert(entry.call.a_number.as_str().to_string());
        }

        let mut top_b_numbers: Vec<BNumberStats> = by_b
            .into_iter()
            .map(|(b_number, (call_count, a_numbers))| BNumberStats {
                b_number,
                call_count,
                unique_a_numbers: a_numbers.len(),
                is_flagged: a_numbers.len() >= flag_threshold,
            })
            .collect();
        top_b_numbers.sort_by(|a, b| b.unique_a_numbers.cmp(&a.unique_a_numbers));

        CallStats {
            active_calls: self.calls.len(),
            top_b_numbers,
        }
    }

    /// Remove entries older than the hard TTL. Returns how many were reaped.
    pub fn reap(&self) -> usize {
        let before = self.calls.len();
        let ttl = self.ttl;
        self.calls.retain(|_, e| e.tracked_at.elapsed() < ttl);
        let reaped = before - self.calls.len();
        if reaped > 0 {
            tracing::info!(reaped, "Reaped stale active calls");
        }
        self.active_gauge.set(self.calls.len() as u64);
        reaped
    }

    pub fn active_gauge(&self) -> &Gauge {
        &self.active_gauge
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CallStatus;
    use chrono::Utc;

    fn event(call_id: &str, a: &str, b: &str, status: CallStatus) -> CallEvent {
        CallEvent {
            call_id: call_id.into(),
            a_number: Msisdn::parse(a).unwrap(),
            b_number: Msisdn::parse(b).unwrap(),
            timestamp: Utc::now(),
            status,
            source_ip: None,
            switch_id: None,
            direction: None,
            sip_method: None,
            user_agent: None,
            duration_secs: None,
        }
    }

    #[test]
    fn upserts_and_removes_by_status() {
        let registry = ActiveCallRegistry::new(Duration::from_secs(7200));
        registry.apply(&event("c1", "08031234567", "08099999991", CallStatus::Ringing));
        assert!(registry.contains("c1"));

        registry.apply(&event("c1", "08031234567", "08099999991", CallStatus::Active));
        assert_eq!(registry.get("c1").unwrap().status, CallStatus::Active);

        registry.apply(&event("c1", "08031234567", "08099999991", CallStatus::Completed));
        assert!(!registry.contains("c1"));
    }

    #[test]
    fn started_at_is_sticky() {
        let registry = ActiveCallRegistry::new(Duration::from_secs(7200));
        let first = event("c1", "08031234567", "08099999991", CallStatus::Ringing);
        registry.apply(&first);

        let mut second = event("c1", "08031234567", "08099999991", CallStatus::Active);
        second.timestamp = first.timestamp + chrono::Duration::seconds(10);
        registry.apply(&second);

        assert_eq!(registry.get("c1").unwrap().started_at, first.timestamp);
    }

    #[test]
    fn counts_by_callee() {
        let registry = ActiveCallRegistry::new(Duration::from_secs(7200));
        let b = "08099999991";
        for (i, a) in ["08031234561", "08031234562", "08031234563"].iter().enumerate() {
            registry.apply(&event(&format!("c{i}"), a, b, CallStatus::Ringing));
        }
        registry.apply(&event("other", "08031234564", "08099999992", CallStatus::Ringing));

        let callee = Msisdn::parse(b).unwrap();
        assert_eq!(registry.count_by_b(&callee), 3);
        assert_eq!(registry.calls_toward(&callee).len(), 3);

        let stats = registry.stats(3);
        assert_eq!(stats.active_calls, 4);
        let flagged = stats.top_b_numbers.iter().find(|s| s.is_flagged).unwrap();
        assert_eq!(flagged.b_number, "+2348099999991");
        assert_eq!(flagged.unique_a_numbers, 3);
    }

    #[test]
    fn reaper_removes_expired_entries() {
        let registry = ActiveCallRegistry::new(Duration::from_millis(0));
        registry.apply(&event("c1", "08031234567", "08099999991", CallStatus::Ringing));
        assert_eq!(registry.reap(), 1);
        assert!(registry.is_empty());
    }
}
