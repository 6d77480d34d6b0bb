//! Gateway registry
//!
//! Read-mostly cache of gateway policy consulted on every rule evaluation.
//! The whole snapshot is swapped atomically on reload, bounding staleness to
//! the reload cadence.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::Config;
use crate::error::Result;
use crate::store::GatewayStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayType {
    Local,
    International,
    Transit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gateway {
    pub id: Uuid,
    pub name: String,
    pub ip: IpAddr,
    pub carrier: Option<String>,
    pub gateway_type: GatewayType,
    /// Alert confidence above which this gateway's traffic is enforced
    pub fraud_threshold: f64,
    pub cpm_limit: u64,
    pub acd_threshold_secs: f64,
    pub is_active: bool,
    pub is_blacklisted: bool,
    pub blacklist_reason: Option<String>,
    pub blacklist_expires_at: Option<DateTime<Utc>>,
}

impl Gateway {
    /// Clamp thresholds into their allowed ranges and enforce the
    /// blacklisted-implies-inactive invariant. Applied on every write path.
    pub fn normalized(mut self) -> Self {
        self.fraud_threshold = self.fraud_threshold.clamp(0.0, 1.0);
        self.cpm_limit = self.cpm_limit.clamp(1, 1_000);
        self.acd_threshold_secs = self.acd_threshold_secs.max(1.0);
        if self.is_blacklisted {
            self.is_active = false;
        }
        self
    }
}

/// Thresholds the detector applies for one event source
#[derive(Debug, Clone)]
pub struct GatewayPolicy {
    pub gateway_id: Option<Uuid>,
    pub cpm_limit: u64,
    pub acd_threshold_secs: f64,
    pub fraud_threshold: f64,
    pub gateway_blacklisted: bool,
}

struct Snapshot {
    by_id: HashMap<Uuid, Arc<Gateway>>,
    by_ip: HashMap<IpAddr, Arc<Gateway>>,
}

/// Atomic-swap cache of gateway entities indexed by id and ip
pub struct GatewayRegistry {
    snapshot: RwLock<Arc<Snapshot>>,
    store: Arc<dyn GatewayStore>,
    defaults: GatewayPolicy,
}

impl GatewayRegistry {
    pub fn new(store: Arc<dyn GatewayStore>, config: &Config) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Snapshot {
                by_id: HashMap::new(),
                by_ip: HashMap::new(),
            })),
            store,
            defaults: GatewayPolicy {
                gateway_id: None,
                cpm_limit: config.threshold_cpm,
                acd_threshold_secs: config.acd_threshold_seconds,
                fraud_threshold: 0.9,
                gateway_blacklisted: false,
            },
        }
    }

    fn current(&self) -> Arc<Snapshot> {
        self.snapshot.read().clone()
    }

    pub async fn reload(&self) -> Result<usize> {
        let gateways = crate::store::with_deadline(self.store.list_gateways()).await?;
        let mut by_id = HashMap::with_capacity(gateways.len());
        let mut by_ip = HashMap::with_capacity(gateways.len());
        for gateway in gateways {
            let gateway = Arc::new(gateway.normalized());
            by_ip.insert(gateway.ip, gateway.clone());
            by_id.insert(gateway.id, gateway);
        }
        let count = by_id.len();
        *self.snapshot.write() = Arc::new(Snapshot { by_id, by_ip });
        tracing::debug!(gateways = count, "Gateway snapshot reloaded");
        Ok(count)
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Gateway>> {
        self.current().by_id.get(&id).cloned()
    }

    pub fn get_by_ip(&self, ip: IpAddr) -> Option<Arc<Gateway>> {
        self.current().by_ip.get(&ip).cloned()
    }

    pub fn list(&self) -> Vec<Arc<Gateway>> {
        let mut gateways: Vec<_> = self.current().by_id.values().cloned().collect();
        gateways.sort_by(|a, b| a.name.cmp(&b.name));
        gateways
    }

    /// Per-gateway thresholds for the source, or the global defaults.
    pub fn policy_for(&self, source_ip: Option<IpAddr>) -> GatewayPolicy {
        let Some(ip) = source_ip else {
            return self.defaults.clone();
        };
        match self.get_by_ip(ip) {
            Some(gateway) => GatewayPolicy {
                gateway_id: Some(gateway.id),
                cpm_limit: gateway.cpm_limit,
                acd_threshold_secs: gateway.acd_threshold_secs,
                fraud_threshold: gateway.fraud_threshold,
                gateway_blacklisted: gateway.is_blacklisted
                    && !matches!(gateway.blacklist_expires_at, Some(expiry) if expiry <= Utc::now()),
            },
            None => self.defaults.clone(),
        }
    }
}
