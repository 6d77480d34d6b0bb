//! Mobile number portability lookups
//!
//! Read-only from the detector's point of view. Lookups go through a TTL
//! cache; numbers the clearinghouse does not know fall back to the
//! allocation-prefix operator, so a missing record never reads as a
//! mismatch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use acm_core::{Msisdn, Operator};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MnpRecord {
    pub msisdn: String,
    pub original_network: String,
    pub current_network: String,
    pub ported_at: Option<DateTime<Utc>>,
    pub clearinghouse_code: Option<String>,
}

/// Source of portability records (clearinghouse cache, store, test fixture)
#[async_trait]
pub trait MnpProvider: Send + Sync {
    async fn lookup(&self, msisdn: &Msisdn) -> Result<Option<MnpRecord>>;
}

/// Provider with no clearinghouse feed; every number resolves to its
/// allocation-prefix operator.
pub struct PrefixOnlyProvider;

#[async_trait]
impl MnpProvider for PrefixOnlyProvider {
    async fn lookup(&self, _msisdn: &Msisdn) -> Result<Option<MnpRecord>> {
        Ok(None)
    }
}

/// In-memory provider for tests and standalone deployments
#[derive(Default)]
pub struct MemoryMnpProvider {
    records: DashMap<String, MnpRecord>,
}

impl MemoryMnpProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: MnpRecord) {
        self.records.insert(record.msisdn.clone(), record);
    }
}

#[async_trait]
impl MnpProvider for MemoryMnpProvider {
    async fn lookup(&self, msisdn: &Msisdn) -> Result<Option<MnpRecord>> {
        Ok(self.records.get(msisdn.as_str()).map(|r| r.clone()))
    }
}

struct CachedNetwork {
    network: String,
    ported: bool,
    fetched: Instant,
}

/// The network currently hosting a number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostNetwork {
    pub network: String,
    pub ported: bool,
}

/// TTL-cached resolver in front of an [`MnpProvider`]
pub struct MnpResolver {
    provider: std::sync::Arc<dyn MnpProvider>,
    cache: DashMap<String, CachedNetwork>,
    ttl: Duration,
}

impl MnpResolver {
    pub fn new(provider: std::sync::Arc<dyn MnpProvider>, ttl: Duration) -> Self {
        Self {
            provider,
            cache: DashMap::new(),
            ttl,
        }
    }

    /// Current host network for a number. Provider failures degrade to the
    /// prefix operator rather than failing detection.
    pub async fn host_network(&self, msisdn: &Msisdn) -> HostNetwork {
        if let Some(cached) = self.cache.get(msisdn.as_str()) {
            if cached.fetched.elapsed() < self.ttl {
                return HostNetwork {
                    network: cached.network.clone(),
                    ported: cached.ported,
                };
            }
        }

        let resolved = match self.provider.lookup(msisdn).await {
            Ok(Some(record)) => HostNetwork {
                ported: record.current_network != record.original_network,
                network: record.current_network,
            },
            Ok(None) => HostNetwork {
                network: msisdn.operator().name().to_string(),
                ported: false,
            },
            Err(err) => {
                tracing::warn!(msisdn = %msisdn, error = %err, "MNP lookup failed, using prefix operator");
                HostNetwork {
                    network: msisdn.operator().name().to_string(),
                    ported: false,
                }
            }
        };

        self.cache.insert(
            msisdn.as_str().to_string(),
            CachedNetwork {
                network: resolved.network.clone(),
                ported: resolved.ported,
                fetched: Instant::now(),
            },
        );
        resolved
    }

    /// True when the allocation operator and the MNP host network disagree.
    /// Unknown operators never count as mismatches.
    pub async fn claims_mismatch(&self, msisdn: &Msisdn) -> bool {
        let claimed = msisdn.operator();
        if claimed == Operator::Unknown {
            return false;
        }
        let host = self.host_network(msisdn).await;
        host.ported && host.network != claimed.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn resolver_with(records: Vec<MnpRecord>) -> MnpResolver {
        let provider = MemoryMnpProvider::new();
        for record in records {
            provider.insert(record);
        }
        MnpResolver::new(Arc::new(provider), Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn unported_number_resolves_to_prefix_operator() {
        let resolver = resolver_with(vec![]);
        let msisdn = Msisdn::parse("+2348031234567").unwrap();
        let host = resolver.host_network(&msisdn).await;
        assert_eq!(host.network, "MTN");
        assert!(!host.ported);
        assert!(!resolver.claims_mismatch(&msisdn).await);
    }

    #[tokio::test]
    async fn ported_number_mismatches_allocation() {
        let resolver = resolver_with(vec![MnpRecord {
            msisdn: "+2348031234567".into(),
            original_network: "MTN".into(),
            current_network: "Airtel".into(),
            ported_at: Some(Utc::now()),
            clearinghouse_code: Some("D018".into()),
        }]);
        let msisdn = Msisdn::parse("+2348031234567").unwrap();
        let host = resolver.host_network(&msisdn).await;
        assert_eq!(host.network, "Airtel");
        assert!(host.ported);
        assert!(resolver.claims_mismatch(&msisdn).await);
    }

    #[tokio::test]
    async fn cache_serves_repeat_lookups() {
        let provider = Arc::new(MemoryMnpProvider::new());
        let resolver = MnpResolver::new(provider.clone(), Duration::from_secs(3600));
        let msisdn = Msisdn::parse("+2348031234567").unwrap();

        let first = resolver.host_network(&msisdn).await;
        // A record arriving after the first lookup is not visible until TTL
        provider.insert(MnpRecord {
            msisdn: "+2348031234567".into(),
            original_network: "MTN".into(),
            current_network: "Glo".into(),
            ported_at: Some(Utc::now()),
            clearinghouse_code: None,
        });
        let second = resolver.host_network(&msisdn).await;
        assert_eq!(first, second);
    }
}
