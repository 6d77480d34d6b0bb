//! Configuration for the detection engine
//!
//! Loaded once from the environment at startup into an immutable snapshot.
//! Components hold `Arc<Config>`; a rule evaluation keeps the snapshot it
//! started with even if a newer one is swapped in.

use std::net::SocketAddr;
use std::time::Duration;

/// Detection engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP bind address
    pub host: String,
    /// HTTP port
    pub port: u16,
    /// Postgres connection string; empty selects the in-memory store
    pub database_url: String,
    /// SBC JSON-RPC endpoint for dialog termination
    pub sbc_rpc_url: String,
    /// Per-call SBC request timeout (milliseconds)
    pub sbc_timeout_ms: u64,
    /// Subscriber URL for outbound alert webhooks; unset disables them
    pub webhook_url: Option<String>,

    /// Event buffer periodic flush cadence (milliseconds)
    pub flush_interval_ms: u64,
    /// Size-based flush threshold
    pub flush_high_watermark: usize,
    /// Hard capacity of the event buffer; oldest events dropped beyond it
    pub buffer_capacity: usize,

    /// Sliding window horizon per fingerprint (seconds)
    pub window_seconds: u64,
    /// Fixed bucket width (milliseconds)
    pub bucket_width_ms: u64,
    /// Cap on tracked fingerprints before LRU eviction
    pub max_fingerprints: usize,
    /// Exact distinct-set cap per fingerprint window bucket
    pub distinct_cap: usize,

    /// Unique-A threshold for CLI masking
    pub threshold_multi_caller: u64,
    /// Global CPM limit (per-gateway override allowed)
    pub threshold_cpm: u64,
    /// Minimum acceptable average call duration (seconds)
    pub acd_threshold_seconds: f64,
    /// Per-source event count for the SIM-box signature (per minute)
    pub threshold_simbox_cpm: u64,
    /// Distinct-A floor for the SIM-box signature
    pub threshold_simbox_distinct: u64,
    /// Short-call count for Wangiri (per minute)
    pub threshold_wangiri: u64,
    /// In-window MNP mismatch count for refiling
    pub threshold_mnp_mismatch: u64,
    /// Dedup LRU size for alert emissions
    pub dedup_capacity: usize,

    /// Dispatch automatically for enforceable alerts
    pub auto_disconnect: bool,
    /// Auto-escalation poll cadence (seconds)
    pub escalation_interval_secs: u64,

    /// Hard reap age for the active-call registry (seconds)
    pub active_call_ttl_seconds: u64,
    /// Blacklist refresh cadence (seconds)
    pub blacklist_reload_seconds: u64,
    /// Gateway registry refresh cadence (seconds)
    pub gateway_reload_seconds: u64,
    /// MNP cache TTL (seconds)
    pub mnp_cache_ttl_seconds: u64,

    /// Shutdown grace period (seconds)
    pub shutdown_grace_seconds: u64,
    /// Log level when RUST_LOG is unset
    pub log_level: String,
    /// Emit JSON logs
    pub json_logs: bool,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw}: {e}")),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            host: env_or("HOST", "0.0.0.0".to_string())?,
            port: env_or("PORT", 8086u16)?,
            database_url: std::env::var("DATABASE_URL").unwrap_or_default(),
            sbc_rpc_url: env_or("SBC_RPC_URL", "http://kamailio-sbc:5060/RPC".to_string())?,
            sbc_timeout_ms: env_or("SBC_TIMEOUT_MS", 5_000)?,
            webhook_url: std::env::var("WEBHOOK_URL").ok().filter(|v| !v.is_empty()),

            flush_interval_ms: env_or("FLUSH_INTERVAL_MS", 100)?,
            flush_high_watermark: env_or("FLUSH_HIGH_WATERMARK", 50)?,
            buffer_capacity: env_or("BUFFER_CAPACITY", 10_000)?,

            window_seconds: env_or("WINDOW_SECONDS", 60)?,
            bucket_width_ms: env_or("BUCKET_WIDTH_MS", 5_000)?,
            max_fingerprints: env_or("MAX_FINGERPRINTS", 100_000)?,
            distinct_cap: env_or("DISTINCT_CAP", 256)?,

            threshold_multi_caller: env_or("THRESHOLD_MULTI_CALLER", 5)?,
            threshold_cpm: env_or("THRESHOLD_CPM", 60)?,
            acd_threshold_seconds: env_or("ACD_THRESHOLD_SECONDS", 10.0)?,
            threshold_simbox_cpm: env_or("THRESHOLD_SIMBOX_CPM", 30)?,
            threshold_simbox_distinct: env_or("THRESHOLD_SIMBOX_DISTINCT", 10)?,
            threshold_wangiri: env_or("THRESHOLD_WANGIRI", 10)?,
            threshold_mnp_mismatch: env_or("THRESHOLD_MNP_MISMATCH", 3)?,
            dedup_capacity: env_or("DEDUP_CAPACITY", 10_000)?,

            auto_disconnect: env_or("AUTO_DISCONNECT", false)?,
            escalation_interval_secs: env_or("ESCALATION_INTERVAL_SECS", 2)?,

            active_call_ttl_seconds: env_or("ACTIVE_CALL_TTL_SECONDS", 7_200)?,
            blacklist_reload_seconds: env_or("BLACKLIST_RELOAD_SECONDS", 30)?,
            gateway_reload_seconds: env_or("GATEWAY_RELOAD_SECONDS", 30)?,
            mnp_cache_ttl_seconds: env_or("MNP_CACHE_TTL_SECONDS", 3_600)?,

            shutdown_grace_seconds: env_or("SHUTDOWN_GRACE_SECONDS", 30)?,
            log_level: env_or("LOG_LEVEL", "info".to_string())?,
            json_logs: env_or("JSON_LOGS", true)?,
        })
    }

    /// Get socket address for binding
    pub fn bind_address(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid bind address: {e}"))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn bucket_width(&self) -> Duration {
        Duration::from_millis(self.bucket_width_ms)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    pub fn sbc_timeout(&self) -> Duration {
        Duration::from_millis(self.sbc_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8086,
            database_url: String::new(),
            sbc_rpc_url: "http://127.0.0.1:5060/RPC".to_string(),
            sbc_timeout_ms: 5_000,
            webhook_url: None,
            flush_interval_ms: 100,
            flush_high_watermark: 50,
            buffer_capacity: 10_000,
            window_seconds: 60,
            bucket_width_ms: 5_000,
            max_fingerprints: 100_000,
            distinct_cap: 256,
            threshold_multi_caller: 5,
            threshold_cpm: 60,
            acd_threshold_seconds: 10.0,
            threshold_simbox_cpm: 30,
            threshold_simbox_distinct: 10,
            threshold_wangiri: 10,
            threshold_mnp_mismatch: 3,
            dedup_capacity: 10_000,
            auto_disconnect: false,
            escalation_interval_secs: 2,
            active_call_ttl_seconds: 7_200,
            blacklist_reload_seconds: 30,
            gateway_reload_seconds: 30,
            mnp_cache_ttl_seconds: 3_600,
            shutdown_grace_seconds: 30,
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}
