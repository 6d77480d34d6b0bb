//! Blacklist index
//!
//! Lock-free reads against an immutable snapshot holding exact MSISDN/IP
//! sets, an MSISDN prefix trie, and a CIDR trie. Writes go to the
//! persistent store first; the snapshot is rebuilt behind an atomic swap by
//! the caller or the background reloader. Expiry is evaluated at read time,
//! so an expired entry never matches even before the daily sweep deletes it.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use uuid::Uuid;

use acm_core::Msisdn;

use crate::error::{Error, Result};
use crate::store::BlacklistStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Msisdn,
    Ip,
    Cidr,
    Prefix,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Msisdn => "msisdn",
            Self::Ip => "ip",
            Self::Cidr => "cidr",
            Self::Prefix => "prefix",
        }
    }
}

impl std::fmt::Display for EntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntryType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "msisdn" => Ok(Self::Msisdn),
            "ip" => Ok(Self::Ip),
            "cidr" => Ok(Self::Cidr),
            "prefix" => Ok(Self::Prefix),
            other => Err(format!("unknown entry type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlacklistSource {
    Manual,
    Auto,
    Regulator,
}

impl BlacklistSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Auto => "auto",
            Self::Regulator => "regulator",
        }
    }
}

impl std::str::FromStr for BlacklistSource {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "auto" => Ok(Self::Auto),
            "regulator" => Ok(Self::Regulator),
            other => Err(format!("unknown blacklist source: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub id: Uuid,
    pub entry_type: EntryType,
    pub value: String,
    pub reason: Option<String>,
    pub source: BlacklistSource,
    pub added_by: String,
    /// None means permanent
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl BlacklistEntry {
    pub fn new(
        entry_type: EntryType,
        value: String,
        reason: Option<String>,
        source: BlacklistSource,
        added_by: String,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entry_type,
            value,
            reason,
            source,
            added_by,
            expires_at,
            created_at: Utc::now(),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expiry) if expiry <= now)
    }

    /// Canonicalize the value for its type; rejects malformed input.
    pub fn validate(mut self) -> Result<Self> {
        match self.entry_type {
            EntryType::Msisdn => {
                self.value = Msisdn::parse(&self.value)?.as_str().to_string();
            }
            EntryType::Ip => {
                let ip: IpAddr = self
                    .value
                    .parse()
                    .map_err(|_| Error::InvalidRequest(format!("invalid ip: {}", self.value)))?;
                self.value = ip.to_string();
            }
            EntryType::Cidr => {
                let (ip, prefix) = parse_cidr(&self.value)?;
                self.value = format!("{ip}/{prefix}");
            }
            EntryType::Prefix => {
                let digits: String = self
                    .value
                    .chars()
                    .filter(|c| !c.is_whitespace() && *c != '-')
                    .collect();
                if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit() || c == '+') {
                    return Err(Error::InvalidRequest(format!(
                        "invalid msisdn prefix: {}",
                        self.value
                    )));
                }
                self.value = digits;
            }
        }
        Ok(self)
    }
}

fn parse_cidr(raw: &str) -> Result<(IpAddr, u8)> {
    let (addr, prefix) = raw
        .split_once('/')
        .ok_or_else(|| Error::InvalidRequest(format!("invalid cidr: {raw}")))?;
    let ip: IpAddr = addr
        .parse()
        .map_err(|_| Error::InvalidRequest(format!("invalid cidr: {raw}")))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| Error::InvalidRequest(format!("invalid cidr: {raw}")))?;
    let max = match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    if prefix > max {
        return Err(Error::InvalidRequest(format!("invalid cidr prefix: {raw}")));
    }
    Ok((ip, prefix))
}

/// What matched, for alert context
#[derive(Debug, Clone, Serialize)]
pub struct BlacklistMatch {
    pub entry_type: EntryType,
    pub value: String,
    pub reason: Option<String>,
    pub source: BlacklistSource,
}

impl From<&BlacklistEntry> for BlacklistMatch {
    fn from(entry: &BlacklistEntry) -> Self {
        Self {
            entry_type: entry.entry_type,
            value: entry.value.clone(),
            reason: entry.reason.clone(),
            source: entry.source,
        }
    }
}

// ============================================
// Digit prefix trie
// ============================================

#[derive(Default)]
struct PrefixNode {
    children: HashMap<u8, PrefixNode>,
    entry: Option<BlacklistEntry>,
}

/// Longest-prefix matcher over MSISDN digit strings
#[derive(Default)]
struct PrefixTrie {
    root: PrefixNode,
}

impl PrefixTrie {
    fn insert(&mut self, entry: BlacklistEntry) {
        let digits: Vec<u8> = entry
            .value
            .bytes()
            .filter(|b| b.is_ascii_digit())
            .collect();
        let mut node = &mut self.root;
        for digit in digits {
            node = node.children.entry(digit).or_default();
        }
        node.entry = Some(entry);
    }

    /// Longest matching prefix entry that has not expired
    fn lookup(&self, msisdn: &str, now: DateTime<Utc>) -> Option<&BlacklistEntry> {
        let mut node = &self.root;
        let mut best = None;
        for digit in msisdn.bytes().filter(|b| b.is_ascii_digit()) {
            match node.children.get(&digit) {
                Some(child) => {
                    node = child;
                    if let Some(entry) = &node.entry {
                        if !entry.is_expired_at(now) {
                            best = Some(entry);
                        }
                    }
                }
                None => break,
            }
        }
        best
    }
}

// ============================================
// CIDR trie
// ============================================

#[derive(Default)]
struct CidrNode {
    zero: Option<Box<CidrNode>>,
    one: Option<Box<CidrNode>>,
    entry: Option<BlacklistEntry>,
}

/// Bitwise trie over IPv4-mapped 128-bit addresses
#[derive(Default)]
struct CidrTrie {
    root: CidrNode,
}

fn to_bits(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(v4.to_ipv6_mapped()),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn cidr_depth(ip: IpAddr, prefix: u8) -> u8 {
    match ip {
        // v4 addresses live in the mapped ::ffff:0:0/96 subtree
        IpAddr::V4(_) => 96 + prefix,
        IpAddr::V6(_) => prefix,
    }
}

impl CidrTrie {
    fn insert(&mut self, ip: IpAddr, prefix: u8, entry: BlacklistEntry) {
        let bits = to_bits(ip);
        let depth = cidr_depth(ip, prefix);
        let mut node = &mut self.root;
        for i in 0..depth {
            let bit = (bits >> (127 - i)) & 1;
            node = if bit == 0 {
                node.zero.get_or_insert_with(Default::default)
            } else {
                node.one.get_or_insert_with(Default::default)
            };
        }
        node.entry = Some(entry);
    }

    /// Most specific containing range that has not expired
    fn lookup(&self, ip: IpAddr, now: DateTime<Utc>) -> Option<&BlacklistEntry> {
        let bits = to_bits(ip);
        let mut node = &self.root;
        let mut best = None;
        for i in 0..128 {
            if let Some(entry) = &node.entry {
                if !entry.is_expired_at(now) {
                    best = Some(entry);
                }
            }
            let bit = (bits >> (127 - i)) & 1;
            let next = if bit == 0 { node.zero.as_deref() } else { node.one.as_deref() };
            match next {
                Some(child) => node = child,
                None => break,
            }
        }
        if let Some(entry) = &node.entry {
            if !entry.is_expired_at(now) {
                best = Some(entry);
            }
        }
        best
    }
}

// ============================================
// Snapshot and index
// ============================================

#[derive(Default)]
struct Snapshot {
    msisdns: HashMap<String, BlacklistEntry>,
    ips: HashMap<IpAddr, BlacklistEntry>,
    prefixes: PrefixTrie,
    cidrs: CidrTrie,
    entries: usize,
}

impl Snapshot {
    fn build(entries: Vec<BlacklistEntry>) -> Self {
        let mut snapshot = Snapshot::default();
        snapshot.entries = entries.len();
        for entry in entries {
            match entry.entry_type {
                EntryType::Msisdn => {
                    snapshot.msisdns.insert(entry.value.clone(), entry);
                }
                EntryType::Ip => {
                    if let Ok(ip) = entry.value.parse::<IpAddr>() {
                        snapshot.ips.insert(ip, entry);
                    }
                }
                EntryType::Cidr => {
                    if let Ok((ip, prefix)) = parse_cidr(&entry.value) {
                        snapshot.cidrs.insert(ip, prefix, entry);
                    }
                }
                EntryType::Prefix => snapshot.prefixes.insert(entry),
            }
        }
        snapshot
    }
}

/// Copy-on-write blacklist view; readers never block writers.
pub struct BlacklistIndex {
    snapshot: RwLock<Arc<Snapshot>>,
    store: Arc<dyn BlacklistStore>,
}

impl BlacklistIndex {
    pub fn new(store: Arc<dyn BlacklistStore>) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            store,
        }
    }

    fn current(&self) -> Arc<Snapshot> {
        self.snapshot.read().clone()
    }

    pub fn entry_count(&self) -> usize {
        self.current().entries
    }

    /// Exact MSISDN then longest prefix
    pub fn check_msisdn(&self, msisdn: &Msisdn) -> Option<BlacklistMatch> {
        let snapshot = self.current();
        let now = Utc::now();
        if let Some(entry) = snapshot.msisdns.get(msisdn.as_str()) {
            if !entry.is_expired_at(now) {
                return Some(entry.into());
            }
        }
        snapshot
            .prefixes
            .lookup(msisdn.as_str(), now)
            .map(BlacklistMatch::from)
    }

    /// Exact IP then most specific CIDR
    pub fn check_ip(&self, ip: IpAddr) -> Option<BlacklistMatch> {
        let snapshot = self.current();
        let now = Utc::now();
        if let Some(entry) = snapshot.ips.get(&ip) {
            if !entry.is_expired_at(now) {
                return Some(entry.into());
            }
        }
        snapshot.cidrs.lookup(ip, now).map(BlacklistMatch::from)
    }

    /// Rebuild the snapshot from the store and swap it in.
    pub async fn reload(&self) -> Result<usize> {
        let entries = crate::store::with_deadline(self.store.list_active_blacklist()).await?;
        let count = entries.len();
        let snapshot = Arc::new(Snapshot::build(entries));
        *self.snapshot.write() = snapshot;
        tracing::debug!(entries = count, "Blacklist snapshot reloaded");
        Ok(count)
    }

    /// Store-first write, then immediate snapshot refresh. Duplicate active
    /// values are upserted, never duplicated.
    pub async fn add(&self, entry: BlacklistEntry) -> Result<BlacklistEntry> {
        let entry = entry.validate()?;
        let stored = crate::store::with_deadline(self.store.upsert_blacklist(entry)).await?;
        self.reload().await?;
        tracing::info!(
            entry_type = %stored.entry_type,
            value = %stored.value,
            source = ?stored.source,
            "Blacklist entry added"
        );
        Ok(stored)
    }

    pub async fn remove(&self, id: Uuid) -> Result<()> {
        let removed = self.store.delete_blacklist(id).await?;
        if !removed {
            return Err(Error::NotFound("blacklist entry", id.to_string()));
        }
        self.reload().await?;
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<BlacklistEntry>> {
        self.store.list_active_blacklist().await
    }

    /// Delete expired rows; the snapshot already ignores them at read time.
    pub async fn sweep_expired(&self) -> Result<u64> {
        let purged = self.store.purge_expired_blacklist(Utc::now()).await?;
        if purged > 0 {
            tracing::info!(purged, "Expired blacklist entries removed");
            self.reload().await?;
        }
        Ok(purged)
    }
}
