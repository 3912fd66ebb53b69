//! Warm cache of recently retrieved protocols
//!
//! Entries expire by timestamp comparison on read. Nothing is evicted
//! proactively; an expired entry is simply ignored until overwritten.
//! Concurrent populates of the same code are last-writer-wins.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::model::ProtocolRecord;

/// Cache tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Time-to-live of an entry in seconds
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_secs: 3_600 }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// A cached protocol with its capture time
#[derive(Debug, Clone)]
pub struct CachedEntry {
    pub record: ProtocolRecord,
    pub cached_at: Instant,
    pub ttl: Duration,
}

impl CachedEntry {
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.cached_at) >= self.ttl
    }
}

/// Code-keyed protocol cache
#[derive(Debug)]
pub struct ProtocolCache {
    ttl: Duration,
    entries: DashMap<String, CachedEntry>,
}

impl ProtocolCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_ttl(config.ttl())
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store a record under its code
    pub fn insert(&self, record: ProtocolRecord) {
        self.insert_at(record, Instant::now());
    }

    pub fn insert_at(&self, record: ProtocolRecord, now: Instant) {
        let key = normalize_key(&record.code);
        self.entries.insert(
            key,
            CachedEntry {
                record,
                cached_at: now,
                ttl: self.ttl,
            },
        );
    }

    /// Non-expired record for `code`, if any
    pub fn get(&self, code: &str) -> Option<ProtocolRecord> {
        self.get_at(code, Instant::now())
    }

    pub fn get_at(&self, code: &str, now: Instant) -> Option<ProtocolRecord> {
        self.entries
            .get(&normalize_key(code))
            .filter(|entry| !entry.is_expired_at(now))
            .map(|entry| entry.record.clone())
    }

    /// Number of stored entries, expired ones included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries still within their TTL
    pub fn live_count(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired_at(now)).count()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

fn normalize_key(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}
