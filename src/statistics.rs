//! Statistics Module
//!
//! Serving counters shared between the request path and the lifecycle
//! controller, plus the persisted snapshot and the bounded history ring.

use crate::disk_cache::DiskCache;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Reserved cache key holding the last persisted snapshot.
pub const STATISTICS_KEY: &str = "statistics";

/// Number of snapshots kept in the history ring.
pub const HISTORY_CAPACITY: usize = 240;

/// Live counters. Every update is a single atomic read-modify-write.
#[derive(Debug, Default)]
pub struct Statistics {
    requests_served: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    browser_cached: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_on_disk: AtomicU64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume counting from a persisted snapshot.
    pub fn from_snapshot(snapshot: &StatisticsSnapshot) -> Self {
        Self {
            requests_served: AtomicU64::new(snapshot.requests_served),
            cache_hits: AtomicU64::new(snapshot.cache_hits),
            cache_misses: AtomicU64::new(snapshot.cache_misses),
            browser_cached: AtomicU64::new(snapshot.browser_cached),
            bytes_sent: AtomicU64::new(snapshot.bytes_sent),
            bytes_on_disk: AtomicU64::new(snapshot.bytes_on_disk),
        }
    }

    pub fn record_request(&self) {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_browser_cached(&self) {
        self.browser_cached.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn set_bytes_on_disk(&self, bytes: u64) {
        self.bytes_on_disk.store(bytes, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            requests_served: self.requests_served.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            browser_cached: self.browser_cached.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_on_disk: self.bytes_on_disk.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticsSnapshot {
    pub requests_served: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub browser_cached: u64,
    pub bytes_sent: u64,
    pub bytes_on_disk: u64,
}

/// Ring of timestamped snapshots; the oldest is dropped when full.
#[derive(Debug)]
pub struct StatisticsHistory {
    capacity: usize,
    entries: Mutex<VecDeque<(DateTime<Utc>, StatisticsSnapshot)>>,
}

impl Default for StatisticsHistory {
    fn default() -> Self {
        Self::new(HISTORY_CAPACITY)
    }
}

impl StatisticsHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    pub fn push(&self, at: DateTime<Utc>, snapshot: StatisticsSnapshot) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back((at, snapshot));
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshots oldest first.
    pub fn entries(&self) -> Vec<(DateTime<Utc>, StatisticsSnapshot)> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

/// Store `snapshot` under [`STATISTICS_KEY`].
///
/// Returns `false` without writing when another edit of the key is in
/// progress.
pub fn persist(cache: &Arc<DiskCache>, snapshot: &StatisticsSnapshot) -> Result<bool> {
    let Some(mut editor) = cache.edit(STATISTICS_KEY)? else {
        debug!("Statistics entry busy, skipping persist");
        return Ok(false);
    };

    let json = serde_json::to_vec(snapshot)?;
    editor.set(0, &json)?;
    for slot in 1..cache.value_count() {
        editor.set(slot, b"")?;
    }
    editor.commit()?;
    Ok(true)
}

/// Load the last persisted snapshot. An unreadable entry is treated as absent.
pub fn load(cache: &Arc<DiskCache>) -> Result<Option<StatisticsSnapshot>> {
    let Some(mut snapshot) = cache.get(STATISTICS_KEY)? else {
        return Ok(None);
    };

    let raw = snapshot.read_slot(0)?;
    match serde_json::from_slice(&raw) {
        Ok(stats) => Ok(Some(stats)),
        Err(e) => {
            warn!("Ignoring unreadable persisted statistics: {}", e);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_counters() {
        let stats = Statistics::new();
        stats.record_request();
        stats.record_request();
        stats.record_hit();
        stats.record_miss();
        stats.record_browser_cached();
        stats.add_bytes_sent(100);
        stats.add_bytes_sent(50);
        stats.set_bytes_on_disk(4096);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.requests_served, 2);
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.cache_misses, 1);
        assert_eq!(snapshot.browser_cached, 1);
        assert_eq!(snapshot.bytes_sent, 150);
        assert_eq!(snapshot.bytes_on_disk, 4096);
    }

    #[test]
    fn test_concurrent_increments() {
        let stats = Arc::new(Statistics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.record_request();
                        stats.add_bytes_sent(2);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(stats.snapshot().requests_served, 8000);
        assert_eq!(stats.bytes_sent(), 16000);
    }

    #[test]
    fn test_history_drops_oldest() {
        let history = StatisticsHistory::new(3);
        for i in 0..5 {
            let snapshot = StatisticsSnapshot {
                requests_served: i,
                ..Default::default()
            };
            history.push(Utc::now(), snapshot);
        }

        let served: Vec<u64> = history
            .entries()
            .iter()
            .map(|(_, s)| s.requests_served)
            .collect();
        assert_eq!(served, vec![2, 3, 4]);
    }

    #[test]
    fn test_snapshot_uses_snake_case_fields() {
        let json = serde_json::to_value(StatisticsSnapshot::default()).unwrap();
        assert!(json.get("requests_served").is_some());
        assert!(json.get("browser_cached").is_some());
        assert!(json.get("bytes_on_disk").is_some());
    }

    #[test]
    fn test_persist_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let cache = DiskCache::open(temp_dir.path(), 2, 1, 1024 * 1024).unwrap();

        assert!(load(&cache).unwrap().is_none());

        let snapshot = StatisticsSnapshot {
            requests_served: 10,
            cache_hits: 7,
            bytes_sent: 12345,
            ..Default::default()
        };
        assert!(persist(&cache, &snapshot).unwrap());
        assert_eq!(load(&cache).unwrap(), Some(snapshot));
    }
}
