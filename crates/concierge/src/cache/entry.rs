use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use concierge_core::cache::{CacheError, QueryKey};

/// An immutable cached payload. Updates replace the `Arc`, never its contents.
pub type Payload = Arc<Value>;

/// Read-only view of a cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub key: QueryKey,
    pub payload: Option<Payload>,
    /// Last fetch error; the previous payload stays available.
    pub error: Option<CacheError>,
    pub fetched_at: Option<Instant>,
    pub invalidated: bool,
    pub is_fetching: bool,
    pub observers: usize,
    pub retain_until: Option<Instant>,
    pub generation: u64,
}

impl Entry {
    /// Returns true if the payload is older than `stale_time` or was invalidated.
    pub fn is_stale(&self, now: Instant, stale_time: Duration) -> bool {
        self.invalidated
            || self
                .fetched_at
                .is_none_or(|at| now.saturating_duration_since(at) >= stale_time)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Updated,
    Invalidated,
    Evicted,
    FetchStarted,
    FetchFailed,
}

/// Broadcast on every state change of a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNotification {
    pub key: QueryKey,
    pub kind: NotificationKind,
}

/// Counters for cache hit-rate monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads served from the cache without waiting.
    pub hits: u64,
    /// Reads that had to wait for a fetch.
    pub misses: u64,
    /// Gateway fetches started.
    pub fetches: u64,
    pub evictions: u64,
}

impl CacheStats {
    /// Hits over total reads, 0 when nothing was read.
    pub fn hit_rate(&self) -> f64 {
        let reads = self.hits + self.misses;
        if reads == 0 {
            0.0
        } else {
            self.hits as f64 / reads as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(fetched_at: Option<Instant>, invalidated: bool) -> Entry {
        Entry {
            key: QueryKey::new("tasks").with("list").with("all"),
            payload: None,
            error: None,
            fetched_at,
            invalidated,
            is_fetching: false,
            observers: 0,
            retain_until: None,
            generation: 1,
        }
    }

    #[test]
    fn test_staleness() {
        let now = Instant::now();
        let minute = Duration::from_secs(60);

        assert!(entry(None, false).is_stale(now, minute));
        assert!(!entry(Some(now), false).is_stale(now, minute));
        assert!(entry(Some(now), true).is_stale(now, minute));
        assert!(entry(Some(now), false).is_stale(now + minute, minute));
        // Zero stale time is always stale
        assert!(entry(Some(now), false).is_stale(now, Duration::ZERO));
    }

    #[test]
    fn test_hit_rate() {
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            ..CacheStats::default()
        };
        assert_eq!(stats.hit_rate(), 0.75);
    }
}
