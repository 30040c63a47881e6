//! In-memory cache store with request de-duplication and LRU capacity.
//!
//! The store is the only shared mutable state of a session. Every operation
//! takes one short `std::sync::Mutex` critical section, so an optimistic
//! write is visible to readers before the caller awaits anything.
//!
//! Each entry carries a generation number. Writes, projections, rollbacks,
//! invalidations and evictions move it forward; a fetch result is applied
//! only if the entry is still at the generation the fetch started from.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;

use concierge_core::cache::{CacheError, KeyPattern, QueryKey};
use concierge_core::policy::QueryConfig;

use super::{CacheNotification, CacheStats, Entry, NotificationKind, Payload};

/// Channel capacity for cache notifications.
const NOTIFICATION_CAPACITY: usize = 256;

pub type FetchResult = Result<Payload, CacheError>;

/// A fetch every concurrent reader of a key awaits.
pub type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

struct InFlight {
    id: u64,
    shared: SharedFetch,
}

struct Slot {
    payload: Option<Payload>,
    error: Option<CacheError>,
    fetched_at: Option<Instant>,
    invalidated: bool,
    in_flight: Option<InFlight>,
    observers: usize,
    retain_until: Option<Instant>,
    generation: u64,
}

impl Slot {
    fn view(&self, key: &QueryKey) -> Entry {
        Entry {
            key: key.clone(),
            payload: self.payload.clone(),
            error: self.error.clone(),
            fetched_at: self.fetched_at,
            invalidated: self.invalidated,
            is_fetching: self.in_flight.is_some(),
            observers: self.observers,
            retain_until: self.retain_until,
            generation: self.generation,
        }
    }
}

/// Pre-write state of one entry.
#[derive(Debug, Clone)]
struct Snapshot {
    payload: Option<Payload>,
    error: Option<CacheError>,
    fetched_at: Option<Instant>,
    invalidated: bool,
}

impl Snapshot {
    fn of(slot: &Slot) -> Self {
        Self {
            payload: slot.payload.clone(),
            error: slot.error.clone(),
            fetched_at: slot.fetched_at,
            invalidated: slot.invalidated,
        }
    }

    fn restore(self, slot: &mut Slot) {
        slot.payload = self.payload;
        slot.error = self.error;
        slot.fetched_at = self.fetched_at;
        slot.invalidated = self.invalidated;
    }
}

/// Captured state of every entry an optimistic write touched.
///
/// Pass it to [`CacheStore::rollback`] on failure; drop it on success.
#[derive(Debug)]
#[must_use = "a rollback token must be rolled back or explicitly dropped"]
pub struct RollbackToken {
    snapshots: Vec<(QueryKey, Snapshot)>,
}

impl RollbackToken {
    pub fn keys(&self) -> impl Iterator<Item = &QueryKey> {
        self.snapshots.iter().map(|(key, _)| key)
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

struct Inner {
    entries: LruCache<QueryKey, Slot>,
    max_entries: usize,
    next_generation: u64,
    next_fetch_id: u64,
    stats: CacheStats,
}

fn bump(counter: &mut u64) -> u64 {
    *counter += 1;
    *counter
}

impl Inner {
    /// Returns the slot for `key`, creating an empty one if needed.
    fn slot(&mut self, key: &QueryKey, retain_until: Instant, evicted: &mut Vec<QueryKey>) -> &mut Slot {
        if !self.entries.contains(key) {
            self.make_room(evicted);
        }
        let Inner {
            entries,
            next_generation,
            ..
        } = self;
        entries.get_or_insert_mut(key.clone(), || Slot {
            payload: None,
            error: None,
            fetched_at: None,
            invalidated: false,
            in_flight: None,
            observers: 0,
            retain_until: Some(retain_until),
            generation: bump(next_generation),
        })
    }

    /// Evicts idle entries, least recently used first, until one more fits.
    fn make_room(&mut self, evicted: &mut Vec<QueryKey>) {
        while self.entries.len() >= self.max_entries {
            let victim = self
                .entries
                .iter()
                .rev()
                .find(|(_, slot)| slot.observers == 0 && slot.in_flight.is_none())
                .map(|(key, _)| key.clone());
            match victim {
                Some(key) => {
                    self.entries.pop(&key);
                    self.stats.evictions += 1;
                    evicted.push(key);
                }
                // Everything is in use; allow going over capacity
                None => break,
            }
        }
    }
}

/// Outcome of [`CacheStore::begin_fetch`].
pub enum FetchHandle {
    /// A fetch was already running; await it.
    Joined(SharedFetch),
    /// The caller owns the new fetch and must finish it with
    /// [`CacheStore::end_fetch`].
    Started(FetchTicket),
}

/// Ownership of one in-flight fetch.
///
/// Dropping the ticket without calling [`CacheStore::end_fetch`] abandons the
/// fetch: waiters receive [`CacheError::Abandoned`] and the entry stops
/// reporting it as in flight.
pub struct FetchTicket {
    key: QueryKey,
    generation: u64,
    id: u64,
    sender: Option<oneshot::Sender<FetchResult>>,
    shared: SharedFetch,
    inner: Weak<Mutex<Inner>>,
}

impl FetchTicket {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// A future resolving with this fetch's result.
    pub fn shared(&self) -> SharedFetch {
        self.shared.clone()
    }
}

impl Drop for FetchTicket {
    fn drop(&mut self) {
        if self.sender.take().is_none() {
            return;
        }
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = inner.entries.peek_mut(&self.key) {
            if slot.in_flight.as_ref().is_some_and(|f| f.id == self.id) {
                slot.in_flight = None;
            }
        }
        tracing::debug!(key = %self.key, "Fetch abandoned");
    }
}

/// Keyed cache of query payloads.
///
/// Cloning is cheap and every clone shares the same state.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<Mutex<Inner>>,
    config: Arc<QueryConfig>,
    notifications: broadcast::Sender<CacheNotification>,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("len", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}

impl CacheStore {
    /// Creates an empty store.
    ///
    /// `max_entries` bounds the number of entries; idle entries are evicted
    /// least recently used first. A value of 0 is treated as 1.
    pub fn new(max_entries: usize, config: Arc<QueryConfig>) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: LruCache::unbounded(),
                max_entries: max_entries.max(1),
                next_generation: 0,
                next_fetch_id: 0,
                stats: CacheStats::default(),
            })),
            config,
            notifications,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, key: QueryKey, kind: NotificationKind) {
        // No receivers is fine
        let _ = self.notifications.send(CacheNotification { key, kind });
    }

    fn notify_evicted(&self, keys: Vec<QueryKey>) {
        for key in keys {
            tracing::debug!(%key, "Cache entry evicted");
            self.notify(key, NotificationKind::Evicted);
        }
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    fn retain_until(&self, key: &QueryKey, now: Instant) -> Instant {
        now + self.config.options_for(key.namespace()).retain_time
    }

    /// Returns the entry for a key and marks it recently used.
    pub fn get(&self, key: &QueryKey) -> Option<Entry> {
        let mut inner = self.lock();
        inner.entries.get(key).map(|slot| slot.view(key))
    }

    /// Returns the entry for a key without touching its recency.
    pub fn peek(&self, key: &QueryKey) -> Option<Entry> {
        let inner = self.lock();
        inner.entries.peek(key).map(|slot| slot.view(key))
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        self.lock().entries.contains(key)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every key matching the pattern.
    pub fn keys_matching(&self, pattern: &KeyPattern) -> Vec<QueryKey> {
        self.lock()
            .entries
            .iter()
            .filter(|(key, _)| pattern.matches(key))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Replaces the payload and its timestamp. An in-flight fetch keeps
    /// running but its result will be discarded.
    pub fn set(&self, key: &QueryKey, payload: Value) {
        let now = Instant::now();
        let mut evicted = Vec::new();
        {
            let mut inner = self.lock();
            let generation = bump(&mut inner.next_generation);
            let slot = inner.slot(key, self.retain_until(key, now), &mut evicted);
            slot.payload = Some(Arc::new(payload));
            slot.error = None;
            slot.fetched_at = Some(now);
            slot.invalidated = false;
            slot.generation = generation;
        }
        self.notify_evicted(evicted);
        self.notify(key.clone(), NotificationKind::Updated);
    }

    /// Joins the in-flight fetch for `key`, or starts a new one.
    pub fn begin_fetch(&self, key: &QueryKey) -> FetchHandle {
        let now = Instant::now();
        let mut evicted = Vec::new();
        let handle = {
            let mut inner = self.lock();
            let id = bump(&mut inner.next_fetch_id);
            let retain_until = self.retain_until(key, now);
            let slot = inner.slot(key, retain_until, &mut evicted);

            if let Some(in_flight) = &slot.in_flight {
                FetchHandle::Joined(in_flight.shared.clone())
            } else {
                let (sender, receiver) = oneshot::channel::<FetchResult>();
                let abandoned = key.to_string();
                let shared = receiver
                    .map(move |received| {
                        received.unwrap_or(Err(CacheError::Abandoned { key: abandoned }))
                    })
                    .boxed()
                    .shared();
                slot.in_flight = Some(InFlight {
                    id,
                    shared: shared.clone(),
                });
                let generation = slot.generation;
                inner.stats.fetches += 1;
                FetchHandle::Started(FetchTicket {
                    key: key.clone(),
                    generation,
                    id,
                    sender: Some(sender),
                    shared,
                    inner: Arc::downgrade(&self.inner),
                })
            }
        };

        self.notify_evicted(evicted);
        if matches!(handle, FetchHandle::Started(_)) {
            self.notify(key.clone(), NotificationKind::FetchStarted);
        }
        handle
    }

    /// Finishes a fetch: stores the payload (or records the error, keeping the
    /// previous payload) and resolves every waiter.
    ///
    /// Returns false if the result was discarded because the entry changed or
    /// was evicted after the fetch started.
    pub fn end_fetch(&self, mut ticket: FetchTicket, result: Result<Value, CacheError>) -> bool {
        let sender = ticket.sender.take();
        let result: FetchResult = result.map(Arc::new);
        let now = Instant::now();

        let applied = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            match inner.entries.peek_mut(&ticket.key) {
                Some(slot) => {
                    if slot.in_flight.as_ref().is_some_and(|f| f.id == ticket.id) {
                        slot.in_flight = None;
                    }
                    if slot.generation == ticket.generation {
                        match &result {
                            Ok(payload) => {
                                slot.payload = Some(payload.clone());
                                slot.error = None;
                                slot.fetched_at = Some(now);
                                slot.invalidated = false;
                                slot.generation = bump(&mut inner.next_generation);
                            }
                            Err(err) => slot.error = Some(err.clone()),
                        }
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        if applied {
            let kind = if result.is_ok() {
                NotificationKind::Updated
            } else {
                NotificationKind::FetchFailed
            };
            self.notify(ticket.key.clone(), kind);
        } else {
            tracing::warn!(key = %ticket.key, "Discarding stale fetch result");
        }

        if let Some(sender) = sender {
            let _ = sender.send(result);
        }
        applied
    }

    /// Marks every matching entry stale, keeping its payload. In-flight
    /// fetches of those entries are detached and their results discarded.
    pub fn invalidate(&self, pattern: &KeyPattern) -> Vec<QueryKey> {
        let keys: Vec<QueryKey> = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            let mut keys = Vec::new();
            for (key, slot) in inner.entries.iter_mut() {
                if !pattern.matches(key) {
                    continue;
                }
                slot.invalidated = true;
                slot.in_flight = None;
                slot.generation = bump(&mut inner.next_generation);
                keys.push(key.clone());
            }
            keys
        };

        if !keys.is_empty() {
            tracing::debug!(%pattern, count = keys.len(), "Invalidated cache entries");
        }
        for key in &keys {
            self.notify(key.clone(), NotificationKind::Invalidated);
        }
        keys
    }

    /// Removes an entry that nobody observes. Returns false if it has
    /// observers or does not exist.
    pub fn evict(&self, key: &QueryKey) -> bool {
        let removed = {
            let mut inner = self.lock();
            match inner.entries.peek(key) {
                Some(slot) if slot.observers == 0 => {
                    inner.entries.pop(key);
                    inner.stats.evictions += 1;
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.notify_evicted(vec![key.clone()]);
        }
        removed
    }

    /// Evicts every unobserved entry whose retention window has elapsed.
    pub fn collect_garbage(&self, now: Instant) -> Vec<QueryKey> {
        let expired: Vec<QueryKey> = {
            let mut inner = self.lock();
            let expired: Vec<QueryKey> = inner
                .entries
                .iter()
                .filter(|(_, slot)| {
                    slot.observers == 0 && slot.retain_until.is_some_and(|until| until <= now)
                })
                .map(|(key, _)| key.clone())
                .collect();
            for key in &expired {
                inner.entries.pop(key);
                inner.stats.evictions += 1;
            }
            expired
        };
        self.notify_evicted(expired.clone());
        expired
    }

    /// Registers an observer; the entry is never evicted while observed.
    pub fn acquire(&self, key: &QueryKey) {
        let now = Instant::now();
        let mut evicted = Vec::new();
        {
            let mut inner = self.lock();
            let slot = inner.slot(key, self.retain_until(key, now), &mut evicted);
            slot.observers += 1;
            slot.retain_until = None;
        }
        self.notify_evicted(evicted);
    }

    /// Drops an observer. The last release starts the retention window.
    pub fn release(&self, key: &QueryKey) {
        let retain_until = self.retain_until(key, Instant::now());
        let mut inner = self.lock();
        if let Some(slot) = inner.entries.peek_mut(key) {
            slot.observers = slot.observers.saturating_sub(1);
            if slot.observers == 0 {
                slot.retain_until = Some(retain_until);
            }
        }
    }

    /// Applies an optimistic write to every cached entry matching one of the
    /// patterns, in one critical section.
    ///
    /// `projector` returns the new payload, or `None` to leave an entry
    /// untouched. Projected entries count as freshly written; fetches already
    /// in flight for them are detached.
    pub fn apply_projection<F>(&self, patterns: &[KeyPattern], mut projector: F) -> RollbackToken
    where
        F: FnMut(&QueryKey, &Value) -> Option<Value>,
    {
        let now = Instant::now();
        let snapshots = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            let mut snapshots = Vec::new();
            for (key, slot) in inner.entries.iter_mut() {
                if !patterns.iter().any(|p| p.matches(key)) {
                    continue;
                }
                let Some(current) = slot.payload.as_deref() else {
                    continue;
                };
                let Some(next) = projector(key, current) else {
                    continue;
                };
                snapshots.push((key.clone(), Snapshot::of(slot)));
                slot.payload = Some(Arc::new(next));
                slot.fetched_at = Some(now);
                slot.invalidated = false;
                slot.in_flight = None;
                slot.generation = bump(&mut inner.next_generation);
            }
            snapshots
        };

        for (key, _) in &snapshots {
            tracing::trace!(%key, "Applied optimistic projection");
            self.notify(key.clone(), NotificationKind::Updated);
        }
        RollbackToken { snapshots }
    }

    /// Restores every entry captured by the token to its pre-write state.
    /// Entries evicted since are skipped.
    pub fn rollback(&self, token: RollbackToken) -> usize {
        let restored: Vec<QueryKey> = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            let mut restored = Vec::new();
            for (key, snapshot) in token.snapshots {
                if let Some(slot) = inner.entries.peek_mut(&key) {
                    snapshot.restore(slot);
                    slot.in_flight = None;
                    slot.generation = bump(&mut inner.next_generation);
                    restored.push(key);
                }
            }
            restored
        };

        for key in &restored {
            tracing::debug!(%key, "Rolled back optimistic projection");
            self.notify(key.clone(), NotificationKind::Updated);
        }
        restored.len()
    }

    /// Subscribes to state changes of every key.
    pub fn observe(&self) -> broadcast::Receiver<CacheNotification> {
        self.notifications.subscribe()
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }

    pub(crate) fn record_hit(&self) {
        self.lock().stats.hits += 1;
    }

    pub(crate) fn record_miss(&self) {
        self.lock().stats.misses += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concierge_core::cache::{list_pattern, namespace_pattern};
    use concierge_core::gateway::Table;
    use concierge_core::policy::QueryOptions;
    use serde_json::json;
    use std::time::Duration;

    /// Default max entries for tests
    const TEST_MAX_ENTRIES: usize = 1000;

    fn store(max_entries: usize) -> CacheStore {
        let config = QueryConfig::new(QueryOptions::new(
            Duration::from_secs(60),
            Duration::from_secs(300),
        ));
        CacheStore::new(max_entries, Arc::new(config))
    }

    fn key(namespace: &str, qualifier: &str) -> QueryKey {
        QueryKey::new(namespace).with("list").with(qualifier)
    }

    fn started(handle: FetchHandle) -> FetchTicket {
        match handle {
            FetchHandle::Started(ticket) => ticket,
            FetchHandle::Joined(_) => panic!("expected a new fetch"),
        }
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let store = store(TEST_MAX_ENTRIES);
        let key = key("tasks", "all");

        store.set(&key, json!([{"task_id": "t1"}]));
        let entry = store.get(&key).unwrap();

        assert_eq!(*entry.payload.unwrap(), json!([{"task_id": "t1"}]));
        assert!(entry.fetched_at.is_some());
        assert!(!entry.is_fetching);
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let store = store(TEST_MAX_ENTRIES);
        assert!(store.get(&key("tasks", "all")).is_none());
    }

    #[tokio::test]
    async fn test_concurrent_fetches_are_deduplicated() {
        let store = store(TEST_MAX_ENTRIES);
        let key = key("tasks", "all");

        let ticket = started(store.begin_fetch(&key));
        let joined = match store.begin_fetch(&key) {
            FetchHandle::Joined(shared) => shared,
            FetchHandle::Started(_) => panic!("second caller must join"),
        };
        assert!(store.get(&key).unwrap().is_fetching);

        let own = ticket.shared();
        assert!(store.end_fetch(ticket, Ok(json!([1, 2]))));

        assert_eq!(*joined.await.unwrap(), json!([1, 2]));
        assert_eq!(*own.await.unwrap(), json!([1, 2]));
        let entry = store.get(&key).unwrap();
        assert!(!entry.is_fetching);
        assert_eq!(*entry.payload.unwrap(), json!([1, 2]));
        assert_eq!(store.stats().fetches, 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_previous_payload() {
        let store = store(TEST_MAX_ENTRIES);
        let key = key("tasks", "all");
        store.set(&key, json!(["old"]));

        let ticket = started(store.begin_fetch(&key));
        let error = CacheError::Serialization("boom".to_string());
        assert!(store.end_fetch(ticket, Err(error.clone())));

        let entry = store.get(&key).unwrap();
        assert_eq!(*entry.payload.unwrap(), json!(["old"]));
        assert_eq!(entry.error, Some(error));
    }

    #[tokio::test]
    async fn test_fetch_result_discarded_after_set() {
        let store = store(TEST_MAX_ENTRIES);
        let key = key("tasks", "all");

        let ticket = started(store.begin_fetch(&key));
        store.set(&key, json!(["newer"]));
        // Set does not alter the fetching flag
        assert!(store.get(&key).unwrap().is_fetching);

        assert!(!store.end_fetch(ticket, Ok(json!(["older"]))));
        let entry = store.get(&key).unwrap();
        assert_eq!(*entry.payload.unwrap(), json!(["newer"]));
        assert!(!entry.is_fetching);
    }

    #[tokio::test]
    async fn test_fetch_result_discarded_after_eviction() {
        let store = store(TEST_MAX_ENTRIES);
        let key = key("tasks", "all");

        let ticket = started(store.begin_fetch(&key));
        assert!(store.evict(&key));
        assert!(!store.end_fetch(ticket, Ok(json!([]))));
        assert!(store.get(&key).is_none());
    }

    #[tokio::test]
    async fn test_dropped_ticket_abandons_fetch() {
        let store = store(TEST_MAX_ENTRIES);
        let key = key("tasks", "all");

        let ticket = started(store.begin_fetch(&key));
        let waiter = ticket.shared();
        drop(ticket);

        assert_eq!(
            waiter.await,
            Err(CacheError::Abandoned {
                key: "tasks:list:all".to_string()
            })
        );
        assert!(!store.get(&key).unwrap().is_fetching);
        // A new reader starts over
        assert!(matches!(store.begin_fetch(&key), FetchHandle::Started(_)));
    }

    #[tokio::test]
    async fn test_invalidate_marks_stale_and_detaches_fetch() {
        let store = store(TEST_MAX_ENTRIES);
        let tasks = key("tasks", "all");
        let jobs = key("jobs", "all");
        store.set(&tasks, json!([]));
        store.set(&jobs, json!([]));

        let ticket = started(store.begin_fetch(&tasks));
        let keys = store.invalidate(&list_pattern(Table::Tasks));
        assert_eq!(keys, vec![tasks.clone()]);

        let entry = store.get(&tasks).unwrap();
        assert!(entry.invalidated);
        assert!(!entry.is_fetching);
        assert!(entry.payload.is_some());
        assert!(!store.get(&jobs).unwrap().invalidated);

        // The detached fetch cannot overwrite the invalidated entry
        assert!(!store.end_fetch(ticket, Ok(json!(["pre-invalidation"]))));
        assert!(matches!(store.begin_fetch(&tasks), FetchHandle::Started(_)));
    }

    #[tokio::test]
    async fn test_projection_and_exact_rollback() {
        let store = store(TEST_MAX_ENTRIES);
        let all = key("tasks", "all");
        let other = key("jobs", "all");
        store.set(&all, json!([{"task_id": "t1"}]));
        store.set(&other, json!([{"job_id": "j1"}]));
        store.invalidate(&namespace_pattern(Table::Tasks));
        let before = store.get(&all).unwrap();

        let token = store.apply_projection(&[list_pattern(Table::Tasks)], |_, payload| {
            let mut rows = payload.as_array().cloned().unwrap_or_default();
            rows.push(json!({"task_id": "tmp"}));
            Some(json!(rows))
        });
        assert_eq!(token.keys().collect::<Vec<_>>(), vec![&all]);
        assert_eq!(store.get(&all).unwrap().payload.unwrap().as_array().unwrap().len(), 2);
        assert!(!store.get(&all).unwrap().invalidated);

        assert_eq!(store.rollback(token), 1);
        let after = store.get(&all).unwrap();
        assert_eq!(after.payload, before.payload);
        assert_eq!(after.fetched_at, before.fetched_at);
        assert_eq!(after.invalidated, before.invalidated);
        assert_eq!(after.error, before.error);
        assert!(after.generation > before.generation);
        assert_eq!(*store.get(&other).unwrap().payload.unwrap(), json!([{"job_id": "j1"}]));
    }

    #[tokio::test]
    async fn test_projection_skips_empty_entries() {
        let store = store(TEST_MAX_ENTRIES);
        let key = key("tasks", "all");
        store.acquire(&key);

        let token = store.apply_projection(&[list_pattern(Table::Tasks)], |_, _| Some(json!([])));
        assert!(token.is_empty());
        assert!(store.get(&key).unwrap().payload.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retention_starts_on_last_release() {
        let store = store(TEST_MAX_ENTRIES);
        let key = key("tasks", "all");
        store.set(&key, json!([]));

        store.acquire(&key);
        store.acquire(&key);
        store.release(&key);
        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(store.collect_garbage(Instant::now()).is_empty());
        assert!(!store.evict(&key));

        store.release(&key);
        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(store.collect_garbage(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.collect_garbage(Instant::now()), vec![key.clone()]);
        assert!(!store.contains(&key));
        assert_eq!(store.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unobserved_entries_expire() {
        let store = store(TEST_MAX_ENTRIES);
        let key = key("tasks", "all");
        store.set(&key, json!([]));

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(store.collect_garbage(Instant::now()), vec![key]);
    }

    #[tokio::test]
    async fn test_lru_eviction_skips_observed_entries() {
        let store = store(3);
        let k1 = key("tasks", "1");
        let k2 = key("tasks", "2");
        let k3 = key("tasks", "3");
        let k4 = key("tasks", "4");

        store.set(&k1, json!(1));
        store.set(&k2, json!(2));
        store.set(&k3, json!(3));
        store.acquire(&k1);
        store.get(&k2);
        store.get(&k3);
        store.peek(&k1);

        store.set(&k4, json!(4));

        // k1 is least recently used but observed, k2 is next in line
        assert!(store.contains(&k1));
        assert!(!store.contains(&k2));
        assert!(store.contains(&k3));
        assert!(store.contains(&k4));
    }

    #[tokio::test]
    async fn test_notifications() {
        let store = store(TEST_MAX_ENTRIES);
        let mut notifications = store.observe();
        let key = key("tasks", "all");

        store.set(&key, json!([]));
        store.invalidate(&list_pattern(Table::Tasks));
        assert!(store.evict(&key));

        let kinds: Vec<NotificationKind> = (0..3)
            .map(|_| notifications.try_recv().unwrap().kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                NotificationKind::Updated,
                NotificationKind::Invalidated,
                NotificationKind::Evicted
            ]
        );
    }

    #[tokio::test]
    async fn test_keys_matching() {
        let store = store(TEST_MAX_ENTRIES);
        store.set(&key("tasks", "a"), json!([]));
        store.set(&key("tasks", "b"), json!([]));
        store.set(&key("jobs", "a"), json!([]));

        assert_eq!(store.keys_matching(&list_pattern(Table::Tasks)).len(), 2);
        assert_eq!(store.len(), 3);
    }
}
