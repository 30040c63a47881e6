//! Cached reads: freshness, de-duplication, stale-while-revalidate, retry
//! and observer bookkeeping on top of the [`CacheStore`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::{join_all, BoxFuture};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::Instant;

use concierge_core::cache::{CacheError, KeyPattern, QueryKey};
use concierge_core::gateway::{self, Filter, Gateway, SelectQuery, Table};
use concierge_core::policy::{InvalidationStrategy, QueryOptions, RefetchOnMount};

use crate::cache::{CacheNotification, CacheStore, FetchHandle, Payload, SharedFetch};
use crate::retry::retry;

/// A fetch that does not map to a single table select.
pub type CustomFetch = Arc<dyn Fn() -> BoxFuture<'static, gateway::Result<Value>> + Send + Sync>;

/// How to (re)load the payload of a key.
#[derive(Clone)]
pub enum QuerySource {
    /// Every row matching a select; the payload is a JSON array.
    List { table: Table, query: SelectQuery },
    /// One row by primary key; the payload is the row, or null.
    Detail { table: Table, id: String },
    Custom(CustomFetch),
}

impl std::fmt::Debug for QuerySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuerySource::List { table, query } => f
                .debug_struct("List")
                .field("table", table)
                .field("query", &query.canonical())
                .finish(),
            QuerySource::Detail { table, id } => f
                .debug_struct("Detail")
                .field("table", table)
                .field("id", id)
                .finish(),
            QuerySource::Custom(_) => f.write_str("Custom"),
        }
    }
}

impl QuerySource {
    pub fn list(table: Table, query: SelectQuery) -> Self {
        QuerySource::List { table, query }
    }

    pub fn detail(table: Table, id: impl Into<String>) -> Self {
        QuerySource::Detail {
            table,
            id: id.into(),
        }
    }

    pub fn custom<F>(fetch: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, gateway::Result<Value>> + Send + Sync + 'static,
    {
        QuerySource::Custom(Arc::new(fetch))
    }

    async fn fetch(&self, gateway: &dyn Gateway) -> gateway::Result<Value> {
        match self {
            QuerySource::List { table, query } => {
                let rows = gateway.select(*table, query).await?;
                Ok(Value::Array(rows))
            }
            QuerySource::Detail { table, id } => {
                let query = SelectQuery::new(Filter::new().eq(table.primary_key(), id.as_str()));
                let rows = gateway.select(*table, &query).await?;
                Ok(rows.into_iter().next().unwrap_or(Value::Null))
            }
            QuerySource::Custom(fetch) => fetch().await,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// Nothing cached and nothing in flight.
    Idle,
    /// First load in progress.
    Loading,
    Success,
    /// The last fetch failed; `data` may still hold an older payload.
    Error,
}

/// Snapshot of one key as seen by a reader.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState {
    pub key: QueryKey,
    pub data: Option<Payload>,
    pub error: Option<CacheError>,
    pub status: QueryStatus,
    pub is_fetching: bool,
    pub is_stale: bool,
    pub updated_at: Option<Instant>,
}

impl QueryState {
    /// True while a refresh runs over data that is already displayed.
    pub fn is_refreshing(&self) -> bool {
        self.is_fetching && self.data.is_some()
    }
}

/// Reads through the cache and keeps observed keys fresh.
///
/// Cloning is cheap; clones share the store and the registered sources.
#[derive(Clone)]
pub struct QueryCoordinator {
    store: CacheStore,
    gateway: Arc<dyn Gateway>,
    sources: Arc<Mutex<HashMap<QueryKey, QuerySource>>>,
}

impl std::fmt::Debug for QueryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCoordinator")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl QueryCoordinator {
    pub fn new(store: CacheStore, gateway: Arc<dyn Gateway>) -> Self {
        Self {
            store,
            gateway,
            sources: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn gateway(&self) -> &Arc<dyn Gateway> {
        &self.gateway
    }

    fn sources(&self) -> MutexGuard<'_, HashMap<QueryKey, QuerySource>> {
        self.sources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn options(&self, key: &QueryKey) -> QueryOptions {
        *self.store.config().options_for(key.namespace())
    }

    fn register(&self, key: &QueryKey, source: &QuerySource) {
        self.sources().insert(key.clone(), source.clone());
    }

    fn source(&self, key: &QueryKey) -> Option<QuerySource> {
        self.sources().get(key).cloned()
    }

    /// Joins the running fetch for `key` or spawns a new one.
    ///
    /// The fetch runs to completion even if every caller stops waiting.
    fn fetch(&self, key: &QueryKey, source: QuerySource) -> SharedFetch {
        let ticket = match self.store.begin_fetch(key) {
            FetchHandle::Joined(shared) => return shared,
            FetchHandle::Started(ticket) => ticket,
        };

        let shared = ticket.shared();
        let store = self.store.clone();
        let gateway = self.gateway.clone();
        let policy = self.options(key).retry;

        tokio::spawn(async move {
            let key = ticket.key().clone();
            let label = format!("fetch {}", key);
            let source = &source;
            let gateway = gateway.as_ref();

            tracing::debug!(%key, "Fetching");
            let result = retry(&policy, &label, move || source.fetch(gateway))
                .await
                .map_err(|failure| {
                    tracing::error!(
                        %key,
                        attempts = failure.attempts,
                        error = %failure.error,
                        "Fetch failed"
                    );
                    CacheError::Fetch {
                        key: key.to_string(),
                        source: failure.error,
                    }
                });
            store.end_fetch(ticket, result);
        });

        shared
    }

    /// Current state of a key, without touching its recency.
    pub fn state(&self, key: &QueryKey) -> QueryState {
        let stale_time = self.options(key).stale_time;
        let Some(entry) = self.store.peek(key) else {
            return QueryState {
                key: key.clone(),
                data: None,
                error: None,
                status: QueryStatus::Idle,
                is_fetching: false,
                is_stale: true,
                updated_at: None,
            };
        };

        let status = if entry.is_fetching && entry.payload.is_none() {
            QueryStatus::Loading
        } else if entry.error.is_some() {
            QueryStatus::Error
        } else if entry.payload.is_some() {
            QueryStatus::Success
        } else {
            QueryStatus::Idle
        };

        QueryState {
            is_stale: entry.is_stale(Instant::now(), stale_time),
            key: entry.key,
            data: entry.payload,
            error: entry.error,
            status,
            is_fetching: entry.is_fetching,
            updated_at: entry.fetched_at,
        }
    }

    /// Reads a key.
    ///
    /// Fresh data is returned as is. Stale data is returned immediately and
    /// refreshed in the background. Without data the read waits for the
    /// fetch, and fails if the fetch fails.
    pub async fn read(&self, key: &QueryKey, source: QuerySource) -> Result<QueryState, CacheError> {
        self.register(key, &source);
        let stale_time = self.options(key).stale_time;

        if let Some(entry) = self.store.get(key) {
            if entry.payload.is_some() {
                self.store.record_hit();
                if entry.is_stale(Instant::now(), stale_time) {
                    tracing::debug!(%key, "Serving stale data, revalidating");
                    let _ = self.fetch(key, source);
                }
                return Ok(self.state(key));
            }
        }

        self.store.record_miss();
        let payload = self.fetch(key, source).await?;
        let mut state = self.state(key);
        if state.data.is_none() {
            // Evicted or overwritten while loading; still answer this read
            state.data = Some(payload);
            state.status = QueryStatus::Success;
        }
        Ok(state)
    }

    /// Registers an observer of `key` and fetches according to the
    /// namespace's mount policy. Invalidated or empty entries always load.
    pub fn mount(&self, key: &QueryKey, source: QuerySource) -> QueryObserver {
        let notifications = self.store.observe();
        self.register(key, &source);
        self.store.acquire(key);

        let options = self.options(key);
        let should_fetch = match self.store.peek(key) {
            None => true,
            Some(entry) if entry.payload.is_none() || entry.invalidated => true,
            Some(entry) => match options.refetch_on_mount {
                RefetchOnMount::Always => true,
                RefetchOnMount::IfStale => entry.is_stale(Instant::now(), options.stale_time),
                RefetchOnMount::Never => false,
            },
        };
        if should_fetch {
            let _ = self.fetch(key, source);
        }

        QueryObserver {
            key: key.clone(),
            coordinator: self.clone(),
            notifications,
        }
    }

    /// Fetches a key regardless of freshness, joining a fetch already in
    /// flight. Keys that were never read are left alone.
    pub async fn refetch(&self, key: &QueryKey) -> Result<QueryState, CacheError> {
        let Some(source) = self.source(key) else {
            return Ok(self.state(key));
        };
        self.fetch(key, source).await?;
        Ok(self.state(key))
    }

    fn is_observed(&self, key: &QueryKey) -> bool {
        self.store.peek(key).is_some_and(|e| e.observers > 0)
    }

    /// Marks every key matching the patterns stale.
    ///
    /// With [`InvalidationStrategy::Active`], observed keys are refetched in
    /// the background.
    pub fn invalidate(&self, patterns: &[KeyPattern], strategy: InvalidationStrategy) -> Vec<QueryKey> {
        let keys = self.mark_stale(patterns);
        if strategy == InvalidationStrategy::Active {
            for key in keys.iter().filter(|key| self.is_observed(key)) {
                if let Some(source) = self.source(key) {
                    let _ = self.fetch(key, source);
                }
            }
        }
        keys
    }

    /// Marks the matching keys stale and waits for every observed one to be
    /// refetched. Fetch failures are recorded on the entries.
    pub async fn invalidate_and_refetch(&self, patterns: &[KeyPattern]) -> Vec<QueryKey> {
        let keys = self.mark_stale(patterns);
        let fetches: Vec<SharedFetch> = keys
            .iter()
            .filter(|key| self.is_observed(key))
            .filter_map(|key| Some(self.fetch(key, self.source(key)?)))
            .collect();
        join_all(fetches).await;
        keys
    }

    fn mark_stale(&self, patterns: &[KeyPattern]) -> Vec<QueryKey> {
        let mut keys: Vec<QueryKey> = Vec::new();
        for pattern in patterns {
            for key in self.store.invalidate(pattern) {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        keys
    }

    /// Refetches stale observed keys of namespaces that refresh on focus.
    pub fn on_focus(&self) -> Vec<QueryKey> {
        let now = Instant::now();
        let keys: Vec<QueryKey> = self
            .store
            .keys_matching(&KeyPattern::glob("*"))
            .into_iter()
            .filter(|key| {
                let options = self.options(key);
                options.refetch_on_focus
                    && self.store.peek(key).is_some_and(|entry| {
                        entry.observers > 0 && entry.is_stale(now, options.stale_time)
                    })
            })
            .collect();

        for key in &keys {
            if let Some(source) = self.source(key) {
                let _ = self.fetch(key, source);
            }
        }
        if !keys.is_empty() {
            tracing::debug!(count = keys.len(), "Refetching on focus");
        }
        keys
    }

    /// Evicts expired unobserved entries and forgets their sources.
    pub fn sweep(&self, now: Instant) -> Vec<QueryKey> {
        let evicted = self.store.collect_garbage(now);
        self.sources().retain(|key, _| self.store.contains(key));
        evicted
    }

    /// Every list query of a table that has been read and is still cached.
    pub fn list_queries(&self, table: Table) -> Vec<(QueryKey, SelectQuery)> {
        self.sources()
            .iter()
            .filter_map(|(key, source)| match source {
                QuerySource::List { table: t, query } if *t == table => {
                    Some((key.clone(), query.clone()))
                }
                _ => None,
            })
            .collect()
    }
}

/// A live subscription to one key.
///
/// The entry is never evicted while an observer exists. Dropping the
/// observer starts the entry's retention window.
pub struct QueryObserver {
    key: QueryKey,
    coordinator: QueryCoordinator,
    notifications: broadcast::Receiver<CacheNotification>,
}

impl std::fmt::Debug for QueryObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryObserver")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl QueryObserver {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn state(&self) -> QueryState {
        self.coordinator.state(&self.key)
    }

    /// Waits until the observed key changes. Returns false once the store
    /// is gone.
    pub async fn changed(&mut self) -> bool {
        loop {
            match self.notifications.recv().await {
                Ok(notification) if notification.key == self.key => return true,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(key = %self.key, lagged = n, "Observer lagged");
                    return true;
                }
                Err(broadcast::error::RecvError::Closed) => return false,
            }
        }
    }

    pub async fn refetch(&self) -> Result<QueryState, CacheError> {
        self.coordinator.refetch(&self.key).await
    }
}

impl Drop for QueryObserver {
    fn drop(&mut self) {
        self.coordinator.store.release(&self.key);
    }
}
