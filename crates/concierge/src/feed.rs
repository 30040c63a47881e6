//! Change-feed listener.
//!
//! Keeps one subscription per table no matter how many consumers attach,
//! and turns every remote change into invalidations through the same
//! routing rules local writes use.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use concierge_core::cache::{namespace_pattern, QueryKey};
use concierge_core::gateway::{ChangeEvent, ChangeFeed, GatewayError, Table};
use concierge_core::invalidation::{EntityEvent, InvalidationRouter};
use concierge_core::policy::InvalidationStrategy;

use crate::query::QueryCoordinator;

struct Subscription {
    id: u64,
    consumers: usize,
    task: JoinHandle<()>,
}

type Subscriptions = Arc<Mutex<HashMap<Table, Subscription>>>;

fn lock(subscriptions: &Subscriptions) -> MutexGuard<'_, HashMap<Table, Subscription>> {
    subscriptions.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Invalidates what a remote change affects, refetching observed keys.
pub(crate) fn apply_change(
    queries: &QueryCoordinator,
    router: &InvalidationRouter,
    event: &ChangeEvent,
) -> Vec<QueryKey> {
    let patterns = router.route(&EntityEvent::from_feed(event));
    queries.invalidate(&patterns, InvalidationStrategy::Active)
}

/// Routes change-feed events into cache invalidations.
#[derive(Clone)]
pub struct ChangeFeedListener {
    feed: Arc<dyn ChangeFeed>,
    queries: QueryCoordinator,
    router: InvalidationRouter,
    subscriptions: Subscriptions,
    next_id: Arc<AtomicU64>,
    shutdown_tx: broadcast::Sender<()>,
}

impl std::fmt::Debug for ChangeFeedListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeedListener")
            .field("active_tables", &self.active_tables())
            .finish_non_exhaustive()
    }
}

impl ChangeFeedListener {
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        queries: QueryCoordinator,
        router: InvalidationRouter,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            feed,
            queries,
            router,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            shutdown_tx,
        }
    }

    /// Registers a consumer of a table's changes.
    ///
    /// The first consumer opens the subscription; the subscription is live
    /// when this returns. Dropping the last guard closes it.
    pub async fn attach(&self, table: Table) -> Result<FeedGuard, GatewayError> {
        if let Some(guard) = self.join(table) {
            return Ok(guard);
        }

        let receiver = self.feed.subscribe(table).await?;

        let mut subscriptions = lock(&self.subscriptions);
        // Another consumer may have subscribed while we were waiting
        if let Some(subscription) = subscriptions.get_mut(&table) {
            subscription.consumers += 1;
            return Ok(self.guard(table, subscription.id));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let task = tokio::spawn(listen(
            table,
            id,
            receiver,
            self.shutdown_tx.subscribe(),
            self.queries.clone(),
            self.router,
            self.subscriptions.clone(),
        ));
        subscriptions.insert(
            table,
            Subscription {
                id,
                consumers: 1,
                task,
            },
        );
        tracing::debug!(%table, "Change feed subscribed");
        Ok(self.guard(table, id))
    }

    fn join(&self, table: Table) -> Option<FeedGuard> {
        let mut subscriptions = lock(&self.subscriptions);
        let subscription = subscriptions.get_mut(&table)?;
        subscription.consumers += 1;
        Some(self.guard(table, subscription.id))
    }

    fn guard(&self, table: Table, id: u64) -> FeedGuard {
        FeedGuard {
            table,
            id,
            subscriptions: self.subscriptions.clone(),
        }
    }

    /// Consumers attached to a table.
    pub fn consumer_count(&self, table: Table) -> usize {
        lock(&self.subscriptions)
            .get(&table)
            .map_or(0, |subscription| subscription.consumers)
    }

    /// Tables with an open subscription, in table order.
    pub fn active_tables(&self) -> Vec<Table> {
        let mut tables: Vec<Table> = lock(&self.subscriptions).keys().copied().collect();
        tables.sort();
        tables
    }
}

async fn listen(
    table: Table,
    id: u64,
    mut receiver: broadcast::Receiver<ChangeEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
    queries: QueryCoordinator,
    router: InvalidationRouter,
    subscriptions: Subscriptions,
) {
    tracing::debug!(%table, "Change listener started");

    loop {
        tokio::select! {
            result = receiver.recv() => {
                match result {
                    Ok(event) => {
                        let keys = apply_change(&queries, &router, &event);
                        tracing::trace!(%table, kind = ?event.kind, invalidated = keys.len(), "Applied remote change");
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // Missed changes could touch anything in the table
                        tracing::warn!(%table, lagged = n, "Change listener lagged");
                        queries.invalidate(&[namespace_pattern(table)], InvalidationStrategy::Active);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!(%table, "Change feed closed");
                        break;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::debug!(%table, "Change listener shutting down");
                break;
            }
        }
    }

    let mut subscriptions = lock(&subscriptions);
    if subscriptions.get(&table).is_some_and(|s| s.id == id) {
        subscriptions.remove(&table);
    }
}

/// Keeps a table's change subscription open.
#[must_use = "the subscription closes when the guard is dropped"]
pub struct FeedGuard {
    table: Table,
    id: u64,
    subscriptions: Subscriptions,
}

impl std::fmt::Debug for FeedGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedGuard").field("table", &self.table).finish()
    }
}

impl FeedGuard {
    pub fn table(&self) -> Table {
        self.table
    }
}

impl Drop for FeedGuard {
    fn drop(&mut self) {
        let mut subscriptions = lock(&self.subscriptions);
        let Some(subscription) = subscriptions.get_mut(&self.table) else {
            return;
        };
        if subscription.id != self.id {
            return;
        }
        subscription.consumers = subscription.consumers.saturating_sub(1);
        if subscription.consumers == 0 {
            if let Some(subscription) = subscriptions.remove(&self.table) {
                subscription.task.abort();
                tracing::debug!(table = %self.table, "Change feed unsubscribed");
            }
        }
    }
}
