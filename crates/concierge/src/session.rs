//! One client session: a single cache shared by every resource, the
//! coordinators around it and the background tasks that keep it tidy.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use tokio::sync::broadcast;
use tokio::time::Instant;

use concierge_core::cache::{dashboard_key, from_payload, CacheError, QueryKey};
use concierge_core::domain::{
    Booking, Commission, Document, Entity, Expense, Invoice, Job, Property, Task,
};
use concierge_core::gateway::{ChangeFeed, Gateway};
use concierge_core::invalidation::InvalidationRouter;

use crate::cache::{CacheStats, CacheStore};
use crate::config::Config;
use crate::feed::ChangeFeedListener;
use crate::mutation::MutationCoordinator;
use crate::query::{QueryCoordinator, QueryObserver, QuerySource};
use crate::reports::{DashboardSummary, ReportService};
use crate::resource::Resource;

/// Wires the cache, coordinators and change-feed listener together.
///
/// Must be created inside a tokio runtime. Background tasks stop on
/// [`Session::shutdown`] or when the session is dropped.
pub struct Session {
    queries: QueryCoordinator,
    mutations: MutationCoordinator,
    listener: ChangeFeedListener,
    reports: ReportService,
    shutdown_tx: broadcast::Sender<()>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("store", self.queries.store())
            .field("listener", &self.listener)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(gateway: Arc<dyn Gateway>, feed: Arc<dyn ChangeFeed>, config: &Config) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let router = InvalidationRouter::default();

        let store = CacheStore::new(config.cache_max_entries, Arc::new(config.query_config()));
        let queries = QueryCoordinator::new(store, gateway.clone());
        let mutations =
            MutationCoordinator::new(queries.clone(), router, config.mutation_policies());
        let listener = ChangeFeedListener::new(feed, queries.clone(), router, shutdown_tx.clone());

        spawn_sweeper(queries.clone(), config.gc_interval(), shutdown_tx.subscribe());
        tracing::info!(max_entries = config.cache_max_entries, "Session started");

        Self {
            queries,
            mutations,
            listener,
            reports: ReportService::new(gateway),
            shutdown_tx,
        }
    }

    /// Session over a gateway that also publishes the change feed.
    pub fn with_gateway<G>(gateway: G, config: &Config) -> Self
    where
        G: Gateway + ChangeFeed + 'static,
    {
        let gateway = Arc::new(gateway);
        Self::new(gateway.clone(), gateway, config)
    }

    pub fn resource<E: Entity>(&self) -> Resource<E> {
        Resource::new(
            self.queries.clone(),
            self.mutations.clone(),
            self.listener.clone(),
        )
    }

    pub fn properties(&self) -> Resource<Property> {
        self.resource()
    }

    pub fn tasks(&self) -> Resource<Task> {
        self.resource()
    }

    pub fn jobs(&self) -> Resource<Job> {
        self.resource()
    }

    pub fn bookings(&self) -> Resource<Booking> {
        self.resource()
    }

    pub fn invoices(&self) -> Resource<Invoice> {
        self.resource()
    }

    pub fn expenses(&self) -> Resource<Expense> {
        self.resource()
    }

    pub fn commissions(&self) -> Resource<Commission> {
        self.resource()
    }

    pub fn documents(&self) -> Resource<Document> {
        self.resource()
    }

    pub fn reports(&self) -> &ReportService {
        &self.reports
    }

    pub fn queries(&self) -> &QueryCoordinator {
        &self.queries
    }

    pub fn listener(&self) -> &ChangeFeedListener {
        &self.listener
    }

    fn dashboard_source(&self) -> (QueryKey, QuerySource) {
        let reports = self.reports.clone();
        let source = QuerySource::custom(move || {
            let reports = reports.clone();
            async move { reports.dashboard_payload(Utc::now().date_naive()).await }.boxed()
        });
        (dashboard_key("summary"), source)
    }

    /// The cached dashboard summary. Property, task, booking, invoice and
    /// expense writes invalidate it.
    pub async fn dashboard(&self) -> Result<DashboardSummary, CacheError> {
        let (key, source) = self.dashboard_source();
        let state = self.queries.read(&key, source).await?;
        let payload = state
            .data
            .ok_or_else(|| CacheError::Abandoned { key: key.to_string() })?;
        from_payload(&payload).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    pub fn observe_dashboard(&self) -> QueryObserver {
        let (key, source) = self.dashboard_source();
        self.queries.mount(&key, source)
    }

    /// Call when the application regains focus.
    pub fn on_focus(&self) -> Vec<QueryKey> {
        self.queries.on_focus()
    }

    pub fn stats(&self) -> CacheStats {
        self.queries.store().stats()
    }

    /// Stops the change-feed listeners and the retention sweep.
    pub fn shutdown(&self) {
        if self.shutdown_tx.send(()).is_ok() {
            tracing::info!("Session shutting down");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_sweeper(queries: QueryCoordinator, period: Duration, mut shutdown_rx: broadcast::Receiver<()>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = queries.sweep(Instant::now());
                    if !evicted.is_empty() {
                        tracing::debug!(count = evicted.len(), "Evicted expired entries");
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::debug!("Retention sweep stopped");
                    break;
                }
            }
        }
    });
}
