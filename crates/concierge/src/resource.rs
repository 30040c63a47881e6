//! Typed read and write surface for one entity.
//!
//! A [`Resource`] is what screens talk to: it builds the query keys, decodes
//! cached payloads into domain records and runs writes through the
//! mutation coordinator.

use std::marker::PhantomData;

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use concierge_core::cache::{
    detail_key, from_payload, list_from_payload, list_key, to_payload, CacheError, QueryKey,
};
use concierge_core::domain::{Entity, NewProperty, Property};
use concierge_core::gateway::{Filter, GatewayError, SelectQuery};
use concierge_core::mutation::{self, MutationOutcome, MutationRequest, SecondaryWrite};
use concierge_core::optimistic::is_provisional;

use crate::feed::{ChangeFeedListener, FeedGuard};
use crate::mutation::MutationCoordinator;
use crate::query::{QueryCoordinator, QueryObserver, QuerySource, QueryState, QueryStatus};

/// A decoded list query.
#[derive(Debug, Clone, PartialEq)]
pub struct ListView<E> {
    pub items: Vec<E>,
    /// Ids of items that exist only as optimistic inserts so far.
    pub provisional_ids: Vec<Uuid>,
    /// Optimistic inserts that do not decode as `E` yet, typically because
    /// the gateway fills some columns. They land in `items` once confirmed.
    pub pending_rows: Vec<Value>,
    pub loading: bool,
    pub is_refreshing: bool,
    pub error: Option<CacheError>,
}

impl<E: Entity> ListView<E> {
    fn from_state(state: QueryState) -> Result<Self, CacheError> {
        let (items, pending_rows, provisional_ids) = match state.data.as_deref() {
            Some(payload) => {
                let (items, pending_rows) = decode_rows::<E>(payload)?;
                (items, pending_rows, provisional_ids::<E>(payload))
            }
            None => (Vec::new(), Vec::new(), Vec::new()),
        };
        Ok(Self {
            items,
            provisional_ids,
            pending_rows,
            loading: state.status == QueryStatus::Loading,
            is_refreshing: state.is_refreshing(),
            error: state.error,
        })
    }

    pub fn is_provisional(&self, id: Uuid) -> bool {
        self.provisional_ids.contains(&id)
    }
}

/// Decodes a list payload. Confirmed rows must decode; provisional rows
/// that do not are set aside instead of failing the whole list.
fn decode_rows<E: Entity>(payload: &Value) -> Result<(Vec<E>, Vec<Value>), CacheError> {
    let Some(rows) = payload.as_array() else {
        let items =
            list_from_payload(payload).map_err(|e| CacheError::Serialization(e.to_string()))?;
        return Ok((items, Vec::new()));
    };

    let mut items = Vec::with_capacity(rows.len());
    let mut pending = Vec::new();
    for row in rows {
        match from_payload::<E>(row) {
            Ok(item) => items.push(item),
            Err(err) if is_provisional(row) => {
                tracing::trace!(table = %E::TABLE, error = %err, "Provisional row not decodable yet");
                pending.push(row.clone());
            }
            Err(err) => return Err(CacheError::Serialization(err.to_string())),
        }
    }
    Ok((items, pending))
}

fn provisional_ids<E: Entity>(payload: &Value) -> Vec<Uuid> {
    let Some(rows) = payload.as_array() else {
        return Vec::new();
    };
    rows.iter()
        .filter(|row| is_provisional(row))
        .filter_map(|row| E::TABLE.row_id(row))
        .filter_map(|id| Uuid::parse_str(&id).ok())
        .collect()
}

/// A decoded detail query. `item` is `None` when the record does not exist.
#[derive(Debug, Clone, PartialEq)]
pub struct DetailView<E> {
    pub item: Option<E>,
    pub loading: bool,
    pub error: Option<CacheError>,
}

impl<E: Entity> DetailView<E> {
    fn from_state(state: QueryState) -> Result<Self, CacheError> {
        let item = match state.data.as_deref() {
            None | Some(Value::Null) => None,
            Some(payload) => {
                Some(from_payload(payload).map_err(|e| CacheError::Serialization(e.to_string()))?)
            }
        };
        Ok(Self {
            item,
            loading: state.status == QueryStatus::Loading,
            error: state.error,
        })
    }
}

/// Read and write access to one table, decoded as `E`.
pub struct Resource<E> {
    queries: QueryCoordinator,
    mutations: MutationCoordinator,
    listener: ChangeFeedListener,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for Resource<E> {
    fn clone(&self) -> Self {
        Self {
            queries: self.queries.clone(),
            mutations: self.mutations.clone(),
            listener: self.listener.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> std::fmt::Debug for Resource<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("table", &E::TABLE)
            .finish_non_exhaustive()
    }
}

impl<E: Entity> Resource<E> {
    pub fn new(
        queries: QueryCoordinator,
        mutations: MutationCoordinator,
        listener: ChangeFeedListener,
    ) -> Self {
        Self {
            queries,
            mutations,
            listener,
            _entity: PhantomData,
        }
    }

    fn list_source(query: SelectQuery) -> (QueryKey, QuerySource) {
        (list_key(E::TABLE, &query), QuerySource::list(E::TABLE, query))
    }

    fn detail_source(id: Uuid) -> (QueryKey, QuerySource) {
        let id = id.to_string();
        (detail_key(E::TABLE, &id), QuerySource::detail(E::TABLE, id))
    }

    /// Rows matching `filter`, in store order.
    pub async fn list(&self, filter: Filter) -> Result<ListView<E>, CacheError> {
        self.list_query(SelectQuery::new(filter)).await
    }

    pub async fn list_query(&self, query: SelectQuery) -> Result<ListView<E>, CacheError> {
        let (key, source) = Self::list_source(query);
        ListView::from_state(self.queries.read(&key, source).await?)
    }

    /// Keeps a list live: remote changes to the table refresh it while the
    /// observer exists.
    pub async fn observe_list(&self, query: SelectQuery) -> Result<ListObserver<E>, GatewayError> {
        let feed = self.listener.attach(E::TABLE).await?;
        let (key, source) = Self::list_source(query);
        Ok(ListObserver {
            observer: self.queries.mount(&key, source),
            _feed: feed,
            _entity: PhantomData,
        })
    }

    pub async fn refetch_list(&self, filter: Filter) -> Result<ListView<E>, CacheError> {
        let (key, source) = Self::list_source(SelectQuery::new(filter));
        // Make sure the source is known even if the list was never read
        let state = match self.queries.refetch(&key).await? {
            state if state.status == QueryStatus::Idle => self.queries.read(&key, source).await?,
            state => state,
        };
        ListView::from_state(state)
    }

    pub async fn detail(&self, id: Uuid) -> Result<DetailView<E>, CacheError> {
        let (key, source) = Self::detail_source(id);
        DetailView::from_state(self.queries.read(&key, source).await?)
    }

    pub async fn observe_detail(&self, id: Uuid) -> Result<DetailObserver<E>, GatewayError> {
        let feed = self.listener.attach(E::TABLE).await?;
        let (key, source) = Self::detail_source(id);
        Ok(DetailObserver {
            observer: self.queries.mount(&key, source),
            _feed: feed,
            _entity: PhantomData,
        })
    }

    pub async fn refetch_detail(&self, id: Uuid) -> Result<DetailView<E>, CacheError> {
        let (key, source) = Self::detail_source(id);
        let state = match self.queries.refetch(&key).await? {
            state if state.status == QueryStatus::Idle => self.queries.read(&key, source).await?,
            state => state,
        };
        DetailView::from_state(state)
    }

    /// Creates a record. It shows up in cached lists right away, marked
    /// provisional until the server confirms it.
    pub async fn create<I: Serialize>(&self, input: &I) -> mutation::Result<MutationOutcome<E>> {
        self.create_with(input, Vec::new()).await
    }

    /// Creates a record and then its dependent rows.
    pub async fn create_with<I: Serialize>(
        &self,
        input: &I,
        secondary: Vec<SecondaryWrite>,
    ) -> mutation::Result<MutationOutcome<E>> {
        let mut request = MutationRequest::create(E::TABLE, to_payload(input)?);
        for write in secondary {
            request = request.with_secondary(write);
        }
        let outcome = self.mutations.mutate(request).await?;
        Ok(outcome.try_map(|row| from_payload::<E>(&row))?)
    }

    /// Applies a partial update and returns the confirmed record.
    pub async fn update<P: Serialize>(&self, id: Uuid, patch: &P) -> mutation::Result<E> {
        let request = MutationRequest::update(E::TABLE, id.to_string(), to_payload(patch)?);
        let row = self.mutations.mutate(request).await?.into_record();
        Ok(from_payload(&row)?)
    }

    pub async fn remove(&self, id: Uuid) -> mutation::Result<()> {
        self.mutations
            .mutate(MutationRequest::delete(E::TABLE, id.to_string()))
            .await?;
        Ok(())
    }

    /// True while a write to this table is in flight.
    pub fn is_pending(&self) -> bool {
        self.mutations.is_pending(E::TABLE)
    }
}

impl Resource<Property> {
    /// Creates a property, then its location and amenities. Failed
    /// location or amenity writes come back as warnings.
    pub async fn create_property(
        &self,
        input: &NewProperty,
    ) -> mutation::Result<MutationOutcome<Property>> {
        self.create_with(input, input.secondary_writes()).await
    }
}

/// A live list of `E`.
pub struct ListObserver<E> {
    observer: QueryObserver,
    _feed: FeedGuard,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> ListObserver<E> {
    pub fn key(&self) -> &QueryKey {
        self.observer.key()
    }

    pub fn view(&self) -> Result<ListView<E>, CacheError> {
        ListView::from_state(self.observer.state())
    }

    /// Waits for the next change. Returns false once the session is gone.
    pub async fn changed(&mut self) -> bool {
        self.observer.changed().await
    }

    pub async fn refetch(&self) -> Result<ListView<E>, CacheError> {
        ListView::from_state(self.observer.refetch().await?)
    }
}

/// A live single record.
pub struct DetailObserver<E> {
    observer: QueryObserver,
    _feed: FeedGuard,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> DetailObserver<E> {
    pub fn view(&self) -> Result<DetailView<E>, CacheError> {
        DetailView::from_state(self.observer.state())
    }

    pub async fn changed(&mut self) -> bool {
        self.observer.changed().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use concierge_core::domain::{NewLocation, Task, TaskStatus};
    use concierge_core::gateway::{Gateway, GatewayError, Table};
    use concierge_core::invalidation::InvalidationRouter;
    use concierge_core::mutation::MutationError;
    use concierge_core::policy::{MutationPolicies, QueryConfig, QueryOptions, RetryPolicy};
    use serde_json::json;
    use tokio::sync::broadcast;

    use crate::cache::CacheStore;
    use crate::gateway::{GatewayOp, InMemoryGateway};

    const PROPERTY: &str = "7b0c3c1e-0f7e-4d0a-9a59-5a3f4f1e2c01";
    const TASK: &str = "c5a4e0f2-8d4b-4f7e-b1b6-2d9c1e3a4b02";

    struct Harness {
        gateway: InMemoryGateway,
        queries: QueryCoordinator,
        mutations: MutationCoordinator,
        listener: ChangeFeedListener,
    }

    impl Harness {
        fn resource<E: Entity>(&self) -> Resource<E> {
            Resource::new(
                self.queries.clone(),
                self.mutations.clone(),
                self.listener.clone(),
            )
        }
    }

    async fn harness() -> Harness {
        let gateway = InMemoryGateway::new();
        gateway
            .seed(
                Table::Tasks,
                vec![json!({"task_id": TASK, "title": "Clean pool", "status": "pending", "property_id": PROPERTY})],
            )
            .await;
        gateway
            .seed(Table::Properties, vec![json!({"property_id": PROPERTY, "name": "Casa Azul"})])
            .await;

        let config = QueryConfig::new(QueryOptions::default().retry(RetryPolicy::none()));
        let store = CacheStore::new(100, Arc::new(config));
        let queries = QueryCoordinator::new(store, Arc::new(gateway.clone()));
        let mutations = MutationCoordinator::new(
            queries.clone(),
            InvalidationRouter::default(),
            MutationPolicies::none(),
        );
        let (shutdown_tx, _) = broadcast::channel(1);
        let listener = ChangeFeedListener::new(
            Arc::new(gateway.clone()),
            queries.clone(),
            InvalidationRouter::default(),
            shutdown_tx,
        );
        Harness {
            gateway,
            queries,
            mutations,
            listener,
        }
    }

    fn uuid(s: &str) -> Uuid {
        Uuid::parse_str(s).unwrap()
    }

    #[tokio::test]
    async fn test_list_decodes_records() {
        let h = harness().await;
        let tasks = h.resource::<Task>();

        let view = tasks.list(Filter::new().eq("property_id", PROPERTY)).await.unwrap();
        assert_eq!(view.items.len(), 1);
        assert_eq!(view.items[0].title, "Clean pool");
        assert_eq!(view.items[0].status, TaskStatus::Pending);
        assert!(view.provisional_ids.is_empty());
        assert!(!view.loading);

        let view = tasks.list(Filter::new().eq("property_id", "elsewhere")).await.unwrap();
        assert!(view.items.is_empty());
    }

    #[tokio::test]
    async fn test_missing_detail_has_no_item() {
        let h = harness().await;
        let view = h
            .resource::<Task>()
            .detail(Uuid::new_v4())
            .await
            .unwrap();
        assert!(view.item.is_none());
        assert!(view.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_is_provisional_until_confirmed() {
        let h = harness().await;
        let tasks = h.resource::<Task>();
        tasks.list(Filter::new()).await.unwrap();
        h.gateway.set_latency(Duration::from_millis(50));

        let writer = tasks.clone();
        let write = tokio::spawn(async move {
            writer
                .create(&json!({"title": "Restock towels", "status": "pending"}))
                .await
        });
        tokio::task::yield_now().await;

        let view = tasks.list(Filter::new()).await.unwrap();
        assert_eq!(view.items.len(), 2);
        assert_eq!(view.provisional_ids.len(), 1);
        assert!(view.is_provisional(view.items[1].task_id));
        assert!(tasks.is_pending());

        let created = write.await.unwrap().unwrap().into_record();
        let view = tasks.list(Filter::new()).await.unwrap();
        assert!(view.provisional_ids.is_empty());
        assert!(view.items.iter().any(|task| task.task_id == created.task_id));
        assert!(!tasks.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_reads_while_create_omits_server_defaults() {
        let h = harness().await;
        let tasks = h.resource::<Task>();
        tasks.list(Filter::new()).await.unwrap();
        h.gateway.set_latency(Duration::from_millis(50));
        h.gateway.fail_next(GatewayOp::Insert, GatewayError::validation("status is required"));

        let writer = tasks.clone();
        let write = tokio::spawn(async move { writer.create(&json!({"title": "Restock towels"})).await });
        tokio::task::yield_now().await;

        let view = tasks.list(Filter::new()).await.unwrap();
        assert_eq!(view.items.len(), 1);
        assert_eq!(view.provisional_ids.len(), 1);
        assert_eq!(view.pending_rows.len(), 1);
        assert_eq!(view.pending_rows[0]["title"], "Restock towels");

        assert!(write.await.unwrap().is_err());
        let view = tasks.list(Filter::new()).await.unwrap();
        assert_eq!(view.items.len(), 1);
        assert!(view.pending_rows.is_empty());
        assert!(view.provisional_ids.is_empty());
    }

    #[tokio::test]
    async fn test_update_returns_confirmed_record() {
        let h = harness().await;
        let tasks = h.resource::<Task>();
        tasks.detail(uuid(TASK)).await.unwrap();

        let task = tasks
            .update(uuid(TASK), &json!({"status": "in_progress"}))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);

        let view = tasks.detail(uuid(TASK)).await.unwrap();
        assert_eq!(view.item.unwrap().status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn test_rejected_update_surfaces_error() {
        let h = harness().await;
        let tasks = h.resource::<Task>();
        h.gateway.fail_next(GatewayOp::Update, GatewayError::permission("read only"));

        let err = tasks
            .update(uuid(TASK), &json!({"title": "Renamed"}))
            .await
            .unwrap_err();
        assert!(matches!(err, MutationError::Rejected { .. }));

        let view = tasks.list(Filter::new()).await.unwrap();
        assert_eq!(view.items[0].title, "Clean pool");
    }

    #[tokio::test]
    async fn test_remove() {
        let h = harness().await;
        let tasks = h.resource::<Task>();
        tasks.list(Filter::new()).await.unwrap();

        tasks.remove(uuid(TASK)).await.unwrap();
        assert!(tasks.list(Filter::new()).await.unwrap().items.is_empty());
        assert!(h.gateway.rows(Table::Tasks).await.is_empty());
    }

    #[tokio::test]
    async fn test_create_property_writes_location_and_amenities() {
        let h = harness().await;
        let properties = h.resource::<Property>();

        let mut input = NewProperty::new("Beach House");
        input.location = Some(NewLocation {
            city: Some("Punta del Este".to_string()),
            ..NewLocation::default()
        });
        input.amenities = vec!["pool".to_string(), "wifi".to_string()];

        let outcome = properties.create_property(&input).await.unwrap();
        assert!(!outcome.has_warnings());
        let property_id = outcome.record().property_id.to_string();

        let locations = h.gateway.rows(Table::PropertyLocations).await;
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0]["property_id"], property_id.as_str());
        assert_eq!(h.gateway.rows(Table::PropertyAmenities).await.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_amenities_are_warnings() {
        let h = harness().await;
        h.gateway.fail_next_on(
            Table::PropertyAmenities,
            GatewayOp::Insert,
            GatewayError::validation("unknown amenity"),
        );

        let mut input = NewProperty::new("Loft");
        input.amenities = vec!["sauna".to_string()];
        let outcome = h.resource::<Property>().create_property(&input).await.unwrap();

        assert_eq!(outcome.warnings().len(), 1);
        assert_eq!(outcome.warnings()[0].table, Table::PropertyAmenities);
        assert_eq!(outcome.record().name, "Loft");
        assert_eq!(h.gateway.rows(Table::Properties).await.len(), 2);
    }

    #[tokio::test]
    async fn test_observed_list_follows_remote_writes() {
        let h = harness().await;
        let mut observer = h
            .resource::<Task>()
            .observe_list(SelectQuery::default())
            .await
            .unwrap();
        while observer.view().unwrap().items.is_empty() {
            observer.changed().await;
        }

        h.gateway
            .insert(Table::Tasks, &[json!({"title": "Check smoke alarm", "status": "pending"})])
            .await
            .unwrap();

        while observer.view().unwrap().items.len() < 2 {
            assert!(observer.changed().await);
        }
        assert_eq!(h.listener.consumer_count(Table::Tasks), 1);
        drop(observer);
        assert_eq!(h.listener.consumer_count(Table::Tasks), 0);
    }

    #[tokio::test]
    async fn test_refetch_detail_reads_unknown_key() {
        let h = harness().await;
        let view = h
            .resource::<Property>()
            .refetch_detail(uuid(PROPERTY))
            .await
            .unwrap();
        assert_eq!(view.item.unwrap().name, "Casa Azul");
        assert_eq!(h.gateway.calls(Table::Properties, GatewayOp::Select), 1);
    }
}
