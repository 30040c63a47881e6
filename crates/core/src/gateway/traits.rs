use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{ChangeEvent, Filter, Result, Row, SelectQuery, Table};

/// Request/response primitives of the remote data store.
///
/// Implementations carry their own timeouts; callers only decide whether
/// to retry a failed call.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Selects rows matching the query.
    async fn select(&self, table: Table, query: &SelectQuery) -> Result<Vec<Row>>;

    /// Inserts rows and returns them as stored (with server-assigned columns).
    async fn insert(&self, table: Table, rows: &[Row]) -> Result<Vec<Row>>;

    /// Applies a partial patch to every row matching the filter and returns
    /// the updated rows.
    async fn update(&self, table: Table, patch: &Row, filter: &Filter) -> Result<Vec<Row>>;

    /// Deletes every row matching the filter.
    async fn delete(&self, table: Table, filter: &Filter) -> Result<()>;
}

/// Per-table change notifications.
///
/// Dropping the returned receiver ends the subscription.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Subscribes to insert/update/delete notifications for a table.
    async fn subscribe(&self, table: Table) -> Result<broadcast::Receiver<ChangeEvent>>;
}

/// Combined trait for gateways that also publish a change feed.
pub trait FullGateway: Gateway + ChangeFeed {}

impl<T: Gateway + ChangeFeed> FullGateway for T {}
