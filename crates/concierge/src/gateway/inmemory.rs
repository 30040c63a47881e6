//! In-memory gateway for tests and the demo.
//!
//! Behaves like the hosted store for the operations the coordinators use:
//! it assigns primary keys, enforces their uniqueness, applies filters and
//! ordering, and publishes a change event for every row it writes. Failures
//! and latency can be injected per operation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use concierge_core::gateway::{
    ChangeEvent, ChangeFeed, Filter, Gateway, GatewayError, RejectionReason, Result, Row,
    SelectQuery, Table,
};
use concierge_core::optimistic::merge_patch;

/// Channel capacity for change events.
const CHANNEL_CAPACITY: usize = 100;

/// Gateway operations, for failure injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayOp {
    Select,
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Default)]
struct Controls {
    failures: Vec<(Option<Table>, GatewayOp, GatewayError)>,
    calls: HashMap<(Table, GatewayOp), usize>,
    latency: Duration,
}

/// In-memory data store with a change feed.
///
/// Clones share the same tables, so several sessions can talk to one
/// store and see each other's writes through the feed.
#[derive(Debug, Clone, Default)]
pub struct InMemoryGateway {
    tables: Arc<RwLock<HashMap<Table, Vec<Row>>>>,
    channels: Arc<RwLock<HashMap<Table, broadcast::Sender<ChangeEvent>>>>,
    controls: Arc<Mutex<Controls>>,
}

impl InMemoryGateway {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn controls(&self) -> std::sync::MutexGuard<'_, Controls> {
        self.controls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next `op` on any table fail with `error`.
    pub fn fail_next(&self, op: GatewayOp, error: GatewayError) {
        self.controls().failures.push((None, op, error));
    }

    /// Makes the next `op` on `table` fail with `error`.
    pub fn fail_next_on(&self, table: Table, op: GatewayOp, error: GatewayError) {
        self.controls().failures.push((Some(table), op, error));
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.controls().latency = latency;
    }

    /// Number of `op` calls made on `table`, failed ones included.
    pub fn calls(&self, table: Table, op: GatewayOp) -> usize {
        self.controls().calls.get(&(table, op)).copied().unwrap_or(0)
    }

    /// Stores rows without publishing change events.
    pub async fn seed(&self, table: Table, rows: Vec<Row>) {
        let mut tables = self.tables.write().await;
        tables.entry(table).or_default().extend(rows);
    }

    /// Every row of a table, in insertion order.
    pub async fn rows(&self, table: Table) -> Vec<Row> {
        let tables = self.tables.read().await;
        tables.get(&table).cloned().unwrap_or_default()
    }

    /// Publishes a change as if another client had written it.
    pub async fn publish(&self, event: ChangeEvent) {
        let sender = self.get_or_create_channel(event.table).await;
        // No subscribers is fine
        let _ = sender.send(event);
    }

    /// Records the call and returns the injected failure, if any.
    async fn begin(&self, table: Table, op: GatewayOp) -> Result<()> {
        let (latency, failure) = {
            let mut controls = self.controls();
            *controls.calls.entry((table, op)).or_insert(0) += 1;
            let index = controls
                .failures
                .iter()
                .position(|(t, o, _)| *o == op && t.is_none_or(|t| t == table));
            let failure = index.map(|i| controls.failures.remove(i).2);
            (controls.latency, failure)
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn get_or_create_channel(&self, table: Table) -> broadcast::Sender<ChangeEvent> {
        {
            let channels = self.channels.read().await;
            if let Some(sender) = channels.get(&table) {
                return sender.clone();
            }
        }

        let mut channels = self.channels.write().await;
        if let Some(sender) = channels.get(&table) {
            return sender.clone();
        }

        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        channels.insert(table, sender.clone());
        sender
    }
}

fn has_created_at(table: Table) -> bool {
    matches!(table, Table::Properties | Table::Tasks | Table::Jobs)
}

/// Fills in server-assigned columns.
fn prepare_row(table: Table, row: &Row) -> Result<Row> {
    let Value::Object(map) = row else {
        return Err(GatewayError::validation(format!(
            "{} rows must be JSON objects",
            table
        )));
    };
    let mut map = map.clone();
    let pk = table.primary_key();
    if map.get(pk).is_none_or(Value::is_null) {
        map.insert(pk.to_string(), Value::String(Uuid::new_v4().to_string()));
    }
    if has_created_at(table) && !map.contains_key("created_at") {
        map.insert(
            "created_at".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
    }
    Ok(Value::Object(map))
}

#[async_trait]
impl Gateway for InMemoryGateway {
    async fn select(&self, table: Table, query: &SelectQuery) -> Result<Vec<Row>> {
        self.begin(table, GatewayOp::Select).await?;

        let tables = self.tables.read().await;
        let mut rows: Vec<Row> = tables
            .get(&table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| query.filter.matches(row))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        query.sort_rows(&mut rows);
        Ok(rows.iter().map(|row| query.project(row)).collect())
    }

    async fn insert(&self, table: Table, rows: &[Row]) -> Result<Vec<Row>> {
        self.begin(table, GatewayOp::Insert).await?;

        let prepared = rows
            .iter()
            .map(|row| prepare_row(table, row))
            .collect::<Result<Vec<_>>>()?;

        {
            let mut tables = self.tables.write().await;
            let stored = tables.entry(table).or_default();
            for row in &prepared {
                let id = table.row_id(row);
                if stored.iter().any(|existing| table.row_id(existing) == id) {
                    return Err(GatewayError::Rejected {
                        reason: RejectionReason::Conflict,
                        message: format!(
                            "duplicate key {} = {}",
                            table.primary_key(),
                            id.unwrap_or_default()
                        ),
                    });
                }
            }
            stored.extend(prepared.iter().cloned());
        }

        for row in &prepared {
            self.publish(ChangeEvent::inserted(table, row.clone())).await;
        }
        Ok(prepared)
    }

    async fn update(&self, table: Table, patch: &Row, filter: &Filter) -> Result<Vec<Row>> {
        self.begin(table, GatewayOp::Update).await?;
        if !patch.is_object() {
            return Err(GatewayError::validation("patch must be a JSON object"));
        }

        let changes: Vec<(Row, Row)> = {
            let mut tables = self.tables.write().await;
            let stored = tables.entry(table).or_default();
            stored
                .iter_mut()
                .filter(|row| filter.matches(row))
                .map(|row| {
                    let old = row.clone();
                    *row = merge_patch(row, patch);
                    (old, row.clone())
                })
                .collect()
        };

        let mut updated = Vec::with_capacity(changes.len());
        for (old, new) in changes {
            updated.push(new.clone());
            self.publish(ChangeEvent::updated(table, old, new)).await;
        }
        Ok(updated)
    }

    async fn delete(&self, table: Table, filter: &Filter) -> Result<()> {
        self.begin(table, GatewayOp::Delete).await?;

        let removed: Vec<Row> = {
            let mut tables = self.tables.write().await;
            let stored = tables.entry(table).or_default();
            let (removed, kept): (Vec<Row>, Vec<Row>) =
                stored.drain(..).partition(|row| filter.matches(row));
            *stored = kept;
            removed
        };

        for row in removed {
            self.publish(ChangeEvent::deleted(table, row)).await;
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for InMemoryGateway {
    async fn subscribe(&self, table: Table) -> Result<broadcast::Receiver<ChangeEvent>> {
        let sender = self.get_or_create_channel(table).await;
        Ok(sender.subscribe())
    }
}
