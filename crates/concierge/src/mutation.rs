//! Optimistic writes.
//!
//! A write is projected into every cached payload it affects before the
//! gateway is called. On failure the projection is rolled back exactly; on
//! success the provisional state is replaced by the confirmed row. Either
//! way the write settles by invalidating what the routing rules name.
//!
//! Writes to the same record may overlap, and the last confirmation to
//! arrive wins in the cache for a while. Only the last write to settle
//! refetches; earlier ones just mark their keys stale, so the final state
//! is always what the server holds.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::join_all;
use serde_json::json;

use concierge_core::cache::{detail_key, detail_pattern, list_pattern, KeyPattern, QueryKey};
use concierge_core::gateway::{ChangeKind, Filter, Gateway, GatewayError, Row, SelectQuery, Table};
use concierge_core::invalidation::{EntityEvent, InvalidationRouter};
use concierge_core::mutation::{
    entity_key, MutationError, MutationOp, MutationOutcome, MutationRequest, Result,
    SecondaryWrite, SecondaryWriteFailure,
};
use concierge_core::optimistic::{provisional_record, temp_id, Projection};
use concierge_core::policy::{InvalidationStrategy, MutationPolicies};

use crate::cache::{CacheStore, RollbackToken};
use crate::query::QueryCoordinator;
use crate::retry::{retry, RetryFailure};

/// Overlapping writes to one record.
#[derive(Debug, Default)]
struct Settle {
    count: usize,
    deferred: Vec<KeyPattern>,
    contended: bool,
}

/// Decrements a table's pending-write count when dropped.
struct PendingGuard {
    pending: Arc<Mutex<HashMap<Table, usize>>>,
    table: Table,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = pending.get_mut(&self.table) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                pending.remove(&self.table);
            }
        }
    }
}

fn mutation_error(failure: RetryFailure) -> MutationError {
    if failure.error.is_transient() {
        MutationError::Exhausted {
            attempts: failure.attempts,
            source: failure.error,
        }
    } else {
        MutationError::Rejected {
            source: failure.error,
        }
    }
}

fn push_unique(patterns: &mut Vec<KeyPattern>, more: impl IntoIterator<Item = KeyPattern>) {
    for pattern in more {
        if !patterns.contains(&pattern) {
            patterns.push(pattern);
        }
    }
}

/// Applies writes optimistically and settles the cache afterwards.
#[derive(Clone)]
pub struct MutationCoordinator {
    queries: QueryCoordinator,
    router: InvalidationRouter,
    policies: MutationPolicies,
    settles: Arc<Mutex<HashMap<String, Settle>>>,
    pending: Arc<Mutex<HashMap<Table, usize>>>,
}

impl std::fmt::Debug for MutationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationCoordinator")
            .field("policies", &self.policies)
            .finish_non_exhaustive()
    }
}

impl MutationCoordinator {
    pub fn new(
        queries: QueryCoordinator,
        router: InvalidationRouter,
        policies: MutationPolicies,
    ) -> Self {
        Self {
            queries,
            router,
            policies,
            settles: Arc::new(Mutex::new(HashMap::new())),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn store(&self) -> &CacheStore {
        self.queries.store()
    }

    fn gateway(&self) -> &dyn Gateway {
        self.queries.gateway().as_ref()
    }

    fn settles(&self) -> MutexGuard<'_, HashMap<String, Settle>> {
        self.settles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<Table, usize>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True while any write to the table is in flight.
    pub fn is_pending(&self, table: Table) -> bool {
        self.pending_count(table) > 0
    }

    pub fn pending_count(&self, table: Table) -> usize {
        self.pending().get(&table).copied().unwrap_or(0)
    }

    fn track(&self, table: Table) -> PendingGuard {
        *self.pending().entry(table).or_insert(0) += 1;
        PendingGuard {
            pending: self.pending.clone(),
            table,
        }
    }

    /// Runs a write.
    ///
    /// The optimistic projection is visible to readers as soon as this
    /// future is first polled. When it returns an error the projection has
    /// already been rolled back.
    pub async fn mutate(&self, request: MutationRequest) -> Result<MutationOutcome<Row>> {
        let table = request.table;
        let _pending = self.track(table);
        match request.op {
            MutationOp::Create { record, secondary } => self.create(table, record, secondary).await,
            MutationOp::Update { id, patch } => self
                .update(table, &id, patch)
                .await
                .map(MutationOutcome::Completed),
            MutationOp::Delete { id } => self
                .delete(table, &id)
                .await
                .map(MutationOutcome::Completed),
        }
    }

    fn project(&self, table: Table, projection: &Projection, patterns: &[KeyPattern]) -> RollbackToken {
        let queries: HashMap<QueryKey, SelectQuery> =
            self.queries.list_queries(table).into_iter().collect();
        self.store().apply_projection(patterns, |key, payload| {
            projection.apply(table, key, payload, queries.get(key))
        })
    }

    /// The cached row with this id, from its detail entry or any list.
    fn cached_row(&self, table: Table, id: &str) -> Option<Row> {
        let from_detail = self
            .store()
            .peek(&detail_key(table, id))
            .and_then(|entry| entry.payload)
            .filter(|payload| table.row_id(payload).as_deref() == Some(id));
        if let Some(payload) = from_detail {
            return Some((*payload).clone());
        }

        self.store()
            .keys_matching(&list_pattern(table))
            .into_iter()
            .filter_map(|key| self.store().peek(&key)?.payload)
            .find_map(|payload| {
                payload
                    .as_array()?
                    .iter()
                    .find(|row| table.row_id(row).as_deref() == Some(id))
                    .cloned()
            })
    }

    fn enter(&self, entity: &str) {
        let mut settles = self.settles();
        let settle = settles.entry(entity.to_string()).or_default();
        settle.count += 1;
        if settle.count > 1 {
            settle.contended = true;
        }
    }

    /// Finishes one write to `entity`.
    ///
    /// Earlier writes of an overlapping group only mark their patterns
    /// stale. The last one invalidates everything the group touched and
    /// waits for observed keys to be refetched.
    async fn settle(&self, entity: &str, table: Table, id: &str, patterns: Vec<KeyPattern>) {
        let last = {
            let mut settles = self.settles();
            let Some(settle) = settles.get_mut(entity) else {
                return;
            };
            settle.count = settle.count.saturating_sub(1);
            push_unique(&mut settle.deferred, patterns.iter().cloned());
            if settle.count == 0 {
                settles.remove(entity)
            } else {
                None
            }
        };

        match last {
            Some(settle) => {
                let mut patterns = settle.deferred;
                if settle.contended {
                    push_unique(&mut patterns, [list_pattern(table), detail_pattern(table, id)]);
                }
                let keys = self.queries.invalidate_and_refetch(&patterns).await;
                tracing::debug!(%entity, invalidated = keys.len(), "Write settled");
            }
            None => {
                self.queries.invalidate(&patterns, InvalidationStrategy::Mark);
                tracing::debug!(%entity, "Write settled, refetch deferred to the last overlapping write");
            }
        }
    }

    async fn create(
        &self,
        table: Table,
        record: Row,
        secondary: Vec<SecondaryWrite>,
    ) -> Result<MutationOutcome<Row>> {
        let temp = temp_id();
        let entity = entity_key(table, &temp);
        self.enter(&entity);

        let provisional = provisional_record(table, &record, &temp);
        let touched = vec![list_pattern(table)];
        let token = self.project(table, &Projection::Insert(provisional), &touched);
        tracing::debug!(%table, temp_id = %temp, "Applied optimistic insert");

        let label = format!("insert {}", table);
        let inserted = retry(&self.policies.create, &label, || {
            self.gateway().insert(table, std::slice::from_ref(&record))
        })
        .await
        .map_err(mutation_error)
        .and_then(|rows| {
            let row = rows.into_iter().next().ok_or_else(|| MutationError::Rejected {
                source: GatewayError::Serialization(format!("insert into {} returned no rows", table)),
            })?;
            let id = table.row_id(&row).ok_or_else(|| MutationError::Rejected {
                source: GatewayError::Serialization(format!(
                    "insert into {} returned a row without {}",
                    table,
                    table.primary_key()
                )),
            })?;
            Ok((id, row))
        });

        let (id, row) = match inserted {
            Ok(inserted) => inserted,
            Err(err) => {
                let restored = self.store().rollback(token);
                tracing::warn!(%table, error = %err, restored, "Insert failed, rolled back");
                self.settle(&entity, table, &temp, touched).await;
                return Err(err);
            }
        };
        drop(token);

        let (secondary_rows, warnings) = self.write_secondary(&id, &secondary).await;

        drop(self.project(
            table,
            &Projection::Replace {
                id: temp.clone(),
                row: row.clone(),
            },
            &touched,
        ));
        self.store().set(&detail_key(table, &id), row.clone());
        tracing::info!(%table, %id, "Insert confirmed");

        let mut patterns = self.router.route(&EntityEvent::from_change(
            table,
            ChangeKind::Insert,
            None,
            Some(&row),
        ));
        for (secondary_table, row) in &secondary_rows {
            push_unique(
                &mut patterns,
                self.router.route(&EntityEvent::from_change(
                    *secondary_table,
                    ChangeKind::Insert,
                    None,
                    Some(row),
                )),
            );
        }
        self.settle(&entity, table, &temp, patterns).await;

        if warnings.is_empty() {
            Ok(MutationOutcome::Completed(row))
        } else {
            Ok(MutationOutcome::CompletedWithWarnings {
                record: row,
                warnings,
            })
        }
    }

    /// Writes the related rows of a confirmed record concurrently.
    async fn write_secondary(
        &self,
        parent_id: &str,
        writes: &[SecondaryWrite],
    ) -> (Vec<(Table, Row)>, Vec<SecondaryWriteFailure>) {
        let gateway = self.gateway();
        let policy = &self.policies.create;

        let results = join_all(writes.iter().map(|write| {
            let rows = write.rows_for(parent_id);
            async move {
                let label = format!("insert {}", write.table);
                retry(policy, &label, || gateway.insert(write.table, &rows))
                    .await
                    .map(|inserted| (write.table, inserted))
                    .map_err(|failure| SecondaryWriteFailure {
                        table: write.table,
                        error: failure.error,
                    })
            }
        }))
        .await;

        let mut inserted = Vec::new();
        let mut warnings = Vec::new();
        for result in results {
            match result {
                Ok((table, rows)) => inserted.extend(rows.into_iter().map(|row| (table, row))),
                Err(failure) => {
                    tracing::warn!(%failure, %parent_id, "Secondary write failed");
                    warnings.push(failure);
                }
            }
        }
        (inserted, warnings)
    }

    async fn update(&self, table: Table, id: &str, patch: Row) -> Result<Row> {
        let entity = entity_key(table, id);
        self.enter(&entity);

        let prior = self.cached_row(table, id);
        let touched = vec![list_pattern(table), detail_pattern(table, id)];
        let token = self.project(
            table,
            &Projection::Patch {
                id: id.to_string(),
                patch: patch.clone(),
            },
            &touched,
        );
        tracing::debug!(%table, %id, "Applied optimistic update");

        let filter = Filter::new().eq(table.primary_key(), id);
        let label = format!("update {}", table);
        let updated = retry(&self.policies.update, &label, || {
            self.gateway().update(table, &patch, &filter)
        })
        .await
        .map_err(mutation_error)
        .and_then(|rows| {
            rows.into_iter().next().ok_or_else(|| MutationError::Rejected {
                source: GatewayError::NotFound {
                    table: table.as_str(),
                    id: id.to_string(),
                },
            })
        });

        let row = match updated {
            Ok(row) => row,
            Err(err) => {
                let restored = self.store().rollback(token);
                tracing::warn!(%table, %id, error = %err, restored, "Update failed, rolled back");
                self.settle(&entity, table, id, touched).await;
                return Err(err);
            }
        };
        drop(token);

        drop(self.project(
            table,
            &Projection::Replace {
                id: id.to_string(),
                row: row.clone(),
            },
            &touched,
        ));
        self.store().set(&detail_key(table, id), row.clone());
        tracing::info!(%table, %id, "Update confirmed");

        let event = EntityEvent::from_change(table, ChangeKind::Update, prior.as_ref(), Some(&row));
        self.settle(&entity, table, id, self.router.route(&event)).await;
        Ok(row)
    }

    async fn delete(&self, table: Table, id: &str) -> Result<Row> {
        let entity = entity_key(table, id);
        self.enter(&entity);

        let prior = self
            .cached_row(table, id)
            .unwrap_or_else(|| json!({ table.primary_key(): id }));
        let touched = vec![list_pattern(table), detail_pattern(table, id)];
        let token = self.project(
            table,
            &Projection::Remove { id: id.to_string() },
            &touched,
        );
        tracing::debug!(%table, %id, "Applied optimistic delete");

        let filter = Filter::new().eq(table.primary_key(), id);
        let label = format!("delete {}", table);
        let deleted = retry(&self.policies.delete, &label, || {
            self.gateway().delete(table, &filter)
        })
        .await
        .map_err(mutation_error);

        if let Err(err) = deleted {
            let restored = self.store().rollback(token);
            tracing::warn!(%table, %id, error = %err, restored, "Delete failed, rolled back");
            self.settle(&entity, table, id, touched).await;
            return Err(err);
        }
        drop(token);
        tracing::info!(%table, %id, "Delete confirmed");

        let event = EntityEvent::from_change(table, ChangeKind::Delete, Some(&prior), None);
        self.settle(&entity, table, id, self.router.route(&event)).await;
        Ok(prior)
    }
}
