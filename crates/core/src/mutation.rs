//! Write requests, outcomes and errors.

use serde_json::Value;
use thiserror::Error;

use crate::gateway::{GatewayError, Row, Table};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            MutationKind::Create => "create",
            MutationKind::Update => "update",
            MutationKind::Delete => "delete",
        };
        f.write_str(label)
    }
}

/// Rows written to a related table once the primary record exists.
///
/// `foreign_key` is set to the confirmed primary id on every row.
#[derive(Debug, Clone, PartialEq)]
pub struct SecondaryWrite {
    pub table: Table,
    pub foreign_key: String,
    pub rows: Vec<Row>,
}

impl SecondaryWrite {
    pub fn new(table: Table, foreign_key: impl Into<String>, rows: Vec<Row>) -> Self {
        Self {
            table,
            foreign_key: foreign_key.into(),
            rows,
        }
    }

    /// The rows with the foreign key column filled in.
    pub fn rows_for(&self, parent_id: &str) -> Vec<Row> {
        self.rows
            .iter()
            .map(|row| {
                let mut row = match row {
                    Value::Object(map) => map.clone(),
                    _ => serde_json::Map::new(),
                };
                row.insert(
                    self.foreign_key.clone(),
                    Value::String(parent_id.to_string()),
                );
                Value::Object(row)
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MutationOp {
    /// Insert a record; the server assigns its primary key.
    Create {
        record: Row,
        secondary: Vec<SecondaryWrite>,
    },
    Update { id: String, patch: Row },
    Delete { id: String },
}

/// A write against one table.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationRequest {
    pub table: Table,
    pub op: MutationOp,
}

impl MutationRequest {
    pub fn create(table: Table, record: Row) -> Self {
        Self {
            table,
            op: MutationOp::Create {
                record,
                secondary: Vec::new(),
            },
        }
    }

    pub fn update(table: Table, id: impl Into<String>, patch: Row) -> Self {
        Self {
            table,
            op: MutationOp::Update {
                id: id.into(),
                patch,
            },
        }
    }

    pub fn delete(table: Table, id: impl Into<String>) -> Self {
        Self {
            table,
            op: MutationOp::Delete { id: id.into() },
        }
    }

    /// Adds a secondary write. No effect on updates and deletes.
    pub fn with_secondary(mut self, write: SecondaryWrite) -> Self {
        if let MutationOp::Create { secondary, .. } = &mut self.op {
            secondary.push(write);
        }
        self
    }

    pub fn kind(&self) -> MutationKind {
        match self.op {
            MutationOp::Create { .. } => MutationKind::Create,
            MutationOp::Update { .. } => MutationKind::Update,
            MutationOp::Delete { .. } => MutationKind::Delete,
        }
    }

    /// Id of the targeted record. Creates have none until confirmed.
    pub fn target_id(&self) -> Option<&str> {
        match &self.op {
            MutationOp::Create { .. } => None,
            MutationOp::Update { id, .. } | MutationOp::Delete { id } => Some(id),
        }
    }
}

/// Entity key used to track concurrent writes: `table:id`.
pub fn entity_key(table: Table, id: &str) -> String {
    format!("{}:{}", table, id)
}

/// A secondary write that failed after the primary write succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryWriteFailure {
    pub table: Table,
    pub error: GatewayError,
}

impl std::fmt::Display for SecondaryWriteFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} write failed: {}", self.table, self.error)
    }
}

/// Result of a write that reached the server.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome<T> {
    Completed(T),
    /// The primary record was written but some secondary writes failed.
    /// Nothing is rolled back.
    CompletedWithWarnings {
        record: T,
        warnings: Vec<SecondaryWriteFailure>,
    },
}

impl<T> MutationOutcome<T> {
    pub fn record(&self) -> &T {
        match self {
            MutationOutcome::Completed(record)
            | MutationOutcome::CompletedWithWarnings { record, .. } => record,
        }
    }

    pub fn into_record(self) -> T {
        match self {
            MutationOutcome::Completed(record)
            | MutationOutcome::CompletedWithWarnings { record, .. } => record,
        }
    }

    pub fn warnings(&self) -> &[SecondaryWriteFailure] {
        match self {
            MutationOutcome::Completed(_) => &[],
            MutationOutcome::CompletedWithWarnings { warnings, .. } => warnings,
        }
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings().is_empty()
    }

    /// Converts the record, keeping the warnings.
    pub fn try_map<U, E>(
        self,
        f: impl FnOnce(T) -> std::result::Result<U, E>,
    ) -> std::result::Result<MutationOutcome<U>, E> {
        Ok(match self {
            MutationOutcome::Completed(record) => MutationOutcome::Completed(f(record)?),
            MutationOutcome::CompletedWithWarnings { record, warnings } => {
                MutationOutcome::CompletedWithWarnings {
                    record: f(record)?,
                    warnings,
                }
            }
        })
    }
}

/// Errors returned by a failed write. The optimistic projection has been
/// rolled back by the time the caller sees one.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MutationError {
    /// The gateway refused the write; it was not retried.
    #[error("Write rejected: {source}")]
    Rejected { source: GatewayError },
    /// A transient failure persisted through every retry.
    #[error("Write failed after {attempts} attempts: {source}")]
    Exhausted { attempts: u32, source: GatewayError },
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl MutationError {
    pub fn gateway_error(&self) -> Option<&GatewayError> {
        match self {
            MutationError::Rejected { source } | MutationError::Exhausted { source, .. } => {
                Some(source)
            }
            MutationError::Serialization(_) => None,
        }
    }
}

impl From<crate::cache::SerializationError> for MutationError {
    fn from(err: crate::cache::SerializationError) -> Self {
        MutationError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MutationError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_secondary_rows_get_parent_id() {
        let write = SecondaryWrite::new(
            Table::PropertyAmenities,
            "property_id",
            vec![json!({"amenity": "pool"}), json!({"amenity": "wifi"})],
        );
        let rows = write.rows_for("p1");
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r["property_id"] == "p1"));
        assert_eq!(rows[1]["amenity"], "wifi");
    }

    #[test]
    fn test_request_builders() {
        let create = MutationRequest::create(Table::Properties, json!({"name": "Villa"}))
            .with_secondary(SecondaryWrite::new(Table::PropertyLocations, "property_id", vec![json!({})]));
        assert_eq!(create.kind(), MutationKind::Create);
        assert_eq!(create.target_id(), None);
        match &create.op {
            MutationOp::Create { secondary, .. } => assert_eq!(secondary.len(), 1),
            other => panic!("unexpected op {:?}", other),
        }

        let update = MutationRequest::update(Table::Tasks, "t1", json!({"status": "completed"}));
        assert_eq!(update.kind(), MutationKind::Update);
        assert_eq!(update.target_id(), Some("t1"));

        let delete = MutationRequest::delete(Table::Tasks, "t1")
            .with_secondary(SecondaryWrite::new(Table::Jobs, "task_id", vec![]));
        assert_eq!(delete.kind(), MutationKind::Delete);
        assert_eq!(delete.op, MutationOp::Delete { id: "t1".to_string() });
    }

    #[test]
    fn test_entity_key() {
        assert_eq!(entity_key(Table::Tasks, "t1"), "tasks:t1");
    }

    #[test]
    fn test_outcome_accessors() {
        let done: MutationOutcome<u32> = MutationOutcome::Completed(1);
        assert_eq!(*done.record(), 1);
        assert!(!done.has_warnings());

        let partial = MutationOutcome::CompletedWithWarnings {
            record: 2,
            warnings: vec![SecondaryWriteFailure {
                table: Table::PropertyAmenities,
                error: GatewayError::Timeout("30s".to_string()),
            }],
        };
        assert!(partial.has_warnings());
        assert_eq!(
            partial.warnings()[0].to_string(),
            "property_amenities write failed: Request timed out: 30s"
        );

        let mapped: std::result::Result<_, ()> = partial.try_map(|n| Ok(n * 10));
        let mapped = mapped.unwrap();
        assert_eq!(*mapped.record(), 20);
        assert_eq!(mapped.warnings().len(), 1);
    }

    #[test]
    fn test_error_display() {
        let err = MutationError::Exhausted {
            attempts: 3,
            source: GatewayError::Connection("reset".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "Write failed after 3 attempts: Connection failed: reset"
        );
        assert!(err.gateway_error().is_some());

        let rejected = MutationError::Rejected {
            source: GatewayError::validation("name is required"),
        };
        assert_eq!(
            rejected.to_string(),
            "Write rejected: Rejected (validation): name is required"
        );
    }
}
