//! Optimistic projections over cached list and detail payloads.
//!
//! A projection never edits a payload in place: it returns a new snapshot,
//! or `None` when the payload is unaffected.

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::cache::{is_detail_key, is_list_key, QueryKey};
use crate::gateway::{Row, SelectQuery, Table};

/// Column set on provisional records.
pub const OPTIMISTIC_MARKER: &str = "_optimistic";

/// A fresh temporary identifier for a provisional record.
pub fn temp_id() -> String {
    Uuid::new_v4().to_string()
}

/// Builds a provisional record: the input with a temporary primary key and
/// the optimistic marker.
pub fn provisional_record(table: Table, input: &Row, temp_id: &str) -> Row {
    let mut map = match input {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    map.insert(
        table.primary_key().to_string(),
        Value::String(temp_id.to_string()),
    );
    map.insert(OPTIMISTIC_MARKER.to_string(), Value::Bool(true));
    Value::Object(map)
}

/// Returns true if the row was created by an optimistic insert.
pub fn is_provisional(row: &Row) -> bool {
    row.get(OPTIMISTIC_MARKER)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Shallow merge: every top-level field of `patch` overwrites the row's.
pub fn merge_patch(row: &Row, patch: &Row) -> Row {
    match (row, patch) {
        (Value::Object(base), Value::Object(changes)) => {
            let mut merged = base.clone();
            for (k, v) in changes {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        _ => row.clone(),
    }
}

/// An optimistic change to one table's cached payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// Add a provisional record to lists it belongs to.
    Insert(Row),
    /// Merge a patch into the record with this id.
    Patch { id: String, patch: Row },
    /// Drop the record with this id.
    Remove { id: String },
    /// Swap the record with id `id` for a confirmed row.
    Replace { id: String, row: Row },
}

impl Projection {
    /// Applies the projection to the payload cached under `key`.
    ///
    /// `query` is the list's select, when known; rows that stop matching its
    /// filter are dropped and the list is re-sorted.
    pub fn apply(
        &self,
        table: Table,
        key: &QueryKey,
        payload: &Value,
        query: Option<&SelectQuery>,
    ) -> Option<Value> {
        if key.namespace() != table.as_str() {
            return None;
        }
        if is_list_key(key) {
            self.apply_list(table, payload, query)
        } else if is_detail_key(key) {
            self.apply_detail(table, payload)
        } else {
            None
        }
    }

    /// Applies the projection to a list payload.
    pub fn apply_list(
        &self,
        table: Table,
        payload: &Value,
        query: Option<&SelectQuery>,
    ) -> Option<Value> {
        let rows = match payload {
            Value::Array(rows) => rows,
            _ => return None,
        };
        let belongs = |row: &Row| query.is_none_or(|q| q.filter.matches(row));
        let position = |id: &str| {
            rows.iter()
                .position(|row| table.row_id(row).as_deref() == Some(id))
        };

        let mut next = rows.clone();
        match self {
            Projection::Insert(row) => {
                if !belongs(row) {
                    return None;
                }
                next.push(row.clone());
            }
            Projection::Patch { id, patch } => {
                let index = position(id.as_str())?;
                let patched = merge_patch(&next[index], patch);
                if belongs(&patched) {
                    next[index] = patched;
                } else {
                    next.remove(index);
                }
            }
            Projection::Remove { id } => {
                next.remove(position(id.as_str())?);
            }
            Projection::Replace { id, row } => {
                let confirmed = table.row_id(row);
                let already_listed = confirmed
                    .as_deref()
                    .filter(|c| *c != id.as_str())
                    .and_then(position);
                match (position(id.as_str()), already_listed) {
                    // The confirmed row arrived first: drop the provisional one
                    (Some(index), Some(_)) => {
                        next.remove(index);
                    }
                    (Some(index), None) if belongs(row) => next[index] = row.clone(),
                    (Some(index), None) => {
                        next.remove(index);
                    }
                    (None, _) => return None,
                }
            }
        }

        if let Some(query) = query {
            query.sort_rows(&mut next);
        }
        Some(Value::Array(next))
    }

    /// Applies the projection to a detail payload (`null` when absent).
    pub fn apply_detail(&self, table: Table, payload: &Value) -> Option<Value> {
        let current = table.row_id(payload)?;
        match self {
            Projection::Insert(_) => None,
            Projection::Patch { id, patch } if *id == current => Some(merge_patch(payload, patch)),
            Projection::Remove { id } if *id == current => Some(Value::Null),
            Projection::Replace { id, row } if *id == current => Some(row.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{detail_key, list_key};
    use crate::gateway::{Filter, OrderBy};
    use serde_json::json;

    fn tasks() -> Value {
        json!([
            {"task_id": "t1", "title": "Clean pool", "status": "pending", "due_date": "2024-01-02"},
            {"task_id": "t2", "title": "Fix door", "status": "pending", "due_date": "2024-01-05"}
        ])
    }

    #[test]
    fn test_provisional_record_has_temp_id_and_marker() {
        let input = json!({"title": "Check in guest"});
        let row = provisional_record(Table::Tasks, &input, "tmp-1");
        assert_eq!(row["task_id"], "tmp-1");
        assert!(is_provisional(&row));
        assert!(!is_provisional(&input));
    }

    #[test]
    fn test_temp_ids_are_unique() {
        assert_ne!(temp_id(), temp_id());
    }

    #[test]
    fn test_merge_patch_is_shallow_and_pure() {
        let row = json!({"task_id": "t1", "status": "pending", "meta": {"a": 1}});
        let merged = merge_patch(&row, &json!({"status": "completed", "meta": {"b": 2}}));
        assert_eq!(merged["status"], "completed");
        assert_eq!(merged["meta"], json!({"b": 2}));
        assert_eq!(row["status"], "pending");
    }

    #[test]
    fn test_insert_respects_filter_and_order() {
        let query = SelectQuery::new(Filter::new().eq("status", "pending"))
            .order_by(OrderBy::asc("due_date"));
        let row = json!({"task_id": "tmp", "status": "pending", "due_date": "2024-01-03", "_optimistic": true});

        let next = Projection::Insert(row)
            .apply_list(Table::Tasks, &tasks(), Some(&query))
            .unwrap();
        let ids: Vec<&str> = next
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["task_id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["t1", "tmp", "t2"]);

        let completed = json!({"task_id": "tmp", "status": "completed"});
        assert!(Projection::Insert(completed)
            .apply_list(Table::Tasks, &tasks(), Some(&query))
            .is_none());
    }

    #[test]
    fn test_patch_drops_rows_leaving_the_filter() {
        let query = SelectQuery::new(Filter::new().eq("status", "pending"));
        let projection = Projection::Patch {
            id: "t1".to_string(),
            patch: json!({"status": "completed"}),
        };

        let filtered = projection
            .apply_list(Table::Tasks, &tasks(), Some(&query))
            .unwrap();
        assert_eq!(filtered.as_array().unwrap().len(), 1);

        let unfiltered = projection.apply_list(Table::Tasks, &tasks(), None).unwrap();
        assert_eq!(unfiltered[0]["status"], "completed");
    }

    #[test]
    fn test_remove_and_missing_ids() {
        let removed = Projection::Remove { id: "t2".to_string() }
            .apply_list(Table::Tasks, &tasks(), None)
            .unwrap();
        assert_eq!(removed.as_array().unwrap().len(), 1);

        assert!(Projection::Remove { id: "nope".to_string() }
            .apply_list(Table::Tasks, &tasks(), None)
            .is_none());
    }

    #[test]
    fn test_replace_swaps_provisional_in_place() {
        let list = json!([{"task_id": "tmp", "_optimistic": true}, {"task_id": "t1"}]);
        let projection = Projection::Replace {
            id: "tmp".to_string(),
            row: json!({"task_id": "t9"}),
        };
        let next = projection.apply_list(Table::Tasks, &list, None).unwrap();
        assert_eq!(next, json!([{"task_id": "t9"}, {"task_id": "t1"}]));
    }

    #[test]
    fn test_replace_never_duplicates_confirmed_row() {
        let list = json!([{"task_id": "tmp", "_optimistic": true}, {"task_id": "t9"}]);
        let projection = Projection::Replace {
            id: "tmp".to_string(),
            row: json!({"task_id": "t9"}),
        };
        let next = projection.apply_list(Table::Tasks, &list, None).unwrap();
        assert_eq!(next, json!([{"task_id": "t9"}]));
    }

    #[test]
    fn test_detail_projections() {
        let detail = json!({"task_id": "t1", "status": "pending"});

        let patched = Projection::Patch {
            id: "t1".to_string(),
            patch: json!({"status": "completed"}),
        }
        .apply_detail(Table::Tasks, &detail)
        .unwrap();
        assert_eq!(patched["status"], "completed");

        let removed = Projection::Remove { id: "t1".to_string() }
            .apply_detail(Table::Tasks, &detail)
            .unwrap();
        assert_eq!(removed, Value::Null);

        assert!(Projection::Remove { id: "t2".to_string() }
            .apply_detail(Table::Tasks, &detail)
            .is_none());
        assert!(Projection::Patch {
            id: "t1".to_string(),
            patch: json!({})
        }
        .apply_detail(Table::Tasks, &Value::Null)
        .is_none());
    }

    #[test]
    fn test_apply_dispatches_on_key_shape_and_namespace() {
        let projection = Projection::Remove { id: "t1".to_string() };
        let list = list_key(Table::Tasks, &SelectQuery::default());
        let detail = detail_key(Table::Tasks, "t1");
        let other = list_key(Table::Jobs, &SelectQuery::default());

        assert!(projection.apply(Table::Tasks, &list, &tasks(), None).is_some());
        assert!(projection
            .apply(Table::Tasks, &detail, &json!({"task_id": "t1"}), None)
            .is_some());
        assert!(projection.apply(Table::Tasks, &other, &tasks(), None).is_none());
    }
}
