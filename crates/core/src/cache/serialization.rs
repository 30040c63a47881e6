//! Pure functions for converting typed records to and from cached payloads.
//!
//! Payloads are JSON values: the cache treats them as opaque snapshots, while
//! typed resources decode them into domain records on the way out.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Errors that can occur during payload conversion.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SerializationError {
    /// Failed to serialize a value to a payload.
    #[error("Failed to serialize: {0}")]
    SerializeFailed(String),
    /// Failed to deserialize a payload to a value.
    #[error("Failed to deserialize: {0}")]
    DeserializeFailed(String),
}

/// Result type for serialization operations.
pub type Result<T> = std::result::Result<T, SerializationError>;

/// Serializes a record (or anything serializable) to a JSON payload.
pub fn to_payload<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| SerializationError::SerializeFailed(e.to_string()))
}

/// Deserializes a JSON payload to a record.
pub fn from_payload<T: DeserializeOwned>(payload: &Value) -> Result<T> {
    T::deserialize(payload).map_err(|e| SerializationError::DeserializeFailed(e.to_string()))
}

/// Deserializes a list payload. `null` reads as an empty list.
pub fn list_from_payload<T: DeserializeOwned>(payload: &Value) -> Result<Vec<T>> {
    match payload {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items.iter().map(from_payload).collect(),
        other => Err(SerializationError::DeserializeFailed(format!(
            "expected array, got {}",
            type_name(other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Row {
        id: u32,
        name: String,
    }

    #[test]
    fn test_to_payload() {
        let payload = to_payload(&Row {
            id: 1,
            name: "Villa".to_string(),
        })
        .unwrap();
        assert_eq!(payload, json!({"id": 1, "name": "Villa"}));
    }

    #[test]
    fn test_from_payload_ignores_unknown_fields() {
        let row: Row = from_payload(&json!({"id": 2, "name": "Loft", "_optimistic": true})).unwrap();
        assert_eq!(row.id, 2);
    }

    #[test]
    fn test_from_payload_missing_field_fails() {
        let result: Result<Row> = from_payload(&json!({"id": 2}));
        assert!(matches!(result, Err(SerializationError::DeserializeFailed(_))));
    }

    #[test]
    fn test_list_from_payload() {
        let rows: Vec<Row> =
            list_from_payload(&json!([{"id": 1, "name": "a"}, {"id": 2, "name": "b"}])).unwrap();
        assert_eq!(rows.len(), 2);

        let rows: Vec<Row> = list_from_payload(&Value::Null).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_list_from_payload_rejects_objects() {
        let result: Result<Vec<Row>> = list_from_payload(&json!({"id": 1}));
        assert_eq!(
            result,
            Err(SerializationError::DeserializeFailed(
                "expected array, got object".to_string()
            ))
        );
    }
}
