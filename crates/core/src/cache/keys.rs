use std::hash::{Hash, Hasher};

use crate::gateway::{SelectQuery, Table};

use super::KeyPattern;

/// Namespace for dashboard summary keys, which aggregate several tables.
pub const DASHBOARD_NAMESPACE: &str = "dashboard";

const SEPARATOR: char = ':';

/// Identifier of a cached result set: `(namespace, ...qualifiers)`.
///
/// Two keys are equal iff their serialized forms are equal.
#[derive(Debug, Clone)]
pub struct QueryKey {
    segments: Vec<String>,
    serialized: String,
}

impl QueryKey {
    /// Creates a key with only a namespace.
    pub fn new(namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            serialized: namespace.clone(),
            segments: vec![namespace],
        }
    }

    /// Appends a qualifier.
    pub fn with(mut self, qualifier: impl Into<String>) -> Self {
        let qualifier = qualifier.into();
        self.serialized.push(SEPARATOR);
        self.serialized.push_str(&qualifier);
        self.segments.push(qualifier);
        self
    }

    /// The first segment of the key.
    pub fn namespace(&self) -> &str {
        &self.segments[0]
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn as_str(&self) -> &str {
        &self.serialized
    }
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.serialized == other.serialized
    }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.serialized.hash(state);
    }
}

impl std::fmt::Display for QueryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.serialized)
    }
}

/// Returns the cache key for a filtered list of a table.
pub fn list_key(table: Table, query: &SelectQuery) -> QueryKey {
    QueryKey::new(table.as_str())
        .with("list")
        .with(query.canonical())
}

/// Returns the cache key for a single record.
pub fn detail_key(table: Table, id: &str) -> QueryKey {
    QueryKey::new(table.as_str()).with("detail").with(id)
}

/// Returns the cache key for a named dashboard summary.
pub fn dashboard_key(name: &str) -> QueryKey {
    QueryKey::new(DASHBOARD_NAMESPACE).with(name)
}

/// Returns the pattern matching every list of a table.
pub fn list_pattern(table: Table) -> KeyPattern {
    KeyPattern::glob(format!("{}:list:*", table))
}

/// Returns the pattern matching one record's detail key.
pub fn detail_pattern(table: Table, id: &str) -> KeyPattern {
    KeyPattern::exact(detail_key(table, id))
}

/// Returns the pattern matching every detail key of a table.
pub fn all_details_pattern(table: Table) -> KeyPattern {
    KeyPattern::glob(format!("{}:detail:*", table))
}

/// Returns the pattern matching every key of a table's namespace.
pub fn namespace_pattern(table: Table) -> KeyPattern {
    KeyPattern::glob(format!("{}:*", table))
}

/// Returns the pattern matching every dashboard summary key.
pub fn dashboard_pattern() -> KeyPattern {
    KeyPattern::glob(format!("{}:*", DASHBOARD_NAMESPACE))
}

/// Checks if a key addresses a list (`{table}:list:...`).
pub fn is_list_key(key: &QueryKey) -> bool {
    key.segments().get(1).is_some_and(|s| s == "list")
}

/// Checks if a key addresses a single record (`{table}:detail:{id}`).
pub fn is_detail_key(key: &QueryKey) -> bool {
    key.segments().len() == 3 && key.segments()[1] == "detail"
}
