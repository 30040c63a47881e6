use std::cmp::Ordering;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::DateRangeError;

/// A raw row as returned by the gateway: a JSON object keyed by column name.
pub type Row = Value;

/// Tables exposed by the remote data store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Properties,
    PropertyLocations,
    PropertyAmenities,
    Tasks,
    Jobs,
    Bookings,
    Invoices,
    Expenses,
    Commissions,
    Documents,
}

impl Table {
    /// Every table, in declaration order.
    pub const ALL: [Table; 10] = [
        Table::Properties,
        Table::PropertyLocations,
        Table::PropertyAmenities,
        Table::Tasks,
        Table::Jobs,
        Table::Bookings,
        Table::Invoices,
        Table::Expenses,
        Table::Commissions,
        Table::Documents,
    ];

    /// The table name, which doubles as the cache namespace.
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Properties => "properties",
            Table::PropertyLocations => "property_locations",
            Table::PropertyAmenities => "property_amenities",
            Table::Tasks => "tasks",
            Table::Jobs => "jobs",
            Table::Bookings => "bookings",
            Table::Invoices => "invoices",
            Table::Expenses => "expenses",
            Table::Commissions => "commissions",
            Table::Documents => "documents",
        }
    }

    /// The primary key column of this table.
    pub fn primary_key(&self) -> &'static str {
        match self {
            Table::Properties => "property_id",
            Table::PropertyLocations => "location_id",
            Table::PropertyAmenities => "property_amenity_id",
            Table::Tasks => "task_id",
            Table::Jobs => "job_id",
            Table::Bookings => "booking_id",
            Table::Invoices => "invoice_id",
            Table::Expenses => "expense_id",
            Table::Commissions => "commission_id",
            Table::Documents => "document_id",
        }
    }

    /// Parses a table name.
    pub fn from_name(name: &str) -> Option<Table> {
        Table::ALL.into_iter().find(|t| t.as_str() == name)
    }

    /// Extracts this table's primary key from a row, as a string.
    pub fn row_id(&self, row: &Row) -> Option<String> {
        match row.get(self.primary_key())? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comparison operators supported by gateway filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
}

impl FilterOp {
    /// PostgREST-style operator name.
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Neq => "neq",
            FilterOp::Gt => "gt",
            FilterOp::Gte => "gte",
            FilterOp::Lt => "lt",
            FilterOp::Lte => "lte",
            FilterOp::In => "in",
        }
    }
}

/// A single `column op value` condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub column: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Condition {
    /// Renders the right-hand side as `op.value`.
    pub fn render_value(&self) -> String {
        let rendered = match &self.value {
            Value::Array(items) => {
                let inner: Vec<String> = items.iter().map(render_scalar).collect();
                format!("({})", inner.join(","))
            }
            other => render_scalar(other),
        };
        format!("{}.{}", self.op.as_str(), rendered)
    }

    /// Evaluates this condition against a row. Missing columns read as null.
    pub fn matches(&self, row: &Row) -> bool {
        let actual = row.get(&self.column).unwrap_or(&Value::Null);
        match self.op {
            FilterOp::Eq => values_equal(actual, &self.value),
            FilterOp::Neq => !values_equal(actual, &self.value),
            FilterOp::Gt => compare_values(actual, &self.value) == Some(Ordering::Greater),
            FilterOp::Gte => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOp::Lt => compare_values(actual, &self.value) == Some(Ordering::Less),
            FilterOp::Lte => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOp::In => match &self.value {
                Value::Array(items) => items.iter().any(|v| values_equal(actual, v)),
                other => values_equal(actual, other),
            },
        }
    }
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Orders two JSON scalars. Dates and timestamps compare as ISO-8601 strings.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    compare_values(a, b) == Some(Ordering::Equal) || a == b
}

/// A conjunction of conditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    /// An empty filter that matches every row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a condition.
    pub fn with(mut self, column: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition {
            column: column.into(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn eq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(column, FilterOp::Eq, value)
    }

    pub fn neq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(column, FilterOp::Neq, value)
    }

    pub fn gte(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(column, FilterOp::Gte, value)
    }

    pub fn lte(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(column, FilterOp::Lte, value)
    }

    pub fn gt(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(column, FilterOp::Gt, value)
    }

    pub fn lt(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(column, FilterOp::Lt, value)
    }

    pub fn any_of(self, column: impl Into<String>, values: Vec<Value>) -> Self {
        self.with(column, FilterOp::In, Value::Array(values))
    }

    /// Returns the conditions in insertion order.
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Returns true if every condition matches the row.
    pub fn matches(&self, row: &Row) -> bool {
        self.conditions.iter().all(|c| c.matches(row))
    }

    /// Conditions as `(column, "op.value")` pairs, sorted by column then operator.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut sorted: Vec<&Condition> = self.conditions.iter().collect();
        sorted.sort_by(|a, b| {
            a.column
                .cmp(&b.column)
                .then(a.op.cmp(&b.op))
                .then_with(|| a.render_value().cmp(&b.render_value()))
        });
        sorted
            .into_iter()
            .map(|c| (c.column.clone(), c.render_value()))
            .collect()
    }

    /// Order-independent serialized form, `"all"` when empty.
    ///
    /// # Examples
    ///
    /// ```
    /// use concierge_core::gateway::Filter;
    ///
    /// let a = Filter::new().eq("status", "paid").eq("property_id", "p1");
    /// let b = Filter::new().eq("property_id", "p1").eq("status", "paid");
    /// assert_eq!(a.canonical(), b.canonical());
    /// assert_eq!(a.canonical(), "property_id=eq.p1&status=eq.paid");
    /// assert_eq!(Filter::new().canonical(), "all");
    /// ```
    pub fn canonical(&self) -> String {
        if self.conditions.is_empty() {
            return "all".to_string();
        }
        self.query_pairs()
            .into_iter()
            .map(|(column, value)| format!("{}={}", column, value))
            .collect::<Vec<_>>()
            .join("&")
    }
}

/// Sort directive for a select.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub ascending: bool,
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: true,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: false,
        }
    }

    /// PostgREST form, e.g. `created_at.desc`.
    pub fn render(&self) -> String {
        format!(
            "{}.{}",
            self.column,
            if self.ascending { "asc" } else { "desc" }
        )
    }
}

/// Columns, filters and ordering for a select.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectQuery {
    /// `None` selects every column.
    pub columns: Option<Vec<String>>,
    pub filter: Filter,
    pub order: Vec<OrderBy>,
}

impl SelectQuery {
    pub fn new(filter: Filter) -> Self {
        Self {
            columns: None,
            filter,
            order: Vec::new(),
        }
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order.push(order);
        self
    }

    /// The `select=` parameter value.
    pub fn select_clause(&self) -> String {
        match &self.columns {
            Some(columns) if !columns.is_empty() => columns.join(","),
            _ => "*".to_string(),
        }
    }

    /// Serialized form used inside query keys.
    pub fn canonical(&self) -> String {
        let mut out = self.filter.canonical();
        if let Some(columns) = &self.columns {
            out.push_str(&format!("&select={}", columns.join(",")));
        }
        if !self.order.is_empty() {
            let order: Vec<String> = self.order.iter().map(OrderBy::render).collect();
            out.push_str(&format!("&order={}", order.join(",")));
        }
        out
    }

    /// Sorts rows in place according to the order directives.
    pub fn sort_rows(&self, rows: &mut [Row]) {
        if self.order.is_empty() {
            return;
        }
        rows.sort_by(|a, b| {
            for order in &self.order {
                let left = a.get(&order.column).unwrap_or(&Value::Null);
                let right = b.get(&order.column).unwrap_or(&Value::Null);
                let ordering = compare_values(left, right).unwrap_or(Ordering::Equal);
                let ordering = if order.ascending {
                    ordering
                } else {
                    ordering.reverse()
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
    }

    /// Keeps only the selected columns of a row.
    pub fn project(&self, row: &Row) -> Row {
        match (&self.columns, row) {
            (Some(columns), Value::Object(map)) if !columns.is_empty() => Value::Object(
                map.iter()
                    .filter(|(k, _)| columns.iter().any(|c| c == *k))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            _ => row.clone(),
        }
    }
}

impl From<Filter> for SelectQuery {
    fn from(filter: Filter) -> Self {
        SelectQuery::new(filter)
    }
}

/// Kind of change reported by the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A row-level change notification from the remote data store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
    /// Row after the change (absent for deletes).
    #[serde(default)]
    pub new: Option<Row>,
    /// Row before the change (absent for inserts).
    #[serde(default)]
    pub old: Option<Row>,
}

impl ChangeEvent {
    pub fn inserted(table: Table, row: Row) -> Self {
        Self {
            table,
            kind: ChangeKind::Insert,
            new: Some(row),
            old: None,
        }
    }

    pub fn updated(table: Table, old: Row, new: Row) -> Self {
        Self {
            table,
            kind: ChangeKind::Update,
            new: Some(new),
            old: Some(old),
        }
    }

    pub fn deleted(table: Table, old: Row) -> Self {
        Self {
            table,
            kind: ChangeKind::Delete,
            new: None,
            old: Some(old),
        }
    }
}

/// A date range with inclusive start and end dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// Creates a new date range, validating that start <= end.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, DateRangeError> {
        if start > end {
            return Err(DateRangeError::InvalidRange);
        }
        Ok(Self { start, end })
    }

    /// Creates a date range for an entire month.
    pub fn month(year: i32, month: u32) -> Result<Self, DateRangeError> {
        let start = NaiveDate::from_ymd_opt(year, month, 1).ok_or(DateRangeError::InvalidRange)?;

        // First of next month minus one day
        let end = if month == 12 {
            NaiveDate::from_ymd_opt(year + 1, 1, 1)
        } else {
            NaiveDate::from_ymd_opt(year, month + 1, 1)
        }
        .and_then(|d| d.pred_opt())
        .ok_or(DateRangeError::InvalidRange)?;

        Ok(Self { start, end })
    }

    /// Returns true if the date falls inside the range (inclusive on both ends).
    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}
