//! Static routing from entity changes to the cache keys they make stale.
//!
//! The same [`EntityEvent`] is built for writes made in this session and for
//! rows arriving on the change feed, so both paths invalidate identically.

use serde_json::Value;

use crate::cache::{
    all_details_pattern, dashboard_pattern, detail_pattern, list_pattern, KeyPattern,
};
use crate::gateway::{ChangeEvent, ChangeKind, Row, Table};

/// A status change that affects other entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    /// A task linked to a job moved to `completed`.
    TaskCompleted,
    /// An invoice moved to `paid`.
    InvoicePaid,
}

/// Reference from a changed row to a related record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Link {
    /// Related ids found in the old and new rows (possibly none).
    Ids(Vec<String>),
    /// Neither row carried the column.
    Unknown,
}

impl Link {
    fn from_rows(column: &str, rows: &[Option<&Row>]) -> Self {
        let mut present = false;
        let mut ids = Vec::new();
        for row in rows.iter().flatten() {
            if let Some(value) = row.get(column) {
                present = true;
                if let Some(id) = id_string(value) {
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
            }
        }
        if present {
            Link::Ids(ids)
        } else {
            Link::Unknown
        }
    }
}

/// Something happened to one row of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityEvent {
    pub table: Table,
    pub kind: ChangeKind,
    /// Primary key of the changed row, when known.
    pub id: Option<String>,
    /// Parent properties (the row itself for the properties table).
    pub property: Link,
    pub job: Link,
    pub transitions: Vec<Transition>,
}

impl EntityEvent {
    /// Builds an event from the row before and after the change.
    pub fn from_change(table: Table, kind: ChangeKind, old: Option<&Row>, new: Option<&Row>) -> Self {
        let id = new
            .and_then(|row| table.row_id(row))
            .or_else(|| old.and_then(|row| table.row_id(row)));

        let property = match (table, &id) {
            (Table::Properties, Some(id)) => Link::Ids(vec![id.clone()]),
            _ => Link::from_rows("property_id", &[old, new]),
        };
        let job = match (table, &id) {
            (Table::Jobs, Some(id)) => Link::Ids(vec![id.clone()]),
            _ => Link::from_rows("job_id", &[old, new]),
        };

        let mut transitions = Vec::new();
        if let Some(new) = new {
            let became = |status: &str| {
                column_str(new, "status") == Some(status)
                    && old.and_then(|o| column_str(o, "status")) != Some(status)
            };
            if table == Table::Tasks && became("completed") && has_value(new, "job_id") {
                transitions.push(Transition::TaskCompleted);
            }
            if table == Table::Invoices && became("paid") {
                transitions.push(Transition::InvoicePaid);
            }
        }

        Self {
            table,
            kind,
            id,
            property,
            job,
            transitions,
        }
    }

    /// Builds an event from a change-feed notification.
    pub fn from_feed(event: &ChangeEvent) -> Self {
        Self::from_change(event.table, event.kind, event.old.as_ref(), event.new.as_ref())
    }
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn column_str<'a>(row: &'a Row, column: &str) -> Option<&'a str> {
    row.get(column).and_then(Value::as_str)
}

fn has_value(row: &Row, column: &str) -> bool {
    row.get(column).and_then(id_string).is_some()
}

/// What fires a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Any insert, update or delete on the table.
    Changed(Table),
    Transition(Transition),
}

/// A set of keys named relative to the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Every filtered list of a table.
    AllLists(Table),
    /// The changed row's own detail key.
    SelfDetail,
    /// Detail keys of the parent properties.
    PropertyDetail,
    /// Detail keys of the linked jobs.
    JobDetail,
    /// Every dashboard summary.
    Dashboard,
}

pub type Rule = (Trigger, &'static [Target]);

/// Event → targets. Every table has a `Changed` rule.
pub static INVALIDATION_RULES: &[Rule] = &[
    (
        Trigger::Changed(Table::Properties),
        &[
            Target::AllLists(Table::Properties),
            Target::SelfDetail,
            Target::Dashboard,
        ],
    ),
    (
        Trigger::Changed(Table::PropertyLocations),
        &[
            Target::AllLists(Table::PropertyLocations),
            Target::SelfDetail,
            Target::AllLists(Table::Properties),
            Target::PropertyDetail,
        ],
    ),
    (
        Trigger::Changed(Table::PropertyAmenities),
        &[
            Target::AllLists(Table::PropertyAmenities),
            Target::SelfDetail,
            Target::AllLists(Table::Properties),
            Target::PropertyDetail,
        ],
    ),
    (
        Trigger::Changed(Table::Tasks),
        &[
            Target::AllLists(Table::Tasks),
            Target::SelfDetail,
            Target::PropertyDetail,
            Target::Dashboard,
        ],
    ),
    (
        Trigger::Transition(Transition::TaskCompleted),
        &[Target::AllLists(Table::Jobs), Target::JobDetail],
    ),
    (
        Trigger::Changed(Table::Jobs),
        &[
            Target::AllLists(Table::Jobs),
            Target::SelfDetail,
            Target::PropertyDetail,
        ],
    ),
    (
        Trigger::Changed(Table::Bookings),
        &[
            Target::AllLists(Table::Bookings),
            Target::SelfDetail,
            Target::PropertyDetail,
            Target::Dashboard,
        ],
    ),
    (
        Trigger::Changed(Table::Invoices),
        &[
            Target::AllLists(Table::Invoices),
            Target::SelfDetail,
            Target::Dashboard,
        ],
    ),
    // payment_status is denormalized onto bookings
    (
        Trigger::Transition(Transition::InvoicePaid),
        &[Target::AllLists(Table::Bookings)],
    ),
    (
        Trigger::Changed(Table::Expenses),
        &[
            Target::AllLists(Table::Expenses),
            Target::SelfDetail,
            Target::Dashboard,
        ],
    ),
    (
        Trigger::Changed(Table::Commissions),
        &[Target::AllLists(Table::Commissions), Target::SelfDetail],
    ),
    (
        Trigger::Changed(Table::Documents),
        &[Target::AllLists(Table::Documents), Target::SelfDetail],
    ),
];

/// Resolves events to key patterns through a rule table.
#[derive(Debug, Clone, Copy)]
pub struct InvalidationRouter {
    rules: &'static [Rule],
}

impl InvalidationRouter {
    pub fn new(rules: &'static [Rule]) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &'static [Rule] {
        self.rules
    }

    /// Returns the patterns to invalidate for an event, without duplicates.
    pub fn route(&self, event: &EntityEvent) -> Vec<KeyPattern> {
        let mut patterns = Vec::new();
        for (trigger, targets) in self.rules {
            let fires = match trigger {
                Trigger::Changed(table) => *table == event.table,
                Trigger::Transition(transition) => event.transitions.contains(transition),
            };
            if !fires {
                continue;
            }
            for target in targets.iter() {
                for pattern in resolve(*target, event) {
                    if !patterns.contains(&pattern) {
                        patterns.push(pattern);
                    }
                }
            }
        }
        patterns
    }
}

impl Default for InvalidationRouter {
    fn default() -> Self {
        Self::new(INVALIDATION_RULES)
    }
}

fn resolve(target: Target, event: &EntityEvent) -> Vec<KeyPattern> {
    match target {
        Target::AllLists(table) => vec![list_pattern(table)],
        Target::SelfDetail => match &event.id {
            Some(id) => vec![detail_pattern(event.table, id)],
            None => vec![all_details_pattern(event.table)],
        },
        Target::PropertyDetail => link_details(Table::Properties, &event.property),
        Target::JobDetail => link_details(Table::Jobs, &event.job),
        Target::Dashboard => vec![dashboard_pattern()],
    }
}

fn link_details(table: Table, link: &Link) -> Vec<KeyPattern> {
    match link {
        Link::Ids(ids) => ids.iter().map(|id| detail_pattern(table, id)).collect(),
        Link::Unknown => vec![all_details_pattern(table)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{dashboard_key, detail_key, list_key};
    use crate::gateway::{Filter, SelectQuery};
    use serde_json::json;

    fn route(event: &EntityEvent) -> Vec<String> {
        InvalidationRouter::default()
            .route(event)
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    #[test]
    fn test_every_table_has_a_changed_rule() {
        for table in Table::ALL {
            assert!(
                INVALIDATION_RULES
                    .iter()
                    .any(|(trigger, _)| *trigger == Trigger::Changed(table)),
                "missing rule for {}",
                table
            );
        }
    }

    #[test]
    fn test_property_change() {
        let row = json!({"property_id": "p1", "name": "Villa"});
        let event = EntityEvent::from_change(Table::Properties, ChangeKind::Update, Some(&row), Some(&row));
        assert_eq!(
            route(&event),
            vec!["properties:list:*", "properties:detail:p1", "dashboard:*"]
        );
    }

    #[test]
    fn test_task_change_reaches_property_and_dashboard() {
        let row = json!({"task_id": "t1", "property_id": "p1", "status": "pending", "job_id": null});
        let event = EntityEvent::from_change(Table::Tasks, ChangeKind::Insert, None, Some(&row));
        assert_eq!(
            route(&event),
            vec![
                "tasks:list:*",
                "tasks:detail:t1",
                "properties:detail:p1",
                "dashboard:*"
            ]
        );
        assert!(event.transitions.is_empty());
    }

    #[test]
    fn test_task_completed_with_job() {
        let old = json!({"task_id": "t1", "property_id": "p1", "status": "in_progress", "job_id": "j1"});
        let new = json!({"task_id": "t1", "property_id": "p1", "status": "completed", "job_id": "j1"});
        let event = EntityEvent::from_change(Table::Tasks, ChangeKind::Update, Some(&old), Some(&new));

        assert_eq!(event.transitions, vec![Transition::TaskCompleted]);
        let patterns = route(&event);
        assert!(patterns.contains(&"jobs:list:*".to_string()));
        assert!(patterns.contains(&"jobs:detail:j1".to_string()));
    }

    #[test]
    fn test_task_completed_without_job_is_not_a_transition() {
        let old = json!({"task_id": "t1", "status": "pending", "job_id": null});
        let new = json!({"task_id": "t1", "status": "completed", "job_id": null});
        let event = EntityEvent::from_change(Table::Tasks, ChangeKind::Update, Some(&old), Some(&new));
        assert!(event.transitions.is_empty());
        assert!(!route(&event).contains(&"jobs:list:*".to_string()));
    }

    #[test]
    fn test_already_completed_task_is_not_a_transition() {
        let row = json!({"task_id": "t1", "status": "completed", "job_id": "j1"});
        let event = EntityEvent::from_change(Table::Tasks, ChangeKind::Update, Some(&row), Some(&row));
        assert!(event.transitions.is_empty());
    }

    #[test]
    fn test_invoice_paid_invalidates_bookings() {
        let old = json!({"invoice_id": "i1", "status": "sent"});
        let new = json!({"invoice_id": "i1", "status": "paid"});
        let event = EntityEvent::from_change(Table::Invoices, ChangeKind::Update, Some(&old), Some(&new));
        assert_eq!(
            route(&event),
            vec![
                "invoices:list:*",
                "invoices:detail:i1",
                "dashboard:*",
                "bookings:list:*"
            ]
        );
    }

    #[test]
    fn test_unpaid_invoice_leaves_bookings_alone() {
        let new = json!({"invoice_id": "i1", "status": "draft"});
        let event = EntityEvent::from_change(Table::Invoices, ChangeKind::Insert, None, Some(&new));
        assert!(!route(&event).contains(&"bookings:list:*".to_string()));
    }

    #[test]
    fn test_moved_task_invalidates_both_properties() {
        let old = json!({"task_id": "t1", "property_id": "p1"});
        let new = json!({"task_id": "t1", "property_id": "p2"});
        let event = EntityEvent::from_change(Table::Tasks, ChangeKind::Update, Some(&old), Some(&new));
        let patterns = route(&event);
        assert!(patterns.contains(&"properties:detail:p1".to_string()));
        assert!(patterns.contains(&"properties:detail:p2".to_string()));
    }

    #[test]
    fn test_partial_delete_row_falls_back_to_namespace_details() {
        // Change feeds may only send the primary key of a deleted row
        let old = json!({"booking_id": "b1"});
        let event = EntityEvent::from_change(Table::Bookings, ChangeKind::Delete, Some(&old), None);
        assert_eq!(event.property, Link::Unknown);
        let patterns = route(&event);
        assert!(patterns.contains(&"bookings:detail:b1".to_string()));
        assert!(patterns.contains(&"properties:detail:*".to_string()));
        assert!(!patterns.contains(&"*".to_string()));
    }

    #[test]
    fn test_null_parent_is_not_invalidated() {
        let row = json!({"task_id": "t1", "property_id": null});
        let event = EntityEvent::from_change(Table::Tasks, ChangeKind::Insert, None, Some(&row));
        assert!(!route(&event).iter().any(|p| p.starts_with("properties:")));
    }

    #[test]
    fn test_missing_id_uses_detail_wildcard() {
        let event = EntityEvent::from_change(Table::Documents, ChangeKind::Delete, None, None);
        assert_eq!(route(&event), vec!["documents:list:*", "documents:detail:*"]);
    }

    #[test]
    fn test_location_change_reaches_parent_property() {
        let row = json!({"location_id": "l1", "property_id": "p1", "city": "Lisbon"});
        let event = EntityEvent::from_change(Table::PropertyLocations, ChangeKind::Insert, None, Some(&row));
        let patterns = route(&event);
        assert!(patterns.contains(&"properties:list:*".to_string()));
        assert!(patterns.contains(&"properties:detail:p1".to_string()));
    }

    #[test]
    fn test_unrelated_keys_are_not_touched() {
        let row = json!({"expense_id": "e1", "property_id": "p1"});
        let event = EntityEvent::from_change(Table::Expenses, ChangeKind::Insert, None, Some(&row));
        let patterns = InvalidationRouter::default().route(&event);

        let unrelated = [
            list_key(Table::Tasks, &SelectQuery::default()),
            list_key(Table::Properties, &SelectQuery::new(Filter::new())),
            detail_key(Table::Properties, "p1"),
        ];
        for key in &unrelated {
            assert!(!patterns.iter().any(|p| p.matches(key)), "{} matched", key);
        }
        assert!(patterns.iter().any(|p| p.matches(&dashboard_key("summary"))));
    }

    #[test]
    fn test_from_feed_matches_from_change() {
        let row = json!({"task_id": "t1", "property_id": "p1"});
        let feed = ChangeEvent::inserted(Table::Tasks, row.clone());
        assert_eq!(
            EntityEvent::from_feed(&feed),
            EntityEvent::from_change(Table::Tasks, ChangeKind::Insert, None, Some(&row))
        );
    }
}
