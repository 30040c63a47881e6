//! Typed rows of the property-management tables.
//!
//! The cache stores raw JSON; these types are what resources hand to callers.
//! Unknown columns are ignored when decoding, so provisional records (which
//! carry an extra marker column) decode like confirmed ones.

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::gateway::{Row, Table};
use crate::mutation::SecondaryWrite;

/// A record stored in one table, identified by its primary key.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const TABLE: Table;

    fn id(&self) -> Uuid;
}

macro_rules! entity {
    ($ty:ty, $table:expr, $pk:ident) => {
        impl Entity for $ty {
            const TABLE: Table = $table;

            fn id(&self) -> Uuid {
                self.$pk
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    CheckedIn,
    CheckedOut,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Sent,
    Paid,
    Overdue,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissionStatus {
    Pending,
    Approved,
    Paid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub property_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub property_type: Option<String>,
    #[serde(default)]
    pub owner_id: Option<Uuid>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyLocation {
    pub location_id: Uuid,
    pub property_id: Uuid,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyAmenity {
    pub property_amenity_id: Uuid,
    pub property_id: Uuid,
    pub amenity: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub title: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub property_id: Option<Uuid>,
    #[serde(default)]
    pub job_id: Option<Uuid>,
    #[serde(default)]
    pub assigned_to: Option<Uuid>,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub title: String,
    pub status: JobStatus,
    #[serde(default)]
    pub property_id: Option<Uuid>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub booking_id: Uuid,
    pub property_id: Uuid,
    pub guest_name: String,
    pub checkin_date: NaiveDate,
    pub checkout_date: NaiveDate,
    pub status: BookingStatus,
    /// Denormalized from the booking's invoices.
    #[serde(default)]
    pub payment_status: Option<String>,
    #[serde(default)]
    pub total_amount: Option<f64>,
}

impl Booking {
    /// Nights between check-in and check-out, never negative.
    pub fn nights(&self) -> i64 {
        (self.checkout_date - self.checkin_date).num_days().max(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub status: InvoiceStatus,
    pub total_amount: f64,
    #[serde(default)]
    pub property_id: Option<Uuid>,
    #[serde(default)]
    pub booking_id: Option<Uuid>,
    #[serde(default)]
    pub invoice_number: Option<String>,
    #[serde(default)]
    pub issue_date: Option<NaiveDate>,
    #[serde(default)]
    pub paid_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expense {
    pub expense_id: Uuid,
    pub category: String,
    pub amount: f64,
    #[serde(default)]
    pub tax_amount: f64,
    pub expense_date: NaiveDate,
    #[serde(default)]
    pub property_id: Option<Uuid>,
    #[serde(default)]
    pub description: Option<String>,
}

impl Expense {
    /// Amount including tax.
    pub fn total(&self) -> f64 {
        self.amount + self.tax_amount
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commission {
    pub commission_id: Uuid,
    pub amount: f64,
    pub status: CommissionStatus,
    #[serde(default)]
    pub property_id: Option<Uuid>,
    #[serde(default)]
    pub booking_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub document_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub property_id: Option<Uuid>,
    #[serde(default)]
    pub file_url: Option<String>,
}

entity!(Property, Table::Properties, property_id);
entity!(PropertyLocation, Table::PropertyLocations, location_id);
entity!(PropertyAmenity, Table::PropertyAmenities, property_amenity_id);
entity!(Task, Table::Tasks, task_id);
entity!(Job, Table::Jobs, job_id);
entity!(Booking, Table::Bookings, booking_id);
entity!(Invoice, Table::Invoices, invoice_id);
entity!(Expense, Table::Expenses, expense_id);
entity!(Commission, Table::Commissions, commission_id);
entity!(Document, Table::Documents, document_id);

fn default_true() -> bool {
    true
}

/// Input for creating a property together with its location and amenities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewProperty {
    pub name: String,
    #[serde(default)]
    pub property_type: Option<String>,
    #[serde(default)]
    pub owner_id: Option<Uuid>,
    #[serde(default, skip_serializing)]
    pub location: Option<NewLocation>,
    #[serde(default, skip_serializing)]
    pub amenities: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewLocation {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

impl NewProperty {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// The location and amenity rows, written after the property exists.
    pub fn secondary_writes(&self) -> Vec<SecondaryWrite> {
        let mut writes = Vec::new();
        if let Some(location) = &self.location {
            let row: Row = json!({
                "address": location.address,
                "city": location.city,
                "country": location.country,
            });
            writes.push(SecondaryWrite::new(
                Table::PropertyLocations,
                "property_id",
                vec![row],
            ));
        }
        if !self.amenities.is_empty() {
            let rows = self
                .amenities
                .iter()
                .map(|amenity| json!({ "amenity": amenity }))
                .collect();
            writes.push(SecondaryWrite::new(
                Table::PropertyAmenities,
                "property_id",
                rows,
            ));
        }
        writes
    }
}
