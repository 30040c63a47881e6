//! Report service: fetches rows straight from the gateway and aggregates
//! them with the pure functions in [`concierge_core::reports`].
//!
//! Reports bypass the query cache; each call sees current server data.

use std::sync::Arc;

use chrono::{Datelike, NaiveDate};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use concierge_core::cache::{list_from_payload, to_payload, SerializationError};
use concierge_core::domain::{Booking, Commission, Expense, Invoice, Property, Task, TaskStatus};
use concierge_core::gateway::{
    self, DateRange, DateRangeError, Filter, Gateway, GatewayError, SelectQuery, Table,
};
use concierge_core::reports::{
    commission_summary, expenses_by_category, monthly_financials, occupancy_days,
    revenue_by_property, CategoryTotal, CommissionSummary, MonthlyFinancials, PropertyOccupancy,
    PropertyRevenue,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReportError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    #[error(transparent)]
    DateRange(#[from] DateRangeError),
}

pub type Result<T> = std::result::Result<T, ReportError>;

/// Headline numbers for the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardSummary {
    pub active_properties: usize,
    pub open_tasks: usize,
    /// Non-cancelled bookings checking in from today on.
    pub upcoming_bookings: usize,
    /// Revenue paid during the current month.
    pub month_revenue: f64,
}

fn within(column: &str, range: &DateRange) -> Filter {
    Filter::new()
        .gte(column, range.start.to_string())
        .lte(column, range.end.to_string())
}

#[derive(Clone)]
pub struct ReportService {
    gateway: Arc<dyn Gateway>,
}

impl std::fmt::Debug for ReportService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportService").finish_non_exhaustive()
    }
}

impl ReportService {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self { gateway }
    }

    async fn fetch<E: DeserializeOwned>(&self, table: Table, filter: Filter) -> Result<Vec<E>> {
        let rows = self.gateway.select(table, &SelectQuery::new(filter)).await?;
        tracing::debug!(%table, rows = rows.len(), "Fetched report rows");
        Ok(list_from_payload(&Value::Array(rows))?)
    }

    async fn paid_invoices(&self, range: &DateRange) -> Result<Vec<Invoice>> {
        self.fetch(Table::Invoices, within("paid_date", range).eq("status", "paid"))
            .await
    }

    async fn expenses(&self, range: &DateRange) -> Result<Vec<Expense>> {
        self.fetch(Table::Expenses, within("expense_date", range)).await
    }

    pub async fn revenue_by_property(&self, range: &DateRange) -> Result<Vec<PropertyRevenue>> {
        let invoices = self.paid_invoices(range).await?;
        Ok(revenue_by_property(&invoices, range))
    }

    pub async fn expenses_by_category(&self, range: &DateRange) -> Result<Vec<CategoryTotal>> {
        let expenses = self.expenses(range).await?;
        Ok(expenses_by_category(&expenses))
    }

    pub async fn monthly_financials(&self, range: &DateRange) -> Result<Vec<MonthlyFinancials>> {
        let (invoices, expenses) =
            tokio::try_join!(self.paid_invoices(range), self.expenses(range))?;
        Ok(monthly_financials(&invoices, &expenses))
    }

    pub async fn occupancy(&self, range: &DateRange) -> Result<Vec<PropertyOccupancy>> {
        let bookings: Vec<Booking> = self
            .fetch(Table::Bookings, within("checkin_date", range))
            .await?;
        Ok(occupancy_days(&bookings, range))
    }

    pub async fn commissions(&self) -> Result<CommissionSummary> {
        let commissions: Vec<Commission> = self.fetch(Table::Commissions, Filter::new()).await?;
        Ok(commission_summary(&commissions))
    }

    pub async fn dashboard(&self, today: NaiveDate) -> Result<DashboardSummary> {
        let month = DateRange::month(today.year(), today.month())?;
        let (properties, tasks, bookings, invoices) = tokio::try_join!(
            self.fetch::<Property>(Table::Properties, Filter::new()),
            self.fetch::<Task>(Table::Tasks, Filter::new()),
            self.fetch::<Booking>(
                Table::Bookings,
                Filter::new()
                    .gte("checkin_date", today.to_string())
                    .neq("status", "cancelled"),
            ),
            self.paid_invoices(&month),
        )?;

        let open_tasks = tasks
            .iter()
            .filter(|task| matches!(task.status, TaskStatus::Pending | TaskStatus::InProgress))
            .count();
        let month_revenue = revenue_by_property(&invoices, &month)
            .iter()
            .map(|revenue| revenue.revenue)
            .sum();

        Ok(DashboardSummary {
            // Rows without the column count as active
            active_properties: properties.iter().filter(|p| p.is_active).count(),
            open_tasks,
            upcoming_bookings: bookings.len(),
            month_revenue,
        })
    }

    /// The dashboard as a cache payload.
    pub(crate) async fn dashboard_payload(&self, today: NaiveDate) -> gateway::Result<Value> {
        let summary = self.dashboard(today).await.map_err(|err| match err {
            ReportError::Gateway(err) => err,
            other => GatewayError::Serialization(other.to_string()),
        })?;
        to_payload(&summary).map_err(|e| GatewayError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{GatewayOp, InMemoryGateway};
    use serde_json::json;

    const CASA: &str = "7b0c3c1e-0f7e-4d0a-9a59-5a3f4f1e2c01";
    const LOFT: &str = "2e1d7a44-55b0-4b7c-8f0e-3c6a9d2b1f03";

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    async fn service() -> (ReportService, InMemoryGateway) {
        let gateway = InMemoryGateway::new();
        gateway
            .seed(
                Table::Invoices,
                vec![
                    json!({"invoice_id": id(), "status": "paid", "total_amount": 1200.0, "property_id": CASA, "paid_date": "2024-03-05"}),
                    json!({"invoice_id": id(), "status": "paid", "total_amount": 300.0, "property_id": CASA, "paid_date": "2024-04-02"}),
                    json!({"invoice_id": id(), "status": "paid", "total_amount": 800.0, "property_id": LOFT, "paid_date": "2024-03-20"}),
                    json!({"invoice_id": id(), "status": "sent", "total_amount": 999.0, "property_id": LOFT}),
                ],
            )
            .await;
        gateway
            .seed(
                Table::Expenses,
                vec![
                    json!({"expense_id": id(), "category": "cleaning", "amount": 100.0, "tax_amount": 22.0, "expense_date": "2024-03-10"}),
                    json!({"expense_id": id(), "category": "repairs", "amount": 50.0, "expense_date": "2024-04-11"}),
                ],
            )
            .await;
        gateway
            .seed(
                Table::Bookings,
                vec![
                    json!({"booking_id": id(), "property_id": CASA, "guest_name": "Ana", "checkin_date": "2024-03-30", "checkout_date": "2024-04-03", "status": "confirmed"}),
                    json!({"booking_id": id(), "property_id": CASA, "guest_name": "Bo", "checkin_date": "2024-03-10", "checkout_date": "2024-03-12", "status": "cancelled"}),
                ],
            )
            .await;
        (ReportService::new(Arc::new(gateway.clone())), gateway)
    }

    #[tokio::test]
    async fn test_revenue_filters_by_paid_date() {
        let (reports, _) = service().await;
        let march = DateRange::month(2024, 3).unwrap();

        let revenue = reports.revenue_by_property(&march).await.unwrap();
        let total: f64 = revenue.iter().map(|r| r.revenue).sum();
        assert_eq!(revenue.len(), 2);
        assert!((total - 2000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_monthly_financials() {
        let (reports, _) = service().await;
        let range = DateRange::new(date(2024, 3, 1), date(2024, 4, 30)).unwrap();

        let months = reports.monthly_financials(&range).await.unwrap();
        assert_eq!(months.len(), 2);
        assert_eq!(months[0].month, "2024-03");
        assert!((months[0].revenue - 2000.0).abs() < 1e-9);
        assert!((months[0].expenses - 122.0).abs() < 1e-9);
        assert!((months[1].net_income - 250.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_occupancy_counts_full_stays() {
        let (reports, _) = service().await;
        let occupancy = reports
            .occupancy(&DateRange::month(2024, 3).unwrap())
            .await
            .unwrap();
        assert_eq!(occupancy.len(), 1);
        assert_eq!(occupancy[0].nights, 4);
    }

    #[tokio::test]
    async fn test_gateway_errors_propagate() {
        let (reports, gateway) = service().await;
        gateway.fail_next(GatewayOp::Select, GatewayError::Timeout("5s".into()));

        let err = reports.commissions().await.unwrap_err();
        assert_eq!(err, ReportError::Gateway(GatewayError::Timeout("5s".into())));
    }

    #[tokio::test]
    async fn test_dashboard_summary() {
        let (reports, gateway) = service().await;
        gateway
            .seed(
                Table::Tasks,
                vec![
                    json!({"task_id": id(), "title": "Clean", "status": "pending"}),
                    json!({"task_id": id(), "title": "Paint", "status": "completed"}),
                ],
            )
            .await;
        gateway
            .seed(
                Table::Properties,
                vec![
                    json!({"property_id": CASA, "name": "Casa Azul", "is_active": true}),
                    json!({"property_id": id(), "name": "Old Barn", "is_active": false}),
                ],
            )
            .await;

        let summary = reports.dashboard(date(2024, 3, 15)).await.unwrap();
        assert_eq!(summary.active_properties, 1);
        assert_eq!(summary.open_tasks, 1);
        assert_eq!(summary.upcoming_bookings, 1);
        assert!((summary.month_revenue - 2000.0).abs() < 1e-9);
    }
}
