//! Pure report aggregations over invoices, expenses, bookings and commissions.
//!
//! None of these functions keep state; the same rows always give the same
//! report.

use std::collections::BTreeMap;

use serde::Serialize;
use uuid::Uuid;

use crate::domain::{
    Booking, BookingStatus, Commission, CommissionStatus, Expense, Invoice, InvoiceStatus,
};
use crate::gateway::DateRange;

/// Paid revenue of one property.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyRevenue {
    pub property_id: Uuid,
    pub revenue: f64,
    pub invoice_count: usize,
}

/// Expense totals of one category.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryTotal {
    pub category: String,
    pub total: f64,
    pub count: usize,
    /// Share of the grand total, 0 when the grand total is 0.
    pub percentage: f64,
}

/// Revenue and expenses of one `YYYY-MM` month.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyFinancials {
    pub month: String,
    pub revenue: f64,
    pub expenses: f64,
    pub net_income: f64,
}

/// Booked nights of one property.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyOccupancy {
    pub property_id: Uuid,
    pub nights: i64,
    pub booking_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommissionSummary {
    pub pending: f64,
    pub approved: f64,
    pub paid: f64,
    pub total: f64,
    pub count: usize,
}

/// Sums paid invoices per property, by `paid_date` within the range.
///
/// Invoices without a property or a paid date are ignored. Sorted by property id.
pub fn revenue_by_property(invoices: &[Invoice], range: &DateRange) -> Vec<PropertyRevenue> {
    let mut groups: BTreeMap<Uuid, PropertyRevenue> = BTreeMap::new();

    for invoice in invoices {
        if invoice.status != InvoiceStatus::Paid {
            continue;
        }
        let (Some(property_id), Some(paid)) = (invoice.property_id, invoice.paid_date) else {
            continue;
        };
        if !range.contains(paid) {
            continue;
        }
        let entry = groups.entry(property_id).or_insert(PropertyRevenue {
            property_id,
            revenue: 0.0,
            invoice_count: 0,
        });
        entry.revenue += invoice.total_amount;
        entry.invoice_count += 1;
    }

    groups.into_values().collect()
}

/// Groups expenses by category; each total includes tax.
///
/// Sorted by total descending, then category name.
pub fn expenses_by_category(expenses: &[Expense]) -> Vec<CategoryTotal> {
    let mut groups: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
    for expense in expenses {
        let entry = groups.entry(expense.category.as_str()).or_insert((0.0, 0));
        entry.0 += expense.total();
        entry.1 += 1;
    }

    let grand_total: f64 = groups.values().map(|(total, _)| total).sum();

    let mut totals: Vec<CategoryTotal> = groups
        .into_iter()
        .map(|(category, (total, count))| CategoryTotal {
            category: category.to_string(),
            total,
            count,
            percentage: if grand_total == 0.0 {
                0.0
            } else {
                total / grand_total * 100.0
            },
        })
        .collect();

    totals.sort_by(|a, b| b.total.total_cmp(&a.total).then_with(|| a.category.cmp(&b.category)));
    totals
}

/// Per-month revenue (paid invoices by `paid_date`) and expenses (by
/// `expense_date`, including tax).
///
/// Months without activity are omitted. Sorted ascending by month.
pub fn monthly_financials(invoices: &[Invoice], expenses: &[Expense]) -> Vec<MonthlyFinancials> {
    let mut months: BTreeMap<String, (f64, f64)> = BTreeMap::new();

    for invoice in invoices {
        if invoice.status != InvoiceStatus::Paid {
            continue;
        }
        if let Some(paid) = invoice.paid_date {
            months.entry(month_key(paid)).or_default().0 += invoice.total_amount;
        }
    }
    for expense in expenses {
        months.entry(month_key(expense.expense_date)).or_default().1 += expense.total();
    }

    months
        .into_iter()
        .map(|(month, (revenue, expenses))| MonthlyFinancials {
            month,
            revenue,
            expenses,
            net_income: revenue - expenses,
        })
        .collect()
}

/// Full nights of non-cancelled bookings whose check-in falls in the range.
///
/// Sorted by property id.
pub fn occupancy_days(bookings: &[Booking], range: &DateRange) -> Vec<PropertyOccupancy> {
    let mut groups: BTreeMap<Uuid, PropertyOccupancy> = BTreeMap::new();

    for booking in bookings {
        if booking.status == BookingStatus::Cancelled || !range.contains(booking.checkin_date) {
            continue;
        }
        let entry = groups
            .entry(booking.property_id)
            .or_insert(PropertyOccupancy {
                property_id: booking.property_id,
                nights: 0,
                booking_count: 0,
            });
        entry.nights += booking.nights();
        entry.booking_count += 1;
    }

    groups.into_values().collect()
}

/// Commission totals by status.
pub fn commission_summary(commissions: &[Commission]) -> CommissionSummary {
    commissions
        .iter()
        .fold(CommissionSummary::default(), |mut summary, commission| {
            match commission.status {
                CommissionStatus::Pending => summary.pending += commission.amount,
                CommissionStatus::Approved => summary.approved += commission.amount,
                CommissionStatus::Paid => summary.paid += commission.amount,
            }
            summary.total += commission.amount;
            summary.count += 1;
            summary
        })
}

fn month_key(date: chrono::NaiveDate) -> String {
    date.format("%Y-%m").to_string()
}
