//! Demo rows for the in-memory gateway.

use chrono::{Days, NaiveDate};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use uuid::Uuid;

use concierge_core::gateway::{Row, Table};

use crate::gateway::InMemoryGateway;

const PROPERTIES: [(&str, &str, &str); 3] = [
    ("Casa Azul", "house", "Montevideo"),
    ("Beach Loft", "apartment", "Punta del Este"),
    ("Chacra Los Pinos", "farm", "Colonia"),
];

const GUESTS: [&str; 6] = ["Ana", "Bruno", "Carla", "Diego", "Elena", "Facundo"];
const TASKS: [&str; 5] = [
    "Clean pool",
    "Replace light bulbs",
    "Restock towels",
    "Fix kitchen tap",
    "Check smoke alarm",
];
const EXPENSE_CATEGORIES: [&str; 4] = ["cleaning", "repairs", "utilities", "supplies"];

fn offset(date: NaiveDate, days: i64) -> NaiveDate {
    if days >= 0 {
        date.checked_add_days(Days::new(days as u64)).unwrap_or(date)
    } else {
        date.checked_sub_days(Days::new(days.unsigned_abs()))
            .unwrap_or(date)
    }
}

fn pick<'a>(rng: &mut StdRng, items: &[&'a str]) -> &'a str {
    items[rng.random_range(0..items.len())]
}

fn amount(rng: &mut StdRng, min: u32, max: u32) -> f64 {
    f64::from(rng.random_range(min..=max))
}

/// Generates a reproducible data set around `today`: three properties with
/// jobs, tasks, bookings and their invoices, expenses and commissions.
pub fn generate_demo_data(seed: u64, today: NaiveDate) -> Vec<(Table, Vec<Row>)> {
    let mut rng = StdRng::seed_from_u64(seed);

    let mut properties = Vec::new();
    let mut locations = Vec::new();
    let mut jobs = Vec::new();
    let mut tasks = Vec::new();
    let mut bookings = Vec::new();
    let mut invoices = Vec::new();
    let mut expenses = Vec::new();
    let mut commissions = Vec::new();

    for (name, kind, city) in PROPERTIES {
        let property_id = Uuid::new_v4().to_string();
        properties.push(json!({
            "property_id": property_id,
            "name": name,
            "property_type": kind,
            "is_active": true,
        }));
        locations.push(json!({
            "location_id": Uuid::new_v4().to_string(),
            "property_id": property_id,
            "city": city,
            "country": "Uruguay",
        }));

        let job_id = Uuid::new_v4().to_string();
        jobs.push(json!({
            "job_id": job_id,
            "title": format!("Turnover at {}", name),
            "status": "in_progress",
            "property_id": property_id,
        }));
        for _ in 0..rng.random_range(1..=3) {
            tasks.push(json!({
                "task_id": Uuid::new_v4().to_string(),
                "title": pick(&mut rng, &TASKS),
                "status": if rng.random_bool(0.3) { "completed" } else { "pending" },
                "property_id": property_id,
                "job_id": job_id,
                "due_date": offset(today, rng.random_range(0..=7)),
            }));
        }

        for _ in 0..rng.random_range(2..=4) {
            let booking_id = Uuid::new_v4().to_string();
            let checkin = offset(today, rng.random_range(-45..=30));
            let nights = rng.random_range(2..=7);
            let total = amount(&mut rng, 80, 250) * nights as f64;
            let past = checkin < today;
            bookings.push(json!({
                "booking_id": booking_id,
                "property_id": property_id,
                "guest_name": pick(&mut rng, &GUESTS),
                "checkin_date": checkin,
                "checkout_date": offset(checkin, nights),
                "status": if past { "checked_out" } else { "confirmed" },
                "total_amount": total,
            }));
            invoices.push(json!({
                "invoice_id": Uuid::new_v4().to_string(),
                "status": if past { "paid" } else { "sent" },
                "total_amount": total,
                "property_id": property_id,
                "booking_id": booking_id,
                "issue_date": offset(checkin, -7),
                "paid_date": if past { Some(checkin) } else { None },
            }));
            commissions.push(json!({
                "commission_id": Uuid::new_v4().to_string(),
                "amount": (total * 0.15).round(),
                "status": if past { "paid" } else { "pending" },
                "property_id": property_id,
                "booking_id": booking_id,
            }));
        }

        for _ in 0..rng.random_range(1..=3) {
            let net = amount(&mut rng, 20, 400);
            expenses.push(json!({
                "expense_id": Uuid::new_v4().to_string(),
                "category": pick(&mut rng, &EXPENSE_CATEGORIES),
                "amount": net,
                "tax_amount": (net * 0.22).round(),
                "expense_date": offset(today, rng.random_range(-60..=0)),
                "property_id": property_id,
            }));
        }
    }

    vec![
        (Table::Properties, properties),
        (Table::PropertyLocations, locations),
        (Table::Jobs, jobs),
        (Table::Tasks, tasks),
        (Table::Bookings, bookings),
        (Table::Invoices, invoices),
        (Table::Expenses, expenses),
        (Table::Commissions, commissions),
    ]
}

/// Loads the demo data set into a gateway.
pub async fn seed_gateway(gateway: &InMemoryGateway, seed: u64, today: NaiveDate) {
    for (table, rows) in generate_demo_data(seed, today) {
        tracing::debug!(%table, rows = rows.len(), "Seeding demo rows");
        gateway.seed(table, rows).await;
    }
}
