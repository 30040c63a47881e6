use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Days, NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use concierge::gateway::{GatewayOp, InMemoryGateway};
use concierge::mock_data::seed_gateway;
use concierge::{Config, Session};
use concierge_core::domain::{NewLocation, NewProperty};
use concierge_core::gateway::{DateRange, Filter, GatewayError, SelectQuery};

/// Concierge - cached, optimistic access to property management data
#[derive(Parser, Debug)]
#[command(name = "concierge")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Seed for the generated demo data
    #[arg(long, default_value = "42", env = "CONCIERGE_SEED")]
    seed: u64,

    /// Read reports from the gateway at GATEWAY_URL instead of demo data
    #[arg(long)]
    remote: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Walk through cached reads, optimistic writes and a rollback.
    Demo,
    /// Print a report as JSON.
    Report {
        #[arg(value_enum)]
        kind: ReportKind,
        /// First day of the range (default: 90 days before --to)
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Last day of the range (default: today)
        #[arg(long)]
        to: Option<NaiveDate>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ReportKind {
    Revenue,
    Expenses,
    Monthly,
    Occupancy,
    Commissions,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "concierge=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let today = Utc::now().date_naive();

    match cli.command {
        Commands::Demo => {
            let gateway = InMemoryGateway::new();
            seed_gateway(&gateway, cli.seed, today).await;
            let session = Session::with_gateway(gateway.clone(), &config);
            run_demo(&session, &gateway).await?;
            session.shutdown();
        }
        Commands::Report { kind, from, to } => {
            let to = to.unwrap_or(today);
            let from = match from {
                Some(from) => from,
                None => to.checked_sub_days(Days::new(90)).unwrap_or(to),
            };
            let range = DateRange::new(from, to).context("--from must not be after --to")?;

            let session = if cli.remote {
                remote_session(&config)?
            } else {
                let gateway = InMemoryGateway::new();
                seed_gateway(&gateway, cli.seed, today).await;
                Session::with_gateway(gateway, &config)
            };
            run_report(&session, kind, &range).await?;
            session.shutdown();
        }
    }

    Ok(())
}

#[cfg(feature = "rest")]
fn remote_session(config: &Config) -> Result<Session> {
    use std::sync::Arc;

    use concierge::gateway::{RestGateway, SseChangeFeed};

    let url = config
        .gateway_url
        .as_deref()
        .context("GATEWAY_URL is not set")?;
    let api_key = config.gateway_api_key.clone().unwrap_or_default();
    let feed_url = config
        .change_feed_url()
        .context("CHANGE_FEED_URL is not set")?;

    let gateway = RestGateway::new(url, api_key.clone(), config.gateway_timeout())?;
    let feed = SseChangeFeed::new(&feed_url, api_key)?;
    tracing::info!(%url, "Using remote gateway");
    Ok(Session::new(Arc::new(gateway), Arc::new(feed), config))
}

#[cfg(not(feature = "rest"))]
fn remote_session(_config: &Config) -> Result<Session> {
    anyhow::bail!("this build does not include the remote gateway (feature `rest`)")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_report(session: &Session, kind: ReportKind, range: &DateRange) -> Result<()> {
    let reports = session.reports();
    match kind {
        ReportKind::Revenue => print_json(&reports.revenue_by_property(range).await?),
        ReportKind::Expenses => print_json(&reports.expenses_by_category(range).await?),
        ReportKind::Monthly => print_json(&reports.monthly_financials(range).await?),
        ReportKind::Occupancy => print_json(&reports.occupancy(range).await?),
        ReportKind::Commissions => print_json(&reports.commissions().await?),
    }
}

async fn run_demo(session: &Session, gateway: &InMemoryGateway) -> Result<()> {
    let properties = session.properties();
    let tasks = session.tasks();

    // Second read of the same list is served from the cache
    let listed = properties.list(Filter::new()).await?;
    properties.list(Filter::new()).await?;
    println!("{} properties", listed.items.len());

    let mut observer = tasks.observe_list(SelectQuery::default()).await?;
    while observer.view()?.loading {
        observer.changed().await;
    }
    println!("{} tasks", observer.view()?.items.len());

    // The new task is visible before the gateway answers
    gateway.set_latency(Duration::from_millis(200));
    let writer = tasks.clone();
    let pending = tokio::spawn(async move {
        writer
            .create(&json!({"title": "Deep clean after checkout", "status": "pending"}))
            .await
    });
    observer.changed().await;
    let view = observer.view()?;
    println!(
        "{} tasks while saving, {} provisional",
        view.items.len(),
        view.provisional_ids.len()
    );
    let created = pending.await??.into_record();
    println!("confirmed task {}", created.task_id);
    gateway.set_latency(Duration::ZERO);

    // A rejected write leaves the list exactly as it was
    gateway.fail_next(GatewayOp::Insert, GatewayError::validation("title is required"));
    let before = observer.view()?.items.len();
    match tasks.create(&json!({"status": "pending"})).await {
        Ok(_) => println!("unexpected: invalid task was accepted"),
        Err(err) => println!(
            "rejected: {} ({} tasks before, {} after)",
            err,
            before,
            observer.view()?.items.len()
        ),
    }

    let mut input = NewProperty::new("Casa del Puerto");
    input.location = Some(NewLocation {
        city: Some("Colonia".to_string()),
        country: Some("Uruguay".to_string()),
        ..NewLocation::default()
    });
    input.amenities = vec!["wifi".to_string(), "parking".to_string()];
    let outcome = properties.create_property(&input).await?;
    println!(
        "created property {} with {} warnings",
        outcome.record().property_id,
        outcome.warnings().len()
    );

    print_json(&session.dashboard().await?)?;

    let stats = session.stats();
    println!(
        "cache: {} hits, {} misses, {} fetches, hit rate {:.0}%",
        stats.hits,
        stats.misses,
        stats.fetches,
        stats.hit_rate() * 100.0
    );
    Ok(())
}
