//! Monthly webhook delivery report.
//!
//! Reads the consumer's state database (read-only, safe while a consumer runs)
//! and prints how many webhook events each resource received in a month,
//! alongside the resource's resync counter.
//!
//! # Usage
//!
//! ```bash
//! # Current month
//! webhook-stats --state ./data/state
//!
//! # A past month
//! webhook-stats --state ./data/state --year 2016 --month 3
//!
//! # One JSON object per resource, for scripting
//! webhook-stats --json
//! ```

use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use clap::Parser;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use wft_consumer::StateDb;

/// Monthly webhook delivery report.
#[derive(Parser, Debug)]
#[command(name = "webhook-stats")]
#[command(about = "Print per-resource webhook deliveries for a month")]
#[command(version)]
struct Args {
    /// Path to the consumer state database
    #[arg(long, short, env = "WFT_STATE_PATH", default_value = "./data/state")]
    state: PathBuf,

    /// Year to report (defaults to the current year)
    #[arg(long)]
    year: Option<i32>,

    /// Month to report, 1-12 (defaults to the current month)
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=12))]
    month: Option<u32>,

    /// Emit JSON lines instead of a table
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct Row<'a> {
    year: i32,
    month: u32,
    resource: &'a str,
    deliveries: u64,
    counter: Option<u64>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let today = Utc::now().date_naive();
    let year = args.year.unwrap_or(today.year());
    let month = args.month.unwrap_or(today.month());

    let db = StateDb::open_read_only(&args.state)
        .with_context(|| format!("Failed to open state at {:?}", args.state))?;

    let mut deliveries = db
        .deliveries_for_period(year, month)
        .context("Failed to read delivery tallies")?;
    let counters: HashMap<String, u64> = db
        .counters()
        .context("Failed to read resource counters")?
        .into_iter()
        .collect();

    deliveries.sort_by(|(a_id, a), (b_id, b)| a.cmp(b).then_with(|| a_id.cmp(b_id)));

    if args.json {
        for (resource, count) in &deliveries {
            let row = Row {
                year,
                month,
                resource,
                deliveries: *count,
                counter: counters.get(resource).copied(),
            };
            println!("{}", serde_json::to_string(&row)?);
        }
        return Ok(());
    }

    println!("{:>7} {:>32} {:>7} {:>9}", "month", "resource", "WH", "counter");
    for (resource, count) in &deliveries {
        let counter = counters
            .get(resource)
            .map_or_else(|| "-".to_string(), u64::to_string);
        println!("{:>2}/{} {:>32} {:>7} {:>9}", month, year, resource, count, counter);
    }

    let total: u64 = deliveries.iter().map(|(_, c)| c).sum();
    println!();
    println!("{} resources, {} webhook events", deliveries.len(), total);

    Ok(())
}
