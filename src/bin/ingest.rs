//! Ingest binary: converts a CSV of patient events into the binary patient
//! database consumed by the featurization engine.
//!
//! ## Input
//!
//! A CSV file with a header row and the columns:
//! - `patient_id` — integer patient id
//! - `time`       — event time, RFC 3339 (`2019-03-01T00:00:00Z`) or raw
//!   epoch microseconds
//! - `code`       — integer event code
//! - `value`      — optional payload: empty for a pure code occurrence, a
//!   number for a measurement, anything else is stored as an opaque text blob
//!
//! Optionally, an ontology JSON file mapping codes to display names
//! (`{"7": "Hypertension", ...}`).
//!
//! ## Output
//!
//! A database directory (`metadata.json` + `patients.bin`); see
//! `PatientDatabase` for the layout.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin ingest -- --csv events.csv --out data/cohort-db
//! cargo run --release --bin ingest -- --csv events.csv --out data/cohort-db \
//!     --ontology codes.json
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::path::PathBuf;

use chrono::DateTime;
use clap::Parser;
use indicatif::{HumanCount, HumanDuration, ProgressBar, ProgressStyle};
use serde::Deserialize;
use tracing::info;

use confluence::common::{DatabaseBuilder, Event, EventCode, EventValue, Ontology, PatientId};

// ============================================================================
// CLI
// ============================================================================

#[derive(Parser, Debug)]
#[command(about = "Convert a CSV of patient events into a binary patient database")]
struct Args {
    /// Path to the input CSV file.
    #[arg(long)]
    csv: PathBuf,

    /// Output database directory (created if missing).
    #[arg(long)]
    out: PathBuf,

    /// Optional ontology JSON file: an object mapping codes to names.
    #[arg(long)]
    ontology: Option<PathBuf>,
}

// ============================================================================
// CSV row schema (serde)
// ============================================================================

#[derive(Debug, Deserialize)]
struct CsvRow {
    patient_id: u64,
    time: String,
    code: u32,
    value: Option<String>,
}

/// Parse an event time: raw epoch microseconds, or RFC 3339.
fn parse_time_us(raw: &str) -> Result<i64, String> {
    if let Ok(us) = raw.parse::<i64>() {
        return Ok(us);
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.timestamp_micros())
        .map_err(|e| format!("'{raw}' is neither epoch microseconds nor RFC 3339: {e}"))
}

/// Classify a CSV value cell: empty → no payload, numeric → measurement,
/// anything else → opaque text.
fn parse_value(raw: Option<String>) -> EventValue {
    match raw {
        None => EventValue::None,
        Some(s) if s.is_empty() => EventValue::None,
        Some(s) => match s.parse::<f32>() {
            Ok(v) => EventValue::Numeric(v),
            Err(_) => EventValue::Text(s),
        },
    }
}

// ============================================================================
// Main
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    info!("Input:  {}", args.csv.display());
    info!("Output: {}", args.out.display());

    let start = std::time::Instant::now();

    // ── Step 1: Load the ontology ─────────────────────────────────────────
    let mut ontology = Ontology::new();
    if let Some(path) = &args.ontology {
        info!("Step 1: Loading ontology from {}...", path.display());
        let names: BTreeMap<u32, String> = serde_json::from_slice(&std::fs::read(path)?)?;
        for (code, name) in names {
            ontology.insert(EventCode(code), name);
        }
        info!("  {} codes named", ontology.len());
    } else {
        info!("Step 1: No ontology file given, codes stay unnamed");
    }

    // ── Step 2: Parse the CSV into events ─────────────────────────────────
    info!("Step 2: Parsing events...");
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("  Ingesting  {spinner} {human_pos} events [{elapsed_precise}]")
            .unwrap(),
    );

    let mut builder = DatabaseBuilder::new();
    let mut patients: HashSet<u64> = HashSet::new();
    let mut reader = csv::Reader::from_reader(File::open(&args.csv)?);
    for (row_idx, row) in reader.deserialize::<CsvRow>().enumerate() {
        let row = row?;
        let time_us = parse_time_us(&row.time)
            .map_err(|e| format!("row {}: bad time: {e}", row_idx + 1))?;
        patients.insert(row.patient_id);
        builder.add_event(
            PatientId(row.patient_id),
            Event {
                time_us,
                code: EventCode(row.code),
                value: parse_value(row.value),
            },
        );
        pb.inc(1);
    }
    pb.finish_and_clear();
    info!(
        "  Parsed {} events for {} patients",
        HumanCount(builder.num_events() as u64),
        HumanCount(patients.len() as u64),
    );

    // ── Step 3: Write the database ────────────────────────────────────────
    info!("Step 3: Writing database...");
    let num_events = builder.num_events();
    builder.write(&args.out, ontology)?;

    info!(
        "Done: {} events → {} in {}",
        HumanCount(num_events as u64),
        args.out.display(),
        HumanDuration(start.elapsed()),
    );
    Ok(())
}
