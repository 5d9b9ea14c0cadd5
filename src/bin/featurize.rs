//! Featurize binary: runs the two-pass featurization engine over a patient
//! database and a labels file, writing the cohort matrix and its parallel
//! vectors.
//!
//! ## Input
//!
//! - `--db-dir` — a patient database directory written by `ingest`
//! - `--labels` — a JSON array of label records:
//!   `[{"patient_id": 1, "time_us": 1551398400000000, "value": 1.0}, ...]`
//!
//! ## Output
//!
//! Written to `--out`:
//! - `matrix.bin`       — CSR feature matrix (see `FeatureMatrix::write_bin`)
//! - `labels.bin`       — `[f32]` target value per row
//! - `patient_ids.bin`  — `[u64]` patient id per row
//! - `label_times.bin`  — `[i64]` label time (epoch µs) per row
//! - `column_names.txt` — one human-readable column name per line
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin featurize -- \
//!     --db-dir data/cohort-db --labels labels.json --out data/features \
//!     --num-workers 8 --top-k 500 --demographics 1001,1002
//! ```

use std::path::PathBuf;

use clap::Parser;
use indicatif::{HumanCount, HumanDuration};
use tracing::info;

use confluence::common::{EventCode, LabelRecord, LabeledPatients};
use confluence::engine::FeaturizerList;
use confluence::featurizer::{
    AgeFeaturizer, CountFeaturizer, DemographicsFeaturizer, Featurizer,
};

// ============================================================================
// CLI
// ============================================================================

#[derive(Parser, Debug)]
#[command(about = "Featurize a labeled patient cohort into a sparse matrix")]
struct Args {
    /// Patient database directory (written by the ingest binary).
    #[arg(long)]
    db_dir: PathBuf,

    /// JSON file with the label records.
    #[arg(long)]
    labels: PathBuf,

    /// Output directory for the matrix and parallel vectors.
    #[arg(long)]
    out: PathBuf,

    /// Worker count for both passes (1 = sequential).
    #[arg(long, default_value_t = 1)]
    num_workers: usize,

    /// Vocabulary size of the code-count featurizer.
    #[arg(long, default_value_t = 100)]
    top_k: usize,

    /// Comma-separated demographic codes to one-hot encode (optional).
    #[arg(long, value_delimiter = ',')]
    demographics: Vec<u32>,
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

    info!("Database: {}", args.db_dir.display());
    info!("Labels:   {}", args.labels.display());
    info!("Output:   {}", args.out.display());

    let pipeline_start = std::time::Instant::now();

    // ── Step 1: Load labels ───────────────────────────────────────────────
    info!("Step 1: Loading labels...");
    let records: Vec<LabelRecord> = serde_json::from_slice(&std::fs::read(&args.labels)?)?;
    let labels = LabeledPatients::from_records(records);
    info!(
        "  {} labels across {} patients",
        HumanCount(labels.num_labels() as u64),
        HumanCount(labels.num_patients() as u64),
    );

    // ── Step 2: Preprocess featurizers ────────────────────────────────────
    info!(
        "Step 2: Preprocessing featurizers ({} workers)...",
        args.num_workers
    );
    let mut featurizers: Vec<Box<dyn Featurizer>> = vec![
        Box::new(AgeFeaturizer::new()),
        Box::new(CountFeaturizer::new(args.top_k)),
    ];
    if !args.demographics.is_empty() {
        featurizers.push(Box::new(DemographicsFeaturizer::new(
            args.demographics.iter().copied().map(EventCode),
        )));
    }
    let mut list = FeaturizerList::new(featurizers);

    let preprocess_start = std::time::Instant::now();
    list.preprocess_featurizers(&labels, &args.db_dir, args.num_workers)?;
    info!(
        "  {} columns after preprocessing [{}]",
        list.num_columns(),
        HumanDuration(preprocess_start.elapsed()),
    );

    // ── Step 3: Featurize ─────────────────────────────────────────────────
    info!("Step 3: Featurizing ({} workers)...", args.num_workers);
    let featurize_start = std::time::Instant::now();
    let cohort = list.featurize(&labels, &args.db_dir, args.num_workers)?;
    info!(
        "  {} rows × {} columns, {} nonzeros [{}]",
        HumanCount(cohort.num_rows() as u64),
        cohort.matrix.num_cols(),
        HumanCount(cohort.matrix.nnz() as u64),
        HumanDuration(featurize_start.elapsed()),
    );

    // ── Step 4: Write artifacts ───────────────────────────────────────────
    info!("Step 4: Writing artifacts...");
    cohort.write(&args.out)?;

    let names: Vec<String> = (0..list.num_columns())
        .map(|column| list.column_name(column))
        .collect();
    std::fs::write(args.out.join("column_names.txt"), names.join("\n") + "\n")?;

    info!(
        "Done: {} rows → {} in {}",
        HumanCount(cohort.num_rows() as u64),
        args.out.display(),
        HumanDuration(pipeline_start.elapsed()),
    );
    Ok(())
}
