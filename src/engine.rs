//! The featurization engine: applies an ordered list of featurizers across a
//! labeled patient population, in parallel over patient-id shards, producing
//! one CSR feature matrix aligned with per-label target/id/time vectors.
//!
//! Two passes share the same deterministic partitioning:
//!
//! - **preprocess** — per-shard featurizer replicas accumulate statistics,
//!   which cross the worker boundary as opaque snapshots and are merged into
//!   the canonical featurizers before a single finalize step.
//! - **featurize** — workers build shard-local CSR row blocks in ascending
//!   patient-id order; an ordered gather concatenates them in shard order, so
//!   global row order is ascending by patient id regardless of which worker
//!   finishes first.
//!
//! Every worker with a non-empty shard opens its own read-only database
//! handle; empty shards never touch the filesystem. A single worker failure
//! aborts the whole pass; there is no partial-result recovery and no retry.

use std::path::Path;

use serde_json::Value;
use tracing::{debug, info};

use crate::common::{
    f32_as_bytes, i64_as_bytes, u64_as_bytes, FeatureMatrix, LabeledPatients, PatientDatabase,
    PatientId,
};
use crate::featurizer::{ColumnValue, FeaturizeError, Featurizer};

// ============================================================================
// Featurized Cohort
// ============================================================================

/// The output of one featurize pass: a CSR feature matrix plus three parallel
/// vectors, all row-aligned (row `i` is label `i` of the cohort, rows ordered
/// by ascending patient id, then label time).
#[derive(Debug, Clone, PartialEq)]
pub struct FeaturizedCohort {
    pub matrix: FeatureMatrix,
    /// Target value per row.
    pub labels: Vec<f32>,
    /// Patient id per row.
    pub patient_ids: Vec<u64>,
    /// Label time (epoch microseconds) per row.
    pub label_times_us: Vec<i64>,
}

impl FeaturizedCohort {
    /// Concatenate shard blocks in shard order.
    fn concat(blocks: Vec<FeaturizedCohort>) -> Self {
        let mut labels = Vec::new();
        let mut patient_ids = Vec::new();
        let mut label_times_us = Vec::new();
        let mut matrices = Vec::with_capacity(blocks.len());
        for block in blocks {
            labels.extend_from_slice(&block.labels);
            patient_ids.extend_from_slice(&block.patient_ids);
            label_times_us.extend_from_slice(&block.label_times_us);
            matrices.push(block.matrix);
        }
        Self {
            matrix: FeatureMatrix::concat_rows(matrices),
            labels,
            patient_ids,
            label_times_us,
        }
    }

    /// Number of rows (= labels across the cohort).
    pub fn num_rows(&self) -> usize {
        self.matrix.num_rows()
    }

    /// Write the cohort to a directory (created if missing).
    ///
    /// ## Directory layout
    ///
    /// ```text
    /// out_dir/
    ///   matrix.bin       — CSR matrix (see FeatureMatrix::write_bin)
    ///   labels.bin       — [f32; num_rows] target values
    ///   patient_ids.bin  — [u64; num_rows] patient id per row
    ///   label_times.bin  — [i64; num_rows] label time (epoch µs) per row
    /// ```
    pub fn write(&self, out_dir: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(out_dir)?;
        self.matrix.write_bin(&out_dir.join("matrix.bin"))?;
        std::fs::write(out_dir.join("labels.bin"), f32_as_bytes(&self.labels))?;
        std::fs::write(
            out_dir.join("patient_ids.bin"),
            u64_as_bytes(&self.patient_ids),
        )?;
        std::fs::write(
            out_dir.join("label_times.bin"),
            i64_as_bytes(&self.label_times_us),
        )?;
        Ok(())
    }
}

// ============================================================================
// Shard Partitioning
// ============================================================================

/// Split sorted patient ids into `num_shards` contiguous, near-equal shards.
///
/// The first `n % num_shards` shards take one extra id, so shard sizes differ
/// by at most 1. Deterministic for a given input and shard count; shards are
/// contiguous, so concatenating per-shard outputs in shard order preserves
/// the global ascending-id order.
fn partition_ids(ids: &[PatientId], num_shards: usize) -> Vec<&[PatientId]> {
    assert!(num_shards > 0, "cannot partition into zero shards");
    let base = ids.len() / num_shards;
    let remainder = ids.len() % num_shards;

    let mut shards = Vec::with_capacity(num_shards);
    let mut start = 0;
    for shard_idx in 0..num_shards {
        let len = base + usize::from(shard_idx < remainder);
        shards.push(&ids[start..start + len]);
        start += len;
    }
    shards
}

// ============================================================================
// Shard Workers
// ============================================================================

/// Preprocessing worker: accumulate shard-local statistics into a cloned
/// featurizer list, returning one snapshot per featurizer.
///
/// Shards only carry labeled patient ids, so a non-empty shard always needs
/// the database; empty shards never open it.
fn preprocess_shard(
    db_dir: &Path,
    shard: &[PatientId],
    labels: &LabeledPatients,
    mut featurizers: Vec<Box<dyn Featurizer>>,
) -> Result<Vec<Value>, FeaturizeError> {
    if shard.is_empty() {
        return Ok(featurizers.iter().map(|f| f.snapshot()).collect());
    }
    let db = PatientDatabase::open(db_dir)?;

    for &pid in shard {
        let patient_labels = labels.labels_for(pid);
        if patient_labels.is_empty() {
            continue;
        }
        let patient = db.patient(pid)?;
        for featurizer in &mut featurizers {
            if featurizer.needs_preprocessing() {
                featurizer.preprocess(&patient, patient_labels);
            }
        }
    }

    Ok(featurizers.iter().map(|f| f.snapshot()).collect())
}

/// Featurization worker: build the shard's CSR row block and parallel
/// vectors, in ascending patient-id order.
///
/// # Panics
/// Panics on featurizer contract violations (wrong row count, out-of-range
/// column index), naming the offending featurizer and patient.
fn featurize_shard(
    db_dir: &Path,
    shard: &[PatientId],
    labels: &LabeledPatients,
    featurizers: &[Box<dyn Featurizer>],
    column_starts: &[usize],
) -> Result<FeaturizedCohort, FeaturizeError> {
    let total_columns = *column_starts.last().unwrap_or(&0);

    let mut values: Vec<f32> = Vec::new();
    let mut col_indices: Vec<i32> = Vec::new();
    let mut row_offsets: Vec<i32> = vec![0];
    let mut result_labels: Vec<f32> = Vec::new();
    let mut patient_ids: Vec<u64> = Vec::new();
    let mut label_times_us: Vec<i64> = Vec::new();

    if shard.is_empty() {
        return Ok(FeaturizedCohort {
            matrix: FeatureMatrix::empty(total_columns),
            labels: result_labels,
            patient_ids,
            label_times_us,
        });
    }
    let db = PatientDatabase::open(db_dir)?;
    let ontology = db.ontology();

    for &pid in shard {
        let patient_labels = labels.labels_for(pid);
        if patient_labels.is_empty() {
            continue;
        }
        let patient = db.patient(pid)?;

        let columns_by_featurizer: Vec<Vec<Vec<ColumnValue>>> = featurizers
            .iter()
            .map(|featurizer| {
                let rows = featurizer.featurize(&patient, patient_labels, ontology);
                assert_eq!(
                    rows.len(),
                    patient_labels.len(),
                    "featurizer '{}' returned {} rows for patient {pid}, expected {}",
                    featurizer.name(),
                    rows.len(),
                    patient_labels.len(),
                );
                rows
            })
            .collect();

        for (label_idx, label) in patient_labels.iter().enumerate() {
            result_labels.push(label.value);
            patient_ids.push(pid.0);
            label_times_us.push(label.time_us);

            for (featurizer_idx, rows) in columns_by_featurizer.iter().enumerate() {
                let featurizer = &featurizers[featurizer_idx];
                let width = column_starts[featurizer_idx + 1] - column_starts[featurizer_idx];
                for cv in &rows[label_idx] {
                    assert!(
                        cv.column < width,
                        "featurizer '{}' emitted out-of-range column {} for patient {pid} \
                         (must be below {width})",
                        featurizer.name(),
                        cv.column,
                    );
                    col_indices.push((column_starts[featurizer_idx] + cv.column) as i32);
                    values.push(cv.value);
                }
            }
            row_offsets.push(col_indices.len() as i32);
        }
    }

    let num_rows = result_labels.len();
    Ok(FeaturizedCohort {
        matrix: FeatureMatrix::from_parts(num_rows, total_columns, values, col_indices, row_offsets),
        labels: result_labels,
        patient_ids,
        label_times_us,
    })
}

/// Dispatch one closure per shard on a scoped worker pool and gather the
/// results **by shard index** (ordered gather), not completion order.
///
/// Worker panics (featurizer contract violations) propagate when the scope
/// joins; worker errors are returned with their shard index attached.
fn run_sharded<T, F>(shards: &[&[PatientId]], worker: F) -> Result<Vec<T>, FeaturizeError>
where
    T: Send,
    F: Fn(usize, &[PatientId]) -> Result<T, FeaturizeError> + Send + Sync,
{
    let gathered: Vec<Option<Result<T, FeaturizeError>>> = std::thread::scope(|scope| {
        let (tx, rx) = crossbeam::channel::bounded(shards.len());

        for (shard_idx, &shard) in shards.iter().enumerate() {
            let tx = tx.clone();
            let worker = &worker;
            let handle = std::thread::Builder::new()
                .name(format!("shard-worker-{shard_idx}"))
                .spawn_scoped(scope, move || {
                    let result = worker(shard_idx, shard);
                    // Receiver outlives the scope; a send only fails if the
                    // gather loop bailed out after another worker panicked.
                    let _ = tx.send((shard_idx, result));
                });
            if let Err(e) = handle {
                return Err(FeaturizeError::Io(e));
            }
        }
        drop(tx);

        let mut slots: Vec<Option<Result<T, FeaturizeError>>> =
            (0..shards.len()).map(|_| None).collect();
        for _ in 0..shards.len() {
            match rx.recv() {
                Ok((shard_idx, result)) => slots[shard_idx] = Some(result),
                // A worker died without reporting: leave the scope so its
                // panic resumes on this thread.
                Err(_) => break,
            }
        }
        Ok(slots)
    })?;

    let mut results = Vec::with_capacity(gathered.len());
    for (shard_idx, slot) in gathered.into_iter().enumerate() {
        match slot {
            Some(Ok(value)) => results.push(value),
            Some(Err(source)) => {
                return Err(FeaturizeError::Worker {
                    shard: shard_idx,
                    source: Box::new(source),
                });
            }
            None => unreachable!("worker for shard {shard_idx} neither reported nor panicked"),
        }
    }
    Ok(results)
}

// ============================================================================
// Featurizer List
// ============================================================================

/// An ordered, fixed list of featurizers and the engine that drives them.
///
/// The global column space is the concatenation of each featurizer's column
/// range in list order; the same offsets govern featurization and
/// [`column_name`](Self::column_name) lookup.
pub struct FeaturizerList {
    featurizers: Vec<Box<dyn Featurizer>>,
}

impl FeaturizerList {
    pub fn new(featurizers: Vec<Box<dyn Featurizer>>) -> Self {
        Self { featurizers }
    }

    /// Cumulative column starts: entry `i` is the global offset of featurizer
    /// `i`, entry `len` the total column count.
    ///
    /// # Panics
    /// May panic if a stateful featurizer has not finished preprocessing.
    fn column_starts(&self) -> Vec<usize> {
        let mut starts = Vec::with_capacity(self.featurizers.len() + 1);
        let mut offset = 0;
        starts.push(0);
        for featurizer in &self.featurizers {
            offset += featurizer.num_columns();
            starts.push(offset);
        }
        starts
    }

    /// Total number of columns across all featurizers.
    pub fn num_columns(&self) -> usize {
        self.featurizers.iter().map(|f| f.num_columns()).sum()
    }

    /// Reverse-map a global column index to "featurizer: local column name".
    ///
    /// # Panics
    /// Panics if `global` is outside the total column range. This cannot
    /// happen for any index produced by [`featurize`](Self::featurize).
    pub fn column_name(&self, global: usize) -> String {
        let starts = self.column_starts();
        let total = *starts.last().unwrap_or(&0);
        assert!(
            global < total,
            "column index {global} out of range (total columns {total})"
        );
        // Last featurizer whose start is <= global; zero-width featurizers
        // own no index and are skipped by the cumulative-start search.
        let idx = starts.partition_point(|&start| start <= global) - 1;
        let featurizer = &self.featurizers[idx];
        format!(
            "{}: {}",
            featurizer.name(),
            featurizer.column_name(global - starts[idx])
        )
    }

    fn check_config(&self, num_workers: usize) -> Result<(), FeaturizeError> {
        if self.featurizers.is_empty() {
            return Err(FeaturizeError::Config(
                "featurizer list is empty".to_string(),
            ));
        }
        if num_workers == 0 {
            return Err(FeaturizeError::Config(
                "worker count must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Run the preprocessing pass: accumulate statistics for every stateful
    /// featurizer across the labeled population, merge per-shard snapshots
    /// into the canonical instances, and finalize every featurizer.
    ///
    /// A no-op (the database is never opened) when no featurizer needs
    /// preprocessing. Any shard failure aborts the pass: downstream
    /// normalization depends on whole-population statistics, so partial
    /// results are not usable.
    pub fn preprocess_featurizers(
        &mut self,
        labels: &LabeledPatients,
        db_dir: &Path,
        num_workers: usize,
    ) -> Result<(), FeaturizeError> {
        self.check_config(num_workers)?;

        if !self.featurizers.iter().any(|f| f.needs_preprocessing()) {
            debug!("no featurizer needs preprocessing, skipping pass");
            return Ok(());
        }

        let pids = labels.patient_ids();
        info!(
            patients = pids.len(),
            num_workers, "preprocessing featurizers"
        );

        let shard_snapshots: Vec<Vec<Value>> = if num_workers == 1 {
            vec![preprocess_shard(
                db_dir,
                &pids,
                labels,
                self.featurizers.clone(),
            )
            .map_err(|source| FeaturizeError::Worker {
                shard: 0,
                source: Box::new(source),
            })?]
        } else {
            let shards = partition_ids(&pids, num_workers);
            run_sharded(&shards, |shard_idx, shard| {
                debug!(shard_idx, patients = shard.len(), "preprocessing shard");
                preprocess_shard(db_dir, shard, labels, self.featurizers.clone())
            })?
        };

        // Merge per-shard statistics into the canonical instances. The merge
        // runs single-threaded after all workers finish, and each featurizer's
        // absorb is invariant to snapshot order and shard count.
        for (idx, featurizer) in self.featurizers.iter_mut().enumerate() {
            if featurizer.needs_preprocessing() {
                let peers: Vec<Value> = shard_snapshots
                    .iter()
                    .map(|snapshots| snapshots[idx].clone())
                    .collect();
                featurizer.absorb(&peers)?;
            }
        }
        for featurizer in &mut self.featurizers {
            featurizer.finalize_preprocessing()?;
        }

        info!("preprocessing complete");
        Ok(())
    }

    /// Run the featurization pass, producing the cohort matrix and its
    /// parallel label/id/time vectors.
    ///
    /// Rows are ordered by ascending patient id (then label time within a
    /// patient) for every worker count: the partition is order-preserving and
    /// shard blocks are concatenated in shard order, so the result is
    /// invariant to `num_workers`.
    pub fn featurize(
        &self,
        labels: &LabeledPatients,
        db_dir: &Path,
        num_workers: usize,
    ) -> Result<FeaturizedCohort, FeaturizeError> {
        self.check_config(num_workers)?;

        let pids = labels.patient_ids();
        let column_starts = self.column_starts();
        info!(
            patients = pids.len(),
            labels = labels.num_labels(),
            columns = *column_starts.last().unwrap_or(&0),
            num_workers,
            "featurizing cohort"
        );

        let blocks: Vec<FeaturizedCohort> = if num_workers == 1 {
            vec![
                featurize_shard(db_dir, &pids, labels, &self.featurizers, &column_starts)
                    .map_err(|source| FeaturizeError::Worker {
                        shard: 0,
                        source: Box::new(source),
                    })?,
            ]
        } else {
            let shards = partition_ids(&pids, num_workers);
            run_sharded(&shards, |shard_idx, shard| {
                debug!(shard_idx, patients = shard.len(), "featurizing shard");
                featurize_shard(db_dir, shard, labels, &self.featurizers, &column_starts)
            })?
        };

        let cohort = FeaturizedCohort::concat(blocks);

        info!(
            rows = cohort.num_rows(),
            nnz = cohort.matrix.nnz(),
            "featurization complete"
        );
        Ok(cohort)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{
        DatabaseBuilder, Event, EventCode, EventValue, Label, LabelRecord, Ontology, Patient,
    };
    use crate::featurizer::{AgeFeaturizer, CountFeaturizer, DemographicsFeaturizer};
    use rand::prelude::*;
    use rand::rngs::SmallRng;
    use std::path::PathBuf;

    const YEAR_US: i64 = 31_557_600_000_000;

    /// Fixed-width featurizer emitting `[(0, age_years), (1, 1.0)]` per label.
    #[derive(Clone)]
    struct AgePlusBias;

    impl Featurizer for AgePlusBias {
        fn name(&self) -> &'static str {
            "age-plus-bias"
        }
        fn num_columns(&self) -> usize {
            2
        }
        fn featurize(
            &self,
            patient: &Patient,
            labels: &[Label],
            _ontology: &Ontology,
        ) -> Vec<Vec<ColumnValue>> {
            let birth = patient.birth_time_us().unwrap_or(0);
            labels
                .iter()
                .map(|label| {
                    let age_years = ((label.time_us - birth) / YEAR_US) as f32;
                    vec![ColumnValue::new(0, age_years), ColumnValue::new(1, 1.0)]
                })
                .collect()
        }
        fn boxed_clone(&self) -> Box<dyn Featurizer> {
            Box::new(self.clone())
        }
    }

    /// One-hot presence of codes 1..=3 over the whole history (3 columns).
    #[derive(Clone)]
    struct CodePresence;

    impl Featurizer for CodePresence {
        fn name(&self) -> &'static str {
            "code-presence"
        }
        fn num_columns(&self) -> usize {
            3
        }
        fn featurize(
            &self,
            patient: &Patient,
            labels: &[Label],
            _ontology: &Ontology,
        ) -> Vec<Vec<ColumnValue>> {
            let mut row = Vec::new();
            for column in 0..3u32 {
                if patient.events.iter().any(|e| e.code == EventCode(column + 1)) {
                    row.push(ColumnValue::new(column as usize, 1.0));
                }
            }
            vec![row; labels.len()]
        }
        fn boxed_clone(&self) -> Box<dyn Featurizer> {
            Box::new(self.clone())
        }
    }

    /// Emits a column index equal to its declared width: always out of range.
    #[derive(Clone)]
    struct Misbehaving;

    impl Featurizer for Misbehaving {
        fn name(&self) -> &'static str {
            "misbehaving"
        }
        fn num_columns(&self) -> usize {
            2
        }
        fn featurize(
            &self,
            _patient: &Patient,
            labels: &[Label],
            _ontology: &Ontology,
        ) -> Vec<Vec<ColumnValue>> {
            vec![vec![ColumnValue::new(2, 1.0)]; labels.len()]
        }
        fn boxed_clone(&self) -> Box<dyn Featurizer> {
            Box::new(self.clone())
        }
    }

    fn code_event(time_us: i64, code: u32) -> Event {
        Event {
            time_us,
            code: EventCode(code),
            value: EventValue::None,
        }
    }

    /// Three patients born at t=0 with one label each at ages 10/20/30 and
    /// code histories {1}, {2}, {1, 3}.
    fn small_fixture(dir: &Path) -> (PathBuf, LabeledPatients) {
        let db_dir = dir.join("db");
        let mut builder = DatabaseBuilder::new();
        for (pid, codes) in [(1u64, vec![1u32]), (2, vec![2]), (3, vec![1, 3])] {
            builder.add_event(PatientId(pid), code_event(0, 100));
            for (i, code) in codes.into_iter().enumerate() {
                builder.add_event(PatientId(pid), code_event((i as i64 + 1) * YEAR_US, code));
            }
        }
        builder.write(&db_dir, Ontology::new()).unwrap();

        let labels = LabeledPatients::from_records([
            LabelRecord {
                patient_id: PatientId(1),
                time_us: 10 * YEAR_US,
                value: 0.0,
            },
            LabelRecord {
                patient_id: PatientId(2),
                time_us: 20 * YEAR_US,
                value: 1.0,
            },
            LabelRecord {
                patient_id: PatientId(3),
                time_us: 30 * YEAR_US,
                value: 1.0,
            },
        ]);
        (db_dir, labels)
    }

    /// A larger synthetic population with a seeded RNG: `n` patients, random
    /// birth years, 1–3 labels each, and random code histories.
    fn synthetic_fixture(dir: &Path, n: u64) -> (PathBuf, LabeledPatients) {
        let mut rng = SmallRng::seed_from_u64(42);
        let db_dir = dir.join("db");
        let mut builder = DatabaseBuilder::new();
        let mut records = Vec::new();

        for pid in 0..n {
            let birth = rng.random_range(0..40) * YEAR_US;
            builder.add_event(PatientId(pid), code_event(birth, 100));
            for _ in 0..rng.random_range(2..12) {
                let offset = rng.random_range(1..30 * YEAR_US);
                let code = rng.random_range(1..8u32);
                builder.add_event(PatientId(pid), code_event(birth + offset, code));
            }
            for _ in 0..rng.random_range(1..4) {
                records.push(LabelRecord {
                    patient_id: PatientId(pid),
                    time_us: birth + rng.random_range(YEAR_US..35 * YEAR_US),
                    value: if rng.random_bool(0.3) { 1.0 } else { 0.0 },
                });
            }
        }

        builder.write(&db_dir, Ontology::new()).unwrap();
        (db_dir, LabeledPatients::from_records(records))
    }

    fn stateful_list() -> FeaturizerList {
        FeaturizerList::new(vec![
            Box::new(AgeFeaturizer::new()),
            Box::new(CountFeaturizer::new(4)),
            Box::new(DemographicsFeaturizer::new([EventCode(100)])),
        ])
    }

    #[test]
    fn partition_is_near_equal_and_order_preserving() {
        let ids: Vec<PatientId> = (0..10).map(PatientId).collect();
        let shards = partition_ids(&ids, 3);
        assert_eq!(shards.len(), 3);
        assert_eq!(
            shards.iter().map(|s| s.len()).collect::<Vec<_>>(),
            vec![4, 3, 3]
        );
        let rejoined: Vec<PatientId> = shards.concat();
        assert_eq!(rejoined, ids);

        // More shards than ids: tail shards are empty, nothing is lost.
        let shards = partition_ids(&ids[..2], 5);
        assert_eq!(shards.iter().map(|s| s.len()).sum::<usize>(), 2);
    }

    #[test]
    fn featurizer_columns_concatenate_in_list_order() {
        let dir = tempfile::tempdir().unwrap();
        let (db_dir, labels) = small_fixture(dir.path());

        let list = FeaturizerList::new(vec![Box::new(AgePlusBias), Box::new(CodePresence)]);
        assert_eq!(list.num_columns(), 5);

        let cohort = list.featurize(&labels, &db_dir, 1).unwrap();
        assert_eq!(cohort.matrix.num_rows(), 3);
        assert_eq!(cohort.matrix.num_cols(), 5);
        assert_eq!(cohort.patient_ids, vec![1, 2, 3]);
        assert_eq!(cohort.labels, vec![0.0, 1.0, 1.0]);
        assert_eq!(
            cohort.label_times_us,
            vec![10 * YEAR_US, 20 * YEAR_US, 30 * YEAR_US]
        );

        // Row 0: age 10 + bias at offset 0, code 1 present at offset 2.
        assert_eq!(cohort.matrix.row(0), (&[0, 1, 2][..], &[10.0, 1.0, 1.0][..]));
        // Row 1: age 20 + bias, code 2 → global column 3.
        assert_eq!(cohort.matrix.row(1), (&[0, 1, 3][..], &[20.0, 1.0, 1.0][..]));
        // Row 2: age 30 + bias, codes 1 and 3 → global columns 2 and 4.
        assert_eq!(
            cohort.matrix.row(2),
            (&[0, 1, 2, 4][..], &[30.0, 1.0, 1.0, 1.0][..])
        );
    }

    #[test]
    fn featurize_is_worker_count_invariant() {
        let dir = tempfile::tempdir().unwrap();
        let (db_dir, labels) = synthetic_fixture(dir.path(), 37);

        let mut list = stateful_list();
        list.preprocess_featurizers(&labels, &db_dir, 2).unwrap();

        let sequential = list.featurize(&labels, &db_dir, 1).unwrap();
        for num_workers in [2, 3, 8] {
            let parallel = list.featurize(&labels, &db_dir, num_workers).unwrap();
            assert_eq!(sequential, parallel, "worker count {num_workers}");
        }

        // Rows are ascending by patient id.
        assert!(sequential.patient_ids.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(sequential.num_rows(), labels.num_labels());
    }

    #[test]
    fn preprocessing_is_shard_invariant() {
        let dir = tempfile::tempdir().unwrap();
        let (db_dir, labels) = synthetic_fixture(dir.path(), 23);

        let mut single = stateful_list();
        single.preprocess_featurizers(&labels, &db_dir, 1).unwrap();
        let mut sharded = stateful_list();
        sharded.preprocess_featurizers(&labels, &db_dir, 5).unwrap();

        // Same vocabulary and column space either way.
        assert_eq!(single.num_columns(), sharded.num_columns());
        for column in 0..single.num_columns() {
            assert_eq!(single.column_name(column), sharded.column_name(column));
        }

        // Featurized outputs agree structurally; continuous statistics agree
        // within float tolerance, so values are compared approximately.
        let a = single.featurize(&labels, &db_dir, 1).unwrap();
        let b = sharded.featurize(&labels, &db_dir, 1).unwrap();
        assert_eq!(a.matrix.row_offsets, b.matrix.row_offsets);
        assert_eq!(a.matrix.col_indices, b.matrix.col_indices);
        for (x, y) in a.matrix.values.iter().zip(&b.matrix.values) {
            assert!((x - y).abs() < 1e-5, "{x} vs {y}");
        }
    }

    #[test]
    fn column_names_cover_exactly_the_column_space() {
        let dir = tempfile::tempdir().unwrap();
        let (db_dir, labels) = small_fixture(dir.path());

        let mut list = stateful_list();
        list.preprocess_featurizers(&labels, &db_dir, 2).unwrap();

        let total = list.num_columns();
        assert!(total > 0);
        for column in 0..total {
            let name = list.column_name(column);
            assert!(!name.is_empty());
        }
        assert!(list.column_name(0).starts_with("age:"));
        assert!(list.column_name(1).starts_with("count:"));
        assert!(list.column_name(total - 1).starts_with("demographics:"));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn column_name_rejects_out_of_range_index() {
        let list = FeaturizerList::new(vec![Box::new(AgePlusBias)]);
        list.column_name(2);
    }

    #[test]
    fn preprocessing_skips_without_touching_the_database() {
        let labels = LabeledPatients::from_records([LabelRecord {
            patient_id: PatientId(1),
            time_us: 0,
            value: 1.0,
        }]);
        let mut list = FeaturizerList::new(vec![Box::new(DemographicsFeaturizer::new([
            EventCode(100),
        ]))]);

        // The path does not exist: the pass must succeed without opening it.
        let missing = Path::new("/nonexistent/featurization-db");
        list.preprocess_featurizers(&labels, missing, 4).unwrap();
        assert_eq!(list.num_columns(), 1);
    }

    #[test]
    fn config_errors_are_rejected_before_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let (db_dir, labels) = small_fixture(dir.path());

        let mut empty = FeaturizerList::new(Vec::new());
        assert!(matches!(
            empty.preprocess_featurizers(&labels, &db_dir, 1),
            Err(FeaturizeError::Config(_))
        ));

        let list = FeaturizerList::new(vec![Box::new(AgePlusBias)]);
        assert!(matches!(
            list.featurize(&labels, &db_dir, 0),
            Err(FeaturizeError::Config(_))
        ));
    }

    #[test]
    fn worker_database_failure_aborts_the_pass() {
        let labels = LabeledPatients::from_records([LabelRecord {
            patient_id: PatientId(1),
            time_us: 0,
            value: 1.0,
        }]);
        let list = FeaturizerList::new(vec![Box::new(AgePlusBias)]);

        let missing = Path::new("/nonexistent/featurization-db");
        assert!(matches!(
            list.featurize(&labels, missing, 2),
            Err(FeaturizeError::Worker { .. })
        ));
    }

    #[test]
    #[should_panic(expected = "out-of-range column")]
    fn out_of_range_column_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (db_dir, labels) = small_fixture(dir.path());

        let list = FeaturizerList::new(vec![Box::new(Misbehaving)]);
        let _ = list.featurize(&labels, &db_dir, 1);
    }

    #[test]
    fn cohort_write_produces_all_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let (db_dir, labels) = small_fixture(dir.path());

        let list = FeaturizerList::new(vec![Box::new(AgePlusBias), Box::new(CodePresence)]);
        let cohort = list.featurize(&labels, &db_dir, 2).unwrap();

        let out_dir = dir.path().join("out");
        cohort.write(&out_dir).unwrap();
        for file in ["matrix.bin", "labels.bin", "patient_ids.bin", "label_times.bin"] {
            assert!(out_dir.join(file).exists(), "{file} missing");
        }
        let ids_bytes = std::fs::read(out_dir.join("patient_ids.bin")).unwrap();
        assert_eq!(ids_bytes.len(), cohort.num_rows() * 8);
    }
}
