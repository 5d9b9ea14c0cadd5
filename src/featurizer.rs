//! The featurizer contract and its concrete implementations.
//!
//! A featurizer maps one patient and its labels to per-label sparse feature
//! columns. Stateful featurizers accumulate statistics during a preprocessing
//! pass; per-shard replicas transfer their state back to the canonical
//! instance as opaque [snapshots](Featurizer::snapshot), which the canonical
//! instance [absorbs](Featurizer::absorb) and finalizes. See
//! `engine::FeaturizerList` for the orchestration of both passes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::{DatabaseError, EventCode, Label, Ontology, Patient};

/// Microseconds per (Julian) year, for converting event-time deltas to ages.
const MICROS_PER_YEAR: f64 = 365.25 * 24.0 * 60.0 * 60.0 * 1_000_000.0;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum FeaturizeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("featurizer '{featurizer}' received a malformed snapshot: {source}")]
    Snapshot {
        featurizer: &'static str,
        source: serde_json::Error,
    },

    #[error("featurizer '{featurizer}' observed insufficient data during preprocessing")]
    InsufficientData { featurizer: &'static str },

    #[error("featurizer '{featurizer}' was finalized twice")]
    AlreadyFinalized { featurizer: &'static str },

    #[error("worker for shard {shard} failed: {source}")]
    Worker {
        shard: usize,
        source: Box<FeaturizeError>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Column Values
// ============================================================================

/// One sparse contribution to a label's feature row.
///
/// `column` is local to the emitting featurizer (0-based, strictly below its
/// `num_columns()`); the engine shifts it into the global column space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColumnValue {
    pub column: usize,
    pub value: f32,
}

impl ColumnValue {
    pub fn new(column: usize, value: f32) -> Self {
        Self { column, value }
    }
}

// ============================================================================
// Featurizer Contract
// ============================================================================

/// A pluggable transform from (patient, labels) to per-label sparse columns.
///
/// ## Lifecycle
///
/// Stateful featurizers (`needs_preprocessing() == true`) pass through
/// UNINITIALIZED → PREPROCESSING → MERGED → FINALIZED: per-shard clones
/// accumulate local statistics via [`preprocess`](Self::preprocess), transfer
/// them as [`snapshot`](Self::snapshot)s across the worker boundary, and the
/// canonical instance [`absorb`](Self::absorb)s all shard snapshots before a
/// single [`finalize_preprocessing`](Self::finalize_preprocessing) call.
/// Stateless featurizers are FINALIZED from construction.
///
/// ## Contract
///
/// - [`featurize`](Self::featurize) returns exactly one row per label, in
///   label order. Violations are programming errors and abort featurization.
/// - Every emitted column index is in `[0, num_columns())`.
/// - `num_columns()` must not change once the featurizer is FINALIZED.
/// - [`absorb`](Self::absorb) must be invariant to snapshot order and shard
///   count: merging one shard's statistics or eight must produce the same
///   finalized state.
pub trait Featurizer: Send + Sync {
    /// Short stable name, used in error and column-name context.
    fn name(&self) -> &'static str;

    /// Number of columns this featurizer contributes.
    ///
    /// # Panics
    /// May panic if the featurizer is stateful and not yet finalized.
    fn num_columns(&self) -> usize;

    /// Whether this featurizer must see the preprocessing pass before use.
    fn needs_preprocessing(&self) -> bool {
        false
    }

    /// Accumulate statistics for one patient. No-op for stateless featurizers.
    fn preprocess(&mut self, _patient: &Patient, _labels: &[Label]) {}

    /// Serialize accumulated statistics into an opaque, self-describing
    /// record for transfer across the worker boundary.
    fn snapshot(&self) -> Value {
        Value::Null
    }

    /// Merge peer snapshots (from any number of shards, in any order) into
    /// this instance's statistics.
    fn absorb(&mut self, _peers: &[Value]) -> Result<(), FeaturizeError> {
        Ok(())
    }

    /// Transition to FINALIZED after all shard statistics are merged.
    /// Called exactly once per preprocessing pass.
    fn finalize_preprocessing(&mut self) -> Result<(), FeaturizeError> {
        Ok(())
    }

    /// Produce one sparse row per label, in label order.
    fn featurize(
        &self,
        patient: &Patient,
        labels: &[Label],
        ontology: &Ontology,
    ) -> Vec<Vec<ColumnValue>>;

    /// Human-readable name for a local column index.
    fn column_name(&self, _column: usize) -> String {
        "no name".to_string()
    }

    /// Clone into a fresh boxed instance for a per-shard replica.
    fn boxed_clone(&self) -> Box<dyn Featurizer>;
}

impl Clone for Box<dyn Featurizer> {
    fn clone(&self) -> Self {
        self.boxed_clone()
    }
}

// ============================================================================
// Online Statistics
// ============================================================================

/// Running count / mean / variance accumulator (Welford's method) with a
/// numerically-stable parallel combination rule, so per-shard accumulators
/// can be merged without retaining raw observations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OnlineStats {
    pub count: u64,
    pub mean: f64,
    /// Sum of squared deviations from the running mean.
    pub m2: f64,
}

impl OnlineStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one observation into the running statistics.
    pub fn push(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = x - self.mean;
        self.m2 += delta * delta2;
    }

    /// Combine with another accumulator (parallel variance combination).
    ///
    /// Associative and commutative in effect: any grouping of disjoint
    /// observation sets produces the same statistics up to float rounding.
    pub fn merge(&mut self, other: &OnlineStats) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        let total = self.count + other.count;
        let delta = other.mean - self.mean;
        self.mean += delta * other.count as f64 / total as f64;
        self.m2 +=
            other.m2 + delta * delta * (self.count as f64 * other.count as f64) / total as f64;
        self.count = total;
    }

    /// Population variance (0.0 until two observations exist).
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / self.count as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}

// ============================================================================
// Age Featurizer
// ============================================================================

/// Snapshot payload for [`AgeFeaturizer`].
#[derive(Debug, Serialize, Deserialize)]
struct AgeSnapshot {
    age_statistics: OnlineStats,
}

/// Emits the patient's z-scored age at each label time (1 column).
///
/// Age is measured from the patient's first recorded event (the birth record
/// by convention). Preprocessing accumulates a running mean/variance of age
/// over every (patient, label) pair; shards merge via the parallel variance
/// combination, never by recomputation from raw observations.
///
/// Patients with an empty event stream have no defined age; their labels get
/// an all-zero row and contribute nothing to the statistics.
#[derive(Debug, Clone, Default)]
pub struct AgeFeaturizer {
    stats: OnlineStats,
    /// `(mean, std_dev)` once finalized.
    normalization: Option<(f64, f64)>,
}

impl AgeFeaturizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Age in years at `time_us`, or `None` for patients without events.
    fn age_at(patient: &Patient, time_us: i64) -> Option<f64> {
        let birth = patient.birth_time_us()?;
        Some((time_us - birth) as f64 / MICROS_PER_YEAR)
    }

    /// Finalized normalization parameters, for inspection in tests and tools.
    pub fn normalization(&self) -> Option<(f64, f64)> {
        self.normalization
    }
}

impl Featurizer for AgeFeaturizer {
    fn name(&self) -> &'static str {
        "age"
    }

    fn num_columns(&self) -> usize {
        1
    }

    fn needs_preprocessing(&self) -> bool {
        true
    }

    fn preprocess(&mut self, patient: &Patient, labels: &[Label]) {
        for label in labels {
            if let Some(age) = Self::age_at(patient, label.time_us) {
                self.stats.push(age);
            }
        }
    }

    fn snapshot(&self) -> Value {
        serde_json::to_value(AgeSnapshot {
            age_statistics: self.stats,
        })
        .unwrap_or(Value::Null)
    }

    fn absorb(&mut self, peers: &[Value]) -> Result<(), FeaturizeError> {
        for peer in peers {
            let snap: AgeSnapshot =
                serde_json::from_value(peer.clone()).map_err(|source| FeaturizeError::Snapshot {
                    featurizer: self.name(),
                    source,
                })?;
            self.stats.merge(&snap.age_statistics);
        }
        Ok(())
    }

    fn finalize_preprocessing(&mut self) -> Result<(), FeaturizeError> {
        if self.normalization.is_some() {
            return Err(FeaturizeError::AlreadyFinalized {
                featurizer: self.name(),
            });
        }
        let std = self.stats.std_dev();
        if self.stats.count == 0 || std == 0.0 {
            return Err(FeaturizeError::InsufficientData {
                featurizer: self.name(),
            });
        }
        self.normalization = Some((self.stats.mean, std));
        Ok(())
    }

    fn featurize(
        &self,
        patient: &Patient,
        labels: &[Label],
        _ontology: &Ontology,
    ) -> Vec<Vec<ColumnValue>> {
        let (mean, std) = match self.normalization {
            Some(n) => n,
            None => panic!("age featurizer used before preprocessing finished"),
        };
        labels
            .iter()
            .map(|label| match Self::age_at(patient, label.time_us) {
                Some(age) => vec![ColumnValue::new(0, ((age - mean) / std) as f32)],
                None => Vec::new(),
            })
            .collect()
    }

    fn column_name(&self, column: usize) -> String {
        assert_eq!(column, 0, "age featurizer has a single column, got {column}");
        "age at label time (z-scored)".to_string()
    }

    fn boxed_clone(&self) -> Box<dyn Featurizer> {
        Box::new(self.clone())
    }
}

// ============================================================================
// Count Featurizer
// ============================================================================

/// Snapshot payload for [`CountFeaturizer`]: per-code tallies, sorted by code
/// so snapshots are byte-stable for a given shard content.
#[derive(Debug, Serialize, Deserialize)]
struct CountSnapshot {
    code_counts: Vec<(EventCode, u64)>,
}

/// Per-label counts of historical event codes over a top-K vocabulary.
///
/// Preprocessing tallies every event code of every labeled patient; shard
/// tallies merge by summation. Finalization selects the `top_k` most frequent
/// codes (ties broken by ascending code, so the vocabulary is invariant to
/// sharding) and fixes the column count. Featurization counts, per label, the
/// patient's events at or before the label time for each vocabulary code,
/// emitting only nonzero counts.
#[derive(Debug, Clone)]
pub struct CountFeaturizer {
    top_k: usize,
    tally: HashMap<EventCode, u64>,
    /// Vocabulary in column order once finalized.
    vocabulary: Option<Vec<EventCode>>,
    /// Reverse map code → column, built at finalization.
    column_of: HashMap<EventCode, usize>,
}

impl CountFeaturizer {
    /// # Panics
    /// Panics if `top_k` is zero.
    pub fn new(top_k: usize) -> Self {
        assert!(top_k > 0, "count featurizer needs a positive top_k");
        Self {
            top_k,
            tally: HashMap::new(),
            vocabulary: None,
            column_of: HashMap::new(),
        }
    }

    /// The finalized vocabulary in column order.
    ///
    /// # Panics
    /// Panics if preprocessing has not finished.
    pub fn vocabulary(&self) -> &[EventCode] {
        match &self.vocabulary {
            Some(v) => v,
            None => panic!("count featurizer used before preprocessing finished"),
        }
    }
}

impl Featurizer for CountFeaturizer {
    fn name(&self) -> &'static str {
        "count"
    }

    fn num_columns(&self) -> usize {
        self.vocabulary().len()
    }

    fn needs_preprocessing(&self) -> bool {
        true
    }

    fn preprocess(&mut self, patient: &Patient, _labels: &[Label]) {
        for event in &patient.events {
            *self.tally.entry(event.code).or_insert(0) += 1;
        }
    }

    fn snapshot(&self) -> Value {
        let mut code_counts: Vec<(EventCode, u64)> =
            self.tally.iter().map(|(&c, &n)| (c, n)).collect();
        code_counts.sort_by_key(|&(code, _)| code);
        serde_json::to_value(CountSnapshot { code_counts }).unwrap_or(Value::Null)
    }

    fn absorb(&mut self, peers: &[Value]) -> Result<(), FeaturizeError> {
        for peer in peers {
            let snap: CountSnapshot =
                serde_json::from_value(peer.clone()).map_err(|source| FeaturizeError::Snapshot {
                    featurizer: self.name(),
                    source,
                })?;
            for (code, count) in snap.code_counts {
                *self.tally.entry(code).or_insert(0) += count;
            }
        }
        Ok(())
    }

    fn finalize_preprocessing(&mut self) -> Result<(), FeaturizeError> {
        if self.vocabulary.is_some() {
            return Err(FeaturizeError::AlreadyFinalized {
                featurizer: self.name(),
            });
        }
        if self.tally.is_empty() {
            return Err(FeaturizeError::InsufficientData {
                featurizer: self.name(),
            });
        }

        // Most frequent first; ties broken by ascending code so the selected
        // vocabulary is independent of hash iteration order and shard count.
        let mut ranked: Vec<(EventCode, u64)> = self.tally.iter().map(|(&c, &n)| (c, n)).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.truncate(self.top_k);

        let vocabulary: Vec<EventCode> = ranked.into_iter().map(|(code, _)| code).collect();
        self.column_of = vocabulary
            .iter()
            .enumerate()
            .map(|(i, &code)| (code, i))
            .collect();
        self.vocabulary = Some(vocabulary);
        Ok(())
    }

    fn featurize(
        &self,
        patient: &Patient,
        labels: &[Label],
        _ontology: &Ontology,
    ) -> Vec<Vec<ColumnValue>> {
        // Touch the vocabulary up front so unfinalized use fails loudly.
        let _ = self.vocabulary();

        // Events and labels are both time-ordered: sweep the event stream
        // once, maintaining running counts, and snapshot at each label.
        let mut rows = Vec::with_capacity(labels.len());
        let mut counts: HashMap<usize, u32> = HashMap::new();
        let mut next_event = 0;

        for label in labels {
            while next_event < patient.events.len()
                && patient.events[next_event].time_us <= label.time_us
            {
                if let Some(&column) = self.column_of.get(&patient.events[next_event].code) {
                    *counts.entry(column).or_insert(0) += 1;
                }
                next_event += 1;
            }
            let mut row: Vec<ColumnValue> = counts
                .iter()
                .map(|(&column, &n)| ColumnValue::new(column, n as f32))
                .collect();
            row.sort_by_key(|cv| cv.column);
            rows.push(row);
        }
        rows
    }

    fn column_name(&self, column: usize) -> String {
        let vocabulary = self.vocabulary();
        assert!(
            column < vocabulary.len(),
            "count featurizer has {} columns, got {column}",
            vocabulary.len(),
        );
        format!("count of code {}", vocabulary[column])
    }

    fn boxed_clone(&self) -> Box<dyn Featurizer> {
        Box::new(self.clone())
    }
}

// ============================================================================
// Demographics Featurizer
// ============================================================================

/// One-hot presence of a fixed set of demographic codes (stateless).
///
/// Emits `(i, 1.0)` for each configured code present anywhere in the
/// patient's history — demographics are static, so every label of a patient
/// gets the same row. Usable immediately; no preprocessing.
#[derive(Debug, Clone)]
pub struct DemographicsFeaturizer {
    codes: Vec<EventCode>,
}

impl DemographicsFeaturizer {
    /// Build from an explicit code list. Duplicates are dropped, first
    /// occurrence fixing the column order.
    pub fn new(codes: impl IntoIterator<Item = EventCode>) -> Self {
        let mut seen = std::collections::HashSet::new();
        let codes = codes.into_iter().filter(|c| seen.insert(*c)).collect();
        Self { codes }
    }
}

impl Featurizer for DemographicsFeaturizer {
    fn name(&self) -> &'static str {
        "demographics"
    }

    fn num_columns(&self) -> usize {
        self.codes.len()
    }

    fn featurize(
        &self,
        patient: &Patient,
        labels: &[Label],
        _ontology: &Ontology,
    ) -> Vec<Vec<ColumnValue>> {
        let present: std::collections::HashSet<EventCode> =
            patient.events.iter().map(|e| e.code).collect();
        let row: Vec<ColumnValue> = self
            .codes
            .iter()
            .enumerate()
            .filter(|(_, code)| present.contains(code))
            .map(|(i, _)| ColumnValue::new(i, 1.0))
            .collect();
        vec![row; labels.len()]
    }

    fn column_name(&self, column: usize) -> String {
        assert!(
            column < self.codes.len(),
            "demographics featurizer has {} columns, got {column}",
            self.codes.len(),
        );
        format!("has code {}", self.codes[column])
    }

    fn boxed_clone(&self) -> Box<dyn Featurizer> {
        Box::new(self.clone())
    }
}
