//! Core data model: patients, events, labels, the on-disk patient database,
//! and the CSR feature-matrix type shared by the featurization engine.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;
use serde::{Deserialize, Serialize};

// ============================================================================
// Index NewTypes
// ============================================================================

/// Globally unique patient identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PatientId(pub u64);

impl std::fmt::Display for PatientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Clinical event code (diagnosis, procedure, observation, ...).
/// Resolved to a human-readable name through the [`Ontology`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EventCode(pub u32);

impl std::fmt::Display for EventCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Events & Patients
// ============================================================================

/// Payload attached to an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventValue {
    /// Pure code occurrence with no payload.
    None,
    /// Numeric measurement (lab value, vital sign, ...).
    Numeric(f32),
    /// Opaque UTF-8 blob (clinical note fragment, free text).
    /// Stored and surfaced unchanged; no featurizer interprets it.
    Text(String),
}

/// A single timestamped clinical event.
///
/// Timestamps are **epoch microseconds** (`i64`), matching the storage format
/// of the patient database. Convert to chrono via
/// `chrono::DateTime::from_timestamp_micros(time_us)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event time in epoch microseconds.
    pub time_us: i64,
    /// Event code, resolvable through the [`Ontology`].
    pub code: EventCode,
    /// Optional payload.
    pub value: EventValue,
}

/// A patient decoded from the database: an id plus its ordered event stream.
///
/// Events are non-decreasing in `time_us` — the database writer sorts them at
/// build time and the engine relies on that invariant.
#[derive(Debug, Clone, PartialEq)]
pub struct Patient {
    pub id: PatientId,
    pub events: Vec<Event>,
}

impl Patient {
    /// Time of the patient's first recorded event (the birth record, by
    /// convention of the data model), or `None` for an empty stream.
    pub fn birth_time_us(&self) -> Option<i64> {
        self.events.first().map(|e| e.time_us)
    }
}

// ============================================================================
// Labels
// ============================================================================

/// A prediction target at a point in time for one patient.
///
/// Boolean targets are carried as 0.0 / 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Label {
    /// Prediction time in epoch microseconds.
    pub time_us: i64,
    /// Target value.
    pub value: f32,
}

/// One row of a labels file: a [`Label`] tagged with its patient.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LabelRecord {
    pub patient_id: PatientId,
    pub time_us: i64,
    pub value: f32,
}

/// The label source: every labeled patient and its time-ordered labels.
///
/// Construction normalizes the input — labels are sorted by time, duplicate
/// times within one patient are dropped (first wins), and patients with an
/// empty label list are removed. The sorted key order of the underlying map
/// gives the ascending patient-id iteration the engine depends on.
#[derive(Debug, Clone, Default)]
pub struct LabeledPatients {
    by_patient: BTreeMap<PatientId, Vec<Label>>,
}

impl LabeledPatients {
    /// Build from flat `(patient, time, value)` records.
    pub fn from_records(records: impl IntoIterator<Item = LabelRecord>) -> Self {
        let mut by_patient: BTreeMap<PatientId, Vec<Label>> = BTreeMap::new();
        for r in records {
            by_patient.entry(r.patient_id).or_default().push(Label {
                time_us: r.time_us,
                value: r.value,
            });
        }
        for labels in by_patient.values_mut() {
            labels.sort_by_key(|l| l.time_us);
            labels.dedup_by_key(|l| l.time_us);
        }
        by_patient.retain(|_, labels| !labels.is_empty());
        Self { by_patient }
    }

    /// All distinct patient ids with at least one label, ascending.
    pub fn patient_ids(&self) -> Vec<PatientId> {
        self.by_patient.keys().copied().collect()
    }

    /// The time-ordered labels for one patient (empty slice if unlabeled).
    pub fn labels_for(&self, patient: PatientId) -> &[Label] {
        self.by_patient.get(&patient).map_or(&[], Vec::as_slice)
    }

    /// Number of labeled patients.
    pub fn num_patients(&self) -> usize {
        self.by_patient.len()
    }

    /// Total number of labels across all patients.
    pub fn num_labels(&self) -> usize {
        self.by_patient.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_patient.is_empty()
    }
}

// ============================================================================
// Ontology
// ============================================================================

/// Code → human-readable-name dictionary, passed through unchanged to every
/// featurize call. Stored in the database's `metadata.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ontology {
    names: BTreeMap<EventCode, String>,
}

impl Ontology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, code: EventCode, name: impl Into<String>) {
        self.names.insert(code, name.into());
    }

    /// The registered name for a code, if any.
    pub fn get(&self, code: EventCode) -> Option<&str> {
        self.names.get(&code).map(String::as_str)
    }

    /// The registered name, or a `code <n>` placeholder for unregistered codes.
    pub fn describe(&self, code: EventCode) -> String {
        match self.get(code) {
            Some(name) => name.to_string(),
            None => format!("code {code}"),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

// ============================================================================
// Database Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to read metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("corrupt database: {0}")]
    Corrupt(String),

    #[error("patient {0} not found in database")]
    UnknownPatient(PatientId),
}

// ============================================================================
// Database Metadata
// ============================================================================

/// Sidecar metadata for a patient database directory, serialized as
/// `metadata.json`. Counts are cross-checked against the binary header at
/// open time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseMetadata {
    pub num_patients: u32,
    pub num_events: u32,
    pub num_texts: u32,
    pub ontology: Ontology,
}

// ============================================================================
// On-disk Event Record
// ============================================================================

/// Value-kind tag stored in [`EventRecord::kind`].
const KIND_NONE: u32 = 0;
const KIND_NUMERIC: u32 = 1;
const KIND_TEXT: u32 = 2;

/// Fixed-size packed event record as stored in `patients.bin`.
///
/// 24 bytes, 8-byte aligned, no padding: the file sections holding these
/// records can be reinterpreted directly from the mmap.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct EventRecord {
    /// Event time in epoch microseconds.
    time_us: i64,
    /// Event code.
    code: u32,
    /// Value kind: `KIND_NONE`, `KIND_NUMERIC`, or `KIND_TEXT`.
    kind: u32,
    /// Numeric payload (valid iff `kind == KIND_NUMERIC`).
    value: f32,
    /// Text-blob index (valid iff `kind == KIND_TEXT`).
    aux: u32,
}

// ============================================================================
// Bitwise / Alignment Utilities
// ============================================================================

/// Round `offset` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two.
#[inline]
const fn align_up(offset: usize, alignment: usize) -> usize {
    (offset + alignment - 1) & !(alignment - 1)
}

/// Alignment guarantee for all sections within database binary files.
const SECTION_ALIGNMENT: usize = 8;

/// Write `data` followed by zero-padding to [`SECTION_ALIGNMENT`].
pub(crate) fn write_padded(
    w: &mut BufWriter<File>,
    data: &[u8],
    offset: &mut usize,
) -> std::io::Result<()> {
    w.write_all(data)?;
    *offset += data.len();
    let aligned = align_up(*offset, SECTION_ALIGNMENT);
    let pad = aligned - *offset;
    if pad > 0 {
        w.write_all(&[0u8; 8][..pad])?;
    }
    *offset = aligned;
    Ok(())
}

/// Reinterpret a `&[u32]` as raw bytes.
pub(crate) fn u32_as_bytes(s: &[u32]) -> &[u8] {
    // SAFETY: u32 has no padding and a well-defined memory layout.
    unsafe { std::slice::from_raw_parts(s.as_ptr() as *const u8, std::mem::size_of_val(s)) }
}

/// Reinterpret a `&[i32]` as raw bytes.
pub(crate) fn i32_as_bytes(s: &[i32]) -> &[u8] {
    // SAFETY: i32 has no padding and a well-defined memory layout.
    unsafe { std::slice::from_raw_parts(s.as_ptr() as *const u8, std::mem::size_of_val(s)) }
}

/// Reinterpret a `&[i64]` as raw bytes.
pub(crate) fn i64_as_bytes(s: &[i64]) -> &[u8] {
    // SAFETY: i64 has no padding and a well-defined memory layout.
    unsafe { std::slice::from_raw_parts(s.as_ptr() as *const u8, std::mem::size_of_val(s)) }
}

/// Reinterpret a `&[u64]` as raw bytes.
pub(crate) fn u64_as_bytes(s: &[u64]) -> &[u8] {
    // SAFETY: u64 has no padding and a well-defined memory layout.
    unsafe { std::slice::from_raw_parts(s.as_ptr() as *const u8, std::mem::size_of_val(s)) }
}

/// Reinterpret a `&[f32]` as raw bytes.
pub(crate) fn f32_as_bytes(s: &[f32]) -> &[u8] {
    // SAFETY: f32 has no padding and a well-defined memory layout.
    unsafe { std::slice::from_raw_parts(s.as_ptr() as *const u8, std::mem::size_of_val(s)) }
}

// ============================================================================
// Patient Database (zero-copy mmap'd view)
// ============================================================================

/// Header size for `patients.bin`: four `u32` values.
const DB_HEADER_U32S: usize = 4;

/// A read-only patient database, memory-mapped from a directory.
///
/// Every worker opens its own handle; multiple handles on the same directory
/// share physical pages through the OS page cache, so per-worker opens are
/// cheap and fully independent.
///
/// ## Directory layout
///
/// ```text
/// db_dir/
///   metadata.json   — DatabaseMetadata (counts + ontology)
///   patients.bin    — flat binary patient/event store (below)
/// ```
///
/// ## `patients.bin` layout
///
/// ```text
/// Header (16 bytes):
///   num_patients : u32
///   num_events   : u32
///   num_texts    : u32
///   _reserved    : u32   (must be 0)
/// Sections (packed sequentially, each 8-byte aligned):
///   patient_ids   : [u64; num_patients]        — sorted ascending
///   event_offsets : [u32; num_patients + 1]    — CSR offsets into `events`
///   events        : [EventRecord; num_events]  — 24-byte packed records
///   text_offsets  : [u32; num_texts + 1]       — CSR offsets into `text_bytes`
///   text_bytes    : [u8]                       — concatenated UTF-8 payloads
/// ```
///
/// Patient `i`'s events are `events[event_offsets[i]..event_offsets[i + 1]]`,
/// already sorted by time. Text payload `t` is
/// `text_bytes[text_offsets[t]..text_offsets[t + 1]]`.
pub struct PatientDatabase {
    /// Keeps the memory map alive for the lifetime of the view.
    _mmap: Arc<Mmap>,
    metadata: DatabaseMetadata,
    /// Sorted patient ids (`num_patients` elements).
    patient_ids: &'static [u64],
    /// CSR offsets into `events` (`num_patients + 1` elements).
    event_offsets: &'static [u32],
    /// Packed event records.
    events: &'static [EventRecord],
    /// CSR offsets into `text_bytes` (`num_texts + 1` elements).
    text_offsets: &'static [u32],
    /// Concatenated UTF-8 text payloads.
    text_bytes: &'static [u8],
}

impl PatientDatabase {
    /// Open a patient database directory read-only.
    ///
    /// Reads `metadata.json`, maps `patients.bin`, validates the header
    /// against the metadata, and creates zero-copy slices into the mmap.
    pub fn open(dir: &Path) -> Result<Self, DatabaseError> {
        let metadata_bytes = std::fs::read(dir.join("metadata.json"))?;
        let metadata: DatabaseMetadata = serde_json::from_slice(&metadata_bytes)?;

        let file = File::open(dir.join("patients.bin"))?;
        // SAFETY: the file is opened read-only and never mutated while mapped.
        let mmap = Arc::new(unsafe { Mmap::map(&file)? });

        let byte_len = mmap.len();
        let header_bytes = DB_HEADER_U32S * std::mem::size_of::<u32>();
        if byte_len < header_bytes {
            return Err(DatabaseError::Corrupt(format!(
                "patients.bin too small for header ({byte_len} < {header_bytes} bytes)"
            )));
        }

        // SAFETY: Mmap is page-aligned (>= 4-byte aligned). Header is 4 u32s.
        let header: &[u32] =
            unsafe { std::slice::from_raw_parts(mmap.as_ptr() as *const u32, DB_HEADER_U32S) };
        let num_patients = header[0] as usize;
        let num_events = header[1] as usize;
        let num_texts = header[2] as usize;
        if header[0] != metadata.num_patients
            || header[1] != metadata.num_events
            || header[2] != metadata.num_texts
        {
            return Err(DatabaseError::Corrupt(format!(
                "header ({}, {}, {}) disagrees with metadata.json ({}, {}, {})",
                header[0],
                header[1],
                header[2],
                metadata.num_patients,
                metadata.num_events,
                metadata.num_texts,
            )));
        }

        let ids_bytes = num_patients * std::mem::size_of::<u64>();
        let offsets_bytes = (num_patients + 1) * std::mem::size_of::<u32>();
        let events_bytes = num_events * std::mem::size_of::<EventRecord>();
        let text_offsets_bytes = (num_texts + 1) * std::mem::size_of::<u32>();

        let ids_start = align_up(header_bytes, SECTION_ALIGNMENT);
        let offsets_start = align_up(ids_start + ids_bytes, SECTION_ALIGNMENT);
        let events_start = align_up(offsets_start + offsets_bytes, SECTION_ALIGNMENT);
        let text_offsets_start = align_up(events_start + events_bytes, SECTION_ALIGNMENT);
        let text_bytes_start = align_up(text_offsets_start + text_offsets_bytes, SECTION_ALIGNMENT);

        if text_bytes_start > byte_len {
            return Err(DatabaseError::Corrupt(format!(
                "patients.bin size mismatch: sections need at least {text_bytes_start} bytes, \
                 file is {byte_len}"
            )));
        }
        let text_blob_len = byte_len - text_bytes_start;

        // SAFETY for all slices below:
        //   - The mmap is read-only and immutable.
        //   - The Arc keeps the backing memory alive for as long as this
        //     struct exists. We extend the slice lifetimes to 'static because
        //     the Arc prevents deallocation.
        //   - Section offsets are 8-byte aligned, satisfying alignment for
        //     u64/u32 and the 8-byte-aligned EventRecord.
        let base = mmap.as_ptr();
        let (patient_ids, event_offsets, events, text_offsets, text_bytes) = unsafe {
            let ids = std::slice::from_raw_parts(base.add(ids_start) as *const u64, num_patients);
            let offs = std::slice::from_raw_parts(
                base.add(offsets_start) as *const u32,
                num_patients + 1,
            );
            let evs = std::slice::from_raw_parts(
                base.add(events_start) as *const EventRecord,
                num_events,
            );
            let toffs = std::slice::from_raw_parts(
                base.add(text_offsets_start) as *const u32,
                num_texts + 1,
            );
            let tbytes = std::slice::from_raw_parts(base.add(text_bytes_start), text_blob_len);
            (ids, offs, evs, toffs, tbytes)
        };

        if event_offsets.last().copied() != Some(num_events as u32) {
            return Err(DatabaseError::Corrupt(format!(
                "event_offsets terminates at {:?}, expected {num_events}",
                event_offsets.last(),
            )));
        }

        Ok(Self {
            _mmap: mmap,
            metadata,
            patient_ids,
            event_offsets,
            events,
            text_offsets,
            text_bytes,
        })
    }

    /// Number of patients in the database.
    pub fn len(&self) -> usize {
        self.patient_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patient_ids.is_empty()
    }

    /// Total number of events across all patients.
    pub fn num_events(&self) -> usize {
        self.events.len()
    }

    /// Sorted patient ids, ascending.
    pub fn patient_ids(&self) -> &[u64] {
        self.patient_ids
    }

    /// The global ontology, passed through unchanged to every featurize call.
    pub fn ontology(&self) -> &Ontology {
        &self.metadata.ontology
    }

    /// Look up a patient by id, decoding its event stream.
    pub fn patient(&self, id: PatientId) -> Result<Patient, DatabaseError> {
        let idx = self
            .patient_ids
            .binary_search(&id.0)
            .map_err(|_| DatabaseError::UnknownPatient(id))?;

        let start = self.event_offsets[idx] as usize;
        let end = self.event_offsets[idx + 1] as usize;

        let mut events = Vec::with_capacity(end - start);
        for rec in &self.events[start..end] {
            let value = match rec.kind {
                KIND_NONE => EventValue::None,
                KIND_NUMERIC => EventValue::Numeric(rec.value),
                KIND_TEXT => EventValue::Text(self.text_payload(rec.aux)?),
                other => {
                    return Err(DatabaseError::Corrupt(format!(
                        "patient {id}: unknown event value kind {other}"
                    )));
                }
            };
            events.push(Event {
                time_us: rec.time_us,
                code: EventCode(rec.code),
                value,
            });
        }

        Ok(Patient { id, events })
    }

    /// Decode one text payload from the blob section.
    fn text_payload(&self, text_idx: u32) -> Result<String, DatabaseError> {
        let i = text_idx as usize;
        if i + 1 >= self.text_offsets.len() {
            return Err(DatabaseError::Corrupt(format!(
                "text index {i} out of bounds ({} payloads)",
                self.text_offsets.len() - 1,
            )));
        }
        let start = self.text_offsets[i] as usize;
        let end = self.text_offsets[i + 1] as usize;
        let bytes = self
            .text_bytes
            .get(start..end)
            .ok_or_else(|| DatabaseError::Corrupt(format!("text payload {i} out of range")))?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| DatabaseError::Corrupt(format!("text payload {i} is not UTF-8: {e}")))
    }
}

// ============================================================================
// Database Builder
// ============================================================================

/// Accumulates events in memory and writes a [`PatientDatabase`] directory.
///
/// Events may be added in any order; [`write`](Self::write) sorts them by
/// `(patient, time)` (stable, so equal-time events keep insertion order) and
/// packs them into `patients.bin`.
#[derive(Debug, Default)]
pub struct DatabaseBuilder {
    events: Vec<(PatientId, Event)>,
}

impl DatabaseBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one event for a patient.
    pub fn add_event(&mut self, patient: PatientId, event: Event) {
        self.events.push((patient, event));
    }

    /// Number of events added so far.
    pub fn num_events(&self) -> usize {
        self.events.len()
    }

    /// Sort, pack, and write the database into `dir` (created if missing).
    pub fn write(mut self, dir: &Path, ontology: Ontology) -> Result<(), DatabaseError> {
        std::fs::create_dir_all(dir)?;

        self.events
            .sort_by_key(|(pid, event)| (*pid, event.time_us));

        // Group into per-patient CSR runs and intern text payloads.
        let mut patient_ids: Vec<u64> = Vec::new();
        let mut event_offsets: Vec<u32> = vec![0];
        let mut records: Vec<EventRecord> = Vec::with_capacity(self.events.len());
        let mut text_offsets: Vec<u32> = vec![0];
        let mut text_blob: Vec<u8> = Vec::new();

        for (pid, event) in &self.events {
            if patient_ids.last() != Some(&pid.0) {
                if !patient_ids.is_empty() {
                    event_offsets.push(records.len() as u32);
                }
                patient_ids.push(pid.0);
            }
            let (kind, value, aux) = match &event.value {
                EventValue::None => (KIND_NONE, 0.0, 0),
                EventValue::Numeric(v) => (KIND_NUMERIC, *v, 0),
                EventValue::Text(text) => {
                    let idx = text_offsets.len() as u32 - 1;
                    text_blob.extend_from_slice(text.as_bytes());
                    text_offsets.push(text_blob.len() as u32);
                    (KIND_TEXT, 0.0, idx)
                }
            };
            records.push(EventRecord {
                time_us: event.time_us,
                code: event.code.0,
                kind,
                value,
                aux,
            });
        }
        event_offsets.push(records.len() as u32);
        if patient_ids.is_empty() {
            // Empty database: a single terminating offset.
            event_offsets.truncate(1);
        }

        let num_patients = patient_ids.len() as u32;
        let num_events = records.len() as u32;
        let num_texts = text_offsets.len() as u32 - 1;

        let metadata = DatabaseMetadata {
            num_patients,
            num_events,
            num_texts,
            ontology,
        };
        let metadata_json = serde_json::to_vec_pretty(&metadata)?;
        std::fs::write(dir.join("metadata.json"), metadata_json)?;

        let mut w = BufWriter::new(File::create(dir.join("patients.bin"))?);

        // -- Header (16 bytes) ----------------------------------------------
        let reserved: u32 = 0;
        w.write_all(&num_patients.to_ne_bytes())?;
        w.write_all(&num_events.to_ne_bytes())?;
        w.write_all(&num_texts.to_ne_bytes())?;
        w.write_all(&reserved.to_ne_bytes())?;
        let mut offset = align_up(16, SECTION_ALIGNMENT); // already 16

        /// Reinterpret a `&[EventRecord]` as raw bytes.
        fn records_as_bytes(s: &[EventRecord]) -> &[u8] {
            // SAFETY: EventRecord is repr(C) with no padding (8+4+4+4+4 = 24).
            unsafe {
                std::slice::from_raw_parts(s.as_ptr() as *const u8, std::mem::size_of_val(s))
            }
        }

        write_padded(&mut w, u64_as_bytes(&patient_ids), &mut offset)?;
        write_padded(&mut w, u32_as_bytes(&event_offsets), &mut offset)?;
        write_padded(&mut w, records_as_bytes(&records), &mut offset)?;
        write_padded(&mut w, u32_as_bytes(&text_offsets), &mut offset)?;
        write_padded(&mut w, &text_blob, &mut offset)?;

        w.flush()?;
        Ok(())
    }
}

// ============================================================================
// Feature Matrix (CSR)
// ============================================================================

/// A sparse row-major feature matrix in CSR form.
///
/// Rows are labels, columns are the global column space of a featurizer list.
/// Arrays use 32-bit element types to match the downstream modeling format.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    num_rows: usize,
    num_cols: usize,
    /// Nonzero values, row-major.
    pub values: Vec<f32>,
    /// Column index of each nonzero value.
    pub col_indices: Vec<i32>,
    /// `row_offsets[i]` is the start of row `i` in `values` / `col_indices`.
    /// Length = `num_rows + 1`.
    pub row_offsets: Vec<i32>,
}

impl FeatureMatrix {
    /// Assemble a matrix from raw CSR arrays, validating the structure.
    ///
    /// # Panics
    /// Panics if the offsets array is malformed, the arrays disagree in
    /// length, or `num_cols` exceeds the 32-bit index range.
    pub fn from_parts(
        num_rows: usize,
        num_cols: usize,
        values: Vec<f32>,
        col_indices: Vec<i32>,
        row_offsets: Vec<i32>,
    ) -> Self {
        assert!(
            num_cols <= i32::MAX as usize,
            "column count {num_cols} exceeds the 32-bit index range"
        );
        assert_eq!(
            row_offsets.len(),
            num_rows + 1,
            "row_offsets has {} entries for {num_rows} rows",
            row_offsets.len(),
        );
        assert_eq!(
            values.len(),
            col_indices.len(),
            "values ({}) and col_indices ({}) disagree",
            values.len(),
            col_indices.len(),
        );
        assert_eq!(
            row_offsets.last().copied(),
            Some(values.len() as i32),
            "row_offsets terminates at {:?}, expected nnz {}",
            row_offsets.last(),
            values.len(),
        );
        debug_assert!(
            row_offsets.windows(2).all(|w| w[0] <= w[1]),
            "row_offsets must be non-decreasing"
        );
        Self {
            num_rows,
            num_cols,
            values,
            col_indices,
            row_offsets,
        }
    }

    /// An empty matrix with the given column count.
    pub fn empty(num_cols: usize) -> Self {
        Self::from_parts(0, num_cols, Vec::new(), Vec::new(), vec![0])
    }

    /// Number of rows (labels).
    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    /// Number of columns (global column space).
    pub fn num_cols(&self) -> usize {
        self.num_cols
    }

    /// Number of stored nonzero values.
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// The `(column indices, values)` slices of row `i`.
    ///
    /// # Panics
    /// Panics if `i` is out of bounds.
    pub fn row(&self, i: usize) -> (&[i32], &[f32]) {
        let start = self.row_offsets[i] as usize;
        let end = self.row_offsets[i + 1] as usize;
        (&self.col_indices[start..end], &self.values[start..end])
    }

    /// Concatenate row blocks vertically, in the given order.
    ///
    /// Row offsets of later blocks are rebased by the running nonzero count.
    ///
    /// # Panics
    /// Panics if the blocks disagree on column count or `blocks` is empty.
    pub fn concat_rows(blocks: Vec<FeatureMatrix>) -> Self {
        assert!(!blocks.is_empty(), "cannot concatenate zero matrix blocks");
        let num_cols = blocks[0].num_cols;
        let total_rows: usize = blocks.iter().map(|b| b.num_rows).sum();
        let total_nnz: usize = blocks.iter().map(FeatureMatrix::nnz).sum();

        let mut values = Vec::with_capacity(total_nnz);
        let mut col_indices = Vec::with_capacity(total_nnz);
        let mut row_offsets = Vec::with_capacity(total_rows + 1);
        row_offsets.push(0i32);

        for block in blocks {
            assert_eq!(
                block.num_cols, num_cols,
                "matrix block has {} columns, expected {num_cols}",
                block.num_cols,
            );
            let base = values.len() as i32;
            // Skip the block's leading 0 offset; rebase the rest.
            for &off in &block.row_offsets[1..] {
                row_offsets.push(base + off);
            }
            values.extend_from_slice(&block.values);
            col_indices.extend_from_slice(&block.col_indices);
        }

        Self::from_parts(total_rows, num_cols, values, col_indices, row_offsets)
    }

    /// Write the matrix to a flat binary file.
    ///
    /// ## File layout
    ///
    /// ```text
    /// Header (16 bytes):
    ///   num_rows  : u32
    ///   num_cols  : u32
    ///   nnz       : u32
    ///   _reserved : u32   (must be 0)
    /// Sections (packed sequentially, each 8-byte aligned):
    ///   row_offsets : [i32; num_rows + 1]
    ///   col_indices : [i32; nnz]
    ///   values      : [f32; nnz]
    /// ```
    pub fn write_bin(&self, path: &Path) -> std::io::Result<()> {
        let mut w = BufWriter::new(File::create(path)?);

        let reserved: u32 = 0;
        w.write_all(&(self.num_rows as u32).to_ne_bytes())?;
        w.write_all(&(self.num_cols as u32).to_ne_bytes())?;
        w.write_all(&(self.nnz() as u32).to_ne_bytes())?;
        w.write_all(&reserved.to_ne_bytes())?;
        let mut offset = align_up(16, SECTION_ALIGNMENT); // already 16

        write_padded(&mut w, i32_as_bytes(&self.row_offsets), &mut offset)?;
        write_padded(&mut w, i32_as_bytes(&self.col_indices), &mut offset)?;
        write_padded(&mut w, f32_as_bytes(&self.values), &mut offset)?;

        w.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(time_us: i64, code: u32, value: EventValue) -> Event {
        Event {
            time_us,
            code: EventCode(code),
            value,
        }
    }

    #[test]
    fn database_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db_dir = dir.path().join("db");

        let mut ontology = Ontology::new();
        ontology.insert(EventCode(1), "Birth");
        ontology.insert(EventCode(7), "Hypertension");

        let mut builder = DatabaseBuilder::new();
        // Deliberately out of order: the writer must sort by (patient, time).
        builder.add_event(PatientId(20), event(500, 7, EventValue::Numeric(1.5)));
        builder.add_event(PatientId(20), event(100, 1, EventValue::None));
        builder.add_event(PatientId(10), event(0, 1, EventValue::None));
        builder.add_event(
            PatientId(10),
            event(900, 9, EventValue::Text("note fragment".to_string())),
        );
        builder.write(&db_dir, ontology.clone()).unwrap();

        let db = PatientDatabase::open(&db_dir).unwrap();
        assert_eq!(db.len(), 2);
        assert_eq!(db.num_events(), 4);
        assert_eq!(db.patient_ids(), &[10, 20]);
        assert_eq!(db.ontology(), &ontology);

        let p10 = db.patient(PatientId(10)).unwrap();
        assert_eq!(p10.events.len(), 2);
        assert_eq!(p10.birth_time_us(), Some(0));
        assert_eq!(
            p10.events[1].value,
            EventValue::Text("note fragment".to_string())
        );

        let p20 = db.patient(PatientId(20)).unwrap();
        assert_eq!(p20.events[0].time_us, 100);
        assert_eq!(p20.events[1].value, EventValue::Numeric(1.5));

        assert!(matches!(
            db.patient(PatientId(99)),
            Err(DatabaseError::UnknownPatient(PatientId(99)))
        ));
    }

    #[test]
    fn empty_database_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db_dir = dir.path().join("db");
        DatabaseBuilder::new()
            .write(&db_dir, Ontology::new())
            .unwrap();
        let db = PatientDatabase::open(&db_dir).unwrap();
        assert!(db.is_empty());
        assert_eq!(db.num_events(), 0);
    }

    #[test]
    fn labeled_patients_normalizes_input() {
        let labels = LabeledPatients::from_records([
            LabelRecord {
                patient_id: PatientId(5),
                time_us: 200,
                value: 1.0,
            },
            LabelRecord {
                patient_id: PatientId(5),
                time_us: 100,
                value: 0.0,
            },
            // Duplicate time for patient 5: first-by-sort wins.
            LabelRecord {
                patient_id: PatientId(5),
                time_us: 200,
                value: 0.0,
            },
            LabelRecord {
                patient_id: PatientId(2),
                time_us: 50,
                value: 1.0,
            },
        ]);

        assert_eq!(labels.patient_ids(), vec![PatientId(2), PatientId(5)]);
        assert_eq!(labels.num_labels(), 3);
        let for_5 = labels.labels_for(PatientId(5));
        assert_eq!(for_5.len(), 2);
        assert!(for_5[0].time_us < for_5[1].time_us);
        assert!(labels.labels_for(PatientId(99)).is_empty());
    }

    #[test]
    fn matrix_concat_rebases_offsets() {
        let a = FeatureMatrix::from_parts(
            2,
            5,
            vec![1.0, 2.0, 3.0],
            vec![0, 2, 4],
            vec![0, 2, 3],
        );
        let b = FeatureMatrix::from_parts(1, 5, vec![9.0], vec![1], vec![0, 1]);

        let m = FeatureMatrix::concat_rows(vec![a, b]);
        assert_eq!(m.num_rows(), 3);
        assert_eq!(m.num_cols(), 5);
        assert_eq!(m.nnz(), 4);
        assert_eq!(m.row_offsets, vec![0, 2, 3, 4]);
        assert_eq!(m.row(2), (&[1i32][..], &[9.0f32][..]));
    }

    #[test]
    #[should_panic(expected = "columns")]
    fn matrix_concat_rejects_mismatched_widths() {
        let a = FeatureMatrix::empty(3);
        let b = FeatureMatrix::empty(4);
        FeatureMatrix::concat_rows(vec![a, b]);
    }
}
