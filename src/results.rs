//! Recognition results and where they end up.
//!
//! The dispatcher accumulates results in memory; on shutdown the accumulator is
//! flushed once to a [`ResultStore`]. The CSV store appends across runs and
//! writes the header only into a new or empty file.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Deserialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::PipelineError;
use crate::frame::FrameEntry;
use crate::ingest::redact_url;
use crate::recognize::{BoundingBox, RecognizedFace};

pub const DEFAULT_REPORT_PATH: &str = "reports/inferred_faces.csv";

const CSV_HEADER: &str =
    "recognized_at,camera,target,label,distance,top,right,bottom,left,frame_sequence";

/// One named (or unknown) face seen by one camera.
#[derive(Clone, Debug, PartialEq)]
pub struct RecognitionResult {
    pub camera: String,
    /// Camera URL with any password masked.
    pub target: String,
    pub label: String,
    pub distance: Option<f64>,
    pub location: BoundingBox,
    pub frame_sequence: u64,
    pub recognized_at: DateTime<Utc>,
}

impl RecognitionResult {
    pub fn from_face(entry: &FrameEntry, face: RecognizedFace, recognized_at: DateTime<Utc>) -> Self {
        Self {
            camera: entry.camera.clone(),
            target: redact_url(&entry.target),
            label: face.label,
            distance: face.distance,
            location: face.location,
            frame_sequence: entry.sequence,
            recognized_at,
        }
    }

    /// UTC timestamp at one-second resolution, e.g. `2024-05-01T12:00:00Z`.
    pub fn timestamp(&self) -> String {
        self.recognized_at.format("%Y-%m-%dT%H:%M:%SZ").to_string()
    }
}

/// Results collected since startup, in dispatch order.
#[derive(Debug, Default)]
pub struct ResultAccumulator {
    results: Vec<RecognitionResult>,
}

impl ResultAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, result: RecognitionResult) {
        self.results.push(result);
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn as_slice(&self) -> &[RecognitionResult] {
        &self.results
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RecognitionResult> {
        self.results.iter()
    }
}

/// Durable sink for accumulated results.
///
/// `flush` returns the artifact path that gets attached to the summary report.
pub trait ResultStore: Send {
    fn flush(&mut self, results: &[RecognitionResult]) -> Result<PathBuf, PipelineError>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    Csv,
    Sqlite,
}

impl StoreKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "csv" => Some(Self::Csv),
            "sqlite" => Some(Self::Sqlite),
            _ => None,
        }
    }
}

pub fn open_store(kind: StoreKind, path: &Path) -> Box<dyn ResultStore> {
    match kind {
        StoreKind::Csv => Box::new(CsvResultStore::new(path)),
        StoreKind::Sqlite => Box::new(SqliteResultStore::new(path)),
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(())
}

fn write_failed(path: &Path, err: anyhow::Error) -> PipelineError {
    PipelineError::WriteFailed(format!("{}: {:#}", path.display(), err))
}

// ----------------------------------------------------------------------------
// CSV
// ----------------------------------------------------------------------------

pub struct CsvResultStore {
    path: PathBuf,
}

impl CsvResultStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, results: &[RecognitionResult]) -> Result<()> {
        ensure_parent(&self.path)?;
        let needs_header = fs::metadata(&self.path)
            .map(|meta| meta.len() == 0)
            .unwrap_or(true);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;

        let mut out = String::new();
        if needs_header {
            out.push_str(CSV_HEADER);
            out.push('\n');
        }
        for result in results {
            out.push_str(&csv_row(result));
            out.push('\n');
        }
        file.write_all(out.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}

impl ResultStore for CsvResultStore {
    fn flush(&mut self, results: &[RecognitionResult]) -> Result<PathBuf, PipelineError> {
        self.append(results)
            .map_err(|err| write_failed(&self.path, err))?;
        Ok(self.path.clone())
    }
}

fn csv_row(result: &RecognitionResult) -> String {
    let distance = result
        .distance
        .map(|d| format!("{:.6}", d))
        .unwrap_or_default();
    let loc = result.location;
    format!(
        "{},{},{},{},{},{},{},{},{},{}",
        result.timestamp(),
        csv_field(&result.camera),
        csv_field(&result.target),
        csv_field(&result.label),
        distance,
        loc.top,
        loc.right,
        loc.bottom,
        loc.left,
        result.frame_sequence
    )
}

fn csv_field(value: &str) -> String {
    if value.contains(&[',', '"', '\n', '\r'][..]) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

// ----------------------------------------------------------------------------
// SQLite
// ----------------------------------------------------------------------------

pub struct SqliteResultStore {
    path: PathBuf,
}

impl SqliteResultStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn open(&self) -> Result<Connection> {
        ensure_parent(&self.path)?;
        let conn = Connection::open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS recognitions (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              recognized_at TEXT NOT NULL,
              camera TEXT NOT NULL,
              target TEXT NOT NULL,
              label TEXT NOT NULL,
              distance REAL,
              box_top INTEGER NOT NULL,
              box_right INTEGER NOT NULL,
              box_bottom INTEGER NOT NULL,
              box_left INTEGER NOT NULL,
              frame_sequence INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_recognitions_label ON recognitions(label);
            "#,
        )?;
        Ok(conn)
    }

    fn insert(&self, results: &[RecognitionResult]) -> Result<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO recognitions \
                 (recognized_at, camera, target, label, distance, box_top, box_right, box_bottom, box_left, frame_sequence) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for result in results {
                let loc = result.location;
                stmt.execute(params![
                    result.timestamp(),
                    result.camera,
                    result.target,
                    result.label,
                    result.distance,
                    loc.top,
                    loc.right,
                    loc.bottom,
                    loc.left,
                    i64::try_from(result.frame_sequence).unwrap_or(i64::MAX),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

impl ResultStore for SqliteResultStore {
    fn flush(&mut self, results: &[RecognitionResult]) -> Result<PathBuf, PipelineError> {
        self.insert(results)
            .map_err(|err| write_failed(&self.path, err))?;
        Ok(self.path.clone())
    }
}
