//! Workflows that chain the network engines with files and the store

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use dimse::{
    DicomNode, DimseScu, FindQuery, FindResult, FoundStudy, Insert, MoveRequest, MoveWindow,
    PersistenceAdapter, QueryLevel, StorageOptions,
};
use futures_util::{pin_mut, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Fields a found study is built from, added to every stored query
const STUDY_KEYS: [&str; 3] = ["StudyInstanceUID", "PatientID", "AccessionNumber"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FindSummary {
    pub matches: usize,
    /// Shards whose query failed; their matches are missing
    pub failed_shards: usize,
    pub inserted: usize,
    pub duplicates: usize,
}

/// CSV sink for C-FIND records. The header is written on creation.
pub struct FindCsvWriter<W: Write> {
    columns: Vec<String>,
    writer: csv::Writer<W>,
}

impl<W: Write> FindCsvWriter<W> {
    pub fn new(columns: Vec<String>, writer: W) -> Result<Self> {
        let mut writer = csv::Writer::from_writer(writer);
        writer.write_record(&columns)?;
        Ok(Self { columns, writer })
    }

    /// Write one row; fields the record lacks are left empty
    pub fn write(&mut self, result: &FindResult) -> Result<()> {
        self.writer
            .write_record(self.columns.iter().map(|c| result.get(c).unwrap_or_default()))?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Run `query` and write one CSV row per match.
///
/// The header is the query's column names. Failed shards are logged and
/// counted, the scan carries on.
pub async fn find_to_csv<W: Write>(
    scu: &DimseScu,
    node: &DicomNode,
    query: FindQuery,
    writer: W,
) -> Result<FindSummary> {
    let mut sink = FindCsvWriter::new(query.column_names()?, writer)?;

    let mut summary = FindSummary::default();
    let stream = scu.find(node, query).await?;
    pin_mut!(stream);
    while let Some(item) = stream.next().await {
        match item {
            Ok(result) => {
                sink.write(&result)?;
                summary.matches += 1;
            }
            Err(e) => {
                warn!("{}", e);
                summary.failed_shards += 1;
            }
        }
    }
    sink.finish()?;

    info!(
        matches = summary.matches,
        failed_shards = summary.failed_shards,
        "C-FIND written to CSV"
    );
    Ok(summary)
}

/// Run `query` and record every study found in `store`
pub async fn find_to_store(
    scu: &DimseScu,
    node: &DicomNode,
    query: FindQuery,
    store: &dyn PersistenceAdapter,
) -> Result<FindSummary> {
    let query = query.with_fields(STUDY_KEYS);
    let mut summary = FindSummary::default();

    let stream = scu.find(node, query).await?;
    pin_mut!(stream);
    while let Some(item) = stream.next().await {
        let result = match item {
            Ok(result) => result,
            Err(e) => {
                warn!("{}", e);
                summary.failed_shards += 1;
                continue;
            }
        };
        summary.matches += 1;
        let Some(study) = FoundStudy::from_find_result(&result) else {
            debug!("Match without StudyInstanceUID skipped");
            continue;
        };
        match store.add_found_study(&study)? {
            Insert::Inserted => summary.inserted += 1,
            Insert::Duplicate => summary.duplicates += 1,
        }
    }

    info!(
        matches = summary.matches,
        inserted = summary.inserted,
        duplicates = summary.duplicates,
        failed_shards = summary.failed_shards,
        "C-FIND recorded"
    );
    Ok(summary)
}

/// Identifiers to move at `level`, read from a CSV with a header row.
///
/// The column is `PatientID` or `StudyInstanceUID`. Blank cells and
/// repeats are dropped; first-seen order is kept.
pub fn read_resources(csv_path: &Path, level: QueryLevel) -> Result<Vec<String>> {
    let column = match level {
        QueryLevel::Patient => "PatientID",
        QueryLevel::Study => "StudyInstanceUID",
    };
    let mut reader = csv::Reader::from_path(csv_path)?;
    let index = reader
        .headers()?
        .iter()
        .position(|h| h.trim() == column)
        .ok_or_else(|| Error::MissingColumn {
            path: csv_path.to_path_buf(),
            column,
        })?;

    let mut identifiers: Vec<String> = Vec::new();
    for record in reader.records() {
        let record = record?;
        let Some(value) = record.get(index).map(str::trim).filter(|v| !v.is_empty()) else {
            continue;
        };
        if !identifiers.iter().any(|id| id == value) {
            identifiers.push(value.to_string());
        }
    }
    Ok(identifiers)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MoveSummary {
    pub requested: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Run a move batch to completion, tallying final statuses
pub async fn move_identifiers(
    scu: &DimseScu,
    node: &DicomNode,
    request: MoveRequest,
) -> Result<MoveSummary> {
    let mut summary = MoveSummary {
        requested: request.identifiers.len(),
        ..MoveSummary::default()
    };

    let stream = scu.move_resources(node, request).await?;
    pin_mut!(stream);
    while let Some(outcome) = stream.next().await {
        if outcome.is_pending() {
            debug!(
                identifier = %outcome.identifier,
                remaining = ?outcome.sub_operations.remaining,
                completed = ?outcome.sub_operations.completed,
                "C-MOVE in progress"
            );
        } else if outcome.is_success() {
            summary.succeeded += 1;
        } else {
            warn!(
                identifier = %outcome.identifier,
                status = outcome.status,
                "C-MOVE did not succeed"
            );
            summary.failed += 1;
        }
    }

    info!(
        requested = summary.requested,
        succeeded = summary.succeeded,
        failed = summary.failed,
        "C-MOVE batch finished"
    );
    Ok(summary)
}

/// Move every study `store` reports as found but not yet retrieved.
///
/// The store is attached to the receiving SCP, so each study is marked
/// retrieved as its images arrive.
pub async fn move_pending_studies(
    scu: &DimseScu,
    node: &DicomNode,
    store: Arc<dyn PersistenceAdapter>,
    storage: StorageOptions,
    window: MoveWindow,
    destination: Option<DicomNode>,
) -> Result<MoveSummary> {
    let pending = store.studies_pending_move()?;
    if pending.is_empty() {
        info!("No studies pending retrieval");
        return Ok(MoveSummary::default());
    }

    let mut request = MoveRequest::new(QueryLevel::Study, pending, storage.with_persistence(store))
        .with_window(window);
    if let Some(destination) = destination {
        request = request.with_destination(destination);
    }
    move_identifiers(scu, node, request).await
}
