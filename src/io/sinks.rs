//! Ready-made consumers of [`parse_dir`]

use std::io::Write;
use std::path::Path;

use chrono::Local;
use dimse::{ImageRecord, Insert, PersistenceAdapter};
use serde::Serialize;
use tracing::{info, warn};

use super::base_parser::{parse_dir, ParseSummary};
use super::ParseError;
use crate::parse::{DicomTagGroup, TagRecord, TagValue, PATH_COLUMN};

fn columns(group: &DicomTagGroup, include_path: bool) -> Vec<String> {
    let mut columns = group.aliases();
    if include_path {
        columns.push(PATH_COLUMN.to_string());
    }
    columns
}

fn extract_with<'a>(
    group: &'a DicomTagGroup,
    include_path: bool,
) -> impl Fn(&Path) -> Result<TagRecord, dicom_object::ReadError> + Sync + 'a {
    move |path| {
        let mut record = group.parse_file(path)?;
        if include_path {
            record.insert(
                PATH_COLUMN.to_string(),
                Some(TagValue::Text(path.display().to_string())),
            );
        }
        Ok(record)
    }
}

fn row(record: &TagRecord, columns: &[String]) -> Vec<Option<TagValue>> {
    columns
        .iter()
        .map(|c| record.get(c).cloned().flatten())
        .collect()
}

/// Parse `src` and write one CSV row per file.
///
/// The header is the group's aliases, plus `dicom_path` when
/// `include_path` is set. Datetimes are written as `YYYY-MM-DD HH:MM:SS`.
pub fn parse_dir_to_csv<W: Write + Send>(
    src: &Path,
    group: &DicomTagGroup,
    writer: W,
    threads: usize,
    include_path: bool,
) -> Result<ParseSummary, ParseError> {
    let columns = columns(group, include_path);
    let mut writer = csv::Writer::from_writer(writer);
    writer.write_record(&columns)?;

    let mut write_error = None;
    let summary = parse_dir(src, threads, extract_with(group, include_path), |record| {
        if write_error.is_some() {
            return;
        }
        let fields = row(&record, &columns)
            .into_iter()
            .map(|v| v.map(|v| v.to_string()).unwrap_or_default());
        if let Err(e) = writer.write_record(fields) {
            write_error = Some(e);
        }
    })?;

    if let Some(e) = write_error {
        return Err(e.into());
    }
    writer.flush()?;
    Ok(summary)
}

#[derive(Serialize)]
struct JsonDocument<'a> {
    dicom_tags: &'a [TagRecord],
}

/// Parse `src` and write `{"dicom_tags": [...]}` once every file is done
pub fn parse_dir_to_json<W: Write>(
    src: &Path,
    group: &DicomTagGroup,
    writer: W,
    threads: usize,
    include_path: bool,
) -> Result<ParseSummary, ParseError> {
    let mut records = Vec::new();
    let summary = parse_dir(src, threads, extract_with(group, include_path), |record| {
        records.push(record)
    })?;
    serde_json::to_writer_pretty(writer, &JsonDocument { dicom_tags: &records })?;
    Ok(summary)
}

/// Parsed values held in memory, one row per file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<TagValue>>>,
}

impl Table {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Values of one column, in row order
    pub fn column(&self, name: &str) -> Option<Vec<Option<&TagValue>>> {
        let index = self.columns.iter().position(|c| c == name)?;
        Some(self.rows.iter().map(|row| row[index].as_ref()).collect())
    }

    /// Convert to a polars frame with one string column per alias
    #[cfg(feature = "dataframe")]
    pub fn to_dataframe(&self) -> polars::prelude::PolarsResult<polars::prelude::DataFrame> {
        use polars::prelude::{Column, DataFrame, IntoColumn, NamedFrom, Series};

        let columns: Vec<Column> = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let values: Vec<Option<String>> = self
                    .rows
                    .iter()
                    .map(|row| row[i].as_ref().map(|v| v.to_string()))
                    .collect();
                Series::new(name.as_str().into(), values).into_column()
            })
            .collect();
        DataFrame::new(columns)
    }
}

/// Parse `src` into an in-memory [`Table`]
pub fn parse_dir_to_table(
    src: &Path,
    group: &DicomTagGroup,
    threads: usize,
    include_path: bool,
) -> Result<Table, ParseError> {
    let columns = columns(group, include_path);
    let mut rows = Vec::new();
    parse_dir(src, threads, extract_with(group, include_path), |record| {
        rows.push(row(&record, &columns))
    })?;
    Ok(Table { columns, rows })
}

/// Outcome of indexing a directory into a persistence adapter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub parse: ParseSummary,
    pub inserted: usize,
    pub duplicates: usize,
    /// Records the adapter failed to store
    pub rejected: usize,
}

/// Record an [`ImageRecord`] for every DICOM file under `src`.
///
/// Without an institution the images are filed under `unknown_YYYYMMDD`.
pub fn parse_dir_to_store(
    src: &Path,
    store: &dyn PersistenceAdapter,
    institution: Option<&str>,
    threads: usize,
) -> Result<IngestSummary, ParseError> {
    let institution = institution
        .map(str::to_string)
        .unwrap_or_else(|| format!("unknown_{}", Local::now().format("%Y%m%d")));

    let mut summary = IngestSummary::default();
    let (mut inserted, mut duplicates, mut rejected) = (0, 0, 0);
    summary.parse = parse_dir(
        src,
        threads,
        |path: &Path| ImageRecord::from_path(path, Some(institution.as_str())),
        |record| match store.add_image(&record) {
            Ok(Insert::Inserted) => inserted += 1,
            Ok(Insert::Duplicate) => duplicates += 1,
            Err(e) => {
                warn!(sop_uid = %record.sop_uid, "Could not record image: {}", e);
                rejected += 1;
            }
        },
    )?;
    summary.inserted = inserted;
    summary.duplicates = duplicates;
    summary.rejected = rejected;

    info!(
        institution = %institution,
        inserted, duplicates, rejected,
        "Indexed {}",
        src.display()
    );
    Ok(summary)
}
