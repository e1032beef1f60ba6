//! Bulk File Processor and its ready-made sinks

pub mod base_parser;
pub mod sinks;

use std::path::PathBuf;

use thiserror::Error;

pub use base_parser::{parse_dir, ParseSummary};
pub use sinks::{
    parse_dir_to_csv, parse_dir_to_json, parse_dir_to_store, parse_dir_to_table, IngestSummary,
    Table,
};

/// Errors that stop a bulk run before or after the workers ran
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Thread count must be at least 1, got {0}")]
    InvalidThreadCount(usize),

    #[error("Source path does not exist: {0}")]
    SourceNotFound(PathBuf),

    #[error("CSV output error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON output error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
