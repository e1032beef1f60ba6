use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::db::PersistenceError;
use crate::io::ParseError;

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error for the collection workflows
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Dimse(#[from] dimse::DimseError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{path} has no {column} column")]
    MissingColumn {
        path: PathBuf,
        column: &'static str,
    },
}
