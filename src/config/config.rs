use std::path::{Path, PathBuf};

use dimse::{DicomNode, DimseConfig, FindQuery, MoveWindow, QueryLevel, StorageSortKey};
use serde::Deserialize;
use thiserror::Error;

use super::LoggingConfig;
use crate::parse::convert::str_to_datetime;
use crate::parse::{DicomTag, DicomTagGroup};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid node '{node}': {reason}")]
    InvalidNode { node: String, reason: String },

    #[error("Invalid date '{0}', expected YYYYMMDD")]
    InvalidDate(String),

    #[error("Invalid find section: {0}")]
    InvalidFind(String),

    #[error("Invalid move window: {0}")]
    InvalidMoveWindow(String),

    #[error("Invalid DIMSE settings: {0}")]
    InvalidDimse(String),

    #[error("Missing [{0}] section")]
    MissingSection(&'static str),
}

/// Nodes taking part in a collection run
#[derive(Debug, Clone, Deserialize)]
pub struct NetConfig {
    /// Calling AE; its port is where the storage SCP listens
    pub local_node: DicomNode,
    /// The archive queried and moved from
    pub called_node: DicomNode,
    /// Move destination, defaults to the local node
    #[serde(default)]
    pub dest_node: Option<DicomNode>,
}

impl NetConfig {
    pub fn dest_node(&self) -> &DicomNode {
        self.dest_node.as_ref().unwrap_or(&self.local_node)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |node: &DicomNode, e: dimse::DimseError| ConfigError::InvalidNode {
            node: node.ae_title.clone(),
            reason: e.to_string(),
        };
        self.local_node
            .validate()
            .map_err(|e| invalid(&self.local_node, e))?;
        self.called_node
            .require_network_info()
            .map_err(|e| invalid(&self.called_node, e))?;

        let dest = self.dest_node();
        dest.validate().map_err(|e| invalid(dest, e))?;
        if !dest.has_port() {
            return Err(ConfigError::InvalidNode {
                node: dest.ae_title.clone(),
                reason: "destination node needs a port to receive on".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FindConfig {
    #[serde(default = "default_query_level")]
    pub query_level: QueryLevel,
    /// Extra return keys on top of Modality, PatientName and StudyDate
    #[serde(default)]
    pub search_fields: Vec<String>,
    pub start_date: String,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub modality: Option<String>,
}

impl FindConfig {
    /// Build the query this section describes
    pub fn query(&self) -> Result<FindQuery, ConfigError> {
        let mut query = FindQuery::new(self.query_level, parse_date(&self.start_date)?)
            .with_fields(self.search_fields.iter().cloned());
        if let Some(end_date) = &self.end_date {
            query = query.with_end_date(parse_date(end_date)?);
        }
        if let Some(modality) = self.modality.as_deref().filter(|m| !m.is_empty()) {
            query = query.with_modality(modality);
        }
        query
            .validate()
            .map_err(|e| ConfigError::InvalidFind(e.to_string()))?;
        Ok(query)
    }
}

fn parse_date(value: &str) -> Result<chrono::NaiveDate, ConfigError> {
    str_to_datetime(value)
        .map(|dt| dt.date())
        .map_err(|_| ConfigError::InvalidDate(value.to_string()))
}

#[derive(Debug, Clone, Deserialize)]
pub struct MoveConfig {
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default = "default_query_level")]
    pub query_level: QueryLevel,
}

impl Default for MoveConfig {
    fn default() -> Self {
        Self {
            start_time: None,
            end_time: None,
            query_level: default_query_level(),
        }
    }
}

impl MoveConfig {
    pub fn window(&self) -> Result<MoveWindow, ConfigError> {
        MoveWindow::parse(self.start_time.as_deref(), self.end_time.as_deref())
            .map_err(|e| ConfigError::InvalidMoveWindow(e.to_string()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// CSV of resources to move, one identifier per row
    #[serde(default)]
    pub resources: Option<PathBuf>,
    /// CSV receiving tag values parsed from stored files
    #[serde(default = "default_resources_meta")]
    pub resources_meta: PathBuf,
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    #[serde(default)]
    pub sort_by: StorageSortKey,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            resources: None,
            resources_meta: default_resources_meta(),
            directory: default_directory(),
            sort_by: StorageSortKey::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub net: NetConfig,
    #[serde(default)]
    pub find: Option<FindConfig>,
    #[serde(default, rename = "move")]
    pub move_config: MoveConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub tags: Vec<DicomTag>,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub dimse: DimseConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.net.validate()?;
        if let Some(find) = &self.find {
            find.query()?;
        }
        self.move_config.window()?;
        self.dimse_config()
            .validate()
            .map_err(|e| ConfigError::InvalidDimse(e.to_string()))?;
        Ok(())
    }

    /// DIMSE settings with the local node as calling AE
    pub fn dimse_config(&self) -> DimseConfig {
        DimseConfig {
            local: self.net.local_node.clone(),
            ..self.dimse.clone()
        }
    }

    pub fn find_query(&self) -> Result<FindQuery, ConfigError> {
        self.find
            .as_ref()
            .ok_or(ConfigError::MissingSection("find"))?
            .query()
    }

    pub fn tag_group(&self) -> DicomTagGroup {
        DicomTagGroup::new(self.tags.clone())
    }
}

fn default_query_level() -> QueryLevel {
    QueryLevel::Study
}

fn default_resources_meta() -> PathBuf {
    PathBuf::from("resources_meta.csv")
}

fn default_directory() -> PathBuf {
    PathBuf::from("dicom")
}
