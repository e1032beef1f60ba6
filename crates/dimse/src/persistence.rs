//! Persistence adapter boundary
//!
//! The engine records found studies and received images through
//! [`PersistenceAdapter`]. Duplicate keys are an outcome, never an error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, NaiveDate, Utc};
use dicom_dictionary_std::tags;
use dicom_object::{InMemDicomObject, OpenFileOptions};
use serde::{Deserialize, Serialize};

use crate::types::{element_str, FindResult};
use crate::{DimseError, Result};

/// Outcome of an insert keyed on a unique identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    Inserted,
    Duplicate,
}

/// Outcome of marking a found study as retrieved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retrieval {
    /// `retrieved_on` was set now
    Marked,
    /// The study was already marked earlier
    AlreadyRetrieved,
    /// No found study with that UID
    NotFound,
}

/// A study discovered by C-FIND, keyed by StudyInstanceUID
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundStudy {
    pub study_uid: String,
    pub patient_name: Option<String>,
    pub patient_id: Option<String>,
    pub study_date: Option<NaiveDate>,
    pub accession_number: Option<String>,
    pub found_on: DateTime<Utc>,
    pub retrieved_on: Option<DateTime<Utc>>,
}

impl FoundStudy {
    pub fn new(study_uid: impl Into<String>) -> Self {
        Self {
            study_uid: study_uid.into(),
            patient_name: None,
            patient_id: None,
            study_date: None,
            accession_number: None,
            found_on: Utc::now(),
            retrieved_on: None,
        }
    }

    /// Build from a C-FIND record; `None` when it has no StudyInstanceUID
    pub fn from_find_result(result: &FindResult) -> Option<Self> {
        let study_uid = result.get("StudyInstanceUID").filter(|v| !v.is_empty())?;
        let text = |name: &str| result.get(name).filter(|v| !v.is_empty()).map(str::to_string);
        Some(Self {
            patient_name: text("PatientName"),
            patient_id: text("PatientID"),
            study_date: result.get("StudyDate").and_then(parse_da),
            accession_number: text("AccessionNumber"),
            ..Self::new(study_uid)
        })
    }
}

/// A stored image, keyed by SOPInstanceUID
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub sop_uid: String,
    pub sop_class_uid: Option<String>,
    pub series_uid: Option<String>,
    pub study_uid: Option<String>,
    pub patient_id: Option<String>,
    pub study_date: Option<NaiveDate>,
    pub modality: Option<String>,
    pub manufacturer: Option<String>,
    pub institution: Option<String>,
    pub filepath: Option<PathBuf>,
    pub received_on: DateTime<Utc>,
}

impl ImageRecord {
    /// Build from a dataset; fails when it has no SOPInstanceUID
    pub fn from_dataset(
        obj: &InMemDicomObject,
        institution: Option<&str>,
        filepath: Option<&Path>,
    ) -> Result<Self> {
        let text = |tag| element_str(obj, tag).filter(|v| !v.is_empty());
        let sop_uid = text(tags::SOP_INSTANCE_UID)
            .ok_or_else(|| DimseError::Decode("dataset has no SOPInstanceUID".into()))?;
        Ok(Self {
            sop_uid,
            sop_class_uid: text(tags::SOP_CLASS_UID),
            series_uid: text(tags::SERIES_INSTANCE_UID),
            study_uid: text(tags::STUDY_INSTANCE_UID),
            patient_id: text(tags::PATIENT_ID),
            study_date: text(tags::STUDY_DATE).as_deref().and_then(parse_da),
            modality: text(tags::MODALITY),
            manufacturer: text(tags::MANUFACTURER),
            institution: institution
                .map(str::to_string)
                .or_else(|| text(tags::INSTITUTION_NAME)),
            filepath: filepath.map(Path::to_path_buf),
            received_on: Utc::now(),
        })
    }

    /// Read the header of a DICOM file and build a record for it
    pub fn from_path(path: &Path, institution: Option<&str>) -> Result<Self> {
        let obj = OpenFileOptions::new()
            .read_until(tags::PIXEL_DATA)
            .open_file(path)
            .map_err(|e| DimseError::Decode(format!("{}: {}", path.display(), e)))?;
        Self::from_dataset(&obj, institution, Some(path))
    }
}

fn parse_da(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y%m%d").ok()
}

/// Store for found studies and received images.
///
/// Implementations are shared between concurrent reception handlers and
/// must be safe for concurrent use.
pub trait PersistenceAdapter: Send + Sync {
    /// Record a study found by C-FIND
    fn add_found_study(&self, study: &FoundStudy) -> Result<Insert>;

    /// Record a stored image
    fn add_image(&self, image: &ImageRecord) -> Result<Insert>;

    /// Mark a found study as retrieved
    fn update_retrieved_study(&self, study_uid: &str) -> Result<Retrieval>;

    /// StudyInstanceUIDs found but not yet retrieved
    fn studies_pending_move(&self) -> Result<Vec<String>>;
}

/// In-memory adapter for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    studies: Mutex<HashMap<String, FoundStudy>>,
    images: Mutex<HashMap<String, ImageRecord>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn image_count(&self) -> usize {
        self.images.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn study(&self, study_uid: &str) -> Option<FoundStudy> {
        self.studies.lock().ok()?.get(study_uid).cloned()
    }
}

fn poisoned<T>(_: T) -> DimseError {
    DimseError::Persistence("in-memory store lock poisoned".into())
}

impl PersistenceAdapter for MemoryPersistence {
    fn add_found_study(&self, study: &FoundStudy) -> Result<Insert> {
        let mut studies = self.studies.lock().map_err(poisoned)?;
        if studies.contains_key(&study.study_uid) {
            return Ok(Insert::Duplicate);
        }
        studies.insert(study.study_uid.clone(), study.clone());
        Ok(Insert::Inserted)
    }

    fn add_image(&self, image: &ImageRecord) -> Result<Insert> {
        let mut images = self.images.lock().map_err(poisoned)?;
        if images.contains_key(&image.sop_uid) {
            return Ok(Insert::Duplicate);
        }
        images.insert(image.sop_uid.clone(), image.clone());
        Ok(Insert::Inserted)
    }

    fn update_retrieved_study(&self, study_uid: &str) -> Result<Retrieval> {
        let mut studies = self.studies.lock().map_err(poisoned)?;
        Ok(match studies.get_mut(study_uid) {
            None => Retrieval::NotFound,
            Some(study) if study.retrieved_on.is_some() => Retrieval::AlreadyRetrieved,
            Some(study) => {
                study.retrieved_on = Some(Utc::now());
                Retrieval::Marked
            }
        })
    }

    fn studies_pending_move(&self) -> Result<Vec<String>> {
        let studies = self.studies.lock().map_err(poisoned)?;
        let mut pending: Vec<String> = studies
            .values()
            .filter(|s| s.retrieved_on.is_none())
            .map(|s| s.study_uid.clone())
            .collect();
        pending.sort();
        Ok(pending)
    }
}
